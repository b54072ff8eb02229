//! Shared fixtures for the end-to-end tests: a context wired to the
//! in-memory backend, with single-shard and fanout topologies.

#![allow(dead_code)]

use std::sync::Arc;

use relata::backend::memory::MemoryBackend;
use relata::schema::TableDef;
use relata::shard::beacon::{FanoutBeacon, SingleBeacon};
use relata::shard::{CredentialHandle, Shard, ShardAccess, ShardId};
use relata::types::builtin;
use relata::types::stack::TypeStack;
use relata::Context;

pub struct SingleShard {
    pub ctx: Arc<Context>,
    pub backend: Arc<MemoryBackend>,
    pub shard: Arc<Shard>,
    pub orders: Arc<TableDef>,
}

/// One shard on one in-memory backend, with an `orders (id int64 pk,
/// name string)` table routed by a single beacon.
pub fn single_shard(name: &str) -> SingleShard {
    let ctx = Context::start().expect("context");
    let backend = MemoryBackend::shared(name);
    ctx.register_backend(Arc::clone(&backend) as _).expect("backend");

    let cred = CredentialHandle::plaintext("app", "secret", "localhost", 0).expect("cred");
    let access = ShardAccess::with_database(Arc::clone(&backend) as _, cred, "main");
    let shard = Shard::new(ShardId::from_name("main"), access, None);

    let orders = ctx
        .add_table(
            TableDef::build("orders")
                .field("id", &builtin::int64())
                .field("name", &builtin::string())
                .primary_key(&["id"]),
        )
        .expect("orders");
    orders.set_beacon(SingleBeacon::new(Arc::clone(&shard)));

    backend.store().seed_table(
        "main",
        "orders",
        &[
            ("id", TypeStack::scalar(builtin::int64())),
            ("name", TypeStack::scalar(builtin::string())),
        ],
    );

    SingleShard {
        ctx,
        backend,
        shard,
        orders,
    }
}

pub struct Fanout {
    pub ctx: Arc<Context>,
    pub backend: Arc<MemoryBackend>,
    pub shards: Vec<Arc<Shard>>,
    pub events: Arc<TableDef>,
}

/// Three shards on one backend (databases `s0`..`s2`), all holding an
/// `events (seq int64 pk, label string)` table behind one fanout beacon.
pub fn fanout_three(name: &str) -> Fanout {
    let ctx = Context::start().expect("context");
    let backend = MemoryBackend::shared(name);
    ctx.register_backend(Arc::clone(&backend) as _).expect("backend");

    let shards: Vec<Arc<Shard>> = (0..3)
        .map(|i| {
            let cred =
                CredentialHandle::plaintext("app", "secret", "localhost", 0).expect("cred");
            let access = ShardAccess::with_database(
                Arc::clone(&backend) as _,
                cred,
                format!("s{i}"),
            );
            Shard::new(ShardId::from_name(&format!("s{i}")), access, None)
        })
        .collect();

    let events = ctx
        .add_table(
            TableDef::build("events")
                .field("seq", &builtin::int64())
                .field("label", &builtin::string())
                .primary_key(&["seq"]),
        )
        .expect("events");
    events.set_beacon(FanoutBeacon::new(shards.clone()).expect("beacon"));

    for i in 0..3 {
        backend.store().seed_table(
            &format!("s{i}"),
            "events",
            &[
                ("seq", TypeStack::scalar(builtin::int64())),
                ("label", TypeStack::scalar(builtin::string())),
            ],
        );
    }

    Fanout {
        ctx,
        backend,
        shards,
        events,
    }
}
