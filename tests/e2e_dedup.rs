//! Deduplicated select over a many-to-many join: ten joined rows collapse
//! to three distinct left-relation tuple pointers.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use relata::backend::memory::MemoryBackend;
use relata::nodes::{NodeArena, build};
use relata::plan::PlannerOpts;
use relata::schema::TableDef;
use relata::shard::beacon::SingleBeacon;
use relata::shard::{CredentialHandle, Shard, ShardAccess, ShardId};
use relata::types::builtin;
use relata::types::stack::TypeStack;
use relata::value::TypedSlot;
use relata::Context;

#[tokio::test]
async fn test_join_dedup_left_relation() {
    let ctx = Context::start().unwrap();
    let backend = MemoryBackend::shared("s2-dedup");
    ctx.register_backend(Arc::clone(&backend) as _).unwrap();

    let cred = CredentialHandle::plaintext("app", "secret", "localhost", 0).unwrap();
    let access = ShardAccess::with_database(Arc::clone(&backend) as _, cred, "main");
    let shard = Shard::new(ShardId::from_name("main"), access, None);

    let groups = ctx
        .add_table(
            TableDef::build("groups")
                .field("k", &builtin::int32())
                .field("title", &builtin::string())
                .primary_key(&["k"]),
        )
        .unwrap();
    let members = ctx
        .add_table(
            TableDef::build("members")
                .field("k", &builtin::int32())
                .field("who", &builtin::string()),
        )
        .unwrap();
    groups.set_beacon(SingleBeacon::new(Arc::clone(&shard)));
    members.set_beacon(SingleBeacon::new(Arc::clone(&shard)));

    let int32 = TypeStack::scalar(builtin::int32());
    let string = TypeStack::scalar(builtin::string());
    backend
        .store()
        .seed_table("main", "groups", &[("k", int32.clone()), ("title", string.clone())]);
    backend
        .store()
        .seed_table("main", "members", &[("k", int32), ("who", string)]);

    // Three groups; ten members spread across them.
    for (k, title) in [(1, "red"), (2, "green"), (3, "blue")] {
        backend.store().seed_row(
            "main",
            "groups",
            vec![TypedSlot::int32(k), TypedSlot::string(title)],
        );
    }
    let memberships = [1, 1, 1, 1, 2, 2, 2, 3, 3, 3];
    for (i, k) in memberships.iter().enumerate() {
        backend.store().seed_row(
            "main",
            "members",
            vec![TypedSlot::int32(*k), TypedSlot::string(format!("m{i}"))],
        );
    }

    // SELECT ... FROM groups JOIN members ON groups.k = members.k,
    // deduplicating the groups relation.
    let mut arena = NodeArena::new();
    let select = build::select(&mut arena, "groups");
    let join = build::join(&mut arena, select, "members");
    let lhs = build::field(&mut arena, Some("groups"), "k");
    let rhs = build::field(&mut arena, Some("members"), "k");
    build::qual(&mut arena, join, "=", lhs, rhs);

    let result = ctx
        .execute(
            &arena,
            select,
            PlannerOpts {
                dedup: vec!["groups".to_string()],
                ..PlannerOpts::default()
            },
        )
        .await
        .unwrap();

    // Every joined row survives...
    assert_eq!(result.rows.len(), 10);
    assert_eq!(result.rows.rtups(), 2);

    // ...but the left side carries exactly three distinct pointers.
    let mut left = result.rows.column(0);
    left.sort_by_key(|htp| htp.0);
    left.dedup();
    assert_eq!(left.len(), 3, "left relation must deduplicate to 3 tuples");

    // And those three pointers really are the three groups.
    let tdv = groups.leading();
    let k_field = tdv.field_by_name("k").unwrap();
    let mut keys: Vec<i64> = left
        .iter()
        .map(|htp| {
            let buffer = ctx.heap().buffer_of(*htp).unwrap();
            buffer
                .with_tuple(*htp, |t| Ok(t.get(k_field)?.as_i64().unwrap()))
                .unwrap()
        })
        .collect();
    keys.sort_unstable();
    assert_eq!(keys, vec![1, 2, 3]);
}
