//! Planner shape checks: insert grouping by null bitmap, bulk promotion,
//! update diffs, and the cross-backend refusal.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use relata::backend::memory::MemoryBackend;
use relata::exec::StepKind;
use relata::nodes::{NodeArena, build};
use relata::plan::{PlannerOpts, StmtAction, plan_node};
use relata::schema::TableDef;
use relata::shard::beacon::SingleBeacon;
use relata::shard::{CredentialHandle, Shard, ShardAccess, ShardId};
use relata::value::TypedSlot;
use relata::xact::{Xact, XactMode};

#[tokio::test]
async fn test_insert_groups_share_bitmap_and_exclude_null_columns() {
    let fx = common::single_shard("plan-groups");
    let xact = Xact::begin(fx.ctx.clone(), XactMode::Deferred).unwrap();
    let tdv = fx.orders.leading();
    let name = tdv.field_by_name("name").unwrap();
    let id = tdv.field_by_name("id").unwrap();

    // Two tuples with only name set, one with both.
    let mut htps = Vec::new();
    for i in 0..3 {
        let htp = xact.create_tuple(&fx.orders).unwrap();
        let buffer = fx.ctx.heap().buffer_of(htp).unwrap();
        buffer
            .with_tuple_mut(htp, |t, scope| {
                t.set(name, &TypedSlot::string(format!("n{i}")), scope)?;
                if i == 2 {
                    t.set(id, &TypedSlot::int64(99), scope)?;
                }
                Ok(())
            })
            .unwrap();
        htps.push(htp);
    }

    let mut arena = NodeArena::new();
    let insert = build::insert(&mut arena, "orders", htps);
    let plan = plan_node(
        &fx.ctx,
        &arena,
        insert,
        PlannerOpts {
            hbno: Some(xact.buffer()),
            ..PlannerOpts::default()
        },
    )
    .unwrap();

    let leaves = plan.root.leaves();
    assert_eq!(leaves.len(), 2, "two bitmaps, two insert groups");

    for leaf in &leaves {
        let stmt = leaf.stmt().unwrap();
        let binding = leaf.binding().unwrap();

        // Every tuple in the group shares one bitmap...
        let bitmaps: Vec<Vec<u8>> = binding
            .tuples
            .iter()
            .map(|htp| {
                let buffer = fx.ctx.heap().buffer_of(*htp).unwrap();
                buffer
                    .with_tuple(*htp, |t| Ok(t.null_bitmap().to_vec()))
                    .unwrap()
            })
            .collect();
        assert!(bitmaps.windows(2).all(|w| w[0] == w[1]));

        // ...the target list excludes every null column, and the null
        // columns come back via RETURNING.
        for field in tdv.fields() {
            let null = bitmaps[0][field.null_ordinal as usize / 8]
                & (1 << (field.null_ordinal as usize % 8))
                != 0;
            assert_eq!(stmt.columns.contains(&field.name), !null);
            assert_eq!(stmt.returning.contains(&field.name), null);
        }
    }
}

#[tokio::test]
async fn test_bulk_promotion_past_four_rows() {
    let fx = common::single_shard("plan-bulk");
    let xact = Xact::begin(fx.ctx.clone(), XactMode::Deferred).unwrap();
    let tdv = fx.orders.leading();
    let name = tdv.field_by_name("name").unwrap();

    let mut htps = Vec::new();
    for i in 0..6 {
        let htp = xact.create_tuple(&fx.orders).unwrap();
        fx.ctx
            .heap()
            .buffer_of(htp)
            .unwrap()
            .with_tuple_mut(htp, |t, scope| {
                t.set(name, &TypedSlot::string(format!("n{i}")), scope)
            })
            .unwrap();
        htps.push(htp);
    }

    let mut arena = NodeArena::new();
    let insert = build::insert(&mut arena, "orders", htps);
    let plan = plan_node(
        &fx.ctx,
        &arena,
        insert,
        PlannerOpts {
            hbno: Some(xact.buffer()),
            ..PlannerOpts::default()
        },
    )
    .unwrap();

    let leaves = plan.root.leaves();
    assert_eq!(leaves.len(), 1);
    assert!(matches!(
        leaves[0].stmt().unwrap().action,
        StmtAction::Insert { bulk: true }
    ));
    assert_eq!(leaves[0].stmt().unwrap().rows, 6);
}

#[tokio::test]
async fn test_update_plans_only_changed_fields() {
    let fx = common::single_shard("plan-diff");
    let mut xact = Xact::begin(fx.ctx.clone(), XactMode::Immediate).unwrap();
    let tdv = fx.orders.leading();
    let name = tdv.field_by_name("name").unwrap();

    let htp = xact.create_tuple(&fx.orders).unwrap();
    let buffer = fx.ctx.heap().buffer_of(htp).unwrap();
    buffer
        .with_tuple_mut(htp, |t, scope| t.set(name, &TypedSlot::string("v1"), scope))
        .unwrap();
    let mut arena = NodeArena::new();
    let insert = build::insert(&mut arena, "orders", vec![htp]);
    xact.submit(&arena, insert).await.unwrap();

    // Flush re-baselined the shadow; change one field.
    buffer
        .with_tuple_mut(htp, |t, scope| t.set(name, &TypedSlot::string("v2"), scope))
        .unwrap();

    let mut update_arena = NodeArena::new();
    let update = build::update(&mut update_arena, "orders", vec![htp]);
    let plan = plan_node(
        &fx.ctx,
        &update_arena,
        update,
        PlannerOpts {
            hbno: Some(xact.buffer()),
            ..PlannerOpts::default()
        },
    );

    // The diff names exactly the changed non-key column.
    let plan = plan.unwrap();
    let leaves = plan.root.leaves();
    let stmt = leaves[0].stmt().unwrap();
    assert_eq!(stmt.columns, vec!["name".to_string()]);
    assert_eq!(stmt.key_columns, vec!["id".to_string()]);
}

#[tokio::test]
async fn test_cross_backend_select_refused() {
    let ctx = relata::Context::start().unwrap();
    let be_a = MemoryBackend::shared("plan-a");
    let be_b = MemoryBackend::shared("plan-b");
    ctx.register_backend(Arc::clone(&be_a) as _).unwrap();
    ctx.register_backend(Arc::clone(&be_b) as _).unwrap();

    let mk_shard = |backend: &Arc<MemoryBackend>, name: &str| {
        let cred = CredentialHandle::plaintext("u", "p", "h", 0).unwrap();
        Shard::new(
            ShardId::from_name(name),
            ShardAccess::with_database(Arc::clone(backend) as _, cred, name),
            None,
        )
    };
    let shard_a = mk_shard(&be_a, "a");
    let shard_b = mk_shard(&be_b, "b");

    let left = ctx
        .add_table(TableDef::build("left").field("k", &relata::types::builtin::int32()))
        .unwrap();
    let right = ctx
        .add_table(TableDef::build("right").field("k", &relata::types::builtin::int32()))
        .unwrap();
    left.set_beacon(SingleBeacon::new(shard_a));
    right.set_beacon(SingleBeacon::new(shard_b));

    let mut arena = NodeArena::new();
    let select = build::select(&mut arena, "left");
    let join = build::join(&mut arena, select, "right");
    let lhs = build::field(&mut arena, Some("left"), "k");
    let rhs = build::field(&mut arena, Some("right"), "k");
    build::qual(&mut arena, join, "=", lhs, rhs);

    let err = plan_node(&ctx, &arena, select, PlannerOpts::default()).unwrap_err();
    assert!(err.to_string().contains("cross-beacon"));
}

#[tokio::test]
async fn test_single_shard_select_is_one_fetch() {
    let fx = common::single_shard("plan-single");
    let mut arena = NodeArena::new();
    let select = build::select(&mut arena, "orders");

    let plan = plan_node(&fx.ctx, &arena, select, PlannerOpts::default()).unwrap();
    assert!(matches!(plan.root.kind, StepKind::Fetch { .. }));
    assert!(plan.root.children.is_empty());
    assert_eq!(plan.shards.len(), 1);
    assert!(!plan.write);
}
