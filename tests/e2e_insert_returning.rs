//! Single-shard insert with RETURNING: a tuple inserted with a null key
//! gets the backend's default flowing back onto the same tuple pointer.

mod common;

use pretty_assertions::assert_eq;
use relata::nodes::{NodeArena, build};
use relata::value::TypedSlot;
use relata::xact::{Xact, XactMode};

#[tokio::test]
async fn test_insert_returns_generated_key() {
    let fx = common::single_shard("s1-insert");
    let mut xact = Xact::begin(fx.ctx.clone(), XactMode::Immediate).unwrap();

    // name = "a", id left null.
    let htp = xact.create_tuple(&fx.orders).unwrap();
    let tdv = fx.orders.leading();
    let name = tdv.field_by_name("name").unwrap();
    let buffer = fx.ctx.heap().buffer_of(htp).unwrap();
    buffer
        .with_tuple_mut(htp, |t, scope| t.set(name, &TypedSlot::string("a"), scope))
        .unwrap();

    let mut arena = NodeArena::new();
    let insert = build::insert(&mut arena, "orders", vec![htp]);
    xact.submit(&arena, insert).await.unwrap();

    // Immediate mode flushed the insert; the default key is already back.
    let id = tdv.field_by_name("id").unwrap();
    let (id_val, name_val) = buffer
        .with_tuple(htp, |t| Ok((t.get(id)?, t.get(name)?)))
        .unwrap();
    assert!(!id_val.is_null(), "RETURNING must fill the null key column");
    assert_eq!(id_val.as_i64(), Some(1));
    assert_eq!(name_val.as_str(), Some("a"));

    let outcome = xact.commit().await.unwrap();
    assert!(outcome.is_clean());
    assert_eq!(outcome.savepoints.len(), 1);
    assert!(outcome.savepoints[0].flushed);
    assert!(outcome.savepoints[0].committed);

    // The backend holds exactly the committed row.
    let rows = fx.backend.store().rows("main", "orders");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0].as_i64(), Some(1));
    assert_eq!(rows[0][1].as_str(), Some("a"));
}

#[tokio::test]
async fn test_insert_with_key_has_no_returning() {
    let fx = common::single_shard("s1-insert-full");
    let mut xact = Xact::begin(fx.ctx.clone(), XactMode::Immediate).unwrap();

    let htp = xact.create_tuple(&fx.orders).unwrap();
    let tdv = fx.orders.leading();
    let buffer = fx.ctx.heap().buffer_of(htp).unwrap();
    buffer
        .with_tuple_mut(htp, |t, scope| {
            t.set(tdv.field_by_name("id").unwrap(), &TypedSlot::int64(42), scope)?;
            t.set(tdv.field_by_name("name").unwrap(), &TypedSlot::string("b"), scope)
        })
        .unwrap();

    let mut arena = NodeArena::new();
    let insert = build::insert(&mut arena, "orders", vec![htp]);
    xact.submit(&arena, insert).await.unwrap();
    xact.commit().await.unwrap();

    let rows = fx.backend.store().rows("main", "orders");
    assert_eq!(rows.len(), 1);
    // The caller's key survives; no serial was drawn.
    assert_eq!(rows[0][0].as_i64(), Some(42));
}
