//! Late-binding raw queries: a table that starts with zero columns takes
//! its schema from the driver's metadata before the first row materializes.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use relata::backend::memory::MemoryBackend;
use relata::schema::TableDef;
use relata::shard::beacon::SingleBeacon;
use relata::shard::{CredentialHandle, Shard, ShardAccess, ShardId};
use relata::types::builtin;
use relata::types::stack::TypeStack;
use relata::value::TypedSlot;
use relata::{Context, Error};

struct Raw {
    ctx: Arc<Context>,
    shard: Arc<Shard>,
    table: Arc<TableDef>,
}

fn fixture(name: &str) -> Raw {
    let ctx = Context::start().unwrap();
    let backend = MemoryBackend::shared(name);
    ctx.register_backend(Arc::clone(&backend) as _).unwrap();

    let cred = CredentialHandle::plaintext("app", "secret", "localhost", 0).unwrap();
    let access = ShardAccess::with_database(Arc::clone(&backend) as _, cred, "main");
    let shard = Shard::new(ShardId::from_name("main"), access, None);

    // The engine-side table starts empty; the store knows the real shape.
    let table = ctx.add_table(TableDef::late_binding("t")).unwrap();
    table.set_beacon(SingleBeacon::new(Arc::clone(&shard)));

    backend.store().seed_table(
        "main",
        "t",
        &[
            ("a", TypeStack::scalar(builtin::int64())),
            ("b", TypeStack::scalar(builtin::string())),
        ],
    );
    backend.store().seed_row(
        "main",
        "t",
        vec![TypedSlot::int64(10), TypedSlot::string("ten")],
    );
    backend.store().seed_row(
        "main",
        "t",
        vec![TypedSlot::int64(20), TypedSlot::string("twenty")],
    );

    Raw { ctx, shard, table }
}

#[tokio::test]
async fn test_raw_select_binds_columns_then_rows() {
    let fx = fixture("s5-late");
    assert_eq!(fx.table.leading().field_count(), 0);

    let result = fx
        .ctx
        .execute_raw(&fx.shard, "SELECT * FROM t", &[], &fx.table)
        .await
        .unwrap();

    // The definition now carries exactly the driver's columns, in order.
    let tdv = fx.table.leading();
    assert_eq!(tdv.field_count(), 2);
    assert_eq!(tdv.fields()[0].name, "a");
    assert_eq!(tdv.fields()[1].name, "b");
    assert_eq!(
        tdv.fields()[0].stack.innermost().tag,
        builtin::TAG_INT64
    );

    // And the rows materialized against it.
    assert_eq!(result.rows.len(), 2);
    let a = tdv.field_by_name("a").unwrap();
    let b = tdv.field_by_name("b").unwrap();
    let mut seen: Vec<(i64, String)> = result
        .rows
        .iter_rows()
        .map(|row| {
            let buffer = fx.ctx.heap().buffer_of(row[0]).unwrap();
            buffer
                .with_tuple(row[0], |t| {
                    Ok((
                        t.get(a)?.as_i64().unwrap(),
                        t.get(b)?.as_str().unwrap().to_string(),
                    ))
                })
                .unwrap()
        })
        .collect();
    seen.sort();
    assert_eq!(seen, vec![(10, "ten".to_string()), (20, "twenty".to_string())]);
}

#[tokio::test]
async fn test_second_recordset_must_match() {
    let fx = fixture("s5-mismatch");

    fx.ctx
        .execute_raw(&fx.shard, "SELECT * FROM t", &[], &fx.table)
        .await
        .unwrap();

    // Same shape again: fine.
    fx.ctx
        .execute_raw(&fx.shard, "SELECT * FROM t", &[], &fx.table)
        .await
        .unwrap();

    // Re-binding with different columns is rejected explicitly.
    let other = vec![("z".to_string(), TypeStack::scalar(builtin::int64()))];
    assert!(matches!(
        fx.table.bind_columns(&other),
        Err(Error::SchemaMismatch(_))
    ));
}
