//! In-memory reference backend.
//!
//! This is the reference implementation of the adapter contract. It keeps
//! rows per (database, table) behind a shared store and interprets planned
//! statements directly from their node trees instead of parsing SQL.
//!
//! ## Semantics
//!
//! - **Transactions are snapshots**: `begin` captures the database,
//!   `SAVEPOINT` captures named intermediate states, `ROLLBACK`/`ROLLBACK
//!   TO` restore them. Good enough to observe nested-transaction behavior
//!   end to end; not an MVCC engine.
//! - **Integer defaults**: an inserted row's RETURNING columns of integer
//!   type draw from a per-table serial, so defaults flow back like a real
//!   backend's sequence.
//! - **Raw SQL** supports the `SELECT * FROM <table>` shape used by
//!   late-binding result sets.
//!
//! Use it to exercise the planner, executor, collectors and transaction
//! manager without a server.

use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::backend::{
    BackendAdapter, BackendConnection, BackendExecPlan, ExecTimings,
};
use crate::heap::{HeapTuplePtr, TupleFlags};
use crate::nodes::{NodeKind, NodeRef};
use crate::plan::{PlannedStmt, Projection, StmtAction, projection};
use crate::schema::TableDef;
use crate::shard::CredentialValue;
use crate::types::builtin;
use crate::types::ops::CmpOp;
use crate::types::stack::TypeStack;
use crate::value::TypedSlot;
use crate::{Error, Result};

// ============================================================================
// Store
// ============================================================================

type Row = Vec<TypedSlot>;

#[derive(Clone)]
struct TableRows {
    schema: Vec<(String, TypeStack)>,
    rows: Vec<Row>,
    next_serial: i64,
}

impl TableRows {
    fn ordinal(&self, name: &str) -> Option<usize> {
        self.schema.iter().position(|(have, _)| have == name)
    }
}

type Database = HashMap<String, TableRows>;

/// The shared row store behind every connection of one adapter.
pub struct MemoryStore {
    databases: Mutex<HashMap<String, Database>>,
}

const DEFAULT_DATABASE: &str = "default";

impl MemoryStore {
    fn new() -> Self {
        Self {
            databases: Mutex::new(HashMap::new()),
        }
    }

    /// Create a table with an explicit schema (test seeding).
    pub fn seed_table(&self, database: &str, table: &str, schema: &[(&str, TypeStack)]) {
        let mut databases = self.databases.lock();
        let db = databases.entry(database.to_string()).or_default();
        db.insert(
            table.to_string(),
            TableRows {
                schema: schema
                    .iter()
                    .map(|(name, stack)| (name.to_string(), stack.clone()))
                    .collect(),
                rows: Vec::new(),
                next_serial: 1,
            },
        );
    }

    /// Append a row positionally (test seeding).
    pub fn seed_row(&self, database: &str, table: &str, values: Vec<TypedSlot>) {
        let mut databases = self.databases.lock();
        let db = databases.entry(database.to_string()).or_default();
        if let Some(rows) = db.get_mut(table) {
            rows.rows.push(values);
        }
    }

    /// Current rows of a table (test assertions).
    pub fn rows(&self, database: &str, table: &str) -> Vec<Vec<TypedSlot>> {
        self.databases
            .lock()
            .get(database)
            .and_then(|db| db.get(table))
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, database: &str, table: &str) -> usize {
        self.rows(database, table).len()
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// The adapter registration for the in-memory store.
pub struct MemoryBackend {
    name: String,
    store: Arc<MemoryStore>,
    self_ref: Weak<MemoryBackend>,
}

impl MemoryBackend {
    /// Create a shared adapter instance. Every connection it creates sees
    /// the same store.
    pub fn shared(name: impl Into<String>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            name: name.into(),
            store: Arc::new(MemoryStore::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

impl BackendAdapter for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_connection(&self) -> Box<dyn BackendConnection> {
        Box::new(MemoryConnection {
            adapter: self
                .self_ref
                .upgrade()
                .expect("adapter outlives its connections"),
            store: Arc::clone(&self.store),
            database: DEFAULT_DATABASE.to_string(),
            connected: false,
            tx: None,
        })
    }
}

// ============================================================================
// Connection
// ============================================================================

struct TxState {
    base: Database,
    savepoints: Vec<(String, Database)>,
}

struct MemoryConnection {
    adapter: Arc<MemoryBackend>,
    store: Arc<MemoryStore>,
    database: String,
    connected: bool,
    tx: Option<TxState>,
}

impl MemoryConnection {
    fn snapshot(&self) -> Database {
        self.store
            .databases
            .lock()
            .get(&self.database)
            .cloned()
            .unwrap_or_default()
    }

    fn restore(&self, snapshot: &Database) {
        self.store
            .databases
            .lock()
            .insert(self.database.clone(), snapshot.clone());
    }

    fn check_connected(&self) -> Result<()> {
        if !self.connected {
            return Err(Error::BackendIo {
                retryable: true,
                detail: "memory connection is not open".into(),
            });
        }
        Ok(())
    }

    /// Make sure the stored table exists and matches the engine's leading
    /// definition.
    fn sync_schema(&self, def: &TableDef) {
        let tdv = def.leading();
        let mut databases = self.store.databases.lock();
        let db = databases.entry(self.database.clone()).or_default();
        db.entry(def.name.clone()).or_insert_with(|| TableRows {
            schema: tdv
                .fields()
                .iter()
                .map(|f| (f.name.clone(), f.stack.clone()))
                .collect(),
            rows: Vec::new(),
            next_serial: 1,
        });
    }

    // ========================================================================
    // Inserts
    // ========================================================================

    async fn run_insert(&mut self, plan: BackendExecPlan<'_>) -> Result<ExecTimings> {
        let started = Instant::now();
        let stmt = plan.stmt;
        let ctx = plan.ctx;
        let table_name = stmt.arena.target_table(stmt.root)?;
        let def = ctx.tables().by_name(&table_name)?;
        self.sync_schema(&def);

        let cols = stmt.columns.len();
        if cols == 0 || plan.binding.params.len() != cols * stmt.rows {
            return Err(Error::Invariant(format!(
                "insert binding carries {} params for {} columns x {} rows",
                plan.binding.params.len(),
                cols,
                stmt.rows
            )));
        }

        // Apply rows to the store, drawing serial defaults for RETURNING
        // integer columns.
        let mut returned: Vec<Row> = Vec::with_capacity(stmt.rows);
        let stored_schema: Vec<(String, TypeStack)>;
        {
            let mut databases = self.store.databases.lock();
            let db = databases.entry(self.database.clone()).or_default();
            let table = db
                .get_mut(&table_name)
                .ok_or_else(|| Error::NotFound(format!("table '{table_name}'")))?;

            for chunk in plan.binding.params.chunks_exact(cols) {
                let mut row: Row = table
                    .schema
                    .iter()
                    .map(|(_, stack)| TypedSlot::null(stack.clone()))
                    .collect();
                for (name, param) in stmt.columns.iter().zip(chunk.iter()) {
                    let ordinal = table.ordinal(name).ok_or_else(|| {
                        Error::SchemaMismatch(format!(
                            "column '{name}' missing from stored table '{table_name}'"
                        ))
                    })?;
                    row[ordinal] = param.value.clone();
                }
                for name in &stmt.returning {
                    let ordinal = table.ordinal(name).ok_or_else(|| {
                        Error::SchemaMismatch(format!(
                            "column '{name}' missing from stored table '{table_name}'"
                        ))
                    })?;
                    if row[ordinal].is_null() {
                        let tag = table.schema[ordinal].1.innermost().tag;
                        let serial = table.next_serial;
                        if tag == builtin::TAG_INT64 {
                            row[ordinal] = TypedSlot::int64(serial);
                            table.next_serial += 1;
                        } else if tag == builtin::TAG_INT32 {
                            row[ordinal] = TypedSlot::int32(serial as i32);
                            table.next_serial += 1;
                        }
                    }
                }
                returned.push(row.clone());
                table.rows.push(row);
            }
            stored_schema = table.schema.clone();
        }
        let qexec_ns = started.elapsed().as_nanos() as u64;

        // RETURNING: materialize transient tuples and feed the collector.
        let formed = Instant::now();
        if let Some(collector) = plan.collector {
            if !stmt.returning.is_empty() {
                let tdv = def.leading();
                let buffer = ctx.heap().get(collector.hbno)?;
                for row in &returned {
                    let htp = buffer.alloc_tuple(&tdv)?;
                    for name in &stmt.returning {
                        let field = tdv.field_by_name(name)?;
                        let stored_ord = stored_schema
                            .iter()
                            .position(|(have, _)| have == name)
                            .ok_or_else(|| {
                                Error::SchemaMismatch(format!("returning column '{name}'"))
                            })?;
                        let value = &row[stored_ord];
                        buffer.with_tuple_mut(htp, |t, scope| t.set(field, value, scope))?;
                    }
                    let mut out = [htp];
                    collector.sink.collect(ctx, &mut out)?;
                }
            }
        }

        Ok(ExecTimings {
            rows: stmt.rows as u64,
            qexec_ns,
            htform_ns: formed.elapsed().as_nanos() as u64,
        })
    }

    // ========================================================================
    // Selects
    // ========================================================================

    async fn run_select(&mut self, plan: BackendExecPlan<'_>) -> Result<ExecTimings> {
        let started = Instant::now();
        let stmt = plan.stmt;
        let ctx = plan.ctx;

        let table_names = stmt.arena.select_tables(stmt.root);
        if table_names.is_empty() {
            return Err(Error::UserInput("select has no FROM".into()));
        }

        // Late binding: the driver's metadata defines the columns before
        // the first row materializes.
        if stmt.late_binding && !stmt.projection_ready() {
            let def = ctx.tables().by_name(&table_names[0])?;
            let schema = {
                let databases = self.store.databases.lock();
                databases
                    .get(&self.database)
                    .and_then(|db| db.get(&table_names[0]))
                    .map(|t| t.schema.clone())
                    .ok_or_else(|| {
                        Error::NotFound(format!("table '{}'", table_names[0]))
                    })?
            };
            let resolved = projection::resolve_late(&*self.adapter, &def, &schema)?;
            *stmt.projection.lock() = Some(resolved);
        }

        // Bind placeholder nodes to their parameter values.
        let mut bound: HashMap<NodeRef, TypedSlot> = HashMap::new();
        for (source, param) in stmt.sql.params.iter().zip(plan.binding.params.iter()) {
            if let Some(node) = source {
                bound.insert(*node, param.value.clone());
            }
        }

        // Load per-table row sets.
        let stored: Vec<(String, TableRows)> = {
            let databases = self.store.databases.lock();
            let db = databases.get(&self.database).cloned().unwrap_or_default();
            table_names
                .iter()
                .map(|name| {
                    db.get(name)
                        .cloned()
                        .map(|rows| (name.clone(), rows))
                        .ok_or_else(|| Error::NotFound(format!("table '{name}'")))
                })
                .collect::<Result<_>>()?
        };

        // Start from the driving table, nested-loop each join.
        let mut joined: Vec<Vec<Row>> = stored[0].1.rows.iter().map(|r| vec![r.clone()]).collect();

        let select_children = stmt.arena.children(stmt.root);
        let mut table_cursor = 1usize;
        for child in &select_children {
            if let NodeKind::Join { .. } = stmt.arena.kind(*child) {
                let right = &stored[table_cursor];
                let quals = stmt
                    .arena
                    .children_where(*child, |k| matches!(k, NodeKind::Qual { .. }));
                let mut next: Vec<Vec<Row>> = Vec::new();
                for left in &joined {
                    for row in &right.1.rows {
                        let mut candidate = left.clone();
                        candidate.push(row.clone());
                        if self.eval_quals(stmt, &quals, &stored, &candidate, &bound)? {
                            next.push(candidate);
                        }
                    }
                }
                joined = next;
                table_cursor += 1;
            }
        }

        // WHERE quals on the select itself.
        let where_quals: Vec<NodeRef> = select_children
            .iter()
            .copied()
            .filter(|c| matches!(stmt.arena.kind(*c), NodeKind::Qual { .. }))
            .collect();
        let mut filtered: Vec<Vec<Row>> = Vec::new();
        for candidate in joined {
            if self.eval_quals(stmt, &where_quals, &stored, &candidate, &bound)? {
                filtered.push(candidate);
            }
        }

        // ORDER BY, single or multi key, stable.
        for child in select_children.iter().rev() {
            if let NodeKind::OrderBy { ascending } = stmt.arena.kind(*child) {
                let field = stmt.arena.children(*child)[0];
                let NodeKind::Field { table, name } = stmt.arena.kind(field) else {
                    return Err(Error::UserInput("ORDER BY target is not a field".into()));
                };
                let (ti, ord) = locate_column(&stored, table.as_deref(), name)?;
                let ascending = *ascending;
                filtered.sort_by(|a, b| {
                    let cmp = a[ti][ord]
                        .compare(&b[ti][ord])
                        .unwrap_or(std::cmp::Ordering::Equal);
                    if ascending { cmp } else { cmp.reverse() }
                });
            }
        }
        let qexec_ns = started.elapsed().as_nanos() as u64;

        // Materialize result tuples through the projection.
        let formed = Instant::now();
        let mut delivered = 0u64;
        if let Some(collector) = plan.collector {
            let projection = stmt.projection.lock();
            let projection: &Projection = projection
                .as_ref()
                .ok_or_else(|| Error::SchemaMismatch("projection unresolved".into()))?;
            let buffer = ctx.heap().get(collector.hbno)?;

            for candidate in &filtered {
                let mut out: Vec<HeapTuplePtr> = Vec::with_capacity(projection.tables.len());
                for (ti, rtable) in projection.tables.iter().enumerate() {
                    let htp = buffer.alloc_tuple(&rtable.tdv)?;
                    let stored_table = &stored[ti].1;
                    for pf in &rtable.fields {
                        if let Some(ord) = stored_table.ordinal(&pf.field.name) {
                            let value = &candidate[ti][ord];
                            buffer.with_tuple_mut(htp, |t, scope| t.set(&pf.field, value, scope))?;
                        }
                    }
                    buffer.with_tuple_mut(htp, |t, _| {
                        t.flags.insert(TupleFlags::FETCHED);
                        t.clear_changed();
                        t.snapshot();
                        Ok(())
                    })?;
                    out.push(htp);
                }
                collector.sink.collect(ctx, &mut out)?;
                delivered += 1;
            }
        }

        Ok(ExecTimings {
            rows: delivered,
            qexec_ns,
            htform_ns: formed.elapsed().as_nanos() as u64,
        })
    }

    fn eval_quals(
        &self,
        stmt: &PlannedStmt,
        quals: &[NodeRef],
        stored: &[(String, TableRows)],
        candidate: &[Row],
        bound: &HashMap<NodeRef, TypedSlot>,
    ) -> Result<bool> {
        for qual in quals {
            let NodeKind::Qual { op } = stmt.arena.kind(*qual) else {
                continue;
            };
            let op = CmpOp::from_text(op)?;
            let operands = stmt.arena.children(*qual);
            if operands.len() != 2 {
                return Err(Error::UserInput("qual without two operands".into()));
            }
            let lhs = self.operand_value(stmt, operands[0], stored, candidate, bound)?;
            let rhs = self.operand_value(stmt, operands[1], stored, candidate, bound)?;
            match (lhs, rhs) {
                (Some(lhs), Some(rhs)) => {
                    if !op.matches(lhs.compare(&rhs)?) {
                        return Ok(false);
                    }
                }
                // SQL-style: null satisfies nothing.
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn operand_value(
        &self,
        stmt: &PlannedStmt,
        node: NodeRef,
        stored: &[(String, TableRows)],
        candidate: &[Row],
        bound: &HashMap<NodeRef, TypedSlot>,
    ) -> Result<Option<TypedSlot>> {
        match stmt.arena.kind(node) {
            NodeKind::Field { table, name } => {
                let (ti, ord) = locate_column(stored, table.as_deref(), name)?;
                let slot = candidate
                    .get(ti)
                    .and_then(|row| row.get(ord))
                    .cloned()
                    .ok_or_else(|| Error::Invariant("candidate row too narrow".into()))?;
                Ok(if slot.is_null() { None } else { Some(slot) })
            }
            NodeKind::Const(slot) => Ok(Some(slot.clone())),
            NodeKind::Param(_) => Ok(bound.get(&node).cloned()),
            other => Err(Error::UserInput(format!(
                "unsupported qual operand {other:?}"
            ))),
        }
    }

    // ========================================================================
    // Updates / deletes
    // ========================================================================

    async fn run_update(&mut self, plan: BackendExecPlan<'_>) -> Result<ExecTimings> {
        let started = Instant::now();
        let stmt = plan.stmt;
        let table_name = stmt.arena.target_table(stmt.root)?;
        let set_count = stmt.columns.len();
        let keys = &stmt.key_columns;
        let params = &plan.binding.params;
        if params.len() != set_count + keys.len() {
            return Err(Error::Invariant("update binding arity mismatch".into()));
        }

        let mut databases = self.store.databases.lock();
        let db = databases.entry(self.database.clone()).or_default();
        let table = db
            .get_mut(&table_name)
            .ok_or_else(|| Error::NotFound(format!("table '{table_name}'")))?;

        let mut affected = 0u64;
        for row in &mut table.rows {
            let mut matches = true;
            for (key, param) in keys.iter().zip(params[set_count..].iter()) {
                let ord = table
                    .schema
                    .iter()
                    .position(|(name, _)| name == key)
                    .ok_or_else(|| Error::SchemaMismatch(format!("key column '{key}'")))?;
                if row[ord].is_null()
                    || row[ord].compare(&param.value)? != std::cmp::Ordering::Equal
                {
                    matches = false;
                    break;
                }
            }
            if !matches {
                continue;
            }
            for (name, param) in stmt.columns.iter().zip(params[..set_count].iter()) {
                let ord = table
                    .schema
                    .iter()
                    .position(|(have, _)| have == name)
                    .ok_or_else(|| Error::SchemaMismatch(format!("set column '{name}'")))?;
                row[ord] = param.value.clone();
            }
            affected += 1;
        }

        Ok(ExecTimings {
            rows: affected,
            qexec_ns: started.elapsed().as_nanos() as u64,
            htform_ns: 0,
        })
    }

    async fn run_delete(&mut self, plan: BackendExecPlan<'_>) -> Result<ExecTimings> {
        let started = Instant::now();
        let stmt = plan.stmt;
        let table_name = stmt.arena.target_table(stmt.root)?;
        let keys = &stmt.key_columns;
        let params = &plan.binding.params;

        let mut databases = self.store.databases.lock();
        let db = databases.entry(self.database.clone()).or_default();
        let table = db
            .get_mut(&table_name)
            .ok_or_else(|| Error::NotFound(format!("table '{table_name}'")))?;

        let ords: Vec<usize> = keys
            .iter()
            .map(|key| {
                table
                    .schema
                    .iter()
                    .position(|(name, _)| name == key)
                    .ok_or_else(|| Error::SchemaMismatch(format!("key column '{key}'")))
            })
            .collect::<Result<_>>()?;

        let before = table.rows.len();
        table.rows.retain(|row| {
            !ords.iter().zip(params.iter()).all(|(ord, param)| {
                !row[*ord].is_null()
                    && row[*ord].compare(&param.value).unwrap_or(std::cmp::Ordering::Less)
                        == std::cmp::Ordering::Equal
            })
        });

        Ok(ExecTimings {
            rows: (before - table.rows.len()) as u64,
            qexec_ns: started.elapsed().as_nanos() as u64,
            htform_ns: 0,
        })
    }
}

fn locate_column(
    stored: &[(String, TableRows)],
    table: Option<&str>,
    name: &str,
) -> Result<(usize, usize)> {
    match table {
        Some(table) => {
            let ti = stored
                .iter()
                .position(|(have, _)| have == table)
                .ok_or_else(|| Error::NotFound(format!("table '{table}' in select")))?;
            let ord = stored[ti]
                .1
                .ordinal(name)
                .ok_or_else(|| Error::NotFound(format!("column '{table}.{name}'")))?;
            Ok((ti, ord))
        }
        None => {
            for (ti, (_, rows)) in stored.iter().enumerate() {
                if let Some(ord) = rows.ordinal(name) {
                    return Ok((ti, ord));
                }
            }
            Err(Error::NotFound(format!("column '{name}'")))
        }
    }
}

// ============================================================================
// BackendConnection impl
// ============================================================================

#[async_trait]
impl BackendConnection for MemoryConnection {
    async fn connect(&mut self, _cred: &CredentialValue, database: Option<&str>) -> Result<()> {
        self.database = database.unwrap_or(DEFAULT_DATABASE).to_string();
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.tx = None;
        Ok(())
    }

    fn reset(&mut self) {
        self.tx = None;
    }

    async fn ping(&mut self) -> Result<bool> {
        Ok(self.connected)
    }

    async fn begin(&mut self) -> Result<()> {
        self.check_connected()?;
        if self.tx.is_some() {
            return Err(Error::TxFailure("transaction already open".into()));
        }
        self.tx = Some(TxState {
            base: self.snapshot(),
            savepoints: Vec::new(),
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.check_connected()?;
        self.tx
            .take()
            .map(|_| ())
            .ok_or_else(|| Error::TxFailure("commit without a transaction".into()))
    }

    async fn rollback(&mut self) -> Result<()> {
        self.check_connected()?;
        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::TxFailure("rollback without a transaction".into()))?;
        self.restore(&tx.base);
        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<()> {
        self.check_connected()?;
        let snapshot = self.snapshot();
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| Error::TxFailure("savepoint without a transaction".into()))?;
        tx.savepoints.push((name.to_string(), snapshot));
        Ok(())
    }

    async fn rollback_to(&mut self, name: &str) -> Result<()> {
        self.check_connected()?;
        let snapshot = {
            let tx = self
                .tx
                .as_mut()
                .ok_or_else(|| Error::TxFailure("rollback-to without a transaction".into()))?;
            let at = tx
                .savepoints
                .iter()
                .position(|(have, _)| have == name)
                .ok_or_else(|| Error::TxFailure(format!("unknown savepoint '{name}'")))?;
            // The savepoint itself survives; later ones vanish.
            tx.savepoints.truncate(at + 1);
            tx.savepoints[at].1.clone()
        };
        self.restore(&snapshot);
        Ok(())
    }

    async fn execute(&mut self, plan: BackendExecPlan<'_>) -> Result<ExecTimings> {
        self.check_connected()?;
        match plan.stmt.action {
            StmtAction::Select => self.run_select(plan).await,
            StmtAction::Insert { .. } => self.run_insert(plan).await,
            StmtAction::Update => self.run_update(plan).await,
            StmtAction::Delete => self.run_delete(plan).await,
            StmtAction::Ddl => {
                // The store is schemaless beyond its tables; a DDL command
                // only ensures the database exists.
                self.store
                    .databases
                    .lock()
                    .entry(self.database.clone())
                    .or_default();
                Ok(ExecTimings::default())
            }
        }
    }

    async fn execute_raw(
        &mut self,
        plan: BackendExecPlan<'_>,
        sql: &str,
        _params: &[TypedSlot],
    ) -> Result<ExecTimings> {
        self.check_connected()?;
        // The reference backend speaks exactly the late-binding shape.
        let trimmed = sql.trim().trim_end_matches(';').trim();
        let lowered = trimmed.to_lowercase();
        let table = lowered
            .strip_prefix("select * from ")
            .map(|rest| trimmed[lowered.len() - rest.len()..].trim().to_string())
            .ok_or_else(|| {
                Error::Unsupported(format!(
                    "memory backend raw SQL supports only 'SELECT * FROM <table>', got '{sql}'"
                ))
            })?;
        let expected = plan.stmt.arena.target_table(plan.stmt.root)?;
        if table != expected {
            return Err(Error::Invariant(format!(
                "raw SQL names '{table}' but the plan targets '{expected}'"
            )));
        }
        self.run_select(plan).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_transactions() {
        let backend = MemoryBackend::shared("snap");
        let store = Arc::clone(backend.store());
        store.seed_table(
            "db",
            "t",
            &[("id", TypeStack::scalar(builtin::int64()))],
        );

        let mut conn = backend.create_connection();
        let cred = crate::shard::CredentialHandle::plaintext("u", "p", "h", 1)
            .unwrap()
            .retrieve();
        conn.connect(&cred, Some("db")).await.unwrap();

        conn.begin().await.unwrap();
        store.seed_row("db", "t", vec![TypedSlot::int64(1)]);
        conn.savepoint("sp0").await.unwrap();
        store.seed_row("db", "t", vec![TypedSlot::int64(2)]);
        assert_eq!(store.row_count("db", "t"), 2);

        conn.rollback_to("sp0").await.unwrap();
        assert_eq!(store.row_count("db", "t"), 1);

        conn.rollback().await.unwrap();
        assert_eq!(store.row_count("db", "t"), 0);
    }

    #[tokio::test]
    async fn test_commit_keeps_state() {
        let backend = MemoryBackend::shared("commit");
        let store = Arc::clone(backend.store());
        store.seed_table("db", "t", &[("id", TypeStack::scalar(builtin::int64()))]);

        let mut conn = backend.create_connection();
        let cred = crate::shard::CredentialHandle::plaintext("u", "p", "h", 1)
            .unwrap()
            .retrieve();
        conn.connect(&cred, Some("db")).await.unwrap();

        conn.begin().await.unwrap();
        store.seed_row("db", "t", vec![TypedSlot::int64(7)]);
        conn.commit().await.unwrap();
        assert_eq!(store.row_count("db", "t"), 1);
    }
}
