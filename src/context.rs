//! The engine context: catalogs, lifecycle, and the embedding API.
//!
//! A [`Context`] owns the process-wide state — type registry, table
//! catalog, backend catalog, connection catalog, heap buffer table, and the
//! "general" memory scope with its shared buffer. Registration happens at
//! start, before worker threads fork; execution APIs take the context
//! explicitly, with a thread-local current context as a convenience.

use std::cell::RefCell;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::backend::{BackendAdapter, BackendCatalog, BackendExecPlan, CollectorHandle};
use crate::diag::{self, DiagLevel};
use crate::exec::collect::{RowSet, SListCollector};
use crate::exec::{self, ConnSet, ExecResult};
use crate::heap::{HeapBufferNo, HeapBufferTable};
use crate::mem::MemScope;
use crate::nodes::{NodeArena, NodeRef, build};
use crate::plan::{PlannedStmt, PlannedStmtShard, PlannerOpts, StmtAction, plan_node};
use crate::schema::{TableCatalog, TableDef, TableDefBuilder};
use crate::shard::Shard;
use crate::types::{Type, TypeRef, TypeRegistry};
use crate::value::TypedSlot;
use crate::xact::{CommitOutcome, Xact, XactMode};
use crate::{Error, Result};

// ============================================================================
// Context
// ============================================================================

pub struct Context {
    types: TypeRegistry,
    tables: TableCatalog,
    backends: BackendCatalog,
    connections: crate::shard::conncat::ConnectionCatalog,
    heap: HeapBufferTable,
    general_scope: MemScope,
    general_hbno: OnceLock<HeapBufferNo>,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Context>>> = const { RefCell::new(None) };
}

impl Context {
    /// Start a context: builtin types registered, the general scope and
    /// buffer opened, the console diag sink installed, and the thread's
    /// current context set.
    pub fn start() -> Result<Arc<Self>> {
        let general_scope = MemScope::root("general");
        let ctx = Arc::new(Self {
            types: TypeRegistry::with_builtins()?,
            tables: TableCatalog::new(),
            backends: BackendCatalog::new(),
            connections: crate::shard::conncat::ConnectionCatalog::new(),
            heap: HeapBufferTable::new(),
            general_scope,
            general_hbno: OnceLock::new(),
        });

        let hbno = ctx.heap.open(&ctx.general_scope, "general")?;
        ctx.general_hbno
            .set(hbno)
            .map_err(|_| Error::Invariant("context started twice".into()))?;

        diag::install_console_sink(DiagLevel::Warning.mask_at_least());
        ctx.make_current();
        tracing::debug!("context started");
        Ok(ctx)
    }

    /// Make this context the thread's current one.
    pub fn make_current(self: &Arc<Self>) {
        CURRENT.with(|slot| *slot.borrow_mut() = Some(Arc::clone(self)));
    }

    /// The thread's current context.
    pub fn current() -> Option<Arc<Self>> {
        CURRENT.with(|slot| slot.borrow().clone())
    }

    /// Release pooled connections and drop the thread's current-context
    /// reference. Open buffers close when the context itself drops.
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        self.connections.shutdown().await?;
        CURRENT.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot
                .as_ref()
                .map(|current| Arc::ptr_eq(current, self))
                .unwrap_or(false)
            {
                *slot = None;
            }
        });
        tracing::debug!("context shut down");
        Ok(())
    }

    // ========================================================================
    // Catalogs
    // ========================================================================

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn tables(&self) -> &TableCatalog {
        &self.tables
    }

    pub fn backends(&self) -> &BackendCatalog {
        &self.backends
    }

    pub fn connections(&self) -> &crate::shard::conncat::ConnectionCatalog {
        &self.connections
    }

    pub fn heap(&self) -> &HeapBufferTable {
        &self.heap
    }

    pub fn general_scope(&self) -> &MemScope {
        &self.general_scope
    }

    /// The shared general-purpose buffer.
    pub fn general_buffer(&self) -> Result<HeapBufferNo> {
        self.general_hbno
            .get()
            .copied()
            .ok_or_else(|| Error::Invariant("context has no general buffer".into()))
    }

    // ========================================================================
    // Registration
    // ========================================================================

    pub fn register_backend(&self, adapter: Arc<dyn BackendAdapter>) -> Result<()> {
        self.backends.register(adapter)
    }

    pub fn register_type(&self, ty: Type) -> Result<TypeRef> {
        self.types.register(ty)
    }

    pub fn add_table(&self, builder: TableDefBuilder) -> Result<Arc<TableDef>> {
        self.tables.add(builder)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Plan and execute a query node outside any explicit transaction.
    /// Reads run against read leases returned when the call completes;
    /// writes run through a one-shot `Immediate` transaction whose commit
    /// must be clean.
    pub async fn execute(
        self: &Arc<Self>,
        arena: &NodeArena,
        root: NodeRef,
        opts: PlannerOpts,
    ) -> Result<ExecResult> {
        if arena.kind(root).is_read() {
            let plan = plan_node(self, arena, root, opts)?;
            let mut shared = ConnSet::new();
            let mut read_map = ConnSet::new();
            exec::acquire_plan_conns(self, &plan, &mut shared, &mut read_map).await?;
            let result = exec::run_plan(self, &plan, &mut shared, &mut read_map).await;
            drop(read_map);
            return result;
        }

        let mut xact = Xact::begin(Arc::clone(self), XactMode::Immediate)?;
        xact.submit(arena, root).await?;
        let outcome = xact.commit().await?;
        outcome_to_result(outcome)?;
        Ok(ExecResult::empty())
    }

    /// Run backend-native SQL against one shard, shaping the result through
    /// `table` (typically late-binding).
    pub async fn execute_raw(
        self: &Arc<Self>,
        shard: &Arc<Shard>,
        sql: &str,
        params: &[TypedSlot],
        table: &Arc<TableDef>,
    ) -> Result<ExecResult> {
        let mut arena = NodeArena::new();
        let root = build::select(&mut arena, table.name.clone());

        let stmt = PlannedStmt {
            action: StmtAction::Select,
            sql: crate::backend::SqlCommand {
                text: sql.to_string(),
                params: Vec::new(),
            },
            arena,
            root,
            projection: Mutex::new(None),
            late_binding: table.is_late_binding(),
            columns: Vec::new(),
            returning: Vec::new(),
            key_columns: Vec::new(),
            rows: 0,
            dedup: Vec::new(),
        };
        let binding = PlannedStmtShard {
            shard: Arc::clone(shard),
            params: Vec::new(),
            tuples: Vec::new(),
        };

        let access = shard.read_access()?;
        let mut lease = self.connections.get(access).await?;

        let scope = self.general_scope.child("raw");
        let hbno = self.general_buffer()?;
        let mut rows = RowSet::new();
        let timings = {
            let mut sink = SListCollector::new(&mut rows);
            let exec_plan = BackendExecPlan {
                ctx: self,
                stmt: &stmt,
                binding: &binding,
                work_scope: &scope,
                result_scope: &self.general_scope,
                collector: Some(CollectorHandle {
                    hbno,
                    rtups: 1,
                    est_rows: 0,
                    sink: &mut sink,
                }),
            };
            lease.conn().execute_raw(exec_plan, sql, params).await?
        };

        Ok(ExecResult { rows, timings })
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("types", &self.types.len())
            .field("backends", &self.backends.len())
            .field("buffers", &self.heap.open_count())
            .finish()
    }
}

fn outcome_to_result(outcome: CommitOutcome) -> Result<()> {
    match outcome.failed {
        None => Ok(()),
        Some((access, err)) => Err(Error::TxFailure(format!(
            "one-shot write failed to commit on access {}: {err}",
            access.0
        ))),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_registers_builtins_and_buffer() {
        let ctx = Context::start().unwrap();
        assert!(ctx.types().by_name("int64").is_ok());
        assert!(ctx.types().by_name("string").is_ok());
        assert!(ctx.general_buffer().is_ok());
        assert!(Context::current().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_clears_current() {
        let ctx = Context::start().unwrap();
        ctx.shutdown().await.unwrap();
        assert!(Context::current().is_none());
    }
}
