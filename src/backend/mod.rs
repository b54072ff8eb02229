//! The backend adapter contract.
//!
//! A backend registers one [`BackendAdapter`] (SQL emission, parameter
//! extraction, native type mapping, connection construction) and implements
//! [`BackendConnection`] for the per-connection operations: connect,
//! transaction control, savepoints, optional two-phase commit, and
//! `execute` — which reads rows, materializes tuples into the result buffer
//! through the plan's projection, and feeds the collector.
//!
//! Adapters register with the [`BackendCatalog`] at process start, before
//! worker threads fork.

pub mod griddb;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::context::Context;
use crate::exec::collect::TupleCollector;
use crate::heap::HeapBufferNo;
use crate::mem::MemScope;
use crate::nodes::sql::{self, PlaceholderStyle, SqlWriter};
use crate::nodes::{NodeArena, NodeKind, NodeRef};
use crate::plan::{PlannedStmt, PlannedStmtShard};
use crate::shard::CredentialValue;
use crate::types::stack::TypeStack;
use crate::types::tam::TypeAccess;
use crate::types::TypeTag;
use crate::value::TypedSlot;
use crate::{Error, Result};

// ============================================================================
// Exchange types
// ============================================================================

/// One extracted statement parameter in driver-consumable form.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub stack: TypeStack,
    pub value: TypedSlot,
}

/// Emitted SQL text plus its ordered placeholder sources.
#[derive(Debug, Clone)]
pub struct SqlCommand {
    pub text: String,
    /// Per placeholder: the feeding `Const`/`Param` node, or `None` for
    /// tuple-derived bindings.
    pub params: Vec<Option<NodeRef>>,
}

/// Timing and row counts reported by one `execute` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecTimings {
    pub rows: u64,
    /// Backend execution time.
    pub qexec_ns: u64,
    /// Tuple formation time.
    pub htform_ns: u64,
}

impl ExecTimings {
    pub fn absorb(&mut self, other: ExecTimings) {
        self.rows += other.rows;
        self.qexec_ns += other.qexec_ns;
        self.htform_ns += other.htform_ns;
    }
}

/// Where and how `execute` delivers rows.
pub struct CollectorHandle<'a> {
    /// Result buffer the backend materializes tuples into.
    pub hbno: HeapBufferNo,
    /// Result tables per row.
    pub rtups: usize,
    pub est_rows: usize,
    pub sink: &'a mut dyn TupleCollector,
}

/// Everything one `execute` call needs.
pub struct BackendExecPlan<'a> {
    pub ctx: &'a Context,
    pub stmt: &'a PlannedStmt,
    pub binding: &'a PlannedStmtShard,
    pub work_scope: &'a MemScope,
    pub result_scope: &'a MemScope,
    /// `None` discards results (the driver still drains them).
    pub collector: Option<CollectorHandle<'a>>,
}

// ============================================================================
// BackendAdapter
// ============================================================================

/// The per-driver registration: everything that is not per-connection.
pub trait BackendAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Dollar
    }

    fn create_connection(&self) -> Box<dyn BackendConnection>;

    /// Emit SQL for a read or DDL node tree. The default uses the generic
    /// emitters with this backend's placeholder style.
    fn command(&self, arena: &NodeArena, root: NodeRef) -> Result<SqlCommand> {
        let mut w = SqlWriter::new(self.placeholder_style());
        match arena.kind(root) {
            NodeKind::Select => sql::emit_select(arena, root, &mut w)?,
            NodeKind::Ddl { .. } => sql::emit_fragment(arena, root, &mut w)?,
            other => {
                return Err(Error::PlanError(format!(
                    "command emission for {other:?} goes through the write emitters"
                )));
            }
        }
        Ok(SqlCommand {
            text: w.sql,
            params: w.params,
        })
    }

    fn command_insert(
        &self,
        table: &str,
        columns: &[String],
        rows: usize,
        returning: &[String],
    ) -> Result<SqlCommand> {
        let mut w = SqlWriter::new(self.placeholder_style());
        sql::emit_insert(table, columns, rows, returning, &mut w)?;
        Ok(SqlCommand {
            text: w.sql,
            params: w.params,
        })
    }

    fn command_update(
        &self,
        table: &str,
        set_columns: &[String],
        key_columns: &[String],
    ) -> Result<SqlCommand> {
        let mut w = SqlWriter::new(self.placeholder_style());
        sql::emit_update(table, set_columns, key_columns, &mut w)?;
        Ok(SqlCommand {
            text: w.sql,
            params: w.params,
        })
    }

    fn command_delete(&self, table: &str, key_columns: &[String]) -> Result<SqlCommand> {
        let mut w = SqlWriter::new(self.placeholder_style());
        sql::emit_delete(table, key_columns, &mut w)?;
        Ok(SqlCommand {
            text: w.sql,
            params: w.params,
        })
    }

    /// Extract one parameter value into the driver's representation. The
    /// default carries the canonical slot through unchanged.
    fn param(&self, stack: &TypeStack, value: &TypedSlot) -> Result<Parameter> {
        Ok(Parameter {
            stack: stack.clone(),
            value: value.clone(),
        })
    }

    /// Backend-native type names mapped to engine tags, for schema loading.
    fn native_types(&self) -> Vec<(String, TypeTag)> {
        Vec::new()
    }

    /// Per-type access-method override for this backend's wire format.
    fn tam_override(&self, _tag: TypeTag) -> Option<Arc<dyn TypeAccess>> {
        None
    }

    fn supports_savepoints(&self) -> bool {
        true
    }

    fn supports_two_phase(&self) -> bool {
        false
    }
}

// ============================================================================
// BackendConnection
// ============================================================================

/// One live connection to a backend.
#[async_trait]
pub trait BackendConnection: Send {
    /// Open the connection. The credential value is consumed here and
    /// wiped by the caller immediately after.
    async fn connect(&mut self, cred: &CredentialValue, database: Option<&str>) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    /// Return the connection to a clean reusable state (pool checkout).
    fn reset(&mut self);

    async fn ping(&mut self) -> Result<bool>;

    async fn begin(&mut self) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;

    async fn savepoint(&mut self, name: &str) -> Result<()>;
    async fn rollback_to(&mut self, name: &str) -> Result<()>;

    async fn two_phase_commit(&mut self) -> Result<()> {
        Err(Error::Unsupported("two-phase commit".into()))
    }

    async fn two_phase_rollback(&mut self) -> Result<()> {
        Err(Error::Unsupported("two-phase rollback".into()))
    }

    /// Run one planned statement against this connection, materializing
    /// result tuples and feeding the collector.
    async fn execute(&mut self, plan: BackendExecPlan<'_>) -> Result<ExecTimings>;

    /// Pass-through for backend-native SQL with a late-binding result
    /// shape.
    async fn execute_raw(
        &mut self,
        plan: BackendExecPlan<'_>,
        sql: &str,
        params: &[TypedSlot],
    ) -> Result<ExecTimings> {
        let _ = (plan, sql, params);
        Err(Error::Unsupported("raw execution".into()))
    }

    /// Load the backend's view of the schema, when the driver can.
    async fn schema_get(&mut self) -> Result<Vec<(String, Vec<(String, TypeTag)>)>> {
        Err(Error::Unsupported("schema introspection".into()))
    }
}

// ============================================================================
// BackendCatalog
// ============================================================================

/// Registered adapters by name.
pub struct BackendCatalog {
    by_name: RwLock<HashMap<String, Arc<dyn BackendAdapter>>>,
}

impl BackendCatalog {
    pub fn new() -> Self {
        Self {
            by_name: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, adapter: Arc<dyn BackendAdapter>) -> Result<()> {
        let mut map = self.by_name.write();
        let name = adapter.name().to_string();
        if map.contains_key(&name) {
            return Err(Error::UserInput(format!(
                "backend '{name}' already registered"
            )));
        }
        map.insert(name, adapter);
        Ok(())
    }

    pub fn by_name(&self, name: &str) -> Result<Arc<dyn BackendAdapter>> {
        self.by_name
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("backend '{name}'")))
    }

    pub fn len(&self) -> usize {
        self.by_name.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.read().is_empty()
    }
}

impl Default for BackendCatalog {
    fn default() -> Self {
        Self::new()
    }
}
