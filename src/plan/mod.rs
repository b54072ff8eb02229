//! Execution plans and planned statements.
//!
//! The planner turns a query node tree into an [`ExecPlan`]: a tree of
//! [`ExecStep`](crate::exec::ExecStep)s over shared [`PlannedStmt`]s, each
//! step bound to one shard with its own parameter list. The plan owns a
//! memory scope for its lifetime, records the shards it touches, and tracks
//! the tuples a write acts on so transaction disposition can sync local
//! state.

pub mod planner;
pub mod projection;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{ExecTimings, Parameter, SqlCommand};
use crate::exec::ExecStep;
use crate::heap::{HeapBufferNo, HeapTuplePtr};
use crate::mem::MemScope;
use crate::nodes::{NodeArena, NodeRef};
use crate::shard::Shard;
use crate::value::TypedSlot;

pub use planner::plan_node;
pub use projection::{ProjectedField, Projection, ResultTable};

// ============================================================================
// PlannerOpts
// ============================================================================

/// Caller inputs to one planning pass.
#[derive(Default)]
pub struct PlannerOpts {
    /// Scope result rows should charge; the plan's own scope parents here.
    pub result_scope: Option<MemScope>,
    /// Buffer to materialize result tuples into.
    pub hbno: Option<HeapBufferNo>,
    /// Route everything to this shard regardless of beacons.
    pub forced_shard: Option<Arc<Shard>>,
    /// Result tables (by name) to deduplicate through an index collector.
    pub dedup: Vec<String>,
    /// Values for positional `Param` nodes.
    pub params: Vec<TypedSlot>,
}

// ============================================================================
// Planned statements
// ============================================================================

/// What a statement does, as the executor and backends see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmtAction {
    Select,
    Insert {
        /// Group promoted to the bulk-insert action (more than four rows).
        bulk: bool,
    },
    Update,
    Delete,
    Ddl,
}

/// Per-result-table dedup request: build a key from these fields and keep
/// the first tuple per key.
#[derive(Debug, Clone)]
pub struct DedupSpec {
    pub table_index: u16,
    pub fields: Vec<Arc<crate::schema::HeapField>>,
}

/// One prepared statement shared by every shard binding of a step.
pub struct PlannedStmt {
    pub action: StmtAction,
    pub sql: SqlCommand,
    /// The plan's private copy of the query subtree.
    pub arena: NodeArena,
    pub root: NodeRef,
    /// Result-set shape, resolved at plan time; late-binding plans fill it
    /// at the first record set.
    pub projection: Mutex<Option<Projection>>,
    pub late_binding: bool,
    /// Insert target columns / update set columns.
    pub columns: Vec<String>,
    /// Columns flowing back from the backend (insert defaults).
    pub returning: Vec<String>,
    /// Update/delete key columns.
    pub key_columns: Vec<String>,
    /// Rows per execution (insert groups bind several).
    pub rows: usize,
    pub dedup: Vec<DedupSpec>,
}

impl PlannedStmt {
    pub fn projection_ready(&self) -> bool {
        self.projection.lock().is_some()
    }

    /// Number of result tables per row.
    pub fn rtups(&self) -> usize {
        self.projection
            .lock()
            .as_ref()
            .map(|p| p.tables.len())
            .unwrap_or(1)
    }
}

impl std::fmt::Debug for PlannedStmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannedStmt")
            .field("action", &self.action)
            .field("sql", &self.sql.text)
            .field("rows", &self.rows)
            .finish()
    }
}

/// One shard's binding of a planned statement.
#[derive(Debug, Clone)]
pub struct PlannedStmtShard {
    pub shard: Arc<Shard>,
    /// Ordered to match the statement's placeholders.
    pub params: Vec<Parameter>,
    /// The write tuples this binding covers (returning targets, local
    /// state sync).
    pub tuples: Vec<HeapTuplePtr>,
}

// ============================================================================
// ExecPlan
// ============================================================================

/// What a write plan did to each tuple, for commit/rollback state sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy)]
pub struct TupleTouch {
    pub htp: HeapTuplePtr,
    pub kind: TouchKind,
}

/// A complete plan: the step tree, optional commit/rollback steps, scopes,
/// touched shards and tuples, and execution statistics.
pub struct ExecPlan {
    pub root: ExecStep,
    pub on_commit: Option<ExecStep>,
    pub on_rollback: Option<ExecStep>,
    /// Allocations with plan lifetime.
    pub scope: MemScope,
    /// Scope of the result rows (outlives the plan).
    pub result_scope: MemScope,
    /// Buffer result tuples materialize into.
    pub hbno: HeapBufferNo,
    /// Every shard the plan touches.
    pub shards: Vec<Arc<Shard>>,
    pub touched: Vec<TupleTouch>,
    pub write: bool,
    pub stats: Mutex<ExecTimings>,
}

impl ExecPlan {
    /// Shards referenced by the leaf Fetch/Discard steps — by invariant the
    /// same set as [`ExecPlan::shards`].
    pub fn leaf_shards(&self) -> Vec<Arc<Shard>> {
        let mut out: Vec<Arc<Shard>> = Vec::new();
        for leaf in self.root.leaves() {
            if let Some(binding) = leaf.binding() {
                if !out.iter().any(|s| s.id == binding.shard.id) {
                    out.push(Arc::clone(&binding.shard));
                }
            }
        }
        out
    }

    pub fn has_commit_step(&self) -> bool {
        self.on_commit.is_some()
    }

    pub fn has_rollback_step(&self) -> bool {
        self.on_rollback.is_some()
    }

    pub fn stats(&self) -> ExecTimings {
        *self.stats.lock()
    }

    pub fn record_stats(&self, timings: ExecTimings) {
        self.stats.lock().absorb(timings);
    }
}

impl std::fmt::Debug for ExecPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecPlan")
            .field("write", &self.write)
            .field("shards", &self.shards.len())
            .field("touched", &self.touched.len())
            .finish()
    }
}
