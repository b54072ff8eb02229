//! The executor: walks an ExecStep tree, drives backend connections, and
//! funnels rows through the collector pipeline.
//!
//! Steps form a tree with child lists (a Funnel's fetches) and forward
//! links (sequenced writes). Execution visits the bottom-left leaf first,
//! exactly the order the planner laid the statements out in.
//!
//! Connection handling follows the transaction contract: write leaves move
//! their lease into the caller's shared connection set (starting a backend
//! transaction on first touch); read leaves park leases in a per-call read
//! set that drains when the call returns.

pub mod collect;

use std::sync::Arc;

use crate::backend::{BackendExecPlan, CollectorHandle, ExecTimings};
use crate::context::Context;
use crate::plan::{ExecPlan, PlannedStmt, PlannedStmtShard, StmtAction};
use crate::shard::ShardAccessId;
use crate::shard::conncat::ConnLease;
use crate::{Error, Result};

use collect::{IndexCollector, NullCollector, ReturningCollector, RowSet, SListCollector};

// ============================================================================
// ExecStep
// ============================================================================

/// Step payloads.
pub enum StepKind {
    /// Execute and drop any results.
    Discard {
        stmt: Arc<PlannedStmt>,
        binding: PlannedStmtShard,
    },
    /// Execute, materialize tuples, collect.
    Fetch {
        stmt: Arc<PlannedStmt>,
        binding: PlannedStmtShard,
    },
    /// Merge child fetches into one result stream.
    Funnel,
    /// Reserved tag; the planner never builds one.
    CommitHeapTups,
}

/// A node of the executor's plan tree.
pub struct ExecStep {
    pub kind: StepKind,
    pub children: Vec<ExecStep>,
    pub forward: Option<Box<ExecStep>>,
}

impl ExecStep {
    pub fn fetch(stmt: Arc<PlannedStmt>, binding: PlannedStmtShard) -> Self {
        Self {
            kind: StepKind::Fetch { stmt, binding },
            children: Vec::new(),
            forward: None,
        }
    }

    pub fn discard(stmt: Arc<PlannedStmt>, binding: PlannedStmtShard) -> Self {
        Self {
            kind: StepKind::Discard { stmt, binding },
            children: Vec::new(),
            forward: None,
        }
    }

    pub fn funnel(children: Vec<ExecStep>) -> Self {
        Self {
            kind: StepKind::Funnel,
            children,
            forward: None,
        }
    }

    /// Append a step to the end of this step's forward chain.
    pub fn push_forward(&mut self, step: ExecStep) {
        match self.forward.as_mut() {
            Some(next) => next.push_forward(step),
            None => self.forward = Some(Box::new(step)),
        }
    }

    pub fn binding(&self) -> Option<&PlannedStmtShard> {
        match &self.kind {
            StepKind::Fetch { binding, .. } | StepKind::Discard { binding, .. } => Some(binding),
            _ => None,
        }
    }

    pub fn stmt(&self) -> Option<&Arc<PlannedStmt>> {
        match &self.kind {
            StepKind::Fetch { stmt, .. } | StepKind::Discard { stmt, .. } => Some(stmt),
            _ => None,
        }
    }

    /// Leaf steps in execution order: children bottom-up, then self, then
    /// the forward chain.
    pub fn leaves(&self) -> Vec<&ExecStep> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a ExecStep>) {
        for child in &self.children {
            child.collect_leaves(out);
        }
        if matches!(self.kind, StepKind::Fetch { .. } | StepKind::Discard { .. }) {
            out.push(self);
        }
        if let Some(fwd) = &self.forward {
            fwd.collect_leaves(out);
        }
    }
}

impl std::fmt::Debug for ExecStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match &self.kind {
            StepKind::Discard { .. } => "Discard",
            StepKind::Fetch { .. } => "Fetch",
            StepKind::Funnel => "Funnel",
            StepKind::CommitHeapTups => "CommitHeapTups",
        };
        f.debug_struct("ExecStep")
            .field("kind", &tag)
            .field("children", &self.children.len())
            .field("forward", &self.forward.is_some())
            .finish()
    }
}

// ============================================================================
// Connection sets
// ============================================================================

/// One pooled connection plus its transaction bookkeeping.
pub struct ConnEntry {
    pub lease: ConnLease,
    pub began: bool,
    /// Savepoint indexes issued on this connection, in order.
    pub savepoints: Vec<u32>,
    pub committed: bool,
    pub rolled_back: bool,
}

/// Insertion-ordered map of shard-access id to connection entry. Iteration
/// order is stable within one commit attempt.
#[derive(Default)]
pub struct ConnSet {
    entries: Vec<(ShardAccessId, ConnEntry)>,
}

impl ConnSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: ShardAccessId) -> bool {
        self.entries.iter().any(|(key, _)| *key == id)
    }

    pub fn get_mut(&mut self, id: ShardAccessId) -> Option<&mut ConnEntry> {
        self.entries
            .iter_mut()
            .find(|(key, _)| *key == id)
            .map(|(_, entry)| entry)
    }

    pub fn insert(&mut self, id: ShardAccessId, entry: ConnEntry) {
        debug_assert!(!self.contains(id));
        self.entries.push((id, entry));
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ShardAccessId, &mut ConnEntry)> {
        self.entries.iter_mut().map(|(id, entry)| (*id, entry))
    }

    pub fn drain(&mut self) -> Vec<(ShardAccessId, ConnEntry)> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Walk a plan's leaves and make sure a connection exists for each distinct
/// shard access. Writes move into `shared` with a backend transaction
/// begun; reads park in `read_map` for release when the call completes.
pub async fn acquire_plan_conns(
    ctx: &Context,
    plan: &ExecPlan,
    shared: &mut ConnSet,
    read_map: &mut ConnSet,
) -> Result<()> {
    for leaf in plan.root.leaves() {
        let binding = leaf
            .binding()
            .ok_or_else(|| Error::Invariant("leaf step without a binding".into()))?;
        let access = if plan.write {
            binding.shard.write_access()?
        } else {
            binding.shard.read_access()?
        };
        let id = access.id();
        if shared.contains(id) || read_map.contains(id) {
            continue;
        }

        let lease = ctx.connections().get(access).await?;
        let mut entry = ConnEntry {
            lease,
            began: false,
            savepoints: Vec::new(),
            committed: false,
            rolled_back: false,
        };

        if plan.write {
            entry.lease.conn().begin().await?;
            entry.began = true;
            shared.insert(id, entry);
        } else {
            read_map.insert(id, entry);
        }
    }
    Ok(())
}

// ============================================================================
// ExecResult
// ============================================================================

/// What execution hands back to the caller: the result rows (lazy tuple
/// pointers into the result buffer) and the measured timings.
pub struct ExecResult {
    pub rows: RowSet,
    pub timings: ExecTimings,
}

impl ExecResult {
    pub fn empty() -> Self {
        Self {
            rows: RowSet::new(),
            timings: ExecTimings::default(),
        }
    }
}

impl std::fmt::Debug for ExecResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecResult")
            .field("rows", &self.rows.len())
            .field("qexec_ns", &self.timings.qexec_ns)
            .finish()
    }
}

// ============================================================================
// Running a plan
// ============================================================================

fn conn_for<'a>(
    shared: &'a mut ConnSet,
    read_map: &'a mut ConnSet,
    id: ShardAccessId,
) -> Result<&'a mut ConnEntry> {
    if shared.contains(id) {
        return shared
            .get_mut(id)
            .ok_or_else(|| Error::Invariant("connection vanished from the shared map".into()));
    }
    read_map.get_mut(id).ok_or_else(|| {
        Error::Invariant("no connection acquired for a planned shard access".into())
    })
}

/// Execute the plan's step tree. Connections must already be acquired via
/// [`acquire_plan_conns`] into the two sets.
pub async fn run_plan(
    ctx: &Context,
    plan: &ExecPlan,
    shared: &mut ConnSet,
    read_map: &mut ConnSet,
) -> Result<ExecResult> {
    let mut rows = RowSet::new();
    let mut timings = ExecTimings::default();

    for leaf in plan.root.leaves() {
        let stmt = leaf.stmt().expect("leaves carry statements");
        let binding = leaf.binding().expect("leaves carry bindings");
        let access = if plan.write {
            binding.shard.write_access()?
        } else {
            binding.shard.read_access()?
        };
        let entry = conn_for(shared, read_map, access.id())?;

        let step_timings = match &leaf.kind {
            StepKind::Discard { .. } => {
                let exec_plan = BackendExecPlan {
                    ctx,
                    stmt,
                    binding,
                    work_scope: &plan.scope,
                    result_scope: &plan.result_scope,
                    collector: None,
                };
                entry.lease.conn().execute(exec_plan).await?
            }
            StepKind::Fetch { .. } => {
                let returning = matches!(stmt.action, StmtAction::Insert { .. })
                    && !stmt.returning.is_empty();
                if returning {
                    let table = ctx
                        .tables()
                        .by_name(&stmt.arena.target_table(stmt.root)?)?;
                    let mut sink = ReturningCollector::new(
                        &binding.tuples,
                        &stmt.returning,
                        table.leading(),
                    );
                    let exec_plan = BackendExecPlan {
                        ctx,
                        stmt,
                        binding,
                        work_scope: &plan.scope,
                        result_scope: &plan.result_scope,
                        collector: Some(CollectorHandle {
                            hbno: plan.hbno,
                            rtups: 1,
                            est_rows: binding.tuples.len(),
                            sink: &mut sink,
                        }),
                    };
                    entry.lease.conn().execute(exec_plan).await?
                } else if matches!(stmt.action, StmtAction::Select) {
                    let rtups = stmt.rtups();
                    let mut slist = SListCollector::new(&mut rows);
                    if stmt.dedup.is_empty() {
                        let exec_plan = BackendExecPlan {
                            ctx,
                            stmt,
                            binding,
                            work_scope: &plan.scope,
                            result_scope: &plan.result_scope,
                            collector: Some(CollectorHandle {
                                hbno: plan.hbno,
                                rtups,
                                est_rows: 0,
                                sink: &mut slist,
                            }),
                        };
                        entry.lease.conn().execute(exec_plan).await?
                    } else {
                        let mut dedup = IndexCollector::new(stmt.dedup.clone(), &mut slist);
                        let exec_plan = BackendExecPlan {
                            ctx,
                            stmt,
                            binding,
                            work_scope: &plan.scope,
                            result_scope: &plan.result_scope,
                            collector: Some(CollectorHandle {
                                hbno: plan.hbno,
                                rtups,
                                est_rows: 0,
                                sink: &mut dedup,
                            }),
                        };
                        entry.lease.conn().execute(exec_plan).await?
                    }
                } else {
                    // Writes without RETURNING behave like discards with a
                    // null collector.
                    let mut sink = NullCollector;
                    let exec_plan = BackendExecPlan {
                        ctx,
                        stmt,
                        binding,
                        work_scope: &plan.scope,
                        result_scope: &plan.result_scope,
                        collector: Some(CollectorHandle {
                            hbno: plan.hbno,
                            rtups: 1,
                            est_rows: 0,
                            sink: &mut sink,
                        }),
                    };
                    entry.lease.conn().execute(exec_plan).await?
                }
            }
            StepKind::Funnel | StepKind::CommitHeapTups => ExecTimings::default(),
        };
        timings.absorb(step_timings);
    }

    plan.record_stats(timings);
    tracing::debug!(
        rows = timings.rows,
        qexec_ns = timings.qexec_ns,
        "plan executed"
    );

    Ok(ExecResult { rows, timings })
}

// ============================================================================
// Tests
// ============================================================================
