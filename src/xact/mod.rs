//! Transactions: savepoints, flushing, multi-backend commit and rollback.
//!
//! A top transaction owns the connection map, the savepoint list, and a
//! dedicated heap buffer for the tuples it creates. Sub-transactions nest by
//! borrowing the top — they carry their own savepoints but never own
//! connections.
//!
//! Writes attach to exactly one savepoint (reads attach to none). Under
//! `Immediate` mode every write flushes as it is submitted; under `Deferred`
//! writes wait for an explicit flush, a read (which flushes first so it sees
//! its own transaction's writes), or commit.
//!
//! Commit issues `COMMIT` per connection in the map's insertion order —
//! stable within one attempt — and reports a partial commit as a structured
//! outcome rather than an unwind: savepoint flags stay consistent with the
//! set of connections that actually committed, and local tuple state syncs
//! only for those.
//!
//! The transaction's heap buffer intentionally outlives disposition so the
//! caller can read final tuple state; it closes with the context.

use std::sync::Arc;

use crate::context::Context;
use crate::exec::{self, ConnSet, ExecResult};
use crate::heap::{HeapBufferNo, HeapTuplePtr, TupleFlags};
use crate::mem::MemScope;
use crate::nodes::{NodeArena, NodeRef};
use crate::plan::{ExecPlan, PlannerOpts, TouchKind, plan_node};
use crate::schema::TableDef;
use crate::shard::ShardAccessId;
use crate::{Error, Result};

// ============================================================================
// Modes and savepoints
// ============================================================================

/// Write flushing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum XactMode {
    /// Every write flushes to the backend as it is submitted.
    Immediate,
    /// Writes buffer per savepoint until flush, read, or commit.
    Deferred,
}

/// The savepoint name for a global index. Stable across restarts: the name
/// is a pure function of the index.
pub fn savepoint_name(idx: u32) -> String {
    format!("VH_IO_XACT_SP_{idx}")
}

/// One checkpoint: its queued plans, the shard accesses it reached, and its
/// disposition flags.
pub struct Savepoint {
    pub idx: u32,
    pub name: String,
    pub accesses: Vec<ShardAccessId>,
    plans: Vec<ExecPlan>,
    flushed_plans: usize,
    pub flushed: bool,
    pub committed: bool,
    pub rolled_back: bool,
}

impl Savepoint {
    fn new(idx: u32) -> Self {
        Self {
            idx,
            name: savepoint_name(idx),
            accesses: Vec::new(),
            plans: Vec::new(),
            flushed_plans: 0,
            flushed: false,
            committed: false,
            rolled_back: false,
        }
    }
}

/// Post-disposition view of one savepoint.
#[derive(Debug, Clone)]
pub struct SavepointSummary {
    pub idx: u32,
    pub name: String,
    pub accesses: Vec<ShardAccessId>,
    pub flushed: bool,
    pub committed: bool,
    pub rolled_back: bool,
}

/// Structured commit result. A partial commit is data, not an error.
#[derive(Debug)]
pub struct CommitOutcome {
    /// Connections whose COMMIT succeeded, in issue order.
    pub committed: Vec<ShardAccessId>,
    /// The connection that failed, with its error.
    pub failed: Option<(ShardAccessId, Error)>,
    /// Connections never reached after the failure.
    pub uncommitted: Vec<ShardAccessId>,
    pub savepoints: Vec<SavepointSummary>,
}

impl CommitOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed.is_none() && self.uncommitted.is_empty()
    }
}

// ============================================================================
// Xact
// ============================================================================

/// A top-level transaction.
pub struct Xact {
    ctx: Arc<Context>,
    mode: XactMode,
    scope: MemScope,
    hbno: HeapBufferNo,
    conns: ConnSet,
    sps: Vec<Savepoint>,
    current_sp: Option<u32>,
    finished: bool,
}

impl Xact {
    /// Begin a transaction with a dedicated heap buffer tied to its scope.
    pub fn begin(ctx: Arc<Context>, mode: XactMode) -> Result<Self> {
        let scope = ctx.general_scope().child("xact");
        let hbno = ctx.heap().open(&scope, "xact")?;
        Ok(Self {
            ctx,
            mode,
            scope,
            hbno,
            conns: ConnSet::new(),
            sps: Vec::new(),
            current_sp: None,
            finished: false,
        })
    }

    pub fn mode(&self) -> XactMode {
        self.mode
    }

    /// The transaction's tuple buffer.
    pub fn buffer(&self) -> HeapBufferNo {
        self.hbno
    }

    pub fn scope(&self) -> &MemScope {
        &self.scope
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Allocate a fresh tuple of `table` in the transaction's buffer.
    pub fn create_tuple(&self, table: &Arc<TableDef>) -> Result<HeapTuplePtr> {
        let buffer = self.ctx.heap().get(self.hbno)?;
        buffer.alloc_tuple(&table.leading())
    }

    /// Open a nested sub-transaction borrowing this one.
    pub fn subxact(&mut self) -> SubXact<'_> {
        SubXact {
            top: self,
            local_sp: None,
        }
    }

    /// Savepoint state for inspection and invariant checks.
    pub fn savepoints(&self) -> Vec<SavepointSummary> {
        self.sps.iter().map(summarize).collect()
    }

    // ========================================================================
    // Submit
    // ========================================================================

    /// Submit a query. Reads flush pending writes first and execute
    /// directly, returning rows; writes attach to the current savepoint
    /// (flushing under `Immediate`) and return `None`.
    pub async fn submit(&mut self, arena: &NodeArena, root: NodeRef) -> Result<Option<ExecResult>> {
        let mut scratch = None;
        self.submit_inner(arena, root, &mut scratch).await
    }

    async fn submit_inner(
        &mut self,
        arena: &NodeArena,
        root: NodeRef,
        local_sp: &mut Option<u32>,
    ) -> Result<Option<ExecResult>> {
        self.check_open()?;

        if arena.kind(root).is_read() {
            if let Some(current) = self.current_sp {
                self.flush_through(current).await?;
            }

            let plan = self.plan(arena, root)?;
            let mut read_map = ConnSet::new();
            exec::acquire_plan_conns(&self.ctx, &plan, &mut self.conns, &mut read_map).await?;
            let result = exec::run_plan(&self.ctx, &plan, &mut self.conns, &mut read_map).await;
            // Read-only leases go back to the catalog as the call returns.
            drop(read_map);
            return result.map(Some);
        }

        let plan = self.plan(arena, root)?;
        let sp_idx = match self.current_sp {
            Some(idx) if !self.sps[idx as usize].flushed => idx,
            _ => {
                let idx = self.sps.len() as u32;
                self.sps.push(Savepoint::new(idx));
                self.current_sp = Some(idx);
                idx
            }
        };
        *local_sp = Some(sp_idx);
        self.sps[sp_idx as usize].plans.push(plan);

        if self.mode == XactMode::Immediate {
            self.flush_through(sp_idx).await?;
        }
        Ok(None)
    }

    fn plan(&self, arena: &NodeArena, root: NodeRef) -> Result<ExecPlan> {
        plan_node(
            &self.ctx,
            arena,
            root,
            PlannerOpts {
                result_scope: Some(self.scope.clone()),
                hbno: Some(self.hbno),
                ..PlannerOpts::default()
            },
        )
    }

    // ========================================================================
    // Flushing
    // ========================================================================

    /// Flush every savepoint up to and including `target`.
    pub async fn flush_through(&mut self, target: u32) -> Result<()> {
        self.check_open()?;
        if target as usize >= self.sps.len() {
            return Err(Error::TxFailure(format!("no savepoint {target}")));
        }

        for idx in 0..=target {
            let sp_idx = idx as usize;
            if self.sps[sp_idx].rolled_back {
                continue;
            }
            // Plans queue while a savepoint drains; walk by index.
            while self.sps[sp_idx].flushed_plans < self.sps[sp_idx].plans.len() {
                let plan_idx = self.sps[sp_idx].flushed_plans;

                // Put connections: new write accesses join the shared map
                // with a backend transaction begun.
                {
                    let plan = &self.sps[sp_idx].plans[plan_idx];
                    let mut no_reads = ConnSet::new();
                    exec::acquire_plan_conns(&self.ctx, plan, &mut self.conns, &mut no_reads)
                        .await?;
                    debug_assert!(no_reads.is_empty());
                }

                // A connection seeing this savepoint for the first time gets
                // the SAVEPOINT command.
                let accesses: Vec<ShardAccessId> = {
                    let plan = &self.sps[sp_idx].plans[plan_idx];
                    plan.root
                        .leaves()
                        .iter()
                        .filter_map(|leaf| leaf.binding())
                        .filter_map(|b| b.shard.write_access().ok())
                        .map(|a| a.id())
                        .collect()
                };
                let sp_name = self.sps[sp_idx].name.clone();
                for id in &accesses {
                    if !self.sps[sp_idx].accesses.contains(id) {
                        self.sps[sp_idx].accesses.push(*id);
                    }
                    let entry = self.conns.get_mut(*id).ok_or_else(|| {
                        Error::Invariant("flushed plan lost its connection".into())
                    })?;
                    if !entry.savepoints.contains(&idx) {
                        if entry.lease.access().backend.supports_savepoints() {
                            entry.lease.conn().savepoint(&sp_name).await?;
                        }
                        entry.savepoints.push(idx);
                    }
                }

                // Run and sync local tuple state.
                let plan = &self.sps[sp_idx].plans[plan_idx];
                let mut no_reads = ConnSet::new();
                exec::run_plan(&self.ctx, plan, &mut self.conns, &mut no_reads).await?;
                self.sync_after_flush(plan_idx, sp_idx)?;

                self.sps[sp_idx].flushed_plans += 1;
            }
            self.sps[sp_idx].flushed = true;
        }
        Ok(())
    }

    /// After a plan flushes: inserted and updated tuples re-baseline their
    /// shadows; deletes flag the tuple.
    fn sync_after_flush(&self, plan_idx: usize, sp_idx: usize) -> Result<()> {
        let plan = &self.sps[sp_idx].plans[plan_idx];
        for touch in &plan.touched {
            let buffer = self.ctx.heap().buffer_of(touch.htp)?;
            buffer.with_tuple_mut(touch.htp, |tuple, _| {
                match touch.kind {
                    TouchKind::Insert | TouchKind::Update => {
                        tuple.clear_changed();
                        tuple.flags.insert(TupleFlags::FETCHED);
                        // Re-baseline the immutable copy so the next update
                        // diffs against the flushed state.
                        tuple.snapshot();
                    }
                    TouchKind::Delete => {
                        tuple.flags.insert(TupleFlags::DELETED);
                    }
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    // ========================================================================
    // Rollback to a savepoint
    // ========================================================================

    /// Roll back every savepoint at `target` and above, on the backends and
    /// locally.
    pub async fn rollback_to(&mut self, target: u32) -> Result<()> {
        self.check_open()?;
        if target as usize >= self.sps.len() {
            return Err(Error::TxFailure(format!("no savepoint {target}")));
        }

        // Backend side: per connection, roll back to the least savepoint at
        // or above the target that the connection saw.
        for (_, entry) in self.conns.iter_mut() {
            let least = entry
                .savepoints
                .iter()
                .filter(|idx| **idx >= target)
                .min()
                .copied();
            if let Some(least) = least {
                if entry.lease.access().backend.supports_savepoints() {
                    entry.lease.conn().rollback_to(&savepoint_name(least)).await?;
                }
                // The landed-on savepoint survives; later ones are gone.
                entry.savepoints.retain(|idx| *idx <= least);
            }
        }

        // Local side, newest savepoint first so update restores precede
        // insert unwinds.
        for sp_idx in (target as usize..self.sps.len()).rev() {
            let restore: Vec<_> = self.sps[sp_idx]
                .plans
                .iter()
                .flat_map(|p| p.touched.iter().copied())
                .collect();
            for touch in restore.iter().rev() {
                self.unwind_touch(touch)?;
            }
            self.sps[sp_idx].rolled_back = true;
        }

        self.current_sp = None;
        Ok(())
    }

    fn unwind_touch(&self, touch: &crate::plan::TupleTouch) -> Result<()> {
        let buffer = self.ctx.heap().buffer_of(touch.htp)?;
        buffer.with_tuple_mut(touch.htp, |tuple, _| {
            match touch.kind {
                TouchKind::Update => {
                    tuple.restore_shadow();
                    tuple.clear_changed();
                }
                TouchKind::Insert => {
                    tuple.flags.insert(TupleFlags::DELETED);
                    tuple.flags.remove(TupleFlags::FETCHED);
                }
                TouchKind::Delete => {
                    tuple.flags.remove(TupleFlags::DELETED);
                }
            }
            Ok(())
        })
    }

    // ========================================================================
    // Commit / rollback
    // ========================================================================

    /// Flush what remains and commit every connection in insertion order.
    pub async fn commit(mut self) -> Result<CommitOutcome> {
        self.check_open()?;
        if let Some(last) = self.sps.len().checked_sub(1) {
            self.flush_through(last as u32).await?;
        }

        let mut committed: Vec<ShardAccessId> = Vec::new();
        let mut failed: Option<(ShardAccessId, Error)> = None;
        let mut uncommitted: Vec<ShardAccessId> = Vec::new();

        for (id, entry) in self.conns.iter_mut() {
            if !entry.began {
                continue;
            }
            if failed.is_some() {
                uncommitted.push(id);
                continue;
            }
            match entry.lease.conn().commit().await {
                Ok(()) => {
                    entry.committed = true;
                    committed.push(id);
                }
                Err(err) => {
                    // Partial commit is a structured outcome, not an unwind;
                    // queue the record and keep going.
                    let _ = crate::raise!(
                        crate::diag::DiagLevel::Error1,
                        "commit failed on access {}: {err}",
                        id.0
                    );
                    failed = Some((id, err));
                }
            }
        }

        // Two-phase cleanup where a driver supports it: connections that
        // prepared but never committed roll their prepared state back.
        if failed.is_some() {
            for (id, entry) in self.conns.iter_mut() {
                if !entry.committed && entry.began {
                    let supports = entry.lease.access().backend.supports_two_phase();
                    if supports {
                        if let Err(err) = entry.lease.conn().two_phase_rollback().await {
                            tracing::warn!(access = id.0, error = %err, "two-phase rollback failed");
                        }
                    }
                }
            }
        }

        // Savepoint flags follow their connections; local state syncs only
        // for fully committed savepoints.
        for sp in &mut self.sps {
            if sp.rolled_back {
                continue;
            }
            let all_committed = !sp.accesses.is_empty()
                && sp.accesses.iter().all(|id| committed.contains(id));
            if all_committed {
                sp.committed = true;
            }
        }
        let commit_sync: Vec<_> = self
            .sps
            .iter()
            .filter(|sp| sp.committed)
            .flat_map(|sp| sp.plans.iter())
            .flat_map(|p| p.touched.iter().copied())
            .collect();
        for touch in commit_sync {
            let buffer = self.ctx.heap().buffer_of(touch.htp)?;
            buffer.with_tuple_mut(touch.htp, |tuple, _| {
                tuple.clear_changed();
                tuple.drop_shadow();
                Ok(())
            })?;
        }

        let outcome = CommitOutcome {
            committed,
            failed,
            uncommitted,
            savepoints: self.sps.iter().map(summarize).collect(),
        };
        self.finished = true;
        // Dropping the entries returns every lease to the catalog.
        self.conns.drain();
        Ok(outcome)
    }

    /// Roll back every connection and restore local tuple state.
    pub async fn rollback(mut self) -> Result<Vec<SavepointSummary>> {
        self.check_open()?;

        for (id, entry) in self.conns.iter_mut() {
            if !entry.began {
                continue;
            }
            if let Err(err) = entry.lease.conn().rollback().await {
                tracing::warn!(access = id.0, error = %err, "rollback failed on connection");
            } else {
                entry.rolled_back = true;
            }
        }

        for sp_idx in (0..self.sps.len()).rev() {
            if self.sps[sp_idx].committed {
                continue;
            }
            let restore: Vec<_> = self.sps[sp_idx]
                .plans
                .iter()
                .flat_map(|p| p.touched.iter().copied())
                .collect();
            for touch in restore.iter().rev() {
                self.unwind_touch(touch)?;
            }
            self.sps[sp_idx].rolled_back = true;
        }

        let summary = self.sps.iter().map(summarize).collect();
        self.finished = true;
        self.conns.drain();
        Ok(summary)
    }

    fn check_open(&self) -> Result<()> {
        if self.finished {
            return Err(Error::TxFailure("transaction already finished".into()));
        }
        Ok(())
    }
}

impl Drop for Xact {
    fn drop(&mut self) {
        if !self.finished && !self.sps.is_empty() {
            tracing::warn!(
                savepoints = self.sps.len(),
                "transaction dropped without commit or rollback; backend state is undisposed"
            );
        }
    }
}

fn summarize(sp: &Savepoint) -> SavepointSummary {
    SavepointSummary {
        idx: sp.idx,
        name: sp.name.clone(),
        accesses: sp.accesses.clone(),
        flushed: sp.flushed,
        committed: sp.committed,
        rolled_back: sp.rolled_back,
    }
}

// ============================================================================
// SubXact
// ============================================================================

/// A nested transaction. Holds its own savepoint; connections stay with the
/// top.
pub struct SubXact<'a> {
    top: &'a mut Xact,
    local_sp: Option<u32>,
}

impl SubXact<'_> {
    pub fn create_tuple(&self, table: &Arc<TableDef>) -> Result<HeapTuplePtr> {
        self.top.create_tuple(table)
    }

    pub async fn submit(
        &mut self,
        arena: &NodeArena,
        root: NodeRef,
    ) -> Result<Option<ExecResult>> {
        let mut local = self.local_sp;
        let result = self.top.submit_inner(arena, root, &mut local).await;
        self.local_sp = local;
        result
    }

    /// Commit the sub-transaction: flush its savepoint into the enclosing
    /// backend transaction. Durability still waits on the top commit.
    pub async fn commit(self) -> Result<()> {
        if let Some(idx) = self.local_sp {
            self.top.flush_through(idx).await?;
        }
        Ok(())
    }

    /// Roll back the sub-transaction's savepoint (and any later ones).
    pub async fn rollback(self) -> Result<()> {
        if let Some(idx) = self.local_sp {
            self.top.rollback_to(idx).await?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_savepoint_names_stable() {
        assert_eq!(savepoint_name(0), "VH_IO_XACT_SP_0");
        assert_eq!(savepoint_name(17), "VH_IO_XACT_SP_17");
        // Same index, same name, no process state involved.
        assert_eq!(savepoint_name(3), savepoint_name(3));
    }

    #[test]
    fn test_outcome_clean() {
        let outcome = CommitOutcome {
            committed: vec![ShardAccessId(1)],
            failed: None,
            uncommitted: Vec::new(),
            savepoints: Vec::new(),
        };
        assert!(outcome.is_clean());
    }
}
