//! The planner: query node trees to execution plans.
//!
//! Per action:
//!
//! - **Select** — collect the FROM/JOIN tables, resolve shards through each
//!   table's beacon, then pick the shape: one Fetch for a single shard, a
//!   Funnel of per-shard Fetches for one beacon spanning shards of one
//!   backend, and an error for cross-beacon or cross-backend reads (a
//!   join-above-funnel strategy would slot in here).
//! - **Insert** — group tuples by identical null bitmap (and shard); each
//!   group becomes one statement whose target columns are the non-null
//!   fields and whose RETURNING columns are the null ones, so backend
//!   defaults flow back. Groups past four rows promote to the bulk action.
//! - **Update** — explicit set-field nodes when given, otherwise the
//!   changed-field diff against each tuple's immutable copy.
//! - **Delete** — by primary key per tuple.
//! - **DDL** — a single Discard step.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{BackendAdapter, ExecTimings, Parameter};
use crate::context::Context;
use crate::exec::ExecStep;
use crate::heap::{HeapBufferNo, HeapTuplePtr};
use crate::mem::MemScope;
use crate::nodes::{NodeArena, NodeKind, NodeRef};
use crate::schema::{HeapField, TableDef};
use crate::shard::Shard;
use crate::value::TypedSlot;
use crate::{Error, Result};

use super::projection;
use super::{DedupSpec, ExecPlan, PlannedStmt, PlannedStmtShard, PlannerOpts, StmtAction, TouchKind, TupleTouch};

/// Insert groups larger than this promote to the bulk action.
const BULK_INSERT_THRESHOLD: usize = 4;

// ============================================================================
// Entry point
// ============================================================================

/// Plan a query node tree.
pub fn plan_node(
    ctx: &Context,
    arena: &NodeArena,
    root: NodeRef,
    opts: PlannerOpts,
) -> Result<ExecPlan> {
    let scope = ctx.general_scope().child("eplan");
    let result_scope = opts
        .result_scope
        .clone()
        .unwrap_or_else(|| ctx.general_scope().clone());
    let hbno = match opts.hbno {
        Some(hbno) => hbno,
        None => ctx.general_buffer()?,
    };

    match arena.kind(root) {
        NodeKind::Select => plan_select(ctx, arena, root, &opts, scope, result_scope, hbno),
        NodeKind::Insert { table, tuples } => plan_insert(
            ctx,
            arena,
            root,
            &opts,
            table,
            tuples,
            scope,
            result_scope,
            hbno,
        ),
        NodeKind::Update { table, tuples } => plan_update(
            ctx,
            arena,
            root,
            &opts,
            table,
            tuples,
            scope,
            result_scope,
            hbno,
        ),
        NodeKind::Delete { table, tuples } => plan_delete(
            ctx,
            arena,
            root,
            &opts,
            table,
            tuples,
            scope,
            result_scope,
            hbno,
        ),
        NodeKind::Ddl { .. } => plan_ddl(ctx, arena, root, &opts, scope, result_scope, hbno),
        other => Err(Error::PlanError(format!(
            "node {other:?} is not a plannable query root"
        ))),
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

fn backend_of(shard: &Arc<Shard>, write: bool) -> Result<Arc<dyn BackendAdapter>> {
    let access = if write {
        shard.write_access()?
    } else {
        shard.read_access()?
    };
    Ok(Arc::clone(&access.backend))
}

/// Extract the ordered parameter list for an emitted statement, resolving
/// `Const` nodes through the backend and `Param` nodes through the caller's
/// bindings.
fn node_params(
    backend: &dyn BackendAdapter,
    arena: &NodeArena,
    sources: &[Option<NodeRef>],
    bound: &[TypedSlot],
) -> Result<Vec<Parameter>> {
    let mut params = Vec::with_capacity(sources.len());
    for source in sources {
        let node = source.ok_or_else(|| {
            Error::PlanError("anonymous placeholder in a node-emitted statement".into())
        })?;
        match arena.kind(node) {
            NodeKind::Const(slot) => params.push(backend.param(slot.stack(), slot)?),
            NodeKind::Param(index) => {
                let slot = bound.get(*index as usize).ok_or_else(|| {
                    Error::UserInput(format!("no binding for parameter ${index}"))
                })?;
                params.push(backend.param(slot.stack(), slot)?);
            }
            other => {
                return Err(Error::PlanError(format!(
                    "placeholder fed by non-constant node {other:?}"
                )));
            }
        }
    }
    Ok(params)
}

fn field_param(
    ctx: &Context,
    backend: &dyn BackendAdapter,
    htp: HeapTuplePtr,
    field: &Arc<HeapField>,
) -> Result<Parameter> {
    let buffer = ctx.heap().buffer_of(htp)?;
    let slot = buffer.with_tuple(htp, |t| t.get(field))?;
    backend.param(&field.stack, &slot)
}

#[allow(clippy::too_many_arguments)]
fn build_plan(
    root: ExecStep,
    scope: MemScope,
    result_scope: MemScope,
    hbno: HeapBufferNo,
    shards: Vec<Arc<Shard>>,
    touched: Vec<TupleTouch>,
    write: bool,
) -> ExecPlan {
    ExecPlan {
        root,
        on_commit: None,
        on_rollback: None,
        scope,
        result_scope,
        hbno,
        shards,
        touched,
        write,
        stats: Mutex::new(ExecTimings::default()),
    }
}

// ============================================================================
// Select
// ============================================================================

#[allow(clippy::too_many_arguments)]
fn plan_select(
    ctx: &Context,
    arena: &NodeArena,
    root: NodeRef,
    opts: &PlannerOpts,
    scope: MemScope,
    result_scope: MemScope,
    hbno: HeapBufferNo,
) -> Result<ExecPlan> {
    let names = arena.select_tables(root);
    if names.is_empty() {
        return Err(Error::UserInput("select has no FROM".into()));
    }
    let tables: Vec<Arc<TableDef>> = names
        .iter()
        .map(|n| ctx.tables().by_name(n))
        .collect::<Result<_>>()?;
    let late_binding = tables.iter().any(|t| t.is_late_binding());

    // Resolve shards: the driving table's beacon fans out; every joined
    // table must agree.
    let shards: Vec<Arc<Shard>> = match &opts.forced_shard {
        Some(shard) => vec![Arc::clone(shard)],
        None => {
            let driving_beacon = tables[0].beacon()?;
            let shards = driving_beacon.shards_for_table(&tables[0])?;
            for table in &tables[1..] {
                let beacon = table.beacon()?;
                if Arc::ptr_eq(&beacon, &driving_beacon) {
                    continue;
                }
                let theirs = beacon.shards_for_table(table)?;
                let same_single_shard =
                    shards.len() == 1 && theirs.len() == 1 && shards[0].id == theirs[0].id;
                if !same_single_shard {
                    return Err(Error::PlanError(format!(
                        "cross-beacon select over '{}' and '{}' is not supported",
                        tables[0].name, table.name
                    )));
                }
            }
            shards
        }
    };

    // One backend per plan; a funnel never spans drivers.
    let backend = backend_of(&shards[0], false)?;
    for shard in &shards[1..] {
        if !Arc::ptr_eq(&backend, &backend_of(shard, false)?) {
            return Err(Error::PlanError(
                "cross-backend select is not supported".into(),
            ));
        }
    }

    let mut stmt_arena = NodeArena::new();
    let stmt_root = arena.copy_subtree_into(root, &mut stmt_arena);
    let sql = backend.command(&stmt_arena, stmt_root)?;
    let params = node_params(&*backend, &stmt_arena, &sql.params, &opts.params)?;

    let resolved = if late_binding {
        None
    } else {
        Some(projection::resolve(&*backend, &tables)?)
    };

    let dedup = opts
        .dedup
        .iter()
        .map(|name| {
            let index = tables
                .iter()
                .position(|t| &t.name == name)
                .ok_or_else(|| {
                    Error::UserInput(format!("dedup table '{name}' is not in the select"))
                })?;
            let tdv = tables[index].leading();
            let fields = if tdv.primary_key().is_empty() {
                tdv.fields().to_vec()
            } else {
                tdv.pk_fields()
            };
            Ok(DedupSpec {
                table_index: index as u16,
                fields,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let stmt = Arc::new(PlannedStmt {
        action: StmtAction::Select,
        sql,
        arena: stmt_arena,
        root: stmt_root,
        projection: Mutex::new(resolved),
        late_binding,
        columns: Vec::new(),
        returning: Vec::new(),
        key_columns: Vec::new(),
        rows: 0,
        dedup,
    });

    let step = if shards.len() == 1 {
        ExecStep::fetch(
            Arc::clone(&stmt),
            PlannedStmtShard {
                shard: Arc::clone(&shards[0]),
                params,
                tuples: Vec::new(),
            },
        )
    } else {
        // One template, one binding per shard.
        let children = shards
            .iter()
            .map(|shard| {
                ExecStep::fetch(
                    Arc::clone(&stmt),
                    PlannedStmtShard {
                        shard: Arc::clone(shard),
                        params: params.clone(),
                        tuples: Vec::new(),
                    },
                )
            })
            .collect();
        ExecStep::funnel(children)
    };

    tracing::debug!(
        tables = names.len(),
        shards = shards.len(),
        late_binding,
        "planned select"
    );
    Ok(build_plan(
        step,
        scope,
        result_scope,
        hbno,
        shards,
        Vec::new(),
        false,
    ))
}

// ============================================================================
// Insert
// ============================================================================

#[allow(clippy::too_many_arguments)]
fn plan_insert(
    ctx: &Context,
    _arena: &NodeArena,
    _root: NodeRef,
    opts: &PlannerOpts,
    table: &str,
    tuples: &[HeapTuplePtr],
    scope: MemScope,
    result_scope: MemScope,
    hbno: HeapBufferNo,
) -> Result<ExecPlan> {
    if tuples.is_empty() {
        return Err(Error::UserInput("insert with no tuples".into()));
    }
    let def = ctx.tables().by_name(table)?;
    let tdv = def.leading();

    // Group by (shard, null bitmap), preserving first-seen order.
    struct Group {
        shard: Arc<Shard>,
        bitmap: Vec<u8>,
        tuples: Vec<HeapTuplePtr>,
    }
    let mut groups: Vec<Group> = Vec::new();
    for htp in tuples {
        let shard = match &opts.forced_shard {
            Some(shard) => Arc::clone(shard),
            None => def.beacon()?.shard_for_tuple(ctx, *htp, true)?,
        };
        let bitmap = ctx
            .heap()
            .buffer_of(*htp)?
            .with_tuple(*htp, |t| Ok(t.null_bitmap().to_vec()))?;
        if bitmap.len() != tdv.null_bytes() {
            return Err(Error::SchemaMismatch(format!(
                "tuple bitmap of {} bytes against a {}-byte definition",
                bitmap.len(),
                tdv.null_bytes()
            )));
        }
        match groups
            .iter_mut()
            .find(|g| g.shard.id == shard.id && g.bitmap == bitmap)
        {
            Some(group) => group.tuples.push(*htp),
            None => groups.push(Group {
                shard,
                bitmap,
                tuples: vec![*htp],
            }),
        }
    }

    let mut shards: Vec<Arc<Shard>> = Vec::new();
    let mut root_step: Option<ExecStep> = None;

    for group in &groups {
        let backend = backend_of(&group.shard, true)?;

        // Non-null fields are the target columns; null fields come back via
        // RETURNING so backend defaults land in the tuple.
        let mut columns = Vec::new();
        let mut returning = Vec::new();
        for field in tdv.fields() {
            let bit = group.bitmap[field.null_ordinal as usize / 8]
                & (1 << (field.null_ordinal as usize % 8));
            if bit == 0 {
                columns.push(field.name.clone());
            } else {
                returning.push(field.name.clone());
            }
        }
        if columns.is_empty() {
            return Err(Error::UserInput(format!(
                "insert into '{table}' with every column null"
            )));
        }

        let sql = backend.command_insert(table, &columns, group.tuples.len(), &returning)?;

        let mut params = Vec::with_capacity(group.tuples.len() * columns.len());
        for htp in &group.tuples {
            for name in &columns {
                let field = tdv.field_by_name(name)?;
                params.push(field_param(ctx, &*backend, *htp, field)?);
            }
        }

        let resolved = if returning.is_empty() {
            None
        } else {
            Some(projection::resolve_columns(&*backend, &def, &returning)?)
        };

        let stmt = Arc::new(PlannedStmt {
            action: StmtAction::Insert {
                bulk: group.tuples.len() > BULK_INSERT_THRESHOLD,
            },
            sql,
            arena: {
                let mut arena = NodeArena::new();
                let _ = crate::nodes::build::insert(&mut arena, table, group.tuples.clone());
                arena
            },
            root: NodeRef(0),
            projection: Mutex::new(resolved),
            late_binding: false,
            columns,
            returning,
            key_columns: Vec::new(),
            rows: group.tuples.len(),
            dedup: Vec::new(),
        });

        let step = ExecStep::fetch(
            Arc::clone(&stmt),
            PlannedStmtShard {
                shard: Arc::clone(&group.shard),
                params,
                tuples: group.tuples.clone(),
            },
        );
        match root_step.as_mut() {
            Some(root) => root.push_forward(step),
            None => root_step = Some(step),
        }
        if !shards.iter().any(|s| s.id == group.shard.id) {
            shards.push(Arc::clone(&group.shard));
        }
    }

    let touched = tuples
        .iter()
        .map(|htp| TupleTouch {
            htp: *htp,
            kind: TouchKind::Insert,
        })
        .collect();

    tracing::debug!(groups = groups.len(), tuples = tuples.len(), "planned insert");
    Ok(build_plan(
        root_step.expect("at least one group"),
        scope,
        result_scope,
        hbno,
        shards,
        touched,
        true,
    ))
}

// ============================================================================
// Update
// ============================================================================

#[allow(clippy::too_many_arguments)]
fn plan_update(
    ctx: &Context,
    arena: &NodeArena,
    root: NodeRef,
    opts: &PlannerOpts,
    table: &str,
    tuples: &[HeapTuplePtr],
    scope: MemScope,
    result_scope: MemScope,
    hbno: HeapBufferNo,
) -> Result<ExecPlan> {
    if tuples.is_empty() {
        return Err(Error::UserInput("update with no tuples".into()));
    }
    let def = ctx.tables().by_name(table)?;
    let tdv = def.leading();
    if tdv.primary_key().is_empty() {
        return Err(Error::PlanError(format!(
            "update of '{table}' requires a primary key"
        )));
    }
    let key_fields = tdv.pk_fields();
    let key_columns: Vec<String> = key_fields.iter().map(|f| f.name.clone()).collect();

    // Explicit set-field nodes override the shadow diff.
    let explicit: Vec<(String, TypedSlot)> = arena
        .children_where(root, |k| matches!(k, NodeKind::UpdateField { .. }))
        .into_iter()
        .map(|uf| {
            let NodeKind::UpdateField { name } = arena.kind(uf) else {
                unreachable!()
            };
            let value = arena
                .children(uf)
                .first()
                .copied()
                .ok_or_else(|| Error::UserInput(format!("set field '{name}' has no value")))?;
            match arena.kind(value) {
                NodeKind::Const(slot) => Ok((name.clone(), slot.clone())),
                other => Err(Error::UserInput(format!(
                    "set field '{name}' value is {other:?}, expected a constant"
                ))),
            }
        })
        .collect::<Result<_>>()?;

    let mut shards: Vec<Arc<Shard>> = Vec::new();
    let mut root_step: Option<ExecStep> = None;
    let mut touched = Vec::with_capacity(tuples.len());

    for htp in tuples {
        let shard = match &opts.forced_shard {
            Some(shard) => Arc::clone(shard),
            None => def.beacon()?.shard_for_tuple(ctx, *htp, false)?,
        };
        let backend = backend_of(&shard, true)?;
        let buffer = ctx.heap().buffer_of(*htp)?;

        let (set_columns, set_params): (Vec<String>, Vec<Parameter>) = if explicit.is_empty() {
            // Diff against the immutable copy.
            let changed = buffer.with_tuple(*htp, |t| t.changed_ordinals(&tdv))?;
            let changed: Vec<u16> = changed
                .into_iter()
                .filter(|ord| !tdv.primary_key().contains(ord))
                .collect();
            if changed.is_empty() {
                continue;
            }
            let mut columns = Vec::with_capacity(changed.len());
            let mut params = Vec::with_capacity(changed.len());
            for ordinal in changed {
                let field = tdv.field(ordinal)?;
                columns.push(field.name.clone());
                params.push(field_param(ctx, &*backend, *htp, field)?);
            }
            (columns, params)
        } else {
            let mut columns = Vec::with_capacity(explicit.len());
            let mut params = Vec::with_capacity(explicit.len());
            for (name, slot) in &explicit {
                tdv.field_by_name(name)?;
                columns.push(name.clone());
                params.push(backend.param(slot.stack(), slot)?);
            }
            (columns, params)
        };

        // Keys bind from the pre-change image when one exists.
        let mut params = set_params;
        for field in &key_fields {
            let slot = buffer.with_tuple(*htp, |t| match t.shadow() {
                Some(shadow) => shadow.get(field),
                None => t.get(field),
            })?;
            params.push(backend.param(&field.stack, &slot)?);
        }

        let sql = backend.command_update(table, &set_columns, &key_columns)?;
        let stmt = Arc::new(PlannedStmt {
            action: StmtAction::Update,
            sql,
            arena: {
                let mut arena = NodeArena::new();
                let _ = crate::nodes::build::update(&mut arena, table, vec![*htp]);
                arena
            },
            root: NodeRef(0),
            projection: Mutex::new(None),
            late_binding: false,
            columns: set_columns,
            returning: Vec::new(),
            key_columns: key_columns.clone(),
            rows: 1,
            dedup: Vec::new(),
        });

        let step = ExecStep::fetch(
            Arc::clone(&stmt),
            PlannedStmtShard {
                shard: Arc::clone(&shard),
                params,
                tuples: vec![*htp],
            },
        );
        match root_step.as_mut() {
            Some(root) => root.push_forward(step),
            None => root_step = Some(step),
        }
        if !shards.iter().any(|s| s.id == shard.id) {
            shards.push(Arc::clone(&shard));
        }
        touched.push(TupleTouch {
            htp: *htp,
            kind: TouchKind::Update,
        });
    }

    let root_step = root_step.ok_or_else(|| {
        Error::UserInput("update found no changed fields on any tuple".into())
    })?;

    tracing::debug!(tuples = touched.len(), "planned update");
    Ok(build_plan(
        root_step,
        scope,
        result_scope,
        hbno,
        shards,
        touched,
        true,
    ))
}

// ============================================================================
// Delete
// ============================================================================

#[allow(clippy::too_many_arguments)]
fn plan_delete(
    ctx: &Context,
    _arena: &NodeArena,
    _root: NodeRef,
    opts: &PlannerOpts,
    table: &str,
    tuples: &[HeapTuplePtr],
    scope: MemScope,
    result_scope: MemScope,
    hbno: HeapBufferNo,
) -> Result<ExecPlan> {
    if tuples.is_empty() {
        return Err(Error::UserInput("delete with no tuples".into()));
    }
    let def = ctx.tables().by_name(table)?;
    let tdv = def.leading();
    if tdv.primary_key().is_empty() {
        return Err(Error::PlanError(format!(
            "delete from '{table}' requires a primary key"
        )));
    }
    let key_fields = tdv.pk_fields();
    let key_columns: Vec<String> = key_fields.iter().map(|f| f.name.clone()).collect();

    let mut shards: Vec<Arc<Shard>> = Vec::new();
    let mut root_step: Option<ExecStep> = None;

    for htp in tuples {
        let shard = match &opts.forced_shard {
            Some(shard) => Arc::clone(shard),
            None => def.beacon()?.shard_for_tuple(ctx, *htp, false)?,
        };
        let backend = backend_of(&shard, true)?;

        let mut params = Vec::with_capacity(key_fields.len());
        for field in &key_fields {
            params.push(field_param(ctx, &*backend, *htp, field)?);
        }

        let sql = backend.command_delete(table, &key_columns)?;
        let stmt = Arc::new(PlannedStmt {
            action: StmtAction::Delete,
            sql,
            arena: {
                let mut arena = NodeArena::new();
                let _ = crate::nodes::build::delete(&mut arena, table, vec![*htp]);
                arena
            },
            root: NodeRef(0),
            projection: Mutex::new(None),
            late_binding: false,
            columns: Vec::new(),
            returning: Vec::new(),
            key_columns: key_columns.clone(),
            rows: 1,
            dedup: Vec::new(),
        });

        let step = ExecStep::fetch(
            Arc::clone(&stmt),
            PlannedStmtShard {
                shard: Arc::clone(&shard),
                params,
                tuples: vec![*htp],
            },
        );
        match root_step.as_mut() {
            Some(root) => root.push_forward(step),
            None => root_step = Some(step),
        }
        if !shards.iter().any(|s| s.id == shard.id) {
            shards.push(Arc::clone(&shard));
        }
    }

    let touched = tuples
        .iter()
        .map(|htp| TupleTouch {
            htp: *htp,
            kind: TouchKind::Delete,
        })
        .collect();

    Ok(build_plan(
        root_step.expect("at least one tuple"),
        scope,
        result_scope,
        hbno,
        shards,
        touched,
        true,
    ))
}

// ============================================================================
// DDL
// ============================================================================

fn plan_ddl(
    ctx: &Context,
    arena: &NodeArena,
    root: NodeRef,
    opts: &PlannerOpts,
    scope: MemScope,
    result_scope: MemScope,
    hbno: HeapBufferNo,
) -> Result<ExecPlan> {
    let _ = ctx;
    let shard = opts.forced_shard.clone().ok_or_else(|| {
        Error::PlanError("DDL requires an explicit target shard".into())
    })?;
    let backend = backend_of(&shard, true)?;

    let mut stmt_arena = NodeArena::new();
    let stmt_root = arena.copy_subtree_into(root, &mut stmt_arena);
    let sql = backend.command(&stmt_arena, stmt_root)?;

    let stmt = Arc::new(PlannedStmt {
        action: StmtAction::Ddl,
        sql,
        arena: stmt_arena,
        root: stmt_root,
        projection: Mutex::new(None),
        late_binding: false,
        columns: Vec::new(),
        returning: Vec::new(),
        key_columns: Vec::new(),
        rows: 0,
        dedup: Vec::new(),
    });

    let step = ExecStep::discard(
        Arc::clone(&stmt),
        PlannedStmtShard {
            shard: Arc::clone(&shard),
            params: Vec::new(),
            tuples: Vec::new(),
        },
    );

    Ok(build_plan(
        step,
        scope,
        result_scope,
        hbno,
        vec![shard],
        Vec::new(),
        true,
    ))
}
