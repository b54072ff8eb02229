//! Typed constructors for query node trees.
//!
//! Thin helpers over [`NodeArena`] so call sites read like the query they
//! build:
//!
//! ```ignore
//! let select = build::select(&mut arena, "orders");
//! build::qual(&mut arena, select, "=",
//!     build::field(&mut arena, None, "id"),
//!     build::constant(&mut arena, TypedSlot::int64(7)));
//! ```

use crate::heap::HeapTuplePtr;
use crate::value::TypedSlot;

use super::{JoinKind, NodeArena, NodeKind, NodeRef};

/// A select over one driving table.
pub fn select(arena: &mut NodeArena, table: impl Into<String>) -> NodeRef {
    let root = arena.node(NodeKind::Select);
    let from = arena.node(NodeKind::From {
        table: table.into(),
    });
    arena
        .append_child(root, from)
        .expect("fresh node cannot be linked");
    root
}

/// Add an inner join to a select; returns the join node for its quals.
pub fn join(arena: &mut NodeArena, select: NodeRef, table: impl Into<String>) -> NodeRef {
    join_kind(arena, select, table, JoinKind::Inner)
}

pub fn join_kind(
    arena: &mut NodeArena,
    select: NodeRef,
    table: impl Into<String>,
    kind: JoinKind,
) -> NodeRef {
    let node = arena.node(NodeKind::Join {
        table: table.into(),
        kind,
    });
    arena
        .append_child(select, node)
        .expect("fresh node cannot be linked");
    node
}

/// A column reference.
pub fn field(arena: &mut NodeArena, table: Option<&str>, name: impl Into<String>) -> NodeRef {
    arena.node(NodeKind::Field {
        table: table.map(|t| t.to_string()),
        name: name.into(),
    })
}

/// A typed constant.
pub fn constant(arena: &mut NodeArena, value: TypedSlot) -> NodeRef {
    arena.node(NodeKind::Const(value))
}

/// A positional parameter.
pub fn param(arena: &mut NodeArena, index: u16) -> NodeRef {
    arena.node(NodeKind::Param(index))
}

/// Attach a predicate `lhs op rhs` under `parent` (a select or a join).
pub fn qual(
    arena: &mut NodeArena,
    parent: NodeRef,
    op: impl Into<String>,
    lhs: NodeRef,
    rhs: NodeRef,
) -> NodeRef {
    let node = arena.node(NodeKind::Qual { op: op.into() });
    arena
        .append_child(node, lhs)
        .expect("operand already linked");
    arena
        .append_child(node, rhs)
        .expect("operand already linked");
    arena
        .append_child(parent, node)
        .expect("fresh node cannot be linked");
    node
}

/// Attach an ORDER BY on a named field.
pub fn order_by(
    arena: &mut NodeArena,
    select: NodeRef,
    field_name: impl Into<String>,
    ascending: bool,
) -> NodeRef {
    let node = arena.node(NodeKind::OrderBy { ascending });
    let field = arena.node(NodeKind::Field {
        table: None,
        name: field_name.into(),
    });
    arena
        .append_child(node, field)
        .expect("fresh node cannot be linked");
    arena
        .append_child(select, node)
        .expect("fresh node cannot be linked");
    node
}

/// Restrict a select's projection to a named field.
pub fn project(arena: &mut NodeArena, select: NodeRef, table: Option<&str>, name: impl Into<String>) -> NodeRef {
    let node = field(arena, table, name);
    arena
        .append_child(select, node)
        .expect("fresh node cannot be linked");
    node
}

/// Insert the given tuples.
pub fn insert(arena: &mut NodeArena, table: impl Into<String>, tuples: Vec<HeapTuplePtr>) -> NodeRef {
    arena.node(NodeKind::Insert {
        table: table.into(),
        tuples,
    })
}

/// Update the given tuples from their changed-field diffs.
pub fn update(arena: &mut NodeArena, table: impl Into<String>, tuples: Vec<HeapTuplePtr>) -> NodeRef {
    arena.node(NodeKind::Update {
        table: table.into(),
        tuples,
    })
}

/// Add an explicit set-column to an update, overriding the diff.
pub fn update_field(
    arena: &mut NodeArena,
    update: NodeRef,
    name: impl Into<String>,
    value: TypedSlot,
) -> NodeRef {
    let node = arena.node(NodeKind::UpdateField { name: name.into() });
    let value = arena.node(NodeKind::Const(value));
    arena
        .append_child(node, value)
        .expect("fresh node cannot be linked");
    arena
        .append_child(update, node)
        .expect("fresh node cannot be linked");
    node
}

/// Delete the given tuples by primary key.
pub fn delete(arena: &mut NodeArena, table: impl Into<String>, tuples: Vec<HeapTuplePtr>) -> NodeRef {
    arena.node(NodeKind::Delete {
        table: table.into(),
        tuples,
    })
}

/// A DDL command passed through to the backend.
pub fn ddl(arena: &mut NodeArena, command: impl Into<String>) -> NodeRef {
    arena.node(NodeKind::Ddl {
        command: command.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_shape() {
        let mut arena = NodeArena::new();
        let sel = select(&mut arena, "orders");
        let j = join(&mut arena, sel, "lines");
        let lhs0 = field(&mut arena, Some("orders"), "id");
        let rhs0 = field(&mut arena, Some("lines"), "order_id");
        qual(&mut arena, j, "=", lhs0, rhs0);
        let lhs = field(&mut arena, None, "qty");
        let rhs = constant(&mut arena, TypedSlot::int64(3));
        qual(&mut arena, sel, ">", lhs, rhs);
        order_by(&mut arena, sel, "id", true);

        assert_eq!(arena.select_tables(sel), vec!["orders", "lines"]);
        let kinds: Vec<_> = arena
            .children(sel)
            .into_iter()
            .map(|c| std::mem::discriminant(arena.kind(c)))
            .collect();
        assert_eq!(kinds.len(), 4);
    }

    #[test]
    fn test_update_with_explicit_fields() {
        let mut arena = NodeArena::new();
        let up = update(&mut arena, "orders", vec![]);
        update_field(&mut arena, up, "qty", TypedSlot::int64(9));

        let fields = arena.children_where(up, |k| matches!(k, NodeKind::UpdateField { .. }));
        assert_eq!(fields.len(), 1);
        let value = arena.children(fields[0])[0];
        assert!(matches!(arena.kind(value), NodeKind::Const(_)));
    }
}
