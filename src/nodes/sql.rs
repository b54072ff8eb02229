//! SQL fragment emission.
//!
//! Backends turn node trees into SQL text through a [`SqlWriter`]: it holds
//! the target placeholder style, accumulates bound parameters in emission
//! order, and lets a backend override any node's fragment through
//! [`SqlOverride`] before the generic form applies. Emission is per-node —
//! the statement composers below drive recursion explicitly.

use std::sync::Arc;

use crate::{Error, Result};

use super::{JoinKind, NodeArena, NodeKind, NodeRef};

// ============================================================================
// Writer
// ============================================================================

/// Parameter placeholder dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaceholderStyle {
    /// `$1`, `$2`, ...
    #[default]
    Dollar,
    /// `?`
    Question,
}

/// Backend-specific emission quirks. Return `true` from [`SqlOverride::emit`]
/// to claim a node; the generic fragment applies otherwise.
pub trait SqlOverride: Send + Sync {
    fn emit(&self, arena: &NodeArena, node: NodeRef, w: &mut SqlWriter) -> Result<bool> {
        let _ = (arena, node, w);
        Ok(false)
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

struct DefaultOverride;
impl SqlOverride for DefaultOverride {}

/// Accumulates SQL text and the ordered parameter list.
pub struct SqlWriter {
    style: PlaceholderStyle,
    overrides: Arc<dyn SqlOverride>,
    pub sql: String,
    /// One entry per placeholder, in order: the `Const`/`Param` node that
    /// feeds it, or `None` for tuple-derived bindings.
    pub params: Vec<Option<NodeRef>>,
}

impl SqlWriter {
    pub fn new(style: PlaceholderStyle) -> Self {
        Self {
            style,
            overrides: Arc::new(DefaultOverride),
            sql: String::new(),
            params: Vec::new(),
        }
    }

    pub fn with_overrides(style: PlaceholderStyle, overrides: Arc<dyn SqlOverride>) -> Self {
        Self {
            style,
            overrides,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    pub fn push(&mut self, text: &str) {
        self.sql.push_str(text);
    }

    pub fn ident(&mut self, ident: &str) {
        let quoted = self.overrides.quote_ident(ident);
        self.sql.push_str(&quoted);
    }

    pub fn qualified(&mut self, table: Option<&str>, name: &str) {
        if let Some(table) = table {
            self.ident(table);
            self.sql.push('.');
        }
        self.ident(name);
    }

    /// Emit a placeholder fed by `source` and record it.
    pub fn bind(&mut self, source: Option<NodeRef>) -> usize {
        self.params.push(source);
        let index = self.params.len();
        match self.style {
            PlaceholderStyle::Dollar => self.sql.push_str(&format!("${index}")),
            PlaceholderStyle::Question => self.sql.push('?'),
        }
        index
    }
}

// ============================================================================
// Fragments
// ============================================================================

/// Emit one node's SQL fragment. Qual operands are the only implicit
/// recursion — a predicate is unreadable in halves.
pub fn emit_fragment(arena: &NodeArena, node: NodeRef, w: &mut SqlWriter) -> Result<()> {
    if w.overrides.clone().emit(arena, node, w)? {
        return Ok(());
    }

    match arena.kind(node) {
        NodeKind::Field { table, name } => {
            w.qualified(table.as_deref(), name);
            Ok(())
        }
        NodeKind::Const(_) | NodeKind::Param(_) => {
            w.bind(Some(node));
            Ok(())
        }
        NodeKind::Qual { op } => {
            let operands = arena.children(node);
            if operands.len() != 2 {
                return Err(Error::UserInput(format!(
                    "qual has {} operands, expected 2",
                    operands.len()
                )));
            }
            emit_fragment(arena, operands[0], w)?;
            w.push(" ");
            w.push(op);
            w.push(" ");
            emit_fragment(arena, operands[1], w)
        }
        NodeKind::From { table } => {
            w.ident(table);
            Ok(())
        }
        NodeKind::Join { table, kind } => {
            w.push(match kind {
                JoinKind::Inner => "JOIN ",
                JoinKind::Left => "LEFT JOIN ",
            });
            w.ident(table);
            Ok(())
        }
        NodeKind::OrderBy { ascending } => {
            let target = arena.children(node);
            let field = target
                .first()
                .ok_or_else(|| Error::UserInput("ORDER BY without a field".into()))?;
            emit_fragment(arena, *field, w)?;
            w.push(if *ascending { " ASC" } else { " DESC" });
            Ok(())
        }
        NodeKind::Ddl { command } => {
            w.push(command);
            Ok(())
        }
        other => Err(Error::UserInput(format!(
            "no SQL fragment for node {other:?}"
        ))),
    }
}

// ============================================================================
// Statement composers
// ============================================================================

/// `SELECT <projection> FROM ... [JOIN ... ON ...] [WHERE ...] [ORDER BY]`.
///
/// An empty projection expands to `table.*` per referenced table so every
/// result table materializes whole tuples.
pub fn emit_select(arena: &NodeArena, select: NodeRef, w: &mut SqlWriter) -> Result<()> {
    let children = arena.children(select);

    let projection: Vec<NodeRef> = children
        .iter()
        .copied()
        .filter(|c| matches!(arena.kind(*c), NodeKind::Field { .. }))
        .collect();
    let joins: Vec<NodeRef> = children
        .iter()
        .copied()
        .filter(|c| matches!(arena.kind(*c), NodeKind::Join { .. }))
        .collect();
    let quals: Vec<NodeRef> = children
        .iter()
        .copied()
        .filter(|c| matches!(arena.kind(*c), NodeKind::Qual { .. }))
        .collect();
    let orders: Vec<NodeRef> = children
        .iter()
        .copied()
        .filter(|c| matches!(arena.kind(*c), NodeKind::OrderBy { .. }))
        .collect();

    w.push("SELECT ");
    if projection.is_empty() {
        let tables = arena.select_tables(select);
        for (i, table) in tables.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.ident(table);
            w.push(".*");
        }
    } else {
        for (i, field) in projection.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            emit_fragment(arena, *field, w)?;
        }
    }

    w.push(" FROM ");
    let from = children
        .iter()
        .copied()
        .find(|c| matches!(arena.kind(*c), NodeKind::From { .. }))
        .ok_or_else(|| Error::UserInput("select has no FROM".into()))?;
    emit_fragment(arena, from, w)?;

    for join in joins {
        w.push(" ");
        emit_fragment(arena, join, w)?;
        let on = arena.children_where(join, |k| matches!(k, NodeKind::Qual { .. }));
        for (i, qual) in on.iter().enumerate() {
            w.push(if i == 0 { " ON " } else { " AND " });
            emit_fragment(arena, *qual, w)?;
        }
    }

    for (i, qual) in quals.iter().enumerate() {
        w.push(if i == 0 { " WHERE " } else { " AND " });
        emit_fragment(arena, *qual, w)?;
    }

    for (i, order) in orders.iter().enumerate() {
        w.push(if i == 0 { " ORDER BY " } else { ", " });
        emit_fragment(arena, *order, w)?;
    }

    Ok(())
}

/// `INSERT INTO t (cols) VALUES (...), ... [RETURNING cols]` with one
/// anonymous placeholder per column per row.
pub fn emit_insert(
    table: &str,
    columns: &[String],
    rows: usize,
    returning: &[String],
    w: &mut SqlWriter,
) -> Result<()> {
    if columns.is_empty() || rows == 0 {
        return Err(Error::PlanError("insert with no columns or rows".into()));
    }

    w.push("INSERT INTO ");
    w.ident(table);
    w.push(" (");
    for (i, col) in columns.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.ident(col);
    }
    w.push(") VALUES ");
    for row in 0..rows {
        if row > 0 {
            w.push(", ");
        }
        w.push("(");
        for i in 0..columns.len() {
            if i > 0 {
                w.push(", ");
            }
            w.bind(None);
        }
        w.push(")");
    }
    if !returning.is_empty() {
        w.push(" RETURNING ");
        for (i, col) in returning.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.ident(col);
        }
    }
    Ok(())
}

/// `UPDATE t SET c = $n, ... WHERE k = $n AND ...`.
pub fn emit_update(
    table: &str,
    set_columns: &[String],
    key_columns: &[String],
    w: &mut SqlWriter,
) -> Result<()> {
    if set_columns.is_empty() {
        return Err(Error::PlanError("update with no set columns".into()));
    }
    w.push("UPDATE ");
    w.ident(table);
    w.push(" SET ");
    for (i, col) in set_columns.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.ident(col);
        w.push(" = ");
        w.bind(None);
    }
    for (i, col) in key_columns.iter().enumerate() {
        w.push(if i == 0 { " WHERE " } else { " AND " });
        w.ident(col);
        w.push(" = ");
        w.bind(None);
    }
    Ok(())
}

/// `DELETE FROM t WHERE k = $n AND ...`.
pub fn emit_delete(table: &str, key_columns: &[String], w: &mut SqlWriter) -> Result<()> {
    w.push("DELETE FROM ");
    w.ident(table);
    for (i, col) in key_columns.iter().enumerate() {
        w.push(if i == 0 { " WHERE " } else { " AND " });
        w.ident(col);
        w.push(" = ");
        w.bind(None);
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::build;
    use super::*;
    use crate::value::TypedSlot;

    #[test]
    fn test_select_with_qual_and_join() {
        let mut arena = NodeArena::new();
        let sel = build::select(&mut arena, "orders");
        let j = build::join(&mut arena, sel, "lines");
        let lhs0 = build::field(&mut arena, Some("orders"), "id");
        let rhs0 = build::field(&mut arena, Some("lines"), "order_id");
        build::qual(&mut arena, j, "=", lhs0, rhs0);
        let lhs = build::field(&mut arena, None, "qty");
        let rhs = build::constant(&mut arena, TypedSlot::int64(5));
        build::qual(&mut arena, sel, ">", lhs, rhs);

        let mut w = SqlWriter::new(PlaceholderStyle::Dollar);
        emit_select(&arena, sel, &mut w).unwrap();

        assert_eq!(
            w.sql,
            "SELECT \"orders\".*, \"lines\".* FROM \"orders\" \
             JOIN \"lines\" ON \"orders\".\"id\" = \"lines\".\"order_id\" \
             WHERE \"qty\" > $1"
        );
        assert_eq!(w.params.len(), 1);
        assert_eq!(w.params[0], Some(rhs));
    }

    #[test]
    fn test_question_placeholders() {
        let mut arena = NodeArena::new();
        let sel = build::select(&mut arena, "t");
        let lhs = build::field(&mut arena, None, "a");
        let rhs = build::constant(&mut arena, TypedSlot::int32(1));
        build::qual(&mut arena, sel, "=", lhs, rhs);

        let mut w = SqlWriter::new(PlaceholderStyle::Question);
        emit_select(&arena, sel, &mut w).unwrap();
        assert!(w.sql.ends_with("WHERE \"a\" = ?"));
    }

    #[test]
    fn test_insert_grouped_rows_and_returning() {
        let mut w = SqlWriter::new(PlaceholderStyle::Dollar);
        emit_insert(
            "orders",
            &["name".to_string()],
            2,
            &["id".to_string()],
            &mut w,
        )
        .unwrap();
        assert_eq!(
            w.sql,
            "INSERT INTO \"orders\" (\"name\") VALUES ($1), ($2) RETURNING \"id\""
        );
        assert_eq!(w.params.len(), 2);
    }

    #[test]
    fn test_update_and_delete() {
        let mut w = SqlWriter::new(PlaceholderStyle::Dollar);
        emit_update(
            "orders",
            &["name".to_string(), "qty".to_string()],
            &["id".to_string()],
            &mut w,
        )
        .unwrap();
        assert_eq!(
            w.sql,
            "UPDATE \"orders\" SET \"name\" = $1, \"qty\" = $2 WHERE \"id\" = $3"
        );

        let mut w = SqlWriter::new(PlaceholderStyle::Dollar);
        emit_delete("orders", &["id".to_string()], &mut w).unwrap();
        assert_eq!(w.sql, "DELETE FROM \"orders\" WHERE \"id\" = $1");
    }

    #[test]
    fn test_order_by_fragment() {
        let mut arena = NodeArena::new();
        let sel = build::select(&mut arena, "t");
        build::order_by(&mut arena, sel, "k", false);

        let mut w = SqlWriter::new(PlaceholderStyle::Dollar);
        emit_select(&arena, sel, &mut w).unwrap();
        assert!(w.sql.ends_with("ORDER BY \"k\" DESC"));
    }
}
