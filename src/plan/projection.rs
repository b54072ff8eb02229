//! Query result projections.
//!
//! The projection is resolved once at plan time: per result table, per
//! result field, the access-method to use when materializing that field
//! from the backend — the adapter's override when it has one, the type's
//! own otherwise. The executor and drivers then move bytes without any
//! per-row lookups.
//!
//! Late-binding plans defer this to the first record set: the driver
//! supplies `(name, type stack)` columns, the table binds them, and the
//! projection resolves then.

use std::sync::Arc;

use crate::backend::BackendAdapter;
use crate::schema::{HeapField, TableDef, TupleDefVersion};
use crate::types::stack::TypeStack;
use crate::types::tam::TypeAccess;
use crate::Result;

/// One result column: its field, owning result table, and resolved access
/// method.
pub struct ProjectedField {
    pub field: Arc<HeapField>,
    pub table_index: u16,
    pub tam: Arc<dyn TypeAccess>,
}

impl std::fmt::Debug for ProjectedField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectedField")
            .field("field", &self.field.name)
            .field("table_index", &self.table_index)
            .finish()
    }
}

/// One result table of a row.
pub struct ResultTable {
    pub table: Arc<TableDef>,
    pub tdv: Arc<TupleDefVersion>,
    pub fields: Vec<ProjectedField>,
}

impl std::fmt::Debug for ResultTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultTable")
            .field("table", &self.table.name)
            .field("fields", &self.fields.len())
            .finish()
    }
}

/// The full result-set shape of one statement.
#[derive(Debug)]
pub struct Projection {
    pub tables: Vec<ResultTable>,
}

impl Projection {
    pub fn rtups(&self) -> usize {
        self.tables.len()
    }
}

fn resolve_tam(backend: &dyn BackendAdapter, stack: &TypeStack) -> Arc<dyn TypeAccess> {
    let outer = stack.outermost();
    backend
        .tam_override(outer.tag)
        .unwrap_or_else(|| Arc::clone(&outer.tam))
}

/// Resolve the projection for whole-tuple result tables.
pub fn resolve(backend: &dyn BackendAdapter, tables: &[Arc<TableDef>]) -> Result<Projection> {
    let mut out = Vec::with_capacity(tables.len());
    for (index, table) in tables.iter().enumerate() {
        let tdv = table.leading();
        let fields = tdv
            .fields()
            .iter()
            .map(|field| ProjectedField {
                field: Arc::clone(field),
                table_index: index as u16,
                tam: resolve_tam(backend, &field.stack),
            })
            .collect();
        out.push(ResultTable {
            table: Arc::clone(table),
            tdv,
            fields,
        });
    }
    Ok(Projection { tables: out })
}

/// Resolve a projection restricted to named columns of one table (the
/// RETURNING shape of an insert).
pub fn resolve_columns(
    backend: &dyn BackendAdapter,
    table: &Arc<TableDef>,
    columns: &[String],
) -> Result<Projection> {
    let tdv = table.leading();
    let mut fields = Vec::with_capacity(columns.len());
    for name in columns {
        let field = tdv.field_by_name(name)?;
        fields.push(ProjectedField {
            field: Arc::clone(field),
            table_index: 0,
            tam: resolve_tam(backend, &field.stack),
        });
    }
    Ok(Projection {
        tables: vec![ResultTable {
            table: Arc::clone(table),
            tdv,
            fields,
        }],
    })
}

/// Resolve the deferred projection of a late-binding plan once the driver
/// has supplied columns and the table has bound them.
pub fn resolve_late(
    backend: &dyn BackendAdapter,
    table: &Arc<TableDef>,
    cols: &[(String, TypeStack)],
) -> Result<Projection> {
    let tdv = table.bind_columns(cols)?;
    let fields = tdv
        .fields()
        .iter()
        .map(|field| ProjectedField {
            field: Arc::clone(field),
            table_index: 0,
            tam: resolve_tam(backend, &field.stack),
        })
        .collect();
    Ok(Projection {
        tables: vec![ResultTable {
            table: Arc::clone(table),
            tdv,
            fields,
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::schema::TableCatalog;
    use crate::types::builtin;

    #[test]
    fn test_resolution_covers_every_field() {
        let catalog = TableCatalog::new();
        let orders = catalog
            .add(
                TableDef::build("orders")
                    .field("id", &builtin::int64())
                    .field("name", &builtin::string()),
            )
            .unwrap();
        let lines = catalog
            .add(TableDef::build("lines").field("order_id", &builtin::int64()))
            .unwrap();
        let backend = MemoryBackend::shared("p");

        let projection = resolve(&*backend, &[orders, lines]).unwrap();
        assert_eq!(projection.rtups(), 2);
        assert_eq!(projection.tables[0].fields.len(), 2);
        assert_eq!(projection.tables[1].fields.len(), 1);
        assert_eq!(projection.tables[1].fields[0].table_index, 1);
    }

    #[test]
    fn test_column_restricted_projection() {
        let catalog = TableCatalog::new();
        let orders = catalog
            .add(
                TableDef::build("orders")
                    .field("id", &builtin::int64())
                    .field("name", &builtin::string()),
            )
            .unwrap();
        let backend = MemoryBackend::shared("p2");

        let projection =
            resolve_columns(&*backend, &orders, &["id".to_string()]).unwrap();
        assert_eq!(projection.tables[0].fields.len(), 1);
        assert_eq!(projection.tables[0].fields[0].field.name, "id");
    }
}
