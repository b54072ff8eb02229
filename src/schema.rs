//! Tuple definitions and the table catalog.
//!
//! A [`TableDef`] owns an ordered list of published [`TupleDefVersion`]s.
//! Versions are immutable once published: adding or removing a field
//! publishes a new leading version, and every tuple records the version it
//! was laid out against. Fields get byte offsets aligned to their type
//! stack's requirement and a null-bitmap ordinal; the bitmap is
//! `ceil(field_count / 8)` bytes wide.
//!
//! Late-binding tables start with zero fields and take their columns from
//! the first result set that materializes. The transition is one-shot: a
//! later result set with different columns is rejected.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::shard::beacon::Beacon;
use crate::types::stack::TypeStack;
use crate::{Error, Result};

/// Most fields a primary key may span.
pub const MAX_PK_FIELDS: usize = 8;

/// Null-bitmap width for a field count.
pub fn null_bitmap_width(field_count: usize) -> usize {
    field_count.div_ceil(8)
}

// ============================================================================
// Identifiers
// ============================================================================

/// Catalog-stable table identifier, recorded in every tuple header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TableId(pub u32);

// ============================================================================
// HeapField
// ============================================================================

/// One field of a tuple definition version.
#[derive(Debug, Clone)]
pub struct HeapField {
    pub name: String,
    /// Byte offset within the tuple payload, aligned to the stack's
    /// strictest frame.
    pub offset: usize,
    /// Position in the null bitmap (and in the field order).
    pub null_ordinal: u16,
    pub stack: TypeStack,
    /// Width of the payload slot at `offset`.
    pub size: usize,
}

// ============================================================================
// TupleDefVersion
// ============================================================================

/// An immutable schema snapshot: ordered fields, layout, key metadata.
#[derive(Debug)]
pub struct TupleDefVersion {
    pub table: TableId,
    pub version: u32,
    fields: Vec<Arc<HeapField>>,
    by_name: HashMap<String, u16>,
    payload_size: usize,
    /// Primary key as field ordinals, in key order.
    pk: Vec<u16>,
    /// Foreign keys as (local ordinals, referenced table, referenced
    /// fields).
    fks: Vec<ForeignKeyRef>,
}

#[derive(Debug, Clone)]
pub struct ForeignKeyRef {
    pub fields: Vec<u16>,
    pub ref_table: String,
    pub ref_fields: Vec<String>,
}

impl TupleDefVersion {
    fn build(
        table: TableId,
        version: u32,
        specs: &[(String, TypeStack)],
        pk: Vec<u16>,
        fks: Vec<ForeignKeyRef>,
    ) -> Result<Arc<Self>> {
        if pk.len() > MAX_PK_FIELDS {
            return Err(Error::UserInput(format!(
                "primary key spans {} fields, limit is {MAX_PK_FIELDS}",
                pk.len()
            )));
        }

        let mut fields = Vec::with_capacity(specs.len());
        let mut by_name = HashMap::with_capacity(specs.len());
        let mut payload_size = 0usize;

        for (ordinal, (name, stack)) in specs.iter().enumerate() {
            if by_name.contains_key(name.as_str()) {
                return Err(Error::UserInput(format!("duplicate field '{name}'")));
            }
            let align = stack.max_align().max(1);
            let offset = payload_size.div_ceil(align) * align;
            let size = stack.slot_width();
            payload_size = offset + size;

            by_name.insert(name.clone(), ordinal as u16);
            fields.push(Arc::new(HeapField {
                name: name.clone(),
                offset,
                null_ordinal: ordinal as u16,
                stack: stack.clone(),
                size,
            }));
        }

        for ordinal in &pk {
            if *ordinal as usize >= fields.len() {
                return Err(Error::UserInput(format!(
                    "primary key ordinal {ordinal} out of range"
                )));
            }
        }

        Ok(Arc::new(Self {
            table,
            version,
            fields,
            by_name,
            payload_size,
            pk,
            fks,
        }))
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[Arc<HeapField>] {
        &self.fields
    }

    pub fn field(&self, ordinal: u16) -> Result<&Arc<HeapField>> {
        self.fields.get(ordinal as usize).ok_or_else(|| {
            Error::SchemaMismatch(format!(
                "field ordinal {ordinal} out of range for table {:?} v{}",
                self.table, self.version
            ))
        })
    }

    pub fn field_by_name(&self, name: &str) -> Result<&Arc<HeapField>> {
        self.by_name
            .get(name)
            .map(|ord| &self.fields[*ord as usize])
            .ok_or_else(|| Error::NotFound(format!("field '{name}'")))
    }

    pub fn ordinal(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn null_bytes(&self) -> usize {
        null_bitmap_width(self.fields.len())
    }

    pub fn primary_key(&self) -> &[u16] {
        &self.pk
    }

    pub fn foreign_keys(&self) -> &[ForeignKeyRef] {
        &self.fks
    }

    pub fn pk_fields(&self) -> Vec<Arc<HeapField>> {
        self.pk
            .iter()
            .map(|ord| Arc::clone(&self.fields[*ord as usize]))
            .collect()
    }
}

// ============================================================================
// TableDef
// ============================================================================

/// A named table: its published versions, optional routing beacon, and the
/// late-binding flag.
pub struct TableDef {
    pub id: TableId,
    pub name: String,
    versions: RwLock<Vec<Arc<TupleDefVersion>>>,
    beacon: RwLock<Option<Arc<dyn Beacon>>>,
    late: bool,
    bound: RwLock<bool>,
}

impl TableDef {
    /// Start building a regular table.
    pub fn build(name: impl Into<String>) -> TableDefBuilder {
        TableDefBuilder {
            name: name.into(),
            specs: Vec::new(),
            pk: Vec::new(),
            fks: Vec::new(),
            late: false,
        }
    }

    /// A table whose columns arrive with the first result set.
    pub fn late_binding(name: impl Into<String>) -> TableDefBuilder {
        TableDefBuilder {
            name: name.into(),
            specs: Vec::new(),
            pk: Vec::new(),
            fks: Vec::new(),
            late: true,
        }
    }

    /// The current (highest) version.
    pub fn leading(&self) -> Arc<TupleDefVersion> {
        let versions = self.versions.read();
        Arc::clone(versions.last().expect("a table always has a version"))
    }

    pub fn version(&self, version: u32) -> Result<Arc<TupleDefVersion>> {
        self.versions
            .read()
            .iter()
            .find(|v| v.version == version)
            .cloned()
            .ok_or_else(|| {
                Error::SchemaMismatch(format!(
                    "table '{}' has no version {version}",
                    self.name
                ))
            })
    }

    /// Publish a new leading version with one more field.
    pub fn add_field(&self, name: impl Into<String>, stack: TypeStack) -> Result<Arc<TupleDefVersion>> {
        let name = name.into();
        let mut versions = self.versions.write();
        let leading = versions.last().expect("a table always has a version");

        let mut specs: Vec<(String, TypeStack)> = leading
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.stack.clone()))
            .collect();
        specs.push((name, stack));

        let next = TupleDefVersion::build(
            self.id,
            leading.version + 1,
            &specs,
            leading.pk.clone(),
            leading.fks.clone(),
        )?;
        versions.push(Arc::clone(&next));
        Ok(next)
    }

    /// Publish a new leading version without the named field.
    pub fn remove_field(&self, name: &str) -> Result<Arc<TupleDefVersion>> {
        let mut versions = self.versions.write();
        let leading = versions.last().expect("a table always has a version");
        leading.field_by_name(name)?;

        let specs: Vec<(String, TypeStack)> = leading
            .fields
            .iter()
            .filter(|f| f.name != name)
            .map(|f| (f.name.clone(), f.stack.clone()))
            .collect();
        // Key ordinals shift; keep only keys naming surviving fields.
        let pk = leading
            .pk
            .iter()
            .filter_map(|ord| {
                let field = &leading.fields[*ord as usize];
                specs.iter().position(|(n, _)| n == &field.name)
            })
            .map(|pos| pos as u16)
            .collect();

        let next =
            TupleDefVersion::build(self.id, leading.version + 1, &specs, pk, leading.fks.clone())?;
        versions.push(Arc::clone(&next));
        Ok(next)
    }

    pub fn is_late_binding(&self) -> bool {
        self.late
    }

    /// One-shot column binding for late-binding tables. The first call with
    /// a non-empty column set publishes the schema; later calls must match
    /// it exactly.
    pub fn bind_columns(&self, cols: &[(String, TypeStack)]) -> Result<Arc<TupleDefVersion>> {
        if !self.late {
            return Err(Error::SchemaMismatch(format!(
                "table '{}' is not late-binding",
                self.name
            )));
        }

        let mut bound = self.bound.write();
        if !*bound {
            let mut versions = self.versions.write();
            let leading = versions.last().expect("a table always has a version");
            let next =
                TupleDefVersion::build(self.id, leading.version + 1, cols, Vec::new(), Vec::new())?;
            versions.push(Arc::clone(&next));
            *bound = true;
            return Ok(next);
        }

        let leading = self.leading();
        if leading.field_count() != cols.len()
            || !leading.fields.iter().zip(cols.iter()).all(|(have, (name, stack))| {
                have.name == *name && have.stack.matches(stack)
            })
        {
            return Err(Error::SchemaMismatch(format!(
                "table '{}' already bound to a different column set",
                self.name
            )));
        }
        Ok(leading)
    }

    pub fn set_beacon(&self, beacon: Arc<dyn Beacon>) {
        *self.beacon.write() = Some(beacon);
    }

    pub fn beacon(&self) -> Result<Arc<dyn Beacon>> {
        self.beacon
            .read()
            .clone()
            .ok_or_else(|| Error::PlanError(format!("table '{}' has no beacon", self.name)))
    }
}

impl std::fmt::Debug for TableDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableDef")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.leading().version)
            .finish()
    }
}

/// Accumulates fields before the first version is published.
pub struct TableDefBuilder {
    name: String,
    specs: Vec<(String, TypeStack)>,
    pk: Vec<u16>,
    fks: Vec<ForeignKeyRef>,
    late: bool,
}

impl TableDefBuilder {
    pub fn field(mut self, name: impl Into<String>, stack: impl Into<TypeStack>) -> Self {
        self.specs.push((name.into(), stack.into()));
        self
    }

    /// Primary key by field names, in key order.
    pub fn primary_key(mut self, names: &[&str]) -> Self {
        self.pk = names
            .iter()
            .filter_map(|n| self.specs.iter().position(|(have, _)| have == n))
            .map(|pos| pos as u16)
            .collect();
        self
    }

    pub fn foreign_key(mut self, fields: &[&str], ref_table: &str, ref_fields: &[&str]) -> Self {
        let fields = fields
            .iter()
            .filter_map(|n| self.specs.iter().position(|(have, _)| have == n))
            .map(|pos| pos as u16)
            .collect();
        self.fks.push(ForeignKeyRef {
            fields,
            ref_table: ref_table.to_string(),
            ref_fields: ref_fields.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    fn publish(self, id: TableId) -> Result<TableDef> {
        let v1 = TupleDefVersion::build(id, 1, &self.specs, self.pk, self.fks)?;
        Ok(TableDef {
            id,
            name: self.name,
            versions: RwLock::new(vec![v1]),
            beacon: RwLock::new(None),
            late: self.late,
            bound: RwLock::new(false),
        })
    }
}

// ============================================================================
// TableCatalog
// ============================================================================

/// Process-wide catalog of table definitions, populated before worker
/// threads start.
pub struct TableCatalog {
    by_name: RwLock<HashMap<String, Arc<TableDef>>>,
    by_id: RwLock<HashMap<TableId, Arc<TableDef>>>,
    next_id: AtomicU32,
}

impl TableCatalog {
    pub fn new() -> Self {
        Self {
            by_name: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Publish a table built with [`TableDef::build`] /
    /// [`TableDef::late_binding`].
    pub fn add(&self, builder: TableDefBuilder) -> Result<Arc<TableDef>> {
        let id = TableId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let def = Arc::new(builder.publish(id)?);

        let mut by_name = self.by_name.write();
        if by_name.contains_key(&def.name) {
            return Err(Error::UserInput(format!(
                "table '{}' already in the catalog",
                def.name
            )));
        }
        by_name.insert(def.name.clone(), Arc::clone(&def));
        self.by_id.write().insert(def.id, Arc::clone(&def));
        Ok(def)
    }

    pub fn by_name(&self, name: &str) -> Result<Arc<TableDef>> {
        self.by_name
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("table '{name}'")))
    }

    pub fn by_id(&self, id: TableId) -> Result<Arc<TableDef>> {
        self.by_id
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("table id {}", id.0)))
    }

    pub fn contains_id(&self, id: TableId) -> bool {
        self.by_id.read().contains_key(&id)
    }
}

impl Default for TableCatalog {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::builtin;

    fn orders() -> TableDefBuilder {
        TableDef::build("orders")
            .field("id", &builtin::int64())
            .field("qty", &builtin::int16())
            .field("name", &builtin::string())
            .primary_key(&["id"])
    }

    #[test]
    fn test_layout_alignment_and_bitmap() {
        let catalog = TableCatalog::new();
        let table = catalog.add(orders()).unwrap();
        let tdv = table.leading();

        assert_eq!(tdv.field_count(), 3);
        assert_eq!(tdv.null_bytes(), 1);

        let id = tdv.field_by_name("id").unwrap();
        let qty = tdv.field_by_name("qty").unwrap();
        let name = tdv.field_by_name("name").unwrap();

        assert_eq!(id.offset, 0);
        assert_eq!(qty.offset, 8);
        // Varlen slot aligns to 8 past the 2-byte qty.
        assert_eq!(name.offset, 16);
        assert_eq!(name.size, 16);
        assert_eq!(tdv.payload_size(), 32);
        assert_eq!(tdv.primary_key(), &[0]);
    }

    #[test]
    fn test_version_bump_on_add_and_remove() {
        let catalog = TableCatalog::new();
        let table = catalog.add(orders()).unwrap();
        assert_eq!(table.leading().version, 1);

        table
            .add_field("note", TypeStack::scalar(builtin::string()))
            .unwrap();
        assert_eq!(table.leading().version, 2);
        assert_eq!(table.leading().null_bytes(), 1);

        table.remove_field("qty").unwrap();
        let v3 = table.leading();
        assert_eq!(v3.version, 3);
        assert!(v3.field_by_name("qty").is_err());
        // Primary key survives by name through the reshuffle.
        assert_eq!(v3.primary_key(), &[0]);

        // Old versions stay resolvable for tuples laid out against them.
        assert_eq!(table.version(1).unwrap().field_count(), 3);
    }

    #[test]
    fn test_nine_fields_widen_bitmap() {
        let mut builder = TableDef::build("wide");
        for i in 0..9 {
            builder = builder.field(format!("f{i}"), &builtin::int32());
        }
        let catalog = TableCatalog::new();
        let table = catalog.add(builder).unwrap();
        assert_eq!(table.leading().null_bytes(), 2);
    }

    #[test]
    fn test_pk_limit() {
        let mut builder = TableDef::build("keys");
        let mut names = Vec::new();
        for i in 0..9 {
            let name = format!("k{i}");
            builder = builder.field(name.as_str(), &builtin::int32());
            names.push(name);
        }
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let catalog = TableCatalog::new();
        assert!(catalog.add(builder.primary_key(&refs)).is_err());
    }

    #[test]
    fn test_late_binding_one_shot() {
        let catalog = TableCatalog::new();
        let table = catalog.add(TableDef::late_binding("t")).unwrap();
        assert!(table.is_late_binding());
        assert_eq!(table.leading().field_count(), 0);

        let cols = vec![
            ("a".to_string(), TypeStack::scalar(builtin::int64())),
            ("b".to_string(), TypeStack::scalar(builtin::string())),
        ];
        let tdv = table.bind_columns(&cols).unwrap();
        assert_eq!(tdv.field_count(), 2);
        assert_eq!(tdv.fields()[0].name, "a");

        // Same columns again: fine.
        table.bind_columns(&cols).unwrap();

        // Different columns: rejected.
        let other = vec![("z".to_string(), TypeStack::scalar(builtin::int64()))];
        assert!(matches!(
            table.bind_columns(&other),
            Err(Error::SchemaMismatch(_))
        ));
    }
}
