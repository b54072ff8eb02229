//! In-memory tuples: header flags, null bitmap, payload, varlen slots.
//!
//! A tuple's payload is laid out by its [`TupleDefVersion`]: fixed-width
//! fields store canonical bytes at their offsets; variable-length fields
//! store a 16-byte slot that is either inline (up to 14 bytes) or points at
//! an out-of-line cell owned by the tuple and charged to the owning buffer's
//! memory scope.
//!
//! Once a varlen value goes out of line it stays there: truncating below the
//! inline threshold updates the logical length but never shrinks the cell.

use std::sync::Arc;

use bitflags::bitflags;

use crate::mem::MemScope;
use crate::schema::{HeapField, TableId, TupleDefVersion};
use crate::types::stack::VARLEN_SLOT_SIZE;
use crate::value::TypedSlot;
use crate::{Error, Result};

use super::HeapBufferNo;

// ============================================================================
// Flags
// ============================================================================

bitflags! {
    /// Tuple header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TupleFlags: u8 {
        /// Materialized from a backend result set.
        const FETCHED = 0b0000_0001;
        /// At least one field mutated since the last snapshot.
        const CHANGED = 0b0000_0010;
        /// Marked deleted; storage reclaimed with the page.
        const DELETED = 0b0000_0100;
        /// This record is a shadow copy and must never be mutated.
        const IMMUTABLE_COPY = 0b0000_1000;
    }
}

// ============================================================================
// Varlen slots
// ============================================================================

/// Most bytes a varlen value can hold without leaving the slot.
pub const VARLEN_INLINE_MAX: usize = 14;

const SLOT_LEN_BYTE: usize = 14;
const SLOT_FLAG_BYTE: usize = 15;
const SLOT_FLAG_OUT_OF_LINE: u8 = 0b0000_0001;

fn slot_is_out_of_line(slot: &[u8]) -> bool {
    slot[SLOT_FLAG_BYTE] & SLOT_FLAG_OUT_OF_LINE != 0
}

fn slot_read_ool(slot: &[u8]) -> (usize, usize, usize, u16) {
    let cell = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]) as usize;
    let len = u32::from_le_bytes([slot[4], slot[5], slot[6], slot[7]]) as usize;
    let cap = u32::from_le_bytes([slot[8], slot[9], slot[10], slot[11]]) as usize;
    let hbno = u16::from_le_bytes([slot[12], slot[13]]);
    (cell, len, cap, hbno)
}

fn slot_write_ool(slot: &mut [u8], cell: usize, len: usize, cap: usize, hbno: u16) {
    slot[0..4].copy_from_slice(&(cell as u32).to_le_bytes());
    slot[4..8].copy_from_slice(&(len as u32).to_le_bytes());
    slot[8..12].copy_from_slice(&(cap as u32).to_le_bytes());
    slot[12..14].copy_from_slice(&hbno.to_le_bytes());
    slot[SLOT_LEN_BYTE] = 0;
    slot[SLOT_FLAG_BYTE] = SLOT_FLAG_OUT_OF_LINE;
}

fn slot_write_inline(slot: &mut [u8], data: &[u8]) {
    slot[..data.len()].copy_from_slice(data);
    for byte in &mut slot[data.len()..SLOT_LEN_BYTE] {
        *byte = 0;
    }
    slot[SLOT_LEN_BYTE] = data.len() as u8;
    slot[SLOT_FLAG_BYTE] = 0;
}

// ============================================================================
// Tuple
// ============================================================================

/// An out-of-line varlen cell. The vector is kept at capacity; the logical
/// length lives in the referencing slot.
#[derive(Debug, Clone)]
struct VarCell {
    bytes: Vec<u8>,
}

/// A materialized tuple: header, null bitmap, payload, varlen cells, and an
/// optional immutable shadow for change detection.
#[derive(Debug)]
pub struct Tuple {
    pub flags: TupleFlags,
    pub table: TableId,
    pub version: u32,
    pub hbno: HeapBufferNo,
    pub generation: u32,
    nulls: Vec<u8>,
    payload: Vec<u8>,
    cells: Vec<Option<VarCell>>,
    shadow: Option<Box<Tuple>>,
}

impl Tuple {
    /// Allocate an all-null tuple laid out by `tdv`. Fixed payload bytes are
    /// zero-filled; constructors run for frames that request construction;
    /// varlen slots start inline-empty.
    pub(super) fn new(tdv: &Arc<TupleDefVersion>, hbno: HeapBufferNo, generation: u32) -> Self {
        let mut tuple = Self {
            flags: TupleFlags::empty(),
            table: tdv.table,
            version: tdv.version,
            hbno,
            generation,
            nulls: vec![0xff; tdv.null_bytes()],
            payload: vec![0u8; tdv.payload_size()],
            cells: Vec::new(),
            shadow: None,
        };
        // Spare bits past the last field stay clear so the bitmap compares
        // clean across tuples of one version.
        let spare = tdv.null_bytes() * 8 - tdv.field_count();
        if spare > 0 && tdv.null_bytes() > 0 {
            let last = tdv.null_bytes() - 1;
            tuple.nulls[last] &= 0xffu8 >> spare;
        }

        for field in tdv.fields() {
            if field.stack.has_construct() {
                let (outer, rest) = crate::types::tam::split_stack(&field.stack);
                let slot = &mut tuple.payload[field.offset..field.offset + field.size];
                outer.tom.construct(rest, slot);
            }
        }
        tuple
    }

    /// Rough storage footprint for page accounting.
    pub(super) fn footprint(&self) -> usize {
        self.payload.len() + self.nulls.len() + std::mem::size_of::<Tuple>()
    }

    // ========================================================================
    // Null bitmap
    // ========================================================================

    pub fn is_null(&self, ordinal: u16) -> bool {
        let byte = ordinal as usize / 8;
        let bit = ordinal as usize % 8;
        self.nulls
            .get(byte)
            .map(|b| b & (1 << bit) != 0)
            .unwrap_or(true)
    }

    fn set_null_bit(&mut self, ordinal: u16, null: bool) {
        let byte = ordinal as usize / 8;
        let bit = ordinal as usize % 8;
        if let Some(b) = self.nulls.get_mut(byte) {
            if null {
                *b |= 1 << bit;
            } else {
                *b &= !(1 << bit);
            }
        }
    }

    /// The raw null bitmap, `ceil(field_count / 8)` bytes.
    pub fn null_bitmap(&self) -> &[u8] {
        &self.nulls
    }

    // ========================================================================
    // Field access
    // ========================================================================

    fn slot_range(&self, field: &HeapField) -> Result<std::ops::Range<usize>> {
        let end = field.offset + field.size;
        if end > self.payload.len() {
            return Err(Error::SchemaMismatch(format!(
                "field '{}' lies outside the tuple payload (version skew?)",
                field.name
            )));
        }
        Ok(field.offset..end)
    }

    /// Canonical bytes of a field, resolving varlen slots. `None` when the
    /// field is null.
    pub fn get_raw(&self, field: &HeapField) -> Result<Option<Vec<u8>>> {
        if self.is_null(field.null_ordinal) {
            return Ok(None);
        }
        let range = self.slot_range(field)?;
        let slot = &self.payload[range];

        if !field.stack.is_varlen() {
            return Ok(Some(slot.to_vec()));
        }

        debug_assert_eq!(slot.len(), VARLEN_SLOT_SIZE);
        if slot_is_out_of_line(slot) {
            let (cell, len, _cap, _hbno) = slot_read_ool(slot);
            let cell = self
                .cells
                .get(cell)
                .and_then(|c| c.as_ref())
                .ok_or_else(|| Error::Invariant(format!("dangling varlen cell {cell}")))?;
            Ok(Some(cell.bytes[..len].to_vec()))
        } else {
            let len = slot[SLOT_LEN_BYTE] as usize;
            Ok(Some(slot[..len].to_vec()))
        }
    }

    /// A field as a typed slot.
    pub fn get(&self, field: &HeapField) -> Result<TypedSlot> {
        match self.get_raw(field)? {
            None => Ok(TypedSlot::null(field.stack.clone())),
            Some(bytes) => Ok(TypedSlot::from_payload(field.stack.clone(), &bytes)),
        }
    }

    /// Write canonical bytes into a field, marking the tuple changed. Varlen
    /// growth allocates from `scope`; truncation keeps the allocation and
    /// updates the logical length.
    pub fn set_raw(&mut self, field: &HeapField, data: &[u8], scope: &MemScope) -> Result<()> {
        if self.flags.contains(TupleFlags::IMMUTABLE_COPY) {
            return Err(Error::Invariant(
                "attempted write to an immutable tuple copy".into(),
            ));
        }
        let range = self.slot_range(field)?;

        if !field.stack.is_varlen() {
            if data.len() != field.size {
                return Err(Error::SchemaMismatch(format!(
                    "field '{}' takes {} bytes, got {}",
                    field.name,
                    field.size,
                    data.len()
                )));
            }
            self.payload[range].copy_from_slice(data);
        } else {
            let hbno = self.hbno.0;
            let slot = &mut self.payload[range];
            if slot_is_out_of_line(slot) {
                let (cell_idx, _len, cap, _hbno) = slot_read_ool(slot);
                if data.len() <= cap {
                    // Fits the existing cell; never shrink it.
                    let cell = self.cells[cell_idx]
                        .as_mut()
                        .ok_or_else(|| Error::Invariant("dangling varlen cell".into()))?;
                    cell.bytes[..data.len()].copy_from_slice(data);
                    slot_write_ool(slot, cell_idx, data.len(), cap, hbno);
                } else {
                    let new_cap = data.len().max(cap * 2);
                    let cell = self.cells[cell_idx]
                        .as_mut()
                        .ok_or_else(|| Error::Invariant("dangling varlen cell".into()))?;
                    cell.bytes.resize(new_cap, 0);
                    cell.bytes[..data.len()].copy_from_slice(data);
                    scope.retrack(cap, new_cap);
                    slot_write_ool(slot, cell_idx, data.len(), new_cap, hbno);
                }
            } else if data.len() <= VARLEN_INLINE_MAX {
                slot_write_inline(slot, data);
            } else {
                // Inline overflow: move out of line, charging the scope.
                let cap = data.len();
                let mut bytes = vec![0u8; cap];
                bytes[..data.len()].copy_from_slice(data);
                let cell_idx = self.cells.len();
                self.cells.push(Some(VarCell { bytes }));
                scope.track(cap);
                slot_write_ool(slot, cell_idx, data.len(), cap, hbno);
            }
        }

        self.set_null_bit(field.null_ordinal, false);
        self.flags.insert(TupleFlags::CHANGED);
        Ok(())
    }

    /// Assign a typed slot to a field. A null slot nulls the field.
    pub fn set(&mut self, field: &HeapField, value: &TypedSlot, scope: &MemScope) -> Result<()> {
        if !field.stack.matches(value.stack()) {
            return Err(Error::SchemaMismatch(format!(
                "field '{}' is {}, value is {}",
                field.name,
                field.stack.describe(),
                value.stack().describe()
            )));
        }
        match value.payload() {
            None => {
                self.set_null(field);
                Ok(())
            }
            Some(bytes) => self.set_raw(field, bytes, scope),
        }
    }

    /// Null a field, marking the tuple changed. Out-of-line storage stays
    /// allocated.
    pub fn set_null(&mut self, field: &HeapField) {
        self.set_null_bit(field.null_ordinal, true);
        self.flags.insert(TupleFlags::CHANGED);
    }

    /// Capacity of a varlen field's out-of-line cell, if it has one.
    /// Exposes the no-shrink-on-truncate behavior for inspection.
    pub fn varlen_capacity(&self, field: &HeapField) -> Result<Option<usize>> {
        let range = self.slot_range(field)?;
        let slot = &self.payload[range];
        if field.stack.is_varlen() && slot_is_out_of_line(slot) {
            Ok(Some(slot_read_ool(slot).2))
        } else {
            Ok(None)
        }
    }

    // ========================================================================
    // Shadow copies
    // ========================================================================

    /// Capture an immutable copy of the current state at the current
    /// generation, for later diffing.
    pub fn snapshot(&mut self) {
        let mut shadow = self.clone_record();
        shadow.flags = (self.flags - TupleFlags::CHANGED) | TupleFlags::IMMUTABLE_COPY;
        self.shadow = Some(Box::new(shadow));
    }

    pub fn shadow(&self) -> Option<&Tuple> {
        self.shadow.as_deref()
    }

    pub fn drop_shadow(&mut self) {
        self.shadow = None;
    }

    /// Roll the tuple back to its shadow, keeping the shadow in place.
    pub fn restore_shadow(&mut self) {
        if let Some(shadow) = &self.shadow {
            self.nulls = shadow.nulls.clone();
            self.payload = shadow.payload.clone();
            self.cells = shadow.cells.clone();
            self.flags = shadow.flags - TupleFlags::IMMUTABLE_COPY;
        }
    }

    /// Ordinals whose current value differs from the shadow. Without a
    /// shadow, every non-null field counts as changed.
    pub fn changed_ordinals(&self, tdv: &TupleDefVersion) -> Result<Vec<u16>> {
        let mut changed = Vec::new();
        for field in tdv.fields() {
            let current = self.get_raw(field)?;
            let before = match self.shadow() {
                Some(shadow) => shadow.get_raw(field)?,
                None => None,
            };
            if current != before {
                changed.push(field.null_ordinal);
            }
        }
        Ok(changed)
    }

    /// Clear the changed flag after a successful flush or commit.
    pub fn clear_changed(&mut self) {
        self.flags.remove(TupleFlags::CHANGED);
    }

    fn clone_record(&self) -> Tuple {
        Tuple {
            flags: self.flags,
            table: self.table,
            version: self.version,
            hbno: self.hbno,
            generation: self.generation,
            nulls: self.nulls.clone(),
            payload: self.payload.clone(),
            cells: self.cells.clone(),
            shadow: None,
        }
    }

    /// Bytes held by out-of-line cells, released on free/close.
    pub(super) fn cell_bytes(&self) -> usize {
        self.cells
            .iter()
            .flatten()
            .map(|c| c.bytes.len())
            .sum()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{TableCatalog, TableDef};
    use crate::types::builtin;

    fn test_tdv() -> Arc<TupleDefVersion> {
        let catalog = TableCatalog::new();
        let table = catalog
            .add(
                TableDef::build("t")
                    .field("id", &builtin::int64())
                    .field("name", &builtin::string()),
            )
            .unwrap();
        table.leading()
    }

    fn fresh() -> (Tuple, Arc<TupleDefVersion>, MemScope) {
        let tdv = test_tdv();
        let scope = MemScope::root("test");
        (Tuple::new(&tdv, HeapBufferNo(1), 1), tdv, scope)
    }

    #[test]
    fn test_new_tuple_all_null() {
        let (tuple, tdv, _scope) = fresh();
        assert!(tuple.is_null(0));
        assert!(tuple.is_null(1));
        assert_eq!(tuple.null_bitmap(), &[0b0000_0011]);
        assert_eq!(tdv.null_bytes(), tuple.null_bitmap().len());
    }

    #[test]
    fn test_set_get_fixed() {
        let (mut tuple, tdv, scope) = fresh();
        let id = tdv.field_by_name("id").unwrap();

        tuple.set(id, &TypedSlot::int64(99), &scope).unwrap();
        assert!(!tuple.is_null(0));
        assert!(tuple.flags.contains(TupleFlags::CHANGED));
        assert_eq!(tuple.get(id).unwrap().as_i64(), Some(99));
    }

    #[test]
    fn test_varlen_inline_to_out_of_line_boundary() {
        let (mut tuple, tdv, scope) = fresh();
        let name = tdv.field_by_name("name").unwrap();

        // Exactly at the inline limit: no scope charge.
        let inline_max = "x".repeat(VARLEN_INLINE_MAX);
        tuple.set(name, &TypedSlot::string(&inline_max), &scope).unwrap();
        assert_eq!(tuple.varlen_capacity(name).unwrap(), None);
        assert_eq!(scope.stats().bytes_in_use, 0);

        // One byte over forces the cell allocation.
        let over = "x".repeat(VARLEN_INLINE_MAX + 1);
        tuple.set(name, &TypedSlot::string(&over), &scope).unwrap();
        assert_eq!(
            tuple.varlen_capacity(name).unwrap(),
            Some(VARLEN_INLINE_MAX + 1)
        );
        assert_eq!(scope.stats().bytes_in_use, VARLEN_INLINE_MAX + 1);
        assert_eq!(tuple.get(name).unwrap().as_str(), Some(over.as_str()));

        // Truncating below the threshold keeps the allocation, updates the
        // logical length.
        tuple.set(name, &TypedSlot::string("ab"), &scope).unwrap();
        assert_eq!(
            tuple.varlen_capacity(name).unwrap(),
            Some(VARLEN_INLINE_MAX + 1)
        );
        assert_eq!(scope.stats().bytes_in_use, VARLEN_INLINE_MAX + 1);
        assert_eq!(tuple.get(name).unwrap().as_str(), Some("ab"));
    }

    #[test]
    fn test_varlen_growth_recharges_scope() {
        let (mut tuple, tdv, scope) = fresh();
        let name = tdv.field_by_name("name").unwrap();

        tuple
            .set(name, &TypedSlot::string("x".repeat(20)), &scope)
            .unwrap();
        assert_eq!(scope.stats().bytes_in_use, 20);

        tuple
            .set(name, &TypedSlot::string("y".repeat(100)), &scope)
            .unwrap();
        assert_eq!(scope.stats().bytes_in_use, 100);
        assert_eq!(tuple.get(name).unwrap().as_str().map(|s| s.len()), Some(100));
    }

    #[test]
    fn test_shadow_diff_and_restore() {
        let (mut tuple, tdv, scope) = fresh();
        let id = tdv.field_by_name("id").unwrap();
        let name = tdv.field_by_name("name").unwrap();

        tuple.set(id, &TypedSlot::int64(1), &scope).unwrap();
        tuple.set(name, &TypedSlot::string("before"), &scope).unwrap();
        tuple.snapshot();
        tuple.clear_changed();

        tuple.set(name, &TypedSlot::string("after"), &scope).unwrap();
        let changed = tuple.changed_ordinals(&tdv).unwrap();
        assert_eq!(changed, vec![name.null_ordinal]);

        tuple.restore_shadow();
        assert_eq!(tuple.get(name).unwrap().as_str(), Some("before"));
        assert_eq!(tuple.get(id).unwrap().as_i64(), Some(1));
    }

    #[test]
    fn test_immutable_copy_rejects_writes() {
        let (mut tuple, tdv, scope) = fresh();
        let id = tdv.field_by_name("id").unwrap();
        tuple.set(id, &TypedSlot::int64(5), &scope).unwrap();
        tuple.snapshot();

        tuple.flags.insert(TupleFlags::IMMUTABLE_COPY);
        assert!(tuple.set(id, &TypedSlot::int64(6), &scope).is_err());
    }

    #[test]
    fn test_set_null_marks_changed() {
        let (mut tuple, tdv, scope) = fresh();
        let id = tdv.field_by_name("id").unwrap();
        tuple.set(id, &TypedSlot::int64(5), &scope).unwrap();
        tuple.clear_changed();

        tuple.set_null(id);
        assert!(tuple.is_null(0));
        assert!(tuple.flags.contains(TupleFlags::CHANGED));
    }
}
