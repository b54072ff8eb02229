//! Tuple collectors.
//!
//! Backends form tuples from native result sets and hand the executor one
//! row at a time: an array of tuple pointers, one per result table. The
//! collector pipeline composes from there — the slist collector appends
//! rows to the result set, the index collector deduplicates a relation and
//! forwards only fresh tuples (releasing duplicates back to their buffer),
//! and the returning collector copies backend-assigned columns onto the
//! tuples a write started from.
//!
//! Row storage grows in exponential blocks so rows are never allocated one
//! by one.

use hashbrown::HashMap;

use crate::context::Context;
use crate::heap::HeapTuplePtr;
use crate::plan::DedupSpec;
use crate::schema::TupleDefVersion;
use crate::{Error, Result};

// ============================================================================
// Collector contract
// ============================================================================

/// Uniform row sink. `row` holds one tuple pointer per result table; a
/// collector may rewrite entries (dedup does) before forwarding. `Send` so
/// a collector can ride a driver's execute future.
pub trait TupleCollector: Send {
    fn collect(&mut self, ctx: &Context, row: &mut [HeapTuplePtr]) -> Result<()>;

    /// Rows delivered so far, when the collector keeps count.
    fn rows(&self) -> u64 {
        0
    }
}

// ============================================================================
// RowSet
// ============================================================================

const FIRST_BLOCK_ROWS: usize = 16;

/// The materialized result rows: `rtups` contiguous pointers per row,
/// stored in blocks that double in size.
pub struct RowSet {
    rtups: usize,
    blocks: Vec<Vec<HeapTuplePtr>>,
    rows: usize,
}

impl RowSet {
    pub fn new() -> Self {
        Self {
            rtups: 0,
            blocks: Vec::new(),
            rows: 0,
        }
    }

    pub fn rtups(&self) -> usize {
        self.rtups
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn push_row(&mut self, row: &[HeapTuplePtr]) -> Result<()> {
        if self.rtups == 0 {
            self.rtups = row.len();
        } else if row.len() != self.rtups {
            return Err(Error::Invariant(format!(
                "row of {} tuples pushed into a {}-wide result set",
                row.len(),
                self.rtups
            )));
        }

        let need = self.rtups;
        let block_rows = FIRST_BLOCK_ROWS << self.blocks.len().min(16);
        match self.blocks.last_mut() {
            Some(block) if block.len() + need <= block.capacity() => {
                block.extend_from_slice(row);
            }
            _ => {
                let mut block = Vec::with_capacity(block_rows * need);
                block.extend_from_slice(row);
                self.blocks.push(block);
            }
        }
        self.rows += 1;
        Ok(())
    }

    /// Iterate rows as fixed-width pointer slices.
    pub fn iter_rows(&self) -> impl Iterator<Item = &[HeapTuplePtr]> {
        let rtups = self.rtups.max(1);
        self.blocks.iter().flat_map(move |b| b.chunks_exact(rtups))
    }

    /// The `index`-th pointer of every row.
    pub fn column(&self, index: usize) -> Vec<HeapTuplePtr> {
        self.iter_rows().map(|row| row[index]).collect()
    }
}

impl Default for RowSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RowSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RowSet({} rows x {})", self.rows, self.rtups)
    }
}

// ============================================================================
// SList collector
// ============================================================================

/// Appends every row to the shared result set.
pub struct SListCollector<'a> {
    rows: &'a mut RowSet,
    delivered: u64,
}

impl<'a> SListCollector<'a> {
    pub fn new(rows: &'a mut RowSet) -> Self {
        Self {
            rows,
            delivered: 0,
        }
    }
}

impl TupleCollector for SListCollector<'_> {
    fn collect(&mut self, _ctx: &Context, row: &mut [HeapTuplePtr]) -> Result<()> {
        self.rows.push_row(row)?;
        self.delivered += 1;
        Ok(())
    }

    fn rows(&self) -> u64 {
        self.delivered
    }
}

// ============================================================================
// Index (dedup) collector
// ============================================================================

/// Deduplicates requested result tables by a field key before forwarding.
/// Duplicate tuples are released back to their buffer and the row's pointer
/// rewritten to the first-seen tuple.
pub struct IndexCollector<'a> {
    specs: Vec<DedupSpec>,
    seen: HashMap<(u16, Vec<u8>), HeapTuplePtr>,
    next: &'a mut dyn TupleCollector,
}

impl<'a> IndexCollector<'a> {
    pub fn new(specs: Vec<DedupSpec>, next: &'a mut dyn TupleCollector) -> Self {
        Self {
            specs,
            seen: HashMap::new(),
            next,
        }
    }

    fn key_for(ctx: &Context, htp: HeapTuplePtr, spec: &DedupSpec) -> Result<Vec<u8>> {
        let buffer = ctx.heap().buffer_of(htp)?;
        buffer.with_tuple(htp, |tuple| {
            let mut key = Vec::new();
            for field in &spec.fields {
                match tuple.get_raw(field)? {
                    Some(bytes) => {
                        key.push(1u8);
                        key.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                        key.extend_from_slice(&bytes);
                    }
                    None => key.push(0u8),
                }
            }
            Ok(key)
        })
    }
}

impl TupleCollector for IndexCollector<'_> {
    fn collect(&mut self, ctx: &Context, row: &mut [HeapTuplePtr]) -> Result<()> {
        for spec in &self.specs {
            let index = spec.table_index as usize;
            let htp = row[index];
            let key = Self::key_for(ctx, htp, spec)?;

            match self.seen.get(&(spec.table_index, key.clone())) {
                Some(existing) if *existing != htp => {
                    // Upsert hit: release the duplicate, forward the
                    // canonical pointer.
                    ctx.heap().buffer_of(htp)?.free_tuple(htp)?;
                    row[index] = *existing;
                }
                Some(_) => {}
                None => {
                    self.seen.insert((spec.table_index, key), htp);
                }
            }
        }
        self.next.collect(ctx, row)
    }

    fn rows(&self) -> u64 {
        self.next.rows()
    }
}

// ============================================================================
// Returning collector
// ============================================================================

/// Assigns RETURNING columns back onto the tuples a write started from, by
/// field-name matching. The backend's transient result tuples are released
/// after the copy.
pub struct ReturningCollector<'a> {
    targets: &'a [HeapTuplePtr],
    columns: &'a [String],
    tdv: std::sync::Arc<TupleDefVersion>,
    cursor: usize,
}

impl<'a> ReturningCollector<'a> {
    pub fn new(
        targets: &'a [HeapTuplePtr],
        columns: &'a [String],
        tdv: std::sync::Arc<TupleDefVersion>,
    ) -> Self {
        Self {
            targets,
            columns,
            tdv,
            cursor: 0,
        }
    }
}

impl TupleCollector for ReturningCollector<'_> {
    fn collect(&mut self, ctx: &Context, row: &mut [HeapTuplePtr]) -> Result<()> {
        let source = row[0];
        let target = *self.targets.get(self.cursor).ok_or_else(|| {
            Error::Invariant(format!(
                "backend returned more rows than the {} tuples written",
                self.targets.len()
            ))
        })?;
        self.cursor += 1;

        let src_buffer = ctx.heap().buffer_of(source)?;
        let dst_buffer = ctx.heap().buffer_of(target)?;

        for column in self.columns {
            let field = self.tdv.field_by_name(column)?;
            let value = src_buffer.with_tuple(source, |t| t.get_raw(field))?;
            match value {
                Some(bytes) => {
                    dst_buffer
                        .with_tuple_mut(target, |t, scope| t.set_raw(field, &bytes, scope))?;
                }
                None => {
                    dst_buffer.with_tuple_mut(target, |t, _| {
                        t.set_null(field);
                        Ok(())
                    })?;
                }
            }
        }

        src_buffer.free_tuple(source)?;
        Ok(())
    }

    fn rows(&self) -> u64 {
        self.cursor as u64
    }
}

/// Swallows rows after releasing their tuples; the discard step's sink.
pub struct NullCollector;

impl TupleCollector for NullCollector {
    fn collect(&mut self, ctx: &Context, row: &mut [HeapTuplePtr]) -> Result<()> {
        for htp in row.iter() {
            ctx.heap().buffer_of(*htp)?.free_tuple(*htp)?;
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
    fn test_rowset_blocks_grow_exponentially() {
        let mut rows = RowSet::new();
        let row = [HeapTuplePtr(1), HeapTuplePtr(2)];
        for _ in 0..100 {
            rows.push_row(&row).unwrap();
        }
        assert_eq!(rows.len(), 100);
        assert_eq!(rows.rtups(), 2);
        // 16 + 32 + 64 rows covers 100 in three blocks.
        assert_eq!(rows.blocks.len(), 3);
        assert!(rows.iter_rows().all(|r| r == row));
    }

    #[test]
    fn test_rowset_rejects_width_change() {
        let mut rows = RowSet::new();
        rows.push_row(&[HeapTuplePtr(1)]).unwrap();
        assert!(rows.push_row(&[HeapTuplePtr(1), HeapTuplePtr(2)]).is_err());
    }

    #[test]
    fn test_rowset_column_extraction() {
        let mut rows = RowSet::new();
        rows.push_row(&[HeapTuplePtr(1), HeapTuplePtr(10)]).unwrap();
        rows.push_row(&[HeapTuplePtr(2), HeapTuplePtr(20)]).unwrap();
        assert_eq!(rows.column(1), vec![HeapTuplePtr(10), HeapTuplePtr(20)]);
    }
}
