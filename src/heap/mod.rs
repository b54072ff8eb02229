//! Heap buffers: page-backed tuple storage behind stable opaque handles.
//!
//! A buffer is a numbered arena of fixed-size pages, each with a slot
//! directory. Slot `s` of page `p` in buffer `b` is addressable as the
//! 64-bit [`HeapTuplePtr`] `(b, p, s)`, stable for the life of the slot.
//! Closing a buffer invalidates every pointer it vended and releases the
//! buffer's memory scope — out-of-line varlen bytes included, so nothing
//! leaks.
//!
//! Dereferencing is bracketed: [`HeapBuffer::with_tuple`] /
//! [`HeapBuffer::with_tuple_mut`] pin the tuple for the closure's duration.

pub mod tuple;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::mem::MemScope;
use crate::schema::TupleDefVersion;
use crate::{Error, Result};

pub use tuple::{Tuple, TupleFlags, VARLEN_INLINE_MAX};

/// Byte budget per page.
pub const PAGE_SIZE: usize = 8192;

// ============================================================================
// Identifiers
// ============================================================================

/// Small integer naming an open buffer. Zero is never vended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct HeapBufferNo(pub u16);

/// Opaque 64-bit tuple handle packing `(buffer, page, slot)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct HeapTuplePtr(pub u64);

impl HeapTuplePtr {
    pub fn new(hbno: HeapBufferNo, page: u32, slot: u16) -> Self {
        Self(((hbno.0 as u64) << 48) | ((page as u64) << 16) | slot as u64)
    }

    pub fn hbno(self) -> HeapBufferNo {
        HeapBufferNo((self.0 >> 48) as u16)
    }

    pub fn page(self) -> u32 {
        ((self.0 >> 16) & 0xffff_ffff) as u32
    }

    pub fn slot(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl std::fmt::Display for HeapTuplePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.hbno().0, self.page(), self.slot())
    }
}

// ============================================================================
// Pages
// ============================================================================

struct Page {
    slots: Vec<Option<Tuple>>,
    bytes_used: usize,
}

impl Page {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            bytes_used: 0,
        }
    }
}

// ============================================================================
// HeapBuffer
// ============================================================================

struct BufferInner {
    pages: Vec<Page>,
    generation: u32,
}

/// One open buffer: its pages plus the scope all of its storage charges.
pub struct HeapBuffer {
    no: HeapBufferNo,
    name: String,
    scope: MemScope,
    inner: RwLock<BufferInner>,
}

impl HeapBuffer {
    pub fn no(&self) -> HeapBufferNo {
        self.no
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> &MemScope {
        &self.scope
    }

    /// Allocate a fresh all-null tuple laid out by `tdv`. Picks the first
    /// page with room, or grows by one page.
    pub fn alloc_tuple(&self, tdv: &Arc<TupleDefVersion>) -> Result<HeapTuplePtr> {
        let mut inner = self.inner.write();
        inner.generation = inner.generation.wrapping_add(1);
        let generation = inner.generation;

        let tuple = Tuple::new(tdv, self.no, generation);
        let footprint = tuple.footprint();

        let page_idx = match inner
            .pages
            .iter()
            .position(|p| p.bytes_used + footprint <= PAGE_SIZE)
        {
            Some(idx) => idx,
            None => {
                inner.pages.push(Page::new());
                inner.pages.len() - 1
            }
        };

        let page = &mut inner.pages[page_idx];
        if page.slots.len() > u16::MAX as usize {
            return Err(Error::Allocation {
                scope: self.scope.name().to_string(),
                detail: "page slot directory full".into(),
            });
        }
        let slot_idx = page.slots.len() as u16;
        page.bytes_used += footprint;
        page.slots.push(Some(tuple));
        self.scope.track(footprint);

        Ok(HeapTuplePtr::new(self.no, page_idx as u32, slot_idx))
    }

    fn check_owner(&self, htp: HeapTuplePtr) -> Result<()> {
        if htp.hbno() != self.no {
            return Err(Error::Invariant(format!(
                "tuple pointer {htp} does not belong to buffer {}",
                self.no.0
            )));
        }
        Ok(())
    }

    /// Pin the tuple for a read.
    pub fn with_tuple<R>(
        &self,
        htp: HeapTuplePtr,
        f: impl FnOnce(&Tuple) -> Result<R>,
    ) -> Result<R> {
        self.check_owner(htp)?;
        let inner = self.inner.read();
        let tuple = inner
            .pages
            .get(htp.page() as usize)
            .and_then(|p| p.slots.get(htp.slot() as usize))
            .and_then(|s| s.as_ref())
            .ok_or_else(|| Error::NotFound(format!("tuple {htp}")))?;
        f(tuple)
    }

    /// Pin the tuple for a write. The closure also receives the buffer's
    /// scope for varlen charging.
    pub fn with_tuple_mut<R>(
        &self,
        htp: HeapTuplePtr,
        f: impl FnOnce(&mut Tuple, &MemScope) -> Result<R>,
    ) -> Result<R> {
        self.check_owner(htp)?;
        let mut inner = self.inner.write();
        let tuple = inner
            .pages
            .get_mut(htp.page() as usize)
            .and_then(|p| p.slots.get_mut(htp.slot() as usize))
            .and_then(|s| s.as_mut())
            .ok_or_else(|| Error::NotFound(format!("tuple {htp}")))?;
        f(tuple, &self.scope)
    }

    /// Release one slot (the dedup collectors return duplicates this way).
    pub fn free_tuple(&self, htp: HeapTuplePtr) -> Result<()> {
        self.check_owner(htp)?;
        let mut inner = self.inner.write();
        let slot = inner
            .pages
            .get_mut(htp.page() as usize)
            .and_then(|p| p.slots.get_mut(htp.slot() as usize))
            .ok_or_else(|| Error::NotFound(format!("tuple {htp}")))?;
        if let Some(tuple) = slot.take() {
            self.scope.untrack(tuple.footprint() + tuple.cell_bytes());
        }
        Ok(())
    }

    /// Number of live tuples.
    pub fn live_tuples(&self) -> usize {
        self.inner
            .read()
            .pages
            .iter()
            .map(|p| p.slots.iter().flatten().count())
            .sum()
    }

    fn release_all(&self) {
        let mut inner = self.inner.write();
        for page in inner.pages.drain(..) {
            for tuple in page.slots.into_iter().flatten() {
                // Destructor pass: untracking covers both the record and any
                // out-of-line cells of destruct-requiring frames.
                self.scope.untrack(tuple.footprint() + tuple.cell_bytes());
            }
        }
    }
}

impl std::fmt::Debug for HeapBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapBuffer")
            .field("no", &self.no.0)
            .field("name", &self.name)
            .field("pages", &self.inner.read().pages.len())
            .finish()
    }
}

// ============================================================================
// Buffer table
// ============================================================================

/// The global map from buffer numbers to open buffers. Dereferencing a
/// pointer whose buffer has closed fails here.
pub struct HeapBufferTable {
    slots: RwLock<Vec<Option<Arc<HeapBuffer>>>>,
}

impl HeapBufferTable {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Open a buffer whose storage charges a child of `scope`.
    pub fn open(&self, scope: &MemScope, name: impl Into<String>) -> Result<HeapBufferNo> {
        let name = name.into();
        let mut slots = self.slots.write();
        let index = match slots.iter().position(|s| s.is_none()) {
            Some(idx) => idx,
            None => {
                slots.push(None);
                slots.len() - 1
            }
        };
        if index >= u16::MAX as usize {
            return Err(Error::Allocation {
                scope: scope.name().to_string(),
                detail: "buffer table full".into(),
            });
        }

        let no = HeapBufferNo(index as u16 + 1);
        let buffer = Arc::new(HeapBuffer {
            no,
            scope: scope.child(format!("hb:{name}")),
            name,
            inner: RwLock::new(BufferInner {
                pages: Vec::new(),
                generation: 0,
            }),
        });
        slots[index] = Some(buffer);
        Ok(no)
    }

    pub fn get(&self, no: HeapBufferNo) -> Result<Arc<HeapBuffer>> {
        if no.0 == 0 {
            return Err(Error::UserInput("buffer number zero is reserved".into()));
        }
        self.slots
            .read()
            .get(no.0 as usize - 1)
            .and_then(|s| s.clone())
            .ok_or_else(|| Error::NotFound(format!("heap buffer {}", no.0)))
    }

    /// Resolve the buffer owning a tuple pointer.
    pub fn buffer_of(&self, htp: HeapTuplePtr) -> Result<Arc<HeapBuffer>> {
        self.get(htp.hbno())
    }

    /// Close a buffer: run the destructor pass and invalidate its number.
    /// Every pointer it vended dangles afterwards.
    pub fn close(&self, no: HeapBufferNo) -> Result<()> {
        let buffer = {
            let mut slots = self.slots.write();
            slots
                .get_mut(no.0 as usize - 1)
                .and_then(|s| s.take())
                .ok_or_else(|| Error::NotFound(format!("heap buffer {}", no.0)))?
        };
        buffer.release_all();
        Ok(())
    }

    pub fn open_count(&self) -> usize {
        self.slots.read().iter().flatten().count()
    }
}

impl Default for HeapBufferTable {
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
    use crate::schema::{TableCatalog, TableDef};
    use crate::types::builtin;
    use crate::value::TypedSlot;

    fn fixture() -> (HeapBufferTable, MemScope, Arc<TupleDefVersion>) {
        let catalog = TableCatalog::new();
        let table = catalog
            .add(
                TableDef::build("t")
                    .field("id", &builtin::int64())
                    .field("name", &builtin::string()),
            )
            .unwrap();
        (HeapBufferTable::new(), MemScope::root("test"), table.leading())
    }

    #[test]
    fn test_htp_packing() {
        let htp = HeapTuplePtr::new(HeapBufferNo(7), 123_456, 42);
        assert_eq!(htp.hbno(), HeapBufferNo(7));
        assert_eq!(htp.page(), 123_456);
        assert_eq!(htp.slot(), 42);
    }

    #[test]
    fn test_alloc_deref_roundtrip() {
        let (table, scope, tdv) = fixture();
        let no = table.open(&scope, "general").unwrap();
        let buffer = table.get(no).unwrap();

        let htp = buffer.alloc_tuple(&tdv).unwrap();
        assert_eq!(htp.hbno(), no);

        buffer
            .with_tuple(htp, |t| {
                assert!(t.is_null(0));
                assert_eq!(t.table, tdv.table);
                assert_eq!(t.version, tdv.version);
                Ok(())
            })
            .unwrap();

        let id = tdv.field_by_name("id").unwrap();
        buffer
            .with_tuple_mut(htp, |t, scope| t.set(id, &TypedSlot::int64(1), scope))
            .unwrap();
        let got = buffer.with_tuple(htp, |t| t.get(id)).unwrap();
        assert_eq!(got.as_i64(), Some(1));
    }

    #[test]
    fn test_close_invalidates_pointers() {
        let (table, scope, tdv) = fixture();
        let no = table.open(&scope, "short-lived").unwrap();
        let buffer = table.get(no).unwrap();
        let htp = buffer.alloc_tuple(&tdv).unwrap();

        table.close(no).unwrap();
        assert!(table.buffer_of(htp).is_err());
        assert!(table.get(no).is_err());
    }

    #[test]
    fn test_close_releases_scope_charges() {
        let (table, scope, tdv) = fixture();
        let no = table.open(&scope, "varlen").unwrap();
        let buffer = table.get(no).unwrap();

        let name = tdv.field_by_name("name").unwrap();
        let htp = buffer.alloc_tuple(&tdv).unwrap();
        buffer
            .with_tuple_mut(htp, |t, scope| {
                t.set(name, &TypedSlot::string("y".repeat(500)), scope)
            })
            .unwrap();
        assert!(scope.total_in_use() > 500);

        table.close(no).unwrap();
        assert_eq!(buffer.scope().stats().bytes_in_use, 0);
    }

    #[test]
    fn test_free_tuple_slot() {
        let (table, scope, tdv) = fixture();
        let no = table.open(&scope, "dedup").unwrap();
        let buffer = table.get(no).unwrap();

        let a = buffer.alloc_tuple(&tdv).unwrap();
        let b = buffer.alloc_tuple(&tdv).unwrap();
        assert_eq!(buffer.live_tuples(), 2);

        buffer.free_tuple(a).unwrap();
        assert_eq!(buffer.live_tuples(), 1);
        assert!(buffer.with_tuple(a, |_| Ok(())).is_err());
        assert!(buffer.with_tuple(b, |_| Ok(())).is_ok());
    }

    #[test]
    fn test_buffer_numbers_reused_after_close() {
        let (table, scope, _tdv) = fixture();
        let first = table.open(&scope, "a").unwrap();
        table.close(first).unwrap();
        let second = table.open(&scope, "b").unwrap();
        assert_eq!(first, second);
        assert_eq!(table.open_count(), 1);
    }

    #[test]
    fn test_pages_grow_past_budget() {
        let (table, scope, tdv) = fixture();
        let no = table.open(&scope, "many").unwrap();
        let buffer = table.get(no).unwrap();

        let mut last = None;
        for _ in 0..200 {
            last = Some(buffer.alloc_tuple(&tdv).unwrap());
        }
        assert!(last.unwrap().page() > 0, "expected growth past one page");
        assert_eq!(buffer.live_tuples(), 200);
    }
}
