//! Hierarchical memory scopes.
//!
//! A `MemScope` is a named region in a tree of regions. Storage charged to a
//! scope is released in bulk when the scope is destroyed — dropping the last
//! handle to a scope drops every descendant with it, so a transaction or an
//! execution plan can tear down everything it allocated without individual
//! frees. Per-scope statistics (allocations, frees, bytes in use) are kept
//! for observability.
//!
//! Ownership does the heavy lifting here: buffers and plans hold their data
//! directly and *charge* it to a scope with [`MemScope::track`] /
//! [`MemScope::untrack`], so the accounting survives while Rust's drop order
//! guarantees the actual release.
//!
//! The "current" scope is a per-thread stack: [`switch`] makes a scope
//! current and restores the previous one when the returned guard drops.

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

// ============================================================================
// Statistics
// ============================================================================

/// Counters maintained per scope. `bytes_in_use` only reflects storage
/// explicitly charged via [`MemScope::track`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeStats {
    pub allocs: u64,
    pub frees: u64,
    pub bytes_in_use: usize,
    pub bytes_released: usize,
}

// ============================================================================
// MemScope
// ============================================================================

struct ScopeInner {
    name: String,
    parent: Weak<ScopeInner>,
    children: Mutex<Vec<Arc<ScopeInner>>>,
    stats: Mutex<ScopeStats>,
}

/// A named allocation region. Cheap to clone; all clones refer to the same
/// region.
#[derive(Clone)]
pub struct MemScope {
    inner: Arc<ScopeInner>,
}

impl MemScope {
    /// Create a root scope with no parent.
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                name: name.into(),
                parent: Weak::new(),
                children: Mutex::new(Vec::new()),
                stats: Mutex::new(ScopeStats::default()),
            }),
        }
    }

    /// Create a child scope. The child keeps its parent alive; destroying the
    /// parent destroys every descendant that is not otherwise referenced.
    pub fn child(&self, name: impl Into<String>) -> Self {
        let child = Arc::new(ScopeInner {
            name: name.into(),
            parent: Arc::downgrade(&self.inner),
            children: Mutex::new(Vec::new()),
            stats: Mutex::new(ScopeStats::default()),
        });
        self.inner.children.lock().push(Arc::clone(&child));
        Self { inner: child }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Full `/`-separated path from the root, for diagnostics.
    pub fn path(&self) -> String {
        match self.inner.parent.upgrade() {
            Some(parent) => {
                let parent = MemScope { inner: parent };
                format!("{}/{}", parent.path(), self.inner.name)
            }
            None => self.inner.name.clone(),
        }
    }

    /// Charge `bytes` of storage to this scope.
    pub fn track(&self, bytes: usize) {
        let mut stats = self.inner.stats.lock();
        stats.allocs += 1;
        stats.bytes_in_use += bytes;
    }

    /// Release a previous charge of `bytes`.
    pub fn untrack(&self, bytes: usize) {
        let mut stats = self.inner.stats.lock();
        stats.frees += 1;
        stats.bytes_in_use = stats.bytes_in_use.saturating_sub(bytes);
        stats.bytes_released += bytes;
    }

    /// Adjust an existing charge without counting an alloc/free pair, for
    /// in-place growth of a tracked allocation.
    pub fn retrack(&self, old_bytes: usize, new_bytes: usize) {
        let mut stats = self.inner.stats.lock();
        stats.bytes_in_use = stats.bytes_in_use.saturating_sub(old_bytes) + new_bytes;
    }

    pub fn stats(&self) -> ScopeStats {
        *self.inner.stats.lock()
    }

    /// Bytes in use by this scope and every descendant.
    pub fn total_in_use(&self) -> usize {
        let mut total = self.inner.stats.lock().bytes_in_use;
        for child in self.inner.children.lock().iter() {
            total += MemScope { inner: Arc::clone(child) }.total_in_use();
        }
        total
    }

    /// Detach every child scope, releasing descendants that are not otherwise
    /// referenced. The scope itself stays usable.
    pub fn reset_children(&self) {
        self.inner.children.lock().clear();
    }

    /// True when both handles refer to the same region.
    pub fn same_as(&self, other: &MemScope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for MemScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("MemScope")
            .field("name", &self.inner.name)
            .field("bytes_in_use", &stats.bytes_in_use)
            .finish()
    }
}

// ============================================================================
// Chunk headers
// ============================================================================

/// High bit of the size word: the back-reference is a byte offset to a
/// superblock rather than a scope id. Offset-based back-references survive a
/// region being mapped at different virtual addresses.
pub const CHUNK_FLAG_SUPERBLOCK: u64 = 1 << 63;

/// Encoded length of a chunk header: back-reference word + size word.
pub const CHUNK_HEADER_LEN: usize = 16;

/// Who an allocation belongs to, as recorded in the word before its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOwner {
    /// A scope, by stable id.
    Scope(u64),
    /// Bytes to walk backwards (over the header itself) to reach the
    /// owning superblock.
    SuperblockOffset(u64),
}

/// The small header preceding every region-managed allocation, letting
/// free and realloc find the owner without being told the scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub size: u64,
    pub owner: ChunkOwner,
}

impl ChunkHeader {
    /// Encode as the two words that immediately precede a payload:
    /// `[owner][size|flag]`.
    pub fn encode(&self) -> [u8; CHUNK_HEADER_LEN] {
        let (owner_word, flag) = match self.owner {
            ChunkOwner::Scope(id) => (id, 0),
            ChunkOwner::SuperblockOffset(off) => (off, CHUNK_FLAG_SUPERBLOCK),
        };
        let mut out = [0u8; CHUNK_HEADER_LEN];
        out[..8].copy_from_slice(&owner_word.to_le_bytes());
        out[8..].copy_from_slice(&(self.size | flag).to_le_bytes());
        out
    }

    /// Decode from the bytes immediately preceding a payload.
    pub fn decode(header: &[u8; CHUNK_HEADER_LEN]) -> Self {
        let owner_word = u64::from_le_bytes(header[..8].try_into().expect("eight bytes"));
        let size_word = u64::from_le_bytes(header[8..].try_into().expect("eight bytes"));
        let owner = if size_word & CHUNK_FLAG_SUPERBLOCK != 0 {
            ChunkOwner::SuperblockOffset(owner_word)
        } else {
            ChunkOwner::Scope(owner_word)
        };
        Self {
            size: size_word & !CHUNK_FLAG_SUPERBLOCK,
            owner,
        }
    }
}

// ============================================================================
// Thread-local current scope
// ============================================================================

thread_local! {
    static CURRENT: RefCell<Vec<MemScope>> = const { RefCell::new(Vec::new()) };
}

/// Guard returned by [`switch`]; restores the previously current scope on
/// drop.
pub struct ScopeGuard {
    _private: (),
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Make `scope` the current scope for this thread until the guard drops.
#[must_use = "the previous scope is restored when the guard drops"]
pub fn switch(scope: &MemScope) -> ScopeGuard {
    CURRENT.with(|stack| stack.borrow_mut().push(scope.clone()));
    ScopeGuard { _private: () }
}

/// The thread's current scope, if one was switched in.
pub fn current() -> Option<MemScope> {
    CURRENT.with(|stack| stack.borrow().last().cloned())
}

/// Depth of the thread's scope stack. Boundaries use this to unwind back to
/// the depth they were installed at.
pub(crate) fn stack_depth() -> usize {
    CURRENT.with(|stack| stack.borrow().len())
}

/// Truncate the thread's scope stack to `depth`, restoring the scope that was
/// current when a boundary was installed.
pub(crate) fn unwind_to(depth: usize) {
    CURRENT.with(|stack| stack.borrow_mut().truncate(depth));
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_untrack() {
        let scope = MemScope::root("general");
        scope.track(128);
        scope.track(64);
        assert_eq!(scope.stats().bytes_in_use, 192);
        assert_eq!(scope.stats().allocs, 2);

        scope.untrack(64);
        assert_eq!(scope.stats().bytes_in_use, 128);
        assert_eq!(scope.stats().frees, 1);
        assert_eq!(scope.stats().bytes_released, 64);
    }

    #[test]
    fn test_child_totals() {
        let root = MemScope::root("root");
        let xact = root.child("xact");
        let plan = xact.child("plan");

        root.track(10);
        xact.track(20);
        plan.track(30);

        assert_eq!(root.total_in_use(), 60);
        assert_eq!(xact.total_in_use(), 50);
        assert_eq!(root.path(), "root");
        assert_eq!(plan.path(), "root/xact/plan");
    }

    #[test]
    fn test_reset_children_releases() {
        let root = MemScope::root("root");
        {
            let child = root.child("tmp");
            child.track(100);
            assert_eq!(root.total_in_use(), 100);
        }
        // Handle dropped, but the tree still holds the child.
        assert_eq!(root.total_in_use(), 100);
        root.reset_children();
        assert_eq!(root.total_in_use(), 0);
    }

    #[test]
    fn test_chunk_header_roundtrip() {
        let scoped = ChunkHeader {
            size: 4096,
            owner: ChunkOwner::Scope(7),
        };
        assert_eq!(ChunkHeader::decode(&scoped.encode()), scoped);

        let shared = ChunkHeader {
            size: 512,
            owner: ChunkOwner::SuperblockOffset(32768),
        };
        let encoded = shared.encode();
        // The flag rides the size word; decoding strips it back out.
        let size_word = u64::from_le_bytes(encoded[8..].try_into().unwrap());
        assert_ne!(size_word & CHUNK_FLAG_SUPERBLOCK, 0);
        assert_eq!(ChunkHeader::decode(&encoded), shared);
    }

    #[test]
    fn test_current_scope_stack() {
        let a = MemScope::root("a");
        let b = a.child("b");

        assert!(current().is_none());
        {
            let _ga = switch(&a);
            assert!(current().unwrap().same_as(&a));
            {
                let _gb = switch(&b);
                assert!(current().unwrap().same_as(&b));
            }
            assert!(current().unwrap().same_as(&a));
        }
        assert!(current().is_none());
    }
}
