//! The connection catalog.
//!
//! One entry per shard access, each holding a small fixed slot array
//! (default 10) with an in-use bitmap. Acquisition reserves a slot under the
//! entry lock, then connects outside it; dropping a [`ConnLease`] returns
//! the live connection to its slot for reuse.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::backend::BackendConnection;
use crate::{Error, Result};

use super::{ShardAccess, ShardAccessId};

/// Slots per shard access unless configured otherwise.
pub const DEFAULT_SLOTS_PER_ACCESS: usize = 10;

struct Entry {
    access: Arc<ShardAccess>,
    slots: Vec<Option<Box<dyn BackendConnection>>>,
    in_use: u16,
}

impl Entry {
    fn new(access: Arc<ShardAccess>, slots: usize) -> Self {
        Self {
            access,
            slots: (0..slots).map(|_| None).collect(),
            in_use: 0,
        }
    }

    fn bit(slot: usize) -> u16 {
        1 << slot
    }
}

struct CatalogInner {
    entries: Mutex<HashMap<ShardAccessId, Entry>>,
    slots_per_access: usize,
}

/// Hands out pooled backend connections per shard access.
#[derive(Clone)]
pub struct ConnectionCatalog {
    inner: Arc<CatalogInner>,
}

impl ConnectionCatalog {
    pub fn new() -> Self {
        Self::with_slots(DEFAULT_SLOTS_PER_ACCESS)
    }

    /// Tune the per-access slot count.
    pub fn with_slots(slots_per_access: usize) -> Self {
        Self {
            inner: Arc::new(CatalogInner {
                entries: Mutex::new(HashMap::new()),
                slots_per_access: slots_per_access.clamp(1, 16),
            }),
        }
    }

    /// Acquire a connection for `access`: a pooled one when a slot holds
    /// one, otherwise a fresh connect. Fails when every slot is in use.
    pub async fn get(&self, access: &Arc<ShardAccess>) -> Result<ConnLease> {
        // Reserve under the lock; never connect while holding it.
        let (slot, pooled) = {
            let mut entries = self.inner.entries.lock();
            let entry = entries
                .entry(access.id())
                .or_insert_with(|| Entry::new(Arc::clone(access), self.inner.slots_per_access));

            let mut reserved = None;
            // Prefer a slot with a warm connection.
            for (slot, conn) in entry.slots.iter_mut().enumerate() {
                if entry.in_use & Entry::bit(slot) == 0 && conn.is_some() {
                    reserved = Some((slot, conn.take()));
                    break;
                }
            }
            if reserved.is_none() {
                for slot in 0..entry.slots.len() {
                    if entry.in_use & Entry::bit(slot) == 0 {
                        reserved = Some((slot, None));
                        break;
                    }
                }
            }
            match reserved {
                Some((slot, pooled)) => {
                    entry.in_use |= Entry::bit(slot);
                    (slot, pooled)
                }
                None => {
                    return Err(Error::BackendIo {
                        retryable: true,
                        detail: format!(
                            "all {} connection slots for backend '{}' are in use",
                            entry.slots.len(),
                            access.backend.name()
                        ),
                    });
                }
            }
        };

        let conn = match pooled {
            Some(mut conn) => {
                conn.reset();
                conn
            }
            None => {
                let mut conn = access.backend.create_connection();
                let mut cred = access.cred.retrieve();
                let connected = conn.connect(&cred, access.database.as_deref()).await;
                cred.wipe();
                if let Err(err) = connected {
                    self.unreserve(access.id(), slot);
                    return Err(err);
                }
                conn
            }
        };

        Ok(ConnLease {
            inner: Arc::clone(&self.inner),
            access: Arc::clone(access),
            slot,
            conn: Some(conn),
        })
    }

    fn unreserve(&self, id: ShardAccessId, slot: usize) {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(&id) {
            entry.in_use &= !Entry::bit(slot);
        }
    }

    /// Connections currently checked out for `access`.
    pub fn in_use(&self, access: &ShardAccess) -> usize {
        let entries = self.inner.entries.lock();
        entries
            .get(&access.id())
            .map(|e| e.in_use.count_ones() as usize)
            .unwrap_or(0)
    }

    /// Disconnect and drop every pooled (idle) connection.
    pub async fn shutdown(&self) -> Result<()> {
        let drained: Vec<Box<dyn BackendConnection>> = {
            let mut entries = self.inner.entries.lock();
            entries
                .values_mut()
                .flat_map(|e| e.slots.iter_mut().filter_map(|s| s.take()))
                .collect()
        };
        for mut conn in drained {
            conn.disconnect().await?;
        }
        Ok(())
    }
}

impl Default for ConnectionCatalog {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// ConnLease
// ============================================================================

/// A checked-out connection. Dropping it returns the connection to its
/// slot.
pub struct ConnLease {
    inner: Arc<CatalogInner>,
    access: Arc<ShardAccess>,
    slot: usize,
    conn: Option<Box<dyn BackendConnection>>,
}

impl ConnLease {
    pub fn access(&self) -> &Arc<ShardAccess> {
        &self.access
    }

    pub fn conn(&mut self) -> &mut dyn BackendConnection {
        self.conn
            .as_mut()
            .expect("lease holds its connection until dropped")
            .as_mut()
    }
}

impl Drop for ConnLease {
    fn drop(&mut self) {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(&self.access.id()) {
            entry.slots[self.slot] = self.conn.take();
            entry.in_use &= !Entry::bit(self.slot);
        }
    }
}

impl std::fmt::Debug for ConnLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnLease")
            .field("access", &self.access.id().0)
            .field("slot", &self.slot)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
