//! Beacons: the routing policies answering "which shard holds this?"
//!
//! A beacon attaches to a table definition. The simple beacon resolves to a
//! fixed shard; the fanout beacon spreads one table over several shards of
//! one backend; the partition beacon maintains a partition map and routes by
//! a deterministic hash of the container name.
//!
//! ## Partition id rule
//!
//! The container name is split into `base[@affinity][/subN[_M]]`:
//!
//! - the hash base is the lowercased `base`; a non-numeric `@affinity`
//!   replaces it (data-affinity semantics), a numeric one names a placement
//!   group and leaves routing alone;
//! - the hash is CRC-32 of the hash base;
//! - `/subN` adds `N` modulo the partition count;
//! - `_M` after the sub id engages the alternate modulo rule for
//!   sub-partitioned containers;
//! - the empty name is the system container, partition 0.
//!
//! With a count of 17, `"Orders@3/sub5"` resolves to
//! `((crc32("orders") % 17) + 5) % 17`.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::context::Context;
use crate::heap::HeapTuplePtr;
use crate::schema::TableDef;
use crate::{Error, Result};

use super::Shard;

// ============================================================================
// Beacon trait
// ============================================================================

/// Routing policy attached to a table definition.
pub trait Beacon: Send + Sync {
    /// The shard holding one tuple. The default resolves the tuple's table
    /// and routes by table. `assign` permits lazy placement policies to pick
    /// a shard for unplaced tuples.
    fn shard_for_tuple(
        &self,
        ctx: &Context,
        htp: HeapTuplePtr,
        assign: bool,
    ) -> Result<Arc<Shard>> {
        let _ = assign;
        let buffer = ctx.heap().buffer_of(htp)?;
        let table_id = buffer.with_tuple(htp, |t| Ok(t.table))?;
        let table = ctx.tables().by_id(table_id)?;
        self.shard_for_table(&table)
    }

    /// Group a tuple list by shard.
    fn shards_for_tuples(
        &self,
        ctx: &Context,
        htps: &[HeapTuplePtr],
        assign: bool,
    ) -> Result<Vec<(HeapTuplePtr, Arc<Shard>)>> {
        htps.iter()
            .map(|htp| Ok((*htp, self.shard_for_tuple(ctx, *htp, assign)?)))
            .collect()
    }

    /// The primary shard for a table.
    fn shard_for_table(&self, td: &TableDef) -> Result<Arc<Shard>>;

    /// Every shard holding rows of the table. Single-shard policies return
    /// one entry.
    fn shards_for_table(&self, td: &TableDef) -> Result<Vec<Arc<Shard>>> {
        Ok(vec![self.shard_for_table(td)?])
    }

    fn connect(&self) -> Result<()> {
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    fn finalize(&self) {}
}

// ============================================================================
// SingleBeacon
// ============================================================================

/// Everything lives on one fixed shard.
pub struct SingleBeacon {
    shard: Arc<Shard>,
}

impl SingleBeacon {
    pub fn new(shard: Arc<Shard>) -> Arc<Self> {
        Arc::new(Self { shard })
    }
}

impl Beacon for SingleBeacon {
    fn shard_for_table(&self, _td: &TableDef) -> Result<Arc<Shard>> {
        Ok(Arc::clone(&self.shard))
    }
}

// ============================================================================
// FanoutBeacon
// ============================================================================

/// One table spread across several shards with identical schemas. Reads fan
/// out to every shard; unplaced writes land on the first.
pub struct FanoutBeacon {
    shards: Vec<Arc<Shard>>,
}

impl FanoutBeacon {
    pub fn new(shards: Vec<Arc<Shard>>) -> Result<Arc<Self>> {
        if shards.is_empty() {
            return Err(Error::UserInput("fanout beacon needs at least one shard".into()));
        }
        Ok(Arc::new(Self { shards }))
    }
}

impl Beacon for FanoutBeacon {
    fn shard_for_table(&self, _td: &TableDef) -> Result<Arc<Shard>> {
        Ok(Arc::clone(&self.shards[0]))
    }

    fn shards_for_table(&self, _td: &TableDef) -> Result<Vec<Arc<Shard>>> {
        Ok(self.shards.clone())
    }
}

// ============================================================================
// PartitionBeacon
// ============================================================================

/// Per-partition placement.
#[derive(Clone)]
pub struct PartitionMeta {
    pub partition_id: i32,
    pub primary: Arc<Shard>,
    pub backups: Vec<Arc<Shard>>,
}

struct PartitionState {
    partition_count: i32,
    partitions: Vec<PartitionMeta>,
}

/// Routes container names to partitions, partitions to shards. The
/// partition map is refreshed from the cluster master out of band; routing
/// itself never blocks.
pub struct PartitionBeacon {
    state: RwLock<PartitionState>,
    master: Option<Arc<Shard>>,
}

impl PartitionBeacon {
    /// Build with `partition_count` partitions spread round-robin over
    /// `primaries`.
    pub fn new(partition_count: i32, primaries: Vec<Arc<Shard>>) -> Result<Arc<Self>> {
        if partition_count <= 0 {
            return Err(Error::UserInput(
                "partition count must be positive".into(),
            ));
        }
        if primaries.is_empty() {
            return Err(Error::UserInput(
                "partition beacon needs at least one shard".into(),
            ));
        }
        let partitions = (0..partition_count)
            .map(|pid| PartitionMeta {
                partition_id: pid,
                primary: Arc::clone(&primaries[pid as usize % primaries.len()]),
                backups: Vec::new(),
            })
            .collect();
        Ok(Arc::new(Self {
            state: RwLock::new(PartitionState {
                partition_count,
                partitions,
            }),
            master: None,
        }))
    }

    pub fn master(&self) -> Option<&Arc<Shard>> {
        self.master.as_ref()
    }

    pub fn partition_count(&self) -> i32 {
        self.state.read().partition_count
    }

    /// Replace the partition map after a refresh from the cluster.
    pub fn set_partition_map(&self, partitions: Vec<PartitionMeta>) -> Result<()> {
        if partitions.is_empty() {
            return Err(Error::UserInput("empty partition map".into()));
        }
        let mut state = self.state.write();
        state.partition_count = partitions.len() as i32;
        state.partitions = partitions;
        Ok(())
    }

    /// The partition holding `container_name`, per the module-level rule.
    pub fn partition_id(&self, container_name: &str) -> Result<i32> {
        let count = self.state.read().partition_count;
        calc_partition_id(count, container_name)
    }

    pub fn partition_meta(&self, partition_id: i32) -> Result<PartitionMeta> {
        let state = self.state.read();
        state
            .partitions
            .get(partition_id as usize)
            .cloned()
            .ok_or_else(|| Error::Invariant(format!("partition {partition_id} not mapped")))
    }
}

impl Beacon for PartitionBeacon {
    fn shard_for_table(&self, td: &TableDef) -> Result<Arc<Shard>> {
        let pid = self.partition_id(&td.name)?;
        Ok(self.partition_meta(pid)?.primary)
    }

    fn shards_for_table(&self, _td: &TableDef) -> Result<Vec<Arc<Shard>>> {
        let state = self.state.read();
        let mut out: Vec<Arc<Shard>> = Vec::new();
        for meta in &state.partitions {
            if !out.iter().any(|s| s.id == meta.primary.id) {
                out.push(Arc::clone(&meta.primary));
            }
        }
        Ok(out)
    }
}

// ============================================================================
// Partition calculation
// ============================================================================

const SYSTEM_CONTAINER_PARTITION_ID: i32 = 0;

fn hash_base(name: &str) -> u32 {
    crc32fast::hash(name.to_lowercase().as_bytes())
}

/// Compute the partition for a container name. See the module docs for the
/// rule; every malformed shape gets its own error.
pub fn calc_partition_id(partition_count: i32, container_name: &str) -> Result<i32> {
    if partition_count <= 0 {
        return Err(Error::PlanError("partitions not loaded".into()));
    }
    if container_name.is_empty() {
        return Ok(SYSTEM_CONTAINER_PARTITION_ID);
    }
    if container_name.starts_with('/') {
        return Err(Error::UserInput(
            "container name cannot begin with '/'".into(),
        ));
    }
    if container_name.starts_with('@') {
        return Err(Error::UserInput(
            "container affinity cannot come first".into(),
        ));
    }

    let affinity_at = container_name.find('@');
    let sub_at = container_name.find('/');

    if let (Some(a), Some(s)) = (affinity_at, sub_at) {
        if a > s || a + 1 == s {
            return Err(Error::UserInput(
                "malformed affinity and sub-partition combination".into(),
            ));
        }
    }

    let base_end = affinity_at.or(sub_at).unwrap_or(container_name.len());
    let base = &container_name[..base_end];

    // A textual affinity replaces the hash base; a numeric one names a
    // placement group and leaves routing alone.
    let mut hash_source = base;
    if let Some(a) = affinity_at {
        let affinity_end = sub_at.unwrap_or(container_name.len());
        let affinity = &container_name[a + 1..affinity_end];
        if affinity.is_empty() {
            return Err(Error::UserInput("empty container affinity".into()));
        }
        if affinity.parse::<i64>().is_err() {
            hash_source = affinity;
        }
    }
    let hash = hash_base(hash_source);

    // Sub-partition suffix: optional alpha prefix, then the sub id, then an
    // optional `_M` partitioning rule.
    let mut sub_id: Option<i64> = None;
    let mut partitioning: Option<i64> = None;
    if let Some(s) = sub_at {
        let suffix = &container_name[s + 1..];
        let (sub_text, rule_text) = match suffix.find('_') {
            Some(u) => (&suffix[..u], Some(&suffix[u + 1..])),
            None => (suffix, None),
        };
        let digits = sub_text.trim_start_matches(|c: char| !c.is_ascii_digit());
        let parsed: i64 = digits
            .parse()
            .map_err(|_| Error::UserInput(format!("sub-partition '{sub_text}' is not numeric")))?;
        sub_id = Some(parsed);

        if let Some(rule) = rule_text {
            let m: i64 = rule.parse().map_err(|_| {
                Error::UserInput(format!("partitioning count '{rule}' is not numeric"))
            })?;
            if m <= 0 {
                return Err(Error::UserInput("partitioning count must be positive".into()));
            }
            partitioning = Some(m);
        }
    }

    let count = partition_count as i64;
    let partition = match (sub_id, partitioning) {
        (None, _) => (hash as i64) % count,
        (Some(sub), None) => (((hash as i64) % count) + sub) % count,
        (Some(sub), Some(m)) => {
            if count <= m {
                sub % count
            } else {
                let pbase = count / m;
                let pmod = count % m;
                (pbase * sub + pmod.min(sub) + (hash as i64) % pbase) % count
            }
        }
    };

    Ok(partition as i32)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::shard::{CredentialHandle, ShardAccess, ShardId};

    fn shards(n: usize) -> Vec<Arc<Shard>> {
        let backend = MemoryBackend::shared("part");
        let cred = CredentialHandle::plaintext("u", "p", "h", 1).unwrap();
        (0..n)
            .map(|i| {
                Shard::new(
                    ShardId::from_name(&format!("s{i}")),
                    ShardAccess::new(Arc::clone(&backend) as _, cred.clone()),
                    None,
                )
            })
            .collect()
    }

    #[test]
    fn test_partition_id_matches_contract() {
        // Count 17, "Orders@3/sub5": ((crc32("orders") % 17) + 5) % 17.
        let expected = ((crc32fast::hash(b"orders") % 17) as i32 + 5) % 17;
        assert_eq!(calc_partition_id(17, "Orders@3/sub5").unwrap(), expected);
    }

    #[test]
    fn test_partition_id_plain_name_lowercases() {
        let expected = (crc32fast::hash(b"orders") % 17) as i32;
        assert_eq!(calc_partition_id(17, "Orders").unwrap(), expected);
        assert_eq!(calc_partition_id(17, "ORDERS").unwrap(), expected);
    }

    #[test]
    fn test_partition_id_textual_affinity_redirects_hash() {
        let expected = (crc32fast::hash(b"hot") % 17) as i32;
        assert_eq!(calc_partition_id(17, "Orders@hot").unwrap(), expected);
    }

    #[test]
    fn test_partition_id_system_container() {
        assert_eq!(calc_partition_id(17, "").unwrap(), 0);
    }

    #[test]
    fn test_partition_id_alternate_modulo() {
        // count 10, M 4: pbase 2, pmod 2, sub 3.
        let hash = crc32fast::hash(b"orders") as i64;
        let expected = ((2 * 3 + 2 + hash % 2) % 10) as i32;
        assert_eq!(calc_partition_id(10, "Orders/3_4").unwrap(), expected);

        // count <= M short-circuits to sub % count.
        assert_eq!(calc_partition_id(4, "Orders/7_8").unwrap(), 3);
    }

    #[test]
    fn test_partition_id_malformed_names() {
        assert!(calc_partition_id(0, "Orders").is_err());
        assert!(calc_partition_id(17, "/Orders").is_err());
        assert!(calc_partition_id(17, "@hot/1").is_err());
        assert!(calc_partition_id(17, "Orders/sub").is_err());
        assert!(calc_partition_id(17, "Orders/1_x").is_err());
        assert!(calc_partition_id(17, "Orders@/1").is_err());
    }

    #[test]
    fn test_partition_beacon_routes_to_primary() {
        let primaries = shards(3);
        let beacon = PartitionBeacon::new(17, primaries.clone()).unwrap();

        let pid = beacon.partition_id("Orders@3/sub5").unwrap();
        let meta = beacon.partition_meta(pid).unwrap();
        assert_eq!(meta.partition_id, pid);
        assert_eq!(meta.primary.id, primaries[pid as usize % 3].id);
    }

    #[test]
    fn test_fanout_lists_every_shard() {
        let all = shards(3);
        let beacon = FanoutBeacon::new(all.clone()).unwrap();
        let catalog = crate::schema::TableCatalog::new();
        let td = catalog
            .add(crate::schema::TableDef::build("t").field("id", &crate::types::builtin::int64()))
            .unwrap();

        assert_eq!(beacon.shards_for_table(&td).unwrap().len(), 3);
        assert_eq!(beacon.shard_for_table(&td).unwrap().id, all[0].id);
    }
}
