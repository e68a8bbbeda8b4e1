//! Cluster data model
//!
//! Tables, partitions and the per-host size observations collected at the
//! start of every run. Ordered maps are used throughout so that iteration
//! order, and therefore the computed plan, never depends on hashing.

use ckrebalance_core::{MERGE_TREE_PATTERN, REPLICATED_PREFIX};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// A table, identified by database and name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TableRef {
    pub database: String,
    pub name: String,
}

impl TableRef {
    pub fn new(database: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            name: name.into(),
        }
    }

    /// Backtick-quoted `database`.`name` for use in SQL
    pub fn quoted(&self) -> String {
        format!(
            "`{}`.`{}`",
            self.database.replace('`', "\\`"),
            self.name.replace('`', "\\`")
        )
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.name)
    }
}

/// Storage engine family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineKind {
    MergeTree,
    ReplicatedMergeTree,
    Other,
}

impl EngineKind {
    /// Classify a `system.tables.engine` value
    pub fn from_engine(engine: &str) -> Self {
        if !engine.contains(MERGE_TREE_PATTERN) {
            EngineKind::Other
        } else if engine.starts_with(REPLICATED_PREFIX) {
            EngineKind::ReplicatedMergeTree
        } else {
            EngineKind::MergeTree
        }
    }

    /// Only the MergeTree family has partitions we can move
    pub fn is_eligible(&self) -> bool {
        !matches!(self, EngineKind::Other)
    }

    pub fn is_replicated(&self) -> bool {
        matches!(self, EngineKind::ReplicatedMergeTree)
    }
}

/// A discovered table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub table: TableRef,
    pub engine: String,
    pub kind: EngineKind,
}

impl TableInfo {
    pub fn new(database: &str, name: &str, engine: &str) -> Self {
        Self {
            table: TableRef::new(database, name),
            engine: engine.to_string(),
            kind: EngineKind::from_engine(engine),
        }
    }
}

/// One partition as reported by a single host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStat {
    /// Directory prefix of the partition's parts
    pub partition_id: String,
    /// Partition expression value, for humans
    pub partition: String,
    /// Bytes of active parts on disk
    pub bytes: u64,
}

/// Every host's observation of a table's partitions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSizes {
    /// partition id -> host -> bytes
    pub by_partition: BTreeMap<String, BTreeMap<String, u64>>,
    /// partition id -> display value
    pub names: BTreeMap<String, String>,
}

impl PartitionSizes {
    /// Record one host's observation
    pub fn observe(&mut self, host: &str, stat: &PartitionStat) {
        *self
            .by_partition
            .entry(stat.partition_id.clone())
            .or_default()
            .entry(host.to_string())
            .or_default() += stat.bytes;
        self.names
            .entry(stat.partition_id.clone())
            .or_insert_with(|| stat.partition.clone());
    }

    /// Display value of a partition, falling back to its id
    pub fn name_of<'a>(&'a self, partition_id: &'a str) -> &'a str {
        self.names
            .get(partition_id)
            .map(String::as_str)
            .unwrap_or(partition_id)
    }

    /// Bytes of this table held by `host`
    pub fn host_bytes(&self, host: &str) -> u64 {
        self.by_partition
            .values()
            .filter_map(|hosts| hosts.get(host))
            .sum()
    }
}

/// Per-table partition sizes for the whole cluster
pub type SizeMap = BTreeMap<TableRef, PartitionSizes>;

/// Everything collected about the cluster in one pass
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    /// Shard hosts, in configured order
    pub hosts: Vec<String>,
    pub sizes: SizeMap,
    /// table -> host -> on-disk table directory
    pub data_paths: BTreeMap<TableRef, BTreeMap<String, String>>,
}

impl ClusterSnapshot {
    /// Total bytes per host; hosts without data report 0
    pub fn host_totals(&self) -> BTreeMap<String, u64> {
        let mut totals: BTreeMap<String, u64> =
            self.hosts.iter().map(|h| (h.clone(), 0)).collect();
        for sizes in self.sizes.values() {
            for hosts in sizes.by_partition.values() {
                for (host, bytes) in hosts {
                    *totals.entry(host.clone()).or_default() += bytes;
                }
            }
        }
        totals
    }

    pub fn total_bytes(&self) -> u64 {
        self.host_totals().values().sum()
    }

    /// Table directory of `table` on `host`
    pub fn data_path(&self, table: &TableRef, host: &str) -> Option<&str> {
        self.data_paths
            .get(table)
            .and_then(|paths| paths.get(host))
            .map(String::as_str)
    }
}

/// Table directory used when the catalog does not report one
pub fn default_data_path(data_dir: &str, table: &TableRef) -> String {
    format!(
        "{}/clickhouse/data/{}/{}/",
        data_dir.trim_end_matches('/'),
        table.database,
        table.name
    )
}

/// Holding area for detached parts under a table directory
pub fn detached_dir(data_path: &str) -> String {
    format!("{}/detached", data_path.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(id: &str, bytes: u64) -> PartitionStat {
        PartitionStat {
            partition_id: id.to_string(),
            partition: format!("'{}'", id),
            bytes,
        }
    }

    #[test]
    fn test_engine_kind() {
        assert_eq!(EngineKind::from_engine("MergeTree"), EngineKind::MergeTree);
        assert_eq!(
            EngineKind::from_engine("ReplacingMergeTree"),
            EngineKind::MergeTree
        );
        assert_eq!(
            EngineKind::from_engine("ReplicatedSummingMergeTree"),
            EngineKind::ReplicatedMergeTree
        );
        assert_eq!(EngineKind::from_engine("Distributed"), EngineKind::Other);
        assert!(!EngineKind::Other.is_eligible());
        assert!(EngineKind::ReplicatedMergeTree.is_replicated());
    }

    #[test]
    fn test_table_ref_quoting() {
        let table = TableRef::new("metrics", "events");
        assert_eq!(table.quoted(), "`metrics`.`events`");
        assert_eq!(table.to_string(), "metrics.events");
    }

    #[test]
    fn test_partition_sizes_observe() {
        let mut sizes = PartitionSizes::default();
        sizes.observe("ch1", &stat("202401", 100));
        sizes.observe("ch2", &stat("202401", 50));
        sizes.observe("ch1", &stat("202402", 10));

        assert_eq!(sizes.by_partition["202401"].len(), 2);
        assert_eq!(sizes.host_bytes("ch1"), 110);
        assert_eq!(sizes.host_bytes("ch3"), 0);
        assert_eq!(sizes.name_of("202401"), "'202401'");
        assert_eq!(sizes.name_of("unknown"), "unknown");
    }

    #[test]
    fn test_snapshot_totals_include_empty_hosts() {
        let mut sizes = PartitionSizes::default();
        sizes.observe("ch1", &stat("all", 700));

        let snapshot = ClusterSnapshot {
            hosts: vec!["ch1".to_string(), "ch2".to_string()],
            sizes: [(TableRef::new("db", "t"), sizes)].into_iter().collect(),
            data_paths: BTreeMap::new(),
        };

        let totals = snapshot.host_totals();
        assert_eq!(totals["ch1"], 700);
        assert_eq!(totals["ch2"], 0);
        assert_eq!(snapshot.total_bytes(), 700);
    }

    #[test]
    fn test_paths() {
        let table = TableRef::new("db", "t");
        assert_eq!(default_data_path("/var/lib/", &table), "/var/lib/clickhouse/data/db/t/");
        assert_eq!(
            detached_dir("/var/lib/clickhouse/data/db/t/"),
            "/var/lib/clickhouse/data/db/t/detached"
        );
    }
}
