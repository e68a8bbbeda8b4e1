//! Metadata Collector
//!
//! Discovers the eligible tables and gathers per-host partition sizes:
//! - Table catalog read from the first host
//! - Database and explicit table filters
//! - Partition sizes and data paths from every host
//!
//! Collection is all-or-nothing. The first failing query aborts it.

use ckrebalance_core::{RebalanceError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::catalog::ClusterCatalog;
use crate::model::{default_data_path, ClusterSnapshot, TableInfo, TableRef};

/// Tables chosen for a run
#[derive(Debug, Clone, Default)]
pub struct TableSelection {
    /// database -> table names, both ordered
    pub db_tables: BTreeMap<String, Vec<String>>,
    pub tables: Vec<TableInfo>,
    /// Filter entries that matched no table
    pub missing: Vec<String>,
}

impl TableSelection {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table_refs(&self) -> Vec<TableRef> {
        self.tables.iter().map(|t| t.table.clone()).collect()
    }
}

/// Whether `table` is named by a filter entry (`table` or `db.table`)
fn filter_matches(entry: &str, table: &TableRef) -> bool {
    match entry.split_once('.') {
        Some((db, name)) => db == table.database && name == table.name,
        None => entry == table.name,
    }
}

/// Narrow the catalog down to `database` and the explicit `filter`
pub fn select_tables(catalog: Vec<TableInfo>, database: &str, filter: &[String]) -> TableSelection {
    let mut selection = TableSelection::default();
    let mut matched: BTreeSet<&str> = BTreeSet::new();

    for info in catalog {
        if !info.kind.is_eligible() {
            continue;
        }
        if !database.is_empty() && info.table.database != database {
            continue;
        }
        if !filter.is_empty() {
            match filter.iter().find(|entry| filter_matches(entry, &info.table)) {
                Some(entry) => {
                    matched.insert(entry.as_str());
                }
                None => continue,
            }
        }

        selection
            .db_tables
            .entry(info.table.database.clone())
            .or_default()
            .push(info.table.name.clone());
        selection.tables.push(info);
    }

    selection.missing = filter
        .iter()
        .filter(|entry| !matched.contains(entry.as_str()))
        .cloned()
        .collect();
    selection.tables.sort_by(|a, b| a.table.cmp(&b.table));
    for names in selection.db_tables.values_mut() {
        names.sort();
        names.dedup();
    }
    selection
}

/// Collection statistics
#[derive(Debug, Default)]
pub struct CollectStats {
    pub tables: usize,
    pub partitions: usize,
    pub duration: Duration,
}

/// Reads table catalogs and partition sizes from the cluster
pub struct MetadataCollector<'a> {
    catalog: &'a dyn ClusterCatalog,
    data_dir: String,
}

impl<'a> MetadataCollector<'a> {
    pub fn new(catalog: &'a dyn ClusterCatalog, data_dir: impl Into<String>) -> Self {
        Self {
            catalog,
            data_dir: data_dir.into(),
        }
    }

    /// Discover the tables to rebalance
    #[instrument(skip(self, hosts, filter))]
    pub async fn get_tables(
        &self,
        hosts: &[String],
        database: &str,
        filter: &[String],
    ) -> Result<TableSelection> {
        let first = hosts
            .first()
            .ok_or_else(|| RebalanceError::Configuration("no ClickHouse hosts".to_string()))?;

        let catalog = self.catalog.merge_tree_tables(first).await?;
        let selection = select_tables(catalog, database, filter);

        for entry in &selection.missing {
            warn!(table = %entry, "Table filter matched nothing");
        }
        info!(
            host = %first,
            databases = selection.db_tables.len(),
            tables = selection.tables.len(),
            "Discovered tables"
        );

        Ok(selection)
    }

    /// Gather partition sizes and data paths of `tables` from every host
    #[instrument(skip_all, fields(hosts = hosts.len(), tables = tables.len()))]
    pub async fn collect_sizes(
        &self,
        hosts: &[String],
        tables: &[TableRef],
    ) -> Result<(ClusterSnapshot, CollectStats)> {
        let start = Instant::now();
        let mut snapshot = ClusterSnapshot {
            hosts: hosts.to_vec(),
            ..Default::default()
        };

        for table in tables {
            let sizes = snapshot.sizes.entry(table.clone()).or_default();
            let paths = snapshot.data_paths.entry(table.clone()).or_default();

            for host in hosts {
                let stats = self.catalog.partition_sizes(host, table).await?;
                debug!(host = %host, table = %table, partitions = stats.len(), "Partition sizes");
                for stat in &stats {
                    sizes.observe(host, stat);
                }

                let path = match self.catalog.data_path(host, table).await? {
                    Some(path) => path,
                    None => default_data_path(&self.data_dir, table),
                };
                paths.insert(host.clone(), path);
            }
        }

        let stats = CollectStats {
            tables: tables.len(),
            partitions: snapshot
                .sizes
                .values()
                .map(|s| s.by_partition.len())
                .sum(),
            duration: start.elapsed(),
        };

        info!(
            tables = stats.tables,
            partitions = stats.partitions,
            duration = ?stats.duration,
            "Collected partition sizes"
        );

        Ok((snapshot, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<TableInfo> {
        vec![
            TableInfo::new("metrics", "events", "MergeTree"),
            TableInfo::new("metrics", "hits", "ReplicatedMergeTree"),
            TableInfo::new("logs", "events", "ReplacingMergeTree"),
            TableInfo::new("logs", "dist", "Distributed"),
        ]
    }

    #[test]
    fn test_select_all_tables() {
        let selection = select_tables(catalog(), "", &[]);
        assert_eq!(selection.tables.len(), 3);
        assert_eq!(selection.db_tables["logs"], vec!["events"]);
        assert_eq!(selection.db_tables["metrics"], vec!["events", "hits"]);
        assert!(selection.missing.is_empty());
    }

    #[test]
    fn test_select_by_database() {
        let selection = select_tables(catalog(), "metrics", &[]);
        assert_eq!(selection.db_tables.len(), 1);
        assert_eq!(selection.tables.len(), 2);
    }

    #[test]
    fn test_select_with_filter() {
        let filter = vec![
            "hits".to_string(),
            "logs.events".to_string(),
            "missing".to_string(),
        ];
        let selection = select_tables(catalog(), "", &filter);

        let names: Vec<String> = selection.tables.iter().map(|t| t.table.to_string()).collect();
        assert_eq!(names, vec!["logs.events", "metrics.hits"]);
        assert_eq!(selection.missing, vec!["missing".to_string()]);
    }

    #[test]
    fn test_filter_matches() {
        let table = TableRef::new("metrics", "events");
        assert!(filter_matches("events", &table));
        assert!(filter_matches("metrics.events", &table));
        assert!(!filter_matches("logs.events", &table));
        assert!(!filter_matches("hits", &table));
    }
}
