//! Replication classification of the selected tables

use ckrebalance_core::Result;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

use crate::catalog::{ClusterCatalog, ReplicaIdentity};
use crate::model::TableInfo;

/// database -> table -> replication identity, replicated tables only
pub type RepTables = BTreeMap<String, BTreeMap<String, ReplicaIdentity>>;

/// Whether `table` appears in `rep_tables`
pub fn is_replicated(rep_tables: &RepTables, database: &str, table: &str) -> bool {
    rep_tables
        .get(database)
        .is_some_and(|tables| tables.contains_key(table))
}

pub struct ReplicationClassifier<'a> {
    catalog: &'a dyn ClusterCatalog,
}

impl<'a> ReplicationClassifier<'a> {
    pub fn new(catalog: &'a dyn ClusterCatalog) -> Self {
        Self { catalog }
    }

    /// Look up the replication identity of every replicated table on `host`
    #[instrument(skip(self, tables))]
    pub async fn classify(&self, host: &str, tables: &[TableInfo]) -> Result<RepTables> {
        let mut rep_tables = RepTables::new();

        for info in tables.iter().filter(|t| t.kind.is_replicated()) {
            // Engine says replicated but the table has no replica row yet
            let identity = self
                .catalog
                .replica_identity(host, &info.table)
                .await?
                .unwrap_or_default();

            debug!(
                table = %info.table,
                zookeeper_path = %identity.zookeeper_path,
                replica = %identity.replica_name,
                "Replicated table"
            );
            rep_tables
                .entry(info.table.database.clone())
                .or_default()
                .insert(info.table.name.clone(), identity);
        }

        info!(
            replicated = rep_tables.values().map(BTreeMap::len).sum::<usize>(),
            "Classified tables"
        );
        Ok(rep_tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_replicated() {
        let mut rep_tables = RepTables::new();
        rep_tables
            .entry("metrics".to_string())
            .or_default()
            .insert("hits".to_string(), ReplicaIdentity::default());

        assert!(is_replicated(&rep_tables, "metrics", "hits"));
        assert!(!is_replicated(&rep_tables, "metrics", "events"));
        assert!(!is_replicated(&rep_tables, "logs", "hits"));
    }
}
