//! ClickHouse catalog access
//!
//! [`ClusterCatalog`] is everything the engine needs from the SQL side of a
//! shard host. [`ClickHouseCatalog`] implements it over the pooled native
//! protocol connections of a [`ConnectionManager`].

use async_trait::async_trait;
use ckrebalance_core::{RebalanceError, Result, MERGE_TREE_PATTERN, SYSTEM_DATABASE};
use ckrebalance_remote::{ConnectionManager, DbCredentials, RemoteError};
use clickhouse_rs::types::{Block, Complex};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::model::{PartitionStat, TableInfo, TableRef};

/// Replication identity of a replicated table on one host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplicaIdentity {
    pub zookeeper_path: String,
    pub replica_name: String,
}

/// Replication health of a replicated table on one host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub is_readonly: bool,
    pub queue_size: u64,
    pub absolute_delay: u64,
}

/// SQL operations against shard hosts
#[async_trait]
pub trait ClusterCatalog: Send + Sync {
    /// Open (or revalidate) the connection to `host`
    async fn connect(&self, host: &str) -> Result<()>;

    /// MergeTree-family tables outside the system database
    async fn merge_tree_tables(&self, host: &str) -> Result<Vec<TableInfo>>;

    /// Active partitions of `table` with their on-disk size
    async fn partition_sizes(&self, host: &str, table: &TableRef) -> Result<Vec<PartitionStat>>;

    /// On-disk directory of `table`, if the catalog reports one
    async fn data_path(&self, host: &str, table: &TableRef) -> Result<Option<String>>;

    /// Replication identity of `table`, if it is replicated on `host`
    async fn replica_identity(&self, host: &str, table: &TableRef)
        -> Result<Option<ReplicaIdentity>>;

    /// Replication health of `table` on `host`
    async fn replica_status(&self, host: &str, table: &TableRef) -> Result<Option<ReplicaStatus>>;

    /// Move a partition's parts into the table's `detached` directory
    async fn detach_partition(&self, host: &str, table: &TableRef, partition_id: &str)
        -> Result<()>;

    /// Attach the parts of a partition found in the `detached` directory
    async fn attach_partition(&self, host: &str, table: &TableRef, partition_id: &str)
        -> Result<()>;

    /// Release every connection
    async fn close(&self);
}

/// Quote a value as a ClickHouse string literal
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

pub fn merge_tree_tables_query() -> String {
    format!(
        "SELECT DISTINCT database, name, engine FROM system.tables \
         WHERE match(engine, {}) AND database != {} ORDER BY database, name",
        sql_literal(MERGE_TREE_PATTERN),
        sql_literal(SYSTEM_DATABASE)
    )
}

pub fn partition_sizes_query(table: &TableRef) -> String {
    format!(
        "SELECT partition_id, any(partition) AS partition_name, \
         toUInt64(sum(bytes_on_disk)) AS total_bytes \
         FROM system.parts WHERE database = {} AND table = {} AND active \
         GROUP BY partition_id ORDER BY partition_id",
        sql_literal(&table.database),
        sql_literal(&table.name)
    )
}

pub fn data_path_query(table: &TableRef) -> String {
    format!(
        "SELECT data_paths[1] AS data_path FROM system.tables WHERE database = {} AND name = {}",
        sql_literal(&table.database),
        sql_literal(&table.name)
    )
}

pub fn replica_identity_query(table: &TableRef) -> String {
    format!(
        "SELECT zookeeper_path, replica_name FROM system.replicas \
         WHERE database = {} AND table = {}",
        sql_literal(&table.database),
        sql_literal(&table.name)
    )
}

pub fn replica_status_query(table: &TableRef) -> String {
    format!(
        "SELECT toUInt64(is_readonly) AS readonly_flag, toUInt64(queue_size) AS queue_len, \
         toUInt64(absolute_delay) AS delay_secs FROM system.replicas \
         WHERE database = {} AND table = {}",
        sql_literal(&table.database),
        sql_literal(&table.name)
    )
}

pub fn detach_statement(table: &TableRef, partition_id: &str) -> String {
    format!(
        "ALTER TABLE {} DETACH PARTITION ID {}",
        table.quoted(),
        sql_literal(partition_id)
    )
}

pub fn attach_statement(table: &TableRef, partition_id: &str) -> String {
    format!(
        "ALTER TABLE {} ATTACH PARTITION ID {}",
        table.quoted(),
        sql_literal(partition_id)
    )
}

/// Attach host and statement context to a driver error
fn wrap(host: &str, sql: &str, err: RemoteError) -> RebalanceError {
    match err {
        RemoteError::UnknownHost(_)
        | RemoteError::Timeout(_)
        | RemoteError::ClickHouse(clickhouse_rs::errors::Error::Io(_))
        | RemoteError::ClickHouse(clickhouse_rs::errors::Error::Connection(_)) => {
            RebalanceError::connectivity(host, err)
        }
        other => RebalanceError::query(host, sql, other),
    }
}

/// [`ClusterCatalog`] backed by pooled native connections
pub struct ClickHouseCatalog {
    pool: Arc<ConnectionManager>,
    credentials: DbCredentials,
}

impl ClickHouseCatalog {
    pub fn new(pool: Arc<ConnectionManager>, credentials: DbCredentials) -> Self {
        Self { pool, credentials }
    }

    /// Get the underlying connection manager
    pub fn pool(&self) -> &ConnectionManager {
        &self.pool
    }

    async fn fetch(&self, host: &str, sql: &str) -> Result<Block<Complex>> {
        self.pool
            .query(host, sql)
            .await
            .map_err(|e| wrap(host, sql, e))
    }

    async fn run(&self, host: &str, sql: &str) -> Result<()> {
        self.pool
            .execute(host, sql)
            .await
            .map_err(|e| wrap(host, sql, e))
    }
}

/// Read a column, mapping decode failures to a query error
macro_rules! column {
    ($row:expr, $name:literal, $host:expr, $sql:expr) => {
        $row.get($name)
            .map_err(|e| RebalanceError::query($host, $sql.as_str(), RemoteError::from(e)))?
    };
}

#[async_trait]
impl ClusterCatalog for ClickHouseCatalog {
    async fn connect(&self, host: &str) -> Result<()> {
        self.pool
            .connect(host, &self.credentials)
            .await
            .map_err(|e| RebalanceError::connectivity(host, e))
    }

    #[instrument(skip(self))]
    async fn merge_tree_tables(&self, host: &str) -> Result<Vec<TableInfo>> {
        let sql = merge_tree_tables_query();
        let block = self.fetch(host, &sql).await?;

        let mut tables = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let database: String = column!(row, "database", host, sql);
            let name: String = column!(row, "name", host, sql);
            let engine: String = column!(row, "engine", host, sql);
            tables.push(TableInfo::new(&database, &name, &engine));
        }

        debug!(count = tables.len(), "Found MergeTree tables");
        Ok(tables)
    }

    async fn partition_sizes(&self, host: &str, table: &TableRef) -> Result<Vec<PartitionStat>> {
        let sql = partition_sizes_query(table);
        let block = self.fetch(host, &sql).await?;

        let mut stats = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            stats.push(PartitionStat {
                partition_id: column!(row, "partition_id", host, sql),
                partition: column!(row, "partition_name", host, sql),
                bytes: column!(row, "total_bytes", host, sql),
            });
        }
        Ok(stats)
    }

    async fn data_path(&self, host: &str, table: &TableRef) -> Result<Option<String>> {
        let sql = data_path_query(table);
        let block = self.fetch(host, &sql).await?;

        for row in block.rows() {
            let path: String = column!(row, "data_path", host, sql);
            if !path.is_empty() {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    async fn replica_identity(
        &self,
        host: &str,
        table: &TableRef,
    ) -> Result<Option<ReplicaIdentity>> {
        let sql = replica_identity_query(table);
        let block = self.fetch(host, &sql).await?;

        let Some(row) = block.rows().next() else {
            return Ok(None);
        };
        Ok(Some(ReplicaIdentity {
            zookeeper_path: column!(row, "zookeeper_path", host, sql),
            replica_name: column!(row, "replica_name", host, sql),
        }))
    }

    async fn replica_status(&self, host: &str, table: &TableRef) -> Result<Option<ReplicaStatus>> {
        let sql = replica_status_query(table);
        let block = self.fetch(host, &sql).await?;

        let Some(row) = block.rows().next() else {
            return Ok(None);
        };
        let readonly_flag: u64 = column!(row, "readonly_flag", host, sql);
        Ok(Some(ReplicaStatus {
            is_readonly: readonly_flag != 0,
            queue_size: column!(row, "queue_len", host, sql),
            absolute_delay: column!(row, "delay_secs", host, sql),
        }))
    }

    async fn detach_partition(
        &self,
        host: &str,
        table: &TableRef,
        partition_id: &str,
    ) -> Result<()> {
        self.run(host, &detach_statement(table, partition_id)).await
    }

    async fn attach_partition(
        &self,
        host: &str,
        table: &TableRef,
        partition_id: &str,
    ) -> Result<()> {
        self.run(host, &attach_statement(table, partition_id)).await
    }

    async fn close(&self) {
        self.pool.close_all().await;
    }
}
