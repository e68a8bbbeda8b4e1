//! ckrebalance Library
//!
//! Rebalances the on-disk size of ClickHouse shards by moving whole
//! partitions between shard hosts.
//!
//! A run goes through:
//! - Discovery (MergeTree tables from the first host)
//! - Replication classification (replicated tables get a replica health check)
//! - Size collection (per-partition bytes from every host)
//! - Planning (greedy moves from over-loaded to least-loaded hosts)
//! - Migration (detach on the source, rsync, attach on the destination)

pub mod catalog;
pub mod classifier;
pub mod collector;
pub mod config;
pub mod executor;
pub mod model;
pub mod planner;
pub mod rebalance;
pub mod shell;
pub mod transfer;

// Re-export main types
pub use catalog::{ClickHouseCatalog, ClusterCatalog, ReplicaIdentity, ReplicaStatus};
pub use classifier::{RepTables, ReplicationClassifier};
pub use collector::{MetadataCollector, TableSelection};
pub use config::RebalancerConfig;
pub use executor::{
    ExecutorConfig, MigrationExecutor, MoveContext, MoveExecution, MoveState, ProgressUpdate,
    RebalanceReport, TransitionError,
};
pub use model::{ClusterSnapshot, EngineKind, PartitionSizes, PartitionStat, SizeMap, TableInfo, TableRef};
pub use planner::{Move, PlanBuilder, PlannerConfig, RebalancePlan, SkippedPartition};
pub use rebalance::CkRebalance;
pub use shell::{RemoteShell, ShellError, SshRemoteShell};
pub use transfer::{PartitionTransfer, TransferOptions};
