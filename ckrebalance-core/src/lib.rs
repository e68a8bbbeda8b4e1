//! ckrebalance Core Library
//!
//! Shared pieces of the ckrebalance workspace:
//! - Unified error taxonomy for every stage of a rebalance run
//! - Defaults for ClickHouse and SSH endpoints
//! - Catalog patterns used to select eligible tables

pub mod error;

pub use error::{BoxError, MigrationStep, RebalanceError, Result};

/// Default ClickHouse native protocol port
pub const DEFAULT_CH_PORT: u16 = 9000;

/// Default ClickHouse user
pub const DEFAULT_CH_USER: &str = "default";

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default root of the ClickHouse data directory (`<root>/clickhouse/data/...`)
pub const DEFAULT_DATA_DIR: &str = "/var/lib";

/// The SSH user that never needs sudo
pub const SUPERUSER: &str = "root";

/// OS account owning ClickHouse data files
pub const CLICKHOUSE_OS_USER: &str = "clickhouse";

/// Database excluded from table discovery
pub const SYSTEM_DATABASE: &str = "system";

/// `match(engine, ...)` pattern selecting the MergeTree family
pub const MERGE_TREE_PATTERN: &str = "MergeTree";

/// Engine-name prefix of replicated tables
pub const REPLICATED_PREFIX: &str = "Replicated";
