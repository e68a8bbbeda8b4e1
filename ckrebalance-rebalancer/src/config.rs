//! Rebalancer configuration
//!
//! Built from the command line (every flag also reads an environment
//! variable) and validated before any host is contacted.

use ckrebalance_core::{
    RebalanceError, Result, DEFAULT_CH_PORT, DEFAULT_CH_USER, DEFAULT_DATA_DIR, DEFAULT_SSH_PORT,
    SUPERUSER,
};
use ckrebalance_remote::{DbCredentials, PoolConfig, SshOptions};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::executor::ExecutorConfig;
use crate::planner::PlannerConfig;
use crate::transfer::TransferOptions;

/// Rebalancer configuration
#[derive(Clone)]
pub struct RebalancerConfig {
    /// One ClickHouse host per shard
    pub hosts: Vec<String>,
    pub ch_port: u16,
    pub ch_user: String,
    pub ch_password: String,
    /// Restrict to one database; empty means every non-system database
    pub ch_database: String,
    /// Restrict to these tables (`table` or `db.table`); empty means all
    pub ch_tables: Vec<String>,
    /// Root of the ClickHouse data directory
    pub ch_data_dir: String,

    pub os_user: String,
    pub os_password: String,
    pub os_port: u16,

    /// Allowed deviation from the mean, as a fraction of the mean
    pub tolerance: f64,
    /// Tables migrated at the same time
    pub parallelism: usize,
    /// Compute and print the plan without executing it
    pub dry_run: bool,
    /// Stop planning after this many moves
    pub max_moves: Option<usize>,
    /// Largest replication delay tolerated before detaching, in seconds
    pub max_replica_delay: u64,

    /// SSH connect timeout in seconds
    pub ssh_timeout_secs: u64,
}

impl std::fmt::Debug for RebalancerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebalancerConfig")
            .field("hosts", &self.hosts)
            .field("ch_port", &self.ch_port)
            .field("ch_user", &self.ch_user)
            .field("ch_database", &self.ch_database)
            .field("ch_tables", &self.ch_tables)
            .field("ch_data_dir", &self.ch_data_dir)
            .field("os_user", &self.os_user)
            .field("os_port", &self.os_port)
            .field("tolerance", &self.tolerance)
            .field("parallelism", &self.parallelism)
            .field("dry_run", &self.dry_run)
            .field("max_moves", &self.max_moves)
            .finish_non_exhaustive()
    }
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            ch_port: DEFAULT_CH_PORT,
            ch_user: DEFAULT_CH_USER.to_string(),
            ch_password: String::new(),
            ch_database: String::new(),
            ch_tables: Vec::new(),
            ch_data_dir: DEFAULT_DATA_DIR.to_string(),
            os_user: String::new(),
            os_password: String::new(),
            os_port: DEFAULT_SSH_PORT,
            tolerance: 0.05,
            parallelism: 4,
            dry_run: false,
            max_moves: None,
            max_replica_delay: 60,
            ssh_timeout_secs: 30,
        }
    }
}

/// Split a comma separated list, dropping blanks
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl RebalancerConfig {
    /// Reject configurations that cannot produce a sane run
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(RebalanceError::Configuration(
                "at least one ClickHouse host is required".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for host in &self.hosts {
            if !seen.insert(host.as_str()) {
                return Err(RebalanceError::Configuration(format!(
                    "host {} is listed more than once",
                    host
                )));
            }
        }

        if self.os_user.is_empty() && !self.dry_run {
            return Err(RebalanceError::Configuration(
                "an OS user is required to move partition files".to_string(),
            ));
        }

        if !self.tolerance.is_finite() || !(0.0..1.0).contains(&self.tolerance) {
            return Err(RebalanceError::Configuration(format!(
                "tolerance must be in [0, 1), got {}",
                self.tolerance
            )));
        }

        if self.parallelism == 0 {
            return Err(RebalanceError::Configuration(
                "parallelism must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            tolerance_ratio: self.tolerance,
            min_tolerance_bytes: 0,
            max_moves: self.max_moves,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrent_tables: self.parallelism,
            max_replica_delay: self.max_replica_delay,
            data_dir: self.ch_data_dir.clone(),
            cleanup_source: true,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
    }

    pub fn db_credentials(&self) -> DbCredentials {
        DbCredentials {
            port: self.ch_port,
            database: self.ch_database.clone(),
            user: self.ch_user.clone(),
            password: self.ch_password.clone(),
        }
    }

    /// SSH profile for `host`
    pub fn ssh_options(&self, host: &str) -> SshOptions {
        SshOptions {
            host: host.to_string(),
            port: self.os_port,
            user: self.os_user.clone(),
            password: self.os_password.clone(),
            need_sudo: self.os_user != SUPERUSER,
            connect_timeout: self.ssh_timeout(),
        }
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            ssh_user: self.os_user.clone(),
            ssh_port: self.os_port,
            remote_sudo: self.os_user != SUPERUSER,
        }
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> RebalancerConfig {
        RebalancerConfig {
            hosts: vec!["ch1".to_string(), "ch2".to_string()],
            os_user: "deploy".to_string(),
            os_password: "pw".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = RebalancerConfig::default();
        assert_eq!(config.ch_port, 9000);
        assert_eq!(config.ch_user, "default");
        assert_eq!(config.ch_data_dir, "/var/lib");
        assert_eq!(config.os_port, 22);
        assert_eq!(config.tolerance, 0.05);
        assert_eq!(config.parallelism, 4);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("ch1, ch2,,ch3 "), vec!["ch1", "ch2", "ch3"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());

        let config = RebalancerConfig {
            hosts: vec!["ch1".to_string(), "ch1".to_string()],
            ..valid()
        };
        assert!(matches!(
            config.validate(),
            Err(RebalanceError::Configuration(msg)) if msg.contains("ch1")
        ));

        let config = RebalancerConfig {
            hosts: Vec::new(),
            ..valid()
        };
        assert!(config.validate().is_err());

        let config = RebalancerConfig {
            tolerance: 1.5,
            ..valid()
        };
        assert!(config.validate().is_err());

        let config = RebalancerConfig {
            parallelism: 0,
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_os_user_only_needed_to_execute() {
        let config = RebalancerConfig {
            os_user: String::new(),
            ..valid()
        };
        assert!(config.validate().is_err());

        let config = RebalancerConfig {
            dry_run: true,
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_configs() {
        let config = RebalancerConfig {
            parallelism: 2,
            max_moves: Some(5),
            ..valid()
        };

        assert_eq!(config.executor_config().max_concurrent_tables, 2);
        assert_eq!(config.planner_config().max_moves, Some(5));

        let ssh = config.ssh_options("ch2");
        assert_eq!(ssh.host, "ch2");
        assert!(ssh.need_sudo);
        assert_eq!(ssh.connect_timeout, Duration::from_secs(30));

        let root = RebalancerConfig {
            os_user: "root".to_string(),
            ..valid()
        };
        assert!(!root.ssh_options("ch1").need_sudo);
        assert!(!root.transfer_options().remote_sudo);
    }

    #[test]
    fn test_debug_hides_passwords() {
        let config = RebalancerConfig {
            ch_password: "chsecret".to_string(),
            ..valid()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("chsecret"));
        assert!(!rendered.contains("\"pw\""));
    }
}
