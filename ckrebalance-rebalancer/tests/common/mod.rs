//! In-memory cluster shared by the mock catalog and the mock shell
//!
//! Detach moves a partition's bytes into the host's `detached` area, the
//! rsync command copies them to the destination's `detached` area and
//! attach makes them active again, so a whole migration can be observed
//! end to end without ClickHouse or SSH.

#![allow(dead_code)]

use async_trait::async_trait;
use ckrebalance::catalog::{partition_sizes_query, ClusterCatalog, ReplicaIdentity, ReplicaStatus};
use ckrebalance::model::{detached_dir, PartitionStat, TableInfo, TableRef};
use ckrebalance::shell::{RemoteShell, ShellError};
use ckrebalance::RebalancerConfig;
use ckrebalance_core::{RebalanceError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

pub const DATA_ROOT: &str = "/data";

pub fn table_dir(table: &TableRef) -> String {
    format!("{}/{}/{}/", DATA_ROOT, table.database, table.name)
}

/// Operations that can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Detach,
    Attach,
}

#[derive(Debug, Default)]
pub struct Cluster {
    pub tables: Vec<TableInfo>,
    /// (host, table, partition id) -> bytes
    pub active: BTreeMap<(String, TableRef, String), u64>,
    /// (host, detached dir, partition id) -> bytes
    pub detached: BTreeMap<(String, String, String), u64>,
    pub replica_status: BTreeMap<TableRef, ReplicaStatus>,
    pub failures: Vec<(Op, String, String)>,
    /// Shell commands containing any of these fail
    pub shell_failures: Vec<String>,
    pub unreachable: BTreeSet<String>,
    /// Hosts that accept connections but fail partition size queries
    pub failing_sizes: BTreeSet<String>,
    /// Every catalog mutation and shell command, in order
    pub events: Vec<String>,
}

pub type SharedCluster = Arc<Mutex<Cluster>>;

impl Cluster {
    pub fn shared() -> SharedCluster {
        Arc::new(Mutex::new(Cluster::default()))
    }

    pub fn add_table(&mut self, database: &str, name: &str, engine: &str) -> TableRef {
        let info = TableInfo::new(database, name, engine);
        let table = info.table.clone();
        self.tables.push(info);
        table
    }

    pub fn add_partition(&mut self, host: &str, table: &TableRef, pid: &str, bytes: u64) {
        self.active
            .insert((host.to_string(), table.clone(), pid.to_string()), bytes);
    }

    pub fn host_total(&self, host: &str) -> u64 {
        self.active
            .iter()
            .filter(|((h, _, _), _)| h == host)
            .map(|(_, bytes)| bytes)
            .sum()
    }

    pub fn total(&self) -> u64 {
        self.active.values().sum()
    }

    /// Hosts where the partition is active
    pub fn holders(&self, table: &TableRef, pid: &str) -> Vec<String> {
        self.active
            .keys()
            .filter(|(_, t, p)| t == table && p == pid)
            .map(|(h, _, _)| h.clone())
            .collect()
    }

    pub fn is_detached(&self, host: &str, table: &TableRef, pid: &str) -> bool {
        self.detached.contains_key(&(
            host.to_string(),
            detached_dir(&table_dir(table)),
            pid.to_string(),
        ))
    }

    pub fn fail(&mut self, op: Op, host: &str, pid: &str) {
        self.failures.push((op, host.to_string(), pid.to_string()));
    }

    /// Events mentioning `needle`
    pub fn events_with(&self, needle: &str) -> Vec<String> {
        self.events
            .iter()
            .filter(|e| e.contains(needle))
            .cloned()
            .collect()
    }

    fn should_fail(&self, op: Op, host: &str, pid: &str) -> bool {
        self.failures
            .iter()
            .any(|(o, h, p)| *o == op && h == host && p == pid)
    }
}

pub struct MockCatalog {
    cluster: SharedCluster,
}

impl MockCatalog {
    pub fn new(cluster: SharedCluster) -> Arc<Self> {
        Arc::new(Self { cluster })
    }
}

fn unreachable(host: &str) -> RebalanceError {
    RebalanceError::connectivity(host, "connection refused")
}

#[async_trait]
impl ClusterCatalog for MockCatalog {
    async fn connect(&self, host: &str) -> Result<()> {
        let cluster = self.cluster.lock().unwrap();
        if cluster.unreachable.contains(host) {
            return Err(unreachable(host));
        }
        Ok(())
    }

    async fn merge_tree_tables(&self, host: &str) -> Result<Vec<TableInfo>> {
        let cluster = self.cluster.lock().unwrap();
        if cluster.unreachable.contains(host) {
            return Err(unreachable(host));
        }
        Ok(cluster.tables.clone())
    }

    async fn partition_sizes(&self, host: &str, table: &TableRef) -> Result<Vec<PartitionStat>> {
        let cluster = self.cluster.lock().unwrap();
        if cluster.unreachable.contains(host) || cluster.failing_sizes.contains(host) {
            return Err(RebalanceError::query(
                host,
                partition_sizes_query(table),
                "Memory limit exceeded",
            ));
        }
        Ok(cluster
            .active
            .iter()
            .filter(|((h, t, _), _)| h == host && t == table)
            .map(|((_, _, pid), bytes)| PartitionStat {
                partition_id: pid.clone(),
                partition: pid.clone(),
                bytes: *bytes,
            })
            .collect())
    }

    async fn data_path(&self, _host: &str, table: &TableRef) -> Result<Option<String>> {
        Ok(Some(table_dir(table)))
    }

    async fn replica_identity(
        &self,
        host: &str,
        table: &TableRef,
    ) -> Result<Option<ReplicaIdentity>> {
        let cluster = self.cluster.lock().unwrap();
        let replicated = cluster
            .tables
            .iter()
            .any(|t| &t.table == table && t.kind.is_replicated());
        Ok(replicated.then(|| ReplicaIdentity {
            zookeeper_path: format!("/clickhouse/tables/{}/{}", table.database, table.name),
            replica_name: host.to_string(),
        }))
    }

    async fn replica_status(&self, _host: &str, table: &TableRef) -> Result<Option<ReplicaStatus>> {
        let cluster = self.cluster.lock().unwrap();
        if let Some(status) = cluster.replica_status.get(table) {
            return Ok(Some(status.clone()));
        }
        let replicated = cluster
            .tables
            .iter()
            .any(|t| &t.table == table && t.kind.is_replicated());
        Ok(replicated.then(ReplicaStatus::default))
    }

    async fn detach_partition(&self, host: &str, table: &TableRef, pid: &str) -> Result<()> {
        let mut cluster = self.cluster.lock().unwrap();
        cluster.events.push(format!("detach {} {} {}", host, table, pid));
        if cluster.should_fail(Op::Detach, host, pid) {
            return Err(RebalanceError::query(host, "ALTER TABLE ... DETACH", "read-only"));
        }

        let key = (host.to_string(), table.clone(), pid.to_string());
        if let Some(bytes) = cluster.active.remove(&key) {
            let dir = detached_dir(&table_dir(table));
            cluster
                .detached
                .insert((host.to_string(), dir, pid.to_string()), bytes);
        }
        Ok(())
    }

    async fn attach_partition(&self, host: &str, table: &TableRef, pid: &str) -> Result<()> {
        let mut cluster = self.cluster.lock().unwrap();
        cluster.events.push(format!("attach {} {} {}", host, table, pid));
        if cluster.should_fail(Op::Attach, host, pid) {
            return Err(RebalanceError::query(host, "ALTER TABLE ... ATTACH", "broken part"));
        }

        let dir = detached_dir(&table_dir(table));
        let bytes = cluster
            .detached
            .remove(&(host.to_string(), dir, pid.to_string()))
            .ok_or_else(|| RebalanceError::query(host, "ALTER TABLE ... ATTACH", "no parts"))?;
        cluster
            .active
            .insert((host.to_string(), table.clone(), pid.to_string()), bytes);
        Ok(())
    }

    async fn close(&self) {}
}

fn unquote(token: &str) -> String {
    token.replace('\'', "")
}

/// Partition id selected by `--include='<pid>_*/***'`
fn parse_include(token: &str) -> Option<String> {
    let pattern = unquote(token.strip_prefix("--include=")?);
    Some(pattern.strip_suffix("_*/***")?.to_string())
}

/// Split `user@host:'<dir>'/` into host and directory
fn parse_remote(token: &str) -> Option<(String, String)> {
    let plain = unquote(token);
    let (_, rest) = plain.split_once('@')?;
    let (host, dir) = rest.split_once(':')?;
    Some((host.to_string(), dir.trim_end_matches('/').to_string()))
}

/// Directory and partition id of `find '<dir>' ... -name '<pid>_*' ...`
fn parse_find(tokens: &[&str]) -> Option<(String, String)> {
    let dir = unquote(tokens.get(1)?);
    let name = tokens.iter().position(|t| *t == "-name")?;
    let pattern = unquote(tokens.get(name + 1)?);
    Some((dir, pattern.strip_suffix("_*")?.to_string()))
}

pub struct MockShell {
    cluster: SharedCluster,
}

impl MockShell {
    pub fn new(cluster: SharedCluster) -> Arc<Self> {
        Arc::new(Self { cluster })
    }
}

#[async_trait]
impl RemoteShell for MockShell {
    async fn run(&self, host: &str, cmd: &str) -> std::result::Result<String, ShellError> {
        let mut cluster = self.cluster.lock().unwrap();
        cluster.events.push(format!("shell {} {}", host, cmd));

        if cluster.unreachable.contains(host) {
            return Err(ShellError::new(host, cmd, "connection refused"));
        }
        if cluster.shell_failures.iter().any(|f| cmd.contains(f.as_str())) {
            return Err(ShellError::new(host, cmd, "exit status 1"));
        }

        let tokens: Vec<&str> = cmd.split_whitespace().collect();
        if cmd.starts_with("rsync ") {
            let pid = tokens.iter().find_map(|t| parse_include(t));
            let src_dir = tokens
                .len()
                .checked_sub(2)
                .map(|i| unquote(tokens[i]).trim_end_matches('/').to_string());
            let remote = tokens.last().and_then(|t| parse_remote(t));
            let (Some(pid), Some(src_dir), Some((dest, dst_dir))) = (pid, src_dir, remote) else {
                return Err(ShellError::new(host, cmd, "bad rsync arguments"));
            };

            // rsync with a filter that matches nothing copies nothing and succeeds
            if let Some(bytes) = cluster
                .detached
                .get(&(host.to_string(), src_dir, pid.clone()))
                .copied()
            {
                cluster.detached.insert((dest, dst_dir, pid), bytes);
            }
            return Ok("sent 1 files".to_string());
        }

        if cmd.starts_with("find ") {
            if let Some((dir, pid)) = parse_find(&tokens) {
                cluster.detached.remove(&(host.to_string(), dir, pid));
            }
        }
        Ok(String::new())
    }
}

pub fn config(hosts: &[&str]) -> RebalancerConfig {
    RebalancerConfig {
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        os_user: "deploy".to_string(),
        os_password: "pw".to_string(),
        ch_data_dir: DATA_ROOT.to_string(),
        ..Default::default()
    }
}
