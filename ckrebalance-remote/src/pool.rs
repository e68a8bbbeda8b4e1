//! ClickHouse connection management
//!
//! One native-protocol pool per shard host. The manager is owned by the
//! caller that drives a run and handed out by reference; there is no global
//! registry. Entries are pinged before reuse, replaced when the credentials
//! for a host change, and their idle connections are dropped once the host
//! has not been used for `idle_timeout`.

use clickhouse_rs::types::{Block, Complex};
use clickhouse_rs::{ClientHandle, Pool};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};
use url::Url;

use crate::error::{RemoteError, Result};

/// Credentials and target database for one host
#[derive(Clone, PartialEq, Eq)]
pub struct DbCredentials {
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for DbCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbCredentials")
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"******")
            .finish()
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum simultaneous connections per host
    pub max_open: usize,
    /// Connections kept open when idle
    pub min_idle: usize,
    /// Drop a host's idle connections after this long without use
    pub idle_timeout: Duration,
    /// Read timeout for a single statement
    pub query_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 2,
            min_idle: 0,
            idle_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(300), // 5 minutes
            connect_timeout: Duration::from_secs(10),
        }
    }
}

struct HostPool {
    dsn: String,
    pool: Pool,
    last_used: Instant,
}

/// Host-keyed ClickHouse connection pools
pub struct ConnectionManager {
    config: PoolConfig,
    pools: RwLock<HashMap<String, HostPool>>,
}

impl ConnectionManager {
    /// Create an empty manager
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Build the native-protocol connection string for a host
    pub fn dsn(&self, host: &str, creds: &DbCredentials) -> Result<String> {
        let mut url = Url::parse(&format!("tcp://{}:{}", host, creds.port))?;
        url.set_username(&creds.user)
            .map_err(|_| url::ParseError::EmptyHost)?;
        if !creds.password.is_empty() {
            url.set_password(Some(&creds.password))
                .map_err(|_| url::ParseError::EmptyHost)?;
        }
        url.set_path(&creds.database);
        url.query_pairs_mut()
            .append_pair(
                "query_timeout",
                &format!("{}s", self.config.query_timeout.as_secs()),
            )
            .append_pair(
                "connection_timeout",
                &format!("{}s", self.config.connect_timeout.as_secs()),
            )
            .append_pair("pool_min", &self.config.min_idle.to_string())
            .append_pair("pool_max", &self.config.max_open.to_string());
        Ok(url.into())
    }

    /// Register a host, reusing a live pool with identical credentials
    #[instrument(skip(self, creds))]
    pub async fn connect(&self, host: &str, creds: &DbCredentials) -> Result<()> {
        let dsn = self.dsn(host, creds)?;

        let existing = {
            let pools = self.pools.read().await;
            pools
                .get(host)
                .map(|entry| (entry.dsn == dsn, entry.pool.clone()))
        };

        if let Some((same_dsn, pool)) = existing {
            if same_dsn && ping(&pool).await.is_ok() {
                debug!(host, "Reusing connection pool");
                return Ok(());
            }
            // Stale or opened with other credentials
            self.pools.write().await.remove(host);
            debug!(host, same_dsn, "Dropped stale connection pool");
        }

        let pool = Pool::new(dsn.clone());
        ping(&pool).await?;

        self.pools.write().await.insert(
            host.to_string(),
            HostPool {
                dsn,
                pool,
                last_used: Instant::now(),
            },
        );

        info!(host, port = creds.port, "Connected to ClickHouse");
        Ok(())
    }

    /// Take a connection for `host`; it returns to the pool on drop
    pub async fn acquire(&self, host: &str) -> Result<ClientHandle> {
        self.evict_idle().await;

        let pool = {
            let mut pools = self.pools.write().await;
            let entry = pools
                .get_mut(host)
                .ok_or_else(|| RemoteError::UnknownHost(host.to_string()))?;
            entry.last_used = Instant::now();
            entry.pool.clone()
        };

        Ok(pool.get_handle().await?)
    }

    /// Run a read-only statement and return every row
    pub async fn query(&self, host: &str, sql: &str) -> Result<Block<Complex>> {
        debug!(host, query = sql, "Running query");
        let mut handle = self.acquire(host).await?;
        Ok(handle.query(sql).fetch_all().await?)
    }

    /// Run a statement that returns no rows
    pub async fn execute(&self, host: &str, sql: &str) -> Result<()> {
        debug!(host, statement = sql, "Executing statement");
        let mut handle = self.acquire(host).await?;
        handle.execute(sql).await?;
        Ok(())
    }

    /// Swap out the pools of hosts unused for longer than `idle_timeout`.
    ///
    /// The replacement pool opens nothing until the next acquire, so the old
    /// pool's connections close once their last handle is returned.
    pub async fn evict_idle(&self) -> usize {
        let mut pools = self.pools.write().await;
        let mut evicted = 0;

        for (host, entry) in pools.iter_mut() {
            if entry.last_used.elapsed() >= self.config.idle_timeout {
                entry.pool = Pool::new(entry.dsn.clone());
                entry.last_used = Instant::now();
                evicted += 1;
                debug!(host = %host, "Evicted idle connections");
            }
        }

        evicted
    }

    /// Hosts with a registered pool
    pub async fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<_> = self.pools.read().await.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Drop the pools of the given hosts
    pub async fn close(&self, hosts: &[String]) {
        let mut pools = self.pools.write().await;
        for host in hosts {
            if pools.remove(host).is_some() {
                debug!(host = %host, "Closed connection pool");
            }
        }
    }

    /// Drop every pool
    pub async fn close_all(&self) {
        self.pools.write().await.clear();
    }
}

async fn ping(pool: &Pool) -> Result<()> {
    let mut handle = pool.get_handle().await?;
    handle.ping().await?;
    Ok(())
}
