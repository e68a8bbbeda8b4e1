//! Rebalance orchestration
//!
//! [`CkRebalance`] owns the clients for one run and drives it step by step:
//! connect, discover tables, classify replication, then plan and migrate.
//! Each step can be called on its own, so callers can inspect the plan or
//! the partial outcome of a failed run.

use ckrebalance_core::{RebalanceError, Result};
use ckrebalance_remote::ConnectionManager;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::catalog::{ClickHouseCatalog, ClusterCatalog};
use crate::classifier::{RepTables, ReplicationClassifier};
use crate::collector::{MetadataCollector, TableSelection};
use crate::config::RebalancerConfig;
use crate::executor::{MigrationExecutor, ProgressUpdate, RebalanceReport};
use crate::planner::{PlanBuilder, RebalancePlan};
use crate::shell::{RemoteShell, SshRemoteShell};

/// Command run over SSH to prove a host accepts our credentials
const SSH_PROBE: &str = "true";

pub struct CkRebalance {
    config: RebalancerConfig,
    catalog: Arc<dyn ClusterCatalog>,
    shell: Arc<dyn RemoteShell>,
    progress_tx: Option<mpsc::Sender<ProgressUpdate>>,
    selection: TableSelection,
    rep_tables: RepTables,
    last_plan: Option<RebalancePlan>,
    last_report: Option<RebalanceReport>,
}

impl CkRebalance {
    /// Create a rebalancer talking to real ClickHouse and SSH endpoints
    pub fn new(config: RebalancerConfig) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(ConnectionManager::new(config.pool_config()));
        let catalog = ClickHouseCatalog::new(pool, config.db_credentials());
        let shell = SshRemoteShell::new(config.ssh_options(""));
        Self::with_clients(config, Arc::new(catalog), Arc::new(shell))
    }

    /// Create a rebalancer over caller-supplied clients
    pub fn with_clients(
        config: RebalancerConfig,
        catalog: Arc<dyn ClusterCatalog>,
        shell: Arc<dyn RemoteShell>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            catalog,
            shell,
            progress_tx: None,
            selection: TableSelection::default(),
            rep_tables: RepTables::new(),
            last_plan: None,
            last_report: None,
        })
    }

    /// Receive a [`ProgressUpdate`] for every move state change
    pub fn with_progress(mut self) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel(100);
        self.progress_tx = Some(tx);
        (self, rx)
    }

    pub fn config(&self) -> &RebalancerConfig {
        &self.config
    }

    /// Connect to every host's ClickHouse and check SSH access.
    ///
    /// Hosts are probed concurrently; the first failure in host order is
    /// returned.
    #[instrument(skip(self), fields(hosts = self.config.hosts.len()))]
    pub async fn init_connections(&self) -> Result<()> {
        let connects = self.config.hosts.iter().map(|host| self.catalog.connect(host));
        join_all(connects).await.into_iter().collect::<Result<Vec<_>>>()?;

        if self.config.dry_run {
            info!("Dry run, skipping SSH checks");
            return Ok(());
        }

        let probes = self.config.hosts.iter().map(|host| async move {
            self.shell
                .run(host, SSH_PROBE)
                .await
                .map_err(|e| RebalanceError::connectivity(host.as_str(), e))
        });
        join_all(probes).await.into_iter().collect::<Result<Vec<_>>>()?;

        info!("Connected to all hosts");
        Ok(())
    }

    /// Discover the MergeTree tables to rebalance
    pub async fn get_tables(&mut self) -> Result<&TableSelection> {
        let collector = MetadataCollector::new(self.catalog.as_ref(), &self.config.ch_data_dir);
        self.selection = collector
            .get_tables(
                &self.config.hosts,
                &self.config.ch_database,
                &self.config.ch_tables,
            )
            .await?;
        Ok(&self.selection)
    }

    /// Record the replication identity of the selected replicated tables
    pub async fn get_rep_tables(&mut self) -> Result<&RepTables> {
        let first = self.config.hosts.first().ok_or_else(|| {
            RebalanceError::Configuration("no ClickHouse hosts".to_string())
        })?;
        let classifier = ReplicationClassifier::new(self.catalog.as_ref());
        self.rep_tables = classifier.classify(first, &self.selection.tables).await?;
        Ok(&self.rep_tables)
    }

    /// Collect sizes, plan, and migrate.
    ///
    /// Returns the first migration error if any move failed; the partial
    /// outcome stays available through [`CkRebalance::last_report`].
    #[instrument(skip(self))]
    pub async fn do_rebalance(&mut self) -> Result<&RebalanceReport> {
        self.last_plan = None;
        self.last_report = None;

        if self.selection.is_empty() {
            info!("No tables selected, nothing to rebalance");
            return Ok(&*self.last_report.insert(RebalanceReport::default()));
        }

        let collector = MetadataCollector::new(self.catalog.as_ref(), &self.config.ch_data_dir);
        let (snapshot, _stats) = collector
            .collect_sizes(&self.config.hosts, &self.selection.table_refs())
            .await?;

        let plan = PlanBuilder::new(self.config.planner_config()).build_from_snapshot(&snapshot);
        for skipped in &plan.skipped {
            warn!(error = %skipped.to_error(), "Partition left in place");
        }

        if self.config.dry_run {
            info!(summary = %plan.summary(), "Dry run, plan not executed");
            self.last_plan = Some(plan);
            return Ok(&*self.last_report.insert(RebalanceReport::default()));
        }

        let mut executor = MigrationExecutor::new(
            self.config.executor_config(),
            self.catalog.clone(),
            self.shell.clone(),
            self.config.transfer_options(),
        );
        if let Some(tx) = &self.progress_tx {
            executor = executor.with_progress_sender(tx.clone());
        }

        let mut report = executor.execute(&plan, &snapshot, &self.rep_tables).await;
        self.last_plan = Some(plan);

        let error = report.error.take();
        let report = self.last_report.insert(report);
        match error {
            Some(e) => Err(e),
            None => Ok(&*report),
        }
    }

    /// Run every step, then release the connections
    pub async fn run(&mut self) -> Result<()> {
        let result = self.run_steps().await;
        self.close().await;
        result
    }

    async fn run_steps(&mut self) -> Result<()> {
        self.init_connections().await?;
        self.get_tables().await?;
        self.get_rep_tables().await?;
        self.do_rebalance().await?;
        Ok(())
    }

    /// Plan computed by the last [`CkRebalance::do_rebalance`]
    pub fn last_plan(&self) -> Option<&RebalancePlan> {
        self.last_plan.as_ref()
    }

    /// Outcome of the last [`CkRebalance::do_rebalance`]
    pub fn last_report(&self) -> Option<&RebalanceReport> {
        self.last_report.as_ref()
    }

    pub fn selection(&self) -> &TableSelection {
        &self.selection
    }

    pub fn rep_tables(&self) -> &RepTables {
        &self.rep_tables
    }

    pub async fn close(&self) {
        self.catalog.close().await;
    }
}
