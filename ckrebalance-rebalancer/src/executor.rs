//! Migration Executor
//!
//! Applies a rebalance plan with:
//! - One sequential task per table, tables in parallel up to a limit
//! - A per-move state machine (detach, transfer, attach, cleanup)
//! - Progress reporting over an optional channel
//! - Stop-on-first-failure: moves not yet started are skipped
//!
//! A move already in flight when another one fails runs to its end, so no
//! partition is ever left between steps because of someone else's error.

use ckrebalance_core::{BoxError, MigrationStep, RebalanceError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::ClusterCatalog;
use crate::classifier::{is_replicated, RepTables};
use crate::model::{default_data_path, ClusterSnapshot, TableRef};
use crate::planner::{Move, RebalancePlan};
use crate::shell::RemoteShell;
use crate::transfer::{PartitionTransfer, TransferOptions};

/// Where a move is in the detach/transfer/attach protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MoveState {
    Pending,
    /// Parts sit in the source's `detached` directory
    Detached,
    /// Parts copied into the destination's `detached` directory
    Transferred,
    /// Partition visible on the destination
    Attached,
    Done,
    Failed,
}

impl MoveState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MoveState::Done | MoveState::Failed)
    }

    pub fn can_transition(&self, next: MoveState) -> bool {
        use MoveState::*;
        match (self, next) {
            (Pending, Detached) | (Detached, Transferred) | (Transferred, Attached) => true,
            (Attached, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for MoveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Illegal move transition {from} -> {to}")]
pub struct TransitionError {
    pub from: MoveState,
    pub to: MoveState,
}

impl From<TransitionError> for RebalanceError {
    fn from(e: TransitionError) -> Self {
        RebalanceError::Internal(e.to_string())
    }
}

/// Runtime record of one move
#[derive(Debug, Clone, Serialize)]
pub struct MoveExecution {
    pub mv: Move,
    pub state: MoveState,
    /// Last state reached before failing
    pub reached: MoveState,
    pub error: Option<String>,
    /// Whether the source's detached copy was removed
    pub source_cleaned: bool,
    /// Replicated DETACH left parts in the `detached` directory of the
    /// source shard's other replicas; only the source host is cleaned
    pub replica_copies_left: bool,
    pub duration: Duration,
}

impl MoveExecution {
    pub fn new(mv: Move) -> Self {
        Self {
            mv,
            state: MoveState::Pending,
            reached: MoveState::Pending,
            error: None,
            source_cleaned: false,
            replica_copies_left: false,
            duration: Duration::ZERO,
        }
    }

    pub fn advance(&mut self, next: MoveState) -> std::result::Result<(), TransitionError> {
        if !self.state.can_transition(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next != MoveState::Failed {
            self.reached = next;
        }
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> std::result::Result<(), TransitionError> {
        self.advance(MoveState::Failed)?;
        self.error = Some(message.into());
        Ok(())
    }

    /// Whether the partition's parts are stranded in a `detached` directory
    pub fn needs_manual_attach(&self) -> bool {
        self.state == MoveState::Failed
            && matches!(self.reached, MoveState::Detached | MoveState::Transferred)
    }
}

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Tables migrated at the same time
    pub max_concurrent_tables: usize,
    /// Largest replication delay tolerated before detaching, in seconds
    pub max_replica_delay: u64,
    /// Fallback root for table directories
    pub data_dir: String,
    /// Remove the source's detached parts after attaching
    pub cleanup_source: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tables: 4,
            max_replica_delay: 60,
            data_dir: ckrebalance_core::DEFAULT_DATA_DIR.to_string(),
            cleanup_source: true,
        }
    }
}

/// State change of a move
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub table: TableRef,
    pub partition_id: String,
    pub source: String,
    pub destination: String,
    pub bytes: u64,
    pub state: MoveState,
    pub error: Option<String>,
}

/// Per-move inputs resolved from the collected metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveContext {
    /// Table directory on the source
    pub src_path: String,
    /// Table directory on the destination
    pub dst_path: String,
    pub replicated: bool,
}

/// Outcome of a whole plan
#[derive(Debug, Default)]
pub struct RebalanceReport {
    pub completed: Vec<MoveExecution>,
    pub failed: Vec<MoveExecution>,
    /// Moves never started because of a failure
    pub skipped: Vec<Move>,
    /// Bytes relocated by completed moves
    pub total_bytes: u64,
    pub duration: Duration,
    /// First failure of the run
    pub error: Option<RebalanceError>,
}

impl RebalanceReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed.is_empty()
    }

    /// Completed moves whose detached parts remain on other replicas
    pub fn replica_leftovers(&self) -> impl Iterator<Item = &MoveExecution> {
        self.completed.iter().filter(|e| e.replica_copies_left)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} completed, {} failed, {} skipped, {} bytes in {:?}, {} with detached parts left on other replicas",
            self.completed.len(),
            self.failed.len(),
            self.skipped.len(),
            self.total_bytes,
            self.duration,
            self.replica_leftovers().count()
        )
    }
}

fn step_error(
    step: MigrationStep,
    mv: &Move,
    host: &str,
    source: impl Into<BoxError>,
) -> RebalanceError {
    RebalanceError::MigrationStep {
        step,
        table: mv.table.to_string(),
        partition: mv.partition_id.clone(),
        host: host.to_string(),
        source: source.into(),
    }
}

/// Group moves by table, keeping plan order inside and between groups
fn group_by_table(moves: &[Move]) -> Vec<(TableRef, Vec<Move>)> {
    let mut groups: Vec<(TableRef, Vec<Move>)> = Vec::new();
    let mut index: BTreeMap<TableRef, usize> = BTreeMap::new();

    for mv in moves {
        let idx = *index.entry(mv.table.clone()).or_insert_with(|| {
            groups.push((mv.table.clone(), Vec::new()));
            groups.len() - 1
        });
        groups[idx].1.push(mv.clone());
    }
    groups
}

/// Runs the migration protocol for every move of a plan
pub struct MigrationExecutor {
    config: ExecutorConfig,
    catalog: Arc<dyn ClusterCatalog>,
    transfer: PartitionTransfer,
    /// Bounds concurrently migrated tables
    table_semaphore: Arc<Semaphore>,
    progress_tx: Option<mpsc::Sender<ProgressUpdate>>,
    /// Raised on the first failure of a run
    stop: Arc<AtomicBool>,
    first_error: Arc<Mutex<Option<RebalanceError>>>,
}

impl MigrationExecutor {
    pub fn new(
        config: ExecutorConfig,
        catalog: Arc<dyn ClusterCatalog>,
        shell: Arc<dyn RemoteShell>,
        transfer_options: TransferOptions,
    ) -> Self {
        let table_semaphore = Arc::new(Semaphore::new(config.max_concurrent_tables.max(1)));

        Self {
            config,
            catalog,
            transfer: PartitionTransfer::new(shell, transfer_options),
            table_semaphore,
            progress_tx: None,
            stop: Arc::new(AtomicBool::new(false)),
            first_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Create executor with progress channel
    pub fn with_progress(
        config: ExecutorConfig,
        catalog: Arc<dyn ClusterCatalog>,
        shell: Arc<dyn RemoteShell>,
        transfer_options: TransferOptions,
    ) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel(100);
        let executor = Self::new(config, catalog, shell, transfer_options).with_progress_sender(tx);
        (executor, rx)
    }

    /// Report progress to an existing channel
    pub fn with_progress_sender(mut self, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// Resolve table directories and replication for `mv`
    pub fn context_for(
        &self,
        mv: &Move,
        snapshot: &ClusterSnapshot,
        rep_tables: &RepTables,
    ) -> MoveContext {
        let path = |host: &str| {
            snapshot
                .data_path(&mv.table, host)
                .map(str::to_string)
                .unwrap_or_else(|| default_data_path(&self.config.data_dir, &mv.table))
        };
        MoveContext {
            src_path: path(&mv.source),
            dst_path: path(&mv.destination),
            replicated: is_replicated(rep_tables, &mv.table.database, &mv.table.name),
        }
    }

    /// Execute a rebalance plan
    #[instrument(skip_all, fields(moves = plan.moves.len()))]
    pub async fn execute(
        &self,
        plan: &RebalancePlan,
        snapshot: &ClusterSnapshot,
        rep_tables: &RepTables,
    ) -> RebalanceReport {
        let start = Instant::now();
        let mut report = RebalanceReport::default();

        if plan.moves.is_empty() {
            info!("No moves to execute");
            return report;
        }

        self.stop.store(false, Ordering::SeqCst);
        self.first_error.lock().await.take();

        let groups = group_by_table(&plan.moves);
        info!(
            moves = plan.moves.len(),
            tables = groups.len(),
            "Executing rebalance plan"
        );

        let mut handles = Vec::with_capacity(groups.len());
        for (table, moves) in groups {
            let work: Vec<(Move, MoveContext)> = moves
                .into_iter()
                .map(|mv| {
                    let ctx = self.context_for(&mv, snapshot, rep_tables);
                    (mv, ctx)
                })
                .collect();

            let executor = self.clone_for_task();
            let handle = tokio::spawn(async move { executor.run_table(table, work).await });
            handles.push(handle);
        }

        for handle in handles {
            match handle.await {
                Ok((executions, skipped)) => {
                    for execution in executions {
                        if execution.state == MoveState::Done {
                            report.total_bytes += execution.mv.bytes;
                            report.completed.push(execution);
                        } else {
                            report.failed.push(execution);
                        }
                    }
                    report.skipped.extend(skipped);
                }
                Err(e) => {
                    error!(error = %e, "Table migration task panicked");
                    self.record_failure(RebalanceError::Internal(format!(
                        "table migration task failed: {}",
                        e
                    )))
                    .await;
                }
            }
        }

        report.error = self.first_error.lock().await.take();
        report.duration = start.elapsed();

        if report.is_success() {
            info!(summary = %report.summary(), "Rebalance plan executed");
        } else {
            error!(summary = %report.summary(), "Rebalance plan stopped");
        }
        report
    }

    /// Migrate one table's moves in order
    async fn run_table(
        &self,
        table: TableRef,
        work: Vec<(Move, MoveContext)>,
    ) -> (Vec<MoveExecution>, Vec<Move>) {
        let mut executions = Vec::with_capacity(work.len());
        let mut skipped = Vec::new();

        let _permit = match self.table_semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                skipped.extend(work.into_iter().map(|(mv, _)| mv));
                return (executions, skipped);
            }
        };
        debug!(table = %table, moves = work.len(), "Migrating table");

        for (mv, ctx) in work {
            if self.stop.load(Ordering::SeqCst) {
                skipped.push(mv);
                continue;
            }

            let (execution, result) = self.execute_move(&mv, &ctx).await;
            if let Err(e) = result {
                self.record_failure(e).await;
            }
            executions.push(execution);
        }

        (executions, skipped)
    }

    /// Run the whole protocol for a single move.
    ///
    /// Usable on its own to retry a move that failed in an earlier run,
    /// provided the partition is back in its original place.
    #[instrument(skip(self, mv, ctx), fields(table = %mv.table, partition = %mv.partition_id))]
    pub async fn execute_move(
        &self,
        mv: &Move,
        ctx: &MoveContext,
    ) -> (MoveExecution, Result<()>) {
        let start = Instant::now();
        let mut execution = MoveExecution::new(mv.clone());
        self.report_progress(&execution).await;

        info!(
            source = %mv.source,
            destination = %mv.destination,
            bytes = mv.bytes,
            "Moving partition"
        );

        let result = self.run_steps(&mut execution, ctx).await;
        if let Err(ref e) = result {
            // A step error leaves the move non-terminal, so this cannot fail
            let _ = execution.fail(DisplayChain(e).to_string());
            error!(error = %DisplayChain(e), reached = %execution.reached, "Partition move failed");
            if execution.needs_manual_attach() {
                warn!(
                    reached = %execution.reached,
                    "Partition parts remain detached and need a manual ATTACH PARTITION"
                );
            }
            self.report_progress(&execution).await;
        }

        execution.duration = start.elapsed();
        (execution, result)
    }

    async fn run_steps(&self, execution: &mut MoveExecution, ctx: &MoveContext) -> Result<()> {
        let mv = execution.mv.clone();

        if ctx.replicated {
            self.check_replica(&mv).await?;
        }

        self.catalog
            .detach_partition(&mv.source, &mv.table, &mv.partition_id)
            .await
            .map_err(|e| step_error(MigrationStep::Detach, &mv, &mv.source, e))?;
        self.advance(execution, MoveState::Detached).await?;

        self.transfer
            .transfer(&mv, &ctx.src_path, &ctx.dst_path)
            .await
            .map_err(|e| {
                let host = e.host.clone();
                step_error(MigrationStep::Transfer, &mv, &host, e)
            })?;
        self.advance(execution, MoveState::Transferred).await?;

        self.catalog
            .attach_partition(&mv.destination, &mv.table, &mv.partition_id)
            .await
            .map_err(|e| step_error(MigrationStep::Attach, &mv, &mv.destination, e))?;
        self.advance(execution, MoveState::Attached).await?;

        if self.config.cleanup_source {
            execution.source_cleaned = self.transfer.cleanup(&mv, &ctx.src_path).await;
        }
        if ctx.replicated {
            execution.replica_copies_left = true;
            warn!(
                source = %mv.source,
                "Other replicas of the source shard keep the detached parts; remove them by hand"
            );
        }
        self.advance(execution, MoveState::Done).await?;

        info!(source = %mv.source, destination = %mv.destination, "Partition moved");
        Ok(())
    }

    /// Refuse to detach from a replica that is read-only or lagging
    async fn check_replica(&self, mv: &Move) -> Result<()> {
        let status = self
            .catalog
            .replica_status(&mv.source, &mv.table)
            .await
            .map_err(|e| step_error(MigrationStep::PreCheck, mv, &mv.source, e))?;

        let problem = match status {
            None => Some("no entry in system.replicas".to_string()),
            Some(s) if s.is_readonly => Some("replica is read-only".to_string()),
            Some(s) if s.absolute_delay > self.config.max_replica_delay => Some(format!(
                "replica is {}s behind (limit {}s)",
                s.absolute_delay, self.config.max_replica_delay
            )),
            Some(s) => {
                debug!(queue_size = s.queue_size, delay = s.absolute_delay, "Replica healthy");
                None
            }
        };

        match problem {
            Some(reason) => Err(step_error(MigrationStep::PreCheck, mv, &mv.source, reason)),
            None => Ok(()),
        }
    }

    async fn advance(&self, execution: &mut MoveExecution, next: MoveState) -> Result<()> {
        execution.advance(next)?;
        self.report_progress(execution).await;
        Ok(())
    }

    async fn record_failure(&self, err: RebalanceError) {
        self.stop.store(true, Ordering::SeqCst);
        let mut first = self.first_error.lock().await;
        if first.is_none() {
            *first = Some(err);
        }
    }

    /// Report progress update
    async fn report_progress(&self, execution: &MoveExecution) {
        if let Some(tx) = &self.progress_tx {
            let mv = &execution.mv;
            let _ = tx
                .send(ProgressUpdate {
                    table: mv.table.clone(),
                    partition_id: mv.partition_id.clone(),
                    source: mv.source.clone(),
                    destination: mv.destination.clone(),
                    bytes: mv.bytes,
                    state: execution.state,
                    error: execution.error.clone(),
                })
                .await;
        }
    }

    /// Clone executor state for spawning task
    fn clone_for_task(&self) -> Self {
        Self {
            config: self.config.clone(),
            catalog: self.catalog.clone(),
            transfer: self.transfer.clone(),
            table_semaphore: self.table_semaphore.clone(),
            progress_tx: self.progress_tx.clone(),
            stop: self.stop.clone(),
            first_error: self.first_error.clone(),
        }
    }
}

/// Renders an error followed by its `source` chain
struct DisplayChain<'a>(&'a RebalanceError);

impl fmt::Display for DisplayChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = std::error::Error::source(self.0);
        while let Some(err) = source {
            write!(f, ": {}", err)?;
            source = err.source();
        }
        Ok(())
    }
}
