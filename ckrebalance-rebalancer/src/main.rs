//! ckrebalance
//!
//! Moves whole partitions between ClickHouse shard hosts until every host
//! holds about the same number of bytes.

use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ckrebalance::config::split_list;
use ckrebalance::{CkRebalance, RebalancerConfig};

const GIT_COMMIT_HASH: Option<&str> = option_env!("GIT_COMMIT_HASH");
const BUILD_TIMESTAMP: Option<&str> = option_env!("BUILD_TIMESTAMP");

#[derive(Parser)]
#[command(name = "ckrebalance")]
#[command(about = "Rebalance partitions across ClickHouse shard hosts")]
#[command(disable_version_flag = true)]
struct Cli {
    // ===== ClickHouse =====
    /// Comma separated ClickHouse hosts, one per shard
    #[arg(long, env = "CH_HOSTS", default_value = "")]
    ch_hosts: String,

    /// ClickHouse native protocol port
    #[arg(long, env = "CH_PORT", default_value = "9000")]
    ch_port: u16,

    /// ClickHouse user
    #[arg(long, env = "CH_USER", default_value = "default")]
    ch_user: String,

    /// ClickHouse password
    #[arg(long, env = "CH_PASSWORD", default_value = "", hide_env_values = true)]
    ch_password: String,

    /// Database to rebalance (all non-system databases when empty)
    #[arg(long, env = "CH_DATABASE", default_value = "")]
    ch_database: String,

    /// Comma separated tables to rebalance (all when empty)
    #[arg(long, env = "CH_TABLES", default_value = "")]
    ch_tables: String,

    /// Root of the ClickHouse data directory
    #[arg(long, env = "CH_DATA_DIR", default_value = "/var/lib")]
    ch_data_dir: String,

    // ===== SSH =====
    /// OS user for SSH
    #[arg(long, env = "OS_USER", default_value = "")]
    os_user: String,

    /// OS password for SSH and sudo
    #[arg(long, env = "OS_PASSWORD", default_value = "", hide_env_values = true)]
    os_password: String,

    /// SSH port
    #[arg(long, env = "OS_PORT", default_value = "22")]
    os_port: u16,

    // ===== Rebalancing =====
    /// Allowed deviation from the mean, as a fraction of it
    #[arg(long, env = "TOLERANCE", default_value = "0.05")]
    tolerance: f64,

    /// Tables migrated at the same time
    #[arg(long, env = "PARALLELISM", default_value = "4")]
    parallelism: usize,

    /// Stop planning after this many moves
    #[arg(long, env = "MAX_MOVES")]
    max_moves: Option<usize>,

    /// Largest replication delay, in seconds, tolerated before detaching
    #[arg(long, env = "MAX_REPLICA_DELAY", default_value = "60")]
    max_replica_delay: u64,

    /// Print the plan as JSON without moving anything
    #[arg(long, env = "DRY_RUN", default_value = "false")]
    dry_run: bool,

    /// Log filter directive
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Print version and build information
    #[arg(short = 'v', long = "version")]
    version: bool,
}

impl Cli {
    fn to_config(&self) -> RebalancerConfig {
        RebalancerConfig {
            hosts: split_list(&self.ch_hosts),
            ch_port: self.ch_port,
            ch_user: self.ch_user.clone(),
            ch_password: self.ch_password.clone(),
            ch_database: self.ch_database.clone(),
            ch_tables: split_list(&self.ch_tables),
            ch_data_dir: self.ch_data_dir.clone(),
            os_user: self.os_user.clone(),
            os_password: self.os_password.clone(),
            os_port: self.os_port,
            tolerance: self.tolerance,
            parallelism: self.parallelism,
            dry_run: self.dry_run,
            max_moves: self.max_moves,
            max_replica_delay: self.max_replica_delay,
            ..Default::default()
        }
    }
}

fn version_string() -> String {
    format!(
        "ckrebalance {}\ncommit: {}\nbuilt: {}",
        env!("CARGO_PKG_VERSION"),
        GIT_COMMIT_HASH.unwrap_or("unknown"),
        BUILD_TIMESTAMP.unwrap_or("unknown")
    )
}

async fn run(config: RebalancerConfig) -> anyhow::Result<()> {
    let dry_run = config.dry_run;
    let rebalance = CkRebalance::new(config).context("Invalid configuration")?;
    let (mut rebalance, mut progress_rx) = rebalance.with_progress();

    // Spawn progress reporter
    tokio::spawn(async move {
        while let Some(update) = progress_rx.recv().await {
            info!(
                table = %update.table,
                partition = %update.partition_id,
                source = %update.source,
                destination = %update.destination,
                state = %update.state,
                "Move progress"
            );
        }
    });

    let result = rebalance.run().await;

    if let Some(report) = rebalance.last_report() {
        info!(summary = %report.summary(), "Rebalance finished");
    }
    result.context("Rebalance failed")?;

    if dry_run {
        if let Some(plan) = rebalance.last_plan() {
            let json = serde_json::to_string_pretty(plan).context("Cannot render plan")?;
            println!("{}", json);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        println!("{}", version_string());
        return ExitCode::SUCCESS;
    }

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config = cli.to_config();
    info!(config = ?config, "Starting ckrebalance");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
