//! Rebalance Planner
//!
//! Turns a size map into an ordered list of partition moves:
//! - Over-loaded hosts give up whole partitions, largest first
//! - Each partition goes to the least-loaded host at that moment
//! - A move is kept only if it narrows the spread around the mean
//!
//! Deviations are compared exactly by scaling every quantity by the host
//! count: a host holding `x` bytes deviates from the mean `T/n` by
//! `|n*x - T| / n`, so comparing `|n*x - T|` needs no division.

use ckrebalance_core::RebalanceError;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, instrument, warn};

use crate::model::{ClusterSnapshot, SizeMap, TableRef};

/// Planner configuration
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Allowed deviation from the mean, as a fraction of the mean
    pub tolerance_ratio: f64,
    /// Lower bound for the allowed deviation, in bytes
    pub min_tolerance_bytes: u64,
    /// Stop after this many moves
    pub max_moves: Option<usize>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            tolerance_ratio: 0.05,
            min_tolerance_bytes: 0,
            max_moves: None,
        }
    }
}

/// Relocation of one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Move {
    pub table: TableRef,
    pub partition_id: String,
    /// Partition expression value, for logs
    pub partition: String,
    pub source: String,
    pub destination: String,
    pub bytes: u64,
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} partition {} ({} bytes) {} -> {}",
            self.table, self.partition_id, self.bytes, self.source, self.destination
        )
    }
}

/// A partition left out of planning because several hosts hold it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPartition {
    pub table: TableRef,
    pub partition_id: String,
    pub hosts: Vec<String>,
}

impl SkippedPartition {
    pub fn to_error(&self) -> RebalanceError {
        RebalanceError::Plan {
            table: self.table.to_string(),
            partition: self.partition_id.clone(),
            hosts: self.hosts.clone(),
        }
    }
}

/// Ordered moves plus the numbers they were computed from
#[derive(Debug, Clone, Default, Serialize)]
pub struct RebalancePlan {
    pub moves: Vec<Move>,
    /// Bytes the moves relocate
    pub total_bytes: u64,
    pub skipped: Vec<SkippedPartition>,
    /// Mean bytes per host, rounded down
    pub mean: u64,
    /// Allowed deviation from the mean, in bytes
    pub tolerance: u64,
    pub totals_before: BTreeMap<String, u64>,
}

impl RebalancePlan {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Host totals once every move has been applied
    pub fn project_totals(&self) -> BTreeMap<String, u64> {
        let mut totals = self.totals_before.clone();
        for mv in &self.moves {
            if let Some(src) = totals.get_mut(&mv.source) {
                *src = src.saturating_sub(mv.bytes);
            }
            *totals.entry(mv.destination.clone()).or_default() += mv.bytes;
        }
        totals
    }

    /// Moves that touch `table`, in plan order
    pub fn moves_for_table(&self, table: &TableRef) -> Vec<&Move> {
        self.moves.iter().filter(|m| &m.table == table).collect()
    }

    pub fn summary(&self) -> String {
        let before = max_deviation(&self.totals_before);
        let after = max_deviation(&self.project_totals());
        format!(
            "{} moves, {} bytes to relocate, {} partitions skipped, max deviation {} -> {} bytes (tolerance {})",
            self.moves.len(),
            self.total_bytes,
            self.skipped.len(),
            before,
            after,
            self.tolerance
        )
    }
}

/// Largest distance of any host total from the mean, rounded down
pub fn max_deviation(totals: &BTreeMap<String, u64>) -> u64 {
    if totals.is_empty() {
        return 0;
    }
    let n = totals.len() as i128;
    let sum: i128 = totals.values().map(|&b| b as i128).sum();
    let scaled = totals
        .values()
        .map(|&b| (n * b as i128 - sum).abs())
        .max()
        .unwrap_or(0);
    (scaled / n) as u64
}

struct Candidate<'a> {
    table: &'a TableRef,
    partition_id: &'a str,
    host: usize,
    bytes: u64,
}

/// Host loads in the scaled space
struct Loads {
    totals: Vec<u64>,
    sum: i128,
    n: i128,
    /// Allowed `|n*x - T|`
    tolerance: i128,
}

impl Loads {
    fn deviation(&self, bytes: u64) -> i128 {
        (self.n * bytes as i128 - self.sum).abs()
    }

    fn is_over_loaded(&self, host: usize) -> bool {
        self.n * self.totals[host] as i128 - self.sum > self.tolerance
    }

    /// Least-loaded host other than `exclude`; the earliest wins ties
    fn least_loaded_except(&self, exclude: usize) -> Option<usize> {
        self.totals
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != exclude)
            .min_by_key(|(idx, bytes)| (**bytes, *idx))
            .map(|(idx, _)| idx)
    }
}

/// Builds rebalance plans
pub struct PlanBuilder {
    config: PlannerConfig,
}

impl PlanBuilder {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn build_from_snapshot(&self, snapshot: &ClusterSnapshot) -> RebalancePlan {
        self.build(&snapshot.hosts, &snapshot.sizes)
    }

    /// Compute the moves for `sizes` over `hosts`
    #[instrument(skip_all, fields(hosts = listed.len(), tables = sizes.len()))]
    pub fn build(&self, listed: &[String], sizes: &SizeMap) -> RebalancePlan {
        let mut hosts: Vec<String> = Vec::with_capacity(listed.len());
        for host in listed {
            if !hosts.contains(host) {
                hosts.push(host.clone());
            }
        }
        let index: BTreeMap<&str, usize> = hosts
            .iter()
            .enumerate()
            .map(|(idx, host)| (host.as_str(), idx))
            .collect();

        let mut plan = RebalancePlan::default();
        if hosts.is_empty() {
            return plan;
        }

        // Data on hosts outside the shard list is neither counted nor moved
        let mut totals = vec![0u64; hosts.len()];
        let mut unlisted: BTreeSet<&str> = BTreeSet::new();
        for partitions in sizes.values() {
            for holders in partitions.by_partition.values() {
                for (host, bytes) in holders {
                    match index.get(host.as_str()) {
                        Some(&idx) => totals[idx] += bytes,
                        None => {
                            unlisted.insert(host.as_str());
                        }
                    }
                }
            }
        }
        for host in &unlisted {
            warn!(host = %host, "Ignoring data on a host that is not in the shard list");
        }
        plan.totals_before = hosts
            .iter()
            .zip(&totals)
            .map(|(h, b)| (h.clone(), *b))
            .collect();

        let n = hosts.len() as i128;
        let sum: i128 = totals.iter().map(|&b| b as i128).sum();
        let ratio_scaled = (self.config.tolerance_ratio.max(0.0) * sum as f64).floor() as i128;
        let floor_scaled = self.config.min_tolerance_bytes as i128 * n;
        let mut loads = Loads {
            totals,
            sum,
            n,
            tolerance: ratio_scaled.max(floor_scaled),
        };
        plan.mean = (sum / n) as u64;
        plan.tolerance = (loads.tolerance / n) as u64;

        let mut candidates: Vec<Candidate<'_>> = Vec::new();
        for (table, partitions) in sizes {
            for (partition_id, holders) in &partitions.by_partition {
                if holders.len() > 1 {
                    let skipped = SkippedPartition {
                        table: table.clone(),
                        partition_id: partition_id.clone(),
                        hosts: holders.keys().cloned().collect(),
                    };
                    warn!(error = %skipped.to_error(), "Skipping partition");
                    plan.skipped.push(skipped);
                    continue;
                }
                for (host, &bytes) in holders {
                    let Some(&host) = index.get(host.as_str()) else {
                        continue;
                    };
                    if loads.is_over_loaded(host) {
                        candidates.push(Candidate {
                            table,
                            partition_id,
                            host,
                            bytes,
                        });
                    }
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.bytes
                .cmp(&a.bytes)
                .then_with(|| a.table.cmp(b.table))
                .then_with(|| a.partition_id.cmp(b.partition_id))
                .then_with(|| a.host.cmp(&b.host))
        });

        debug!(
            candidates = candidates.len(),
            mean = plan.mean,
            tolerance = plan.tolerance,
            "Planning"
        );

        for candidate in candidates {
            if self.config.max_moves.is_some_and(|max| plan.moves.len() >= max) {
                debug!("Move limit reached");
                break;
            }

            let src = candidate.host;
            if !loads.is_over_loaded(src) {
                continue;
            }
            let Some(dst) = loads.least_loaded_except(src) else {
                continue;
            };

            let bytes = candidate.bytes;
            let before = loads
                .deviation(loads.totals[src])
                .max(loads.deviation(loads.totals[dst]));
            let after = loads
                .deviation(loads.totals[src] - bytes)
                .max(loads.deviation(loads.totals[dst] + bytes));
            if after >= before {
                continue;
            }

            loads.totals[src] -= bytes;
            loads.totals[dst] += bytes;

            let partitions = &sizes[candidate.table];
            let mv = Move {
                table: candidate.table.clone(),
                partition_id: candidate.partition_id.to_string(),
                partition: partitions.name_of(candidate.partition_id).to_string(),
                source: hosts[src].clone(),
                destination: hosts[dst].clone(),
                bytes,
            };
            debug!(%mv, "Planned move");
            plan.total_bytes += bytes;
            plan.moves.push(mv);
        }

        info!(summary = %plan.summary(), "Rebalance plan created");
        plan
    }
}
