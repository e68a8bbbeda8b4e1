//! Planner properties over randomly generated clusters

use ckrebalance::model::{PartitionSizes, PartitionStat, SizeMap, TableRef};
use ckrebalance::planner::{max_deviation, PlanBuilder, PlannerConfig, RebalancePlan};
use proptest::prelude::*;
use std::collections::BTreeSet;

const TABLES: [&str; 3] = ["events", "hits", "sessions"];

/// (table, holders, bytes); two holders make a multi-host partition
type Partition = (usize, Vec<usize>, u64);

fn hosts(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("ch{}", i)).collect()
}

fn size_map(hosts: &[String], partitions: &[Partition]) -> SizeMap {
    let mut sizes = SizeMap::new();
    for (i, (table, holders, bytes)) in partitions.iter().enumerate() {
        let table = TableRef::new("db", TABLES[*table]);
        let stat = PartitionStat {
            partition_id: format!("{:04}", i),
            partition: format!("2024-{:04}", i),
            bytes: *bytes,
        };
        let entry: &mut PartitionSizes = sizes.entry(table).or_default();
        for holder in holders {
            entry.observe(&hosts[*holder % hosts.len()], &stat);
        }
    }
    sizes
}

/// Apply a plan to a size map
fn apply(sizes: &SizeMap, plan: &RebalancePlan) -> SizeMap {
    let mut sizes = sizes.clone();
    for mv in &plan.moves {
        let holders = sizes
            .get_mut(&mv.table)
            .and_then(|p| p.by_partition.get_mut(&mv.partition_id))
            .expect("moved partition exists");
        let bytes = holders.remove(&mv.source).expect("source holds partition");
        holders.insert(mv.destination.clone(), bytes);
    }
    sizes
}

fn cluster() -> impl Strategy<Value = (usize, Vec<Partition>)> {
    (1usize..6).prop_flat_map(|n| {
        let partition = (
            0usize..TABLES.len(),
            prop::collection::vec(0usize..n, 1..=2).prop_map(|mut v| {
                v.dedup();
                v
            }),
            1u64..1_000_000_000_000,
        );
        (Just(n), prop::collection::vec(partition, 0..40))
    })
}

fn tolerance() -> impl Strategy<Value = f64> {
    prop_oneof![Just(0.0), Just(0.05), 0.0f64..0.5]
}

proptest! {
    #[test]
    fn prop_moves_are_well_formed((n, parts) in cluster(), tol in tolerance()) {
        let hosts = hosts(n);
        let sizes = size_map(&hosts, &parts);
        let plan = PlanBuilder::new(PlannerConfig { tolerance_ratio: tol, ..Default::default() })
            .build(&hosts, &sizes);

        let skipped: BTreeSet<_> = plan
            .skipped
            .iter()
            .map(|s| (s.table.clone(), s.partition_id.clone()))
            .collect();
        let mut seen = BTreeSet::new();

        for mv in &plan.moves {
            prop_assert_ne!(&mv.source, &mv.destination);
            prop_assert!(hosts.contains(&mv.destination));

            let holders = &sizes[&mv.table].by_partition[&mv.partition_id];
            prop_assert_eq!(holders.len(), 1);
            prop_assert_eq!(holders.get(&mv.source).copied(), Some(mv.bytes));

            let key = (mv.table.clone(), mv.partition_id.clone());
            prop_assert!(!skipped.contains(&key));
            prop_assert!(seen.insert(key), "partition moved twice");
        }
    }

    #[test]
    fn prop_plan_conserves_bytes((n, parts) in cluster(), tol in tolerance()) {
        let hosts = hosts(n);
        let sizes = size_map(&hosts, &parts);
        let plan = PlanBuilder::new(PlannerConfig { tolerance_ratio: tol, ..Default::default() })
            .build(&hosts, &sizes);

        let before: u64 = plan.totals_before.values().sum();
        let after: u64 = plan.project_totals().values().sum();
        prop_assert_eq!(before, after);
        prop_assert_eq!(plan.total_bytes, plan.moves.iter().map(|m| m.bytes).sum::<u64>());
        prop_assert!(max_deviation(&plan.project_totals()) <= max_deviation(&plan.totals_before));
    }

    #[test]
    fn prop_plan_is_deterministic((n, parts) in cluster(), tol in tolerance()) {
        let hosts = hosts(n);
        let sizes = size_map(&hosts, &parts);
        let builder = PlanBuilder::new(PlannerConfig { tolerance_ratio: tol, ..Default::default() });

        let first = builder.build(&hosts, &sizes);
        let second = builder.build(&hosts, &sizes.clone());
        prop_assert_eq!(&first.moves, &second.moves);
        prop_assert_eq!(&first.skipped, &second.skipped);
    }

    #[test]
    fn prop_balanced_cluster_needs_no_moves((n, parts) in cluster(), tol in tolerance()) {
        let hosts = hosts(n);
        let sizes = size_map(&hosts, &parts);
        let builder = PlanBuilder::new(PlannerConfig { tolerance_ratio: tol, ..Default::default() });
        let plan = builder.build(&hosts, &sizes);

        if max_deviation(&plan.totals_before) < plan.tolerance {
            prop_assert!(plan.is_empty());
        }

        // Planning again on the projected layout never widens the spread
        let projected = apply(&sizes, &plan);
        let replan = builder.build(&hosts, &projected);
        prop_assert_eq!(&replan.totals_before, &plan.project_totals());
        prop_assert!(
            max_deviation(&replan.project_totals()) <= max_deviation(&replan.totals_before)
        );
    }
}

#[test]
fn test_replan_after_two_host_move_is_empty() {
    let hosts = hosts(2);
    let parts: Vec<Partition> = vec![(0, vec![0], 300), (0, vec![0], 300), (1, vec![1], 200)];
    let sizes = size_map(&hosts, &parts);
    let builder = PlanBuilder::new(PlannerConfig::default());

    let plan = builder.build(&hosts, &sizes);
    assert_eq!(plan.moves.len(), 1);

    let replan = builder.build(&hosts, &apply(&sizes, &plan));
    assert!(replan.is_empty());
}
