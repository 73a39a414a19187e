use std::collections::{HashMap, HashSet};
use std::time::Duration;

use vmplace::core::candidates::rack_groups;
use vmplace::core::clock::ManualClock;
use vmplace::core::common::{Affinity, PmAddr, RackAddr, VmType};
use vmplace::core::placement_group::PlacementGroup;
use vmplace::core::placer::place_batch;
use vmplace::core::resource_tree::ResourceTree;
use vmplace::core::scheduler::{CreateVerdict, Scheduler, VmAssignment};
use vmplace::core::vm::Vm;

fn t1() -> VmType {
    VmType {
        index: 1,
        nodes_required: 1,
        cpu_per_node: 4,
        memory_per_node: 4,
    }
}

fn t2() -> VmType {
    VmType {
        index: 2,
        nodes_required: 2,
        cpu_per_node: 6,
        memory_per_node: 6,
    }
}

fn small_tree() -> ResourceTree {
    ResourceTree::new(2, 2, 2, &[(10, 10), (10, 10)])
}

fn small_scheduler() -> (Scheduler, ManualClock) {
    let clock = ManualClock::new();
    let scheduler = Scheduler::new(
        small_tree(),
        vec![t1(), t2()],
        Box::new(clock.clone()),
        Duration::from_secs(14),
    );
    (scheduler, clock)
}

fn placed(verdict: CreateVerdict) -> Vec<VmAssignment> {
    match verdict {
        CreateVerdict::Placed(assignments) => assignments,
        CreateVerdict::Infeasible => panic!("unexpected rejection"),
        CreateVerdict::TimedOut => panic!("unexpected timeout"),
    }
}

#[test]
// An unconstrained single VM lands on the very first node of the fabric.
fn test_first_fit_single_vm() {
    let (mut scheduler, _clock) = small_scheduler();
    scheduler.create_pg(1, 0, 0, Affinity::None, Affinity::None);

    let assignments = placed(scheduler.create_vms(&[1], 1, 1, 0).unwrap());
    assert_eq!(
        assignments,
        vec![VmAssignment {
            vm_id: 1,
            domain: 1,
            rack: 1,
            pm: 1,
            nodes: vec![1],
        }]
    );

    scheduler.delete_vms(&[1]).unwrap();
    for domain in &scheduler.tree().domains {
        assert_eq!(domain.res.available_cpu, domain.res.total_cpu);
        assert_eq!(domain.res.available_memory, domain.res.total_memory);
    }
}

#[test]
// Hard rack affinity keeps a whole batch inside one rack.
fn test_hard_rack_affinity_batch() {
    let (mut scheduler, _clock) = small_scheduler();
    scheduler.create_pg(2, 0, 0, Affinity::None, Affinity::Hard);

    let assignments = placed(scheduler.create_vms(&[1, 2], 1, 2, 0).unwrap());
    assert_eq!(assignments.len(), 2);
    assert_eq!(assignments[0].domain, assignments[1].domain);
    assert_eq!(assignments[0].rack, assignments[1].rack);
    // Both fit on the first PM of the first rack.
    assert_eq!((assignments[0].domain, assignments[0].rack), (1, 1));
}

#[test]
// Hard domain affinity pins later batches to the domain of the first
// placement, even when the other domain is emptier.
fn test_hard_domain_affinity_sticks() {
    let (mut scheduler, _clock) = small_scheduler();
    scheduler.create_pg(10, 0, 0, Affinity::Hard, Affinity::None);

    let first = placed(scheduler.create_vms(&[1], 1, 10, 0).unwrap());
    assert_eq!(first[0].domain, 1);

    // Domain 2 is still empty, yet the group must stay in domain 1.
    let second = placed(scheduler.create_vms(&[2, 3], 1, 10, 0).unwrap());
    for assignment in &second {
        assert_eq!(assignment.domain, 1);
    }
}

#[test]
// Partition -1 assigns distinct partitions which must land on disjoint
// racks; an explicit partition may reuse its own racks only.
fn test_hard_partition_disjointness() {
    let (mut scheduler, _clock) = small_scheduler();
    scheduler.create_pg(3, 2, 0, Affinity::None, Affinity::None);

    let pair = placed(scheduler.create_vms(&[1, 2], 1, 3, -1).unwrap());
    assert_ne!(
        (pair[0].domain, pair[0].rack),
        (pair[1].domain, pair[1].rack)
    );

    // VM 1 carries partition 1, VM 2 partition 2.
    let third = placed(scheduler.create_vms(&[4], 1, 3, 1).unwrap());
    assert_eq!((third[0].domain, third[0].rack), (pair[0].domain, pair[0].rack));
    assert_ne!((third[0].domain, third[0].rack), (pair[1].domain, pair[1].rack));

    // Rack sets of the two partitions stay disjoint.
    let mut racks_by_partition: HashMap<u32, HashSet<(usize, usize)>> = HashMap::new();
    for vm in scheduler.catalog().vms.values() {
        racks_by_partition
            .entry(vm.partition)
            .or_default()
            .insert((vm.nodes[0].domain, vm.nodes[0].rack));
    }
    assert!(racks_by_partition[&1].is_disjoint(&racks_by_partition[&2]));
}

#[test]
// Soft PM anti-affinity spreads VMs over PMs of one rack while it can; once
// every PM of the rack carries its share, sharing is preferred over leaving
// the rack, at a penalty.
fn test_soft_pm_anti_affinity_with_soft_rack() {
    let (mut scheduler, _clock) = small_scheduler();
    scheduler.create_pg(4, 0, 1, Affinity::None, Affinity::Soft);

    let a1 = placed(scheduler.create_vms(&[1], 1, 4, 0).unwrap())[0].clone();
    let a2 = placed(scheduler.create_vms(&[2], 1, 4, 0).unwrap())[0].clone();
    let a3 = placed(scheduler.create_vms(&[3], 1, 4, 0).unwrap())[0].clone();

    // All three stay in one rack.
    assert_eq!((a1.domain, a1.rack), (a2.domain, a2.rack));
    assert_eq!((a1.domain, a1.rack), (a3.domain, a3.rack));
    // The first two avoid sharing a PM, the third has to share.
    assert_ne!(a1.pm, a2.pm);
    assert!(a3.pm == a1.pm || a3.pm == a2.pm);

    // PG bookkeeping on the PMs matches the placements.
    let shared = PmAddr {
        domain: a3.domain - 1,
        rack: a3.rack - 1,
        pm: a3.pm - 1,
    };
    assert_eq!(scheduler.tree().pm(shared).vms_of(4), 2);
}

#[test]
// Soft PM anti-affinity is counted strictly: landing at the limit is free,
// every VM on a PM strictly over it costs one penalty point.
fn test_soft_pm_penalty_is_strict() {
    let mut tree = small_tree();
    let mut pg = PlacementGroup::new(4, 0, 1, Affinity::None, Affinity::Soft);
    let mut vms: HashMap<u32, Vm> = HashMap::new();
    for id in 1..=3 {
        vms.insert(id, Vm::new(id, 1, 4, 0));
        pg.vms.push(id);
    }

    // One rack only: two VMs spread over the two PMs for free, the third is
    // forced onto an occupied PM, putting that PM at 2 > 1 and costing one
    // point for each VM on it. Mean group load is 12/40.
    let group = vec![RackAddr { domain: 0, rack: 0 }];
    let placement = place_batch(&mut tree, &mut pg, &mut vms, &[1, 2, 3], &t1(), &group).unwrap();
    assert!((placement.penalty - (2.0 + 0.3)).abs() < 1e-9);
}

#[test]
// Filling a hard-affinity domain leaves the next creation with no candidate
// and the request is rejected.
fn test_exhausted_domain_rejects() {
    let (mut scheduler, _clock) = small_scheduler();
    scheduler.create_pg(5, 0, 0, Affinity::Hard, Affinity::None);

    // Four two-node VMs saturate every PM of one domain.
    let batch = placed(scheduler.create_vms(&[1, 2, 3, 4], 2, 5, 0).unwrap());
    let domain = batch[0].domain;
    for assignment in &batch {
        assert_eq!(assignment.domain, domain);
        assert_eq!(assignment.nodes.len(), 2);
    }

    let verdict = scheduler.create_vms(&[5], 2, 5, 0).unwrap();
    assert!(matches!(verdict, CreateVerdict::Infeasible));
}

#[test]
// Once the wall-clock budget is spent, creations are rejected before the
// tree is even inspected.
fn test_time_budget_gate() {
    let (mut scheduler, clock) = small_scheduler();
    scheduler.create_pg(6, 0, 0, Affinity::None, Affinity::None);

    clock.set(Duration::from_secs(14));
    let verdict = scheduler.create_vms(&[1], 1, 6, 0).unwrap();
    assert!(matches!(verdict, CreateVerdict::TimedOut));
    for domain in &scheduler.tree().domains {
        assert_eq!(domain.res.available_cpu, domain.res.total_cpu);
    }
}

#[test]
// Deletions are never budget-gated.
fn test_deletion_ignores_budget() {
    let (mut scheduler, clock) = small_scheduler();
    scheduler.create_pg(7, 0, 0, Affinity::None, Affinity::None);
    placed(scheduler.create_vms(&[1], 1, 7, 0).unwrap());

    clock.set(Duration::from_secs(20));
    scheduler.delete_vms(&[1]).unwrap();
    assert!(scheduler.catalog().vms.is_empty());
}

#[test]
// Hard rack affinity candidates are individual racks able to hold the whole
// batch; an oversized batch leaves no candidates at all.
fn test_hard_rack_candidates_filtered_by_batch_fit() {
    let mut tree = small_tree();
    let pg = PlacementGroup::new(8, 0, 0, Affinity::None, Affinity::Hard);

    // Each rack fits 8 single-node VMs.
    let groups = rack_groups(&mut tree, &pg, 8, &t1());
    assert_eq!(groups.len(), 4);
    assert!(groups.iter().all(|g| g.len() == 1));

    let groups = rack_groups(&mut tree, &pg, 9, &t1());
    assert!(groups.is_empty());
}

#[test]
// Without any affinity the enumerator offers exactly one group holding the
// whole fabric.
fn test_unconstrained_candidates_are_one_group() {
    let mut tree = small_tree();
    let pg = PlacementGroup::new(9, 0, 0, Affinity::None, Affinity::None);

    let groups = rack_groups(&mut tree, &pg, 1, &t1());
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].len(), 4);
}
