//! Batch placement inside a single rack group.
//!
//! The placer uses the resource tree itself as scratch space: tentative
//! placements claim real capacity so that later VMs of the batch see them,
//! and failed attempts are rewound by unplacing. This is safe only because
//! the engine is single-threaded.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use log::trace;

use crate::core::candidates::sort_by_load;
use crate::core::common::{Affinity, NodeAddr, PmAddr, RackAddr, VmType};
use crate::core::placement_group::PlacementGroup;
use crate::core::resource_tree::ResourceTree;
use crate::core::vm::Vm;

/// A tentative full placement of a batch: one node set per VM plus the
/// penalty of accepting it.
pub struct Placement {
    pub nodes_by_vm: HashMap<u32, Vec<NodeAddr>>,
    pub penalty: f64,
}

/// Places the whole batch inside `group`, partition by partition. Returns
/// `None` if any partition cannot be placed; the tree is then left with a
/// partial tentative placement which the caller must rewind via
/// [`unplace_all`].
pub fn place_batch(
    tree: &mut ResourceTree,
    pg: &mut PlacementGroup,
    vms: &mut HashMap<u32, Vm>,
    batch: &[u32],
    vm_type: &VmType,
    group: &[RackAddr],
) -> Option<Placement> {
    if group.is_empty() {
        return None;
    }

    let mut by_partition: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for &id in batch {
        by_partition.entry(vms[&id].partition).or_default().push(id);
    }

    let mut nodes_by_vm = HashMap::new();
    let mut penalty = 0.0;

    for (&partition, members) in &by_partition {
        unplace_all(tree, vms, vm_type, members);
        pg.refresh(vms);

        let mut sorted = group.to_vec();
        sort_by_load(tree, &mut sorted);

        let (start, extra) = partition_windows(pg, partition, &sorted)?;

        let mut placed = false;
        for force in [false, true] {
            let mut window = start.clone();
            let mut pool: VecDeque<RackAddr> = extra.iter().copied().collect();
            loop {
                if let Some(part) = try_place(tree, pg, vms, members, vm_type, &mut window, force) {
                    nodes_by_vm.extend(part.nodes_by_vm);
                    penalty += part.penalty;
                    placed = true;
                    break;
                }
                match pool.pop_front() {
                    Some(rack) => window.push(rack),
                    None => break,
                }
            }
            if placed {
                break;
            }
        }
        if !placed {
            trace!("partition {} did not fit into the rack group", partition);
            return None;
        }
    }

    let total_load: f64 = group.iter().map(|&r| tree.rack(r).res.load()).sum();
    penalty += total_load / group.len() as f64;

    Some(Placement { nodes_by_vm, penalty })
}

/// Splits the (load-ascending) group into the racks to try first and the
/// racks held back for widening, per partition.
fn partition_windows(
    pg: &PlacementGroup,
    partition: u32,
    sorted: &[RackAddr],
) -> Option<(Vec<RackAddr>, Vec<RackAddr>)> {
    if partition > 0 {
        // Racks of sibling partitions are off limits; own racks come first.
        let mut blocked: HashSet<RackAddr> = HashSet::new();
        for (&p, racks) in &pg.partition_racks {
            if p != partition {
                blocked.extend(racks.iter().copied());
            }
        }
        let own = pg.partition_racks.get(&partition);
        let in_own = |r: &RackAddr| own.is_some_and(|set| set.contains(r));

        let mut start: Vec<RackAddr> = sorted
            .iter()
            .copied()
            .filter(|r| in_own(r) && !blocked.contains(r))
            .collect();
        let mut extra: Vec<RackAddr> = sorted
            .iter()
            .copied()
            .filter(|r| !in_own(r) && !blocked.contains(r))
            .collect();
        if start.is_empty() {
            if extra.is_empty() {
                return None;
            }
            start.push(extra.remove(0));
        }
        Some((start, extra))
    } else if pg.rack_affinity == Affinity::Soft && pg.rack_affinity_possible {
        // Seed with one rack so the batch stays together while it can: the
        // target rack when the group contains it, else the coolest rack.
        let seed = pg
            .target_rack
            .filter(|t| sorted.contains(t))
            .unwrap_or(sorted[0]);
        let extra = sorted.iter().filter(|&&r| r != seed).copied().collect();
        Some((vec![seed], extra))
    } else {
        Some((sorted.to_vec(), Vec::new()))
    }
}

/// One placement attempt of a partition's VMs over the current rack window.
fn try_place(
    tree: &mut ResourceTree,
    pg: &mut PlacementGroup,
    vms: &mut HashMap<u32, Vm>,
    members: &[u32],
    vm_type: &VmType,
    window: &mut Vec<RackAddr>,
    force: bool,
) -> Option<Placement> {
    unplace_all(tree, vms, vm_type, members);

    let need_cpu = members.len() as u64 * vm_type.cpu_per_vm();
    let need_memory = members.len() as u64 * vm_type.memory_per_vm();
    let mut avail_cpu = 0;
    let mut avail_memory = 0;
    for &rack in window.iter() {
        avail_cpu += tree.rack(rack).res.available_cpu;
        avail_memory += tree.rack(rack).res.available_memory;
    }
    if avail_cpu < need_cpu || avail_memory < need_memory {
        return None;
    }

    let mut nodes_by_vm = HashMap::new();
    pack(tree, pg, vms, members, vm_type, window, &mut nodes_by_vm, false);
    if force && nodes_by_vm.len() < members.len() {
        pack(tree, pg, vms, members, vm_type, window, &mut nodes_by_vm, true);
    }
    if nodes_by_vm.len() < members.len() {
        return None;
    }

    pg.refresh(vms);

    let mut penalty = 0.0;
    if pg.soft_pm_anti_affinity_active {
        // Strictly over the limit; landing exactly at the limit is free.
        for &id in members {
            let pm = vms[&id].nodes[0].pm();
            if tree.pm(pm).vms_of(pg.id) > pg.soft_pm_anti_affinity {
                penalty += 1.0;
            }
        }
    }
    if pg.domain_affinity == Affinity::Soft && !pg.domain_affinity_possible {
        penalty += 1000.0;
    }
    if pg.rack_affinity == Affinity::Soft && !pg.rack_affinity_possible {
        penalty += 1000.0;
    }

    Some(Placement { nodes_by_vm, penalty })
}

/// Greedy packer: walks the window rack by rack for every still-unplaced VM,
/// committing claims as it goes. VMs it cannot fit stay unplaced.
#[allow(clippy::too_many_arguments)]
fn pack(
    tree: &mut ResourceTree,
    pg: &PlacementGroup,
    vms: &mut HashMap<u32, Vm>,
    members: &[u32],
    vm_type: &VmType,
    window: &mut Vec<RackAddr>,
    nodes_by_vm: &mut HashMap<u32, Vec<NodeAddr>>,
    force: bool,
) {
    for &id in members {
        if vms[&id].is_placed() {
            continue;
        }

        // Prefer the rack that will still accept the most VMs of this type,
        // cooler rack on ties.
        let mut keyed: Vec<(u64, f64, RackAddr)> = window
            .iter()
            .map(|&r| {
                let fit = tree.rack_mut(r).fit_count(vm_type);
                let load = tree.rack(r).res.load();
                (fit, load, r)
            })
            .collect();
        keyed.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.total_cmp(&b.1)));
        window.clear();
        window.extend(keyed.into_iter().map(|k| k.2));

        'racks: for rack_idx in 0..window.len() {
            let rack_addr = window[rack_idx];
            if !tree.rack(rack_addr).fits_whole(vm_type) {
                continue;
            }
            for pm_idx in 0..tree.rack(rack_addr).pms.len() {
                let pm_addr = PmAddr {
                    domain: rack_addr.domain,
                    rack: rack_addr.rack,
                    pm: pm_idx,
                };
                let pm = tree.pm(pm_addr);
                if !pm.fits_whole(vm_type) {
                    continue;
                }
                if !force
                    && pg.soft_pm_anti_affinity_active
                    && pm.vms_of(pg.id) >= pg.soft_pm_anti_affinity
                {
                    continue;
                }
                if let Some(nodes) = pick_nodes(tree, pm_addr, vm_type) {
                    vms.get_mut(&id).unwrap().place(nodes.clone(), vm_type, tree);
                    nodes_by_vm.insert(id, nodes);
                    break 'racks;
                }
            }
        }
    }
}

/// Selects `nodes_required` distinct nodes of one PM, highest fit count
/// first. Returns `None` when the PM cannot supply enough nodes.
fn pick_nodes(tree: &mut ResourceTree, pm_addr: PmAddr, vm_type: &VmType) -> Option<Vec<NodeAddr>> {
    let pm = tree.pm_mut(pm_addr);
    let mut keyed: Vec<(u64, usize)> = pm
        .nodes
        .iter_mut()
        .enumerate()
        .map(|(i, n)| (n.fit_count(vm_type), i))
        .collect();
    keyed.sort_by(|a, b| b.0.cmp(&a.0));

    let mut picked = Vec::with_capacity(vm_type.nodes_required as usize);
    for (_, i) in keyed {
        if pm.nodes[i]
            .res
            .has_capacity(vm_type.cpu_per_node, vm_type.memory_per_node)
        {
            picked.push(NodeAddr {
                domain: pm_addr.domain,
                rack: pm_addr.rack,
                pm: pm_addr.pm,
                node: i,
            });
            if picked.len() == vm_type.nodes_required as usize {
                return Some(picked);
            }
        }
    }
    None
}

/// Unplaces every placed VM of the given set, releasing its claims.
pub fn unplace_all(tree: &mut ResourceTree, vms: &mut HashMap<u32, Vm>, vm_type: &VmType, ids: &[u32]) {
    for id in ids {
        let vm = vms.get_mut(id).unwrap();
        if vm.is_placed() {
            vm.unplace(vm_type, tree);
        }
    }
}
