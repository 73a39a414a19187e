//! Enumeration of candidate rack groups for a creation batch.
//!
//! A rack group is a set of racks the batch is allowed to spread over. The
//! enumerator turns the PG's constraint state into an ordered list of groups,
//! most affinity-respecting first; the placer then evaluates every group and
//! the cheapest placement wins.

use crate::core::common::{Affinity, RackAddr, VmType};
use crate::core::placement_group::PlacementGroup;
use crate::core::resource_tree::ResourceTree;

pub type RackGroup = Vec<RackAddr>;

/// Builds the ordered candidate rack groups for a batch of `batch_size` VMs
/// of `vm_type`. Expects `pg` to be freshly refreshed.
pub fn rack_groups(
    tree: &mut ResourceTree,
    pg: &PlacementGroup,
    batch_size: usize,
    vm_type: &VmType,
) -> Vec<RackGroup> {
    let rack_soft = pg.rack_affinity == Affinity::Soft && pg.rack_affinity_possible;
    let domain_soft = pg.domain_affinity == Affinity::Soft && pg.domain_affinity_possible;

    let mut groups: Vec<RackGroup> = Vec::new();

    if pg.rack_affinity == Affinity::Hard {
        // Every VM of the group must share one rack.
        if let Some(target) = pg.target_rack {
            groups.push(vec![target]);
        } else {
            let mut singles: Vec<RackAddr> = tree
                .rack_addrs()
                .into_iter()
                .filter(|&r| tree.rack_mut(r).fit_count(vm_type) >= batch_size as u64)
                .collect();
            sort_by_load(tree, &mut singles);
            groups.extend(singles.into_iter().map(|r| vec![r]));
        }
    } else if pg.domain_affinity == Affinity::Hard {
        let mut pinned = 0;
        if rack_soft {
            if let Some(target) = pg.target_rack {
                groups.push(vec![target]);
                pinned = 1;
            }
        }
        if let Some(target) = pg.target_domain {
            let mut group = tree.domain_rack_addrs(target);
            sort_by_load(tree, &mut group);
            groups.push(group);
        } else {
            for d in 0..tree.domains.len() {
                let group = tree.domain_rack_addrs(d);
                let fit: u64 = group.iter().map(|&r| tree.rack_mut(r).fit_count(vm_type)).sum();
                if fit < batch_size as u64 {
                    continue;
                }
                let mut group = group;
                sort_by_load(tree, &mut group);
                groups.push(group);
            }
            sort_groups_by_coolest(tree, &mut groups[pinned..]);
        }
    } else if rack_soft || domain_soft {
        if rack_soft {
            // Singleton groups let the placer keep the batch on one rack even
            // when that costs a forced soft-PM-anti-affinity violation.
            if let Some(target) = pg.target_rack {
                groups.push(vec![target]);
            } else {
                let mut singles = tree.rack_addrs();
                sort_by_load(tree, &mut singles);
                groups.extend(singles.into_iter().map(|r| vec![r]));
            }
        }
        if let Some(target) = pg.target_domain {
            let mut group = tree.domain_rack_addrs(target);
            sort_by_load(tree, &mut group);
            groups.push(group);
        }
        let tail_start = groups.len();
        for d in 0..tree.domains.len() {
            if pg.target_domain == Some(d) {
                continue;
            }
            let mut group = tree.domain_rack_addrs(d);
            sort_by_load(tree, &mut group);
            groups.push(group);
        }
        sort_groups_by_coolest(tree, &mut groups[tail_start..]);

        let mut union = tree.rack_addrs();
        sort_by_load(tree, &mut union);
        groups.push(union);
    } else {
        let mut union = tree.rack_addrs();
        sort_by_load(tree, &mut union);
        groups.push(union);
    }

    groups
}

/// Stable load-ascending order; ties keep fabric order.
pub fn sort_by_load(tree: &ResourceTree, racks: &mut [RackAddr]) {
    racks.sort_by(|&a, &b| tree.rack(a).res.load().total_cmp(&tree.rack(b).res.load()));
}

/// Orders groups by the load of their coolest rack (each group is already
/// load-ascending internally, so that is the first entry).
fn sort_groups_by_coolest(tree: &ResourceTree, groups: &mut [RackGroup]) {
    groups.sort_by(|a, b| {
        tree.rack(a[0])
            .res
            .load()
            .total_cmp(&tree.rack(b[0]).res.load())
    });
}
