//! Placement groups and their derived constraint state.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::core::common::{Affinity, RackAddr};
use crate::core::vm::Vm;

/// A logical bundle of VMs sharing a constraint profile.
///
/// The derived fields below `vms` are recomputed on demand by
/// [`PlacementGroup::refresh`] and reflect the currently placed VMs only.
#[derive(Clone, Debug)]
pub struct PlacementGroup {
    pub id: u32,
    /// Number of hard rack anti-affinity partitions; 0 disables partitioning.
    pub hard_rack_partitions: u32,
    /// Preferred maximum number of this PG's VMs per PM; 0 disables the rule.
    pub soft_pm_anti_affinity: u32,
    pub domain_affinity: Affinity,
    pub rack_affinity: Affinity,
    /// Ids of all live VMs of this group, in registration order.
    pub vms: Vec<u32>,

    pub target_domain: Option<usize>,
    pub domain_affinity_possible: bool,
    pub target_rack: Option<RackAddr>,
    pub rack_affinity_possible: bool,
    pub soft_pm_anti_affinity_active: bool,
    /// Racks currently occupied by each partition.
    pub partition_racks: BTreeMap<u32, HashSet<RackAddr>>,
}

impl PlacementGroup {
    pub fn new(
        id: u32,
        hard_rack_partitions: u32,
        soft_pm_anti_affinity: u32,
        domain_affinity: Affinity,
        rack_affinity: Affinity,
    ) -> Self {
        // A single partition cannot conflict with anything, treat it as none.
        let hard_rack_partitions = if hard_rack_partitions <= 1 {
            0
        } else {
            hard_rack_partitions
        };
        Self {
            id,
            hard_rack_partitions,
            soft_pm_anti_affinity,
            domain_affinity,
            rack_affinity,
            vms: Vec::new(),
            target_domain: None,
            domain_affinity_possible: true,
            target_rack: None,
            rack_affinity_possible: true,
            soft_pm_anti_affinity_active: soft_pm_anti_affinity > 0,
            partition_racks: BTreeMap::new(),
        }
    }

    /// Recomputes the derived constraint state from the placed VMs.
    ///
    /// `target_domain` / `target_rack` end up as the unique domain/rack shared
    /// by every placed VM, or `None` (with the matching `*_possible` flag
    /// dropped) once two placed VMs disagree. The soft PM anti-affinity stops
    /// being counted as soon as any SOFT affinity of the group has become
    /// impossible, so an already-spread group is not penalized further down.
    pub fn refresh(&mut self, vms: &HashMap<u32, Vm>) {
        self.target_domain = None;
        self.domain_affinity_possible = true;
        self.target_rack = None;
        self.rack_affinity_possible = true;
        self.partition_racks.clear();

        for id in &self.vms {
            let vm = &vms[id];
            if !vm.is_placed() {
                continue;
            }
            let rack = vm.nodes[0].rack();

            if self.domain_affinity_possible {
                match self.target_domain {
                    None => self.target_domain = Some(rack.domain),
                    Some(target) if target != rack.domain => {
                        self.target_domain = None;
                        self.domain_affinity_possible = false;
                    }
                    _ => {}
                }
            }

            if self.rack_affinity_possible {
                match self.target_rack {
                    None => self.target_rack = Some(rack),
                    Some(target) if target != rack => {
                        self.target_rack = None;
                        self.rack_affinity_possible = false;
                    }
                    _ => {}
                }
            }

            if self.hard_rack_partitions > 0 {
                self.partition_racks.entry(vm.partition).or_default().insert(rack);
            }
        }

        let soft_broken = (self.domain_affinity == Affinity::Soft && !self.domain_affinity_possible)
            || (self.rack_affinity == Affinity::Soft && !self.rack_affinity_possible);
        self.soft_pm_anti_affinity_active = self.soft_pm_anti_affinity > 0 && !soft_broken;
    }
}
