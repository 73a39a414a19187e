//! Request dispatch: placement group declaration, VM creation and deletion.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use log::{debug, info};
use serde::Serialize;

use crate::core::candidates::rack_groups;
use crate::core::catalog::Catalog;
use crate::core::clock::Clock;
use crate::core::common::{Affinity, VmType};
use crate::core::error::SessionError;
use crate::core::placement_group::PlacementGroup;
use crate::core::placer::{place_batch, unplace_all, Placement};
use crate::core::resource_tree::ResourceTree;
use crate::core::vm::Vm;

/// Committed placement of a single VM in fabric coordinates (1-based, as
/// emitted on the wire).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VmAssignment {
    pub vm_id: u32,
    pub domain: usize,
    pub rack: usize,
    pub pm: usize,
    pub nodes: Vec<usize>,
}

impl Display for VmAssignment {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{} {} {}", self.domain, self.rack, self.pm)?;
        for node in &self.nodes {
            write!(f, " {}", node)?;
        }
        Ok(())
    }
}

/// Outcome of a creation request. Anything but `Placed` ends the session.
pub enum CreateVerdict {
    Placed(Vec<VmAssignment>),
    Infeasible,
    TimedOut,
}

/// Running totals reported at session shutdown.
#[derive(Default, Serialize)]
pub struct SessionStats {
    pub requests: u64,
    pub pgs_declared: u64,
    pub vms_placed: u64,
    pub vms_deleted: u64,
}

/// The placement engine: owns the fabric state and the registries, and
/// serves one synchronous request at a time.
pub struct Scheduler {
    tree: ResourceTree,
    catalog: Catalog,
    clock: Box<dyn Clock>,
    time_budget: Duration,
    stats: SessionStats,
}

impl Scheduler {
    /// Safety margin below the externally imposed session limit.
    pub const DEFAULT_TIME_BUDGET: Duration = Duration::from_secs(14);

    pub fn new(tree: ResourceTree, types: Vec<VmType>, clock: Box<dyn Clock>, time_budget: Duration) -> Self {
        Self {
            tree,
            catalog: Catalog::new(types),
            clock,
            time_budget,
            stats: SessionStats::default(),
        }
    }

    /// Declares a placement group.
    pub fn create_pg(
        &mut self,
        id: u32,
        hard_rack_partitions: u32,
        soft_pm_anti_affinity: u32,
        domain_affinity: Affinity,
        rack_affinity: Affinity,
    ) {
        self.stats.requests += 1;
        self.stats.pgs_declared += 1;
        debug!(
            "declare pg #{}: partitions={} soft_pm={} domain={:?} rack={:?}",
            id, hard_rack_partitions, soft_pm_anti_affinity, domain_affinity, rack_affinity
        );
        self.catalog.pgs.insert(
            id,
            PlacementGroup::new(id, hard_rack_partitions, soft_pm_anti_affinity, domain_affinity, rack_affinity),
        );
    }

    /// Creates a batch of VMs, committing the cheapest placement any rack
    /// group accepts. Assignments are returned in input id order.
    pub fn create_vms(
        &mut self,
        ids: &[u32],
        type_index: usize,
        pg_id: u32,
        partition_hint: i64,
    ) -> Result<CreateVerdict, SessionError> {
        self.stats.requests += 1;
        if self.clock.elapsed() >= self.time_budget {
            info!("time budget exhausted, rejecting creation request");
            return Ok(CreateVerdict::TimedOut);
        }

        let vm_type = self.catalog.vm_type(type_index)?.clone();
        let Catalog { pgs, vms, .. } = &mut self.catalog;
        let pg = pgs
            .get_mut(&pg_id)
            .ok_or(SessionError::UnknownPlacementGroup(pg_id))?;

        let hint = if pg.hard_rack_partitions == 0 { 0 } else { partition_hint };
        for (i, &id) in ids.iter().enumerate() {
            let partition = if hint >= 0 { hint as u32 } else { (i + 1) as u32 };
            vms.insert(id, Vm::new(id, type_index, pg_id, partition));
            pg.vms.push(id);
        }

        pg.refresh(vms);
        let groups = rack_groups(&mut self.tree, pg, ids.len(), &vm_type);
        debug!("evaluating {} rack groups for a batch of {}", groups.len(), ids.len());

        let mut best: Option<Placement> = None;
        for group in &groups {
            if let Some(placement) = place_batch(&mut self.tree, pg, vms, ids, &vm_type, group) {
                debug!(
                    "group of {} racks accepted the batch, penalty {:.3}",
                    group.len(),
                    placement.penalty
                );
                if best.as_ref().map_or(true, |b| placement.penalty < b.penalty) {
                    best = Some(placement);
                }
            }
        }
        unplace_all(&mut self.tree, vms, &vm_type, ids);

        let Some(best) = best else {
            info!("no rack group accepted the batch of {} VMs, rejecting", ids.len());
            return Ok(CreateVerdict::Infeasible);
        };

        let mut assignments = Vec::with_capacity(ids.len());
        for &id in ids {
            let nodes = best.nodes_by_vm[&id].clone();
            vms.get_mut(&id).unwrap().place(nodes.clone(), &vm_type, &mut self.tree);
            assignments.push(VmAssignment {
                vm_id: id,
                domain: nodes[0].domain + 1,
                rack: nodes[0].rack + 1,
                pm: nodes[0].pm + 1,
                nodes: nodes.iter().map(|n| n.node + 1).collect(),
            });
        }
        pg.refresh(vms);
        self.stats.vms_placed += ids.len() as u64;
        Ok(CreateVerdict::Placed(assignments))
    }

    /// Deletes a batch of VMs, releasing their claims.
    pub fn delete_vms(&mut self, ids: &[u32]) -> Result<(), SessionError> {
        self.stats.requests += 1;
        for &id in ids {
            let Catalog { types, pgs, vms } = &mut self.catalog;
            let mut vm = vms.remove(&id).ok_or(SessionError::UnknownVm(id))?;
            let vm_type = &types[vm.type_index - 1];
            if vm.is_placed() {
                vm.unplace(vm_type, &mut self.tree);
            }
            let pg = pgs
                .get_mut(&vm.pg_id)
                .ok_or(SessionError::UnknownPlacementGroup(vm.pg_id))?;
            pg.vms.retain(|&v| v != id);
        }
        self.stats.vms_deleted += ids.len() as u64;
        Ok(())
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn tree(&self) -> &ResourceTree {
        &self.tree
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }
}
