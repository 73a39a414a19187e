//! Virtual machine state and fabric claim bookkeeping.

use crate::core::common::{NodeAddr, VmType};
use crate::core::resource_tree::ResourceTree;

/// A single virtual machine. Unplaced VMs have an empty node list; placed VMs
/// occupy `nodes_required` distinct nodes of one PM.
#[derive(Clone, Debug)]
pub struct Vm {
    pub id: u32,
    /// 1-based index into the type catalog.
    pub type_index: usize,
    pub pg_id: u32,
    pub partition: u32,
    pub nodes: Vec<NodeAddr>,
}

impl Vm {
    pub fn new(id: u32, type_index: usize, pg_id: u32, partition: u32) -> Self {
        Self {
            id,
            type_index,
            pg_id,
            partition,
            nodes: Vec::new(),
        }
    }

    pub fn is_placed(&self) -> bool {
        !self.nodes.is_empty()
    }

    /// Claims the given nodes on all four fabric levels and records this VM
    /// against its PG on the first node's PM.
    pub fn place(&mut self, nodes: Vec<NodeAddr>, vm_type: &VmType, tree: &mut ResourceTree) {
        debug_assert!(!self.is_placed());
        debug_assert_eq!(nodes.len(), vm_type.nodes_required as usize);
        for &addr in &nodes {
            tree.claim(addr, vm_type);
        }
        *tree.pm_mut(nodes[0].pm()).vms_by_pg.entry(self.pg_id).or_insert(0) += 1;
        self.nodes = nodes;
    }

    /// Releases every node claim of this VM and clears its node list.
    pub fn unplace(&mut self, vm_type: &VmType, tree: &mut ResourceTree) {
        for &addr in &self.nodes {
            tree.release(addr, vm_type);
        }
        let pm = tree.pm_mut(self.nodes[0].pm());
        let count = pm
            .vms_by_pg
            .get_mut(&self.pg_id)
            .expect("pg bookkeeping missing on unplace");
        *count -= 1;
        if *count == 0 {
            pm.vms_by_pg.remove(&self.pg_id);
        }
        self.nodes.clear();
    }
}
