//! Fabric state: domains, racks, physical machines and nodes, with
//! aggregated resource counters maintained at every level.

use std::collections::HashMap;

use crate::core::common::{NodeAddr, PmAddr, RackAddr, VmType};

/// Total and currently available CPU/memory at one level of the fabric.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceCounters {
    pub total_cpu: u64,
    pub total_memory: u64,
    pub available_cpu: u64,
    pub available_memory: u64,
}

impl ResourceCounters {
    fn new(cpu: u64, memory: u64) -> Self {
        Self {
            total_cpu: cpu,
            total_memory: memory,
            available_cpu: cpu,
            available_memory: memory,
        }
    }

    fn claim(&mut self, cpu: u64, memory: u64) {
        assert!(
            self.available_cpu >= cpu && self.available_memory >= memory,
            "claim would drive counters negative"
        );
        self.available_cpu -= cpu;
        self.available_memory -= memory;
    }

    fn release(&mut self, cpu: u64, memory: u64) {
        self.available_cpu += cpu;
        self.available_memory += memory;
        assert!(
            self.available_cpu <= self.total_cpu && self.available_memory <= self.total_memory,
            "release of a reservation that was never claimed"
        );
    }

    pub fn has_capacity(&self, cpu: u64, memory: u64) -> bool {
        self.available_cpu >= cpu && self.available_memory >= memory
    }

    /// Utilization of the busier resource, in `[0, 1]`.
    pub fn load(&self) -> f64 {
        let cpu_load = (self.total_cpu - self.available_cpu) as f64 / self.total_cpu as f64;
        let memory_load = (self.total_memory - self.available_memory) as f64 / self.total_memory as f64;
        cpu_load.max(memory_load)
    }
}

/// Leaf of the fabric, the smallest allocation unit.
#[derive(Clone, Debug)]
pub struct Node {
    pub res: ResourceCounters,
    fit_cache: HashMap<usize, u64>,
}

impl Node {
    fn new(cpu: u64, memory: u64) -> Self {
        Self {
            res: ResourceCounters::new(cpu, memory),
            fit_cache: HashMap::new(),
        }
    }

    /// How many VMs of the given type could claim this node, ignoring siblings.
    pub fn fit_count(&mut self, vm_type: &VmType) -> u64 {
        if let Some(&cached) = self.fit_cache.get(&vm_type.index) {
            return cached;
        }
        let value = (self.res.available_cpu / vm_type.cpu_per_node)
            .min(self.res.available_memory / vm_type.memory_per_node);
        self.fit_cache.insert(vm_type.index, value);
        value
    }
}

/// Physical machine: an ordered sequence of nodes sharing a template.
#[derive(Clone, Debug)]
pub struct Pm {
    pub res: ResourceCounters,
    pub nodes: Vec<Node>,
    /// Per placement group, the number of VMs whose first node is on this PM.
    pub vms_by_pg: HashMap<u32, u32>,
    fit_cache: HashMap<usize, u64>,
}

impl Pm {
    fn new(node_caps: &[(u64, u64)]) -> Self {
        let cpu = node_caps.iter().map(|c| c.0).sum();
        let memory = node_caps.iter().map(|c| c.1).sum();
        Self {
            res: ResourceCounters::new(cpu, memory),
            nodes: node_caps.iter().map(|&(c, m)| Node::new(c, m)).collect(),
            vms_by_pg: HashMap::new(),
            fit_cache: HashMap::new(),
        }
    }

    /// Upper bound on how many whole VMs of the given type this PM can still
    /// hold: node fits are sorted ascending and every `nodes_required`-th
    /// entry is summed, counting disjoint weakest-first node groups.
    pub fn fit_count(&mut self, vm_type: &VmType) -> u64 {
        if let Some(&cached) = self.fit_cache.get(&vm_type.index) {
            return cached;
        }
        let mut by_node: Vec<u64> = self.nodes.iter_mut().map(|n| n.fit_count(vm_type)).collect();
        by_node.sort_unstable();
        let value = by_node
            .iter()
            .step_by(vm_type.nodes_required as usize)
            .sum();
        self.fit_cache.insert(vm_type.index, value);
        value
    }

    /// Fast necessary (not sufficient) check that one whole VM could fit here.
    pub fn fits_whole(&self, vm_type: &VmType) -> bool {
        self.res.has_capacity(vm_type.cpu_per_vm(), vm_type.memory_per_vm())
    }

    /// Number of VMs of the given placement group whose first node is here.
    pub fn vms_of(&self, pg_id: u32) -> u32 {
        self.vms_by_pg.get(&pg_id).copied().unwrap_or(0)
    }
}

/// Rack: an ordered sequence of PMs, the unit of rack affinity.
#[derive(Clone, Debug)]
pub struct Rack {
    pub res: ResourceCounters,
    pub pms: Vec<Pm>,
    fit_cache: HashMap<usize, u64>,
}

impl Rack {
    fn new(pm_count: usize, node_caps: &[(u64, u64)]) -> Self {
        let cpu: u64 = node_caps.iter().map(|c| c.0).sum::<u64>() * pm_count as u64;
        let memory: u64 = node_caps.iter().map(|c| c.1).sum::<u64>() * pm_count as u64;
        Self {
            res: ResourceCounters::new(cpu, memory),
            pms: (0..pm_count).map(|_| Pm::new(node_caps)).collect(),
            fit_cache: HashMap::new(),
        }
    }

    pub fn fit_count(&mut self, vm_type: &VmType) -> u64 {
        if let Some(&cached) = self.fit_cache.get(&vm_type.index) {
            return cached;
        }
        let value = self.pms.iter_mut().map(|pm| pm.fit_count(vm_type)).sum();
        self.fit_cache.insert(vm_type.index, value);
        value
    }

    pub fn fits_whole(&self, vm_type: &VmType) -> bool {
        self.res.has_capacity(vm_type.cpu_per_vm(), vm_type.memory_per_vm())
    }
}

/// Top-level failure domain containing multiple racks.
#[derive(Clone, Debug)]
pub struct Domain {
    pub res: ResourceCounters,
    pub racks: Vec<Rack>,
    fit_cache: HashMap<usize, u64>,
}

impl Domain {
    fn new(rack_count: usize, pm_count: usize, node_caps: &[(u64, u64)]) -> Self {
        let per_rack_cpu: u64 = node_caps.iter().map(|c| c.0).sum::<u64>() * pm_count as u64;
        let per_rack_memory: u64 = node_caps.iter().map(|c| c.1).sum::<u64>() * pm_count as u64;
        Self {
            res: ResourceCounters::new(
                per_rack_cpu * rack_count as u64,
                per_rack_memory * rack_count as u64,
            ),
            racks: (0..rack_count).map(|_| Rack::new(pm_count, node_caps)).collect(),
            fit_cache: HashMap::new(),
        }
    }

    pub fn fit_count(&mut self, vm_type: &VmType) -> u64 {
        if let Some(&cached) = self.fit_cache.get(&vm_type.index) {
            return cached;
        }
        let value = self.racks.iter_mut().map(|r| r.fit_count(vm_type)).sum();
        self.fit_cache.insert(vm_type.index, value);
        value
    }
}

/// The whole fabric. Claims and releases applied at a node propagate through
/// its PM, rack and domain, keeping the aggregated counters consistent.
#[derive(Clone, Debug)]
pub struct ResourceTree {
    pub domains: Vec<Domain>,
}

impl ResourceTree {
    /// Builds a uniform fabric: every PM carries the same node template.
    pub fn new(
        domain_count: usize,
        racks_per_domain: usize,
        pms_per_rack: usize,
        node_caps: &[(u64, u64)],
    ) -> Self {
        Self {
            domains: (0..domain_count)
                .map(|_| Domain::new(racks_per_domain, pms_per_rack, node_caps))
                .collect(),
        }
    }

    pub fn rack(&self, addr: RackAddr) -> &Rack {
        &self.domains[addr.domain].racks[addr.rack]
    }

    pub fn rack_mut(&mut self, addr: RackAddr) -> &mut Rack {
        &mut self.domains[addr.domain].racks[addr.rack]
    }

    pub fn pm(&self, addr: PmAddr) -> &Pm {
        &self.domains[addr.domain].racks[addr.rack].pms[addr.pm]
    }

    pub fn pm_mut(&mut self, addr: PmAddr) -> &mut Pm {
        &mut self.domains[addr.domain].racks[addr.rack].pms[addr.pm]
    }

    pub fn node(&self, addr: NodeAddr) -> &Node {
        &self.pm(addr.pm()).nodes[addr.node]
    }

    /// Addresses of all racks in fabric order (domain-major).
    pub fn rack_addrs(&self) -> Vec<RackAddr> {
        let mut addrs = Vec::new();
        for (d, domain) in self.domains.iter().enumerate() {
            for r in 0..domain.racks.len() {
                addrs.push(RackAddr { domain: d, rack: r });
            }
        }
        addrs
    }

    /// Addresses of the racks of one domain.
    pub fn domain_rack_addrs(&self, domain: usize) -> Vec<RackAddr> {
        (0..self.domains[domain].racks.len())
            .map(|r| RackAddr { domain, rack: r })
            .collect()
    }

    /// Claims one node's worth of the type's resources at the node and at
    /// every ancestor, invalidating their fit caches.
    pub fn claim(&mut self, addr: NodeAddr, vm_type: &VmType) {
        let (cpu, memory) = (vm_type.cpu_per_node, vm_type.memory_per_node);
        let domain = &mut self.domains[addr.domain];
        domain.res.claim(cpu, memory);
        domain.fit_cache.clear();
        let rack = &mut domain.racks[addr.rack];
        rack.res.claim(cpu, memory);
        rack.fit_cache.clear();
        let pm = &mut rack.pms[addr.pm];
        pm.res.claim(cpu, memory);
        pm.fit_cache.clear();
        let node = &mut pm.nodes[addr.node];
        node.res.claim(cpu, memory);
        node.fit_cache.clear();
    }

    /// Reverse of [`ResourceTree::claim`].
    pub fn release(&mut self, addr: NodeAddr, vm_type: &VmType) {
        let (cpu, memory) = (vm_type.cpu_per_node, vm_type.memory_per_node);
        let domain = &mut self.domains[addr.domain];
        domain.res.release(cpu, memory);
        domain.fit_cache.clear();
        let rack = &mut domain.racks[addr.rack];
        rack.res.release(cpu, memory);
        rack.fit_cache.clear();
        let pm = &mut rack.pms[addr.pm];
        pm.res.release(cpu, memory);
        pm.fit_cache.clear();
        let node = &mut pm.nodes[addr.node];
        node.res.release(cpu, memory);
        node.fit_cache.clear();
    }
}
