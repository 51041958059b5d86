//! Canonical cluster model
//!
//! The inventory builder turns raw API responses into the types in this
//! module. Everything here is plain data: once a [`Cluster`] has been built
//! and the constraints compiled against it, it is never mutated again for the
//! rest of the cycle. The placement engine works on its own load table derived
//! from this snapshot.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of a guest workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    /// QEMU virtual machine
    Vm,
    /// LXC container
    Ct,
}

impl fmt::Display for GuestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestKind::Vm => write!(f, "vm"),
            GuestKind::Ct => write!(f, "ct"),
        }
    }
}

/// The resource axis a balancing cycle operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Memory,
    Cpu,
    Disk,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Memory => write!(f, "memory"),
            Dimension::Cpu => write!(f, "cpu"),
            Dimension::Disk => write!(f, "disk"),
        }
    }
}

/// How node load is measured on the selected dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Runtime consumption reported by the hypervisor
    Used,
    /// Resources allocated to guests, regardless of runtime use
    Assigned,
    /// Kernel pressure-stall information (PVE 9+)
    Psi,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Used => write!(f, "used"),
            Mode::Assigned => write!(f, "assigned"),
            Mode::Psi => write!(f, "psi"),
        }
    }
}

/// Pressure-stall readings for one dimension.
///
/// All components are fractions in `[0, 1]`. `spikes` is the peak `full`
/// value over the recent window rather than an average, so short stalls are
/// not flattened away.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PsiTriplet {
    pub some: f64,
    pub full: f64,
    pub spikes: f64,
}

impl PsiTriplet {
    pub fn new(some: f64, full: f64, spikes: f64) -> Self {
        Self { some, full, spikes }
    }

    /// Largest amount by which any component exceeds its threshold.
    /// Negative when every component is below threshold.
    pub fn worst_excess(&self, thresholds: &PsiTriplet) -> f64 {
        let excesses = [
            self.some - thresholds.some,
            self.full - thresholds.full,
            self.spikes - thresholds.spikes,
        ];
        excesses.into_iter().fold(f64::NEG_INFINITY, f64::max)
    }

    /// True when any component exceeds its threshold.
    pub fn is_hot(&self, thresholds: &PsiTriplet) -> bool {
        self.worst_excess(thresholds) > 0.0
    }

    /// Component-wise saturating subtraction, used for virtual application
    /// of a move in psi mode.
    pub fn saturating_sub(&self, other: &PsiTriplet) -> PsiTriplet {
        PsiTriplet {
            some: (self.some - other.some).max(0.0),
            full: (self.full - other.full).max(0.0),
            spikes: (self.spikes - other.spikes).max(0.0),
        }
    }
}

/// Pressure readings across all three dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PsiReadings {
    pub memory: PsiTriplet,
    pub cpu: PsiTriplet,
    pub disk: PsiTriplet,
}

impl PsiReadings {
    pub fn dimension(&self, dim: Dimension) -> &PsiTriplet {
        match dim {
            Dimension::Memory => &self.memory,
            Dimension::Cpu => &self.cpu,
            Dimension::Disk => &self.disk,
        }
    }
}

/// One cluster member.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Stable node name, matching the cluster identity.
    pub name: String,
    /// Major version of the hypervisor running on this node.
    pub pve_major: u32,
    /// Maintenance nodes source moves but never receive them.
    pub maintenance: bool,
    /// CPU capacity in cores.
    pub cpu_total: f64,
    /// Runtime CPU consumption as fraction x cores (additive with guests).
    pub cpu_used: f64,
    /// Cores assigned to guests on this node.
    pub cpu_assigned: f64,
    /// Memory capacity in bytes.
    pub memory_total: u64,
    /// Runtime memory consumption in bytes.
    pub memory_used: u64,
    /// Memory assigned to guests on this node, in bytes.
    pub memory_assigned: u64,
    /// Local disk capacity in bytes.
    pub disk_total: u64,
    /// Local disk consumption in bytes.
    pub disk_used: u64,
    /// Disk assigned to guests on this node, in bytes.
    pub disk_assigned: u64,
    /// Memory headroom in bytes kept free of new assignments.
    pub reserved_memory: u64,
    /// Pressure-stall readings, present on PVE 9+ nodes.
    pub psi: Option<PsiReadings>,
}

impl Node {
    /// Capacity on a dimension, in that dimension's native unit.
    pub fn capacity(&self, dim: Dimension) -> f64 {
        match dim {
            Dimension::Memory => self.memory_total as f64,
            Dimension::Cpu => self.cpu_total,
            Dimension::Disk => self.disk_total as f64,
        }
    }

    /// Load on a dimension for `used` / `assigned` mode, native unit.
    pub fn load(&self, dim: Dimension, mode: Mode) -> f64 {
        match (dim, mode) {
            (Dimension::Memory, Mode::Assigned) => self.memory_assigned as f64,
            (Dimension::Memory, _) => self.memory_used as f64,
            (Dimension::Cpu, Mode::Assigned) => self.cpu_assigned,
            (Dimension::Cpu, _) => self.cpu_used,
            (Dimension::Disk, Mode::Assigned) => self.disk_assigned as f64,
            (Dimension::Disk, _) => self.disk_used as f64,
        }
    }

    /// Load as a percentage of capacity. Zero-capacity nodes report 0.
    pub fn load_percent(&self, dim: Dimension, mode: Mode) -> f64 {
        let capacity = self.capacity(dim);
        if capacity > 0.0 {
            self.load(dim, mode) / capacity * 100.0
        } else {
            0.0
        }
    }

    /// Bytes of memory still assignable before hitting capacity minus the
    /// reserved headroom. Used by the overprovisioning guard.
    pub fn assignable_memory(&self) -> i64 {
        self.memory_total as i64 - self.memory_assigned as i64 - self.reserved_memory as i64
    }
}

/// Disk slot kinds a guest can attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiskSlot {
    IdeDisk,
    Scsi,
    Virtio,
    Sata,
    Nvme,
    Rootfs,
}

/// One disk attachment of a guest.
#[derive(Debug, Clone, PartialEq)]
pub struct GuestDisk {
    pub slot: DiskSlot,
    /// Shared storage can be migrated without copying disk contents.
    pub shared: bool,
}

/// A virtual machine or container.
#[derive(Debug, Clone, PartialEq)]
pub struct Guest {
    /// Cluster-wide unique numeric id.
    pub vmid: u32,
    pub name: String,
    pub kind: GuestKind,
    /// Name of the node currently hosting this guest.
    pub node: String,
    pub running: bool,
    /// Assigned CPU cores.
    pub cpu_cores: u32,
    /// Recent-window mean CPU usage as fraction x cores; 0 when stopped.
    pub cpu_used: f64,
    /// Assigned memory in bytes.
    pub memory_assigned: u64,
    /// Runtime memory consumption in bytes; 0 when stopped.
    pub memory_used: u64,
    /// Assigned disk in bytes.
    pub disk_assigned: u64,
    /// Runtime disk consumption in bytes.
    pub disk_used: u64,
    /// Raw tags as reported by the hypervisor.
    pub tags: Vec<String>,
    /// Owning resource pool, when the pool is named in the configuration.
    pub pool: Option<String>,
    pub disks: Vec<GuestDisk>,
    /// Set while HA or a backup holds a lock on the guest.
    pub locked: bool,
    /// Tag-derived ignore flag; ignored guests are never moved.
    pub ignored: bool,
    /// Pressure-stall readings, present when the hypervisor reports them.
    pub psi: Option<PsiReadings>,
}

impl Guest {
    /// The guest's weight on a dimension under the given mode, in the
    /// dimension's native unit. A stopped guest weighs nothing in `used`
    /// mode on the CPU axis; its `assigned` figures are taken unchanged.
    pub fn weight(&self, dim: Dimension, mode: Mode) -> f64 {
        match (dim, mode) {
            (Dimension::Memory, Mode::Assigned) => self.memory_assigned as f64,
            (Dimension::Memory, _) => self.memory_used as f64,
            (Dimension::Cpu, Mode::Assigned) => self.cpu_cores as f64,
            (Dimension::Cpu, _) => {
                if self.running {
                    self.cpu_used
                } else {
                    0.0
                }
            }
            (Dimension::Disk, Mode::Assigned) => self.disk_assigned as f64,
            (Dimension::Disk, _) => self.disk_used as f64,
        }
    }

    /// True when any attached disk lives on node-local storage.
    pub fn has_local_disks(&self) -> bool {
        self.disks.iter().any(|d| !d.shared)
    }
}

/// Immutable snapshot of the cluster for one balancing cycle.
#[derive(Debug, Clone, Default)]
pub struct Cluster {
    nodes: BTreeMap<String, Node>,
    guests: BTreeMap<u32, Guest>,
}

impl Cluster {
    pub fn new(nodes: Vec<Node>, guests: Vec<Guest>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.name.clone(), n)).collect(),
            guests: guests.into_iter().map(|g| (g.vmid, g)).collect(),
        }
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn guest(&self, vmid: u32) -> Option<&Guest> {
        self.guests.get(&vmid)
    }

    /// Nodes in lexicographic name order (the deterministic tie-break order).
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Guests in ascending vmid order.
    pub fn guests(&self) -> impl Iterator<Item = &Guest> {
        self.guests.values()
    }

    pub fn guests_on<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Guest> + 'a {
        self.guests.values().filter(move |g| g.node == node)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn guest_count(&self) -> usize {
        self.guests.len()
    }

    pub fn contains_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Largest hypervisor major version present in the cluster. Feature
    /// gates use the minimum instead, see [`Cluster::min_pve_major`].
    pub fn max_pve_major(&self) -> u32 {
        self.nodes.values().map(|n| n.pve_major).max().unwrap_or(0)
    }

    /// Smallest hypervisor major version present in the cluster. A feature
    /// requiring version N is only safe when every node runs at least N.
    pub fn min_pve_major(&self) -> u32 {
        self.nodes.values().map(|n| n.pve_major).min().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> Node {
        Node {
            name: name.to_string(),
            pve_major: 8,
            maintenance: false,
            cpu_total: 16.0,
            cpu_used: 4.0,
            cpu_assigned: 12.0,
            memory_total: 64 * GIB,
            memory_used: 32 * GIB,
            memory_assigned: 48 * GIB,
            disk_total: 1000 * GIB,
            disk_used: 200 * GIB,
            disk_assigned: 500 * GIB,
            reserved_memory: 0,
            psi: None,
        }
    }

    fn guest(vmid: u32, node: &str) -> Guest {
        Guest {
            vmid,
            name: format!("guest{vmid}"),
            kind: GuestKind::Vm,
            node: node.to_string(),
            running: true,
            cpu_cores: 4,
            cpu_used: 1.5,
            memory_assigned: 8 * GIB,
            memory_used: 6 * GIB,
            disk_assigned: 32 * GIB,
            disk_used: 10 * GIB,
            tags: vec![],
            pool: None,
            disks: vec![],
            locked: false,
            ignored: false,
            psi: None,
        }
    }

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_node_load_percent() {
        let n = node("node01");
        assert_eq!(n.load_percent(Dimension::Memory, Mode::Used), 50.0);
        assert_eq!(n.load_percent(Dimension::Memory, Mode::Assigned), 75.0);
        assert_eq!(n.load_percent(Dimension::Cpu, Mode::Used), 25.0);
        assert_eq!(n.load_percent(Dimension::Disk, Mode::Used), 20.0);
    }

    #[test]
    fn test_zero_capacity_node_reports_zero_percent() {
        let mut n = node("node01");
        n.memory_total = 0;
        assert_eq!(n.load_percent(Dimension::Memory, Mode::Used), 0.0);
    }

    #[test]
    fn test_assignable_memory_subtracts_reserve() {
        let mut n = node("node01");
        n.reserved_memory = 4 * GIB;
        assert_eq!(n.assignable_memory(), (64 - 48 - 4) as i64 * GIB as i64);
    }

    #[test]
    fn test_stopped_guest_has_zero_cpu_weight() {
        let mut g = guest(100, "node01");
        g.running = false;
        assert_eq!(g.weight(Dimension::Cpu, Mode::Used), 0.0);
        // Assigned figures are unaffected by the running state.
        assert_eq!(g.weight(Dimension::Cpu, Mode::Assigned), 4.0);
        assert_eq!(g.weight(Dimension::Memory, Mode::Assigned), 8.0 * GIB as f64);
    }

    #[test]
    fn test_psi_worst_excess_and_hot() {
        let reading = PsiTriplet::new(0.30, 0.25, 0.10);
        let thresholds = PsiTriplet::new(0.40, 0.20, 0.50);
        assert!((reading.worst_excess(&thresholds) - 0.05).abs() < 1e-9);
        assert!(reading.is_hot(&thresholds));

        let cool = PsiTriplet::new(0.05, 0.01, 0.02);
        assert!(!cool.is_hot(&thresholds));
        assert!(cool.worst_excess(&thresholds) < 0.0);
    }

    #[test]
    fn test_cluster_node_order_is_lexicographic() {
        let cluster = Cluster::new(
            vec![node("node03"), node("node01"), node("node02")],
            vec![guest(101, "node01"), guest(100, "node02")],
        );
        let names: Vec<_> = cluster.nodes().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["node01", "node02", "node03"]);
        let ids: Vec<_> = cluster.guests().map(|g| g.vmid).collect();
        assert_eq!(ids, [100, 101]);
    }

    #[test]
    fn test_guests_on_filters_by_node() {
        let cluster = Cluster::new(
            vec![node("node01"), node("node02")],
            vec![guest(100, "node01"), guest(101, "node02"), guest(102, "node01")],
        );
        let on_one: Vec<_> = cluster.guests_on("node01").map(|g| g.vmid).collect();
        assert_eq!(on_one, [100, 102]);
    }

    #[test]
    fn test_local_disk_detection() {
        let mut g = guest(100, "node01");
        g.disks = vec![
            GuestDisk { slot: DiskSlot::Scsi, shared: true },
            GuestDisk { slot: DiskSlot::Virtio, shared: false },
        ];
        assert!(g.has_local_disks());
        g.disks.retain(|d| d.shared);
        assert!(!g.has_local_disks());
    }

    #[test]
    fn test_min_max_pve_major() {
        let mut old = node("node01");
        old.pve_major = 8;
        let mut new = node("node02");
        new.pve_major = 9;
        let cluster = Cluster::new(vec![old, new], vec![]);
        assert_eq!(cluster.min_pve_major(), 8);
        assert_eq!(cluster.max_pve_major(), 9);
    }
}
