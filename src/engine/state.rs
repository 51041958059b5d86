//! Virtual load table
//!
//! The engine never mutates the [`Cluster`] snapshot. It works on this
//! table instead, applying candidate moves virtually and measuring the
//! spread that would result. Loads are kept in the dimension's native unit;
//! spread is always expressed in percent of node capacity.

use std::collections::{BTreeMap, HashMap};

use crate::inventory::model::{Cluster, Dimension, Guest, Mode, PsiTriplet};

#[derive(Debug, Clone)]
pub(crate) struct NodeState {
    pub maintenance: bool,
    pub capacity: f64,
    pub load: f64,
    pub memory_assigned: i64,
    /// Memory capacity minus the reserved headroom.
    pub memory_limit: i64,
    /// Pressure on the selected dimension, when the node reports it.
    pub psi: Option<PsiTriplet>,
}

impl NodeState {
    pub fn percent(&self) -> f64 {
        if self.capacity > 0.0 {
            self.load / self.capacity * 100.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct State {
    dim: Dimension,
    mode: Mode,
    thresholds: Option<PsiTriplet>,
    nodes: BTreeMap<String, NodeState>,
    positions: HashMap<u32, String>,
}

impl State {
    pub fn new(
        cluster: &Cluster,
        dim: Dimension,
        mode: Mode,
        thresholds: Option<PsiTriplet>,
    ) -> Self {
        let nodes = cluster
            .nodes()
            .map(|n| {
                (
                    n.name.clone(),
                    NodeState {
                        maintenance: n.maintenance,
                        capacity: n.capacity(dim),
                        load: n.load(dim, mode),
                        memory_assigned: n.memory_assigned as i64,
                        memory_limit: n.memory_total as i64 - n.reserved_memory as i64,
                        psi: n.psi.as_ref().map(|p| *p.dimension(dim)),
                    },
                )
            })
            .collect();
        let positions = cluster.guests().map(|g| (g.vmid, g.node.clone())).collect();
        Self { dim, mode, thresholds, nodes, positions }
    }

    pub fn node(&self, name: &str) -> Option<&NodeState> {
        self.nodes.get(name)
    }

    /// Nodes in lexicographic name order.
    pub fn nodes(&self) -> impl Iterator<Item = (&String, &NodeState)> {
        self.nodes.iter()
    }

    /// The node a guest currently sits on, virtual moves included.
    pub fn position(&self, vmid: u32) -> Option<&str> {
        self.positions.get(&vmid).map(String::as_str)
    }

    /// Current spread in percent of capacity across receivable nodes.
    /// Maintenance nodes are draining and excluded from the figure. In psi
    /// mode this is the worst threshold excess across nodes, also in
    /// percentage points.
    pub fn spread(&self) -> f64 {
        if self.mode == Mode::Psi {
            return self.psi_spread();
        }
        let percents: Vec<f64> = self
            .nodes
            .values()
            .filter(|n| !n.maintenance)
            .map(NodeState::percent)
            .collect();
        match (
            percents.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            percents.iter().cloned().fold(f64::INFINITY, f64::min),
        ) {
            (max, min) if max.is_finite() && min.is_finite() => max - min,
            _ => 0.0,
        }
    }

    fn psi_spread(&self) -> f64 {
        let thresholds = match &self.thresholds {
            Some(t) => t,
            None => return 0.0,
        };
        self.nodes
            .values()
            .filter(|n| !n.maintenance)
            .filter_map(|n| n.psi.as_ref())
            .map(|p| p.worst_excess(thresholds).max(0.0))
            .fold(0.0, f64::max)
            * 100.0
    }

    /// Highest node load in percent (receivable nodes).
    pub fn peak_percent(&self) -> f64 {
        self.nodes
            .values()
            .filter(|n| !n.maintenance)
            .map(NodeState::percent)
            .fold(0.0, f64::max)
    }

    /// Spread that would result from moving `weight` from one node to
    /// another, without committing the move.
    pub fn spread_after_move(&self, from: &str, to: &str, weight: f64) -> f64 {
        let percents = self.nodes.iter().filter(|(_, n)| !n.maintenance).map(|(name, n)| {
            let load = if name == from {
                n.load - weight
            } else if name == to {
                n.load + weight
            } else {
                n.load
            };
            if n.capacity > 0.0 {
                load / n.capacity * 100.0
            } else {
                0.0
            }
        });
        let (mut max, mut min) = (f64::NEG_INFINITY, f64::INFINITY);
        for p in percents {
            max = max.max(p);
            min = min.min(p);
        }
        if max.is_finite() && min.is_finite() {
            max - min
        } else {
            0.0
        }
    }

    /// True when placing the guest's assigned memory on the node would
    /// break its capacity-minus-reserve limit.
    pub fn would_overprovision(&self, to: &str, guest_memory: u64) -> bool {
        match self.nodes.get(to) {
            Some(n) => n.memory_assigned + guest_memory as i64 > n.memory_limit,
            None => true,
        }
    }

    /// Commit a move to the table.
    pub fn apply_move(&mut self, guest: &Guest, to: &str) {
        let weight = guest.weight(self.dim, self.mode);
        let from = match self.positions.get(&guest.vmid) {
            Some(node) => node.clone(),
            None => return,
        };

        if let Some(node) = self.nodes.get_mut(&from) {
            node.load -= weight;
            node.memory_assigned -= guest.memory_assigned as i64;
            if let (Some(node_psi), Some(guest_psi)) = (&mut node.psi, &guest.psi) {
                *node_psi = node_psi.saturating_sub(guest_psi.dimension(self.dim));
            }
        }
        if let Some(node) = self.nodes.get_mut(to) {
            node.load += weight;
            node.memory_assigned += guest.memory_assigned as i64;
            if let (Some(node_psi), Some(guest_psi)) = (&mut node.psi, &guest.psi) {
                let g = guest_psi.dimension(self.dim);
                node_psi.some += g.some;
                node_psi.full += g.full;
                node_psi.spikes += g.spikes;
            }
        }
        self.positions.insert(guest.vmid, to.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::model::{GuestKind, Node};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn node(name: &str, used_gib: u64) -> Node {
        Node {
            name: name.to_string(),
            pve_major: 8,
            maintenance: false,
            cpu_total: 16.0,
            cpu_used: 2.0,
            cpu_assigned: 8.0,
            memory_total: 64 * GIB,
            memory_used: used_gib * GIB,
            memory_assigned: used_gib * GIB,
            disk_total: 1000 * GIB,
            disk_used: 100 * GIB,
            disk_assigned: 200 * GIB,
            reserved_memory: 0,
            psi: None,
        }
    }

    fn guest(vmid: u32, on: &str, used_gib: u64) -> Guest {
        Guest {
            vmid,
            name: format!("guest{vmid}"),
            kind: GuestKind::Vm,
            node: on.to_string(),
            running: true,
            cpu_cores: 2,
            cpu_used: 0.5,
            memory_assigned: used_gib * GIB,
            memory_used: used_gib * GIB,
            disk_assigned: 16 * GIB,
            disk_used: 4 * GIB,
            tags: vec![],
            pool: None,
            disks: vec![],
            locked: false,
            ignored: false,
            psi: None,
        }
    }

    #[test]
    fn test_spread_in_percent() {
        let cluster = Cluster::new(vec![node("a", 40), node("b", 8)], vec![]);
        let state = State::new(&cluster, Dimension::Memory, Mode::Used, None);
        // 40/64 = 62.5%, 8/64 = 12.5%
        assert!((state.spread() - 50.0).abs() < 1e-9);
        assert!((state.peak_percent() - 62.5).abs() < 1e-9);
    }

    #[test]
    fn test_maintenance_excluded_from_spread() {
        let mut drained = node("c", 0);
        drained.maintenance = true;
        let cluster = Cluster::new(vec![node("a", 40), node("b", 40), drained], vec![]);
        let state = State::new(&cluster, Dimension::Memory, Mode::Used, None);
        assert_eq!(state.spread(), 0.0);
    }

    #[test]
    fn test_spread_after_move_matches_apply() {
        let g = guest(100, "a", 16);
        let cluster =
            Cluster::new(vec![node("a", 40), node("b", 8)], vec![g.clone()]);
        let mut state = State::new(&cluster, Dimension::Memory, Mode::Used, None);

        let predicted = state.spread_after_move("a", "b", g.weight(Dimension::Memory, Mode::Used));
        state.apply_move(&g, "b");
        assert!((state.spread() - predicted).abs() < 1e-9);
        assert_eq!(state.position(100), Some("b"));
    }

    #[test]
    fn test_overprovision_check() {
        let mut b = node("b", 50);
        b.reserved_memory = 4 * GIB;
        let cluster = Cluster::new(vec![node("a", 60), b], vec![]);
        let state = State::new(&cluster, Dimension::Memory, Mode::Assigned, None);

        // limit = 64 - 4 = 60, assigned 50: 10 GiB fits exactly.
        assert!(!state.would_overprovision("b", 10 * GIB));
        assert!(state.would_overprovision("b", 11 * GIB));
    }

    #[test]
    fn test_psi_spread_uses_worst_excess() {
        let mut hot = node("a", 10);
        hot.psi = Some(crate::inventory::model::PsiReadings {
            memory: PsiTriplet::new(0.1, 0.35, 0.1),
            ..Default::default()
        });
        let cool = node("b", 10);
        let cluster = Cluster::new(vec![hot, cool], vec![]);
        let thresholds = PsiTriplet::new(0.5, 0.20, 0.5);
        let state = State::new(&cluster, Dimension::Memory, Mode::Psi, Some(thresholds));
        // worst excess 0.15 -> 15 percentage points
        assert!((state.spread() - 15.0).abs() < 1e-9);
    }
}
