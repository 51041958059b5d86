//! Plan and move types
//!
//! A [`Plan`] is the engine's only output: an ordered list of moves plus
//! the spread figures around it. Moves never depend on each other, so any
//! execution order is safe for the executor.

use serde::Serialize;

use crate::constraints::{Constraints, PlacementWarning};
use crate::inventory::model::{Cluster, Dimension, GuestKind, Mode};

/// Why a move is in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MoveReason {
    /// Spread reduction on the selected dimension.
    Rebalance,
    /// Evacuation from a maintenance node.
    Maintenance,
    /// Pressure relief in psi mode.
    Pressure,
    /// Rule-only move to co-locate an affinity group.
    Affinity,
    /// Rule-only move to separate an anti-affinity group.
    AntiAffinity,
    /// Rule-only move back onto a pinned node.
    Pinning,
}

/// One planned migration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Move {
    #[serde(rename = "id")]
    pub vmid: u32,
    pub kind: GuestKind,
    pub from: String,
    pub to: String,
    /// The guest's weight on the balanced dimension, in native units.
    pub weight: u64,
    pub dimension: Dimension,
    pub reason: MoveReason,
}

/// Ordered set of moves for one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    #[serde(rename = "plan")]
    pub moves: Vec<Move>,
    pub spread_before: f64,
    pub spread_after: f64,
    pub method: Dimension,
    pub mode: Mode,
    #[serde(skip)]
    pub warnings: Vec<PlacementWarning>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// The documented JSON shape, for `--json` output.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("plan serialization cannot fail")
    }

    /// Check the structural invariants every plan must satisfy. Returns
    /// human-readable violations; an empty list means the plan is sound.
    pub fn verify(&self, cluster: &Cluster, constraints: &Constraints) -> Vec<String> {
        let mut problems = Vec::new();
        let mut seen = std::collections::BTreeSet::new();

        for m in &self.moves {
            if !seen.insert(m.vmid) {
                problems.push(format!("guest {} appears in more than one move", m.vmid));
            }
            if m.from == m.to {
                problems.push(format!("guest {}: source equals target '{}'", m.vmid, m.to));
            }
            match cluster.node(&m.to) {
                None => problems.push(format!("guest {}: unknown target '{}'", m.vmid, m.to)),
                Some(node) if node.maintenance => {
                    problems.push(format!(
                        "guest {}: target '{}' is in maintenance",
                        m.vmid, m.to
                    ));
                }
                Some(_) => {}
            }
            if let Some(pin) = constraints.pin(m.vmid) {
                if pin.strict && !pin.nodes.contains(&m.to) {
                    problems.push(format!(
                        "guest {}: target '{}' violates a strict pin",
                        m.vmid, m.to
                    ));
                }
            }
            if let Some(guest) = cluster.guest(m.vmid) {
                if guest.ignored || constraints.is_ignored(m.vmid) {
                    problems.push(format!("guest {} is ignored but planned", m.vmid));
                }
            } else {
                problems.push(format!("move references unknown guest {}", m.vmid));
            }
        }
        problems
    }
}
