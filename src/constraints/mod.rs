//! Constraint compilation
//!
//! Turns tag-derived and pool-derived rules into an immutable
//! [`Constraints`] artifact with three indexes: guest to groups, guest to
//! pin set, and node to forbidden guests. Compilation also validates rules
//! against the cluster topology; problems that only limit what the engine
//! can do (rather than invalidating the cycle) become
//! [`PlacementWarning`]s.

pub mod tags;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{BalancingSettings, PoolRuleType};
use crate::inventory::model::Cluster;
use tags::Constraint;

/// A rule the engine could not (or may not be able to) satisfy. Warnings
/// never abort a cycle; the plan simply proceeds for everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementWarning {
    /// The affected guest, when the warning is guest-scoped.
    pub vmid: Option<u32>,
    pub message: String,
}

impl PlacementWarning {
    pub fn guest(vmid: u32, message: impl Into<String>) -> Self {
        Self { vmid: Some(vmid), message: message.into() }
    }

    pub fn cluster(message: impl Into<String>) -> Self {
        Self { vmid: None, message: message.into() }
    }
}

/// Allowed target nodes for one guest. An empty set means any node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinSet {
    pub nodes: BTreeSet<String>,
    /// Strict pins fail the move when no pinned node is feasible;
    /// preferred pins fall back to any node.
    pub strict: bool,
}

/// Immutable constraint indexes for one cycle.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    affinity: BTreeMap<String, BTreeSet<u32>>,
    anti_affinity: BTreeMap<String, BTreeSet<u32>>,
    guest_affinity: HashMap<u32, Vec<String>>,
    guest_anti_affinity: HashMap<u32, Vec<String>>,
    pins: HashMap<u32, PinSet>,
    forbidden: HashMap<String, BTreeSet<u32>>,
    extra_ignored: BTreeSet<u32>,
    warnings: Vec<PlacementWarning>,
}

impl Constraints {
    /// Affinity groups the guest belongs to (always at least its singleton
    /// group).
    pub fn affinity_groups_of(&self, vmid: u32) -> &[String] {
        self.guest_affinity.get(&vmid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn anti_affinity_groups_of(&self, vmid: u32) -> &[String] {
        self.guest_anti_affinity
            .get(&vmid)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn affinity_members(&self, group: &str) -> Option<&BTreeSet<u32>> {
        self.affinity.get(group)
    }

    pub fn anti_affinity_members(&self, group: &str) -> Option<&BTreeSet<u32>> {
        self.anti_affinity.get(group)
    }

    /// Affinity groups in deterministic (name) order.
    pub fn affinity_groups(&self) -> impl Iterator<Item = (&String, &BTreeSet<u32>)> {
        self.affinity.iter()
    }

    pub fn anti_affinity_groups(&self) -> impl Iterator<Item = (&String, &BTreeSet<u32>)> {
        self.anti_affinity.iter()
    }

    /// Size of the largest affinity group containing the guest.
    pub fn affinity_group_size(&self, vmid: u32) -> usize {
        self.affinity_groups_of(vmid)
            .iter()
            .filter_map(|g| self.affinity.get(g))
            .map(BTreeSet::len)
            .max()
            .unwrap_or(1)
    }

    pub fn pin(&self, vmid: u32) -> Option<&PinSet> {
        self.pins.get(&vmid)
    }

    /// Whether the guest's pin set admits the node. Preferred-mode
    /// fallback is the engine's call; this answers the raw set question.
    pub fn pin_allows(&self, vmid: u32, node: &str) -> bool {
        match self.pins.get(&vmid) {
            Some(pin) if !pin.nodes.is_empty() => pin.nodes.contains(node),
            _ => true,
        }
    }

    /// Guests that must not land on the node (inverted pin sets).
    pub fn forbidden_on(&self, node: &str) -> Option<&BTreeSet<u32>> {
        self.forbidden.get(node)
    }

    /// Guests parked by constraint validation (on top of tag-ignored ones).
    pub fn is_ignored(&self, vmid: u32) -> bool {
        self.extra_ignored.contains(&vmid)
    }

    pub fn warnings(&self) -> &[PlacementWarning] {
        &self.warnings
    }
}

/// Compile tag and pool rules against the cluster topology.
pub fn compile(cluster: &Cluster, balancing: &BalancingSettings) -> Constraints {
    let mut c = Constraints::default();

    for guest in cluster.guests() {
        let mut pin_nodes: BTreeSet<String> = BTreeSet::new();
        let mut strict = false;

        for constraint in tags::parse_tags(&guest.tags) {
            match constraint {
                // The inventory already folded ignore tags into the guest.
                Constraint::Ignore => {}
                Constraint::Affinity(key) => {
                    join(&mut c.affinity, &mut c.guest_affinity, key, guest.vmid)
                }
                Constraint::AntiAffinity(key) => {
                    join(&mut c.anti_affinity, &mut c.guest_anti_affinity, key, guest.vmid)
                }
                Constraint::Pin(node) => {
                    pin_nodes.insert(node);
                }
            }
        }

        if let Some(pool) = guest.pool.as_deref() {
            if let Some(rule) = balancing.pools.get(pool) {
                let group = format!("pool:{pool}");
                match rule.rule_type {
                    PoolRuleType::Affinity => {
                        join(&mut c.affinity, &mut c.guest_affinity, group, guest.vmid)
                    }
                    PoolRuleType::AntiAffinity => {
                        join(&mut c.anti_affinity, &mut c.guest_anti_affinity, group, guest.vmid)
                    }
                }
                pin_nodes.extend(rule.pin.iter().cloned());
                strict = strict || rule.strict;
            }
        }

        if !pin_nodes.is_empty() {
            validate_pins(&mut c, cluster, balancing, guest.vmid, pin_nodes, strict);
        }
    }

    // Untagged guests get a synthetic one-member group so the engine can
    // treat every guest as exactly one affinity unit.
    for guest in cluster.guests() {
        if c.affinity_groups_of(guest.vmid).is_empty() {
            let group = format!("solo-{}", Uuid::new_v4());
            join(&mut c.affinity, &mut c.guest_affinity, group, guest.vmid);
        }
    }

    build_forbidden_index(&mut c, cluster);
    check_anti_affinity_capacity(&mut c, cluster);

    c
}

fn join(
    groups: &mut BTreeMap<String, BTreeSet<u32>>,
    by_guest: &mut HashMap<u32, Vec<String>>,
    group: String,
    vmid: u32,
) {
    groups.entry(group.clone()).or_default().insert(vmid);
    let list = by_guest.entry(vmid).or_default();
    if !list.contains(&group) {
        list.push(group);
    }
}

/// Drop pinned node names that do not exist in the cluster. Under
/// `enforce_pinning` a guest whose pins all vanished is parked instead of
/// being given an infeasible move.
fn validate_pins(
    c: &mut Constraints,
    cluster: &Cluster,
    balancing: &BalancingSettings,
    vmid: u32,
    pin_nodes: BTreeSet<String>,
    strict: bool,
) {
    let (known, unknown): (BTreeSet<String>, BTreeSet<String>) =
        pin_nodes.into_iter().partition(|n| cluster.contains_node(n));

    for node in &unknown {
        warn!("Guest {vmid} is pinned to unknown node '{node}', dropping the pin");
    }

    if known.is_empty() && !unknown.is_empty() {
        if balancing.enforce_pinning {
            c.warnings.push(PlacementWarning::guest(
                vmid,
                format!(
                    "pinned exclusively to unknown nodes ({}); guest is parked",
                    comma_list(&unknown)
                ),
            ));
            c.extra_ignored.insert(vmid);
        }
        return;
    }

    if !known.is_empty() {
        debug!("Guest {vmid} pinned to {}", comma_list(&known));
        let strict = strict || balancing.enforce_pinning;
        c.pins.insert(vmid, PinSet { nodes: known, strict });
    }
}

fn build_forbidden_index(c: &mut Constraints, cluster: &Cluster) {
    for (vmid, pin) in &c.pins {
        for node in cluster.nodes() {
            if !pin.nodes.contains(&node.name) {
                c.forbidden.entry(node.name.clone()).or_default().insert(*vmid);
            }
        }
    }
}

/// An anti-affinity group larger than the set of eligible nodes cannot be
/// fully satisfied; that is physics, not an error.
fn check_anti_affinity_capacity(c: &mut Constraints, cluster: &Cluster) {
    let eligible = cluster.nodes().filter(|n| !n.maintenance).count();
    let mut warnings = Vec::new();
    for (group, members) in &c.anti_affinity {
        if members.len() > eligible {
            warnings.push(PlacementWarning::cluster(format!(
                "anti-affinity group '{group}' has {} members but only {eligible} \
                 eligible nodes; the rule cannot be fully satisfied",
                members.len()
            )));
        }
    }
    c.warnings.extend(warnings);
}

fn comma_list(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(", ")
}
