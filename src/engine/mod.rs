//! Placement engine
//!
//! Pure function from a cluster snapshot, compiled constraints, and the
//! balancing policy to a [`Plan`]. The engine never performs I/O and never
//! blocks: it iterates a best-fit loop over a virtual load table, accepting
//! only moves that strictly reduce the spread, then runs rule-only
//! enforcement passes when configured to.
//!
//! Move selection is deterministic: largest spread decrease first, then
//! smaller guest weight, then lower vmid; equidistant destinations fall
//! back to the lexicographically lower node name.

pub mod plan;
mod state;

use std::collections::BTreeSet;

use tracing::{debug, error, warn};

use crate::config::BalancingSettings;
use crate::constraints::{Constraints, PlacementWarning};
use crate::inventory::model::{Cluster, Guest, Mode};
use plan::{Move, MoveReason, Plan};
use state::State;

const EPS: f64 = 1e-9;

/// One-cycle planner over immutable inputs.
pub struct Planner<'a> {
    cluster: &'a Cluster,
    constraints: &'a Constraints,
    balancing: &'a BalancingSettings,
    overprovisioning: bool,
}

impl<'a> Planner<'a> {
    pub fn new(
        cluster: &'a Cluster,
        constraints: &'a Constraints,
        balancing: &'a BalancingSettings,
        overprovisioning: bool,
    ) -> Self {
        Self { cluster, constraints, balancing, overprovisioning }
    }

    /// Produce the plan for this cycle. An empty plan is a normal outcome.
    pub fn plan(&self) -> Plan {
        let dim = self.balancing.method;
        let mode = self.balancing.mode;
        let mut state = State::new(self.cluster, dim, mode, self.balancing.psi);
        let spread_before = state.spread();
        let mut moves: Vec<Move> = Vec::new();
        let mut warnings: Vec<PlacementWarning> = self.constraints.warnings().to_vec();

        self.evacuate_maintenance(&mut state, &mut moves, &mut warnings);

        if mode == Mode::Psi {
            // One migration per cycle in psi mode, so the next cycle works
            // on fresh pressure readings.
            if moves.is_empty() {
                self.psi_move(&mut state, &mut moves);
            }
        } else {
            self.reduce_spread(&mut state, &mut moves);
            if self.balancing.enforce_affinity || self.balancing.enforce_pinning {
                self.enforce_rules(&mut state, &mut moves, &mut warnings);
            }
        }

        let plan = Plan {
            moves,
            spread_before,
            spread_after: state.spread(),
            method: dim,
            mode,
            warnings,
        };

        for problem in plan.verify(self.cluster, self.constraints) {
            // A violation here is an engine bug, not an operator problem.
            error!("Plan invariant violated: {problem}");
        }
        plan
    }

    /// Best destination for a hypothetical new guest: the least-loaded
    /// receivable node on the configured dimension and mode.
    pub fn best_node(&self) -> Option<String> {
        let state = State::new(self.cluster, self.balancing.method, self.balancing.mode, self.balancing.psi);
        let mut best: Option<(f64, String)> = None;
        for (name, node) in state.nodes() {
            if node.maintenance {
                continue;
            }
            let score = match (self.balancing.mode, &node.psi, &self.balancing.psi) {
                (Mode::Psi, Some(psi), Some(th)) => psi.worst_excess(th),
                (Mode::Psi, None, _) => f64::NEG_INFINITY,
                _ => node.percent(),
            };
            let better = match &best {
                None => true,
                Some((best_score, _)) => score < best_score - EPS,
            };
            if better {
                best = Some((score, name.clone()));
            }
        }
        best.map(|(_, name)| name)
    }

    // -------------------------------------------------------------------
    // Movability and rule checks
    // -------------------------------------------------------------------

    fn is_movable(&self, guest: &Guest) -> bool {
        !guest.ignored
            && !self.constraints.is_ignored(guest.vmid)
            && !guest.locked
            && self.balancing.balance_types.contains(&guest.kind)
    }

    /// Rule violation a move of `guest` to `to` would introduce, if any.
    fn rule_violation(&self, state: &State, guest: &Guest, to: &str) -> Option<&'static str> {
        for group in self.constraints.anti_affinity_groups_of(guest.vmid) {
            let members = match self.constraints.anti_affinity_members(group) {
                Some(m) => m,
                None => continue,
            };
            if members
                .iter()
                .any(|&m| m != guest.vmid && state.position(m) == Some(to))
            {
                return Some("anti-affinity");
            }
        }

        let from = state.position(guest.vmid);
        for group in self.constraints.affinity_groups_of(guest.vmid) {
            let members = match self.constraints.affinity_members(group) {
                Some(m) if m.len() > 1 => m,
                _ => continue,
            };
            // Breaking up a currently co-located group is a violation;
            // joining co-located members is what affinity wants.
            let colocated = members
                .iter()
                .all(|&m| state.position(m) == from);
            if colocated && Some(to) != from {
                return Some("affinity");
            }
        }
        None
    }

    /// Feasible destinations for a guest, honoring maintenance, the
    /// overprovisioning guard, pins (with preferred-mode fallback), and
    /// the grouping rules unless `relax` allows bending them.
    fn feasible_destinations(
        &self,
        state: &State,
        guest: &Guest,
        from: &str,
        relax: bool,
    ) -> Vec<String> {
        let base_ok = |name: &str| -> bool {
            let node = match state.node(name) {
                Some(n) => n,
                None => return false,
            };
            if name == from || node.maintenance {
                return false;
            }
            if !self.overprovisioning && state.would_overprovision(name, guest.memory_assigned) {
                return false;
            }
            relax || self.rule_violation(state, guest, name).is_none()
        };

        let all: Vec<String> = state
            .nodes()
            .map(|(name, _)| name.clone())
            .filter(|n| base_ok(n))
            .collect();

        match self.constraints.pin(guest.vmid) {
            Some(pin) if !pin.nodes.is_empty() => {
                let pinned: Vec<String> =
                    all.iter().filter(|n| pin.nodes.contains(*n)).cloned().collect();
                if !pinned.is_empty() {
                    pinned
                } else if pin.strict {
                    Vec::new()
                } else {
                    // Preferred pins fall back to any node when no pinned
                    // node is feasible.
                    all
                }
            }
            _ => all,
        }
    }

    // -------------------------------------------------------------------
    // Maintenance evacuation
    // -------------------------------------------------------------------

    /// Guests sitting on maintenance nodes leave first, before any spread
    /// work. Rules may be relaxed here when affinity is not enforced and
    /// the cluster is otherwise balanced.
    fn evacuate_maintenance(
        &self,
        state: &mut State,
        moves: &mut Vec<Move>,
        warnings: &mut Vec<PlacementWarning>,
    ) {
        let evacuees: Vec<&Guest> = self
            .cluster
            .guests()
            .filter(|g| {
                state
                    .position(g.vmid)
                    .and_then(|n| state.node(n))
                    .map(|n| n.maintenance)
                    .unwrap_or(false)
            })
            .collect();

        for guest in evacuees {
            if !self.is_movable(guest) {
                warnings.push(PlacementWarning::guest(
                    guest.vmid,
                    "cannot be evacuated from its maintenance node (ignored, locked, \
                     or excluded by balance_types)",
                ));
                continue;
            }
            let from = state.position(guest.vmid).unwrap_or(&guest.node).to_string();
            let relax = !self.balancing.enforce_affinity
                && state.spread() <= self.balancing.balanciness as f64;

            match self.least_loaded_destination(state, guest, &from, relax) {
                Some(to) => {
                    if let Some(rule) = self.rule_violation(state, guest, &to) {
                        warn!(
                            "Guest {} placed on {} despite an {} rule (relaxed; cluster \
                             otherwise balanced)",
                            guest.vmid, to, rule
                        );
                    }
                    warn!(
                        "Balance may not be perfect: guest {} evacuates maintenance node {}",
                        guest.vmid, from
                    );
                    self.commit(state, moves, guest, &from, &to, MoveReason::Maintenance);
                }
                None => warnings.push(PlacementWarning::guest(
                    guest.vmid,
                    format!("no feasible node to evacuate to from maintenance node '{from}'"),
                )),
            }
        }
    }

    fn least_loaded_destination(
        &self,
        state: &State,
        guest: &Guest,
        from: &str,
        relax: bool,
    ) -> Option<String> {
        self.feasible_destinations(state, guest, from, relax)
            .into_iter()
            .min_by(|a, b| {
                let pa = state.node(a).map(|n| n.percent()).unwrap_or(f64::MAX);
                let pb = state.node(b).map(|n| n.percent()).unwrap_or(f64::MAX);
                pa.partial_cmp(&pb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.cmp(b))
            })
    }

    // -------------------------------------------------------------------
    // Spread reduction (used / assigned modes)
    // -------------------------------------------------------------------

    fn reduce_spread(&self, state: &mut State, moves: &mut Vec<Move>) {
        let balanciness = self.balancing.balanciness as f64;

        if let Some(threshold) = self.balancing.memory_threshold {
            if state.peak_percent() < threshold as f64 {
                debug!(
                    "Peak node load {:.1}% is below the {threshold}% threshold, skipping",
                    state.peak_percent()
                );
                return;
            }
        }

        let iteration_cap = self.cluster.guest_count().max(1) * self.cluster.node_count().max(1);
        for _ in 0..iteration_cap {
            let spread = state.spread();
            if spread <= balanciness {
                debug!("Spread {spread:.2}% within balanciness {balanciness}%, stopping");
                break;
            }
            let Some((guest, to)) = self.best_rebalance_move(state, spread, &moves[..]) else {
                debug!("No strictly improving move left at spread {spread:.2}%");
                break;
            };
            let from = state.position(guest.vmid).unwrap_or(&guest.node).to_string();
            self.commit(state, moves, guest, &from, &to, MoveReason::Rebalance);
        }
    }

    /// The single best move: biggest spread decrease, tie-broken by
    /// smaller weight, then lower vmid; destination ties resolve to the
    /// lower node name through iteration order. Guests already planned
    /// this cycle stay where the earlier pass put them; a plan never
    /// chains a guest through intermediate nodes.
    fn best_rebalance_move(
        &self,
        state: &State,
        spread: f64,
        planned: &[Move],
    ) -> Option<(&'a Guest, String)> {
        let hottest = self.hottest_node(state)?;
        let mut candidates: Vec<&Guest> = self
            .cluster
            .guests()
            .filter(|g| state.position(g.vmid) == Some(hottest.as_str()))
            .filter(|g| self.is_movable(g))
            .filter(|g| planned.iter().all(|m| m.vmid != g.vmid))
            .collect();

        let dim = self.balancing.method;
        let mode = self.balancing.mode;
        if self.balancing.balance_larger_guests_first {
            candidates.sort_by(|a, b| {
                b.weight(dim, mode)
                    .partial_cmp(&a.weight(dim, mode))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.vmid.cmp(&b.vmid))
            });
        } else {
            candidates.sort_by(|a, b| {
                self.constraints
                    .affinity_group_size(b.vmid)
                    .cmp(&self.constraints.affinity_group_size(a.vmid))
                    .then(
                        b.weight(dim, mode)
                            .partial_cmp(&a.weight(dim, mode))
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                    .then(a.vmid.cmp(&b.vmid))
            });
        }

        let mut best: Option<(f64, f64, u32, String, &Guest)> = None;
        for guest in candidates {
            let weight = guest.weight(dim, mode);
            for to in self.feasible_destinations(state, guest, &hottest, false) {
                let next = state.spread_after_move(&hottest, &to, weight);
                if next >= spread - EPS {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some((best_next, best_weight, best_vmid, best_to, _)) => {
                        if next < best_next - EPS {
                            true
                        } else if next > best_next + EPS {
                            false
                        } else if (weight - best_weight).abs() > EPS {
                            weight < *best_weight
                        } else if guest.vmid != *best_vmid {
                            guest.vmid < *best_vmid
                        } else {
                            to < *best_to
                        }
                    }
                };
                if better {
                    best = Some((next, weight, guest.vmid, to, guest));
                }
            }
        }
        best.map(|(_, _, _, to, guest)| (guest, to))
    }

    fn hottest_node(&self, state: &State) -> Option<String> {
        let mut best: Option<(f64, String)> = None;
        for (name, node) in state.nodes() {
            if node.maintenance {
                continue;
            }
            let percent = node.percent();
            if best.as_ref().map(|(p, _)| percent > p + EPS).unwrap_or(true) {
                best = Some((percent, name.clone()));
            }
        }
        best.map(|(_, name)| name)
    }

    // -------------------------------------------------------------------
    // Pressure mode
    // -------------------------------------------------------------------

    /// Pick at most one move: off the node whose pressure most exceeds its
    /// thresholds, choosing the guest whose departure most relieves that
    /// node's worst component, onto the coolest feasible destination.
    fn psi_move(&self, state: &mut State, moves: &mut Vec<Move>) {
        let Some(thresholds) = self.balancing.psi else { return };

        let mut hottest: Option<(f64, String)> = None;
        for (name, node) in state.nodes() {
            if node.maintenance {
                continue;
            }
            let Some(psi) = &node.psi else { continue };
            let excess = psi.worst_excess(&thresholds);
            if excess <= 0.0 {
                continue;
            }
            if hottest.as_ref().map(|(e, _)| excess > e + EPS).unwrap_or(true) {
                hottest = Some((excess, name.clone()));
            }
        }
        let Some((_, hot)) = hottest else {
            debug!("No node exceeds its pressure thresholds");
            return;
        };
        let hot_psi = match state.node(&hot).and_then(|n| n.psi) {
            Some(psi) => psi,
            None => return,
        };

        let mut best: Option<(f64, u32, &Guest, String)> = None;
        for guest in self.cluster.guests() {
            if state.position(guest.vmid) != Some(hot.as_str()) || !self.is_movable(guest) {
                continue;
            }
            let Some(guest_psi) = &guest.psi else { continue };
            let relieved = hot_psi
                .saturating_sub(guest_psi.dimension(self.balancing.method))
                .worst_excess(&thresholds);
            let Some(to) = self.coolest_psi_destination(state, guest, &hot, &thresholds) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((best_relieved, best_vmid, _, _)) => {
                    relieved < best_relieved - EPS
                        || ((relieved - best_relieved).abs() <= EPS && guest.vmid < *best_vmid)
                }
            };
            if better {
                best = Some((relieved, guest.vmid, guest, to));
            }
        }

        if let Some((_, _, guest, to)) = best {
            let from = state.position(guest.vmid).unwrap_or(&guest.node).to_string();
            self.commit(state, moves, guest, &from, &to, MoveReason::Pressure);
        }
    }

    fn coolest_psi_destination(
        &self,
        state: &State,
        guest: &Guest,
        from: &str,
        thresholds: &crate::inventory::model::PsiTriplet,
    ) -> Option<String> {
        self.feasible_destinations(state, guest, from, false)
            .into_iter()
            .min_by(|a, b| {
                let excess = |name: &str| {
                    state
                        .node(name)
                        .and_then(|n| n.psi.as_ref().map(|p| p.worst_excess(thresholds)))
                        .unwrap_or(f64::NEG_INFINITY)
                };
                excess(a)
                    .partial_cmp(&excess(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.cmp(b))
            })
    }

    // -------------------------------------------------------------------
    // Rule enforcement (moves that may worsen the spread)
    // -------------------------------------------------------------------

    fn enforce_rules(
        &self,
        state: &mut State,
        moves: &mut Vec<Move>,
        warnings: &mut Vec<PlacementWarning>,
    ) {
        let mut moved: BTreeSet<u32> = moves.iter().map(|m| m.vmid).collect();

        if self.balancing.enforce_affinity {
            self.enforce_anti_affinity(state, moves, warnings, &mut moved);
            self.enforce_affinity_groups(state, moves, warnings, &mut moved);
        }
        if self.balancing.enforce_pinning {
            self.enforce_pins(state, moves, warnings, &mut moved);
        }
    }

    fn enforce_anti_affinity(
        &self,
        state: &mut State,
        moves: &mut Vec<Move>,
        warnings: &mut Vec<PlacementWarning>,
        moved: &mut BTreeSet<u32>,
    ) {
        let groups: Vec<(String, Vec<u32>)> = self
            .constraints
            .anti_affinity_groups()
            .map(|(g, m)| (g.clone(), m.iter().copied().collect()))
            .collect();

        for (group, members) in groups {
            if members.len() < 2 {
                continue;
            }
            let mut occupied: BTreeSet<String> = BTreeSet::new();
            for vmid in members {
                let Some(guest) = self.cluster.guest(vmid) else { continue };
                let position = state.position(vmid).unwrap_or(&guest.node).to_string();
                if occupied.insert(position.clone()) {
                    continue;
                }
                // Shares a node with an earlier member; find it a new home.
                if !self.is_movable(guest) || moved.contains(&vmid) {
                    warnings.push(PlacementWarning::guest(
                        vmid,
                        format!("violates anti-affinity group '{group}' but cannot be moved"),
                    ));
                    continue;
                }
                let destination = self
                    .feasible_destinations(state, guest, &position, false)
                    .into_iter()
                    .filter(|d| !occupied.contains(d))
                    .min_by(|a, b| {
                        let pa = state.node(a).map(|n| n.percent()).unwrap_or(f64::MAX);
                        let pb = state.node(b).map(|n| n.percent()).unwrap_or(f64::MAX);
                        pa.partial_cmp(&pb)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.cmp(b))
                    });
                match destination {
                    Some(to) => {
                        occupied.insert(to.clone());
                        moved.insert(vmid);
                        self.commit(state, moves, guest, &position, &to, MoveReason::AntiAffinity);
                    }
                    None => warnings.push(PlacementWarning::guest(
                        vmid,
                        format!("no free node left for anti-affinity group '{group}'"),
                    )),
                }
            }
        }
    }

    fn enforce_affinity_groups(
        &self,
        state: &mut State,
        moves: &mut Vec<Move>,
        warnings: &mut Vec<PlacementWarning>,
        moved: &mut BTreeSet<u32>,
    ) {
        let groups: Vec<(String, Vec<u32>)> = self
            .constraints
            .affinity_groups()
            .map(|(g, m)| (g.clone(), m.iter().copied().collect()))
            .collect();

        for (group, members) in groups {
            if members.len() < 2 {
                continue;
            }
            let positions: BTreeSet<String> = members
                .iter()
                .filter_map(|&m| state.position(m).map(str::to_string))
                .collect();
            let already_colocated = positions.len() == 1
                && positions
                    .iter()
                    .next()
                    .and_then(|n| state.node(n))
                    .map(|n| !n.maintenance)
                    .unwrap_or(false);
            if already_colocated {
                continue;
            }

            let Some(target) = self.affinity_target(state, &members) else {
                warnings.push(PlacementWarning::cluster(format!(
                    "no feasible node admits all members of affinity group '{group}'"
                )));
                continue;
            };

            for &vmid in &members {
                let Some(guest) = self.cluster.guest(vmid) else { continue };
                let position = state.position(vmid).unwrap_or(&guest.node).to_string();
                if position == target {
                    continue;
                }
                if !self.is_movable(guest) || moved.contains(&vmid) {
                    warnings.push(PlacementWarning::guest(
                        vmid,
                        format!("cannot join affinity group '{group}' on node '{target}'"),
                    ));
                    continue;
                }
                if self.rule_violation(state, guest, &target) == Some("anti-affinity") {
                    warnings.push(PlacementWarning::guest(
                        vmid,
                        format!(
                            "affinity group '{group}' conflicts with an anti-affinity rule \
                             on node '{target}'"
                        ),
                    ));
                    continue;
                }
                moved.insert(vmid);
                self.commit(state, moves, guest, &position, &target, MoveReason::Affinity);
            }
        }
    }

    /// Node that can host a whole affinity group: non-maintenance, pin-legal
    /// for every member, with room for the members that would join. Prefers
    /// the node already hosting most members, then the lower load.
    fn affinity_target(&self, state: &State, members: &[u32]) -> Option<String> {
        let mut best: Option<(usize, f64, String)> = None;
        for (name, node) in state.nodes() {
            if node.maintenance {
                continue;
            }
            let all_allowed = members.iter().all(|&m| self.constraints.pin_allows(m, name));
            if !all_allowed {
                continue;
            }
            let incoming: u64 = members
                .iter()
                .filter(|&&m| state.position(m) != Some(name.as_str()))
                .filter_map(|&m| self.cluster.guest(m))
                .map(|g| g.memory_assigned)
                .sum();
            if !self.overprovisioning && state.would_overprovision(name, incoming) {
                continue;
            }
            let resident = members
                .iter()
                .filter(|&&m| state.position(m) == Some(name.as_str()))
                .count();
            let percent = node.percent();
            let better = match &best {
                None => true,
                Some((best_resident, best_percent, _)) => {
                    resident > *best_resident
                        || (resident == *best_resident && percent < best_percent - EPS)
                }
            };
            if better {
                best = Some((resident, percent, name.clone()));
            }
        }
        best.map(|(_, _, name)| name)
    }

    fn enforce_pins(
        &self,
        state: &mut State,
        moves: &mut Vec<Move>,
        warnings: &mut Vec<PlacementWarning>,
        moved: &mut BTreeSet<u32>,
    ) {
        for guest in self.cluster.guests() {
            let Some(pin) = self.constraints.pin(guest.vmid) else { continue };
            if pin.nodes.is_empty() {
                continue;
            }
            let position = state.position(guest.vmid).unwrap_or(&guest.node).to_string();
            if pin.nodes.contains(&position) {
                continue;
            }
            if !self.is_movable(guest) || moved.contains(&guest.vmid) {
                continue;
            }
            let destination = self
                .feasible_destinations(state, guest, &position, false)
                .into_iter()
                .filter(|d| pin.nodes.contains(d))
                .min_by(|a, b| {
                    let pa = state.node(a).map(|n| n.percent()).unwrap_or(f64::MAX);
                    let pb = state.node(b).map(|n| n.percent()).unwrap_or(f64::MAX);
                    pa.partial_cmp(&pb)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.cmp(b))
                });
            match destination {
                Some(to) => {
                    moved.insert(guest.vmid);
                    self.commit(state, moves, guest, &position, &to, MoveReason::Pinning);
                }
                None => warnings.push(PlacementWarning::guest(
                    guest.vmid,
                    "none of the pinned nodes can take this guest",
                )),
            }
        }
    }

    // -------------------------------------------------------------------

    fn commit(
        &self,
        state: &mut State,
        moves: &mut Vec<Move>,
        guest: &Guest,
        from: &str,
        to: &str,
        reason: MoveReason,
    ) {
        debug!(
            "Planned move: guest {} ({}) {from} -> {to} [{reason:?}]",
            guest.vmid, guest.name
        );
        moves.push(Move {
            vmid: guest.vmid,
            kind: guest.kind,
            from: from.to_string(),
            to: to.to_string(),
            weight: guest
                .weight(self.balancing.method, self.balancing.mode)
                .round() as u64,
            dimension: self.balancing.method,
            reason,
        });
        state.apply_move(guest, to);
    }
}
