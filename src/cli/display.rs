//! Human-readable rendering of plans and outcomes
//!
//! JSON output comes straight from [`Plan::to_json`]; this module covers
//! the text side: the plan listing for dry runs, per-move outcomes, and
//! the per-node usage summary that bookends each cycle in the log.

use std::collections::HashMap;

use crate::engine::plan::Plan;
use crate::executor::{MoveOutcome, MoveResult};
use crate::inventory::model::{Cluster, Dimension, Mode};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Render a plan as text, one line per move.
pub fn format_plan(plan: &Plan) -> String {
    let mut out = format!(
        "Balancing plan ({} / {}): spread {:.2}% -> {:.2}%\n",
        plan.method, plan.mode, plan.spread_before, plan.spread_after
    );
    if plan.is_empty() {
        out.push_str("  nothing to do\n");
        return out;
    }
    for m in &plan.moves {
        out.push_str(&format!(
            "  {} {}: {} -> {} ({}, {:?})\n",
            m.kind,
            m.vmid,
            m.from,
            m.to,
            format_weight(m.weight, m.dimension),
            m.reason,
        ));
    }
    out
}

/// Render executor outcomes, one line per move.
pub fn format_results(results: &[MoveResult]) -> String {
    let mut out = String::new();
    for r in results {
        let status = match &r.outcome {
            MoveOutcome::Succeeded => "ok".to_string(),
            MoveOutcome::Failed(e) => format!("failed: {e}"),
            MoveOutcome::TimedOut => "failed: timeout".to_string(),
            MoveOutcome::Cancelled => "cancelled".to_string(),
            MoveOutcome::Skipped(reason) => format!("skipped: {reason}"),
        };
        out.push_str(&format!("  guest {}: {status}\n", r.vmid));
    }
    out
}

fn format_weight(weight: u64, dimension: Dimension) -> String {
    match dimension {
        Dimension::Cpu => format!("{weight} cores"),
        Dimension::Memory | Dimension::Disk => {
            format!("{:.1} GiB", weight as f64 / GIB)
        }
    }
}

/// One summary line per dimension with each node's used percentage, e.g.
/// `memory: pve01: 62.50% | pve02: 31.25%`. When a plan is given, its
/// moves are applied to the used figures first, so the caller can log the
/// post-plan picture next to the pre-plan one.
pub fn node_metrics_lines(cluster: &Cluster, plan: Option<&Plan>) -> Vec<String> {
    let mut shifted: HashMap<(&str, Dimension), f64> = HashMap::new();
    if let Some(plan) = plan {
        for m in &plan.moves {
            let Some(guest) = cluster.guest(m.vmid) else { continue };
            for dim in [Dimension::Memory, Dimension::Cpu, Dimension::Disk] {
                let w = guest.weight(dim, Mode::Used);
                *shifted.entry((m.from.as_str(), dim)).or_default() -= w;
                *shifted.entry((m.to.as_str(), dim)).or_default() += w;
            }
        }
    }

    [Dimension::Memory, Dimension::Cpu, Dimension::Disk]
        .into_iter()
        .map(|dim| {
            let nodes = cluster
                .nodes()
                .map(|n| {
                    let load = n.load(dim, Mode::Used)
                        + shifted.get(&(n.name.as_str(), dim)).copied().unwrap_or(0.0);
                    let percent = if n.capacity(dim) > 0.0 {
                        load / n.capacity(dim) * 100.0
                    } else {
                        0.0
                    };
                    format!("{}: {:.2}%", n.name, percent)
                })
                .collect::<Vec<_>>()
                .join(" | ");
            format!("{dim}: {nodes}")
        })
        .collect()
}
