//! Cluster inventory
//!
//! Builds the canonical [`Cluster`] snapshot for one balancing cycle. All
//! unit normalization happens here: memory and disk in bytes, CPU as
//! fraction-of-a-core so that guest figures stay additive across nodes.
//! Once built, the snapshot is immutable for the rest of the cycle.

pub mod model;

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::types::RrdSample;
use crate::api::{ApiError, ProxmoxApi};
use crate::config::Settings;
use crate::constraints::tags;
use model::{Cluster, Guest, GuestKind, Mode, Node, PsiReadings, PsiTriplet};

/// Spike detection looks at the most recent samples only; RRD delivers one
/// sample per minute in the hour window.
const SPIKE_WINDOW: usize = 6;

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("API request failed: {0}")]
    Api(#[from] ApiError),

    #[error("guest {vmid} references unknown node '{node}'")]
    UnknownNode { vmid: u32, node: String },

    #[error("duplicate guest id {0}")]
    DuplicateGuest(u32),

    #[error("node '{0}' reports zero capacity")]
    ZeroCapacity(String),

    #[error("pressure balancing requires PVE 9 or newer, cluster reports major version {0}")]
    PsiUnsupported(u32),
}

/// Fetch and normalize the full cluster state.
pub async fn build_cluster(
    api: &dyn ProxmoxApi,
    settings: &Settings,
) -> Result<Cluster, InventoryError> {
    let version = api.version().await?;
    let pve_major = version.major();

    if settings.balancing.mode == Mode::Psi && pve_major < 9 {
        return Err(InventoryError::PsiUnsupported(pve_major));
    }

    let ha_maintenance = fetch_ha_maintenance(api).await?;
    let nodes = fetch_nodes(api, settings, pve_major, &ha_maintenance).await?;
    let pool_of = fetch_pool_membership(api, settings).await?;
    let guests = fetch_guests(api, &nodes, &pool_of).await?;

    validate(&nodes, &guests)?;

    let nodes = backfill_assignments(nodes, &guests);
    info!(
        "Inventory complete: {} nodes, {} guests",
        nodes.len(),
        guests.len()
    );
    Ok(Cluster::new(nodes, guests.into_values().collect()))
}

/// Nodes the HA stack currently reports in maintenance.
async fn fetch_ha_maintenance(api: &dyn ProxmoxApi) -> Result<Vec<String>, InventoryError> {
    let entries = api.ha_status().await?;
    Ok(entries
        .iter()
        .filter(|e| e.in_maintenance())
        .filter_map(|e| e.node.clone())
        .collect())
}

async fn fetch_nodes(
    api: &dyn ProxmoxApi,
    settings: &Settings,
    pve_major: u32,
    ha_maintenance: &[String],
) -> Result<Vec<Node>, InventoryError> {
    let cluster_cfg = &settings.proxmox_cluster;
    let reserves = &settings.balancing.node_resource_reserve;
    let mut nodes = Vec::new();

    for api_node in api.list_nodes().await? {
        if !api_node.is_online() {
            debug!("Skipping node {} (status: {})", api_node.node, api_node.status);
            continue;
        }
        if cluster_cfg.ignore_nodes.contains(&api_node.node) {
            info!("Node {} is ignored, dropping it and its guests", api_node.node);
            continue;
        }

        let maintenance = cluster_cfg.maintenance_nodes.contains(&api_node.node)
            || ha_maintenance.contains(&api_node.node);
        if maintenance {
            info!("Node {} is in maintenance mode", api_node.node);
        }

        let psi = api_node.psi();
        nodes.push(Node {
            name: api_node.node.clone(),
            pve_major,
            maintenance,
            cpu_total: api_node.maxcpu,
            cpu_used: api_node.cpu * api_node.maxcpu,
            cpu_assigned: 0.0,
            memory_total: api_node.maxmem,
            memory_used: api_node.mem,
            memory_assigned: 0,
            disk_total: api_node.maxdisk,
            disk_used: api_node.disk,
            disk_assigned: 0,
            reserved_memory: reserves.memory_bytes(&api_node.node),
            psi,
        });
    }
    Ok(nodes)
}

/// Map vmid to owning pool, for the pools named in the configuration. A
/// missing pool is configuration drift, not a reason to fail the cycle.
async fn fetch_pool_membership(
    api: &dyn ProxmoxApi,
    settings: &Settings,
) -> Result<HashMap<u32, String>, InventoryError> {
    let mut pool_of = HashMap::new();
    for pool in settings.balancing.pools.keys() {
        match api.pool_members(pool).await {
            Ok(members) => {
                for vmid in members {
                    pool_of.insert(vmid, pool.clone());
                }
            }
            Err(e @ ApiError::Api { .. }) => {
                warn!("Pool '{pool}' could not be fetched, skipping its rules: {e}");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(pool_of)
}

async fn fetch_guests(
    api: &dyn ProxmoxApi,
    nodes: &[Node],
    pool_of: &HashMap<u32, String>,
) -> Result<BTreeMap<u32, Guest>, InventoryError> {
    let mut guests: BTreeMap<u32, Guest> = BTreeMap::new();

    for node in nodes {
        for listing in api.list_guests(&node.name).await? {
            let info = listing.info;
            let kind = listing.kind;
            let config = api.guest_config(kind, &node.name, info.vmid).await?;

            let running = info.is_running();
            let cores = config
                .cores
                .unwrap_or_else(|| info.cpus.round() as u32)
                .max(1);

            let (cpu_used, psi) = if running {
                let samples = fetch_rrd_trusted(api, kind, &node.name, info.vmid).await?;
                (mean_cpu(&samples) * cores as f64, guest_psi(&samples))
            } else {
                (0.0, None)
            };

            let tag_list = config.tag_list();
            let ignored = tags::has_ignore_tag(&tag_list);
            if ignored {
                debug!("Guest {} ({}) carries an ignore tag", info.vmid, info.name);
            }

            let guest = Guest {
                vmid: info.vmid,
                name: info.name.clone(),
                kind,
                node: node.name.clone(),
                running,
                cpu_cores: cores,
                cpu_used,
                memory_assigned: info.maxmem,
                memory_used: if running { info.mem } else { 0 },
                disk_assigned: info.maxdisk,
                disk_used: info.disk,
                tags: tag_list,
                pool: pool_of.get(&info.vmid).cloned(),
                disks: config.disks(),
                locked: config.lock.is_some() || info.lock.is_some(),
                ignored,
                psi,
            };

            if guests.insert(guest.vmid, guest).is_some() {
                return Err(InventoryError::DuplicateGuest(info.vmid));
            }
        }
    }
    Ok(guests)
}

/// Fetch RRD samples; a running guest reporting a flat zero mean CPU is
/// re-fetched once before the value is trusted.
async fn fetch_rrd_trusted(
    api: &dyn ProxmoxApi,
    kind: GuestKind,
    node: &str,
    vmid: u32,
) -> Result<Vec<RrdSample>, InventoryError> {
    let samples = api.guest_rrd(kind, node, vmid).await?;
    if mean_cpu(&samples) > 0.0 {
        return Ok(samples);
    }
    debug!("Guest {vmid} reports zero mean CPU while running, re-fetching once");
    Ok(api.guest_rrd(kind, node, vmid).await?)
}

/// Mean of the per-sample CPU fraction over the window.
fn mean_cpu(samples: &[RrdSample]) -> f64 {
    let values: Vec<f64> = samples.iter().filter_map(|s| s.cpu).collect();
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Pressure triplets from the RRD series: averages for `some`/`full`, peak
/// of the recent `full` samples for `spikes`.
fn guest_psi(samples: &[RrdSample]) -> Option<PsiReadings> {
    let any = samples.iter().any(|s| {
        s.pressurecpusome.is_some()
            || s.pressurememorysome.is_some()
            || s.pressureiosome.is_some()
    });
    if !any {
        return None;
    }

    let triplet = |some: fn(&RrdSample) -> Option<f64>, full: fn(&RrdSample) -> Option<f64>| {
        let fulls: Vec<f64> = samples.iter().filter_map(full).collect();
        let spikes = fulls
            .iter()
            .rev()
            .take(SPIKE_WINDOW)
            .cloned()
            .fold(0.0, f64::max);
        PsiTriplet::new(mean_of(samples, some), mean_of(samples, full), spikes)
    };

    Some(PsiReadings {
        cpu: triplet(|s| s.pressurecpusome, |s| s.pressurecpufull),
        memory: triplet(|s| s.pressurememorysome, |s| s.pressurememoryfull),
        disk: triplet(|s| s.pressureiosome, |s| s.pressureiofull),
    })
}

fn mean_of(samples: &[RrdSample], field: fn(&RrdSample) -> Option<f64>) -> f64 {
    let values: Vec<f64> = samples.iter().filter_map(field).collect();
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn validate(nodes: &[Node], guests: &BTreeMap<u32, Guest>) -> Result<(), InventoryError> {
    for node in nodes {
        if node.memory_total == 0 || node.cpu_total <= 0.0 {
            return Err(InventoryError::ZeroCapacity(node.name.clone()));
        }
    }
    for guest in guests.values() {
        if !nodes.iter().any(|n| n.name == guest.node) {
            return Err(InventoryError::UnknownNode {
                vmid: guest.vmid,
                node: guest.node.clone(),
            });
        }
    }
    Ok(())
}

/// Sum guest assignments onto their nodes; used figures stay as the API
/// reported them.
fn backfill_assignments(mut nodes: Vec<Node>, guests: &BTreeMap<u32, Guest>) -> Vec<Node> {
    for guest in guests.values() {
        if let Some(node) = nodes.iter_mut().find(|n| n.name == guest.node) {
            node.cpu_assigned += guest.cpu_cores as f64;
            node.memory_assigned += guest.memory_assigned;
            node.disk_assigned += guest.disk_assigned;
        }
    }
    nodes
}
