//! Configuration model
//!
//! Mirrors the recognized YAML surface one to one. Unknown keys are rejected
//! by serde so a typo in an option name fails startup instead of silently
//! running with a default. Cross-field rules live in
//! [`validation`](super::validation).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::inventory::model::{Dimension, GuestKind, Mode, PsiTriplet};

const GIB: u64 = 1024 * 1024 * 1024;

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub proxmox_api: ProxmoxApiSettings,

    #[serde(default)]
    pub proxmox_cluster: ProxmoxClusterSettings,

    #[serde(default)]
    pub balancing: BalancingSettings,

    #[serde(default)]
    pub service: ServiceSettings,
}

impl Settings {
    /// Blank out credentials once the API client holds them, so a later
    /// debug dump of the configuration cannot leak secrets.
    pub fn mask_credentials(&mut self) {
        if self.proxmox_api.pass.is_some() {
            self.proxmox_api.pass = Some("********".to_string());
        }
        if self.proxmox_api.token_secret.is_some() {
            self.proxmox_api.token_secret = Some("********".to_string());
        }
    }
}

/// Connection settings for the Proxmox REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxmoxApiSettings {
    /// API endpoints as `host[:port]`; IPv6 may be bracketed. Port defaults
    /// to 8006. The first endpoint that answers a probe is used.
    pub hosts: Vec<String>,

    /// API user, e.g. `proxlb@pve`.
    pub user: String,

    /// Password credential. Ignored when a token is also configured.
    #[serde(default)]
    pub pass: Option<String>,

    /// Token name (the part after `!` in a full Proxmox token id).
    #[serde(default)]
    pub token_id: Option<String>,

    /// Secret belonging to `token_id`.
    #[serde(default)]
    pub token_secret: Option<String>,

    #[serde(default = "default_true")]
    pub ssl_verification: bool,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Connection attempts before a read fails the cycle.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Seconds between connection attempts.
    #[serde(default = "default_wait_time")]
    pub wait_time: u64,
}

/// Cluster-scoped behavior toggles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxmoxClusterSettings {
    /// Nodes that source moves but never receive them.
    #[serde(default)]
    pub maintenance_nodes: Vec<String>,

    /// Nodes removed from the cluster view entirely, guests included.
    #[serde(default)]
    pub ignore_nodes: Vec<String>,

    /// Allow assigned memory to exceed node capacity on move targets.
    #[serde(default)]
    pub overprovisioning: bool,
}

/// Balancing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BalancingSettings {
    #[serde(default = "default_true")]
    pub enable: bool,

    /// The dimension to balance.
    #[serde(default = "default_method")]
    pub method: Dimension,

    /// How load on the dimension is measured.
    #[serde(default = "default_mode")]
    pub mode: Mode,

    /// Maximum tolerated spread (max - min node load) in percent of
    /// capacity before moves are produced.
    #[serde(default = "default_balanciness")]
    pub balanciness: u32,

    /// Skip the cycle entirely while the peak node stays below this percent
    /// on the selected dimension.
    #[serde(default)]
    pub memory_threshold: Option<u32>,

    /// Guest kinds eligible for balancing.
    #[serde(default = "default_balance_types")]
    pub balance_types: Vec<GuestKind>,

    /// Move heavy guests first (fewer migrations) instead of grouping by
    /// affinity size first.
    #[serde(default = "default_true")]
    pub balance_larger_guests_first: bool,

    /// Perform rule-only moves when affinity rules are violated even though
    /// the spread is fine.
    #[serde(default)]
    pub enforce_affinity: bool,

    /// Treat unsatisfiable pins as hard: affected guests are parked instead
    /// of moved somewhere illegal.
    #[serde(default)]
    pub enforce_pinning: bool,

    /// Run migrations concurrently instead of one at a time.
    #[serde(default)]
    pub parallel: bool,

    /// Upper bound on concurrently running migrations.
    #[serde(default = "default_parallel_jobs")]
    pub parallel_jobs: usize,

    /// Live-migrate running VMs.
    #[serde(default = "default_true")]
    pub live: bool,

    /// Pass `with-local-disks` on VM migrations.
    #[serde(default = "default_true")]
    pub with_local_disks: bool,

    /// Pass `with-conntrack-state` on VM migrations (PVE 9+).
    #[serde(default = "default_true")]
    pub with_conntrack_state: bool,

    /// Ceiling in seconds for watching a single migration job.
    #[serde(default = "default_max_job_validation")]
    pub max_job_validation: u64,

    /// Per-node memory headroom kept free of new assignments.
    #[serde(default)]
    pub node_resource_reserve: ResourceReserves,

    /// Pool-level affinity / anti-affinity rules.
    #[serde(default)]
    pub pools: HashMap<String, PoolRule>,

    /// Pressure thresholds; required when `mode` is `psi`.
    #[serde(default)]
    pub psi: Option<PsiTriplet>,
}

impl Default for BalancingSettings {
    fn default() -> Self {
        Self {
            enable: true,
            method: default_method(),
            mode: default_mode(),
            balanciness: default_balanciness(),
            memory_threshold: None,
            balance_types: default_balance_types(),
            balance_larger_guests_first: true,
            enforce_affinity: false,
            enforce_pinning: false,
            parallel: false,
            parallel_jobs: default_parallel_jobs(),
            live: true,
            with_local_disks: true,
            with_conntrack_state: true,
            max_job_validation: default_max_job_validation(),
            node_resource_reserve: ResourceReserves::default(),
            pools: HashMap::new(),
            psi: None,
        }
    }
}

/// Reserved headroom, keyed by node name with a `defaults` fallback.
///
/// `deny_unknown_fields` cannot apply here: every non-`defaults` key is a
/// node name by definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceReserves {
    #[serde(default)]
    pub defaults: Option<ReserveSpec>,

    #[serde(flatten)]
    pub nodes: HashMap<String, ReserveSpec>,
}

impl ResourceReserves {
    /// Reserved memory for a node in bytes, falling back to `defaults`.
    pub fn memory_bytes(&self, node: &str) -> u64 {
        self.nodes
            .get(node)
            .or(self.defaults.as_ref())
            .map(|r| r.memory * GIB)
            .unwrap_or(0)
    }
}

/// Reserve amounts for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReserveSpec {
    /// Memory headroom in GiB.
    #[serde(default)]
    pub memory: u64,
}

/// A pool-level grouping rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolRule {
    #[serde(rename = "type")]
    pub rule_type: PoolRuleType,

    /// Nodes every member of the pool is pinned to.
    #[serde(default)]
    pub pin: Vec<String>,

    /// Strict pins fail the move rather than fall back to any node.
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolRuleType {
    Affinity,
    AntiAffinity,
}

/// Service-level run behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSettings {
    /// Keep running and re-balance on a schedule; off means one-shot.
    #[serde(default = "default_true")]
    pub daemon: bool,

    #[serde(default)]
    pub schedule: Schedule,

    #[serde(default)]
    pub delay: Option<Delay>,

    #[serde(default)]
    pub log_level: LogLevel,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            daemon: true,
            schedule: Schedule::default(),
            delay: None,
            log_level: LogLevel::default(),
        }
    }
}

/// Interval between daemon cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Schedule {
    pub interval: u64,
    #[serde(default)]
    pub format: ScheduleFormat,
}

impl Default for Schedule {
    fn default() -> Self {
        Self { interval: 24, format: ScheduleFormat::Hours }
    }
}

impl Schedule {
    pub fn as_secs(&self) -> u64 {
        match self.format {
            ScheduleFormat::Hours => self.interval * 3600,
            ScheduleFormat::Minutes => self.interval * 60,
        }
    }
}

/// Optional startup delay before the first cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Delay {
    #[serde(default)]
    pub enable: bool,
    pub time: u64,
    #[serde(default)]
    pub format: ScheduleFormat,
}

impl Delay {
    pub fn as_secs(&self) -> u64 {
        match self.format {
            ScheduleFormat::Hours => self.time * 3600,
            ScheduleFormat::Minutes => self.time * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleFormat {
    #[default]
    Hours,
    Minutes,
}

/// Log verbosity, mapped onto tracing levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Critical,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Critical => "error",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    10
}

fn default_retries() -> u32 {
    1
}

fn default_wait_time() -> u64 {
    1
}

fn default_method() -> Dimension {
    Dimension::Memory
}

fn default_mode() -> Mode {
    Mode::Used
}

fn default_balanciness() -> u32 {
    10
}

fn default_balance_types() -> Vec<GuestKind> {
    vec![GuestKind::Vm, GuestKind::Ct]
}

fn default_parallel_jobs() -> usize {
    5
}

fn default_max_job_validation() -> u64 {
    1800
}
