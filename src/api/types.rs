//! Wire types for the Proxmox REST API
//!
//! The API is loose with numbers: fields documented as integers show up as
//! strings depending on the endpoint and version. Coercion happens here, at
//! the boundary, through the `coerce` deserializers; everything downstream
//! of this module works with strict types.

use std::collections::HashMap;

use serde::Deserialize;

use crate::inventory::model::{DiskSlot, GuestDisk, PsiReadings, PsiTriplet};

/// Every JSON API response wraps its payload in a `data` field.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// Deserializers accepting a number or its string spelling.
pub(crate) mod coerce {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Str(String),
    }

    fn to_f64<E: serde::de::Error>(raw: Raw) -> Result<f64, E> {
        match raw {
            Raw::Num(n) => Ok(n),
            Raw::Str(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| E::custom(format!("'{s}' is not a number"))),
        }
    }

    pub fn f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        to_f64(Raw::deserialize(d)?)
    }

    pub fn u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let value = to_f64::<D::Error>(Raw::deserialize(d)?)?;
        if value < 0.0 {
            return Err(serde::de::Error::custom(format!("negative value {value}")));
        }
        Ok(value as u64)
    }

    pub fn u32<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        u64(d).map(|v| v as u32)
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Option::<Raw>::deserialize(d)?.map(to_f64::<D::Error>).transpose()
    }

    pub fn opt_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        Ok(opt_f64(d)?.map(|v| v.max(0.0) as u64))
    }

    pub fn opt_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        Ok(opt_u64(d)?.map(|v| v as u32))
    }
}

/// Version information from `GET /version`.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub release: Option<String>,
}

impl VersionInfo {
    /// Major version, 0 when unparseable.
    pub fn major(&self) -> u32 {
        self.version
            .split('.')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

/// One entry of `GET /nodes`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiNode {
    pub node: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "coerce::f64")]
    pub maxcpu: f64,
    #[serde(default, deserialize_with = "coerce::f64")]
    pub cpu: f64,
    #[serde(default, deserialize_with = "coerce::u64")]
    pub maxmem: u64,
    #[serde(default, deserialize_with = "coerce::u64")]
    pub mem: u64,
    #[serde(default, deserialize_with = "coerce::u64")]
    pub maxdisk: u64,
    #[serde(default, deserialize_with = "coerce::u64")]
    pub disk: u64,

    // Pressure-stall fields, reported by PVE 9+ nodes.
    #[serde(default, deserialize_with = "coerce::opt_f64")]
    pub pressurecpusome: Option<f64>,
    #[serde(default, deserialize_with = "coerce::opt_f64")]
    pub pressurecpufull: Option<f64>,
    #[serde(default, deserialize_with = "coerce::opt_f64")]
    pub pressurecpufullspikes: Option<f64>,
    #[serde(default, deserialize_with = "coerce::opt_f64")]
    pub pressurememorysome: Option<f64>,
    #[serde(default, deserialize_with = "coerce::opt_f64")]
    pub pressurememoryfull: Option<f64>,
    #[serde(default, deserialize_with = "coerce::opt_f64")]
    pub pressurememoryfullspikes: Option<f64>,
    #[serde(default, deserialize_with = "coerce::opt_f64")]
    pub pressureiosome: Option<f64>,
    #[serde(default, deserialize_with = "coerce::opt_f64")]
    pub pressureiofull: Option<f64>,
    #[serde(default, deserialize_with = "coerce::opt_f64")]
    pub pressureiofullspikes: Option<f64>,
}

impl ApiNode {
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }

    /// Pressure readings when the node reports any, `None` on older nodes.
    pub fn psi(&self) -> Option<PsiReadings> {
        let any = self.pressurecpusome.is_some()
            || self.pressurememorysome.is_some()
            || self.pressureiosome.is_some();
        if !any {
            return None;
        }
        Some(PsiReadings {
            cpu: PsiTriplet::new(
                self.pressurecpusome.unwrap_or(0.0),
                self.pressurecpufull.unwrap_or(0.0),
                self.pressurecpufullspikes.unwrap_or(0.0),
            ),
            memory: PsiTriplet::new(
                self.pressurememorysome.unwrap_or(0.0),
                self.pressurememoryfull.unwrap_or(0.0),
                self.pressurememoryfullspikes.unwrap_or(0.0),
            ),
            disk: PsiTriplet::new(
                self.pressureiosome.unwrap_or(0.0),
                self.pressureiofull.unwrap_or(0.0),
                self.pressureiofullspikes.unwrap_or(0.0),
            ),
        })
    }
}

/// One entry of `GET /nodes/{node}/qemu` or `.../lxc`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiGuest {
    #[serde(deserialize_with = "coerce::u32")]
    pub vmid: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "coerce::f64")]
    pub cpus: f64,
    #[serde(default, deserialize_with = "coerce::u64")]
    pub maxmem: u64,
    #[serde(default, deserialize_with = "coerce::u64")]
    pub mem: u64,
    #[serde(default, deserialize_with = "coerce::u64")]
    pub maxdisk: u64,
    #[serde(default, deserialize_with = "coerce::u64")]
    pub disk: u64,
    #[serde(default)]
    pub lock: Option<String>,
}

impl ApiGuest {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Guest configuration from `GET .../{vmid}/config`.
///
/// Disk attachments live under slot-named keys (`scsi0`, `virtio2`,
/// `rootfs`, ...), so everything not explicitly modeled is kept in `extra`
/// and picked apart by [`GuestConfig::disks`].
#[derive(Debug, Clone, Deserialize)]
pub struct GuestConfig {
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub lock: Option<String>,
    #[serde(default, deserialize_with = "coerce::opt_u32")]
    pub cores: Option<u32>,
    /// Assigned memory in MiB.
    #[serde(default, deserialize_with = "coerce::opt_u64")]
    pub memory: Option<u64>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl GuestConfig {
    /// Tags split on the hypervisor's `;`/`,` delimiters, empty entries
    /// dropped.
    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .as_deref()
            .unwrap_or("")
            .split([';', ','])
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Disk attachments parsed out of the slot-named config keys.
    /// CD-ROM drives are not disks and are skipped.
    pub fn disks(&self) -> Vec<GuestDisk> {
        let mut disks = Vec::new();
        for (key, value) in &self.extra {
            let Some(slot) = disk_slot(key) else { continue };
            let Some(spec) = value.as_str() else { continue };
            if spec.contains("media=cdrom") {
                continue;
            }
            disks.push(GuestDisk { slot, shared: spec.contains("shared=1") });
        }
        disks
    }
}

fn disk_slot(key: &str) -> Option<DiskSlot> {
    if key == "rootfs" {
        return Some(DiskSlot::Rootfs);
    }
    for (prefix, slot) in [
        ("virtio", DiskSlot::Virtio),
        ("scsi", DiskSlot::Scsi),
        ("sata", DiskSlot::Sata),
        ("nvme", DiskSlot::Nvme),
        ("ide", DiskSlot::IdeDisk),
    ] {
        if let Some(rest) = key.strip_prefix(prefix) {
            if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
                return Some(slot);
            }
        }
    }
    None
}

/// One sample of `GET .../{vmid}/rrddata?timeframe=hour`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RrdSample {
    #[serde(default, deserialize_with = "coerce::opt_f64")]
    pub cpu: Option<f64>,
    #[serde(default, deserialize_with = "coerce::opt_f64")]
    pub pressurecpusome: Option<f64>,
    #[serde(default, deserialize_with = "coerce::opt_f64")]
    pub pressurecpufull: Option<f64>,
    #[serde(default, deserialize_with = "coerce::opt_f64")]
    pub pressurememorysome: Option<f64>,
    #[serde(default, deserialize_with = "coerce::opt_f64")]
    pub pressurememoryfull: Option<f64>,
    #[serde(default, deserialize_with = "coerce::opt_f64")]
    pub pressureiosome: Option<f64>,
    #[serde(default, deserialize_with = "coerce::opt_f64")]
    pub pressureiofull: Option<f64>,
}

/// One entry of `GET /cluster/ha/status/current`.
#[derive(Debug, Clone, Deserialize)]
pub struct HaStatusEntry {
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl HaStatusEntry {
    /// True when the HA stack reports this entry's node in maintenance.
    pub fn in_maintenance(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.contains("maintenance mode"))
            .unwrap_or(false)
    }
}

/// Payload of `GET /pools/{poolid}`.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolInfo {
    #[serde(default)]
    pub members: Vec<PoolMemberEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolMemberEntry {
    #[serde(default, deserialize_with = "coerce::opt_u32")]
    pub vmid: Option<u32>,
}

/// Payload of `GET /nodes/{node}/tasks/{upid}/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatusInfo {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskStatusInfo {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    pub fn is_stopped(&self) -> bool {
        self.status == "stopped"
    }

    pub fn succeeded(&self) -> bool {
        self.is_stopped() && self.exitstatus.as_deref() == Some("OK")
    }
}

/// One entry of `GET /nodes/{node}/tasks`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskRef {
    pub upid: String,
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "coerce::opt_u64")]
    pub starttime: Option<u64>,
}

/// Parsed task identifier.
///
/// The wire format is
/// `UPID:<node>:<pid>:<pstart>:<starttime>:<type>:<id>:<user>:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upid {
    pub node: String,
    pub task_type: String,
    pub id: String,
    pub user: String,
}

impl Upid {
    pub fn parse(upid: &str) -> Option<Upid> {
        let parts: Vec<&str> = upid.split(':').collect();
        if parts.len() < 8 || parts[0] != "UPID" {
            return None;
        }
        Some(Upid {
            node: parts[1].to_string(),
            task_type: parts[5].to_string(),
            id: parts[6].to_string(),
            user: parts[7].to_string(),
        })
    }

    /// HA-owned tasks wrap the real migration worker in a child task.
    pub fn is_ha_task(&self) -> bool {
        self.task_type.starts_with("ha")
    }
}

/// Options passed along with a migration request.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrateOptions {
    /// Live-migrate a running VM.
    pub online: bool,
    /// Also move node-local disks (VM only).
    pub with_local_disks: bool,
    /// Transfer conntrack state (VM only, PVE 9+).
    pub with_conntrack_state: bool,
    /// Shutdown-move-start semantics for containers.
    pub restart: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_string_coercion() {
        let json = r#"{
            "node": "pve01", "status": "online",
            "maxcpu": "32", "cpu": 0.25,
            "maxmem": "68719476736", "mem": 34359738368,
            "maxdisk": 1099511627776, "disk": "219902325555"
        }"#;
        let node: ApiNode = serde_json::from_str(json).unwrap();
        assert_eq!(node.maxcpu, 32.0);
        assert_eq!(node.maxmem, 68719476736);
        assert_eq!(node.disk, 219902325555);
        assert!(node.is_online());
        assert!(node.psi().is_none());
    }

    #[test]
    fn test_node_psi_extraction() {
        let json = r#"{
            "node": "pve01", "status": "online",
            "pressurememorysome": 0.10, "pressurememoryfull": "0.05",
            "pressurememoryfullspikes": 0.40
        }"#;
        let node: ApiNode = serde_json::from_str(json).unwrap();
        let psi = node.psi().unwrap();
        assert_eq!(psi.memory.some, 0.10);
        assert_eq!(psi.memory.full, 0.05);
        assert_eq!(psi.memory.spikes, 0.40);
        assert_eq!(psi.cpu.some, 0.0);
    }

    #[test]
    fn test_guest_vmid_as_string() {
        let json = r#"{"vmid": "101", "name": "web01", "status": "running", "cpus": 4}"#;
        let guest: ApiGuest = serde_json::from_str(json).unwrap();
        assert_eq!(guest.vmid, 101);
        assert!(guest.is_running());
    }

    #[test]
    fn test_negative_number_rejected() {
        let json = r#"{"vmid": 100, "maxmem": -5}"#;
        let result: Result<ApiGuest, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn test_tag_list_both_delimiters() {
        let config = GuestConfig {
            tags: Some("plb_affinity_web;plb_pin_pve01, prod".to_string()),
            lock: None,
            cores: None,
            memory: None,
            extra: HashMap::new(),
        };
        assert_eq!(config.tag_list(), vec!["plb_affinity_web", "plb_pin_pve01", "prod"]);
    }

    #[test]
    fn test_disk_parsing() {
        let json = r#"{
            "cores": 4,
            "scsi0": "local-lvm:vm-100-disk-0,size=32G",
            "virtio1": "ceph:vm-100-disk-1,shared=1,size=100G",
            "ide2": "local:iso/debian.iso,media=cdrom",
            "net0": "virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0"
        }"#;
        let config: GuestConfig = serde_json::from_str(json).unwrap();
        let mut disks = config.disks();
        disks.sort_by_key(|d| d.shared);
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].slot, DiskSlot::Scsi);
        assert!(!disks[0].shared);
        assert_eq!(disks[1].slot, DiskSlot::Virtio);
        assert!(disks[1].shared);
    }

    #[test]
    fn test_rootfs_is_a_disk() {
        let json = r#"{"rootfs": "local:subvol-200-disk-0,size=8G"}"#;
        let config: GuestConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.disks(), vec![GuestDisk { slot: DiskSlot::Rootfs, shared: false }]);
    }

    #[test]
    fn test_version_major() {
        let version = VersionInfo { version: "8.2.4".to_string(), release: None };
        assert_eq!(version.major(), 8);
        let odd = VersionInfo { version: "garbage".to_string(), release: None };
        assert_eq!(odd.major(), 0);
    }

    #[test]
    fn test_ha_maintenance_detection() {
        let entry = HaStatusEntry {
            node: Some("pve02".to_string()),
            status: Some("maintenance mode (node drained)".to_string()),
        };
        assert!(entry.in_maintenance());
        let active = HaStatusEntry {
            node: Some("pve01".to_string()),
            status: Some("active".to_string()),
        };
        assert!(!active.in_maintenance());
    }

    #[test]
    fn test_task_status_outcomes() {
        let ok: TaskStatusInfo =
            serde_json::from_str(r#"{"status": "stopped", "exitstatus": "OK"}"#).unwrap();
        assert!(ok.succeeded());
        let failed: TaskStatusInfo =
            serde_json::from_str(r#"{"status": "stopped", "exitstatus": "migration aborted"}"#)
                .unwrap();
        assert!(failed.is_stopped());
        assert!(!failed.succeeded());
        let running: TaskStatusInfo = serde_json::from_str(r#"{"status": "running"}"#).unwrap();
        assert!(running.is_running());
    }

    #[test]
    fn test_upid_parse() {
        let upid = Upid::parse("UPID:pve01:0004B3C1:0563A2F1:6650D9E2:qmigrate:101:root@pam:")
            .unwrap();
        assert_eq!(upid.node, "pve01");
        assert_eq!(upid.task_type, "qmigrate");
        assert_eq!(upid.id, "101");
        assert!(!upid.is_ha_task());

        let ha = Upid::parse("UPID:pve01:0004B3C1:0563A2F1:6650D9E2:hamigrate:101:root@pam:")
            .unwrap();
        assert!(ha.is_ha_task());

        assert!(Upid::parse("not-a-upid").is_none());
    }
}
