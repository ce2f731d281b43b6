//! Domain types for a single allocation request.
//!
//! These types describe the cluster snapshot handed to the allocator by the
//! inventory collaborator (servers with their NICs and hosted VMs, in-flight
//! reservation tickets) and the workload being placed (VM request, image,
//! package). Field names follow the inventory wire format. Fields the
//! validity filter inspects are [`Lenient`] so a malformed record decodes and
//! is rejected with a reason instead of failing the whole request.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::lenient::Lenient;

/// Unique identifier for a server in the cluster.
pub type ServerId = String;

/// Unique identifier for a VM.
pub type VmId = String;

/// Arbitrary key/value traits attached to servers, images, packages and VMs.
pub type Traits = BTreeMap<String, serde_json::Value>;

pub const MIB: f64 = 1024.0 * 1024.0;

// ── Server ────────────────────────────────────────────────────────

/// A candidate compute node as reported by the inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Server {
    /// Empty when absent or not a string.
    #[serde(deserialize_with = "id_or_empty")]
    pub uuid: ServerId,
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub hostname: Lenient<String>,
    /// Runtime status; only `"running"` servers are allocatable.
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub status: Lenient<String>,
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub setup: Lenient<bool>,
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub headnode: Lenient<bool>,
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub reserved: Lenient<bool>,
    /// Share of RAM and disk withheld from workloads (0.0–1.0).
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub reservation_ratio: Lenient<f64>,
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub overprovision_ratios: Lenient<OverprovisionRatios>,

    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub memory_total_bytes: Lenient<f64>,
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub memory_available_bytes: Lenient<f64>,
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub disk_pool_size_bytes: Lenient<f64>,
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub disk_installed_images_used_bytes: Lenient<f64>,
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub disk_zone_quota_bytes: Lenient<f64>,
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub disk_kvm_quota_bytes: Lenient<f64>,

    /// Platform image stamp the server is currently booted from.
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub current_platform: Lenient<String>,
    /// Scheduled reboot, if any.
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub next_reboot: Lenient<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub traits: Lenient<Traits>,
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub sysinfo: Lenient<Sysinfo>,
    /// VMs hosted on this server, keyed by VM identifier.
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub vms: Lenient<BTreeMap<VmId, VmSummary>>,
}

fn id_or_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ServerId, D::Error> {
    let raw = serde_json::Value::deserialize(deserializer)?;
    Ok(raw.as_str().unwrap_or_default().to_string())
}

static NO_SYSINFO: Sysinfo = Sysinfo {
    cpu_total_cores: Lenient::Missing,
    platform_version: Lenient::Missing,
    network_interfaces: Lenient::Missing,
    virtual_network_interfaces: Lenient::Missing,
};

static NO_VMS: BTreeMap<VmId, VmSummary> = BTreeMap::new();

/// Per-resource overprovision ratios of a server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct OverprovisionRatios {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<f64>,
}

/// Hardware and network inventory reported by the server itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Sysinfo {
    #[serde(rename = "CPU Total Cores", skip_serializing_if = "Lenient::is_missing")]
    pub cpu_total_cores: Lenient<f64>,
    /// Platform version line, e.g. `"7.0"`.
    #[serde(rename = "SDC Version", skip_serializing_if = "Lenient::is_missing")]
    pub platform_version: Lenient<String>,
    #[serde(rename = "Network Interfaces", skip_serializing_if = "Lenient::is_missing")]
    pub network_interfaces: Lenient<BTreeMap<String, Nic>>,
    #[serde(rename = "Virtual Network Interfaces", skip_serializing_if = "Lenient::is_missing")]
    pub virtual_network_interfaces: Lenient<BTreeMap<String, VirtualNic>>,
}

impl Sysinfo {
    /// Physical interfaces by name; empty when absent or malformed.
    pub fn nics(&self) -> impl Iterator<Item = (&String, &Nic)> {
        self.network_interfaces.valid().into_iter().flatten()
    }

    /// Virtual interfaces by name; empty when absent or malformed.
    pub fn virtual_nics(&self) -> impl Iterator<Item = (&String, &VirtualNic)> {
        self.virtual_network_interfaces.valid().into_iter().flatten()
    }
}

/// A physical network interface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Nic {
    #[serde(rename = "Link Status", skip_serializing_if = "Option::is_none")]
    pub link_status: Option<String>,
    #[serde(rename = "NIC Names")]
    pub nic_names: Vec<String>,
}

/// A virtual (overlay) network interface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct VirtualNic {
    #[serde(rename = "Link Status", skip_serializing_if = "Option::is_none")]
    pub link_status: Option<String>,
    #[serde(rename = "Overlay Nic Tags")]
    pub overlay_nic_tags: Vec<String>,
}

impl Nic {
    pub fn is_up(&self) -> bool {
        self.link_status.as_deref() == Some("up")
    }
}

impl VirtualNic {
    pub fn is_up(&self) -> bool {
        self.link_status.as_deref() == Some("up")
    }
}

impl Server {
    /// Whether the server has completed setup.
    pub fn is_setup(&self) -> bool {
        self.setup.get() == Some(true)
    }

    pub fn is_headnode(&self) -> bool {
        self.headnode.get() == Some(true)
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved.get() == Some(true)
    }

    /// Server-reported inventory; empty when absent or malformed.
    pub fn sysinfo(&self) -> &Sysinfo {
        self.sysinfo.valid().unwrap_or(&NO_SYSINFO)
    }

    /// Hosted VMs; empty when absent or malformed.
    pub fn vms(&self) -> &BTreeMap<VmId, VmSummary> {
        self.vms.valid().unwrap_or(&NO_VMS)
    }

    /// Traits of the server, empty when absent or malformed.
    pub fn traits(&self) -> Traits {
        self.traits.valid().cloned().unwrap_or_default()
    }
}

// ── VM summary ────────────────────────────────────────────────────

/// A VM hosted on a server, as summarized by the inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct VmSummary {
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub uuid: Lenient<VmId>,
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub owner_uuid: Lenient<String>,
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub state: Lenient<String>,
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub brand: Lenient<String>,
    /// RAM in MiB.
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub max_physical_memory: Lenient<f64>,
    /// Disk quota in GiB.
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub quota: Lenient<f64>,
    /// CPU cap in percent of one core.
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub cpu_cap: Lenient<f64>,
    #[serde(skip_serializing_if = "Lenient::is_missing")]
    pub last_modified: Lenient<String>,
}

impl VmSummary {
    /// Owner identifier, when well-formed.
    pub fn owner(&self) -> Option<&str> {
        self.owner_uuid.as_str()
    }

    /// Whether the VM still holds resources on its server.
    pub fn is_active(&self) -> bool {
        self.state.as_str() != Some("destroyed")
    }
}

// ── Workload ──────────────────────────────────────────────────────

/// Specification of the VM being placed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct VmRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_uuid: Option<VmId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_uuid: Option<String>,
    /// RAM in MiB. Required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram: Option<f64>,
    /// CPU cap in percent of one core.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cap: Option<f64>,
    /// Disk quota in GiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<f64>,
    /// Every tag must be present on the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nic_tags: Option<Vec<String>>,
    /// Alternative tag sets; satisfying any one set suffices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nic_tag_requirements: Option<Vec<Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traits: Option<Traits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locality: Option<Locality>,
}

impl VmRequest {
    /// The alternative NIC tag sets the server must satisfy one of, or
    /// `None` when the request has no NIC tag requirements at all.
    pub fn nic_tag_sets(&self) -> Option<Vec<Vec<String>>> {
        match (&self.nic_tag_requirements, &self.nic_tags) {
            (Some(sets), _) => Some(sets.clone()),
            (None, Some(tags)) => Some(vec![tags.clone()]),
            (None, None) => None,
        }
    }
}

/// Affinity hints for a placement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Locality {
    /// Violating the hints fails the request instead of being ignored.
    pub strict: bool,
    /// Identifiers to prefer colocating with.
    pub near: OneOrMany,
    /// Identifiers to avoid colocating with.
    pub far: OneOrMany,
}

impl Locality {
    pub fn is_empty(&self) -> bool {
        self.near.is_empty() && self.far.is_empty()
    }
}

/// A list of identifiers that may also be given as a bare string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(from = "OneOrManyWire", into = "Vec<String>")]
pub struct OneOrMany(pub Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrManyWire {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrManyWire> for OneOrMany {
    fn from(wire: OneOrManyWire) -> Self {
        match wire {
            OneOrManyWire::One(id) => OneOrMany(vec![id]),
            OneOrManyWire::Many(ids) => OneOrMany(ids),
        }
    }
}

impl From<OneOrMany> for Vec<String> {
    fn from(ids: OneOrMany) -> Self {
        ids.0
    }
}

impl OneOrMany {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }
}

/// Image manifest fields relevant to placement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Image {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traits: Option<Traits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements: Option<ImageRequirements>,
}

/// Platform bounds declared by an image, keyed by platform version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ImageRequirements {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_platform: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_platform: Option<BTreeMap<String, String>>,
}

/// Billing package fields relevant to placement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Package {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traits: Option<Traits>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cap: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_platform: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overprovision_cpu: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overprovision_ram: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overprovision_disk: Option<f64>,
}

// ── Tickets ───────────────────────────────────────────────────────

/// An in-flight placement not yet visible in the server's VM inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticket {
    pub uuid: String,
    pub server_uuid: ServerId,
    pub scope: String,
    /// Identifier of the object the ticket is for (the VM being provisioned).
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extra: TicketExtra,
}

/// Projected footprint of the VM a ticket reserves room for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TicketExtra {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_physical_memory: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cap: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
}

impl Ticket {
    /// Whether this ticket still reserves capacity at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.scope == "vm" && self.expires_at.is_none_or(|at| at >= now)
    }

    /// The VM view this ticket contributes to its server.
    pub fn to_vm_summary(&self) -> VmSummary {
        VmSummary {
            uuid: Lenient::Valid(self.id.clone()),
            owner_uuid: self.extra.owner_uuid.clone().map_or(Lenient::Missing, Lenient::Valid),
            state: Lenient::Valid("provisioning".to_string()),
            brand: self.extra.brand.clone().map_or(Lenient::Missing, Lenient::Valid),
            max_physical_memory: self.extra.max_physical_memory.map_or(Lenient::Missing, Lenient::Valid),
            quota: self.extra.quota.map_or(Lenient::Missing, Lenient::Valid),
            cpu_cap: self.extra.cpu_cap.map_or(Lenient::Missing, Lenient::Valid),
            last_modified: Lenient::Missing,
        }
    }
}

// ── Request ───────────────────────────────────────────────────────

/// Everything one allocation run needs: the snapshot and the workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AllocationRequest {
    /// Each record decodes on its own; one that is not even an object becomes
    /// an empty server and fails the first filters.
    #[serde(deserialize_with = "servers_per_record")]
    pub servers: Vec<Server>,
    pub vm: Option<VmRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<Package>,
    pub tickets: Vec<Ticket>,
}

fn servers_per_record<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Server>, D::Error> {
    let records = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(records
        .into_iter()
        .map(|record| serde_json::from_value(record).unwrap_or_default())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_decodes_inventory_shape() {
        let server: Server = serde_json::from_value(json!({
            "uuid": "00000000-0000-0000-0000-00259094373c",
            "status": "running",
            "setup": true,
            "reserved": false,
            "memory_total_bytes": 137399590912u64,
            "overprovision_ratios": { "cpu": 4, "ram": 1, "disk": 1 },
            "sysinfo": {
                "CPU Total Cores": 64,
                "Network Interfaces": {
                    "igb0": { "Link Status": "up", "NIC Names": ["admin"] }
                }
            },
            "vms": {
                "736ddef6-8854-4dd5-82a0-2d184bd90cd4": {
                    "owner_uuid": "9dce1460-0c4c-4417-ab8b-25ca478c5a78",
                    "max_physical_memory": 128,
                    "cpu_cap": 100
                }
            }
        }))
        .unwrap();

        assert!(server.is_setup());
        assert!(!server.is_reserved());
        assert_eq!(server.sysinfo().cpu_total_cores.get(), Some(64.0));
        assert!(server.sysinfo().nics().all(|(_, nic)| nic.is_up()));
        assert_eq!(server.overprovision_ratios.get().and_then(|r| r.cpu), Some(4.0));
        assert_eq!(server.vms().len(), 1);
    }

    #[test]
    fn malformed_server_fields_still_decode() {
        let server: Server = serde_json::from_value(json!({
            "uuid": "d0c1bacd-77b2-409a-a629-9ada5cc0eef9",
            "reserved": "false",
            "memory_total_bytes": "lots"
        }))
        .unwrap();

        assert!(server.reserved.is_malformed());
        assert!(server.memory_total_bytes.is_malformed());
        assert!(!server.is_reserved());
    }

    #[test]
    fn mistyped_strings_and_maps_still_decode() {
        let server: Server = serde_json::from_value(json!({
            "uuid": "d0c1bacd-77b2-409a-a629-9ada5cc0eef9",
            "status": 1,
            "current_platform": false,
            "sysinfo": { "SDC Version": 7, "Network Interfaces": ["igb0"] },
            "vms": []
        }))
        .unwrap();

        assert!(server.status.is_malformed());
        assert!(server.current_platform.is_malformed());
        assert!(server.sysinfo().platform_version.is_malformed());
        assert_eq!(server.sysinfo().nics().count(), 0);
        assert!(server.vms.is_malformed());
        assert!(server.vms().is_empty());

        let vm: VmSummary = serde_json::from_value(json!({ "state": 3, "brand": ["kvm"] })).unwrap();
        assert!(vm.state.is_malformed());
        assert!(vm.is_active());
    }

    #[test]
    fn one_bad_server_does_not_sink_the_request() {
        let request: AllocationRequest = serde_json::from_value(json!({
            "servers": [
                { "uuid": "cn0", "status": "running" },
                { "uuid": 42, "status": "running" },
                "not a server"
            ],
            "vm": { "ram": 512 }
        }))
        .unwrap();

        assert_eq!(request.servers.len(), 3);
        assert_eq!(request.servers[0].status.as_str(), Some("running"));
        assert_eq!(request.servers[1].uuid, "");
        assert_eq!(request.servers[2], Server::default());
    }

    #[test]
    fn locality_accepts_scalar_or_list() {
        let scalar: Locality = serde_json::from_value(json!({ "near": "vm-a" })).unwrap();
        assert_eq!(scalar.near.0, vec!["vm-a".to_string()]);
        assert!(scalar.far.is_empty());

        let list: Locality =
            serde_json::from_value(json!({ "strict": true, "far": ["vm-a", "vm-b"] })).unwrap();
        assert!(list.strict);
        assert_eq!(list.far.0.len(), 2);
    }

    #[test]
    fn nic_tag_requirements_take_precedence() {
        let vm = VmRequest {
            nic_tags: Some(vec!["admin".into()]),
            nic_tag_requirements: Some(vec![vec!["external".into()], vec!["customer12".into()]]),
            ..Default::default()
        };
        assert_eq!(vm.nic_tag_sets().unwrap().len(), 2);

        let flat = VmRequest {
            nic_tags: Some(vec!["admin".into(), "external".into()]),
            ..Default::default()
        };
        assert_eq!(flat.nic_tag_sets(), Some(vec![vec!["admin".to_string(), "external".to_string()]]));
        assert_eq!(VmRequest::default().nic_tag_sets(), None);
    }

    #[test]
    fn expired_and_non_vm_tickets_are_not_live() {
        let now: DateTime<Utc> = "2015-06-28T00:00:00Z".parse().unwrap();
        let mut ticket: Ticket = serde_json::from_value(json!({
            "uuid": "4de2031d-2a49-4895-a2a1-d04af8eecd63",
            "server_uuid": "00000000-0000-0000-0000-00259094373c",
            "scope": "vm",
            "id": "cf534f80-618a-4a8a-b5dc-485aa622a0ba",
            "expires_at": "2015-10-10T00:00:00.000Z",
            "extra": { "owner_uuid": "0ddc0513-f414-4ee5-81cc-7b716fd04a6a", "max_physical_memory": 1024 }
        }))
        .unwrap();
        assert!(ticket.is_live(now));
        assert_eq!(ticket.to_vm_summary().max_physical_memory.get(), Some(1024.0));

        ticket.expires_at = Some("2015-06-27T00:00:00Z".parse().unwrap());
        assert!(!ticket.is_live(now));

        ticket.expires_at = None;
        ticket.scope = "server".into();
        assert!(!ticket.is_live(now));
    }
}
