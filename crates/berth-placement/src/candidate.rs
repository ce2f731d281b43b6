//! Candidate preparation.
//!
//! Every server in the snapshot becomes a [`Candidate`] once per run: live
//! reservation tickets are folded into its VM list and its unreserved
//! capacity is computed up front, so capacity filters and scorers all see
//! the same figures.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use berth_core::{Lenient, MIB, PolicyDefaults, Server, Ticket, VmId, VmSummary};
use chrono::{DateTime, Utc};

/// Capacity left for new workloads, after the reservation ratio and
/// everything already committed. `None` when the server's figures are
/// unusable.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Unreserved {
    pub ram_mib: Option<f64>,
    pub disk_mib: Option<f64>,
    /// Percent of one core.
    pub cpu: Option<f64>,
}

/// A server under consideration, with its per-run working state.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    /// Position of the server in the snapshot.
    pub index: usize,
    pub server: &'a Server,
    /// Hosted VMs plus the VMs of live tickets.
    pub vms: Cow<'a, BTreeMap<VmId, VmSummary>>,
    /// Disk (MiB) promised to live tickets; not yet part of the server's quota totals.
    pub ticket_disk_mib: f64,
    pub unreserved: Unreserved,
    pub score: f64,
}

impl<'a> Candidate<'a> {
    pub fn new(index: usize, server: &'a Server) -> Self {
        Self {
            index,
            server,
            vms: Cow::Borrowed(server.vms()),
            ticket_disk_mib: 0.0,
            unreserved: Unreserved::default(),
            score: 0.0,
        }
    }

    pub fn id(&self) -> &'a str {
        &self.server.uuid
    }

    /// Number of active VMs, optionally restricted to one owner.
    pub fn vm_count(&self, owner: Option<&str>) -> usize {
        self.vms
            .values()
            .filter(|vm| vm.is_active())
            .filter(|vm| owner.is_none() || vm.owner() == owner)
            .count()
    }

    fn merge_ticket(&mut self, ticket: &Ticket) {
        if self.vms.contains_key(&ticket.id) {
            return;
        }
        self.ticket_disk_mib += ticket.extra.quota.unwrap_or(0.0) * 1024.0;
        self.vms.to_mut().insert(ticket.id.clone(), ticket.to_vm_summary());
    }

    fn compute_unreserved(&mut self, defaults: &PolicyDefaults) {
        let server = self.server;
        let kept = 1.0 - server.reservation_ratio.get().unwrap_or(defaults.reservation_ratio);
        let active = || self.vms.values().filter(|vm| vm.is_active());

        let ram_committed: f64 = active().filter_map(|vm| vm.max_physical_memory.get()).sum();
        let cpu_committed: f64 = active().filter_map(|vm| vm.cpu_cap.get()).sum();

        let ram_mib = server
            .memory_total_bytes
            .get()
            .map(|total| total / MIB * kept - ram_committed);

        let cpu = server
            .sysinfo()
            .cpu_total_cores
            .get()
            .map(|cores| cores * 100.0 * kept - cpu_committed);

        let optional_bytes = |field: &Lenient<f64>| match field {
            Lenient::Malformed(_) => None,
            other => Some(other.get().unwrap_or(0.0)),
        };
        let disk_mib = match (
            server.disk_pool_size_bytes.get(),
            server.disk_installed_images_used_bytes.get(),
            optional_bytes(&server.disk_zone_quota_bytes),
            optional_bytes(&server.disk_kvm_quota_bytes),
        ) {
            (Some(pool), Some(images), Some(zones), Some(kvms)) => {
                let committed = (images + zones + kvms) / MIB + self.ticket_disk_mib;
                Some(pool / MIB * kept - committed)
            }
            _ => None,
        };

        self.unreserved = Unreserved { ram_mib, disk_mib, cpu };
    }
}

/// Build the candidates for one run, in snapshot order.
pub fn prepare<'a>(
    servers: &'a [Server],
    tickets: &[Ticket],
    defaults: &PolicyDefaults,
    now: DateTime<Utc>,
) -> Vec<Candidate<'a>> {
    let mut live: HashMap<&str, Vec<&Ticket>> = HashMap::new();
    for ticket in tickets.iter().filter(|t| t.is_live(now)) {
        live.entry(ticket.server_uuid.as_str()).or_default().push(ticket);
    }

    servers
        .iter()
        .enumerate()
        .map(|(index, server)| {
            let mut candidate = Candidate::new(index, server);
            for ticket in live.get(server.uuid.as_str()).into_iter().flatten() {
                candidate.merge_ticket(ticket);
            }
            candidate.compute_unreserved(defaults);
            candidate
        })
        .collect()
}
