//! Shared fixtures for in-crate tests.

use berth_core::{Image, Lenient, MIB, Package, PolicyDefaults, Server, Sysinfo, VmRequest, VmSummary};
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::json;

use crate::candidate::{Candidate, prepare};
use crate::step::{Outcome, Step, StepContext};

pub const OWNER: &str = "930896af-bf8c-48d4-885c-6573a94b1853";

/// A healthy, empty compute node: 16 GiB RAM, 500 GiB disk, 8 cores, no
/// reservation ratio, an `admin` and `external` NIC that is up.
pub fn make_server(id: &str) -> Server {
    Server {
        uuid: id.to_string(),
        status: Lenient::Valid("running".into()),
        setup: Lenient::Valid(true),
        headnode: Lenient::Valid(false),
        reserved: Lenient::Valid(false),
        reservation_ratio: Lenient::Valid(0.0),
        memory_total_bytes: Lenient::Valid(16_384.0 * MIB),
        memory_available_bytes: Lenient::Valid(16_384.0 * MIB),
        disk_pool_size_bytes: Lenient::Valid(512_000.0 * MIB),
        disk_installed_images_used_bytes: Lenient::Valid(0.0),
        current_platform: Lenient::Valid("20240101T000000Z".into()),
        sysinfo: serde_json::from_value(json!({
            "CPU Total Cores": 8,
            "SDC Version": "7.0",
            "Network Interfaces": {
                "ixgbe0": { "Link Status": "up", "NIC Names": ["admin", "external"] }
            }
        }))
        .expect("fixture sysinfo"),
        ..Default::default()
    }
}

/// A running VM owned by `owner` using 1 GiB of RAM.
pub fn make_vm(owner: &str) -> VmSummary {
    VmSummary {
        owner_uuid: Lenient::Valid(owner.to_string()),
        state: Lenient::Valid("running".into()),
        max_physical_memory: Lenient::Valid(1024.0),
        ..Default::default()
    }
}

/// Host `vm` on `server` under `id`.
pub fn add_vm(server: &mut Server, id: impl Into<String>, vm: VmSummary) {
    let mut vms = server.vms().clone();
    vms.insert(id.into(), vm);
    server.vms = Lenient::Valid(vms);
}

/// Mutable access to a fixture server's sysinfo.
pub fn sysinfo_mut(server: &mut Server) -> &mut Sysinfo {
    match &mut server.sysinfo {
        Lenient::Valid(sysinfo) => sysinfo,
        _ => panic!("fixture server has no sysinfo"),
    }
}

/// Workload and policy for running a single step.
pub struct Fixture {
    pub vm: VmRequest,
    pub image: Option<Image>,
    pub package: Option<Package>,
    pub defaults: PolicyDefaults,
    pub now: DateTime<Utc>,
    pub rng: StdRng,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            vm: VmRequest {
                owner_uuid: Some(OWNER.to_string()),
                ram: Some(1024.0),
                ..Default::default()
            },
            image: None,
            package: None,
            defaults: PolicyDefaults::default(),
            now: "2024-03-01T00:00:00Z".parse().expect("fixture clock"),
            rng: StdRng::seed_from_u64(7),
        }
    }

    pub fn run(&mut self, step: &dyn Step, servers: &[Server]) -> Outcome {
        let candidates = prepare(servers, &[], &self.defaults, self.now);
        self.run_on(step, &candidates)
    }

    pub fn run_on(&mut self, step: &dyn Step, candidates: &[Candidate<'_>]) -> Outcome {
        let mut ctx = StepContext {
            vm: &self.vm,
            image: self.image.as_ref(),
            package: self.package.as_ref(),
            defaults: &self.defaults,
            now: self.now,
            rng: &mut self.rng,
        };
        step.run(candidates, &mut ctx)
    }
}

/// Identifiers of the servers a filter outcome keeps.
pub fn kept_ids(outcome: &Outcome, servers: &[Server]) -> Vec<String> {
    match outcome {
        Outcome::Filter { kept, .. } => kept.iter().map(|&i| servers[i].uuid.clone()).collect(),
        Outcome::Score { .. } => panic!("expected a filter outcome"),
    }
}

/// Score changes of a scorer outcome.
pub fn deltas(outcome: &Outcome) -> &[f64] {
    match outcome {
        Outcome::Score { deltas, .. } => deltas,
        Outcome::Filter { .. } => panic!("expected a score outcome"),
    }
}
