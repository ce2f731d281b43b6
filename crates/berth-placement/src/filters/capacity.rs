//! Unreserved capacity filters.
//!
//! A server qualifies for a resource when its unreserved quantity covers the
//! requested amount divided by the server's overprovision ratio for that
//! resource. Each resource is its own step so the trace shows which one ran
//! out.

use berth_core::PolicyDefaults;

use crate::candidate::Candidate;
use crate::step::{Outcome, Reasons, Step, StepContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Ram,
    Cpu,
    Disk,
}

impl Resource {
    fn label(self) -> &'static str {
        match self {
            Resource::Ram => "RAM",
            Resource::Cpu => "CPU",
            Resource::Disk => "disk",
        }
    }

    fn unit(self) -> &'static str {
        match self {
            Resource::Ram | Resource::Disk => " MiB",
            Resource::Cpu => "%",
        }
    }

    /// Requested amount in the unit unreserved capacity is tracked in.
    fn requested(self, ctx: &StepContext<'_>) -> Option<f64> {
        match self {
            Resource::Ram => ctx.vm.ram,
            Resource::Cpu => ctx.vm.cpu_cap.or(ctx.package.and_then(|p| p.cpu_cap)),
            Resource::Disk => ctx.vm.quota.map(|gib| gib * 1024.0),
        }
    }

    fn unreserved(self, candidate: &Candidate<'_>) -> Option<f64> {
        let unreserved = candidate.unreserved;
        match self {
            Resource::Ram => unreserved.ram_mib,
            Resource::Cpu => unreserved.cpu,
            Resource::Disk => unreserved.disk_mib,
        }
    }

    fn overprovision_ratio(self, candidate: &Candidate<'_>, defaults: &PolicyDefaults) -> f64 {
        let ratios = candidate.server.overprovision_ratios.get().unwrap_or_default();
        let (offered, fallback) = match self {
            Resource::Ram => (ratios.ram, defaults.overprovision_ratio_ram),
            Resource::Cpu => (ratios.cpu, defaults.overprovision_ratio_cpu),
            Resource::Disk => (ratios.disk, defaults.overprovision_ratio_disk),
        };
        offered.filter(|r| *r > 0.0).unwrap_or(fallback)
    }
}

/// Removes servers without enough unreserved capacity of one resource.
pub struct EnoughUnreserved {
    resource: Resource,
}

impl EnoughUnreserved {
    pub fn new(resource: Resource) -> Self {
        Self { resource }
    }
}

impl Step for EnoughUnreserved {
    fn name(&self) -> &'static str {
        match self.resource {
            Resource::Ram => "Servers with enough unreserved RAM",
            Resource::Cpu => "Servers with enough unreserved CPU",
            Resource::Disk => "Servers with enough unreserved disk",
        }
    }

    fn run(&self, candidates: &[Candidate<'_>], ctx: &mut StepContext<'_>) -> Outcome {
        let resource = self.resource;
        let Some(requested) = resource.requested(ctx) else {
            let reason = match resource {
                Resource::Ram => "VM has no ram to check",
                Resource::Cpu => "VM has no cpu_cap to check",
                Resource::Disk => "VM has no quota to check",
            };
            return Outcome::keep_all(candidates.len(), Reasons::skip(reason));
        };
        let (label, unit) = (resource.label(), resource.unit());

        Outcome::partition(candidates, |c| {
            let Some(unreserved) = resource.unreserved(c) else {
                return Some(format!("Server has no usable {label} capacity figures"));
            };
            let needed = requested / resource.overprovision_ratio(c, ctx.defaults);
            (unreserved < needed).then(|| {
                format!("VM needs {needed:.0}{unit} of {label}, server has {unreserved:.0}{unit} unreserved")
            })
        })
    }
}
