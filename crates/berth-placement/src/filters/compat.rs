//! Package compatibility filters: overprovision ratios, cpu_cap parity and
//! the per-server VM ceiling.

use crate::candidate::Candidate;
use crate::step::{Outcome, Reasons, Step, StepContext};

const RATIO_TOLERANCE: f64 = 1e-6;

/// Removes servers whose overprovision ratios differ from the package's.
pub struct OverprovisionRatios;

impl Step for OverprovisionRatios {
    fn name(&self) -> &'static str {
        "Servers with same overprovision ratios as requested VM"
    }

    fn run(&self, candidates: &[Candidate<'_>], ctx: &mut StepContext<'_>) -> Outcome {
        let defaults = ctx.defaults;
        if !defaults.filter_overprovision_ratios {
            return Outcome::keep_all(candidates.len(), Reasons::skip("Do not filter on overprovision ratios"));
        }
        let Some(package) = ctx.package else {
            return Outcome::keep_all(candidates.len(), Reasons::skip("No pkg provided"));
        };

        Outcome::partition(candidates, |c| {
            let server = c.server.overprovision_ratios.get().unwrap_or_default();
            let dimensions = [
                ("cpu", defaults.strict_overprovision_cpu, package.overprovision_cpu, server.cpu, defaults.overprovision_ratio_cpu),
                ("ram", defaults.strict_overprovision_ram, package.overprovision_ram, server.ram, defaults.overprovision_ratio_ram),
                ("disk", defaults.strict_overprovision_disk, package.overprovision_disk, server.disk, defaults.overprovision_ratio_disk),
            ];
            dimensions.into_iter().find_map(|(resource, strict, wanted, offered, fallback)| {
                let wanted = wanted.filter(|_| strict)?;
                let offered = offered.unwrap_or(fallback);
                ((wanted - offered).abs() > RATIO_TOLERANCE).then(|| {
                    format!("Package over-provision ratio of {wanted:.2} does not match server's {offered:.2} for {resource}")
                })
            })
        })
    }
}

/// Keeps capped and uncapped workloads apart: a VM with a cpu_cap only lands
/// where every VM has one, and an uncapped VM only where none do.
pub struct CpuCapParity;

impl Step for CpuCapParity {
    fn name(&self) -> &'static str {
        "Servers which have same existence of cpu_cap as package"
    }

    fn run(&self, candidates: &[Candidate<'_>], ctx: &mut StepContext<'_>) -> Outcome {
        if !ctx.defaults.filter_cpu_cap {
            return Outcome::keep_all(candidates.len(), Reasons::skip("Do not filter on cpu_cap presence"));
        }
        let capped = ctx.vm.cpu_cap.or(ctx.package.and_then(|p| p.cpu_cap)).is_some();

        Outcome::partition(candidates, |c| {
            c.vms
                .iter()
                .filter(|(_, vm)| vm.is_active())
                .find(|(_, vm)| vm.cpu_cap.valid().is_some() != capped)
                .map(|(id, _)| {
                    if capped {
                        format!("VM {id} has no cpu_cap but the requested VM has one")
                    } else {
                        format!("VM {id} has a cpu_cap but the requested VM has none")
                    }
                })
        })
    }
}

/// Removes servers already hosting as many VMs as the policy allows.
pub struct VmCount;

impl Step for VmCount {
    fn name(&self) -> &'static str {
        "Servers with more VMs than limit"
    }

    fn run(&self, candidates: &[Candidate<'_>], ctx: &mut StepContext<'_>) -> Outcome {
        let defaults = ctx.defaults;
        if !defaults.filter_vm_count {
            return Outcome::keep_all(candidates.len(), Reasons::skip("Do not filter on VM count"));
        }
        let limit = defaults.vm_count_limit;
        Outcome::partition(candidates, |c| {
            let count = c.vm_count(None);
            (count >= limit).then(|| format!("Server has {count} VMs (limit is {limit})"))
        })
    }
}
