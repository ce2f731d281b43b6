//! Pool-shaping filters: holding back the emptiest servers for large
//! allocations and steering an owner away from servers full of its VMs.

use crate::candidate::Candidate;
use crate::step::{Outcome, Reasons, Step, StepContext};

/// Holds back the share of servers with the most unreserved RAM.
pub struct LargeServers;

impl Step for LargeServers {
    fn name(&self) -> &'static str {
        "Filter out the largest and most empty servers"
    }

    fn run(&self, candidates: &[Candidate<'_>], ctx: &mut StepContext<'_>) -> Outcome {
        let defaults = ctx.defaults;
        if !defaults.filter_large_servers {
            return Outcome::keep_all(candidates.len(), Reasons::skip("Do not filter out large servers"));
        }

        let reserved = (candidates.len() as f64 * defaults.large_server_ratio).floor() as usize;
        if reserved == 0 {
            return Outcome::keep_all(candidates.len(), Reasons::new());
        }

        let mut by_ram: Vec<usize> = (0..candidates.len()).collect();
        by_ram.sort_by(|&a, &b| {
            let ram = |i: usize| candidates[i].unreserved.ram_mib.unwrap_or(f64::NEG_INFINITY);
            ram(b).total_cmp(&ram(a))
        });

        let mut held = vec![false; candidates.len()];
        for &i in by_ram.iter().take(reserved) {
            held[i] = true;
        }
        let mut pos = 0;
        Outcome::partition(candidates, |_| {
            let hold = held[pos];
            pos += 1;
            hold.then(|| "Kept in reserve for large allocations".to_string())
        })
    }
}

/// Keeps the share of servers hosting the fewest of the owner's VMs.
pub struct OwnerManyZones;

impl Step for OwnerManyZones {
    fn name(&self) -> &'static str {
        "Servers which contain fewer of an owner's zones"
    }

    fn run(&self, candidates: &[Candidate<'_>], ctx: &mut StepContext<'_>) -> Outcome {
        let defaults = ctx.defaults;
        if !defaults.filter_owner_many_zones {
            return Outcome::keep_all(candidates.len(), Reasons::skip("Do not filter on owner zone count"));
        }
        let Some(owner) = ctx.vm.owner_uuid.as_deref() else {
            return Outcome::keep_all(candidates.len(), Reasons::skip("No owner to spread"));
        };

        let counts: Vec<usize> = candidates.iter().map(|c| c.vm_count(Some(owner))).collect();
        let keep = ((candidates.len() as f64 * defaults.owner_zone_spread_ratio).floor() as usize).max(1);

        let mut by_count: Vec<usize> = (0..candidates.len()).collect();
        by_count.sort_by_key(|&i| counts[i]);
        let mut kept = vec![false; candidates.len()];
        for &i in by_count.iter().take(keep) {
            kept[i] = true;
        }

        let mut pos = 0;
        Outcome::partition(candidates, |_| {
            let i = pos;
            pos += 1;
            (!kept[i]).then(|| format!("Server hosts {} of the owner's VMs", counts[i]))
        })
    }
}
