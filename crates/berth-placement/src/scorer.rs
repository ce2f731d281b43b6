//! Weighted scoring of the surviving candidates.
//!
//! Each scorer reads one metric per candidate, min-max normalizes it to
//! `0.0..=1.0` across the current candidates and adds `weight × normalized`
//! to the running score. When every candidate has the same metric each one
//! gets the full weight. The random scorer is the exception: it adds
//! `weight × uniform(0, 1)` as drawn, so its jitter stays smaller than a
//! full-weight metric. Scorers never remove candidates.

use berth_core::PolicyDefaults;
use chrono::{DateTime, Utc};
use rand::Rng;

use crate::candidate::Candidate;
use crate::step::{Outcome, Reasons, Step, StepContext};

/// Which property of a candidate a scorer rewards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// More unreserved RAM is better.
    UnreservedRam,
    /// More unreserved disk is better.
    UnreservedDisk,
    /// Fewer of the owner's VMs already on the server is better.
    OwnerZones,
    /// Newer platform stamps are better.
    Platform,
    /// A scheduled reboot further away is better.
    NextReboot,
    /// Uniform random jitter that breaks ties.
    Random,
}

impl Metric {
    fn weight(self, defaults: &PolicyDefaults) -> f64 {
        match self {
            Metric::UnreservedRam => defaults.weight_unreserved_ram,
            Metric::UnreservedDisk => defaults.weight_unreserved_disk,
            Metric::OwnerZones => defaults.weight_num_owner_zones,
            Metric::Platform => defaults.weight_current_platform,
            Metric::NextReboot => defaults.weight_next_reboot,
            Metric::Random => defaults.weight_uniform_random,
        }
    }
}

/// A scorer adding `weight × normalized metric` to every candidate.
pub struct WeightedScorer {
    metric: Metric,
}

impl WeightedScorer {
    pub fn new(metric: Metric) -> Self {
        Self { metric }
    }
}

impl Step for WeightedScorer {
    fn name(&self) -> &'static str {
        match self.metric {
            Metric::UnreservedRam => "Score servers based on unreserved RAM",
            Metric::UnreservedDisk => "Score servers based on unreserved disk",
            Metric::OwnerZones => "Score servers based on number of zones belonging to owner",
            Metric::Platform => "Score servers running newer platforms more highly",
            Metric::NextReboot => "Score servers that will not be rebooted soon more highly",
            Metric::Random => "Increase server scores randomly",
        }
    }

    fn run(&self, candidates: &[Candidate<'_>], ctx: &mut StepContext<'_>) -> Outcome {
        let n = candidates.len();
        let weight = self.metric.weight(ctx.defaults);
        if weight == 0.0 {
            return Outcome::unscored(n, Reasons::skip("Resolved score weight to 0.00; no changes"));
        }

        let values: Vec<Option<f64>> = match self.metric {
            Metric::UnreservedRam => candidates.iter().map(|c| c.unreserved.ram_mib).collect(),
            Metric::UnreservedDisk => candidates.iter().map(|c| c.unreserved.disk_mib).collect(),
            Metric::OwnerZones => {
                let Some(owner) = ctx.vm.owner_uuid.as_deref() else {
                    return Outcome::unscored(n, Reasons::skip("No owner to score against"));
                };
                candidates.iter().map(|c| Some(-(c.vm_count(Some(owner)) as f64))).collect()
            }
            Metric::Platform if n <= 1 => return Outcome::unscored(n, Reasons::skip("One or fewer servers")),
            Metric::Platform => platform_ranks(candidates),
            Metric::NextReboot if n <= 1 => return Outcome::unscored(n, Reasons::skip("One or fewer servers")),
            Metric::NextReboot => {
                let horizon = ctx.defaults.reboot_horizon_hours;
                candidates
                    .iter()
                    .map(|c| Some(hours_until_reboot(c, ctx.now, horizon)))
                    .collect()
            }
            Metric::Random => (0..n).map(|_| Some(ctx.rng.r#gen::<f64>())).collect(),
        };

        let shares = if self.metric == Metric::Random {
            values.into_iter().flatten().collect()
        } else {
            let Some(normalized) = normalize(&values) else {
                return Outcome::unscored(n, Reasons::skip("No data to score on"));
            };
            normalized
        };

        let mut reasons = Reasons::new();
        let deltas: Vec<f64> = candidates
            .iter()
            .zip(shares)
            .map(|(c, share)| {
                let delta = weight * share;
                let verb = if delta < 0.0 { "decreased" } else { "increased" };
                reasons.insert(
                    c.id(),
                    format!("{verb} score by {:.2} to {:.2}", delta.abs(), c.score + delta),
                );
                delta
            })
            .collect();
        Outcome::Score { deltas, reasons }
    }
}

/// Min-max normalize to `0.0..=1.0`. Unknown values score lowest; equal
/// values score highest. `None` when nothing is known.
fn normalize(values: &[Option<f64>]) -> Option<Vec<f64>> {
    let known = values.iter().flatten().copied();
    let min = known.clone().reduce(f64::min)?;
    let max = known.reduce(f64::max)?;
    let range = max - min;

    Some(
        values
            .iter()
            .map(|v| match v {
                None => 0.0,
                Some(_) if range <= f64::EPSILON => 1.0,
                Some(v) => (v - min) / range,
            })
            .collect(),
    )
}

/// Rank of each candidate's platform stamp among the distinct stamps
/// present, starting at 1; a missing stamp ranks 0.
fn platform_ranks(candidates: &[Candidate<'_>]) -> Vec<Option<f64>> {
    let mut stamps: Vec<&str> = candidates
        .iter()
        .filter_map(|c| c.server.current_platform.as_str())
        .collect();
    stamps.sort_unstable();
    stamps.dedup();

    candidates
        .iter()
        .map(|c| {
            let rank = c
                .server
                .current_platform
                .as_str()
                .and_then(|p| stamps.binary_search(&p).ok())
                .map_or(0, |i| i + 1);
            Some(rank as f64)
        })
        .collect()
}

/// Hours until the next scheduled reboot, clamped to the horizon. No
/// reboot, a reboot already in the past, or an unreadable date count as
/// the full horizon.
fn hours_until_reboot(candidate: &Candidate<'_>, now: DateTime<Utc>, horizon: f64) -> f64 {
    match candidate.server.next_reboot.get() {
        Some(at) if at > now => {
            let hours = (at - now).num_seconds() as f64 / 3600.0;
            hours.clamp(0.0, horizon)
        }
        _ => horizon,
    }
}
