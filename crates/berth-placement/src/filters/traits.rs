//! Trait matching between workload and server.

use berth_core::Traits;
use serde_json::Value;

use crate::candidate::Candidate;
use crate::step::{Outcome, Step, StepContext};

/// Removes servers whose traits do not satisfy the combined image, package
/// and VM traits.
pub struct MatchingTraits;

impl Step for MatchingTraits {
    fn name(&self) -> &'static str {
        "Servers with correct traits"
    }

    fn run(&self, candidates: &[Candidate<'_>], ctx: &mut StepContext<'_>) -> Outcome {
        let mut requested = Traits::new();
        let sources = [
            ctx.image.and_then(|i| i.traits.as_ref()),
            ctx.package.and_then(|p| p.traits.as_ref()),
            ctx.vm.traits.as_ref(),
        ];
        for traits in sources.into_iter().flatten() {
            requested.extend(traits.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let reserve = ctx.defaults.reserve_traited_servers;

        Outcome::partition(candidates, |c| {
            let offered = c.server.traits();
            if requested.is_empty() {
                return (reserve && !offered.is_empty()).then(|| {
                    format!("Combined vm/pkg/img require no traits but server has {}", render(&offered))
                });
            }
            let satisfied = requested
                .iter()
                .all(|(key, want)| offered.get(key).is_some_and(|have| trait_matches(want, have)));
            (!satisfied).then(|| {
                format!(
                    "Combined vm/pkg/img traits require {} but server has {}",
                    render(&requested),
                    render(&offered)
                )
            })
        })
    }
}

/// Equal values match; an array on either side matches a scalar it contains.
fn trait_matches(want: &Value, have: &Value) -> bool {
    match (want, have) {
        (w, h) if w == h => true,
        (Value::Array(options), h) if !h.is_array() => options.contains(h),
        (w, Value::Array(options)) if !w.is_array() => options.contains(w),
        _ => false,
    }
}

fn render(traits: &Traits) -> String {
    serde_json::to_string(traits).unwrap_or_default()
}
