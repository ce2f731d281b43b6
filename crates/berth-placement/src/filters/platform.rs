//! Platform requirements from the image manifest and package.
//!
//! Requirements map a platform version line (`"7.0"`) to a platform stamp
//! (`"20130308T102805Z"`). A minimum rejects servers on an older version
//! line than any listed, or on the listed line with an older stamp. A
//! maximum mirrors that.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use berth_core::Server;

use crate::candidate::Candidate;
use crate::step::{Outcome, Reasons, Step, StepContext};

/// Removes servers whose platform falls outside the requested bounds.
pub struct PlatformRequirements;

#[derive(Clone, Copy, PartialEq)]
enum Bound {
    Min,
    Max,
}

impl Step for PlatformRequirements {
    fn name(&self) -> &'static str {
        "Servers which meet image manifest and package platform requirements"
    }

    fn run(&self, candidates: &[Candidate<'_>], ctx: &mut StepContext<'_>) -> Outcome {
        let image_reqs = ctx.image.and_then(|image| image.requirements.as_ref());
        let bounds: Vec<(Bound, &BTreeMap<String, String>)> = [
            (Bound::Min, image_reqs.and_then(|r| r.min_platform.as_ref())),
            (Bound::Max, image_reqs.and_then(|r| r.max_platform.as_ref())),
            (Bound::Min, ctx.package.and_then(|p| p.min_platform.as_ref())),
        ]
        .into_iter()
        .filter_map(|(bound, map)| map.filter(|m| !m.is_empty()).map(|m| (bound, m)))
        .collect();

        if bounds.is_empty() {
            return Outcome::keep_all(candidates.len(), Reasons::skip("No platform requirements"));
        }
        Outcome::partition(candidates, |c| check_server(c.server, &bounds).err())
    }
}

fn check_server(server: &Server, bounds: &[(Bound, &BTreeMap<String, String>)]) -> Result<(), String> {
    let (Some(version), Some(platform)) = (
        server.sysinfo().platform_version.as_str(),
        server.current_platform.as_str(),
    ) else {
        return Err("Server has no platform information".to_string());
    };

    for &(bound, requirements) in bounds {
        let (outside, word) = match bound {
            Bound::Min => (Ordering::Less, "minimum"),
            Bound::Max => (Ordering::Greater, "maximum"),
        };

        let beyond_every_line = requirements
            .keys()
            .all(|line| compare_versions(version, line) == outside);
        if beyond_every_line {
            return Err(format!(
                "Server version {version} is outside the {word} platform versions {}",
                requirements.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
            ));
        }

        if let Some(stamp) = requirements.get(version) {
            if platform.cmp(stamp.as_str()) == outside {
                return Err(format!(
                    "Server platform {platform} is outside the {word} {stamp} for version {version}"
                ));
            }
        }
    }
    Ok(())
}

/// Compare dotted version strings numerically component by component.
/// Non-numeric components compare as text.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
