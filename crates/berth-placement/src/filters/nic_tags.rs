//! NIC tag requirements.
//!
//! A request names one or more alternative tag sets; a server qualifies when
//! every tag of at least one set is carried by an interface whose link is up.
//! Physical interfaces contribute their NIC names, virtual ones their overlay
//! tags.

use std::collections::{BTreeMap, HashSet};

use berth_core::Server;

use crate::candidate::Candidate;
use crate::step::{Outcome, Reasons, Step, StepContext};

/// Removes servers lacking the requested NIC tags.
pub struct NicTags;

impl Step for NicTags {
    fn name(&self) -> &'static str {
        "Servers supporting required NIC Tags"
    }

    fn run(&self, candidates: &[Candidate<'_>], ctx: &mut StepContext<'_>) -> Outcome {
        let Some(sets) = ctx.vm.nic_tag_sets() else {
            return Outcome::keep_all(candidates.len(), Reasons::skip("No NIC Tag requirements to filter on"));
        };
        Outcome::partition(candidates, |c| check_server(c.server, &sets).err())
    }
}

/// Tags a server offers, split by link state. A down tag records the
/// first interface carrying it.
struct ServerTags<'s> {
    up: HashSet<&'s str>,
    down: BTreeMap<&'s str, &'s str>,
}

impl<'s> ServerTags<'s> {
    fn collect(server: &'s Server) -> Self {
        let mut tags = ServerTags {
            up: HashSet::new(),
            down: BTreeMap::new(),
        };
        let sysinfo = server.sysinfo();
        let physical = sysinfo
            .nics()
            .map(|(name, nic)| (name.as_str(), nic.is_up(), &nic.nic_names));
        let virtual_ = sysinfo
            .virtual_nics()
            .map(|(name, nic)| (name.as_str(), nic.is_up(), &nic.overlay_nic_tags));

        for (iface, up, names) in physical.chain(virtual_) {
            for tag in names {
                if up {
                    tags.up.insert(tag.as_str());
                } else {
                    tags.down.entry(tag.as_str()).or_insert(iface);
                }
            }
        }
        tags
    }
}

fn check_server(server: &Server, sets: &[Vec<String>]) -> Result<(), String> {
    if sets.is_empty() {
        return Ok(());
    }
    let tags = ServerTags::collect(server);

    // Explain using the set that came closest to being satisfied.
    let mut closest: Option<Vec<&str>> = None;
    for set in sets {
        let missing: Vec<&str> = set
            .iter()
            .map(String::as_str)
            .filter(|tag| !tags.up.contains(tag))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        if closest.as_ref().is_none_or(|best| missing.len() < best.len()) {
            closest = Some(missing);
        }
    }
    let missing = closest.unwrap_or_default();

    if let Some((tag, iface)) = missing
        .iter()
        .find_map(|tag| tags.down.get(tag).map(|iface| (*tag, *iface)))
    {
        return Err(format!("NIC {iface} for tag \"{tag}\" is down"));
    }
    Err(format!("Server must have NIC Tags: {}", missing.join(", ")))
}
