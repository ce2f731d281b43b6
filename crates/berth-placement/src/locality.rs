//! Locality: affinity (`near`) and anti-affinity (`far`) hints, and the
//! implicit spread of an owner's VMs across servers when no hints are given.
//!
//! One evaluation drives both modes. Non-strict (soft) placement drops any
//! exclusion that would empty the candidate set and says so under `"*"`;
//! strict (hard) placement enforces the raw exclusion even if nothing
//! survives.

use std::collections::{BTreeMap, HashMap, HashSet};

use berth_core::{Locality, VmRequest};

use crate::candidate::Candidate;
use crate::step::{Outcome, Reasons, Step, StepContext};

// ── Index ─────────────────────────────────────────────────────────

/// Identifier → hosting candidates, built in one pass per step invocation.
struct LocalityIndex<'c> {
    hosts: HashMap<&'c str, Vec<usize>>,
    owner_counts: Vec<usize>,
}

impl<'c> LocalityIndex<'c> {
    /// Index server identifiers and the VMs the hints may refer to: the
    /// owner's VMs, or every VM when the request has no owner.
    fn build(candidates: &'c [Candidate<'_>], owner: Option<&str>) -> Self {
        let mut hosts: HashMap<&'c str, Vec<usize>> = HashMap::new();
        let mut owner_counts = vec![0; candidates.len()];

        for (pos, candidate) in candidates.iter().enumerate() {
            hosts.entry(candidate.id()).or_default().push(pos);
            for (vm_id, vm) in candidate.vms.iter() {
                if !vm.is_active() {
                    continue;
                }
                let owned = owner.is_some_and(|o| vm.owner() == Some(o));
                if owned {
                    owner_counts[pos] += 1;
                }
                if owned || owner.is_none() {
                    hosts.entry(vm_id.as_str()).or_default().push(pos);
                }
            }
        }
        Self { hosts, owner_counts }
    }

    fn hosts(&self, id: &str) -> &[usize] {
        self.hosts.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ── Evaluation ────────────────────────────────────────────────────

#[derive(Default)]
struct Evaluation {
    /// Candidate position → exclusion reason.
    excluded: BTreeMap<usize, String>,
    /// Constraints dropped because they would have emptied the set.
    ignored: Vec<String>,
}

impl Evaluation {
    fn into_outcome(self, candidates: &[Candidate<'_>]) -> Outcome {
        let mut reasons = Reasons::new();
        for ignored in self.ignored {
            reasons.insert_all(ignored);
        }
        let mut kept = Vec::with_capacity(candidates.len());
        for (pos, candidate) in candidates.iter().enumerate() {
            match self.excluded.get(&pos) {
                Some(reason) => reasons.insert(candidate.id(), reason.clone()),
                None => kept.push(pos),
            }
        }
        Outcome::Filter { kept, reasons }
    }
}

fn evaluate(candidates: &[Candidate<'_>], vm: &VmRequest, lenient: bool) -> Evaluation {
    let owner = vm.owner_uuid.as_deref();
    let index = LocalityIndex::build(candidates, owner);
    let mut alive = vec![true; candidates.len()];
    let mut eval = Evaluation::default();

    match vm.locality.as_ref().filter(|l| !l.is_empty()) {
        Some(locality) => {
            apply_far(locality, &index, &mut alive, &mut eval, lenient);
            apply_near(locality, &index, &mut alive, &mut eval, lenient);
        }
        None if owner.is_some() => apply_owner_spread(&index, &mut alive, &mut eval, lenient),
        None => {}
    }
    eval
}

fn apply_far(
    locality: &Locality,
    index: &LocalityIndex<'_>,
    alive: &mut [bool],
    eval: &mut Evaluation,
    lenient: bool,
) {
    if locality.far.is_empty() {
        return;
    }
    let mut hits: BTreeMap<usize, &str> = BTreeMap::new();
    for id in locality.far.iter() {
        for &pos in index.hosts(id) {
            if alive[pos] {
                hits.entry(pos).or_insert(id.as_str());
            }
        }
    }
    if hits.is_empty() {
        return;
    }

    let alive_count = alive.iter().filter(|a| **a).count();
    if lenient && hits.len() == alive_count {
        eval.ignored.push(format!(
            "exclude: inst!={} (ignored b/c non-strict)",
            locality.far.0.join(",")
        ));
        return;
    }
    for (pos, id) in hits {
        alive[pos] = false;
        eval.excluded.insert(pos, format!("exclude: inst!={id}"));
    }
}

fn apply_near(
    locality: &Locality,
    index: &LocalityIndex<'_>,
    alive: &mut [bool],
    eval: &mut Evaluation,
    lenient: bool,
) {
    if locality.near.is_empty() {
        return;
    }
    let wanted = locality.near.0.join(",");
    let matched: HashSet<usize> = locality
        .near
        .iter()
        .flat_map(|id| index.hosts(id).iter().copied())
        .filter(|&pos| alive[pos])
        .collect();

    if matched.is_empty() && lenient {
        eval.ignored.push(format!("exclude: inst==~{wanted} (ignored b/c non-strict)"));
        return;
    }
    for pos in 0..alive.len() {
        if alive[pos] && !matched.contains(&pos) {
            alive[pos] = false;
            eval.excluded.insert(pos, format!("include: inst==~{wanted}"));
        }
    }
}

fn apply_owner_spread(index: &LocalityIndex<'_>, alive: &mut [bool], eval: &mut Evaluation, lenient: bool) {
    let counts = || {
        index
            .owner_counts
            .iter()
            .enumerate()
            .filter(|&(pos, _)| alive[pos])
            .map(|(_, &count)| count)
    };
    let (Some(max), Some(min)) = (counts().max(), counts().min()) else {
        return;
    };
    if max == min {
        if lenient {
            eval.ignored.push("exclude: spread by owner (ignored b/c non-strict)".to_string());
        }
        return;
    }
    for (pos, &count) in index.owner_counts.iter().enumerate() {
        if alive[pos] && count == max {
            alive[pos] = false;
            eval.excluded.insert(pos, "exclude: spread by owner".to_string());
        }
    }
}

// ── Steps ─────────────────────────────────────────────────────────

/// Enforces locality for requests that ask for it strictly.
pub struct HardLocality;

impl Step for HardLocality {
    fn name(&self) -> &'static str {
        "Servers with requested hard locality considered"
    }

    fn run(&self, candidates: &[Candidate<'_>], ctx: &mut StepContext<'_>) -> Outcome {
        if !ctx.defaults.filter_strict_locality {
            return Outcome::keep_all(candidates.len(), Reasons::skip("Do not filter on strict locality"));
        }
        if !is_strict(ctx.vm) {
            return Outcome::keep_all(candidates.len(), Reasons::skip("No strict locality requested"));
        }

        let eval = evaluate(candidates, ctx.vm, false);
        if eval.excluded.is_empty() {
            return Outcome::keep_all(
                candidates.len(),
                Reasons::skip("Strict locality requested and no spreading needed"),
            );
        }
        eval.into_outcome(candidates)
    }
}

/// Applies locality as a preference that never empties the candidate set.
pub struct SoftLocality;

impl Step for SoftLocality {
    fn name(&self) -> &'static str {
        "Servers with requested soft locality considered"
    }

    fn run(&self, candidates: &[Candidate<'_>], ctx: &mut StepContext<'_>) -> Outcome {
        if is_strict(ctx.vm) && ctx.defaults.filter_strict_locality {
            return Outcome::keep_all(
                candidates.len(),
                Reasons::skip("Strict locality handled by hard locality filter"),
            );
        }
        let hinted = ctx.vm.locality.as_ref().is_some_and(|l| !l.is_empty());
        if !hinted && ctx.vm.owner_uuid.is_none() {
            return Outcome::keep_all(candidates.len(), Reasons::skip("No locality hints or owner to spread"));
        }
        evaluate(candidates, ctx.vm, true).into_outcome(candidates)
    }
}

fn is_strict(vm: &VmRequest) -> bool {
    vm.locality.as_ref().is_some_and(|l| l.strict)
}
