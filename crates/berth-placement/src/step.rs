//! The pipeline step contract.
//!
//! A step looks at the current candidates and either narrows them (a
//! filter) or adjusts their scores (a scorer). Either way it explains itself
//! through a [`Reasons`] map that ends up in the trace under the step's
//! stable name. Absent data is never a fault: a step that cannot do its job
//! says so with a `skip` reason or excludes the affected candidates.

use std::collections::BTreeMap;

use berth_core::{Image, Package, PolicyDefaults, ServerId, VmRequest};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Serialize, Serializer};

use crate::candidate::Candidate;

// ── Reasons ───────────────────────────────────────────────────────

/// Key of a [`Reasons`] entry.
///
/// `All` and `Skip` are sentinels, kept apart from server identifiers so a
/// server can never collide with them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReasonKey {
    /// Applies identically to every remaining candidate (`"*"`).
    All,
    /// The step was a no-op (`"skip"`).
    Skip,
    Server(ServerId),
}

impl std::fmt::Display for ReasonKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReasonKey::All => f.write_str("*"),
            ReasonKey::Skip => f.write_str("skip"),
            ReasonKey::Server(id) => f.write_str(id),
        }
    }
}

impl Serialize for ReasonKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Human-readable explanations produced by one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Reasons(BTreeMap<ReasonKey, String>);

impl Reasons {
    pub fn new() -> Self {
        Self::default()
    }

    /// A map holding only a `skip` reason.
    pub fn skip(reason: impl Into<String>) -> Self {
        let mut reasons = Self::new();
        reasons.0.insert(ReasonKey::Skip, reason.into());
        reasons
    }

    /// Record a reason for one server.
    pub fn insert(&mut self, server: impl Into<ServerId>, reason: impl Into<String>) {
        self.0.insert(ReasonKey::Server(server.into()), reason.into());
    }

    /// Record a reason that applies to all remaining candidates. Repeated
    /// calls are joined with `"; "`.
    pub fn insert_all(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.0
            .entry(ReasonKey::All)
            .and_modify(|existing| {
                existing.push_str("; ");
                existing.push_str(&reason);
            })
            .or_insert(reason);
    }

    pub fn server(&self, id: &str) -> Option<&str> {
        self.0.get(&ReasonKey::Server(id.to_string())).map(String::as_str)
    }

    pub fn skipped(&self) -> Option<&str> {
        self.0.get(&ReasonKey::Skip).map(String::as_str)
    }

    pub fn all(&self) -> Option<&str> {
        self.0.get(&ReasonKey::All).map(String::as_str)
    }

    /// Identifiers of the servers that carry a reason.
    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.0.keys().filter_map(|key| match key {
            ReasonKey::Server(id) => Some(id.as_str()),
            _ => None,
        })
    }

    /// All entries: the `"*"` reason, then `skip`, then servers by identifier.
    pub fn iter(&self) -> impl Iterator<Item = (&ReasonKey, &str)> {
        self.0.iter().map(|(key, reason)| (key, reason.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

// ── Trace ─────────────────────────────────────────────────────────

/// What one step left behind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
    pub step: String,
    pub remaining: Vec<ServerId>,
    #[serde(skip_serializing_if = "Reasons::is_empty")]
    pub reasons: Reasons,
}

/// The ordered audit record of one run.
pub type Trace = Vec<TraceEntry>;

// ── Step ──────────────────────────────────────────────────────────

/// Everything a step may consult besides the candidates themselves.
pub struct StepContext<'r> {
    pub vm: &'r VmRequest,
    pub image: Option<&'r Image>,
    pub package: Option<&'r Package>,
    pub defaults: &'r PolicyDefaults,
    /// Clock of the run; steps never read the system time.
    pub now: DateTime<Utc>,
    pub rng: &'r mut dyn RngCore,
}

/// Result of running one step.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Positions (into the step's input) of the candidates that survive, and
    /// a reason for every candidate that does not.
    Filter { kept: Vec<usize>, reasons: Reasons },
    /// Score change for each input candidate, in input order.
    Score { deltas: Vec<f64>, reasons: Reasons },
}

impl Outcome {
    /// A filter that keeps everything.
    pub fn keep_all(len: usize, reasons: Reasons) -> Self {
        Outcome::Filter {
            kept: (0..len).collect(),
            reasons,
        }
    }

    /// A scorer that changes nothing.
    pub fn unscored(len: usize, reasons: Reasons) -> Self {
        Outcome::Score {
            deltas: vec![0.0; len],
            reasons,
        }
    }

    /// Filter candidates with a predicate returning the exclusion reason.
    pub fn partition<F>(candidates: &[Candidate<'_>], mut exclude: F) -> Self
    where
        F: FnMut(&Candidate<'_>) -> Option<String>,
    {
        let mut kept = Vec::with_capacity(candidates.len());
        let mut reasons = Reasons::new();
        for (pos, candidate) in candidates.iter().enumerate() {
            match exclude(candidate) {
                Some(reason) => reasons.insert(candidate.id(), reason),
                None => kept.push(pos),
            }
        }
        Outcome::Filter { kept, reasons }
    }

    pub fn reasons(&self) -> &Reasons {
        match self {
            Outcome::Filter { reasons, .. } | Outcome::Score { reasons, .. } => reasons,
        }
    }
}

/// One stage of the allocation pipeline.
pub trait Step: Send + Sync {
    /// Stable name recorded verbatim in the trace.
    fn name(&self) -> &'static str;

    fn run(&self, candidates: &[Candidate<'_>], ctx: &mut StepContext<'_>) -> Outcome;
}
