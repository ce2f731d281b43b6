//! Allocation orchestrator — runs the step pipeline and picks a winner.
//!
//! The allocator owns an ordered list of steps and the policy defaults. A
//! run prepares the candidates once, feeds them through every step in order,
//! checks each step's output against the step contract, and records a trace
//! entry per step. When a filter removes the last candidate the run stops
//! there. Otherwise the highest-scoring survivor wins, with exact ties
//! broken by the injected random source.

use std::collections::HashSet;
use std::time::Instant;

use berth_core::{AllocationRequest, Image, Package, PolicyDefaults, Server, ServerId, Ticket, VmRequest};
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::candidate::{Candidate, prepare};
use crate::error::{AllocationError, AllocationResult};
use crate::filters::{
    CpuCapParity, EnoughUnreserved, LargeServers, MatchingTraits, NicTags, NotHeadnode, NotReserved,
    OverprovisionRatios, OwnerManyZones, PlatformRequirements, Resource, Running, Setup, Valid, VmCount,
};
use crate::locality::{HardLocality, SoftLocality};
use crate::scorer::{Metric, WeightedScorer};
use crate::step::{Outcome, Reasons, Step, StepContext, Trace, TraceEntry};

/// Scores closer than this are tied.
const TIE_EPSILON: f64 = 1e-9;

/// The workload being placed.
#[derive(Debug, Clone, Copy)]
pub struct Workload<'r> {
    pub vm: &'r VmRequest,
    pub image: Option<&'r Image>,
    pub package: Option<&'r Package>,
}

/// Per-run knobs supplied by the caller.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Clock used for ticket expiry and reboot scoring.
    pub now: DateTime<Utc>,
    /// Checked between steps; the run is abandoned once it has passed.
    pub deadline: Option<Instant>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            now: Utc::now(),
            deadline: None,
        }
    }
}

/// A candidate that survived every filter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredServer {
    pub uuid: ServerId,
    pub score: f64,
    /// Position of the server in the snapshot.
    #[serde(skip)]
    pub index: usize,
}

/// Everything a pipeline run produced.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    /// Survivors in snapshot order. Empty when filtering exhausted the pool.
    pub remaining: Vec<ScoredServer>,
    /// Step that removed the last candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exhausted_at: Option<&'static str>,
    pub trace: Trace,
}

/// The winning server and how it got there.
#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    pub server: Server,
    pub score: f64,
    pub trace: Trace,
}

/// Runs the allocation pipeline.
pub struct Allocator {
    steps: Vec<Box<dyn Step>>,
    defaults: PolicyDefaults,
}

impl Allocator {
    /// An allocator running the standard pipeline.
    pub fn new(defaults: PolicyDefaults) -> Self {
        Self::with_steps(Self::default_steps(), defaults)
    }

    pub fn with_steps(steps: Vec<Box<dyn Step>>, defaults: PolicyDefaults) -> Self {
        Self { steps, defaults }
    }

    /// The standard pipeline, in trace order.
    pub fn default_steps() -> Vec<Box<dyn Step>> {
        vec![
            Box::new(Setup),
            Box::new(Running),
            Box::new(Valid),
            Box::new(NotReserved),
            Box::new(NicTags),
            Box::new(PlatformRequirements),
            Box::new(MatchingTraits),
            Box::new(NotHeadnode),
            Box::new(OverprovisionRatios),
            Box::new(CpuCapParity),
            Box::new(VmCount),
            Box::new(EnoughUnreserved::new(Resource::Ram)),
            Box::new(EnoughUnreserved::new(Resource::Cpu)),
            Box::new(EnoughUnreserved::new(Resource::Disk)),
            Box::new(HardLocality),
            Box::new(OwnerManyZones),
            Box::new(LargeServers),
            Box::new(SoftLocality),
            Box::new(WeightedScorer::new(Metric::UnreservedRam)),
            Box::new(WeightedScorer::new(Metric::UnreservedDisk)),
            Box::new(WeightedScorer::new(Metric::OwnerZones)),
            Box::new(WeightedScorer::new(Metric::Platform)),
            Box::new(WeightedScorer::new(Metric::NextReboot)),
            Box::new(WeightedScorer::new(Metric::Random)),
        ]
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn defaults(&self) -> &PolicyDefaults {
        &self.defaults
    }

    /// Validate a request, run the pipeline and select the winner.
    pub fn allocate(
        &self,
        request: &AllocationRequest,
        opts: RunOptions,
        rng: &mut dyn RngCore,
    ) -> AllocationResult<Allocation> {
        let vm = request
            .vm
            .as_ref()
            .ok_or_else(|| AllocationError::InvalidRequest("'vm' is required".into()))?;
        if request.servers.is_empty() {
            return Err(AllocationError::InvalidRequest("'servers' array is empty".into()));
        }
        if !vm.ram.is_some_and(|ram| ram.is_finite() && ram > 0.0) {
            return Err(AllocationError::InvalidRequest(
                "'vm.ram' must be a positive number of MiB".into(),
            ));
        }

        let workload = Workload {
            vm,
            image: request.image.as_ref(),
            package: request.package.as_ref(),
        };
        let run = self.run(&request.servers, workload, &request.tickets, opts, rng)?;

        let Some((index, score)) = select_winner(&run.remaining, rng).map(|w| (w.index, w.score)) else {
            return Err(AllocationError::Exhausted {
                step: run.exhausted_at,
                trace: run.trace,
            });
        };
        let server = request.servers[index].clone();
        info!(
            server = %server.uuid,
            score,
            candidates = run.remaining.len(),
            "server allocated"
        );
        Ok(Allocation {
            server,
            score,
            trace: run.trace,
        })
    }

    /// Run every step over the snapshot without selecting a winner.
    ///
    /// An empty snapshot is not an error: each step is recorded against the
    /// empty set without running, and the run reports no survivors.
    pub fn run(
        &self,
        servers: &[Server],
        workload: Workload<'_>,
        tickets: &[Ticket],
        opts: RunOptions,
        rng: &mut dyn RngCore,
    ) -> AllocationResult<PipelineRun> {
        let mut seen = HashSet::new();
        if let Some(dup) = servers
            .iter()
            .filter(|s| !s.uuid.is_empty())
            .find(|s| !seen.insert(s.uuid.as_str()))
        {
            return Err(AllocationError::InvalidRequest(format!(
                "duplicate server uuid \"{}\"",
                dup.uuid
            )));
        }

        let mut candidates = prepare(servers, tickets, &self.defaults, opts.now);
        let mut trace = Trace::with_capacity(self.steps.len());
        let mut exhausted_at = None;

        for step in &self.steps {
            let name = step.name();
            if opts.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!(step = name, "allocation deadline exceeded");
                return Err(AllocationError::DeadlineExceeded { step: name, trace });
            }

            if candidates.is_empty() {
                trace.push(TraceEntry {
                    step: name.to_string(),
                    remaining: Vec::new(),
                    reasons: Reasons::new(),
                });
                continue;
            }

            let before = candidates.len();
            let outcome = {
                let mut ctx = StepContext {
                    vm: workload.vm,
                    image: workload.image,
                    package: workload.package,
                    defaults: &self.defaults,
                    now: opts.now,
                    rng: &mut *rng,
                };
                step.run(&candidates, &mut ctx)
            };
            let reasons = match apply(&mut candidates, outcome) {
                Ok(reasons) => reasons,
                Err(detail) => {
                    error!(step = name, %detail, "step violated the step contract");
                    return Err(AllocationError::ContractViolation {
                        step: name,
                        detail,
                        trace,
                    });
                }
            };
            debug!(
                step = name,
                before,
                remaining = candidates.len(),
                skipped = reasons.skipped().is_some(),
                "step finished"
            );

            trace.push(TraceEntry {
                step: name.to_string(),
                remaining: candidates.iter().map(|c| c.id().to_string()).collect(),
                reasons,
            });

            if candidates.is_empty() {
                warn!(step = name, "no allocatable servers left");
                exhausted_at = Some(name);
                break;
            }
        }

        let remaining = candidates
            .iter()
            .map(|c| ScoredServer {
                uuid: c.id().to_string(),
                score: c.score,
                index: c.index,
            })
            .collect();
        Ok(PipelineRun {
            remaining,
            exhausted_at,
            trace,
        })
    }
}

/// Check a step's outcome against the step contract and apply it.
fn apply(candidates: &mut Vec<Candidate<'_>>, outcome: Outcome) -> Result<Reasons, String> {
    let n = candidates.len();
    match outcome {
        Outcome::Filter { kept, reasons } => {
            if kept.len() > n {
                return Err(format!("kept {} of {n} candidates", kept.len()));
            }
            let mut keep = vec![false; n];
            for i in kept {
                if i >= n {
                    return Err(format!("kept candidate {i} of {n}"));
                }
                if std::mem::replace(&mut keep[i], true) {
                    return Err(format!("kept candidate {i} twice"));
                }
            }
            for (candidate, &kept) in candidates.iter().zip(&keep) {
                let explained = reasons.server(candidate.id()).is_some();
                if !kept && !explained {
                    return Err(format!("removed {} without a reason", candidate.id()));
                }
                if kept && explained {
                    return Err(format!("gave a removal reason for retained {}", candidate.id()));
                }
            }
            let mut keep = keep.into_iter();
            candidates.retain(|_| keep.next().unwrap_or(false));
            Ok(reasons)
        }
        Outcome::Score { deltas, reasons } => {
            if deltas.len() != n {
                return Err(format!("scored {} of {n} candidates", deltas.len()));
            }
            if deltas.iter().any(|d| !d.is_finite()) {
                return Err("produced a non-finite score".to_string());
            }
            for (candidate, delta) in candidates.iter_mut().zip(deltas) {
                candidate.score += delta;
            }
            Ok(reasons)
        }
    }
}

/// The highest-scoring survivor; ties are broken uniformly at random.
pub fn select_winner<'s>(remaining: &'s [ScoredServer], rng: &mut dyn RngCore) -> Option<&'s ScoredServer> {
    let best = remaining.iter().map(|s| s.score).reduce(f64::max)?;
    let tied: Vec<&ScoredServer> = remaining
        .iter()
        .filter(|s| s.score >= best - TIE_EPSILON)
        .collect();
    tied.choose(rng).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, make_server};
    use berth_core::Lenient;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::time::Duration;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    fn request(servers: Vec<Server>) -> AllocationRequest {
        let fixture = Fixture::new();
        AllocationRequest {
            servers,
            vm: Some(fixture.vm),
            ..Default::default()
        }
    }

    fn opts() -> RunOptions {
        RunOptions {
            now: Fixture::new().now,
            deadline: None,
        }
    }

    /// A filter that misbehaves in a configurable way.
    struct Rogue(fn(usize) -> Outcome);

    impl Step for Rogue {
        fn name(&self) -> &'static str {
            "Rogue step"
        }

        fn run(&self, candidates: &[Candidate<'_>], _ctx: &mut StepContext<'_>) -> Outcome {
            (self.0)(candidates.len())
        }
    }

    fn run_rogue(outcome: fn(usize) -> Outcome) -> AllocationError {
        let allocator = Allocator::with_steps(vec![Box::new(Rogue(outcome))], PolicyDefaults::default());
        allocator
            .allocate(&request(vec![make_server("cn0"), make_server("cn1")]), opts(), &mut rng())
            .unwrap_err()
    }

    #[test]
    fn default_pipeline_has_stable_order() {
        let names = Allocator::new(PolicyDefaults::default()).step_names();
        assert_eq!(names.len(), 24);
        assert_eq!(names[0], "Servers which have been setup");
        assert_eq!(names[2], "Servers objects which are valid");
        assert_eq!(names[17], "Servers with requested soft locality considered");
        assert_eq!(names[23], "Increase server scores randomly");
    }

    #[test]
    fn single_server_accumulates_scores() {
        let allocator = Allocator::new(PolicyDefaults::default());
        let allocation = allocator
            .allocate(&request(vec![make_server("cn0")]), opts(), &mut rng())
            .unwrap();

        assert_eq!(allocation.server.uuid, "cn0");
        let jitter = allocation.score - 3.0;
        assert!((0.0..0.5).contains(&jitter));
        let reasons: Vec<Option<&str>> = allocation
            .trace
            .iter()
            .filter(|e| e.step.starts_with("Score") || e.step.starts_with("Increase"))
            .map(|e| e.reasons.server("cn0"))
            .collect();
        assert_eq!(
            reasons,
            [
                Some("increased score by 2.00 to 2.00"),
                Some("increased score by 1.00 to 3.00"),
                None,
                None,
                None,
                Some(format!("increased score by {jitter:.2} to {:.2}", allocation.score).as_str()),
            ]
        );
    }

    #[test]
    fn exhaustion_stops_the_pipeline() {
        let mut down = make_server("cn0");
        down.status = Lenient::Valid("unknown".into());
        let allocator = Allocator::new(PolicyDefaults::default());

        let err = allocator.allocate(&request(vec![down]), opts(), &mut rng()).unwrap_err();
        let AllocationError::Exhausted { step, trace } = err else {
            panic!("expected exhaustion, got {err:?}");
        };
        assert_eq!(step, Some("Servers which are currently running"));
        assert_eq!(trace.len(), 2);
        assert!(trace[1].remaining.is_empty());
        assert_eq!(trace[1].reasons.server("cn0"), Some("Server has status: unknown"));
    }

    #[test]
    fn empty_snapshot_runs_every_step_against_nothing() {
        let allocator = Allocator::new(PolicyDefaults::default());
        let vm = Fixture::new().vm;
        let workload = Workload {
            vm: &vm,
            image: None,
            package: None,
        };

        let run = allocator.run(&[], workload, &[], opts(), &mut rng()).unwrap();
        assert!(run.remaining.is_empty());
        assert_eq!(run.exhausted_at, None);
        assert_eq!(run.trace.len(), 24);
        assert!(run.trace.iter().all(|e| e.remaining.is_empty() && e.reasons.is_empty()));
    }

    #[test]
    fn boundary_rejects_unusable_requests() {
        let allocator = Allocator::new(PolicyDefaults::default());

        let err = allocator.allocate(&request(vec![]), opts(), &mut rng()).unwrap_err();
        assert!(matches!(err, AllocationError::InvalidRequest(_)));

        let mut no_ram = request(vec![make_server("cn0")]);
        if let Some(vm) = no_ram.vm.as_mut() {
            vm.ram = None;
        }
        let err = allocator.allocate(&no_ram, opts(), &mut rng()).unwrap_err();
        assert!(err.to_string().contains("vm.ram"));
        assert!(err.trace().is_none());

        let dup = request(vec![make_server("cn0"), make_server("cn0")]);
        let err = allocator.allocate(&dup, opts(), &mut rng()).unwrap_err();
        assert!(err.to_string().contains("duplicate server uuid"));
    }

    #[test]
    fn contract_violations_are_reported() {
        let err = run_rogue(|_| Outcome::Filter {
            kept: vec![],
            reasons: Reasons::new(),
        });
        assert!(matches!(err, AllocationError::ContractViolation { step: "Rogue step", .. }));
        assert!(err.to_string().contains("without a reason"));

        let err = run_rogue(|_| Outcome::Filter {
            kept: vec![0, 0],
            reasons: Reasons::new(),
        });
        assert!(err.to_string().contains("twice"));

        let err = run_rogue(|_| Outcome::Filter {
            kept: vec![0, 5],
            reasons: Reasons::new(),
        });
        assert!(err.to_string().contains("kept candidate 5"));

        let err = run_rogue(|n| {
            let mut reasons = Reasons::new();
            reasons.insert("cn0", "kept but blamed");
            Outcome::keep_all(n, reasons)
        });
        assert!(err.to_string().contains("retained cn0"));

        let err = run_rogue(|_| Outcome::Score {
            deltas: vec![1.0],
            reasons: Reasons::new(),
        });
        assert!(err.to_string().contains("scored 1 of 2"));

        let err = run_rogue(|n| Outcome::Score {
            deltas: vec![f64::NAN; n],
            reasons: Reasons::new(),
        });
        assert!(err.to_string().contains("non-finite"));
    }

    #[test]
    fn passed_deadline_abandons_the_run() {
        let allocator = Allocator::new(PolicyDefaults::default());
        let mut opts = opts();
        opts.deadline = Instant::now().checked_sub(Duration::from_millis(1));
        if opts.deadline.is_none() {
            return;
        }

        let err = allocator
            .allocate(&request(vec![make_server("cn0")]), opts, &mut rng())
            .unwrap_err();
        let AllocationError::DeadlineExceeded { step, trace } = err else {
            panic!("expected deadline, got {err:?}");
        };
        assert_eq!(step, "Servers which have been setup");
        assert!(trace.is_empty());
    }

    #[test]
    fn ties_are_broken_randomly_among_the_best() {
        let remaining = vec![
            ScoredServer { uuid: "a".into(), score: 2.0, index: 0 },
            ScoredServer { uuid: "b".into(), score: 3.0, index: 1 },
            ScoredServer { uuid: "c".into(), score: 3.0, index: 2 },
        ];
        let mut rng = rng();
        let mut picked = HashSet::new();
        for _ in 0..64 {
            let winner = select_winner(&remaining, &mut rng).unwrap();
            picked.insert(winner.uuid.clone());
        }
        assert_eq!(picked, HashSet::from(["b".to_string(), "c".to_string()]));
        assert!(select_winner(&[], &mut rng).is_none());
    }

    #[test]
    fn without_jitter_higher_capacity_wins_deterministically() {
        let mut small = make_server("small");
        small.memory_total_bytes = Lenient::Valid(8192.0 * berth_core::MIB);
        let servers = vec![small, make_server("big")];
        let defaults = PolicyDefaults {
            weight_uniform_random: 0.0,
            ..Default::default()
        };
        let allocator = Allocator::new(defaults);

        for seed in 0..8 {
            let allocation = allocator
                .allocate(&request(servers.clone()), opts(), &mut StdRng::seed_from_u64(seed))
                .unwrap();
            assert_eq!(allocation.server.uuid, "big");
        }
    }
}
