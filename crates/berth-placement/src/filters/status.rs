//! Lifecycle filters: setup, running, reserved and headnode servers.

use berth_core::Lenient;

use crate::candidate::Candidate;
use crate::step::{Outcome, Reasons, Step, StepContext};

/// Removes servers that have not completed setup.
pub struct Setup;

impl Step for Setup {
    fn name(&self) -> &'static str {
        "Servers which have been setup"
    }

    fn run(&self, candidates: &[Candidate<'_>], _ctx: &mut StepContext<'_>) -> Outcome {
        Outcome::partition(candidates, |c| {
            (!c.server.is_setup()).then(|| "Server has not been setup".to_string())
        })
    }
}

/// Removes servers whose runtime status is not `running`. A status that is
/// not a string is left for the validity filter to report.
pub struct Running;

impl Step for Running {
    fn name(&self) -> &'static str {
        "Servers which are currently running"
    }

    fn run(&self, candidates: &[Candidate<'_>], _ctx: &mut StepContext<'_>) -> Outcome {
        Outcome::partition(candidates, |c| match &c.server.status {
            Lenient::Valid(status) if status == "running" => None,
            Lenient::Valid(status) => Some(format!("Server has status: {status}")),
            Lenient::Missing => Some("Server has no status".to_string()),
            Lenient::Malformed(_) => None,
        })
    }
}

/// Removes servers an operator has reserved.
pub struct NotReserved;

impl Step for NotReserved {
    fn name(&self) -> &'static str {
        "Servers which are not reserved"
    }

    fn run(&self, candidates: &[Candidate<'_>], ctx: &mut StepContext<'_>) -> Outcome {
        if !ctx.defaults.filter_reserved {
            return Outcome::keep_all(candidates.len(), Reasons::skip("Do not filter out reserved servers"));
        }
        Outcome::partition(candidates, |c| {
            c.server.is_reserved().then(|| "Server is reserved".to_string())
        })
    }
}

/// Removes headnodes.
pub struct NotHeadnode;

impl Step for NotHeadnode {
    fn name(&self) -> &'static str {
        "Servers which are not headnodes"
    }

    fn run(&self, candidates: &[Candidate<'_>], ctx: &mut StepContext<'_>) -> Outcome {
        if !ctx.defaults.filter_headnode {
            return Outcome::keep_all(candidates.len(), Reasons::skip("Do not filter out headnodes"));
        }
        Outcome::partition(candidates, |c| {
            c.server.is_headnode().then(|| "Server is a headnode".to_string())
        })
    }
}
