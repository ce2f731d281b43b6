//! berth-placement — the allocation pipeline.
//!
//! Chooses one server for one VM from a cluster snapshot by running an
//! ordered list of [`Step`]s:
//! - **Filters** remove servers that cannot or should not host the VM
//!   (lifecycle, validity, NIC tags, platform, traits, capacity, locality)
//! - **Scorers** rank the survivors by free capacity, owner spread, platform
//!   age, reboot schedule and a random jitter
//!
//! Every run returns a [`Trace`] recording what each step kept and why.

pub mod allocator;
pub mod candidate;
pub mod error;
pub mod filters;
pub mod locality;
pub mod scorer;
pub mod step;

#[cfg(test)]
mod testing;

pub use allocator::{Allocation, Allocator, PipelineRun, RunOptions, ScoredServer, Workload, select_winner};
pub use candidate::{Candidate, Unreserved};
pub use error::{AllocationError, AllocationResult};
pub use step::{Outcome, ReasonKey, Reasons, Step, StepContext, Trace, TraceEntry};
