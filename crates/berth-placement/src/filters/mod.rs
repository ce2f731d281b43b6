//! Hard filters. Each removes candidates and never touches scores.

mod capacity;
mod compat;
mod nic_tags;
mod platform;
mod pool;
mod status;
mod traits;
mod validity;

pub use capacity::{EnoughUnreserved, Resource};
pub use compat::{CpuCapParity, OverprovisionRatios, VmCount};
pub use nic_tags::NicTags;
pub use platform::{PlatformRequirements, compare_versions};
pub use pool::{LargeServers, OwnerManyZones};
pub use status::{NotHeadnode, NotReserved, Running, Setup};
pub use traits::MatchingTraits;
pub use validity::{Valid, validate_server};
