pub mod allocate;
pub mod policy;
