//! Agent Pool — keeps a fleet of named agents busy with long-running jobs.
//!
//! At most one job runs per agent identity, and the number of concurrent
//! jobs is held at a configured target, replacing each job as it finishes.

pub mod config;
pub mod error;
pub mod pool;
pub mod registry;
pub mod shutdown;
