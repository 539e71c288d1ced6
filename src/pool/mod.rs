//! Agent pool — keeps a target number of jobs running across identities.
//!
//! Core components:
//! - `executor` — runs one job for an identity (trait + shell command executor)
//! - `observer` — lifecycle event sinks (tracing, broadcast, fan-out)
//! - `job` — job handles, outcomes, phases and run summaries
//! - `scheduler` — the fill/steady/drain loop

pub mod executor;
pub mod job;
pub mod observer;
pub mod scheduler;

pub use executor::{CommandExecutor, Executor};
pub use job::{JobHandle, JobOutcome, PoolPhase, PoolSummary};
pub use observer::{BroadcastObserver, ObserverSet, PoolEvent, PoolObserver, TracingObserver};
pub use scheduler::PoolScheduler;
