//! Lifecycle observers.
//!
//! Observers only receive events; nothing they do feeds back into the
//! scheduler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::pool::job::{JobOutcome, PoolPhase};
use crate::registry::Identity;

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Receives pool lifecycle events.
pub trait PoolObserver: Send + Sync {
    fn job_started(&self, identity: &Identity, at: DateTime<Utc>);

    fn job_finished(&self, identity: &Identity, duration: Duration, outcome: &JobOutcome);

    fn pool_state(&self, active: usize, target: usize);

    /// Scheduler moved from one phase to the next.
    fn phase_changed(&self, _from: PoolPhase, _to: PoolPhase) {}
}

/// Lifecycle event, as forwarded by [`BroadcastObserver`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    JobStarted {
        identity: Identity,
        at: DateTime<Utc>,
    },
    JobFinished {
        identity: Identity,
        duration_ms: u64,
        outcome: JobOutcome,
    },
    PoolState {
        active: usize,
        target: usize,
    },
    PhaseChanged {
        from: PoolPhase,
        to: PoolPhase,
    },
}

/// Per-identity counters kept by [`TracingObserver`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityStats {
    pub runs: u64,
    pub failures: u64,
}

/// Logs every event through `tracing` and keeps per-identity run/failure
/// counts, which only ever increase.
#[derive(Debug, Default)]
pub struct TracingObserver {
    stats: Mutex<HashMap<Identity, IdentityStats>>,
}

impl TracingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self, identity: &Identity) -> IdentityStats {
        self.stats
            .lock()
            .map(|stats| stats.get(identity).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn failures(&self, identity: &Identity) -> u64 {
        self.stats(identity).failures
    }

    pub fn runs(&self, identity: &Identity) -> u64 {
        self.stats(identity).runs
    }

    fn bump(&self, identity: &Identity, failed: bool) -> IdentityStats {
        let Ok(mut stats) = self.stats.lock() else {
            return IdentityStats::default();
        };
        let entry = stats.entry(identity.clone()).or_default();
        entry.runs += 1;
        if failed {
            entry.failures += 1;
        }
        *entry
    }
}

impl PoolObserver for TracingObserver {
    fn job_started(&self, identity: &Identity, at: DateTime<Utc>) {
        info!(identity = %identity, started_at = %at.to_rfc3339(), "Agent starting cycle");
    }

    fn job_finished(&self, identity: &Identity, duration: Duration, outcome: &JobOutcome) {
        let stats = self.bump(identity, !outcome.is_success());
        let secs = format!("{:.2}", duration.as_secs_f64());
        match outcome {
            JobOutcome::Succeeded => info!(
                identity = %identity,
                duration_secs = %secs,
                runs = stats.runs,
                "Agent completed cycle"
            ),
            JobOutcome::Panicked { .. } => error!(
                identity = %identity,
                duration_secs = %secs,
                failures = stats.failures,
                outcome = %outcome,
                "Agent task panicked"
            ),
            _ => warn!(
                identity = %identity,
                duration_secs = %secs,
                failures = stats.failures,
                outcome = %outcome,
                "Agent cycle failed"
            ),
        }
    }

    fn pool_state(&self, active: usize, target: usize) {
        info!(active, target, "Active agents: {}/{}", active, target);
    }

    fn phase_changed(&self, from: PoolPhase, to: PoolPhase) {
        info!(from = %from, to = %to, "Pool is now {}", to);
    }
}

/// Forwards events to any number of subscribers. Sends with no subscriber
/// are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastObserver {
    tx: broadcast::Sender<PoolEvent>,
}

impl BroadcastObserver {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for BroadcastObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolObserver for BroadcastObserver {
    fn job_started(&self, identity: &Identity, at: DateTime<Utc>) {
        self.emit(PoolEvent::JobStarted {
            identity: identity.clone(),
            at,
        });
    }

    fn job_finished(&self, identity: &Identity, duration: Duration, outcome: &JobOutcome) {
        self.emit(PoolEvent::JobFinished {
            identity: identity.clone(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            outcome: outcome.clone(),
        });
    }

    fn pool_state(&self, active: usize, target: usize) {
        self.emit(PoolEvent::PoolState { active, target });
    }

    fn phase_changed(&self, from: PoolPhase, to: PoolPhase) {
        self.emit(PoolEvent::PhaseChanged { from, to });
    }
}

/// Fans every event out to several observers, in insertion order.
#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn PoolObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn PoolObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn push(&mut self, observer: Arc<dyn PoolObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl PoolObserver for ObserverSet {
    fn job_started(&self, identity: &Identity, at: DateTime<Utc>) {
        for observer in &self.observers {
            observer.job_started(identity, at);
        }
    }

    fn job_finished(&self, identity: &Identity, duration: Duration, outcome: &JobOutcome) {
        for observer in &self.observers {
            observer.job_finished(identity, duration, outcome);
        }
    }

    fn pool_state(&self, active: usize, target: usize) {
        for observer in &self.observers {
            observer.pool_state(active, target);
        }
    }

    fn phase_changed(&self, from: PoolPhase, to: PoolPhase) {
        for observer in &self.observers {
            observer.phase_changed(from, to);
        }
    }
}
