//! Pool scheduler — keeps N jobs running and replaces each one as it ends.
//!
//! A run moves through `Filling` (initial launches, staggered), `Steady`
//! (wait for the first completion, check the identity back in, refill) and
//! `Draining` (stop requested, wait for in-flight jobs) before it ends.
//!
//! Jobs run as independent tokio tasks in a `JoinSet`. The coordinator is the
//! only code that launches jobs or observes their completion, so the live-job
//! map is touched at exactly two points: launch and completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::pool::executor::Executor;
use crate::pool::job::{JobHandle, JobOutcome, PoolPhase, PoolSummary};
use crate::pool::observer::PoolObserver;
use crate::registry::{Identity, IdentityRegistry, IdentitySource};

/// What woke the coordinator up.
enum Wake {
    Cancelled,
    Joined(Option<Result<(task::Id, JobOutcome), JoinError>>),
    IdleRetry,
}

/// Why a refill is being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefillTrigger {
    /// A job just completed and freed a slot.
    Completion,
    /// Periodic retry while the pool is below target.
    Idle,
}

/// Live jobs owned by one run.
#[derive(Default)]
struct LiveJobs {
    tasks: JoinSet<JobOutcome>,
    handles: HashMap<task::Id, JobHandle>,
}

impl LiveJobs {
    fn len(&self) -> usize {
        self.handles.len()
    }

    fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Mutable state of a single `run` call.
struct PoolRun {
    phase: PoolPhase,
    jobs: LiveJobs,
    summary: PoolSummary,
}

/// Drives the target concurrency over an identity registry.
pub struct PoolScheduler {
    config: PoolConfig,
    registry: Arc<IdentityRegistry>,
    executor: Arc<dyn Executor>,
    observer: Arc<dyn PoolObserver>,
}

impl PoolScheduler {
    pub fn new(
        config: PoolConfig,
        registry: Arc<IdentityRegistry>,
        executor: Arc<dyn Executor>,
        observer: Arc<dyn PoolObserver>,
    ) -> Self {
        Self {
            config,
            registry,
            executor,
            observer,
        }
    }

    /// Build a scheduler with a fresh registry over `source`, using the
    /// configured selection policy.
    pub fn from_source(
        config: PoolConfig,
        source: Arc<dyn IdentitySource>,
        executor: Arc<dyn Executor>,
        observer: Arc<dyn PoolObserver>,
    ) -> Self {
        let registry = Arc::new(IdentityRegistry::with_policy(source, config.selection));
        Self::new(config, registry, executor, observer)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    /// Run the pool until no identity remains eligible or `cancel` fires.
    ///
    /// Cancellation stops new launches and waits for every in-flight job to
    /// finish on its own; jobs are never aborted. Errors are only returned
    /// before the first launch: invalid configuration, an unreadable identity
    /// source, or an empty eligible set.
    pub async fn run(&self, cancel: CancellationToken) -> Result<PoolSummary, PoolError> {
        self.config.validate()?;
        let target = self.config.target;
        let eligible = self.registry.try_list_eligible().await.inspect_err(|e| {
            error!(source = %self.registry.source_name(), error = %e, "Cannot read identity source");
        })?;
        if eligible.is_empty() {
            error!(source = %self.registry.source_name(), "No eligible identities, nothing to run");
            return Err(PoolError::NoEligibleIdentities {
                source_name: self.registry.source_name().to_string(),
            });
        }

        if target > eligible.len() {
            warn!(
                target,
                available = eligible.len(),
                "Pool target cannot be fully met, running with fewer agents"
            );
        }
        info!(
            target,
            available = eligible.len(),
            "Starting with {} agents in parallel",
            target.min(eligible.len())
        );

        let mut run = PoolRun {
            phase: PoolPhase::Filling,
            jobs: LiveJobs::default(),
            summary: PoolSummary::default(),
        };

        self.fill(&mut run, target.min(eligible.len()), &cancel).await;
        self.set_phase(&mut run, PoolPhase::Steady);
        self.steady(&mut run, &cancel).await;
        self.set_phase(&mut run, PoolPhase::Terminal);

        run.summary.cancelled = cancel.is_cancelled();
        info!(
            launched = run.summary.launched,
            succeeded = run.summary.succeeded,
            failed = run.summary.failed,
            peak_active = run.summary.peak_active,
            cancelled = run.summary.cancelled,
            "Pool stopped"
        );
        Ok(run.summary)
    }

    /// Launch up to `count` jobs, staggering the starts.
    async fn fill(&self, run: &mut PoolRun, count: usize, cancel: &CancellationToken) {
        for n in 0..count {
            if n > 0 && !self.pause(self.config.stagger_delay, cancel).await {
                break;
            }
            if cancel.is_cancelled() {
                break;
            }
            if self.launch(run).await.is_none() {
                debug!(launched = n, "No free identity while filling, backing off");
                self.pause(self.config.idle_backoff, cancel).await;
                break;
            }
        }
        self.observer.pool_state(run.jobs.len(), self.config.target);
    }

    /// Wait for completions and keep the pool topped up until it empties.
    async fn steady(&self, run: &mut PoolRun, cancel: &CancellationToken) {
        loop {
            if cancel.is_cancelled() && run.phase != PoolPhase::Draining {
                info!(in_flight = run.jobs.len(), "Stop requested, draining in-flight agents");
                self.set_phase(run, PoolPhase::Draining);
            }
            let draining = run.phase == PoolPhase::Draining;

            if run.jobs.is_empty() {
                if draining {
                    return;
                }
                match self.registry.try_list_eligible().await {
                    Ok(eligible) if eligible.is_empty() => {
                        info!("No eligible identities remain, stopping pool");
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Identity source unavailable, backing off");
                        self.pause(self.config.idle_backoff, cancel).await;
                        continue;
                    }
                }
                if self.pause(self.config.idle_backoff, cancel).await {
                    self.refill(run, cancel, RefillTrigger::Idle).await;
                }
                continue;
            }

            let idle_retry = !draining && run.jobs.len() < self.config.target;
            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !draining => Wake::Cancelled,
                joined = run.jobs.tasks.join_next_with_id() => Wake::Joined(joined),
                _ = tokio::time::sleep(self.config.idle_backoff), if idle_retry => Wake::IdleRetry,
            };

            match wake {
                Wake::Cancelled | Wake::Joined(None) => {}
                Wake::Joined(Some(joined)) => {
                    self.complete(run, joined).await;
                    if !draining && !cancel.is_cancelled() {
                        self.refill(run, cancel, RefillTrigger::Completion).await;
                    }
                }
                Wake::IdleRetry => self.refill(run, cancel, RefillTrigger::Idle).await,
            }
        }
    }

    /// Check out an identity and spawn its job. `None` when nothing is free.
    async fn launch(&self, run: &mut PoolRun) -> Option<Identity> {
        let identity = self.registry.checkout().await?;
        let handle = JobHandle::new(identity.clone());
        self.observer.job_started(&identity, handle.started_at);

        let executor = Arc::clone(&self.executor);
        let timeout = self.config.job_timeout;
        let job_identity = identity.clone();
        let abort = run.jobs.tasks.spawn(async move {
            let result = match timeout {
                Some(limit) => executor.run_with_timeout(&job_identity, limit).await,
                None => executor.run(&job_identity).await,
            };
            JobOutcome::from(result)
        });

        debug!(identity = %identity, job_id = %handle.id, "Launched job");
        run.jobs.handles.insert(abort.id(), handle);
        run.summary.launched += 1;
        run.summary.peak_active = run.summary.peak_active.max(run.jobs.len());
        Some(identity)
    }

    /// Record a finished job and release its identity.
    async fn complete(&self, run: &mut PoolRun, joined: Result<(task::Id, JobOutcome), JoinError>) {
        let (task_id, outcome) = match joined {
            Ok(finished) => finished,
            Err(e) => (e.id(), JobOutcome::Panicked { reason: join_failure(e) }),
        };

        let Some(handle) = run.jobs.handles.remove(&task_id) else {
            warn!(task_id = %task_id, "Completion for unknown job task");
            return;
        };

        self.observer
            .job_finished(&handle.identity, handle.elapsed(), &outcome);
        run.summary.record(&outcome);
        self.registry.checkin(&handle.identity).await;
    }

    /// Launch replacements until the pool is back at target or no identity
    /// is free.
    async fn refill(&self, run: &mut PoolRun, cancel: &CancellationToken, trigger: RefillTrigger) {
        let target = self.config.target;
        let eligible = self.registry.list_eligible().await;
        let mut launched = 0usize;

        while run.jobs.len() < target {
            let busy = self.registry.busy().await;
            let free = eligible.iter().filter(|id| !busy.contains(*id)).count();
            let replaced = if free == 0 {
                None
            } else if !self.pause(self.config.settle_delay, cancel).await {
                return;
            } else {
                self.launch(run).await
            };

            match replaced {
                Some(identity) => {
                    launched += 1;
                    info!(
                        identity = %identity,
                        active = run.jobs.len(),
                        target,
                        "Replaced completed agent. Active agents: {}/{}",
                        run.jobs.len(),
                        target
                    );
                }
                None if trigger == RefillTrigger::Completion => {
                    warn!(
                        active = run.jobs.len(),
                        target,
                        available = eligible.len(),
                        "Could not replace agent, running below target"
                    );
                    break;
                }
                None => {
                    debug!(
                        active = run.jobs.len(),
                        target,
                        available = eligible.len(),
                        "Still no free identity"
                    );
                    break;
                }
            }
        }

        if launched > 0 || trigger == RefillTrigger::Completion {
            self.observer.pool_state(run.jobs.len(), target);
        }
    }

    /// Sleep for `delay` unless `cancel` fires first. Returns `false` if
    /// cancelled.
    async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        if delay.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn set_phase(&self, run: &mut PoolRun, phase: PoolPhase) {
        if run.phase != phase {
            debug!(from = %run.phase, to = %phase, "Pool phase transition");
            self.observer.phase_changed(run.phase, phase);
            run.phase = phase;
        }
    }
}

fn join_failure(err: JoinError) -> String {
    if err.is_cancelled() {
        return "job task was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
