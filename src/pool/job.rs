//! Job handles, outcomes and run summaries.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::JobError;
use crate::registry::Identity;

/// One in-flight execution bound to exactly one identity.
#[derive(Debug, Clone, Serialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub identity: Identity,
    pub started_at: DateTime<Utc>,
}

impl JobHandle {
    pub fn new(identity: Identity) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            started_at: Utc::now(),
        }
    }

    /// Wall-clock time since the job started.
    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed { reason: String },
    TimedOut { after: Duration },
    Panicked { reason: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl From<Result<(), JobError>> for JobOutcome {
    fn from(result: Result<(), JobError>) -> Self {
        match result {
            Ok(()) => Self::Succeeded,
            Err(JobError::TimedOut { timeout, .. }) => Self::TimedOut { after: timeout },
            Err(e) => Self::Failed {
                reason: e.to_string(),
            },
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::TimedOut { after } => write!(f, "timed out after {after:?}"),
            Self::Panicked { reason } => write!(f, "panicked: {reason}"),
        }
    }
}

/// Phase of a scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPhase {
    /// Launching the initial jobs with a stagger between them.
    Filling,
    /// Replacing every completed job.
    Steady,
    /// Stop requested; waiting for in-flight jobs to finish.
    Draining,
    /// Run is over.
    Terminal,
}

impl fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Filling => "filling",
            Self::Steady => "steady",
            Self::Draining => "draining",
            Self::Terminal => "terminal",
        };
        write!(f, "{s}")
    }
}

/// Counters for one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    pub launched: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Highest number of simultaneously live jobs.
    pub peak_active: usize,
    /// Whether the run ended because of an external stop request.
    pub cancelled: bool,
}

impl PoolSummary {
    pub(crate) fn record(&mut self, outcome: &JobOutcome) {
        if outcome.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }
}
