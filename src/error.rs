//! Error types for the agent pool.

use std::time::Duration;

/// Top-level error type for the pool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors that abort a whole pool run.
///
/// Everything that happens after startup is absorbed by the scheduler and
/// reported through observers instead.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No eligible identities available at startup ({source_name})")]
    NoEligibleIdentities { source_name: String },

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Identity source unavailable at startup: {0}")]
    Source(#[from] SourceError),
}

/// Failure of a single executor invocation.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job for {identity} failed to spawn: {reason}")]
    Spawn { identity: String, reason: String },

    #[error("Job for {identity} exited with {}", exit_label(.code))]
    NonZeroExit { identity: String, code: Option<i32> },

    #[error("Job for {identity} timed out after {timeout:?}")]
    TimedOut { identity: String, timeout: Duration },

    #[error("Job for {identity} failed: {reason}")]
    Failed { identity: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity source errors. Fatal at startup; afterwards the scheduler logs
/// them and backs off.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to scan descriptor directory {path}: {reason}")]
    Scan { path: String, reason: String },

    #[error("Invalid identity {name:?}: {reason}")]
    InvalidIdentity { name: String, reason: String },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (terminated by signal)".to_string(),
    }
}

/// Result type alias for the pool.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_zero_exit_formats_code() {
        let err = JobError::NonZeroExit {
            identity: "writer".to_string(),
            code: Some(2),
        };
        assert_eq!(err.to_string(), "Job for writer exited with status 2");
    }

    #[test]
    fn non_zero_exit_without_code_mentions_signal() {
        let err = JobError::NonZeroExit {
            identity: "writer".to_string(),
            code: None,
        };
        assert!(err.to_string().contains("signal"));
    }

    #[test]
    fn pool_error_converts_into_top_level() {
        let err: Error = PoolError::NoEligibleIdentities {
            source_name: "static".to_string(),
        }
        .into();
        assert!(matches!(err, Error::Pool(_)));
    }

    #[test]
    fn config_error_converts_into_pool_error() {
        let err: PoolError = ConfigError::InvalidValue {
            key: "target".to_string(),
            message: "pool target must be at least 1".to_string(),
        }
        .into();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
        assert!(err.to_string().contains("target"));
    }
}
