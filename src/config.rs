//! Configuration types.
//!
//! Every config struct has a `Default` matching the values the pool ships
//! with and a `from_env()` loader that overrides fields from `AGENT_POOL_*`
//! environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::registry::SelectionPolicy;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Desired number of concurrently running jobs.
    pub target: usize,
    /// Pause between successive launches while filling the pool.
    pub stagger_delay: Duration,
    /// Pause after a checkout found no free identity.
    pub idle_backoff: Duration,
    /// Pause before launching a replacement job.
    pub settle_delay: Duration,
    /// Optional upper bound on a single job's wall-clock time.
    pub job_timeout: Option<Duration>,
    /// How the registry picks among free identities.
    pub selection: SelectionPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target: 10,
            stagger_delay: Duration::from_secs(10),
            idle_backoff: Duration::from_secs(1),
            settle_delay: Duration::from_secs(3),
            job_timeout: None,
            selection: SelectionPolicy::Random,
        }
    }
}

impl PoolConfig {
    /// Load from environment, falling back to defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            target: env_parse("AGENT_POOL_TARGET")?.unwrap_or(defaults.target),
            stagger_delay: env_secs("AGENT_POOL_STAGGER_SECS")?.unwrap_or(defaults.stagger_delay),
            idle_backoff: env_secs("AGENT_POOL_IDLE_BACKOFF_SECS")?
                .unwrap_or(defaults.idle_backoff),
            settle_delay: env_secs("AGENT_POOL_SETTLE_SECS")?.unwrap_or(defaults.settle_delay),
            job_timeout: env_secs("AGENT_POOL_JOB_TIMEOUT_SECS")?,
            selection: env_parse("AGENT_POOL_SELECTION")?.unwrap_or(defaults.selection),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target == 0 {
            return Err(ConfigError::InvalidValue {
                key: "target".to_string(),
                message: "pool target must be at least 1".to_string(),
            });
        }
        if self.idle_backoff.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "idle_backoff".to_string(),
                message: "idle backoff must be positive".to_string(),
            });
        }
        if self.job_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                key: "job_timeout".to_string(),
                message: "job timeout must be positive when set".to_string(),
            });
        }
        Ok(())
    }
}

/// Where eligible identities come from.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Directory scanned for descriptor files.
    pub descriptor_dir: PathBuf,
    /// File name prefix in front of the identity.
    pub prefix: String,
    /// File name suffix after the identity.
    pub suffix: String,
    /// Restrict eligibility to these identities (empty = no restriction).
    pub allowlist: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            descriptor_dir: PathBuf::from("."),
            prefix: ".aider.agent.".to_string(),
            suffix: ".md".to_string(),
            allowlist: Vec::new(),
        }
    }
}

impl SourceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            descriptor_dir: std::env::var("AGENT_POOL_DESCRIPTOR_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.descriptor_dir),
            prefix: std::env::var("AGENT_POOL_DESCRIPTOR_PREFIX").unwrap_or(defaults.prefix),
            suffix: std::env::var("AGENT_POOL_DESCRIPTOR_SUFFIX").unwrap_or(defaults.suffix),
            allowlist: std::env::var("AGENT_POOL_IDENTITIES")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// Shell command run once per job.
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Command template; `{identity}` is replaced by the checked-out identity.
    pub command: String,
    /// Working directory for the command.
    pub workdir: PathBuf,
    /// Directory holding one `<identity>.log` per identity.
    pub log_dir: PathBuf,
}

impl CommandConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            workdir: PathBuf::from("."),
            log_dir: PathBuf::from(".agent-pool/logs"),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let command = std::env::var("AGENT_POOL_COMMAND")
            .map_err(|_| ConfigError::MissingEnvVar("AGENT_POOL_COMMAND".to_string()))?;
        if command.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "AGENT_POOL_COMMAND".to_string(),
                message: "command must not be empty".to_string(),
            });
        }

        let mut config = Self::new(command);
        if let Ok(workdir) = std::env::var("AGENT_POOL_WORKDIR") {
            config.workdir = PathBuf::from(workdir);
        }
        if let Ok(log_dir) = std::env::var("AGENT_POOL_LOG_DIR") {
            config.log_dir = PathBuf::from(log_dir);
        }
        Ok(config)
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_secs))
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_standard_pacing() {
        let config = PoolConfig::default();
        assert_eq!(config.target, 10);
        assert_eq!(config.stagger_delay, Duration::from_secs(10));
        assert_eq!(config.settle_delay, Duration::from_secs(3));
        assert_eq!(config.idle_backoff, Duration::from_secs(1));
        assert!(config.job_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_target_is_rejected() {
        let config = PoolConfig {
            target: 0,
            ..PoolConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "target"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = PoolConfig {
            job_timeout: Some(Duration::ZERO),
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_idle_backoff_is_rejected() {
        let config = PoolConfig {
            idle_backoff: Duration::ZERO,
            ..PoolConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "idle_backoff"));
    }

    #[test]
    fn zero_stagger_and_settle_are_allowed() {
        let config = PoolConfig {
            stagger_delay: Duration::ZERO,
            settle_delay: Duration::ZERO,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_value_reports_key_and_input() {
        let err = parse_value::<usize>("AGENT_POOL_TARGET", "three").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("AGENT_POOL_TARGET"));
        assert!(message.contains("three"));
    }

    #[test]
    fn parse_value_trims_whitespace() {
        assert_eq!(parse_value::<u64>("k", " 7 ").unwrap(), 7);
    }

    #[test]
    fn parse_value_reads_selection_policy() {
        let policy: SelectionPolicy = parse_value("k", "first").unwrap();
        assert_eq!(policy, SelectionPolicy::FirstAvailable);
    }

    #[test]
    fn command_config_defaults() {
        let config = CommandConfig::new("echo {identity}");
        assert_eq!(config.workdir, PathBuf::from("."));
        assert_eq!(config.log_dir, PathBuf::from(".agent-pool/logs"));
    }
}
