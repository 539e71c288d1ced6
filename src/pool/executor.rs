//! Job executors.
//!
//! An executor performs one full unit of work for an identity. The pool
//! guarantees it is never invoked twice concurrently for the same identity,
//! but it will be invoked concurrently for distinct ones.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::config::CommandConfig;
use crate::error::JobError;
use crate::registry::Identity;

/// Placeholder replaced by the identity in command templates.
pub const IDENTITY_PLACEHOLDER: &str = "{identity}";

/// Environment variable exported to every child process.
pub const IDENTITY_ENV: &str = "AGENT_POOL_IDENTITY";

/// Runs one job for a checked-out identity.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Perform one unit of work. May take arbitrary wall-clock time.
    async fn run(&self, identity: &Identity) -> Result<(), JobError>;

    /// Like [`run`](Self::run), but gives up after `limit` with
    /// [`JobError::TimedOut`].
    ///
    /// The identity is released as soon as this returns, so any work started
    /// for it must be stopped by then. The default drops the `run` future at
    /// the deadline, which is enough for in-process work; executors that start
    /// processes must override it.
    async fn run_with_timeout(&self, identity: &Identity, limit: Duration) -> Result<(), JobError> {
        match tokio::time::timeout(limit, self.run(identity)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::TimedOut {
                identity: identity.to_string(),
                timeout: limit,
            }),
        }
    }
}

/// Runs a shell command per job, appending its output to a per-identity log.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: String,
    workdir: PathBuf,
    log_dir: PathBuf,
}

impl CommandExecutor {
    pub fn new(config: CommandConfig) -> Self {
        Self {
            command: config.command,
            workdir: config.workdir,
            log_dir: config.log_dir,
        }
    }

    /// Command line for `identity`, with every placeholder substituted.
    pub fn render(&self, identity: &Identity) -> String {
        self.command.replace(IDENTITY_PLACEHOLDER, identity.as_str())
    }

    /// Log file owned by `identity`. No two live jobs share one.
    pub fn log_path(&self, identity: &Identity) -> PathBuf {
        self.log_dir.join(format!("{identity}.log"))
    }

    async fn open_log(&self, identity: &Identity) -> Result<std::fs::File, JobError> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(identity))
            .await?;
        file.write_all(
            format!(
                "\n=== {} {} :: {}\n",
                Utc::now().to_rfc3339(),
                identity,
                self.render(identity)
            )
            .as_bytes(),
        )
        .await?;
        file.flush().await?;
        Ok(file.into_std().await)
    }

    /// Run the command, killing its whole process group if `limit` passes.
    async fn execute(&self, identity: &Identity, limit: Option<Duration>) -> Result<(), JobError> {
        let cmd = self.render(identity);
        let log = self.open_log(identity).await?;
        let log_err = log.try_clone()?;

        let mut command = shell_command(&cmd, &self.workdir);
        command
            .env(IDENTITY_ENV, identity.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);
        // Own group, so a timeout reaches everything the shell started.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| JobError::Spawn {
            identity: identity.to_string(),
            reason: e.to_string(),
        })?;

        debug!(identity = %identity, pid = ?child.id(), "Spawned job process");

        let status = match limit {
            None => child.wait().await?,
            Some(limit) => match wait_until(&mut child, limit).await {
                Some(status) => status?,
                None => {
                    warn!(identity = %identity, pid = ?child.id(), timeout = ?limit, "Job timed out, killing its processes");
                    terminate(&mut child).await;
                    return Err(JobError::TimedOut {
                        identity: identity.to_string(),
                        timeout: limit,
                    });
                }
            },
        };

        if status.success() {
            Ok(())
        } else {
            Err(JobError::NonZeroExit {
                identity: identity.to_string(),
                code: status.code(),
            })
        }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn run(&self, identity: &Identity) -> Result<(), JobError> {
        self.execute(identity, None).await
    }

    async fn run_with_timeout(&self, identity: &Identity, limit: Duration) -> Result<(), JobError> {
        self.execute(identity, Some(limit)).await
    }
}

/// Wait for `child` to exit. `None` if `limit` passes first.
async fn wait_until(child: &mut Child, limit: Duration) -> Option<std::io::Result<ExitStatus>> {
    tokio::time::timeout(limit, child.wait()).await.ok()
}

/// Kill the child's process group, then kill and reap the child itself.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        kill_group(pid).await;
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Job process already gone");
    }
}

#[cfg(unix)]
async fn kill_group(pgid: u32) {
    let group = format!("-{pgid}");
    match Command::new("kill")
        .args(["-s", "KILL", "--", group.as_str()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) if status.success() => {}
        Ok(status) => debug!(pgid, ?status, "Process group kill reported failure"),
        Err(e) => warn!(pgid, error = %e, "Failed to run kill for process group"),
    }
}

#[cfg(not(unix))]
async fn kill_group(_pgid: u32) {}

fn shell_command(cmd: &str, workdir: &Path) -> Command {
    let mut command = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", cmd]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", cmd]);
        c
    };
    command.current_dir(workdir);
    command
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn executor(dir: &Path, command: &str) -> CommandExecutor {
        CommandExecutor::new(CommandConfig {
            command: command.to_string(),
            workdir: dir.to_path_buf(),
            log_dir: dir.join("logs"),
        })
    }

    #[test]
    fn render_substitutes_every_placeholder() {
        let exec = executor(Path::new("."), "run --agent {identity} --log {identity}.md");
        let id = Identity::new("writing").unwrap();
        assert_eq!(exec.render(&id), "run --agent writing --log writing.md");
    }

    #[tokio::test]
    async fn success_appends_output_to_identity_log() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), "echo hello from {identity}; echo env=$AGENT_POOL_IDENTITY >&2");
        let id = Identity::new("writing").unwrap();

        exec.run(&id).await.unwrap();
        exec.run(&id).await.unwrap();

        let log = std::fs::read_to_string(exec.log_path(&id)).unwrap();
        assert_eq!(log.matches("hello from writing").count(), 2);
        assert!(log.contains("env=writing"));
        assert_eq!(log.matches("=== ").count(), 2);
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_job_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), "exit 3");
        let id = Identity::new("failing").unwrap();

        let err = exec.run(&id).await.unwrap_err();
        assert!(matches!(err, JobError::NonZeroExit { code: Some(3), .. }));
    }

    #[tokio::test]
    async fn runs_in_configured_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), "touch marker.{identity}");
        let id = Identity::new("a").unwrap();

        exec.run(&id).await.unwrap();
        assert!(dir.path().join("marker.a").is_file());
    }

    #[tokio::test]
    async fn missing_workdir_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let exec = CommandExecutor::new(CommandConfig {
            command: "true".to_string(),
            workdir: dir.path().join("absent"),
            log_dir: dir.path().join("logs"),
        });
        let id = Identity::new("a").unwrap();

        let err = exec.run(&id).await.unwrap_err();
        assert!(matches!(err, JobError::Spawn { .. }));
    }

    #[tokio::test]
    async fn finishes_normally_within_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), "echo quick {identity}");
        let id = Identity::new("quick").unwrap();

        exec.run_with_timeout(&id, Duration::from_secs(5)).await.unwrap();
        let log = std::fs::read_to_string(exec.log_path(&id)).unwrap();
        assert!(log.contains("quick quick"));
    }

    #[tokio::test]
    async fn timeout_stops_every_process_of_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(
            dir.path(),
            "(sleep 0.4; echo bg-{identity} >> marker) & sleep 0.4; echo fg-{identity} >> marker; wait",
        );
        let id = Identity::new("solo").unwrap();

        let started = std::time::Instant::now();
        let err = exec
            .run_with_timeout(&id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_millis(400));

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(
            !dir.path().join("marker").exists(),
            "a process of the timed-out job kept running"
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_leaves_no_live_processes() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(
            dir.path(),
            "echo $$ > pids; (sleep 5; true) & echo $! >> pids; sleep 5",
        );
        let id = Identity::new("solo").unwrap();

        let err = exec
            .run_with_timeout(&id, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::TimedOut { .. }));

        let pids = std::fs::read_to_string(dir.path().join("pids")).unwrap();
        let pids: Vec<&str> = pids.split_whitespace().collect();
        assert_eq!(pids.len(), 2, "shell and background subshell pids recorded");

        tokio::time::sleep(Duration::from_millis(100)).await;
        let alive = pids.iter().filter(|pid| is_running(pid)).count();
        assert_eq!(alive, 0, "processes still running after timeout: {pids:?}");
    }

    /// Running means present in /proc and not a zombie.
    #[cfg(target_os = "linux")]
    fn is_running(pid: &str) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| {
                let state = stat.rsplit(')').next()?.split_whitespace().next()?.to_string();
                Some(state != "Z" && state != "X")
            })
            .unwrap_or(false)
    }
}
