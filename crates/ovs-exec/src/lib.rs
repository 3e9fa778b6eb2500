//! Subprocess supervisor.
//!
//! Every external command the control plane runs (agent, validation checks,
//! preview reset, publish steps, deploy reload, git plumbing) goes through
//! this crate. [`run_supervised`] enforces the command/path allowlists and
//! env sanitization, supervises the child with three orthogonal timers
//! (absolute timeout, cancel probe, lease heartbeat), and returns a single
//! [`ExecOutcome`] variant the caller dispatches on. [`run_captured`] is the
//! short-command helper for git plumbing where supervision is overkill.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

use ovs_config::{Settings, ALWAYS_BLOCKED_ENV, BLOCKED_SHELL_INTERPRETERS};

/// Exit code reported for a command/path allowlist violation.
pub const EXIT_COMMAND_NOT_ALLOWED: i32 = 126;
/// Exit code reported when the executable cannot be found.
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;

const OUTPUT_EXCERPT_LINES: usize = 20;

/// Allowlists and env policy applied at the subprocess boundary.
#[derive(Debug, Clone, Default)]
pub struct ExecPolicy {
    /// Executable basenames allowed to run. Empty allows everything except
    /// shell interpreters, which are always blocked.
    pub allowed_commands: Vec<String>,
    /// Roots the working directory must resolve under.
    pub allowed_paths: Vec<PathBuf>,
    /// Host env vars passed through.
    pub env_allowlist: Vec<String>,
    /// Env vars removed unconditionally, on top of the built-in secret set.
    pub env_blocklist: Vec<String>,
}

impl ExecPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        ExecPolicy {
            allowed_commands: settings.worker.allowed_commands.clone(),
            allowed_paths: settings.worker.allowed_paths.clone(),
            env_allowlist: settings.worker.env_allowlist.clone(),
            env_blocklist: settings.worker.env_blocklist.clone(),
        }
    }

    /// Check the executable against the allowlist. Shell interpreters never
    /// pass, even when listed.
    pub fn check_command(&self, program: &str) -> Result<(), String> {
        let basename = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);
        if BLOCKED_SHELL_INTERPRETERS.contains(&basename) {
            return Err(format!("shell_interpreter_blocked:{basename}"));
        }
        if !self.allowed_commands.is_empty()
            && !self.allowed_commands.iter().any(|c| c == basename)
        {
            return Err(format!("command_not_allowlisted:{basename}"));
        }
        Ok(())
    }

    /// Check the working directory against the path allowlist.
    pub fn check_cwd(&self, cwd: &Path) -> Result<(), String> {
        if self.allowed_paths.is_empty() {
            return Ok(());
        }
        let resolved = cwd
            .canonicalize()
            .map_err(|_| format!("cwd_unresolvable:{}", cwd.display()))?;
        for root in &self.allowed_paths {
            let Ok(root) = root.canonicalize() else { continue };
            if resolved == root || resolved.starts_with(&root) {
                return Ok(());
            }
        }
        Err(format!("cwd_not_allowlisted:{}", cwd.display()))
    }

    /// Build the child environment: allowlisted host vars minus the
    /// blocklists, plus the injected run-scoped vars.
    pub fn sanitized_env(&self, injected: &[(String, String)]) -> Vec<(String, String)> {
        let blocked = |name: &str| {
            ALWAYS_BLOCKED_ENV.contains(&name) || self.env_blocklist.iter().any(|b| b == name)
        };

        let mut env: Vec<(String, String)> = self
            .env_allowlist
            .iter()
            .filter(|name| !blocked(name))
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
            .collect();

        for (name, value) in injected {
            if blocked(name) {
                continue;
            }
            env.retain(|(existing, _)| existing != name);
            env.push((name.clone(), value.clone()));
        }
        env
    }
}

/// One supervised command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    /// Combined stdout+stderr is streamed here.
    pub output_path: PathBuf,
    /// Run-scoped env vars injected after sanitization.
    pub injected_env: Vec<(String, String)>,
}

/// Verdict from a heartbeat probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    Alive,
    LeaseExpired,
    RunCanceled,
}

/// Cooperative supervision hooks. The worker wires these to the run-status
/// cancel check and the slot-lease heartbeat; everything else uses
/// [`NoopProbe`].
#[async_trait]
pub trait SupervisionProbe: Send {
    async fn should_cancel(&mut self) -> Result<bool> {
        Ok(false)
    }

    async fn heartbeat(&mut self) -> Result<HeartbeatVerdict> {
        Ok(HeartbeatVerdict::Alive)
    }
}

/// Probe that never cancels and never expires.
pub struct NoopProbe;

#[async_trait]
impl SupervisionProbe for NoopProbe {}

/// Probe cadences. `poll` bounds how often the child is checked at all.
#[derive(Debug, Clone, Copy)]
pub struct SupervisionIntervals {
    pub poll: Duration,
    pub cancel_check: Duration,
    pub heartbeat: Duration,
}

impl SupervisionIntervals {
    pub fn from_settings(settings: &Settings) -> Self {
        SupervisionIntervals {
            poll: settings.worker.run_poll_interval,
            cancel_check: settings.worker.cancel_check_interval,
            heartbeat: settings.worker.heartbeat_interval,
        }
    }

    /// No cancel/heartbeat traffic; timeout-only supervision.
    pub fn timeout_only() -> Self {
        SupervisionIntervals {
            poll: Duration::from_millis(250),
            cancel_check: Duration::from_secs(3600),
            heartbeat: Duration::from_secs(3600),
        }
    }
}

/// The single result variant for a supervised command. Exactly one of the
/// flag fields explains a non-clean exit; callers dispatch in the order
/// canceled, lease_expired, timed_out, exit_code.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub canceled: bool,
    pub lease_expired: bool,
    pub duration: Duration,
    pub output_path: PathBuf,
    pub output_excerpt: Vec<String>,
}

impl ExecOutcome {
    pub fn clean(&self) -> bool {
        !self.timed_out && !self.canceled && !self.lease_expired && self.exit_code == Some(0)
    }

    fn denied(spec: &CommandSpec, exit_code: i32, reason: &str) -> Result<Self> {
        write_output(&spec.output_path, reason)?;
        Ok(ExecOutcome {
            exit_code: Some(exit_code),
            timed_out: false,
            canceled: false,
            lease_expired: false,
            duration: Duration::ZERO,
            output_path: spec.output_path.clone(),
            output_excerpt: vec![reason.to_string()],
        })
    }
}

/// Run one command under policy + supervision.
///
/// Allowlist violations do not spawn anything: they come back as outcomes
/// with exit code 126 (blocked) or 127 (missing executable), mirroring shell
/// conventions, with the reason written to the output file.
pub async fn run_supervised(
    spec: &CommandSpec,
    policy: &ExecPolicy,
    probe: &mut dyn SupervisionProbe,
    intervals: SupervisionIntervals,
) -> Result<ExecOutcome> {
    let Some(program) = spec.command.first() else {
        anyhow::bail!("empty command");
    };

    if let Err(reason) = policy.check_command(program) {
        return ExecOutcome::denied(spec, EXIT_COMMAND_NOT_ALLOWED, &reason);
    }
    if let Err(reason) = policy.check_cwd(&spec.cwd) {
        return ExecOutcome::denied(spec, EXIT_COMMAND_NOT_ALLOWED, &reason);
    }

    if let Some(parent) = spec.output_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create artifact dir {}", parent.display()))?;
    }
    let stdout_file = std::fs::File::create(&spec.output_path)
        .with_context(|| format!("create output file {}", spec.output_path.display()))?;
    let stderr_file = stdout_file
        .try_clone()
        .context("clone output file handle")?;

    let env = policy.sanitized_env(&spec.injected_env);
    let mut command = Command::new(program);
    command
        .args(&spec.command[1..])
        .current_dir(&spec.cwd)
        .env_clear()
        .envs(env)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::from(stdout_file))
        .stderr(std::process::Stdio::from(stderr_file))
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return ExecOutcome::denied(
                spec,
                EXIT_COMMAND_NOT_FOUND,
                &format!("executable_not_found:{program}"),
            );
        }
        Err(err) => {
            return Err(anyhow::Error::new(err).context(format!("spawn failed: {program}")))
        }
    };

    let mut exit_code = None;
    let mut timed_out = false;
    let mut canceled = false;
    let mut lease_expired = false;
    let mut next_cancel_check = started + intervals.cancel_check;
    let mut next_heartbeat = started + intervals.heartbeat;

    loop {
        if let Some(status) = child.try_wait().context("try_wait failed")? {
            exit_code = status.code();
            break;
        }

        let now = Instant::now();
        if now.duration_since(started) >= spec.timeout {
            timed_out = true;
            child.kill().await.ok();
            break;
        }

        if now >= next_cancel_check {
            next_cancel_check = now + intervals.cancel_check;
            if probe.should_cancel().await? {
                canceled = true;
                child.kill().await.ok();
                break;
            }
        }

        if now >= next_heartbeat {
            next_heartbeat = now + intervals.heartbeat;
            match probe.heartbeat().await? {
                HeartbeatVerdict::Alive => {}
                HeartbeatVerdict::LeaseExpired => {
                    lease_expired = true;
                    child.kill().await.ok();
                    break;
                }
                HeartbeatVerdict::RunCanceled => {
                    canceled = true;
                    child.kill().await.ok();
                    break;
                }
            }
        }

        tokio::time::sleep(intervals.poll).await;
    }

    // Reap a killed child so no zombie outlives the supervisor.
    let _ = child.wait().await;

    let duration = started.elapsed();
    debug!(
        program,
        exit_code, timed_out, canceled, lease_expired, "supervised command finished"
    );

    Ok(ExecOutcome {
        exit_code,
        timed_out,
        canceled,
        lease_expired,
        duration,
        output_excerpt: read_excerpt(&spec.output_path),
        output_path: spec.output_path.clone(),
    })
}

fn write_output(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create artifact dir {}", parent.display()))?;
    }
    std::fs::write(path, format!("{content}\n"))
        .with_context(|| format!("write output file {}", path.display()))?;
    Ok(())
}

fn read_excerpt(path: &Path) -> Vec<String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(OUTPUT_EXCERPT_LINES);
    lines[start..].iter().map(|s| s.to_string()).collect()
}

/// Output of a short, unsupervised helper command (git plumbing).
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// First non-empty stream, trimmed, for error reporting.
    pub fn message(&self) -> String {
        let err = self.stderr.trim();
        if !err.is_empty() {
            return err.to_string();
        }
        self.stdout.trim().to_string()
    }
}

/// Run a short command to completion and capture stdout/stderr.
pub async fn run_captured(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
) -> Result<CapturedOutput> {
    let mut command = Command::new(program);
    command.args(args);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    let output = command
        .output()
        .await
        .with_context(|| format!("run {program} failed to spawn"))?;
    Ok(CapturedOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_with(commands: &[&str], paths: &[&str]) -> ExecPolicy {
        ExecPolicy {
            allowed_commands: commands.iter().map(|s| s.to_string()).collect(),
            allowed_paths: paths.iter().map(PathBuf::from).collect(),
            env_allowlist: vec!["PATH".to_string()],
            env_blocklist: vec!["SECRET_TOKEN".to_string()],
        }
    }

    #[test]
    fn shell_interpreters_are_blocked_even_when_listed() {
        let policy = policy_with(&["bash", "true"], &[]);
        assert!(policy.check_command("bash").is_err());
        assert!(policy.check_command("/usr/bin/bash").is_err());
        assert!(policy.check_command("true").is_ok());
    }

    #[test]
    fn empty_allowlist_allows_non_shell_commands() {
        let policy = policy_with(&[], &[]);
        assert!(policy.check_command("git").is_ok());
        assert!(policy.check_command("zsh").is_err());
    }

    #[test]
    fn allowlist_matches_basename() {
        let policy = policy_with(&["codex"], &[]);
        assert!(policy.check_command("/opt/tools/codex").is_ok());
        assert!(policy.check_command("rm").is_err());
    }

    #[test]
    fn cwd_must_resolve_under_an_allowed_root() {
        let root = tempfile::tempdir().unwrap();
        let inside = root.path().join("wt");
        std::fs::create_dir_all(&inside).unwrap();
        let outside = tempfile::tempdir().unwrap();

        let policy = policy_with(&[], &[root.path().to_str().unwrap()]);
        assert!(policy.check_cwd(&inside).is_ok());
        assert!(policy.check_cwd(outside.path()).is_err());
    }

    #[test]
    fn sanitized_env_strips_secrets_and_injects_run_vars() {
        std::env::set_var("SECRET_TOKEN", "hunter2");
        let policy = ExecPolicy {
            allowed_commands: vec![],
            allowed_paths: vec![],
            env_allowlist: vec!["PATH".to_string(), "SECRET_TOKEN".to_string(), "DATABASE_URL".to_string()],
            env_blocklist: vec!["SECRET_TOKEN".to_string()],
        };
        let env = policy.sanitized_env(&[
            ("RUN_ID".to_string(), "r-1".to_string()),
            ("DATABASE_URL".to_string(), "postgres://nope".to_string()),
        ]);
        let names: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert!(names.contains(&"RUN_ID"));
        assert!(!names.contains(&"SECRET_TOKEN"));
        // DATABASE_URL is on the built-in blocklist, injected or not.
        assert!(!names.contains(&"DATABASE_URL"));
    }

    #[tokio::test]
    async fn denied_command_reports_exit_126_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec {
            command: vec!["bash".to_string(), "-c".to_string(), "true".to_string()],
            cwd: dir.path().to_path_buf(),
            timeout: Duration::from_secs(5),
            output_path: dir.path().join("out.log"),
            injected_env: vec![],
        };
        let outcome = run_supervised(
            &spec,
            &ExecPolicy::default(),
            &mut NoopProbe,
            SupervisionIntervals::timeout_only(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.exit_code, Some(EXIT_COMMAND_NOT_ALLOWED));
        assert!(!outcome.clean());
    }

    #[tokio::test]
    async fn missing_executable_reports_exit_127() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec {
            command: vec!["definitely-not-a-real-binary-9f2e".to_string()],
            cwd: dir.path().to_path_buf(),
            timeout: Duration::from_secs(5),
            output_path: dir.path().join("out.log"),
            injected_env: vec![],
        };
        let outcome = run_supervised(
            &spec,
            &ExecPolicy::default(),
            &mut NoopProbe,
            SupervisionIntervals::timeout_only(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.exit_code, Some(EXIT_COMMAND_NOT_FOUND));
    }

    #[tokio::test]
    async fn clean_exit_is_reported_with_output() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec {
            command: vec!["true".to_string()],
            cwd: dir.path().to_path_buf(),
            timeout: Duration::from_secs(10),
            output_path: dir.path().join("out.log"),
            injected_env: vec![],
        };
        let outcome = run_supervised(
            &spec,
            &ExecPolicy::default(),
            &mut NoopProbe,
            SupervisionIntervals::timeout_only(),
        )
        .await
        .unwrap();
        assert!(outcome.clean());
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec {
            command: vec!["sleep".to_string(), "30".to_string()],
            cwd: dir.path().to_path_buf(),
            timeout: Duration::from_millis(300),
            output_path: dir.path().join("out.log"),
            injected_env: vec![],
        };
        let outcome = run_supervised(
            &spec,
            &ExecPolicy::default(),
            &mut NoopProbe,
            SupervisionIntervals {
                poll: Duration::from_millis(50),
                cancel_check: Duration::from_secs(3600),
                heartbeat: Duration::from_secs(3600),
            },
        )
        .await
        .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.clean());
    }

    struct CancelAfterFirstProbe;

    #[async_trait]
    impl SupervisionProbe for CancelAfterFirstProbe {
        async fn should_cancel(&mut self) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn cancel_probe_terminates_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec {
            command: vec!["sleep".to_string(), "30".to_string()],
            cwd: dir.path().to_path_buf(),
            timeout: Duration::from_secs(30),
            output_path: dir.path().join("out.log"),
            injected_env: vec![],
        };
        let outcome = run_supervised(
            &spec,
            &ExecPolicy::default(),
            &mut CancelAfterFirstProbe,
            SupervisionIntervals {
                poll: Duration::from_millis(50),
                cancel_check: Duration::from_millis(100),
                heartbeat: Duration::from_secs(3600),
            },
        )
        .await
        .unwrap();
        assert!(outcome.canceled);
        assert!(!outcome.timed_out);
    }

    struct ExpireLeaseProbe;

    #[async_trait]
    impl SupervisionProbe for ExpireLeaseProbe {
        async fn heartbeat(&mut self) -> Result<HeartbeatVerdict> {
            Ok(HeartbeatVerdict::LeaseExpired)
        }
    }

    #[tokio::test]
    async fn lease_expiry_is_distinguished_from_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec {
            command: vec!["sleep".to_string(), "30".to_string()],
            cwd: dir.path().to_path_buf(),
            timeout: Duration::from_secs(30),
            output_path: dir.path().join("out.log"),
            injected_env: vec![],
        };
        let outcome = run_supervised(
            &spec,
            &ExecPolicy::default(),
            &mut ExpireLeaseProbe,
            SupervisionIntervals {
                poll: Duration::from_millis(50),
                cancel_check: Duration::from_secs(3600),
                heartbeat: Duration::from_millis(100),
            },
        )
        .await
        .unwrap();
        assert!(outcome.lease_expired);
        assert!(!outcome.canceled);
    }
}
