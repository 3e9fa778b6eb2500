//! Process configuration.
//!
//! One immutable [`Settings`] value is built from the environment at startup
//! and passed into components at construction time. Never scatter
//! `std::env::var` calls across the codebase; the per-check command lookup
//! below is the single sanctioned exception because check names are dynamic.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

pub const DEFAULT_SLOT_IDS: &str = "preview-1,preview-2,preview-3";
pub const DEFAULT_LEASE_TTL_SECONDS: i64 = 1800;
pub const DEFAULT_REQUIRED_CHECKS: &str = "lint,test,smoke";

/// Shell interpreters are never valid supervised commands, allowlisted or not.
pub const BLOCKED_SHELL_INTERPRETERS: &[&str] =
    &["sh", "bash", "zsh", "dash", "ksh", "csh", "tcsh", "fish"];

/// Env var names stripped from every subprocess regardless of the allowlist.
pub const ALWAYS_BLOCKED_ENV: &[&str] = &[
    "DATABASE_URL",
    "PGPASSWORD",
    "AWS_SECRET_ACCESS_KEY",
    "GITHUB_TOKEN",
];

/// Remote push behavior at the merge gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    Manual,
    Auto,
    DryRun,
}

impl PushMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" | "" => Ok(PushMode::Manual),
            "auto" => Ok(PushMode::Auto),
            "dry-run" | "dry_run" => Ok(PushMode::DryRun),
            other => anyhow::bail!("invalid MERGE_GATE_GIT_PUSH_MODE: {other}"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PushMode::Manual => "manual",
            PushMode::Auto => "auto",
            PushMode::DryRun => "dry-run",
        }
    }
}

/// Immutable process-wide configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub slot_ids: Vec<String>,
    pub slot_lease_ttl_seconds: i64,
    pub repo_root_path: PathBuf,
    pub worktree_root_path: PathBuf,
    pub trunk_branch: String,
    pub cors_allowed_origins: Vec<String>,
    pub worker: WorkerSettings,
    pub merge_gate: MergeGateSettings,
}

/// Worker-loop and subprocess-boundary options.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub run_timeout: Duration,
    pub poll_interval: Duration,
    pub run_poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub cancel_check_interval: Duration,
    pub required_checks: Vec<String>,
    pub check_default_timeout: Duration,
    pub artifact_root: PathBuf,
    pub codex_command_template: Option<String>,
    pub codex_bin: String,
    pub codex_args: Vec<String>,
    pub allowed_commands: Vec<String>,
    pub allowed_paths: Vec<PathBuf>,
    pub env_allowlist: Vec<String>,
    pub env_blocklist: Vec<String>,
    pub git_author_name: Option<String>,
    pub git_author_email: Option<String>,
    pub preview_reset_command: Option<Vec<String>>,
    pub api_base_url: String,
    pub publish: PublishSettings,
}

/// Preview publish pipeline commands. Unset commands skip their step.
#[derive(Debug, Clone, Default)]
pub struct PublishSettings {
    pub frontend_install_command: Option<Vec<String>>,
    pub frontend_build_command: Option<Vec<String>>,
    pub sync_command: Option<Vec<String>>,
    pub backend_sync_command: Option<Vec<String>>,
    pub backend_migrate_command: Option<Vec<String>>,
    pub backend_restart_command: Option<Vec<String>>,
    pub frontend_healthcheck_command: Option<Vec<String>>,
    pub backend_healthcheck_command: Option<Vec<String>>,
    pub frontend_cache_dir: Option<PathBuf>,
    pub step_timeout: Duration,
}

/// Merge-gate pipeline options.
#[derive(Debug, Clone)]
pub struct MergeGateSettings {
    pub required_checks: Vec<String>,
    pub check_default_timeout: Duration,
    pub push_mode: PushMode,
    pub push_remote: String,
    pub push_branch: String,
    pub push_timeout: Duration,
    pub deploy_backend_reload_command: Option<Vec<String>>,
    pub deploy_backend_healthcheck_command: Option<Vec<String>>,
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var(ENV_DATABASE_URL)
            .with_context(|| format!("missing env var {ENV_DATABASE_URL}"))?;

        let slot_ids = csv_list(&env_or("SLOT_IDS_CSV", DEFAULT_SLOT_IDS));
        let slot_ids = if slot_ids.is_empty() {
            csv_list(DEFAULT_SLOT_IDS)
        } else {
            slot_ids
        };

        let worktree_root_path =
            PathBuf::from(env_or("WORKTREE_ROOT_PATH", "/srv/overseer/worktrees"));
        let artifact_root =
            PathBuf::from(env_or("WORKER_ARTIFACT_ROOT", "/srv/overseer/artifacts/runs"));

        let worker = WorkerSettings {
            run_timeout: secs_min("WORKER_RUN_TIMEOUT_SECONDS", 1800, 30)?,
            poll_interval: secs_min("WORKER_POLL_INTERVAL_SECONDS", 5, 1)?,
            run_poll_interval: secs_f64_min("WORKER_RUN_POLL_SECONDS", 0.5, 0.2)?,
            heartbeat_interval: secs_f64_min("WORKER_HEARTBEAT_SECONDS", 15.0, 5.0)?,
            cancel_check_interval: secs_f64_min("WORKER_CANCEL_CHECK_SECONDS", 2.0, 0.2)?,
            required_checks: csv_list(&env_or("WORKER_REQUIRED_CHECKS", DEFAULT_REQUIRED_CHECKS)),
            check_default_timeout: secs_min("WORKER_CHECK_TIMEOUT_SECONDS", 900, 30)?,
            codex_command_template: env_opt("WORKER_CODEX_COMMAND_TEMPLATE"),
            codex_bin: env_or("WORKER_CODEX_BIN", "codex"),
            codex_args: split_command(&env_or("WORKER_CODEX_ARGS", "")),
            allowed_commands: csv_list(&env_or("WORKER_ALLOWED_COMMANDS", "")),
            allowed_paths: {
                let mut paths: Vec<PathBuf> = csv_list(&env_or("WORKER_ALLOWED_PATHS", ""))
                    .into_iter()
                    .map(PathBuf::from)
                    .collect();
                if paths.is_empty() {
                    paths.push(worktree_root_path.clone());
                }
                paths
            },
            env_allowlist: csv_list(&env_or(
                "WORKER_SUBPROCESS_ENV_ALLOWLIST",
                "PATH,HOME,LANG,TMPDIR",
            )),
            env_blocklist: csv_list(&env_or("WORKER_SUBPROCESS_ENV_BLOCKLIST", "")),
            git_author_name: env_opt("WORKER_GIT_AUTHOR_NAME"),
            git_author_email: env_opt("WORKER_GIT_AUTHOR_EMAIL"),
            preview_reset_command: env_command("WORKER_PREVIEW_RESET_COMMAND"),
            api_base_url: env_or("WORKER_API_BASE_URL", "http://127.0.0.1:8088"),
            artifact_root,
            publish: PublishSettings {
                frontend_install_command: env_command("WORKER_FRONTEND_INSTALL_COMMAND"),
                frontend_build_command: env_command("WORKER_FRONTEND_BUILD_COMMAND"),
                sync_command: env_command("WORKER_PUBLISH_SYNC_COMMAND"),
                backend_sync_command: env_command("WORKER_BACKEND_SYNC_COMMAND"),
                backend_migrate_command: env_command("WORKER_BACKEND_MIGRATE_COMMAND"),
                backend_restart_command: env_command("WORKER_BACKEND_RESTART_COMMAND"),
                frontend_healthcheck_command: env_command("WORKER_FRONTEND_HEALTHCHECK_COMMAND"),
                backend_healthcheck_command: env_command("WORKER_BACKEND_HEALTHCHECK_COMMAND"),
                frontend_cache_dir: env_opt("WORKER_FRONTEND_CACHE_DIR").map(PathBuf::from),
                step_timeout: secs_min("WORKER_PUBLISH_STEP_TIMEOUT_SECONDS", 900, 30)?,
            },
        };

        let merge_gate = MergeGateSettings {
            required_checks: csv_list(&env_or(
                "MERGE_GATE_REQUIRED_CHECKS",
                &env_or("WORKER_REQUIRED_CHECKS", DEFAULT_REQUIRED_CHECKS),
            )),
            check_default_timeout: secs_min("MERGE_GATE_CHECK_TIMEOUT_SECONDS", 900, 30)?,
            push_mode: PushMode::parse(&env_or("MERGE_GATE_GIT_PUSH_MODE", "manual"))?,
            push_remote: env_or("MERGE_GATE_GIT_PUSH_REMOTE", "origin"),
            push_branch: env_or("MERGE_GATE_GIT_PUSH_BRANCH", "main"),
            push_timeout: secs_min("MERGE_GATE_GIT_PUSH_TIMEOUT_SECONDS", 120, 10)?,
            deploy_backend_reload_command: env_command("MERGE_GATE_DEPLOY_BACKEND_RELOAD_COMMAND"),
            deploy_backend_healthcheck_command: env_command(
                "MERGE_GATE_DEPLOY_BACKEND_HEALTHCHECK_COMMAND",
            ),
        };

        Ok(Settings {
            database_url,
            slot_ids,
            slot_lease_ttl_seconds: int_min("SLOT_LEASE_TTL_SECONDS", DEFAULT_LEASE_TTL_SECONDS, 30)?,
            repo_root_path: PathBuf::from(env_or("REPO_ROOT_PATH", "/srv/overseer/repo")),
            worktree_root_path,
            trunk_branch: env_or("TRUNK_BRANCH", "main"),
            cors_allowed_origins: csv_list(&env_or(
                "CORS_ALLOWED_ORIGINS_CSV",
                "http://127.0.0.1:5173,http://localhost:5173,http://127.0.0.1:8088,http://localhost:8088",
            )),
            worker,
            merge_gate,
        })
    }

    /// Resolve the command for a worker validation check, if configured.
    pub fn worker_check_command(&self, check_name: &str) -> Option<Vec<String>> {
        env_command(&format!("WORKER_CHECK_{}_COMMAND", check_env_key(check_name)))
    }

    /// Per-check timeout for a worker validation check.
    pub fn worker_check_timeout(&self, check_name: &str) -> Duration {
        check_timeout_override("WORKER_CHECK", check_name)
            .unwrap_or(self.worker.check_default_timeout)
    }

    /// Resolve the command for a merge-gate check, if configured.
    pub fn merge_gate_check_command(&self, check_name: &str) -> Option<Vec<String>> {
        env_command(&format!("MERGE_GATE_CHECK_{}_COMMAND", check_env_key(check_name)))
    }

    /// Per-check timeout for a merge-gate check.
    pub fn merge_gate_check_timeout(&self, check_name: &str) -> Duration {
        check_timeout_override("MERGE_GATE_CHECK", check_name)
            .unwrap_or(self.merge_gate.check_default_timeout)
    }

    /// The agent invocation for a prompt inside a worktree.
    ///
    /// A configured template is tokenized on whitespace first and the
    /// `{prompt}` / `{worktree_path}` placeholders substituted per token, so
    /// prompts with spaces stay a single argv entry.
    pub fn codex_command(&self, prompt: &str, worktree_path: &str) -> Vec<String> {
        if let Some(template) = &self.worker.codex_command_template {
            let rendered: Vec<String> = template
                .split_whitespace()
                .map(|token| {
                    token
                        .replace("{prompt}", prompt)
                        .replace("{worktree_path}", worktree_path)
                })
                .collect();
            if !rendered.is_empty() {
                return rendered;
            }
        }

        let mut command = vec![self.worker.codex_bin.clone()];
        command.extend(self.worker.codex_args.iter().cloned());
        command.push(prompt.to_string());
        command
    }
}

/// Uppercased env-key fragment for a check name (`type-check` -> `TYPE_CHECK`).
pub fn check_env_key(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// Split a command string into argv on whitespace. Commands are exec'd
/// directly, never through a shell, so no quoting rules apply.
pub fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

fn csv_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_command(key: &str) -> Option<Vec<String>> {
    env_opt(key).map(|raw| split_command(&raw)).filter(|cmd| !cmd.is_empty())
}

fn int_min(key: &str, default: i64, floor: i64) -> Result<i64> {
    match env_opt(key) {
        None => Ok(default.max(floor)),
        Some(raw) => {
            let value: i64 = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid integer in {key}: {raw}"))?;
            Ok(value.max(floor))
        }
    }
}

fn secs_min(key: &str, default: u64, floor: u64) -> Result<Duration> {
    let value = int_min(key, default as i64, floor as i64)?;
    Ok(Duration::from_secs(value as u64))
}

fn secs_f64_min(key: &str, default: f64, floor: f64) -> Result<Duration> {
    let value = match env_opt(key) {
        None => default,
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid number in {key}: {raw}"))?,
    };
    Ok(Duration::from_secs_f64(value.max(floor)))
}

fn check_timeout_override(prefix: &str, check_name: &str) -> Option<Duration> {
    let key = format!("{prefix}_{}_TIMEOUT_SECONDS", check_env_key(check_name));
    env_opt(&key)
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .map(|secs| Duration::from_secs(secs.max(30) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_env_key_normalizes() {
        assert_eq!(check_env_key("lint"), "LINT");
        assert_eq!(check_env_key("type-check"), "TYPE_CHECK");
        assert_eq!(check_env_key(" smoke test "), "SMOKE_TEST");
    }

    #[test]
    fn split_command_is_whitespace_only() {
        assert_eq!(split_command("npm run build"), vec!["npm", "run", "build"]);
        assert!(split_command("   ").is_empty());
    }

    #[test]
    fn csv_list_trims_and_drops_empties() {
        assert_eq!(csv_list("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(csv_list("").is_empty());
    }

    #[test]
    fn push_mode_parses() {
        assert_eq!(PushMode::parse("manual").unwrap(), PushMode::Manual);
        assert_eq!(PushMode::parse("auto").unwrap(), PushMode::Auto);
        assert_eq!(PushMode::parse("dry-run").unwrap(), PushMode::DryRun);
        assert!(PushMode::parse("yolo").is_err());
    }

    #[test]
    fn codex_command_template_substitutes_per_token() {
        let mut settings = test_settings();
        settings.worker.codex_command_template =
            Some("codex exec --cd {worktree_path} {prompt}".to_string());
        let command = settings.codex_command("add a button", "/wt/preview-1");
        assert_eq!(
            command,
            vec!["codex", "exec", "--cd", "/wt/preview-1", "add a button"]
        );
    }

    #[test]
    fn codex_command_falls_back_to_bin_args_prompt() {
        let mut settings = test_settings();
        settings.worker.codex_command_template = None;
        settings.worker.codex_bin = "codex".to_string();
        settings.worker.codex_args = vec!["exec".to_string()];
        assert_eq!(
            settings.codex_command("p", "/wt"),
            vec!["codex", "exec", "p"]
        );
    }

    pub(crate) fn test_settings() -> Settings {
        Settings {
            database_url: "postgres://localhost/overseer_test".to_string(),
            slot_ids: csv_list(DEFAULT_SLOT_IDS),
            slot_lease_ttl_seconds: DEFAULT_LEASE_TTL_SECONDS,
            repo_root_path: PathBuf::from("/tmp/repo"),
            worktree_root_path: PathBuf::from("/tmp/worktrees"),
            trunk_branch: "main".to_string(),
            cors_allowed_origins: vec![],
            worker: WorkerSettings {
                run_timeout: Duration::from_secs(1800),
                poll_interval: Duration::from_secs(5),
                run_poll_interval: Duration::from_secs_f64(0.5),
                heartbeat_interval: Duration::from_secs(15),
                cancel_check_interval: Duration::from_secs(2),
                required_checks: csv_list(DEFAULT_REQUIRED_CHECKS),
                check_default_timeout: Duration::from_secs(900),
                artifact_root: PathBuf::from("/tmp/artifacts"),
                codex_command_template: None,
                codex_bin: "codex".to_string(),
                codex_args: vec![],
                allowed_commands: vec![],
                allowed_paths: vec![PathBuf::from("/tmp/worktrees")],
                env_allowlist: vec!["PATH".to_string()],
                env_blocklist: vec![],
                git_author_name: None,
                git_author_email: None,
                preview_reset_command: None,
                api_base_url: "http://127.0.0.1:8088".to_string(),
                publish: PublishSettings {
                    step_timeout: Duration::from_secs(900),
                    ..PublishSettings::default()
                },
            },
            merge_gate: MergeGateSettings {
                required_checks: csv_list(DEFAULT_REQUIRED_CHECKS),
                check_default_timeout: Duration::from_secs(900),
                push_mode: PushMode::Manual,
                push_remote: "origin".to_string(),
                push_branch: "main".to_string(),
                push_timeout: Duration::from_secs(120),
                deploy_backend_reload_command: None,
                deploy_backend_healthcheck_command: None,
            },
        }
    }
}
