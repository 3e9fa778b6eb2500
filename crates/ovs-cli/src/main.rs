//! Operator CLI: database bootstrap and host-native maintenance jobs.
//!
//! Each job prints one canonical JSON payload to stdout. Exit codes: 0 on
//! success, 2 when a job detects problems, 1 on operational failure.

mod jobs;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ovs")]
#[command(about = "Overseer control-plane CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Maintenance jobs
    Jobs {
        #[command(subcommand)]
        cmd: JobCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum JobCmd {
    /// Run the slot-lease reaper once.
    StaleLeaseCleanup,

    /// Audit preview_db_resets for failed or stuck rows.
    PreviewResetIntegrity {
        #[arg(long, default_value_t = 24)]
        lookback_hours: i64,
        #[arg(long, default_value_t = 90)]
        running_grace_minutes: i64,
    },

    /// Runtime health + reset integrity + release and lease summaries,
    /// written to a dated JSON file.
    DailyHealthSummary {
        #[arg(long, default_value = "/srv/overseer/artifacts/maintenance")]
        output_dir: String,
        #[arg(long)]
        runtime_health_cmd: Option<String>,
        #[arg(long, default_value_t = 20)]
        release_limit: i64,
        #[arg(long, default_value_t = 24)]
        lookback_hours: i64,
        #[arg(long, default_value_t = 90)]
        running_grace_minutes: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            let payload = serde_json::json!({
                "error": "command_failed",
                "detail": format!("{err:#}"),
            });
            println!("{payload}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = ovs_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let status = ovs_db::status(&pool).await?;
                    println!(
                        "{}",
                        serde_json::json!({
                            "ok": status.ok,
                            "has_runs_table": status.has_runs_table,
                        })
                    );
                }
                DbCmd::Migrate => {
                    ovs_db::migrate(&pool).await?;
                    println!("{}", serde_json::json!({"migrated": true}));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Jobs { cmd } => jobs::run_job(cmd).await,
    }
}
