use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use tokio_util::sync::CancellationToken;

use le_cert_manager::settings::AppSettings;
use le_cert_manager::{api, build_orchestrator, scheduler};

/// Unattended ACME certificate renewal
#[derive(Parser)]
#[command(name = "le-cert-manager", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(
        short,
        long,
        env = "LE_CERT_MANAGER_CONFIG",
        default_value = "le-cert-manager.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API and run the daily renewal sweep
    Serve,
    /// Renew one certificate if it is due
    Renew {
        name: String,
        /// Renew even when the current certificate is not due
        #[arg(long)]
        force: bool,
    },
    /// Renew every auto-renew certificate that is due, once
    Sweep,
    /// Print the stored certificate and its expiry state
    Status { name: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = AppSettings::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let schedule = settings.schedule.clone();
    let listen = settings.server.listen;
    let orchestrator = build_orchestrator(settings)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal.cancel();
        }
    });

    match cli.command {
        Command::Serve => {
            if schedule.enabled {
                let at = schedule.daily_time()?;
                tokio::spawn(scheduler::run_daily_sweep(
                    orchestrator.clone(),
                    at,
                    shutdown.clone(),
                ));
            } else {
                info!("[scheduler] daily sweep disabled");
            }
            api::run_api_server(listen, orchestrator, shutdown).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Renew { name, force } => {
            match orchestrator.renew(&name, force, &shutdown).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("{name} is not due for renewal"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Sweep => {
            let report = orchestrator.renew_all_due(&shutdown).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.failed.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Status { name } => {
            let status = orchestrator.check_status(&name).await?;
            println!("{}", serde_json::to_string_pretty(&status.record)?);
            Ok(if status.expiring {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
    }
}
