//! Command-line driver for a resource scheduler.
//!
//! Loads an agent config (TOML, `CONVERGE_*` overrides, `.env`), applies a
//! desired-state JSON file and deploys it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use converge_agent::{build_scheduler, builtin_registry, load_config, load_desired_state, wait_idle};
use converge_core::config::load_dotenv;
use converge_scheduler::DeployReason;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ── CLI ─────────────────────────────────────────────────────────────

/// Deploy desired-state snapshots with the converge scheduler.
#[derive(Parser, Debug)]
#[command(name = "converge-agent", version, about)]
struct Cli {
    /// Path to the agent config file.
    #[arg(long, env = "CONVERGE_CONFIG", default_value = "config/agent.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a desired-state file without deploying it.
    Validate {
        model: PathBuf,
    },
    /// Apply a desired state, deploy until idle and print the status.
    Deploy {
        model: PathBuf,
        /// Redeploy compliant resources as well.
        #[arg(long)]
        repair: bool,
        /// Restrict the trigger to these agents.
        #[arg(long = "agent")]
        agents: Vec<String>,
        /// Seconds to wait for the deploy to finish.
        #[arg(long, default_value_t = 300)]
        wait: u64,
    },
    /// Apply a desired state and keep deploying on timers until interrupted.
    Run {
        model: PathBuf,
    },
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Validate { model } => {
            let desired = load_desired_state(&model)?;
            println!(
                "{}: version {} with {} resources is valid",
                model.display(),
                desired.version,
                desired.resources.len()
            );
        }
        Command::Deploy {
            model,
            repair,
            agents,
            wait,
        } => {
            let desired = load_desired_state(&model)?;
            let (scheduler, _store) = build_scheduler(&config, builtin_registry());
            scheduler.start().await?;
            let summary = scheduler.apply_desired_state(desired).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);

            if repair || !agents.is_empty() {
                let scope = (!agents.is_empty()).then_some(agents.as_slice());
                let result = scheduler.trigger(scope, repair, DeployReason::UserTrigger).await?;
                for warning in &result.warnings {
                    warn!("{warning}");
                }
            }

            let idle = wait_idle(&scheduler, Duration::from_secs(wait)).await;
            let status = scheduler.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            scheduler.stop().await;
            if !idle {
                bail!("deploy did not finish within {wait}s");
            }
        }
        Command::Run { model } => {
            let desired = load_desired_state(&model)?;
            let (scheduler, _store) = build_scheduler(&config, builtin_registry());
            scheduler.start().await?;
            scheduler.apply_desired_state(desired).await?;
            info!(
                deploy = %config.deploy_interval,
                repair = %config.repair_interval,
                "agent running, press ctrl-c to stop"
            );
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            scheduler.stop().await;
        }
    }
    Ok(())
}
