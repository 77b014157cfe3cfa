mod cli;
mod config;
mod error;
mod killswitch;
mod monitoring;
mod orchestrator;
mod validation;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};

use cli::{Cli, Command};
use config::Config;
use killswitch::firewall::{DryRunFilter, IptablesFilter, TrafficFilter};
use killswitch::{LoggingRestorer, ProcessExit};
use monitoring::SysinfoLoad;
use orchestrator::{Collaborators, Orchestrator, default_registry};

fn collaborators(config: &Config, dry_run: bool) -> Collaborators {
    let filter: Arc<dyn TrafficFilter> = if dry_run || config.killswitch.dry_run {
        warn!("Dry run: the kill switch will only log firewall commands");
        Arc::new(DryRunFilter)
    } else {
        Arc::new(IptablesFilter::new(Duration::from_secs(config.killswitch.command_timeout_secs)))
    };

    Collaborators {
        load: Box::new(SysinfoLoad::new()),
        filter,
        restorer: Arc::new(LoggingRestorer),
        terminator: Arc::new(ProcessExit),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    logger::init_with_level(if cli.verbose { LevelFilter::DEBUG } else { LevelFilter::INFO });

    let config =
        Config::from_config(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Config => {
            print!("{config}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Check => {
            let registry = default_registry(&config).context("failed to build checks")?;
            let orchestrator = Orchestrator::new(&config, registry, collaborators(&config, true));

            let outcomes = orchestrator.run_once().await;
            for outcome in &outcomes {
                println!("{outcome}");
            }
            if outcomes.iter().all(|o| o.passed) {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Run => {
            let registry = default_registry(&config).context("failed to build checks")?;
            let host = collaborators(&config, cli.dry_run);
            let orchestrator = Orchestrator::new(&config, registry, host);

            orchestrator.start()?;
            tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;

            info!("Interrupt received, shutting down");
            orchestrator.deactivate().await;

            let status = orchestrator.status();
            info!(
                cycles = status.snapshot.cycle,
                all_passed = status.snapshot.all_passed(),
                last_load = status.last_load,
                completed_at = ?status.snapshot.completed_at,
                "Final status"
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}
