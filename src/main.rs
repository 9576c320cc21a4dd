use std::process::ExitCode;

use clap::Parser;
use colored::*;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use conectify_bridge::bridge::{BridgeOrchestrator, Identity, OperationOutcome};
use conectify_bridge::cli::{self, Args, Command};
use conectify_bridge::config::{self, BridgeConfig};
use conectify_bridge::error::Result;

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

fn print_outcome(identity: Identity, outcome: &OperationOutcome) {
    if outcome.success {
        eprintln!("{}", format!("  {identity}: {}", outcome.message).bright_green());
    } else {
        eprintln!("{}", format!("  {identity}: {}", outcome.message).bright_red());
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn wait_for_ctrl_c(bridge: &BridgeOrchestrator) -> Result<()> {
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());
    tokio::signal::ctrl_c().await?;
    eprintln!("{}", "  Shutting down...".bright_blue());
    bridge.stop().await
}

async fn execute(command: Command, config: BridgeConfig) -> Result<ExitCode> {
    match command {
        Command::Run => {
            let bridge = BridgeOrchestrator::new(config);
            let addr = bridge.start().await?;
            eprintln!("{}", format!("  Relay listening on ws://{addr}").bright_green());
            for (identity, outcome) in bridge.configure_all().await {
                print_outcome(identity, &outcome);
            }
            wait_for_ctrl_c(&bridge).await?;
        }
        Command::Relay => {
            let bridge = BridgeOrchestrator::new(config);
            let addr = bridge.start().await?;
            eprintln!("{}", format!("  Relay listening on ws://{addr}").bright_green());
            wait_for_ctrl_c(&bridge).await?;
        }
        Command::Status => {
            let bridge = BridgeOrchestrator::new(config);
            for (identity, outcome) in bridge.configure_all().await {
                print_outcome(identity, &outcome);
            }
            print_json(&bridge.get_status())?;
            bridge.registry().shutdown().await;
        }
        Command::Sync { name } => {
            let bridge = BridgeOrchestrator::new(config);
            for (identity, outcome) in bridge.configure_all().await {
                print_outcome(identity, &outcome);
            }
            let outcome = bridge.sync_entity(&name).await;
            print_json(&outcome)?;
            bridge.registry().shutdown().await;
            if !outcome.success {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Translate { file } => {
            print_json(&cli::translate_file(&file)?)?;
        }
        Command::CheckPaths => {
            let checks = config::check_paths(&config);
            for check in &checks {
                let path = check
                    .path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".to_string());
                let line = format!("  {}: {path} ({})", check.identity, check.message);
                if check.valid {
                    eprintln!("{}", line.bright_green());
                } else {
                    eprintln!("{}", line.bright_red());
                }
            }
            if checks.iter().any(|c| !c.valid) {
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match cli::load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {e}", "error:".bright_red());
            return ExitCode::from(2);
        }
    };
    init_tracing(&config.log_level);

    match execute(args.command, config).await {
        Ok(code) => code,
        Err(e) if e.is_fatal() => {
            eprintln!("{} {e}", "fatal:".bright_red().bold());
            ExitCode::from(3)
        }
        Err(e) => {
            eprintln!("{} {e}", "error:".bright_red());
            ExitCode::FAILURE
        }
    }
}
