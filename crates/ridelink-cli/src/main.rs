use std::io;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod config;
mod format;

use cli::{Cli, Commands};
use commands::{MonitorOptions, cmd_config, cmd_decode, cmd_monitor};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Logs go to stderr so JSON output on stdout stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let explicit = cli.config.as_deref();

    match cli.command {
        Commands::Monitor(args) => {
            let mut config = config::load(explicit)?;
            config::apply_monitor_overrides(&mut config, &args)?;
            cmd_monitor(
                config,
                MonitorOptions {
                    kind: args.kind,
                    json: args.json,
                    count: args.count,
                    quiet: cli.quiet,
                },
            )
            .await?;
        }
        Commands::Decode(args) => {
            let config = config::load(explicit)?;
            cmd_decode(args.kind, &args.payloads, args.json, &config.bounds)?;
        }
        Commands::Config { action } => {
            cmd_config(action, explicit, cli.quiet)?;
        }
    }

    Ok(())
}
