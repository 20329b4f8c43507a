//! Config command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use ridelink_core::SensorConfig;

use crate::cli::ConfigAction;
use crate::config;

pub fn cmd_config(action: ConfigAction, explicit: Option<&Path>, quiet: bool) -> Result<()> {
    let path = config::resolve_path(explicit);
    match action {
        ConfigAction::Path => println!("{}", path.display()),
        ConfigAction::Show => {
            let effective = config::load(explicit)?;
            let content =
                toml::to_string_pretty(&effective).context("Failed to serialize config")?;
            print!("{}", content);
        }
        ConfigAction::Init { force } => {
            config::save(&SensorConfig::default(), &path, force)?;
            if !quiet {
                eprintln!("Wrote default config to {}", path.display());
            }
        }
    }
    Ok(())
}
