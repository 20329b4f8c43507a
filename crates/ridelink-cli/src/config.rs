//! Configuration file management.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use ridelink_core::SensorConfig;

use crate::cli::MonitorArgs;

/// Default config file path
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ridelink")
        .join("config.toml")
}

/// The file in use: the explicit path if given, else the default.
pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
    explicit.map_or_else(default_path, Path::to_path_buf)
}

/// Load the config.
///
/// An explicit path must exist. A missing default file means defaults.
pub fn load(explicit: Option<&Path>) -> Result<SensorConfig> {
    let path = resolve_path(explicit);
    if explicit.is_none() && !path.exists() {
        tracing::debug!("No config at {}, using defaults", path.display());
        return Ok(SensorConfig::default());
    }
    let config = SensorConfig::load(&path)
        .with_context(|| format!("Failed to load config: {}", path.display()))?;
    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Apply `monitor` flags on top of the file config.
pub fn apply_monitor_overrides(config: &mut SensorConfig, args: &MonitorArgs) -> Result<()> {
    if let Some(host) = args.host {
        config.transport.host = host.into();
    }
    if let Some(bridge) = &args.bridge {
        config.transport.bridge = Some(bridge.clone());
    }
    if let Some(device) = &args.device {
        config.transport.device = Some(device.clone());
    }
    config.validate().context("Invalid configuration")?;
    Ok(())
}

/// Write `config` to `path`, creating parent directories.
pub fn save(config: &SensorConfig, path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "Config already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(path, content)
        .with_context(|| format!("Failed to write config: {}", path.display()))?;
    Ok(())
}
