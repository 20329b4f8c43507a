//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use ridelink_core::HostPreference;
use ridelink_types::SensorKind;

#[derive(Debug, Parser)]
#[command(name = "ridelink")]
#[command(author, version, about = "Monitor BLE fitness sensors", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (defaults to <config dir>/ridelink/config.toml)
    #[arg(long, global = true, env = "RIDELINK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Connect to a sensor and print its readings until interrupted
    Monitor(MonitorArgs),

    /// Decode captured notification payloads
    Decode(DecodeArgs),

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// BLE host selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HostArg {
    /// Bridge if one is configured, otherwise in-process
    Auto,
    /// In-process Bluetooth stack
    Native,
    /// External BLE host over TCP
    Bridge,
    /// Synthetic sensors
    Mock,
}

impl From<HostArg> for HostPreference {
    fn from(host: HostArg) -> Self {
        match host {
            HostArg::Auto => HostPreference::Auto,
            HostArg::Native => HostPreference::Native,
            HostArg::Bridge => HostPreference::Bridge,
            HostArg::Mock => HostPreference::Mock,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct MonitorArgs {
    /// Sensor kind (power, heart-rate, cadence, treadmill)
    #[arg(short, long)]
    pub kind: SensorKind,

    /// BLE host to use (overrides config)
    #[arg(long, value_enum)]
    pub host: Option<HostArg>,

    /// Bridge endpoint as host:port (overrides config)
    #[arg(long, env = "RIDELINK_BRIDGE")]
    pub bridge: Option<String>,

    /// Only connect to a device whose name contains this
    #[arg(short, long, env = "RIDELINK_DEVICE")]
    pub device: Option<String>,

    /// Print events as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Stop after this many readings (0 for no limit)
    #[arg(short = 'n', long, default_value = "0")]
    pub count: u64,
}

#[derive(Debug, Clone, Args)]
pub struct DecodeArgs {
    /// Sensor kind the payloads came from
    #[arg(short, long)]
    pub kind: SensorKind,

    /// Payloads in hex, one per notification, in arrival order
    #[arg(required = true)]
    pub payloads: Vec<String>,

    /// Print results as JSON lines
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, Subcommand)]
pub enum ConfigAction {
    /// Print the config file path
    Path,
    /// Print the effective configuration
    Show,
    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_monitor() {
        let cli = Cli::try_parse_from([
            "ridelink", "monitor", "--kind", "hr", "--host", "mock", "--json", "-n", "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Monitor(args) => {
                assert_eq!(args.kind, SensorKind::HeartRate);
                assert_eq!(args.host, Some(HostArg::Mock));
                assert!(args.json);
                assert_eq!(args.count, 5);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_decode() {
        let cli = Cli::try_parse_from(["ridelink", "-v", "decode", "-k", "power", "0000c800"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Decode(args) => {
                assert_eq!(args.kind, SensorKind::Power);
                assert_eq!(args.payloads, vec!["0000c800"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(Cli::try_parse_from(["ridelink", "monitor", "--kind", "rowing"]).is_err());
    }

    #[test]
    fn test_decode_requires_payload() {
        assert!(Cli::try_parse_from(["ridelink", "decode", "--kind", "power"]).is_err());
    }
}
