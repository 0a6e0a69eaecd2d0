//! Command-line interface definition using clap
//!
//! Flags override the matching config file values.

use crate::config::{Config, TransportKind, CONFIG_FILE};
use clap::Parser;
use std::path::PathBuf;

// =============================================================================
// CLI Definition
// =============================================================================

/// MSP ground-station link to a flight controller
#[derive(Parser, Debug, Default)]
#[command(name = "msp-link")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file
    #[arg(short, long, value_name = "FILE", default_value = CONFIG_FILE)]
    pub config: PathBuf,

    /// Enable verbose debug output
    #[arg(short, long)]
    pub verbose: bool,

    /// Serial port to use
    #[arg(long, value_name = "PORT", conflicts_with_all = ["tcp", "replay"])]
    pub serial: Option<String>,

    /// Serial baud rate
    #[arg(long, value_name = "BAUD")]
    pub baud: Option<u32>,

    /// TCP telemetry bridge (host:port)
    #[arg(long, value_name = "ADDR", conflicts_with = "replay")]
    pub tcp: Option<String>,

    /// Play back a recorded flight log
    #[arg(long, value_name = "FILE")]
    pub replay: Option<PathBuf>,

    /// Record live sessions into this directory
    #[arg(long, value_name = "DIR")]
    pub record: Option<PathBuf>,

    /// List serial ports and exit
    #[arg(long)]
    pub list_ports: bool,
}

impl Cli {
    /// Apply command line overrides to `config`
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = &self.serial {
            config.link.transport = TransportKind::Serial;
            config.link.serial_port = port.clone();
        }
        if let Some(baud) = self.baud {
            config.link.baud_rate = baud;
        }
        if let Some(address) = &self.tcp {
            config.link.transport = TransportKind::Tcp;
            config.link.tcp_address = address.clone();
        }
        if let Some(file) = &self.replay {
            config.link.transport = TransportKind::Replay;
            config.link.replay_file = Some(file.clone());
        }
        if let Some(dir) = &self.record {
            config.recording.enabled = true;
            config.recording.directory = dir.clone();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_defaults() {
        let cli = Cli::parse_from(["msp-link"]);
        assert!(!cli.verbose);
        assert_eq!(cli.config, PathBuf::from(CONFIG_FILE));
        assert!(cli.serial.is_none());

        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_cli_parse_verbose() {
        let cli = Cli::parse_from(["msp-link", "-v"]);
        assert!(cli.verbose);

        let cli = Cli::parse_from(["msp-link", "--verbose"]);
        assert!(cli.verbose);
    }

    #[test]
    fn test_serial_overrides() {
        let cli = Cli::parse_from(["msp-link", "--serial", "/dev/ttyACM0", "--baud", "57600"]);
        let mut config = Config::default();
        config.link.transport = TransportKind::Tcp;
        cli.apply(&mut config);
        assert_eq!(config.link.transport, TransportKind::Serial);
        assert_eq!(config.link.serial_port, "/dev/ttyACM0");
        assert_eq!(config.link.baud_rate, 57_600);
    }

    #[test]
    fn test_tcp_and_record() {
        let cli = Cli::parse_from(["msp-link", "--tcp", "10.0.0.1:23", "--record", "logs"]);
        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.link.transport, TransportKind::Tcp);
        assert_eq!(config.link.tcp_address, "10.0.0.1:23");
        assert!(config.recording.enabled);
        assert_eq!(config.recording.directory, PathBuf::from("logs"));
    }

    #[test]
    fn test_replay() {
        let cli = Cli::parse_from(["msp-link", "--replay", "flight.mfl"]);
        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.link.transport, TransportKind::Replay);
        assert_eq!(config.link.replay_file, Some(PathBuf::from("flight.mfl")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_conflicting_transports() {
        assert!(Cli::try_parse_from(["msp-link", "--serial", "COM3", "--tcp", "1.2.3.4:23"]).is_err());
    }
}
