//! Configuration management
//!
//! TOML file, every section optional. Missing or unreadable files fall back
//! to defaults; command line flags override what the file says.

use crate::constants::{
    DEFAULT_BAUD_RATE, DEFAULT_POLL_INTERVAL_MS, DEFAULT_RETRIES, DEFAULT_TCP_ADDRESS,
    REQUEST_TIMEOUT_MS,
};
use crate::error::{LinkError, Result};
use crate::msp::MspCode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default config file name, looked up in the working directory
pub const CONFIG_FILE: &str = "msp-link.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub link: LinkConfig,
    pub requests: RequestsConfig,
    pub telemetry: TelemetryConfig,
    pub recording: RecordingConfig,
}

// =============================================================================
// Link
// =============================================================================

/// How bytes reach the flight controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// USB or UART serial port
    #[default]
    Serial,
    /// WiFi/TCP serial bridge
    Tcp,
    /// Recorded flight log
    Replay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub transport: TransportKind,

    /// Serial port name (empty = first USB port found)
    /// Only used when transport = serial
    pub serial_port: String,
    pub baud_rate: u32,

    /// host:port of the telemetry bridge
    /// Only used when transport = tcp
    pub tcp_address: String,

    /// Flight log to play back
    /// Only used when transport = replay
    pub replay_file: Option<PathBuf>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Serial,
            serial_port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            tcp_address: DEFAULT_TCP_ADDRESS.to_string(),
            replay_file: None,
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestsConfig {
    /// Reply timeout before a retry (ms)
    pub timeout_ms: u64,
    /// Retries for commands sent without an explicit count
    pub default_retries: u32,
}

impl Default for RequestsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: REQUEST_TIMEOUT_MS,
            default_retries: DEFAULT_RETRIES,
        }
    }
}

impl RequestsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// =============================================================================
// Telemetry
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub poll_interval_ms: u64,
    /// Firmware names, `MSP_` prefix optional
    pub poll_codes: Vec<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            poll_codes: [
                MspCode::Status,
                MspCode::Attitude,
                MspCode::Altitude,
                MspCode::Analog,
                MspCode::RawGps,
                MspCode::CompGps,
                MspCode::Rc,
            ]
            .iter()
            .map(|code| code.name().to_string())
            .collect(),
        }
    }
}

impl TelemetryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Resolved poll codes; unknown names are skipped with a warning
    pub fn codes(&self) -> Vec<MspCode> {
        self.poll_codes
            .iter()
            .filter_map(|name| {
                let code = MspCode::from_name(name);
                if code.is_none() {
                    warn!("Unknown poll code '{}' ignored", name);
                }
                code
            })
            .collect()
    }
}

// =============================================================================
// Recording
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Record every live session
    pub enabled: bool,
    pub directory: PathBuf,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("flightlogs"),
        }
    }
}

impl RecordingConfig {
    /// Fresh flight log path named after the local time
    pub fn next_path(&self) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        self.directory.join(format!("{}.mfl", stamp))
    }
}

// =============================================================================
// Load / save
// =============================================================================

impl Config {
    /// Reject values the link cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.requests.timeout_ms == 0 {
            return Err(LinkError::ConfigValidation {
                field: "requests.timeout_ms",
                reason: "must be greater than 0".into(),
            });
        }
        if self.telemetry.poll_interval_ms == 0 {
            return Err(LinkError::ConfigValidation {
                field: "telemetry.poll_interval_ms",
                reason: "must be greater than 0".into(),
            });
        }
        if self.link.baud_rate == 0 {
            return Err(LinkError::ConfigValidation {
                field: "link.baud_rate",
                reason: "must be greater than 0".into(),
            });
        }
        if let Some(name) = self
            .telemetry
            .poll_codes
            .iter()
            .find(|name| MspCode::from_name(name).is_none())
        {
            return Err(LinkError::ConfigValidation {
                field: "telemetry.poll_codes",
                reason: format!("unknown message '{}'", name),
            });
        }
        if self.link.transport == TransportKind::Replay && self.link.replay_file.is_none() {
            return Err(LinkError::ConfigValidation {
                field: "link.replay_file",
                reason: "required when transport = \"replay\"".into(),
            });
        }
        Ok(())
    }
}

/// Load config from `path`, falling back to defaults
pub fn load(path: &Path) -> Config {
    if !path.exists() {
        return Config::default();
    }

    match fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!("Config parse error in {:?}: {}, using defaults", path, e);
                Config::default()
            }
        },
        Err(e) => {
            warn!("Failed to read config {:?}: {}, using defaults", path, e);
            Config::default()
        }
    }
}

/// Save config to `path`
pub fn save(path: &Path, config: &Config) -> Result<()> {
    let content =
        toml::to_string_pretty(config).map_err(|e| LinkError::ConfigValidation {
            field: "config",
            reason: e.to_string(),
        })?;
    fs::write(path, content).map_err(|e| LinkError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.link.transport, TransportKind::Serial);
        assert_eq!(config.link.baud_rate, 115_200);
        assert_eq!(config.link.tcp_address, "192.168.4.1:23");
        assert_eq!(config.requests.timeout(), Duration::from_millis(300));
        assert_eq!(config.requests.default_retries, 2);
        assert_eq!(config.telemetry.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.telemetry.codes().len(), 7);
        assert!(!config.recording.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_transport_toml() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            transport: TransportKind,
        }

        let tcp = toml::to_string(&Wrapper {
            transport: TransportKind::Tcp,
        })
        .unwrap();
        assert!(tcp.contains("transport = \"tcp\""));

        let replay: Wrapper = toml::from_str("transport = \"replay\"").unwrap();
        assert_eq!(replay.transport, TransportKind::Replay);
    }

    #[test]
    fn test_partial_section() {
        let config: Config = toml::from_str(
            r#"
[link]
transport = "tcp"
tcp_address = "10.0.0.5:2323"

[telemetry]
poll_codes = ["STATUS", "MSP_ATTITUDE"]
"#,
        )
        .unwrap();

        assert_eq!(config.link.transport, TransportKind::Tcp);
        assert_eq!(config.link.tcp_address, "10.0.0.5:2323");
        assert_eq!(config.link.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(
            config.telemetry.codes(),
            vec![MspCode::Status, MspCode::Attitude]
        );
        assert_eq!(config.requests, RequestsConfig::default());
    }

    #[test]
    fn test_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.requests.timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(LinkError::ConfigValidation {
                field: "requests.timeout_ms",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_code() {
        let mut config = Config::default();
        config.telemetry.poll_codes.push("MSP_BOGUS".into());
        assert!(config.validate().is_err());
        // Unknown names are skipped when resolving
        assert_eq!(config.telemetry.codes().len(), 7);
    }

    #[test]
    fn test_validate_replay_needs_file() {
        let mut config = Config::default();
        config.link.transport = TransportKind::Replay;
        assert!(config.validate().is_err());
        config.link.replay_file = Some(PathBuf::from("flight.mfl"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_then_load() {
        let path = std::env::temp_dir().join(format!("msp-link-config-{}.toml", std::process::id()));
        let mut config = Config::default();
        config.link.serial_port = "/dev/ttyUSB1".into();
        config.recording.enabled = true;

        save(&path, &config).unwrap();
        let loaded = load(&path);
        let _ = fs::remove_file(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let config = load(Path::new("/definitely/not/here.toml"));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_recording_path() {
        let path = RecordingConfig::default().next_path();
        assert!(path.starts_with("flightlogs"));
        assert_eq!(path.extension().unwrap(), "mfl");
    }
}
