//! Centralized error types for the link
//!
//! All link errors are represented by the `LinkError` enum.
//! Use `Result<T>` as shorthand for `std::result::Result<T, LinkError>`.
//!
//! Wire-level problems (bad checksum, short payload...) are not errors in
//! this sense: the codec and dispatcher report them as plain values and the
//! stream keeps flowing. See `msp::codec::DecodeError` and
//! `msp::dispatch::DispatchError`.

use std::fmt;
use std::path::PathBuf;

/// All link errors
#[derive(Debug)]
pub enum LinkError {
    // === Transport ===
    /// Failed to open serial port
    SerialOpen {
        port: String,
        source: std::io::Error,
    },
    /// Failed to connect to a TCP telemetry bridge
    TcpConnect {
        address: String,
        source: std::io::Error,
    },

    // === Protocol ===
    /// Payload does not fit in a v1 frame (length is a single byte)
    PayloadTooLarge { code: u8, len: usize },
    /// The link was closed while the operation was in flight
    LinkClosed,
    /// No switch range is configured for the requested mode
    NoModeRange { mode_id: u8 },
    /// Vehicle is a recording and cannot be commanded
    ReadOnly,

    // === Flight log ===
    /// Flight log header is not recognized
    FlightLogHeader { path: PathBuf },
    /// Flight log state or stats block could not be (de)serialized
    FlightLogFormat { reason: String },

    // === IO ===
    /// File system operation failed
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Invalid config value
    ConfigValidation { field: &'static str, reason: String },

    // === Runtime ===
    /// Tokio runtime creation failed
    Runtime { source: std::io::Error },
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SerialOpen { source, .. }
            | Self::TcpConnect { source, .. }
            | Self::Io { source, .. }
            | Self::Runtime { source } => Some(source),
            _ => None,
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerialOpen { port, .. } => write!(f, "Cannot open serial port: {}", port),
            Self::TcpConnect { address, .. } => write!(f, "Cannot connect to {}", address),
            Self::PayloadTooLarge { code, len } => {
                write!(f, "Payload for MSP {} too large: {} bytes (max 255)", code, len)
            }
            Self::LinkClosed => write!(f, "Link closed"),
            Self::NoModeRange { mode_id } => {
                write!(f, "No aux channel range configured for mode {}", mode_id)
            }
            Self::ReadOnly => write!(f, "Replayed flight cannot be commanded"),
            Self::FlightLogHeader { path } => {
                write!(f, "Not a flight log: {}", path.display())
            }
            Self::FlightLogFormat { reason } => write!(f, "Invalid flight log: {}", reason),
            Self::Io { path, .. } => write!(f, "IO error: {}", path.display()),
            Self::ConfigValidation { field, reason } => {
                write!(f, "Invalid {}: {}", field, reason)
            }
            Self::Runtime { .. } => write!(f, "Failed to create runtime"),
        }
    }
}

/// Alias for Result with LinkError
pub type Result<T> = std::result::Result<T, LinkError>;
