//! Log entry types
//!
//! Traffic and link events, serializable so a front end can show or store
//! them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of protocol messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    In,  // Flight controller -> ground station
    Out, // Ground station -> flight controller
}

/// Type of log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogKind {
    /// One MSP frame
    Protocol {
        direction: Direction,
        message_name: String,
        size: usize,
    },
    /// Frame that could not be decoded or applied
    Error { message: String },
    /// Link lifecycle
    System { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String, // HH:MM:SS.mmm
    pub kind: LogKind,
}

impl LogEntry {
    #[inline]
    fn now() -> String {
        chrono::Local::now().format("%H:%M:%S%.3f").to_string()
    }

    fn with_kind(kind: LogKind) -> Self {
        Self {
            timestamp: Self::now(),
            kind,
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::with_kind(LogKind::System {
            message: message.into(),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_kind(LogKind::Error {
            message: message.into(),
        })
    }

    pub fn protocol_in(message_name: impl Into<String>, size: usize) -> Self {
        Self::with_kind(LogKind::Protocol {
            direction: Direction::In,
            message_name: message_name.into(),
            size,
        })
    }

    pub fn protocol_out(message_name: impl Into<String>, size: usize) -> Self {
        Self::with_kind(LogKind::Protocol {
            direction: Direction::Out,
            message_name: message_name.into(),
            size,
        })
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LogKind::System { message } => write!(f, "{} [SYS] {}", self.timestamp, message),
            LogKind::Error { message } => write!(f, "{} [ERR] {}", self.timestamp, message),
            LogKind::Protocol {
                direction,
                message_name,
                size,
            } => {
                let dir = match direction {
                    Direction::In => "IN",
                    Direction::Out => "OUT",
                };
                write!(
                    f,
                    "{} [MSP] {} {} ({} B)",
                    self.timestamp, dir, message_name, size
                )
            }
        }
    }
}
