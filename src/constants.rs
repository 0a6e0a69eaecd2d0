//! Application-wide constants
//!
//! Centralized constants to avoid duplication and ensure consistency.

// =============================================================================
// Requests
// =============================================================================

/// Time to wait for a reply before retrying a request (milliseconds)
pub const REQUEST_TIMEOUT_MS: u64 = 300;

/// Retries used by command helpers when the caller has no preference
pub const DEFAULT_RETRIES: u32 = 2;

/// Retries for bulk dataflash reads
pub const DATAFLASH_READ_RETRIES: u32 = 3;

/// Latency reported before any reply has been timed (seconds)
pub const DEFAULT_LATENCY_SECS: f64 = 0.2;

/// Upper bound applied to a single latency sample (seconds)
pub const MAX_LATENCY_SECS: f64 = 1.0;

// =============================================================================
// Timing - Reconnection
// =============================================================================

/// Delay between reconnection attempts (seconds)
pub const RECONNECT_DELAY_SECS: u64 = 2;

/// Delay after connection loss before retry (seconds)
pub const POST_DISCONNECT_DELAY_SECS: u64 = 3;

/// Minimum interval between rate updates (seconds)
pub const RATE_UPDATE_MIN_INTERVAL_SECS: f64 = 0.1;

/// Period of the shutdown flag check in channel loops (milliseconds)
pub const SHUTDOWN_POLL_MS: u64 = 100;

/// Default telemetry poll period (milliseconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

// =============================================================================
// Network
// =============================================================================

/// Default address of a WiFi/TCP serial bridge (ESP8266 style)
pub const DEFAULT_TCP_ADDRESS: &str = "192.168.4.1:23";

/// Default serial baud rate for flight controllers
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// TCP connect timeout (seconds)
pub const TCP_CONNECT_TIMEOUT_SECS: u64 = 3;

/// TCP keepalive idle time (seconds)
pub const TCP_KEEPALIVE_SECS: u64 = 5;

// =============================================================================
// Buffers
// =============================================================================

/// Transport read buffer size
pub const READ_BUFFER_SIZE: usize = 4096;

/// Channel capacity for async message passing
pub const CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Serial
// =============================================================================

/// Consecutive zero-byte reads before assuming port disconnected
pub const SERIAL_DISCONNECT_THRESHOLD: u32 = 10;
