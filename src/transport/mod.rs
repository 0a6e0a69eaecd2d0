//! Byte pipes to a flight controller
//!
//! A transport only moves bytes. MSP framing, retries and state belong to
//! [`MspLink`](crate::link::MspLink); reconnecting belongs to the runner.
//!
//! | Transport | I/O model |
//! |-----------|-----------|
//! | [`SerialTransport`] | blocking reader and writer threads |
//! | [`TcpTransport`] | tokio tasks over a socket2-tuned stream |
//! | [`ReplayTransport`] | one thread pacing chunks from a flight log |

pub mod replay;
pub mod serial;
pub mod tcp;

pub use replay::ReplayTransport;
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

use crate::error::Result;
use bytes::Bytes;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Both directions of a running transport
///
/// `rx` yields `None` once the transport is gone (shutdown, lost port,
/// end of recording). Dropping `tx` asks the writer side to stop.
pub struct TransportChannels {
    /// Bytes read from the flight controller
    pub rx: mpsc::Receiver<Bytes>,
    /// Bytes to write to the flight controller
    pub tx: mpsc::Sender<Bytes>,
}

/// Something that can be opened and then pumped through channels
pub trait Transport: Send + 'static {
    /// Open the underlying port or stream and start its I/O
    ///
    /// Fails when the port cannot be opened or the peer refuses the
    /// connection. Once spawned, the transport runs until `shutdown` is
    /// set or its I/O fails, then closes `rx`.
    fn spawn(self, shutdown: Arc<AtomicBool>) -> Result<TransportChannels>;

    /// Outbound bytes go nowhere; no reply will ever arrive
    fn is_replay(&self) -> bool {
        false
    }
}
