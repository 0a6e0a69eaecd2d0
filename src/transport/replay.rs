//! Replay transport: feeds a recorded flight log back as inbound bytes
//!
//! Chunks are released with their original timing (scaled by `speed`).
//! Outbound bytes are discarded. The channels close at the end of the
//! recording.

use super::{Transport, TransportChannels};
use crate::constants::{CHANNEL_CAPACITY, SHUTDOWN_POLL_MS};
use crate::error::Result;
use crate::flightlog::{FlightLogReader, FlightStats};
use crate::state::StateSnapshot;
use bytes::Bytes;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct ReplayTransport<R: Read = BufReader<File>> {
    reader: FlightLogReader<R>,
    speed: f64,
}

impl ReplayTransport<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(FlightLogReader::open(path)?))
    }
}

impl<R: Read> ReplayTransport<R> {
    pub fn new(reader: FlightLogReader<R>) -> Self {
        Self { reader, speed: 1.0 }
    }

    /// Playback speed factor; 0 or less releases chunks without waiting
    pub fn speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    /// State at the moment recording started
    pub fn snapshot(&self) -> &StateSnapshot {
        &self.reader.snapshot
    }

    pub fn stats(&self) -> &FlightStats {
        &self.reader.stats
    }
}

/// Sleep until `deadline` in short slices so shutdown stays responsive
///
/// Returns `false` when shutdown was requested.
fn wait_until(deadline: Instant, shutdown: &AtomicBool) -> bool {
    let slice = Duration::from_millis(SHUTDOWN_POLL_MS);
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(slice));
    }
}

impl<R: Read + Send + 'static> Transport for ReplayTransport<R> {
    fn spawn(self, shutdown: Arc<AtomicBool>) -> Result<TransportChannels> {
        let (in_tx, in_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let Self { reader, speed } = self;

        std::thread::spawn(move || {
            let started = Instant::now();
            let mut chunks = 0usize;
            for chunk in reader {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("Replay stopped: {}", e);
                        break;
                    }
                };
                if speed > 0.0 {
                    let deadline = started + chunk.offset.div_f64(speed);
                    if !wait_until(deadline, &shutdown) {
                        break;
                    }
                } else if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if in_tx.blocking_send(chunk.data).is_err() {
                    break;
                }
                chunks += 1;
            }
            debug!("Replay finished after {} chunks", chunks);
        });

        // Nothing answers a recording; drain so senders never block
        tokio::spawn(async move { while out_rx.recv().await.is_some() {} });

        Ok(TransportChannels {
            rx: in_rx,
            tx: out_tx,
        })
    }

    fn is_replay(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flightlog::FlightLogWriter;
    use crate::state::VehicleState;
    use std::io::Cursor;

    fn recording() -> Vec<u8> {
        let state = VehicleState::new();
        state.gps.write().num_sats = 9;
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = FlightLogWriter::new(&mut cursor, "test.mfl", &state).unwrap();
        writer.write_chunk(b"$M>", false).unwrap();
        writer.write_chunk(b"\x00\x64\x64", false).unwrap();
        writer.finish(&state).unwrap();
        cursor.into_inner()
    }

    #[tokio::test]
    async fn test_replays_chunks_in_order() {
        let reader = FlightLogReader::new(Cursor::new(recording()), "test.mfl").unwrap();
        let transport = ReplayTransport::new(reader).speed(0.0);
        assert_eq!(transport.snapshot().gps.num_sats, 9);
        assert!(transport.is_replay());

        let mut channels = transport.spawn(Arc::new(AtomicBool::new(false))).unwrap();
        let mut received = Vec::new();
        while let Some(chunk) = channels.rx.recv().await {
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"$M>\x00\x64\x64");
    }

    #[tokio::test]
    async fn test_outbound_discarded() {
        let reader = FlightLogReader::new(Cursor::new(recording()), "test.mfl").unwrap();
        let channels = ReplayTransport::new(reader)
            .speed(0.0)
            .spawn(Arc::new(AtomicBool::new(false)))
            .unwrap();
        channels.tx.send(Bytes::from_static(b"$M<")).await.unwrap();
    }

    #[test]
    fn test_wait_until_honours_shutdown() {
        let shutdown = AtomicBool::new(true);
        assert!(!wait_until(Instant::now() + Duration::from_secs(60), &shutdown));
        let shutdown = AtomicBool::new(false);
        assert!(wait_until(Instant::now(), &shutdown));
    }
}
