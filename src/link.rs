//! MSP link
//!
//! Wires the pieces of one ground-station connection together:
//!
//! ```text
//! transport bytes -> codec -> dispatcher -> VehicleState
//!                                 |-> requests (complete / fail)
//!                                 '-> broadcaster (notify)
//! requests -> output queue -> transport
//! ```
//!
//! The link is transport agnostic. A transport either drives it directly
//! through [`deliver_bytes`](MspLink::deliver_bytes) /
//! [`next_output_chunk`](MspLink::next_output_chunk) and the lifecycle calls,
//! or hands its channels to [`run`](MspLink::run).

use crate::broadcast::{Broadcaster, Category, Listener, WeakListener};
use crate::constants::{REQUEST_TIMEOUT_MS, SHUTDOWN_POLL_MS};
use crate::error::Result;
use crate::flightlog::{FlightLogWriter, FlightStats};
use crate::logging::{self, LogEntry, LogSender};
use crate::msp::{Command, DecodeError, Dispatcher, Frame, MspCode, MspCodec, Role};
use crate::request::{Callback, OutputQueue, RequestManager};
use crate::state::VehicleState;
use crate::stats::Stats;
use crate::transport::TransportChannels;
use bytes::Bytes;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Link tuning
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Time to wait for a reply before retrying
    pub request_timeout: Duration,
    /// Traffic log channel
    pub log_tx: Option<LogSender>,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT_MS),
            log_tx: None,
        }
    }
}

/// One connection to a flight controller
pub struct MspLink {
    state: Arc<VehicleState>,
    codec: Mutex<MspCodec>,
    dispatcher: Dispatcher,
    requests: Arc<RequestManager>,
    output: Arc<OutputQueue>,
    broadcaster: Arc<Broadcaster>,
    stats: Arc<Stats>,
    log_tx: Option<LogSender>,
    recorder: Mutex<Option<FlightLogWriter>>,
    connected: AtomicBool,
    replaying: AtomicBool,
}

impl MspLink {
    /// Create a link writing into `state`, with default options
    ///
    /// Must be called from within a Tokio runtime: request timers and
    /// listener delivery run on it.
    pub fn new(state: Arc<VehicleState>) -> Arc<Self> {
        Self::with_options(state, LinkOptions::default())
    }

    pub fn with_options(state: Arc<VehicleState>, options: LinkOptions) -> Arc<Self> {
        let stats = Arc::new(Stats::new());
        let output = Arc::new(OutputQueue::new());
        let requests = RequestManager::new(output.clone(), stats.clone(), options.request_timeout);
        requests.set_connected(false);

        let broadcaster = Arc::new(Broadcaster::new());
        broadcaster.spawn_delivery();

        Arc::new(Self {
            dispatcher: Dispatcher::new(state.clone()),
            state,
            codec: Mutex::new(MspCodec::new(Role::GroundStation)),
            requests,
            output,
            broadcaster,
            stats,
            log_tx: options.log_tx,
            recorder: Mutex::new(None),
            connected: AtomicBool::new(false),
            replaying: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> &Arc<VehicleState> {
        &self.state
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn requests(&self) -> &Arc<RequestManager> {
        &self.requests
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Subscribe to state changes; see [`Broadcaster::register`]
    pub fn register<L: WeakListener + ?Sized>(&self, listener: &Arc<L>) {
        self.broadcaster.register(listener);
    }

    pub fn unregister<L: Listener + ?Sized>(&self, listener: &Arc<L>) {
        self.broadcaster.unregister(listener);
    }

    /// Framing errors seen by the codec
    pub fn decode_errors(&self) -> u64 {
        self.codec.lock().error_count()
    }

    /// Median reply latency of polled telemetry
    pub fn latency(&self) -> Duration {
        self.output.latency()
    }

    // =========================================================================
    // Transport collaborator interface
    // =========================================================================

    /// Transport is up
    pub fn opened(&self) {
        self.codec.lock().reset();
        self.connected.store(true, Ordering::Release);
        self.requests.set_connected(true);
        info!("Link opened");
        logging::try_log(&self.log_tx, LogEntry::system("Link opened"), "opened");
        self.broadcaster.notify(Category::Communication.into());
    }

    /// Transport is gone
    ///
    /// Fails every pending request once and stops accepting bytes. Vehicle
    /// state is kept as last known.
    pub fn closed(&self) {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        self.requests.set_connected(false);
        self.requests.close();
        self.output.clear();
        if let Some(result) = self.stop_recording() {
            if let Err(e) = result {
                warn!("Flight log not finalized: {}", e);
            }
        }
        if was_connected {
            info!("Link closed");
            logging::try_log(&self.log_tx, LogEntry::system("Link closed"), "closed");
        }
        self.broadcaster.notify(Category::Communication.into());
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Inbound bytes, in arrival order
    pub fn deliver_bytes(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if !self.is_connected() {
            debug!("Dropping {} bytes received while closed", data.len());
            return;
        }
        self.stats.add_rx(data.len());
        self.record(data);

        let mut results = Vec::new();
        self.codec.lock().decode(data, |result| results.push(result));

        for result in results {
            match result {
                Ok(frame) => self.handle_frame(frame),
                Err(e) => self.handle_decode_error(e),
            }
        }
    }

    /// Everything queued for the transport, as one chunk
    pub fn next_output_chunk(&self) -> Option<Bytes> {
        let chunk = self.output.take_all()?;
        if self.replaying.load(Ordering::Acquire) {
            // A recording never answers: resolve requests instead of
            // letting them time out
            self.requests.complete_all();
            return None;
        }
        self.stats.add_tx(chunk.len());
        Some(chunk)
    }

    /// Replay mode: outbound frames are discarded and requests succeed
    /// with an empty reply
    pub fn set_replaying(&self, replaying: bool) {
        self.replaying.store(replaying, Ordering::Release);
    }

    fn handle_frame(&self, frame: Frame) {
        let code = frame.code;
        logging::try_log(
            &self.log_tx,
            LogEntry::protocol_in(code.name(), frame.payload.len()),
            "protocol_in",
        );
        self.output.record_reply(code);

        match self.dispatcher.dispatch(code, &frame.payload) {
            Ok(changed) => {
                self.stats.record_frame();
                self.requests.complete(code, frame.payload);
                self.broadcaster.notify(changed | Category::DataReceived);
            }
            Err(e) => {
                warn!("Cannot apply {}: {}", code, e);
                self.stats.record_dispatch_error();
                logging::try_log(
                    &self.log_tx,
                    LogEntry::error(format!("{}: {}", code, e)),
                    "dispatch_error",
                );
                self.requests.fail(code);
            }
        }
    }

    fn handle_decode_error(&self, error: DecodeError) {
        self.stats.record_framing_error();
        warn!("Dropped frame: {}", error);
        logging::try_log(&self.log_tx, LogEntry::error(error.to_string()), "decode_error");
        if let Some(code) = error.code() {
            self.requests.fail(code);
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Queue a request; see [`RequestManager::send`]
    pub fn send(
        &self,
        code: MspCode,
        payload: &[u8],
        max_retries: u32,
        callback: Option<Callback>,
    ) -> Result<()> {
        logging::try_log(
            &self.log_tx,
            LogEntry::protocol_out(code.name(), payload.len()),
            "protocol_out",
        );
        self.requests.send(code, payload, max_retries, callback)
    }

    pub fn send_command(&self, command: Command, callback: Option<Callback>) -> Result<()> {
        self.send(command.code, &command.payload, command.retries, callback)
    }

    /// Fire-and-forget telemetry poll
    pub fn poll(&self, code: MspCode) -> Result<()> {
        self.send(code, &[], 0, None)
    }

    /// Send and wait for the acknowledgement
    pub async fn command(&self, command: Command) -> Result<bool> {
        logging::try_log(
            &self.log_tx,
            LogEntry::protocol_out(command.code.name(), command.payload.len()),
            "protocol_out",
        );
        self.requests.command(command).await
    }

    /// Send and wait for the reply payload (`None` on failure)
    pub async fn request(&self, command: Command) -> Result<Option<Bytes>> {
        logging::try_log(
            &self.log_tx,
            LogEntry::protocol_out(command.code.name(), command.payload.len()),
            "protocol_out",
        );
        self.requests.request(command).await
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// Record inbound bytes to a flight log at `path`
    pub fn start_recording(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = FlightLogWriter::create(path, &self.state)?;
        let previous = self.recorder.lock().replace(writer);
        if let Some(previous) = previous {
            previous.finish(&self.state)?;
        }
        Ok(())
    }

    /// Finalize the current flight log, if any
    pub fn stop_recording(&self) -> Option<Result<FlightStats>> {
        let writer = self.recorder.lock().take()?;
        Some(writer.finish(&self.state))
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.lock().is_some()
    }

    fn record(&self, data: &[u8]) {
        let mut recorder = self.recorder.lock();
        let Some(writer) = recorder.as_mut() else {
            return;
        };
        if let Err(e) = writer.write_chunk(data, self.state.is_armed()) {
            warn!("Flight log write failed, recording stopped: {}", e);
            *recorder = None;
        }
    }

    // =========================================================================
    // Channel pump
    // =========================================================================

    /// Pump a transport's channels until it closes or `shutdown` is set
    ///
    /// Calls [`opened`](Self::opened) on entry and [`closed`](Self::closed)
    /// on exit.
    pub async fn run(&self, channels: TransportChannels, shutdown: Arc<AtomicBool>) -> Result<()> {
        let TransportChannels { mut rx, tx } = channels;
        self.opened();

        'session: loop {
            while let Some(chunk) = self.next_output_chunk() {
                match tx.try_send(chunk) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        debug!("Transport busy, dropping output chunk");
                    }
                    Err(TrySendError::Closed(_)) => break 'session,
                }
            }

            tokio::select! {
                biased;

                // Periodic shutdown check
                _ = tokio::time::sleep(Duration::from_millis(SHUTDOWN_POLL_MS)) => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                }

                msg = rx.recv() => {
                    match msg {
                        Some(data) => self.deliver_bytes(&data),
                        // Channel closed = transport stopped
                        None => break,
                    }
                }

                _ = self.output.ready() => {}
            }
        }

        self.closed();
        Ok(())
    }
}

impl Drop for MspLink {
    fn drop(&mut self) {
        self.broadcaster.close();
        self.requests.close();
    }
}

impl std::fmt::Debug for MspLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MspLink")
            .field("connected", &self.is_connected())
            .field("requests", &self.requests)
            .field("stats", &self.stats)
            .finish()
    }
}
