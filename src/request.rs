//! Request tracking and the outbound queue
//!
//! [`RequestManager`] owns every outstanding request and the one timer
//! facility of the link: each pending request has a single Tokio task that
//! sleeps until its deadline and reports back through
//! [`RequestManager::on_timeout`]. Timers are only armed and cancelled here.
//!
//! At most one request per code is tracked. A second request for the same
//! code supersedes the first: the first request's timer is cancelled and its
//! callback dropped without being invoked. A late reply to the first request
//! then resolves the second one.
//!
//! Callbacks always run after the pending map lock has been released.

use crate::constants::{DEFAULT_LATENCY_SECS, MAX_LATENCY_SECS};
use crate::error::Result;
use crate::msp::{encode_request, Command, MspCode};
use crate::stats::Stats;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

// =============================================================================
// Completion callbacks
// =============================================================================

/// How a request reports its outcome
pub enum Callback {
    /// `true` on reply, `false` on failure
    Ack(Box<dyn FnOnce(bool) + Send>),
    /// Reply payload, or `None` on failure. An empty reply and a failure
    /// cannot be told apart by the callback alone.
    Data(Box<dyn FnOnce(Option<Bytes>) + Send>),
}

impl Callback {
    pub fn ack(f: impl FnOnce(bool) + Send + 'static) -> Self {
        Self::Ack(Box::new(f))
    }

    pub fn data(f: impl FnOnce(Option<Bytes>) + Send + 'static) -> Self {
        Self::Data(Box::new(f))
    }

    fn succeed(self, payload: Bytes) {
        match self {
            Self::Ack(f) => f(true),
            Self::Data(f) => f(Some(payload)),
        }
    }

    fn fail(self) {
        match self {
            Self::Ack(f) => f(false),
            Self::Data(f) => f(None),
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack(_) => f.write_str("Callback::Ack"),
            Self::Data(_) => f.write_str("Callback::Data"),
        }
    }
}

// =============================================================================
// Output queue
// =============================================================================

#[derive(Default)]
struct OutputInner {
    frames: VecDeque<(MspCode, Bytes)>,
    /// When the request for a latency-tracked code left the queue
    sent_at: HashMap<MspCode, Instant>,
    /// Last measured round trip per code
    latencies: HashMap<MspCode, Duration>,
}

/// Encoded frames waiting for the transport
///
/// Queuing a frame whose code is already waiting replaces the waiting frame
/// in place, so a slow link never builds a backlog of stale polls.
#[derive(Default)]
pub struct OutputQueue {
    inner: Mutex<OutputInner>,
    ready: Notify,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, code: MspCode, frame: Bytes) {
        {
            let mut inner = self.inner.lock();
            match inner.frames.iter_mut().find(|(c, _)| *c == code) {
                Some(slot) => slot.1 = frame,
                None => inner.frames.push_back((code, frame)),
            }
        }
        self.ready.notify_one();
    }

    /// Take every queued frame as one chunk, in queue order
    pub fn take_all(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        if inner.frames.is_empty() {
            return None;
        }

        let now = Instant::now();
        let len = inner.frames.iter().map(|(_, f)| f.len()).sum();
        let mut chunk = BytesMut::with_capacity(len);
        let frames: Vec<_> = inner.frames.drain(..).collect();
        for (code, frame) in frames {
            if code.is_latency_sample() {
                inner.sent_at.entry(code).or_insert(now);
            }
            chunk.extend_from_slice(&frame);
        }
        Some(chunk.freeze())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until something is queued
    pub async fn ready(&self) {
        self.ready.notified().await
    }

    /// Close the latency measurement for `code`, if one is running
    pub fn record_reply(&self, code: MspCode) {
        let mut inner = self.inner.lock();
        if let Some(sent) = inner.sent_at.remove(&code) {
            inner.latencies.insert(code, sent.elapsed());
        }
    }

    /// Median round trip over the measured codes
    ///
    /// A request still waiting for its reply counts with its age so far, so a
    /// link that stops answering shows rising latency. Samples are capped.
    pub fn latency(&self) -> Duration {
        let inner = self.inner.lock();
        if inner.latencies.is_empty() {
            return Duration::from_secs_f64(DEFAULT_LATENCY_SECS);
        }

        let cap = Duration::from_secs_f64(MAX_LATENCY_SECS);
        let mut samples: Vec<Duration> = inner
            .latencies
            .iter()
            .map(|(code, &latency)| {
                let waiting = inner
                    .sent_at
                    .get(code)
                    .map(|sent| sent.elapsed())
                    .unwrap_or_default();
                latency.max(waiting).min(cap)
            })
            .collect();
        samples.sort();
        samples[samples.len() / 2]
    }

    /// Drop queued frames and latency history
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.frames.clear();
        inner.sent_at.clear();
        inner.latencies.clear();
    }
}

impl fmt::Debug for OutputQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputQueue")
            .field("queued", &self.len())
            .finish()
    }
}

// =============================================================================
// Request manager
// =============================================================================

struct Pending {
    generation: u64,
    frame: Bytes,
    tries: u32,
    max_retries: u32,
    callback: Option<Callback>,
    timer: JoinHandle<()>,
}

enum Expired {
    Retry(Bytes, u32),
    Fail(Option<Callback>, u32),
}

/// Pending requests keyed by code
pub struct RequestManager {
    me: Weak<RequestManager>,
    pending: Mutex<HashMap<MspCode, Pending>>,
    output: Arc<OutputQueue>,
    stats: Arc<Stats>,
    runtime: Handle,
    timeout: Duration,
    next_generation: AtomicU64,
    connected: AtomicBool,
}

impl RequestManager {
    /// Create a manager whose timers run on the current Tokio runtime
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(output: Arc<OutputQueue>, stats: Arc<Stats>, timeout: Duration) -> Arc<Self> {
        let runtime = Handle::current();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            pending: Mutex::new(HashMap::new()),
            output,
            stats,
            runtime,
            timeout,
            next_generation: AtomicU64::new(1),
            connected: AtomicBool::new(true),
        })
    }

    pub fn output(&self) -> &Arc<OutputQueue> {
        &self.output
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, code: MspCode) -> bool {
        self.pending.lock().contains_key(&code)
    }

    /// Encode and queue a request
    ///
    /// The request is tracked when `max_retries > 0` or a callback is given;
    /// otherwise it is fire and forget.
    ///
    /// The callback runs on whichever thread resolves the request: inline in
    /// [`complete`](Self::complete) or [`fail`](Self::fail), which the link
    /// calls from the decode path of `deliver_bytes`, or on the timer task
    /// once retries run out. It must return quickly and must not block. No
    /// manager lock is held while it runs, so it may send further requests.
    pub fn send(
        &self,
        code: MspCode,
        payload: &[u8],
        max_retries: u32,
        callback: Option<Callback>,
    ) -> Result<()> {
        let frame = encode_request(code, payload)?;

        if max_retries > 0 || callback.is_some() {
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let superseded = {
                let mut pending = self.pending.lock();
                pending.insert(
                    code,
                    Pending {
                        generation,
                        frame: frame.clone(),
                        tries: 0,
                        max_retries,
                        callback,
                        timer: self.arm(code, generation),
                    },
                )
            };
            if let Some(old) = superseded {
                old.timer.abort();
                debug!("{} superseded by a newer request", code);
            }
        }

        self.output.push(code, frame);
        Ok(())
    }

    pub fn send_command(&self, command: Command, callback: Option<Callback>) -> Result<()> {
        self.send(command.code, &command.payload, command.retries, callback)
    }

    /// Send and wait for the acknowledgement
    pub async fn command(&self, command: Command) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send_command(
            command,
            Some(Callback::ack(move |ok| {
                let _ = tx.send(ok);
            })),
        )?;
        // A dropped sender means the request was superseded
        Ok(rx.await.unwrap_or(false))
    }

    /// Send and wait for the reply payload
    ///
    /// The reply is handed over through a channel: only a send runs on the
    /// decode path, and the awaiting task resumes on the runtime.
    pub async fn request(&self, command: Command) -> Result<Option<Bytes>> {
        let (tx, rx) = oneshot::channel();
        self.send_command(
            command,
            Some(Callback::data(move |data| {
                let _ = tx.send(data);
            })),
        )?;
        Ok(rx.await.unwrap_or(None))
    }

    /// A reply for `code` arrived and was applied
    ///
    /// Returns whether a pending request was resolved. Replies nobody is
    /// waiting for (telemetry polls, superseded requests) return `false`.
    /// The request's callback has run by the time this returns.
    pub fn complete(&self, code: MspCode, payload: Bytes) -> bool {
        let Some(pending) = self.pending.lock().remove(&code) else {
            return false;
        };
        pending.timer.abort();
        if let Some(callback) = pending.callback {
            callback.succeed(payload);
        }
        true
    }

    /// The flight controller rejected `code` or its reply could not be applied
    pub fn fail(&self, code: MspCode) -> bool {
        let Some(pending) = self.pending.lock().remove(&code) else {
            return false;
        };
        pending.timer.abort();
        self.stats.record_request_failure();
        if let Some(callback) = pending.callback {
            callback.fail();
        }
        true
    }

    /// Resolve every pending request with an empty reply
    ///
    /// Used while replaying a recording, where nothing will ever answer.
    pub fn complete_all(&self) {
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for pending in drained {
            pending.timer.abort();
            if let Some(callback) = pending.callback {
                callback.succeed(Bytes::new());
            }
        }
    }

    /// Fail every pending request once and cancel all timers
    pub fn close(&self) {
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            debug!("Cancelling {} pending requests", drained.len());
        }
        for pending in drained {
            pending.timer.abort();
            self.stats.record_request_failure();
            if let Some(callback) = pending.callback {
                callback.fail();
            }
        }
    }

    /// Spawn the timeout task for one attempt
    fn arm(&self, code: MspCode, generation: u64) -> JoinHandle<()> {
        let me = self.me.clone();
        let deadline = Instant::now() + self.timeout;
        self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(manager) = me.upgrade() {
                manager.on_timeout(code, generation);
            }
        })
    }

    /// No reply before the deadline: retry or give up
    fn on_timeout(&self, code: MspCode, generation: u64) {
        let expired = {
            let mut pending = self.pending.lock();
            let Some(entry) = pending.get_mut(&code) else {
                return;
            };
            if entry.generation != generation {
                return;
            }

            entry.tries += 1;
            if entry.tries > entry.max_retries {
                let tries = entry.tries;
                let callback = pending.remove(&code).and_then(|p| p.callback);
                Expired::Fail(callback, tries)
            } else {
                entry.timer = self.arm(code, generation);
                Expired::Retry(entry.frame.clone(), entry.tries)
            }
        };

        match expired {
            Expired::Retry(frame, tries) => {
                self.stats.record_retry();
                if self.is_connected() {
                    warn!("Retrying {} (attempt {})", code, tries + 1);
                    self.output.push(code, frame);
                } else {
                    debug!("Link down, skipping retry of {}", code);
                }
            }
            Expired::Fail(callback, tries) => {
                warn!("{} failed after {} attempts", code, tries);
                self.stats.record_request_failure();
                if let Some(callback) = callback {
                    callback.fail();
                }
            }
        }
    }
}

impl fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestManager")
            .field("pending", &self.pending_count())
            .field("timeout", &self.timeout)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Drop for RequestManager {
    fn drop(&mut self) {
        for (_, pending) in self.pending.get_mut().drain() {
            pending.timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::REQUEST_TIMEOUT_MS;
    use crate::msp::commands;

    const TIMEOUT: Duration = Duration::from_millis(REQUEST_TIMEOUT_MS);

    fn manager() -> Arc<RequestManager> {
        RequestManager::new(Arc::new(OutputQueue::new()), Arc::new(Stats::new()), TIMEOUT)
    }

    fn recorder() -> (Arc<Mutex<Vec<bool>>>, Callback) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        (calls, Callback::ack(move |ok| sink.lock().push(ok)))
    }

    /// Sleep past one timeout period
    async fn one_period() {
        tokio::time::sleep(TIMEOUT + Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound() {
        let requests = manager();
        let (calls, callback) = recorder();
        requests.send(MspCode::Status, &[], 2, Some(callback)).unwrap();

        let mut attempts = 0;
        for _ in 0..6 {
            if requests.output().take_all().is_some() {
                attempts += 1;
            }
            one_period().await;
        }

        assert_eq!(attempts, 3);
        assert_eq!(*calls.lock(), vec![false]);
        assert_eq!(requests.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_stops_retries() {
        let requests = manager();
        let (calls, callback) = recorder();
        requests.send(MspCode::Status, &[], 2, Some(callback)).unwrap();
        requests.output().take_all();

        one_period().await;
        assert!(requests.output().take_all().is_some());

        assert!(requests.complete(MspCode::Status, Bytes::new()));
        for _ in 0..5 {
            one_period().await;
            assert!(requests.output().take_all().is_none());
        }
        assert_eq!(*calls.lock(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_supersedes_first() {
        let requests = manager();
        let (first, cb1) = recorder();
        let (second, cb2) = recorder();
        requests.send(MspCode::Ident, &[], 2, Some(cb1)).unwrap();
        requests.send(MspCode::Ident, &[], 2, Some(cb2)).unwrap();
        assert_eq!(requests.output().len(), 1);

        assert!(requests.complete(MspCode::Ident, Bytes::new()));
        // Late reply to the first request: nobody is waiting any more
        assert!(!requests.complete(MspCode::Ident, Bytes::new()));

        for _ in 0..5 {
            one_period().await;
        }
        assert!(first.lock().is_empty());
        assert_eq!(*second.lock(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_fails_everything_once() {
        let requests = manager();
        let (a, cb_a) = recorder();
        let (b, cb_b) = recorder();
        requests.send(MspCode::Status, &[], 5, Some(cb_a)).unwrap();
        requests.send(MspCode::EepromWrite, &[], 0, Some(cb_b)).unwrap();

        requests.close();
        for _ in 0..10 {
            one_period().await;
        }
        assert_eq!(*a.lock(), vec![false]);
        assert_eq!(*b.lock(), vec![false]);
        assert_eq!(requests.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_and_forget_is_not_tracked() {
        let requests = manager();
        requests.send(MspCode::Attitude, &[], 0, None).unwrap();
        assert_eq!(requests.pending_count(), 0);
        assert!(requests.output().take_all().is_some());
        one_period().await;
        assert!(requests.output().take_all().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_frames_while_disconnected() {
        let requests = manager();
        let (calls, callback) = recorder();
        requests.send(MspCode::Status, &[], 1, Some(callback)).unwrap();
        requests.output().take_all();
        requests.set_connected(false);

        one_period().await;
        assert!(requests.output().take_all().is_none());
        one_period().await;
        assert_eq!(*calls.lock(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_request() {
        let requests = manager();
        let reply = Bytes::from_static(&[1, 2, 3]);
        let responder = {
            let requests = requests.clone();
            let reply = reply.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                requests.complete(MspCode::DataflashRead, reply);
            }
        };
        let (data, _) = tokio::join!(requests.request(commands::dataflash_read(0)), responder);
        assert_eq!(data.unwrap(), Some(reply));
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_runs_inline_and_may_send() {
        let requests = manager();
        let seen = Arc::new(Mutex::new(None));
        let callback = {
            let requests = requests.clone();
            let seen = seen.clone();
            Callback::data(move |data| {
                *seen.lock() = data;
                requests
                    .send_command(commands::eeprom_write(), None)
                    .unwrap();
            })
        };
        requests
            .send(MspCode::DataflashRead, &[], 0, Some(callback))
            .unwrap();

        assert!(requests.complete(MspCode::DataflashRead, Bytes::from_static(&[7])));
        // Resolved before `complete` returned, follow-up already tracked
        assert_eq!(*seen.lock(), Some(Bytes::from_static(&[7])));
        assert!(requests.is_pending(MspCode::EepromWrite));
        assert!(!requests.is_pending(MspCode::DataflashRead));
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_request_failure_is_none() {
        let requests = manager();
        let data = requests.request(commands::dataflash_read(0)).await.unwrap();
        assert_eq!(data, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_command() {
        let requests = manager();
        let pending = {
            let requests = requests.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                requests.fail(MspCode::EepromWrite);
            }
        };
        let (ok, _) = tokio::join!(requests.command(commands::eeprom_write()), pending);
        assert!(!ok.unwrap());
    }

    #[test]
    fn test_output_queue_replaces_same_code() {
        let queue = OutputQueue::new();
        queue.push(MspCode::Status, Bytes::from_static(b"a"));
        queue.push(MspCode::Attitude, Bytes::from_static(b"b"));
        queue.push(MspCode::Status, Bytes::from_static(b"c"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.take_all().unwrap(), Bytes::from_static(b"cb"));
        assert!(queue.is_empty());
        assert!(queue.take_all().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_median() {
        let queue = OutputQueue::new();
        assert_eq!(queue.latency(), Duration::from_millis(200));

        for (code, ms) in [
            (MspCode::Status, 20),
            (MspCode::Attitude, 40),
            (MspCode::Altitude, 90),
        ] {
            queue.push(code, Bytes::from_static(b"x"));
            queue.take_all();
            tokio::time::advance(Duration::from_millis(ms)).await;
            queue.record_reply(code);
        }
        assert_eq!(queue.latency(), Duration::from_millis(40));

        // Identity polls are not latency samples
        queue.push(MspCode::Ident, Bytes::from_static(b"x"));
        queue.take_all();
        queue.record_reply(MspCode::Ident);
        assert_eq!(queue.latency(), Duration::from_millis(40));
    }
}
