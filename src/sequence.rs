//! Command sequencer
//!
//! Runs a list of requests one after the other: each step is sent once the
//! previous one succeeded, and the first failure ends the sequence. A step
//! may look at its reply and queue follow-up steps, which is how
//! open-ended transfers (an iNav mission of unknown length) are expressed.

use crate::error::Result;
use crate::msp::{commands, Command, MspCode};
use crate::request::{Callback, RequestManager};
use crate::state::{Waypoint, LAST_WAYPOINT_FLAG};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Offset of the last-waypoint flag in an iNav MSP_WP reply
const INAV_WP_FLAG_OFFSET: usize = 20;

/// What to do after a step succeeded
pub enum Flow {
    /// Carry on with the remaining steps
    Next,
    /// Run these steps before the remaining ones
    Insert(Vec<Step>),
    /// Stop here, successfully
    Finish,
}

type Continuation = Box<dyn FnOnce(&[u8]) -> Flow + Send>;

/// One request of a sequence
pub struct Step {
    command: Command,
    then: Option<Continuation>,
}

impl Step {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            then: None,
        }
    }

    /// Inspect the reply before deciding how to continue
    pub fn then(mut self, f: impl FnOnce(&[u8]) -> Flow + Send + 'static) -> Self {
        self.then = Some(Box::new(f));
        self
    }

    pub fn code(&self) -> MspCode {
        self.command.code
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("code", &self.command.code)
            .field("then", &self.then.is_some())
            .finish()
    }
}

/// How a sequence ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every step succeeded (or a step finished the sequence early)
    Completed { steps: usize },
    /// Step number `step` (0-based) for `code` failed; nothing after it ran
    Failed { step: usize, code: MspCode },
    /// A step was superseded by another request for the same code, or the
    /// request manager went away
    Abandoned,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

type Done = Box<dyn FnOnce(Outcome) + Send>;

struct Progress {
    name: &'static str,
    steps: VecDeque<Step>,
    completed: usize,
    done: Option<Done>,
}

/// An ordered list of steps
#[derive(Debug)]
pub struct Sequence {
    name: &'static str,
    steps: VecDeque<Step>,
}

impl Sequence {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: VecDeque::new(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push_back(step);
        self
    }

    pub fn command(self, command: Command) -> Self {
        self.step(Step::new(command))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Start the sequence; `done` is called exactly once with the outcome
    ///
    /// Steps advance from the request manager's completion callbacks, so
    /// nothing blocks between them.
    pub fn start(
        self,
        requests: &Arc<RequestManager>,
        done: impl FnOnce(Outcome) + Send + 'static,
    ) -> Result<()> {
        debug!("Starting {} ({} steps)", self.name, self.steps.len());
        let progress = Arc::new(Mutex::new(Progress {
            name: self.name,
            steps: self.steps,
            completed: 0,
            done: Some(Box::new(done)),
        }));
        advance(Arc::downgrade(requests), progress)
    }

    /// Run the sequence to its end
    pub async fn run(self, requests: &Arc<RequestManager>) -> Result<Outcome> {
        let (tx, rx) = oneshot::channel();
        let name = self.name;
        self.start(requests, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        Ok(rx.await.unwrap_or_else(|_| {
            warn!("{} abandoned", name);
            Outcome::Abandoned
        }))
    }
}

/// Send the next step, or report completion when none is left
fn advance(requests: Weak<RequestManager>, progress: Arc<Mutex<Progress>>) -> Result<()> {
    let next = {
        let mut p = progress.lock();
        match p.steps.pop_front() {
            Some(step) => Ok(step),
            None => Err((p.done.take(), p.completed, p.name)),
        }
    };

    let step = match next {
        Ok(step) => step,
        Err((done, steps, name)) => {
            debug!("{} completed", name);
            if let Some(done) = done {
                done(Outcome::Completed { steps });
            }
            return Ok(());
        }
    };

    let Some(manager) = requests.upgrade() else {
        return Ok(());
    };
    let Step { command, then } = step;
    let code = command.code;
    let weak = requests.clone();
    let state = progress.clone();
    let callback = Callback::data(move |reply: Option<Bytes>| {
        on_reply(weak, state, code, then, reply);
    });

    if let Err(e) = manager.send_command(command, Some(callback)) {
        finish_failed(&progress, code);
        return Err(e);
    }
    Ok(())
}

fn on_reply(
    requests: Weak<RequestManager>,
    progress: Arc<Mutex<Progress>>,
    code: MspCode,
    then: Option<Continuation>,
    reply: Option<Bytes>,
) {
    let Some(payload) = reply else {
        finish_failed(&progress, code);
        return;
    };

    let flow = then.map_or(Flow::Next, |f| f(&payload));
    {
        let mut p = progress.lock();
        p.completed += 1;
        match flow {
            Flow::Next => {}
            Flow::Insert(steps) => {
                for step in steps.into_iter().rev() {
                    p.steps.push_front(step);
                }
            }
            Flow::Finish => p.steps.clear(),
        }
    }

    if let Err(e) = advance(requests, progress) {
        warn!("Sequence step could not be sent: {}", e);
    }
}

fn finish_failed(progress: &Mutex<Progress>, code: MspCode) {
    let (done, step, name) = {
        let mut p = progress.lock();
        p.steps.clear();
        (p.done.take(), p.completed, p.name)
    };
    warn!("{} failed at step {} ({})", name, step + 1, code);
    if let Some(done) = done {
        done(Outcome::Failed { step, code });
    }
}

// =============================================================================
// Stock sequences
// =============================================================================

/// Identify the flight controller after connecting
pub fn handshake() -> Sequence {
    [
        MspCode::ApiVersion,
        MspCode::FcVariant,
        MspCode::FcVersion,
        MspCode::BoardInfo,
        MspCode::BuildInfo,
        MspCode::BoxNames,
        MspCode::BoxIds,
    ]
    .into_iter()
    .fold(Sequence::new("handshake"), |seq, code| {
        seq.command(Command::query(code))
    })
}

/// Download an iNav mission, one waypoint at a time until the last one
pub fn fetch_inav_mission() -> Sequence {
    Sequence::new("mission download").step(fetch_waypoint(1))
}

fn fetch_waypoint(number: u8) -> Step {
    Step::new(commands::get_waypoint(number)).then(move |reply| {
        let last = reply.get(INAV_WP_FLAG_OFFSET) == Some(&LAST_WAYPOINT_FLAG);
        match number.checked_add(1) {
            // An empty reply (replay) also ends the transfer
            Some(next) if !last && !reply.is_empty() => Flow::Insert(vec![fetch_waypoint(next)]),
            _ => Flow::Finish,
        }
    })
}

/// Upload an iNav mission; the last waypoint carries the end-of-mission flag
pub fn upload_inav_mission(waypoints: &[Waypoint]) -> Sequence {
    let count = waypoints.len();
    waypoints
        .iter()
        .enumerate()
        .fold(Sequence::new("mission upload"), |seq, (i, wp)| {
            let mut wp = wp.clone();
            wp.last = i + 1 == count;
            seq.command(commands::set_inav_waypoint(&wp))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::OutputQueue;
    use crate::state::{GeoPoint, WaypointAction};
    use crate::stats::Stats;
    use std::time::Duration;

    fn manager() -> Arc<RequestManager> {
        RequestManager::new(
            Arc::new(OutputQueue::new()),
            Arc::new(Stats::new()),
            Duration::from_millis(300),
        )
    }

    fn queued_codes(requests: &RequestManager) -> Vec<u8> {
        let Some(bytes) = requests.output().take_all() else {
            return Vec::new();
        };
        let mut codes = Vec::new();
        let mut i = 0;
        while i + 5 < bytes.len() {
            codes.push(bytes[i + 4]);
            i += 6 + bytes[i + 3] as usize;
        }
        codes
    }

    fn recorder() -> (Arc<Mutex<Option<Outcome>>>, impl FnOnce(Outcome) + Send + 'static) {
        let slot = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        (slot, move |outcome| *sink.lock() = Some(outcome))
    }

    #[tokio::test]
    async fn test_steps_advance_in_order() {
        let requests = manager();
        let (outcome, done) = recorder();
        handshake().start(&requests, done).unwrap();

        let order = [
            MspCode::ApiVersion,
            MspCode::FcVariant,
            MspCode::FcVersion,
            MspCode::BoardInfo,
            MspCode::BuildInfo,
            MspCode::BoxNames,
            MspCode::BoxIds,
        ];
        for code in order {
            // One request in flight at a time
            assert_eq!(queued_codes(&requests), vec![code.id()]);
            assert!(requests.complete(code, Bytes::new()));
        }
        assert_eq!(*outcome.lock(), Some(Outcome::Completed { steps: 7 }));
        assert!(queued_codes(&requests).is_empty());
    }

    #[tokio::test]
    async fn test_failure_short_circuits() {
        let requests = manager();
        let (outcome, done) = recorder();
        handshake().start(&requests, done).unwrap();

        requests.complete(MspCode::ApiVersion, Bytes::new());
        requests.fail(MspCode::FcVariant);

        assert_eq!(
            *outcome.lock(),
            Some(Outcome::Failed {
                step: 1,
                code: MspCode::FcVariant
            })
        );
        assert_eq!(requests.pending_count(), 0);
        assert_eq!(queued_codes(&requests), vec![MspCode::ApiVersion.id(), MspCode::FcVariant.id()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_sequence() {
        let requests = manager();
        let outcome = tokio::spawn({
            let requests = requests.clone();
            async move { handshake().run(&requests).await }
        });
        let outcome = outcome.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            Outcome::Failed {
                step: 0,
                code: MspCode::ApiVersion
            }
        );
    }

    #[tokio::test]
    async fn test_empty_sequence_completes() {
        let requests = manager();
        let (outcome, done) = recorder();
        Sequence::new("nothing").start(&requests, done).unwrap();
        assert_eq!(*outcome.lock(), Some(Outcome::Completed { steps: 0 }));
    }

    fn inav_wp(number: u8, last: bool) -> Bytes {
        let mut p = vec![number, 1];
        p.extend([0u8; 18]);
        p.push(if last { LAST_WAYPOINT_FLAG } else { 0 });
        Bytes::from(p)
    }

    #[tokio::test]
    async fn test_mission_download_follows_last_flag() {
        let requests = manager();
        let (outcome, done) = recorder();
        fetch_inav_mission().start(&requests, done).unwrap();

        let wp_frame = |n: u8| {
            let mut out = Vec::new();
            crate::msp::codec::write_frame(
                crate::msp::Direction::Request,
                MspCode::Wp.id(),
                &[n],
                &mut out,
            )
            .unwrap();
            out
        };

        assert_eq!(&requests.output().take_all().unwrap()[..], &wp_frame(1)[..]);
        requests.complete(MspCode::Wp, inav_wp(1, false));
        assert_eq!(&requests.output().take_all().unwrap()[..], &wp_frame(2)[..]);
        requests.complete(MspCode::Wp, inav_wp(2, true));

        assert!(requests.output().take_all().is_none());
        assert_eq!(*outcome.lock(), Some(Outcome::Completed { steps: 2 }));
    }

    #[tokio::test]
    async fn test_mission_upload_flags_last() {
        let waypoint = |number| Waypoint {
            number,
            action: WaypointAction::Waypoint,
            position: GeoPoint::new(1.0, 2.0),
            altitude: 10.0,
            param1: 0,
            param2: 0,
            param3: 0,
            last: false,
        };
        let seq = upload_inav_mission(&[waypoint(1), waypoint(2)]);
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.name(), "mission upload");

        let flags: Vec<u8> = seq
            .steps
            .iter()
            .map(|s| s.command.payload[INAV_WP_FLAG_OFFSET])
            .collect();
        assert_eq!(flags, vec![0, LAST_WAYPOINT_FLAG]);
    }
}
