//! Waiting for replies: deadlines, retries and cancellation.
//!
//! The session thread never sleeps blindly. Every wait goes through a
//! [`Waiter`], which multiplexes three wake conditions on one
//! `crossbeam_channel::select!`:
//!
//! ```text
//!   receive thread ──Inbound──▶ ┐
//!   StopSignal::stop() ───────▶ ├─▶ Waiter::next_event(deadline) ─▶ Wake
//!   deadline elapsed ─────────▶ ┘
//! ```
//!
//! [`await_reply`] builds the retry loop of the protocol on top of that: send,
//! wait one interval, resend on expiry, give up after `max_attempts` expiries
//! with the timeout kind of the current phase. Events that do not match do
//! not move the deadline, so a burst of stray datagrams can neither shorten
//! nor stretch a wait.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::config::RetryPolicy;
use crate::error::LampError;
use crate::receiver::{Arrival, Inbound};

// ---------------------------------------------------------------------------
// StopSignal
// ---------------------------------------------------------------------------

/// Cloneable handle that cancels every wait of a session.
///
/// Stopping drops the only sender of a zero-capacity channel; every
/// `select!` holding the matching receiver then wakes up with a disconnect.
#[derive(Debug, Clone)]
pub struct StopSignal {
    sender: Arc<Mutex<Option<Sender<()>>>>,
    stopped: Arc<AtomicBool>,
    receiver: Receiver<()>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            sender: Arc::new(Mutex::new(Some(tx))),
            stopped: Arc::new(AtomicBool::new(false)),
            receiver: rx,
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // A poisoned lock still holds the sender; take it either way.
        let mut guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn receiver(&self) -> Receiver<()> {
        self.receiver.clone()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Waiter
// ---------------------------------------------------------------------------

/// Why [`Waiter::next_event`] returned.
#[derive(Debug)]
pub enum Wake {
    Event(Inbound),
    Elapsed,
    Cancelled,
    /// The receive thread is gone.
    Closed,
}

/// The one wait point of a session thread.
pub struct Waiter {
    events: Receiver<Inbound>,
    cancel: Receiver<()>,
    stop: StopSignal,
}

impl Waiter {
    pub fn new(events: Receiver<Inbound>, stop: &StopSignal) -> Self {
        Self {
            events,
            cancel: stop.receiver(),
            stop: stop.clone(),
        }
    }

    /// Block until an event arrives, `deadline` passes or the session is
    /// stopped.
    pub fn next_event(&self, deadline: Instant) -> Wake {
        if self.stop.is_stopped() {
            return Wake::Cancelled;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        select! {
            recv(self.events) -> msg => match msg {
                Ok(inbound) => Wake::Event(inbound),
                // A stopped receive thread drops its sender too.
                Err(_) if self.stop.is_stopped() => Wake::Cancelled,
                Err(_) => Wake::Closed,
            },
            recv(self.cancel) -> _ => Wake::Cancelled,
            default(remaining) => Wake::Elapsed,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Hand every arrival to `on_event` until `deadline`.
    ///
    /// `on_event` returns `true` to stop waiting early. Returns `Ok(true)` if
    /// it did, `Ok(false)` when the deadline passed.
    pub fn idle_until(
        &self,
        deadline: Instant,
        mut on_event: impl FnMut(Arrival) -> bool,
    ) -> Result<bool, LampError> {
        loop {
            match self.next_event(deadline) {
                Wake::Event(Inbound::Packet(arrival)) => {
                    if on_event(arrival) {
                        return Ok(true);
                    }
                }
                Wake::Event(Inbound::Failed(e)) => return Err(LampError::RecvGeneric(e)),
                Wake::Elapsed => return Ok(false),
                Wake::Cancelled => return Err(LampError::Cancelled),
                Wake::Closed => return Err(closed()),
            }
        }
    }
}

/// The receive thread left without reporting a failure, i.e. it panicked.
fn closed() -> LampError {
    log::error!("[timer] receive thread exited unexpectedly");
    LampError::Unknown
}

// ---------------------------------------------------------------------------
// Retry loop
// ---------------------------------------------------------------------------

/// Which exchange a wait belongs to; selects the failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Ack,
    Report,
}

impl Phase {
    fn timeout(self) -> LampError {
        match self {
            Phase::Init => LampError::TimeoutInit,
            Phase::Ack => LampError::TimeoutAck,
            Phase::Report => LampError::Timeout,
        }
    }

    fn send_failed(self, e: io::Error) -> LampError {
        match self {
            Phase::Init => LampError::SendInit(e),
            _ => LampError::Send(e),
        }
    }
}

/// Send with `transmit`, then wait for an arrival that `classify` accepts.
///
/// `transmit` receives the attempt number (1-based) and runs once up front
/// and once after every expiry except the last, so a silent peer sees exactly
/// `policy.max_attempts` sends. A failed send is logged and counts as an
/// attempt. `Inbound::Failed` events are fatal.
pub fn await_reply<T>(
    waiter: &Waiter,
    policy: RetryPolicy,
    phase: Phase,
    mut transmit: impl FnMut(u32) -> io::Result<()>,
    mut classify: impl FnMut(Arrival) -> Option<T>,
) -> Result<T, LampError> {
    let mut last_send_err = None;
    let mut any_sent = false;

    for attempt in 1..=policy.max_attempts {
        match transmit(attempt) {
            Ok(()) => any_sent = true,
            Err(e) => {
                log::warn!("[timer] {phase:?} send attempt {attempt} failed: {e}");
                last_send_err = Some(e);
            }
        }

        let deadline = Instant::now() + policy.interval;
        loop {
            match waiter.next_event(deadline) {
                Wake::Event(Inbound::Packet(arrival)) => {
                    if let Some(reply) = classify(arrival) {
                        return Ok(reply);
                    }
                }
                Wake::Event(Inbound::Failed(e)) => return Err(LampError::RecvGeneric(e)),
                Wake::Elapsed => {
                    log::debug!(
                        "[timer] {phase:?} attempt {attempt}/{} expired",
                        policy.max_attempts
                    );
                    break;
                }
                Wake::Cancelled => return Err(LampError::Cancelled),
                Wake::Closed => return Err(closed()),
            }
        }
    }

    match last_send_err {
        Some(e) if !any_sent => Err(phase.send_failed(e)),
        _ => Err(phase.timeout()),
    }
}

/// Wait up to `policy.ceiling()` for an arrival `classify` accepts, without
/// sending anything. Returns `Ok(None)` on expiry.
pub fn await_passive<T>(
    waiter: &Waiter,
    policy: RetryPolicy,
    mut classify: impl FnMut(Arrival) -> Option<T>,
) -> Result<Option<T>, LampError> {
    let deadline = Instant::now() + policy.ceiling();
    loop {
        match waiter.next_event(deadline) {
            Wake::Event(Inbound::Packet(arrival)) => {
                if let Some(reply) = classify(arrival) {
                    return Ok(Some(reply));
                }
            }
            Wake::Event(Inbound::Failed(e)) => return Err(LampError::RecvGeneric(e)),
            Wake::Elapsed => return Ok(None),
            Wake::Cancelled => return Err(LampError::Cancelled),
            Wake::Closed => return Err(closed()),
        }
    }
}
