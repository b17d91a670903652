//! Liveness monitor (C3): a polling state machine for each side of the
//! control channel, in the same spirit as the keep-alive manager this crate
//! grew from — the caller drives a timer loop and calls into the manager at
//! each tick rather than the manager owning its own task.
//!
//! `PING`/`PONG` are ordinary [`crate::frame::Frame`]s with `link_id = 0` and
//! an empty payload, multiplexed on the control channel alongside link
//! traffic (§4.3). This module only tracks timing; sending the frames is the
//! caller's job.

use tokio::time::{Duration, Instant};

/// Server pings an idle channel this often.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Either side considers the channel dead after this much silence.
pub const SILENCE_DEADLINE: Duration = Duration::from_secs(30);

/// What the server should do on a ping-interval tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Send a `PING` now.
    SendPing,
    /// The previous `PING` went unanswered; terminate the channel.
    Terminate,
}

/// Server-side liveness tracking for one control channel.
///
/// Drive it with a `5s` interval timer: each tick, call [`Self::tick`]. On
/// every inbound `PONG` (or any other frame — see the silence timer note in
/// §4.3), call [`Self::note_activity`]. Independently, check
/// [`Self::is_silent`] to enforce the 30s deadline even if pings stop firing
/// (e.g. because the timer task itself stalls is not a concern, but a
/// network black hole that swallows pings is).
#[derive(Debug)]
pub struct ServerHeartbeat {
    awaiting_pong: bool,
    last_activity: Instant,
}

impl ServerHeartbeat {
    /// A fresh tracker, as of `now` (typically the moment the channel was
    /// admitted).
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            awaiting_pong: false,
            last_activity: now,
        }
    }

    /// Called on each `PING_INTERVAL` tick. Returns [`Tick::Terminate`] if
    /// the previous ping was never answered; otherwise arms the "awaiting a
    /// pong" flag and returns [`Tick::SendPing`].
    pub fn tick(&mut self) -> Tick {
        if self.awaiting_pong {
            return Tick::Terminate;
        }
        self.awaiting_pong = true;
        Tick::SendPing
    }

    /// Records a `PONG` (or any other inbound frame) at `now`, clearing the
    /// "awaiting a pong" flag and resetting the silence timer.
    pub fn note_activity(&mut self, now: Instant) {
        self.awaiting_pong = false;
        self.last_activity = now;
    }

    /// Whether more than [`SILENCE_DEADLINE`] has elapsed since the last
    /// recorded activity.
    #[must_use]
    pub fn is_silent(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) >= SILENCE_DEADLINE
    }
}

/// Client-side liveness tracking: answer every `PING` with a `PONG` and
/// exit if none arrives for [`SILENCE_DEADLINE`].
#[derive(Debug)]
pub struct ClientHeartbeat {
    last_ping: Instant,
}

impl ClientHeartbeat {
    /// A fresh tracker, as of `now`.
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self { last_ping: now }
    }

    /// Records receipt of a `PING` at `now`. The caller replies with a
    /// `PONG` frame; this only resets the starvation clock.
    pub fn on_ping(&mut self, now: Instant) {
        self.last_ping = now;
    }

    /// Whether no `PING` has arrived for [`SILENCE_DEADLINE`], i.e. the
    /// client should tear down and exit non-zero.
    #[must_use]
    pub fn is_starved(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_ping) >= SILENCE_DEADLINE
    }
}
