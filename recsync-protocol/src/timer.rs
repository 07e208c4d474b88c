//! Single-shot timers
//!
//! The engine never sleeps. Timers are plain deadlines checked against an
//! explicit `now`; the async driver sleeps until [`Deadline::when`] and then
//! polls the engine. Arming always replaces the previous deadline.

use std::time::{Duration, Instant};

/// A single-shot deadline
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Disarm, then arm to fire `after` from `now`
    pub fn arm(&mut self, now: Instant, after: Duration) {
        self.disarm();
        self.at = Some(now + after);
    }

    pub fn disarm(&mut self) {
        self.at = None;
    }

    pub fn is_armed(&self) -> bool {
        self.at.is_some()
    }

    /// When the deadline fires, if armed
    pub fn when(&self) -> Option<Instant> {
        self.at
    }

    /// Fire the deadline if it has passed
    ///
    /// Returns `true` exactly once per arming.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.at {
            Some(at) if now >= at => {
                self.at = None;
                true
            }
            _ => false,
        }
    }
}

/// Stall detector for file transfers
///
/// Fed on every content chunk; expires when nothing arrives for `window`.
#[derive(Debug, Clone)]
pub struct Watchdog {
    window: Duration,
    deadline: Deadline,
}

impl Watchdog {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: Deadline::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn arm(&mut self, now: Instant) {
        self.deadline.arm(now, self.window);
    }

    /// Push the expiry out by one window; same as [`Watchdog::arm`]
    pub fn feed(&mut self, now: Instant) {
        self.arm(now);
    }

    pub fn disarm(&mut self) {
        self.deadline.disarm();
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_armed()
    }

    pub fn when(&self) -> Option<Instant> {
        self.deadline.when()
    }

    /// Returns `true` once if the window elapsed without a feed
    pub fn expired(&mut self, now: Instant) -> bool {
        self.deadline.fire_if_due(now)
    }
}

/// Earliest of two optional instants
pub(crate) fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
