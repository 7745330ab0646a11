//! The shared test deadline.
//!
//! A [`Deadline`] is fixed once when the driver starts and handed by value to
//! every virtual user. Each user derives its own remaining budget from it, so
//! users that start later in the ramp live for a shorter time.

use std::time::Duration;

use tokio::time::Instant;

/// A fixed point in time at which the test window closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// A deadline at the given instant.
    #[must_use]
    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    /// A deadline `budget` from now.
    #[must_use]
    pub fn after(budget: Duration) -> Self {
        Self::at(Instant::now() + budget)
    }

    /// The instant the test window closes.
    #[must_use]
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Time left before the deadline, zero once it has passed.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.remaining_at(Instant::now())
    }

    /// Time left before the deadline as seen from `now`.
    #[must_use]
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.at.saturating_duration_since(now)
    }
}

/// How long a connection may stay open given its `remaining` budget, leaving
/// `buffer` for the close handshake. Never negative.
#[must_use]
pub fn shutdown_after(remaining: Duration, buffer: Duration) -> Duration {
    remaining.saturating_sub(buffer)
}
