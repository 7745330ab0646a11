//! Pure state machine for the lifecycle of one lobby connection.

use std::time::Duration;

use crate::deadline;

use super::reconnect::Policy;

/// The state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Handshake in flight
    Connecting,
    /// Connected, keep-alive and shutdown timers armed
    Open,
    /// Close frame sent, waiting for the peer
    Closing,
    /// Terminal, the connection ended normally
    Closed,
    /// Transport failed, waiting out the backoff before reconnecting
    Errored {
        /// Which reconnect this is, counting from 1
        attempt: u32,
    },
    /// Terminal, the reconnect budget is spent
    Failed,
}

/// Operations the state machine can request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Open the transport
    Connect,
    /// Start the keep-alive interval and the one-shot shutdown timer
    ArmTimers {
        /// Keep-alive period, first tick one period after open
        keep_alive: Duration,
        /// When to begin closing, measured from open
        shutdown_after: Duration,
    },
    /// Send a keep-alive ping
    SendPing,
    /// Send a close frame and wait for the peer to finish the close
    CloseTransport,
    /// Wait `backoff` and then deliver [`Event::RetryDue`]
    Reconnect {
        /// Pause before reconnecting
        backoff: Duration,
    },
    /// Stop driving this connection
    Exit,
}

/// Events that can drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The handshake completed
    Opened {
        /// Time left before the test deadline, as of the open
        remaining: Duration,
    },
    /// The keep-alive interval ticked
    KeepAliveTick,
    /// The one-shot shutdown timer fired
    ShutdownTimerFired,
    /// The unit was asked to stop, by ramp-down or operator
    StopRequested,
    /// The transport closed
    TransportClosed,
    /// The transport failed
    TransportErrored,
    /// The reconnect backoff elapsed
    RetryDue,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Errors produced by [`StateMachine`]
pub enum Error {
    /// Transition is not valid
    #[error("Invalid transition from {from:?} via {via:?}")]
    InvalidTransition {
        /// State at the time of the event
        from: State,
        /// The rejected event
        via: Event,
    },
}

/// State machine for one virtual user's lobby connection
///
/// The goal of this component is to contain the logic for state transitions
/// _without_ IO encumbrance, neither timing information nor socket
/// interactions. This leaves the unit driver to deal with the clock and the
/// WebSocket. That is, the driver should follow the output of this
/// mechanism's `next` without consideration.
#[derive(Debug, Clone, Copy)]
pub struct StateMachine {
    state: State,
    keep_alive: Duration,
    shutdown_buffer: Duration,
    policy: Policy,
    attempts: u32,
}

impl StateMachine {
    /// Create a new state machine in [`State::Connecting`].
    #[must_use]
    pub fn new(keep_alive: Duration, shutdown_buffer: Duration, policy: Policy) -> Self {
        Self {
            state: State::Connecting,
            keep_alive,
            shutdown_buffer,
            policy,
            attempts: 0,
        }
    }

    /// Get the current state
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Reconnects begun so far, never reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the machine has reached [`State::Closed`] or [`State::Failed`].
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, State::Closed | State::Failed)
    }

    /// Process an event and return the next operation
    ///
    /// State transitions:
    /// ```text
    /// Format: CurrentState --[Event]--> NextState (Operation)
    ///
    /// Connecting --[Opened]--> Open (ArmTimers)
    /// Connecting --[TransportErrored]--> Errored (Reconnect) | Failed (Exit)
    /// Connecting --[StopRequested]--> Closed (Exit)
    ///
    /// Open --[KeepAliveTick]--> Open (SendPing)
    /// Open --[ShutdownTimerFired]--> Closing (CloseTransport)
    /// Open --[StopRequested]--> Closing (CloseTransport)
    /// Open --[TransportClosed]--> Closed (Exit)
    /// Open --[TransportErrored]--> Errored (Reconnect) | Failed (Exit)
    ///
    /// Closing --[TransportClosed]--> Closed (Exit)
    /// Closing --[TransportErrored]--> Closed (Exit)
    ///
    /// Errored --[RetryDue]--> Connecting (Connect)
    /// Errored --[StopRequested]--> Closed (Exit)
    /// ```
    ///
    /// A transport error moves to `Failed` once the reconnect budget is
    /// spent.
    ///
    /// # Errors
    ///
    /// Function will error with `InvalidTransition` if the `event` is not valid
    /// for the present state.
    pub fn next(&mut self, event: Event) -> Result<Operation, Error> {
        let (next_state, operation) = match (self.state, event) {
            (State::Connecting, Event::Opened { remaining }) => (
                State::Open,
                Operation::ArmTimers {
                    keep_alive: self.keep_alive,
                    shutdown_after: deadline::shutdown_after(remaining, self.shutdown_buffer),
                },
            ),
            (State::Connecting | State::Errored { .. }, Event::StopRequested) => {
                (State::Closed, Operation::Exit)
            }

            (State::Open, Event::KeepAliveTick) => (State::Open, Operation::SendPing),
            (State::Open, Event::ShutdownTimerFired | Event::StopRequested) => {
                (State::Closing, Operation::CloseTransport)
            }
            (State::Open, Event::TransportClosed)
            | (State::Closing, Event::TransportClosed | Event::TransportErrored) => {
                (State::Closed, Operation::Exit)
            }

            (State::Connecting | State::Open, Event::TransportErrored) => {
                let attempt = self.attempts.saturating_add(1);
                if self.policy.allows(attempt) {
                    self.attempts = attempt;
                    (
                        State::Errored { attempt },
                        Operation::Reconnect {
                            backoff: self.policy.delay(attempt),
                        },
                    )
                } else {
                    (State::Failed, Operation::Exit)
                }
            }

            (State::Errored { .. }, Event::RetryDue) => (State::Connecting, Operation::Connect),

            // Any other transition is invalid
            _ => {
                return Err(Error::InvalidTransition {
                    from: self.state,
                    via: event,
                });
            }
        };

        self.state = next_state;
        Ok(operation)
    }
}
