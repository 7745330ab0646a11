//! One virtual user.
//!
//! A unit logs in once, then follows the [`StateMachine`] operations over a
//! single lobby connection, reconnecting within budget, until the machine
//! exits.

use std::{future::Future, sync::Arc, time::Duration};

use futures::future::FusedFuture;
use metrics::counter;
use tokio_tungstenite::tungstenite;
use tracing::{debug, error, info, warn};

use super::{
    Outcome, Plan,
    connection::{self, Connection, Params, Socket, Stop, Timers},
    state_machine::{Event, Operation, State, StateMachine},
};
use crate::{
    deadline::{self, Deadline},
    iam,
    identity::Identity,
};

#[derive(Debug)]
pub(super) struct Unit {
    identity: Identity,
    iam: Arc<iam::Client>,
    lobby_url: Arc<str>,
    plan: Plan,
    deadline: Deadline,
}

impl Unit {
    pub(super) fn new(
        identity: Identity,
        iam: Arc<iam::Client>,
        lobby_url: Arc<str>,
        plan: Plan,
        deadline: Deadline,
    ) -> Self {
        Self {
            identity,
            iam,
            lobby_url,
            plan,
            deadline,
        }
    }

    pub(super) async fn run(self, mut stop: Stop) -> Outcome {
        let token = tokio::select! {
            biased;
            () = &mut stop => return Outcome::Stopped,
            result = self.iam.login(&self.identity.email, &self.identity.password) => match result {
                Ok(token) => {
                    counter!("login_ok", "role" => "user").increment(1);
                    info!("Logged in as {email}", email = self.identity.email);
                    token
                }
                Err(err) => {
                    counter!("login_failure", "role" => "user").increment(1);
                    warn!("Login as {email} failed: {err}", email = self.identity.email);
                    return Outcome::LoginFailed;
                }
            },
        };

        let mut params = Params::new(token);
        let mut machine = StateMachine::new(
            self.plan.keep_alive,
            self.plan.shutdown_buffer,
            self.plan.reconnect,
        );
        let mut opened: Option<Socket> = None;
        let mut connection: Option<Connection> = None;
        let mut operation = Operation::Connect;

        loop {
            let event = match operation {
                Operation::Connect => self.connect(&params, &mut stop, &mut opened).await,
                Operation::ArmTimers {
                    keep_alive,
                    shutdown_after,
                } => match opened.take() {
                    Some(socket) => {
                        debug!("Closing in {shutdown_after:?}");
                        let timers = Timers::arm(keep_alive, shutdown_after);
                        connection
                            .insert(Connection::new(socket, timers))
                            .next_event(&mut stop, &mut params)
                            .await
                    }
                    None => Event::TransportErrored,
                },
                Operation::SendPing => match connection.as_mut() {
                    Some(connection) => {
                        connection.ping().await;
                        connection.next_event(&mut stop, &mut params).await
                    }
                    None => Event::TransportErrored,
                },
                Operation::CloseTransport => match connection.take() {
                    Some(connection) => connection.close(self.plan.close_timeout).await,
                    None => Event::TransportClosed,
                },
                Operation::Reconnect { backoff } => {
                    connection = None;
                    self.backoff(backoff, &mut stop).await
                }
                Operation::Exit => break,
            };

            operation = match machine.next(event) {
                Ok(operation) => operation,
                Err(err) => {
                    error!("{err}");
                    break;
                }
            };
        }

        if machine.state() == State::Failed {
            warn!(
                "Giving up after {attempts} reconnects",
                attempts = machine.attempts()
            );
            return Outcome::GaveUp {
                attempts: machine.attempts(),
            };
        }
        if stop.is_terminated() {
            return Outcome::Stopped;
        }
        Outcome::Completed {
            lobby_session_id: params.lobby_session_id().map(str::to_string),
        }
    }

    async fn connect(&self, params: &Params, stop: &mut Stop, opened: &mut Option<Socket>) -> Event {
        let open = connection::open(&self.lobby_url, params);
        tokio::pin!(open);
        let result = tokio::select! {
            biased;
            () = &mut *stop => {
                self.abandon(open).await;
                return Event::StopRequested;
            }
            result = &mut open => result,
        };

        match result {
            Ok(socket) => {
                counter!("connection_opened").increment(1);
                info!("Connected to lobby");
                *opened = Some(socket);
                Event::Opened {
                    remaining: self.deadline.remaining(),
                }
            }
            Err(err) => {
                counter!("connection_failure").increment(1);
                warn!("Lobby connection failed: {err}");
                Event::TransportErrored
            }
        }
    }

    /// Stop arrived mid-handshake. Finish the handshake within the close
    /// timeout, then close the connection.
    async fn abandon<F>(&self, open: F)
    where
        F: Future<Output = Result<Socket, tungstenite::Error>>,
    {
        match tokio::time::timeout(self.plan.close_timeout, open).await {
            Ok(Ok(socket)) => {
                counter!("connection_opened").increment(1);
                info!("Connected to lobby while stopping, closing");
                connection::close(socket, self.plan.close_timeout).await;
            }
            Ok(Err(err)) => debug!("Lobby handshake failed while stopping: {err}"),
            Err(_elapsed) => warn!(
                "Lobby handshake did not finish within {timeout:?} while stopping",
                timeout = self.plan.close_timeout
            ),
        }
    }

    async fn backoff(&self, backoff: Duration, stop: &mut Stop) -> Event {
        let remaining = self.deadline.remaining().saturating_sub(backoff);
        if deadline::shutdown_after(remaining, self.plan.shutdown_buffer).is_zero() {
            info!("Not reconnecting, the test window closes before the connection could run");
            return Event::StopRequested;
        }

        counter!("reconnect").increment(1);
        info!("Reconnecting in {backoff:?}");
        tokio::select! {
            biased;
            () = &mut *stop => Event::StopRequested,
            () = tokio::time::sleep(backoff) => Event::RetryDue,
        }
    }
}
