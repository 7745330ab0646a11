//! WebSocket plumbing for one virtual user.
//!
//! Everything here is IO: opening the socket with the right headers, the
//! keep-alive and shutdown timers, turning socket traffic into state machine
//! events, and the bounded close.

use std::{future::Future, pin::Pin, time::Duration};

use futures::{SinkExt, StreamExt, future::Fuse};
use metrics::counter;
use tokio::{
    net::TcpStream,
    time::{Instant, Interval, MissedTickBehavior, Sleep},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        handshake::client::Request,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tracing::{debug, info, trace, warn};

use super::state_machine::Event;
use crate::notification::Notification;

/// Header carrying the lobby session ID on reconnect.
pub(super) const LOBBY_SESSION_HEADER: &str = "x-ab-lobbysessionid";

pub(super) type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Resolves once the unit must stop, by ramp-down or operator shutdown.
pub(super) type Stop = Fuse<Pin<Box<dyn Future<Output = ()> + Send>>>;

/// Handshake parameters. Written by message handling, read at connect time.
#[derive(Debug)]
pub(super) struct Params {
    token: String,
    lobby_session_id: Option<String>,
}

impl Params {
    pub(super) fn new(token: String) -> Self {
        Self {
            token,
            lobby_session_id: None,
        }
    }

    pub(super) fn lobby_session_id(&self) -> Option<&str> {
        self.lobby_session_id.as_deref()
    }

    fn request(&self, url: &str) -> Result<Request, tungstenite::Error> {
        let mut request = url.into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", self.token))?);
        if let Some(id) = &self.lobby_session_id {
            headers.insert(LOBBY_SESSION_HEADER, header_value(id)?);
        }
        Ok(request)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, tungstenite::Error> {
    HeaderValue::from_str(value).map_err(|err| tungstenite::Error::HttpFormat(err.into()))
}

/// Open a socket to `url` authenticated by `params`.
pub(super) async fn open(url: &str, params: &Params) -> Result<Socket, tungstenite::Error> {
    let request = params.request(url)?;
    let (socket, _response) = connect_async(request).await?;
    Ok(socket)
}

/// The keep-alive interval and one-shot shutdown timer of an open
/// connection. Dropping this cancels both.
#[derive(Debug)]
pub(super) struct Timers {
    keep_alive: Interval,
    shutdown: Pin<Box<Sleep>>,
}

impl Timers {
    pub(super) fn arm(keep_alive: Duration, shutdown_after: Duration) -> Self {
        let now = Instant::now();
        let mut interval = tokio::time::interval_at(now + keep_alive, keep_alive);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            keep_alive: interval,
            shutdown: Box::pin(tokio::time::sleep_until(now + shutdown_after)),
        }
    }

    /// The next timer event. When both are due the shutdown wins.
    pub(super) async fn next(&mut self) -> Event {
        tokio::select! {
            biased;
            () = &mut self.shutdown => Event::ShutdownTimerFired,
            _ = self.keep_alive.tick() => Event::KeepAliveTick,
        }
    }
}

/// An open lobby connection with armed timers.
#[derive(Debug)]
pub(super) struct Connection {
    socket: Socket,
    timers: Timers,
}

impl Connection {
    pub(super) fn new(socket: Socket, timers: Timers) -> Self {
        Self { socket, timers }
    }

    /// Wait for the next event that drives the state machine. Inbound
    /// messages are handled here and do not surface as events.
    pub(super) async fn next_event(&mut self, stop: &mut Stop, params: &mut Params) -> Event {
        loop {
            tokio::select! {
                biased;
                () = &mut *stop => return Event::StopRequested,
                event = self.timers.next() => return event,
                message = self.socket.next() => match message {
                    Some(Ok(message)) => Self::handle(message, params),
                    None | Some(Err(
                        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                    )) => {
                        info!("Lobby connection closed");
                        return Event::TransportClosed;
                    }
                    Some(Err(err)) => {
                        warn!("Lobby connection error: {err}");
                        return Event::TransportErrored;
                    }
                },
            }
        }
    }

    fn handle(message: Message, params: &mut Params) {
        match message {
            Message::Text(text) => Self::notification(&text, params),
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => Self::notification(text, params),
                Err(_) => debug!("Ignoring {len} byte binary frame", len = bytes.len()),
            },
            Message::Pong(_) => {
                counter!("pong_received").increment(1);
                debug!("Pong received");
            }
            Message::Ping(_) => trace!("Ping received"),
            Message::Close(frame) => info!("Lobby sent close: {frame:?}"),
            Message::Frame(_) => {}
        }
    }

    fn notification(text: &str, params: &mut Params) {
        counter!("message_received").increment(1);
        let notification = Notification::parse(text);
        match notification.lobby_session_id() {
            Some(id) => {
                info!("Lobby session ID: {id}");
                counter!("lobby_session_captured").increment(1);
                params.lobby_session_id = Some(id.to_string());
            }
            None => debug!(
                "Ignoring {kind} notification",
                kind = notification.kind().unwrap_or("untyped")
            ),
        }
    }

    /// Send a keep-alive ping. Failures are logged and swallowed.
    pub(super) async fn ping(&mut self) {
        match self.socket.send(Message::Ping(Vec::new())).await {
            Ok(()) => {
                counter!("ping_sent").increment(1);
                trace!("Ping sent");
            }
            Err(err) => {
                counter!("ping_failure").increment(1);
                warn!("Ping failed: {err}");
            }
        }
    }

    /// Cancel the timers, send a close frame and wait up to `timeout` for the
    /// peer to finish the close.
    pub(super) async fn close(self, timeout: Duration) -> Event {
        let Self { socket, timers } = self;
        drop(timers);
        close(socket, timeout).await
    }
}

/// Send a close frame on `socket` and wait up to `timeout` for the peer to
/// finish the close.
pub(super) async fn close(mut socket: Socket, timeout: Duration) -> Event {
    let finished = tokio::time::timeout(timeout, async move {
        if let Err(err) = socket.close(None).await {
            debug!("Close frame not sent: {err}");
        }
        while let Some(message) = socket.next().await {
            match message {
                Ok(message) => trace!("Discarding {message:?} while closing"),
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    })
    .await;

    match finished {
        Ok(Ok(())) => {
            info!("Lobby connection closed");
            Event::TransportClosed
        }
        Ok(Err(err)) => {
            warn!("Lobby connection failed while closing: {err}");
            Event::TransportErrored
        }
        Err(_elapsed) => {
            warn!("Lobby did not finish the close within {timeout:?}");
            Event::TransportErrored
        }
    }
}
