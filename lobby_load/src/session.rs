//! The `run` session driver.
//!
//! Ramps virtual users up and down through the configured stages. Each
//! virtual user logs in once and then holds one lobby WebSocket open,
//! pinging it, until the shared test deadline, a ramp-down stop or an
//! operator shutdown.
//!
//! ## Metrics
//!
//! `active_vus`: Virtual users currently running
//! `unit_outcome`: Virtual users finished, labelled by `outcome`
//! `login_ok` / `login_failure`: User logins
//! `connection_opened` / `connection_failure`: Lobby handshakes
//! `ping_sent` / `ping_failure` / `pong_received`: Keep-alive traffic
//! `message_received` / `lobby_session_captured`: Lobby notifications
//! `reconnect`: Reconnects begun
//!

use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    path::PathBuf,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use futures::FutureExt;
use lobby_signal::{Broadcaster, Watcher};
use metrics::{counter, gauge};
use serde::Deserialize;
use tokio::{
    task::{JoinError, JoinSet},
    time::{Instant, MissedTickBehavior},
};
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};
use tracing::{Instrument, error, info, info_span, warn};

use crate::{
    config,
    deadline::Deadline,
    iam,
    identity::{self, Identity},
    ramp::{self, Schedule, Stage},
};

mod connection;
pub mod reconnect;
pub mod state_machine;
mod unit;

use connection::Stop;
use unit::Unit;

const TICK: Duration = Duration::from_millis(100);

fn default_keep_alive_seconds() -> u64 {
    10
}

fn default_shutdown_buffer_seconds() -> u64 {
    3
}

fn default_close_timeout_seconds() -> u64 {
    3
}

fn default_graceful_stop_seconds() -> u64 {
    10
}

fn default_graceful_ramp_down_seconds() -> u64 {
    30
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Driver`].
pub enum Error {
    /// Config lacks the `session` section.
    #[error(transparent)]
    Config(#[from] config::Error),
    /// The ramp could not be built.
    #[error(transparent)]
    Ramp(#[from] ramp::Error),
    /// Identities could not be loaded.
    #[error(transparent)]
    Identity(#[from] identity::Error),
    /// IAM client could not be built.
    #[error(transparent)]
    Iam(#[from] iam::Error),
    /// The identity file has no usable rows.
    #[error("Identity file {0:?} has no identities")]
    NoIdentities(PathBuf),
    /// The lobby URL is not a valid WebSocket URL.
    #[error("Invalid lobby URL {url}: {source}")]
    LobbyUrl {
        /// The configured URL
        url: String,
        /// Underlying error
        #[source]
        source: Box<tungstenite::Error>,
    },
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of the `run` subcommand.
pub struct Config {
    /// CSV of identities, one virtual user slot per row
    pub users_path: PathBuf,
    /// Virtual users at the start of the first stage
    #[serde(default)]
    pub start_vus: u32,
    /// The ramp. Their summed duration is the test window.
    pub stages: Vec<Stage>,
    /// Period of WebSocket pings
    #[serde(default = "default_keep_alive_seconds")]
    pub keep_alive_seconds: u64,
    /// Connections close this long before the deadline
    #[serde(default = "default_shutdown_buffer_seconds")]
    pub shutdown_buffer_seconds: u64,
    /// How long to wait for the lobby to finish a close
    #[serde(default = "default_close_timeout_seconds")]
    pub close_timeout_seconds: u64,
    /// How long past the deadline to wait for virtual users to finish
    #[serde(default = "default_graceful_stop_seconds")]
    pub graceful_stop_seconds: u64,
    /// How long a ramped-down virtual user keeps its connection before it is
    /// stopped
    #[serde(default = "default_graceful_ramp_down_seconds")]
    pub graceful_ramp_down_seconds: u64,
    /// Reconnect policy after transport errors
    #[serde(default)]
    pub reconnect: reconnect::Policy,
}

impl Config {
    /// Period of WebSocket pings.
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_seconds)
    }

    /// Time reserved before the deadline for the close handshake.
    #[must_use]
    pub fn shutdown_buffer(&self) -> Duration {
        Duration::from_secs(self.shutdown_buffer_seconds)
    }

    /// Bound on waiting for the lobby to finish a close.
    #[must_use]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_seconds)
    }

    /// Bound on waiting for virtual users past the deadline.
    #[must_use]
    pub fn graceful_stop(&self) -> Duration {
        Duration::from_secs(self.graceful_stop_seconds)
    }

    /// Bound on a ramped-down virtual user keeping its connection.
    #[must_use]
    pub fn graceful_ramp_down(&self) -> Duration {
        Duration::from_secs(self.graceful_ramp_down_seconds)
    }

    fn plan(&self) -> Plan {
        Plan {
            keep_alive: self.keep_alive(),
            shutdown_buffer: self.shutdown_buffer(),
            close_timeout: self.close_timeout(),
            reconnect: self.reconnect,
        }
    }
}

/// Timing shared by every virtual user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    /// Period of WebSocket pings
    pub keep_alive: Duration,
    /// Time reserved before the deadline for the close handshake
    pub shutdown_buffer: Duration,
    /// Bound on waiting for the lobby to finish a close
    pub close_timeout: Duration,
    /// Reconnect policy
    pub reconnect: reconnect::Policy,
}

/// How a virtual user ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Login was rejected, no connection was attempted
    LoginFailed,
    /// The connection ran until its shutdown timer or the lobby closed it
    Completed {
        /// The last lobby session ID seen, if any
        lobby_session_id: Option<String>,
    },
    /// Stopped early by ramp-down or operator shutdown
    Stopped,
    /// The reconnect budget ran out
    GaveUp {
        /// Reconnects made before giving up
        attempts: u32,
    },
}

impl Outcome {
    /// Metric label for this outcome.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::LoginFailed => "login_failed",
            Self::Completed { .. } => "completed",
            Self::Stopped => "stopped",
            Self::GaveUp { .. } => "gave_up",
        }
    }
}

/// Counts of virtual user outcomes over a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    /// Virtual users started
    pub started: u32,
    /// Ended with [`Outcome::LoginFailed`]
    pub login_failed: u32,
    /// Ended with [`Outcome::Completed`]
    pub completed: u32,
    /// Ended with [`Outcome::Stopped`]
    pub stopped: u32,
    /// Ended with [`Outcome::GaveUp`]
    pub gave_up: u32,
    /// Completed virtual users that captured a lobby session ID
    pub lobby_sessions: u32,
    /// Virtual user tasks that panicked or were aborted
    pub lost: u32,
}

impl Summary {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::LoginFailed => self.login_failed += 1,
            Outcome::Completed { lobby_session_id } => {
                self.completed += 1;
                if lobby_session_id.is_some() {
                    self.lobby_sessions += 1;
                }
            }
            Outcome::Stopped => self.stopped += 1,
            Outcome::GaveUp { .. } => self.gave_up += 1,
        }
    }
}

/// The running virtual users, by slot.
///
/// Slot `n` logs in as identity row `n`, counting from 1. A slot ramping down
/// or being stopped stays reserved until its unit ends so no two units share
/// an identity. A slot whose unit could not log in or gave up reconnecting is
/// retired for the rest of the run.
#[derive(Debug)]
struct Fleet {
    units: JoinSet<(u32, Outcome)>,
    running: BTreeMap<u32, Broadcaster>,
    ramping_down: BTreeMap<u32, (Instant, Broadcaster)>,
    stopping: BTreeSet<u32>,
    retired: BTreeSet<u32>,
    summary: Summary,
}

impl Fleet {
    fn new() -> Self {
        Self {
            units: JoinSet::new(),
            running: BTreeMap::new(),
            ramping_down: BTreeMap::new(),
            stopping: BTreeSet::new(),
            retired: BTreeSet::new(),
            summary: Summary::default(),
        }
    }

    fn active(&self) -> u32 {
        u32::try_from(self.running.len()).unwrap_or(u32::MAX)
    }

    fn lowest_free_slot(&self, capacity: u32) -> Option<u32> {
        (1..=capacity).find(|slot| {
            !self.running.contains_key(slot)
                && !self.ramping_down.contains_key(slot)
                && !self.stopping.contains(slot)
                && !self.retired.contains(slot)
        })
    }

    fn start(&mut self, slot: u32, unit: Unit, shutdown: &Watcher) {
        let (stop_watcher, stop_broadcaster) = lobby_signal::signal();
        let shutdown = shutdown.clone();
        let stop: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
            tokio::select! {
                () = stop_watcher.recv() => {},
                () = shutdown.recv() => {},
            }
        });
        let stop: Stop = stop.fuse();

        self.units.spawn(
            async move { (slot, unit.run(stop).await) }.instrument(info_span!("vu", vu = slot)),
        );
        self.running.insert(slot, stop_broadcaster);
        self.summary.started += 1;
    }

    /// Return the lowest slot still ramping down to the running set.
    fn reclaim(&mut self) -> bool {
        match self.ramping_down.pop_first() {
            Some((slot, (_, broadcaster))) => {
                info!("Virtual user {slot} ramped back up");
                self.running.insert(slot, broadcaster);
                true
            }
            None => false,
        }
    }

    /// Ramp down the highest running slot. It is stopped once `grace` has
    /// passed unless its connection ends first.
    fn ramp_down_highest(&mut self, grace: Duration) {
        if let Some((slot, broadcaster)) = self.running.pop_last() {
            if grace.is_zero() {
                self.stop(slot, broadcaster);
            } else {
                info!("Ramping down virtual user {slot} within {grace:?}");
                self.ramping_down.insert(slot, (Instant::now() + grace, broadcaster));
            }
        }
    }

    /// Stop ramped-down slots whose grace period is over.
    fn expire_ramp_downs(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .ramping_down
            .iter()
            .filter(|(_, (at, _))| *at <= now)
            .map(|(slot, _)| *slot)
            .collect();
        for slot in expired {
            if let Some((_, broadcaster)) = self.ramping_down.remove(&slot) {
                self.stop(slot, broadcaster);
            }
        }
    }

    fn stop(&mut self, slot: u32, broadcaster: Broadcaster) {
        info!("Stopping virtual user {slot}");
        broadcaster.signal();
        self.stopping.insert(slot);
    }

    fn stop_all(&mut self) {
        while let Some((slot, broadcaster)) = self.running.pop_last() {
            self.stop(slot, broadcaster);
        }
        while let Some((slot, (_, broadcaster))) = self.ramping_down.pop_last() {
            self.stop(slot, broadcaster);
        }
    }

    fn reap(&mut self, joined: Result<(u32, Outcome), JoinError>) {
        let (slot, outcome) = match joined {
            Ok(joined) => joined,
            Err(err) => {
                error!("Virtual user task failed: {err}");
                self.summary.lost += 1;
                return;
            }
        };
        info!("Virtual user {slot} finished: {outcome:?}");
        self.running.remove(&slot);
        self.ramping_down.remove(&slot);
        self.stopping.remove(&slot);
        if matches!(outcome, Outcome::LoginFailed | Outcome::GaveUp { .. }) {
            warn!("Retiring virtual user {slot} for the rest of the run");
            self.retired.insert(slot);
        }
        counter!("unit_outcome", "outcome" => outcome.label()).increment(1);
        self.summary.record(&outcome);
    }

    /// Reap units until none are left or `within` elapses. Returns whether
    /// every unit finished.
    async fn drain(&mut self, within: Duration) -> bool {
        let deadline = tokio::time::sleep(within);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                biased;
                joined = self.units.join_next() => match joined {
                    Some(joined) => self.reap(joined),
                    None => return true,
                },
                () = &mut deadline => return false,
            }
        }
    }

    fn report(&self) {
        gauge!("active_vus").set(self.running.len() as f64);
    }
}

#[derive(Debug)]
/// Ramps virtual users through the configured stages.
pub struct Driver {
    schedule: Schedule,
    identities: Arc<[Identity]>,
    iam: Arc<iam::Client>,
    lobby_url: Arc<str>,
    plan: Plan,
    graceful_stop: Duration,
    graceful_ramp_down: Duration,
    shutdown: Watcher,
}

impl Driver {
    /// Create a new [`Driver`].
    ///
    /// # Errors
    ///
    /// Function will error if the config has no `session` section, the ramp
    /// is empty, identities cannot be loaded, or the lobby URL is invalid.
    pub fn new(config: &config::Config, shutdown: Watcher) -> Result<Self, Error> {
        let session = config.session()?;
        let schedule = Schedule::new(session.start_vus, &session.stages)?;
        let identities = identity::load(&session.users_path, &config.user_login_password)?;
        if identities.is_empty() {
            return Err(Error::NoIdentities(session.users_path.clone()));
        }
        if let Err(source) = config.ws_url.as_str().into_client_request() {
            return Err(Error::LobbyUrl {
                url: config.ws_url.clone(),
                source: Box::new(source),
            });
        }

        Ok(Self {
            schedule,
            identities: identities.into(),
            iam: Arc::new(config.iam_client()?),
            lobby_url: config.ws_url.as_str().into(),
            plan: session.plan(),
            graceful_stop: session.graceful_stop(),
            graceful_ramp_down: session.graceful_ramp_down(),
            shutdown,
        })
    }

    /// Run the [`Driver`] to completion
    ///
    /// This function runs until the test window closes and virtual users have
    /// finished, or until a shutdown signal is received.
    ///
    /// # Errors
    ///
    /// None are known.
    pub async fn spin(self) -> Result<Summary, Error> {
        let start = Instant::now();
        let deadline = Deadline::at(start + self.schedule.total_duration());
        let capacity = u32::try_from(self.identities.len()).unwrap_or(u32::MAX);
        if self.schedule.peak() > capacity {
            warn!(
                "Ramp peaks at {peak} virtual users but only {capacity} identities are loaded, capping",
                peak = self.schedule.peak()
            );
        }
        info!(
            "Running {stages:?} for {window:?}",
            stages = self.schedule,
            window = self.schedule.total_duration()
        );

        let mut fleet = Fleet::new();
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown_wait = self.shutdown.clone().recv();
        tokio::pin!(shutdown_wait);
        let window = tokio::time::sleep_until(deadline.instant());
        tokio::pin!(window);

        let interrupted = loop {
            tokio::select! {
                biased;
                () = &mut shutdown_wait => {
                    info!("Shutdown signal received, stopping all virtual users");
                    break true;
                }
                () = &mut window => {
                    info!("Test window closed");
                    break false;
                }
                Some(joined) = fleet.units.join_next() => fleet.reap(joined),
                _ = ticker.tick() => self.rebalance(&mut fleet, start, deadline, capacity),
            }
        };

        if interrupted {
            fleet.stop_all();
            fleet.report();
            if !fleet.drain(self.stop_allowance()).await {
                warn!("Virtual users did not stop in time, aborting");
            }
        } else if !fleet.drain(self.graceful_stop).await {
            warn!(
                "Virtual users still running {graceful_stop:?} past the deadline, stopping",
                graceful_stop = self.graceful_stop
            );
            fleet.stop_all();
            fleet.report();
            if !fleet.drain(self.stop_allowance()).await {
                warn!("Virtual users did not stop in time, aborting");
            }
        }

        fleet.units.shutdown().await;
        while let Some(joined) = fleet.units.join_next().await {
            fleet.reap(joined);
        }
        fleet.report();

        let summary = fleet.summary;
        info!("Session driver finished: {summary:?}");
        Ok(summary)
    }

    /// Time a stopped unit may take. It may be mid-handshake, which is
    /// finished before the close.
    fn stop_allowance(&self) -> Duration {
        self.plan.close_timeout * 2 + TICK
    }

    fn rebalance(&self, fleet: &mut Fleet, start: Instant, deadline: Deadline, capacity: u32) {
        let target = self.schedule.target_at(start.elapsed()).min(capacity);
        fleet.expire_ramp_downs(Instant::now());

        while fleet.active() > target {
            fleet.ramp_down_highest(self.graceful_ramp_down);
        }
        while fleet.active() < target && fleet.reclaim() {}

        if deadline.remaining() > self.plan.shutdown_buffer {
            while fleet.active() < target {
                let Some(slot) = fleet.lowest_free_slot(capacity) else {
                    break;
                };
                let Some(identity) = usize::try_from(slot - 1)
                    .ok()
                    .and_then(|row| self.identities.get(row))
                else {
                    break;
                };
                let unit = Unit::new(
                    identity.clone(),
                    Arc::clone(&self.iam),
                    Arc::clone(&self.lobby_url),
                    self.plan,
                    deadline,
                );
                fleet.start(slot, unit, &self.shutdown);
            }
        }

        fleet.report();
    }
}
