//! One-shot phase signals for lobby-load.
//!
//! The load driver needs to tell many virtual users, at once or one at a
//! time, that their run is over: the operator pressed ctrl-c, the ramp
//! schedule wants fewer users, or the test window closed. Each of those is a
//! single event that happens at most once, modeled here as a `Broadcaster`
//! and any number of `Watcher` instances.
//!
//! A `Watcher` can be registered, in which case the `Broadcaster` will wait
//! for it to drop in `Broadcaster::signal_and_wait`, or merely cloned, in
//! which case nobody waits on it. Dropping the `Broadcaster` without calling
//! `signal` is treated the same as signaling.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{Notify, watch};
use tracing::info;

/// Construct a `Watcher` and `Broadcaster` pair.
///
/// The returned `Watcher` is registered.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    let peers = Arc::new(AtomicU32::new(1));
    let departed = Arc::new(Notify::new());

    let watcher = Watcher {
        receiver,
        peers: Arc::clone(&peers),
        departed: Arc::clone(&departed),
        registered: true,
    };
    let broadcaster = Broadcaster {
        sender,
        peers,
        departed,
    };

    (watcher, broadcaster)
}

#[derive(Debug)]
/// Sends the signal to every `Watcher` derived from the same pair.
pub struct Broadcaster {
    sender: watch::Sender<bool>,
    /// Count of registered watchers that have not yet dropped.
    peers: Arc<AtomicU32>,
    /// Woken each time a registered watcher drops.
    departed: Arc<Notify>,
}

impl Broadcaster {
    /// Send the signal without waiting for any `Watcher` to react.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }

    /// Send the signal and wait until every registered `Watcher` has dropped.
    pub async fn signal_and_wait(self) {
        self.sender.send_replace(true);

        loop {
            // Register for the wakeup before reading the count, else a peer
            // departing between the two is missed and we hang.
            let departed = self.departed.notified();

            let peers = self.peers.load(Ordering::SeqCst);
            if peers == 0 {
                break;
            }
            info!("Waiting for {peers} peers");

            departed.await;
        }
    }
}

/// Errors for `Watcher::register`.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum RegisterError {
    /// The signal has already been sent, there is nothing left to wait on.
    #[error("signal has been received")]
    SignalReceived,
}

#[derive(Debug)]
/// Waits for the signal sent by a `Broadcaster`.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
    peers: Arc<AtomicU32>,
    departed: Arc<Notify>,
    /// Whether `Broadcaster::signal_and_wait` waits for this instance.
    registered: bool,
}

impl Watcher {
    /// Wait for the signal. Returns immediately if it was already sent.
    pub async fn recv(mut self) {
        // An error here means the `Broadcaster` dropped, which counts as the
        // signal.
        let _ = self.receiver.wait_for(|signalled| *signalled).await;
    }

    /// Whether the signal has been sent, without waiting.
    #[must_use]
    pub fn is_signalled(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Create a new registered `Watcher`.
    ///
    /// # Errors
    ///
    /// Returns `RegisterError::SignalReceived` if the signal has already been
    /// sent, since a late peer could never be waited on correctly.
    pub fn register(&self) -> Result<Self, RegisterError> {
        if self.is_signalled() {
            return Err(RegisterError::SignalReceived);
        }
        self.peers.fetch_add(1, Ordering::SeqCst);

        Ok(Self {
            receiver: self.receiver.clone(),
            peers: Arc::clone(&self.peers),
            departed: Arc::clone(&self.departed),
            registered: true,
        })
    }
}

impl Clone for Watcher {
    /// Clones are never registered.
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            peers: Arc::clone(&self.peers),
            departed: Arc::clone(&self.departed),
            registered: false,
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }
        // fetch_sub would wrap at zero, leaving the count at u32::MAX.
        let mut old = self.peers.load(Ordering::Relaxed);
        while old > 0 {
            match self.peers.compare_exchange_weak(
                old,
                old - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.departed.notify_waiters();
                    break;
                }
                Err(current) => old = current,
            }
        }
    }
}
