//! Phase signalling for plumb.
//!
//! The agent winds down in phases: sources stop gathering, the pipeline
//! drains, sinks stop flushing on their own and a final flush runs. Every one
//! of those hand-offs is a single [`Broadcaster`] paired with any number of
//! [`Watcher`] instances. The `Broadcaster` fires exactly once. Registered
//! `Watcher` instances observe the signal and drop off, and
//! [`Broadcaster::signal_and_wait`] only returns once the last of them is gone,
//! which is how the scheduler knows in-flight work has finished.

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
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tokio::sync::{Notify, watch};
use tracing::{debug, info};

#[derive(Debug)]
struct Shared {
    /// Human name of the phase, used only in logs.
    phase: &'static str,
    /// Registered watchers that have not yet dropped off.
    peers: AtomicU32,
    /// Wakes the broadcaster whenever a peer drops off.
    departed: Notify,
}

/// Construct a `Watcher` and `Broadcaster` pair for the named phase.
///
/// The returned `Watcher` is registered: the `Broadcaster` will wait on it in
/// [`Broadcaster::signal_and_wait`].
#[must_use]
pub fn signal(phase: &'static str) -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    let shared = Arc::new(Shared {
        phase,
        peers: AtomicU32::new(1),
        departed: Notify::new(),
    });

    let watcher = Watcher {
        shared: Arc::clone(&shared),
        receiver,
        received: false,
        registered: true,
        departed: false,
    };
    let broadcaster = Broadcaster { shared, sender };

    (watcher, broadcaster)
}

#[derive(Debug)]
/// Fires a phase signal to every [`Watcher`] derived from the same pair.
pub struct Broadcaster {
    shared: Arc<Shared>,
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Fire the signal without waiting for any peer to acknowledge it.
    pub fn signal(self) {
        debug!(phase = self.shared.phase, "signalling");
        // A send error only means every receiver is gone already.
        let _ = self.sender.send(true);
    }

    /// Fire the signal and wait until every registered [`Watcher`] has
    /// received it and dropped off.
    pub async fn signal_and_wait(self) {
        let _ = self.sender.send(true);
        drop(self.sender);

        loop {
            // Create the notification future before reading the peer count.
            // A peer that departs between the read and the await would
            // otherwise wake nobody.
            let departed = self.shared.departed.notified();

            let peers = self.shared.peers.load(Ordering::SeqCst);
            if peers == 0 {
                break;
            }
            info!(phase = self.shared.phase, "waiting for {peers} peers");

            departed.await;
        }
        debug!(phase = self.shared.phase, "all peers departed");
    }

    /// The number of registered watchers that have not yet dropped off.
    #[must_use]
    pub fn peers(&self) -> u32 {
        self.shared.peers.load(Ordering::SeqCst)
    }
}

/// Errors for [`Watcher::try_recv`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum TryRecvError {
    /// The signal was already observed by this watcher.
    #[error("signal has been received")]
    SignalReceived,
}

/// Errors for [`Watcher::register`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum RegisterError {
    /// The signal was already observed by this watcher, no new peer may join.
    #[error("signal has been received")]
    SignalReceived,
}

#[derive(Debug)]
/// Observes a phase signal fired by the paired [`Broadcaster`].
pub struct Watcher {
    shared: Arc<Shared>,
    receiver: watch::Receiver<bool>,
    /// Set once this instance has observed the signal.
    received: bool,
    /// Whether the `Broadcaster` counts this instance among its peers.
    registered: bool,
    /// Whether this instance has already removed itself from the peer count.
    departed: bool,
}

impl Watcher {
    fn depart(&mut self) {
        if !self.registered || self.departed {
            return;
        }

        // fetch_sub would wrap below zero; the count must saturate.
        let mut old = self.shared.peers.load(Ordering::Relaxed);
        while old > 0 {
            match self.shared.peers.compare_exchange_weak(
                old,
                old - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.shared.departed.notify_waiters();
                    break;
                }
                Err(current) => old = current,
            }
        }
        self.departed = true;
    }

    fn fired(&self) -> bool {
        match self.receiver.has_changed() {
            Ok(_) => *self.receiver.borrow(),
            // The broadcaster is gone. Dropping it unsignalled still ends the
            // phase.
            Err(_) => true,
        }
    }

    /// Wait for the signal. Returns immediately if it has already been
    /// observed.
    pub async fn recv(mut self) {
        if self.received {
            // Yield so a `select!` arm polling this does not starve others.
            tokio::task::yield_now().await;
            return;
        }

        // An error here means the broadcaster dropped, which also counts.
        let _ = self.receiver.wait_for(|fired| *fired).await;
        self.received = true;
        self.depart();
    }

    /// Check for the signal without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`TryRecvError::SignalReceived`] on every call after the one
    /// that first observed the signal.
    pub fn try_recv(&mut self) -> Result<bool, TryRecvError> {
        if self.received {
            return Err(TryRecvError::SignalReceived);
        }
        if self.fired() {
            self.received = true;
            self.depart();
            return Ok(true);
        }
        Ok(false)
    }

    /// Register a new peer with the [`Broadcaster`].
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::SignalReceived`] if this watcher has already
    /// observed the signal.
    pub fn register(&self) -> Result<Self, RegisterError> {
        if self.received {
            return Err(RegisterError::SignalReceived);
        }
        self.shared.peers.fetch_add(1, Ordering::SeqCst);

        Ok(Self {
            shared: Arc::clone(&self.shared),
            receiver: self.receiver.clone(),
            received: false,
            registered: true,
            departed: false,
        })
    }
}

impl Clone for Watcher {
    /// Clones are not registered: the `Broadcaster` never waits on them.
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            receiver: self.receiver.clone(),
            received: self.received,
            registered: false,
            departed: false,
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.depart();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    const PATIENCE: Duration = Duration::from_secs(5);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn signal_and_wait_returns_once_watcher_receives() {
        let (watcher, broadcaster) = signal("test");

        let handle = tokio::spawn(watcher.recv());

        timeout(PATIENCE, broadcaster.signal_and_wait())
            .await
            .expect("broadcaster hung");
        handle.await.expect("watcher task panicked");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unregistered_clone_does_not_block_broadcaster() {
        let (watcher, broadcaster) = signal("test");
        let _unregistered = watcher.clone();

        let handle = tokio::spawn(watcher.recv());

        timeout(PATIENCE, broadcaster.signal_and_wait())
            .await
            .expect("broadcaster hung on an unregistered clone");
        handle.await.expect("watcher task panicked");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn every_registered_watcher_must_depart() {
        let (first, broadcaster) = signal("test");
        let second = first.register().expect("register failed");
        assert_eq!(broadcaster.peers(), 2);

        let first = tokio::spawn(first.recv());
        let second = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            second.recv().await;
        });

        timeout(PATIENCE, broadcaster.signal_and_wait())
            .await
            .expect("broadcaster hung");
        first.await.expect("first watcher panicked");
        second.await.expect("second watcher panicked");
    }

    #[tokio::test]
    async fn dropped_watchers_count_as_departed() {
        let (watcher, broadcaster) = signal("test");
        drop(watcher);

        timeout(PATIENCE, broadcaster.signal_and_wait())
            .await
            .expect("broadcaster hung with no watchers");
    }

    #[test]
    fn try_recv_before_and_after_signal() {
        let (mut watcher, broadcaster) = signal("test");

        assert!(!watcher.try_recv().expect("not yet received"));
        broadcaster.signal();
        assert!(watcher.try_recv().expect("first observation"));
        assert!(matches!(
            watcher.try_recv(),
            Err(TryRecvError::SignalReceived)
        ));
    }

    #[test]
    fn dropping_the_broadcaster_fires_the_signal() {
        let (mut watcher, broadcaster) = signal("test");
        drop(broadcaster);

        assert!(watcher.try_recv().expect("first observation"));
    }

    #[test]
    fn register_after_observing_the_signal_fails() {
        let (mut watcher, broadcaster) = signal("test");
        broadcaster.signal();

        assert!(watcher.try_recv().expect("first observation"));
        assert!(matches!(
            watcher.register(),
            Err(RegisterError::SignalReceived)
        ));
    }

    #[test]
    fn register_after_signal_but_before_observing_succeeds() {
        let (mut first, broadcaster) = signal("test");
        broadcaster.signal();

        let mut second = first.register().expect("register failed");
        assert!(first.try_recv().expect("first observation"));
        assert!(second.try_recv().expect("second observation"));
    }
}
