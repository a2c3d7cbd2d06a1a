//! Graceful-shutdown plumbing.
//!
//! A [`DrainTrigger`]/[`DrainWatcher`] pair is created at startup. Every task
//! that should be allowed to finish work holds a `DrainWatcher` clone; accept
//! loops additionally await [`DrainWatcher::wait_for_drain`] to learn when to
//! stop taking new work. Triggering the drain flips the signal and then waits
//! until every watcher clone has been dropped, bounded by a deadline.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (signal_tx, signal_rx) = watch::channel(false);
	let (active_tx, active_rx) = mpsc::channel::<()>(1);
	(
		DrainTrigger {
			signal: signal_tx,
			done: active_rx,
		},
		DrainWatcher {
			signal: signal_rx,
			_active: active_tx,
		},
	)
}

#[derive(Clone)]
pub struct DrainWatcher {
	signal: watch::Receiver<bool>,
	// Keeps the trigger waiting while this clone is alive.
	_active: mpsc::Sender<()>,
}

impl DrainWatcher {
	/// Resolves once a drain has been requested. Consumes this clone, so a
	/// task that also wants to block the drain must keep another one.
	pub async fn wait_for_drain(mut self) {
		loop {
			if *self.signal.borrow_and_update() {
				return;
			}
			if self.signal.changed().await.is_err() {
				// Trigger dropped without draining; treat as drained.
				return;
			}
		}
	}
}

pub struct DrainTrigger {
	signal: watch::Sender<bool>,
	done: mpsc::Receiver<()>,
}

impl DrainTrigger {
	/// Signals all watchers to drain and waits for them to drop, up to
	/// `deadline`.
	pub async fn start_drain_and_wait(mut self, deadline: Duration) {
		let _ = self.signal.send(true);
		match tokio::time::timeout(deadline, self.done.recv()).await {
			Ok(_) => debug!("all watchers drained"),
			Err(_) => warn!("drain deadline of {deadline:?} reached; forcing shutdown"),
		}
	}
}
