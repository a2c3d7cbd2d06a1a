use tracing::info;

/// Waits for a process termination request (SIGINT or SIGTERM).
///
/// Any component which wants to observe shutdown should be handed a
/// `DrainWatcher` instead; this type is owned by the top-level binary loop.
pub struct Shutdown {
	_private: (),
}

impl Shutdown {
	pub fn new() -> Self {
		Shutdown { _private: () }
	}

	/// Resolves once a termination signal is received.
	pub async fn wait(self) {
		wait_termination().await
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(unix)]
async fn wait_termination() {
	use tokio::signal::unix::{SignalKind, signal};
	let mut interrupt = signal(SignalKind::interrupt()).expect("failed to register signal handler");
	let mut terminate = signal(SignalKind::terminate()).expect("failed to register signal handler");
	tokio::select! {
		_ = interrupt.recv() => info!("received SIGINT"),
		_ = terminate.recv() => info!("received SIGTERM"),
	};
}

#[cfg(not(unix))]
async fn wait_termination() {
	let _ = tokio::signal::ctrl_c().await;
	info!("received ctrl-c");
}
