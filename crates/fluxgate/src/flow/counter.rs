//! Per-key traffic counters.
//!
//! Each counter tracks a monotonic total, a QPS figure recomputed on a
//! one-second tick from the increments since the previous tick, and
//! day/hour aggregates. Increments are lock-free; the tick task owns the
//! window rotation and the optional shared-store flush.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Local};
use fluxgate_core::prelude::*;
use parking_lot::{Mutex, RwLock};

use super::SharedStore;

pub struct FlowCounter {
	key: String,
	total: AtomicU64,
	// Increments since the last tick.
	delta: AtomicU64,
	qps: AtomicU64,
	windows: Mutex<Windows>,
}

#[derive(Default)]
struct Windows {
	day: HashMap<String, u64>,
	hour: HashMap<String, u64>,
}

impl FlowCounter {
	fn new(key: String) -> Self {
		FlowCounter {
			key,
			total: AtomicU64::new(0),
			delta: AtomicU64::new(0),
			qps: AtomicU64::new(0),
			windows: Mutex::new(Windows::default()),
		}
	}

	pub fn key(&self) -> &str {
		&self.key
	}

	pub fn incr(&self) {
		self.total.fetch_add(1, Ordering::Relaxed);
		self.delta.fetch_add(1, Ordering::Relaxed);
	}

	/// Requests counted since this counter was created.
	pub fn total(&self) -> u64 {
		self.total.load(Ordering::Relaxed)
	}

	/// Requests per second over the last completed tick.
	pub fn qps(&self) -> u64 {
		self.qps.load(Ordering::Relaxed)
	}

	/// Requests counted in the day containing `t`.
	pub fn day_data(&self, t: DateTime<Local>) -> u64 {
		let key = super::day_key(&self.key, t);
		self.windows.lock().day.get(&key).copied().unwrap_or(0)
	}

	/// Requests counted in the hour containing `t`.
	pub fn hour_data(&self, t: DateTime<Local>) -> u64 {
		let key = super::hour_key(&self.key, t);
		self.windows.lock().hour.get(&key).copied().unwrap_or(0)
	}

	/// One tick: drain the delta, recompute QPS, fold the delta into the
	/// day/hour windows for `now`. Returns the drained delta so the caller
	/// can forward it to the shared store.
	fn rotate(&self, elapsed: Duration, now: DateTime<Local>) -> u64 {
		let delta = self.delta.swap(0, Ordering::AcqRel);
		let secs = elapsed.as_secs_f64();
		let qps = if secs > 0.0 {
			(delta as f64 / secs).round() as u64
		} else {
			0
		};
		self.qps.store(qps, Ordering::Relaxed);
		if delta > 0 {
			let mut windows = self.windows.lock();
			*windows.day.entry(super::day_key(&self.key, now)).or_default() += delta;
			*windows
				.hour
				.entry(super::hour_key(&self.key, now))
				.or_default() += delta;
		}
		delta
	}
}

/// Lazily creates one [`FlowCounter`] per key; counters live for the rest
/// of the process. Constructed once in app wiring and passed through the
/// pipelines, so tests get their own isolated registries.
pub struct FlowRegistry {
	counters: RwLock<HashMap<String, Arc<FlowCounter>>>,
	shared: Option<SharedStore>,
}

impl FlowRegistry {
	pub fn new(shared: Option<SharedStore>) -> Self {
		FlowRegistry {
			counters: RwLock::new(HashMap::new()),
			shared,
		}
	}

	pub fn get_counter(&self, key: &str) -> Arc<FlowCounter> {
		if let Some(counter) = self.counters.read().get(key) {
			return counter.clone();
		}
		let mut counters = self.counters.write();
		counters
			.entry(key.to_string())
			.or_insert_with(|| {
				let counter = Arc::new(FlowCounter::new(key.to_string()));
				spawn_ticker(counter.clone(), self.shared.clone());
				counter
			})
			.clone()
	}
}

fn spawn_ticker(counter: Arc<FlowCounter>, shared: Option<SharedStore>) {
	// Outside a runtime (unit tests building registries directly) there is
	// nothing to drive the tick; rotation is exercised by hand there.
	let Ok(handle) = tokio::runtime::Handle::try_current() else {
		return;
	};
	handle.spawn(async move {
		let mut interval = tokio::time::interval(Duration::from_secs(1));
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		// The first tick completes immediately.
		interval.tick().await;
		let mut last = Instant::now();
		loop {
			interval.tick().await;
			let now = Instant::now();
			let delta = counter.rotate(now.duration_since(last), Local::now());
			last = now;
			if delta > 0 {
				if let Some(shared) = &shared {
					if let Err(e) = shared.record(counter.key(), delta, Local::now()).await {
						warn!(key = counter.key(), "failed to flush flow counts: {e}");
					}
				}
			}
		}
	});
}
