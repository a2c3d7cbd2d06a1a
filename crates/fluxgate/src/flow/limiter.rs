//! Per-key token-bucket rate limiting.

use std::collections::HashMap;

use fluxgate_core::prelude::*;
use parking_lot::RwLock;
use ratelimit::Ratelimiter;

/// Token bucket with rate `qps` and burst `3 * qps`. The bucket starts
/// full so a fresh key can absorb its burst immediately; refills land one
/// token at a time to keep admission smooth within a second.
pub struct RateLimiter {
	inner: Ratelimiter,
}

impl RateLimiter {
	pub fn new(qps: u64) -> Self {
		let qps = qps.max(1);
		let burst = qps.saturating_mul(3);
		let refill_interval = Duration::from_nanos((1_000_000_000 / qps).max(1));
		let inner = Ratelimiter::builder(1, refill_interval)
			.max_tokens(burst)
			.initial_available(burst)
			.build()
			.expect("one refill token never exceeds the burst capacity");
		RateLimiter { inner }
	}

	/// Takes one token if available. Never blocks.
	pub fn allow(&self) -> bool {
		self.inner.try_wait().is_ok()
	}
}

/// Lazily creates one [`RateLimiter`] per key; limiters live for the rest
/// of the process. The rate is fixed at first use, matching the immutable
/// snapshot the keys are derived from.
pub struct LimiterRegistry {
	limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
}

impl LimiterRegistry {
	pub fn new() -> Self {
		LimiterRegistry {
			limiters: RwLock::new(HashMap::new()),
		}
	}

	pub fn get_limiter(&self, key: &str, qps: u64) -> Arc<RateLimiter> {
		if let Some(limiter) = self.limiters.read().get(key) {
			return limiter.clone();
		}
		self
			.limiters
			.write()
			.entry(key.to_string())
			.or_insert_with(|| Arc::new(RateLimiter::new(qps)))
			.clone()
	}
}

impl Default for LimiterRegistry {
	fn default() -> Self {
		Self::new()
	}
}
