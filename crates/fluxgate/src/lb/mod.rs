//! Per-service upstream selection.
//!
//! Each service gets one [`Balancer`] holding its upstream endpoints, the
//! configured policy, and the health state maintained by an out-of-band
//! TCP checker. Balancers are memoized by service name in a
//! [`BalancerRegistry`] created at startup and passed through the
//! pipelines.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use fluxgate_core::prelude::*;
use parking_lot::{Mutex, RwLock};
use rand::seq::IndexedRandom;

use crate::types::{LoadType, RoundType, ServiceDetail};

#[cfg(test)]
#[path = "lb_test.rs"]
mod tests;

#[derive(Debug, thiserror::Error)]
pub enum LbError {
	#[error("no active upstream for service {0}")]
	NoActiveUpstream(String),
}

struct Upstream {
	/// `host:port`.
	addr: String,
	weight: u32,
	healthy: AtomicBool,
}

struct WrrState {
	current: Vec<i64>,
}

enum Policy {
	RoundRobin(AtomicUsize),
	WeightedRoundRobin(Mutex<WrrState>),
	Random,
	IpHash,
}

pub struct Balancer {
	service: String,
	/// `http://`, `https://`, or empty for TCP/gRPC targets.
	scheme: &'static str,
	upstreams: Vec<Upstream>,
	policy: Policy,
}

impl Balancer {
	fn new(detail: &ServiceDetail) -> Self {
		let lb = &detail.load_balance;
		let forbidden = lb.forbidden();
		let weights = lb.weights();
		let upstreams: Vec<Upstream> = lb
			.upstreams()
			.into_iter()
			.enumerate()
			.filter(|(_, addr)| !is_forbidden(&forbidden, addr))
			.map(|(i, addr)| Upstream {
				addr,
				weight: weights
					.get(i)
					.and_then(|w| w.parse::<u32>().ok())
					.unwrap_or(1),
				healthy: AtomicBool::new(true),
			})
			.collect();
		let policy = match lb.round_type {
			RoundType::RoundRobin => Policy::RoundRobin(AtomicUsize::new(0)),
			RoundType::WeightedRoundRobin => Policy::WeightedRoundRobin(Mutex::new(WrrState {
				current: vec![0; upstreams.len()],
			})),
			RoundType::Random => Policy::Random,
			RoundType::IpHash => Policy::IpHash,
		};
		let scheme = match detail.info.load_type {
			LoadType::Http => {
				if detail.http_rule.as_ref().is_some_and(|r| r.need_https) {
					"https://"
				} else {
					"http://"
				}
			},
			LoadType::Tcp | LoadType::Grpc => "",
		};
		Balancer {
			service: detail.name().to_string(),
			scheme,
			upstreams,
			policy,
		}
	}

	/// Selects an upstream from the active set and returns it with the
	/// service's scheme prefix applied.
	pub fn pick(&self, client_ip: IpAddr) -> Result<String, LbError> {
		let active: Vec<usize> = self
			.upstreams
			.iter()
			.enumerate()
			.filter(|(_, u)| u.healthy.load(Ordering::Relaxed))
			.map(|(i, _)| i)
			.collect();
		if active.is_empty() {
			return Err(LbError::NoActiveUpstream(self.service.clone()));
		}

		let chosen = match &self.policy {
			Policy::RoundRobin(next) => {
				let n = next.fetch_add(1, Ordering::Relaxed);
				active[n % active.len()]
			},
			Policy::WeightedRoundRobin(state) => self.pick_weighted(&active, state),
			Policy::Random => *active
				.choose(&mut rand::rng())
				.expect("active set checked non-empty"),
			Policy::IpHash => {
				let mut hasher = std::collections::hash_map::DefaultHasher::new();
				client_ip.hash(&mut hasher);
				active[(hasher.finish() % active.len() as u64) as usize]
			},
		};
		Ok(format!("{}{}", self.scheme, self.upstreams[chosen].addr))
	}

	/// Smooth weighted round-robin: every pick adds each upstream's weight
	/// to its running score, takes the highest scorer, and knocks the total
	/// weight off the winner. Over sum(weights) consecutive picks each
	/// upstream wins exactly its weight.
	fn pick_weighted(&self, active: &[usize], state: &Mutex<WrrState>) -> usize {
		let mut state = state.lock();
		let mut total: i64 = 0;
		let mut best = active[0];
		let mut best_score = i64::MIN;
		for &i in active {
			let weight = self.upstreams[i].weight as i64;
			state.current[i] += weight;
			total += weight;
			if state.current[i] > best_score {
				best_score = state.current[i];
				best = i;
			}
		}
		state.current[best] -= total;
		best
	}

	fn mark(&self, index: usize, healthy: bool) {
		let upstream = &self.upstreams[index];
		if upstream.healthy.swap(healthy, Ordering::Relaxed) != healthy {
			if healthy {
				info!(service = %self.service, addr = %upstream.addr, "upstream restored");
			} else {
				warn!(service = %self.service, addr = %upstream.addr, "upstream marked down");
			}
		}
	}
}

fn is_forbidden(forbidden: &[String], addr: &str) -> bool {
	let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
	forbidden.iter().any(|f| f == addr || f == host)
}

pub struct BalancerRegistry {
	balancers: RwLock<HashMap<String, Arc<Balancer>>>,
}

impl BalancerRegistry {
	pub fn new() -> Self {
		BalancerRegistry {
			balancers: RwLock::new(HashMap::new()),
		}
	}

	/// Returns the service's balancer, creating it (and its health-check
	/// task, when enabled) on first use.
	pub fn get(&self, detail: &ServiceDetail) -> Arc<Balancer> {
		if let Some(balancer) = self.balancers.read().get(detail.name()) {
			return balancer.clone();
		}
		self
			.balancers
			.write()
			.entry(detail.name().to_string())
			.or_insert_with(|| {
				let balancer = Arc::new(Balancer::new(detail));
				spawn_health_checker(balancer.clone(), &detail.load_balance);
				balancer
			})
			.clone()
	}
}

impl Default for BalancerRegistry {
	fn default() -> Self {
		Self::new()
	}
}

fn spawn_health_checker(balancer: Arc<Balancer>, lb: &crate::types::LoadBalanceConfig) {
	if lb.check_interval_secs == 0 {
		return;
	}
	let Ok(handle) = tokio::runtime::Handle::try_current() else {
		return;
	};
	let interval = Duration::from_secs(lb.check_interval_secs);
	let timeout = Duration::from_secs(lb.check_timeout_secs.max(1));
	// CheckMethod only has the TCP probe today, so no dispatch on it yet.
	handle.spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			ticker.tick().await;
			for (i, upstream) in balancer.upstreams.iter().enumerate() {
				let up = matches!(
					tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&upstream.addr)).await,
					Ok(Ok(_))
				);
				balancer.mark(i, up);
			}
		}
	});
}
