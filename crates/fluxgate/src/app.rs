//! Data-plane assembly: load the snapshot once, wire the registries, bind
//! the listeners, and run until a termination signal drains everything.

use anyhow::Context;
use fluxgate_core::prelude::*;
use fluxgate_core::{drain, signal};

use crate::auth::TokenSigner;
use crate::flow::{FlowRegistry, LimiterRegistry, SharedStore};
use crate::lb::BalancerRegistry;
use crate::proxy::{Gateway, ProxyInputs};
use crate::store::{ConfigCache, FileStore};
use crate::transport::TransportPool;
use crate::{Config, flow};

pub async fn run(cfg: Arc<Config>) -> anyhow::Result<()> {
	let cache = ConfigCache::new(FileStore::new(cfg.proxy.snapshot.clone()));
	let snapshot = cache.load_once().context("loading configuration snapshot")?;

	let shared = match &cfg.shared_store {
		Some(store) => Some(
			SharedStore::connect(&store.dsn)
				.await
				.context("connecting to the shared flow store")?,
		),
		None => None,
	};

	let pi = Arc::new(ProxyInputs {
		signer: TokenSigner::new(&cfg.auth.secret, cfg.token_ttl()),
		snapshot,
		balancers: BalancerRegistry::new(),
		transports: TransportPool::new().context("building transport pool")?,
		counters: FlowRegistry::new(shared),
		limiters: LimiterRegistry::new(),
		cfg: cfg.clone(),
	});

	let (trigger, watcher) = drain::new();
	let gateway = Gateway::bind(pi.clone(), watcher).await?;
	let serving = tokio::spawn(gateway.serve());

	signal::Shutdown::new().wait().await;
	info!("draining, grace period {:?}", cfg.grace_period());
	trigger.start_drain_and_wait(cfg.grace_period()).await;
	serving.abort();
	let _ = serving.await;
	info!("shutdown complete");
	Ok(())
}

/// The per-key counter snapshots consumed by the dashboard collaborator.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FlowSnapshot {
	pub key: String,
	pub qps: u64,
	pub total: u64,
	pub today: u64,
	pub current_hour: u64,
}

/// Reads a counter's current figures, creating the counter if this key has
/// seen no traffic yet.
pub fn flow_snapshot(counters: &FlowRegistry, key: &str) -> FlowSnapshot {
	let counter = counters.get_counter(key);
	let now = chrono::Local::now();
	FlowSnapshot {
		key: key.to_string(),
		qps: counter.qps(),
		total: counter.total(),
		today: counter.day_data(now),
		current_hour: counter.hour_data(now),
	}
}

/// Convenience wrappers over the three flow namespaces.
pub fn total_flow(counters: &FlowRegistry) -> FlowSnapshot {
	flow_snapshot(counters, flow::FLOW_TOTAL)
}

pub fn service_flow(counters: &FlowRegistry, service_name: &str) -> FlowSnapshot {
	flow_snapshot(counters, &flow::service_key(service_name))
}

pub fn app_flow(counters: &FlowRegistry, app_id: &str) -> FlowSnapshot {
	flow_snapshot(counters, &flow::app_key(app_id))
}
