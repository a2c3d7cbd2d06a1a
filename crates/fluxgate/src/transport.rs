//! Per-service upstream HTTP transports.
//!
//! Each service gets one pooled client tuned from its LoadBalance row:
//! connect timeout on the connector, idle-connection timeout and max idle
//! connections on the pool, and a response-header deadline applied by the
//! caller around the request future. gRPC services get an http2-only
//! client so the stream rides a single prior-knowledge h2 connection.

use std::collections::HashMap;

use fluxgate_core::prelude::*;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use parking_lot::RwLock;

use crate::http::Body;
use crate::types::{LoadType, ServiceDetail};

type PooledClient = Client<HttpsConnector<HttpConnector>, Body>;

pub struct ServiceTransport {
	pub client: PooledClient,
	/// Deadline for the upstream to produce response headers.
	pub header_timeout: Duration,
	/// Deadline for raw dials done outside the client (TCP pipeline).
	pub connect_timeout: Duration,
}

pub struct TransportPool {
	transports: RwLock<HashMap<String, Arc<ServiceTransport>>>,
	tls: rustls::ClientConfig,
}

impl TransportPool {
	pub fn new() -> anyhow::Result<Self> {
		let mut roots = rustls::RootCertStore::empty();
		let native = rustls_native_certs::load_native_certs();
		for cert in native.certs {
			// Unparseable platform certs are skipped, not fatal.
			let _ = roots.add(cert);
		}
		let tls = rustls::ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth();
		Ok(TransportPool {
			transports: RwLock::new(HashMap::new()),
			tls,
		})
	}

	/// Returns the service's transport, building it on first use.
	pub fn get(&self, detail: &ServiceDetail) -> Arc<ServiceTransport> {
		if let Some(transport) = self.transports.read().get(detail.name()) {
			return transport.clone();
		}
		self
			.transports
			.write()
			.entry(detail.name().to_string())
			.or_insert_with(|| Arc::new(self.build(detail)))
			.clone()
	}

	fn build(&self, detail: &ServiceDetail) -> ServiceTransport {
		let lb = &detail.load_balance;
		let connect_timeout = Duration::from_secs(lb.upstream_connect_timeout_secs);

		let mut http = HttpConnector::new();
		http.enforce_http(false);
		http.set_connect_timeout(Some(connect_timeout));
		let connector = hyper_rustls::HttpsConnectorBuilder::new()
			.with_tls_config(self.tls.clone())
			.https_or_http()
			.enable_all_versions()
			.wrap_connector(http);

		let mut builder = Client::builder(TokioExecutor::new());
		builder
			.timer(TokioTimer::new())
			.pool_timer(TokioTimer::new())
			.pool_idle_timeout(Duration::from_secs(lb.upstream_idle_timeout_secs))
			.pool_max_idle_per_host(lb.upstream_max_idle);
		if detail.info.load_type == LoadType::Grpc {
			builder.http2_only(true);
		}
		let client = builder.build(connector);

		debug!(service = detail.name(), "transport created");
		ServiceTransport {
			client,
			header_timeout: Duration::from_secs(lb.upstream_header_timeout_secs),
			connect_timeout,
		}
	}
}
