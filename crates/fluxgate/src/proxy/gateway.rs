//! The listener supervisor.
//!
//! One HTTP listener (and, when TLS material is configured, one HTTPS
//! listener) on the cluster ports serves every HTTP service, dispatched by
//! host/path. Each TCP and gRPC service additionally gets its own listener
//! on its configured port. All sockets are bound up front so a port that
//! cannot be claimed fails startup; accept loops then run until the drain
//! watcher fires, and in-flight work holds drain clones so shutdown waits
//! for it (bounded by the configured grace period).

use std::net::SocketAddr;

use anyhow::Context;
use fluxgate_core::drain::DrainWatcher;
use fluxgate_core::prelude::*;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::proxy::ProxyInputs;
use crate::proxy::grpcproxy::GrpcProxy;
use crate::proxy::httpproxy::HttpProxy;
use crate::proxy::tcpproxy::TcpProxy;
use crate::types::ServiceDetail;

pub struct Gateway {
	pi: Arc<ProxyInputs>,
	drain: DrainWatcher,
	http: TcpListener,
	https: Option<(TcpListener, TlsAcceptor)>,
	tcp: Vec<(TcpListener, Arc<ServiceDetail>)>,
	grpc: Vec<(TcpListener, Arc<ServiceDetail>)>,
}

impl Gateway {
	/// Claims every listening socket. Any bind failure aborts startup.
	pub async fn bind(pi: Arc<ProxyInputs>, drain: DrainWatcher) -> anyhow::Result<Gateway> {
		let cluster = &pi.cfg.cluster;
		let http_addr = SocketAddr::new(cluster.cluster_ip, cluster.cluster_port);
		let http = TcpListener::bind(http_addr)
			.await
			.with_context(|| format!("binding HTTP listener on {http_addr}"))?;
		info!(addr = %http_addr, "HTTP listener bound");

		let https = match cluster.cluster_ssl_port {
			Some(port) => {
				let acceptor = tls_acceptor(&pi.cfg).context("loading TLS material")?;
				let addr = SocketAddr::new(cluster.cluster_ip, port);
				let listener = TcpListener::bind(addr)
					.await
					.with_context(|| format!("binding HTTPS listener on {addr}"))?;
				info!(addr = %addr, "HTTPS listener bound");
				Some((listener, acceptor))
			},
			None => None,
		};

		let mut tcp = Vec::new();
		for service in pi.snapshot.tcp_services() {
			let port = service
				.tcp_rule
				.as_ref()
				.map(|r| r.port)
				.context("TCP service without a rule")?;
			let addr = SocketAddr::new(cluster.cluster_ip, port);
			let listener = TcpListener::bind(addr)
				.await
				.with_context(|| format!("binding TCP listener for {} on {addr}", service.name()))?;
			info!(service = service.name(), addr = %addr, "TCP listener bound");
			tcp.push((listener, service.clone()));
		}

		let mut grpc = Vec::new();
		for service in pi.snapshot.grpc_services() {
			let port = service
				.grpc_rule
				.as_ref()
				.map(|r| r.port)
				.context("gRPC service without a rule")?;
			let addr = SocketAddr::new(cluster.cluster_ip, port);
			let listener = TcpListener::bind(addr)
				.await
				.with_context(|| format!("binding gRPC listener for {} on {addr}", service.name()))?;
			info!(service = service.name(), addr = %addr, "gRPC listener bound");
			grpc.push((listener, service.clone()));
		}

		Ok(Gateway {
			pi,
			drain,
			http,
			https,
			tcp,
			grpc,
		})
	}

	/// Runs every accept loop until the drain fires, then returns once all
	/// loops have stopped accepting.
	pub async fn serve(self) {
		let Gateway {
			pi,
			drain,
			http,
			https,
			tcp,
			grpc,
		} = self;
		let mut loops = JoinSet::new();

		{
			let proxy = HttpProxy::new(pi.clone());
			let drain = drain.clone();
			loops.spawn(accept_loop("http", http, drain, move |stream, peer, drain| {
				let proxy = proxy.clone();
				async move { serve_http(proxy, stream, peer, None, drain).await }
			}));
		}

		if let Some((listener, acceptor)) = https {
			let proxy = HttpProxy::new(pi.clone());
			let drain = drain.clone();
			loops.spawn(accept_loop(
				"https",
				listener,
				drain,
				move |stream, peer, drain| {
					let proxy = proxy.clone();
					let acceptor = acceptor.clone();
					async move { serve_http(proxy, stream, peer, Some(acceptor), drain).await }
				},
			));
		}

		for (listener, service) in tcp {
			let proxy = TcpProxy::new(pi.clone(), service);
			let drain = drain.clone();
			loops.spawn(accept_loop("tcp", listener, drain, move |stream, peer, drain| {
				let proxy = proxy.clone();
				async move {
					// Holding the watcher keeps shutdown waiting on this session.
					let _drain = drain;
					proxy.proxy(stream, peer).await
				}
			}));
		}

		for (listener, service) in grpc {
			let proxy = GrpcProxy::new(pi.clone(), service);
			let drain = drain.clone();
			loops.spawn(accept_loop("grpc", listener, drain, move |stream, peer, drain| {
				let proxy = proxy.clone();
				async move { serve_grpc(proxy, stream, peer, drain).await }
			}));
		}

		while let Some(res) = loops.join_next().await {
			if let Err(e) = res {
				warn!("listener task failed: {e}");
			}
		}
		info!("all listeners stopped");
	}
}

/// Accepts connections until the drain fires. Every accepted connection is
/// handled on its own task holding a drain clone, so shutdown waits for it.
async fn accept_loop<F, Fut>(
	kind: &'static str,
	listener: TcpListener,
	drain: DrainWatcher,
	handler: F,
) where
	F: Fn(TcpStream, SocketAddr, DrainWatcher) -> Fut,
	Fut: std::future::Future<Output = ()> + Send + 'static,
{
	let addr = listener
		.local_addr()
		.map(|a| a.to_string())
		.unwrap_or_default();
	info!(kind, %addr, "listening");
	let wait = drain.clone().wait_for_drain();
	tokio::pin!(wait);
	loop {
		tokio::select! {
			accepted = listener.accept() => {
				match accepted {
					Ok((stream, peer)) => {
						trace!(kind, %peer, "connection accepted");
						tokio::spawn(handler(stream, peer, drain.clone()));
					},
					Err(e) => {
						warn!(kind, %addr, "accept failed: {e}");
					},
				}
			}
			_ = &mut wait => {
				info!(kind, %addr, "listener stopping");
				break;
			}
		}
	}
	info!(kind, %addr, "listener stopped");
}

async fn serve_http(
	proxy: HttpProxy,
	stream: TcpStream,
	peer: SocketAddr,
	acceptor: Option<TlsAcceptor>,
	drain: DrainWatcher,
) {
	match acceptor {
		Some(acceptor) => match acceptor.accept(stream).await {
			Ok(tls) => serve_http_connection(proxy, tls, peer, drain).await,
			Err(e) => debug!(%peer, "TLS handshake failed: {e}"),
		},
		None => serve_http_connection(proxy, stream, peer, drain).await,
	}
}

/// Serves one connection, downgrading it gracefully (GOAWAY for h2,
/// `Connection: close` for h1) when the drain fires mid-flight.
async fn serve_http_connection<S>(proxy: HttpProxy, stream: S, peer: SocketAddr, drain: DrainWatcher)
where
	S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
	let server = auto_server();
	let conn = server.serve_connection_with_upgrades(
		TokioIo::new(stream),
		hyper::service::service_fn(move |req| {
			let proxy = proxy.clone();
			async move { Ok::<_, std::convert::Infallible>(proxy.proxy(peer, req).await) }
		}),
	);
	tokio::pin!(conn);
	tokio::select! {
		res = conn.as_mut() => {
			if let Err(e) = res {
				debug!(%peer, "connection closed with error: {e}");
			}
		}
		_ = drain.wait_for_drain() => {
			conn.as_mut().graceful_shutdown();
			if let Err(e) = conn.as_mut().await {
				debug!(%peer, "connection closed during drain: {e}");
			}
		}
	}
}

async fn serve_grpc(proxy: GrpcProxy, stream: TcpStream, peer: SocketAddr, drain: DrainWatcher) {
	let server = auto_server();
	let conn = server.serve_connection_with_upgrades(
		TokioIo::new(stream),
		hyper::service::service_fn(move |req| {
			let proxy = proxy.clone();
			async move { Ok::<_, std::convert::Infallible>(proxy.proxy(peer, req).await) }
		}),
	);
	tokio::pin!(conn);
	tokio::select! {
		res = conn.as_mut() => {
			if let Err(e) = res {
				debug!(%peer, "grpc connection closed with error: {e}");
			}
		}
		_ = drain.wait_for_drain() => {
			conn.as_mut().graceful_shutdown();
			if let Err(e) = conn.as_mut().await {
				debug!(%peer, "grpc connection closed during drain: {e}");
			}
		}
	}
}

fn auto_server() -> auto::Builder<TokioExecutor> {
	let mut builder = auto::Builder::new(TokioExecutor::new());
	builder.http2().timer(TokioTimer::new());
	builder
}

fn tls_acceptor(cfg: &crate::Config) -> anyhow::Result<TlsAcceptor> {
	let cluster = &cfg.cluster;
	let cert_path = cluster
		.ssl_cert_file
		.as_ref()
		.context("ssl_cert_file is required for the HTTPS listener")?;
	let key_path = cluster
		.ssl_key_file
		.as_ref()
		.context("ssl_key_file is required for the HTTPS listener")?;

	let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(fs_err::File::open(cert_path)?))
		.collect::<Result<Vec<_>, _>>()
		.with_context(|| format!("reading certificates from {}", cert_path.display()))?;
	let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(fs_err::File::open(
		key_path,
	)?))
	.with_context(|| format!("reading private key from {}", key_path.display()))?
	.context("no private key found")?;

	let config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.context("assembling TLS server config")?;
	Ok(TlsAcceptor::from(Arc::new(config)))
}
