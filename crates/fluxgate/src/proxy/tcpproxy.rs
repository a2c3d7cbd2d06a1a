//! The TCP pipeline: the raw-connection analogue of the HTTP chain.
//!
//! Each TCP service owns a listener; accepted connections run
//! {FlowCount, FlowLimit, WhiteList, BlackList} against the peer address,
//! then bytes are piped to the picked upstream until either side closes.
//! A policy abort writes one plaintext line before closing.

use std::net::SocketAddr;

use fluxgate_core::prelude::*;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::proxy::{ProxyError, ProxyInputs, policy};
use crate::types::ServiceDetail;

#[derive(Clone)]
pub struct TcpProxy {
	inputs: Arc<ProxyInputs>,
	service: Arc<ServiceDetail>,
}

impl TcpProxy {
	pub fn new(inputs: Arc<ProxyInputs>, service: Arc<ServiceDetail>) -> Self {
		TcpProxy { inputs, service }
	}

	pub async fn proxy(&self, mut stream: TcpStream, peer: SocketAddr) {
		if let Err(e) = self.proxy_internal(&mut stream, peer).await {
			debug!(service = self.service.name(), %peer, errno = e.errno(), "connection aborted: {e}");
			let _ = stream.write_all(format!("{e}\n").as_bytes()).await;
		}
	}

	async fn proxy_internal(
		&self,
		stream: &mut TcpStream,
		peer: SocketAddr,
	) -> Result<(), ProxyError> {
		let pi = &self.inputs;
		let service = &self.service;
		let client_ip = peer.ip();

		policy::count_request(pi, service);
		policy::check_flow_limits(pi, service, client_ip)?;
		policy::check_white_list(service, client_ip)?;
		policy::check_black_list(service, client_ip)?;

		let target = pi.balancers.get(service).pick(client_ip)?;
		let connect_timeout = Duration::from_secs(service.load_balance.upstream_connect_timeout_secs);
		let mut upstream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&target))
			.await
		{
			Ok(Ok(upstream)) => upstream,
			Ok(Err(e)) => return Err(ProxyError::UpstreamUnavailable(format!("{target}: {e}"))),
			Err(_) => return Err(ProxyError::UpstreamTimeout),
		};
		debug!(service = service.name(), %peer, %target, "tcp session open");

		let traffic = fluxgate_core::copy::relay(stream, &mut upstream)
			.await
			.map_err(|e| ProxyError::UpstreamUnavailable(e.to_string()))?;
		debug!(
			service = service.name(),
			%peer,
			sent = traffic.sent,
			received = traffic.received,
			"tcp session closed"
		);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tests_common::{proxy_inputs, tcp_service};
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	async fn spawn_echo_upstream() -> SocketAddr {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			while let Ok((mut stream, _)) = listener.accept().await {
				tokio::spawn(async move {
					let mut buf = [0u8; 1024];
					while let Ok(n) = stream.read(&mut buf).await {
						if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
							break;
						}
					}
				});
			}
		});
		addr
	}

	#[tokio::test]
	async fn pipes_bytes_both_ways() {
		let upstream = spawn_echo_upstream().await;
		let mut svc = tcp_service("echo", 0);
		svc.load_balance.ip_list = upstream.to_string();
		let inputs = proxy_inputs(vec![svc], vec![]);
		let service = inputs.snapshot.service_by_name("echo").unwrap();
		let proxy = TcpProxy::new(inputs.clone(), service);

		// Run the proxy over a local socket pair.
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (stream, peer) = listener.accept().await.unwrap();
			proxy.proxy(stream, peer).await;
		});

		let mut client = TcpStream::connect(addr).await.unwrap();
		client.write_all(b"hello").await.unwrap();
		let mut buf = [0u8; 5];
		client.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"hello");

		assert_eq!(inputs.counters.get_counter("flow_total").total(), 1);
		assert_eq!(inputs.counters.get_counter("flow_service_echo").total(), 1);
	}

	#[tokio::test]
	async fn policy_abort_writes_a_plaintext_line() {
		let mut svc = tcp_service("locked", 0);
		svc.load_balance.ip_list = "127.0.0.1:1".to_string();
		svc.access_control.open_auth = true;
		svc.access_control.black_list = "127.0.0.1".to_string();
		let inputs = proxy_inputs(vec![svc], vec![]);
		let service = inputs.snapshot.service_by_name("locked").unwrap();
		let proxy = TcpProxy::new(inputs, service);

		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			let (stream, peer) = listener.accept().await.unwrap();
			proxy.proxy(stream, peer).await;
		});

		let mut client = TcpStream::connect(addr).await.unwrap();
		let mut line = String::new();
		client.read_to_string(&mut line).await.unwrap();
		assert!(line.contains("black ip list"), "got {line:?}");
	}
}
