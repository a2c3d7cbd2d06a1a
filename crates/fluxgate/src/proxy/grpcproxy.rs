//! The gRPC pipeline: a transparent stream proxy.
//!
//! gRPC rides HTTP/2, so the listener serves h2 and the proxy forwards the
//! request — headers, DATA frames, and trailers — untouched to the picked
//! upstream over an http2-only client. The interceptor chain
//! {FlowCount, FlowLimit, JwtAuthToken, JwtFlowCount, JwtFlowLimit,
//! WhiteList, BlackList, HeaderTransform} runs against the call metadata
//! and peer address before any bytes move. Aborts surface as
//! `grpc-status`/`grpc-message` in a trailers-only response.

use std::net::SocketAddr;

use fluxgate_core::prelude::*;
use futures_util::FutureExt;
use hyper::body::Incoming;
use tonic::Status;

use crate::http::{Body, HeaderValue, Request, Response, StatusCode, Uri, header, filters};
use crate::proxy::{ProxyError, ProxyInputs, policy};
use crate::types::ServiceDetail;

#[derive(Clone)]
pub struct GrpcProxy {
	inputs: Arc<ProxyInputs>,
	service: Arc<ServiceDetail>,
}

impl GrpcProxy {
	pub fn new(inputs: Arc<ProxyInputs>, service: Arc<ServiceDetail>) -> Self {
		GrpcProxy { inputs, service }
	}

	pub async fn proxy(&self, peer: SocketAddr, req: ::http::Request<Incoming>) -> Response {
		let req = req.map(Body::new);
		let outcome = std::panic::AssertUnwindSafe(self.proxy_internal(peer, req))
			.catch_unwind()
			.await;
		match outcome {
			Ok(Ok(resp)) => resp,
			Ok(Err(status)) => {
				debug!(service = self.service.name(), %peer, "stream aborted: {status}");
				status_response(&status)
			},
			Err(_) => {
				error!(service = self.service.name(), %peer, "stream handler panicked");
				status_response(&Status::internal("stream handler panicked"))
			},
		}
	}

	async fn proxy_internal(&self, peer: SocketAddr, mut req: Request) -> Result<Response, Status> {
		let pi = &self.inputs;
		let service = &self.service;
		let client_ip = peer.ip();

		policy::count_request(pi, service);
		policy::check_flow_limits(pi, service, client_ip).map_err(to_status)?;

		let authorization = req
			.headers()
			.get(header::AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string);
		let app = policy::resolve_app(pi, service, authorization.as_deref()).map_err(to_status)?;
		if let Some(app) = &app {
			policy::enforce_app_quota(pi, app).map_err(to_status)?;
			policy::check_app_rate(pi, app, client_ip).map_err(to_status)?;
		}

		policy::check_white_list(service, client_ip).map_err(to_status)?;
		policy::check_black_list(service, client_ip).map_err(to_status)?;

		let ops = filters::parse_header_ops(service.header_transform());
		filters::apply_header_ops(req.headers_mut(), &ops);

		self.forward(client_ip, req).await
	}

	async fn forward(&self, client_ip: std::net::IpAddr, mut req: Request) -> Result<Response, Status> {
		let pi = &self.inputs;
		let target = pi
			.balancers
			.get(&self.service)
			.pick(client_ip)
			.map_err(|e| to_status(e.into()))?;
		// TCP/GRPC targets come back bare; the h2c client needs a scheme.
		let target: Uri = format!("http://{target}")
			.parse()
			.map_err(|e| Status::internal(format!("bad upstream address {target:?}: {e}")))?;
		let mut parts = req.uri().clone().into_parts();
		parts.scheme = target.scheme().cloned();
		parts.authority = target.authority().cloned();
		if parts.path_and_query.is_none() {
			parts.path_and_query = Some(::http::uri::PathAndQuery::from_static("/"));
		}
		*req.uri_mut() = Uri::from_parts(parts)
			.map_err(|e| Status::internal(format!("rewriting upstream uri: {e}")))?;

		let transport = pi.transports.get(&self.service);
		match transport.client.request(req).await {
			Ok(resp) => Ok(resp.map(Body::new)),
			Err(e) => Err(Status::unavailable(format!("upstream call failed: {e}"))),
		}
	}
}

fn to_status(e: ProxyError) -> Status {
	Status::new(e.grpc_code(), e.to_string())
}

/// Trailers-only gRPC error response: HTTP 200 with the status carried in
/// `grpc-status`/`grpc-message` headers.
fn status_response(status: &Status) -> Response {
	let code = HeaderValue::from_str(&(status.code() as i32).to_string())
		.unwrap_or_else(|_| HeaderValue::from_static("2"));
	let message = HeaderValue::from_str(status.message())
		.unwrap_or_else(|_| HeaderValue::from_static("invalid status message"));
	::http::Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "application/grpc")
		.header("grpc-status", code)
		.header("grpc-message", message)
		.body(Body::empty())
		.expect("static response builder")
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tests_common::{app, grpc_service, proxy_inputs};

	fn peer() -> SocketAddr {
		"10.0.0.5:40000".parse().unwrap()
	}

	fn grpc_request(path: &str) -> ::http::Request<Body> {
		::http::Request::builder()
			.method(::http::Method::POST)
			.uri(path)
			.header(header::CONTENT_TYPE, "application/grpc")
			.body(Body::empty())
			.unwrap()
	}

	#[tokio::test]
	async fn black_listed_peers_get_permission_denied() {
		let mut svc = grpc_service("g", 0);
		svc.load_balance.ip_list = "127.0.0.1:1".to_string();
		svc.access_control.open_auth = true;
		svc.access_control.black_list = "10.0.0.5".to_string();
		let inputs = proxy_inputs(vec![svc], vec![]);
		let service = inputs.snapshot.service_by_name("g").unwrap();
		let proxy = GrpcProxy::new(inputs, service);

		let status = proxy
			.proxy_internal(peer(), grpc_request("/pkg.Svc/Method"))
			.await
			.unwrap_err();
		assert_eq!(status.code(), tonic::Code::PermissionDenied);
	}

	#[tokio::test]
	async fn missing_token_is_unauthenticated_when_auth_is_open() {
		let mut svc = grpc_service("g", 0);
		svc.access_control.open_auth = true;
		let inputs = proxy_inputs(vec![svc], vec![app("A", "S")]);
		let service = inputs.snapshot.service_by_name("g").unwrap();
		let proxy = GrpcProxy::new(inputs, service);

		let status = proxy
			.proxy_internal(peer(), grpc_request("/pkg.Svc/Method"))
			.await
			.unwrap_err();
		assert_eq!(status.code(), tonic::Code::Unauthenticated);
	}

	#[tokio::test]
	async fn token_in_metadata_authenticates_the_stream() {
		let mut svc = grpc_service("g", 0);
		// Dead upstream: getting past auth to Unavailable proves the chain
		// accepted the token.
		svc.load_balance.ip_list = "127.0.0.1:1".to_string();
		svc.load_balance.upstream_connect_timeout_secs = 1;
		svc.access_control.open_auth = true;
		let inputs = proxy_inputs(vec![svc], vec![app("A", "S")]);
		let token = inputs.signer.issue("A").unwrap();
		let service = inputs.snapshot.service_by_name("g").unwrap();
		let proxy = GrpcProxy::new(inputs, service);

		let mut req = grpc_request("/pkg.Svc/Method");
		req.headers_mut().insert(
			header::AUTHORIZATION,
			format!("Bearer {token}").parse().unwrap(),
		);
		let status = proxy.proxy_internal(peer(), req).await.unwrap_err();
		assert_eq!(status.code(), tonic::Code::Unavailable);
	}

	#[test]
	fn status_responses_carry_grpc_trailers() {
		let resp = status_response(&Status::resource_exhausted("flow limit"));
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(resp.headers().get("grpc-status").unwrap(), "8");
		assert_eq!(resp.headers().get("grpc-message").unwrap(), "flow limit");
	}
}
