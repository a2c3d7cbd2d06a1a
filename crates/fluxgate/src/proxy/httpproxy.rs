//! The HTTP/HTTPS pipeline: service matching, policy middleware, request
//! transformation, and the reverse proxy itself.
//!
//! Steps run in a fixed order for every request; the first failure aborts
//! the pipeline and is rendered as a JSON error. The same listener also
//! serves the `/ping` liveness probe and the `/oauth/tokens` issuance
//! endpoint, both ahead of service matching.

use std::net::SocketAddr;

use fluxgate_core::prelude::*;
use futures_util::FutureExt;
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;

use crate::auth::{TokenResponse, basic_credentials};
use crate::http::{
	Body, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, header,
	append_forwarded_for, client_ip, filters, get_host, set_path,
};
use crate::proxy::{ProxyError, ProxyInputs, policy};
use crate::types::{HttpRule, RuleType, ServiceDetail};

#[cfg(test)]
#[path = "httpproxy_test.rs"]
mod tests;

#[derive(Clone)]
pub struct HttpProxy {
	inputs: Arc<ProxyInputs>,
}

impl HttpProxy {
	pub fn new(inputs: Arc<ProxyInputs>) -> Self {
		HttpProxy { inputs }
	}

	pub async fn proxy(&self, peer: SocketAddr, req: ::http::Request<Incoming>) -> Response {
		let req = req.map(Body::new);
		// A panicking handler must not take the connection task down with it.
		let outcome = std::panic::AssertUnwindSafe(self.proxy_internal(peer, req))
			.catch_unwind()
			.await;
		match outcome {
			Ok(Ok(resp)) => resp,
			Ok(Err(e)) => {
				debug!(peer = %peer, errno = e.errno(), "request aborted: {e}");
				e.into_response()
			},
			Err(_) => {
				error!(peer = %peer, "request handler panicked");
				ProxyError::Internal("request handler panicked".to_string()).into_response()
			},
		}
	}

	pub(crate) async fn proxy_internal(
		&self,
		peer: SocketAddr,
		mut req: Request,
	) -> Result<Response, ProxyError> {
		let pi = &self.inputs;
		if req.method() == Method::GET && req.uri().path() == "/ping" {
			return Ok(plain_response("pong"));
		}
		if req.method() == Method::POST && req.uri().path() == "/oauth/tokens" {
			return self.issue_tokens(&req);
		}

		let host = get_host(&req).unwrap_or_default().to_string();
		let path = req.uri().path().to_string();
		let client_ip = client_ip(peer, req.headers());

		// AccessMode: resolve the service from host/path.
		let service = pi
			.snapshot
			.match_http(&host, &path)
			.ok_or(ProxyError::ServiceNotFound)?;
		debug!(service = service.name(), %client_ip, path, "matched service");
		let rule = service
			.http_rule
			.as_ref()
			.ok_or_else(|| ProxyError::Internal("HTTP service without HTTP rule".to_string()))?;

		policy::count_request(pi, &service);
		policy::check_flow_limits(pi, &service, client_ip)?;

		let authorization = req
			.headers()
			.get(header::AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string);
		let app = policy::resolve_app(pi, &service, authorization.as_deref())?;
		if let Some(app) = &app {
			policy::enforce_app_quota(pi, app)?;
			policy::check_app_rate(pi, app, client_ip)?;
		}

		policy::check_white_list(&service, client_ip)?;
		policy::check_black_list(&service, client_ip)?;

		apply_header_transform(&mut req, rule);
		strip_uri(&mut req, rule)?;
		rewrite_url(&mut req, rule)?;

		self.forward(&service, rule, client_ip, req).await
	}

	/// `POST /oauth/tokens`: trades `Basic base64(app_id:secret)` for a
	/// signed bearer token.
	fn issue_tokens(&self, req: &Request) -> Result<Response, ProxyError> {
		let pi = &self.inputs;
		let credentials = req
			.headers()
			.get(header::AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.and_then(basic_credentials)
			.ok_or(ProxyError::BadCredentials)?;
		let (app_id, secret) = credentials;
		let app = pi
			.snapshot
			.app_by_id(&app_id)
			.filter(|app| app.secret == secret)
			.ok_or(ProxyError::BadCredentials)?;

		let token = pi
			.signer
			.issue(&app.app_id)
			.map_err(|e| ProxyError::Internal(format!("token signing failed: {e}")))?;
		let body = TokenResponse {
			access_token: token,
			token_type: "Bearer".to_string(),
			expires_in: pi.signer.ttl().as_secs(),
			scope: "read_write".to_string(),
		};
		let body = serde_json::to_string(&body)
			.map_err(|e| ProxyError::Internal(format!("token encoding failed: {e}")))?;
		Ok(
			::http::Response::builder()
				.status(StatusCode::OK)
				.header(header::CONTENT_TYPE, "application/json")
				.body(Body::from(body))
				.expect("static response builder"),
		)
	}

	/// ReverseProxy: rewrite the request to the picked upstream and stream
	/// the response (or tunnel, for accepted upgrades) back.
	async fn forward(
		&self,
		service: &ServiceDetail,
		rule: &HttpRule,
		client_ip: std::net::IpAddr,
		mut req: Request,
	) -> Result<Response, ProxyError> {
		let pi = &self.inputs;
		let target = pi.balancers.get(service).pick(client_ip)?;
		point_at_upstream(&mut req, &target)?;
		append_forwarded_for(req.headers_mut(), client_ip);

		let req_upgrade = if rule.need_websocket {
			extract_upgrade(&mut req)
		} else {
			None
		};
		strip_hop_headers(req.headers_mut());
		if let Some(upgrade) = &req_upgrade {
			// Reinstate the handshake headers the hop-by-hop pass removed.
			req
				.headers_mut()
				.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
			req
				.headers_mut()
				.insert(header::UPGRADE, upgrade.upgrade_type.clone());
		}

		let transport = pi.transports.get(service);
		let resp = match tokio::time::timeout(transport.header_timeout, transport.client.request(req))
			.await
		{
			Ok(Ok(resp)) => resp,
			Ok(Err(e)) => return Err(ProxyError::UpstreamUnavailable(e.to_string())),
			Err(_) => return Err(ProxyError::UpstreamTimeout),
		};
		let mut resp = resp.map(Body::new);

		if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
			return tunnel_upgrade(req_upgrade, resp);
		}
		strip_hop_headers(resp.headers_mut());
		Ok(resp)
	}
}

fn plain_response(body: &'static str) -> Response {
	::http::Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "text/plain")
		.body(Body::from(body))
		.expect("static response builder")
}

/// HeaderTransform: apply the rule's `add|edit|del` lines.
fn apply_header_transform(req: &mut Request, rule: &HttpRule) {
	let ops = filters::parse_header_ops(&rule.header_transform);
	filters::apply_header_ops(req.headers_mut(), &ops);
}

/// StripUri: for prefix-matched services, drop the matched prefix before
/// forwarding.
fn strip_uri(req: &mut Request, rule: &HttpRule) -> Result<(), ProxyError> {
	if rule.rule_type != RuleType::PrefixUrl || !rule.need_strip_uri {
		return Ok(());
	}
	let stripped = filters::strip_prefix_once(req.uri().path(), &rule.rule);
	set_path(req, &stripped).map_err(|e| ProxyError::Internal(format!("strip uri: {e}")))
}

/// UrlRewrite: run the rule's regex pairs over the path.
fn rewrite_url(req: &mut Request, rule: &HttpRule) -> Result<(), ProxyError> {
	let rules = filters::parse_rewrites(&rule.url_rewrite);
	if rules.is_empty() {
		return Ok(());
	}
	let rewritten = filters::apply_rewrites(req.uri().path(), &rules);
	set_path(req, &rewritten).map_err(|e| ProxyError::Internal(format!("url rewrite: {e}")))
}

/// Redirects the request URI at the upstream, keeping path and query.
fn point_at_upstream(req: &mut Request, target: &str) -> Result<(), ProxyError> {
	let target: Uri = target
		.parse()
		.map_err(|e| ProxyError::Internal(format!("bad upstream address {target:?}: {e}")))?;
	let mut parts = req.uri().clone().into_parts();
	parts.scheme = target.scheme().cloned();
	parts.authority = target.authority().cloned();
	if parts.path_and_query.is_none() {
		parts.path_and_query = Some(::http::uri::PathAndQuery::from_static("/"));
	}
	*req.uri_mut() = Uri::from_parts(parts)
		.map_err(|e| ProxyError::Internal(format!("rewriting upstream uri: {e}")))?;
	Ok(())
}

struct RequestUpgrade {
	upgrade_type: HeaderValue,
	on_upgrade: OnUpgrade,
}

fn requested_upgrade(headers: &HeaderMap) -> Option<HeaderValue> {
	let wants_upgrade = headers
		.get(header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| {
			v.split(',')
				.any(|part| part.trim().eq_ignore_ascii_case("upgrade"))
		});
	if wants_upgrade {
		headers.get(header::UPGRADE).cloned()
	} else {
		None
	}
}

fn extract_upgrade(req: &mut Request) -> Option<RequestUpgrade> {
	let upgrade_type = requested_upgrade(req.headers())?;
	Some(RequestUpgrade {
		upgrade_type,
		on_upgrade: hyper::upgrade::on(req),
	})
}

/// The upstream accepted an upgrade: once both sides complete their
/// handshakes, splice the raw streams together.
fn tunnel_upgrade(
	req_upgrade: Option<RequestUpgrade>,
	mut resp: Response,
) -> Result<Response, ProxyError> {
	let Some(RequestUpgrade {
		upgrade_type,
		on_upgrade,
	}) = req_upgrade
	else {
		return Err(ProxyError::UpstreamUnavailable(
			"upstream switched protocols for a non-upgrade request".to_string(),
		));
	};
	let resp_type = requested_upgrade(resp.headers());
	if resp_type.as_ref() != Some(&upgrade_type) {
		return Err(ProxyError::UpstreamUnavailable(format!(
			"upgrade mismatch: requested {upgrade_type:?}, upstream offered {resp_type:?}"
		)));
	}
	let upstream_upgrade = hyper::upgrade::on(&mut resp);
	tokio::spawn(async move {
		let (downstream, upstream) = match tokio::join!(on_upgrade, upstream_upgrade) {
			(Ok(d), Ok(u)) => (d, u),
			(d, u) => {
				warn!(
					"upgrade handshake failed (downstream: {:?}, upstream: {:?})",
					d.err(),
					u.err()
				);
				return;
			},
		};
		let mut downstream = TokioIo::new(downstream);
		let mut upstream = TokioIo::new(upstream);
		if let Err(e) = fluxgate_core::copy::relay(&mut downstream, &mut upstream).await {
			debug!("upgraded tunnel closed with error: {e}");
		}
	});
	Ok(resp)
}

static HOP_HEADERS: once_cell::sync::Lazy<[HeaderName; 9]> = once_cell::sync::Lazy::new(|| {
	[
		header::CONNECTION,
		HeaderName::from_static("proxy-connection"),
		HeaderName::from_static("keep-alive"),
		header::PROXY_AUTHENTICATE,
		header::PROXY_AUTHORIZATION,
		header::TE,
		header::TRAILER,
		header::TRANSFER_ENCODING,
		header::UPGRADE,
	]
});

fn strip_hop_headers(headers: &mut HeaderMap) {
	// Headers nominated by Connection are hop-by-hop too.
	let nominated: Vec<HeaderName> = headers
		.get_all(header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.filter_map(|name| HeaderName::try_from(name.trim()).ok())
		.collect();
	for name in nominated {
		headers.remove(name);
	}
	for name in HOP_HEADERS.iter() {
		headers.remove(name);
	}
}
