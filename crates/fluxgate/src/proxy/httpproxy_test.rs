use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;

use super::*;
use crate::auth::TokenResponse;
use crate::proxy::policy;
use crate::tests_common::{app, http_service, proxy_inputs};
use crate::types::RuleType;

const PEER: &str = "9.9.9.9:55555";

fn peer() -> SocketAddr {
	PEER.parse().unwrap()
}

fn get(path: &str, host: &str) -> Request {
	::http::Request::builder()
		.method(Method::GET)
		.uri(path)
		.header(header::HOST, host)
		.body(Body::empty())
		.unwrap()
}

async fn body_string(resp: Response) -> String {
	let bytes = resp.into_body().collect().await.unwrap().to_bytes();
	String::from_utf8(bytes.to_vec()).unwrap()
}

/// Serves `"<METHOD> <path>"` back for every request.
async fn spawn_upstream() -> SocketAddr {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				break;
			};
			tokio::spawn(async move {
				let service =
					hyper::service::service_fn(|req: ::http::Request<hyper::body::Incoming>| async move {
						let body = format!(
							"{} {}",
							req.method(),
							req
								.uri()
								.path_and_query()
								.map(|p| p.as_str())
								.unwrap_or("/")
						);
						Ok::<_, Infallible>(::http::Response::new(http_body_util::Full::new(
							bytes::Bytes::from(body),
						)))
					});
				let _ = hyper::server::conn::http1::Builder::new()
					.serve_connection(TokioIo::new(stream), service)
					.await;
			});
		}
	});
	addr
}

#[tokio::test]
async fn ping_answers_without_matching() {
	let proxy = HttpProxy::new(proxy_inputs(vec![], vec![]));
	let resp = proxy
		.proxy_internal(peer(), get("/ping", "anything"))
		.await
		.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(body_string(resp).await, "pong");
}

#[tokio::test]
async fn unmatched_requests_fail_with_service_not_found() {
	let proxy = HttpProxy::new(proxy_inputs(
		vec![http_service("s", RuleType::PrefixUrl, "/s")],
		vec![],
	));
	let err = proxy
		.proxy_internal(peer(), get("/other", "h"))
		.await
		.unwrap_err();
	assert!(matches!(err, ProxyError::ServiceNotFound));
	assert_eq!(err.errno(), 1001);
}

#[tokio::test]
async fn prefix_match_strips_and_rewrites_before_forwarding() {
	let upstream = spawn_upstream().await;
	let mut svc = http_service("s", RuleType::PrefixUrl, "/a");
	svc.load_balance.ip_list = upstream.to_string();
	{
		let rule = svc.http_rule.as_mut().unwrap();
		rule.need_strip_uri = true;
	}
	let proxy = HttpProxy::new(proxy_inputs(vec![svc], vec![]));

	let resp = proxy.proxy_internal(peer(), get("/a/x", "any")).await.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(body_string(resp).await, "GET /x");
}

#[tokio::test]
async fn domain_match_routes_by_host() {
	let upstream = spawn_upstream().await;
	let mut svc = http_service("s", RuleType::Domain, "api.example.com");
	svc.load_balance.ip_list = upstream.to_string();
	let proxy = HttpProxy::new(proxy_inputs(vec![svc], vec![]));

	let resp = proxy
		.proxy_internal(peer(), get("/whatever", "api.example.com:8443"))
		.await
		.unwrap();
	assert_eq!(body_string(resp).await, "GET /whatever");

	let err = proxy
		.proxy_internal(peer(), get("/whatever", "other.example.com"))
		.await
		.unwrap_err();
	assert!(matches!(err, ProxyError::ServiceNotFound));
}

#[tokio::test]
async fn url_rewrite_applies_after_strip() {
	let upstream = spawn_upstream().await;
	let mut svc = http_service("s", RuleType::PrefixUrl, "/a");
	svc.load_balance.ip_list = upstream.to_string();
	{
		let rule = svc.http_rule.as_mut().unwrap();
		rule.need_strip_uri = true;
		rule.url_rewrite = "^/v1/(.*) /$1".to_string();
	}
	let proxy = HttpProxy::new(proxy_inputs(vec![svc], vec![]));

	let resp = proxy
		.proxy_internal(peer(), get("/a/v1/users", "any"))
		.await
		.unwrap();
	assert_eq!(body_string(resp).await, "GET /users");
}

#[tokio::test]
async fn header_transform_reaches_the_upstream() {
	// The upstream echoes a request header back so the transform is
	// observable end to end.
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		let (stream, _) = listener.accept().await.unwrap();
		let service =
			hyper::service::service_fn(|req: ::http::Request<hyper::body::Incoming>| async move {
				let echoed = req
					.headers()
					.get("x-gateway")
					.and_then(|v| v.to_str().ok())
					.unwrap_or("missing")
					.to_string();
				Ok::<_, Infallible>(::http::Response::new(http_body_util::Full::new(
					bytes::Bytes::from(echoed),
				)))
			});
		let _ = hyper::server::conn::http1::Builder::new()
			.serve_connection(TokioIo::new(stream), service)
			.await;
	});

	let mut svc = http_service("s", RuleType::PrefixUrl, "/a");
	svc.load_balance.ip_list = addr.to_string();
	svc.http_rule.as_mut().unwrap().header_transform = "add x-gateway fluxgate".to_string();
	let proxy = HttpProxy::new(proxy_inputs(vec![svc], vec![]));

	let resp = proxy.proxy_internal(peer(), get("/a", "any")).await.unwrap();
	assert_eq!(body_string(resp).await, "fluxgate");
}

#[tokio::test]
async fn black_list_rejects_before_the_upstream_is_dialed() {
	let mut svc = http_service("s", RuleType::PrefixUrl, "/a");
	// Unroutable upstream: a dial attempt would surface as a different error.
	svc.load_balance.ip_list = "127.0.0.1:1".to_string();
	svc.access_control.open_auth = true;
	svc.access_control.black_list = "9.9.9.9".to_string();
	let proxy = HttpProxy::new(proxy_inputs(vec![svc], vec![]));

	let err = proxy.proxy_internal(peer(), get("/a", "h")).await.unwrap_err();
	assert!(matches!(err, ProxyError::InBlackList(_)));
	assert_eq!(err.errno(), 3002);
	assert_eq!(err.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn white_list_overrides_black_list() {
	let upstream = spawn_upstream().await;
	let mut svc = http_service("s", RuleType::PrefixUrl, "/a");
	svc.load_balance.ip_list = upstream.to_string();
	svc.access_control.open_auth = false;
	// Lists are ignored entirely while open_auth is off.
	svc.access_control.black_list = "9.9.9.9".to_string();
	let proxy = HttpProxy::new(proxy_inputs(vec![svc], vec![]));
	assert!(proxy.proxy_internal(peer(), get("/a", "h")).await.is_ok());

	// With auth on and the peer white-listed, the black list is moot.
	let upstream = spawn_upstream().await;
	let mut svc = http_service("s2", RuleType::PrefixUrl, "/a");
	svc.load_balance.ip_list = upstream.to_string();
	svc.access_control.open_auth = true;
	svc.access_control.white_list = "9.9.9.9".to_string();
	svc.access_control.black_list = "9.9.9.9".to_string();
	let inputs = proxy_inputs(vec![svc], vec![app("a", "s")]);
	let token = inputs.signer.issue("a").unwrap();
	let proxy = HttpProxy::new(inputs);
	let mut req = get("/a", "h");
	req.headers_mut().insert(
		header::AUTHORIZATION,
		format!("Bearer {token}").parse().unwrap(),
	);
	assert!(proxy.proxy_internal(peer(), req).await.is_ok());
}

#[tokio::test]
async fn oauth_roundtrip_issues_and_accepts_tokens() {
	let upstream = spawn_upstream().await;
	let mut svc = http_service("s", RuleType::PrefixUrl, "/a");
	svc.load_balance.ip_list = upstream.to_string();
	svc.access_control.open_auth = true;
	let inputs = proxy_inputs(vec![svc], vec![app("A", "S")]);
	let proxy = HttpProxy::new(inputs.clone());

	// base64("A:S") == "QTpT"
	let mut req = ::http::Request::builder()
		.method(Method::POST)
		.uri("/oauth/tokens")
		.header(header::AUTHORIZATION, "Basic QTpT")
		.body(Body::empty())
		.unwrap();
	req.headers_mut().insert(header::HOST, "h".parse().unwrap());
	let resp = proxy.proxy_internal(peer(), req).await.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);
	let body: TokenResponse = serde_json::from_str(&body_string(resp).await).unwrap();
	assert_eq!(body.token_type, "Bearer");
	assert_eq!(body.expires_in, 3600);
	assert_eq!(body.scope, "read_write");
	let claims = inputs.signer.verify(&body.access_token).unwrap();
	assert_eq!(claims.iss, "A");

	// The issued token is accepted by the auth-enforcing service.
	let mut req = get("/a/x", "h");
	req.headers_mut().insert(
		header::AUTHORIZATION,
		format!("Bearer {}", body.access_token).parse().unwrap(),
	);
	let resp = proxy.proxy_internal(peer(), req).await.unwrap();
	assert_eq!(resp.status(), StatusCode::OK);

	// Without a token the same service refuses.
	let err = proxy.proxy_internal(peer(), get("/a/x", "h")).await.unwrap_err();
	assert!(matches!(err, ProxyError::AppRequired));
	assert_eq!(err.errno(), 2003);
}

#[tokio::test]
async fn oauth_rejects_bad_credentials() {
	let proxy = HttpProxy::new(proxy_inputs(vec![], vec![app("A", "S")]));

	// base64("A:wrong") == "QTp3cm9uZw=="
	let req = ::http::Request::builder()
		.method(Method::POST)
		.uri("/oauth/tokens")
		.header(header::AUTHORIZATION, "Basic QTp3cm9uZw==")
		.body(Body::empty())
		.unwrap();
	let err = proxy.proxy_internal(peer(), req).await.unwrap_err();
	assert!(matches!(err, ProxyError::BadCredentials));

	let req = ::http::Request::builder()
		.method(Method::POST)
		.uri("/oauth/tokens")
		.body(Body::empty())
		.unwrap();
	let err = proxy.proxy_internal(peer(), req).await.unwrap_err();
	assert!(matches!(err, ProxyError::BadCredentials));
}

#[tokio::test]
async fn daily_quota_is_enforced_from_the_tenant_counter() {
	let inputs = proxy_inputs(vec![], vec![]);
	let mut tenant = app("quota-app", "s");
	tenant.qpd = 2;

	assert!(policy::enforce_app_quota(&inputs, &tenant).is_ok());
	assert!(policy::enforce_app_quota(&inputs, &tenant).is_ok());
	let err = policy::enforce_app_quota(&inputs, &tenant).unwrap_err();
	assert!(matches!(
		err,
		ProxyError::DailyQuotaExceeded { limit: 2, current: 3 }
	));
}

#[tokio::test]
async fn app_rate_limit_is_keyed_by_client_ip() {
	let inputs = proxy_inputs(vec![], vec![]);
	let mut tenant = app("rated", "s");
	tenant.qps = 1;
	let ip_a = "10.0.0.1".parse().unwrap();
	let ip_b = "10.0.0.2".parse().unwrap();

	// Burst of 3 per IP.
	for _ in 0..3 {
		assert!(policy::check_app_rate(&inputs, &tenant, ip_a).is_ok());
	}
	assert!(policy::check_app_rate(&inputs, &tenant, ip_a).is_err());
	// A different client IP has its own bucket.
	assert!(policy::check_app_rate(&inputs, &tenant, ip_b).is_ok());
}

#[tokio::test]
async fn service_flow_limit_applies_to_all_clients() {
	let mut svc = http_service("limited", RuleType::PrefixUrl, "/l");
	svc.access_control.service_flow_limit = 1;
	let inputs = proxy_inputs(vec![svc], vec![]);
	let svc = inputs.snapshot.service_by_name("limited").unwrap();
	let ip = "10.0.0.1".parse().unwrap();

	for _ in 0..3 {
		assert!(policy::check_flow_limits(&inputs, &svc, ip).is_ok());
	}
	let err = policy::check_flow_limits(&inputs, &svc, ip).unwrap_err();
	assert!(matches!(err, ProxyError::ServiceRateLimited(1)));
}

#[tokio::test]
async fn unreachable_upstreams_yield_bad_gateway_class_errors() {
	let mut svc = http_service("s", RuleType::PrefixUrl, "/a");
	svc.load_balance.ip_list = "127.0.0.1:1".to_string();
	svc.load_balance.upstream_connect_timeout_secs = 1;
	let proxy = HttpProxy::new(proxy_inputs(vec![svc], vec![]));

	let err = proxy.proxy_internal(peer(), get("/a", "h")).await.unwrap_err();
	assert!(matches!(err, ProxyError::UpstreamUnavailable(_)));
	assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn flow_counters_track_total_and_service_traffic() {
	let upstream = spawn_upstream().await;
	let mut svc = http_service("counted", RuleType::PrefixUrl, "/c");
	svc.load_balance.ip_list = upstream.to_string();
	let inputs = proxy_inputs(vec![svc], vec![]);
	let proxy = HttpProxy::new(inputs.clone());

	for _ in 0..3 {
		proxy.proxy_internal(peer(), get("/c", "h")).await.unwrap();
	}
	assert_eq!(inputs.counters.get_counter("flow_total").total(), 3);
	assert_eq!(
		inputs.counters.get_counter("flow_service_counted").total(),
		3
	);
}
