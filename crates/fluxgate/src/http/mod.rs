pub mod filters;

use std::net::{IpAddr, SocketAddr};

pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;
pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, uri};

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// The request host, preferring the URI authority (HTTP/2, absolute-form
/// HTTP/1.1) and falling back to the `Host` header. Port is retained.
pub fn get_host(req: &Request) -> Option<&str> {
	if let Some(host) = req.uri().authority().map(|a| a.as_str()) {
		return Some(host);
	}
	req
		.headers()
		.get(header::HOST)
		.and_then(|h| h.to_str().ok())
}

/// `host` truncated at the first `:`. Bracketed IPv6 literals keep their
/// brackets.
pub fn strip_port(host: &str) -> &str {
	if host.starts_with('[') {
		match host.find(']') {
			Some(i) => &host[..=i],
			None => host,
		}
	} else {
		host.split(':').next().unwrap_or(host)
	}
}

/// The effective client address: the first entry of `X-Forwarded-For` when
/// an upstream proxy supplied one, otherwise the socket peer.
pub fn client_ip(peer: SocketAddr, headers: &HeaderMap) -> IpAddr {
	headers
		.get(X_FORWARDED_FOR)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.split(',').next())
		.and_then(|v| v.trim().parse::<IpAddr>().ok())
		.unwrap_or_else(|| peer.ip())
}

/// Appends `ip` to `X-Forwarded-For` before handing the request upstream.
pub fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
	let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
		Some(existing) => format!("{existing}, {ip}"),
		None => ip.to_string(),
	};
	if let Ok(v) = HeaderValue::try_from(value) {
		headers.insert(X_FORWARDED_FOR, v);
	}
}

/// Replaces the request path, preserving the query string. An empty path is
/// normalized to `/`.
pub fn set_path(req: &mut Request, new_path: &str) -> Result<(), ::http::Error> {
	let path = if new_path.is_empty() { "/" } else { new_path };
	let pq = match req.uri().query() {
		Some(q) => format!("{path}?{q}"),
		None => path.to_string(),
	};
	let mut parts = req.uri().clone().into_parts();
	parts.path_and_query = Some(pq.parse()?);
	*req.uri_mut() = Uri::from_parts(parts).map_err(::http::Error::from)?;
	Ok(())
}
