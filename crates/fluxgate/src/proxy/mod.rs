mod gateway;
pub mod grpcproxy;
pub mod httpproxy;
mod policy;
pub mod tcpproxy;

use std::net::IpAddr;

use fluxgate_core::prelude::*;
pub use gateway::Gateway;

use crate::auth::TokenSigner;
use crate::flow::{FlowRegistry, LimiterRegistry};
use crate::http::{Body, Response, StatusCode};
use crate::lb::{BalancerRegistry, LbError};
use crate::store::Snapshot;
use crate::transport::TransportPool;
use crate::{Config, auth};

/// Everything a pipeline needs, wired once at startup. Registries are
/// explicit handles rather than process globals so each test can build its
/// own set.
pub struct ProxyInputs {
	pub cfg: Arc<Config>,
	pub snapshot: Arc<Snapshot>,
	pub balancers: BalancerRegistry,
	pub transports: TransportPool,
	pub counters: FlowRegistry,
	pub limiters: LimiterRegistry,
	pub signer: TokenSigner,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
	#[error("no matched service")]
	ServiceNotFound,
	#[error("invalid app_id or secret")]
	BadCredentials,
	#[error("token rejected: {0}")]
	TokenRejected(#[from] auth::TokenError),
	#[error("app {0} is not registered")]
	AppNotFound(String),
	#[error("a valid app token is required")]
	AppRequired,
	#[error("{0} not in white ip list")]
	NotInWhiteList(IpAddr),
	#[error("{0} in black ip list")]
	InBlackList(IpAddr),
	#[error("service flow limit exceeded ({0} qps)")]
	ServiceRateLimited(u64),
	#[error("client {0} flow limit exceeded ({1} qps)")]
	ClientRateLimited(IpAddr, u64),
	#[error("app daily quota exceeded (limit {limit}, current {current})")]
	DailyQuotaExceeded { limit: u64, current: u64 },
	#[error("app {0} flow limit exceeded ({1} qps)")]
	AppRateLimited(String, u64),
	#[error("no active upstream")]
	NoActiveUpstream(#[from] LbError),
	#[error("upstream unavailable: {0}")]
	UpstreamUnavailable(String),
	#[error("upstream timed out")]
	UpstreamTimeout,
	#[error("internal error: {0}")]
	Internal(String),
}

impl ProxyError {
	/// Stable numeric code surfaced to clients alongside the message.
	pub fn errno(&self) -> u32 {
		match self {
			ProxyError::ServiceNotFound => 1001,
			ProxyError::AppNotFound(_) => 1002,
			ProxyError::BadCredentials => 2001,
			ProxyError::TokenRejected(_) => 2002,
			ProxyError::AppRequired => 2003,
			ProxyError::NotInWhiteList(_) => 3001,
			ProxyError::InBlackList(_) => 3002,
			ProxyError::ServiceRateLimited(_) => 4001,
			ProxyError::ClientRateLimited(_, _) => 4002,
			ProxyError::DailyQuotaExceeded { .. } => 5001,
			ProxyError::AppRateLimited(_, _) => 5002,
			ProxyError::NoActiveUpstream(_) => 6001,
			ProxyError::UpstreamUnavailable(_) => 6002,
			ProxyError::UpstreamTimeout => 6003,
			ProxyError::Internal(_) => 9000,
		}
	}

	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::ServiceNotFound | ProxyError::AppNotFound(_) => StatusCode::INTERNAL_SERVER_ERROR,

			ProxyError::BadCredentials | ProxyError::TokenRejected(_) | ProxyError::AppRequired => {
				StatusCode::UNAUTHORIZED
			},

			ProxyError::NotInWhiteList(_) | ProxyError::InBlackList(_) => StatusCode::FORBIDDEN,

			ProxyError::ServiceRateLimited(_)
			| ProxyError::ClientRateLimited(_, _)
			| ProxyError::DailyQuotaExceeded { .. }
			| ProxyError::AppRateLimited(_, _) => StatusCode::TOO_MANY_REQUESTS,

			ProxyError::NoActiveUpstream(_) | ProxyError::UpstreamUnavailable(_) => {
				StatusCode::BAD_GATEWAY
			},
			ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,

			ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	pub fn grpc_code(&self) -> tonic::Code {
		match self {
			ProxyError::BadCredentials | ProxyError::TokenRejected(_) | ProxyError::AppRequired => {
				tonic::Code::Unauthenticated
			},
			ProxyError::NotInWhiteList(_) | ProxyError::InBlackList(_) => tonic::Code::PermissionDenied,
			ProxyError::ServiceRateLimited(_)
			| ProxyError::ClientRateLimited(_, _)
			| ProxyError::DailyQuotaExceeded { .. }
			| ProxyError::AppRateLimited(_, _) => tonic::Code::ResourceExhausted,
			ProxyError::NoActiveUpstream(_)
			| ProxyError::UpstreamUnavailable(_)
			| ProxyError::UpstreamTimeout => tonic::Code::Unavailable,
			ProxyError::ServiceNotFound | ProxyError::AppNotFound(_) | ProxyError::Internal(_) => {
				tonic::Code::Internal
			},
		}
	}

	/// JSON error body in the shape clients key off: `{errno, errmsg}`.
	pub fn into_response(self) -> Response {
		let body = serde_json::json!({
			"errno": self.errno(),
			"errmsg": self.to_string(),
		});
		::http::Response::builder()
			.status(self.status())
			.header(::http::header::CONTENT_TYPE, "application/json")
			.body(Body::from(body.to_string()))
			.expect("static response builder")
	}
}
