//! Policy steps shared by the HTTP, TCP, and gRPC pipelines. Each function
//! is one middleware: it either passes or aborts the request with a
//! [`ProxyError`], and the pipelines invoke them in their declared order.

use std::net::IpAddr;

use fluxgate_core::prelude::*;

use crate::auth::bearer_token;
use crate::flow::{self, FLOW_TOTAL};
use crate::proxy::{ProxyError, ProxyInputs};
use crate::types::{App, ServiceDetail};

/// Counts the request against the gateway-wide and per-service counters.
pub(crate) fn count_request(pi: &ProxyInputs, service: &ServiceDetail) {
	pi.counters.get_counter(FLOW_TOTAL).incr();
	pi.counters
		.get_counter(&flow::service_key(service.name()))
		.incr();
}

/// Service-wide and per-client-IP QPS ceilings.
pub(crate) fn check_flow_limits(
	pi: &ProxyInputs,
	service: &ServiceDetail,
	client_ip: IpAddr,
) -> Result<(), ProxyError> {
	let ac = &service.access_control;
	if ac.service_flow_limit > 0 {
		let limiter = pi
			.limiters
			.get_limiter(&flow::service_key(service.name()), ac.service_flow_limit);
		if !limiter.allow() {
			return Err(ProxyError::ServiceRateLimited(ac.service_flow_limit));
		}
	}
	if ac.clientip_flow_limit > 0 {
		let key = format!("{}_{client_ip}", flow::service_key(service.name()));
		let limiter = pi.limiters.get_limiter(&key, ac.clientip_flow_limit);
		if !limiter.allow() {
			return Err(ProxyError::ClientRateLimited(client_ip, ac.clientip_flow_limit));
		}
	}
	Ok(())
}

/// Verifies the bearer token (when present) and resolves the tenant. A
/// service with `open_auth` set refuses requests that did not resolve one.
pub(crate) fn resolve_app(
	pi: &ProxyInputs,
	service: &ServiceDetail,
	authorization: Option<&str>,
) -> Result<Option<Arc<App>>, ProxyError> {
	let token = authorization.and_then(bearer_token).filter(|t| !t.is_empty());
	let mut unknown_issuer = None;
	let app = match token {
		Some(token) => {
			let claims = pi.signer.verify(token)?;
			let app = pi.snapshot.app_by_id(&claims.iss);
			if app.is_none() {
				debug!(issuer = claims.iss, "token issuer is not a registered app");
				unknown_issuer = Some(claims.iss);
			}
			app
		},
		None => None,
	};
	if service.access_control.open_auth && app.is_none() {
		return Err(match unknown_issuer {
			Some(iss) => ProxyError::AppNotFound(iss),
			None => ProxyError::AppRequired,
		});
	}
	Ok(app)
}

/// Counts tenant traffic and enforces the daily cap.
pub(crate) fn enforce_app_quota(pi: &ProxyInputs, app: &App) -> Result<(), ProxyError> {
	let counter = pi.counters.get_counter(&flow::app_key(&app.app_id));
	counter.incr();
	let current = counter.total();
	if app.qpd > 0 && current > app.qpd {
		return Err(ProxyError::DailyQuotaExceeded {
			limit: app.qpd,
			current,
		});
	}
	Ok(())
}

/// Per-(tenant, client IP) QPS ceiling.
pub(crate) fn check_app_rate(
	pi: &ProxyInputs,
	app: &App,
	client_ip: IpAddr,
) -> Result<(), ProxyError> {
	if app.qps == 0 {
		return Ok(());
	}
	let key = format!("{}_{client_ip}", flow::app_key(&app.app_id));
	let limiter = pi.limiters.get_limiter(&key, app.qps);
	if !limiter.allow() {
		return Err(ProxyError::AppRateLimited(app.app_id.clone(), app.qps));
	}
	Ok(())
}

/// A non-empty white list (on an auth-enabled service) admits only the
/// listed client IPs.
pub(crate) fn check_white_list(
	service: &ServiceDetail,
	client_ip: IpAddr,
) -> Result<(), ProxyError> {
	let ac = &service.access_control;
	if !ac.open_auth {
		return Ok(());
	}
	let white = ac.white_ips();
	if !white.is_empty() && !white.iter().any(|entry| entry == &client_ip.to_string()) {
		return Err(ProxyError::NotInWhiteList(client_ip));
	}
	Ok(())
}

/// The black list only applies when the white list is empty.
pub(crate) fn check_black_list(
	service: &ServiceDetail,
	client_ip: IpAddr,
) -> Result<(), ProxyError> {
	let ac = &service.access_control;
	if !ac.open_auth || !ac.white_ips().is_empty() {
		return Ok(());
	}
	if ac.black_ips().iter().any(|entry| entry == &client_ip.to_string()) {
		return Err(ProxyError::InBlackList(client_ip));
	}
	Ok(())
}
