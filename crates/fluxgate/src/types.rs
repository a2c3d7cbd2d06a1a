//! The gateway's domain model: services with their per-protocol rules,
//! balancing and access-control policy, and tenant (app) identities.
//!
//! These types mirror the logical shape of the config store rows and are
//! what the snapshot file deserializes into. They are immutable for the
//! lifetime of a proxy process.

use serde::{Deserialize, Serialize};

/// Protocol family a service accepts traffic on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadType {
	Http,
	Tcp,
	Grpc,
}

impl LoadType {
	pub fn as_str(&self) -> &'static str {
		match self {
			LoadType::Http => "HTTP",
			LoadType::Tcp => "TCP",
			LoadType::Grpc => "GRPC",
		}
	}
}

/// How an HTTP request is matched to a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
	/// `rule` is a URL prefix such as `/billing`.
	PrefixUrl,
	/// `rule` is a hostname such as `api.example.com`.
	Domain,
}

/// Upstream selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoundType {
	#[default]
	RoundRobin,
	WeightedRoundRobin,
	Random,
	IpHash,
}

/// Active health-check probe variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckMethod {
	/// Dial host:port; a completed handshake marks the upstream up.
	#[default]
	TcpCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
	pub service_name: String,
	#[serde(default)]
	pub service_desc: String,
	pub load_type: LoadType,
	#[serde(default)]
	pub is_delete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRule {
	pub rule_type: RuleType,
	pub rule: String,
	#[serde(default)]
	pub need_https: bool,
	#[serde(default)]
	pub need_strip_uri: bool,
	#[serde(default)]
	pub need_websocket: bool,
	/// Comma-separated `pattern replacement` regex pairs applied to the path.
	#[serde(default)]
	pub url_rewrite: String,
	/// Comma-separated `add|edit|del name [value]` lines.
	#[serde(default)]
	pub header_transform: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpRule {
	pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcRule {
	pub port: u16,
	#[serde(default)]
	pub header_transform: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalanceConfig {
	#[serde(default)]
	pub round_type: RoundType,
	/// Comma-separated `host:port` upstream endpoints.
	pub ip_list: String,
	/// Comma-separated integer weights, same length as `ip_list`.
	#[serde(default)]
	pub weight_list: String,
	/// Comma-separated endpoints excluded from the active set.
	#[serde(default)]
	pub forbid_list: String,

	#[serde(default)]
	pub check_method: CheckMethod,
	#[serde(default = "default_check_timeout")]
	pub check_timeout_secs: u64,
	/// Zero disables active health checking.
	#[serde(default)]
	pub check_interval_secs: u64,

	#[serde(default = "default_connect_timeout")]
	pub upstream_connect_timeout_secs: u64,
	#[serde(default = "default_header_timeout")]
	pub upstream_header_timeout_secs: u64,
	#[serde(default = "default_idle_timeout")]
	pub upstream_idle_timeout_secs: u64,
	#[serde(default = "default_max_idle")]
	pub upstream_max_idle: usize,
}

fn default_check_timeout() -> u64 {
	2
}
fn default_connect_timeout() -> u64 {
	30
}
fn default_header_timeout() -> u64 {
	30
}
fn default_idle_timeout() -> u64 {
	90
}
fn default_max_idle() -> usize {
	100
}

impl LoadBalanceConfig {
	pub fn upstreams(&self) -> Vec<String> {
		split_list(&self.ip_list)
	}

	pub fn weights(&self) -> Vec<String> {
		split_list(&self.weight_list)
	}

	pub fn forbidden(&self) -> Vec<String> {
		split_list(&self.forbid_list)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccessControl {
	/// Whether tenant authentication (and with it the white/black lists) is
	/// enforced for this service.
	#[serde(default)]
	pub open_auth: bool,
	/// Comma-separated client IPs denied access (only consulted when the
	/// white list is empty).
	#[serde(default)]
	pub black_list: String,
	/// Comma-separated client IPs allowed access; non-empty list means
	/// everyone else is rejected.
	#[serde(default)]
	pub white_list: String,
	#[serde(default)]
	pub white_host_name: String,
	/// Per-client-IP QPS ceiling; zero disables.
	#[serde(default)]
	pub clientip_flow_limit: u64,
	/// Whole-service QPS ceiling; zero disables.
	#[serde(default)]
	pub service_flow_limit: u64,
}

impl AccessControl {
	pub fn white_ips(&self) -> Vec<String> {
		split_list(&self.white_list)
	}

	pub fn black_ips(&self) -> Vec<String> {
		split_list(&self.black_list)
	}
}

/// One service row joined with its per-protocol rule and policies. Exactly
/// one of the rule fields is populated, matching `info.load_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDetail {
	pub info: ServiceInfo,
	#[serde(default)]
	pub http_rule: Option<HttpRule>,
	#[serde(default)]
	pub tcp_rule: Option<TcpRule>,
	#[serde(default)]
	pub grpc_rule: Option<GrpcRule>,
	pub load_balance: LoadBalanceConfig,
	#[serde(default)]
	pub access_control: AccessControl,
}

impl ServiceDetail {
	pub fn name(&self) -> &str {
		&self.info.service_name
	}

	/// The header-transform grammar for whichever rule carries one.
	pub fn header_transform(&self) -> &str {
		match self.info.load_type {
			LoadType::Http => self
				.http_rule
				.as_ref()
				.map(|r| r.header_transform.as_str())
				.unwrap_or(""),
			LoadType::Grpc => self
				.grpc_rule
				.as_ref()
				.map(|r| r.header_transform.as_str())
				.unwrap_or(""),
			LoadType::Tcp => "",
		}
	}
}

/// An authenticated caller identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
	pub app_id: String,
	#[serde(default)]
	pub name: String,
	pub secret: String,
	/// Prefix-matched client IPs the tenant may call from (control-plane
	/// provisioning data).
	#[serde(default)]
	pub white_ips: String,
	/// Daily request cap; zero disables.
	#[serde(default)]
	pub qpd: u64,
	/// Per-second request cap; zero disables.
	#[serde(default)]
	pub qps: u64,
	#[serde(default)]
	pub is_delete: bool,
}

/// Splits a comma-separated config column, dropping empty entries.
pub fn split_list(raw: &str) -> Vec<String> {
	raw
		.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(str::to_string)
		.collect()
}
