//! Process configuration, loaded from a `./conf/<env>/` directory:
//! `base.toml` (required) plus optional `mysql.toml` (config-store DSN for
//! the control-plane collaborator) and `redis.toml` (shared store used to
//! aggregate day/hour flow counts).

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use fluxgate_core::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
	pub cluster: ClusterConfig,
	pub auth: AuthConfig,
	pub proxy: ProxyConfig,
	#[serde(default)]
	pub database: Option<DatabaseConfig>,
	#[serde(default)]
	pub shared_store: Option<SharedStoreConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
	pub cluster_ip: IpAddr,
	pub cluster_port: u16,
	#[serde(default)]
	pub cluster_ssl_port: Option<u16>,
	#[serde(default)]
	pub ssl_cert_file: Option<PathBuf>,
	#[serde(default)]
	pub ssl_key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
	/// Symmetric secret for signing tenant bearer tokens.
	pub secret: String,
	#[serde(default = "default_token_ttl")]
	pub token_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
	/// Snapshot file the data plane loads once at startup.
	pub snapshot: PathBuf,
	#[serde(default = "default_grace_period")]
	pub grace_period_secs: u64,
}

/// DSN of the relational config store. The data plane never dials it; it is
/// surfaced for store implementations living with the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
	pub dsn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedStoreConfig {
	pub dsn: String,
}

fn default_token_ttl() -> u64 {
	3600
}

fn default_grace_period() -> u64 {
	10
}

impl Config {
	pub fn token_ttl(&self) -> Duration {
		Duration::from_secs(self.auth.token_ttl_secs)
	}

	pub fn grace_period(&self) -> Duration {
		Duration::from_secs(self.proxy.grace_period_secs)
	}
}

#[derive(Debug, Deserialize)]
struct BaseFile {
	cluster: ClusterConfig,
	auth: AuthConfig,
	proxy: ProxyConfig,
}

#[derive(Debug, Deserialize)]
struct MysqlFile {
	store: DatabaseConfig,
}

#[derive(Debug, Deserialize)]
struct RedisFile {
	shared: SharedStoreConfig,
}

/// Loads the configuration directory. `base.toml` is required; the other
/// files are optional. Relative paths inside the files are resolved against
/// the directory itself.
pub fn load(dir: &Path) -> anyhow::Result<Config> {
	let base_path = dir.join("base.toml");
	let base: BaseFile = read_toml(&base_path)
		.with_context(|| format!("required config {} missing or invalid", base_path.display()))?;

	if base.cluster.cluster_ssl_port.is_some()
		&& (base.cluster.ssl_cert_file.is_none() || base.cluster.ssl_key_file.is_none())
	{
		anyhow::bail!("cluster_ssl_port is set but ssl_cert_file/ssl_key_file are not");
	}

	let database = read_optional_toml::<MysqlFile>(&dir.join("mysql.toml"))?.map(|f| f.store);
	let shared_store = read_optional_toml::<RedisFile>(&dir.join("redis.toml"))?.map(|f| f.shared);

	let mut cfg = Config {
		cluster: base.cluster,
		auth: base.auth,
		proxy: base.proxy,
		database,
		shared_store,
	};
	if cfg.proxy.snapshot.is_relative() {
		cfg.proxy.snapshot = dir.join(&cfg.proxy.snapshot);
	}
	debug!(dir = %dir.display(), "configuration loaded");
	Ok(cfg)
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
	let raw = fs_err::read_to_string(path)?;
	toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn read_optional_toml<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
	if !path.exists() {
		return Ok(None);
	}
	read_toml(path).map(Some)
}
