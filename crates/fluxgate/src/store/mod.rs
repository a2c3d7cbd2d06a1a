//! The config-store boundary and the in-memory snapshot built from it.
//!
//! The relational store itself belongs to the control plane; the data plane
//! only ever sees a [`StoreDump`] produced by a [`ConfigStore`]
//! implementation. The shipped implementation is [`FileStore`], which reads
//! a YAML snapshot. [`ConfigCache`] performs the load exactly once per
//! process and memoizes the outcome, success or failure.

use std::collections::HashMap;
use std::path::PathBuf;

use fluxgate_core::prelude::*;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::http::strip_port;
use crate::types::{App, LoadType, RuleType, ServiceDetail};

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;

/// Everything the data plane needs from the config store, in row form.
/// Soft-deleted rows may be present; the snapshot builder drops them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDump {
	#[serde(default)]
	pub services: Vec<ServiceDetail>,
	#[serde(default)]
	pub apps: Vec<App>,
}

/// Boundary to the config store. Implementations live wherever the store
/// does; the gateway only requires a one-shot dump.
pub trait ConfigStore: Send + Sync {
	fn load(&self) -> Result<StoreDump, SnapshotError>;
}

/// Reads a [`StoreDump`] from a YAML file.
pub struct FileStore {
	path: PathBuf,
}

impl FileStore {
	pub fn new(path: PathBuf) -> Self {
		FileStore { path }
	}
}

impl ConfigStore for FileStore {
	fn load(&self) -> Result<StoreDump, SnapshotError> {
		let raw = fs_err::read_to_string(&self.path)
			.map_err(|e| SnapshotError::Store(format!("{}: {e}", self.path.display())))?;
		serde_yaml::from_str(&raw)
			.map_err(|e| SnapshotError::Store(format!("{}: {e}", self.path.display())))
	}
}

/// Cloneable so the memoized outcome can be handed out on every
/// `load_once` call.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SnapshotError {
	#[error("config store error: {0}")]
	Store(String),
	#[error("invalid configuration: {0}")]
	Invalid(String),
}

/// Load-once wrapper around a [`ConfigStore`].
pub struct ConfigCache {
	store: Box<dyn ConfigStore>,
	loaded: OnceCell<Result<Arc<Snapshot>, SnapshotError>>,
}

impl ConfigCache {
	pub fn new(store: impl ConfigStore + 'static) -> Self {
		ConfigCache {
			store: Box::new(store),
			loaded: OnceCell::new(),
		}
	}

	/// Loads and validates the snapshot on first call; every later call
	/// returns the same outcome without touching the store again.
	pub fn load_once(&self) -> Result<Arc<Snapshot>, SnapshotError> {
		self
			.loaded
			.get_or_init(|| Snapshot::build(self.store.load()?))
			.clone()
	}
}

/// The immutable view of the config store used by the data plane for the
/// lifetime of the process.
#[derive(Debug)]
pub struct Snapshot {
	services: Vec<Arc<ServiceDetail>>,
	by_name: HashMap<String, Arc<ServiceDetail>>,
	apps: Vec<Arc<App>>,
	by_app_id: HashMap<String, Arc<App>>,
}

impl Snapshot {
	pub fn build(dump: StoreDump) -> Result<Arc<Snapshot>, SnapshotError> {
		let mut services = Vec::new();
		let mut by_name = HashMap::new();
		let mut ports: HashMap<u16, String> = HashMap::new();

		for detail in dump.services {
			if detail.info.is_delete {
				continue;
			}
			validate_service(&detail)?;
			if let Some(port) = listen_port(&detail) {
				if let Some(other) = ports.insert(port, detail.name().to_string()) {
					return Err(SnapshotError::Invalid(format!(
						"port {port} is claimed by both {other} and {}",
						detail.name()
					)));
				}
			}
			let detail = Arc::new(detail);
			by_name.insert(detail.name().to_string(), detail.clone());
			services.push(detail);
		}

		let mut apps = Vec::new();
		let mut by_app_id = HashMap::new();
		for app in dump.apps {
			if app.is_delete {
				continue;
			}
			let app = Arc::new(app);
			by_app_id.insert(app.app_id.clone(), app.clone());
			apps.push(app);
		}

		info!(
			services = services.len(),
			apps = apps.len(),
			"configuration snapshot loaded"
		);
		Ok(Arc::new(Snapshot {
			services,
			by_name,
			apps,
			by_app_id,
		}))
	}

	/// All live services, in load order.
	pub fn services(&self) -> &[Arc<ServiceDetail>] {
		&self.services
	}

	pub fn service_by_name(&self, name: &str) -> Option<Arc<ServiceDetail>> {
		self.by_name.get(name).cloned()
	}

	pub fn apps(&self) -> &[Arc<App>] {
		&self.apps
	}

	pub fn app_by_id(&self, app_id: &str) -> Option<Arc<App>> {
		self.by_app_id.get(app_id).cloned()
	}

	pub fn tcp_services(&self) -> impl Iterator<Item = &Arc<ServiceDetail>> {
		self
			.services
			.iter()
			.filter(|s| s.info.load_type == LoadType::Tcp)
	}

	pub fn grpc_services(&self) -> impl Iterator<Item = &Arc<ServiceDetail>> {
		self
			.services
			.iter()
			.filter(|s| s.info.load_type == LoadType::Grpc)
	}

	/// Matches an HTTP request to a service: first service (in load order)
	/// whose DOMAIN rule equals the host (port stripped) or whose
	/// PREFIX_URL rule prefixes the path.
	pub fn match_http(&self, host: &str, path: &str) -> Option<Arc<ServiceDetail>> {
		let host = strip_port(host);
		for service in &self.services {
			if service.info.load_type != LoadType::Http {
				continue;
			}
			let Some(rule) = service.http_rule.as_ref() else {
				continue;
			};
			let matched = match rule.rule_type {
				RuleType::Domain => rule.rule == host,
				RuleType::PrefixUrl => path.starts_with(&rule.rule),
			};
			if matched {
				return Some(service.clone());
			}
		}
		None
	}
}

fn validate_service(detail: &ServiceDetail) -> Result<(), SnapshotError> {
	let name = detail.name();
	let missing_rule = |kind: &str| {
		SnapshotError::Invalid(format!(
			"service {name} has load_type {kind} but no matching rule"
		))
	};
	match detail.info.load_type {
		LoadType::Http if detail.http_rule.is_none() => return Err(missing_rule("HTTP")),
		LoadType::Tcp if detail.tcp_rule.is_none() => return Err(missing_rule("TCP")),
		LoadType::Grpc if detail.grpc_rule.is_none() => return Err(missing_rule("GRPC")),
		_ => {},
	}

	let ips = detail.load_balance.upstreams();
	if ips.is_empty() {
		return Err(SnapshotError::Invalid(format!(
			"service {name} has an empty ip_list"
		)));
	}
	let weights = detail.load_balance.weights();
	if weights.len() != ips.len() {
		return Err(SnapshotError::Invalid(format!(
			"service {name}: ip_list has {} entries but weight_list has {}",
			ips.len(),
			weights.len()
		)));
	}
	for weight in &weights {
		if weight.parse::<u32>().is_err() {
			return Err(SnapshotError::Invalid(format!(
				"service {name}: weight {weight:?} is not a non-negative integer"
			)));
		}
	}
	Ok(())
}

fn listen_port(detail: &ServiceDetail) -> Option<u16> {
	match detail.info.load_type {
		LoadType::Tcp => detail.tcp_rule.as_ref().map(|r| r.port),
		LoadType::Grpc => detail.grpc_rule.as_ref().map(|r| r.port),
		LoadType::Http => None,
	}
}
