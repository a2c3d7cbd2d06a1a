//! Shared fixture builders for the test suites.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::TokenSigner;
use crate::flow::{FlowRegistry, LimiterRegistry};
use crate::lb::BalancerRegistry;
use crate::proxy::ProxyInputs;
use crate::store::{Snapshot, StoreDump};
use crate::transport::TransportPool;
use crate::types::{
	AccessControl, App, GrpcRule, HttpRule, LoadBalanceConfig, LoadType, RuleType, ServiceDetail,
	ServiceInfo,
};

pub(crate) const TEST_SECRET: &str = "unit-test-signing-secret";

pub(crate) fn config() -> crate::Config {
	crate::Config {
		cluster: crate::config::ClusterConfig {
			cluster_ip: "127.0.0.1".parse().unwrap(),
			cluster_port: 0,
			cluster_ssl_port: None,
			ssl_cert_file: None,
			ssl_key_file: None,
		},
		auth: crate::config::AuthConfig {
			secret: TEST_SECRET.to_string(),
			token_ttl_secs: 3600,
		},
		proxy: crate::config::ProxyConfig {
			snapshot: "services.yaml".into(),
			grace_period_secs: 1,
		},
		database: None,
		shared_store: None,
	}
}

pub(crate) fn proxy_inputs(services: Vec<ServiceDetail>, apps: Vec<App>) -> Arc<ProxyInputs> {
	let snapshot = Snapshot::build(StoreDump { services, apps }).unwrap();
	Arc::new(ProxyInputs {
		cfg: Arc::new(config()),
		snapshot,
		balancers: BalancerRegistry::new(),
		transports: TransportPool::new().unwrap(),
		counters: FlowRegistry::new(None),
		limiters: LimiterRegistry::new(),
		signer: TokenSigner::new(TEST_SECRET, Duration::from_secs(3600)),
	})
}

pub(crate) fn lb(ip_list: &str, weight_list: &str) -> LoadBalanceConfig {
	LoadBalanceConfig {
		round_type: Default::default(),
		ip_list: ip_list.to_string(),
		weight_list: weight_list.to_string(),
		forbid_list: String::new(),
		check_method: Default::default(),
		check_timeout_secs: 2,
		check_interval_secs: 0,
		upstream_connect_timeout_secs: 30,
		upstream_header_timeout_secs: 30,
		upstream_idle_timeout_secs: 90,
		upstream_max_idle: 100,
	}
}

pub(crate) fn http_service(name: &str, rule_type: RuleType, rule: &str) -> ServiceDetail {
	ServiceDetail {
		info: ServiceInfo {
			service_name: name.to_string(),
			service_desc: String::new(),
			load_type: LoadType::Http,
			is_delete: false,
		},
		http_rule: Some(HttpRule {
			rule_type,
			rule: rule.to_string(),
			need_https: false,
			need_strip_uri: false,
			need_websocket: false,
			url_rewrite: String::new(),
			header_transform: String::new(),
		}),
		tcp_rule: None,
		grpc_rule: None,
		load_balance: lb("127.0.0.1:2003", "1"),
		access_control: AccessControl::default(),
	}
}

pub(crate) fn tcp_service(name: &str, port: u16) -> ServiceDetail {
	ServiceDetail {
		info: ServiceInfo {
			service_name: name.to_string(),
			service_desc: String::new(),
			load_type: LoadType::Tcp,
			is_delete: false,
		},
		http_rule: None,
		tcp_rule: Some(crate::types::TcpRule { port }),
		grpc_rule: None,
		load_balance: lb("127.0.0.1:2003", "1"),
		access_control: AccessControl::default(),
	}
}

pub(crate) fn grpc_service(name: &str, port: u16) -> ServiceDetail {
	ServiceDetail {
		info: ServiceInfo {
			service_name: name.to_string(),
			service_desc: String::new(),
			load_type: LoadType::Grpc,
			is_delete: false,
		},
		http_rule: None,
		tcp_rule: None,
		grpc_rule: Some(GrpcRule {
			port,
			header_transform: String::new(),
		}),
		load_balance: lb("127.0.0.1:2003", "1"),
		access_control: AccessControl::default(),
	}
}

pub(crate) fn app(app_id: &str, secret: &str) -> App {
	App {
		app_id: app_id.to_string(),
		name: String::new(),
		secret: secret.to_string(),
		white_ips: String::new(),
		qpd: 0,
		qps: 0,
		is_delete: false,
	}
}
