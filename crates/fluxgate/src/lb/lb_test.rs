use std::collections::HashMap;
use std::net::IpAddr;

use super::*;
use crate::tests_common::{http_service, lb};
use crate::types::RuleType;

fn ip(s: &str) -> IpAddr {
	s.parse().unwrap()
}

fn balancer(round_type: RoundType, ip_list: &str, weight_list: &str) -> Balancer {
	let mut svc = http_service("svc", RuleType::PrefixUrl, "/svc");
	svc.load_balance = lb(ip_list, weight_list);
	svc.load_balance.round_type = round_type;
	Balancer::new(&svc)
}

#[test]
fn round_robin_is_even() {
	let balancer = balancer(RoundType::RoundRobin, "u1:80,u2:80,u3:80", "1,1,1");
	let mut counts: HashMap<String, usize> = HashMap::new();
	for _ in 0..10 {
		*counts.entry(balancer.pick(ip("1.1.1.1")).unwrap()).or_default() += 1;
	}
	// 10 picks over 3 upstreams: ceil = 4, floor = 3.
	assert_eq!(counts["http://u1:80"], 4);
	assert_eq!(counts["http://u2:80"], 3);
	assert_eq!(counts["http://u3:80"], 3);
}

#[test]
fn weighted_round_robin_is_smooth() {
	let balancer = balancer(RoundType::WeightedRoundRobin, "u1:80,u2:80", "3,1");

	let first_four: Vec<String> = (0..4).map(|_| balancer.pick(ip("1.1.1.1")).unwrap()).collect();
	assert_eq!(
		first_four,
		vec!["http://u1:80", "http://u1:80", "http://u2:80", "http://u1:80"]
	);

	let mut counts: HashMap<String, usize> = HashMap::new();
	for _ in 0..396 {
		*counts.entry(balancer.pick(ip("1.1.1.1")).unwrap()).or_default() += 1;
	}
	// 400 picks total including the first four: exactly 3:1.
	assert_eq!(counts["http://u1:80"] + 3, 300);
	assert_eq!(counts["http://u2:80"] + 1, 100);
}

#[test]
fn weighted_round_robin_breaks_ties_by_position() {
	let balancer = balancer(RoundType::WeightedRoundRobin, "u1:80,u2:80", "2,2");
	assert_eq!(balancer.pick(ip("1.1.1.1")).unwrap(), "http://u1:80");
}

#[test]
fn ip_hash_is_deterministic() {
	let balancer = balancer(RoundType::IpHash, "u1:80,u2:80,u3:80", "1,1,1");
	for addr in ["10.0.0.1", "10.0.0.2", "192.168.7.9", "2001:db8::1"] {
		let first = balancer.pick(ip(addr)).unwrap();
		for _ in 0..5 {
			assert_eq!(balancer.pick(ip(addr)).unwrap(), first);
		}
	}
}

#[test]
fn random_stays_in_the_active_set() {
	let balancer = balancer(RoundType::Random, "u1:80,u2:80", "1,1");
	for _ in 0..50 {
		let picked = balancer.pick(ip("1.1.1.1")).unwrap();
		assert!(picked == "http://u1:80" || picked == "http://u2:80");
	}
}

#[test]
fn forbidden_upstreams_never_serve() {
	let mut svc = http_service("svc", RuleType::PrefixUrl, "/svc");
	svc.load_balance = lb("10.0.0.1:80,10.0.0.2:80", "1,1");
	svc.load_balance.forbid_list = "10.0.0.2".to_string();
	let balancer = Balancer::new(&svc);
	for _ in 0..10 {
		assert_eq!(balancer.pick(ip("1.1.1.1")).unwrap(), "http://10.0.0.1:80");
	}
}

#[test]
fn unhealthy_upstreams_leave_and_rejoin_the_active_set() {
	let balancer = balancer(RoundType::RoundRobin, "u1:80,u2:80", "1,1");
	balancer.mark(0, false);
	for _ in 0..5 {
		assert_eq!(balancer.pick(ip("1.1.1.1")).unwrap(), "http://u2:80");
	}
	balancer.mark(0, true);
	let picks: Vec<String> = (0..4).map(|_| balancer.pick(ip("1.1.1.1")).unwrap()).collect();
	assert!(picks.contains(&"http://u1:80".to_string()));
}

#[test]
fn empty_active_set_is_an_error() {
	let balancer = balancer(RoundType::RoundRobin, "u1:80", "1");
	balancer.mark(0, false);
	assert!(matches!(
		balancer.pick(ip("1.1.1.1")),
		Err(LbError::NoActiveUpstream(_))
	));
}

#[test]
fn https_scheme_follows_the_http_rule() {
	let mut svc = http_service("svc", RuleType::Domain, "api.example.com");
	svc.http_rule.as_mut().unwrap().need_https = true;
	svc.load_balance = lb("u:443", "1");
	let balancer = Balancer::new(&svc);
	assert_eq!(balancer.pick(ip("1.1.1.1")).unwrap(), "https://u:443");
}

#[test]
fn tcp_targets_have_no_scheme() {
	let svc = crate::tests_common::tcp_service("raw", 9000);
	let balancer = Balancer::new(&svc);
	assert_eq!(balancer.pick(ip("1.1.1.1")).unwrap(), "127.0.0.1:2003");
}

#[tokio::test]
async fn tcp_probe_tracks_reachability() {
	// Bind a listener so the first probe succeeds, then drop it.
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();

	let mut svc = http_service("svc", RuleType::PrefixUrl, "/svc");
	svc.load_balance = lb(&addr.to_string(), "1");

	let registry = BalancerRegistry::new();
	let balancer = registry.get(&svc);
	assert!(Arc::ptr_eq(&balancer, &registry.get(&svc)));

	// Drive the probe by hand rather than waiting on the interval.
	let reachable = tokio::net::TcpStream::connect(&addr.to_string()).await.is_ok();
	balancer.mark(0, reachable);
	assert!(balancer.pick(ip("1.1.1.1")).is_ok());

	drop(listener);
	let reachable = tokio::net::TcpStream::connect(&addr.to_string()).await.is_ok();
	balancer.mark(0, reachable);
	assert!(balancer.pick(ip("1.1.1.1")).is_err());
}
