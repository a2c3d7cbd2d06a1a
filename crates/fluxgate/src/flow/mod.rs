//! Traffic accounting and throttling, keyed across three namespaces:
//! the whole gateway (`flow_total`), one service (`flow_service_<name>`),
//! and one tenant (`flow_app_<app_id>`).

mod counter;
mod limiter;

use chrono::{DateTime, Local};
use fluxgate_core::prelude::*;

pub use counter::{FlowCounter, FlowRegistry};
pub use limiter::{LimiterRegistry, RateLimiter};

pub const FLOW_TOTAL: &str = "flow_total";
pub const FLOW_SERVICE_PREFIX: &str = "flow_service_";
pub const FLOW_APP_PREFIX: &str = "flow_app_";

const FLOW_DAY_KEY: &str = "flow_day_count";
const FLOW_HOUR_KEY: &str = "flow_hour_count";

pub fn service_key(service_name: &str) -> String {
	format!("{FLOW_SERVICE_PREFIX}{service_name}")
}

pub fn app_key(app_id: &str) -> String {
	format!("{FLOW_APP_PREFIX}{app_id}")
}

pub fn day_key(counter_key: &str, t: DateTime<Local>) -> String {
	format!("{FLOW_DAY_KEY}:{counter_key}:{}", t.format("%Y%m%d"))
}

pub fn hour_key(counter_key: &str, t: DateTime<Local>) -> String {
	format!("{FLOW_HOUR_KEY}:{counter_key}:{}", t.format("%Y%m%d%H"))
}

/// Shared key-value store the per-process day/hour aggregates are batched
/// into, so the dashboard can sum traffic across gateway instances. Purely
/// additive: the data plane never reads it back.
#[derive(Clone)]
pub struct SharedStore {
	conn: redis::aio::MultiplexedConnection,
}

impl SharedStore {
	pub async fn connect(dsn: &str) -> anyhow::Result<Self> {
		let client = redis::Client::open(dsn)?;
		let conn = client.get_multiplexed_tokio_connection().await?;
		info!("connected to shared flow store");
		Ok(SharedStore { conn })
	}

	pub(crate) async fn record(
		&self,
		counter_key: &str,
		delta: u64,
		t: DateTime<Local>,
	) -> redis::RedisResult<()> {
		// Aggregates are only interesting for the current window; a two-day
		// expiry keeps yesterday readable and bounds the key space.
		const EXPIRE_SECS: i64 = 2 * 86400;
		let day = day_key(counter_key, t);
		let hour = hour_key(counter_key, t);
		let mut conn = self.conn.clone();
		redis::pipe()
			.cmd("INCRBY")
			.arg(&day)
			.arg(delta)
			.ignore()
			.cmd("EXPIRE")
			.arg(&day)
			.arg(EXPIRE_SECS)
			.ignore()
			.cmd("INCRBY")
			.arg(&hour)
			.arg(delta)
			.ignore()
			.cmd("EXPIRE")
			.arg(&hour)
			.arg(EXPIRE_SECS)
			.ignore()
			.query_async(&mut conn)
			.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	#[test]
	fn keys_are_well_formed() {
		assert_eq!(service_key("billing"), "flow_service_billing");
		assert_eq!(app_key("a1"), "flow_app_a1");

		let t = Local.with_ymd_and_hms(2025, 3, 7, 14, 0, 0).unwrap();
		assert_eq!(day_key("flow_total", t), "flow_day_count:flow_total:20250307");
		assert_eq!(
			hour_key("flow_total", t),
			"flow_hour_count:flow_total:2025030714"
		);
	}
}
