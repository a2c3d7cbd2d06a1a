use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fluxgate", about = "Multi-protocol API gateway", long_about = None)]
struct Args {
	/// Which half of the system to start: `server` (data plane) or
	/// `dashboard` (control plane).
	#[arg(long, value_name = "endpoint")]
	endpoint: Option<String>,

	/// Configuration directory, e.g. ./conf/dev/
	#[arg(long, value_name = "dir", default_value = "./conf/dev/")]
	config: PathBuf,
}

fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	let args = Args::parse();
	let Some(endpoint) = args.endpoint else {
		eprintln!("--endpoint is required: pass `server` or `dashboard`");
		std::process::exit(1);
	};

	let result = match endpoint.as_str() {
		"server" => run_server(args.config),
		"dashboard" => Err(anyhow::anyhow!(
			"the dashboard (control plane) is served by the companion admin binary; \
			 this binary only runs the data plane"
		)),
		other => Err(anyhow::anyhow!(
			"unknown endpoint {other:?}: pass `server` or `dashboard`"
		)),
	};
	if let Err(e) = result {
		eprintln!("fluxgate: {e:#}");
		std::process::exit(1);
	}
}

fn run_server(config_dir: PathBuf) -> anyhow::Result<()> {
	let cfg = fluxgate::config::load(&config_dir)?;
	info!(config = %config_dir.display(), "starting data plane");
	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(fluxgate::app::run(Arc::new(cfg)))
}
