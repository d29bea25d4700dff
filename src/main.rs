use std::sync::Arc;

use clap::Parser;
use tracing::info;

use relaygate::app::{App, Stores};
use relaygate::cli::Args;
use relaygate::config::LogFormat;
use relaygate::stores::memory::{InMemoryAuditSink, InMemoryEndpointStore, InMemorySampleStore, InMemorySessionStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let config = args.into_config()?;
	init_tracing(config.log_format);

	info!(bind = %config.bind, "starting relaygate");

	let endpoint_store = Arc::new(InMemoryEndpointStore::new());
	for seed in args.seed_endpoints {
		let id = seed.id.clone();
		endpoint_store.insert(seed.into_endpoint_config(config.default_limits.clone()));
		info!(endpoint_id = %id, "seeded demo endpoint");
	}

	let stores = Stores {
		endpoint_store,
		session_store: Arc::new(InMemorySessionStore::new()),
		sample_store: Arc::new(InMemorySampleStore::new()),
		audit_sink: Arc::new(InMemoryAuditSink::new()),
	};

	let app = App::new(config, stores);
	let handle = app.serve().await?;
	info!(addr = %handle.local_addr, "relaygate ready");

	wait_for_shutdown_signal().await;
	info!("shutdown signal received");
	handle.shutdown().await;

	Ok(())
}

fn init_tracing(format: LogFormat) {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
	let builder = tracing_subscriber::fmt().with_env_filter(filter);
	match format {
		LogFormat::Pretty => builder.init(),
		LogFormat::Json => builder.json().init(),
	}
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
	use tokio::signal::unix::{signal, SignalKind};

	let mut sigterm = signal(SignalKind::terminate()).expect("installing a SIGTERM handler should never fail");
	tokio::select! {
		_ = tokio::signal::ctrl_c() => {}
		_ = sigterm.recv() => {}
	}
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
}
