//! Composition root: wires the Session Manager, Telemetry Bus, Listener, and
//! the four external-store handles into one running process, and owns the
//! Listener → Telemetry → Relays → SessionManager → Stores shutdown order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use relaygate_types::{AuditSink, EndpointStore, SessionStore, TrafficSampleStore};

use crate::config::ProxyConfig;
use crate::listener::{self, AppState};
use crate::relay::RelayContext;
use crate::session_manager::{self, SessionManager};
use crate::telemetry::TelemetryBus;

/// Bundles the four external-store handles the composition root needs at
/// construction time; named so call sites read as a single dependency
/// parameter rather than four positional `Arc<dyn _>`s.
pub struct Stores {
	pub endpoint_store: Arc<dyn EndpointStore>,
	pub session_store: Arc<dyn SessionStore>,
	pub sample_store: Arc<dyn TrafficSampleStore>,
	pub audit_sink: Arc<dyn AuditSink>,
}

pub struct App {
	config: Arc<ProxyConfig>,
	session_manager: Arc<SessionManager>,
	telemetry: Arc<TelemetryBus>,
	relay: Arc<RelayContext>,
	audit: Arc<dyn AuditSink>,
}

impl App {
	pub fn new(config: ProxyConfig, stores: Stores) -> Self {
		let config = Arc::new(config);
		let session_manager = Arc::new(
			SessionManager::new(stores.session_store, stores.sample_store)
				.with_flush_cadence(config.metrics_flush.every_messages as usize, config.metrics_flush.every.as_millis() as i64),
		);
		let telemetry = Arc::new(TelemetryBus::new());
		let relay = Arc::new(RelayContext {
			config: config.clone(),
			session_manager: session_manager.clone(),
			telemetry: telemetry.clone(),
			endpoint_store: stores.endpoint_store,
		});

		Self { config, session_manager, telemetry, relay, audit: stores.audit_sink }
	}

	fn state(&self) -> AppState {
		AppState {
			relay: self.relay.clone(),
			telemetry: self.telemetry.clone(),
			session_manager: self.session_manager.clone(),
			audit: self.audit.clone(),
		}
	}

	/// Binds `self.config.bind`, spawns the reaper and rate-limit eviction
	/// background task, and starts serving. Returns a [`ServerHandle`] the
	/// caller uses to run the shutdown sequence.
	pub async fn serve(self) -> std::io::Result<ServerHandle> {
		let router = listener::router(self.state());
		let listener = TcpListener::bind(self.config.bind).await?;
		let local_addr = listener.local_addr()?;
		info!(addr = %local_addr, "relaygate listening");

		let reaper_token = session_manager::start_reaper(self.session_manager.clone(), self.config.reaper.interval, self.config.reaper.stale_threshold);

		let accept_shutdown = CancellationToken::new();
		let accept_shutdown_for_axum = accept_shutdown.clone();
		let server_task = tokio::spawn(async move {
			let make_service = router.into_make_service_with_connect_info::<SocketAddr>();
			axum::serve(listener, make_service)
				.with_graceful_shutdown(async move {
					accept_shutdown_for_axum.cancelled().await;
				})
				.await
				.ok();
		});

		Ok(ServerHandle {
			local_addr,
			accept_shutdown,
			server_task,
			reaper_token,
			telemetry: self.telemetry,
			session_manager: self.session_manager,
			shutdown_grace: self.config.shutdown_grace,
		})
	}
}

/// Keeps the process's background tasks alive and runs the prescribed
/// shutdown order: stop accepting connections, close telemetry subscribers,
/// grant relays a grace window to drain, then force-close whatever survives.
pub struct ServerHandle {
	pub local_addr: SocketAddr,
	accept_shutdown: CancellationToken,
	server_task: tokio::task::JoinHandle<()>,
	reaper_token: CancellationToken,
	telemetry: Arc<TelemetryBus>,
	session_manager: Arc<SessionManager>,
	shutdown_grace: Duration,
}

impl ServerHandle {
	/// Runs Listener → Telemetry → Relays → SessionManager → Stores in
	/// order. The session-store/sample-store/audit-sink tier has nothing
	/// left to do once every in-memory session has been closed, so that
	/// step is implicit in `close_session`'s write-behind calls above.
	pub async fn shutdown(self) {
		info!("shutdown sequence starting");

		self.accept_shutdown.cancel();
		let _ = self.server_task.await;
		info!("listener stopped accepting connections");

		self.telemetry.close_all();
		info!("telemetry subscribers closed");

		self.reaper_token.cancel();

		let deadline = tokio::time::Instant::now() + self.shutdown_grace;
		while tokio::time::Instant::now() < deadline {
			if self.session_manager.registry().total_count() == 0 {
				break;
			}
			tokio::time::sleep(Duration::from_millis(100)).await;
		}

		let survivors = self.session_manager.registry().all();
		if !survivors.is_empty() {
			info!(count = survivors.len(), "force-closing sessions that outlived the shutdown grace window");
			for entry in survivors {
				entry.shutting_down.store(true, std::sync::atomic::Ordering::Relaxed);
				entry.cancel.cancel();
				self.session_manager.close_session(&entry.session_id, relaygate_types::SessionState::Closed).await;
			}
		}

		info!("shutdown sequence complete");
	}
}
