//! Axum front door: the `/ws/{endpoint_id}` data-plane ingress, the `/ops`
//! telemetry subscriber channel, and a liveness-only `/healthz`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::{info, instrument};

use relaygate_types::{AuditSink, EndpointStatsSummary, SessionSummary, TelemetryEvent};

use crate::relay::{self, ConnectionMeta, RelayContext};
use crate::session_manager::SessionManager;
use crate::telemetry::TelemetryBus;

/// Everything an axum handler needs, cloned cheaply per request.
#[derive(Clone)]
pub struct AppState {
	pub relay: Arc<RelayContext>,
	pub telemetry: Arc<TelemetryBus>,
	pub session_manager: Arc<SessionManager>,
	pub audit: Arc<dyn AuditSink>,
}

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/ws/{endpoint_id}", get(ws_handler))
		.route("/ws", get(ws_missing_id_handler))
		.route("/ws/", get(ws_missing_id_handler))
		.route("/ops", get(ops_handler))
		.route("/healthz", get(health_handler))
		.with_state(state)
}

/// First `x-forwarded-for` entry if present, else the socket's peer address.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
	headers
		.get("x-forwarded-for")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.split(',').next())
		.map(|s| s.trim().to_string())
		.or_else(|| peer.map(|a| a.ip().to_string()))
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
	headers.get("user-agent").and_then(|v| v.to_str().ok()).map(str::to_string)
}

#[instrument(skip(ws, state, headers))]
async fn ws_handler(
	Path(endpoint_id): Path<String>,
	State(state): State<AppState>,
	headers: HeaderMap,
	peer: Option<ConnectInfo<SocketAddr>>,
	ws: WebSocketUpgrade,
) -> impl IntoResponse {
	let meta = ConnectionMeta { client_ip: client_ip(&headers, peer.map(|p| p.0)), user_agent: user_agent(&headers) };
	ws.on_upgrade(move |socket| async move {
		relay::run(state.relay, endpoint_id, socket, meta).await;
	})
}

/// A bare `/ws` or `/ws/` with no endpoint id segment: reject with a
/// protocol-error close rather than a 404, since the client did speak
/// WebSocket correctly, it just omitted the routing segment.
async fn ws_missing_id_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
	ws.on_upgrade(|mut socket: WebSocket| async move {
		relay::reject(&mut socket, 1002, "missing endpoint id").await;
	})
}

async fn ops_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
	ws.on_upgrade(move |socket| run_subscriber(socket, state))
}

/// Drives one `/ops` subscriber: forwards bus events out, parses inbound
/// control commands, and closes with 1001 if the bus is torn down first.
async fn run_subscriber(socket: WebSocket, state: AppState) {
	let (id, mut rx) = state.telemetry.subscribe();
	info!(subscriber = ?id, "ops subscriber connected");

	let stats = state.session_manager.statistics();
	let per_endpoint = stats
		.per_endpoint
		.iter()
		.map(|e| EndpointStatsSummary { endpoint_id: e.endpoint_id.clone(), sessions: e.sessions, total_messages: e.total_messages, total_bytes: e.total_bytes })
		.collect();
	let sessions = state
		.session_manager
		.registry()
		.all()
		.iter()
		.map(|entry| SessionSummary {
			session_id: entry.session_id.clone(),
			endpoint_id: entry.endpoint_id.clone(),
			state: *entry.state.lock(),
			started_at: entry.started_at,
			metrics: entry.metrics.snapshot(),
		})
		.collect();
	state
		.telemetry
		.send_initial_snapshot(
			id,
			TelemetryEvent::CurrentStats { active_connections: stats.active_connections, total_sessions: stats.total_sessions, per_endpoint, sessions },
		)
		.await;

	let (mut sink, mut stream) = futures_util::StreamExt::split(socket);
	let shutdown = state.telemetry.shutdown_token();

	loop {
		tokio::select! {
			_ = shutdown.cancelled() => {
				let _ = futures_util::SinkExt::send(&mut sink, Message::Close(Some(CloseFrame {
					code: 1001,
					reason: "server shutting down".into(),
				}))).await;
				break;
			}
			outbound = rx.recv() => {
				match outbound {
					Some(payload) => {
						if futures_util::SinkExt::send(&mut sink, Message::Text(payload.into())).await.is_err() {
							break;
						}
					}
					None => break,
				}
			}
			inbound = futures_util::StreamExt::next(&mut stream) => {
				match inbound {
					Some(Ok(Message::Text(raw))) => {
						state.telemetry.handle_command(&raw, &state.session_manager, &state.audit).await;
					}
					Some(Ok(Message::Close(_))) | None => break,
					Some(Ok(_)) => {}
					Some(Err(_)) => break,
				}
			}
		}
	}

	state.telemetry.unsubscribe(id);
	info!(subscriber = ?id, "ops subscriber disconnected");
}

/// Liveness only: no store calls, per the ambient-stack requirement.
async fn health_handler() -> impl IntoResponse {
	StatusCode::OK
}
