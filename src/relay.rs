//! Per-connection data plane: admission, upstream dial, and the bidirectional
//! relay loop with size/backpressure policy. One [`run`] invocation per
//! accepted client connection; nothing here is shared state except through
//! `RelayContext`; the session's own bookkeeping lives in the `SessionEntry`
//! the session manager hands back.

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame as TargetCloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message as TargetMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use relaygate_types::{
	Direction, EndpointConfig, EndpointId, EndpointStore, FrameKind, ProxyError, ProxyResult, SessionId, SessionState, TelemetryEvent,
};

use crate::config::ProxyConfig;
use crate::session_manager::{SessionEntry, SessionManager};
use crate::telemetry::TelemetryBus;

type TargetStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Request metadata the listener captures before handing the connection to
/// the relay.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
	pub client_ip: Option<String>,
	pub user_agent: Option<String>,
}

/// Dependencies shared by every relay invocation, constructed once by the
/// composition root.
pub struct RelayContext {
	pub config: Arc<ProxyConfig>,
	pub session_manager: Arc<SessionManager>,
	pub telemetry: Arc<TelemetryBus>,
	pub endpoint_store: Arc<dyn EndpointStore>,
}

/// A message normalized to a single contiguous buffer at the relay boundary:
/// whatever shape the transport handed us, size and framing are read off
/// this type alone, per the design notes on normalizing payload shapes.
#[derive(Debug, Clone)]
struct Frame {
	kind: FrameKind,
	bytes: Vec<u8>,
}

impl Frame {
	fn size(&self) -> u64 {
		self.bytes.len() as u64
	}
}

enum ToClient {
	Frame(Frame),
	Ping,
	Pong(Vec<u8>),
	Close(u16, String),
}

enum ToTarget {
	Frame(Frame),
	Pong(Vec<u8>),
	Close(u16, String),
}

/// `(final_state, reason, close_code)` — the outcome the relay loop settles
/// on, set exactly once by whichever task first observes a termination
/// cause.
type Outcome = (SessionState, String, u16);

/// What `relay_loop` reports back to `run`: the resolved termination outcome
/// plus a snapshot of the session's cumulative counters taken from the
/// `SessionEntry` the relay already holds, independent of whether the
/// registry entry itself has since been removed by a concurrent reaper
/// sweep, admin kill, or shutdown force-close.
struct RelayOutcome {
	state: SessionState,
	reason: String,
	close_code: u16,
	metrics: relaygate_types::SessionMetricsSnapshot,
}

/// Runs one client connection end to end: admission, upstream dial, relay
/// loop, and cleanup. Never panics past this boundary — any failure inside
/// a sub-task ends that session only.
#[instrument(skip_all, fields(endpoint_id = %endpoint_id_raw))]
pub async fn run(ctx: Arc<RelayContext>, endpoint_id_raw: String, mut client_socket: WebSocket, meta: ConnectionMeta) {
	if endpoint_id_raw.is_empty() {
		reject(&mut client_socket, 1002, "missing endpoint id").await;
		return;
	}
	let endpoint_id = EndpointId::from(endpoint_id_raw);

	let endpoint = match admit(&ctx, &endpoint_id).await {
		Ok(endpoint) => endpoint,
		Err(err) => {
			warn!(endpoint_id = %endpoint_id, reason = err.reason(), "admission rejected");
			reject(&mut client_socket, err.close_code(), err.reason()).await;
			return;
		}
	};

	let session_id = match ctx.session_manager.create_session(&endpoint_id, endpoint.limits.max_connections).await {
		Ok(id) => id,
		Err(err) => {
			warn!(endpoint_id = %endpoint_id, reason = err.reason(), "session creation rejected");
			reject(&mut client_socket, err.close_code(), err.reason()).await;
			return;
		}
	};

	let target = match dial_upstream(&endpoint).await {
		Ok(target) => target,
		Err(err) => {
			ctx.session_manager.close_session(&session_id, SessionState::Failed).await;
			ctx.telemetry.publish(&TelemetryEvent::SessionEnded {
				session_id: session_id.clone(),
				endpoint_id: endpoint_id.clone(),
				reason: err.reason().to_string(),
				duration_ms: 0,
				final_stats: Default::default(),
			});
			reject(&mut client_socket, err.close_code(), err.reason()).await;
			return;
		}
	};

	if let Err(err) = ctx.session_manager.bind_target(&session_id) {
		// The entry vanished between create and bind — an admin kill or the
		// reaper raced admission. Nothing left to flush; just tell the client.
		warn!(session_id = %session_id, error = %err, "bind_target failed after dial succeeded");
		reject(&mut client_socket, 1011, "internal error").await;
		return;
	}

	ctx.telemetry.publish(&TelemetryEvent::SessionStarted {
		session_id: session_id.clone(),
		endpoint_id: endpoint_id.clone(),
		client_ip: meta.client_ip.clone(),
	});
	info!(session_id = %session_id, endpoint_id = %endpoint_id, client_ip = ?meta.client_ip, user_agent = ?meta.user_agent, "session started");

	let started_at = ctx.session_manager.registry().get(&session_id).map(|e| e.started_at);
	let outcome = relay_loop(&ctx, &session_id, &endpoint, client_socket, target).await;

	// `close_session` may be a no-op here (the reaper or an admin/shutdown
	// force-close can have already removed the entry and flushed it to the
	// store while this relay was tearing down its sockets) — that's fine,
	// it's idempotent. The telemetry payload always uses `outcome.metrics`,
	// captured directly off the entry regardless of who removed it.
	ctx.session_manager.close_session(&session_id, outcome.state).await;
	let duration_ms = started_at.map(|s| (chrono::Utc::now() - s).num_milliseconds().max(0) as u64).unwrap_or(0);

	ctx.telemetry.publish(&TelemetryEvent::SessionEnded {
		session_id: session_id.clone(),
		endpoint_id: endpoint_id.clone(),
		reason: outcome.reason.clone(),
		duration_ms,
		final_stats: outcome.metrics,
	});
	info!(session_id = %session_id, reason = outcome.reason, close_code = outcome.close_code, duration_ms, "session ended");
}

/// Steps 1-4 of the admission sequence in the design notes: endpoint lookup,
/// enablement, connection cap, rate limit. `create_session` (step 5) is left
/// to the caller since it also performs the atomic, race-free admission.
async fn admit(ctx: &RelayContext, endpoint_id: &EndpointId) -> ProxyResult<EndpointConfig> {
	let endpoint = ctx.endpoint_store.get(endpoint_id).await?.ok_or_else(|| ProxyError::EndpointNotFound(endpoint_id.clone()))?;

	if !endpoint.enabled {
		return Err(ProxyError::EndpointDisabled(endpoint_id.clone()));
	}
	if !ctx.session_manager.check_connection_limit(endpoint_id, endpoint.limits.max_connections) {
		return Err(ProxyError::ConnectionLimitExceeded(endpoint_id.clone()));
	}
	if !ctx.session_manager.check_rate_limit(endpoint_id, endpoint.limits.rate_limit_rpm) {
		return Err(ProxyError::RateLimitExceeded(endpoint_id.clone()));
	}
	Ok(endpoint)
}

/// Dials the upstream target with a deadline of `connection_timeout_ms`.
/// Compression is never negotiated (this stack doesn't link a permessage-
/// deflate extension), satisfying the "compression disabled" requirement by
/// construction; `max_message_size`/`max_frame_size` are advertised from the
/// endpoint's configured limit.
async fn dial_upstream(endpoint: &EndpointConfig) -> ProxyResult<TargetStream> {
	let config = WebSocketConfig {
		max_message_size: Some(endpoint.limits.max_message_size as usize),
		max_frame_size: Some(endpoint.limits.max_message_size as usize),
		..Default::default()
	};
	let deadline = Duration::from_millis(endpoint.limits.connection_timeout_ms);
	let connect = tokio_tungstenite::connect_async_with_config(endpoint.target_url.as_str(), Some(config), false);

	match timeout(deadline, connect).await {
		Ok(Ok((stream, _response))) => Ok(stream),
		Ok(Err(err)) => Err(ProxyError::TargetConnectionError { endpoint: endpoint.id.clone(), reason: err.to_string() }),
		Err(_) => Err(ProxyError::TargetConnectionError { endpoint: endpoint.id.clone(), reason: "connect timed out".into() }),
	}
}

/// Drives the relay until some termination cause fires, then tears every
/// sub-task down and returns the outcome to report.
async fn relay_loop(ctx: &Arc<RelayContext>, session_id: &SessionId, endpoint: &EndpointConfig, client_socket: WebSocket, target: TargetStream) -> RelayOutcome {
	let Some(entry) = ctx.session_manager.registry().get(session_id) else {
		return RelayOutcome {
			state: SessionState::Failed,
			reason: "internal error".to_string(),
			close_code: 1011,
			metrics: relaygate_types::SessionMetricsSnapshot::default(),
		};
	};
	let terminate = entry.cancel.clone();
	let outcome: Arc<OnceLock<Outcome>> = Arc::new(OnceLock::new());
	let endpoint = Arc::new(endpoint.clone());

	let (client_sink, client_stream) = client_socket.split();
	let (target_sink, target_stream) = target.split();

	let (to_client_tx, to_client_rx) = mpsc::channel::<ToClient>(1024);
	let (to_target_tx, to_target_rx) = mpsc::channel::<ToTarget>(1024);

	let writer_client = tokio::spawn(run_client_writer(client_sink, to_client_rx, entry.clone()));
	let writer_target = tokio::spawn(run_target_writer(target_sink, to_target_rx, entry.clone()));

	let reader_client = tokio::spawn(run_client_reader(
		client_stream,
		to_target_tx.clone(),
		to_client_tx.clone(),
		Arc::clone(ctx),
		session_id.clone(),
		endpoint.clone(),
		entry.clone(),
		outcome.clone(),
		terminate.clone(),
	));
	let reader_target = tokio::spawn(run_target_reader(
		target_stream,
		to_client_tx.clone(),
		to_target_tx.clone(),
		Arc::clone(ctx),
		session_id.clone(),
		endpoint.clone(),
		entry.clone(),
		outcome.clone(),
		terminate.clone(),
	));

	let idle = tokio::spawn(idle_checker(entry.clone(), endpoint.limits.idle_timeout_ms as i64, outcome.clone(), terminate.clone()));
	let keepalive_task = tokio::spawn(keepalive(to_client_tx.clone(), ctx.config.keepalive_interval, terminate.clone()));

	let _ = reader_client.await;
	let _ = reader_target.await;
	terminate.cancel();
	idle.abort();
	keepalive_task.abort();

	let resolved = outcome.get().cloned().unwrap_or_else(|| resolve_external_cancel(&entry));
	let (_, reason, close_code) = &resolved;
	// Observable while the writer tasks still have a close frame in flight;
	// `close_session` will overwrite this with the final terminal state once
	// both sockets have actually finished tearing down.
	*entry.state.lock() = SessionState::Closing;
	// Best-effort: hand each writer a close frame carrying the resolved code
	// and reason before the channel closes, so the peer sees why the session
	// ended instead of a bare connection drop.
	let _ = to_client_tx.send(ToClient::Close(*close_code, reason.clone())).await;
	let _ = to_target_tx.send(ToTarget::Close(*close_code, reason.clone())).await;
	drop(to_client_tx);
	drop(to_target_tx);

	let _ = writer_client.await;
	let _ = writer_target.await;

	// Taken from the entry's own atomics rather than `close_session`'s return
	// value: the reaper or an admin/shutdown force-close may have already
	// removed the registry entry and closed it out from under this relay, in
	// which case `close_session` here would return `None` and there would be
	// nothing left to report the real cumulative counters with.
	let metrics = entry.metrics.snapshot();
	let (state, reason, close_code) = resolved;
	RelayOutcome { state, reason, close_code, metrics }
}

/// Called when `terminate` was cancelled by something other than a reader
/// (kill, reaper, or process shutdown) before either reader recorded a
/// cause of its own.
fn resolve_external_cancel(entry: &SessionEntry) -> Outcome {
	if entry.killed.load(Ordering::Relaxed) {
		(SessionState::Failed, "killed".to_string(), 1011)
	} else if entry.reaped.load(Ordering::Relaxed) {
		(SessionState::Failed, "stale session reaped".to_string(), 1011)
	} else if entry.shutting_down.load(Ordering::Relaxed) {
		(SessionState::Closed, "server shutting down".to_string(), 1001)
	} else {
		(SessionState::Failed, "internal error".to_string(), 1011)
	}
}

async fn idle_checker(entry: Arc<SessionEntry>, idle_timeout_ms: i64, outcome: Arc<OnceLock<Outcome>>, terminate: CancellationToken) {
	let check_every = Duration::from_millis((idle_timeout_ms / 4).clamp(200, 5_000) as u64);
	let mut tick = tokio::time::interval(check_every);
	loop {
		tokio::select! {
			_ = terminate.cancelled() => return,
			_ = tick.tick() => {
				if entry.idle_for_ms() > idle_timeout_ms {
					let _ = outcome.set((SessionState::Closed, "idle timeout".to_string(), 1000));
					terminate.cancel();
					return;
				}
			}
		}
	}
}

async fn keepalive(to_client_tx: mpsc::Sender<ToClient>, interval: Duration, terminate: CancellationToken) {
	let mut tick = tokio::time::interval(interval);
	tick.tick().await; // first tick fires immediately; skip it
	loop {
		tokio::select! {
			_ = terminate.cancelled() => return,
			_ = tick.tick() => {
				if to_client_tx.send(ToClient::Ping).await.is_err() {
					return;
				}
			}
		}
	}
}

#[allow(clippy::too_many_arguments)]
async fn run_client_reader(
	mut stream: SplitStream<WebSocket>,
	to_target_tx: mpsc::Sender<ToTarget>,
	to_client_tx: mpsc::Sender<ToClient>,
	ctx: Arc<RelayContext>,
	session_id: SessionId,
	endpoint: Arc<EndpointConfig>,
	entry: Arc<SessionEntry>,
	outcome: Arc<OnceLock<Outcome>>,
	terminate: CancellationToken,
) {
	loop {
		let next = tokio::select! {
			biased;
			_ = terminate.cancelled() => return,
			msg = stream.next() => msg,
		};
		let Some(msg) = next else {
			let _ = outcome.set((SessionState::Closed, "normal".to_string(), 1000));
			terminate.cancel();
			return;
		};
		let msg = match msg {
			Ok(m) => m,
			Err(err) => {
				warn!(session_id = %session_id, error = %err, "client read error");
				let _ = outcome.set((SessionState::Failed, "internal error".to_string(), 1011));
				terminate.cancel();
				return;
			}
		};

		match msg {
			ClientMessage::Text(text) => {
				let frame = Frame { kind: FrameKind::Text, bytes: text.as_bytes().to_vec() };
				if let Some(term) = forward_to_target(&ctx, &session_id, &endpoint, frame, &to_target_tx, &entry).await {
					let _ = outcome.set(term);
					terminate.cancel();
					return;
				}
			}
			ClientMessage::Binary(bytes) => {
				let frame = Frame { kind: FrameKind::Binary, bytes: bytes.to_vec() };
				if let Some(term) = forward_to_target(&ctx, &session_id, &endpoint, frame, &to_target_tx, &entry).await {
					let _ = outcome.set(term);
					terminate.cancel();
					return;
				}
			}
			ClientMessage::Ping(data) => {
				let _ = to_client_tx.try_send(ToClient::Pong(data.to_vec()));
			}
			ClientMessage::Pong(_) => entry.touch(),
			ClientMessage::Close(_) => {
				let _ = outcome.set((SessionState::Closed, "normal".to_string(), 1000));
				terminate.cancel();
				return;
			}
		}
	}
}

#[allow(clippy::too_many_arguments)]
async fn run_target_reader(
	mut stream: SplitStream<TargetStream>,
	to_client_tx: mpsc::Sender<ToClient>,
	to_target_tx: mpsc::Sender<ToTarget>,
	ctx: Arc<RelayContext>,
	session_id: SessionId,
	endpoint: Arc<EndpointConfig>,
	entry: Arc<SessionEntry>,
	outcome: Arc<OnceLock<Outcome>>,
	terminate: CancellationToken,
) {
	loop {
		let next = tokio::select! {
			biased;
			_ = terminate.cancelled() => return,
			msg = stream.next() => msg,
		};
		let Some(msg) = next else {
			let _ = outcome.set((SessionState::Closed, "normal".to_string(), 1000));
			terminate.cancel();
			return;
		};
		let msg = match msg {
			Ok(m) => m,
			Err(err) => {
				warn!(session_id = %session_id, error = %err, "target read error");
				let _ = outcome.set((SessionState::Failed, "internal error".to_string(), 1011));
				terminate.cancel();
				return;
			}
		};

		match msg {
			TargetMessage::Text(text) => {
				let frame = Frame { kind: FrameKind::Text, bytes: text.as_bytes().to_vec() };
				if let Some(term) = forward_to_client(&ctx, &session_id, &endpoint, frame, &to_client_tx, &entry).await {
					let _ = outcome.set(term);
					terminate.cancel();
					return;
				}
			}
			TargetMessage::Binary(bytes) => {
				let frame = Frame { kind: FrameKind::Binary, bytes: bytes.to_vec() };
				if let Some(term) = forward_to_client(&ctx, &session_id, &endpoint, frame, &to_client_tx, &entry).await {
					let _ = outcome.set(term);
					terminate.cancel();
					return;
				}
			}
			TargetMessage::Ping(data) => {
				let _ = to_target_tx.try_send(ToTarget::Pong(data.to_vec()));
			}
			TargetMessage::Pong(_) => entry.touch(),
			TargetMessage::Close(_) => {
				let _ = outcome.set((SessionState::Closed, "normal".to_string(), 1000));
				terminate.cancel();
				return;
			}
			TargetMessage::Frame(_) => {}
		}
	}
}

/// Size check, then the two-tier backpressure policy, then hand-off to the
/// writer queue. Returns `Some(outcome)` only for the fatal oversize case;
/// a severe-backpressure drop is silent and returns `None`.
async fn forward_to_target(
	ctx: &RelayContext,
	session_id: &SessionId,
	endpoint: &EndpointConfig,
	frame: Frame,
	tx: &mpsc::Sender<ToTarget>,
	entry: &SessionEntry,
) -> Option<Outcome> {
	let size = frame.size();
	if size > endpoint.limits.max_message_size {
		warn!(session_id = %session_id, size, limit = endpoint.limits.max_message_size, "message exceeds max_message_size");
		return Some((SessionState::Failed, "message-too-large".to_string(), 1011));
	}
	if !admit_backpressure(ctx, session_id, entry, Direction::Inbound) {
		return None;
	}

	entry.add_pending(Direction::Inbound, size as i64);
	let payload = frame.bytes.clone();
	if tx.try_send(ToTarget::Frame(frame)).is_err() {
		entry.add_pending(Direction::Inbound, -(size as i64));
		warn!(session_id = %session_id, "dropping message: target writer queue full");
		return None;
	}
	publish_message_telemetry(ctx, session_id, entry, Direction::Inbound, size, Some(&payload), &endpoint.sampling).await;
	None
}

async fn forward_to_client(
	ctx: &RelayContext,
	session_id: &SessionId,
	endpoint: &EndpointConfig,
	frame: Frame,
	tx: &mpsc::Sender<ToClient>,
	entry: &SessionEntry,
) -> Option<Outcome> {
	let size = frame.size();
	if size > endpoint.limits.max_message_size {
		warn!(session_id = %session_id, size, limit = endpoint.limits.max_message_size, "message exceeds max_message_size");
		return Some((SessionState::Failed, "message-too-large".to_string(), 1011));
	}
	if !admit_backpressure(ctx, session_id, entry, Direction::Outbound) {
		return None;
	}

	entry.add_pending(Direction::Outbound, size as i64);
	let payload = frame.bytes.clone();
	if tx.try_send(ToClient::Frame(frame)).is_err() {
		entry.add_pending(Direction::Outbound, -(size as i64));
		warn!(session_id = %session_id, "dropping message: client writer queue full");
		return None;
	}
	publish_message_telemetry(ctx, session_id, entry, Direction::Outbound, size, Some(&payload), &endpoint.sampling).await;
	None
}

/// Records the message against the session's counters, publishes
/// `messageMeta` for every forwarded message, and `sessionUpdated` whenever
/// `track_message` reports that its periodic flush just ran.
async fn publish_message_telemetry(
	ctx: &RelayContext,
	session_id: &SessionId,
	entry: &SessionEntry,
	direction: Direction,
	size: u64,
	payload: Option<&[u8]>,
	sampling: &relaygate_types::SamplingConfig,
) {
	let outcome = ctx.session_manager.track_message(session_id, direction, size, payload, sampling).await;

	ctx.telemetry.publish(&TelemetryEvent::MessageMeta {
		session_id: session_id.clone(),
		endpoint_id: entry.endpoint_id.clone(),
		direction,
		size,
		latency_ms: None,
	});

	if let Some(sample) = outcome.sample {
		ctx.telemetry.publish(&TelemetryEvent::SampledPayload {
			session_id: session_id.clone(),
			endpoint_id: entry.endpoint_id.clone(),
			direction: sample.direction,
			size: sample.size_bytes,
			content: sample.content,
			timestamp: sample.timestamp,
		});
	}

	if let Some(snapshot) = outcome.flushed {
		ctx.telemetry.publish(&TelemetryEvent::SessionUpdated {
			session_id: session_id.clone(),
			endpoint_id: entry.endpoint_id.clone(),
			msgs_in: snapshot.msgs_in,
			msgs_out: snapshot.msgs_out,
			bytes_in: snapshot.bytes_in,
			bytes_out: snapshot.bytes_out,
			latency_ms: None,
		});
	}
}

/// `true` if the message may proceed. Above `warn_bytes` it logs (rate
/// limited); above `drop_bytes` it also returns `false` so the caller drops
/// the message without forwarding or counting it.
fn admit_backpressure(ctx: &RelayContext, session_id: &SessionId, entry: &SessionEntry, direction: Direction) -> bool {
	let pending = entry.pending_bytes(direction);
	if pending as u64 > ctx.config.backpressure.drop_bytes {
		warn_backpressure(entry, session_id, pending);
		return false;
	}
	if pending as u64 > ctx.config.backpressure.warn_bytes {
		warn_backpressure(entry, session_id, pending);
	}
	true
}

const BACKPRESSURE_WARN_WINDOW_MS: i64 = 5_000;

fn warn_backpressure(entry: &SessionEntry, session_id: &SessionId, pending_bytes: i64) {
	let now = chrono::Utc::now().timestamp_millis();
	let last = entry.last_backpress_warn_ms.load(Ordering::Relaxed);
	if now - last < BACKPRESSURE_WARN_WINDOW_MS {
		return;
	}
	if entry.last_backpress_warn_ms.compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed).is_ok() {
		warn!(session_id = %session_id, pending_bytes, "backpressure building on peer socket");
	}
}

async fn run_client_writer(mut sink: SplitSink<WebSocket, ClientMessage>, mut rx: mpsc::Receiver<ToClient>, entry: Arc<SessionEntry>) {
	while let Some(item) = rx.recv().await {
		let ok = match item {
			ToClient::Frame(frame) => {
				let size = frame.size() as i64;
				let msg = match frame.kind {
					FrameKind::Text => ClientMessage::Text(String::from_utf8_lossy(&frame.bytes).into_owned().into()),
					FrameKind::Binary => ClientMessage::Binary(frame.bytes.into()),
				};
				let result = sink.send(msg).await;
				entry.add_pending(Direction::Outbound, -size);
				result.is_ok()
			}
			ToClient::Ping => sink.send(ClientMessage::Ping(Vec::new().into())).await.is_ok(),
			ToClient::Pong(data) => sink.send(ClientMessage::Pong(data.into())).await.is_ok(),
			ToClient::Close(code, reason) => {
				let _ = sink.send(ClientMessage::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
				break;
			}
		};
		if !ok {
			break;
		}
	}
	let _ = sink.close().await;
}

async fn run_target_writer(mut sink: SplitSink<TargetStream, TargetMessage>, mut rx: mpsc::Receiver<ToTarget>, entry: Arc<SessionEntry>) {
	while let Some(item) = rx.recv().await {
		let ok = match item {
			ToTarget::Frame(frame) => {
				let size = frame.size() as i64;
				let msg = match frame.kind {
					FrameKind::Text => TargetMessage::Text(String::from_utf8_lossy(&frame.bytes).into_owned().into()),
					FrameKind::Binary => TargetMessage::Binary(frame.bytes.into()),
				};
				let result = sink.send(msg).await;
				entry.add_pending(Direction::Inbound, -size);
				result.is_ok()
			}
			ToTarget::Pong(data) => sink.send(TargetMessage::Pong(data.into())).await.is_ok(),
			ToTarget::Close(code, reason) => {
				let frame = TargetCloseFrame { code: CloseCode::from(code), reason: reason.into() };
				let _ = sink.send(TargetMessage::Close(Some(frame))).await;
				break;
			}
		};
		if !ok {
			break;
		}
	}
	let _ = sink.close().await;
}

/// Sends a close frame with `code`/`reason` and drops the connection. Used
/// for every pre- and post-admission rejection path; never panics even if
/// the client has already gone away.
pub async fn reject(socket: &mut WebSocket, code: u16, reason: &str) {
	let frame = CloseFrame { code, reason: reason.to_string().into() };
	let _ = socket.send(ClientMessage::Close(Some(frame))).await;
}
