mod reaper;
mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;
use tracing::{instrument, warn};

use relaygate_types::{
	Direction, EndpointId, ProxyError, ProxyResult, SamplingConfig, SessionId, SessionMetricsSnapshot, SessionState, TrafficSample,
};
use relaygate_types::{SessionStore, TrafficSampleStore};

pub use reaper::start as start_reaper;
pub use registry::{SessionEntry, SessionRegistry};

use crate::rate_limit::RateLimiter;

/// Aggregate view used for the telemetry bus's `currentStats` snapshot and
/// any operator-facing statistics endpoint.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
	pub active_connections: u64,
	pub total_sessions: u64,
	pub per_endpoint: Vec<EndpointStatistics>,
}

#[derive(Debug, Clone)]
pub struct EndpointStatistics {
	pub endpoint_id: EndpointId,
	pub sessions: u64,
	pub total_messages: u64,
	pub total_bytes: u64,
}

/// What `track_message` did besides updating counters: whether its periodic
/// flush fired (carrying the just-flushed snapshot) and whether this message
/// was sampled (carrying the composed sample).
#[derive(Debug, Clone, Default)]
pub struct TrackMessageOutcome {
	pub flushed: Option<SessionMetricsSnapshot>,
	pub sample: Option<TrafficSample>,
}

/// Owns the live session registry, the rate limiter, and the bridge to the
/// `SessionStore`/`TrafficSampleStore` external contracts. One instance per
/// process, constructed by the composition root.
pub struct SessionManager {
	registry: Arc<SessionRegistry>,
	rate_limiter: RateLimiter,
	session_store: Arc<dyn SessionStore>,
	sample_store: Arc<dyn TrafficSampleStore>,
	metrics_flush_every_messages: usize,
	metrics_flush_every_ms: i64,
	/// Monotonic count of sessions ever admitted, incremented once per
	/// successful `create_session` and never decremented — distinct from
	/// `registry.total_count()`, which only reflects currently-live sessions.
	total_sessions: AtomicU64,
}

impl SessionManager {
	pub fn new(session_store: Arc<dyn SessionStore>, sample_store: Arc<dyn TrafficSampleStore>) -> Self {
		Self {
			registry: Arc::new(SessionRegistry::new()),
			rate_limiter: RateLimiter::new(),
			session_store,
			sample_store,
			metrics_flush_every_messages: 10,
			metrics_flush_every_ms: 30_000,
			total_sessions: AtomicU64::new(0),
		}
	}

	pub fn with_flush_cadence(mut self, every_messages: usize, every_ms: i64) -> Self {
		self.metrics_flush_every_messages = every_messages;
		self.metrics_flush_every_ms = every_ms;
		self
	}

	pub fn registry(&self) -> &Arc<SessionRegistry> {
		&self.registry
	}

	/// Read-only pre-check used before touching the store; the authoritative
	/// admission decision is made atomically inside `create_session`.
	pub fn check_connection_limit(&self, endpoint_id: &EndpointId, max_connections: Option<u32>) -> bool {
		match max_connections {
			None => true,
			Some(max) => (self.registry.active_count(endpoint_id) as u32) < max,
		}
	}

	pub fn check_rate_limit(&self, endpoint_id: &EndpointId, limit_rpm: Option<u32>) -> bool {
		self.rate_limiter.check(endpoint_id, limit_rpm)
	}

	/// `true` iff the peer a message in `direction` is headed towards
	/// already has more than `threshold` bytes queued in its writer.
	pub fn check_backpressure(&self, session_id: &SessionId, direction: Direction, threshold: i64) -> bool {
		match self.registry.get(session_id) {
			Some(entry) => entry.pending_bytes(direction) > threshold,
			None => false,
		}
	}

	/// Mints a session row in the store, then atomically reserves a registry
	/// slot for it. If another admission wins the race for the last slot,
	/// the freshly minted row is rolled back to `FAILED` and an error is
	/// returned rather than leaving an orphaned store row.
	#[instrument(skip(self), fields(endpoint_id = %endpoint_id))]
	pub async fn create_session(&self, endpoint_id: &EndpointId, max_connections: Option<u32>) -> ProxyResult<SessionId> {
		let session_id = self.session_store.create(endpoint_id).await?;

		match self.registry.try_insert(session_id.clone(), endpoint_id.clone(), max_connections) {
			Some(_) => {
				self.total_sessions.fetch_add(1, Ordering::Relaxed);
				Ok(session_id)
			}
			None => {
				let _ = self.session_store.close(&session_id, SessionState::Failed, SessionMetricsSnapshot::default()).await;
				Err(ProxyError::ConnectionLimitExceeded(endpoint_id.clone()))
			}
		}
	}

	pub fn bind_target(&self, session_id: &SessionId) -> ProxyResult<()> {
		let entry = self.registry.get(session_id).ok_or_else(|| ProxyError::SessionNotFound(session_id.clone()))?;
		*entry.state.lock() = SessionState::Connected;
		entry.touch();
		Ok(())
	}

	/// Records one forwarded message against the session's counters, rolls
	/// the dice for sampling, and flushes a metrics snapshot to the store
	/// once the flush cadence (N messages or T elapsed, whichever first) is
	/// reached. Returns the flushed snapshot when a flush happened (so the
	/// caller can emit a `sessionUpdated` telemetry event) and the sample
	/// taken, if any (so the caller can emit `sampledPayload`) — the bus
	/// publish itself stays the relay's job, keeping the Session Manager
	/// decoupled from the Telemetry Bus.
	pub async fn track_message(
		&self,
		session_id: &SessionId,
		direction: Direction,
		size: u64,
		payload: Option<&[u8]>,
		sampling: &SamplingConfig,
	) -> TrackMessageOutcome {
		let Some(entry) = self.registry.get(session_id) else {
			return TrackMessageOutcome::default();
		};
		entry.metrics.record(direction, size);
		entry.touch();

		let sample = if sampling.enabled { self.maybe_sample(&entry, direction, size, payload, sampling).await } else { None };

		let since_flush = entry.msgs_since_flush.fetch_add(1, Ordering::Relaxed) + 1;
		let elapsed_ms = chrono::Utc::now().timestamp_millis() - entry.last_flush_ms.load(Ordering::Relaxed);
		let flushed = if since_flush >= self.metrics_flush_every_messages || elapsed_ms >= self.metrics_flush_every_ms {
			Some(self.flush_metrics(&entry).await)
		} else {
			None
		};

		TrackMessageOutcome { flushed, sample }
	}

	/// Draws against `sample_rate` and, on a hit, composes and persists a
	/// `TrafficSample` (best-effort: a store failure is logged, never fatal).
	/// Returns the composed sample so the caller can also fan it out over the
	/// Telemetry Bus as `sampledPayload`.
	async fn maybe_sample(&self, entry: &SessionEntry, direction: Direction, size: u64, payload: Option<&[u8]>, sampling: &SamplingConfig) -> Option<TrafficSample> {
		let draw: f64 = rand::rng().random();
		if draw >= sampling.sample_rate {
			return None;
		}
		let content = if sampling.store_content {
			payload.map(|bytes| {
				let truncated = &bytes[..bytes.len().min(sampling.max_sample_size)];
				match std::str::from_utf8(truncated) {
					Ok(text) => text.to_string(),
					Err(_) => base64::Engine::encode(&base64::engine::general_purpose::STANDARD, truncated),
				}
			})
		} else {
			None
		};

		let sample = TrafficSample {
			session_id: entry.session_id.clone(),
			endpoint_id: entry.endpoint_id.clone(),
			direction,
			timestamp: chrono::Utc::now(),
			size_bytes: size,
			content,
		};
		if let Err(err) = self.sample_store.append(sample.clone()).await {
			warn!(session_id = %entry.session_id, error = %err, "failed to append traffic sample, continuing");
		}
		Some(sample)
	}

	async fn flush_metrics(&self, entry: &SessionEntry) -> SessionMetricsSnapshot {
		entry.msgs_since_flush.store(0, Ordering::Relaxed);
		entry.last_flush_ms.store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
		let snapshot = entry.metrics.snapshot();
		if let Err(err) = self.session_store.update(&entry.session_id, snapshot, None).await {
			warn!(session_id = %entry.session_id, error = %err, "failed to flush session metrics, will retry next cadence");
		}
		snapshot
	}

	/// Idempotent: a second call for an already-removed session is a no-op.
	#[instrument(skip(self), fields(session_id = %session_id))]
	pub async fn close_session(&self, session_id: &SessionId, final_state: SessionState) -> Option<SessionMetricsSnapshot> {
		let entry = self.registry.remove(session_id)?;
		*entry.state.lock() = final_state;
		let snapshot = entry.metrics.snapshot();
		if let Err(err) = self.session_store.close(session_id, final_state, snapshot).await {
			warn!(session_id = %session_id, error = %err, "failed to persist session close, in-memory state already removed");
		}
		Some(snapshot)
	}

	/// Cancels the session's token so its relay tears down both sockets.
	/// Returns `false` if the session was already gone.
	pub fn kill_session(&self, session_id: &SessionId) -> bool {
		match self.registry.get(session_id) {
			Some(entry) => {
				entry.killed.store(true, Ordering::Relaxed);
				entry.cancel.cancel();
				true
			}
			None => false,
		}
	}

	pub fn statistics(&self) -> Statistics {
		let all = self.registry.all();
		let mut by_endpoint: std::collections::HashMap<EndpointId, EndpointStatistics> = std::collections::HashMap::new();
		for entry in &all {
			let snapshot = entry.metrics.snapshot();
			let stats = by_endpoint.entry(entry.endpoint_id.clone()).or_insert_with(|| EndpointStatistics {
				endpoint_id: entry.endpoint_id.clone(),
				sessions: 0,
				total_messages: 0,
				total_bytes: 0,
			});
			stats.sessions += 1;
			stats.total_messages += snapshot.msgs_in + snapshot.msgs_out;
			stats.total_bytes += snapshot.bytes_in + snapshot.bytes_out;
		}
		Statistics {
			active_connections: all.len() as u64,
			total_sessions: self.total_sessions.load(Ordering::Relaxed),
			per_endpoint: by_endpoint.into_values().collect(),
		}
	}

	pub fn active_sessions_for(&self, endpoint_id: &EndpointId) -> Vec<Arc<SessionEntry>> {
		self.registry.active_sessions_for(endpoint_id)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use relaygate_types::{Direction, EndpointId, SamplingConfig, SessionState};

	use crate::stores::memory::{InMemorySampleStore, InMemorySessionStore};

	use super::SessionManager;

	fn manager() -> SessionManager {
		SessionManager::new(Arc::new(InMemorySessionStore::new()), Arc::new(InMemorySampleStore::new()))
	}

	#[tokio::test]
	async fn create_session_registers_connecting_entry() {
		let manager = manager();
		let endpoint = EndpointId::from("e1");
        let id = manager.create_session(&endpoint, Some(2)).await.expect("should admit");
		let entry = manager.registry.get(&id).expect("entry should exist");
		assert_eq!(*entry.state.lock(), SessionState::Connecting);
	}

	#[tokio::test]
	async fn create_session_rejects_past_connection_cap() {
		let manager = manager();
		let endpoint = EndpointId::from("e1");
		manager.create_session(&endpoint, Some(1)).await.expect("first admission succeeds");
		let result = manager.create_session(&endpoint, Some(1)).await;
		assert!(result.is_err(), "second admission should be rejected once the cap of 1 is reached");
	}

	#[tokio::test]
	async fn track_message_updates_counters_exactly_once() {
		let manager = manager();
		let endpoint = EndpointId::from("e1");
		let id = manager.create_session(&endpoint, None).await.unwrap();
		manager.track_message(&id, Direction::Inbound, 5, Some(b"hello"), &SamplingConfig::default()).await;
		let entry = manager.registry.get(&id).unwrap();
		let snapshot = entry.metrics.snapshot();
		assert_eq!(snapshot.msgs_in, 1);
		assert_eq!(snapshot.bytes_in, 5);
	}

	#[tokio::test]
	async fn close_session_is_idempotent() {
		let manager = manager();
		let endpoint = EndpointId::from("e1");
		let id = manager.create_session(&endpoint, None).await.unwrap();
		assert!(manager.close_session(&id, SessionState::Closed).await.is_some());
		assert!(manager.close_session(&id, SessionState::Closed).await.is_none(), "second close should be a no-op");
	}

	#[tokio::test]
	async fn kill_session_cancels_token_for_relay_to_observe() {
		let manager = manager();
		let endpoint = EndpointId::from("e1");
		let id = manager.create_session(&endpoint, None).await.unwrap();
		let entry = manager.registry.get(&id).unwrap();
		assert!(!entry.cancel.is_cancelled());
		assert!(manager.kill_session(&id));
		assert!(entry.cancel.is_cancelled());
	}

	#[tokio::test]
	async fn kill_session_on_unknown_id_returns_false() {
		let manager = manager();
		assert!(!manager.kill_session(&relaygate_types::SessionId::from("missing".to_string())));
	}

	#[tokio::test]
	async fn track_message_reports_a_sample_when_sampling_hits() {
		let manager = manager();
		let endpoint = EndpointId::from("e1");
		let id = manager.create_session(&endpoint, None).await.unwrap();
		let sampling = SamplingConfig { enabled: true, sample_rate: 1.0, store_content: true, max_sample_size: 4 };

		let outcome = manager.track_message(&id, Direction::Inbound, 6, Some(b"abcdef"), &sampling).await;

		let sample = outcome.sample.expect("sample_rate of 1.0 should always sample");
		assert_eq!(sample.content.as_deref(), Some("abcd"), "content should be truncated to max_sample_size");
		assert_eq!(sample.size_bytes, 6, "size_bytes records the full message size, not the truncated content length");
	}

	#[tokio::test]
	async fn track_message_reports_no_sample_when_sampling_disabled() {
		let manager = manager();
		let endpoint = EndpointId::from("e1");
		let id = manager.create_session(&endpoint, None).await.unwrap();

		let outcome = manager.track_message(&id, Direction::Inbound, 6, Some(b"abcdef"), &SamplingConfig::default()).await;

		assert!(outcome.sample.is_none());
	}

	#[tokio::test]
	async fn statistics_tracks_total_sessions_independently_of_active_connections() {
		let manager = manager();
		let endpoint = EndpointId::from("e1");
		let first = manager.create_session(&endpoint, None).await.unwrap();
		manager.create_session(&endpoint, None).await.unwrap();
		manager.close_session(&first, SessionState::Closed).await;

		let stats = manager.statistics();
		assert_eq!(stats.active_connections, 1, "one of the two sessions was closed");
		assert_eq!(stats.total_sessions, 2, "total_sessions is cumulative and must not drop when a session closes");
	}
}
