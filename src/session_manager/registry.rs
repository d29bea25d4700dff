use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use relaygate_types::{Direction, EndpointId, SessionId, SessionMetrics, SessionState};

/// The registry's weak handle onto a live session: enough to answer lookups,
/// update metrics, and force a close, without owning the sockets themselves
/// (those stay with the `Relay` task that created the entry).
pub struct SessionEntry {
	pub session_id: SessionId,
	pub endpoint_id: EndpointId,
	pub state: Mutex<SessionState>,
	pub metrics: Arc<SessionMetrics>,
	pub started_at: chrono::DateTime<chrono::Utc>,
	pub last_activity_ms: AtomicI64,
	/// Cancelled by `kill_session`, the reaper, or process shutdown; the
	/// relay's copy loops select on this to force-close both sockets.
	pub cancel: CancellationToken,
	pub last_flush_ms: AtomicI64,
	pub msgs_since_flush: AtomicUsize,
	/// Bytes currently queued in the relay's outbound-to-client writer, used
	/// by the backpressure check. Incremented when a frame is handed to the
	/// writer task, decremented once the write completes.
	pub pending_to_client: AtomicI64,
	/// Same accounting for the outbound-to-target direction.
	pub pending_to_target: AtomicI64,
	/// Throttles the backpressure warning log to roughly once per window
	/// rather than once per oversubscribed message.
	pub last_backpress_warn_ms: AtomicI64,
	/// Set by `kill_session` before cancelling, so the relay can report
	/// `reason="killed"` rather than a generic cancellation.
	pub killed: AtomicBool,
	/// Set by the reaper before cancelling, so the relay can report
	/// `reason="stale session reaped"`.
	pub reaped: AtomicBool,
	/// Set by the composition root during the shutdown sequence, before the
	/// grace window's force-close, so the relay can report a clean
	/// `reason="server shutting down"` instead of a generic failure.
	pub shutting_down: AtomicBool,
}

impl SessionEntry {
	fn new(session_id: SessionId, endpoint_id: EndpointId) -> Self {
		let now = chrono::Utc::now();
		Self {
			session_id,
			endpoint_id,
			state: Mutex::new(SessionState::Connecting),
			metrics: Arc::new(SessionMetrics::default()),
			started_at: now,
			last_activity_ms: AtomicI64::new(now.timestamp_millis()),
			cancel: CancellationToken::new(),
			last_flush_ms: AtomicI64::new(now.timestamp_millis()),
			msgs_since_flush: AtomicUsize::new(0),
			pending_to_client: AtomicI64::new(0),
			pending_to_target: AtomicI64::new(0),
			last_backpress_warn_ms: AtomicI64::new(0),
			killed: AtomicBool::new(false),
			reaped: AtomicBool::new(false),
			shutting_down: AtomicBool::new(false),
		}
	}

	pub fn touch(&self) {
		self.last_activity_ms.store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
	}

	pub fn idle_for_ms(&self) -> i64 {
		chrono::Utc::now().timestamp_millis() - self.last_activity_ms.load(Ordering::Relaxed)
	}

	/// Buffered bytes outstanding for the peer that a message travelling in
	/// `direction` is headed towards (inbound writes to the target, outbound
	/// writes to the client).
	pub fn pending_bytes(&self, direction: Direction) -> i64 {
		match direction {
			Direction::Inbound => self.pending_to_target.load(Ordering::Relaxed),
			Direction::Outbound => self.pending_to_client.load(Ordering::Relaxed),
		}
	}

	pub fn add_pending(&self, direction: Direction, delta: i64) {
		let counter = match direction {
			Direction::Inbound => &self.pending_to_target,
			Direction::Outbound => &self.pending_to_client,
		};
		counter.fetch_add(delta, Ordering::Relaxed);
	}
}

/// Per-endpoint live connection counts, reserved via compare-exchange before
/// a session is admitted so two concurrent admissions for a nearly-full
/// endpoint can't both succeed (TOCTOU avoidance).
#[derive(Default)]
struct ConnectionCounters {
	counts: DashMap<EndpointId, AtomicUsize>,
}

impl ConnectionCounters {
	fn try_reserve(&self, endpoint_id: &EndpointId, max: usize) -> bool {
		let counter = self.counts.entry(endpoint_id.clone()).or_insert_with(|| AtomicUsize::new(0));
		loop {
			let current = counter.load(Ordering::Relaxed);
			if current >= max {
				return false;
			}
			if counter.compare_exchange_weak(current, current + 1, Ordering::Relaxed, Ordering::Relaxed).is_ok() {
				return true;
			}
		}
	}

	fn release(&self, endpoint_id: &EndpointId) {
		if let Some(counter) = self.counts.get(endpoint_id) {
			let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
		}
	}

	fn current(&self, endpoint_id: &EndpointId) -> usize {
		self.counts.get(endpoint_id).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
	}
}

/// The in-memory session registry: authoritative while a session is live.
/// Safe for concurrent callers — entry insertion/removal goes through
/// `DashMap`, and per-session mutation is isolated to that entry's own
/// interior-mutable fields, so no caller ever holds a lock across another
/// session's work.
#[derive(Default)]
pub struct SessionRegistry {
	entries: DashMap<SessionId, Arc<SessionEntry>>,
	counters: ConnectionCounters,
}

impl SessionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Reserves a connection slot for `endpoint_id` under `max` (if any) and,
	/// on success, inserts a fresh `CONNECTING` entry for `session_id`.
	/// Returns `None` if the endpoint is already at capacity.
	pub fn try_insert(&self, session_id: SessionId, endpoint_id: EndpointId, max_connections: Option<u32>) -> Option<Arc<SessionEntry>> {
		if let Some(max) = max_connections {
			if !self.counters.try_reserve(&endpoint_id, max as usize) {
				return None;
			}
		}
		let entry = Arc::new(SessionEntry::new(session_id.clone(), endpoint_id));
		self.entries.insert(session_id, entry.clone());
		Some(entry)
	}

	pub fn get(&self, session_id: &SessionId) -> Option<Arc<SessionEntry>> {
		self.entries.get(session_id).map(|e| e.clone())
	}

	/// Removes the entry and releases its endpoint's connection slot. Safe
	/// to call more than once for the same id — the second call is a no-op.
	pub fn remove(&self, session_id: &SessionId) -> Option<Arc<SessionEntry>> {
		let removed = self.entries.remove(session_id).map(|(_, entry)| entry);
		if let Some(entry) = &removed {
			self.counters.release(&entry.endpoint_id);
		}
		removed
	}

	pub fn active_count(&self, endpoint_id: &EndpointId) -> usize {
		self.counters.current(endpoint_id)
	}

	pub fn active_sessions_for(&self, endpoint_id: &EndpointId) -> Vec<Arc<SessionEntry>> {
		self.entries.iter().filter(|e| &e.endpoint_id == endpoint_id).map(|e| e.clone()).collect()
	}

	pub fn all(&self) -> Vec<Arc<SessionEntry>> {
		self.entries.iter().map(|e| e.clone()).collect()
	}

	pub fn total_count(&self) -> usize {
		self.entries.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn try_insert_respects_connection_cap() {
		let registry = SessionRegistry::new();
		let endpoint = EndpointId::from("e1");
		assert!(registry.try_insert(SessionId::from("s1".to_string()), endpoint.clone(), Some(1)).is_some());
		assert!(
			registry.try_insert(SessionId::from("s2".to_string()), endpoint.clone(), Some(1)).is_none(),
			"second insert should be rejected once the cap of 1 is reached"
		);
	}

	#[test]
	fn remove_releases_slot_for_next_admission() {
		let registry = SessionRegistry::new();
		let endpoint = EndpointId::from("e1");
		let s1 = SessionId::from("s1".to_string());
		registry.try_insert(s1.clone(), endpoint.clone(), Some(1)).unwrap();
		registry.remove(&s1);
		assert!(registry.try_insert(SessionId::from("s2".to_string()), endpoint, Some(1)).is_some());
	}

	#[test]
	fn remove_is_idempotent() {
		let registry = SessionRegistry::new();
		let endpoint = EndpointId::from("e1");
		let s1 = SessionId::from("s1".to_string());
		registry.try_insert(s1.clone(), endpoint, Some(1)).unwrap();
		assert!(registry.remove(&s1).is_some());
		assert!(registry.remove(&s1).is_none(), "removing an already-removed session should be a no-op");
	}

	#[test]
	fn unlimited_endpoint_accepts_many_sessions() {
		let registry = SessionRegistry::new();
		let endpoint = EndpointId::from("e1");
		for i in 0..50 {
			assert!(registry.try_insert(SessionId::from(format!("s{i}")), endpoint.clone(), None).is_some());
		}
		assert_eq!(registry.active_count(&endpoint), 50);
	}
}
