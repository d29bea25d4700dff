use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use relaygate_types::{
	AuditEvent, AuditSink, EndpointConfig, EndpointId, EndpointStore, SessionId, SessionMetricsSnapshot, SessionRecord, SessionState,
	SessionStore, StoreResult, TrafficSample, TrafficSampleStore,
};

/// Reference `EndpointStore` backed by a map populated at startup (from
/// `--seed-endpoint` CLI flags or a config file). Not the out-of-scope admin
/// surface's real store — just enough for the binary to run standalone.
#[derive(Default)]
pub struct InMemoryEndpointStore {
	endpoints: DashMap<EndpointId, EndpointConfig>,
}

impl InMemoryEndpointStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, endpoint: EndpointConfig) {
		self.endpoints.insert(endpoint.id.clone(), endpoint);
	}
}

#[async_trait]
impl EndpointStore for InMemoryEndpointStore {
	async fn get(&self, id: &EndpointId) -> StoreResult<Option<EndpointConfig>> {
		Ok(self.endpoints.get(id).map(|e| e.clone()))
	}
}

#[derive(Default)]
pub struct InMemorySessionStore {
	rows: DashMap<SessionId, SessionRecord>,
	active_counts: DashMap<EndpointId, AtomicU64>,
}

impl InMemorySessionStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
	async fn create(&self, endpoint_id: &EndpointId) -> StoreResult<SessionId> {
		let id = SessionId(Uuid::new_v4().to_string());
		let now = chrono::Utc::now();
		self.rows.insert(
			id.clone(),
			SessionRecord {
				id: id.clone(),
				endpoint_id: endpoint_id.clone(),
				state: SessionState::Connecting,
				started_at: now,
				last_activity_at: now,
				metrics: SessionMetricsSnapshot::default(),
			},
		);
		self.active_counts.entry(endpoint_id.clone()).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
		Ok(id)
	}

	async fn update(&self, id: &SessionId, metrics: SessionMetricsSnapshot, state: Option<SessionState>) -> StoreResult<()> {
		if let Some(mut row) = self.rows.get_mut(id) {
			row.metrics = metrics;
			row.last_activity_at = chrono::Utc::now();
			if let Some(state) = state {
				row.state = state;
			}
		}
		Ok(())
	}

	async fn close(&self, id: &SessionId, final_state: SessionState, metrics: SessionMetricsSnapshot) -> StoreResult<()> {
		if let Some(mut row) = self.rows.get_mut(id) {
			row.state = final_state;
			row.metrics = metrics;
			if let Some(counter) = self.active_counts.get(&row.endpoint_id) {
				let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
			}
		}
		Ok(())
	}

	async fn count_active(&self, endpoint_id: &EndpointId) -> StoreResult<u32> {
		Ok(self.active_counts.get(endpoint_id).map(|c| c.load(Ordering::Relaxed) as u32).unwrap_or(0))
	}

	async fn get(&self, id: &SessionId) -> StoreResult<Option<SessionRecord>> {
		Ok(self.rows.get(id).map(|r| r.clone()))
	}
}

#[derive(Default)]
pub struct InMemorySampleStore {
	samples: DashMap<u64, TrafficSample>,
	next_id: AtomicU64,
}

impl InMemorySampleStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.samples.len()
	}

	pub fn is_empty(&self) -> bool {
		self.samples.is_empty()
	}
}

#[async_trait]
impl TrafficSampleStore for InMemorySampleStore {
	async fn append(&self, sample: TrafficSample) -> StoreResult<()> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.samples.insert(id, sample);
		Ok(())
	}
}

#[derive(Default)]
pub struct InMemoryAuditSink {
	events: DashMap<u64, AuditEvent>,
	next_id: AtomicU64,
}

impl InMemoryAuditSink {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.events.len()
	}
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
	async fn append(&self, event: AuditEvent) -> StoreResult<()> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.events.insert(id, event);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn session_store_tracks_active_count_across_create_and_close() {
		let store = InMemorySessionStore::new();
		let endpoint = EndpointId::from("e1");
		let id = store.create(&endpoint).await.unwrap();
		assert_eq!(store.count_active(&endpoint).await.unwrap(), 1);
		store.close(&id, SessionState::Closed, SessionMetricsSnapshot::default()).await.unwrap();
		assert_eq!(store.count_active(&endpoint).await.unwrap(), 0);
	}

	#[tokio::test]
	async fn endpoint_store_returns_none_for_unknown_id() {
		let store = InMemoryEndpointStore::new();
		assert!(store.get(&EndpointId::from("missing")).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn sample_store_appends_are_independently_counted() {
		let store = InMemorySampleStore::new();
		for _ in 0..3 {
			store
				.append(TrafficSample {
					session_id: SessionId::from("s1".to_string()),
					endpoint_id: EndpointId::from("e1"),
					direction: relaygate_types::Direction::Inbound,
					timestamp: chrono::Utc::now(),
					size_bytes: 4,
					content: None,
				})
				.await
				.unwrap();
		}
		assert_eq!(store.len(), 3);
	}
}
