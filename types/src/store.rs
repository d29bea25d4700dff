use async_trait::async_trait;

use crate::error::StoreResult;
use crate::model::{AuditEvent, EndpointConfig, EndpointId, SessionId, SessionMetricsSnapshot, SessionRecord, SessionState, TrafficSample};

/// Read-only lookup of endpoint configuration. Owned and mutated by the
/// out-of-scope admin surface; the core never writes through this trait.
#[async_trait]
pub trait EndpointStore: Send + Sync {
	async fn get(&self, id: &EndpointId) -> StoreResult<Option<EndpointConfig>>;
}

/// Persistence for session rows. The in-memory registry is authoritative
/// while a session is live; this trait is the write-behind target.
#[async_trait]
pub trait SessionStore: Send + Sync {
	async fn create(&self, endpoint_id: &EndpointId) -> StoreResult<SessionId>;

	async fn update(&self, id: &SessionId, metrics: SessionMetricsSnapshot, state: Option<SessionState>) -> StoreResult<()>;

	async fn close(&self, id: &SessionId, final_state: SessionState, metrics: SessionMetricsSnapshot) -> StoreResult<()>;

	async fn count_active(&self, endpoint_id: &EndpointId) -> StoreResult<u32>;

	async fn get(&self, id: &SessionId) -> StoreResult<Option<SessionRecord>>;
}

/// Append-only audit trail for administrative actions (currently:
/// `session.kill`). Read back only by the out-of-scope admin surface.
#[async_trait]
pub trait AuditSink: Send + Sync {
	async fn append(&self, event: AuditEvent) -> StoreResult<()>;
}

/// Append-only store for sampled payloads. Writes are best-effort from the
/// relay's perspective: a failure here is logged and otherwise ignored.
#[async_trait]
pub trait TrafficSampleStore: Send + Sync {
	async fn append(&self, sample: TrafficSample) -> StoreResult<()>;
}
