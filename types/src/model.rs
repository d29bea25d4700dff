use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Opaque endpoint identifier, assigned by the out-of-scope admin surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub String);

impl std::fmt::Display for EndpointId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<String> for EndpointId {
	fn from(s: String) -> Self {
		Self(s)
	}
}

impl From<&str> for EndpointId {
	fn from(s: &str) -> Self {
		Self(s.to_string())
	}
}

/// Session identifier minted by the `SessionStore` at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl std::fmt::Display for SessionId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<String> for SessionId {
	fn from(s: String) -> Self {
		Self(s)
	}
}

/// Per-endpoint resource limits. Any field left unset by the store falls back
/// to the proxy's configured defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointLimits {
	pub max_connections: Option<u32>,
	pub max_message_size: u64,
	pub connection_timeout_ms: u64,
	pub idle_timeout_ms: u64,
	pub rate_limit_rpm: Option<u32>,
}

impl Default for EndpointLimits {
	fn default() -> Self {
		Self {
			max_connections: None,
			max_message_size: 1024 * 1024,
			connection_timeout_ms: 10_000,
			idle_timeout_ms: 5 * 60_000,
			rate_limit_rpm: None,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingConfig {
	pub enabled: bool,
	pub sample_rate: f64,
	pub store_content: bool,
	pub max_sample_size: usize,
}

impl Default for SamplingConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			sample_rate: 0.0,
			store_content: false,
			max_sample_size: 4096,
		}
	}
}

/// Upstream target + policy for one addressable endpoint. Read-only from the
/// core's perspective; owned and mutated by the out-of-scope admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
	pub id: EndpointId,
	pub name: String,
	pub target_url: String,
	pub enabled: bool,
	#[serde(default)]
	pub limits: EndpointLimits,
	#[serde(default)]
	pub sampling: SamplingConfig,
}

/// Lifecycle state of a session. CONNECTING and CONNECTED are non-terminal;
/// CLOSED and FAILED are terminal and mutually exclusive outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
	Connecting,
	Connected,
	Closing,
	Closed,
	Failed,
}

impl SessionState {
	pub fn is_terminal(self) -> bool {
		matches!(self, SessionState::Closed | SessionState::Failed)
	}
}

impl std::fmt::Display for SessionState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			SessionState::Connecting => "CONNECTING",
			SessionState::Connected => "CONNECTED",
			SessionState::Closing => "CLOSING",
			SessionState::Closed => "CLOSED",
			SessionState::Failed => "FAILED",
		};
		f.write_str(s)
	}
}

/// Direction of a relayed message, relative to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
	Inbound,
	Outbound,
}

/// Framing of a relayed message, preserved end-to-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
	Text,
	Binary,
}

/// Lock-free cumulative counters for one session's traffic. Shared between
/// the relay's two copy directions via `Arc`; each field updates
/// independently so neither direction blocks the other.
#[derive(Debug, Default)]
pub struct SessionMetrics {
	pub msgs_in: AtomicU64,
	pub msgs_out: AtomicU64,
	pub bytes_in: AtomicU64,
	pub bytes_out: AtomicU64,
}

impl SessionMetrics {
	pub fn record(&self, direction: Direction, size: u64) {
		match direction {
			Direction::Inbound => {
				self.msgs_in.fetch_add(1, Ordering::Relaxed);
				self.bytes_in.fetch_add(size, Ordering::Relaxed);
			}
			Direction::Outbound => {
				self.msgs_out.fetch_add(1, Ordering::Relaxed);
				self.bytes_out.fetch_add(size, Ordering::Relaxed);
			}
		}
	}

	pub fn snapshot(&self) -> SessionMetricsSnapshot {
		SessionMetricsSnapshot {
			msgs_in: self.msgs_in.load(Ordering::Relaxed),
			msgs_out: self.msgs_out.load(Ordering::Relaxed),
			bytes_in: self.bytes_in.load(Ordering::Relaxed),
			bytes_out: self.bytes_out.load(Ordering::Relaxed),
		}
	}
}

/// A point-in-time read of `SessionMetrics`, suitable for store flushes and
/// telemetry events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetricsSnapshot {
	pub msgs_in: u64,
	pub msgs_out: u64,
	pub bytes_in: u64,
	pub bytes_out: u64,
}

/// Append-only record of one sampled payload, written by the relay's
/// sampling path and consumed only by the out-of-scope admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSample {
	pub session_id: SessionId,
	pub endpoint_id: EndpointId,
	pub direction: Direction,
	pub timestamp: chrono::DateTime<chrono::Utc>,
	pub size_bytes: u64,
	pub content: Option<String>,
}

/// A row as persisted by the `SessionStore`. The proxy's in-memory registry
/// is the source of truth for a live session; this is what gets written back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
	pub id: SessionId,
	pub endpoint_id: EndpointId,
	pub state: SessionState,
	pub started_at: chrono::DateTime<chrono::Utc>,
	pub last_activity_at: chrono::DateTime<chrono::Utc>,
	pub metrics: SessionMetricsSnapshot,
}

/// One audit entry describing an administrative action taken against the
/// data plane (currently: `session.kill`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
	pub action: String,
	pub entity: String,
	pub success: bool,
	pub detail: Option<String>,
	pub timestamp: chrono::DateTime<chrono::Utc>,
}
