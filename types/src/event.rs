use serde::{Deserialize, Serialize};

use crate::model::{Direction, EndpointId, SessionId, SessionMetricsSnapshot};

/// Live telemetry stream published to `/ops` subscribers. Represented as a
/// runtime-tagged union rather than the source's stringly-typed `{type,
/// data}` envelope, so a malformed event can't be constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum TelemetryEvent {
	SessionStarted {
		session_id: SessionId,
		endpoint_id: EndpointId,
		client_ip: Option<String>,
	},
	SessionUpdated {
		session_id: SessionId,
		endpoint_id: EndpointId,
		msgs_in: u64,
		msgs_out: u64,
		bytes_in: u64,
		bytes_out: u64,
		latency_ms: Option<u64>,
	},
	SessionEnded {
		session_id: SessionId,
		endpoint_id: EndpointId,
		reason: String,
		duration_ms: u64,
		final_stats: SessionMetricsSnapshot,
	},
	MessageMeta {
		session_id: SessionId,
		endpoint_id: EndpointId,
		direction: Direction,
		size: u64,
		latency_ms: Option<u64>,
	},
	SampledPayload {
		session_id: SessionId,
		endpoint_id: EndpointId,
		direction: Direction,
		size: u64,
		content: Option<String>,
		timestamp: chrono::DateTime<chrono::Utc>,
	},
	CommandResult {
		command: String,
		session_id: SessionId,
		success: bool,
	},
	CommandError {
		command: String,
		session_id: Option<SessionId>,
		error: String,
	},
	/// Sent once, immediately after a subscriber connects.
	CurrentStats {
		active_connections: u64,
		total_sessions: u64,
		per_endpoint: Vec<EndpointStatsSummary>,
		sessions: Vec<SessionSummary>,
	},
}

/// Per-endpoint rollup included in a `currentStats` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStatsSummary {
	pub endpoint_id: EndpointId,
	pub sessions: u64,
	pub total_messages: u64,
	pub total_bytes: u64,
}

/// One active session's rollup included in a `currentStats` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
	pub session_id: SessionId,
	pub endpoint_id: EndpointId,
	pub state: crate::model::SessionState,
	pub started_at: chrono::DateTime<chrono::Utc>,
	pub metrics: SessionMetricsSnapshot,
}

impl TelemetryEvent {
	pub fn session_id(&self) -> Option<&SessionId> {
		match self {
			TelemetryEvent::SessionStarted { session_id, .. }
			| TelemetryEvent::SessionUpdated { session_id, .. }
			| TelemetryEvent::SessionEnded { session_id, .. }
			| TelemetryEvent::MessageMeta { session_id, .. }
			| TelemetryEvent::SampledPayload { session_id, .. }
			| TelemetryEvent::CommandResult { session_id, .. } => Some(session_id),
			TelemetryEvent::CommandError { session_id, .. } => session_id.as_ref(),
			TelemetryEvent::CurrentStats { .. } => None,
		}
	}
}

/// Inbound control commands accepted on the `/ops` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ControlCommand {
	#[serde(rename = "session.kill")]
	SessionKill {
		#[serde(rename = "sessionId")]
		session_id: SessionId,
	},
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn session_started_round_trips_with_tagged_envelope() {
		let event = TelemetryEvent::SessionStarted {
			session_id: SessionId("s1".into()),
			endpoint_id: EndpointId("e1".into()),
			client_ip: Some("127.0.0.1".into()),
		};
		let json = serde_json::to_value(&event).expect("serialize");
		assert_eq!(json["type"], "sessionStarted");
		assert_eq!(json["data"]["sessionId"], "s1");

		let back: TelemetryEvent = serde_json::from_value(json).expect("deserialize");
		assert_eq!(back.session_id().map(|s| s.0.as_str()), Some("s1"));
	}

	#[test]
	fn session_kill_command_uses_camel_case_field() {
		let cmd = ControlCommand::SessionKill { session_id: SessionId("s9".into()) };
		let json = serde_json::to_value(&cmd).expect("serialize");
		assert_eq!(json["type"], "session.kill");
		assert_eq!(json["data"]["sessionId"], "s9");
	}
}
