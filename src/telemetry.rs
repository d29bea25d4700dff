use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use relaygate_types::{AuditEvent, AuditSink, ControlCommand, SessionId, TelemetryEvent};

use crate::session_manager::SessionManager;

const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

/// In-process publish/subscribe fan-out to `/ops` connections. Delivery is
/// best-effort and not retained: a subscriber that can't keep up is dropped
/// rather than allowed to backpressure a publisher.
#[derive(Default)]
pub struct TelemetryBus {
	subscribers: DashMap<SubscriberId, mpsc::Sender<String>>,
	shutdown: CancellationToken,
}

impl TelemetryBus {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a new subscriber and returns its id plus the receiving end
	/// of its delivery queue; the listener forwards items on that queue as
	/// text frames over the subscriber's websocket.
	pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<String>) {
		let id = SubscriberId(Uuid::new_v4());
		let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
		self.subscribers.insert(id, tx);
		(id, rx)
	}

	pub fn unsubscribe(&self, id: SubscriberId) {
		self.subscribers.remove(&id);
	}

	pub fn subscriber_count(&self) -> usize {
		self.subscribers.len()
	}

	/// Cancelled once on process shutdown; subscriber loops select on this to
	/// close with code 1001 rather than waiting on a publish that may never
	/// come.
	pub fn shutdown_token(&self) -> CancellationToken {
		self.shutdown.clone()
	}

	/// Evicts every current subscriber and cancels the shutdown token so
	/// their listener-side loops close the underlying socket with code 1001.
	pub fn close_all(&self) {
		self.subscribers.clear();
		self.shutdown.cancel();
	}

	/// Publishes one event to every current subscriber. Never holds a lock
	/// across a network write: the queue send is just handing the payload to
	/// the subscriber's own forwarding task, never a direct socket write.
	pub fn publish(&self, event: &TelemetryEvent) {
		let payload = match serde_json::to_string(event) {
			Ok(json) => json,
			Err(err) => {
				warn!(error = %err, "failed to serialize telemetry event, dropping");
				return;
			}
		};

		let mut dead = Vec::new();
		for entry in self.subscribers.iter() {
			if entry.value().try_send(payload.clone()).is_err() {
				dead.push(*entry.key());
			}
		}
		for id in dead {
			self.subscribers.remove(&id);
		}
	}

	/// Sends a one-shot snapshot to a single newly-registered subscriber.
	pub async fn send_initial_snapshot(&self, id: SubscriberId, event: TelemetryEvent) {
		if let Some(sender) = self.subscribers.get(&id) {
			if let Ok(json) = serde_json::to_string(&event) {
				let _ = sender.send(json).await;
			}
		}
	}

	/// Parses and executes an inbound control command, publishing the
	/// resulting `commandResult`/`commandError` event and recording an audit
	/// entry for the action taken.
	pub async fn handle_command(&self, raw: &str, session_manager: &SessionManager, audit: &Arc<dyn AuditSink>) {
		let command: ControlCommand = match serde_json::from_str(raw) {
			Ok(cmd) => cmd,
			Err(err) => {
				self.publish(&TelemetryEvent::CommandError { command: "unknown".into(), session_id: None, error: err.to_string() });
				return;
			}
		};

		match command {
			ControlCommand::SessionKill { session_id } => self.handle_session_kill(session_id, session_manager, audit).await,
		}
	}

	async fn handle_session_kill(&self, session_id: SessionId, session_manager: &SessionManager, audit: &Arc<dyn AuditSink>) {
		let success = session_manager.kill_session(&session_id);
		info!(session_id = %session_id, success, "session.kill command executed");

		let _ = audit
			.append(AuditEvent {
				action: "session.kill".into(),
				entity: session_id.to_string(),
				success,
				detail: if success { None } else { Some("session not found".into()) },
				timestamp: chrono::Utc::now(),
			})
			.await;

		if success {
			self.publish(&TelemetryEvent::CommandResult { command: "session.kill".into(), session_id, success: true });
		} else {
			self.publish(&TelemetryEvent::CommandError {
				command: "session.kill".into(),
				session_id: Some(session_id),
				error: "session not found".into(),
			});
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use relaygate_types::EndpointId;

	use crate::stores::memory::{InMemoryAuditSink, InMemorySampleStore, InMemorySessionStore};

	use super::*;

	#[tokio::test]
	async fn publish_delivers_to_all_current_subscribers() {
		let bus = TelemetryBus::new();
		let (_id1, mut rx1) = bus.subscribe();
		let (_id2, mut rx2) = bus.subscribe();

		bus.publish(&TelemetryEvent::SessionStarted { session_id: SessionId("s1".into()), endpoint_id: EndpointId("e1".into()), client_ip: None });

		assert!(rx1.recv().await.is_some());
		assert!(rx2.recv().await.is_some());
	}

	#[tokio::test]
	async fn unsubscribe_removes_subscriber_from_future_publishes() {
		let bus = TelemetryBus::new();
		let (id, mut rx) = bus.subscribe();
		bus.unsubscribe(id);
		bus.publish(&TelemetryEvent::SessionStarted { session_id: SessionId("s1".into()), endpoint_id: EndpointId("e1".into()), client_ip: None });
		assert!(rx.try_recv().is_err(), "an unsubscribed receiver should get nothing");
	}

	#[tokio::test]
	async fn full_subscriber_queue_causes_eviction_instead_of_blocking() {
		let bus = TelemetryBus::new();
		let (_id, _rx) = bus.subscribe();

		for _ in 0..(SUBSCRIBER_QUEUE_DEPTH + 10) {
			bus.publish(&TelemetryEvent::SessionStarted { session_id: SessionId("s1".into()), endpoint_id: EndpointId("e1".into()), client_ip: None });
		}

		assert_eq!(bus.subscriber_count(), 0, "a subscriber that never drains its queue should eventually be dropped");
	}

	#[tokio::test]
	async fn session_kill_command_publishes_command_result_and_records_audit() {
		let bus = TelemetryBus::new();
		let manager = SessionManager::new(Arc::new(InMemorySessionStore::new()), Arc::new(InMemorySampleStore::new()));
		let audit: Arc<dyn AuditSink> = Arc::new(InMemoryAuditSink::new());
		let endpoint = EndpointId::from("e1");
		let session_id = manager.create_session(&endpoint, None).await.unwrap();

		let (_id, mut rx) = bus.subscribe();
		let raw = format!(r#"{{"type":"session.kill","data":{{"sessionId":"{session_id}"}}}}"#);
		bus.handle_command(&raw, &manager, &audit).await;

		let delivered = rx.recv().await.expect("commandResult should be published");
		assert!(delivered.contains("commandResult"));
		assert!(delivered.contains("true"));
	}
}
