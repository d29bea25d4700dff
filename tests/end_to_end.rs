//! End-to-end scenarios against a running `App`: a real TCP echo upstream,
//! a real data-plane client, and a real `/ops` telemetry subscriber, all
//! talking actual WebSocket frames over localhost. These mirror the literal
//! scenarios enumerated for the proxy's testable properties.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use relaygate::app::{App, Stores};
use relaygate::config::ProxyConfig;
use relaygate::stores::memory::{InMemoryAuditSink, InMemoryEndpointStore, InMemorySampleStore, InMemorySessionStore};

use relaygate_types::{EndpointConfig, EndpointId, EndpointLimits, SamplingConfig};

/// Accepts connections forever and echoes back whatever frame it receives,
/// preserving text/binary framing. Used as the upstream target for every
/// scenario that needs one.
async fn spawn_echo_upstream() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo upstream");
	let addr = listener.local_addr().expect("local addr");
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else { return };
			tokio::spawn(async move {
				let Ok(ws) = tokio_tungstenite::accept_async(stream).await else { return };
				let (mut sink, mut stream) = ws.split();
				while let Some(Ok(msg)) = stream.next().await {
					match msg {
						Message::Text(_) | Message::Binary(_) => {
							if sink.send(msg).await.is_err() {
								return;
							}
						}
						Message::Close(_) => return,
						_ => {}
					}
				}
			});
		}
	});
	addr
}

struct Harness {
	handle: relaygate::app::ServerHandle,
}

impl Harness {
	fn ws_url(&self, endpoint_id: &str) -> String {
		format!("ws://{}/ws/{}", self.handle.local_addr, endpoint_id)
	}

	fn ops_url(&self) -> String {
		format!("ws://{}/ops", self.handle.local_addr)
	}
}

async fn start_with_endpoint(endpoint: EndpointConfig) -> Harness {
	let endpoint_store = Arc::new(InMemoryEndpointStore::new());
	endpoint_store.insert(endpoint);

	let stores =
		Stores { endpoint_store, session_store: Arc::new(InMemorySessionStore::new()), sample_store: Arc::new(InMemorySampleStore::new()), audit_sink: Arc::new(InMemoryAuditSink::new()) };

	let mut config = ProxyConfig::default();
	config.bind = "127.0.0.1:0".parse().unwrap();
	let app = App::new(config, stores);
	let handle = app.serve().await.expect("bind should succeed on an ephemeral port");
	Harness { handle }
}

fn endpoint_with(id: &str, target: SocketAddr, limits: EndpointLimits, sampling: SamplingConfig) -> EndpointConfig {
	EndpointConfig { id: EndpointId::from(id), name: "test".into(), target_url: format!("ws://{target}/echo"), enabled: true, limits, sampling }
}

async fn next_event(ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>) -> Value {
	loop {
		let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
			.await
			.expect("telemetry event should arrive within 5s")
			.expect("stream should not end")
			.expect("frame should not error");
		if let Message::Text(text) = msg {
			return serde_json::from_str(&text).expect("event should be valid JSON");
		}
	}
}

#[tokio::test]
async fn happy_echo_round_trips_and_emits_expected_telemetry_order() {
	let upstream = spawn_echo_upstream().await;
	let limits = EndpointLimits { max_connections: Some(2), max_message_size: 1024, ..Default::default() };
	let endpoint = endpoint_with("e1", upstream, limits, SamplingConfig::default());
	let harness = start_with_endpoint(endpoint).await;

	let (mut ops, _) = tokio_tungstenite::connect_async(harness.ops_url()).await.expect("ops connects");
	let snapshot = next_event(&mut ops).await;
	assert_eq!(snapshot["type"], "currentStats");

	let (mut client, _) = tokio_tungstenite::connect_async(harness.ws_url("e1")).await.expect("client connects");
	client.send(Message::Text("hello".into())).await.unwrap();

	let reply = client.next().await.expect("reply").expect("no transport error");
	assert_eq!(reply, Message::Text("hello".into()));

	client.close(None).await.ok();
	drop(client);

	let started = next_event(&mut ops).await;
	assert_eq!(started["type"], "sessionStarted");

	let meta_in = next_event(&mut ops).await;
	assert_eq!(meta_in["type"], "messageMeta");
	assert_eq!(meta_in["data"]["direction"], "inbound");
	assert_eq!(meta_in["data"]["size"], 5);

	let meta_out = next_event(&mut ops).await;
	assert_eq!(meta_out["type"], "messageMeta");
	assert_eq!(meta_out["data"]["direction"], "outbound");
	assert_eq!(meta_out["data"]["size"], 5);

	let ended = next_event(&mut ops).await;
	assert_eq!(ended["type"], "sessionEnded");
	assert_eq!(ended["data"]["reason"], "normal");
	assert_eq!(ended["data"]["finalStats"]["msgsIn"], 1);
	assert_eq!(ended["data"]["finalStats"]["bytesIn"], 5);
	assert_eq!(ended["data"]["finalStats"]["msgsOut"], 1);
	assert_eq!(ended["data"]["finalStats"]["bytesOut"], 5);

	harness.handle.shutdown().await;
}

#[tokio::test]
async fn oversize_message_fails_the_session_without_forwarding() {
	let upstream = spawn_echo_upstream().await;
	let limits = EndpointLimits { max_message_size: 10, ..Default::default() };
	let endpoint = endpoint_with("e1", upstream, limits, SamplingConfig::default());
	let harness = start_with_endpoint(endpoint).await;

	let (mut ops, _) = tokio_tungstenite::connect_async(harness.ops_url()).await.expect("ops connects");
	let _snapshot = next_event(&mut ops).await;

	let (mut client, _) = tokio_tungstenite::connect_async(harness.ws_url("e1")).await.expect("client connects");
	client.send(Message::Binary(vec![0u8; 11].into())).await.unwrap();

	let next = client.next().await;
	match next {
		Some(Ok(Message::Close(Some(CloseFrame { code, reason })))) => {
			assert_eq!(u16::from(code), 1011);
			assert_eq!(reason, "message-too-large");
		}
		Some(Ok(other)) => panic!("expected a close frame, got {other:?}"),
		other => panic!("expected a close frame, got {other:?}"),
	}

	let _started = next_event(&mut ops).await;
	let ended = next_event(&mut ops).await;
	assert_eq!(ended["type"], "sessionEnded");
	assert_eq!(ended["data"]["reason"], "message-too-large");
	assert_eq!(ended["data"]["finalStats"]["msgsIn"], 0, "the oversize message must never be counted as forwarded");

	harness.handle.shutdown().await;
}

#[tokio::test]
async fn connection_cap_rejects_second_session() {
	let upstream = spawn_echo_upstream().await;
	let limits = EndpointLimits { max_connections: Some(1), ..Default::default() };
	let endpoint = endpoint_with("e1", upstream, limits, SamplingConfig::default());
	let harness = start_with_endpoint(endpoint).await;

	let (_first, _) = tokio_tungstenite::connect_async(harness.ws_url("e1")).await.expect("first client connects");
	// Give the admission path a moment to register the first session before
	// the second races it.
	tokio::time::sleep(Duration::from_millis(50)).await;

	let (mut second, _) = tokio_tungstenite::connect_async(harness.ws_url("e1")).await.expect("second client upgrades at the transport level");
	let next = second.next().await;
	match next {
		Some(Ok(Message::Close(Some(CloseFrame { code, reason })))) => {
			assert_eq!(u16::from(code), 1011);
			assert_eq!(reason, "connection limit exceeded");
		}
		other => panic!("expected a connection-limit-exceeded close, got {other:?}"),
	}

	harness.handle.shutdown().await;
}

#[tokio::test]
async fn rate_limit_rejects_admissions_past_the_configured_cap() {
	let upstream = spawn_echo_upstream().await;
	let limits = EndpointLimits { rate_limit_rpm: Some(2), ..Default::default() };
	let endpoint = endpoint_with("e1", upstream, limits, SamplingConfig::default());
	let harness = start_with_endpoint(endpoint).await;

	for _ in 0..2 {
		let (mut client, _) = tokio_tungstenite::connect_async(harness.ws_url("e1")).await.expect("client within rate limit connects");
		// The admission check runs inside axum's upgrade callback, which is
		// scheduled after the HTTP 101 response this call already observed;
		// give it a moment to record the attempt before the next connect.
		tokio::time::sleep(Duration::from_millis(50)).await;
		client.close(None).await.ok();
	}

	let (mut third, _) = tokio_tungstenite::connect_async(harness.ws_url("e1")).await.expect("third upgrades at the transport level");
	let next = third.next().await;
	match next {
		Some(Ok(Message::Close(Some(CloseFrame { code, reason })))) => {
			assert_eq!(u16::from(code), 1011);
			assert_eq!(reason, "rate limit exceeded");
		}
		other => panic!("expected a rate-limit-exceeded close, got {other:?}"),
	}

	harness.handle.shutdown().await;
}

#[tokio::test]
async fn admin_kill_closes_the_session_and_reports_success() {
	let upstream = spawn_echo_upstream().await;
	let endpoint = endpoint_with("e1", upstream, EndpointLimits::default(), SamplingConfig::default());
	let harness = start_with_endpoint(endpoint).await;

	let (mut ops, _) = tokio_tungstenite::connect_async(harness.ops_url()).await.expect("ops connects");
	let _snapshot = next_event(&mut ops).await;

	let (mut client, _) = tokio_tungstenite::connect_async(harness.ws_url("e1")).await.expect("client connects");
	let started = next_event(&mut ops).await;
	assert_eq!(started["type"], "sessionStarted");
	let session_id = started["data"]["sessionId"].as_str().expect("sessionId present").to_string();

	let command = serde_json::json!({"type": "session.kill", "data": {"sessionId": session_id}});
	ops.send(Message::Text(command.to_string().into())).await.unwrap();

	// commandResult and sessionEnded come from independently scheduled tasks
	// (the /ops command handler vs. the relay's own teardown); only their
	// ordering relative to sessionStarted is guaranteed, not relative to
	// each other, so accept either arrival order here.
	let mut saw_command_result = false;
	let mut saw_session_ended = false;
	for _ in 0..2 {
		let event = next_event(&mut ops).await;
		match event["type"].as_str() {
			Some("commandResult") => {
				assert_eq!(event["data"]["success"], true);
				saw_command_result = true;
			}
			Some("sessionEnded") => {
				assert_eq!(event["data"]["reason"], "killed");
				saw_session_ended = true;
			}
			other => panic!("unexpected event type {other:?}"),
		}
	}
	assert!(saw_command_result && saw_session_ended);

	let closed = client.next().await;
	assert!(matches!(closed, Some(Ok(Message::Close(_))) | None), "client socket should be force-closed by the kill");

	harness.handle.shutdown().await;
}

#[tokio::test]
async fn sampling_truncates_content_per_max_sample_size() {
	let upstream = spawn_echo_upstream().await;
	let sampling = SamplingConfig { enabled: true, sample_rate: 1.0, store_content: true, max_sample_size: 4 };
	let endpoint = endpoint_with("e1", upstream, EndpointLimits::default(), sampling);
	let harness = start_with_endpoint(endpoint).await;

	let (mut ops, _) = tokio_tungstenite::connect_async(harness.ops_url()).await.expect("ops connects");
	let _snapshot = next_event(&mut ops).await;

	let (mut client, _) = tokio_tungstenite::connect_async(harness.ws_url("e1")).await.expect("client connects");
	client.send(Message::Text("abcdef".into())).await.unwrap();
	let _reply = client.next().await;

	let _started = next_event(&mut ops).await;
	let mut sampled = next_event(&mut ops).await;
	while sampled["type"] != "sampledPayload" {
		sampled = next_event(&mut ops).await;
	}
	assert_eq!(sampled["data"]["content"], "abcd");
	assert_eq!(sampled["data"]["size"], 6);
	assert_eq!(sampled["data"]["direction"], "inbound");

	client.close(None).await.ok();
	harness.handle.shutdown().await;
}
