//! Shared types crossing the data-plane / control-plane boundary: the wire
//! model, the telemetry event union, the error taxonomy, and the trait
//! contracts for the four external stores the core depends on.

pub mod error;
pub mod event;
pub mod model;
pub mod store;

pub use error::{ProxyError, ProxyResult, StoreError, StoreResult};
pub use event::{ControlCommand, EndpointStatsSummary, SessionSummary, TelemetryEvent};
pub use model::{
	AuditEvent, Direction, EndpointConfig, EndpointId, EndpointLimits, FrameKind, SamplingConfig, SessionId, SessionMetrics,
	SessionMetricsSnapshot, SessionRecord, SessionState, TrafficSample,
};
pub use store::{AuditSink, EndpointStore, SessionStore, TrafficSampleStore};
