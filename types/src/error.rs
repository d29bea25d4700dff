use thiserror::Error;

use crate::model::{EndpointId, SessionId};

/// Errors surfaced by admission, relay, and store operations. Each admission
/// kind maps to a specific close code and telemetry reason at the listener
/// boundary; see the relay module for that mapping.
#[derive(Debug, Error)]
pub enum ProxyError {
	#[error("endpoint not found: {0}")]
	EndpointNotFound(EndpointId),

	#[error("endpoint disabled: {0}")]
	EndpointDisabled(EndpointId),

	#[error("connection limit exceeded for endpoint {0}")]
	ConnectionLimitExceeded(EndpointId),

	#[error("rate limit exceeded for endpoint {0}")]
	RateLimitExceeded(EndpointId),

	#[error("message of {size} bytes exceeds max_message_size of {limit} bytes")]
	MessageTooLarge { size: u64, limit: u64 },

	#[error("failed to connect to upstream target for endpoint {endpoint}: {reason}")]
	TargetConnectionError { endpoint: EndpointId, reason: String },

	#[error("session not found: {0}")]
	SessionNotFound(SessionId),

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error("internal error: {0}")]
	Internal(String),
}

impl ProxyError {
	/// WebSocket close code this error should be reported to the client with,
	/// when it occurs during or after admission. `1002` is reserved for a
	/// malformed/missing path segment (see the listener's own bare `/ws`
	/// rejection); every admission-time rejection, including an endpoint id
	/// that is well-formed but unknown, is a policy violation and closes with
	/// `1011` per §6.
	pub fn close_code(&self) -> u16 {
		match self {
			ProxyError::EndpointNotFound(_)
			| ProxyError::MessageTooLarge { .. }
			| ProxyError::TargetConnectionError { .. }
			| ProxyError::EndpointDisabled(_)
			| ProxyError::ConnectionLimitExceeded(_)
			| ProxyError::RateLimitExceeded(_)
			| ProxyError::SessionNotFound(_)
			| ProxyError::Store(_)
			| ProxyError::Internal(_) => 1011,
		}
	}

	/// Short machine-readable reason used in `sessionEnded` telemetry.
	pub fn reason(&self) -> &'static str {
		match self {
			ProxyError::EndpointNotFound(_) => "endpoint not found",
			ProxyError::EndpointDisabled(_) => "endpoint disabled",
			ProxyError::ConnectionLimitExceeded(_) => "connection limit exceeded",
			ProxyError::RateLimitExceeded(_) => "rate limit exceeded",
			ProxyError::MessageTooLarge { .. } => "message-too-large",
			ProxyError::TargetConnectionError { .. } => "upstream-unreachable",
			ProxyError::SessionNotFound(_) => "session not found",
			ProxyError::Store(_) => "internal error",
			ProxyError::Internal(_) => "internal error",
		}
	}
}

/// Errors from the four external store contracts. Kept distinct from
/// `ProxyError` so store implementations don't need to depend on the rest of
/// this crate's error taxonomy, only `std::error::Error`.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("store operation failed: {0}")]
	Backend(String),

	#[error("record not found")]
	NotFound,
}

pub type ProxyResult<T> = Result<T, ProxyError>;
pub type StoreResult<T> = Result<T, StoreError>;
