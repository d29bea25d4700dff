//! Intercepting reverse proxy for full-duplex WebSocket message streams:
//! admission policy, session management, bidirectional relay with
//! backpressure, sampling, and a telemetry pub/sub bus.

pub mod app;
pub mod cli;
pub mod config;
pub mod listener;
pub mod rate_limit;
pub mod relay;
pub mod session_manager;
pub mod stores;
pub mod telemetry;
