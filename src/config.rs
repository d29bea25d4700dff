use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use relaygate_types::EndpointLimits;

/// Log output shape. `Pretty` is meant for an interactive terminal, `Json`
/// for anything that ships logs to a collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
	#[default]
	Pretty,
	Json,
}

/// Tunables for the two-tier backpressure policy described in the design
/// notes: a warning threshold and a hard drop threshold, both measured in
/// bytes of buffered-but-unsent data on the destination socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackpressureConfig {
	pub warn_bytes: u64,
	pub drop_bytes: u64,
}

impl Default for BackpressureConfig {
	fn default() -> Self {
		Self { warn_bytes: 16 * 1024, drop_bytes: 64 * 1024 }
	}
}

/// Reaper cadence: how often the sweep runs, and how long a session may sit
/// idle before the reaper force-closes it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaperConfig {
	#[serde(with = "duration_ms", default = "default_reaper_interval")]
	pub interval: Duration,
	#[serde(with = "duration_ms", default = "default_stale_threshold")]
	pub stale_threshold: Duration,
}

fn default_reaper_interval() -> Duration {
	Duration::from_secs(5 * 60)
}

fn default_stale_threshold() -> Duration {
	Duration::from_secs(30 * 60)
}

impl Default for ReaperConfig {
	fn default() -> Self {
		Self { interval: default_reaper_interval(), stale_threshold: default_stale_threshold() }
	}
}

/// Cadence for flushing in-memory session counters back to the
/// `SessionStore`: whichever of the two fires first.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsFlushConfig {
	pub every_messages: u64,
	#[serde(with = "duration_ms", default = "default_flush_interval")]
	pub every: Duration,
}

fn default_flush_interval() -> Duration {
	Duration::from_secs(30)
}

impl Default for MetricsFlushConfig {
	fn default() -> Self {
		Self { every_messages: 10, every: default_flush_interval() }
	}
}

mod duration_ms {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_u64(d.as_millis() as u64)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		Ok(Duration::from_millis(u64::deserialize(d)?))
	}
}

/// Top-level configuration for the proxy binary, loaded by the composition
/// root from built-in defaults, an optional TOML file, and environment
/// variable overrides (in that precedence order).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
	#[serde(default = "default_bind")]
	pub bind: SocketAddr,
	#[serde(default)]
	pub log_format: LogFormat,
	#[serde(default)]
	pub default_limits: EndpointLimits,
	#[serde(default)]
	pub backpressure: BackpressureConfig,
	#[serde(default)]
	pub reaper: ReaperConfig,
	#[serde(default)]
	pub metrics_flush: MetricsFlushConfig,
	/// Grace period granted to in-flight relays on shutdown before they are
	/// force-closed.
	#[serde(with = "duration_ms", default = "default_shutdown_grace")]
	pub shutdown_grace: Duration,
	/// Interval between keepalive pings sent to the client while CONNECTED.
	#[serde(with = "duration_ms", default = "default_keepalive_interval")]
	pub keepalive_interval: Duration,
}

fn default_bind() -> SocketAddr {
	"0.0.0.0:8080".parse().expect("static bind address is valid")
}

fn default_shutdown_grace() -> Duration {
	Duration::from_secs(5)
}

fn default_keepalive_interval() -> Duration {
	Duration::from_secs(30)
}

impl Default for ProxyConfig {
	fn default() -> Self {
		Self {
			bind: default_bind(),
			log_format: LogFormat::default(),
			default_limits: EndpointLimits::default(),
			backpressure: BackpressureConfig::default(),
			reaper: ReaperConfig::default(),
			metrics_flush: MetricsFlushConfig::default(),
			shutdown_grace: default_shutdown_grace(),
			keepalive_interval: default_keepalive_interval(),
		}
	}
}

impl ProxyConfig {
	/// Load defaults, then overlay a TOML file at `path` if one is given and
	/// exists, then return. Environment overrides are applied separately by
	/// the CLI layer (see `cli::Args::into_config`) since they target
	/// individual fields rather than the whole document.
	pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
		let mut config = ProxyConfig::default();
		if let Some(path) = path {
			if path.exists() {
				let raw = std::fs::read_to_string(path)?;
				config = toml::from_str(&raw)?;
			}
		}
		Ok(config)
	}
}
