//! Process argument / environment parsing into a [`ProxyConfig`].

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use relaygate_types::EndpointConfig;

use crate::config::{LogFormat, ProxyConfig};

/// `--seed-endpoint name=id,target=ws://host:port/path` entries used to stand
/// up demo endpoints without wiring a real `EndpointStore`.
#[derive(Debug, Clone)]
pub struct SeedEndpoint {
	pub id: String,
	pub target_url: String,
}

impl std::str::FromStr for SeedEndpoint {
	type Err = String;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		let mut id = None;
		let mut target_url = None;
		for part in raw.split(',') {
			let (key, value) = part.split_once('=').ok_or_else(|| format!("malformed seed-endpoint entry: {part}"))?;
			match key.trim() {
				"id" => id = Some(value.trim().to_string()),
				"target" => target_url = Some(value.trim().to_string()),
				other => return Err(format!("unknown seed-endpoint key: {other}")),
			}
		}
		let id = id.ok_or("seed-endpoint entry is missing id=")?;
		let target_url = target_url.ok_or("seed-endpoint entry is missing target=")?;
		Ok(SeedEndpoint { id, target_url })
	}
}

impl SeedEndpoint {
	pub fn into_endpoint_config(self, default_limits: relaygate_types::EndpointLimits) -> EndpointConfig {
		EndpointConfig {
			id: relaygate_types::EndpointId::from(self.id),
			name: "seed".into(),
			target_url: self.target_url,
			enabled: true,
			limits: default_limits,
			sampling: relaygate_types::SamplingConfig::default(),
		}
	}
}

#[derive(Debug, Parser)]
#[command(name = "relaygate", about = "Intercepting reverse proxy for full-duplex WebSocket streams")]
pub struct Args {
	/// Address the combined data-plane/`/ops` listener binds to.
	#[arg(long, env = "PROXY_BIND_ADDR")]
	pub bind: Option<SocketAddr>,

	/// Path to a TOML config file, overlaid on top of built-in defaults.
	#[arg(long, env = "PROXY_CONFIG")]
	pub config: Option<PathBuf>,

	/// `pretty` for a TTY, `json` for shipping logs to a collector.
	#[arg(long, env = "PROXY_LOG_FORMAT")]
	pub log_format: Option<String>,

	/// Stand up a demo endpoint without an external `EndpointStore`; may be
	/// repeated. Format: `id=<endpoint-id>,target=<ws-url>`.
	#[arg(long = "seed-endpoint", value_name = "id=...,target=...")]
	pub seed_endpoints: Vec<SeedEndpoint>,
}

impl Args {
	/// Loads `ProxyConfig` from the `--config` file (if any) and applies
	/// `--bind`/`--log-format` overrides on top, matching the documented
	/// precedence: defaults, then file, then individual env/flag overrides.
	pub fn into_config(&self) -> anyhow::Result<ProxyConfig> {
		let mut config = ProxyConfig::load(self.config.as_deref())?;
		if let Some(bind) = self.bind {
			config.bind = bind;
		}
		if let Some(log_format) = &self.log_format {
			config.log_format = match log_format.as_str() {
				"json" => LogFormat::Json,
				"pretty" => LogFormat::Pretty,
				other => anyhow::bail!("unknown log format: {other}"),
			};
		}
		Ok(config)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn seed_endpoint_parses_id_and_target() {
		let seed: SeedEndpoint = "id=e1,target=ws://127.0.0.1:9000/echo".parse().unwrap();
		assert_eq!(seed.id, "e1");
		assert_eq!(seed.target_url, "ws://127.0.0.1:9000/echo");
	}

	#[test]
	fn seed_endpoint_rejects_missing_target() {
		let result: Result<SeedEndpoint, _> = "id=e1".parse();
		assert!(result.is_err());
	}

	#[test]
	fn into_config_applies_bind_override() {
		let args = Args { bind: Some("127.0.0.1:9999".parse().unwrap()), config: None, log_format: None, seed_endpoints: vec![] };
		let config = args.into_config().unwrap();
		assert_eq!(config.bind, "127.0.0.1:9999".parse::<SocketAddr>().unwrap());
	}
}
