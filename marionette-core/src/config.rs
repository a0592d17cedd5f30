use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{fs, net::SocketAddr, path::Path, path::PathBuf};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MarionetteConfig {
	pub log_level: String,
	/// `name[:version]`
	pub format: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub format_dir: Option<PathBuf>,
	pub engine: EngineConfig,
	pub client: ClientConfig,
	pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
	/// How long a blocking `fte.send` waits for stream data before sending an
	/// empty keepalive cell.
	pub keepalive_ms: u64,
	pub retry_interval_ms: u64,
	/// 0 disables read timeouts.
	pub read_timeout_ms: u64,
	pub max_spawn_depth: u32,
	pub channel_bind_host: String,
	pub redial_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
	pub bind: String,
	pub server: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
	pub bind: String,
	pub proxy: String,
}

impl Default for MarionetteConfig {
	fn default() -> Self {
		Self {
			log_level: "info".into(),
			format: "dummy".into(),
			format_dir: None,
			engine: EngineConfig::default(),
			client: ClientConfig::default(),
			server: ServerConfig::default(),
		}
	}
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			keepalive_ms: 1_000,
			retry_interval_ms: 5,
			read_timeout_ms: 0,
			max_spawn_depth: 4,
			channel_bind_host: "127.0.0.1".into(),
			redial_delay_ms: 50,
		}
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self { bind: "127.0.0.1:8079".into(), server: "127.0.0.1:8081".into() }
	}
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self { bind: "127.0.0.1:8081".into(), proxy: "127.0.0.1:8080".into() }
	}
}

impl MarionetteConfig {
	pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
		let data = fs::read_to_string(path)?;
		let cfg: Self = toml::from_str(&data).map_err(|e| Error::config(format!("toml parse error: {e}")))?;
		cfg.validate()?;
		Ok(cfg)
	}

	pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
		let data = toml::to_string_pretty(self).map_err(|e| Error::config(format!("toml encode error: {e}")))?;
		fs::write(path, data)?;
		Ok(())
	}

	pub fn from_env() -> Result<Self> {
		let mut cfg = Self::default();
		cfg.apply_env();
		cfg.validate()?;
		Ok(cfg)
	}

	/// Overlay `MARIONETTE_*` environment variables.
	pub fn apply_env(&mut self) {
		if let Ok(v) = std::env::var("MARIONETTE_LOG_LEVEL") { self.log_level = v; }
		if let Ok(v) = std::env::var("MARIONETTE_FORMAT") { self.format = v; }
		if let Ok(v) = std::env::var("MARIONETTE_FORMAT_DIR") {
			if !v.trim().is_empty() { self.format_dir = Some(PathBuf::from(v)); }
		}
	}

	pub fn validate(&self) -> Result<()> {
		if !LOG_LEVELS.contains(&self.log_level.as_str()) {
			return Err(Error::config(format!("invalid log_level: {}", self.log_level)));
		}
		if self.format.trim().is_empty() {
			return Err(Error::config("format must not be empty"));
		}
		for (key, addr) in [
			("client.bind", &self.client.bind),
			("client.server", &self.client.server),
			("server.bind", &self.server.bind),
			("server.proxy", &self.server.proxy),
		] {
			addr.parse::<SocketAddr>().map_err(|e| Error::config(format!("invalid {key} {addr:?}: {e}")))?;
		}
		if self.engine.keepalive_ms == 0 {
			return Err(Error::config("engine.keepalive_ms must be positive"));
		}
		if self.engine.channel_bind_host.trim().is_empty() {
			return Err(Error::config("engine.channel_bind_host must not be empty"));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_validate() {
		assert!(MarionetteConfig::default().validate().is_ok());
	}

	#[test]
	fn partial_file_keeps_defaults() {
		let cfg: MarionetteConfig = toml::from_str("format = \"http_simple_blocking\"\n[engine]\nkeepalive_ms = 250\n").unwrap();
		assert_eq!(cfg.format, "http_simple_blocking");
		assert_eq!(cfg.engine.keepalive_ms, 250);
		assert_eq!(cfg.engine.retry_interval_ms, 5);
		assert_eq!(cfg.log_level, "info");
	}

	#[test]
	fn bad_address_is_rejected() {
		let mut cfg = MarionetteConfig::default();
		cfg.server.proxy = "nowhere".into();
		let msg = cfg.validate().unwrap_err().to_string();
		assert!(msg.contains("server.proxy"));
	}
}
