use crate::plugin::PluginRegistry;
use marionette_cipher::{CipherFactory, DefaultCipherFactory};
use marionette_core::{EngineConfig, FormatStore};
use std::sync::Arc;
use std::time::Duration;

/// Runtime knobs derived from [`EngineConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
	pub keepalive: Duration,
	pub retry_interval: Duration,
	/// Idle limit for a session that makes no progress.
	pub read_timeout: Option<Duration>,
	pub max_spawn_depth: u32,
	pub channel_bind_host: String,
	pub redial_delay: Duration,
}

impl From<&EngineConfig> for EngineSettings {
	fn from(cfg: &EngineConfig) -> Self {
		Self {
			keepalive: Duration::from_millis(cfg.keepalive_ms),
			retry_interval: Duration::from_millis(cfg.retry_interval_ms),
			read_timeout: (cfg.read_timeout_ms > 0).then(|| Duration::from_millis(cfg.read_timeout_ms)),
			max_spawn_depth: cfg.max_spawn_depth,
			channel_bind_host: cfg.channel_bind_host.clone(),
			redial_delay: Duration::from_millis(cfg.redial_delay_ms),
		}
	}
}

impl Default for EngineSettings {
	fn default() -> Self { Self::from(&EngineConfig::default()) }
}

/// Process-wide, read-only state shared by every session.
#[derive(Clone)]
pub struct EngineContext {
	pub plugins: Arc<PluginRegistry>,
	pub ciphers: Arc<dyn CipherFactory>,
	pub formats: Arc<FormatStore>,
	pub settings: EngineSettings,
}

impl EngineContext {
	/// Built-in plugins, in-process ciphers and built-in formats.
	pub fn new(settings: EngineSettings) -> Self {
		Self {
			plugins: Arc::new(PluginRegistry::with_builtins()),
			ciphers: Arc::new(DefaultCipherFactory),
			formats: Arc::new(FormatStore::builtin()),
			settings,
		}
	}

	pub fn with_formats(mut self, formats: FormatStore) -> Self {
		self.formats = Arc::new(formats);
		self
	}

	pub fn with_cipher_factory(mut self, ciphers: Arc<dyn CipherFactory>) -> Self {
		self.ciphers = ciphers;
		self
	}

	pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
		self.plugins = Arc::new(plugins);
		self
	}
}

impl Default for EngineContext {
	fn default() -> Self { Self::new(EngineSettings::default()) }
}

impl std::fmt::Debug for EngineContext {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EngineContext")
			.field("plugins", &self.plugins.len())
			.field("settings", &self.settings)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn settings_from_config() {
		let mut cfg = EngineConfig::default();
		let s = EngineSettings::from(&cfg);
		assert_eq!(s.keepalive, Duration::from_millis(1000));
		assert_eq!(s.read_timeout, None);
		cfg.read_timeout_ms = 250;
		assert_eq!(EngineSettings::from(&cfg).read_timeout, Some(Duration::from_millis(250)));
	}
}
