//! Built-in plugins.

pub mod channel;
pub mod fte;
pub mod io;
pub mod model;
pub mod tg;

use crate::error::Result;
use crate::plugin::{Plugin, PluginRegistry};
use std::sync::Arc;

type Entry = (&'static str, &'static str, Arc<dyn Plugin>);

fn entry(module: &'static str, method: &'static str, plugin: impl Plugin + 'static) -> Entry {
	let plugin: Arc<dyn Plugin> = Arc::new(plugin);
	(module, method, plugin)
}

/// Every built-in plugin as `(module, method, plugin)`.
pub fn builtins() -> Vec<Entry> {
	vec![
		entry("io", "puts", io::Puts),
		entry("io", "gets", io::Gets),
		entry("fte", "send", fte::Send { blocking: true }),
		entry("fte", "send_async", fte::Send { blocking: false }),
		entry("fte", "recv", fte::Recv { blocking: true }),
		entry("fte", "recv_async", fte::Recv { blocking: false }),
		entry("tg", "send", tg::Send),
		entry("tg", "recv", tg::Recv),
		entry("model", "sleep", model::Sleep),
		entry("model", "spawn", model::Spawn),
		entry("channel", "bind", channel::Bind),
	]
}

/// Add the built-ins to an existing registry.
pub fn register_builtins(reg: &mut PluginRegistry) -> Result<()> {
	for (module, method, plugin) in builtins() {
		reg.register(module, method, plugin)?;
	}
	Ok(())
}
