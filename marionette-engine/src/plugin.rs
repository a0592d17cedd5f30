//! Name-addressed table of the actions a document may invoke.

use crate::error::{Error, Result};
use crate::fsm::Fsm;
use async_trait::async_trait;
use marionette_core::{ArgValue, Document};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

/// Declared type of one plugin argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
	Str,
	Int,
	/// Integer or float.
	Number,
}

impl ArgKind {
	pub fn accepts(self, v: &ArgValue) -> bool {
		match self {
			ArgKind::Str => matches!(v, ArgValue::Str(_)),
			ArgKind::Int => matches!(v, ArgValue::Int(_)),
			ArgKind::Number => matches!(v, ArgValue::Int(_) | ArgValue::Float(_)),
		}
	}
}

/// Result of one action. A hard error is the `Err` side of the surrounding `Result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
	Success,
	/// Not ready yet; stay in the current state and try again later.
	Retry,
	/// The action did not apply; the engine tries the next candidate.
	Failure,
}

#[async_trait]
pub trait Plugin: Send + Sync {
	fn signature(&self) -> &'static [ArgKind];
	async fn invoke(&self, fsm: &mut Fsm, args: &[ArgValue]) -> Result<Outcome>;
}

/// Built once at startup and shared read-only afterwards.
#[derive(Default)]
pub struct PluginRegistry {
	plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
	pub fn new() -> Self { Self::default() }

	/// Registry holding the `io`, `fte`, `tg`, `model` and `channel` plugins.
	pub fn with_builtins() -> Self {
		let plugins = crate::plugins::builtins()
			.into_iter()
			.map(|(module, method, plugin)| (format!("{module}.{method}"), plugin))
			.collect();
		Self { plugins }
	}

	pub fn register(&mut self, module: &str, method: &str, plugin: Arc<dyn Plugin>) -> Result<()> {
		let name = format!("{module}.{method}");
		if self.plugins.contains_key(&name) {
			return Err(Error::AlreadyRegistered(name));
		}
		self.plugins.insert(name, plugin);
		Ok(())
	}

	pub fn get(&self, module: &str, method: &str) -> Option<Arc<dyn Plugin>> {
		self.plugins.get(&format!("{module}.{method}")).cloned()
	}

	pub fn contains(&self, module: &str, method: &str) -> bool {
		self.plugins.contains_key(&format!("{module}.{method}"))
	}

	pub fn len(&self) -> usize { self.plugins.len() }

	pub fn is_empty(&self) -> bool { self.plugins.is_empty() }

	/// Sorted `module.method` names.
	pub fn names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.plugins.keys().cloned().collect();
		names.sort();
		names
	}

	/// Check every action of `doc` against the declared signatures and compile
	/// its guards, so sessions never meet a malformed action at run time.
	pub fn validate(&self, doc: &Document) -> Result<()> {
		for action in doc.actions() {
			let name = action.name();
			let plugin = self.plugins.get(&name).ok_or_else(|| Error::PluginNotFound(name.clone()))?;
			let sig = plugin.signature();
			if sig.len() != action.args.len() {
				return Err(Error::invalid_args(&name, format!("expected {} arguments, got {}", sig.len(), action.args.len())));
			}
			for (i, (kind, arg)) in sig.iter().zip(&action.args).enumerate() {
				if !kind.accepts(arg) {
					return Err(Error::invalid_args(&name, format!("argument {i} should be {kind:?}, got {arg}")));
				}
			}
			if let Some(re) = &action.regex {
				Regex::new(re).map_err(|e| Error::invalid_args(&name, format!("guard {re:?}: {e}")))?;
			}
		}
		Ok(())
	}
}

pub(crate) fn str_arg<'a>(action: &str, args: &'a [ArgValue], i: usize) -> Result<&'a str> {
	args.get(i).and_then(ArgValue::as_str).ok_or_else(|| Error::invalid_args(action, format!("argument {i} must be a string")))
}

pub(crate) fn int_arg(action: &str, args: &[ArgValue], i: usize) -> Result<i64> {
	args.get(i).and_then(ArgValue::as_int).ok_or_else(|| Error::invalid_args(action, format!("argument {i} must be an integer")))
}

pub(crate) fn usize_arg(action: &str, args: &[ArgValue], i: usize) -> Result<usize> {
	let n = int_arg(action, args, i)?;
	usize::try_from(n).map_err(|_| Error::invalid_args(action, format!("argument {i} must not be negative")))
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Nop;

	#[async_trait]
	impl Plugin for Nop {
		fn signature(&self) -> &'static [ArgKind] { &[ArgKind::Str, ArgKind::Number] }
		async fn invoke(&self, _fsm: &mut Fsm, _args: &[ArgValue]) -> Result<Outcome> { Ok(Outcome::Success) }
	}

	fn doc(args: &str, guard: &str) -> Document {
		Document::from_toml(&format!(
			r#"
transport = "tcp"
port = 1
[[transitions]]
source = "start"
destination = "end"
action_block = "b"
probability = 1.0
[[action_blocks.b]]
party = "client"
module = "test"
method = "nop"
args = {args}
{guard}
"#
		))
		.unwrap()
	}

	#[test]
	fn register_rejects_duplicates() {
		let mut reg = PluginRegistry::new();
		reg.register("test", "nop", Arc::new(Nop)).unwrap();
		let err = reg.register("test", "nop", Arc::new(Nop)).unwrap_err();
		assert!(matches!(err, Error::AlreadyRegistered(n) if n == "test.nop"));
		assert!(reg.contains("test", "nop"));
		assert!(reg.get("test", "other").is_none());
		assert_eq!(reg.names(), vec!["test.nop".to_string()]);
	}

	#[test]
	fn builtins_are_present() {
		let reg = PluginRegistry::with_builtins();
		for name in [
			"io.puts", "io.gets", "fte.send", "fte.send_async", "fte.recv", "fte.recv_async", "tg.send", "tg.recv",
			"model.sleep", "model.spawn", "channel.bind",
		] {
			let (m, f) = name.split_once('.').unwrap();
			assert!(reg.contains(m, f), "{name} missing");
		}
		assert_eq!(reg.len(), 11);
	}

	#[test]
	fn validate_checks_signatures() {
		let mut reg = PluginRegistry::new();
		reg.register("test", "nop", Arc::new(Nop)).unwrap();
		assert!(reg.validate(&doc(r#"["x", 1.5]"#, "")).is_ok());
		assert!(reg.validate(&doc(r#"["x", 2]"#, "")).is_ok());
		assert!(matches!(reg.validate(&doc(r#"["x"]"#, "")), Err(Error::InvalidArguments { .. })));
		assert!(matches!(reg.validate(&doc(r#"[1, 2]"#, "")), Err(Error::InvalidArguments { .. })));
		assert!(matches!(reg.validate(&doc(r#"["x", 1]"#, r#"regex = "(""#)), Err(Error::InvalidArguments { .. })));
		assert!(matches!(PluginRegistry::new().validate(&doc(r#"["x", 1]"#, "")), Err(Error::PluginNotFound(_))));
	}

	#[test]
	fn builtin_formats_validate() {
		let reg = PluginRegistry::with_builtins();
		let store = marionette_core::FormatStore::builtin();
		for id in store.list().unwrap() {
			let (_, doc) = store.load(&id.to_string().parse().unwrap()).unwrap();
			reg.validate(&doc).unwrap_or_else(|e| panic!("{id}: {e}"));
		}
	}
}
