//! Parsed MAR document model.
//!
//! A [`Document`] is the validated output of the MAR parser: an ordered list of
//! probabilistic transitions between named states plus the action blocks those
//! transitions execute. Documents are shared read-only between every session
//! that runs the same format.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;

/// Initial state of every document.
pub const START_STATE: &str = "start";
/// Logical terminal state named by documents.
pub const END_STATE: &str = "end";
/// Engine terminal state; self-looping.
pub const DEAD_STATE: &str = "dead";
/// Action block name denoting "no actions".
pub const NULL_BLOCK: &str = "NULL";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
	Tcp,
	Udp,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Party {
	Client,
	Server,
}

impl Party {
	pub fn other(self) -> Self {
		match self {
			Party::Client => Party::Server,
			Party::Server => Party::Client,
		}
	}
}

impl fmt::Display for Party {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Party::Client => f.write_str("client"),
			Party::Server => f.write_str("server"),
		}
	}
}

/// Listening port: either a literal number or the name of a session variable
/// bound at runtime (see `channel.bind`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum Port {
	Number(u16),
	Named(String),
}

impl fmt::Display for Port {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Port::Number(n) => write!(f, "{n}"),
			Port::Named(name) => f.write_str(name),
		}
	}
}

/// Literal action argument.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ArgValue {
	Int(i64),
	Float(f64),
	Str(String),
}

impl ArgValue {
	pub fn as_str(&self) -> Option<&str> {
		match self {
			ArgValue::Str(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_int(&self) -> Option<i64> {
		match self {
			ArgValue::Int(n) => Some(*n),
			_ => None,
		}
	}

	/// Integers are accepted wherever a float is expected.
	pub fn as_float(&self) -> Option<f64> {
		match self {
			ArgValue::Int(n) => Some(*n as f64),
			ArgValue::Float(x) => Some(*x),
			ArgValue::Str(_) => None,
		}
	}
}

impl fmt::Display for ArgValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ArgValue::Int(n) => write!(f, "{n}"),
			ArgValue::Float(x) => write!(f, "{x:?}"),
			ArgValue::Str(s) => write!(f, "{s:?}"),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
	pub party: Party,
	pub module: String,
	pub method: String,
	#[serde(default)]
	pub args: Vec<ArgValue>,
	/// Optional guard: the action only runs when the unconsumed connection
	/// buffer matches this regex.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub regex: Option<String>,
}

impl Action {
	/// `module.method`
	pub fn name(&self) -> String {
		format!("{}.{}", self.module, self.method)
	}

	/// True for actions that emit cells (`fte.send*`, `tg.send`); literal
	/// `io.puts` traffic carries no session identity.
	pub fn sends_cells(&self) -> bool {
		matches!(self.module.as_str(), "fte" | "tg") && self.method.starts_with("send")
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transition {
	pub source: String,
	pub destination: String,
	pub action_block: String,
	pub probability: f64,
	#[serde(default, rename = "error")]
	pub is_error: bool,
}

impl Transition {
	fn is_engine_terminal(&self) -> bool {
		self.action_block == NULL_BLOCK
			&& (self.source == DEAD_STATE || (self.source == END_STATE && self.destination == DEAD_STATE))
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
	pub transport: Transport,
	pub port: Port,
	pub transitions: Vec<Transition>,
	#[serde(default)]
	pub action_blocks: BTreeMap<String, Vec<Action>>,
}

impl Document {
	/// Parse a TOML rendering of a document and normalize it.
	pub fn from_toml(src: &str) -> Result<Self> {
		let mut doc: Document = toml::from_str(src).map_err(|e| Error::document(format!("toml parse error: {e}")))?;
		doc.validate()?;
		doc.normalize();
		Ok(doc)
	}

	/// Structural checks only; reachability is the parser's responsibility.
	pub fn validate(&self) -> Result<()> {
		if !self.transitions.iter().any(|t| t.source == START_STATE) {
			return Err(Error::document("no transition leaves the start state"));
		}
		for t in &self.transitions {
			if !(0.0..=1.0).contains(&t.probability) || t.probability.is_nan() {
				return Err(Error::document(format!(
					"transition {} -> {} has probability {} outside [0, 1]",
					t.source, t.destination, t.probability
				)));
			}
			if t.action_block != NULL_BLOCK && !self.action_blocks.contains_key(&t.action_block) {
				return Err(Error::document(format!("unknown action block: {}", t.action_block)));
			}
		}
		Ok(())
	}

	/// Append the `end -> dead` and self-looping `dead` transitions. Idempotent.
	pub fn normalize(&mut self) {
		let has = |doc: &Document, src: &str, dst: &str| {
			doc.transitions.iter().any(|t| t.source == src && t.destination == dst && t.action_block == NULL_BLOCK)
		};
		if !has(self, END_STATE, DEAD_STATE) {
			self.transitions.push(Transition {
				source: END_STATE.into(),
				destination: DEAD_STATE.into(),
				action_block: NULL_BLOCK.into(),
				probability: 1.0,
				is_error: false,
			});
		}
		if !has(self, DEAD_STATE, DEAD_STATE) {
			self.transitions.push(Transition {
				source: DEAD_STATE.into(),
				destination: DEAD_STATE.into(),
				action_block: NULL_BLOCK.into(),
				probability: 1.0,
				is_error: false,
			});
		}
	}

	/// Outgoing transitions of `state`, in declaration order.
	pub fn transitions_from<'a>(&'a self, state: &'a str) -> impl Iterator<Item = &'a Transition> + 'a {
		self.transitions.iter().filter(move |t| t.source == state)
	}

	/// Actions of a block; `NULL` and unknown names yield `None`.
	pub fn action_block(&self, name: &str) -> Option<&[Action]> {
		if name == NULL_BLOCK {
			return Some(&[]);
		}
		self.action_blocks.get(name).map(Vec::as_slice)
	}

	/// Every state named by a transition endpoint, sorted.
	pub fn states(&self) -> Vec<&str> {
		let mut set: Vec<&str> = self
			.transitions
			.iter()
			.flat_map(|t| [t.source.as_str(), t.destination.as_str()])
			.collect::<HashSet<_>>()
			.into_iter()
			.collect();
		set.sort_unstable();
		set
	}

	/// Iterate all actions of all blocks.
	pub fn actions(&self) -> impl Iterator<Item = &Action> {
		self.action_blocks.values().flatten()
	}

	/// Stable identifier derived from the document content. Both peers compute
	/// the same value without negotiation; never zero.
	pub fn model_uuid(&self) -> u32 {
		let mut hasher = Sha256::new();
		hasher.update(self.canonical().as_bytes());
		let digest = hasher.finalize();
		let id = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
		if id == 0 { 1 } else { id }
	}

	/// Party of the first cell-sending action reachable from `start`, searching
	/// breadth first in declaration order. Defaults to the client.
	pub fn first_sender(&self) -> Party {
		let mut queue = VecDeque::from([START_STATE]);
		let mut seen = HashSet::from([START_STATE]);
		while let Some(state) = queue.pop_front() {
			for t in self.transitions_from(state) {
				if let Some(actions) = self.action_block(&t.action_block) {
					if let Some(action) = actions.iter().find(|a| a.sends_cells()) {
						return action.party;
					}
				}
				if seen.insert(t.destination.as_str()) {
					queue.push_back(t.destination.as_str());
				}
			}
		}
		Party::Client
	}

	fn canonical(&self) -> String {
		let mut out = String::new();
		let transport = match self.transport {
			Transport::Tcp => "tcp",
			Transport::Udp => "udp",
		};
		out.push_str(&format!("connection({transport}, {}):\n", self.port));
		for t in self.transitions.iter().filter(|t| !t.is_engine_terminal()) {
			out.push_str(&format!(
				"  {} {} {} {:?}{}\n",
				t.source,
				t.destination,
				t.action_block,
				t.probability,
				if t.is_error { " error" } else { "" }
			));
		}
		for (name, actions) in &self.action_blocks {
			out.push_str(&format!("action {name}:\n"));
			for a in actions {
				let args: Vec<String> = a.args.iter().map(ToString::to_string).collect();
				out.push_str(&format!("  {} {}({})", a.party, a.name(), args.join(", ")));
				if let Some(re) = &a.regex {
					out.push_str(&format!(" if regex_match_incoming({re:?})"));
				}
				out.push('\n');
			}
		}
		out
	}
}
