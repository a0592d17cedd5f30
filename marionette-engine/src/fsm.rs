//! Format-driven protocol state machine.
//!
//! One [`Fsm`] drives one physical connection. Each [`Fsm::next`] call picks
//! the outgoing transitions of the current state, runs their action blocks
//! and advances on the first block that succeeds. Transition choice is a pure
//! function of the state and a PRNG seeded by the session's instance id, so
//! both peers walk the same path without further negotiation.

use crate::conn::Conn;
use crate::context::{EngineContext, EngineSettings};
use crate::error::{Error, Result};
use crate::plugin::Outcome;
use marionette_cipher::{Cipher, CipherCache, Dfa};
use marionette_core::document::{DEAD_STATE, START_STATE};
use marionette_core::{ArgValue, Document, Party, Transition};
use marionette_stream::{Cell, StreamSet};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use regex::bytes::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Result of one successful [`Fsm::next`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
	Advanced,
	/// Nothing changed; call again once more input may have arrived.
	Retry,
	/// The session reached the terminal state.
	Dead,
}

/// Outcome of handing a received cell to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
	/// The cell was queued on its stream.
	Accepted,
	/// The cell taught us the instance id; it has not been queued and the
	/// caller should leave it unconsumed and retry.
	Learned,
}

pub struct Fsm {
	doc: Arc<Document>,
	party: Party,
	state: String,
	step_count: u64,
	uuid: u32,
	instance_id: u32,
	rng: Option<ChaCha20Rng>,
	/// Candidates drawn for the current state, kept until one succeeds so a
	/// retried step does not consume extra draws.
	pending: Option<Vec<Transition>>,
	vars: HashMap<String, ArgValue>,
	channels: HashMap<String, TcpListener>,
	guards: HashMap<String, Regex>,
	conn: Conn,
	streams: StreamSet,
	ciphers: CipherCache,
	ctx: EngineContext,
	depth: u32,
}

impl std::fmt::Debug for Fsm {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Fsm")
			.field("party", &self.party)
			.field("state", &self.state)
			.field("step_count", &self.step_count)
			.field("uuid", &self.uuid)
			.field("instance_id", &self.instance_id)
			.finish_non_exhaustive()
	}
}

impl Fsm {
	/// The party that sends the document's first cell picks the instance id
	/// right away; the other one learns it from that cell.
	pub fn new(ctx: EngineContext, doc: Arc<Document>, party: Party, conn: Conn, streams: StreamSet) -> Self {
		let ciphers = CipherCache::new(ctx.ciphers.clone());
		let mut fsm = Self {
			uuid: doc.model_uuid(),
			party,
			state: START_STATE.to_string(),
			step_count: 0,
			instance_id: 0,
			rng: None,
			pending: None,
			vars: HashMap::new(),
			channels: HashMap::new(),
			guards: HashMap::new(),
			conn,
			streams,
			ciphers,
			ctx,
			depth: 0,
			doc,
		};
		if party == fsm.doc.first_sender() {
			fsm.set_instance_id(random_instance_id());
		}
		fsm
	}

	/// A child session over the same connection and streams, one level deeper.
	pub fn spawn_child(&self, doc: Arc<Document>) -> Self {
		let mut child = Self::new(self.ctx.clone(), doc, self.party, self.conn.clone(), self.streams.clone());
		child.depth = self.depth + 1;
		if self.instance_id != 0 {
			child.set_instance_id(self.instance_id);
		}
		child
	}

	pub fn party(&self) -> Party { self.party }
	pub fn state(&self) -> &str { &self.state }
	pub fn step_count(&self) -> u64 { self.step_count }
	pub fn uuid(&self) -> u32 { self.uuid }
	pub fn instance_id(&self) -> u32 { self.instance_id }
	pub fn depth(&self) -> u32 { self.depth }
	pub fn document(&self) -> &Arc<Document> { &self.doc }
	pub fn conn(&self) -> &Conn { &self.conn }
	pub fn streams(&self) -> &StreamSet { &self.streams }
	pub fn context(&self) -> &EngineContext { &self.ctx }
	pub fn settings(&self) -> &EngineSettings { &self.ctx.settings }
	pub fn is_dead(&self) -> bool { self.state == DEAD_STATE }

	pub fn var(&self, name: &str) -> Option<&ArgValue> { self.vars.get(name) }

	pub fn set_var(&mut self, name: impl Into<String>, value: ArgValue) {
		self.vars.insert(name.into(), value);
	}

	/// Listener bound by `channel.bind` under `name`.
	pub fn channel(&self, name: &str) -> Option<&TcpListener> { self.channels.get(name) }

	pub(crate) fn bind_channel(&mut self, name: impl Into<String>, listener: TcpListener) {
		self.channels.insert(name.into(), listener);
	}

	pub fn cipher(&mut self, regex: &str, msg_len: usize) -> Result<Arc<dyn Cipher>> {
		Ok(self.ciphers.cipher(regex, msg_len)?)
	}

	pub fn dfa(&mut self, regex: &str, msg_len: usize) -> Result<Arc<dyn Dfa>> {
		Ok(self.ciphers.dfa(regex, msg_len)?)
	}

	/// Adopt an instance id. The PRNG is re-derived on the next step.
	pub fn set_instance_id(&mut self, id: u32) {
		if id == self.instance_id {
			return;
		}
		debug!(party = %self.party, instance_id = id, step = self.step_count, "instance id set");
		self.instance_id = id;
		self.rng = None;
		self.pending = None;
	}

	fn init_prng(&mut self) {
		if self.rng.is_some() || self.instance_id == 0 {
			return;
		}
		if self.step_count == 0 {
			self.rng = Some(ChaCha20Rng::seed_from_u64(u64::from(self.instance_id)));
		} else {
			self.replay(self.step_count);
		}
	}

	/// Reset to `start` and redo `steps` transition choices without running
	/// any actions.
	pub fn replay(&mut self, steps: u64) {
		let mut rng = ChaCha20Rng::seed_from_u64(u64::from(self.instance_id));
		let mut state = START_STATE.to_string();
		for _ in 0..steps {
			match choose_transitions(&self.doc, &state, Some(&mut rng)).first() {
				Some(t) => state = t.destination.clone(),
				None => break,
			}
		}
		debug!(party = %self.party, steps, state = %state, "transition choices replayed");
		self.state = state;
		self.rng = Some(rng);
		self.pending = None;
	}

	/// Take one step.
	pub async fn next(&mut self) -> Result<Step> {
		if self.is_dead() {
			return Ok(Step::Dead);
		}
		self.init_prng();
		let candidates = match self.pending.take() {
			Some(c) => c,
			None => choose_transitions(&self.doc, &self.state, self.rng.as_mut()),
		};
		let mut outcome = Outcome::Failure;
		let mut taken = None;
		for t in &candidates {
			outcome = self.eval_block(&t.action_block).await?;
			if outcome != Outcome::Failure {
				taken = Some(t.destination.clone());
				break;
			}
		}
		match (outcome, taken) {
			(Outcome::Success, Some(dest)) => {
				debug!(party = %self.party, from = %self.state, to = %dest, step = self.step_count, "transition");
				self.state = dest;
				self.step_count += 1;
				Ok(if self.is_dead() { Step::Dead } else { Step::Advanced })
			}
			(Outcome::Retry, _) => {
				// Keep the draw unless the retry was caused by learning the
				// instance id, which discards it for a replay.
				if self.rng.is_some() || self.instance_id == 0 {
					self.pending = Some(candidates);
				}
				Ok(Step::Retry)
			}
			_ => {
				if self.rng.is_some() {
					self.pending = Some(candidates);
				}
				Err(Error::NoTransition(self.state.clone()))
			}
		}
	}

	/// Run the party's actions of one block, stopping at the first that does
	/// not fail. An empty block succeeds.
	async fn eval_block(&mut self, block: &str) -> Result<Outcome> {
		let doc = self.doc.clone();
		let actions = doc.action_block(block).ok_or_else(|| Error::ActionBlockNotFound(block.to_string()))?;
		let party = self.party;
		let mut any = false;
		for action in actions.iter().filter(|a| a.party == party) {
			any = true;
			if let Some(guard) = &action.regex {
				if !self.guard_matches(guard).await? {
					trace!(action = %action.name(), "guard did not match");
					continue;
				}
			}
			let plugin = self
				.ctx
				.plugins
				.get(&action.module, &action.method)
				.ok_or_else(|| Error::PluginNotFound(action.name()))?;
			let outcome = plugin.invoke(self, &action.args).await?;
			trace!(action = %action.name(), ?outcome, "action invoked");
			if outcome != Outcome::Failure {
				return Ok(outcome);
			}
		}
		Ok(if any { Outcome::Failure } else { Outcome::Success })
	}

	async fn guard_matches(&mut self, pattern: &str) -> Result<bool> {
		if !self.guards.contains_key(pattern) {
			let re = Regex::new(pattern).map_err(|e| Error::protocol(format!("guard {pattern:?}: {e}")))?;
			self.guards.insert(pattern.to_string(), re);
		}
		let buf = self.conn.buffered().await;
		Ok(self.guards.get(pattern).is_some_and(|re| re.is_match(&buf)))
	}

	/// Validate a received cell against the session identity and queue it.
	pub fn admit_cell(&mut self, cell: Cell) -> Result<Admission> {
		if cell.uuid != self.uuid {
			return Err(Error::UuidMismatch { expected: self.uuid, got: cell.uuid });
		}
		if self.instance_id == 0 {
			if cell.instance_id == 0 {
				return Err(Error::protocol("cell carries no instance id"));
			}
			self.set_instance_id(cell.instance_id);
			return Ok(Admission::Learned);
		}
		if cell.instance_id != self.instance_id {
			return Err(Error::InstanceIdMismatch { expected: self.instance_id, got: cell.instance_id });
		}
		trace!(stream_id = cell.stream_id, seq = cell.sequence_id, len = cell.payload.len(), "cell received");
		self.streams.enqueue(cell);
		Ok(Admission::Accepted)
	}

	/// Next cell of exactly `size` bytes, stamped with the session identity.
	/// A blocking caller waits up to the keepalive interval for stream data
	/// before settling for an empty cell.
	pub async fn outgoing_cell(&mut self, size: usize, blocking: bool) -> Result<Cell> {
		if self.instance_id == 0 {
			self.set_instance_id(random_instance_id());
		}
		let cell = match self.streams.dequeue(size) {
			Some(c) => c,
			None if blocking => {
				let notify = self.streams.write_notify();
				let deadline = Instant::now() + self.ctx.settings.keepalive;
				loop {
					let notified = notify.notified();
					tokio::pin!(notified);
					notified.as_mut().enable();
					if let Some(c) = self.streams.dequeue(size) {
						break c;
					}
					if tokio::time::timeout_at(deadline, notified).await.is_err() {
						break Cell::empty(size);
					}
				}
			}
			None => Cell::empty(size),
		};
		trace!(stream_id = cell.stream_id, seq = cell.sequence_id, len = cell.payload.len(), "cell sent");
		Ok(cell.with_length(size).with_identity(self.uuid, self.instance_id))
	}

	/// Drive the session until it dies or fails.
	pub async fn execute(&mut self) -> Result<()> {
		info!(party = %self.party, uuid = self.uuid, depth = self.depth, "session started");
		let settings = self.ctx.settings.clone();
		let mut retries = 0u32;
		let mut last_progress = Instant::now();
		loop {
			let stalled = match self.next().await {
				Ok(Step::Dead) => {
					info!(party = %self.party, steps = self.step_count, "session finished");
					return Ok(());
				}
				Ok(Step::Advanced) => {
					retries = 0;
					last_progress = Instant::now();
					continue;
				}
				Ok(Step::Retry) => {
					retries += 1;
					if retries == 1 {
						tokio::task::yield_now().await;
						continue;
					}
					self.conn.fill(Some(settings.retry_interval)).await.err()
				}
				Err(Error::NoTransition(state)) => {
					trace!(party = %self.party, state = %state, "no transition, waiting for input");
					let wait = settings.read_timeout.map(|t| t.saturating_sub(last_progress.elapsed()));
					self.conn.fill(wait).await.err()
				}
				Err(e) => return Err(e),
			};
			match stalled {
				None => {}
				Some(e) if e.is_timeout() => {}
				Some(e) => return Err(e),
			}
			if let Some(limit) = settings.read_timeout {
				if last_progress.elapsed() >= limit {
					return Err(Error::Timeout);
				}
			}
		}
	}
}

/// Candidate transitions out of `state`, error transitions last.
///
/// Without a PRNG every transition with non-zero probability is a candidate.
/// With one, a single outgoing transition is taken without a draw; otherwise
/// one uniform draw picks a transition by cumulative probability, falling
/// back to the last one.
pub fn choose_transitions(doc: &Document, state: &str, rng: Option<&mut ChaCha20Rng>) -> Vec<Transition> {
	let (normal, errors): (Vec<&Transition>, Vec<&Transition>) = doc.transitions_from(state).partition(|t| !t.is_error);
	let mut out: Vec<Transition> = match rng {
		None => normal.iter().filter(|t| t.probability > 0.0).map(|t| (*t).clone()).collect(),
		Some(_) if normal.len() <= 1 => normal.iter().map(|t| (*t).clone()).collect(),
		Some(rng) => {
			let coin: f64 = rng.gen();
			let mut mass = 0.0;
			let chosen = normal
				.iter()
				.find(|t| {
					mass += t.probability;
					mass >= coin
				})
				.or(normal.last());
			chosen.map(|t| (*t).clone()).into_iter().collect()
		}
	};
	out.extend(errors.into_iter().cloned());
	out
}

fn random_instance_id() -> u32 {
	rand::thread_rng().gen_range(1..=u32::MAX)
}
