//! Template-grammar cover traffic: `tg.send(grammar)` and `tg.recv(grammar)`.
//!
//! A grammar message is a template whose slots either carry cell bytes
//! (ranked into a regular language or encrypted with a format-transforming
//! cipher) or hold protocol fields derived from the message itself or from
//! session variables.

pub mod grammar;
pub mod slots;

use crate::error::{Error, Result};
use crate::fsm::{Admission, Fsm};
use crate::plugin::{str_arg, ArgKind, Outcome, Plugin};
use async_trait::async_trait;
use grammar::{Frame, Grammar, SlotKind, Template};
use marionette_core::ArgValue;
use marionette_stream::{Cell, CELL_HEADER_SIZE};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use tracing::trace;

pub struct Send;

pub struct Recv;

fn lookup(action: &str, args: &[ArgValue]) -> Result<Grammar> {
	let name = str_arg(action, args, 0)?;
	grammar::builtin(name).ok_or_else(|| Error::invalid_args(action, format!("unknown grammar {name:?}")))
}

/// Slots of `template` that carry cell bytes, in template order.
fn carriers<'g>(grammar: &'g Grammar, template: &Template) -> Vec<(String, &'g SlotKind)> {
	template
		.slots()
		.filter_map(|k| grammar.slot(k).filter(|s| s.is_carrier()).map(|s| (k.to_string(), s)))
		.collect()
}

/// Render one message of `grammar`, pulling a cell from the stream set when
/// the chosen template has carrier slots.
pub async fn render(fsm: &mut Fsm, grammar: &Grammar) -> Result<Vec<u8>> {
	let template = grammar
		.templates
		.choose(&mut rand::thread_rng())
		.ok_or_else(|| Error::protocol(format!("grammar {} has no templates", grammar.name)))?
		.clone();
	let mut values: HashMap<String, Vec<u8>> = HashMap::new();

	let carriers = carriers(grammar, &template);
	let mut capacities = Vec::with_capacity(carriers.len());
	for (_, slot) in &carriers {
		capacities.push(slots::carrier_capacity(fsm, slot)?);
	}
	let total: usize = capacities.iter().sum();
	if !carriers.is_empty() {
		if total < CELL_HEADER_SIZE {
			return Err(Error::unsupported(format!("grammar {} carries only {total} bytes", grammar.name)));
		}
		let cell = fsm.outgoing_cell(total, true).await?.marshal()?;
		let mut at = 0;
		for ((key, slot), cap) in carriers.iter().zip(&capacities) {
			values.insert(key.clone(), slots::encode_carrier(fsm, slot, &cell[at..at + cap])?);
			at += cap;
		}
	}

	for key in template.slots() {
		let Some(slot) = grammar.slot(key) else { continue };
		if let Some(v) = slots::render_var(fsm, slot)? {
			values.insert(key.to_string(), v);
		}
	}
	for key in template.slots() {
		if let Some(SlotKind::ContentLength { of }) = grammar.slot(key) {
			let len = values.get(*of).map_or(0, Vec::len);
			values.insert(key.to_string(), len.to_string().into_bytes());
		}
	}
	let length_keys: Vec<String> =
		template.slots().filter(|k| grammar.slot(k) == Some(&SlotKind::DnsLength)).map(str::to_string).collect();
	for key in &length_keys {
		values.insert(key.clone(), vec![0, 0]);
	}
	let missing = |k: String| Error::protocol(format!("grammar {}: no value for slot {k}", grammar.name));
	let mut msg = template.render(&values).map_err(missing)?;
	if !length_keys.is_empty() {
		let len = u16::try_from(msg.len() - 2).map_err(|_| Error::protocol("dns message too long"))?;
		for key in &length_keys {
			values.insert(key.clone(), len.to_be_bytes().to_vec());
		}
		msg = template.render(&values).map_err(missing)?;
	}
	Ok(msg)
}

/// What [`parse`] made of the head of the receive buffer.
#[derive(Debug)]
pub enum Parsed {
	/// A message of this many bytes matched, with the cell it carried.
	Message { len: usize, cell: Option<Cell> },
	Incomplete,
	NoMatch,
}

/// Frame and match one message of `grammar` at the head of `buf`,
/// absorbing its session fields into `fsm`.
pub fn parse(fsm: &mut Fsm, grammar: &Grammar, buf: &[u8]) -> Result<Parsed> {
	let len = match grammar.framing.frame(buf) {
		Frame::Complete(n) => n,
		Frame::Incomplete => return Ok(Parsed::Incomplete),
		Frame::Invalid => return Ok(Parsed::NoMatch),
	};
	let msg = &buf[..len];
	for template in &grammar.templates {
		let width = |k: &str| grammar.slot(k).and_then(SlotKind::width);
		let Some(values) = template.extract(msg, width) else { continue };
		let mut fields_ok = true;
		for key in template.slots() {
			if let Some(slot) = grammar.slot(key).filter(|s| !s.is_carrier()) {
				fields_ok &= slots::absorb_var(fsm, slot, &values[key]);
			}
		}
		if !fields_ok {
			return Ok(Parsed::NoMatch);
		}
		let carriers = carriers(grammar, template);
		if carriers.is_empty() {
			return Ok(Parsed::Message { len, cell: None });
		}
		let mut plaintext = Vec::new();
		for (key, slot) in &carriers {
			match slots::decode_carrier(fsm, slot, &values[key])? {
				Some(bytes) => plaintext.extend_from_slice(&bytes),
				None => return Ok(Parsed::NoMatch),
			}
		}
		return Ok(Parsed::Message { len, cell: Some(Cell::unmarshal(&plaintext)?) });
	}
	Ok(Parsed::NoMatch)
}

#[async_trait]
impl Plugin for Send {
	fn signature(&self) -> &'static [ArgKind] { &[ArgKind::Str] }

	async fn invoke(&self, fsm: &mut Fsm, args: &[ArgValue]) -> Result<Outcome> {
		let grammar = lookup("tg.send", args)?;
		let msg = render(fsm, &grammar).await?;
		fsm.conn().write_all(&msg).await?;
		trace!(grammar = grammar.name, len = msg.len(), "tg.send");
		Ok(Outcome::Success)
	}
}

#[async_trait]
impl Plugin for Recv {
	fn signature(&self) -> &'static [ArgKind] { &[ArgKind::Str] }

	async fn invoke(&self, fsm: &mut Fsm, args: &[ArgValue]) -> Result<Outcome> {
		let grammar = lookup("tg.recv", args)?;
		let buf = fsm.conn().buffered().await;
		let (len, cell) = match parse(fsm, &grammar, &buf)? {
			Parsed::Incomplete => return Ok(Outcome::Retry),
			Parsed::NoMatch => return Ok(Outcome::Failure),
			Parsed::Message { len, cell } => (len, cell),
		};
		if let Some(cell) = cell {
			if fsm.admit_cell(cell)? == Admission::Learned {
				return Ok(Outcome::Retry);
			}
		}
		fsm.conn().consume(len).await;
		trace!(grammar = grammar.name, len, "tg.recv");
		Ok(Outcome::Success)
	}
}
