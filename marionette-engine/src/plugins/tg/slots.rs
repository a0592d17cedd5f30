//! Filling and reading individual template slots.

use super::grammar::SlotKind;
use crate::error::{Error, Result};
use crate::fsm::Fsm;
use marionette_cipher::Error as CipherError;
use marionette_core::ArgValue;
use num_bigint::BigUint;
use rand::Rng;

/// Cell bytes one carrier slot holds.
pub fn carrier_capacity(fsm: &mut Fsm, slot: &SlotKind) -> Result<usize> {
	match *slot {
		SlotKind::Ranker { regex, msg_len } => Ok(fsm.dfa(regex, msg_len)?.capacity()),
		SlotKind::Fte { regex, msg_len } => Ok(fsm.cipher(regex, msg_len)?.capacity()),
		_ => Ok(0),
	}
}

/// Cover text for `chunk`, which is exactly the slot's capacity long.
pub fn encode_carrier(fsm: &mut Fsm, slot: &SlotKind, chunk: &[u8]) -> Result<Vec<u8>> {
	match *slot {
		SlotKind::Ranker { regex, msg_len } => {
			let dfa = fsm.dfa(regex, msg_len)?;
			Ok(dfa.unrank(&BigUint::from_bytes_be(chunk))?.into_bytes())
		}
		SlotKind::Fte { regex, msg_len } => Ok(fsm.cipher(regex, msg_len)?.encrypt(chunk)?),
		_ => Err(Error::protocol("slot does not carry cell data")),
	}
}

/// Inverse of [`encode_carrier`]. `Ok(None)` when the text is not valid
/// cover for this slot.
pub fn decode_carrier(fsm: &mut Fsm, slot: &SlotKind, text: &[u8]) -> Result<Option<Vec<u8>>> {
	let decoded = match *slot {
		SlotKind::Ranker { regex, msg_len } => {
			let dfa = fsm.dfa(regex, msg_len)?;
			let capacity = dfa.capacity();
			let Ok(word) = std::str::from_utf8(text) else { return Ok(None) };
			dfa.rank(word).and_then(|n| {
				let bytes = n.to_bytes_be();
				if bytes.len() > capacity {
					return Err(CipherError::malformed("rank exceeds slot capacity"));
				}
				let mut out = vec![0; capacity - bytes.len()];
				out.extend_from_slice(&bytes);
				Ok(out)
			})
		}
		SlotKind::Fte { regex, msg_len } => fsm.cipher(regex, msg_len)?.decrypt(text).and_then(|(pt, rest)| {
			if rest.is_empty() {
				Ok(pt)
			} else {
				Err(CipherError::malformed("trailing bytes after ciphertext"))
			}
		}),
		_ => return Err(Error::protocol("slot does not carry cell data")),
	};
	match decoded {
		Ok(bytes) => Ok(Some(bytes)),
		Err(CipherError::Malformed(_) | CipherError::Incomplete) => Ok(None),
		Err(e) => Err(e.into()),
	}
}

/// Value of a slot backed by session state when sending. Carriers and
/// derived lengths return `None`.
pub fn render_var(fsm: &mut Fsm, slot: &SlotKind) -> Result<Option<Vec<u8>>> {
	match *slot {
		SlotKind::PasvPort { var } => {
			let port = fsm
				.var(var)
				.and_then(ArgValue::as_int)
				.and_then(|p| u16::try_from(p).ok())
				.ok_or_else(|| Error::protocol(format!("session variable {var} holds no port")))?;
			Ok(Some(format!("{},{}", port >> 8, port & 0xff).into_bytes()))
		}
		SlotKind::DnsTransactionId { var } => {
			let id = match fsm.var(var).and_then(ArgValue::as_int).and_then(|v| u16::try_from(v).ok()) {
				Some(id) => id,
				None => {
					let id: u16 = rand::thread_rng().gen();
					fsm.set_var(var, ArgValue::Int(i64::from(id)));
					id
				}
			};
			Ok(Some(id.to_be_bytes().to_vec()))
		}
		_ => Ok(None),
	}
}

/// Check or learn a session-backed slot from a received message. `false`
/// means the message does not belong to this session.
pub fn absorb_var(fsm: &mut Fsm, slot: &SlotKind, value: &[u8]) -> bool {
	match *slot {
		SlotKind::PasvPort { var } => match parse_pasv(value) {
			Some(port) => {
				fsm.set_var(var, ArgValue::Int(i64::from(port)));
				true
			}
			None => false,
		},
		SlotKind::DnsTransactionId { var } => {
			let [hi, lo] = value else { return false };
			let id = u16::from_be_bytes([*hi, *lo]);
			match fsm.var(var).and_then(ArgValue::as_int) {
				Some(known) => known == i64::from(id),
				None => {
					fsm.set_var(var, ArgValue::Int(i64::from(id)));
					true
				}
			}
		}
		SlotKind::ContentLength { .. } => std::str::from_utf8(value).ok().and_then(|s| s.parse::<usize>().ok()).is_some(),
		_ => true,
	}
}

fn parse_pasv(value: &[u8]) -> Option<u16> {
	let text = std::str::from_utf8(value).ok()?;
	let (hi, lo) = text.split_once(',')?;
	let hi: u8 = hi.trim().parse().ok()?;
	let lo: u8 = lo.trim().parse().ok()?;
	Some(u16::from(hi) << 8 | u16::from(lo))
}
