//! Cells encoded with a format-transforming cipher.

use crate::error::Result;
use crate::fsm::{Admission, Fsm};
use crate::plugin::{str_arg, usize_arg, ArgKind, Outcome, Plugin};
use async_trait::async_trait;
use marionette_cipher::Error as CipherError;
use marionette_core::ArgValue;
use marionette_stream::Cell;
use tracing::trace;

/// `fte.send(regex, msg_len)` and `fte.send_async(regex, msg_len)`.
///
/// The blocking form waits up to the keepalive interval for stream data; the
/// async form sends an empty cell right away when nothing is pending.
pub struct Send {
	pub blocking: bool,
}

/// `fte.recv(regex, msg_len)` and `fte.recv_async(regex, msg_len)`.
///
/// With no complete message buffered the blocking form retries and the async
/// form fails, letting the state machine look at other transitions.
pub struct Recv {
	pub blocking: bool,
}

#[async_trait]
impl Plugin for Send {
	fn signature(&self) -> &'static [ArgKind] { &[ArgKind::Str, ArgKind::Int] }

	async fn invoke(&self, fsm: &mut Fsm, args: &[ArgValue]) -> Result<Outcome> {
		let regex = str_arg("fte.send", args, 0)?;
		let msg_len = usize_arg("fte.send", args, 1)?;
		let cipher = fsm.cipher(regex, msg_len)?;
		let cell = fsm.outgoing_cell(cipher.capacity(), self.blocking).await?;
		let ciphertext = cipher.encrypt(&cell.marshal()?)?;
		fsm.conn().write_all(&ciphertext).await?;
		trace!(blocking = self.blocking, len = ciphertext.len(), "fte.send");
		Ok(Outcome::Success)
	}
}

#[async_trait]
impl Plugin for Recv {
	fn signature(&self) -> &'static [ArgKind] { &[ArgKind::Str, ArgKind::Int] }

	async fn invoke(&self, fsm: &mut Fsm, args: &[ArgValue]) -> Result<Outcome> {
		let regex = str_arg("fte.recv", args, 0)?;
		let msg_len = usize_arg("fte.recv", args, 1)?;
		let cipher = fsm.cipher(regex, msg_len)?;
		let buf = fsm.conn().buffered().await;
		let (plaintext, consumed) = match cipher.decrypt(&buf) {
			Ok((pt, rest)) => (pt, buf.len() - rest.len()),
			Err(CipherError::Incomplete) if self.blocking => return Ok(Outcome::Retry),
			Err(CipherError::Incomplete | CipherError::Malformed(_)) => return Ok(Outcome::Failure),
			Err(e) => return Err(e.into()),
		};
		let cell = Cell::unmarshal(&plaintext)?;
		match fsm.admit_cell(cell)? {
			Admission::Learned => Ok(Outcome::Retry),
			Admission::Accepted => {
				fsm.conn().consume(consumed).await;
				trace!(blocking = self.blocking, len = consumed, "fte.recv");
				Ok(Outcome::Success)
			}
		}
	}
}
