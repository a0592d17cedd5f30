//! Literal bytes on the connection.

use crate::error::Result;
use crate::fsm::Fsm;
use crate::plugin::{str_arg, ArgKind, Outcome, Plugin};
use async_trait::async_trait;
use marionette_core::ArgValue;
use tracing::trace;

/// `io.puts(data)`
pub struct Puts;

/// `io.gets(expected)`: consumes `expected` once it is fully buffered. A
/// buffered prefix of it asks for a retry; anything else fails.
pub struct Gets;

#[async_trait]
impl Plugin for Puts {
	fn signature(&self) -> &'static [ArgKind] { &[ArgKind::Str] }

	async fn invoke(&self, fsm: &mut Fsm, args: &[ArgValue]) -> Result<Outcome> {
		let data = str_arg("io.puts", args, 0)?;
		fsm.conn().write_all(data.as_bytes()).await?;
		trace!(len = data.len(), "io.puts");
		Ok(Outcome::Success)
	}
}

#[async_trait]
impl Plugin for Gets {
	fn signature(&self) -> &'static [ArgKind] { &[ArgKind::Str] }

	async fn invoke(&self, fsm: &mut Fsm, args: &[ArgValue]) -> Result<Outcome> {
		let expected = str_arg("io.gets", args, 0)?.as_bytes();
		let buf = fsm.conn().buffered().await;
		if buf.starts_with(expected) {
			fsm.conn().consume(expected.len()).await;
			trace!(len = expected.len(), "io.gets");
			return Ok(Outcome::Success);
		}
		if expected.starts_with(&buf) {
			return Ok(Outcome::Retry);
		}
		Ok(Outcome::Failure)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::conn::Conn;
	use crate::context::EngineContext;
	use marionette_core::Party;
	use marionette_stream::StreamSet;
	use std::sync::Arc;
	use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

	fn fsm() -> (Fsm, DuplexStream) {
		let ctx = EngineContext::default();
		let (_, doc) = ctx.formats.load(&"ftp_pasv".parse().unwrap()).unwrap();
		let (io, peer) = tokio::io::duplex(64);
		(Fsm::new(ctx, Arc::new(doc), Party::Client, Conn::new(io), StreamSet::new()), peer)
	}

	#[tokio::test]
	async fn gets_waits_for_the_whole_literal() {
		let (mut fsm, mut peer) = fsm();
		let args = [ArgValue::Str("220 ready\r\n".into())];
		assert_eq!(Gets.invoke(&mut fsm, &args).await.unwrap(), Outcome::Retry);

		peer.write_all(b"220 re").await.unwrap();
		fsm.conn().fill(None).await.unwrap();
		assert_eq!(Gets.invoke(&mut fsm, &args).await.unwrap(), Outcome::Retry);

		peer.write_all(b"ady\r\nUSER").await.unwrap();
		fsm.conn().fill_to(15, None).await.unwrap();
		assert_eq!(Gets.invoke(&mut fsm, &args).await.unwrap(), Outcome::Success);
		assert_eq!(&fsm.conn().buffered().await[..], b"USER");
		assert_eq!(Gets.invoke(&mut fsm, &args).await.unwrap(), Outcome::Failure);
		assert_eq!(&fsm.conn().buffered().await[..], b"USER");
	}

	#[tokio::test]
	async fn puts_writes_verbatim() {
		let (mut fsm, mut peer) = fsm();
		let args = [ArgValue::Str("PASV\r\n".into())];
		assert_eq!(Puts.invoke(&mut fsm, &args).await.unwrap(), Outcome::Success);
		let mut buf = [0u8; 6];
		peer.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"PASV\r\n");
	}
}
