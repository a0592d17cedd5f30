#![forbid(unsafe_code)]

//! Copy bytes between a logical stream and a plain TCP connection.

use crate::error::{Error, Result};
use marionette_stream::Stream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

const CHUNK: usize = 16 * 1024;

/// Runs until both directions finish. EOF on either side is forwarded as a
/// half-close; the stream is fully closed on return.
pub async fn bridge(stream: Stream, tcp: TcpStream) -> Result<()> {
	let id = stream.id();
	let (mut rd, mut wr) = tcp.into_split();
	let up = async {
		let mut buf = vec![0u8; CHUNK];
		loop {
			let n = rd.read(&mut buf).await?;
			if n == 0 {
				stream.close_write();
				return Ok::<(), Error>(());
			}
			stream.write_all(&buf[..n]).await?;
			trace!(stream_id = id, n, "proxy up");
		}
	};
	let down = async {
		let mut buf = vec![0u8; CHUNK];
		loop {
			let n = stream.read(&mut buf).await?;
			if n == 0 {
				wr.shutdown().await?;
				return Ok::<(), Error>(());
			}
			wr.write_all(&buf[..n]).await?;
			trace!(stream_id = id, n, "proxy down");
		}
	};
	let res = tokio::try_join!(up, down);
	stream.close();
	res.map(|_| ())
}
