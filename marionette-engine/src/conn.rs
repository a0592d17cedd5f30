//! Buffered physical connection shared by a state machine and its children.

use crate::error::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::trace;

const READ_CHUNK: usize = 16 * 1024;

/// Anything that can carry cover traffic.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

pub type BoxedIo = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Conn {
	inner: Arc<Mutex<Inner>>,
}

struct Inner {
	io: BoxedIo,
	buf: BytesMut,
	eof: bool,
}

impl std::fmt::Debug for Conn {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Conn").finish_non_exhaustive()
	}
}

impl Conn {
	pub fn new<T>(io: T) -> Self
	where
		T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		Self { inner: Arc::new(Mutex::new(Inner { io: Box::new(io), buf: BytesMut::new(), eof: false })) }
	}

	/// Copy of the received but unconsumed bytes.
	pub async fn buffered(&self) -> Bytes {
		Bytes::copy_from_slice(&self.inner.lock().await.buf)
	}

	pub async fn buffered_len(&self) -> usize {
		self.inner.lock().await.buf.len()
	}

	pub async fn is_eof(&self) -> bool {
		self.inner.lock().await.eof
	}

	/// One read from the transport into the buffer. `None` waits indefinitely.
	pub async fn fill(&self, timeout: Option<Duration>) -> Result<usize> {
		let mut guard = self.inner.lock().await;
		let inner = &mut *guard;
		if inner.eof {
			return Err(Error::ConnectionClosed);
		}
		inner.buf.reserve(READ_CHUNK);
		let read = inner.io.read_buf(&mut inner.buf);
		let n = match timeout {
			Some(d) => tokio::time::timeout(d, read).await.map_err(|_| Error::Timeout)??,
			None => read.await?,
		};
		if n == 0 {
			inner.eof = true;
			return Err(Error::ConnectionClosed);
		}
		trace!(n, buffered = inner.buf.len(), "connection filled");
		Ok(n)
	}

	/// Read until at least `n` bytes are buffered.
	pub async fn fill_to(&self, n: usize, timeout: Option<Duration>) -> Result<()> {
		let run = async {
			while self.buffered_len().await < n {
				self.fill(None).await?;
			}
			Ok::<(), Error>(())
		};
		match timeout {
			Some(d) => tokio::time::timeout(d, run).await.map_err(|_| Error::Timeout)?,
			None => run.await,
		}
	}

	pub async fn consume(&self, n: usize) {
		let mut inner = self.inner.lock().await;
		let n = n.min(inner.buf.len());
		inner.buf.advance(n);
	}

	/// Write everything, retrying writes that time out.
	pub async fn write_all(&self, data: &[u8]) -> Result<()> {
		let mut inner = self.inner.lock().await;
		let mut off = 0;
		while off < data.len() {
			match inner.io.write(&data[off..]).await {
				Ok(0) => return Err(Error::ConnectionClosed),
				Ok(n) => off += n,
				Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
					tokio::task::yield_now().await;
				}
				Err(e) => return Err(e.into()),
			}
		}
		inner.io.flush().await?;
		trace!(len = data.len(), "connection wrote");
		Ok(())
	}

	pub async fn shutdown(&self) -> Result<()> {
		let mut inner = self.inner.lock().await;
		inner.io.shutdown().await?;
		Ok(())
	}
}
