#![forbid(unsafe_code)]

//! Server side: one state machine per accepted connection, all feeding a
//! single stream set.

use crate::conn::Conn;
use crate::context::EngineContext;
use crate::error::{Error, Result};
use crate::fsm::Fsm;
use marionette_core::{Document, Party, Transport};
use marionette_stream::{Stream, StreamSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Listener {
	local_addr: SocketAddr,
	streams: StreamSet,
	incoming: Mutex<mpsc::UnboundedReceiver<Stream>>,
	task: JoinHandle<()>,
}

impl Listener {
	/// Bind `addr` and start accepting. The document is checked against the
	/// plugin registry before anything is accepted.
	pub async fn bind(ctx: EngineContext, doc: Arc<Document>, addr: impl ToSocketAddrs) -> Result<Self> {
		if doc.transport == Transport::Udp {
			return Err(Error::unsupported("udp transport"));
		}
		ctx.plugins.validate(&doc)?;
		let tcp = TcpListener::bind(addr).await?;
		let local_addr = tcp.local_addr()?;
		let (streams, incoming) = StreamSet::with_accept_queue();
		let task = tokio::spawn(accept_loop(ctx, doc, tcp, streams.clone()));
		info!(%local_addr, "listening");
		Ok(Self { local_addr, streams, incoming: Mutex::new(incoming), task })
	}

	/// Next stream opened by any connected client.
	pub async fn accept(&self) -> Result<Stream> {
		self.incoming.lock().await.recv().await.ok_or(Error::ConnectionClosed)
	}

	pub fn local_addr(&self) -> SocketAddr { self.local_addr }

	pub fn streams(&self) -> &StreamSet { &self.streams }

	/// Stop accepting, end every session and close every stream.
	pub fn close(&self) {
		self.task.abort();
		self.streams.close();
		debug!(local_addr = %self.local_addr, "listener closed");
	}
}

impl Drop for Listener {
	fn drop(&mut self) { self.task.abort(); }
}

async fn accept_loop(ctx: EngineContext, doc: Arc<Document>, tcp: TcpListener, streams: StreamSet) {
	let mut sessions = JoinSet::new();
	loop {
		tokio::select! {
			accepted = tcp.accept() => match accepted {
				Ok((sock, peer)) => {
					let _ = sock.set_nodelay(true);
					let fsm = Fsm::new(ctx.clone(), doc.clone(), Party::Server, Conn::new(sock), streams.clone());
					sessions.spawn(run_session(fsm, peer));
				}
				Err(e) => {
					warn!(error = %e, "accept failed");
					tokio::time::sleep(ACCEPT_BACKOFF).await;
				}
			},
			Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
		}
	}
}

/// Execute one session to completion and shut its connection down.
pub(crate) async fn run_session(mut fsm: Fsm, peer: SocketAddr) {
	info!(%peer, party = %fsm.party(), "session opened");
	match fsm.execute().await {
		Ok(()) => {}
		Err(e) if e.is_fatal() => error!(%peer, error = %e, "session aborted"),
		Err(Error::ConnectionClosed) => debug!(%peer, state = fsm.state(), "peer closed the connection"),
		Err(e) => warn!(%peer, state = fsm.state(), error = %e, "session failed"),
	}
	let _ = fsm.conn().shutdown().await;
}
