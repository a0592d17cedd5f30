#![forbid(unsafe_code)]

//! Client side: a driver task keeps one physical connection at a time open
//! to the server and runs a state machine over it.

use crate::conn::Conn;
use crate::context::EngineContext;
use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::listener::run_session;
use marionette_core::{Document, Party, Transport};
use marionette_stream::{Stream, StreamSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Dialer {
	addr: SocketAddr,
	streams: StreamSet,
	task: JoinHandle<()>,
}

impl Dialer {
	pub fn connect(ctx: EngineContext, doc: Arc<Document>, addr: SocketAddr) -> Result<Self> {
		if doc.transport == Transport::Udp {
			return Err(Error::unsupported("udp transport"));
		}
		ctx.plugins.validate(&doc)?;
		let streams = StreamSet::new();
		let task = tokio::spawn(drive(ctx, doc, addr, streams.clone()));
		info!(%addr, "dialer started");
		Ok(Self { addr, streams, task })
	}

	/// Open a new logical stream to the server.
	pub fn dial(&self) -> Result<Stream> {
		let stream = self.streams.create()?;
		debug!(stream_id = stream.id(), "stream opened");
		Ok(stream)
	}

	pub fn addr(&self) -> SocketAddr { self.addr }

	pub fn streams(&self) -> &StreamSet { &self.streams }

	pub fn close(&self) {
		self.task.abort();
		self.streams.close();
		debug!(addr = %self.addr, "dialer closed");
	}
}

impl Drop for Dialer {
	fn drop(&mut self) { self.task.abort(); }
}

async fn drive(ctx: EngineContext, doc: Arc<Document>, addr: SocketAddr, streams: StreamSet) {
	let delay = ctx.settings.redial_delay;
	while !streams.is_closed() {
		match TcpStream::connect(addr).await {
			Ok(sock) => {
				let _ = sock.set_nodelay(true);
				let fsm = Fsm::new(ctx.clone(), doc.clone(), Party::Client, Conn::new(sock), streams.clone());
				run_session(fsm, addr).await;
				tokio::task::yield_now().await;
			}
			Err(e) => {
				warn!(%addr, error = %e, "connect failed");
				tokio::time::sleep(delay).await;
			}
		}
	}
}
