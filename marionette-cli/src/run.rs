//! Long-running modes of the binary.

use crate::pt;
use crate::socks5;
use anyhow::{bail, Context};
use marionette_core::{Document, FormatSpec, FormatStore, MarionetteConfig};
use marionette_engine::{proxy, Dialer, EngineContext, EngineSettings, Listener};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

fn format_store(cfg: &MarionetteConfig) -> FormatStore {
	match &cfg.format_dir {
		Some(dir) => FormatStore::with_dir(dir),
		None => FormatStore::builtin(),
	}
}

fn engine(cfg: &MarionetteConfig) -> anyhow::Result<(EngineContext, Arc<Document>)> {
	let ctx = EngineContext::new(EngineSettings::from(&cfg.engine)).with_formats(format_store(cfg));
	let spec = FormatSpec::parse(&cfg.format)?;
	let (id, doc) = ctx.formats.load(&spec).with_context(|| format!("loading format {spec}"))?;
	ctx.plugins.validate(&doc).with_context(|| format!("format {id}"))?;
	info!(format = %id, "format loaded");
	Ok((ctx, Arc::new(doc)))
}

fn socket_addr(key: &str, value: &str) -> anyhow::Result<SocketAddr> {
	value.parse().with_context(|| format!("invalid {key} {value:?}"))
}

pub fn formats(cfg: &MarionetteConfig) -> anyhow::Result<()> {
	for id in format_store(cfg).list()? {
		println!("{id}");
	}
	Ok(())
}

/// Local plaintext connections, each tunnelled as one stream.
pub async fn client(cfg: MarionetteConfig) -> anyhow::Result<()> {
	let (ctx, doc) = engine(&cfg)?;
	let server = socket_addr("client.server", &cfg.client.server)?;
	let dialer = Dialer::connect(ctx, doc, server)?;
	let local = TcpListener::bind(&cfg.client.bind).await.with_context(|| format!("binding {}", cfg.client.bind))?;
	info!(bind = %local.local_addr()?, %server, "client ready");
	loop {
		let (sock, peer) = tokio::select! {
			accepted = local.accept() => accepted?,
			_ = tokio::signal::ctrl_c() => break,
		};
		let stream = dialer.dial()?;
		debug!(%peer, stream_id = stream.id(), "tunnelling connection");
		tokio::spawn(async move {
			if let Err(e) = proxy::bridge(stream, sock).await {
				debug!(%peer, error = %e, "bridge ended");
			}
		});
	}
	dialer.close();
	info!("client stopped");
	Ok(())
}

/// Every decoded stream is forwarded to `server.proxy`.
pub async fn server(cfg: MarionetteConfig) -> anyhow::Result<()> {
	let (ctx, doc) = engine(&cfg)?;
	let upstream = socket_addr("server.proxy", &cfg.server.proxy)?;
	let listener = Listener::bind(ctx, doc, &cfg.server.bind).await.with_context(|| format!("binding {}", cfg.server.bind))?;
	info!(bind = %listener.local_addr(), proxy = %upstream, "server ready");
	forward_streams(&listener, upstream).await?;
	listener.close();
	info!("server stopped");
	Ok(())
}

async fn forward_streams(listener: &Listener, upstream: SocketAddr) -> anyhow::Result<()> {
	loop {
		let stream = tokio::select! {
			accepted = listener.accept() => accepted?,
			_ = tokio::signal::ctrl_c() => return Ok(()),
		};
		tokio::spawn(async move {
			let id = stream.id();
			match TcpStream::connect(upstream).await {
				Ok(tcp) => {
					if let Err(e) = proxy::bridge(stream, tcp).await {
						debug!(stream_id = id, error = %e, "bridge ended");
					}
				}
				Err(e) => {
					warn!(stream_id = id, %upstream, error = %e, "proxy connect failed");
					stream.close();
				}
			}
		});
	}
}

fn env_lookup(key: &str) -> Option<String> {
	std::env::var(key).ok()
}

/// SOCKS5 front end; each CONNECT becomes a stream to the marionette server
/// named by the `server=` argument, or by the CONNECT target otherwise.
pub async fn pt_client(cfg: MarionetteConfig) -> anyhow::Result<()> {
	let env = match pt::client_env(env_lookup) {
		Ok(env) => env,
		Err(e) => {
			println!("{}", e.status_line());
			bail!(e);
		}
	};
	println!("{}", pt::version_line());
	if !env.enabled {
		println!("CMETHODS DONE");
		return Ok(());
	}
	let (ctx, doc) = engine(&cfg)?;
	let socks = TcpListener::bind(("127.0.0.1", 0)).await?;
	println!("{}", pt::cmethod_line(socks.local_addr()?));
	println!("CMETHODS DONE");

	let dialers: Arc<Mutex<HashMap<SocketAddr, Arc<Dialer>>>> = Arc::default();
	loop {
		let (mut sock, peer) = tokio::select! {
			accepted = socks.accept() => accepted?,
			_ = tokio::signal::ctrl_c() => break,
		};
		let (ctx, doc, dialers) = (ctx.clone(), doc.clone(), dialers.clone());
		tokio::spawn(async move {
			let stream = async {
				let req = socks5::handshake(&mut sock).await?;
				let server = match req.args.get("server") {
					Some(s) => socket_addr("server", s)?,
					None => req.target.resolve().await?,
				};
				let dialer = {
					let mut map = dialers.lock().await;
					match map.get(&server) {
						Some(d) => d.clone(),
						None => {
							let d = Arc::new(Dialer::connect(ctx, doc, server)?);
							map.insert(server, d.clone());
							d
						}
					}
				};
				Ok::<_, anyhow::Error>(dialer.dial()?)
			}
			.await;
			match stream {
				Ok(stream) => {
					if socks5::reply(&mut sock, socks5::REP_SUCCESS).await.is_ok() {
						if let Err(e) = proxy::bridge(stream, sock).await {
							debug!(%peer, error = %e, "bridge ended");
						}
					}
				}
				Err(e) => {
					warn!(%peer, error = %e, "socks request failed");
					let _ = socks5::reply(&mut sock, socks5::REP_GENERAL_FAILURE).await;
				}
			}
		});
	}
	for dialer in dialers.lock().await.values() {
		dialer.close();
	}
	Ok(())
}

/// Listens where Tor asks and forwards every stream to the OR port.
pub async fn pt_server(cfg: MarionetteConfig) -> anyhow::Result<()> {
	let env = match pt::server_env(env_lookup) {
		Ok(env) => env,
		Err(e) => {
			println!("{}", e.status_line());
			bail!(e);
		}
	};
	println!("{}", pt::version_line());
	if !env.enabled {
		println!("SMETHODS DONE");
		return Ok(());
	}
	let (ctx, doc) = engine(&cfg)?;
	let listener = match Listener::bind(ctx, doc, env.bind).await {
		Ok(l) => l,
		Err(e) => {
			println!("SMETHOD-ERROR {} {e}", pt::TRANSPORT);
			println!("SMETHODS DONE");
			return Err(e.into());
		}
	};
	println!("{}", pt::smethod_line(listener.local_addr()));
	println!("SMETHODS DONE");
	forward_streams(&listener, env.orport).await?;
	listener.close();
	Ok(())
}
