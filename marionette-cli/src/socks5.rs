//! Minimal SOCKS5 server side for the pluggable-transport client: CONNECT
//! only, with either no authentication or the username/password method Tor
//! uses to pass transport arguments.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
	#[error("socks: {0}")]
	Protocol(String),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
	Socket(SocketAddr),
	Domain(String, u16),
}

impl Target {
	pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
		match self {
			Target::Socket(addr) => Ok(*addr),
			Target::Domain(host, port) => tokio::net::lookup_host((host.as_str(), *port))
				.await?
				.next()
				.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, format!("{host}: no address"))),
		}
	}
}

/// A completed CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
	pub target: Target,
	/// `key=value` pairs carried in the username/password fields.
	pub args: HashMap<String, String>,
}

/// Run the greeting and read the request. The caller answers with [`reply`].
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(io: &mut S) -> Result<Request> {
	let mut head = [0u8; 2];
	io.read_exact(&mut head).await?;
	if head[0] != VERSION {
		return Err(Error::Protocol(format!("unsupported version {}", head[0])));
	}
	let mut methods = vec![0u8; usize::from(head[1])];
	io.read_exact(&mut methods).await?;
	let method = if methods.contains(&AUTH_PASSWORD) {
		AUTH_PASSWORD
	} else if methods.contains(&AUTH_NONE) {
		AUTH_NONE
	} else {
		AUTH_NO_ACCEPTABLE
	};
	io.write_all(&[VERSION, method]).await?;
	if method == AUTH_NO_ACCEPTABLE {
		return Err(Error::Protocol("no acceptable auth method".into()));
	}

	let mut args = HashMap::new();
	if method == AUTH_PASSWORD {
		let ver = io.read_u8().await?;
		if ver != 0x01 {
			return Err(Error::Protocol(format!("auth version {ver}")));
		}
		let mut joined = read_short_field(io).await?;
		joined.extend(read_short_field(io).await?);
		args = parse_args(&String::from_utf8_lossy(&joined))?;
		io.write_all(&[0x01, 0x00]).await?;
	}

	let mut req = [0u8; 4];
	io.read_exact(&mut req).await?;
	if req[0] != VERSION {
		return Err(Error::Protocol("bad request version".into()));
	}
	let target = match req[3] {
		ATYP_IPV4 => {
			let mut ip = [0u8; 4];
			io.read_exact(&mut ip).await?;
			Target::Socket(SocketAddr::new(Ipv4Addr::from(ip).into(), io.read_u16().await?))
		}
		ATYP_IPV6 => {
			let mut ip = [0u8; 16];
			io.read_exact(&mut ip).await?;
			Target::Socket(SocketAddr::new(Ipv6Addr::from(ip).into(), io.read_u16().await?))
		}
		ATYP_DOMAIN => {
			let host = read_short_field(io).await?;
			Target::Domain(String::from_utf8_lossy(&host).into_owned(), io.read_u16().await?)
		}
		other => {
			reply(io, REP_ATYP_NOT_SUPPORTED).await?;
			return Err(Error::Protocol(format!("address type {other}")));
		}
	};
	if req[1] != CMD_CONNECT {
		reply(io, REP_CMD_NOT_SUPPORTED).await?;
		return Err(Error::Protocol(format!("command {}", req[1])));
	}
	Ok(Request { target, args })
}

/// Reply with a zero bind address.
pub async fn reply<S: AsyncWrite + Unpin>(io: &mut S, code: u8) -> Result<()> {
	io.write_all(&[VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]).await?;
	Ok(())
}

async fn read_short_field<S: AsyncRead + Unpin>(io: &mut S) -> Result<Vec<u8>> {
	let len = io.read_u8().await?;
	let mut buf = vec![0u8; usize::from(len)];
	io.read_exact(&mut buf).await?;
	Ok(buf)
}

/// `k=v;k=v` with `\` escaping `;`, `=` and `\`.
pub fn parse_args(src: &str) -> Result<HashMap<String, String>> {
	let mut out = HashMap::new();
	let mut pair = String::new();
	let mut chars = src.chars();
	let mut flush = |pair: &mut String| -> Result<()> {
		if pair.is_empty() {
			return Ok(());
		}
		let (k, v) = split_unescaped(pair).ok_or_else(|| Error::Protocol(format!("argument {pair:?} has no '='")))?;
		out.insert(k, v);
		pair.clear();
		Ok(())
	};
	while let Some(c) = chars.next() {
		match c {
			'\\' => {
				pair.push('\\');
				pair.extend(chars.next());
			}
			';' => flush(&mut pair)?,
			c => pair.push(c),
		}
	}
	flush(&mut pair)?;
	Ok(out)
}

fn split_unescaped(pair: &str) -> Option<(String, String)> {
	let mut key = String::new();
	let mut value = String::new();
	let mut in_value = false;
	let mut chars = pair.chars();
	while let Some(c) = chars.next() {
		let dst = if in_value { &mut value } else { &mut key };
		match c {
			'\\' => dst.extend(chars.next()),
			'=' if !in_value => in_value = true,
			c => dst.push(c),
		}
	}
	in_value.then_some((key, value))
}
