//! Tor pluggable-transport managed mode: environment parsing and the
//! stdout status lines.

use std::net::SocketAddr;

pub const TRANSPORT: &str = "marionette";
const PT_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PtError {
	#[error("no supported pluggable transport version")]
	Version,
	#[error("{0}")]
	Env(String),
}

impl PtError {
	/// The line Tor expects on stdout for this failure.
	pub fn status_line(&self) -> String {
		match self {
			PtError::Version => "VERSION-ERROR no-version".to_string(),
			PtError::Env(msg) => format!("ENV-ERROR {msg}"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEnv {
	/// Tor asked for this transport.
	pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEnv {
	pub enabled: bool,
	pub bind: SocketAddr,
	pub orport: SocketAddr,
}

fn check_version(get: &impl Fn(&str) -> Option<String>) -> Result<(), PtError> {
	let versions = get("TOR_PT_MANAGED_TRANSPORT_VER").ok_or(PtError::Version)?;
	if versions.split(',').any(|v| v.trim() == PT_VERSION) {
		Ok(())
	} else {
		Err(PtError::Version)
	}
}

fn requested(list: &str) -> bool {
	list.split(',').map(str::trim).any(|t| t == "*" || t == TRANSPORT)
}

/// Reads the client variables through `get`, normally `std::env::var(..).ok()`.
pub fn client_env(get: impl Fn(&str) -> Option<String>) -> Result<ClientEnv, PtError> {
	check_version(&get)?;
	let list = get("TOR_PT_CLIENT_TRANSPORTS").ok_or_else(|| PtError::Env("no TOR_PT_CLIENT_TRANSPORTS".into()))?;
	Ok(ClientEnv { enabled: requested(&list) })
}

pub fn server_env(get: impl Fn(&str) -> Option<String>) -> Result<ServerEnv, PtError> {
	check_version(&get)?;
	let list = get("TOR_PT_SERVER_TRANSPORTS").ok_or_else(|| PtError::Env("no TOR_PT_SERVER_TRANSPORTS".into()))?;
	let orport = get("TOR_PT_ORPORT")
		.ok_or_else(|| PtError::Env("no TOR_PT_ORPORT".into()))?
		.parse()
		.map_err(|e| PtError::Env(format!("bad TOR_PT_ORPORT: {e}")))?;
	let mut bind = SocketAddr::from(([0, 0, 0, 0], 0));
	if let Some(addrs) = get("TOR_PT_SERVER_BINDADDR") {
		for entry in addrs.split(',') {
			let Some((name, addr)) = entry.trim().split_once('-') else {
				return Err(PtError::Env(format!("bad TOR_PT_SERVER_BINDADDR entry {entry:?}")));
			};
			if name == TRANSPORT {
				bind = addr.parse().map_err(|e| PtError::Env(format!("bad bind address {addr:?}: {e}")))?;
			}
		}
	}
	Ok(ServerEnv { enabled: requested(&list), bind, orport })
}

pub fn version_line() -> String {
	format!("VERSION {PT_VERSION}")
}

pub fn cmethod_line(addr: SocketAddr) -> String {
	format!("CMETHOD {TRANSPORT} socks5 {addr}")
}

pub fn smethod_line(addr: SocketAddr) -> String {
	format!("SMETHOD {TRANSPORT} {addr}")
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		move |k| map.get(k).cloned()
	}

	#[test]
	fn version_must_be_offered() {
		assert_eq!(client_env(env(&[])), Err(PtError::Version));
		let e = client_env(env(&[("TOR_PT_MANAGED_TRANSPORT_VER", "2"), ("TOR_PT_CLIENT_TRANSPORTS", "*")]));
		assert_eq!(e.unwrap_err().status_line(), "VERSION-ERROR no-version");
	}

	#[test]
	fn client_transport_selection() {
		let on = client_env(env(&[("TOR_PT_MANAGED_TRANSPORT_VER", "1"), ("TOR_PT_CLIENT_TRANSPORTS", "obfs4,marionette")]));
		assert_eq!(on, Ok(ClientEnv { enabled: true }));
		let off = client_env(env(&[("TOR_PT_MANAGED_TRANSPORT_VER", "1"), ("TOR_PT_CLIENT_TRANSPORTS", "obfs4")]));
		assert_eq!(off, Ok(ClientEnv { enabled: false }));
		let missing = client_env(env(&[("TOR_PT_MANAGED_TRANSPORT_VER", "1")])).unwrap_err();
		assert!(missing.status_line().starts_with("ENV-ERROR "));
	}

	#[test]
	fn server_bind_and_orport() {
		let got = server_env(env(&[
			("TOR_PT_MANAGED_TRANSPORT_VER", "1"),
			("TOR_PT_SERVER_TRANSPORTS", "marionette"),
			("TOR_PT_SERVER_BINDADDR", "obfs4-0.0.0.0:1000,marionette-127.0.0.1:9001"),
			("TOR_PT_ORPORT", "127.0.0.1:9000"),
		]))
		.unwrap();
		assert!(got.enabled);
		assert_eq!(got.bind, "127.0.0.1:9001".parse().unwrap());
		assert_eq!(got.orport, "127.0.0.1:9000".parse().unwrap());

		let no_orport = server_env(env(&[("TOR_PT_MANAGED_TRANSPORT_VER", "1"), ("TOR_PT_SERVER_TRANSPORTS", "*")]));
		assert!(matches!(no_orport, Err(PtError::Env(_))));
	}

	#[test]
	fn status_lines() {
		let addr: SocketAddr = "127.0.0.1:5555".parse().unwrap();
		assert_eq!(version_line(), "VERSION 1");
		assert_eq!(cmethod_line(addr), "CMETHOD marionette socks5 127.0.0.1:5555");
		assert_eq!(smethod_line(addr), "SMETHOD marionette 127.0.0.1:5555");
	}
}
