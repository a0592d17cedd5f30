//! Format storage: document blobs addressed by `name[:version]`.
//!
//! Built-in formats are compiled into the binary. An optional directory laid
//! out as `<dir>/<name>/<version>.toml` extends them and wins on conflicts.

use crate::document::Document;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

const BUILTIN: &[(&str, &str, &str)] = &[
	("dummy", "20150701", include_str!("../formats/dummy/20150701.toml")),
	("http_simple_blocking", "20150701", include_str!("../formats/http_simple_blocking/20150701.toml")),
	("http_timings", "20150701", include_str!("../formats/http_timings/20150701.toml")),
	("ftp_pasv", "20150701", include_str!("../formats/ftp_pasv/20150701.toml")),
	("dns_request", "20150701", include_str!("../formats/dns_request/20150701.toml")),
	("spawn_http", "20150701", include_str!("../formats/spawn_http/20150701.toml")),
];

/// A `name[:version]` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSpec {
	pub name: String,
	pub version: Option<String>,
}

impl FormatSpec {
	pub fn parse(s: &str) -> Result<Self> {
		let s = s.trim();
		let (name, version) = match s.split_once(':') {
			Some((n, v)) => (n, Some(v)),
			None => (s, None),
		};
		if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
			return Err(Error::config(format!("invalid format name: {s:?}")));
		}
		if let Some(v) = version {
			if v.is_empty() || v.contains(['/', '\\']) || v.starts_with('.') {
				return Err(Error::config(format!("invalid format version: {s:?}")));
			}
		}
		Ok(Self { name: name.to_string(), version: version.map(str::to_string) })
	}
}

impl FromStr for FormatSpec {
	type Err = Error;
	fn from_str(s: &str) -> Result<Self> { Self::parse(s) }
}

impl fmt::Display for FormatSpec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.version {
			Some(v) => write!(f, "{}:{}", self.name, v),
			None => f.write_str(&self.name),
		}
	}
}

/// A concrete, resolved format.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FormatId {
	pub name: String,
	pub version: String,
}

impl fmt::Display for FormatId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.name, self.version)
	}
}

#[derive(Debug, Clone, Default)]
pub struct FormatStore {
	dir: Option<PathBuf>,
}

impl FormatStore {
	/// Built-in formats only.
	pub fn builtin() -> Self { Self { dir: None } }

	/// Built-ins plus `<dir>/<name>/<version>.toml`.
	pub fn with_dir(dir: impl Into<PathBuf>) -> Self { Self { dir: Some(dir.into()) } }

	pub fn dir(&self) -> Option<&Path> { self.dir.as_deref() }

	/// All known formats, sorted by name then version.
	pub fn list(&self) -> Result<Vec<FormatId>> {
		Ok(self.catalog()?.into_keys().collect())
	}

	/// Raw document bytes. Without a version the newest one is returned.
	pub fn lookup(&self, spec: &FormatSpec) -> Result<(FormatId, Vec<u8>)> {
		let catalog = self.catalog()?;
		let found = match &spec.version {
			Some(v) => catalog.into_iter().find(|(id, _)| id.name == spec.name && &id.version == v),
			None => catalog.into_iter().filter(|(id, _)| id.name == spec.name).last(),
		};
		let (id, blob) = found.ok_or_else(|| Error::FormatNotFound(spec.to_string()))?;
		let bytes = match blob {
			Blob::Static(s) => s.as_bytes().to_vec(),
			Blob::File(path) => fs::read(&path)?,
		};
		debug!(format = %id, len = bytes.len(), "format resolved");
		Ok((id, bytes))
	}

	/// Resolve and parse a document.
	pub fn load(&self, spec: &FormatSpec) -> Result<(FormatId, Document)> {
		let (id, bytes) = self.lookup(spec)?;
		let src = String::from_utf8(bytes).map_err(|e| Error::document(format!("{id}: not utf-8: {e}")))?;
		let doc = Document::from_toml(&src).map_err(|e| Error::document(format!("{id}: {e}")))?;
		Ok((id, doc))
	}

	fn catalog(&self) -> Result<BTreeMap<FormatId, Blob>> {
		let mut out = BTreeMap::new();
		for (name, version, src) in BUILTIN {
			out.insert(FormatId { name: (*name).into(), version: (*version).into() }, Blob::Static(src));
		}
		let Some(dir) = &self.dir else { return Ok(out) };
		for entry in fs::read_dir(dir)? {
			let entry = entry?;
			if !entry.file_type()?.is_dir() { continue; }
			let name = entry.file_name().to_string_lossy().into_owned();
			for file in fs::read_dir(entry.path())? {
				let path = file?.path();
				if path.extension().and_then(|e| e.to_str()) != Some("toml") { continue; }
				let Some(version) = path.file_stem().and_then(|s| s.to_str()) else { continue };
				out.insert(FormatId { name: name.clone(), version: version.to_string() }, Blob::File(path.clone()));
			}
		}
		Ok(out)
	}
}

enum Blob {
	Static(&'static str),
	File(PathBuf),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn spec_parsing() {
		assert_eq!(FormatSpec::parse("dummy").unwrap(), FormatSpec { name: "dummy".into(), version: None });
		let s = FormatSpec::parse("http_simple_blocking:20150701").unwrap();
		assert_eq!(s.version.as_deref(), Some("20150701"));
		assert_eq!(s.to_string(), "http_simple_blocking:20150701");
		assert!(FormatSpec::parse("../etc").is_err());
		assert!(FormatSpec::parse("dummy:").is_err());
	}

	#[test]
	fn every_builtin_parses() {
		let store = FormatStore::builtin();
		for id in store.list().unwrap() {
			let spec = FormatSpec { name: id.name.clone(), version: Some(id.version.clone()) };
			store.load(&spec).unwrap_or_else(|e| panic!("{id}: {e}"));
		}
	}

	#[test]
	fn missing_format() {
		let err = FormatStore::builtin().lookup(&FormatSpec::parse("nope").unwrap()).unwrap_err();
		assert!(matches!(err, Error::FormatNotFound(_)));
	}
}
