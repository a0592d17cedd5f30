use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
	#[error("config: {0}")]
	Config(String),
	#[error("document: {0}")]
	Document(String),
	#[error("format not found: {0}")]
	FormatNotFound(String),
}

impl Error {
	pub fn config(msg: impl Into<String>) -> Self { Self::Config(msg.into()) }
	pub fn document(msg: impl Into<String>) -> Self { Self::Document(msg.into()) }
}
