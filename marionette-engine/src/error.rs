use marionette_cipher::Error as CipherError;
use marionette_stream::Error as StreamError;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Core(#[from] marionette_core::Error),
	#[error("stream: {0}")]
	Stream(#[from] StreamError),
	#[error("cipher: {0}")]
	Cipher(#[from] CipherError),
	#[error("model uuid mismatch: expected {expected:#010x}, got {got:#010x}")]
	UuidMismatch { expected: u32, got: u32 },
	#[error("instance id mismatch: expected {expected:#010x}, got {got:#010x}")]
	InstanceIdMismatch { expected: u32, got: u32 },
	#[error("no transition available from state {0:?}")]
	NoTransition(String),
	#[error("action block not found: {0}")]
	ActionBlockNotFound(String),
	#[error("plugin not found: {0}")]
	PluginNotFound(String),
	#[error("plugin already registered: {0}")]
	AlreadyRegistered(String),
	#[error("invalid arguments for {action}: {reason}")]
	InvalidArguments { action: String, reason: String },
	#[error("timeout")]
	Timeout,
	#[error("connection closed")]
	ConnectionClosed,
	#[error("protocol: {0}")]
	Protocol(String),
	#[error("unsupported: {0}")]
	Unsupported(String),
}

impl Error {
	pub fn protocol(msg: impl Into<String>) -> Self { Self::Protocol(msg.into()) }
	pub fn unsupported(msg: impl Into<String>) -> Self { Self::Unsupported(msg.into()) }
	pub fn invalid_args(action: impl Into<String>, reason: impl Into<String>) -> Self {
		Self::InvalidArguments { action: action.into(), reason: reason.into() }
	}

	/// Protocol violations that must tear the session down.
	pub fn is_fatal(&self) -> bool {
		matches!(
			self,
			Error::UuidMismatch { .. }
				| Error::InstanceIdMismatch { .. }
				| Error::Stream(StreamError::TruncatedCell | StreamError::InvalidCell(_))
		)
	}

	/// I/O timeouts, kept apart from hard I/O failures.
	pub fn is_timeout(&self) -> bool {
		match self {
			Error::Timeout | Error::Stream(StreamError::Timeout) => true,
			Error::Io(e) => matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock),
			_ => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classification() {
		assert!(Error::UuidMismatch { expected: 1, got: 2 }.is_fatal());
		assert!(Error::Stream(StreamError::TruncatedCell).is_fatal());
		assert!(!Error::NoTransition("start".into()).is_fatal());
		assert!(!Error::Timeout.is_fatal());
		assert!(Error::Timeout.is_timeout());
		assert!(Error::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)).is_timeout());
		assert!(!Error::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).is_timeout());
		assert!(!Error::ConnectionClosed.is_timeout());
	}
}
