#![forbid(unsafe_code)]
#![warn(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unreachable,
    clippy::todo,
    clippy::unimplemented
)]

//! Cipher capabilities consumed by the Marionette engine.
//!
//! The engine only sees the [`Cipher`], [`Dfa`] and [`CipherFactory`] traits.
//! Backends are looked up per `(regex, msg_len)` and memoised per session by
//! [`CipherCache`].

/// Cipher, DFA and factory traits plus the per-session cache.
pub mod cipher;
/// Fixed-alphabet regex ranking.
pub mod alphabet;
/// Hex framing cipher.
pub mod hex_frame;

pub use alphabet::AlphabetDfa;
pub use cipher::{Cipher, CipherCache, CipherFactory, DefaultCipherFactory, Dfa};
pub use hex_frame::HexFrameCipher;

/// Error type for cipher construction and transformation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("incomplete ciphertext")]
    /// More ciphertext is needed before anything can be decoded
    Incomplete,
    #[error("malformed ciphertext: {0}")]
    /// Input does not belong to the cipher's language
    Malformed(String),
    #[error("unsupported: {0}")]
    /// The regex or parameters cannot be served by this backend
    Unsupported(String),
    #[error("capacity exceeded: need {needed} bytes, have {available}")]
    /// Plaintext larger than one message can carry
    Capacity { needed: usize, available: usize },
}

impl Error {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}

/// Convenient Result alias for this crate.
pub type Result<T> = core::result::Result<T, Error>;
