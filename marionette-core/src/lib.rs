#![forbid(unsafe_code)]
//! Marionette core: the parsed document model, configuration and format storage
//! shared by the stream, cipher and engine layers.

pub mod config;
pub mod document;
pub mod error;
pub mod format;

pub use config::{ClientConfig, EngineConfig, MarionetteConfig, ServerConfig};
pub use document::{Action, ArgValue, Document, Party, Port, Transition, Transport};
pub use error::{Error, Result};
pub use format::{FormatId, FormatSpec, FormatStore};
