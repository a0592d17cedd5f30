#![forbid(unsafe_code)]
//! Marionette protocol engine.
//!
//! A [`Fsm`] walks the transition graph of one [`Document`] over one physical
//! connection, invoking plugins from the [`PluginRegistry`] to move cells
//! between the connection and a [`StreamSet`]. [`Listener`] and [`Dialer`]
//! run one state machine per connection and expose the multiplexed streams.
//!
//! [`Document`]: marionette_core::Document
//! [`StreamSet`]: marionette_stream::StreamSet

pub mod conn;
pub mod context;
pub mod dialer;
pub mod error;
pub mod fsm;
pub mod listener;
pub mod plugin;
pub mod plugins;
pub mod proxy;

pub use conn::Conn;
pub use context::{EngineContext, EngineSettings};
pub use dialer::Dialer;
pub use error::{Error, Result};
pub use fsm::{Fsm, Step};
pub use listener::Listener;
pub use plugin::{ArgKind, Outcome, Plugin, PluginRegistry};
