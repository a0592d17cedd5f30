#![forbid(unsafe_code)]
//! Marionette stream layer.
//!
//! Application bytes are written into a [`Stream`], cut into [`Cell`]s by
//! [`StreamSet::dequeue`] for the protocol engine, and reassembled in order on
//! the far side by [`StreamSet::enqueue`].

pub mod cell;
pub mod errors;
pub mod stream;
pub mod stream_set;

pub use cell::{Cell, CellType, CELL_HEADER_SIZE, MAX_CELL_LENGTH};
pub use errors::{Error, Result};
pub use stream::Stream;
pub use stream_set::StreamSet;
