#![warn(clippy::pedantic)]
#![doc = include_str!("../README.md")]

mod cell;
pub use cell::{Cell, CellSink};

mod listener;
pub use listener::Listener;

mod loops;
pub use loops::{CellLoop, StreamLoop};

mod stream;
pub use stream::{Stream, StreamSink};

pub use sapwood::{error::Error, runtime::Transaction};

#[doc = include_str!("../README.md")]
mod readme {}
