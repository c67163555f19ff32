#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![doc = include_str!("../README.md")]
//!
//! # Threading Notes
//!
//! Propagation is cooperative: user callbacks run to completion on the
//! thread that opened the transaction. Only transaction serialisation is
//! guaranteed across threads.

pub mod error;
pub mod node;
pub mod runtime;

#[doc = include_str!("../README.md")]
mod readme {}
