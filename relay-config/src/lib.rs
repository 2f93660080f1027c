//! Configuration for the Relay CLI and server.
#![warn(missing_docs)]

mod byte_size;
mod config;
mod upstream;

pub use crate::byte_size::*;
pub use crate::config::*;
pub use crate::upstream::*;
