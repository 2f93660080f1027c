//! Common utilities and types for Relay.
#![warn(missing_docs)]

pub mod auth;
pub mod macros;
mod project;
mod retry;

pub use self::project::*;
pub use self::retry::*;
