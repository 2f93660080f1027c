//! Foundational services and message passing for Relay.
//!
//! Relay's components are implemented as asynchronous [services](Service). Each service runs its
//! own message loop and is addressed through a lightweight [`Addr`] handle. Messages declare their
//! response behavior through [`FromMessage`], which allows fire-and-forget messages
//! ([`NoResponse`]), single responses ([`AsyncResponse`]), and responses shared between multiple
//! waiters ([`BroadcastResponse`]).
//!
//! The [`Controller`] listens for process signals and broadcasts a [`Shutdown`] message to all
//! services that obtained a [`ShutdownHandle`].

#![warn(missing_docs)]

mod controller;
mod service;

pub use self::controller::*;
pub use self::service::*;
