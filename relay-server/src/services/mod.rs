//! Long-running services of the relay server.

pub mod forwarder;
pub mod health_check;
pub mod project;
pub mod project_cache;
pub mod project_upstream;
pub mod upstream;
