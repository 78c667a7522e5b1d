//! UI-facing HTTP API.

pub mod server;
pub mod v0;
