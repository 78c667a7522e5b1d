//! Daybreak smart-alarm orchestration engine.
//!
//! The engine owns the alarm collection and the pipeline around it: deciding
//! when to (re)request a server-side wake-time calculation, serializing the
//! alarm/user/location context to the external calculation service,
//! reconciling the asynchronous result back into the alarm record without
//! feedback loops, and (re)scheduling local notifications. The UI is an
//! external collaborator that talks to the engine over the HTTP API in
//! [`api`] and renders what it gets back.

pub mod alarm;
pub mod api;
pub mod api_client;
pub mod calc;
pub mod coordinator;
pub mod error;
pub mod limiter;
pub mod notify;
pub mod profile;
pub mod refresh;
pub mod store;
pub mod tracing;
