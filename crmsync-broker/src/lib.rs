//! crmsync broker library.
//!
//! Exposes the broker for use in tests and embedding. The broker accepts
//! token-authenticated WebSocket connections and routes topic messages and
//! per-user notifications between them.

pub mod auth;
pub mod broker;
pub mod config;
