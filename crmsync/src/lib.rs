//! `crmsync` — real-time notification, task chat and task board sync for
//! the CRM.
//!
//! A [`session::Session`] owns one broker connection and routes pushes to
//! topic handlers. The notification feed, task chat and board are kept in
//! sync on top of it, with REST calls through [`api::rest::RestClient`].

pub mod api;
pub mod board;
pub mod chat;
pub mod config;
pub mod credentials;
pub mod notifications;
pub mod policy;
pub mod registry;
pub mod session;
pub mod transport;
