//! Shared wire and resource definitions for crmsync.

pub mod comment;
pub mod frame;
pub mod notification;
pub mod task;
pub mod topic;
