//! Shared utilities for dictaflow: XDG paths and the daemon gRPC client.

pub mod client;
pub mod dirs;
