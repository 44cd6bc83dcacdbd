//! Streaming chat relay.
//!
//! The `chat-relay` binary proxies conversation snapshots to a hosted model
//! and streams the reply back as `data:` frames. The `relay-chat` binary is a
//! terminal client for it with persisted history.

pub mod ai;
pub mod client;
pub mod config;
pub mod controller;
pub mod frame;
pub mod history;
pub mod relay;
pub mod server;
pub mod types;
