//! Admin protocol between the parent, its children and the watchdog.
//!
//! # Architecture
//!
//! - **parent**: accept loop, end-init handshake, command relay, stats dispatch
//! - **child**: end-init, command handling, stats answers, peer commands
//! - **children**: parent-side table of child slots

pub mod child;
pub mod children;
pub mod parent;

use crate::bridge::channel::ChannelError;

pub use child::{
    ChildAdmin, ChildAdminHandle, ChildHandler, NoopHandler, peer_reconfigure, peer_reopen_logs,
    request_restart, send_peer_command,
};
pub use children::{ChildConn, ChildSummary, ChildTable};
pub use parent::{NoHooks, ParentHandle, ParentHooks, ParentStatus, spawn_parent};

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("failed to bind admin socket: {0}")]
    Bind(#[source] std::io::Error),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("end-init handshake failed: {0}")]
    Handshake(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("admin loop has stopped")]
    Stopped,
}
