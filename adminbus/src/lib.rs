//! adminbus: admin and statistics IPC for multi-process servers.
//!
//! A parent process accepts one admin channel per child, relays lifecycle
//! commands from its watchdog, and aggregates child statistics for admin
//! clients that connect over the same socket.

pub mod admin;
pub mod bridge;
pub mod client;
pub mod config;
pub mod stats;
pub mod store;
pub mod telemetry;

pub use admin::{
    AdminError, ChildAdmin, ChildAdminHandle, ChildHandler, NoHooks, NoopHandler, ParentHandle,
    ParentHooks, ParentStatus, spawn_parent,
};
pub use bridge::{
    AdminTag, Channel, ChannelError, ChannelRole, ConnectOptions, NoticeKind, StatsErrorCode,
    StatsRequestKind,
};
pub use client::{ClientError, ClientManager, ClientOptions, Notice, NoticeReceiver, StatsClient};
pub use config::AdminConfig;
pub use stats::{ChildNotifier, StatsResponder, StatsSource};
pub use store::{AggregationStore, SharedStore, StoreError};
pub use telemetry::init_tracing;

pub const ADMINBUS_VERSION: &str = env!("CARGO_PKG_VERSION");
