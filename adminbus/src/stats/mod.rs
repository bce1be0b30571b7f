//! Statistics collection over the admin channels.
//!
//! # Architecture
//!
//! - **types**: slot records exchanged between processes
//! - **messenger**: fragmented request/response and notice exchanges
//! - **child**: answers parent polls from a child's live statistics
//! - **parent**: polls children into the aggregation store and serves clients
//! - **render**: XML and perf dump renderers over the store

pub mod child;
pub mod messenger;
pub mod parent;
pub mod render;
pub mod types;

pub use child::{ChildNotifier, LiveThreadSlots, StatsResponder, StatsSource};
pub use messenger::{ProtocolError, StatsMessage, StatsReply};
pub use parent::ParentStats;
pub use render::DumpQuery;
