//! IPC bridge shared by the admin and stats layers.
//!
//! # Architecture
//!
//! - **protocol**: admin tags, stats request/notice kinds, frames
//! - **codec**: length-delimited binary framing over AsyncRead/AsyncWrite
//! - **channel**: one framed connection with peek/recv/send
//! - **transport**: socket addressing, listener, bounded connect
//! - **payload**: explicit field-by-field encoding of stats slots

pub mod channel;
pub mod codec;
pub mod payload;
pub mod protocol;
pub mod transport;

pub use channel::{Channel, ChannelError, ChannelRole, ConnId, Endpoint};
pub use codec::{FrameCodec, MAX_PACKET_PAYLOAD};
pub use payload::{PayloadError, StatsReader, StatsWriter, Wire};
pub use protocol::{
    AdminTag, FragmentFlag, Frame, NO_SENDER_PID, NoticeKind, StatsErrorCode, StatsHeader,
    StatsRequestKind,
};
pub use transport::{AdminListener, ConnectOptions};
