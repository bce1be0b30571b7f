//! Stats request/response and notification exchange over a [`Channel`].
//!
//! A message larger than one packet goes out as `First`, `Next`..., `Last`
//! fragments. After every fragment except the last the sender waits for a
//! `RespStatsDataAck` from the receiver (stop-and-wait). The receiver
//! reassembles into one buffer of the declared total length.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::bridge::channel::{Channel, ChannelError};
use crate::bridge::codec::MAX_PACKET_PAYLOAD;
use crate::bridge::payload::{
    PayloadError, StatsReader, StatsWriter, Wire, decode_str_array, from_payload,
};
use crate::bridge::protocol::{
    AdminTag, FragmentFlag, Frame, LengthOverflow, NO_SENDER_PID, NoticeKind, StatsErrorCode,
    StatsHeader, StatsRequestKind, wire_len,
};

/// Largest reassembled message accepted from a peer.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// Reassembly buffers start at this size and grow with the fragments.
const INITIAL_REASSEMBLY_CAPACITY: usize = 16 * MAX_PACKET_PAYLOAD;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("malformed stats payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("peer closed the channel")]
    Closed,

    #[error("unexpected {got:?} frame, expected {expected}")]
    UnexpectedTag { expected: &'static str, got: AdminTag },

    #[error("reply carries message type {got}, expected {expected}")]
    TypeMismatch { expected: i32, got: i32 },

    #[error("fragment {next:?} cannot follow {prev:?}")]
    FragmentOrder { prev: FragmentFlag, next: FragmentFlag },

    #[error("message declared {declared} bytes, received {received}")]
    LengthMismatch { declared: usize, received: usize },

    #[error("message declared {declared} bytes, limit is {MAX_MESSAGE_LEN}")]
    TooLarge { declared: usize },

    #[error(transparent)]
    Length(#[from] LengthOverflow),

    #[error("unknown stats error code {0}")]
    UnknownErrorCode(i32),

    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

impl ProtocolError {
    /// Transport failures end the channel; the rest leave it desynchronized,
    /// which callers treat the same way.
    pub fn is_closed(&self) -> bool {
        matches!(self, ProtocolError::Closed | ProtocolError::Channel(ChannelError::Closed))
    }
}

/// A reassembled stats message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsMessage {
    pub tag: AdminTag,
    pub msg_type: i32,
    pub sender_pid: i32,
    pub payload: Bytes,
}

impl StatsMessage {
    pub fn request_kind(&self) -> Option<StatsRequestKind> {
        StatsRequestKind::from_i32(self.msg_type)
    }

    pub fn notice_kind(&self) -> Option<NoticeKind> {
        NoticeKind::from_i32(self.msg_type)
    }
}

/// Outcome of a stats request. Errors reported by the peer are data, not
/// failures of the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsReply {
    Data(Bytes),
    Error(StatsErrorCode),
}

fn ack_frame(msg_type: i32) -> Frame {
    Frame::stats(
        AdminTag::RespStatsDataAck,
        StatsHeader {
            msg_type,
            sender_pid: NO_SENDER_PID,
            total_len: 0,
            packet_len: 0,
            flags: FragmentFlag::Complete,
            reserved: 0,
        },
        Bytes::new(),
    )
}

async fn recv_frame(channel: &mut Channel) -> Result<Frame, ProtocolError> {
    let frame = channel.recv().await?;
    if frame.is_empty_read() {
        return Err(ProtocolError::Closed);
    }
    Ok(frame)
}

fn stats_header(frame: &Frame) -> Result<StatsHeader, ProtocolError> {
    frame.stats.ok_or(ProtocolError::UnexpectedTag {
        expected: "stats frame",
        got: frame.tag,
    })
}

async fn expect_fragment_ack(channel: &mut Channel, msg_type: i32) -> Result<(), ProtocolError> {
    let frame = recv_frame(channel).await?;
    if frame.tag != AdminTag::RespStatsDataAck {
        return Err(ProtocolError::UnexpectedTag {
            expected: "fragment ack",
            got: frame.tag,
        });
    }
    let header = stats_header(&frame)?;
    if header.msg_type != msg_type {
        return Err(ProtocolError::TypeMismatch {
            expected: msg_type,
            got: header.msg_type,
        });
    }
    Ok(())
}

/// Sends one logical message, fragmenting it when it exceeds a packet.
pub async fn send_message(
    channel: &mut Channel,
    tag: AdminTag,
    msg_type: i32,
    sender_pid: i32,
    payload: Bytes,
) -> Result<(), ProtocolError> {
    if payload.len() <= MAX_PACKET_PAYLOAD {
        channel
            .send(Frame::stats_complete(tag, msg_type, sender_pid, payload)?)
            .await?;
        return Ok(());
    }

    let total = payload.len();
    let total_len = wire_len(total)?;
    let mut offset = 0;
    while offset < total {
        let end = (offset + MAX_PACKET_PAYLOAD).min(total);
        let flags = if offset == 0 {
            FragmentFlag::First
        } else if end < total {
            FragmentFlag::Next
        } else {
            FragmentFlag::Last
        };
        let header = StatsHeader {
            msg_type,
            sender_pid,
            total_len,
            packet_len: wire_len(end - offset)?,
            flags,
            reserved: 0,
        };
        channel
            .send(Frame::stats(tag, header, payload.slice(offset..end)))
            .await?;
        tracing::trace!(?tag, msg_type, ?flags, offset, total, "Fragment sent");
        offset = end;
        if offset < total {
            expect_fragment_ack(channel, msg_type).await?;
        }
    }
    Ok(())
}

/// Receives one logical message, acknowledging and reassembling fragments.
pub async fn recv_message(channel: &mut Channel) -> Result<StatsMessage, ProtocolError> {
    let frame = recv_frame(channel).await?;
    assemble(channel, frame).await
}

/// Like [`recv_message`], bounded by `limit` from the first byte to the last
/// fragment.
pub async fn recv_message_within(
    channel: &mut Channel,
    limit: Duration,
) -> Result<StatsMessage, ProtocolError> {
    tokio::time::timeout(limit, recv_message(channel))
        .await
        .map_err(|_| ProtocolError::Timeout(limit))?
}

/// Completes a message whose first frame the caller already read.
pub async fn assemble(channel: &mut Channel, frame: Frame) -> Result<StatsMessage, ProtocolError> {
    let header = stats_header(&frame)?;
    let tag = frame.tag;

    match header.flags {
        FragmentFlag::Complete => {
            return Ok(StatsMessage {
                tag,
                msg_type: header.msg_type,
                sender_pid: header.sender_pid,
                payload: frame.body,
            });
        }
        FragmentFlag::First => {}
        other => {
            return Err(ProtocolError::FragmentOrder {
                prev: FragmentFlag::Complete,
                next: other,
            });
        }
    }

    let declared = usize::try_from(header.total_len).unwrap_or(0);
    if declared > MAX_MESSAGE_LEN {
        return Err(ProtocolError::TooLarge { declared });
    }
    let mut buf = BytesMut::with_capacity(declared.min(INITIAL_REASSEMBLY_CAPACITY));
    buf.extend_from_slice(&frame.body);
    let mut prev = header.flags;
    loop {
        if buf.len() > declared {
            return Err(ProtocolError::LengthMismatch {
                declared,
                received: buf.len(),
            });
        }
        channel.send(ack_frame(header.msg_type)).await?;

        let frame = recv_frame(channel).await?;
        let next = stats_header(&frame)?;
        if frame.tag != tag {
            return Err(ProtocolError::UnexpectedTag {
                expected: "next fragment",
                got: frame.tag,
            });
        }
        if next.msg_type != header.msg_type {
            return Err(ProtocolError::TypeMismatch {
                expected: header.msg_type,
                got: next.msg_type,
            });
        }
        if !prev.may_precede(next.flags) {
            return Err(ProtocolError::FragmentOrder {
                prev,
                next: next.flags,
            });
        }
        buf.extend_from_slice(&frame.body);
        prev = next.flags;
        if prev == FragmentFlag::Last {
            break;
        }
    }

    if buf.len() != declared {
        return Err(ProtocolError::LengthMismatch {
            declared,
            received: buf.len(),
        });
    }
    tracing::trace!(?tag, msg_type = header.msg_type, len = declared, "Fragments reassembled");
    Ok(StatsMessage {
        tag,
        msg_type: header.msg_type,
        sender_pid: header.sender_pid,
        payload: buf.freeze(),
    })
}

/// Sends a stats request and waits for its paired response or error.
pub async fn request(
    channel: &mut Channel,
    kind: StatsRequestKind,
    body: Bytes,
) -> Result<StatsReply, ProtocolError> {
    send_message(channel, AdminTag::ReqStatsData, kind.as_i32(), NO_SENDER_PID, body).await?;
    read_reply(channel, kind).await
}

/// Like [`request`], bounded by `limit`.
pub async fn request_within(
    channel: &mut Channel,
    kind: StatsRequestKind,
    body: Bytes,
    limit: Duration,
) -> Result<StatsReply, ProtocolError> {
    tokio::time::timeout(limit, request(channel, kind, body))
        .await
        .map_err(|_| ProtocolError::Timeout(limit))?
}

/// Sends a request and decodes its data reply as `T`.
pub async fn query<T: Wire>(
    channel: &mut Channel,
    kind: StatsRequestKind,
    body: Bytes,
    limit: Duration,
) -> Result<Result<T, StatsErrorCode>, ProtocolError> {
    match request_within(channel, kind, body, limit).await? {
        StatsReply::Data(payload) => Ok(Ok(from_payload(&payload)?)),
        StatsReply::Error(code) => Ok(Err(code)),
    }
}

/// Like [`query`] for replies encoded as a string array.
pub async fn query_names(
    channel: &mut Channel,
    kind: StatsRequestKind,
    limit: Duration,
) -> Result<Result<Vec<String>, StatsErrorCode>, ProtocolError> {
    match request_within(channel, kind, Bytes::new(), limit).await? {
        StatsReply::Data(payload) => Ok(Ok(decode_str_array(&payload)?)),
        StatsReply::Error(code) => Ok(Err(code)),
    }
}

async fn read_reply(channel: &mut Channel, kind: StatsRequestKind) -> Result<StatsReply, ProtocolError> {
    let reply = recv_message(channel).await?;
    match reply.tag {
        AdminTag::RespStatsData if reply.msg_type == kind.as_i32() => Ok(StatsReply::Data(reply.payload)),
        AdminTag::RespStatsData => Err(ProtocolError::TypeMismatch {
            expected: kind.as_i32(),
            got: reply.msg_type,
        }),
        AdminTag::RespError => Ok(StatsReply::Error(decode_error(&reply.payload)?)),
        other => Err(ProtocolError::UnexpectedTag {
            expected: "stats response",
            got: other,
        }),
    }
}

fn decode_error(payload: &[u8]) -> Result<StatsErrorCode, ProtocolError> {
    let mut r = StatsReader::new(payload);
    let code = r.get_i32()?;
    r.finish()?;
    StatsErrorCode::from_i32(code).ok_or(ProtocolError::UnknownErrorCode(code))
}

/// Answers a request of `msg_type` with `payload`.
pub async fn respond(channel: &mut Channel, msg_type: i32, payload: Bytes) -> Result<(), ProtocolError> {
    send_message(channel, AdminTag::RespStatsData, msg_type, NO_SENDER_PID, payload).await
}

pub async fn respond_error(
    channel: &mut Channel,
    msg_type: i32,
    code: StatsErrorCode,
) -> Result<(), ProtocolError> {
    tracing::debug!(msg_type, ?code, "Stats request failed");
    let mut w = StatsWriter::new();
    w.put_i32(code.as_i32());
    send_message(channel, AdminTag::RespError, msg_type, NO_SENDER_PID, w.finish()).await
}

/// Pushes a notification and waits for the receiver's ack.
pub async fn notify(
    channel: &mut Channel,
    kind: NoticeKind,
    sender_pid: i32,
    payload: Bytes,
) -> Result<(), ProtocolError> {
    send_message(channel, AdminTag::StatsNotification, kind.as_i32(), sender_pid, payload).await?;
    let reply = recv_frame(channel).await?;
    if reply.tag != AdminTag::StatsNotificationAck {
        tracing::debug!(?kind, tag = ?reply.tag, "Notification not acknowledged");
        return Err(ProtocolError::UnexpectedTag {
            expected: "notification ack",
            got: reply.tag,
        });
    }
    Ok(())
}

pub async fn ack_notification(channel: &mut Channel, msg_type: i32) -> Result<(), ProtocolError> {
    channel
        .send(Frame::stats_complete(
            AdminTag::StatsNotificationAck,
            msg_type,
            NO_SENDER_PID,
            Bytes::new(),
        )?)
        .await?;
    Ok(())
}

/// Streams `text` as consecutive responses, each acknowledged by a request
/// of the dump's ack type, and closes the stream with an empty response.
pub async fn stream_dump(
    channel: &mut Channel,
    kind: StatsRequestKind,
    text: &str,
) -> Result<(), ProtocolError> {
    let ack = kind.ack().map(StatsRequestKind::as_i32).unwrap_or(kind.as_i32());
    let bytes = Bytes::copy_from_slice(text.as_bytes());
    let mut offset = 0;
    while offset < bytes.len() {
        let end = (offset + MAX_PACKET_PAYLOAD).min(bytes.len());
        respond(channel, kind.as_i32(), bytes.slice(offset..end)).await?;
        offset = end;

        let reply = recv_message(channel).await?;
        if reply.tag != AdminTag::ReqStatsData || reply.msg_type != ack {
            return Err(ProtocolError::TypeMismatch {
                expected: ack,
                got: reply.msg_type,
            });
        }
    }
    respond(channel, kind.as_i32(), Bytes::new()).await
}

/// Requests a streamed dump and collects it until the empty response.
pub async fn fetch_dump(
    channel: &mut Channel,
    kind: StatsRequestKind,
    query: &str,
) -> Result<Result<String, StatsErrorCode>, ProtocolError> {
    let mut w = StatsWriter::new();
    w.put_str(query);
    let ack = kind.ack().unwrap_or(kind);

    let mut text = Vec::new();
    let mut reply = request(channel, kind, w.finish()).await?;
    loop {
        match reply {
            StatsReply::Error(code) => return Ok(Err(code)),
            StatsReply::Data(chunk) if chunk.is_empty() => break,
            StatsReply::Data(chunk) => {
                text.extend_from_slice(&chunk);
                send_message(channel, AdminTag::ReqStatsData, ack.as_i32(), NO_SENDER_PID, Bytes::new())
                    .await?;
                reply = read_reply(channel, kind).await?;
            }
        }
    }
    Ok(Ok(String::from_utf8_lossy(&text).into_owned()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bridge::channel::ChannelRole;
    use tokio::net::UnixStream;

    fn pair() -> (Channel, Channel) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            Channel::new(a, ChannelRole::Stats),
            Channel::new(b, ChannelRole::Client),
        )
    }

    fn pattern(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    #[tokio::test]
    async fn small_request_round_trip() {
        let (mut server, mut client) = pair();
        let serve = async {
            let req = recv_message(&mut server).await.unwrap();
            assert_eq!(req.request_kind(), Some(StatsRequestKind::GetPidList));
            respond(&mut server, req.msg_type, Bytes::from_static(b"abc")).await.unwrap();
        };
        let (reply, ()) = tokio::join!(
            request(&mut client, StatsRequestKind::GetPidList, Bytes::new()),
            serve
        );
        assert_eq!(reply.unwrap(), StatsReply::Data(Bytes::from_static(b"abc")));
    }

    #[tokio::test]
    async fn long_response_is_fragmented_and_acked() {
        let (mut server, mut client) = pair();
        let payload = pattern(MAX_PACKET_PAYLOAD * 2 + 100);
        let expected = payload.clone();

        let serve = async move {
            let req = recv_message(&mut server).await.unwrap();
            respond(&mut server, req.msg_type, payload).await.unwrap();
            server
        };
        let (reply, _server) = tokio::join!(
            request(&mut client, StatsRequestKind::GetAllWebModuleData, Bytes::new()),
            serve
        );
        assert_eq!(reply.unwrap(), StatsReply::Data(expected));
    }

    #[tokio::test]
    async fn sender_waits_for_one_ack_per_fragment() {
        let (mut sender, mut receiver) = pair();
        let payload = pattern(MAX_PACKET_PAYLOAD * 3);
        let send = send_message(&mut sender, AdminTag::RespStatsData, 7, NO_SENDER_PID, payload.clone());

        let observe = async {
            let mut flags = Vec::new();
            let mut body = Vec::new();
            loop {
                let frame = receiver.recv().await.unwrap();
                let header = frame.stats.unwrap();
                flags.push(header.flags);
                body.extend_from_slice(&frame.body);
                if header.flags == FragmentFlag::Last {
                    break;
                }
                receiver.send(ack_frame(7)).await.unwrap();
            }
            (flags, body)
        };
        let (sent, (flags, body)) = tokio::join!(send, observe);
        sent.unwrap();
        assert_eq!(flags, vec![FragmentFlag::First, FragmentFlag::Next, FragmentFlag::Last]);
        assert_eq!(flags.len() - 1, 2);
        assert_eq!(body, payload.to_vec());
    }

    #[tokio::test]
    async fn out_of_order_fragment_is_rejected() {
        let (mut sender, mut receiver) = pair();
        let header = |flags| StatsHeader {
            msg_type: 3,
            sender_pid: NO_SENDER_PID,
            total_len: 8,
            packet_len: 4,
            flags,
            reserved: 0,
        };
        let send = async {
            sender
                .send(Frame::stats(AdminTag::RespStatsData, header(FragmentFlag::First), Bytes::from_static(b"abcd")))
                .await
                .unwrap();
            let ack = sender.recv().await.unwrap();
            assert_eq!(ack.tag, AdminTag::RespStatsDataAck);
            sender
                .send(Frame::stats(AdminTag::RespStatsData, header(FragmentFlag::First), Bytes::from_static(b"efgh")))
                .await
                .unwrap();
        };
        let (result, ()) = tokio::join!(recv_message(&mut receiver), send);
        assert!(matches!(
            result,
            Err(ProtocolError::FragmentOrder {
                prev: FragmentFlag::First,
                next: FragmentFlag::First
            })
        ));
    }

    #[tokio::test]
    async fn short_reassembly_is_rejected() {
        let (mut sender, mut receiver) = pair();
        let header = |flags| StatsHeader {
            msg_type: 3,
            sender_pid: NO_SENDER_PID,
            total_len: 100,
            packet_len: 4,
            flags,
            reserved: 0,
        };
        let send = async {
            for flags in [FragmentFlag::First, FragmentFlag::Last] {
                sender
                    .send(Frame::stats(AdminTag::RespStatsData, header(flags), Bytes::from_static(b"abcd")))
                    .await
                    .unwrap();
                if flags == FragmentFlag::First {
                    sender.recv().await.unwrap();
                }
            }
        };
        let (result, ()) = tokio::join!(recv_message(&mut receiver), send);
        assert!(matches!(
            result,
            Err(ProtocolError::LengthMismatch {
                declared: 100,
                received: 8
            })
        ));
    }

    #[tokio::test]
    async fn oversized_declared_length_is_rejected_before_reassembly() {
        let (mut sender, mut receiver) = pair();
        let header = StatsHeader {
            msg_type: 3,
            sender_pid: NO_SENDER_PID,
            total_len: i32::MAX,
            packet_len: 4,
            flags: FragmentFlag::First,
            reserved: 0,
        };
        sender
            .send(Frame::stats(AdminTag::RespStatsData, header, Bytes::from_static(b"abcd")))
            .await
            .unwrap();
        let result = recv_message(&mut receiver).await;
        assert!(matches!(
            result,
            Err(ProtocolError::TooLarge { declared }) if declared == i32::MAX as usize
        ));
    }

    #[tokio::test]
    async fn stalled_fragment_stream_times_out() {
        let (mut sender, mut receiver) = pair();
        let header = StatsHeader {
            msg_type: 3,
            sender_pid: NO_SENDER_PID,
            total_len: 8,
            packet_len: 4,
            flags: FragmentFlag::First,
            reserved: 0,
        };
        sender
            .send(Frame::stats(AdminTag::RespStatsData, header, Bytes::from_static(b"abcd")))
            .await
            .unwrap();
        let limit = Duration::from_millis(100);
        let result = recv_message_within(&mut receiver, limit).await;
        assert!(matches!(result, Err(ProtocolError::Timeout(d)) if d == limit));
        assert_eq!(sender.recv().await.unwrap().tag, AdminTag::RespStatsDataAck);
    }

    #[tokio::test]
    async fn error_replies_are_data() {
        let (mut server, mut client) = pair();
        let serve = async {
            let req = recv_message(&mut server).await.unwrap();
            respond_error(&mut server, req.msg_type, StatsErrorCode::NotReady)
                .await
                .unwrap();
        };
        let (reply, ()) = tokio::join!(
            request(&mut client, StatsRequestKind::GetStatsHeader, Bytes::new()),
            serve
        );
        assert_eq!(reply.unwrap(), StatsReply::Error(StatsErrorCode::NotReady));
    }

    #[tokio::test]
    async fn mismatched_response_type_is_a_protocol_error() {
        let (mut server, mut client) = pair();
        let serve = async {
            recv_message(&mut server).await.unwrap();
            respond(&mut server, StatsRequestKind::GetCpuInfo.as_i32(), Bytes::new())
                .await
                .unwrap();
        };
        let (reply, ()) = tokio::join!(
            request(&mut client, StatsRequestKind::GetStatsHeader, Bytes::new()),
            serve
        );
        assert!(matches!(reply, Err(ProtocolError::TypeMismatch { .. })));
    }

    #[tokio::test]
    async fn notification_is_acked() {
        let (mut child, mut parent) = pair();
        let handle = async {
            let notice = recv_message(&mut parent).await.unwrap();
            assert_eq!(notice.notice_kind(), Some(NoticeKind::JvmInitialized));
            assert_eq!(notice.sender_pid, 4242);
            ack_notification(&mut parent, notice.msg_type).await.unwrap();
        };
        let (sent, ()) = tokio::join!(
            notify(&mut child, NoticeKind::JvmInitialized, 4242, Bytes::new()),
            handle
        );
        sent.unwrap();
    }

    #[tokio::test]
    async fn dump_streams_until_empty_response() {
        let (mut server, mut client) = pair();
        let text = "x".repeat(MAX_PACKET_PAYLOAD + 10);
        let serve = async {
            let req = recv_message(&mut server).await.unwrap();
            assert_eq!(req.request_kind(), Some(StatsRequestKind::GetStatsXmlData));
            let query = StatsReader::new(&req.payload).get_str().unwrap();
            assert_eq!(query, "pretty");
            stream_dump(&mut server, StatsRequestKind::GetStatsXmlData, &text)
                .await
                .unwrap();
        };
        let (dump, ()) = tokio::join!(
            fetch_dump(&mut client, StatsRequestKind::GetStatsXmlData, "pretty"),
            serve
        );
        assert_eq!(dump.unwrap().unwrap().len(), MAX_PACKET_PAYLOAD + 10);
    }

    #[tokio::test]
    async fn peer_close_is_reported() {
        let (server, mut client) = pair();
        drop(server);
        let err = request(&mut client, StatsRequestKind::GetPidList, Bytes::new())
            .await
            .unwrap_err();
        assert!(err.is_closed() || matches!(err, ProtocolError::Channel(_)));
    }
}
