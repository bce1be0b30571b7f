//! Framed codec for admin and stats channels.
//!
//! Uses LengthDelimitedCodec for framing with a native-endian 4 byte prefix.
//! The body starts with the i32 admin tag. Stats-carrying tags follow it with
//! a zero pad, the 24 byte stats header and the packet payload; every other
//! tag carries NUL-terminated text.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{AdminTag, FragmentFlag, Frame, StatsHeader};

/// Maximum size of a frame body, tag included.
pub const RECV_BUFFER_SIZE: usize = 4096;
/// Offset of the stats header within the body.
pub const STATS_HEADER_OFFSET: usize = 8;
pub const STATS_HEADER_SIZE: usize = 24;
/// Largest payload a single stats packet can carry.
pub const MAX_PACKET_PAYLOAD: usize =
    RECV_BUFFER_SIZE - STATS_HEADER_OFFSET - STATS_HEADER_SIZE - 4;

pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .native_endian()
                .max_frame_length(RECV_BUFFER_SIZE)
                .new_codec(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn decode_body(mut body: Bytes) -> io::Result<Frame> {
    if body.len() < 4 {
        return Err(invalid(format!("frame body too short: {} bytes", body.len())));
    }
    let raw = body.get_i32_ne();
    let tag = AdminTag::from_i32(raw).ok_or_else(|| invalid(format!("unknown admin tag {raw}")))?;

    if !tag.is_stats_carrier() {
        let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
        return Ok(Frame {
            tag,
            stats: None,
            body: body.slice(..end),
        });
    }

    if body.len() < 4 + STATS_HEADER_SIZE {
        return Err(invalid(format!(
            "stats frame {tag:?} truncated: {} bytes after tag",
            body.len()
        )));
    }
    body.advance(4);
    let msg_type = body.get_i32_ne();
    let sender_pid = body.get_i32_ne();
    let total_len = body.get_i32_ne();
    let packet_len = body.get_i32_ne();
    let raw_flags = body.get_i32_ne();
    let reserved = body.get_i32_ne();
    let flags = FragmentFlag::from_i32(raw_flags)
        .ok_or_else(|| invalid(format!("unknown fragment flag {raw_flags}")))?;

    if packet_len < 0 || packet_len as usize != body.len() {
        return Err(invalid(format!(
            "packet length {packet_len} does not match {} payload bytes",
            body.len()
        )));
    }
    if total_len < packet_len {
        return Err(invalid(format!(
            "total length {total_len} smaller than packet length {packet_len}"
        )));
    }

    Ok(Frame {
        tag,
        stats: Some(StatsHeader {
            msg_type,
            sender_pid,
            total_len,
            packet_len,
            flags,
            reserved,
        }),
        body,
    })
}

fn encode_body(frame: &Frame) -> io::Result<BytesMut> {
    let mut out = BytesMut::with_capacity(STATS_HEADER_OFFSET + STATS_HEADER_SIZE + frame.body.len());
    out.put_i32_ne(frame.tag.as_i32());

    match (frame.tag.is_stats_carrier(), frame.stats) {
        (true, Some(header)) => {
            if header.packet_len < 0 || header.packet_len as usize != frame.body.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "packet length {} does not match {} payload bytes",
                        header.packet_len,
                        frame.body.len()
                    ),
                ));
            }
            out.put_i32_ne(0);
            out.put_i32_ne(header.msg_type);
            out.put_i32_ne(header.sender_pid);
            out.put_i32_ne(header.total_len);
            out.put_i32_ne(header.packet_len);
            out.put_i32_ne(header.flags.as_i32());
            out.put_i32_ne(header.reserved);
            out.put_slice(&frame.body);
        }
        (true, None) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{:?} requires a stats header", frame.tag),
            ));
        }
        (false, _) => {
            out.put_slice(&frame.body);
            out.put_u8(0);
        }
    }
    Ok(out)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => decode_body(bytes.freeze()).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = encode_body(&item)?;
        tracing::trace!(tag = ?item.tag, body_bytes = body.len(), "Encoding frame");
        self.inner.encode(body.freeze(), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ne(v: i32) -> [u8; 4] {
        v.to_ne_bytes()
    }

    #[test]
    fn admin_frame_layout() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::admin(AdminTag::EndInit, "4242"), &mut buf)
            .unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&ne(9));
        expected.extend_from_slice(&ne(7));
        expected.extend_from_slice(b"4242\0");
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn stats_frame_layout() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let frame = Frame::stats_complete(
            AdminTag::ReqStatsData,
            20,
            -1,
            Bytes::from_static(&[1, 2, 3]),
        )
        .unwrap();
        codec.encode(frame, &mut buf).unwrap();

        assert_eq!(buf.len(), 4 + STATS_HEADER_OFFSET + STATS_HEADER_SIZE + 3);
        let body = &buf[4..];
        assert_eq!(&body[0..4], &ne(34));
        assert_eq!(&body[4..8], &ne(0));
        let header = &body[STATS_HEADER_OFFSET..STATS_HEADER_OFFSET + STATS_HEADER_SIZE];
        assert_eq!(&header[0..4], &ne(20));
        assert_eq!(&header[4..8], &ne(-1));
        assert_eq!(&header[8..12], &ne(3));
        assert_eq!(&header[12..16], &ne(3));
        assert_eq!(&header[16..20], &ne(1));
        assert_eq!(&body[STATS_HEADER_OFFSET + STATS_HEADER_SIZE..], &[1, 2, 3]);
    }

    #[test]
    fn decode_yields_text_and_stats_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::admin(AdminTag::GetPwdReply, "/srv/https"), &mut buf)
            .unwrap();
        codec
            .encode(
                Frame::stats_complete(
                    AdminTag::RespStatsData,
                    1,
                    -1,
                    Bytes::from_static(b"payload"),
                )
                .unwrap(),
                &mut buf,
            )
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.tag, AdminTag::GetPwdReply);
        assert_eq!(first.text(), "/srv/https");
        assert!(first.stats.is_none());

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.tag, AdminTag::RespStatsData);
        assert_eq!(second.msg_type(), Some(1));
        assert_eq!(&second.body[..], b"payload");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_partial_frame_waits() {
        let mut codec = FrameCodec::new();
        let mut full = BytesMut::new();
        codec
            .encode(Frame::admin(AdminTag::Reconfigure, ""), &mut full)
            .unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 1..]);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.tag, AdminTag::Reconfigure);
        assert!(frame.body.is_empty());
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&ne(5));
        buf.put_slice(&ne(33));
        buf.put_u8(0);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn decode_rejects_packet_length_mismatch() {
        let mut codec = FrameCodec::new();
        let mut body = BytesMut::new();
        body.put_i32_ne(AdminTag::RespStatsData.as_i32());
        body.put_i32_ne(0);
        for v in [1, -1, 10, 10, 1, 0] {
            body.put_i32_ne(v);
        }
        body.put_slice(b"short");

        let mut buf = BytesMut::new();
        buf.put_slice(&ne(body.len() as i32));
        buf.put_slice(&body);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn encode_rejects_oversized_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let payload = Bytes::from(vec![0u8; RECV_BUFFER_SIZE]);
        let frame = Frame::stats_complete(AdminTag::RespStatsData, 1, -1, payload).unwrap();
        assert!(codec.encode(frame, &mut buf).is_err());

        let payload = Bytes::from(vec![0u8; MAX_PACKET_PAYLOAD]);
        let frame = Frame::stats_complete(AdminTag::RespStatsData, 1, -1, payload).unwrap();
        codec.encode(frame, &mut buf).unwrap();
    }

    #[test]
    fn encode_requires_stats_header() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let frame = Frame::admin(AdminTag::ReqStatsData, "");
        assert!(codec.encode(frame, &mut buf).is_err());
    }
}
