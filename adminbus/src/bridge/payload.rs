//! Binary payload encoding for stats messages.
//!
//! Every slot is written field by field in declaration order, integers in
//! native byte order. Strings embedded in slots are NUL-terminated and padded
//! to an 8 byte boundary. String arrays (VS ids, web module names) are a run
//! of NUL-terminated strings closed by one empty string, without padding.

use bytes::{BufMut, Bytes, BytesMut};

/// Alignment of strings embedded in slots.
pub const STRING_ALIGNMENT: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("unterminated string")]
    UnterminatedString,
    #[error("string is not valid utf-8")]
    Utf8,
    #[error("string array is missing its terminator")]
    MissingTerminator,
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("invalid {what} value {value}")]
    InvalidValue { what: &'static str, value: i64 },
    #[error("negative element count {0}")]
    NegativeCount(i32),
    #[error("stats header magic mismatch")]
    BadMagic,
    #[error("incompatible stats version {major}.{minor}")]
    Version { major: i32, minor: i32 },
}

#[derive(Debug, Default)]
pub struct StatsWriter {
    buf: BytesMut,
}

impl StatsWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32_ne(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_ne(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64_ne(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_ne(v);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64_ne(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_i32(i32::from(v));
    }

    /// NUL-terminated, zero padded to `STRING_ALIGNMENT`.
    pub fn put_str(&mut self, s: &str) {
        let bytes = s.as_bytes();
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        self.buf.put_slice(&bytes[..end]);
        let written = end + 1;
        let padded = written.next_multiple_of(STRING_ALIGNMENT);
        self.buf.put_bytes(0, padded - end);
    }

    pub fn put_count(&mut self, n: usize) {
        self.put_i32(i32::try_from(n).unwrap_or(i32::MAX));
    }

    pub fn put<T: Wire>(&mut self, value: &T) {
        value.encode(self);
    }

    pub fn put_slice_of<T: Wire>(&mut self, items: &[T]) {
        self.put_count(items.len());
        for item in items {
            item.encode(self);
        }
    }

    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

pub struct StatsReader<'a> {
    buf: &'a [u8],
}

impl<'a> StatsReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PayloadError> {
        if self.buf.len() < n {
            return Err(PayloadError::Truncated {
                needed: n,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], PayloadError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_i32(&mut self) -> Result<i32, PayloadError> {
        self.array().map(i32::from_ne_bytes)
    }

    pub fn get_u32(&mut self) -> Result<u32, PayloadError> {
        self.array().map(u32::from_ne_bytes)
    }

    pub fn get_i64(&mut self) -> Result<i64, PayloadError> {
        self.array().map(i64::from_ne_bytes)
    }

    pub fn get_u64(&mut self) -> Result<u64, PayloadError> {
        self.array().map(u64::from_ne_bytes)
    }

    pub fn get_f64(&mut self) -> Result<f64, PayloadError> {
        self.array().map(f64::from_ne_bytes)
    }

    pub fn get_bool(&mut self) -> Result<bool, PayloadError> {
        Ok(self.get_i32()? != 0)
    }

    pub fn get_str(&mut self) -> Result<String, PayloadError> {
        let nul = self
            .buf
            .iter()
            .position(|b| *b == 0)
            .ok_or(PayloadError::UnterminatedString)?;
        let consumed = (nul + 1).next_multiple_of(STRING_ALIGNMENT);
        let raw = self.take(consumed)?;
        std::str::from_utf8(&raw[..nul])
            .map(str::to_owned)
            .map_err(|_| PayloadError::Utf8)
    }

    pub fn get_count(&mut self) -> Result<usize, PayloadError> {
        let n = self.get_i32()?;
        usize::try_from(n).map_err(|_| PayloadError::NegativeCount(n))
    }

    pub fn get<T: Wire>(&mut self) -> Result<T, PayloadError> {
        T::decode(self)
    }

    pub fn get_vec_of<T: Wire>(&mut self) -> Result<Vec<T>, PayloadError> {
        let n = self.get_count()?;
        let mut items = Vec::with_capacity(n.min(self.remaining()));
        for _ in 0..n {
            items.push(T::decode(self)?);
        }
        Ok(items)
    }

    /// Fails when bytes remain.
    pub fn finish(self) -> Result<(), PayloadError> {
        match self.buf.len() {
            0 => Ok(()),
            n => Err(PayloadError::TrailingBytes(n)),
        }
    }
}

/// Explicit binary layout of a stats slot.
pub trait Wire: Sized {
    fn encode(&self, w: &mut StatsWriter);
    fn decode(r: &mut StatsReader<'_>) -> Result<Self, PayloadError>;
}

macro_rules! wire_primitive {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl Wire for $ty {
                fn encode(&self, w: &mut StatsWriter) {
                    w.$put(*self);
                }

                fn decode(r: &mut StatsReader<'_>) -> Result<Self, PayloadError> {
                    r.$get()
                }
            }
        )*
    };
}

wire_primitive! {
    i32 => put_i32, get_i32;
    u32 => put_u32, get_u32;
    i64 => put_i64, get_i64;
    u64 => put_u64, get_u64;
    f64 => put_f64, get_f64;
    bool => put_bool, get_bool;
}

impl Wire for String {
    fn encode(&self, w: &mut StatsWriter) {
        w.put_str(self);
    }

    fn decode(r: &mut StatsReader<'_>) -> Result<Self, PayloadError> {
        r.get_str()
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn encode(&self, w: &mut StatsWriter) {
        w.put_slice_of(self);
    }

    fn decode(r: &mut StatsReader<'_>) -> Result<Self, PayloadError> {
        r.get_vec_of()
    }
}

impl<T: Wire> Wire for Option<T> {
    fn encode(&self, w: &mut StatsWriter) {
        w.put_bool(self.is_some());
        if let Some(v) = self {
            v.encode(w);
        }
    }

    fn decode(r: &mut StatsReader<'_>) -> Result<Self, PayloadError> {
        if r.get_bool()? {
            Ok(Some(T::decode(r)?))
        } else {
            Ok(None)
        }
    }
}

/// Declares a slot struct and its field-by-field `Wire` layout.
macro_rules! wire_slot {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $($(#[$fmeta:meta])* pub $field:ident : $ty:ty,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
        pub struct $name {
            $($(#[$fmeta])* pub $field: $ty,)*
        }

        impl $crate::bridge::payload::Wire for $name {
            fn encode(&self, w: &mut $crate::bridge::payload::StatsWriter) {
                $($crate::bridge::payload::Wire::encode(&self.$field, w);)*
            }

            fn decode(
                r: &mut $crate::bridge::payload::StatsReader<'_>,
            ) -> Result<Self, $crate::bridge::payload::PayloadError> {
                Ok(Self {
                    $($field: $crate::bridge::payload::Wire::decode(r)?,)*
                })
            }
        }
    };
}
pub(crate) use wire_slot;

/// Declares an i32-backed mode enum with a `Wire` layout.
macro_rules! wire_mode {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            #[default]
            $first:ident = $first_val:literal,
            $($variant:ident = $val:literal,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            #[default]
            $first = $first_val,
            $($variant = $val,)*
        }

        impl $name {
            pub fn from_i32(value: i32) -> Option<Self> {
                match value {
                    $first_val => Some(Self::$first),
                    $($val => Some(Self::$variant),)*
                    _ => None,
                }
            }

            pub fn as_i32(self) -> i32 {
                self as i32
            }
        }

        impl $crate::bridge::payload::Wire for $name {
            fn encode(&self, w: &mut $crate::bridge::payload::StatsWriter) {
                w.put_i32(self.as_i32());
            }

            fn decode(
                r: &mut $crate::bridge::payload::StatsReader<'_>,
            ) -> Result<Self, $crate::bridge::payload::PayloadError> {
                let value = r.get_i32()?;
                Self::from_i32(value).ok_or($crate::bridge::payload::PayloadError::InvalidValue {
                    what: stringify!($name),
                    value: i64::from(value),
                })
            }
        }
    };
}
pub(crate) use wire_mode;

pub fn to_payload<T: Wire>(value: &T) -> Bytes {
    let mut w = StatsWriter::new();
    value.encode(&mut w);
    w.finish()
}

/// Decodes a whole payload, rejecting trailing bytes.
pub fn from_payload<T: Wire>(payload: &[u8]) -> Result<T, PayloadError> {
    let mut r = StatsReader::new(payload);
    let value = T::decode(&mut r)?;
    r.finish()?;
    Ok(value)
}

pub fn encode_str_array<S: AsRef<str>>(items: &[S]) -> Bytes {
    let mut buf = BytesMut::new();
    for item in items {
        let bytes = item.as_ref().as_bytes();
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        buf.put_slice(&bytes[..end]);
        buf.put_u8(0);
    }
    buf.put_u8(0);
    buf.freeze()
}

/// An empty or single-byte payload is an empty array.
pub fn decode_str_array(payload: &[u8]) -> Result<Vec<String>, PayloadError> {
    if payload.len() <= 1 {
        return Ok(Vec::new());
    }
    let mut items = Vec::new();
    let mut rest = payload;
    loop {
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(PayloadError::MissingTerminator)?;
        if nul == 0 {
            return match rest.len() - 1 {
                0 => Ok(items),
                n => Err(PayloadError::TrailingBytes(n)),
            };
        }
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| PayloadError::Utf8)?;
        items.push(s.to_owned());
        rest = &rest[nul + 1..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    wire_mode! {
        pub enum Lamp {
            #[default]
            Off = 0,
            On = 1,
        }
    }

    wire_slot! {
        pub struct Sample {
            pub id: String,
            pub lamp: Lamp,
            pub count: u64,
            pub ratio: f64,
            pub flag: bool,
        }
    }

    #[test]
    fn strings_are_padded_to_alignment() {
        let mut w = StatsWriter::new();
        w.put_str("vs1");
        assert_eq!(w.len(), 8);
        w.put_str("1234567");
        assert_eq!(w.len(), 16);
        w.put_str("12345678");
        assert_eq!(w.len(), 32);
        w.put_str("");
        assert_eq!(w.len(), 40);

        let bytes = w.finish();
        let mut r = StatsReader::new(&bytes);
        assert_eq!(r.get_str().unwrap(), "vs1");
        assert_eq!(r.get_str().unwrap(), "1234567");
        assert_eq!(r.get_str().unwrap(), "12345678");
        assert_eq!(r.get_str().unwrap(), "");
        r.finish().unwrap();
    }

    #[test]
    fn slot_macro_encodes_fields_in_order() {
        let sample = Sample {
            id: "https-a".into(),
            lamp: Lamp::On,
            count: 42,
            ratio: 0.5,
            flag: true,
        };
        let bytes = to_payload(&sample);
        assert_eq!(bytes.len(), 8 + 4 + 8 + 8 + 4);
        assert_eq!(&bytes[8..12], &1i32.to_ne_bytes());
        assert_eq!(&bytes[12..20], &42u64.to_ne_bytes());
        assert_eq!(from_payload::<Sample>(&bytes).unwrap(), sample);
    }

    #[test]
    fn decode_rejects_bad_mode_and_trailing_bytes() {
        let mut w = StatsWriter::new();
        w.put_str("x");
        w.put_i32(7);
        w.put_u64(0);
        w.put_f64(0.0);
        w.put_bool(false);
        let err = from_payload::<Sample>(&w.finish()).unwrap_err();
        assert_eq!(
            err,
            PayloadError::InvalidValue {
                what: "Lamp",
                value: 7
            }
        );

        let mut bytes = to_payload(&Sample::default()).to_vec();
        bytes.extend_from_slice(&[0, 0]);
        assert_eq!(
            from_payload::<Sample>(&bytes).unwrap_err(),
            PayloadError::TrailingBytes(2)
        );
    }

    #[test]
    fn truncated_payload_is_reported() {
        let bytes = to_payload(&Sample::default());
        let err = from_payload::<Sample>(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, PayloadError::Truncated { needed: 4, remaining: 2 }));
    }

    #[test]
    fn vec_is_count_prefixed() {
        let items = vec![3i32, 5, 8];
        let bytes = to_payload(&items);
        assert_eq!(bytes.len(), 16);
        assert_eq!(from_payload::<Vec<i32>>(&bytes).unwrap(), items);

        let mut w = StatsWriter::new();
        w.put_i32(-2);
        assert_eq!(
            from_payload::<Vec<i32>>(&w.finish()).unwrap_err(),
            PayloadError::NegativeCount(-2)
        );
    }

    #[test]
    fn string_array_layout() {
        let bytes = encode_str_array(&["vs1", "vs2"]);
        assert_eq!(&bytes[..], b"vs1\0vs2\0\0");
        assert_eq!(decode_str_array(&bytes).unwrap(), vec!["vs1", "vs2"]);
    }

    #[test]
    fn string_array_edge_cases() {
        assert!(decode_str_array(b"").unwrap().is_empty());
        assert!(decode_str_array(b"\0").unwrap().is_empty());
        assert_eq!(encode_str_array::<&str>(&[]).as_ref(), b"\0");
        assert_eq!(
            decode_str_array(b"vs1\0vs2\0").unwrap_err(),
            PayloadError::MissingTerminator
        );
        assert_eq!(
            decode_str_array(b"vs1\0\0junk").unwrap_err(),
            PayloadError::TrailingBytes(4)
        );
    }
}
