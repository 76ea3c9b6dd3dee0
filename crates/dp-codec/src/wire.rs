//! Primitive wire encoding: fixed little-endian integers/floats, length-prefixed
//! strings, `u64`-counted variable-length containers, and `u16`-tagged unions.
//!
//! Every command on the stream is `(u16 tag, u32 payload-length, payload)`;
//! the payload itself is produced by [`WireEncode::encode`] for that command's
//! argument list. `decode(encode(x)) == x` is the round-trip law this module
//! exists to uphold (see the crate's `tests::roundtrip` module and the
//! `proptest`-based property test).

use dp_handle::Handle;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of buffer: wanted {wanted} more bytes, had {available}")]
    Truncated { wanted: usize, available: usize },
    #[error("unknown tag {tag:#06x}")]
    UnknownTag { tag: u16 },
    #[error("invalid UTF-8 in string payload")]
    InvalidString,
    #[error("invalid discriminant {0} for enum {1}")]
    InvalidDiscriminant(u32, &'static str),
}

/// Growable output buffer for a single command payload or a whole flush buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    pub fn put_i8(&mut self, v: i8) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_handle(&mut self, h: Handle) {
        self.put_u64(h.to_raw());
    }

    pub fn put_bytes_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_string(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// `u64 count` followed by each element encoded by `f`.
    pub fn put_vec<T>(&mut self, items: &[T], mut f: impl FnMut(&mut Self, &T)) {
        self.put_u64(items.len() as u64);
        for item in items {
            f(self, item);
        }
    }

    /// `u64 byte-count` followed by the raw bytes (used for data array payloads).
    pub fn put_byte_vec(&mut self, bytes: &[u8]) {
        self.put_u64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }
}

/// Cursor over a received byte slice.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Slice off exactly `n` bytes and advance the cursor past them.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                wanted: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_i8(&mut self) -> Result<i8, CodecError> {
        Ok(i8::from_le_bytes(self.take(1)?.try_into().unwrap()))
    }

    pub fn get_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_i16(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_handle(&mut self) -> Result<Handle, CodecError> {
        Ok(Handle::from_raw(self.get_u64()?))
    }

    pub fn get_string(&mut self) -> Result<String, CodecError> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidString)
    }

    pub fn get_vec<T>(
        &mut self,
        mut f: impl FnMut(&mut Self) -> Result<T, CodecError>,
    ) -> Result<Vec<T>, CodecError> {
        let count = self.get_u64()? as usize;
        let mut out = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            out.push(f(self)?);
        }
        Ok(out)
    }

    pub fn get_byte_vec(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.get_u64()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

/// Implemented by every type that appears as a command argument or parameter
/// payload. `decode` must be the exact inverse of `encode`.
pub trait WireEncode: Sized {
    fn encode(&self, enc: &mut Encoder);
    fn decode(dec: &mut Decoder) -> Result<Self, CodecError>;
}

macro_rules! impl_wire_scalar {
    ($ty:ty, $put:ident, $get:ident) => {
        impl WireEncode for $ty {
            fn encode(&self, enc: &mut Encoder) {
                enc.$put(*self);
            }
            fn decode(dec: &mut Decoder) -> Result<Self, CodecError> {
                dec.$get()
            }
        }
    };
}

impl_wire_scalar!(bool, put_bool, get_bool);
impl_wire_scalar!(i8, put_i8, get_i8);
impl_wire_scalar!(u8, put_u8, get_u8);
impl_wire_scalar!(i16, put_i16, get_i16);
impl_wire_scalar!(u16, put_u16, get_u16);
impl_wire_scalar!(i32, put_i32, get_i32);
impl_wire_scalar!(u32, put_u32, get_u32);
impl_wire_scalar!(i64, put_i64, get_i64);
impl_wire_scalar!(u64, put_u64, get_u64);
impl_wire_scalar!(f32, put_f32, get_f32);
impl_wire_scalar!(f64, put_f64, get_f64);

impl WireEncode for String {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_string(self);
    }
    fn decode(dec: &mut Decoder) -> Result<Self, CodecError> {
        dec.get_string()
    }
}

impl WireEncode for Handle {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_handle(*self);
    }
    fn decode(dec: &mut Decoder) -> Result<Self, CodecError> {
        dec.get_handle()
    }
}

impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_vec(self, |e, item| item.encode(e));
    }
    fn decode(dec: &mut Decoder) -> Result<Self, CodecError> {
        dec.get_vec(|d| T::decode(d))
    }
}

impl<T: WireEncode, const N: usize> WireEncode for [T; N] {
    fn encode(&self, enc: &mut Encoder) {
        for item in self {
            item.encode(enc);
        }
    }
    fn decode(dec: &mut Decoder) -> Result<Self, CodecError> {
        // No general const-generic "try from iter"; build via Vec then convert.
        let mut items = Vec::with_capacity(N);
        for _ in 0..N {
            items.push(T::decode(dec)?);
        }
        match items.try_into() {
            Ok(arr) => Ok(arr),
            Err(_) => unreachable!("pushed exactly N elements"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_round_trip() {
        let mut enc = Encoder::new();
        42u8.encode(&mut enc);
        (-7i32).encode(&mut enc);
        3.5f64.encode(&mut enc);
        true.encode(&mut enc);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(u8::decode(&mut dec).unwrap(), 42);
        assert_eq!(i32::decode(&mut dec).unwrap(), -7);
        assert_eq!(f64::decode(&mut dec).unwrap(), 3.5);
        assert!(bool::decode(&mut dec).unwrap());
        assert!(dec.is_empty());
    }

    #[test]
    fn string_round_trips_without_terminator() {
        let mut enc = Encoder::new();
        "hello, world".to_string().encode(&mut enc);
        let bytes = enc.into_bytes();
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 12);
        let mut dec = Decoder::new(&bytes);
        assert_eq!(String::decode(&mut dec).unwrap(), "hello, world");
    }

    #[test]
    fn vec_round_trips() {
        let items = vec![1u32, 2, 3, 4, 5];
        let mut enc = Encoder::new();
        items.encode(&mut enc);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(Vec::<u32>::decode(&mut dec).unwrap(), items);
    }

    #[test]
    fn truncated_buffer_errors() {
        let mut dec = Decoder::new(&[1, 2]);
        assert_eq!(
            u32::decode(&mut dec),
            Err(CodecError::Truncated {
                wanted: 4,
                available: 2
            })
        );
    }

    #[test]
    fn fixed_array_round_trips() {
        let v: [f32; 3] = [1.0, 2.0, 3.0];
        let mut enc = Encoder::new();
        v.encode(&mut enc);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(<[f32; 3]>::decode(&mut dec).unwrap(), v);
    }
}
