use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::util::buf::{put_byte_slice, put_string, try_get_byte_slice, try_get_string};


/// Application payloads are serialized by their own code - the channel layer moves opaque bytes.
///
/// NB: `deser` must consume exactly the bytes written by `ser`; trailing bytes are treated as a
///      corrupt payload.
pub trait NetSerializable: Debug + Sized + Send + Sync + 'static {
    fn ser(&self, buf: &mut BytesMut);
    fn deser(buf: &mut Bytes) -> anyhow::Result<Self>;
}

/// A serialized payload as it travels inside a `Data` envelope: the raw bytes plus a short
///  human-readable rendering of the original value for logging.
#[derive(Clone, Eq, PartialEq)]
pub struct SerializedObject {
    bytes: Bytes,
    display: String,
}

impl SerializedObject {
    const MAX_DISPLAY_LEN: usize = 64;

    pub fn new<T: NetSerializable>(value: &T) -> SerializedObject {
        let mut buf = BytesMut::new();
        value.ser(&mut buf);

        let display = format!("{:?}", value)
            .chars()
            .take(Self::MAX_DISPLAY_LEN)
            .collect();

        SerializedObject {
            bytes: buf.freeze(),
            display,
        }
    }

    pub fn from_raw(bytes: Bytes, display: &str) -> SerializedObject {
        SerializedObject {
            bytes,
            display: display.to_string(),
        }
    }

    pub fn empty() -> SerializedObject {
        Self::from_raw(Bytes::new(), "")
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn get<T: NetSerializable>(&self) -> anyhow::Result<T> {
        let mut buf = self.bytes.clone();
        let value = T::deser(&mut buf)?;
        if buf.has_remaining() {
            bail!("{} trailing bytes after deserializing {:?}", buf.remaining(), self.display);
        }
        Ok(value)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        put_byte_slice(buf, &self.bytes);
        put_string(buf, &self.display);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<SerializedObject> {
        let bytes = try_get_byte_slice(buf)?;
        let display = try_get_string(buf)?;
        Ok(SerializedObject {
            bytes,
            display,
        })
    }
}

impl Debug for SerializedObject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SerializedObject({}, {} bytes)", self.display, self.bytes.len())
    }
}

impl NetSerializable for String {
    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, self);
    }

    fn deser(buf: &mut Bytes) -> anyhow::Result<Self> {
        try_get_string(buf)
    }
}

impl NetSerializable for Vec<u8> {
    fn ser(&self, buf: &mut BytesMut) {
        put_byte_slice(buf, self);
    }

    fn deser(buf: &mut Bytes) -> anyhow::Result<Self> {
        Ok(try_get_byte_slice(buf)?.to_vec())
    }
}

impl NetSerializable for Bytes {
    fn ser(&self, buf: &mut BytesMut) {
        put_byte_slice(buf, self);
    }

    fn deser(buf: &mut Bytes) -> anyhow::Result<Self> {
        try_get_byte_slice(buf)
    }
}

impl NetSerializable for u64 {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(*self);
    }

    fn deser(buf: &mut Bytes) -> anyhow::Result<Self> {
        Ok(buf.try_get_u64()?)
    }
}

impl NetSerializable for i64 {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_i64(*self);
    }

    fn deser(buf: &mut Bytes) -> anyhow::Result<Self> {
        Ok(buf.try_get_i64()?)
    }
}
