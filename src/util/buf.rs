use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_byte_slice(buf, s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_byte_slice(buf)?;
    let s = String::from_utf8(raw.to_vec())?;
    Ok(s)
}

/// length-prefixed (varint) raw bytes
pub fn put_byte_slice(buf: &mut BytesMut, data: &[u8]) {
    buf.put_usize_varint(data.len());
    buf.put_slice(data);
}

pub fn try_get_byte_slice(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        bail!("buffer underflow: length prefix is {} bytes, only {} remaining", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(if value { 1 } else { 0 });
}

pub fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        n => bail!("invalid boolean discriminator: {}", n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty("")]
    #[case::ascii("echo")]
    #[case::multi_byte("grüße")]
    fn test_string(#[case] s: &str) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);
        let mut buf = buf.freeze();
        assert_eq!(try_get_string(&mut buf).unwrap(), s);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_byte_slice_underflow() {
        let mut buf = BytesMut::new();
        buf.put_usize_varint(10);
        buf.put_slice(b"abc");
        assert!(try_get_byte_slice(&mut buf.freeze()).is_err());
    }

    #[rstest]
    #[case::f(&[0], Some(false))]
    #[case::t(&[1], Some(true))]
    #[case::invalid(&[2], None)]
    #[case::empty(&[], None)]
    fn test_bool(#[case] mut buf: &[u8], #[case] expected: Option<bool>) {
        assert_eq!(try_get_bool(&mut buf).ok(), expected);
    }
}
