use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

/// Writes a string with a u16 length prefix, as used for invocation ids and
///  call paths in the envelope layout.
pub fn put_string_u16(buf: &mut BytesMut, s: &str) -> anyhow::Result<()> {
    let Ok(len) = u16::try_from(s.len()) else {
        bail!("string of {} bytes exceeds the u16 length prefix", s.len());
    };
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

pub fn try_get_string_u16(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_u16()? as usize;
    try_get_utf8(buf, len)
}

/// Writes a string with a u32 length prefix, as used inside encoded values.
pub fn put_string_u32(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string_u32(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_u32()? as usize;
    try_get_utf8(buf, len)
}

pub fn try_get_bytes(buf: &mut impl Buf, len: usize) -> anyhow::Result<Vec<u8>> {
    if buf.remaining() < len {
        bail!("buffer underflow: {} bytes expected, {} remaining", len, buf.remaining());
    }
    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);
    Ok(result)
}

fn try_get_utf8(buf: &mut impl Buf, len: usize) -> anyhow::Result<String> {
    let bytes = try_get_bytes(buf, len)?;
    Ok(String::from_utf8(bytes)?)
}
