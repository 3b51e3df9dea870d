//! Primitive readers and writers shared by every serialized form in the
//! crate (message bodies, hint records, the system record).
//!
//! Readers take `&mut &[u8]` and advance it; all length prefixes are
//! big-endian.

use bytes::{Buf, BufMut};

use crate::errors::CodecError;

pub(crate) fn read_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::UnexpectedEndOfBuffer);
    }
    Ok(buf.get_u8())
}

pub(crate) fn read_u32(buf: &mut &[u8]) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::UnexpectedEndOfBuffer);
    }
    Ok(buf.get_u32())
}

pub(crate) fn read_i64(buf: &mut &[u8]) -> Result<i64, CodecError> {
    if buf.remaining() < 8 {
        return Err(CodecError::UnexpectedEndOfBuffer);
    }
    Ok(buf.get_i64())
}

pub(crate) fn read_raw<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::UnexpectedEndOfBuffer);
    }
    let whole: &'a [u8] = *buf;
    let (head, tail) = whole.split_at(len);
    *buf = tail;
    Ok(head)
}

pub(crate) fn read_blob(buf: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = read_u32(buf)? as usize;
    Ok(read_raw(buf, len)?.to_vec())
}

pub(crate) fn read_string(buf: &mut &[u8]) -> Result<String, CodecError> {
    let len = read_u32(buf)? as usize;
    let raw = read_raw(buf, len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

pub(crate) fn read_bool(buf: &mut &[u8]) -> Result<bool, CodecError> {
    Ok(read_u8(buf)? != 0)
}

pub(crate) fn write_blob(buf: &mut impl BufMut, blob: &[u8]) {
    buf.put_u32(blob.len() as u32);
    buf.put_slice(blob);
}

pub(crate) fn write_string(buf: &mut impl BufMut, s: &str) {
    write_blob(buf, s.as_bytes());
}

pub(crate) fn write_bool(buf: &mut impl BufMut, b: bool) {
    buf.put_u8(b as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trip() {
        let mut buf = Vec::new();
        write_string(&mut buf, "messages_\u{1f980}");
        let mut slice = buf.as_slice();
        assert_eq!(read_string(&mut slice).unwrap(), "messages_\u{1f980}");
        assert!(slice.is_empty());
    }

    #[test]
    fn truncated_input_errors() {
        let mut buf = Vec::new();
        write_string(&mut buf, "abcdef");
        let mut slice = &buf[..buf.len() - 1];
        assert!(matches!(
            read_string(&mut slice),
            Err(CodecError::UnexpectedEndOfBuffer)
        ));
    }
}
