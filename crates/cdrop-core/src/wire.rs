//! Binary framing for chunked uploads.
//!
//! All integers are big-endian:
//!
//! ```text
//! total_size: u64 | chunk_offset: u64 | id_len: u8 | id | flags: u8 | payload_len: u32 | payload
//! ```
//!
//! Bit 0 of `flags` marks the last chunk of an upload; other bits must be zero.

use crate::error::WireError;

pub const MIN_ID_LEN: usize = 10;
pub const MAX_ID_LEN: usize = 64;

const FLAG_LAST: u8 = 0x01;
const FIXED_HEADER_LEN: usize = 8 + 8 + 1;

/// One chunk of a sequential upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub upload_id: String,
    /// Declared plaintext size of the whole file
    pub total_size: u64,
    pub offset: u64,
    pub is_last: bool,
    pub payload: Vec<u8>,
}

impl ChunkFrame {
    /// Fails if the id or payload is too long for its length field.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let id = self.upload_id.as_bytes();
        let id_len = u8::try_from(id.len()).map_err(|_| WireError::IdTooLong(id.len()))?;
        let payload_len = payload_len_field(self.payload.len())?;

        let mut out = Vec::with_capacity(FIXED_HEADER_LEN + id.len() + 5 + self.payload.len());
        out.extend_from_slice(&self.total_size.to_be_bytes());
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.push(id_len);
        out.extend_from_slice(id);
        out.push(if self.is_last { FLAG_LAST } else { 0 });
        out.extend_from_slice(&payload_len.to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parse a complete frame. The id is sanitised and length-checked, and the
    /// chunk must fit inside the declared total size.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor { buf, pos: 0 };
        let total_size = u64::from_be_bytes(cur.take_array()?);
        let offset = u64::from_be_bytes(cur.take_array()?);
        let [id_len] = cur.take_array::<1>()?;
        let raw_id = cur.take(id_len as usize)?;
        let [flags] = cur.take_array::<1>()?;
        if flags & !FLAG_LAST != 0 {
            return Err(WireError::UnknownFlags(flags));
        }
        let payload_len = u32::from_be_bytes(cur.take_array()?) as usize;
        let payload = cur.take(payload_len)?.to_vec();
        if cur.pos != buf.len() {
            return Err(WireError::TrailingBytes(buf.len() - cur.pos));
        }

        let upload_id = sanitize_upload_id(&String::from_utf8_lossy(raw_id))?;
        let len = payload.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > total_size) {
            return Err(WireError::OutOfBounds {
                offset,
                len,
                total: total_size,
            });
        }

        Ok(ChunkFrame {
            upload_id,
            total_size,
            offset,
            is_last: flags & FLAG_LAST != 0,
            payload,
        })
    }
}

fn payload_len_field(len: usize) -> Result<u32, WireError> {
    u32::try_from(len).map_err(|_| WireError::PayloadTooLarge(len))
}

/// Replace every character outside `[A-Za-z0-9-]` with `_` and enforce the
/// id length bounds.
pub fn sanitize_upload_id(raw: &str) -> Result<String, WireError> {
    let id: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let len = id.chars().count();
    if !(MIN_ID_LEN..=MAX_ID_LEN).contains(&len) {
        return Err(WireError::InvalidId(format!(
            "length {len} outside {MIN_ID_LEN}..={MAX_ID_LEN}"
        )));
    }
    Ok(id)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(WireError::Truncated {
                needed: end,
                have: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> ChunkFrame {
        ChunkFrame {
            upload_id: "upload-0001".into(),
            total_size: 10,
            offset: 4,
            is_last: true,
            payload: b"abcdef".to_vec(),
        }
    }

    #[test]
    fn test_encode_decode() {
        let f = frame();
        let bytes = f.encode().unwrap();
        assert_eq!(bytes.len(), 8 + 8 + 1 + 11 + 1 + 4 + 6);
        assert_eq!(&bytes[..8], &10u64.to_be_bytes());
        assert_eq!(ChunkFrame::decode(&bytes).unwrap(), f);
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = frame().encode().unwrap();
        let err = ChunkFrame::decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn test_decode_trailing() {
        let mut bytes = frame().encode().unwrap();
        bytes.push(0);
        assert_eq!(ChunkFrame::decode(&bytes).unwrap_err(), WireError::TrailingBytes(1));
    }

    #[test]
    fn test_decode_rejects_overshoot() {
        let mut f = frame();
        f.offset = 5;
        let err = ChunkFrame::decode(&f.encode().unwrap()).unwrap_err();
        assert!(matches!(err, WireError::OutOfBounds { offset: 5, len: 6, total: 10 }));
    }

    #[test]
    fn test_decode_rejects_unknown_flags() {
        let mut bytes = frame().encode().unwrap();
        let flag_pos = 8 + 8 + 1 + 11;
        bytes[flag_pos] = 0x03;
        assert_eq!(ChunkFrame::decode(&bytes).unwrap_err(), WireError::UnknownFlags(0x03));
    }

    #[test]
    fn test_sanitize_upload_id() {
        assert_eq!(sanitize_upload_id("abc/def..ghi").unwrap(), "abc_def__ghi");
        assert_eq!(sanitize_upload_id("Upload-1234").unwrap(), "Upload-1234");
        assert!(sanitize_upload_id("short").is_err());
        assert!(sanitize_upload_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_decode_sanitizes_id() {
        let mut f = frame();
        f.upload_id = "../../etc/pw".into();
        let decoded = ChunkFrame::decode(&f.encode().unwrap()).unwrap();
        assert_eq!(decoded.upload_id, "______etc_pw");
    }

    #[test]
    fn test_encode_rejects_overlong_id() {
        let mut f = frame();
        f.upload_id = "x".repeat(256);
        assert_eq!(f.encode().unwrap_err(), WireError::IdTooLong(256));

        f.upload_id = "x".repeat(255);
        assert!(f.encode().is_ok());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_payload_len_field_bounds() {
        assert_eq!(payload_len_field(u32::MAX as usize).unwrap(), u32::MAX);
        let over = u32::MAX as usize + 1;
        assert_eq!(payload_len_field(over).unwrap_err(), WireError::PayloadTooLarge(over));
    }
}
