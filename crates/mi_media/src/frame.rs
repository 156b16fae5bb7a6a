//! Plaintext media frame codec.
//!
//! Wire layout (encrypted as the AEAD payload of a media packet):
//!
//!   version(1) | kind(1) | flags(1) | reserved(1) | timestamp_ms_le(8)
//!   | call_id(16) | payload(*)

use crate::error::MediaError;

pub const MEDIA_FRAME_VERSION: u8 = 1;
pub const CALL_ID_BYTES: usize = 16;

/// Key frame (video) or stream-reset marker.
pub const FRAME_FLAG_KEY: u8 = 0x01;
/// Final frame of a talk spurt / stream.
pub const FRAME_FLAG_END: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum StreamKind {
    Audio,
    Video,
}

impl StreamKind {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            StreamKind::Audio => 1,
            StreamKind::Video => 2,
        }
    }

    pub(crate) fn from_wire(v: u8) -> Option<Self> {
        match v {
            1 => Some(StreamKind::Audio),
            2 => Some(StreamKind::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    pub call_id: [u8; CALL_ID_BYTES],
    pub kind: StreamKind,
    pub flags: u8,
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

pub fn encode_media_frame(frame: &MediaFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 1 + 1 + 1 + 8 + CALL_ID_BYTES + frame.payload.len());
    out.push(MEDIA_FRAME_VERSION);
    out.push(frame.kind.to_wire());
    out.push(frame.flags);
    out.push(0); // reserved
    out.extend_from_slice(&frame.timestamp_ms.to_le_bytes());
    out.extend_from_slice(&frame.call_id);
    out.extend_from_slice(&frame.payload);
    out
}

pub fn decode_media_frame(data: &[u8]) -> Result<MediaFrame, MediaError> {
    let min_size = 1 + 1 + 1 + 1 + 8 + CALL_ID_BYTES;
    if data.len() < min_size {
        return Err(MediaError::FrameDecode);
    }
    let mut off = 0;
    let version = data[off];
    off += 1;
    if version != MEDIA_FRAME_VERSION {
        return Err(MediaError::FrameDecode);
    }
    let kind = StreamKind::from_wire(data[off]).ok_or(MediaError::FrameDecode)?;
    off += 1;
    let flags = data[off];
    off += 1;
    off += 1; // reserved
    let mut ts_bytes = [0u8; 8];
    ts_bytes.copy_from_slice(&data[off..off + 8]);
    off += 8;
    let mut call_id = [0u8; CALL_ID_BYTES];
    call_id.copy_from_slice(&data[off..off + CALL_ID_BYTES]);
    off += CALL_ID_BYTES;
    Ok(MediaFrame {
        call_id,
        kind,
        flags,
        timestamp_ms: u64::from_le_bytes(ts_bytes),
        payload: data[off..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let frame = MediaFrame {
            call_id: [0xA0; 16],
            kind: StreamKind::Video,
            flags: FRAME_FLAG_KEY,
            timestamp_ms: 0x0102_0304_0506_0708,
            payload: vec![1, 2, 3, 4],
        };
        let encoded = encode_media_frame(&frame);
        assert_eq!(decode_media_frame(&encoded).unwrap(), frame);
    }

    #[test]
    fn rejects_short_or_unknown() {
        assert!(decode_media_frame(&[1, 1, 0]).is_err());
        let mut encoded = encode_media_frame(&MediaFrame {
            call_id: [0; 16],
            kind: StreamKind::Audio,
            flags: 0,
            timestamp_ms: 0,
            payload: vec![],
        });
        encoded[0] = 9; // unknown version
        assert!(decode_media_frame(&encoded).is_err());
        encoded[0] = MEDIA_FRAME_VERSION;
        encoded[1] = 7; // unknown kind
        assert!(decode_media_frame(&encoded).is_err());
    }
}
