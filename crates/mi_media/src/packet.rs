//! Encrypted media packet wire format.
//!
//! v3: `version(1) | kind(1) | key_id_le(4) | seq_le(4) | tag(16) | cipher`
//! v2: `version(1) | kind(1) | seq_le(4) | tag(16) | cipher` — historical
//! packets without a key epoch; decoders treat their `key_id` as 1.
//!
//! Peeking exposes `(kind, key_id, seq)` without touching the ciphertext
//! so the receiver can route to the right ratchet before any key work.

use crate::error::MediaError;
use crate::frame::StreamKind;

pub const MEDIA_PACKET_VERSION: u8 = 3;
pub const TAG_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    pub version: u8,
    pub kind: StreamKind,
    pub key_id: u32,
    pub seq: u32,
    pub tag: [u8; TAG_BYTES],
    pub cipher: Vec<u8>,
}

impl Default for MediaPacket {
    fn default() -> Self {
        Self {
            version: MEDIA_PACKET_VERSION,
            kind: StreamKind::Audio,
            key_id: 1,
            seq: 0,
            tag: [0; TAG_BYTES],
            cipher: Vec::new(),
        }
    }
}

pub fn encode_media_packet(packet: &MediaPacket) -> Vec<u8> {
    let header_extra = if packet.version >= 3 { 4 } else { 0 };
    let mut out = Vec::with_capacity(1 + 1 + 4 + header_extra + TAG_BYTES + packet.cipher.len());
    out.push(packet.version);
    out.push(packet.kind.to_wire());
    if packet.version >= 3 {
        out.extend_from_slice(&packet.key_id.to_le_bytes());
    }
    out.extend_from_slice(&packet.seq.to_le_bytes());
    out.extend_from_slice(&packet.tag);
    out.extend_from_slice(&packet.cipher);
    out
}

fn read_le32(data: &[u8], off: &mut usize) -> Option<u32> {
    let bytes = data.get(*off..*off + 4)?;
    *off += 4;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

pub fn decode_media_packet(data: &[u8]) -> Result<MediaPacket, MediaError> {
    let (version, kind, key_id, seq, mut off) = parse_header(data)?;
    let tag_slice = data
        .get(off..off + TAG_BYTES)
        .ok_or(MediaError::PacketDecode)?;
    let mut tag = [0u8; TAG_BYTES];
    tag.copy_from_slice(tag_slice);
    off += TAG_BYTES;
    Ok(MediaPacket {
        version,
        kind,
        key_id,
        seq,
        tag,
        cipher: data[off..].to_vec(),
    })
}

/// `(kind, key_id, seq)` without decrypting.
pub fn peek_media_packet_header(data: &[u8]) -> Result<(StreamKind, u32, u32), MediaError> {
    let (_, kind, key_id, seq, _) = parse_header(data)?;
    Ok((kind, key_id, seq))
}

fn parse_header(data: &[u8]) -> Result<(u8, StreamKind, u32, u32, usize), MediaError> {
    if data.len() < 1 + 1 + 4 {
        return Err(MediaError::PacketDecode);
    }
    let mut off = 0;
    let version = data[off];
    off += 1;
    match version {
        2 => {
            let kind = StreamKind::from_wire(data[off]).ok_or(MediaError::PacketDecode)?;
            off += 1;
            let seq = read_le32(data, &mut off).ok_or(MediaError::PacketDecode)?;
            Ok((version, kind, 1, seq, off))
        }
        3 => {
            let kind = StreamKind::from_wire(data[off]).ok_or(MediaError::PacketDecode)?;
            off += 1;
            let key_id = read_le32(data, &mut off).ok_or(MediaError::PacketDecode)?;
            let seq = read_le32(data, &mut off).ok_or(MediaError::PacketDecode)?;
            Ok((version, kind, key_id, seq, off))
        }
        _ => Err(MediaError::PacketDecode),
    }
}

/// Header bytes as authenticated by the AEAD (exactly the wire prefix).
pub(crate) fn header_ad(packet: &MediaPacket) -> Vec<u8> {
    let mut ad = Vec::with_capacity(1 + 1 + 4 + 4);
    ad.push(packet.version);
    ad.push(packet.kind.to_wire());
    if packet.version >= 3 {
        ad.extend_from_slice(&packet.key_id.to_le_bytes());
    }
    ad.extend_from_slice(&packet.seq.to_le_bytes());
    ad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v3_roundtrip_and_peek() {
        let packet = MediaPacket {
            version: 3,
            kind: StreamKind::Audio,
            key_id: 7,
            seq: 42,
            tag: [0xEE; 16],
            cipher: vec![5, 6, 7],
        };
        let bytes = encode_media_packet(&packet);
        assert_eq!(decode_media_packet(&bytes).unwrap(), packet);
        assert_eq!(
            peek_media_packet_header(&bytes).unwrap(),
            (StreamKind::Audio, 7, 42)
        );
    }

    #[test]
    fn v2_legacy_decodes_with_key_id_one() {
        let legacy = MediaPacket {
            version: 2,
            kind: StreamKind::Audio,
            key_id: 1,
            seq: 5,
            tag: [0; 16],
            cipher: vec![9, 9, 9],
        };
        let bytes = encode_media_packet(&legacy);
        let decoded = decode_media_packet(&bytes).unwrap();
        assert_eq!(decoded.version, 2);
        assert_eq!(decoded.key_id, 1);
        assert_eq!(decoded.seq, 5);
        assert_eq!(decoded.cipher, vec![9, 9, 9]);
        assert_eq!(
            peek_media_packet_header(&bytes).unwrap(),
            (StreamKind::Audio, 1, 5)
        );
    }

    #[test]
    fn rejects_unknown_version_and_truncation() {
        let mut bytes = encode_media_packet(&MediaPacket::default());
        bytes[0] = 9;
        assert!(decode_media_packet(&bytes).is_err());
        bytes[0] = 3;
        assert!(decode_media_packet(&bytes[..8]).is_err());
        assert!(peek_media_packet_header(&bytes[..4]).is_err());
    }
}
