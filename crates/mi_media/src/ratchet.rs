//! Per-stream symmetric media ratchet.
//!
//! One chain key per stream direction. Every packet advances the chain:
//!
//!   ck', mk <- HKDF(ck, "mi_e2ee_media_ck_v1")
//!
//! so a captured chain key never reveals earlier packets. Reordering is
//! tolerated inside a bounded window: skipping forward derives and stores
//! the intermediate message keys (FIFO-capped), and a packet behind the
//! window that is not in the store is gone permanently.

use std::collections::{HashMap, VecDeque};

use zeroize::Zeroize;

use mi_crypto::aead;
use mi_crypto::kdf::hkdf_expand_pair;

use crate::error::MediaError;
use crate::frame::{decode_media_frame, encode_media_frame, MediaFrame, StreamKind};
use crate::packet::{
    decode_media_packet, encode_media_packet, header_ad, MediaPacket, MEDIA_PACKET_VERSION,
};

/// Receive window: a packet further than this ahead of the chain is
/// rejected rather than walked to.
const MAX_MEDIA_SKIP: u32 = 2048;
/// FIFO cap on retained skipped message keys per ratchet.
const MAX_MEDIA_SKIPPED_KEYS: usize = 512;

const MEDIA_CK_LABEL: &[u8] = b"mi_e2ee_media_ck_v1";
const MEDIA_AUDIO_LABEL: &[u8] = b"mi_e2ee_media_audio_v1";
const MEDIA_VIDEO_LABEL: &[u8] = b"mi_e2ee_media_video_v1";

#[derive(Clone)]
pub struct MediaKeyPair {
    pub send_ck: [u8; 32],
    pub recv_ck: [u8; 32],
}

impl Drop for MediaKeyPair {
    fn drop(&mut self) {
        self.send_ck.zeroize();
        self.recv_ck.zeroize();
    }
}

/// Derive the two directional chain keys for one stream from the media
/// root. The halves swap on `initiator` so the two ends of a 1:1 call read
/// matching pairs from opposite ends of the same 64-byte expansion.
pub fn derive_stream_chain_keys(
    media_root: &[u8; 32],
    kind: StreamKind,
    initiator: bool,
) -> Result<MediaKeyPair, MediaError> {
    let label = match kind {
        StreamKind::Audio => MEDIA_AUDIO_LABEL,
        StreamKind::Video => MEDIA_VIDEO_LABEL,
    };
    let (first, second) = hkdf_expand_pair(media_root, None, label).map_err(|_| MediaError::Kdf)?;
    Ok(if initiator {
        MediaKeyPair {
            send_ck: first,
            recv_ck: second,
        }
    } else {
        MediaKeyPair {
            send_ck: second,
            recv_ck: first,
        }
    })
}

fn kdf_media_ck(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), MediaError> {
    hkdf_expand_pair(ck, None, MEDIA_CK_LABEL).map_err(|_| MediaError::Kdf)
}

fn build_nonce(seq: u32) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[..4].copy_from_slice(&seq.to_le_bytes());
    nonce
}

pub struct MediaRatchet {
    ck: [u8; 32],
    next_seq: u32,
    key_id: u32,
    kind: StreamKind,
    skipped: HashMap<u32, [u8; 32]>,
    skipped_order: VecDeque<u32>,
}

impl Drop for MediaRatchet {
    fn drop(&mut self) {
        self.ck.zeroize();
        for (_, mk) in self.skipped.iter_mut() {
            mk.zeroize();
        }
    }
}

impl MediaRatchet {
    pub fn new(chain_key: [u8; 32], kind: StreamKind, start_seq: u32, key_id: u32) -> Self {
        Self {
            ck: chain_key,
            next_seq: start_seq,
            key_id,
            kind,
            skipped: HashMap::new(),
            skipped_order: VecDeque::new(),
        }
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    /// Encrypt one frame into a wire packet. `seq` increments
    /// unconditionally, even if the caller drops the packet.
    pub fn encrypt_frame(&mut self, frame: &MediaFrame) -> Result<Vec<u8>, MediaError> {
        if frame.kind != self.kind {
            return Err(MediaError::KindMismatch);
        }
        let mut plain = encode_media_frame(frame);

        let (next_ck, mut mk) = kdf_media_ck(&self.ck)?;

        let mut packet = MediaPacket {
            version: MEDIA_PACKET_VERSION,
            kind: self.kind,
            key_id: self.key_id,
            seq: self.next_seq,
            tag: [0; 16],
            cipher: Vec::new(),
        };
        let nonce = build_nonce(packet.seq);
        let ad = header_ad(&packet);
        let locked = aead::lock(&mk, &nonce, &ad, &plain);
        mk.zeroize();
        plain.zeroize();
        let (cipher, tag) = locked.map_err(|_| MediaError::Kdf)?;
        packet.cipher = cipher;
        packet.tag = tag;

        self.ck = next_ck;
        self.next_seq += 1;
        Ok(encode_media_packet(&packet))
    }

    /// Decrypt one wire packet back into a frame, walking the chain
    /// forward (storing skipped keys) or consulting the skipped store.
    pub fn decrypt_frame(&mut self, packet: &[u8]) -> Result<MediaFrame, MediaError> {
        let parsed = decode_media_packet(packet)?;
        if parsed.kind != self.kind {
            return Err(MediaError::KindMismatch);
        }
        if parsed.key_id != self.key_id {
            return Err(MediaError::KeyIdMismatch);
        }

        let mut mk = self.derive_message_key(parsed.seq)?;
        let nonce = build_nonce(parsed.seq);
        let ad = header_ad(&parsed);
        let plain = aead::unlock(&mk, &nonce, &ad, &parsed.cipher, &parsed.tag)
            .map_err(|_| MediaError::DecryptFailed);
        mk.zeroize();
        let plain = plain?;
        decode_media_frame(&plain)
    }

    fn derive_message_key(&mut self, seq: u32) -> Result<[u8; 32], MediaError> {
        if seq < self.next_seq {
            return self.load_skipped(seq).ok_or(MediaError::Expired);
        }
        if seq - self.next_seq > MAX_MEDIA_SKIP {
            return Err(MediaError::GapTooLarge);
        }
        while self.next_seq < seq {
            let (next_ck, mk) = kdf_media_ck(&self.ck)?;
            self.store_skipped(self.next_seq, mk);
            self.ck = next_ck;
            self.next_seq += 1;
        }
        let (next_ck, mk) = kdf_media_ck(&self.ck)?;
        self.ck = next_ck;
        self.next_seq = seq + 1;
        Ok(mk)
    }

    fn store_skipped(&mut self, seq: u32, mk: [u8; 32]) {
        if self.skipped.insert(seq, mk).is_none() {
            self.skipped_order.push_back(seq);
        }
        while self.skipped.len() > MAX_MEDIA_SKIPPED_KEYS {
            let Some(drop_seq) = self.skipped_order.pop_front() else {
                self.skipped.clear();
                return;
            };
            if let Some(mut dropped) = self.skipped.remove(&drop_seq) {
                dropped.zeroize();
            }
        }
    }

    fn load_skipped(&mut self, seq: u32) -> Option<[u8; 32]> {
        self.skipped.remove(&seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: StreamKind, ts: u64, payload: &[u8]) -> MediaFrame {
        MediaFrame {
            call_id: [0xA0; 16],
            kind,
            flags: 0,
            timestamp_ms: ts,
            payload: payload.to_vec(),
        }
    }

    fn pair(kind: StreamKind) -> (MediaRatchet, MediaRatchet) {
        let root = [0x11u8; 32];
        let initiator = derive_stream_chain_keys(&root, kind, true).unwrap();
        let responder = derive_stream_chain_keys(&root, kind, false).unwrap();
        // Initiator's send chain is the responder's receive chain.
        assert_eq!(initiator.send_ck, responder.recv_ck);
        assert_eq!(initiator.recv_ck, responder.send_ck);
        (
            MediaRatchet::new(initiator.send_ck, kind, 0, 1),
            MediaRatchet::new(responder.recv_ck, kind, 0, 1),
        )
    }

    #[test]
    fn in_order_roundtrip() {
        let (mut tx, mut rx) = pair(StreamKind::Audio);
        for i in 0..10u64 {
            let f = frame(StreamKind::Audio, i, &[i as u8]);
            let packet = tx.encrypt_frame(&f).unwrap();
            assert_eq!(rx.decrypt_frame(&packet).unwrap(), f);
        }
    }

    #[test]
    fn out_of_order_within_window() {
        let (mut tx, mut rx) = pair(StreamKind::Video);
        let packets: Vec<_> = (0..5u64)
            .map(|i| tx.encrypt_frame(&frame(StreamKind::Video, i, &[i as u8])).unwrap())
            .collect();
        // 4 first, then the stragglers.
        assert_eq!(rx.decrypt_frame(&packets[4]).unwrap().payload, vec![4]);
        assert_eq!(rx.decrypt_frame(&packets[1]).unwrap().payload, vec![1]);
        assert_eq!(rx.decrypt_frame(&packets[0]).unwrap().payload, vec![0]);
        assert_eq!(rx.decrypt_frame(&packets[3]).unwrap().payload, vec![3]);
        assert_eq!(rx.decrypt_frame(&packets[2]).unwrap().payload, vec![2]);
        // A consumed key is gone.
        assert_eq!(
            rx.decrypt_frame(&packets[1]),
            Err(MediaError::Expired)
        );
    }

    #[test]
    fn gap_beyond_window_is_rejected() {
        let (mut tx, mut rx) = pair(StreamKind::Audio);
        let mut late = Vec::new();
        for i in 0..2050u64 {
            late = tx.encrypt_frame(&frame(StreamKind::Audio, i, &[1])).unwrap();
        }
        assert_eq!(rx.decrypt_frame(&late), Err(MediaError::GapTooLarge));
    }

    #[test]
    fn skipped_store_is_fifo_capped() {
        let (mut tx, mut rx) = pair(StreamKind::Audio);
        let mut packets = Vec::new();
        for i in 0..1025u64 {
            packets.push(tx.encrypt_frame(&frame(StreamKind::Audio, i, &[2])).unwrap());
        }
        // Jump to the end: 1024 intermediate keys derived, cap is 512,
        // so seq 0..512 were evicted and 512.. survive.
        rx.decrypt_frame(&packets[1024]).unwrap();
        assert_eq!(rx.decrypt_frame(&packets[0]), Err(MediaError::Expired));
        assert!(rx.decrypt_frame(&packets[600]).is_ok());
    }

    #[test]
    fn kind_and_key_id_are_enforced() {
        let (mut tx, _) = pair(StreamKind::Audio);
        assert_eq!(
            tx.encrypt_frame(&frame(StreamKind::Video, 0, &[0])),
            Err(MediaError::KindMismatch)
        );

        let root = [0x22u8; 32];
        let keys = derive_stream_chain_keys(&root, StreamKind::Audio, true).unwrap();
        let mut tx7 = MediaRatchet::new(keys.send_ck, StreamKind::Audio, 0, 7);
        let mut rx8 = MediaRatchet::new(keys.recv_ck, StreamKind::Audio, 0, 8);
        let packet = tx7.encrypt_frame(&frame(StreamKind::Audio, 0, &[0])).unwrap();
        assert_eq!(rx8.decrypt_frame(&packet), Err(MediaError::KeyIdMismatch));
    }

    #[test]
    fn tampered_packet_fails_auth() {
        let (mut tx, mut rx) = pair(StreamKind::Audio);
        let mut packet = tx.encrypt_frame(&frame(StreamKind::Audio, 0, &[1, 2])).unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 1;
        assert_eq!(rx.decrypt_frame(&packet), Err(MediaError::DecryptFailed));
    }
}
