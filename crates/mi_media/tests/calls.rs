//! End-to-end media tests over an in-memory relay: 1:1 sessions, group
//! calls with key epochs, and both faces of the session capability trait.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use mi_crypto::kdf::hkdf_expand;
use mi_media::group::{GroupCallMediaAdapter, GroupCallSession, GroupCallSessionConfig};
use mi_media::session::{MediaSession, MediaSessionApi, MediaSessionConfig};
use mi_media::transport::{CallId, MediaRelayPacket, MediaTransport};
use mi_media::{MediaError, StreamKind};

const CALL_ID: CallId = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
    0x0F,
];

/// In-memory relay: every peer sees everyone else's packets, group call
/// keys are derived per key_id from a fixed group secret.
struct TestRelay {
    local_user: String,
    media_root: [u8; 32],
    group_secret: [u8; 32],
    outbox: Mutex<Vec<MediaRelayPacket>>,
    inbox: Mutex<Vec<MediaRelayPacket>>,
    group_inbox: Mutex<Vec<MediaRelayPacket>>,
    key_requests: Mutex<HashMap<u32, u32>>,
}

impl TestRelay {
    fn new(local_user: &str) -> Self {
        Self {
            local_user: local_user.to_string(),
            media_root: [0x11; 32],
            group_secret: [0x33; 32],
            outbox: Mutex::new(Vec::new()),
            inbox: Mutex::new(Vec::new()),
            group_inbox: Mutex::new(Vec::new()),
            key_requests: Mutex::new(HashMap::new()),
        }
    }

    fn deliver(&self, sender: &str, payload: Vec<u8>) {
        self.inbox.lock().push(MediaRelayPacket {
            sender: sender.to_string(),
            payload,
        });
    }

    fn deliver_group(&self, sender: &str, payload: Vec<u8>) {
        self.group_inbox.lock().push(MediaRelayPacket {
            sender: sender.to_string(),
            payload,
        });
    }

    fn sent(&self) -> Vec<MediaRelayPacket> {
        self.outbox.lock().clone()
    }
}

impl MediaTransport for TestRelay {
    fn derive_media_root(
        &self,
        _peer_username: &str,
        _call_id: &CallId,
    ) -> Result<[u8; 32], MediaError> {
        Ok(self.media_root)
    }

    fn push_media(
        &self,
        _peer_username: &str,
        _call_id: &CallId,
        packet: &[u8],
    ) -> Result<(), MediaError> {
        self.outbox.lock().push(MediaRelayPacket {
            sender: self.local_user.clone(),
            payload: packet.to_vec(),
        });
        Ok(())
    }

    fn pull_media(
        &self,
        _call_id: &CallId,
        max_packets: u32,
        _wait_ms: u32,
    ) -> Result<Vec<MediaRelayPacket>, MediaError> {
        let mut inbox = self.inbox.lock();
        let take = inbox.len().min(max_packets as usize);
        Ok(inbox.drain(..take).collect())
    }

    fn push_group_media(
        &self,
        _group_id: &str,
        _call_id: &CallId,
        packet: &[u8],
    ) -> Result<(), MediaError> {
        self.outbox.lock().push(MediaRelayPacket {
            sender: self.local_user.clone(),
            payload: packet.to_vec(),
        });
        Ok(())
    }

    fn pull_group_media(
        &self,
        _call_id: &CallId,
        max_packets: u32,
        _wait_ms: u32,
    ) -> Result<Vec<MediaRelayPacket>, MediaError> {
        let mut inbox = self.group_inbox.lock();
        let take = inbox.len().min(max_packets as usize);
        Ok(inbox.drain(..take).collect())
    }

    fn get_group_call_key(
        &self,
        _group_id: &str,
        _call_id: &CallId,
        key_id: u32,
    ) -> Result<[u8; 32], MediaError> {
        *self.key_requests.lock().entry(key_id).or_insert(0) += 1;
        let mut key = [0u8; 32];
        hkdf_expand(&self.group_secret, None, &key_id.to_le_bytes(), &mut key)
            .map_err(|_| MediaError::CallKeyMissing)?;
        Ok(key)
    }
}

fn session_config(peer: &str, initiator: bool) -> MediaSessionConfig {
    MediaSessionConfig {
        peer_username: peer.to_string(),
        call_id: CALL_ID,
        initiator,
        ..Default::default()
    }
}

#[test]
fn stream_ratchet_roundtrip_with_key_epoch() {
    use mi_media::packet::peek_media_packet_header;
    use mi_media::ratchet::{derive_stream_chain_keys, MediaRatchet};
    use mi_media::MediaFrame;

    let media_root = [0x11u8; 32];
    let sender_keys = derive_stream_chain_keys(&media_root, StreamKind::Audio, true).unwrap();
    let receiver_keys = derive_stream_chain_keys(&media_root, StreamKind::Audio, false).unwrap();

    let mut sender = MediaRatchet::new(sender_keys.send_ck, StreamKind::Audio, 0, 7);
    let mut receiver = MediaRatchet::new(receiver_keys.recv_ck, StreamKind::Audio, 0, 7);

    let frame = MediaFrame {
        call_id: CALL_ID,
        kind: StreamKind::Audio,
        flags: 0,
        timestamp_ms: 1234,
        payload: vec![1, 2, 3],
    };
    let packet = sender.encrypt_frame(&frame).unwrap();

    let (kind, key_id, seq) = peek_media_packet_header(&packet).unwrap();
    assert_eq!(kind, StreamKind::Audio);
    assert_eq!(key_id, 7);
    assert_eq!(seq, 0);

    let out = receiver.decrypt_frame(&packet).unwrap();
    assert_eq!(out, frame);
}

#[test]
fn one_to_one_audio_roundtrip() {
    let alice_relay = Arc::new(TestRelay::new("alice"));
    let bob_relay = Arc::new(TestRelay::new("bob"));

    let mut alice = MediaSession::new(alice_relay.clone(), session_config("bob", true));
    let mut bob = MediaSession::new(bob_relay.clone(), session_config("alice", false));
    alice.init().unwrap();
    bob.init().unwrap();

    alice.send_audio_frame(&[1, 2, 3], 1234, 0).unwrap();
    alice.send_audio_frame(&[4, 5, 6], 1254, 0).unwrap();
    for packet in alice_relay.sent() {
        bob_relay.deliver("alice", packet.payload);
    }

    bob.poll_incoming(16, 0, 5000).unwrap();
    assert_eq!(bob.stats().audio.frames_recv, 2);

    let f1 = bob.pop_audio_frame(1_000_000).unwrap();
    let f2 = bob.pop_audio_frame(1_000_000).unwrap();
    assert_eq!(f1.payload, vec![1, 2, 3]);
    assert_eq!(f1.timestamp_ms, 1234);
    assert_eq!(f1.kind, StreamKind::Audio);
    assert_eq!(f1.call_id, CALL_ID);
    assert_eq!(f2.payload, vec![4, 5, 6]);
    assert_eq!(bob.audio_jitter_stats().popped, 2);
}

#[test]
fn packets_from_other_peers_are_ignored() {
    let relay = Arc::new(TestRelay::new("bob"));
    let mut bob = MediaSession::new(relay.clone(), session_config("alice", false));
    bob.init().unwrap();

    relay.deliver("mallory", vec![3, 1, 99, 0, 0, 0, 0]);
    bob.poll_incoming(16, 0, 0).unwrap();
    assert_eq!(bob.stats().audio.frames_recv, 0);
    assert_eq!(bob.stats().audio.decrypt_fail, 0);
}

#[test]
fn tampered_packet_counts_decrypt_failure() {
    let alice_relay = Arc::new(TestRelay::new("alice"));
    let bob_relay = Arc::new(TestRelay::new("bob"));
    let mut alice = MediaSession::new(alice_relay.clone(), session_config("bob", true));
    let mut bob = MediaSession::new(bob_relay.clone(), session_config("alice", false));
    alice.init().unwrap();
    bob.init().unwrap();

    alice.send_audio_frame(&[9], 10, 0).unwrap();
    let mut payload = alice_relay.sent()[0].payload.clone();
    let last = payload.len() - 1;
    payload[last] ^= 0xFF;
    bob_relay.deliver("alice", payload);

    assert_eq!(
        bob.poll_incoming(16, 0, 0),
        Err(MediaError::DecryptFailed)
    );
    assert_eq!(bob.stats().audio.decrypt_fail, 1);
}

#[test]
fn group_call_rekey_and_late_old_epoch_packet() {
    let alice_relay = Arc::new(TestRelay::new("alice"));
    let bob_relay = Arc::new(TestRelay::new("bob"));

    let config = GroupCallSessionConfig {
        group_id: "team".to_string(),
        call_id: CALL_ID,
        ..Default::default()
    };
    let mut alice = GroupCallSession::new(alice_relay.clone(), config.clone());
    let mut bob = GroupCallSession::new(bob_relay.clone(), config);
    alice.init().unwrap();
    bob.init().unwrap();
    assert_eq!(alice.active_key_id(), 1);

    // Epoch 1 traffic.
    alice.send_audio_frame(&[1], 100, 0).unwrap();
    let epoch1_packets = alice_relay.sent();

    // Rekey after a membership change; send restarts at seq 0 under key 2.
    alice.set_active_key(2).unwrap();
    assert_eq!(alice.active_key_id(), 2);
    alice.send_audio_frame(&[2], 120, 0).unwrap();
    let all_packets = alice_relay.sent();
    let epoch2_payload = all_packets.last().unwrap().payload.clone();

    // New-epoch packet arrives first, old-epoch straggler second.
    bob_relay.deliver_group("alice", epoch2_payload);
    bob.poll_incoming(16, 0, 1000).unwrap();
    let got = bob.pop_audio_frame(1_000_000).unwrap();
    assert_eq!(got.sender, "alice");
    assert_eq!(got.frame.payload, vec![2]);

    // The straggler re-keys alice's receive state back to epoch 1 and
    // still decrypts.
    bob_relay.deliver_group("alice", epoch1_packets[0].payload.clone());
    bob.poll_incoming(16, 0, 2000).unwrap();
    let late = bob.pop_audio_frame(2_000_000).unwrap();
    assert_eq!(late.frame.payload, vec![1]);
}

#[test]
fn group_receivers_track_multiple_senders() {
    let relay_a = Arc::new(TestRelay::new("alice"));
    let relay_b = Arc::new(TestRelay::new("bob"));
    let relay_c = Arc::new(TestRelay::new("carol"));

    let config = GroupCallSessionConfig {
        group_id: "team".to_string(),
        call_id: CALL_ID,
        ..Default::default()
    };
    let mut alice = GroupCallSession::new(relay_a.clone(), config.clone());
    let mut bob = GroupCallSession::new(relay_b.clone(), config.clone());
    let mut carol = GroupCallSession::new(relay_c.clone(), config);
    alice.init().unwrap();
    bob.init().unwrap();
    carol.init().unwrap();

    alice.send_audio_frame(&[0xAA], 100, 0).unwrap();
    carol.send_audio_frame(&[0xCC], 110, 0).unwrap();
    for p in relay_a.sent() {
        relay_b.deliver_group("alice", p.payload);
    }
    for p in relay_c.sent() {
        relay_b.deliver_group("carol", p.payload);
    }

    bob.poll_incoming(16, 0, 1000).unwrap();
    let mut seen = Vec::new();
    while let Some(f) = bob.pop_audio_frame(1_000_000) {
        seen.push((f.sender, f.frame.payload));
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("alice".to_string(), vec![0xAA]),
            ("carol".to_string(), vec![0xCC]),
        ]
    );
}

#[test]
fn adapter_exposes_group_session_through_common_api() {
    let relay = Arc::new(TestRelay::new("alice"));
    let config = GroupCallSessionConfig {
        group_id: "team".to_string(),
        call_id: CALL_ID,
        ..Default::default()
    };
    let mut session = GroupCallSession::new(relay.clone(), config);
    session.init().unwrap();
    let session = Arc::new(Mutex::new(session));
    let mut adapter = GroupCallMediaAdapter::new(session.clone());

    adapter.send_audio_frame(&[7, 7], 100, 0).unwrap();
    assert_eq!(adapter.stats().audio.frames_sent, 1);
    assert_eq!(relay.sent().len(), 1);

    adapter.push_incoming(mi_media::GroupMediaFrame {
        sender: "bob".to_string(),
        frame: mi_media::MediaFrame {
            call_id: CALL_ID,
            kind: StreamKind::Audio,
            flags: 0,
            timestamp_ms: 42,
            payload: vec![5],
        },
    });
    assert_eq!(adapter.stats().audio.frames_recv, 1);
    let frame = adapter.pop_audio_frame(0).unwrap();
    assert_eq!(frame.payload, vec![5]);
    assert!(adapter.pop_audio_frame(0).is_none());
}
