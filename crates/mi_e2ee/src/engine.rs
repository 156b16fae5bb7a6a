//! The E2EE engine facade.
//!
//! Owns the per-peer session map, the trust store, the pending-trust slot
//! and the buffers of payloads waiting on trust confirmation. One mutex
//! guards the aggregate; everything under it is pure compute plus the
//! atomic persistence writes, so per-peer operations serialize and the
//! engine is shared freely across threads.
//!
//! Handshake (initiator): verify the peer bundle, run the three X25519
//! exchanges of X3DH against the signed prekey, encapsulate to the peer
//! KEM key, and HKDF the lot into the initial root and send chain. The
//! first payload is a self-contained PreKey message carrying the
//! initiator identity, ratchet publics, KEM ciphertext and an ML-DSA
//! signature over the header. Every later message is a Ratchet payload;
//! a message with `n == 0` additionally carries the fresh ratchet KEM
//! public and ciphertext so the receiver can run the hybrid step.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use mi_crypto::dh::{x25519_public, x25519_shared};
use mi_crypto::kdf::hkdf_expand_pair;
use mi_crypto::kem::{
    kem_encapsulate, kem_keypair, KemCiphertext, KemPublicKey, KEM_CIPHERTEXT_BYTES,
    KEM_PUBLIC_KEY_BYTES,
};
use mi_crypto::rng::random_array;
use mi_crypto::sign::{
    verify_detached, SigPublicKey, SIG_BYTES, SIG_PUBLIC_KEY_BYTES,
};

use crate::bundle::{fingerprint_hex, parse_peer_bundle, PeerBundle, PROTOCOL_VERSION};
use crate::error::EngineError;
use crate::identity::{IdentityPolicy, IdentityStore};
use crate::keystore::{os_keystore, KeyStore};
use crate::session::{Session, MAX_SKIP};
use crate::trust::{codes_match, sas_from_fingerprint_hex, PendingPeerTrust, TrustStore};

const MSG_PREKEY: u8 = 1;
const MSG_RATCHET: u8 = 2;

const X3DH_LABEL: &[u8] = b"mi_e2ee_x3dh_hybrid_v1";
const PREKEY_SIG_PREFIX: &[u8] = b"MIPK";

const TRUST_FILE: &str = "peer_trust.json";

/// A decrypted message ready for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessage {
    pub from_username: String,
    pub plaintext: Vec<u8>,
}

/// Identity material extracted from a peer bundle without opening a
/// session (device pairing, KT cross-checks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub id_sig_pk: Vec<u8>,
    pub id_dh_pk: [u8; 32],
    pub fingerprint_hex: String,
}

struct EngineState {
    identity: IdentityStore,
    trust: TrustStore,
    local_username: String,
    pending: Option<PendingPeerTrust>,
    sessions: HashMap<String, Session>,
    pending_payloads: HashMap<String, Vec<Vec<u8>>>,
    ready_messages: Vec<PrivateMessage>,
    replay_failures: u64,
}

pub struct Engine {
    state: Mutex<EngineState>,
}

fn read_array<const N: usize>(
    payload: &[u8],
    off: &mut usize,
    err: EngineError,
) -> Result<[u8; N], EngineError> {
    let slice = payload.get(*off..*off + N).ok_or(err)?;
    *off += N;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

fn read_le32(payload: &[u8], off: &mut usize, err: EngineError) -> Result<u32, EngineError> {
    let bytes: [u8; 4] = read_array(payload, off, err)?;
    Ok(u32::from_le_bytes(bytes))
}

impl Engine {
    /// Load or create all engine state under `state_dir`. Fatal on a
    /// corrupted identity; the caller logs out and re-enrolls with a
    /// fresh state dir in the worst case.
    pub fn init(state_dir: impl AsRef<Path>, policy: IdentityPolicy) -> Result<Self, EngineError> {
        let keystore = if policy.tpm_enable {
            os_keystore()
        } else {
            None
        };
        Self::init_with_keystore(state_dir, policy, keystore)
    }

    /// As [`Engine::init`] with an explicit keystore (tests, platforms
    /// with their own secure element binding).
    pub fn init_with_keystore(
        state_dir: impl AsRef<Path>,
        policy: IdentityPolicy,
        keystore: Option<Arc<dyn KeyStore>>,
    ) -> Result<Self, EngineError> {
        let state_dir = state_dir.as_ref();
        if state_dir.as_os_str().is_empty() {
            return Err(EngineError::StateDirEmpty);
        }
        std::fs::create_dir_all(state_dir)
            .map_err(|e| EngineError::Storage(format!("create state dir failed: {e}")))?;

        let identity = IdentityStore::load_or_create(state_dir, policy, keystore)?;
        let trust = TrustStore::load(state_dir.join(TRUST_FILE))?;
        Ok(Self {
            state: Mutex::new(EngineState {
                identity,
                trust,
                local_username: String::new(),
                pending: None,
                sessions: HashMap::new(),
                pending_payloads: HashMap::new(),
                ready_messages: Vec::new(),
                replay_failures: 0,
            }),
        })
    }

    pub fn set_local_username(&self, username: impl Into<String>) {
        self.state.lock().local_username = username.into();
    }

    pub fn local_username(&self) -> String {
        self.state.lock().local_username.clone()
    }

    /// Rotate prekeys when the policy interval elapsed. Never invalidates
    /// the current identity on failure.
    pub fn maybe_rotate_prekeys(&self, now_sec: u64) -> Result<bool, EngineError> {
        self.state.lock().identity.maybe_rotate_prekeys(now_sec)
    }

    pub fn build_publish_bundle(&self) -> Vec<u8> {
        self.state.lock().identity.build_publish_bundle()
    }

    pub fn has_pending_peer_trust(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    pub fn pending_peer_trust(&self) -> Option<PendingPeerTrust> {
        self.state.lock().pending.clone()
    }

    /// Messages decrypted out-of-band (buffered-payload replay after a
    /// trust confirmation).
    pub fn drain_ready_messages(&self) -> Vec<PrivateMessage> {
        std::mem::take(&mut self.state.lock().ready_messages)
    }

    /// Buffered payloads that failed to decrypt when replayed after a
    /// trust confirmation. They are dropped, not retried.
    pub fn replay_failure_count(&self) -> u64 {
        self.state.lock().replay_failures
    }

    /// Confirm the pending peer with the out-of-band SAS. The exact code
    /// (modulo whitespace, dashes and case) is the only input that
    /// succeeds; buffered payloads from the peer are then replayed.
    pub fn trust_pending_peer(&self, pin: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let Some(pending) = state.pending.clone() else {
            return Err(EngineError::NoPendingPeerTrust);
        };
        if pending.peer_username.is_empty() || pending.pin6.is_empty() {
            return Err(EngineError::NoPendingPeerTrust);
        }
        if !codes_match(pin, &pending.pin6) {
            return Err(EngineError::SasMismatch);
        }
        let peer = pending.peer_username.clone();
        state
            .trust
            .insert(&peer, &pending.fingerprint_hex)?;
        state.pending = None;

        // A session keyed to a superseded fingerprint is dead weight; the
        // next PreKey (possibly one buffered below) re-establishes it.
        if let Some(session) = state.sessions.get(&peer) {
            if session.peer_fingerprint_hex != pending.fingerprint_hex {
                state.sessions.remove(&peer);
            }
        }

        if let Some(payloads) = state.pending_payloads.remove(&peer) {
            for payload in payloads {
                match state.decrypt_locked(&peer, &payload) {
                    Ok(message) => state.ready_messages.push(message),
                    Err(err) => {
                        state.replay_failures += 1;
                        warn!(peer = %peer, error = %err, "buffered payload dropped on replay");
                    }
                }
            }
        }
        debug!(peer = %peer, "peer trusted");
        Ok(())
    }

    /// Encrypt `plaintext` to a peer, opening a session from
    /// `peer_bundle` on first contact.
    pub fn encrypt_to_peer(
        &self,
        peer_username: &str,
        peer_bundle: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        if peer_username.is_empty() {
            return Err(EngineError::PeerEmpty);
        }
        if plaintext.is_empty() {
            return Err(EngineError::PlaintextEmpty);
        }
        self.state
            .lock()
            .encrypt_locked(peer_username, peer_bundle, plaintext)
    }

    /// Decrypt a payload from a peer; may buffer it behind a pending
    /// trust confirmation instead.
    pub fn decrypt_from_payload(
        &self,
        peer_username: &str,
        payload: &[u8],
    ) -> Result<PrivateMessage, EngineError> {
        if peer_username.is_empty() {
            return Err(EngineError::PeerEmpty);
        }
        self.state.lock().decrypt_locked(peer_username, payload)
    }

    /// ML-DSA-65 signature under the local identity key, for device
    /// pairing and transcript binding in higher layers.
    pub fn sign_detached(&self, message: &[u8]) -> Result<Vec<u8>, EngineError> {
        if message.is_empty() {
            return Err(EngineError::MessageEmpty);
        }
        Ok(self.state.lock().identity.sign_detached(message)?.to_vec())
    }

    /// Verify a detached ML-DSA-65 signature under an arbitrary key.
    pub fn verify_detached(message: &[u8], sig: &[u8], pk: &[u8]) -> Result<(), EngineError> {
        if message.is_empty() {
            return Err(EngineError::MessageEmpty);
        }
        let sig: &[u8; SIG_BYTES] = sig
            .try_into()
            .map_err(|_| EngineError::SignatureSizeInvalid)?;
        let pk: &[u8; SIG_PUBLIC_KEY_BYTES] = pk
            .try_into()
            .map_err(|_| EngineError::PublicKeySizeInvalid)?;
        if !verify_detached(message, sig, pk) {
            return Err(EngineError::Crypto(mi_crypto::CryptoError::SigVerify));
        }
        Ok(())
    }

    /// Parse a bundle and surface the peer identity without touching
    /// sessions or trust.
    pub fn extract_peer_identity_from_bundle(
        &self,
        peer_bundle: &[u8],
    ) -> Result<PeerIdentity, EngineError> {
        let bundle = parse_peer_bundle(peer_bundle)?;
        Ok(PeerIdentity {
            id_sig_pk: bundle.id_sig_pk.to_vec(),
            id_dh_pk: bundle.id_dh_pk,
            fingerprint_hex: bundle.fingerprint_hex(),
        })
    }

    /// TOFU check for callers that learned a fingerprint elsewhere (KT
    /// proof, pairing). Sets the pending-trust slot on first sight.
    pub fn ensure_peer_trusted(
        &self,
        peer_username: &str,
        fingerprint_hex: &str,
    ) -> Result<(), EngineError> {
        self.state
            .lock()
            .check_trusted(peer_username, fingerprint_hex)
    }
}

impl EngineState {
    fn set_pending_trust(&mut self, peer_username: &str, fingerprint_hex: &str) {
        self.pending = Some(PendingPeerTrust {
            peer_username: peer_username.to_string(),
            fingerprint_hex: fingerprint_hex.to_string(),
            pin6: sas_from_fingerprint_hex(fingerprint_hex).unwrap_or_default(),
        });
    }

    fn check_trusted(
        &mut self,
        peer_username: &str,
        fingerprint_hex: &str,
    ) -> Result<(), EngineError> {
        match self.trust.get(peer_username) {
            None => {
                self.set_pending_trust(peer_username, fingerprint_hex);
                Err(EngineError::PeerNotTrusted)
            }
            Some(pinned) if pinned != fingerprint_hex => {
                self.set_pending_trust(peer_username, fingerprint_hex);
                Err(EngineError::PeerFingerprintChanged)
            }
            Some(_) => Ok(()),
        }
    }

    /// X3DH-style hybrid handshake, initiator side. The ephemeral X25519
    /// key doubles as the first sending ratchet key.
    fn init_session_as_initiator(
        &mut self,
        peer_username: &str,
        peer: &PeerBundle,
    ) -> Result<(Session, KemCiphertext), EngineError> {
        let fingerprint = peer.fingerprint_hex();
        self.check_trusted(peer_username, &fingerprint)?;

        let mut eph_sk = random_array::<32>()?;
        let eph_pk = x25519_public(&eph_sk);

        let mut dh1 = x25519_shared(&self.identity.id_dh_sk, &peer.spk_pk);
        let mut dh2 = x25519_shared(&eph_sk, &peer.id_dh_pk);
        let mut dh3 = x25519_shared(&eph_sk, &peer.spk_pk);
        let (kem_ct, mut kem_ss) = kem_encapsulate(&peer.kem_pk)?;

        let mut secret = Zeroizing::new([0u8; 128]);
        secret[..32].copy_from_slice(&dh1);
        secret[32..64].copy_from_slice(&dh2);
        secret[64..96].copy_from_slice(&dh3);
        secret[96..].copy_from_slice(&kem_ss);
        dh1.zeroize();
        dh2.zeroize();
        dh3.zeroize();
        kem_ss.zeroize();

        let (rk, ck_s) = hkdf_expand_pair(secret.as_ref(), None, X3DH_LABEL)?;

        let mut session = Session::new(fingerprint);
        session.rk = rk;
        session.ck_s = Some(ck_s);
        session.dhs_sk = eph_sk;
        session.dhs_pk = eph_pk;
        session.dhr_pk = peer.spk_pk;
        let (kem_s_pk, kem_s_sk) = kem_keypair()?;
        session.kem_s_pk = kem_s_pk;
        session.kem_s_sk = kem_s_sk;
        session.kem_r_pk = peer.kem_pk;
        eph_sk.zeroize();
        Ok((session, kem_ct))
    }

    /// Responder side: recompute the three DHs with reversed roles and
    /// decapsulate with the SPK-matched KEM secret — the active one, or a
    /// retained legacy set when the initiator used a cached bundle.
    fn init_session_as_responder(
        &mut self,
        spk_id: u32,
        peer_id_sig_pk: &SigPublicKey,
        peer_id_dh_pk: &[u8; 32],
        sender_eph_pk: &[u8; 32],
        sender_ratchet_kem_pk: &KemPublicKey,
        kem_ct: &KemCiphertext,
    ) -> Result<Session, EngineError> {
        let (spk_sk, kem_sk) = if spk_id == self.identity.spk_id {
            (self.identity.spk_sk, self.identity.kem_sk)
        } else if let Some(legacy) = self.identity.find_legacy_key(spk_id) {
            debug!(spk_id, "responder handshake using retired prekey set");
            (legacy.spk_sk, legacy.kem_sk)
        } else {
            return Err(EngineError::SpkIdMismatch);
        };

        let mut dh1 = x25519_shared(&spk_sk, peer_id_dh_pk);
        let mut dh2 = x25519_shared(&self.identity.id_dh_sk, sender_eph_pk);
        let mut dh3 = x25519_shared(&spk_sk, sender_eph_pk);
        let mut kem_ss = mi_crypto::kem::kem_decapsulate(kem_ct, &kem_sk)?;

        let mut secret = Zeroizing::new([0u8; 128]);
        secret[..32].copy_from_slice(&dh1);
        secret[32..64].copy_from_slice(&dh2);
        secret[64..96].copy_from_slice(&dh3);
        secret[96..].copy_from_slice(&kem_ss);
        dh1.zeroize();
        dh2.zeroize();
        dh3.zeroize();
        kem_ss.zeroize();

        let (rk, ck_r) = hkdf_expand_pair(secret.as_ref(), None, X3DH_LABEL)?;

        let mut session = Session::new(fingerprint_hex(peer_id_sig_pk, peer_id_dh_pk));
        session.rk = rk;
        session.ck_r = Some(ck_r);
        session.dhs_sk = spk_sk;
        session.dhs_pk = x25519_public(&spk_sk);
        session.dhr_pk = *sender_eph_pk;
        session.kem_r_pk = *sender_ratchet_kem_pk;
        Ok(session)
    }

    fn encrypt_locked(
        &mut self,
        peer_username: &str,
        peer_bundle: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        if !self.sessions.contains_key(peer_username) {
            if peer_bundle.is_empty() {
                return Err(EngineError::PeerBundleMissing);
            }
            let peer = parse_peer_bundle(peer_bundle)?;
            let (mut session, kem_ct) = self.init_session_as_initiator(peer_username, &peer)?;

            let n = session.ns;
            let mut ad = Vec::with_capacity(
                2 + 4
                    + SIG_PUBLIC_KEY_BYTES
                    + 32
                    + 32
                    + KEM_PUBLIC_KEY_BYTES
                    + KEM_CIPHERTEXT_BYTES
                    + 4
                    + SIG_BYTES,
            );
            ad.push(PROTOCOL_VERSION);
            ad.push(MSG_PREKEY);
            ad.extend_from_slice(&peer.spk_id.to_le_bytes());
            ad.extend_from_slice(&self.identity.id_sig_pk);
            ad.extend_from_slice(&self.identity.id_dh_pk);
            ad.extend_from_slice(&session.dhs_pk);
            ad.extend_from_slice(&session.kem_s_pk);
            ad.extend_from_slice(&kem_ct);
            ad.extend_from_slice(&n.to_le_bytes());

            let mut sig_msg = Vec::with_capacity(PREKEY_SIG_PREFIX.len() + ad.len());
            sig_msg.extend_from_slice(PREKEY_SIG_PREFIX);
            sig_msg.extend_from_slice(&ad);
            let prekey_sig = self.identity.sign_detached(&sig_msg)?;
            ad.extend_from_slice(&prekey_sig);

            let payload = session.encrypt_message(&ad, plaintext)?;
            self.sessions.insert(peer_username.to_string(), session);
            debug!(peer = %peer_username, "initiator session established");
            return Ok(payload);
        }

        let fingerprint = self
            .sessions
            .get(peer_username)
            .map(|s| s.peer_fingerprint_hex.clone())
            .ok_or(EngineError::NoSession)?;
        self.check_trusted(peer_username, &fingerprint)?;

        let session = self
            .sessions
            .get_mut(peer_username)
            .ok_or(EngineError::NoSession)?;

        // A fresh send chain is due after every received ratchet step.
        let mut started_new_send_chain = false;
        let mut ratchet_kem_ct = [0u8; KEM_CIPHERTEXT_BYTES];
        if session.ck_s.is_none() {
            let mut new_dhs_sk = random_array::<32>()?;
            let new_dhs_pk = x25519_public(&new_dhs_sk);
            let (new_kem_s_pk, new_kem_s_sk) = kem_keypair()?;
            let (kem_ct, mut kem_ss) = kem_encapsulate(&session.kem_r_pk)?;
            let mut dh = x25519_shared(&new_dhs_sk, &session.dhr_pk);

            let step = crate::session::kdf_rk_hybrid(&session.rk, &dh, &kem_ss);
            dh.zeroize();
            kem_ss.zeroize();
            let (rk, ck_s) = step?;

            session.rk = rk;
            session.ck_s = Some(ck_s);
            session.dhs_sk = new_dhs_sk;
            session.dhs_pk = new_dhs_pk;
            session.kem_s_sk = new_kem_s_sk;
            session.kem_s_pk = new_kem_s_pk;
            session.ns = 0;
            ratchet_kem_ct = kem_ct;
            started_new_send_chain = true;
            new_dhs_sk.zeroize();
        }

        let n = session.ns;
        let pn = session.pn;
        let mut ad = Vec::with_capacity(
            2 + 32
                + 4
                + 4
                + if n == 0 {
                    KEM_PUBLIC_KEY_BYTES + KEM_CIPHERTEXT_BYTES
                } else {
                    0
                },
        );
        ad.push(PROTOCOL_VERSION);
        ad.push(MSG_RATCHET);
        ad.extend_from_slice(&session.dhs_pk);
        ad.extend_from_slice(&pn.to_le_bytes());
        ad.extend_from_slice(&n.to_le_bytes());
        if n == 0 {
            if !started_new_send_chain {
                return Err(EngineError::RatchetStateInvalid);
            }
            ad.extend_from_slice(&session.kem_s_pk);
            ad.extend_from_slice(&ratchet_kem_ct);
        }

        session.encrypt_message(&ad, plaintext)
    }

    fn decrypt_locked(
        &mut self,
        peer_username: &str,
        payload: &[u8],
    ) -> Result<PrivateMessage, EngineError> {
        if payload.len() < 2 {
            return Err(EngineError::PayloadTooShort);
        }
        let version = payload[0];
        let msg_type = payload[1];
        if version != PROTOCOL_VERSION {
            return Err(EngineError::VersionMismatch);
        }
        match msg_type {
            MSG_PREKEY => self.decrypt_prekey(peer_username, payload),
            MSG_RATCHET => self.decrypt_ratchet(peer_username, payload),
            _ => Err(EngineError::UnknownMessageType),
        }
    }

    fn decrypt_prekey(
        &mut self,
        peer_username: &str,
        payload: &[u8],
    ) -> Result<PrivateMessage, EngineError> {
        const MIN_LEN: usize = 2
            + 4
            + SIG_PUBLIC_KEY_BYTES
            + 32
            + 32
            + KEM_PUBLIC_KEY_BYTES
            + KEM_CIPHERTEXT_BYTES
            + 4
            + SIG_BYTES
            + 24
            + 16;
        if payload.len() < MIN_LEN {
            return Err(EngineError::PrekeyPayloadTruncated);
        }

        let mut off = 2;
        let spk_id = read_le32(payload, &mut off, EngineError::PrekeyPayloadTruncated)?;
        let peer_id_sig_pk: SigPublicKey =
            read_array(payload, &mut off, EngineError::PrekeyPayloadTruncated)?;
        let peer_id_dh_pk: [u8; 32] =
            read_array(payload, &mut off, EngineError::PrekeyPayloadTruncated)?;
        let sender_eph_pk: [u8; 32] =
            read_array(payload, &mut off, EngineError::PrekeyPayloadTruncated)?;
        let sender_ratchet_kem_pk: KemPublicKey =
            read_array(payload, &mut off, EngineError::PrekeyPayloadTruncated)?;
        let kem_ct: KemCiphertext =
            read_array(payload, &mut off, EngineError::PrekeyPayloadTruncated)?;
        let n = read_le32(payload, &mut off, EngineError::PrekeyPayloadTruncated)?;

        let sig_start = off;
        let prekey_sig: [u8; SIG_BYTES] =
            read_array(payload, &mut off, EngineError::PrekeyPayloadTruncated)?;

        let mut sig_msg = Vec::with_capacity(PREKEY_SIG_PREFIX.len() + sig_start);
        sig_msg.extend_from_slice(PREKEY_SIG_PREFIX);
        sig_msg.extend_from_slice(&payload[..sig_start]);
        if !verify_detached(&sig_msg, &prekey_sig, &peer_id_sig_pk) {
            return Err(EngineError::PrekeySignatureInvalid);
        }

        let ad_end = off;
        let nonce: [u8; 24] = read_array(payload, &mut off, EngineError::PrekeyPayloadTruncated)?;
        let tag: [u8; 16] = read_array(payload, &mut off, EngineError::PrekeyPayloadTruncated)?;
        let cipher = &payload[off..];
        let ad = &payload[..ad_end];

        let fingerprint = fingerprint_hex(&peer_id_sig_pk, &peer_id_dh_pk);
        let trusted = matches!(self.trust.get(peer_username), Some(pinned) if pinned == fingerprint);
        if !trusted {
            let changed = self.trust.get(peer_username).is_some();
            self.set_pending_trust(peer_username, &fingerprint);
            self.pending_payloads
                .entry(peer_username.to_string())
                .or_default()
                .push(payload.to_vec());
            return Err(if changed {
                EngineError::PeerFingerprintChanged
            } else {
                EngineError::PeerNotTrusted
            });
        }

        let mut session = self.init_session_as_responder(
            spk_id,
            &peer_id_sig_pk,
            &peer_id_dh_pk,
            &sender_eph_pk,
            &sender_ratchet_kem_pk,
            &kem_ct,
        )?;

        let plaintext = session.decrypt_with_chain(ad, n, &nonce, cipher, &tag)?;
        self.sessions.insert(peer_username.to_string(), session);
        debug!(peer = %peer_username, "responder session established");
        Ok(PrivateMessage {
            from_username: peer_username.to_string(),
            plaintext,
        })
    }

    fn decrypt_ratchet(
        &mut self,
        peer_username: &str,
        payload: &[u8],
    ) -> Result<PrivateMessage, EngineError> {
        const MIN_LEN: usize = 2 + 32 + 4 + 4 + 24 + 16;
        if payload.len() < MIN_LEN {
            return Err(EngineError::RatchetPayloadTruncated);
        }
        let mut off = 2;
        let sender_dhs_pk: [u8; 32] =
            read_array(payload, &mut off, EngineError::RatchetPayloadTruncated)?;
        let pn = read_le32(payload, &mut off, EngineError::RatchetPayloadTruncated)?;
        let n = read_le32(payload, &mut off, EngineError::RatchetPayloadTruncated)?;

        if !self.sessions.contains_key(peer_username) {
            return Err(EngineError::NoSession);
        }
        let fingerprint = self
            .sessions
            .get(peer_username)
            .map(|s| s.peer_fingerprint_hex.clone())
            .ok_or(EngineError::NoSession)?;
        if let Err(err) = self.check_trusted(peer_username, &fingerprint) {
            self.pending_payloads
                .entry(peer_username.to_string())
                .or_default()
                .push(payload.to_vec());
            return Err(err);
        }

        let mut sender_kem_pk = [0u8; KEM_PUBLIC_KEY_BYTES];
        let mut kem_ct = [0u8; KEM_CIPHERTEXT_BYTES];
        if n == 0 {
            if payload.len() < off + KEM_PUBLIC_KEY_BYTES + KEM_CIPHERTEXT_BYTES + 24 + 16 {
                return Err(EngineError::RatchetPayloadTruncated);
            }
            sender_kem_pk = read_array(payload, &mut off, EngineError::RatchetPayloadTruncated)?;
            kem_ct = read_array(payload, &mut off, EngineError::RatchetPayloadTruncated)?;
        }

        let ad_end = off;
        let nonce: [u8; 24] = read_array(payload, &mut off, EngineError::RatchetPayloadTruncated)?;
        let tag: [u8; 16] = read_array(payload, &mut off, EngineError::RatchetPayloadTruncated)?;
        let cipher = &payload[off..];
        let ad = &payload[..ad_end];

        let session = self
            .sessions
            .get_mut(peer_username)
            .ok_or(EngineError::NoSession)?;

        // Skipped key first: a late message from an earlier chain.
        if let Some(plaintext) = session.try_skipped_mk(&sender_dhs_pk, n, ad, &nonce, cipher, &tag)
        {
            return Ok(PrivateMessage {
                from_username: peer_username.to_string(),
                plaintext,
            });
        }

        let new_chain = sender_dhs_pk != session.dhr_pk;
        let plaintext = if new_chain {
            if n != 0 {
                return Err(EngineError::RatchetHeaderInvalid);
            }
            if pn < session.nr {
                return Err(EngineError::RatchetPnInvalid);
            }
            if pn - session.nr > MAX_SKIP {
                return Err(EngineError::TooManySkipped);
            }

            // Whole-chain switch on a candidate; commit only after the
            // AEAD verified, so a forged header cannot wedge the session.
            let mut cand = session.clone();
            if cand.ck_r.is_none() {
                if pn != 0 || cand.nr != 0 || !cand.skipped_mks.is_empty() {
                    return Err(EngineError::RatchetStateInvalid);
                }
            } else {
                cand.skip_chain_to(pn)?;
            }
            cand.ratchet_on_receive(&sender_dhs_pk, &sender_kem_pk, &kem_ct)?;
            let plaintext = cand.decrypt_with_chain(ad, n, &nonce, cipher, &tag)?;
            *session = cand;
            plaintext
        } else {
            session.decrypt_with_chain(ad, n, &nonce, cipher, &tag)?
        };

        Ok(PrivateMessage {
            from_username: peer_username.to_string(),
            plaintext,
        })
    }
}
