//! Per-peer double-ratchet session state.
//!
//! State separation:
//!   rk   — root key, advanced on every DH+KEM ratchet step
//!   ck_s — sending chain key, advanced per message
//!   ck_r — receiving chain key, advanced per message
//!   mk   — message key, derived from a chain key, used once, deleted
//!
//! The asymmetric step is hybrid: the X25519 output and an ML-KEM shared
//! secret feed the same HKDF, so compromise of either assumption alone
//! does not break post-compromise security.
//!
//! Receive-side chain work never mutates committed state before the AEAD
//! verifies: catch-up keys collect in a pending list and only land in the
//! skipped-key store on success, and the engine runs whole-chain ratchet
//! steps on a cloned candidate session.

use std::collections::{HashMap, VecDeque};

use zeroize::Zeroize;

use mi_crypto::aead;
use mi_crypto::kdf::hkdf_expand_pair;
use mi_crypto::kem::{KemPublicKey, KemSecretKey, KemCiphertext, kem_decapsulate, KEM_PUBLIC_KEY_BYTES, KEM_SECRET_KEY_BYTES};
use mi_crypto::dh::x25519_shared;

use crate::error::EngineError;

/// Largest tolerated gap inside one receive chain.
pub(crate) const MAX_SKIP: u32 = 2000;
/// FIFO cap on retained skipped message keys per session.
pub(crate) const MAX_SKIPPED_MESSAGE_KEYS: usize = 2048;

const DR_RK_HYBRID_LABEL: &[u8] = b"mi_e2ee_dr_rk_hybrid_v1";
const DR_CK_LABEL: &[u8] = b"mi_e2ee_dr_ck_v1";

/// `rk' || ck' <- HKDF(dh || kem_ss, salt = rk)`.
pub(crate) fn kdf_rk_hybrid(
    rk: &[u8; 32],
    dh: &[u8; 32],
    kem_ss: &[u8; 32],
) -> Result<([u8; 32], [u8; 32]), EngineError> {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(dh);
    ikm[32..].copy_from_slice(kem_ss);
    let out = hkdf_expand_pair(&ikm, Some(rk), DR_RK_HYBRID_LABEL);
    ikm.zeroize();
    Ok(out?)
}

/// `ck' || mk <- HKDF(ck)`.
pub(crate) fn kdf_ck(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), EngineError> {
    Ok(hkdf_expand_pair(ck, None, DR_CK_LABEL)?)
}

/// Skipped message keys are addressed by the sender ratchet key that
/// produced the chain plus the message number within it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct SkippedKeyId {
    pub dh: [u8; 32],
    pub n: u32,
}

#[derive(Clone)]
pub(crate) struct Session {
    pub peer_fingerprint_hex: String,
    pub rk: [u8; 32],
    pub ck_s: Option<[u8; 32]>,
    pub ck_r: Option<[u8; 32]>,
    pub dhs_sk: [u8; 32],
    pub dhs_pk: [u8; 32],
    pub dhr_pk: [u8; 32],
    pub kem_s_sk: KemSecretKey,
    pub kem_s_pk: KemPublicKey,
    pub kem_r_pk: KemPublicKey,
    pub skipped_mks: HashMap<SkippedKeyId, [u8; 32]>,
    pub skipped_order: VecDeque<SkippedKeyId>,
    /// Sent in the current send chain.
    pub ns: u32,
    /// Received in the current receive chain.
    pub nr: u32,
    /// Send-chain length at the moment of the last ratchet step.
    pub pn: u32,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.rk.zeroize();
        if let Some(ref mut ck) = self.ck_s {
            ck.zeroize();
        }
        if let Some(ref mut ck) = self.ck_r {
            ck.zeroize();
        }
        self.dhs_sk.zeroize();
        self.kem_s_sk.zeroize();
        for (_, mk) in self.skipped_mks.iter_mut() {
            mk.zeroize();
        }
    }
}

impl Session {
    pub fn new(peer_fingerprint_hex: String) -> Self {
        Self {
            peer_fingerprint_hex,
            rk: [0; 32],
            ck_s: None,
            ck_r: None,
            dhs_sk: [0; 32],
            dhs_pk: [0; 32],
            dhr_pk: [0; 32],
            kem_s_sk: [0; KEM_SECRET_KEY_BYTES],
            kem_s_pk: [0; KEM_PUBLIC_KEY_BYTES],
            kem_r_pk: [0; KEM_PUBLIC_KEY_BYTES],
            skipped_mks: HashMap::new(),
            skipped_order: VecDeque::new(),
            ns: 0,
            nr: 0,
            pn: 0,
        }
    }

    /// Advance the send chain one step and AEAD-seal `plaintext` with
    /// `header_ad` bound. Payload layout: `ad || nonce(24) || tag(16) ||
    /// ciphertext`.
    pub fn encrypt_message(
        &mut self,
        header_ad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        let ck_s = self.ck_s.ok_or(EngineError::NoSendChain)?;
        let (next_ck, mut mk) = kdf_ck(&ck_s)?;

        let nonce = mi_crypto::rng::random_array::<{ aead::NONCE_BYTES }>()?;
        let locked = aead::lock(&mk, &nonce, header_ad, plaintext);
        mk.zeroize();
        let (cipher, tag) = locked?;

        self.ck_s = Some(next_ck);
        self.ns += 1;

        let mut payload =
            Vec::with_capacity(header_ad.len() + nonce.len() + tag.len() + cipher.len());
        payload.extend_from_slice(header_ad);
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&tag);
        payload.extend_from_slice(&cipher);
        Ok(payload)
    }

    /// Try a retained skipped key for `(dh, n)`; the key is consumed only
    /// when authentication succeeds.
    pub fn try_skipped_mk(
        &mut self,
        dh: &[u8; 32],
        n: u32,
        header_ad: &[u8],
        nonce: &[u8; 24],
        cipher: &[u8],
        tag: &[u8; 16],
    ) -> Option<Vec<u8>> {
        let id = SkippedKeyId { dh: *dh, n };
        let mk = self.skipped_mks.get(&id)?;
        let plain = aead::unlock(mk, nonce, header_ad, cipher, tag).ok()?;
        if let Some(mut used) = self.skipped_mks.remove(&id) {
            used.zeroize();
        }
        Some(plain.as_slice().to_vec())
    }

    /// Decrypt message `n` of the current receive chain, catching up and
    /// retaining any skipped keys on the way. Chain state commits only
    /// after the AEAD verifies.
    pub fn decrypt_with_chain(
        &mut self,
        header_ad: &[u8],
        n: u32,
        nonce: &[u8; 24],
        cipher: &[u8],
        tag: &[u8; 16],
    ) -> Result<Vec<u8>, EngineError> {
        let ck_r = self.ck_r.ok_or(EngineError::NoRecvChain)?;

        let dhr_pk = self.dhr_pk;
        if let Some(plain) = self.try_skipped_mk(&dhr_pk, n, header_ad, nonce, cipher, tag) {
            return Ok(plain);
        }

        if n < self.nr {
            return Err(EngineError::ReplayedOrTooOld);
        }
        if n - self.nr > MAX_SKIP {
            return Err(EngineError::TooManySkipped);
        }

        let mut ck = ck_r;
        let mut nr = self.nr;
        let mut pending: Vec<(SkippedKeyId, [u8; 32])> = Vec::with_capacity((n - nr) as usize);
        while nr < n {
            let (next_ck, mk) = kdf_ck(&ck)?;
            pending.push((
                SkippedKeyId {
                    dh: self.dhr_pk,
                    n: nr,
                },
                mk,
            ));
            ck = next_ck;
            nr += 1;
        }
        let (next_ck, mut mk) = kdf_ck(&ck)?;

        let unlocked = aead::unlock(&mk, nonce, header_ad, cipher, tag);
        mk.zeroize();
        let plain = match unlocked {
            Ok(plain) => plain,
            Err(_) => {
                for (_, mut key) in pending {
                    key.zeroize();
                }
                return Err(EngineError::Crypto(mi_crypto::CryptoError::AuthFailed));
            }
        };

        for (id, key) in pending {
            self.insert_skipped(id, key);
        }
        self.enforce_skipped_limit();
        self.ck_r = Some(next_ck);
        self.nr = n + 1;
        Ok(plain.as_slice().to_vec())
    }

    /// Hybrid DH+KEM receive ratchet step: reset the chain counters,
    /// drop the stale send chain and derive the new receive chain.
    pub fn ratchet_on_receive(
        &mut self,
        new_dhr: &[u8; 32],
        new_kem_r_pk: &KemPublicKey,
        kem_ct: &KemCiphertext,
    ) -> Result<(), EngineError> {
        self.pn = self.ns;
        self.ns = 0;
        self.nr = 0;
        if let Some(ref mut ck) = self.ck_s {
            ck.zeroize();
        }
        self.ck_s = None;

        let mut dh_recv = x25519_shared(&self.dhs_sk, new_dhr);
        let mut kem_ss = kem_decapsulate(kem_ct, &self.kem_s_sk)?;
        let step = kdf_rk_hybrid(&self.rk, &dh_recv, &kem_ss);
        dh_recv.zeroize();
        kem_ss.zeroize();
        let (new_rk, new_ck_r) = step?;

        self.rk = new_rk;
        self.ck_r = Some(new_ck_r);
        self.dhr_pk = *new_dhr;
        self.kem_r_pk = *new_kem_r_pk;
        Ok(())
    }

    /// Derive and retain skipped keys for messages `nr..until` of the
    /// current receive chain (used before switching to a new chain).
    pub fn skip_chain_to(&mut self, until: u32) -> Result<(), EngineError> {
        let Some(mut ck) = self.ck_r else {
            return Err(EngineError::NoRecvChain);
        };
        while self.nr < until {
            let (next_ck, mk) = kdf_ck(&ck)?;
            let id = SkippedKeyId {
                dh: self.dhr_pk,
                n: self.nr,
            };
            self.insert_skipped(id, mk);
            ck = next_ck;
            self.nr += 1;
        }
        self.ck_r = Some(ck);
        self.enforce_skipped_limit();
        Ok(())
    }

    fn insert_skipped(&mut self, id: SkippedKeyId, mk: [u8; 32]) {
        if self.skipped_mks.insert(id.clone(), mk).is_none() {
            self.skipped_order.push_back(id);
        }
    }

    pub(crate) fn enforce_skipped_limit(&mut self) {
        while self.skipped_mks.len() > MAX_SKIPPED_MESSAGE_KEYS {
            let Some(id) = self.skipped_order.pop_front() else {
                self.skipped_mks.clear();
                return;
            };
            if let Some(mut mk) = self.skipped_mks.remove(&id) {
                mk.zeroize();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_kdf_separates_key_and_next_chain() {
        let (ck1, mk1) = kdf_ck(&[7u8; 32]).unwrap();
        assert_ne!(ck1, mk1);
        let (ck2, mk2) = kdf_ck(&ck1).unwrap();
        assert_ne!(ck1, ck2);
        assert_ne!(mk1, mk2);
    }

    #[test]
    fn rk_step_depends_on_both_secrets() {
        let rk = [1u8; 32];
        let (a_rk, a_ck) = kdf_rk_hybrid(&rk, &[2; 32], &[3; 32]).unwrap();
        let (b_rk, _) = kdf_rk_hybrid(&rk, &[2; 32], &[4; 32]).unwrap();
        let (c_rk, _) = kdf_rk_hybrid(&rk, &[5; 32], &[3; 32]).unwrap();
        assert_ne!(a_rk, b_rk);
        assert_ne!(a_rk, c_rk);
        assert_ne!(a_rk, a_ck);
    }

    #[test]
    fn skipped_key_cap_evicts_fifo() {
        let mut session = Session::new(String::new());
        for n in 0..(MAX_SKIPPED_MESSAGE_KEYS as u32 + 100) {
            session.insert_skipped(SkippedKeyId { dh: [0; 32], n }, [n as u8; 32]);
        }
        session.enforce_skipped_limit();
        assert_eq!(session.skipped_mks.len(), MAX_SKIPPED_MESSAGE_KEYS);
        // FIFO: the first 100 ids are gone, the rest survive in order.
        for n in 0..100u32 {
            assert!(!session
                .skipped_mks
                .contains_key(&SkippedKeyId { dh: [0; 32], n }));
        }
        assert!(session
            .skipped_mks
            .contains_key(&SkippedKeyId { dh: [0; 32], n: 100 }));
        assert_eq!(
            session.skipped_order.front().map(|id| id.n),
            Some(100)
        );
    }

    #[test]
    fn chain_decrypt_commits_only_on_auth_success() {
        let mut tx = Session::new(String::new());
        let mut rx = Session::new(String::new());
        let ck = [9u8; 32];
        tx.ck_s = Some(ck);
        rx.ck_r = Some(ck);
        rx.dhr_pk = [5; 32];

        let ad = [1u8, 2, 3];
        let payload = tx.encrypt_message(&ad, b"first").unwrap();
        let nonce: [u8; 24] = payload[3..27].try_into().unwrap();
        let tag: [u8; 16] = payload[27..43].try_into().unwrap();
        let cipher = payload[43..].to_vec();

        // Tampered AD fails and leaves the chain untouched.
        let err = rx
            .decrypt_with_chain(&[9, 9, 9], 0, &nonce, &cipher, &tag)
            .unwrap_err();
        assert_eq!(err.to_string(), "auth failed");
        assert_eq!(rx.nr, 0);

        let plain = rx
            .decrypt_with_chain(&ad, 0, &nonce, &cipher, &tag)
            .unwrap();
        assert_eq!(plain, b"first");
        assert_eq!(rx.nr, 1);

        // Replay of the same counter is rejected.
        let err = rx
            .decrypt_with_chain(&ad, 0, &nonce, &cipher, &tag)
            .unwrap_err();
        assert_eq!(err.to_string(), "replayed or too old");
    }
}
