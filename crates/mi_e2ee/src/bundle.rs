//! Peer bundle parsing and fingerprints.
//!
//! The published bundle is self-certifying: the SPK signature binds the
//! SPK and KEM public keys to the ML-DSA identity, so it MUST be verified
//! before any DH is computed with keys from the bundle.

use mi_crypto::hash::sha256_hex;
use mi_crypto::kem::{KemPublicKey, KEM_PUBLIC_KEY_BYTES};
use mi_crypto::sign::{verify_detached, SigPublicKey, Signature, SIG_BYTES, SIG_PUBLIC_KEY_BYTES};

use crate::error::EngineError;
use crate::identity::spk_sig_message;

pub const PROTOCOL_VERSION: u8 = 5;

pub(crate) const BUNDLE_LEN: usize =
    1 + SIG_PUBLIC_KEY_BYTES + 32 + 4 + 32 + KEM_PUBLIC_KEY_BYTES + SIG_BYTES;

/// Parsed view of a peer's published identity bundle.
pub struct PeerBundle {
    pub id_sig_pk: SigPublicKey,
    pub id_dh_pk: [u8; 32],
    pub spk_id: u32,
    pub spk_pk: [u8; 32],
    pub kem_pk: KemPublicKey,
    pub spk_sig: Signature,
}

impl PeerBundle {
    pub fn fingerprint_hex(&self) -> String {
        fingerprint_hex(&self.id_sig_pk, &self.id_dh_pk)
    }
}

/// Hex SHA-256 over `id_sig_pk || id_dh_pk` — the identity the trust
/// store pins and the KT log records.
pub fn fingerprint_hex(id_sig_pk: &[u8], id_dh_pk: &[u8; 32]) -> String {
    let mut buf = Vec::with_capacity(id_sig_pk.len() + id_dh_pk.len());
    buf.extend_from_slice(id_sig_pk);
    buf.extend_from_slice(id_dh_pk);
    sha256_hex(&buf)
}

pub(crate) fn parse_peer_bundle(bytes: &[u8]) -> Result<PeerBundle, EngineError> {
    if bytes.len() != BUNDLE_LEN {
        return Err(EngineError::BundleSizeInvalid);
    }
    let mut off = 0;
    let version = bytes[off];
    off += 1;
    if version != PROTOCOL_VERSION {
        return Err(EngineError::BundleVersionMismatch);
    }

    let mut out = PeerBundle {
        id_sig_pk: [0; SIG_PUBLIC_KEY_BYTES],
        id_dh_pk: [0; 32],
        spk_id: 0,
        spk_pk: [0; 32],
        kem_pk: [0; KEM_PUBLIC_KEY_BYTES],
        spk_sig: [0; SIG_BYTES],
    };
    out.id_sig_pk.copy_from_slice(&bytes[off..off + SIG_PUBLIC_KEY_BYTES]);
    off += SIG_PUBLIC_KEY_BYTES;
    out.id_dh_pk.copy_from_slice(&bytes[off..off + 32]);
    off += 32;
    out.spk_id = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap_or([0; 4]));
    off += 4;
    out.spk_pk.copy_from_slice(&bytes[off..off + 32]);
    off += 32;
    out.kem_pk.copy_from_slice(&bytes[off..off + KEM_PUBLIC_KEY_BYTES]);
    off += KEM_PUBLIC_KEY_BYTES;
    out.spk_sig.copy_from_slice(&bytes[off..off + SIG_BYTES]);

    let msg = spk_sig_message(out.spk_id, &out.id_dh_pk, &out.spk_pk, &out.kem_pk);
    if !verify_detached(&msg, &out.spk_sig, &out.id_sig_pk) {
        return Err(EngineError::BundleSignatureInvalid);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_size_and_version() {
        assert!(matches!(
            parse_peer_bundle(&[0u8; 10]),
            Err(EngineError::BundleSizeInvalid)
        ));
        let mut bytes = vec![0u8; BUNDLE_LEN];
        bytes[0] = 4;
        assert!(matches!(
            parse_peer_bundle(&bytes),
            Err(EngineError::BundleVersionMismatch)
        ));
    }

    #[test]
    fn rejects_garbage_signature() {
        let mut bytes = vec![0u8; BUNDLE_LEN];
        bytes[0] = PROTOCOL_VERSION;
        assert!(matches!(
            parse_peer_bundle(&bytes),
            Err(EngineError::BundleSignatureInvalid)
        ));
    }

    #[test]
    fn fingerprint_is_sha256_of_identity_keys() {
        let sig_pk = [7u8; 8];
        let dh_pk = [9u8; 32];
        let mut joined = sig_pk.to_vec();
        joined.extend_from_slice(&dh_pk);
        assert_eq!(
            fingerprint_hex(&sig_pk, &dh_pk),
            mi_crypto::hash::sha256_hex(&joined)
        );
    }
}
