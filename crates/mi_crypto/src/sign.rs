//! ML-DSA-65 detached signatures (FIPS 204).
//!
//! Used for the long-term identity, signed prekeys, PreKey payload
//! signatures and the detached-signing surface exposed to higher layers.

use pqcrypto_mldsa::mldsa65;
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _, SecretKey as _};

use crate::error::CryptoError;

pub const SIG_PUBLIC_KEY_BYTES: usize = 1952;
pub const SIG_SECRET_KEY_BYTES: usize = 4032;
pub const SIG_BYTES: usize = 3309;

pub type SigPublicKey = [u8; SIG_PUBLIC_KEY_BYTES];
pub type SigSecretKey = [u8; SIG_SECRET_KEY_BYTES];
pub type Signature = [u8; SIG_BYTES];

pub fn sig_keypair() -> Result<(SigPublicKey, SigSecretKey), CryptoError> {
    let (pk, sk) = mldsa65::keypair();
    let pk = pk.as_bytes().try_into().map_err(|_| CryptoError::SigKeypair)?;
    let sk = sk.as_bytes().try_into().map_err(|_| CryptoError::SigKeypair)?;
    Ok((pk, sk))
}

pub fn sign_detached(msg: &[u8], sk: &SigSecretKey) -> Result<Signature, CryptoError> {
    let sk = mldsa65::SecretKey::from_bytes(sk).map_err(|_| CryptoError::SigSign)?;
    let sig = mldsa65::detached_sign(msg, &sk);
    sig.as_bytes().try_into().map_err(|_| CryptoError::SigSign)
}

/// Verification is a single boolean; no distinction between malformed and
/// mismatched signatures.
pub fn verify_detached(msg: &[u8], sig: &Signature, pk: &SigPublicKey) -> bool {
    let Ok(sig) = mldsa65::DetachedSignature::from_bytes(sig) else {
        return false;
    };
    let Ok(pk) = mldsa65::PublicKey::from_bytes(pk) else {
        return false;
    };
    mldsa65::verify_detached_signature(&sig, msg, &pk).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let (pk, sk) = sig_keypair().unwrap();
        let sig = sign_detached(b"transcript", &sk).unwrap();
        assert!(verify_detached(b"transcript", &sig, &pk));
        assert!(!verify_detached(b"tampered", &sig, &pk));
    }

    #[test]
    fn rejects_foreign_key() {
        let (_, sk) = sig_keypair().unwrap();
        let (other_pk, _) = sig_keypair().unwrap();
        let sig = sign_detached(b"msg", &sk).unwrap();
        assert!(!verify_detached(b"msg", &sig, &other_pk));
    }

    #[test]
    fn corrupted_signature_fails() {
        let (pk, sk) = sig_keypair().unwrap();
        let mut sig = sign_detached(b"msg", &sk).unwrap();
        sig[100] ^= 0xFF;
        assert!(!verify_detached(b"msg", &sig, &pk));
    }
}
