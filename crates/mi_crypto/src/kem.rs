//! ML-KEM-768 key encapsulation (FIPS 203).
//!
//! Hybridized with X25519 in the handshake and ratchet: the KEM shared
//! secret is mixed into the same HKDF step as the DH output.

use pqcrypto_mlkem::mlkem768;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _};

use crate::error::CryptoError;

pub const KEM_PUBLIC_KEY_BYTES: usize = 1184;
pub const KEM_SECRET_KEY_BYTES: usize = 2400;
pub const KEM_CIPHERTEXT_BYTES: usize = 1088;
pub const KEM_SHARED_SECRET_BYTES: usize = 32;

pub type KemPublicKey = [u8; KEM_PUBLIC_KEY_BYTES];
pub type KemSecretKey = [u8; KEM_SECRET_KEY_BYTES];
pub type KemCiphertext = [u8; KEM_CIPHERTEXT_BYTES];
pub type KemSharedSecret = [u8; KEM_SHARED_SECRET_BYTES];

fn to_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], CryptoError> {
    bytes.try_into().map_err(|_| CryptoError::InvalidKey)
}

pub fn kem_keypair() -> Result<(KemPublicKey, KemSecretKey), CryptoError> {
    let (pk, sk) = mlkem768::keypair();
    let pk = to_array(pk.as_bytes()).map_err(|_| CryptoError::KemKeypair)?;
    let sk = to_array(sk.as_bytes()).map_err(|_| CryptoError::KemKeypair)?;
    Ok((pk, sk))
}

/// Encapsulate to a peer public key. Returns `(ciphertext, shared_secret)`.
pub fn kem_encapsulate(
    pk: &KemPublicKey,
) -> Result<(KemCiphertext, KemSharedSecret), CryptoError> {
    let pk = mlkem768::PublicKey::from_bytes(pk).map_err(|_| CryptoError::KemEncaps)?;
    let (ss, ct) = mlkem768::encapsulate(&pk);
    let ct = to_array(ct.as_bytes()).map_err(|_| CryptoError::KemEncaps)?;
    let ss = to_array(ss.as_bytes()).map_err(|_| CryptoError::KemEncaps)?;
    Ok((ct, ss))
}

pub fn kem_decapsulate(
    ct: &KemCiphertext,
    sk: &KemSecretKey,
) -> Result<KemSharedSecret, CryptoError> {
    let ct = mlkem768::Ciphertext::from_bytes(ct).map_err(|_| CryptoError::KemDecaps)?;
    let sk = mlkem768::SecretKey::from_bytes(sk).map_err(|_| CryptoError::KemDecaps)?;
    let ss = mlkem768::decapsulate(&ct, &sk);
    to_array(ss.as_bytes()).map_err(|_| CryptoError::KemDecaps)
}
