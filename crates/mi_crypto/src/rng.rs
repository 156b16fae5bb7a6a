//! OS random source.

use rand::rngs::OsRng;
use rand_core::RngCore;

use crate::error::CryptoError;

/// Fill `out` from the OS RNG.
pub fn random_bytes(out: &mut [u8]) -> Result<(), CryptoError> {
    OsRng.try_fill_bytes(out).map_err(|_| CryptoError::Rng)
}

/// Fresh random fixed-size array (nonces, X25519 secrets, prekey ids).
pub fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut out = [0u8; N];
    random_bytes(&mut out)?;
    Ok(out)
}
