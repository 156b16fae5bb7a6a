//! HKDF-SHA256 key derivation.
//!
//! Every ratchet and handshake derivation in the workspace goes through
//! [`hkdf_expand`]; the byte-exact `info` labels live with their call
//! sites so the wire-format constants stay in one place per protocol.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;

/// Expand `ikm` (+ optional `salt`) into `out.len()` bytes keyed by `info`.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, out).map_err(|_| CryptoError::Hkdf)
}

/// Expand into a fixed-size buffer and split it as `(left, right)` 32-byte
/// halves — the shape every chain-step KDF in the protocol uses.
pub fn hkdf_expand_pair(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut buf = [0u8; 64];
    hkdf_expand(ikm, salt, info, &mut buf)?;
    let mut left = [0u8; 32];
    let mut right = [0u8; 32];
    left.copy_from_slice(&buf[..32]);
    right.copy_from_slice(&buf[32..]);
    Ok((left, right))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_is_deterministic() {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        hkdf_expand(b"ikm", None, b"label", &mut a).unwrap();
        hkdf_expand(b"ikm", None, b"label", &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn expand_separates_domains() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        hkdf_expand(b"ikm", None, b"label-a", &mut a).unwrap();
        hkdf_expand(b"ikm", None, b"label-b", &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn pair_matches_flat_expand() {
        let (l, r) = hkdf_expand_pair(b"ikm", Some(b"salt"), b"label").unwrap();
        let mut flat = [0u8; 64];
        hkdf_expand(b"ikm", Some(b"salt"), b"label", &mut flat).unwrap();
        assert_eq!(&flat[..32], &l);
        assert_eq!(&flat[32..], &r);
    }
}
