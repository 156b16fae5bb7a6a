//! Authenticated encryption with associated data.
//!
//! XChaCha20-Poly1305, 32-byte key, 24-byte caller-supplied nonce,
//! detached 16-byte tag. The message and media wire formats carry
//! `nonce`, `tag` and ciphertext as separate fields, so unlike the usual
//! nonce-prefixed helper the tag is detached here.

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const KEY_BYTES: usize = 32;
pub const NONCE_BYTES: usize = 24;
pub const TAG_BYTES: usize = 16;

/// Encrypt `plaintext`, authenticating `ad`. Returns `(ciphertext, tag)`.
pub fn lock(
    key: &[u8; KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    ad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_BYTES]), CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let mut buf = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(XNonce::from_slice(nonce), ad, &mut buf)
        .map_err(|_| CryptoError::AeadEncrypt)?;
    Ok((buf, tag.into()))
}

/// Decrypt and authenticate. A failure exposes no partial plaintext.
pub fn unlock(
    key: &[u8; KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    ad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; TAG_BYTES],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let mut buf = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(XNonce::from_slice(nonce), ad, &mut buf, Tag::from_slice(tag))
        .map_err(|_| CryptoError::AuthFailed)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = [7u8; 32];
        let nonce = [9u8; 24];
        let (ct, tag) = lock(&key, &nonce, b"header", b"secret message").unwrap();
        assert_ne!(ct.as_slice(), b"secret message");
        let plain = unlock(&key, &nonce, b"header", &ct, &tag).unwrap();
        assert_eq!(plain.as_slice(), b"secret message");
    }

    #[test]
    fn rejects_tampered_ad() {
        let key = [7u8; 32];
        let nonce = [9u8; 24];
        let (ct, tag) = lock(&key, &nonce, b"header", b"secret").unwrap();
        assert_eq!(
            unlock(&key, &nonce, b"HEADER", &ct, &tag),
            Err(CryptoError::AuthFailed)
        );
    }

    #[test]
    fn rejects_tampered_ciphertext_and_tag() {
        let key = [7u8; 32];
        let nonce = [9u8; 24];
        let (mut ct, mut tag) = lock(&key, &nonce, b"", b"secret").unwrap();
        ct[0] ^= 1;
        assert!(unlock(&key, &nonce, b"", &ct, &tag).is_err());
        ct[0] ^= 1;
        tag[0] ^= 1;
        assert!(unlock(&key, &nonce, b"", &ct, &tag).is_err());
    }
}
