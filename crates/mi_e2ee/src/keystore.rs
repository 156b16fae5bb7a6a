//! Optional OS-keystore wrapping of on-disk secrets.
//!
//! When enabled by [`crate::IdentityPolicy`], the identity files are not
//! written in the clear: a random 32-byte wrap key lives in the platform
//! credential store (Windows Credential Manager, Secret Service on Linux,
//! Keychain on macOS) and the file carries
//!
//!   magic || wrapped_len_le(4) || nonce(24) || tag(16) || ciphertext
//!
//! with the fixed entropy label as AEAD associated data. Availability is
//! probed once per process and cached; `tpm_enable` falls back to
//! plaintext when no keystore is reachable, `tpm_require` makes that
//! fatal.

use std::sync::Arc;

use keyring::Entry;
use once_cell::sync::Lazy;
use tracing::debug;
use zeroize::Zeroize;

use mi_crypto::{aead, rng};

use crate::error::EngineError;

pub const IDENTITY_WRAP_MAGIC: &[u8] = b"MI_E2EE_IDENTITY_DPAPI1";
pub const IDENTITY_ENTROPY: &[u8] = b"MI_E2EE_IDENTITY_ENTROPY_V1";
pub const DEVICE_ID_ENTROPY: &[u8] = b"MI_E2EE_DEVICE_ID_ENTROPY_V1";

const SERVICE_NAME: &str = "mi_e2ee";
const WRAP_KEY_ACCOUNT: &str = "identity_wrap_key";

pub trait KeyStore: Send + Sync {
    fn wrap(&self, magic: &[u8], entropy: &[u8], plain: &[u8]) -> Result<Vec<u8>, EngineError>;
    fn unwrap(&self, magic: &[u8], entropy: &[u8], wrapped: &[u8]) -> Result<Vec<u8>, EngineError>;
}

/// Whether `data` is a wrapped blob under `magic`.
pub fn is_wrapped(magic: &[u8], data: &[u8]) -> bool {
    data.len() >= magic.len() && &data[..magic.len()] == magic
}

/// Keystore backed by the platform credential store.
pub struct OsKeyStore {
    wrap_key: [u8; 32],
}

impl Drop for OsKeyStore {
    fn drop(&mut self) {
        self.wrap_key.zeroize();
    }
}

impl OsKeyStore {
    /// Load or create the wrap key. `None` when no credential store is
    /// reachable (headless session, locked keyring, ...).
    fn open() -> Option<Self> {
        let entry = Entry::new(SERVICE_NAME, WRAP_KEY_ACCOUNT).ok()?;
        match entry.get_password() {
            Ok(encoded) => {
                let bytes = hex::decode(encoded).ok()?;
                let wrap_key: [u8; 32] = bytes.try_into().ok()?;
                Some(Self { wrap_key })
            }
            Err(keyring::Error::NoEntry) => {
                let wrap_key = rng::random_array::<32>().ok()?;
                entry.set_password(&hex::encode(wrap_key)).ok()?;
                Some(Self { wrap_key })
            }
            Err(_) => None,
        }
    }
}

impl KeyStore for OsKeyStore {
    fn wrap(&self, magic: &[u8], entropy: &[u8], plain: &[u8]) -> Result<Vec<u8>, EngineError> {
        let nonce = rng::random_array::<{ aead::NONCE_BYTES }>()?;
        let (cipher, tag) =
            aead::lock(&self.wrap_key, &nonce, entropy, plain).map_err(|_| EngineError::IdentityWrapFailed)?;
        let blob_len = (aead::NONCE_BYTES + aead::TAG_BYTES + cipher.len()) as u32;
        let mut out = Vec::with_capacity(magic.len() + 4 + blob_len as usize);
        out.extend_from_slice(magic);
        out.extend_from_slice(&blob_len.to_le_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&cipher);
        Ok(out)
    }

    fn unwrap(&self, magic: &[u8], entropy: &[u8], wrapped: &[u8]) -> Result<Vec<u8>, EngineError> {
        if !is_wrapped(magic, wrapped) {
            return Err(EngineError::IdentityUnprotectFailed);
        }
        let mut off = magic.len();
        let len_bytes: [u8; 4] = wrapped
            .get(off..off + 4)
            .and_then(|b| b.try_into().ok())
            .ok_or(EngineError::IdentityUnprotectFailed)?;
        off += 4;
        let blob_len = u32::from_le_bytes(len_bytes) as usize;
        if off + blob_len != wrapped.len() || blob_len < aead::NONCE_BYTES + aead::TAG_BYTES {
            return Err(EngineError::IdentityUnprotectFailed);
        }
        let nonce: [u8; aead::NONCE_BYTES] = wrapped[off..off + aead::NONCE_BYTES]
            .try_into()
            .map_err(|_| EngineError::IdentityUnprotectFailed)?;
        off += aead::NONCE_BYTES;
        let tag: [u8; aead::TAG_BYTES] = wrapped[off..off + aead::TAG_BYTES]
            .try_into()
            .map_err(|_| EngineError::IdentityUnprotectFailed)?;
        off += aead::TAG_BYTES;
        let plain = aead::unlock(&self.wrap_key, &nonce, entropy, &wrapped[off..], &tag)
            .map_err(|_| EngineError::IdentityUnprotectFailed)?;
        Ok(plain.as_slice().to_vec())
    }
}

static OS_KEYSTORE: Lazy<Option<Arc<OsKeyStore>>> = Lazy::new(|| {
    let store = OsKeyStore::open();
    debug!(available = store.is_some(), "os keystore probed");
    store.map(Arc::new)
});

/// The process-wide OS keystore, probed on first use.
pub fn os_keystore() -> Option<Arc<dyn KeyStore>> {
    OS_KEYSTORE
        .clone()
        .map(|store| store as Arc<dyn KeyStore>)
}
