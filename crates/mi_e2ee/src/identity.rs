//! Long-term identity persistence and prekey rotation.
//!
//! `identity.bin` (version 4, optionally keystore-wrapped):
//!
//!   version(1) | id_sig_sk(4032) | id_sig_pk(1952) | id_dh_sk(32)
//!   | spk_id_le(4) | spk_sk(32) | kem_sk(2400) | kem_pk(1184)
//!
//! Version 2 files predate the ML-DSA identity and are migrated by
//! synthesizing a fresh signature keypair; version 3 shares the v4 layout
//! and is rewritten; version 1 (Ed25519-seed era) is rejected so the user
//! re-enrolls instead of silently changing fingerprint.
//!
//! Rotation metadata and retired prekey secrets do not fit the fixed v4
//! layout; they live in `identity_meta.bin` next to it, wrapped the same
//! way. Retired `(spk_id, spk_sk, kem_sk)` sets are kept for the
//! retention window so PreKey messages built against a cached bundle
//! still open a session.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

use mi_crypto::dh::x25519_public;
use mi_crypto::kem::{kem_keypair, KemPublicKey, KemSecretKey, KEM_PUBLIC_KEY_BYTES, KEM_SECRET_KEY_BYTES};
use mi_crypto::rng::random_array;
use mi_crypto::sign::{
    sig_keypair, sign_detached, SigPublicKey, SigSecretKey, Signature, SIG_BYTES,
    SIG_PUBLIC_KEY_BYTES, SIG_SECRET_KEY_BYTES,
};

use crate::error::EngineError;
use crate::keystore::{is_wrapped, KeyStore, IDENTITY_ENTROPY, IDENTITY_WRAP_MAGIC};

pub(crate) const IDENTITY_VERSION: u8 = 4;
const META_VERSION: u8 = 1;
const SECONDS_PER_DAY: u64 = 86_400;

const IDENTITY_FILE: &str = "identity.bin";
const META_FILE: &str = "identity_meta.bin";

const V4_LEN: usize =
    1 + SIG_SECRET_KEY_BYTES + SIG_PUBLIC_KEY_BYTES + 32 + 4 + 32 + KEM_SECRET_KEY_BYTES + KEM_PUBLIC_KEY_BYTES;
const V2_LEN: usize = 1 + 32 + 32 + 4 + 32 + KEM_SECRET_KEY_BYTES + KEM_PUBLIC_KEY_BYTES;
const V1_LEN: usize = 1 + 32 + 32 + 4 + 32;

/// Rotation and wrapping knobs, applied at engine init.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct IdentityPolicy {
    /// Interval at which the SPK/KEM prekeys must be rotated.
    pub rotation_days: u32,
    /// How long retired prekey secrets are kept for in-flight messages.
    pub legacy_retention_days: u32,
    /// Wrap on-disk identity with the OS keystore when available.
    pub tpm_enable: bool,
    /// Refuse to run without the OS keystore.
    pub tpm_require: bool,
}

impl Default for IdentityPolicy {
    fn default() -> Self {
        Self {
            rotation_days: 90,
            legacy_retention_days: 180,
            tpm_enable: true,
            tpm_require: false,
        }
    }
}

/// A retired prekey set, kept so the responder handshake can still open
/// sessions from PreKey messages that reference it.
pub(crate) struct LegacyKeyset {
    pub spk_id: u32,
    pub retired_at: u64,
    pub spk_sk: [u8; 32],
    pub kem_sk: KemSecretKey,
}

impl Drop for LegacyKeyset {
    fn drop(&mut self) {
        self.spk_sk.zeroize();
        self.kem_sk.zeroize();
    }
}

pub(crate) struct IdentityStore {
    identity_path: PathBuf,
    meta_path: PathBuf,
    policy: IdentityPolicy,
    keystore: Option<Arc<dyn KeyStore>>,

    pub id_sig_sk: SigSecretKey,
    pub id_sig_pk: SigPublicKey,
    pub id_dh_sk: [u8; 32],
    pub id_dh_pk: [u8; 32],
    pub spk_id: u32,
    pub spk_sk: [u8; 32],
    pub spk_pk: [u8; 32],
    pub spk_sig: Signature,
    pub kem_sk: KemSecretKey,
    pub kem_pk: KemPublicKey,

    created_at: u64,
    rotated_at: u64,
    legacy: Vec<LegacyKeyset>,
}

impl Drop for IdentityStore {
    fn drop(&mut self) {
        self.id_sig_sk.zeroize();
        self.id_dh_sk.zeroize();
        self.spk_sk.zeroize();
        self.kem_sk.zeroize();
    }
}

/// Atomic write-then-rename; `0600` on POSIX.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<(), EngineError> {
    use std::io::Write as _;
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&dir).map_err(|e| EngineError::Storage(format!("create dir failed: {e}")))?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|e| EngineError::Storage(format!("tempfile failed: {e}")))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| EngineError::Storage(format!("chmod failed: {e}")))?;
    }
    tmp.write_all(data)
        .map_err(|e| EngineError::Storage(format!("write failed: {e}")))?;
    tmp.persist(path)
        .map_err(|e| EngineError::Storage(format!("rename failed: {e}")))?;
    Ok(())
}

fn read_le32(bytes: &[u8], off: &mut usize) -> u32 {
    let v = u32::from_le_bytes(bytes[*off..*off + 4].try_into().unwrap_or([0; 4]));
    *off += 4;
    v
}

fn read_le64(bytes: &[u8], off: &mut usize) -> u64 {
    let v = u64::from_le_bytes(bytes[*off..*off + 8].try_into().unwrap_or([0; 8]));
    *off += 8;
    v
}

fn copy_into<const N: usize>(dst: &mut [u8; N], src: &[u8], off: &mut usize) {
    dst.copy_from_slice(&src[*off..*off + N]);
    *off += N;
}

/// `"MISP" || spk_id_le || id_dh_pk || spk_pk || kem_pk` — what the
/// identity signature key certifies about the current prekeys.
pub(crate) fn spk_sig_message(
    spk_id: u32,
    id_dh_pk: &[u8; 32],
    spk_pk: &[u8; 32],
    kem_pk: &KemPublicKey,
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(4 + 4 + 32 + 32 + kem_pk.len());
    msg.extend_from_slice(b"MISP");
    msg.extend_from_slice(&spk_id.to_le_bytes());
    msg.extend_from_slice(id_dh_pk);
    msg.extend_from_slice(spk_pk);
    msg.extend_from_slice(kem_pk);
    msg
}

impl IdentityStore {
    pub fn load_or_create(
        state_dir: &Path,
        policy: IdentityPolicy,
        keystore: Option<Arc<dyn KeyStore>>,
    ) -> Result<Self, EngineError> {
        if policy.tpm_require && keystore.is_none() {
            return Err(EngineError::KeystoreUnavailable);
        }

        let mut store = Self {
            identity_path: state_dir.join(IDENTITY_FILE),
            meta_path: state_dir.join(META_FILE),
            policy,
            keystore,
            id_sig_sk: [0; SIG_SECRET_KEY_BYTES],
            id_sig_pk: [0; SIG_PUBLIC_KEY_BYTES],
            id_dh_sk: [0; 32],
            id_dh_pk: [0; 32],
            spk_id: 0,
            spk_sk: [0; 32],
            spk_pk: [0; 32],
            spk_sig: [0; SIG_BYTES],
            kem_sk: [0; KEM_SECRET_KEY_BYTES],
            kem_pk: [0; KEM_PUBLIC_KEY_BYTES],
            created_at: 0,
            rotated_at: 0,
            legacy: Vec::new(),
        };

        if store.identity_path.exists() {
            store.load()?;
        } else {
            store.create()?;
        }
        Ok(store)
    }

    fn wrapping_enabled(&self) -> bool {
        self.policy.tpm_enable && self.keystore.is_some()
    }

    fn read_protected(&self, path: &Path) -> Result<(Zeroizing<Vec<u8>>, bool), EngineError> {
        let raw = fs::read(path).map_err(|e| EngineError::Storage(format!("read failed: {e}")))?;
        if is_wrapped(IDENTITY_WRAP_MAGIC, &raw) {
            let keystore = self
                .keystore
                .as_ref()
                .ok_or(EngineError::IdentityUnprotectFailed)?;
            let plain = keystore.unwrap(IDENTITY_WRAP_MAGIC, IDENTITY_ENTROPY, &raw)?;
            Ok((Zeroizing::new(plain), true))
        } else {
            Ok((Zeroizing::new(raw), false))
        }
    }

    fn write_protected(&self, path: &Path, plain: &[u8]) -> Result<(), EngineError> {
        if self.wrapping_enabled() {
            let keystore = self.keystore.as_ref().ok_or(EngineError::KeystoreUnavailable)?;
            let wrapped = keystore.wrap(IDENTITY_WRAP_MAGIC, IDENTITY_ENTROPY, plain)?;
            write_atomic(path, &wrapped)
        } else {
            write_atomic(path, plain)
        }
    }

    fn load(&mut self) -> Result<(), EngineError> {
        let (bytes, was_wrapped) = self.read_protected(&self.identity_path)?;
        if bytes.is_empty() {
            return Err(EngineError::IdentityTruncated);
        }
        let version = bytes[0];
        let mut rewrite = match version {
            1 => {
                // Ed25519-seed era. Migrating would silently mint a new
                // fingerprint; force re-enrollment instead.
                if bytes.len() != V1_LEN {
                    return Err(EngineError::IdentitySizeInvalid);
                }
                return Err(EngineError::IdentityVersionMismatch);
            }
            2 => {
                if bytes.len() != V2_LEN {
                    return Err(EngineError::IdentitySizeInvalid);
                }
                let mut off = 1 + 32; // skip legacy ed25519 seed
                copy_into(&mut self.id_dh_sk, &bytes, &mut off);
                self.spk_id = read_le32(&bytes, &mut off);
                copy_into(&mut self.spk_sk, &bytes, &mut off);
                copy_into(&mut self.kem_sk, &bytes, &mut off);
                copy_into(&mut self.kem_pk, &bytes, &mut off);
                let (sig_pk, sig_sk) = sig_keypair()?;
                self.id_sig_pk = sig_pk;
                self.id_sig_sk = sig_sk;
                info!("identity migrated from version 2, signature identity synthesized");
                true
            }
            3 | IDENTITY_VERSION => {
                if bytes.len() != V4_LEN {
                    return Err(EngineError::IdentitySizeInvalid);
                }
                let mut off = 1;
                copy_into(&mut self.id_sig_sk, &bytes, &mut off);
                copy_into(&mut self.id_sig_pk, &bytes, &mut off);
                copy_into(&mut self.id_dh_sk, &bytes, &mut off);
                self.spk_id = read_le32(&bytes, &mut off);
                copy_into(&mut self.spk_sk, &bytes, &mut off);
                copy_into(&mut self.kem_sk, &bytes, &mut off);
                copy_into(&mut self.kem_pk, &bytes, &mut off);
                version != IDENTITY_VERSION
            }
            _ => return Err(EngineError::IdentityVersionMismatch),
        };

        // A plaintext file while wrapping is on gets rewritten wrapped.
        if self.wrapping_enabled() && !was_wrapped {
            rewrite = true;
        }

        self.derive()?;
        self.load_meta()?;
        if rewrite {
            self.save()?;
        }
        Ok(())
    }

    fn create(&mut self) -> Result<(), EngineError> {
        self.id_dh_sk = random_array()?;
        self.spk_sk = random_array()?;
        self.spk_id = u32::from_le_bytes(random_array::<4>()?);
        let (kem_pk, kem_sk) = kem_keypair()?;
        self.kem_pk = kem_pk;
        self.kem_sk = kem_sk;
        let (sig_pk, sig_sk) = sig_keypair()?;
        self.id_sig_pk = sig_pk;
        self.id_sig_sk = sig_sk;
        self.derive()?;
        self.save()?;
        info!("fresh identity created");
        Ok(())
    }

    /// Recompute public halves and re-sign the prekeys.
    fn derive(&mut self) -> Result<(), EngineError> {
        self.id_dh_pk = x25519_public(&self.id_dh_sk);
        self.spk_pk = x25519_public(&self.spk_sk);
        let msg = spk_sig_message(self.spk_id, &self.id_dh_pk, &self.spk_pk, &self.kem_pk);
        self.spk_sig = sign_detached(&msg, &self.id_sig_sk)?;
        Ok(())
    }

    fn save(&self) -> Result<(), EngineError> {
        let mut out = Zeroizing::new(Vec::with_capacity(V4_LEN));
        out.push(IDENTITY_VERSION);
        out.extend_from_slice(&self.id_sig_sk);
        out.extend_from_slice(&self.id_sig_pk);
        out.extend_from_slice(&self.id_dh_sk);
        out.extend_from_slice(&self.spk_id.to_le_bytes());
        out.extend_from_slice(&self.spk_sk);
        out.extend_from_slice(&self.kem_sk);
        out.extend_from_slice(&self.kem_pk);
        self.write_protected(&self.identity_path, &out)?;
        self.save_meta()
    }

    fn load_meta(&mut self) -> Result<(), EngineError> {
        self.created_at = 0;
        self.rotated_at = 0;
        self.legacy.clear();
        if !self.meta_path.exists() {
            return Ok(());
        }
        let (bytes, _) = self.read_protected(&self.meta_path)?;
        const ENTRY_LEN: usize = 4 + 8 + 32 + KEM_SECRET_KEY_BYTES;
        if bytes.len() < 1 + 8 + 8 + 4 || bytes[0] != META_VERSION {
            return Err(EngineError::IdentitySizeInvalid);
        }
        let mut off = 1;
        self.created_at = read_le64(&bytes, &mut off);
        self.rotated_at = read_le64(&bytes, &mut off);
        let count = read_le32(&bytes, &mut off) as usize;
        if bytes.len() != 1 + 8 + 8 + 4 + count * ENTRY_LEN {
            return Err(EngineError::IdentitySizeInvalid);
        }
        for _ in 0..count {
            let spk_id = read_le32(&bytes, &mut off);
            let retired_at = read_le64(&bytes, &mut off);
            let mut spk_sk = [0u8; 32];
            copy_into(&mut spk_sk, &bytes, &mut off);
            let mut kem_sk = [0u8; KEM_SECRET_KEY_BYTES];
            copy_into(&mut kem_sk, &bytes, &mut off);
            self.legacy.push(LegacyKeyset {
                spk_id,
                retired_at,
                spk_sk,
                kem_sk,
            });
        }
        Ok(())
    }

    fn save_meta(&self) -> Result<(), EngineError> {
        let mut out = Zeroizing::new(Vec::with_capacity(
            1 + 8 + 8 + 4 + self.legacy.len() * (4 + 8 + 32 + KEM_SECRET_KEY_BYTES),
        ));
        out.push(META_VERSION);
        out.extend_from_slice(&self.created_at.to_le_bytes());
        out.extend_from_slice(&self.rotated_at.to_le_bytes());
        out.extend_from_slice(&(self.legacy.len() as u32).to_le_bytes());
        for entry in &self.legacy {
            out.extend_from_slice(&entry.spk_id.to_le_bytes());
            out.extend_from_slice(&entry.retired_at.to_le_bytes());
            out.extend_from_slice(&entry.spk_sk);
            out.extend_from_slice(&entry.kem_sk);
        }
        self.write_protected(&self.meta_path, &out)
    }

    /// Deterministic public bundle: `version(5) || id_sig_pk || id_dh_pk
    /// || spk_id_le || spk_pk || kem_pk || spk_sig`.
    pub fn build_publish_bundle(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + SIG_PUBLIC_KEY_BYTES + 32 + 4 + 32 + KEM_PUBLIC_KEY_BYTES + SIG_BYTES,
        );
        out.push(crate::bundle::PROTOCOL_VERSION);
        out.extend_from_slice(&self.id_sig_pk);
        out.extend_from_slice(&self.id_dh_pk);
        out.extend_from_slice(&self.spk_id.to_le_bytes());
        out.extend_from_slice(&self.spk_pk);
        out.extend_from_slice(&self.kem_pk);
        out.extend_from_slice(&self.spk_sig);
        out
    }

    /// Rotate SPK/KEM prekeys when due. Retired secrets move to the
    /// legacy list; expired legacy entries are pruned on every call.
    /// The first call stamps the rotation clock instead of rotating.
    pub fn maybe_rotate_prekeys(&mut self, now_sec: u64) -> Result<bool, EngineError> {
        let pruned = self.prune_legacy(now_sec);

        if self.rotated_at == 0 {
            if self.created_at == 0 {
                self.created_at = now_sec;
            }
            self.rotated_at = now_sec;
            self.save_meta()?;
            return Ok(false);
        }

        let due = now_sec.saturating_sub(self.rotated_at)
            > u64::from(self.policy.rotation_days) * SECONDS_PER_DAY;
        if !due {
            if pruned {
                self.save_meta()?;
            }
            return Ok(false);
        }

        let old_spk_id = self.spk_id;
        let old_spk_sk = self.spk_sk;
        let old_kem_sk = self.kem_sk;
        let old_kem_pk = self.kem_pk;

        let new_spk_sk = random_array::<32>()?;
        let (new_kem_pk, new_kem_sk) = kem_keypair()?;

        self.spk_id = old_spk_id.wrapping_add(1);
        self.spk_sk = new_spk_sk;
        self.kem_sk = new_kem_sk;
        self.kem_pk = new_kem_pk;
        if let Err(err) = self.derive() {
            // Rotation failures keep the current identity usable.
            self.spk_id = old_spk_id;
            self.spk_sk = old_spk_sk;
            self.kem_sk = old_kem_sk;
            self.kem_pk = old_kem_pk;
            return Err(err);
        }
        self.legacy.push(LegacyKeyset {
            spk_id: old_spk_id,
            retired_at: now_sec,
            spk_sk: old_spk_sk,
            kem_sk: old_kem_sk,
        });
        self.rotated_at = now_sec;
        self.save()?;
        debug!(spk_id = self.spk_id, "prekeys rotated");
        Ok(true)
    }

    fn prune_legacy(&mut self, now_sec: u64) -> bool {
        let retention = u64::from(self.policy.legacy_retention_days) * SECONDS_PER_DAY;
        let before = self.legacy.len();
        self.legacy
            .retain(|entry| now_sec.saturating_sub(entry.retired_at) <= retention);
        self.legacy.len() != before
    }

    pub fn find_legacy_key(&self, spk_id: u32) -> Option<&LegacyKeyset> {
        self.legacy.iter().find(|entry| entry.spk_id == spk_id)
    }

    pub fn sign_detached(&self, message: &[u8]) -> Result<Signature, EngineError> {
        Ok(sign_detached(message, &self.id_sig_sk)?)
    }

    #[cfg(test)]
    pub fn legacy_len(&self) -> usize {
        self.legacy.len()
    }
}
