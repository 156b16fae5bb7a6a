//! The persistent key-transparency log.
//!
//! On-disk format, append-only:
//!
//!   "MIKTLOG1" || { u16 LE user_len; username; id_sig_pk(1952); id_dh_pk(32) }*
//!
//! A truncated trailing record (crash mid-append) is ignored on load and
//! recovered by the next append. In memory the log keeps every leaf hash,
//! the complete power-of-two subtree roots, and the latest leaf per
//! username. All access is serialized by one mutex; operations under the
//! lock are pure compute plus the append write.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::debug;

use mi_crypto::sign::SIG_PUBLIC_KEY_BYTES;

use crate::error::KtError;
use crate::merkle::{self, Hash32};

const MAGIC: &[u8; 8] = b"MIKTLOG1";
const LEAF_DATA_PREFIX: &[u8] = b"mi_e2ee_kt_leaf_v1\0";
const MAX_USERNAME_BYTES: usize = 4096;

pub const KT_ID_SIG_PK_BYTES: usize = SIG_PUBLIC_KEY_BYTES;
pub const KT_ID_DH_PK_BYTES: usize = 32;

/// Tree head: what an external ML-DSA-65 signer turns into an STH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KtSth {
    pub tree_size: u64,
    pub root: Hash32,
}

/// Proof that the latest leaf for a username is in the tree, plus the
/// consistency path back to the client's pinned tree size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KtProof {
    pub sth: KtSth,
    pub leaf_index: u64,
    pub audit_path: Vec<Hash32>,
    pub consistency_path: Vec<Hash32>,
}

/// The exact bytes an STH signer signs: `tree_size_le(8) || root(32)`.
pub fn sth_signing_bytes(sth: &KtSth) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 32);
    out.extend_from_slice(&sth.tree_size.to_le_bytes());
    out.extend_from_slice(&sth.root);
    out
}

struct LatestKey {
    leaf_index: u64,
    leaf_hash: Hash32,
}

struct LogInner {
    log_path: PathBuf,
    leaves: Vec<Hash32>,
    /// `pow2_levels[l-1][i]` is the root of the complete subtree over
    /// leaves `[i * 2^l, (i+1) * 2^l)`.
    pow2_levels: Vec<Vec<Hash32>>,
    latest_by_user: HashMap<String, LatestKey>,
    root: Hash32,
}

pub struct KeyTransparencyLog {
    inner: Mutex<LogInner>,
}

fn build_leaf_data(
    username: &str,
    id_sig_pk: &[u8; KT_ID_SIG_PK_BYTES],
    id_dh_pk: &[u8; KT_ID_DH_PK_BYTES],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        LEAF_DATA_PREFIX.len() + username.len() + 1 + id_sig_pk.len() + id_dh_pk.len(),
    );
    out.extend_from_slice(LEAF_DATA_PREFIX);
    out.extend_from_slice(username.as_bytes());
    out.push(0);
    out.extend_from_slice(id_sig_pk);
    out.extend_from_slice(id_dh_pk);
    out
}

fn read_exact_or_eof(f: &mut File, buf: &mut [u8]) -> bool {
    let mut filled = 0;
    while filled < buf.len() {
        match f.read(&mut buf[filled..]) {
            Ok(0) => return false,
            Ok(n) => filled += n,
            Err(_) => return false,
        }
    }
    true
}

impl KeyTransparencyLog {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                log_path: log_path.into(),
                leaves: Vec::new(),
                pow2_levels: Vec::new(),
                latest_by_user: HashMap::new(),
                root: merkle::empty_root(),
            }),
        }
    }

    /// Read the log file and rebuild the in-memory tree. A missing file is
    /// an empty log; a truncated trailing record is dropped.
    pub fn load(&self) -> Result<(), KtError> {
        let mut inner = self.inner.lock();
        inner.leaves.clear();
        inner.pow2_levels.clear();
        inner.latest_by_user.clear();

        if inner.log_path.as_os_str().is_empty() {
            return Err(KtError::PathEmpty);
        }
        if !inner.log_path.exists() {
            inner.recompute_root();
            return Ok(());
        }

        let mut f = File::open(&inner.log_path).map_err(|_| KtError::Open)?;
        let mut magic = [0u8; 8];
        if !read_exact_or_eof(&mut f, &mut magic) {
            inner.recompute_root();
            return Ok(());
        }
        if &magic != MAGIC {
            return Err(KtError::MagicMismatch);
        }

        loop {
            let mut len_bytes = [0u8; 2];
            if !read_exact_or_eof(&mut f, &mut len_bytes) {
                break;
            }
            let user_len = u16::from_le_bytes(len_bytes) as usize;
            if user_len == 0 || user_len > MAX_USERNAME_BYTES {
                return Err(KtError::UsernameLengthInvalid);
            }
            let mut user_buf = vec![0u8; user_len];
            if !read_exact_or_eof(&mut f, &mut user_buf) {
                break;
            }
            let username = String::from_utf8_lossy(&user_buf).into_owned();

            let mut id_sig_pk = [0u8; KT_ID_SIG_PK_BYTES];
            let mut id_dh_pk = [0u8; KT_ID_DH_PK_BYTES];
            if !read_exact_or_eof(&mut f, &mut id_sig_pk)
                || !read_exact_or_eof(&mut f, &mut id_dh_pk)
            {
                break;
            }

            let leaf_hash = merkle::hash_leaf(&build_leaf_data(&username, &id_sig_pk, &id_dh_pk));
            let idx = inner.leaves.len() as u64;
            inner.leaves.push(leaf_hash);
            inner.latest_by_user.insert(
                username,
                LatestKey {
                    leaf_index: idx,
                    leaf_hash,
                },
            );
        }

        inner.rebuild_pow2_levels();
        inner.recompute_root();
        debug!(tree_size = inner.leaves.len(), "kt log loaded");
        Ok(())
    }

    /// Append a `(username, keys)` leaf unless it matches the user's
    /// current one.
    pub fn update_identity_keys(
        &self,
        username: &str,
        id_sig_pk: &[u8; KT_ID_SIG_PK_BYTES],
        id_dh_pk: &[u8; KT_ID_DH_PK_BYTES],
    ) -> Result<(), KtError> {
        if username.is_empty() {
            return Err(KtError::UsernameEmpty);
        }
        if username.len() > MAX_USERNAME_BYTES {
            return Err(KtError::UsernameTooLong);
        }
        let leaf_hash = merkle::hash_leaf(&build_leaf_data(username, id_sig_pk, id_dh_pk));

        let mut inner = self.inner.lock();
        if inner.log_path.as_os_str().is_empty() {
            return Err(KtError::PathEmpty);
        }
        if let Some(latest) = inner.latest_by_user.get(username) {
            if latest.leaf_hash == leaf_hash {
                return Ok(());
            }
        }
        inner.append_record(username, id_sig_pk, id_dh_pk)?;
        inner.append_leaf_hash(leaf_hash);
        let leaf_index = inner.leaves.len() as u64 - 1;
        inner.latest_by_user.insert(
            username.to_string(),
            LatestKey {
                leaf_index,
                leaf_hash,
            },
        );
        inner.recompute_root();
        debug!(username, leaf_index, "kt leaf appended");
        Ok(())
    }

    pub fn head(&self) -> KtSth {
        let inner = self.inner.lock();
        KtSth {
            tree_size: inner.leaves.len() as u64,
            root: inner.root,
        }
    }

    /// Inclusion proof for the latest leaf of `username`, with a
    /// consistency path from `client_tree_size` when the client pinned an
    /// earlier head.
    pub fn build_proof_for_latest_key(
        &self,
        username: &str,
        client_tree_size: u64,
    ) -> Result<KtProof, KtError> {
        if username.is_empty() {
            return Err(KtError::UsernameEmpty);
        }
        let inner = self.inner.lock();
        let latest = inner
            .latest_by_user
            .get(username)
            .ok_or(KtError::EntryNotFound)?;
        let n = inner.leaves.len();
        if n == 0 {
            return Err(KtError::Empty);
        }

        let mut proof = KtProof {
            sth: KtSth {
                tree_size: n as u64,
                root: inner.root,
            },
            leaf_index: latest.leaf_index,
            audit_path: merkle::audit_path(
                latest.leaf_index as usize,
                &inner.leaves,
                &inner.pow2_levels,
                0,
                n,
            ),
            consistency_path: Vec::new(),
        };
        if client_tree_size > 0 && client_tree_size < n as u64 {
            proof.consistency_path = merkle::consistency_proof(
                client_tree_size as usize,
                &inner.leaves,
                &inner.pow2_levels,
                0,
                n,
            );
        }
        Ok(proof)
    }

    /// Consistency proof between two historical tree sizes.
    pub fn build_consistency_proof(
        &self,
        old_size: u64,
        new_size: u64,
    ) -> Result<Vec<Hash32>, KtError> {
        let inner = self.inner.lock();
        let current = inner.leaves.len() as u64;
        if old_size == 0 || new_size == 0 || old_size > new_size {
            return Err(KtError::InvalidSizes);
        }
        if new_size > current {
            return Err(KtError::SizeBeyondHead);
        }
        if old_size == new_size {
            return Ok(Vec::new());
        }
        Ok(merkle::consistency_proof(
            old_size as usize,
            &inner.leaves,
            &inner.pow2_levels,
            0,
            new_size as usize,
        ))
    }
}

impl LogInner {
    fn recompute_root(&mut self) {
        self.root = merkle::tree_hash(&self.leaves, &self.pow2_levels, 0, self.leaves.len());
    }

    fn rebuild_pow2_levels(&mut self) {
        fn pair_up(prev: &[Hash32]) -> Vec<Hash32> {
            prev.chunks_exact(2)
                .map(|p| merkle::hash_node(&p[0], &p[1]))
                .collect()
        }
        self.pow2_levels.clear();
        let mut current = pair_up(&self.leaves);
        while !current.is_empty() {
            let next = pair_up(&current);
            self.pow2_levels.push(current);
            current = next;
        }
    }

    /// Extend the cached levels after appending leaf number `n` (1-based):
    /// level `l` gains a node whenever `n % 2^l == 0`.
    fn append_leaf_hash(&mut self, leaf_hash: Hash32) {
        self.leaves.push(leaf_hash);
        let n = self.leaves.len();
        if n < 2 {
            return;
        }
        let mut block = 2usize;
        let mut level_idx = 0usize;
        while n % block == 0 {
            if self.pow2_levels.len() <= level_idx {
                self.pow2_levels.push(Vec::new());
            }
            let node = {
                let prev: &[Hash32] = if level_idx == 0 {
                    &self.leaves
                } else {
                    &self.pow2_levels[level_idx - 1]
                };
                if prev.len() < 2 {
                    break;
                }
                merkle::hash_node(&prev[prev.len() - 2], &prev[prev.len() - 1])
            };
            self.pow2_levels[level_idx].push(node);
            level_idx += 1;
            match block.checked_mul(2) {
                Some(next) => block = next,
                None => break,
            }
        }
    }

    fn append_record(
        &mut self,
        username: &str,
        id_sig_pk: &[u8; KT_ID_SIG_PK_BYTES],
        id_dh_pk: &[u8; KT_ID_DH_PK_BYTES],
    ) -> Result<(), KtError> {
        if let Some(dir) = self.log_path.parent() {
            if !dir.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(dir);
            }
        }
        let exists = self.log_path.exists();
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|_| KtError::OpenAppend)?;
        let mut record = Vec::with_capacity(
            MAGIC.len() + 2 + username.len() + id_sig_pk.len() + id_dh_pk.len(),
        );
        if !exists {
            record.extend_from_slice(MAGIC);
        }
        record.extend_from_slice(&(username.len() as u16).to_le_bytes());
        record.extend_from_slice(username.as_bytes());
        record.extend_from_slice(id_sig_pk);
        record.extend_from_slice(id_dh_pk);
        out.write_all(&record).map_err(|_| KtError::Write)?;
        out.flush().map_err(|_| KtError::Write)?;
        Ok(())
    }
}

/// Standalone helper mirroring [`KeyTransparencyLog`]'s leaf hashing, for
/// clients that verify proofs against locally known identity keys.
pub fn leaf_hash_for(
    username: &str,
    id_sig_pk: &[u8; KT_ID_SIG_PK_BYTES],
    id_dh_pk: &[u8; KT_ID_DH_PK_BYTES],
) -> Hash32 {
    merkle::hash_leaf(&build_leaf_data(username, id_sig_pk, id_dh_pk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sth_bytes_layout() {
        let sth = KtSth {
            tree_size: 0x0102,
            root: [0xAB; 32],
        };
        let bytes = sth_signing_bytes(&sth);
        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[..8], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[8..], &[0xAB; 32]);
    }

    #[test]
    fn unchanged_leaf_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let log = KeyTransparencyLog::new(dir.path().join("kt_log.bin"));
        log.load().unwrap();

        let sig_pk = [1u8; KT_ID_SIG_PK_BYTES];
        let dh_pk = [2u8; KT_ID_DH_PK_BYTES];
        log.update_identity_keys("alice", &sig_pk, &dh_pk).unwrap();
        log.update_identity_keys("alice", &sig_pk, &dh_pk).unwrap();
        assert_eq!(log.head().tree_size, 1);

        let rotated = [3u8; KT_ID_SIG_PK_BYTES];
        log.update_identity_keys("alice", &rotated, &dh_pk).unwrap();
        assert_eq!(log.head().tree_size, 2);
    }

    #[test]
    fn truncated_tail_record_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kt_log.bin");
        let log = KeyTransparencyLog::new(&path);
        log.load().unwrap();
        log.update_identity_keys("alice", &[1; KT_ID_SIG_PK_BYTES], &[2; 32])
            .unwrap();

        // Simulate a crash mid-append.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&3u16.to_le_bytes()).unwrap();
        f.write_all(b"bo").unwrap();
        drop(f);

        let reloaded = KeyTransparencyLog::new(&path);
        reloaded.load().unwrap();
        assert_eq!(reloaded.head().tree_size, 1);
        assert_eq!(reloaded.head().root, log.head().root);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kt_log.bin");
        std::fs::write(&path, b"NOTMYLOG").unwrap();
        let log = KeyTransparencyLog::new(&path);
        assert!(matches!(log.load(), Err(KtError::MagicMismatch)));
    }
}
