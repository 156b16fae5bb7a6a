//! Trust-on-first-use fingerprint pinning and the short authentication
//! string.
//!
//! The trust store is a local JSON map `username -> fingerprint hex`.
//! First contact (or a changed fingerprint) parks the operation behind a
//! pending-trust record whose `pin6` the user confirms out-of-band; the
//! exact SAS is the only input that completes the pin.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use mi_crypto::hash::{ct_eq, sha256_hex};

use crate::error::EngineError;
use crate::identity::write_atomic;

const SAS_PREFIX: &[u8] = b"MI_PEER_ID_SAS_V1";
const SAS_HEX_CHARS: usize = 20;

/// A peer awaiting out-of-band confirmation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PendingPeerTrust {
    pub peer_username: String,
    pub fingerprint_hex: String,
    /// Human-verifiable code, e.g. `ab12-34cd-56ef-7890-12ab`.
    pub pin6: String,
}

/// SAS for a fingerprint: first 20 hex chars of
/// `SHA256("MI_PEER_ID_SAS_V1" || fp_bytes)`, dash-grouped in quartets.
pub fn sas_from_fingerprint_hex(fingerprint_hex: &str) -> Option<String> {
    let fp_bytes = hex::decode(fingerprint_hex).ok()?;
    if fp_bytes.len() != 32 {
        return None;
    }
    let mut msg = Vec::with_capacity(SAS_PREFIX.len() + fp_bytes.len());
    msg.extend_from_slice(SAS_PREFIX);
    msg.extend_from_slice(&fp_bytes);
    let digest_hex = sha256_hex(&msg);
    Some(group_hex4(&digest_hex[..SAS_HEX_CHARS]))
}

fn group_hex4(hex: &str) -> String {
    let mut out = String::with_capacity(hex.len() + hex.len() / 4);
    for (i, c) in hex.chars().enumerate() {
        if i != 0 && i % 4 == 0 {
            out.push('-');
        }
        out.push(c);
    }
    out
}

/// Strip whitespace and dashes, lowercase: what the user typed and what
/// we generated compare equal regardless of formatting.
pub(crate) fn normalize_code(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

pub(crate) fn codes_match(entered: &str, expected: &str) -> bool {
    ct_eq(
        normalize_code(entered).as_bytes(),
        normalize_code(expected).as_bytes(),
    )
}

pub(crate) struct TrustStore {
    path: PathBuf,
    peers: BTreeMap<String, String>,
}

impl TrustStore {
    pub fn load(path: PathBuf) -> Result<Self, EngineError> {
        let peers = if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| EngineError::Storage(format!("read trust store failed: {e}")))?;
            serde_json::from_str(&raw)
                .map_err(|e| EngineError::Storage(format!("parse trust store failed: {e}")))?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, peers })
    }

    pub fn get(&self, peer: &str) -> Option<&str> {
        self.peers.get(peer).map(String::as_str)
    }

    pub fn insert(&mut self, peer: &str, fingerprint_hex: &str) -> Result<(), EngineError> {
        self.peers
            .insert(peer.to_string(), fingerprint_hex.to_string());
        self.save()
    }

    fn save(&self) -> Result<(), EngineError> {
        let json = serde_json::to_string_pretty(&self.peers)
            .map_err(|e| EngineError::Storage(format!("encode trust store failed: {e}")))?;
        write_atomic(&self.path, json.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sas_has_dash_grouped_quartets() {
        let fp = "aa".repeat(32);
        let sas = sas_from_fingerprint_hex(&fp).unwrap();
        assert_eq!(sas.len(), 24);
        assert_eq!(sas.matches('-').count(), 4);
        for (i, c) in sas.chars().enumerate() {
            if i % 5 == 4 {
                assert_eq!(c, '-');
            } else {
                assert!(c.is_ascii_hexdigit());
            }
        }
    }

    #[test]
    fn sas_is_deterministic_and_fp_sensitive() {
        let fp_a = "ab".repeat(32);
        let fp_b = "cd".repeat(32);
        assert_eq!(
            sas_from_fingerprint_hex(&fp_a),
            sas_from_fingerprint_hex(&fp_a)
        );
        assert_ne!(
            sas_from_fingerprint_hex(&fp_a),
            sas_from_fingerprint_hex(&fp_b)
        );
        assert!(sas_from_fingerprint_hex("zz").is_none());
    }

    #[test]
    fn normalization_ignores_formatting() {
        assert!(codes_match(" AB12-34cd ", "ab12 34CD"));
        assert!(!codes_match("ab12", "ab13"));
    }

    #[test]
    fn store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer_trust.json");
        let mut store = TrustStore::load(path.clone()).unwrap();
        assert!(store.get("alice").is_none());
        store.insert("alice", "deadbeef").unwrap();

        let reloaded = TrustStore::load(path).unwrap();
        assert_eq!(reloaded.get("alice"), Some("deadbeef"));
    }
}
