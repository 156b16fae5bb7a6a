//! mi_e2ee — identity, hybrid handshake and double-ratchet engine
//!
//! The per-peer messaging core: a post-quantum hybrid X3DH-style
//! handshake (X25519 + ML-KEM-768, identities signed with ML-DSA-65)
//! feeding a double ratchet with skipped-key buffering, trust-on-first-use
//! fingerprint pinning with a short authentication string, and an identity
//! store with signed-prekey rotation and legacy-key retention.
//!
//! # Module layout
//! - `identity` — long-term identity persistence, prekey rotation, bundles
//! - `bundle`   — peer bundle parsing and fingerprints
//! - `trust`    — TOFU trust store + SAS derivation
//! - `session`  — per-peer double-ratchet state
//! - `engine`   — the facade the application drives
//! - `keystore` — optional OS-keystore wrapping of on-disk secrets
//! - `error`    — unified error type with stable message strings

pub mod bundle;
pub mod engine;
pub mod error;
pub mod identity;
pub mod keystore;
pub mod session;
pub mod trust;

pub use bundle::PeerBundle;
pub use engine::{Engine, PeerIdentity, PrivateMessage};
pub use error::EngineError;
pub use identity::IdentityPolicy;
pub use keystore::KeyStore;
pub use trust::PendingPeerTrust;
