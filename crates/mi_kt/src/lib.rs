//! mi_kt — append-only Merkle key-transparency log
//!
//! A tamper-evident log of `(username, identity keys)` leaves in the
//! RFC 6962 tree shape. Clients audit that the directory never rewrote a
//! binding: the latest leaf for a username is proven into a signed tree
//! head, and consistency proofs show each new head extends the old one.
//!
//! - `merkle` — leaf/node hashing, tree hash, audit + consistency proofs
//!   and their verifiers
//! - `log`    — the persistent log (`MIKTLOG1` file) and proof queries
//! - `error`  — unified error type

pub mod error;
pub mod log;
pub mod merkle;

pub use error::KtError;
pub use log::{sth_signing_bytes, KeyTransparencyLog, KtProof, KtSth};
pub use merkle::{verify_audit_path, verify_consistency, Hash32};
