//! mi_crypto — MI Messenger cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Fixed-size byte arrays at the API boundary; wire formats own their
//!   own framing.
//!
//! # Module layout
//! - `hash`  — SHA-256 / HMAC-SHA-256, constant-time compare
//! - `kdf`   — HKDF-SHA-256 expansion
//! - `aead`  — XChaCha20-Poly1305 with detached tag and caller nonce
//! - `dh`    — X25519 scalar multiplication
//! - `kem`   — ML-KEM-768 encapsulation (post-quantum secrecy)
//! - `sign`  — ML-DSA-65 detached signatures (post-quantum identity)
//! - `rng`   — OS random source
//! - `error` — unified error type

pub mod aead;
pub mod dh;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod kem;
pub mod rng;
pub mod sign;

pub use error::CryptoError;
