//! X25519 scalar multiplication over raw 32-byte keys.
//!
//! The ratchet state stores secrets as plain arrays (they are wiped by the
//! owning types), so these wrappers convert at the call boundary.

use x25519_dalek::{PublicKey, StaticSecret};

pub const KEY_BYTES: usize = 32;

/// Derive the public key for a secret scalar.
pub fn x25519_public(sk: &[u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(*sk);
    PublicKey::from(&secret).to_bytes()
}

/// X25519(sk, pk) shared secret.
pub fn x25519_shared(sk: &[u8; 32], pk: &[u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(*sk);
    let shared = secret.diffie_hellman(&PublicKey::from(*pk));
    *shared.as_bytes()
}
