//! Collaborator interface to the media relay and call-key service.
//!
//! The core never talks to the network itself: packets go out and come
//! back through this trait, and call secrets (the 1:1 media root derived
//! from the E2EE session, the per-epoch group call key) are fetched
//! through it as well. Implementations are expected to be shared across
//! threads and to enforce `wait_ms` themselves; a zero wait polls once.

use crate::error::MediaError;

pub type CallId = [u8; 16];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRelayPacket {
    pub sender: String,
    pub payload: Vec<u8>,
}

pub trait MediaTransport: Send + Sync {
    /// 32-byte media root for a 1:1 call, derived from the peer's E2EE
    /// session secret.
    fn derive_media_root(&self, peer_username: &str, call_id: &CallId)
        -> Result<[u8; 32], MediaError>;

    fn push_media(
        &self,
        peer_username: &str,
        call_id: &CallId,
        packet: &[u8],
    ) -> Result<(), MediaError>;

    fn pull_media(
        &self,
        call_id: &CallId,
        max_packets: u32,
        wait_ms: u32,
    ) -> Result<Vec<MediaRelayPacket>, MediaError>;

    fn push_group_media(
        &self,
        group_id: &str,
        call_id: &CallId,
        packet: &[u8],
    ) -> Result<(), MediaError>;

    fn pull_group_media(
        &self,
        call_id: &CallId,
        max_packets: u32,
        wait_ms: u32,
    ) -> Result<Vec<MediaRelayPacket>, MediaError>;

    /// Group call key for one key epoch; rotated on membership change.
    fn get_group_call_key(
        &self,
        group_id: &str,
        call_id: &CallId,
        key_id: u32,
    ) -> Result<[u8; 32], MediaError>;
}
