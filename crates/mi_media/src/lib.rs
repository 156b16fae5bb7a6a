//! mi_media — forward-secure ratchets for real-time call media
//!
//! Audio and video frames are protected by simple symmetric hash ratchets:
//! one chain per stream direction, advanced per packet, with a bounded
//! window of retained skipped keys so reordered packets still decrypt and
//! anything older is gone for good. Group calls add a key epoch
//! (`key_id`): every rekey swaps in fresh chains, and receivers keep one
//! ratchet pair per `(sender, key_id)` so stragglers from the previous
//! epoch drain cleanly.
//!
//! - `frame`     — plaintext frame codec (what the codecs hand us)
//! - `packet`    — encrypted packet wire format (v3 + legacy v2)
//! - `ratchet`   — per-stream chain-key ratchet
//! - `jitter`    — timestamp-ordered playout buffer
//! - `transport` — relay/key collaborator interface
//! - `session`   — 1:1 call session
//! - `group`     — group call session + adapter

pub mod error;
pub mod frame;
pub mod group;
pub mod jitter;
pub mod packet;
pub mod ratchet;
pub mod session;
pub mod transport;

pub use error::MediaError;
pub use frame::{MediaFrame, StreamKind, FRAME_FLAG_END, FRAME_FLAG_KEY};
pub use group::{GroupCallMediaAdapter, GroupCallSession, GroupCallSessionConfig, GroupMediaFrame};
pub use jitter::{MediaJitterBuffer, MediaJitterStats};
pub use packet::MediaPacket;
pub use ratchet::{derive_stream_chain_keys, MediaKeyPair, MediaRatchet};
pub use session::{MediaSession, MediaSessionApi, MediaSessionConfig, MediaSessionStats};
pub use transport::{CallId, MediaRelayPacket, MediaTransport};
