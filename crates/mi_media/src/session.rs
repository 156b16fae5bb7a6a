//! 1:1 call media session.
//!
//! Owns the send/receive ratchets for both streams plus a jitter buffer
//! per stream. The media root comes from the transport (it is derived
//! from the per-peer E2EE session), and the `initiator` flag decides
//! which half of the stream-key expansion is ours to send with.

use std::sync::Arc;

use tracing::debug;

use crate::error::MediaError;
use crate::frame::{MediaFrame, StreamKind};
use crate::jitter::{MediaJitterBuffer, MediaJitterStats};
use crate::packet::peek_media_packet_header;
use crate::ratchet::{derive_stream_chain_keys, MediaRatchet};
use crate::transport::{CallId, MediaTransport};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MediaStreamStats {
    pub frames_sent: u64,
    pub frames_recv: u64,
    pub frames_drop: u64,
    pub decrypt_fail: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MediaSessionStats {
    pub audio: MediaStreamStats,
    pub video: MediaStreamStats,
}

impl MediaSessionStats {
    fn for_kind(&mut self, kind: StreamKind) -> &mut MediaStreamStats {
        match kind {
            StreamKind::Audio => &mut self.audio,
            StreamKind::Video => &mut self.video,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaSessionConfig {
    pub peer_username: String,
    pub call_id: CallId,
    pub initiator: bool,
    pub enable_audio: bool,
    pub enable_video: bool,
    pub audio_delay_ms: u64,
    pub video_delay_ms: u64,
    pub audio_max_frames: usize,
    pub video_max_frames: usize,
}

impl Default for MediaSessionConfig {
    fn default() -> Self {
        Self {
            peer_username: String::new(),
            call_id: [0; 16],
            initiator: false,
            enable_audio: true,
            enable_video: true,
            audio_delay_ms: 60,
            video_delay_ms: 120,
            audio_max_frames: 256,
            video_max_frames: 256,
        }
    }
}

/// Capability surface shared by 1:1 sessions and the group-call adapter,
/// so call UIs drive either through one interface.
pub trait MediaSessionApi {
    fn send_audio_frame(
        &mut self,
        payload: &[u8],
        timestamp_ms: u64,
        flags: u8,
    ) -> Result<(), MediaError>;
    fn send_video_frame(
        &mut self,
        payload: &[u8],
        timestamp_ms: u64,
        flags: u8,
    ) -> Result<(), MediaError>;
    fn pop_audio_frame(&mut self, now_ms: u64) -> Option<MediaFrame>;
    fn pop_video_frame(&mut self, now_ms: u64) -> Option<MediaFrame>;
    fn stats(&self) -> MediaSessionStats;
    fn audio_jitter_stats(&self) -> MediaJitterStats;
    fn video_jitter_stats(&self) -> MediaJitterStats;
}

struct StreamState {
    send: MediaRatchet,
    recv: MediaRatchet,
    jitter: MediaJitterBuffer,
}

pub struct MediaSession {
    transport: Arc<dyn MediaTransport>,
    config: MediaSessionConfig,
    audio: Option<StreamState>,
    video: Option<StreamState>,
    stats: MediaSessionStats,
    ready: bool,
}

impl MediaSession {
    pub fn new(transport: Arc<dyn MediaTransport>, config: MediaSessionConfig) -> Self {
        Self {
            transport,
            config,
            audio: None,
            video: None,
            stats: MediaSessionStats::default(),
            ready: false,
        }
    }

    pub fn config(&self) -> &MediaSessionConfig {
        &self.config
    }

    /// Fetch the media root and derive per-stream chain keys.
    pub fn init(&mut self) -> Result<(), MediaError> {
        self.ready = false;
        if self.config.peer_username.is_empty() {
            return Err(MediaError::PeerEmpty);
        }
        let media_root = self
            .transport
            .derive_media_root(&self.config.peer_username, &self.config.call_id)?;

        if self.config.enable_audio {
            self.audio = Some(Self::stream_state(
                &media_root,
                StreamKind::Audio,
                self.config.initiator,
                self.config.audio_delay_ms,
                self.config.audio_max_frames,
            )?);
        }
        if self.config.enable_video {
            self.video = Some(Self::stream_state(
                &media_root,
                StreamKind::Video,
                self.config.initiator,
                self.config.video_delay_ms,
                self.config.video_max_frames,
            )?);
        }
        self.ready = true;
        debug!(peer = %self.config.peer_username, "media session ready");
        Ok(())
    }

    fn stream_state(
        media_root: &[u8; 32],
        kind: StreamKind,
        initiator: bool,
        delay_ms: u64,
        max_frames: usize,
    ) -> Result<StreamState, MediaError> {
        let keys = derive_stream_chain_keys(media_root, kind, initiator)?;
        Ok(StreamState {
            send: MediaRatchet::new(keys.send_ck, kind, 0, 1),
            recv: MediaRatchet::new(keys.recv_ck, kind, 0, 1),
            jitter: MediaJitterBuffer::new(delay_ms, max_frames),
        })
    }

    fn stream_mut(&mut self, kind: StreamKind) -> Option<&mut StreamState> {
        match kind {
            StreamKind::Audio => self.audio.as_mut(),
            StreamKind::Video => self.video.as_mut(),
        }
    }

    fn send_frame(
        &mut self,
        kind: StreamKind,
        payload: &[u8],
        timestamp_ms: u64,
        flags: u8,
    ) -> Result<(), MediaError> {
        if !self.ready {
            return Err(MediaError::NotReady);
        }
        if payload.is_empty() {
            return Err(MediaError::PayloadEmpty);
        }
        let frame = MediaFrame {
            call_id: self.config.call_id,
            kind,
            flags,
            timestamp_ms,
            payload: payload.to_vec(),
        };
        let stream = self.stream_mut(kind).ok_or(MediaError::NotReady)?;
        let packet = stream.send.encrypt_frame(&frame)?;
        self.transport
            .push_media(&self.config.peer_username, &self.config.call_id, &packet)?;
        self.stats.for_kind(kind).frames_sent += 1;
        Ok(())
    }

    fn handle_incoming_packet(
        &mut self,
        sender: &str,
        packet: &[u8],
        now_ms: u64,
    ) -> Result<(), MediaError> {
        if !self.ready {
            return Err(MediaError::NotReady);
        }
        if sender != self.config.peer_username {
            // Not ours; the relay fan-out can carry other calls.
            return Ok(());
        }
        let (kind, _key_id, _seq) = peek_media_packet_header(packet)?;
        let call_id = self.config.call_id;
        let Some(stream) = self.stream_mut(kind) else {
            self.stats.for_kind(kind).frames_drop += 1;
            return Ok(());
        };
        let frame = match stream.recv.decrypt_frame(packet) {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.for_kind(kind).decrypt_fail += 1;
                return Err(err);
            }
        };
        if frame.call_id != call_id {
            self.stats.for_kind(kind).frames_drop += 1;
            return Ok(());
        }
        stream.jitter.push(frame, now_ms);
        self.stats.for_kind(kind).frames_recv += 1;
        Ok(())
    }

    /// Drain up to `max_packets` from the relay into the jitter buffers.
    /// Per-packet failures don't stop the drain; the first one is
    /// reported after the batch.
    pub fn poll_incoming(
        &mut self,
        max_packets: u32,
        wait_ms: u32,
        now_ms: u64,
    ) -> Result<(), MediaError> {
        if !self.ready {
            return Err(MediaError::NotReady);
        }
        let packets = self
            .transport
            .pull_media(&self.config.call_id, max_packets, wait_ms)?;
        let mut first_err = None;
        for entry in &packets {
            if let Err(err) = self.handle_incoming_packet(&entry.sender, &entry.payload, now_ms) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl MediaSessionApi for MediaSession {
    fn send_audio_frame(
        &mut self,
        payload: &[u8],
        timestamp_ms: u64,
        flags: u8,
    ) -> Result<(), MediaError> {
        self.send_frame(StreamKind::Audio, payload, timestamp_ms, flags)
    }

    fn send_video_frame(
        &mut self,
        payload: &[u8],
        timestamp_ms: u64,
        flags: u8,
    ) -> Result<(), MediaError> {
        self.send_frame(StreamKind::Video, payload, timestamp_ms, flags)
    }

    fn pop_audio_frame(&mut self, now_ms: u64) -> Option<MediaFrame> {
        self.audio.as_mut()?.jitter.pop_ready(now_ms)
    }

    fn pop_video_frame(&mut self, now_ms: u64) -> Option<MediaFrame> {
        self.video.as_mut()?.jitter.pop_ready(now_ms)
    }

    fn stats(&self) -> MediaSessionStats {
        self.stats
    }

    fn audio_jitter_stats(&self) -> MediaJitterStats {
        self.audio
            .as_ref()
            .map(|s| s.jitter.stats())
            .unwrap_or_default()
    }

    fn video_jitter_stats(&self) -> MediaJitterStats {
        self.video
            .as_ref()
            .map(|s| s.jitter.stats())
            .unwrap_or_default()
    }
}
