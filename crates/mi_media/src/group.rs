//! Group call media session.
//!
//! Every member sends under the group call key of the active key epoch
//! (`key_id`). All senders derive their chains with the initiator half,
//! so a receiver seeds its per-sender ratchet with the *send* chain key of
//! the same derivation. Receive state is keyed by `(sender, key_id)` and
//! built on demand: a rekey makes new packets arrive under the next
//! `key_id`, and the old per-sender state survives until that sender's
//! first new-epoch packet replaces it, so stragglers still decrypt.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::MediaError;
use crate::frame::{MediaFrame, StreamKind};
use crate::jitter::{MediaJitterBuffer, MediaJitterStats};
use crate::packet::peek_media_packet_header;
use crate::ratchet::{derive_stream_chain_keys, MediaRatchet};
use crate::session::{MediaSessionApi, MediaSessionStats};
use crate::transport::{CallId, MediaTransport};

#[derive(Debug, Clone)]
pub struct GroupCallSessionConfig {
    pub group_id: String,
    pub call_id: CallId,
    pub key_id: u32,
    pub enable_audio: bool,
    pub enable_video: bool,
    pub audio_delay_ms: u64,
    pub video_delay_ms: u64,
    pub audio_max_frames: usize,
    pub video_max_frames: usize,
}

impl Default for GroupCallSessionConfig {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            call_id: [0; 16],
            key_id: 1,
            enable_audio: true,
            enable_video: true,
            audio_delay_ms: 60,
            video_delay_ms: 120,
            audio_max_frames: 256,
            video_max_frames: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMediaFrame {
    pub sender: String,
    pub frame: MediaFrame,
}

struct SenderState {
    key_id: u32,
    audio_recv: Option<MediaRatchet>,
    video_recv: Option<MediaRatchet>,
    audio_jitter: MediaJitterBuffer,
    video_jitter: MediaJitterBuffer,
}

/// Sender-side chain for one stream under one key epoch. Group receive
/// chains are seeded with the same (send) half — see module docs.
fn ratchet_for_key(
    call_key: &[u8; 32],
    key_id: u32,
    kind: StreamKind,
) -> Result<MediaRatchet, MediaError> {
    let keys = derive_stream_chain_keys(call_key, kind, true)?;
    Ok(MediaRatchet::new(keys.send_ck, kind, 0, key_id))
}

pub struct GroupCallSession {
    transport: Arc<dyn MediaTransport>,
    config: GroupCallSessionConfig,
    active_key_id: u32,
    audio_send: Option<MediaRatchet>,
    video_send: Option<MediaRatchet>,
    senders: HashMap<String, SenderState>,
    ready: bool,
}

impl GroupCallSession {
    pub fn new(transport: Arc<dyn MediaTransport>, config: GroupCallSessionConfig) -> Self {
        Self {
            transport,
            config,
            active_key_id: 0,
            audio_send: None,
            video_send: None,
            senders: HashMap::new(),
            ready: false,
        }
    }

    pub fn config(&self) -> &GroupCallSessionConfig {
        &self.config
    }

    pub fn active_key_id(&self) -> u32 {
        self.active_key_id
    }

    pub fn init(&mut self) -> Result<(), MediaError> {
        self.ready = false;
        if self.config.group_id.is_empty() {
            return Err(MediaError::GroupEmpty);
        }
        if self.config.call_id == [0u8; 16] {
            return Err(MediaError::CallIdEmpty);
        }
        let key_id = self.config.key_id;
        self.set_active_key(key_id)?;
        self.ready = true;
        Ok(())
    }

    /// Switch the send side to a new key epoch (member joined/left and the
    /// call key rotated). Send ratchets restart at sequence zero.
    pub fn set_active_key(&mut self, key_id: u32) -> Result<(), MediaError> {
        if key_id == 0 {
            return Err(MediaError::KeyIdInvalid);
        }
        let call_key = self
            .transport
            .get_group_call_key(&self.config.group_id, &self.config.call_id, key_id)?;

        if self.config.enable_audio {
            self.audio_send = Some(ratchet_for_key(&call_key, key_id, StreamKind::Audio)?);
        }
        if self.config.enable_video {
            self.video_send = Some(ratchet_for_key(&call_key, key_id, StreamKind::Video)?);
        }
        self.active_key_id = key_id;
        debug!(group = %self.config.group_id, key_id, "group call key epoch active");
        Ok(())
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
        let ratchet = match kind {
            StreamKind::Audio => self.audio_send.as_mut(),
            StreamKind::Video => self.video_send.as_mut(),
        }
        .ok_or(MediaError::NotReady)?;
        let packet = ratchet.encrypt_frame(&frame)?;
        self.transport
            .push_group_media(&self.config.group_id, &self.config.call_id, &packet)
    }

    pub fn send_audio_frame(
        &mut self,
        payload: &[u8],
        timestamp_ms: u64,
        flags: u8,
    ) -> Result<(), MediaError> {
        self.send_frame(StreamKind::Audio, payload, timestamp_ms, flags)
    }

    pub fn send_video_frame(
        &mut self,
        payload: &[u8],
        timestamp_ms: u64,
        flags: u8,
    ) -> Result<(), MediaError> {
        self.send_frame(StreamKind::Video, payload, timestamp_ms, flags)
    }

    /// Receive state for `(sender, key_id)`; a packet under a different
    /// epoch than the sender's current state replaces that state.
    fn ensure_sender_state(
        &mut self,
        sender: &str,
        key_id: u32,
    ) -> Result<&mut SenderState, MediaError> {
        let needs_build = match self.senders.get(sender) {
            Some(state) => state.key_id != key_id,
            None => true,
        };
        if needs_build {
            let call_key = self.transport.get_group_call_key(
                &self.config.group_id,
                &self.config.call_id,
                key_id,
            )?;
            let audio_recv = if self.config.enable_audio {
                Some(ratchet_for_key(&call_key, key_id, StreamKind::Audio)?)
            } else {
                None
            };
            let video_recv = if self.config.enable_video {
                Some(ratchet_for_key(&call_key, key_id, StreamKind::Video)?)
            } else {
                None
            };
            self.senders.insert(
                sender.to_string(),
                SenderState {
                    key_id,
                    audio_recv,
                    video_recv,
                    audio_jitter: MediaJitterBuffer::new(
                        self.config.audio_delay_ms,
                        self.config.audio_max_frames,
                    ),
                    video_jitter: MediaJitterBuffer::new(
                        self.config.video_delay_ms,
                        self.config.video_max_frames,
                    ),
                },
            );
        }
        Ok(self
            .senders
            .get_mut(sender)
            .expect("sender state inserted above"))
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
        let (kind, key_id, _seq) = peek_media_packet_header(packet)?;
        let call_id = self.config.call_id;
        let state = self.ensure_sender_state(sender, key_id)?;
        let (ratchet, jitter) = match kind {
            StreamKind::Audio => (state.audio_recv.as_mut(), &mut state.audio_jitter),
            StreamKind::Video => (state.video_recv.as_mut(), &mut state.video_jitter),
        };
        let Some(ratchet) = ratchet else {
            return Ok(());
        };
        let frame = ratchet.decrypt_frame(packet)?;
        if frame.call_id != call_id {
            return Ok(());
        }
        jitter.push(frame, now_ms);
        Ok(())
    }

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
            .pull_group_media(&self.config.call_id, max_packets, wait_ms)?;
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

    pub fn pop_audio_frame(&mut self, now_ms: u64) -> Option<GroupMediaFrame> {
        for (sender, state) in self.senders.iter_mut() {
            if let Some(frame) = state.audio_jitter.pop_ready(now_ms) {
                return Some(GroupMediaFrame {
                    sender: sender.clone(),
                    frame,
                });
            }
        }
        None
    }

    pub fn pop_video_frame(&mut self, now_ms: u64) -> Option<GroupMediaFrame> {
        for (sender, state) in self.senders.iter_mut() {
            if let Some(frame) = state.video_jitter.pop_ready(now_ms) {
                return Some(GroupMediaFrame {
                    sender: sender.clone(),
                    frame,
                });
            }
        }
        None
    }

    fn aggregate_jitter_stats(&self, kind: StreamKind) -> MediaJitterStats {
        let mut out = MediaJitterStats::default();
        for state in self.senders.values() {
            let s = match kind {
                StreamKind::Audio => state.audio_jitter.stats(),
                StreamKind::Video => state.video_jitter.stats(),
            };
            out.pushed += s.pushed;
            out.popped += s.popped;
            out.dropped += s.dropped;
            out.late += s.late;
        }
        out
    }
}

/// Adapts a shared [`GroupCallSession`] to the 1:1 [`MediaSessionApi`]
/// surface, so call UIs treat both call types uniformly. The poll loop
/// feeds decoded frames in via [`GroupCallMediaAdapter::push_incoming`];
/// pops drain the adapter's own bounded queues.
pub struct GroupCallMediaAdapter {
    session: Arc<Mutex<GroupCallSession>>,
    audio_queue: VecDeque<MediaFrame>,
    video_queue: VecDeque<MediaFrame>,
    stats: MediaSessionStats,
    max_queue: usize,
}

impl GroupCallMediaAdapter {
    pub fn new(session: Arc<Mutex<GroupCallSession>>) -> Self {
        Self {
            session,
            audio_queue: VecDeque::new(),
            video_queue: VecDeque::new(),
            stats: MediaSessionStats::default(),
            max_queue: 256,
        }
    }

    pub fn push_incoming(&mut self, incoming: GroupMediaFrame) {
        let (queue, stats) = match incoming.frame.kind {
            StreamKind::Audio => (&mut self.audio_queue, &mut self.stats.audio),
            StreamKind::Video => (&mut self.video_queue, &mut self.stats.video),
        };
        queue.push_back(incoming.frame);
        stats.frames_recv += 1;
        while queue.len() > self.max_queue {
            queue.pop_front();
            stats.frames_drop += 1;
        }
    }

    pub fn clear(&mut self) {
        self.audio_queue.clear();
        self.video_queue.clear();
    }
}

impl MediaSessionApi for GroupCallMediaAdapter {
    fn send_audio_frame(
        &mut self,
        payload: &[u8],
        timestamp_ms: u64,
        flags: u8,
    ) -> Result<(), MediaError> {
        self.session
            .lock()
            .send_audio_frame(payload, timestamp_ms, flags)?;
        self.stats.audio.frames_sent += 1;
        Ok(())
    }

    fn send_video_frame(
        &mut self,
        payload: &[u8],
        timestamp_ms: u64,
        flags: u8,
    ) -> Result<(), MediaError> {
        self.session
            .lock()
            .send_video_frame(payload, timestamp_ms, flags)?;
        self.stats.video.frames_sent += 1;
        Ok(())
    }

    fn pop_audio_frame(&mut self, _now_ms: u64) -> Option<MediaFrame> {
        self.audio_queue.pop_front()
    }

    fn pop_video_frame(&mut self, _now_ms: u64) -> Option<MediaFrame> {
        self.video_queue.pop_front()
    }

    fn stats(&self) -> MediaSessionStats {
        self.stats
    }

    fn audio_jitter_stats(&self) -> MediaJitterStats {
        self.session.lock().aggregate_jitter_stats(StreamKind::Audio)
    }

    fn video_jitter_stats(&self) -> MediaJitterStats {
        self.session.lock().aggregate_jitter_stats(StreamKind::Video)
    }
}
