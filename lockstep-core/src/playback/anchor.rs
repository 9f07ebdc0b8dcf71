use serde::{Deserialize, Serialize};

use crate::CommandKind;

/// The authoritative playback state of a room.
///
/// An anchor pins a media position to a reference-clock instant, so any
/// participant can derive where the media should be at any later reference
/// time without continuous updates. The coordinator holds the single
/// authoritative copy, participants hold mirrored copies updated by commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackAnchor {
    pub room_id: u64,
    /// Identifies the media being synchronized, opaque to the engine
    pub source_id: String,
    pub is_playing: bool,
    /// Always positive. Validated when commands are issued.
    pub playback_rate: f64,
    /// The reference instant the anchor was pinned at
    pub anchor_reference_time_ms: i64,
    /// The media position at that instant
    pub anchor_media_time_ms: f64,
    /// Strictly increases on every mutation
    pub sequence_number: u64,
}

impl PlaybackAnchor {
    /// Returns the anchor for a newly set source, paused at the start.
    pub fn initial(room_id: u64, source_id: String, reference_time_ms: i64) -> Self {
        Self {
            room_id,
            source_id,
            is_playing: false,
            playback_rate: 1.,
            anchor_reference_time_ms: reference_time_ms,
            anchor_media_time_ms: 0.,
            sequence_number: 0,
        }
    }

    /// Derives the position the media should be at, at the given reference time.
    ///
    /// The result is not clamped to the media duration, and a reference time
    /// before the anchor extrapolates backwards. Clamping is the caller's
    /// concern.
    pub fn expected_media_time_ms(&self, reference_time_ms: i64) -> f64 {
        if !self.is_playing {
            return self.anchor_media_time_ms;
        }

        let elapsed_ms = (reference_time_ms - self.anchor_reference_time_ms) as f64;

        self.anchor_media_time_ms + elapsed_ms * self.playback_rate
    }

    /// Returns the anchor as it becomes once a command takes effect at the
    /// given reference time.
    ///
    /// Every transition re-pins the anchor at the position derived from the
    /// old anchor, so a rate change or pause never jumps the position. Both
    /// the authoritative side and the participant mirrors go through this,
    /// which keeps their anchors identical.
    pub fn with_command(
        &self,
        kind: &CommandKind,
        at_reference_time_ms: i64,
        sequence_number: u64,
    ) -> Self {
        let derived_ms = self.expected_media_time_ms(at_reference_time_ms);

        let mut next = Self {
            anchor_reference_time_ms: at_reference_time_ms,
            anchor_media_time_ms: derived_ms,
            sequence_number,
            ..self.clone()
        };

        match kind {
            CommandKind::Play => next.is_playing = true,
            CommandKind::Pause => next.is_playing = false,
            CommandKind::Seek {
                target_media_time_ms,
            } => next.anchor_media_time_ms = *target_media_time_ms,
            CommandKind::SetRate { rate } => next.playback_rate = *rate,
        }

        next
    }
}
