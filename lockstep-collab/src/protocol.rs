use serde::{Deserialize, Serialize};

use lockstep_core::SyncCommand;

use crate::{Ballot, PlaybackVote, VoteId, VoteKind};

/// What a participant sends to the room coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A clock-sync ping. The coordinator echoes the send time back along
    /// with its own reading, so the participant can measure offset and rtt.
    TimePing { client_send_time_ms: i64 },
    /// A periodic self-report of where the player actually is.
    PositionReport {
        reported_media_time_ms: f64,
        is_playing: bool,
    },
    /// Opens a collective vote on a playback action.
    VoteInitiate { kind: VoteKind },
    /// Casts or changes a ballot on the open vote.
    VoteCast { vote_id: VoteId, choice: Ballot },
}

/// What the room coordinator sends to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The reply to a [ClientMessage::TimePing].
    TimePong {
        client_send_time_ms: i64,
        reference_time_ms: i64,
    },
    /// A playback command every participant applies at the same reference
    /// instant. Also used to reconcile joining participants with a snapshot.
    Command { command: SyncCommand },
    VoteStarted { vote: PlaybackVote },
    VoteUpdated { vote: PlaybackVote },
    VoteResolved { vote: PlaybackVote },
}

impl ClientMessage {
    /// Encodes the message for the wire.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decodes a message received from the wire.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

impl ServerMessage {
    /// Encodes the message for the wire.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decodes a message received from the wire.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}
