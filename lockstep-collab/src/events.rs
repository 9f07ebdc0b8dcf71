use crossbeam::channel::{Receiver, Sender};
use lockstep_core::{DriftSample, SyncCommand};

use crate::{ParticipantId, PlaybackVote, RoomId};

pub type EventSender = Sender<CollabEvent>;
pub type EventReceiver = Receiver<CollabEvent>;

/// Events emitted by the collab system.
#[derive(Debug, Clone)]
pub enum CollabEvent {
    /// A command was issued and broadcast to a room's participants.
    CommandBroadcast {
        room_id: RoomId,
        command: SyncCommand,
    },
    /// A room was activated with a new media source.
    SourceChanged { room_id: RoomId, source_id: String },
    /// A vote was opened.
    VoteStarted { room_id: RoomId, vote: PlaybackVote },
    /// A ballot was cast without resolving the vote.
    VoteUpdated { room_id: RoomId, vote: PlaybackVote },
    /// A vote passed or failed.
    VoteResolved { room_id: RoomId, vote: PlaybackVote },
    /// A participant reported its position and the room measured the drift.
    ParticipantDrift {
        room_id: RoomId,
        participant_id: ParticipantId,
        /// Whether the participant said it was playing when it reported
        is_playing: bool,
        sample: DriftSample,
    },
    /// A participant connected to a room.
    ParticipantConnected {
        room_id: RoomId,
        participant_id: ParticipantId,
    },
    /// A participant disconnected from a room.
    ParticipantDisconnected {
        room_id: RoomId,
        participant_id: ParticipantId,
    },
}
