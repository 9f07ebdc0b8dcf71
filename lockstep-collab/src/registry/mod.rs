use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod memory;
pub use memory::*;

use crate::RoomId;

/// The type used by the embedding application to identify participants.
pub type ParticipantId = u64;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// An unknown or internal error happened in the registry's backing store
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
    /// A resource in the registry doesn't exist
    #[error("{resource} {identifier} doesn't exist")]
    NotFound {
        resource: &'static str,
        identifier: String,
    },
}

/// A participant as known by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantData {
    pub id: ParticipantId,
    pub display_name: String,
}

/// Represents a type that can answer who is in a room right now.
///
/// Accounts, authentication, and room membership management live in the
/// embedding application. The collab system only ever asks.
#[async_trait]
pub trait ParticipantRegistry: Send + Sync + 'static {
    /// How many participants are currently active in the room.
    async fn active_participant_count(&self, room_id: RoomId) -> Result<usize, RegistryError>;

    /// Whether the participant is currently active in the room.
    async fn is_participant(
        &self,
        room_id: RoomId,
        participant_id: ParticipantId,
    ) -> Result<bool, RegistryError>;

    /// Fetches a single participant of a room.
    async fn participant(
        &self,
        room_id: RoomId,
        participant_id: ParticipantId,
    ) -> Result<ParticipantData, RegistryError>;
}
