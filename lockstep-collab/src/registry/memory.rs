use async_trait::async_trait;
use dashmap::DashMap;

use super::{ParticipantData, ParticipantId, ParticipantRegistry, RegistryError};
use crate::RoomId;

/// A registry keeping room membership in memory. Used in tests and by
/// embeddings that have no external participant store.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    rooms: DashMap<RoomId, Vec<ParticipantData>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a participant as active in a room, replacing any previous entry.
    pub fn join(&self, room_id: RoomId, participant: ParticipantData) {
        let mut room = self.rooms.entry(room_id).or_default();

        room.retain(|existing| existing.id != participant.id);
        room.push(participant);
    }

    /// Removes a participant from a room.
    pub fn leave(&self, room_id: RoomId, participant_id: ParticipantId) {
        if let Some(mut room) = self.rooms.get_mut(&room_id) {
            room.retain(|existing| existing.id != participant_id);
        }
    }
}

#[async_trait]
impl ParticipantRegistry for MemoryRegistry {
    async fn active_participant_count(&self, room_id: RoomId) -> Result<usize, RegistryError> {
        Ok(self
            .rooms
            .get(&room_id)
            .map(|room| room.len())
            .unwrap_or_default())
    }

    async fn is_participant(
        &self,
        room_id: RoomId,
        participant_id: ParticipantId,
    ) -> Result<bool, RegistryError> {
        Ok(self
            .rooms
            .get(&room_id)
            .is_some_and(|room| room.iter().any(|existing| existing.id == participant_id)))
    }

    async fn participant(
        &self,
        room_id: RoomId,
        participant_id: ParticipantId,
    ) -> Result<ParticipantData, RegistryError> {
        self.rooms
            .get(&room_id)
            .and_then(|room| {
                room.iter()
                    .find(|existing| existing.id == participant_id)
                    .cloned()
            })
            .ok_or(RegistryError::NotFound {
                resource: "participant",
                identifier: participant_id.to_string(),
            })
    }
}
