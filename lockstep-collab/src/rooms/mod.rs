use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::time::sleep;

use lockstep_core::{get_or_create_handle, CommandError};

use crate::{CollabContext, ParticipantRegistry, RegistryError};

mod connection;
mod room;
mod votes;

pub use connection::*;
pub use room::*;
pub use votes::*;

/// How often rooms are checked for expired votes
const VOTE_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Creates and keeps track of the rooms being coordinated.
pub struct RoomManager<R> {
    context: CollabContext<R>,
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Room {0} already exists")]
    AlreadyExists(RoomId),
    #[error("Room is not active")]
    NotActive,
    #[error("Participant is not a member of this room")]
    NotInRoom,
    #[error("Connection is not registered with this room")]
    NotConnected,
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Vote(#[from] VoteError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl<R> RoomManager<R>
where
    R: ParticipantRegistry,
{
    pub fn new(context: &CollabContext<R>) -> Self {
        spawn_vote_sweep_task(context);

        Self {
            context: context.clone(),
        }
    }

    /// Starts coordinating a room. Ids come from the embedding application,
    /// which owns the room records themselves.
    pub fn create_room(&self, room_id: RoomId) -> Result<Arc<Room<R>>, RoomError> {
        match self.context.rooms.entry(room_id) {
            Entry::Occupied(_) => Err(RoomError::AlreadyExists(room_id)),
            Entry::Vacant(entry) => {
                let room = Arc::new(Room::new(&self.context, room_id));
                entry.insert(room.clone());

                Ok(room)
            }
        }
    }

    pub fn room(&self, room_id: RoomId) -> Option<Arc<Room<R>>> {
        self.context.rooms.get(&room_id).map(|room| room.clone())
    }

    pub fn list_all(&self) -> Vec<Arc<Room<R>>> {
        self.context.rooms.iter().map(|room| room.clone()).collect()
    }

    /// Stops coordinating a room, dropping its anchor, connections, and vote
    /// history.
    pub fn remove_room(&self, room_id: RoomId) {
        self.context.rooms.remove(&room_id);
    }
}

/// Resolves expired votes in every room, so a vote nobody casts the deciding
/// ballot on still fails on time. Ends when the room store is dropped.
fn spawn_vote_sweep_task<R>(context: &CollabContext<R>)
where
    R: ParticipantRegistry,
{
    let weak = Arc::downgrade(&context.rooms);

    get_or_create_handle().spawn(async move {
        loop {
            sleep(VOTE_SWEEP_INTERVAL).await;

            let Some(rooms) = weak.upgrade() else {
                break;
            };

            for room in rooms.iter() {
                room.sweep_votes();
            }
        }
    });
}
