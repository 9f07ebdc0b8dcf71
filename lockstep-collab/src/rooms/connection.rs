use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::Stream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use lockstep_core::{Config, DriftMonitor, Id};

use crate::{CollabContext, ParticipantId, ParticipantRegistry, ServerMessage};

use super::RoomId;

pub type RoomConnectionId = Id<RoomConnection>;

/// Represents a participant's live presence in a room.
#[derive(Clone)]
pub struct RoomConnection {
    pub id: RoomConnectionId,
    pub participant_id: ParticipantId,
    /// Tracks how far this participant's reports stray from the anchor
    pub monitor: Arc<DriftMonitor>,
    /// The outbound queue, drained by the connection's handle
    sender: UnboundedSender<ServerMessage>,
}

/// A handle to a room connection, which streams the messages the room sends
/// and removes the [RoomConnection] from the room when dropped.
pub struct RoomConnectionHandle<R>
where
    R: ParticipantRegistry,
{
    connection_id: RoomConnectionId,
    room_id: RoomId,
    context: CollabContext<R>,
    /// The messages broadcast or addressed to this connection
    messages: UnboundedReceiver<ServerMessage>,
}

impl RoomConnection {
    pub fn new(
        participant_id: ParticipantId,
        sender: UnboundedSender<ServerMessage>,
        config: &Config,
    ) -> Self {
        Self {
            id: RoomConnectionId::new(),
            participant_id,
            monitor: Arc::new(DriftMonitor::new(config)),
            sender,
        }
    }

    /// Queues a message for the participant. A failed send means the handle
    /// is already gone, and the disconnect cleanup will follow shortly.
    pub fn send(&self, message: ServerMessage) {
        self.sender.send(message).ok();
    }
}

impl<R> RoomConnectionHandle<R>
where
    R: ParticipantRegistry,
{
    pub fn new(
        context: &CollabContext<R>,
        connection_id: RoomConnectionId,
        room_id: RoomId,
        messages: UnboundedReceiver<ServerMessage>,
    ) -> Self {
        Self {
            connection_id,
            room_id,
            context: context.clone(),
            messages,
        }
    }

    /// The id the embedding application dispatches inbound messages with.
    pub fn connection_id(&self) -> RoomConnectionId {
        self.connection_id
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }
}

impl<R> Drop for RoomConnectionHandle<R>
where
    R: ParticipantRegistry,
{
    fn drop(&mut self) {
        if let Some(room) = self.context.rooms.get(&self.room_id) {
            room.remove_connection(self.connection_id)
        }
    }
}

impl<R> Stream for RoomConnectionHandle<R>
where
    R: ParticipantRegistry,
{
    type Item = ServerMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().messages.poll_recv(cx)
    }
}
