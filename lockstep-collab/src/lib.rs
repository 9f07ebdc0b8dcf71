mod events;
mod protocol;
mod registry;
mod rooms;

use std::sync::Arc;

use crossbeam::channel::unbounded;

pub use events::*;
pub use protocol::*;
pub use registry::*;
pub use rooms::*;

use lockstep_core::{ArcedStore, Config};

/// The lockstep collab system, coordinating shared playback for rooms of
/// participants: commands, clock pings, drift telemetry, and votes.
pub struct Collab<R> {
    context: CollabContext<R>,

    pub rooms: RoomManager<R>,

    event_receiver: EventReceiver,
}

/// A type passed to various components of the collab system, to access
/// state, the participant registry, and emit events.
pub struct CollabContext<R> {
    pub config: Config,
    pub registry: Arc<R>,

    event_sender: EventSender,

    pub rooms: ArcedStore<RoomId, Room<R>>,
}

impl<R> Collab<R>
where
    R: ParticipantRegistry,
{
    pub fn new(config: Config, registry: R) -> Self {
        let (event_sender, event_receiver) = unbounded();

        let context = CollabContext {
            config,
            registry: Arc::new(registry),

            event_sender,

            rooms: Default::default(),
        };

        let room_manager = RoomManager::new(&context);

        Self {
            context,
            rooms: room_manager,
            event_receiver,
        }
    }

    /// The context the system runs on. Useful for constructing connection
    /// handles or inspecting rooms directly.
    pub fn context(&self) -> &CollabContext<R> {
        &self.context
    }

    /// Receive events from the collab system.
    pub fn wait_for_event(&self) -> CollabEvent {
        self.event_receiver
            .recv()
            .expect("event is received without error")
    }
}

impl<R> CollabContext<R> {
    pub fn emit(&self, event: CollabEvent) {
        self.event_sender.send(event).expect("event is sent");
    }
}

impl<R> Clone for CollabContext<R> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            registry: self.registry.clone(),
            event_sender: self.event_sender.clone(),
            rooms: self.rooms.clone(),
        }
    }
}

// Realistically, the context should always be created by the collab system.
// However, in a test, this may not be possible.
#[cfg(test)]
impl CollabContext<MemoryRegistry> {
    pub(crate) fn with_registry(
        config: Config,
        registry: MemoryRegistry,
    ) -> (Self, EventReceiver) {
        let (event_sender, event_receiver) = unbounded();

        let context = Self {
            config,
            registry: Arc::new(registry),
            event_sender,
            rooms: Default::default(),
        };

        (context, event_receiver)
    }
}
