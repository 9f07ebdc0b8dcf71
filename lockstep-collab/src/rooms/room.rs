use std::sync::Arc;

use log::info;
use parking_lot::Mutex;
use tokio::sync::mpsc::unbounded_channel;

use lockstep_core::{local_now_ms, CommandKind, CommandSequencer, PlaybackAnchor, SyncCommand};

use crate::{
    events::CollabEvent, Ballot, ClientMessage, CollabContext, ParticipantId, ParticipantRegistry,
    PlaybackVote, RegistryError, ServerMessage, VoteCoordinator, VoteError, VoteId, VoteKind,
};

use super::{RoomConnection, RoomConnectionHandle, RoomConnectionId, RoomError};

pub type RoomId = u64;

/// A watch-together room, coordinating one shared playback state for its
/// participants.
///
/// The room is the reference clock: its local wall clock is the time base
/// every participant's pings and commands are expressed in. Everything that
/// changes playback flows through the room's sequencer, so participants can
/// never disagree about ordering.
pub struct Room<R> {
    id: RoomId,
    context: CollabContext<R>,
    state: Mutex<RoomState>,
    votes: VoteCoordinator,
    /// The participants currently connected to this room
    connections: Mutex<Vec<RoomConnection>>,
}

/// What the room is coordinating right now.
#[derive(Default)]
pub enum RoomState {
    /// No media source is set, there is nothing to synchronize yet.
    #[default]
    Idle,
    /// A source is set and the room holds the authoritative anchor for it.
    Active { sequencer: Arc<CommandSequencer> },
}

impl<R> Room<R>
where
    R: ParticipantRegistry,
{
    pub fn new(context: &CollabContext<R>, id: RoomId) -> Self {
        Self {
            id,
            context: context.clone(),
            state: Default::default(),
            votes: VoteCoordinator::new(&context.config),
            connections: Default::default(),
        }
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    /// The reference clock every participant of this room synchronizes to.
    pub fn reference_now_ms(&self) -> i64 {
        local_now_ms()
    }

    /// Sets the media source, activating the room with a fresh paused anchor
    /// at position zero. Connected participants are reconciled immediately.
    pub fn set_source(&self, source_id: String) {
        let anchor = PlaybackAnchor::initial(self.id, source_id.clone(), self.reference_now_ms());
        let sequencer = Arc::new(CommandSequencer::new(&self.context.config, anchor));
        let snapshot = sequencer.snapshot();

        *self.state.lock() = RoomState::Active { sequencer };

        info!("Room {} activated with source {}", self.id, source_id);

        self.broadcast(ServerMessage::Command { command: snapshot });
        self.context.emit(CollabEvent::SourceChanged {
            room_id: self.id,
            source_id,
        });
    }

    /// The sequencer holding the authoritative anchor, if the room is active.
    pub fn sequencer(&self) -> Result<Arc<CommandSequencer>, RoomError> {
        match &*self.state.lock() {
            RoomState::Idle => Err(RoomError::NotActive),
            RoomState::Active { sequencer } => Ok(sequencer.clone()),
        }
    }

    /// The authoritative anchor, if the room is active.
    pub fn anchor(&self) -> Option<PlaybackAnchor> {
        self.sequencer().ok().map(|sequencer| sequencer.anchor())
    }

    /// Resumes playback for everyone.
    pub fn play(&self) -> Result<SyncCommand, RoomError> {
        self.issue(CommandKind::Play)
    }

    /// Pauses playback for everyone.
    pub fn pause(&self) -> Result<SyncCommand, RoomError> {
        self.issue(CommandKind::Pause)
    }

    /// Moves everyone to a position.
    pub fn seek(&self, target_media_time_ms: f64) -> Result<SyncCommand, RoomError> {
        self.issue(CommandKind::Seek {
            target_media_time_ms,
        })
    }

    /// Changes everyone's playback rate.
    pub fn set_rate(&self, rate: f64) -> Result<SyncCommand, RoomError> {
        self.issue(CommandKind::SetRate { rate })
    }

    fn issue(&self, kind: CommandKind) -> Result<SyncCommand, RoomError> {
        let sequencer = self.sequencer()?;
        let command = sequencer.issue(kind)?;

        self.broadcast(ServerMessage::Command {
            command: command.clone(),
        });

        self.context.emit(CollabEvent::CommandBroadcast {
            room_id: self.id,
            command: command.clone(),
        });

        Ok(command)
    }

    /// Creates a live connection to the room.
    pub async fn connect(
        &self,
        participant_id: ParticipantId,
    ) -> Result<RoomConnectionHandle<R>, RoomError> {
        // Make sure the participant is actually in the room before anything else
        let participant = self
            .context
            .registry
            .participant(self.id, participant_id)
            .await
            .map_err(|err| match err {
                RegistryError::NotFound { .. } => RoomError::NotInRoom,
                err => RoomError::Registry(err),
            })?;

        let (sender, receiver) = unbounded_channel();

        let connection = RoomConnection::new(participant_id, sender, &self.context.config);
        let connection_id = connection.id;

        let sequencer = self.sequencer().ok();

        {
            // Queueing the snapshot and registering under the same lock keeps
            // a concurrent broadcast from slipping in between the two.
            let mut connections = self.connections.lock();

            if let Some(sequencer) = &sequencer {
                connection.send(ServerMessage::Command {
                    command: sequencer.snapshot(),
                });
            }

            connections.push(connection);
        }

        info!(
            "{} connected to room {}",
            participant.display_name, self.id
        );

        self.context.emit(CollabEvent::ParticipantConnected {
            room_id: self.id,
            participant_id,
        });

        Ok(RoomConnectionHandle::new(
            &self.context,
            connection_id,
            self.id,
            receiver,
        ))
    }

    /// Called when a [RoomConnectionHandle] is dropped.
    pub fn remove_connection(&self, connection_id: RoomConnectionId) {
        let removed = {
            let mut connections = self.connections.lock();

            let index = connections
                .iter()
                .position(|connection| connection.id == connection_id);

            index.map(|index| connections.remove(index))
        };

        if let Some(connection) = removed {
            info!(
                "Participant {} disconnected from room {}",
                connection.participant_id, self.id
            );

            self.context.emit(CollabEvent::ParticipantDisconnected {
                room_id: self.id,
                participant_id: connection.participant_id,
            });
        }
    }

    /// The current connections. The same participant can appear more than
    /// once, from multiple devices.
    pub fn current_connections(&self) -> Vec<RoomConnection> {
        self.connections.lock().clone()
    }

    /// Dispatches a message received from a participant's transport.
    pub async fn handle_message(
        &self,
        connection_id: RoomConnectionId,
        message: ClientMessage,
    ) -> Result<(), RoomError> {
        let connection = self
            .connection(connection_id)
            .ok_or(RoomError::NotConnected)?;

        match message {
            ClientMessage::TimePing {
                client_send_time_ms,
            } => {
                connection.send(ServerMessage::TimePong {
                    client_send_time_ms,
                    reference_time_ms: self.reference_now_ms(),
                });
            }
            ClientMessage::PositionReport {
                reported_media_time_ms,
                is_playing,
            } => {
                self.observe_report(&connection, reported_media_time_ms, is_playing);
            }
            ClientMessage::VoteInitiate { kind } => {
                self.initiate_vote(connection.participant_id, kind).await?;
            }
            ClientMessage::VoteCast { vote_id, choice } => {
                self.cast_vote(vote_id, connection.participant_id, choice)
                    .await?;
            }
        }

        Ok(())
    }

    /// Opens a collective vote on a playback action.
    pub async fn initiate_vote(
        &self,
        initiated_by: ParticipantId,
        kind: VoteKind,
    ) -> Result<PlaybackVote, RoomError> {
        // The approved command needs an anchor to land on.
        self.sequencer()?;

        let count = self
            .context
            .registry
            .active_participant_count(self.id)
            .await
            .map_err(VoteError::Registry)?;

        let vote = self.votes.initiate(self.id, initiated_by, kind, count)?;

        self.broadcast(ServerMessage::VoteStarted { vote: vote.clone() });
        self.context.emit(CollabEvent::VoteStarted {
            room_id: self.id,
            vote: vote.clone(),
        });

        Ok(vote)
    }

    /// Casts a ballot on behalf of a participant. A vote that passes issues
    /// the approved command right away.
    pub async fn cast_vote(
        &self,
        vote_id: VoteId,
        participant_id: ParticipantId,
        choice: Ballot,
    ) -> Result<PlaybackVote, RoomError> {
        let is_member = self
            .context
            .registry
            .is_participant(self.id, participant_id)
            .await
            .map_err(VoteError::Registry)?;

        if !is_member {
            return Err(VoteError::NotAParticipant.into());
        }

        let vote = match self.votes.cast(vote_id, participant_id, choice) {
            Ok(vote) => vote,
            Err(VoteError::Expired) => {
                // The failed cast forced the resolution, let the room know.
                if let Some(expired) = self.votes.resolved_vote(vote_id) {
                    self.publish_resolution(&expired);
                }

                return Err(VoteError::Expired.into());
            }
            Err(err) => return Err(err.into()),
        };

        if vote.resolved {
            self.publish_resolution(&vote);

            if vote.passed {
                self.issue_vote_outcome(&vote)?;
            }
        } else {
            self.broadcast(ServerMessage::VoteUpdated { vote: vote.clone() });
            self.context.emit(CollabEvent::VoteUpdated {
                room_id: self.id,
                vote: vote.clone(),
            });
        }

        Ok(vote)
    }

    /// The vote currently open, if any.
    pub fn open_vote(&self) -> Option<PlaybackVote> {
        self.votes.open_vote()
    }

    /// Resolves an expired vote as failed, if any. Invoked periodically by
    /// the manager, so an abandoned vote still fails on time.
    pub fn sweep_votes(&self) -> usize {
        let resolved = self.votes.sweep_expired();

        for vote in &resolved {
            self.publish_resolution(vote);
        }

        resolved.len()
    }

    /// Feeds a participant's self-report into its drift monitor.
    fn observe_report(
        &self,
        connection: &RoomConnection,
        reported_media_time_ms: f64,
        is_playing: bool,
    ) {
        // Nothing to compare against while the room is idle.
        let Ok(sequencer) = self.sequencer() else {
            return;
        };

        let observation = connection.monitor.observe(
            reported_media_time_ms,
            self.reference_now_ms(),
            &sequencer.anchor(),
        );

        self.context.emit(CollabEvent::ParticipantDrift {
            room_id: self.id,
            participant_id: connection.participant_id,
            is_playing,
            sample: observation.sample,
        });
    }

    fn publish_resolution(&self, vote: &PlaybackVote) {
        info!(
            "Vote {} in room {} resolved, passed: {}",
            vote.id, self.id, vote.passed
        );

        self.broadcast(ServerMessage::VoteResolved { vote: vote.clone() });
        self.context.emit(CollabEvent::VoteResolved {
            room_id: self.id,
            vote: vote.clone(),
        });
    }

    fn issue_vote_outcome(&self, vote: &PlaybackVote) -> Result<(), RoomError> {
        let kind = match vote.kind {
            VoteKind::Pause => CommandKind::Pause,
            VoteKind::Play => CommandKind::Play,
        };

        self.issue(kind).map(|_| ())
    }

    fn broadcast(&self, message: ServerMessage) {
        for connection in self.connections.lock().iter() {
            connection.send(message.clone());
        }
    }

    fn connection(&self, connection_id: RoomConnectionId) -> Option<RoomConnection> {
        self.connections
            .lock()
            .iter()
            .find(|connection| connection.id == connection_id)
            .cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    use futures_util::StreamExt;

    use lockstep_core::{Config, CorrectionKind};

    use crate::{EventReceiver, MemoryRegistry, ParticipantData};

    fn participant(id: ParticipantId) -> ParticipantData {
        ParticipantData {
            id,
            display_name: format!("participant-{}", id),
        }
    }

    fn test_room(
        member_ids: &[ParticipantId],
    ) -> (
        CollabContext<MemoryRegistry>,
        EventReceiver,
        Arc<Room<MemoryRegistry>>,
    ) {
        test_room_with_config(Config::default(), member_ids)
    }

    fn test_room_with_config(
        config: Config,
        member_ids: &[ParticipantId],
    ) -> (
        CollabContext<MemoryRegistry>,
        EventReceiver,
        Arc<Room<MemoryRegistry>>,
    ) {
        let registry = MemoryRegistry::new();

        for &id in member_ids {
            registry.join(1, participant(id));
        }

        let (context, events) = CollabContext::with_registry(config, registry);

        let room = Arc::new(Room::new(&context, 1));
        context.rooms.insert(1, room.clone());

        (context, events, room)
    }

    fn next_matching<F>(events: &EventReceiver, matches: F) -> CollabEvent
    where
        F: Fn(&CollabEvent) -> bool,
    {
        loop {
            let event = events
                .recv_timeout(Duration::from_secs(1))
                .expect("event arrives in time");

            if matches(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_connecting_requires_membership() {
        let (_context, _events, room) = test_room(&[10]);

        assert!(
            matches!(room.connect(99).await, Err(RoomError::NotInRoom)),
            "strangers cannot connect"
        );

        assert!(room.connect(10).await.is_ok());
    }

    #[tokio::test]
    async fn test_joining_participants_are_reconciled_with_a_snapshot() {
        let (_context, _events, room) = test_room(&[10]);

        room.set_source("dune-part-two".to_string());

        let mut handle = room.connect(10).await.expect("member connects");

        match handle.next().await.expect("a message arrives") {
            ServerMessage::Command {
                command: SyncCommand::Snapshot { anchor },
            } => {
                assert_eq!(anchor.source_id, "dune-part-two");
                assert!(!anchor.is_playing, "a fresh source starts paused");
                assert_eq!(anchor.sequence_number, 0);
                assert_eq!(anchor.anchor_media_time_ms, 0.);
            }
            other => panic!("expected a snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_setting_a_source_reconciles_connected_participants() {
        let (_context, events, room) = test_room(&[10]);

        let mut handle = room.connect(10).await.expect("member connects");

        room.set_source("casablanca".to_string());

        let message = handle.next().await.expect("a message arrives");

        assert!(
            matches!(
                message,
                ServerMessage::Command {
                    command: SyncCommand::Snapshot { .. }
                }
            ),
            "the new source arrives as a snapshot, got {:?}",
            message
        );

        next_matching(&events, |event| {
            matches!(event, CollabEvent::SourceChanged { source_id, .. } if source_id == "casablanca")
        });
    }

    #[tokio::test]
    async fn test_commands_are_stamped_and_broadcast() {
        let (_context, _events, room) = test_room(&[10]);

        room.set_source("source".to_string());

        let mut handle = room.connect(10).await.expect("member connects");
        handle.next().await.expect("the join snapshot arrives");

        let issued_after_ms = local_now_ms();
        let command = room.play().expect("play is issued");

        assert_eq!(command.sequence_number(), 1);
        assert!(
            command.at_reference_time_ms() > issued_after_ms,
            "commands take effect a lead time in the future"
        );

        let received = handle.next().await.expect("the command is broadcast");
        assert_eq!(received, ServerMessage::Command { command });

        let anchor = room.anchor().expect("room is active");
        assert!(anchor.is_playing, "the authoritative anchor moved already");
    }

    #[tokio::test]
    async fn test_issuing_requires_an_active_source() {
        let (_context, _events, room) = test_room(&[10]);

        assert!(matches!(room.play(), Err(RoomError::NotActive)));
        assert!(room.anchor().is_none());
    }

    #[tokio::test]
    async fn test_malformed_commands_are_rejected() {
        let (_context, _events, room) = test_room(&[10]);

        room.set_source("source".to_string());

        assert!(matches!(room.seek(-5.), Err(RoomError::Command(_))));
        assert!(matches!(room.set_rate(0.), Err(RoomError::Command(_))));

        let anchor = room.anchor().expect("room is active");
        assert_eq!(
            anchor.sequence_number, 0,
            "rejected commands consume no sequence number"
        );
    }

    #[tokio::test]
    async fn test_pings_are_echoed_with_the_reference_time() {
        let (_context, _events, room) = test_room(&[10]);

        let mut handle = room.connect(10).await.expect("member connects");

        let before_ms = local_now_ms();

        room.handle_message(
            handle.connection_id(),
            ClientMessage::TimePing {
                client_send_time_ms: 123,
            },
        )
        .await
        .expect("the ping is handled");

        match handle.next().await.expect("the pong arrives") {
            ServerMessage::TimePong {
                client_send_time_ms,
                reference_time_ms,
            } => {
                assert_eq!(client_send_time_ms, 123, "the send time is echoed back");
                assert!(
                    reference_time_ms >= before_ms && reference_time_ms <= local_now_ms(),
                    "the pong carries the room's current clock"
                );
            }
            other => panic!("expected a pong, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_position_reports_feed_drift_telemetry() {
        let (_context, events, room) = test_room(&[10]);

        room.set_source("source".to_string());

        let handle = room.connect(10).await.expect("member connects");

        room.handle_message(
            handle.connection_id(),
            ClientMessage::PositionReport {
                reported_media_time_ms: 500.,
                is_playing: false,
            },
        )
        .await
        .expect("the report is handled");

        let event = next_matching(&events, |event| {
            matches!(event, CollabEvent::ParticipantDrift { .. })
        });

        match event {
            CollabEvent::ParticipantDrift {
                participant_id,
                sample,
                ..
            } => {
                assert_eq!(participant_id, 10);
                assert_eq!(
                    sample.drift_ms, 500.,
                    "drift against the fresh paused anchor is the raw position"
                );
                assert_eq!(sample.correction, Some(CorrectionKind::Soft));
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_passed_votes_issue_the_approved_command() {
        let (_context, _events, room) = test_room(&[10, 11, 12]);

        room.set_source("source".to_string());
        room.play().expect("play is issued");

        let vote = room
            .initiate_vote(10, VoteKind::Pause)
            .await
            .expect("vote opens");

        assert_eq!(vote.threshold, 2, "three participants need two yes votes");

        let first = room.cast_vote(vote.id, 10, Ballot::Yes).await.unwrap();
        assert!(!first.resolved);

        let second = room.cast_vote(vote.id, 11, Ballot::Yes).await.unwrap();
        assert!(second.resolved && second.passed);

        let anchor = room.anchor().expect("room is active");

        assert!(!anchor.is_playing, "the approved pause was issued");
        assert_eq!(anchor.sequence_number, 2, "play, then the voted pause");
    }

    #[tokio::test]
    async fn test_vote_lifecycle_is_visible_to_connections() {
        let (_context, _events, room) = test_room(&[10, 11]);

        room.set_source("source".to_string());

        let mut watcher = room.connect(10).await.expect("member connects");
        watcher.next().await.expect("the join snapshot arrives");

        let caster = room.connect(11).await.expect("member connects");

        room.handle_message(
            caster.connection_id(),
            ClientMessage::VoteInitiate {
                kind: VoteKind::Play,
            },
        )
        .await
        .expect("the vote opens");

        let vote_id = match watcher.next().await.expect("a message arrives") {
            ServerMessage::VoteStarted { vote } => {
                assert_eq!(vote.initiated_by, 11);
                vote.id
            }
            other => panic!("expected the vote start, got {:?}", other),
        };

        room.handle_message(
            caster.connection_id(),
            ClientMessage::VoteCast {
                vote_id,
                choice: Ballot::Yes,
            },
        )
        .await
        .expect("the ballot is cast");

        match watcher.next().await.expect("a message arrives") {
            ServerMessage::VoteUpdated { vote } => {
                assert_eq!(vote.yes_count(), 1, "one yes of the two required");
            }
            other => panic!("expected the vote update, got {:?}", other),
        }

        room.handle_message(
            watcher.connection_id(),
            ClientMessage::VoteCast {
                vote_id,
                choice: Ballot::Yes,
            },
        )
        .await
        .expect("the deciding ballot is cast");

        match watcher.next().await.expect("a message arrives") {
            ServerMessage::VoteResolved { vote } => assert!(vote.passed),
            other => panic!("expected the resolution, got {:?}", other),
        }

        match watcher.next().await.expect("a message arrives") {
            ServerMessage::Command { command } => {
                assert!(
                    matches!(command, SyncCommand::Play { .. }),
                    "the approved play follows the resolution"
                );
            }
            other => panic!("expected the approved command, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_members_cannot_cast() {
        let (_context, _events, room) = test_room(&[10]);

        room.set_source("source".to_string());

        let vote = room
            .initiate_vote(10, VoteKind::Pause)
            .await
            .expect("vote opens");

        let result = room.cast_vote(vote.id, 99, Ballot::Yes).await;

        assert!(
            matches!(result, Err(RoomError::Vote(VoteError::NotAParticipant))),
            "strangers cannot influence a vote"
        );
    }

    #[tokio::test]
    async fn test_expired_votes_fail_and_are_published() {
        // A zero ttl expires votes the moment they open.
        let config = Config {
            vote_ttl_ms: 0,
            ..Default::default()
        };

        let (_context, events, room) = test_room_with_config(config, &[10, 11, 12]);

        room.set_source("source".to_string());

        let vote = room
            .initiate_vote(10, VoteKind::Pause)
            .await
            .expect("vote opens");

        let result = room.cast_vote(vote.id, 11, Ballot::Yes).await;
        assert!(matches!(result, Err(RoomError::Vote(VoteError::Expired))));

        let event = next_matching(&events, |event| {
            matches!(event, CollabEvent::VoteResolved { .. })
        });

        match event {
            CollabEvent::VoteResolved { vote: resolved, .. } => {
                assert_eq!(resolved.id, vote.id);
                assert!(!resolved.passed, "an expired vote fails");
            }
            _ => unreachable!(),
        }

        assert!(room.open_vote().is_none());

        // The sweep path publishes the same way when nobody casts at all.
        room.initiate_vote(10, VoteKind::Pause)
            .await
            .expect("a new vote opens");

        assert_eq!(room.sweep_votes(), 1);

        next_matching(&events, |event| {
            matches!(event, CollabEvent::VoteResolved { .. })
        });
    }

    #[tokio::test]
    async fn test_dropping_the_handle_disconnects() {
        let (_context, events, room) = test_room(&[10]);

        let handle = room.connect(10).await.expect("member connects");
        assert_eq!(room.current_connections().len(), 1);

        drop(handle);

        assert!(
            room.current_connections().is_empty(),
            "the connection is gone with its handle"
        );

        let event = next_matching(&events, |event| {
            matches!(event, CollabEvent::ParticipantDisconnected { .. })
        });

        match event {
            CollabEvent::ParticipantDisconnected { participant_id, .. } => {
                assert_eq!(participant_id, 10)
            }
            _ => unreachable!(),
        }
    }
}
