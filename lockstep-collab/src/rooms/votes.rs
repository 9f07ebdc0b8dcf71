use std::collections::HashMap;

use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use lockstep_core::{local_now_ms, Config, Id};

use crate::{ParticipantId, RegistryError};

use super::RoomId;

pub type VoteId = Id<PlaybackVote>;

/// The collective action a vote approves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteKind {
    /// Pause playback for everyone
    Pause,
    /// Resume playback for everyone
    Play,
}

/// A single participant's choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ballot {
    Yes,
    No,
}

/// A collective decision on a playback action.
///
/// Resolves exactly once: either the yes count reaches the threshold, or the
/// vote expires, whichever comes first. Resolved votes are immutable and are
/// retained for audit until the room is torn down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackVote {
    pub id: VoteId,
    pub room_id: RoomId,
    pub kind: VoteKind,
    pub initiated_by: ParticipantId,
    pub initiated_at_ms: i64,
    pub expires_at_ms: i64,
    /// How many yes ballots resolve the vote as passed
    pub threshold: u32,
    /// Every participant's latest choice
    pub ballots: HashMap<ParticipantId, Ballot>,
    pub resolved: bool,
    pub passed: bool,
}

impl PlaybackVote {
    pub fn yes_count(&self) -> u32 {
        self.ballots
            .values()
            .filter(|&&choice| choice == Ballot::Yes)
            .count() as u32
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

#[derive(Debug, Error)]
pub enum VoteError {
    /// Only one vote can be open per room at a time
    #[error("A vote is already in progress")]
    Conflict,
    #[error("Vote doesn't exist")]
    NotFound,
    #[error("Vote is already resolved")]
    AlreadyResolved,
    /// The vote ran out before the ballot arrived. The failed cast resolves
    /// the vote, so the caller should publish the resolution.
    #[error("Vote has expired")]
    Expired,
    #[error("Participant is not a member of this room")]
    NotAParticipant,
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Manages collective approval of playback actions for one room.
///
/// At most one vote is open at a time, and ballots are last-wins so a
/// participant can change their mind while the vote runs. Passing requires
/// the yes count to reach ceil(60%) of the room's active participants at
/// initiation time.
pub struct VoteCoordinator {
    ttl_ms: i64,
    state: Mutex<VoteState>,
}

#[derive(Debug, Default)]
struct VoteState {
    /// The vote currently open, if any
    open: Option<PlaybackVote>,
    /// Resolved votes, oldest first
    resolved: Vec<PlaybackVote>,
}

impl VoteCoordinator {
    pub fn new(config: &Config) -> Self {
        Self {
            ttl_ms: config.vote_ttl_ms as i64,
            state: Default::default(),
        }
    }

    /// Opens a vote, unless one is already in progress.
    pub fn initiate(
        &self,
        room_id: RoomId,
        initiated_by: ParticipantId,
        kind: VoteKind,
        active_participant_count: usize,
    ) -> Result<PlaybackVote, VoteError> {
        self.initiate_at(
            local_now_ms(),
            room_id,
            initiated_by,
            kind,
            active_participant_count,
        )
    }

    fn initiate_at(
        &self,
        now_ms: i64,
        room_id: RoomId,
        initiated_by: ParticipantId,
        kind: VoteKind,
        active_participant_count: usize,
    ) -> Result<PlaybackVote, VoteError> {
        // The initiator counts as active, so a zero count is a bug upstream.
        debug_assert!(
            active_participant_count > 0,
            "a vote requires at least one active participant"
        );

        let mut state = self.state.lock();

        if state.open.is_some() {
            return Err(VoteError::Conflict);
        }

        let vote = PlaybackVote {
            id: VoteId::new(),
            room_id,
            kind,
            initiated_by,
            initiated_at_ms: now_ms,
            expires_at_ms: now_ms + self.ttl_ms,
            threshold: vote_threshold(active_participant_count),
            ballots: HashMap::new(),
            resolved: false,
            passed: false,
        };

        info!(
            "Vote {} ({:?}) opened for room {} with threshold {}",
            vote.id, vote.kind, room_id, vote.threshold
        );

        state.open = Some(vote.clone());

        Ok(vote)
    }

    /// Casts or changes a ballot on the open vote, resolving it as passed
    /// the moment the yes count reaches the threshold.
    pub fn cast(
        &self,
        vote_id: VoteId,
        participant_id: ParticipantId,
        choice: Ballot,
    ) -> Result<PlaybackVote, VoteError> {
        self.cast_at(local_now_ms(), vote_id, participant_id, choice)
    }

    fn cast_at(
        &self,
        now_ms: i64,
        vote_id: VoteId,
        participant_id: ParticipantId,
        choice: Ballot,
    ) -> Result<PlaybackVote, VoteError> {
        let mut state = self.state.lock();

        let open_id = state.open.as_ref().map(|vote| vote.id);

        if open_id != Some(vote_id) {
            let was_resolved = state.resolved.iter().any(|vote| vote.id == vote_id);

            return Err(if was_resolved {
                VoteError::AlreadyResolved
            } else {
                VoteError::NotFound
            });
        }

        let vote = state.open.as_mut().expect("open vote matched the id");

        // A cast against an expired vote triggers the resolution the sweep
        // has not gotten to yet.
        if vote.is_expired(now_ms) {
            let failed = resolve(&mut state, false);
            info!("Vote {} expired without passing", failed.id);

            return Err(VoteError::Expired);
        }

        // Last choice wins, changing one's mind is allowed.
        vote.ballots.insert(participant_id, choice);

        let reached = vote.yes_count() >= vote.threshold;

        if reached {
            let passed = resolve(&mut state, true);
            info!(
                "Vote {} passed with {} yes ballots",
                passed.id,
                passed.yes_count()
            );

            return Ok(passed);
        }

        Ok(vote.clone())
    }

    /// Resolves the open vote as failed if it has expired.
    /// Returns the resolved votes so the caller can publish them.
    pub fn sweep_expired(&self) -> Vec<PlaybackVote> {
        self.sweep_expired_at(local_now_ms())
    }

    fn sweep_expired_at(&self, now_ms: i64) -> Vec<PlaybackVote> {
        let mut state = self.state.lock();

        let expired = state
            .open
            .as_ref()
            .is_some_and(|vote| vote.is_expired(now_ms));

        if !expired {
            return Vec::new();
        }

        let failed = resolve(&mut state, false);
        info!("Vote {} expired without passing", failed.id);

        vec![failed]
    }

    /// The vote currently open, if any.
    pub fn open_vote(&self) -> Option<PlaybackVote> {
        self.state.lock().open.clone()
    }

    /// Looks up a resolved vote, for audit.
    pub fn resolved_vote(&self, vote_id: VoteId) -> Option<PlaybackVote> {
        self.state
            .lock()
            .resolved
            .iter()
            .find(|vote| vote.id == vote_id)
            .cloned()
    }

    /// Every resolved vote so far, oldest first.
    pub fn resolved_votes(&self) -> Vec<PlaybackVote> {
        self.state.lock().resolved.clone()
    }
}

fn resolve(state: &mut VoteState, passed: bool) -> PlaybackVote {
    let mut vote = state.open.take().expect("a vote is open when resolving");

    vote.resolved = true;
    vote.passed = passed;

    state.resolved.push(vote.clone());

    vote
}

/// How many yes ballots a room of the given size needs to pass a vote.
/// Exactly ceil(60%), computed in integers so rounding never drifts.
fn vote_threshold(active_participant_count: usize) -> u32 {
    let count = active_participant_count as u64;

    (count * 3).div_ceil(5).max(1) as u32
}
