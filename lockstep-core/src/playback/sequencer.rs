use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{local_now_ms, ClockEstimate, Config, Introspect, PlaybackAnchor};

/// The state-changing part of a command, without its schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandKind {
    Play,
    Pause,
    Seek { target_media_time_ms: f64 },
    SetRate { rate: f64 },
}

/// A state change scheduled at a reference-clock instant, broadcast to every
/// participant of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncCommand {
    Play {
        at_reference_time_ms: i64,
        sequence_number: u64,
    },
    Pause {
        at_reference_time_ms: i64,
        sequence_number: u64,
    },
    Seek {
        target_media_time_ms: f64,
        at_reference_time_ms: i64,
        sequence_number: u64,
    },
    SetRate {
        rate: f64,
        at_reference_time_ms: i64,
        sequence_number: u64,
    },
    /// The full authoritative state, sent to reconcile a (re)joining
    /// participant instead of replaying history.
    Snapshot { anchor: PlaybackAnchor },
}

#[derive(Debug, Error)]
pub enum CommandError {
    /// Playback rate must be a positive, finite number
    #[error("Playback rate {rate} is not a positive number")]
    InvalidRate { rate: f64 },
    /// Seek targets must be valid media positions
    #[error("Seek target {target_media_time_ms} is not a valid media position")]
    InvalidSeekTarget { target_media_time_ms: f64 },
}

impl SyncCommand {
    /// The sequence number stamped on this command.
    pub fn sequence_number(&self) -> u64 {
        match self {
            Self::Play {
                sequence_number, ..
            }
            | Self::Pause {
                sequence_number, ..
            }
            | Self::Seek {
                sequence_number, ..
            }
            | Self::SetRate {
                sequence_number, ..
            } => *sequence_number,
            Self::Snapshot { anchor } => anchor.sequence_number,
        }
    }

    /// The reference-clock instant this command takes effect at.
    pub fn at_reference_time_ms(&self) -> i64 {
        match self {
            Self::Play {
                at_reference_time_ms,
                ..
            }
            | Self::Pause {
                at_reference_time_ms,
                ..
            }
            | Self::Seek {
                at_reference_time_ms,
                ..
            }
            | Self::SetRate {
                at_reference_time_ms,
                ..
            } => *at_reference_time_ms,
            Self::Snapshot { anchor } => anchor.anchor_reference_time_ms,
        }
    }

    fn from_parts(kind: CommandKind, at_reference_time_ms: i64, sequence_number: u64) -> Self {
        match kind {
            CommandKind::Play => Self::Play {
                at_reference_time_ms,
                sequence_number,
            },
            CommandKind::Pause => Self::Pause {
                at_reference_time_ms,
                sequence_number,
            },
            CommandKind::Seek {
                target_media_time_ms,
            } => Self::Seek {
                target_media_time_ms,
                at_reference_time_ms,
                sequence_number,
            },
            CommandKind::SetRate { rate } => Self::SetRate {
                rate,
                at_reference_time_ms,
                sequence_number,
            },
        }
    }

    fn kind(&self) -> Option<CommandKind> {
        match self {
            Self::Play { .. } => Some(CommandKind::Play),
            Self::Pause { .. } => Some(CommandKind::Pause),
            Self::Seek {
                target_media_time_ms,
                ..
            } => Some(CommandKind::Seek {
                target_media_time_ms: *target_media_time_ms,
            }),
            Self::SetRate { rate, .. } => Some(CommandKind::SetRate { rate: *rate }),
            Self::Snapshot { .. } => None,
        }
    }
}

/// The authoritative side of the command protocol.
///
/// Stamps every command with a short lead time and a strictly increasing
/// sequence number, and moves the authoritative anchor to the post-command
/// state in the same step, so a snapshot taken right after an issue already
/// reflects it.
pub struct CommandSequencer {
    config: Config,
    anchor: Mutex<PlaybackAnchor>,
}

impl CommandSequencer {
    pub fn new(config: &Config, anchor: PlaybackAnchor) -> Self {
        Self {
            config: config.clone(),
            anchor: Mutex::new(anchor),
        }
    }

    /// Issues a command taking effect a lead time from now.
    /// The caller is responsible for broadcasting it.
    pub fn issue(&self, kind: CommandKind) -> Result<SyncCommand, CommandError> {
        self.issue_at(local_now_ms(), kind)
    }

    fn issue_at(
        &self,
        reference_now_ms: i64,
        kind: CommandKind,
    ) -> Result<SyncCommand, CommandError> {
        validate_kind(&kind)?;

        let mut anchor = self.anchor.lock();

        let at_reference_time_ms = reference_now_ms + self.config.command_lead_time_ms as i64;
        let sequence_number = anchor.sequence_number + 1;

        *anchor = anchor.with_command(&kind, at_reference_time_ms, sequence_number);

        Ok(SyncCommand::from_parts(
            kind,
            at_reference_time_ms,
            sequence_number,
        ))
    }

    /// The authoritative state as a reconciliation command for a joining
    /// participant.
    pub fn snapshot(&self) -> SyncCommand {
        SyncCommand::Snapshot {
            anchor: self.anchor.lock().clone(),
        }
    }

    /// The current authoritative anchor.
    pub fn anchor(&self) -> PlaybackAnchor {
        self.anchor.lock().clone()
    }
}

/// Commands that reach the coordinator malformed indicate a bug upstream,
/// they are rejected rather than clamped.
fn validate_kind(kind: &CommandKind) -> Result<(), CommandError> {
    match *kind {
        CommandKind::SetRate { rate } if !(rate.is_finite() && rate > 0.) => {
            Err(CommandError::InvalidRate { rate })
        }
        CommandKind::Seek {
            target_media_time_ms,
        } if !(target_media_time_ms.is_finite() && target_media_time_ms >= 0.) => {
            Err(CommandError::InvalidSeekTarget {
                target_media_time_ms,
            })
        }
        _ => Ok(()),
    }
}

/// What to do with a received command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admittance {
    /// Already superseded, nothing to do
    Stale,
    /// The effect time has passed, execute right away rather than dropping
    Immediate,
    /// Execute once the local clock reaches the deadline
    At { local_deadline_ms: i64 },
}

/// The participant side of the command protocol.
///
/// Keeps a mirrored copy of the authoritative anchor, applying received
/// commands in sequence order and discarding stale ones. Scheduling the
/// deadlines that [CommandMirror::admit] produces is the session's job.
#[derive(Debug, Default)]
pub struct CommandMirror {
    state: Mutex<MirrorState>,
}

#[derive(Debug, Default)]
struct MirrorState {
    /// None until the first snapshot arrives
    anchor: Option<PlaybackAnchor>,
    last_applied_sequence: u64,
}

impl CommandMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides when a received command should execute, translating its
    /// reference-clock effect time into a local deadline.
    pub fn admit(&self, command: &SyncCommand, estimate: &ClockEstimate) -> Admittance {
        self.admit_at(local_now_ms(), command, estimate)
    }

    fn admit_at(
        &self,
        local_now_ms: i64,
        command: &SyncCommand,
        estimate: &ClockEstimate,
    ) -> Admittance {
        // Snapshots describe current state, not a future transition.
        if matches!(command, SyncCommand::Snapshot { .. }) {
            return Admittance::Immediate;
        }

        if command.sequence_number() <= self.state.lock().last_applied_sequence {
            return Admittance::Stale;
        }

        let local_deadline_ms = estimate.local_time_ms(command.at_reference_time_ms());

        if local_deadline_ms <= local_now_ms {
            Admittance::Immediate
        } else {
            Admittance::At { local_deadline_ms }
        }
    }

    /// Applies a command to the mirrored anchor, returning the new anchor.
    ///
    /// Staleness is checked again here, since a higher-sequence command may
    /// have fired while this one was waiting for its deadline. Returns None
    /// when the command was discarded.
    pub fn execute(&self, command: SyncCommand) -> Option<PlaybackAnchor> {
        let mut state = self.state.lock();

        if let SyncCommand::Snapshot { anchor } = command {
            state.last_applied_sequence = anchor.sequence_number;
            state.anchor = Some(anchor.clone());

            return Some(anchor);
        }

        let sequence_number = command.sequence_number();

        if sequence_number <= state.last_applied_sequence {
            return None;
        }

        let Some(anchor) = state.anchor.as_ref() else {
            // The coordinator reconciles every new connection with a snapshot
            // first, so this only happens on a protocol bug.
            warn!("Discarding command {:?} received before any snapshot", command);
            return None;
        };

        let kind = command.kind().expect("non-snapshot commands have a kind");
        let next = anchor.with_command(&kind, command.at_reference_time_ms(), sequence_number);

        state.last_applied_sequence = sequence_number;
        state.anchor = Some(next.clone());

        Some(next)
    }

    /// The mirrored anchor, if a snapshot has arrived yet.
    pub fn anchor(&self) -> Option<PlaybackAnchor> {
        self.state.lock().anchor.clone()
    }

    pub fn last_applied_sequence(&self) -> u64 {
        self.state.lock().last_applied_sequence
    }
}

#[derive(Debug)]
pub struct CommandMirrorIntrospection {
    pub anchor: Option<PlaybackAnchor>,
    pub last_applied_sequence: u64,
}

impl Introspect<CommandMirrorIntrospection> for CommandMirror {
    fn introspect(&self) -> CommandMirrorIntrospection {
        let state = self.state.lock();

        CommandMirrorIntrospection {
            anchor: state.anchor.clone(),
            last_applied_sequence: state.last_applied_sequence,
        }
    }
}
