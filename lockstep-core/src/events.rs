use crossbeam::channel::{Receiver, Sender};

use crate::{ClockEstimate, CorrectionIntent, PlaybackAnchor};

pub type EventSender = Sender<SyncEvent>;
pub type EventReceiver = Receiver<SyncEvent>;

/// Describes the events that can be emitted by a sync session.
#[derive(Debug)]
pub enum SyncEvent {
    /// A sync run finished and the session's clock estimate was replaced.
    ClockSynced { estimate: ClockEstimate },
    /// A command fired and the mirrored anchor changed.
    /// The player layer should reflect the new anchor.
    AnchorApplied { anchor: PlaybackAnchor },
    /// The drift monitor decided a correction is warranted.
    /// The player layer is expected to carry it out.
    CorrectionRequired { intent: CorrectionIntent },
}
