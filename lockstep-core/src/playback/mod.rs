mod anchor;
mod sequencer;

pub use anchor::*;
pub use sequencer::*;
