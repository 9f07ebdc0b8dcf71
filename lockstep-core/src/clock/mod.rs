mod source;
mod sync;

pub use source::*;
pub use sync::*;
