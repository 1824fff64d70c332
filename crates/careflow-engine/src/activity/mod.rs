//! Activities: the only code allowed to perform I/O

mod context;
mod definition;
mod emitter;

pub use context::ActivityContext;
pub use definition::{Activity, ActivityError};
pub use emitter::{EmitOutcome, EventEmitter};
