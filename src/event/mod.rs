//! Event lifecycle: the authoritative state machine, its storage and the
//! engine that serializes every change.

pub mod engine;
pub mod notify;
pub mod state;
pub mod store;

pub use engine::{AdvanceOutcome, EventRegistry};
pub use state::{EventState, RoundStatus};
pub use store::{EventStore, FileStore, MemoryStore};
