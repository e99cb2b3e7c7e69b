//! # parlor-store
//!
//! Pure in-memory state for a chat session: the message timeline (the
//! dedup/ordering/reconciliation core), the chat room directory, and the
//! ephemeral typing presence set.
//!
//! Nothing here performs I/O.  Every mutation is a synchronous state
//! transition, so the ordering and uniqueness invariants can be exercised
//! under arbitrary event interleavings without a network in sight.  The
//! orchestrator in `parlor-client` drives these stores from history fetches,
//! push deliveries, poll ticks, and user actions.

pub mod directory;
pub mod timeline;
pub mod typing;

pub use directory::ChatDirectory;
pub use timeline::{MergeOutcome, SendState, TimelineStore};
pub use typing::TypingTracker;
