//! Pending command journal
//!
//! Local mutations are recorded here before they reach the server, survive
//! restarts, and are replayed in order by the backend.

mod command;
mod pending;

pub use command::{JournalEntry, MessageRef, MoveTarget, PendingCommand, SequenceId};
pub use pending::{DrainReport, PendingCommandJournal, PendingIndex};
