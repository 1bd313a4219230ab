//! Local mail store
//!
//! The store is the durable, queryable cache of one account. SQLite is the
//! only implementation; the trait exists so sync code can be driven against
//! `&dyn MailStore` and so the registry can hand out shared handles.

mod cursor;
mod sqlite;
mod traits;

pub use cursor::MessageCursor;
pub use sqlite::SqliteMailStore;
pub use traits::{
    DroppedCommand, FlagUpdate, FolderDiff, LocalEntry, MailStore, MovedMessage, StoreResult,
    StoredCommand, UpsertOutcome,
};
