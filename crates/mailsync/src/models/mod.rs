//! Domain models for mail entities

mod account;
mod folder;
mod message;
mod sync_state;
mod thread;

pub use account::{Account, AccountId};
pub use folder::{Folder, FolderId};
pub use message::{
    EmailAddress, Flag, FlagSet, LocalMessageId, Message, MessageSummary, MessageSummaryBuilder,
    RemoteId,
};
pub use sync_state::{FolderSyncState, Watermark};
pub use thread::{Thread, ThreadId};
