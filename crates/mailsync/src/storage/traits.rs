//! Storage trait definitions

use chrono::{DateTime, Utc};

use super::MessageCursor;
use crate::error::StoreError;
use crate::models::{
    Flag, FlagSet, Folder, FolderId, FolderSyncState, LocalMessageId, Message, MessageSummary,
    RemoteId, ThreadId,
};
use crate::search::CompiledQuery;

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of writing a batch of remote summaries into a folder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Remote ids inserted as new rows
    pub added: Vec<RemoteId>,
    /// Remote ids whose flags changed
    pub updated: Vec<RemoteId>,
    /// Remote ids whose rows were deleted
    pub removed: Vec<RemoteId>,
}

impl UpsertOutcome {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Replace the flag set of an existing local row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagUpdate {
    pub id: LocalMessageId,
    pub flags: FlagSet,
}

/// Everything one reconciliation pass writes to a folder
///
/// Applied in a single transaction together with the new sync state, so the
/// watermark never advances past changes that were not committed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FolderDiff {
    pub new_messages: Vec<MessageSummary>,
    pub flag_updates: Vec<FlagUpdate>,
    pub removals: Vec<LocalMessageId>,
    pub sync_state: FolderSyncState,
}

/// Minimal per-message view used by the reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub id: LocalMessageId,
    pub remote_id: RemoteId,
    pub flags: FlagSet,
    pub size: u64,
    pub complete: bool,
}

/// A message that changed folders in [`MailStore::move_messages`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovedMessage {
    pub id: LocalMessageId,
    pub old_remote_id: RemoteId,
    /// Placeholder until the server assigns a UID in the destination
    pub new_remote_id: RemoteId,
}

/// A serialized pending command row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCommand {
    pub sequence: i64,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// A command removed from the journal without being applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedCommand {
    pub sequence: i64,
    pub payload: String,
    pub reason: String,
    pub dropped_at: DateTime<Utc>,
}

/// Trait for the local mail cache of one account
///
/// Every mutating method runs in a single transaction: either all of its
/// effects are visible afterwards or none are.
pub trait MailStore: Send + Sync {
    // === Folders ===

    /// Get a folder by server id, creating it on first sight
    fn ensure_folder(&self, server_id: &str, name: &str) -> StoreResult<Folder>;

    /// Create a folder that never syncs (drafts outbox, local archive)
    fn ensure_local_folder(&self, server_id: &str, name: &str) -> StoreResult<Folder>;

    fn get_folder(&self, id: FolderId) -> StoreResult<Option<Folder>>;

    fn get_folder_by_server_id(&self, server_id: &str) -> StoreResult<Option<Folder>>;

    /// All folders, ordered by server id
    fn list_folders(&self) -> StoreResult<Vec<Folder>>;

    fn set_folder_subscribed(&self, id: FolderId, subscribed: bool) -> StoreResult<()>;

    /// Delete a folder and all of its messages
    fn remove_folder(&self, id: FolderId) -> StoreResult<()>;

    fn save_folder_sync_state(&self, id: FolderId, state: &FolderSyncState) -> StoreResult<()>;

    // === Messages ===

    /// Insert new summaries and refresh flags of known ones.
    ///
    /// Summaries carrying [`Flag::Deleted`] remove the local row instead.
    /// Re-applying the same batch is a no-op.
    fn upsert_messages(
        &self,
        folder: FolderId,
        summaries: &[MessageSummary],
    ) -> StoreResult<UpsertOutcome>;

    /// Apply a reconciliation diff and the folder's new sync state atomically
    fn apply_folder_diff(&self, folder: FolderId, diff: &FolderDiff) -> StoreResult<UpsertOutcome>;

    /// Set or clear one flag; returns the ids whose flags actually changed
    fn set_flags(
        &self,
        folder: FolderId,
        ids: &[LocalMessageId],
        flag: &Flag,
        value: bool,
    ) -> StoreResult<Vec<LocalMessageId>>;

    /// Move messages between folders, keeping their local ids.
    ///
    /// Each moved message gets a fresh placeholder remote id in `dst`. If any
    /// id is not in `src`, nothing moves.
    fn move_messages(
        &self,
        src: FolderId,
        dst: FolderId,
        ids: &[LocalMessageId],
    ) -> StoreResult<Vec<MovedMessage>> {
        let moves: Vec<(LocalMessageId, RemoteId)> =
            ids.iter().map(|id| (*id, RemoteId::placeholder())).collect();
        self.relocate_messages(src, dst, &moves)
    }

    /// Like [`MailStore::move_messages`], with caller-chosen placeholder ids
    fn relocate_messages(
        &self,
        src: FolderId,
        dst: FolderId,
        moves: &[(LocalMessageId, RemoteId)],
    ) -> StoreResult<Vec<MovedMessage>>;

    /// Delete rows outright; returns the number removed
    fn destroy_messages(&self, folder: FolderId, ids: &[LocalMessageId]) -> StoreResult<usize>;

    /// Delete every message in a folder (UIDVALIDITY change)
    fn clear_folder_messages(&self, folder: FolderId) -> StoreResult<usize>;

    /// Replace a remote id if it still equals `expected`; returns whether it did
    fn change_remote_id(
        &self,
        id: LocalMessageId,
        expected: &RemoteId,
        new: &RemoteId,
    ) -> StoreResult<bool>;

    fn get_message(&self, id: LocalMessageId) -> StoreResult<Option<Message>>;

    fn find_message(&self, folder: FolderId, remote_id: &RemoteId) -> StoreResult<Option<Message>>;

    /// Compact index of a folder, ordered by remote id ascending
    fn folder_index(&self, folder: FolderId) -> StoreResult<Vec<LocalEntry>>;

    /// Store a (possibly partial) message body
    fn store_content(&self, id: LocalMessageId, data: &[u8], complete: bool) -> StoreResult<()>;

    fn load_content(&self, id: LocalMessageId) -> StoreResult<Option<Vec<u8>>>;

    /// Messages of one thread, oldest first
    fn thread_messages(&self, thread: ThreadId) -> StoreResult<Vec<Message>>;

    /// One page of messages matching `query` with local id greater than `after`
    fn query_page(
        &self,
        query: &CompiledQuery,
        after: Option<LocalMessageId>,
        limit: usize,
    ) -> StoreResult<Vec<Message>>;

    /// Lazy iterator over every message matching `query`
    fn query_messages(&self, query: CompiledQuery) -> MessageCursor<'_>;

    // === Pending command journal ===

    /// Append a command; returns its sequence number
    fn insert_pending_command(&self, payload: &str) -> StoreResult<i64>;

    /// All pending commands in sequence order
    fn pending_commands(&self) -> StoreResult<Vec<StoredCommand>>;

    fn update_pending_command(&self, sequence: i64, payload: &str) -> StoreResult<()>;

    fn remove_pending_command(&self, sequence: i64) -> StoreResult<()>;

    /// Move a pending command to the dropped log with a reason
    fn record_dropped_command(&self, sequence: i64, reason: &str) -> StoreResult<()>;

    fn dropped_commands(&self) -> StoreResult<Vec<DroppedCommand>>;
}
