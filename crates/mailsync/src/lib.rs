//! Mailsync - Synchronization core of a mail client
//!
//! This crate keeps a local, queryable cache of remote mailboxes in sync:
//! - Domain models (Account, Folder, Message, Thread)
//! - SQLite mail store with forward-only migrations
//! - Pending command journal replayed to the server with idempotency
//! - Overlay of pending local changes for instant reads
//! - Protocol-agnostic backend contract and an IMAP adapter
//! - Folder reconciler and account sync sessions with retry policy
//! - Search condition compiler and query API for UI consumption
//! - Action handlers for mutations (flags, moves, deletes, appends)
//!
//! Nothing here is process-global: the host owns an [`AccountRegistry`] and
//! passes it where needed.

pub mod actions;
pub mod backend;
pub mod config;
pub mod error;
pub mod journal;
pub mod logging;
pub mod models;
pub mod overlay;
pub mod query;
pub mod registry;
pub mod search;
pub mod storage;
pub mod sync;

pub use actions::MailActions;
pub use backend::imap::{ImapBackend, ImapSession, MemoryImapServer};
pub use backend::{
    Backend, CommandReplayer, ListenerEvent, NoopListener, RecordingListener, RemoteCommand,
    RemoteSession, ReplayOutcome, SyncListener,
};
pub use config::{NetworkTier, RetryPolicy, SyncConfig, SyncSettings};
pub use error::{CompileError, RemoteError, RemoteErrorKind, StoreError, SyncError};
pub use journal::{DrainReport, PendingCommand, PendingCommandJournal, SequenceId};
pub use logging::{LogSink, init_host_logger, set_log_level, set_log_sink};
pub use models::{
    Account, AccountId, EmailAddress, Flag, FlagSet, Folder, FolderId, FolderSyncState,
    LocalMessageId, Message, MessageSummary, RemoteId, Thread, ThreadId, Watermark,
};
pub use overlay::{AccountOverlay, EntityId, OverlayField, OverlayRegistry, OverlayValue};
pub use query::{
    MessageView, SearchHit, ThreadDetail, ThreadSummary, get_message_view, get_thread_detail,
    list_messages, list_threads, search,
};
pub use registry::{AccountContext, AccountRegistry};
pub use search::{
    Attribute, CompiledQuery, SearchCondition, SearchConditionNode, SearchField,
    SearchSpecification, compile, parse_query,
};
pub use storage::{MailStore, MessageCursor, SqliteMailStore};
pub use sync::{
    AccountSyncReport, AccountSyncSession, AccountSyncStatus, CancellationToken, FolderReconciler,
    SyncPhase, SyncStats, sync_accounts,
};
