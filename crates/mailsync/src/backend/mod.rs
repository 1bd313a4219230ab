//! Protocol-agnostic synchronization contract
//!
//! The reconciler talks to a server only through [`RemoteSession`]. A
//! protocol adapter implements that trait for one connection and exposes a
//! [`Backend`] that runs folder syncs for an account.

pub mod imap;
mod listener;

use std::collections::BTreeMap;

use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncError};
use crate::journal::DrainReport;
use crate::models::{Flag, FlagSet, FolderId, MessageSummary, RemoteId, Watermark};
use crate::sync::SyncStats;

pub use listener::{ListenerEvent, NoopListener, RecordingListener, SyncListener};

/// Mapping from a message's old remote id to the id the server assigned
pub type UidMap = BTreeMap<RemoteId, RemoteId>;

/// A journal command resolved to server identifiers, ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    SetFlag {
        folder: String,
        ids: Vec<RemoteId>,
        flag: Flag,
        value: bool,
    },
    Move {
        src: String,
        dst: String,
        ids: Vec<RemoteId>,
    },
    Delete {
        folder: String,
        ids: Vec<RemoteId>,
    },
    Expunge {
        folder: String,
    },
    /// Upload a locally created message; `placeholder` keys the returned UidMap
    Append {
        folder: String,
        placeholder: RemoteId,
        content: Vec<u8>,
        flags: FlagSet,
    },
    MarkAllAsRead {
        folder: String,
    },
}

impl RemoteCommand {
    /// Folder the command is executed in
    pub fn folder(&self) -> &str {
        match self {
            RemoteCommand::SetFlag { folder, .. }
            | RemoteCommand::Delete { folder, .. }
            | RemoteCommand::Expunge { folder }
            | RemoteCommand::Append { folder, .. }
            | RemoteCommand::MarkAllAsRead { folder } => folder,
            RemoteCommand::Move { src, .. } => src,
        }
    }
}

/// Result of replaying one command against the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Done; carries server-assigned ids for moves and appends, if known
    Applied(UidMap),
    /// The server was already in the requested state
    AlreadyApplied,
    /// The command can never succeed and should be dropped
    PermanentFailure(String),
    /// Try again later; the journal stops draining
    TransientFailure(RemoteError),
}

impl ReplayOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ReplayOutcome::Applied(_) | ReplayOutcome::AlreadyApplied)
    }
}

/// Something that can send resolved commands to a server
pub trait CommandReplayer {
    fn replay(&mut self, command: &RemoteCommand) -> ReplayOutcome;
}

/// What opening a remote folder reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteFolderStatus {
    pub uid_validity: Option<u64>,
    pub message_count: u64,
    pub highest_modseq: Option<u64>,
    /// The server can list only what changed since a watermark
    pub supports_incremental: bool,
}

/// Full or incremental listing request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListingRequest {
    /// None lists the whole folder
    pub since: Option<Watermark>,
}

impl ListingRequest {
    pub fn full() -> Self {
        Self { since: None }
    }

    pub fn since(watermark: Watermark) -> Self {
        Self {
            since: Some(watermark),
        }
    }
}

/// Flags and size of one remote message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub remote_id: RemoteId,
    pub flags: FlagSet,
    pub size: u64,
}

/// Remote folder summary used for diffing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteListing {
    /// Messages listed (all of them, or only changed ones when incremental)
    pub entries: Vec<RemoteEntry>,
    /// Every id currently in the folder; present for incremental listings so
    /// deletions can still be detected
    pub all_ids: Option<Vec<RemoteId>>,
    pub incremental: bool,
    /// Position to store once this listing has been applied
    pub watermark: Option<Watermark>,
}

/// A downloaded message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedContent {
    pub data: Vec<u8>,
    /// False if the download was cut at the size limit
    pub complete: bool,
}

/// One open connection to a mail server
pub trait RemoteSession: CommandReplayer {
    fn open_folder(&mut self, server_id: &str) -> Result<RemoteFolderStatus, RemoteError>;

    /// Permanently remove messages flagged deleted
    fn expunge(&mut self, server_id: &str) -> Result<(), RemoteError>;

    fn list_remote(
        &mut self,
        server_id: &str,
        request: &ListingRequest,
    ) -> Result<RemoteListing, RemoteError>;

    /// Envelopes for new messages; ids missing on the server are skipped
    fn fetch_headers(
        &mut self,
        server_id: &str,
        ids: &[RemoteId],
    ) -> Result<Vec<MessageSummary>, RemoteError>;

    /// Body of one message, truncated after `max_bytes`
    fn fetch_content(
        &mut self,
        server_id: &str,
        id: &RemoteId,
        max_bytes: u64,
    ) -> Result<FetchedContent, RemoteError>;
}

/// Runs syncs for one account over some protocol
///
/// Backends hold no folder state between calls; the only thing that survives
/// is an optional connection handle owned by the caller.
pub trait Backend: Send + Sync {
    /// An open connection, reusable across syncs
    type Handle;

    fn connect(&self) -> Result<Self::Handle, SyncError>;

    /// Reconcile one folder. Exactly one of `sync_finished` / `sync_failed`
    /// is delivered to the listener.
    fn sync(
        &self,
        folder: FolderId,
        config: &SyncConfig,
        listener: &mut dyn SyncListener,
        handle: Option<&mut Self::Handle>,
    ) -> Result<SyncStats, SyncError>;

    /// Replay pending commands outside a sync
    fn flush_pending(
        &self,
        folder_filter: Option<FolderId>,
        handle: Option<&mut Self::Handle>,
    ) -> Result<DrainReport, SyncError>;
}
