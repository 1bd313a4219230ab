//! Folder model

use serde::{Deserialize, Serialize};
use std::fmt;

use super::FolderSyncState;

/// Local integer id of a folder (database primary key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FolderId(pub i64);

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A remote mailbox and its local mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: FolderId,
    /// Server-assigned path, e.g. "INBOX" or "Archive/2024"
    pub server_id: String,
    /// Display name
    pub name: String,
    pub subscribed: bool,
    pub visible: bool,
    /// Folders that exist only locally (e.g. an outbox) are never synced
    pub local_only: bool,
    pub sync_state: FolderSyncState,
}

impl Folder {
    /// Whether the reconciler should visit this folder during an account sync
    pub fn is_syncable(&self) -> bool {
        self.subscribed && !self.local_only
    }
}
