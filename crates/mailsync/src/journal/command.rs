//! Pending command model

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::models::{Flag, FolderId, LocalMessageId, RemoteId};

/// Sequence number of a journal entry; strictly increasing per account
pub type SequenceId = i64;

/// A message a command applies to
///
/// `remote_id` is None when the server id is not known yet (or was a
/// placeholder when the command was enqueued); it is resolved from the store
/// at replay time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub folder: FolderId,
    pub local_id: LocalMessageId,
    pub remote_id: Option<RemoteId>,
}

impl MessageRef {
    pub fn new(folder: FolderId, local_id: LocalMessageId, remote_id: Option<RemoteId>) -> Self {
        Self {
            folder,
            local_id,
            remote_id: remote_id.filter(|id| !id.is_placeholder()),
        }
    }
}

/// One message of a move: where it was, and the placeholder it got locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveTarget {
    pub source: MessageRef,
    pub placeholder: RemoteId,
}

/// A local mutation waiting to be replayed on the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingCommand {
    SetFlag {
        targets: Vec<MessageRef>,
        flag: Flag,
        value: bool,
    },
    Move {
        dst: FolderId,
        targets: Vec<MoveTarget>,
    },
    Delete {
        targets: Vec<MessageRef>,
    },
    Append {
        folder: FolderId,
        local_id: LocalMessageId,
    },
    Expunge {
        folder: FolderId,
    },
    MarkAllAsRead {
        folder: FolderId,
    },
}

impl PendingCommand {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            PendingCommand::SetFlag { .. } => "set_flag",
            PendingCommand::Move { .. } => "move",
            PendingCommand::Delete { .. } => "delete",
            PendingCommand::Append { .. } => "append",
            PendingCommand::Expunge { .. } => "expunge",
            PendingCommand::MarkAllAsRead { .. } => "mark_all_as_read",
        }
    }

    /// Every folder the command reads or writes
    pub fn folders(&self) -> BTreeSet<FolderId> {
        match self {
            PendingCommand::SetFlag { targets, .. } | PendingCommand::Delete { targets } => {
                targets.iter().map(|t| t.folder).collect()
            }
            PendingCommand::Move { dst, targets } => targets
                .iter()
                .map(|t| t.source.folder)
                .chain(std::iter::once(*dst))
                .collect(),
            PendingCommand::Append { folder, .. }
            | PendingCommand::Expunge { folder }
            | PendingCommand::MarkAllAsRead { folder } => BTreeSet::from([*folder]),
        }
    }

    pub fn touches(&self, folder: FolderId) -> bool {
        self.folders().contains(&folder)
    }

    /// Local ids of the messages the command targets
    pub fn message_ids(&self) -> BTreeSet<LocalMessageId> {
        match self {
            PendingCommand::SetFlag { targets, .. } | PendingCommand::Delete { targets } => {
                targets.iter().map(|t| t.local_id).collect()
            }
            PendingCommand::Move { targets, .. } => {
                targets.iter().map(|t| t.source.local_id).collect()
            }
            PendingCommand::Append { local_id, .. } => BTreeSet::from([*local_id]),
            PendingCommand::Expunge { .. } | PendingCommand::MarkAllAsRead { .. } => {
                BTreeSet::new()
            }
        }
    }

    /// Message references whose remote ids can be filled in after replay
    pub(crate) fn refs_mut(&mut self) -> Vec<&mut MessageRef> {
        match self {
            PendingCommand::SetFlag { targets, .. } | PendingCommand::Delete { targets } => {
                targets.iter_mut().collect()
            }
            PendingCommand::Move { targets, .. } => {
                targets.iter_mut().map(|t| &mut t.source).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// A journal entry: the command plus its sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub sequence: SequenceId,
    pub command: PendingCommand,
}
