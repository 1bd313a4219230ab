//! Message query functions
//!
//! Store rows are merged with the account overlay, so pending local changes
//! show up before the store or the server reflect them.

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::models::{
    AccountId, EmailAddress, Flag, FlagSet, FolderId, LocalMessageId, Message, RemoteId, ThreadId,
};
use crate::overlay::{AccountOverlay, EntityId, OverlayField, OverlayValue};
use crate::registry::{AccountContext, AccountRegistry};
use crate::search::{CompiledQuery, SearchSpecification, compile};

/// A message as the UI should display it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: LocalMessageId,
    /// Folder the message is shown in, which may differ from the stored one
    /// while a move is pending
    pub folder_id: FolderId,
    pub thread_id: ThreadId,
    pub remote_id: RemoteId,
    pub flags: FlagSet,
    pub subject: String,
    pub from: Option<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub date: Option<DateTime<Utc>>,
    pub preview: String,
    pub size: u64,
    /// Whether the full body is available offline
    pub complete: bool,
}

impl MessageView {
    pub fn is_read(&self) -> bool {
        self.flags.contains(&Flag::Read)
    }

    pub fn is_flagged(&self) -> bool {
        self.flags.contains(&Flag::Flagged)
    }

    /// Not yet known to the server
    pub fn is_local_only(&self) -> bool {
        self.remote_id.is_placeholder()
    }
}

/// A search match and the account it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub account: AccountId,
    pub message: MessageView,
}

/// Merge overlay state into a stored message
///
/// Returns None for messages readers must not see: hidden ones and `\Deleted`
/// tombstones.
pub(crate) fn view_of(message: Message, overlay: &AccountOverlay) -> Option<MessageView> {
    if message.is_deleted()
        || overlay.is_hidden(EntityId::Message(message.id))
        || overlay.is_hidden(EntityId::Thread(message.thread_id))
    {
        return None;
    }

    let mut flags = message.flags;
    if let Some(OverlayValue::UpTo(newest)) = overlay.get_field_override(
        EntityId::Folder(message.folder_id),
        &OverlayField::Flag(Flag::Read),
    ) && message.id <= newest
    {
        flags.insert(Flag::Read);
    }

    let mut folder_id = message.folder_id;
    // Thread overrides first so message-level ones win
    for entity in [EntityId::Thread(message.thread_id), EntityId::Message(message.id)] {
        for (field, value) in overlay.overrides_for(entity) {
            match (field, value) {
                (OverlayField::Flag(flag), OverlayValue::Bool(true)) => {
                    flags.insert(flag);
                }
                (OverlayField::Flag(flag), OverlayValue::Bool(false)) => {
                    flags.remove(&flag);
                }
                (OverlayField::Folder, OverlayValue::Folder(folder)) => folder_id = folder,
                _ => {}
            }
        }
    }
    if flags.contains(&Flag::Deleted) {
        return None;
    }

    Some(MessageView {
        id: message.id,
        folder_id,
        thread_id: message.thread_id,
        remote_id: message.remote_id,
        flags,
        subject: message.subject,
        from: message.from,
        to: message.to,
        date: message.date,
        preview: message.preview,
        size: message.size,
        complete: message.complete,
    })
}

/// Visible messages matching `query`, newest first
pub(crate) fn visible_messages(
    context: &AccountContext,
    query: CompiledQuery,
) -> Result<Vec<MessageView>> {
    let mut views = Vec::new();
    for message in context.store.query_messages(query) {
        if let Some(view) = view_of(message?, &context.overlay) {
            views.push(view);
        }
    }
    sort_newest_first(&mut views);
    Ok(views)
}

fn sort_newest_first(views: &mut [MessageView]) {
    views.sort_by(|a, b| b.date.cmp(&a.date).then(b.id.cmp(&a.id)));
}

/// List the messages of a folder with pagination
///
/// Returns messages sorted by date descending (newest first).
///
/// # Arguments
/// * `context` - The account
/// * `folder` - The folder to list
/// * `limit` - Maximum number of messages to return
/// * `offset` - Number of messages to skip
pub fn list_messages(
    context: &AccountContext,
    folder: FolderId,
    limit: usize,
    offset: usize,
) -> Result<Vec<MessageView>> {
    let views = visible_messages(context, CompiledQuery::in_folder(folder))?;
    Ok(views
        .into_iter()
        .filter(|v| v.folder_id == folder)
        .skip(offset)
        .take(limit)
        .collect())
}

/// A single message, or None if it does not exist or is not visible
pub fn get_message_view(context: &AccountContext, id: LocalMessageId) -> Result<Option<MessageView>> {
    Ok(context
        .store
        .get_message(id)?
        .and_then(|message| view_of(message, &context.overlay)))
}

/// Run a search over every account named in `spec`
///
/// Accounts that are not open in the registry are skipped. Results from all
/// accounts are merged newest first.
pub fn search(registry: &AccountRegistry, spec: &SearchSpecification) -> Result<Vec<SearchHit>> {
    let query = compile(spec.conditions.as_ref())?;
    let mut hits = Vec::new();
    for account in &spec.accounts {
        let Some(context) = registry.get(*account) else {
            warn!("Search skipped unknown account {account}");
            continue;
        };
        hits.extend(
            visible_messages(&context, query.clone())?
                .into_iter()
                .map(|message| SearchHit {
                    account: *account,
                    message,
                }),
        );
    }
    hits.sort_by(|a, b| {
        b.message
            .date
            .cmp(&a.message.date)
            .then(b.message.id.cmp(&a.message.id))
    });
    Ok(hits)
}
