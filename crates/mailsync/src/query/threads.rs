//! Thread query functions

use std::collections::BTreeSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::messages::{MessageView, view_of, visible_messages};
use crate::models::{FolderId, ThreadId};
use crate::registry::AccountContext;
use crate::search::CompiledQuery;

/// Summary information for displaying a thread in a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub id: ThreadId,
    /// Subject of the oldest visible message
    pub subject: String,
    /// Preview of the newest visible message
    pub snippet: String,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: usize,
    pub sender_name: Option<String>,
    pub sender_email: Option<String>,
    pub is_unread: bool,
    pub is_flagged: bool,
}

impl ThreadSummary {
    /// None for a thread with no visible messages
    fn from_messages(id: ThreadId, messages: &[MessageView]) -> Option<Self> {
        let first = messages.first()?;
        let latest = messages.iter().max_by_key(|m| (m.date, m.id))?;
        Some(Self {
            id,
            subject: first.subject.clone(),
            snippet: latest.preview.clone(),
            last_message_at: latest.date,
            message_count: messages.len(),
            sender_name: latest.from.as_ref().and_then(|f| f.name.clone()),
            sender_email: latest.from.as_ref().map(|f| f.email.clone()),
            is_unread: messages.iter().any(|m| !m.is_read()),
            is_flagged: messages.iter().any(|m| m.is_flagged()),
        })
    }
}

/// Detailed thread information including all visible messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadDetail {
    pub summary: ThreadSummary,
    /// Messages ordered chronologically
    pub messages: Vec<MessageView>,
}

/// Visible messages of a thread, oldest first
fn thread_views(context: &AccountContext, thread: ThreadId) -> Result<Vec<MessageView>> {
    Ok(context
        .store
        .thread_messages(thread)?
        .into_iter()
        .filter_map(|m| view_of(m, &context.overlay))
        .collect())
}

/// List threads with a visible message in `folder`
///
/// Returns threads sorted by last_message_at descending (newest first). The
/// counts and flags cover the whole thread, across folders.
///
/// # Arguments
/// * `context` - The account
/// * `folder` - The folder to list
/// * `limit` - Maximum number of threads to return
/// * `offset` - Number of threads to skip
pub fn list_threads(
    context: &AccountContext,
    folder: FolderId,
    limit: usize,
    offset: usize,
) -> Result<Vec<ThreadSummary>> {
    let roots: BTreeSet<ThreadId> = visible_messages(context, CompiledQuery::in_folder(folder))?
        .into_iter()
        .filter(|view| view.folder_id == folder)
        .map(|view| view.thread_id)
        .collect();

    let mut summaries = Vec::with_capacity(roots.len());
    for thread in roots {
        let views = thread_views(context, thread)?;
        if let Some(summary) = ThreadSummary::from_messages(thread, &views) {
            summaries.push(summary);
        }
    }
    summaries.sort_by(|a, b| {
        b.last_message_at
            .cmp(&a.last_message_at)
            .then(b.id.cmp(&a.id))
    });
    Ok(summaries.into_iter().skip(offset).take(limit).collect())
}

/// Get a thread with all of its visible messages
///
/// # Arguments
/// * `context` - The account
/// * `thread_id` - The thread to fetch
pub fn get_thread_detail(context: &AccountContext, thread_id: ThreadId) -> Result<Option<ThreadDetail>> {
    let messages = thread_views(context, thread_id)?;
    Ok(ThreadSummary::from_messages(thread_id, &messages)
        .map(|summary| ThreadDetail { summary, messages }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::models::{Account, EmailAddress, Flag, LocalMessageId, MessageSummary};
    use crate::overlay::{EntityId, OverlayField, OverlayValue};
    use crate::registry::AccountRegistry;

    fn setup() -> (AccountRegistry, std::sync::Arc<AccountContext>, FolderId) {
        let registry = AccountRegistry::in_memory();
        let context = registry
            .open_account(Account::new("user@example.com", "imap://user@localhost"))
            .unwrap();
        let inbox = context.store.ensure_folder("INBOX", "Inbox").unwrap().id;
        let date = |day| Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap();
        let summaries = vec![
            MessageSummary::builder(1u64)
                .subject("Lunch")
                .message_id_header("<a@x>")
                .from(EmailAddress::with_name("Ann", "ann@example.com"))
                .date(date(1))
                .build(),
            MessageSummary::builder(2u64)
                .subject("Re: Lunch")
                .message_id_header("<b@x>")
                .in_reply_to("<a@x>")
                .from(EmailAddress::with_name("Bob", "bob@example.com"))
                .preview("Sounds good")
                .flag(Flag::Read)
                .date(date(2))
                .build(),
            MessageSummary::builder(3u64)
                .subject("Standup")
                .message_id_header("<c@x>")
                .date(date(3))
                .flag(Flag::Read)
                .build(),
        ];
        context.store.upsert_messages(inbox, &summaries).unwrap();
        (registry, context, inbox)
    }

    fn local(context: &AccountContext, folder: FolderId, uid: u64) -> LocalMessageId {
        context
            .store
            .find_message(folder, &uid.into())
            .unwrap()
            .unwrap()
            .id
    }

    #[test]
    fn test_list_threads_groups_replies() {
        let (_registry, context, inbox) = setup();
        let threads = list_threads(&context, inbox, 10, 0).unwrap();
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].subject, "Standup");
        assert_eq!(threads[1].subject, "Lunch");
        assert_eq!(threads[1].message_count, 2);
        assert_eq!(threads[1].snippet, "Sounds good");
        assert_eq!(threads[1].sender_name.as_deref(), Some("Bob"));
        assert!(threads[1].is_unread);
        assert!(!threads[0].is_unread);

        let page = list_threads(&context, inbox, 1, 1).unwrap();
        assert_eq!(page[0].subject, "Lunch");
    }

    #[test]
    fn test_thread_flag_override() {
        let (_registry, context, inbox) = setup();
        let root = local(&context, inbox, 1);
        let thread = context.store.get_message(root).unwrap().unwrap().thread_id;
        context.overlay.set_field_override(
            EntityId::Thread(thread),
            OverlayField::Flag(Flag::Read),
            OverlayValue::Bool(true),
        );
        let detail = get_thread_detail(&context, thread).unwrap().unwrap();
        assert!(!detail.summary.is_unread);
        assert_eq!(detail.messages.len(), 2);
        assert_eq!(detail.messages[0].subject, "Lunch");
    }

    #[test]
    fn test_hidden_thread_is_not_listed() {
        let (_registry, context, inbox) = setup();
        let standup = local(&context, inbox, 3);
        let thread = context.store.get_message(standup).unwrap().unwrap().thread_id;
        context.overlay.hide(&[EntityId::Thread(thread)]);
        let threads = list_threads(&context, inbox, 10, 0).unwrap();
        assert_eq!(threads.len(), 1);
        assert!(get_thread_detail(&context, thread).unwrap().is_none());
    }
}
