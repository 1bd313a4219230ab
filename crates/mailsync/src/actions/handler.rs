//! Action handler for user mutations
//!
//! Every action is applied in three steps:
//! 1. Record the change in the account overlay so readers see it at once
//! 2. Append the command to the pending journal (durable intent)
//! 3. Apply it to the local store
//!
//! The server catches up when the journal is drained. If step 2 or 3 fails,
//! the earlier steps are undone and the store is left untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use log::{debug, info, warn};

use crate::journal::{MessageRef, MoveTarget, PendingCommand, PendingCommandJournal, SequenceId};
use crate::models::{
    Flag, FlagSet, FolderId, LocalMessageId, Message, MessageSummary, RemoteId, ThreadId,
};
use crate::overlay::{AccountOverlay, EntityId, OverlayField, OverlayValue};
use crate::registry::AccountContext;
use crate::storage::{MailStore, StoreResult};

/// Overlay changes made by one action, kept so they can be undone
#[derive(Default)]
struct OverlayEdit {
    overrides: Vec<(EntityId, OverlayField, Option<OverlayValue>)>,
    hidden: Vec<EntityId>,
}

impl OverlayEdit {
    fn set(&mut self, overlay: &AccountOverlay, entity: EntityId, field: OverlayField, value: OverlayValue) {
        let previous = overlay.get_field_override(entity, &field);
        overlay.set_field_override(entity, field.clone(), value);
        self.overrides.push((entity, field, previous));
    }

    fn hide(&mut self, overlay: &AccountOverlay, ids: impl IntoIterator<Item = EntityId>) {
        let fresh: Vec<EntityId> = ids.into_iter().filter(|id| !overlay.is_hidden(*id)).collect();
        overlay.hide(&fresh);
        self.hidden.extend(fresh);
    }

    fn undo(self, overlay: &AccountOverlay) {
        for (entity, field, previous) in self.overrides.into_iter().rev() {
            match previous {
                Some(value) => overlay.set_field_override(entity, field, value),
                None => overlay.clear_field_override(entity, &field),
            }
        }
        overlay.unhide(&self.hidden);
    }
}

/// Handler for the mutations a user can make on one account
pub struct MailActions {
    store: Arc<dyn MailStore>,
    journal: Arc<PendingCommandJournal>,
    overlay: Arc<AccountOverlay>,
}

impl MailActions {
    pub fn new(context: &AccountContext) -> Self {
        Self {
            store: context.store.clone(),
            journal: context.journal.clone(),
            overlay: context.overlay.clone(),
        }
    }

    /// Live messages for `ids`; unknown ids and deleted rows are skipped
    fn load(&self, ids: &[LocalMessageId]) -> Result<Vec<Message>> {
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.get_message(*id)? {
                Some(message) if !message.is_deleted() => messages.push(message),
                Some(_) => debug!("Skipping deleted message {id}"),
                None => warn!("Skipping unknown message {id}"),
            }
        }
        Ok(messages)
    }

    /// Effective flag value: overlay first, then the store
    fn effective_flag(&self, message: &Message, flag: &Flag) -> bool {
        self.overlay
            .flag_override(message.id, message.thread_id, flag)
            .unwrap_or_else(|| message.has_flag(flag))
    }

    /// Journal `command`, then run `apply`; undo everything if either fails
    fn commit<T>(
        &self,
        edit: OverlayEdit,
        command: PendingCommand,
        apply: impl FnOnce() -> StoreResult<T>,
    ) -> Result<(SequenceId, T)> {
        let kind = command.kind();
        let sequence = match self.journal.enqueue(command) {
            Ok(sequence) => sequence,
            Err(e) => {
                edit.undo(&self.overlay);
                return Err(anyhow::Error::new(e).context(format!("Failed to queue {kind}")));
            }
        };
        match apply() {
            Ok(value) => Ok((sequence, value)),
            Err(e) => {
                edit.undo(&self.overlay);
                if let Err(retract_err) = self.journal.retract(sequence) {
                    warn!("Could not retract {kind} command {sequence}: {retract_err}");
                }
                Err(anyhow::Error::new(e).context(format!("Failed to apply {kind} locally")))
            }
        }
    }

    /// Set or clear a flag on messages
    ///
    /// Returns the number of messages whose stored flags changed.
    ///
    /// # Arguments
    /// * `ids` - Messages to change, in any folders
    /// * `flag` - The flag to set or clear
    /// * `value` - true to set, false to clear
    pub fn set_flag(&self, ids: &[LocalMessageId], flag: Flag, value: bool) -> Result<usize> {
        let messages = self.load(ids)?;
        if messages.is_empty() {
            return Ok(0);
        }

        let mut edit = OverlayEdit::default();
        let field = OverlayField::Flag(flag.clone());
        for message in &messages {
            edit.set(
                &self.overlay,
                EntityId::Message(message.id),
                field.clone(),
                OverlayValue::Bool(value),
            );
        }

        let command = PendingCommand::SetFlag {
            targets: refs(&messages),
            flag: flag.clone(),
            value,
        };
        let (_, changed) = self.commit(edit, command, || {
            let mut changed = 0;
            for (folder, ids) in by_folder(&messages) {
                changed += self.store.set_flags(folder, &ids, &flag, value)?.len();
            }
            Ok(changed)
        })?;

        info!(
            "Set {} to {value} on {} messages ({changed} changed)",
            flag.storage_name(),
            messages.len()
        );
        Ok(changed)
    }

    /// Set or clear a flag on every message of the given threads
    pub fn set_flag_for_threads(&self, threads: &[ThreadId], flag: Flag, value: bool) -> Result<usize> {
        let mut messages = Vec::new();
        for thread in threads {
            messages.extend(
                self.store
                    .thread_messages(*thread)?
                    .into_iter()
                    .filter(|m| !m.is_deleted()),
            );
        }
        if messages.is_empty() {
            return Ok(0);
        }

        let mut edit = OverlayEdit::default();
        let field = OverlayField::Flag(flag.clone());
        for thread in threads {
            edit.set(
                &self.overlay,
                EntityId::Thread(*thread),
                field.clone(),
                OverlayValue::Bool(value),
            );
        }
        for message in &messages {
            edit.set(
                &self.overlay,
                EntityId::Message(message.id),
                field.clone(),
                OverlayValue::Bool(value),
            );
        }

        let command = PendingCommand::SetFlag {
            targets: refs(&messages),
            flag: flag.clone(),
            value,
        };
        let (_, changed) = self.commit(edit, command, || {
            let mut changed = 0;
            for (folder, ids) in by_folder(&messages) {
                changed += self.store.set_flags(folder, &ids, &flag, value)?.len();
            }
            Ok(changed)
        })?;

        info!(
            "Set {} to {value} on {} threads ({changed} messages changed)",
            flag.storage_name(),
            threads.len()
        );
        Ok(changed)
    }

    /// Toggle a flag on messages
    ///
    /// If any message currently has the flag it is cleared on all of them,
    /// otherwise it is set. Returns the new value.
    pub fn toggle_flag(&self, ids: &[LocalMessageId], flag: Flag) -> Result<bool> {
        let messages = self.load(ids)?;
        if messages.is_empty() {
            return Ok(false);
        }
        let any_set = messages.iter().any(|m| self.effective_flag(m, &flag));
        let value = !any_set;
        let ids: Vec<LocalMessageId> = messages.iter().map(|m| m.id).collect();
        self.set_flag(&ids, flag, value)?;
        Ok(value)
    }

    /// Move messages from `src` to `dst`
    ///
    /// Moved messages keep their local ids and get placeholder server ids
    /// until the move is replayed. If any message is not in `src`, nothing
    /// moves and an error is returned.
    pub fn move_messages(&self, src: FolderId, ids: &[LocalMessageId], dst: FolderId) -> Result<usize> {
        if src == dst {
            return Ok(0);
        }
        if self.store.get_folder(dst)?.is_none() {
            bail!("Destination folder {dst} does not exist");
        }
        let messages = self.load(ids)?;
        if messages.is_empty() {
            return Ok(0);
        }

        let moves: Vec<(LocalMessageId, RemoteId)> = messages
            .iter()
            .map(|m| (m.id, RemoteId::placeholder()))
            .collect();

        let mut edit = OverlayEdit::default();
        for message in &messages {
            edit.set(
                &self.overlay,
                EntityId::Message(message.id),
                OverlayField::Folder,
                OverlayValue::Folder(dst),
            );
        }
        let entities: Vec<EntityId> = messages.iter().map(|m| EntityId::Message(m.id)).collect();
        edit.hide(&self.overlay, entities.iter().copied());

        let command = PendingCommand::Move {
            dst,
            targets: messages
                .iter()
                .zip(&moves)
                .map(|(message, (_, placeholder))| MoveTarget {
                    source: MessageRef::new(src, message.id, Some(message.remote_id.clone())),
                    placeholder: placeholder.clone(),
                })
                .collect(),
        };
        let (sequence, moved) =
            self.commit(edit, command, || self.store.relocate_messages(src, dst, &moves))?;

        // The store now shows the messages in `dst`
        self.overlay.unhide(&entities);
        info!(
            "Moved {} messages from folder {src} to {dst} (command {sequence})",
            moved.len()
        );
        Ok(moved.len())
    }

    /// Delete messages
    ///
    /// Rows are kept as `\Deleted` tombstones until the server confirms the
    /// delete; readers never see them.
    pub fn delete_messages(&self, ids: &[LocalMessageId]) -> Result<usize> {
        let messages = self.load(ids)?;
        if messages.is_empty() {
            return Ok(0);
        }

        let entities: Vec<EntityId> = messages.iter().map(|m| EntityId::Message(m.id)).collect();
        let mut edit = OverlayEdit::default();
        edit.hide(&self.overlay, entities.iter().copied());

        let command = PendingCommand::Delete {
            targets: refs(&messages),
        };
        self.commit(edit, command, || {
            for (folder, ids) in by_folder(&messages) {
                self.store.set_flags(folder, &ids, &Flag::Deleted, true)?;
            }
            Ok(())
        })?;

        self.overlay.unhide(&entities);
        info!("Deleted {} messages", messages.len());
        Ok(messages.len())
    }

    /// Mark every message of a folder as read
    pub fn mark_all_as_read(&self, folder: FolderId) -> Result<usize> {
        if self.store.get_folder(folder)?.is_none() {
            bail!("Folder {folder} does not exist");
        }

        let mut edit = OverlayEdit::default();
        let newest = self.store.folder_index(folder)?.iter().map(|e| e.id).max();
        if let Some(newest) = newest {
            edit.set(
                &self.overlay,
                EntityId::Folder(folder),
                OverlayField::Flag(Flag::Read),
                OverlayValue::UpTo(newest),
            );
        }

        let (_, changed) = self.commit(edit, PendingCommand::MarkAllAsRead { folder }, || {
            let unread: Vec<LocalMessageId> = self
                .store
                .folder_index(folder)?
                .into_iter()
                .filter(|e| !e.flags.contains(&Flag::Read))
                .map(|e| e.id)
                .collect();
            Ok(self.store.set_flags(folder, &unread, &Flag::Read, true)?.len())
        })?;

        info!("Marked {changed} messages read in folder {folder}");
        Ok(changed)
    }

    /// Permanently remove `\Deleted` messages of a folder on the server
    pub fn expunge(&self, folder: FolderId) -> Result<SequenceId> {
        if self.store.get_folder(folder)?.is_none() {
            bail!("Folder {folder} does not exist");
        }
        let (sequence, ()) = self.commit(
            OverlayEdit::default(),
            PendingCommand::Expunge { folder },
            || Ok(()),
        )?;
        info!("Queued expunge of folder {folder}");
        Ok(sequence)
    }

    /// Save a locally composed message (draft, sent copy) and queue its upload
    ///
    /// The row exists before the command is queued, since the command refers
    /// to it by local id; if queueing fails the row is removed again.
    ///
    /// # Arguments
    /// * `folder` - Folder to store the message in
    /// * `summary` - Header fields; its remote id is replaced by a placeholder
    /// * `content` - The raw message
    pub fn save_local_message(
        &self,
        folder: FolderId,
        mut summary: MessageSummary,
        content: &[u8],
    ) -> Result<LocalMessageId> {
        if self.store.get_folder(folder)?.is_none() {
            bail!("Folder {folder} does not exist");
        }
        summary.remote_id = RemoteId::placeholder();
        summary.flags.remove(&Flag::Deleted);
        if summary.size == 0 {
            summary.size = content.len() as u64;
        }

        self.store.upsert_messages(folder, std::slice::from_ref(&summary))?;
        let Some(message) = self.store.find_message(folder, &summary.remote_id)? else {
            bail!("Saved message vanished from folder {folder}");
        };
        let local_id = message.id;

        let saved = self
            .store
            .store_content(local_id, content, true)
            .map_err(anyhow::Error::from)
            .and_then(|()| {
                self.journal
                    .enqueue(PendingCommand::Append { folder, local_id })
                    .map_err(anyhow::Error::from)
            });
        if let Err(e) = saved {
            if let Err(cleanup) = self.store.destroy_messages(folder, &[local_id]) {
                warn!("Could not remove unsaved message {local_id}: {cleanup}");
            }
            return Err(e.context("Failed to save local message"));
        }

        info!("Saved local message {local_id} in folder {folder}");
        Ok(local_id)
    }
}

fn refs(messages: &[Message]) -> Vec<MessageRef> {
    messages
        .iter()
        .map(|m| MessageRef::new(m.folder_id, m.id, Some(m.remote_id.clone())))
        .collect()
}

fn by_folder(messages: &[Message]) -> BTreeMap<FolderId, Vec<LocalMessageId>> {
    let mut groups: BTreeMap<FolderId, Vec<LocalMessageId>> = BTreeMap::new();
    for message in messages {
        groups.entry(message.folder_id).or_default().push(message.id);
    }
    groups
}

/// Flags a freshly composed message starts with
pub fn draft_flags() -> FlagSet {
    FlagSet::from([Flag::Read, Flag::Draft])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Account;
    use crate::registry::AccountRegistry;

    struct Fixture {
        _registry: AccountRegistry,
        context: Arc<AccountContext>,
        actions: MailActions,
        inbox: FolderId,
        archive: FolderId,
    }

    fn fixture() -> Fixture {
        let registry = AccountRegistry::in_memory();
        let context = registry
            .open_account(Account::new("user@example.com", "imap://user@localhost"))
            .unwrap();
        let inbox = context.store.ensure_folder("INBOX", "Inbox").unwrap().id;
        let archive = context.store.ensure_folder("Archive", "Archive").unwrap().id;
        let summaries: Vec<MessageSummary> = (1..=3u64)
            .map(|uid| MessageSummary::builder(uid).subject(format!("Message {uid}")).build())
            .collect();
        context.store.upsert_messages(inbox, &summaries).unwrap();
        let actions = MailActions::new(&context);
        Fixture {
            _registry: registry,
            context,
            actions,
            inbox,
            archive,
        }
    }

    fn id(f: &Fixture, uid: u64) -> LocalMessageId {
        f.context
            .store
            .find_message(f.inbox, &RemoteId::from(uid))
            .unwrap()
            .unwrap()
            .id
    }

    #[test]
    fn test_set_flag_updates_overlay_journal_and_store() {
        let f = fixture();
        let one = id(&f, 1);
        let changed = f.actions.set_flag(&[one], Flag::Flagged, true).unwrap();
        assert_eq!(changed, 1);

        let message = f.context.store.get_message(one).unwrap().unwrap();
        assert!(message.has_flag(&Flag::Flagged));
        assert_eq!(
            f.context.overlay.flag_override(one, message.thread_id, &Flag::Flagged),
            Some(true)
        );
        let pending = f.context.journal.peek_pending(None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].command.kind(), "set_flag");
    }

    #[test]
    fn test_toggle_flag_clears_when_any_set() {
        let f = fixture();
        let (one, two) = (id(&f, 1), id(&f, 2));
        f.actions.set_flag(&[one], Flag::Flagged, true).unwrap();
        assert!(!f.actions.toggle_flag(&[one, two], Flag::Flagged).unwrap());
        assert!(f.actions.toggle_flag(&[one, two], Flag::Flagged).unwrap());
    }

    #[test]
    fn test_move_keeps_local_id_and_queues_placeholder() {
        let f = fixture();
        let one = id(&f, 1);
        assert_eq!(f.actions.move_messages(f.inbox, &[one], f.archive).unwrap(), 1);

        let message = f.context.store.get_message(one).unwrap().unwrap();
        assert_eq!(message.folder_id, f.archive);
        assert!(message.remote_id.is_placeholder());
        assert!(!f.context.overlay.is_hidden(EntityId::Message(one)));

        let pending = f.context.journal.peek_pending(None).unwrap();
        match &pending[0].command {
            PendingCommand::Move { dst, targets } => {
                assert_eq!(*dst, f.archive);
                assert_eq!(targets[0].placeholder, message.remote_id);
                assert_eq!(targets[0].source.remote_id, Some(RemoteId::from(1u64)));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_failed_move_leaves_no_trace() {
        let f = fixture();
        let one = id(&f, 1);
        // Message 1 is not in the archive, so the store refuses the move
        let result = f.actions.move_messages(f.archive, &[one], f.inbox);
        assert!(result.is_err());

        let message = f.context.store.get_message(one).unwrap().unwrap();
        assert_eq!(message.folder_id, f.inbox);
        assert_eq!(message.remote_id, RemoteId::from(1u64));
        assert!(f.context.journal.is_empty().unwrap());
        assert!(f.context.overlay.is_empty());
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let f = fixture();
        let two = id(&f, 2);
        assert_eq!(f.actions.delete_messages(&[two]).unwrap(), 1);
        let message = f.context.store.get_message(two).unwrap().unwrap();
        assert!(message.is_deleted());
        // Deleting again is a no-op
        assert_eq!(f.actions.delete_messages(&[two]).unwrap(), 0);
        assert_eq!(f.context.journal.peek_pending(None).unwrap().len(), 1);
    }

    #[test]
    fn test_mark_all_as_read() {
        let f = fixture();
        f.actions.set_flag(&[id(&f, 1)], Flag::Read, true).unwrap();
        assert_eq!(f.actions.mark_all_as_read(f.inbox).unwrap(), 2);
        assert_eq!(
            f.context.overlay.get_field_override(
                EntityId::Folder(f.inbox),
                &OverlayField::Flag(Flag::Read)
            ),
            Some(OverlayValue::UpTo(id(&f, 3)))
        );
        assert!(f.actions.mark_all_as_read(FolderId(999)).is_err());
    }

    #[test]
    fn test_mark_all_as_read_does_not_cover_later_arrivals() {
        let f = fixture();
        f.actions.mark_all_as_read(f.inbox).unwrap();
        f.context
            .store
            .upsert_messages(f.inbox, &[MessageSummary::builder(4u64).subject("Late").build()])
            .unwrap();

        let views = crate::query::list_messages(&f.context, f.inbox, 10, 0).unwrap();
        let unread: Vec<&str> = views
            .iter()
            .filter(|v| !v.is_read())
            .map(|v| v.subject.as_str())
            .collect();
        assert_eq!(unread, vec!["Late"]);
    }

    #[test]
    fn test_save_local_message_queues_append() {
        let f = fixture();
        let summary = MessageSummary::builder("ignored")
            .subject("Draft")
            .flags(draft_flags())
            .build();
        let local_id = f
            .actions
            .save_local_message(f.archive, summary, b"Subject: Draft\r\n\r\nHello")
            .unwrap();

        let message = f.context.store.get_message(local_id).unwrap().unwrap();
        assert!(message.remote_id.is_placeholder());
        assert!(message.has_flag(&Flag::Draft));
        assert_eq!(
            f.context.store.load_content(local_id).unwrap().unwrap(),
            b"Subject: Draft\r\n\r\nHello".to_vec()
        );
        let pending = f.context.journal.peek_pending(Some(f.archive)).unwrap();
        assert_eq!(
            pending[0].command,
            PendingCommand::Append {
                folder: f.archive,
                local_id
            }
        );
    }
}
