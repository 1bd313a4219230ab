//! Durable, ordered journal of local mutations

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use super::command::{JournalEntry, MessageRef, PendingCommand, SequenceId};
use crate::backend::{CommandReplayer, RemoteCommand, ReplayOutcome};
use crate::error::{StoreError, SyncError};
use crate::models::{Flag, FolderId, LocalMessageId, RemoteId};
use crate::overlay::{AccountOverlay, EntityId, OverlayField};
use crate::storage::{DroppedCommand, MailStore, StoreResult, StoredCommand};

/// Outcome of one drain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Commands the server confirmed (or was already in sync with)
    pub confirmed: Vec<SequenceId>,
    /// Commands dropped as inapplicable, with the reason
    pub failed_permanently: Vec<(SequenceId, String)>,
    /// Commands left for a later drain because of the folder filter
    pub deferred: Vec<SequenceId>,
    /// Set when draining stopped early; remaining commands stay queued
    pub halted: Option<SyncError>,
}

impl DrainReport {
    pub fn is_complete(&self) -> bool {
        self.halted.is_none()
    }
}

/// What pending commands say about one folder, for conflict resolution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingIndex {
    /// Local rows that must survive even if the server does not list them
    pub protected_local: HashSet<LocalMessageId>,
    /// Latest pending value of a flag on a message
    pub flag_overrides: HashMap<(LocalMessageId, Flag), bool>,
    /// Server ids that must not be re-added (pending move or delete source)
    pub suppressed_remote: HashSet<RemoteId>,
    /// A mark-all-as-read is pending for the folder
    pub mark_all_read: bool,
}

impl PendingIndex {
    /// Pending local value of `flag`, if any command will set it
    pub fn pending_flag(&self, id: LocalMessageId, flag: &Flag) -> Option<bool> {
        if let Some(value) = self.flag_overrides.get(&(id, flag.clone())) {
            return Some(*value);
        }
        (self.mark_all_read && *flag == Flag::Read).then_some(true)
    }
}

/// A server id assigned to a message that had a placeholder
#[derive(Debug, Clone)]
struct Remap {
    local_id: LocalMessageId,
    folder: FolderId,
    placeholder: RemoteId,
    new: RemoteId,
}

enum EntryResult {
    Confirmed(Vec<Remap>),
    Dropped(String),
    Halted(SyncError),
}

/// The pending command journal of one account
///
/// Commands are persisted in the account's store before `enqueue` returns and
/// are replayed strictly in enqueue order. A command leaves the journal only
/// when the server confirms it or it is proven permanently inapplicable.
pub struct PendingCommandJournal {
    store: Arc<dyn MailStore>,
    overlay: Arc<AccountOverlay>,
    /// Serializes read-modify-write of journal rows
    write_lock: Mutex<()>,
    /// At most one drain at a time
    drain_lock: Mutex<()>,
}

fn decode(row: &StoredCommand) -> Result<JournalEntry, StoreError> {
    let command = serde_json::from_str(&row.payload)?;
    Ok(JournalEntry {
        sequence: row.sequence,
        command,
    })
}

fn encode(command: &PendingCommand) -> Result<String, StoreError> {
    serde_json::to_string(command)
        .map_err(|e| StoreError::DataCorruption(format!("unencodable command: {e}")))
}

impl PendingCommandJournal {
    pub fn new(store: Arc<dyn MailStore>, overlay: Arc<AccountOverlay>) -> Self {
        Self {
            store,
            overlay,
            write_lock: Mutex::new(()),
            drain_lock: Mutex::new(()),
        }
    }

    /// Decoded entries in sequence order; undecodable rows are skipped
    fn entries(&self) -> StoreResult<Vec<JournalEntry>> {
        let rows = self.store.pending_commands()?;
        Ok(rows
            .iter()
            .filter_map(|row| match decode(row) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping undecodable pending command {}: {e}", row.sequence);
                    None
                }
            })
            .collect())
    }

    /// Durably append a command
    ///
    /// A delete of a message with an earlier unconfirmed move is redirected to
    /// the move's destination, with the server id resolved at replay time.
    pub fn enqueue(&self, command: PendingCommand) -> StoreResult<SequenceId> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let pending = self.entries()?;
        let command = redirect_after_moves(command, &pending);
        let sequence = self.store.insert_pending_command(&encode(&command)?)?;
        debug!("Enqueued {} command {sequence}", command.kind());
        Ok(sequence)
    }

    /// Withdraw a command whose local half could not be applied
    ///
    /// Returns false if the command already left the journal.
    pub fn retract(&self, sequence: SequenceId) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if !self
            .store
            .pending_commands()?
            .iter()
            .any(|row| row.sequence == sequence)
        {
            return Ok(false);
        }
        self.store.remove_pending_command(sequence)?;
        debug!("Retracted pending command {sequence}");
        Ok(true)
    }

    /// Pending commands, in order, optionally only those touching `folder`
    pub fn peek_pending(&self, folder: Option<FolderId>) -> StoreResult<Vec<JournalEntry>> {
        let entries = self.entries()?;
        Ok(match folder {
            Some(f) => entries.into_iter().filter(|e| e.command.touches(f)).collect(),
            None => entries,
        })
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.store.pending_commands()?.is_empty())
    }

    pub fn dropped(&self) -> StoreResult<Vec<DroppedCommand>> {
        self.store.dropped_commands()
    }

    /// Summarize pending intent for `folder`
    pub fn pending_index(&self, folder: FolderId) -> StoreResult<PendingIndex> {
        let mut index = PendingIndex::default();
        for entry in self.entries()? {
            match &entry.command {
                PendingCommand::SetFlag {
                    targets,
                    flag,
                    value,
                } => {
                    for target in targets.iter().filter(|t| t.folder == folder) {
                        index
                            .flag_overrides
                            .insert((target.local_id, flag.clone()), *value);
                    }
                }
                PendingCommand::Move { dst, targets } => {
                    for target in targets {
                        if target.source.folder == folder
                            && let Some(remote_id) = &target.source.remote_id
                        {
                            index.suppressed_remote.insert(remote_id.clone());
                        }
                        if *dst == folder {
                            index.protected_local.insert(target.source.local_id);
                        }
                    }
                }
                PendingCommand::Delete { targets } => {
                    for target in targets.iter().filter(|t| t.folder == folder) {
                        index.protected_local.insert(target.local_id);
                        index
                            .flag_overrides
                            .insert((target.local_id, Flag::Deleted), true);
                        if let Some(remote_id) = self.resolve_remote_id(target)? {
                            index.suppressed_remote.insert(remote_id);
                        }
                    }
                }
                PendingCommand::Append {
                    folder: target,
                    local_id,
                } if *target == folder => {
                    index.protected_local.insert(*local_id);
                }
                PendingCommand::MarkAllAsRead { folder: target } if *target == folder => {
                    index.flag_overrides.retain(|(_, flag), _| *flag != Flag::Read);
                    index.mark_all_read = true;
                }
                _ => {}
            }
        }
        Ok(index)
    }

    /// Replay pending commands through `replayer`
    ///
    /// With a folder filter, commands not touching that folder are deferred,
    /// and so is any later command sharing a message with a deferred one.
    /// A transient or authentication failure stops the drain.
    pub fn drain(
        &self,
        replayer: &mut dyn CommandReplayer,
        folder_filter: Option<FolderId>,
    ) -> DrainReport {
        let _drain = self.drain_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut report = DrainReport::default();

        let rows = match self.store.pending_commands() {
            Ok(rows) => rows,
            Err(e) => {
                report.halted = Some(e.into());
                return report;
            }
        };

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            match decode(row) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    let reason = format!("undecodable command: {e}");
                    if let Err(e) = self.store.record_dropped_command(row.sequence, &reason) {
                        report.halted = Some(e.into());
                        return report;
                    }
                    report.failed_permanently.push((row.sequence, reason));
                }
            }
        }

        let mut deferred_messages: BTreeSet<LocalMessageId> = BTreeSet::new();
        for i in 0..entries.len() {
            let entry = entries[i].clone();

            if let Some(folder) = folder_filter {
                let ids = entry.command.message_ids();
                if !entry.command.touches(folder) || !ids.is_disjoint(&deferred_messages) {
                    deferred_messages.extend(ids);
                    report.deferred.push(entry.sequence);
                    continue;
                }
            }

            match self.replay_entry(replayer, &entry) {
                EntryResult::Confirmed(remaps) => {
                    if let Err(e) = self.apply_remaps(&remaps, &mut entries[i + 1..]) {
                        report.halted = Some(e.into());
                        break;
                    }
                    self.confirm_effects(&entry, &remaps, &entries[i + 1..]);
                    if let Err(e) = self.store.remove_pending_command(entry.sequence) {
                        report.halted = Some(e.into());
                        break;
                    }
                    debug!("Confirmed {} command {}", entry.command.kind(), entry.sequence);
                    report.confirmed.push(entry.sequence);
                }
                EntryResult::Dropped(reason) => {
                    warn!(
                        "Dropping {} command {}: {reason}",
                        entry.command.kind(),
                        entry.sequence
                    );
                    if let Err(e) = self.store.record_dropped_command(entry.sequence, &reason) {
                        report.halted = Some(e.into());
                        break;
                    }
                    self.clear_overlay_for(&entry.command);
                    report.failed_permanently.push((entry.sequence, reason));
                }
                EntryResult::Halted(error) => {
                    info!(
                        "Pending command {} not replayed, will retry: {error}",
                        entry.sequence
                    );
                    report.halted = Some(error);
                    break;
                }
            }
        }

        report
    }

    fn server_id(&self, folder: FolderId) -> StoreResult<Option<String>> {
        Ok(self.store.get_folder(folder)?.map(|f| f.server_id))
    }

    /// Server id of a target: recorded at enqueue, or looked up now
    fn resolve_remote_id(&self, target: &MessageRef) -> StoreResult<Option<RemoteId>> {
        if let Some(id) = &target.remote_id {
            return Ok(Some(id.clone()));
        }
        Ok(self
            .store
            .get_message(target.local_id)?
            .filter(|m| m.folder_id == target.folder && !m.remote_id.is_placeholder())
            .map(|m| m.remote_id))
    }

    /// Group resolvable targets by folder, keeping the resolved id with each
    fn group_targets<'a, T>(
        &self,
        targets: impl IntoIterator<Item = (&'a MessageRef, T)>,
    ) -> StoreResult<BTreeMap<FolderId, Vec<(RemoteId, T)>>> {
        let mut groups: BTreeMap<FolderId, Vec<(RemoteId, T)>> = BTreeMap::new();
        for (target, extra) in targets {
            match self.resolve_remote_id(target)? {
                Some(remote_id) => groups.entry(target.folder).or_default().push((remote_id, extra)),
                None => debug!("Message {} has no server id yet, skipping", target.local_id),
            }
        }
        Ok(groups)
    }

    fn replay_entry(&self, replayer: &mut dyn CommandReplayer, entry: &JournalEntry) -> EntryResult {
        match self.resolve_and_replay(replayer, &entry.command) {
            Ok(result) => result,
            Err(e) => EntryResult::Halted(e.into()),
        }
    }

    fn resolve_and_replay(
        &self,
        replayer: &mut dyn CommandReplayer,
        command: &PendingCommand,
    ) -> StoreResult<EntryResult> {
        let mut outcomes = Vec::new();
        let mut remaps = Vec::new();

        match command {
            PendingCommand::SetFlag {
                targets,
                flag,
                value,
            } => {
                let groups = self.group_targets(targets.iter().map(|t| (t, ())))?;
                for (folder, items) in groups {
                    let Some(server_id) = self.server_id(folder)? else {
                        outcomes.push(ReplayOutcome::PermanentFailure(format!("folder {folder} was removed")));
                        continue;
                    };
                    outcomes.push(replayer.replay(&RemoteCommand::SetFlag {
                        folder: server_id,
                        ids: items.into_iter().map(|(id, _)| id).collect(),
                        flag: flag.clone(),
                        value: *value,
                    }));
                }
            }
            PendingCommand::Delete { targets } => {
                let groups = self.group_targets(targets.iter().map(|t| (t, ())))?;
                for (folder, items) in groups {
                    let Some(server_id) = self.server_id(folder)? else {
                        outcomes.push(ReplayOutcome::PermanentFailure(format!("folder {folder} was removed")));
                        continue;
                    };
                    outcomes.push(replayer.replay(&RemoteCommand::Delete {
                        folder: server_id,
                        ids: items.into_iter().map(|(id, _)| id).collect(),
                    }));
                }
            }
            PendingCommand::Move { dst, targets } => {
                let Some(dst_server_id) = self.server_id(*dst)? else {
                    return Ok(EntryResult::Dropped(format!("destination folder {dst} was removed")));
                };
                let groups = self.group_targets(targets.iter().map(|t| (&t.source, t)))?;
                for (folder, items) in groups {
                    let Some(server_id) = self.server_id(folder)? else {
                        outcomes.push(ReplayOutcome::PermanentFailure(format!("folder {folder} was removed")));
                        continue;
                    };
                    let outcome = replayer.replay(&RemoteCommand::Move {
                        src: server_id,
                        dst: dst_server_id.clone(),
                        ids: items.iter().map(|(id, _)| id.clone()).collect(),
                    });
                    if let ReplayOutcome::Applied(map) = &outcome {
                        for (old, target) in &items {
                            if let Some(new) = map.get(old) {
                                remaps.push(Remap {
                                    local_id: target.source.local_id,
                                    folder: *dst,
                                    placeholder: target.placeholder.clone(),
                                    new: new.clone(),
                                });
                            }
                        }
                    }
                    outcomes.push(outcome);
                }
            }
            PendingCommand::Append { folder, local_id } => {
                let Some(server_id) = self.server_id(*folder)? else {
                    return Ok(EntryResult::Dropped(format!("folder {folder} was removed")));
                };
                let Some(message) = self.store.get_message(*local_id)? else {
                    return Ok(EntryResult::Dropped(format!("message {local_id} no longer exists")));
                };
                if !message.remote_id.is_placeholder() {
                    return Ok(EntryResult::Confirmed(Vec::new()));
                }
                let Some(content) = self.store.load_content(*local_id)? else {
                    return Ok(EntryResult::Dropped(format!("message {local_id} has no content")));
                };
                let outcome = replayer.replay(&RemoteCommand::Append {
                    folder: server_id,
                    placeholder: message.remote_id.clone(),
                    content,
                    flags: message.flags.clone(),
                });
                if let ReplayOutcome::Applied(map) = &outcome
                    && let Some(new) = map.get(&message.remote_id)
                {
                    remaps.push(Remap {
                        local_id: *local_id,
                        folder: message.folder_id,
                        placeholder: message.remote_id.clone(),
                        new: new.clone(),
                    });
                }
                outcomes.push(outcome);
            }
            PendingCommand::Expunge { folder } | PendingCommand::MarkAllAsRead { folder } => {
                let Some(server_id) = self.server_id(*folder)? else {
                    return Ok(EntryResult::Dropped(format!("folder {folder} was removed")));
                };
                let remote = match command {
                    PendingCommand::Expunge { .. } => RemoteCommand::Expunge { folder: server_id },
                    _ => RemoteCommand::MarkAllAsRead { folder: server_id },
                };
                outcomes.push(replayer.replay(&remote));
            }
        }

        Ok(combine(outcomes, remaps))
    }

    /// Record server-assigned ids locally and in later commands
    fn apply_remaps(&self, remaps: &[Remap], later: &mut [JournalEntry]) -> StoreResult<()> {
        if remaps.is_empty() {
            return Ok(());
        }
        for remap in remaps {
            if !self
                .store
                .change_remote_id(remap.local_id, &remap.placeholder, &remap.new)?
            {
                debug!(
                    "Message {} moved on before server id {} arrived",
                    remap.local_id, remap.new
                );
            }
        }

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        for entry in later.iter_mut() {
            let mut changed = false;
            for target in entry.command.refs_mut() {
                for remap in remaps {
                    if target.local_id == remap.local_id
                        && target.folder == remap.folder
                        && target.remote_id.is_none()
                    {
                        target.remote_id = Some(remap.new.clone());
                        changed = true;
                    }
                }
            }
            if changed {
                self.store
                    .update_pending_command(entry.sequence, &encode(&entry.command)?)?;
            }
        }
        Ok(())
    }

    /// Local follow-up once the server has confirmed a command
    fn confirm_effects(&self, entry: &JournalEntry, remaps: &[Remap], later: &[JournalEntry]) {
        let result: StoreResult<()> = (|| {
            match &entry.command {
                PendingCommand::Delete { targets } => {
                    let mut by_folder: BTreeMap<FolderId, Vec<LocalMessageId>> = BTreeMap::new();
                    for target in targets {
                        by_folder.entry(target.folder).or_default().push(target.local_id);
                    }
                    for (folder, ids) in by_folder {
                        self.store.destroy_messages(folder, &ids)?;
                    }
                }
                PendingCommand::Expunge { folder } => {
                    let still_pending: BTreeSet<LocalMessageId> =
                        later.iter().flat_map(|e| e.command.message_ids()).collect();
                    let tombstones: Vec<LocalMessageId> = self
                        .store
                        .folder_index(*folder)?
                        .into_iter()
                        .filter(|e| e.flags.contains(&Flag::Deleted) && !still_pending.contains(&e.id))
                        .map(|e| e.id)
                        .collect();
                    self.store.destroy_messages(*folder, &tombstones)?;
                }
                _ => {}
            }
            Ok(())
        })();
        if let Err(e) = result {
            warn!("Local cleanup after command {} failed: {e}", entry.sequence);
        }
        if !remaps.is_empty() {
            debug!("Command {} assigned {} server ids", entry.sequence, remaps.len());
        }
        self.clear_overlay_for(&entry.command);
    }

    /// Overrides for a settled command are no longer needed
    fn clear_overlay_for(&self, command: &PendingCommand) {
        match command {
            PendingCommand::SetFlag { targets, flag, .. } => {
                let field = OverlayField::Flag(flag.clone());
                for target in targets {
                    self.overlay
                        .clear_field_override(EntityId::Message(target.local_id), &field);
                    if let Ok(Some(message)) = self.store.get_message(target.local_id) {
                        self.overlay
                            .clear_field_override(EntityId::Thread(message.thread_id), &field);
                    }
                }
            }
            PendingCommand::Move { targets, .. } => {
                for target in targets {
                    let entity = EntityId::Message(target.source.local_id);
                    self.overlay.clear_field_override(entity, &OverlayField::Folder);
                    self.overlay.unhide(&[entity]);
                }
            }
            PendingCommand::Delete { targets } => {
                let ids: Vec<EntityId> = targets
                    .iter()
                    .map(|t| EntityId::Message(t.local_id))
                    .collect();
                self.overlay.unhide(&ids);
            }
            PendingCommand::MarkAllAsRead { folder } => {
                self.overlay
                    .clear_field_override(EntityId::Folder(*folder), &OverlayField::Flag(Flag::Read));
            }
            PendingCommand::Append { .. } | PendingCommand::Expunge { .. } => {}
        }
    }
}

/// Fold per-folder outcomes into one verdict for the command
fn combine(outcomes: Vec<ReplayOutcome>, remaps: Vec<Remap>) -> EntryResult {
    if outcomes.is_empty() {
        return EntryResult::Dropped("no target has a server id".to_string());
    }
    let mut succeeded = false;
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            ReplayOutcome::Applied(_) | ReplayOutcome::AlreadyApplied => succeeded = true,
            ReplayOutcome::PermanentFailure(reason) => failures.push(reason),
            ReplayOutcome::TransientFailure(error) => return EntryResult::Halted(error.into()),
        }
    }
    if failures.is_empty() {
        EntryResult::Confirmed(remaps)
    } else if succeeded {
        warn!("Command partially applied: {}", failures.join("; "));
        EntryResult::Confirmed(remaps)
    } else {
        EntryResult::Dropped(failures.join("; "))
    }
}

/// Point deletes of moved messages at the move's destination
fn redirect_after_moves(mut command: PendingCommand, pending: &[JournalEntry]) -> PendingCommand {
    if let PendingCommand::Delete { targets } = &mut command {
        for target in targets.iter_mut() {
            let destination = pending.iter().rev().find_map(|entry| match &entry.command {
                PendingCommand::Move { dst, targets }
                    if targets.iter().any(|m| m.source.local_id == target.local_id) =>
                {
                    Some(*dst)
                }
                _ => None,
            });
            if let Some(dst) = destination {
                debug!(
                    "Delete of message {} follows its pending move to folder {dst}",
                    target.local_id
                );
                target.folder = dst;
                target.remote_id = None;
            }
        }
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::journal::MoveTarget;
    use crate::models::MessageSummary;
    use crate::storage::SqliteMailStore;

    /// Replayer that records commands and answers from a script
    #[derive(Default)]
    struct ScriptedReplayer {
        seen: Vec<RemoteCommand>,
        answers: Vec<ReplayOutcome>,
    }

    impl CommandReplayer for ScriptedReplayer {
        fn replay(&mut self, command: &RemoteCommand) -> ReplayOutcome {
            self.seen.push(command.clone());
            if self.answers.is_empty() {
                ReplayOutcome::Applied(Default::default())
            } else {
                self.answers.remove(0)
            }
        }
    }

    struct Fixture {
        store: Arc<SqliteMailStore>,
        journal: PendingCommandJournal,
        inbox: FolderId,
        archive: FolderId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteMailStore::open_in_memory().unwrap());
        let inbox = store.ensure_folder("INBOX", "Inbox").unwrap().id;
        let archive = store.ensure_folder("Archive", "Archive").unwrap().id;
        let summaries: Vec<_> = (1..=3u64).map(|i| MessageSummary::builder(i).build()).collect();
        store.upsert_messages(inbox, &summaries).unwrap();
        let journal = PendingCommandJournal::new(store.clone(), Arc::new(AccountOverlay::new()));
        Fixture {
            store,
            journal,
            inbox,
            archive,
        }
    }

    fn local(f: &Fixture, uid: u64) -> LocalMessageId {
        f.store
            .find_message(f.inbox, &RemoteId::from(uid))
            .unwrap()
            .unwrap()
            .id
    }

    fn flag_cmd(f: &Fixture, uid: u64, value: bool) -> PendingCommand {
        PendingCommand::SetFlag {
            targets: vec![MessageRef::new(f.inbox, local(f, uid), Some(RemoteId::from(uid)))],
            flag: Flag::Read,
            value,
        }
    }

    #[test]
    fn test_drain_replays_in_enqueue_order() {
        let f = fixture();
        let a = f.journal.enqueue(flag_cmd(&f, 1, true)).unwrap();
        let b = f.journal.enqueue(flag_cmd(&f, 2, true)).unwrap();
        let c = f.journal.enqueue(flag_cmd(&f, 1, false)).unwrap();

        let mut replayer = ScriptedReplayer::default();
        let report = f.journal.drain(&mut replayer, None);
        assert_eq!(report.confirmed, vec![a, b, c]);
        assert!(report.is_complete());
        let values: Vec<bool> = replayer
            .seen
            .iter()
            .map(|c| match c {
                RemoteCommand::SetFlag { value, .. } => *value,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(values, vec![true, true, false]);
        assert!(f.journal.is_empty().unwrap());
    }

    #[test]
    fn test_transient_failure_halts_and_keeps_order() {
        let f = fixture();
        let a = f.journal.enqueue(flag_cmd(&f, 1, true)).unwrap();
        let b = f.journal.enqueue(flag_cmd(&f, 2, true)).unwrap();

        let mut replayer = ScriptedReplayer {
            answers: vec![ReplayOutcome::TransientFailure(RemoteError::network("reset"))],
            ..Default::default()
        };
        let report = f.journal.drain(&mut replayer, None);
        assert!(matches!(report.halted, Some(SyncError::TransientNetwork(_))));
        assert!(report.confirmed.is_empty());
        assert_eq!(replayer.seen.len(), 1);

        let pending: Vec<SequenceId> = f
            .journal
            .peek_pending(None)
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(pending, vec![a, b]);
    }

    #[test]
    fn test_permanent_failure_drops_and_continues() {
        let f = fixture();
        let a = f.journal.enqueue(flag_cmd(&f, 1, true)).unwrap();
        let b = f.journal.enqueue(flag_cmd(&f, 2, true)).unwrap();

        let mut replayer = ScriptedReplayer {
            answers: vec![ReplayOutcome::PermanentFailure("flag not permitted".into())],
            ..Default::default()
        };
        let report = f.journal.drain(&mut replayer, None);
        assert_eq!(report.failed_permanently, vec![(a, "flag not permitted".to_string())]);
        assert_eq!(report.confirmed, vec![b]);
        let dropped = f.journal.dropped().unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].sequence, a);
    }

    #[test]
    fn test_already_applied_counts_as_success() {
        let f = fixture();
        let a = f.journal.enqueue(flag_cmd(&f, 1, true)).unwrap();
        let mut replayer = ScriptedReplayer {
            answers: vec![ReplayOutcome::AlreadyApplied],
            ..Default::default()
        };
        assert_eq!(f.journal.drain(&mut replayer, None).confirmed, vec![a]);
    }

    #[test]
    fn test_folder_filter_defers_dependent_commands() {
        let f = fixture();
        let id = local(&f, 1);
        let moved = f.store.move_messages(f.inbox, f.archive, &[id]).unwrap();
        let other = f.store.ensure_folder("Other", "Other").unwrap().id;

        // Touches only "Other": deferred when draining INBOX
        let unrelated = f
            .journal
            .enqueue(PendingCommand::Expunge { folder: other })
            .unwrap();
        let mv = f
            .journal
            .enqueue(PendingCommand::Move {
                dst: f.archive,
                targets: vec![MoveTarget {
                    source: MessageRef::new(f.inbox, id, Some(RemoteId::from(1u64))),
                    placeholder: moved[0].new_remote_id.clone(),
                }],
            })
            .unwrap();
        let flag = f.journal.enqueue(flag_cmd(&f, 2, true)).unwrap();

        let mut replayer = ScriptedReplayer::default();
        let report = f.journal.drain(&mut replayer, Some(f.inbox));
        assert_eq!(report.deferred, vec![unrelated]);
        assert_eq!(report.confirmed, vec![mv, flag]);
    }

    #[test]
    fn test_folder_filter_never_reorders_a_message() {
        let f = fixture();
        let id = local(&f, 1);
        let other = f.store.ensure_folder("Other", "Other").unwrap().id;
        // First command on the message lives in another folder's scope
        let first = f
            .journal
            .enqueue(PendingCommand::SetFlag {
                targets: vec![MessageRef::new(other, id, Some(RemoteId::from(1u64)))],
                flag: Flag::Flagged,
                value: true,
            })
            .unwrap();
        let second = f.journal.enqueue(flag_cmd(&f, 1, true)).unwrap();

        let mut replayer = ScriptedReplayer::default();
        let report = f.journal.drain(&mut replayer, Some(f.inbox));
        assert_eq!(report.deferred, vec![first, second]);
        assert!(replayer.seen.is_empty());
    }

    #[test]
    fn test_delete_after_move_is_redirected() {
        let f = fixture();
        let id = local(&f, 1);
        let moved = f.store.move_messages(f.inbox, f.archive, &[id]).unwrap();
        f.journal
            .enqueue(PendingCommand::Move {
                dst: f.archive,
                targets: vec![MoveTarget {
                    source: MessageRef::new(f.inbox, id, Some(RemoteId::from(1u64))),
                    placeholder: moved[0].new_remote_id.clone(),
                }],
            })
            .unwrap();
        // Caller still thinks the message is in INBOX under UID 1
        f.journal
            .enqueue(PendingCommand::Delete {
                targets: vec![MessageRef::new(f.inbox, id, Some(RemoteId::from(1u64)))],
            })
            .unwrap();

        let pending = f.journal.peek_pending(None).unwrap();
        match &pending[1].command {
            PendingCommand::Delete { targets } => {
                assert_eq!(targets[0].folder, f.archive);
                assert_eq!(targets[0].remote_id, None);
            }
            other => panic!("unexpected {other:?}"),
        }

        // The move's UID map reaches the delete
        let mut replayer = ScriptedReplayer {
            answers: vec![ReplayOutcome::Applied(UidMapBuilder::one(1, 500))],
            ..Default::default()
        };
        let report = f.journal.drain(&mut replayer, None);
        assert_eq!(report.confirmed.len(), 2);
        assert_eq!(
            replayer.seen[1],
            RemoteCommand::Delete {
                folder: "Archive".to_string(),
                ids: vec![RemoteId::from(500u64)],
            }
        );
        assert!(f.store.get_message(id).unwrap().is_none());
    }

    #[test]
    fn test_move_uid_written_to_local_row() {
        let f = fixture();
        let id = local(&f, 2);
        let moved = f.store.move_messages(f.inbox, f.archive, &[id]).unwrap();
        f.journal
            .enqueue(PendingCommand::Move {
                dst: f.archive,
                targets: vec![MoveTarget {
                    source: MessageRef::new(f.inbox, id, Some(RemoteId::from(2u64))),
                    placeholder: moved[0].new_remote_id.clone(),
                }],
            })
            .unwrap();

        let mut replayer = ScriptedReplayer {
            answers: vec![ReplayOutcome::Applied(UidMapBuilder::one(2, 41))],
            ..Default::default()
        };
        f.journal.drain(&mut replayer, None);
        let row = f.store.get_message(id).unwrap().unwrap();
        assert_eq!(row.remote_id, RemoteId::from(41u64));
        assert_eq!(row.folder_id, f.archive);
    }

    #[test]
    fn test_pending_index() {
        let f = fixture();
        let one = local(&f, 1);
        let two = local(&f, 2);
        f.journal.enqueue(flag_cmd(&f, 1, true)).unwrap();
        f.journal
            .enqueue(PendingCommand::Delete {
                targets: vec![MessageRef::new(f.inbox, two, None)],
            })
            .unwrap();

        let index = f.journal.pending_index(f.inbox).unwrap();
        assert_eq!(index.pending_flag(one, &Flag::Read), Some(true));
        assert_eq!(index.pending_flag(two, &Flag::Read), None);
        assert!(index.protected_local.contains(&two));
        assert!(index.suppressed_remote.contains(&RemoteId::from(2u64)));
        assert_eq!(index.pending_flag(two, &Flag::Deleted), Some(true));

        f.journal
            .enqueue(PendingCommand::MarkAllAsRead { folder: f.inbox })
            .unwrap();
        let index = f.journal.pending_index(f.inbox).unwrap();
        assert_eq!(index.pending_flag(two, &Flag::Read), Some(true));
        assert!(f.journal.pending_index(f.archive).unwrap().flag_overrides.is_empty());
    }

    #[test]
    fn test_removed_folder_drops_command() {
        let f = fixture();
        let seq = f.journal.enqueue(flag_cmd(&f, 1, true)).unwrap();
        let scratch = f.store.ensure_folder("Scratch", "Scratch").unwrap().id;
        f.store.remove_folder(scratch).unwrap();
        let gone = f
            .journal
            .enqueue(PendingCommand::Expunge { folder: scratch })
            .unwrap();

        let mut replayer = ScriptedReplayer::default();
        let report = f.journal.drain(&mut replayer, None);
        assert_eq!(report.confirmed, vec![seq]);
        assert_eq!(report.failed_permanently.len(), 1);
        assert_eq!(report.failed_permanently[0].0, gone);
    }

    struct UidMapBuilder;

    impl UidMapBuilder {
        fn one(old: u64, new: u64) -> crate::backend::UidMap {
            crate::backend::UidMap::from([(RemoteId::from(old), RemoteId::from(new))])
        }
    }
}
