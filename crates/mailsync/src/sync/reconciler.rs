//! Folder reconciliation
//!
//! One invocation walks a fixed sequence of phases:
//!
//! `Idle → DrainingPending → FetchingRemoteSummary → Diffing → ApplyingChanges
//!  → FetchingMissingContent → Done`
//!
//! Any phase can end in `ErrorAborted`. Whatever was committed before the
//! failure stays committed; the watermark only moves with a committed diff.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{debug, info, warn};

use super::diff::{FolderChanges, compute_diff};
use crate::backend::{ListingRequest, RemoteListing, RemoteSession, SyncListener};
use crate::config::SyncConfig;
use crate::error::{StoreError, SyncError};
use crate::journal::PendingCommandJournal;
use crate::models::{Folder, FolderId, FolderSyncState, LocalMessageId, RemoteId};
use crate::overlay::{AccountOverlay, EntityId};
use crate::storage::{FolderDiff, LocalEntry, MailStore};

/// Phase of a folder sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    DrainingPending,
    FetchingRemoteSummary,
    Diffing,
    ApplyingChanges,
    FetchingMissingContent,
    Done,
    ErrorAborted,
}

/// Statistics from a folder sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// New messages stored
    pub added: usize,
    /// Messages whose flags changed
    pub updated: usize,
    /// Messages removed locally
    pub removed: usize,
    /// Bodies downloaded completely
    pub content_fetched: usize,
    /// Bodies left partial (size limit, metered network, fetch failure)
    pub content_skipped: usize,
    pub commands_replayed: usize,
    pub commands_dropped: usize,
    /// The whole folder was listed instead of changes since the watermark
    pub full_resync: bool,
    pub duration_ms: u64,
}

/// Cooperative cancellation flag shared with a running sync
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Allow new syncs after a cancellation
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Reconciles one folder at a time against a remote session
pub struct FolderReconciler<'a> {
    store: &'a dyn MailStore,
    journal: &'a PendingCommandJournal,
    overlay: &'a AccountOverlay,
    cancel: &'a CancellationToken,
}

impl<'a> FolderReconciler<'a> {
    pub fn new(
        store: &'a dyn MailStore,
        journal: &'a PendingCommandJournal,
        overlay: &'a AccountOverlay,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            journal,
            overlay,
            cancel,
        }
    }

    /// Sync one folder
    ///
    /// Exactly one of `sync_finished` / `sync_failed` reaches the listener.
    pub fn sync_folder<R: RemoteSession>(
        &self,
        session: &mut R,
        folder_id: FolderId,
        config: &SyncConfig,
        listener: &mut dyn SyncListener,
    ) -> Result<SyncStats, SyncError> {
        let folder = match self.store.get_folder(folder_id) {
            Ok(Some(folder)) => folder,
            Ok(None) => {
                let label = folder_id.to_string();
                let error = SyncError::DataCorruption(format!("folder {folder_id} does not exist"));
                listener.sync_started(&label);
                listener.sync_failed(&label, &error);
                return Err(error);
            }
            Err(e) => {
                let label = folder_id.to_string();
                let error = SyncError::from(e);
                listener.sync_started(&label);
                listener.sync_failed(&label, &error);
                return Err(error);
            }
        };

        let start = Instant::now();
        let label = folder.server_id.clone();
        listener.sync_started(&label);
        listener.phase_changed(&label, SyncPhase::Idle);

        let mut stats = SyncStats::default();
        match self.run(session, &folder, config, listener, &mut stats) {
            Ok(()) => {
                stats.duration_ms = start.elapsed().as_millis() as u64;
                listener.phase_changed(&label, SyncPhase::Done);
                info!(
                    "Synced {label}: {} added, {} updated, {} removed, {} bodies in {}ms",
                    stats.added, stats.updated, stats.removed, stats.content_fetched, stats.duration_ms
                );
                listener.sync_finished(&label, &stats);
                Ok(stats)
            }
            Err(error) => {
                warn!("Sync of {label} aborted: {error}");
                self.record_failure(folder.id, &error);
                listener.phase_changed(&label, SyncPhase::ErrorAborted);
                listener.sync_failed(&label, &error);
                Err(error)
            }
        }
    }

    fn enter(
        &self,
        label: &str,
        phase: SyncPhase,
        listener: &mut dyn SyncListener,
    ) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        debug!("{label}: {phase:?}");
        listener.phase_changed(label, phase);
        Ok(())
    }

    fn run<R: RemoteSession>(
        &self,
        session: &mut R,
        folder: &Folder,
        config: &SyncConfig,
        listener: &mut dyn SyncListener,
        stats: &mut SyncStats,
    ) -> Result<(), SyncError> {
        let label = folder.server_id.as_str();

        self.enter(label, SyncPhase::DrainingPending, listener)?;
        let report = self.journal.drain(session, Some(folder.id));
        stats.commands_replayed = report.confirmed.len();
        stats.commands_dropped = report.failed_permanently.len();
        if let Some(error) = report.halted {
            return Err(error);
        }

        self.enter(label, SyncPhase::FetchingRemoteSummary, listener)?;
        let status = session.open_folder(label)?;
        let mut state = folder.sync_state.clone();
        let mut full = config.full_resync || state.needs_full_resync;
        if let (Some(known), Some(current)) = (state.uid_validity, status.uid_validity)
            && known != current
        {
            info!("UIDVALIDITY of {label} changed ({known} -> {current}), clearing local copy");
            self.store.clear_folder_messages(folder.id)?;
            state = state.reset();
            full = true;
        }
        if config.expunge_on_poll {
            session.expunge(label)?;
        }
        let request = match state.watermark {
            Some(watermark) if !full && status.supports_incremental && state.can_sync_incrementally() => {
                ListingRequest::since(watermark)
            }
            _ => ListingRequest::full(),
        };
        stats.full_resync = request.since.is_none();
        let listing = session.list_remote(label, &request)?;

        self.enter(label, SyncPhase::Diffing, listener)?;
        let local = self.store.folder_index(folder.id)?;
        let pending = self.journal.pending_index(folder.id)?;
        let changes = compute_diff(
            &local,
            &listing,
            &pending,
            self.overlay,
            config.sync_remote_deletions,
        );
        debug!(
            "{label}: {} new, {} flag changes, {} removals",
            changes.new_ids.len(),
            changes.flag_updates.len(),
            changes.removals.len()
        );

        self.enter(label, SyncPhase::ApplyingChanges, listener)?;
        self.apply_changes(session, folder, state, &local, changes, &listing, status.uid_validity, listener, stats)?;

        self.enter(label, SyncPhase::FetchingMissingContent, listener)?;
        self.fetch_missing_content(session, folder, config, listener, stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_changes<R: RemoteSession>(
        &self,
        session: &mut R,
        folder: &Folder,
        state: FolderSyncState,
        local: &[LocalEntry],
        changes: FolderChanges,
        listing: &RemoteListing,
        uid_validity: Option<u64>,
        listener: &mut dyn SyncListener,
        stats: &mut SyncStats,
    ) -> Result<(), SyncError> {
        let label = folder.server_id.as_str();
        let new_messages = if changes.new_ids.is_empty() {
            Vec::new()
        } else {
            session.fetch_headers(label, &changes.new_ids)?
        };
        listener.sync_progress(label, new_messages.len(), changes.new_ids.len());

        let watermark = listing.watermark.or(state.watermark);
        let diff = FolderDiff {
            new_messages,
            flag_updates: changes.flag_updates,
            removals: changes.removals,
            sync_state: state.completed(uid_validity, watermark),
        };
        let outcome = self.store.apply_folder_diff(folder.id, &diff)?;
        stats.added = outcome.added.len();
        stats.updated = outcome.updated.len();
        stats.removed = outcome.removed.len();

        let known: HashMap<&RemoteId, LocalMessageId> =
            local.iter().map(|e| (&e.remote_id, e.id)).collect();
        let visible = |ids: &[RemoteId]| -> Vec<RemoteId> {
            ids.iter()
                .filter(|rid| {
                    let id = known.get(rid).copied().or_else(|| {
                        self.store
                            .find_message(folder.id, rid)
                            .ok()
                            .flatten()
                            .map(|m| m.id)
                    });
                    !id.is_some_and(|id| self.overlay.is_hidden(EntityId::Message(id)))
                })
                .cloned()
                .collect()
        };

        let added = visible(&outcome.added);
        let removed = visible(&outcome.removed);
        let changed = visible(&outcome.updated);
        if !added.is_empty() {
            listener.messages_added(label, &added);
        }
        if !removed.is_empty() {
            listener.messages_removed(label, &removed);
        }
        if !changed.is_empty() {
            listener.messages_flag_changed(label, &changed);
        }
        Ok(())
    }

    fn fetch_missing_content<R: RemoteSession>(
        &self,
        session: &mut R,
        folder: &Folder,
        config: &SyncConfig,
        listener: &mut dyn SyncListener,
        stats: &mut SyncStats,
    ) -> Result<(), SyncError> {
        let label = folder.server_id.as_str();
        let candidates: Vec<LocalEntry> = self
            .store
            .folder_index(folder.id)?
            .into_iter()
            .filter(|e| !e.complete && !e.remote_id.is_placeholder())
            .collect();

        if !config.allows_content_fetch() {
            debug!("{label}: metered network, leaving {} bodies for later", candidates.len());
            stats.content_skipped = candidates.len();
            return Ok(());
        }

        let total = candidates.len();
        let max = config.max_auto_fetch_body_size;
        for (i, entry) in candidates.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if entry.size > max {
                stats.content_skipped += 1;
            } else {
                match session.fetch_content(label, &entry.remote_id, max) {
                    Ok(content) => {
                        self.store.store_content(entry.id, &content.data, content.complete)?;
                        if content.complete {
                            stats.content_fetched += 1;
                        } else {
                            stats.content_skipped += 1;
                        }
                    }
                    Err(e) if e.is_transient() => {
                        warn!("{label}: body download interrupted: {e}");
                        stats.content_skipped += total - i;
                        break;
                    }
                    Err(e) => {
                        debug!("{label}: no body for {}: {e}", entry.remote_id);
                        stats.content_skipped += 1;
                    }
                }
            }
            listener.sync_progress(label, i + 1, total);
        }
        Ok(())
    }

    /// Stamp the failure on the folder; corruption schedules a full resync
    fn record_failure(&self, folder: FolderId, error: &SyncError) {
        let result: Result<(), StoreError> = (|| {
            let Some(current) = self.store.get_folder(folder)? else {
                return Ok(());
            };
            let mut state = current.sync_state.failed(error.to_string());
            if matches!(error, SyncError::DataCorruption(_)) {
                state = state.reset();
            }
            self.store.save_folder_sync_state(folder, &state)
        })();
        if let Err(e) = result {
            warn!("Could not record sync failure for folder {folder}: {e}");
        }
    }
}
