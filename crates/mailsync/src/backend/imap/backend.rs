//! [`Backend`] implementation for IMAP accounts

use std::sync::Arc;

use log::debug;

use super::remote::ImapRemote;
use super::session::ImapSession;
use crate::backend::{Backend, SyncListener};
use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncError};
use crate::journal::{DrainReport, PendingCommandJournal};
use crate::models::FolderId;
use crate::overlay::AccountOverlay;
use crate::registry::AccountContext;
use crate::storage::MailStore;
use crate::sync::{CancellationToken, FolderReconciler, SyncStats};

type Connector<S> = Box<dyn Fn() -> Result<S, RemoteError> + Send + Sync>;

/// IMAP backend of one account
///
/// Holds no folder state; each call either reuses the caller's connection
/// handle or opens a fresh one through the connector.
pub struct ImapBackend<S: ImapSession> {
    store: Arc<dyn MailStore>,
    journal: Arc<PendingCommandJournal>,
    overlay: Arc<AccountOverlay>,
    connector: Connector<S>,
    cancel: CancellationToken,
}

impl<S: ImapSession> ImapBackend<S> {
    /// # Arguments
    /// * `context` - The account's store, journal and overlay
    /// * `connector` - Opens and authenticates a new IMAP connection
    pub fn new(
        context: &AccountContext,
        connector: impl Fn() -> Result<S, RemoteError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            store: context.store.clone(),
            journal: context.journal.clone(),
            overlay: context.overlay.clone(),
            connector: Box::new(connector),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts running syncs at the next phase boundary
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn reconciler(&self) -> FolderReconciler<'_> {
        FolderReconciler::new(self.store.as_ref(), &self.journal, &self.overlay, &self.cancel)
    }
}

impl<S: ImapSession> Backend for ImapBackend<S> {
    type Handle = ImapRemote<S>;

    fn connect(&self) -> Result<Self::Handle, SyncError> {
        let session = (self.connector)()?;
        debug!("Opened IMAP connection");
        Ok(ImapRemote::new(session))
    }

    fn sync(
        &self,
        folder: FolderId,
        config: &SyncConfig,
        listener: &mut dyn SyncListener,
        handle: Option<&mut Self::Handle>,
    ) -> Result<SyncStats, SyncError> {
        match handle {
            Some(remote) => self.reconciler().sync_folder(remote, folder, config, listener),
            None => {
                let mut remote = match self.connect() {
                    Ok(remote) => remote,
                    Err(error) => {
                        let label = self
                            .store
                            .get_folder(folder)
                            .ok()
                            .flatten()
                            .map(|f| f.server_id)
                            .unwrap_or_else(|| folder.to_string());
                        listener.sync_started(&label);
                        listener.sync_failed(&label, &error);
                        return Err(error);
                    }
                };
                self.reconciler()
                    .sync_folder(&mut remote, folder, config, listener)
            }
        }
    }

    fn flush_pending(
        &self,
        folder_filter: Option<FolderId>,
        handle: Option<&mut Self::Handle>,
    ) -> Result<DrainReport, SyncError> {
        let report = match handle {
            Some(remote) => self.journal.drain(remote, folder_filter),
            None => {
                let mut remote = self.connect()?;
                self.journal.drain(&mut remote, folder_filter)
            }
        };
        Ok(report)
    }
}
