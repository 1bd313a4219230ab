//! Account-level sync sessions and retry policy

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rayon::prelude::*;

use super::reconciler::SyncStats;
use super::timing::{backoff_delay, cooldown_elapsed};
use crate::backend::{Backend, SyncListener};
use crate::config::{NetworkTier, SyncSettings};
use crate::error::SyncError;
use crate::models::{AccountId, FolderId};
use crate::overlay::AccountOverlay;
use crate::registry::AccountContext;
use crate::storage::MailStore;

/// User-visible health of an account's sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountSyncStatus {
    Healthy,
    /// Transient failures; syncing resumes after `next_attempt_at`
    Retrying {
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Retries exhausted
    Failed { reason: String },
    /// Credentials were rejected; no syncs until resolved
    AuthenticationRequired,
}

/// Result of syncing every folder of one account
#[derive(Debug, Clone)]
pub struct AccountSyncReport {
    pub account: AccountId,
    pub folders: Vec<(FolderId, Result<SyncStats, SyncError>)>,
    pub status: AccountSyncStatus,
    /// The sync did not run (cooldown, backoff or authentication)
    pub skipped: bool,
}

impl AccountSyncReport {
    pub fn is_success(&self) -> bool {
        !self.skipped && self.folders.iter().all(|(_, r)| r.is_ok())
    }
}

/// Sync driver for one account
///
/// Folders are synced one after another over a single connection. At most
/// one sync runs per account at a time.
pub struct AccountSyncSession<B: Backend> {
    account: AccountId,
    store: Arc<dyn MailStore>,
    overlay: Arc<AccountOverlay>,
    backend: B,
    settings: SyncSettings,
    status: Mutex<AccountSyncStatus>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    running: Mutex<()>,
}

impl<B: Backend> AccountSyncSession<B> {
    pub fn new(context: &AccountContext, backend: B, settings: SyncSettings) -> Self {
        Self {
            account: context.account.id,
            store: context.store.clone(),
            overlay: context.overlay.clone(),
            backend,
            settings,
            status: Mutex::new(AccountSyncStatus::Healthy),
            last_sync: Mutex::new(None),
            running: Mutex::new(()),
        }
    }

    pub fn account(&self) -> AccountId {
        self.account
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn status(&self) -> AccountSyncStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_status(&self, status: AccountSyncStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Called once the user has fixed their credentials
    pub fn resolve_authentication(&self) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *status == AccountSyncStatus::AuthenticationRequired {
            *status = AccountSyncStatus::Healthy;
        }
    }

    /// Whether an automatic sync may start now
    pub fn should_sync(&self) -> bool {
        let last = *self.last_sync.lock().unwrap_or_else(|e| e.into_inner());
        let allowed = match self.status() {
            AccountSyncStatus::Healthy => true,
            AccountSyncStatus::Retrying {
                next_attempt_at, ..
            } => Utc::now() >= next_attempt_at,
            AccountSyncStatus::Failed { .. } | AccountSyncStatus::AuthenticationRequired => false,
        };
        allowed && cooldown_elapsed(last, self.settings.sync_cooldown_secs)
    }

    /// Sync every syncable folder of the account
    ///
    /// Skipped while authentication is required or a retry backoff has not
    /// elapsed. An explicit call after `Failed` starts a fresh retry cycle.
    pub fn sync_account(
        &self,
        network: NetworkTier,
        listener: &mut dyn SyncListener,
    ) -> AccountSyncReport {
        let _running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        let mut report = AccountSyncReport {
            account: self.account,
            folders: Vec::new(),
            status: self.status(),
            skipped: false,
        };

        match self.status() {
            AccountSyncStatus::AuthenticationRequired => {
                report.skipped = true;
                return report;
            }
            AccountSyncStatus::Retrying {
                next_attempt_at, ..
            } if Utc::now() < next_attempt_at => {
                report.skipped = true;
                return report;
            }
            _ => {}
        }

        let folders = match self.store.list_folders() {
            Ok(folders) => folders,
            Err(e) => {
                let error = SyncError::from(e);
                self.record_failure(&error);
                report.status = self.status();
                return report;
            }
        };

        let mut handle = match self.backend.connect() {
            Ok(handle) => handle,
            Err(error) => {
                warn!("Could not connect account {}: {error}", self.account);
                self.record_failure(&error);
                report.status = self.status();
                return report;
            }
        };

        let config = self.settings.sync_config(network, false);
        let mut account_error: Option<SyncError> = None;
        for folder in folders.iter().filter(|f| f.is_syncable()) {
            let result = self
                .backend
                .sync(folder.id, &config, listener, Some(&mut handle));
            let stop = match &result {
                Err(e @ (SyncError::AuthenticationFailed(_)
                | SyncError::TransientNetwork(_)
                | SyncError::StorageUnavailable(_)
                | SyncError::Cancelled)) => {
                    account_error = Some(e.clone());
                    true
                }
                _ => false,
            };
            report.folders.push((folder.id, result));
            if stop {
                break;
            }
        }

        match account_error {
            Some(error) => self.record_failure(&error),
            None => {
                self.set_status(AccountSyncStatus::Healthy);
                *self.last_sync.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
                let reconciled = self.overlay.reconcile_with(self.store.as_ref());
                if reconciled.cleared + reconciled.unhidden > 0 {
                    info!(
                        "Overlay of {}: cleared {} overrides, unhid {} entities",
                        self.account, reconciled.cleared, reconciled.unhidden
                    );
                }
            }
        }
        report.status = self.status();
        report
    }

    /// Move the account status after an account-level failure
    fn record_failure(&self, error: &SyncError) {
        let next = match error {
            SyncError::AuthenticationFailed(_) => {
                error!("Account {} needs new credentials: {error}", self.account);
                AccountSyncStatus::AuthenticationRequired
            }
            SyncError::Cancelled => return,
            e if e.is_retryable() => {
                let attempt = match self.status() {
                    AccountSyncStatus::Retrying { attempt, .. } => attempt + 1,
                    _ => 1,
                };
                let policy = &self.settings.retry;
                if attempt >= policy.max_attempts {
                    error!("Account {} failed after {attempt} attempts: {error}", self.account);
                    AccountSyncStatus::Failed {
                        reason: error.to_string(),
                    }
                } else {
                    let delay = backoff_delay(policy, attempt);
                    info!(
                        "Account {} will retry in {}s (attempt {attempt})",
                        self.account,
                        delay.num_seconds()
                    );
                    AccountSyncStatus::Retrying {
                        attempt,
                        next_attempt_at: Utc::now() + delay,
                    }
                }
            }
            _ => return,
        };
        self.set_status(next);
    }
}

/// Sync several accounts in parallel, each over its own connection
pub fn sync_accounts<B, L, F>(
    sessions: &[AccountSyncSession<B>],
    network: NetworkTier,
    make_listener: F,
) -> Vec<AccountSyncReport>
where
    B: Backend,
    L: SyncListener,
    F: Fn(AccountId) -> L + Sync,
{
    sessions
        .par_iter()
        .map(|session| {
            let mut listener = make_listener(session.account());
            session.sync_account(network, &mut listener)
        })
        .collect()
}
