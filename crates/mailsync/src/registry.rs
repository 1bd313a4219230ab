//! Per-account handles owned by the host
//!
//! Each open account gets its own store, journal and overlay. The registry is
//! passed around explicitly; nothing here is process-global.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::{info, warn};

use crate::error::StoreError;
use crate::journal::PendingCommandJournal;
use crate::models::{Account, AccountId};
use crate::overlay::{AccountOverlay, OverlayRegistry};
use crate::storage::{MailStore, SqliteMailStore, StoreResult};

/// Everything the core keeps open for one account
pub struct AccountContext {
    pub account: Account,
    pub store: Arc<dyn MailStore>,
    pub journal: Arc<PendingCommandJournal>,
    pub overlay: Arc<AccountOverlay>,
    /// None for in-memory stores
    db_path: Option<PathBuf>,
}

impl AccountContext {
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }
}

/// Registry of open accounts
pub struct AccountRegistry {
    /// Directory holding one database per account; None keeps stores in memory
    base_dir: Option<PathBuf>,
    accounts: RwLock<HashMap<AccountId, Arc<AccountContext>>>,
    overlays: OverlayRegistry,
}

impl AccountRegistry {
    /// Registry whose account databases live under `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
            accounts: RwLock::new(HashMap::new()),
            overlays: OverlayRegistry::new(),
        }
    }

    /// Registry with throwaway in-memory stores
    pub fn in_memory() -> Self {
        Self {
            base_dir: None,
            accounts: RwLock::new(HashMap::new()),
            overlays: OverlayRegistry::new(),
        }
    }

    /// Database file of an account
    pub fn db_path_for(&self, account: AccountId) -> Option<PathBuf> {
        self.base_dir
            .as_ref()
            .map(|dir| dir.join(format!("{account}.db")))
    }

    /// Open (or return the already open) context of an account
    ///
    /// # Arguments
    /// * `account` - The account; its id names the database file
    pub fn open_account(&self, account: Account) -> StoreResult<Arc<AccountContext>> {
        if let Some(context) = self.get(account.id) {
            return Ok(context);
        }

        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        if let Some(context) = accounts.get(&account.id) {
            return Ok(Arc::clone(context));
        }

        let db_path = self.db_path_for(account.id);
        let store = match &db_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| {
                        StoreError::StorageUnavailable(format!(
                            "Failed to create {}: {e}",
                            parent.display()
                        ))
                    })?;
                }
                SqliteMailStore::open(path)?
            }
            None => SqliteMailStore::open_in_memory()?,
        };
        let store: Arc<dyn MailStore> = Arc::new(store);
        let overlay = self.overlays.account(account.id);
        let journal = Arc::new(PendingCommandJournal::new(
            Arc::clone(&store),
            Arc::clone(&overlay),
        ));

        info!("Opened account {} ({})", account.label(), account.id);
        let context = Arc::new(AccountContext {
            account,
            store,
            journal,
            overlay,
            db_path,
        });
        accounts.insert(context.account.id, Arc::clone(&context));
        Ok(context)
    }

    pub fn get(&self, id: AccountId) -> Option<Arc<AccountContext>> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.get(&id).cloned()
    }

    /// Open accounts, in no particular order
    pub fn accounts(&self) -> Vec<Arc<AccountContext>> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.values().cloned().collect()
    }

    pub fn overlays(&self) -> &OverlayRegistry {
        &self.overlays
    }

    /// Close an account and delete its local cache
    ///
    /// The database is removed from disk once the last handle to the store is
    /// dropped; callers must not keep contexts of a removed account.
    pub fn remove_account(&self, id: AccountId) -> StoreResult<bool> {
        let removed = {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.remove(&id)
        };
        self.overlays.end_session(id);
        let Some(context) = removed else {
            return Ok(false);
        };

        let db_path = context.db_path.clone();
        drop(context);
        if let Some(path) = db_path {
            for suffix in ["", "-wal", "-shm"] {
                let file = PathBuf::from(format!("{}{suffix}", path.display()));
                match fs::remove_file(&file) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!("Could not delete {}: {e}", file.display());
                        return Err(StoreError::StorageUnavailable(e.to_string()));
                    }
                }
            }
        }
        info!("Removed account {id}");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_account_is_idempotent() {
        let registry = AccountRegistry::in_memory();
        let account = Account::new("a@example.com", "imap://a@localhost");
        let first = registry.open_account(account.clone()).unwrap();
        let second = registry.open_account(account).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.accounts().len(), 1);
    }

    #[test]
    fn test_accounts_are_isolated() {
        let registry = AccountRegistry::in_memory();
        let a = registry
            .open_account(Account::new("a@example.com", "imap://a@localhost"))
            .unwrap();
        let b = registry
            .open_account(Account::new("b@example.com", "imap://b@localhost"))
            .unwrap();
        a.store.ensure_folder("INBOX", "Inbox").unwrap();
        assert_eq!(a.store.list_folders().unwrap().len(), 1);
        assert!(b.store.list_folders().unwrap().is_empty());
        assert!(!Arc::ptr_eq(&a.overlay, &b.overlay));
    }

    #[test]
    fn test_remove_account_deletes_database() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AccountRegistry::new(dir.path().join("accounts"));
        let account = Account::new("a@example.com", "imap://a@localhost");
        let id = account.id;
        let context = registry.open_account(account).unwrap();
        context.store.ensure_folder("INBOX", "Inbox").unwrap();
        let path = context.db_path().unwrap().to_path_buf();
        assert!(path.exists());
        drop(context);

        assert!(registry.remove_account(id).unwrap());
        assert!(!path.exists());
        assert!(registry.get(id).is_none());
        assert!(!registry.remove_account(id).unwrap());
    }
}
