//! In-memory overlay of pending local changes
//!
//! The overlay makes a user's change visible to readers the moment it is made,
//! before the store or the server reflect it. Entries are advisory: readers
//! fall back to the store when no override exists, and a stale override is
//! cleared when its pending command is confirmed or by [`AccountOverlay::reconcile_with`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use log::debug;

use crate::models::{AccountId, Flag, FolderId, LocalMessageId, ThreadId};
use crate::storage::MailStore;

/// Entity an override or hide applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityId {
    Message(LocalMessageId),
    Thread(ThreadId),
    Folder(FolderId),
}

/// Field of an entity that can be overridden
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OverlayField {
    Flag(Flag),
    /// The folder a message is displayed in
    Folder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayValue {
    Bool(bool),
    Folder(FolderId),
    /// Set for the folder's messages with a local id up to this one; later
    /// arrivals are not covered
    UpTo(LocalMessageId),
}

type OverrideKey = (EntityId, OverlayField);

/// Counts from a reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayReconcileReport {
    pub cleared: usize,
    pub unhidden: usize,
}

/// Overlay state of one account
#[derive(Debug, Default)]
pub struct AccountOverlay {
    overrides: RwLock<HashMap<OverrideKey, OverlayValue>>,
    hidden: RwLock<HashSet<EntityId>>,
}

impl AccountOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_field_override(&self, entity: EntityId, field: OverlayField, value: OverlayValue) {
        let mut overrides = self.overrides.write().unwrap_or_else(|e| e.into_inner());
        overrides.insert((entity, field), value);
    }

    pub fn get_field_override(&self, entity: EntityId, field: &OverlayField) -> Option<OverlayValue> {
        let overrides = self.overrides.read().unwrap_or_else(|e| e.into_inner());
        overrides.get(&(entity, field.clone())).copied()
    }

    pub fn clear_field_override(&self, entity: EntityId, field: &OverlayField) {
        let mut overrides = self.overrides.write().unwrap_or_else(|e| e.into_inner());
        overrides.remove(&(entity, field.clone()));
    }

    /// Every override set on one entity
    pub fn overrides_for(&self, entity: EntityId) -> Vec<(OverlayField, OverlayValue)> {
        let overrides = self.overrides.read().unwrap_or_else(|e| e.into_inner());
        overrides
            .iter()
            .filter(|((e, _), _)| *e == entity)
            .map(|((_, field), value)| (field.clone(), *value))
            .collect()
    }

    /// Effective flag value from the message or its thread, message first
    pub fn flag_override(&self, message: LocalMessageId, thread: ThreadId, flag: &Flag) -> Option<bool> {
        let field = OverlayField::Flag(flag.clone());
        [EntityId::Message(message), EntityId::Thread(thread)]
            .into_iter()
            .find_map(|entity| match self.get_field_override(entity, &field) {
                Some(OverlayValue::Bool(value)) => Some(value),
                _ => None,
            })
    }

    pub fn hide(&self, ids: &[EntityId]) {
        let mut hidden = self.hidden.write().unwrap_or_else(|e| e.into_inner());
        hidden.extend(ids.iter().copied());
    }

    pub fn unhide(&self, ids: &[EntityId]) {
        let mut hidden = self.hidden.write().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            hidden.remove(id);
        }
    }

    pub fn is_hidden(&self, id: EntityId) -> bool {
        let hidden = self.hidden.read().unwrap_or_else(|e| e.into_inner());
        hidden.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        let overrides = self.overrides.read().unwrap_or_else(|e| e.into_inner());
        let hidden = self.hidden.read().unwrap_or_else(|e| e.into_inner());
        overrides.is_empty() && hidden.is_empty()
    }

    /// Drop overrides the store already reflects and unhide entities that no
    /// longer exist.
    ///
    /// Store lookups happen without holding the overlay locks. An entry that
    /// was replaced while the pass ran is left alone.
    pub fn reconcile_with(&self, store: &dyn MailStore) -> OverlayReconcileReport {
        let mut report = OverlayReconcileReport::default();

        let snapshot: Vec<(OverrideKey, OverlayValue)> = {
            let overrides = self.overrides.read().unwrap_or_else(|e| e.into_inner());
            overrides.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };
        let settled: Vec<(OverrideKey, OverlayValue)> = snapshot
            .into_iter()
            .filter(|((entity, field), value)| store_reflects(store, *entity, field, *value))
            .collect();
        if !settled.is_empty() {
            let mut overrides = self.overrides.write().unwrap_or_else(|e| e.into_inner());
            for (key, value) in settled {
                if overrides.get(&key) == Some(&value) {
                    overrides.remove(&key);
                    report.cleared += 1;
                }
            }
        }

        let hidden: Vec<EntityId> = {
            let hidden = self.hidden.read().unwrap_or_else(|e| e.into_inner());
            hidden.iter().copied().collect()
        };
        let gone: Vec<EntityId> = hidden
            .into_iter()
            .filter(|entity| entity_gone(store, *entity))
            .collect();
        if !gone.is_empty() {
            report.unhidden = gone.len();
            self.unhide(&gone);
        }

        if report != OverlayReconcileReport::default() {
            debug!(
                "Overlay reconcile: cleared {} overrides, unhid {} entities",
                report.cleared, report.unhidden
            );
        }
        report
    }
}

/// Whether the store already holds the overridden value (or the entity is gone)
fn store_reflects(
    store: &dyn MailStore,
    entity: EntityId,
    field: &OverlayField,
    value: OverlayValue,
) -> bool {
    match (entity, field, value) {
        (EntityId::Message(id), OverlayField::Flag(flag), OverlayValue::Bool(v)) => {
            match store.get_message(id) {
                Ok(Some(message)) => message.has_flag(flag) == v,
                Ok(None) => true,
                Err(_) => false,
            }
        }
        (EntityId::Message(id), OverlayField::Folder, OverlayValue::Folder(folder)) => {
            match store.get_message(id) {
                Ok(Some(message)) => message.folder_id == folder,
                Ok(None) => true,
                Err(_) => false,
            }
        }
        (EntityId::Thread(thread), OverlayField::Flag(flag), OverlayValue::Bool(v)) => {
            match store.thread_messages(thread) {
                Ok(messages) => messages.iter().all(|m| m.has_flag(flag) == v),
                Err(_) => false,
            }
        }
        _ => false,
    }
}

fn entity_gone(store: &dyn MailStore, entity: EntityId) -> bool {
    match entity {
        EntityId::Message(id) => matches!(store.get_message(id), Ok(None)),
        EntityId::Thread(thread) => matches!(store.thread_messages(thread), Ok(m) if m.is_empty()),
        EntityId::Folder(folder) => matches!(store.get_folder(folder), Ok(None)),
    }
}

/// Process-wide map of per-account overlays
///
/// Owned by the host and passed explicitly; each account's state has its own
/// locks so one account's readers never wait on another's writers.
#[derive(Debug, Default)]
pub struct OverlayRegistry {
    accounts: RwLock<HashMap<AccountId, Arc<AccountOverlay>>>,
}

impl OverlayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The overlay of an account, created on first use
    pub fn account(&self, account: AccountId) -> Arc<AccountOverlay> {
        if let Some(overlay) = self
            .accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&account)
        {
            return Arc::clone(overlay);
        }
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(accounts.entry(account).or_default())
    }

    pub fn set_field_override(
        &self,
        account: AccountId,
        entity: EntityId,
        field: OverlayField,
        value: OverlayValue,
    ) {
        self.account(account).set_field_override(entity, field, value);
    }

    pub fn get_field_override(
        &self,
        account: AccountId,
        entity: EntityId,
        field: &OverlayField,
    ) -> Option<OverlayValue> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.get(&account)?.get_field_override(entity, field)
    }

    pub fn hide(&self, account: AccountId, ids: &[EntityId]) {
        self.account(account).hide(ids);
    }

    pub fn unhide(&self, account: AccountId, ids: &[EntityId]) {
        self.account(account).unhide(ids);
    }

    pub fn is_hidden(&self, account: AccountId, id: EntityId) -> bool {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts
            .get(&account)
            .is_some_and(|overlay| overlay.is_hidden(id))
    }

    /// Forget everything overlaid for an account
    pub fn end_session(&self, account: AccountId) {
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        accounts.remove(&account);
    }
}
