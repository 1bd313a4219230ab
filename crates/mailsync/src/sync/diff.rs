//! Three-way comparison of local rows, remote listing and pending intent

use std::collections::{BTreeMap, BTreeSet};

use crate::backend::{RemoteEntry, RemoteListing};
use crate::journal::PendingIndex;
use crate::models::{Flag, FlagSet, LocalMessageId, RemoteId};
use crate::overlay::{AccountOverlay, EntityId, OverlayField, OverlayValue};
use crate::storage::{FlagUpdate, LocalEntry};

/// What a folder sync must change locally
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderChanges {
    /// Remote ids to fetch headers for, ascending
    pub new_ids: Vec<RemoteId>,
    pub flag_updates: Vec<FlagUpdate>,
    pub removals: Vec<LocalMessageId>,
}

impl FolderChanges {
    pub fn is_empty(&self) -> bool {
        self.new_ids.is_empty() && self.flag_updates.is_empty() && self.removals.is_empty()
    }
}

/// Compare `local` with `listing`
///
/// Local pending changes win over remote state: a flag with a pending command
/// or an overlay override keeps its local value, messages a pending command
/// still needs are never removed, and the source ids of pending moves and
/// deletes are not re-added. A message the server reports as `\Deleted`
/// counts as removed. Duplicate remote ids keep their first entry.
pub fn compute_diff(
    local: &[LocalEntry],
    listing: &RemoteListing,
    pending: &PendingIndex,
    overlay: &AccountOverlay,
    sync_remote_deletions: bool,
) -> FolderChanges {
    let mut remote: BTreeMap<&RemoteId, &RemoteEntry> = BTreeMap::new();
    for entry in &listing.entries {
        remote.entry(&entry.remote_id).or_insert(entry);
    }
    let by_remote: BTreeMap<&RemoteId, &LocalEntry> =
        local.iter().map(|e| (&e.remote_id, e)).collect();

    let mut changes = FolderChanges::default();
    let mut removed: BTreeSet<LocalMessageId> = BTreeSet::new();

    for (remote_id, entry) in &remote {
        let remote_deleted = entry.flags.contains(&Flag::Deleted);
        match by_remote.get(remote_id) {
            None => {
                if !remote_deleted && !pending.suppressed_remote.contains(*remote_id) {
                    changes.new_ids.push((*remote_id).clone());
                }
            }
            Some(local) => {
                if remote_deleted {
                    if sync_remote_deletions && !pending.protected_local.contains(&local.id) {
                        removed.insert(local.id);
                    }
                    continue;
                }
                let desired = resolve_flags(local, &entry.flags, pending, overlay);
                if desired != local.flags {
                    changes.flag_updates.push(FlagUpdate {
                        id: local.id,
                        flags: desired,
                    });
                }
            }
        }
    }

    if sync_remote_deletions {
        let present: Option<BTreeSet<&RemoteId>> = if listing.incremental {
            listing.all_ids.as_ref().map(|ids| ids.iter().collect())
        } else {
            Some(remote.keys().copied().collect())
        };
        let mut sorted: Vec<&LocalEntry> = local.iter().collect();
        sorted.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        for entry in sorted {
            if pending.protected_local.contains(&entry.id) || removed.contains(&entry.id) {
                continue;
            }
            let gone = if entry.remote_id.is_placeholder() {
                // Nothing pending will ever give it a server id
                true
            } else {
                present
                    .as_ref()
                    .is_some_and(|ids| !ids.contains(&entry.remote_id))
            };
            if gone {
                removed.insert(entry.id);
            }
        }
    }

    let order: BTreeMap<LocalMessageId, &RemoteId> =
        local.iter().map(|e| (e.id, &e.remote_id)).collect();
    let mut removals: Vec<LocalMessageId> = removed.into_iter().collect();
    removals.sort_by(|a, b| order.get(a).cmp(&order.get(b)));
    changes.removals = removals;
    changes
}

/// Remote flags with pending and overlay values applied on top
fn resolve_flags(
    local: &LocalEntry,
    remote_flags: &FlagSet,
    pending: &PendingIndex,
    overlay: &AccountOverlay,
) -> FlagSet {
    let mut desired = remote_flags.clone();

    for (field, value) in overlay.overrides_for(EntityId::Message(local.id)) {
        if let (OverlayField::Flag(flag), OverlayValue::Bool(on)) = (field, value) {
            set(&mut desired, flag, on);
        }
    }

    let mut pending_flags: Vec<(Flag, bool)> = pending
        .flag_overrides
        .iter()
        .filter(|((id, _), _)| *id == local.id)
        .map(|((_, flag), value)| (flag.clone(), *value))
        .collect();
    if pending.mark_all_read && !pending_flags.iter().any(|(f, _)| *f == Flag::Read) {
        pending_flags.push((Flag::Read, true));
    }
    for (flag, on) in pending_flags {
        set(&mut desired, flag, on);
    }

    desired
}

fn set(flags: &mut FlagSet, flag: Flag, on: bool) {
    if on {
        flags.insert(flag);
    } else {
        flags.remove(&flag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(id: i64, uid: u64, flags: &[Flag]) -> LocalEntry {
        LocalEntry {
            id: LocalMessageId(id),
            remote_id: RemoteId::from(uid),
            flags: flags.iter().cloned().collect(),
            size: 100,
            complete: true,
        }
    }

    fn remote(uid: u64, flags: &[Flag]) -> RemoteEntry {
        RemoteEntry {
            remote_id: RemoteId::from(uid),
            flags: flags.iter().cloned().collect(),
            size: 100,
        }
    }

    fn listing(entries: Vec<RemoteEntry>) -> RemoteListing {
        RemoteListing {
            entries,
            ..Default::default()
        }
    }

    #[test]
    fn test_added_removed_and_flag_changed() {
        let locals = vec![local(1, 1, &[]), local(2, 2, &[]), local(3, 3, &[])];
        let remote = listing(vec![remote(2, &[Flag::Read]), remote(3, &[]), remote(4, &[])]);
        let changes = compute_diff(
            &locals,
            &remote,
            &PendingIndex::default(),
            &AccountOverlay::new(),
            true,
        );
        assert_eq!(changes.new_ids, vec![RemoteId::from(4u64)]);
        assert_eq!(changes.removals, vec![LocalMessageId(1)]);
        assert_eq!(changes.flag_updates.len(), 1);
        assert_eq!(changes.flag_updates[0].id, LocalMessageId(2));
    }

    #[test]
    fn test_numeric_order_and_first_duplicate_wins() {
        let remote = listing(vec![
            remote(10, &[]),
            remote(9, &[]),
            remote(10, &[Flag::Flagged]),
            remote(100, &[]),
        ]);
        let changes = compute_diff(
            &[],
            &remote,
            &PendingIndex::default(),
            &AccountOverlay::new(),
            true,
        );
        assert_eq!(
            changes.new_ids,
            vec![RemoteId::from(9u64), RemoteId::from(10u64), RemoteId::from(100u64)]
        );

        let locals = vec![local(1, 10, &[])];
        let changes = compute_diff(
            &locals,
            &remote,
            &PendingIndex::default(),
            &AccountOverlay::new(),
            true,
        );
        assert!(changes.flag_updates.is_empty());
    }

    #[test]
    fn test_pending_flag_wins_over_remote() {
        let locals = vec![local(1, 1, &[Flag::Read])];
        let remote = listing(vec![remote(1, &[])]);
        let mut pending = PendingIndex::default();
        pending
            .flag_overrides
            .insert((LocalMessageId(1), Flag::Read), true);
        let changes = compute_diff(&locals, &remote, &pending, &AccountOverlay::new(), true);
        assert!(changes.flag_updates.is_empty());
    }

    #[test]
    fn test_overlay_override_wins_over_remote() {
        let locals = vec![local(1, 1, &[])];
        let remote = listing(vec![remote(1, &[Flag::Flagged])]);
        let overlay = AccountOverlay::new();
        overlay.set_field_override(
            EntityId::Message(LocalMessageId(1)),
            OverlayField::Flag(Flag::Flagged),
            OverlayValue::Bool(false),
        );
        let changes = compute_diff(&locals, &remote, &PendingIndex::default(), &overlay, true);
        assert!(changes.flag_updates.is_empty());
    }

    #[test]
    fn test_protected_and_suppressed() {
        let locals = vec![local(1, 1, &[]), local(2, 2, &[])];
        let remote = listing(vec![remote(5, &[])]);
        let mut pending = PendingIndex::default();
        pending.protected_local.insert(LocalMessageId(1));
        pending.suppressed_remote.insert(RemoteId::from(5u64));
        let changes = compute_diff(&locals, &remote, &pending, &AccountOverlay::new(), true);
        assert!(changes.new_ids.is_empty());
        assert_eq!(changes.removals, vec![LocalMessageId(2)]);
    }

    #[test]
    fn test_remote_deleted_flag_removes() {
        let locals = vec![local(1, 1, &[])];
        let remote = listing(vec![remote(1, &[Flag::Deleted]), remote(2, &[Flag::Deleted])]);
        let changes = compute_diff(
            &locals,
            &remote,
            &PendingIndex::default(),
            &AccountOverlay::new(),
            true,
        );
        assert_eq!(changes.removals, vec![LocalMessageId(1)]);
        assert!(changes.new_ids.is_empty());
    }

    #[test]
    fn test_incremental_listing_detects_removals_from_all_ids() {
        let locals = vec![local(1, 1, &[]), local(2, 2, &[])];
        let remote = RemoteListing {
            entries: vec![],
            all_ids: Some(vec![RemoteId::from(2u64)]),
            incremental: true,
            watermark: None,
        };
        let changes = compute_diff(
            &locals,
            &remote,
            &PendingIndex::default(),
            &AccountOverlay::new(),
            true,
        );
        assert_eq!(changes.removals, vec![LocalMessageId(1)]);
        assert!(changes.flag_updates.is_empty());
    }

    #[test]
    fn test_remote_deletions_can_be_disabled() {
        let locals = vec![local(1, 1, &[])];
        let changes = compute_diff(
            &locals,
            &listing(vec![]),
            &PendingIndex::default(),
            &AccountOverlay::new(),
            false,
        );
        assert!(changes.is_empty());
    }
}
