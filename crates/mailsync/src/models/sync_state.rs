//! Per-folder sync state for incremental reconciliation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Highest remote position already reconciled into the local cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Highest UID seen in a committed listing
    pub highest_uid: u64,
    /// CONDSTORE/QRESYNC modification sequence, when the server has one
    pub highest_modseq: Option<u64>,
}

impl Watermark {
    pub fn new(highest_uid: u64) -> Self {
        Self {
            highest_uid,
            highest_modseq: None,
        }
    }

    pub fn with_modseq(mut self, modseq: u64) -> Self {
        self.highest_modseq = Some(modseq);
        self
    }
}

/// Tracks sync progress for a single folder
///
/// Persisted with the folder row. The watermark only advances inside the
/// transaction that commits the diff it describes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FolderSyncState {
    /// UIDVALIDITY observed at the last successful sync
    pub uid_validity: Option<u64>,
    /// Incremental sync position (None = never synced)
    pub watermark: Option<Watermark>,
    /// When the folder was last checked, successful or not
    pub last_checked: Option<DateTime<Utc>>,
    /// Last failure text; None after a successful sync
    pub status: Option<String>,
    /// Set after data corruption or a UIDVALIDITY change
    #[serde(default)]
    pub needs_full_resync: bool,
}

impl FolderSyncState {
    /// Whether an incremental listing can be requested
    pub fn can_sync_incrementally(&self) -> bool {
        self.watermark.is_some() && !self.needs_full_resync
    }

    /// Record a successful sync at the given watermark
    pub fn completed(mut self, uid_validity: Option<u64>, watermark: Option<Watermark>) -> Self {
        self.uid_validity = uid_validity;
        self.watermark = watermark;
        self.last_checked = Some(Utc::now());
        self.status = None;
        self.needs_full_resync = false;
        self
    }

    /// Record a failed sync, keeping the previous watermark
    pub fn failed(mut self, status: impl Into<String>) -> Self {
        self.last_checked = Some(Utc::now());
        self.status = Some(status.into());
        self
    }

    /// Drop the watermark so the next sync lists everything
    pub fn reset(mut self) -> Self {
        self.watermark = None;
        self.needs_full_resync = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_full_sync() {
        let state = FolderSyncState::default();
        assert!(!state.can_sync_incrementally());
        assert!(state.last_checked.is_none());
    }

    #[test]
    fn test_completed_state() {
        let state = FolderSyncState::default()
            .failed("timeout")
            .completed(Some(7), Some(Watermark::new(42)));
        assert_eq!(state.uid_validity, Some(7));
        assert_eq!(state.watermark.map(|w| w.highest_uid), Some(42));
        assert!(state.status.is_none());
        assert!(state.can_sync_incrementally());
    }

    #[test]
    fn test_failed_keeps_watermark() {
        let state = FolderSyncState::default()
            .completed(Some(1), Some(Watermark::new(10)))
            .failed("connection reset");
        assert_eq!(state.status.as_deref(), Some("connection reset"));
        assert_eq!(state.watermark, Some(Watermark::new(10)));
    }

    #[test]
    fn test_reset_forces_full_sync() {
        let state = FolderSyncState::default()
            .completed(Some(1), Some(Watermark::new(10)))
            .reset();
        assert!(state.needs_full_resync);
        assert!(!state.can_sync_incrementally());
    }

    #[test]
    fn test_serialization() {
        let state = FolderSyncState::default()
            .completed(Some(3), Some(Watermark::new(99).with_modseq(1234)));
        let json = serde_json::to_string(&state).unwrap();
        let deserialized: FolderSyncState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, deserialized);
    }
}
