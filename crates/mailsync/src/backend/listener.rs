//! Sync progress callbacks

use crate::error::SyncError;
use crate::models::RemoteId;
use crate::sync::{SyncPhase, SyncStats};

/// Receives progress of a folder sync
///
/// All methods have empty defaults so hosts implement only what they show.
/// Batches never include messages the overlay currently hides.
pub trait SyncListener {
    fn sync_started(&mut self, _folder: &str) {}

    fn phase_changed(&mut self, _folder: &str, _phase: SyncPhase) {}

    fn messages_added(&mut self, _folder: &str, _ids: &[RemoteId]) {}

    fn messages_removed(&mut self, _folder: &str, _ids: &[RemoteId]) {}

    fn messages_flag_changed(&mut self, _folder: &str, _ids: &[RemoteId]) {}

    fn sync_progress(&mut self, _folder: &str, _current: usize, _total: usize) {}

    fn sync_finished(&mut self, _folder: &str, _stats: &SyncStats) {}

    fn sync_failed(&mut self, _folder: &str, _error: &SyncError) {}
}

/// Listener that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl SyncListener for NoopListener {}

/// One recorded callback
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Started(String),
    Phase(SyncPhase),
    Added(Vec<RemoteId>),
    Removed(Vec<RemoteId>),
    FlagsChanged(Vec<RemoteId>),
    Progress(usize, usize),
    Finished(SyncStats),
    Failed(SyncError),
}

/// Listener that keeps every callback, for diagnostics and tests
#[derive(Debug, Default, Clone)]
pub struct RecordingListener {
    pub events: Vec<ListenerEvent>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// All ids reported added, in order
    pub fn added(&self) -> Vec<RemoteId> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::Added(ids) => Some(ids.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn removed(&self) -> Vec<RemoteId> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::Removed(ids) => Some(ids.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn flag_changed(&self) -> Vec<RemoteId> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::FlagsChanged(ids) => Some(ids.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Number of terminal callbacks (finished or failed)
    pub fn terminal_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, ListenerEvent::Finished(_) | ListenerEvent::Failed(_)))
            .count()
    }

    pub fn phases(&self) -> Vec<SyncPhase> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::Phase(p) => Some(*p),
                _ => None,
            })
            .collect()
    }
}

impl SyncListener for RecordingListener {
    fn sync_started(&mut self, folder: &str) {
        self.events.push(ListenerEvent::Started(folder.to_string()));
    }

    fn phase_changed(&mut self, _folder: &str, phase: SyncPhase) {
        self.events.push(ListenerEvent::Phase(phase));
    }

    fn messages_added(&mut self, _folder: &str, ids: &[RemoteId]) {
        self.events.push(ListenerEvent::Added(ids.to_vec()));
    }

    fn messages_removed(&mut self, _folder: &str, ids: &[RemoteId]) {
        self.events.push(ListenerEvent::Removed(ids.to_vec()));
    }

    fn messages_flag_changed(&mut self, _folder: &str, ids: &[RemoteId]) {
        self.events.push(ListenerEvent::FlagsChanged(ids.to_vec()));
    }

    fn sync_progress(&mut self, _folder: &str, current: usize, total: usize) {
        self.events.push(ListenerEvent::Progress(current, total));
    }

    fn sync_finished(&mut self, _folder: &str, stats: &SyncStats) {
        self.events.push(ListenerEvent::Finished(stats.clone()));
    }

    fn sync_failed(&mut self, _folder: &str, error: &SyncError) {
        self.events.push(ListenerEvent::Failed(error.clone()));
    }
}
