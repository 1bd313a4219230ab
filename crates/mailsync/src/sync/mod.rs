//! Sync engine: folder reconciliation and account sessions

mod diff;
mod reconciler;
mod session;
mod timing;

pub use diff::{FolderChanges, compute_diff};
pub use reconciler::{CancellationToken, FolderReconciler, SyncPhase, SyncStats};
pub use session::{AccountSyncReport, AccountSyncSession, AccountSyncStatus, sync_accounts};
pub use timing::{backoff_delay, cooldown_elapsed};
