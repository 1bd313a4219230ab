//! Query API for UI consumption
//!
//! Readers get store rows with the account overlay applied: pending flag
//! changes and moves are visible at once, hidden entities and deleted
//! tombstones are left out.

mod messages;
mod threads;

pub use messages::{MessageView, SearchHit, get_message_view, list_messages, search};
pub use threads::{ThreadDetail, ThreadSummary, get_thread_detail, list_threads};
