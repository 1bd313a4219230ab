//! User mutations: flags, moves, deletes, appends
//!
//! Actions update the overlay, the pending journal and the local store; the
//! server is updated later when the journal is drained.

mod handler;

pub use handler::{MailActions, draft_flags};
