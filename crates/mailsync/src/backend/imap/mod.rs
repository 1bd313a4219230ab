//! IMAP reference adapter
//!
//! Wraps an [`ImapSession`] (the protocol client) in [`ImapRemote`], which
//! implements the protocol-agnostic [`crate::backend::RemoteSession`], and
//! exposes [`ImapBackend`] for account syncs.

mod backend;
mod capability;
mod flags;
mod memory;
mod remote;
mod session;
mod uri;

pub use backend::ImapBackend;
pub use capability::ImapCapabilities;
pub use flags::{flag_from_imap, flag_to_imap, flags_from_imap, flags_to_imap};
pub use memory::{ImapOp, MemoryImapServer, MemoryImapSession, compose_message};
pub use remote::ImapRemote;
pub use session::{Envelope, FetchedBody, FetchedFlags, ImapSession, MailboxStatus};
pub use uri::{AuthType, ConnectionSecurity, ServerSettings, decode_store_uri, encode_store_uri};
