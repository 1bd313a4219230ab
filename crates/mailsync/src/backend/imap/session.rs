//! Narrow interface to an IMAP protocol client
//!
//! The adapter never parses IMAP wire data itself. Anything that can answer
//! these calls (a real client library, or [`super::MemoryImapServer`]) can
//! drive a sync. Per IMAP, UID commands act on the selected mailbox.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::RemoteError;

/// Response to SELECT
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    pub exists: u64,
    pub uid_validity: u64,
    pub uid_next: u64,
    /// HIGHESTMODSEQ, only with CONDSTORE
    pub highest_modseq: Option<u64>,
}

/// One line of a `UID FETCH (FLAGS RFC822.SIZE)` response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFlags {
    pub uid: u64,
    pub flags: Vec<String>,
    pub size: u64,
    pub modseq: Option<u64>,
}

/// Envelope data of one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub uid: u64,
    pub size: u64,
    pub flags: Vec<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub to: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBody {
    pub data: Vec<u8>,
    pub truncated: bool,
}

/// One authenticated IMAP connection
///
/// Timeouts are the implementation's business and surface as
/// [`crate::error::RemoteErrorKind::Timeout`].
pub trait ImapSession: Send {
    fn capabilities(&mut self) -> Result<Vec<String>, RemoteError>;

    /// Fails with `NotFound` if the mailbox does not exist
    fn select(&mut self, mailbox: &str) -> Result<MailboxStatus, RemoteError>;

    fn uid_search_all(&mut self) -> Result<Vec<u64>, RemoteError>;

    /// Flags of every message with UID >= `from_uid`; with `changed_since`,
    /// only those whose MODSEQ is greater
    fn uid_fetch_flags(
        &mut self,
        from_uid: u64,
        changed_since: Option<u64>,
    ) -> Result<Vec<FetchedFlags>, RemoteError>;

    /// Envelopes of the listed UIDs; missing UIDs are left out
    fn uid_fetch_envelopes(&mut self, uids: &[u64]) -> Result<Vec<Envelope>, RemoteError>;

    /// Body of one message, at most `max_bytes` long; None if the UID is gone
    fn uid_fetch_body(&mut self, uid: u64, max_bytes: u64) -> Result<Option<FetchedBody>, RemoteError>;

    /// Add or remove flags; returns the UIDs that existed
    fn uid_store(&mut self, uids: &[u64], flags: &[String], add: bool) -> Result<Vec<u64>, RemoteError>;

    /// COPYUID mapping from source to destination UID
    fn uid_copy(&mut self, uids: &[u64], mailbox: &str) -> Result<BTreeMap<u64, u64>, RemoteError>;

    fn uid_move(&mut self, uids: &[u64], mailbox: &str) -> Result<BTreeMap<u64, u64>, RemoteError>;

    /// Requires UIDPLUS
    fn uid_expunge(&mut self, uids: &[u64]) -> Result<(), RemoteError>;

    fn expunge(&mut self) -> Result<(), RemoteError>;

    /// `UID SEARCH HEADER`: messages whose `name` header contains `value`
    fn uid_search_header(&mut self, name: &str, value: &str) -> Result<Vec<u64>, RemoteError>;

    /// APPENDUID of the new message, when the server reports one
    fn append(&mut self, mailbox: &str, content: &[u8], flags: &[String]) -> Result<Option<u64>, RemoteError>;
}

/// Header fields of a raw RFC 822 message and its body
///
/// Names are lowercased and folded lines are joined.
pub fn split_message(content: &[u8]) -> (Vec<(String, String)>, String) {
    let text = String::from_utf8_lossy(content);
    let (head, body) = match text.find("\r\n\r\n") {
        Some(pos) => (&text[..pos], &text[pos + 4..]),
        None => match text.find("\n\n") {
            Some(pos) => (&text[..pos], &text[pos + 2..]),
            None => (text.as_ref(), ""),
        },
    };

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in head.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }
    (headers, body.to_string())
}

/// First value of header `name` (case-insensitive)
pub fn header_value(content: &[u8], name: &str) -> Option<String> {
    split_message(content)
        .0
        .into_iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}
