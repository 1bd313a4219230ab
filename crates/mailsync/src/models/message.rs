//! Message model: local rows, remote summaries and flags

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use super::{FolderId, ThreadId};

/// Prefix of remote ids the server has not assigned yet
const PLACEHOLDER_PREFIX: &str = "local:";

/// Local message id. Stable for the lifetime of the row, including moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalMessageId(pub i64);

impl fmt::Display for LocalMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Protocol-specific message identifier within a folder (an IMAP UID)
///
/// Numeric ids order numerically, so "9" sorts before "10". Non-numeric ids
/// (placeholders, other protocols) sort after all numeric ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteId(pub String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh placeholder for a message the server has not numbered yet
    pub fn placeholder() -> Self {
        Self(format!("{PLACEHOLDER_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with(PLACEHOLDER_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value, if this is a numeric UID
    pub fn as_uid(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl From<u64> for RemoteId {
    fn from(uid: u64) -> Self {
        Self(uid.to_string())
    }
}

impl From<&str> for RemoteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RemoteId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for RemoteId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.as_uid(), other.as_uid()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for RemoteId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Message flags: the IMAP system flags plus free-form keywords
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    Read,
    Answered,
    Flagged,
    Forwarded,
    Deleted,
    Draft,
    Custom(String),
}

impl Flag {
    /// Storage name used in the `message_flags` table
    pub fn storage_name(&self) -> String {
        match self {
            Flag::Read => "read".to_string(),
            Flag::Answered => "answered".to_string(),
            Flag::Flagged => "flagged".to_string(),
            Flag::Forwarded => "forwarded".to_string(),
            Flag::Deleted => "deleted".to_string(),
            Flag::Draft => "draft".to_string(),
            Flag::Custom(keyword) => format!("kw:{keyword}"),
        }
    }

    /// Inverse of [`Flag::storage_name`]
    pub fn from_storage_name(name: &str) -> Option<Self> {
        Some(match name {
            "read" => Flag::Read,
            "answered" => Flag::Answered,
            "flagged" => Flag::Flagged,
            "forwarded" => Flag::Forwarded,
            "deleted" => Flag::Deleted,
            "draft" => Flag::Draft,
            other => Flag::Custom(other.strip_prefix("kw:")?.to_string()),
        })
    }
}

pub type FlagSet = BTreeSet<Flag>;

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub email: String,
}

impl EmailAddress {
    /// Create a new email address with just the email
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Create a new email address with a display name
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse an email address from a string like "John Doe <john@example.com>"
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"');
            let email = s[angle_start + 1..angle_end].trim();
            return Self {
                name: if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                },
                email: email.to_string(),
            };
        }

        Self {
            name: None,
            email: s.to_string(),
        }
    }

    /// Parse a comma-separated address list
    pub fn parse_list(s: &str) -> Vec<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Self::parse)
            .collect()
    }

    /// Format the email address for display
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// What the server reports about a message: envelope plus flags
///
/// Input to [`crate::storage::MailStore::upsert_messages`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub remote_id: RemoteId,
    pub flags: FlagSet,
    pub size: u64,
    pub subject: String,
    pub from: Option<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub date: Option<DateTime<Utc>>,
    /// Message-ID header, without angle brackets
    pub message_id_header: Option<String>,
    pub in_reply_to: Option<String>,
    /// References header, oldest first
    pub references: Vec<String>,
    pub preview: String,
}

impl MessageSummary {
    pub fn builder(remote_id: impl Into<RemoteId>) -> MessageSummaryBuilder {
        MessageSummaryBuilder::new(remote_id.into())
    }
}

/// Builder for creating MessageSummary instances
pub struct MessageSummaryBuilder {
    summary: MessageSummary,
}

impl MessageSummaryBuilder {
    fn new(remote_id: RemoteId) -> Self {
        Self {
            summary: MessageSummary {
                remote_id,
                flags: FlagSet::new(),
                size: 0,
                subject: String::new(),
                from: None,
                to: Vec::new(),
                date: None,
                message_id_header: None,
                in_reply_to: None,
                references: Vec::new(),
                preview: String::new(),
            },
        }
    }

    pub fn flag(mut self, flag: Flag) -> Self {
        self.summary.flags.insert(flag);
        self
    }

    pub fn flags(mut self, flags: FlagSet) -> Self {
        self.summary.flags = flags;
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.summary.size = size;
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.summary.subject = subject.into();
        self
    }

    pub fn from(mut self, from: EmailAddress) -> Self {
        self.summary.from = Some(from);
        self
    }

    pub fn to(mut self, to: Vec<EmailAddress>) -> Self {
        self.summary.to = to;
        self
    }

    pub fn date(mut self, date: DateTime<Utc>) -> Self {
        self.summary.date = Some(date);
        self
    }

    pub fn message_id_header(mut self, id: impl Into<String>) -> Self {
        self.summary.message_id_header = Some(normalize_message_id(&id.into()));
        self
    }

    pub fn in_reply_to(mut self, id: impl Into<String>) -> Self {
        self.summary.in_reply_to = Some(normalize_message_id(&id.into()));
        self
    }

    pub fn references(mut self, refs: Vec<String>) -> Self {
        self.summary.references = refs.iter().map(|r| normalize_message_id(r)).collect();
        self
    }

    pub fn preview(mut self, preview: impl Into<String>) -> Self {
        self.summary.preview = preview.into();
        self
    }

    pub fn build(self) -> MessageSummary {
        self.summary
    }
}

/// Strip whitespace and angle brackets from a Message-ID value
pub(crate) fn normalize_message_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

/// A message row in the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: LocalMessageId,
    pub folder_id: FolderId,
    pub remote_id: RemoteId,
    pub flags: FlagSet,
    pub thread_id: ThreadId,
    pub subject: String,
    pub from: Option<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub date: Option<DateTime<Utc>>,
    pub message_id_header: Option<String>,
    pub size: u64,
    /// Whether the full body has been downloaded
    pub complete: bool,
    pub preview: String,
}

impl Message {
    pub fn has_flag(&self, flag: &Flag) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_read(&self) -> bool {
        self.has_flag(&Flag::Read)
    }

    pub fn is_deleted(&self) -> bool {
        self.has_flag(&Flag::Deleted)
    }
}
