//! Account model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque account identifier scoping every other entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub Uuid);

impl AccountId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A configured mail account
///
/// Account settings are owned by the host application; the core only needs
/// the identity and the server location it syncs against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Email address
    pub email: String,
    /// Display name (can be customized by user)
    pub display_name: Option<String>,
    /// Incoming server URI, e.g. `imap+ssl://user@host:993`
    pub store_uri: String,
    /// When the account was added
    pub added_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account with a generated id
    pub fn new(email: impl Into<String>, store_uri: impl Into<String>) -> Self {
        Self {
            id: AccountId::generate(),
            email: email.into(),
            display_name: None,
            store_uri: store_uri.into(),
            added_at: Utc::now(),
        }
    }

    /// Set display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Name to show in logs and status lines
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.email)
    }
}
