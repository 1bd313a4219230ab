//! In-memory IMAP server
//!
//! Behaves like a small IMAP server with optional MOVE, UIDPLUS and
//! CONDSTORE. COPYUID and APPENDUID are only reported when UIDPLUS is
//! advertised. Used by tests and demos; failures can be injected per
//! operation to exercise retry and rollback paths.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::session::{
    Envelope, FetchedBody, FetchedFlags, ImapSession, MailboxStatus, header_value, split_message,
};
use crate::error::{RemoteError, RemoteErrorKind};

/// Operation a failure can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImapOp {
    Capabilities,
    Select,
    Search,
    FetchFlags,
    FetchEnvelopes,
    FetchBody,
    Store,
    Copy,
    Move,
    Expunge,
    Append,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    content: Vec<u8>,
    flags: BTreeSet<String>,
    modseq: u64,
}

#[derive(Debug, Clone)]
struct Mailbox {
    uid_validity: u64,
    uid_next: u64,
    highest_modseq: u64,
    messages: BTreeMap<u64, StoredMessage>,
}

impl Mailbox {
    fn new(uid_validity: u64) -> Self {
        Self {
            uid_validity,
            uid_next: 1,
            highest_modseq: 1,
            messages: BTreeMap::new(),
        }
    }

    fn insert(&mut self, content: Vec<u8>, flags: BTreeSet<String>) -> u64 {
        let uid = self.uid_next;
        self.uid_next += 1;
        self.highest_modseq += 1;
        self.messages.insert(
            uid,
            StoredMessage {
                content,
                flags,
                modseq: self.highest_modseq,
            },
        );
        uid
    }

    fn touch(&mut self, uid: u64) {
        self.highest_modseq += 1;
        if let Some(message) = self.messages.get_mut(&uid) {
            message.modseq = self.highest_modseq;
        }
    }
}

#[derive(Debug, Default)]
struct ServerState {
    mailboxes: BTreeMap<String, Mailbox>,
    capabilities: Vec<String>,
    failures: Vec<(ImapOp, RemoteError)>,
    next_uid_validity: u64,
    commands: Vec<ImapOp>,
}

/// Shared handle to an in-memory server; clones see the same mailboxes
#[derive(Debug, Clone)]
pub struct MemoryImapServer {
    state: Arc<Mutex<ServerState>>,
}

impl Default for MemoryImapServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryImapServer {
    /// Server advertising MOVE, UIDPLUS and CONDSTORE with an empty INBOX
    pub fn new() -> Self {
        let server = Self::with_capabilities(&["IMAP4rev1", "MOVE", "UIDPLUS", "CONDSTORE"]);
        server.add_mailbox("INBOX");
        server
    }

    pub fn with_capabilities(capabilities: &[&str]) -> Self {
        let state = ServerState {
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            next_uid_validity: 1000,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a connection
    pub fn session(&self) -> MemoryImapSession {
        MemoryImapSession {
            server: self.clone(),
            selected: None,
        }
    }

    pub fn add_mailbox(&self, name: &str) {
        let mut state = self.lock();
        if state.mailboxes.contains_key(name) {
            return;
        }
        state.next_uid_validity += 1;
        let validity = state.next_uid_validity;
        state.mailboxes.insert(name.to_string(), Mailbox::new(validity));
    }

    pub fn remove_mailbox(&self, name: &str) {
        self.lock().mailboxes.remove(name);
    }

    /// Deliver a raw RFC 822 message; returns its UID
    pub fn deliver(&self, mailbox: &str, content: &[u8], flags: &[&str]) -> u64 {
        let mut state = self.lock();
        let mailbox = state
            .mailboxes
            .entry(mailbox.to_string())
            .or_insert_with(|| Mailbox::new(1));
        mailbox.insert(content.to_vec(), flags.iter().map(|f| f.to_string()).collect())
    }

    /// Replace the flags of a message as another client would
    pub fn set_flags(&self, mailbox: &str, uid: u64, flags: &[&str]) {
        let mut state = self.lock();
        if let Some(mailbox) = state.mailboxes.get_mut(mailbox)
            && let Some(message) = mailbox.messages.get_mut(&uid)
        {
            message.flags = flags.iter().map(|f| f.to_string()).collect();
            mailbox.touch(uid);
        }
    }

    /// Expunge a message as another client would
    pub fn remove(&self, mailbox: &str, uid: u64) {
        let mut state = self.lock();
        if let Some(mailbox) = state.mailboxes.get_mut(mailbox) {
            mailbox.messages.remove(&uid);
            mailbox.highest_modseq += 1;
        }
    }

    pub fn flags(&self, mailbox: &str, uid: u64) -> Option<Vec<String>> {
        let state = self.lock();
        let message = state.mailboxes.get(mailbox)?.messages.get(&uid)?;
        Some(message.flags.iter().cloned().collect())
    }

    pub fn uids(&self, mailbox: &str) -> Vec<u64> {
        let state = self.lock();
        state
            .mailboxes
            .get(mailbox)
            .map(|m| m.messages.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn content(&self, mailbox: &str, uid: u64) -> Option<Vec<u8>> {
        let state = self.lock();
        Some(state.mailboxes.get(mailbox)?.messages.get(&uid)?.content.clone())
    }

    /// Renumber a mailbox under a new UIDVALIDITY, as after a server rebuild
    pub fn renumber(&self, mailbox: &str, uid_validity: u64) {
        let mut state = self.lock();
        if let Some(mailbox) = state.mailboxes.get_mut(mailbox) {
            let messages: Vec<StoredMessage> =
                std::mem::take(&mut mailbox.messages).into_values().collect();
            *mailbox = Mailbox::new(uid_validity);
            for message in messages {
                mailbox.insert(message.content, message.flags);
            }
        }
    }

    /// Make the next `op` fail with `error`
    pub fn fail_next(&self, op: ImapOp, error: RemoteError) {
        self.lock().failures.push((op, error));
    }

    /// Operations executed so far, in order
    pub fn commands(&self) -> Vec<ImapOp> {
        self.lock().commands.clone()
    }
}

/// One connection to a [`MemoryImapServer`]
#[derive(Debug)]
pub struct MemoryImapSession {
    server: MemoryImapServer,
    selected: Option<String>,
}

impl MemoryImapSession {
    /// Lock the server, record `op` and consume an injected failure for it
    fn begin(&self, op: ImapOp) -> Result<MutexGuard<'_, ServerState>, RemoteError> {
        let mut state = self.server.lock();
        state.commands.push(op);
        if let Some(pos) = state.failures.iter().position(|(o, _)| *o == op) {
            let (_, error) = state.failures.remove(pos);
            return Err(error);
        }
        Ok(state)
    }

    fn selected_name(&self) -> Result<&str, RemoteError> {
        self.selected
            .as_deref()
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::Protocol, "no mailbox selected"))
    }
}

fn selected_mailbox<'s>(state: &'s mut ServerState, name: &str) -> Result<&'s mut Mailbox, RemoteError> {
    state
        .mailboxes
        .get_mut(name)
        .ok_or_else(|| RemoteError::not_found(format!("mailbox {name} no longer exists")))
}

fn advertises(state: &ServerState, capability: &str) -> bool {
    state.capabilities.iter().any(|c| c.eq_ignore_ascii_case(capability))
}

fn condstore(state: &ServerState) -> bool {
    advertises(state, "CONDSTORE") || advertises(state, "QRESYNC")
}

/// COPYUID as reported to the client
fn copy_uids(state: &ServerState, map: BTreeMap<u64, u64>) -> BTreeMap<u64, u64> {
    if advertises(state, "UIDPLUS") { map } else { BTreeMap::new() }
}

impl ImapSession for MemoryImapSession {
    fn capabilities(&mut self) -> Result<Vec<String>, RemoteError> {
        let state = self.begin(ImapOp::Capabilities)?;
        Ok(state.capabilities.clone())
    }

    fn select(&mut self, mailbox: &str) -> Result<MailboxStatus, RemoteError> {
        let status = {
            let state = self.begin(ImapOp::Select)?;
            let with_modseq = condstore(&state);
            let found = state
                .mailboxes
                .get(mailbox)
                .ok_or_else(|| RemoteError::not_found(format!("mailbox {mailbox} does not exist")))?;
            MailboxStatus {
                exists: found.messages.len() as u64,
                uid_validity: found.uid_validity,
                uid_next: found.uid_next,
                highest_modseq: with_modseq.then_some(found.highest_modseq),
            }
        };
        self.selected = Some(mailbox.to_string());
        Ok(status)
    }

    fn uid_search_all(&mut self) -> Result<Vec<u64>, RemoteError> {
        let name = self.selected_name()?.to_string();
        let mut state = self.begin(ImapOp::Search)?;
        Ok(selected_mailbox(&mut state, &name)?.messages.keys().copied().collect())
    }

    fn uid_fetch_flags(
        &mut self,
        from_uid: u64,
        changed_since: Option<u64>,
    ) -> Result<Vec<FetchedFlags>, RemoteError> {
        let name = self.selected_name()?.to_string();
        let mut state = self.begin(ImapOp::FetchFlags)?;
        let mailbox = selected_mailbox(&mut state, &name)?;
        Ok(mailbox
            .messages
            .range(from_uid..)
            .filter(|(_, m)| changed_since.is_none_or(|since| m.modseq > since))
            .map(|(uid, m)| FetchedFlags {
                uid: *uid,
                flags: m.flags.iter().cloned().collect(),
                size: m.content.len() as u64,
                modseq: Some(m.modseq),
            })
            .collect())
    }

    fn uid_fetch_envelopes(&mut self, uids: &[u64]) -> Result<Vec<Envelope>, RemoteError> {
        let name = self.selected_name()?.to_string();
        let mut state = self.begin(ImapOp::FetchEnvelopes)?;
        let mailbox = selected_mailbox(&mut state, &name)?;
        Ok(uids
            .iter()
            .filter_map(|uid| {
                let message = mailbox.messages.get(uid)?;
                let mut envelope = parse_envelope(&message.content);
                envelope.uid = *uid;
                envelope.size = message.content.len() as u64;
                envelope.flags = message.flags.iter().cloned().collect();
                Some(envelope)
            })
            .collect())
    }

    fn uid_fetch_body(&mut self, uid: u64, max_bytes: u64) -> Result<Option<FetchedBody>, RemoteError> {
        let name = self.selected_name()?.to_string();
        let mut state = self.begin(ImapOp::FetchBody)?;
        let mailbox = selected_mailbox(&mut state, &name)?;
        Ok(mailbox.messages.get(&uid).map(|m| {
            let limit = usize::try_from(max_bytes).unwrap_or(usize::MAX);
            let truncated = m.content.len() > limit;
            FetchedBody {
                data: m.content[..m.content.len().min(limit)].to_vec(),
                truncated,
            }
        }))
    }

    fn uid_store(&mut self, uids: &[u64], flags: &[String], add: bool) -> Result<Vec<u64>, RemoteError> {
        let name = self.selected_name()?.to_string();
        let mut state = self.begin(ImapOp::Store)?;
        let mailbox = selected_mailbox(&mut state, &name)?;
        let mut existing = Vec::new();
        for uid in uids {
            let Some(message) = mailbox.messages.get_mut(uid) else {
                continue;
            };
            for flag in flags {
                if add {
                    message.flags.insert(flag.clone());
                } else {
                    message.flags.remove(flag);
                }
            }
            existing.push(*uid);
            mailbox.touch(*uid);
        }
        Ok(existing)
    }

    fn uid_copy(&mut self, uids: &[u64], target: &str) -> Result<BTreeMap<u64, u64>, RemoteError> {
        let name = self.selected_name()?.to_string();
        let mut state = self.begin(ImapOp::Copy)?;
        let map = copy_messages(&mut state, &name, uids, target, false)?;
        Ok(copy_uids(&state, map))
    }

    fn uid_move(&mut self, uids: &[u64], target: &str) -> Result<BTreeMap<u64, u64>, RemoteError> {
        let name = self.selected_name()?.to_string();
        let mut state = self.begin(ImapOp::Move)?;
        if !advertises(&state, "MOVE") {
            return Err(RemoteError::new(RemoteErrorKind::Protocol, "MOVE not supported"));
        }
        let map = copy_messages(&mut state, &name, uids, target, true)?;
        Ok(copy_uids(&state, map))
    }

    fn uid_expunge(&mut self, uids: &[u64]) -> Result<(), RemoteError> {
        let name = self.selected_name()?.to_string();
        let mut state = self.begin(ImapOp::Expunge)?;
        if !advertises(&state, "UIDPLUS") {
            return Err(RemoteError::new(RemoteErrorKind::Protocol, "UID EXPUNGE needs UIDPLUS"));
        }
        let mailbox = selected_mailbox(&mut state, &name)?;
        mailbox
            .messages
            .retain(|uid, m| !(uids.contains(uid) && m.flags.contains("\\Deleted")));
        mailbox.highest_modseq += 1;
        Ok(())
    }

    fn expunge(&mut self) -> Result<(), RemoteError> {
        let name = self.selected_name()?.to_string();
        let mut state = self.begin(ImapOp::Expunge)?;
        let mailbox = selected_mailbox(&mut state, &name)?;
        mailbox.messages.retain(|_, m| !m.flags.contains("\\Deleted"));
        mailbox.highest_modseq += 1;
        Ok(())
    }

    fn uid_search_header(&mut self, name: &str, value: &str) -> Result<Vec<u64>, RemoteError> {
        let selected = self.selected_name()?.to_string();
        let mut state = self.begin(ImapOp::Search)?;
        let mailbox = selected_mailbox(&mut state, &selected)?;
        let needle = value.to_lowercase();
        Ok(mailbox
            .messages
            .iter()
            .filter(|(_, m)| {
                header_value(&m.content, name).is_some_and(|v| v.to_lowercase().contains(&needle))
            })
            .map(|(uid, _)| *uid)
            .collect())
    }

    fn append(&mut self, target: &str, content: &[u8], flags: &[String]) -> Result<Option<u64>, RemoteError> {
        let mut state = self.begin(ImapOp::Append)?;
        let uidplus = advertises(&state, "UIDPLUS");
        let mailbox = state
            .mailboxes
            .get_mut(target)
            .ok_or_else(|| RemoteError::rejected(format!("[TRYCREATE] {target}")))?;
        let uid = mailbox.insert(content.to_vec(), flags.iter().cloned().collect());
        Ok(uidplus.then_some(uid))
    }
}

fn copy_messages(
    state: &mut ServerState,
    source: &str,
    uids: &[u64],
    target: &str,
    remove_source: bool,
) -> Result<BTreeMap<u64, u64>, RemoteError> {
    if !state.mailboxes.contains_key(target) {
        return Err(RemoteError::rejected(format!("[TRYCREATE] {target}")));
    }
    let copies: Vec<(u64, StoredMessage)> = {
        let mailbox = selected_mailbox(state, source)?;
        uids.iter()
            .filter_map(|uid| mailbox.messages.get(uid).map(|m| (*uid, m.clone())))
            .collect()
    };
    if remove_source {
        let mailbox = selected_mailbox(state, source)?;
        for (uid, _) in &copies {
            mailbox.messages.remove(uid);
        }
        mailbox.highest_modseq += 1;
    }

    let mut map = BTreeMap::new();
    if let Some(destination) = state.mailboxes.get_mut(target) {
        for (uid, message) in copies {
            map.insert(uid, destination.insert(message.content, message.flags));
        }
    }
    Ok(map)
}

/// Compose a minimal RFC 822 message
pub fn compose_message(subject: &str, message_id: &str, in_reply_to: Option<&str>, body: &str) -> Vec<u8> {
    let mut out = String::new();
    out.push_str("From: Sender <sender@example.com>\r\n");
    out.push_str("To: Recipient <rcpt@example.com>\r\n");
    out.push_str(&format!("Subject: {subject}\r\n"));
    out.push_str("Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n");
    out.push_str(&format!("Message-ID: {message_id}\r\n"));
    if let Some(parent) = in_reply_to {
        out.push_str(&format!("In-Reply-To: {parent}\r\n"));
        out.push_str(&format!("References: {parent}\r\n"));
    }
    out.push_str("\r\n");
    out.push_str(body);
    out.into_bytes()
}

/// Header fields of a raw message, with folded lines joined
fn parse_envelope(content: &[u8]) -> Envelope {
    let (headers, body) = split_message(content);
    let header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    };

    let preview: String = body.split_whitespace().collect::<Vec<_>>().join(" ");
    Envelope {
        subject: header("subject"),
        from: header("from"),
        to: header("to")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default(),
        date: header("date")
            .and_then(|d| DateTime::parse_from_rfc2822(&d).ok())
            .map(|d| d.with_timezone(&Utc)),
        message_id: header("message-id"),
        in_reply_to: header("in-reply-to"),
        references: header("references")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        preview: (!preview.is_empty()).then(|| preview.chars().take(200).collect()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliver_and_fetch() {
        let server = MemoryImapServer::new();
        let uid = server.deliver("INBOX", &compose_message("Hello", "<a@x>", None, "Hi there"), &["\\Seen"]);
        let mut session = server.session();
        let status = session.select("INBOX").unwrap();
        assert_eq!(status.exists, 1);
        assert!(status.highest_modseq.is_some());

        let envelopes = session.uid_fetch_envelopes(&[uid, 99]).unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].subject.as_deref(), Some("Hello"));
        assert_eq!(envelopes[0].message_id.as_deref(), Some("<a@x>"));
        assert_eq!(envelopes[0].preview.as_deref(), Some("Hi there"));
        assert_eq!(envelopes[0].flags, vec!["\\Seen".to_string()]);
    }

    #[test]
    fn test_changed_since() {
        let server = MemoryImapServer::new();
        let a = server.deliver("INBOX", b"Subject: a\r\n\r\n", &[]);
        let b = server.deliver("INBOX", b"Subject: b\r\n\r\n", &[]);
        let mut session = server.session();
        let modseq = session.select("INBOX").unwrap().highest_modseq.unwrap();

        server.set_flags("INBOX", b, &["\\Flagged"]);
        let changed = session.uid_fetch_flags(1, Some(modseq)).unwrap();
        assert_eq!(changed.iter().map(|f| f.uid).collect::<Vec<_>>(), vec![b]);
        assert_eq!(session.uid_fetch_flags(1, None).unwrap().len(), 2);
        assert!(session.uid_fetch_flags(b + 1, None).unwrap().is_empty());
        let _ = a;
    }

    #[test]
    fn test_move_assigns_new_uids() {
        let server = MemoryImapServer::new();
        server.add_mailbox("Archive");
        let uid = server.deliver("INBOX", b"Subject: a\r\n\r\n", &[]);
        let mut session = server.session();
        session.select("INBOX").unwrap();
        let map = session.uid_move(&[uid], "Archive").unwrap();
        assert_eq!(map.len(), 1);
        assert!(server.uids("INBOX").is_empty());
        assert_eq!(server.uids("Archive"), vec![map[&uid]]);

        let err = session.uid_move(&[uid], "Nowhere").unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Rejected);
    }

    #[test]
    fn test_copyuid_and_appenduid_need_uidplus() {
        let server = MemoryImapServer::with_capabilities(&["IMAP4rev1"]);
        server.add_mailbox("INBOX");
        server.add_mailbox("Archive");
        let uid = server.deliver("INBOX", &compose_message("a", "<a@x>", None, "hi"), &[]);
        let mut session = server.session();
        session.select("INBOX").unwrap();

        assert!(session.uid_copy(&[uid], "Archive").unwrap().is_empty());
        assert_eq!(server.uids("Archive").len(), 1);
        assert_eq!(session.append("Archive", b"Subject: b\r\n\r\n", &[]).unwrap(), None);
        assert_eq!(server.uids("Archive").len(), 2);
        assert!(session.uid_expunge(&[uid]).is_err());
    }

    #[test]
    fn test_search_by_header() {
        let server = MemoryImapServer::new();
        let a = server.deliver("INBOX", &compose_message("a", "<a@x>", None, "hi"), &[]);
        server.deliver("INBOX", &compose_message("b", "<b@x>", None, "hi"), &[]);
        let mut session = server.session();
        session.select("INBOX").unwrap();
        assert_eq!(session.uid_search_header("Message-ID", "<A@x>").unwrap(), vec![a]);
        assert!(session.uid_search_header("Message-ID", "<z@x>").unwrap().is_empty());
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let server = MemoryImapServer::new();
        server.fail_next(ImapOp::Select, RemoteError::network("connection reset"));
        let mut session = server.session();
        assert!(session.select("INBOX").is_err());
        assert!(session.select("INBOX").is_ok());
    }

    #[test]
    fn test_renumber_changes_uid_validity() {
        let server = MemoryImapServer::new();
        server.deliver("INBOX", b"Subject: a\r\n\r\n", &[]);
        server.deliver("INBOX", b"Subject: b\r\n\r\n", &[]);
        server.remove("INBOX", 1);
        server.renumber("INBOX", 77);
        let mut session = server.session();
        let status = session.select("INBOX").unwrap();
        assert_eq!(status.uid_validity, 77);
        assert_eq!(server.uids("INBOX"), vec![1]);
    }
}
