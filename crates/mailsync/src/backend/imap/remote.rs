//! [`RemoteSession`] over an [`ImapSession`]

use std::collections::BTreeSet;

use log::{debug, warn};

use super::capability::ImapCapabilities;
use super::flags::{flag_to_imap, flags_from_imap, flags_to_imap};
use super::session::{ImapSession, MailboxStatus, header_value};
use crate::backend::{
    CommandReplayer, FetchedContent, ListingRequest, RemoteCommand, RemoteEntry,
    RemoteFolderStatus, RemoteListing, RemoteSession, ReplayOutcome, UidMap,
};
use crate::error::{RemoteError, RemoteErrorKind};
use crate::models::{EmailAddress, Flag, MessageSummary, RemoteId, Watermark};

/// An open IMAP connection, usable as a sync handle
pub struct ImapRemote<S: ImapSession> {
    session: S,
    capabilities: Option<ImapCapabilities>,
    selected: Option<(String, MailboxStatus)>,
}

/// Numeric UIDs of `ids`; placeholders and foreign ids are skipped
fn uids(ids: &[RemoteId]) -> Vec<u64> {
    ids.iter().filter_map(RemoteId::as_uid).collect()
}

impl<S: ImapSession> ImapRemote<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            capabilities: None,
            selected: None,
        }
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn capabilities(&mut self) -> Result<ImapCapabilities, RemoteError> {
        if let Some(caps) = self.capabilities {
            return Ok(caps);
        }
        let caps = ImapCapabilities::parse(&self.session.capabilities()?);
        debug!("Server capabilities: {caps:?}");
        self.capabilities = Some(caps);
        Ok(caps)
    }

    fn select(&mut self, mailbox: &str) -> Result<MailboxStatus, RemoteError> {
        self.selected = None;
        let status = self.session.select(mailbox)?;
        self.selected = Some((mailbox.to_string(), status));
        Ok(status)
    }

    fn ensure_selected(&mut self, mailbox: &str) -> Result<MailboxStatus, RemoteError> {
        match &self.selected {
            Some((name, status)) if name == mailbox => Ok(*status),
            _ => self.select(mailbox),
        }
    }

    /// Select the command's mailbox; a missing mailbox makes the command
    /// permanently inapplicable
    fn select_for_replay(&mut self, mailbox: &str) -> Result<Option<String>, RemoteError> {
        match self.ensure_selected(mailbox) {
            Ok(_) => Ok(None),
            Err(e) if e.kind == RemoteErrorKind::NotFound => {
                Ok(Some(format!("mailbox {mailbox} does not exist")))
            }
            Err(e) => Err(e),
        }
    }

    /// Look up messages in `mailbox` by Message-ID and add the UIDs found to
    /// `map`, for servers that report no COPYUID or APPENDUID
    ///
    /// The command already took effect, so failures are logged, not returned.
    fn recover_uids(&mut self, mailbox: &str, wanted: &[(RemoteId, String)], map: &mut UidMap) {
        let mut taken: BTreeSet<u64> = map.values().filter_map(RemoteId::as_uid).collect();
        let result: Result<(), RemoteError> = (|| {
            self.ensure_selected(mailbox)?;
            for (old, message_id) in wanted {
                if map.contains_key(old) {
                    continue;
                }
                let found = self.session.uid_search_header("Message-ID", message_id)?;
                match found.into_iter().filter(|uid| !taken.contains(uid)).max() {
                    Some(uid) => {
                        taken.insert(uid);
                        map.insert(old.clone(), RemoteId::from(uid));
                    }
                    None => debug!("No message {message_id} in {mailbox}"),
                }
            }
            Ok(())
        })();
        if let Err(e) = result {
            self.selected = None;
            warn!("Could not look up new UIDs in {mailbox}: {e}");
        }
    }

    fn execute(&mut self, command: &RemoteCommand) -> Result<ReplayOutcome, RemoteError> {
        if let RemoteCommand::Append {
            folder,
            placeholder,
            content,
            flags,
        } = command
        {
            let uid = self.session.append(folder, content, &flags_to_imap(flags))?;
            let mut map = UidMap::new();
            match uid {
                Some(uid) => {
                    map.insert(placeholder.clone(), RemoteId::from(uid));
                }
                None => {
                    if let Some(message_id) = header_value(content, "Message-ID") {
                        self.recover_uids(folder, &[(placeholder.clone(), message_id)], &mut map);
                    }
                }
            }
            return Ok(ReplayOutcome::Applied(map));
        }

        if let Some(reason) = self.select_for_replay(command.folder())? {
            return Ok(ReplayOutcome::PermanentFailure(reason));
        }
        let caps = self.capabilities()?;

        match command {
            RemoteCommand::SetFlag {
                ids, flag, value, ..
            } => {
                let existing = self
                    .session
                    .uid_store(&uids(ids), &[flag_to_imap(flag)], *value)?;
                Ok(if existing.is_empty() {
                    ReplayOutcome::AlreadyApplied
                } else {
                    ReplayOutcome::Applied(UidMap::new())
                })
            }
            RemoteCommand::Move { dst, ids, .. } => {
                let mut source = uids(ids);
                // Without COPYUID the new UIDs are found again by Message-ID
                let mut message_ids: Vec<(RemoteId, String)> = Vec::new();
                if !caps.uidplus {
                    let present = self.session.uid_fetch_envelopes(&source)?;
                    if present.is_empty() {
                        return Ok(ReplayOutcome::AlreadyApplied);
                    }
                    source = present.iter().map(|env| env.uid).collect();
                    message_ids = present
                        .into_iter()
                        .filter_map(|env| Some((RemoteId::from(env.uid), env.message_id?)))
                        .collect();
                }

                let moved = if caps.move_ext {
                    self.session.uid_move(&source, dst)?
                } else {
                    let copied = self.session.uid_copy(&source, dst)?;
                    let flagged =
                        self.session
                            .uid_store(&source, &[flag_to_imap(&Flag::Deleted)], true)?;
                    if flagged.is_empty() {
                        return Ok(ReplayOutcome::AlreadyApplied);
                    }
                    if caps.uidplus {
                        self.session.uid_expunge(&flagged)?;
                    }
                    copied
                };
                if caps.uidplus && moved.is_empty() {
                    return Ok(ReplayOutcome::AlreadyApplied);
                }

                let mut map: UidMap = moved
                    .into_iter()
                    .map(|(old, new)| (RemoteId::from(old), RemoteId::from(new)))
                    .collect();
                if !message_ids.is_empty() {
                    self.recover_uids(dst, &message_ids, &mut map);
                }
                Ok(ReplayOutcome::Applied(map))
            }
            RemoteCommand::Delete { ids, .. } => {
                let targets = uids(ids);
                let existing =
                    self.session
                        .uid_store(&targets, &[flag_to_imap(&Flag::Deleted)], true)?;
                if existing.is_empty() {
                    return Ok(ReplayOutcome::AlreadyApplied);
                }
                if caps.uidplus {
                    self.session.uid_expunge(&existing)?;
                }
                Ok(ReplayOutcome::Applied(UidMap::new()))
            }
            RemoteCommand::Expunge { .. } => {
                self.session.expunge()?;
                Ok(ReplayOutcome::Applied(UidMap::new()))
            }
            RemoteCommand::MarkAllAsRead { .. } => {
                let all = self.session.uid_search_all()?;
                if all.is_empty() {
                    return Ok(ReplayOutcome::AlreadyApplied);
                }
                self.session
                    .uid_store(&all, &[flag_to_imap(&Flag::Read)], true)?;
                Ok(ReplayOutcome::Applied(UidMap::new()))
            }
            RemoteCommand::Append { .. } => Ok(ReplayOutcome::AlreadyApplied),
        }
    }
}

impl<S: ImapSession> CommandReplayer for ImapRemote<S> {
    fn replay(&mut self, command: &RemoteCommand) -> ReplayOutcome {
        match self.execute(command) {
            Ok(outcome) => outcome,
            Err(e) => match e.kind {
                RemoteErrorKind::NotFound => {
                    debug!("Treating not-found reply as already applied: {e}");
                    ReplayOutcome::AlreadyApplied
                }
                RemoteErrorKind::Rejected | RemoteErrorKind::Protocol => {
                    warn!("Server rejected command in {}: {e}", command.folder());
                    ReplayOutcome::PermanentFailure(e.message)
                }
                RemoteErrorKind::Network
                | RemoteErrorKind::Timeout
                | RemoteErrorKind::Authentication => {
                    self.selected = None;
                    ReplayOutcome::TransientFailure(e)
                }
            },
        }
    }
}

impl<S: ImapSession> RemoteSession for ImapRemote<S> {
    fn open_folder(&mut self, server_id: &str) -> Result<RemoteFolderStatus, RemoteError> {
        let caps = self.capabilities()?;
        let status = self.select(server_id)?;
        Ok(RemoteFolderStatus {
            uid_validity: Some(status.uid_validity),
            message_count: status.exists,
            highest_modseq: status.highest_modseq,
            supports_incremental: caps.condstore && status.highest_modseq.is_some(),
        })
    }

    fn expunge(&mut self, server_id: &str) -> Result<(), RemoteError> {
        self.ensure_selected(server_id)?;
        self.session.expunge()?;
        // Refresh EXISTS and HIGHESTMODSEQ
        self.select(server_id)?;
        Ok(())
    }

    fn list_remote(
        &mut self,
        server_id: &str,
        request: &ListingRequest,
    ) -> Result<RemoteListing, RemoteError> {
        let status = self.ensure_selected(server_id)?;
        let caps = self.capabilities()?;

        let changed_since = request
            .since
            .and_then(|w| w.highest_modseq)
            .filter(|_| caps.condstore && status.highest_modseq.is_some());

        let fetched = self.session.uid_fetch_flags(1, changed_since)?;
        let all_ids = match changed_since {
            Some(_) => Some(self.session.uid_search_all()?),
            None => None,
        };

        let listed_max = fetched.iter().map(|f| f.uid).max();
        let all_max = all_ids.as_ref().and_then(|ids| ids.iter().copied().max());
        let previous = request.since.map(|w| w.highest_uid);
        let highest_uid = [listed_max, all_max, previous]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(0);
        let watermark = Watermark {
            highest_uid,
            highest_modseq: status.highest_modseq,
        };

        debug!(
            "Listed {} messages in {server_id} ({})",
            fetched.len(),
            if changed_since.is_some() { "incremental" } else { "full" }
        );

        Ok(RemoteListing {
            entries: fetched
                .into_iter()
                .map(|f| RemoteEntry {
                    remote_id: RemoteId::from(f.uid),
                    flags: flags_from_imap(&f.flags),
                    size: f.size,
                })
                .collect(),
            all_ids: all_ids.map(|ids| ids.into_iter().map(RemoteId::from).collect()),
            incremental: changed_since.is_some(),
            watermark: Some(watermark),
        })
    }

    fn fetch_headers(
        &mut self,
        server_id: &str,
        ids: &[RemoteId],
    ) -> Result<Vec<MessageSummary>, RemoteError> {
        self.ensure_selected(server_id)?;
        let envelopes = self.session.uid_fetch_envelopes(&uids(ids))?;
        Ok(envelopes
            .into_iter()
            .map(|env| {
                let mut builder = MessageSummary::builder(env.uid)
                    .flags(flags_from_imap(&env.flags))
                    .size(env.size)
                    .to(env.to.iter().map(|t| EmailAddress::parse(t)).collect())
                    .references(env.references);
                if let Some(subject) = env.subject {
                    builder = builder.subject(subject);
                }
                if let Some(from) = env.from {
                    builder = builder.from(EmailAddress::parse(&from));
                }
                if let Some(date) = env.date {
                    builder = builder.date(date);
                }
                if let Some(id) = env.message_id {
                    builder = builder.message_id_header(id);
                }
                if let Some(parent) = env.in_reply_to {
                    builder = builder.in_reply_to(parent);
                }
                if let Some(preview) = env.preview {
                    builder = builder.preview(preview);
                }
                builder.build()
            })
            .collect())
    }

    fn fetch_content(
        &mut self,
        server_id: &str,
        id: &RemoteId,
        max_bytes: u64,
    ) -> Result<FetchedContent, RemoteError> {
        let uid = id
            .as_uid()
            .ok_or_else(|| RemoteError::not_found(format!("{id} is not a server UID")))?;
        self.ensure_selected(server_id)?;
        match self.session.uid_fetch_body(uid, max_bytes)? {
            Some(body) => Ok(FetchedContent {
                data: body.data,
                complete: !body.truncated,
            }),
            None => Err(RemoteError::not_found(format!("UID {uid} is gone from {server_id}"))),
        }
    }
}
