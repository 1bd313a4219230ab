//! SQLite-backed local mail store with zstd-compressed message bodies

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, ToSql, Transaction, params, params_from_iter};
use rusqlite_migration::{M, Migrations};

use super::cursor::MessageCursor;
use super::traits::{
    DroppedCommand, FolderDiff, LocalEntry, MailStore, MovedMessage, StoreResult, StoredCommand,
    UpsertOutcome,
};
use crate::error::StoreError;
use crate::models::{
    EmailAddress, Flag, FlagSet, Folder, FolderId, FolderSyncState, LocalMessageId, Message,
    MessageSummary, RemoteId, ThreadId, Watermark,
};
use crate::search::{CompiledQuery, escape_like};

/// zstd level for message bodies
const COMPRESSION_LEVEL: i32 = 3;

/// Database migrations
///
/// Each migration is applied in order inside its own transaction. The
/// user_version pragma tracks which migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            CREATE TABLE folders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                subscribed INTEGER NOT NULL DEFAULT 1,
                visible INTEGER NOT NULL DEFAULT 1,
                local_only INTEGER NOT NULL DEFAULT 0,
                uid_validity INTEGER,
                highest_uid INTEGER,
                highest_modseq INTEGER,
                last_checked TEXT,
                status TEXT,
                needs_full_resync INTEGER NOT NULL DEFAULT 0
            );

            -- Local ids are never reused, so ids held by the journal and the
            -- overlay cannot alias a newer message.
            CREATE TABLE messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                folder_id INTEGER NOT NULL,
                uid TEXT NOT NULL,
                subject TEXT NOT NULL DEFAULT '',
                sender TEXT,
                recipients TEXT NOT NULL DEFAULT '[]',
                date INTEGER,
                message_id_header TEXT,
                in_reply_to TEXT,
                refs TEXT NOT NULL DEFAULT '[]',
                size INTEGER NOT NULL DEFAULT 0,
                complete INTEGER NOT NULL DEFAULT 0,
                preview TEXT NOT NULL DEFAULT '',
                body BLOB,  -- zstd compressed
                UNIQUE (folder_id, uid),
                FOREIGN KEY (folder_id) REFERENCES folders(id) ON DELETE CASCADE
            );

            CREATE INDEX idx_messages_message_id ON messages(message_id_header);
            CREATE INDEX idx_messages_in_reply_to ON messages(in_reply_to);

            CREATE TABLE message_flags (
                message_id INTEGER NOT NULL,
                flag TEXT NOT NULL,
                PRIMARY KEY (message_id, flag),
                FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
            );

            CREATE TABLE threads (
                message_id INTEGER PRIMARY KEY,
                root INTEGER NOT NULL,
                parent INTEGER,
                FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
            );

            CREATE INDEX idx_threads_root ON threads(root);

            CREATE TABLE pending_commands (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        ),
        // Migration 2: Keep a record of commands the server refused for good
        M::up(
            r#"
            CREATE TABLE dropped_commands (
                sequence INTEGER PRIMARY KEY,
                payload TEXT NOT NULL,
                reason TEXT NOT NULL,
                dropped_at TEXT NOT NULL
            );
            "#,
        ),
    ])
}

const FOLDER_COLUMNS: &str = "id, server_id, name, subscribed, visible, local_only, uid_validity, \
     highest_uid, highest_modseq, last_checked, status, needs_full_resync";

const MESSAGE_SELECT: &str = "SELECT m.id, m.folder_id, m.uid, m.subject, m.sender, m.recipients, \
     m.date, m.message_id_header, m.size, m.complete, m.preview, t.root, \
     (SELECT group_concat(flag, ' ') FROM message_flags WHERE message_id = m.id) \
     FROM messages m \
     JOIN folders f ON f.id = m.folder_id \
     JOIN threads t ON t.message_id = m.id";

/// SQLite-based mail store for one account
pub struct SqliteMailStore {
    conn: Mutex<Connection>,
}

impl SqliteMailStore {
    /// Open (or create) the store at `db_path` and bring its schema up to date
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(|e| {
            StoreError::StorageUnavailable(format!(
                "Failed to open database at {:?}: {e}",
                db_path.as_ref()
            ))
        })?;
        Self::init(conn)
    }

    /// A private in-memory store, used by tests and previews
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> StoreResult<Self> {
        // WAL lets readers proceed while a folder diff is being written.
        // foreign_keys is required for the ON DELETE CASCADE clauses.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -16000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations().to_latest(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::StorageUnavailable("connection lock poisoned".to_string()))
    }

    /// Schema version recorded in `user_version`
    pub fn schema_version(&self) -> StoreResult<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn insert_folder(&self, server_id: &str, name: &str, local_only: bool) -> StoreResult<Folder> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO folders (server_id, name, local_only) VALUES (?1, ?2, ?3)
             ON CONFLICT(server_id) DO NOTHING",
            params![server_id, name, local_only],
        )?;
        folder_by_server_id(&conn, server_id)?
            .ok_or_else(|| StoreError::NotFound(format!("folder {server_id}")))
    }
}

// === Row mapping ===

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_timestamp(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| conversion_error(idx, e))
        })
        .transpose()
}

fn parse_flags(value: Option<String>) -> FlagSet {
    value
        .unwrap_or_default()
        .split(' ')
        .filter_map(Flag::from_storage_name)
        .collect()
}

fn row_to_folder(row: &Row<'_>) -> rusqlite::Result<Folder> {
    let highest_uid: Option<i64> = row.get(7)?;
    let highest_modseq: Option<i64> = row.get(8)?;
    Ok(Folder {
        id: FolderId(row.get(0)?),
        server_id: row.get(1)?,
        name: row.get(2)?,
        subscribed: row.get(3)?,
        visible: row.get(4)?,
        local_only: row.get(5)?,
        sync_state: FolderSyncState {
            uid_validity: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
            watermark: highest_uid.map(|uid| Watermark {
                highest_uid: uid as u64,
                highest_modseq: highest_modseq.map(|m| m as u64),
            }),
            last_checked: parse_timestamp(9, row.get(9)?)?,
            status: row.get(10)?,
            needs_full_resync: row.get(11)?,
        },
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let recipients: String = row.get(5)?;
    let to: Vec<EmailAddress> =
        serde_json::from_str(&recipients).map_err(|e| conversion_error(5, e))?;
    let sender: Option<String> = row.get(4)?;
    let date: Option<i64> = row.get(6)?;
    Ok(Message {
        id: LocalMessageId(row.get(0)?),
        folder_id: FolderId(row.get(1)?),
        remote_id: RemoteId(row.get(2)?),
        subject: row.get(3)?,
        from: sender.as_deref().map(EmailAddress::parse),
        to,
        date: date.and_then(DateTime::from_timestamp_millis),
        message_id_header: row.get(7)?,
        size: row.get::<_, i64>(8)? as u64,
        complete: row.get(9)?,
        preview: row.get(10)?,
        thread_id: ThreadId(LocalMessageId(row.get(11)?)),
        flags: parse_flags(row.get(12)?),
    })
}

fn folder_by_server_id(conn: &Connection, server_id: &str) -> StoreResult<Option<Folder>> {
    let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE server_id = ?1");
    Ok(conn
        .query_row(&sql, params![server_id], row_to_folder)
        .optional()?)
}

fn load_flags(conn: &Connection, id: i64) -> StoreResult<FlagSet> {
    let mut stmt = conn.prepare_cached("SELECT flag FROM message_flags WHERE message_id = ?1")?;
    let names = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
    let mut flags = FlagSet::new();
    for name in names {
        if let Some(flag) = Flag::from_storage_name(&name?) {
            flags.insert(flag);
        }
    }
    Ok(flags)
}

fn replace_flags(conn: &Connection, id: i64, flags: &FlagSet) -> StoreResult<()> {
    conn.execute("DELETE FROM message_flags WHERE message_id = ?1", params![id])?;
    let mut stmt =
        conn.prepare_cached("INSERT INTO message_flags (message_id, flag) VALUES (?1, ?2)")?;
    for flag in flags {
        stmt.execute(params![id, flag.storage_name()])?;
    }
    Ok(())
}

fn write_sync_state(conn: &Connection, id: FolderId, state: &FolderSyncState) -> StoreResult<()> {
    let changed = conn.execute(
        "UPDATE folders SET uid_validity = ?1, highest_uid = ?2, highest_modseq = ?3,
             last_checked = ?4, status = ?5, needs_full_resync = ?6
         WHERE id = ?7",
        params![
            state.uid_validity.map(|v| v as i64),
            state.watermark.map(|w| w.highest_uid as i64),
            state.watermark.and_then(|w| w.highest_modseq).map(|m| m as i64),
            state.last_checked.map(|t| t.to_rfc3339()),
            state.status,
            state.needs_full_resync,
            id.0,
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!("folder {id}")));
    }
    Ok(())
}

/// Insert a new message row, its flags and its thread link
fn insert_message(tx: &Transaction<'_>, folder: FolderId, summary: &MessageSummary) -> StoreResult<i64> {
    tx.execute(
        "INSERT INTO messages (folder_id, uid, subject, sender, recipients, date,
             message_id_header, in_reply_to, refs, size, preview)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            folder.0,
            summary.remote_id.as_str(),
            summary.subject,
            summary.from.as_ref().map(EmailAddress::display),
            serde_json::to_string(&summary.to)?,
            summary.date.map(|d| d.timestamp_millis()),
            summary.message_id_header,
            summary.in_reply_to,
            serde_json::to_string(&summary.references)?,
            summary.size as i64,
            summary.preview,
        ],
    )?;
    let id = tx.last_insert_rowid();
    replace_flags(tx, id, &summary.flags)?;
    assign_thread(tx, id, summary)?;
    Ok(id)
}

/// Link a freshly inserted message into a thread.
///
/// A copy of an already stored message joins that message's thread. Otherwise
/// the nearest known ancestor (In-Reply-To, then References newest first)
/// gives the root. Earlier orphans that reply to this message are adopted,
/// and their threads are re-rooted under ours.
fn assign_thread(tx: &Transaction<'_>, id: i64, summary: &MessageSummary) -> StoreResult<()> {
    let mut link: Option<(i64, Option<i64>)> = None;

    if let Some(mid) = &summary.message_id_header {
        link = tx
            .query_row(
                "SELECT t.root, t.parent FROM messages m JOIN threads t ON t.message_id = m.id
                 WHERE m.message_id_header = ?1 AND m.id != ?2 ORDER BY m.id LIMIT 1",
                params![mid, id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
    }

    if link.is_none() {
        let ancestors = summary
            .in_reply_to
            .iter()
            .chain(summary.references.iter().rev());
        for candidate in ancestors {
            let parent: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT m.id, t.root FROM messages m JOIN threads t ON t.message_id = m.id
                     WHERE m.message_id_header = ?1 AND m.id != ?2 ORDER BY m.id LIMIT 1",
                    params![candidate, id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((parent_id, root)) = parent {
                link = Some((root, Some(parent_id)));
                break;
            }
        }
    }

    let (root, parent) = link.unwrap_or((id, None));
    tx.execute(
        "INSERT INTO threads (message_id, root, parent) VALUES (?1, ?2, ?3)",
        params![id, root, parent],
    )?;

    let Some(mid) = &summary.message_id_header else {
        return Ok(());
    };
    let quoted = format!("%\"{}\"%", escape_like(mid));
    let orphans: Vec<i64> = {
        let mut stmt = tx.prepare_cached(
            "SELECT m.id FROM messages m JOIN threads t ON t.message_id = m.id
             WHERE t.parent IS NULL AND t.root = m.id AND m.id != ?1
               AND (m.in_reply_to = ?2 OR m.refs LIKE ?3 ESCAPE '\\')",
        )?;
        let rows = stmt.query_map(params![id, mid, quoted], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    for orphan in orphans {
        if orphan == root {
            continue;
        }
        tx.execute(
            "UPDATE threads SET parent = ?1 WHERE message_id = ?2",
            params![id, orphan],
        )?;
        tx.execute(
            "UPDATE threads SET root = ?1 WHERE root = ?2",
            params![root, orphan],
        )?;
        debug!("Re-rooted thread {orphan} under {root}");
    }
    Ok(())
}

/// Delete one message row without orphaning its thread
///
/// Replies to the message move up to its parent. When the root goes, the
/// oldest remaining message of the thread becomes the new root.
fn delete_message(tx: &Transaction<'_>, id: i64) -> StoreResult<usize> {
    let link: Option<(i64, Option<i64>)> = tx
        .query_row(
            "SELECT root, parent FROM threads WHERE message_id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    if let Some((root, parent)) = link {
        tx.execute(
            "UPDATE threads SET parent = ?1 WHERE parent = ?2",
            params![parent, id],
        )?;
        if root == id {
            let heir: Option<i64> = tx.query_row(
                "SELECT MIN(message_id) FROM threads WHERE root = ?1 AND message_id != ?1",
                params![id],
                |row| row.get(0),
            )?;
            if let Some(heir) = heir {
                tx.execute(
                    "UPDATE threads SET root = ?1 WHERE root = ?2",
                    params![heir, id],
                )?;
                debug!("Thread {id} lost its root, re-rooted under {heir}");
            }
        }
    }
    Ok(tx.execute("DELETE FROM messages WHERE id = ?1", params![id])?)
}

/// Delete every message of a folder, one row at a time
fn delete_folder_messages(tx: &Transaction<'_>, folder: FolderId) -> StoreResult<usize> {
    let ids: Vec<i64> = {
        let mut stmt = tx.prepare_cached("SELECT id FROM messages WHERE folder_id = ?1")?;
        let rows = stmt.query_map(params![folder.0], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    let mut removed = 0;
    for id in ids {
        removed += delete_message(tx, id)?;
    }
    Ok(removed)
}

/// Insert or refresh one summary, recording what happened in `outcome`
fn upsert_one(
    tx: &Transaction<'_>,
    folder: FolderId,
    summary: &MessageSummary,
    outcome: &mut UpsertOutcome,
) -> StoreResult<()> {
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM messages WHERE folder_id = ?1 AND uid = ?2",
            params![folder.0, summary.remote_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    if summary.flags.contains(&Flag::Deleted) {
        if let Some(id) = existing {
            delete_message(tx, id)?;
            outcome.removed.push(summary.remote_id.clone());
        }
        return Ok(());
    }

    match existing {
        Some(id) => {
            if load_flags(tx, id)? != summary.flags {
                replace_flags(tx, id, &summary.flags)?;
                outcome.updated.push(summary.remote_id.clone());
            }
        }
        None => {
            insert_message(tx, folder, summary)?;
            outcome.added.push(summary.remote_id.clone());
        }
    }
    Ok(())
}

fn uid_in_folder(conn: &Connection, folder: FolderId, id: LocalMessageId) -> StoreResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT uid FROM messages WHERE id = ?1 AND folder_id = ?2",
            params![id.0, folder.0],
            |row| row.get(0),
        )
        .optional()?)
}

fn query_messages_where(
    conn: &Connection,
    clause: &str,
    params: &[&dyn ToSql],
) -> StoreResult<Vec<Message>> {
    let sql = format!("{MESSAGE_SELECT} WHERE {clause}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, row_to_message)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

impl MailStore for SqliteMailStore {
    fn ensure_folder(&self, server_id: &str, name: &str) -> StoreResult<Folder> {
        self.insert_folder(server_id, name, false)
    }

    fn ensure_local_folder(&self, server_id: &str, name: &str) -> StoreResult<Folder> {
        self.insert_folder(server_id, name, true)
    }

    fn get_folder(&self, id: FolderId) -> StoreResult<Option<Folder>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id.0], row_to_folder).optional()?)
    }

    fn get_folder_by_server_id(&self, server_id: &str) -> StoreResult<Option<Folder>> {
        let conn = self.conn()?;
        folder_by_server_id(&conn, server_id)
    }

    fn list_folders(&self) -> StoreResult<Vec<Folder>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders ORDER BY server_id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_folder)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn set_folder_subscribed(&self, id: FolderId, subscribed: bool) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE folders SET subscribed = ?1 WHERE id = ?2",
            params![subscribed, id.0],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("folder {id}")));
        }
        Ok(())
    }

    fn remove_folder(&self, id: FolderId) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        delete_folder_messages(&tx, id)?;
        tx.execute("DELETE FROM folders WHERE id = ?1", params![id.0])?;
        tx.commit()?;
        Ok(())
    }

    fn save_folder_sync_state(&self, id: FolderId, state: &FolderSyncState) -> StoreResult<()> {
        let conn = self.conn()?;
        write_sync_state(&conn, id, state)
    }

    fn upsert_messages(
        &self,
        folder: FolderId,
        summaries: &[MessageSummary],
    ) -> StoreResult<UpsertOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut outcome = UpsertOutcome::default();
        for summary in summaries {
            upsert_one(&tx, folder, summary, &mut outcome)?;
        }
        tx.commit()?;
        Ok(outcome)
    }

    fn apply_folder_diff(&self, folder: FolderId, diff: &FolderDiff) -> StoreResult<UpsertOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut outcome = UpsertOutcome::default();

        for summary in &diff.new_messages {
            upsert_one(&tx, folder, summary, &mut outcome)?;
        }

        for update in &diff.flag_updates {
            // The row may have been moved away by a user action since the diff was computed
            let Some(uid) = uid_in_folder(&tx, folder, update.id)? else {
                continue;
            };
            if load_flags(&tx, update.id.0)? != update.flags {
                replace_flags(&tx, update.id.0, &update.flags)?;
                outcome.updated.push(RemoteId(uid));
            }
        }

        for id in &diff.removals {
            if let Some(uid) = uid_in_folder(&tx, folder, *id)? {
                delete_message(&tx, id.0)?;
                outcome.removed.push(RemoteId(uid));
            }
        }

        write_sync_state(&tx, folder, &diff.sync_state)?;
        tx.commit()?;
        Ok(outcome)
    }

    fn set_flags(
        &self,
        folder: FolderId,
        ids: &[LocalMessageId],
        flag: &Flag,
        value: bool,
    ) -> StoreResult<Vec<LocalMessageId>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let name = flag.storage_name();
        let mut changed = Vec::new();
        for id in ids {
            if uid_in_folder(&tx, folder, *id)?.is_none() {
                continue;
            }
            let rows = if value {
                tx.execute(
                    "INSERT OR IGNORE INTO message_flags (message_id, flag) VALUES (?1, ?2)",
                    params![id.0, name],
                )?
            } else {
                tx.execute(
                    "DELETE FROM message_flags WHERE message_id = ?1 AND flag = ?2",
                    params![id.0, name],
                )?
            };
            if rows > 0 {
                changed.push(*id);
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    fn relocate_messages(
        &self,
        src: FolderId,
        dst: FolderId,
        moves: &[(LocalMessageId, RemoteId)],
    ) -> StoreResult<Vec<MovedMessage>> {
        if src == dst {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut moved = Vec::with_capacity(moves.len());
        for (id, placeholder) in moves {
            // Returning early drops `tx`, which rolls back the messages already moved
            let old = uid_in_folder(&tx, src, *id)?
                .ok_or_else(|| StoreError::NotFound(format!("message {id} in folder {src}")))?;
            tx.execute(
                "UPDATE messages SET folder_id = ?1, uid = ?2 WHERE id = ?3",
                params![dst.0, placeholder.as_str(), id.0],
            )?;
            moved.push(MovedMessage {
                id: *id,
                old_remote_id: RemoteId(old),
                new_remote_id: placeholder.clone(),
            });
        }
        tx.commit()?;
        Ok(moved)
    }

    fn destroy_messages(&self, folder: FolderId, ids: &[LocalMessageId]) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        for id in ids {
            if uid_in_folder(&tx, folder, *id)?.is_some() {
                removed += delete_message(&tx, id.0)?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    fn clear_folder_messages(&self, folder: FolderId) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = delete_folder_messages(&tx, folder)?;
        tx.commit()?;
        if removed > 0 {
            warn!("Cleared {removed} cached messages from folder {folder}");
        }
        Ok(removed)
    }

    fn change_remote_id(
        &self,
        id: LocalMessageId,
        expected: &RemoteId,
        new: &RemoteId,
    ) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let folder: Option<i64> = tx
            .query_row(
                "SELECT folder_id FROM messages WHERE id = ?1 AND uid = ?2",
                params![id.0, expected.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(folder) = folder else {
            return Ok(false);
        };
        // A listing may already have created a row for the server's copy
        let duplicate: Option<i64> = tx
            .query_row(
                "SELECT id FROM messages WHERE folder_id = ?1 AND uid = ?2 AND id != ?3",
                params![folder, new.as_str(), id.0],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(duplicate) = duplicate {
            delete_message(&tx, duplicate)?;
        }
        tx.execute(
            "UPDATE messages SET uid = ?1 WHERE id = ?2",
            params![new.as_str(), id.0],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn get_message(&self, id: LocalMessageId) -> StoreResult<Option<Message>> {
        let conn = self.conn()?;
        Ok(query_messages_where(&conn, "m.id = ?1", &[&id.0])?
            .into_iter()
            .next())
    }

    fn find_message(&self, folder: FolderId, remote_id: &RemoteId) -> StoreResult<Option<Message>> {
        let conn = self.conn()?;
        Ok(query_messages_where(
            &conn,
            "m.folder_id = ?1 AND m.uid = ?2",
            &[&folder.0, &remote_id.as_str()],
        )?
        .into_iter()
        .next())
    }

    fn folder_index(&self, folder: FolderId) -> StoreResult<Vec<LocalEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.uid, m.size, m.complete,
                 (SELECT group_concat(flag, ' ') FROM message_flags WHERE message_id = m.id)
             FROM messages m WHERE m.folder_id = ?1",
        )?;
        let rows = stmt.query_map(params![folder.0], |row| {
            Ok(LocalEntry {
                id: LocalMessageId(row.get(0)?),
                remote_id: RemoteId(row.get(1)?),
                size: row.get::<_, i64>(2)? as u64,
                complete: row.get(3)?,
                flags: parse_flags(row.get(4)?),
            })
        })?;
        let mut entries: Vec<LocalEntry> = rows.collect::<Result<_, _>>()?;
        entries.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        Ok(entries)
    }

    fn store_content(&self, id: LocalMessageId, data: &[u8], complete: bool) -> StoreResult<()> {
        let compressed = zstd::encode_all(data, COMPRESSION_LEVEL)
            .map_err(|e| StoreError::StorageUnavailable(format!("compression failed: {e}")))?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE messages SET body = ?1, complete = ?2 WHERE id = ?3",
            params![compressed, complete, id.0],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("message {id}")));
        }
        Ok(())
    }

    fn load_content(&self, id: LocalMessageId) -> StoreResult<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let body: Option<Vec<u8>> = conn
            .query_row(
                "SELECT body FROM messages WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;
        body.map(|blob| {
            zstd::decode_all(&blob[..])
                .map_err(|e| StoreError::DataCorruption(format!("body of message {id}: {e}")))
        })
        .transpose()
    }

    fn thread_messages(&self, thread: ThreadId) -> StoreResult<Vec<Message>> {
        let conn = self.conn()?;
        query_messages_where(&conn, "t.root = ?1 ORDER BY m.date, m.id", &[&(thread.0).0])
    }

    fn query_page(
        &self,
        query: &CompiledQuery,
        after: Option<LocalMessageId>,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        let conn = self.conn()?;
        let sql = format!(
            "{MESSAGE_SELECT} WHERE ({}) AND m.id > ? ORDER BY m.id LIMIT ?",
            query.selection
        );
        let after = after.map(|id| id.0).unwrap_or(0);
        let limit = limit as i64;
        let mut bound: Vec<&dyn ToSql> = query.params.iter().map(|p| p as &dyn ToSql).collect();
        bound.push(&after);
        bound.push(&limit);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bound), row_to_message)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn query_messages(&self, query: CompiledQuery) -> MessageCursor<'_> {
        MessageCursor::new(self, query)
    }

    fn insert_pending_command(&self, payload: &str) -> StoreResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO pending_commands (payload, created_at) VALUES (?1, ?2)",
            params![payload, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn pending_commands(&self) -> StoreResult<Vec<StoredCommand>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT sequence, payload, created_at FROM pending_commands ORDER BY sequence",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(StoredCommand {
                sequence: row.get(0)?,
                payload: row.get(1)?,
                created_at: parse_timestamp(2, row.get(2)?)?.unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn update_pending_command(&self, sequence: i64, payload: &str) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE pending_commands SET payload = ?1 WHERE sequence = ?2",
            params![payload, sequence],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("pending command {sequence}")));
        }
        Ok(())
    }

    fn remove_pending_command(&self, sequence: i64) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM pending_commands WHERE sequence = ?1",
            params![sequence],
        )?;
        Ok(())
    }

    fn record_dropped_command(&self, sequence: i64, reason: &str) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let payload: String = tx
            .query_row(
                "SELECT payload FROM pending_commands WHERE sequence = ?1",
                params![sequence],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("pending command {sequence}")))?;
        tx.execute(
            "INSERT OR REPLACE INTO dropped_commands (sequence, payload, reason, dropped_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![sequence, payload, reason, Utc::now().to_rfc3339()],
        )?;
        tx.execute(
            "DELETE FROM pending_commands WHERE sequence = ?1",
            params![sequence],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn dropped_commands(&self) -> StoreResult<Vec<DroppedCommand>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT sequence, payload, reason, dropped_at FROM dropped_commands ORDER BY sequence",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DroppedCommand {
                sequence: row.get(0)?,
                payload: row.get(1)?,
                reason: row.get(2)?,
                dropped_at: parse_timestamp(3, row.get(3)?)?.unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{Attribute, SearchConditionNode, SearchField, compile_node};
    use tempfile::TempDir;

    fn create_test_store() -> (SqliteMailStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteMailStore::open(tmp.path().join("mail.db")).unwrap();
        (store, tmp)
    }

    fn summary(uid: u64, subject: &str) -> MessageSummary {
        MessageSummary::builder(uid)
            .subject(subject)
            .from(EmailAddress::with_name("Alice", "alice@example.com"))
            .size(100)
            .build()
    }

    #[test]
    fn test_migrations_set_user_version() {
        let (store, _tmp) = create_test_store();
        assert_eq!(store.schema_version().unwrap(), 2);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mail.db");
        {
            let store = SqliteMailStore::open(&path).unwrap();
            let inbox = store.ensure_folder("INBOX", "Inbox").unwrap();
            store.upsert_messages(inbox.id, &[summary(1, "kept")]).unwrap();
        }
        let store = SqliteMailStore::open(&path).unwrap();
        let inbox = store.get_folder_by_server_id("INBOX").unwrap().unwrap();
        assert_eq!(store.folder_index(inbox.id).unwrap().len(), 1);
        assert_eq!(store.schema_version().unwrap(), 2);
    }

    #[test]
    fn test_ensure_folder_is_idempotent() {
        let (store, _tmp) = create_test_store();
        let a = store.ensure_folder("INBOX", "Inbox").unwrap();
        let b = store.ensure_folder("INBOX", "Inbox").unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.subscribed);
        assert!(!a.local_only);

        let outbox = store.ensure_local_folder("Outbox", "Outbox").unwrap();
        assert!(outbox.local_only);
        assert!(!outbox.is_syncable());
        assert_eq!(store.list_folders().unwrap().len(), 2);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let (store, _tmp) = create_test_store();
        let inbox = store.ensure_folder("INBOX", "Inbox").unwrap();
        let batch = vec![summary(1, "one"), summary(2, "two")];

        let first = store.upsert_messages(inbox.id, &batch).unwrap();
        assert_eq!(first.added.len(), 2);

        let second = store.upsert_messages(inbox.id, &batch).unwrap();
        assert!(second.is_empty());
        assert_eq!(store.folder_index(inbox.id).unwrap().len(), 2);
    }

    #[test]
    fn test_upsert_updates_flags_and_removes_deleted() {
        let (store, _tmp) = create_test_store();
        let inbox = store.ensure_folder("INBOX", "Inbox").unwrap();
        store
            .upsert_messages(inbox.id, &[summary(1, "one"), summary(2, "two")])
            .unwrap();

        let read = MessageSummary::builder(1u64).flag(Flag::Read).build();
        let deleted = MessageSummary::builder(2u64).flag(Flag::Deleted).build();
        let outcome = store.upsert_messages(inbox.id, &[read, deleted]).unwrap();
        assert_eq!(outcome.updated, vec![RemoteId::from(1u64)]);
        assert_eq!(outcome.removed, vec![RemoteId::from(2u64)]);

        let msg = store.find_message(inbox.id, &RemoteId::from(1u64)).unwrap().unwrap();
        assert!(msg.is_read());
        // Envelope is untouched by a flag-only refresh
        assert_eq!(msg.subject, "one");
        assert!(store.find_message(inbox.id, &RemoteId::from(2u64)).unwrap().is_none());
    }

    #[test]
    fn test_message_roundtrip() {
        let (store, _tmp) = create_test_store();
        let inbox = store.ensure_folder("INBOX", "Inbox").unwrap();
        let date = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let input = MessageSummary::builder(9u64)
            .subject("Quarterly report")
            .from(EmailAddress::with_name("Alice", "alice@example.com"))
            .to(vec![EmailAddress::new("bob@example.com")])
            .date(date)
            .message_id_header("<q@example.com>")
            .flag(Flag::Flagged)
            .flag(Flag::Custom("$work".to_string()))
            .size(2048)
            .preview("numbers")
            .build();
        store.upsert_messages(inbox.id, &[input]).unwrap();

        let msg = store.find_message(inbox.id, &RemoteId::from(9u64)).unwrap().unwrap();
        assert_eq!(msg.from.as_ref().unwrap().email, "alice@example.com");
        assert_eq!(msg.to, vec![EmailAddress::new("bob@example.com")]);
        assert_eq!(msg.date, Some(date));
        assert_eq!(msg.message_id_header.as_deref(), Some("q@example.com"));
        assert!(msg.has_flag(&Flag::Custom("$work".to_string())));
        assert_eq!(msg.size, 2048);
        assert!(!msg.complete);
        assert_eq!(msg.thread_id, ThreadId(msg.id));
    }

    #[test]
    fn test_threading_reply_after_parent() {
        let (store, _tmp) = create_test_store();
        let inbox = store.ensure_folder("INBOX", "Inbox").unwrap();
        let parent = MessageSummary::builder(1u64).message_id_header("a@x").build();
        let reply = MessageSummary::builder(2u64)
            .message_id_header("b@x")
            .in_reply_to("a@x")
            .build();
        store.upsert_messages(inbox.id, &[parent, reply]).unwrap();

        let parent = store.find_message(inbox.id, &RemoteId::from(1u64)).unwrap().unwrap();
        let reply = store.find_message(inbox.id, &RemoteId::from(2u64)).unwrap().unwrap();
        assert_eq!(reply.thread_id, ThreadId(parent.id));
        assert_eq!(store.thread_messages(parent.thread_id).unwrap().len(), 2);
    }

    #[test]
    fn test_threading_reroots_earlier_replies() {
        let (store, _tmp) = create_test_store();
        let inbox = store.ensure_folder("INBOX", "Inbox").unwrap();
        let sent = store.ensure_folder("Sent", "Sent").unwrap();

        // Grandchild and child arrive before the root, in another folder
        let grandchild = MessageSummary::builder(5u64)
            .message_id_header("c@x")
            .in_reply_to("b@x")
            .references(vec!["a@x".to_string(), "b@x".to_string()])
            .build();
        let child = MessageSummary::builder(6u64)
            .message_id_header("b@x")
            .in_reply_to("a@x")
            .references(vec!["a@x".to_string()])
            .build();
        store.upsert_messages(inbox.id, &[grandchild, child]).unwrap();
        let root = MessageSummary::builder(1u64).message_id_header("a@x").build();
        store.upsert_messages(sent.id, &[root]).unwrap();

        let root = store.find_message(sent.id, &RemoteId::from(1u64)).unwrap().unwrap();
        let thread = store.thread_messages(ThreadId(root.id)).unwrap();
        assert_eq!(thread.len(), 3);
        assert!(thread.iter().all(|m| m.thread_id == ThreadId(root.id)));
    }

    #[test]
    fn test_removing_root_promotes_oldest_reply() {
        let (store, _tmp) = create_test_store();
        let inbox = store.ensure_folder("INBOX", "Inbox").unwrap();
        let summaries = vec![
            MessageSummary::builder(1u64).message_id_header("a@x").build(),
            MessageSummary::builder(2u64)
                .message_id_header("b@x")
                .in_reply_to("a@x")
                .build(),
            MessageSummary::builder(3u64)
                .message_id_header("c@x")
                .in_reply_to("b@x")
                .build(),
        ];
        store.upsert_messages(inbox.id, &summaries).unwrap();
        let root = store.find_message(inbox.id, &RemoteId::from(1u64)).unwrap().unwrap();
        let child = store.find_message(inbox.id, &RemoteId::from(2u64)).unwrap().unwrap();

        assert_eq!(store.destroy_messages(inbox.id, &[root.id]).unwrap(), 1);

        let thread = store.thread_messages(ThreadId(child.id)).unwrap();
        assert_eq!(thread.len(), 2);
        assert!(thread.iter().all(|m| m.thread_id == ThreadId(child.id)));
        assert!(store.thread_messages(ThreadId(root.id)).unwrap().is_empty());

        // A late copy of the removed root joins the surviving thread
        store
            .upsert_messages(inbox.id, &[MessageSummary::builder(4u64).message_id_header("c@x").build()])
            .unwrap();
        let copy = store.find_message(inbox.id, &RemoteId::from(4u64)).unwrap().unwrap();
        assert_eq!(copy.thread_id, ThreadId(child.id));
    }

    #[test]
    fn test_clearing_folder_reroots_threads_elsewhere() {
        let (store, _tmp) = create_test_store();
        let inbox = store.ensure_folder("INBOX", "Inbox").unwrap();
        let sent = store.ensure_folder("Sent", "Sent").unwrap();
        store
            .upsert_messages(sent.id, &[MessageSummary::builder(1u64).message_id_header("a@x").build()])
            .unwrap();
        store
            .upsert_messages(
                inbox.id,
                &[MessageSummary::builder(7u64)
                    .message_id_header("b@x")
                    .in_reply_to("a@x")
                    .build()],
            )
            .unwrap();

        store.clear_folder_messages(sent.id).unwrap();
        let reply = store.find_message(inbox.id, &RemoteId::from(7u64)).unwrap().unwrap();
        assert_eq!(reply.thread_id, ThreadId(reply.id));
    }

    #[test]
    fn test_set_flags_reports_changes() {
        let (store, _tmp) = create_test_store();
        let inbox = store.ensure_folder("INBOX", "Inbox").unwrap();
        store.upsert_messages(inbox.id, &[summary(1, "one")]).unwrap();
        let msg = store.find_message(inbox.id, &RemoteId::from(1u64)).unwrap().unwrap();

        let changed = store.set_flags(inbox.id, &[msg.id], &Flag::Read, true).unwrap();
        assert_eq!(changed, vec![msg.id]);
        let changed = store.set_flags(inbox.id, &[msg.id], &Flag::Read, true).unwrap();
        assert!(changed.is_empty());
        let changed = store.set_flags(inbox.id, &[msg.id], &Flag::Read, false).unwrap();
        assert_eq!(changed, vec![msg.id]);
    }

    #[test]
    fn test_move_keeps_local_id() {
        let (store, _tmp) = create_test_store();
        let inbox = store.ensure_folder("INBOX", "Inbox").unwrap();
        let archive = store.ensure_folder("Archive", "Archive").unwrap();
        store.upsert_messages(inbox.id, &[summary(1, "one")]).unwrap();
        let msg = store.find_message(inbox.id, &RemoteId::from(1u64)).unwrap().unwrap();

        let moved = store.move_messages(inbox.id, archive.id, &[msg.id]).unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].old_remote_id, RemoteId::from(1u64));
        assert!(moved[0].new_remote_id.is_placeholder());

        let after = store.get_message(msg.id).unwrap().unwrap();
        assert_eq!(after.folder_id, archive.id);
        assert_eq!(after.remote_id, moved[0].new_remote_id);
        assert!(store.folder_index(inbox.id).unwrap().is_empty());
    }

    #[test]
    fn test_move_is_all_or_nothing() {
        let (store, _tmp) = create_test_store();
        let inbox = store.ensure_folder("INBOX", "Inbox").unwrap();
        let archive = store.ensure_folder("Archive", "Archive").unwrap();
        store.upsert_messages(inbox.id, &[summary(1, "one")]).unwrap();
        let msg = store.find_message(inbox.id, &RemoteId::from(1u64)).unwrap().unwrap();

        let result = store.move_messages(inbox.id, archive.id, &[msg.id, LocalMessageId(9999)]);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        let after = store.get_message(msg.id).unwrap().unwrap();
        assert_eq!(after.folder_id, inbox.id);
        assert_eq!(after.remote_id, RemoteId::from(1u64));
    }

    #[test]
    fn test_change_remote_id_only_from_expected() {
        let (store, _tmp) = create_test_store();
        let inbox = store.ensure_folder("INBOX", "Inbox").unwrap();
        store.upsert_messages(inbox.id, &[summary(1, "one")]).unwrap();
        let msg = store.find_message(inbox.id, &RemoteId::from(1u64)).unwrap().unwrap();

        assert!(!store
            .change_remote_id(msg.id, &RemoteId::from(7u64), &RemoteId::from(8u64))
            .unwrap());
        assert!(store
            .change_remote_id(msg.id, &RemoteId::from(1u64), &RemoteId::from(8u64))
            .unwrap());
        assert_eq!(store.get_message(msg.id).unwrap().unwrap().remote_id, RemoteId::from(8u64));
    }

    #[test]
    fn test_content_is_compressed_roundtrip() {
        let (store, _tmp) = create_test_store();
        let inbox = store.ensure_folder("INBOX", "Inbox").unwrap();
        store.upsert_messages(inbox.id, &[summary(1, "one")]).unwrap();
        let msg = store.find_message(inbox.id, &RemoteId::from(1u64)).unwrap().unwrap();

        assert_eq!(store.load_content(msg.id).unwrap(), None);
        let body = b"Subject: one\r\n\r\nhello hello hello hello".to_vec();
        store.store_content(msg.id, &body, true).unwrap();
        assert_eq!(store.load_content(msg.id).unwrap(), Some(body));
        assert!(store.get_message(msg.id).unwrap().unwrap().complete);
        assert!(matches!(
            store.load_content(LocalMessageId(424242)),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_apply_folder_diff_advances_watermark() {
        let (store, _tmp) = create_test_store();
        let inbox = store.ensure_folder("INBOX", "Inbox").unwrap();
        store.upsert_messages(inbox.id, &[summary(1, "one")]).unwrap();
        let old = store.find_message(inbox.id, &RemoteId::from(1u64)).unwrap().unwrap();

        let diff = FolderDiff {
            new_messages: vec![summary(2, "two")],
            flag_updates: Vec::new(),
            removals: vec![old.id],
            sync_state: FolderSyncState::default().completed(Some(5), Some(Watermark::new(2))),
        };
        let outcome = store.apply_folder_diff(inbox.id, &diff).unwrap();
        assert_eq!(outcome.added, vec![RemoteId::from(2u64)]);
        assert_eq!(outcome.removed, vec![RemoteId::from(1u64)]);

        let folder = store.get_folder(inbox.id).unwrap().unwrap();
        assert_eq!(folder.sync_state.uid_validity, Some(5));
        assert_eq!(folder.sync_state.watermark, Some(Watermark::new(2)));
        assert!(folder.sync_state.last_checked.is_some());

        // Same diff again changes nothing
        assert!(store.apply_folder_diff(inbox.id, &diff).unwrap().is_empty());
    }

    #[test]
    fn test_apply_folder_diff_rolls_back_on_missing_folder() {
        let (store, _tmp) = create_test_store();
        let diff = FolderDiff {
            sync_state: FolderSyncState::default(),
            ..FolderDiff::default()
        };
        assert!(store.apply_folder_diff(FolderId(77), &diff).is_err());
    }

    #[test]
    fn test_query_cursor_pages_and_rewinds() {
        let (store, _tmp) = create_test_store();
        let inbox = store.ensure_folder("INBOX", "Inbox").unwrap();
        let batch: Vec<_> = (1..=7)
            .map(|i| summary(i, if i % 2 == 0 { "invoice" } else { "hello" }))
            .collect();
        store.upsert_messages(inbox.id, &batch).unwrap();

        let tree = SearchConditionNode::condition(SearchField::Folder, Attribute::Equals, "INBOX")
            .and(SearchConditionNode::condition(
                SearchField::Subject,
                Attribute::Contains,
                "voice",
            ));
        let compiled = compile_node(&tree).unwrap();
        let mut cursor = MessageCursor::new(&store, compiled).with_page_size(2);
        let first: Vec<Message> = cursor.by_ref().map(Result::unwrap).collect();
        assert_eq!(first.len(), 3);
        assert!(first.windows(2).all(|w| w[0].id < w[1].id));

        cursor.rewind();
        assert_eq!(cursor.count(), 3);
    }

    #[test]
    fn test_query_flag_predicate() {
        let (store, _tmp) = create_test_store();
        let inbox = store.ensure_folder("INBOX", "Inbox").unwrap();
        let unread = summary(1, "unread");
        let read = MessageSummary::builder(2u64).subject("read").flag(Flag::Read).build();
        store.upsert_messages(inbox.id, &[unread, read]).unwrap();

        let tree = SearchConditionNode::condition(SearchField::Read, Attribute::Equals, "false");
        let found: Vec<Message> = store
            .query_messages(compile_node(&tree).unwrap())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].subject, "unread");
    }

    #[test]
    fn test_pending_command_persistence() {
        let (store, _tmp) = create_test_store();
        let a = store.insert_pending_command("{\"a\":1}").unwrap();
        let b = store.insert_pending_command("{\"b\":2}").unwrap();
        assert!(b > a);

        store.update_pending_command(a, "{\"a\":3}").unwrap();
        let pending = store.pending_commands().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].payload, "{\"a\":3}");

        store.record_dropped_command(b, "mailbox gone").unwrap();
        assert_eq!(store.pending_commands().unwrap().len(), 1);
        let dropped = store.dropped_commands().unwrap();
        assert_eq!(dropped[0].sequence, b);
        assert_eq!(dropped[0].reason, "mailbox gone");

        store.remove_pending_command(a).unwrap();
        store.remove_pending_command(a).unwrap();
        assert!(store.pending_commands().unwrap().is_empty());

        // Sequence numbers are never reused
        let c = store.insert_pending_command("{}").unwrap();
        assert!(c > b);
    }

    #[test]
    fn test_remove_folder_cascades() {
        let (store, _tmp) = create_test_store();
        let inbox = store.ensure_folder("INBOX", "Inbox").unwrap();
        store.upsert_messages(inbox.id, &[summary(1, "one")]).unwrap();
        let msg = store.find_message(inbox.id, &RemoteId::from(1u64)).unwrap().unwrap();
        store.remove_folder(inbox.id).unwrap();
        assert!(store.get_folder(inbox.id).unwrap().is_none());
        assert!(store.get_message(msg.id).unwrap().is_none());
    }
}
