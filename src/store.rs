//! Canonical message store backed by SQLite
//!
//! The store is the single source of truth the query engine reads from and
//! the only place rows are persisted. Every multi-row mutation runs inside one
//! `rusqlite::Transaction`; the dedup key `(account_id, provider_message_id)`
//! is enforced by a unique index. The connection mutex is only held for the
//! duration of synchronous statements, never across an `.await`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, params_from_iter};
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

use crate::errors::{AppError, AppResult};
use crate::models::{
    Account, Attachment, CanonicalMessage, Message, NewAccount, NewAttachment, ProviderKind,
    SyncStatus,
};
use crate::query::QueryPlan;

/// Error recorded on accounts whose sync was cut off by a process exit
pub const INTERRUPTED_SYNC_ERROR: &str = "sync interrupted";

/// Schema DDL run on open.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    provider TEXT NOT NULL,
    address TEXT NOT NULL UNIQUE,
    access_token TEXT,
    refresh_token TEXT,
    token_expires_at INTEGER,
    is_active INTEGER NOT NULL DEFAULT 1,
    sync_status TEXT NOT NULL DEFAULT 'idle',
    last_sync_at INTEGER,
    error_message TEXT,
    imap_host TEXT,
    imap_port INTEGER,
    smtp_host TEXT,
    smtp_port INTEGER,
    last_sent_at INTEGER,
    total_sent INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    provider_message_id TEXT NOT NULL,
    subject TEXT,
    sender TEXT NOT NULL,
    recipients TEXT NOT NULL DEFAULT '[]',
    cc TEXT NOT NULL DEFAULT '[]',
    bcc TEXT NOT NULL DEFAULT '[]',
    body_text TEXT,
    body_html TEXT,
    received_at INTEGER NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0,
    is_starred INTEGER NOT NULL DEFAULT 0,
    folder TEXT NOT NULL DEFAULT 'inbox',
    labels TEXT NOT NULL DEFAULT '[]',
    thread_id TEXT,
    in_reply_to TEXT,
    priority INTEGER NOT NULL DEFAULT 0,
    spam_score REAL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_dedup
    ON messages(account_id, provider_message_id);
CREATE INDEX IF NOT EXISTS idx_messages_received
    ON messages(account_id, received_at DESC);

CREATE TABLE IF NOT EXISTS attachments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    filename TEXT NOT NULL,
    content_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    storage_ref TEXT NOT NULL,
    is_inline INTEGER NOT NULL DEFAULT 0,
    content_id TEXT,
    checksum TEXT
);

CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id);
CREATE INDEX IF NOT EXISTS idx_attachments_ref ON attachments(storage_ref);
";

const ACCOUNT_COLUMNS: &str = "id, user_id, provider, address, access_token, refresh_token, \
     token_expires_at, is_active, sync_status, last_sync_at, error_message, imap_host, \
     imap_port, smtp_host, smtp_port, last_sent_at, total_sent, created_at";

const MESSAGE_COLUMNS: &str = "m.id, m.account_id, m.provider_message_id, m.subject, m.sender, \
     m.recipients, m.cc, m.bcc, m.body_text, m.body_html, m.received_at, m.is_read, \
     m.is_starred, m.folder, m.labels, m.thread_id, m.in_reply_to, m.priority, m.spam_score, \
     m.created_at, m.updated_at";

const ATTACHMENT_COLUMNS: &str =
    "id, message_id, filename, content_type, size_bytes, storage_ref, is_inline, content_id, checksum";

/// New local values for one message, written by the mutation paths
#[derive(Debug, Clone, PartialEq)]
pub struct MessageChange {
    pub message_id: i64,
    pub is_read: bool,
    pub is_starred: bool,
    pub folder: String,
    pub labels: Vec<String>,
}

impl MessageChange {
    /// Start from the message's current local state
    pub fn from_message(message: &Message) -> Self {
        Self {
            message_id: message.id,
            is_read: message.is_read,
            is_starred: message.is_starred,
            folder: message.folder.clone(),
            labels: message.labels.clone(),
        }
    }
}

/// SQLite-backed canonical store
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let conn = Connection::open(path.as_ref()).map_err(|e| {
            AppError::Storage(format!(
                "failed to open database {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> AppResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> AppResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| AppError::Storage(format!("failed to init schema: {e}")))?;
        // No run survives a restart; a row still in `syncing` was abandoned.
        let interrupted = conn.execute(
            "UPDATE accounts SET sync_status = 'failed', error_message = ?1
             WHERE sync_status = 'syncing'",
            params![INTERRUPTED_SYNC_ERROR],
        )?;
        if interrupted > 0 {
            warn!(accounts = interrupted, "released syncs interrupted by a previous exit");
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Storage("store connection poisoned".to_owned()))
    }

    // -- accounts ------------------------------------------------------------

    /// Insert an account, or refresh credentials and settings of the account
    /// with the same address. Ownership of an existing address never changes.
    pub fn upsert_account(&self, new: &NewAccount) -> AppResult<Account> {
        let conn = self.conn()?;
        let existing_owner: Option<i64> = conn
            .query_row(
                "SELECT user_id FROM accounts WHERE address = ?1",
                params![new.address],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(owner) = existing_owner
            && owner != new.user_id
        {
            return Err(AppError::invalid(format!(
                "address '{}' is already linked to another user",
                new.address
            )));
        }

        conn.execute(
            "INSERT INTO accounts (user_id, provider, address, access_token, refresh_token,
                 token_expires_at, imap_host, imap_port, smtp_host, smtp_port, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(address) DO UPDATE SET
                 provider = excluded.provider,
                 access_token = excluded.access_token,
                 refresh_token = excluded.refresh_token,
                 token_expires_at = excluded.token_expires_at,
                 imap_host = excluded.imap_host,
                 imap_port = excluded.imap_port,
                 smtp_host = excluded.smtp_host,
                 smtp_port = excluded.smtp_port,
                 is_active = 1",
            params![
                new.user_id,
                new.provider.as_str(),
                new.address,
                new.access_token.as_ref().map(|s| s.expose_secret().to_owned()),
                new.refresh_token.as_ref().map(|s| s.expose_secret().to_owned()),
                new.token_expires_at.map(to_millis),
                new.imap_host,
                new.imap_port,
                new.smtp_host,
                new.smtp_port,
                to_millis(Utc::now()),
            ],
        )?;

        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE address = ?1");
        Ok(conn.query_row(&sql, params![new.address], account_from_row)?)
    }

    pub fn account(&self, account_id: i64) -> AppResult<Option<Account>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![account_id], account_from_row)
            .optional()?)
    }

    pub fn accounts_for_user(&self, user_id: i64) -> AppResult<Vec<Account>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = ?1 ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], account_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Soft-deactivate an account; its messages stay in place.
    pub fn deactivate_account(&self, account_id: i64) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE accounts SET is_active = 0 WHERE id = ?1",
            params![account_id],
        )?;
        Ok(changed == 1)
    }

    /// Compare-and-set `idle|success|failed → syncing`, clearing the prior
    /// error. Returns `false` when the account is already syncing.
    pub fn try_begin_sync(&self, account_id: i64) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE accounts SET sync_status = 'syncing', error_message = NULL
             WHERE id = ?1 AND sync_status <> 'syncing'",
            params![account_id],
        )?;
        Ok(changed == 1)
    }

    /// Move a syncing account to a terminal state. Returns `false` when the
    /// account was not in `syncing`.
    pub fn finish_sync(
        &self,
        account_id: i64,
        status: SyncStatus,
        synced_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE accounts
             SET sync_status = ?2, last_sync_at = COALESCE(?3, last_sync_at), error_message = ?4
             WHERE id = ?1 AND sync_status = 'syncing'",
            params![account_id, status.as_str(), synced_at.map(to_millis), error],
        )?;
        Ok(changed == 1)
    }

    // -- messages ------------------------------------------------------------

    /// Which of the given provider ids are already stored for the account.
    pub fn known_provider_ids(
        &self,
        account_id: i64,
        provider_ids: &[String],
    ) -> AppResult<HashSet<String>> {
        if provider_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let conn = self.conn()?;
        let sql = format!(
            "SELECT provider_message_id FROM messages
             WHERE account_id = ? AND provider_message_id IN ({})",
            placeholders(provider_ids.len())
        );
        let mut values: Vec<Value> = Vec::with_capacity(provider_ids.len() + 1);
        values.push(Value::Integer(account_id));
        values.extend(provider_ids.iter().map(|id| Value::Text(id.clone())));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<HashSet<_>, _>>()?)
    }

    /// Insert a fetched page in one transaction. Rows whose dedup key already
    /// exists are left untouched. Returns the number of inserted messages.
    pub fn insert_fetched(
        &self,
        account_id: i64,
        batch: &[(CanonicalMessage, Vec<NewAttachment>)],
    ) -> AppResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now();
        let mut inserted = 0;
        for (message, attachments) in batch {
            if insert_message(&tx, account_id, message, attachments, now)?.is_some() {
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Persist a dispatched message and bump the account's send counters
    /// atomically. Returns the new message id.
    pub fn insert_sent(
        &self,
        account_id: i64,
        message: &CanonicalMessage,
        attachments: &[NewAttachment],
        sent_at: DateTime<Utc>,
    ) -> AppResult<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let id = insert_message(&tx, account_id, message, attachments, sent_at)?.ok_or_else(
            || {
                AppError::Storage(format!(
                    "message '{}' already stored for account {account_id}",
                    message.provider_message_id
                ))
            },
        )?;
        tx.execute(
            "UPDATE accounts SET last_sent_at = ?2, total_sent = total_sent + 1 WHERE id = ?1",
            params![account_id, to_millis(sent_at)],
        )?;
        tx.commit()?;
        Ok(id)
    }

    /// Load one message if its account belongs to the user.
    pub fn message_for_user(&self, user_id: i64, message_id: i64) -> AppResult<Option<Message>> {
        Ok(self
            .messages_for_user(user_id, &[message_id])?
            .into_iter()
            .next())
    }

    /// Load the user's messages among `message_ids`, in input order. Missing
    /// or foreign ids and duplicates are dropped.
    pub fn messages_for_user(&self, user_id: i64, message_ids: &[i64]) -> AppResult<Vec<Message>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m JOIN accounts a ON a.id = m.account_id
             WHERE a.user_id = ? AND m.id IN ({})",
            placeholders(message_ids.len())
        );
        let mut values: Vec<Value> = Vec::with_capacity(message_ids.len() + 1);
        values.push(Value::Integer(user_id));
        values.extend(message_ids.iter().map(|id| Value::Integer(*id)));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), message_from_row)?;
        let mut by_id: HashMap<i64, Message> = HashMap::new();
        for row in rows {
            let message = row?;
            by_id.insert(message.id, message);
        }

        let mut ordered = Vec::with_capacity(by_id.len());
        for id in message_ids {
            if let Some(message) = by_id.remove(id) {
                ordered.push(message);
            }
        }
        attach_attachments(&conn, &mut ordered)?;
        Ok(ordered)
    }

    /// Count rows matching a query plan, before pagination.
    pub fn count_matching(&self, plan: &QueryPlan) -> AppResult<u64> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT COUNT(*) FROM messages m JOIN accounts a ON a.id = m.account_id WHERE {}",
            plan.where_sql
        );
        let count: i64 = conn.query_row(&sql, params_from_iter(plan.params.iter()), |row| {
            row.get(0)
        })?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Select one page of rows matching a query plan.
    pub fn select_matching(
        &self,
        plan: &QueryPlan,
        limit: u32,
        offset: u64,
    ) -> AppResult<Vec<Message>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m JOIN accounts a ON a.id = m.account_id
             WHERE {} ORDER BY {} LIMIT {} OFFSET {}",
            plan.where_sql, plan.order_by, limit, offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(plan.params.iter()), message_from_row)?;
        let mut messages = rows.collect::<Result<Vec<_>, _>>()?;
        attach_attachments(&conn, &mut messages)?;
        Ok(messages)
    }

    /// Write local flag/folder/label changes for many messages in one
    /// transaction.
    pub fn apply_changes(&self, changes: &[MessageChange]) -> AppResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = to_millis(Utc::now());
        {
            let mut stmt = tx.prepare(
                "UPDATE messages
                 SET is_read = ?2, is_starred = ?3, folder = ?4, labels = ?5, updated_at = ?6
                 WHERE id = ?1",
            )?;
            for change in changes {
                stmt.execute(params![
                    change.message_id,
                    change.is_read,
                    change.is_starred,
                    change.folder,
                    serde_json::to_string(&change.labels)?,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove a message and its attachment rows. Returns the removed
    /// attachment metadata so the caller can release blobs.
    pub fn delete_message(&self, message_id: i64) -> AppResult<Vec<Attachment>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let attachments = load_attachments(&tx, &[message_id])?;
        tx.execute(
            "DELETE FROM attachments WHERE message_id = ?1",
            params![message_id],
        )?;
        let removed = tx.execute("DELETE FROM messages WHERE id = ?1", params![message_id])?;
        if removed == 0 {
            return Err(AppError::not_found(format!("message {message_id}")));
        }
        tx.commit()?;
        Ok(attachments)
    }

    /// Whether any attachment row still references the blob.
    pub fn storage_ref_in_use(&self, storage_ref: &str) -> AppResult<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM attachments WHERE storage_ref = ?1 LIMIT 1",
                params![storage_ref],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

/// Insert one message plus attachments; `None` when the dedup key exists.
fn insert_message(
    tx: &Transaction<'_>,
    account_id: i64,
    message: &CanonicalMessage,
    attachments: &[NewAttachment],
    now: DateTime<Utc>,
) -> AppResult<Option<i64>> {
    let changed = tx.execute(
        "INSERT INTO messages (account_id, provider_message_id, subject, sender, recipients, cc,
             bcc, body_text, body_html, received_at, is_read, is_starred, folder, labels,
             thread_id, in_reply_to, priority, spam_score, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
             ?18, ?19, ?19)
         ON CONFLICT(account_id, provider_message_id) DO NOTHING",
        params![
            account_id,
            message.provider_message_id,
            message.subject,
            message.sender,
            serde_json::to_string(&message.recipients)?,
            serde_json::to_string(&message.cc)?,
            serde_json::to_string(&message.bcc)?,
            message.body_text,
            message.body_html,
            to_millis(message.received_at),
            message.is_read,
            message.is_starred,
            message.folder,
            serde_json::to_string(&message.labels)?,
            message.thread_id,
            message.in_reply_to,
            message.priority,
            message.spam_score,
            to_millis(now),
        ],
    )?;
    if changed == 0 {
        return Ok(None);
    }

    let message_id = tx.last_insert_rowid();
    let mut stmt = tx.prepare(
        "INSERT INTO attachments (message_id, filename, content_type, size_bytes, storage_ref,
             is_inline, content_id, checksum)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for attachment in attachments {
        stmt.execute(params![
            message_id,
            attachment.filename,
            attachment.content_type,
            attachment.size_bytes,
            attachment.storage_ref,
            attachment.is_inline,
            attachment.content_id,
            attachment.checksum,
        ])?;
    }
    Ok(Some(message_id))
}

fn attach_attachments(conn: &Connection, messages: &mut [Message]) -> AppResult<()> {
    if messages.is_empty() {
        return Ok(());
    }
    let ids = messages.iter().map(|m| m.id).collect::<Vec<_>>();
    let mut grouped: HashMap<i64, Vec<Attachment>> = HashMap::new();
    for attachment in load_attachments(conn, &ids)? {
        grouped
            .entry(attachment.message_id)
            .or_default()
            .push(attachment);
    }
    for message in messages {
        message.attachments = grouped.remove(&message.id).unwrap_or_default();
    }
    Ok(())
}

fn load_attachments(conn: &Connection, message_ids: &[i64]) -> AppResult<Vec<Attachment>> {
    let sql = format!(
        "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE message_id IN ({}) ORDER BY id",
        placeholders(message_ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(message_ids.iter()), |row| {
        Ok(Attachment {
            id: row.get(0)?,
            message_id: row.get(1)?,
            filename: row.get(2)?,
            content_type: row.get(3)?,
            size_bytes: row.get(4)?,
            storage_ref: row.get(5)?,
            is_inline: row.get(6)?,
            content_id: row.get(7)?,
            checksum: row.get(8)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let provider: String = row.get(2)?;
    let status: String = row.get(8)?;
    Ok(Account {
        id: row.get(0)?,
        user_id: row.get(1)?,
        provider: ProviderKind::parse(&provider).map_err(|e| conversion_error(2, e))?,
        address: row.get(3)?,
        access_token: row.get::<_, Option<String>>(4)?.map(SecretString::from),
        refresh_token: row.get::<_, Option<String>>(5)?.map(SecretString::from),
        token_expires_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
        is_active: row.get(7)?,
        sync_status: SyncStatus::parse(&status).map_err(|e| conversion_error(8, e))?,
        last_sync_at: row.get::<_, Option<i64>>(9)?.map(from_millis),
        error_message: row.get(10)?,
        imap_host: row.get(11)?,
        imap_port: row.get(12)?,
        smtp_host: row.get(13)?,
        smtp_port: row.get(14)?,
        last_sent_at: row.get::<_, Option<i64>>(15)?.map(from_millis),
        total_sent: row.get(16)?,
        created_at: from_millis(row.get(17)?),
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        account_id: row.get(1)?,
        provider_message_id: row.get(2)?,
        subject: row.get(3)?,
        sender: row.get(4)?,
        recipients: json_list(row, 5)?,
        cc: json_list(row, 6)?,
        bcc: json_list(row, 7)?,
        body_text: row.get(8)?,
        body_html: row.get(9)?,
        received_at: from_millis(row.get(10)?),
        is_read: row.get(11)?,
        is_starred: row.get(12)?,
        folder: row.get(13)?,
        labels: json_list(row, 14)?,
        thread_id: row.get(15)?,
        in_reply_to: row.get(16)?,
        priority: row.get(17)?,
        spam_score: row.get(18)?,
        created_at: from_millis(row.get(19)?),
        updated_at: from_millis(row.get(20)?),
        attachments: Vec::new(),
    })
}

fn json_list(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn conversion_error(idx: usize, err: AppError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Duration, Utc};
    use secrecy::SecretString;

    use super::Store;
    use crate::models::{Account, CanonicalMessage, NewAccount, ProviderKind, INBOX_FOLDER};

    pub fn seed_account(store: &Store, user_id: i64, address: &str) -> Account {
        store
            .upsert_account(&NewAccount {
                user_id,
                provider: ProviderKind::Gmail,
                address: address.to_owned(),
                access_token: Some(SecretString::from("token".to_owned())),
                refresh_token: Some(SecretString::from("refresh".to_owned())),
                token_expires_at: Some(Utc::now() + Duration::hours(1)),
                imap_host: None,
                imap_port: None,
                smtp_host: None,
                smtp_port: None,
            })
            .expect("seed account")
    }

    pub fn canonical(provider_id: &str, received_at: DateTime<Utc>) -> CanonicalMessage {
        CanonicalMessage {
            provider_message_id: provider_id.to_owned(),
            subject: Some(format!("Subject {provider_id}")),
            sender: "alice@example.com".to_owned(),
            recipients: vec!["bob@example.com".to_owned()],
            cc: Vec::new(),
            bcc: Vec::new(),
            body_text: Some(format!("Body of {provider_id}")),
            body_html: None,
            received_at,
            is_read: false,
            is_starred: false,
            folder: INBOX_FOLDER.to_owned(),
            labels: Vec::new(),
            thread_id: None,
            in_reply_to: None,
            priority: 0,
            spam_score: None,
            attachments: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::test_support::{canonical, seed_account};
    use super::{INTERRUPTED_SYNC_ERROR, MessageChange, Store};
    use crate::models::{NewAttachment, SyncStatus};

    fn attachment(storage_ref: &str) -> NewAttachment {
        NewAttachment {
            filename: "a.pdf".to_owned(),
            content_type: "application/pdf".to_owned(),
            size_bytes: 3,
            storage_ref: storage_ref.to_owned(),
            is_inline: false,
            content_id: None,
            checksum: Some(storage_ref.to_owned()),
        }
    }

    #[test]
    fn insert_fetched_skips_existing_dedup_keys() {
        let store = Store::open_in_memory().expect("store");
        let account = seed_account(&store, 1, "a@example.com");
        let now = Utc::now();

        let first = vec![(canonical("p1", now), vec![attachment("r1")])];
        assert_eq!(store.insert_fetched(account.id, &first).expect("insert"), 1);

        let again = vec![
            (canonical("p1", now), Vec::new()),
            (canonical("p2", now), Vec::new()),
        ];
        assert_eq!(store.insert_fetched(account.id, &again).expect("insert"), 1);

        let known = store
            .known_provider_ids(account.id, &["p1".to_owned(), "p3".to_owned()])
            .expect("known ids");
        assert!(known.contains("p1"));
        assert!(!known.contains("p3"));
    }

    #[test]
    fn sync_status_compare_and_set_rejects_second_writer() {
        let store = Store::open_in_memory().expect("store");
        let account = seed_account(&store, 1, "a@example.com");

        assert!(store.try_begin_sync(account.id).expect("begin"));
        assert!(!store.try_begin_sync(account.id).expect("second begin"));

        let at = Utc::now();
        assert!(
            store
                .finish_sync(account.id, SyncStatus::Success, Some(at), None)
                .expect("finish")
        );
        assert!(
            !store
                .finish_sync(account.id, SyncStatus::Failed, None, Some("late"))
                .expect("finish twice")
        );

        let reloaded = store.account(account.id).expect("load").expect("exists");
        assert_eq!(reloaded.sync_status, SyncStatus::Success);
        assert_eq!(
            reloaded.last_sync_at.map(|t| t.timestamp_millis()),
            Some(at.timestamp_millis())
        );
        assert!(store.try_begin_sync(account.id).expect("next cycle"));
    }

    #[test]
    fn reopening_releases_a_sync_abandoned_by_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mailhub.db");
        let account_id = {
            let store = Store::open(&path).expect("open");
            let account = seed_account(&store, 1, "a@example.com");
            assert!(store.try_begin_sync(account.id).expect("begin"));
            account.id
        };

        let store = Store::open(&path).expect("reopen");
        let released = store.account(account_id).expect("load").expect("exists");
        assert_eq!(released.sync_status, SyncStatus::Failed);
        assert_eq!(released.error_message.as_deref(), Some(INTERRUPTED_SYNC_ERROR));
        assert!(store.try_begin_sync(account_id).expect("begin after restart"));
    }

    #[test]
    fn messages_for_user_filters_foreign_ids_and_keeps_order() {
        let store = Store::open_in_memory().expect("store");
        let mine = seed_account(&store, 1, "mine@example.com");
        let theirs = seed_account(&store, 2, "theirs@example.com");
        let now = Utc::now();
        store
            .insert_fetched(
                mine.id,
                &[
                    (canonical("m1", now), Vec::new()),
                    (canonical("m2", now - Duration::minutes(1)), Vec::new()),
                ],
            )
            .expect("insert mine");
        store
            .insert_fetched(theirs.id, &[(canonical("t1", now), Vec::new())])
            .expect("insert theirs");

        let loaded = store.messages_for_user(1, &[2, 3, 1, 2, 99]).expect("load");
        let ids = loaded.iter().map(|m| m.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn apply_changes_and_delete_round_trip() {
        let store = Store::open_in_memory().expect("store");
        let account = seed_account(&store, 1, "a@example.com");
        store
            .insert_fetched(
                account.id,
                &[(canonical("p1", Utc::now()), vec![attachment("blob-1")])],
            )
            .expect("insert");
        let message = store
            .message_for_user(1, 1)
            .expect("load")
            .expect("exists");
        assert_eq!(message.attachments.len(), 1);

        let mut change = MessageChange::from_message(&message);
        change.is_starred = true;
        change.labels = vec!["work".to_owned()];
        store.apply_changes(&[change]).expect("apply");
        let updated = store.message_for_user(1, 1).expect("load").expect("exists");
        assert!(updated.is_starred);
        assert_eq!(updated.labels, vec!["work".to_owned()]);

        let removed = store.delete_message(1).expect("delete");
        assert_eq!(removed.len(), 1);
        assert!(!store.storage_ref_in_use("blob-1").expect("ref check"));
        assert!(store.message_for_user(1, 1).expect("load").is_none());
    }

    #[test]
    fn upsert_account_refuses_to_move_address_between_users() {
        let store = Store::open_in_memory().expect("store");
        seed_account(&store, 1, "shared@example.com");
        let err = store
            .upsert_account(&crate::models::NewAccount {
                user_id: 2,
                provider: crate::models::ProviderKind::Imap,
                address: "shared@example.com".to_owned(),
                access_token: None,
                refresh_token: None,
                token_expires_at: None,
                imap_host: None,
                imap_port: None,
                smtp_host: None,
                smtp_port: None,
            })
            .expect_err("must fail");
        assert!(err.to_string().contains("already linked"));
    }
}
