//! Canonical records, engine request/response types and MCP tool DTOs
//!
//! Records here are plain values passed between the engine and the storage
//! layer. Tool input types carry `JsonSchema` for automatic schema generation.

use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

/// Folder a soft-deleted message is moved to
pub const TRASH_FOLDER: &str = "trash";
/// Folder the send path files outbound messages under
pub const SENT_FOLDER: &str = "sent";
/// Folder inbound messages land in when the provider reports nothing better
pub const INBOX_FOLDER: &str = "inbox";

/// Remote mailbox protocol an account is linked through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Gmail REST API (OAuth)
    Gmail,
    /// Microsoft Graph mail API (OAuth)
    Outlook,
    /// Raw IMAP for fetch/mutations and SMTP for sending
    Imap,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Outlook => "outlook",
            Self::Imap => "imap",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gmail" | "google" => Ok(Self::Gmail),
            "outlook" | "graph" | "microsoft" => Ok(Self::Outlook),
            "imap" | "smtp" => Ok(Self::Imap),
            other => Err(AppError::invalid(format!("unknown provider kind '{other}'"))),
        }
    }

    /// Whether the account authenticates with an expiring OAuth bearer token
    pub fn uses_oauth(self) -> bool {
        matches!(self, Self::Gmail | Self::Outlook)
    }
}

/// Per-account sync state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw {
            "idle" => Ok(Self::Idle),
            "syncing" => Ok(Self::Syncing),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(AppError::Storage(format!("unknown sync status '{other}'"))),
        }
    }
}

/// One linked mailbox credential set
///
/// Credential material is held in `SecretString` so it never reaches logs
/// or serialized output. IMAP accounts keep their app password in the
/// access credential slot.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub user_id: i64,
    pub provider: ProviderKind,
    pub address: String,
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub sync_status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub imap_host: Option<String>,
    pub imap_port: Option<u16>,
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub total_sent: i64,
    pub created_at: DateTime<Utc>,
}

/// Account fields supplied when linking or re-seeding an account
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub user_id: i64,
    pub provider: ProviderKind,
    pub address: String,
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub imap_host: Option<String>,
    pub imap_port: Option<u16>,
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
}

/// Account metadata (no credentials)
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub account_id: i64,
    pub provider: ProviderKind,
    pub address: String,
    pub is_active: bool,
    pub sync_status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub total_sent: i64,
}

impl From<&Account> for AccountSummary {
    fn from(account: &Account) -> Self {
        Self {
            account_id: account.id,
            provider: account.provider,
            address: account.address.clone(),
            is_active: account.is_active,
            sync_status: account.sync_status,
            last_sync_at: account.last_sync_at,
            total_sent: account.total_sent,
        }
    }
}

/// Stored attachment metadata; the bytes live in the attachment store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attachment {
    pub id: i64,
    pub message_id: i64,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub storage_ref: String,
    pub is_inline: bool,
    pub content_id: Option<String>,
    pub checksum: Option<String>,
}

/// Canonical stored email
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: i64,
    pub account_id: i64,
    pub provider_message_id: String,
    pub subject: Option<String>,
    pub sender: String,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub is_starred: bool,
    pub folder: String,
    pub labels: Vec<String>,
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub priority: i32,
    pub spam_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
}

/// Attachment bytes travelling between adapters, the attachment store and
/// the send path
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentPayload {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
    pub is_inline: bool,
    pub content_id: Option<String>,
}

/// Provider-independent message shape every adapter normalizes into
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalMessage {
    pub provider_message_id: String,
    pub subject: Option<String>,
    pub sender: String,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub is_starred: bool,
    pub folder: String,
    pub labels: Vec<String>,
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub priority: i32,
    pub spam_score: Option<f64>,
    pub attachments: Vec<AttachmentPayload>,
}

/// Attachment row to persist next to a new message
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttachment {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub storage_ref: String,
    pub is_inline: bool,
    pub content_id: Option<String>,
    pub checksum: Option<String>,
}

/// Canonical outbound message handed to a provider adapter
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub in_reply_to: Option<String>,
}

/// Reference to a previously uploaded attachment blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DraftAttachment {
    /// Content-addressed storage reference returned by the upload step
    pub storage_ref: String,
    pub filename: String,
    pub content_type: String,
    #[serde(default)]
    pub is_inline: bool,
}

/// Outbound draft as supplied by the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Draft {
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub recipients: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    /// 0 (normal) to 5
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub attachments: Vec<DraftAttachment>,
    /// Provider message id of the message being replied to
    pub in_reply_to: Option<String>,
}

/// Whitelisted sort columns for message listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    ReceivedAt,
    Subject,
    Sender,
    Priority,
    CreatedAt,
    UpdatedAt,
}

/// Message listing filter
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFilter {
    pub folder: Option<String>,
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
    pub account_id: Option<i64>,
    /// Matches messages carrying any of these labels
    pub labels: Option<Vec<String>>,
    /// Inclusive lower bound on `received_at`
    pub from_date: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `received_at`
    pub to_date: Option<DateTime<Utc>>,
    pub has_attachments: Option<bool>,
    /// Case-insensitive substring over subject, body and sender
    pub search: Option<String>,
    pub sort_by: SortKey,
    pub sort_desc: bool,
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self {
            folder: None,
            is_read: None,
            is_starred: None,
            account_id: None,
            labels: None,
            from_date: None,
            to_date: None,
            has_attachments: None,
            search: None,
            sort_by: SortKey::ReceivedAt,
            sort_desc: true,
        }
    }
}

/// One page of a listing
#[derive(Debug, Clone, Serialize)]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

/// Partial update of a single message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MessagePatch {
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
    /// Moving to another folder issues a remote move first
    pub folder: Option<String>,
    /// Replaces the label set
    pub labels: Option<Vec<String>>,
}

/// Bulk action kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BulkAction {
    MarkRead,
    MarkUnread,
    Star,
    Unstar,
    Move,
    Delete,
    Label,
    Unlabel,
}

impl BulkAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MarkRead => "mark_read",
            Self::MarkUnread => "mark_unread",
            Self::Star => "star",
            Self::Unstar => "unstar",
            Self::Move => "move",
            Self::Delete => "delete",
            Self::Label => "label",
            Self::Unlabel => "unlabel",
        }
    }
}

/// Bulk mutation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BulkRequest {
    pub message_ids: Vec<i64>,
    pub action: BulkAction,
    /// Required for `move`
    pub target_folder: Option<String>,
    /// Required for `label` and `unlabel`
    pub labels: Option<Vec<String>>,
}

/// Per-item outcome of a bulk mutation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkResult {
    pub success_count: usize,
    pub failed_count: usize,
    pub failed_ids: Vec<i64>,
}

/// How a sync run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Completed,
    Failed,
    /// Another run holds the account; nothing was fetched
    AlreadySyncing,
}

/// Outcome of one sync run, reported rather than raised
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub account_id: i64,
    pub status: SyncRunStatus,
    pub fetched_count: usize,
    pub new_count: usize,
    pub error: Option<String>,
}

/// Sync status as exposed to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatusView {
    pub status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Metadata included in all tool responses
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Tool execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Standard response envelope for all tools
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolEnvelope<T>
where
    T: JsonSchema,
{
    /// Human-readable summary of the operation outcome
    pub summary: String,
    /// Tool-specific data payload
    pub data: T,
    /// Execution metadata (timestamp, duration)
    pub meta: Meta,
}

/// Input: list messages with filters and offset pagination
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListMessagesInput {
    /// Folder name (e.g. `inbox`, `sent`, `trash`)
    pub folder: Option<String>,
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
    pub account_id: Option<i64>,
    /// Match messages carrying any of these labels
    pub labels: Option<Vec<String>>,
    /// Lower bound on received time (RFC 3339 or YYYY-MM-DD)
    pub from_date: Option<String>,
    /// Upper bound on received time (RFC 3339 or YYYY-MM-DD, inclusive)
    pub to_date: Option<String>,
    pub has_attachments: Option<bool>,
    /// Case-insensitive substring over subject, body and sender
    pub search: Option<String>,
    #[serde(default)]
    pub sort_by: SortKey,
    #[serde(default = "default_true")]
    pub sort_desc: bool,
    /// 1-based page number
    #[serde(default = "default_page")]
    pub page: u32,
    /// Page size (1..100, default 20)
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

/// Input: a single message id
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct MessageIdInput {
    pub message_id: i64,
}

/// Input: a single account id
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AccountIdInput {
    pub account_id: i64,
}

/// Input: send a message through one of the user's accounts
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SendMessageInput {
    pub account_id: i64,
    pub draft: Draft,
}

/// Input: run a sync for one account
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SyncAccountInput {
    pub account_id: i64,
    /// Full resync instead of fetching only messages since the last success
    #[serde(default)]
    pub sync_all: bool,
    /// Run in the background and return immediately
    #[serde(default)]
    pub background: bool,
}

/// Input: update message flags, folder or labels
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct UpdateMessageInput {
    pub message_id: i64,
    pub patch: MessagePatch,
}

/// Input: delete a message
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DeleteMessageInput {
    pub message_id: i64,
    /// Remove remotely and locally instead of moving to trash
    #[serde(default)]
    pub permanent: bool,
}

fn default_true() -> bool {
    true
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

#[cfg(test)]
mod tests {
    use super::{ProviderKind, SyncStatus};

    #[test]
    fn provider_kind_parses_aliases() {
        assert_eq!(ProviderKind::parse("Gmail").expect("gmail"), ProviderKind::Gmail);
        assert_eq!(ProviderKind::parse("graph").expect("graph"), ProviderKind::Outlook);
        assert_eq!(ProviderKind::parse(" smtp ").expect("smtp"), ProviderKind::Imap);
        assert!(ProviderKind::parse("pop3").is_err());
    }

    #[test]
    fn sync_status_round_trips_through_column_text() {
        for status in [
            SyncStatus::Idle,
            SyncStatus::Syncing,
            SyncStatus::Success,
            SyncStatus::Failed,
        ] {
            assert_eq!(SyncStatus::parse(status.as_str()).expect("parse"), status);
        }
    }
}
