//! Engine facade
//!
//! [`Mailhub`] is the single entry point the outer surfaces call. Every
//! operation consumes one unit of the caller's rate budget before it does
//! anything else, then scopes all lookups to the caller's accounts.

use std::sync::Arc;

use chrono::Utc;
use lettre::Address;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::account_state::{TokenState, token_state};
use crate::attachments::{AttachmentStore, content_ref};
use crate::bulk::BulkProcessor;
use crate::config::EngineConfig;
use crate::credentials::{CredentialRefresher, RefreshRequest};
use crate::errors::{AppError, AppResult};
use crate::mime::sanitize_html;
use crate::models::{
    Account, AccountSummary, AttachmentPayload, BulkRequest, BulkResult, CanonicalMessage, Draft,
    Message, MessageFilter, MessagePatch, NewAttachment, OutboundMessage, PagedResult,
    SENT_FOLDER, SyncResult, SyncStatus, SyncStatusView, TRASH_FOLDER,
};
use crate::provider::{ProviderError, ProviderRegistry};
use crate::query;
use crate::rate_limit::{Operation, RateLimiter, WindowRateLimiter, enforce};
use crate::store::{MessageChange, Store};
use crate::sync::{BackgroundSync, SyncFailure, SyncOrchestrator};

pub const MAX_SUBJECT_CHARS: usize = 255;
pub const MAX_PRIORITY: i32 = 5;

/// Check a draft before any remote work.
///
/// # Errors
///
/// Returns `Validation` for a missing or oversized subject, no recipients,
/// an unparseable address or a priority outside `0..=5`.
pub fn validate_draft(draft: &Draft) -> AppResult<()> {
    let subject_chars = draft.subject.trim().chars().count();
    if subject_chars == 0 {
        return Err(AppError::invalid("subject must not be empty"));
    }
    if draft.subject.chars().count() > MAX_SUBJECT_CHARS {
        return Err(AppError::invalid(format!(
            "subject must be <= {MAX_SUBJECT_CHARS} characters"
        )));
    }
    if draft.recipients.is_empty() {
        return Err(AppError::invalid("at least one recipient is required"));
    }
    if !(0..=MAX_PRIORITY).contains(&draft.priority) {
        return Err(AppError::invalid(format!(
            "priority must be between 0 and {MAX_PRIORITY}"
        )));
    }
    for (field, list) in [
        ("recipient", &draft.recipients),
        ("cc", &draft.cc),
        ("bcc", &draft.bcc),
    ] {
        for raw in list {
            raw.trim()
                .parse::<Address>()
                .map_err(|_| AppError::invalid(format!("invalid {field} address '{raw}'")))?;
        }
    }
    if draft.body_text.is_none() && draft.body_html.is_none() {
        return Err(AppError::invalid("body_text or body_html is required"));
    }
    Ok(())
}

fn trimmed(list: &[String]) -> Vec<String> {
    list.iter().map(|a| a.trim().to_owned()).collect()
}

/// Multi-provider mail engine
pub struct Mailhub {
    config: EngineConfig,
    store: Arc<Store>,
    providers: Arc<ProviderRegistry>,
    attachments: Arc<dyn AttachmentStore>,
    refresher: Arc<dyn CredentialRefresher>,
    limiter: Arc<dyn RateLimiter>,
    sync: Arc<SyncOrchestrator>,
    background: BackgroundSync,
    bulk: BulkProcessor,
}

impl Mailhub {
    /// Wire the engine together. The returned receiver yields failures of
    /// background syncs.
    ///
    /// # Errors
    ///
    /// Returns `Validation` when a rate budget is unusable.
    pub fn new(
        config: EngineConfig,
        store: Arc<Store>,
        providers: ProviderRegistry,
        attachments: Arc<dyn AttachmentStore>,
        refresher: Arc<dyn CredentialRefresher>,
    ) -> AppResult<(Self, mpsc::UnboundedReceiver<SyncFailure>)> {
        let limiter: Arc<dyn RateLimiter> = Arc::new(WindowRateLimiter::new(&config.rate_limits)?);
        let providers = Arc::new(providers);
        let sync = Arc::new(SyncOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&providers),
            Arc::clone(&attachments),
            Arc::clone(&refresher),
            config.sync_settings(),
        ));
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let background = BackgroundSync::new(Arc::clone(&sync), failures_tx);
        let bulk = BulkProcessor::new(Arc::clone(&store), Arc::clone(&providers));

        Ok((
            Self {
                config,
                store,
                providers,
                attachments,
                refresher,
                limiter,
                sync,
                background,
                bulk,
            },
            failures_rx,
        ))
    }

    fn check_rate(&self, user_id: i64, operation: Operation) -> AppResult<()> {
        enforce(self.limiter.as_ref(), user_id, operation)
    }

    fn owned_account(&self, user_id: i64, account_id: i64) -> AppResult<Account> {
        self.store
            .account(account_id)?
            .filter(|account| account.user_id == user_id)
            .ok_or_else(|| AppError::not_found(format!("account {account_id} not found")))
    }

    fn owned_message(&self, user_id: i64, message_id: i64) -> AppResult<Message> {
        self.store
            .message_for_user(user_id, message_id)?
            .ok_or_else(|| AppError::not_found(format!("message {message_id} not found")))
    }

    /// List the caller's messages.
    ///
    /// Without an account filter, and when `sync_on_list` is enabled, a
    /// background sync is started for each of the caller's idle accounts.
    /// The listing never waits for those syncs.
    pub fn list_messages(
        &self,
        user_id: i64,
        filter: &MessageFilter,
        page: u32,
        page_size: u32,
    ) -> AppResult<PagedResult<Message>> {
        self.check_rate(user_id, Operation::List)?;
        let result = query::list_messages(&self.store, user_id, filter, page, page_size)?;

        if filter.account_id.is_none() && self.config.sync_on_list {
            for account in self.store.accounts_for_user(user_id)? {
                if account.is_active && account.sync_status != SyncStatus::Syncing {
                    debug!(user_id, account_id = account.id, "background sync on list");
                    self.background.spawn(user_id, account.id, false);
                }
            }
        }
        Ok(result)
    }

    pub fn get_message(&self, user_id: i64, message_id: i64) -> AppResult<Message> {
        self.check_rate(user_id, Operation::List)?;
        self.owned_message(user_id, message_id)
    }

    /// Credential-free summaries of the caller's linked accounts
    pub fn list_accounts(&self, user_id: i64) -> AppResult<Vec<AccountSummary>> {
        self.check_rate(user_id, Operation::List)?;
        Ok(self
            .store
            .accounts_for_user(user_id)?
            .iter()
            .map(AccountSummary::from)
            .collect())
    }

    /// Dispatch a draft through one of the caller's accounts and store it in
    /// `sent` as read.
    ///
    /// # Errors
    ///
    /// - `Validation` for malformed drafts and for messages the provider
    ///   refuses (invalid recipient, oversized payload)
    /// - `NotFound` for unknown accounts or attachment references
    /// - `ProviderAuth` when the credential is expired or revoked
    /// - `ProviderTransport` when the provider is unreachable
    pub async fn send_message(&self, user_id: i64, account_id: i64, draft: Draft) -> AppResult<Message> {
        self.check_rate(user_id, Operation::Send)?;
        validate_draft(&draft)?;
        let account = self.owned_account(user_id, account_id)?;
        if !account.is_active {
            return Err(AppError::invalid(format!("account {account_id} is deactivated")));
        }
        self.ensure_credential(&account).await?;

        let mut payloads = Vec::with_capacity(draft.attachments.len());
        let mut total_bytes: u64 = 0;
        for attachment in &draft.attachments {
            let data = self.attachments.get(&attachment.storage_ref).await?;
            total_bytes += data.len() as u64;
            if total_bytes > self.config.max_attachment_bytes {
                return Err(AppError::invalid(format!(
                    "attachments exceed {} bytes",
                    self.config.max_attachment_bytes
                )));
            }
            payloads.push(AttachmentPayload {
                filename: attachment.filename.clone(),
                content_type: attachment.content_type.clone(),
                data,
                is_inline: attachment.is_inline,
                content_id: None,
            });
        }

        let outbound = OutboundMessage {
            from: account.address.clone(),
            to: trimmed(&draft.recipients),
            cc: trimmed(&draft.cc),
            bcc: trimmed(&draft.bcc),
            subject: draft.subject.trim().to_owned(),
            body_text: draft.body_text.clone(),
            body_html: draft.body_html.clone(),
            in_reply_to: draft.in_reply_to.clone(),
        };
        let adapter = self.providers.for_account(&account)?;
        let provider_message_id = adapter
            .send(&account, &outbound, &payloads)
            .await
            .map_err(|err| match err {
                ProviderError::Rejected(msg) => {
                    AppError::invalid(format!("provider rejected the message: {msg}"))
                }
                other => other.into(),
            })?;

        let sent_at = Utc::now();
        let rows: Vec<NewAttachment> = payloads
            .iter()
            .zip(&draft.attachments)
            .map(|(payload, draft_attachment)| NewAttachment {
                filename: payload.filename.clone(),
                content_type: payload.content_type.clone(),
                size_bytes: i64::try_from(payload.data.len()).unwrap_or(i64::MAX),
                storage_ref: draft_attachment.storage_ref.clone(),
                is_inline: payload.is_inline,
                content_id: None,
                checksum: Some(content_ref(&payload.data)),
            })
            .collect();
        let stored = CanonicalMessage {
            provider_message_id,
            subject: Some(outbound.subject),
            sender: outbound.from,
            recipients: outbound.to,
            cc: outbound.cc,
            bcc: outbound.bcc,
            body_text: outbound.body_text,
            body_html: outbound.body_html.as_deref().map(sanitize_html),
            received_at: sent_at,
            is_read: true,
            is_starred: false,
            folder: SENT_FOLDER.to_owned(),
            labels: Vec::new(),
            thread_id: None,
            in_reply_to: outbound.in_reply_to,
            priority: draft.priority,
            spam_score: None,
            attachments: Vec::new(),
        };
        let message_id = self.store.insert_sent(account.id, &stored, &rows, sent_at)?;
        info!(
            user_id,
            account_id,
            message_id,
            provider_id = %stored.provider_message_id,
            recipients = stored.recipients.len(),
            "message sent"
        );
        self.owned_message(user_id, message_id)
    }

    async fn ensure_credential(&self, account: &Account) -> AppResult<()> {
        match token_state(account, Utc::now()) {
            TokenState::Fresh => Ok(()),
            TokenState::RefreshDue => {
                self.refresher
                    .refresh_needed(RefreshRequest {
                        account_id: account.id,
                        expires_at: account.token_expires_at,
                    })
                    .await;
                Ok(())
            }
            TokenState::Expired => Err(AppError::ProviderAuth(format!(
                "access token for account {} expired; reconnect the account",
                account.id
            ))),
        }
    }

    /// Run a sync to completion. Provider failures are reported inside the
    /// result.
    pub async fn sync_account(&self, user_id: i64, account_id: i64, sync_all: bool) -> AppResult<SyncResult> {
        self.check_rate(user_id, Operation::Sync)?;
        self.sync.run(user_id, account_id, sync_all).await
    }

    /// Start a sync in the background and return immediately.
    pub fn spawn_sync(&self, user_id: i64, account_id: i64, sync_all: bool) -> AppResult<()> {
        self.check_rate(user_id, Operation::Sync)?;
        self.owned_account(user_id, account_id)?;
        self.background.spawn(user_id, account_id, sync_all);
        Ok(())
    }

    pub fn get_sync_status(&self, user_id: i64, account_id: i64) -> AppResult<SyncStatusView> {
        self.check_rate(user_id, Operation::List)?;
        let account = self.owned_account(user_id, account_id)?;
        Ok(SyncStatusView {
            status: account.sync_status,
            last_sync_at: account.last_sync_at,
            error_message: account.error_message,
        })
    }

    /// Apply a patch to one message. A folder change is performed remotely
    /// first; the local row only changes when that succeeds.
    pub async fn update_message(
        &self,
        user_id: i64,
        message_id: i64,
        patch: MessagePatch,
    ) -> AppResult<Message> {
        self.check_rate(user_id, Operation::Update)?;
        if patch == MessagePatch::default() {
            return Err(AppError::invalid("patch must change at least one field"));
        }
        let message = self.owned_message(user_id, message_id)?;
        let mut change = MessageChange::from_message(&message);

        if let Some(folder) = &patch.folder {
            let folder = folder.trim();
            if folder.is_empty() {
                return Err(AppError::invalid("folder must not be empty"));
            }
            if folder != message.folder {
                self.move_remote(&message, folder).await?;
                change.folder = folder.to_owned();
            }
        }
        if let Some(is_read) = patch.is_read {
            change.is_read = is_read;
        }
        if let Some(is_starred) = patch.is_starred {
            change.is_starred = is_starred;
        }
        if let Some(labels) = patch.labels {
            let mut cleaned: Vec<String> = Vec::with_capacity(labels.len());
            for label in labels.iter().map(|l| l.trim()).filter(|l| !l.is_empty()) {
                if !cleaned.iter().any(|existing| existing == label) {
                    cleaned.push(label.to_owned());
                }
            }
            change.labels = cleaned;
        }

        self.store.apply_changes(&[change])?;
        self.owned_message(user_id, message_id)
    }

    /// Delete a message.
    ///
    /// A soft delete moves the message to `trash` remotely and locally. A
    /// permanent delete removes it at the provider first; only on success
    /// are the row, its attachment rows and any unreferenced blobs removed.
    pub async fn delete_message(&self, user_id: i64, message_id: i64, permanent: bool) -> AppResult<()> {
        self.check_rate(user_id, Operation::Delete)?;
        let message = self.owned_message(user_id, message_id)?;

        if !permanent {
            if message.folder != TRASH_FOLDER {
                self.move_remote(&message, TRASH_FOLDER).await?;
                let mut change = MessageChange::from_message(&message);
                change.folder = TRASH_FOLDER.to_owned();
                self.store.apply_changes(&[change])?;
            }
            info!(user_id, message_id, "message moved to trash");
            return Ok(());
        }

        let account = self.message_account(&message)?;
        self.providers
            .for_account(&account)?
            .delete_message(&account, &message.provider_message_id)
            .await?;
        let removed = self.store.delete_message(message_id)?;
        for attachment in removed {
            if self.store.storage_ref_in_use(&attachment.storage_ref)? {
                continue;
            }
            if let Err(err) = self.attachments.remove(&attachment.storage_ref).await {
                warn!(
                    message_id,
                    storage_ref = %attachment.storage_ref,
                    error = %err,
                    "attachment blob not released"
                );
            }
        }
        info!(user_id, message_id, "message deleted permanently");
        Ok(())
    }

    pub async fn bulk_action(&self, user_id: i64, request: &BulkRequest) -> AppResult<BulkResult> {
        self.check_rate(user_id, Operation::BulkAction)?;
        self.bulk.apply(user_id, request).await
    }

    /// Stop accepting background work and wait for running syncs.
    pub async fn shutdown(&self) {
        self.background.shutdown().await;
    }

    fn message_account(&self, message: &Message) -> AppResult<Account> {
        self.store
            .account(message.account_id)?
            .ok_or_else(|| AppError::not_found(format!("account {}", message.account_id)))
    }

    async fn move_remote(&self, message: &Message, folder: &str) -> AppResult<()> {
        let account = self.message_account(message)?;
        self.providers
            .for_account(&account)?
            .move_message(&account, &message.provider_message_id, folder)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::{Mailhub, validate_draft};
    use crate::attachments::{AttachmentStore, MemoryAttachmentStore};
    use crate::config::EngineConfig;
    use crate::credentials::RefreshSignals;
    use crate::errors::AppError;
    use crate::models::{Draft, DraftAttachment, MessageFilter, MessagePatch, NewAttachment};
    use crate::provider::fake::FakeAdapter;
    use crate::provider::{FetchedPage, ProviderError, ProviderRegistry};
    use crate::rate_limit::{Operation, RateBudget};
    use crate::store::Store;
    use crate::store::test_support::{canonical, seed_account};

    struct Harness {
        hub: Mailhub,
        store: Arc<Store>,
        adapter: Arc<FakeAdapter>,
        blobs: Arc<MemoryAttachmentStore>,
        account_id: i64,
    }

    fn harness_with(config: EngineConfig, adapter: FakeAdapter) -> Harness {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let account = seed_account(&store, 1, "me@example.com");
        let adapter = Arc::new(adapter);
        let blobs = Arc::new(MemoryAttachmentStore::new());
        let mut registry = ProviderRegistry::new();
        registry.register(adapter.clone());
        let (hub, _failures) = Mailhub::new(
            config,
            Arc::clone(&store),
            registry,
            blobs.clone(),
            Arc::new(RefreshSignals::channel().0),
        )
        .expect("hub");
        Harness {
            hub,
            store,
            adapter,
            blobs,
            account_id: account.id,
        }
    }

    fn quiet_config() -> EngineConfig {
        EngineConfig {
            sync_on_list: false,
            ..EngineConfig::default()
        }
    }

    fn harness() -> Harness {
        harness_with(quiet_config(), FakeAdapter::default())
    }

    fn draft() -> Draft {
        Draft {
            subject: "Hello".to_owned(),
            body_text: Some("Hi there".to_owned()),
            recipients: vec!["friend@example.com".to_owned()],
            ..Draft::default()
        }
    }

    fn seed_message(h: &Harness, provider_id: &str) -> i64 {
        h.store
            .insert_fetched(
                h.account_id,
                &[(canonical(provider_id, Utc::now()), Vec::new())],
            )
            .expect("insert");
        h.hub
            .list_messages(1, &MessageFilter::default(), 1, 100)
            .expect("list")
            .items
            .into_iter()
            .find(|m| m.provider_message_id == provider_id)
            .expect("seeded message")
            .id
    }

    #[test]
    fn draft_validation_enforces_subject_recipients_and_priority() {
        assert!(validate_draft(&draft()).is_ok());

        let mut no_recipients = draft();
        no_recipients.recipients.clear();
        assert!(validate_draft(&no_recipients).is_err());

        let mut long_subject = draft();
        long_subject.subject = "x".repeat(256);
        assert!(validate_draft(&long_subject).is_err());

        let mut bad_priority = draft();
        bad_priority.priority = 6;
        assert!(validate_draft(&bad_priority).is_err());

        let mut bad_address = draft();
        bad_address.cc = vec!["not an address".to_owned()];
        assert!(validate_draft(&bad_address).is_err());
    }

    #[tokio::test]
    async fn send_stores_read_copy_in_sent_and_counts_it() {
        let h = harness();
        let blob = h.blobs.put(b"report").await.expect("blob");
        let mut outgoing = draft();
        outgoing.attachments = vec![DraftAttachment {
            storage_ref: blob.storage_ref.clone(),
            filename: "report.txt".to_owned(),
            content_type: "text/plain".to_owned(),
            is_inline: false,
        }];

        let sent = h
            .hub
            .send_message(1, h.account_id, outgoing)
            .await
            .expect("send");
        assert_eq!(sent.folder, "sent");
        assert!(sent.is_read);
        assert_eq!(sent.provider_message_id, "sent-1");
        assert_eq!(sent.attachments.len(), 1);
        assert_eq!(sent.attachments[0].storage_ref, blob.storage_ref);

        let account = h.store.account(h.account_id).expect("load").expect("exists");
        assert_eq!(account.total_sent, 1);
        assert!(account.last_sent_at.is_some());
        assert_eq!(h.adapter.sent_attachments.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn third_send_within_budget_window_is_rate_limited() {
        let mut config = quiet_config();
        config
            .rate_limits
            .set(Operation::Send, RateBudget::new(2, Duration::from_secs(60)));
        let h = harness_with(config, FakeAdapter::default());

        h.hub.send_message(1, h.account_id, draft()).await.expect("first");
        h.hub.send_message(1, h.account_id, draft()).await.expect("second");
        let err = h
            .hub
            .send_message(1, h.account_id, draft())
            .await
            .expect_err("third is limited");
        match err {
            AppError::RateLimited {
                retry_after_secs, ..
            } => assert!(retry_after_secs > 0),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.adapter.sent.lock().expect("lock").len(), 2);
    }

    #[tokio::test]
    async fn provider_rejection_is_a_validation_failure() {
        let h = harness();
        *h.adapter.send_error.lock().expect("lock") =
            Some(ProviderError::Rejected("550 no such user".to_owned()));
        let err = h
            .hub
            .send_message(1, h.account_id, draft())
            .await
            .expect_err("rejected");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn foreign_account_cannot_send() {
        let h = harness();
        let err = h
            .hub
            .send_message(2, h.account_id, draft())
            .await
            .expect_err("not owned");
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn soft_delete_moves_to_trash() {
        let h = harness();
        let id = seed_message(&h, "p1");
        h.hub.delete_message(1, id, false).await.expect("delete");

        let message = h.hub.get_message(1, id).expect("still present");
        assert_eq!(message.folder, "trash");
        assert_eq!(
            h.adapter.moves.lock().expect("lock").as_slice(),
            &[("p1".to_owned(), "trash".to_owned())]
        );
    }

    #[tokio::test]
    async fn permanent_delete_failure_leaves_row_intact() {
        let h = harness();
        let id = seed_message(&h, "p1");
        *h.adapter.delete_error.lock().expect("lock") =
            Some(ProviderError::Transport("timeout".to_owned()));

        let err = h
            .hub
            .delete_message(1, id, true)
            .await
            .expect_err("remote failure");
        assert!(matches!(err, AppError::ProviderTransport(_)));
        assert!(h.hub.get_message(1, id).is_ok());
    }

    #[tokio::test]
    async fn permanent_delete_removes_row_and_blob() {
        let h = harness();
        let blob = h.blobs.put(b"payload").await.expect("blob");
        let mut message = canonical("p1", Utc::now());
        message.subject = Some("With attachment".to_owned());
        h.store
            .insert_fetched(
                h.account_id,
                &[(
                    message,
                    vec![NewAttachment {
                        filename: "a.bin".to_owned(),
                        content_type: "application/octet-stream".to_owned(),
                        size_bytes: blob.size_bytes,
                        storage_ref: blob.storage_ref.clone(),
                        is_inline: false,
                        content_id: None,
                        checksum: Some(blob.checksum.clone()),
                    }],
                )],
            )
            .expect("insert");
        let id = h
            .hub
            .list_messages(1, &MessageFilter::default(), 1, 10)
            .expect("list")
            .items[0]
            .id;

        h.hub.delete_message(1, id, true).await.expect("delete");
        assert!(matches!(
            h.hub.get_message(1, id).expect_err("gone"),
            AppError::NotFound(_)
        ));
        assert!(!h.blobs.contains(&blob.storage_ref));
        assert_eq!(h.adapter.deletes.lock().expect("lock").as_slice(), &["p1".to_owned()]);
    }

    #[tokio::test]
    async fn permanent_delete_keeps_blob_still_referenced_elsewhere() {
        let h = harness();
        let blob = h.blobs.put(b"shared payload").await.expect("blob");
        let row = NewAttachment {
            filename: "shared.bin".to_owned(),
            content_type: "application/octet-stream".to_owned(),
            size_bytes: blob.size_bytes,
            storage_ref: blob.storage_ref.clone(),
            is_inline: false,
            content_id: None,
            checksum: Some(blob.checksum.clone()),
        };
        h.store
            .insert_fetched(
                h.account_id,
                &[
                    (canonical("p1", Utc::now()), vec![row.clone()]),
                    (canonical("p2", Utc::now()), vec![row]),
                ],
            )
            .expect("insert");
        let items = h
            .hub
            .list_messages(1, &MessageFilter::default(), 1, 10)
            .expect("list")
            .items;
        let first = items
            .iter()
            .find(|m| m.provider_message_id == "p1")
            .expect("p1")
            .id;
        let second = items
            .iter()
            .find(|m| m.provider_message_id == "p2")
            .expect("p2")
            .id;

        h.hub.delete_message(1, first, true).await.expect("delete first");
        assert!(h.blobs.contains(&blob.storage_ref));
        let survivor = h.hub.get_message(1, second).expect("second remains");
        assert_eq!(survivor.attachments.len(), 1);

        h.hub.delete_message(1, second, true).await.expect("delete second");
        assert!(!h.blobs.contains(&blob.storage_ref));
    }

    #[tokio::test]
    async fn update_with_failed_remote_move_changes_nothing() {
        let h = harness();
        let id = seed_message(&h, "p1");
        h.adapter
            .failing_moves
            .lock()
            .expect("lock")
            .insert("p1".to_owned());

        let patch = MessagePatch {
            is_read: Some(true),
            folder: Some("archive".to_owned()),
            ..MessagePatch::default()
        };
        assert!(h.hub.update_message(1, id, patch).await.is_err());
        let message = h.hub.get_message(1, id).expect("load");
        assert_eq!(message.folder, "inbox");
        assert!(!message.is_read);
    }

    #[tokio::test]
    async fn update_applies_flags_and_dedups_labels() {
        let h = harness();
        let id = seed_message(&h, "p1");
        let patch = MessagePatch {
            is_starred: Some(true),
            labels: Some(vec!["a".to_owned(), " a ".to_owned(), "b".to_owned()]),
            ..MessagePatch::default()
        };
        let updated = h.hub.update_message(1, id, patch).await.expect("update");
        assert!(updated.is_starred);
        assert_eq!(updated.labels, vec!["a".to_owned(), "b".to_owned()]);
        assert!(h.adapter.moves.lock().expect("lock").is_empty());

        let err = h
            .hub
            .update_message(1, id, MessagePatch::default())
            .await
            .expect_err("empty patch");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn unfiltered_listing_syncs_in_background() {
        let adapter = FakeAdapter::with_pages(vec![Ok(FetchedPage {
            messages: vec![canonical("remote-1", Utc::now())],
            next_cursor: None,
        })]);
        let h = harness_with(EngineConfig::default(), adapter);

        let first = h
            .hub
            .list_messages(1, &MessageFilter::default(), 1, 20)
            .expect("list");
        assert!(first.total <= 1);
        h.hub.shutdown().await;

        let after = h
            .hub
            .list_messages(
                1,
                &MessageFilter {
                    account_id: Some(h.account_id),
                    ..MessageFilter::default()
                },
                1,
                20,
            )
            .expect("list");
        assert_eq!(after.total, 1);
        assert_eq!(h.adapter.fetch_count(), 1);
    }

    #[tokio::test]
    async fn sync_status_reflects_last_run() {
        let h = harness();
        let result = h.hub.sync_account(1, h.account_id, false).await.expect("sync");
        assert_eq!(result.new_count, 0);
        let status = h.hub.get_sync_status(1, h.account_id).expect("status");
        assert_eq!(status.status, crate::models::SyncStatus::Success);
        assert!(status.last_sync_at.is_some());
        assert!(h.hub.get_sync_status(2, h.account_id).is_err());
    }
}
