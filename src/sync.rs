//! Sync orchestration
//!
//! A run pulls pages from the account's provider adapter and inserts
//! messages that are not yet stored. Existing rows are never rewritten, so
//! local read/starred/folder/label state survives any number of re-syncs.
//! The account always leaves `syncing` through a terminal state, even when
//! the fetch loop errors or panics.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::account_state::{AccountStateTracker, TokenState, token_state};
use crate::attachments::AttachmentStore;
use crate::credentials::{CredentialRefresher, RefreshRequest};
use crate::errors::{AppError, AppResult};
use crate::models::{Account, CanonicalMessage, NewAttachment, SyncResult, SyncRunStatus};
use crate::provider::{FetchRequest, FetchedPage, ProviderAdapter, ProviderRegistry};
use crate::store::Store;

/// Knobs for one sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub page_size: u32,
    /// Retries per page for transport failures
    pub max_retries: u32,
    /// First retry delay; doubles on each further attempt
    pub retry_backoff: Duration,
    /// Larger attachments are skipped during sync
    pub max_attachment_bytes: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            max_attachment_bytes: 25 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Default)]
struct RunCounts {
    fetched: usize,
    inserted: usize,
}

/// Runs provider-to-store syncs for single accounts
pub struct SyncOrchestrator {
    store: Arc<Store>,
    providers: Arc<ProviderRegistry>,
    attachments: Arc<dyn AttachmentStore>,
    refresher: Arc<dyn CredentialRefresher>,
    state: AccountStateTracker,
    settings: SyncSettings,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<Store>,
        providers: Arc<ProviderRegistry>,
        attachments: Arc<dyn AttachmentStore>,
        refresher: Arc<dyn CredentialRefresher>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            state: AccountStateTracker::new(Arc::clone(&store)),
            store,
            providers,
            attachments,
            refresher,
            settings,
        }
    }

    /// Sync one account owned by `user_id`.
    ///
    /// Provider failures end up in the returned [`SyncResult`] with status
    /// `failed`; they are not raised.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the account does not exist or belongs to another user
    /// - `Validation` if the account is deactivated
    /// - `Storage` if the terminal sync state cannot be written
    pub async fn run(&self, user_id: i64, account_id: i64, sync_all: bool) -> AppResult<SyncResult> {
        let account = self
            .store
            .account(account_id)?
            .filter(|account| account.user_id == user_id)
            .ok_or_else(|| AppError::not_found(format!("account {account_id} not found")))?;
        if !account.is_active {
            return Err(AppError::invalid(format!("account {account_id} is deactivated")));
        }

        if !self.state.begin(account_id)? {
            info!(user_id, account_id, "sync already running");
            return Ok(SyncResult {
                account_id,
                status: SyncRunStatus::AlreadySyncing,
                fetched_count: 0,
                new_count: 0,
                error: None,
            });
        }
        info!(user_id, account_id, sync_all, "sync started");

        // The next incremental window opens where this one started, so mail
        // arriving while pages are being fetched is picked up next time.
        let started_at = Utc::now();
        let mut counts = RunCounts::default();
        let outcome = AssertUnwindSafe(self.fetch_all(&account, sync_all, &mut counts))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some("sync aborted unexpectedly".to_owned()),
        };

        let status = match &failure {
            None => {
                self.state.succeed(account_id, started_at)?;
                info!(
                    account_id,
                    fetched = counts.fetched,
                    inserted = counts.inserted,
                    "sync completed"
                );
                SyncRunStatus::Completed
            }
            Some(message) => {
                self.state.fail(account_id, message)?;
                warn!(
                    account_id,
                    fetched = counts.fetched,
                    inserted = counts.inserted,
                    error = %message,
                    "sync failed"
                );
                SyncRunStatus::Failed
            }
        };

        Ok(SyncResult {
            account_id,
            status,
            fetched_count: counts.fetched,
            new_count: counts.inserted,
            error: failure,
        })
    }

    async fn fetch_all(
        &self,
        account: &Account,
        sync_all: bool,
        counts: &mut RunCounts,
    ) -> AppResult<()> {
        let adapter = self.providers.for_account(account)?;
        match token_state(account, Utc::now()) {
            TokenState::Fresh => {}
            TokenState::RefreshDue => {
                self.refresher
                    .refresh_needed(RefreshRequest {
                        account_id: account.id,
                        expires_at: account.token_expires_at,
                    })
                    .await;
            }
            TokenState::Expired => {
                return Err(AppError::ProviderAuth(
                    "access token expired; reconnect the account".to_owned(),
                ));
            }
        }

        let since = if sync_all { None } else { account.last_sync_at };
        let mut cursor: Option<String> = None;
        loop {
            let request = FetchRequest {
                cursor: cursor.clone(),
                since,
                page_size: self.settings.page_size,
            };
            let page = self.fetch_with_retry(adapter.as_ref(), account, &request).await?;
            counts.fetched += page.messages.len();
            counts.inserted += self.persist_page(account.id, page.messages).await?;

            match page.next_cursor {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    warn!(account_id = account.id, "provider repeated its cursor; stopping");
                    return Ok(());
                }
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        adapter: &dyn ProviderAdapter,
        account: &Account,
        request: &FetchRequest,
    ) -> AppResult<FetchedPage> {
        let mut attempt: u32 = 0;
        loop {
            match adapter.fetch_page(account, request).await {
                Ok(page) => return Ok(page),
                Err(err) if err.is_retryable() && attempt < self.settings.max_retries => {
                    let delay = self
                        .settings
                        .retry_backoff
                        .saturating_mul(2u32.saturating_pow(attempt));
                    attempt += 1;
                    warn!(
                        account_id = account.id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Store blobs for unseen messages, then insert the page in one
    /// transaction. Returns the number of inserted rows.
    async fn persist_page(&self, account_id: i64, messages: Vec<CanonicalMessage>) -> AppResult<usize> {
        if messages.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = messages
            .iter()
            .map(|m| m.provider_message_id.clone())
            .collect();
        let known = self.store.known_provider_ids(account_id, &ids)?;

        let mut seen = HashSet::new();
        let mut batch = Vec::with_capacity(messages.len());
        for mut message in messages {
            if known.contains(&message.provider_message_id)
                || !seen.insert(message.provider_message_id.clone())
            {
                continue;
            }
            let payloads = std::mem::take(&mut message.attachments);
            let mut rows = Vec::with_capacity(payloads.len());
            for payload in payloads {
                if payload.data.len() as u64 > self.settings.max_attachment_bytes {
                    warn!(
                        account_id,
                        provider_id = %message.provider_message_id,
                        filename = %payload.filename,
                        size = payload.data.len(),
                        "attachment over size limit skipped"
                    );
                    continue;
                }
                let blob = self.attachments.put(&payload.data).await?;
                rows.push(NewAttachment {
                    filename: payload.filename,
                    content_type: payload.content_type,
                    size_bytes: blob.size_bytes,
                    storage_ref: blob.storage_ref,
                    is_inline: payload.is_inline,
                    content_id: payload.content_id,
                    checksum: Some(blob.checksum),
                });
            }
            batch.push((message, rows));
        }
        self.store.insert_fetched(account_id, &batch)
    }
}

/// A background sync that did not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub user_id: i64,
    pub account_id: i64,
    pub error: String,
}

/// Fire-and-forget sync runner
///
/// Spawned runs are tracked so shutdown can wait for them. Failures are
/// logged and forwarded on the failure channel; nobody awaits the task.
#[derive(Clone)]
pub struct BackgroundSync {
    orchestrator: Arc<SyncOrchestrator>,
    tasks: TaskTracker,
    failures: mpsc::UnboundedSender<SyncFailure>,
}

impl BackgroundSync {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        failures: mpsc::UnboundedSender<SyncFailure>,
    ) -> Self {
        Self {
            orchestrator,
            tasks: TaskTracker::new(),
            failures,
        }
    }

    pub fn spawn(&self, user_id: i64, account_id: i64, sync_all: bool) {
        let orchestrator = Arc::clone(&self.orchestrator);
        let failures = self.failures.clone();
        self.tasks.spawn(async move {
            let error = match orchestrator.run(user_id, account_id, sync_all).await {
                Ok(result) if result.status == SyncRunStatus::Failed => {
                    result.error.unwrap_or_else(|| "sync failed".to_owned())
                }
                Ok(_) => return,
                Err(err) => err.to_string(),
            };
            error!(user_id, account_id, error = %error, "background sync failed");
            let _ = failures.send(SyncFailure {
                user_id,
                account_id,
                error,
            });
        });
    }

    /// Stop accepting work and wait for running syncs.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};
    use tokio::sync::{Notify, mpsc};

    use super::{BackgroundSync, SyncOrchestrator, SyncSettings};
    use crate::attachments::MemoryAttachmentStore;
    use crate::credentials::RefreshSignals;
    use crate::errors::AppError;
    use crate::models::{AttachmentPayload, SyncRunStatus, SyncStatus};
    use crate::provider::fake::FakeAdapter;
    use crate::provider::{FetchedPage, ProviderError, ProviderRegistry};
    use crate::store::test_support::{canonical, seed_account};
    use crate::store::{MessageChange, Store};

    fn settings() -> SyncSettings {
        SyncSettings {
            page_size: 10,
            max_retries: 2,
            retry_backoff: Duration::from_millis(1),
            max_attachment_bytes: 1024,
        }
    }

    fn orchestrator(store: &Arc<Store>, adapter: Arc<FakeAdapter>) -> SyncOrchestrator {
        let mut registry = ProviderRegistry::new();
        registry.register(adapter);
        SyncOrchestrator::new(
            Arc::clone(store),
            Arc::new(registry),
            Arc::new(MemoryAttachmentStore::new()),
            Arc::new(RefreshSignals::channel().0),
            settings(),
        )
    }

    fn page(ids: &[&str], next: Option<&str>) -> FetchedPage {
        FetchedPage {
            messages: ids.iter().map(|id| canonical(id, Utc::now())).collect(),
            next_cursor: next.map(str::to_owned),
        }
    }

    #[tokio::test]
    async fn follows_cursor_and_inserts_each_message_once() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let account = seed_account(&store, 1, "a@example.com");
        let adapter = Arc::new(FakeAdapter::with_pages(vec![
            Ok(page(&["m1", "m2"], Some("c1"))),
            Ok(page(&["m2", "m3"], None)),
        ]));
        let sync = orchestrator(&store, Arc::clone(&adapter));

        let result = sync.run(1, account.id, true).await.expect("run");
        assert_eq!(result.status, SyncRunStatus::Completed);
        assert_eq!(result.fetched_count, 4);
        assert_eq!(result.new_count, 3);
        assert_eq!(adapter.fetch_count(), 2);
        let calls = adapter.fetch_calls.lock().expect("lock");
        assert_eq!(calls[1].cursor.as_deref(), Some("c1"));

        let synced = store.account(account.id).expect("load").expect("exists");
        assert_eq!(synced.sync_status, SyncStatus::Success);
        assert!(synced.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn resync_preserves_local_flags() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let account = seed_account(&store, 1, "a@example.com");
        let first = Arc::new(FakeAdapter::with_pages(vec![Ok(page(&["m1"], None))]));
        orchestrator(&store, first).run(1, account.id, true).await.expect("first");

        let stored = store
            .select_matching(
                &crate::query::build_plan(1, &Default::default()).expect("plan"),
                10,
                0,
            )
            .expect("select");
        let mut change = MessageChange::from_message(&stored[0]);
        change.is_read = true;
        change.is_starred = true;
        change.labels = vec!["keep".to_owned()];
        store.apply_changes(&[change]).expect("apply");

        let second = Arc::new(FakeAdapter::with_pages(vec![Ok(page(&["m1"], None))]));
        let result = orchestrator(&store, second)
            .run(1, account.id, true)
            .await
            .expect("second");
        assert_eq!(result.new_count, 0);

        let reloaded = store
            .message_for_user(1, stored[0].id)
            .expect("load")
            .expect("exists");
        assert!(reloaded.is_read);
        assert!(reloaded.is_starred);
        assert_eq!(reloaded.labels, vec!["keep".to_owned()]);
    }

    #[tokio::test]
    async fn concurrent_runs_fetch_once() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let account = seed_account(&store, 1, "a@example.com");
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let adapter = Arc::new(FakeAdapter {
            gate: Some((Arc::clone(&entered), Arc::clone(&release))),
            ..FakeAdapter::with_pages(vec![Ok(page(&["m1"], None))])
        });
        let sync = Arc::new(orchestrator(&store, Arc::clone(&adapter)));

        let first = {
            let sync = Arc::clone(&sync);
            let account_id = account.id;
            tokio::spawn(async move { sync.run(1, account_id, false).await })
        };
        entered.notified().await;

        let second = sync.run(1, account.id, false).await.expect("second");
        assert_eq!(second.status, SyncRunStatus::AlreadySyncing);

        release.notify_one();
        let first = first.await.expect("join").expect("first");
        assert_eq!(first.status, SyncRunStatus::Completed);
        assert_eq!(adapter.fetch_count(), 1);
    }

    #[tokio::test]
    async fn last_sync_at_marks_the_start_of_the_fetch() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let account = seed_account(&store, 1, "a@example.com");
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let adapter = Arc::new(FakeAdapter {
            gate: Some((Arc::clone(&entered), Arc::clone(&release))),
            ..FakeAdapter::with_pages(vec![Ok(page(&["m1"], None))])
        });
        let sync = Arc::new(orchestrator(&store, Arc::clone(&adapter)));

        let run = {
            let sync = Arc::clone(&sync);
            let account_id = account.id;
            tokio::spawn(async move { sync.run(1, account_id, false).await })
        };
        entered.notified().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let arrived_mid_run = Utc::now();
        release.notify_one();
        let result = run.await.expect("join").expect("run");
        assert_eq!(result.status, SyncRunStatus::Completed);

        let synced = store.account(account.id).expect("load").expect("exists");
        let next_since = synced.last_sync_at.expect("stamped");
        assert!(next_since <= arrived_mid_run);
    }

    #[tokio::test]
    async fn refresh_due_token_is_signalled_and_sync_continues() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let mut account = seed_account(&store, 1, "a@example.com");
        account.token_expires_at = Some(Utc::now() + ChronoDuration::minutes(2));
        let account = store
            .upsert_account(&crate::models::NewAccount {
                user_id: 1,
                provider: account.provider,
                address: account.address.clone(),
                access_token: account.access_token.clone(),
                refresh_token: account.refresh_token.clone(),
                token_expires_at: account.token_expires_at,
                imap_host: None,
                imap_port: None,
                smtp_host: None,
                smtp_port: None,
            })
            .expect("update expiry");

        let adapter = Arc::new(FakeAdapter::with_pages(vec![Ok(page(&["m1"], None))]));
        let mut registry = ProviderRegistry::new();
        registry.register(adapter.clone());
        let (signals, mut refreshes) = RefreshSignals::channel();
        let sync = SyncOrchestrator::new(
            Arc::clone(&store),
            Arc::new(registry),
            Arc::new(MemoryAttachmentStore::new()),
            Arc::new(signals),
            settings(),
        );

        let result = sync.run(1, account.id, false).await.expect("run");
        assert_eq!(result.status, SyncRunStatus::Completed);
        assert_eq!(adapter.fetch_count(), 1);
        let request = refreshes.try_recv().expect("refresh signalled");
        assert_eq!(request.account_id, account.id);
    }

    #[tokio::test]
    async fn auth_failure_aborts_without_retry() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let account = seed_account(&store, 1, "a@example.com");
        let adapter = Arc::new(FakeAdapter::with_pages(vec![Err(ProviderError::Auth(
            "revoked".to_owned(),
        ))]));
        let result = orchestrator(&store, Arc::clone(&adapter))
            .run(1, account.id, false)
            .await
            .expect("run");

        assert_eq!(result.status, SyncRunStatus::Failed);
        assert!(result.error.expect("error").contains("revoked"));
        assert_eq!(adapter.fetch_count(), 1);
        let failed = store.account(account.id).expect("load").expect("exists");
        assert_eq!(failed.sync_status, SyncStatus::Failed);
        assert!(failed.error_message.is_some());
    }

    #[tokio::test]
    async fn transport_failures_are_retried() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let account = seed_account(&store, 1, "a@example.com");
        let adapter = Arc::new(FakeAdapter::with_pages(vec![
            Err(ProviderError::Transport("reset".to_owned())),
            Err(ProviderError::Transport("reset".to_owned())),
            Ok(page(&["m1"], None)),
        ]));
        let result = orchestrator(&store, Arc::clone(&adapter))
            .run(1, account.id, false)
            .await
            .expect("run");

        assert_eq!(result.status, SyncRunStatus::Completed);
        assert_eq!(result.new_count, 1);
        assert_eq!(adapter.fetch_count(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_run() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let account = seed_account(&store, 1, "a@example.com");
        let adapter = Arc::new(FakeAdapter::with_pages(vec![
            Err(ProviderError::Transport("down".to_owned())),
            Err(ProviderError::Transport("down".to_owned())),
            Err(ProviderError::Transport("down".to_owned())),
        ]));
        let result = orchestrator(&store, Arc::clone(&adapter))
            .run(1, account.id, false)
            .await
            .expect("run");

        assert_eq!(result.status, SyncRunStatus::Failed);
        assert_eq!(adapter.fetch_count(), 3);
    }

    #[tokio::test]
    async fn expired_token_fails_without_calling_provider() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let mut account = seed_account(&store, 1, "a@example.com");
        account.token_expires_at = Some(Utc::now() - ChronoDuration::minutes(1));
        let account = store
            .upsert_account(&crate::models::NewAccount {
                user_id: 1,
                provider: account.provider,
                address: account.address.clone(),
                access_token: account.access_token.clone(),
                refresh_token: None,
                token_expires_at: account.token_expires_at,
                imap_host: None,
                imap_port: None,
                smtp_host: None,
                smtp_port: None,
            })
            .expect("expire");
        let adapter = Arc::new(FakeAdapter::default());
        let result = orchestrator(&store, Arc::clone(&adapter))
            .run(1, account.id, false)
            .await
            .expect("run");

        assert_eq!(result.status, SyncRunStatus::Failed);
        assert!(result.error.expect("error").contains("reconnect"));
        assert_eq!(adapter.fetch_count(), 0);
    }

    #[tokio::test]
    async fn foreign_account_is_not_found() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let account = seed_account(&store, 1, "a@example.com");
        let err = orchestrator(&store, Arc::new(FakeAdapter::default()))
            .run(2, account.id, false)
            .await
            .expect_err("must fail");
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn deactivated_account_is_not_synced() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let account = seed_account(&store, 1, "a@example.com");
        assert!(store.deactivate_account(account.id).expect("deactivate"));
        let adapter = Arc::new(FakeAdapter::default());

        let err = orchestrator(&store, Arc::clone(&adapter))
            .run(1, account.id, false)
            .await
            .expect_err("inactive");
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(adapter.fetch_count(), 0);
        let untouched = store.account(account.id).expect("load").expect("exists");
        assert_eq!(untouched.sync_status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn attachments_of_new_messages_are_stored() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let account = seed_account(&store, 1, "a@example.com");
        let mut message = canonical("m1", Utc::now());
        message.attachments = vec![
            AttachmentPayload {
                filename: "a.txt".to_owned(),
                content_type: "text/plain".to_owned(),
                data: b"hello".to_vec(),
                is_inline: false,
                content_id: None,
            },
            AttachmentPayload {
                filename: "big.bin".to_owned(),
                content_type: "application/octet-stream".to_owned(),
                data: vec![0; 4096],
                is_inline: false,
                content_id: None,
            },
        ];
        let adapter = Arc::new(FakeAdapter::with_pages(vec![Ok(FetchedPage {
            messages: vec![message],
            next_cursor: None,
        })]));
        orchestrator(&store, adapter)
            .run(1, account.id, false)
            .await
            .expect("run");

        let stored = store
            .select_matching(
                &crate::query::build_plan(1, &Default::default()).expect("plan"),
                10,
                0,
            )
            .expect("select");
        assert_eq!(stored[0].attachments.len(), 1);
        assert_eq!(stored[0].attachments[0].filename, "a.txt");
    }

    #[tokio::test]
    async fn background_failures_reach_the_channel() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let account = seed_account(&store, 1, "a@example.com");
        let adapter = Arc::new(FakeAdapter::with_pages(vec![Err(ProviderError::Rejected(
            "nope".to_owned(),
        ))]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let background = BackgroundSync::new(Arc::new(orchestrator(&store, adapter)), tx);

        background.spawn(1, account.id, false);
        background.shutdown().await;

        let failure = rx.recv().await.expect("failure reported");
        assert_eq!(failure.account_id, account.id);
        assert!(failure.error.contains("nope"));
    }
}
