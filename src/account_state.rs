//! Per-account sync lifecycle and token freshness
//!
//! The sync status machine is `idle|success|failed → syncing → success|failed`.
//! Entering `syncing` is a compare-and-set in the store, so two concurrent
//! runs for one account can never both hold it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::models::{Account, SyncStatus};
use crate::store::Store;

/// Tokens this close to expiry are refreshed ahead of use
pub const REFRESH_SKEW_SECS: i64 = 5 * 60;

/// Freshness of an account's provider credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Fresh,
    /// Still usable, but a refresh should be requested
    RefreshDue,
    /// Unusable; the account needs reconnecting
    Expired,
}

/// Classify an account's credential at `now`.
///
/// Password-based accounts never expire. OAuth accounts without a token are
/// treated as expired; a token with no recorded expiry is trusted.
pub fn token_state(account: &Account, now: DateTime<Utc>) -> TokenState {
    if !account.provider.uses_oauth() {
        return TokenState::Fresh;
    }
    if account.access_token.is_none() {
        return TokenState::Expired;
    }
    match account.token_expires_at {
        None => TokenState::Fresh,
        Some(expires_at) if expires_at <= now => TokenState::Expired,
        Some(expires_at) if expires_at - now <= Duration::seconds(REFRESH_SKEW_SECS) => {
            TokenState::RefreshDue
        }
        Some(_) => TokenState::Fresh,
    }
}

/// Whether a sync status transition is permitted.
pub fn can_transition(from: SyncStatus, to: SyncStatus) -> bool {
    match to {
        SyncStatus::Syncing => from != SyncStatus::Syncing,
        SyncStatus::Success | SyncStatus::Failed => from == SyncStatus::Syncing,
        SyncStatus::Idle => false,
    }
}

/// Drives the sync status machine against the store
#[derive(Debug, Clone)]
pub struct AccountStateTracker {
    store: Arc<Store>,
}

impl AccountStateTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Try to enter `syncing`. Returns `false` when another run holds it.
    pub fn begin(&self, account_id: i64) -> AppResult<bool> {
        let acquired = self.store.try_begin_sync(account_id)?;
        debug!(account_id, acquired, "sync begin");
        Ok(acquired)
    }

    /// `syncing → success`, recording `at` as the start of the next incremental window.
    pub fn succeed(&self, account_id: i64, at: DateTime<Utc>) -> AppResult<()> {
        self.finish(account_id, SyncStatus::Success, Some(at), None)
    }

    /// `syncing → failed`, recording the error message.
    pub fn fail(&self, account_id: i64, error: &str) -> AppResult<()> {
        self.finish(account_id, SyncStatus::Failed, None, Some(error))
    }

    fn finish(
        &self,
        account_id: i64,
        status: SyncStatus,
        at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> AppResult<()> {
        if !can_transition(SyncStatus::Syncing, status) {
            return Err(AppError::Internal(format!(
                "invalid terminal sync status {}",
                status.as_str()
            )));
        }
        if !self.store.finish_sync(account_id, status, at, error)? {
            warn!(account_id, status = status.as_str(), "account was not syncing");
        }
        Ok(())
    }
}
