//! Refresh-needed signalling for OAuth credentials
//!
//! The engine never exchanges tokens itself. When a token is close to expiry
//! it emits a signal to whatever component owns the OAuth flow and keeps
//! using the still-valid token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;

/// A request to refresh one account's credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    pub account_id: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Sink for refresh-needed signals
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh_needed(&self, request: RefreshRequest);
}

/// Forwards signals over an unbounded channel
#[derive(Debug, Clone)]
pub struct RefreshSignals {
    tx: mpsc::UnboundedSender<RefreshRequest>,
}

impl RefreshSignals {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RefreshRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CredentialRefresher for RefreshSignals {
    async fn refresh_needed(&self, request: RefreshRequest) {
        let account_id = request.account_id;
        if self.tx.send(request).is_err() {
            warn!(account_id, "credential refresh receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CredentialRefresher, RefreshRequest, RefreshSignals};

    #[tokio::test]
    async fn signals_reach_the_receiver() {
        let (signals, mut rx) = RefreshSignals::channel();
        signals
            .refresh_needed(RefreshRequest {
                account_id: 9,
                expires_at: None,
            })
            .await;
        let got = rx.recv().await.expect("signal");
        assert_eq!(got.account_id, 9);
    }
}
