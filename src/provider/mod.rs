//! Provider adapter contract and shared wire helpers
//!
//! Every remote mailbox protocol is reached through [`ProviderAdapter`]. The
//! adapters own all provider quirks: addressing, folder naming, flag mapping
//! and status-code interpretation. Nothing outside this module branches on
//! [`ProviderKind`]; callers look an adapter up through [`ProviderRegistry`].

pub mod gmail;
pub mod graph;
pub mod imap_smtp;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use secrecy::ExposeSecret;
use thiserror::Error;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::mime::truncate_chars;
use crate::models::{Account, AttachmentPayload, CanonicalMessage, OutboundMessage, ProviderKind};

/// Longest provider error body kept in error messages
const ERROR_BODY_MAX_CHARS: usize = 300;

/// Adapter-level failure, translated into [`AppError`] at the engine boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Credential expired or revoked; never retried inside the engine
    #[error("authentication rejected: {0}")]
    Auth(String),
    /// Network failure, timeout, throttling or 5xx; retryable
    #[error("transport failure: {0}")]
    Transport(String),
    /// Permanent rejection of this request
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Auth(msg) => Self::ProviderAuth(msg),
            ProviderError::Transport(msg) => Self::ProviderTransport(msg),
            ProviderError::Rejected(msg) => Self::ProviderRejected(msg),
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// One `fetch_page` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Opaque resume token from the previous page; `None` starts a run
    pub cursor: Option<String>,
    /// Only messages received at or after this instant; `None` is a full sync
    pub since: Option<DateTime<Utc>>,
    pub page_size: u32,
}

/// One page of canonical messages in provider-delivered order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedPage {
    pub messages: Vec<CanonicalMessage>,
    /// `None` when the provider has nothing more
    pub next_cursor: Option<String>,
}

/// Remote mailbox operations, implemented once per provider kind
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Dispatch a message and return its provider-native id.
    async fn send(
        &self,
        account: &Account,
        message: &OutboundMessage,
        attachments: &[AttachmentPayload],
    ) -> ProviderResult<String>;

    async fn fetch_page(&self, account: &Account, request: &FetchRequest)
    -> ProviderResult<FetchedPage>;

    /// Move a message to a canonical folder name (`inbox`, `trash`, ...).
    async fn move_message(
        &self,
        account: &Account,
        provider_message_id: &str,
        target_folder: &str,
    ) -> ProviderResult<()>;

    /// Remove a message permanently.
    async fn delete_message(&self, account: &Account, provider_message_id: &str)
    -> ProviderResult<()>;
}

/// Connection settings shared by the built-in adapters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    /// Bound on every remote call; expiry is a retryable transport error
    pub timeout: Duration,
    pub gmail_api_base: String,
    pub graph_api_base: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            gmail_api_base: gmail::GMAIL_API_BASE.to_owned(),
            graph_api_base: graph::GRAPH_API_BASE.to_owned(),
        }
    }
}

/// Adapter lookup by provider kind
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry wired with the Gmail, Graph and IMAP/SMTP adapters.
    pub fn standard(settings: &ProviderSettings) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;

        let mut registry = Self::new();
        registry.register(Arc::new(gmail::GmailAdapter::new(
            http.clone(),
            settings.gmail_api_base.clone(),
        )));
        registry.register(Arc::new(graph::GraphAdapter::new(
            http,
            settings.graph_api_base.clone(),
        )));
        registry.register(Arc::new(imap_smtp::ImapSmtpAdapter::new(settings.timeout)));
        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn for_account(&self, account: &Account) -> AppResult<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&account.provider).cloned().ok_or_else(|| {
            AppError::Internal(format!(
                "no adapter registered for provider {}",
                account.provider.as_str()
            ))
        })
    }
}

/// Bearer token for an OAuth account.
pub(crate) fn bearer_token(account: &Account) -> ProviderResult<&str> {
    account
        .access_token
        .as_ref()
        .map(|token| token.expose_secret())
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ProviderError::Auth(format!("account {} has no access token", account.id)))
}

/// Map an HTTP status and body to the adapter error taxonomy.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: &str) -> ProviderError {
    let detail = format!(
        "HTTP {}: {}",
        status.as_u16(),
        truncate_chars(body.trim().to_owned(), ERROR_BODY_MAX_CHARS)
    );
    match status.as_u16() {
        401 | 403 => ProviderError::Auth(detail),
        408 | 429 => ProviderError::Transport(detail),
        code if code >= 500 => ProviderError::Transport(detail),
        _ => ProviderError::Rejected(detail),
    }
}

/// Pass a successful response through, classifying failures.
pub(crate) async fn check_response(response: reqwest::Response) -> ProviderResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

/// Network-level reqwest failures (connect, timeout, decode) are transient.
pub(crate) fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        return ProviderError::Transport(format!("request timed out: {err}"));
    }
    ProviderError::Transport(err.to_string())
}

/// Outbound message rendered to RFC 5322
pub(crate) struct RenderedMessage {
    pub message: lettre::Message,
    pub message_id: String,
}

/// Build a MIME message for raw-submission providers (Gmail, SMTP).
pub(crate) fn render_message(
    outbound: &OutboundMessage,
    attachments: &[AttachmentPayload],
) -> ProviderResult<RenderedMessage> {
    let from: Mailbox = parse_mailbox("from", &outbound.from)?;
    let domain = outbound
        .from
        .rsplit_once('@')
        .map(|(_, d)| d.trim_end_matches('>').to_owned())
        .unwrap_or_else(|| "localhost".to_owned());
    let message_id = format!("<{}@{domain}>", Uuid::new_v4());

    let mut builder = lettre::Message::builder()
        .from(from)
        .subject(outbound.subject.clone())
        .message_id(Some(message_id.clone()));
    for addr in &outbound.to {
        builder = builder.to(parse_mailbox("to", addr)?);
    }
    for addr in &outbound.cc {
        builder = builder.cc(parse_mailbox("cc", addr)?);
    }
    for addr in &outbound.bcc {
        builder = builder.bcc(parse_mailbox("bcc", addr)?);
    }
    if let Some(parent) = &outbound.in_reply_to {
        builder = builder
            .in_reply_to(parent.clone())
            .references(parent.clone());
    }

    let text = outbound.body_text.clone().unwrap_or_default();
    let body = match &outbound.body_html {
        Some(html) => MultiPart::alternative_plain_html(text, html.clone()),
        None => MultiPart::mixed().singlepart(SinglePart::plain(text)),
    };

    let built = if attachments.is_empty() {
        builder.multipart(body)
    } else {
        let mut mixed = MultiPart::mixed().multipart(body);
        for attachment in attachments {
            let content_type = ContentType::parse(&attachment.content_type)
                .or_else(|_| ContentType::parse("application/octet-stream"))
                .map_err(|e| ProviderError::Rejected(format!("invalid content type: {e}")))?;
            let part = match (&attachment.content_id, attachment.is_inline) {
                (Some(cid), true) => Attachment::new_inline(cid.clone()),
                _ => Attachment::new(attachment.filename.clone()),
            };
            mixed = mixed.singlepart(part.body(attachment.data.clone(), content_type));
        }
        builder.multipart(mixed)
    };
    let message =
        built.map_err(|e| ProviderError::Rejected(format!("cannot build message: {e}")))?;

    Ok(RenderedMessage {
        message,
        message_id,
    })
}

fn parse_mailbox(field: &str, raw: &str) -> ProviderResult<Mailbox> {
    raw.trim()
        .parse()
        .map_err(|e| ProviderError::Rejected(format!("invalid {field} address '{raw}': {e}")))
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::{HashSet, VecDeque};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::{FetchRequest, FetchedPage, ProviderAdapter, ProviderError, ProviderResult};
    use crate::models::{Account, AttachmentPayload, OutboundMessage, ProviderKind};

    /// Scripted adapter for engine tests
    #[derive(Default)]
    pub struct FakeAdapter {
        pub pages: Mutex<VecDeque<ProviderResult<FetchedPage>>>,
        pub fetch_calls: Mutex<Vec<FetchRequest>>,
        pub sent: Mutex<Vec<OutboundMessage>>,
        pub sent_attachments: Mutex<Vec<AttachmentPayload>>,
        pub send_error: Mutex<Option<ProviderError>>,
        pub moves: Mutex<Vec<(String, String)>>,
        pub failing_moves: Mutex<HashSet<String>>,
        pub deletes: Mutex<Vec<String>>,
        pub delete_error: Mutex<Option<ProviderError>>,
        /// When set, `fetch_page` announces entry and then waits for release
        pub gate: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    impl FakeAdapter {
        pub fn with_pages(pages: Vec<ProviderResult<FetchedPage>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                ..Self::default()
            }
        }

        pub fn fetch_count(&self) -> usize {
            self.fetch_calls.lock().expect("lock").len()
        }
    }

    #[async_trait]
    impl ProviderAdapter for FakeAdapter {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Gmail
        }

        async fn send(
            &self,
            _account: &Account,
            message: &OutboundMessage,
            attachments: &[AttachmentPayload],
        ) -> ProviderResult<String> {
            if let Some(err) = self.send_error.lock().expect("lock").clone() {
                return Err(err);
            }
            let mut sent = self.sent.lock().expect("lock");
            sent.push(message.clone());
            self.sent_attachments
                .lock()
                .expect("lock")
                .extend(attachments.iter().cloned());
            Ok(format!("sent-{}", sent.len()))
        }

        async fn fetch_page(
            &self,
            _account: &Account,
            request: &FetchRequest,
        ) -> ProviderResult<FetchedPage> {
            self.fetch_calls.lock().expect("lock").push(request.clone());
            if let Some((entered, release)) = &self.gate {
                entered.notify_one();
                release.notified().await;
            }
            self.pages
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Ok(FetchedPage::default()))
        }

        async fn move_message(
            &self,
            _account: &Account,
            provider_message_id: &str,
            target_folder: &str,
        ) -> ProviderResult<()> {
            if self
                .failing_moves
                .lock()
                .expect("lock")
                .contains(provider_message_id)
            {
                return Err(ProviderError::Transport("move failed".to_owned()));
            }
            self.moves
                .lock()
                .expect("lock")
                .push((provider_message_id.to_owned(), target_folder.to_owned()));
            Ok(())
        }

        async fn delete_message(
            &self,
            _account: &Account,
            provider_message_id: &str,
        ) -> ProviderResult<()> {
            if let Some(err) = self.delete_error.lock().expect("lock").clone() {
                return Err(err);
            }
            self.deletes
                .lock()
                .expect("lock")
                .push(provider_message_id.to_owned());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::{ProviderError, classify_status, render_message};
    use crate::errors::AppError;
    use crate::models::{AttachmentPayload, OutboundMessage};

    #[test]
    fn status_codes_map_to_error_kinds() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "expired"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ProviderError::Transport(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            ProviderError::Transport(_)
        ));
        let rejected = classify_status(StatusCode::BAD_REQUEST, "invalid recipient");
        assert!(!rejected.is_retryable());
        assert!(rejected.to_string().contains("invalid recipient"));
    }

    #[test]
    fn provider_errors_translate_into_app_errors() {
        assert!(matches!(
            AppError::from(ProviderError::Auth("x".to_owned())),
            AppError::ProviderAuth(_)
        ));
        assert!(matches!(
            AppError::from(ProviderError::Rejected("x".to_owned())),
            AppError::ProviderRejected(_)
        ));
    }

    #[test]
    fn renders_multipart_message_with_attachment() {
        let outbound = OutboundMessage {
            from: "me@example.com".to_owned(),
            to: vec!["you@example.com".to_owned()],
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: "Report".to_owned(),
            body_text: Some("see attached".to_owned()),
            body_html: Some("<p>see attached</p>".to_owned()),
            in_reply_to: Some("<parent@example.com>".to_owned()),
        };
        let attachment = AttachmentPayload {
            filename: "r.txt".to_owned(),
            content_type: "text/plain".to_owned(),
            data: b"numbers".to_vec(),
            is_inline: false,
            content_id: None,
        };
        let rendered = render_message(&outbound, &[attachment]).expect("render");
        assert!(rendered.message_id.ends_with("@example.com>"));
        let raw = String::from_utf8(rendered.message.formatted()).expect("utf8");
        assert!(raw.contains("Subject: Report"));
        assert!(raw.contains("In-Reply-To: <parent@example.com>"));
        assert!(raw.contains("r.txt"));
    }

    #[test]
    fn invalid_recipient_is_rejected_not_retried() {
        let outbound = OutboundMessage {
            from: "me@example.com".to_owned(),
            to: vec!["not an address".to_owned()],
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: "x".to_owned(),
            body_text: None,
            body_html: None,
            in_reply_to: None,
        };
        match render_message(&outbound, &[]) {
            Err(ProviderError::Rejected(msg)) => assert!(msg.contains("to")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("render must fail"),
        }
    }
}
