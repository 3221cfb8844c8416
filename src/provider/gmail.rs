//! Gmail REST adapter
//!
//! Messages are listed with `users.messages.list` and fetched one by one in
//! `raw` format, so MIME parsing is shared with the IMAP path. Gmail has no
//! folders: the canonical folder is derived from system labels, unread and
//! starred state come from `UNREAD`/`STARRED`, and the remaining user labels
//! become canonical labels. The page token is the sync cursor.

use async_trait::async_trait;
use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{
    FetchRequest, FetchedPage, ProviderAdapter, ProviderError, ProviderResult, bearer_token,
    check_response, render_message, transport_error,
};
use crate::mime::parse_rfc822;
use crate::models::{
    Account, AttachmentPayload, CanonicalMessage, INBOX_FOLDER, OutboundMessage, ProviderKind,
    TRASH_FOLDER,
};

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// Gmail emits unpadded URL-safe base64 but tolerates either on input.
const RAW_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const SYSTEM_LABELS: &[&str] = &[
    "INBOX",
    "SENT",
    "DRAFT",
    "TRASH",
    "SPAM",
    "STARRED",
    "UNREAD",
    "IMPORTANT",
    "CATEGORY_PERSONAL",
    "CATEGORY_SOCIAL",
    "CATEGORY_PROMOTIONS",
    "CATEGORY_UPDATES",
    "CATEGORY_FORUMS",
    "CHAT",
];

/// Labels that act as mutually exclusive locations
const LOCATION_LABELS: &[&str] = &["INBOX", "TRASH", "SPAM"];

#[derive(Debug, Deserialize)]
struct MessageList {
    messages: Option<Vec<MessageStub>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageStub {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
    #[serde(rename = "labelIds", default)]
    label_ids: Vec<String>,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
    raw: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
struct Label {
    id: String,
    name: String,
}

/// Gmail REST API adapter
#[derive(Debug, Clone)]
pub struct GmailAdapter {
    http: Client,
    base: String,
}

impl GmailAdapter {
    pub fn new(http: Client, base: String) -> Self {
        Self { http, base }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{path}", self.base.trim_end_matches('/'))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        token: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> ProviderResult<T> {
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;
        check_response(response)
            .await?
            .json::<T>()
            .await
            .map_err(transport_error)
    }

    async fn post_json(
        &self,
        token: &str,
        url: &str,
        body: &serde_json::Value,
    ) -> ProviderResult<reqwest::Response> {
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        check_response(response).await
    }

    /// Label id for a canonical folder name
    async fn label_for_folder(&self, token: &str, folder: &str) -> ProviderResult<String> {
        if let Some(system) = system_label_for(folder) {
            return Ok(system.to_owned());
        }
        let list: LabelList = self.get_json(token, &self.url("labels"), &[]).await?;
        list.labels
            .into_iter()
            .find(|label| label.name.eq_ignore_ascii_case(folder))
            .map(|label| label.id)
            .ok_or_else(|| ProviderError::Rejected(format!("no Gmail label named '{folder}'")))
    }
}

fn system_label_for(folder: &str) -> Option<&'static str> {
    match folder {
        "inbox" => Some("INBOX"),
        "spam" | "junk" => Some("SPAM"),
        "trash" => Some("TRASH"),
        _ => None,
    }
}

/// Canonical folder implied by a label set
fn folder_for_labels(label_ids: &[String]) -> String {
    let has = |name: &str| label_ids.iter().any(|l| l == name);
    let folder = if has("TRASH") {
        TRASH_FOLDER
    } else if has("SPAM") {
        "spam"
    } else if has("INBOX") {
        INBOX_FOLDER
    } else if has("SENT") {
        "sent"
    } else if has("DRAFT") {
        "drafts"
    } else {
        "archive"
    };
    folder.to_owned()
}

fn user_labels(label_ids: &[String]) -> Vec<String> {
    label_ids
        .iter()
        .filter(|l| !SYSTEM_LABELS.contains(&l.as_str()))
        .cloned()
        .collect()
}

/// Decode and normalize one `format=raw` message
fn to_canonical(message: RawMessage) -> Result<CanonicalMessage, String> {
    let bytes = RAW_ENGINE
        .decode(message.raw.as_bytes())
        .map_err(|e| format!("invalid raw payload: {e}"))?;
    let parsed = parse_rfc822(&bytes).map_err(|e| e.to_string())?;
    let received = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .or(parsed.date)
        .unwrap_or_else(Utc::now);

    let mut canonical = parsed.into_canonical(message.id, received);
    canonical.received_at = received;
    canonical.is_read = !message.label_ids.iter().any(|l| l == "UNREAD");
    canonical.is_starred = message.label_ids.iter().any(|l| l == "STARRED");
    canonical.folder = folder_for_labels(&message.label_ids);
    canonical.labels = user_labels(&message.label_ids);
    if message.thread_id.is_some() {
        canonical.thread_id = message.thread_id;
    }
    Ok(canonical)
}

#[async_trait]
impl ProviderAdapter for GmailAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    async fn send(
        &self,
        account: &Account,
        message: &OutboundMessage,
        attachments: &[AttachmentPayload],
    ) -> ProviderResult<String> {
        let token = bearer_token(account)?;
        let rendered = render_message(message, attachments)?;
        let raw = RAW_ENGINE.encode(rendered.message.formatted());
        let response = self
            .post_json(token, &self.url("messages/send"), &json!({ "raw": raw }))
            .await?;
        let sent: SendResponse = response.json().await.map_err(transport_error)?;
        debug!(account_id = account.id, provider_id = %sent.id, "message sent via Gmail");
        Ok(sent.id)
    }

    async fn fetch_page(
        &self,
        account: &Account,
        request: &FetchRequest,
    ) -> ProviderResult<FetchedPage> {
        let token = bearer_token(account)?;
        let mut query = vec![("maxResults", request.page_size.max(1).to_string())];
        if let Some(since) = request.since {
            query.push(("q", format!("after:{}", since.timestamp())));
        }
        if let Some(cursor) = &request.cursor {
            query.push(("pageToken", cursor.clone()));
        }
        let list: MessageList = self.get_json(token, &self.url("messages"), &query).await?;

        let stubs = list.messages.unwrap_or_default();
        let mut messages = Vec::with_capacity(stubs.len());
        for stub in stubs {
            let url = self.url(&format!("messages/{}", urlencoding::encode(&stub.id)));
            // A message can disappear between the list and the get.
            let raw: RawMessage = match self
                .get_json(token, &url, &[("format", "raw".to_owned())])
                .await
            {
                Ok(raw) => raw,
                Err(ProviderError::Rejected(e)) => {
                    warn!(provider_id = %stub.id, error = %e, "Gmail message unavailable; skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match to_canonical(raw) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(provider_id = %stub.id, error = %e, "skipping Gmail message"),
            }
        }

        Ok(FetchedPage {
            messages,
            next_cursor: list.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn move_message(
        &self,
        account: &Account,
        provider_message_id: &str,
        target_folder: &str,
    ) -> ProviderResult<()> {
        let token = bearer_token(account)?;
        let id = urlencoding::encode(provider_message_id);
        if target_folder == TRASH_FOLDER {
            self.post_json(token, &self.url(&format!("messages/{id}/trash")), &json!({}))
                .await?;
            return Ok(());
        }

        let (add, remove): (Vec<String>, Vec<String>) = if target_folder == "archive" {
            (Vec::new(), LOCATION_LABELS.iter().map(|l| (*l).to_owned()).collect())
        } else {
            let target = self.label_for_folder(token, target_folder).await?;
            let remove = LOCATION_LABELS
                .iter()
                .filter(|l| **l != target)
                .map(|l| (*l).to_owned())
                .collect();
            (vec![target], remove)
        };
        self.post_json(
            token,
            &self.url(&format!("messages/{id}/modify")),
            &json!({ "addLabelIds": add, "removeLabelIds": remove }),
        )
        .await?;
        Ok(())
    }

    async fn delete_message(
        &self,
        account: &Account,
        provider_message_id: &str,
    ) -> ProviderResult<()> {
        let token = bearer_token(account)?;
        let url = self.url(&format!(
            "messages/{}",
            urlencoding::encode(provider_message_id)
        ));
        let response = self
            .http
            .delete(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;
        check_response(response).await?;
        Ok(())
    }
}
