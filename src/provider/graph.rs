//! Microsoft Graph mail adapter (Outlook / Microsoft 365)
//!
//! Messages are listed newest first from `/me/messages`; the cursor is the
//! opaque `@odata.nextLink`. All requests ask for immutable ids so a message
//! keeps its provider id across folder moves. Folder display names are
//! normalized to the canonical folder vocabulary.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    FetchRequest, FetchedPage, ProviderAdapter, ProviderError, ProviderResult, bearer_token,
    check_response, transport_error,
};
use crate::mime::{html_to_text, sanitize_html};
use crate::models::{
    Account, AttachmentPayload, CanonicalMessage, INBOX_FOLDER, OutboundMessage, ProviderKind,
};

pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Graph's sendMail returns no id; sent messages get a local one
const SENT_ID_PREFIX: &str = "graph-sent:";

const IMMUTABLE_ID_PREFERENCE: &str = "IdType=\"ImmutableId\"";

const MESSAGE_SELECT_FIELDS: &str = concat!(
    "id,subject,from,toRecipients,ccRecipients,bccRecipients,receivedDateTime,",
    "body,importance,isRead,hasAttachments,conversationId,categories,flag,parentFolderId"
);

fn normalize_folder_label(display_name: &str) -> String {
    match display_name.trim().to_lowercase().as_str() {
        "inbox" => "inbox",
        "sent items" => "sent",
        "archive" => "archive",
        "drafts" => "drafts",
        "deleted items" => "trash",
        "junk email" => "spam",
        "outbox" => "outbox",
        other => return other.to_owned(),
    }
    .to_owned()
}

/// Well-known folder name accepted by `/move` for a canonical folder
fn well_known_folder(folder: &str) -> Option<&'static str> {
    match folder {
        "inbox" => Some("inbox"),
        "trash" => Some("deleteditems"),
        "spam" | "junk" => Some("junkemail"),
        "archive" => Some("archive"),
        "drafts" => Some("drafts"),
        "sent" => Some("sentitems"),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct MessagesPage {
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphMessage {
    id: String,
    subject: Option<String>,
    from: Option<Recipient>,
    #[serde(rename = "toRecipients", default)]
    to_recipients: Vec<Recipient>,
    #[serde(rename = "ccRecipients", default)]
    cc_recipients: Vec<Recipient>,
    #[serde(rename = "bccRecipients", default)]
    bcc_recipients: Vec<Recipient>,
    body: Option<Body>,
    importance: Option<String>,
    #[serde(rename = "isRead", default)]
    is_read: bool,
    #[serde(rename = "hasAttachments", default)]
    has_attachments: bool,
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
    #[serde(default)]
    categories: Vec<String>,
    flag: Option<Flag>,
    #[serde(rename = "receivedDateTime")]
    received_date_time: Option<DateTime<Utc>>,
    #[serde(rename = "parentFolderId")]
    parent_folder_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Recipient {
    #[serde(rename = "emailAddress")]
    email_address: Option<EmailAddress>,
}

impl Recipient {
    fn address(&self) -> Option<String> {
        self.email_address
            .as_ref()
            .and_then(|email| email.address.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
    }
}

#[derive(Debug, Deserialize)]
struct EmailAddress {
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Body {
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Flag {
    #[serde(rename = "flagStatus")]
    flag_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FolderPage {
    value: Vec<MailFolder>,
}

#[derive(Debug, Deserialize)]
struct MailFolder {
    id: String,
    #[serde(rename = "displayName")]
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct AttachmentPage {
    value: Vec<GraphAttachment>,
}

#[derive(Debug, Deserialize)]
struct GraphAttachment {
    #[serde(rename = "@odata.type")]
    odata_type: Option<String>,
    name: Option<String>,
    #[serde(rename = "contentType")]
    content_type: Option<String>,
    #[serde(rename = "isInline", default)]
    is_inline: bool,
    #[serde(rename = "contentId")]
    content_id: Option<String>,
    #[serde(rename = "contentBytes")]
    content_bytes: Option<String>,
}

/// Microsoft Graph adapter
#[derive(Debug, Clone)]
pub struct GraphAdapter {
    http: Client,
    base: String,
}

impl GraphAdapter {
    pub fn new(http: Client, base: String) -> Self {
        Self { http, base }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/me/{path}", self.base.trim_end_matches('/'))
    }

    fn request(&self, method: reqwest::Method, url: &str, token: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(token)
            .header("Prefer", IMMUTABLE_ID_PREFERENCE)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, token: &str, url: &str) -> ProviderResult<T> {
        let response = self
            .request(reqwest::Method::GET, url, token)
            .send()
            .await
            .map_err(transport_error)?;
        check_response(response)
            .await?
            .json::<T>()
            .await
            .map_err(transport_error)
    }

    async fn folders(&self, token: &str) -> ProviderResult<Vec<MailFolder>> {
        let page: FolderPage = self
            .get_json(token, &self.url("mailFolders?$top=100"))
            .await?;
        Ok(page.value)
    }

    async fn attachments(&self, token: &str, message_id: &str) -> ProviderResult<Vec<AttachmentPayload>> {
        let url = self.url(&format!(
            "messages/{}/attachments",
            urlencoding::encode(message_id)
        ));
        let page: AttachmentPage = self.get_json(token, &url).await?;
        Ok(page.value.into_iter().filter_map(file_attachment).collect())
    }

    /// First-page URL; later pages follow `@odata.nextLink`.
    fn first_page_url(&self, request: &FetchRequest) -> String {
        let mut url = self.url(&format!(
            "messages?$select={MESSAGE_SELECT_FIELDS}&$top={}&$orderby=receivedDateTime%20desc",
            request.page_size.max(1)
        ));
        if let Some(since) = request.since {
            let stamp = since.to_rfc3339_opts(SecondsFormat::Secs, true);
            url.push_str(&format!(
                "&$filter={}",
                urlencoding::encode(&format!("receivedDateTime ge {stamp}"))
            ));
        }
        url
    }
}

/// Decode a `fileAttachment`; item and reference attachments carry no bytes.
fn file_attachment(attachment: GraphAttachment) -> Option<AttachmentPayload> {
    if attachment.odata_type.as_deref() != Some("#microsoft.graph.fileAttachment") {
        return None;
    }
    let data = STANDARD.decode(attachment.content_bytes?.as_bytes()).ok()?;
    Some(AttachmentPayload {
        filename: attachment.name.unwrap_or_else(|| "attachment".to_owned()),
        content_type: attachment
            .content_type
            .unwrap_or_else(|| "application/octet-stream".to_owned()),
        data,
        is_inline: attachment.is_inline,
        content_id: attachment.content_id,
    })
}

fn body_fields(body: Option<Body>) -> (Option<String>, Option<String>) {
    let Some(body) = body else {
        return (None, None);
    };
    let Some(content) = body.content.filter(|c| !c.trim().is_empty()) else {
        return (None, None);
    };
    if body
        .content_type
        .as_deref()
        .is_some_and(|kind| kind.eq_ignore_ascii_case("html"))
    {
        let html = sanitize_html(&content);
        return (html_to_text(&html), Some(html));
    }
    (Some(content), None)
}

fn to_canonical(message: GraphMessage, folders: &HashMap<String, String>) -> CanonicalMessage {
    let folder = message
        .parent_folder_id
        .as_ref()
        .and_then(|id| folders.get(id))
        .map(|name| normalize_folder_label(name))
        .unwrap_or_else(|| INBOX_FOLDER.to_owned());
    let (body_text, body_html) = body_fields(message.body);
    let priority = match message.importance.as_deref() {
        Some("high") => 1,
        _ => 0,
    };

    CanonicalMessage {
        provider_message_id: message.id,
        subject: message.subject,
        sender: message
            .from
            .as_ref()
            .and_then(Recipient::address)
            .unwrap_or_default(),
        recipients: message.to_recipients.iter().filter_map(Recipient::address).collect(),
        cc: message.cc_recipients.iter().filter_map(Recipient::address).collect(),
        bcc: message.bcc_recipients.iter().filter_map(Recipient::address).collect(),
        body_text,
        body_html,
        received_at: message.received_date_time.unwrap_or_else(Utc::now),
        is_read: message.is_read,
        is_starred: message
            .flag
            .and_then(|f| f.flag_status)
            .is_some_and(|s| s == "flagged"),
        folder,
        labels: message.categories,
        thread_id: message.conversation_id,
        in_reply_to: None,
        priority,
        spam_score: None,
        attachments: Vec::new(),
    }
}

fn recipients_json(addresses: &[String]) -> Value {
    Value::Array(
        addresses
            .iter()
            .map(|address| json!({ "emailAddress": { "address": address } }))
            .collect(),
    )
}

fn send_payload(message: &OutboundMessage, attachments: &[AttachmentPayload]) -> Value {
    let (content_type, content) = match (&message.body_html, &message.body_text) {
        (Some(html), _) => ("HTML", html.clone()),
        (None, Some(text)) => ("Text", text.clone()),
        (None, None) => ("Text", String::new()),
    };
    let files = attachments
        .iter()
        .map(|a| {
            json!({
                "@odata.type": "#microsoft.graph.fileAttachment",
                "name": a.filename,
                "contentType": a.content_type,
                "contentBytes": STANDARD.encode(&a.data),
                "isInline": a.is_inline,
                "contentId": a.content_id,
            })
        })
        .collect::<Vec<_>>();

    json!({
        "message": {
            "subject": message.subject,
            "body": { "contentType": content_type, "content": content },
            "toRecipients": recipients_json(&message.to),
            "ccRecipients": recipients_json(&message.cc),
            "bccRecipients": recipients_json(&message.bcc),
            "attachments": files,
        },
        "saveToSentItems": true,
    })
}

#[async_trait]
impl ProviderAdapter for GraphAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Outlook
    }

    async fn send(
        &self,
        account: &Account,
        message: &OutboundMessage,
        attachments: &[AttachmentPayload],
    ) -> ProviderResult<String> {
        let token = bearer_token(account)?;
        let response = self
            .request(reqwest::Method::POST, &self.url("sendMail"), token)
            .json(&send_payload(message, attachments))
            .send()
            .await
            .map_err(transport_error)?;
        check_response(response).await?;
        let id = format!("{SENT_ID_PREFIX}{}", Uuid::new_v4());
        debug!(account_id = account.id, provider_id = %id, "message sent via Graph");
        Ok(id)
    }

    async fn fetch_page(
        &self,
        account: &Account,
        request: &FetchRequest,
    ) -> ProviderResult<FetchedPage> {
        let token = bearer_token(account)?;
        let url = match &request.cursor {
            Some(next) if next.starts_with(self.base.trim_end_matches('/')) => next.clone(),
            Some(_) => {
                return Err(ProviderError::Rejected(
                    "Graph cursor does not point at the configured API".to_owned(),
                ));
            }
            None => self.first_page_url(request),
        };

        let page: MessagesPage = self.get_json(token, &url).await?;
        let folders = self
            .folders(token)
            .await?
            .into_iter()
            .map(|f| (f.id, f.display_name))
            .collect::<HashMap<_, _>>();

        let mut messages = Vec::with_capacity(page.value.len());
        for graph_message in page.value {
            let has_attachments = graph_message.has_attachments;
            let mut message = to_canonical(graph_message, &folders);
            if has_attachments {
                match self.attachments(token, &message.provider_message_id).await {
                    Ok(files) => message.attachments = files,
                    Err(ProviderError::Rejected(e)) => {
                        warn!(provider_id = %message.provider_message_id, error = %e, "attachments unavailable");
                    }
                    Err(e) => return Err(e),
                }
            }
            messages.push(message);
        }

        Ok(FetchedPage {
            messages,
            next_cursor: page.next_link,
        })
    }

    async fn move_message(
        &self,
        account: &Account,
        provider_message_id: &str,
        target_folder: &str,
    ) -> ProviderResult<()> {
        if provider_message_id.starts_with(SENT_ID_PREFIX) {
            return Ok(());
        }
        let token = bearer_token(account)?;
        let destination = match well_known_folder(target_folder) {
            Some(name) => name.to_owned(),
            None => self
                .folders(token)
                .await?
                .into_iter()
                .find(|f| f.display_name.eq_ignore_ascii_case(target_folder))
                .map(|f| f.id)
                .ok_or_else(|| {
                    ProviderError::Rejected(format!("no Outlook folder named '{target_folder}'"))
                })?,
        };
        let url = self.url(&format!(
            "messages/{}/move",
            urlencoding::encode(provider_message_id)
        ));
        let response = self
            .request(reqwest::Method::POST, &url, token)
            .json(&json!({ "destinationId": destination }))
            .send()
            .await
            .map_err(transport_error)?;
        check_response(response).await?;
        Ok(())
    }

    async fn delete_message(
        &self,
        account: &Account,
        provider_message_id: &str,
    ) -> ProviderResult<()> {
        if provider_message_id.starts_with(SENT_ID_PREFIX) {
            return Ok(());
        }
        let token = bearer_token(account)?;
        let url = self.url(&format!(
            "messages/{}",
            urlencoding::encode(provider_message_id)
        ));
        let response = self
            .request(reqwest::Method::DELETE, &url, token)
            .send()
            .await
            .map_err(transport_error)?;
        check_response(response).await?;
        Ok(())
    }
}
