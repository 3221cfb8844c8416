//! RFC822 parsing and body normalization
//!
//! Parses raw messages with `mailparse`, extracts the first text/plain and
//! text/html bodies, and collects attachment bytes. HTML is sanitized with
//! `ammonia`; when a message has only HTML, a plain-text rendition is derived
//! with `html2text` so search over `body_text` still works.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};

use crate::errors::{AppError, AppResult};
use crate::models::{AttachmentPayload, CanonicalMessage, INBOX_FOLDER};

/// Line width used when rendering HTML to plain text
const TEXT_RENDER_WIDTH: usize = 100;

/// Fields extracted from one RFC822 message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEmail {
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub body_text: Option<String>,
    /// Sanitized HTML body
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentPayload>,
}

impl ParsedEmail {
    /// Thread root: first `References` entry, else `In-Reply-To`, else self.
    pub fn thread_root(&self) -> Option<String> {
        self.references
            .first()
            .cloned()
            .or_else(|| self.in_reply_to.clone())
            .or_else(|| self.message_id.clone())
    }

    /// Convert into the canonical shape with inbox defaults. Adapters then
    /// overlay provider flags, folder and labels.
    pub fn into_canonical(
        self,
        provider_message_id: String,
        fallback_received_at: DateTime<Utc>,
    ) -> CanonicalMessage {
        let thread_id = self.thread_root();
        CanonicalMessage {
            provider_message_id,
            subject: self.subject,
            sender: self.sender.unwrap_or_default(),
            recipients: self.to,
            cc: self.cc,
            bcc: self.bcc,
            body_text: self.body_text,
            body_html: self.body_html,
            received_at: self.date.unwrap_or(fallback_received_at),
            is_read: false,
            is_starred: false,
            folder: INBOX_FOLDER.to_owned(),
            labels: Vec::new(),
            thread_id,
            in_reply_to: self.in_reply_to,
            priority: 0,
            spam_score: None,
            attachments: self.attachments,
        }
    }
}

/// Parse a raw RFC822 message.
///
/// # Errors
///
/// - `Validation` if `mailparse` cannot parse the message structure
pub fn parse_rfc822(raw: &[u8]) -> AppResult<ParsedEmail> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::invalid(format!("failed to parse RFC822 message: {e}")))?;

    let headers = &parsed.headers;
    let header = |name: &str| {
        headers
            .get_first_value(name)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
    };

    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();
    walk_parts(&parsed, &mut body_text, &mut body_html, &mut attachments)?;

    let body_html = body_html.map(|html| sanitize_html(&html));
    if body_text.is_none() {
        body_text = body_html.as_deref().and_then(html_to_text);
    }

    Ok(ParsedEmail {
        message_id: header("Message-ID"),
        subject: header("Subject"),
        sender: header("From").map(|from| first_address(&from).unwrap_or(from)),
        to: header("To").map(|v| address_list(&v)).unwrap_or_default(),
        cc: header("Cc").map(|v| address_list(&v)).unwrap_or_default(),
        bcc: header("Bcc").map(|v| address_list(&v)).unwrap_or_default(),
        date: header("Date").and_then(|v| parse_date(&v)),
        in_reply_to: header("In-Reply-To"),
        references: header("References")
            .map(|v| v.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default(),
        body_text,
        body_html,
        attachments,
    })
}

/// Walk the MIME tree collecting bodies and attachments
fn walk_parts(
    part: &ParsedMail<'_>,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
    attachments: &mut Vec<AttachmentPayload>,
) -> AppResult<()> {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk_parts(sub, body_text, body_html, attachments)?;
        }
        return Ok(());
    }

    let ctype = part.ctype.mimetype.to_ascii_lowercase();
    let disp = part.get_content_disposition();
    let filename = attachment_filename(part, &disp.params);
    let content_id = part
        .headers
        .get_first_value("Content-ID")
        .map(|v| v.trim().trim_start_matches('<').trim_end_matches('>').to_owned())
        .filter(|v| !v.is_empty());
    let is_inline = disp.disposition == DispositionType::Inline;
    let is_attachment = disp.disposition == DispositionType::Attachment
        || filename.is_some()
        || (content_id.is_some() && !ctype.starts_with("text/"));

    if !is_attachment {
        if ctype == "text/plain"
            && body_text.is_none()
            && let Ok(text) = part.get_body()
        {
            *body_text = Some(text);
        }
        if ctype == "text/html"
            && body_html.is_none()
            && let Ok(html) = part.get_body()
        {
            *body_html = Some(html);
        }
        return Ok(());
    }

    let data = part
        .get_body_raw()
        .map_err(|e| AppError::invalid(format!("failed decoding attachment body: {e}")))?;
    attachments.push(AttachmentPayload {
        filename: filename.unwrap_or_else(|| "attachment".to_owned()),
        content_type: ctype,
        data,
        is_inline: is_inline && content_id.is_some(),
        content_id,
    });
    Ok(())
}

/// Attachment filename from Content-Disposition, falling back to the
/// Content-Type `name` parameter
fn attachment_filename(
    part: &ParsedMail<'_>,
    disp_params: &BTreeMap<String, String>,
) -> Option<String> {
    disp_params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}

/// Bare addresses from an address-list header value.
pub fn address_list(raw: &str) -> Vec<String> {
    match mailparse::addrparse(raw) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(info) => vec![info.addr.clone()],
                MailAddr::Group(group) => group.addrs.iter().map(|i| i.addr.clone()).collect(),
            })
            .filter(|addr| !addr.is_empty())
            .collect(),
        Err(_) => raw
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect(),
    }
}

fn first_address(raw: &str) -> Option<String> {
    address_list(raw).into_iter().next()
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let secs = mailparse::dateparse(raw).ok()?;
    DateTime::from_timestamp(secs, 0)
}

/// Strip active content from an HTML body.
pub fn sanitize_html(html: &str) -> String {
    ammonia::clean(html)
}

/// Render HTML to plain text; `None` when nothing readable remains.
pub fn html_to_text(html: &str) -> Option<String> {
    html2text::from_read(html.as_bytes(), TEXT_RENDER_WIDTH)
        .ok()
        .map(|text| text.trim().to_owned())
        .filter(|text| !text.is_empty())
}

/// Truncate string to maximum characters (Unicode-aware)
pub fn truncate_chars(input: String, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}
