//! Raw IMAP (fetch, move, delete) plus SMTP (send) adapter
//!
//! Only the INBOX is synced. The resume cursor is `uidvalidity:last_uid`, so a
//! page boundary is always a UID and a crash loses at most the in-flight page.
//! A UIDVALIDITY change restarts from the first UID; dedup makes the refetch
//! harmless. The account's access credential slot holds the app password and
//! the login user is the account address.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use secrecy::{ExposeSecret, SecretString};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{FetchRequest, FetchedPage, ProviderAdapter, ProviderError, ProviderResult};
use crate::imap::{self, ImapEndpoint, ImapSession, SYNC_FETCH_QUERY};
use crate::message_id::{ImapMessageId, UidCursor};
use crate::mime::parse_rfc822;
use crate::models::{
    Account, AttachmentPayload, CanonicalMessage, INBOX_FOLDER, OutboundMessage, ProviderKind,
};

pub const DEFAULT_IMAP_PORT: u16 = 993;
pub const DEFAULT_SMTP_PORT: u16 = 465;
/// Mailbox synced for IMAP accounts
pub const SYNC_MAILBOX: &str = "INBOX";

/// Prefix of ids assigned to messages sent over SMTP
const SMTP_ID_PREFIX: &str = "smtp:";

/// SMTP reply codes meaning the credential was refused
const SMTP_AUTH_CODES: [&str; 3] = ["530", "534", "535"];

/// Server mailbox names tried, in order, for each canonical folder
fn mailbox_candidates(folder: &str) -> Vec<String> {
    let known: &[&str] = match folder {
        "inbox" => &["INBOX"],
        "trash" => &["Trash", "Deleted Items", "Deleted Messages", "[Gmail]/Trash"],
        "sent" => &["Sent", "Sent Items", "Sent Messages", "[Gmail]/Sent Mail"],
        "spam" | "junk" => &["Junk", "Spam", "Junk Email", "[Gmail]/Spam"],
        "archive" => &["Archive", "[Gmail]/All Mail"],
        "drafts" => &["Drafts", "[Gmail]/Drafts"],
        _ => &[],
    };
    if known.is_empty() {
        return vec![utf7_imap::encode_utf7_imap(folder.to_owned())];
    }
    known.iter().map(|name| (*name).to_owned()).collect()
}

/// IMAP + SMTP adapter
#[derive(Debug, Clone)]
pub struct ImapSmtpAdapter {
    timeout: Duration,
}

impl ImapSmtpAdapter {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn password(account: &Account) -> ProviderResult<SecretString> {
        account
            .access_token
            .clone()
            .filter(|p| !p.expose_secret().is_empty())
            .ok_or_else(|| ProviderError::Auth(format!("account {} has no password", account.id)))
    }

    fn endpoint(account: &Account) -> ProviderResult<ImapEndpoint> {
        let host = account.imap_host.clone().ok_or_else(|| {
            ProviderError::Rejected(format!("account {} has no IMAP host", account.id))
        })?;
        Ok(ImapEndpoint {
            host,
            port: account.imap_port.unwrap_or(DEFAULT_IMAP_PORT),
            user: account.address.clone(),
            pass: Self::password(account)?,
        })
    }

    async fn connect(&self, account: &Account) -> ProviderResult<ImapSession> {
        let endpoint = Self::endpoint(account)?;
        imap::connect_authenticated(&endpoint, self.timeout).await
    }

    /// Select the message's mailbox, rejecting ids from an old UIDVALIDITY
    /// and UIDs that are no longer in it (for example after a move).
    async fn select_for(
        &self,
        session: &mut ImapSession,
        id: &ImapMessageId,
    ) -> ProviderResult<()> {
        let uidvalidity = imap::select_mailbox(session, &id.mailbox, self.timeout).await?;
        if uidvalidity != id.uidvalidity {
            return Err(ProviderError::Rejected(format!(
                "mailbox '{}' was rebuilt; message uid {} no longer valid",
                id.mailbox, id.uid
            )));
        }
        let present = imap::uid_exists(session, id.uid, self.timeout).await?;
        ensure_present(id, present)
    }

    async fn resolve_mailbox(
        &self,
        session: &mut ImapSession,
        folder: &str,
    ) -> ProviderResult<String> {
        let candidates = mailbox_candidates(folder);
        let existing = imap::list_mailbox_names(session, self.timeout).await?;
        for candidate in &candidates {
            if let Some(found) = existing
                .iter()
                .find(|name| name.eq_ignore_ascii_case(candidate))
            {
                return Ok(found.clone());
            }
        }
        Err(ProviderError::Rejected(format!(
            "no mailbox for folder '{folder}' (tried {})",
            candidates.join(", ")
        )))
    }

    async fn fetch_inbox_page(
        &self,
        session: &mut ImapSession,
        request: &FetchRequest,
    ) -> ProviderResult<FetchedPage> {
        let uidvalidity = imap::select_mailbox(session, SYNC_MAILBOX, self.timeout).await?;
        let resume_from = match request.cursor.as_deref().map(UidCursor::parse) {
            Some(Ok(cursor)) if cursor.uidvalidity == uidvalidity => cursor.last_uid,
            Some(Ok(_)) => {
                warn!(uidvalidity, "UIDVALIDITY changed; restarting mailbox scan");
                0
            }
            Some(Err(e)) => return Err(ProviderError::Rejected(e.to_string())),
            None => 0,
        };

        let mut query = format!("UID {}:*", resume_from.saturating_add(1));
        if let Some(since) = request.since {
            query.push_str(&format!(" SINCE {}", since.format("%d-%b-%Y")));
        }
        // `n:*` always matches the highest UID, even below `n`.
        let uids = imap::uid_search(session, &query, self.timeout)
            .await?
            .into_iter()
            .filter(|uid| *uid > resume_from)
            .collect::<Vec<_>>();

        let page_size = usize::try_from(request.page_size.max(1)).unwrap_or(usize::MAX);
        let page = &uids[..uids.len().min(page_size)];
        let Some(&last_uid) = page.last() else {
            return Ok(FetchedPage::default());
        };

        let mut fetches = imap::uid_fetch(session, page, SYNC_FETCH_QUERY, self.timeout).await?;
        fetches.sort_by_key(|f| f.uid);

        let mut messages = Vec::with_capacity(fetches.len());
        for fetch in &fetches {
            let Some(uid) = fetch.uid else { continue };
            let Some(raw) = fetch.body() else {
                warn!(uid, "fetched message has no body; skipping");
                continue;
            };
            let parsed = match parse_rfc822(raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(uid, error = %e, "unparseable message; skipping");
                    continue;
                }
            };
            let id = ImapMessageId::new(SYNC_MAILBOX, uidvalidity, uid);
            let mut message = parsed.into_canonical(id.encode(), Utc::now());
            // INTERNALDATE is the server's arrival time, which SINCE filters on.
            if let Some(arrived) = fetch.internal_date() {
                message.received_at = arrived.with_timezone(&Utc);
            }
            apply_flags(&mut message, imap::seen_and_flagged(fetch));
            messages.push(message);
        }

        let next_cursor = (uids.len() > page.len()).then(|| {
            UidCursor {
                uidvalidity,
                last_uid,
            }
            .encode()
        });
        Ok(FetchedPage {
            messages,
            next_cursor,
        })
    }

    async fn move_uid(
        &self,
        session: &mut ImapSession,
        id: &ImapMessageId,
        target_folder: &str,
    ) -> ProviderResult<()> {
        self.select_for(session, id).await?;
        let target = self.resolve_mailbox(session, target_folder).await?;
        if target == id.mailbox {
            return Ok(());
        }
        if imap::supports_move(session, self.timeout).await? {
            return imap::uid_move(session, id.uid, &target, self.timeout).await;
        }
        imap::uid_copy(session, id.uid, &target, self.timeout).await?;
        imap::uid_store(session, id.uid, "+FLAGS.SILENT (\\Deleted)", self.timeout).await?;
        let expunged = imap::uid_expunge(session, id.uid, self.timeout).await?;
        ensure_expunged(id, expunged)
    }

    async fn delete_uid(&self, session: &mut ImapSession, id: &ImapMessageId) -> ProviderResult<()> {
        self.select_for(session, id).await?;
        imap::uid_store(session, id.uid, "+FLAGS.SILENT (\\Deleted)", self.timeout).await?;
        let expunged = imap::uid_expunge(session, id.uid, self.timeout).await?;
        ensure_expunged(id, expunged)
    }
}

fn ensure_present(id: &ImapMessageId, present: bool) -> ProviderResult<()> {
    if present {
        return Ok(());
    }
    Err(ProviderError::Rejected(format!(
        "message uid {} is no longer in mailbox '{}'",
        id.uid, id.mailbox
    )))
}

fn ensure_expunged(id: &ImapMessageId, expunged: usize) -> ProviderResult<()> {
    if expunged > 0 {
        return Ok(());
    }
    Err(ProviderError::Rejected(format!(
        "server expunged nothing for uid {} in mailbox '{}'",
        id.uid, id.mailbox
    )))
}

fn apply_flags(message: &mut CanonicalMessage, (seen, flagged): (bool, bool)) {
    message.is_read = seen;
    message.is_starred = flagged;
    message.folder = INBOX_FOLDER.to_owned();
}

/// Messages dispatched over SMTP have no IMAP copy to act on.
fn is_smtp_only(provider_message_id: &str) -> bool {
    provider_message_id.starts_with(SMTP_ID_PREFIX)
}

fn parse_id(provider_message_id: &str) -> ProviderResult<ImapMessageId> {
    ImapMessageId::parse(provider_message_id).map_err(|e| ProviderError::Rejected(e.to_string()))
}

/// Classify an SMTP failure by reply code.
fn smtp_error(err: &lettre::transport::smtp::Error) -> ProviderError {
    let code = err.status().map(|c| c.to_string());
    if let Some(code) = &code
        && SMTP_AUTH_CODES.contains(&code.as_str())
    {
        return ProviderError::Auth(format!("SMTP authentication failed: {err}"));
    }
    if err.is_permanent() {
        return ProviderError::Rejected(format!("SMTP rejected message: {err}"));
    }
    ProviderError::Transport(format!("SMTP send failed: {err}"))
}

#[async_trait]
impl ProviderAdapter for ImapSmtpAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Imap
    }

    async fn send(
        &self,
        account: &Account,
        message: &OutboundMessage,
        attachments: &[AttachmentPayload],
    ) -> ProviderResult<String> {
        let host = account.smtp_host.clone().ok_or_else(|| {
            ProviderError::Rejected(format!("account {} has no SMTP host", account.id))
        })?;
        let port = account.smtp_port.unwrap_or(DEFAULT_SMTP_PORT);
        let password = Self::password(account)?;
        let rendered = super::render_message(message, attachments)?;

        // 465 is implicit TLS; anything else upgrades with STARTTLS.
        let relay = if port == DEFAULT_SMTP_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&host)
        };
        let builder = relay
            .map_err(|e| ProviderError::Transport(format!("SMTP relay setup failed: {e}")))?;
        let transport = builder
            .port(port)
            .timeout(Some(self.timeout))
            .credentials(Credentials::new(
                account.address.clone(),
                password.expose_secret().to_owned(),
            ))
            .build();

        timeout(self.timeout, transport.send(rendered.message))
            .await
            .map_err(|_| ProviderError::Transport("SMTP send timed out".to_owned()))?
            .map_err(|e| smtp_error(&e))?;

        debug!(account_id = account.id, host = %host, "message sent over SMTP");
        Ok(format!("{SMTP_ID_PREFIX}{}", rendered.message_id))
    }

    async fn fetch_page(
        &self,
        account: &Account,
        request: &FetchRequest,
    ) -> ProviderResult<FetchedPage> {
        let mut session = self.connect(account).await?;
        let result = self.fetch_inbox_page(&mut session, request).await;
        imap::logout(&mut session, self.timeout).await;
        result
    }

    async fn move_message(
        &self,
        account: &Account,
        provider_message_id: &str,
        target_folder: &str,
    ) -> ProviderResult<()> {
        if is_smtp_only(provider_message_id) {
            return Ok(());
        }
        let id = parse_id(provider_message_id)?;
        let mut session = self.connect(account).await?;
        let result = self.move_uid(&mut session, &id, target_folder).await;
        imap::logout(&mut session, self.timeout).await;
        result
    }

    async fn delete_message(
        &self,
        account: &Account,
        provider_message_id: &str,
    ) -> ProviderResult<()> {
        if is_smtp_only(provider_message_id) {
            return Ok(());
        }
        let id = parse_id(provider_message_id)?;
        let mut session = self.connect(account).await?;
        let result = self.delete_uid(&mut session, &id).await;
        imap::logout(&mut session, self.timeout).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::{ensure_expunged, ensure_present, is_smtp_only, mailbox_candidates, parse_id};
    use crate::provider::ProviderError;

    #[test]
    fn canonical_folders_map_to_common_mailbox_names() {
        assert_eq!(mailbox_candidates("inbox"), vec!["INBOX"]);
        assert!(mailbox_candidates("trash").contains(&"Deleted Items".to_owned()));
        assert_eq!(mailbox_candidates("Projects"), vec!["Projects"]);
        assert_eq!(mailbox_candidates("Entwürfe"), vec!["Entw&APw-rfe"]);
    }

    #[test]
    fn foreign_provider_ids_are_rejected() {
        assert!(matches!(
            parse_id("smtp:<abc@example.com>"),
            Err(ProviderError::Rejected(_))
        ));
        assert_eq!(parse_id("imap:INBOX:5:9").expect("parse").uid, 9);
        assert!(is_smtp_only("smtp:<abc@example.com>"));
        assert!(!is_smtp_only("imap:INBOX:5:9"));
    }

    #[test]
    fn moved_away_uid_is_rejected_instead_of_silently_succeeding() {
        let id = parse_id("imap:INBOX:5:9").expect("parse");
        assert!(ensure_present(&id, true).is_ok());
        match ensure_present(&id, false) {
            Err(ProviderError::Rejected(msg)) => assert!(msg.contains("uid 9")),
            other => panic!("unexpected result: {other:?}"),
        }

        assert!(ensure_expunged(&id, 1).is_ok());
        assert!(matches!(ensure_expunged(&id, 0), Err(ProviderError::Rejected(_))));
    }
}
