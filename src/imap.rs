//! IMAP transport and session operations
//!
//! Timeout-bounded wrappers around `async-imap`. Every connection uses TLS.
//! Failures are classified into [`ProviderError`]: timeouts and socket
//! failures are transport errors, rejected logins are auth errors and
//! missing mailboxes or messages are permanent rejections.

use std::sync::Arc;
use std::time::Duration;

use async_imap::types::{Fetch, Flag};
use async_imap::{Client, Session};
use futures::TryStreamExt;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::provider::{ProviderError, ProviderResult};

/// Authenticated IMAP session over TLS
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// Fetch items requested for sync; `BODY.PEEK` leaves `\Seen` untouched
pub const SYNC_FETCH_QUERY: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[])";

/// Where and as whom to log in
#[derive(Debug, Clone)]
pub struct ImapEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: SecretString,
}

fn timed_out(what: &str) -> ProviderError {
    ProviderError::Transport(format!("{what} timed out"))
}

/// Connect, complete the TLS handshake, read the greeting and LOGIN.
///
/// # Errors
///
/// - `Transport` for TCP/TLS failures and timeouts of any phase
/// - `Auth` when the server rejects the credentials
/// - `Rejected` when the host is not a valid TLS server name
pub async fn connect_authenticated(
    endpoint: &ImapEndpoint,
    limit: Duration,
) -> ProviderResult<ImapSession> {
    let tcp = timeout(
        limit,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| timed_out("tcp connect"))
    .and_then(|r| r.map_err(|e| ProviderError::Transport(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(endpoint.host.clone())
        .map_err(|_| ProviderError::Rejected("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(limit, connector.connect(server_name, tcp))
        .await
        .map_err(|_| timed_out("TLS handshake"))
        .and_then(|r| r.map_err(|e| ProviderError::Transport(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(limit, client.read_response())
        .await
        .map_err(|_| timed_out("IMAP greeting"))
        .and_then(|r| {
            r.map_err(|e| ProviderError::Transport(format!("IMAP greeting failed: {e}")))
        })?;
    if greeting.is_none() {
        return Err(ProviderError::Transport(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    let pass = endpoint.pass.expose_secret();
    timeout(limit, client.login(endpoint.user.as_str(), pass))
        .await
        .map_err(|_| timed_out("IMAP login"))
        .and_then(|r| r.map_err(|(e, _)| ProviderError::Auth(format!("IMAP login failed: {e}"))))
}

/// Best-effort LOGOUT; the connection is dropped either way.
pub async fn logout(session: &mut ImapSession, limit: Duration) {
    let _ = timeout(limit, session.logout()).await;
}

/// Query server capabilities, used to detect `MOVE` support.
pub async fn supports_move(session: &mut ImapSession, limit: Duration) -> ProviderResult<bool> {
    let caps = timeout(limit, session.capabilities())
        .await
        .map_err(|_| timed_out("CAPABILITY"))
        .and_then(|r| r.map_err(|e| ProviderError::Transport(format!("CAPABILITY failed: {e}"))))?;
    Ok(caps.has_str("MOVE"))
}

/// Names of all visible mailboxes
pub async fn list_mailbox_names(
    session: &mut ImapSession,
    limit: Duration,
) -> ProviderResult<Vec<String>> {
    let stream = timeout(limit, session.list(None, Some("*")))
        .await
        .map_err(|_| timed_out("LIST"))
        .and_then(|r| r.map_err(|e| ProviderError::Transport(format!("LIST failed: {e}"))))?;
    let names: Vec<async_imap::types::Name> = timeout(limit, stream.try_collect())
        .await
        .map_err(|_| timed_out("LIST stream"))
        .and_then(|r| r.map_err(|e| ProviderError::Transport(format!("LIST stream failed: {e}"))))?;
    Ok(names.iter().map(|n| n.name().to_owned()).collect())
}

/// Select a mailbox read-write and return its UIDVALIDITY.
pub async fn select_mailbox(
    session: &mut ImapSession,
    mailbox: &str,
    limit: Duration,
) -> ProviderResult<u32> {
    let selected = timeout(limit, session.select(mailbox))
        .await
        .map_err(|_| timed_out(&format!("SELECT '{mailbox}'")))
        .and_then(|r| {
            r.map_err(|e| ProviderError::Rejected(format!("cannot select mailbox '{mailbox}': {e}")))
        })?;
    selected
        .uid_validity
        .ok_or_else(|| ProviderError::Transport("mailbox missing UIDVALIDITY".to_owned()))
}

/// Run `UID SEARCH`; UIDs are returned ascending (oldest first).
pub async fn uid_search(
    session: &mut ImapSession,
    query: &str,
    limit: Duration,
) -> ProviderResult<Vec<u32>> {
    let set = timeout(limit, session.uid_search(query))
        .await
        .map_err(|_| timed_out("UID SEARCH"))
        .and_then(|r| r.map_err(|e| ProviderError::Transport(format!("uid search failed: {e}"))))?;
    let mut uids: Vec<u32> = set.into_iter().collect();
    uids.sort_unstable();
    Ok(uids)
}

/// `UID FETCH` a set of messages with the given item query.
pub async fn uid_fetch(
    session: &mut ImapSession,
    uids: &[u32],
    query: &str,
    limit: Duration,
) -> ProviderResult<Vec<Fetch>> {
    if uids.is_empty() {
        return Ok(Vec::new());
    }
    let stream = timeout(limit, session.uid_fetch(uid_set(uids), query))
        .await
        .map_err(|_| timed_out("UID FETCH"))
        .and_then(|r| r.map_err(|e| ProviderError::Transport(format!("uid fetch failed: {e}"))))?;
    timeout(limit, stream.try_collect())
        .await
        .map_err(|_| timed_out("UID FETCH stream"))
        .and_then(|r| {
            r.map_err(|e| ProviderError::Transport(format!("uid fetch stream failed: {e}")))
        })
}

/// Run `UID STORE`, e.g. `+FLAGS.SILENT (\Deleted)`.
pub async fn uid_store(
    session: &mut ImapSession,
    uid: u32,
    query: &str,
    limit: Duration,
) -> ProviderResult<()> {
    let stream = timeout(limit, session.uid_store(uid.to_string(), query))
        .await
        .map_err(|_| timed_out("UID STORE"))
        .and_then(|r| r.map_err(|e| ProviderError::Transport(format!("uid store failed: {e}"))))?;
    let _: Vec<Fetch> = timeout(limit, stream.try_collect())
        .await
        .map_err(|_| timed_out("UID STORE stream"))
        .and_then(|r| {
            r.map_err(|e| ProviderError::Transport(format!("uid store stream failed: {e}")))
        })?;
    Ok(())
}

pub async fn uid_copy(
    session: &mut ImapSession,
    uid: u32,
    mailbox: &str,
    limit: Duration,
) -> ProviderResult<()> {
    timeout(limit, session.uid_copy(uid.to_string(), mailbox))
        .await
        .map_err(|_| timed_out("UID COPY"))
        .and_then(|r| r.map_err(|e| ProviderError::Rejected(format!("UID COPY failed: {e}"))))
}

/// `UID MOVE` (RFC 6851)
pub async fn uid_move(
    session: &mut ImapSession,
    uid: u32,
    mailbox: &str,
    limit: Duration,
) -> ProviderResult<()> {
    timeout(limit, session.uid_mv(uid.to_string(), mailbox))
        .await
        .map_err(|_| timed_out("UID MOVE"))
        .and_then(|r| r.map_err(|e| ProviderError::Rejected(format!("UID MOVE failed: {e}"))))
}

/// Expunge one message already marked `\Deleted`, returning how many
/// messages the server reported as removed.
pub async fn uid_expunge(session: &mut ImapSession, uid: u32, limit: Duration) -> ProviderResult<usize> {
    let stream = timeout(limit, session.uid_expunge(uid.to_string()))
        .await
        .map_err(|_| timed_out("UID EXPUNGE"))
        .and_then(|r| r.map_err(|e| ProviderError::Transport(format!("UID EXPUNGE failed: {e}"))))?;
    let expunged: Vec<u32> = timeout(limit, stream.try_collect())
        .await
        .map_err(|_| timed_out("UID EXPUNGE stream"))
        .and_then(|r| {
            r.map_err(|e| ProviderError::Transport(format!("UID EXPUNGE stream failed: {e}")))
        })?;
    Ok(expunged.len())
}

/// Whether `uid` is present in the selected mailbox. Commands on a missing
/// UID succeed without touching anything, so callers check first.
pub async fn uid_exists(session: &mut ImapSession, uid: u32, limit: Duration) -> ProviderResult<bool> {
    let found = uid_search(session, &format!("UID {uid}"), limit).await?;
    Ok(found.contains(&uid))
}

/// `\Seen` and `\Flagged` state of a fetched message
pub fn seen_and_flagged(fetch: &Fetch) -> (bool, bool) {
    let mut seen = false;
    let mut flagged = false;
    for flag in fetch.flags() {
        match flag {
            Flag::Seen => seen = true,
            Flag::Flagged => flagged = true,
            _ => {}
        }
    }
    (seen, flagged)
}

/// Comma-separated UID set for FETCH
pub fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
