//! Provider message ids for IMAP-backed accounts
//!
//! IMAP has no global message id, so the adapter encodes mailbox,
//! UIDVALIDITY and UID into a stable string. The owning account is already
//! part of the dedup key and is not repeated here. Mailbox names may contain
//! colons, which are preserved during parsing.

use crate::errors::{AppError, AppResult};

/// Stable IMAP message locator
///
/// # Format
///
/// `imap:{mailbox}:{uidvalidity}:{uid}`
///
/// ```text
/// imap:INBOX:12345:42
/// imap:Projects:2026:Q1:999:7
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapMessageId {
    pub mailbox: String,
    pub uidvalidity: u32,
    pub uid: u32,
}

impl ImapMessageId {
    pub fn new(mailbox: impl Into<String>, uidvalidity: u32, uid: u32) -> Self {
        Self {
            mailbox: mailbox.into(),
            uidvalidity,
            uid,
        }
    }

    /// Parse an encoded id.
    ///
    /// Fails when the prefix is not `imap`, when fewer than 4 segments are
    /// present, when UID or UIDVALIDITY are not integers, or when the mailbox
    /// segment is empty.
    pub fn parse(raw: &str) -> AppResult<Self> {
        let mut parts: Vec<&str> = raw.split(':').collect();
        if parts.len() < 4 {
            return Err(AppError::invalid(
                "imap message id must have at least 4 segments",
            ));
        }
        if parts[0] != "imap" {
            return Err(AppError::invalid("imap message id must start with 'imap'"));
        }

        let uid = parts
            .pop()
            .ok_or_else(|| AppError::invalid("missing uid"))?
            .parse::<u32>()
            .map_err(|_| AppError::invalid("invalid uid in imap message id"))?;
        let uidvalidity = parts
            .pop()
            .ok_or_else(|| AppError::invalid("missing uidvalidity"))?
            .parse::<u32>()
            .map_err(|_| AppError::invalid("invalid uidvalidity in imap message id"))?;

        let mailbox = parts[1..].join(":");
        if mailbox.is_empty() {
            return Err(AppError::invalid("imap message id mailbox cannot be empty"));
        }
        Ok(Self::new(mailbox, uidvalidity, uid))
    }

    pub fn encode(&self) -> String {
        format!("imap:{}:{}:{}", self.mailbox, self.uidvalidity, self.uid)
    }
}

/// Resume position inside one mailbox: the snapshot and the highest UID
/// already delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidCursor {
    pub uidvalidity: u32,
    pub last_uid: u32,
}

impl UidCursor {
    pub fn parse(raw: &str) -> AppResult<Self> {
        let (validity, last) = raw
            .split_once(':')
            .ok_or_else(|| AppError::invalid(format!("malformed imap cursor '{raw}'")))?;
        let uidvalidity = validity
            .parse()
            .map_err(|_| AppError::invalid(format!("malformed imap cursor '{raw}'")))?;
        let last_uid = last
            .parse()
            .map_err(|_| AppError::invalid(format!("malformed imap cursor '{raw}'")))?;
        Ok(Self {
            uidvalidity,
            last_uid,
        })
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.uidvalidity, self.last_uid)
    }
}
