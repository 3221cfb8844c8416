//! Environment-driven configuration
//!
//! Everything is read from `MAILHUB_*` variables. Engine knobs have defaults;
//! linked accounts to seed on startup are discovered by scanning for
//! `MAILHUB_ACCOUNT_<SEGMENT>_ADDRESS` variables.

use std::env;
use std::env::VarError;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use secrecy::SecretString;
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::models::{Account, NewAccount, ProviderKind};
use crate::provider::ProviderSettings;
use crate::provider::imap_smtp::{DEFAULT_IMAP_PORT, DEFAULT_SMTP_PORT};
use crate::rate_limit::{Operation, RateBudget, RateLimits};
use crate::store::Store;
use crate::sync::SyncSettings;

/// Engine knobs passed into [`crate::service::Mailhub::new`]
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Bound on every remote provider call
    pub provider_timeout_ms: u64,
    pub sync_page_size: u32,
    pub sync_max_retries: u32,
    /// First retry delay for transport failures; doubles per attempt
    pub sync_retry_backoff_ms: u64,
    /// Whether an unfiltered listing kicks off background syncs
    pub sync_on_list: bool,
    /// Upper bound for a single attachment and for a draft's total
    pub max_attachment_bytes: u64,
    pub rate_limits: RateLimits,
    pub gmail_api_base: String,
    pub graph_api_base: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let providers = ProviderSettings::default();
        Self {
            provider_timeout_ms: 30_000,
            sync_page_size: 50,
            sync_max_retries: 3,
            sync_retry_backoff_ms: 500,
            sync_on_list: true,
            max_attachment_bytes: 25 * 1024 * 1024,
            rate_limits: RateLimits::default(),
            gmail_api_base: providers.gmail_api_base,
            graph_api_base: providers.graph_api_base,
        }
    }
}

impl EngineConfig {
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            page_size: self.sync_page_size,
            max_retries: self.sync_max_retries,
            retry_backoff: Duration::from_millis(self.sync_retry_backoff_ms),
            max_attachment_bytes: self.max_attachment_bytes,
        }
    }

    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            timeout: Duration::from_millis(self.provider_timeout_ms),
            gmail_api_base: self.gmail_api_base.clone(),
            graph_api_base: self.graph_api_base.clone(),
        }
    }
}

/// A linked account to upsert on startup
#[derive(Debug, Clone)]
pub struct AccountSeed {
    /// Lowercased discovery segment, used only in log lines
    pub segment: String,
    pub provider: ProviderKind,
    pub address: String,
    /// OAuth access token, or the IMAP/SMTP password
    pub secret: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub imap_host: Option<String>,
    pub imap_port: Option<u16>,
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
}

impl AccountSeed {
    pub fn to_new_account(&self, user_id: i64) -> NewAccount {
        NewAccount {
            user_id,
            provider: self.provider,
            address: self.address.clone(),
            access_token: self.secret.clone(),
            refresh_token: self.refresh_token.clone(),
            token_expires_at: self.token_expires_at,
            imap_host: self.imap_host.clone(),
            imap_port: self.imap_port,
            smtp_host: self.smtp_host.clone(),
            smtp_port: self.smtp_port,
        }
    }
}

/// Upsert the configured accounts for `user_id` and deactivate the user's
/// accounts that are no longer configured. Deactivated accounts keep their
/// messages but are neither synced nor used for sending.
pub fn seed_accounts(store: &Store, user_id: i64, seeds: &[AccountSeed]) -> AppResult<Vec<Account>> {
    let mut seeded = Vec::with_capacity(seeds.len());
    for seed in seeds {
        let account = store.upsert_account(&seed.to_new_account(user_id))?;
        info!(
            segment = %seed.segment,
            account_id = account.id,
            provider = account.provider.as_str(),
            "account seeded"
        );
        seeded.push(account);
    }

    for account in store.accounts_for_user(user_id)? {
        let configured = seeded.iter().any(|s| s.id == account.id);
        if account.is_active && !configured && store.deactivate_account(account.id)? {
            info!(account_id = account.id, "account no longer configured; deactivated");
        }
    }
    Ok(seeded)
}

/// Process-wide configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_path: PathBuf,
    pub attachment_dir: PathBuf,
    /// Identity every stdio request runs as
    pub user_id: i64,
    pub engine: EngineConfig,
    pub accounts: Vec<AccountSeed>,
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `Validation` if a variable is malformed or an account segment
    /// is incomplete.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAILHUB_DATABASE_PATH=/var/lib/mailhub/mail.db
    /// MAILHUB_RATE_SEND_LIMIT=50
    /// MAILHUB_ACCOUNT_WORK_ADDRESS=me@company.com
    /// MAILHUB_ACCOUNT_WORK_PROVIDER=outlook
    /// MAILHUB_ACCOUNT_WORK_ACCESS_TOKEN=eyJ0eXAi...
    /// MAILHUB_ACCOUNT_HOME_ADDRESS=me@example.org
    /// MAILHUB_ACCOUNT_HOME_IMAP_HOST=imap.example.org
    /// MAILHUB_ACCOUNT_HOME_SMTP_HOST=smtp.example.org
    /// MAILHUB_ACCOUNT_HOME_PASSWORD=app-password
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let account_pattern = Regex::new(r"^MAILHUB_ACCOUNT_([A-Z0-9_]+)_ADDRESS$")
            .map_err(|e| AppError::Internal(format!("invalid account regex: {e}")))?;

        let mut account_segments: Vec<String> = env::vars()
            .filter_map(|(k, _)| {
                account_pattern
                    .captures(&k)
                    .and_then(|c| c.get(1).map(|m| m.as_str().to_owned()))
            })
            .collect();
        account_segments.sort();
        account_segments.dedup();

        let accounts = account_segments
            .iter()
            .map(|seg| load_account(seg))
            .collect::<AppResult<Vec<_>>>()?;

        let user_id = parse_u64_env("MAILHUB_USER_ID", 1)?;
        let database_path = PathBuf::from(
            optional_env("MAILHUB_DATABASE_PATH")?.unwrap_or_else(|| "mailhub.db".to_owned()),
        );
        let attachment_dir = PathBuf::from(
            optional_env("MAILHUB_ATTACHMENT_DIR")?
                .unwrap_or_else(|| "mailhub-attachments".to_owned()),
        );

        Ok(Self {
            database_path,
            attachment_dir,
            user_id: i64::try_from(user_id)
                .map_err(|_| AppError::invalid("MAILHUB_USER_ID is out of range"))?,
            engine: load_engine()?,
            accounts,
        })
    }
}

fn load_engine() -> AppResult<EngineConfig> {
    let defaults = EngineConfig::default();
    let mut rate_limits = RateLimits::default();
    for operation in Operation::ALL {
        let key = operation.as_str().to_ascii_uppercase();
        let fallback = rate_limits.budget(operation);
        let limit = parse_u32_env(&format!("MAILHUB_RATE_{key}_LIMIT"), fallback.limit)?;
        let window = parse_u64_env(
            &format!("MAILHUB_RATE_{key}_WINDOW_SECS"),
            fallback.window.as_secs(),
        )?;
        rate_limits.set(operation, RateBudget::new(limit, Duration::from_secs(window)));
    }

    Ok(EngineConfig {
        provider_timeout_ms: parse_u64_env("MAILHUB_PROVIDER_TIMEOUT_MS", defaults.provider_timeout_ms)?,
        sync_page_size: parse_u32_env("MAILHUB_SYNC_PAGE_SIZE", defaults.sync_page_size)?,
        sync_max_retries: parse_u32_env("MAILHUB_SYNC_MAX_RETRIES", defaults.sync_max_retries)?,
        sync_retry_backoff_ms: parse_u64_env(
            "MAILHUB_SYNC_RETRY_BACKOFF_MS",
            defaults.sync_retry_backoff_ms,
        )?,
        sync_on_list: parse_bool_env("MAILHUB_SYNC_ON_LIST", defaults.sync_on_list)?,
        max_attachment_bytes: parse_u64_env(
            "MAILHUB_MAX_ATTACHMENT_BYTES",
            defaults.max_attachment_bytes,
        )?,
        rate_limits,
        gmail_api_base: optional_env("MAILHUB_GMAIL_API_BASE")?.unwrap_or(defaults.gmail_api_base),
        graph_api_base: optional_env("MAILHUB_GRAPH_API_BASE")?.unwrap_or(defaults.graph_api_base),
    })
}

/// Load one account seed from `MAILHUB_ACCOUNT_<SEGMENT>_*`.
///
/// The provider defaults to `imap` when `_IMAP_HOST` is set. IMAP accounts
/// need both hosts and a `_PASSWORD`.
fn load_account(segment: &str) -> AppResult<AccountSeed> {
    let prefix = format!("MAILHUB_ACCOUNT_{}_", sanitize_segment(segment));
    let address = required_env(&format!("{prefix}ADDRESS"))?.trim().to_owned();
    let imap_host = optional_env(&format!("{prefix}IMAP_HOST"))?;
    let provider = match optional_env(&format!("{prefix}PROVIDER"))? {
        Some(raw) => ProviderKind::parse(&raw)?,
        None if imap_host.is_some() => ProviderKind::Imap,
        None => {
            return Err(AppError::invalid(format!(
                "missing required environment variable {prefix}PROVIDER"
            )));
        }
    };

    let seed = if provider.uses_oauth() {
        AccountSeed {
            segment: segment.to_ascii_lowercase(),
            provider,
            address,
            secret: Some(required_env(&format!("{prefix}ACCESS_TOKEN"))?.into()),
            refresh_token: optional_env(&format!("{prefix}REFRESH_TOKEN"))?.map(Into::into),
            token_expires_at: optional_env(&format!("{prefix}TOKEN_EXPIRES_AT"))?
                .map(|raw| parse_timestamp(&format!("{prefix}TOKEN_EXPIRES_AT"), &raw))
                .transpose()?,
            imap_host: None,
            imap_port: None,
            smtp_host: None,
            smtp_port: None,
        }
    } else {
        AccountSeed {
            segment: segment.to_ascii_lowercase(),
            provider,
            address,
            secret: Some(required_env(&format!("{prefix}PASSWORD"))?.into()),
            refresh_token: None,
            token_expires_at: None,
            imap_host: Some(match imap_host {
                Some(host) => host,
                None => required_env(&format!("{prefix}IMAP_HOST"))?,
            }),
            imap_port: Some(parse_u16_env(&format!("{prefix}IMAP_PORT"), DEFAULT_IMAP_PORT)?),
            smtp_host: Some(required_env(&format!("{prefix}SMTP_HOST"))?),
            smtp_port: Some(parse_u16_env(&format!("{prefix}SMTP_PORT"), DEFAULT_SMTP_PORT)?),
        }
    };
    Ok(seed)
}

fn parse_timestamp(key: &str, raw: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| AppError::invalid(format!("invalid RFC 3339 timestamp in {key}: '{raw}'")))
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(key: &str) -> AppResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::invalid(format!(
            "missing required environment variable {key}"
        ))),
    }
}

/// Read an optional variable; blank counts as unset.
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v.trim().to_owned())),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::invalid(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Sanitize an account segment to uppercase alphanumeric/underscore
///
/// Non-alphanumeric characters are replaced with underscores, and leading/
/// trailing underscores are trimmed.
fn sanitize_segment(seg: &str) -> String {
    let mut out = String::with_capacity(seg.len());
    for ch in seg.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push('_');
        }
    }
    out.trim_matches('_').to_owned()
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match optional_env(key)? {
        Some(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::invalid(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn parse_number_env<T: std::str::FromStr>(key: &str, default: T, kind: &str) -> AppResult<T> {
    match optional_env(key)? {
        Some(v) => v.parse::<T>().map_err(|_| {
            AppError::invalid(format!("invalid {kind} environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

fn parse_u16_env(key: &str, default: u16) -> AppResult<u16> {
    parse_number_env(key, default, "u16")
}

fn parse_u32_env(key: &str, default: u32) -> AppResult<u32> {
    parse_number_env(key, default, "u32")
}

fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    parse_number_env(key, default, "u64")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{
        AccountSeed, EngineConfig, parse_bool_value, parse_timestamp, sanitize_segment,
        seed_accounts,
    };
    use crate::models::ProviderKind;
    use crate::store::Store;

    fn imap_seed(address: &str) -> AccountSeed {
        AccountSeed {
            segment: "work".to_owned(),
            provider: ProviderKind::Imap,
            address: address.to_owned(),
            secret: Some(secrecy::SecretString::from("pw".to_owned())),
            refresh_token: None,
            token_expires_at: None,
            imap_host: Some("imap.example.com".to_owned()),
            imap_port: Some(993),
            smtp_host: Some("smtp.example.com".to_owned()),
            smtp_port: Some(465),
        }
    }

    #[test]
    fn seeding_deactivates_accounts_dropped_from_config() {
        let store = Store::open_in_memory().expect("store");
        let first = seed_accounts(&store, 1, &[imap_seed("a@example.com"), imap_seed("b@example.com")])
            .expect("first seed");
        assert_eq!(first.len(), 2);

        seed_accounts(&store, 1, &[imap_seed("a@example.com")]).expect("second seed");
        let accounts = store.accounts_for_user(1).expect("accounts");
        let active: Vec<&str> = accounts
            .iter()
            .filter(|a| a.is_active)
            .map(|a| a.address.as_str())
            .collect();
        assert_eq!(active, vec!["a@example.com"]);

        // Re-adding the address reactivates the same row.
        let again = seed_accounts(&store, 1, &[imap_seed("a@example.com"), imap_seed("b@example.com")])
            .expect("third seed");
        assert_eq!(again[1].id, first[1].id);
        assert!(again[1].is_active);
    }

    #[test]
    fn parse_bool_value_accepts_common_truthy_and_falsy_values() {
        for truthy in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert_eq!(parse_bool_value(truthy), Some(true));
        }

        for falsy in ["0", "false", "FALSE", " no ", "N", "off"] {
            assert_eq!(parse_bool_value(falsy), Some(false));
        }
    }

    #[test]
    fn parse_bool_value_rejects_unrecognized_values() {
        for invalid in ["", "2", "maybe", "enabled", "disabled"] {
            assert_eq!(parse_bool_value(invalid), None);
        }
    }

    #[test]
    fn sanitize_segment_uppercases_and_trims() {
        assert_eq!(sanitize_segment("work-mail"), "WORK_MAIL");
        assert_eq!(sanitize_segment("_home_"), "HOME");
    }

    #[test]
    fn timestamps_must_be_rfc3339() {
        let parsed = parse_timestamp("K", "2026-03-01T12:00:00+02:00").expect("parse");
        assert_eq!(parsed.to_rfc3339(), "2026-03-01T10:00:00+00:00");
        assert!(parse_timestamp("K", "tomorrow").is_err());
    }

    #[test]
    fn engine_defaults_feed_sync_and_provider_settings() {
        let config = EngineConfig::default();
        let sync = config.sync_settings();
        assert_eq!(sync.page_size, 50);
        assert_eq!(sync.max_retries, 3);
        assert_eq!(sync.retry_backoff, Duration::from_millis(500));
        assert_eq!(config.provider_settings().timeout, Duration::from_secs(30));
        assert!(config.sync_on_list);
    }
}
