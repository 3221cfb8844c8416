//! mailhub: multi-provider email synchronization and dispatch engine
//!
//! Keeps a canonical local copy of mail from Gmail, Outlook (Microsoft Graph)
//! and plain IMAP/SMTP accounts, and sends through the same accounts.
//!
//! # Architecture
//!
//! - [`service`]: `Mailhub` facade; rate checks, ownership scoping, send/update/delete
//! - [`sync`]: sync orchestrator and background sync runner
//! - [`bulk`]: bulk mutations with per-item failure records
//! - [`query`]: filter/sort/page planning over the store
//! - [`store`]: SQLite persistence and the dedup key
//! - [`account_state`]: sync status machine and token freshness
//! - [`rate_limit`]: per-user, per-operation budgets
//! - [`provider`]: adapter contract plus Gmail, Graph and IMAP/SMTP adapters
//! - [`imap`]: IMAP transport/session operations with timeout wrappers
//! - [`mime`]: RFC 822 parsing and HTML sanitization
//! - [`message_id`]: IMAP message locator and UID cursor encoding
//! - [`attachments`]: content-addressed attachment blobs
//! - [`credentials`]: refresh-needed signalling for OAuth tokens
//! - [`config`]: environment-driven configuration
//! - [`server`]: MCP tool handlers over the engine
//! - [`errors`], [`models`]: error taxonomy and shared records

pub mod account_state;
pub mod attachments;
pub mod bulk;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod imap;
pub mod message_id;
pub mod mime;
pub mod models;
pub mod provider;
pub mod query;
pub mod rate_limit;
pub mod server;
pub mod service;
pub mod store;
pub mod sync;
