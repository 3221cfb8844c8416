//! MCP server implementation with tool handlers
//!
//! Implements the `ServerHandler` trait and registers 9 MCP tools. Each tool
//! parses its input, calls the engine as the configured operator user and
//! wraps the outcome in a [`ToolEnvelope`].

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ErrorData, ServerCapabilities, ServerInfo};
use rmcp::{Json, ServerHandler, tool, tool_handler, tool_router};
use serde::Serialize;
use serde_json::Value;

use crate::errors::{AppError, AppResult};
use crate::models::{
    AccountIdInput, BulkRequest, DeleteMessageInput, ListMessagesInput, MessageFilter,
    MessageIdInput, Meta, SendMessageInput, SyncAccountInput, SyncRunStatus, ToolEnvelope,
    UpdateMessageInput,
};
use crate::service::Mailhub;

/// Mailhub MCP server
///
/// Every request runs as the single operator user this process was
/// configured with.
#[derive(Clone)]
pub struct MailhubServer {
    hub: Arc<Mailhub>,
    user_id: i64,
    /// Tool router for dispatching MCP tool calls
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl MailhubServer {
    pub fn new(hub: Arc<Mailhub>, user_id: i64) -> Self {
        Self {
            hub,
            user_id,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        name = "mail_list_accounts",
        description = "List linked mail accounts with sync state"
    )]
    async fn list_accounts(&self) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.hub.list_accounts(self.user_id).and_then(|accounts| {
                Ok((
                    format!("{} account(s) linked", accounts.len()),
                    to_value(&accounts)?,
                ))
            }),
        )
    }

    /// Tool: List stored messages
    ///
    /// Filters, sorts and pages over the local store. Without an account
    /// filter this may also start background syncs.
    #[tool(
        name = "mail_list_messages",
        description = "List stored messages with filters, sorting and page-based pagination"
    )]
    async fn list_messages(
        &self,
        Parameters(input): Parameters<ListMessagesInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        let result = filter_from_input(&input).and_then(|filter| {
            let page = self
                .hub
                .list_messages(self.user_id, &filter, input.page, input.page_size)?;
            Ok((
                format!(
                    "{} of {} message(s), page {}/{}",
                    page.items.len(),
                    page.total,
                    page.page,
                    page.total_pages.max(1)
                ),
                to_value(&page)?,
            ))
        });
        finalize_tool(started, result)
    }

    #[tool(
        name = "mail_get_message",
        description = "Get one stored message with attachment metadata"
    )]
    async fn get_message(
        &self,
        Parameters(input): Parameters<MessageIdInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.hub
                .get_message(self.user_id, input.message_id)
                .and_then(|message| Ok(("Message retrieved".to_owned(), to_value(&message)?))),
        )
    }

    /// Tool: Send a message through a linked account
    #[tool(
        name = "mail_send_message",
        description = "Send a draft through a linked account and store it in sent"
    )]
    async fn send_message(
        &self,
        Parameters(input): Parameters<SendMessageInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        let result = match self
            .hub
            .send_message(self.user_id, input.account_id, input.draft)
            .await
        {
            Ok(message) => to_value(&message).map(|data| {
                (
                    format!("Message sent to {} recipient(s)", message.recipients.len()),
                    data,
                )
            }),
            Err(e) => Err(e),
        };
        finalize_tool(started, result)
    }

    /// Tool: Sync an account
    ///
    /// Runs to completion unless `background` is set.
    #[tool(
        name = "mail_sync_account",
        description = "Fetch new messages for an account; local flags are never overwritten"
    )]
    async fn sync_account(
        &self,
        Parameters(input): Parameters<SyncAccountInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        let result = if input.background {
            self.hub
                .spawn_sync(self.user_id, input.account_id, input.sync_all)
                .map(|()| {
                    (
                        "Sync started in background".to_owned(),
                        serde_json::json!({ "account_id": input.account_id, "background": true }),
                    )
                })
        } else {
            match self
                .hub
                .sync_account(self.user_id, input.account_id, input.sync_all)
                .await
            {
                Ok(outcome) => to_value(&outcome).map(|data| {
                    let summary = match outcome.status {
                        SyncRunStatus::Completed => format!(
                            "Sync completed: {} fetched, {} new",
                            outcome.fetched_count, outcome.new_count
                        ),
                        SyncRunStatus::Failed => format!(
                            "Sync failed: {}",
                            outcome.error.as_deref().unwrap_or("unknown error")
                        ),
                        SyncRunStatus::AlreadySyncing => "Sync already in progress".to_owned(),
                    };
                    (summary, data)
                }),
                Err(e) => Err(e),
            }
        };
        finalize_tool(started, result)
    }

    #[tool(
        name = "mail_get_sync_status",
        description = "Get sync status, last sync time and last error of an account"
    )]
    async fn get_sync_status(
        &self,
        Parameters(input): Parameters<AccountIdInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.hub
                .get_sync_status(self.user_id, input.account_id)
                .and_then(|status| {
                    Ok((
                        format!("Account is {}", status.status.as_str()),
                        to_value(&status)?,
                    ))
                }),
        )
    }

    /// Tool: Update read/starred flags, folder or labels
    #[tool(
        name = "mail_update_message",
        description = "Update read, starred, folder or labels of a message"
    )]
    async fn update_message(
        &self,
        Parameters(input): Parameters<UpdateMessageInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        let result = match self
            .hub
            .update_message(self.user_id, input.message_id, input.patch)
            .await
        {
            Ok(message) => to_value(&message).map(|data| ("Message updated".to_owned(), data)),
            Err(e) => Err(e),
        };
        finalize_tool(started, result)
    }

    #[tool(
        name = "mail_delete_message",
        description = "Move a message to trash, or delete it permanently"
    )]
    async fn delete_message(
        &self,
        Parameters(input): Parameters<DeleteMessageInput>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        let result = self
            .hub
            .delete_message(self.user_id, input.message_id, input.permanent)
            .await
            .map(|()| {
                let summary = if input.permanent {
                    "Message deleted permanently"
                } else {
                    "Message moved to trash"
                };
                (
                    summary.to_owned(),
                    serde_json::json!({
                        "message_id": input.message_id,
                        "permanent": input.permanent,
                    }),
                )
            });
        finalize_tool(started, result)
    }

    /// Tool: Apply one action to many messages
    ///
    /// Remote failures are reported per message instead of failing the call.
    #[tool(
        name = "mail_bulk_action",
        description = "Apply mark_read, mark_unread, star, unstar, move, delete, label or unlabel to many messages"
    )]
    async fn bulk_action(
        &self,
        Parameters(input): Parameters<BulkRequest>,
    ) -> Result<Json<ToolEnvelope<Value>>, ErrorData> {
        let started = Instant::now();
        let result = match self.hub.bulk_action(self.user_id, &input).await {
            Ok(outcome) => to_value(&outcome).map(|data| {
                (
                    format!(
                        "{}: {} succeeded, {} failed",
                        input.action.as_str(),
                        outcome.success_count,
                        outcome.failed_count
                    ),
                    data,
                )
            }),
            Err(e) => Err(e),
        };
        finalize_tool(started, result)
    }
}

/// MCP server handler implementation
///
/// Provides server info and capabilities to MCP client.
#[tool_handler(router = self.tool_router)]
impl ServerHandler for MailhubServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build()).with_instructions(
            "Multi-provider mail engine. Messages are served from the local store; use mail_sync_account to fetch new mail.",
        )
    }
}

/// Calculate elapsed milliseconds
fn duration_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

/// Build a standardized MCP tool response envelope from business logic output
fn finalize_tool<T>(
    started: Instant,
    result: AppResult<(String, T)>,
) -> Result<Json<ToolEnvelope<T>>, ErrorData>
where
    T: schemars::JsonSchema,
{
    match result {
        Ok((summary, data)) => Ok(Json(ToolEnvelope {
            summary,
            data,
            meta: Meta::now(duration_ms(started)),
        })),
        Err(e) => Err(e.to_error_data()),
    }
}

fn to_value<T: Serialize>(data: &T) -> AppResult<Value> {
    serde_json::to_value(data).map_err(|e| AppError::Internal(format!("response encoding failed: {e}")))
}

fn filter_from_input(input: &ListMessagesInput) -> AppResult<MessageFilter> {
    Ok(MessageFilter {
        folder: input.folder.clone(),
        is_read: input.is_read,
        is_starred: input.is_starred,
        account_id: input.account_id,
        labels: input.labels.clone(),
        from_date: input
            .from_date
            .as_deref()
            .map(|raw| parse_date_bound(raw, false))
            .transpose()?,
        to_date: input
            .to_date
            .as_deref()
            .map(|raw| parse_date_bound(raw, true))
            .transpose()?,
        has_attachments: input.has_attachments,
        search: input.search.clone(),
        sort_by: input.sort_by,
        sort_desc: input.sort_desc,
    })
}

/// Parse an RFC 3339 instant or a `YYYY-MM-DD` day.
///
/// A bare day used as an upper bound covers the whole day.
fn parse_date_bound(input: &str, end_of_day: bool) -> AppResult<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(input) {
        return Ok(instant.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(input, "%Y-%m-%d").map_err(|_| {
        AppError::invalid(format!(
            "invalid date '{input}', expected RFC 3339 or YYYY-MM-DD"
        ))
    })?;
    let time = if end_of_day {
        NaiveTime::from_hms_milli_opt(23, 59, 59, 999)
    } else {
        Some(NaiveTime::MIN)
    }
    .ok_or_else(|| AppError::Internal("invalid time of day".to_owned()))?;
    Ok(day.and_time(time).and_utc())
}

#[cfg(test)]
mod tests {
    use super::parse_date_bound;

    #[test]
    fn bare_days_cover_the_whole_day() {
        let from = parse_date_bound("2026-02-01", false).expect("from");
        let to = parse_date_bound("2026-02-01", true).expect("to");
        assert_eq!(from.to_rfc3339(), "2026-02-01T00:00:00+00:00");
        assert_eq!(to.timestamp_millis() - from.timestamp_millis(), 86_399_999);
    }

    #[test]
    fn rfc3339_instants_are_normalized_to_utc() {
        let at = parse_date_bound("2026-02-01T10:00:00+01:00", true).expect("parse");
        assert_eq!(at.to_rfc3339(), "2026-02-01T09:00:00+00:00");
    }

    #[test]
    fn malformed_dates_are_rejected() {
        let err = parse_date_bound("01/02/2026", false).expect_err("must fail");
        assert!(err.to_string().contains("expected RFC 3339"));
    }
}
