//! Filtered, sorted, paginated message listing
//!
//! A [`MessageFilter`] is validated and compiled into a [`QueryPlan`]: a
//! parameterized `WHERE` clause scoped to the user's accounts plus a
//! whitelisted `ORDER BY`. No caller-supplied text is ever interpolated into
//! SQL. The total is counted before pagination is applied.

use rusqlite::types::Value;

use crate::errors::{AppError, AppResult};
use crate::models::{Message, MessageFilter, PagedResult, SortKey};
use crate::store::{Store, to_millis};

/// Maximum page size accepted by listings
pub const MAX_PAGE_SIZE: u32 = 100;
/// Maximum accepted search text length
pub const MAX_SEARCH_CHARS: usize = 256;

/// Compiled listing query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// Boolean SQL expression over `m` (messages) and `a` (accounts)
    pub where_sql: String,
    pub params: Vec<Value>,
    pub order_by: String,
}

/// Validate the page window.
pub fn validate_page(page: u32, page_size: u32) -> AppResult<()> {
    if page < 1 {
        return Err(AppError::invalid("page must be >= 1"));
    }
    if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(AppError::invalid(format!(
            "page_size must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }
    Ok(())
}

/// Compile a filter into a user-scoped query plan.
pub fn build_plan(user_id: i64, filter: &MessageFilter) -> AppResult<QueryPlan> {
    let mut clauses = vec!["a.user_id = ?".to_owned()];
    let mut params = vec![Value::Integer(user_id)];

    if let Some(account_id) = filter.account_id {
        clauses.push("m.account_id = ?".to_owned());
        params.push(Value::Integer(account_id));
    }
    if let Some(folder) = &filter.folder {
        let folder = folder.trim();
        if folder.is_empty() {
            return Err(AppError::invalid("folder must not be empty"));
        }
        clauses.push("m.folder = ?".to_owned());
        params.push(Value::Text(folder.to_owned()));
    }
    if let Some(is_read) = filter.is_read {
        clauses.push("m.is_read = ?".to_owned());
        params.push(Value::Integer(i64::from(is_read)));
    }
    if let Some(is_starred) = filter.is_starred {
        clauses.push("m.is_starred = ?".to_owned());
        params.push(Value::Integer(i64::from(is_starred)));
    }
    if let Some(labels) = &filter.labels
        && !labels.is_empty()
    {
        let marks = vec!["?"; labels.len()].join(", ");
        clauses.push(format!(
            "EXISTS (SELECT 1 FROM json_each(m.labels) WHERE json_each.value IN ({marks}))"
        ));
        params.extend(labels.iter().map(|l| Value::Text(l.clone())));
    }
    if let (Some(from), Some(to)) = (filter.from_date, filter.to_date)
        && from > to
    {
        return Err(AppError::invalid("from_date must not be after to_date"));
    }
    if let Some(from) = filter.from_date {
        clauses.push("m.received_at >= ?".to_owned());
        params.push(Value::Integer(to_millis(from)));
    }
    if let Some(to) = filter.to_date {
        clauses.push("m.received_at <= ?".to_owned());
        params.push(Value::Integer(to_millis(to)));
    }
    if let Some(has_attachments) = filter.has_attachments {
        let exists = "EXISTS (SELECT 1 FROM attachments t WHERE t.message_id = m.id)";
        clauses.push(if has_attachments {
            exists.to_owned()
        } else {
            format!("NOT {exists}")
        });
    }
    if let Some(search) = &filter.search {
        let needle = validate_search(search)?;
        if !needle.is_empty() {
            let pattern = format!("%{}%", escape_like(&needle.to_lowercase()));
            clauses.push(
                "(lower(coalesce(m.subject, '')) LIKE ? ESCAPE '\\' \
                 OR lower(coalesce(m.body_text, '')) LIKE ? ESCAPE '\\' \
                 OR lower(coalesce(m.body_html, '')) LIKE ? ESCAPE '\\' \
                 OR lower(m.sender) LIKE ? ESCAPE '\\')"
                    .to_owned(),
            );
            for _ in 0..4 {
                params.push(Value::Text(pattern.clone()));
            }
        }
    }

    let column = match filter.sort_by {
        SortKey::ReceivedAt => "m.received_at",
        SortKey::Subject => "m.subject",
        SortKey::Sender => "m.sender",
        SortKey::Priority => "m.priority",
        SortKey::CreatedAt => "m.created_at",
        SortKey::UpdatedAt => "m.updated_at",
    };
    let direction = if filter.sort_desc { "DESC" } else { "ASC" };

    Ok(QueryPlan {
        where_sql: clauses.join(" AND "),
        params,
        order_by: format!("{column} {direction}, m.id {direction}"),
    })
}

/// Run a listing: validate, count, then fetch one page.
pub fn list_messages(
    store: &Store,
    user_id: i64,
    filter: &MessageFilter,
    page: u32,
    page_size: u32,
) -> AppResult<PagedResult<Message>> {
    validate_page(page, page_size)?;
    let plan = build_plan(user_id, filter)?;
    let total = store.count_matching(&plan)?;
    let offset = u64::from(page - 1) * u64::from(page_size);
    let items = if offset >= total {
        Vec::new()
    } else {
        store.select_matching(&plan, page_size, offset)?
    };

    Ok(PagedResult {
        items,
        total,
        page,
        page_size,
        total_pages: total.div_ceil(u64::from(page_size)),
    })
}

fn validate_search(raw: &str) -> AppResult<&str> {
    let trimmed = raw.trim();
    if trimmed.chars().count() > MAX_SEARCH_CHARS {
        return Err(AppError::invalid(format!(
            "search must be <= {MAX_SEARCH_CHARS} characters"
        )));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(AppError::invalid("search must not contain control characters"));
    }
    Ok(trimmed)
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
