//! Application error model with MCP error mapping
//!
//! Defines the engine's error taxonomy using `thiserror`, and maps each variant
//! to the appropriate MCP `ErrorData` type for the stdio surface. Provider
//! adapters use their own [`crate::provider::ProviderError`], which is
//! translated into this taxonomy at the sync and send boundaries.

use rmcp::model::ErrorData;
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Every public engine operation returns this type. Each variant maps to an
/// MCP error code in [`ErrorData`].
#[derive(Debug, Error)]
pub enum AppError {
    /// Account or message absent, or not owned by the requesting user
    #[error("not found: {0}")]
    NotFound(String),
    /// Malformed request (bad draft, bad filter, missing bulk parameters)
    #[error("validation failed: {0}")]
    Validation(String),
    /// Per-user operation budget exhausted
    #[error("rate limit exceeded for {operation}; retry after {retry_after_secs}s")]
    RateLimited {
        operation: &'static str,
        retry_after_secs: u64,
    },
    /// Provider credential invalid or expired; the account must be reconnected
    #[error("provider authentication failed: {0}")]
    ProviderAuth(String),
    /// Network failure, timeout or 5xx from the provider
    #[error("provider unavailable: {0}")]
    ProviderTransport(String),
    /// Permanent provider-side rejection (invalid recipient, unknown folder)
    #[error("provider rejected request: {0}")]
    ProviderRejected(String),
    /// Local persistence failure; the current transaction was rolled back
    #[error("storage error: {0}")]
    Storage(String),
    /// Unexpected failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `Validation`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Convenience constructor for `NotFound`
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Convert to MCP `ErrorData`
    ///
    /// # Mappings
    ///
    /// - `NotFound` → `resource_not_found`
    /// - `Validation`, `ProviderRejected` → `invalid_params`
    /// - `RateLimited`, `ProviderAuth` → `invalid_request`
    /// - `ProviderTransport`, `Storage`, `Internal` → `internal_error`
    pub fn to_error_data(&self) -> ErrorData {
        let msg = self.to_string();
        match self {
            Self::NotFound(_) => {
                ErrorData::resource_not_found(msg, Some(json!({ "code": "not_found" })))
            }
            Self::Validation(_) => {
                ErrorData::invalid_params(msg, Some(json!({ "code": "validation" })))
            }
            Self::RateLimited {
                retry_after_secs, ..
            } => ErrorData::invalid_request(
                msg,
                Some(json!({ "code": "rate_limited", "retry_after_secs": retry_after_secs })),
            ),
            Self::ProviderAuth(_) => {
                ErrorData::invalid_request(msg, Some(json!({ "code": "reconnect_account" })))
            }
            Self::ProviderTransport(_) => {
                ErrorData::internal_error(msg, Some(json!({ "code": "provider_unavailable" })))
            }
            Self::ProviderRejected(_) => {
                ErrorData::invalid_params(msg, Some(json!({ "code": "provider_rejected" })))
            }
            Self::Storage(_) => ErrorData::internal_error(msg, Some(json!({ "code": "storage" }))),
            Self::Internal(_) => {
                ErrorData::internal_error(msg, Some(json!({ "code": "internal" })))
            }
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("column encoding failed: {err}"))
    }
}

/// Type alias for fallible return values
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn rate_limited_error_carries_retry_hint() {
        let err = AppError::RateLimited {
            operation: "send",
            retry_after_secs: 30,
        };
        assert!(err.to_string().contains("retry after 30s"));
        let data = err.to_error_data();
        let extra = data.data.expect("structured data present");
        assert_eq!(extra["code"], "rate_limited");
        assert_eq!(extra["retry_after_secs"], 30);
    }

    #[test]
    fn provider_auth_maps_to_reconnect_signal() {
        let data = AppError::ProviderAuth("token expired".to_owned()).to_error_data();
        let extra = data.data.expect("structured data present");
        assert_eq!(extra["code"], "reconnect_account");
    }
}
