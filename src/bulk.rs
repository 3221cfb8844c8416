//! Bulk message mutations
//!
//! Items are processed in input order. Remote failures are recorded per item
//! and never abort the batch; every successful local change is committed in a
//! single transaction once the loop has finished.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::models::{Account, BulkAction, BulkRequest, BulkResult, Message, TRASH_FOLDER};
use crate::provider::ProviderRegistry;
use crate::store::{MessageChange, Store};

/// Most ids accepted in one bulk request
pub const MAX_BULK_IDS: usize = 1000;

/// Check a request before anything is loaded.
///
/// # Errors
///
/// Returns `Validation` when no ids are given, when `move` lacks a target
/// folder or when `label`/`unlabel` lack labels.
pub fn validate_request(request: &BulkRequest) -> AppResult<()> {
    if request.message_ids.is_empty() {
        return Err(AppError::invalid("message_ids must not be empty"));
    }
    if request.message_ids.len() > MAX_BULK_IDS {
        return Err(AppError::invalid(format!(
            "at most {MAX_BULK_IDS} message ids per bulk request"
        )));
    }
    match request.action {
        BulkAction::Move => {
            if request
                .target_folder
                .as_deref()
                .is_none_or(|f| f.trim().is_empty())
            {
                return Err(AppError::invalid("target_folder is required for move"));
            }
        }
        BulkAction::Label | BulkAction::Unlabel => {
            if request
                .labels
                .as_ref()
                .is_none_or(|labels| labels.iter().all(|l| l.trim().is_empty()))
            {
                return Err(AppError::invalid(format!(
                    "labels are required for {}",
                    request.action.as_str()
                )));
            }
        }
        _ => {}
    }
    Ok(())
}

fn requested_labels(request: &BulkRequest) -> Vec<String> {
    request
        .labels
        .iter()
        .flatten()
        .map(|label| label.trim())
        .filter(|label| !label.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Applies one action to many messages
pub struct BulkProcessor {
    store: Arc<Store>,
    providers: Arc<ProviderRegistry>,
}

impl BulkProcessor {
    pub fn new(store: Arc<Store>, providers: Arc<ProviderRegistry>) -> Self {
        Self { store, providers }
    }

    /// Apply `request` to the user's messages.
    ///
    /// Ids that are missing or belong to another user are dropped before
    /// processing and count as neither success nor failure.
    ///
    /// # Errors
    ///
    /// `Validation` for malformed requests and `Storage` when the final
    /// commit fails; provider failures are reported per item.
    pub async fn apply(&self, user_id: i64, request: &BulkRequest) -> AppResult<BulkResult> {
        validate_request(request)?;
        let labels = requested_labels(request);
        let target_folder = request.target_folder.as_deref().map(str::trim);

        let messages = self.store.messages_for_user(user_id, &request.message_ids)?;
        let mut accounts: HashMap<i64, Account> = HashMap::new();
        let mut changes = Vec::with_capacity(messages.len());
        let mut result = BulkResult::default();

        for message in &messages {
            let mut change = MessageChange::from_message(message);
            let outcome = match request.action {
                BulkAction::MarkRead => {
                    change.is_read = true;
                    Ok(())
                }
                BulkAction::MarkUnread => {
                    change.is_read = false;
                    Ok(())
                }
                BulkAction::Star => {
                    change.is_starred = true;
                    Ok(())
                }
                BulkAction::Unstar => {
                    change.is_starred = false;
                    Ok(())
                }
                BulkAction::Label => {
                    for label in &labels {
                        if !change.labels.contains(label) {
                            change.labels.push(label.clone());
                        }
                    }
                    Ok(())
                }
                BulkAction::Unlabel => {
                    change.labels.retain(|existing| !labels.contains(existing));
                    Ok(())
                }
                BulkAction::Move => {
                    let folder = target_folder.unwrap_or_default();
                    change.folder = folder.to_owned();
                    self.move_remote(&mut accounts, message, folder).await
                }
                BulkAction::Delete => {
                    change.folder = TRASH_FOLDER.to_owned();
                    self.move_remote(&mut accounts, message, TRASH_FOLDER).await
                }
            };

            match outcome {
                Ok(()) => {
                    result.success_count += 1;
                    changes.push(change);
                }
                Err(err) => {
                    warn!(
                        user_id,
                        message_id = message.id,
                        action = request.action.as_str(),
                        error = %err,
                        "bulk item failed"
                    );
                    result.failed_count += 1;
                    result.failed_ids.push(message.id);
                }
            }
        }

        self.store.apply_changes(&changes)?;
        info!(
            user_id,
            action = request.action.as_str(),
            requested = request.message_ids.len(),
            succeeded = result.success_count,
            failed = result.failed_count,
            "bulk action applied"
        );
        Ok(result)
    }

    async fn move_remote(
        &self,
        accounts: &mut HashMap<i64, Account>,
        message: &Message,
        folder: &str,
    ) -> AppResult<()> {
        if message.folder == folder {
            return Ok(());
        }
        let account = match accounts.entry(message.account_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let account = self.store.account(message.account_id)?.ok_or_else(|| {
                    AppError::not_found(format!("account {}", message.account_id))
                })?;
                entry.insert(account)
            }
        };
        let adapter = self.providers.for_account(account)?;
        adapter
            .move_message(account, &message.provider_message_id, folder)
            .await?;
        Ok(())
    }
}
