//! Per-user, per-operation rate limiting
//!
//! A budget of `limit` per `window` is a sliding window: each `(user,
//! operation)` pair keeps the timestamps of its admitted calls, and a call is
//! refused while `limit` of them are younger than `window`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::errors::{AppError, AppResult};

/// Rate-limited operation keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Send,
    Sync,
    Update,
    Delete,
    BulkAction,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::List,
        Operation::Send,
        Operation::Sync,
        Operation::Update,
        Operation::Delete,
        Operation::BulkAction,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Send => "send",
            Self::Sync => "sync",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::BulkAction => "bulk_action",
        }
    }
}

/// Threshold and window for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub limit: u32,
    pub window: Duration,
}

impl RateBudget {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }

    fn validate(self) -> AppResult<()> {
        if self.limit == 0 {
            return Err(AppError::invalid("rate limit must be at least 1 per window".to_owned()));
        }
        if self.window.is_zero() {
            return Err(AppError::invalid("rate limit window must be positive".to_owned()));
        }
        Ok(())
    }
}

/// Per-operation budgets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimits {
    pub list: RateBudget,
    pub send: RateBudget,
    pub sync: RateBudget,
    pub update: RateBudget,
    pub delete: RateBudget,
    pub bulk_action: RateBudget,
}

impl RateLimits {
    pub fn budget(&self, operation: Operation) -> RateBudget {
        match operation {
            Operation::List => self.list,
            Operation::Send => self.send,
            Operation::Sync => self.sync,
            Operation::Update => self.update,
            Operation::Delete => self.delete,
            Operation::BulkAction => self.bulk_action,
        }
    }

    pub fn set(&mut self, operation: Operation, budget: RateBudget) {
        match operation {
            Operation::List => self.list = budget,
            Operation::Send => self.send = budget,
            Operation::Sync => self.sync = budget,
            Operation::Update => self.update = budget,
            Operation::Delete => self.delete = budget,
            Operation::BulkAction => self.bulk_action = budget,
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        let hour = Duration::from_secs(3600);
        Self {
            list: RateBudget::new(1000, hour),
            send: RateBudget::new(100, hour),
            sync: RateBudget::new(1000, hour),
            update: RateBudget::new(1000, hour),
            delete: RateBudget::new(1000, hour),
            bulk_action: RateBudget::new(1000, hour),
        }
    }
}

/// Outcome of a rate check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Seconds until the next call would be admitted; 0 when allowed
    pub retry_after_secs: u64,
}

/// Rate limiter consumed by every engine entry point
pub trait RateLimiter: Send + Sync {
    /// Consume one unit of the user's budget for `operation`.
    fn check(&self, user_id: i64, operation: Operation) -> RateDecision;
}

/// Timestamps of admitted calls for one user and operation
#[derive(Debug, Default)]
struct CallLog {
    admitted: VecDeque<Instant>,
}

impl CallLog {
    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) < window {
                break;
            }
            self.admitted.pop_front();
        }
    }
}

/// Sliding-window limiter keyed by user id and operation
#[derive(Debug)]
pub struct WindowRateLimiter {
    limits: RateLimits,
    calls: Mutex<HashMap<(i64, Operation), CallLog>>,
}

impl WindowRateLimiter {
    pub fn new(limits: &RateLimits) -> AppResult<Self> {
        for operation in Operation::ALL {
            limits.budget(operation).validate().map_err(|e| {
                AppError::invalid(format!("{} budget: {e}", operation.as_str()))
            })?;
        }
        Ok(Self {
            limits: limits.clone(),
            calls: Mutex::new(HashMap::new()),
        })
    }

    fn check_at(&self, user_id: i64, operation: Operation, now: Instant) -> RateDecision {
        let budget = self.limits.budget(operation);
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        let log = calls.entry((user_id, operation)).or_default();
        log.prune(budget.window, now);

        if log.admitted.len() < budget.limit as usize {
            log.admitted.push_back(now);
            return RateDecision {
                allowed: true,
                retry_after_secs: 0,
            };
        }
        let wait = log
            .admitted
            .front()
            .map(|&oldest| budget.window.saturating_sub(now.saturating_duration_since(oldest)))
            .unwrap_or(budget.window);
        RateDecision {
            allowed: false,
            retry_after_secs: ceil_secs(wait),
        }
    }
}

impl RateLimiter for WindowRateLimiter {
    fn check(&self, user_id: i64, operation: Operation) -> RateDecision {
        self.check_at(user_id, operation, Instant::now())
    }
}

/// Run the rate check for an entry point, failing with `RateLimited`.
pub fn enforce(limiter: &dyn RateLimiter, user_id: i64, operation: Operation) -> AppResult<()> {
    let decision = limiter.check(user_id, operation);
    if decision.allowed {
        return Ok(());
    }
    warn!(
        user_id,
        operation = operation.as_str(),
        retry_after_secs = decision.retry_after_secs,
        "rate limit exceeded"
    );
    Err(AppError::RateLimited {
        operation: operation.as_str(),
        retry_after_secs: decision.retry_after_secs,
    })
}

fn ceil_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}
