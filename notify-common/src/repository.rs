//! # Repository
//!
//! Durable state of every notification. The repository is the only authority on a notification's
//! state: every transition is checked against the state machine and applied together with the
//! retry bookkeeping it implies, or not at all.
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::notification::{NotificationId, NotificationItem, NotificationState};
use crate::retry::{FailureDecision, RetryPolicy};

/// Enumeration of database-related errors.
/// Errors that can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
    #[error("running migrations failed with: {error}")]
    MigrationError { error: sqlx::migrate::MigrateError },
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("notification {0} not found")]
    NotFound(NotificationId),
    #[error("notification {0} already exists")]
    AlreadyExists(NotificationId),
    #[error("notification {0} is waiting for its next retry")]
    NotEligible(NotificationId),
    #[error("notification {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: NotificationId,
        from: NotificationState,
        to: NotificationState,
    },
    #[error(transparent)]
    DatabaseError(#[from] DatabaseError),
}

pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Up to `limit` notifications eligible for processing now, oldest first.
    ///
    /// Eligible means New, Queued or FailedTemp with an elapsed (or absent) `next_retry_at`.
    async fn fetch_pending(&self, limit: u32) -> RepositoryResult<Vec<NotificationItem>>;

    async fn insert(&self, item: &NotificationItem) -> RepositoryResult<()>;

    async fn get(&self, id: NotificationId) -> RepositoryResult<NotificationItem>;

    /// Admit a validated notification into the in-memory queue.
    /// Fails with `NotEligible` while the notification's backoff has not elapsed.
    async fn mark_queued(&self, id: NotificationId) -> RepositoryResult<()>;

    async fn mark_processing(&self, id: NotificationId) -> RepositoryResult<()>;

    async fn mark_sent(&self, id: NotificationId) -> RepositoryResult<()>;

    async fn mark_completed(&self, id: NotificationId) -> RepositoryResult<()>;

    /// Record a processing failure and return the state it led to.
    ///
    /// The failure is permanent when `permanent` is set or when the retry budget is already
    /// spent. Otherwise `retry_count` is incremented and the notification is rescheduled
    /// according to the retry policy.
    async fn mark_failed(
        &self,
        id: NotificationId,
        error: &str,
        permanent: bool,
    ) -> RepositoryResult<NotificationState>;

    /// Reject a notification for good, recording `reason` (usually serialized rule violations).
    async fn mark_failed_perm(&self, id: NotificationId, reason: &str) -> RepositoryResult<()>;

    /// Park a temporarily failed notification. Only ever requested by an operator.
    async fn mark_dead_letter(&self, id: NotificationId, reason: &str) -> RepositoryResult<()>;
}

/// A repository kept entirely in memory. Used by tests and embedded runs.
#[derive(Debug, Default)]
pub struct MemoryNotificationRepository {
    items: Mutex<HashMap<NotificationId, NotificationItem>>,
    retry_policy: RetryPolicy,
}

impl MemoryNotificationRepository {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            retry_policy,
        }
    }

    /// Every stored notification, oldest first.
    pub fn all(&self) -> Vec<NotificationItem> {
        let mut items: Vec<NotificationItem> = self.with_items(|items| items.values().cloned().collect());
        items.sort_by_key(|item| (item.created_at, item.id));
        items
    }

    fn with_items<T>(&self, f: impl FnOnce(&mut HashMap<NotificationId, NotificationItem>) -> T) -> T {
        match self.items.lock() {
            Ok(mut items) => f(&mut items),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn transition(
        &self,
        id: NotificationId,
        to: NotificationState,
        update: impl FnOnce(&mut NotificationItem),
    ) -> RepositoryResult<()> {
        self.with_items(|items| {
            let item = items.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;

            if !item.state.can_transition_to(to) {
                return Err(RepositoryError::InvalidTransition {
                    id,
                    from: item.state,
                    to,
                });
            }

            item.state = to;
            update(item);
            Ok(())
        })
    }
}

#[async_trait]
impl NotificationRepository for MemoryNotificationRepository {
    async fn fetch_pending(&self, limit: u32) -> RepositoryResult<Vec<NotificationItem>> {
        let now = Utc::now();
        let mut pending: Vec<NotificationItem> = self.with_items(|items| {
            items
                .values()
                .filter(|item| item.is_eligible(now))
                .cloned()
                .collect()
        });

        pending.sort_by_key(|item| (item.created_at, item.id));
        pending.truncate(usize::try_from(limit).unwrap_or(usize::MAX));

        Ok(pending)
    }

    async fn insert(&self, item: &NotificationItem) -> RepositoryResult<()> {
        self.with_items(|items| {
            if items.contains_key(&item.id) {
                return Err(RepositoryError::AlreadyExists(item.id));
            }
            items.insert(item.id, item.clone());
            Ok(())
        })
    }

    async fn get(&self, id: NotificationId) -> RepositoryResult<NotificationItem> {
        self.with_items(|items| items.get(&id).cloned())
            .ok_or(RepositoryError::NotFound(id))
    }

    async fn mark_queued(&self, id: NotificationId) -> RepositoryResult<()> {
        let now = Utc::now();
        self.with_items(|items| {
            let item = items.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;

            if !item.state.can_transition_to(NotificationState::Queued) {
                return Err(RepositoryError::InvalidTransition {
                    id,
                    from: item.state,
                    to: NotificationState::Queued,
                });
            }
            if item.next_retry_at.is_some_and(|at| at > now) {
                return Err(RepositoryError::NotEligible(id));
            }

            item.state = NotificationState::Queued;
            Ok(())
        })
    }

    async fn mark_processing(&self, id: NotificationId) -> RepositoryResult<()> {
        self.transition(id, NotificationState::Processing, |_| {})
    }

    async fn mark_sent(&self, id: NotificationId) -> RepositoryResult<()> {
        self.transition(id, NotificationState::Sent, |_| {})
    }

    async fn mark_completed(&self, id: NotificationId) -> RepositoryResult<()> {
        self.transition(id, NotificationState::Completed, |item| {
            item.next_retry_at = None;
        })
    }

    async fn mark_failed(
        &self,
        id: NotificationId,
        error: &str,
        permanent: bool,
    ) -> RepositoryResult<NotificationState> {
        self.with_items(|items| {
            let item = items.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
            let decision = self.retry_policy.on_failure(
                item.retry_count,
                item.max_retry,
                permanent,
                Utc::now(),
            );
            let to = decision.state();

            if !item.state.can_transition_to(to) {
                return Err(RepositoryError::InvalidTransition {
                    id,
                    from: item.state,
                    to,
                });
            }

            match decision {
                FailureDecision::Retry {
                    retry_count,
                    next_retry_at,
                } => {
                    item.retry_count = retry_count;
                    item.next_retry_at = Some(next_retry_at);
                }
                FailureDecision::Permanent => item.next_retry_at = None,
            }
            item.state = to;
            item.last_error = Some(error.to_owned());

            Ok(to)
        })
    }

    async fn mark_failed_perm(&self, id: NotificationId, reason: &str) -> RepositoryResult<()> {
        self.transition(id, NotificationState::FailedPerm, |item| {
            item.next_retry_at = None;
            item.rule_violations = Some(reason.to_owned());
        })
    }

    async fn mark_dead_letter(&self, id: NotificationId, reason: &str) -> RepositoryResult<()> {
        self.transition(id, NotificationState::DeadLetter, |item| {
            item.next_retry_at = None;
            item.last_error = Some(reason.to_owned());
        })
    }
}
