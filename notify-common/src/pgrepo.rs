//! # PgNotificationRepository
//!
//! A `NotificationRepository` backed by a PostgreSQL table.
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::notification::{NotificationId, NotificationItem, NotificationState};
use crate::repository::{
    DatabaseError, NotificationRepository, RepositoryError, RepositoryResult,
};
use crate::retry::{FailureDecision, RetryPolicy};

const UNIQUE_VIOLATION: &str = "23505";

const SELECT_COLUMNS: &str = r#"
SELECT
    id, channel, state, retry_count, max_retry, next_retry_at,
    payload_json, last_error, rule_violations, created_at
FROM
    notifications
"#;

pub struct PgNotificationRepository {
    pool: PgPool,
    retry_policy: RetryPolicy,
}

impl PgNotificationRepository {
    /// Initialize a repository with a lazily connecting pool to the database in `url`.
    pub fn new(
        url: &str,
        max_connections: u32,
        app_name: &'static str,
        retry_policy: RetryPolicy,
    ) -> Result<Self, DatabaseError> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| DatabaseError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self { pool, retry_policy })
    }

    pub fn new_from_pool(pool: PgPool, retry_policy: RetryPolicy) -> Self {
        Self { pool, retry_policy }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|error| DatabaseError::MigrationError { error })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Move `id` to `to` if its current state allows it, optionally setting one more text column.
    /// Entering a terminal state clears `next_retry_at`. Queueing also waits out the backoff.
    async fn transition(
        &self,
        id: NotificationId,
        to: NotificationState,
        assignment: Option<(&'static str, &str)>,
    ) -> RepositoryResult<()> {
        let predecessors: Vec<i16> = to.predecessors().iter().map(|s| s.code()).collect();
        let clear_retry = if to.is_terminal() {
            ",\n    next_retry_at = NULL"
        } else {
            ""
        };
        let extra = match assignment {
            Some((column, _)) => format!(",\n    {column} = $4"),
            None => String::new(),
        };
        let eligible = if to == NotificationState::Queued {
            "\n    AND (next_retry_at IS NULL OR next_retry_at <= NOW())"
        } else {
            ""
        };
        let query = format!(
            r#"
UPDATE
    notifications
SET
    state = $1,
    updated_at = NOW(){clear_retry}{extra}
WHERE
    id = $2
    AND state = ANY($3){eligible}
            "#
        );

        let mut update = sqlx::query(&query).bind(to).bind(id).bind(&predecessors);
        if let Some((_, value)) = assignment {
            update = update.bind(value);
        }

        let result = update
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let from = self.get(id).await?.state;
        if to == NotificationState::Queued && from.can_transition_to(to) {
            return Err(RepositoryError::NotEligible(id));
        }
        Err(RepositoryError::InvalidTransition { id, from, to })
    }
}

#[async_trait]
impl NotificationRepository for PgNotificationRepository {
    async fn fetch_pending(&self, limit: u32) -> RepositoryResult<Vec<NotificationItem>> {
        let pending: Vec<i16> = NotificationState::PENDING.iter().map(|s| s.code()).collect();
        let query = format!(
            r#"{SELECT_COLUMNS}
WHERE
    state = ANY($1)
    AND (next_retry_at IS NULL OR next_retry_at <= NOW())
ORDER BY
    created_at,
    id
LIMIT $2
            "#
        );

        let items: Vec<NotificationItem> = sqlx::query_as(&query)
            .bind(&pending)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(items)
    }

    async fn insert(&self, item: &NotificationItem) -> RepositoryResult<()> {
        let base_query = r#"
INSERT INTO notifications
    (id, channel, state, retry_count, max_retry, next_retry_at, payload_json, last_error, rule_violations, created_at, updated_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
        "#;

        sqlx::query(base_query)
            .bind(item.id)
            .bind(item.channel)
            .bind(item.state)
            .bind(item.retry_count)
            .bind(item.max_retry)
            .bind(item.next_retry_at)
            .bind(&item.payload)
            .bind(&item.last_error)
            .bind(&item.rule_violations)
            .bind(item.created_at)
            .execute(&self.pool)
            .await
            .map_err(|error| {
                let duplicate = error
                    .as_database_error()
                    .and_then(|e| e.code())
                    .is_some_and(|code| code == UNIQUE_VIOLATION);

                if duplicate {
                    RepositoryError::AlreadyExists(item.id)
                } else {
                    DatabaseError::QueryError {
                        command: "INSERT".to_owned(),
                        error,
                    }
                    .into()
                }
            })?;

        Ok(())
    }

    async fn get(&self, id: NotificationId) -> RepositoryResult<NotificationItem> {
        let query = format!("{SELECT_COLUMNS} WHERE id = $1");

        let item: Option<NotificationItem> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        item.ok_or(RepositoryError::NotFound(id))
    }

    async fn mark_queued(&self, id: NotificationId) -> RepositoryResult<()> {
        self.transition(id, NotificationState::Queued, None).await
    }

    async fn mark_processing(&self, id: NotificationId) -> RepositoryResult<()> {
        self.transition(id, NotificationState::Processing, None)
            .await
    }

    async fn mark_sent(&self, id: NotificationId) -> RepositoryResult<()> {
        self.transition(id, NotificationState::Sent, None).await
    }

    async fn mark_completed(&self, id: NotificationId) -> RepositoryResult<()> {
        self.transition(id, NotificationState::Completed, None)
            .await
    }

    async fn mark_failed(
        &self,
        id: NotificationId,
        error: &str,
        permanent: bool,
    ) -> RepositoryResult<NotificationState> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| DatabaseError::ConnectionError { error })?;

        let current: Option<(NotificationState, i32, i32)> = sqlx::query_as(
            "SELECT state, retry_count, max_retry FROM notifications WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|error| DatabaseError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        // Returning early rolls the transaction back on drop.
        let (from, retry_count, max_retry) = current.ok_or(RepositoryError::NotFound(id))?;
        let decision = self
            .retry_policy
            .on_failure(retry_count, max_retry, permanent, Utc::now());
        let to = decision.state();

        if !from.can_transition_to(to) {
            return Err(RepositoryError::InvalidTransition { id, from, to });
        }

        let update = match decision {
            FailureDecision::Retry {
                retry_count,
                next_retry_at,
            } => sqlx::query(
                r#"
UPDATE
    notifications
SET
    state = $2,
    retry_count = $3,
    next_retry_at = $4,
    last_error = $5,
    updated_at = NOW()
WHERE
    id = $1
                "#,
            )
            .bind(id)
            .bind(to)
            .bind(retry_count)
            .bind(next_retry_at)
            .bind(error),
            FailureDecision::Permanent => sqlx::query(
                r#"
UPDATE
    notifications
SET
    state = $2,
    next_retry_at = NULL,
    last_error = $3,
    updated_at = NOW()
WHERE
    id = $1
                "#,
            )
            .bind(id)
            .bind(to)
            .bind(error),
        };

        update
            .execute(&mut *tx)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        tx.commit()
            .await
            .map_err(|error| DatabaseError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        Ok(to)
    }

    async fn mark_failed_perm(&self, id: NotificationId, reason: &str) -> RepositoryResult<()> {
        self.transition(
            id,
            NotificationState::FailedPerm,
            Some(("rule_violations", reason)),
        )
        .await
    }

    async fn mark_dead_letter(&self, id: NotificationId, reason: &str) -> RepositoryResult<()> {
        self.transition(
            id,
            NotificationState::DeadLetter,
            Some(("last_error", reason)),
        )
        .await
    }
}
