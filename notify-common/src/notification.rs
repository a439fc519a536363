use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier assigned to a notification at ingestion time.
pub type NotificationId = Uuid;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseStateError {
    #[error("{0} is not a valid NotificationState")]
    UnknownState(String),
    #[error("{0} is not a valid NotificationChannel")]
    UnknownChannel(String),
}

/// Where a notification came from. Stored as a small integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum NotificationChannel {
    File = 0,
    Broker = 1,
    Sftp = 2,
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NotificationChannel::File => write!(f, "file"),
            NotificationChannel::Broker => write!(f, "broker"),
            NotificationChannel::Sftp => write!(f, "sftp"),
        }
    }
}

impl FromStr for NotificationChannel {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(NotificationChannel::File),
            "broker" => Ok(NotificationChannel::Broker),
            "sftp" => Ok(NotificationChannel::Sftp),
            invalid => Err(ParseStateError::UnknownChannel(invalid.to_owned())),
        }
    }
}

/// Lifecycle states of a notification.
///
/// New: ingested, not validated yet.
/// Queued: validated and waiting for a processing slot.
/// Processing: a pipeline run is in progress.
/// Sent: dispatched and awaiting confirmation.
/// Completed: terminal success.
/// FailedTemp: transient failure, eligible again once `next_retry_at` has elapsed.
/// FailedPerm: terminal failure, either a validation reject or an exhausted retry budget.
/// DeadLetter: terminal, only entered on operator request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum NotificationState {
    New = 0,
    Queued = 1,
    Processing = 2,
    Sent = 3,
    Completed = 4,
    FailedTemp = 5,
    FailedPerm = 6,
    DeadLetter = 7,
}

impl NotificationState {
    /// States the discovery loop may pick up, subject to `next_retry_at`.
    pub const PENDING: [NotificationState; 3] = [
        NotificationState::New,
        NotificationState::Queued,
        NotificationState::FailedTemp,
    ];

    /// States a notification may be in right before entering `self`.
    ///
    /// Queued also accepts Queued so a restarted process can re-admit items it had queued
    /// before going down. FailedPerm accepts the pre-processing states so a ruleset change can
    /// still reject an item that was already admitted once.
    pub fn predecessors(self) -> &'static [NotificationState] {
        match self {
            NotificationState::New => &[],
            NotificationState::Queued => &[
                NotificationState::New,
                NotificationState::Queued,
                NotificationState::FailedTemp,
            ],
            NotificationState::Processing => &[NotificationState::Queued],
            NotificationState::Sent => &[NotificationState::Processing],
            NotificationState::Completed => {
                &[NotificationState::Processing, NotificationState::Sent]
            }
            NotificationState::FailedTemp => &[NotificationState::Processing],
            NotificationState::FailedPerm => &[
                NotificationState::New,
                NotificationState::Queued,
                NotificationState::FailedTemp,
                NotificationState::Processing,
            ],
            NotificationState::DeadLetter => &[NotificationState::FailedTemp],
        }
    }

    pub fn can_transition_to(self, next: NotificationState) -> bool {
        next.predecessors().contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NotificationState::Completed
                | NotificationState::FailedPerm
                | NotificationState::DeadLetter
        )
    }

    pub fn code(self) -> i16 {
        self as i16
    }
}

impl fmt::Display for NotificationState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            NotificationState::New => "new",
            NotificationState::Queued => "queued",
            NotificationState::Processing => "processing",
            NotificationState::Sent => "sent",
            NotificationState::Completed => "completed",
            NotificationState::FailedTemp => "failed_temp",
            NotificationState::FailedPerm => "failed_perm",
            NotificationState::DeadLetter => "dead_letter",
        };
        write!(f, "{name}")
    }
}

impl FromStr for NotificationState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(NotificationState::New),
            "queued" => Ok(NotificationState::Queued),
            "processing" => Ok(NotificationState::Processing),
            "sent" => Ok(NotificationState::Sent),
            "completed" => Ok(NotificationState::Completed),
            "failed_temp" => Ok(NotificationState::FailedTemp),
            "failed_perm" => Ok(NotificationState::FailedPerm),
            "dead_letter" => Ok(NotificationState::DeadLetter),
            invalid => Err(ParseStateError::UnknownState(invalid.to_owned())),
        }
    }
}

/// A unit of work tracked through its lifecycle.
///
/// The copy held in memory is a snapshot: once a transition has been persisted, the repository
/// is the only authority on `state`, `retry_count` and `next_retry_at`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct NotificationItem {
    pub id: NotificationId,
    pub channel: NotificationChannel,
    pub state: NotificationState,
    pub retry_count: i32,
    pub max_retry: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// The serialized envelope as received. Only the rule engine and pipeline steps look inside.
    #[sqlx(rename = "payload_json")]
    pub payload: String,
    pub last_error: Option<String>,
    pub rule_violations: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NotificationItem {
    /// A freshly ingested notification, in state New and eligible immediately.
    pub fn new(channel: NotificationChannel, payload: String, max_retry: i32) -> Self {
        Self {
            id: Uuid::now_v7(),
            channel,
            state: NotificationState::New,
            retry_count: 0,
            max_retry: max_retry.max(0),
            next_retry_at: None,
            payload,
            last_error: None,
            rule_violations: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the discovery loop may pick this notification up at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        NotificationState::PENDING.contains(&self.state)
            && self.next_retry_at.map_or(true, |at| at <= now)
    }
}
