//! # Audit
//!
//! Append-only facts about what happened to a notification, recorded by the rule engine and the
//! processing pipeline. Sinks are fire-and-forget: recording never blocks and never fails the
//! caller.
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::notification::NotificationId;

/// Marker describing how a recorded action ended, or that it started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditOutcome {
    Start,
    Success,
    Pass,
    Fail,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuditOutcome::Start => write!(f, "START"),
            AuditOutcome::Success => write!(f, "SUCCESS"),
            AuditOutcome::Pass => write!(f, "PASS"),
            AuditOutcome::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub notification_id: NotificationId,
    pub timestamp_utc: DateTime<Utc>,
    /// The component that emitted the event, e.g. `RULE_ENGINE` or a step name.
    pub stage: String,
    pub action: String,
    pub outcome: AuditOutcome,
    pub details: Option<String>,
}

impl AuditEvent {
    pub fn new(
        notification_id: NotificationId,
        stage: &str,
        action: &str,
        outcome: AuditOutcome,
        details: Option<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            notification_id,
            timestamp_utc: Utc::now(),
            stage: stage.to_owned(),
            action: action.to_owned(),
            outcome,
            details,
        }
    }

    /// Render as a single `timestamp | notification | stage | action | outcome [| details]` line.
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{} | {} | {} | {} | {}",
            self.timestamp_utc.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.notification_id,
            self.stage,
            self.action,
            self.outcome
        );

        if let Some(details) = self.details.as_deref().filter(|d| !d.trim().is_empty()) {
            line.push_str(" | ");
            line.push_str(details);
        }

        line
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    /// Record an event. Must return promptly and must not fail the caller.
    fn record(&self, event: AuditEvent);
}

/// Emit audit events as `tracing` events under the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            target: "audit",
            notification_id = %event.notification_id,
            stage = %event.stage,
            action = %event.action,
            outcome = %event.outcome,
            details = event.details.as_deref().unwrap_or(""),
            "audit event"
        );
    }
}

/// Keeps every event in memory, in recording order.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn events_for(&self, notification_id: NotificationId) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.notification_id == notification_id)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Appends events as text lines to a file.
///
/// Writes happen on a background task fed through a bounded channel. When the channel is full the
/// event is dropped and counted rather than making the caller wait.
pub struct FileAuditSink {
    sender: mpsc::Sender<AuditEvent>,
}

impl FileAuditSink {
    /// Create the parent directory of `path` and spawn the writer task.
    /// The returned handle completes once every clone of the sink has been dropped and pending
    /// events have been written out.
    pub fn spawn(path: impl AsRef<Path>, buffer: usize) -> io::Result<(Self, JoinHandle<()>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(write_audit_lines(path, receiver));

        Ok((Self { sender }, handle))
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Err(error) = self.sender.try_send(event) {
            metrics::counter!("notify_audit_events_dropped").increment(1);
            warn!("dropping audit event: {}", error);
        }
    }
}

async fn write_audit_lines(path: PathBuf, mut receiver: mpsc::Receiver<AuditEvent>) {
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => file,
        Err(error) => {
            error!("failed to open audit log {}: {}", path.display(), error);
            return;
        }
    };

    while let Some(event) = receiver.recv().await {
        let mut line = event.to_line();
        line.push('\n');

        if let Err(error) = file.write_all(line.as_bytes()).await {
            metrics::counter!("notify_audit_events_dropped").increment(1);
            error!("failed to write audit event {}: {}", event.event_id, error);
        }
    }

    if let Err(error) = file.flush().await {
        error!("failed to flush audit log {}: {}", path.display(), error);
    }
}
