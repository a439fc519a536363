//! # Pipeline
//!
//! An ordered list of processing steps run against one notification. Steps share a
//! `ProcessingContext` and pass intermediate results to each other as named artifacts.
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audit::{AuditEvent, AuditOutcome, AuditSink};
use crate::envelope::{Envelope, EnvelopeError};
use crate::notification::{NotificationChannel, NotificationId, NotificationItem};

pub const EXECUTE_ACTION: &str = "EXECUTE";

/// An intermediate result produced by a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Text(String),
    Bytes(Bytes),
}

impl Artifact {
    fn kind(&self) -> &'static str {
        match self {
            Artifact::Text(_) => "text",
            Artifact::Bytes(_) => "bytes",
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("artifact {0} not found")]
    NotFound(String),
    #[error("artifact {name} holds {found}, expected {expected}")]
    WrongType {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("payload could not be decoded: {0}")]
    Envelope(#[from] EnvelopeError),
}

/// Everything a step may read or produce for a single notification.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub notification_id: NotificationId,
    pub channel: NotificationChannel,
    /// The full envelope as stored at ingestion.
    pub envelope: Value,
    /// The business document decoded from the envelope's `raw` field.
    pub document: Map<String, Value>,
    artifacts: BTreeMap<String, Artifact>,
}

impl ProcessingContext {
    pub fn new(
        notification_id: NotificationId,
        channel: NotificationChannel,
        envelope: Value,
        document: Map<String, Value>,
    ) -> Self {
        Self {
            notification_id,
            channel,
            envelope,
            document,
            artifacts: BTreeMap::new(),
        }
    }

    pub fn from_notification(item: &NotificationItem) -> Result<Self, ContextError> {
        let Envelope { envelope, document } = Envelope::decode(&item.payload)?;
        Ok(Self::new(item.id, item.channel, envelope, document))
    }

    /// Store an artifact, replacing any previous one with the same name.
    pub fn insert_artifact(&mut self, name: &str, artifact: Artifact) {
        self.artifacts.insert(name.to_owned(), artifact);
    }

    pub fn set_text(&mut self, name: &str, text: String) {
        self.insert_artifact(name, Artifact::Text(text));
    }

    pub fn set_bytes(&mut self, name: &str, bytes: Bytes) {
        self.insert_artifact(name, Artifact::Bytes(bytes));
    }

    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.get(name)
    }

    pub fn has_artifact(&self, name: &str) -> bool {
        self.artifacts.contains_key(name)
    }

    pub fn text(&self, name: &str) -> Result<&str, ArtifactError> {
        match self.artifact(name) {
            Some(Artifact::Text(text)) => Ok(text),
            Some(other) => Err(ArtifactError::WrongType {
                name: name.to_owned(),
                expected: "text",
                found: other.kind(),
            }),
            None => Err(ArtifactError::NotFound(name.to_owned())),
        }
    }

    pub fn bytes(&self, name: &str) -> Result<&Bytes, ArtifactError> {
        match self.artifact(name) {
            Some(Artifact::Bytes(bytes)) => Ok(bytes),
            Some(other) => Err(ArtifactError::WrongType {
                name: name.to_owned(),
                expected: "bytes",
                found: other.kind(),
            }),
            None => Err(ArtifactError::NotFound(name.to_owned())),
        }
    }

    /// Artifact names in sorted order.
    pub fn artifact_names(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }
}

/// What the executor does when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPolicy {
    /// Abort the pipeline and fail the notification.
    Fatal,
    /// Record the failure and carry on with the next step.
    NonFatal,
}

#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("step was cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait ProcessingStep: Send + Sync {
    /// Stable name used in logs, metrics and audit events.
    fn name(&self) -> &'static str;

    fn policy(&self) -> StepPolicy {
        StepPolicy::Fatal
    }

    /// Artifacts that must be present for the step to run. When one is missing the step is
    /// skipped.
    fn requires(&self) -> &[&'static str] {
        &[]
    }

    /// Whether the executor records START / SUCCESS / FAIL audit events for this step.
    fn audited(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        context: &mut ProcessingContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Skipped { missing: String },
    FailedNonFatal { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: &'static str,
    pub outcome: StepOutcome,
}

/// What happened to each step of a pipeline run that did not abort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub steps: Vec<StepReport>,
}

impl PipelineReport {
    pub fn outcome(&self, step: &str) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|report| report.step == step)
            .map(|report| &report.outcome)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("step {step} failed: {error}")]
    StepFailed {
        step: &'static str,
        error: StepError,
    },
    #[error("pipeline cancelled before step {next_step}")]
    Cancelled { next_step: &'static str },
}

/// Runs registered steps in registration order.
pub struct Pipeline {
    steps: Vec<Arc<dyn ProcessingStep>>,
    audit: Arc<dyn AuditSink>,
}

impl Pipeline {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self {
            steps: Vec::new(),
            audit,
        }
    }

    pub fn with_step(mut self, step: impl ProcessingStep + 'static) -> Self {
        self.push(Arc::new(step));
        self
    }

    pub fn push(&mut self, step: Arc<dyn ProcessingStep>) {
        self.steps.push(step);
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step against `context`.
    ///
    /// Cancellation is observed between steps; a step already running is left to finish or to
    /// observe `cancel` itself.
    pub async fn execute(
        &self,
        context: &mut ProcessingContext,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport, PipelineError> {
        let mut report = PipelineReport::default();

        for step in &self.steps {
            let name = step.name();

            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled { next_step: name });
            }

            if let Some(missing) = step
                .requires()
                .iter()
                .find(|artifact| !context.has_artifact(artifact))
            {
                debug!(
                    notification_id = %context.notification_id,
                    step = name,
                    "skipping step, missing artifact {}",
                    missing
                );
                report.steps.push(StepReport {
                    step: name,
                    outcome: StepOutcome::Skipped {
                        missing: (*missing).to_owned(),
                    },
                });
                continue;
            }

            self.record(step.as_ref(), context, AuditOutcome::Start, None);
            let start = Instant::now();

            let result = step.execute(context, cancel).await;

            metrics::histogram!("notify_step_duration_seconds", "step" => name)
                .record(start.elapsed().as_secs_f64());

            match result {
                Ok(()) => {
                    self.record(step.as_ref(), context, AuditOutcome::Success, None);
                    report.steps.push(StepReport {
                        step: name,
                        outcome: StepOutcome::Succeeded,
                    });
                }
                Err(error) => {
                    self.record(
                        step.as_ref(),
                        context,
                        AuditOutcome::Fail,
                        Some(error.to_string()),
                    );
                    metrics::counter!("notify_step_failures_total", "step" => name).increment(1);

                    match step.policy() {
                        StepPolicy::Fatal => {
                            return Err(PipelineError::StepFailed { step: name, error });
                        }
                        StepPolicy::NonFatal => {
                            warn!(
                                notification_id = %context.notification_id,
                                step = name,
                                "non-fatal step failed: {}",
                                error
                            );
                            report.steps.push(StepReport {
                                step: name,
                                outcome: StepOutcome::FailedNonFatal {
                                    error: error.to_string(),
                                },
                            });
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    fn record(
        &self,
        step: &dyn ProcessingStep,
        context: &ProcessingContext,
        outcome: AuditOutcome,
        details: Option<String>,
    ) {
        if step.audited() {
            self.audit.record(AuditEvent::new(
                context.notification_id,
                step.name(),
                EXECUTE_ACTION,
                outcome,
                details,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use serde_json::json;
    use std::sync::Mutex;
    use uuid::Uuid;

    type Trace = Arc<Mutex<Vec<&'static str>>>;

    struct TestStep {
        name: &'static str,
        policy: StepPolicy,
        requires: Vec<&'static str>,
        produces: Option<&'static str>,
        fails: bool,
        audited: bool,
        trace: Trace,
    }

    impl TestStep {
        fn new(name: &'static str, trace: &Trace) -> Self {
            Self {
                name,
                policy: StepPolicy::Fatal,
                requires: Vec::new(),
                produces: None,
                fails: false,
                audited: true,
                trace: trace.clone(),
            }
        }
    }

    #[async_trait]
    impl ProcessingStep for TestStep {
        fn name(&self) -> &'static str {
            self.name
        }

        fn policy(&self) -> StepPolicy {
            self.policy
        }

        fn requires(&self) -> &[&'static str] {
            &self.requires
        }

        fn audited(&self) -> bool {
            self.audited
        }

        async fn execute(
            &self,
            context: &mut ProcessingContext,
            _cancel: &CancellationToken,
        ) -> Result<(), StepError> {
            self.trace.lock().unwrap().push(self.name);

            if self.fails {
                return Err(StepError::Other(format!("{} broke", self.name)));
            }
            if let Some(artifact) = self.produces {
                context.set_text(artifact, format!("from {}", self.name));
            }
            Ok(())
        }
    }

    fn context() -> ProcessingContext {
        ProcessingContext::new(
            Uuid::now_v7(),
            NotificationChannel::File,
            json!({"raw": "{}"}),
            Map::new(),
        )
    }

    #[tokio::test]
    async fn test_steps_run_in_registration_order() {
        let trace = Trace::default();
        let audit = Arc::new(MemoryAuditSink::new());
        let pipeline = Pipeline::new(audit.clone())
            .with_step(TestStep::new("C", &trace))
            .with_step(TestStep::new("A", &trace))
            .with_step(TestStep::new("B", &trace));
        let mut context = context();

        let report = pipeline
            .execute(&mut context, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*trace.lock().unwrap(), vec!["C", "A", "B"]);
        assert_eq!(pipeline.step_names(), vec!["C", "A", "B"]);
        assert!(report
            .steps
            .iter()
            .all(|s| s.outcome == StepOutcome::Succeeded));

        let outcomes: Vec<(String, AuditOutcome)> = audit
            .events_for(context.notification_id)
            .into_iter()
            .map(|e| (e.stage, e.outcome))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                ("C".to_owned(), AuditOutcome::Start),
                ("C".to_owned(), AuditOutcome::Success),
                ("A".to_owned(), AuditOutcome::Start),
                ("A".to_owned(), AuditOutcome::Success),
                ("B".to_owned(), AuditOutcome::Start),
                ("B".to_owned(), AuditOutcome::Success),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_artifact_skips_only_dependent_step() {
        let trace = Trace::default();
        let pipeline = Pipeline::new(Arc::new(MemoryAuditSink::new()))
            .with_step(TestStep {
                requires: vec!["XML"],
                ..TestStep::new("NEEDS_XML", &trace)
            })
            .with_step(TestStep::new("INDEPENDENT", &trace));

        let report = pipeline
            .execute(&mut context(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*trace.lock().unwrap(), vec!["INDEPENDENT"]);
        assert_eq!(
            report.outcome("NEEDS_XML"),
            Some(&StepOutcome::Skipped {
                missing: "XML".to_owned()
            })
        );
        assert_eq!(report.outcome("INDEPENDENT"), Some(&StepOutcome::Succeeded));
    }

    #[tokio::test]
    async fn test_artifacts_flow_between_steps() {
        let trace = Trace::default();
        let pipeline = Pipeline::new(Arc::new(MemoryAuditSink::new()))
            .with_step(TestStep {
                produces: Some("XML"),
                ..TestStep::new("PRODUCER", &trace)
            })
            .with_step(TestStep {
                requires: vec!["XML"],
                ..TestStep::new("CONSUMER", &trace)
            });
        let mut context = context();

        pipeline
            .execute(&mut context, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*trace.lock().unwrap(), vec!["PRODUCER", "CONSUMER"]);
        assert_eq!(context.text("XML").unwrap(), "from PRODUCER");
    }

    #[tokio::test]
    async fn test_non_fatal_failure_continues() {
        let trace = Trace::default();
        let audit = Arc::new(MemoryAuditSink::new());
        let pipeline = Pipeline::new(audit.clone())
            .with_step(TestStep {
                policy: StepPolicy::NonFatal,
                fails: true,
                ..TestStep::new("FLAKY", &trace)
            })
            .with_step(TestStep::new("AFTER", &trace));
        let mut context = context();

        let report = pipeline
            .execute(&mut context, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*trace.lock().unwrap(), vec!["FLAKY", "AFTER"]);
        assert_eq!(
            report.outcome("FLAKY"),
            Some(&StepOutcome::FailedNonFatal {
                error: "FLAKY broke".to_owned()
            })
        );

        let failure = audit
            .events_for(context.notification_id)
            .into_iter()
            .find(|e| e.outcome == AuditOutcome::Fail)
            .unwrap();
        assert_eq!(failure.stage, "FLAKY");
        assert_eq!(failure.details.as_deref(), Some("FLAKY broke"));
    }

    #[tokio::test]
    async fn test_fatal_failure_aborts() {
        let trace = Trace::default();
        let pipeline = Pipeline::new(Arc::new(MemoryAuditSink::new()))
            .with_step(TestStep {
                fails: true,
                ..TestStep::new("BROKEN", &trace)
            })
            .with_step(TestStep::new("NEVER", &trace));

        let result = pipeline
            .execute(&mut context(), &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::StepFailed { step: "BROKEN", .. })
        ));
        assert_eq!(*trace.lock().unwrap(), vec!["BROKEN"]);
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_next_step() {
        let trace = Trace::default();
        let pipeline =
            Pipeline::new(Arc::new(MemoryAuditSink::new())).with_step(TestStep::new("A", &trace));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = pipeline.execute(&mut context(), &cancel).await;

        assert!(matches!(
            result,
            Err(PipelineError::Cancelled { next_step: "A" })
        ));
        assert!(trace.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unaudited_step_records_nothing() {
        let trace = Trace::default();
        let audit = Arc::new(MemoryAuditSink::new());
        let pipeline = Pipeline::new(audit.clone()).with_step(TestStep {
            audited: false,
            ..TestStep::new("QUIET", &trace)
        });

        pipeline
            .execute(&mut context(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*trace.lock().unwrap(), vec!["QUIET"]);
        assert!(audit.events().is_empty());
    }

    #[test]
    fn test_typed_artifact_access() {
        let mut context = context();
        context.set_text("XML", "<Root/>".to_owned());
        context.set_bytes("PDF", Bytes::from_static(b"%PDF"));

        assert_eq!(context.text("XML"), Ok("<Root/>"));
        assert_eq!(context.bytes("PDF"), Ok(&Bytes::from_static(b"%PDF")));
        assert_eq!(
            context.bytes("XML"),
            Err(ArtifactError::WrongType {
                name: "XML".to_owned(),
                expected: "bytes",
                found: "text"
            })
        );
        assert_eq!(
            context.text("MISSING"),
            Err(ArtifactError::NotFound("MISSING".to_owned()))
        );
        assert_eq!(context.artifact_names().collect::<Vec<_>>(), vec!["PDF", "XML"]);
    }

    #[test]
    fn test_context_from_notification() {
        let item = NotificationItem::new(
            NotificationChannel::Broker,
            json!({"topic": "orders", "raw": "{\"order\": 7}"}).to_string(),
            3,
        );

        let context = ProcessingContext::from_notification(&item).unwrap();

        assert_eq!(context.notification_id, item.id);
        assert_eq!(context.channel, NotificationChannel::Broker);
        assert_eq!(context.document["order"], 7);
        assert_eq!(context.envelope["topic"], "orders");

        let broken = NotificationItem::new(NotificationChannel::File, "{}".to_owned(), 3);
        assert!(matches!(
            ProcessingContext::from_notification(&broken),
            Err(ContextError::Envelope(EnvelopeError::MissingRaw))
        ));
    }
}
