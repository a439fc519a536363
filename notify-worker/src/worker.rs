use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time;

use dashmap::DashSet;
use notify_common::health::HealthHandle;
use notify_common::notification::{NotificationId, NotificationItem, NotificationState};
use notify_common::pipeline::{Pipeline, PipelineReport, ProcessingContext};
use notify_common::queue::{NotificationQueue, QueueError};
use notify_common::repository::{NotificationRepository, RepositoryError};
use notify_common::validator::RuleValidator;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DiscoveryError, ProcessingError};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// An identifier for this engine, used in logs.
    pub name: String,
    /// The interval for polling the repository.
    pub poll_interval: time::Duration,
    /// The maximum number of notifications fetched in one poll.
    pub fetch_batch_size: u32,
    /// Number of processing workers, and so the cap on concurrently running pipelines.
    pub max_parallelism: NonZeroUsize,
    pub queue_capacity: NonZeroUsize,
}

/// Live counters of the processing workers.
#[derive(Debug, Default)]
pub struct EngineStats {
    busy: AtomicUsize,
    peak_busy: AtomicUsize,
}

impl EngineStats {
    /// Workers currently running a pipeline.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// The highest number of pipelines that ever ran at the same time.
    pub fn peak_busy(&self) -> usize {
        self.peak_busy.load(Ordering::SeqCst)
    }

    fn enter(&self) -> usize {
        let busy = self.busy.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_busy.fetch_max(busy, Ordering::SeqCst);
        busy
    }

    fn leave(&self) -> usize {
        self.busy.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }
}

/// Drives notifications from the repository through validation and the processing pipeline.
///
/// A single discovery loop polls the repository, gates every notification through the rule
/// engine and admits valid ones into a bounded queue. A fixed pool of processing workers drains
/// that queue. A notification is tracked as in flight from admission until its worker is done
/// with it, so later polls never hand it out a second time.
pub struct NotificationEngine {
    config: EngineConfig,
    repository: Arc<dyn NotificationRepository>,
    validator: Arc<RuleValidator>,
    processor: Processor,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

impl NotificationEngine {
    pub fn new(
        config: EngineConfig,
        repository: Arc<dyn NotificationRepository>,
        validator: Arc<RuleValidator>,
        pipeline: Pipeline,
        liveness: HealthHandle,
    ) -> Self {
        let processor = Processor {
            repository: repository.clone(),
            pipeline: Arc::new(pipeline),
            queue: NotificationQueue::new(config.queue_capacity),
            in_flight: Arc::new(DashSet::new()),
            stats: Arc::new(EngineStats::default()),
        };

        Self {
            config,
            repository,
            validator,
            processor,
            liveness,
        }
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.processor.stats.clone()
    }

    pub fn queue(&self) -> &NotificationQueue {
        &self.processor.queue
    }

    /// Run until `cancel` fires, then wait for every processing worker to finish the
    /// notification it holds.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.max_parallelism.get() {
            workers.spawn(self.processor.clone().work(worker_id, cancel.clone()));
        }

        info!(
            "{} started with {} processing workers",
            self.config.name,
            self.config.max_parallelism.get()
        );

        self.discover(&cancel).await;

        info!("{} draining in-flight notifications", self.config.name);
        while let Some(result) = workers.join_next().await {
            if let Err(error) = result {
                error!("processing worker failed: {}", error);
            }
        }
        info!("{} stopped", self.config.name);
    }

    async fn discover(&self, cancel: &CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.liveness.report_healthy();

            match self.poll_once(cancel).await {
                Ok(admitted) if admitted > 0 => debug!("admitted {} notifications", admitted),
                Ok(_) => {}
                Err(DiscoveryError::QueueError(QueueError::Cancelled)) => break,
                Err(error) => error!("error while polling for notifications: {}", error),
            }
        }
    }

    /// Fetch one batch of eligible notifications and admit the valid ones into the queue.
    /// Returns how many were admitted. Suspends while the queue is full.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<usize, DiscoveryError> {
        let items = self
            .repository
            .fetch_pending(self.config.fetch_batch_size)
            .await?;
        metrics::counter!("notify_fetched_total").increment(items.len() as u64);

        let mut admitted = 0;
        for item in items {
            if self.processor.in_flight.contains(&item.id) {
                continue;
            }

            let evaluation = self.validator.validate(item.id, &item.payload);
            if !evaluation.is_valid {
                match self
                    .repository
                    .mark_failed_perm(item.id, &evaluation.violations_json())
                    .await
                {
                    Ok(()) => {
                        metrics::counter!("notify_rejected_total").increment(1);
                        info!(
                            notification_id = %item.id,
                            "rejected with {} rule violations",
                            evaluation.violations.len()
                        );
                    }
                    Err(error) => warn!(
                        notification_id = %item.id,
                        "failed to reject notification: {}", error
                    ),
                }
                continue;
            }

            // The item must be Queued before any worker can see it, or mark_processing races.
            let slot = self.processor.queue.reserve(cancel).await?;
            if let Err(error) = self.repository.mark_queued(item.id).await {
                warn!(
                    notification_id = %item.id,
                    "failed to queue notification: {}", error
                );
                continue;
            }

            self.processor.in_flight.insert(item.id);
            slot.send(NotificationItem {
                state: NotificationState::Queued,
                ..item
            });
            admitted += 1;
        }

        metrics::counter!("notify_queued_total").increment(admitted as u64);
        metrics::gauge!("notify_queue_depth").set(self.processor.queue.len() as f64);

        Ok(admitted)
    }
}

/// The state shared by every processing worker.
#[derive(Clone)]
struct Processor {
    repository: Arc<dyn NotificationRepository>,
    pipeline: Arc<Pipeline>,
    queue: NotificationQueue,
    in_flight: Arc<DashSet<NotificationId>>,
    stats: Arc<EngineStats>,
}

impl Processor {
    async fn work(self, worker_id: usize, cancel: CancellationToken) {
        while let Some(item) = self.queue.dequeue(&cancel).await {
            self.process(item, &cancel).await;
        }
        debug!(worker_id, "processing worker stopped");
    }

    async fn process(&self, item: NotificationItem, cancel: &CancellationToken) {
        let _in_flight = InFlight::enter(self, item.id);

        if let Err(error) = self.repository.mark_processing(item.id).await {
            if matches!(error, RepositoryError::InvalidTransition { .. }) {
                warn!(notification_id = %item.id, "skipping notification: {}", error);
            } else {
                error!(
                    notification_id = %item.id,
                    "failed to mark notification as processing: {}", error
                );
            }
            return;
        }

        let start = time::Instant::now();
        let result = self.run_pipeline(&item, cancel).await;
        metrics::histogram!("notify_pipeline_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(report) => match self.repository.mark_completed(item.id).await {
                Ok(()) => {
                    metrics::counter!("notify_completed_total").increment(1);
                    info!(
                        notification_id = %item.id,
                        "completed after {} steps", report.steps.len()
                    );
                }
                Err(error) => {
                    error!(
                        notification_id = %item.id,
                        "failed to mark notification as completed: {}", error
                    );
                    // Never leave the notification stranded in Processing.
                    self.record_failure(item.id, &format!("completion not recorded: {error}"))
                        .await;
                }
            },
            Err(error) => self.record_failure(item.id, &error.to_string()).await,
        }
    }

    async fn record_failure(&self, id: NotificationId, reason: &str) {
        match self.repository.mark_failed(id, reason, false).await {
            Ok(state) => {
                metrics::counter!("notify_failed_total", "state" => state.to_string())
                    .increment(1);
                warn!(notification_id = %id, %state, "processing failed: {}", reason);
            }
            Err(error) => error!(
                notification_id = %id,
                "failed to record processing failure '{}': {}", reason, error
            ),
        }
    }

    async fn run_pipeline(
        &self,
        item: &NotificationItem,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport, ProcessingError> {
        let mut context = ProcessingContext::from_notification(item)?;
        let report = self.pipeline.execute(&mut context, cancel).await?;
        Ok(report)
    }
}

/// Marks a worker busy with a notification until dropped.
struct InFlight<'a> {
    id: NotificationId,
    processor: &'a Processor,
}

impl<'a> InFlight<'a> {
    fn enter(processor: &'a Processor, id: NotificationId) -> Self {
        let busy = processor.stats.enter();
        metrics::gauge!("notify_workers_busy").set(busy as f64);
        Self { id, processor }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        _ = self.processor.in_flight.remove(&self.id);
        let busy = self.processor.stats.leave();
        metrics::gauge!("notify_workers_busy").set(busy as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use notify_common::audit::MemoryAuditSink;
    use notify_common::health::HealthRegistry;
    use notify_common::notification::NotificationChannel;
    use notify_common::pipeline::{ProcessingStep, StepError};
    use notify_common::repository::{MemoryNotificationRepository, RepositoryResult};
    use notify_common::retry::RetryPolicy;
    use notify_common::rules::{RuleDefinition, Ruleset, StaticRuleset};
    use serde_json::json;
    use std::time::Duration;

    /// Sleeps, and tracks how many instances run at the same time.
    struct SlowStep {
        delay: Duration,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProcessingStep for SlowStep {
        fn name(&self) -> &'static str {
            "SLOW"
        }

        async fn execute(
            &self,
            _context: &mut ProcessingContext,
            _cancel: &CancellationToken,
        ) -> Result<(), StepError> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingStep;

    #[async_trait]
    impl ProcessingStep for FailingStep {
        fn name(&self) -> &'static str {
            "FAILING"
        }

        async fn execute(
            &self,
            _context: &mut ProcessingContext,
            _cancel: &CancellationToken,
        ) -> Result<(), StepError> {
            Err(StepError::Delivery("connection refused".to_owned()))
        }
    }

    /// Delegates to a memory repository, but refuses the first `failures` completions.
    struct FlakyCompletion {
        inner: Arc<MemoryNotificationRepository>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl NotificationRepository for FlakyCompletion {
        async fn fetch_pending(&self, limit: u32) -> RepositoryResult<Vec<NotificationItem>> {
            self.inner.fetch_pending(limit).await
        }

        async fn insert(&self, item: &NotificationItem) -> RepositoryResult<()> {
            self.inner.insert(item).await
        }

        async fn get(&self, id: NotificationId) -> RepositoryResult<NotificationItem> {
            self.inner.get(id).await
        }

        async fn mark_queued(&self, id: NotificationId) -> RepositoryResult<()> {
            self.inner.mark_queued(id).await
        }

        async fn mark_processing(&self, id: NotificationId) -> RepositoryResult<()> {
            self.inner.mark_processing(id).await
        }

        async fn mark_sent(&self, id: NotificationId) -> RepositoryResult<()> {
            self.inner.mark_sent(id).await
        }

        async fn mark_completed(&self, id: NotificationId) -> RepositoryResult<()> {
            let refused = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if refused {
                return Err(RepositoryError::NotFound(id));
            }
            self.inner.mark_completed(id).await
        }

        async fn mark_failed(
            &self,
            id: NotificationId,
            error: &str,
            permanent: bool,
        ) -> RepositoryResult<NotificationState> {
            self.inner.mark_failed(id, error, permanent).await
        }

        async fn mark_failed_perm(&self, id: NotificationId, reason: &str) -> RepositoryResult<()> {
            self.inner.mark_failed_perm(id, reason).await
        }

        async fn mark_dead_letter(&self, id: NotificationId, reason: &str) -> RepositoryResult<()> {
            self.inner.mark_dead_letter(id, reason).await
        }
    }

    struct Harness {
        engine: Arc<NotificationEngine>,
        repository: Arc<MemoryNotificationRepository>,
        audit: Arc<MemoryAuditSink>,
    }

    fn engine_with(
        repository: Arc<dyn NotificationRepository>,
        pipeline: impl FnOnce(Pipeline) -> Pipeline,
        max_parallelism: usize,
    ) -> (Arc<NotificationEngine>, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let rulesets = Arc::new(StaticRuleset::new(Ruleset::new(
            "test",
            "1",
            vec![RuleDefinition::required("R1", "name")],
        )));
        let validator = Arc::new(RuleValidator::new(rulesets, audit.clone()));
        let liveness = HealthRegistry::new("liveness")
            .register("engine", ::time::Duration::seconds(30));

        let engine = NotificationEngine::new(
            EngineConfig {
                name: "test-engine".to_owned(),
                poll_interval: Duration::from_millis(10),
                fetch_batch_size: 50,
                max_parallelism: NonZeroUsize::new(max_parallelism).unwrap(),
                queue_capacity: NonZeroUsize::new(4).unwrap(),
            },
            repository,
            validator,
            pipeline(Pipeline::new(audit.clone())),
            liveness,
        );

        (Arc::new(engine), audit)
    }

    fn harness(pipeline: impl FnOnce(Pipeline) -> Pipeline, max_parallelism: usize) -> Harness {
        let repository = Arc::new(MemoryNotificationRepository::new(RetryPolicy::default()));
        let (engine, audit) = engine_with(repository.clone(), pipeline, max_parallelism);

        Harness {
            engine,
            repository,
            audit,
        }
    }

    async fn insert(repository: &MemoryNotificationRepository, document: serde_json::Value) -> NotificationId {
        let payload = json!({ "source": "test", "raw": document.to_string() }).to_string();
        let item = NotificationItem::new(NotificationChannel::File, payload, 3);
        repository.insert(&item).await.unwrap();
        item.id
    }

    async fn wait_until<F>(check: F)
    where
        F: Fn() -> bool,
    {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(check(), "condition not met in time");
    }

    fn states(repository: &MemoryNotificationRepository) -> Vec<NotificationState> {
        repository.all().into_iter().map(|item| item.state).collect()
    }

    #[tokio::test]
    async fn test_valid_notification_completes() {
        let Harness {
            engine,
            repository,
            audit,
        } = harness(|pipeline| pipeline, 2);
        let id = insert(&repository, json!({"name": "Ada"})).await;
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let engine = engine.clone();
            let cancel = cancel.clone();
            async move { engine.run(cancel).await }
        });

        wait_until(|| states(&repository) == vec![NotificationState::Completed]).await;
        cancel.cancel();
        run.await.unwrap();

        let events = audit.events_for(id);
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.stage == "RULE_ENGINE"));
    }

    #[tokio::test]
    async fn test_invalid_notification_is_rejected() {
        let Harness {
            engine, repository, ..
        } = harness(|pipeline| pipeline, 1);
        let id = insert(&repository, json!({"other": 1})).await;

        let admitted = engine.poll_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(admitted, 0);
        let stored = repository.get(id).await.unwrap();
        assert_eq!(stored.state, NotificationState::FailedPerm);
        let violations: serde_json::Value =
            serde_json::from_str(stored.rule_violations.as_deref().unwrap()).unwrap();
        assert_eq!(violations[0]["ruleId"], "R1");
        assert_eq!(violations[0]["field"], "name");
    }

    #[tokio::test]
    async fn test_admitted_notifications_are_not_fetched_twice() {
        let Harness {
            engine, repository, ..
        } = harness(|pipeline| pipeline, 1);
        let cancel = CancellationToken::new();
        insert(&repository, json!({"name": "a"})).await;
        insert(&repository, json!({"name": "b"})).await;

        assert_eq!(engine.poll_once(&cancel).await.unwrap(), 2);
        assert_eq!(engine.queue().len(), 2);
        assert_eq!(
            states(&repository),
            vec![NotificationState::Queued, NotificationState::Queued]
        );

        // Still Queued in the repository, but already in flight.
        assert_eq!(engine.poll_once(&cancel).await.unwrap(), 0);
        assert_eq!(engine.queue().len(), 2);
    }

    #[tokio::test]
    async fn test_pipeline_failure_schedules_retry() {
        let Harness {
            engine, repository, ..
        } = harness(|pipeline| pipeline.with_step(FailingStep), 1);
        let id = insert(&repository, json!({"name": "Ada"})).await;
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let engine = engine.clone();
            let cancel = cancel.clone();
            async move { engine.run(cancel).await }
        });

        wait_until(|| states(&repository) == vec![NotificationState::FailedTemp]).await;
        cancel.cancel();
        run.await.unwrap();

        let stored = repository.get(id).await.unwrap();
        assert_eq!(stored.retry_count, 1);
        assert!(stored.next_retry_at.is_some());
        assert!(stored
            .last_error
            .unwrap()
            .contains("connection refused"));
    }

    #[tokio::test]
    async fn test_unrecorded_completion_is_retried_later() {
        let memory = Arc::new(MemoryNotificationRepository::new(RetryPolicy::default()));
        let repository = Arc::new(FlakyCompletion {
            inner: memory.clone(),
            failures: AtomicUsize::new(1),
        });
        let (engine, _audit) = engine_with(repository, |pipeline| pipeline, 1);
        let id = insert(&memory, json!({"name": "Ada"})).await;
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let engine = engine.clone();
            let cancel = cancel.clone();
            async move { engine.run(cancel).await }
        });

        wait_until(|| states(&memory) == vec![NotificationState::FailedTemp]).await;
        cancel.cancel();
        run.await.unwrap();

        let stored = memory.get(id).await.unwrap();
        assert_ne!(stored.state, NotificationState::Processing);
        assert_eq!(stored.state, NotificationState::FailedTemp);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.last_error.unwrap().contains("completion not recorded"));
        assert_eq!(engine.stats().busy(), 0);
    }

    #[tokio::test]
    async fn test_parallelism_is_capped() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let step = SlowStep {
            delay: Duration::from_millis(30),
            running: running.clone(),
            peak: peak.clone(),
        };
        let Harness {
            engine, repository, ..
        } = harness(|pipeline| pipeline.with_step(step), 3);
        for n in 0..12 {
            insert(&repository, json!({"name": format!("n{n}")})).await;
        }
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let engine = engine.clone();
            let cancel = cancel.clone();
            async move { engine.run(cancel).await }
        });

        wait_until(|| {
            states(&repository)
                .iter()
                .all(|state| *state == NotificationState::Completed)
        })
        .await;
        cancel.cancel();
        run.await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
        assert!(engine.stats().peak_busy() <= 3);
        assert_eq!(engine.stats().busy(), 0);
    }

    #[tokio::test]
    async fn test_cancel_drains_in_flight_work() {
        let step = SlowStep {
            delay: Duration::from_millis(200),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        };
        let Harness {
            engine, repository, ..
        } = harness(|pipeline| pipeline.with_step(step), 2);
        for n in 0..6 {
            insert(&repository, json!({"name": format!("n{n}")})).await;
        }
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let engine = engine.clone();
            let cancel = cancel.clone();
            async move { engine.run(cancel).await }
        });

        wait_until(|| states(&repository).contains(&NotificationState::Processing)).await;
        cancel.cancel();
        run.await.unwrap();

        let states = states(&repository);
        assert!(!states.contains(&NotificationState::Processing));
        assert!(states.contains(&NotificationState::Completed));
        assert_eq!(engine.stats().busy(), 0);
    }
}
