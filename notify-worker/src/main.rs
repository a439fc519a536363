//! Ingest notifications, validate them against the active ruleset and run them through the
//! processing pipeline.
use std::sync::Arc;

use envconfig::Envconfig;
use notify_common::audit::{AuditSink, FileAuditSink, TracingAuditSink};
use notify_common::health::HealthRegistry;
use notify_common::metrics::{serve, setup_metrics_recorder};
use notify_common::pgrepo::PgNotificationRepository;
use notify_common::repository::NotificationRepository;
use notify_common::rules::FileRulesetProvider;
use notify_common::validator::RuleValidator;
use notify_worker::config::Config;
use notify_worker::error::WorkerError;
use notify_worker::handlers::app;
use notify_worker::ingest::FileIngestion;
use notify_worker::reload::{forward_hangups, reload_rulesets};
use notify_worker::steps::build_pipeline;
use notify_worker::worker::{EngineConfig, NotificationEngine};
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

async fn shutdown(cancel: CancellationToken) {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
        _ = cancel.cancelled() => return,
    };

    info!("shutting down, waiting for in-flight notifications");
    cancel.cancel();
}

fn init_logging(log_format: &str) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let log_layer = match log_format {
        "json" => tracing_subscriber::fmt::layer().json().boxed(),
        _ => tracing_subscriber::fmt::layer().boxed(),
    };

    tracing_subscriber::registry()
        .with(log_layer.with_filter(filter))
        .init();
}

#[cfg(feature = "kafka")]
fn spawn_kafka_ingestion(
    tasks: &mut JoinSet<()>,
    repository: Arc<dyn NotificationRepository>,
    config: &Config,
    cancel: CancellationToken,
) -> Result<(), WorkerError> {
    let ingestion = notify_worker::ingest::KafkaIngestion::new(
        repository,
        &config.ingestion,
        config.default_max_retry,
    )?;
    tasks.spawn(ingestion.run(cancel));
    Ok(())
}

#[cfg(not(feature = "kafka"))]
fn spawn_kafka_ingestion(
    _tasks: &mut JoinSet<()>,
    _repository: Arc<dyn NotificationRepository>,
    _config: &Config,
    _cancel: CancellationToken,
) -> Result<(), WorkerError> {
    Err(notify_worker::ingest::IngestionError::KafkaUnavailable.into())
}

#[cfg(feature = "sftp")]
fn spawn_sftp_ingestion(
    tasks: &mut JoinSet<()>,
    repository: Arc<dyn NotificationRepository>,
    config: &Config,
    cancel: CancellationToken,
) -> Result<(), WorkerError> {
    use notify_worker::ingest::sftp::{SshConnector, SshCredentials};
    use notify_worker::ingest::SftpIngestion;

    let settings = &config.ingestion;
    let connector = SshConnector::new(SshCredentials {
        host: settings.sftp_host.as_str().to_owned(),
        port: settings.sftp_port,
        username: settings.sftp_username.as_str().to_owned(),
        password: settings.sftp_password.clone(),
        private_key_path: settings
            .sftp_private_key_path
            .as_ref()
            .map(|path| path.as_str().into()),
    });
    let ingestion = SftpIngestion::new(
        repository,
        connector,
        settings.sftp_input_dir.as_str(),
        settings.sftp_archive_dir.as_str(),
        settings.sftp_interval.0,
        config.default_max_retry,
    );
    tasks.spawn(ingestion.run(cancel));
    Ok(())
}

#[cfg(not(feature = "sftp"))]
fn spawn_sftp_ingestion(
    _tasks: &mut JoinSet<()>,
    _repository: Arc<dyn NotificationRepository>,
    _config: &Config,
    _cancel: CancellationToken,
) -> Result<(), WorkerError> {
    Err(notify_worker::ingest::IngestionError::SftpUnavailable.into())
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    let config = Config::init_from_env()?;
    init_logging(&config.log_format);

    let recorder_handle = setup_metrics_recorder()?;

    let repository = PgNotificationRepository::new(
        &config.database_url,
        config.max_pg_connections,
        "notify-worker",
        config.retry_policy.provide(),
    )?;
    if config.run_migrations {
        repository.migrate().await?;
    }
    let repository: Arc<dyn NotificationRepository> = Arc::new(repository);

    let rulesets = Arc::new(FileRulesetProvider::load(&config.ruleset_path)?);

    let (audit, audit_writer) = match &config.audit_log_path {
        Some(path) => {
            let (sink, writer) = FileAuditSink::spawn(path, config.audit_buffer)
                .map_err(WorkerError::AuditLogError)?;
            let sink: Arc<dyn AuditSink> = Arc::new(sink);
            (sink, Some(writer))
        }
        None => {
            let sink: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
            (sink, None)
        }
    };

    let validator = Arc::new(RuleValidator::new(rulesets.clone(), audit.clone()));
    let pipeline = build_pipeline(&config.steps, audit.clone())?;
    info!("processing pipeline: {:?}", pipeline.step_names());

    let liveness = HealthRegistry::new("liveness");
    let liveness_deadline =
        time::Duration::try_from(config.liveness_deadline.0).unwrap_or(time::Duration::MAX);
    let engine = NotificationEngine::new(
        EngineConfig {
            name: config.worker_name.as_str().to_owned(),
            poll_interval: config.poll_interval.0,
            fetch_batch_size: config.fetch_batch_size,
            max_parallelism: config.max_parallelism,
            queue_capacity: config.queue_capacity,
        },
        repository.clone(),
        validator,
        pipeline,
        liveness.register("engine", liveness_deadline),
    );

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown(cancel.clone()));

    let (reload_requests, reloads) = tokio::sync::mpsc::channel(1);
    tokio::spawn(forward_hangups(reload_requests, cancel.clone()));
    tokio::spawn(reload_rulesets(rulesets, reloads, cancel.clone()));

    let mut ingestion = JoinSet::new();
    if config.ingestion.file_enabled {
        let file_ingestion = FileIngestion::new(
            repository.clone(),
            config.ingestion.file_input_dir.as_str(),
            config.ingestion.file_archive_dir.as_str(),
            config.ingestion.file_interval.0,
            config.default_max_retry,
        );
        ingestion.spawn(file_ingestion.run(cancel.clone()));
    }
    if config.ingestion.kafka_enabled {
        spawn_kafka_ingestion(&mut ingestion, repository.clone(), &config, cancel.clone())?;
    }
    if config.ingestion.sftp_enabled {
        spawn_sftp_ingestion(&mut ingestion, repository.clone(), &config, cancel.clone())?;
    }

    let router = app(config.worker_name.as_str(), liveness, Some(recorder_handle));
    let bind = config.bind();
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let stopped = server_cancel.clone();
        let result = serve(router, &bind, async move { stopped.cancelled().await }).await;
        if let Err(ref e) = result {
            error!("http server on {} failed: {}", bind, e);
            server_cancel.cancel();
        }
        result
    });

    engine.run(cancel.clone()).await;
    cancel.cancel();

    while let Some(result) = ingestion.join_next().await {
        result?;
    }
    server.await?.map_err(WorkerError::ServeError)?;

    // The writer drains pending events once the last sink reference is gone.
    drop(engine);
    drop(audit);
    if let Some(writer) = audit_writer {
        writer.await?;
    }

    Ok(())
}
