use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time;

use chrono::Utc;
use notify_common::envelope::Envelope;
use notify_common::notification::{NotificationChannel, NotificationItem};
use notify_common::repository::NotificationRepository;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ingest::IngestionError;

/// Picks up files dropped into a directory.
///
/// Every regular file becomes one New notification on the `File` channel, wrapped in an envelope
/// carrying the file name and receive time. Ingested files are moved to the archive directory.
pub struct FileIngestion {
    repository: Arc<dyn NotificationRepository>,
    input_dir: PathBuf,
    archive_dir: PathBuf,
    interval: time::Duration,
    max_retry: i32,
}

impl FileIngestion {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        input_dir: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
        interval: time::Duration,
        max_retry: i32,
    ) -> Self {
        Self {
            repository,
            input_dir: input_dir.into(),
            archive_dir: archive_dir.into(),
            interval,
            max_retry,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("watching {} for notifications", self.input_dir.display());

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.scan_once().await {
                Ok(0) => {}
                Ok(ingested) => debug!("ingested {} files", ingested),
                Err(error) => error!("file ingestion scan failed: {}", error),
            }
        }
        info!("file ingestion stopped");
    }

    /// Ingest every file currently in the input directory, oldest name first.
    /// Files that fail are logged and left in place for the next scan.
    pub async fn scan_once(&self) -> Result<usize, IngestionError> {
        tokio::fs::create_dir_all(&self.input_dir)
            .await
            .map_err(|error| IngestionError::io(&self.input_dir, error))?;
        tokio::fs::create_dir_all(&self.archive_dir)
            .await
            .map_err(|error| IngestionError::io(&self.archive_dir, error))?;

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.input_dir)
            .await
            .map_err(|error| IngestionError::io(&self.input_dir, error))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| IngestionError::io(&self.input_dir, error))?
        {
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            let is_file = entry.file_type().await.is_ok_and(|kind| kind.is_file());
            if is_file && !hidden {
                files.push(entry.path());
            }
        }
        files.sort();

        let mut ingested = 0;
        for path in files {
            match self.ingest_file(&path).await {
                Ok(()) => ingested += 1,
                Err(error) => warn!("skipping {}: {}", path.display(), error),
            }
        }

        Ok(ingested)
    }

    async fn ingest_file(&self, path: &Path) -> Result<(), IngestionError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|error| IngestionError::io(path, error))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let envelope = Envelope::wrap(
            &raw,
            json!({
                "source": "file",
                "fileName": file_name,
                "receivedAt": Utc::now(),
            }),
        );
        let item = NotificationItem::new(
            NotificationChannel::File,
            envelope.to_string(),
            self.max_retry,
        );
        self.repository.insert(&item).await?;
        metrics::counter!("notify_ingested_total", "channel" => "file").increment(1);

        let archived = self.archive_dir.join(format!("{}_{}", item.id, file_name));
        if let Err(error) = tokio::fs::rename(path, &archived).await {
            // The notification is stored: a file left behind would be ingested again.
            error!(
                notification_id = %item.id,
                "failed to archive {}, removing it: {}", path.display(), error
            );
            tokio::fs::remove_file(path)
                .await
                .map_err(|error| IngestionError::io(path, error))?;
        }

        info!(notification_id = %item.id, "ingested {}", file_name);
        Ok(())
    }
}
