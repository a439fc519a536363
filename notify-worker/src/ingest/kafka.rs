use std::sync::Arc;

use chrono::Utc;
use notify_common::envelope::Envelope;
use notify_common::notification::{NotificationChannel, NotificationItem};
use notify_common::repository::NotificationRepository;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::IngestionConfig;
use crate::ingest::IngestionError;

/// Consumes a topic and stores every message as a New notification on the `Broker` channel.
///
/// Offsets are committed after the notification is stored, so a crash in between can ingest a
/// message twice but never loses one.
pub struct KafkaIngestion {
    repository: Arc<dyn NotificationRepository>,
    consumer: StreamConsumer,
    topic: String,
    max_retry: i32,
}

impl KafkaIngestion {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        config: &IngestionConfig,
        max_retry: i32,
    ) -> Result<Self, IngestionError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.kafka_hosts.as_str())
            .set("group.id", config.kafka_consumer_group.as_str())
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[config.kafka_topic.as_str()])?;

        Ok(Self {
            repository,
            consumer,
            topic: config.kafka_topic.as_str().to_owned(),
            max_retry,
        })
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("consuming notifications from {}", self.topic);

        loop {
            let message = tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                message = self.consumer.recv() => message,
            };

            let message = match message {
                Ok(message) => message,
                Err(error) => {
                    error!("error receiving kafka message: {}", error);
                    continue;
                }
            };

            let raw = match message.payload_view::<str>() {
                Some(Ok(raw)) => raw,
                Some(Err(error)) => {
                    warn!(offset = message.offset(), "dropping non-utf8 message: {}", error);
                    self.commit(&message);
                    continue;
                }
                None => {
                    warn!(offset = message.offset(), "dropping empty message");
                    self.commit(&message);
                    continue;
                }
            };

            let envelope = Envelope::wrap(
                raw,
                json!({
                    "source": "broker",
                    "topic": self.topic,
                    "receivedAt": Utc::now(),
                }),
            );
            let item = NotificationItem::new(
                NotificationChannel::Broker,
                envelope.to_string(),
                self.max_retry,
            );

            // Without a commit the message is redelivered after a restart or rebalance.
            if let Err(error) = self.repository.insert(&item).await {
                error!(offset = message.offset(), "failed to store kafka message: {}", error);
                continue;
            }
            metrics::counter!("notify_ingested_total", "channel" => "broker").increment(1);
            debug!(notification_id = %item.id, offset = message.offset(), "ingested kafka message");
            self.commit(&message);
        }

        info!("kafka ingestion stopped");
    }

    fn commit(&self, message: &rdkafka::message::BorrowedMessage<'_>) {
        if let Err(error) = self.consumer.commit_message(message, CommitMode::Async) {
            warn!("failed to commit kafka offset: {}", error);
        }
    }
}
