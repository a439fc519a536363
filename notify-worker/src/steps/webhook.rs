use std::time;

use async_trait::async_trait;
use notify_common::pipeline::{ProcessingContext, ProcessingStep, StepError, StepPolicy};
use reqwest::header;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::steps::xml::XML_ARTIFACT;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookBody<'a> {
    notification_id: Uuid,
    channel: String,
    document: &'a Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    xml: Option<&'a str>,
}

/// POSTs the processed notification to an HTTP endpoint.
///
/// Delivery problems never fail the notification: the step is non-fatal and its failures are
/// only audited.
pub struct WebhookDeliveryStep {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl WebhookDeliveryStep {
    pub fn new(url: reqwest::Url, timeout: time::Duration) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Notify Worker")
            .timeout(timeout)
            .build()?;

        Ok(Self { client, url })
    }

    async fn deliver(&self, context: &ProcessingContext) -> Result<(), StepError> {
        let xml = context.text(XML_ARTIFACT).ok();
        let body = WebhookBody {
            notification_id: context.notification_id,
            channel: context.channel.to_string(),
            document: &context.document,
            xml,
        };

        let response = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|error| StepError::Delivery(error.to_string()))?;

        response
            .error_for_status()
            .map(|_| ())
            .map_err(|error| StepError::Delivery(error.to_string()))
    }
}

#[async_trait]
impl ProcessingStep for WebhookDeliveryStep {
    fn name(&self) -> &'static str {
        "WEBHOOK_DELIVERY"
    }

    fn policy(&self) -> StepPolicy {
        StepPolicy::NonFatal
    }

    async fn execute(
        &self,
        context: &mut ProcessingContext,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(StepError::Cancelled),
            result = self.deliver(context) => result,
        }
    }
}
