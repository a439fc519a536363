//! Concrete processing steps and the pipeline assembled from them.
use std::sync::Arc;

use notify_common::audit::AuditSink;
use notify_common::pipeline::Pipeline;
use thiserror::Error;

use crate::config::StepsConfig;

pub mod file_output;
pub mod webhook;
pub mod xml;

pub use file_output::{FileOutputStep, XmlFileOutputStep};
pub use webhook::WebhookDeliveryStep;
pub use xml::XmlConversionStep;

#[derive(Error, Debug)]
pub enum StepSetupError {
    #[error("webhook delivery is enabled but STEP_WEBHOOK_URL is not set")]
    MissingWebhookUrl,
    #[error("invalid webhook url: {0}")]
    InvalidWebhookUrl(String),
    #[error("failed to construct the webhook http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Build the processing pipeline from configuration. Steps run in a fixed order and disabled
/// steps are left out.
pub fn build_pipeline(
    config: &StepsConfig,
    audit: Arc<dyn AuditSink>,
) -> Result<Pipeline, StepSetupError> {
    let mut pipeline = Pipeline::new(audit);

    if config.xml_enabled {
        pipeline = pipeline.with_step(XmlConversionStep::new(config.xml_root_element.as_str()));
    }
    if config.file_output_enabled {
        pipeline = pipeline.with_step(FileOutputStep::new(config.file_output_dir.as_str()));
    }
    if config.xml_output_enabled {
        pipeline = pipeline.with_step(XmlFileOutputStep::new(config.xml_output_dir.as_str()));
    }
    if config.webhook_enabled {
        let url = config
            .webhook_url
            .as_ref()
            .ok_or(StepSetupError::MissingWebhookUrl)?;
        let url = reqwest::Url::parse(url.as_str())
            .map_err(|error| StepSetupError::InvalidWebhookUrl(error.to_string()))?;
        pipeline = pipeline.with_step(WebhookDeliveryStep::new(url, config.webhook_timeout.0)?);
    }

    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use envconfig::Envconfig;
    use notify_common::audit::MemoryAuditSink;
    use std::collections::HashMap;

    fn config(env: &[(&str, &str)]) -> StepsConfig {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        StepsConfig::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn test_default_pipeline_order() {
        let pipeline = build_pipeline(&config(&[]), Arc::new(MemoryAuditSink::new())).unwrap();

        assert_eq!(
            pipeline.step_names(),
            vec!["XML_CONVERSION", "FILE_OUTPUT", "XML_FILE_OUTPUT"]
        );
    }

    #[test]
    fn test_disabled_steps_are_left_out() {
        let pipeline = build_pipeline(
            &config(&[
                ("STEP_XML_ENABLED", "false"),
                ("STEP_XML_OUTPUT_ENABLED", "false"),
                ("STEP_WEBHOOK_ENABLED", "true"),
                ("STEP_WEBHOOK_URL", "http://localhost:8080/hook"),
            ]),
            Arc::new(MemoryAuditSink::new()),
        )
        .unwrap();

        assert_eq!(pipeline.step_names(), vec!["FILE_OUTPUT", "WEBHOOK_DELIVERY"]);
    }

    #[test]
    fn test_webhook_needs_a_url() {
        let result = build_pipeline(
            &config(&[("STEP_WEBHOOK_ENABLED", "true")]),
            Arc::new(MemoryAuditSink::new()),
        );
        assert!(matches!(result, Err(StepSetupError::MissingWebhookUrl)));

        let result = build_pipeline(
            &config(&[("STEP_WEBHOOK_ENABLED", "true"), ("STEP_WEBHOOK_URL", "not a url")]),
            Arc::new(MemoryAuditSink::new()),
        );
        assert!(matches!(result, Err(StepSetupError::InvalidWebhookUrl(_))));
    }
}
