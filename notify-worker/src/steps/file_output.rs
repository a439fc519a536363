use std::path::PathBuf;

use async_trait::async_trait;
use notify_common::pipeline::{ProcessingContext, ProcessingStep, StepError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::steps::xml::XML_ARTIFACT;

/// Artifact holding the path the document was written to.
pub const FILE_OUTPUT_PATH_ARTIFACT: &str = "FILE_OUTPUT_PATH";
/// Artifact holding the path the XML rendition was written to.
pub const XML_OUTPUT_PATH_ARTIFACT: &str = "XML_OUTPUT_PATH";

/// Writes the business document, pretty-printed, to `<dir>/<notification id>.json`.
pub struct FileOutputStep {
    dir: PathBuf,
}

impl FileOutputStep {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ProcessingStep for FileOutputStep {
    fn name(&self) -> &'static str {
        "FILE_OUTPUT"
    }

    async fn execute(
        &self,
        context: &mut ProcessingContext,
        _cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let json = serde_json::to_string_pretty(&context.document)?;
        let path = self.dir.join(format!("{}.json", context.notification_id));

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, json).await?;
        debug!(notification_id = %context.notification_id, "document written to {}", path.display());

        context.set_text(FILE_OUTPUT_PATH_ARTIFACT, path.display().to_string());
        Ok(())
    }
}

/// Writes the `XML` artifact to `<dir>/<notification id>.xml`. Skipped when there is no XML.
pub struct XmlFileOutputStep {
    dir: PathBuf,
}

impl XmlFileOutputStep {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ProcessingStep for XmlFileOutputStep {
    fn name(&self) -> &'static str {
        "XML_FILE_OUTPUT"
    }

    fn requires(&self) -> &[&'static str] {
        &[XML_ARTIFACT]
    }

    fn audited(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        context: &mut ProcessingContext,
        _cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let xml = context.text(XML_ARTIFACT)?.to_owned();
        let path = self.dir.join(format!("{}.xml", context.notification_id));

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, xml).await?;

        context.set_text(XML_OUTPUT_PATH_ARTIFACT, path.display().to_string());
        Ok(())
    }
}
