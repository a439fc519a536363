//! Decoding of the transport envelope wrapped around every payload.
//!
//! Ingestion stores `{"raw": "<business document as a JSON string>", ...}`. The business document
//! is double-encoded so the original transport payload survives untouched next to the metadata
//! added at ingestion.
use serde_json::{Map, Value};
use thiserror::Error;

/// Name of the envelope field carrying the encoded business document.
pub const RAW_FIELD: &str = "raw";

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Envelope JSON is invalid: {0}")]
    InvalidEnvelope(serde_json::Error),
    #[error("Missing 'raw' field in payload envelope")]
    MissingRaw,
    #[error("'raw' field must be a string")]
    RawNotString,
    #[error("Raw payload is empty")]
    EmptyRaw,
    #[error("Business payload is not valid JSON: {0}")]
    InvalidDocument(serde_json::Error),
    #[error("Business payload must be a JSON object")]
    DocumentNotObject,
}

/// A decoded envelope together with the business document it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub envelope: Value,
    pub document: Map<String, Value>,
}

impl Envelope {
    pub fn decode(payload_json: &str) -> Result<Self, EnvelopeError> {
        let envelope: Value =
            serde_json::from_str(payload_json).map_err(EnvelopeError::InvalidEnvelope)?;

        let raw = match envelope.get(RAW_FIELD) {
            None => return Err(EnvelopeError::MissingRaw),
            Some(Value::String(raw)) => raw,
            Some(_) => return Err(EnvelopeError::RawNotString),
        };

        if raw.trim().is_empty() {
            return Err(EnvelopeError::EmptyRaw);
        }

        let document = match serde_json::from_str(raw).map_err(EnvelopeError::InvalidDocument)? {
            Value::Object(document) => document,
            _ => return Err(EnvelopeError::DocumentNotObject),
        };

        Ok(Self { envelope, document })
    }

    /// Wrap a raw transport payload with ingestion metadata.
    /// `metadata` must be a JSON object; anything else is replaced by an empty one.
    pub fn wrap(raw: &str, metadata: Value) -> Value {
        let mut object = match metadata {
            Value::Object(object) => object,
            _ => Map::new(),
        };
        object.insert(RAW_FIELD.to_owned(), Value::String(raw.to_owned()));
        Value::Object(object)
    }
}
