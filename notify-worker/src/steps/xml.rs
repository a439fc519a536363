use std::fmt::Write;

use async_trait::async_trait;
use notify_common::pipeline::{ProcessingContext, ProcessingStep, StepError};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// Artifact holding the XML rendition of the business document.
pub const XML_ARTIFACT: &str = "XML";
const ARRAY_ITEM_ELEMENT: &str = "Item";

/// Renders the business document as XML.
///
/// Object keys become child elements, array entries become `<Item>` elements and scalars become
/// escaped text. `null` renders as an empty element.
pub struct XmlConversionStep {
    root_element: String,
}

impl XmlConversionStep {
    pub fn new(root_element: &str) -> Self {
        Self {
            root_element: root_element.to_owned(),
        }
    }
}

#[async_trait]
impl ProcessingStep for XmlConversionStep {
    fn name(&self) -> &'static str {
        "XML_CONVERSION"
    }

    async fn execute(
        &self,
        context: &mut ProcessingContext,
        _cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let xml = to_xml(&self.root_element, &context.document)?;
        context.set_text(XML_ARTIFACT, xml);
        Ok(())
    }
}

pub fn to_xml(root_element: &str, document: &Map<String, Value>) -> Result<String, StepError> {
    let mut xml = String::new();
    write_object(&mut xml, root_element, document)?;
    Ok(xml)
}

fn write_element(xml: &mut String, name: &str, value: &Value) -> Result<(), StepError> {
    match value {
        Value::Object(object) => write_object(xml, name, object),
        Value::Array(items) => {
            open(xml, name)?;
            for item in items {
                write_element(xml, ARRAY_ITEM_ELEMENT, item)?;
            }
            close(xml, name);
            Ok(())
        }
        Value::Null => {
            check_name(name)?;
            _ = write!(xml, "<{name} />");
            Ok(())
        }
        Value::String(text) => write_text(xml, name, text),
        scalar => write_text(xml, name, &scalar.to_string()),
    }
}

fn write_object(xml: &mut String, name: &str, object: &Map<String, Value>) -> Result<(), StepError> {
    open(xml, name)?;
    for (key, value) in object {
        write_element(xml, key, value)?;
    }
    close(xml, name);
    Ok(())
}

fn write_text(xml: &mut String, name: &str, text: &str) -> Result<(), StepError> {
    open(xml, name)?;
    for c in text.chars() {
        match c {
            '<' => xml.push_str("&lt;"),
            '>' => xml.push_str("&gt;"),
            '&' => xml.push_str("&amp;"),
            '"' => xml.push_str("&quot;"),
            '\'' => xml.push_str("&apos;"),
            c => xml.push(c),
        }
    }
    close(xml, name);
    Ok(())
}

fn open(xml: &mut String, name: &str) -> Result<(), StepError> {
    check_name(name)?;
    _ = write!(xml, "<{name}>");
    Ok(())
}

fn close(xml: &mut String, name: &str) {
    _ = write!(xml, "</{name}>");
}

/// A conservative subset of XML names: a letter or underscore, then letters, digits, `_`, `-`, `.`.
fn check_name(name: &str) -> Result<(), StepError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.to_ascii_lowercase().starts_with("xml");

    if valid {
        Ok(())
    } else {
        Err(StepError::Other(format!("'{name}' is not a valid XML element name")))
    }
}
