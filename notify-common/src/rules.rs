//! # Rules
//!
//! Declarative rulesets and the providers that hand out cached, immutable snapshots of them.
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RulesetError {
    #[error("failed to read ruleset {path}: {error}")]
    ReadError { path: PathBuf, error: io::Error },
    #[error("failed to parse ruleset {path}: {error}")]
    ParseError {
        path: PathBuf,
        error: serde_json::Error,
    },
}

/// The kind of check a rule performs. Unknown kinds are kept verbatim so they can be reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RuleKind {
    Required,
    Length,
    Enum,
    Unsupported(String),
}

impl From<String> for RuleKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "required" => RuleKind::Required,
            "length" => RuleKind::Length,
            "enum" => RuleKind::Enum,
            _ => RuleKind::Unsupported(kind),
        }
    }
}

impl From<RuleKind> for String {
    fn from(kind: RuleKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RuleKind::Required => write!(f, "required"),
            RuleKind::Length => write!(f, "length"),
            RuleKind::Enum => write!(f, "enum"),
            RuleKind::Unsupported(kind) => write!(f, "{kind}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    pub rule_id: String,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    pub field: String,
    /// Lower length bound for `length` rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<usize>,
    /// Upper length bound for `length` rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<usize>,
    /// Allowed values for `enum` rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
    /// Overrides the default violation message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RuleDefinition {
    pub fn required(rule_id: &str, field: &str) -> Self {
        Self::new(rule_id, RuleKind::Required, field)
    }

    pub fn length(rule_id: &str, field: &str, min: Option<usize>, max: Option<usize>) -> Self {
        Self {
            min,
            max,
            ..Self::new(rule_id, RuleKind::Length, field)
        }
    }

    pub fn one_of(rule_id: &str, field: &str, values: &[&str]) -> Self {
        Self {
            values: Some(values.iter().map(|v| (*v).to_owned()).collect()),
            ..Self::new(rule_id, RuleKind::Enum, field)
        }
    }

    pub fn new(rule_id: &str, kind: RuleKind, field: &str) -> Self {
        Self {
            rule_id: rule_id.to_owned(),
            kind,
            field: field.to_owned(),
            min: None,
            max: None,
            values: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_owned());
        self
    }
}

/// A versioned, ordered collection of rules. Rules are applied in the order listed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ruleset {
    #[serde(default)]
    pub ruleset_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

impl Ruleset {
    pub fn new(ruleset_id: &str, version: &str, rules: Vec<RuleDefinition>) -> Self {
        Self {
            ruleset_id: ruleset_id.to_owned(),
            version: version.to_owned(),
            rules,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Hands out the ruleset currently in effect.
///
/// Callers get a shared read-only snapshot and keep using it for the whole evaluation, even if a
/// newer snapshot is installed meanwhile.
pub trait RulesetProvider: Send + Sync {
    fn current(&self) -> Arc<Ruleset>;
}

/// A ruleset fixed at construction.
#[derive(Debug, Clone)]
pub struct StaticRuleset(Arc<Ruleset>);

impl StaticRuleset {
    pub fn new(ruleset: Ruleset) -> Self {
        Self(Arc::new(ruleset))
    }
}

impl RulesetProvider for StaticRuleset {
    fn current(&self) -> Arc<Ruleset> {
        self.0.clone()
    }
}

/// A ruleset read from a JSON file once, and again only on an explicit `reload`.
#[derive(Debug)]
pub struct FileRulesetProvider {
    path: PathBuf,
    snapshot: RwLock<Arc<Ruleset>>,
}

impl FileRulesetProvider {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RulesetError> {
        let path = path.as_ref().to_path_buf();
        let ruleset = read_ruleset(&path)?;

        info!(
            "loaded ruleset {} version {} with {} rules",
            ruleset.ruleset_id,
            ruleset.version,
            ruleset.rules.len()
        );

        Ok(Self {
            path,
            snapshot: RwLock::new(Arc::new(ruleset)),
        })
    }

    /// Re-read the file and install it as the current snapshot.
    /// On failure the previous snapshot stays in effect.
    pub fn reload(&self) -> Result<Arc<Ruleset>, RulesetError> {
        let ruleset = Arc::new(read_ruleset(&self.path)?);

        match self.snapshot.write() {
            Ok(mut snapshot) => *snapshot = ruleset.clone(),
            Err(poisoned) => *poisoned.into_inner() = ruleset.clone(),
        }

        info!(
            "reloaded ruleset {} version {}",
            ruleset.ruleset_id, ruleset.version
        );
        Ok(ruleset)
    }
}

impl RulesetProvider for FileRulesetProvider {
    fn current(&self) -> Arc<Ruleset> {
        match self.snapshot.read() {
            Ok(snapshot) => snapshot.clone(),
            Err(poisoned) => {
                warn!("poisoned ruleset lock, serving last snapshot");
                poisoned.into_inner().clone()
            }
        }
    }
}

fn read_ruleset(path: &Path) -> Result<Ruleset, RulesetError> {
    let json = std::fs::read_to_string(path).map_err(|error| RulesetError::ReadError {
        path: path.to_path_buf(),
        error,
    })?;

    Ruleset::from_json(&json).map_err(|error| RulesetError::ParseError {
        path: path.to_path_buf(),
        error,
    })
}
