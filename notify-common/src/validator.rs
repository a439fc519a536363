//! # Rule validation
//!
//! Applies the active ruleset to the business document carried by a notification's envelope.
//! Evaluation is a pure function of (ruleset snapshot, payload) and always records exactly one
//! audit event.
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::audit::{AuditEvent, AuditOutcome, AuditSink};
use crate::envelope::Envelope;
use crate::notification::NotificationId;
use crate::rules::{RuleDefinition, RuleKind, Ruleset, RulesetProvider};

/// Pseudo-rule reported when the payload cannot be decoded at all.
pub const INVALID_JSON_RULE: &str = "INVALID_JSON";
/// Field reported for payload-level failures.
pub const ROOT_FIELD: &str = "$";

pub const RULE_ENGINE_STAGE: &str = "RULE_ENGINE";
pub const VALIDATE_ACTION: &str = "VALIDATE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleViolation {
    pub rule_id: String,
    pub field: String,
    pub message: String,
}

impl RuleViolation {
    pub fn new(rule_id: &str, field: &str, message: String) -> Self {
        Self {
            rule_id: rule_id.to_owned(),
            field: field.to_owned(),
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleEvaluationResult {
    pub is_valid: bool,
    pub violations: Vec<RuleViolation>,
}

impl RuleEvaluationResult {
    pub fn from_violations(violations: Vec<RuleViolation>) -> Self {
        Self {
            is_valid: violations.is_empty(),
            violations,
        }
    }

    /// Violations as the JSON array persisted next to a rejected notification.
    pub fn violations_json(&self) -> String {
        serde_json::to_string(&self.violations).unwrap_or_else(|_| String::from("[]"))
    }

    fn audit_details(&self) -> String {
        if self.is_valid {
            return String::from("All rules passed");
        }

        self.violations
            .iter()
            .map(|v| format!("{}:{}:{}", v.rule_id, v.field, v.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct RuleValidator {
    rulesets: Arc<dyn RulesetProvider>,
    audit: Arc<dyn AuditSink>,
}

impl RuleValidator {
    pub fn new(rulesets: Arc<dyn RulesetProvider>, audit: Arc<dyn AuditSink>) -> Self {
        Self { rulesets, audit }
    }

    /// Validate a serialized envelope against the current ruleset snapshot.
    pub fn validate(
        &self,
        notification_id: NotificationId,
        payload_json: &str,
    ) -> RuleEvaluationResult {
        let ruleset = self.rulesets.current();

        let result = match Envelope::decode(payload_json) {
            Ok(envelope) => evaluate(&ruleset, &envelope.document),
            Err(error) => RuleEvaluationResult::from_violations(vec![RuleViolation::new(
                INVALID_JSON_RULE,
                ROOT_FIELD,
                error.to_string(),
            )]),
        };

        let outcome = if result.is_valid {
            metrics::counter!("notify_rule_evaluations_total", "outcome" => "pass").increment(1);
            AuditOutcome::Pass
        } else {
            metrics::counter!("notify_rule_evaluations_total", "outcome" => "fail").increment(1);
            AuditOutcome::Fail
        };

        self.audit.record(AuditEvent::new(
            notification_id,
            RULE_ENGINE_STAGE,
            VALIDATE_ACTION,
            outcome,
            Some(result.audit_details()),
        ));

        result
    }
}

/// Apply every rule of `ruleset`, in order, to a decoded business document.
pub fn evaluate(ruleset: &Ruleset, document: &Map<String, Value>) -> RuleEvaluationResult {
    let fields = flatten(document);

    let violations = ruleset
        .rules
        .iter()
        .filter_map(|rule| check(rule, &fields))
        .collect();

    RuleEvaluationResult::from_violations(violations)
}

/// Top-level fields as text. `None` marks an explicit null.
/// Strings keep their value, everything else is rendered as compact JSON.
fn flatten(document: &Map<String, Value>) -> HashMap<&str, Option<String>> {
    document
        .iter()
        .map(|(key, value)| {
            let text = match value {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            };
            (key.as_str(), text)
        })
        .collect()
}

fn check(rule: &RuleDefinition, fields: &HashMap<&str, Option<String>>) -> Option<RuleViolation> {
    let value = fields.get(rule.field.as_str()).and_then(|v| v.as_deref());
    let violation = |default: String| {
        let message = rule.message.clone().unwrap_or(default);
        Some(RuleViolation::new(&rule.rule_id, &rule.field, message))
    };

    match &rule.kind {
        RuleKind::Required => match value {
            Some(_) => None,
            None => violation(String::from("Field is required")),
        },
        RuleKind::Length => {
            let length = value?.chars().count();
            let too_short = rule.min.is_some_and(|min| length < min);
            let too_long = rule.max.is_some_and(|max| length > max);

            if too_short || too_long {
                violation(length_message(rule.min, rule.max))
            } else {
                None
            }
        }
        RuleKind::Enum => {
            let value = value?;
            let allowed = rule
                .values
                .as_ref()
                .is_some_and(|values| values.iter().any(|v| v == value));

            if allowed {
                None
            } else {
                violation(format!("Invalid value '{value}'"))
            }
        }
        RuleKind::Unsupported(kind) => Some(RuleViolation::new(
            &rule.rule_id,
            &rule.field,
            format!("Unsupported rule type '{kind}'"),
        )),
    }
}

fn length_message(min: Option<usize>, max: Option<usize>) -> String {
    match (min, max) {
        (Some(min), Some(max)) => format!("Length must be between {min} and {max}"),
        (Some(min), None) => format!("Length must be at least {min}"),
        (None, Some(max)) => format!("Length must be at most {max}"),
        (None, None) => String::from("Length is out of range"),
    }
}
