use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::Severity;
use crate::GovernanceError;

/// External ruleset: a versioned list of rules, each tagged with the
/// invariant it protects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ruleset {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub rules: Vec<RuleDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleDecl {
    pub rule_id: String,
    pub invariant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_rule_severity")]
    pub severity: Severity,
    #[serde(default)]
    pub params: Value,
}

fn default_rule_severity() -> Severity {
    Severity::Warn
}

impl Ruleset {
    /// Validates identity fields and rule uniqueness.
    ///
    /// Duplicate rule ids are rejected rather than resolved by position.
    ///
    /// # Errors
    /// Returns [`GovernanceError::RulesetLoad`] for blank identifiers, an
    /// empty rule list, blank invariants or duplicate rule ids.
    pub fn validate(&self) -> Result<(), GovernanceError> {
        if self.id.trim().is_empty() {
            return Err(GovernanceError::RulesetLoad(
                "ruleset id MUST be non-empty".to_string(),
            ));
        }
        if self.version.trim().is_empty() {
            return Err(GovernanceError::RulesetLoad(format!(
                "ruleset `{}` version MUST be non-empty",
                self.id
            )));
        }
        if self.rules.is_empty() {
            return Err(GovernanceError::RulesetLoad(format!(
                "ruleset `{}` MUST declare at least one rule",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.rule_id.trim().is_empty() {
                return Err(GovernanceError::RulesetLoad(format!(
                    "ruleset `{}` contains a rule with an empty rule_id",
                    self.id
                )));
            }
            if normalize_invariant(&rule.invariant).is_empty() {
                return Err(GovernanceError::RulesetLoad(format!(
                    "rule `{}` in ruleset `{}` MUST name an invariant",
                    rule.rule_id, self.id
                )));
            }
            if !seen.insert(rule.rule_id.as_str()) {
                return Err(GovernanceError::RulesetLoad(format!(
                    "duplicate rule_id `{}` in ruleset `{}`",
                    rule.rule_id, self.id
                )));
            }
        }

        Ok(())
    }

    /// Decodes and validates a ruleset from JSON.
    ///
    /// # Errors
    /// Returns [`GovernanceError::RulesetLoad`] when decoding fails or the
    /// decoded ruleset is invalid.
    pub fn from_json(value: &Value) -> Result<Self, GovernanceError> {
        let ruleset: Self = serde_json::from_value(value.clone()).map_err(|err| {
            GovernanceError::RulesetLoad(format!("invalid ruleset payload: {err}"))
        })?;
        ruleset.validate()?;
        Ok(ruleset)
    }

    /// Distinct normalized invariant names declared by this ruleset.
    #[must_use]
    pub fn invariants(&self) -> BTreeSet<String> {
        self.rules
            .iter()
            .map(|rule| normalize_invariant(&rule.invariant))
            .collect()
    }
}

/// Trims and case-folds an invariant name so spelling drift such as
/// `" No-Orphans"` and `"no-orphans"` aggregates together.
#[must_use]
pub fn normalize_invariant(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleViolation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub evidence: Value,
}

/// Evaluator output for one rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleVerdict {
    pub passed: bool,
    #[serde(default)]
    pub violations: Vec<RuleViolation>,
    #[serde(default)]
    pub evidence: Value,
}

impl RuleVerdict {
    #[must_use]
    pub fn pass(evidence: Value) -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
            evidence,
        }
    }

    #[must_use]
    pub fn fail(violations: Vec<RuleViolation>) -> Self {
        Self {
            passed: false,
            violations,
            evidence: Value::Null,
        }
    }

    /// Checks internal consistency of an evaluator verdict.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Validation`] when a passing verdict lists
    /// violations or the same item is reported twice for one rule.
    pub fn validate(&self) -> Result<(), GovernanceError> {
        if self.passed && !self.violations.is_empty() {
            return Err(GovernanceError::Validation(
                "passing verdict MUST NOT list violations".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for violation in &self.violations {
            if let Some(item_id) = &violation.item_id {
                if !seen.insert(item_id.as_str()) {
                    return Err(GovernanceError::Validation(format!(
                        "duplicate violation for item `{item_id}`"
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(rule_id: &str, invariant: &str) -> Value {
        json!({"rule_id": rule_id, "invariant": invariant})
    }

    #[test]
    fn duplicate_rule_ids_are_rejected() {
        let payload = json!({
            "id": "vault-hygiene",
            "version": "1",
            "rules": [rule("r1", "no-orphans"), rule("r1", "no-orphans")]
        });
        let err = Ruleset::from_json(&payload).err();
        assert!(matches!(err, Some(GovernanceError::RulesetLoad(message)) if message.contains("duplicate rule_id")));
    }

    #[test]
    fn invariants_are_normalized_and_deduplicated() {
        let payload = json!({
            "id": "vault-hygiene",
            "version": "1",
            "rules": [rule("r1", " No-Orphans "), rule("r2", "no-orphans"), rule("r3", "Unique  Titles")]
        });
        let ruleset = match Ruleset::from_json(&payload) {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        };
        let invariants: Vec<String> = ruleset.invariants().into_iter().collect();
        assert_eq!(invariants, vec!["no-orphans".to_string(), "unique titles".to_string()]);
        assert_eq!(ruleset.rules[0].severity, Severity::Warn);
    }

    #[test]
    fn verdicts_reject_duplicate_items() {
        let verdict = RuleVerdict::fail(vec![
            RuleViolation {
                item_id: Some("a.md".to_string()),
                message: "orphan".to_string(),
                evidence: Value::Null,
            },
            RuleViolation {
                item_id: Some("a.md".to_string()),
                message: "orphan again".to_string(),
                evidence: Value::Null,
            },
        ]);
        assert!(verdict.validate().is_err());
        assert!(RuleVerdict::pass(json!({"checked": 3})).validate().is_ok());
    }
}
