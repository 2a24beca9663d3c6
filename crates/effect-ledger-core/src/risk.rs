use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::GovernanceError;

/// Broad shape of what an operation will do to the system it targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EffectType {
    Read,
    Append,
    Reversible,
    Destructive,
    External,
}

impl EffectType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Append => "append",
            Self::Reversible => "reversible",
            Self::Destructive => "destructive",
            Self::External => "external",
        }
    }
}

/// Planning-phase prediction of an operation's consequences.
///
/// Built by handlers from observed state; callers never supply it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EffectSummary {
    pub effect_type: EffectType,
    #[serde(default)]
    pub predicted_erasure: BTreeMap<String, u64>,
    #[serde(default)]
    pub predicted_outputs: Vec<String>,
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl EffectSummary {
    #[must_use]
    pub fn new(effect_type: EffectType) -> Self {
        Self {
            effect_type,
            predicted_erasure: BTreeMap::new(),
            predicted_outputs: Vec::new(),
            reasons: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_erasure(mut self, key: impl Into<String>, count: u64) -> Self {
        self.predicted_erasure.insert(key.into(), count);
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.predicted_outputs.push(output.into());
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reasons.push(reason.into());
        self
    }

    #[must_use]
    pub fn total_predicted_erasure(&self) -> u64 {
        self.predicted_erasure.values().copied().sum()
    }
}

/// Ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    ReadOnly,
    AppendOnly,
    Reversible,
    MutationDestructive,
    ExternalSideEffect,
}

impl RiskClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::AppendOnly => "append_only",
            Self::Reversible => "reversible",
            Self::MutationDestructive => "mutation_destructive",
            Self::ExternalSideEffect => "external_side_effect",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "read_only" => Some(Self::ReadOnly),
            "append_only" => Some(Self::AppendOnly),
            "reversible" => Some(Self::Reversible),
            "mutation_destructive" => Some(Self::MutationDestructive),
            "external_side_effect" => Some(Self::ExternalSideEffect),
            _ => None,
        }
    }

    #[must_use]
    pub fn requires_approval(self) -> bool {
        matches!(self, Self::MutationDestructive | Self::ExternalSideEffect)
    }

    /// Approvals for this class must carry `force_ack = true`.
    #[must_use]
    pub fn requires_force_ack(self) -> bool {
        matches!(self, Self::MutationDestructive)
    }
}

impl std::str::FromStr for RiskClass {
    type Err = GovernanceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
            .ok_or_else(|| GovernanceError::Validation(format!("unknown risk class `{value}`")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RiskAssessment {
    pub risk_class: RiskClass,
    pub requires_approval: bool,
    pub reasons: Vec<String>,
}

/// Maps an effect summary to a risk class by fixed rules.
///
/// Erasure predictions dominate the declared effect type: a plan that
/// predicts removing anything is destructive regardless of its label.
#[must_use]
pub fn classify(summary: &EffectSummary) -> RiskAssessment {
    let mut reasons = Vec::new();

    let erasing: Vec<(&String, &u64)> = summary
        .predicted_erasure
        .iter()
        .filter(|(_, count)| **count > 0)
        .collect();

    let risk_class = if !erasing.is_empty() {
        for (key, count) in erasing {
            reasons.push(format!("predicted_erasure:{key}={count}"));
        }
        RiskClass::MutationDestructive
    } else {
        match summary.effect_type {
            EffectType::External => {
                reasons.push("effect_type:external".to_string());
                RiskClass::ExternalSideEffect
            }
            EffectType::Destructive => {
                reasons.push("effect_type:destructive".to_string());
                RiskClass::MutationDestructive
            }
            EffectType::Reversible => {
                reasons.push("effect_type:reversible".to_string());
                RiskClass::Reversible
            }
            EffectType::Append => {
                reasons.push("effect_type:append".to_string());
                RiskClass::AppendOnly
            }
            EffectType::Read if !summary.predicted_outputs.is_empty() => {
                reasons.push(format!(
                    "predicted_outputs:{}",
                    summary.predicted_outputs.len()
                ));
                RiskClass::AppendOnly
            }
            EffectType::Read => {
                reasons.push("effect_type:read".to_string());
                RiskClass::ReadOnly
            }
        }
    };

    reasons.extend(summary.reasons.iter().cloned());

    RiskAssessment {
        risk_class,
        requires_approval: risk_class.requires_approval(),
        reasons,
    }
}
