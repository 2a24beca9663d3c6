use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::ids::{ArtifactId, ContentId, ExecutionId};
use crate::metrics::HandlerMetrics;
use crate::risk::{EffectSummary, RiskClass};

pub const BUNDLE_VERSION: &str = "bundle@v1";

/// Prefix of an opaque reference to an entry in an external secret store.
pub const SECRET_REF_PREFIX: &str = "secret://";

const SECRET_KEY_MARKERS: [&str; 6] = [
    "token",
    "password",
    "secret",
    "api_key",
    "apikey",
    "credential",
];

/// Whether a parameter key names something that must be passed by reference.
#[must_use]
pub fn is_secret_like_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SECRET_KEY_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

#[must_use]
pub fn is_secret_ref(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|raw| raw.len() > SECRET_REF_PREFIX.len() && raw.starts_with(SECRET_REF_PREFIX))
}

/// Aggregate hash and counts of the content an operation observed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputsSnapshot {
    pub content_hash: String,
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanContent {
    pub operation: String,
    pub params: Value,
    pub plan: Value,
    pub effect_summary: EffectSummary,
    pub inputs_snapshot: InputsSnapshot,
    pub engine_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<ArtifactId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalContent {
    pub plan_artifact_id: ArtifactId,
    pub approver: String,
    pub force_ack: bool,
    pub risk_class: RiskClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub approved_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultContent {
    pub plan_artifact_id: ArtifactId,
    pub execution_id: ExecutionId,
    pub attempt: u32,
    pub operation: String,
    pub output: Value,
    #[serde(default)]
    pub erased: BTreeMap<String, u64>,
    #[serde(default)]
    pub created: BTreeMap<String, u64>,
    pub metrics: HandlerMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RulesetRef {
    pub id: String,
    pub version: String,
    pub content_id: ContentId,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentInfo {
    pub os: String,
    pub arch: String,
    pub family: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl EnvironmentInfo {
    #[must_use]
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            family: std::env::consts::FAMILY.to_string(),
            hostname: std::env::var("HOSTNAME").ok().filter(|value| !value.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReproHeader {
    pub rulesets: Vec<RulesetRef>,
    pub inputs_snapshot: InputsSnapshot,
    pub surface: String,
    pub engine_version: String,
    pub environment: EnvironmentInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleArtifacts {
    pub plan: ArtifactId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ArtifactId>,
    pub result: ArtifactId,
}

/// Terminal proof object linking plan, approval and result by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleContent {
    pub version: String,
    pub operation: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub artifacts: BundleArtifacts,
    pub repro: ReproHeader,
}
