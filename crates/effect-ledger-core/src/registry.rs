use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifact::{
    is_secret_like_key, is_secret_ref, ApprovalContent, BundleContent, PlanContent, ResultContent,
    BUNDLE_VERSION,
};
use crate::hashing::{canonical_json, hash_bytes};
use crate::ids::ArtifactId;
use crate::metrics::{ExecutionStatus, ExecutionSummary};
use crate::risk::EffectType;
use crate::GovernanceError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warn,
    Fail,
    Enforce,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Fail => "fail",
            Self::Enforce => "enforce",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "warn" => Some(Self::Warn),
            "fail" => Some(Self::Fail),
            "enforce" => Some(Self::Enforce),
            _ => None,
        }
    }

    #[must_use]
    pub fn blocks(self, mode: EnforcementMode) -> bool {
        match self {
            Self::Warn => false,
            Self::Fail => mode == EnforcementMode::Strict,
            Self::Enforce => true,
        }
    }
}

/// `Strict` is the designated CI path where `fail` issues block.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    #[default]
    Local,
    Strict,
}

impl EnforcementMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Strict => "strict",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local" => Some(Self::Local),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ValidationIssue {
    #[must_use]
    pub fn new(severity: Severity, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.into(),
            message: message.into(),
            path: None,
        }
    }

    #[must_use]
    pub fn warn(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warn, code, message)
    }

    #[must_use]
    pub fn fail(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Fail, code, message)
    }

    #[must_use]
    pub fn enforce(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Enforce, code, message)
    }

    #[must_use]
    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// One-line rendering: `severity:code:message`.
    #[must_use]
    pub fn render(&self) -> String {
        match &self.path {
            Some(path) => format!(
                "{}:{}:{} ({path})",
                self.severity.as_str(),
                self.code,
                self.message
            ),
            None => format!("{}:{}:{}", self.severity.as_str(), self.code, self.message),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    #[must_use]
    pub fn new(issues: Vec<ValidationIssue>) -> Self {
        Self { issues }
    }

    pub fn extend(&mut self, issues: impl IntoIterator<Item = ValidationIssue>) {
        self.issues.extend(issues);
    }

    #[must_use]
    pub fn blocking(&self, mode: EnforcementMode) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|issue| issue.severity.blocks(mode))
            .collect()
    }

    #[must_use]
    pub fn is_blocked(&self, mode: EnforcementMode) -> bool {
        self.issues.iter().any(|issue| issue.severity.blocks(mode))
    }

    /// Issues reported but not blocking under `mode`.
    #[must_use]
    pub fn warnings(&self, mode: EnforcementMode) -> Vec<ValidationIssue> {
        self.issues
            .iter()
            .filter(|issue| !issue.severity.blocks(mode))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn has_enforce(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.severity == Severity::Enforce)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: String,
    pub bytes: u64,
    pub hash: String,
}

/// Validation and introspection for one artifact type.
pub trait ArtifactTypePack: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn validate(&self, content: &Value) -> Vec<ValidationIssue>;

    fn extract_inputs(&self, content: &Value) -> Vec<ArtifactId>;

    /// One entry per top-level field: canonical bytes and their hash.
    fn compute_payload_manifest(&self, content: &Value) -> Vec<ManifestEntry> {
        default_manifest(content)
    }
}

fn default_manifest(content: &Value) -> Vec<ManifestEntry> {
    let Some(object) = content.as_object() else {
        return Vec::new();
    };
    let mut keys: Vec<&String> = object.keys().collect();
    keys.sort();
    keys.into_iter()
        .filter_map(|key| {
            let encoded = canonical_json(object.get(key)?).ok()?;
            Some(ManifestEntry {
                path: format!("/{key}"),
                bytes: u64::try_from(encoded.len()).unwrap_or(u64::MAX),
                hash: hash_bytes(encoded.as_bytes()),
            })
        })
        .collect()
}

fn decode<T: DeserializeOwned>(type_name: &str, content: &Value) -> Result<T, ValidationIssue> {
    serde_json::from_value(content.clone()).map_err(|err| {
        ValidationIssue::enforce(
            "schema.invalid",
            format!("{type_name} content does not match its schema: {err}"),
        )
    })
}

struct PlanPack;

impl ArtifactTypePack for PlanPack {
    fn type_name(&self) -> &'static str {
        "plan"
    }

    fn validate(&self, content: &Value) -> Vec<ValidationIssue> {
        let plan: PlanContent = match decode(self.type_name(), content) {
            Ok(value) => value,
            Err(issue) => return vec![issue],
        };
        let mut issues = Vec::new();

        if plan.operation.trim().is_empty() {
            issues.push(
                ValidationIssue::enforce("plan.operation_missing", "operation MUST be non-empty")
                    .at("/operation"),
            );
        }

        match plan.params.as_object() {
            Some(params) => {
                for (key, value) in params {
                    if is_secret_like_key(key) && !is_secret_ref(value) {
                        issues.push(
                            ValidationIssue::enforce(
                                "plan.secret_inline",
                                format!("parameter `{key}` MUST be a secret:// reference"),
                            )
                            .at(format!("/params/{key}")),
                        );
                    }
                }
            }
            None => issues.push(
                ValidationIssue::enforce("plan.params_not_object", "params MUST be an object")
                    .at("/params"),
            ),
        }

        if plan.effect_summary.effect_type == EffectType::Read
            && plan.effect_summary.total_predicted_erasure() > 0
        {
            issues.push(
                ValidationIssue::warn(
                    "plan.effect_label_mismatch",
                    "effect labelled read but predicts erasure",
                )
                .at("/effect_summary"),
            );
        }

        if plan.inputs_snapshot.content_hash.trim().is_empty() {
            issues.push(
                ValidationIssue::fail(
                    "plan.inputs_unhashed",
                    "inputs_snapshot.content_hash is empty",
                )
                .at("/inputs_snapshot/content_hash"),
            );
        }

        issues
    }

    fn extract_inputs(&self, content: &Value) -> Vec<ArtifactId> {
        decode::<PlanContent>(self.type_name(), content)
            .ok()
            .and_then(|plan| plan.supersedes)
            .into_iter()
            .collect()
    }
}

struct ApprovalPack;

impl ArtifactTypePack for ApprovalPack {
    fn type_name(&self) -> &'static str {
        "approval"
    }

    fn validate(&self, content: &Value) -> Vec<ValidationIssue> {
        let approval: ApprovalContent = match decode(self.type_name(), content) {
            Ok(value) => value,
            Err(issue) => return vec![issue],
        };
        let mut issues = Vec::new();
        if approval.approver.trim().is_empty() {
            issues.push(
                ValidationIssue::enforce("approval.approver_missing", "approver MUST be named")
                    .at("/approver"),
            );
        }
        if approval.risk_class.requires_force_ack() && !approval.force_ack {
            issues.push(
                ValidationIssue::enforce(
                    "approval.force_ack_required",
                    format!(
                        "approving {} risk requires force_ack=true",
                        approval.risk_class.as_str()
                    ),
                )
                .at("/force_ack"),
            );
        }
        issues
    }

    fn extract_inputs(&self, content: &Value) -> Vec<ArtifactId> {
        decode::<ApprovalContent>(self.type_name(), content)
            .map(|approval| vec![approval.plan_artifact_id])
            .unwrap_or_default()
    }
}

struct ResultPack;

impl ArtifactTypePack for ResultPack {
    fn type_name(&self) -> &'static str {
        "result"
    }

    fn validate(&self, content: &Value) -> Vec<ValidationIssue> {
        let result: ResultContent = match decode(self.type_name(), content) {
            Ok(value) => value,
            Err(issue) => return vec![issue],
        };
        let mut issues = Vec::new();
        if result.operation.trim().is_empty() {
            issues.push(
                ValidationIssue::enforce("result.operation_missing", "operation MUST be non-empty")
                    .at("/operation"),
            );
        }
        if result.attempt == 0 {
            issues.push(
                ValidationIssue::enforce("result.attempt_invalid", "attempt MUST be >= 1")
                    .at("/attempt"),
            );
        }
        issues
    }

    fn extract_inputs(&self, content: &Value) -> Vec<ArtifactId> {
        decode::<ResultContent>(self.type_name(), content)
            .map(|result| vec![result.plan_artifact_id])
            .unwrap_or_default()
    }
}

struct BundlePack;

impl ArtifactTypePack for BundlePack {
    fn type_name(&self) -> &'static str {
        "bundle"
    }

    fn validate(&self, content: &Value) -> Vec<ValidationIssue> {
        let bundle: BundleContent = match decode(self.type_name(), content) {
            Ok(value) => value,
            Err(issue) => return vec![issue],
        };
        let mut issues = Vec::new();
        if bundle.version != BUNDLE_VERSION {
            issues.push(
                ValidationIssue::enforce(
                    "bundle.version",
                    format!("bundle version MUST be `{BUNDLE_VERSION}`"),
                )
                .at("/version"),
            );
        }
        for (field, value) in [
            ("surface", &bundle.repro.surface),
            ("engine_version", &bundle.repro.engine_version),
        ] {
            if value.trim().is_empty() {
                issues.push(
                    ValidationIssue::enforce(
                        "bundle.repro_incomplete",
                        format!("repro.{field} MUST be non-empty"),
                    )
                    .at(format!("/repro/{field}")),
                );
            }
        }
        if bundle.repro.rulesets.is_empty() {
            issues.push(
                ValidationIssue::warn("bundle.no_rulesets", "no active rulesets recorded")
                    .at("/repro/rulesets"),
            );
        }
        issues
    }

    fn extract_inputs(&self, content: &Value) -> Vec<ArtifactId> {
        decode::<BundleContent>(self.type_name(), content)
            .map(|bundle| {
                let mut inputs = vec![bundle.artifacts.plan];
                inputs.extend(bundle.artifacts.approval);
                inputs.push(bundle.artifacts.result);
                inputs
            })
            .unwrap_or_default()
    }
}

struct ExecutionSummaryPack;

impl ArtifactTypePack for ExecutionSummaryPack {
    fn type_name(&self) -> &'static str {
        "execution_summary"
    }

    fn validate(&self, content: &Value) -> Vec<ValidationIssue> {
        let summary: ExecutionSummary = match decode(self.type_name(), content) {
            Ok(value) => value,
            Err(issue) => return vec![issue],
        };
        let mut issues = Vec::new();
        if summary.status == ExecutionStatus::Failed && summary.failure_phase.is_none() {
            issues.push(
                ValidationIssue::fail(
                    "execution_summary.unattributed_failure",
                    "failed execution MUST name its failure_phase",
                )
                .at("/failure_phase"),
            );
        }
        if !summary.unterminated_phases.is_empty() {
            issues.push(
                ValidationIssue::warn(
                    "execution_summary.unterminated",
                    "summary includes phases without a terminal status",
                )
                .at("/unterminated_phases"),
            );
        }
        issues
    }

    fn extract_inputs(&self, content: &Value) -> Vec<ArtifactId> {
        decode::<ExecutionSummary>(self.type_name(), content)
            .map(|summary| vec![summary.artifact_id])
            .unwrap_or_default()
    }
}

/// Per-type validators keyed by artifact type name.
pub struct ArtifactTypeRegistry {
    packs: BTreeMap<&'static str, Box<dyn ArtifactTypePack>>,
}

impl ArtifactTypeRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            packs: BTreeMap::new(),
        }
    }

    /// Registry with the built-in `plan`, `approval`, `result`, `bundle`
    /// and `execution_summary` packs.
    #[must_use]
    pub fn with_defaults() -> Self {
        let builtin: [Box<dyn ArtifactTypePack>; 5] = [
            Box::new(PlanPack),
            Box::new(ApprovalPack),
            Box::new(ResultPack),
            Box::new(BundlePack),
            Box::new(ExecutionSummaryPack),
        ];
        let mut packs = BTreeMap::new();
        for pack in builtin {
            packs.insert(pack.type_name(), pack);
        }
        Self { packs }
    }

    /// Adds a pack. A second pack for the same type name is an error.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Configuration`] on duplicate registration.
    pub fn register(&mut self, pack: Box<dyn ArtifactTypePack>) -> Result<(), GovernanceError> {
        let name = pack.type_name();
        if self.packs.contains_key(name) {
            return Err(GovernanceError::Configuration(format!(
                "artifact type `{name}` is already registered"
            )));
        }
        self.packs.insert(name, pack);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.packs.contains_key(type_name)
    }

    #[must_use]
    pub fn type_names(&self) -> Vec<&'static str> {
        self.packs.keys().copied().collect()
    }

    #[must_use]
    pub fn validate(&self, type_name: &str, content: &Value) -> ValidationReport {
        match self.packs.get(type_name) {
            Some(pack) => ValidationReport::new(pack.validate(content)),
            None => ValidationReport::new(vec![ValidationIssue::enforce(
                "type.unknown",
                format!("artifact type `{type_name}` is not registered"),
            )]),
        }
    }

    #[must_use]
    pub fn extract_inputs(&self, type_name: &str, content: &Value) -> Vec<ArtifactId> {
        self.packs
            .get(type_name)
            .map(|pack| pack.extract_inputs(content))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn manifest(&self, type_name: &str, content: &Value) -> Vec<ManifestEntry> {
        self.packs
            .get(type_name)
            .map(|pack| pack.compute_payload_manifest(content))
            .unwrap_or_default()
    }
}

impl Default for ArtifactTypeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for ArtifactTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactTypeRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}
