use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::artifact::RulesetRef;
use crate::ids::{ArtifactId, ContentId, EventId, ExecutionId};
use crate::metrics::HandlerMetrics;
use crate::registry::ValidationIssue;
use crate::risk::{EffectSummary, RiskClass};
use crate::GovernanceError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EventType {
    #[serde(rename = "artifact.created")]
    ArtifactCreated,
    #[serde(rename = "artifact.validated")]
    ArtifactValidated,
    #[serde(rename = "artifact.approved")]
    ArtifactApproved,
    #[serde(rename = "artifact.rejected")]
    ArtifactRejected,
    #[serde(rename = "artifact.executed")]
    ArtifactExecuted,
    #[serde(rename = "artifact.superseded")]
    ArtifactSuperseded,
    #[serde(rename = "constraint.evaluated")]
    ConstraintEvaluated,
    #[serde(rename = "invariant.checked")]
    InvariantChecked,
    #[serde(rename = "execution.logged")]
    ExecutionLogged,
}

impl EventType {
    pub const ALL: [Self; 9] = [
        Self::ArtifactCreated,
        Self::ArtifactValidated,
        Self::ArtifactApproved,
        Self::ArtifactRejected,
        Self::ArtifactExecuted,
        Self::ArtifactSuperseded,
        Self::ConstraintEvaluated,
        Self::InvariantChecked,
        Self::ExecutionLogged,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ArtifactCreated => "artifact.created",
            Self::ArtifactValidated => "artifact.validated",
            Self::ArtifactApproved => "artifact.approved",
            Self::ArtifactRejected => "artifact.rejected",
            Self::ArtifactExecuted => "artifact.executed",
            Self::ArtifactSuperseded => "artifact.superseded",
            Self::ConstraintEvaluated => "constraint.evaluated",
            Self::InvariantChecked => "invariant.checked",
            Self::ExecutionLogged => "execution.logged",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|item| item.as_str() == value)
    }
}

/// An immutable fact recorded in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactEvent {
    pub event_id: EventId,
    pub event_type: EventType,
    pub artifact_id: ArtifactId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub actor: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<ContentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

impl ArtifactEvent {
    /// Execution id carried in the payload, if any.
    #[must_use]
    pub fn execution_id(&self) -> Option<ExecutionId> {
        self.payload
            .get("execution_id")
            .and_then(Value::as_str)
            .and_then(|raw| ExecutionId::parse(raw).ok())
    }

    /// Looks up a dotted path (`a.b.c`) inside the payload.
    #[must_use]
    pub fn payload_field(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.payload, |current, segment| current.get(segment))
    }

    /// Decodes the payload into its typed form.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Projection`] when the stored payload does
    /// not match the expected shape.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, GovernanceError> {
        serde_json::from_value(self.payload.clone()).map_err(|err| {
            GovernanceError::Projection(format!(
                "event {} ({}) has malformed payload: {err}",
                self.event_id,
                self.event_type.as_str()
            ))
        })
    }
}

/// Append input. The ledger assigns `event_id` and `timestamp`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub artifact_id: ArtifactId,
    pub actor: String,
    pub payload: Value,
    pub content_id: Option<ContentId>,
    pub artifact_type: Option<String>,
}

impl NewEvent {
    #[must_use]
    pub fn new(
        event_type: EventType,
        artifact_id: ArtifactId,
        actor: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_type,
            artifact_id,
            actor: actor.into(),
            payload,
            content_id: None,
            artifact_type: None,
        }
    }

    /// Builds an event from a typed payload.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Validation`] if the payload fails to encode.
    pub fn typed<T: Serialize>(
        event_type: EventType,
        artifact_id: ArtifactId,
        actor: impl Into<String>,
        payload: &T,
    ) -> Result<Self, GovernanceError> {
        let payload = serde_json::to_value(payload).map_err(|err| {
            GovernanceError::Validation(format!(
                "failed to encode {} payload: {err}",
                event_type.as_str()
            ))
        })?;
        Ok(Self::new(event_type, artifact_id, actor, payload))
    }

    #[must_use]
    pub fn with_content(mut self, content_id: ContentId, artifact_type: impl Into<String>) -> Self {
        self.content_id = Some(content_id);
        self.artifact_type = Some(artifact_type.into());
        self
    }

    /// Validates an event before append.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Validation`] when required fields are
    /// missing or the payload does not match the event type's schema.
    pub fn validate(&self) -> Result<(), GovernanceError> {
        if self.actor.trim().is_empty() {
            return Err(GovernanceError::Validation(
                "actor MUST be provided for every event".to_string(),
            ));
        }

        if !self.payload.is_object() {
            return Err(GovernanceError::Validation(
                "payload MUST be a JSON object".to_string(),
            ));
        }

        if self.event_type == EventType::ArtifactCreated {
            if self.content_id.is_none() {
                return Err(GovernanceError::Validation(
                    "artifact.created requires content_id".to_string(),
                ));
            }
            let has_type = self
                .artifact_type
                .as_deref()
                .is_some_and(|value| !value.trim().is_empty());
            if !has_type {
                return Err(GovernanceError::Validation(
                    "artifact.created requires artifact_type".to_string(),
                ));
            }
        }

        let shape = match self.event_type {
            EventType::ArtifactCreated => check_shape::<CreatedPayload>(&self.payload),
            EventType::ArtifactValidated => check_shape::<ValidatedPayload>(&self.payload),
            EventType::ArtifactApproved => check_shape::<ApprovedPayload>(&self.payload),
            EventType::ArtifactRejected => check_shape::<RejectedPayload>(&self.payload),
            EventType::ArtifactExecuted => check_shape::<ExecutedPayload>(&self.payload),
            EventType::ArtifactSuperseded => check_shape::<SupersededPayload>(&self.payload),
            EventType::ConstraintEvaluated => {
                check_shape::<ConstraintEvaluatedPayload>(&self.payload)
            }
            EventType::InvariantChecked => check_shape::<InvariantCheckedPayload>(&self.payload),
            EventType::ExecutionLogged => check_shape::<ExecutionLogPayload>(&self.payload),
        };
        shape.map_err(|err| {
            GovernanceError::Validation(format!(
                "{} payload is malformed: {err}",
                self.event_type.as_str()
            ))
        })
    }

    #[must_use]
    pub fn stamp(self, event_id: EventId, timestamp: OffsetDateTime) -> ArtifactEvent {
        ArtifactEvent {
            event_id,
            event_type: self.event_type,
            artifact_id: self.artifact_id,
            timestamp,
            actor: self.actor,
            payload: self.payload,
            content_id: self.content_id,
            artifact_type: self.artifact_type,
        }
    }
}

fn check_shape<T: DeserializeOwned>(payload: &Value) -> Result<(), serde_json::Error> {
    serde_json::from_value::<T>(payload.clone()).map(|_| ())
}

/// Payload of `artifact.created`: the artifact content inline plus the
/// artifacts it references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreatedPayload {
    pub content: Value,
    #[serde(default)]
    pub inputs: Vec<ArtifactId>,
}

impl Default for CreatedPayload {
    fn default() -> Self {
        Self {
            content: Value::Object(Map::default()),
            inputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConstraintDigest {
    pub rules_evaluated: u32,
    pub violations: u32,
    pub errors: u32,
    #[serde(default)]
    pub invariants_failed: Vec<String>,
    #[serde(default)]
    pub ruleset_errors: Vec<String>,
    /// Ruleset files that failed to load and were never evaluated.
    #[serde(default)]
    pub failed_rulesets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatedPayload {
    pub risk_class: RiskClass,
    pub risk_reasons: Vec<String>,
    pub requires_approval: bool,
    pub effect_summary: EffectSummary,
    #[serde(default)]
    pub active_rulesets: Vec<RulesetRef>,
    #[serde(default)]
    pub constraints: ConstraintDigest,
    #[serde(default)]
    pub warnings: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovedPayload {
    pub approval_artifact_id: ArtifactId,
    pub approver: String,
    pub force_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RejectionStage {
    Validation,
    Approval,
    ExecutionGate,
}

impl RejectionStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Approval => "approval",
            Self::ExecutionGate => "execution_gate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectedPayload {
    pub stage: RejectionStage,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<ValidationIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_class: Option<RiskClass>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_rulesets: Vec<RulesetRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutedPayload {
    pub execution_id: ExecutionId,
    pub attempt: u32,
    pub result_artifact_id: ArtifactId,
    pub bundle_artifact_id: ArtifactId,
    #[serde(default)]
    pub erased: BTreeMap<String, u64>,
    #[serde(default)]
    pub created: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupersededPayload {
    pub superseded_by: ArtifactId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Prepare,
    Execute,
    Commit,
}

impl ExecutionPhase {
    pub const ALL: [Self; 3] = [Self::Prepare, Self::Execute, Self::Commit];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Execute => "execute",
            Self::Commit => "commit",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Started,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Started)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLogPayload {
    pub execution_id: ExecutionId,
    pub attempt: u32,
    pub phase: ExecutionPhase,
    pub status: PhaseStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<HandlerMetrics>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintResult {
    Pass,
    Fail,
    Error,
}

impl ConstraintResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConstraintEvaluatedPayload {
    pub ruleset_id: String,
    pub ruleset_version: String,
    pub rule_id: String,
    pub invariant: String,
    pub result: ConstraintResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub evidence: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InvariantStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvariantCheckedPayload {
    pub invariant: String,
    pub status: InvariantStatus,
    pub rule_count: u32,
    pub violation_count: u32,
    pub affected_items: Vec<String>,
    pub rulesets: Vec<String>,
}
