//! Pure governance domain: identifiers, the event model, the artifact
//! lifecycle fold, risk classification, artifact type packs, rulesets and
//! content hashing. Nothing in this crate performs I/O.

#![forbid(unsafe_code)]

mod artifact;
mod event;
mod hashing;
mod ids;
mod lifecycle;
mod metrics;
mod registry;
mod risk;
mod ruleset;

use time::{OffsetDateTime, UtcOffset};

pub use artifact::{
    is_secret_like_key, is_secret_ref, ApprovalContent, BundleArtifacts, BundleContent,
    EnvironmentInfo, InputsSnapshot, PlanContent, ReproHeader, ResultContent, RulesetRef,
    BUNDLE_VERSION, SECRET_REF_PREFIX,
};
pub use event::{
    ApprovedPayload, ArtifactEvent, ConstraintDigest, ConstraintEvaluatedPayload, ConstraintResult,
    CreatedPayload, EventType, ExecutedPayload, ExecutionLogPayload, ExecutionPhase,
    InvariantCheckedPayload, InvariantStatus, NewEvent, PhaseStatus, RejectedPayload,
    RejectionStage, SupersededPayload, ValidatedPayload,
};
pub use hashing::{canonical_json, content_id_for_bytes, content_id_for_json, hash_bytes, hash_json};
pub use ids::{ArtifactId, ContentId, EventId, ExecutionId};
pub use lifecycle::{check_transition, fold_snapshot, ArtifactSnapshot, ArtifactStatus};
pub use metrics::{
    summarize_execution, ExecutionStatus, ExecutionSummary, FailureAttribution, HandlerMetrics,
    PhaseSummary,
};
pub use registry::{
    ArtifactTypePack, ArtifactTypeRegistry, EnforcementMode, ManifestEntry, Severity,
    ValidationIssue, ValidationReport,
};
pub use risk::{classify, EffectSummary, EffectType, RiskAssessment, RiskClass};
pub use ruleset::{normalize_invariant, RuleDecl, RuleVerdict, RuleViolation, Ruleset};

/// Maximum length of an error message recorded in an event payload.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GovernanceError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("gate denied: {0}")]
    GateDenied(String),
    #[error("handler execution error ({error_type}): {message}")]
    HandlerExecution { error_type: String, message: String },
    #[error("type validation error: {0}")]
    TypeValidation(String),
    #[error("ruleset load error: {0}")]
    RulesetLoad(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("projection error: {0}")]
    Projection(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GovernanceError {
    /// Stable machine-readable tag for the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::GateDenied(_) => "gate_denied",
            Self::HandlerExecution { .. } => "handler_execution_error",
            Self::TypeValidation(_) => "type_validation_error",
            Self::RulesetLoad(_) => "ruleset_load_error",
            Self::Conflict(_) => "conflict",
            Self::Projection(_) => "projection_error",
            Self::Configuration(_) => "configuration_error",
        }
    }

    /// Process exit code used by command surfaces.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) | Self::TypeValidation(_) => 2,
            Self::GateDenied(_) => 3,
            Self::HandlerExecution { .. } => 4,
            Self::Conflict(_) => 5,
            Self::RulesetLoad(_) | Self::Projection(_) | Self::Configuration(_) => 1,
        }
    }

    /// Message without the kind prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Validation(message)
            | Self::GateDenied(message)
            | Self::TypeValidation(message)
            | Self::RulesetLoad(message)
            | Self::Conflict(message)
            | Self::Projection(message)
            | Self::Configuration(message)
            | Self::HandlerExecution { message, .. } => message,
        }
    }
}

/// Truncates `message` to at most [`MAX_ERROR_MESSAGE_CHARS`] characters.
#[must_use]
pub fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE_CHARS) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`GovernanceError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, GovernanceError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| GovernanceError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(GovernanceError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`GovernanceError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, GovernanceError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            GovernanceError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Whole milliseconds between two instants, zero when `later` precedes `earlier`.
#[must_use]
pub fn millis_between(earlier: OffsetDateTime, later: OffsetDateTime) -> u64 {
    if later <= earlier {
        return 0;
    }
    u64::try_from((later - earlier).whole_milliseconds()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_MESSAGE_CHARS + 20);
        let truncated = truncate_message(&long);
        assert_eq!(truncated.chars().count(), MAX_ERROR_MESSAGE_CHARS);

        let short = "boom";
        assert_eq!(truncate_message(short), "boom");
    }

    #[test]
    fn parse_rfc3339_rejects_non_utc() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00Z").is_ok());
    }

    #[test]
    fn exit_codes_distinguish_failure_kinds() {
        assert_eq!(GovernanceError::Validation("x".into()).exit_code(), 2);
        assert_eq!(GovernanceError::GateDenied("x".into()).exit_code(), 3);
        assert_eq!(
            GovernanceError::HandlerExecution {
                error_type: "io".into(),
                message: "x".into()
            }
            .exit_code(),
            4
        );
        assert_eq!(GovernanceError::Projection("x".into()).kind(), "projection_error");
    }
}
