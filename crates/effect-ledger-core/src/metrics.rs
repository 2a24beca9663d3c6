use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::event::{ArtifactEvent, EventType, ExecutionLogPayload, ExecutionPhase, PhaseStatus};
use crate::ids::{ArtifactId, ExecutionId};
use crate::GovernanceError;

/// Resource accounting every handler reports for its `execute` phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HandlerMetrics {
    #[serde(default)]
    pub items_read: u64,
    #[serde(default)]
    pub items_written: u64,
    #[serde(default)]
    pub items_deleted: u64,
    #[serde(default)]
    pub bytes_written: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, f64>,
}

const ITEMS_READ_ALIASES: [&str; 4] = ["items_read", "read", "rows_read", "notes_read"];
const ITEMS_WRITTEN_ALIASES: [&str; 5] = [
    "items_written",
    "written",
    "rows_written",
    "notes_written",
    "files_written",
];
const ITEMS_DELETED_ALIASES: [&str; 4] = ["items_deleted", "deleted", "rows_deleted", "notes_deleted"];
const BYTES_WRITTEN_ALIASES: [&str; 2] = ["bytes_written", "bytes"];

impl HandlerMetrics {
    pub fn merge(&mut self, other: &Self) {
        self.items_read = self.items_read.saturating_add(other.items_read);
        self.items_written = self.items_written.saturating_add(other.items_written);
        self.items_deleted = self.items_deleted.saturating_add(other.items_deleted);
        self.bytes_written = self.bytes_written.saturating_add(other.bytes_written);
        for (key, value) in &other.extra {
            *self.extra.entry(key.clone()).or_insert(0.0) += value;
        }
    }

    /// Compatibility shim for handlers that report metrics as a loose JSON
    /// object. Known aliases map onto the typed counters; any other numeric
    /// field lands in `extra`. Non-numeric fields are ignored.
    #[must_use]
    pub fn from_legacy(value: &Value) -> Self {
        let mut metrics = Self::default();
        let Some(object) = value.as_object() else {
            return metrics;
        };

        for (key, raw) in object {
            let Some(number) = raw.as_f64() else {
                continue;
            };
            let counter = raw.as_u64().unwrap_or(0);
            let key = key.as_str();
            if ITEMS_READ_ALIASES.contains(&key) {
                metrics.items_read = metrics.items_read.saturating_add(counter);
            } else if ITEMS_WRITTEN_ALIASES.contains(&key) {
                metrics.items_written = metrics.items_written.saturating_add(counter);
            } else if ITEMS_DELETED_ALIASES.contains(&key) {
                metrics.items_deleted = metrics.items_deleted.saturating_add(counter);
            } else if BYTES_WRITTEN_ALIASES.contains(&key) {
                metrics.bytes_written = metrics.bytes_written.saturating_add(counter);
            } else {
                metrics.extra.insert(key.to_string(), number);
            }
        }

        metrics
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    DryRun,
}

impl ExecutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::DryRun => "dry_run",
        }
    }
}

/// Who should hear about a failure, by the phase it happened in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureAttribution {
    EnvironmentOrGovernance,
    Handler,
    CommitLogic,
}

impl FailureAttribution {
    #[must_use]
    pub fn for_phase(phase: ExecutionPhase) -> Self {
        match phase {
            ExecutionPhase::Prepare => Self::EnvironmentOrGovernance,
            ExecutionPhase::Execute => Self::Handler,
            ExecutionPhase::Commit => Self::CommitLogic,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EnvironmentOrGovernance => "environment_or_governance",
            Self::Handler => "handler",
            Self::CommitLogic => "commit_logic",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseSummary {
    pub phase: ExecutionPhase,
    pub status: PhaseStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub skip_reason: Option<String>,
}

/// Derived view of one execution attempt. Never stored by the harness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSummary {
    pub execution_id: ExecutionId,
    pub artifact_id: ArtifactId,
    pub attempt: u32,
    pub status: ExecutionStatus,
    pub dry_run: bool,
    pub phases: Vec<PhaseSummary>,
    pub total_duration_ms: u64,
    pub metrics: HandlerMetrics,
    #[serde(default)]
    pub failure_phase: Option<ExecutionPhase>,
    #[serde(default)]
    pub failure_attribution: Option<FailureAttribution>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub unterminated_phases: Vec<ExecutionPhase>,
}

/// Folds the `execution.logged` events of one execution into a summary.
///
/// Events of other types or other executions are ignored. Returns `None`
/// when no matching phase event exists.
///
/// # Errors
/// Returns [`GovernanceError::Projection`] when a phase payload is
/// malformed or events of one execution span several artifacts.
pub fn summarize_execution(
    execution_id: ExecutionId,
    events: &[ArtifactEvent],
) -> Result<Option<ExecutionSummary>, GovernanceError> {
    let mut artifact_id = None;
    let mut attempt = 0;
    let mut dry_run = false;
    let mut metrics = HandlerMetrics::default();
    let mut phases: BTreeMap<ExecutionPhase, PhaseSummary> = BTreeMap::new();

    for event in events {
        if event.event_type != EventType::ExecutionLogged {
            continue;
        }
        let payload: ExecutionLogPayload = event.decode_payload()?;
        if payload.execution_id != execution_id {
            continue;
        }

        match artifact_id {
            None => artifact_id = Some(event.artifact_id),
            Some(existing) if existing != event.artifact_id => {
                return Err(GovernanceError::Projection(format!(
                    "execution {execution_id} spans artifacts {existing} and {}",
                    event.artifact_id
                )));
            }
            Some(_) => {}
        }

        attempt = payload.attempt;
        dry_run |= payload.dry_run;
        if let Some(reported) = &payload.metrics {
            metrics.merge(reported);
        }

        let entry = phases.entry(payload.phase).or_insert_with(|| PhaseSummary {
            phase: payload.phase,
            status: payload.status,
            started_at: payload.started_at,
            ended_at: None,
            duration_ms: None,
            error_type: None,
            error: None,
            skip_reason: None,
        });
        entry.status = payload.status;
        if payload.status.is_terminal() {
            entry.ended_at = payload.ended_at;
            entry.duration_ms = payload.duration_ms;
            entry.error_type = payload.error_type;
            entry.error = payload.error;
            entry.skip_reason = payload.skip_reason;
        }
    }

    let Some(artifact_id) = artifact_id else {
        return Ok(None);
    };

    let phases: Vec<PhaseSummary> = phases.into_values().collect();
    let failed = phases
        .iter()
        .find(|phase| phase.status == PhaseStatus::Failed);
    let unterminated_phases: Vec<ExecutionPhase> = phases
        .iter()
        .filter(|phase| !phase.status.is_terminal())
        .map(|phase| phase.phase)
        .collect();
    let committed = phases
        .iter()
        .any(|phase| phase.phase == ExecutionPhase::Commit && phase.status == PhaseStatus::Completed);

    let status = if failed.is_some() {
        ExecutionStatus::Failed
    } else if !unterminated_phases.is_empty() {
        ExecutionStatus::Running
    } else if dry_run {
        ExecutionStatus::DryRun
    } else if committed {
        ExecutionStatus::Succeeded
    } else {
        ExecutionStatus::Running
    };

    let total_duration_ms = phases.iter().filter_map(|phase| phase.duration_ms).sum();

    Ok(Some(ExecutionSummary {
        execution_id,
        artifact_id,
        attempt,
        status,
        dry_run,
        total_duration_ms,
        metrics,
        failure_phase: failed.map(|phase| phase.phase),
        failure_attribution: failed.map(|phase| FailureAttribution::for_phase(phase.phase)),
        error_type: failed.and_then(|phase| phase.error_type.clone()),
        error: failed.and_then(|phase| phase.error.clone()),
        unterminated_phases,
        phases,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NewEvent;
    use crate::ids::EventId;
    use crate::now_utc;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn phase_event(
        artifact_id: ArtifactId,
        execution_id: ExecutionId,
        phase: ExecutionPhase,
        status: PhaseStatus,
        metrics: Option<HandlerMetrics>,
    ) -> ArtifactEvent {
        let now = now_utc();
        let payload = ExecutionLogPayload {
            execution_id,
            attempt: 1,
            phase,
            status,
            started_at: now,
            ended_at: status.is_terminal().then_some(now),
            duration_ms: status.is_terminal().then_some(5),
            error_type: (status == PhaseStatus::Failed).then(|| "io".to_string()),
            error: (status == PhaseStatus::Failed).then(|| "disk full".to_string()),
            skip_reason: None,
            metrics,
            dry_run: false,
        };
        must_ok(NewEvent::typed(
            EventType::ExecutionLogged,
            artifact_id,
            "harness",
            &payload,
        ))
        .stamp(EventId::new(), now)
    }

    #[test]
    fn legacy_metrics_map_aliases_and_keep_extras() {
        let metrics = HandlerMetrics::from_legacy(&json!({
            "rows_read": 10,
            "notes_deleted": 3,
            "bytes": 2048,
            "latency_ms": 12.5,
            "label": "ignored"
        }));
        assert_eq!(metrics.items_read, 10);
        assert_eq!(metrics.items_deleted, 3);
        assert_eq!(metrics.bytes_written, 2048);
        assert_eq!(metrics.extra.get("latency_ms"), Some(&12.5));
        assert!(!metrics.extra.contains_key("label"));
    }

    #[test]
    fn execute_failure_is_attributed_to_handler() {
        let artifact_id = ArtifactId::new();
        let execution_id = ExecutionId::new();
        let events = vec![
            phase_event(artifact_id, execution_id, ExecutionPhase::Prepare, PhaseStatus::Started, None),
            phase_event(artifact_id, execution_id, ExecutionPhase::Prepare, PhaseStatus::Completed, None),
            phase_event(artifact_id, execution_id, ExecutionPhase::Execute, PhaseStatus::Started, None),
            phase_event(artifact_id, execution_id, ExecutionPhase::Execute, PhaseStatus::Failed, None),
        ];

        let summary = must_some(must_ok(summarize_execution(execution_id, &events)));
        assert_eq!(summary.status, ExecutionStatus::Failed);
        assert_eq!(summary.failure_phase, Some(ExecutionPhase::Execute));
        assert_eq!(summary.failure_attribution, Some(FailureAttribution::Handler));
        assert_eq!(summary.error_type.as_deref(), Some("io"));
        assert_eq!(summary.total_duration_ms, 10);
        assert!(summary.unterminated_phases.is_empty());
    }

    #[test]
    fn started_phase_without_terminal_event_is_reported() {
        let artifact_id = ArtifactId::new();
        let execution_id = ExecutionId::new();
        let events = vec![phase_event(
            artifact_id,
            execution_id,
            ExecutionPhase::Prepare,
            PhaseStatus::Started,
            None,
        )];

        let summary = must_some(must_ok(summarize_execution(execution_id, &events)));
        assert_eq!(summary.status, ExecutionStatus::Running);
        assert_eq!(summary.unterminated_phases, vec![ExecutionPhase::Prepare]);
    }

    #[test]
    fn metrics_merge_across_phases() {
        let artifact_id = ArtifactId::new();
        let execution_id = ExecutionId::new();
        let reported = HandlerMetrics {
            items_written: 2,
            ..HandlerMetrics::default()
        };
        let events = vec![
            phase_event(artifact_id, execution_id, ExecutionPhase::Execute, PhaseStatus::Completed, Some(reported.clone())),
            phase_event(artifact_id, execution_id, ExecutionPhase::Commit, PhaseStatus::Completed, Some(reported)),
        ];

        let summary = must_some(must_ok(summarize_execution(execution_id, &events)));
        assert_eq!(summary.status, ExecutionStatus::Succeeded);
        assert_eq!(summary.metrics.items_written, 4);
    }

    #[test]
    fn unknown_execution_yields_none() {
        let events = vec![phase_event(
            ArtifactId::new(),
            ExecutionId::new(),
            ExecutionPhase::Prepare,
            PhaseStatus::Started,
            None,
        )];
        assert!(must_ok(summarize_execution(ExecutionId::new(), &events)).is_none());
    }
}
