use std::collections::{BTreeMap, BTreeSet};

use effect_ledger_core::{
    normalize_invariant, ApprovedPayload, ArtifactEvent, ArtifactId, ArtifactSnapshot,
    ConstraintEvaluatedPayload, ConstraintResult, CreatedPayload, EventId, EventType,
    ExecutedPayload, ExecutionId, ExecutionLogPayload, ExecutionPhase, ExecutionSummary,
    GovernanceError, InvariantCheckedPayload, InvariantStatus, RejectedPayload, RulesetRef,
    SupersededPayload, ValidatedPayload,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintDataStatus {
    Missing,
    Partial,
    Present,
}

impl ConstraintDataStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Partial => "partial",
            Self::Present => "present",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvaluationCounts {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub errored: u32,
}

/// Aggregated outcome of one rule across all its evaluation events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleSummary {
    pub ruleset: String,
    pub rule_id: String,
    pub invariant: String,
    pub result: ConstraintResult,
    pub violations: u32,
    pub affected_items: Vec<String>,
}

/// Latest recorded check for one invariant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvariantSummary {
    pub invariant: String,
    pub status: InvariantStatus,
    pub rule_count: u32,
    pub violation_count: u32,
    pub affected_items: Vec<String>,
    pub rulesets: Vec<String>,
    pub checks_recorded: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConstraintSummary {
    pub artifact_id: ArtifactId,
    pub constraint_data_status: ConstraintDataStatus,
    pub active_rulesets: Vec<String>,
    pub evaluated_rulesets: Vec<String>,
    pub missing_rulesets: Vec<String>,
    pub evaluations: EvaluationCounts,
    pub rules: Vec<RuleSummary>,
    pub invariants: Vec<InvariantSummary>,
}

/// One rendered line of an artifact's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEntry {
    pub event_id: EventId,
    pub event_type: EventType,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ExecutionPhase>,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelatedArtifacts {
    #[serde(default)]
    pub inputs: Vec<ArtifactId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ArtifactId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ArtifactId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<ArtifactId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<ArtifactId>,
    #[serde(default)]
    pub bundles: Vec<ArtifactId>,
}

/// Everything the ledger knows about one artifact, assembled for review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditTrail {
    pub artifact_id: ArtifactId,
    pub snapshot: ArtifactSnapshot,
    pub content: Value,
    pub related: RelatedArtifacts,
    pub constraints: ConstraintSummary,
    pub executions: Vec<ExecutionSummary>,
    pub timeline: Vec<TimelineEntry>,
    pub events: Vec<ArtifactEvent>,
}

pub(crate) fn ruleset_key(id: &str, version: &str) -> String {
    format!("{id}@{version}")
}

/// Rulesets recorded as active by the artifact's validation outcome.
pub(crate) fn active_rulesets(events: &[ArtifactEvent]) -> Result<Vec<RulesetRef>, GovernanceError> {
    for event in events.iter().rev() {
        match event.event_type {
            EventType::ArtifactValidated => {
                let payload: ValidatedPayload = event.decode_payload()?;
                return Ok(payload.active_rulesets);
            }
            EventType::ArtifactRejected => {
                let payload: RejectedPayload = event.decode_payload()?;
                if !payload.active_rulesets.is_empty() {
                    return Ok(payload.active_rulesets);
                }
            }
            _ => {}
        }
    }
    Ok(Vec::new())
}

/// Ruleset load errors and failed ruleset paths recorded by the artifact's
/// latest validation.
fn ruleset_failures(events: &[ArtifactEvent]) -> Result<(Vec<String>, Vec<String>), GovernanceError> {
    let Some(event) = events
        .iter()
        .rev()
        .find(|event| event.event_type == EventType::ArtifactValidated)
    else {
        return Ok((Vec::new(), Vec::new()));
    };
    let payload: ValidatedPayload = event.decode_payload()?;
    Ok((payload.constraints.ruleset_errors, payload.constraints.failed_rulesets))
}

/// Summarizes constraint evidence for one artifact.
///
/// Status is `missing` when no constraint or invariant events exist,
/// `partial` when a ruleset failed to load or an active ruleset has no
/// non-error evaluation, and `present` otherwise. Failed ruleset paths are
/// listed among the missing rulesets.
pub(crate) fn summarize_constraints(
    artifact_id: ArtifactId,
    events: &[ArtifactEvent],
) -> Result<ConstraintSummary, GovernanceError> {
    let active: Vec<String> = active_rulesets(events)?
        .iter()
        .map(|ruleset| ruleset_key(&ruleset.id, &ruleset.version))
        .collect();

    let mut counts = EvaluationCounts::default();
    let mut evaluated: BTreeSet<String> = BTreeSet::new();
    let mut rules: BTreeMap<(String, String), RuleSummary> = BTreeMap::new();
    let mut constraint_events = 0_usize;

    for event in events {
        if event.event_type != EventType::ConstraintEvaluated {
            continue;
        }
        constraint_events += 1;
        let payload: ConstraintEvaluatedPayload = event.decode_payload()?;
        let key = ruleset_key(&payload.ruleset_id, &payload.ruleset_version);

        counts.total += 1;
        match payload.result {
            ConstraintResult::Pass => counts.passed += 1,
            ConstraintResult::Fail => counts.failed += 1,
            ConstraintResult::Error => counts.errored += 1,
        }
        if payload.result != ConstraintResult::Error {
            evaluated.insert(key.clone());
        }

        let entry = rules
            .entry((key.clone(), payload.rule_id.clone()))
            .or_insert_with(|| RuleSummary {
                ruleset: key,
                rule_id: payload.rule_id.clone(),
                invariant: normalize_invariant(&payload.invariant),
                result: ConstraintResult::Pass,
                violations: 0,
                affected_items: Vec::new(),
            });
        entry.result = worse_result(entry.result, payload.result);
        if payload.result == ConstraintResult::Fail {
            entry.violations += 1;
            if let Some(item_id) = payload.item_id {
                if !entry.affected_items.contains(&item_id) {
                    entry.affected_items.push(item_id);
                }
            }
        }
    }

    let invariants = summarize_invariants(events)?;
    let (ruleset_errors, failed_rulesets) = ruleset_failures(events)?;
    let mut missing_rulesets: Vec<String> = active
        .iter()
        .filter(|key| !evaluated.contains(*key))
        .cloned()
        .collect();
    let load_failed = !ruleset_errors.is_empty() || !failed_rulesets.is_empty();
    missing_rulesets.extend(failed_rulesets);

    let status = if constraint_events == 0 && invariants.is_empty() {
        ConstraintDataStatus::Missing
    } else if load_failed || !missing_rulesets.is_empty() {
        ConstraintDataStatus::Partial
    } else {
        ConstraintDataStatus::Present
    };

    Ok(ConstraintSummary {
        artifact_id,
        constraint_data_status: status,
        active_rulesets: active,
        evaluated_rulesets: evaluated.into_iter().collect(),
        missing_rulesets,
        evaluations: counts,
        rules: rules.into_values().collect(),
        invariants,
    })
}

fn worse_result(current: ConstraintResult, next: ConstraintResult) -> ConstraintResult {
    let rank = |result: ConstraintResult| match result {
        ConstraintResult::Pass => 0,
        ConstraintResult::Fail => 1,
        ConstraintResult::Error => 2,
    };
    if rank(next) > rank(current) {
        next
    } else {
        current
    }
}

/// Latest `invariant.checked` per normalized invariant name.
pub(crate) fn summarize_invariants(
    events: &[ArtifactEvent],
) -> Result<Vec<InvariantSummary>, GovernanceError> {
    let mut latest: BTreeMap<String, InvariantSummary> = BTreeMap::new();
    for event in events {
        if event.event_type != EventType::InvariantChecked {
            continue;
        }
        let payload: InvariantCheckedPayload = event.decode_payload()?;
        let name = normalize_invariant(&payload.invariant);
        let checks_recorded = latest
            .get(&name)
            .map_or(1, |previous| previous.checks_recorded + 1);
        latest.insert(
            name.clone(),
            InvariantSummary {
                invariant: name,
                status: payload.status,
                rule_count: payload.rule_count,
                violation_count: payload.violation_count,
                affected_items: payload.affected_items,
                rulesets: payload.rulesets,
                checks_recorded,
            },
        );
    }
    Ok(latest.into_values().collect())
}

/// Renders one event as a timeline entry.
pub(crate) fn timeline_entry(event: &ArtifactEvent) -> Result<TimelineEntry, GovernanceError> {
    let mut phase = None;
    let detail = match event.event_type {
        EventType::ArtifactCreated => {
            let payload: CreatedPayload = event.decode_payload()?;
            let artifact_type = event.artifact_type.as_deref().unwrap_or("artifact");
            if payload.inputs.is_empty() {
                format!("created {artifact_type}")
            } else {
                format!("created {artifact_type} from {} input(s)", payload.inputs.len())
            }
        }
        EventType::ArtifactValidated => {
            let payload: ValidatedPayload = event.decode_payload()?;
            format!(
                "validated risk={} requires_approval={} violations={}",
                payload.risk_class.as_str(),
                payload.requires_approval,
                payload.constraints.violations
            )
        }
        EventType::ArtifactApproved => {
            let payload: ApprovedPayload = event.decode_payload()?;
            format!(
                "approved by {} force_ack={}",
                payload.approver, payload.force_ack
            )
        }
        EventType::ArtifactRejected => {
            let payload: RejectedPayload = event.decode_payload()?;
            format!("rejected at {}: {}", payload.stage.as_str(), payload.reason)
        }
        EventType::ArtifactExecuted => {
            let payload: ExecutedPayload = event.decode_payload()?;
            format!(
                "executed attempt {} result={} bundle={}",
                payload.attempt, payload.result_artifact_id, payload.bundle_artifact_id
            )
        }
        EventType::ArtifactSuperseded => {
            let payload: SupersededPayload = event.decode_payload()?;
            format!("superseded by {}", payload.superseded_by)
        }
        EventType::ConstraintEvaluated => {
            let payload: ConstraintEvaluatedPayload = event.decode_payload()?;
            let mut line = format!(
                "{}@{} {} {}",
                payload.ruleset_id,
                payload.ruleset_version,
                payload.rule_id,
                payload.result.as_str()
            );
            if let Some(item_id) = payload.item_id {
                line.push_str(&format!(" item={item_id}"));
            }
            line
        }
        EventType::InvariantChecked => {
            let payload: InvariantCheckedPayload = event.decode_payload()?;
            let status = match payload.status {
                InvariantStatus::Pass => "pass",
                InvariantStatus::Fail => "fail",
            };
            format!(
                "invariant {} {status} ({} violation(s))",
                payload.invariant, payload.violation_count
            )
        }
        EventType::ExecutionLogged => {
            let payload: ExecutionLogPayload = event.decode_payload()?;
            phase = Some(payload.phase);
            let mut line = format!(
                "{} {} attempt {}",
                payload.phase.as_str(),
                payload.status.as_str(),
                payload.attempt
            );
            if let Some(duration) = payload.duration_ms {
                line.push_str(&format!(" {duration}ms"));
            }
            if let Some(reason) = payload.skip_reason {
                line.push_str(&format!(" ({reason})"));
            }
            if let Some(error) = payload.error {
                line.push_str(&format!(": {error}"));
            }
            line
        }
    };

    Ok(TimelineEntry {
        event_id: event.event_id,
        event_type: event.event_type,
        timestamp: event.timestamp,
        actor: event.actor.clone(),
        execution_id: event.execution_id(),
        phase,
        detail,
    })
}
