//! Ledger self-audit. A consumer of the query API only; nothing here feeds
//! back into admissibility decisions.

use anyhow::Result;
use effect_ledger_core::{fold_snapshot, ArtifactId, ArtifactSnapshot, ArtifactStatus, EventType};
use effect_ledger_store::{ContentIntegrity, ContentStore, EventLedger, QueryEngine, QueryFilter};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const LEDGER_CHECK_CONTRACT_VERSION: &str = "ledger_check.v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckIssue {
    pub code: String,
    pub severity: CheckSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<ArtifactId>,
    pub message: String,
}

impl CheckIssue {
    fn error(code: &str, artifact_id: ArtifactId, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: CheckSeverity::Error,
            artifact_id: Some(artifact_id),
            message: message.into(),
        }
    }

    fn warning(code: &str, artifact_id: ArtifactId, message: impl Into<String>) -> Self {
        Self {
            severity: CheckSeverity::Warning,
            ..Self::error(code, artifact_id, message)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerCheck {
    pub contract_version: String,
    pub healthy: bool,
    pub artifacts_checked: usize,
    pub issues: Vec<CheckIssue>,
}

/// Walks every artifact in `ledger` and reports history that should not
/// exist: effects without approval, bundles that do not match executions,
/// phases that never terminated, and content that is missing or altered.
///
/// Unterminated phases are warnings since a run may still be in flight.
pub fn check_ledger(ledger: &EventLedger, content: &dyn ContentStore) -> Result<LedgerCheck> {
    let engine = QueryEngine::new(ledger);
    let artifact_ids = engine.artifact_ids()?;
    let mut issues = Vec::new();

    for artifact_id in &artifact_ids {
        let events = engine.events_for(*artifact_id)?;
        let snapshot = match fold_snapshot(&events) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => continue,
            Err(err) => {
                issues.push(CheckIssue::error("fold_error", *artifact_id, err.message()));
                continue;
            }
        };

        check_content(content, &snapshot, &mut issues)?;
        if snapshot.artifact_type == "plan" {
            check_plan(&engine, &snapshot, &mut issues)?;
        }
    }

    let healthy = !issues
        .iter()
        .any(|issue| issue.severity == CheckSeverity::Error);
    debug!(artifacts = artifact_ids.len(), issues = issues.len(), healthy, "ledger check finished");
    Ok(LedgerCheck {
        contract_version: LEDGER_CHECK_CONTRACT_VERSION.to_string(),
        healthy,
        artifacts_checked: artifact_ids.len(),
        issues,
    })
}

fn check_content(content: &dyn ContentStore, snapshot: &ArtifactSnapshot, issues: &mut Vec<CheckIssue>) -> Result<()> {
    let Some(content_id) = snapshot.content_id.as_ref() else {
        return Ok(());
    };
    match content.verify(content_id)? {
        ContentIntegrity::Intact => {}
        ContentIntegrity::Missing => issues.push(CheckIssue::error(
            "content_missing",
            snapshot.artifact_id,
            format!("content {content_id} is not in the content store"),
        )),
        ContentIntegrity::Corrupt { actual } => issues.push(CheckIssue::error(
            "content_hash_mismatch",
            snapshot.artifact_id,
            format!("content {content_id} now hashes to {actual}"),
        )),
    }
    Ok(())
}

fn check_plan(engine: &QueryEngine<'_>, snapshot: &ArtifactSnapshot, issues: &mut Vec<CheckIssue>) -> Result<()> {
    let plan_id = snapshot.artifact_id;
    let executed = engine
        .query(
            &QueryFilter::new()
                .artifact(plan_id)
                .event_type(EventType::ArtifactExecuted),
        )?
        .len();

    if executed > 0 && snapshot.requires_approval {
        let approval_recorded = match snapshot.approval_artifact_id {
            Some(approval_id) => engine.snapshot(approval_id)?.is_some(),
            None => false,
        };
        if !approval_recorded || !snapshot.has_qualifying_approval() {
            issues.push(CheckIssue::error(
                "executed_without_approval",
                plan_id,
                "plan requires approval but no qualifying approval artifact is recorded",
            ));
        }
    }

    let bundles = engine.bundles_for(plan_id)?.len();
    if bundles != executed {
        issues.push(CheckIssue::error(
            "bundle_count_mismatch",
            plan_id,
            format!("{executed} successful execution(s) but {bundles} bundle(s)"),
        ));
    }
    if matches!(snapshot.status, ArtifactStatus::Executed | ArtifactStatus::Superseded) && executed != 1 {
        issues.push(CheckIssue::error(
            "bundle_count_mismatch",
            plan_id,
            format!("plan is {} with {executed} executed event(s)", snapshot.status.as_str()),
        ));
    }

    for summary in engine.execution_summaries(plan_id)? {
        if summary.unterminated_phases.is_empty() {
            continue;
        }
        let phases: Vec<&str> = summary
            .unterminated_phases
            .iter()
            .map(|phase| phase.as_str())
            .collect();
        issues.push(CheckIssue::warning(
            "unterminated_phase",
            plan_id,
            format!(
                "execution {} has phases without a terminal event: {}",
                summary.execution_id,
                phases.join(", ")
            ),
        ));
    }
    Ok(())
}
