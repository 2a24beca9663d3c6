use effect_ledger_core::{format_rfc3339, ArtifactEvent, ExecutionSummary};
use effect_ledger_harness::{ApproveResult, ExecuteResult, Failure, ProposeResult, RejectResult, RunResult};
use effect_ledger_store::{AuditTrail, ConstraintSummary, TimelineEntry};
use time::OffsetDateTime;

use crate::check::{CheckSeverity, LedgerCheck};
use crate::ArtifactView;

fn timestamp(value: OffsetDateTime) -> String {
    format_rfc3339(value).unwrap_or_else(|_| value.to_string())
}

fn id_or_dash<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |value| value.to_string())
}

fn print_failure(failure: Option<&Failure>) {
    if let Some(failure) = failure {
        match failure.error_type.as_deref() {
            Some(error_type) => println!("failure={} error_type={error_type} message={}", failure.kind, failure.message),
            None => println!("failure={} message={}", failure.kind, failure.message),
        }
    }
}

pub fn print_propose(result: &ProposeResult) {
    println!(
        "operation={} plan={} status={} risk={} requires_approval={}",
        result.operation,
        id_or_dash(result.plan_artifact_id),
        result.status.map_or("-", |status| status.as_str()),
        result.risk_class.map_or("-", |risk| risk.as_str()),
        if result.requires_approval { "yes" } else { "no" }
    );
    if !result.risk_reasons.is_empty() {
        println!("reasons={}", result.risk_reasons.join(","));
    }
    if let Some(digest) = &result.constraints {
        println!(
            "constraints rules={} violations={} errors={}",
            digest.rules_evaluated, digest.violations, digest.errors
        );
    }
    for warning in &result.warnings {
        println!("warning {}", warning.render());
    }
    print_failure(result.failure.as_ref());
}

pub fn print_approve(result: &ApproveResult) {
    println!(
        "plan={} approval={} approver={} force_ack={}",
        result.plan_artifact_id,
        id_or_dash(result.approval_artifact_id),
        result.approver,
        if result.force_ack { "yes" } else { "no" }
    );
    print_failure(result.failure.as_ref());
}

pub fn print_reject(result: &RejectResult) {
    println!(
        "plan={} rejected={}",
        result.plan_artifact_id,
        if result.failure.is_none() { "yes" } else { "no" }
    );
    print_failure(result.failure.as_ref());
}

pub fn print_execute(result: &ExecuteResult) {
    println!(
        "plan={} success={} dry_run={} execution={} attempt={} result={} bundle={}",
        result.plan_artifact_id,
        if result.success { "yes" } else { "no" },
        if result.dry_run { "yes" } else { "no" },
        id_or_dash(result.execution_id),
        id_or_dash(result.attempt),
        id_or_dash(result.result_artifact_id),
        id_or_dash(result.bundle_artifact_id)
    );
    if let Some(superseded) = result.superseded {
        println!("superseded={superseded}");
    }
    if let Some(summary) = &result.summary {
        print_phases(summary);
    }
    print_failure(result.failure.as_ref());
}

pub fn print_run(result: &RunResult) {
    print_propose(&result.propose);
    if let Some(execute) = &result.execute {
        print_execute(execute);
    }
}

fn print_phases(summary: &ExecutionSummary) {
    println!("{:<8} {:<10} {:>10} detail", "phase", "status", "ms");
    for phase in &summary.phases {
        let detail = match (&phase.error_type, &phase.skip_reason) {
            (Some(error_type), _) => format!("{error_type}: {}", phase.error.as_deref().unwrap_or("")),
            (None, Some(reason)) => reason.clone(),
            (None, None) => String::new(),
        };
        println!(
            "{:<8} {:<10} {:>10} {}",
            phase.phase.as_str(),
            phase.status.as_str(),
            id_or_dash(phase.duration_ms),
            detail
        );
    }
}

pub fn print_execution(summary: &ExecutionSummary) {
    println!(
        "execution={} plan={} attempt={} status={} total_ms={} read={} written={} deleted={} bytes_written={}",
        summary.execution_id,
        summary.artifact_id,
        summary.attempt,
        summary.status.as_str(),
        summary.total_duration_ms,
        summary.metrics.items_read,
        summary.metrics.items_written,
        summary.metrics.items_deleted,
        summary.metrics.bytes_written
    );
    if let (Some(phase), Some(attribution)) = (summary.failure_phase, summary.failure_attribution) {
        println!("failure_phase={} attribution={}", phase.as_str(), attribution.as_str());
    }
    print_phases(summary);
}

pub fn print_timeline(entries: &[TimelineEntry]) {
    println!("{:<26} {:<22} {:<12} detail", "timestamp", "event", "actor");
    println!("{}", "-".repeat(90));
    for entry in entries {
        println!(
            "{:<26} {:<22} {:<12} {}",
            timestamp(entry.timestamp),
            entry.event_type.as_str(),
            entry.actor,
            entry.detail
        );
    }
}

pub fn print_constraints(summary: &ConstraintSummary) {
    println!(
        "artifact={} data_status={} total={} passed={} failed={} errored={}",
        summary.artifact_id,
        summary.constraint_data_status.as_str(),
        summary.evaluations.total,
        summary.evaluations.passed,
        summary.evaluations.failed,
        summary.evaluations.errored
    );
    if !summary.missing_rulesets.is_empty() {
        println!("missing_rulesets={}", summary.missing_rulesets.join(","));
    }
    println!("{:<24} {:<24} {:<8} {:>10}", "ruleset", "rule", "result", "violations");
    for rule in &summary.rules {
        println!(
            "{:<24} {:<24} {:<8} {:>10}",
            rule.ruleset,
            rule.rule_id,
            rule.result.as_str(),
            rule.violations
        );
    }
    for invariant in &summary.invariants {
        println!(
            "invariant {} status={:?} rules={} violations={} affected={}",
            invariant.invariant,
            invariant.status,
            invariant.rule_count,
            invariant.violation_count,
            invariant.affected_items.join(",")
        );
    }
}

pub fn print_artifact(view: &ArtifactView) {
    let snapshot = &view.snapshot;
    println!(
        "artifact={} type={} status={} risk={} requires_approval={} approval={} executions={} gate_denials={}",
        snapshot.artifact_id,
        snapshot.artifact_type,
        snapshot.status.as_str(),
        snapshot.risk_class.map_or("-", |risk| risk.as_str()),
        if snapshot.requires_approval { "yes" } else { "no" },
        id_or_dash(snapshot.approval_artifact_id),
        snapshot.executions.len(),
        snapshot.gate_denials
    );
    println!("constraint_data_status={}", view.constraint_data_status.as_str());
    for summary in &view.executions {
        println!(
            "  execution={} attempt={} status={} total_ms={}",
            summary.execution_id,
            summary.attempt,
            summary.status.as_str(),
            summary.total_duration_ms
        );
    }
}

pub fn print_audit(trail: &AuditTrail) {
    let snapshot = &trail.snapshot;
    println!(
        "artifact={} type={} status={} events={} created_at={} updated_at={}",
        trail.artifact_id,
        snapshot.artifact_type,
        snapshot.status.as_str(),
        snapshot.event_count,
        timestamp(snapshot.created_at),
        timestamp(snapshot.updated_at)
    );
    println!(
        "approval={} result={} bundle={} superseded_by={} bundles={}",
        id_or_dash(trail.related.approval),
        id_or_dash(trail.related.result),
        id_or_dash(trail.related.bundle),
        id_or_dash(trail.related.superseded_by),
        trail.related.bundles.len()
    );
    print_constraints(&trail.constraints);
    for summary in &trail.executions {
        print_execution(summary);
    }
    print_timeline(&trail.timeline);
}

pub fn print_events(events: &[ArtifactEvent]) {
    println!("{:<26} {:<26} {:<22} {:<26} actor", "event_id", "timestamp", "event", "artifact");
    println!("{}", "-".repeat(120));
    for event in events {
        println!(
            "{:<26} {:<26} {:<22} {:<26} {}",
            event.event_id,
            timestamp(event.timestamp),
            event.event_type.as_str(),
            event.artifact_id,
            event.actor
        );
    }
}

pub fn print_check(check: &LedgerCheck) {
    println!(
        "contract={} healthy={} artifacts_checked={} issues={}",
        check.contract_version,
        if check.healthy { "yes" } else { "no" },
        check.artifacts_checked,
        check.issues.len()
    );
    for issue in &check.issues {
        let severity = match issue.severity {
            CheckSeverity::Warning => "warning",
            CheckSeverity::Error => "error",
        };
        println!(
            "{severity}:{}:{}:{}",
            issue.code,
            id_or_dash(issue.artifact_id),
            issue.message
        );
    }
}
