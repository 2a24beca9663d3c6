use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use effect_ledger_core::{
    ArtifactId, ArtifactStatus, ArtifactTypeRegistry, EffectSummary, EffectType, EnforcementMode,
    EventType, ExecutionPhase, ExecutionStatus, FailureAttribution, HandlerMetrics, PhaseStatus,
    PlanContent, RiskClass, RuleVerdict, RuleViolation, Ruleset, MAX_ERROR_MESSAGE_CHARS,
};
use effect_ledger_harness::{
    vault_handlers, ConstraintBridge, DirectoryContentSource, EmptyContentSource,
    EvaluationRequest, ExecContext, ExecuteOptions, ExecuteResult, Harness, HandlerError, HandlerOutcome,
    HandlerSet, HarnessConfig, OperationHandler, PlanContext, PlanDraft, ProposeOptions,
    SecretRef, SecretResolver,
};
use effect_ledger_store::{ConstraintDataStatus, EventLedger, MemoryContentStore, QueryEngine, QueryFilter};
use serde_json::{json, Value};
use ulid::Ulid;

fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err:#}"),
    }
}

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

struct ReadHandler {
    delay: Duration,
}

impl OperationHandler for ReadHandler {
    fn operation(&self) -> &str {
        "notes.count"
    }

    fn plan(&self, ctx: &PlanContext<'_>, _params: &Value) -> Result<PlanDraft, HandlerError> {
        Ok(PlanDraft {
            plan: json!({"observed": ctx.inputs.content_hash}),
            effect_summary: EffectSummary::new(EffectType::Read),
        })
    }

    fn execute(&self, _ctx: &ExecContext<'_>, _plan: &PlanContent) -> Result<HandlerOutcome, HandlerError> {
        thread::sleep(self.delay);
        Ok(HandlerOutcome {
            metrics: HandlerMetrics {
                items_read: 12,
                ..HandlerMetrics::default()
            },
            output: json!({"notes": 12}),
            ..HandlerOutcome::default()
        })
    }
}

/// Predicts erasing 100 notes; fails its first `failures` executions.
struct EraseHandler {
    failures: Mutex<u32>,
}

impl EraseHandler {
    fn failing(times: u32) -> Self {
        Self {
            failures: Mutex::new(times),
        }
    }
}

impl OperationHandler for EraseHandler {
    fn operation(&self) -> &str {
        "notes.erase"
    }

    fn plan(&self, _ctx: &PlanContext<'_>, _params: &Value) -> Result<PlanDraft, HandlerError> {
        Ok(PlanDraft {
            plan: json!({"notes": 100}),
            effect_summary: EffectSummary::new(EffectType::Reversible).with_erasure("notes", 100),
        })
    }

    fn execute(&self, _ctx: &ExecContext<'_>, _plan: &PlanContent) -> Result<HandlerOutcome, HandlerError> {
        let mut remaining = self
            .failures
            .lock()
            .map_err(|_| HandlerError::new("poisoned", "failure counter poisoned"))?;
        if *remaining > 0 {
            *remaining -= 1;
            return Err(HandlerError::new("disk_full", "x".repeat(MAX_ERROR_MESSAGE_CHARS * 2)));
        }
        let mut erased = std::collections::BTreeMap::new();
        erased.insert("notes".to_string(), 100);
        Ok(HandlerOutcome {
            metrics: HandlerMetrics {
                items_deleted: 100,
                ..HandlerMetrics::default()
            },
            output: json!({"deleted": 100}),
            erased,
            ..HandlerOutcome::default()
        })
    }
}

struct SecretEcho;

impl OperationHandler for SecretEcho {
    fn operation(&self) -> &str {
        "secret.echo"
    }

    fn plan(&self, _ctx: &PlanContext<'_>, params: &Value) -> Result<PlanDraft, HandlerError> {
        Ok(PlanDraft {
            plan: json!({"token": params.get("token").cloned().unwrap_or(Value::Null)}),
            effect_summary: EffectSummary::new(EffectType::Read),
        })
    }

    fn execute(&self, ctx: &ExecContext<'_>, plan: &PlanContent) -> Result<HandlerOutcome, HandlerError> {
        let reference = plan
            .plan
            .get("token")
            .and_then(SecretRef::from_value)
            .ok_or_else(|| HandlerError::new("invalid_plan", "missing token"))?;
        let secret = ctx.resolve_secret(&reference)?;
        Ok(HandlerOutcome {
            output: json!({"echo": format!("token={secret}")}),
            ..HandlerOutcome::default()
        })
    }
}

struct StaticSecrets;

impl SecretResolver for StaticSecrets {
    fn resolve(&self, reference: &SecretRef) -> Result<String, HandlerError> {
        match reference.name() {
            "deploy" => Ok("s3cr3t-value".to_string()),
            other => Err(HandlerError::new("secret_unavailable", format!("unknown secret {other}"))),
        }
    }
}

fn passing_evaluator(_request: &EvaluationRequest) -> Result<RuleVerdict> {
    Ok(RuleVerdict::pass(json!({"checked": true})))
}

fn ruleset(id: &str, severity: &str) -> Ruleset {
    must_ok(Ruleset::from_json(&json!({
        "id": id,
        "version": "1",
        "rules": [{"rule_id": "scope", "invariant": "Bounded Scope", "severity": severity}],
    })))
}

struct Fixture {
    ledger: EventLedger,
    content: MemoryContentStore,
    registry: ArtifactTypeRegistry,
    source: EmptyContentSource,
    secrets: StaticSecrets,
    bridge: ConstraintBridge,
}

impl Fixture {
    fn new() -> Self {
        let mut bridge = ConstraintBridge::new(Some(Box::new(passing_evaluator)));
        must_ok(bridge.add_ruleset(ruleset("vault-hygiene", "warn"), "inline:vault-hygiene"));
        Self::with_bridge(bridge)
    }

    fn with_bridge(bridge: ConstraintBridge) -> Self {
        Self {
            ledger: must(EventLedger::in_memory()),
            content: MemoryContentStore::new(),
            registry: ArtifactTypeRegistry::with_defaults(),
            source: EmptyContentSource,
            secrets: StaticSecrets,
            bridge,
        }
    }

    fn harness(&self) -> Harness<'_> {
        self.harness_with(HarnessConfig::default())
    }

    fn harness_with(&self, config: HarnessConfig) -> Harness<'_> {
        must_ok(Harness::new(
            &self.ledger,
            &self.content,
            &self.registry,
            &self.source,
            &self.secrets,
            config,
        ))
        .with_bridge(&self.bridge)
    }

    fn count(&self, event_type: EventType) -> usize {
        must(self.ledger.query(&QueryFilter::new().event_type(event_type))).len()
    }

    fn snapshot(&self, artifact_id: ArtifactId) -> effect_ledger_core::ArtifactSnapshot {
        must_some(must(QueryEngine::new(&self.ledger).snapshot(artifact_id)))
    }
}

fn temp_ledger_path() -> PathBuf {
    std::env::temp_dir().join(format!("elg-shared-{}.sqlite3", Ulid::new()))
}

fn remove_ledger(path: &std::path::Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut target = path.as_os_str().to_os_string();
        target.push(suffix);
        let _ = fs::remove_file(PathBuf::from(target));
    }
}

fn shared_harness<'a>(
    ledger: &'a EventLedger,
    content: &'a MemoryContentStore,
    registry: &'a ArtifactTypeRegistry,
) -> Harness<'a> {
    must_ok(Harness::new(
        ledger,
        content,
        registry,
        &EmptyContentSource,
        &StaticSecrets,
        HarnessConfig::default(),
    ))
}

fn failure_kind(result: &ExecuteResult) -> Option<&str> {
    result.failure.as_ref().map(|failure| failure.kind.as_str())
}

/// Every phase an execution started was later completed, failed or skipped.
fn assert_phases_closed(result: &ExecuteResult) {
    if let Some(summary) = &result.summary {
        assert!(
            summary.unterminated_phases.is_empty(),
            "execution left phases open: {:?}",
            summary.unterminated_phases
        );
    }
}

fn propose(harness: &Harness<'_>, handler: &dyn OperationHandler, params: Value) -> ArtifactId {
    let proposed = must(harness.propose(handler, params, &ProposeOptions::default()));
    assert!(proposed.success(), "proposal failed: {:?}", proposed.failure);
    must_some(proposed.plan_artifact_id)
}

#[test]
fn read_only_run_needs_no_approval() {
    let fixture = Fixture::new();
    let harness = fixture.harness();
    let handler = ReadHandler { delay: Duration::ZERO };

    let run = must(harness.run(&handler, json!({}), &ExecuteOptions::default()));
    assert!(run.success(), "run failed: {:?}", run.failure());
    assert!(!run.propose.requires_approval);
    assert_eq!(run.propose.risk_class, Some(RiskClass::ReadOnly));
    assert_eq!(fixture.count(EventType::ArtifactApproved), 0);

    let plan_id = must_some(run.propose.plan_artifact_id);
    let snapshot = fixture.snapshot(plan_id);
    assert_eq!(snapshot.status, ArtifactStatus::Executed);
    assert!(snapshot.approval_artifact_id.is_none());

    let execute = must_some(run.execute);
    let summary = must_some(execute.summary);
    assert_eq!(summary.status, ExecutionStatus::Succeeded);
    assert_eq!(summary.metrics.items_read, 12);
    assert_eq!(summary.phases.len(), 3);
}

#[test]
fn destructive_plan_is_gated_until_approved() {
    let fixture = Fixture::new();
    let harness = fixture.harness();
    let handler = EraseHandler::failing(0);

    let proposed = must(harness.propose(&handler, json!({}), &ProposeOptions::default()));
    assert_eq!(proposed.risk_class, Some(RiskClass::MutationDestructive));
    assert!(proposed.requires_approval);
    assert!(proposed
        .risk_reasons
        .iter()
        .any(|reason| reason == "predicted_erasure:notes=100"));
    let plan_id = must_some(proposed.plan_artifact_id);

    let denied = must(harness.execute(plan_id, &handler, &ExecuteOptions::default()));
    assert!(!denied.success);
    let failure = must_some(denied.failure);
    assert_eq!(failure.kind, "gate_denied");
    assert!(failure.message.contains("approval required"));

    let rejections = must(fixture.ledger.query(
        &QueryFilter::new()
            .artifact(plan_id)
            .event_type(EventType::ArtifactRejected),
    ));
    assert_eq!(rejections.len(), 1);
    assert_eq!(
        rejections[0].payload_field("stage"),
        Some(&json!("execution_gate"))
    );
    let snapshot = fixture.snapshot(plan_id);
    assert_eq!(snapshot.status, ArtifactStatus::Validated);
    assert_eq!(snapshot.gate_denials, 1);

    // a dry run is gated the same way
    let dry = must(harness.execute(
        plan_id,
        &handler,
        &ExecuteOptions {
            dry_run: true,
            ..ExecuteOptions::default()
        },
    ));
    assert_eq!(dry.failure.map(|failure| failure.kind), Some("gate_denied".to_string()));
}

#[test]
fn force_acknowledged_approval_unlocks_execution_and_bundle() {
    let fixture = Fixture::new();
    let harness = fixture.harness();
    let handler = EraseHandler::failing(0);
    let plan_id = propose(&harness, &handler, json!({}));

    let unacknowledged = must(harness.approve(plan_id, "reviewer", false, None));
    assert_eq!(
        unacknowledged.failure.map(|failure| failure.kind),
        Some("gate_denied".to_string())
    );

    let approved = must(harness.approve(plan_id, "reviewer", true, Some("quarterly cleanup".to_string())));
    assert!(approved.success(), "approval failed: {:?}", approved.failure);
    let approval_id = must_some(approved.approval_artifact_id);

    let executed = must(harness.execute(plan_id, &handler, &ExecuteOptions::default()));
    assert!(executed.success, "execution failed: {:?}", executed.failure);

    assert_eq!(fixture.count(EventType::ArtifactApproved), 1);
    assert_eq!(fixture.count(EventType::ArtifactExecuted), 1);

    let engine = QueryEngine::new(&fixture.ledger);
    let bundles = must(engine.bundles_for(plan_id));
    assert_eq!(bundles.len(), 1);
    assert_eq!(Some(bundles[0].artifact_id), executed.bundle_artifact_id);
    let rulesets = must_some(bundles[0].payload_field("content.repro.rulesets"));
    assert_eq!(rulesets.as_array().map(Vec::len), Some(1));
    assert_eq!(
        bundles[0].payload_field("content.artifacts.approval"),
        Some(&json!(approval_id))
    );

    let snapshot = fixture.snapshot(plan_id);
    assert_eq!(snapshot.status, ArtifactStatus::Executed);
    assert_eq!(snapshot.result_artifact_id, executed.result_artifact_id);

    let again = must(harness.execute(plan_id, &handler, &ExecuteOptions::default()));
    assert_eq!(again.failure.map(|failure| failure.kind), Some("conflict".to_string()));
}

#[test]
fn handler_failure_keeps_plan_approved_and_retry_gets_new_execution() {
    let fixture = Fixture::new();
    let harness = fixture.harness();
    let handler = EraseHandler::failing(1);
    let plan_id = propose(&harness, &handler, json!({}));
    let approved = must(harness.approve(plan_id, "reviewer", true, None));
    assert!(approved.success());

    let failed = must(harness.execute(plan_id, &handler, &ExecuteOptions::default()));
    assert!(!failed.success);
    let failure = must_some(failed.failure.clone());
    assert_eq!(failure.kind, "handler_execution_error");
    assert_eq!(failure.error_type.as_deref(), Some("disk_full"));

    let first_execution = must_some(failed.execution_id);
    let failed_logs: Vec<_> = must(QueryEngine::new(&fixture.ledger).execution_logs(first_execution))
        .into_iter()
        .filter(|event| event.payload_field("status") == Some(&json!("failed")))
        .collect();
    assert_eq!(failed_logs.len(), 1);
    assert_eq!(failed_logs[0].payload_field("phase"), Some(&json!("execute")));
    assert_eq!(failed_logs[0].payload_field("error_type"), Some(&json!("disk_full")));
    let error = must_some(failed_logs[0].payload_field("error").and_then(Value::as_str));
    assert!(error.chars().count() <= MAX_ERROR_MESSAGE_CHARS);

    let summary = must_some(failed.summary);
    assert_eq!(summary.failure_phase, Some(ExecutionPhase::Execute));
    assert_eq!(summary.failure_attribution, Some(FailureAttribution::Handler));
    assert_eq!(fixture.snapshot(plan_id).status, ArtifactStatus::Approved);

    let retried = must(harness.execute(plan_id, &handler, &ExecuteOptions::default()));
    assert!(retried.success, "retry failed: {:?}", retried.failure);
    assert_ne!(retried.execution_id, Some(first_execution));
    assert_eq!(retried.attempt, Some(2));
    assert_eq!(fixture.snapshot(plan_id).executions.len(), 2);
}

#[test]
fn concurrent_execution_of_one_plan_runs_once() {
    let fixture = Fixture::new();
    let harness = fixture.harness();
    let handler = ReadHandler {
        delay: Duration::from_millis(150),
    };
    let plan_id = propose(&harness, &handler, json!({}));

    let results = thread::scope(|scope| {
        let workers: Vec<_> = (0..2)
            .map(|_| scope.spawn(|| must(harness.execute(plan_id, &handler, &ExecuteOptions::default()))))
            .collect();
        workers
            .into_iter()
            .map(|worker| match worker.join() {
                Ok(result) => result,
                Err(_) => panic!("worker panicked"),
            })
            .collect::<Vec<_>>()
    });

    let successes = results.iter().filter(|result| result.success).count();
    assert_eq!(successes, 1);
    let conflicts = results
        .iter()
        .filter(|result| result.failure.as_ref().is_some_and(|failure| failure.kind == "conflict"))
        .count();
    assert_eq!(conflicts, 1);
    assert_eq!(fixture.count(EventType::ArtifactExecuted), 1);
}

#[test]
fn ledgers_sharing_one_sqlite_file_execute_a_plan_once() {
    let path = temp_ledger_path();
    let content = MemoryContentStore::new();
    let registry = ArtifactTypeRegistry::with_defaults();
    let ledgers = [must(EventLedger::open_sqlite(&path)), must(EventLedger::open_sqlite(&path))];
    let harnesses: Vec<Harness<'_>> = ledgers
        .iter()
        .map(|ledger| shared_harness(ledger, &content, &registry))
        .collect();
    let handler = ReadHandler {
        delay: Duration::from_millis(100),
    };
    let plan_id = propose(&harnesses[0], &handler, json!({}));

    let results = thread::scope(|scope| {
        let handler = &handler;
        let workers: Vec<_> = harnesses
            .iter()
            .map(|harness| {
                scope.spawn(move || must(harness.execute(plan_id, handler, &ExecuteOptions::default())))
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| match worker.join() {
                Ok(result) => result,
                Err(_) => panic!("worker panicked"),
            })
            .collect::<Vec<_>>()
    });

    assert_eq!(results.iter().filter(|result| result.success).count(), 1);
    assert_eq!(
        results.iter().filter(|result| failure_kind(result) == Some("conflict")).count(),
        1
    );
    for result in &results {
        assert_phases_closed(result);
    }

    let late = must(harnesses[1].execute(plan_id, &handler, &ExecuteOptions::default()));
    assert_eq!(failure_kind(&late), Some("conflict"));

    drop(harnesses);
    drop(ledgers);
    let reopened = must(EventLedger::open_sqlite(&path));
    let engine = QueryEngine::new(&reopened);
    let executed = must(reopened.query(&QueryFilter::new().event_type(EventType::ArtifactExecuted)));
    assert_eq!(executed.len(), 1);
    assert_eq!(must(engine.bundles_for(plan_id)).len(), 1);
    assert_eq!(must_some(must(engine.snapshot(plan_id))).status, ArtifactStatus::Executed);
    for execution_id in must(engine.executions_for(plan_id)) {
        let summary = must_some(must(engine.execution_summary(execution_id)));
        assert!(summary.unterminated_phases.is_empty());
    }
    drop(reopened);
    remove_ledger(&path);
}

/// Runs a second harness against the same plan from inside its own execute.
struct NestedExecution<'h> {
    inner: &'h Harness<'h>,
    observed: Mutex<Option<ExecuteResult>>,
}

impl OperationHandler for NestedExecution<'_> {
    fn operation(&self) -> &str {
        "notes.count"
    }

    fn plan(&self, ctx: &PlanContext<'_>, params: &Value) -> Result<PlanDraft, HandlerError> {
        ReadHandler { delay: Duration::ZERO }.plan(ctx, params)
    }

    fn execute(&self, ctx: &ExecContext<'_>, plan: &PlanContent) -> Result<HandlerOutcome, HandlerError> {
        let nested = self
            .inner
            .execute(ctx.plan_artifact_id, &ReadHandler { delay: Duration::ZERO }, &ExecuteOptions::default())
            .map_err(|err| HandlerError::new("nested", format!("{err:#}")))?;
        let mut observed = self
            .observed
            .lock()
            .map_err(|_| HandlerError::new("poisoned", "observation lock poisoned"))?;
        *observed = Some(nested);
        ReadHandler { delay: Duration::ZERO }.execute(ctx, plan)
    }
}

#[test]
fn nested_execution_through_the_same_ledger_is_refused() {
    let fixture = Fixture::new();
    let outer = fixture.harness();
    let inner = fixture.harness();
    let handler = NestedExecution {
        inner: &inner,
        observed: Mutex::new(None),
    };
    let plan_id = propose(&outer, &handler, json!({}));

    let result = must(outer.execute(plan_id, &handler, &ExecuteOptions::default()));
    assert!(result.success, "outer execution failed: {:?}", result.failure);
    assert_phases_closed(&result);

    let nested = must_some(must_ok(handler.observed.into_inner()));
    assert_eq!(failure_kind(&nested), Some("conflict"));
    assert_eq!(nested.execution_id, None);
    assert_eq!(fixture.count(EventType::ArtifactExecuted), 1);
}

#[test]
fn execution_overtaken_by_another_writer_closes_its_phases() {
    let path = temp_ledger_path();
    let content = MemoryContentStore::new();
    let registry = ArtifactTypeRegistry::with_defaults();
    let outer_ledger = must(EventLedger::open_sqlite(&path));
    let inner_ledger = must(EventLedger::open_sqlite(&path));
    let outer = shared_harness(&outer_ledger, &content, &registry);
    let inner = shared_harness(&inner_ledger, &content, &registry);
    let handler = NestedExecution {
        inner: &inner,
        observed: Mutex::new(None),
    };
    let plan_id = propose(&outer, &handler, json!({}));

    let result = must(outer.execute(plan_id, &handler, &ExecuteOptions::default()));
    assert!(!result.success);
    assert_eq!(failure_kind(&result), Some("conflict"));
    assert_eq!(result.bundle_artifact_id, None);
    assert_phases_closed(&result);
    let summary = must_some(result.summary);
    assert_eq!(summary.status, ExecutionStatus::Failed);
    assert_eq!(summary.failure_phase, Some(ExecutionPhase::Commit));
    assert_eq!(summary.error_type.as_deref(), Some("conflict"));
    let execute = must_some(
        summary
            .phases
            .iter()
            .find(|phase| phase.phase == ExecutionPhase::Execute),
    );
    assert_eq!(execute.status, PhaseStatus::Completed);

    let nested = must_some(must_ok(handler.observed.into_inner()));
    assert!(nested.success, "nested execution failed: {:?}", nested.failure);

    must(outer_ledger.refresh());
    let engine = QueryEngine::new(&outer_ledger);
    let executed = must(outer_ledger.query(&QueryFilter::new().event_type(EventType::ArtifactExecuted)));
    assert_eq!(executed.len(), 1);
    assert_eq!(must(engine.bundles_for(plan_id)).len(), 1);
    assert_eq!(must_some(must(engine.snapshot(plan_id))).status, ArtifactStatus::Executed);

    drop((outer, inner));
    drop((outer_ledger, inner_ledger));
    remove_ledger(&path);
}

#[test]
fn dry_run_logs_skips_and_leaves_status() {
    let fixture = Fixture::new();
    let harness = fixture.harness();
    let handler = ReadHandler { delay: Duration::ZERO };
    let plan_id = propose(&harness, &handler, json!({}));

    let dry = must(harness.execute(
        plan_id,
        &handler,
        &ExecuteOptions {
            dry_run: true,
            ..ExecuteOptions::default()
        },
    ));
    assert!(dry.success);
    assert!(dry.result_artifact_id.is_none());
    assert!(dry.bundle_artifact_id.is_none());
    let summary = must_some(dry.summary);
    assert_eq!(summary.status, ExecutionStatus::DryRun);
    let skipped: Vec<_> = summary
        .phases
        .iter()
        .filter(|phase| phase.status == PhaseStatus::Skipped)
        .map(|phase| (phase.phase, phase.skip_reason.clone()))
        .collect();
    assert_eq!(
        skipped,
        vec![
            (ExecutionPhase::Execute, Some("dry_run".to_string())),
            (ExecutionPhase::Commit, Some("dry_run".to_string())),
        ]
    );
    assert_eq!(fixture.snapshot(plan_id).status, ArtifactStatus::Validated);
    assert_eq!(fixture.count(EventType::ArtifactCreated), 1);

    let real = must(harness.execute(plan_id, &handler, &ExecuteOptions::default()));
    assert!(real.success);
    assert_eq!(real.attempt, Some(2));
}

#[test]
fn executing_a_superseding_plan_marks_the_old_one() {
    let fixture = Fixture::new();
    let harness = fixture.harness();
    let handler = ReadHandler { delay: Duration::ZERO };

    let first = must(harness.run(&handler, json!({}), &ExecuteOptions::default()));
    let first_id = must_some(first.propose.plan_artifact_id);

    let proposed = must(harness.propose(
        &handler,
        json!({}),
        &ProposeOptions {
            supersedes: Some(first_id),
            ..ProposeOptions::default()
        },
    ));
    let second_id = must_some(proposed.plan_artifact_id);
    let executed = must(harness.execute(second_id, &handler, &ExecuteOptions::default()));
    assert!(executed.success);
    assert_eq!(executed.superseded, Some(first_id));

    let old = fixture.snapshot(first_id);
    assert_eq!(old.status, ArtifactStatus::Superseded);
    assert_eq!(old.superseded_by, Some(second_id));

    let trail = must_some(must(QueryEngine::new(&fixture.ledger).audit_trail(second_id)));
    assert_eq!(trail.related.inputs, vec![first_id]);

    let unknown = must(harness.propose(
        &handler,
        json!({}),
        &ProposeOptions {
            supersedes: Some(ArtifactId::new()),
            ..ProposeOptions::default()
        },
    ));
    assert!(!unknown.success());
    assert!(unknown.plan_artifact_id.is_none());
}

#[test]
fn secrets_are_referenced_resolved_and_never_recorded() {
    let fixture = Fixture::new();
    let harness = fixture.harness();

    let inline = must(harness.propose(&SecretEcho, json!({"token": "s3cr3t-value"}), &ProposeOptions::default()));
    assert!(!inline.success());
    assert!(inline.plan_artifact_id.is_none());
    assert!(must(fixture.ledger.is_empty()));

    let reserved = must(harness.propose(&SecretEcho, json!({"risk_class": "read_only"}), &ProposeOptions::default()));
    assert_eq!(reserved.failure.map(|failure| failure.kind), Some("validation_error".to_string()));

    let run = must(harness.run(&SecretEcho, json!({"token": "secret://deploy"}), &ExecuteOptions::default()));
    assert!(run.success(), "run failed: {:?}", run.failure());
    let output = must_some(must_some(run.execute).output);
    assert_eq!(output, json!({"echo": "token=[redacted]"}));

    let recorded = must_ok(serde_json::to_string(&must(fixture.ledger.events())));
    assert!(!recorded.contains("s3cr3t-value"));
    assert!(recorded.contains("secret://deploy"));
}

#[test]
fn mismatched_handler_is_a_validation_failure() {
    let fixture = Fixture::new();
    let harness = fixture.harness();
    let plan_id = propose(&harness, &ReadHandler { delay: Duration::ZERO }, json!({}));

    let result = must(harness.execute(plan_id, &SecretEcho, &ExecuteOptions::default()));
    assert_eq!(result.failure.map(|failure| failure.kind), Some("validation_error".to_string()));
    assert_eq!(fixture.snapshot(plan_id).status, ArtifactStatus::Validated);
    assert_eq!(fixture.count(EventType::ExecutionLogged), 0);
}

#[test]
fn strict_mode_rejects_plans_with_failing_rules() {
    let evaluator = |_request: &EvaluationRequest| -> Result<RuleVerdict> {
        Ok(RuleVerdict::fail(vec![RuleViolation {
            item_id: Some("notes/a.md".to_string()),
            message: "out of scope".to_string(),
            evidence: Value::Null,
        }]))
    };
    let mut bridge = ConstraintBridge::new(Some(Box::new(evaluator)));
    must_ok(bridge.add_ruleset(ruleset("scope-guard", "fail"), "inline:scope-guard"));
    let fixture = Fixture::with_bridge(bridge);
    let handler = ReadHandler { delay: Duration::ZERO };

    let local = must(fixture.harness().propose(&handler, json!({}), &ProposeOptions::default()));
    assert!(local.success());
    assert_eq!(local.warnings.len(), 1);
    assert_eq!(local.constraints.map(|digest| digest.violations), Some(1));

    let strict = fixture.harness_with(HarnessConfig {
        enforcement: EnforcementMode::Strict,
        ..HarnessConfig::default()
    });
    let rejected = must(strict.propose(&handler, json!({}), &ProposeOptions::default()));
    assert!(!rejected.success());
    assert_eq!(rejected.status, Some(ArtifactStatus::Rejected));
    let plan_id = must_some(rejected.plan_artifact_id);
    assert_eq!(fixture.snapshot(plan_id).status, ArtifactStatus::Rejected);

    let summary = must(QueryEngine::new(&fixture.ledger).constraint_summary(plan_id));
    assert_eq!(summary.constraint_data_status, ConstraintDataStatus::Present);
    assert_eq!(summary.active_rulesets.len(), 1);
    assert_eq!(summary.evaluations.failed, 1);
}

#[test]
fn mislabelled_read_plans_warn_and_still_need_approval() {
    struct Mislabelled;

    impl OperationHandler for Mislabelled {
        fn operation(&self) -> &str {
            "notes.tidy"
        }

        fn plan(&self, _ctx: &PlanContext<'_>, _params: &Value) -> Result<PlanDraft, HandlerError> {
            Ok(PlanDraft {
                plan: json!({}),
                effect_summary: EffectSummary::new(EffectType::Read).with_erasure("notes", 3),
            })
        }

        fn execute(&self, _ctx: &ExecContext<'_>, _plan: &PlanContent) -> Result<HandlerOutcome, HandlerError> {
            Ok(HandlerOutcome::default())
        }
    }

    let fixture = Fixture::new();
    let proposed = must(fixture.harness().propose(&Mislabelled, json!({}), &ProposeOptions::default()));
    assert!(proposed.requires_approval);
    assert!(proposed
        .warnings
        .iter()
        .any(|issue| issue.code == "plan.effect_label_mismatch"));

    let run = must(fixture.harness().run(&Mislabelled, json!({}), &ExecuteOptions::default()));
    assert_eq!(run.failure().map(|failure| failure.kind.clone()), Some("gate_denied".to_string()));
}

fn temp_vault() -> PathBuf {
    let root = std::env::temp_dir().join(format!("elg-scenario-vault-{}", Ulid::new()));
    must_ok(fs::create_dir_all(root.join("archive")));
    must_ok(fs::write(root.join("archive/2019.md"), "old"));
    must_ok(fs::write(root.join("archive/2020.md"), "older"));
    must_ok(fs::write(root.join("inbox.md"), "keep"));
    root
}

#[test]
fn vault_purge_goes_through_the_full_protocol() {
    let root = temp_vault();
    let ledger = must(EventLedger::in_memory());
    let content = MemoryContentStore::new();
    let registry = ArtifactTypeRegistry::with_defaults();
    let source = DirectoryContentSource::new(&root);
    let harness = must_ok(Harness::new(
        &ledger,
        &content,
        &registry,
        &source,
        &StaticSecrets,
        HarnessConfig::default(),
    ));
    let mut handlers = HandlerSet::new();
    for handler in vault_handlers(&root, None) {
        must_ok(handlers.register(handler));
    }
    let purge = must_ok(handlers.require("vault.purge"));

    let run = must(harness.run(purge, json!({"prefix": "archive"}), &ExecuteOptions::default()));
    assert_eq!(run.failure().map(|failure| failure.kind.clone()), Some("gate_denied".to_string()));
    assert!(root.join("archive/2019.md").exists());

    let plan_id = must_some(run.propose.plan_artifact_id);
    assert!(must(harness.approve(plan_id, "owner", true, None)).success());
    let executed = must(harness.execute(plan_id, purge, &ExecuteOptions::default()));
    assert!(executed.success, "purge failed: {:?}", executed.failure);
    assert!(!root.join("archive/2019.md").exists());
    assert!(root.join("inbox.md").exists());
    assert_eq!(must_some(executed.summary).metrics.items_deleted, 2);

    let _ = fs::remove_dir_all(root);
}

#[test]
fn changed_inputs_fail_in_prepare() {
    let root = temp_vault();
    let ledger = must(EventLedger::in_memory());
    let content = MemoryContentStore::new();
    let registry = ArtifactTypeRegistry::with_defaults();
    let source = DirectoryContentSource::new(&root);
    let harness = must_ok(Harness::new(
        &ledger,
        &content,
        &registry,
        &source,
        &StaticSecrets,
        HarnessConfig::default(),
    ));
    let handlers = vault_handlers(&root, None);
    let snapshot: &dyn OperationHandler =
        &**must_some(handlers.iter().find(|handler| handler.operation() == "vault.snapshot"));

    let plan_id = propose(&harness, snapshot, json!({}));
    must_ok(fs::write(root.join("inbox.md"), "edited"));

    let result = must(harness.execute(plan_id, snapshot, &ExecuteOptions::default()));
    let failure = must_some(result.failure);
    assert_eq!(failure.error_type.as_deref(), Some("stale_inputs"));
    let summary = must_some(result.summary);
    assert_eq!(summary.failure_phase, Some(ExecutionPhase::Prepare));
    assert_eq!(
        summary.failure_attribution,
        Some(FailureAttribution::EnvironmentOrGovernance)
    );

    let _ = fs::remove_dir_all(root);
}

#[test]
fn ruleset_that_failed_to_load_leaves_constraint_data_partial() {
    let dir = std::env::temp_dir().join(format!("elg-rulesets-{}", Ulid::new()));
    must_ok(fs::create_dir_all(&dir));
    let broken = dir.join("links.json");
    must_ok(fs::write(&broken, "{\"id\": \"links\", \"rules\": ["));

    let mut bridge = ConstraintBridge::new(Some(Box::new(passing_evaluator)));
    must_ok(bridge.add_ruleset(ruleset("vault-hygiene", "warn"), "inline:vault-hygiene"));
    let scratch = MemoryContentStore::new();
    assert!(bridge.load_ruleset_file(&broken, &scratch).is_err());
    let fixture = Fixture::with_bridge(bridge);
    let harness = fixture.harness();

    let proposed = must(harness.propose(&ReadHandler { delay: Duration::ZERO }, json!({}), &ProposeOptions::default()));
    assert!(proposed.success());
    let digest = must_some(proposed.constraints);
    assert_eq!(digest.ruleset_errors.len(), 1);
    assert_eq!(digest.failed_rulesets, vec![broken.display().to_string()]);

    let plan_id = must_some(proposed.plan_artifact_id);
    let summary = must(QueryEngine::new(&fixture.ledger).constraint_summary(plan_id));
    assert_eq!(summary.constraint_data_status, ConstraintDataStatus::Partial);
    assert_eq!(summary.evaluated_rulesets, vec!["vault-hygiene@1".to_string()]);
    assert_eq!(summary.missing_rulesets, vec![broken.display().to_string()]);

    let _ = fs::remove_dir_all(dir);
}
