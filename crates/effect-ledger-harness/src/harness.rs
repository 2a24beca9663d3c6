use anyhow::{Context, Result};
use effect_ledger_core::{
    classify, now_utc, millis_between, truncate_message, ApprovalContent, ArtifactId,
    ArtifactSnapshot, ArtifactStatus, ArtifactTypeRegistry, BundleArtifacts, BundleContent,
    ConstraintDigest, EnvironmentInfo, EventType, ExecutedPayload, ExecutionId,
    ExecutionLogPayload, ExecutionPhase, ExecutionSummary, GovernanceError, HandlerMetrics,
    PhaseStatus, PlanContent, RejectedPayload, RejectionStage, ReproHeader, ResultContent,
    RiskClass, RulesetRef, ValidatedPayload, ValidationIssue, BUNDLE_VERSION,
};
use effect_ledger_store::{ContentStore, EventLedger, QueryEngine, QueryFilter};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::bridge::ConstraintBridge;
use crate::config::HarnessConfig;
use crate::handler::{ExecContext, HandlerError, HandlerOutcome, OperationHandler, PlanContext};
use crate::plan_manager::{ExecutionRecord, PlanManager};
use crate::secrets::{screen_params, SecretResolver};
use crate::source::ContentSource;

/// An expected, non-exceptional outcome: returned as data, never raised.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Failure {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl Failure {
    /// Rebuilds the typed error, for exit codes and `?` at the surface.
    #[must_use]
    pub fn to_error(&self) -> GovernanceError {
        let message = self.message.clone();
        match self.kind.as_str() {
            "gate_denied" => GovernanceError::GateDenied(message),
            "handler_execution_error" => GovernanceError::HandlerExecution {
                error_type: self.error_type.clone().unwrap_or_else(|| "unknown".to_string()),
                message,
            },
            "type_validation_error" => GovernanceError::TypeValidation(message),
            "ruleset_load_error" => GovernanceError::RulesetLoad(message),
            "conflict" => GovernanceError::Conflict(message),
            "projection_error" => GovernanceError::Projection(message),
            "configuration_error" => GovernanceError::Configuration(message),
            _ => GovernanceError::Validation(message),
        }
    }
}

impl From<GovernanceError> for Failure {
    fn from(err: GovernanceError) -> Self {
        let error_type = match &err {
            GovernanceError::HandlerExecution { error_type, .. } => Some(error_type.clone()),
            _ => None,
        };
        Self {
            kind: err.kind().to_string(),
            message: err.message().to_string(),
            error_type,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProposeOptions {
    pub actor: Option<String>,
    /// An executed plan this one replaces once it runs.
    pub supersedes: Option<ArtifactId>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub actor: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProposeResult {
    pub operation: String,
    pub plan_artifact_id: Option<ArtifactId>,
    pub status: Option<ArtifactStatus>,
    pub risk_class: Option<RiskClass>,
    pub risk_reasons: Vec<String>,
    pub requires_approval: bool,
    pub validation_errors: Vec<String>,
    pub warnings: Vec<ValidationIssue>,
    pub constraints: Option<ConstraintDigest>,
    pub failure: Option<Failure>,
}

impl ProposeResult {
    fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            plan_artifact_id: None,
            status: None,
            risk_class: None,
            risk_reasons: Vec::new(),
            requires_approval: false,
            validation_errors: Vec::new(),
            warnings: Vec::new(),
            constraints: None,
            failure: None,
        }
    }

    fn refused(mut self, errors: Vec<String>) -> Self {
        self.failure = Some(GovernanceError::Validation(errors.join("; ")).into());
        self.validation_errors = errors;
        self
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ApproveResult {
    pub plan_artifact_id: ArtifactId,
    pub approval_artifact_id: Option<ArtifactId>,
    pub approver: String,
    pub force_ack: bool,
    pub failure: Option<Failure>,
}

impl ApproveResult {
    #[must_use]
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RejectResult {
    pub plan_artifact_id: ArtifactId,
    pub failure: Option<Failure>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecuteResult {
    pub plan_artifact_id: ArtifactId,
    pub success: bool,
    pub dry_run: bool,
    pub execution_id: Option<ExecutionId>,
    pub attempt: Option<u32>,
    pub result_artifact_id: Option<ArtifactId>,
    pub bundle_artifact_id: Option<ArtifactId>,
    pub superseded: Option<ArtifactId>,
    pub output: Option<Value>,
    pub summary: Option<ExecutionSummary>,
    pub failure: Option<Failure>,
}

impl ExecuteResult {
    fn new(plan_artifact_id: ArtifactId, dry_run: bool) -> Self {
        Self {
            plan_artifact_id,
            success: false,
            dry_run,
            execution_id: None,
            attempt: None,
            result_artifact_id: None,
            bundle_artifact_id: None,
            superseded: None,
            output: None,
            summary: None,
            failure: None,
        }
    }

    fn failed(mut self, err: GovernanceError) -> Self {
        self.success = false;
        self.failure = Some(err.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunResult {
    pub propose: ProposeResult,
    pub execute: Option<ExecuteResult>,
}

impl RunResult {
    #[must_use]
    pub fn success(&self) -> bool {
        self.propose.success() && self.execute.as_ref().is_some_and(|execute| execute.success)
    }

    #[must_use]
    pub fn failure(&self) -> Option<&Failure> {
        self.propose
            .failure
            .as_ref()
            .or_else(|| self.execute.as_ref().and_then(|execute| execute.failure.as_ref()))
    }
}

/// Lifecycle errors and type validation are expected outcomes; anything
/// else (I/O, corruption) stays an error.
fn expected_failure(err: anyhow::Error) -> Result<Failure> {
    let expected = err.downcast_ref::<GovernanceError>().and_then(|governance| {
        matches!(
            governance,
            GovernanceError::Validation(_)
                | GovernanceError::Conflict(_)
                | GovernanceError::TypeValidation(_)
                | GovernanceError::GateDenied(_)
        )
        .then(|| governance.clone())
    });
    match expected {
        Some(governance) => Ok(governance.into()),
        None => Err(err),
    }
}

struct PhaseLog {
    execution_id: ExecutionId,
    attempt: u32,
    dry_run: bool,
}

impl PhaseLog {
    fn entry(&self, phase: ExecutionPhase, status: PhaseStatus, started_at: OffsetDateTime) -> ExecutionLogPayload {
        let ended_at = status.is_terminal().then(now_utc);
        ExecutionLogPayload {
            execution_id: self.execution_id,
            attempt: self.attempt,
            phase,
            status,
            started_at,
            ended_at,
            duration_ms: ended_at.map(|ended| millis_between(started_at, ended)),
            error_type: None,
            error: None,
            skip_reason: None,
            metrics: None,
            dry_run: self.dry_run,
        }
    }

    fn started(&self, phase: ExecutionPhase) -> ExecutionLogPayload {
        self.entry(phase, PhaseStatus::Started, now_utc())
    }

    fn completed(&self, phase: ExecutionPhase, started_at: OffsetDateTime, metrics: Option<HandlerMetrics>) -> ExecutionLogPayload {
        ExecutionLogPayload {
            metrics,
            ..self.entry(phase, PhaseStatus::Completed, started_at)
        }
    }

    fn failed(&self, phase: ExecutionPhase, started_at: OffsetDateTime, error_type: &str, error: String) -> ExecutionLogPayload {
        ExecutionLogPayload {
            error_type: Some(error_type.to_string()),
            error: Some(error),
            ..self.entry(phase, PhaseStatus::Failed, started_at)
        }
    }

    fn skipped(&self, phase: ExecutionPhase, reason: &str) -> ExecutionLogPayload {
        let now = now_utc();
        ExecutionLogPayload {
            skip_reason: Some(reason.to_string()),
            ..self.entry(phase, PhaseStatus::Skipped, now)
        }
    }
}

/// Drives operations through propose, approve and execute. The execution
/// gate inside [`Harness::execute`] is the only path to an effect.
pub struct Harness<'a> {
    plans: PlanManager<'a>,
    source: &'a dyn ContentSource,
    secrets: &'a dyn SecretResolver,
    bridge: Option<&'a ConstraintBridge>,
    config: HarnessConfig,
}

impl<'a> Harness<'a> {
    /// # Errors
    /// Returns [`GovernanceError::Configuration`] for an invalid config.
    pub fn new(
        ledger: &'a EventLedger,
        content: &'a dyn ContentStore,
        registry: &'a ArtifactTypeRegistry,
        source: &'a dyn ContentSource,
        secrets: &'a dyn SecretResolver,
        config: HarnessConfig,
    ) -> Result<Self, GovernanceError> {
        config.validate()?;
        Ok(Self {
            plans: PlanManager::new(ledger, content, registry),
            source,
            secrets,
            bridge: None,
            config,
        })
    }

    #[must_use]
    pub fn with_bridge(mut self, bridge: &'a ConstraintBridge) -> Self {
        self.bridge = Some(bridge);
        self
    }

    #[must_use]
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    #[must_use]
    pub fn plans(&self) -> &PlanManager<'a> {
        &self.plans
    }

    /// Pure phase: screens parameters, plans, classifies risk and records
    /// the plan as validated or rejected. Nothing outside the ledger and
    /// content store is touched.
    ///
    /// # Errors
    /// Only ledger, content store and content source failures are errors.
    pub fn propose(&self, handler: &dyn OperationHandler, params: Value, options: &ProposeOptions) -> Result<ProposeResult> {
        let actor = self.config.actor(options.actor.as_deref()).to_string();
        let operation = handler.operation().to_string();
        let mut result = ProposeResult::new(&operation);

        let mut errors = screen_params(&params);
        if errors.is_empty() {
            errors.extend(handler.validate_params(&params));
        }
        if let Some(target) = options.supersedes {
            match self.plans.snapshot(target)? {
                None => errors.push(format!("superseded plan {target} does not exist")),
                Some(snapshot) if snapshot.artifact_type != "plan" => {
                    errors.push(format!("artifact {target} is a {} and cannot be superseded", snapshot.artifact_type));
                }
                Some(_) => {}
            }
        }
        if !errors.is_empty() {
            info!(operation = %operation, errors = errors.len(), "proposal refused before planning");
            return Ok(result.refused(errors));
        }

        let inputs = self.source.snapshot().context("failed to snapshot plan inputs")?;
        let ctx = PlanContext {
            operation: &operation,
            actor: &actor,
            inputs: &inputs,
        };
        let draft = match handler.plan(&ctx, &params) {
            Ok(draft) => draft,
            Err(err) => return Ok(result.refused(vec![format!("planning failed: {err}")])),
        };

        let risk = classify(&draft.effect_summary);
        let content = PlanContent {
            operation: operation.clone(),
            params,
            plan: draft.plan,
            effect_summary: draft.effect_summary.clone(),
            inputs_snapshot: inputs,
            engine_version: self.config.engine_version.clone(),
            supersedes: options.supersedes,
        };
        let prepared = match self.plans.create_artifact("plan", &content, &actor) {
            Ok(prepared) => prepared,
            Err(err) => {
                let failure = expected_failure(err)?;
                result.validation_errors.push(failure.message.clone());
                result.failure = Some(failure);
                return Ok(result);
            }
        };
        let plan_id = prepared.artifact_id;
        result.plan_artifact_id = Some(plan_id);
        result.status = Some(ArtifactStatus::Created);
        result.risk_class = Some(risk.risk_class);
        result.risk_reasons.clone_from(&risk.reasons);
        result.requires_approval = risk.requires_approval;

        let active_rulesets = self.bridge.map(ConstraintBridge::active_rulesets).unwrap_or_default();
        let mut report = prepared.report;
        let digest = match self.bridge {
            None => ConstraintDigest::default(),
            Some(bridge) => match bridge.evaluate(self.plans.ledger(), plan_id, &actor) {
                Ok(evaluation) => {
                    report.extend(evaluation.issues);
                    evaluation.digest
                }
                Err(err) => {
                    warn!(plan_id = %plan_id, error = %format!("{err:#}"), "constraint evaluation failed");
                    let mut ruleset_errors = bridge.load_errors().to_vec();
                    ruleset_errors.push(truncate_message(&format!("constraint evaluation failed: {err:#}")));
                    ConstraintDigest {
                        ruleset_errors,
                        failed_rulesets: bridge.failed_rulesets().to_vec(),
                        ..ConstraintDigest::default()
                    }
                }
            },
        };
        result.constraints = Some(digest.clone());

        let mode = self.config.enforcement;
        let blocking: Vec<ValidationIssue> = report.blocking(mode).into_iter().cloned().collect();
        result.warnings = report.warnings(mode);

        if !blocking.is_empty() {
            let rendered: Vec<String> = blocking.iter().map(ValidationIssue::render).collect();
            self.plans.reject(
                plan_id,
                &RejectedPayload {
                    stage: RejectionStage::Validation,
                    reason: truncate_message(&rendered.join("; ")),
                    issues: blocking,
                    risk_class: Some(risk.risk_class),
                    active_rulesets,
                },
                &actor,
            )?;
            info!(plan_id = %plan_id, operation = %operation, mode = mode.as_str(), "plan rejected at validation");
            result.status = Some(ArtifactStatus::Rejected);
            return Ok(result.refused(rendered));
        }

        self.plans.validate(
            plan_id,
            &ValidatedPayload {
                risk_class: risk.risk_class,
                risk_reasons: risk.reasons,
                requires_approval: risk.requires_approval,
                effect_summary: draft.effect_summary,
                active_rulesets,
                constraints: digest,
                warnings: result.warnings.clone(),
            },
            &actor,
        )?;
        result.status = Some(ArtifactStatus::Validated);
        info!(
            plan_id = %plan_id,
            operation = %operation,
            risk_class = risk.risk_class.as_str(),
            requires_approval = risk.requires_approval,
            "plan proposed"
        );
        Ok(result)
    }

    /// Records an explicit approval. Destructive plans need `force_ack`.
    ///
    /// # Errors
    /// Only ledger and content store failures are errors.
    pub fn approve(&self, plan_id: ArtifactId, approver: &str, force_ack: bool, reason: Option<String>) -> Result<ApproveResult> {
        let approver = approver.trim().to_string();
        let mut result = ApproveResult {
            plan_artifact_id: plan_id,
            approval_artifact_id: None,
            approver: approver.clone(),
            force_ack,
            failure: None,
        };
        if approver.is_empty() {
            result.failure = Some(GovernanceError::Validation("approver MUST be named".to_string()).into());
            return Ok(result);
        }

        let snapshot = match self.plan_snapshot(plan_id)? {
            Ok(snapshot) => snapshot,
            Err(err) => {
                result.failure = Some(err.into());
                return Ok(result);
            }
        };
        if snapshot.status != ArtifactStatus::Validated {
            let message = format!(
                "plan {plan_id} is {}; only validated plans can be approved",
                snapshot.status.as_str()
            );
            let err = if snapshot.status.is_terminal() {
                GovernanceError::Conflict(message)
            } else {
                GovernanceError::Validation(message)
            };
            result.failure = Some(err.into());
            return Ok(result);
        }
        let risk_class = snapshot.risk_class.unwrap_or(RiskClass::ReadOnly);
        if risk_class.requires_force_ack() && !force_ack {
            result.failure = Some(
                GovernanceError::GateDenied(format!(
                    "approving {} risk requires force_ack",
                    risk_class.as_str()
                ))
                .into(),
            );
            return Ok(result);
        }

        let approval = ApprovalContent {
            plan_artifact_id: plan_id,
            approver: approver.clone(),
            force_ack,
            risk_class,
            reason,
            approved_at: now_utc(),
        };
        match self.plans.approve(&approval, &approver) {
            Ok(approval_id) => {
                info!(plan_id = %plan_id, approval_id = %approval_id, approver = %approver, "plan approved");
                result.approval_artifact_id = Some(approval_id);
            }
            Err(err) => result.failure = Some(expected_failure(err)?),
        }
        Ok(result)
    }

    /// Withdraws a plan that has not run yet.
    ///
    /// # Errors
    /// Only ledger failures are errors.
    pub fn reject(&self, plan_id: ArtifactId, actor: Option<&str>, reason: &str) -> Result<RejectResult> {
        let actor = self.config.actor(actor).to_string();
        let mut result = RejectResult {
            plan_artifact_id: plan_id,
            failure: None,
        };
        let snapshot = match self.plan_snapshot(plan_id)? {
            Ok(snapshot) => snapshot,
            Err(err) => {
                result.failure = Some(err.into());
                return Ok(result);
            }
        };
        let payload = RejectedPayload {
            stage: RejectionStage::Approval,
            reason: truncate_message(reason),
            issues: Vec::new(),
            risk_class: snapshot.risk_class,
            active_rulesets: Vec::new(),
        };
        if let Err(err) = self.plans.reject(plan_id, &payload, &actor) {
            result.failure = Some(expected_failure(err)?);
        } else {
            info!(plan_id = %plan_id, actor = %actor, "plan rejected by reviewer");
        }
        Ok(result)
    }

    /// Impure phase. Passes the gate or records the denial, then runs the
    /// handler through prepare, execute and commit.
    ///
    /// # Errors
    /// Only ledger, content store and content source failures are errors;
    /// handler faults are recorded and returned as data.
    pub fn execute(&self, plan_id: ArtifactId, handler: &dyn OperationHandler, options: &ExecuteOptions) -> Result<ExecuteResult> {
        let actor = self.config.actor(options.actor.as_deref()).to_string();
        let result = ExecuteResult::new(plan_id, options.dry_run);

        let Some(_claim) = self.plans.ledger().claim(plan_id)? else {
            warn!(plan_id = %plan_id, "concurrent execution refused");
            return Ok(result.failed(GovernanceError::Conflict(format!(
                "plan {plan_id} is already being executed"
            ))));
        };
        self.plans.ledger().refresh()?;

        let snapshot = match self.plan_snapshot(plan_id)? {
            Ok(snapshot) => snapshot,
            Err(err) => return Ok(result.failed(err)),
        };
        match snapshot.status {
            ArtifactStatus::Validated | ArtifactStatus::Approved => {}
            ArtifactStatus::Executed | ArtifactStatus::Superseded => {
                return Ok(result.failed(GovernanceError::Conflict(format!(
                    "plan {plan_id} was already executed"
                ))));
            }
            ArtifactStatus::Rejected => {
                return Ok(result.failed(GovernanceError::Validation(format!("plan {plan_id} was rejected"))));
            }
            ArtifactStatus::Created => {
                return Ok(result.failed(GovernanceError::Validation(format!(
                    "plan {plan_id} has not been validated"
                ))));
            }
        }

        let plan: PlanContent = self.plans.load_content(&snapshot)?;
        if handler.operation() != plan.operation {
            return Ok(result.failed(GovernanceError::Validation(format!(
                "handler `{}` cannot execute a `{}` plan",
                handler.operation(),
                plan.operation
            ))));
        }

        if !snapshot.gate_allows_execution() {
            return self.deny(result, &snapshot, &actor);
        }

        self.run_phases(result, &snapshot, &plan, handler, &actor)
    }

    /// `propose` followed by `execute`. Never approves anything.
    ///
    /// # Errors
    /// Same as [`Harness::propose`] and [`Harness::execute`].
    pub fn run(&self, handler: &dyn OperationHandler, params: Value, options: &ExecuteOptions) -> Result<RunResult> {
        let propose = self.propose(
            handler,
            params,
            &ProposeOptions {
                actor: options.actor.clone(),
                supersedes: None,
            },
        )?;
        let execute = match (propose.success(), propose.plan_artifact_id) {
            (true, Some(plan_id)) => Some(self.execute(plan_id, handler, options)?),
            _ => None,
        };
        Ok(RunResult { propose, execute })
    }

    fn plan_snapshot(&self, plan_id: ArtifactId) -> Result<Result<ArtifactSnapshot, GovernanceError>> {
        Ok(match self.plans.snapshot(plan_id)? {
            None => Err(GovernanceError::Validation(format!("unknown artifact {plan_id}"))),
            Some(snapshot) if snapshot.artifact_type != "plan" => Err(GovernanceError::Validation(format!(
                "artifact {plan_id} is a {}, not a plan",
                snapshot.artifact_type
            ))),
            Some(snapshot) => Ok(snapshot),
        })
    }

    fn deny(&self, result: ExecuteResult, snapshot: &ArtifactSnapshot, actor: &str) -> Result<ExecuteResult> {
        let risk = snapshot.risk_class.map_or("unknown", RiskClass::as_str);
        let reason = if snapshot.status == ArtifactStatus::Approved {
            format!("approval required: the recorded approval does not satisfy {risk} risk")
        } else {
            format!("approval required: {risk} risk needs an explicit approval before execution")
        };
        let recorded = self.plans.reject(
            snapshot.artifact_id,
            &RejectedPayload {
                stage: RejectionStage::ExecutionGate,
                reason: reason.clone(),
                issues: Vec::new(),
                risk_class: snapshot.risk_class,
                active_rulesets: Vec::new(),
            },
            actor,
        );
        if let Err(err) = recorded {
            let failure = expected_failure(err)?;
            return Ok(result.failed(failure.to_error()));
        }
        warn!(plan_id = %snapshot.artifact_id, risk_class = risk, "execution gate denied");
        Ok(result.failed(GovernanceError::GateDenied(reason)))
    }

    fn run_phases(
        &self,
        mut result: ExecuteResult,
        snapshot: &ArtifactSnapshot,
        plan: &PlanContent,
        handler: &dyn OperationHandler,
        actor: &str,
    ) -> Result<ExecuteResult> {
        let plan_id = snapshot.artifact_id;
        let execution_id = ExecutionId::new();
        let attempt = u32::try_from(snapshot.executions.len())
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        result.execution_id = Some(execution_id);
        result.attempt = Some(attempt);

        let log = PhaseLog {
            execution_id,
            attempt,
            dry_run: result.dry_run,
        };
        let ctx = ExecContext::new(plan_id, execution_id, attempt, result.dry_run, actor, self.secrets);
        debug!(plan_id = %plan_id, execution_id = %execution_id, attempt, dry_run = result.dry_run, "execution started");

        let started = log.started(ExecutionPhase::Prepare);
        if let Err(err) = self.plans.log_phase(plan_id, &started, actor) {
            return self.interrupted(result, &log, &ctx, None, err);
        }
        if let Err(err) = self.check_inputs(plan).and_then(|()| handler.prepare(&ctx, plan)) {
            return self.fail_phase(result, &log, &ctx, ExecutionPhase::Prepare, started.started_at, &err);
        }
        let completed = log.completed(ExecutionPhase::Prepare, started.started_at, None);
        if let Err(err) = self.plans.log_phase(plan_id, &completed, actor) {
            return self.interrupted(result, &log, &ctx, Some((ExecutionPhase::Prepare, started.started_at)), err);
        }

        if result.dry_run {
            let skipped = self.plans.log_phases(
                plan_id,
                &[
                    log.skipped(ExecutionPhase::Execute, "dry_run"),
                    log.skipped(ExecutionPhase::Commit, "dry_run"),
                ],
                actor,
            );
            if let Err(err) = skipped {
                return self.interrupted(result, &log, &ctx, Some((ExecutionPhase::Execute, now_utc())), err);
            }
            info!(plan_id = %plan_id, execution_id = %execution_id, "dry run finished");
            result.success = true;
            result.summary = self.summary(execution_id)?;
            return Ok(result);
        }

        // The handler only runs once this write has been checked against
        // the latest durable history.
        let started = log.started(ExecutionPhase::Execute);
        if let Err(err) = self.plans.log_phase(plan_id, &started, actor) {
            return self.interrupted(result, &log, &ctx, Some((ExecutionPhase::Execute, started.started_at)), err);
        }
        let outcome = match handler.execute(&ctx, plan) {
            Ok(outcome) => HandlerOutcome {
                output: ctx.redact_value(&outcome.output),
                ..outcome
            },
            Err(err) => {
                return self.fail_phase(result, &log, &ctx, ExecutionPhase::Execute, started.started_at, &err);
            }
        };
        let completed = log.completed(ExecutionPhase::Execute, started.started_at, Some(outcome.metrics.clone()));
        if let Err(err) = self.plans.log_phase(plan_id, &completed, actor) {
            return self.interrupted(result, &log, &ctx, Some((ExecutionPhase::Execute, started.started_at)), err);
        }

        let started = log.started(ExecutionPhase::Commit);
        if let Err(err) = self.plans.log_phase(plan_id, &started, actor) {
            return self.interrupted(result, &log, &ctx, Some((ExecutionPhase::Commit, started.started_at)), err);
        }
        if let Err(err) = handler.commit(&ctx, plan, &outcome) {
            return self.fail_phase(result, &log, &ctx, ExecutionPhase::Commit, started.started_at, &err);
        }

        let record = match self.execution_record(snapshot, plan, &outcome, &log, started.started_at, actor) {
            Ok(record) => record,
            Err(err) => {
                let failure = expected_failure(err)?;
                let handler_err = HandlerError::new(failure.kind, failure.message);
                return self.fail_phase(result, &log, &ctx, ExecutionPhase::Commit, started.started_at, &handler_err);
            }
        };
        let result_artifact_id = record.result.artifact_id;
        let bundle_artifact_id = record.bundle.artifact_id;
        let written = match self.plans.mark_executed(plan_id, record, actor) {
            Ok(written) => written,
            Err(err) => {
                return self.interrupted(result, &log, &ctx, Some((ExecutionPhase::Commit, started.started_at)), err);
            }
        };

        result.success = true;
        result.result_artifact_id = Some(result_artifact_id);
        result.bundle_artifact_id = Some(bundle_artifact_id);
        result.superseded = written
            .iter()
            .find(|event| event.event_type == EventType::ArtifactSuperseded)
            .map(|event| event.artifact_id);
        result.output = Some(outcome.output);
        result.summary = self.summary(execution_id)?;
        info!(
            plan_id = %plan_id,
            execution_id = %execution_id,
            attempt,
            bundle_id = %bundle_artifact_id,
            "plan executed"
        );
        Ok(result)
    }

    fn check_inputs(&self, plan: &PlanContent) -> Result<(), HandlerError> {
        if !self.config.verify_inputs {
            return Ok(());
        }
        let current = self
            .source
            .snapshot()
            .map_err(|err| HandlerError::new("inputs_unavailable", format!("{err:#}")))?;
        if current.content_hash != plan.inputs_snapshot.content_hash {
            return Err(HandlerError::new(
                "stale_inputs",
                "content changed since the plan was proposed; propose again",
            ));
        }
        Ok(())
    }

    fn execution_record(
        &self,
        snapshot: &ArtifactSnapshot,
        plan: &PlanContent,
        outcome: &HandlerOutcome,
        log: &PhaseLog,
        commit_started: OffsetDateTime,
        actor: &str,
    ) -> Result<ExecutionRecord> {
        let plan_id = snapshot.artifact_id;
        let result = self.plans.prepare_artifact(
            "result",
            &ResultContent {
                plan_artifact_id: plan_id,
                execution_id: log.execution_id,
                attempt: log.attempt,
                operation: plan.operation.clone(),
                output: outcome.output.clone(),
                erased: outcome.erased.clone(),
                created: outcome.created.clone(),
                metrics: outcome.metrics.clone(),
            },
            actor,
        )?;
        let bundle = self.plans.prepare_artifact(
            "bundle",
            &BundleContent {
                version: BUNDLE_VERSION.to_string(),
                operation: plan.operation.clone(),
                timestamp: now_utc(),
                artifacts: BundleArtifacts {
                    plan: plan_id,
                    approval: snapshot.approval_artifact_id,
                    result: result.artifact_id,
                },
                repro: ReproHeader {
                    rulesets: self.recorded_rulesets(plan_id)?,
                    inputs_snapshot: plan.inputs_snapshot.clone(),
                    surface: self.config.surface.clone(),
                    engine_version: self.config.engine_version.clone(),
                    environment: EnvironmentInfo::current(),
                },
            },
            actor,
        )?;

        Ok(ExecutionRecord {
            executed: ExecutedPayload {
                execution_id: log.execution_id,
                attempt: log.attempt,
                result_artifact_id: result.artifact_id,
                bundle_artifact_id: bundle.artifact_id,
                erased: outcome.erased.clone(),
                created: outcome.created.clone(),
            },
            result,
            bundle,
            commit_log: log.completed(ExecutionPhase::Commit, commit_started, None),
            supersedes: plan.supersedes,
        })
    }

    /// Rulesets that were active when the plan was validated.
    fn recorded_rulesets(&self, plan_id: ArtifactId) -> Result<Vec<RulesetRef>> {
        let validated = self.plans.ledger().query(
            &QueryFilter::new()
                .artifact(plan_id)
                .event_type(EventType::ArtifactValidated),
        )?;
        let Some(event) = validated.last() else {
            return Ok(Vec::new());
        };
        let payload: ValidatedPayload = event.decode_payload()?;
        Ok(payload.active_rulesets)
    }

    fn fail_phase(
        &self,
        mut result: ExecuteResult,
        log: &PhaseLog,
        ctx: &ExecContext<'_>,
        phase: ExecutionPhase,
        started_at: OffsetDateTime,
        err: &HandlerError,
    ) -> Result<ExecuteResult> {
        let message = truncate_message(&ctx.redact(&err.message));
        self.plans.log_phase(
            ctx.plan_artifact_id,
            &log.failed(phase, started_at, &err.error_type, message.clone()),
            ctx.actor,
        )?;
        warn!(
            plan_id = %ctx.plan_artifact_id,
            execution_id = %log.execution_id,
            phase = phase.as_str(),
            error_type = %err.error_type,
            "execution phase failed"
        );
        result.summary = self.summary(log.execution_id)?;
        Ok(result.failed(GovernanceError::HandlerExecution {
            error_type: err.error_type.clone(),
            message,
        }))
    }

    /// A lifecycle write refused because another writer moved the plan on.
    /// Records a `failed` log for `phase`, when the execution has begun,
    /// and returns the refusal as data.
    fn interrupted(
        &self,
        mut result: ExecuteResult,
        log: &PhaseLog,
        ctx: &ExecContext<'_>,
        phase: Option<(ExecutionPhase, OffsetDateTime)>,
        err: anyhow::Error,
    ) -> Result<ExecuteResult> {
        let failure = expected_failure(err)?;
        if let Some((phase, started_at)) = phase {
            let message = truncate_message(&ctx.redact(&failure.message));
            self.plans.log_phase(
                ctx.plan_artifact_id,
                &log.failed(phase, started_at, &failure.kind, message),
                ctx.actor,
            )?;
        }
        warn!(
            plan_id = %ctx.plan_artifact_id,
            execution_id = %log.execution_id,
            kind = %failure.kind,
            "execution interrupted by a concurrent writer"
        );
        result.summary = self.summary(log.execution_id)?;
        Ok(result.failed(failure.to_error()))
    }

    fn summary(&self, execution_id: ExecutionId) -> Result<Option<ExecutionSummary>> {
        QueryEngine::new(self.plans.ledger()).execution_summary(execution_id)
    }
}

impl std::fmt::Debug for Harness<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("plans", &self.plans)
            .field("source", &self.source.describe())
            .field("bridge", &self.bridge)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
