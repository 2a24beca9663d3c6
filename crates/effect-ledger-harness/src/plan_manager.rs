use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use effect_ledger_core::{
    check_transition, ApprovalContent, ApprovedPayload, ArtifactEvent, ArtifactId,
    ArtifactSnapshot, ArtifactTypeRegistry, ContentId, CreatedPayload, EventType,
    ExecutedPayload, ExecutionLogPayload, GovernanceError, NewEvent, RejectedPayload,
    SupersededPayload, ValidatedPayload, ValidationReport,
};
use effect_ledger_store::{ContentStore, EventLedger, QueryEngine};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// A type-checked `artifact.created` event whose content is already stored.
#[derive(Debug, Clone)]
pub struct PreparedArtifact {
    pub artifact_id: ArtifactId,
    pub content_id: ContentId,
    pub event: NewEvent,
    pub report: ValidationReport,
}

/// Everything written atomically when an execution succeeds.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub result: PreparedArtifact,
    pub bundle: PreparedArtifact,
    pub commit_log: ExecutionLogPayload,
    pub executed: ExecutedPayload,
    pub supersedes: Option<ArtifactId>,
}

/// The lifecycle engine: the only writer of artifact lifecycle events.
/// Every write is checked against the current snapshot of each touched
/// artifact, under the ledger's write lock, before it reaches the ledger.
pub struct PlanManager<'a> {
    ledger: &'a EventLedger,
    content: &'a dyn ContentStore,
    registry: &'a ArtifactTypeRegistry,
}

impl<'a> PlanManager<'a> {
    #[must_use]
    pub fn new(
        ledger: &'a EventLedger,
        content: &'a dyn ContentStore,
        registry: &'a ArtifactTypeRegistry,
    ) -> Self {
        Self {
            ledger,
            content,
            registry,
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &'a EventLedger {
        self.ledger
    }

    #[must_use]
    pub fn content(&self) -> &'a dyn ContentStore {
        self.content
    }

    pub fn snapshot(&self, artifact_id: ArtifactId) -> Result<Option<ArtifactSnapshot>> {
        QueryEngine::new(self.ledger).snapshot(artifact_id)
    }

    /// Validates `content` against its type pack and stores it. An `enforce`
    /// issue stops here with [`GovernanceError::TypeValidation`]; nothing is
    /// stored.
    pub fn prepare_artifact<T: Serialize>(
        &self,
        artifact_type: &str,
        content: &T,
        actor: &str,
    ) -> Result<PreparedArtifact> {
        let value = serde_json::to_value(content)
            .with_context(|| format!("failed to encode {artifact_type} content"))?;
        self.prepare_value(artifact_type, value, actor)
    }

    fn prepare_value(&self, artifact_type: &str, content: Value, actor: &str) -> Result<PreparedArtifact> {
        let report = self.registry.validate(artifact_type, &content);
        if report.has_enforce() {
            let rendered: Vec<String> = report
                .issues
                .iter()
                .filter(|issue| issue.severity == effect_ledger_core::Severity::Enforce)
                .map(effect_ledger_core::ValidationIssue::render)
                .collect();
            return Err(GovernanceError::TypeValidation(format!(
                "{artifact_type} content rejected: {}",
                rendered.join("; ")
            ))
            .into());
        }

        let content_id = self
            .content
            .put_json(&content)
            .with_context(|| format!("failed to store {artifact_type} content"))?;
        let inputs = self.registry.extract_inputs(artifact_type, &content);
        let artifact_id = ArtifactId::new();
        let event = NewEvent::typed(
            EventType::ArtifactCreated,
            artifact_id,
            actor,
            &CreatedPayload { content, inputs },
        )?
        .with_content(content_id.clone(), artifact_type);

        Ok(PreparedArtifact {
            artifact_id,
            content_id,
            event,
            report,
        })
    }

    /// Type-checks, stores and records a new artifact.
    pub fn create_artifact<T: Serialize>(
        &self,
        artifact_type: &str,
        content: &T,
        actor: &str,
    ) -> Result<PreparedArtifact> {
        let prepared = self.prepare_artifact(artifact_type, content, actor)?;
        self.append_checked(vec![prepared.event.clone()])?;
        debug!(artifact_id = %prepared.artifact_id, artifact_type, "artifact created");
        Ok(prepared)
    }

    /// Loads the stored content of an artifact, verified against its id.
    pub fn load_content<T: serde::de::DeserializeOwned>(&self, snapshot: &ArtifactSnapshot) -> Result<T> {
        let content_id = snapshot
            .content_id
            .as_ref()
            .ok_or_else(|| anyhow!("artifact {} has no content id", snapshot.artifact_id))?;
        let value = self
            .content
            .get_json(content_id)?
            .ok_or_else(|| anyhow!("content {content_id} of artifact {} is missing", snapshot.artifact_id))?;
        serde_json::from_value(value).with_context(|| {
            format!(
                "content of artifact {} does not decode as {}",
                snapshot.artifact_id, snapshot.artifact_type
            )
        })
    }

    pub fn validate(&self, artifact_id: ArtifactId, payload: &ValidatedPayload, actor: &str) -> Result<ArtifactEvent> {
        let event = NewEvent::typed(EventType::ArtifactValidated, artifact_id, actor, payload)?;
        self.append_one(event)
    }

    pub fn reject(&self, artifact_id: ArtifactId, payload: &RejectedPayload, actor: &str) -> Result<ArtifactEvent> {
        let event = NewEvent::typed(EventType::ArtifactRejected, artifact_id, actor, payload)?;
        self.append_one(event)
    }

    /// Writes the approval artifact and the plan's `artifact.approved` in one batch.
    pub fn approve(&self, approval: &ApprovalContent, actor: &str) -> Result<ArtifactId> {
        let prepared = self.prepare_artifact("approval", approval, actor)?;
        let approved = NewEvent::typed(
            EventType::ArtifactApproved,
            approval.plan_artifact_id,
            actor,
            &ApprovedPayload {
                approval_artifact_id: prepared.artifact_id,
                approver: approval.approver.clone(),
                force_ack: approval.force_ack,
                reason: approval.reason.clone(),
            },
        )?;
        self.append_checked(vec![prepared.event, approved])?;
        Ok(prepared.artifact_id)
    }

    pub fn log_phase(&self, artifact_id: ArtifactId, payload: &ExecutionLogPayload, actor: &str) -> Result<ArtifactEvent> {
        let event = NewEvent::typed(EventType::ExecutionLogged, artifact_id, actor, payload)?;
        self.append_one(event)
    }

    pub fn log_phases(&self, artifact_id: ArtifactId, payloads: &[ExecutionLogPayload], actor: &str) -> Result<Vec<ArtifactEvent>> {
        let events = payloads
            .iter()
            .map(|payload| NewEvent::typed(EventType::ExecutionLogged, artifact_id, actor, payload))
            .collect::<Result<Vec<_>, _>>()?;
        self.append_checked(events)
    }

    /// Records a successful execution: result and bundle artifacts, the
    /// commit log, `artifact.executed`, and the supersession of an earlier
    /// executed plan when this plan names one.
    pub fn mark_executed(&self, plan_id: ArtifactId, record: ExecutionRecord, actor: &str) -> Result<Vec<ArtifactEvent>> {
        let mut batch = vec![
            record.result.event,
            record.bundle.event,
            NewEvent::typed(EventType::ExecutionLogged, plan_id, actor, &record.commit_log)?,
            NewEvent::typed(EventType::ArtifactExecuted, plan_id, actor, &record.executed)?,
        ];

        if let Some(target) = record.supersedes {
            let supersedable = self
                .snapshot(target)?
                .is_some_and(|snapshot| snapshot.status == effect_ledger_core::ArtifactStatus::Executed);
            if supersedable {
                batch.push(NewEvent::typed(
                    EventType::ArtifactSuperseded,
                    target,
                    actor,
                    &SupersededPayload {
                        superseded_by: plan_id,
                        reason: Some(format!("superseded by executed plan {plan_id}")),
                    },
                )?);
            }
        }

        self.append_checked(batch)
    }

    fn append_one(&self, event: NewEvent) -> Result<ArtifactEvent> {
        let mut appended = self.append_checked(vec![event])?;
        appended
            .pop()
            .ok_or_else(|| anyhow!("ledger returned no event for a single append"))
    }

    /// Checks every event against the running snapshot of its artifact, then
    /// appends the batch atomically. Snapshots are folded while the ledger's
    /// write lock is held, so writers sharing the backend cannot interleave.
    pub fn append_checked(&self, events: Vec<NewEvent>) -> Result<Vec<ArtifactEvent>> {
        self.ledger.append_checked(events, |events| {
            let mut snapshots: HashMap<ArtifactId, Option<ArtifactSnapshot>> = HashMap::new();
            for event in events {
                if !snapshots.contains_key(&event.artifact_id) {
                    let current = self.snapshot(event.artifact_id)?;
                    snapshots.insert(event.artifact_id, current);
                }
                let current = snapshots.get(&event.artifact_id).and_then(Option::as_ref);
                let next = check_transition(current, event)?;
                snapshots.insert(event.artifact_id, Some(next));
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for PlanManager<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanManager")
            .field("ledger", &self.ledger.location())
            .finish_non_exhaustive()
    }
}
