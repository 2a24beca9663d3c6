use anyhow::{Context, Result};
use effect_ledger_core::{
    fold_snapshot, summarize_execution, ArtifactEvent, ArtifactId, ArtifactSnapshot,
    CreatedPayload, EventType, ExecutionId, ExecutionSummary,
};
use serde_json::json;

use crate::ledger::EventLedger;
use crate::query::QueryFilter;
use crate::views::{
    summarize_constraints, summarize_invariants, timeline_entry, AuditTrail, ConstraintSummary,
    InvariantSummary, RelatedArtifacts, TimelineEntry,
};

/// Read-side projections over an [`EventLedger`]. Every answer is derived
/// from events; nothing here is cached beyond the ledger's own index.
#[derive(Debug, Clone, Copy)]
pub struct QueryEngine<'a> {
    ledger: &'a EventLedger,
}

impl<'a> QueryEngine<'a> {
    #[must_use]
    pub fn new(ledger: &'a EventLedger) -> Self {
        Self { ledger }
    }

    pub fn query(&self, filter: &QueryFilter) -> Result<Vec<ArtifactEvent>> {
        self.ledger.query(filter)
    }

    pub fn events_for(&self, artifact_id: ArtifactId) -> Result<Vec<ArtifactEvent>> {
        self.ledger.query(&QueryFilter::new().artifact(artifact_id))
    }

    /// Current state of one artifact, or `None` when it was never created.
    pub fn snapshot(&self, artifact_id: ArtifactId) -> Result<Option<ArtifactSnapshot>> {
        let events = self.events_for(artifact_id)?;
        Ok(fold_snapshot(&events)?)
    }

    /// Artifact ids in creation order.
    pub fn artifact_ids(&self) -> Result<Vec<ArtifactId>> {
        let created = self
            .ledger
            .query(&QueryFilter::new().event_type(EventType::ArtifactCreated))?;
        Ok(created.into_iter().map(|event| event.artifact_id).collect())
    }

    pub fn constraint_evaluations(&self, artifact_id: ArtifactId) -> Result<Vec<ArtifactEvent>> {
        self.ledger.query(
            &QueryFilter::new()
                .artifact(artifact_id)
                .event_type(EventType::ConstraintEvaluated),
        )
    }

    pub fn invariant_checks(&self, artifact_id: ArtifactId) -> Result<Vec<ArtifactEvent>> {
        self.ledger.query(
            &QueryFilter::new()
                .artifact(artifact_id)
                .event_type(EventType::InvariantChecked),
        )
    }

    pub fn execution_logs(&self, execution_id: ExecutionId) -> Result<Vec<ArtifactEvent>> {
        self.ledger.query(
            &QueryFilter::new()
                .execution(execution_id)
                .event_type(EventType::ExecutionLogged),
        )
    }

    /// Distinct executions of an artifact in the order they started.
    pub fn executions_for(&self, artifact_id: ArtifactId) -> Result<Vec<ExecutionId>> {
        let logs = self.ledger.query(
            &QueryFilter::new()
                .artifact(artifact_id)
                .event_type(EventType::ExecutionLogged),
        )?;
        let mut executions: Vec<ExecutionId> = Vec::new();
        for event in &logs {
            if let Some(execution_id) = event.execution_id() {
                if !executions.contains(&execution_id) {
                    executions.push(execution_id);
                }
            }
        }
        Ok(executions)
    }

    pub fn execution_summary(&self, execution_id: ExecutionId) -> Result<Option<ExecutionSummary>> {
        let logs = self.execution_logs(execution_id)?;
        Ok(summarize_execution(execution_id, &logs)?)
    }

    pub fn execution_summaries(&self, artifact_id: ArtifactId) -> Result<Vec<ExecutionSummary>> {
        let mut summaries = Vec::new();
        for execution_id in self.executions_for(artifact_id)? {
            if let Some(summary) = self.execution_summary(execution_id)? {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }

    /// Every event of the artifact rendered in ledger order.
    pub fn execution_timeline(&self, artifact_id: ArtifactId) -> Result<Vec<TimelineEntry>> {
        let events = self.events_for(artifact_id)?;
        let mut timeline = Vec::with_capacity(events.len());
        for event in &events {
            timeline.push(timeline_entry(event)?);
        }
        Ok(timeline)
    }

    /// `artifact.created` events of bundles that reference `plan_id`.
    pub fn bundles_for(&self, plan_id: ArtifactId) -> Result<Vec<ArtifactEvent>> {
        let created = self.ledger.query(
            &QueryFilter::new()
                .event_type(EventType::ArtifactCreated)
                .where_eq("content.artifacts.plan", json!(plan_id)),
        )?;
        Ok(created
            .into_iter()
            .filter(|event| event.artifact_type.as_deref() == Some("bundle"))
            .collect())
    }

    pub fn constraint_summary(&self, artifact_id: ArtifactId) -> Result<ConstraintSummary> {
        let events = self.events_for(artifact_id)?;
        Ok(summarize_constraints(artifact_id, &events)?)
    }

    pub fn invariant_summary(&self, artifact_id: ArtifactId) -> Result<Vec<InvariantSummary>> {
        let events = self.invariant_checks(artifact_id)?;
        Ok(summarize_invariants(&events)?)
    }

    /// Full audit view of one artifact, or `None` when it was never created.
    pub fn audit_trail(&self, artifact_id: ArtifactId) -> Result<Option<AuditTrail>> {
        let events = self.events_for(artifact_id)?;
        let Some(snapshot) = fold_snapshot(&events)? else {
            return Ok(None);
        };

        let created: CreatedPayload = events
            .first()
            .map(ArtifactEvent::decode_payload::<CreatedPayload>)
            .transpose()?
            .unwrap_or_default();
        let bundles = self
            .bundles_for(artifact_id)
            .with_context(|| format!("failed to list bundles for {artifact_id}"))?
            .into_iter()
            .map(|event| event.artifact_id)
            .collect();

        let related = RelatedArtifacts {
            inputs: created.inputs,
            approval: snapshot.approval_artifact_id,
            result: snapshot.result_artifact_id,
            bundle: snapshot.bundle_artifact_id,
            superseded_by: snapshot.superseded_by,
            bundles,
        };

        let mut timeline = Vec::with_capacity(events.len());
        for event in &events {
            timeline.push(timeline_entry(event)?);
        }

        Ok(Some(AuditTrail {
            artifact_id,
            constraints: summarize_constraints(artifact_id, &events)?,
            executions: self.execution_summaries(artifact_id)?,
            content: created.content,
            snapshot,
            related,
            timeline,
            events,
        }))
    }
}
