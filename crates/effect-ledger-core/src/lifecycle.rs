use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::event::{
    ApprovedPayload, ArtifactEvent, EventType, ExecutedPayload, ExecutionLogPayload, NewEvent,
    RejectedPayload, RejectionStage, SupersededPayload, ValidatedPayload,
};
use crate::ids::{ArtifactId, ContentId, EventId, ExecutionId};
use crate::risk::RiskClass;
use crate::GovernanceError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Created,
    Validated,
    Approved,
    Rejected,
    Executed,
    Superseded,
}

impl ArtifactStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Validated => "validated",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Executed => "executed",
            Self::Superseded => "superseded",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "validated" => Some(Self::Validated),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "executed" => Some(Self::Executed),
            "superseded" => Some(Self::Superseded),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Executed | Self::Superseded)
    }
}

/// Fold of every event recorded for one artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactSnapshot {
    pub artifact_id: ArtifactId,
    pub artifact_type: String,
    pub status: ArtifactStatus,
    pub risk_class: Option<RiskClass>,
    pub risk_reasons: Vec<String>,
    pub requires_approval: bool,
    pub approval_artifact_id: Option<ArtifactId>,
    pub approved_by: Option<String>,
    pub force_ack: bool,
    pub result_artifact_id: Option<ArtifactId>,
    pub bundle_artifact_id: Option<ArtifactId>,
    pub content_id: Option<ContentId>,
    pub superseded_by: Option<ArtifactId>,
    pub gate_denials: u32,
    pub executions: Vec<ExecutionId>,
    pub event_count: usize,
    pub last_event_id: EventId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ArtifactSnapshot {
    fn from_created(event: &ArtifactEvent) -> Result<Self, String> {
        if event.event_type != EventType::ArtifactCreated {
            return Err(format!(
                "first event for artifact {} MUST be artifact.created, found {}",
                event.artifact_id,
                event.event_type.as_str()
            ));
        }
        let Some(artifact_type) = event.artifact_type.clone() else {
            return Err(format!(
                "artifact.created for {} is missing artifact_type",
                event.artifact_id
            ));
        };

        Ok(Self {
            artifact_id: event.artifact_id,
            artifact_type,
            status: ArtifactStatus::Created,
            risk_class: None,
            risk_reasons: Vec::new(),
            requires_approval: false,
            approval_artifact_id: None,
            approved_by: None,
            force_ack: false,
            result_artifact_id: None,
            bundle_artifact_id: None,
            content_id: event.content_id.clone(),
            superseded_by: None,
            gate_denials: 0,
            executions: Vec::new(),
            event_count: 1,
            last_event_id: event.event_id,
            created_at: event.timestamp,
            updated_at: event.timestamp,
        })
    }

    /// An approval exists and satisfies the force-ack rule for this risk.
    #[must_use]
    pub fn has_qualifying_approval(&self) -> bool {
        self.approval_artifact_id.is_some()
            && (self.force_ack || !self.risk_class.is_some_and(RiskClass::requires_force_ack))
    }

    /// Whether the execution gate lets this artifact through right now.
    #[must_use]
    pub fn gate_allows_execution(&self) -> bool {
        match self.status {
            ArtifactStatus::Approved => self.has_qualifying_approval(),
            ArtifactStatus::Validated => !self.requires_approval,
            _ => false,
        }
    }

    fn expect_status(&self, event: &ArtifactEvent, allowed: &[ArtifactStatus]) -> Result<(), String> {
        if allowed.contains(&self.status) {
            return Ok(());
        }
        Err(format!(
            "{} is not allowed for artifact {} in status {}",
            event.event_type.as_str(),
            self.artifact_id,
            self.status.as_str()
        ))
    }

    fn apply(&mut self, event: &ArtifactEvent) -> Result<(), String> {
        match event.event_type {
            EventType::ArtifactCreated => {
                return Err(format!("artifact {} was already created", self.artifact_id));
            }
            EventType::ArtifactValidated => {
                self.expect_status(event, &[ArtifactStatus::Created])?;
                let payload: ValidatedPayload = decode(event)?;
                self.status = ArtifactStatus::Validated;
                self.risk_class = Some(payload.risk_class);
                self.risk_reasons = payload.risk_reasons;
                self.requires_approval = payload.requires_approval;
            }
            EventType::ArtifactApproved => {
                self.expect_status(event, &[ArtifactStatus::Validated])?;
                let payload: ApprovedPayload = decode(event)?;
                if self.risk_class.is_some_and(RiskClass::requires_force_ack) && !payload.force_ack {
                    return Err(format!(
                        "approval of artifact {} requires force_ack for destructive risk",
                        self.artifact_id
                    ));
                }
                self.status = ArtifactStatus::Approved;
                self.approval_artifact_id = Some(payload.approval_artifact_id);
                self.approved_by = Some(payload.approver);
                self.force_ack = payload.force_ack;
            }
            EventType::ArtifactRejected => {
                let payload: RejectedPayload = decode(event)?;
                if payload.stage == RejectionStage::ExecutionGate {
                    self.expect_status(event, &[ArtifactStatus::Validated, ArtifactStatus::Approved])?;
                    self.gate_denials = self.gate_denials.saturating_add(1);
                } else {
                    self.expect_status(
                        event,
                        &[
                            ArtifactStatus::Created,
                            ArtifactStatus::Validated,
                            ArtifactStatus::Approved,
                        ],
                    )?;
                    self.status = ArtifactStatus::Rejected;
                }
            }
            EventType::ArtifactExecuted => {
                if !self.gate_allows_execution() {
                    return Err(format!(
                        "artifact {} cannot be executed from status {} without a qualifying approval",
                        self.artifact_id,
                        self.status.as_str()
                    ));
                }
                let payload: ExecutedPayload = decode(event)?;
                self.status = ArtifactStatus::Executed;
                self.result_artifact_id = Some(payload.result_artifact_id);
                self.bundle_artifact_id = Some(payload.bundle_artifact_id);
                self.note_execution(payload.execution_id);
            }
            EventType::ArtifactSuperseded => {
                self.expect_status(event, &[ArtifactStatus::Executed])?;
                let payload: SupersededPayload = decode(event)?;
                self.status = ArtifactStatus::Superseded;
                self.superseded_by = Some(payload.superseded_by);
            }
            EventType::ExecutionLogged => {
                let payload: ExecutionLogPayload = decode(event)?;
                // A started phase can always be closed, even after another
                // writer moved the artifact on.
                let closes_started = payload.status.is_terminal()
                    && self.executions.contains(&payload.execution_id);
                if !closes_started {
                    self.expect_status(event, &[ArtifactStatus::Validated, ArtifactStatus::Approved])?;
                }
                self.note_execution(payload.execution_id);
            }
            EventType::ConstraintEvaluated | EventType::InvariantChecked => {}
        }

        self.event_count += 1;
        self.last_event_id = event.event_id;
        self.updated_at = event.timestamp;
        Ok(())
    }

    fn note_execution(&mut self, execution_id: ExecutionId) {
        if !self.executions.contains(&execution_id) {
            self.executions.push(execution_id);
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(event: &ArtifactEvent) -> Result<T, String> {
    event.decode_payload().map_err(|err| err.message().to_string())
}

/// Projects the ordered events of one artifact into its snapshot.
///
/// # Errors
/// Returns [`GovernanceError::Projection`] when the stream mixes artifacts,
/// goes back in time, or contains an illegal lifecycle transition.
pub fn fold_snapshot(events: &[ArtifactEvent]) -> Result<Option<ArtifactSnapshot>, GovernanceError> {
    let Some(first) = events.first() else {
        return Ok(None);
    };

    let mut snapshot = ArtifactSnapshot::from_created(first).map_err(GovernanceError::Projection)?;
    let mut previous: OffsetDateTime = first.timestamp;

    for event in &events[1..] {
        if event.artifact_id != snapshot.artifact_id {
            return Err(GovernanceError::Projection(
                "replay stream MUST contain a single artifact_id".to_string(),
            ));
        }
        if event.timestamp < previous {
            return Err(GovernanceError::Projection(format!(
                "event {} timestamp precedes its predecessor",
                event.event_id
            )));
        }
        previous = event.timestamp;
        snapshot.apply(event).map_err(GovernanceError::Projection)?;
    }

    Ok(Some(snapshot))
}

/// Applies the lifecycle rules to a prospective event without recording it.
///
/// Returns the snapshot the artifact would have after the event.
///
/// # Errors
/// Returns [`GovernanceError::Conflict`] when the artifact is already in a
/// terminal status and [`GovernanceError::Validation`] for any other
/// illegal transition.
pub fn check_transition(
    current: Option<&ArtifactSnapshot>,
    event: &NewEvent,
) -> Result<ArtifactSnapshot, GovernanceError> {
    let timestamp = current.map_or_else(crate::now_utc, |snapshot| snapshot.updated_at);
    let candidate = event.clone().stamp(EventId::new(), timestamp);

    match current {
        None => ArtifactSnapshot::from_created(&candidate).map_err(GovernanceError::Validation),
        Some(snapshot) => {
            let mut next = snapshot.clone();
            match next.apply(&candidate) {
                Ok(()) => Ok(next),
                Err(message) if snapshot.status.is_terminal() => {
                    Err(GovernanceError::Conflict(message))
                }
                Err(message) => Err(GovernanceError::Validation(message)),
            }
        }
    }
}
