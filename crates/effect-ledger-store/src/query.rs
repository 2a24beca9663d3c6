use effect_ledger_core::{ArtifactEvent, ArtifactId, EventId, EventType, ExecutionId, GovernanceError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::index::LedgerIndex;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl Order {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

/// Conjunctive event filter. Unset fields match everything; time bounds
/// are inclusive. Results follow ledger order (or its reverse) and resume
/// strictly after the `after` cursor when one is given.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    pub artifact_id: Option<ArtifactId>,
    pub execution_id: Option<ExecutionId>,
    pub event_type: Option<EventType>,
    pub since: Option<OffsetDateTime>,
    pub until: Option<OffsetDateTime>,
    pub actor: Option<String>,
    pub payload_equals: Vec<(String, Value)>,
    pub limit: Option<usize>,
    pub order: Order,
    pub after: Option<EventId>,
}

impl QueryFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn artifact(mut self, artifact_id: ArtifactId) -> Self {
        self.artifact_id = Some(artifact_id);
        self
    }

    #[must_use]
    pub fn execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    #[must_use]
    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    #[must_use]
    pub fn since(mut self, since: OffsetDateTime) -> Self {
        self.since = Some(since);
        self
    }

    #[must_use]
    pub fn until(mut self, until: OffsetDateTime) -> Self {
        self.until = Some(until);
        self
    }

    #[must_use]
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Requires the payload value at dotted `path` to equal `value`.
    #[must_use]
    pub fn where_eq(mut self, path: impl Into<String>, value: Value) -> Self {
        self.payload_equals.push((path.into(), value));
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub fn after(mut self, event_id: EventId) -> Self {
        self.after = Some(event_id);
        self
    }

    #[must_use]
    pub fn matches(&self, event: &ArtifactEvent) -> bool {
        if self
            .artifact_id
            .is_some_and(|artifact_id| artifact_id != event.artifact_id)
        {
            return false;
        }
        if self
            .execution_id
            .is_some_and(|execution_id| event.execution_id() != Some(execution_id))
        {
            return false;
        }
        if self
            .event_type
            .is_some_and(|event_type| event_type != event.event_type)
        {
            return false;
        }
        if self.since.is_some_and(|since| event.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.timestamp > until) {
            return false;
        }
        if self
            .actor
            .as_deref()
            .is_some_and(|actor| actor != event.actor)
        {
            return false;
        }
        self.payload_equals
            .iter()
            .all(|(path, expected)| event.payload_field(path) == Some(expected))
    }

    /// Evaluates the filter against an indexed arena.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Validation`] when the `after` cursor names
    /// an event the ledger does not contain.
    pub fn select(
        &self,
        events: &[ArtifactEvent],
        index: &LedgerIndex,
    ) -> Result<Vec<ArtifactEvent>, GovernanceError> {
        let cursor = match &self.after {
            Some(event_id) => Some(index.offset_of(event_id).ok_or_else(|| {
                GovernanceError::Validation(format!("unknown cursor event_id {event_id}"))
            })?),
            None => None,
        };

        let candidates = self.candidate_offsets(index);
        let ordered: Box<dyn Iterator<Item = usize> + '_> = match (candidates, self.order) {
            (Some(offsets), Order::Asc) => Box::new(offsets.iter().copied()),
            (Some(offsets), Order::Desc) => Box::new(offsets.iter().rev().copied()),
            (None, Order::Asc) => Box::new(0..events.len()),
            (None, Order::Desc) => Box::new((0..events.len()).rev()),
        };

        let limit = self.limit.unwrap_or(usize::MAX);
        let mut selected = Vec::new();
        for offset in ordered {
            if selected.len() >= limit {
                break;
            }
            let past_cursor = match (cursor, self.order) {
                (None, _) => true,
                (Some(cursor), Order::Asc) => offset > cursor,
                (Some(cursor), Order::Desc) => offset < cursor,
            };
            if !past_cursor {
                continue;
            }
            let Some(event) = events.get(offset) else {
                continue;
            };
            if self.matches(event) {
                selected.push(event.clone());
            }
        }
        Ok(selected)
    }

    /// Smallest index posting list covering the filter, or `None` for a
    /// full scan.
    fn candidate_offsets<'a>(&self, index: &'a LedgerIndex) -> Option<&'a [usize]> {
        let mut best: Option<&'a [usize]> = None;
        let lists = [
            self.artifact_id
                .as_ref()
                .map(|artifact_id| index.artifact_offsets(artifact_id)),
            self.execution_id
                .as_ref()
                .map(|execution_id| index.execution_offsets(execution_id)),
            self.event_type
                .map(|event_type| index.event_type_offsets(event_type)),
        ];
        for list in lists.into_iter().flatten() {
            let shorter = match best {
                Some(current) => list.len() < current.len(),
                None => true,
            };
            if shorter {
                best = Some(list);
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use effect_ledger_core::{now_utc, NewEvent};
    use serde_json::json;

    fn fixture() -> (Vec<ArtifactEvent>, ArtifactId) {
        let plan = ArtifactId::new();
        let other = ArtifactId::new();
        let base = now_utc();
        let events: Vec<ArtifactEvent> = [
            (plan, EventType::ArtifactCreated, "alice", json!({"content": {"kind": "plan"}})),
            (other, EventType::ArtifactCreated, "bob", json!({"content": {"kind": "bundle"}})),
            (plan, EventType::ArtifactValidated, "alice", json!({"risk_class": "read_only"})),
            (plan, EventType::ArtifactApproved, "carol", json!({"approver": "carol"})),
        ]
        .into_iter()
        .enumerate()
        .map(|(offset, (artifact_id, event_type, actor, payload))| {
            let seconds = i64::try_from(offset).unwrap_or(0);
            NewEvent::new(event_type, artifact_id, actor, payload)
                .stamp(EventId::new(), base + time::Duration::seconds(seconds))
        })
        .collect();
        (events, plan)
    }

    #[test]
    fn filters_are_conjunctive_and_ordered() {
        let (events, plan) = fixture();
        let index = LedgerIndex::build(&events);

        let asc = QueryFilter::new().artifact(plan).select(&events, &index);
        let asc = asc.unwrap_or_else(|err| panic!("query failed: {err}"));
        assert_eq!(asc.len(), 3);
        assert_eq!(asc[0].event_type, EventType::ArtifactCreated);

        let desc = QueryFilter::new()
            .artifact(plan)
            .order(Order::Desc)
            .limit(1)
            .select(&events, &index)
            .unwrap_or_else(|err| panic!("query failed: {err}"));
        assert_eq!(desc.len(), 1);
        assert_eq!(desc[0].event_type, EventType::ArtifactApproved);

        let by_payload = QueryFilter::new()
            .event_type(EventType::ArtifactCreated)
            .where_eq("content.kind", json!("bundle"))
            .select(&events, &index)
            .unwrap_or_else(|err| panic!("query failed: {err}"));
        assert_eq!(by_payload.len(), 1);
        assert_eq!(by_payload[0].actor, "bob");

        let by_actor = QueryFilter::new()
            .artifact(plan)
            .actor("carol")
            .select(&events, &index)
            .unwrap_or_else(|err| panic!("query failed: {err}"));
        assert_eq!(by_actor.len(), 1);
    }

    #[test]
    fn time_bounds_are_inclusive() {
        let (events, _) = fixture();
        let index = LedgerIndex::build(&events);
        let selected = QueryFilter::new()
            .since(events[1].timestamp)
            .until(events[2].timestamp)
            .select(&events, &index)
            .unwrap_or_else(|err| panic!("query failed: {err}"));
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].event_id, events[1].event_id);
        assert_eq!(selected[1].event_id, events[2].event_id);
    }

    #[test]
    fn unknown_cursor_is_a_validation_error() {
        let (events, _) = fixture();
        let index = LedgerIndex::build(&events);
        let result = QueryFilter::new()
            .after(EventId::new())
            .select(&events, &index);
        assert!(matches!(result, Err(GovernanceError::Validation(_))));
    }

    #[test]
    fn descending_cursor_resumes_before_the_cursor() {
        let (events, _) = fixture();
        let index = LedgerIndex::build(&events);
        let page = QueryFilter::new()
            .order(Order::Desc)
            .after(events[2].event_id)
            .select(&events, &index)
            .unwrap_or_else(|err| panic!("query failed: {err}"));
        let ids: Vec<EventId> = page.iter().map(|event| event.event_id).collect();
        assert_eq!(ids, vec![events[1].event_id, events[0].event_id]);
    }
}
