use std::collections::HashMap;

use effect_ledger_core::{ArtifactEvent, ArtifactId, EventId, EventType, ExecutionId};
use serde::{Deserialize, Serialize};

/// Secondary index over the event arena. Every list holds arena offsets in
/// ascending order, so lookups preserve ledger order.
#[derive(Debug, Default, Clone)]
pub struct LedgerIndex {
    indexed_len: usize,
    by_artifact: HashMap<ArtifactId, Vec<usize>>,
    by_execution: HashMap<ExecutionId, Vec<usize>>,
    by_event_type: HashMap<EventType, Vec<usize>>,
    by_event_id: HashMap<EventId, usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexStats {
    pub indexed_events: usize,
    pub artifacts: usize,
    pub executions: usize,
}

impl LedgerIndex {
    #[must_use]
    pub fn build(events: &[ArtifactEvent]) -> Self {
        let mut index = Self::default();
        index.catch_up(events);
        index
    }

    /// Indexes every event past the last indexed offset.
    pub fn catch_up(&mut self, events: &[ArtifactEvent]) {
        for (offset, event) in events.iter().enumerate().skip(self.indexed_len) {
            self.by_artifact
                .entry(event.artifact_id)
                .or_default()
                .push(offset);
            self.by_event_type
                .entry(event.event_type)
                .or_default()
                .push(offset);
            if let Some(execution_id) = event.execution_id() {
                self.by_execution
                    .entry(execution_id)
                    .or_default()
                    .push(offset);
            }
            self.by_event_id.insert(event.event_id, offset);
        }
        self.indexed_len = self.indexed_len.max(events.len());
    }

    #[must_use]
    pub fn indexed_len(&self) -> usize {
        self.indexed_len
    }

    #[must_use]
    pub fn artifact_offsets(&self, artifact_id: &ArtifactId) -> &[usize] {
        self.by_artifact.get(artifact_id).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn execution_offsets(&self, execution_id: &ExecutionId) -> &[usize] {
        self.by_execution
            .get(execution_id)
            .map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn event_type_offsets(&self, event_type: EventType) -> &[usize] {
        self.by_event_type
            .get(&event_type)
            .map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn offset_of(&self, event_id: &EventId) -> Option<usize> {
        self.by_event_id.get(event_id).copied()
    }

    #[must_use]
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            indexed_events: self.indexed_len,
            artifacts: self.by_artifact.len(),
            executions: self.by_execution.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use effect_ledger_core::{now_utc, NewEvent};
    use serde_json::json;

    fn event(artifact_id: ArtifactId, event_type: EventType, payload: serde_json::Value) -> ArtifactEvent {
        NewEvent::new(event_type, artifact_id, "tester", payload).stamp(EventId::new(), now_utc())
    }

    #[test]
    fn incremental_catch_up_matches_full_build() {
        let plan = ArtifactId::new();
        let execution_id = ExecutionId::new();
        let mut events = vec![
            event(plan, EventType::ArtifactCreated, json!({"content": {}})),
            event(plan, EventType::ArtifactValidated, json!({})),
        ];

        let mut incremental = LedgerIndex::build(&events);
        events.push(event(
            plan,
            EventType::ExecutionLogged,
            json!({"execution_id": execution_id.to_string()}),
        ));
        events.push(event(ArtifactId::new(), EventType::ArtifactCreated, json!({})));
        incremental.catch_up(&events);

        let full = LedgerIndex::build(&events);
        assert_eq!(incremental.stats(), full.stats());
        assert_eq!(incremental.artifact_offsets(&plan), &[0, 1, 2]);
        assert_eq!(incremental.execution_offsets(&execution_id), &[2]);
        assert_eq!(
            incremental.event_type_offsets(EventType::ArtifactCreated),
            &[0, 3]
        );
        assert_eq!(incremental.offset_of(&events[3].event_id), Some(3));
        assert_eq!(incremental.indexed_len(), 4);
    }
}
