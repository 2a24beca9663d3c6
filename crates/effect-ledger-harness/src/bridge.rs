use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use effect_ledger_core::{
    content_id_for_json, normalize_invariant, truncate_message, ArtifactId, ConstraintDigest,
    ConstraintEvaluatedPayload, ConstraintResult, CreatedPayload, EventType, GovernanceError,
    InvariantCheckedPayload, InvariantStatus, NewEvent, RuleDecl, RuleVerdict, Ruleset,
    RulesetRef, ValidationIssue,
};
use effect_ledger_store::{ContentStore, EventLedger, QueryEngine};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::evaluator::{EvaluationRequest, RuleEvaluator};

#[derive(Debug, Clone)]
struct ActiveRuleset {
    ruleset: Ruleset,
    reference: RulesetRef,
}

/// Outcome of one bridge run against an artifact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationReport {
    pub digest: ConstraintDigest,
    /// One issue per failing rule, carrying the rule's declared severity.
    pub issues: Vec<ValidationIssue>,
    pub events_written: usize,
}

#[derive(Debug, Default)]
struct InvariantTally {
    rule_count: u32,
    violation_count: u32,
    affected_items: BTreeSet<String>,
    rulesets: BTreeSet<String>,
}

/// Turns external rule verdicts into `constraint.evaluated` and
/// `invariant.checked` events.
#[derive(Default)]
pub struct ConstraintBridge {
    rulesets: Vec<ActiveRuleset>,
    load_errors: Vec<String>,
    failed_rulesets: Vec<String>,
    evaluator: Option<Box<dyn RuleEvaluator>>,
}

impl ConstraintBridge {
    #[must_use]
    pub fn new(evaluator: Option<Box<dyn RuleEvaluator>>) -> Self {
        Self {
            rulesets: Vec::new(),
            load_errors: Vec::new(),
            failed_rulesets: Vec::new(),
            evaluator,
        }
    }

    /// Reads a JSON or YAML ruleset and stores its bytes in `content`.
    /// Failures are also kept in [`ConstraintBridge::load_errors`].
    ///
    /// # Errors
    /// Returns [`GovernanceError::RulesetLoad`] when the file cannot be read,
    /// parsed or stored, is invalid, or reuses an active ruleset id.
    pub fn load_ruleset_file(
        &mut self,
        path: &Path,
        content: &dyn ContentStore,
    ) -> Result<RulesetRef, GovernanceError> {
        let loaded = read_ruleset(path, content).and_then(|(ruleset, reference)| {
            self.activate(ruleset, reference.clone())?;
            Ok(reference)
        });
        match loaded {
            Ok(reference) => {
                info!(ruleset = %reference.id, version = %reference.version, path = %reference.path, "ruleset loaded");
                Ok(reference)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ruleset load failed");
                self.load_errors.push(format!("{}: {}", path.display(), err.message()));
                let failed = path.display().to_string();
                let active = self.rulesets.iter().any(|active| active.reference.path == failed);
                if !active && !self.failed_rulesets.contains(&failed) {
                    self.failed_rulesets.push(failed);
                }
                Err(err)
            }
        }
    }

    /// Activates an in-memory ruleset; its content id is the hash of its
    /// canonical JSON form.
    ///
    /// # Errors
    /// Returns [`GovernanceError::RulesetLoad`] for an invalid ruleset or a
    /// duplicate ruleset id.
    pub fn add_ruleset(&mut self, ruleset: Ruleset, path: impl Into<String>) -> Result<RulesetRef, GovernanceError> {
        ruleset.validate()?;
        let encoded = serde_json::to_value(&ruleset)
            .map_err(|err| GovernanceError::RulesetLoad(format!("failed to encode ruleset: {err}")))?;
        let reference = RulesetRef {
            id: ruleset.id.clone(),
            version: ruleset.version.clone(),
            content_id: content_id_for_json(&encoded)?,
            path: path.into(),
        };
        self.activate(ruleset, reference.clone())?;
        Ok(reference)
    }

    fn activate(&mut self, ruleset: Ruleset, reference: RulesetRef) -> Result<(), GovernanceError> {
        if self.rulesets.iter().any(|active| active.ruleset.id == ruleset.id) {
            return Err(GovernanceError::RulesetLoad(format!(
                "ruleset `{}` is already active",
                ruleset.id
            )));
        }
        self.rulesets.push(ActiveRuleset { ruleset, reference });
        Ok(())
    }

    #[must_use]
    pub fn active_rulesets(&self) -> Vec<RulesetRef> {
        self.rulesets.iter().map(|active| active.reference.clone()).collect()
    }

    #[must_use]
    pub fn load_errors(&self) -> &[String] {
        &self.load_errors
    }

    /// Paths of ruleset files that failed to load.
    #[must_use]
    pub fn failed_rulesets(&self) -> &[String] {
        &self.failed_rulesets
    }

    #[must_use]
    pub fn has_evaluator(&self) -> bool {
        self.evaluator.is_some()
    }

    /// Evaluates every active rule against the target artifact's content and
    /// appends the resulting events in one batch.
    ///
    /// # Errors
    /// Fails when the target does not exist or the ledger cannot be read or
    /// written. Evaluator failures are recorded as `error` results instead.
    pub fn evaluate(&self, ledger: &EventLedger, target: ArtifactId, actor: &str) -> Result<EvaluationReport> {
        let engine = QueryEngine::new(ledger);
        let events = engine.events_for(target)?;
        let Some(created) = events.first() else {
            return Err(GovernanceError::Validation(format!(
                "cannot evaluate constraints for unknown artifact {target}"
            ))
            .into());
        };
        let payload: CreatedPayload = created.decode_payload()?;
        let artifact_type = created.artifact_type.clone().unwrap_or_default();

        let mut report = EvaluationReport {
            digest: ConstraintDigest {
                ruleset_errors: self.load_errors.clone(),
                failed_rulesets: self.failed_rulesets.clone(),
                ..ConstraintDigest::default()
            },
            ..EvaluationReport::default()
        };
        if self.rulesets.is_empty() {
            return Ok(report);
        }

        let mut batch = Vec::new();
        let mut tallies: BTreeMap<String, InvariantTally> = BTreeMap::new();

        for active in &self.rulesets {
            for rule in &active.ruleset.rules {
                let request = EvaluationRequest {
                    ruleset_id: active.ruleset.id.clone(),
                    ruleset_version: active.ruleset.version.clone(),
                    rule: rule.clone(),
                    artifact_id: target,
                    artifact_type: artifact_type.clone(),
                    content: payload.content.clone(),
                };
                let invariant = normalize_invariant(&rule.invariant);
                let base = ConstraintEvaluatedPayload {
                    ruleset_id: active.ruleset.id.clone(),
                    ruleset_version: active.ruleset.version.clone(),
                    rule_id: rule.rule_id.clone(),
                    invariant: invariant.clone(),
                    result: ConstraintResult::Pass,
                    item_id: None,
                    message: None,
                    evidence: Value::Null,
                };

                match self.run_rule(&request) {
                    Err(message) => {
                        warn!(ruleset = %active.ruleset.id, rule = %rule.rule_id, error = %message, "rule evaluation failed");
                        report.digest.errors += 1;
                        batch.push(constraint_event(
                            target,
                            actor,
                            &ConstraintEvaluatedPayload {
                                result: ConstraintResult::Error,
                                message: Some(truncate_message(&message)),
                                ..base
                            },
                        )?);
                    }
                    Ok(verdict) => {
                        report.digest.rules_evaluated += 1;
                        let tally = tallies.entry(invariant).or_default();
                        tally.rule_count += 1;
                        tally.rulesets.insert(active.ruleset.id.clone());

                        if verdict.passed {
                            batch.push(constraint_event(
                                target,
                                actor,
                                &ConstraintEvaluatedPayload {
                                    evidence: verdict.evidence,
                                    ..base
                                },
                            )?);
                            continue;
                        }

                        let failures = failure_payloads(&base, verdict);
                        let count = u32::try_from(failures.len()).unwrap_or(u32::MAX);
                        report.digest.violations += count;
                        tally.violation_count += count;
                        for failure in failures {
                            if let Some(item_id) = &failure.item_id {
                                tally.affected_items.insert(item_id.clone());
                            }
                            batch.push(constraint_event(target, actor, &failure)?);
                        }
                        report.issues.push(violation_issue(&active.ruleset.id, rule, count));
                    }
                }
            }
        }

        for (invariant, tally) in tallies {
            let status = if tally.violation_count > 0 {
                report.digest.invariants_failed.push(invariant.clone());
                InvariantStatus::Fail
            } else {
                InvariantStatus::Pass
            };
            batch.push(NewEvent::typed(
                EventType::InvariantChecked,
                target,
                actor,
                &InvariantCheckedPayload {
                    invariant,
                    status,
                    rule_count: tally.rule_count,
                    violation_count: tally.violation_count,
                    affected_items: tally.affected_items.into_iter().collect(),
                    rulesets: tally.rulesets.into_iter().collect(),
                },
            )?);
        }

        report.events_written = batch.len();
        ledger
            .append_many(batch)
            .with_context(|| format!("failed to record constraint results for {target}"))?;
        debug!(
            artifact_id = %target,
            rules = report.digest.rules_evaluated,
            violations = report.digest.violations,
            errors = report.digest.errors,
            "constraints evaluated"
        );
        Ok(report)
    }

    fn run_rule(&self, request: &EvaluationRequest) -> Result<RuleVerdict, String> {
        let Some(evaluator) = &self.evaluator else {
            return Err("no rule evaluator is configured".to_string());
        };
        let verdict = evaluator.evaluate(request).map_err(|err| format!("{err:#}"))?;
        verdict.validate().map_err(|err| err.message().to_string())?;
        Ok(verdict)
    }
}

impl std::fmt::Debug for ConstraintBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstraintBridge")
            .field("rulesets", &self.active_rulesets())
            .field("load_errors", &self.load_errors)
            .field("failed_rulesets", &self.failed_rulesets)
            .field("evaluator", &self.evaluator.is_some())
            .finish()
    }
}

fn read_ruleset(path: &Path, content: &dyn ContentStore) -> Result<(Ruleset, RulesetRef), GovernanceError> {
    let bytes = std::fs::read(path)
        .map_err(|err| GovernanceError::RulesetLoad(format!("failed to read ruleset: {err}")))?;
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));
    let value: Value = if is_yaml {
        serde_yaml::from_slice(&bytes)
            .map_err(|err| GovernanceError::RulesetLoad(format!("invalid YAML: {err}")))?
    } else {
        serde_json::from_slice(&bytes)
            .map_err(|err| GovernanceError::RulesetLoad(format!("invalid JSON: {err}")))?
    };
    let ruleset = Ruleset::from_json(&value)?;
    let content_id = content
        .put(&bytes)
        .map_err(|err| GovernanceError::RulesetLoad(format!("failed to store ruleset content: {err:#}")))?;
    let reference = RulesetRef {
        id: ruleset.id.clone(),
        version: ruleset.version.clone(),
        content_id,
        path: path.display().to_string(),
    };
    Ok((ruleset, reference))
}

fn failure_payloads(base: &ConstraintEvaluatedPayload, verdict: RuleVerdict) -> Vec<ConstraintEvaluatedPayload> {
    if verdict.violations.is_empty() {
        return vec![ConstraintEvaluatedPayload {
            result: ConstraintResult::Fail,
            message: Some("rule failed without itemized violations".to_string()),
            evidence: verdict.evidence,
            ..base.clone()
        }];
    }
    verdict
        .violations
        .into_iter()
        .map(|violation| ConstraintEvaluatedPayload {
            result: ConstraintResult::Fail,
            item_id: violation.item_id,
            message: Some(truncate_message(&violation.message)),
            evidence: violation.evidence,
            ..base.clone()
        })
        .collect()
}

fn violation_issue(ruleset_id: &str, rule: &RuleDecl, count: u32) -> ValidationIssue {
    ValidationIssue::new(
        rule.severity,
        "constraint.violation",
        format!(
            "rule `{}` ({}) reported {count} violation(s)",
            rule.rule_id,
            normalize_invariant(&rule.invariant)
        ),
    )
    .at(format!("/rulesets/{ruleset_id}/{}", rule.rule_id))
}

fn constraint_event(target: ArtifactId, actor: &str, payload: &ConstraintEvaluatedPayload) -> Result<NewEvent> {
    Ok(NewEvent::typed(EventType::ConstraintEvaluated, target, actor, payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use effect_ledger_core::{content_id_for_bytes, InvariantStatus, RuleViolation, Severity};
    use effect_ledger_store::{ConstraintDataStatus, MemoryContentStore};
    use serde_json::json;
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

    fn ruleset(id: &str, rules: &[(&str, &str)]) -> Ruleset {
        let rules: Vec<Value> = rules
            .iter()
            .map(|(rule_id, invariant)| json!({"rule_id": rule_id, "invariant": invariant, "severity": "warn"}))
            .collect();
        must_ok(Ruleset::from_json(&json!({"id": id, "version": "1", "rules": rules})))
    }

    fn seeded_plan(ledger: &EventLedger) -> ArtifactId {
        let plan = ArtifactId::new();
        must(ledger.append(
            NewEvent::new(
                EventType::ArtifactCreated,
                plan,
                "tester",
                json!({"content": {"operation": "vault.purge"}, "inputs": []}),
            )
            .with_content(content_id_for_bytes(b"plan"), "plan"),
        ));
        plan
    }

    #[test]
    fn naming_drift_aggregates_into_one_invariant() {
        let evaluator = |request: &EvaluationRequest| -> Result<RuleVerdict> {
            if request.rule.rule_id == "orphans" {
                Ok(RuleVerdict::fail(vec![
                    RuleViolation {
                        item_id: Some("notes/a.md".to_string()),
                        message: "orphaned".to_string(),
                        evidence: Value::Null,
                    },
                    RuleViolation {
                        item_id: Some("notes/b.md".to_string()),
                        message: "orphaned".to_string(),
                        evidence: Value::Null,
                    },
                ]))
            } else {
                Ok(RuleVerdict::pass(json!({})))
            }
        };
        let mut bridge = ConstraintBridge::new(Some(Box::new(evaluator)));
        must_ok(bridge.add_ruleset(
            ruleset("links", &[("orphans", " No-Orphans"), ("dangling", "no-orphans ")]),
            "inline:links",
        ));

        let ledger = must(EventLedger::in_memory());
        let plan = seeded_plan(&ledger);
        let report = must(bridge.evaluate(&ledger, plan, "bridge"));

        assert_eq!(report.digest.rules_evaluated, 2);
        assert_eq!(report.digest.violations, 2);
        assert_eq!(report.digest.invariants_failed, vec!["no-orphans".to_string()]);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].severity, Severity::Warn);
        // two violation events, one pass event, one invariant check
        assert_eq!(report.events_written, 4);

        let engine = QueryEngine::new(&ledger);
        let invariants = must(engine.invariant_summary(plan));
        assert_eq!(invariants.len(), 1);
        assert_eq!(invariants[0].status, InvariantStatus::Fail);
        assert_eq!(invariants[0].rule_count, 2);
        assert_eq!(invariants[0].affected_items, vec!["notes/a.md", "notes/b.md"]);
    }

    #[test]
    fn evaluator_errors_degrade_without_counting_as_passes() {
        let evaluator = |request: &EvaluationRequest| -> Result<RuleVerdict> {
            if request.rule.rule_id == "flaky" {
                anyhow::bail!("predicate crashed");
            }
            Ok(RuleVerdict::pass(json!({})))
        };
        let mut bridge = ConstraintBridge::new(Some(Box::new(evaluator)));
        must_ok(bridge.add_ruleset(ruleset("a", &[("steady", "integrity")]), "inline:a"));
        must_ok(bridge.add_ruleset(ruleset("b", &[("flaky", "freshness")]), "inline:b"));

        let ledger = must(EventLedger::in_memory());
        let plan = seeded_plan(&ledger);
        let report = must(bridge.evaluate(&ledger, plan, "bridge"));
        assert_eq!(report.digest.errors, 1);
        assert_eq!(report.digest.rules_evaluated, 1);

        let engine = QueryEngine::new(&ledger);
        let invariants = must(engine.invariant_summary(plan));
        let names: Vec<&str> = invariants.iter().map(|summary| summary.invariant.as_str()).collect();
        assert_eq!(names, vec!["integrity"]);

        let summary = must(engine.constraint_summary(plan));
        assert_eq!(summary.evaluations.errored, 1);
        assert_eq!(summary.constraint_data_status, ConstraintDataStatus::Present);
    }

    #[test]
    fn missing_evaluator_records_errors_for_every_rule() {
        let mut bridge = ConstraintBridge::new(None);
        must_ok(bridge.add_ruleset(ruleset("a", &[("r1", "x"), ("r2", "y")]), "inline:a"));
        let ledger = must(EventLedger::in_memory());
        let plan = seeded_plan(&ledger);
        let report = must(bridge.evaluate(&ledger, plan, "bridge"));
        assert_eq!(report.digest.errors, 2);
        assert_eq!(report.events_written, 2);
    }

    #[test]
    fn ruleset_files_load_from_yaml_and_failures_are_collected() {
        let dir = std::env::temp_dir().join(format!("elg-rulesets-{}", Ulid::new()));
        must_ok(std::fs::create_dir_all(&dir));
        let yaml = dir.join("hygiene.yaml");
        must_ok(std::fs::write(
            &yaml,
            "id: hygiene\nversion: \"2\"\nrules:\n  - rule_id: no-empty\n    invariant: Note Integrity\n",
        ));
        let broken = dir.join("broken.json");
        must_ok(std::fs::write(&broken, "{\"id\": \"broken\""));

        let content = MemoryContentStore::new();
        let mut bridge = ConstraintBridge::new(None);
        let reference = must_ok(bridge.load_ruleset_file(&yaml, &content));
        assert_eq!(reference.id, "hygiene");
        assert_eq!(reference.version, "2");
        assert!(must(content.get(&reference.content_id)).is_some());

        let duplicate = bridge.load_ruleset_file(&yaml, &content);
        assert!(matches!(duplicate, Err(GovernanceError::RulesetLoad(_))));
        assert!(bridge.load_ruleset_file(&broken, &content).is_err());
        assert!(bridge.load_ruleset_file(&dir.join("absent.json"), &content).is_err());

        assert_eq!(bridge.active_rulesets().len(), 1);
        assert_eq!(bridge.load_errors().len(), 3);
        assert_eq!(
            bridge.failed_rulesets(),
            [broken.display().to_string(), dir.join("absent.json").display().to_string()]
        );

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn unknown_targets_are_rejected() {
        let bridge = ConstraintBridge::new(None);
        let ledger = must(EventLedger::in_memory());
        assert!(bridge.evaluate(&ledger, ArtifactId::new(), "bridge").is_err());
    }
}
