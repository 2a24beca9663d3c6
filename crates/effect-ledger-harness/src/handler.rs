use std::collections::BTreeMap;
use std::sync::Mutex;

use effect_ledger_core::{
    ArtifactId, EffectSummary, ExecutionId, GovernanceError, HandlerMetrics, InputsSnapshot,
    PlanContent,
};
use serde_json::Value;

use crate::secrets::{SecretRef, SecretResolver};

/// Fault raised by a handler phase, recorded with its type tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error_type}: {message}")]
pub struct HandlerError {
    pub error_type: String,
    pub message: String,
}

impl HandlerError {
    #[must_use]
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn io(context: &str, err: &std::io::Error) -> Self {
        Self::new("io", format!("{context}: {err}"))
    }
}

/// Output of the pure planning phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanDraft {
    pub plan: Value,
    pub effect_summary: EffectSummary,
}

/// What the handler reports after its effect ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutcome {
    pub metrics: HandlerMetrics,
    pub output: Value,
    pub erased: BTreeMap<String, u64>,
    pub created: BTreeMap<String, u64>,
}

/// Read-only view handed to [`OperationHandler::plan`].
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    pub operation: &'a str,
    pub actor: &'a str,
    pub inputs: &'a InputsSnapshot,
}

/// Execution-time context. The only place where secret references can be
/// resolved; every resolved value is remembered so the harness can redact
/// it from anything it records.
pub struct ExecContext<'a> {
    pub plan_artifact_id: ArtifactId,
    pub execution_id: ExecutionId,
    pub attempt: u32,
    pub dry_run: bool,
    pub actor: &'a str,
    secrets: &'a dyn SecretResolver,
    resolved: Mutex<Vec<String>>,
}

impl<'a> ExecContext<'a> {
    #[must_use]
    pub fn new(
        plan_artifact_id: ArtifactId,
        execution_id: ExecutionId,
        attempt: u32,
        dry_run: bool,
        actor: &'a str,
        secrets: &'a dyn SecretResolver,
    ) -> Self {
        Self {
            plan_artifact_id,
            execution_id,
            attempt,
            dry_run,
            actor,
            secrets,
            resolved: Mutex::new(Vec::new()),
        }
    }

    /// Resolves a `secret://` reference through the configured resolver.
    ///
    /// # Errors
    /// Returns a `secret_unavailable` handler error when the reference
    /// cannot be resolved.
    pub fn resolve_secret(&self, reference: &SecretRef) -> Result<String, HandlerError> {
        let value = self.secrets.resolve(reference)?;
        if !value.is_empty() {
            if let Ok(mut resolved) = self.resolved.lock() {
                resolved.push(value.clone());
            }
        }
        Ok(value)
    }

    /// Replaces every resolved secret value in `text`.
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        let Ok(resolved) = self.resolved.lock() else {
            return text.to_string();
        };
        resolved
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), "[redacted]"))
    }

    /// Applies [`ExecContext::redact`] to every string inside `value`.
    #[must_use]
    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::String(text) => Value::String(self.redact(text)),
            Value::Array(items) => Value::Array(items.iter().map(|item| self.redact_value(item)).collect()),
            Value::Object(object) => Value::Object(
                object
                    .iter()
                    .map(|(key, item)| (key.clone(), self.redact_value(item)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl std::fmt::Debug for ExecContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("plan_artifact_id", &self.plan_artifact_id)
            .field("execution_id", &self.execution_id)
            .field("attempt", &self.attempt)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

/// One governed operation. `plan` must not change anything; all effects
/// belong in `execute` (and `commit`).
pub trait OperationHandler: Send + Sync {
    fn operation(&self) -> &str;

    /// Handler-specific parameter checks, one message per problem.
    fn validate_params(&self, _params: &Value) -> Vec<String> {
        Vec::new()
    }

    #[allow(clippy::missing_errors_doc)]
    fn plan(&self, ctx: &PlanContext<'_>, params: &Value) -> Result<PlanDraft, HandlerError>;

    #[allow(clippy::missing_errors_doc)]
    fn prepare(&self, _ctx: &ExecContext<'_>, _plan: &PlanContent) -> Result<(), HandlerError> {
        Ok(())
    }

    #[allow(clippy::missing_errors_doc)]
    fn execute(&self, ctx: &ExecContext<'_>, plan: &PlanContent) -> Result<HandlerOutcome, HandlerError>;

    #[allow(clippy::missing_errors_doc)]
    fn commit(
        &self,
        _ctx: &ExecContext<'_>,
        _plan: &PlanContent,
        _outcome: &HandlerOutcome,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Handlers addressable by operation name.
#[derive(Default)]
pub struct HandlerSet {
    handlers: BTreeMap<String, Box<dyn OperationHandler>>,
}

impl HandlerSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns [`GovernanceError::Configuration`] when a handler for the
    /// same operation is already registered.
    pub fn register(&mut self, handler: Box<dyn OperationHandler>) -> Result<(), GovernanceError> {
        let operation = handler.operation().to_string();
        if self.handlers.contains_key(&operation) {
            return Err(GovernanceError::Configuration(format!(
                "handler for `{operation}` is already registered"
            )));
        }
        self.handlers.insert(operation, handler);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, operation: &str) -> Option<&dyn OperationHandler> {
        self.handlers.get(operation).map(AsRef::as_ref)
    }

    /// # Errors
    /// Returns [`GovernanceError::Validation`] for an unknown operation.
    pub fn require(&self, operation: &str) -> Result<&dyn OperationHandler, GovernanceError> {
        self.get(operation).ok_or_else(|| {
            GovernanceError::Validation(format!(
                "no handler registered for operation `{operation}` (known: {})",
                self.operations().join(", ")
            ))
        })
    }

    #[must_use]
    pub fn operations(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet")
            .field("operations", &self.operations())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use effect_ledger_core::EffectType;
    use serde_json::json;

    struct Noop(&'static str);

    impl OperationHandler for Noop {
        fn operation(&self) -> &str {
            self.0
        }

        fn plan(&self, _ctx: &PlanContext<'_>, _params: &Value) -> Result<PlanDraft, HandlerError> {
            Ok(PlanDraft {
                plan: json!({}),
                effect_summary: EffectSummary::new(EffectType::Read),
            })
        }

        fn execute(&self, _ctx: &ExecContext<'_>, _plan: &PlanContent) -> Result<HandlerOutcome, HandlerError> {
            Ok(HandlerOutcome::default())
        }
    }

    struct FixedSecret;

    impl SecretResolver for FixedSecret {
        fn resolve(&self, _reference: &SecretRef) -> Result<String, HandlerError> {
            Ok("hunter2".to_string())
        }
    }

    #[test]
    fn duplicate_operations_are_rejected() {
        let mut set = HandlerSet::new();
        assert!(set.register(Box::new(Noop("vault.snapshot"))).is_ok());
        let err = set.register(Box::new(Noop("vault.snapshot"))).err();
        assert!(matches!(err, Some(GovernanceError::Configuration(_))));
        assert!(set.require("vault.unknown").is_err());
        assert_eq!(set.operations(), vec!["vault.snapshot"]);
    }

    #[test]
    fn resolved_secrets_are_redacted_everywhere() {
        let resolver = FixedSecret;
        let ctx = ExecContext::new(ArtifactId::new(), ExecutionId::new(), 1, false, "ops", &resolver);
        let reference = SecretRef::parse("secret://publish-token")
            .unwrap_or_else(|| panic!("valid secret reference"));
        let value = ctx
            .resolve_secret(&reference)
            .unwrap_or_else(|err| panic!("resolve failed: {err}"));
        assert_eq!(value, "hunter2");

        assert_eq!(ctx.redact("auth hunter2 failed"), "auth [redacted] failed");
        assert_eq!(
            ctx.redact_value(&json!({"log": ["hunter2", 3]})),
            json!({"log": ["[redacted]", 3]})
        );
    }
}
