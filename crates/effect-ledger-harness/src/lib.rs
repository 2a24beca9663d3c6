//! Execution harness: handlers plan purely, a lifecycle engine records every
//! transition, and a single gate stands between an unapproved high-risk plan
//! and its effect.

#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

mod bridge;
mod config;
mod evaluator;
mod handler;
mod harness;
mod plan_manager;
mod secrets;
mod source;
pub mod vault;

pub use bridge::{ConstraintBridge, EvaluationReport};
pub use config::HarnessConfig;
pub use evaluator::{CommandRuleEvaluator, EvaluationRequest, RuleEvaluator};
pub use handler::{
    ExecContext, HandlerError, HandlerOutcome, HandlerSet, OperationHandler, PlanContext, PlanDraft,
};
pub use harness::{
    ApproveResult, ExecuteOptions, ExecuteResult, Failure, Harness, ProposeOptions, ProposeResult,
    RejectResult, RunResult,
};
pub use plan_manager::{ExecutionRecord, PlanManager, PreparedArtifact};
pub use secrets::{screen_params, EnvSecretResolver, SecretRef, SecretResolver, RESERVED_PARAM_KEYS};
pub use source::{snapshot_of, ContentEntry, ContentSource, DirectoryContentSource, EmptyContentSource};
pub use vault::{vault_handlers, PublishCommand};
