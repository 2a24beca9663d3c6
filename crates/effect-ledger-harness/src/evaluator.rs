use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use effect_ledger_core::{truncate_message, ArtifactId, RuleDecl, RuleVerdict};
use serde::Serialize;
use serde_json::Value;

/// What an evaluator is asked about one rule.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EvaluationRequest {
    pub ruleset_id: String,
    pub ruleset_version: String,
    pub rule: RuleDecl,
    pub artifact_id: ArtifactId,
    pub artifact_type: String,
    pub content: Value,
}

/// Rule predicates live outside this workspace; this is the seam they plug into.
pub trait RuleEvaluator: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn evaluate(&self, request: &EvaluationRequest) -> Result<RuleVerdict>;
}

impl<F> RuleEvaluator for F
where
    F: Fn(&EvaluationRequest) -> Result<RuleVerdict> + Send + Sync,
{
    fn evaluate(&self, request: &EvaluationRequest) -> Result<RuleVerdict> {
        self(request)
    }
}

/// Runs an external program once per rule: the request as JSON on stdin,
/// a `RuleVerdict` as JSON on stdout. A non-zero exit is an evaluator error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRuleEvaluator {
    program: String,
    args: Vec<String>,
}

impl CommandRuleEvaluator {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Splits a whitespace-separated command line into program and args.
    #[must_use]
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }
}

impl RuleEvaluator for CommandRuleEvaluator {
    fn evaluate(&self, request: &EvaluationRequest) -> Result<RuleVerdict> {
        let input = serde_json::to_vec(request).context("failed to encode evaluation request")?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn evaluator `{}`", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .with_context(|| format!("failed to write request to evaluator `{}`", self.program))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("evaluator `{}` did not finish", self.program))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "evaluator `{}` exited with {}: {}",
                self.program,
                output.status,
                truncate_message(stderr.trim())
            );
        }

        let verdict: RuleVerdict = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("evaluator `{}` returned an invalid verdict", self.program))?;
        verdict.validate()?;
        Ok(verdict)
    }
}
