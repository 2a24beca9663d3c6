//! Built-in handlers over a notes vault directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use effect_ledger_core::{truncate_message, EffectSummary, EffectType, HandlerMetrics, PlanContent};
use serde_json::{json, Value};

use crate::handler::{ExecContext, HandlerError, HandlerOutcome, OperationHandler, PlanContext, PlanDraft};
use crate::secrets::SecretRef;
use crate::source::{ContentEntry, ContentSource, DirectoryContentSource};

/// Registers `vault.snapshot`, `vault.export`, `vault.purge` and, when a
/// publish command is configured, `vault.publish`.
#[must_use]
pub fn vault_handlers(root: &Path, publish: Option<PublishCommand>) -> Vec<Box<dyn OperationHandler>> {
    let mut handlers: Vec<Box<dyn OperationHandler>> = vec![
        Box::new(SnapshotHandler::new(root)),
        Box::new(ExportHandler::new(root)),
        Box::new(PurgeHandler::new(root)),
    ];
    if let Some(command) = publish {
        handlers.push(Box::new(PublishHandler::new(root, command)));
    }
    handlers
}

fn list(source: &DirectoryContentSource) -> Result<Vec<ContentEntry>, HandlerError> {
    source
        .entries()
        .map_err(|err| HandlerError::new("vault_unreadable", format!("{err:#}")))
}

fn required_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn is_safe_relative(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

fn planned_files(plan: &PlanContent) -> Result<Vec<String>, HandlerError> {
    let files = plan
        .plan
        .get("files")
        .and_then(Value::as_array)
        .ok_or_else(|| HandlerError::new("invalid_plan", "plan MUST list files"))?;
    files
        .iter()
        .map(|file| {
            file.as_str()
                .filter(|path| is_safe_relative(path))
                .map(str::to_string)
                .ok_or_else(|| HandlerError::new("invalid_plan", format!("unsafe planned path {file}")))
        })
        .collect()
}

fn to_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone)]
pub struct SnapshotHandler {
    source: DirectoryContentSource,
}

impl SnapshotHandler {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            source: DirectoryContentSource::new(root),
        }
    }
}

impl OperationHandler for SnapshotHandler {
    fn operation(&self) -> &str {
        "vault.snapshot"
    }

    fn plan(&self, ctx: &PlanContext<'_>, _params: &Value) -> Result<PlanDraft, HandlerError> {
        Ok(PlanDraft {
            plan: json!({
                "root": self.source.root().display().to_string(),
                "content_hash": ctx.inputs.content_hash,
            }),
            effect_summary: EffectSummary::new(EffectType::Read),
        })
    }

    fn execute(&self, _ctx: &ExecContext<'_>, _plan: &PlanContent) -> Result<HandlerOutcome, HandlerError> {
        let entries = list(&self.source)?;
        let snapshot = crate::source::snapshot_of(&entries);
        Ok(HandlerOutcome {
            metrics: HandlerMetrics {
                items_read: to_u64(entries.len()),
                ..HandlerMetrics::default()
            },
            output: json!({
                "content_hash": snapshot.content_hash,
                "counts": snapshot.counts,
            }),
            ..HandlerOutcome::default()
        })
    }
}

/// Copies notes into a destination directory. Overwriting an existing
/// destination file is predicted erasure.
#[derive(Debug, Clone)]
pub struct ExportHandler {
    source: DirectoryContentSource,
}

impl ExportHandler {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            source: DirectoryContentSource::new(root),
        }
    }
}

impl OperationHandler for ExportHandler {
    fn operation(&self) -> &str {
        "vault.export"
    }

    fn validate_params(&self, params: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        if required_str(params, "destination").is_none() {
            errors.push("vault.export requires a non-empty `destination`".to_string());
        }
        if let Some(prefix) = params.get("prefix") {
            if !prefix.as_str().is_some_and(is_safe_relative) {
                errors.push("`prefix` MUST be a relative path inside the vault".to_string());
            }
        }
        errors
    }

    fn plan(&self, _ctx: &PlanContext<'_>, params: &Value) -> Result<PlanDraft, HandlerError> {
        let destination = required_str(params, "destination")
            .ok_or_else(|| HandlerError::new("invalid_params", "missing destination"))?;
        let prefix = params.get("prefix").and_then(Value::as_str).unwrap_or("");
        let destination_root = PathBuf::from(destination);

        let files: Vec<String> = list(&self.source)?
            .into_iter()
            .filter(|entry| entry.is_note() && entry.path.starts_with(prefix))
            .map(|entry| entry.path)
            .collect();
        let overwrites = files
            .iter()
            .filter(|path| destination_root.join(path).exists())
            .count();

        let mut summary = EffectSummary::new(EffectType::Append).with_output(destination);
        if overwrites > 0 {
            summary = summary.with_erasure("overwritten_files", to_u64(overwrites));
        }
        Ok(PlanDraft {
            plan: json!({
                "destination": destination,
                "files": files,
                "overwrites": overwrites,
            }),
            effect_summary: summary,
        })
    }

    fn prepare(&self, _ctx: &ExecContext<'_>, plan: &PlanContent) -> Result<(), HandlerError> {
        for path in planned_files(plan)? {
            if !self.source.root().join(&path).is_file() {
                return Err(HandlerError::new(
                    "stale_plan",
                    format!("planned file {path} no longer exists"),
                ));
            }
        }
        Ok(())
    }

    fn execute(&self, _ctx: &ExecContext<'_>, plan: &PlanContent) -> Result<HandlerOutcome, HandlerError> {
        let destination = plan
            .plan
            .get("destination")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::new("invalid_plan", "plan MUST name a destination"))?;
        let destination = PathBuf::from(destination);

        let mut metrics = HandlerMetrics::default();
        let mut new_files = 0_u64;
        let mut overwritten = 0_u64;
        for path in planned_files(plan)? {
            let from = self.source.root().join(&path);
            let to = destination.join(&path);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent).map_err(|err| HandlerError::io("failed to create export directory", &err))?;
            }
            if to.exists() {
                overwritten += 1;
            } else {
                new_files += 1;
            }
            let bytes = fs::copy(&from, &to).map_err(|err| HandlerError::io(&format!("failed to export {path}"), &err))?;
            metrics.items_read += 1;
            metrics.items_written += 1;
            metrics.bytes_written += bytes;
        }

        let mut created = BTreeMap::new();
        created.insert("files".to_string(), new_files);
        let mut erased = BTreeMap::new();
        if overwritten > 0 {
            erased.insert("overwritten_files".to_string(), overwritten);
        }
        Ok(HandlerOutcome {
            metrics,
            output: json!({"destination": destination.display().to_string(), "exported": new_files + overwritten}),
            erased,
            created,
        })
    }
}

/// Deletes the notes under a prefix.
#[derive(Debug, Clone)]
pub struct PurgeHandler {
    source: DirectoryContentSource,
}

impl PurgeHandler {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            source: DirectoryContentSource::new(root),
        }
    }
}

impl OperationHandler for PurgeHandler {
    fn operation(&self) -> &str {
        "vault.purge"
    }

    fn validate_params(&self, params: &Value) -> Vec<String> {
        match required_str(params, "prefix") {
            None => vec!["vault.purge requires a non-empty `prefix`".to_string()],
            Some(prefix) if !is_safe_relative(prefix) => {
                vec!["`prefix` MUST be a relative path inside the vault".to_string()]
            }
            Some(_) => Vec::new(),
        }
    }

    fn plan(&self, _ctx: &PlanContext<'_>, params: &Value) -> Result<PlanDraft, HandlerError> {
        let prefix = required_str(params, "prefix")
            .ok_or_else(|| HandlerError::new("invalid_params", "missing prefix"))?;
        let files: Vec<String> = list(&self.source)?
            .into_iter()
            .filter(|entry| entry.is_note() && entry.path.starts_with(prefix))
            .map(|entry| entry.path)
            .collect();

        let summary = EffectSummary::new(EffectType::Destructive)
            .with_erasure("notes", to_u64(files.len()))
            .with_reason(format!("purge prefix `{prefix}`"));
        Ok(PlanDraft {
            plan: json!({"prefix": prefix, "files": files}),
            effect_summary: summary,
        })
    }

    fn prepare(&self, _ctx: &ExecContext<'_>, plan: &PlanContent) -> Result<(), HandlerError> {
        planned_files(plan).map(|_| ())
    }

    fn execute(&self, _ctx: &ExecContext<'_>, plan: &PlanContent) -> Result<HandlerOutcome, HandlerError> {
        let mut metrics = HandlerMetrics::default();
        for path in planned_files(plan)? {
            let target = self.source.root().join(&path);
            match fs::remove_file(&target) {
                Ok(()) => metrics.items_deleted += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(HandlerError::io(&format!("failed to delete {path}"), &err)),
            }
        }

        let mut erased = BTreeMap::new();
        erased.insert("notes".to_string(), metrics.items_deleted);
        Ok(HandlerOutcome {
            output: json!({"deleted": metrics.items_deleted}),
            metrics,
            erased,
            ..HandlerOutcome::default()
        })
    }
}

/// External program run by `vault.publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Hands the vault to an external publisher. The target and vault root are
/// passed as `ELG_PUBLISH_TARGET` / `ELG_VAULT_ROOT`; a `token` parameter is
/// resolved and passed as `ELG_PUBLISH_TOKEN`.
#[derive(Debug, Clone)]
pub struct PublishHandler {
    source: DirectoryContentSource,
    command: PublishCommand,
}

impl PublishHandler {
    #[must_use]
    pub fn new(root: &Path, command: PublishCommand) -> Self {
        Self {
            source: DirectoryContentSource::new(root),
            command,
        }
    }
}

impl OperationHandler for PublishHandler {
    fn operation(&self) -> &str {
        "vault.publish"
    }

    fn validate_params(&self, params: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        if required_str(params, "target").is_none() {
            errors.push("vault.publish requires a non-empty `target`".to_string());
        }
        if let Some(token) = params.get("token") {
            if SecretRef::from_value(token).is_none() {
                errors.push("`token` MUST be a secret:// reference".to_string());
            }
        }
        errors
    }

    fn plan(&self, ctx: &PlanContext<'_>, params: &Value) -> Result<PlanDraft, HandlerError> {
        let target = required_str(params, "target")
            .ok_or_else(|| HandlerError::new("invalid_params", "missing target"))?;
        let notes = ctx.inputs.counts.get("notes").copied().unwrap_or(0);
        Ok(PlanDraft {
            plan: json!({
                "target": target,
                "program": self.command.program,
                "notes": notes,
                "token": params.get("token").cloned().unwrap_or(Value::Null),
            }),
            effect_summary: EffectSummary::new(EffectType::External).with_output(target),
        })
    }

    fn execute(&self, ctx: &ExecContext<'_>, plan: &PlanContent) -> Result<HandlerOutcome, HandlerError> {
        let target = plan
            .plan
            .get("target")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::new("invalid_plan", "plan MUST name a target"))?;

        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .env("ELG_PUBLISH_TARGET", target)
            .env("ELG_VAULT_ROOT", self.source.root());
        if let Some(reference) = plan.plan.get("token").and_then(SecretRef::from_value) {
            command.env("ELG_PUBLISH_TOKEN", ctx.resolve_secret(&reference)?);
        }

        let output = command
            .output()
            .map_err(|err| HandlerError::io(&format!("failed to run `{}`", self.command.program), &err))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HandlerError::new(
                "publish_failed",
                format!("{} exited with {}: {}", self.command.program, output.status, truncate_message(stderr.trim())),
            ));
        }

        let notes = plan.plan.get("notes").and_then(Value::as_u64).unwrap_or(0);
        Ok(HandlerOutcome {
            metrics: HandlerMetrics {
                items_read: notes,
                ..HandlerMetrics::default()
            },
            output: json!({
                "target": target,
                "stdout": truncate_message(String::from_utf8_lossy(&output.stdout).trim()),
            }),
            ..HandlerOutcome::default()
        })
    }
}
