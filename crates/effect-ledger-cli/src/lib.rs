//! `elg`: the command surface over the effect ledger.
//!
//! Hosts embed it through:
//! - [`run_cli`] for a fully parsed command line.
//! - [`run_command_with_paths`] to run one [`Command`] against explicit
//!   [`Settings`] (ledger path, content directory, vault, rulesets).
//!
//! Results go to stdout (JSON with `--json`, a compact line format
//! otherwise); diagnostics go to stderr. [`exit_code`] maps an error back to
//! the process exit status.

#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

mod check;
mod config;
mod render;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use effect_ledger_core::{
    parse_rfc3339_utc, ArtifactId, ArtifactSnapshot, ArtifactTypeRegistry, EnforcementMode, EventId,
    EventType, ExecutionId, ExecutionSummary, GovernanceError, PlanContent,
};
use effect_ledger_harness::{
    vault_handlers, CommandRuleEvaluator, ConstraintBridge, ContentSource, DirectoryContentSource,
    EmptyContentSource, EnvSecretResolver, ExecuteOptions, Failure, HandlerSet, Harness, HarnessConfig,
    ProposeOptions, PublishCommand, RuleEvaluator,
};
use effect_ledger_store::{
    ConstraintDataStatus, ContentStore, EventLedger, FsContentStore, Order, QueryEngine, QueryFilter,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

pub use check::{check_ledger, CheckIssue, CheckSeverity, LedgerCheck, LEDGER_CHECK_CONTRACT_VERSION};
pub use config::{
    BackendKind, CommandSection, LedgerSection, ProjectConfig, Settings, DEFAULT_CONTENT_DIR,
    DEFAULT_LEDGER_PATH,
};

#[derive(Debug, Parser)]
#[command(name = "elg")]
#[command(about = "Governed execution with an append-only effect ledger")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Default, Args)]
pub struct GlobalArgs {
    /// Project config file (YAML or JSON).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub ledger: Option<PathBuf>,
    #[arg(long, global = true, value_enum)]
    pub backend: Option<BackendKind>,
    #[arg(long, global = true)]
    pub content_dir: Option<PathBuf>,
    /// Vault directory the built-in handlers operate on.
    #[arg(long, global = true)]
    pub vault: Option<PathBuf>,
    /// Ruleset file; repeat for several.
    #[arg(long = "ruleset", global = true)]
    pub rulesets: Vec<PathBuf>,
    /// External rule evaluator command line.
    #[arg(long, global = true)]
    pub evaluator_cmd: Option<String>,
    /// Treat `fail` issues as blocking.
    #[arg(long, global = true)]
    pub strict: bool,
    #[arg(long, global = true)]
    pub actor: Option<String>,
    #[arg(long, global = true)]
    pub surface: Option<String>,
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

impl GlobalArgs {
    /// Loads the config file, if any, and applies the flag overrides.
    pub fn settings(&self) -> Result<Settings> {
        let config = match &self.config {
            Some(path) => ProjectConfig::load(path)?,
            None => ProjectConfig::default(),
        };
        let mut settings = Settings::from_config(config);

        if let Some(ledger) = &self.ledger {
            settings.ledger.clone_from(ledger);
        }
        if let Some(backend) = self.backend {
            settings.backend = backend;
        }
        if let Some(content_dir) = &self.content_dir {
            settings.content_dir.clone_from(content_dir);
        }
        if let Some(vault) = &self.vault {
            settings.vault = Some(vault.clone());
        }
        if !self.rulesets.is_empty() {
            settings.rulesets.clone_from(&self.rulesets);
        }
        if let Some(line) = &self.evaluator_cmd {
            let mut parts = line.split_whitespace().map(str::to_string);
            let program = parts.next().ok_or_else(|| {
                GovernanceError::Configuration("--evaluator-cmd MUST name a program".to_string())
            })?;
            settings.evaluator = Some(CommandSection {
                program,
                args: parts.collect(),
            });
        }
        if self.strict {
            settings.enforcement = EnforcementMode::Strict;
        }
        if let Some(actor) = &self.actor {
            settings.actor = Some(actor.clone());
        }
        if let Some(surface) = &self.surface {
            settings.surface = Some(surface.clone());
        }
        Ok(settings)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Plan an operation and record it as validated or rejected.
    Propose(ProposeArgs),
    /// Approve a validated plan.
    Approve(ApproveArgs),
    /// Withdraw a plan that has not run.
    Reject(RejectArgs),
    /// Run an approved (or approval-free) plan.
    Execute(ExecuteArgs),
    /// Propose then execute. Never approves.
    Run(RunArgs),
    Audit(ArtifactArgs),
    Timeline(ArtifactArgs),
    Summary(ArtifactArgs),
    Constraints(ArtifactArgs),
    Execution(ExecutionArgs),
    Events(EventsArgs),
    /// Self-audit of the ledger and content store.
    Check(CheckArgs),
}

#[derive(Debug, Args)]
pub struct ProposeArgs {
    operation: String,
    #[arg(long, default_value = "{}")]
    params: String,
    /// Plan this proposal replaces once executed.
    #[arg(long)]
    supersedes: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ApproveArgs {
    artifact_id: String,
    #[arg(long)]
    force_ack: bool,
    #[arg(long)]
    reason: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RejectArgs {
    artifact_id: String,
    #[arg(long)]
    reason: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ExecuteArgs {
    artifact_id: String,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    operation: String,
    #[arg(long, default_value = "{}")]
    params: String,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ArtifactArgs {
    artifact_id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ExecutionArgs {
    execution_id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct EventsArgs {
    #[arg(long)]
    artifact: Option<String>,
    #[arg(long)]
    execution: Option<String>,
    #[arg(long = "type")]
    event_type: Option<String>,
    #[arg(long)]
    actor: Option<String>,
    #[arg(long)]
    since: Option<String>,
    #[arg(long)]
    until: Option<String>,
    /// Payload match as `dotted.path=<json>`; repeatable.
    #[arg(long = "where")]
    where_eq: Vec<String>,
    #[arg(long, value_enum, default_value_t = OrderArg::Asc)]
    order: OrderArg,
    /// Resume after this event id.
    #[arg(long)]
    after: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OrderArg {
    Asc,
    Desc,
}

/// `summary` output: the folded snapshot with its executions.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ArtifactView {
    pub snapshot: ArtifactSnapshot,
    pub constraint_data_status: ConstraintDataStatus,
    pub executions: Vec<ExecutionSummary>,
}

/// Installs the stderr subscriber. `RUST_LOG` applies unless `-v` raises
/// the level explicitly.
pub fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        1 => tracing_subscriber::EnvFilter::new("info"),
        _ => tracing_subscriber::EnvFilter::new("debug"),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

/// Exit status for an error: the governance exit code when one is in the
/// chain, otherwise 1.
#[must_use]
pub fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<GovernanceError>())
        .map_or(1, GovernanceError::exit_code)
}

/// Executes the parsed command line.
///
/// # Errors
/// Returns an error when configuration, storage, or the command fails, or
/// when the command's result carries a failure.
pub fn run_cli(cli: Cli) -> Result<()> {
    let settings = cli.global.settings()?;
    run_command_with_paths(&settings, cli.command)
}

/// Executes one command against explicit settings.
///
/// # Errors
/// Same as [`run_cli`].
pub fn run_command_with_paths(settings: &Settings, command: Command) -> Result<()> {
    let ledger = open_ledger(settings)?;
    let content = FsContentStore::open(&settings.content_dir).with_context(|| {
        format!("failed to open content store at {}", settings.content_dir.display())
    })?;
    debug!(ledger = ledger.location(), content = %settings.content_dir.display(), "stores opened");

    match command {
        Command::Audit(args) => {
            let artifact_id = ArtifactId::parse(&args.artifact_id)?;
            let trail = QueryEngine::new(&ledger)
                .audit_trail(artifact_id)?
                .ok_or_else(|| unknown_artifact(artifact_id))?;
            emit(args.json, &trail, render::print_audit)
        }
        Command::Timeline(args) => {
            let artifact_id = ArtifactId::parse(&args.artifact_id)?;
            let engine = QueryEngine::new(&ledger);
            require_artifact(&engine, artifact_id)?;
            let timeline = engine.execution_timeline(artifact_id)?;
            emit(args.json, &timeline, |entries| render::print_timeline(entries))
        }
        Command::Summary(args) => {
            let artifact_id = ArtifactId::parse(&args.artifact_id)?;
            let engine = QueryEngine::new(&ledger);
            let view = ArtifactView {
                snapshot: require_artifact(&engine, artifact_id)?,
                constraint_data_status: engine.constraint_summary(artifact_id)?.constraint_data_status,
                executions: engine.execution_summaries(artifact_id)?,
            };
            emit(args.json, &view, render::print_artifact)
        }
        Command::Constraints(args) => {
            let artifact_id = ArtifactId::parse(&args.artifact_id)?;
            let engine = QueryEngine::new(&ledger);
            require_artifact(&engine, artifact_id)?;
            let summary = engine.constraint_summary(artifact_id)?;
            emit(args.json, &summary, render::print_constraints)
        }
        Command::Execution(args) => {
            let execution_id = ExecutionId::parse(&args.execution_id)?;
            let summary = QueryEngine::new(&ledger)
                .execution_summary(execution_id)?
                .ok_or_else(|| GovernanceError::Validation(format!("unknown execution {execution_id}")))?;
            emit(args.json, &summary, render::print_execution)
        }
        Command::Events(args) => {
            let filter = events_filter(&args)?;
            let events = ledger.query(&filter)?;
            emit(args.json, &events, |events| render::print_events(events))
        }
        Command::Check(args) => {
            let check = check_ledger(&ledger, &content)?;
            emit(args.json, &check, render::print_check)?;
            if check.healthy {
                Ok(())
            } else {
                Err(anyhow!("ledger check found problems in {}", ledger.location()))
            }
        }
        governed => run_governed(settings, &ledger, &content, governed),
    }
}

/// Commands that go through the harness.
fn run_governed(settings: &Settings, ledger: &EventLedger, content: &FsContentStore, command: Command) -> Result<()> {
    let registry = ArtifactTypeRegistry::with_defaults();
    let source: Box<dyn ContentSource> = match &settings.vault {
        Some(vault) => Box::new(DirectoryContentSource::new(vault)),
        None => Box::new(EmptyContentSource),
    };
    let secrets = EnvSecretResolver::default();
    let bridge = build_bridge(settings, content);
    let handlers = build_handlers(settings)?;
    let harness = Harness::new(ledger, content, &registry, source.as_ref(), &secrets, harness_config(settings))?
        .with_bridge(&bridge);

    match command {
        Command::Propose(args) => {
            let handler = require_handler(&handlers, settings, &args.operation)?;
            let supersedes = args.supersedes.as_deref().map(ArtifactId::parse).transpose()?;
            let result = harness.propose(
                handler,
                parse_params(&args.params)?,
                &ProposeOptions {
                    actor: None,
                    supersedes,
                },
            )?;
            emit(args.json, &result, render::print_propose)?;
            finish(result.failure.as_ref())
        }
        Command::Approve(args) => {
            let plan_id = ArtifactId::parse(&args.artifact_id)?;
            let approver = harness.config().default_actor.clone();
            let result = harness.approve(plan_id, &approver, args.force_ack, args.reason)?;
            emit(args.json, &result, render::print_approve)?;
            finish(result.failure.as_ref())
        }
        Command::Reject(args) => {
            let plan_id = ArtifactId::parse(&args.artifact_id)?;
            let result = harness.reject(plan_id, None, &args.reason)?;
            emit(args.json, &result, render::print_reject)?;
            finish(result.failure.as_ref())
        }
        Command::Execute(args) => {
            let plan_id = ArtifactId::parse(&args.artifact_id)?;
            let operation = plan_operation(&harness, plan_id)?;
            let handler = require_handler(&handlers, settings, &operation)?;
            let result = harness.execute(
                plan_id,
                handler,
                &ExecuteOptions {
                    actor: None,
                    dry_run: args.dry_run,
                },
            )?;
            emit(args.json, &result, render::print_execute)?;
            finish(result.failure.as_ref())
        }
        Command::Run(args) => {
            let handler = require_handler(&handlers, settings, &args.operation)?;
            let result = harness.run(
                handler,
                parse_params(&args.params)?,
                &ExecuteOptions {
                    actor: None,
                    dry_run: args.dry_run,
                },
            )?;
            emit(args.json, &result, render::print_run)?;
            finish(result.failure())
        }
        other => Err(anyhow!("internal dispatch error: {other:?} is not a governed command")),
    }
}

fn open_ledger(settings: &Settings) -> Result<EventLedger> {
    let path = settings.ledger.as_path();
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create ledger directory {}", parent.display()))?;
    }
    let ledger = match settings.backend {
        BackendKind::Sqlite => EventLedger::open_sqlite(path),
        BackendKind::Jsonl => EventLedger::open_jsonl(path),
    }
    .with_context(|| format!("failed to open ledger at {}", path.display()))?;
    info!(ledger = ledger.location(), "ledger opened");
    Ok(ledger)
}

fn harness_config(settings: &Settings) -> HarnessConfig {
    let mut config = HarnessConfig {
        enforcement: settings.enforcement,
        ..HarnessConfig::default()
    };
    if let Some(surface) = &settings.surface {
        config.surface.clone_from(surface);
    }
    if let Some(actor) = &settings.actor {
        config.default_actor.clone_from(actor);
    }
    config
}

/// Load failures are recorded on the bridge and surface as partial or
/// missing constraint data, never as a command failure.
fn build_bridge(settings: &Settings, content: &dyn ContentStore) -> ConstraintBridge {
    let evaluator = settings.evaluator.as_ref().map(|command| {
        Box::new(CommandRuleEvaluator::new(command.program.clone(), command.args.clone())) as Box<dyn RuleEvaluator>
    });
    let mut bridge = ConstraintBridge::new(evaluator);
    for path in &settings.rulesets {
        if let Ok(reference) = bridge.load_ruleset_file(path, content) {
            debug!(ruleset = %reference.id, version = %reference.version, "ruleset loaded");
        }
    }
    bridge
}

fn build_handlers(settings: &Settings) -> Result<HandlerSet> {
    let mut handlers = HandlerSet::new();
    let Some(vault) = settings.vault.as_deref() else {
        return Ok(handlers);
    };
    let publish = settings.publish.as_ref().map(|command| PublishCommand {
        program: command.program.clone(),
        args: command.args.clone(),
    });
    for handler in vault_handlers(vault, publish) {
        handlers.register(handler)?;
    }
    Ok(handlers)
}

fn require_handler<'h>(
    handlers: &'h HandlerSet,
    settings: &Settings,
    operation: &str,
) -> Result<&'h dyn effect_ledger_harness::OperationHandler> {
    if settings.vault.is_none() {
        return Err(GovernanceError::Configuration(
            "no vault configured; pass --vault or set vault_root in the config file".to_string(),
        )
        .into());
    }
    Ok(handlers.require(operation)?)
}

fn plan_operation(harness: &Harness<'_>, plan_id: ArtifactId) -> Result<String> {
    let snapshot = harness
        .plans()
        .snapshot(plan_id)?
        .ok_or_else(|| unknown_artifact(plan_id))?;
    if snapshot.artifact_type != "plan" {
        return Err(GovernanceError::Validation(format!(
            "artifact {plan_id} is a {}, not a plan",
            snapshot.artifact_type
        ))
        .into());
    }
    let plan: PlanContent = harness.plans().load_content(&snapshot)?;
    Ok(plan.operation)
}

fn require_artifact(engine: &QueryEngine<'_>, artifact_id: ArtifactId) -> Result<ArtifactSnapshot> {
    engine
        .snapshot(artifact_id)?
        .ok_or_else(|| unknown_artifact(artifact_id).into())
}

fn unknown_artifact(artifact_id: ArtifactId) -> GovernanceError {
    GovernanceError::Validation(format!("unknown artifact {artifact_id}"))
}

fn parse_params(raw: &str) -> Result<Value> {
    serde_json::from_str(raw)
        .map_err(|err| GovernanceError::Validation(format!("--params MUST be valid JSON: {err}")).into())
}

fn events_filter(args: &EventsArgs) -> Result<QueryFilter> {
    let mut filter = QueryFilter::new().order(match args.order {
        OrderArg::Asc => Order::Asc,
        OrderArg::Desc => Order::Desc,
    });
    if let Some(raw) = &args.artifact {
        filter = filter.artifact(ArtifactId::parse(raw)?);
    }
    if let Some(raw) = &args.execution {
        filter = filter.execution(ExecutionId::parse(raw)?);
    }
    if let Some(raw) = &args.event_type {
        let event_type = EventType::parse(raw)
            .ok_or_else(|| GovernanceError::Validation(format!("unknown event type `{raw}`")))?;
        filter = filter.event_type(event_type);
    }
    if let Some(actor) = &args.actor {
        filter = filter.actor(actor.clone());
    }
    if let Some(raw) = &args.since {
        filter = filter.since(parse_rfc3339_utc(raw)?);
    }
    if let Some(raw) = &args.until {
        filter = filter.until(parse_rfc3339_utc(raw)?);
    }
    for clause in &args.where_eq {
        let (path, raw) = clause.split_once('=').ok_or_else(|| {
            GovernanceError::Validation(format!("--where `{clause}` MUST look like path=value"))
        })?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        filter = filter.where_eq(path, value);
    }
    if let Some(raw) = &args.after {
        filter = filter.after(EventId::parse(raw)?);
    }
    if let Some(limit) = args.limit {
        filter = filter.limit(limit);
    }
    Ok(filter)
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

fn finish(failure: Option<&Failure>) -> Result<()> {
    match failure {
        Some(failure) => Err(failure.to_error().into()),
        None => Ok(()),
    }
}

/// Default settings rooted at `dir`, for hosts and tests.
#[must_use]
pub fn settings_in(dir: &Path) -> Settings {
    Settings::with_paths(dir.join("ledger.sqlite3"), dir.join("content"))
}
