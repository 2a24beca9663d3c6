use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use effect_ledger_core::{EnforcementMode, GovernanceError};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LEDGER_PATH: &str = "./effect_ledger.sqlite3";
pub const DEFAULT_CONTENT_DIR: &str = "./effect_ledger_content";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Jsonl,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LedgerSection {
    #[serde(default)]
    pub backend: BackendKind,
    pub path: Option<PathBuf>,
}

/// An external program and its fixed arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CommandSection {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// On-disk project configuration. YAML or JSON; `serde_yaml` reads both.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default)]
    pub ledger: LedgerSection,
    pub content_dir: Option<PathBuf>,
    pub vault_root: Option<PathBuf>,
    #[serde(default)]
    pub rulesets: Vec<PathBuf>,
    pub evaluator: Option<CommandSection>,
    pub publish: Option<CommandSection>,
    pub enforcement: Option<EnforcementMode>,
    pub surface: Option<String>,
    pub actor: Option<String>,
}

impl ProjectConfig {
    /// Reads `path` and resolves every relative path against its directory.
    ///
    /// # Errors
    /// Fails when the file cannot be read or parsed, or when
    /// [`ProjectConfig::validate`] rejects it.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&raw).map_err(|err| {
            GovernanceError::Configuration(format!("config file {} is invalid: {err}", path.display()))
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_relative_to(base);
        config.validate()?;
        Ok(config)
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        if let Some(path) = self.ledger.path.as_mut() {
            resolve(path);
        }
        if let Some(path) = self.content_dir.as_mut() {
            resolve(path);
        }
        if let Some(path) = self.vault_root.as_mut() {
            resolve(path);
        }
        self.rulesets.iter_mut().for_each(resolve);
    }

    /// # Errors
    /// Returns [`GovernanceError::Configuration`] for empty names or
    /// programs.
    pub fn validate(&self) -> Result<(), GovernanceError> {
        for (field, command) in [("evaluator", &self.evaluator), ("publish", &self.publish)] {
            if command.as_ref().is_some_and(|command| command.program.trim().is_empty()) {
                return Err(GovernanceError::Configuration(format!(
                    "{field}.program MUST be non-empty"
                )));
            }
        }
        for (field, value) in [("surface", &self.surface), ("actor", &self.actor)] {
            if value.as_ref().is_some_and(|value| value.trim().is_empty()) {
                return Err(GovernanceError::Configuration(format!("{field} MUST be non-empty when set")));
            }
        }
        if self.ledger.path.as_ref().is_some_and(|path| path.as_os_str().is_empty()) {
            return Err(GovernanceError::Configuration("ledger.path MUST be non-empty when set".to_string()));
        }
        Ok(())
    }
}

/// Effective settings after command-line flags override the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub ledger: PathBuf,
    pub backend: BackendKind,
    pub content_dir: PathBuf,
    pub vault: Option<PathBuf>,
    pub rulesets: Vec<PathBuf>,
    pub evaluator: Option<CommandSection>,
    pub publish: Option<CommandSection>,
    pub enforcement: EnforcementMode,
    pub surface: Option<String>,
    pub actor: Option<String>,
}

impl Settings {
    #[must_use]
    pub fn from_config(config: ProjectConfig) -> Self {
        Self {
            ledger: config
                .ledger
                .path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER_PATH)),
            backend: config.ledger.backend,
            content_dir: config
                .content_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTENT_DIR)),
            vault: config.vault_root,
            rulesets: config.rulesets,
            evaluator: config.evaluator,
            publish: config.publish,
            enforcement: config.enforcement.unwrap_or_default(),
            surface: config.surface,
            actor: config.actor,
        }
    }

    /// Settings for a ledger and content directory with nothing else set.
    #[must_use]
    pub fn with_paths(ledger: impl Into<PathBuf>, content_dir: impl Into<PathBuf>) -> Self {
        let mut settings = Self::from_config(ProjectConfig::default());
        settings.ledger = ledger.into();
        settings.content_dir = content_dir.into();
        settings
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(ProjectConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn write_config(body: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("elg-config-{}", Ulid::new()));
        if let Err(err) = fs::create_dir_all(&dir) {
            panic!("failed to create config dir: {err}");
        }
        let path = dir.join("elg.yaml");
        if let Err(err) = fs::write(&path, body) {
            panic!("failed to write config: {err}");
        }
        path
    }

    #[test]
    fn relative_paths_resolve_against_the_config_file() {
        let path = write_config(
            "ledger:\n  backend: jsonl\n  path: state/ledger.jsonl\nvault_root: notes\nrulesets: [rules/scope.yaml, /abs/rules.json]\nenforcement: strict\n",
        );
        let base = must(path.parent().map(Path::to_path_buf).ok_or_else(|| anyhow::anyhow!("no parent")));

        let config = must(ProjectConfig::load(&path));
        assert_eq!(config.ledger.backend, BackendKind::Jsonl);
        assert_eq!(config.ledger.path, Some(base.join("state/ledger.jsonl")));
        assert_eq!(config.vault_root, Some(base.join("notes")));
        assert_eq!(
            config.rulesets,
            vec![base.join("rules/scope.yaml"), PathBuf::from("/abs/rules.json")]
        );

        let settings = Settings::from_config(config);
        assert_eq!(settings.enforcement, EnforcementMode::Strict);
        assert_eq!(settings.content_dir, PathBuf::from(DEFAULT_CONTENT_DIR));
    }

    #[test]
    fn json_configs_parse_too() {
        let path = write_config(r#"{"evaluator": {"program": "python3", "args": ["eval.py"]}, "actor": "ops"}"#);
        let config = must(ProjectConfig::load(&path));
        assert_eq!(config.actor.as_deref(), Some("ops"));
        assert_eq!(
            config.evaluator.map(|command| command.args),
            Some(vec!["eval.py".to_string()])
        );
    }

    #[test]
    fn invalid_configs_are_configuration_errors() {
        let unknown = write_config("ledgr: {}\n");
        let err = match ProjectConfig::load(&unknown) {
            Ok(_) => panic!("expected unknown field to fail"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<GovernanceError>(),
            Some(GovernanceError::Configuration(_))
        ));

        let empty_program = write_config("publish:\n  program: \"  \"\n");
        assert!(ProjectConfig::load(&empty_program).is_err());
    }
}
