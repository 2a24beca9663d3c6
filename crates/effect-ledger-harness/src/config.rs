use effect_ledger_core::{EnforcementMode, GovernanceError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Name of the calling surface recorded in every bundle.
    pub surface: String,
    pub engine_version: String,
    pub enforcement: EnforcementMode,
    pub default_actor: String,
    /// Refuse to run a plan when the content it was planned against changed.
    pub verify_inputs: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            surface: "cli".to_string(),
            engine_version: format!("effect-ledger/{}", env!("CARGO_PKG_VERSION")),
            enforcement: EnforcementMode::Local,
            default_actor: "local".to_string(),
            verify_inputs: true,
        }
    }
}

impl HarnessConfig {
    /// # Errors
    /// Returns [`GovernanceError::Configuration`] for empty identity fields.
    pub fn validate(&self) -> Result<(), GovernanceError> {
        for (field, value) in [
            ("surface", &self.surface),
            ("engine_version", &self.engine_version),
            ("default_actor", &self.default_actor),
        ] {
            if value.trim().is_empty() {
                return Err(GovernanceError::Configuration(format!(
                    "harness {field} MUST be non-empty"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn actor<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested
            .map(str::trim)
            .filter(|actor| !actor.is_empty())
            .unwrap_or(&self.default_actor)
    }
}
