use effect_ledger_core::{is_secret_like_key, is_secret_ref, SECRET_REF_PREFIX};
use serde_json::Value;

use crate::handler::HandlerError;

/// Top-level parameter keys that only the governance layer may set.
pub const RESERVED_PARAM_KEYS: [&str; 6] = [
    "risk_class",
    "requires_approval",
    "effect_summary",
    "predicted_erasure",
    "force_ack",
    "approved",
];

/// Opaque `secret://<name>` reference. Only the name is ever recorded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretRef {
    name: String,
}

impl SecretRef {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let name = raw.strip_prefix(SECRET_REF_PREFIX)?.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
        })
    }

    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_str().and_then(Self::parse)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{SECRET_REF_PREFIX}{}", self.name)
    }
}

pub trait SecretResolver: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn resolve(&self, reference: &SecretRef) -> Result<String, HandlerError>;
}

/// Resolves `secret://publish-token` from `ELG_SECRET_PUBLISH_TOKEN`.
#[derive(Debug, Clone)]
pub struct EnvSecretResolver {
    prefix: String,
}

impl EnvSecretResolver {
    pub const DEFAULT_PREFIX: &'static str = "ELG_SECRET_";

    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn variable_for(&self, reference: &SecretRef) -> String {
        let suffix: String = reference
            .name()
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() {
                    ch.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{suffix}", self.prefix)
    }
}

impl Default for EnvSecretResolver {
    fn default() -> Self {
        Self::with_prefix(Self::DEFAULT_PREFIX)
    }
}

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, reference: &SecretRef) -> Result<String, HandlerError> {
        let variable = self.variable_for(reference);
        std::env::var(&variable).map_err(|_| {
            HandlerError::new(
                "secret_unavailable",
                format!("{reference} is not set (expected environment variable {variable})"),
            )
        })
    }
}

/// Governance screening of caller parameters before any planning happens.
/// Returns one message per problem; an empty list means the params pass.
#[must_use]
pub fn screen_params(params: &Value) -> Vec<String> {
    let Some(object) = params.as_object() else {
        return vec!["params MUST be a JSON object".to_string()];
    };

    let mut errors = Vec::new();
    for key in RESERVED_PARAM_KEYS {
        if object.contains_key(key) {
            errors.push(format!(
                "parameter `{key}` is reserved for governance and MUST NOT be supplied"
            ));
        }
    }
    collect_inline_secrets("", params, &mut errors);
    errors
}

fn collect_inline_secrets(prefix: &str, value: &Value, errors: &mut Vec<String>) {
    match value {
        Value::Object(object) => {
            for (key, item) in object {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                if is_secret_like_key(key) && !item.is_null() && !is_secret_ref(item) {
                    errors.push(format!(
                        "parameter `{path}` looks secret-bearing and MUST be a {SECRET_REF_PREFIX} reference"
                    ));
                    continue;
                }
                collect_inline_secrets(&path, item, errors);
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                collect_inline_secrets(&format!("{prefix}[{index}]"), item, errors);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn secret_refs_parse_names_only() {
        let reference = SecretRef::parse("secret://publish-token");
        assert_eq!(reference.as_ref().map(SecretRef::name), Some("publish-token"));
        assert_eq!(
            reference.map(|value| value.to_string()),
            Some("secret://publish-token".to_string())
        );
        assert!(SecretRef::parse("secret://").is_none());
        assert!(SecretRef::parse("publish-token").is_none());
    }

    #[test]
    fn env_resolver_maps_names_to_variables() {
        let resolver = EnvSecretResolver::default();
        let reference = SecretRef::parse("secret://publish-token.v2")
            .unwrap_or_else(|| panic!("valid reference"));
        assert_eq!(resolver.variable_for(&reference), "ELG_SECRET_PUBLISH_TOKEN_V2");

        let missing = SecretRef::parse("secret://elg-test-never-set")
            .unwrap_or_else(|| panic!("valid reference"));
        let err = resolver.resolve(&missing).err();
        assert_eq!(err.map(|err| err.error_type), Some("secret_unavailable".to_string()));
    }

    #[test]
    fn screening_rejects_inline_secrets_and_reserved_keys() {
        assert!(screen_params(&json!({"destination": "/tmp/out"})).is_empty());
        assert!(screen_params(&json!({"token": "secret://publish"})).is_empty());

        let errors = screen_params(&json!({
            "risk_class": "read_only",
            "auth": {"api_key": "plain-text"},
        }));
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("risk_class"));
        assert!(errors[1].contains("auth.api_key"));

        assert_eq!(screen_params(&json!([1, 2])).len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn reserved_keys_never_pass_screening(
            index in 0usize..RESERVED_PARAM_KEYS.len(),
            extra in "[a-z]{1,8}",
        ) {
            let key = RESERVED_PARAM_KEYS[index];
            let params = json!({ key: true, "x_extra": extra });
            let errors = screen_params(&params);
            prop_assert!(errors.iter().any(|message| message.contains(key)));
        }
    }
}
