use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::GovernanceError;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parses a ULID string.
            ///
            /// # Errors
            /// Returns [`GovernanceError::Validation`] when `raw` is not a ULID.
            pub fn parse(raw: &str) -> Result<Self, GovernanceError> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
                    GovernanceError::Validation(format!("invalid {} `{raw}`: {err}", $label))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = GovernanceError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Self::parse(raw)
            }
        }
    };
}

ulid_id!(
    /// Lifecycle identity of a governed artifact.
    ArtifactId,
    "artifact_id"
);
ulid_id!(EventId, "event_id");
ulid_id!(
    /// Shared by every phase event of one execution attempt.
    ExecutionId,
    "execution_id"
);

/// Content address of a blob: `sha256:<lowercase hex>`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId(String);

impl ContentId {
    pub const PREFIX: &'static str = "sha256:";

    #[must_use]
    pub(crate) fn from_hex(hex_digest: &str) -> Self {
        Self(format!("{}{hex_digest}", Self::PREFIX))
    }

    /// Parses and validates a content id.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Validation`] when the prefix is missing or
    /// the digest is not 64 lowercase hex characters.
    pub fn parse(raw: &str) -> Result<Self, GovernanceError> {
        let Some(digest) = raw.strip_prefix(Self::PREFIX) else {
            return Err(GovernanceError::Validation(format!(
                "content_id MUST start with `{}`: {raw}",
                Self::PREFIX
            )));
        };
        if digest.len() != 64
            || !digest
                .chars()
                .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch))
        {
            return Err(GovernanceError::Validation(format!(
                "content_id digest MUST be 64 lowercase hex characters: {raw}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex digest without the algorithm prefix.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.0[Self::PREFIX.len()..]
    }
}

impl Display for ContentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentId {
    type Error = GovernanceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentId> for String {
    fn from(value: ContentId) -> Self {
        value.0
    }
}
