//! Identifiers and hierarchical keys of definition entities.
//!
//! Every key embeds its parent's key: `ProjectId → BranchKey → SourceKey → SinkKey`.
//! The string form joins the segments with `/`, e.g. `123/456/my-source/my-sink`.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Maximum length of a source or sink slug.
pub const MAX_SLUG_LENGTH: usize = 48;

static SLUG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*$").expect("slug pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("invalid project ID \"{0}\"")]
    InvalidProjectId(String),
    #[error("invalid branch ID \"{0}\"")]
    InvalidBranchId(String),
    #[error("invalid {kind} ID \"{value}\": expected lowercase letters, digits and dashes, at most {MAX_SLUG_LENGTH} characters")]
    InvalidSlug { kind: &'static str, value: String },
    #[error("invalid {kind} key \"{value}\"")]
    InvalidKey { kind: &'static str, value: String },
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $error:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
        #[serde(try_from = "u64", into = "u64")]
        #[schema(value_type = u64)]
        pub struct $name(u64);

        impl $name {
            pub fn new(value: u64) -> Result<Self, KeyError> {
                if value == 0 {
                    return Err(KeyError::$error(value.to_string()));
                }
                Ok(Self(value))
            }

            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl TryFrom<u64> for $name {
            type Error = KeyError;

            fn try_from(value: u64) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> u64 {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<u64>()
                    .ok()
                    .and_then(|value| Self::new(value).ok())
                    .ok_or_else(|| KeyError::$error(s.to_string()))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

macro_rules! slug_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
        #[serde(try_from = "String", into = "String")]
        #[schema(value_type = String)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, KeyError> {
                let value = value.into();
                if value.len() > MAX_SLUG_LENGTH || !SLUG_PATTERN.is_match(&value) {
                    return Err(KeyError::InvalidSlug { kind: $kind, value });
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = KeyError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a project, a positive integer.
    ProjectId,
    InvalidProjectId
);
numeric_id!(
    /// Identifier of a branch within its project, a positive integer.
    BranchId,
    InvalidBranchId
);
slug_id!(
    /// Identifier of a source within its branch.
    SourceId,
    "source"
);
slug_id!(
    /// Identifier of a sink within its source.
    SinkId,
    "sink"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BranchKey {
    pub project_id: ProjectId,
    pub branch_id: BranchId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceKey {
    #[serde(flatten)]
    pub branch_key: BranchKey,
    pub source_id: SourceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SinkKey {
    #[serde(flatten)]
    pub source_key: SourceKey,
    pub sink_id: SinkId,
}

impl BranchKey {
    pub fn new(project_id: ProjectId, branch_id: BranchId) -> Self {
        Self {
            project_id,
            branch_id,
        }
    }

    pub fn source(&self, source_id: SourceId) -> SourceKey {
        SourceKey {
            branch_key: *self,
            source_id,
        }
    }
}

impl SourceKey {
    pub fn project_id(&self) -> ProjectId {
        self.branch_key.project_id
    }

    pub fn branch_id(&self) -> BranchId {
        self.branch_key.branch_id
    }

    pub fn sink(&self, sink_id: SinkId) -> SinkKey {
        SinkKey {
            source_key: self.clone(),
            sink_id,
        }
    }
}

impl SinkKey {
    pub fn branch_key(&self) -> &BranchKey {
        &self.source_key.branch_key
    }
}

impl fmt::Display for BranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.branch_id)
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch_key, self.source_id)
    }
}

impl fmt::Display for SinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_key, self.sink_id)
    }
}

fn split_key<'a, const N: usize>(kind: &'static str, value: &'a str) -> Result<[&'a str; N], KeyError> {
    let invalid = || KeyError::InvalidKey {
        kind,
        value: value.to_string(),
    };
    let parts: Vec<&str> = value.split('/').collect();
    parts.try_into().map_err(|_| invalid())
}

impl FromStr for BranchKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [project, branch] = split_key("branch", s)?;
        Ok(Self::new(project.parse()?, branch.parse()?))
    }
}

impl FromStr for SourceKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [project, branch, source] = split_key("source", s)?;
        Ok(BranchKey::new(project.parse()?, branch.parse()?).source(source.parse()?))
    }
}

impl FromStr for SinkKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [project, branch, source, sink] = split_key("sink", s)?;
        Ok(BranchKey::new(project.parse()?, branch.parse()?)
            .source(source.parse()?)
            .sink(sink.parse()?))
    }
}
