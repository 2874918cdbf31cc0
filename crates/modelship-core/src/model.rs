//! Version, Alias, and model reference type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{ModelshipError, ModelshipResult};

/// Scheme prefix accepted on model references
pub const MODEL_REF_SCHEME: &str = "models:/";

/// Immutable, numbered record of one trained artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    /// Registered model name
    pub model: String,
    /// Version number, monotonic per model and starting at 1
    pub number: u64,
    /// Training run that produced the artifact
    pub source_run_ref: String,
    /// Where the artifact store keeps the serialized model
    pub artifact_location: String,
    /// Free-form metadata, last write wins per key
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
}

/// Request to register a new version
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewVersion {
    /// Training run that produced the artifact
    pub source_run_ref: String,
    /// Artifact location understood by the artifact store
    pub artifact_location: String,
    /// Initial tags
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Optional description
    #[serde(default)]
    pub description: String,
}

impl NewVersion {
    /// Create a registration request without tags
    pub fn new(source_run_ref: impl Into<String>, artifact_location: impl Into<String>) -> Self {
        Self {
            source_run_ref: source_run_ref.into(),
            artifact_location: artifact_location.into(),
            tags: BTreeMap::new(),
            description: String::new(),
        }
    }

    /// Attach a tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Reject requests missing required fields
    pub fn validate(&self) -> ModelshipResult<()> {
        if self.source_run_ref.trim().is_empty() {
            return Err(ModelshipError::Validation(
                "source_run_ref must not be empty".to_string(),
            ));
        }
        if self.artifact_location.trim().is_empty() {
            return Err(ModelshipError::Validation(
                "artifact_location must not be empty".to_string(),
            ));
        }
        if self.tags.keys().any(|k| k.trim().is_empty()) {
            return Err(ModelshipError::Validation("tag key must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Whether a registration created a new record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterOutcome {
    /// A new version number was allocated
    Created,
    /// The run was already registered; the existing version is returned
    AlreadyExists,
}

impl fmt::Display for RegisterOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterOutcome::Created => write!(f, "created"),
            RegisterOutcome::AlreadyExists => write!(f, "already exists"),
        }
    }
}

/// Result of a registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registered {
    pub version: Version,
    pub outcome: RegisterOutcome,
}

/// Mutable named pointer to a version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    pub name: String,
    pub model: String,
    pub version: u64,
}

/// What a model reference points at
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefTarget {
    /// Explicit version number
    Version(u64),
    /// Alias name, resolved through the registry
    Alias(String),
}

/// Symbolic reference to a model version, e.g. `models:/churn@prod`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRef {
    pub model: String,
    pub target: RefTarget,
}

impl ModelRef {
    /// Reference a model through an alias
    pub fn alias(model: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            target: RefTarget::Alias(alias.into()),
        }
    }

    /// Reference an explicit version
    pub fn version(model: impl Into<String>, version: u64) -> Self {
        Self {
            model: model.into(),
            target: RefTarget::Version(version),
        }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            RefTarget::Alias(alias) => write!(f, "{}{}@{}", MODEL_REF_SCHEME, self.model, alias),
            RefTarget::Version(v) => write!(f, "{}{}/{}", MODEL_REF_SCHEME, self.model, v),
        }
    }
}

impl FromStr for ModelRef {
    type Err = ModelshipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.trim();
        let body = body.strip_prefix(MODEL_REF_SCHEME).unwrap_or(body);
        let invalid = |why: &str| {
            ModelshipError::Validation(format!("invalid model reference '{}': {}", s, why))
        };

        let (model, target) = if let Some((model, alias)) = body.split_once('@') {
            if alias.is_empty() || alias.contains('/') {
                return Err(invalid("alias must be a non-empty name"));
            }
            (model, RefTarget::Alias(alias.to_string()))
        } else if let Some((model, version)) = body.rsplit_once('/') {
            let number: u64 = version
                .parse()
                .map_err(|_| invalid("version must be a positive integer"))?;
            if number == 0 {
                return Err(invalid("versions start at 1"));
            }
            (model, RefTarget::Version(number))
        } else {
            return Err(invalid("expected <name>@<alias> or <name>/<version>"));
        };

        if model.is_empty() {
            return Err(invalid("model name must not be empty"));
        }

        Ok(ModelRef {
            model: model.to_string(),
            target,
        })
    }
}

impl Serialize for ModelRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ModelRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
