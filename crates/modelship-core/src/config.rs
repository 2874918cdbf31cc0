//! Configuration types for modelship

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::{FeatureSchema, ModelRef, ModelshipError, ModelshipResult};

/// Main server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Registry persistence configuration
    pub registry: RegistryConfig,
    /// Predictor cache configuration
    pub cache: CacheConfig,
    /// Artifact store configuration
    pub artifacts: ArtifactConfig,
    /// Serving configuration
    pub serving: ServingConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> ModelshipResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ModelshipError::Config(format!("Failed to read config file: {}", e)))?;
        let config: ServerConfig = toml::from_str(&content)
            .map_err(|e| ModelshipError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> ModelshipResult<()> {
        if self.cache.capacity == 0 {
            return Err(ModelshipError::Config(
                "cache.capacity must be at least 1".to_string(),
            ));
        }
        if self.cache.load_timeout_secs == 0 {
            return Err(ModelshipError::Config(
                "cache.load_timeout_secs must be at least 1".to_string(),
            ));
        }
        self.serving.default_ref()?;
        Ok(())
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
    /// Enable CORS
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8000,
            cors_enabled: false,
        }
    }
}

/// Registry persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Append-only event log; `None` keeps the registry in memory
    pub log_path: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            log_path: Some(PathBuf::from("/var/lib/modelship/registry.jsonl")),
        }
    }
}

/// Predictor cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Nominal number of loaded predictors kept in memory
    pub capacity: usize,
    /// How long a caller waits on an artifact load before giving up
    pub load_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            load_timeout_secs: 30,
        }
    }
}

/// Artifact store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Base directory relative artifact locations resolve against
    pub root: PathBuf,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/modelship/artifacts"),
        }
    }
}

/// Per-model serving settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelServingConfig {
    /// Ordered feature names the model expects
    pub features: FeatureSchema,
}

/// Serving configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    /// Reference served by `/predict` and reported by `/health`
    pub model_ref: String,
    /// Feature schemas keyed by model name
    pub models: BTreeMap<String, ModelServingConfig>,
}

impl Default for ServingConfig {
    fn default() -> Self {
        let mut models = BTreeMap::new();
        if let Ok(features) = FeatureSchema::new(["f1", "f2", "f3", "f4", "f5"]) {
            models.insert("ml-demo-model".to_string(), ModelServingConfig { features });
        }
        Self {
            model_ref: "models:/ml-demo-model@prod".to_string(),
            models,
        }
    }
}

impl ServingConfig {
    /// Parse the configured default reference
    pub fn default_ref(&self) -> ModelshipResult<ModelRef> {
        self.model_ref
            .parse()
            .map_err(|e| ModelshipError::Config(format!("serving.model_ref: {}", e)))
    }

    /// Feature schemas keyed by model name
    pub fn schemas(&self) -> BTreeMap<String, FeatureSchema> {
        self.models
            .iter()
            .map(|(name, m)| (name.clone(), m.features.clone()))
            .collect()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
