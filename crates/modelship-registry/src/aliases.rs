//! Mutable alias bindings per model

use modelship_core::{ModelshipError, ModelshipResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::journal::{EventLog, RegistryEvent};
use crate::versions::{VersionState, VersionStore};

/// Consistent view of one model's aliases at a single instant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasSnapshot {
    /// Bumped on every committed repoint; orders snapshots of the same model
    pub revision: u64,
    pub aliases: BTreeMap<String, u64>,
}

impl AliasSnapshot {
    /// Versions referenced by at least one alias
    pub fn referenced_versions(&self) -> Vec<u64> {
        let mut seen: Vec<u64> = self.aliases.values().copied().collect();
        seen.sort_unstable();
        seen.dedup();
        seen
    }
}

/// Outcome of a `set_alias`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasChange {
    /// Version the alias pointed at before, if any
    pub previous: Option<u64>,
    /// Whether the binding actually moved
    pub changed: bool,
    /// Aliases of the model right after the write
    pub snapshot: AliasSnapshot,
}

pub(crate) type AliasState = HashMap<String, AliasSnapshot>;

pub(crate) fn replay(
    state: &mut AliasState,
    versions: &VersionState,
    event: &RegistryEvent,
) -> ModelshipResult<()> {
    if let RegistryEvent::AliasSet {
        model,
        alias,
        version,
    } = event
    {
        let known = versions.get(model).map_or(false, |m| m.contains(*version));
        if !known {
            return Err(ModelshipError::Storage(format!(
                "journal binds {}@{} to unknown version {}",
                model, alias, version
            )));
        }
        let snapshot = state.entry(model.clone()).or_default();
        snapshot.aliases.insert(alias.clone(), *version);
        snapshot.revision += 1;
    }
    Ok(())
}

/// Per-model mapping from alias name to version number
pub struct AliasMap {
    models: RwLock<HashMap<String, Arc<RwLock<AliasSnapshot>>>>,
    journal: Arc<EventLog>,
}

impl AliasMap {
    /// Create an empty alias map
    pub fn new(journal: Arc<EventLog>) -> Self {
        Self::restore(journal, AliasState::new())
    }

    pub(crate) fn restore(journal: Arc<EventLog>, state: AliasState) -> Self {
        let models = state
            .into_iter()
            .map(|(name, snapshot)| (name, Arc::new(RwLock::new(snapshot))))
            .collect();
        Self {
            models: RwLock::new(models),
            journal,
        }
    }

    async fn slot(&self, model: &str) -> Option<Arc<RwLock<AliasSnapshot>>> {
        self.models.read().await.get(model).cloned()
    }

    async fn slot_or_create(&self, model: &str) -> Arc<RwLock<AliasSnapshot>> {
        if let Some(slot) = self.slot(model).await {
            return slot;
        }
        self.models
            .write()
            .await
            .entry(model.to_string())
            .or_default()
            .clone()
    }

    /// Bind `alias` to `version`, overwriting any previous binding.
    ///
    /// The version must exist. Readers see either the old or the new binding.
    pub async fn set_alias(
        &self,
        versions: &VersionStore,
        model: &str,
        alias: &str,
        version: u64,
    ) -> ModelshipResult<AliasChange> {
        validate_alias_name(alias)?;
        // versions are never removed, so the check stays valid after we take the lock
        versions.get_version(model, version).await?;

        let slot = self.slot_or_create(model).await;
        let mut snapshot = slot.write().await;
        let previous = snapshot.aliases.get(alias).copied();

        if previous == Some(version) {
            return Ok(AliasChange {
                previous,
                changed: false,
                snapshot: snapshot.clone(),
            });
        }

        self.journal
            .append(RegistryEvent::AliasSet {
                model: model.to_string(),
                alias: alias.to_string(),
                version,
            })
            .await?;
        snapshot.aliases.insert(alias.to_string(), version);
        snapshot.revision += 1;

        info!(
            model = model,
            alias = alias,
            version = version,
            previous = ?previous,
            "Alias repointed"
        );

        Ok(AliasChange {
            previous,
            changed: true,
            snapshot: snapshot.clone(),
        })
    }

    /// Version an alias currently designates
    pub async fn get_alias(&self, model: &str, alias: &str) -> ModelshipResult<u64> {
        let not_found = || ModelshipError::AliasNotFound {
            model: model.to_string(),
            alias: alias.to_string(),
        };
        let slot = self.slot(model).await.ok_or_else(not_found)?;
        let snapshot = slot.read().await;
        snapshot.aliases.get(alias).copied().ok_or_else(not_found)
    }

    /// All aliases of a model at one instant
    pub async fn snapshot(&self, model: &str) -> AliasSnapshot {
        match self.slot(model).await {
            Some(slot) => slot.read().await.clone(),
            None => AliasSnapshot::default(),
        }
    }
}

fn validate_alias_name(alias: &str) -> ModelshipResult<()> {
    if alias.trim().is_empty() {
        return Err(ModelshipError::Validation("alias must not be empty".to_string()));
    }
    if alias.contains(['@', '/']) {
        return Err(ModelshipError::Validation(format!(
            "alias '{}' must not contain '@' or '/'",
            alias
        )));
    }
    Ok(())
}
