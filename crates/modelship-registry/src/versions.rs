//! Append-only store of immutable model versions

use chrono::Utc;
use modelship_core::{
    ModelshipError, ModelshipResult, NewVersion, RegisterOutcome, Registered, Version,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::journal::{EventLog, RegistryEvent};

/// All versions of one model
#[derive(Debug, Clone, Default)]
pub(crate) struct ModelVersions {
    /// Dense, ordered by number; `versions[i].number == i + 1`
    versions: Vec<Version>,
    /// Source run reference to version number
    by_run: HashMap<String, u64>,
}

impl ModelVersions {
    fn next_number(&self) -> u64 {
        self.versions.len() as u64 + 1
    }

    fn get(&self, number: u64) -> Option<&Version> {
        number
            .checked_sub(1)
            .and_then(|i| self.versions.get(i as usize))
    }

    fn get_mut(&mut self, number: u64) -> Option<&mut Version> {
        number
            .checked_sub(1)
            .and_then(move |i| self.versions.get_mut(i as usize))
    }

    fn push(&mut self, version: Version) -> ModelshipResult<()> {
        if version.number != self.next_number() {
            return Err(ModelshipError::ConcurrencyConflict(format!(
                "{} v{} does not follow v{}",
                version.model,
                version.number,
                self.versions.len()
            )));
        }
        self.by_run
            .insert(version.source_run_ref.clone(), version.number);
        self.versions.push(version);
        Ok(())
    }

    pub(crate) fn contains(&self, number: u64) -> bool {
        self.get(number).is_some()
    }
}

/// Replay state for a version store, keyed by model name
pub(crate) type VersionState = HashMap<String, ModelVersions>;

/// Apply a journaled event to replay state
pub(crate) fn replay(state: &mut VersionState, event: &RegistryEvent) -> ModelshipResult<()> {
    match event {
        RegistryEvent::VersionCreated { version } => state
            .entry(version.model.clone())
            .or_default()
            .push(version.clone())
            .map_err(|e| ModelshipError::Storage(format!("journal out of order: {}", e))),
        RegistryEvent::VersionTagged {
            model,
            version,
            key,
            value,
        } => {
            let target = state
                .get_mut(model)
                .and_then(|m| m.get_mut(*version))
                .ok_or_else(|| {
                    ModelshipError::Storage(format!(
                        "journal tags unknown version {} v{}",
                        model, version
                    ))
                })?;
            target.tags.insert(key.clone(), value.clone());
            Ok(())
        }
        RegistryEvent::AliasSet { .. } => Ok(()),
    }
}

/// Durable record of immutable versions per model name.
///
/// Mutations for one model are serialized by that model's write lock;
/// readers clone out of the read lock and never see a half-applied change.
pub struct VersionStore {
    models: RwLock<HashMap<String, Arc<RwLock<ModelVersions>>>>,
    journal: Arc<EventLog>,
}

impl VersionStore {
    /// Create an empty store
    pub fn new(journal: Arc<EventLog>) -> Self {
        Self::restore(journal, VersionState::new())
    }

    pub(crate) fn restore(journal: Arc<EventLog>, state: VersionState) -> Self {
        let models = state
            .into_iter()
            .map(|(name, versions)| (name, Arc::new(RwLock::new(versions))))
            .collect();
        Self {
            models: RwLock::new(models),
            journal,
        }
    }

    async fn slot(&self, model: &str) -> Option<Arc<RwLock<ModelVersions>>> {
        self.models.read().await.get(model).cloned()
    }

    async fn slot_or_create(&self, model: &str) -> Arc<RwLock<ModelVersions>> {
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

    /// Allocate the next version number for `model`.
    ///
    /// Idempotent on the source run reference: a run that is already
    /// registered returns its existing version with `AlreadyExists`.
    pub async fn create_version(
        &self,
        model: &str,
        request: NewVersion,
    ) -> ModelshipResult<Registered> {
        validate_model_name(model)?;
        request.validate()?;

        let slot = self.slot_or_create(model).await;
        let mut state = slot.write().await;

        if let Some(existing) = state
            .by_run
            .get(&request.source_run_ref)
            .and_then(|n| state.get(*n))
        {
            debug!(
                model = model,
                version = existing.number,
                run = %request.source_run_ref,
                "Run already registered"
            );
            return Ok(Registered {
                version: existing.clone(),
                outcome: RegisterOutcome::AlreadyExists,
            });
        }

        let version = Version {
            model: model.to_string(),
            number: state.next_number(),
            source_run_ref: request.source_run_ref,
            artifact_location: request.artifact_location,
            tags: request.tags,
            created_at: Utc::now(),
            description: request.description,
        };

        self.journal
            .append(RegistryEvent::VersionCreated {
                version: version.clone(),
            })
            .await?;
        state.push(version.clone())?;

        info!(
            model = model,
            version = version.number,
            run = %version.source_run_ref,
            location = %version.artifact_location,
            "Registered model version"
        );

        Ok(Registered {
            version,
            outcome: RegisterOutcome::Created,
        })
    }

    /// Fetch one version
    pub async fn get_version(&self, model: &str, number: u64) -> ModelshipResult<Version> {
        let slot = self
            .slot(model)
            .await
            .ok_or_else(|| ModelshipError::ModelNotFound(model.to_string()))?;
        let state = slot.read().await;
        state
            .get(number)
            .cloned()
            .ok_or_else(|| ModelshipError::VersionNotFound {
                model: model.to_string(),
                version: number,
            })
    }

    /// Whether a version exists, without cloning it
    pub async fn exists(&self, model: &str, number: u64) -> bool {
        match self.slot(model).await {
            Some(slot) => slot.read().await.contains(number),
            None => false,
        }
    }

    /// All versions of a model, ascending by number
    pub async fn list_versions(&self, model: &str) -> ModelshipResult<Vec<Version>> {
        let slot = self
            .slot(model)
            .await
            .ok_or_else(|| ModelshipError::ModelNotFound(model.to_string()))?;
        let state = slot.read().await;
        Ok(state.versions.clone())
    }

    /// Highest-numbered version of a model
    pub async fn latest_version(&self, model: &str) -> ModelshipResult<Version> {
        let slot = self
            .slot(model)
            .await
            .ok_or_else(|| ModelshipError::ModelNotFound(model.to_string()))?;
        let state = slot.read().await;
        state
            .versions
            .last()
            .cloned()
            .ok_or_else(|| ModelshipError::ModelNotFound(model.to_string()))
    }

    /// Merge one tag into a version; other keys are untouched
    pub async fn set_version_tag(
        &self,
        model: &str,
        number: u64,
        key: &str,
        value: &str,
    ) -> ModelshipResult<Version> {
        if key.trim().is_empty() {
            return Err(ModelshipError::Validation("tag key must not be empty".to_string()));
        }

        let slot = self
            .slot(model)
            .await
            .ok_or_else(|| ModelshipError::ModelNotFound(model.to_string()))?;
        let mut state = slot.write().await;
        let current = state.get(number).ok_or_else(|| ModelshipError::VersionNotFound {
            model: model.to_string(),
            version: number,
        })?;

        if current.tags.get(key).map(String::as_str) == Some(value) {
            return Ok(current.clone());
        }

        self.journal
            .append(RegistryEvent::VersionTagged {
                model: model.to_string(),
                version: number,
                key: key.to_string(),
                value: value.to_string(),
            })
            .await?;

        let version = state
            .get_mut(number)
            .ok_or_else(|| ModelshipError::Internal("version vanished under lock".to_string()))?;
        version.tags.insert(key.to_string(), value.to_string());

        debug!(model = model, version = number, key = key, "Tagged model version");
        Ok(version.clone())
    }

    /// Names of models with at least one version, sorted
    pub async fn list_models(&self) -> Vec<String> {
        let models = self.models.read().await;
        let mut names = Vec::with_capacity(models.len());
        for (name, slot) in models.iter() {
            if !slot.read().await.versions.is_empty() {
                names.push(name.clone());
            }
        }
        names.sort();
        names
    }
}

pub(crate) fn validate_model_name(model: &str) -> ModelshipResult<()> {
    if model.trim().is_empty() {
        return Err(ModelshipError::Validation("model name must not be empty".to_string()));
    }
    if model.contains('@') {
        return Err(ModelshipError::Validation(format!(
            "model name '{}' must not contain '@'",
            model
        )));
    }
    Ok(())
}
