//! Registry composing the version store and alias map

use async_trait::async_trait;
use modelship_core::{
    ModelRef, ModelshipError, ModelshipResult, NewVersion, RefTarget, RegisterOutcome, Registered,
    RunRecord, RunSelector, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aliases::{self, AliasChange, AliasMap, AliasSnapshot, AliasState};
use crate::journal::{EventLog, EventRecord};
use crate::versions::{self, VersionState, VersionStore};

/// Notified after an alias repoint commits.
///
/// Called outside every registry lock. Snapshots for one model carry
/// increasing revisions; observers should ignore older ones arriving late.
#[async_trait]
pub trait AliasObserver: Send + Sync {
    async fn aliases_changed(&self, model: &str, snapshot: &AliasSnapshot);
}

/// Register a version and point an alias at it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoteRequest {
    #[serde(flatten)]
    pub version: NewVersion,
    pub alias: String,
}

/// Result of a promotion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Promotion {
    pub version: Version,
    pub outcome: RegisterOutcome,
    pub alias: String,
    /// Version the alias designated before the promotion
    pub previous: Option<u64>,
}

/// Versioned model registry with aliases
pub struct Registry {
    versions: VersionStore,
    aliases: AliasMap,
    journal: Arc<EventLog>,
    observers: RwLock<Vec<Weak<dyn AliasObserver>>>,
}

impl Registry {
    /// Registry without durable storage
    pub fn in_memory() -> Self {
        let journal = Arc::new(EventLog::in_memory());
        Self {
            versions: VersionStore::new(journal.clone()),
            aliases: AliasMap::new(journal.clone()),
            journal,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Open a journal-backed registry, replaying existing events
    pub async fn open(path: &Path) -> ModelshipResult<Self> {
        let journal = Arc::new(EventLog::open(path).await?);
        let records = journal.records().await;

        let mut version_state = VersionState::new();
        let mut alias_state = AliasState::new();
        for record in &records {
            versions::replay(&mut version_state, &record.event)?;
            aliases::replay(&mut alias_state, &version_state, &record.event)?;
        }

        info!(
            path = %path.display(),
            models = version_state.len(),
            events = records.len(),
            "Registry restored from journal"
        );

        Ok(Self {
            versions: VersionStore::restore(journal.clone(), version_state),
            aliases: AliasMap::restore(journal.clone(), alias_state),
            journal,
            observers: RwLock::new(Vec::new()),
        })
    }

    /// Flush the journal to stable storage
    pub async fn flush(&self) -> ModelshipResult<()> {
        self.journal.sync().await?;
        debug!("Registry journal flushed");
        Ok(())
    }

    /// Register for alias change notifications
    pub fn subscribe(&self, observer: Weak<dyn AliasObserver>) {
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        observers.retain(|o| o.strong_count() > 0);
        observers.push(observer);
    }

    /// Deliver a committed snapshot from a task of its own.
    ///
    /// Runs without awaiting so delivery starts even if the caller is
    /// dropped right after the commit.
    fn notify(&self, model: &str, snapshot: AliasSnapshot) -> JoinHandle<()> {
        let live: Vec<Arc<dyn AliasObserver>> = {
            let observers = self.observers.read().unwrap_or_else(|e| e.into_inner());
            observers.iter().filter_map(|o| o.upgrade()).collect()
        };
        let model = model.to_string();
        tokio::spawn(async move {
            for observer in live {
                observer.aliases_changed(&model, &snapshot).await;
            }
        })
    }

    /// Register a new version (idempotent on the source run reference)
    pub async fn register_version(
        &self,
        model: &str,
        request: NewVersion,
    ) -> ModelshipResult<Registered> {
        self.versions.create_version(model, request).await
    }

    pub async fn get_version(&self, model: &str, number: u64) -> ModelshipResult<Version> {
        self.versions.get_version(model, number).await
    }

    pub async fn list_versions(&self, model: &str) -> ModelshipResult<Vec<Version>> {
        self.versions.list_versions(model).await
    }

    pub async fn latest_version(&self, model: &str) -> ModelshipResult<Version> {
        self.versions.latest_version(model).await
    }

    pub async fn set_version_tag(
        &self,
        model: &str,
        number: u64,
        key: &str,
        value: &str,
    ) -> ModelshipResult<Version> {
        self.versions.set_version_tag(model, number, key, value).await
    }

    pub async fn list_models(&self) -> Vec<String> {
        self.versions.list_models().await
    }

    /// Point `alias` at `version`; returns the previously bound version
    ///
    /// Observers have seen the change when this returns. If the caller stops
    /// polling after the commit, delivery still completes in the background.
    pub async fn set_alias(
        &self,
        model: &str,
        alias: &str,
        version: u64,
    ) -> ModelshipResult<Option<u64>> {
        let AliasChange {
            previous,
            changed,
            snapshot,
        } = self
            .aliases
            .set_alias(&self.versions, model, alias, version)
            .await?;
        if changed {
            if let Err(e) = self.notify(model, snapshot).await {
                warn!(model = model, alias = alias, error = %e, "Alias observer failed");
            }
        }
        Ok(previous)
    }

    pub async fn get_alias(&self, model: &str, alias: &str) -> ModelshipResult<u64> {
        self.aliases.get_alias(model, alias).await
    }

    /// Alias to version mapping, consistent at one instant
    pub async fn list_aliases(&self, model: &str) -> BTreeMap<String, u64> {
        self.aliases.snapshot(model).await.aliases
    }

    pub async fn alias_snapshot(&self, model: &str) -> AliasSnapshot {
        self.aliases.snapshot(model).await
    }

    /// Aliases that currently designate `version`, sorted
    pub async fn aliases_for_version(&self, model: &str, version: u64) -> Vec<String> {
        self.aliases
            .snapshot(model)
            .await
            .aliases
            .into_iter()
            .filter(|(_, v)| *v == version)
            .map(|(alias, _)| alias)
            .collect()
    }

    /// Resolve a reference to a concrete, existing version number
    pub async fn resolve(&self, reference: &ModelRef) -> ModelshipResult<u64> {
        match &reference.target {
            RefTarget::Alias(alias) => self.aliases.get_alias(&reference.model, alias).await,
            RefTarget::Version(number) => {
                if self.versions.exists(&reference.model, *number).await {
                    Ok(*number)
                } else {
                    Err(ModelshipError::VersionNotFound {
                        model: reference.model.clone(),
                        version: *number,
                    })
                }
            }
        }
    }

    /// Create (or find) a version, apply its tags, then point the alias at it.
    ///
    /// Every step is idempotent so the whole call is safe to retry. A failed
    /// alias step leaves the version registered.
    pub async fn promote(
        &self,
        model: &str,
        request: PromoteRequest,
    ) -> ModelshipResult<Promotion> {
        let PromoteRequest { version, alias } = request;
        let tags = version.tags.clone();

        let Registered {
            version: registered,
            outcome,
        } = self.register_version(model, version).await?;
        let number = registered.number;

        for (key, value) in &tags {
            self.set_version_tag(model, number, key, value).await?;
        }

        let previous = match self.set_alias(model, &alias, number).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!(
                    model = model,
                    version = number,
                    alias = %alias,
                    error = %e,
                    "Promotion left version registered without alias"
                );
                return Err(e);
            }
        };

        info!(
            model = model,
            version = number,
            alias = %alias,
            outcome = %outcome,
            "Promoted model version"
        );

        Ok(Promotion {
            version: self.get_version(model, number).await?,
            outcome,
            alias,
            previous,
        })
    }

    /// Pick a run with `selector` and promote its artifact
    pub async fn promote_from_runs(
        &self,
        model: &str,
        runs: &[RunRecord],
        selector: RunSelector,
        alias: &str,
        extra_tags: BTreeMap<String, String>,
    ) -> ModelshipResult<Promotion> {
        let run = selector(runs).ok_or_else(|| {
            ModelshipError::Validation(format!("no eligible run among {} candidates", runs.len()))
        })?;

        let mut tags = run.tags.clone();
        tags.extend(extra_tags);

        let request = PromoteRequest {
            version: NewVersion {
                source_run_ref: run.run_id.clone(),
                artifact_location: run.artifact_location.clone(),
                tags,
                description: format!("Promoted from run {}", run.run_id),
            },
            alias: alias.to_string(),
        };
        self.promote(model, request).await
    }

    /// Journal records for a model, oldest first
    pub async fn history(&self, model: &str) -> Vec<EventRecord> {
        self.journal.history(model).await
    }

    /// Alias snapshots for every model with aliases
    pub async fn all_alias_snapshots(&self) -> HashMap<String, AliasSnapshot> {
        let mut snapshots = HashMap::new();
        for model in self.list_models().await {
            let snapshot = self.aliases.snapshot(&model).await;
            if !snapshot.aliases.is_empty() {
                snapshots.insert(model, snapshot);
            }
        }
        snapshots
    }
}
