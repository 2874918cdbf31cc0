//! Predictor cache
//!
//! Resolves model references to loaded predictors. Concurrent misses on the
//! same `(model, version)` share one load; entries referenced by an alias are
//! pinned and never evicted.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use modelship_core::{
    CacheConfig, FeatureSchema, LoadError, ModelRef, ModelshipError, ModelshipResult, Predictor,
    PredictorLoader,
};
use modelship_registry::{AliasObserver, AliasSnapshot, Registry};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::artifact::ArtifactStore;

type LoadResult = Result<Arc<dyn Predictor>, LoadError>;
type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

/// Identity of a cached predictor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    pub model: String,
    pub version: u64,
}

impl CacheKey {
    pub fn new(model: impl Into<String>, version: u64) -> Self {
        Self {
            model: model.into(),
            version,
        }
    }
}

/// A loaded predictor owned by the cache
struct CacheEntry {
    predictor: Arc<dyn Predictor>,
    /// Logical access clock; larger is more recent
    last_access: u64,
    hits: u64,
    pinned: bool,
}

/// Read-only view of a cache entry
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    pub model: String,
    pub version: u64,
    pub pinned: bool,
    pub last_access: u64,
    pub hits: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Number of loaded predictors
    pub entries: usize,
    /// Entries protected by an alias
    pub pinned: usize,
    /// Nominal capacity
    pub capacity: usize,
    /// Loads currently running
    pub in_flight: usize,
    /// Artifact loads started
    pub loads: u64,
    /// Loads that failed
    pub failures: u64,
    /// Requests served from a loaded entry
    pub hits: u64,
    /// Entries removed under capacity pressure
    pub evictions: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    in_flight: HashMap<CacheKey, SharedLoad>,
    /// Latest alias snapshot applied per model
    pins: HashMap<String, AliasSnapshot>,
    clock: u64,
    loads: u64,
    failures: u64,
    hits: u64,
    evictions: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn is_pinned(&self, key: &CacheKey) -> bool {
        self.pins
            .get(&key.model)
            .map_or(false, |s| s.aliases.values().any(|v| *v == key.version))
    }

    fn touch(&mut self, key: &CacheKey) -> Option<Arc<dyn Predictor>> {
        let now = self.tick();
        let entry = self.entries.get_mut(key)?;
        entry.last_access = now;
        entry.hits += 1;
        let predictor = entry.predictor.clone();
        self.hits += 1;
        Some(predictor)
    }

    /// Evict least-recently-used unpinned entries until within capacity.
    ///
    /// Stops early when only pinned entries (and `keep`) remain.
    fn evict_over_capacity(&mut self, capacity: usize, keep: Option<&CacheKey>) {
        while self.entries.len() > capacity {
            let victim = self
                .entries
                .iter()
                .filter(|(k, e)| !e.pinned && keep != Some(*k))
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());

            match victim {
                Some(key) => {
                    self.entries.remove(&key);
                    self.evictions += 1;
                    info!(model = %key.model, version = key.version, "Evicted predictor (LRU)");
                }
                None => {
                    debug!(
                        entries = self.entries.len(),
                        capacity = capacity,
                        "Cache over capacity with only pinned entries"
                    );
                    break;
                }
            }
        }
    }
}

struct CacheInner {
    registry: Arc<Registry>,
    store: Arc<dyn ArtifactStore>,
    loader: Arc<dyn PredictorLoader>,
    schemas: HashMap<String, FeatureSchema>,
    capacity: usize,
    load_timeout: Duration,
    state: Mutex<CacheState>,
}

impl CacheInner {
    async fn load(&self, key: &CacheKey) -> LoadResult {
        let version = self
            .registry
            .get_version(&key.model, key.version)
            .await
            .map_err(|e| LoadError::Aborted(e.to_string()))?;

        info!(
            model = %key.model,
            version = key.version,
            location = %version.artifact_location,
            store = self.store.name(),
            "Loading predictor"
        );

        let bytes = self.store.fetch(&version.artifact_location).await?;
        let loader = self.loader.clone();
        let predictor = tokio::task::spawn_blocking(move || loader.load(&bytes))
            .await
            .map_err(|e| LoadError::Aborted(e.to_string()))??;

        if let Some(expected) = self.schemas.get(&key.model) {
            if predictor.schema() != expected {
                return Err(LoadError::IncompatibleSchema {
                    expected: expected.fields().to_vec(),
                    found: predictor.schema().fields().to_vec(),
                });
            }
        }

        Ok(predictor)
    }

    async fn finish_load(&self, key: &CacheKey, result: &LoadResult) {
        let mut state = self.state.lock().await;
        state.in_flight.remove(key);

        match result {
            Ok(predictor) => {
                let entry = CacheEntry {
                    predictor: predictor.clone(),
                    last_access: state.tick(),
                    hits: 0,
                    pinned: state.is_pinned(key),
                };
                info!(
                    model = %key.model,
                    version = key.version,
                    pinned = entry.pinned,
                    "Predictor cached"
                );
                state.entries.insert(key.clone(), entry);
                state.evict_over_capacity(self.capacity, Some(key));
            }
            Err(e) => {
                state.failures += 1;
                warn!(
                    model = %key.model,
                    version = key.version,
                    error = %e,
                    "Predictor load failed"
                );
            }
        }
    }

    async fn apply_aliases(&self, model: &str, snapshot: &AliasSnapshot) {
        let mut state = self.state.lock().await;
        if let Some(current) = state.pins.get(model) {
            if current.revision >= snapshot.revision {
                debug!(
                    model = model,
                    revision = snapshot.revision,
                    applied = current.revision,
                    "Ignoring stale alias snapshot"
                );
                return;
            }
        }
        state.pins.insert(model.to_string(), snapshot.clone());

        let keys: Vec<CacheKey> = state
            .entries
            .keys()
            .filter(|k| k.model == model)
            .cloned()
            .collect();
        for key in keys {
            let pinned = state.is_pinned(&key);
            if let Some(entry) = state.entries.get_mut(&key) {
                if entry.pinned != pinned {
                    debug!(model = model, version = key.version, pinned = pinned, "Pin changed");
                }
                entry.pinned = pinned;
            }
        }

        state.evict_over_capacity(self.capacity, None);
    }
}

/// Bounded cache of loaded predictors with single-flight loading
pub struct PredictorCache {
    inner: Arc<CacheInner>,
}

impl PredictorCache {
    /// Build a cache and subscribe it to alias changes in `registry`.
    ///
    /// `schemas` holds the configured feature schema per model; a loaded
    /// predictor that disagrees is rejected.
    pub async fn connect(
        registry: Arc<Registry>,
        store: Arc<dyn ArtifactStore>,
        loader: Arc<dyn PredictorLoader>,
        schemas: HashMap<String, FeatureSchema>,
        config: &CacheConfig,
    ) -> Arc<Self> {
        let cache = Arc::new(Self {
            inner: Arc::new(CacheInner {
                registry: registry.clone(),
                store,
                loader,
                schemas,
                capacity: config.capacity.max(1),
                load_timeout: Duration::from_secs(config.load_timeout_secs),
                state: Mutex::new(CacheState::default()),
            }),
        });

        // subscribe before seeding so no repoint falls between the two
        let observer: Arc<dyn AliasObserver> = cache.clone();
        registry.subscribe(Arc::downgrade(&observer));
        for (model, snapshot) in registry.all_alias_snapshots().await {
            cache.inner.apply_aliases(&model, &snapshot).await;
        }

        info!(
            capacity = cache.inner.capacity,
            load_timeout_secs = config.load_timeout_secs,
            "Predictor cache initialized"
        );
        cache
    }

    /// Resolve a reference to a loaded predictor, loading it at most once
    pub async fn resolve(&self, reference: &ModelRef) -> ModelshipResult<Arc<dyn Predictor>> {
        let version = self.inner.registry.resolve(reference).await?;
        let key = CacheKey::new(reference.model.clone(), version);

        let load = {
            let mut state = self.inner.state.lock().await;
            if let Some(predictor) = state.touch(&key) {
                return Ok(predictor);
            }
            match state.in_flight.get(&key) {
                Some(load) => {
                    debug!(model = %key.model, version = key.version, "Joining in-flight load");
                    load.clone()
                }
                None => self.start_load(&mut state, key.clone()),
            }
        };

        match tokio::time::timeout(self.inner.load_timeout, load).await {
            Ok(result) => result.map_err(ModelshipError::from),
            Err(_) => {
                warn!(
                    model = %key.model,
                    version = key.version,
                    "Gave up waiting for predictor load"
                );
                Err(LoadError::Timeout(self.inner.load_timeout.as_secs()).into())
            }
        }
    }

    /// Spawn the loader task and register it as in flight.
    ///
    /// The task owns the load, so a waiter that gives up does not cancel it.
    fn start_load(&self, state: &mut CacheState, key: CacheKey) -> SharedLoad {
        let inner = self.inner.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = match AssertUnwindSafe(inner.load(&task_key)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(LoadError::Aborted("loader panicked".to_string())),
            };
            inner.finish_load(&task_key, &result).await;
            result
        });

        let load = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(LoadError::Aborted(e.to_string())))
        }
        .boxed()
        .shared();

        state.loads += 1;
        state.in_flight.insert(key, load.clone());
        load
    }

    /// Loaded predictor `reference` currently resolves to, without loading
    /// or touching recency
    pub async fn peek(&self, reference: &ModelRef) -> Option<Arc<dyn Predictor>> {
        let version = self.inner.registry.resolve(reference).await.ok()?;
        let key = CacheKey::new(reference.model.clone(), version);
        let state = self.inner.state.lock().await;
        state.entries.get(&key).map(|e| e.predictor.clone())
    }

    /// Whether `reference` currently resolves to a loaded predictor
    pub async fn is_loaded(&self, reference: &ModelRef) -> bool {
        self.peek(reference).await.is_some()
    }

    /// Drop an unpinned entry; returns whether one was removed
    pub async fn invalidate(&self, model: &str, version: u64) -> ModelshipResult<bool> {
        let key = CacheKey::new(model, version);
        let mut state = self.inner.state.lock().await;
        match state.entries.get(&key) {
            Some(entry) if entry.pinned => Err(ModelshipError::Validation(format!(
                "{} v{} is pinned by an alias",
                model, version
            ))),
            Some(_) => {
                state.entries.remove(&key);
                info!(model = model, version = version, "Invalidated predictor");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Snapshot of cached entries, most recently used first
    pub async fn entries(&self) -> Vec<CacheEntryInfo> {
        let state = self.inner.state.lock().await;
        let mut entries: Vec<CacheEntryInfo> = state
            .entries
            .iter()
            .map(|(key, e)| CacheEntryInfo {
                model: key.model.clone(),
                version: key.version,
                pinned: e.pinned,
                last_access: e.last_access,
                hits: e.hits,
            })
            .collect();
        entries.sort_by(|a, b| b.last_access.cmp(&a.last_access));
        entries
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock().await;
        CacheStats {
            entries: state.entries.len(),
            pinned: state.entries.values().filter(|e| e.pinned).count(),
            capacity: self.inner.capacity,
            in_flight: state.in_flight.len(),
            loads: state.loads,
            failures: state.failures,
            hits: state.hits,
            evictions: state.evictions,
        }
    }
}

#[async_trait]
impl AliasObserver for PredictorCache {
    async fn aliases_changed(&self, model: &str, snapshot: &AliasSnapshot) {
        self.inner.apply_aliases(model, snapshot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryArtifactStore;
    use modelship_core::{LinearModelLoader, NewVersion};
    use serde_json::json;

    fn artifact(features: &[&str], intercept: f64) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "kind": "linear",
            "features": features,
            "weights": vec![1.0; features.len()],
            "intercept": intercept
        }))
        .unwrap()
    }

    struct Fixture {
        registry: Arc<Registry>,
        store: Arc<MemoryArtifactStore>,
        cache: Arc<PredictorCache>,
    }

    async fn fixture(capacity: usize, versions: u64, latency: Option<Duration>) -> Fixture {
        fixture_on(Arc::new(Registry::in_memory()), capacity, versions, latency).await
    }

    async fn fixture_on(
        registry: Arc<Registry>,
        capacity: usize,
        versions: u64,
        latency: Option<Duration>,
    ) -> Fixture {
        let store = Arc::new(match latency {
            Some(l) => MemoryArtifactStore::with_latency(l),
            None => MemoryArtifactStore::new(),
        });
        for i in 1..=versions {
            let location = format!("runs/run-{}/model.json", i);
            store.put(location.clone(), artifact(&["f1", "f2"], i as f64));
            registry
                .register_version("m", NewVersion::new(format!("run-{}", i), location))
                .await
                .unwrap();
        }
        let mut schemas = HashMap::new();
        schemas.insert("m".to_string(), FeatureSchema::new(["f1", "f2"]).unwrap());
        let config = CacheConfig {
            capacity,
            load_timeout_secs: 5,
        };
        let cache = PredictorCache::connect(
            registry.clone(),
            store.clone(),
            Arc::new(LinearModelLoader),
            schemas,
            &config,
        )
        .await;
        Fixture {
            registry,
            store,
            cache,
        }
    }

    fn intercept_of(predictor: &Arc<dyn Predictor>) -> f64 {
        match predictor.predict(&[vec![0.0, 0.0]]).unwrap()[0] {
            modelship_core::Prediction::Number(n) => n,
            ref other => panic!("unexpected prediction {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_load() {
        let f = fixture(4, 1, Some(Duration::from_millis(100))).await;
        let reference = ModelRef::version("m", 1);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = f.cache.clone();
            let reference = reference.clone();
            handles.push(tokio::spawn(async move { cache.resolve(&reference).await.unwrap() }));
        }
        let mut predictors = Vec::new();
        for h in handles {
            predictors.push(h.await.unwrap());
        }

        assert_eq!(f.store.fetch_count(), 1);
        assert!(predictors.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        let stats = f.cache.stats().await;
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let f = fixture(4, 1, None).await;
        f.store.put("runs/run-1/model.json", b"garbage".to_vec());

        let err = f.cache.resolve(&ModelRef::version("m", 1)).await.err().unwrap();
        assert!(matches!(err, ModelshipError::Load(LoadError::Corrupt(_))));
        assert_eq!(f.cache.stats().await.entries, 0);

        f.store.put("runs/run-1/model.json", artifact(&["f1", "f2"], 1.0));
        assert!(f.cache.resolve(&ModelRef::version("m", 1)).await.is_ok());
        assert_eq!(f.store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_incompatible_schema_rejected() {
        let f = fixture(4, 1, None).await;
        f.store.put("runs/run-1/model.json", artifact(&["f1", "x"], 1.0));

        let err = f.cache.resolve(&ModelRef::version("m", 1)).await.err().unwrap();
        assert!(matches!(
            err,
            ModelshipError::Load(LoadError::IncompatibleSchema { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_references() {
        let f = fixture(4, 1, None).await;
        assert!(matches!(
            f.cache.resolve(&ModelRef::alias("m", "prod")).await.err().unwrap(),
            ModelshipError::AliasNotFound { .. }
        ));
        assert!(matches!(
            f.cache.resolve(&ModelRef::version("m", 3)).await.err().unwrap(),
            ModelshipError::VersionNotFound { .. }
        ));
        assert_eq!(f.store.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_skips_pinned() {
        let f = fixture(2, 3, None).await;
        f.registry.set_alias("m", "prod", 1).await.unwrap();

        f.cache.resolve(&ModelRef::alias("m", "prod")).await.unwrap();
        f.cache.resolve(&ModelRef::version("m", 2)).await.unwrap();
        f.cache.resolve(&ModelRef::version("m", 3)).await.unwrap();

        // v1 is oldest but pinned, so v2 goes
        let cached: Vec<u64> = f.cache.entries().await.iter().map(|e| e.version).collect();
        assert_eq!(cached, vec![3, 1]);
        assert_eq!(f.cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_all_pinned_exceeds_capacity() {
        let f = fixture(1, 2, None).await;
        f.registry.set_alias("m", "prod", 1).await.unwrap();
        f.registry.set_alias("m", "staging", 2).await.unwrap();

        f.cache.resolve(&ModelRef::alias("m", "prod")).await.unwrap();
        f.cache.resolve(&ModelRef::alias("m", "staging")).await.unwrap();

        let stats = f.cache.stats().await;
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.pinned, 2);
    }

    #[tokio::test]
    async fn test_alias_move_swaps_predictor_and_unpins() {
        let f = fixture(1, 2, None).await;
        let prod = ModelRef::alias("m", "prod");

        f.registry.set_alias("m", "prod", 1).await.unwrap();
        let v1 = f.cache.resolve(&prod).await.unwrap();
        assert_eq!(intercept_of(&v1), 1.0);
        assert!(f.cache.is_loaded(&prod).await);

        f.registry.set_alias("m", "prod", 2).await.unwrap();
        assert!(!f.cache.is_loaded(&prod).await);
        let v2 = f.cache.resolve(&prod).await.unwrap();
        assert_eq!(intercept_of(&v2), 2.0);

        // v1 lost its pin and was the only eviction candidate
        let entries = f.cache.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].version, 2);
        assert!(entries[0].pinned);
        // the handle taken before the move stays usable
        assert_eq!(intercept_of(&v1), 1.0);
    }

    #[tokio::test]
    async fn test_unpinned_entry_stays_valid_under_capacity() {
        let f = fixture(4, 2, None).await;
        let prod = ModelRef::alias("m", "prod");
        f.registry.set_alias("m", "prod", 1).await.unwrap();
        f.cache.resolve(&prod).await.unwrap();
        f.registry.set_alias("m", "prod", 2).await.unwrap();
        f.cache.resolve(&prod).await.unwrap();

        assert!(f.cache.is_loaded(&ModelRef::version("m", 1)).await);
        let entries = f.cache.entries().await;
        assert!(entries.iter().any(|e| e.version == 1 && !e.pinned));
        assert!(f.cache.invalidate("m", 1).await.unwrap());
        assert!(f.cache.invalidate("m", 2).await.is_err());
        assert!(!f.cache.invalidate("m", 1).await.unwrap());
    }

    /// Observer that takes a while before returning
    struct SlowObserver;

    #[async_trait]
    impl AliasObserver for SlowObserver {
        async fn aliases_changed(&self, _model: &str, _snapshot: &AliasSnapshot) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_repoint_pins_even_if_writer_gives_up() {
        let registry = Arc::new(Registry::in_memory());
        // notified ahead of the cache
        let slow: Arc<dyn AliasObserver> = Arc::new(SlowObserver);
        registry.subscribe(Arc::downgrade(&slow));
        let f = fixture_on(registry, 1, 3, None).await;
        let prod = ModelRef::alias("m", "prod");

        f.registry.set_alias("m", "prod", 1).await.unwrap();
        f.cache.resolve(&prod).await.unwrap();

        let write = f.registry.set_alias("m", "prod", 2);
        assert!(tokio::time::timeout(Duration::from_millis(10), write).await.is_err());
        tokio::time::sleep(Duration::from_millis(250)).await;

        f.cache.resolve(&prod).await.unwrap();
        f.cache.resolve(&ModelRef::version("m", 3)).await.unwrap();

        let entries: Vec<(u64, bool)> = f
            .cache
            .entries()
            .await
            .iter()
            .map(|e| (e.version, e.pinned))
            .collect();
        assert!(entries.contains(&(2, true)));
        assert!(!entries.iter().any(|(v, _)| *v == 1));
        assert!(f.cache.is_loaded(&prod).await);
    }

    #[tokio::test]
    async fn test_stale_snapshot_ignored() {
        let f = fixture(4, 2, None).await;
        f.registry.set_alias("m", "prod", 1).await.unwrap();
        f.registry.set_alias("m", "prod", 2).await.unwrap();
        f.cache.resolve(&ModelRef::version("m", 1)).await.unwrap();

        let stale = AliasSnapshot {
            revision: 1,
            aliases: [("prod".to_string(), 1)].into_iter().collect(),
        };
        f.cache.aliases_changed("m", &stale).await;

        let entries = f.cache.entries().await;
        assert!(!entries[0].pinned);
    }

    #[tokio::test]
    async fn test_pins_seeded_from_existing_aliases() {
        let registry = Arc::new(Registry::in_memory());
        let store = Arc::new(MemoryArtifactStore::new());
        store.put("loc", artifact(&["a"], 0.0));
        registry
            .promote(
                "m",
                modelship_registry::PromoteRequest {
                    version: NewVersion::new("run-1", "loc"),
                    alias: "prod".to_string(),
                },
            )
            .await
            .unwrap();

        let cache = PredictorCache::connect(
            registry,
            store,
            Arc::new(LinearModelLoader),
            HashMap::new(),
            &CacheConfig::default(),
        )
        .await;
        cache.resolve(&ModelRef::alias("m", "prod")).await.unwrap();
        assert_eq!(cache.stats().await.pinned, 1);
    }

    #[tokio::test]
    async fn test_timeout_does_not_cancel_load() {
        let registry = Arc::new(Registry::in_memory());
        let store = Arc::new(MemoryArtifactStore::with_latency(Duration::from_millis(1500)));
        store.put("loc", artifact(&["a"], 0.0));
        registry
            .register_version("m", NewVersion::new("run-1", "loc"))
            .await
            .unwrap();
        let config = CacheConfig {
            capacity: 2,
            load_timeout_secs: 1,
        };
        let cache = PredictorCache::connect(
            registry,
            store.clone(),
            Arc::new(LinearModelLoader),
            HashMap::new(),
            &config,
        )
        .await;

        let reference = ModelRef::version("m", 1);
        let err = cache.resolve(&reference).await.err().unwrap();
        assert!(matches!(err, ModelshipError::Load(LoadError::Timeout(1))));

        let mut loaded = false;
        for _ in 0..50 {
            if cache.is_loaded(&reference).await {
                loaded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(loaded);
        assert_eq!(store.fetch_count(), 1);
    }
}
