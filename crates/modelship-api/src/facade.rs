//! Serving facade: validate, resolve, infer

use modelship_core::{
    FeatureRow, FeatureSchema, ModelRef, ModelshipError, ModelshipResult, Prediction,
};
use modelship_store::PredictorCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Predictions for a batch, in input order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictOutput {
    pub preds: Vec<Prediction>,
    pub n: usize,
}

impl PredictOutput {
    fn empty() -> Self {
        Self {
            preds: Vec::new(),
            n: 0,
        }
    }
}

/// Health report for the configured model reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub model_ref: String,
    pub model_loaded: bool,
}

/// Entry point for prediction requests
pub struct ServingFacade {
    cache: Arc<PredictorCache>,
    schemas: HashMap<String, FeatureSchema>,
    default_ref: ModelRef,
}

impl ServingFacade {
    /// Create a facade serving `default_ref` unless a request names another model
    pub fn new(
        cache: Arc<PredictorCache>,
        schemas: HashMap<String, FeatureSchema>,
        default_ref: ModelRef,
    ) -> Self {
        Self {
            cache,
            schemas,
            default_ref,
        }
    }

    pub fn default_ref(&self) -> &ModelRef {
        &self.default_ref
    }

    /// Run a batch of rows through the predictor `reference` designates.
    ///
    /// Rows are checked against the configured schema before the cache is
    /// consulted, so a bad request never triggers an artifact load.
    pub async fn predict(
        &self,
        reference: &ModelRef,
        rows: &[FeatureRow],
    ) -> ModelshipResult<PredictOutput> {
        if rows.is_empty() {
            return Ok(PredictOutput::empty());
        }

        let schema = self.schemas.get(&reference.model).ok_or_else(|| {
            ModelshipError::Validation(format!(
                "model '{}' is not configured for serving",
                reference.model
            ))
        })?;
        let matrix = schema.validate_rows(rows)?;

        let predictor = self.cache.resolve(reference).await?;

        let preds = tokio::task::spawn_blocking(move || predictor.predict(&matrix))
            .await
            .map_err(|e| ModelshipError::Inference(e.to_string()))?
            .map_err(|e| match e {
                ModelshipError::Inference(msg) => ModelshipError::Inference(msg),
                other => ModelshipError::Inference(other.to_string()),
            })?;

        if preds.len() != rows.len() {
            return Err(ModelshipError::Inference(format!(
                "predictor returned {} outputs for {} rows",
                preds.len(),
                rows.len()
            )));
        }

        debug!(model_ref = %reference, rows = rows.len(), "Prediction served");
        let n = preds.len();
        Ok(PredictOutput { preds, n })
    }

    /// Predict against the configured default reference
    pub async fn predict_default(&self, rows: &[FeatureRow]) -> ModelshipResult<PredictOutput> {
        let reference = self.default_ref.clone();
        self.predict(&reference, rows).await
    }

    /// Report whether the default reference has a loaded predictor; never loads
    pub async fn health(&self) -> HealthStatus {
        let model_loaded = self.cache.is_loaded(&self.default_ref).await;
        HealthStatus {
            status: "ok".to_string(),
            model_ref: self.default_ref.to_string(),
            model_loaded,
        }
    }

    /// Load the default predictor ahead of the first request
    pub async fn warm_up(&self) -> ModelshipResult<()> {
        self.cache.resolve(&self.default_ref).await?;
        info!(model_ref = %self.default_ref, "Default predictor loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelship_core::{
        CacheConfig, LinearModelLoader, LoadError, NewVersion, Predictor, PredictorLoader,
    };
    use modelship_registry::Registry;
    use modelship_store::MemoryArtifactStore;
    use serde_json::json;

    const ARTIFACT: &str = "runs/run-1/model.json";

    fn rows(values: serde_json::Value) -> Vec<FeatureRow> {
        serde_json::from_value(values).unwrap()
    }

    async fn facade_with(
        loader: Arc<dyn PredictorLoader>,
    ) -> (ServingFacade, Arc<Registry>, Arc<MemoryArtifactStore>) {
        let registry = Arc::new(Registry::in_memory());
        let store = Arc::new(MemoryArtifactStore::new());
        store.put(
            ARTIFACT,
            serde_json::to_vec(&json!({
                "kind": "logistic",
                "features": ["f1", "f2"],
                "weights": [1.0, 1.0],
                "intercept": 0.0,
                "labels": ["neg", "pos"]
            }))
            .unwrap(),
        );
        registry
            .register_version("m", NewVersion::new("run-1", ARTIFACT))
            .await
            .unwrap();
        registry.set_alias("m", "prod", 1).await.unwrap();

        let mut schemas = HashMap::new();
        schemas.insert("m".to_string(), FeatureSchema::new(["f1", "f2"]).unwrap());
        let cache = PredictorCache::connect(
            registry.clone(),
            store.clone(),
            loader,
            schemas.clone(),
            &CacheConfig::default(),
        )
        .await;
        let facade = ServingFacade::new(cache, schemas, ModelRef::alias("m", "prod"));
        (facade, registry, store)
    }

    async fn facade() -> (ServingFacade, Arc<Registry>, Arc<MemoryArtifactStore>) {
        facade_with(Arc::new(LinearModelLoader)).await
    }

    #[tokio::test]
    async fn test_predict_preserves_order() {
        let (facade, _, _) = facade().await;
        let input = rows(json!([
            {"f1": 2.0, "f2": 1.0},
            {"f1": -3.0, "f2": 0.5},
            {"f1": 0.0, "f2": 4}
        ]));

        let out = facade.predict_default(&input).await.unwrap();
        assert_eq!(out.n, 3);
        assert_eq!(
            out.preds,
            vec![
                Prediction::Label("pos".into()),
                Prediction::Label("neg".into()),
                Prediction::Label("pos".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_input_skips_cache() {
        let (facade, _, store) = facade().await;
        let out = facade.predict_default(&[]).await.unwrap();
        assert_eq!(out, PredictOutput { preds: vec![], n: 0 });
        assert_eq!(store.fetch_count(), 0);
        assert!(!facade.health().await.model_loaded);
    }

    #[tokio::test]
    async fn test_invalid_rows_never_load() {
        let (facade, _, store) = facade().await;

        for bad in [
            json!([{"f1": 1.0}]),
            json!([{"f1": 1.0, "f2": "high"}]),
            json!([{"f1": 1.0, "f2": 2.0, "f3": 0.0}]),
        ] {
            let err = facade.predict_default(&rows(bad)).await.unwrap_err();
            assert!(matches!(err, ModelshipError::Validation(_)));
        }
        assert_eq!(store.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_model() {
        let (facade, _, _) = facade().await;
        let err = facade
            .predict(&ModelRef::alias("other", "prod"), &rows(json!([{"a": 1}])))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelshipError::Validation(_)));
    }

    #[tokio::test]
    async fn test_cache_errors_forwarded() {
        let (facade, _, _) = facade().await;
        let err = facade
            .predict(&ModelRef::alias("m", "staging"), &rows(json!([{"f1": 1, "f2": 2}])))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelshipError::AliasNotFound { .. }));
    }

    #[tokio::test]
    async fn test_health_reports_loaded_after_predict() {
        let (facade, _, _) = facade().await;
        let health = facade.health().await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.model_ref, "models:/m@prod");
        assert!(!health.model_loaded);

        facade.warm_up().await.unwrap();
        assert!(facade.health().await.model_loaded);
    }

    struct FailingPredictor {
        schema: FeatureSchema,
    }

    impl Predictor for FailingPredictor {
        fn schema(&self) -> &FeatureSchema {
            &self.schema
        }

        fn predict(&self, _rows: &[Vec<f64>]) -> ModelshipResult<Vec<Prediction>> {
            Err(ModelshipError::Internal("matrix is singular".to_string()))
        }
    }

    struct FailingLoader;

    impl PredictorLoader for FailingLoader {
        fn load(&self, _bytes: &[u8]) -> Result<Arc<dyn Predictor>, LoadError> {
            let schema =
                FeatureSchema::new(["f1", "f2"]).map_err(|e| LoadError::Corrupt(e.to_string()))?;
            Ok(Arc::new(FailingPredictor { schema }))
        }
    }

    #[tokio::test]
    async fn test_predictor_failure_is_inference_error() {
        let (facade, _, _) = facade_with(Arc::new(FailingLoader)).await;
        let err = facade
            .predict_default(&rows(json!([{"f1": 1, "f2": 2}])))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelshipError::Inference(_)));
    }
}
