//! modelship-store: Artifact storage and predictor caching
//!
//! This crate provides:
//! - Artifact stores (filesystem and in-memory)
//! - A bounded predictor cache with single-flight loading
//! - Alias pinning and LRU eviction

pub mod artifact;
pub mod cache;

pub use artifact::{ArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use cache::{CacheEntryInfo, CacheKey, CacheStats, PredictorCache};
