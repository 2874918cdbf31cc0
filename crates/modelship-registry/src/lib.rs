//! modelship-registry: Versioned model registry
//!
//! This crate provides the registry of trained model artifacts:
//! - Immutable, monotonically numbered versions per model
//! - Mutable aliases pointing at versions
//! - Idempotent promotion
//! - An append-only journal replayed on startup

pub mod aliases;
pub mod journal;
pub mod registry;
pub mod versions;

pub use aliases::{AliasChange, AliasMap, AliasSnapshot};
pub use journal::{EventLog, EventRecord, RegistryEvent};
pub use registry::{AliasObserver, PromoteRequest, Promotion, Registry};
pub use versions::VersionStore;
