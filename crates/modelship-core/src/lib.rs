//! modelship-core: Core types and traits for modelship
//!
//! This crate provides the fundamental types used throughout the modelship system:
//! - Versions, aliases and model references
//! - Feature schemas and strict row validation
//! - The predictor abstraction and the built-in linear model format
//! - Training run records and the promotion selection policy
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod model;
pub mod predictor;
pub mod run;
pub mod schema;

pub use config::*;
pub use error::*;
pub use model::*;
pub use predictor::*;
pub use run::*;
pub use schema::*;
