//! modelship-api: Serving facade and REST API for modelship
//!
//! This crate provides:
//! - Prediction serving against a model reference
//! - Health reporting
//! - Registry and cache endpoints

pub mod facade;
pub mod rest;

pub use facade::{HealthStatus, PredictOutput, ServingFacade};
pub use rest::{create_router, AppState};
