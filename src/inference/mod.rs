//! Inference module for serving predictions
//!
//! [`InferenceService`] is constructed once at process start and shared by
//! reference with every request handler. The model state behind it is built
//! lazily, exactly once, even under concurrent first use.

pub mod service;

pub use service::{
    BatchPolicy, Health, ImageUpload, InferenceService, PredictionResult, ServiceConfig,
    ServiceState,
};
