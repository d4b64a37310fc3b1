//! Decomposition backends
//!
//! - Remote backend: hosted fal.ai queue API (requires `FAL_KEY`)
//! - Local backend: exported pipeline on ONNX Runtime (requires a CUDA GPU)
//!
//! Both implement [`DecompositionBackend`], so the HTTP layer only sees layer references
//! and typed errors.

pub mod local;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod remote;

use crate::config::BackendKind;
use crate::error::Result;
use async_trait::async_trait;

pub use self::local::{
    GenerationParams, LayerPipeline, LocalBackend, PipelineLoader, UnavailablePipelineLoader,
};
#[cfg(feature = "onnx")]
pub use self::onnx::{OnnxLayerPipeline, OnnxPipelineLoader};
pub use self::remote::FalBackend;

/// Number of layers requested when the caller does not say
pub const DEFAULT_NUM_LAYERS: u32 = 5;

/// A single decomposition job
#[derive(Debug, Clone)]
pub struct DecompositionRequest {
    /// Raw uploaded image bytes
    pub image: Vec<u8>,
    /// Media type used when the image is forwarded as a data URI
    pub media_type: String,
    /// Requested number of layers (positive)
    pub num_layers: u32,
}

impl DecompositionRequest {
    #[must_use]
    pub fn new(image: Vec<u8>, media_type: impl Into<String>, num_layers: u32) -> Self {
        Self {
            image,
            media_type: media_type.into(),
            num_layers,
        }
    }
}

/// Trait for decomposition backends
#[async_trait]
pub trait DecompositionBackend: Send + Sync {
    /// Which backend this is, for logging and health reporting
    fn kind(&self) -> BackendKind;

    /// Decompose an image into ordered layer references
    ///
    /// Remote backends return URLs, local backends return PNG data URIs. An empty vector
    /// means the backend ran but produced nothing; callers treat that as a failure.
    ///
    /// # Errors
    /// - `Auth` for rejected or missing credentials
    /// - `MissingDependency` / `Capability` when the local runtime cannot run
    /// - `Backend` / `Network` for execution failures
    async fn decompose(&self, request: DecompositionRequest) -> Result<Vec<String>>;
}
