#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]

//! # LayerFlow
//!
//! HTTP service that decomposes a flat image into an ordered set of RGBA layers, either
//! through the hosted fal.ai `qwen-image-layered` model or through an exported pipeline
//! running locally on ONNX Runtime with CUDA.
//!
//! ## Features
//!
//! - **Two Backends**: fal.ai queue API (needs `FAL_KEY`) or a local CUDA GPU
//! - **Typed Errors**: every failure maps to a fixed HTTP status and a `{"detail"}` body
//! - **Model Management**: download and caching of the local pipeline from `HuggingFace`
//! - **Service Binary**: `layerflow-api` (enable with `cli` feature)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use layerflow::{server, ServiceConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ServiceConfig::from_env()?;
//! server::serve(config).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Backends can also be driven directly:
//!
//! ```rust,no_run
//! use layerflow::backends::{DecompositionBackend, DecompositionRequest, FalBackend};
//! use layerflow::config::RemoteConfig;
//!
//! # async fn example(png: Vec<u8>) -> anyhow::Result<()> {
//! let backend = FalBackend::new(RemoteConfig {
//!     api_key: Some("fal-key".to_string()),
//!     ..RemoteConfig::default()
//! })?;
//! let layers = backend
//!     .decompose(DecompositionRequest::new(png, "image/png", 4))
//!     .await?;
//! println!("{} layers", layers.len());
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `onnx` (default): local backend on ONNX Runtime with CUDA
//! - `cli` (default): service binary, progress bars and tracing setup
//! - `tracing-json`: JSON log output

pub mod backends;
pub mod cache;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod download;
pub mod error;
pub mod server;
pub mod services;
#[cfg(feature = "cli")]
pub mod tracing_config;

pub use backends::{
    DecompositionBackend, DecompositionRequest, FalBackend, LocalBackend, DEFAULT_NUM_LAYERS,
};
pub use cache::{format_size, CachedModelInfo, ModelCache, ModelVariant};
pub use config::{select_backend, BackendKind, LocalConfig, RemoteConfig, ServiceConfig};
pub use download::{validate_model_url, ModelDownloader};
pub use error::{LayerFlowError, Result};
pub use server::{router, serve, AppState};
pub use services::ImageCodec;

#[cfg(feature = "cli")]
pub use tracing_config::{init_service_tracing, TracingConfig, TracingFormat};
