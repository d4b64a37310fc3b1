//! Local GPU backend
//!
//! The pipeline is loaded once, on the first request that needs it, and shared by every
//! later request. A failed load is not remembered: the next request tries again.

use super::{DecompositionBackend, DecompositionRequest, DEFAULT_NUM_LAYERS};
use crate::config::{BackendKind, LocalConfig};
use crate::error::{LayerFlowError, Result};
use crate::services::ImageCodec;
use async_trait::async_trait;
use image::RgbaImage;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;

/// Generation settings handed to the pipeline for every request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub seed: u64,
    pub true_cfg_scale: f32,
    pub negative_prompt: String,
    pub num_inference_steps: u32,
    pub num_images_per_prompt: u32,
    pub layers: u32,
    /// Target edge length; the input is resized to roughly this many pixels squared
    pub resolution: u32,
    pub cfg_normalize: bool,
    pub use_en_prompt: bool,
}

impl GenerationParams {
    /// Fixed generation settings with the requested layer count
    #[must_use]
    pub fn for_layers(layers: u32) -> Self {
        Self {
            seed: 42,
            true_cfg_scale: 4.0,
            negative_prompt: " ".to_string(),
            num_inference_steps: 50,
            num_images_per_prompt: 1,
            layers,
            resolution: 640,
            cfg_normalize: true,
            use_en_prompt: true,
        }
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::for_layers(DEFAULT_NUM_LAYERS)
    }
}

/// A loaded layer decomposition pipeline
///
/// `generate` is blocking and may take minutes; callers run it off the async runtime.
/// Implementations serialize access to the underlying device themselves.
pub trait LayerPipeline: Send + Sync {
    /// Returns one entry per generated image, each holding the ordered layers
    ///
    /// # Errors
    /// - Inference failures
    fn generate(&self, image: &RgbaImage, params: &GenerationParams)
        -> Result<Vec<Vec<RgbaImage>>>;
}

/// Produces the pipeline on first use
#[async_trait]
pub trait PipelineLoader: Send + Sync {
    /// # Errors
    /// - `MissingDependency` when the runtime or model files are unavailable
    /// - `Capability` when no CUDA device can be used
    async fn load(&self) -> Result<Arc<dyn LayerPipeline>>;
}

/// Loader used when the crate is built without ONNX Runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailablePipelineLoader;

#[async_trait]
impl PipelineLoader for UnavailablePipelineLoader {
    async fn load(&self) -> Result<Arc<dyn LayerPipeline>> {
        Err(LayerFlowError::missing_dependency(
            "layerflow was built without the `onnx` feature",
        ))
    }
}

/// Decomposition on the local GPU
pub struct LocalBackend {
    loader: Box<dyn PipelineLoader>,
    pipeline: OnceCell<Arc<dyn LayerPipeline>>,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

impl LocalBackend {
    pub fn new<L: PipelineLoader + 'static>(loader: L) -> Self {
        Self {
            loader: Box::new(loader),
            pipeline: OnceCell::new(),
        }
    }

    /// Backend using the default loader for this build
    #[must_use]
    pub fn from_config(config: &LocalConfig) -> Self {
        #[cfg(feature = "onnx")]
        {
            Self::new(super::OnnxPipelineLoader::new(config.clone()))
        }
        #[cfg(not(feature = "onnx"))]
        {
            let _ = config;
            Self::new(UnavailablePipelineLoader)
        }
    }

    /// Whether the pipeline has been loaded
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.pipeline.initialized()
    }

    async fn pipeline(&self) -> Result<Arc<dyn LayerPipeline>> {
        self.pipeline
            .get_or_try_init(|| async {
                log::info!("Loading local layer pipeline");
                let start = Instant::now();
                let pipeline = self.loader.load().await?;
                log::info!(
                    "Local pipeline ready in {:.1}s",
                    start.elapsed().as_secs_f64()
                );
                Ok(pipeline)
            })
            .await
            .map(Arc::clone)
    }
}

#[async_trait]
impl DecompositionBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn decompose(&self, request: DecompositionRequest) -> Result<Vec<String>> {
        let pipeline = self.pipeline().await?;
        let params = GenerationParams::for_layers(request.num_layers);
        let bytes = request.image;

        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let input = image::load_from_memory(&bytes)?.to_rgba8();
            log::debug!(
                "Running local pipeline on {}x{} input, {} layer(s)",
                input.width(),
                input.height(),
                params.layers
            );

            let start = Instant::now();
            let batches = pipeline.generate(&input, &params)?;
            let layers = batches.into_iter().next().unwrap_or_default();
            log::info!(
                "Local pipeline produced {} layer(s) in {:.1}s",
                layers.len(),
                start.elapsed().as_secs_f64()
            );

            layers.iter().map(ImageCodec::png_data_uri).collect()
        })
        .await
        .map_err(|e| LayerFlowError::internal(format!("Local inference task failed: {e}")))?
    }
}

/// Pipeline input size for an image of `width` x `height`
///
/// Keeps the aspect ratio, targets an area of `resolution` squared and rounds both edges
/// to multiples of 32.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn target_dimensions(width: u32, height: u32, resolution: u32) -> (u32, u32) {
    let aspect = f64::from(width.max(1)) / f64::from(height.max(1));
    let area = f64::from(resolution) * f64::from(resolution);
    let target_width = (area * aspect).sqrt();
    let target_height = target_width / aspect;

    let round = |edge: f64| ((edge / 32.0).round() as u32).max(1) * 32;
    (round(target_width), round(target_height))
}
