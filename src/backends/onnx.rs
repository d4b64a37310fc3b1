//! ONNX Runtime pipeline
//!
//! Runs the exported layer decomposition graph on the CUDA execution provider. The graph
//! takes the resized RGBA image plus the generation settings as named inputs and returns
//! a `[batch, layers, 4, height, width]` tensor of RGBA values in `[0, 1]`.
//!
//! Inputs: `image` f32 `[1, 4, H, W]`; `layers`, `seed`, `num_inference_steps`,
//! `num_images_per_prompt`, `cfg_normalize`, `use_en_prompt` i64 `[1]`; `true_cfg_scale`
//! f32 `[1]`; `negative_prompt` string `[1]`. The diffusers release of the pipeline does
//! not ship such a graph, so the export has to be supplied through
//! [`LocalConfig::model_path`] or [`LocalConfig::model_url`].

use super::local::{target_dimensions, GenerationParams, LayerPipeline, PipelineLoader};
use crate::cache::{ModelCache, ModelVariant};
use crate::config::LocalConfig;
use crate::download::ModelDownloader;
use crate::error::{LayerFlowError, Result};
use async_trait::async_trait;
use image::{imageops::FilterType, Rgba, RgbaImage};
use ndarray::{Array1, Array4, ArrayViewD};
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider as OrtExecutionProvider};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::{Tensor, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// List ONNX Runtime execution providers relevant to the local backend
///
/// Returns `(name, available, description)` tuples.
#[must_use]
pub fn list_providers() -> Vec<(String, bool, String)> {
    log::debug!("Platform: {} / {}", std::env::consts::OS, std::env::consts::ARCH);

    vec![
        (
            "CPU".to_string(),
            true,
            "Always available; not used for decomposition".to_string(),
        ),
        (
            "CUDA".to_string(),
            cuda_available(),
            "NVIDIA GPU acceleration (required for local mode)".to_string(),
        ),
    ]
}

fn cuda_available() -> bool {
    let available =
        OrtExecutionProvider::is_available(&CUDAExecutionProvider::default()).unwrap_or(false);
    log::debug!("CUDA execution provider available: {available}");
    available
}

/// Loads the exported pipeline from the model cache
#[derive(Debug, Clone)]
pub struct OnnxPipelineLoader {
    config: LocalConfig,
}

impl OnnxPipelineLoader {
    #[must_use]
    pub fn new(config: LocalConfig) -> Self {
        Self { config }
    }

    // Creating a builder is what loads the runtime library.
    fn check_runtime() -> Result<()> {
        Session::builder().map_err(|e| {
            LayerFlowError::missing_dependency(format!("ONNX Runtime is unavailable: {e}"))
        })?;

        if !cuda_available() {
            return Err(LayerFlowError::capability(
                "CUDA execution provider is not available",
            ));
        }
        Ok(())
    }

    async fn resolve_model(&self) -> Result<(ModelVariant, PathBuf)> {
        if let Some(path) = &self.config.model_path {
            if !path.is_file() {
                return Err(LayerFlowError::missing_dependency(format!(
                    "exported pipeline {} does not exist",
                    path.display()
                )));
            }
            return Ok((ModelVariant::from_path(path), path.clone()));
        }

        let Some(model_url) = self.config.model_url.as_deref() else {
            return Err(LayerFlowError::missing_dependency(
                "no exported layer pipeline configured; set LAYERFLOW_LOCAL_MODEL_PATH to an \
                 ONNX export, or LAYERFLOW_LOCAL_MODEL_URL to a repository providing \
                 onnx/model_fp16.onnx or onnx/model.onnx",
            ));
        };

        let cache = ModelCache::open(self.config.cache_dir.as_deref())?;
        let model_id = ModelCache::url_to_model_id(model_url);

        if let Some(found) = cache.best_variant(&model_id) {
            return Ok(found);
        }

        if !self.config.auto_download {
            return Err(LayerFlowError::missing_dependency(format!(
                "model '{model_id}' is not cached in {}",
                cache.get_current_cache_dir().display()
            )));
        }

        log::info!("Model {model_id} not cached, downloading");
        let downloader = ModelDownloader::new(cache)?;
        downloader.download_model(model_url, false).await?;

        downloader.cache().best_variant(&model_id).ok_or_else(|| {
            LayerFlowError::missing_dependency(format!(
                "model '{model_id}' has no usable ONNX variant after download"
            ))
        })
    }
}

#[async_trait]
impl PipelineLoader for OnnxPipelineLoader {
    async fn load(&self) -> Result<Arc<dyn LayerPipeline>> {
        Self::check_runtime()?;
        let (variant, path) = self.resolve_model().await?;
        let intra_threads = self.config.intra_threads;

        let pipeline = tokio::task::spawn_blocking(move || {
            OnnxLayerPipeline::from_file(&path, variant, intra_threads)
        })
        .await
        .map_err(|e| LayerFlowError::internal(format!("Session creation task failed: {e}")))??;

        Ok(Arc::new(pipeline))
    }
}

/// Exported pipeline bound to a CUDA session
#[derive(Debug)]
pub struct OnnxLayerPipeline {
    session: Mutex<Session>,
    variant: ModelVariant,
}

impl OnnxLayerPipeline {
    /// Commit a CUDA session for the graph at `path`
    ///
    /// # Errors
    /// - Session configuration or graph loading failures
    pub fn from_file(path: &Path, variant: ModelVariant, intra_threads: usize) -> Result<Self> {
        let start = Instant::now();
        let intra_threads = if intra_threads > 0 {
            intra_threads
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(8)
        };

        let session = Session::builder()
            .map_err(|e| session_error("create session builder", &e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| session_error("set optimization level", &e))?
            .with_execution_providers([CUDAExecutionProvider::default().build()])
            .map_err(|e| session_error("set CUDA execution provider", &e))?
            .with_intra_threads(intra_threads)
            .map_err(|e| session_error("set intra threads", &e))?
            .commit_from_file(path)
            .map_err(|e| session_error("load graph", &e))?;

        log::info!(
            "Loaded {variant} pipeline from {} in {:.1}s ({intra_threads} intra-op threads)",
            path.display(),
            start.elapsed().as_secs_f64()
        );

        Ok(Self {
            session: Mutex::new(session),
            variant,
        })
    }

    #[must_use]
    pub fn variant(&self) -> ModelVariant {
        self.variant
    }
}

fn session_error(operation: &str, error: &ort::Error) -> LayerFlowError {
    LayerFlowError::missing_dependency(format!("Failed to {operation}: {error}"))
}

fn inference_error(operation: &str, error: &ort::Error) -> LayerFlowError {
    LayerFlowError::backend(format!("Failed to {operation}: {error}"))
}

/// RGBA image as a `[1, 4, H, W]` tensor in `[0, 1]`
fn image_to_tensor(image: &RgbaImage) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 4, height as usize, width as usize));

    for (x, y, pixel) in image.enumerate_pixels() {
        for (channel, value) in pixel.0.iter().enumerate() {
            tensor[[0, channel, y as usize, x as usize]] = f32::from(*value) / 255.0;
        }
    }
    tensor
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn tensor_to_layers(output: &ArrayViewD<'_, f32>) -> Result<Vec<Vec<RgbaImage>>> {
    let shape = output.shape();
    if shape.len() != 5 || shape[2] != 4 {
        return Err(LayerFlowError::backend(format!(
            "unexpected pipeline output shape {shape:?}, expected [B, L, 4, H, W]"
        )));
    }
    let (batches, layers, height, width) = (shape[0], shape[1], shape[3], shape[4]);
    let to_byte = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;

    let mut result = Vec::with_capacity(batches);
    for b in 0..batches {
        let mut batch = Vec::with_capacity(layers);
        for l in 0..layers {
            let layer = RgbaImage::from_fn(width as u32, height as u32, |x, y| {
                let (x, y) = (x as usize, y as usize);
                Rgba([
                    to_byte(output[[b, l, 0, y, x]]),
                    to_byte(output[[b, l, 1, y, x]]),
                    to_byte(output[[b, l, 2, y, x]]),
                    to_byte(output[[b, l, 3, y, x]]),
                ])
            });
            batch.push(layer);
        }
        result.push(batch);
    }
    Ok(result)
}

fn scalar_i64(value: i64) -> Result<Tensor<i64>> {
    Tensor::from_array(Array1::from_vec(vec![value]))
        .map_err(|e| inference_error("build scalar input", &e))
}

impl LayerPipeline for OnnxLayerPipeline {
    fn generate(
        &self,
        image: &RgbaImage,
        params: &GenerationParams,
    ) -> Result<Vec<Vec<RgbaImage>>> {
        let (width, height) = target_dimensions(image.width(), image.height(), params.resolution);
        let resized = image::imageops::resize(image, width, height, FilterType::Lanczos3);
        log::debug!(
            "Resized input {}x{} -> {width}x{height}",
            image.width(),
            image.height()
        );

        let image_input = Value::from_array(image_to_tensor(&resized))
            .map_err(|e| inference_error("convert input tensor", &e))?;
        let cfg_scale = Value::from_array(Array1::from_vec(vec![params.true_cfg_scale]))
            .map_err(|e| inference_error("build cfg scale input", &e))?;
        let negative_prompt = Array1::from_vec(vec![params.negative_prompt.clone()]);
        let negative_prompt = Tensor::from_string_array(&negative_prompt)
            .map_err(|e| inference_error("build negative prompt input", &e))?;

        let inputs = ort::inputs![
            "image" => image_input,
            "layers" => scalar_i64(i64::from(params.layers))?,
            "seed" => scalar_i64(i64::try_from(params.seed).unwrap_or(i64::MAX))?,
            "num_inference_steps" => scalar_i64(i64::from(params.num_inference_steps))?,
            "num_images_per_prompt" => scalar_i64(i64::from(params.num_images_per_prompt))?,
            "true_cfg_scale" => cfg_scale,
            "cfg_normalize" => scalar_i64(i64::from(params.cfg_normalize))?,
            "use_en_prompt" => scalar_i64(i64::from(params.use_en_prompt))?,
            "negative_prompt" => negative_prompt,
        ];

        let mut session = self
            .session
            .lock()
            .map_err(|_| LayerFlowError::internal("ONNX session lock poisoned"))?;

        let start = Instant::now();
        let outputs = session
            .run(inputs)
            .map_err(|e| inference_error("run pipeline", &e))?;
        log::debug!("Pipeline inference: {:.1}s", start.elapsed().as_secs_f64());

        let keys: Vec<_> = outputs.keys().collect();
        let first_key = keys
            .first()
            .ok_or_else(|| LayerFlowError::backend("pipeline produced no outputs"))?;
        let output = outputs
            .get(first_key)
            .ok_or_else(|| LayerFlowError::backend("first output tensor not found"))?
            .try_extract_array::<f32>()
            .map_err(|e| inference_error("extract output tensor", &e))?;

        tensor_to_layers(&output)
    }
}
