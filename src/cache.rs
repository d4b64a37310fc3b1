//! Model cache management for the local decomposition pipeline
//!
//! The exported pipeline lives in an XDG-compliant cache directory, one folder per
//! model repository, with ONNX variants under `onnx/`.

use crate::error::{LayerFlowError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Repository manifest every cached pipeline must carry
pub const MODEL_INDEX_FILE: &str = "model_index.json";

/// Numeric precision of an exported pipeline graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    /// Half precision, preferred on GPU
    Fp16,
    /// Full precision fallback
    Fp32,
}

impl ModelVariant {
    /// Path of the variant's graph relative to the model directory
    #[must_use]
    pub fn relative_path(self) -> &'static str {
        match self {
            Self::Fp16 => "onnx/model_fp16.onnx",
            Self::Fp32 => "onnx/model.onnx",
        }
    }

    /// Variant of a standalone graph file, judged by its name
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let is_fp16 = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.to_ascii_lowercase().contains("fp16"));
        if is_fp16 {
            Self::Fp16
        } else {
            Self::Fp32
        }
    }

    /// All variants in order of preference
    #[must_use]
    pub fn preference_order() -> [Self; 2] {
        [Self::Fp16, Self::Fp32]
    }
}

impl std::fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fp16 => write!(f, "fp16"),
            Self::Fp32 => write!(f, "fp32"),
        }
    }
}

/// Information about a cached model
#[derive(Debug, Clone)]
pub struct CachedModelInfo {
    /// Model identifier (derived from URL)
    pub model_id: String,
    /// Path to the cached model directory
    pub path: PathBuf,
    /// Available ONNX variants
    pub variants: Vec<ModelVariant>,
    /// Size of the model directory in bytes
    pub size_bytes: u64,
}

/// Model cache manager
#[derive(Debug, Clone)]
pub struct ModelCache {
    cache_dir: PathBuf,
}

impl ModelCache {
    /// Create a model cache in the default location
    ///
    /// - Linux/macOS: `~/.cache/layerflow/models/`
    /// - Windows: `%LOCALAPPDATA%/layerflow/models/`
    ///
    /// # Errors
    /// - Failed to determine or create the cache directory
    pub fn new() -> Result<Self> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| {
                LayerFlowError::invalid_config(
                    "Failed to determine cache directory. Set LAYERFLOW_CACHE_DIR.",
                )
            })?
            .join("layerflow");
        Self::with_custom_cache_dir(&cache_dir)
    }

    /// Create a model cache rooted at `cache_dir` (models go to `cache_dir/models`)
    ///
    /// # Errors
    /// - Failed to create the cache directory
    pub fn with_custom_cache_dir(cache_dir: &Path) -> Result<Self> {
        let models_dir = cache_dir.join("models");

        if !models_dir.exists() {
            fs::create_dir_all(&models_dir).map_err(|e| {
                LayerFlowError::file_io_error("create cache directory", &models_dir, &e)
            })?;
        }

        Ok(Self {
            cache_dir: models_dir,
        })
    }

    /// Open the cache described by an optional override
    ///
    /// # Errors
    /// - Failed to determine or create the cache directory
    pub fn open(cache_dir: Option<&Path>) -> Result<Self> {
        match cache_dir {
            Some(dir) => Self::with_custom_cache_dir(dir),
            None => Self::new(),
        }
    }

    /// Generate a model ID from a URL
    ///
    /// ```
    /// use layerflow::cache::ModelCache;
    ///
    /// let id = ModelCache::url_to_model_id("https://huggingface.co/Qwen/Qwen-Image-Layered");
    /// assert_eq!(id, "Qwen--Qwen-Image-Layered");
    /// ```
    #[must_use]
    pub fn url_to_model_id(url: &str) -> String {
        let prefix = "https://huggingface.co/";
        if let Some(repo) = url.strip_prefix(prefix) {
            repo.trim_end_matches('/').replace('/', "--")
        } else {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(url.as_bytes());
            let hash_string = format!("url-{:x}", hasher.finalize());
            hash_string.get(..16).unwrap_or(&hash_string).to_string()
        }
    }

    /// Path to a model directory (may not exist)
    #[must_use]
    pub fn get_model_path(&self, model_id: &str) -> PathBuf {
        self.cache_dir.join(model_id)
    }

    /// Check whether a model is cached with at least one usable variant
    #[must_use]
    pub fn is_model_cached(&self, model_id: &str) -> bool {
        Self::validate_model_directory(&self.get_model_path(model_id))
    }

    /// Most preferred cached variant of a model and its graph path
    #[must_use]
    pub fn best_variant(&self, model_id: &str) -> Option<(ModelVariant, PathBuf)> {
        let model_path = self.get_model_path(model_id);
        ModelVariant::preference_order()
            .into_iter()
            .map(|variant| (variant, model_path.join(variant.relative_path())))
            .find(|(_, path)| path.is_file())
    }

    /// Scan cache directory and return all valid models, sorted by ID
    ///
    /// # Errors
    /// - Failed to read cache directory
    pub fn scan_cached_models(&self) -> Result<Vec<CachedModelInfo>> {
        let mut models = Vec::new();

        if !self.cache_dir.exists() {
            return Ok(models);
        }

        let entries = fs::read_dir(&self.cache_dir).map_err(|e| {
            LayerFlowError::file_io_error("read cache directory", &self.cache_dir, &e)
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| {
                LayerFlowError::file_io_error("read cache directory entry", &self.cache_dir, &e)
            })?;

            let path = entry.path();
            // Dot-prefixed directories are in-flight downloads
            let Some(model_id) = path
                .file_name()
                .and_then(|name| name.to_str())
                .filter(|name| !name.starts_with('.'))
            else {
                continue;
            };

            if !path.is_dir() || !Self::validate_model_directory(&path) {
                log::debug!("Skipping invalid model directory: {}", path.display());
                continue;
            }

            let variants = ModelVariant::preference_order()
                .into_iter()
                .filter(|variant| path.join(variant.relative_path()).is_file())
                .collect();

            models.push(CachedModelInfo {
                model_id: model_id.to_string(),
                size_bytes: Self::calculate_directory_size(&path).unwrap_or(0),
                path,
                variants,
            });
        }

        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(models)
    }

    /// Remove a cached model
    ///
    /// Returns `false` if the model was not cached.
    ///
    /// # Errors
    /// - Failed to remove model directory
    pub fn clear_specific_model(&self, model_id: &str) -> Result<bool> {
        let model_path = self.get_model_path(model_id);

        if !model_path.exists() {
            return Ok(false);
        }

        log::info!("Removing cached model: {}", model_id);
        fs::remove_dir_all(&model_path).map_err(|e| {
            LayerFlowError::file_io_error("remove cached model", &model_path, &e)
        })?;

        Ok(true)
    }

    /// Get the current cache directory path
    #[must_use]
    pub fn get_current_cache_dir(&self) -> &PathBuf {
        &self.cache_dir
    }

    fn validate_model_directory(model_path: &Path) -> bool {
        model_path.join(MODEL_INDEX_FILE).is_file()
            && ModelVariant::preference_order()
                .iter()
                .any(|variant| model_path.join(variant.relative_path()).is_file())
    }

    fn calculate_directory_size(dir_path: &Path) -> Result<u64> {
        let mut total_size = 0;

        Self::visit_dir(dir_path, &mut total_size)
            .map_err(|e| LayerFlowError::file_io_error("calculate directory size", dir_path, &e))?;

        Ok(total_size)
    }

    fn visit_dir(dir: &Path, total: &mut u64) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::visit_dir(&path, total)?;
            } else {
                *total += entry.metadata()?.len();
            }
        }
        Ok(())
    }
}

/// Format file size in human-readable format
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS.get(unit_index).unwrap_or(&"B"))
    } else {
        format!("{:.1} {}", size, UNITS.get(unit_index).unwrap_or(&"B"))
    }
}
