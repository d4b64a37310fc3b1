//! Model downloading for the local pipeline
//!
//! Fetches the exported decomposition pipeline from a `HuggingFace` repository into the
//! [`ModelCache`], staging files in a temporary directory and moving them into place
//! only once every required file has arrived.

use crate::cache::{ModelCache, ModelVariant, MODEL_INDEX_FILE};
use crate::error::{LayerFlowError, Result};
use futures_util::stream::TryStreamExt;
#[cfg(feature = "cli")]
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;

const HUGGINGFACE_PREFIX: &str = "https://huggingface.co/";

/// Progress bar abstraction that works with and without CLI features
#[derive(Debug)]
pub enum ProgressIndicator {
    #[cfg(feature = "cli")]
    Indicatif(ProgressBar),
    NoOp,
}

impl ProgressIndicator {
    pub fn set_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_message(msg),
            Self::NoOp => drop(msg),
        }
    }

    pub fn set_length(&self, len: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_length(len),
            Self::NoOp => {
                let _ = len;
            },
        }
    }

    pub fn set_position(&self, pos: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_position(pos),
            Self::NoOp => {
                let _ = pos;
            },
        }
    }

    pub fn finish_with_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.finish_with_message(msg),
            Self::NoOp => drop(msg),
        }
    }
}

/// Model downloader with progress reporting
#[derive(Debug)]
pub struct ModelDownloader {
    client: Client,
    cache: ModelCache,
}

impl ModelDownloader {
    /// Create a downloader writing into `cache`
    ///
    /// # Errors
    /// - Failed to create HTTP client
    pub fn new(cache: ModelCache) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(3600)) // multi-GB graphs
            .build()
            .map_err(|e| LayerFlowError::network_error("Failed to create HTTP client", &e))?;

        Ok(Self { client, cache })
    }

    /// Download a model repository into the cache, returning its model ID
    ///
    /// Already-cached models are not downloaded again.
    ///
    /// # Errors
    /// - Invalid or unsupported URL
    /// - Network errors, or no ONNX variant available in the repository
    /// - File system errors while staging or moving files
    pub async fn download_model(&self, url: &str, show_progress: bool) -> Result<String> {
        validate_model_url(url)?;
        let model_id = ModelCache::url_to_model_id(url);
        log::info!("Downloading model from: {}", url);

        if self.cache.is_model_cached(&model_id) {
            log::info!("Model already cached: {}", model_id);
            return Ok(model_id);
        }

        let temp_dir = self.create_temp_download_dir(&model_id)?;
        let final_dir = self.cache.get_model_path(&model_id);

        let progress = if show_progress {
            Self::create_progress_indicator()
        } else {
            ProgressIndicator::NoOp
        };

        match self.download_model_files(url, &temp_dir, &progress).await {
            Ok(()) => {
                if final_dir.exists() {
                    fs::remove_dir_all(&final_dir).map_err(|e| {
                        LayerFlowError::file_io_error(
                            "remove existing model directory",
                            &final_dir,
                            &e,
                        )
                    })?;
                }

                fs::rename(&temp_dir, &final_dir).map_err(|e| {
                    LayerFlowError::file_io_error("move downloaded model to cache", &final_dir, &e)
                })?;

                progress.finish_with_message(format!("Downloaded {model_id}"));
                log::info!("Successfully downloaded model: {}", model_id);
                Ok(model_id)
            },
            Err(e) => {
                if temp_dir.exists() {
                    if let Err(cleanup_err) = fs::remove_dir_all(&temp_dir) {
                        log::warn!("Failed to cleanup temp directory: {}", cleanup_err);
                    }
                }
                progress.finish_with_message("Download failed".to_string());
                Err(e)
            },
        }
    }

    /// Get the model cache for other operations
    #[must_use]
    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    // Staged next to the final location so the rename stays on one filesystem.
    fn create_temp_download_dir(&self, model_id: &str) -> Result<PathBuf> {
        let temp_dir = self
            .cache
            .get_current_cache_dir()
            .join(format!(".download-{model_id}"));

        if temp_dir.exists() {
            fs::remove_dir_all(&temp_dir).map_err(|e| {
                LayerFlowError::file_io_error("remove existing temp directory", &temp_dir, &e)
            })?;
        }

        fs::create_dir_all(&temp_dir)
            .map_err(|e| LayerFlowError::file_io_error("create temp directory", &temp_dir, &e))?;

        Ok(temp_dir)
    }

    fn create_progress_indicator() -> ProgressIndicator {
        #[cfg(feature = "cli")]
        {
            let pb = ProgressBar::new(0);
            if let Ok(style) = ProgressStyle::default_bar().template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
            ) {
                pb.set_style(style.progress_chars("#>-"));
            }
            ProgressIndicator::Indicatif(pb)
        }
        #[cfg(not(feature = "cli"))]
        {
            ProgressIndicator::NoOp
        }
    }

    async fn download_model_files(
        &self,
        base_url: &str,
        download_dir: &Path,
        progress: &ProgressIndicator,
    ) -> Result<()> {
        let raw_base = format!("{}/resolve/main/", base_url.trim_end_matches('/'));

        progress.set_message(format!("Downloading {MODEL_INDEX_FILE}"));
        self.download_file(
            &format!("{raw_base}{MODEL_INDEX_FILE}"),
            &download_dir.join(MODEL_INDEX_FILE),
            progress,
        )
        .await?;

        // At least one variant must succeed
        let mut downloaded_models = 0;
        for variant in ModelVariant::preference_order() {
            let file_path = variant.relative_path();
            let local_path = download_dir.join(file_path);
            progress.set_message(format!("Downloading {variant} model"));

            match self
                .download_file(&format!("{raw_base}{file_path}"), &local_path, progress)
                .await
            {
                Ok(()) => {
                    downloaded_models += 1;
                    log::info!(
                        "Downloaded {} variant (sha256 {})",
                        variant,
                        file_sha256(&local_path)?
                    );
                },
                Err(e) => log::warn!("Failed to download {} variant: {}", variant, e),
            }
        }

        if downloaded_models == 0 {
            return Err(LayerFlowError::missing_dependency(format!(
                "no ONNX pipeline variants found at {base_url}"
            )));
        }

        Ok(())
    }

    // Streams into `<name>.part` and renames only after the full body arrived, so an
    // interrupted variant never looks cached.
    async fn download_file(
        &self,
        url: &str,
        local_path: &Path,
        progress: &ProgressIndicator,
    ) -> Result<()> {
        log::debug!("Downloading: {} -> {}", url, local_path.display());

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| LayerFlowError::file_io_error("create directory", parent, &e))?;
        }

        let staged_path = partial_path(local_path);
        match self.stream_to_file(url, &staged_path, progress).await {
            Ok(downloaded) => {
                fs::rename(&staged_path, local_path).map_err(|e| {
                    LayerFlowError::file_io_error("move downloaded file", local_path, &e)
                })?;
                log::debug!("Downloaded {} bytes to {}", downloaded, local_path.display());
                Ok(())
            },
            Err(e) => {
                if staged_path.exists() {
                    if let Err(cleanup_err) = fs::remove_file(&staged_path) {
                        log::warn!(
                            "Failed to remove partial download {}: {}",
                            staged_path.display(),
                            cleanup_err
                        );
                    }
                }
                Err(e)
            },
        }
    }

    async fn stream_to_file(
        &self,
        url: &str,
        local_path: &Path,
        progress: &ProgressIndicator,
    ) -> Result<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LayerFlowError::network_error(&format!("Failed to download {url}"), &e))?;

        if !response.status().is_success() {
            return Err(LayerFlowError::Network(format!(
                "HTTP error {} for {}",
                response.status(),
                url
            )));
        }

        let total_size = response.content_length();
        if let Some(total) = total_size {
            progress.set_length(total);
        }

        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| LayerFlowError::file_io_error("create file", local_path, &e))?;

        let mut stream = StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        let mut downloaded = 0u64;
        let mut buffer = vec![0; 64 * 1024];

        loop {
            let bytes_read = stream
                .read(&mut buffer)
                .await
                .map_err(|e| LayerFlowError::Network(format!("Failed to read download stream: {e}")))?;

            if bytes_read == 0 {
                break;
            }

            file.write_all(buffer.get(..bytes_read).unwrap_or(&[]))
                .await
                .map_err(|e| LayerFlowError::file_io_error("write to file", local_path, &e))?;

            downloaded += bytes_read as u64;
            if total_size.is_some() {
                progress.set_position(downloaded);
            } else {
                progress.set_message(format!("Downloaded {:.1} MB", downloaded as f64 / 1_048_576.0));
            }
        }

        file.flush()
            .await
            .map_err(|e| LayerFlowError::file_io_error("flush file", local_path, &e))?;

        if let Some(expected) = total_size {
            if downloaded != expected {
                return Err(LayerFlowError::Network(format!(
                    "Incomplete download of {url}: received {downloaded} of {expected} bytes"
                )));
            }
        }

        Ok(downloaded)
    }
}

/// Staging path for an in-flight download of `path`
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

/// SHA-256 of a file as lowercase hex
///
/// # Errors
/// - Failed to read the file
pub fn file_sha256(file_path: &Path) -> Result<String> {
    let contents = fs::read(file_path)
        .map_err(|e| LayerFlowError::file_io_error("read file for hashing", file_path, &e))?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Validate that a URL is a supported model repository
///
/// Only `HuggingFace` repositories of the form `https://huggingface.co/owner/repo` are supported.
///
/// # Errors
/// - Empty, non-`HuggingFace` or incomplete repository URL
pub fn validate_model_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(LayerFlowError::invalid_config("Model URL cannot be empty"));
    }

    let Some(repo_path) = url.strip_prefix(HUGGINGFACE_PREFIX) else {
        return Err(LayerFlowError::invalid_config(format!(
            "Unsupported URL format: {url}. Only HuggingFace repositories are supported (https://huggingface.co/...)"
        )));
    };

    let mut parts = repo_path.trim_end_matches('/').split('/');
    match (parts.next(), parts.next()) {
        (Some(owner), Some(repo)) if !owner.is_empty() && !repo.is_empty() => Ok(()),
        _ => Err(LayerFlowError::invalid_config(format!(
            "Invalid HuggingFace repository URL: {url}. Expected format: https://huggingface.co/owner/repo-name"
        ))),
    }
}
