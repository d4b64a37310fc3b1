//! LayerFlow API service binary
//!
//! Loads `.env`, resolves the service configuration, then either runs one maintenance
//! command (model download, cache listing, diagnostics) or serves HTTP until Ctrl-C.

use crate::cache::{format_size, ModelCache};
use crate::config::ServiceConfig;
use crate::download::ModelDownloader;
use crate::server;
use crate::tracing_config::{TracingConfig, TracingFormat};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::Instrument;

/// Image layer decomposition API server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "layerflow-api")]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Bind host [default: LAYERFLOW_HOST or 127.0.0.1]
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port [default: LAYERFLOW_PORT or 8000]
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Environment file to load instead of ./.env
    #[arg(long, value_name = "PATH")]
    pub env_file: Option<PathBuf>,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value_t = CliLogFormat::Console)]
    pub log_format: CliLogFormat,

    /// Use custom model cache directory
    #[arg(long, value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Download the local pipeline into the cache and exit
    #[arg(long)]
    pub download_model: bool,

    /// List cached models and exit
    #[arg(long)]
    pub list_models: bool,

    /// Remove the configured local model from the cache and exit
    #[arg(long)]
    pub clear_cache: bool,

    /// Show execution provider diagnostics and exit
    #[arg(long)]
    pub show_providers: bool,

    /// Print the resolved configuration (API key redacted) and exit
    #[arg(long)]
    pub show_config: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliLogFormat {
    Console,
    Compact,
    #[cfg(feature = "tracing-json")]
    Json,
}

impl From<CliLogFormat> for TracingFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Console => Self::Console,
            CliLogFormat::Compact => Self::Compact,
            #[cfg(feature = "tracing-json")]
            CliLogFormat::Json => Self::Json,
        }
    }
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Before tracing, so RUST_LOG from the file applies.
    let env_source = load_env_file(cli.env_file.as_deref())?;

    TracingConfig::new()
        .with_verbosity(cli.verbose)
        .with_format(cli.log_format.into())
        .with_instance_id(uuid::Uuid::new_v4().to_string())
        .init()
        .context("Failed to initialize tracing")?;

    if let Some(path) = &env_source {
        tracing::debug!("Loaded environment from {}", path.display());
    }

    let config = resolve_config(&cli)?;

    if cli.show_config {
        return show_config(&config);
    }
    if cli.show_providers {
        show_provider_diagnostics();
        return Ok(());
    }
    if cli.list_models {
        return list_cached_models(&config);
    }
    if cli.clear_cache {
        return clear_cached_model(&config);
    }
    if cli.download_model {
        return download_model(&config).await;
    }

    tracing::info!(
        mode = config.mode_label(),
        backend = %config.backend_kind(),
        "Starting {}",
        crate::config::SERVICE_NAME
    );
    server::serve(config).await.context("Server failed")
}

/// Load `path`, or `./.env` when present; the process environment takes precedence
fn load_env_file(path: Option<&std::path::Path>) -> Result<Option<PathBuf>> {
    match path {
        Some(path) => dotenvy::from_path(path)
            .map(|()| Some(path.to_path_buf()))
            .with_context(|| format!("Failed to load environment file {}", path.display())),
        None => match dotenvy::dotenv() {
            Ok(path) => Ok(Some(path)),
            Err(e) if e.not_found() => Ok(None),
            Err(e) => Err(e).context("Failed to load .env"),
        },
    }
}

/// Environment configuration with command line overrides applied
fn resolve_config(cli: &Cli) -> Result<ServiceConfig> {
    let config = ServiceConfig::from_env().context("Invalid configuration")?;
    apply_overrides(config, cli)
}

fn apply_overrides(mut config: ServiceConfig, cli: &Cli) -> Result<ServiceConfig> {
    if let Some(host) = &cli.host {
        config.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(dir) = &cli.cache_dir {
        config.local.cache_dir = Some(dir.clone());
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn show_config(config: &ServiceConfig) -> Result<()> {
    let rendered =
        serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
    println!("{rendered}");
    println!("\nActive backend: {} ({})", config.backend_kind(), config.mode_label());
    Ok(())
}

fn show_provider_diagnostics() {
    println!("🔍 Execution Provider Diagnostics");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let cpu_count = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    println!("💻 System: {cpu_count} CPU cores detected");

    #[cfg(feature = "onnx")]
    {
        println!("\n🚀 Execution Providers:");
        for (name, available, description) in crate::backends::onnx::list_providers() {
            let status = if available {
                "✅ Available"
            } else {
                "❌ Not Available"
            };
            println!("  • {name}: {status} - {description}");
        }
    }
    #[cfg(not(feature = "onnx"))]
    println!("\n❌ Built without the `onnx` feature; local mode is unavailable");

    println!("\n📋 Notes:");
    println!("  • Local mode requires CUDA; without it, set FAL_KEY for fal.ai");
    println!("  • USE_LOCAL_MODEL forces local mode even when FAL_KEY is set");
}

fn open_cache(config: &ServiceConfig) -> Result<ModelCache> {
    ModelCache::open(config.local.cache_dir.as_deref()).context("Failed to open model cache")
}

fn configured_model_url(config: &ServiceConfig) -> Result<&str> {
    config.local.model_url.as_deref().context(
        "LAYERFLOW_LOCAL_MODEL_URL is not set; point it at a repository providing an exported \
         layer pipeline (onnx/model_fp16.onnx or onnx/model.onnx)",
    )
}

fn list_cached_models(config: &ServiceConfig) -> Result<()> {
    let cache = open_cache(config)?;
    let models = cache
        .scan_cached_models()
        .context("Failed to list cached models")?;

    println!("📦 Cached Models ({})", cache.get_current_cache_dir().display());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if models.is_empty() {
        println!("No cached models found.");
        println!("\n💡 To download the local pipeline, use:");
        println!("  layerflow-api --download-model");
        return Ok(());
    }

    for model in models {
        let variants: Vec<String> = model.variants.iter().map(ToString::to_string).collect();
        println!("📁 {}", model.model_id);
        println!("  └─ Location: {}", model.path.display());
        println!("  └─ Variants: {}", variants.join(", "));
        println!("  └─ Size: {}", format_size(model.size_bytes));
    }
    Ok(())
}

fn clear_cached_model(config: &ServiceConfig) -> Result<()> {
    let cache = open_cache(config)?;
    let model_id = ModelCache::url_to_model_id(configured_model_url(config)?);

    if cache
        .clear_specific_model(&model_id)
        .with_context(|| format!("Failed to clear model '{model_id}'"))?
    {
        println!("✅ Removed model: {model_id}");
    } else {
        println!("⚠️  Model '{model_id}' not found in cache");
    }
    Ok(())
}

async fn download_model(config: &ServiceConfig) -> Result<()> {
    let url = configured_model_url(config)?;
    let cache = open_cache(config)?;
    let span = tracing::info_span!(
        "download",
        url = %url,
        destination = %cache.get_current_cache_dir().display()
    );

    println!("📦 Downloading model from: {url}");
    let downloader = ModelDownloader::new(cache).context("Failed to create model downloader")?;
    let model_id = downloader
        .download_model(url, true)
        .instrument(span)
        .await
        .context("Failed to download model")?;

    println!("✅ Model ready: {model_id}");
    println!(
        "   Cache location: {}",
        downloader.cache().get_model_path(&model_id).display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["layerflow-api"]).unwrap();
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
        assert_eq!(cli.verbose, 0);
        assert_eq!(cli.log_format, CliLogFormat::Console);
        assert!(!cli.download_model && !cli.show_config);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "layerflow-api",
            "--host",
            "0.0.0.0",
            "-p",
            "9000",
            "-vv",
            "--log-format",
            "compact",
            "--cache-dir",
            "/tmp/layerflow",
            "--show-config",
        ])
        .unwrap();

        assert_eq!(cli.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log_format, CliLogFormat::Compact);
        assert_eq!(cli.cache_dir, Some(PathBuf::from("/tmp/layerflow")));
        assert!(cli.show_config);
    }

    #[test]
    fn test_cli_rejects_bad_port() {
        assert!(Cli::try_parse_from(["layerflow-api", "--port", "70000"]).is_err());
    }

    #[test]
    fn test_overrides_win_over_environment() {
        let cli =
            Cli::try_parse_from(["layerflow-api", "--port", "9100", "--cache-dir", "/data"]).unwrap();
        let config = apply_overrides(ServiceConfig::default(), &cli).unwrap();

        assert_eq!(config.port, 9100);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.local.cache_dir, Some(PathBuf::from("/data")));
    }

    #[test]
    fn test_overrides_are_validated() {
        let cli = Cli::try_parse_from(["layerflow-api", "--host", " "]).unwrap();
        assert!(apply_overrides(ServiceConfig::default(), &cli).is_err());
    }

    #[test]
    fn test_model_commands_need_a_model_url() {
        let err = configured_model_url(&ServiceConfig::default()).unwrap_err();
        assert!(err.to_string().contains("LAYERFLOW_LOCAL_MODEL_URL"));

        let config = ServiceConfig::builder()
            .model_url("https://huggingface.co/acme/layer-pipeline-onnx")
            .build()
            .unwrap();
        assert_eq!(
            configured_model_url(&config).unwrap(),
            "https://huggingface.co/acme/layer-pipeline-onnx"
        );
    }

    #[test]
    fn test_missing_env_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.env");
        assert!(load_env_file(Some(missing.as_path())).is_err());
    }

    #[test]
    fn test_explicit_env_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.env");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "LAYERFLOW_CLI_TEST_MARKER=loaded").unwrap();

        assert_eq!(load_env_file(Some(path.as_path())).unwrap(), Some(path.clone()));
        assert_eq!(
            std::env::var("LAYERFLOW_CLI_TEST_MARKER").as_deref(),
            Ok("loaded")
        );
    }
}
