//! Service configuration
//!
//! The environment is read exactly once at startup into a [`ServiceConfig`], which is then
//! shared with the HTTP handlers. Backend selection is a pure function of that value, so it
//! can be tested without touching the process environment.

use crate::download::validate_model_url;
use crate::error::{LayerFlowError, Result};
use serde::{Serialize, Serializer};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable holding the fal.ai API key
pub const ENV_FAL_KEY: &str = "FAL_KEY";
/// Environment variable forcing the local backend even when a key is present
pub const ENV_USE_LOCAL_MODEL: &str = "USE_LOCAL_MODEL";
pub const ENV_HOST: &str = "LAYERFLOW_HOST";
pub const ENV_PORT: &str = "LAYERFLOW_PORT";
pub const ENV_FAL_QUEUE_URL: &str = "LAYERFLOW_FAL_QUEUE_URL";
pub const ENV_FAL_MODEL: &str = "LAYERFLOW_FAL_MODEL";
pub const ENV_FAL_POLL_MS: &str = "LAYERFLOW_FAL_POLL_MS";
pub const ENV_CACHE_DIR: &str = "LAYERFLOW_CACHE_DIR";
pub const ENV_LOCAL_MODEL_URL: &str = "LAYERFLOW_LOCAL_MODEL_URL";
pub const ENV_LOCAL_MODEL_PATH: &str = "LAYERFLOW_LOCAL_MODEL_PATH";
pub const ENV_AUTO_DOWNLOAD: &str = "LAYERFLOW_AUTO_DOWNLOAD";
pub const ENV_MAX_UPLOAD_MB: &str = "LAYERFLOW_MAX_UPLOAD_MB";

/// Service name reported by the health endpoint
pub const SERVICE_NAME: &str = "layerflow-api";

/// Which decomposition backend serves a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Hosted fal.ai inference
    Remote,
    /// On-machine ONNX pipeline (CUDA required)
    Local,
}

impl BackendKind {
    /// Label used by the health endpoint's `mode` field
    #[must_use]
    pub fn mode_label(self) -> &'static str {
        match self {
            Self::Remote => "fal.ai",
            Self::Local => "local",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote => write!(f, "remote"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Remote only when an API key is present and local execution is not forced
#[must_use]
pub fn select_backend(api_key_present: bool, local_override: bool) -> BackendKind {
    if api_key_present && !local_override {
        BackendKind::Remote
    } else {
        BackendKind::Local
    }
}

/// fal.ai queue client settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteConfig {
    /// API key (`FAL_KEY`), never serialized in clear text
    #[serde(serialize_with = "redact_key")]
    pub api_key: Option<String>,

    /// Queue base URL
    pub queue_url: String,

    /// Hosted model identifier
    pub model_id: String,

    /// Interval between job status polls
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            queue_url: "https://queue.fal.run".to_string(),
            model_id: "fal-ai/qwen-image-layered".to_string(),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Local pipeline settings
///
/// Local mode needs an ONNX export of the layer pipeline that follows the named-input
/// graph contract of the `backends::onnx` module. The diffusers release does not ship
/// one, so there is no default source: point `model_path` at an export on disk, or
/// `model_url` at a `HuggingFace` repository carrying `onnx/model_fp16.onnx` and/or
/// `onnx/model.onnx`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocalConfig {
    /// Exported graph on disk (`LAYERFLOW_LOCAL_MODEL_PATH`), used as-is
    pub model_path: Option<PathBuf>,

    /// Repository the exported pipeline is downloaded from (`LAYERFLOW_LOCAL_MODEL_URL`)
    pub model_url: Option<String>,

    /// Cache root override (None = XDG cache directory)
    pub cache_dir: Option<PathBuf>,

    /// Download the model on the first local request if it is not cached
    pub auto_download: bool,

    /// Number of intra-op threads for inference (0 = auto)
    pub intra_threads: usize,
}

/// Complete service configuration, resolved once at startup
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceConfig {
    /// Bind host
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Force the local backend regardless of the API key (`USE_LOCAL_MODEL`)
    pub use_local_model: bool,

    /// Maximum accepted request body in bytes
    pub max_upload_bytes: usize,

    pub remote: RemoteConfig,

    pub local: LocalConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            use_local_model: false,
            max_upload_bytes: 25 * 1024 * 1024,
            remote: RemoteConfig::default(),
            local: LocalConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Create a new configuration builder
    #[must_use]
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    /// Resolve configuration from the process environment
    ///
    /// Call after the `.env` file has been loaded.
    ///
    /// # Errors
    /// - A numeric variable fails to parse
    /// - The resolved configuration fails [`ServiceConfig::validate`]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration from an arbitrary key lookup
    ///
    /// Empty values are treated as unset, matching how the flags were always interpreted.
    ///
    /// # Errors
    /// - A numeric variable fails to parse
    /// - The resolved configuration fails [`ServiceConfig::validate`]
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        config.remote.api_key = get(ENV_FAL_KEY);
        config.use_local_model = get(ENV_USE_LOCAL_MODEL).is_some();

        if let Some(host) = get(ENV_HOST) {
            config.host = host;
        }
        if let Some(port) = get(ENV_PORT) {
            config.port = parse_number(ENV_PORT, &port)?;
        }
        if let Some(url) = get(ENV_FAL_QUEUE_URL) {
            config.remote.queue_url = url;
        }
        if let Some(model) = get(ENV_FAL_MODEL) {
            config.remote.model_id = model;
        }
        if let Some(poll) = get(ENV_FAL_POLL_MS) {
            config.remote.poll_interval = Duration::from_millis(parse_number(ENV_FAL_POLL_MS, &poll)?);
        }
        if let Some(dir) = get(ENV_CACHE_DIR) {
            config.local.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = get(ENV_LOCAL_MODEL_URL) {
            config.local.model_url = Some(url);
        }
        if let Some(path) = get(ENV_LOCAL_MODEL_PATH) {
            config.local.model_path = Some(PathBuf::from(path));
        }
        if let Some(flag) = get(ENV_AUTO_DOWNLOAD) {
            config.local.auto_download = parse_bool(&flag);
        }
        if let Some(mb) = get(ENV_MAX_UPLOAD_MB) {
            let mb: usize = parse_number(ENV_MAX_UPLOAD_MB, &mb)?;
            config.max_upload_bytes = mb.saturating_mul(1024 * 1024);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    /// - Empty host, queue URL or model identifier
    /// - Zero upload limit
    /// - Local model URL that is not a `HuggingFace` repository
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(LayerFlowError::invalid_config("host must not be empty"));
        }
        if self.max_upload_bytes == 0 {
            return Err(LayerFlowError::invalid_config(
                "upload limit must be at least 1 MB",
            ));
        }
        if self.remote.queue_url.trim().is_empty() {
            return Err(LayerFlowError::invalid_config("fal queue URL must not be empty"));
        }
        if self.remote.model_id.trim().is_empty() {
            return Err(LayerFlowError::invalid_config("fal model id must not be empty"));
        }
        if let Some(url) = &self.local.model_url {
            validate_model_url(url)?;
        }
        Ok(())
    }

    /// Backend that serves decomposition requests under this configuration
    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        select_backend(self.remote.api_key.is_some(), self.use_local_model)
    }

    /// Health endpoint `mode` label
    #[must_use]
    pub fn mode_label(&self) -> &'static str {
        self.backend_kind().mode_label()
    }

    /// Socket address to bind, resolving host names such as `localhost`
    ///
    /// # Errors
    /// - Host does not resolve to an address
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let invalid = |reason: String| {
            LayerFlowError::invalid_config(format!(
                "invalid bind address {}:{}: {reason}",
                self.host, self.port
            ))
        };
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| invalid(e.to_string()))?
            .next()
            .ok_or_else(|| invalid("host resolved to no addresses".to_string()))
    }
}

/// Builder for `ServiceConfig`
#[derive(Debug, Default)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    /// Set bind host
    #[must_use]
    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set bind port
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set or clear the fal.ai API key
    #[must_use]
    pub fn api_key(mut self, key: Option<String>) -> Self {
        self.config.remote.api_key = key;
        self
    }

    /// Force local execution
    #[must_use]
    pub fn use_local_model(mut self, enabled: bool) -> Self {
        self.config.use_local_model = enabled;
        self
    }

    /// Set the fal queue base URL
    #[must_use]
    pub fn queue_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.remote.queue_url = url.into();
        self
    }

    /// Set the hosted model identifier
    #[must_use]
    pub fn model_id<S: Into<String>>(mut self, model_id: S) -> Self {
        self.config.remote.model_id = model_id.into();
        self
    }

    /// Set the job status poll interval
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.remote.poll_interval = interval;
        self
    }

    /// Set the model cache root
    #[must_use]
    pub fn cache_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.local.cache_dir = Some(dir.into());
        self
    }

    /// Set the repository the exported pipeline is downloaded from
    #[must_use]
    pub fn model_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.local.model_url = Some(url.into());
        self
    }

    /// Set an exported pipeline graph on disk
    #[must_use]
    pub fn model_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.local.model_path = Some(path.into());
        self
    }

    /// Enable on-demand model download
    #[must_use]
    pub fn auto_download(mut self, enabled: bool) -> Self {
        self.config.local.auto_download = enabled;
        self
    }

    /// Set maximum upload size in bytes
    #[must_use]
    pub fn max_upload_bytes(mut self, bytes: usize) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    /// Build the configuration
    ///
    /// # Errors
    /// - Validation failure, see [`ServiceConfig::validate`]
    pub fn build(self) -> Result<ServiceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| LayerFlowError::invalid_config(format!("{key}={value}: {e}")))
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[allow(clippy::ref_option)]
fn redact_key<S: Serializer>(key: &Option<String>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match key {
        Some(_) => serializer.serialize_some("***"),
        None => serializer.serialize_none(),
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_select_backend_truth_table() {
        assert_eq!(select_backend(true, false), BackendKind::Remote);
        assert_eq!(select_backend(true, true), BackendKind::Local);
        assert_eq!(select_backend(false, false), BackendKind::Local);
        assert_eq!(select_backend(false, true), BackendKind::Local);
    }

    #[test]
    fn test_backend_kind_from_environment_flags() {
        let cases = [
            (vec![(ENV_FAL_KEY, "key")], BackendKind::Remote),
            (vec![(ENV_FAL_KEY, "key"), (ENV_USE_LOCAL_MODEL, "1")], BackendKind::Local),
            (vec![], BackendKind::Local),
            (vec![(ENV_USE_LOCAL_MODEL, "1")], BackendKind::Local),
        ];
        for (pairs, expected) in cases {
            let config = ServiceConfig::from_lookup(lookup(&pairs)).unwrap();
            assert_eq!(config.backend_kind(), expected, "{pairs:?}");
        }
    }

    #[test]
    fn test_empty_values_count_as_unset() {
        let config =
            ServiceConfig::from_lookup(lookup(&[(ENV_FAL_KEY, "key"), (ENV_USE_LOCAL_MODEL, "")]))
                .unwrap();
        assert_eq!(config.backend_kind(), BackendKind::Remote);

        let config = ServiceConfig::from_lookup(lookup(&[(ENV_FAL_KEY, "  ")])).unwrap();
        assert!(config.remote.api_key.is_none());
        assert_eq!(config.mode_label(), "local");
    }

    #[test]
    fn test_mode_labels() {
        assert_eq!(BackendKind::Remote.mode_label(), "fal.ai");
        assert_eq!(BackendKind::Local.mode_label(), "local");
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.port, 8000);
        assert_eq!(config.remote.model_id, "fal-ai/qwen-image-layered");
        assert_eq!(config.remote.poll_interval, Duration::from_millis(500));
        assert!(!config.local.auto_download);
        assert!(config.local.model_url.is_none());
        assert!(config.local.model_path.is_none());
    }

    #[test]
    fn test_local_model_source() {
        let config = ServiceConfig::from_lookup(lookup(&[
            (ENV_LOCAL_MODEL_URL, "https://huggingface.co/acme/layer-pipeline-onnx"),
            (ENV_LOCAL_MODEL_PATH, "/models/layers.onnx"),
        ]))
        .unwrap();
        assert_eq!(
            config.local.model_url.as_deref(),
            Some("https://huggingface.co/acme/layer-pipeline-onnx")
        );
        assert_eq!(config.local.model_path, Some(PathBuf::from("/models/layers.onnx")));

        let err = ServiceConfig::from_lookup(lookup(&[(ENV_LOCAL_MODEL_URL, "https://example.com/x")]))
            .unwrap_err();
        assert!(matches!(err, LayerFlowError::InvalidConfig(_)), "{err}");
    }

    #[test]
    fn test_overrides() {
        let config = ServiceConfig::from_lookup(lookup(&[
            (ENV_HOST, "0.0.0.0"),
            (ENV_PORT, "9000"),
            (ENV_FAL_QUEUE_URL, "http://127.0.0.1:1234"),
            (ENV_FAL_POLL_MS, "20"),
            (ENV_CACHE_DIR, "/tmp/layerflow"),
            (ENV_AUTO_DOWNLOAD, "yes"),
            (ENV_MAX_UPLOAD_MB, "2"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr().unwrap().to_string(), "0.0.0.0:9000");
        assert_eq!(config.remote.queue_url, "http://127.0.0.1:1234");
        assert_eq!(config.remote.poll_interval, Duration::from_millis(20));
        assert_eq!(config.local.cache_dir, Some(PathBuf::from("/tmp/layerflow")));
        assert!(config.local.auto_download);
        assert_eq!(config.max_upload_bytes, 2 * 1024 * 1024);
    }

    #[test]
    fn test_bind_addr_resolves_host_names() {
        let config = ServiceConfig::builder().host("localhost").port(8123).build().unwrap();
        let addr = config.bind_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 8123);

        let config = ServiceConfig::builder().host("0.0.0.0").build().unwrap();
        assert_eq!(config.bind_addr().unwrap().to_string(), "0.0.0.0:8000");
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let err = ServiceConfig::from_lookup(lookup(&[(ENV_PORT, "eighty")])).unwrap_err();
        assert!(err.to_string().contains(ENV_PORT));

        let err = ServiceConfig::from_lookup(lookup(&[(ENV_MAX_UPLOAD_MB, "0")])).unwrap_err();
        assert!(matches!(err, LayerFlowError::InvalidConfig(_)));
    }

    #[test]
    fn test_builder() {
        let config = ServiceConfig::builder()
            .port(8081)
            .api_key(Some("secret".to_string()))
            .use_local_model(true)
            .poll_interval(Duration::from_millis(5))
            .build()
            .unwrap();
        assert_eq!(config.port, 8081);
        assert_eq!(config.backend_kind(), BackendKind::Local);

        assert!(ServiceConfig::builder().host("").build().is_err());
    }

    #[test]
    fn test_serialization_redacts_key() {
        let config = ServiceConfig::builder()
            .api_key(Some("super-secret".to_string()))
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("super-secret"));
        assert!(json.contains("\"api_key\":\"***\""));
        assert!(json.contains("\"poll_interval\":500"));
    }
}
