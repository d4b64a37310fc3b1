//! Error types for image decomposition operations

use thiserror::Error;

/// Result type alias for decomposition operations
pub type Result<T> = std::result::Result<T, LayerFlowError>;

/// Error types produced by the decomposition backends and the HTTP dispatcher
///
/// Each adapter classifies its own failures, so the dispatcher maps variants to
/// HTTP status codes without inspecting message text.
#[derive(Error, Debug)]
pub enum LayerFlowError {
    /// Upload rejected before any backend was invoked (wrong content type)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Malformed form data (missing field, non-numeric layer count)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A library or model file required by the local backend is absent
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// Remote credentials missing or rejected
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Execution environment cannot run the backend (no CUDA GPU)
    #[error("Capability error: {0}")]
    Capability(String),

    /// Remote or local backend failed while executing the job
    #[error("Backend error: {0}")]
    Backend(String),

    /// Backend finished successfully but produced no layers
    #[error("No layers returned")]
    NoLayers,

    /// Transport-level failure talking to a remote service
    #[error("Network error: {0}")]
    Network(String),

    /// Input/output errors (cache directory, model files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding or encoding errors
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LayerFlowError {
    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new invalid request error
    pub fn invalid_request<S: Into<String>>(msg: S) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a new missing dependency error
    pub fn missing_dependency<S: Into<String>>(msg: S) -> Self {
        Self::MissingDependency(msg.into())
    }

    /// Create a new authentication error
    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a new capability error
    pub fn capability<S: Into<String>>(msg: S) -> Self {
        Self::Capability(msg.into())
    }

    /// Create a new backend error
    pub fn backend<S: Into<String>>(msg: S) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    // Enhanced contextual error creators

    /// Create network error with operation context
    pub fn network_error(operation: &str, error: &reqwest::Error) -> Self {
        Self::Network(format!("{operation}: {error}"))
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        let path_display = path.as_ref().display();
        Self::Io(std::io::Error::new(
            error.kind(),
            format!("Failed to {operation} '{path_display}': {error}"),
        ))
    }

    /// Create a remote HTTP status error, classifying credential rejections as `Auth`
    pub fn remote_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::Auth(format!("remote API rejected credentials ({status}): {body}")),
            _ => Self::Backend(format!("remote API returned {status}: {body}")),
        }
    }

    /// HTTP status code the dispatcher responds with for this error
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Auth(_) => 401,
            Self::InvalidRequest(_) => 422,
            Self::MissingDependency(_) | Self::Capability(_) => 503,
            Self::Backend(_)
            | Self::NoLayers
            | Self::Network(_)
            | Self::Io(_)
            | Self::Image(_) => 502,
            Self::InvalidConfig(_) | Self::Internal(_) => 500,
        }
    }

    /// Message returned to the HTTP caller, with remediation text where one exists
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Validation(msg) | Self::InvalidRequest(msg) => msg.clone(),
            Self::MissingDependency(msg) => format!(
                "Local mode deps missing. Build with the `onnx` feature and supply an exported \
                 layer pipeline (LAYERFLOW_LOCAL_MODEL_PATH, or LAYERFLOW_LOCAL_MODEL_URL with \
                 `layerflow-api --download-model`). Or set FAL_KEY for fal.ai. {msg}"
            ),
            Self::Auth(_) => "Invalid FAL_KEY. Get a key at https://fal.ai/dashboard/keys or use \
                              local mode (remove FAL_KEY, GPU required)."
                .to_string(),
            Self::Capability(_) => {
                "Local mode needs GPU. Set FAL_KEY for cloud inference.".to_string()
            },
            Self::Backend(msg) | Self::Network(msg) => format!("Decomposition failed: {msg}"),
            Self::NoLayers => "Decomposition failed: No layers returned".to_string(),
            Self::Io(e) => format!("Decomposition failed: {e}"),
            Self::Image(e) => format!("Decomposition failed: {e}"),
            Self::InvalidConfig(msg) | Self::Internal(msg) => {
                format!("Internal server error: {msg}")
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = LayerFlowError::validation("bad type");
        assert!(matches!(err, LayerFlowError::Validation(_)));

        let err = LayerFlowError::capability("no cuda");
        assert!(matches!(err, LayerFlowError::Capability(_)));
    }

    #[test]
    fn test_error_display() {
        let err = LayerFlowError::invalid_config("port out of range");
        assert_eq!(err.to_string(), "Invalid configuration: port out of range");
        assert_eq!(LayerFlowError::NoLayers.to_string(), "No layers returned");
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(LayerFlowError::validation("x").status_code(), 400);
        assert_eq!(LayerFlowError::auth("x").status_code(), 401);
        assert_eq!(LayerFlowError::invalid_request("x").status_code(), 422);
        assert_eq!(LayerFlowError::missing_dependency("x").status_code(), 503);
        assert_eq!(LayerFlowError::capability("x").status_code(), 503);
        assert_eq!(LayerFlowError::backend("x").status_code(), 502);
        assert_eq!(LayerFlowError::NoLayers.status_code(), 502);
        assert_eq!(LayerFlowError::internal("x").status_code(), 500);
    }

    #[test]
    fn test_remote_status_classification() {
        assert!(matches!(
            LayerFlowError::remote_status(401, "No user found for Key ID"),
            LayerFlowError::Auth(_)
        ));
        assert!(matches!(LayerFlowError::remote_status(403, ""), LayerFlowError::Auth(_)));
        assert!(matches!(
            LayerFlowError::remote_status(500, "boom"),
            LayerFlowError::Backend(_)
        ));
    }

    #[test]
    fn test_client_messages_carry_remediation() {
        assert!(LayerFlowError::capability("no cuda").client_message().contains("GPU"));
        assert!(LayerFlowError::auth("rejected").client_message().contains("FAL_KEY"));
        assert!(LayerFlowError::missing_dependency("ort not found")
            .client_message()
            .contains("ort not found"));
        assert_eq!(
            LayerFlowError::backend("timeout").client_message(),
            "Decomposition failed: timeout"
        );
    }

    #[test]
    fn test_file_io_error_context() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = LayerFlowError::file_io_error(
            "create cache directory",
            std::path::Path::new("/var/cache/layerflow"),
            &io_error,
        );
        let error_string = err.to_string();
        assert!(error_string.contains("create cache directory"));
        assert!(error_string.contains("/var/cache/layerflow"));
    }
}
