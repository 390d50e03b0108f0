use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutoplayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Window not found: {0}")]
    WindowNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Target window lost input focus")]
    FocusLost,

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Perception error: {0}")]
    Perception(String),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("OCR error: {0}")]
    Ocr(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Run cancelled")]
    Cancelled,
}

impl AutoplayError {
    /// The environment is unusable: the run must halt and report verbatim.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AutoplayError::WindowNotFound(_) | AutoplayError::PermissionDenied(_)
        )
    }

    /// Recoverable by skipping the tick or retrying on the next one.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AutoplayError::Capture(_) | AutoplayError::FocusLost | AutoplayError::Dispatch(_)
        )
    }

    /// Map a platform error message onto the taxonomy. OS capture/input APIs
    /// only report missing grants through their message text.
    pub fn from_platform(context: &str, message: impl std::fmt::Display) -> Self {
        let message = message.to_string();
        let lower = message.to_lowercase();
        if lower.contains("permission") || lower.contains("denied") || lower.contains("not trusted") {
            AutoplayError::PermissionDenied(format!("{context}: {message}"))
        } else {
            AutoplayError::Capture(format!("{context}: {message}"))
        }
    }
}

impl serde::Serialize for AutoplayError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type AutoplayResult<T> = Result<T, AutoplayError>;
