use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServingError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Script source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Unsupported script variable type: {0}")]
    UnsupportedType(String),

    #[error("Empty record passed to transform for input '{0}'")]
    EmptyRecord(String),

    #[error("Cardinality mismatch: {0}")]
    CardinalityMismatch(String),

    #[error("Inference call timed out after {waited_ms}ms waiting for a worker slot")]
    InferenceTimeout { waited_ms: u64 },

    #[error("Runner is closed: {0}")]
    RunnerClosed(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServingError {
    /// Stable kind label surfaced in HTTP error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            ServingError::Configuration(_) => "ConfigurationError",
            ServingError::SourceUnavailable(_) => "SourceUnavailableError",
            ServingError::UnsupportedType(_) => "UnsupportedTypeError",
            ServingError::EmptyRecord(_) => "EmptyRecordError",
            ServingError::CardinalityMismatch(_) => "CardinalityMismatchError",
            ServingError::InferenceTimeout { .. } => "InferenceTimeoutError",
            ServingError::RunnerClosed(_) => "RunnerClosedError",
            ServingError::Backend(_) => "BackendError",
            ServingError::Codec(_) => "CodecError",
            ServingError::Json(_) => "JsonError",
            ServingError::Toml(_) => "TomlError",
            ServingError::Io(_) => "IoError",
        }
    }

    /// Build-time errors abort startup; everything else fails a single request.
    pub fn is_build_time(&self) -> bool {
        matches!(
            self,
            ServingError::Configuration(_)
                | ServingError::SourceUnavailable(_)
                | ServingError::UnsupportedType(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ServingError>;
