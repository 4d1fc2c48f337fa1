use std::path::PathBuf;
use thiserror::Error;

/// Main error type for archiving operations
#[derive(Debug, Error)]
pub enum CloneError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error for {url}: {source}")]
    Http { url: String, source: reqwest::Error },

    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Size limit of {limit} bytes exceeded while fetching {url}")]
    SizeLimit { url: String, limit: u64 },

    #[error("Rendering failed: {0}")]
    Render(String),

    #[error("Could not access the page {url}: {message}")]
    SeedUnreachable { url: String, message: String },

    #[error("Failed to create working directory in {path:?}: {source}")]
    WorkingDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Post-processing failed for {path:?}: {message}")]
    PostProcess { path: PathBuf, message: String },

    #[error("Download limit reached for {ip}")]
    RateLimited { ip: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl CloneError {
    /// Whether a fetch that failed with this error is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CloneError::SizeLimit { .. }
                | CloneError::InvalidUrl(_)
                | CloneError::Config(_)
        )
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type alias for archiving operations
pub type Result<T> = std::result::Result<T, CloneError>;
