//! Configuration loading and validation
//!
//! All settings have defaults, so an empty (or missing) TOML file yields a
//! usable configuration. Sections:
//!
//! ```toml
//! [cloning]
//! concurrency = 5
//! retry_attempts = 3
//!
//! [storage]
//! storage_dir = "./storage"
//! retention_days = 7
//! ```

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArchiverConfig {
    pub cloning: CloningConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloningConfig {
    /// Simultaneous resource downloads per job
    pub concurrency: usize,
    /// Per-request timeout
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    /// First backoff delay; doubles on each further attempt
    pub retry_base_delay_ms: u64,
    /// Total bytes a single job may download
    pub max_total_size: u64,
    pub max_files: usize,
    /// Page levels crawled when the structure is saved (1 = seed only)
    pub max_depth: usize,
    pub include_externals: bool,
    pub follow_redirects: bool,
    pub optimize_images: bool,
    pub minify_code: bool,
    pub image_quality: u8,
    pub image_max_width: u32,
    pub image_max_height: u32,
    /// Try a headless browser before plain HTML parsing
    pub render: bool,
    /// Extra wait after navigation so lazy content can load
    pub render_settle_ms: u64,
    pub capture_screenshot: bool,
    /// Chromium binary; located automatically when unset
    pub chrome_executable: Option<PathBuf>,
    pub user_agent: String,
    pub mobile_user_agent: String,
    pub viewport: Viewport,
    pub mobile_viewport: Viewport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Where finished archives (and the persistent stores) live
    pub storage_dir: PathBuf,
    /// Parent for per-job working directories; OS temp dir when unset
    pub temp_dir: Option<PathBuf>,
    pub retention_days: u64,
    pub cleanup_interval_hours: u64,
    /// How long a delivered job stays queryable
    pub delivery_grace_secs: u64,
    pub max_downloads_per_ip: usize,
    pub rate_limit_window_hours: u64,
}

impl Default for CloningConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            timeout_secs: 30,
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
            max_total_size: 100 * 1024 * 1024,
            max_files: 1000,
            max_depth: 3,
            include_externals: true,
            follow_redirects: true,
            optimize_images: true,
            minify_code: true,
            image_quality: 85,
            image_max_width: 1920,
            image_max_height: 1080,
            render: true,
            render_settle_ms: 2000,
            capture_screenshot: true,
            chrome_executable: None,
            user_agent: DESKTOP_USER_AGENT.to_string(),
            mobile_user_agent: MOBILE_USER_AGENT.to_string(),
            viewport: Viewport {
                width: 1920,
                height: 1080,
            },
            mobile_viewport: Viewport {
                width: 390,
                height: 844,
            },
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./storage"),
            temp_dir: None,
            retention_days: 7,
            cleanup_interval_hours: 12,
            delivery_grace_secs: 120,
            max_downloads_per_ip: 10,
            rate_limit_window_hours: 24,
        }
    }
}

impl CloningConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl StorageConfig {
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_hours * 60 * 60)
    }

    pub fn delivery_grace(&self) -> Duration {
        Duration::from_secs(self.delivery_grace_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_hours * 60 * 60)
    }
}

/// Loads and validates a configuration file
pub fn load_config(path: &Path) -> Result<ArchiverConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parses and validates configuration from TOML text
pub fn parse_config(content: &str) -> Result<ArchiverConfig, ConfigError> {
    let config: ArchiverConfig = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &ArchiverConfig) -> Result<(), ConfigError> {
    let cloning = &config.cloning;

    if cloning.concurrency == 0 {
        return Err(ConfigError::Validation(
            "cloning.concurrency must be at least 1".to_string(),
        ));
    }
    if cloning.retry_attempts == 0 {
        return Err(ConfigError::Validation(
            "cloning.retry_attempts must be at least 1".to_string(),
        ));
    }
    if cloning.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "cloning.timeout_secs must be greater than 0".to_string(),
        ));
    }
    if cloning.max_total_size == 0 {
        return Err(ConfigError::Validation(
            "cloning.max_total_size must be greater than 0".to_string(),
        ));
    }
    if cloning.max_depth == 0 {
        return Err(ConfigError::Validation(
            "cloning.max_depth must be at least 1".to_string(),
        ));
    }
    if !(1..=100).contains(&cloning.image_quality) {
        return Err(ConfigError::Validation(format!(
            "cloning.image_quality must be between 1 and 100, got {}",
            cloning.image_quality
        )));
    }
    if cloning.image_max_width == 0 || cloning.image_max_height == 0 {
        return Err(ConfigError::Validation(
            "cloning.image_max_width and image_max_height must be greater than 0".to_string(),
        ));
    }
    if config.storage.max_downloads_per_ip == 0 {
        return Err(ConfigError::Validation(
            "storage.max_downloads_per_ip must be at least 1".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.cloning.concurrency, 5);
        assert_eq!(config.cloning.retry_attempts, 3);
        assert_eq!(config.cloning.max_total_size, 100 * 1024 * 1024);
        assert_eq!(config.storage.retention_days, 7);
        assert_eq!(config.storage.max_downloads_per_ip, 10);
        assert!(config.cloning.include_externals);
    }

    #[test]
    fn test_partial_override() {
        let config = parse_config(
            r#"
            [cloning]
            concurrency = 3
            render = false

            [storage]
            storage_dir = "/var/lib/archives"
            "#,
        )
        .unwrap();

        assert_eq!(config.cloning.concurrency, 3);
        assert!(!config.cloning.render);
        assert_eq!(config.cloning.timeout_secs, 30);
        assert_eq!(config.storage.storage_dir, PathBuf::from("/var/lib/archives"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = parse_config("[cloning]\nconcurrency = 0\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_image_quality_range() {
        assert!(parse_config("[cloning]\nimage_quality = 0\n").is_err());
        assert!(parse_config("[cloning]\nimage_quality = 101\n").is_err());
        assert!(parse_config("[cloning]\nimage_quality = 60\n").is_ok());
    }

    #[test]
    fn test_malformed_toml() {
        let result = parse_config("[cloning\nconcurrency = 2");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_durations() {
        let storage = StorageConfig::default();
        assert_eq!(storage.retention(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(storage.delivery_grace(), Duration::from_secs(120));
    }
}
