pub mod archive;
pub mod cli;
pub mod cloner;
pub mod config;
pub mod error;
pub mod extract;
pub mod fetcher;
pub mod job;
pub mod limiter;
pub mod optimize;
pub mod resolver;
pub mod rewriter;
pub mod service;
pub mod site_tree;
pub mod store;

// Re-export main types for convenience
pub use cloner::{CloneReport, WebCloner};
pub use config::ArchiverConfig;
pub use error::{CloneError, ConfigError, Result};
pub use extract::{ExtractedPage, FallbackExtractor, ResourceExtractor};
pub use job::{CloneJob, CloneOptions, JobEvent, JobStatus};
pub use limiter::ConcurrencyLimiter;
pub use resolver::PathResolver;
pub use service::CloneService;
