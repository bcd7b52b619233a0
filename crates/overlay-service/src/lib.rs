//! Serves merged (baseline + overlay) source files and records new edits.

pub mod cache;
pub mod error;
pub mod service;
pub mod types;

pub use cache::{CacheKey, MergeCache};
pub use error::ServiceError;
pub use service::OverlayService;
pub use types::{EditMeta, MergeOptions, MergeResult, ProcessedResult, SnapshotDescriptor};
