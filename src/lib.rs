//! Asynchronous image optimization service.
//!
//! Uploads are accepted over HTTP and answered immediately with the
//! destination key the optimized artifact will live under; the CPU-bound
//! work (resize, re-encode, auto-format selection, blur placeholders,
//! watermarks) runs on a bounded worker pool. Completion fans out to an
//! object-store sink, webhook callbacks, and per-request SSE streams.

pub mod api;
pub mod blob;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod notify;
pub mod pathgen;
pub mod pool;
pub mod service;
pub mod transform;
pub mod ttl_store;

pub use blob::{BlobSink, FsBlobSink};
pub use config::Config;
pub use error::ApiError;
pub use service::OptimizationService;
pub use transform::{ImageTransformer, OptimizationOptions, OutputFormat};

/// Result type for binary-level wiring.
pub type AppResult<T> = anyhow::Result<T>;
