//! Contract Export Worker Library
//!
//! Renders contract instances into DOCX or ODT documents. Exports are served
//! from a content-addressed result cache when the contract has not changed,
//! templates are kept in an in-process LRU cache, and an autoscaler adjusts
//! worker concurrency to the queue depth.
//!
//! ## Module Overview
//!
//! - `cache_key`: deterministic SHA-256 keys for render outputs
//! - `result_cache`: rendered documents in object storage, with TTL
//! - `template_cache`: in-process LRU/TTL cache of template buffers
//! - `prewarm`: loads the most exported templates at startup
//! - `loader`: resolves a contract instance into an export model
//! - `render`: DOCX template engine, render context and parameter substitution
//! - `converter`: DOCX to ODT conversion through LibreOffice
//! - `pipeline`: cache-aware export of one job
//! - `autoscaler`: queue-depth driven concurrency recommendations
//! - `job`, `queue`, `worker`: Redis job queue and dispatch
//! - `read_model`, `storage`: Redis read model and object storage backends
//! - `config`, `error`, `telemetry`: ambient configuration, errors and tracing
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use contract_export_worker::{
//!     cache_key::ExportFormat,
//!     config::WorkerConfig,
//!     converter::SofficeConverter,
//!     job::ExportJob,
//!     pipeline::ExportPipeline,
//!     read_model::RedisReadModel,
//!     render::{engine::DocxTemplateEngine, Renderer},
//!     storage::FsObjectStore,
//!     template_cache::SharedTemplateCache,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WorkerConfig::from_env();
//!     let client = redis::Client::open(config.redis_url.as_str())?;
//!     let conn = redis::aio::ConnectionManager::new(client).await?;
//!
//!     let pipeline = ExportPipeline::new(
//!         Arc::new(RedisReadModel::new(conn)),
//!         Arc::new(FsObjectStore::new(&config.storage_root)),
//!         Arc::new(SharedTemplateCache::new(&config.template_cache)),
//!         Renderer::new(
//!             Arc::new(DocxTemplateEngine::new()),
//!             Arc::new(SofficeConverter::new(config.soffice_bin.clone())),
//!         ),
//!         &config,
//!     );
//!
//!     let job = ExportJob::new("tenant-a".into(), "ci-1".into(), None, ExportFormat::Docx);
//!     let outcome = pipeline.process(&job).await?;
//!     println!("delivered to {} (cache hit: {})", outcome.result_path, outcome.cache_hit);
//!     Ok(())
//! }
//! ```

pub mod autoscaler;
pub mod cache_key;
pub mod config;
pub mod converter;
pub mod error;
pub mod job;
pub mod loader;
mod lock;
pub mod pipeline;
pub mod prewarm;
pub mod queue;
pub mod read_model;
pub mod render;
pub mod result_cache;
pub mod storage;
pub mod telemetry;
pub mod template_cache;
pub mod worker;
