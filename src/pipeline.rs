//! Cache-aware export of one contract instance.
//!
//! ```text
//! cache key input -> result cache lookup
//!   hit  -> copy cached object to the delivery path
//!   miss -> load -> template (cached) -> render -> store -> copy
//! ```

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache_key::compute_cache_key;
use crate::config::WorkerConfig;
use crate::error::{ExportError, StorageError};
use crate::job::ExportJob;
use crate::loader::{DataLoader, ExportData};
use crate::read_model::ReadModel;
use crate::render::engine::builtin_template;
use crate::render::Renderer;
use crate::result_cache::ResultCache;
use crate::storage::ObjectStore;
use crate::template_cache::SharedTemplateCache;

/// Template cache key of the built-in fallback template.
const BUILTIN_TEMPLATE_KEY: &str = "builtin:contract.docx";

/// What a successful export did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOutcome {
    pub cache_hit: bool,
    pub cache_key: String,
    pub result_path: String,
    /// Size of the delivered document.
    pub bytes: usize,
}

pub struct ExportPipeline {
    loader: DataLoader,
    read_model: Arc<dyn ReadModel>,
    store: Arc<dyn ObjectStore>,
    results: ResultCache,
    templates: Arc<SharedTemplateCache>,
    renderer: Renderer,
    default_template_path: Option<String>,
}

impl ExportPipeline {
    pub fn new(
        read_model: Arc<dyn ReadModel>,
        store: Arc<dyn ObjectStore>,
        templates: Arc<SharedTemplateCache>,
        renderer: Renderer,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            loader: DataLoader::new(Arc::clone(&read_model)),
            results: ResultCache::new(Arc::clone(&store), &config.result_cache),
            read_model,
            store,
            templates,
            renderer,
            default_template_path: config.default_template_path.clone(),
        }
    }

    /// Produces the document for `job` at `job.result_path`.
    pub async fn process(&self, job: &ExportJob) -> Result<ExportOutcome, ExportError> {
        let style = job.style_template_id.as_deref();
        let input = self
            .loader
            .cache_key_input(&job.tenant_id, &job.contract_instance_id, style, job.format)
            .await?;
        let cache_key = compute_cache_key(&input);

        let lookup = self.results.lookup_key(&cache_key, job.format).await;
        if lookup.cache_hit {
            self.results
                .copy_to_result_path(&cache_key, job.format, &job.result_path)
                .await
                .map_err(ExportError::Storage)?;
            info!(job_id = %job.job_id, cache_key = %cache_key, "Served export from result cache");
            return Ok(ExportOutcome {
                cache_hit: true,
                cache_key,
                result_path: job.result_path.clone(),
                bytes: lookup.buffer.map_or(0, |buffer| buffer.len()),
            });
        }

        let data = self
            .loader
            .load(&job.tenant_id, &job.contract_instance_id, style)
            .await?;
        let (template, template_path) = self.template_for(&data).await?;
        let document = self.renderer.render(&data, template, job.format).await?;
        let bytes = document.len();

        self.results.store(&cache_key, job.format, document).await;
        self.results
            .copy_to_result_path(&cache_key, job.format, &job.result_path)
            .await
            .map_err(ExportError::Storage)?;

        if let Some(path) = template_path {
            if let Err(e) = self.read_model.record_export(&data.template_version_id, &path).await {
                warn!(
                    template_version_id = %data.template_version_id,
                    error = %e,
                    "Failed to record export frequency"
                );
            }
        }

        info!(job_id = %job.job_id, cache_key = %cache_key, bytes, "Rendered export");
        Ok(ExportOutcome {
            cache_hit: false,
            cache_key,
            result_path: job.result_path.clone(),
            bytes,
        })
    }

    /// Picks the style template, then the configured default, then the
    /// built-in template. Returns the buffer and its object path, if stored.
    async fn template_for(&self, data: &ExportData) -> Result<(Arc<[u8]>, Option<String>), ExportError> {
        if let Some(path) = data.style_template_path.as_deref() {
            match self.load_template(path).await {
                Ok(buffer) => return Ok((buffer, Some(path.to_string()))),
                Err(e) => warn!(
                    template_path = %path,
                    error = %e,
                    "Style template unavailable, using default template"
                ),
            }
        }

        match self.default_template_path.as_deref() {
            Some(path) => {
                let buffer = self.load_template(path).await.map_err(ExportError::Storage)?;
                Ok((buffer, Some(path.to_string())))
            }
            None => {
                debug!("Using built-in template");
                let buffer = self
                    .templates
                    .get_or_load(BUILTIN_TEMPLATE_KEY, || async { builtin_template() })
                    .await?;
                Ok((buffer, None))
            }
        }
    }

    async fn load_template(&self, path: &str) -> Result<Arc<[u8]>, StorageError> {
        self.templates
            .get_or_load(path, || self.store.get(path))
            .await
    }
}
