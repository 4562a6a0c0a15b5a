//! Startup pre-warm of the template cache.

use serde::Serialize;
use tracing::{info, warn};

use crate::read_model::ReadModel;
use crate::storage::ObjectStore;
use crate::template_cache::SharedTemplateCache;

/// Outcome of a pre-warm run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PreWarmReport {
    /// Templates returned by the export-frequency query.
    pub requested: usize,
    pub loaded: usize,
    pub failed: usize,
}

/// Loads the `limit` most exported templates into `cache`, one at a time.
///
/// Never fails: a query error or an empty history yields an empty report and
/// a template that cannot be read is logged and skipped.
pub async fn pre_warm_templates(
    read_model: &dyn ReadModel,
    store: &dyn ObjectStore,
    cache: &SharedTemplateCache,
    limit: usize,
) -> PreWarmReport {
    let usages = match read_model.top_templates_by_exports(limit).await {
        Ok(usages) => usages,
        Err(e) => {
            warn!(error = %e, "Template pre-warm skipped: export history unavailable");
            return PreWarmReport::default();
        }
    };
    if usages.is_empty() {
        info!("Template pre-warm skipped: no export history");
        return PreWarmReport::default();
    }

    let mut report = PreWarmReport {
        requested: usages.len(),
        ..Default::default()
    };
    for usage in usages {
        if cache.has(&usage.template_path) {
            report.loaded += 1;
            continue;
        }
        match store.get(&usage.template_path).await {
            Ok(buffer) => {
                let bytes = buffer.len();
                cache.set(&usage.template_path, buffer, None);
                if cache.has(&usage.template_path) {
                    report.loaded += 1;
                } else {
                    warn!(
                        template_path = %usage.template_path,
                        bytes,
                        "Template exceeds the template cache memory limit, not pre-warmed"
                    );
                    report.failed += 1;
                }
            }
            Err(e) => {
                warn!(
                    template_version_id = %usage.template_version_id,
                    template_path = %usage.template_path,
                    error = %e,
                    "Failed to pre-warm template"
                );
                report.failed += 1;
            }
        }
    }

    info!(
        requested = report.requested,
        loaded = report.loaded,
        failed = report.failed,
        "Template pre-warm finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemplateCacheConfig;
    use crate::error::StorageError;
    use crate::read_model::{MockReadModel, TemplateUsage};
    use crate::storage::MemoryObjectStore;
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn usage(id: &str, path: &str, count: u64) -> TemplateUsage {
        TemplateUsage {
            template_version_id: id.to_string(),
            template_path: path.to_string(),
            export_count: count,
        }
    }

    #[tokio::test]
    async fn test_loads_top_templates_and_skips_failures() {
        let mut read_model = MockReadModel::new();
        read_model
            .expect_top_templates_by_exports()
            .with(eq(20))
            .times(1)
            .returning(|_| {
                Ok(vec![
                    usage("tv-1", "templates/a.docx", 9),
                    usage("tv-2", "templates/missing.docx", 5),
                    usage("tv-3", "templates/b.docx", 2),
                ])
            });
        let store = MemoryObjectStore::new();
        store.put("templates/a.docx", b"A".to_vec(), HashMap::new()).await.unwrap();
        store.put("templates/b.docx", b"B".to_vec(), HashMap::new()).await.unwrap();
        let cache = SharedTemplateCache::new(&TemplateCacheConfig::default());

        let report = pre_warm_templates(&read_model, &store, &cache, 20).await;

        assert_eq!(
            report,
            PreWarmReport {
                requested: 3,
                loaded: 2,
                failed: 1
            }
        );
        assert_eq!(cache.get("templates/a.docx").as_deref(), Some(b"A".as_slice()));
        assert_eq!(cache.get("templates/b.docx").as_deref(), Some(b"B".as_slice()));
        assert!(!cache.has("templates/missing.docx"));
    }

    #[tokio::test]
    async fn test_template_over_memory_limit_is_not_counted_as_loaded() {
        let mut read_model = MockReadModel::new();
        read_model.expect_top_templates_by_exports().returning(|_| {
            Ok(vec![
                usage("tv-1", "templates/huge.docx", 7),
                usage("tv-2", "templates/small.docx", 3),
            ])
        });
        let store = MemoryObjectStore::new();
        store.put("templates/small.docx", vec![1; 8], HashMap::new()).await.unwrap();
        store.put("templates/huge.docx", vec![2; 64], HashMap::new()).await.unwrap();
        let cache = SharedTemplateCache::new(&TemplateCacheConfig {
            memory_limit_bytes: 32,
            ..Default::default()
        });

        let report = pre_warm_templates(&read_model, &store, &cache, 20).await;

        assert_eq!(
            report,
            PreWarmReport {
                requested: 2,
                loaded: 1,
                failed: 1
            }
        );
        assert!(cache.has("templates/small.docx"));
        assert!(!cache.has("templates/huge.docx"));
    }

    #[tokio::test]
    async fn test_query_failure_is_swallowed() {
        let mut read_model = MockReadModel::new();
        read_model
            .expect_top_templates_by_exports()
            .returning(|_| Err(StorageError::Backend("read model offline".to_string())));
        let store = MemoryObjectStore::new();
        let cache = SharedTemplateCache::new(&TemplateCacheConfig::default());

        let report = pre_warm_templates(&read_model, &store, &cache, 20).await;

        assert_eq!(report, PreWarmReport::default());
        assert_eq!(cache.stats().entry_count, 0);
    }

    #[tokio::test]
    async fn test_empty_history_loads_nothing() {
        let mut read_model = MockReadModel::new();
        read_model.expect_top_templates_by_exports().returning(|_| Ok(vec![]));
        let store = MemoryObjectStore::new();
        let cache = SharedTemplateCache::new(&TemplateCacheConfig::default());

        let report = pre_warm_templates(&read_model, &store, &cache, 5).await;

        assert_eq!(report.requested, 0);
        assert_eq!(store.body_reads(), 0);
    }
}
