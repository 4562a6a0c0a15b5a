use super::*;
use pretty_assertions::assert_eq;
use std::collections::HashMap;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

#[test]
fn empty_environment_yields_documented_defaults() {
    let config = WorkerConfig::from_lookup(lookup_from(&[]));
    assert_eq!(config, WorkerConfig::default());
    assert_eq!(config.autoscaler.min_concurrency, 1);
    assert_eq!(config.autoscaler.max_concurrency, 10);
    assert_eq!(config.autoscaler.scale_up_threshold, 10);
    assert_eq!(config.autoscaler.scale_down_threshold, 3);
    assert_eq!(config.template_cache.max_capacity, 100);
    assert_eq!(config.result_cache.ttl_hours, 24);
    assert!(config.default_template_path.is_none());
}

#[test]
fn environment_overrides_each_component() {
    let config = WorkerConfig::from_lookup(lookup_from(&[
        ("REDIS_URL", "redis://cache:6379/2"),
        ("EXPORT_STORAGE_ROOT", "/var/lib/exports"),
        ("EXPORT_DEFAULT_TEMPLATE", "templates/default.docx"),
        ("EXPORT_MIN_CONCURRENCY", "2"),
        ("EXPORT_MAX_CONCURRENCY", "16"),
        ("EXPORT_COOLDOWN_MS", "1000"),
        ("TEMPLATE_CACHE_MEMORY_LIMIT_BYTES", "1048576"),
        ("RESULT_CACHE_TTL_HOURS", "6"),
    ]));

    assert_eq!(config.redis_url, "redis://cache:6379/2");
    assert_eq!(config.storage_root, PathBuf::from("/var/lib/exports"));
    assert_eq!(config.default_template_path.as_deref(), Some("templates/default.docx"));
    assert_eq!(config.autoscaler.min_concurrency, 2);
    assert_eq!(config.autoscaler.max_concurrency, 16);
    assert_eq!(config.autoscaler.cooldown(), Duration::from_secs(1));
    assert_eq!(config.template_cache.memory_limit_bytes, 1_048_576);
    assert_eq!(config.result_cache.ttl_hours, 6);
}

#[test]
fn unparseable_values_keep_defaults() {
    let config = WorkerConfig::from_lookup(lookup_from(&[
        ("EXPORT_MAX_CONCURRENCY", "lots"),
        ("RESULT_CACHE_TTL_HOURS", "-3"),
        ("REDIS_URL", "   "),
    ]));
    assert_eq!(config.autoscaler.max_concurrency, 10);
    assert_eq!(config.result_cache.ttl_hours, 24);
    assert_eq!(config.redis_url, "redis://127.0.0.1/");
}

#[test]
fn inverted_concurrency_bounds_fall_back_to_defaults() {
    let config = WorkerConfig::from_lookup(lookup_from(&[
        ("EXPORT_MIN_CONCURRENCY", "5"),
        ("EXPORT_MAX_CONCURRENCY", "3"),
        ("EXPORT_COOLDOWN_MS", "1000"),
    ]));
    assert_eq!(config.autoscaler.min_concurrency, 1);
    assert_eq!(config.autoscaler.max_concurrency, 10);
    assert_eq!(config.autoscaler.cooldown_ms, 1000);
}

#[test]
fn zero_poll_interval_falls_back_to_default() {
    let config = WorkerConfig::from_lookup(lookup_from(&[("EXPORT_POLL_INTERVAL_MS", "0")]));
    assert_eq!(config.autoscaler.poll_interval(), Duration::from_secs(5));
}

#[test]
fn valid_autoscaler_settings_pass_validation_unchanged() {
    let config = AutoScalerConfig {
        min_concurrency: 4,
        max_concurrency: 4,
        poll_interval_ms: 250,
        ..Default::default()
    };
    assert_eq!(config.clone().validated(), config);
}
