//! Telemetry and structured logging for the export worker.

use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};

use crate::autoscaler::ScaleEvent;
use crate::job::{ExportJob, JobStatus};

const TRACER_NAME: &str = "contract-export-worker";

/// Jobs slower than this are logged as a warning.
const SLOW_JOB_THRESHOLD_MS: i64 = 5000;

/// Records telemetry for a completed or failed job.
///
/// Emits a `contract_export_job` span and a structured log line carrying the
/// job's status, cache outcome, retry count and duration.
pub fn record_job_telemetry(job: &ExportJob) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("contract_export_job");

    span.set_attribute(KeyValue::new("job_id", job.job_id.clone()));
    span.set_attribute(KeyValue::new("tenant_id", job.tenant_id.clone()));
    span.set_attribute(KeyValue::new("contract_instance_id", job.contract_instance_id.clone()));
    span.set_attribute(KeyValue::new("format", job.format.to_string()));
    span.set_attribute(KeyValue::new("status", job.status.to_string()));
    span.set_attribute(KeyValue::new("retry_count", job.retry_count as i64));
    if let Some(cache_hit) = job.cache_hit {
        span.set_attribute(KeyValue::new("cache_hit", cache_hit));
    }

    if let Some(duration_ms) = job.processing_duration_ms() {
        span.set_attribute(KeyValue::new("duration_ms", duration_ms));

        info!(
            job_id = %job.job_id,
            tenant_id = %job.tenant_id,
            duration_ms = duration_ms,
            status = %job.status,
            cache_hit = ?job.cache_hit,
            "Contract export job finished"
        );

        if duration_ms > SLOW_JOB_THRESHOLD_MS {
            warn!(
                job_id = %job.job_id,
                duration_ms = duration_ms,
                "Contract export exceeded performance threshold (5000ms)"
            );
        }
    }

    if job.status == JobStatus::Failed {
        if let Some(ref error) = job.error {
            span.set_attribute(KeyValue::new("error", error.clone()));
            warn!(
                job_id = %job.job_id,
                error = %error,
                retry_count = job.retry_count,
                "Contract export job failed"
            );
        }
    }

    span.end();
}

/// Records a worker heartbeat with the current queue length.
pub fn record_worker_heartbeat(queue_length: usize) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_heartbeat");

    span.set_attribute(KeyValue::new("queue_length", queue_length as i64));
    span.end();

    info!(queue_length = queue_length, "Worker heartbeat");
}

/// Records one autoscaler decision. Registered as a scale listener.
pub fn record_scale_event(event: &ScaleEvent) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("autoscaler_scale");

    span.set_attribute(KeyValue::new("direction", event.direction.to_string()));
    span.set_attribute(KeyValue::new("previous_concurrency", event.previous_concurrency as i64));
    span.set_attribute(KeyValue::new("new_concurrency", event.new_concurrency as i64));
    span.set_attribute(KeyValue::new("queue_depth", event.queue_depth as i64));
    span.end();
}

/// Initializes OpenTelemetry with the OTLP exporter.
///
/// Call once at startup, inside the Tokio runtime. Reads:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` - collector endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME` - service name (default: contract-export-worker)
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| TRACER_NAME.to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!(endpoint = %endpoint, "Telemetry initialized");
    Ok(())
}

/// Flushes pending spans. Call once during shutdown.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoscaler::ScaleDirection;
    use crate::cache_key::ExportFormat;
    use chrono::Utc;

    // Without `init_telemetry` the global tracer is a no-op; these only
    // exercise the attribute plumbing.

    fn job() -> ExportJob {
        ExportJob::new(
            "tenant-a".to_string(),
            "ci-123".to_string(),
            None,
            ExportFormat::Docx,
        )
    }

    #[test]
    fn test_record_completed_job() {
        let mut job = job();
        job.mark_complete(false, "abc".to_string());
        record_job_telemetry(&job);
    }

    #[test]
    fn test_record_failed_job() {
        let mut job = job();
        job.mark_failed("Test error".to_string());
        record_job_telemetry(&job);
    }

    #[test]
    fn test_record_scale_event() {
        record_scale_event(&ScaleEvent {
            direction: ScaleDirection::Up,
            previous_concurrency: 2,
            new_concurrency: 3,
            queue_depth: 15,
            timestamp: Utc::now(),
        });
        record_worker_heartbeat(15);
    }
}
