//! Job dispatch with a resizable concurrency limit.

use anyhow::Context;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::autoscaler::ConcurrencyHandler;
use crate::job::ExportJob;
use crate::lock::mutex_lock;
use crate::pipeline::ExportPipeline;
use crate::queue::{JobQueue, JobStatusStore};
use crate::telemetry;

const SOURCE: &str = "worker";

/// Pause after a failed dequeue before asking Redis again.
const DEQUEUE_BACKOFF: Duration = Duration::from_secs(5);

/// Heartbeat every this many dispatched jobs.
const HEARTBEAT_EVERY: u64 = 10;

/// Semaphore whose permit count follows the autoscaler's recommendation.
///
/// Growing adds permits at once. Shrinking retires permits: idle ones
/// immediately, the rest as in-flight jobs finish.
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: Mutex<usize>,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit: Mutex::new(limit),
        }
    }

    pub fn limit(&self) -> usize {
        *mutex_lock(&self.limit, SOURCE, "limit")
    }

    /// Permits not currently held by a job.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        Arc::clone(&self.semaphore).acquire_owned().await
    }

    fn retire(&self, count: usize) -> anyhow::Result<()> {
        let count = u32::try_from(count).context("Concurrency change too large")?;
        match Arc::clone(&self.semaphore).try_acquire_many_owned(count) {
            Ok(permits) => permits.forget(),
            Err(_) => {
                let semaphore = Arc::clone(&self.semaphore);
                tokio::spawn(async move {
                    if let Ok(permits) = semaphore.acquire_many_owned(count).await {
                        permits.forget();
                        debug!(count, "Retired permits after in-flight jobs finished");
                    }
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ConcurrencyHandler for ConcurrencyLimiter {
    async fn set_concurrency(&self, concurrency: usize) -> anyhow::Result<()> {
        let mut limit = mutex_lock(&self.limit, SOURCE, "set_concurrency");
        if concurrency > *limit {
            self.semaphore.add_permits(concurrency - *limit);
        } else if concurrency < *limit {
            self.retire(*limit - concurrency)?;
        }
        *limit = concurrency;
        Ok(())
    }
}

/// Pulls jobs off the queue while a permit is free and runs them.
pub struct Worker {
    queue: JobQueue,
    pipeline: Arc<ExportPipeline>,
    limiter: Arc<ConcurrencyLimiter>,
}

impl Worker {
    pub fn new(queue: JobQueue, pipeline: Arc<ExportPipeline>, limiter: Arc<ConcurrencyLimiter>) -> Self {
        Self {
            queue,
            pipeline,
            limiter,
        }
    }

    /// Dispatches until `shutdown` fires, then waits for in-flight jobs.
    ///
    /// A permit is taken before dequeuing so no job leaves the queue without
    /// a slot to run in. An in-progress dequeue is allowed to finish (at most
    /// five seconds) so a popped job is never dropped.
    pub async fn run(&self, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        let mut dispatched: u64 = 0;

        info!(concurrency = self.limiter.limit(), "Dispatcher started");

        while !shutdown.is_cancelled() {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.limiter.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = match self.queue.dequeue().await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "Failed to dequeue job");
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(DEQUEUE_BACKOFF) => {}
                    }
                    continue;
                }
            };

            let queue = self.queue.clone();
            let pipeline = Arc::clone(&self.pipeline);
            tracker.spawn(async move {
                process_job(job, &queue, &pipeline).await;
                drop(permit);
            });

            dispatched += 1;
            if dispatched % HEARTBEAT_EVERY == 0 {
                if let Ok(queue_len) = self.queue.queue_length().await {
                    telemetry::record_worker_heartbeat(queue_len);
                }
            }
        }

        info!(in_flight = tracker.len(), "Dispatcher stopping, waiting for in-flight jobs");
        tracker.close();
        tracker.wait().await;
        info!("Dispatcher stopped");
    }
}

/// Runs one job through the pipeline and publishes its status.
///
/// Failures are retried up to three times unless they cannot succeed on a
/// later attempt. Returns the job in its final local state.
pub async fn process_job(
    mut job: ExportJob,
    status: &dyn JobStatusStore,
    pipeline: &ExportPipeline,
) -> ExportJob {
    info!(
        job_id = %job.job_id,
        tenant_id = %job.tenant_id,
        contract_instance_id = %job.contract_instance_id,
        format = %job.format,
        retry_count = job.retry_count,
        "Processing export job"
    );

    job.start_processing();
    if let Err(e) = status.update_status(&job).await {
        error!(job_id = %job.job_id, error = %format!("{e:#}"), "Failed to update job status");
    }

    match pipeline.process(&job).await {
        Ok(outcome) => {
            job.mark_complete(outcome.cache_hit, outcome.cache_key);
            if let Err(e) = status.update_status(&job).await {
                error!(job_id = %job.job_id, error = %format!("{e:#}"), "Failed to update job status");
            }
        }
        Err(e) => {
            let permanent = e.is_permanent();
            error!(job_id = %job.job_id, error = %e, permanent, "Export job failed");
            job.mark_failed(e.to_string());

            if permanent {
                if let Err(e) = status.update_status(&job).await {
                    error!(job_id = %job.job_id, error = %format!("{e:#}"), "Failed to update job status");
                }
            } else {
                match status.retry_job(job.clone()).await {
                    Ok(true) => info!(
                        job_id = %job.job_id,
                        retry_count = job.retry_count + 1,
                        "Job re-queued for retry"
                    ),
                    Ok(false) => warn!(job_id = %job.job_id, "Job failed permanently, max retries exceeded"),
                    Err(e) => error!(job_id = %job.job_id, error = %format!("{e:#}"), "Failed to retry job"),
                }
            }
        }
    }

    telemetry::record_job_telemetry(&job);
    job
}
