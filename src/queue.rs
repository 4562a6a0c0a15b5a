//! Redis-based job queue for contract export tasks.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use tracing::{debug, error, info};

use crate::autoscaler::QueueDepthProvider;
use crate::job::ExportJob;

/// Queue name for contract export jobs.
pub const QUEUE_KEY: &str = "contracts:export:queue";

/// Status key prefix for job status tracking.
pub const STATUS_KEY_PREFIX: &str = "contracts:export:status";

/// Job TTL in seconds (24 hours).
const JOB_TTL_SECONDS: u64 = 86400;

/// Seconds `dequeue` blocks waiting for a job.
const DEQUEUE_TIMEOUT_SECS: f64 = 5.0;

pub fn status_key(job_id: &str) -> String {
    format!("{}:{}", STATUS_KEY_PREFIX, job_id)
}

/// Redis-based job queue manager.
///
/// Jobs are stored as JSON in a Redis list (FIFO), with separate status keys
/// that clients poll. The connection manager is cloned per command, so one
/// queue can be shared between the dispatcher, job tasks and the autoscaler.
#[derive(Clone)]
pub struct JobQueue {
    conn: ConnectionManager,
}

impl JobQueue {
    /// Creates a new job queue with the given Redis connection.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Enqueues an export job and writes its status key (expires after 24h).
    pub async fn enqueue(&self, job: &ExportJob) -> Result<()> {
        let job_json = serde_json::to_string(job).context("Failed to serialize job")?;
        let mut conn = self.conn.clone();

        // RPUSH + BLPOP gives FIFO order
        conn.rpush::<_, _, ()>(QUEUE_KEY, &job_json)
            .await
            .context("Failed to push job to queue")?;

        conn.set_ex::<_, _, ()>(status_key(&job.job_id), &job_json, JOB_TTL_SECONDS)
            .await
            .context("Failed to set job status")?;

        info!(
            job_id = %job.job_id,
            tenant_id = %job.tenant_id,
            contract_instance_id = %job.contract_instance_id,
            format = %job.format,
            "Enqueued export job"
        );
        Ok(())
    }

    /// Dequeues the next job, waiting up to five seconds.
    ///
    /// Returns `Ok(None)` when no job arrived within the timeout.
    pub async fn dequeue(&self) -> Result<Option<ExportJob>> {
        let mut conn = self.conn.clone();
        let result: Option<(String, String)> = conn
            .blpop(QUEUE_KEY, DEQUEUE_TIMEOUT_SECS)
            .await
            .context("Failed to pop job from queue")?;

        match result {
            Some((_key, job_json)) => {
                let job: ExportJob =
                    serde_json::from_str(&job_json).context("Failed to deserialize job")?;
                debug!(job_id = %job.job_id, "Dequeued job");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Writes the job's current state to its status key.
    pub async fn update_status(&self, job: &ExportJob) -> Result<()> {
        let job_json = serde_json::to_string(job).context("Failed to serialize job status")?;
        let mut conn = self.conn.clone();

        conn.set_ex::<_, _, ()>(status_key(&job.job_id), &job_json, JOB_TTL_SECONDS)
            .await
            .context("Failed to update job status")?;

        debug!(job_id = %job.job_id, status = %job.status, "Updated job status");
        Ok(())
    }

    /// Gets the current status of a job by ID, `None` once it has expired.
    pub async fn get_status(&self, job_id: &str) -> Result<Option<ExportJob>> {
        let mut conn = self.conn.clone();
        let job_json: Option<String> = conn
            .get(status_key(job_id))
            .await
            .context("Failed to get job status")?;

        job_json
            .map(|json| serde_json::from_str(&json).context("Failed to deserialize job status"))
            .transpose()
    }

    /// Re-enqueues a failed job if it has retries left.
    ///
    /// Returns `Ok(false)` once retries are exhausted; the job's status key
    /// then holds the final failure.
    pub async fn retry_job(&self, mut job: ExportJob) -> Result<bool> {
        if job.retry() {
            self.enqueue(&job).await?;
            Ok(true)
        } else {
            self.update_status(&job).await?;
            error!(
                job_id = %job.job_id,
                error = ?job.error,
                "Job failed after max retries"
            );
            Ok(false)
        }
    }

    /// Returns the current queue length.
    pub async fn queue_length(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn
            .llen(QUEUE_KEY)
            .await
            .context("Failed to get queue length")?;
        Ok(len)
    }
}

/// Where job progress is published for status readers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStatusStore: Send + Sync {
    async fn update_status(&self, job: &ExportJob) -> Result<()>;

    /// Re-enqueues `job` if it has retries left; `Ok(false)` once exhausted.
    async fn retry_job(&self, job: ExportJob) -> Result<bool>;
}

#[async_trait]
impl JobStatusStore for JobQueue {
    async fn update_status(&self, job: &ExportJob) -> Result<()> {
        JobQueue::update_status(self, job).await
    }

    async fn retry_job(&self, job: ExportJob) -> Result<bool> {
        JobQueue::retry_job(self, job).await
    }
}

#[async_trait]
impl QueueDepthProvider for JobQueue {
    async fn queue_depth(&self) -> Result<usize> {
        self.queue_length().await
    }
}
