//! Job models and state management for the contract export queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::cache_key::ExportFormat;

/// Attempts after the first before a job is failed for good.
pub const MAX_RETRIES: u8 = 3;

/// Contract export job request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub job_id: String,
    pub tenant_id: String,
    pub contract_instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style_template_id: Option<String>,
    pub format: ExportFormat,
    /// Where the finished document is delivered.
    pub result_path: String,
    pub status: JobStatus,
    pub retry_count: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Complete,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Delivery path of a job's document: `{tenantId}/exports/{jobId}.{format}`.
pub fn delivery_path(tenant_id: &str, job_id: &str, format: ExportFormat) -> String {
    format!("{tenant_id}/exports/{job_id}.{}", format.extension())
}

impl ExportJob {
    pub fn new(
        tenant_id: String,
        contract_instance_id: String,
        style_template_id: Option<String>,
        format: ExportFormat,
    ) -> Self {
        let now = Utc::now();
        let job_id = Uuid::new_v4().to_string();
        Self {
            result_path: delivery_path(&tenant_id, &job_id, format),
            job_id,
            tenant_id,
            contract_instance_id,
            style_template_id,
            format,
            status: JobStatus::Queued,
            retry_count: 0,
            cache_hit: None,
            cache_key: None,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn start_processing(&mut self) {
        self.status = JobStatus::Processing;
        self.updated_at = Utc::now();
    }

    pub fn mark_complete(&mut self, cache_hit: bool, cache_key: String) {
        self.status = JobStatus::Complete;
        self.updated_at = Utc::now();
        self.cache_hit = Some(cache_hit);
        self.cache_key = Some(cache_key);
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.updated_at = Utc::now();
        self.error = Some(error);
    }

    /// Puts the job back into `Queued` if it has retries left. The last error
    /// is kept so status readers can see why the job is being retried.
    pub fn retry(&mut self) -> bool {
        if self.retry_count < MAX_RETRIES {
            self.retry_count += 1;
            self.status = JobStatus::Queued;
            self.updated_at = Utc::now();
            true
        } else {
            let last = self.error.take().unwrap_or_default();
            self.mark_failed(format!("Max retries exceeded: {last}"));
            false
        }
    }

    pub fn processing_duration_ms(&self) -> Option<i64> {
        if self.status == JobStatus::Complete || self.status == JobStatus::Failed {
            Some(self.updated_at.signed_duration_since(self.created_at).num_milliseconds())
        } else {
            None
        }
    }
}
