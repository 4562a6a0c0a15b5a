//! Error types shared across the export pipeline.
//!
//! Component seams return these typed errors; the worker binary and job glue
//! wrap them in `anyhow` with context.

use thiserror::Error;

/// Failure talking to object storage or the read model.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O failed for `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object not found: {path}")]
    NotFound { path: String },

    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to (de)serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("tenant context not established: invalid tenant id `{tenant_id}`")]
    TenantContext { tenant_id: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure turning an export model into document bytes.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid template: {0}")]
    Template(String),

    #[error("template archive is missing `{0}`")]
    MissingPart(String),

    #[error("failed to read or write document archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("document I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("DOCX to ODT conversion failed: {0}")]
    Conversion(String),

    #[error("render task failed: {0}")]
    Task(String),
}

/// Failure that makes an export job unable to produce its artifact.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("contract instance `{contract_instance_id}` not found for tenant `{tenant_id}`")]
    ContractNotFound {
        tenant_id: String,
        contract_instance_id: String,
    },

    #[error("template version `{template_version_id}` not found")]
    TemplateVersionNotFound { template_version_id: String },

    #[error("read model query failed: {0}")]
    ReadModel(#[source] StorageError),

    #[error("storage operation failed: {0}")]
    Storage(#[source] StorageError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

impl ExportError {
    /// Errors that fail the same way on every attempt.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ExportError::ContractNotFound { .. }
                | ExportError::TemplateVersionNotFound { .. }
                | ExportError::ReadModel(StorageError::TenantContext { .. })
        )
    }
}
