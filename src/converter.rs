//! DOCX to ODT conversion through a headless office suite.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::RenderError;

/// Converts rendered DOCX bytes into ODT bytes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OdtConverter: Send + Sync {
    async fn convert(&self, docx: Vec<u8>) -> Result<Vec<u8>, RenderError>;
}

/// Runs `soffice --headless --convert-to odt` in a scratch directory.
pub struct SofficeConverter {
    binary: String,
}

impl SofficeConverter {
    /// Creates a converter invoking `binary` (usually `soffice`).
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for SofficeConverter {
    fn default() -> Self {
        Self::new("soffice")
    }
}

#[async_trait]
impl OdtConverter for SofficeConverter {
    async fn convert(&self, docx: Vec<u8>) -> Result<Vec<u8>, RenderError> {
        let scratch = tempfile::tempdir()?;
        let input = scratch.path().join("document.docx");
        let output = scratch.path().join("document.odt");
        tokio::fs::write(&input, &docx).await?;

        debug!(binary = %self.binary, bytes = docx.len(), "Converting DOCX to ODT");

        let result = Command::new(&self.binary)
            .arg("--headless")
            .arg("--convert-to")
            .arg("odt")
            .arg("--outdir")
            .arg(scratch.path())
            .arg(&input)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RenderError::Conversion(format!("failed to run {}: {e}", self.binary)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(RenderError::Conversion(format!(
                "{} exited with {}: {}",
                self.binary,
                result.status,
                stderr.trim()
            )));
        }

        let odt = tokio::fs::read(&output).await.map_err(|e| {
            RenderError::Conversion(format!("converter produced no output: {e}"))
        })?;
        info!(bytes = odt.len(), "ODT conversion complete");
        Ok(odt)
    }
}
