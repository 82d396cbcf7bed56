//! In-place compression of the buffer file.
//!
//! A compressor rewrites the file at a given path so that, on success, the
//! compressed artifact sits at the very same path. On failure the original
//! file must be left exactly as it was.

use async_trait::async_trait;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Errors raised by an external compression step
#[derive(Error, Debug)]
pub enum CompressError {
    #[error("Failed to run compression program {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Compression program {program} exited with {status}: {stderr}")]
    ToolFailed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("Failed to move compressed artifact back to {}: {source}", .path.display())]
    Rename {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[async_trait]
pub trait Compressor: Send + Sync {
    /// Compress the file at `path`, leaving the result under the same path.
    async fn compress(&self, path: &Path) -> Result<(), CompressError>;
}

/// Compresses by shelling out to a gzip-compatible program.
///
/// Runs `<program> -k -f <path>`, which writes `<path>.gz` and keeps the
/// original, then renames `<path>.gz` over `<path>`.
#[derive(Debug, Clone)]
pub struct GzipCommand {
    program: String,
}

impl GzipCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for GzipCommand {
    fn default() -> Self {
        Self::new("gzip")
    }
}

/// `<path>.gz`
pub fn gz_artifact_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".gz");
    PathBuf::from(name)
}

async fn remove_partial(artifact: &Path) {
    if let Err(e) = tokio::fs::remove_file(artifact).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %artifact.display(), error = %e, "Failed to remove partial artifact");
        }
    }
}

#[async_trait]
impl Compressor for GzipCommand {
    async fn compress(&self, path: &Path) -> Result<(), CompressError> {
        let artifact = gz_artifact_path(path);

        let output = Command::new(&self.program)
            .arg("-k")
            .arg("-f")
            .arg(path)
            .output()
            .await
            .map_err(|source| CompressError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            remove_partial(&artifact).await;
            return Err(CompressError::ToolFailed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        if let Err(source) = tokio::fs::rename(&artifact, path).await {
            remove_partial(&artifact).await;
            return Err(CompressError::Rename {
                path: path.to_path_buf(),
                source,
            });
        }

        debug!(path = %path.display(), program = %self.program, "Compressed in place");
        Ok(())
    }
}
