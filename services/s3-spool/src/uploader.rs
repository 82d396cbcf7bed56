use crate::buffer::{BufferError, SpoolBuffer};
use crate::clock::Clock;
use crate::namer::{ObjectNamer, TriggerKind};
use crate::store::{Acl, ObjectStore, StoreError};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Outcome of a failed flush-and-upload cycle
#[derive(Error, Debug)]
pub enum FlushError {
    #[error("Nothing to upload")]
    NothingToUpload,

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FlushError {
    /// An empty buffer is expected on quiet periods and is not a failure
    pub fn is_nothing_to_upload(&self) -> bool {
        matches!(self, FlushError::NothingToUpload)
    }
}

/// A completed upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub key: String,
    pub size_bytes: usize,
    pub content_type: &'static str,
}

/// Drains a [`SpoolBuffer`] into the object store.
///
/// Every cycle runs spill, compress, read, put and then discard. Any
/// failure leaves the buffer file where it is so the next trigger retries it.
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    namer: ObjectNamer,
    clock: Arc<dyn Clock>,
    acl: Acl,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, namer: ObjectNamer, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            namer,
            clock,
            acl: Acl::PublicRead,
        }
    }

    pub fn with_acl(mut self, acl: Acl) -> Self {
        self.acl = acl;
        self
    }

    #[instrument(skip(self, buffer, trigger), fields(trigger = trigger.as_str()))]
    pub async fn upload(
        &self,
        buffer: &mut SpoolBuffer,
        trigger: TriggerKind,
    ) -> Result<UploadReceipt, FlushError> {
        if buffer.is_drained().await? {
            return Err(FlushError::NothingToUpload);
        }

        // The file becomes the single source of truth for this cycle
        buffer.spill_to_disk().await?;
        buffer.seal().await?;

        debug!(path = %buffer.file_path().display(), "Reading buffer file for upload");
        let body = buffer.read_file().await?;
        let size_bytes = body.len();

        let key = self.namer.object_key(self.clock.now().naive_local(), trigger);
        let content_type = self.namer.content_type();

        let started = Instant::now();
        let result = self.store.put(&key, body, content_type, self.acl).await;
        metrics::histogram!("s3_spool.upload.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        if let Err(e) = result {
            metrics::counter!("s3_spool.uploads.failed").increment(1);
            return Err(e.into());
        }

        info!(key = %key, "Upload finished, removing buffer file on disk");
        buffer.discard().await?;

        metrics::counter!("s3_spool.uploads.succeeded").increment(1);
        metrics::counter!("s3_spool.bytes.uploaded").increment(size_bytes as u64);

        Ok(UploadReceipt {
            key,
            size_bytes,
            content_type,
        })
    }
}
