//! The single-consumer event loop.
//!
//! One task owns the buffer and waits on three sources: inbound records, the
//! periodic ticker and the midnight ticker. Each event runs to completion
//! before the next wait, so an upload blocks ingestion for its duration and
//! the buffer needs no locking.

use crate::buffer::SpoolBuffer;
use crate::encoder::Encoder;
use crate::namer::TriggerKind;
use crate::schedule::UploadTrigger;
use crate::uploader::Uploader;
use std::marker::PhantomData;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, trace, warn};

/// Counters describing one run of the loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub records_buffered: u64,
    pub records_skipped: u64,
    pub records_dropped: u64,
    pub uploads_succeeded: u64,
    pub uploads_failed: u64,
}

pub struct Pipeline<R, E> {
    buffer: SpoolBuffer,
    uploader: Uploader,
    trigger: UploadTrigger,
    encoder: E,
    flush_on_shutdown: bool,
    summary: RunSummary,
    _record: PhantomData<fn(R)>,
}

impl<R, E> Pipeline<R, E>
where
    E: Encoder<R>,
{
    pub fn new(buffer: SpoolBuffer, uploader: Uploader, trigger: UploadTrigger, encoder: E) -> Self {
        Self {
            buffer,
            uploader,
            trigger,
            encoder,
            flush_on_shutdown: false,
            summary: RunSummary::default(),
            _record: PhantomData,
        }
    }

    /// Upload whatever is pending once the inbound channel closes
    pub fn flush_on_shutdown(mut self, enabled: bool) -> Self {
        self.flush_on_shutdown = enabled;
        self
    }

    /// Run until the inbound channel closes.
    ///
    /// No error ends the loop; every failure is logged and the next event is
    /// awaited.
    #[instrument(skip_all, fields(buffer_file = %self.buffer.file_path().display()))]
    pub async fn run(mut self, mut inbound: mpsc::Receiver<R>) -> RunSummary {
        info!("Starting spool pipeline");

        loop {
            tokio::select! {
                record = inbound.recv() => match record {
                    Some(record) => self.handle_record(record).await,
                    None => break,
                },
                kind = self.trigger.tick() => {
                    match kind {
                        TriggerKind::Periodic => info!("Ticker fired, uploading payload"),
                        TriggerKind::Midnight => info!("Midnight ticker fired, uploading payload"),
                    }
                    self.handle_upload(kind).await;
                }
            }
        }

        self.shutdown().await;
        self.summary
    }

    async fn handle_record(&mut self, record: R) {
        let bytes = match self.encoder.encode(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Error encoding record");
                self.summary.records_dropped += 1;
                metrics::counter!("s3_spool.records.dropped", "reason" => "encode").increment(1);
                return;
            }
        };

        if bytes.is_empty() {
            self.summary.records_skipped += 1;
            return;
        }

        if let Err(e) = self.buffer.append(&bytes).await {
            warn!(error = %e, "Unable to write to buffer");
            self.summary.records_dropped += 1;
            metrics::counter!("s3_spool.records.dropped", "reason" => "buffer").increment(1);
            return;
        }

        self.summary.records_buffered += 1;
        metrics::counter!("s3_spool.records.buffered").increment(1);
        trace!(size_bytes = bytes.len(), "Record buffered and released");
        drop(record);
    }

    async fn handle_upload(&mut self, kind: TriggerKind) {
        info!(
            trigger = kind.as_str(),
            memory_bytes = self.buffer.memory_len(),
            "Upload starting"
        );

        match self.uploader.upload(&mut self.buffer, kind).await {
            Ok(receipt) => {
                self.summary.uploads_succeeded += 1;
                info!(
                    key = %receipt.key,
                    size_bytes = receipt.size_bytes,
                    content_type = receipt.content_type,
                    "Payload uploaded successfully"
                );
                self.buffer.clear_memory();
            }
            Err(e) if e.is_nothing_to_upload() => {
                debug!(trigger = kind.as_str(), "Nothing to upload");
            }
            Err(e) => {
                self.summary.uploads_failed += 1;
                warn!(error = %e, trigger = kind.as_str(), "Unable to upload payload");
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.flush_on_shutdown {
            info!("Input closed, flushing pending payload");
            self.handle_upload(TriggerKind::Periodic).await;
        } else if let Err(e) = self.buffer.spill_to_disk().await {
            warn!(
                error = %e,
                memory_bytes = self.buffer.memory_len(),
                "Unable to persist in-memory buffer on shutdown"
            );
        }

        info!(
            records_buffered = self.summary.records_buffered,
            records_dropped = self.summary.records_dropped,
            uploads_succeeded = self.summary.uploads_succeeded,
            uploads_failed = self.summary.uploads_failed,
            "Shutting down spool pipeline"
        );
    }
}
