//! S3 Spool
//!
//! Accumulates a continuous stream of records into batches and ships each
//! batch to S3 on a schedule. Ingestion stays fast because records only touch
//! memory and, past a size limit, a local buffer file; the slow network upload
//! happens on a timer.
//!
//! ## Features
//!
//! - **Durable buffering**: a single append-only buffer file per bucket and
//!   prefix survives restarts and is deleted only after a confirmed upload
//! - **Dual triggers**: a fixed-interval ticker plus a midnight ticker that
//!   dates the day's last batch to the day that just ended
//! - **In-place compression**: the buffer file is gzipped once before upload
//!   and never compressed twice across retries
//! - **Implicit retry**: a failed upload leaves everything on disk for the
//!   next trigger
//!
//! ## Architecture
//!
//! ```text
//!  records ──▶ Encoder ──▶ SpoolBuffer ──(chunk limit)──▶ buffer file
//!                              ▲                              │
//!                              │                              ▼
//!  UploadTrigger ──tick──▶ Pipeline ──▶ Uploader ──seal/read──┘
//!  (periodic, midnight)                    │
//!                                          ▼
//!                              ObjectStore::put(key, body)
//!                              {prefix}/{date}/{timestamp}[.gz]
//! ```

pub mod buffer;
pub mod clock;
pub mod compressor;
pub mod config;
pub mod encoder;
pub mod namer;
pub mod pipeline;
pub mod schedule;
pub mod store;
pub mod uploader;

pub use buffer::{BufferError, Recovery, SpoolBuffer};
pub use clock::{Clock, FixedClock, SystemClock};
pub use compressor::{CompressError, Compressor, GzipCommand};
pub use config::{Config, ConfigError, InputFormat, OutputConfig};
pub use encoder::{EncodeError, Encoder, JsonLineEncoder, LineEncoder};
pub use namer::{ObjectNamer, TriggerKind};
pub use pipeline::{Pipeline, RunSummary};
pub use schedule::UploadTrigger;
pub use store::{Acl, ObjectStore, S3ObjectStore, StoreError};
pub use uploader::{FlushError, UploadReceipt, Uploader};
