//! Memory buffer with a single disk spill file.
//!
//! Records accumulate in memory until the chunk limit is crossed, then the
//! whole in-memory chunk is appended to the buffer file. The buffer file is
//! the durability point: it survives restarts and is only removed after the
//! object store has acknowledged an upload of its contents.
//!
//! ```text
//! append ──▶ memory ──(len > limit)──▶ spill ──▶ <buffer_path>/<bucket><prefix>
//!                                                   │
//!                                   seal (gzip) ◀───┘  marker: <file>.sealed
//! ```
//!
//! Once sealed, the file holds a gzip stream and is never compressed again.
//! Later spills compress their chunk on its own (`<file>.part`) and append it
//! as another gzip member, which keeps the file a valid gzip stream.

use crate::compressor::{gz_artifact_path, CompressError, Compressor};
use crate::config::OutputConfig;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Buffer I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Compression(#[from] CompressError),

    #[error("Buffer file {} is gzip-compressed but compression is disabled", .path.display())]
    SealedWithoutCompression { path: PathBuf },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> BufferError + '_ {
    move |source| BufferError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// First two bytes of every gzip member
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

async fn starts_with_gzip_magic(path: &Path) -> Result<bool, BufferError> {
    let mut file = fs::File::open(path).await.map_err(io_error(path))?;
    let mut head = [0u8; 2];
    match file.read_exact(&mut head).await {
        Ok(_) => Ok(head == GZIP_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(io_error(path)(e)),
    }
}

async fn remove_if_exists(path: &Path) -> Result<bool, BufferError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error(path)(e)),
    }
}

/// What `recover` found on disk from a previous run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    /// Size of a pending buffer file, if one exists
    pub pending_bytes: Option<u64>,
    /// Whether the pending file is already compressed
    pub sealed: bool,
    /// Leftover artifacts that were removed
    pub removed_stale: usize,
}

/// In-memory chunk plus the on-disk buffer file it spills into.
///
/// Owned by exactly one pipeline; nothing here is shared across tasks.
pub struct SpoolBuffer {
    memory: Vec<u8>,
    chunk_limit: usize,
    dir: PathBuf,
    file_path: PathBuf,
    compressor: Option<Arc<dyn Compressor>>,
}

impl SpoolBuffer {
    pub fn new(
        file_path: impl Into<PathBuf>,
        chunk_limit: usize,
        compressor: Option<Arc<dyn Compressor>>,
    ) -> Self {
        let file_path = file_path.into();
        let dir = file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            memory: Vec::with_capacity(chunk_limit.min(1 << 20)),
            chunk_limit,
            dir,
            file_path,
            compressor,
        }
    }

    pub fn from_config(config: &OutputConfig, compressor: Option<Arc<dyn Compressor>>) -> Self {
        Self::new(config.buffer_file_path(), config.buffer_chunk_limit, compressor)
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn marker_path(&self) -> PathBuf {
        with_suffix(&self.file_path, ".sealed")
    }

    fn part_path(&self) -> PathBuf {
        with_suffix(&self.file_path, ".part")
    }

    /// Bytes held in memory
    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    pub fn clear_memory(&mut self) {
        self.memory.clear();
    }

    pub async fn file_exists(&self) -> Result<bool, BufferError> {
        fs::try_exists(&self.file_path)
            .await
            .map_err(io_error(&self.file_path))
    }

    /// True when neither memory nor disk holds anything to upload
    pub async fn is_drained(&self) -> Result<bool, BufferError> {
        Ok(self.memory.is_empty() && !self.file_exists().await?)
    }

    /// True when the buffer file already holds a gzip stream
    pub async fn is_sealed(&self) -> Result<bool, BufferError> {
        let marker = self.marker_path();
        fs::try_exists(&marker).await.map_err(io_error(&marker))
    }

    fn sealed_without_compression(&self) -> BufferError {
        BufferError::SealedWithoutCompression {
            path: self.file_path.clone(),
        }
    }

    /// Append an encoded record, spilling to disk if the chunk limit is crossed.
    ///
    /// Returns whether a spill happened. If the spill fails the bytes stay in
    /// memory and the error is returned.
    pub async fn append(&mut self, bytes: &[u8]) -> Result<bool, BufferError> {
        if bytes.is_empty() {
            return Ok(false);
        }

        self.memory.extend_from_slice(bytes);

        if self.memory.len() > self.chunk_limit {
            self.spill_to_disk().await?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Move the whole in-memory chunk onto the end of the buffer file.
    ///
    /// Memory is only cleared once the bytes are on disk. A failed write
    /// truncates the file back to its previous length.
    pub async fn spill_to_disk(&mut self) -> Result<(), BufferError> {
        if self.memory.is_empty() {
            return Ok(());
        }

        self.ensure_dir().await?;

        if !self.file_exists().await? {
            info!(path = %self.file_path.display(), "Creating buffer file");
        }

        let chunk = if self.is_sealed().await? {
            if self.compressor.is_none() {
                return Err(self.sealed_without_compression());
            }
            self.compress_chunk().await?
        } else {
            std::mem::take(&mut self.memory)
        };

        let result = self.append_to_file(&chunk).await;

        match result {
            Ok(()) => {
                self.memory.clear();
                metrics::counter!("s3_spool.spills").increment(1);
                debug!(
                    path = %self.file_path.display(),
                    size_bytes = chunk.len(),
                    "Spilled buffer to disk"
                );
                Ok(())
            }
            Err(e) => {
                // Put the raw bytes back when the chunk was taken uncompressed
                if self.memory.is_empty() {
                    self.memory = chunk;
                }
                Err(e)
            }
        }
    }

    async fn ensure_dir(&self) -> Result<(), BufferError> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o755);
        builder.create(&self.dir).await.map_err(io_error(&self.dir))
    }

    async fn append_to_file(&self, chunk: &[u8]) -> Result<(), BufferError> {
        let path = &self.file_path;
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o644);

        let mut file = options.open(path).await.map_err(io_error(path))?;
        let previous_len = file.metadata().await.map_err(io_error(path))?.len();

        let written = async {
            file.write_all(chunk).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;

        if let Err(e) = written {
            if let Err(truncate_err) = file.set_len(previous_len).await {
                warn!(
                    path = %path.display(),
                    error = %truncate_err,
                    "Failed to truncate buffer file after partial write"
                );
            }
            return Err(io_error(path)(e));
        }

        Ok(())
    }

    /// Compress the in-memory chunk as a standalone gzip member.
    /// Memory is left intact; the caller clears it once the member is on disk.
    async fn compress_chunk(&self) -> Result<Vec<u8>, BufferError> {
        let compressor = match self.compressor {
            Some(ref compressor) => compressor,
            None => return Err(self.sealed_without_compression()),
        };

        let part = self.part_path();
        fs::write(&part, &self.memory).await.map_err(io_error(&part))?;

        let compressed = async {
            compressor.compress(&part).await?;
            fs::read(&part).await.map_err(io_error(&part))
        }
        .await;

        remove_if_exists(&part).await?;
        compressed
    }

    /// Compress the buffer file in place unless that already happened.
    ///
    /// The marker is written before compressing and removed again if the
    /// compressor fails, so a compressed file is never left unmarked.
    /// Returns `true` if this call compressed the file.
    pub async fn seal(&self) -> Result<bool, BufferError> {
        let sealed = self.is_sealed().await?;

        let compressor = match self.compressor {
            Some(ref compressor) => compressor,
            None if sealed => return Err(self.sealed_without_compression()),
            None => return Ok(false),
        };

        if sealed {
            debug!(path = %self.file_path.display(), "Buffer file already compressed");
            return Ok(false);
        }

        let marker = self.marker_path();
        fs::File::create(&marker).await.map_err(io_error(&marker))?;

        info!(path = %self.file_path.display(), "Compressing buffer file");
        if let Err(e) = compressor.compress(&self.file_path).await {
            if let Err(remove_err) = remove_if_exists(&marker).await {
                warn!(
                    path = %marker.display(),
                    error = %remove_err,
                    "Failed to remove compression marker after failed compression"
                );
            }
            return Err(e.into());
        }

        Ok(true)
    }

    /// Read the whole buffer file
    pub async fn read_file(&self) -> Result<Vec<u8>, BufferError> {
        fs::read(&self.file_path)
            .await
            .map_err(io_error(&self.file_path))
    }

    /// Remove the buffer file and its compression marker
    pub async fn discard(&self) -> Result<(), BufferError> {
        fs::remove_file(&self.file_path)
            .await
            .map_err(io_error(&self.file_path))?;
        remove_if_exists(&self.marker_path()).await?;
        Ok(())
    }

    /// Clean up after an interrupted run and report what is still pending.
    pub async fn recover(&self) -> Result<Recovery, BufferError> {
        let mut recovery = Recovery::default();

        for stale in [gz_artifact_path(&self.file_path), self.part_path()] {
            if remove_if_exists(&stale).await? {
                warn!(path = %stale.display(), "Removed stale compression artifact");
                recovery.removed_stale += 1;
            }
        }

        let marker = self.marker_path();
        let marker_exists = fs::try_exists(&marker).await.map_err(io_error(&marker))?;

        if !self.file_exists().await? {
            if marker_exists {
                remove_if_exists(&marker).await?;
                recovery.removed_stale += 1;
            }
            return Ok(recovery);
        }

        let len = fs::metadata(&self.file_path)
            .await
            .map_err(io_error(&self.file_path))?
            .len();
        recovery.pending_bytes = Some(len);

        // A marker without a gzip file means compression never finished
        let mut sealed = marker_exists;
        if marker_exists && !starts_with_gzip_magic(&self.file_path).await? {
            warn!(
                path = %self.file_path.display(),
                "Removing compression marker left by an interrupted seal"
            );
            remove_if_exists(&marker).await?;
            recovery.removed_stale += 1;
            sealed = false;
        }
        recovery.sealed = sealed;

        if sealed && self.compressor.is_none() {
            return Err(self.sealed_without_compression());
        }

        info!(
            path = %self.file_path.display(),
            size_bytes = len,
            sealed,
            "Found pending buffer file from a previous run"
        );

        Ok(recovery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::GzipCommand;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_append_below_limit_stays_in_memory() {
        let dir = tempdir().unwrap();
        let mut buffer = SpoolBuffer::new(dir.path().join("spool").join("buf"), 16, None);

        let spilled = buffer.append(b"hello\n").await.unwrap();

        assert!(!spilled);
        assert_eq!(buffer.memory(), b"hello\n");
        assert!(!buffer.file_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_append_past_limit_spills_once() {
        let dir = tempdir().unwrap();
        let mut buffer = SpoolBuffer::new(dir.path().join("spool").join("buf"), 8, None);

        assert!(!buffer.append(b"12345").await.unwrap());
        assert!(buffer.append(b"6789").await.unwrap());

        assert_eq!(buffer.memory_len(), 0);
        assert_eq!(buffer.read_file().await.unwrap(), b"123456789");
    }

    #[tokio::test]
    async fn test_spills_append_in_order() {
        let dir = tempdir().unwrap();
        let mut buffer = SpoolBuffer::new(dir.path().join("buf"), 2, None);

        buffer.append(b"abc").await.unwrap();
        buffer.append(b"def").await.unwrap();
        buffer.append(b"g").await.unwrap();
        buffer.spill_to_disk().await.unwrap();

        assert_eq!(buffer.read_file().await.unwrap(), b"abcdefg");
    }

    #[tokio::test]
    async fn test_failed_spill_keeps_bytes_in_memory() {
        let dir = tempdir().unwrap();
        // A regular file where the buffer directory should be
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let mut buffer = SpoolBuffer::new(blocker.join("buf"), 4, None);

        buffer.append(b"ab").await.unwrap();
        let err = buffer.append(b"cdef").await.unwrap_err();

        assert!(matches!(err, BufferError::Io { .. }));
        assert_eq!(buffer.memory(), b"abcdef");
    }

    #[tokio::test]
    async fn test_empty_append_is_ignored() {
        let dir = tempdir().unwrap();
        let mut buffer = SpoolBuffer::new(dir.path().join("buf"), 0, None);

        assert!(!buffer.append(b"").await.unwrap());
        assert!(buffer.is_drained().await.unwrap());
    }

    #[tokio::test]
    async fn test_seal_is_applied_once() {
        let dir = tempdir().unwrap();
        let compressor: Arc<dyn Compressor> = Arc::new(GzipCommand::default());
        let mut buffer = SpoolBuffer::new(dir.path().join("buf"), 1024, Some(compressor));

        buffer.append(b"first batch\n").await.unwrap();
        buffer.spill_to_disk().await.unwrap();

        assert!(buffer.seal().await.unwrap());
        let sealed = buffer.read_file().await.unwrap();
        assert!(!buffer.seal().await.unwrap());
        assert_eq!(buffer.read_file().await.unwrap(), sealed);
    }

    #[tokio::test]
    async fn test_spill_after_seal_appends_gzip_member() {
        let dir = tempdir().unwrap();
        let compressor: Arc<dyn Compressor> = Arc::new(GzipCommand::default());
        let mut buffer = SpoolBuffer::new(dir.path().join("buf"), 1024, Some(compressor));

        buffer.append(b"first\n").await.unwrap();
        buffer.spill_to_disk().await.unwrap();
        buffer.seal().await.unwrap();
        let first_len = buffer.read_file().await.unwrap().len();

        buffer.append(b"second\n").await.unwrap();
        buffer.spill_to_disk().await.unwrap();

        let contents = buffer.read_file().await.unwrap();
        assert_eq!(&contents[first_len..first_len + 2], &[0x1f, 0x8b]);
        assert_eq!(buffer.memory_len(), 0);
        assert!(!buffer.part_path().exists());
    }

    #[tokio::test]
    async fn test_discard_removes_file_and_marker() {
        let dir = tempdir().unwrap();
        let compressor: Arc<dyn Compressor> = Arc::new(GzipCommand::default());
        let mut buffer = SpoolBuffer::new(dir.path().join("buf"), 1024, Some(compressor));

        buffer.append(b"data\n").await.unwrap();
        buffer.spill_to_disk().await.unwrap();
        buffer.seal().await.unwrap();
        buffer.discard().await.unwrap();

        assert!(buffer.is_drained().await.unwrap());
        assert!(!buffer.is_sealed().await.unwrap());
    }

    #[tokio::test]
    async fn test_recover_reports_pending_and_removes_stale() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buf");
        std::fs::write(&path, b"left over").unwrap();
        std::fs::write(gz_artifact_path(&path), b"half written").unwrap();

        let buffer = SpoolBuffer::new(&path, 1024, None);
        let recovery = buffer.recover().await.unwrap();

        assert_eq!(recovery.pending_bytes, Some(9));
        assert_eq!(recovery.removed_stale, 1);
        assert!(!recovery.sealed);
        assert!(!gz_artifact_path(&path).exists());
    }

    #[tokio::test]
    async fn test_recover_on_clean_directory() {
        let dir = tempdir().unwrap();
        let buffer = SpoolBuffer::new(dir.path().join("buf"), 1024, None);

        assert_eq!(buffer.recover().await.unwrap(), Recovery::default());
    }

    #[tokio::test]
    async fn test_sealed_file_is_refused_without_compression() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buf");
        let compressor: Arc<dyn Compressor> = Arc::new(GzipCommand::default());
        let mut first_run = SpoolBuffer::new(&path, 1024, Some(compressor));
        first_run.append(b"compressed batch\n").await.unwrap();
        first_run.spill_to_disk().await.unwrap();
        first_run.seal().await.unwrap();
        let sealed = first_run.read_file().await.unwrap();

        let mut restarted = SpoolBuffer::new(&path, 1024, None);

        let err = restarted.recover().await.unwrap_err();
        assert!(matches!(err, BufferError::SealedWithoutCompression { .. }));

        restarted.append(b"raw part\n").await.unwrap();
        let err = restarted.spill_to_disk().await.unwrap_err();
        assert!(matches!(err, BufferError::SealedWithoutCompression { .. }));
        assert!(matches!(
            restarted.seal().await.unwrap_err(),
            BufferError::SealedWithoutCompression { .. }
        ));

        assert_eq!(restarted.memory(), b"raw part\n");
        assert_eq!(restarted.read_file().await.unwrap(), sealed);
    }

    #[tokio::test]
    async fn test_failed_seal_leaves_no_marker() {
        let dir = tempdir().unwrap();
        let compressor: Arc<dyn Compressor> = Arc::new(GzipCommand::new("false"));
        let mut buffer = SpoolBuffer::new(dir.path().join("buf"), 1024, Some(compressor));
        buffer.append(b"plain\n").await.unwrap();
        buffer.spill_to_disk().await.unwrap();

        let err = buffer.seal().await.unwrap_err();

        assert!(matches!(err, BufferError::Compression(_)));
        assert!(!buffer.is_sealed().await.unwrap());
        assert_eq!(buffer.read_file().await.unwrap(), b"plain\n");
    }

    #[tokio::test]
    async fn test_recover_drops_marker_on_uncompressed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buf");
        std::fs::write(&path, b"never compressed\n").unwrap();
        std::fs::write(with_suffix(&path, ".sealed"), b"").unwrap();

        let compressor: Arc<dyn Compressor> = Arc::new(GzipCommand::default());
        let buffer = SpoolBuffer::new(&path, 1024, Some(compressor));
        let recovery = buffer.recover().await.unwrap();

        assert!(!recovery.sealed);
        assert_eq!(recovery.removed_stale, 1);
        assert!(!buffer.is_sealed().await.unwrap());

        assert!(buffer.seal().await.unwrap());
        assert_eq!(&buffer.read_file().await.unwrap()[..2], &GZIP_MAGIC);
    }
}
