//! Chunked transfer engine.
//!
//! Uploads read the source in fixed-size chunks and push them as numbered
//! parts, strictly one after another; any failure after the upload was
//! initiated aborts it. Downloads fetch consecutive ranges until one comes
//! back short, so an object whose size is an exact multiple of the chunk
//! size ends with one empty range.

use std::io::SeekFrom;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use crate::backup::store::{CompletedPart, ObjectStore};
use crate::context::Context;
use crate::error::DockError;
use crate::utils::retry;

/// 50 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 50 * 1024 * 1024;
/// Attempts per part before the transfer gives up.
pub const PART_ATTEMPTS: usize = 3;

/// Result of a completed upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSummary {
    pub parts: u32,
    pub bytes: u64,
}

pub struct ChunkTransfer<'a> {
    store: &'a dyn ObjectStore,
    chunk_size: usize,
    attempts: usize,
    retry_delay: Duration,
}

impl<'a> ChunkTransfer<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self {
            store,
            chunk_size: DEFAULT_CHUNK_SIZE,
            attempts: PART_ATTEMPTS,
            retry_delay: Duration::ZERO,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Stream `reader` into `bucket/key`.
    #[instrument(skip(self, ctx, reader))]
    pub async fn upload<R>(
        &self,
        ctx: &Context,
        bucket: &str,
        key: &str,
        reader: &mut R,
    ) -> Result<UploadSummary, DockError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let upload_id = self.store.init_multipart(bucket, key).await?;
        debug!(%upload_id, "multipart upload initiated");

        match self.upload_parts(ctx, bucket, key, &upload_id, reader).await {
            Ok(summary) => {
                info!(parts = summary.parts, bytes = summary.bytes, "upload complete");
                Ok(summary)
            }
            Err(e) => {
                if let Err(abort) = self.store.abort_multipart(bucket, key, &upload_id).await {
                    warn!(%upload_id, error = %abort, "failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts<R>(
        &self,
        ctx: &Context,
        bucket: &str,
        key: &str,
        upload_id: &str,
        reader: &mut R,
    ) -> Result<UploadSummary, DockError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buf = vec![0u8; self.chunk_size];
        let mut parts: Vec<CompletedPart> = Vec::new();
        let mut bytes = 0u64;

        loop {
            if ctx.is_canceled() {
                return Err(DockError::Canceled(format!("upload of {bucket}/{key}")));
            }
            let n = read_full(reader, &mut buf)
                .await
                .map_err(|e| DockError::Transport(format!("read source: {e}")))?;
            // An empty source still needs one part to complete the upload.
            if n == 0 && !parts.is_empty() {
                break;
            }

            let part_number = parts.len() as u32 + 1;
            let chunk = &buf[..n];
            let etag = retry(
                &format!("upload part {part_number}"),
                self.attempts,
                self.retry_delay,
                |_| self.store.upload_part(bucket, key, upload_id, part_number, chunk),
            )
            .await?;
            debug!(part_number, size = n, "part uploaded");
            parts.push(CompletedPart { part_number, etag });
            bytes += n as u64;

            if n < self.chunk_size {
                break;
            }
        }

        self.store
            .complete_multipart(bucket, key, upload_id, &parts)
            .await?;
        Ok(UploadSummary {
            parts: parts.len() as u32,
            bytes,
        })
    }

    /// Fetch `bucket/key` into `writer`, writing each range at its offset.
    #[instrument(skip(self, ctx, writer))]
    pub async fn download<W>(
        &self,
        ctx: &Context,
        bucket: &str,
        key: &str,
        writer: &mut W,
    ) -> Result<u64, DockError>
    where
        W: AsyncWrite + AsyncSeek + Unpin + Send,
    {
        let chunk = self.chunk_size as u64;
        let mut offset = 0u64;
        loop {
            if ctx.is_canceled() {
                return Err(DockError::Canceled(format!("download of {bucket}/{key}")));
            }
            let data = retry(
                &format!("download offset {offset}"),
                self.attempts,
                self.retry_delay,
                |_| self.store.download_part(bucket, key, offset, chunk),
            )
            .await?;

            if !data.is_empty() {
                writer
                    .seek(SeekFrom::Start(offset))
                    .await
                    .map_err(|e| DockError::Transport(format!("seek target: {e}")))?;
                writer
                    .write_all(&data)
                    .await
                    .map_err(|e| DockError::Transport(format!("write target: {e}")))?;
            }
            offset += data.len() as u64;
            if (data.len() as u64) < chunk {
                break;
            }
        }
        writer
            .flush()
            .await
            .map_err(|e| DockError::Transport(format!("flush target: {e}")))?;
        info!(bytes = offset, "download complete");
        Ok(offset)
    }
}

/// Fill `buf` unless the reader hits EOF first; returns the bytes read.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
