use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use fsmirror_core::{FileService, RemoteError};
use futures_util::StreamExt;
use md5::Context;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use super::digest::Digest;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("remote transfer failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("transfer cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 4,
            upload_concurrency: 2,
        }
    }
}

/// Moves file content between a peer and the local cache.
#[derive(Clone)]
pub struct TransferClient {
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
}

impl TransferClient {
    pub fn new() -> Self {
        Self::with_config(TransferConfig::default())
    }

    pub fn with_config(config: TransferConfig) -> Self {
        Self {
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
        }
    }

    /// Streams `remote_path` into `target` and returns the digest of what was
    /// written. The target is only replaced once the whole body arrived.
    pub async fn download_to_path(
        &self,
        service: &dyn FileService,
        remote_path: &str,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<Digest, TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let mut stream = service.read(remote_path).await?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut md5 = Context::new();

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                drop(file);
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(TransferError::Cancelled);
            }
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(err.into());
                }
            };
            file.write_all(&chunk).await?;
            md5.consume(&chunk);
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(partial, target).await?;
        Ok(Digest::finish(md5))
    }

    /// Uploads `source` to `remote_path` and returns the digest of the bytes
    /// sent.
    pub async fn upload_from_path(
        &self,
        service: &dyn FileService,
        remote_path: &str,
        source: &Path,
    ) -> Result<Digest, TransferError> {
        let _permit = self
            .upload_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let file = tokio::fs::File::open(source).await?;
        let hasher = Arc::new(Mutex::new(Context::new()));
        let sink = Arc::clone(&hasher);
        let body = ReaderStream::new(file)
            .map(move |chunk| {
                let chunk = chunk?;
                sink.lock().consume(&chunk);
                Ok::<_, RemoteError>(chunk.to_vec())
            })
            .boxed();
        service.write(remote_path, body).await?;
        let ctx = hasher.lock().clone();
        Ok(Digest::finish(ctx))
    }
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

pub(crate) fn is_partial(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "partial")
}
