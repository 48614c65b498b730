use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use dashmap::DashMap;
use fsmirror_core::{ByteStream, RemoteUrl};
use futures_util::StreamExt;
use md5::Context;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::channel::ChannelManager;
use super::error::MirrorError;

pub const DEFAULT_DIGEST_CHUNK: usize = 64 * 1024;

/// MD5 of a file's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 16]);

impl Digest {
    pub fn of(bytes: &[u8]) -> Self {
        Self(md5::compute(bytes).0)
    }

    pub(crate) fn finish(ctx: Context) -> Self {
        Self(ctx.compute().0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

/// Digest together with the mtime of the content it was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestStamp {
    pub digest: Digest,
    pub mtime: Option<i64>,
}

impl DigestStamp {
    pub fn matches_mtime(&self, mtime: Option<i64>) -> bool {
        self.mtime == mtime
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileState {
    pub cache: Option<DigestStamp>,
    pub target: Option<DigestStamp>,
    /// Content both sides agreed on at the last download or commit.
    pub base: Option<Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub peer_id: String,
    /// Cross-platform remote path.
    pub path: String,
}

impl FileKey {
    pub fn new(peer_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            path: path.into(),
        }
    }

    pub fn url(&self) -> RemoteUrl {
        RemoteUrl::new(&self.peer_id, &self.path)
    }

    fn is_under(&self, peer_id: &str, prefix: &str) -> bool {
        if self.peer_id != peer_id {
            return false;
        }
        if self.path == prefix {
            return true;
        }
        match prefix.strip_suffix('/') {
            Some(_) => self.path.starts_with(prefix),
            None => self
                .path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/')),
        }
    }
}

/// Digest records shared between the dispatch thread and digest jobs.
///
/// Records are replaced whole; a reader holding an `Arc<FileState>` never
/// sees a half-written update.
#[derive(Default)]
pub struct DigestStore {
    states: DashMap<FileKey, Arc<FileState>>,
}

impl DigestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &FileKey) -> Arc<FileState> {
        self.states
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_default()
    }

    pub fn update(&self, key: &FileKey, f: impl FnOnce(&FileState) -> FileState) -> Arc<FileState> {
        let mut entry = self.states.entry(key.clone()).or_default();
        let next = Arc::new(f(entry.value()));
        *entry.value_mut() = Arc::clone(&next);
        next
    }

    /// Clears the cache stamp unless it was taken at `mtime`.
    pub fn invalidate_cache(&self, key: &FileKey, mtime: Option<i64>) -> bool {
        let Some(mut entry) = self.states.get_mut(key) else {
            return false;
        };
        match entry.cache {
            Some(stamp) if !stamp.matches_mtime(mtime) => {
                let mut next = FileState::clone(&entry);
                next.cache = None;
                *entry = Arc::new(next);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &FileKey) {
        self.states.remove(key);
    }

    /// Drops the records of `path` and everything below it.
    pub fn remove_prefix(&self, peer_id: &str, path: &str) {
        self.states.retain(|key, _| !key.is_under(peer_id, path));
    }

    pub fn remove_peer(&self, peer_id: &str) {
        self.states.retain(|key, _| key.peer_id != peer_id);
    }

    /// Re-keys the records of `from` and everything below it to `to`.
    pub fn rename_prefix(&self, peer_id: &str, from: &str, to: &str) {
        let moved: Vec<FileKey> = self
            .states
            .iter()
            .filter(|entry| entry.key().is_under(peer_id, from))
            .map(|entry| entry.key().clone())
            .collect();
        for key in moved {
            if let Some((old, state)) = self.states.remove(&key) {
                let path = format!("{to}{}", &old.path[from.len()..]);
                self.states.insert(FileKey::new(peer_id, path), state);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DigestFailure {
    #[error("no cache file")]
    NoCache,
    #[error("local I/O error: {0}")]
    LocalIo(String),
    #[error("remote read failed: {0}")]
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestOutcome {
    Computed(DigestStamp),
    Unavailable(DigestFailure),
    Cancelled,
}

impl DigestOutcome {
    pub fn stamp(&self) -> Option<DigestStamp> {
        match self {
            DigestOutcome::Computed(stamp) => Some(*stamp),
            _ => None,
        }
    }
}

pub(crate) fn local_mtime(meta: &std::fs::Metadata) -> Option<i64> {
    let modified = meta.modified().ok()?;
    let since = modified.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since.as_millis()).ok()
}

/// Hashes a cache file in `chunk`-sized reads, stopping early on cancel.
pub async fn digest_local_file(
    path: &Path,
    chunk: usize,
    cancel: &CancellationToken,
) -> DigestOutcome {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return DigestOutcome::Unavailable(DigestFailure::NoCache);
        }
        Err(err) => return DigestOutcome::Unavailable(DigestFailure::LocalIo(err.to_string())),
    };
    let mtime = match file.metadata().await {
        Ok(meta) => local_mtime(&meta),
        Err(err) => return DigestOutcome::Unavailable(DigestFailure::LocalIo(err.to_string())),
    };

    let mut ctx = Context::new();
    let mut buf = vec![0u8; chunk.max(1)];
    loop {
        if cancel.is_cancelled() {
            return DigestOutcome::Cancelled;
        }
        match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => ctx.consume(&buf[..n]),
            Err(err) => {
                return DigestOutcome::Unavailable(DigestFailure::LocalIo(err.to_string()));
            }
        }
    }
    DigestOutcome::Computed(DigestStamp {
        digest: Digest::finish(ctx),
        mtime,
    })
}

/// Hashes remote content observed at `mtime`.
pub async fn digest_stream(
    mut stream: ByteStream,
    mtime: Option<i64>,
    cancel: &CancellationToken,
) -> DigestOutcome {
    let mut ctx = Context::new();
    loop {
        if cancel.is_cancelled() {
            return DigestOutcome::Cancelled;
        }
        match stream.next().await {
            Some(Ok(chunk)) => ctx.consume(&chunk),
            Some(Err(err)) => {
                return DigestOutcome::Unavailable(DigestFailure::Remote(err.to_string()));
            }
            None => break,
        }
    }
    DigestOutcome::Computed(DigestStamp {
        digest: Digest::finish(ctx),
        mtime,
    })
}

/// Opens the content behind an `fsmirror:` URL.
#[async_trait]
pub trait UrlOpener: Send + Sync {
    async fn open(&self, url: &RemoteUrl) -> Result<ByteStream, MirrorError>;
}

pub struct ChannelUrlOpener {
    channels: ChannelManager,
}

impl ChannelUrlOpener {
    pub fn new(channels: ChannelManager) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl UrlOpener for ChannelUrlOpener {
    async fn open(&self, url: &RemoteUrl) -> Result<ByteStream, MirrorError> {
        let channel = self.channels.open_by_id(&url.peer_id).await?;
        let service = channel.file_system()?;
        let stream = service
            .read(&url.path)
            .await
            .map_err(|err| MirrorError::from(err).context(url.to_string()))?;
        // The lease travels with the stream so the connection outlives the read.
        Ok(stream
            .map(move |chunk| {
                let _lease = &channel;
                chunk
            })
            .boxed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Cache,
    Target,
}

/// Handle to a running digest job.
pub struct DigestJob(JoinHandle<DigestOutcome>);

impl DigestJob {
    pub async fn outcome(self) -> DigestOutcome {
        match self.0.await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(error = %err, "digest job aborted");
                DigestOutcome::Unavailable(DigestFailure::LocalIo(err.to_string()))
            }
        }
    }
}

/// Runs digest jobs on the runtime's worker pool and records their results.
#[derive(Clone)]
pub struct DigestEngine {
    store: Arc<DigestStore>,
    opener: Arc<dyn UrlOpener>,
    chunk: usize,
}

impl DigestEngine {
    pub fn new(store: Arc<DigestStore>, opener: Arc<dyn UrlOpener>, chunk: usize) -> Self {
        Self {
            store,
            opener,
            chunk: chunk.max(1),
        }
    }

    pub fn store(&self) -> &Arc<DigestStore> {
        &self.store
    }

    pub fn spawn_cache_digest(
        &self,
        key: FileKey,
        path: PathBuf,
        cancel: CancellationToken,
    ) -> DigestJob {
        let engine = self.clone();
        DigestJob(tokio::spawn(async move {
            let outcome = digest_local_file(&path, engine.chunk, &cancel).await;
            engine.record(&key, Side::Cache, &outcome);
            outcome
        }))
    }

    pub fn spawn_target_digest(
        &self,
        key: FileKey,
        mtime: Option<i64>,
        cancel: CancellationToken,
    ) -> DigestJob {
        let engine = self.clone();
        DigestJob(tokio::spawn(async move {
            let outcome = match engine.opener.open(&key.url()).await {
                Ok(stream) => digest_stream(stream, mtime, &cancel).await,
                Err(_) if cancel.is_cancelled() => DigestOutcome::Cancelled,
                Err(err) => DigestOutcome::Unavailable(DigestFailure::Remote(err.to_string())),
            };
            engine.record(&key, Side::Target, &outcome);
            outcome
        }))
    }

    fn record(&self, key: &FileKey, side: Side, outcome: &DigestOutcome) {
        let stamp = match outcome {
            DigestOutcome::Computed(stamp) => Some(*stamp),
            DigestOutcome::Unavailable(failure) => {
                tracing::debug!(peer = %key.peer_id, path = %key.path, ?side, %failure, "digest unavailable");
                None
            }
            DigestOutcome::Cancelled => return,
        };
        self.store.update(key, |state| {
            let mut next = state.clone();
            match side {
                Side::Cache => next.cache = stamp,
                Side::Target => next.target = stamp,
            }
            next
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    TargetDigestMissing,
    CacheDigestMissing,
    TargetModified,
    CacheModified,
    DigestMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    Stale(StaleReason),
}

impl Staleness {
    pub fn is_stale(self) -> bool {
        matches!(self, Staleness::Stale(_))
    }
}

/// Whether the cached copy may differ from the remote file.
///
/// A stamp only counts while the mtime it was taken at is still the one
/// observed now; a missing stamp always means stale.
pub fn staleness(
    state: &FileState,
    target_mtime: Option<i64>,
    cache_mtime: Option<i64>,
) -> Staleness {
    let Some(target) = state.target else {
        return Staleness::Stale(StaleReason::TargetDigestMissing);
    };
    let Some(cache) = state.cache else {
        return Staleness::Stale(StaleReason::CacheDigestMissing);
    };
    if !target.matches_mtime(target_mtime) {
        return Staleness::Stale(StaleReason::TargetModified);
    }
    if !cache.matches_mtime(cache_mtime) {
        return Staleness::Stale(StaleReason::CacheModified);
    }
    if target.digest != cache.digest {
        return Staleness::Stale(StaleReason::DigestMismatch);
    }
    Staleness::Fresh
}
