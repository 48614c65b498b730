use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fsmirror_core::UserAccount;
use notify::RecommendedWatcher;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::cache_state::{CacheState, cache_state};
use super::channel::{ChannelManager, Transport};
use super::digest::{
    ChannelUrlOpener, DEFAULT_DIGEST_CHUNK, Digest, DigestEngine, DigestStamp, DigestStore,
    FileKey, FileState, Staleness, local_mtime, staleness,
};
use super::dispatch::{DispatchError, Dispatcher};
use super::error::MirrorError;
use super::local_watcher::{CacheEvent, start_cache_watcher};
use super::operations::OperationExecutor;
use super::paths::CacheLayout;
use super::peer::Peer;
use super::transfer::{TransferClient, TransferConfig, TransferError};
use super::tree::{NodeId, NodeSnapshot, Tree};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub cache_root: PathBuf,
    pub connect_attempts: u32,
    pub digest_chunk: usize,
    pub transfer: TransferConfig,
}

impl SessionOptions {
    pub fn new(cache_root: PathBuf) -> Self {
        Self {
            cache_root,
            connect_attempts: 3,
            digest_chunk: DEFAULT_DIGEST_CHUNK,
            transfer: TransferConfig::default(),
        }
    }
}

pub(crate) struct SessionInner {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) channels: ChannelManager,
    pub(crate) layout: CacheLayout,
    pub(crate) store: Arc<DigestStore>,
    pub(crate) digests: DigestEngine,
    pub(crate) transfer: TransferClient,
    pub(crate) runtime: Handle,
    accounts: Mutex<HashMap<String, UserAccount>>,
}

/// Owns the mirrored tree of every registered peer and everything needed to
/// keep it and the local cache current.
#[derive(Clone)]
pub struct MirrorSession {
    pub(crate) inner: Arc<SessionInner>,
}

impl MirrorSession {
    /// Must be called from inside a tokio runtime.
    pub fn new(options: SessionOptions, transport: Arc<dyn Transport>) -> Result<Self, MirrorError> {
        Self::with_backoff(options, transport, Backoff::default())
    }

    pub fn with_backoff(
        options: SessionOptions,
        transport: Arc<dyn Transport>,
        backoff: Backoff,
    ) -> Result<Self, MirrorError> {
        let runtime = Handle::try_current().map_err(DispatchError::from)?;
        let dispatcher = Dispatcher::start()?;
        let channels = ChannelManager::new(transport, options.connect_attempts, backoff);
        let store = Arc::new(DigestStore::new());
        let digests = DigestEngine::new(
            Arc::clone(&store),
            Arc::new(ChannelUrlOpener::new(channels.clone())),
            options.digest_chunk,
        );
        tracing::debug!(cache_root = %options.cache_root.display(), "mirror session started");
        Ok(Self {
            inner: Arc::new(SessionInner {
                dispatcher,
                channels,
                layout: CacheLayout::new(options.cache_root),
                store,
                digests,
                transfer: TransferClient::with_config(options.transfer),
                runtime,
                accounts: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.inner.channels
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.inner.layout
    }

    pub fn digest_store(&self) -> &Arc<DigestStore> {
        &self.inner.store
    }

    pub fn executor(&self) -> OperationExecutor {
        OperationExecutor::new(self.clone())
    }

    pub(crate) async fn with_tree<R, F>(&self, f: F) -> Result<R, MirrorError>
    where
        F: FnOnce(&Tree) -> R + Send + 'static,
        R: Send + 'static,
    {
        Ok(self.inner.dispatcher.invoke(move |ctx| f(&ctx.tree())).await?)
    }

    pub(crate) async fn with_tree_mut<R, F>(&self, f: F) -> Result<R, MirrorError>
    where
        F: FnOnce(&mut Tree) -> R + Send + 'static,
        R: Send + 'static,
    {
        Ok(self
            .inner
            .dispatcher
            .invoke(move |ctx| f(&mut ctx.tree_mut()))
            .await?)
    }

    /// Registers `peer` and returns its namespace root.
    pub async fn root(&self, peer: &Peer) -> Result<NodeId, MirrorError> {
        self.inner.channels.register(peer);
        let peer = peer.clone();
        self.with_tree_mut(move |tree| tree.root_for(&peer)).await
    }

    /// Account the peer's agent runs as. Asked once per peer.
    pub async fn user_account(&self, peer_id: &str) -> Result<UserAccount, MirrorError> {
        if let Some(account) = self.inner.accounts.lock().get(peer_id) {
            return Ok(account.clone());
        }
        let channel = self.inner.channels.open_by_id(peer_id).await?;
        let asked = match channel.file_system() {
            Ok(service) => service.user().await.map_err(MirrorError::from),
            Err(err) => Err(err.into()),
        };
        channel.close();
        let account = asked?;
        tracing::debug!(
            peer = peer_id,
            uid = account.effective_uid,
            gid = account.effective_gid,
            "agent account"
        );
        self.inner
            .accounts
            .lock()
            .insert(peer_id.to_string(), account.clone());
        Ok(account)
    }

    /// Drops the peer's nodes and digest records. Cache files stay on disk.
    pub async fn remove_peer(&self, peer_id: &str) -> Result<usize, MirrorError> {
        let id = peer_id.to_string();
        let removed = self.with_tree_mut(move |tree| tree.remove_peer(&id)).await?;
        self.inner.channels.forget(peer_id);
        self.inner.accounts.lock().remove(peer_id);
        self.inner.store.remove_peer(peer_id);
        tracing::info!(peer = peer_id, nodes = removed, "peer removed");
        Ok(removed)
    }

    pub async fn snapshot(&self, node: NodeId) -> Result<NodeSnapshot, MirrorError> {
        self.with_tree(move |tree| tree.snapshot(node))
            .await?
            .ok_or(MirrorError::StaleNode(node))
    }

    /// Children as currently mirrored, without querying the peer.
    pub async fn children(&self, node: NodeId) -> Result<Vec<NodeSnapshot>, MirrorError> {
        self.with_tree(move |tree| tree.children(node))
            .await?
            .ok_or(MirrorError::StaleNode(node))
    }

    /// Blocking form of [`children`](Self::children) for threads outside the
    /// runtime.
    pub fn children_blocking(&self, node: NodeId) -> Result<Vec<NodeSnapshot>, MirrorError> {
        self.inner
            .dispatcher
            .invoke_and_wait(move |ctx| ctx.tree().children(node))?
            .ok_or(MirrorError::StaleNode(node))
    }

    pub async fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> Result<bool, MirrorError> {
        self.with_tree(move |tree| tree.is_ancestor(ancestor, node))
            .await
    }

    pub(crate) async fn file_snapshot(&self, node: NodeId) -> Result<NodeSnapshot, MirrorError> {
        let snapshot = self.snapshot(node).await?;
        if !snapshot.is_file() {
            return Err(MirrorError::NotAFile(snapshot.location));
        }
        Ok(snapshot)
    }

    pub fn file_key(snapshot: &NodeSnapshot) -> FileKey {
        FileKey::new(&snapshot.peer_id, &snapshot.remote_path)
    }

    pub fn cache_file(&self, snapshot: &NodeSnapshot) -> Result<PathBuf, MirrorError> {
        Ok(self.inner.layout.cache_path(&snapshot.peer_id, &snapshot.remote_path)?)
    }

    /// Verdict from the digests already recorded; no hashing is done.
    pub async fn staleness(&self, node: NodeId) -> Result<Staleness, MirrorError> {
        let snapshot = self.file_snapshot(node).await?;
        let path = self.cache_file(&snapshot)?;
        let state = self.inner.store.get(&Self::file_key(&snapshot));
        Ok(staleness(&state, snapshot.mtime(), cache_file_mtime(&path).await))
    }

    /// Recomputes whichever digest no longer matches its side's mtime, then
    /// decides staleness.
    pub async fn check_cache(
        &self,
        node: NodeId,
        cancel: &CancellationToken,
    ) -> Result<Staleness, MirrorError> {
        let snapshot = self.file_snapshot(node).await?;
        let key = Self::file_key(&snapshot);
        let path = self.cache_file(&snapshot)?;
        let cache_mtime = cache_file_mtime(&path).await;
        let state = self.inner.store.get(&key);

        let cache_job = (cache_mtime.is_some()
            && !state.cache.is_some_and(|s| s.matches_mtime(cache_mtime)))
        .then(|| {
            self.inner
                .digests
                .spawn_cache_digest(key.clone(), path.clone(), cancel.clone())
        });
        let target_job = (snapshot.exists()
            && !state.target.is_some_and(|s| s.matches_mtime(snapshot.mtime())))
        .then(|| {
            self.inner
                .digests
                .spawn_target_digest(key.clone(), snapshot.mtime(), cancel.clone())
        });
        if let Some(job) = cache_job {
            job.outcome().await;
        }
        if let Some(job) = target_job {
            job.outcome().await;
        }
        if cancel.is_cancelled() {
            return Err(MirrorError::Cancelled);
        }

        let state = self.inner.store.get(&key);
        let verdict = staleness(&state, snapshot.mtime(), cache_mtime);
        tracing::debug!(path = %snapshot.location, ?verdict, "cache checked");
        Ok(verdict)
    }

    pub async fn cache_state(&self, node: NodeId) -> Result<CacheState, MirrorError> {
        let snapshot = self.file_snapshot(node).await?;
        let path = self.cache_file(&snapshot)?;
        let has_cache_file = tokio::fs::try_exists(&path).await.unwrap_or(false);
        let state = self.inner.store.get(&Self::file_key(&snapshot));
        Ok(cache_state(
            &state,
            has_cache_file,
            snapshot.mtime(),
            cache_file_mtime(&path).await,
        ))
    }

    /// Downloads the remote file into the cache; afterwards cache, target and
    /// base all carry the downloaded digest.
    pub async fn update_cache(
        &self,
        node: NodeId,
        cancel: &CancellationToken,
    ) -> Result<Digest, MirrorError> {
        let snapshot = self.file_snapshot(node).await?;
        let key = Self::file_key(&snapshot);
        let path = self.cache_file(&snapshot)?;
        let context = |err: MirrorError| err.context(snapshot.location.clone());

        let channel = self
            .inner
            .channels
            .open_by_id(&snapshot.peer_id)
            .await
            .map_err(|err| context(err.into()))?;
        let service = channel.file_system().map_err(|err| context(err.into()))?;
        let attrs = service
            .stat(&snapshot.remote_path)
            .await
            .map_err(|err| context(err.into()))?;
        let digest = self
            .inner
            .transfer
            .download_to_path(service.as_ref(), &snapshot.remote_path, &path, cancel)
            .await
            .map_err(|err| context(transfer_error(err)))?;
        channel.close();

        let target_mtime = attrs.mtime;
        let cache_mtime = cache_file_mtime(&path).await;
        self.with_tree_mut(move |tree| tree.set_attrs(node, Some(attrs)))
            .await?;
        self.inner.store.update(&key, |_| FileState {
            cache: Some(DigestStamp {
                digest,
                mtime: cache_mtime,
            }),
            target: Some(DigestStamp {
                digest,
                mtime: target_mtime,
            }),
            base: Some(digest),
        });
        tracing::info!(path = %snapshot.location, %digest, "cache updated");
        Ok(digest)
    }

    /// Uploads the cache file over the remote file.
    pub async fn commit_cache(&self, node: NodeId) -> Result<Digest, MirrorError> {
        let snapshot = self.file_snapshot(node).await?;
        let key = Self::file_key(&snapshot);
        let path = self.cache_file(&snapshot)?;
        let context = |err: MirrorError| err.context(snapshot.location.clone());

        let channel = self
            .inner
            .channels
            .open_by_id(&snapshot.peer_id)
            .await
            .map_err(|err| context(err.into()))?;
        let service = channel.file_system().map_err(|err| context(err.into()))?;
        let cache_mtime = cache_file_mtime(&path).await;
        let digest = self
            .inner
            .transfer
            .upload_from_path(service.as_ref(), &snapshot.remote_path, &path)
            .await
            .map_err(|err| context(transfer_error(err)))?;
        let attrs = match service.stat(&snapshot.remote_path).await {
            Ok(attrs) => Some(attrs),
            Err(err) => {
                tracing::warn!(path = %snapshot.location, error = %err, "stat after upload failed");
                None
            }
        };
        channel.close();

        let target_mtime = attrs.as_ref().and_then(|attrs| attrs.mtime);
        if let Some(attrs) = attrs {
            self.with_tree_mut(move |tree| tree.set_attrs(node, Some(attrs)))
                .await?;
        }
        self.inner.store.update(&key, |_| FileState {
            cache: Some(DigestStamp {
                digest,
                mtime: cache_mtime,
            }),
            target: target_mtime.map(|mtime| DigestStamp {
                digest,
                mtime: Some(mtime),
            }),
            base: Some(digest),
        });
        tracing::info!(path = %snapshot.location, %digest, "cache committed");
        Ok(digest)
    }

    /// Watches the cache root and drops the cache digest of files edited
    /// there. The watcher runs until the returned guard is dropped.
    pub fn start_cache_watcher(&self) -> Result<CacheWatcher, MirrorError> {
        let root = self.inner.layout.root().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let (watcher, mut events) = start_cache_watcher(&root)?;
        let session = self.clone();
        let task = self.inner.runtime.spawn(async move {
            while let Some(event) = events.recv().await {
                session.apply_cache_event(&event).await;
            }
        });
        tracing::info!(root = %root.display(), "cache watcher started");
        Ok(CacheWatcher {
            _watcher: watcher,
            task,
        })
    }

    pub(crate) async fn apply_cache_event(&self, event: &CacheEvent) {
        let Some(key) = self.inner.layout.resolve(event.path()) else {
            return;
        };
        let mtime = cache_file_mtime(event.path()).await;
        if self.inner.store.invalidate_cache(&key, mtime) {
            tracing::debug!(peer = %key.peer_id, path = %key.path, "cache digest invalidated");
        }
    }

    /// Stops the dispatch thread after the queued tasks ran. Must not be
    /// called from the dispatch thread.
    pub fn shutdown(&self) {
        self.inner.dispatcher.shutdown();
    }
}

/// Keeps a cache watcher alive.
pub struct CacheWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for CacheWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub(crate) async fn cache_file_mtime(path: &Path) -> Option<i64> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    meta.is_file().then(|| local_mtime(&meta)).flatten()
}

pub(crate) fn transfer_error(err: TransferError) -> MirrorError {
    match err {
        TransferError::Cancelled => MirrorError::Cancelled,
        TransferError::Remote(err) => MirrorError::Remote(err),
        TransferError::Io(err) => MirrorError::LocalIo(err),
        other => MirrorError::Transfer(other),
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
