use std::sync::Arc;

use fsmirror_core::{DirEntry, DirHandle, FileService};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::channel::Channel;
use super::dispatch::DispatchError;
use super::error::MirrorError;
use super::peer::Peer;
use super::session::MirrorSession;
use super::tree::{
    NodeId, NodeKind, NodeSnapshot, QueryTarget, QueryTicket, Resolution, path_segments,
};

/// One step of a children query. Each variant names the remote call it
/// performs next.
enum QueryStep {
    OpenChannel,
    ListRoots {
        channel: Channel,
    },
    OpenDir {
        channel: Channel,
        path: String,
    },
    ReadDir {
        channel: Channel,
        handle: DirHandle,
        entries: Vec<DirEntry>,
    },
    CloseHandle {
        channel: Channel,
        handle: DirHandle,
        entries: Vec<DirEntry>,
    },
    Merge {
        channel: Channel,
        entries: Vec<DirEntry>,
    },
    Close {
        channel: Channel,
    },
    Failed {
        channel: Option<Channel>,
        handle: Option<DirHandle>,
        error: MirrorError,
    },
    /// Abandoned, but callers joined after the others withdrew.
    Rerun {
        cancel: CancellationToken,
    },
    Done,
}

impl QueryStep {
    fn name(&self) -> &'static str {
        match self {
            QueryStep::OpenChannel => "open-channel",
            QueryStep::ListRoots { .. } => "list-roots",
            QueryStep::OpenDir { .. } => "open-dir",
            QueryStep::ReadDir { .. } => "read-dir",
            QueryStep::CloseHandle { .. } => "close-handle",
            QueryStep::Merge { .. } => "merge",
            QueryStep::Close { .. } => "close",
            QueryStep::Failed { .. } => "failed",
            QueryStep::Rerun { .. } => "rerun",
            QueryStep::Done => "done",
        }
    }

    /// Abandons the chain, keeping whatever must still be released.
    fn fail(self, error: MirrorError) -> QueryStep {
        let (channel, handle) = match self {
            QueryStep::OpenChannel | QueryStep::Rerun { .. } | QueryStep::Done => (None, None),
            QueryStep::ListRoots { channel }
            | QueryStep::OpenDir { channel, .. }
            | QueryStep::Merge { channel, .. }
            | QueryStep::Close { channel } => (Some(channel), None),
            QueryStep::ReadDir {
                channel, handle, ..
            }
            | QueryStep::CloseHandle {
                channel, handle, ..
            } => (Some(channel), Some(handle)),
            QueryStep::Failed {
                channel, handle, ..
            } => (channel, handle),
        };
        QueryStep::Failed {
            channel,
            handle,
            error,
        }
    }

    /// Steps after the merge cannot be abandoned any more.
    fn cancellable(&self) -> bool {
        !matches!(
            self,
            QueryStep::Close { .. }
                | QueryStep::Failed { .. }
                | QueryStep::Rerun { .. }
                | QueryStep::Done
        )
    }
}

struct QueryDriver {
    session: MirrorSession,
    node: NodeId,
    peer: Arc<Peer>,
    target: QueryTarget,
    cancel: CancellationToken,
}

impl QueryDriver {
    fn describe(&self) -> String {
        match &self.target {
            QueryTarget::Roots => format!("roots of {}", self.peer.name),
            QueryTarget::Dir(path) => path.clone(),
        }
    }

    async fn run(mut self) {
        let mut step = QueryStep::OpenChannel;
        loop {
            match step {
                QueryStep::Done => break,
                QueryStep::Rerun { cancel } => {
                    tracing::debug!(node = %self.node, target = %self.describe(), "query rerun for new waiters");
                    self.cancel = cancel;
                    step = QueryStep::OpenChannel;
                    continue;
                }
                _ => {}
            }
            if self.cancel.is_cancelled() && step.cancellable() {
                step = step.fail(MirrorError::Cancelled);
            }
            tracing::trace!(node = %self.node, step = step.name(), "query step");
            step = self.advance(step).await;
        }
    }

    async fn advance(&self, step: QueryStep) -> QueryStep {
        match step {
            QueryStep::OpenChannel => match self.session.inner.channels.open(&self.peer).await {
                Ok(channel) => match &self.target {
                    QueryTarget::Roots => QueryStep::ListRoots { channel },
                    QueryTarget::Dir(path) => QueryStep::OpenDir {
                        channel,
                        path: path.clone(),
                    },
                },
                Err(err) => QueryStep::OpenChannel.fail(err.into()),
            },
            QueryStep::ListRoots { channel } => {
                let listed = match service(&channel) {
                    Ok(service) => service.list_roots().await.map_err(MirrorError::from),
                    Err(err) => Err(err),
                };
                match listed {
                    Ok(entries) => QueryStep::Merge { channel, entries },
                    Err(err) => QueryStep::ListRoots { channel }.fail(err),
                }
            }
            QueryStep::OpenDir { channel, path } => {
                let opened = match service(&channel) {
                    Ok(service) => service.open_dir(&path).await.map_err(MirrorError::from),
                    Err(err) => Err(err),
                };
                match opened {
                    Ok(handle) => QueryStep::ReadDir {
                        channel,
                        handle,
                        entries: Vec::new(),
                    },
                    Err(err) => QueryStep::OpenDir { channel, path }.fail(err),
                }
            }
            QueryStep::ReadDir {
                channel,
                handle,
                mut entries,
            } => {
                let read = match service(&channel) {
                    Ok(service) => service.read_dir(&handle).await.map_err(MirrorError::from),
                    Err(err) => Err(err),
                };
                match read {
                    Ok(chunk) => {
                        entries.extend(chunk.entries);
                        if chunk.eof {
                            QueryStep::CloseHandle {
                                channel,
                                handle,
                                entries,
                            }
                        } else {
                            QueryStep::ReadDir {
                                channel,
                                handle,
                                entries,
                            }
                        }
                    }
                    Err(err) => QueryStep::ReadDir {
                        channel,
                        handle,
                        entries,
                    }
                    .fail(err),
                }
            }
            QueryStep::CloseHandle {
                channel,
                handle,
                entries,
            } => {
                let closed = match service(&channel) {
                    Ok(service) => service.close_handle(&handle).await.map_err(MirrorError::from),
                    Err(err) => Err(err),
                };
                match closed {
                    Ok(()) => QueryStep::Merge { channel, entries },
                    Err(err) => QueryStep::Merge { channel, entries }.fail(err),
                }
            }
            QueryStep::Merge { channel, entries } => {
                let count = entries.len();
                let _ = self.finish(Ok(entries)).await;
                tracing::debug!(node = %self.node, target = %self.describe(), count, "children merged");
                QueryStep::Close { channel }
            }
            QueryStep::Close { channel } => {
                channel.close();
                QueryStep::Done
            }
            QueryStep::Failed {
                channel,
                handle,
                error,
            } => {
                if let (Some(channel), Some(handle)) = (&channel, &handle)
                    && let Ok(service) = channel.file_system()
                    && let Err(err) = service.close_handle(handle).await
                {
                    tracing::debug!(handle = %handle.0, error = %err, "closing handle after failure");
                }
                if let Some(channel) = channel {
                    if error.is_connection() {
                        channel.mark_broken();
                    }
                    channel.close();
                }
                if error.is_cancelled() {
                    tracing::debug!(node = %self.node, target = %self.describe(), "query cancelled");
                } else {
                    tracing::warn!(node = %self.node, target = %self.describe(), error = %error, "query failed");
                }
                match self.finish(Err(error.context(self.describe()))).await {
                    Some(cancel) => QueryStep::Rerun { cancel },
                    None => QueryStep::Done,
                }
            }
            step @ (QueryStep::Rerun { .. } | QueryStep::Done) => step,
        }
    }

    /// Hands the result to the tree. Returns a fresh token when the query
    /// has to run again for callers that joined after it was abandoned.
    async fn finish(&self, result: Result<Vec<DirEntry>, MirrorError>) -> Option<CancellationToken> {
        let node = self.node;
        match self
            .session
            .with_tree_mut(move |tree| tree.finish_query(node, result))
            .await
        {
            Ok(rerun) => rerun,
            Err(err) => {
                tracing::warn!(node = %node, error = %err, "query result could not be delivered");
                None
            }
        }
    }
}

fn service(channel: &Channel) -> Result<Arc<dyn FileService>, MirrorError> {
    Ok(channel.file_system()?)
}

impl MirrorSession {
    /// Re-lists the children of `node` from the peer.
    pub async fn query_children(&self, node: NodeId) -> Result<(), MirrorError> {
        self.query_children_with(node, true, &CancellationToken::new())
            .await
    }

    /// Lists the children of `node` unless they already are.
    pub async fn ensure_children(&self, node: NodeId) -> Result<(), MirrorError> {
        self.query_children_with(node, false, &CancellationToken::new())
            .await
    }

    /// Queries the children of `node`. A call made while a query on the same
    /// node is running waits for that query instead of starting another.
    ///
    /// Cancelling `cancel` only withdraws this caller; the remote query stops
    /// once no caller is left waiting for it.
    pub async fn query_children_with(
        &self,
        node: NodeId,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<(), MirrorError> {
        if cancel.is_cancelled() {
            return Err(MirrorError::Cancelled);
        }
        let (tx, mut rx) = oneshot::channel();
        let ticket = self
            .with_tree_mut(move |tree| tree.begin_query(node, tx, force))
            .await??;
        let waiter = match ticket {
            QueryTicket::Ready => return Ok(()),
            QueryTicket::Joined { waiter } => {
                tracing::trace!(node = %node, "joined running query");
                waiter
            }
            QueryTicket::Start {
                peer,
                target,
                cancel: query_cancel,
                waiter,
            } => {
                let driver = QueryDriver {
                    session: self.clone(),
                    node,
                    peer,
                    target,
                    cancel: query_cancel,
                };
                self.inner.runtime.spawn(driver.run());
                waiter
            }
        };
        tokio::select! {
            res = &mut rx => res.map_err(|_| MirrorError::from(DispatchError::Closed))?,
            _ = cancel.cancelled() => {
                self.with_tree_mut(move |tree| tree.withdraw_waiter(node, waiter))
                    .await?;
                Err(MirrorError::Cancelled)
            }
        }
    }

    /// Children of `node`, listing them from the peer first if needed.
    pub async fn list_children(&self, node: NodeId) -> Result<Vec<NodeSnapshot>, MirrorError> {
        self.ensure_children(node).await?;
        self.children(node).await
    }

    /// Descends from `start` along `path`, querying every directory on the
    /// way whose children are not known yet.
    pub async fn locate(&self, start: NodeId, path: &str) -> Result<NodeId, MirrorError> {
        let relative = path.to_string();
        let segments = self
            .with_tree(move |tree| {
                tree.node(start).map(|node| {
                    path_segments(&node.peer, node.kind == NodeKind::SystemRoot, &relative)
                })
            })
            .await?
            .ok_or(MirrorError::StaleNode(start))?;
        let segments = Arc::new(segments);

        loop {
            let lookup = Arc::clone(&segments);
            let resolution = self
                .with_tree(move |tree| tree.resolve(start, &lookup))
                .await?;
            match resolution {
                Resolution::Found(node) => return Ok(node),
                Resolution::Missing(segment) => {
                    return Err(MirrorError::NotFound(segment).context(path));
                }
                Resolution::Unqueried(node) => self
                    .ensure_children(node)
                    .await
                    .map_err(|err| err.context(path))?,
            }
        }
    }

    /// Locates `path` from the peer's namespace root, e.g. `/etc/hosts` or
    /// `C:\Users`.
    pub async fn locate_path(&self, peer: &Peer, path: &str) -> Result<NodeId, MirrorError> {
        let root = self.root(peer).await?;
        self.locate(root, path).await
    }

    /// Blocking form of [`locate`](Self::locate).
    ///
    /// On the dispatch thread only the already mirrored part of the tree is
    /// searched and `DispatchError::WouldBlock` is returned where a query
    /// would be needed. Must not be called from inside an async task.
    pub fn locate_blocking(&self, start: NodeId, path: &str) -> Result<NodeId, MirrorError> {
        let dispatcher = &self.inner.dispatcher;
        if dispatcher.is_dispatch_thread() {
            let relative = path.to_string();
            return dispatcher.invoke_and_wait(move |ctx| {
                let tree = ctx.tree();
                let node = tree.node(start).ok_or(MirrorError::StaleNode(start))?;
                let segments =
                    path_segments(&node.peer, node.kind == NodeKind::SystemRoot, &relative);
                match tree.resolve(start, &segments) {
                    Resolution::Found(found) => Ok(found),
                    Resolution::Missing(segment) => {
                        Err(MirrorError::NotFound(segment).context(relative.as_str()))
                    }
                    Resolution::Unqueried(_) => Err(DispatchError::WouldBlock.into()),
                }
            })?;
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let session = self.clone();
        let path = path.to_string();
        self.inner.runtime.spawn(async move {
            let _ = tx.send(session.locate(start, &path).await);
        });
        rx.recv()
            .map_err(|_| MirrorError::from(DispatchError::Closed))?
    }
}
