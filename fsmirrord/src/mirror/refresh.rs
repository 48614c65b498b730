use fsmirror_core::FileAttrs;
use tokio_util::sync::CancellationToken;

use super::digest::DigestOutcome;
use super::error::MirrorError;
use super::session::MirrorSession;
use super::tree::{NodeId, NodeKind};

/// What a state refresh observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub existed: bool,
    pub exists: bool,
    pub attrs_changed: bool,
    /// Set when the refresh had to recompute the remote digest.
    pub target_digest: Option<DigestOutcome>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub dirs: usize,
    pub files: usize,
}

impl MirrorSession {
    pub async fn refresh_state(&self, node: NodeId) -> Result<StateChange, MirrorError> {
        self.refresh_state_with(node, &CancellationToken::new())
            .await
    }

    /// Re-reads the attributes of `node`. For a cached file whose remote side
    /// changed, the remote digest is recomputed before this returns.
    pub async fn refresh_state_with(
        &self,
        node: NodeId,
        cancel: &CancellationToken,
    ) -> Result<StateChange, MirrorError> {
        let snapshot = self.snapshot(node).await?;
        if snapshot.kind == NodeKind::SystemRoot {
            return Ok(StateChange {
                existed: true,
                exists: true,
                attrs_changed: false,
                target_digest: None,
            });
        }

        let context = |err: MirrorError| err.context(snapshot.location.clone());
        let channel = self
            .inner
            .channels
            .open_by_id(&snapshot.peer_id)
            .await
            .map_err(|err| context(err.into()))?;
        let service = channel.file_system().map_err(|err| context(err.into()))?;
        let attrs = match service.stat(&snapshot.remote_path).await {
            Ok(attrs) => Some(attrs),
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                if err.is_connection() {
                    channel.mark_broken();
                }
                channel.close();
                return Err(context(err.into()));
            }
        };
        channel.close();

        let stored = attrs.clone();
        let previous = self
            .with_tree_mut(move |tree| tree.set_attrs(node, stored))
            .await?
            .ok_or(MirrorError::StaleNode(node))?;

        let mut change = StateChange {
            existed: previous.is_some(),
            exists: attrs.is_some(),
            attrs_changed: previous != attrs,
            target_digest: None,
        };

        let is_file = attrs
            .as_ref()
            .map_or(snapshot.is_file(), FileAttrs::is_file);
        if !is_file {
            return Ok(change);
        }
        let key = Self::file_key(&snapshot);
        let cache = self.cache_file(&snapshot)?;
        if !tokio::fs::try_exists(&cache).await.unwrap_or(false) {
            return Ok(change);
        }

        let mtime = attrs.as_ref().and_then(|attrs| attrs.mtime);
        let previous_mtime = previous.as_ref().and_then(|attrs| attrs.mtime);
        // Also covers a stamp taken before a re-list brought in a new mtime.
        let target_outdated = !self
            .inner
            .store
            .get(&key)
            .target
            .is_some_and(|stamp| stamp.matches_mtime(mtime));
        if target_outdated || change.existed != change.exists || previous_mtime != mtime {
            tracing::debug!(
                path = %snapshot.location,
                ?previous_mtime,
                ?mtime,
                target_outdated,
                "recomputing remote digest"
            );
            let outcome = self
                .inner
                .digests
                .spawn_target_digest(key, mtime, cancel.clone())
                .outcome()
                .await;
            change.target_digest = Some(outcome);
        }
        Ok(change)
    }

    pub async fn refresh_tree(&self, node: NodeId) -> Result<RefreshSummary, MirrorError> {
        self.refresh_tree_with(node, &CancellationToken::new())
            .await
    }

    /// Re-lists every directory below `node` that was listed before and
    /// refreshes the state of every file found.
    pub async fn refresh_tree_with(
        &self,
        node: NodeId,
        cancel: &CancellationToken,
    ) -> Result<RefreshSummary, MirrorError> {
        let mut summary = RefreshSummary::default();
        let mut pending = vec![(node, true)];
        while let Some((current, is_start)) = pending.pop() {
            if cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }
            let snapshot = match self.snapshot(current).await {
                Ok(snapshot) => snapshot,
                // Dropped by a re-list of its parent.
                Err(MirrorError::StaleNode(_)) if !is_start => continue,
                Err(err) => return Err(err),
            };
            if snapshot.is_file() {
                self.refresh_state_with(current, cancel).await?;
                summary.files += 1;
                continue;
            }
            if !snapshot.children_queried && !is_start {
                continue;
            }
            if snapshot.kind != NodeKind::SystemRoot {
                self.refresh_state_with(current, cancel).await?;
            }
            self.query_children_with(current, true, cancel).await?;
            summary.dirs += 1;
            for child in self.children(current).await? {
                pending.push((child.id, false));
            }
        }
        tracing::info!(node = %node, dirs = summary.dirs, files = summary.files, "tree refreshed");
        Ok(summary)
    }
}
