use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use fsmirror_core::{DirEntry, FileAttrs, UserAccount};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::MirrorError;
use super::peer::Peer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Uuid);

impl NodeId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Per-peer namespace marker; its children are the file-system roots.
    SystemRoot,
    Root,
    Dir,
    File,
}

impl NodeKind {
    pub fn is_file(self) -> bool {
        self == NodeKind::File
    }

    pub fn is_container(self) -> bool {
        !self.is_file()
    }

    fn for_entry(parent: NodeKind, attrs: Option<&FileAttrs>) -> Self {
        if parent == NodeKind::SystemRoot {
            return NodeKind::Root;
        }
        match attrs {
            Some(attrs) if attrs.is_dir() => NodeKind::Dir,
            _ => NodeKind::File,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub id: NodeId,
    pub peer: Arc<Peer>,
    pub name: String,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub attrs: Option<FileAttrs>,
    pub children_queried: bool,
    pub query_in_progress: bool,
}

impl PartialEq for TreeNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TreeNode {}

impl Hash for TreeNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Read-only copy of a node, safe to hand to other threads.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub peer_id: String,
    pub name: String,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub attrs: Option<FileAttrs>,
    pub children_queried: bool,
    pub query_in_progress: bool,
    /// Path in the peer's native form, `\` separated on Windows.
    pub location: String,
    /// Path in cross-platform form; used on the wire and for cache addressing.
    pub remote_path: String,
    pub is_windows: bool,
}

impl NodeSnapshot {
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    pub fn exists(&self) -> bool {
        self.attrs.is_some() || self.kind == NodeKind::SystemRoot
    }

    pub fn mtime(&self) -> Option<i64> {
        self.attrs.as_ref().and_then(|attrs| attrs.mtime)
    }

    pub fn is_read_only(&self) -> bool {
        self.is_read_only_for(None)
    }

    pub fn is_read_only_for(&self, account: Option<&UserAccount>) -> bool {
        self.attrs
            .as_ref()
            .is_some_and(|attrs| attrs.is_read_only_for(account))
    }
}

impl PartialEq for NodeSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeSnapshot {}

pub(crate) type QueryWaiter = oneshot::Sender<Result<(), MirrorError>>;

/// Remote query in flight on one node and the callers waiting for it.
struct RunningQuery {
    cancel: CancellationToken,
    waiters: Vec<(u64, QueryWaiter)>,
}

impl RunningQuery {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            waiters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum QueryTarget {
    Roots,
    Dir(String),
}

pub(crate) enum QueryTicket {
    /// Children are already authoritative.
    Ready,
    /// Caller owns the remote query and must finish it. `cancel` fires once
    /// every waiter has withdrawn.
    Start {
        peer: Arc<Peer>,
        target: QueryTarget,
        cancel: CancellationToken,
        waiter: u64,
    },
    /// Another query is running; the waiter is completed by it.
    Joined { waiter: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolution {
    Found(NodeId),
    Missing(String),
    Unqueried(NodeId),
}

/// Mirrored namespace of every known peer.
///
/// Lives on the dispatch thread; see `DispatchContext`.
#[derive(Default)]
pub struct Tree {
    nodes: HashMap<NodeId, TreeNode>,
    roots: HashMap<String, NodeId>,
    queries: HashMap<NodeId, RunningQuery>,
    next_waiter: u64,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(&id)
    }

    pub fn root_of(&self, peer_id: &str) -> Option<NodeId> {
        self.roots.get(peer_id).copied()
    }

    /// Returns the namespace root for `peer`, creating it on first use.
    pub fn root_for(&mut self, peer: &Peer) -> NodeId {
        if let Some(id) = self.roots.get(&peer.id) {
            return *id;
        }
        let node = TreeNode {
            id: NodeId::new(),
            peer: Arc::new(peer.clone()),
            name: peer.name.clone(),
            kind: NodeKind::SystemRoot,
            parent: None,
            children: Vec::new(),
            attrs: None,
            children_queried: false,
            query_in_progress: false,
        };
        let id = node.id;
        self.nodes.insert(id, node);
        self.roots.insert(peer.id.clone(), id);
        id
    }

    /// Drops the peer's registry entry and every node below it.
    pub fn remove_peer(&mut self, peer_id: &str) -> usize {
        match self.roots.remove(peer_id) {
            Some(root) => self.remove_subtree(root).len(),
            None => 0,
        }
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.roots.keys().cloned().collect()
    }

    pub fn location(&self, id: NodeId, cross: bool) -> Option<String> {
        let node = self.nodes.get(&id)?;
        match node.kind {
            NodeKind::SystemRoot => Some(String::new()),
            NodeKind::Root => {
                if cross && node.peer.is_windows() {
                    Some(format!("{}/", trim_separators(&node.name)))
                } else {
                    Some(node.name.clone())
                }
            }
            NodeKind::Dir | NodeKind::File => {
                let parent = self.nodes.get(&node.parent?)?;
                let parent_location = self.location(parent.id, cross)?;
                if parent.kind == NodeKind::Root
                    && (parent_location.ends_with('/') || parent_location.ends_with('\\'))
                {
                    return Some(format!("{parent_location}{}", node.name));
                }
                let separator = if !cross && node.peer.is_windows() {
                    '\\'
                } else {
                    '/'
                };
                Some(format!("{parent_location}{separator}{}", node.name))
            }
        }
    }

    pub fn remote_path(&self, id: NodeId) -> Option<String> {
        self.location(id, true)
    }

    pub fn snapshot(&self, id: NodeId) -> Option<NodeSnapshot> {
        let node = self.nodes.get(&id)?;
        Some(NodeSnapshot {
            id,
            peer_id: node.peer.id.clone(),
            name: node.name.clone(),
            kind: node.kind,
            parent: node.parent,
            attrs: node.attrs.clone(),
            children_queried: node.children_queried,
            query_in_progress: node.query_in_progress,
            location: self.location(id, false)?,
            remote_path: self.location(id, true)?,
            is_windows: node.peer.is_windows(),
        })
    }

    pub fn children(&self, id: NodeId) -> Option<Vec<NodeSnapshot>> {
        let node = self.nodes.get(&id)?;
        Some(
            node.children
                .iter()
                .filter_map(|child| self.snapshot(*child))
                .collect(),
        )
    }

    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let node = self.nodes.get(&parent)?;
        let peer = &node.peer;
        node.children.iter().copied().find(|child| {
            self.nodes.get(child).is_some_and(|child| {
                if node.kind == NodeKind::SystemRoot {
                    peer.names_match(trim_separators(&child.name), trim_separators(name))
                } else {
                    peer.names_match(&child.name, name)
                }
            })
        })
    }

    /// True when `ancestor` lies strictly above `node`.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = self.nodes.get(&node).and_then(|n| n.parent);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    pub(crate) fn resolve(&self, start: NodeId, segments: &[String]) -> Resolution {
        let mut current = start;
        for segment in segments {
            let Some(node) = self.nodes.get(&current) else {
                return Resolution::Missing(segment.clone());
            };
            if !node.children_queried {
                return Resolution::Unqueried(current);
            }
            match self.find_child(current, segment) {
                Some(child) => current = child,
                None => return Resolution::Missing(segment.clone()),
            }
        }
        Resolution::Found(current)
    }

    pub(crate) fn begin_query(
        &mut self,
        id: NodeId,
        waiter: QueryWaiter,
        force: bool,
    ) -> Result<QueryTicket, MirrorError> {
        let node = self.nodes.get(&id).ok_or(MirrorError::StaleNode(id))?;
        if !node.kind.is_container() {
            return Err(MirrorError::NotADirectory(node.name.clone()));
        }
        let ticket = self.next_waiter;
        if node.query_in_progress {
            self.next_waiter += 1;
            self.queries
                .entry(id)
                .or_insert_with(RunningQuery::new)
                .waiters
                .push((ticket, waiter));
            return Ok(QueryTicket::Joined { waiter: ticket });
        }
        if node.children_queried && !force {
            return Ok(QueryTicket::Ready);
        }
        let peer = Arc::clone(&node.peer);
        let target = match node.kind {
            NodeKind::SystemRoot => QueryTarget::Roots,
            _ => QueryTarget::Dir(self.remote_path(id).ok_or(MirrorError::StaleNode(id))?),
        };
        if let Some(node) = self.nodes.get_mut(&id) {
            node.query_in_progress = true;
        }
        self.next_waiter += 1;
        let mut running = RunningQuery::new();
        running.waiters.push((ticket, waiter));
        let cancel = running.cancel.clone();
        self.queries.insert(id, running);
        Ok(QueryTicket::Start {
            peer,
            target,
            cancel,
            waiter: ticket,
        })
    }

    /// Drops one caller from the query on `id`. The remote query is only
    /// cancelled once nobody waits for it any more.
    pub(crate) fn withdraw_waiter(&mut self, id: NodeId, waiter: u64) {
        let Some(running) = self.queries.get_mut(&id) else {
            return;
        };
        running.waiters.retain(|(ticket, _)| *ticket != waiter);
        if running.waiters.is_empty() {
            running.cancel.cancel();
        }
    }

    /// Completes the in-flight query on `id` and every waiter queued behind it.
    ///
    /// A cancelled query that gained waiters after everyone before them had
    /// withdrawn stays in progress; the returned token drives its rerun.
    pub(crate) fn finish_query(
        &mut self,
        id: NodeId,
        result: Result<Vec<DirEntry>, MirrorError>,
    ) -> Option<CancellationToken> {
        let Some(mut running) = self.queries.remove(&id) else {
            self.complete_query(id, Vec::new(), result);
            return None;
        };
        let rerun = matches!(&result, Err(err) if err.is_cancelled())
            && !running.waiters.is_empty()
            && self.nodes.contains_key(&id);
        if rerun {
            running.cancel = CancellationToken::new();
            let cancel = running.cancel.clone();
            self.queries.insert(id, running);
            return Some(cancel);
        }
        self.complete_query(id, running.waiters, result);
        None
    }

    fn complete_query(
        &mut self,
        id: NodeId,
        waiters: Vec<(u64, QueryWaiter)>,
        result: Result<Vec<DirEntry>, MirrorError>,
    ) {
        let outcome: Result<(), Arc<MirrorError>> = match result {
            Ok(entries) if self.nodes.contains_key(&id) => {
                self.merge_children(id, entries);
                Ok(())
            }
            Ok(_) => Err(Arc::new(MirrorError::StaleNode(id))),
            Err(err) => Err(Arc::new(err)),
        };
        if let Some(node) = self.nodes.get_mut(&id) {
            node.query_in_progress = false;
            node.children_queried = outcome.is_ok();
        }
        for (_, waiter) in waiters {
            let _ = waiter.send(outcome.clone().map_err(MirrorError::Shared));
        }
    }

    /// Replaces the child set of `parent` with `entries`, keeping the identity
    /// of children whose names still match.
    pub(crate) fn merge_children(&mut self, parent: NodeId, entries: Vec<DirEntry>) {
        let Some(parent_node) = self.nodes.get_mut(&parent) else {
            return;
        };
        let peer = Arc::clone(&parent_node.peer);
        let parent_kind = parent_node.kind;
        let previous = std::mem::take(&mut parent_node.children);

        let mut by_name: HashMap<String, NodeId> = HashMap::with_capacity(previous.len());
        for child in previous {
            if let Some(node) = self.nodes.get(&child) {
                by_name.insert(peer.name_key(&node.name), child);
            }
        }

        let mut next = Vec::with_capacity(entries.len());
        for entry in entries {
            let kind = NodeKind::for_entry(parent_kind, entry.attrs.as_ref());
            match by_name.remove(&peer.name_key(&entry.name)) {
                Some(existing) => {
                    let mut orphaned = Vec::new();
                    if let Some(node) = self.nodes.get_mut(&existing) {
                        if node.kind != kind {
                            orphaned = std::mem::take(&mut node.children);
                            node.children_queried = false;
                            node.kind = kind;
                        }
                        node.name = entry.name;
                        node.attrs = entry.attrs;
                    }
                    for orphan in orphaned {
                        self.drop_detached(orphan);
                    }
                    next.push(existing);
                }
                None => {
                    let node = TreeNode {
                        id: NodeId::new(),
                        peer: Arc::clone(&peer),
                        name: entry.name,
                        kind,
                        parent: Some(parent),
                        children: Vec::new(),
                        attrs: entry.attrs,
                        children_queried: false,
                        query_in_progress: false,
                    };
                    next.push(node.id);
                    self.nodes.insert(node.id, node);
                }
            }
        }

        for (_, gone) in by_name {
            self.drop_detached(gone);
        }
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children = next;
        }
    }

    /// Adds a child created locally (copy, create) or refreshes the
    /// attributes of the one already carrying that name.
    pub fn insert_child(
        &mut self,
        parent: NodeId,
        name: &str,
        attrs: Option<FileAttrs>,
    ) -> Result<NodeId, MirrorError> {
        if let Some(existing) = self.find_child(parent, name) {
            self.set_attrs(existing, attrs);
            return Ok(existing);
        }
        let parent_node = self
            .nodes
            .get_mut(&parent)
            .ok_or(MirrorError::StaleNode(parent))?;
        let node = TreeNode {
            id: NodeId::new(),
            peer: Arc::clone(&parent_node.peer),
            name: name.to_string(),
            kind: NodeKind::for_entry(parent_node.kind, attrs.as_ref()),
            parent: Some(parent),
            children: Vec::new(),
            attrs,
            children_queried: false,
            query_in_progress: false,
        };
        let id = node.id;
        parent_node.children.push(id);
        self.nodes.insert(id, node);
        Ok(id)
    }

    /// Stores fresh attributes and returns the previous ones.
    pub fn set_attrs(&mut self, id: NodeId, attrs: Option<FileAttrs>) -> Option<Option<FileAttrs>> {
        let node = self.nodes.get_mut(&id)?;
        if let Some(new_attrs) = attrs.as_ref()
            && matches!(node.kind, NodeKind::Dir | NodeKind::File)
        {
            node.kind = if new_attrs.is_dir() {
                NodeKind::Dir
            } else {
                NodeKind::File
            };
        }
        Some(std::mem::replace(&mut node.attrs, attrs))
    }

    /// Moves `id` under `new_parent` as `new_name`; identity is kept.
    pub fn move_node(
        &mut self,
        id: NodeId,
        new_parent: NodeId,
        new_name: &str,
    ) -> Result<(), MirrorError> {
        if !self.nodes.contains_key(&new_parent) {
            return Err(MirrorError::StaleNode(new_parent));
        }
        let old_parent = {
            let node = self.nodes.get_mut(&id).ok_or(MirrorError::StaleNode(id))?;
            node.name = new_name.to_string();
            node.parent.replace(new_parent)
        };
        if let Some(old_parent) = old_parent.and_then(|p| self.nodes.get_mut(&p)) {
            old_parent.children.retain(|child| *child != id);
        }
        if let Some(parent) = self.nodes.get_mut(&new_parent)
            && !parent.children.contains(&id)
        {
            parent.children.push(id);
        }
        Ok(())
    }

    pub fn rename_node(&mut self, id: NodeId, new_name: &str) -> Result<(), MirrorError> {
        let node = self.nodes.get_mut(&id).ok_or(MirrorError::StaleNode(id))?;
        node.name = new_name.to_string();
        Ok(())
    }

    /// Detaches `id` from its parent and drops it with all descendants.
    pub fn remove_subtree(&mut self, id: NodeId) -> Vec<NodeId> {
        if let Some(parent) = self
            .nodes
            .get(&id)
            .and_then(|node| node.parent)
            .and_then(|parent| self.nodes.get_mut(&parent))
        {
            parent.children.retain(|child| *child != id);
        }
        self.drop_detached(id)
    }

    fn drop_detached(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children);
                if let Some(running) = self.queries.remove(&current) {
                    running.cancel.cancel();
                    for (_, waiter) in running.waiters {
                        let _ = waiter.send(Err(MirrorError::StaleNode(current)));
                    }
                }
                removed.push(current);
            }
        }
        removed
    }
}

pub(crate) fn trim_separators(name: &str) -> &str {
    let trimmed = name.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() { name } else { trimmed }
}

/// Splits a relative path into names; `\` also separates on Windows peers.
pub(crate) fn path_segments(peer: &Peer, from_system_root: bool, path: &str) -> Vec<String> {
    let windows = peer.is_windows();
    let mut segments = Vec::new();
    let mut rest = path;
    if from_system_root && let Some(stripped) = path.strip_prefix('/') {
        segments.push("/".to_string());
        rest = stripped;
    }
    segments.extend(
        rest.split(|c: char| c == '/' || (windows && c == '\\'))
            .filter(|segment| !segment.is_empty() && *segment != ".")
            .map(str::to_string),
    );
    segments
}
