use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use fsmirror_core::{ByteStream, FileAttrs, FileService, UserAccount};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::channel::Channel;
use super::error::MirrorError;
use super::session::MirrorSession;
use super::tree::{NodeId, NodeKind, NodeSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Copy { nodes: Vec<NodeId>, dest: NodeId },
    Move { nodes: Vec<NodeId>, dest: NodeId },
    Delete { nodes: Vec<NodeId> },
    Rename { node: NodeId, new_name: String },
    Create {
        parent: NodeId,
        name: String,
        kind: CreateKind,
    },
    Refresh { node: NodeId },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Copy { .. } => "copy",
            Operation::Move { .. } => "move",
            Operation::Delete { .. } => "delete",
            Operation::Rename { .. } => "rename",
            Operation::Create { .. } => "create",
            Operation::Refresh { .. } => "refresh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Proceed,
    ProceedAll,
    Skip,
    Cancel,
}

/// Asked before an existing destination is overwritten or a read-only file
/// is deleted. Runs on a blocking worker, so it may wait for a person.
pub trait ConfirmCallback: Send + Sync {
    fn requires(&self, node: &NodeSnapshot) -> bool;
    fn confirm(&self, node: &NodeSnapshot) -> Confirmation;
}

/// Receives the outcome of a background operation on the dispatch thread.
pub trait Completion: Send + Sync {
    fn done(&self, caller: &str, outcome: &Outcome);
}

#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub path: String,
    pub error: Arc<MirrorError>,
}

#[derive(Debug, Clone, Default)]
pub struct OperationReport {
    pub completed: usize,
    pub skipped: Vec<String>,
    pub failures: Vec<ItemFailure>,
}

#[derive(Debug, Clone)]
pub struct OperationFailure {
    pub message: String,
    pub source: Option<Arc<MirrorError>>,
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Completed(OperationReport),
    /// Finished with warnings: some items were skipped or failed.
    Partial(OperationReport),
    Cancelled(OperationReport),
    Failed(OperationFailure),
}

impl Outcome {
    fn from_report(report: OperationReport, cancelled: bool) -> Self {
        if cancelled {
            return Outcome::Cancelled(report);
        }
        match report.failures.first() {
            None if report.skipped.is_empty() => Outcome::Completed(report),
            None => Outcome::Partial(report),
            Some(first) if report.completed == 0 && report.skipped.is_empty() => {
                Outcome::Failed(OperationFailure {
                    message: first.error.to_string(),
                    source: Some(Arc::clone(&first.error)),
                })
            }
            Some(_) => Outcome::Partial(report),
        }
    }

    fn failed(error: MirrorError) -> Self {
        Outcome::Failed(OperationFailure {
            message: error.to_string(),
            source: Some(Arc::new(error)),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn report(&self) -> Option<&OperationReport> {
        match self {
            Outcome::Completed(report) | Outcome::Partial(report) | Outcome::Cancelled(report) => {
                Some(report)
            }
            Outcome::Failed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    pub done: usize,
    pub current: Option<String>,
}

/// Shared view of a running operation; cancelling it stops the operation
/// before its next remote call.
#[derive(Clone, Default)]
pub struct ProgressMonitor {
    cancel: CancellationToken,
    progress: Arc<Mutex<Progress>>,
}

impl ProgressMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn progress(&self) -> Progress {
        self.progress.lock().clone()
    }

    fn begin(&self, total: usize) {
        let mut progress = self.progress.lock();
        progress.total = total;
        progress.done = 0;
    }

    fn item(&self, path: &str) {
        self.progress.lock().current = Some(path.to_string());
    }

    fn worked(&self) {
        let mut progress = self.progress.lock();
        progress.done += 1;
        progress.current = None;
    }
}

/// Handle on an operation running in the background.
pub struct BackgroundOperation {
    pub monitor: ProgressMonitor,
    handle: JoinHandle<Outcome>,
}

impl BackgroundOperation {
    pub fn cancel(&self) {
        self.monitor.cancel();
    }

    pub async fn wait(self) -> Outcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) => Outcome::Failed(OperationFailure {
                message: format!("operation task failed: {err}"),
                source: None,
            }),
        }
    }
}

/// Runs file operations inline, in the background, or in the background
/// with confirmations.
#[derive(Clone)]
pub struct OperationExecutor {
    session: MirrorSession,
}

impl OperationExecutor {
    pub fn new(session: MirrorSession) -> Self {
        Self { session }
    }

    /// Runs in the caller's task. Overwrites and read-only deletions proceed
    /// without asking.
    pub async fn run_inline(&self, operation: Operation) -> Outcome {
        self.run_with(operation, ProgressMonitor::new(), None).await
    }

    pub fn run_background(
        &self,
        operation: Operation,
        caller: impl Into<String>,
        completion: Arc<dyn Completion>,
    ) -> BackgroundOperation {
        self.spawn(operation, caller.into(), None, completion)
    }

    pub fn run_interactive(
        &self,
        operation: Operation,
        caller: impl Into<String>,
        confirm: Arc<dyn ConfirmCallback>,
        completion: Arc<dyn Completion>,
    ) -> BackgroundOperation {
        self.spawn(operation, caller.into(), Some(confirm), completion)
    }

    fn spawn(
        &self,
        operation: Operation,
        caller: String,
        confirm: Option<Arc<dyn ConfirmCallback>>,
        completion: Arc<dyn Completion>,
    ) -> BackgroundOperation {
        let monitor = ProgressMonitor::new();
        let executor = self.clone();
        let task_monitor = monitor.clone();
        let handle = self.session.inner.runtime.spawn(async move {
            let outcome = executor.run_with(operation, task_monitor, confirm).await;
            executor.deliver(caller, completion, outcome.clone());
            outcome
        });
        BackgroundOperation { monitor, handle }
    }

    fn deliver(&self, caller: String, completion: Arc<dyn Completion>, outcome: Outcome) {
        let fallback = (Arc::clone(&completion), caller.clone(), outcome.clone());
        if let Err(err) = self
            .session
            .inner
            .dispatcher
            .submit(move |_| completion.done(&caller, &outcome))
        {
            tracing::warn!(error = %err, "delivering completion outside the dispatch thread");
            let (completion, caller, outcome) = fallback;
            completion.done(&caller, &outcome);
        }
    }

    async fn run_with(
        &self,
        operation: Operation,
        monitor: ProgressMonitor,
        confirm: Option<Arc<dyn ConfirmCallback>>,
    ) -> Outcome {
        let name = operation.name();
        tracing::debug!(operation = name, "operation started");
        let mut run = Run {
            session: &self.session,
            monitor,
            confirm,
            proceed_all: false,
            channels: HashMap::new(),
            accounts: HashMap::new(),
            report: OperationReport::default(),
        };
        let result = run.execute(operation).await;
        run.release(false);
        let outcome = match result {
            Ok(cancelled) => Outcome::from_report(run.report, cancelled),
            Err(err) if err.is_cancelled() => Outcome::Cancelled(run.report),
            Err(err) => Outcome::failed(err),
        };
        match &outcome {
            Outcome::Completed(_) => tracing::info!(operation = name, "operation completed"),
            Outcome::Partial(report) => tracing::warn!(
                operation = name,
                skipped = report.skipped.len(),
                failed = report.failures.len(),
                "operation finished with warnings"
            ),
            Outcome::Cancelled(_) => tracing::info!(operation = name, "operation cancelled"),
            Outcome::Failed(failure) => {
                tracing::warn!(operation = name, error = %failure, "operation failed")
            }
        }
        outcome
    }
}

/// Copy of `name` placed next to the original: `Copy of a.txt`, then
/// `Copy (1) of a.txt`, `Copy (2) of a.txt`, ...
pub fn copy_name(name: &str, attempt: usize) -> String {
    if attempt == 0 {
        format!("Copy of {name}")
    } else {
        format!("Copy ({attempt}) of {name}")
    }
}

fn child_path(parent: &NodeSnapshot, name: &str) -> String {
    if parent.remote_path.ends_with('/') {
        format!("{}{name}", parent.remote_path)
    } else {
        format!("{}/{name}", parent.remote_path)
    }
}

fn validate_name(name: &str, windows: bool) -> Result<(), MirrorError> {
    let bad_char = name.contains('/') || (windows && name.contains(['\\', ':']));
    if name.is_empty() || name == "." || name == ".." || bad_char {
        return Err(MirrorError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Done,
    /// Left partly or wholly untouched; the skip is already reported.
    Skipped,
}

struct Run<'a> {
    session: &'a MirrorSession,
    monitor: ProgressMonitor,
    confirm: Option<Arc<dyn ConfirmCallback>>,
    proceed_all: bool,
    channels: HashMap<String, Channel>,
    accounts: HashMap<String, Option<UserAccount>>,
    report: OperationReport,
}

impl Run<'_> {
    /// Returns whether the operation was cancelled part way.
    async fn execute(&mut self, operation: Operation) -> Result<bool, MirrorError> {
        match operation {
            Operation::Copy { nodes, dest } => self.transfer(nodes, dest, false).await,
            Operation::Move { nodes, dest } => self.transfer(nodes, dest, true).await,
            Operation::Delete { nodes } => self.delete(nodes).await,
            Operation::Rename { node, new_name } => {
                self.monitor.begin(1);
                self.rename(node, &new_name).await?;
                self.report.completed += 1;
                self.monitor.worked();
                Ok(false)
            }
            Operation::Create { parent, name, kind } => {
                self.monitor.begin(1);
                self.create(parent, &name, kind).await?;
                self.report.completed += 1;
                self.monitor.worked();
                Ok(false)
            }
            Operation::Refresh { node } => {
                self.monitor.begin(1);
                let summary = self
                    .session
                    .refresh_tree_with(node, self.monitor.token())
                    .await?;
                self.report.completed += summary.dirs + summary.files;
                self.monitor.worked();
                Ok(false)
            }
        }
    }

    fn check_cancel(&self) -> Result<(), MirrorError> {
        if self.monitor.is_cancelled() {
            return Err(MirrorError::Cancelled);
        }
        Ok(())
    }

    async fn service(&mut self, peer_id: &str) -> Result<Arc<dyn FileService>, MirrorError> {
        if let Some(channel) = self.channels.get(peer_id)
            && !channel.is_closed()
        {
            return Ok(channel.file_system()?);
        }
        let channel = self.session.inner.channels.open_by_id(peer_id).await?;
        let service = channel.file_system()?;
        self.channels.insert(peer_id.to_string(), channel);
        Ok(service)
    }

    /// Account deciding POSIX write access on the peer; `None` when the
    /// agent cannot tell.
    async fn account(&mut self, peer_id: &str) -> Option<UserAccount> {
        if let Some(account) = self.accounts.get(peer_id) {
            return account.clone();
        }
        let account = match self.session.user_account(peer_id).await {
            Ok(account) => Some(account),
            Err(err) => {
                tracing::debug!(peer = peer_id, error = %err, "agent account unknown");
                None
            }
        };
        self.accounts.insert(peer_id.to_string(), account.clone());
        account
    }

    /// Closes the channels held by this run. Broken ones are reopened by
    /// the next call.
    fn release(&mut self, broken: bool) {
        for (_, channel) in self.channels.drain() {
            if broken {
                channel.mark_broken();
            }
            channel.close();
        }
    }

    async fn ask(&mut self, node: &NodeSnapshot) -> Result<Confirmation, MirrorError> {
        if self.proceed_all {
            return Ok(Confirmation::Proceed);
        }
        let Some(callback) = self.confirm.clone() else {
            return Ok(Confirmation::Proceed);
        };
        let candidate = node.clone();
        let answer = tokio::task::spawn_blocking(move || {
            if callback.requires(&candidate) {
                callback.confirm(&candidate)
            } else {
                Confirmation::Proceed
            }
        })
        .await
        .unwrap_or(Confirmation::Cancel);
        tracing::debug!(path = %node.location, ?answer, "confirmation answered");
        match answer {
            Confirmation::ProceedAll => {
                self.proceed_all = true;
                Ok(Confirmation::Proceed)
            }
            Confirmation::Cancel => Err(MirrorError::Cancelled),
            other => Ok(other),
        }
    }

    fn record(&mut self, path: &str, result: Result<Step, MirrorError>) -> bool {
        match result {
            Ok(Step::Done) => self.report.completed += 1,
            Ok(Step::Skipped) => {}
            Err(err) if err.is_cancelled() => return true,
            Err(err) => {
                if err.is_connection() {
                    self.release(true);
                }
                tracing::warn!(path, error = %err, "item failed");
                self.report.failures.push(ItemFailure {
                    path: path.to_string(),
                    error: Arc::new(err),
                });
            }
        }
        self.monitor.worked();
        false
    }

    fn skip(&mut self, node: &NodeSnapshot) -> Step {
        self.report.skipped.push(node.location.clone());
        Step::Skipped
    }

    /// Drops entries whose ancestor is also selected.
    async fn top_level(&self, nodes: Vec<NodeId>) -> Result<Vec<NodeId>, MirrorError> {
        self.session
            .with_tree(move |tree| {
                nodes
                    .iter()
                    .copied()
                    .filter(|node| !nodes.iter().any(|other| tree.is_ancestor(*other, *node)))
                    .collect()
            })
            .await
    }

    async fn find_child(
        &self,
        parent: NodeId,
        name: &str,
    ) -> Result<Option<NodeSnapshot>, MirrorError> {
        self.session.ensure_children(parent).await?;
        let name = name.to_string();
        self.session
            .with_tree(move |tree| {
                tree.find_child(parent, &name)
                    .and_then(|child| tree.snapshot(child))
            })
            .await
    }

    async fn insert_child(
        &mut self,
        parent: &NodeSnapshot,
        name: &str,
        fallback: FileAttrs,
    ) -> Result<NodeId, MirrorError> {
        let path = child_path(parent, name);
        let service = self.service(&parent.peer_id).await?;
        let attrs = match service.stat(&path).await {
            Ok(attrs) => attrs,
            Err(err) => {
                tracing::debug!(path, error = %err, "stat of new entry failed");
                fallback
            }
        };
        let parent_id = parent.id;
        let name = name.to_string();
        self.session
            .with_tree_mut(move |tree| tree.insert_child(parent_id, &name, Some(attrs)))
            .await?
    }

    async fn delete(&mut self, nodes: Vec<NodeId>) -> Result<bool, MirrorError> {
        let nodes = self.top_level(nodes).await?;
        self.monitor.begin(nodes.len());
        for node in nodes {
            let path = match self.session.snapshot(node).await {
                Ok(snapshot) => snapshot.location,
                Err(err) => {
                    self.record(&node.to_string(), Err(err));
                    continue;
                }
            };
            self.monitor.item(&path);
            let result = self.delete_node(node).await;
            if self.record(&path, result) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn delete_node(&mut self, node: NodeId) -> BoxFuture<'_, Result<Step, MirrorError>> {
        async move {
            self.check_cancel()?;
            let snapshot = self.session.snapshot(node).await?;
            let service = self.service(&snapshot.peer_id).await?;

            if snapshot.is_file() {
                let account = if snapshot.is_windows {
                    None
                } else {
                    self.account(&snapshot.peer_id).await
                };
                if snapshot.is_read_only_for(account.as_ref()) {
                    match self.ask(&snapshot).await? {
                        Confirmation::Skip => return Ok(self.skip(&snapshot)),
                        _ => {
                            let writable = snapshot
                                .attrs
                                .as_ref()
                                .map(|attrs| attrs.writable_for(account.as_ref()));
                            if let Some(attrs) = writable
                                && let Err(err) =
                                    service.set_stat(&snapshot.remote_path, &attrs).await
                            {
                                tracing::debug!(path = %snapshot.location, error = %err, "could not make file writable");
                            }
                        }
                    }
                }
                self.check_cancel()?;
                service
                    .remove(&snapshot.remote_path)
                    .await
                    .map_err(|err| MirrorError::from(err).context(snapshot.location.clone()))?;
            } else {
                self.session.ensure_children(node).await?;
                let mut complete = true;
                for child in self.session.children(node).await? {
                    if self.delete_node(child.id).await? == Step::Skipped {
                        complete = false;
                    }
                }
                if !complete {
                    return Ok(Step::Skipped);
                }
                self.check_cancel()?;
                service
                    .rmdir(&snapshot.remote_path)
                    .await
                    .map_err(|err| MirrorError::from(err).context(snapshot.location.clone()))?;
            }

            self.session
                .with_tree_mut(move |tree| tree.remove_subtree(node))
                .await?;
            self.session.drop_cache(&snapshot).await;
            Ok(Step::Done)
        }
        .boxed()
    }

    async fn transfer(
        &mut self,
        nodes: Vec<NodeId>,
        dest: NodeId,
        moving: bool,
    ) -> Result<bool, MirrorError> {
        let dest_snapshot = self.session.snapshot(dest).await?;
        if dest_snapshot.is_file() || dest_snapshot.kind == NodeKind::SystemRoot {
            return Err(MirrorError::NotADirectory(dest_snapshot.location));
        }
        self.session.ensure_children(dest).await?;
        let nodes = self.top_level(nodes).await?;
        self.monitor.begin(nodes.len());

        for node in nodes {
            let snapshot = match self.session.snapshot(node).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    self.record(&node.to_string(), Err(err));
                    continue;
                }
            };
            self.monitor.item(&snapshot.location);
            let result = self.transfer_one(&snapshot, &dest_snapshot, moving).await;
            if self.record(&snapshot.location, result) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn transfer_one(
        &mut self,
        snapshot: &NodeSnapshot,
        dest: &NodeSnapshot,
        moving: bool,
    ) -> Result<Step, MirrorError> {
        if snapshot.peer_id != dest.peer_id {
            return Err(MirrorError::NotFound(format!(
                "{} on peer {}",
                dest.location, snapshot.peer_id
            ))
            .context(snapshot.location.clone()));
        }
        if snapshot.id == dest.id || self.session.is_ancestor(snapshot.id, dest.id).await? {
            return Err(MirrorError::InvalidName(dest.location.clone())
                .context(snapshot.location.clone()));
        }
        if !moving {
            let name = if snapshot.parent == Some(dest.id) {
                self.free_copy_name(dest.id, &snapshot.name).await?
            } else {
                snapshot.name.clone()
            };
            return self.copy_node(snapshot.id, dest.id, name).await;
        }
        if snapshot.parent == Some(dest.id) {
            return Ok(Step::Done);
        }
        self.move_node(snapshot.id, dest.id, snapshot.name.clone())
            .await
    }

    async fn free_copy_name(&self, dest: NodeId, name: &str) -> Result<String, MirrorError> {
        let mut attempt = 0;
        loop {
            let candidate = copy_name(name, attempt);
            if self.find_child(dest, &candidate).await?.is_none() {
                return Ok(candidate);
            }
            attempt += 1;
        }
    }

    /// Confirms replacing `existing` with `source`, rejecting a file and a
    /// directory standing in for each other.
    async fn replace(
        &mut self,
        source: &NodeSnapshot,
        existing: &NodeSnapshot,
    ) -> Result<Confirmation, MirrorError> {
        if source.is_file() != existing.is_file() {
            return Err(MirrorError::TypeMismatch {
                path: existing.location.clone(),
            });
        }
        self.ask(existing).await
    }

    fn copy_node(
        &mut self,
        node: NodeId,
        dest: NodeId,
        name: String,
    ) -> BoxFuture<'_, Result<Step, MirrorError>> {
        async move {
            self.check_cancel()?;
            let source = self.session.snapshot(node).await?;
            let dest_snapshot = self.session.snapshot(dest).await?;
            let existing = self.find_child(dest, &name).await?;
            let target = child_path(&dest_snapshot, &name);
            let service = self.service(&source.peer_id).await?;
            let context = |err: MirrorError| err.context(source.location.clone());

            if source.is_file() {
                let mut overwrite = false;
                if let Some(existing) = &existing {
                    if self.replace(&source, existing).await? == Confirmation::Skip {
                        return Ok(self.skip(&source));
                    }
                    overwrite = true;
                }
                self.check_cancel()?;
                service
                    .copy(&source.remote_path, &target, overwrite)
                    .await
                    .map_err(|err| context(err.into()))?;
                let fallback = source
                    .attrs
                    .clone()
                    .unwrap_or_else(|| FileAttrs::file(0, None));
                self.insert_child(&dest_snapshot, &name, fallback).await?;
                if let Some(existing) = &existing {
                    self.session.drop_cache(existing).await;
                }
                return Ok(Step::Done);
            }

            let target_dir = match &existing {
                Some(existing) => {
                    if self.replace(&source, existing).await? == Confirmation::Skip {
                        return Ok(self.skip(&source));
                    }
                    existing.id
                }
                None => {
                    self.check_cancel()?;
                    service.mkdir(&target).await.map_err(|err| context(err.into()))?;
                    self.insert_child(&dest_snapshot, &name, FileAttrs::dir(None))
                        .await?
                }
            };
            self.session.ensure_children(node).await?;
            let mut step = Step::Done;
            for child in self.session.children(node).await? {
                if self.copy_node(child.id, target_dir, child.name).await? == Step::Skipped {
                    step = Step::Skipped;
                }
            }
            Ok(step)
        }
        .boxed()
    }

    fn move_node(
        &mut self,
        node: NodeId,
        dest: NodeId,
        name: String,
    ) -> BoxFuture<'_, Result<Step, MirrorError>> {
        async move {
            self.check_cancel()?;
            let source = self.session.snapshot(node).await?;
            let dest_snapshot = self.session.snapshot(dest).await?;
            let existing = self.find_child(dest, &name).await?;
            let target = child_path(&dest_snapshot, &name);
            let service = self.service(&source.peer_id).await?;
            let context = |err: MirrorError| err.context(source.location.clone());

            match &existing {
                Some(existing) if !source.is_file() => {
                    if self.replace(&source, existing).await? == Confirmation::Skip {
                        return Ok(self.skip(&source));
                    }
                    // Merge into the existing directory, then drop the emptied source.
                    self.session.ensure_children(node).await?;
                    let mut complete = true;
                    for child in self.session.children(node).await? {
                        if self.move_node(child.id, existing.id, child.name).await? == Step::Skipped
                        {
                            complete = false;
                        }
                    }
                    if !complete {
                        return Ok(Step::Skipped);
                    }
                    self.check_cancel()?;
                    service
                        .rmdir(&source.remote_path)
                        .await
                        .map_err(|err| context(err.into()))?;
                    self.session
                        .with_tree_mut(move |tree| tree.remove_subtree(node))
                        .await?;
                    self.session.drop_cache(&source).await;
                    return Ok(Step::Done);
                }
                Some(existing) => {
                    if self.replace(&source, existing).await? == Confirmation::Skip {
                        return Ok(self.skip(&source));
                    }
                }
                None => {}
            }

            self.check_cancel()?;
            service
                .rename(&source.remote_path, &target, existing.is_some())
                .await
                .map_err(|err| context(err.into()))?;
            if let Some(existing) = &existing {
                let replaced = existing.id;
                self.session
                    .with_tree_mut(move |tree| tree.remove_subtree(replaced))
                    .await?;
                self.session.drop_cache(existing).await;
            }
            let new_name = name.clone();
            self.session
                .with_tree_mut(move |tree| tree.move_node(node, dest, &new_name))
                .await??;
            self.session
                .move_cache(&source.peer_id, &source.remote_path, &target)
                .await;
            Ok(Step::Done)
        }
        .boxed()
    }

    async fn rename(&mut self, node: NodeId, new_name: &str) -> Result<(), MirrorError> {
        self.check_cancel()?;
        let snapshot = self.session.snapshot(node).await?;
        validate_name(new_name, snapshot.is_windows)?;
        let parent = snapshot
            .parent
            .filter(|_| matches!(snapshot.kind, NodeKind::Dir | NodeKind::File))
            .ok_or_else(|| MirrorError::InvalidName(snapshot.location.clone()))?;
        if let Some(existing) = self.find_child(parent, new_name).await?
            && existing.id != node
        {
            return Err(MirrorError::AlreadyExists(existing.location));
        }
        let parent_snapshot = self.session.snapshot(parent).await?;
        let target = child_path(&parent_snapshot, new_name);
        let service = self.service(&snapshot.peer_id).await?;
        service
            .rename(&snapshot.remote_path, &target, false)
            .await
            .map_err(|err| MirrorError::from(err).context(snapshot.location.clone()))?;

        let name = new_name.to_string();
        self.session
            .with_tree_mut(move |tree| tree.rename_node(node, &name))
            .await??;
        self.session
            .move_cache(&snapshot.peer_id, &snapshot.remote_path, &target)
            .await;
        Ok(())
    }

    async fn create(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: CreateKind,
    ) -> Result<NodeId, MirrorError> {
        self.check_cancel()?;
        let parent_snapshot = self.session.snapshot(parent).await?;
        if parent_snapshot.is_file() || parent_snapshot.kind == NodeKind::SystemRoot {
            return Err(MirrorError::NotADirectory(parent_snapshot.location));
        }
        validate_name(name, parent_snapshot.is_windows)?;
        if let Some(existing) = self.find_child(parent, name).await? {
            return Err(MirrorError::AlreadyExists(existing.location));
        }
        let target = child_path(&parent_snapshot, name);
        let service = self.service(&parent_snapshot.peer_id).await?;
        let context = |err: MirrorError| err.context(target.clone());
        let fallback = match kind {
            CreateKind::File => {
                let empty: ByteStream = Box::pin(futures_util::stream::empty());
                service
                    .write(&target, empty)
                    .await
                    .map_err(|err| context(err.into()))?;
                FileAttrs::file(0, None)
            }
            CreateKind::Dir => {
                service
                    .mkdir(&target)
                    .await
                    .map_err(|err| context(err.into()))?;
                FileAttrs::dir(None)
            }
        };
        self.insert_child(&parent_snapshot, name, fallback).await
    }
}

impl MirrorSession {
    /// Removes the cache file or directory of a deleted node and its digest
    /// records. Local failures are logged only.
    pub(crate) async fn drop_cache(&self, snapshot: &NodeSnapshot) {
        let Ok(path) = self.cache_file(snapshot) else {
            return;
        };
        let removed = if snapshot.is_file() {
            tokio::fs::remove_file(&path).await
        } else {
            tokio::fs::remove_dir_all(&path).await
        };
        if let Err(err) = removed
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %err, "could not remove cache entry");
        }
        self.inner
            .store
            .remove_prefix(&snapshot.peer_id, &snapshot.remote_path);
    }

    /// Follows a remote rename with the cache entry and digest records.
    pub(crate) async fn move_cache(&self, peer_id: &str, from: &str, to: &str) {
        let layout = &self.inner.layout;
        if let (Ok(old), Ok(new)) = (layout.cache_path(peer_id, from), layout.cache_path(peer_id, to))
            && tokio::fs::try_exists(&old).await.unwrap_or(false)
        {
            let moved = match new.parent() {
                Some(parent) => match tokio::fs::create_dir_all(parent).await {
                    Ok(()) => tokio::fs::rename(&old, &new).await,
                    Err(err) => Err(err),
                },
                None => tokio::fs::rename(&old, &new).await,
            };
            if let Err(err) = moved {
                tracing::warn!(from = %old.display(), to = %new.display(), error = %err, "could not move cache entry");
            }
        }
        self.inner.store.rename_prefix(peer_id, from, to);
    }
}
