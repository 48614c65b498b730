use std::io;
use std::sync::Arc;

use fsmirror_core::RemoteError;
use thiserror::Error;

use super::channel::ChannelError;
use super::dispatch::DispatchError;
use super::paths::PathError;
use super::transfer::TransferError;
use super::tree::NodeId;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("remote operation failed: {0}")]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("cache path error: {0}")]
    Path(#[from] PathError),
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),
    #[error("local I/O error: {0}")]
    LocalIo(#[from] io::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("cannot replace {path}: one side is a file, the other a directory")]
    TypeMismatch { path: String },
    #[error("invalid name: {0:?}")]
    InvalidName(String),
    #[error("cache watcher failed: {0}")]
    Watch(#[from] notify::Error),
    #[error("node {0} is no longer part of the tree")]
    StaleNode(NodeId),
    #[error("operation cancelled")]
    Cancelled,
    #[error("{path}: {source}")]
    Context {
        path: String,
        #[source]
        source: Box<MirrorError>,
    },
    #[error(transparent)]
    Shared(Arc<MirrorError>),
}

impl MirrorError {
    /// Names the node or path being processed without changing the error.
    pub fn context(self, path: impl Into<String>) -> Self {
        MirrorError::Context {
            path: path.into(),
            source: Box::new(self),
        }
    }

    /// The underlying error with context and sharing peeled off.
    pub fn root(&self) -> &MirrorError {
        match self {
            MirrorError::Context { source, .. } => source.root(),
            MirrorError::Shared(inner) => inner.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            MirrorError::NotFound(_) => true,
            MirrorError::Remote(err) => err.is_not_found(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), MirrorError::Cancelled)
    }

    pub fn is_connection(&self) -> bool {
        match self.root() {
            MirrorError::Channel(ChannelError::Connect { .. }) => true,
            MirrorError::Remote(err) => err.is_connection(),
            _ => false,
        }
    }

    pub fn is_local_io(&self) -> bool {
        matches!(self.root(), MirrorError::LocalIo(_))
    }
}
