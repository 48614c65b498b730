pub mod backoff;
pub mod cache_state;
pub mod channel;
pub mod digest;
pub mod dispatch;
mod error;
pub mod local_watcher;
pub mod operations;
pub mod paths;
pub mod peer;
mod query;
mod refresh;
mod session;
pub mod transfer;
pub mod tree;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache_state::CacheState;
pub use channel::{ChannelManager, HttpTransport, Transport};
pub use digest::{Digest, DigestStore, FileKey, StaleReason, Staleness};
pub use error::MirrorError;
pub use operations::{
    BackgroundOperation, Completion, Confirmation, ConfirmCallback, CreateKind, Operation,
    OperationExecutor, Outcome, ProgressMonitor,
};
pub use peer::Peer;
pub use refresh::{RefreshSummary, StateChange};
pub use session::{CacheWatcher, MirrorSession, SessionOptions};
pub use tree::{NodeId, NodeKind, NodeSnapshot};
