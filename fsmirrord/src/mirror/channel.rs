use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use fsmirror_core::{AgentInfo, FILE_SYSTEM_SERVICE, FileService, RemoteError, RemoteFsClient};
use thiserror::Error;

use super::backoff::Backoff;
use super::peer::Peer;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("cannot connect to peer {peer}: {source}")]
    Connect {
        peer: String,
        #[source]
        source: RemoteError,
    },
    #[error("peer {peer} does not offer the {service} service")]
    CapabilityMissing { peer: String, service: String },
    #[error("channel to peer {0} is closed")]
    Closed(String),
    #[error("unknown peer {0}")]
    UnknownPeer(String),
}

/// Result of a successful handshake with an agent.
pub struct Connected {
    pub info: AgentInfo,
    pub service: Arc<dyn FileService>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, peer: &Peer) -> Result<Connected, RemoteError>;
}

/// Connects to agents speaking the HTTP/JSON file protocol.
pub struct HttpTransport {
    page_size: u32,
}

impl HttpTransport {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size: page_size.max(1),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self, peer: &Peer) -> Result<Connected, RemoteError> {
        let client = RemoteFsClient::new(&peer.base_url)?.with_page_size(self.page_size);
        let info = client.agent_info().await?;
        Ok(Connected {
            info,
            service: Arc::new(client),
        })
    }
}

pub enum Capability {
    FileSystem(Arc<dyn FileService>),
    /// Advertised by the agent but not used by the mirror.
    Other(String),
}

struct Connection {
    peer_id: String,
    info: AgentInfo,
    service: Arc<dyn FileService>,
    healthy: AtomicBool,
}

/// Lease on a connection to one peer. Closing is idempotent and dropping the
/// lease closes it.
pub struct Channel {
    conn: Arc<Connection>,
    closed: AtomicBool,
}

impl Channel {
    fn lease(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.conn.peer_id
    }

    pub fn agent(&self) -> &AgentInfo {
        &self.conn.info
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::trace!(peer = %self.conn.peer_id, "channel closed");
        }
    }

    /// Marks the underlying connection unusable so the next open reconnects.
    pub fn mark_broken(&self) {
        self.conn.healthy.store(false, Ordering::SeqCst);
    }

    pub fn capability(&self, name: &str) -> Option<Capability> {
        if self.is_closed() || !self.conn.info.services.iter().any(|s| s == name) {
            return None;
        }
        if name == FILE_SYSTEM_SERVICE {
            Some(Capability::FileSystem(Arc::clone(&self.conn.service)))
        } else {
            Some(Capability::Other(name.to_string()))
        }
    }

    pub fn file_system(&self) -> Result<Arc<dyn FileService>, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed(self.conn.peer_id.clone()));
        }
        match self.capability(FILE_SYSTEM_SERVICE) {
            Some(Capability::FileSystem(service)) => Ok(service),
            _ => Err(ChannelError::CapabilityMissing {
                peer: self.conn.peer_id.clone(),
                service: FILE_SYSTEM_SERVICE.to_string(),
            }),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

struct ManagerInner {
    transport: Arc<dyn Transport>,
    backoff: Backoff,
    attempts: u32,
    peers: parking_lot::Mutex<HashMap<String, Peer>>,
    live: parking_lot::Mutex<HashMap<String, Arc<ConnectionSlot>>>,
}

/// Connection of one peer. Its lock is held while connecting so concurrent
/// opens of the same peer share one connect and other peers are not held up.
type ConnectionSlot = tokio::sync::Mutex<Weak<Connection>>;

/// Opens channels to peers, reusing a connection while any lease on it is
/// alive.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<ManagerInner>,
}

impl ChannelManager {
    pub fn new(transport: Arc<dyn Transport>, attempts: u32, backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                backoff,
                attempts: attempts.max(1),
                peers: parking_lot::Mutex::new(HashMap::new()),
                live: parking_lot::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn register(&self, peer: &Peer) {
        self.inner
            .peers
            .lock()
            .insert(peer.id.clone(), peer.clone());
    }

    pub fn forget(&self, peer_id: &str) {
        self.inner.peers.lock().remove(peer_id);
        self.inner.live.lock().remove(peer_id);
    }

    pub fn peer(&self, peer_id: &str) -> Option<Peer> {
        self.inner.peers.lock().get(peer_id).cloned()
    }

    pub async fn open_by_id(&self, peer_id: &str) -> Result<Channel, ChannelError> {
        let peer = self
            .peer(peer_id)
            .ok_or_else(|| ChannelError::UnknownPeer(peer_id.to_string()))?;
        self.open(&peer).await
    }

    pub async fn open(&self, peer: &Peer) -> Result<Channel, ChannelError> {
        let slot = Arc::clone(
            self.inner
                .live
                .lock()
                .entry(peer.id.clone())
                .or_default(),
        );
        let mut live = slot.lock().await;
        if let Some(conn) = live.upgrade()
            && conn.healthy.load(Ordering::SeqCst)
        {
            return Ok(Channel::lease(conn));
        }

        let mut attempt = 0u32;
        loop {
            match self.inner.transport.connect(peer).await {
                Ok(connected) => {
                    tracing::debug!(
                        peer = %peer.id,
                        agent = %connected.info.agent_id,
                        os = connected.info.os_name.as_deref().unwrap_or("unknown"),
                        "channel opened"
                    );
                    let conn = Arc::new(Connection {
                        peer_id: peer.id.clone(),
                        info: connected.info,
                        service: connected.service,
                        healthy: AtomicBool::new(true),
                    });
                    *live = Arc::downgrade(&conn);
                    return Ok(Channel::lease(conn));
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.inner.attempts || !err.is_retryable() {
                        tracing::warn!(peer = %peer.id, attempt, error = %err, "channel open failed");
                        return Err(ChannelError::Connect {
                            peer: peer.id.clone(),
                            source: err,
                        });
                    }
                    let delay = self.inner.backoff.delay(attempt - 1);
                    tracing::debug!(peer = %peer.id, attempt, ?delay, error = %err, "retrying channel open");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub fn close(&self, channel: &Channel) {
        channel.close();
    }

    pub fn capability(&self, channel: &Channel, name: &str) -> Option<Capability> {
        channel.capability(name)
    }
}
