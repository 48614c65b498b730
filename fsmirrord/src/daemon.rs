use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fsmirror_core::{AgentInfo, RemoteFsClient, UserAccount};
use tokio_util::sync::CancellationToken;

use crate::mirror::digest::DEFAULT_DIGEST_CHUNK;
use crate::mirror::{
    CacheState, HttpTransport, MirrorSession, NodeId, NodeKind, NodeSnapshot, Peer,
    SessionOptions, Staleness,
};

const DEFAULT_CACHE_DIR_NAME: &str = "fsmirror";
const DEFAULT_CONNECT_ATTEMPTS: u64 = 3;
const DEFAULT_READDIR_PAGE: u64 = fsmirror_core::DEFAULT_READDIR_PAGE as u64;
const DEFAULT_REFRESH_SECS: u64 = 15;

#[derive(Clone, Debug)]
pub struct MirrorConfig {
    pub peer_url: String,
    pub peer_id: Option<String>,
    pub peer_name: Option<String>,
    pub cache_root: PathBuf,
    pub connect_attempts: u32,
    pub readdir_page: u32,
    pub digest_chunk: usize,
    pub refresh_interval: Duration,
    pub enable_cache_watcher: bool,
}

impl MirrorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let peer_url = std::env::var("FSMIRROR_PEER_URL").context("FSMIRROR_PEER_URL is not set")?;
        let cache_root = std::env::var("FSMIRROR_CACHE_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_cache_root);
        let connect_attempts =
            read_u64_env("FSMIRROR_CONNECT_ATTEMPTS", DEFAULT_CONNECT_ATTEMPTS);
        let readdir_page = read_u64_env("FSMIRROR_READDIR_PAGE", DEFAULT_READDIR_PAGE);
        let digest_chunk = read_u64_env("FSMIRROR_DIGEST_CHUNK", DEFAULT_DIGEST_CHUNK as u64);
        let refresh_interval =
            Duration::from_secs(read_u64_env("FSMIRROR_REFRESH_SECS", DEFAULT_REFRESH_SECS));
        let enable_cache_watcher = read_bool_env("FSMIRROR_ENABLE_CACHE_WATCHER", true);

        Ok(Self {
            peer_url,
            peer_id: read_string_env("FSMIRROR_PEER_ID"),
            peer_name: read_string_env("FSMIRROR_PEER_NAME"),
            cache_root,
            connect_attempts: u32::try_from(connect_attempts).unwrap_or(u32::MAX),
            readdir_page: u32::try_from(readdir_page).unwrap_or(u32::MAX),
            digest_chunk: usize::try_from(digest_chunk).unwrap_or(DEFAULT_DIGEST_CHUNK),
            refresh_interval,
            enable_cache_watcher,
        })
    }

    /// Config for `peer_url` with every other setting at its default.
    pub fn for_peer(peer_url: impl Into<String>, cache_root: PathBuf) -> Self {
        Self {
            peer_url: peer_url.into(),
            peer_id: None,
            peer_name: None,
            cache_root,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS as u32,
            readdir_page: DEFAULT_READDIR_PAGE as u32,
            digest_chunk: DEFAULT_DIGEST_CHUNK,
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_SECS),
            enable_cache_watcher: true,
        }
    }
}

/// What the binary was asked to do with the mirrored peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorCommand {
    Roots,
    List(String),
    Stat(String),
    Check(String),
    Fetch(String),
    Watch(String),
}

pub struct MirrorRuntime {
    config: MirrorConfig,
    session: MirrorSession,
    peer: Peer,
    account: Option<UserAccount>,
    system_root: NodeId,
}

impl MirrorRuntime {
    pub async fn bootstrap(config: MirrorConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.cache_root)
            .await
            .with_context(|| format!("failed to create cache root at {:?}", config.cache_root))?;

        let client = RemoteFsClient::new(&config.peer_url)
            .with_context(|| format!("invalid peer url {}", config.peer_url))?;
        let info = client
            .agent_info()
            .await
            .context("failed to reach the agent")?;
        let peer = peer_from_agent(&info, &config);

        let mut options = SessionOptions::new(config.cache_root.clone());
        options.connect_attempts = config.connect_attempts;
        options.digest_chunk = config.digest_chunk;
        let transport = Arc::new(HttpTransport::new(config.readdir_page));
        let session = MirrorSession::new(options, transport)?;
        let system_root = session.root(&peer).await?;
        let account = match session.user_account(&peer.id).await {
            Ok(account) => Some(account),
            Err(err) => {
                tracing::warn!(peer = %peer.id, error = %err, "agent account unavailable");
                None
            }
        };
        tracing::info!(
            peer = %peer.id,
            os = peer.os_name.as_deref().unwrap_or("unknown"),
            cache_root = %config.cache_root.display(),
            "mirror ready"
        );

        Ok(Self {
            config,
            session,
            peer,
            account,
            system_root,
        })
    }

    pub fn session(&self) -> &MirrorSession {
        &self.session
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub async fn run(self, command: MirrorCommand) -> anyhow::Result<()> {
        let result = self.execute(command).await;
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || session.shutdown())
            .await
            .context("failed to stop the dispatch thread")?;
        result
    }

    async fn execute(&self, command: MirrorCommand) -> anyhow::Result<()> {
        match command {
            MirrorCommand::Roots => {
                for root in self.session.list_children(self.system_root).await? {
                    println!("{}", format_entry(&root, self.account.as_ref()));
                }
            }
            MirrorCommand::List(path) => {
                let node = self.locate(&path).await?;
                for child in self.session.list_children(node).await? {
                    println!("{}", format_entry(&child, self.account.as_ref()));
                }
            }
            MirrorCommand::Stat(path) => {
                let node = self.locate(&path).await?;
                self.session.refresh_state(node).await?;
                let snapshot = self.session.snapshot(node).await?;
                println!("{}", format_entry(&snapshot, self.account.as_ref()));
                if snapshot.is_file() {
                    let cache = self.session.cache_file(&snapshot)?;
                    println!("cache: {}", cache.display());
                }
            }
            MirrorCommand::Check(path) => {
                let node = self.locate(&path).await?;
                let verdict = self
                    .session
                    .check_cache(node, &CancellationToken::new())
                    .await?;
                let state = self.session.cache_state(node).await?;
                println!("{}", describe_cache(verdict, state));
            }
            MirrorCommand::Fetch(path) => {
                let node = self.locate(&path).await?;
                let cancel = CancellationToken::new();
                let digest = tokio::select! {
                    res = self.session.update_cache(node, &cancel) => res?,
                    res = tokio::signal::ctrl_c() => {
                        res.context("failed waiting for shutdown signal")?;
                        cancel.cancel();
                        anyhow::bail!("fetch interrupted");
                    }
                };
                let snapshot = self.session.snapshot(node).await?;
                println!("{} {}", digest, self.session.cache_file(&snapshot)?.display());
            }
            MirrorCommand::Watch(path) => self.watch(&path).await?,
        }
        Ok(())
    }

    async fn locate(&self, path: &str) -> anyhow::Result<NodeId> {
        self.session
            .locate(self.system_root, path)
            .await
            .with_context(|| format!("cannot find {path} on {}", self.peer.name))
    }

    /// Keeps the subtree at `path` current until interrupted.
    async fn watch(&self, path: &str) -> anyhow::Result<()> {
        let node = self.locate(path).await?;
        let _watcher = if self.config.enable_cache_watcher {
            match self.session.start_cache_watcher() {
                Ok(watcher) => Some(watcher),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to start cache watcher");
                    None
                }
            }
        } else {
            None
        };

        let cancel = CancellationToken::new();
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.session.refresh_tree_with(node, &cancel).await {
                        Ok(summary) => tracing::debug!(dirs = summary.dirs, files = summary.files, "refresh pass done"),
                        Err(err) => tracing::warn!(path, error = %err, "refresh failed"),
                    }
                }
                res = tokio::signal::ctrl_c() => {
                    res.context("failed waiting for shutdown signal")?;
                    cancel.cancel();
                    tracing::info!("shutting down");
                    return Ok(());
                }
            }
        }
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
