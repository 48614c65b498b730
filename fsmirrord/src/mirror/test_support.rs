use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use fsmirror_core::{
    AgentInfo, ByteStream, DirChunk, DirEntry, DirHandle, FILE_ATTRIBUTE_READONLY,
    FILE_SYSTEM_SERVICE, FileAttrs, FileService, RemoteError, UserAccount,
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use super::backoff::Backoff;
use super::channel::{Connected, Transport};
use super::peer::Peer;
use super::session::{MirrorSession, SessionOptions};

pub fn api_error(status: u16, body: &str) -> RemoteError {
    RemoteError::Api {
        status: status.try_into().unwrap(),
        body: body.to_string(),
    }
}

pub fn busy() -> RemoteError {
    api_error(503, "busy")
}

/// Holds a fake call until the test opens it.
pub struct Gate {
    entered: Notify,
    release: Semaphore,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }
}

impl Gate {
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn open(&self) {
        self.release.add_permits(1_000);
    }

    async fn pass(&self) {
        self.entered.notify_one();
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
    }
}

#[derive(Clone)]
struct FakeEntry {
    attrs: FileAttrs,
    content: Vec<u8>,
}

#[derive(Default)]
struct FakeFs {
    roots: Vec<String>,
    entries: BTreeMap<String, FakeEntry>,
    handles: HashMap<String, (Vec<DirEntry>, usize)>,
    next_handle: u64,
    clock: i64,
    failing: HashMap<(String, String), fn() -> RemoteError>,
    user: Option<UserAccount>,
}

fn root_path(name: &str) -> String {
    name.replace('\\', "/")
}

fn parent_of(path: &str) -> Option<String> {
    let idx = path.trim_end_matches('/').rfind('/')?;
    if path.len() == idx + 1 {
        return None;
    }
    let parent = &path[..idx];
    Some(if parent.is_empty() {
        "/".to_string()
    } else if parent.ends_with(':') {
        format!("{parent}/")
    } else {
        parent.to_string()
    })
}

fn name_of(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// In-memory agent file system that counts calls and can hold or fail them.
pub struct FakeFileService {
    fs: Mutex<FakeFs>,
    calls: Mutex<Vec<(String, String)>>,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
    page_size: usize,
}

impl FakeFileService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fs: Mutex::new(FakeFs {
                clock: 1_000,
                ..FakeFs::default()
            }),
            calls: Mutex::new(Vec::new()),
            gates: Mutex::new(HashMap::new()),
            page_size: 2,
        })
    }

    pub fn add_root(&self, name: &str) {
        let mut fs = self.fs.lock();
        fs.roots.push(name.to_string());
        fs.entries.insert(
            root_path(name),
            FakeEntry {
                attrs: FileAttrs::dir(None),
                content: Vec::new(),
            },
        );
    }

    pub fn add_dir(&self, path: &str, mtime: i64) {
        self.fs.lock().entries.insert(
            path.to_string(),
            FakeEntry {
                attrs: FileAttrs::dir(Some(mtime)),
                content: Vec::new(),
            },
        );
    }

    pub fn add_file(&self, path: &str, content: &[u8], mtime: i64) {
        self.fs.lock().entries.insert(
            path.to_string(),
            FakeEntry {
                attrs: FileAttrs::file(content.len() as u64, Some(mtime)),
                content: content.to_vec(),
            },
        );
    }

    pub fn set_content(&self, path: &str, content: &[u8], mtime: i64) {
        self.add_file(path, content, mtime);
    }

    pub fn set_mtime(&self, path: &str, mtime: i64) {
        if let Some(entry) = self.fs.lock().entries.get_mut(path) {
            entry.attrs.mtime = Some(mtime);
        }
    }

    pub fn set_read_only(&self, path: &str) {
        if let Some(entry) = self.fs.lock().entries.get_mut(path) {
            entry.attrs.permissions = 0o444;
        }
    }

    pub fn set_win32_read_only(&self, path: &str) {
        if let Some(entry) = self.fs.lock().entries.get_mut(path) {
            entry.attrs.win32_attributes = Some(FILE_ATTRIBUTE_READONLY);
        }
    }

    /// Makes the agent run as `uid`/`gid`; without it `user` fails.
    pub fn set_user(&self, uid: u32, gid: u32) {
        self.fs.lock().user = Some(UserAccount {
            real_uid: uid,
            effective_uid: uid,
            real_gid: gid,
            effective_gid: gid,
            home: None,
        });
    }

    pub fn set_owner(&self, path: &str, uid: u32, gid: u32, permissions: u32) {
        if let Some(entry) = self.fs.lock().entries.get_mut(path) {
            entry.attrs.uid = uid;
            entry.attrs.gid = gid;
            entry.attrs.permissions = permissions;
        }
    }

    pub fn remove_entry(&self, path: &str) {
        self.fs.lock().entries.remove(path);
    }

    pub fn exists(&self, path: &str) -> bool {
        self.fs.lock().entries.contains_key(path)
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.fs.lock().entries.get(path).map(|e| e.content.clone())
    }

    pub fn attrs(&self, path: &str) -> Option<FileAttrs> {
        self.fs.lock().entries.get(path).map(|e| e.attrs.clone())
    }

    pub fn fail(&self, op: &str, path: &str, error: fn() -> RemoteError) {
        self.fs
            .lock()
            .failing
            .insert((op.to_string(), path.to_string()), error);
    }

    pub fn gate(&self, op: &str) -> Arc<Gate> {
        Arc::clone(
            self.gates
                .lock()
                .entry(op.to_string())
                .or_insert_with(|| Arc::new(Gate::default())),
        )
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|(o, _)| o == op).count()
    }

    pub fn calls_for(&self, op: &str, path: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(o, p)| o == op && p == path)
            .count()
    }

    async fn enter(&self, op: &str, path: &str) -> Result<(), RemoteError> {
        self.calls.lock().push((op.to_string(), path.to_string()));
        let gate = self.gates.lock().get(op).cloned();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        match self
            .fs
            .lock()
            .failing
            .get(&(op.to_string(), path.to_string()))
        {
            Some(error) => Err(error()),
            None => Ok(()),
        }
    }

    fn listing(fs: &FakeFs, dir: &str) -> Vec<DirEntry> {
        fs.entries
            .iter()
            .filter(|(path, _)| parent_of(path).as_deref() == Some(dir))
            .map(|(path, entry)| DirEntry {
                name: name_of(path),
                attrs: Some(entry.attrs.clone()),
            })
            .collect()
    }

    fn tick(fs: &mut FakeFs) -> i64 {
        fs.clock += 1_000;
        fs.clock
    }
}

#[async_trait]
impl FileService for FakeFileService {
    async fn list_roots(&self) -> Result<Vec<DirEntry>, RemoteError> {
        self.enter("list_roots", "").await?;
        let fs = self.fs.lock();
        Ok(fs
            .roots
            .iter()
            .map(|name| DirEntry {
                name: name.clone(),
                attrs: fs.entries.get(&root_path(name)).map(|e| e.attrs.clone()),
            })
            .collect())
    }

    async fn open_dir(&self, path: &str) -> Result<DirHandle, RemoteError> {
        self.enter("open_dir", path).await?;
        let mut fs = self.fs.lock();
        match fs.entries.get(path) {
            Some(entry) if entry.attrs.is_dir() => {}
            Some(_) => return Err(api_error(400, "not a directory")),
            None => return Err(RemoteError::not_found(path)),
        }
        let listing = Self::listing(&fs, path);
        fs.next_handle += 1;
        let handle = format!("h{}", fs.next_handle);
        fs.handles.insert(handle.clone(), (listing, 0));
        Ok(DirHandle(handle))
    }

    async fn read_dir(&self, handle: &DirHandle) -> Result<DirChunk, RemoteError> {
        self.enter("read_dir", &handle.0).await?;
        let mut fs = self.fs.lock();
        let (entries, cursor) = fs
            .handles
            .get_mut(&handle.0)
            .ok_or_else(|| api_error(400, "bad handle"))?;
        let end = (*cursor + self.page_size).min(entries.len());
        let chunk = entries[*cursor..end].to_vec();
        *cursor = end;
        Ok(DirChunk {
            entries: chunk,
            eof: end >= entries.len(),
        })
    }

    async fn close_handle(&self, handle: &DirHandle) -> Result<(), RemoteError> {
        self.enter("close_handle", &handle.0).await?;
        self.fs.lock().handles.remove(&handle.0);
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<FileAttrs, RemoteError> {
        self.enter("stat", path).await?;
        self.attrs(path).ok_or_else(|| RemoteError::not_found(path))
    }

    async fn set_stat(&self, path: &str, attrs: &FileAttrs) -> Result<(), RemoteError> {
        self.enter("set_stat", path).await?;
        let mut fs = self.fs.lock();
        let entry = fs
            .entries
            .get_mut(path)
            .ok_or_else(|| RemoteError::not_found(path))?;
        entry.attrs.permissions = attrs.permissions;
        entry.attrs.win32_attributes = attrs.win32_attributes;
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<ByteStream, RemoteError> {
        self.enter("read", path).await?;
        let content = self
            .content(path)
            .ok_or_else(|| RemoteError::not_found(path))?;
        let chunks: Vec<Result<Vec<u8>, RemoteError>> =
            content.chunks(4).map(|chunk| Ok(chunk.to_vec())).collect();
        Ok(futures_util::stream::iter(chunks).boxed())
    }

    async fn write(&self, path: &str, mut body: ByteStream) -> Result<(), RemoteError> {
        self.enter("write", path).await?;
        let mut content = Vec::new();
        while let Some(chunk) = body.next().await {
            content.extend(chunk?);
        }
        let mut fs = self.fs.lock();
        let mtime = Self::tick(&mut fs);
        fs.entries.insert(
            path.to_string(),
            FakeEntry {
                attrs: FileAttrs::file(content.len() as u64, Some(mtime)),
                content,
            },
        );
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), RemoteError> {
        self.enter("remove", path).await?;
        let mut fs = self.fs.lock();
        match fs.entries.get(path) {
            Some(entry) if entry.attrs.is_read_only_for(fs.user.as_ref()) => {
                Err(api_error(403, "permission denied"))
            }
            Some(entry) if entry.attrs.is_dir() => Err(api_error(400, "is a directory")),
            Some(_) => {
                fs.entries.remove(path);
                Ok(())
            }
            None => Err(RemoteError::not_found(path)),
        }
    }

    async fn rmdir(&self, path: &str) -> Result<(), RemoteError> {
        self.enter("rmdir", path).await?;
        let mut fs = self.fs.lock();
        if !fs.entries.contains_key(path) {
            return Err(RemoteError::not_found(path));
        }
        if !Self::listing(&fs, path).is_empty() {
            return Err(api_error(409, "directory not empty"));
        }
        fs.entries.remove(path);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<(), RemoteError> {
        self.enter("mkdir", path).await?;
        let mut fs = self.fs.lock();
        if fs.entries.contains_key(path) {
            return Err(api_error(409, "exists"));
        }
        let mtime = Self::tick(&mut fs);
        fs.entries.insert(
            path.to_string(),
            FakeEntry {
                attrs: FileAttrs::dir(Some(mtime)),
                content: Vec::new(),
            },
        );
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str, overwrite: bool) -> Result<(), RemoteError> {
        self.enter("rename", from).await?;
        let mut fs = self.fs.lock();
        if !fs.entries.contains_key(from) {
            return Err(RemoteError::not_found(from));
        }
        if fs.entries.contains_key(to) && !overwrite {
            return Err(api_error(409, "exists"));
        }
        let prefix = format!("{from}/");
        let moved: Vec<String> = fs
            .entries
            .keys()
            .filter(|path| *path == from || path.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(entry) = fs.entries.remove(&old) {
                let new = format!("{to}{}", &old[from.len()..]);
                fs.entries.insert(new, entry);
            }
        }
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str, overwrite: bool) -> Result<(), RemoteError> {
        self.enter("copy", from).await?;
        let mut fs = self.fs.lock();
        let entry = fs
            .entries
            .get(from)
            .cloned()
            .ok_or_else(|| RemoteError::not_found(from))?;
        if entry.attrs.is_dir() {
            return Err(api_error(400, "is a directory"));
        }
        if fs.entries.contains_key(to) && !overwrite {
            return Err(api_error(409, "exists"));
        }
        fs.entries.insert(to.to_string(), entry);
        Ok(())
    }

    async fn user(&self) -> Result<UserAccount, RemoteError> {
        self.enter("user", "").await?;
        self.fs
            .lock()
            .user
            .clone()
            .ok_or_else(|| api_error(501, "user is not supported"))
    }
}

pub struct FakeTransport {
    fs: Arc<FakeFileService>,
    services: Vec<String>,
    os_name: Option<String>,
    connects: AtomicUsize,
    failures: Mutex<(u32, Option<fn() -> RemoteError>)>,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
}

impl FakeTransport {
    pub fn new(fs: Arc<FakeFileService>) -> Self {
        Self {
            fs,
            services: vec![FILE_SYSTEM_SERVICE.to_string()],
            os_name: Some("Linux".to_string()),
            connects: AtomicUsize::new(0),
            failures: Mutex::new((0, None)),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_services(mut self, services: Vec<String>) -> Self {
        self.services = services;
        self
    }

    pub fn with_os_name(mut self, os_name: &str) -> Self {
        self.os_name = Some(os_name.to_string());
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fail_next_connects(&self, count: u32, error: fn() -> RemoteError) {
        *self.failures.lock() = (count, Some(error));
    }

    /// Holds connects to `peer_id` until the returned gate opens.
    pub fn gate(&self, peer_id: &str) -> Arc<Gate> {
        Arc::clone(
            self.gates
                .lock()
                .entry(peer_id.to_string())
                .or_insert_with(|| Arc::new(Gate::default())),
        )
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, peer: &Peer) -> Result<Connected, RemoteError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock();
            if failures.0 > 0
                && let Some(error) = failures.1
            {
                failures.0 -= 1;
                return Err(error());
            }
        }
        let gate = self.gates.lock().get(&peer.id).cloned();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        Ok(Connected {
            info: AgentInfo {
                agent_id: peer.id.clone(),
                os_name: self.os_name.clone(),
                services: self.services.clone(),
            },
            service: Arc::clone(&self.fs) as Arc<dyn FileService>,
        })
    }
}

pub fn linux_peer() -> Peer {
    Peer::new("agent-1", "agent", "http://agent.invalid").with_os_name("Linux")
}

pub fn windows_peer() -> Peer {
    Peer::new("win-1", "win", "http://win.invalid").with_os_name("Windows 10")
}

/// Session over a fake agent with a cache rooted at `cache_root`.
pub fn fake_session(fs: Arc<FakeFileService>, cache_root: &Path) -> MirrorSession {
    let transport = Arc::new(FakeTransport::new(fs));
    MirrorSession::with_backoff(
        SessionOptions::new(cache_root.to_path_buf()),
        transport,
        Backoff::none(),
    )
    .unwrap()
}

/// POSIX tree used by most session tests.
pub fn sample_fs() -> Arc<FakeFileService> {
    let fs = FakeFileService::new();
    fs.add_root("/");
    fs.add_dir("/root", 10);
    fs.add_dir("/root/dir", 20);
    fs.add_file("/root/dir/file.txt", b"hello world", 100);
    fs.add_file("/root/readme.md", b"# readme", 30);
    fs
}
