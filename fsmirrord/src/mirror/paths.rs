use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use super::digest::FileKey;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path contains unsupported component")]
    UnsupportedComponent,
    #[error("peer id {0:?} cannot name a cache directory")]
    InvalidPeer(String),
}

/// Maps remote files onto `<root>/<peer>/<segments...>`.
///
/// `:` is not portable in local file names, so a leading drive segment is
/// stored as `X$`: the Windows file `C:/Users/a.txt` lands in
/// `<root>/<peer>/C$/Users/a.txt`. Other segments are kept verbatim, which
/// keeps a remote `a$b.txt` distinct from `a:b.txt`.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn peer_dir(&self, peer_id: &str) -> Result<PathBuf, PathError> {
        if peer_id.is_empty()
            || peer_id == "."
            || peer_id == ".."
            || peer_id.contains(['/', '\\', '$'])
        {
            return Err(PathError::InvalidPeer(peer_id.to_string()));
        }
        Ok(self.root.join(peer_id.replace(':', "$")))
    }

    /// Cache file for `remote_path`, given in cross-platform form.
    pub fn cache_path(&self, peer_id: &str, remote_path: &str) -> Result<PathBuf, PathError> {
        if remote_path.is_empty() {
            return Err(PathError::Empty);
        }
        let mut out = self.peer_dir(peer_id)?;
        let mut first = true;
        for segment in remote_path.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(PathError::UnsupportedComponent),
                drive if first && is_drive(drive) => out.push(format!("{}$", &drive[..1])),
                part => out.push(part),
            }
            first = false;
        }
        Ok(out)
    }

    pub fn cache_path_for(&self, key: &FileKey) -> Result<PathBuf, PathError> {
        self.cache_path(&key.peer_id, &key.path)
    }

    /// Remote file a local cache path stands for, if it lies under the root.
    pub fn resolve(&self, local: &Path) -> Option<FileKey> {
        let relative = local.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?.to_string()),
                Component::CurDir => continue,
                _ => return None,
            }
        }
        let mut parts = parts.into_iter();
        let peer_id = parts.next()?.replace('$', ":");
        let segments: Vec<String> = parts.collect();
        let path = match segments.split_first() {
            Some((drive, rest)) if is_escaped_drive(drive) => {
                format!("{}:/{}", &drive[..1], rest.join("/"))
            }
            _ => format!("/{}", segments.join("/")),
        };
        Some(FileKey::new(peer_id, path))
    }
}

fn is_drive(segment: &str) -> bool {
    drive_letter(segment, b':')
}

fn is_escaped_drive(segment: &str) -> bool {
    drive_letter(segment, b'$')
}

fn drive_letter(segment: &str, separator: u8) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == separator
}
