use async_trait::async_trait;
use futures_util::stream::BoxStream;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Service name an agent advertises when it exposes remote file access.
pub const FILE_SYSTEM_SERVICE: &str = "FileSystem";

pub const FILE_ATTRIBUTE_READONLY: u32 = 0x0000_0001;
pub const FILE_ATTRIBUTE_HIDDEN: u32 = 0x0000_0002;
pub const FILE_ATTRIBUTE_SYSTEM: u32 = 0x0000_0004;

const S_IWUSR: u32 = 0o200;
const S_IWGRP: u32 = 0o020;
const S_IWOTH: u32 = 0o002;

pub type ByteStream = BoxStream<'static, Result<Vec<u8>, RemoteError>>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("agent returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("invalid timestamp: {0}")]
    Time(#[from] time::error::Parse),
    #[error("timestamp out of range: {0}")]
    TimeRange(#[from] time::error::ComponentRange),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorClass {
    Connection,
    NotFound,
    Transient,
    Permanent,
}

impl RemoteError {
    pub fn not_found(path: &str) -> Self {
        RemoteError::Api {
            status: StatusCode::NOT_FOUND,
            body: format!("no such file or directory: {path}"),
        }
    }

    pub fn classification(&self) -> RemoteErrorClass {
        match self {
            RemoteError::Request(err) if err.is_connect() || err.is_timeout() => {
                RemoteErrorClass::Connection
            }
            RemoteError::Api { status, .. } if *status == StatusCode::NOT_FOUND => {
                RemoteErrorClass::NotFound
            }
            RemoteError::Api { status, .. }
                if status.is_server_error()
                    || matches!(
                        *status,
                        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
                    ) =>
            {
                RemoteErrorClass::Transient
            }
            _ => RemoteErrorClass::Permanent,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.classification() == RemoteErrorClass::NotFound
    }

    pub fn is_connection(&self) -> bool {
        self.classification() == RemoteErrorClass::Connection
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            RemoteErrorClass::Connection | RemoteErrorClass::Transient
        )
    }

    /// The peer's own message when it reported one.
    pub fn peer_message(&self) -> Option<&str> {
        match self {
            RemoteError::Api { body, .. } if !body.is_empty() => Some(body.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttrs {
    pub kind: FileKind,
    pub size: u64,
    pub permissions: u32,
    pub uid: u32,
    pub gid: u32,
    /// Modification time in milliseconds since the Unix epoch.
    pub mtime: Option<i64>,
    pub atime: Option<i64>,
    pub win32_attributes: Option<u32>,
}

impl FileAttrs {
    pub fn file(size: u64, mtime: Option<i64>) -> Self {
        Self {
            kind: FileKind::File,
            size,
            permissions: 0o644,
            uid: 0,
            gid: 0,
            mtime,
            atime: None,
            win32_attributes: None,
        }
    }

    pub fn dir(mtime: Option<i64>) -> Self {
        Self {
            kind: FileKind::Dir,
            size: 0,
            permissions: 0o755,
            uid: 0,
            gid: 0,
            mtime,
            atime: None,
            win32_attributes: None,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    pub fn win32_flag(&self, bit: u32) -> bool {
        self.win32_attributes.is_some_and(|attrs| attrs & bit != 0)
    }

    /// Read-only without knowing who asks: the win32 flag, or no write bit
    /// set for anybody.
    pub fn is_read_only(&self) -> bool {
        self.is_read_only_for(None)
    }

    /// Read-only for `account`. The write bit that counts is picked by
    /// whether the account owns the file, shares its group, or neither.
    pub fn is_read_only_for(&self, account: Option<&UserAccount>) -> bool {
        match (self.win32_attributes, account) {
            (Some(attrs), _) => attrs & FILE_ATTRIBUTE_READONLY != 0,
            (None, Some(account)) => self.permissions & self.write_bit(account) == 0,
            (None, None) => self.permissions & (S_IWUSR | S_IWGRP | S_IWOTH) == 0,
        }
    }

    fn write_bit(&self, account: &UserAccount) -> u32 {
        if self.uid == account.effective_uid {
            S_IWUSR
        } else if self.gid == account.effective_gid {
            S_IWGRP
        } else {
            S_IWOTH
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.win32_flag(FILE_ATTRIBUTE_HIDDEN)
    }

    /// Attributes with write access restored, in the platform's own terms.
    pub fn writable(&self) -> Self {
        self.writable_for(None)
    }

    /// Like [`writable`](Self::writable), granting the bit `account` needs.
    pub fn writable_for(&self, account: Option<&UserAccount>) -> Self {
        let mut attrs = self.clone();
        match attrs.win32_attributes.as_mut() {
            Some(flags) => *flags &= !FILE_ATTRIBUTE_READONLY,
            None => {
                attrs.permissions |= account.map_or(S_IWUSR, |account| self.write_bit(account))
            }
        }
        attrs
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub(crate) struct WireAttrs {
    #[serde(rename = "type")]
    pub kind: FileKind,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub permissions: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win32_attributes: Option<u32>,
}

impl WireAttrs {
    pub(crate) fn into_attrs(self) -> Result<FileAttrs, RemoteError> {
        Ok(FileAttrs {
            kind: self.kind,
            size: self.size,
            permissions: self.permissions,
            uid: self.uid,
            gid: self.gid,
            mtime: parse_timestamp(self.modified.as_deref())?,
            atime: parse_timestamp(self.accessed.as_deref())?,
            win32_attributes: self.win32_attributes,
        })
    }

    pub(crate) fn from_attrs(attrs: &FileAttrs) -> Result<Self, RemoteError> {
        Ok(Self {
            kind: attrs.kind,
            size: attrs.size,
            permissions: attrs.permissions,
            uid: attrs.uid,
            gid: attrs.gid,
            modified: format_timestamp(attrs.mtime)?,
            accessed: format_timestamp(attrs.atime)?,
            win32_attributes: attrs.win32_attributes,
        })
    }
}

pub fn parse_timestamp(value: Option<&str>) -> Result<Option<i64>, RemoteError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = OffsetDateTime::parse(value, &Rfc3339)?;
    Ok(Some((parsed.unix_timestamp_nanos() / 1_000_000) as i64))
}

fn format_timestamp(millis: Option<i64>) -> Result<Option<String>, RemoteError> {
    let Some(millis) = millis else {
        return Ok(None);
    };
    let at = OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)?;
    Ok(at.format(&Rfc3339).ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub attrs: Option<FileAttrs>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct DirHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirChunk {
    pub entries: Vec<DirEntry>,
    pub eof: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AgentInfo {
    pub agent_id: String,
    #[serde(default)]
    pub os_name: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

/// Account the agent runs as on the peer.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UserAccount {
    pub real_uid: u32,
    pub effective_uid: u32,
    pub real_gid: u32,
    pub effective_gid: u32,
    #[serde(default)]
    pub home: Option<String>,
}

/// Remote file-system capability of a connected agent.
///
/// Every call is a single round-trip; callers compose them into chains
/// (open a directory, page through it, close the handle).
#[async_trait]
pub trait FileService: Send + Sync {
    async fn list_roots(&self) -> Result<Vec<DirEntry>, RemoteError>;

    async fn open_dir(&self, path: &str) -> Result<DirHandle, RemoteError>;

    async fn read_dir(&self, handle: &DirHandle) -> Result<DirChunk, RemoteError>;

    async fn close_handle(&self, handle: &DirHandle) -> Result<(), RemoteError>;

    async fn stat(&self, path: &str) -> Result<FileAttrs, RemoteError>;

    async fn set_stat(&self, path: &str, attrs: &FileAttrs) -> Result<(), RemoteError>;

    async fn read(&self, path: &str) -> Result<ByteStream, RemoteError>;

    async fn write(&self, path: &str, body: ByteStream) -> Result<(), RemoteError>;

    async fn remove(&self, path: &str) -> Result<(), RemoteError>;

    async fn rmdir(&self, path: &str) -> Result<(), RemoteError>;

    async fn mkdir(&self, path: &str) -> Result<(), RemoteError>;

    async fn rename(&self, from: &str, to: &str, overwrite: bool) -> Result<(), RemoteError>;

    async fn copy(&self, from: &str, to: &str, overwrite: bool) -> Result<(), RemoteError>;

    async fn user(&self) -> Result<UserAccount, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_attrs_parse_rfc3339_to_millis() {
        let wire = WireAttrs {
            kind: FileKind::File,
            size: 3,
            permissions: 0o644,
            uid: 1,
            gid: 1,
            modified: Some("1970-01-01T00:00:01.500Z".into()),
            accessed: None,
            win32_attributes: None,
        };
        let attrs = wire.into_attrs().unwrap();
        assert_eq!(attrs.mtime, Some(1_500));
        assert!(attrs.is_file());
    }

    #[test]
    fn attrs_survive_wire_conversion() {
        let attrs = FileAttrs::file(10, Some(1_700_000_000_123));
        let back = WireAttrs::from_attrs(&attrs).unwrap().into_attrs().unwrap();
        assert_eq!(back, attrs);
    }

    #[test]
    fn posix_read_only_means_no_write_bits() {
        let mut attrs = FileAttrs::file(1, None);
        attrs.permissions = 0o444;
        assert!(attrs.is_read_only());
        assert!(!attrs.writable().is_read_only());
    }

    #[test]
    fn write_bit_depends_on_who_asks() {
        let mut attrs = FileAttrs::file(1, None);
        attrs.uid = 0;
        attrs.gid = 100;
        attrs.permissions = 0o664;
        let owner = UserAccount {
            real_uid: 0,
            effective_uid: 0,
            real_gid: 0,
            effective_gid: 0,
            home: None,
        };
        let member = UserAccount {
            effective_uid: 1000,
            effective_gid: 100,
            ..owner.clone()
        };
        let other = UserAccount {
            effective_uid: 1000,
            effective_gid: 1000,
            ..owner.clone()
        };

        assert!(!attrs.is_read_only_for(Some(&owner)));
        assert!(!attrs.is_read_only_for(Some(&member)));
        assert!(attrs.is_read_only_for(Some(&other)));
        assert!(!attrs.is_read_only());

        let writable = attrs.writable_for(Some(&other));
        assert_eq!(writable.permissions, 0o666);
        assert!(!writable.is_read_only_for(Some(&other)));
    }

    #[test]
    fn windows_read_only_uses_win32_flag() {
        let mut attrs = FileAttrs::file(1, None);
        attrs.permissions = 0o444;
        attrs.win32_attributes = Some(FILE_ATTRIBUTE_READONLY | FILE_ATTRIBUTE_HIDDEN);
        assert!(attrs.is_read_only());
        assert!(attrs.is_hidden());
        let writable = attrs.writable();
        assert!(!writable.is_read_only());
        assert!(writable.is_hidden());
    }

    #[test]
    fn not_found_is_classified_apart_from_connection_failures() {
        let err = RemoteError::not_found("/tmp/x");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert_eq!(err.peer_message(), Some("no such file or directory: /tmp/x"));
    }

    #[test]
    fn unknown_kind_maps_to_other() {
        let kind: FileKind = serde_json::from_str("\"symlink\"").unwrap();
        assert_eq!(kind, FileKind::Other);
    }
}
