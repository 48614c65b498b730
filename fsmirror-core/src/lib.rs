mod client;
mod location;
mod service;

pub use client::{DEFAULT_READDIR_PAGE, RemoteFsClient};
pub use location::{LocationError, RemoteUrl, URL_SCHEME};
pub use service::{
    AgentInfo, ByteStream, DirChunk, DirEntry, DirHandle, FILE_ATTRIBUTE_HIDDEN,
    FILE_ATTRIBUTE_READONLY, FILE_ATTRIBUTE_SYSTEM, FILE_SYSTEM_SERVICE, FileAttrs, FileKind,
    FileService, RemoteError, RemoteErrorClass, UserAccount, parse_timestamp,
};
