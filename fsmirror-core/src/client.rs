use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Body, Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::service::{
    AgentInfo, ByteStream, DirChunk, DirEntry, DirHandle, FileAttrs, FileService, RemoteError,
    UserAccount, WireAttrs,
};

pub const DEFAULT_READDIR_PAGE: u32 = 100;

/// HTTP/JSON client for a file agent.
#[derive(Clone)]
pub struct RemoteFsClient {
    http: Client,
    base_url: Url,
    page_size: u32,
}

impl RemoteFsClient {
    pub fn new(base_url: &str) -> Result<Self, RemoteError> {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: &str) -> Result<Self, RemoteError> {
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            page_size: DEFAULT_READDIR_PAGE,
        })
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn agent_info(&self) -> Result<AgentInfo, RemoteError> {
        let url = self.endpoint("/v1/agent")?;
        let response = self.http.get(url).send().await?;
        Self::handle_response(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        Ok(self.base_url.join(path)?)
    }

    fn path_endpoint(&self, endpoint: &str, path: &str) -> Result<Url, RemoteError> {
        let mut url = self.endpoint(endpoint)?;
        url.query_pairs_mut().append_pair("path", path);
        Ok(url)
    }

    fn transfer_endpoint(
        &self,
        endpoint: &str,
        from: &str,
        path: &str,
        overwrite: bool,
    ) -> Result<Url, RemoteError> {
        let mut url = self.endpoint(endpoint)?;
        url.query_pairs_mut()
            .append_pair("from", from)
            .append_pair("path", path)
            .append_pair("overwrite", if overwrite { "true" } else { "false" });
        Ok(url)
    }

    async fn send_empty(&self, method: Method, url: Url) -> Result<(), RemoteError> {
        let response = self.http.request(method, url).send().await?;
        Self::handle_empty(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RemoteError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn handle_empty(response: reqwest::Response) -> Result<(), RemoteError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> RemoteError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        RemoteError::Api { status, body }
    }
}

#[async_trait]
impl FileService for RemoteFsClient {
    async fn list_roots(&self) -> Result<Vec<DirEntry>, RemoteError> {
        let url = self.endpoint("/v1/fs/roots")?;
        let response = self.http.get(url).send().await?;
        let payload: EntryList = Self::handle_response(response).await?;
        payload.into_entries()
    }

    async fn open_dir(&self, path: &str) -> Result<DirHandle, RemoteError> {
        let url = self.path_endpoint("/v1/fs/opendir", path)?;
        let response = self.http.post(url).send().await?;
        let payload: HandleResponse = Self::handle_response(response).await?;
        Ok(DirHandle(payload.handle))
    }

    async fn read_dir(&self, handle: &DirHandle) -> Result<DirChunk, RemoteError> {
        let mut url = self.endpoint("/v1/fs/readdir")?;
        url.query_pairs_mut()
            .append_pair("handle", &handle.0)
            .append_pair("limit", &self.page_size.to_string());
        let response = self.http.get(url).send().await?;
        let payload: ReadDirResponse = Self::handle_response(response).await?;
        Ok(DirChunk {
            entries: payload.list.into_entries()?,
            eof: payload.eof,
        })
    }

    async fn close_handle(&self, handle: &DirHandle) -> Result<(), RemoteError> {
        let encoded = urlencoding::encode(&handle.0);
        let url = self.endpoint(&format!("/v1/fs/handles/{encoded}"))?;
        let response = self.http.delete(url).send().await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(());
        }
        Self::handle_empty(response).await
    }

    async fn stat(&self, path: &str) -> Result<FileAttrs, RemoteError> {
        let url = self.path_endpoint("/v1/fs/stat", path)?;
        let response = self.http.get(url).send().await?;
        let payload: WireAttrs = Self::handle_response(response).await?;
        payload.into_attrs()
    }

    async fn set_stat(&self, path: &str, attrs: &FileAttrs) -> Result<(), RemoteError> {
        let url = self.path_endpoint("/v1/fs/stat", path)?;
        let body = WireAttrs::from_attrs(attrs)?;
        let response = self.http.patch(url).json(&body).send().await?;
        Self::handle_empty(response).await
    }

    async fn read(&self, path: &str) -> Result<ByteStream, RemoteError> {
        let url = self.path_endpoint("/v1/fs/content", path)?;
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(RemoteError::from));
        Ok(stream.boxed())
    }

    async fn write(&self, path: &str, body: ByteStream) -> Result<(), RemoteError> {
        let url = self.path_endpoint("/v1/fs/content", path)?;
        let response = self
            .http
            .put(url)
            .body(Body::wrap_stream(body))
            .send()
            .await?;
        Self::handle_empty(response).await
    }

    async fn remove(&self, path: &str) -> Result<(), RemoteError> {
        let mut url = self.path_endpoint("/v1/fs/resources", path)?;
        url.query_pairs_mut().append_pair("recursive", "false");
        self.send_empty(Method::DELETE, url).await
    }

    async fn rmdir(&self, path: &str) -> Result<(), RemoteError> {
        let url = self.path_endpoint("/v1/fs/dirs", path)?;
        self.send_empty(Method::DELETE, url).await
    }

    async fn mkdir(&self, path: &str) -> Result<(), RemoteError> {
        let url = self.path_endpoint("/v1/fs/dirs", path)?;
        self.send_empty(Method::PUT, url).await
    }

    async fn rename(&self, from: &str, to: &str, overwrite: bool) -> Result<(), RemoteError> {
        let url = self.transfer_endpoint("/v1/fs/move", from, to, overwrite)?;
        self.send_empty(Method::POST, url).await
    }

    async fn copy(&self, from: &str, to: &str, overwrite: bool) -> Result<(), RemoteError> {
        let url = self.transfer_endpoint("/v1/fs/copy", from, to, overwrite)?;
        self.send_empty(Method::POST, url).await
    }

    async fn user(&self) -> Result<UserAccount, RemoteError> {
        let url = self.endpoint("/v1/fs/user")?;
        let response = self.http.get(url).send().await?;
        Self::handle_response(response).await
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct WireEntry {
    name: String,
    #[serde(default)]
    attrs: Option<WireAttrs>,
}

#[derive(Debug, Deserialize, Serialize)]
struct EntryList {
    #[serde(default)]
    items: Vec<WireEntry>,
}

impl EntryList {
    fn into_entries(self) -> Result<Vec<DirEntry>, RemoteError> {
        self.items
            .into_iter()
            .map(|item| {
                Ok(DirEntry {
                    name: item.name,
                    attrs: item.attrs.map(WireAttrs::into_attrs).transpose()?,
                })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct HandleResponse {
    handle: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct ReadDirResponse {
    #[serde(flatten)]
    list: EntryList,
    #[serde(default)]
    eof: bool,
}
