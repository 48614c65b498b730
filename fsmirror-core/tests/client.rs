use futures_util::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use fsmirror_core::{DirHandle, FileAttrs, FileKind, FileService, RemoteFsClient};

#[tokio::test]
async fn agent_info_reports_services() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/agent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "agent_id": "agent-7",
            "os_name": "Windows 10",
            "services": ["FileSystem", "Processes"]
        })))
        .mount(&server)
        .await;

    let client = RemoteFsClient::new(&server.uri()).unwrap();
    let info = client.agent_info().await.unwrap();

    assert_eq!(info.agent_id, "agent-7");
    assert_eq!(info.os_name.as_deref(), Some("Windows 10"));
    assert!(info.services.iter().any(|s| s == "FileSystem"));
}

#[tokio::test]
async fn user_reports_the_agent_account() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/fs/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "real_uid": 1000,
            "effective_uid": 1000,
            "real_gid": 100,
            "effective_gid": 100,
            "home": "/home/agent"
        })))
        .mount(&server)
        .await;

    let client = RemoteFsClient::new(&server.uri()).unwrap();
    let account = client.user().await.unwrap();

    assert_eq!(account.effective_uid, 1000);
    assert_eq!(account.effective_gid, 100);
    assert_eq!(account.home.as_deref(), Some("/home/agent"));
}

#[tokio::test]
async fn list_roots_parses_entries() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/fs/roots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"name": "/", "attrs": {"type": "dir", "modified": "2024-01-01T00:00:00Z"}},
                {"name": "D:\\"}
            ]
        })))
        .mount(&server)
        .await;

    let client = RemoteFsClient::new(&server.uri()).unwrap();
    let roots = client.list_roots().await.unwrap();

    assert_eq!(roots.len(), 2);
    assert_eq!(roots[0].name, "/");
    let attrs = roots[0].attrs.as_ref().unwrap();
    assert_eq!(attrs.kind, FileKind::Dir);
    assert_eq!(attrs.mtime, Some(1_704_067_200_000));
    assert!(roots[1].attrs.is_none());
}

#[tokio::test]
async fn open_and_read_dir_pages_with_limit() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/fs/opendir"))
        .and(query_param("path", "/home/user docs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"handle": "h1"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/fs/readdir"))
        .and(query_param("handle", "h1"))
        .and(query_param("limit", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"name": "a.txt", "attrs": {"type": "file", "size": 3}},
                {"name": "sub", "attrs": {"type": "dir"}}
            ],
            "eof": true
        })))
        .mount(&server)
        .await;

    let client = RemoteFsClient::new(&server.uri()).unwrap().with_page_size(2);
    let handle = client.open_dir("/home/user docs").await.unwrap();
    assert_eq!(handle, DirHandle("h1".into()));

    let chunk = client.read_dir(&handle).await.unwrap();
    assert!(chunk.eof);
    assert_eq!(chunk.entries.len(), 2);
    assert_eq!(chunk.entries[0].attrs.as_ref().unwrap().size, 3);
}

#[tokio::test]
async fn close_handle_accepts_no_content() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/fs/handles/h1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = RemoteFsClient::new(&server.uri()).unwrap();
    client.close_handle(&DirHandle("h1".into())).await.unwrap();
}

#[tokio::test]
async fn stat_missing_file_is_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/fs/stat"))
        .and(query_param("path", "/nope"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such file"))
        .mount(&server)
        .await;

    let client = RemoteFsClient::new(&server.uri()).unwrap();
    let err = client.stat("/nope").await.unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(err.peer_message(), Some("no such file"));
}

#[tokio::test]
async fn server_errors_are_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/fs/stat"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = RemoteFsClient::new(&server.uri()).unwrap();
    let err = client.stat("/x").await.unwrap_err();

    assert!(err.is_retryable());
    assert!(!err.is_not_found());
}

#[tokio::test]
async fn set_stat_sends_attrs_as_json() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/v1/fs/stat"))
        .and(query_param("path", "/ro.txt"))
        .and(body_json(json!({
            "type": "file",
            "size": 4,
            "permissions": 0o644,
            "uid": 0,
            "gid": 0
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = RemoteFsClient::new(&server.uri()).unwrap();
    client
        .set_stat("/ro.txt", &FileAttrs::file(4, None))
        .await
        .unwrap();
}

#[tokio::test]
async fn read_streams_content() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/fs/content"))
        .and(query_param("path", "/a.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
        .mount(&server)
        .await;

    let client = RemoteFsClient::new(&server.uri()).unwrap();
    let mut stream = client.read("/a.txt").await.unwrap();
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        body.extend(chunk.unwrap());
    }

    assert_eq!(body, b"hello world");
}

#[tokio::test]
async fn move_sends_overwrite_flag() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/fs/move"))
        .and(query_param("from", "/a.txt"))
        .and(query_param("path", "/b.txt"))
        .and(query_param("overwrite", "true"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = RemoteFsClient::new(&server.uri()).unwrap();
    client.rename("/a.txt", "/b.txt", true).await.unwrap();
}

#[tokio::test]
async fn delete_file_is_not_recursive() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/fs/resources"))
        .and(query_param("path", "/a.txt"))
        .and(query_param("recursive", "false"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = RemoteFsClient::new(&server.uri()).unwrap();
    client.remove("/a.txt").await.unwrap();
}

#[tokio::test]
async fn mkdir_conflict_is_permanent() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/fs/dirs"))
        .respond_with(ResponseTemplate::new(409).set_body_string("exists"))
        .mount(&server)
        .await;

    let client = RemoteFsClient::new(&server.uri()).unwrap();
    let err = client.mkdir("/dir").await.unwrap_err();

    assert!(!err.is_retryable());
    assert_eq!(err.peer_message(), Some("exists"));
}
