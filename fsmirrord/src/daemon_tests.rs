use super::*;
use crate::mirror::StaleReason;
use crate::mirror::tree::Tree;
use fsmirror_core::{DirEntry, FileAttrs, UserAccount};
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[test]
fn expands_tilde_to_home_cache_dir() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/.cache/fsmirror", &home),
        PathBuf::from("/tmp/home-user/.cache/fsmirror")
    );
    assert_eq!(expand_with_home("~", &home), home);
    assert_eq!(expand_with_home("/var/cache", &home), PathBuf::from("/var/cache"));
}

#[test]
fn reads_numbers_from_env_or_default() {
    assert_eq!(read_u64_env("NO_SUCH_ENV_FOR_TEST", 42), 42);
    assert_eq!(read_string_env("NO_SUCH_STRING_ENV_FOR_TEST"), None);
}

#[test]
fn cache_watcher_is_enabled_by_default() {
    assert!(read_bool_env("NO_SUCH_BOOL_ENV_FOR_TEST", true));
}

#[test]
fn configured_id_and_name_override_the_handshake() {
    let info = AgentInfo {
        agent_id: "agent-9".into(),
        os_name: Some("Windows 11".into()),
        services: vec!["FileSystem".into()],
    };
    let mut config = MirrorConfig::for_peer("http://agent:8080", PathBuf::from("/tmp/c"));
    let peer = peer_from_agent(&info, &config);
    assert_eq!(peer.id, "agent-9");
    assert_eq!(peer.name, "agent-9");
    assert!(peer.is_windows());

    config.peer_id = Some("box".into());
    config.peer_name = Some("Build box".into());
    let peer = peer_from_agent(&info, &config);
    assert_eq!(peer.id, "box");
    assert_eq!(peer.name, "Build box");
    assert_eq!(peer.base_url, "http://agent:8080");
}

#[test]
fn formats_entries_with_kind_size_and_flags() {
    let peer = Peer::new("p", "p", "http://p").with_os_name("Linux");
    let mut tree = Tree::new();
    let system = tree.root_for(&peer);
    tree.merge_children(
        system,
        vec![DirEntry {
            name: "/".into(),
            attrs: Some(FileAttrs::dir(None)),
        }],
    );
    let root = tree.find_child(system, "/").unwrap();
    let mut locked = FileAttrs::file(12, Some(5));
    locked.permissions = 0o444;
    tree.merge_children(
        root,
        vec![DirEntry {
            name: "notes.txt".into(),
            attrs: Some(locked),
        }],
    );
    let file = tree.find_child(root, "notes.txt").unwrap();

    let line = format_entry(&tree.snapshot(file).unwrap(), None);
    assert!(line.starts_with("- "));
    assert!(line.contains(" 12 "));
    assert!(line.ends_with("/notes.txt ro"));
    assert!(format_entry(&tree.snapshot(root).unwrap(), None).starts_with("r "));

    let stranger = UserAccount {
        real_uid: 1000,
        effective_uid: 1000,
        real_gid: 1000,
        effective_gid: 1000,
        home: None,
    };
    let root_line = format_entry(&tree.snapshot(root).unwrap(), Some(&stranger));
    assert!(root_line.ends_with(" ro"));
    assert!(!format_entry(&tree.snapshot(root).unwrap(), None).ends_with(" ro"));
}

#[test]
fn describes_cache_verdicts() {
    assert_eq!(
        describe_cache(Staleness::Fresh, CacheState::Consistent),
        "fresh, consistent"
    );
    assert_eq!(
        describe_cache(
            Staleness::Stale(StaleReason::DigestMismatch),
            CacheState::Conflict
        ),
        "stale (DigestMismatch), conflict"
    );
}

async fn mock_agent() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/agent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "agent_id": "agent-1",
            "os_name": "Linux",
            "services": ["FileSystem"]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/fs/roots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"name": "/", "attrs": {"type": "dir"}}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/fs/opendir"))
        .and(query_param("path", "/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"handle": "h1"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/fs/readdir"))
        .and(query_param("handle", "h1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"name": "etc", "attrs": {"type": "dir"}},
                {"name": "notes.txt", "attrs": {"type": "file", "size": 5}}
            ],
            "eof": true
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/fs/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "real_uid": 1000,
            "effective_uid": 1000,
            "real_gid": 1000,
            "effective_gid": 1000
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/fs/handles/h1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn bootstrap_greets_the_agent_and_lists_paths() {
    let server = mock_agent().await;
    let cache = tempdir().unwrap();
    let config = MirrorConfig::for_peer(server.uri(), cache.path().join("cache"));

    let runtime = MirrorRuntime::bootstrap(config).await.unwrap();
    assert_eq!(runtime.peer().id, "agent-1");
    assert!(!runtime.peer().is_windows());
    assert!(cache.path().join("cache").is_dir());
    let account = runtime.session().user_account("agent-1").await.unwrap();
    assert_eq!(account.effective_uid, 1000);

    runtime
        .execute(MirrorCommand::List("/".into()))
        .await
        .unwrap();
    let root = runtime.locate("/").await.unwrap();
    let names: Vec<String> = runtime
        .session()
        .children(root)
        .await
        .unwrap()
        .into_iter()
        .map(|child| child.name)
        .collect();
    assert_eq!(names, vec!["etc".to_string(), "notes.txt".to_string()]);
}

#[tokio::test]
async fn bootstrap_fails_when_the_agent_is_unreachable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/agent"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .mount(&server)
        .await;
    let cache = tempdir().unwrap();
    let config = MirrorConfig::for_peer(server.uri(), cache.path().to_path_buf());

    let err = MirrorRuntime::bootstrap(config).await.err().unwrap();
    assert!(format!("{err:#}").contains("failed to reach the agent"));
}

#[tokio::test]
async fn run_shuts_the_session_down_after_the_command() {
    let server = mock_agent().await;
    let cache = tempdir().unwrap();
    let config = MirrorConfig::for_peer(server.uri(), cache.path().to_path_buf());
    let runtime = MirrorRuntime::bootstrap(config).await.unwrap();
    let session = runtime.session().clone();

    runtime.run(MirrorCommand::Roots).await.unwrap();
    assert!(session.dispatcher().submit(|_| {}).is_err());
}
