fn peer_from_agent(info: &AgentInfo, config: &MirrorConfig) -> Peer {
    let mut peer = Peer::from_agent(info, config.peer_url.clone());
    if let Some(id) = &config.peer_id {
        peer.id = id.clone();
    }
    if let Some(name) = &config.peer_name {
        peer.name = name.clone();
    }
    peer
}

fn format_entry(node: &NodeSnapshot, account: Option<&UserAccount>) -> String {
    let marker = match node.kind {
        NodeKind::SystemRoot | NodeKind::Root => 'r',
        NodeKind::Dir => 'd',
        NodeKind::File => '-',
    };
    let size = node
        .attrs
        .as_ref()
        .filter(|attrs| attrs.is_file())
        .map(|attrs| attrs.size.to_string())
        .unwrap_or_default();
    let mtime = node
        .mtime()
        .map(|mtime| mtime.to_string())
        .unwrap_or_else(|| "-".to_string());
    let read_only = if node.is_read_only_for(account) { " ro" } else { "" };
    format!("{marker} {size:>10} {mtime:>14} {}{read_only}", node.location)
}

fn describe_cache(verdict: Staleness, state: CacheState) -> String {
    let freshness = match verdict {
        Staleness::Fresh => "fresh".to_string(),
        Staleness::Stale(reason) => format!("stale ({reason:?})"),
    };
    let state = match state {
        CacheState::Consistent => "consistent",
        CacheState::Modified => "modified locally",
        CacheState::Outdated => "outdated",
        CacheState::Conflict => "conflict",
    };
    format!("{freshness}, {state}")
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DEFAULT_CACHE_DIR_NAME)
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
