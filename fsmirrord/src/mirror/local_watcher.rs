use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::transfer::is_partial;

/// Local change to a file under the cache root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Modified(PathBuf),
    Removed(PathBuf),
}

impl CacheEvent {
    pub fn path(&self) -> &Path {
        match self {
            CacheEvent::Modified(path) | CacheEvent::Removed(path) => path,
        }
    }
}

pub fn start_cache_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<CacheEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        match res {
            Ok(event) => {
                for mapped in map_event(event) {
                    let _ = tx.send(mapped);
                }
            }
            Err(err) => tracing::warn!(error = %err, "cache watcher error"),
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(event: Event) -> Vec<CacheEvent> {
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(mode)) => {
            let mut mapped = Vec::new();
            let mut paths = event.paths.into_iter();
            match (mode, paths.next(), paths.next()) {
                (_, Some(from), Some(to)) => {
                    mapped.push(CacheEvent::Removed(from));
                    mapped.push(CacheEvent::Modified(to));
                }
                (notify::event::RenameMode::From, Some(from), None) => {
                    mapped.push(CacheEvent::Removed(from));
                }
                (_, Some(to), None) => mapped.push(CacheEvent::Modified(to)),
                _ => {}
            }
            mapped.retain(|event| !is_partial(event.path()));
            mapped
        }
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .into_iter()
            .filter(|path| !is_partial(path))
            .map(CacheEvent::Modified)
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .into_iter()
            .filter(|path| !is_partial(path))
            .map(CacheEvent::Removed)
            .collect(),
        _ => Vec::new(),
    }
}
