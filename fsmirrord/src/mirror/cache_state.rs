use super::digest::{Digest, FileState};

/// Where the cached copy stands relative to the last agreed content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Cache, remote file and base agree, or there is no cache file.
    Consistent,
    /// Only the cache was edited since the base.
    Modified,
    /// Only the remote file changed since the base.
    Outdated,
    /// Both sides changed.
    Conflict,
}

/// Classifies a cached file from its digest record.
///
/// Stamps whose mtime no longer matches are ignored, and a side without a
/// usable digest counts as changed.
pub fn cache_state(
    state: &FileState,
    has_cache_file: bool,
    target_mtime: Option<i64>,
    cache_mtime: Option<i64>,
) -> CacheState {
    if !has_cache_file {
        return CacheState::Consistent;
    }
    let cache = current(state.cache.map(|s| (s.digest, s.mtime)), cache_mtime);
    let target = current(state.target.map(|s| (s.digest, s.mtime)), target_mtime);

    let Some(base) = state.base else {
        return if cache.is_some() && cache == target {
            CacheState::Consistent
        } else {
            CacheState::Conflict
        };
    };

    let local_changed = cache != Some(base);
    let remote_changed = target != Some(base);
    match (local_changed, remote_changed) {
        (false, false) => CacheState::Consistent,
        (true, false) => CacheState::Modified,
        (false, true) => CacheState::Outdated,
        (true, true) => CacheState::Conflict,
    }
}

fn current(stamp: Option<(Digest, Option<i64>)>, mtime: Option<i64>) -> Option<Digest> {
    stamp
        .filter(|(_, stamped)| *stamped == mtime)
        .map(|(digest, _)| digest)
}
