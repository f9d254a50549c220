use crate::model::{STATE_VERSION, SerializedState, StagedFile, Track, Uri};
use crate::persist::{STATE_KEY, StateStorage};
use crate::workspace::WorkspaceResolver;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

// Tracks deserialized per scheduler yield while restoring a large state.
const HYDRATE_CHUNK: usize = 4;

#[derive(Debug)]
pub struct HydratedState {
    pub tracks: Vec<Track>,
    pub active_track_id: String,
}

// Entries whose path no longer exists are silently pruned; any unexpected
// failure fails closed with None so the store starts fresh.
pub async fn hydrate(
    storage: &Arc<dyn StateStorage>,
    workspace: &Arc<dyn WorkspaceResolver>,
) -> Option<HydratedState> {
    match try_hydrate(storage, workspace).await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "hydration failed, starting with fresh state");
            None
        }
    }
}

async fn try_hydrate(
    storage: &Arc<dyn StateStorage>,
    workspace: &Arc<dyn WorkspaceResolver>,
) -> Result<Option<HydratedState>> {
    let Some(blob) = storage.read(STATE_KEY)? else {
        return Ok(None);
    };

    let state: SerializedState =
        serde_json::from_str(&blob).context("parsing persisted track state")?;
    if state.version != STATE_VERSION {
        warn!(version = state.version, "unknown state version, starting fresh");
        return Ok(None);
    }

    let (serialized, active_track_id) = state.into_tracks();
    let semaphore = Arc::new(Semaphore::new(stat_concurrency()));

    let mut tracks = Vec::with_capacity(serialized.len());
    for (i, track) in serialized.into_iter().enumerate() {
        if i > 0 && i % HYDRATE_CHUNK == 0 {
            tokio::task::yield_now().await;
        }
        tracks.push(hydrate_track(track, workspace, &semaphore).await?);
    }

    if tracks.is_empty() {
        return Ok(None);
    }

    // Repair a dangling active pointer rather than surfacing it.
    let active_track_id = if tracks.iter().any(|t| t.id == active_track_id) {
        active_track_id
    } else {
        warn!(active = %active_track_id, "active track missing after restore, falling back to first");
        tracks[0].id.clone()
    };

    Ok(Some(HydratedState {
        tracks,
        active_track_id,
    }))
}

async fn hydrate_track(
    serialized: crate::model::SerializedTrack,
    workspace: &Arc<dyn WorkspaceResolver>,
    semaphore: &Arc<Semaphore>,
) -> Result<Track> {
    let mut set = JoinSet::new();
    let item_count = serialized.items.len();

    for (idx, item) in serialized.items.iter().enumerate() {
        let candidates = candidate_paths(&item.uri, workspace.as_ref());
        let semaphore = Arc::clone(semaphore);
        set.spawn(async move {
            let _permit = semaphore.acquire().await;
            (idx, first_existing(candidates).await)
        });
    }

    let mut resolved: Vec<Option<Uri>> = vec![None; item_count];
    while let Some(joined) = set.join_next().await {
        let (idx, uri) = joined.context("existence check task panicked")?;
        resolved[idx] = uri;
    }

    let mut track = Track::new(serialized.id, serialized.name);
    for (item, uri) in serialized.items.into_iter().zip(resolved) {
        match uri {
            Some(uri) => {
                let mut file = StagedFile::new(uri);
                file.pinned = item.pinned;
                track.files.push(file);
            }
            None => {
                // Expected after external moves/deletes, not an error.
                debug!(uri = %item.uri, "pruning dead link during hydration");
            }
        }
    }

    Ok(track)
}

// Absolute or scheme-qualified paths are used directly; anything else is
// resolved against each workspace root in turn.
fn candidate_paths(raw: &str, workspace: &dyn WorkspaceResolver) -> Vec<PathBuf> {
    let path = PathBuf::from(raw);
    if path.is_absolute() || raw.contains("://") {
        return vec![path];
    }
    workspace
        .roots()
        .iter()
        .map(|root| root.path.join(raw))
        .collect()
}

async fn first_existing(candidates: Vec<PathBuf>) -> Option<Uri> {
    for candidate in candidates {
        match tokio::fs::metadata(&candidate).await {
            Ok(meta) if meta.is_file() => return Some(Uri::from_path(&candidate)),
            _ => {}
        }
    }
    None
}

fn stat_concurrency() -> usize {
    (num_cpus::get() * 4).clamp(4, 32)
}
