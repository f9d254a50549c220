use crate::events::EventHub;
use crate::hydrate::HydratedState;
use crate::index::UriIndex;
use crate::model::{FileStats, SerializedState, StagedFile, Track, Uri};
use crate::persist::PersistenceService;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

pub const DEFAULT_TRACK_NAME: &str = "Main";
const SENTINEL_TRACK_ID: &str = "track-sentinel";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Initialized,
    TracksChanged,
    FilesChanged,
    StatsUpdated,
    // Deleting the last remaining track was rejected; surface to the user.
    LastTrackProtected,
}

struct StoreState {
    initialized: bool,
    tracks: Vec<Track>,
    active_id: String,
    index: UriIndex,
    next_seq: u64,
}

impl StoreState {
    fn active_mut(&mut self) -> &mut Track {
        let idx = self
            .tracks
            .iter()
            .position(|t| t.id == self.active_id)
            .unwrap_or(0);
        &mut self.tracks[idx]
    }

    fn next_id(&mut self) -> String {
        self.next_seq += 1;
        format!(
            "track-{}-{}",
            chrono::Utc::now().timestamp_millis(),
            self.next_seq
        )
    }

    fn snapshot(&self) -> SerializedState {
        SerializedState::capture(&self.tracks, &self.active_id)
    }
}

// Every mutation follows the same sequence: mutate, reindex, schedule
// persistence, notify. Listeners never observe an index that disagrees
// with the track data.
pub struct TrackStore {
    state: Mutex<StoreState>,
    persistence: Arc<PersistenceService>,
    pub events: EventHub<StoreEvent>,
}

impl TrackStore {
    pub fn new(persistence: Arc<PersistenceService>) -> Self {
        let sentinel = Track::new(SENTINEL_TRACK_ID.into(), DEFAULT_TRACK_NAME);
        Self {
            state: Mutex::new(StoreState {
                initialized: false,
                active_id: sentinel.id.clone(),
                tracks: vec![sentinel],
                index: UriIndex::new(),
                next_seq: 0,
            }),
            persistence,
            events: EventHub::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // Replaces the sentinel with the hydration result (or a single default
    // track) and fires exactly one change notification.
    pub fn initialize(&self, hydrated: Option<HydratedState>) {
        {
            let mut state = self.lock();
            if state.initialized {
                warn!("track store initialized twice, ignoring");
                return;
            }
            match hydrated {
                Some(result) if !result.tracks.is_empty() => {
                    state.tracks = result.tracks;
                    state.active_id = result.active_track_id;
                }
                _ => {
                    let id = state.next_id();
                    state.tracks = vec![Track::new(id.clone(), DEFAULT_TRACK_NAME)];
                    state.active_id = id;
                }
            }
            let tracks = std::mem::take(&mut state.tracks);
            state.index.rebuild(&tracks);
            state.tracks = tracks;
            state.initialized = true;
            debug!(tracks = state.tracks.len(), "track store initialized");
        }
        self.events.emit(&StoreEvent::Initialized);
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    // --- track operations ---

    pub fn create_track(&self, name: &str) -> String {
        let name = name.trim();
        let snapshot;
        let id;
        {
            let mut state = self.lock();
            id = state.next_id();
            let name = if name.is_empty() { DEFAULT_TRACK_NAME } else { name };
            state.tracks.push(Track::new(id.clone(), name));
            state.active_id = id.clone();
            snapshot = state.snapshot();
        }
        self.persistence.request_save(snapshot);
        self.events.emit(&StoreEvent::TracksChanged);
        id
    }

    pub fn rename_track(&self, id: &str, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            warn!(track = id, "rejecting empty track name");
            return false;
        }
        let snapshot = {
            let mut state = self.lock();
            let Some(track) = state.tracks.iter_mut().find(|t| t.id == id) else {
                return false;
            };
            track.name = name.to_string();
            state.snapshot()
        };
        self.persistence.request_save(snapshot);
        self.events.emit(&StoreEvent::TracksChanged);
        true
    }

    // Rejected on the last remaining track. Deleting the active track
    // promotes the next in order.
    pub fn delete_track(&self, id: &str) -> bool {
        let snapshot = {
            let mut state = self.lock();
            if state.tracks.len() == 1 && state.tracks[0].id == id {
                drop(state);
                warn!(track = id, "refusing to delete the last remaining track");
                self.events.emit(&StoreEvent::LastTrackProtected);
                return false;
            }
            let Some(pos) = state.tracks.iter().position(|t| t.id == id) else {
                return false;
            };
            state.tracks.remove(pos);
            if state.tracks.is_empty() {
                let id = state.next_id();
                state.tracks.push(Track::new(id, DEFAULT_TRACK_NAME));
            }
            if state.active_id == id {
                let promoted = pos.min(state.tracks.len() - 1);
                state.active_id = state.tracks[promoted].id.clone();
            }
            let tracks = std::mem::take(&mut state.tracks);
            state.index.rebuild(&tracks);
            state.tracks = tracks;
            state.snapshot()
        };
        self.persistence.request_save(snapshot);
        self.events.emit(&StoreEvent::TracksChanged);
        true
    }

    pub fn switch_to_track(&self, id: &str) -> bool {
        let snapshot = {
            let mut state = self.lock();
            if !state.tracks.iter().any(|t| t.id == id) {
                return false;
            }
            if state.active_id == id {
                return true;
            }
            state.active_id = id.to_string();
            state.snapshot()
        };
        self.persistence.request_save(snapshot);
        self.events.emit(&StoreEvent::TracksChanged);
        true
    }

    // Moves source before target, or to the end when target is None.
    pub fn reorder_tracks(&self, source_id: &str, target_id: Option<&str>) -> bool {
        let snapshot = {
            let mut state = self.lock();
            let Some(from) = state.tracks.iter().position(|t| t.id == source_id) else {
                return false;
            };
            let track = state.tracks.remove(from);
            let to = target_id
                .and_then(|id| state.tracks.iter().position(|t| t.id == id))
                .unwrap_or(state.tracks.len());
            state.tracks.insert(to, track);
            state.snapshot()
        };
        self.persistence.request_save(snapshot);
        self.events.emit(&StoreEvent::TracksChanged);
        true
    }

    // --- file operations ---

    // Returns only the URIs actually added; duplicates by canonical URI
    // string are skipped.
    pub fn add_files_to_active(&self, uris: Vec<Uri>) -> Vec<Uri> {
        let mut added = Vec::new();
        let snapshot = {
            let mut state = self.lock();
            if !state.initialized {
                // Anything staged onto the sentinel would be discarded by the
                // wholesale swap in initialize.
                warn!("ignoring file staging before initialization");
                return added;
            }
            let mut seen: HashSet<Uri> =
                state.active_mut().files.iter().map(|f| f.uri.clone()).collect();
            for uri in uris {
                if !seen.insert(uri.clone()) {
                    continue;
                }
                state.active_mut().files.push(StagedFile::new(uri.clone()));
                state.index.add(&uri);
                added.push(uri);
            }
            if added.is_empty() {
                return added;
            }
            state.snapshot()
        };
        self.persistence.request_save(snapshot);
        self.events.emit(&StoreEvent::FilesChanged);
        added
    }

    pub fn remove_files_from_active(&self, uris: &[Uri]) {
        let removal: HashSet<&Uri> = uris.iter().collect();
        let snapshot = {
            let mut state = self.lock();
            let before = state.active_mut().files.len();
            let removed: Vec<Uri> = state
                .active_mut()
                .files
                .iter()
                .filter(|f| removal.contains(&f.uri))
                .map(|f| f.uri.clone())
                .collect();
            state.active_mut().files.retain(|f| !removal.contains(&f.uri));
            for uri in &removed {
                state.index.remove(uri);
            }
            if state.active_mut().files.len() == before {
                return;
            }
            state.snapshot()
        };
        self.persistence.request_save(snapshot);
        self.events.emit(&StoreEvent::FilesChanged);
    }

    pub fn clear_active(&self) {
        let snapshot = {
            let mut state = self.lock();
            let cleared: Vec<Uri> = state
                .active_mut()
                .files
                .iter()
                .filter(|f| !f.pinned)
                .map(|f| f.uri.clone())
                .collect();
            if cleared.is_empty() {
                return;
            }
            state.active_mut().files.retain(|f| f.pinned);
            for uri in &cleared {
                state.index.remove(uri);
            }
            state.snapshot()
        };
        self.persistence.request_save(snapshot);
        self.events.emit(&StoreEvent::FilesChanged);
    }

    pub fn toggle_pin(&self, uris: &[Uri]) {
        let targets: HashSet<&Uri> = uris.iter().collect();
        let snapshot = {
            let mut state = self.lock();
            let mut changed = false;
            for file in &mut state.active_mut().files {
                if targets.contains(&file.uri) {
                    file.pinned = !file.pinned;
                    changed = true;
                }
            }
            if !changed {
                return;
            }
            state.snapshot()
        };
        self.persistence.request_save(snapshot);
        self.events.emit(&StoreEvent::FilesChanged);
    }

    pub fn has_uri(&self, uri: &Uri) -> bool {
        self.lock().index.contains(uri)
    }

    pub fn remove_uri_everywhere(&self, uri: &Uri) {
        let snapshot = {
            let mut state = self.lock();
            let mut removed = 0usize;
            for track in &mut state.tracks {
                let before = track.files.len();
                track.files.retain(|f| &f.uri != uri);
                removed += before - track.files.len();
            }
            if removed == 0 {
                return;
            }
            for _ in 0..removed {
                state.index.remove(uri);
            }
            debug!(uri = %uri, occurrences = removed, "removed vanished file from all tracks");
            state.snapshot()
        };
        self.persistence.request_save(snapshot);
        self.events.emit(&StoreEvent::FilesChanged);
    }

    // Stats survive a rename (same content), the segment memo does not.
    pub fn replace_uri(&self, old: &Uri, new: &Uri) {
        let snapshot = {
            let mut state = self.lock();
            let mut replaced = 0usize;
            for track in &mut state.tracks {
                for file in &mut track.files {
                    if &file.uri == old {
                        file.uri = new.clone();
                        file.label = new.basename().to_string();
                        file.segments = None;
                        replaced += 1;
                    }
                }
            }
            if replaced == 0 {
                return;
            }
            for _ in 0..replaced {
                state.index.remove(old);
                state.index.add(new);
            }
            debug!(from = %old, to = %new, occurrences = replaced, "replaced renamed uri");
            state.snapshot()
        };
        self.persistence.request_save(snapshot);
        self.events.emit(&StoreEvent::FilesChanged);
    }

    // Applies to every track staging the URI; the stats describe the
    // content, not the staging. The scheduled save is fingerprint-skipped.
    pub fn apply_stats(&self, results: &[(Uri, Option<FileStats>, Option<bool>)]) {
        let snapshot = {
            let mut state = self.lock();
            let mut changed = false;
            for (uri, stats, binary) in results {
                for track in &mut state.tracks {
                    if let Some(file) = track.file_mut(uri) {
                        file.stats = *stats;
                        file.binary = *binary;
                        changed = true;
                    }
                }
            }
            if !changed {
                return;
            }
            state.snapshot()
        };
        self.persistence.request_save(snapshot);
        self.events.emit(&StoreEvent::StatsUpdated);
    }

    // --- read surface ---

    pub fn active_track(&self) -> Track {
        let mut state = self.lock();
        state.active_mut().clone()
    }

    pub fn active_track_id(&self) -> String {
        self.lock().active_id.clone()
    }

    pub fn all_tracks(&self) -> Vec<Track> {
        self.lock().tracks.clone()
    }

    pub fn get_files(&self) -> Vec<StagedFile> {
        let mut state = self.lock();
        state.active_mut().files.clone()
    }

    pub fn tracked_uris(&self) -> Vec<Uri> {
        self.lock()
            .tracks
            .iter()
            .flat_map(|t| t.files.iter().map(|f| f.uri.clone()))
            .collect()
    }

    pub fn uri_refcount(&self, uri: &Uri) -> usize {
        self.lock().index.count(uri)
    }
}
