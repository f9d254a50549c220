use crate::events::EventHub;
use crate::model::SerializedState;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub const STATE_KEY: &str = "context-stack";
pub const MAX_STATE_BYTES: usize = 100 * 1024;
pub const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

// Durable key/value blob storage; filesystem in production, in-memory in
// tests.
pub trait StateStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>>;
    fn write(&self, key: &str, value: &str) -> Result<()>;
}

// One JSON file per key under a storage directory.
pub struct FsStorage {
    dir: PathBuf,
}

impl FsStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl StateStorage for FsStorage {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading state blob {}", path.display()))?;
        Ok(Some(content))
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating storage dir {}", self.dir.display()))?;
        let path = self.path_for(key);
        std::fs::write(&path, value)
            .with_context(|| format!("writing state blob {}", path.display()))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
    writes: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl StateStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum PersistNotice {
    // The save was skipped so the existing blob stays intact.
    StateTooLarge { bytes: usize },
}

struct Pending {
    state: Option<SerializedState>,
    last_fingerprint: Option<blake3::Hash>,
}

// Saves within the coalescing window collapse into one write; a write whose
// fingerprint matches the last one is skipped entirely.
pub struct PersistenceService {
    storage: Arc<dyn StateStorage>,
    pending: Mutex<Pending>,
    epoch: AtomicU64,
    debounce: Duration,
    pub notices: EventHub<PersistNotice>,
}

impl PersistenceService {
    pub fn new(storage: Arc<dyn StateStorage>, debounce: Duration) -> Self {
        Self {
            storage,
            pending: Mutex::new(Pending {
                state: None,
                last_fingerprint: None,
            }),
            epoch: AtomicU64::new(0),
            debounce,
            notices: EventHub::new(),
        }
    }

    // A newer request resets the window and supersedes the pending snapshot.
    pub fn request_save(self: &Arc<Self>, state: SerializedState) {
        let epoch = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            pending.state = Some(state);
            self.epoch.fetch_add(1, Ordering::SeqCst) + 1
        };

        let service = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(service.debounce).await;
            if service.epoch.load(Ordering::SeqCst) == epoch {
                service.flush();
            }
        });
    }

    // Called on shutdown so a pending save is never lost to teardown.
    pub fn flush(&self) {
        let state = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            self.epoch.fetch_add(1, Ordering::SeqCst);
            pending.state.take()
        };
        if let Some(state) = state {
            self.save_now(&state);
        }
    }

    pub fn save_now(&self, state: &SerializedState) {
        let fingerprint = fingerprint(state);
        {
            let pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            if pending.last_fingerprint == Some(fingerprint) {
                debug!("state unchanged, skipping save");
                return;
            }
        }

        let payload = match serde_json::to_string(state) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to serialize track state");
                return;
            }
        };

        if payload.len() > MAX_STATE_BYTES {
            warn!(
                bytes = payload.len(),
                ceiling = MAX_STATE_BYTES,
                "serialized state exceeds storage ceiling, skipping save"
            );
            self.notices.emit(&PersistNotice::StateTooLarge {
                bytes: payload.len(),
            });
            return;
        }

        match self.storage.write(STATE_KEY, &payload) {
            Ok(()) => {
                let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
                pending.last_fingerprint = Some(fingerprint);
                debug!(bytes = payload.len(), "track state saved");
            }
            Err(e) => warn!(error = %e, "failed to write track state"),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StateStorage> {
        &self.storage
    }
}

// Structural fingerprint: identity, order, names and (uri, pinned) pairs.
// Excludes stats and timestamps so enrichment never triggers a write.
fn fingerprint(state: &SerializedState) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(state.active_track_id.as_bytes());
    hasher.update(&[0xff]);
    for id in &state.track_order {
        hasher.update(id.as_bytes());
        hasher.update(&[0]);
    }
    for id in &state.track_order {
        if let Some(track) = state.tracks.get(id) {
            hasher.update(track.id.as_bytes());
            hasher.update(track.name.as_bytes());
            hasher.update(&(track.items.len() as u64).to_le_bytes());
            for item in &track.items {
                hasher.update(item.uri.as_bytes());
                hasher.update(&[item.pinned as u8]);
            }
        }
    }
    hasher.finalize()
}
