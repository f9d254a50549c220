use crate::model::FileStats;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

pub const CACHE_VERSION: u32 = 1;
pub const MAX_CACHE_ENTRIES: usize = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub mtime: u64,
    pub size: u64,
    pub stats: FileStats,
    pub binary: bool,
}

// An entry is valid while the file's (mtime, size) pair is unchanged; a hit
// skips content reading entirely. Versioned independently of the state blob.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsCache {
    pub version: u32,
    pub entries: HashMap<String, CacheEntry>,
}

impl Default for StatsCache {
    fn default() -> Self {
        Self {
            version: CACHE_VERSION,
            entries: HashMap::new(),
        }
    }
}

impl StatsCache {
    // Missing, corrupt or version-mismatched blobs start an empty cache.
    pub async fn load(path: &Path) -> Self {
        let Ok(bytes) = tokio::fs::read(path).await else {
            return Self::default();
        };
        match bincode::deserialize::<StatsCache>(&bytes) {
            Ok(cache) if cache.version == CACHE_VERSION => cache,
            Ok(cache) => {
                debug!(version = cache.version, "discarding stats cache with old version");
                Self::default()
            }
            Err(e) => {
                warn!(error = %e, "discarding corrupt stats cache");
                Self::default()
            }
        }
    }

    pub async fn save(&mut self, path: &Path) -> Result<()> {
        self.trim();
        let bytes = bincode::serialize(self)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    pub fn lookup(&self, uri: &str, mtime: u64, size: u64) -> Option<&CacheEntry> {
        self.entries
            .get(uri)
            .filter(|e| e.mtime == mtime && e.size == size)
    }

    pub fn insert(&mut self, uri: String, entry: CacheEntry) {
        self.entries.insert(uri, entry);
    }

    fn trim(&mut self) {
        if self.entries.len() <= MAX_CACHE_ENTRIES {
            return;
        }
        let excess = self.entries.len() - MAX_CACHE_ENTRIES;
        let mut by_age: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|(uri, e)| (e.mtime, uri.clone()))
            .collect();
        by_age.sort();
        for (_, uri) in by_age.into_iter().take(excess) {
            self.entries.remove(&uri);
        }
        debug!(evicted = excess, "trimmed stats cache");
    }
}
