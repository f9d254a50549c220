use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const STATE_VERSION: u32 = 1;

pub type PathSegments = SmallVec<[String; 8]>;

// Canonical identifier for a staged file: a normalized path string with
// forward slashes. Equality and hashing operate on the canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().replace('\\', "/"))
    }

    pub fn from_path(path: &Path) -> Self {
        Self(path.to_string_lossy().replace('\\', "/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_path(&self) -> PathBuf {
        PathBuf::from(&self.0)
    }

    pub fn basename(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub token_count: usize,
    pub char_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedFile {
    pub uri: Uri,
    pub label: String,
    pub pinned: bool,
    // None until the stats engine has looked at the file.
    pub binary: Option<bool>,
    pub stats: Option<FileStats>,
    // Memoized root-relative path segments; derived, never persisted.
    pub segments: Option<PathSegments>,
}

impl StagedFile {
    pub fn new(uri: Uri) -> Self {
        let label = uri.basename().to_string();
        Self {
            uri,
            label,
            pinned: false,
            binary: None,
            stats: None,
            segments: None,
        }
    }

    pub fn token_count(&self) -> usize {
        self.stats.map(|s| s.token_count).unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: String,
    pub name: String,
    pub files: Vec<StagedFile>,
}

impl Track {
    pub fn new(id: String, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            files: Vec::new(),
        }
    }

    pub fn contains(&self, uri: &Uri) -> bool {
        self.files.iter().any(|f| &f.uri == uri)
    }

    pub fn file_mut(&mut self, uri: &Uri) -> Option<&mut StagedFile> {
        self.files.iter_mut().find(|f| &f.uri == uri)
    }
}

// Durable representation. Only identity, order and pin flags survive a
// restart; stats and tree structure are recomputed after restore.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub active_track_id: String,
    pub track_order: Vec<String>,
    pub tracks: HashMap<String, SerializedTrack>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedTrack {
    pub id: String,
    pub name: String,
    pub items: Vec<SerializedItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedItem {
    pub uri: String,
    pub pinned: bool,
}

impl SerializedState {
    pub fn capture(tracks: &[Track], active_track_id: &str) -> Self {
        let track_order = tracks.iter().map(|t| t.id.clone()).collect();
        let tracks = tracks
            .iter()
            .map(|t| {
                let items = t
                    .files
                    .iter()
                    .map(|f| SerializedItem {
                        uri: f.uri.as_str().to_string(),
                        pinned: f.pinned,
                    })
                    .collect();
                (
                    t.id.clone(),
                    SerializedTrack {
                        id: t.id.clone(),
                        name: t.name.clone(),
                        items,
                    },
                )
            })
            .collect();

        Self {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            active_track_id: active_track_id.to_string(),
            track_order,
            tracks,
        }
    }

    // Order entries without a track are dropped; tracks missing from the
    // order are appended by id so no persisted data is lost.
    pub fn into_tracks(mut self) -> (Vec<SerializedTrack>, String) {
        let mut out = Vec::with_capacity(self.tracks.len());
        for id in &self.track_order {
            if let Some(track) = self.tracks.remove(id) {
                out.push(track);
            }
        }

        let mut leftover: Vec<SerializedTrack> = self.tracks.into_values().collect();
        leftover.sort_by(|a, b| a.id.cmp(&b.id));
        out.extend(leftover);

        (out, self.active_track_id)
    }
}
