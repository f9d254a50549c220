use crate::model::{Track, Uri};
use std::collections::HashMap;

// The count for a URI always equals the number of (track, file) pairs
// referencing it, which makes "is this path tracked anywhere" O(1).
#[derive(Debug, Default)]
pub struct UriIndex {
    counts: HashMap<Uri, usize>,
}

impl UriIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, uri: &Uri) {
        *self.counts.entry(uri.clone()).or_insert(0) += 1;
    }

    pub fn remove(&mut self, uri: &Uri) {
        if let Some(count) = self.counts.get_mut(uri) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(uri);
            }
        }
    }

    pub fn contains(&self, uri: &Uri) -> bool {
        self.counts.contains_key(uri)
    }

    pub fn count(&self, uri: &Uri) -> usize {
        self.counts.get(uri).copied().unwrap_or(0)
    }

    pub fn distinct_len(&self) -> usize {
        self.counts.len()
    }

    pub fn rebuild(&mut self, tracks: &[Track]) {
        self.counts.clear();
        for track in tracks {
            for file in &track.files {
                self.add(&file.uri);
            }
        }
    }
}
