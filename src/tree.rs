use crate::model::{StagedFile, Uri};
use crate::workspace::{WorkspaceResolver, relative_segments};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

// Insertions between scheduler yields during a full rebuild.
const BUILD_YIELD_EVERY: usize = 200;

// Folders are synthesized from shared path prefixes and never persisted;
// children are resolved through the projector by path key, not through
// back-pointers.
#[derive(Debug, Clone)]
pub struct FolderView {
    pub id: String,
    pub label: String,
    pub path: String,
    pub token_count: usize,
    pub file_count: usize,
    pub pinned: bool,
}

#[derive(Debug, Clone)]
pub enum StackItem {
    Folder(FolderView),
    File(StagedFile),
}

#[derive(Debug, Default)]
struct FolderNode {
    label: String,
    subfolders: Vec<String>,
    files: Vec<Uri>,
    // Flattened descendant files, for folder-level export and counts.
    contained: Vec<Uri>,
    token_count: usize,
    pinned: bool,
}

// Folders live in a lookup map keyed by their cumulative path string;
// removal walks the same derived key chain back up, pruning empty folders.
pub struct TreeProjector {
    workspace: Arc<dyn WorkspaceResolver>,
    folders: HashMap<String, FolderNode>,
    root_folders: Vec<String>,
    root_files: Vec<Uri>,
    files: HashMap<Uri, StagedFile>,
}

impl TreeProjector {
    pub fn new(workspace: Arc<dyn WorkspaceResolver>) -> Self {
        Self {
            workspace,
            folders: HashMap::new(),
            root_folders: Vec::new(),
            root_files: Vec::new(),
            files: HashMap::new(),
        }
    }

    // Full rebuild, used after a track switch or bulk load.
    pub async fn build(&mut self, files: Vec<StagedFile>) {
        self.folders.clear();
        self.root_folders.clear();
        self.root_files.clear();
        self.files.clear();

        for (i, file) in files.into_iter().enumerate() {
            if i > 0 && i % BUILD_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
            self.insert_file(file);
        }
        self.aggregate();
    }

    // Incremental update for everyday add/remove.
    pub fn patch(&mut self, added: Vec<StagedFile>, removed: &[Uri]) {
        for uri in removed {
            self.remove_file(uri);
        }
        for file in added {
            self.insert_file(file);
        }
        self.aggregate();
    }

    pub fn update_files(&mut self, files: &[StagedFile]) {
        for fresh in files {
            if let Some(existing) = self.files.get_mut(&fresh.uri) {
                existing.stats = fresh.stats;
                existing.binary = fresh.binary;
                existing.pinned = fresh.pinned;
            }
        }
        self.aggregate();
    }

    fn insert_file(&mut self, mut file: StagedFile) {
        if self.files.contains_key(&file.uri) {
            self.remove_file(&file.uri.clone());
        }

        let segments = file
            .segments
            .clone()
            .unwrap_or_else(|| relative_segments(self.workspace.as_ref(), &file.uri));
        file.segments = Some(segments.clone());
        let uri = file.uri.clone();
        self.files.insert(uri.clone(), file);

        if segments.len() <= 1 {
            self.root_files.push(uri);
            return;
        }

        let mut key = String::new();
        for segment in &segments[..segments.len() - 1] {
            let parent_key = key.clone();
            if key.is_empty() {
                key = segment.clone();
            } else {
                key = format!("{key}/{segment}");
            }

            if !self.folders.contains_key(&key) {
                self.folders.insert(
                    key.clone(),
                    FolderNode {
                        label: segment.clone(),
                        ..FolderNode::default()
                    },
                );
                if parent_key.is_empty() {
                    self.root_folders.push(key.clone());
                } else if let Some(parent) = self.folders.get_mut(&parent_key) {
                    parent.subfolders.push(key.clone());
                }
            }

            if let Some(folder) = self.folders.get_mut(&key) {
                folder.contained.push(uri.clone());
            }
        }

        if let Some(deepest) = self.folders.get_mut(&key) {
            deepest.files.push(uri);
        }
    }

    fn remove_file(&mut self, uri: &Uri) {
        let Some(file) = self.files.remove(uri) else {
            return;
        };
        let segments = file
            .segments
            .unwrap_or_else(|| relative_segments(self.workspace.as_ref(), uri));

        if segments.len() <= 1 {
            self.root_files.retain(|u| u != uri);
            return;
        }

        // Cumulative keys, shallowest to deepest.
        let mut keys = Vec::with_capacity(segments.len() - 1);
        let mut key = String::new();
        for segment in &segments[..segments.len() - 1] {
            if key.is_empty() {
                key = segment.clone();
            } else {
                key = format!("{key}/{segment}");
            }
            keys.push(key.clone());
        }

        for k in &keys {
            if let Some(folder) = self.folders.get_mut(k) {
                folder.contained.retain(|u| u != uri);
            }
        }
        if let Some(deepest) = keys.last().and_then(|k| self.folders.get_mut(k)) {
            deepest.files.retain(|u| u != uri);
        }

        for depth in (0..keys.len()).rev() {
            let k = &keys[depth];
            let empty = self
                .folders
                .get(k)
                .map(|f| f.files.is_empty() && f.subfolders.is_empty())
                .unwrap_or(false);
            if !empty {
                break;
            }
            self.folders.remove(k);
            if depth == 0 {
                self.root_folders.retain(|p| p != k);
            } else if let Some(parent) = self.folders.get_mut(&keys[depth - 1]) {
                parent.subfolders.retain(|p| p != k);
            }
        }
    }

    // A folder's total is the sum of its direct files plus its subfolders'
    // totals. Deepest folders are summed first.
    fn aggregate(&mut self) {
        let mut keys: Vec<String> = self.folders.keys().cloned().collect();
        keys.sort_by_key(|k| std::cmp::Reverse(k.matches('/').count()));

        for key in keys {
            let (tokens, pinned) = {
                let folder = &self.folders[&key];
                let mut tokens: usize = folder
                    .files
                    .iter()
                    .filter_map(|u| self.files.get(u))
                    .map(|f| f.token_count())
                    .sum();
                let mut pinned = folder
                    .files
                    .iter()
                    .filter_map(|u| self.files.get(u))
                    .any(|f| f.pinned);
                for sub in &folder.subfolders {
                    if let Some(subfolder) = self.folders.get(sub) {
                        tokens += subfolder.token_count;
                        pinned |= subfolder.pinned;
                    }
                }
                (tokens, pinned)
            };
            if let Some(folder) = self.folders.get_mut(&key) {
                folder.token_count = tokens;
                folder.pinned = pinned;
            }
        }
    }

    // --- read surface ---

    // Folders sort before files; pinned subtrees surface first; labels
    // compare case-insensitively with numeric awareness.
    pub fn get_children(&self, parent: Option<&str>) -> Vec<StackItem> {
        let (folder_keys, file_uris): (&[String], &[Uri]) = match parent {
            None => (&self.root_folders, &self.root_files),
            Some(path) => match self.folders.get(path) {
                Some(folder) => (&folder.subfolders, &folder.files),
                None => return Vec::new(),
            },
        };

        let mut folders: Vec<FolderView> = folder_keys
            .iter()
            .filter_map(|key| self.folder_view(key))
            .collect();
        folders.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| natural_cmp(&a.label, &b.label))
        });

        let mut files: Vec<StagedFile> = file_uris
            .iter()
            .filter_map(|u| self.files.get(u))
            .cloned()
            .collect();
        files.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| natural_cmp(&a.label, &b.label))
        });

        folders
            .into_iter()
            .map(StackItem::Folder)
            .chain(files.into_iter().map(StackItem::File))
            .collect()
    }

    pub fn folder_view(&self, path: &str) -> Option<FolderView> {
        self.folders.get(path).map(|folder| FolderView {
            id: format!("folder:{path}"),
            label: folder.label.clone(),
            path: path.to_string(),
            token_count: folder.token_count,
            file_count: folder.contained.len(),
            pinned: folder.pinned,
        })
    }

    pub fn contained_files(&self, path: &str) -> Vec<StagedFile> {
        self.folders
            .get(path)
            .map(|folder| {
                folder
                    .contained
                    .iter()
                    .filter_map(|u| self.files.get(u))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[cfg(test)]
    fn check_aggregation_invariant(&self) {
        for (key, folder) in &self.folders {
            let direct: usize = folder
                .files
                .iter()
                .map(|u| self.files.get(u).map(|f| f.token_count()).unwrap_or(0))
                .sum();
            let from_subs: usize = folder
                .subfolders
                .iter()
                .map(|s| self.folders.get(s).map(|f| f.token_count).unwrap_or(0))
                .sum();
            assert_eq!(
                folder.token_count,
                direct + from_subs,
                "aggregation mismatch at {key}"
            );
            assert!(
                !folder.files.is_empty() || !folder.subfolders.is_empty(),
                "empty folder {key} was not pruned"
            );
            let contained_total: usize = folder.files.len()
                + folder
                    .subfolders
                    .iter()
                    .map(|s| self.folders.get(s).map(|f| f.contained.len()).unwrap_or(0))
                    .sum::<usize>();
            assert_eq!(folder.contained.len(), contained_total, "contained mismatch at {key}");
        }
    }
}

// Case-insensitive comparison with numeric awareness: file2 < file10.
fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ai = a.chars().peekable();
    let mut bi = b.chars().peekable();

    loop {
        match (ai.peek().copied(), bi.peek().copied()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let na = take_digits(&mut ai);
                let nb = take_digits(&mut bi);
                let ta = na.trim_start_matches('0');
                let tb = nb.trim_start_matches('0');
                let ord = ta
                    .len()
                    .cmp(&tb.len())
                    .then_with(|| ta.cmp(tb))
                    // Same numeric value: the run with leading zeros sorts after.
                    .then_with(|| na.len().cmp(&nb.len()));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                let xl = x.to_ascii_lowercase();
                let yl = y.to_ascii_lowercase();
                if xl != yl {
                    return xl.cmp(&yl);
                }
                ai.next();
                bi.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut out = String::new();
    while let Some(c) = chars.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        out.push(*c);
        chars.next();
    }
    out
}
