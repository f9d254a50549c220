use crate::model::{PathSegments, Uri};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct WorkspaceRoot {
    pub name: String,
    pub path: PathBuf,
}

// Maps a URI to its containing project root. The host supplies this;
// StaticWorkspace is the plain fixed-root implementation.
pub trait WorkspaceResolver: Send + Sync {
    fn roots(&self) -> &[WorkspaceRoot];

    fn root_for(&self, uri: &Uri) -> Option<&WorkspaceRoot> {
        let path = uri.to_path();
        // Longest prefix wins so nested roots resolve to the inner one.
        self.roots()
            .iter()
            .filter(|root| path.starts_with(&root.path))
            .max_by_key(|root| root.path.as_os_str().len())
    }
}

pub struct StaticWorkspace {
    roots: Vec<WorkspaceRoot>,
}

impl StaticWorkspace {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        let roots = paths
            .into_iter()
            .map(|path| {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.to_string_lossy().into_owned());
                WorkspaceRoot { name, path }
            })
            .collect();
        Self { roots }
    }
}

impl WorkspaceResolver for StaticWorkspace {
    fn roots(&self) -> &[WorkspaceRoot] {
        &self.roots
    }
}

// With multiple roots the root name is prefixed so same-named subpaths under
// different roots stay distinct. A file outside every root, or directly
// under its root, yields a single segment.
pub fn relative_segments(workspace: &dyn WorkspaceResolver, uri: &Uri) -> PathSegments {
    let mut segments = PathSegments::new();

    let Some(root) = workspace.root_for(uri) else {
        segments.push(uri.basename().to_string());
        return segments;
    };

    if workspace.roots().len() > 1 {
        segments.push(root.name.clone());
    }

    let root_uri = Uri::from_path(&root.path);
    let relative = uri
        .as_str()
        .strip_prefix(root_uri.as_str())
        .map(|r| r.trim_start_matches('/'))
        .unwrap_or_else(|| uri.basename());

    segments.extend(relative.split('/').filter(|s| !s.is_empty()).map(String::from));

    if segments.is_empty() {
        segments.push(uri.basename().to_string());
    }

    segments
}
