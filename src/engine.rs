use crate::hydrate::hydrate;
use crate::model::{StagedFile, Uri};
use crate::persist::{FsStorage, PersistenceService, SAVE_DEBOUNCE, StateStorage};
use crate::stats::StatsEngine;
use crate::store::TrackStore;
use crate::tree::{StackItem, TreeProjector};
use crate::watch::{BATCH_WINDOW, FileSyncWatcher};
use crate::workspace::{StaticWorkspace, WorkspaceResolver};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Holds both the state blob and the stats cache.
    pub storage_dir: PathBuf,
    pub workspace_roots: Vec<PathBuf>,
    pub save_debounce: Duration,
    pub watch_window: Duration,
    pub watch_files: bool,
}

impl EngineConfig {
    pub fn new(storage_dir: PathBuf, workspace_roots: Vec<PathBuf>) -> Self {
        Self {
            storage_dir,
            workspace_roots,
            save_debounce: SAVE_DEBOUNCE,
            watch_window: BATCH_WINDOW,
            watch_files: true,
        }
    }
}

// Composition root. Owns every component; nothing in the crate reaches for
// a global.
pub struct ContextStackEngine {
    store: Arc<TrackStore>,
    persistence: Arc<PersistenceService>,
    tree: tokio::sync::Mutex<TreeProjector>,
    stats: StatsEngine,
    enrich_token: std::sync::Mutex<CancellationToken>,
    watcher: std::sync::Mutex<Option<FileSyncWatcher>>,
}

impl ContextStackEngine {
    pub async fn start(config: EngineConfig) -> Result<Self> {
        let workspace: Arc<dyn WorkspaceResolver> =
            Arc::new(StaticWorkspace::new(config.workspace_roots.clone()));
        let storage: Arc<dyn StateStorage> =
            Arc::new(FsStorage::new(config.storage_dir.clone()));
        let persistence = Arc::new(PersistenceService::new(
            Arc::clone(&storage),
            config.save_debounce,
        ));
        let store = Arc::new(TrackStore::new(Arc::clone(&persistence)));

        let hydrated = hydrate(&storage, &workspace).await;
        let restored = hydrated.is_some();
        store.initialize(hydrated);
        info!(
            restored,
            tracks = store.all_tracks().len(),
            "context stack engine started"
        );

        let mut projector = TreeProjector::new(Arc::clone(&workspace));
        projector.build(store.get_files()).await;

        let stats = StatsEngine::new(config.storage_dir.join("stats-cache.bin")).await;

        let watcher = if config.watch_files && !config.workspace_roots.is_empty() {
            Some(FileSyncWatcher::start(
                Arc::clone(&store),
                &config.workspace_roots,
                config.watch_window,
            )?)
        } else {
            None
        };

        Ok(Self {
            store,
            persistence,
            tree: tokio::sync::Mutex::new(projector),
            stats,
            enrich_token: std::sync::Mutex::new(CancellationToken::new()),
            watcher: std::sync::Mutex::new(watcher),
        })
    }

    // Flushes the pending save so shutdown never loses a debounced write.
    pub async fn shutdown(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(watcher) = watcher {
            watcher.shutdown().await;
        }
        self.rotate_enrich_token();
        self.persistence.flush();
    }

    pub fn store(&self) -> &Arc<TrackStore> {
        &self.store
    }

    pub fn persistence(&self) -> &Arc<PersistenceService> {
        &self.persistence
    }

    pub fn stats(&self) -> &StatsEngine {
        &self.stats
    }

    // --- staging -----------------------------------------------------------

    // Returns the URIs that were genuinely new.
    pub async fn add_files(&self, uris: Vec<Uri>) -> Vec<Uri> {
        let added = self.store.add_files_to_active(uris);
        if added.is_empty() {
            return added;
        }
        let staged = added.iter().cloned().map(StagedFile::new).collect();
        self.tree.lock().await.patch(staged, &[]);
        self.enrich_and_apply(added.clone()).await;
        added
    }

    pub async fn remove_files(&self, uris: &[Uri]) {
        self.store.remove_files_from_active(uris);
        self.tree.lock().await.patch(Vec::new(), uris);
    }

    pub async fn clear_active(&self) {
        let cleared: Vec<Uri> = self
            .store
            .get_files()
            .into_iter()
            .filter(|f| !f.pinned)
            .map(|f| f.uri)
            .collect();
        self.store.clear_active();
        if !cleared.is_empty() {
            self.tree.lock().await.patch(Vec::new(), &cleared);
        }
    }

    pub async fn toggle_pin(&self, uris: &[Uri]) {
        self.store.toggle_pin(uris);
        self.tree.lock().await.update_files(&self.store.get_files());
    }

    // --- tracks ------------------------------------------------------------

    pub async fn create_track(&self, name: &str) -> String {
        let id = self.store.create_track(name);
        self.on_active_changed().await;
        id
    }

    pub fn rename_track(&self, id: &str, name: &str) -> bool {
        self.store.rename_track(id, name)
    }

    pub async fn delete_track(&self, id: &str) -> bool {
        let deleted = self.store.delete_track(id);
        if deleted {
            self.on_active_changed().await;
        }
        deleted
    }

    pub async fn switch_to_track(&self, id: &str) -> bool {
        let switched = self.store.switch_to_track(id);
        if switched {
            self.on_active_changed().await;
        }
        switched
    }

    pub fn reorder_tracks(&self, source_id: &str, target_id: Option<&str>) -> bool {
        self.store.reorder_tracks(source_id, target_id)
    }

    // --- tree --------------------------------------------------------------

    pub async fn tree_children(&self, parent: Option<&str>) -> Vec<StackItem> {
        self.tree.lock().await.get_children(parent)
    }

    pub async fn folder_files(&self, folder_path: &str) -> Vec<crate::model::StagedFile> {
        self.tree.lock().await.contained_files(folder_path)
    }

    // --- stats -------------------------------------------------------------

    pub async fn refresh_stats(&self) {
        let uris: Vec<Uri> = self
            .store
            .active_track()
            .files
            .into_iter()
            .map(|f| f.uri)
            .collect();
        self.enrich_and_apply(uris).await;
    }

    async fn enrich_and_apply(&self, uris: Vec<Uri>) {
        if uris.is_empty() {
            return;
        }
        let token = self.rotate_enrich_token();
        let enriched = self.stats.enrich(uris, &token).await;
        if enriched.is_empty() {
            return;
        }
        let results: Vec<_> = enriched
            .into_iter()
            .map(|e| (e.uri, Some(e.stats), Some(e.binary)))
            .collect();
        self.store.apply_stats(&results);
        self.tree.lock().await.update_files(&self.store.get_files());
    }

    // A new batch abandons whatever the previous one was doing.
    fn rotate_enrich_token(&self) -> CancellationToken {
        let mut guard = self.enrich_token.lock().unwrap_or_else(|p| p.into_inner());
        guard.cancel();
        *guard = CancellationToken::new();
        guard.clone()
    }

    async fn on_active_changed(&self) {
        self.sync_tree_from_store().await;
        self.refresh_stats().await;
    }

    async fn sync_tree_from_store(&self) {
        self.tree.lock().await.build(self.store.get_files()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DEFAULT_TRACK_NAME;

    fn config(storage: &tempfile::TempDir, workspace: &tempfile::TempDir) -> EngineConfig {
        let mut cfg = EngineConfig::new(
            storage.path().to_path_buf(),
            vec![workspace.path().to_path_buf()],
        );
        cfg.save_debounce = Duration::from_millis(1);
        cfg.watch_files = false;
        cfg
    }

    #[tokio::test]
    async fn empty_storage_starts_with_one_default_track() {
        let storage = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let engine = ContextStackEngine::start(config(&storage, &workspace))
            .await
            .unwrap();

        let tracks = engine.store().all_tracks();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].name, DEFAULT_TRACK_NAME);
        assert_eq!(engine.store().active_track_id(), tracks[0].id);
        assert!(engine.tree_children(None).await.is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn add_files_projects_the_tree_and_fills_stats() {
        let storage = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(workspace.path().join("src")).unwrap();
        std::fs::write(workspace.path().join("src/lib.rs"), "pub fn f() {}").unwrap();
        std::fs::write(workspace.path().join("README.md"), "# readme").unwrap();

        let engine = ContextStackEngine::start(config(&storage, &workspace))
            .await
            .unwrap();
        let added = engine
            .add_files(vec![
                Uri::from_path(&workspace.path().join("src/lib.rs")),
                Uri::from_path(&workspace.path().join("README.md")),
            ])
            .await;
        assert_eq!(added.len(), 2);

        // One folder ("src") and one root-level file.
        let roots = engine.tree_children(None).await;
        assert_eq!(roots.len(), 2);

        let files = engine.store().get_files();
        assert!(files.iter().all(|f| f.stats.is_some()));
        assert!(files.iter().all(|f| f.binary == Some(false)));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn add_remove_and_clear_keep_the_tree_in_step() {
        let storage = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(workspace.path().join("src")).unwrap();
        std::fs::write(workspace.path().join("src/a.rs"), "struct A;").unwrap();
        std::fs::write(workspace.path().join("src/b.rs"), "struct B;").unwrap();
        let a = Uri::from_path(&workspace.path().join("src/a.rs"));
        let b = Uri::from_path(&workspace.path().join("src/b.rs"));

        let engine = ContextStackEngine::start(config(&storage, &workspace))
            .await
            .unwrap();
        engine.add_files(vec![a.clone(), b.clone()]).await;

        let roots = engine.tree_children(None).await;
        assert_eq!(roots.len(), 1);

        engine.remove_files(std::slice::from_ref(&a)).await;
        assert_eq!(engine.folder_files("src").await.len(), 1);

        engine.clear_active().await;
        assert!(engine.tree_children(None).await.is_empty(), "empty folder pruned");
        assert!(engine.store().get_files().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn switching_tracks_retargets_the_tree() {
        let storage = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        std::fs::write(workspace.path().join("a.rs"), "x").unwrap();

        let engine = ContextStackEngine::start(config(&storage, &workspace))
            .await
            .unwrap();
        let first = engine.store().active_track_id();
        engine
            .add_files(vec![Uri::from_path(&workspace.path().join("a.rs"))])
            .await;

        engine.create_track("scratch").await;
        assert!(engine.tree_children(None).await.is_empty());

        assert!(engine.switch_to_track(&first).await);
        assert_eq!(engine.tree_children(None).await.len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn state_survives_an_engine_restart() {
        let storage = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        std::fs::write(workspace.path().join("keep.rs"), "pub struct K;").unwrap();
        let uri = Uri::from_path(&workspace.path().join("keep.rs"));

        {
            let engine = ContextStackEngine::start(config(&storage, &workspace))
                .await
                .unwrap();
            engine.add_files(vec![uri.clone()]).await;
            engine.store().toggle_pin(std::slice::from_ref(&uri));
            engine.shutdown().await;
        }

        let engine = ContextStackEngine::start(config(&storage, &workspace))
            .await
            .unwrap();
        let files = engine.store().get_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].uri, uri);
        assert!(files[0].pinned);
        engine.shutdown().await;
    }
}
