use ctxstack::{ContextStackEngine, EngineConfig, StackItem, Uri};
use std::path::Path;
use std::time::Duration;

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

fn test_config(storage: &tempfile::TempDir, workspace: &tempfile::TempDir) -> EngineConfig {
    let mut cfg = EngineConfig::new(
        storage.path().to_path_buf(),
        vec![workspace.path().to_path_buf()],
    );
    cfg.save_debounce = Duration::from_millis(1);
    cfg.watch_window = Duration::from_millis(50);
    cfg.watch_files = false;
    cfg
}

#[tokio::test]
async fn fresh_start_stage_project_and_persist() {
    let storage = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    write_file(&workspace.path().join("src/a.ts"), "const a = 1;\n");
    write_file(
        &workspace.path().join("src/b.ts"),
        "export function b() { return 2; }\n",
    );
    write_file(&workspace.path().join("README.md"), "# project readme\n");

    let engine = ContextStackEngine::start(test_config(&storage, &workspace))
        .await
        .unwrap();

    // Empty storage hydrates into exactly one default track, already active.
    let tracks = engine.store().all_tracks();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].name, "Main");
    assert_eq!(engine.store().active_track_id(), tracks[0].id);

    let uris = vec![
        Uri::from_path(&workspace.path().join("src/a.ts")),
        Uri::from_path(&workspace.path().join("src/b.ts")),
        Uri::from_path(&workspace.path().join("README.md")),
    ];
    let added = engine.add_files(uris.clone()).await;
    assert_eq!(added.len(), 3);

    // Root level: the synthesized "src" folder plus one loose file.
    let roots = engine.tree_children(None).await;
    assert_eq!(roots.len(), 2);
    let folder = roots
        .iter()
        .find_map(|item| match item {
            StackItem::Folder(f) => Some(f.clone()),
            StackItem::File(_) => None,
        })
        .expect("src folder is projected");
    assert_eq!(folder.label, "src");
    assert_eq!(folder.file_count, 2);

    let inside = engine.tree_children(Some(&folder.path)).await;
    assert_eq!(inside.len(), 2);

    // After enrichment the folder total is the sum of its files.
    let expected: usize = engine
        .store()
        .get_files()
        .iter()
        .filter(|f| f.uri.as_str().contains("/src/"))
        .map(|f| f.stats.expect("enriched").token_count)
        .sum();
    assert!(expected > 0);
    let roots = engine.tree_children(None).await;
    let folder = roots
        .iter()
        .find_map(|item| match item {
            StackItem::Folder(f) => Some(f.clone()),
            StackItem::File(_) => None,
        })
        .unwrap();
    assert_eq!(folder.token_count, expected);

    engine.shutdown().await;

    // The state blob is versioned JSON on disk.
    let blob = std::fs::read_to_string(storage.path().join("context-stack.json")).unwrap();
    let state: serde_json::Value = serde_json::from_str(&blob).unwrap();
    assert_eq!(state["version"], 1);

    // A second engine over the same storage restores the full shape.
    let engine = ContextStackEngine::start(test_config(&storage, &workspace))
        .await
        .unwrap();
    let files = engine.store().get_files();
    assert_eq!(files.len(), 3);
    assert_eq!(engine.tree_children(None).await.len(), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn staging_the_same_file_twice_is_a_no_op() {
    let storage = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    write_file(&workspace.path().join("once.rs"), "fn main() {}\n");
    let uri = Uri::from_path(&workspace.path().join("once.rs"));

    let engine = ContextStackEngine::start(test_config(&storage, &workspace))
        .await
        .unwrap();
    assert_eq!(engine.add_files(vec![uri.clone()]).await.len(), 1);
    assert!(engine.add_files(vec![uri.clone()]).await.is_empty());

    assert_eq!(engine.store().get_files().len(), 1);
    assert_eq!(engine.tree_children(None).await.len(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn tracks_are_isolated_and_the_last_one_is_protected() {
    let storage = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    write_file(&workspace.path().join("a.rs"), "struct A;\n");
    write_file(&workspace.path().join("b.rs"), "struct B;\n");

    let engine = ContextStackEngine::start(test_config(&storage, &workspace))
        .await
        .unwrap();
    let main_id = engine.store().active_track_id();
    engine
        .add_files(vec![Uri::from_path(&workspace.path().join("a.rs"))])
        .await;

    let scratch = engine.create_track("scratch").await;
    assert_eq!(engine.store().active_track_id(), scratch);
    assert!(engine.store().get_files().is_empty());
    engine
        .add_files(vec![Uri::from_path(&workspace.path().join("b.rs"))])
        .await;

    assert!(engine.switch_to_track(&main_id).await);
    assert_eq!(engine.store().get_files().len(), 1);
    assert_eq!(engine.store().get_files()[0].label, "a.rs");

    assert!(engine.delete_track(&scratch).await);
    assert!(!engine.delete_track(&main_id).await, "last track survives");
    assert_eq!(engine.store().all_tracks().len(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn external_rename_keeps_the_staged_entry() {
    let storage = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    write_file(&workspace.path().join("lib/widget.rs"), "pub struct W;\n");
    let old = Uri::from_path(&workspace.path().join("lib/widget.rs"));

    let mut cfg = test_config(&storage, &workspace);
    cfg.watch_files = true;
    let engine = ContextStackEngine::start(cfg).await.unwrap();
    engine.add_files(vec![old.clone()]).await;
    engine.store().toggle_pin(std::slice::from_ref(&old));

    std::fs::create_dir_all(workspace.path().join("moved")).unwrap();
    std::fs::rename(
        workspace.path().join("lib/widget.rs"),
        workspace.path().join("moved/widget.rs"),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;

    let new = Uri::from_path(&workspace.path().join("moved/widget.rs"));
    assert!(!engine.store().has_uri(&old));
    assert!(engine.store().has_uri(&new));

    // Pin state rides along with the rename.
    let files = engine.store().get_files();
    assert_eq!(files.len(), 1);
    assert!(files[0].pinned);
    engine.shutdown().await;
}

#[tokio::test]
async fn clearing_keeps_pinned_files() {
    let storage = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    write_file(&workspace.path().join("pin.rs"), "fn p() {}\n");
    write_file(&workspace.path().join("drop.rs"), "fn d() {}\n");
    let pinned = Uri::from_path(&workspace.path().join("pin.rs"));

    let engine = ContextStackEngine::start(test_config(&storage, &workspace))
        .await
        .unwrap();
    engine
        .add_files(vec![
            pinned.clone(),
            Uri::from_path(&workspace.path().join("drop.rs")),
        ])
        .await;
    engine.toggle_pin(std::slice::from_ref(&pinned)).await;
    engine.clear_active().await;

    let files = engine.store().get_files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].uri, pinned);
    assert_eq!(engine.tree_children(None).await.len(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn hydration_prunes_files_deleted_while_offline() {
    let storage = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    write_file(&workspace.path().join("stays.rs"), "fn s() {}\n");
    write_file(&workspace.path().join("goes.rs"), "fn g() {}\n");

    {
        let engine = ContextStackEngine::start(test_config(&storage, &workspace))
            .await
            .unwrap();
        engine
            .add_files(vec![
                Uri::from_path(&workspace.path().join("stays.rs")),
                Uri::from_path(&workspace.path().join("goes.rs")),
            ])
            .await;
        engine.shutdown().await;
    }

    std::fs::remove_file(workspace.path().join("goes.rs")).unwrap();

    let engine = ContextStackEngine::start(test_config(&storage, &workspace))
        .await
        .unwrap();
    let files = engine.store().get_files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].label, "stays.rs");
    engine.shutdown().await;
}
