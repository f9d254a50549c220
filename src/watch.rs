use crate::events::Subscription;
use crate::model::Uri;
use crate::store::{StoreEvent, TrackStore};
use anyhow::Result;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const BATCH_WINDOW: Duration = Duration::from_millis(200);

// Entry ceiling when scanning a freshly created directory for moved files.
const DIR_SCAN_BUDGET: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Rename { from: Uri, to: Uri },
    Remove(Uri),
}

// A tracked deletion with a same-basename creation in the window is a
// rename; each creation is consumed by at most one deletion. Untracked
// deletions are ignored.
pub fn correlate(
    deleted: Vec<Uri>,
    created: Vec<Uri>,
    is_tracked: impl Fn(&Uri) -> bool,
) -> Vec<SyncAction> {
    let mut by_basename: HashMap<String, Vec<Uri>> = HashMap::new();
    for uri in created {
        by_basename
            .entry(uri.basename().to_string())
            .or_default()
            .push(uri);
    }

    let mut actions = Vec::new();
    for from in deleted {
        if !is_tracked(&from) {
            continue;
        }
        let candidate = by_basename
            .get_mut(from.basename())
            .filter(|c| !c.is_empty())
            .map(|c| c.remove(0));
        match candidate {
            Some(to) => actions.push(SyncAction::Rename { from, to }),
            None => actions.push(SyncAction::Remove(from)),
        }
    }
    actions
}

// Workspace roots are watched recursively; parents of tracked files outside
// every root get a non-recursive watch, re-synced whenever the tracked set
// changes.
pub struct FileSyncWatcher {
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
    _store_events: Subscription<StoreEvent>,
}

impl FileSyncWatcher {
    pub fn start(store: Arc<TrackStore>, roots: &[PathBuf], window: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                let _ = tx.send(result);
            },
            notify::Config::default(),
        )?;
        for root in roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
            debug!(root = %root.display(), "watching workspace root");
        }

        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        let _store_events = store.events.subscribe(move |event| {
            if matches!(
                event,
                StoreEvent::Initialized | StoreEvent::TracksChanged | StoreEvent::FilesChanged
            ) {
                let _ = resync_tx.send(());
            }
        });

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            watcher,
            store,
            roots.to_vec(),
            rx,
            resync_rx,
            window,
            shutdown.clone(),
        ));

        Ok(Self {
            shutdown,
            task,
            _store_events,
        })
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

#[derive(Default)]
struct EventBuffer {
    created: Vec<Uri>,
    deleted: Vec<Uri>,
}

impl EventBuffer {
    fn note_created(&mut self, uri: Uri) {
        // Delete-then-create of the same path within a window nets out.
        if let Some(pos) = self.deleted.iter().position(|u| u == &uri) {
            self.deleted.remove(pos);
            return;
        }
        if !self.created.contains(&uri) {
            self.created.push(uri);
        }
    }

    fn note_deleted(&mut self, uri: Uri) {
        if let Some(pos) = self.created.iter().position(|u| u == &uri) {
            self.created.remove(pos);
        }
        if !self.deleted.contains(&uri) {
            self.deleted.push(uri);
        }
    }

    fn absorb(&mut self, event: Event) {
        match event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.note_created(Uri::from_path(path));
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.note_deleted(Uri::from_path(path));
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::From => {
                    for path in &event.paths {
                        self.note_deleted(Uri::from_path(path));
                    }
                }
                RenameMode::To => {
                    for path in &event.paths {
                        self.note_created(Uri::from_path(path));
                    }
                }
                RenameMode::Both if event.paths.len() == 2 => {
                    self.note_deleted(Uri::from_path(&event.paths[0]));
                    self.note_created(Uri::from_path(&event.paths[1]));
                }
                _ => {
                    // Platform gave us a rename without direction; classify
                    // each path by whether it still exists.
                    for path in &event.paths {
                        if path.exists() {
                            self.note_created(Uri::from_path(path));
                        } else {
                            self.note_deleted(Uri::from_path(path));
                        }
                    }
                }
            },
            _ => {}
        }
    }

    fn is_empty(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty()
    }
}

async fn run_loop(
    mut watcher: RecommendedWatcher,
    store: Arc<TrackStore>,
    roots: Vec<PathBuf>,
    mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    mut resync_rx: mpsc::UnboundedReceiver<()>,
    window: Duration,
    shutdown: CancellationToken,
) {
    let mut extra_watches = HashSet::new();
    sync_extra_watches(&mut watcher, &roots, &store, &mut extra_watches);

    loop {
        let first = tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = resync_rx.recv() => {
                while resync_rx.try_recv().is_ok() {}
                sync_extra_watches(&mut watcher, &roots, &store, &mut extra_watches);
                continue;
            }
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        let mut buffer = EventBuffer::default();
        absorb_result(&mut buffer, first);

        // Collect the rest of the burst until the window closes.
        let flush_at = tokio::time::sleep(window);
        tokio::pin!(flush_at);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = &mut flush_at => break,
                event = rx.recv() => match event {
                    Some(event) => absorb_result(&mut buffer, event),
                    None => break,
                },
            }
        }

        if !buffer.is_empty() {
            flush(&store, buffer);
        }
    }
}

// Non-recursive watches on the parent directories of tracked files that no
// workspace root covers; without these an out-of-root delete goes unseen.
fn sync_extra_watches(
    watcher: &mut RecommendedWatcher,
    roots: &[PathBuf],
    store: &Arc<TrackStore>,
    extra: &mut HashSet<PathBuf>,
) {
    let mut wanted = HashSet::new();
    for uri in store.tracked_uris() {
        let path = uri.to_path();
        if roots.iter().any(|root| path.starts_with(root)) {
            continue;
        }
        if let Some(parent) = path.parent() {
            wanted.insert(parent.to_path_buf());
        }
    }

    for stale in extra.difference(&wanted) {
        let _ = watcher.unwatch(stale);
    }
    for fresh in wanted.difference(&*extra) {
        if let Err(e) = watcher.watch(fresh, RecursiveMode::NonRecursive) {
            debug!(dir = %fresh.display(), error = %e, "cannot watch out-of-root parent");
        }
    }
    *extra = wanted;
}

fn absorb_result(buffer: &mut EventBuffer, result: notify::Result<Event>) {
    match result {
        Ok(event) => buffer.absorb(event),
        Err(e) => warn!(error = %e, "file watcher error"),
    }
}

fn flush(store: &Arc<TrackStore>, buffer: EventBuffer) {
    let mut created = Vec::new();
    let mut seen = HashSet::new();
    for uri in buffer.created {
        let path = uri.to_path();
        if path.is_file() {
            if seen.insert(uri.clone()) {
                created.push(uri);
            }
        } else if path.is_dir() {
            // A move into a brand-new directory often surfaces as only the
            // directory creation: the destination watch is not registered in
            // time to report the file landing inside. Pick up its contents as
            // rename candidates.
            let mut budget = DIR_SCAN_BUDGET;
            collect_files(&path, &mut created, &mut seen, &mut budget);
        }
    }

    let actions = correlate(buffer.deleted, created, |uri| store.has_uri(uri));
    for action in actions {
        match action {
            SyncAction::Rename { from, to } => {
                debug!(from = %from, to = %to, "correlated rename");
                store.replace_uri(&from, &to);
            }
            SyncAction::Remove(uri) => {
                debug!(uri = %uri, "tracked file deleted externally");
                store.remove_uri_everywhere(&uri);
            }
        }
    }
}

fn collect_files(dir: &Path, out: &mut Vec<Uri>, seen: &mut HashSet<Uri>, budget: &mut usize) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if *budget == 0 {
            return;
        }
        *budget -= 1;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out, seen, budget);
        } else if path.is_file() {
            let uri = Uri::from_path(&path);
            if seen.insert(uri.clone()) {
                out.push(uri);
            }
        }
    }
}
