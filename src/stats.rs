mod cache;
mod read;

pub use cache::{CacheEntry, StatsCache};

use crate::events::EventHub;
use crate::model::{FileStats, Uri};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// Content larger than this is never decoded; the byte heuristic is close
// enough and keeps huge files out of the hot path.
const LARGE_FILE_THRESHOLD: u64 = 1024 * 1024;
const BINARY_SNIFF_BYTES: usize = 512;
// Rough chars-per-token ratio for code and prose.
const CHARS_PER_TOKEN: usize = 4;

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "ico", "bmp", "pdf", "zip", "gz", "tar", "7z", "exe",
    "dll", "so", "dylib", "a", "jar", "class", "woff", "woff2", "ttf", "eot", "mp3", "mp4", "avi",
    "mov", "wasm", "bin", "sqlite",
];

const TEXT_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "json", "md", "txt", "toml", "yaml", "yml", "html", "css",
    "py", "go", "java", "c", "h", "cpp", "hpp", "sh", "sql", "xml", "csv",
];

#[derive(Debug, Clone)]
pub struct EnrichedFile {
    pub uri: Uri,
    pub stats: FileStats,
    pub binary: bool,
}

#[derive(Debug, Clone)]
pub enum StatsEvent {
    // A chunk of the current batch finished; folder totals can re-aggregate
    // without waiting for the whole batch.
    ChunkReady(Vec<EnrichedFile>),
    BatchFinished { enriched: usize },
}

pub struct StatsEngine {
    cache: Arc<tokio::sync::Mutex<StatsCache>>,
    cache_path: PathBuf,
    concurrency: usize,
    pub events: EventHub<StatsEvent>,
}

impl StatsEngine {
    pub async fn new(cache_path: PathBuf) -> Self {
        let cache = StatsCache::load(&cache_path).await;
        Self {
            cache: Arc::new(tokio::sync::Mutex::new(cache)),
            cache_path,
            concurrency: num_cpus::get().clamp(2, 20),
            events: EventHub::new(),
        }
    }

    // The token is checked between chunks so a batch can be abandoned
    // promptly on track switch. Unreadable files get zeroed stats; a partial
    // failure never aborts the batch.
    pub async fn enrich(&self, uris: Vec<Uri>, token: &CancellationToken) -> Vec<EnrichedFile> {
        let mut results = Vec::with_capacity(uris.len());
        let total = uris.len();

        for chunk in uris.chunks(self.concurrency) {
            if token.is_cancelled() {
                debug!(done = results.len(), total, "stats enrichment cancelled");
                break;
            }

            let mut set = JoinSet::new();
            for uri in chunk {
                let uri = uri.clone();
                let cache = Arc::clone(&self.cache);
                set.spawn(async move { analyze(uri, cache).await });
            }

            let mut chunk_results = Vec::with_capacity(chunk.len());
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(enriched) => chunk_results.push(enriched),
                    Err(e) => warn!(error = %e, "stats task panicked"),
                }
            }

            self.events.emit(&StatsEvent::ChunkReady(chunk_results.clone()));
            results.extend(chunk_results);
            tokio::task::yield_now().await;
        }

        if let Err(e) = self.cache.lock().await.save(&self.cache_path).await {
            warn!(error = %e, "failed to persist stats cache");
        }
        self.events.emit(&StatsEvent::BatchFinished {
            enriched: results.len(),
        });
        results
    }
}

async fn analyze(uri: Uri, cache: Arc<tokio::sync::Mutex<StatsCache>>) -> EnrichedFile {
    let path = uri.to_path();

    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta,
        Err(e) => {
            debug!(uri = %uri, error = %e, "stat failed, zeroing stats");
            return zeroed(uri);
        }
    };
    let size = meta.len();
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let hit = cache.lock().await.lookup(uri.as_str(), mtime, size).cloned();
    if let Some(hit) = hit {
        return EnrichedFile {
            uri,
            stats: hit.stats,
            binary: hit.binary,
        };
    }

    let enriched = match compute(&uri, size).await {
        Ok(enriched) => enriched,
        Err(e) => {
            debug!(uri = %uri, error = %e, "read failed, zeroing stats");
            return zeroed(uri);
        }
    };

    cache.lock().await.insert(
        enriched.uri.as_str().to_string(),
        CacheEntry {
            mtime,
            size,
            stats: enriched.stats,
            binary: enriched.binary,
        },
    );
    enriched
}

async fn compute(uri: &Uri, size: u64) -> anyhow::Result<EnrichedFile> {
    let path = uri.to_path();

    if extension_of(uri).is_some_and(|ext| BINARY_EXTENSIONS.contains(&ext.as_str())) {
        return Ok(binary_file(uri.clone()));
    }

    if size > LARGE_FILE_THRESHOLD {
        // Sniff the head only; estimate tokens from the byte size.
        let head = read::read_head(&path, BINARY_SNIFF_BYTES).await?;
        if has_nul(&head) {
            return Ok(binary_file(uri.clone()));
        }
        return Ok(EnrichedFile {
            uri: uri.clone(),
            stats: FileStats {
                token_count: (size as usize).div_ceil(CHARS_PER_TOKEN),
                char_count: size as usize,
            },
            binary: false,
        });
    }

    let content = read::read_content(&path, size).await?;
    let known_text = extension_of(uri).is_some_and(|ext| TEXT_EXTENSIONS.contains(&ext.as_str()));
    if !known_text && has_nul(&content[..content.len().min(BINARY_SNIFF_BYTES)]) {
        return Ok(binary_file(uri.clone()));
    }

    let decoded = String::from_utf8_lossy(&content);
    let char_count = decoded.chars().count();
    Ok(EnrichedFile {
        uri: uri.clone(),
        stats: FileStats {
            token_count: char_count.div_ceil(CHARS_PER_TOKEN),
            char_count,
        },
        binary: false,
    })
}

fn has_nul(head: &[u8]) -> bool {
    memchr::memchr(0, head).is_some()
}

fn extension_of(uri: &Uri) -> Option<String> {
    uri.basename()
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

fn zeroed(uri: Uri) -> EnrichedFile {
    EnrichedFile {
        uri,
        stats: FileStats::default(),
        binary: false,
    }
}

fn binary_file(uri: Uri) -> EnrichedFile {
    EnrichedFile {
        uri,
        stats: FileStats::default(),
        binary: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine(dir: &std::path::Path) -> StatsEngine {
        StatsEngine::new(dir.join("stats-cache.bin")).await
    }

    fn uri_for(path: &std::path::Path) -> Uri {
        Uri::from_path(path)
    }

    #[tokio::test]
    async fn estimates_tokens_from_decoded_chars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        tokio::fs::write(&path, "fn main() {}\n").await.unwrap(); // 13 chars

        let engine = engine(dir.path()).await;
        let results = engine
            .enrich(vec![uri_for(&path)], &CancellationToken::new())
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].stats.char_count, 13);
        assert_eq!(results[0].stats.token_count, 4); // ceil(13 / 4)
        assert!(!results[0].binary);
    }

    #[tokio::test]
    async fn nul_byte_marks_binary_with_zeroed_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.dat");
        tokio::fs::write(&path, b"ab\x00cd").await.unwrap();

        let engine = engine(dir.path()).await;
        let results = engine
            .enrich(vec![uri_for(&path)], &CancellationToken::new())
            .await;

        assert!(results[0].binary);
        assert_eq!(results[0].stats, FileStats::default());
    }

    #[tokio::test]
    async fn known_binary_extension_shortcuts_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logo.png");
        // Plain text content; the extension deny list decides anyway.
        tokio::fs::write(&path, "not really an image").await.unwrap();

        let engine = engine(dir.path()).await;
        let results = engine
            .enrich(vec![uri_for(&path)], &CancellationToken::new())
            .await;
        assert!(results[0].binary);
    }

    #[tokio::test]
    async fn large_files_use_the_byte_heuristic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.log");
        let size = (LARGE_FILE_THRESHOLD as usize) + 3;
        tokio::fs::write(&path, "x".repeat(size)).await.unwrap();

        let engine = engine(dir.path()).await;
        let results = engine
            .enrich(vec![uri_for(&path)], &CancellationToken::new())
            .await;

        assert_eq!(results[0].stats.char_count, size);
        assert_eq!(results[0].stats.token_count, size.div_ceil(CHARS_PER_TOKEN));
    }

    #[tokio::test]
    async fn unreadable_file_gets_zeroed_stats_without_aborting_batch() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("live.rs");
        tokio::fs::write(&live, "pub fn ok() {}").await.unwrap();
        let missing = dir.path().join("missing.rs");

        let engine = engine(dir.path()).await;
        let results = engine
            .enrich(
                vec![uri_for(&missing), uri_for(&live)],
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(results.len(), 2);
        let missing_result = results
            .iter()
            .find(|r| r.uri == uri_for(&missing))
            .unwrap();
        assert_eq!(missing_result.stats, FileStats::default());
        let live_result = results.iter().find(|r| r.uri == uri_for(&live)).unwrap();
        assert!(live_result.stats.token_count > 0);
    }

    #[tokio::test]
    async fn unchanged_file_is_served_from_cache_without_rereading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        tokio::fs::write(&path, "fn main() {}").await.unwrap();
        let meta = tokio::fs::metadata(&path).await.unwrap();
        let mtime = meta
            .modified()
            .unwrap()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();

        let engine = engine(dir.path()).await;
        // Seed a sentinel entry for the file's exact (mtime, size). If the
        // engine read content it would compute something else entirely.
        engine.cache.lock().await.insert(
            uri_for(&path).as_str().to_string(),
            CacheEntry {
                mtime,
                size: meta.len(),
                stats: FileStats {
                    token_count: 777,
                    char_count: 3108,
                },
                binary: false,
            },
        );

        let results = engine
            .enrich(vec![uri_for(&path)], &CancellationToken::new())
            .await;
        assert_eq!(results[0].stats.token_count, 777, "must be a cache hit");

        // Changing the size invalidates the entry and forces a re-read.
        tokio::fs::write(&path, "fn main() {} // changed")
            .await
            .unwrap();
        let results = engine
            .enrich(vec![uri_for(&path)], &CancellationToken::new())
            .await;
        assert_ne!(results[0].stats.token_count, 777);
    }

    #[tokio::test]
    async fn cancelled_token_abandons_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        tokio::fs::write(&path, "fn main() {}").await.unwrap();

        let engine = engine(dir.path()).await;
        let token = CancellationToken::new();
        token.cancel();

        let results = engine.enrich(vec![uri_for(&path)], &token).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn chunk_events_fire_before_batch_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        tokio::fs::write(&path, "fn main() {}").await.unwrap();

        let engine = engine(dir.path()).await;
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let _sub = {
            let order = order.clone();
            engine.events.subscribe(move |e| {
                order.lock().unwrap().push(match e {
                    StatsEvent::ChunkReady(files) => format!("chunk:{}", files.len()),
                    StatsEvent::BatchFinished { enriched } => format!("done:{enriched}"),
                });
            })
        };

        engine
            .enrich(vec![uri_for(&path)], &CancellationToken::new())
            .await;
        assert_eq!(*order.lock().unwrap(), vec!["chunk:1", "done:1"]);
    }
}
