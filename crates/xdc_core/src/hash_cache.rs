//! Memoized, single-flight content digests.
//!
//! Every digest is a Base64 encoded SHA-1 of the file contents, the same format the
//! modified-asset manifest uses. Results are memoized per path and keyed by the file's
//! `(length, mtime)`; a mismatch on either forces a recomputation, so a cached digest is
//! never served for a file that changed on disk.
//!
//! Files above [`MMAP_THRESHOLD`] are hashed through a read-only memory map, smaller
//! files through a buffered sequential read. Both paths produce identical digests.
//!
//! [`HashCache::digest_async`] collapses concurrent requests for the same uncached path
//! into one computation; every waiter observes the same result.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::OnceCell;

/// Files larger than this are hashed through a memory map.
pub const MMAP_THRESHOLD: u64 = 10 * 1024 * 1024;

const STREAM_BUFFER_SIZE: usize = 256 * 1024;

/// Current schema version of the persisted snapshot.
const SNAPSHOT_VERSION: u32 = 1;

/// One memoized digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashCacheEntry {
    pub path: Utf8PathBuf,
    pub length: u64,
    /// Modification time in nanoseconds relative to the Unix epoch (UTC).
    pub mtime_utc_nanos: i64,
    pub digest: String,
}

/// Persisted form of a [`HashCache`].
///
/// ```json
/// {
///   "version": 1,
///   "entries": [
///     { "path": "...", "length": 12, "mtimeUtcNanos": 1700000000000000000, "digest": "..." }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashCacheSnapshot {
    pub version: u32,
    pub entries: Vec<HashCacheEntry>,
}

/// How file contents are read while hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    Mapped,
    Streamed,
}

type Outcome = std::result::Result<String, String>;

/// Concurrency-safe digest memo shared across the whole run.
#[derive(Debug, Default)]
pub struct HashCache {
    entries: DashMap<Utf8PathBuf, HashCacheEntry>,
    pending: DashMap<Utf8PathBuf, Arc<OnceCell<Outcome>>>,
    computations: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
struct FileStamp {
    length: u64,
    mtime_utc_nanos: i64,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Digest of `path`, computed on first use and whenever the file changed.
    pub fn digest(&self, path: &Utf8Path) -> Result<String> {
        let stamp = file_stamp(path).map_err(|e| hash_error(path, e))?;
        if let Some(digest) = self.lookup(path, stamp) {
            return Ok(digest);
        }

        self.computations.fetch_add(1, Ordering::SeqCst);
        let digest = digest_file(path).map_err(|e| hash_error(path, e))?;
        self.entries.insert(
            path.to_path_buf(),
            HashCacheEntry {
                path: path.to_path_buf(),
                length: stamp.length,
                mtime_utc_nanos: stamp.mtime_utc_nanos,
                digest: digest.clone(),
            },
        );
        Ok(digest)
    }

    /// Async variant of [`digest`](Self::digest) with single-flight deduplication.
    ///
    /// Concurrent callers for the same path share one in-flight computation, which runs
    /// on the blocking thread pool.
    pub async fn digest_async(self: &Arc<Self>, path: &Utf8Path) -> Result<String> {
        if let Ok(stamp) = file_stamp(path) {
            if let Some(digest) = self.lookup(path, stamp) {
                return Ok(digest);
            }
        }

        let cell = Arc::clone(
            &*self
                .pending
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        );

        let outcome = cell
            .get_or_init(|| {
                let this = Arc::clone(self);
                let owned = path.to_path_buf();
                async move {
                    match tokio::task::spawn_blocking(move || this.digest(&owned)).await {
                        Ok(Ok(digest)) => Ok(digest),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(e) => Err(format!("hash worker failed: {e}")),
                    }
                }
            })
            .await
            .clone();

        // Only the cell we waited on is removed; a newer one belongs to a later request.
        self.pending
            .remove_if(path, |_, current| Arc::ptr_eq(current, &cell));

        outcome.map_err(|message| Error::Hash {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Hash `paths` on a pool of `workers` threads.
    ///
    /// Files that fail to hash are logged and skipped. Returns how many succeeded.
    pub fn precompute(&self, paths: &[Utf8PathBuf], workers: usize) -> usize {
        let run = || {
            paths
                .par_iter()
                .filter(|path| match self.digest(path) {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::warn!("Precompute skipped {}: {}", path, e);
                        false
                    }
                })
                .count()
        };

        match rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build()
        {
            Ok(pool) => pool.install(run),
            Err(e) => {
                tracing::warn!("Could not build hash worker pool ({}), using global pool", e);
                run()
            }
        }
    }

    /// Number of digests actually computed (cache misses) since creation.
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget the memoized digest for `path`.
    pub fn invalidate(&self, path: &Utf8Path) {
        self.entries.remove(path);
    }

    /// Write all entries to `path` as JSON, sorted by path.
    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        let mut entries: Vec<HashCacheEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let snapshot = HashCacheSnapshot {
            version: SNAPSHOT_VERSION,
            entries,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent.as_std_path())?;
        }
        std::fs::write(path.as_std_path(), serde_json::to_vec_pretty(&snapshot)?)?;
        tracing::debug!("Saved {} hash cache entries to {}", snapshot.entries.len(), path);
        Ok(())
    }

    /// Load a snapshot written by [`save`](Self::save).
    ///
    /// Any failure (missing file, bad JSON, other schema version) is logged and yields an
    /// empty cache. Loaded entries are still validated against the live file on use.
    pub fn load(path: &Utf8Path) -> Self {
        let cache = Self::new();
        let snapshot = match read_snapshot(path) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::info!("Starting with an empty hash cache ({}): {}", path, e);
                return cache;
            }
        };

        if snapshot.version != SNAPSHOT_VERSION {
            tracing::warn!(
                "Ignoring hash cache {} with schema version {} (expected {})",
                path,
                snapshot.version,
                SNAPSHOT_VERSION
            );
            return cache;
        }

        for entry in snapshot.entries {
            cache.entries.insert(entry.path.clone(), entry);
        }
        tracing::debug!("Loaded {} hash cache entries from {}", cache.len(), path);
        cache
    }

    fn lookup(&self, path: &Utf8Path, stamp: FileStamp) -> Option<String> {
        self.entries
            .get(path)
            .filter(|e| e.length == stamp.length && e.mtime_utc_nanos == stamp.mtime_utc_nanos)
            .map(|e| e.digest.clone())
    }
}

fn read_snapshot(path: &Utf8Path) -> Result<HashCacheSnapshot> {
    let contents = std::fs::read(path.as_std_path())?;
    Ok(serde_json::from_slice(&contents)?)
}

fn file_stamp(path: &Utf8Path) -> io::Result<FileStamp> {
    let metadata = std::fs::metadata(path.as_std_path())?;
    Ok(FileStamp {
        length: metadata.len(),
        mtime_utc_nanos: system_time_nanos(metadata.modified()?),
    })
}

fn system_time_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_nanos() as i64,
        Err(before) => -(before.duration().as_nanos() as i64),
    }
}

fn hash_error(path: &Utf8Path, e: io::Error) -> Error {
    Error::Hash {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// Base64 SHA-1 of a file, choosing the read strategy by size.
pub fn digest_file(path: &Utf8Path) -> io::Result<String> {
    let length = std::fs::metadata(path.as_std_path())?.len();
    let strategy = if length > MMAP_THRESHOLD {
        ReadStrategy::Mapped
    } else {
        ReadStrategy::Streamed
    };
    digest_file_using(path, strategy)
}

/// Base64 SHA-1 of a file using a specific read strategy.
pub fn digest_file_using(path: &Utf8Path, strategy: ReadStrategy) -> io::Result<String> {
    let file = File::open(path.as_std_path())?;
    let mut hasher = Sha1::new();

    match strategy {
        ReadStrategy::Mapped if file.metadata()?.len() > 0 => {
            // SAFETY: the map is read-only and dropped before returning. Files are not
            // expected to be truncated while being hashed; if one is, the memo is keyed
            // on (length, mtime) and the next lookup recomputes.
            let map = unsafe { memmap2::Mmap::map(&file)? };
            hasher.update(&map[..]);
        }
        _ => {
            let mut reader = BufReader::with_capacity(STREAM_BUFFER_SIZE, file);
            let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
    }

    Ok(STANDARD.encode(hasher.finalize()))
}

/// Base64 SHA-1 of an in-memory buffer.
pub fn digest_bytes(bytes: &[u8]) -> String {
    STANDARD.encode(Sha1::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn utf8(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    #[test]
    fn test_known_digest() {
        // SHA-1("abc") = a9993e364706816aba3e25717850c26c9cd0d89d
        assert_eq!(digest_bytes(b"abc"), "qZk+NkcGgWq6PiVxeFDCbJzQ2J0=");
    }

    #[test]
    fn test_digest_is_memoized_while_unchanged() {
        let temp = TempDir::new().unwrap();
        let path = utf8(&temp).join("a.bin");
        std::fs::write(&path, b"contents").unwrap();

        let cache = HashCache::new();
        let first = cache.digest(&path).unwrap();
        let second = cache.digest(&path).unwrap();

        assert_eq!(first, second);
        assert_eq!(first, digest_bytes(b"contents"));
        assert_eq!(cache.computations(), 1);
    }

    #[test]
    fn test_length_change_forces_recompute() {
        let temp = TempDir::new().unwrap();
        let path = utf8(&temp).join("a.bin");
        std::fs::write(&path, b"one").unwrap();

        let cache = HashCache::new();
        let before = cache.digest(&path).unwrap();
        std::fs::write(&path, b"one plus more").unwrap();
        let after = cache.digest(&path).unwrap();

        assert_ne!(before, after);
        assert_eq!(after, digest_bytes(b"one plus more"));
        assert_eq!(cache.computations(), 2);
    }

    #[test]
    fn test_mtime_change_forces_recompute() {
        let temp = TempDir::new().unwrap();
        let path = utf8(&temp).join("a.bin");
        std::fs::write(&path, b"aaa").unwrap();

        let cache = HashCache::new();
        cache.digest(&path).unwrap();

        // Same length, different bytes, different mtime.
        std::fs::write(&path, b"bbb").unwrap();
        let file = File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();
        drop(file);

        assert_eq!(cache.digest(&path).unwrap(), digest_bytes(b"bbb"));
        assert_eq!(cache.computations(), 2);
    }

    #[test]
    fn test_mapped_and_streamed_agree() {
        let temp = TempDir::new().unwrap();
        let path = utf8(&temp).join("big.bin");
        let data: Vec<u8> = (0..(STREAM_BUFFER_SIZE * 3 + 17))
            .map(|i| (i % 251) as u8)
            .collect();
        std::fs::write(&path, &data).unwrap();

        let mapped = digest_file_using(&path, ReadStrategy::Mapped).unwrap();
        let streamed = digest_file_using(&path, ReadStrategy::Streamed).unwrap();

        assert_eq!(mapped, streamed);
        assert_eq!(mapped, digest_bytes(&data));
    }

    #[test]
    fn test_missing_file_is_error() {
        let temp = TempDir::new().unwrap();
        let cache = HashCache::new();
        assert!(matches!(
            cache.digest(&utf8(&temp).join("nope")),
            Err(Error::Hash { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_compute_once() {
        let temp = TempDir::new().unwrap();
        let path = utf8(&temp).join("shared.bin");
        std::fs::write(&path, vec![7u8; 4 * 1024 * 1024]).unwrap();

        let cache = Arc::new(HashCache::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let path = path.clone();
            handles.push(tokio::spawn(
                async move { cache.digest_async(&path).await },
            ));
        }

        let mut digests = Vec::new();
        for handle in handles {
            digests.push(handle.await.unwrap().unwrap());
        }

        assert!(digests.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.computations(), 1);
    }

    #[test]
    fn test_precompute_skips_failures() {
        let temp = TempDir::new().unwrap();
        let root = utf8(&temp);
        std::fs::write(root.join("a"), b"a").unwrap();
        std::fs::write(root.join("b"), b"b").unwrap();

        let cache = HashCache::new();
        let ok = cache.precompute(
            &[root.join("a"), root.join("missing"), root.join("b")],
            2,
        );

        assert_eq!(ok, 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let temp = TempDir::new().unwrap();
        let root = utf8(&temp);
        let file = root.join("a.bin");
        std::fs::write(&file, b"persist me").unwrap();

        let cache = HashCache::new();
        let digest = cache.digest(&file).unwrap();
        let snapshot = root.join("cache/hashes.json");
        cache.save(&snapshot).unwrap();

        let loaded = HashCache::load(&snapshot);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.digest(&file).unwrap(), digest);
        assert_eq!(loaded.computations(), 0);
    }

    #[test]
    fn test_corrupt_snapshot_loads_empty() {
        let temp = TempDir::new().unwrap();
        let snapshot = utf8(&temp).join("hashes.json");
        std::fs::write(&snapshot, b"{ not json").unwrap();

        assert!(HashCache::load(&snapshot).is_empty());
        assert!(HashCache::load(&utf8(&temp).join("absent.json")).is_empty());
    }
}
