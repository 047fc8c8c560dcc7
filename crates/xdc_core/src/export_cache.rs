//! Content-addressed store of extraction results.
//!
//! Extracting a source binary is by far the most expensive step of a run, so each
//! result is kept under a directory derived from the binary's digest:
//!
//! ```text
//! <output>/Cache/export/<chapter>/byhash/<shard>/<key>/
//!   Objects/           # extracted asset tree
//!   AssetOrder.txt     # extracted asset order manifest (if any)
//!   .stamp             # "pre=<digest>\npost=<digest>\n"
//! ```
//!
//! `<key>` is the digest rewritten with the URL-safe Base64 alphabet (so it is a valid
//! file name) and `<shard>` its first two characters. The stamp is written last; an
//! entry is only trusted when its stamp's `pre` digest equals the digest of the binary
//! about to be extracted. The tree contents are never re-verified.

use crate::config::CacheConfig;
use crate::error::Result;
use crate::file_linker::link_or_copy;
use crate::layout::{WorkspaceLayout, ASSET_ORDER_FILE_NAME, OBJECTS_DIR_NAME};
use camino::{Utf8Path, Utf8PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

pub const STAMP_FILE_NAME: &str = ".stamp";

/// Digests recorded when a cache entry was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpStamp {
    /// Digest of the source binary before extraction. This is the cache key.
    pub pre: String,
    /// Digest of the source binary after extraction.
    pub post: Option<String>,
}

impl DumpStamp {
    pub fn new(pre: impl Into<String>, post: impl Into<String>) -> Self {
        Self {
            pre: pre.into(),
            post: Some(post.into()),
        }
    }

    /// Parse stamp file contents.
    ///
    /// Accepts the `pre=`/`post=` format and the legacy format where the file holds a
    /// single bare digest, which is read as `pre`.
    pub fn parse(contents: &str) -> Option<Self> {
        let mut pre = None;
        let mut post = None;
        let mut legacy = None;

        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(value) = line.strip_prefix("pre=") {
                pre = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("post=") {
                post = Some(value.to_string());
            } else if legacy.is_none() {
                legacy = Some(line.to_string());
            }
        }

        let pre = pre.or(legacy).filter(|p| !p.is_empty())?;
        Some(Self { pre, post })
    }

    pub fn to_file_contents(&self) -> String {
        match &self.post {
            Some(post) => format!("pre={}\npost={}\n", self.pre, post),
            None => format!("pre={}\n", self.pre),
        }
    }

    /// Read a stamp file. Returns `Ok(None)` if it does not exist or holds no digest.
    pub fn read(path: &Utf8Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path.as_std_path()) {
            Ok(contents) => Ok(Self::parse(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, path: &Utf8Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent.as_std_path())?;
        }
        std::fs::write(path.as_std_path(), self.to_file_contents())?;
        Ok(())
    }
}

/// One `(chapter, digest)` entry found on disk.
#[derive(Debug, Clone)]
pub struct CacheEntryInfo {
    pub chapter: String,
    pub key: String,
    pub dir: Utf8PathBuf,
    pub size_bytes: u64,
    /// Stamp modification time, or the entry directory's when the stamp is missing.
    pub last_access: SystemTime,
}

/// Outcome of [`ExportCache::enforce_cap`].
#[derive(Debug, Clone, Default)]
pub struct EvictionReport {
    pub removed: Vec<Utf8PathBuf>,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
    /// Still above the cap after every entry was tried.
    pub over_cap: bool,
}

/// The on-disk export cache.
#[derive(Debug, Clone)]
pub struct ExportCache {
    root: Utf8PathBuf,
    enabled: bool,
    max_bytes: Option<u64>,
}

impl ExportCache {
    pub fn new(root: impl Into<Utf8PathBuf>, config: &CacheConfig) -> Self {
        Self {
            root: root.into(),
            enabled: config.enabled,
            max_bytes: config.max_size_bytes(),
        }
    }

    pub fn from_layout(layout: &WorkspaceLayout, config: &CacheConfig) -> Self {
        Self::new(layout.export_cache_root(), config)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Directory holding the cached extraction of the binary with `digest`.
    pub fn entry_dir(&self, chapter: &str, digest: &str) -> Utf8PathBuf {
        let key = cache_key(digest);
        let shard: String = key.chars().take(2).collect();
        self.root
            .join(chapter)
            .join("byhash")
            .join(shard)
            .join(key)
    }

    pub fn stamp_path(&self, chapter: &str, digest: &str) -> Utf8PathBuf {
        self.entry_dir(chapter, digest).join(STAMP_FILE_NAME)
    }

    /// Whether the stamp at `stamp_path` vouches for a binary with `expected_digest`.
    ///
    /// True iff caching is enabled, the expected digest is non-empty, the stamp exists
    /// and its `pre` digest equals the expected one.
    pub fn is_valid(&self, stamp_path: &Utf8Path, expected_digest: &str) -> bool {
        if !self.enabled || expected_digest.is_empty() {
            return false;
        }

        match DumpStamp::read(stamp_path) {
            Ok(Some(stamp)) => stamp.pre == expected_digest,
            Ok(None) => false,
            Err(e) => {
                tracing::debug!("Unreadable cache stamp {}: {}", stamp_path, e);
                false
            }
        }
    }

    /// Whether a valid entry exists for `(chapter, digest)`.
    pub fn contains(&self, chapter: &str, digest: &str) -> bool {
        self.is_valid(&self.stamp_path(chapter, digest), digest)
    }

    /// Mirror a cached extraction into a working slot directory.
    ///
    /// Replaces the slot's `Objects/` tree and `AssetOrder.txt`, and refreshes the stamp's
    /// modification time so eviction sees the entry as recently used.
    pub fn restore(&self, chapter: &str, digest: &str, slot_dir: &Utf8Path) -> Result<usize> {
        let entry = self.entry_dir(chapter, digest);

        let objects_dst = slot_dir.join(OBJECTS_DIR_NAME);
        if objects_dst.as_std_path().exists() {
            std::fs::remove_dir_all(objects_dst.as_std_path())?;
        }
        let objects_src = entry.join(OBJECTS_DIR_NAME);
        let files = if objects_src.as_std_path().is_dir() {
            mirror_objects_selective(&objects_src, &objects_dst, None)?
        } else {
            std::fs::create_dir_all(objects_dst.as_std_path())?;
            0
        };

        let order_src = entry.join(ASSET_ORDER_FILE_NAME);
        let order_dst = slot_dir.join(ASSET_ORDER_FILE_NAME);
        if order_src.as_std_path().is_file() {
            link_or_copy(&order_src, &order_dst)?;
        } else if order_dst.as_std_path().exists() {
            std::fs::remove_file(order_dst.as_std_path())?;
        }

        touch(&entry.join(STAMP_FILE_NAME));

        tracing::debug!(
            "Restored {} cached files for chapter={} into {}",
            files,
            chapter,
            slot_dir
        );
        Ok(files)
    }

    /// Record the extraction found in `slot_dir` under the binary's `pre` digest.
    ///
    /// Entries are immutable: if a valid entry already exists nothing is written. The
    /// stamp is written after the tree so a crash never leaves a trusted partial entry.
    pub fn store(&self, chapter: &str, pre: &str, post: &str, slot_dir: &Utf8Path) -> Result<()> {
        if !self.enabled || pre.is_empty() {
            return Ok(());
        }

        let entry = self.entry_dir(chapter, pre);
        let stamp_path = entry.join(STAMP_FILE_NAME);
        if self.is_valid(&stamp_path, pre) {
            tracing::debug!("Cache entry {} already present, not overwriting", entry);
            return Ok(());
        }

        if entry.as_std_path().exists() {
            std::fs::remove_dir_all(entry.as_std_path())?;
        }
        std::fs::create_dir_all(entry.as_std_path())?;

        let objects_src = slot_dir.join(OBJECTS_DIR_NAME);
        let files = if objects_src.as_std_path().is_dir() {
            mirror_objects_selective(&objects_src, &entry.join(OBJECTS_DIR_NAME), None)?
        } else {
            0
        };

        let order_src = slot_dir.join(ASSET_ORDER_FILE_NAME);
        if order_src.as_std_path().is_file() {
            link_or_copy(&order_src, &entry.join(ASSET_ORDER_FILE_NAME))?;
        }

        DumpStamp::new(pre, post).write(&stamp_path)?;

        tracing::info!(
            "Cached {} extracted files for chapter={} at {}",
            files,
            chapter,
            entry
        );
        Ok(())
    }

    /// Enumerate every cache entry with its size and last access time.
    pub fn entries(&self) -> Result<Vec<CacheEntryInfo>> {
        let mut entries = Vec::new();
        if !self.root.as_std_path().is_dir() {
            return Ok(entries);
        }

        for chapter in read_subdirs(&self.root)? {
            let Some(chapter_name) = chapter.file_name().map(str::to_string) else {
                continue;
            };
            let by_hash = chapter.join("byhash");
            if !by_hash.as_std_path().is_dir() {
                continue;
            }
            for shard in read_subdirs(&by_hash)? {
                for dir in read_subdirs(&shard)? {
                    let key = dir.file_name().unwrap_or_default().to_string();
                    let size_bytes = dir_size(&dir);
                    let last_access = last_access_time(&dir);
                    entries.push(CacheEntryInfo {
                        chapter: chapter_name.clone(),
                        key,
                        dir,
                        size_bytes,
                        last_access,
                    });
                }
            }
        }

        Ok(entries)
    }

    /// Aggregate size of all cache entries in bytes.
    pub fn usage(&self) -> Result<u64> {
        Ok(self.entries()?.iter().map(|e| e.size_bytes).sum())
    }

    /// Delete least recently used entries until the cache fits under its cap.
    ///
    /// Entries that cannot be deleted are skipped. Without a configured cap this is a
    /// no-op.
    pub fn enforce_cap(&self) -> Result<EvictionReport> {
        let Some(cap) = self.max_bytes else {
            return Ok(EvictionReport::default());
        };

        let mut entries = self.entries()?;
        let mut total: u64 = entries.iter().map(|e| e.size_bytes).sum();
        let mut report = EvictionReport::default();

        if total <= cap {
            report.remaining_bytes = total;
            return Ok(report);
        }

        tracing::info!(
            "Export cache uses {} bytes, cap is {} bytes; evicting",
            total,
            cap
        );

        entries.sort_by(|a, b| a.last_access.cmp(&b.last_access));

        for entry in entries {
            if total <= cap {
                break;
            }
            match std::fs::remove_dir_all(entry.dir.as_std_path()) {
                Ok(()) => {
                    tracing::info!(
                        "Evicted cache entry chapter={} key={} ({} bytes)",
                        entry.chapter,
                        entry.key,
                        entry.size_bytes
                    );
                    total = total.saturating_sub(entry.size_bytes);
                    report.freed_bytes += entry.size_bytes;
                    report.removed.push(entry.dir);
                }
                Err(e) => {
                    tracing::warn!("Failed to evict cache entry {}: {}", entry.dir, e);
                }
            }
        }

        report.remaining_bytes = total;
        report.over_cap = total > cap;
        if report.over_cap {
            tracing::warn!(
                "Export cache still over cap after eviction ({} > {} bytes)",
                total,
                cap
            );
        }
        Ok(report)
    }
}

/// File-name safe cache key for a Base64 digest.
pub fn cache_key(digest: &str) -> String {
    digest
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect()
}

/// Mirror the tree at `src` into `dst`, linking files where possible.
///
/// When `exclude` is given, every path whose `/`-separated path relative to `src` starts
/// with it (ASCII case-insensitive) is skipped, e.g. `Some("Sprites")`. The whole
/// directory skeleton is created before any file is materialized. Returns the number of
/// files mirrored.
pub fn mirror_objects_selective(
    src: &Utf8Path,
    dst: &Utf8Path,
    exclude: Option<&str>,
) -> Result<usize> {
    let exclude = exclude.map(|e| e.replace('\\', "/").trim_matches('/').to_ascii_lowercase());
    let is_excluded = |relative: &str| match &exclude {
        Some(prefix) if !prefix.is_empty() => {
            let relative = relative.to_ascii_lowercase();
            relative == *prefix || relative.starts_with(&format!("{}/", prefix))
        }
        _ => false,
    };

    std::fs::create_dir_all(dst.as_std_path())?;

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for entry in WalkDir::new(src.as_std_path()).min_depth(1) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src.as_std_path())
            .map_err(|_| format!("{} is not under {}", entry.path().display(), src))?;
        let relative = Utf8Path::from_path(relative)
            .ok_or_else(|| crate::Error::NonUtf8Path(entry.path().to_path_buf()))?
            .to_path_buf();

        if is_excluded(&relative.as_str().replace('\\', "/")) {
            continue;
        }

        if entry.file_type().is_dir() {
            dirs.push(relative);
        } else {
            files.push(relative);
        }
    }

    for dir in &dirs {
        std::fs::create_dir_all(dst.join(dir).as_std_path())?;
    }
    for file in &files {
        link_or_copy(&src.join(file), &dst.join(file))?;
    }

    Ok(files.len())
}

fn read_subdirs(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut subdirs = Vec::new();
    for entry in std::fs::read_dir(dir.as_std_path())? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        match Utf8PathBuf::from_path_buf(entry.path()) {
            Ok(p) => subdirs.push(p),
            Err(p) => tracing::warn!("Skipping non-UTF-8 path: {}", p.display()),
        }
    }
    subdirs.sort();
    Ok(subdirs)
}

fn dir_size(dir: &Utf8Path) -> u64 {
    WalkDir::new(dir.as_std_path())
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn last_access_time(dir: &Utf8Path) -> SystemTime {
    let stamp = dir.join(STAMP_FILE_NAME);
    std::fs::metadata(stamp.as_std_path())
        .and_then(|m| m.modified())
        .or_else(|_| std::fs::metadata(dir.as_std_path()).and_then(|m| m.modified()))
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn touch(path: &Utf8Path) {
    let result = std::fs::File::options()
        .write(true)
        .open(path.as_std_path())
        .and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = result {
        tracing::debug!("Could not refresh access time of {}: {}", path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn utf8(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    fn cache(root: &Utf8Path, enabled: bool, max_size_mb: Option<u64>) -> ExportCache {
        ExportCache::new(
            root.join("Cache/export"),
            &CacheConfig {
                enabled,
                max_size_mb,
            },
        )
    }

    #[test]
    fn test_stamp_format() {
        let stamp = DumpStamp::new("abc=", "def=");
        assert_eq!(stamp.to_file_contents(), "pre=abc=\npost=def=\n");
        assert_eq!(DumpStamp::parse(&stamp.to_file_contents()), Some(stamp));
    }

    #[test]
    fn test_legacy_stamp_reads_as_pre() {
        let stamp = DumpStamp::parse("qZk+NkcGgWq6PiVxeFDCbJzQ2J0=\n").unwrap();
        assert_eq!(stamp.pre, "qZk+NkcGgWq6PiVxeFDCbJzQ2J0=");
        assert_eq!(stamp.post, None);
        assert_eq!(DumpStamp::parse("\n  \n"), None);
    }

    #[test]
    fn test_entry_dir_is_sharded_and_file_safe() {
        let cache = cache(Utf8Path::new("/out"), true, None);
        assert_eq!(
            cache.entry_dir("chapter1", "a+b/cd=="),
            Utf8PathBuf::from("/out/Cache/export/chapter1/byhash/a-/a-b_cd")
        );
    }

    #[test]
    fn test_is_valid() {
        let temp = TempDir::new().unwrap();
        let root = utf8(&temp);
        let enabled = cache(&root, true, None);
        let stamp = enabled.stamp_path("ch", "digest");

        // Missing stamp
        assert!(!enabled.is_valid(&stamp, "digest"));

        DumpStamp::new("digest", "after").write(&stamp).unwrap();
        assert!(enabled.is_valid(&stamp, "digest"));
        assert!(!enabled.is_valid(&stamp, "other"));
        assert!(!enabled.is_valid(&stamp, ""));

        let disabled = cache(&root, false, None);
        assert!(!disabled.is_valid(&stamp, "digest"));
    }

    #[test]
    fn test_store_and_restore() {
        let temp = TempDir::new().unwrap();
        let root = utf8(&temp);
        let cache = cache(&root, true, None);

        let slot = root.join("work/0");
        std::fs::create_dir_all(slot.join("Objects/CodeEntries")).unwrap();
        std::fs::write(slot.join("Objects/CodeEntries/gml_Script_a.gml"), b"code").unwrap();
        std::fs::write(slot.join("AssetOrder.txt"), b"a\nb\n").unwrap();

        cache.store("ch", "pre", "post", &slot).unwrap();
        assert!(cache.contains("ch", "pre"));

        let target = root.join("work/5");
        std::fs::create_dir_all(target.join("Objects/Stale")).unwrap();
        let restored = cache.restore("ch", "pre", &target).unwrap();

        assert_eq!(restored, 1);
        assert!(!target.join("Objects/Stale").exists());
        assert_eq!(
            std::fs::read(target.join("Objects/CodeEntries/gml_Script_a.gml")).unwrap(),
            b"code"
        );
        assert_eq!(std::fs::read(target.join("AssetOrder.txt")).unwrap(), b"a\nb\n");
    }

    #[test]
    fn test_store_does_not_overwrite_valid_entry() {
        let temp = TempDir::new().unwrap();
        let root = utf8(&temp);
        let cache = cache(&root, true, None);

        let slot = root.join("slot");
        std::fs::create_dir_all(slot.join("Objects")).unwrap();
        std::fs::write(slot.join("Objects/a.txt"), b"first").unwrap();
        cache.store("ch", "pre", "post1", &slot).unwrap();

        std::fs::write(slot.join("Objects/a.txt"), b"second").unwrap();
        cache.store("ch", "pre", "post2", &slot).unwrap();

        let stamp = DumpStamp::read(&cache.stamp_path("ch", "pre"))
            .unwrap()
            .unwrap();
        assert_eq!(stamp.post.as_deref(), Some("post1"));
    }

    #[test]
    fn test_mirror_excludes_prefix_case_insensitively() {
        let temp = TempDir::new().unwrap();
        let root = utf8(&temp);
        let src = root.join("src");
        std::fs::create_dir_all(src.join("Sprites/sub")).unwrap();
        std::fs::create_dir_all(src.join("SpritesExtra")).unwrap();
        std::fs::create_dir_all(src.join("Code")).unwrap();
        std::fs::create_dir_all(src.join("Empty")).unwrap();
        std::fs::write(src.join("Sprites/sub/s.png"), b"png").unwrap();
        std::fs::write(src.join("SpritesExtra/x.png"), b"png").unwrap();
        std::fs::write(src.join("Code/c.gml"), b"gml").unwrap();

        let dst = root.join("dst");
        let count = mirror_objects_selective(&src, &dst, Some("sprites")).unwrap();

        assert_eq!(count, 2);
        assert!(!dst.join("Sprites").exists());
        assert!(dst.join("SpritesExtra/x.png").exists());
        assert!(dst.join("Code/c.gml").exists());
        assert!(dst.join("Empty").is_dir());
    }

    fn make_entry(cache: &ExportCache, chapter: &str, digest: &str, bytes: usize, age_secs: u64) {
        let dir = cache.entry_dir(chapter, digest);
        std::fs::create_dir_all(dir.join("Objects")).unwrap();
        std::fs::write(dir.join("Objects/blob.bin"), vec![0u8; bytes]).unwrap();
        let stamp = dir.join(STAMP_FILE_NAME);
        DumpStamp::new(digest, digest).write(&stamp).unwrap();
        let file = std::fs::File::options().write(true).open(&stamp).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
    }

    #[test]
    fn test_eviction_removes_oldest_until_under_cap() {
        let temp = TempDir::new().unwrap();
        let root = utf8(&temp);
        let size = 700 * 1024;
        let cache = cache(&root, true, Some(2));

        make_entry(&cache, "ch1", "oldest", size, 300);
        make_entry(&cache, "ch2", "middle", size, 200);
        make_entry(&cache, "ch1", "newest", size, 100);

        let report = cache.enforce_cap().unwrap();

        assert_eq!(report.removed.len(), 1);
        assert!(!report.over_cap);
        assert!(!cache.entry_dir("ch1", "oldest").exists());
        assert!(cache.entry_dir("ch2", "middle").exists());
        assert!(cache.entry_dir("ch1", "newest").exists());
        assert!(report.remaining_bytes <= 2 * 1024 * 1024);
    }

    #[test]
    fn test_entry_without_stamp_ages_by_directory_mtime() {
        let temp = TempDir::new().unwrap();
        let root = utf8(&temp);
        let size = 700 * 1024;
        let cache = cache(&root, true, Some(2));

        make_entry(&cache, "ch1", "old", size, 300);
        make_entry(&cache, "ch1", "mid", size, 200);
        let unstamped = cache.entry_dir("ch1", "unstamped");
        std::fs::create_dir_all(unstamped.join("Objects")).unwrap();
        std::fs::write(unstamped.join("Objects/blob.bin"), vec![0u8; size]).unwrap();

        let dir_mtime = std::fs::metadata(&unstamped).unwrap().modified().unwrap();
        let listed = cache.entries().unwrap();
        let info = listed.iter().find(|e| e.dir == unstamped).unwrap();
        assert_eq!(info.last_access, dir_mtime);

        let report = cache.enforce_cap().unwrap();

        assert_eq!(report.removed, vec![cache.entry_dir("ch1", "old")]);
        assert!(unstamped.exists());
        assert!(cache.entry_dir("ch1", "mid").exists());
    }

    #[test]
    fn test_eviction_under_cap_is_noop() {
        let temp = TempDir::new().unwrap();
        let root = utf8(&temp);
        let cache = cache(&root, true, Some(10));
        make_entry(&cache, "ch", "a", 1024, 10);

        let report = cache.enforce_cap().unwrap();
        assert!(report.removed.is_empty());
        assert!(cache.entry_dir("ch", "a").exists());
    }

    #[test]
    fn test_eviction_exhausts_entries_when_cap_is_zero() {
        let temp = TempDir::new().unwrap();
        let root = utf8(&temp);
        let cache = cache(&root, true, Some(0));
        make_entry(&cache, "ch", "a", 1024, 10);
        make_entry(&cache, "ch", "b", 1024, 20);

        let report = cache.enforce_cap().unwrap();
        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.remaining_bytes, 0);
        assert!(!report.over_cap);
        assert_eq!(cache.usage().unwrap(), 0);
    }
}
