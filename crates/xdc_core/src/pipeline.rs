//! Dump orchestration: turn every configured source binary into an asset tree.
//!
//! The [`DumpPipeline`] stages the source binaries of every chapter into their slot
//! directories (applying delta patches where a mod ships one), then dumps each
//! `(chapter, slot)` pair, reusing the [`ExportCache`] whenever it can.
//!
//! # Slot State Machine
//!
//! ```text
//! NotDumped -> CacheHit  -> Mirrored
//! NotDumped -> CacheMiss -> Extracting -> Extracted -> Cached
//! ```
//!
//! A slot that fails at any point ends in `Failed` and is reported; the run goes on.
//!
//! # Concurrency
//!
//! - The extraction tool is single-instance: a process-wide binary semaphore admits one
//!   extraction at a time, whichever chapter or pipeline asks.
//! - Chapters run as concurrent tasks only when there are several chapters, none has
//!   more than `max_mods_for_parallel` mods, and the cache is enabled. Otherwise
//!   everything runs sequentially.
//! - Slots of one chapter always run one after another in increasing slot order, as
//!   they share the chapter directory.
//! - Delta patches are independent and run concurrently under their own bounded gate.

use crate::config::CombinerConfig;
use crate::error::{Error, Result};
use crate::export_cache::{DumpStamp, EvictionReport, ExportCache};
use crate::extractor::{AssetExtractor, ExtractRequest, ToolExtractor, GENERATED_KINDS, SANITY_KINDS};
use crate::file_linker::detach;
use crate::hash_cache::HashCache;
use crate::layout::{
    SourceId, WorkspaceLayout, ASSET_ORDER_FILE_NAME, OBJECTS_DIR_NAME, SOURCE_BINARY_NAME,
};
use crate::patcher::{is_patch_file, DeltaPatcher, PatchJob, PatchStage, XDeltaPatcher};
use crate::tool::ToolRunner;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;
use walkdir::WalkDir;

/// Where a `(chapter, slot)` pair is in its dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DumpState {
    NotDumped,
    CacheHit,
    Mirrored,
    CacheMiss,
    Extracting,
    Extracted,
    Cached,
    Failed,
}

impl fmt::Display for DumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DumpState::NotDumped => "not dumped",
            DumpState::CacheHit => "cache hit",
            DumpState::Mirrored => "mirrored",
            DumpState::CacheMiss => "cache miss",
            DumpState::Extracting => "extracting",
            DumpState::Extracted => "extracted",
            DumpState::Cached => "cached",
            DumpState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Emitted on every state transition of a slot.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpProgress {
    pub chapter: String,
    pub slot: SourceId,
    pub state: DumpState,
}

type ProgressCallback = Arc<dyn Fn(DumpProgress) + Send + Sync>;

/// A slot that was dumped successfully.
#[derive(Debug, Clone)]
pub struct SlotOutcome {
    pub chapter: String,
    pub slot: SourceId,
    /// `Mirrored`, `Extracted` (cache disabled or store failed) or `Cached`.
    pub state: DumpState,
    pub pre_hash: String,
    pub post_hash: Option<String>,
    /// Files in the slot's `Objects/` tree.
    pub files: usize,
}

/// A slot that could not be staged or dumped.
#[derive(Debug, Clone)]
pub struct SlotFailure {
    pub chapter: String,
    pub slot: SourceId,
    pub message: String,
}

/// Suspicious but non-fatal dump results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanityWarning {
    /// Code, sprite and new object subtrees hold at most one file together.
    FewAssets {
        chapter: String,
        slot: SourceId,
        count: usize,
    },
    MissingAssetOrder {
        chapter: String,
        slot: SourceId,
    },
}

impl fmt::Display for SanityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SanityWarning::FewAssets {
                chapter,
                slot,
                count,
            } => write!(
                f,
                "chapter {} {}: only {} code/sprite/new object files extracted",
                chapter, slot, count
            ),
            SanityWarning::MissingAssetOrder { chapter, slot } => {
                write!(f, "chapter {} {}: {} is missing", chapter, slot, ASSET_ORDER_FILE_NAME)
            }
        }
    }
}

/// Summary returned by [`DumpPipeline::run`].
#[derive(Debug, Clone, Default)]
pub struct DumpReport {
    /// Whether chapters were dumped concurrently.
    pub parallel: bool,
    pub outcomes: Vec<SlotOutcome>,
    pub failures: Vec<SlotFailure>,
    pub warnings: Vec<SanityWarning>,
    /// Cache eviction at the end of the run, when a cap is configured.
    pub eviction: Option<EvictionReport>,
}

impl DumpReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of dumping the slots of one chapter.
struct ChapterDump {
    outcomes: Vec<SlotOutcome>,
    failures: Vec<SlotFailure>,
}

/// Orchestrates the dump of every configured chapter.
///
/// Cheap to clone; clones share the caches and the extraction gate.
#[derive(Clone)]
pub struct DumpPipeline {
    config: Arc<CombinerConfig>,
    layout: WorkspaceLayout,
    cache: Arc<ExportCache>,
    hashes: Arc<HashCache>,
    extractor: Arc<dyn AssetExtractor>,
    patches: Arc<PatchStage>,
    extract_gate: Arc<Semaphore>,
    progress: Option<ProgressCallback>,
}

impl DumpPipeline {
    /// Create a pipeline. Fails immediately if no output directory is configured.
    pub fn new(
        config: CombinerConfig,
        hashes: Arc<HashCache>,
        extractor: Arc<dyn AssetExtractor>,
        patcher: Arc<dyn DeltaPatcher>,
    ) -> Result<Self> {
        let layout = WorkspaceLayout::from_config(&config)?;
        let cache = ExportCache::from_layout(&layout, &config.cache);
        let patches = PatchStage::new(patcher, config.parallel.patch_workers());
        Ok(Self {
            config: Arc::new(config),
            layout,
            cache: Arc::new(cache),
            hashes,
            extractor,
            patches: Arc::new(patches),
            extract_gate: process_extraction_gate(),
            progress: None,
        })
    }

    /// Create a pipeline using the configured extraction tool and `xdelta3`.
    pub fn from_config(
        config: CombinerConfig,
        hashes: Arc<HashCache>,
        runner: Arc<dyn ToolRunner>,
    ) -> Result<Self> {
        let extractor = ToolExtractor::new(
            Arc::clone(&runner),
            config.tools.extractor.clone(),
            config.tools.extract_timeout(),
        );
        let patcher = XDeltaPatcher::new(runner, config.tools.xdelta.clone());
        Self::new(config, hashes, Arc::new(extractor), Arc::new(patcher))
    }

    /// Use `gate` instead of the process-wide extraction gate.
    ///
    /// Only for extractors known to be safe alongside other instances of the tool, or
    /// for embedders that manage the gate themselves.
    pub fn with_extraction_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.extract_gate = gate;
        self
    }

    /// Register a callback receiving every slot state transition.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(DumpProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    pub fn cache(&self) -> &ExportCache {
        &self.cache
    }

    /// Whether [`run`](Self::run) will dump chapters concurrently.
    pub fn runs_parallel(&self) -> bool {
        should_run_parallel(&self.config)
    }

    /// Stage and dump every configured chapter.
    pub async fn run(&self) -> Result<DumpReport> {
        let parallel = self.runs_parallel();
        tracing::info!(
            "Dumping {} chapters ({})",
            self.config.chapters.len(),
            if parallel { "parallel" } else { "sequential" }
        );

        let (chapters, mut failures) = self.stage_sources().await?;

        let binaries: Vec<Utf8PathBuf> = chapters
            .iter()
            .flat_map(|(chapter, slots)| {
                slots
                    .iter()
                    .map(|slot| self.layout.source_binary(chapter, *slot))
                    .collect::<Vec<_>>()
            })
            .collect();
        let hashes = Arc::clone(&self.hashes);
        let workers = self.config.parallel.hash_workers();
        let hashed =
            tokio::task::spawn_blocking(move || hashes.precompute(&binaries, workers)).await?;
        tracing::debug!("Pre-hashed {} source binaries", hashed);

        let dumps = if parallel {
            let handles: Vec<_> = chapters
                .into_iter()
                .map(|(chapter, slots)| tokio::spawn(self.clone().dump_chapter(chapter, slots)))
                .collect();
            let mut dumps = Vec::with_capacity(handles.len());
            for handle in handles {
                dumps.push(handle.await?);
            }
            dumps
        } else {
            let mut dumps = Vec::with_capacity(chapters.len());
            for (chapter, slots) in chapters {
                dumps.push(self.clone().dump_chapter(chapter, slots).await);
            }
            dumps
        };

        let mut report = DumpReport {
            parallel,
            ..Default::default()
        };
        for dump in dumps {
            report.outcomes.extend(dump.outcomes);
            failures.extend(dump.failures);
        }
        report.failures = failures;

        for outcome in &report.outcomes {
            let slot_dir = self.layout.slot_dir(&outcome.chapter, outcome.slot);
            for warning in sanity_check(&outcome.chapter, outcome.slot, &slot_dir) {
                tracing::warn!("Sanity check: {}", warning);
                report.warnings.push(warning);
            }
        }

        if self.cache.is_enabled() {
            let cache = Arc::clone(&self.cache);
            match tokio::task::spawn_blocking(move || cache.enforce_cap()).await? {
                Ok(eviction) => report.eviction = Some(eviction),
                Err(e) => tracing::warn!("Export cache eviction failed: {}", e),
            }
        }

        tracing::info!(
            "Dump finished: {} slots dumped, {} failed, {} warnings",
            report.outcomes.len(),
            report.failures.len(),
            report.warnings.len()
        );
        Ok(report)
    }

    /// Copy or patch every source binary into its slot directory.
    ///
    /// Returns the slots ready to dump per chapter, in slot order, and the slots that
    /// could not be staged.
    async fn stage_sources(&self) -> Result<(Vec<(String, Vec<SourceId>)>, Vec<SlotFailure>)> {
        let mut ready: Vec<(String, Vec<SourceId>)> = Vec::new();
        let mut failures = Vec::new();
        let mut jobs = Vec::new();

        for chapter in &self.config.chapters {
            let vanilla_target = self.layout.source_binary(&chapter.name, SourceId::VANILLA);
            if let Err(e) = self.stage_copy(&chapter.vanilla, &vanilla_target).await {
                tracing::error!("Chapter {}: cannot stage vanilla binary: {}", chapter.name, e);
                failures.push(SlotFailure {
                    chapter: chapter.name.clone(),
                    slot: SourceId::VANILLA,
                    message: e.to_string(),
                });
                continue;
            }

            let mut slots = vec![SourceId::VANILLA];
            for (index, source) in chapter.mods.iter().enumerate() {
                let slot = SourceId::for_mod_index(index);
                let target = self.layout.source_binary(&chapter.name, slot);
                if is_patch_file(source) {
                    jobs.push(PatchJob {
                        chapter: chapter.name.clone(),
                        slot,
                        source: vanilla_target.clone(),
                        patch: source.clone(),
                        target,
                    });
                    slots.push(slot);
                    continue;
                }
                match self.stage_copy(source, &target).await {
                    Ok(()) => slots.push(slot),
                    Err(e) => {
                        tracing::error!("Chapter {} {}: cannot stage {}: {}", chapter.name, slot, source, e);
                        failures.push(SlotFailure {
                            chapter: chapter.name.clone(),
                            slot,
                            message: e.to_string(),
                        });
                    }
                }
            }
            ready.push((chapter.name.clone(), slots));
        }

        let mut unpatched: HashSet<(String, SourceId)> = HashSet::new();
        for outcome in self.patches.apply_all(jobs).await {
            if let Err(e) = outcome.result {
                failures.push(SlotFailure {
                    chapter: outcome.job.chapter.clone(),
                    slot: outcome.job.slot,
                    message: e.to_string(),
                });
                unpatched.insert((outcome.job.chapter, outcome.job.slot));
            }
        }
        for (chapter, slots) in &mut ready {
            slots.retain(|slot| !unpatched.contains(&(chapter.clone(), *slot)));
        }

        Ok((ready, failures))
    }

    /// Copy a source binary into a slot. Never hard linked: the extraction tool may
    /// rewrite the binary it is given.
    async fn stage_copy(&self, source: &Utf8Path, target: &Utf8Path) -> Result<()> {
        let source = source.to_path_buf();
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || stage_binary(&source, &target)).await?.map(|_| ())
    }

    async fn dump_chapter(self, chapter: String, slots: Vec<SourceId>) -> ChapterDump {
        let mut dump = ChapterDump {
            outcomes: Vec::with_capacity(slots.len()),
            failures: Vec::new(),
        };

        for slot in slots {
            match self.dump_slot(&chapter, slot).await {
                Ok(outcome) => dump.outcomes.push(outcome),
                Err(e) => {
                    tracing::error!("Chapter {} {}: dump failed: {}", chapter, slot, e);
                    self.emit(&chapter, slot, DumpState::Failed);
                    dump.failures.push(SlotFailure {
                        chapter: chapter.clone(),
                        slot,
                        message: e.to_string(),
                    });
                }
            }
        }

        dump
    }

    async fn dump_slot(&self, chapter: &str, slot: SourceId) -> Result<SlotOutcome> {
        let slot_dir = self.layout.slot_dir(chapter, slot);
        let data_file = slot_dir.join(SOURCE_BINARY_NAME);
        let objects_dir = slot_dir.join(OBJECTS_DIR_NAME);
        if !data_file.as_std_path().is_file() {
            return Err(Error::MissingSourceBinary(data_file));
        }

        self.emit(chapter, slot, DumpState::NotDumped);
        let pre = self.hashes.digest_async(&data_file).await?;

        let stamp_path = self.cache.stamp_path(chapter, &pre);
        if self.cache.is_valid(&stamp_path, &pre) {
            self.emit(chapter, slot, DumpState::CacheHit);
            tracing::info!("Chapter {} {}: cache hit", chapter, slot);

            let cache = Arc::clone(&self.cache);
            let (owned_chapter, digest, dir) = (chapter.to_string(), pre.clone(), slot_dir.clone());
            let files =
                tokio::task::spawn_blocking(move || cache.restore(&owned_chapter, &digest, &dir))
                    .await??;
            self.emit(chapter, slot, DumpState::Mirrored);

            let post_hash = DumpStamp::read(&stamp_path).ok().flatten().and_then(|s| s.post);
            return Ok(SlotOutcome {
                chapter: chapter.to_string(),
                slot,
                state: DumpState::Mirrored,
                pre_hash: pre,
                post_hash,
                files,
            });
        }

        self.emit(chapter, slot, DumpState::CacheMiss);
        tracing::info!("Chapter {} {}: cache miss, extracting", chapter, slot);

        let chapter_dir = self.layout.chapter_dir(chapter);
        {
            let (chapter_dir, slot_dir) = (chapter_dir.clone(), slot_dir.clone());
            let objects_dir = objects_dir.clone();
            let (removed, detached) = tokio::task::spawn_blocking(move || -> Result<(usize, usize)> {
                let removed = remove_stale_outputs(&chapter_dir, &slot_dir)?;
                let detached = detach_objects(&objects_dir)?;
                Ok((removed, detached))
            })
            .await??;
            if removed > 0 {
                tracing::debug!("Chapter {} {}: removed {} stale outputs", chapter, slot, removed);
            }
            if detached > 0 {
                tracing::debug!(
                    "Chapter {} {}: detached {} files shared with the export cache",
                    chapter,
                    slot,
                    detached
                );
            }
        }

        let request = ExtractRequest {
            chapter: chapter.to_string(),
            slot,
            data_file: data_file.clone(),
            slot_dir: slot_dir.clone(),
            objects_dir: objects_dir.clone(),
        };
        {
            let _permit = self
                .extract_gate
                .acquire()
                .await
                .map_err(|e| Error::Other(format!("extraction gate closed: {e}")))?;
            self.emit(chapter, slot, DumpState::Extracting);
            let extractor = Arc::clone(&self.extractor);
            tokio::task::spawn_blocking(move || extractor.extract(&request)).await??;
        }
        self.emit(chapter, slot, DumpState::Extracted);

        if relocate_asset_order(&chapter_dir, &slot_dir)? {
            tracing::info!(
                "Chapter {} {}: moved misplaced {} into the slot",
                chapter,
                slot,
                ASSET_ORDER_FILE_NAME
            );
        }

        let post = self.hashes.digest_async(&data_file).await?;
        if post != pre {
            tracing::debug!("Chapter {} {}: extraction modified the source binary", chapter, slot);
        }

        let mut state = DumpState::Extracted;
        if self.cache.is_enabled() {
            let cache = Arc::clone(&self.cache);
            let (owned_chapter, pre, post, dir) =
                (chapter.to_string(), pre.clone(), post.clone(), slot_dir.clone());
            match tokio::task::spawn_blocking(move || cache.store(&owned_chapter, &pre, &post, &dir))
                .await?
            {
                Ok(()) => {
                    state = DumpState::Cached;
                    self.emit(chapter, slot, DumpState::Cached);
                }
                Err(e) => tracing::warn!("Chapter {} {}: failed to cache extraction: {}", chapter, slot, e),
            }
        }

        Ok(SlotOutcome {
            chapter: chapter.to_string(),
            slot,
            state,
            pre_hash: pre,
            post_hash: Some(post),
            files: count_files(&objects_dir),
        })
    }

    fn emit(&self, chapter: &str, slot: SourceId, state: DumpState) {
        if let Some(callback) = &self.progress {
            callback(DumpProgress {
                chapter: chapter.to_string(),
                slot,
                state,
            });
        }
    }
}

/// The binary semaphore shared by every pipeline in the process.
pub fn process_extraction_gate() -> Arc<Semaphore> {
    static GATE: OnceLock<Arc<Semaphore>> = OnceLock::new();
    Arc::clone(GATE.get_or_init(|| Arc::new(Semaphore::new(1))))
}

/// Copy `source` to `target` unless `target` is already an identical staged copy.
///
/// The copy takes over the source's modification time, so an unchanged binary keeps
/// the same `(length, mtime)` across runs and its memoized digest stays valid. Returns
/// whether a copy was made.
pub fn stage_binary(source: &Utf8Path, target: &Utf8Path) -> Result<bool> {
    let Ok(meta) = fs::metadata(source) else {
        return Err(Error::MissingSourceBinary(source.to_path_buf()));
    };
    if !meta.is_file() {
        return Err(Error::MissingSourceBinary(source.to_path_buf()));
    }
    let modified = meta.modified()?;

    if let Ok(staged) = fs::metadata(target) {
        if staged.is_file() && staged.len() == meta.len() && staged.modified().ok() == Some(modified) {
            return Ok(false);
        }
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, target)?;
    fs::File::options()
        .write(true)
        .open(target)?
        .set_modified(modified)?;
    Ok(true)
}

/// Parallel chapters need several chapters, few mods each and an enabled cache.
pub fn should_run_parallel(config: &CombinerConfig) -> bool {
    config.chapters.len() > 1
        && config.cache.enabled
        && config
            .chapters
            .iter()
            .all(|c| c.mods.len() <= config.parallel.max_mods_for_parallel)
}

/// Remove outputs of an earlier extraction of this slot: the generated `Objects/`
/// subtrees, the slot's asset order, and a misplaced asset order in the chapter
/// directory. Returns how many entries were removed.
pub fn remove_stale_outputs(chapter_dir: &Utf8Path, slot_dir: &Utf8Path) -> Result<usize> {
    let mut removed = 0;

    let objects_dir = slot_dir.join(OBJECTS_DIR_NAME);
    if objects_dir.as_std_path().is_dir() {
        for entry in fs::read_dir(&objects_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !GENERATED_KINDS.iter().any(|k| k.eq_ignore_ascii_case(&name)) {
                continue;
            }
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
            removed += 1;
        }
    }

    for order in [
        slot_dir.join(ASSET_ORDER_FILE_NAME),
        chapter_dir.join(ASSET_ORDER_FILE_NAME),
    ] {
        if order.as_std_path().is_file() {
            fs::remove_file(&order)?;
            removed += 1;
        }
    }

    Ok(removed)
}

/// Break hard links between the files left in `objects_dir` and any cache entry, so
/// the extraction tool can rewrite them in place. Returns how many files were detached.
pub fn detach_objects(objects_dir: &Utf8Path) -> Result<usize> {
    if !objects_dir.as_std_path().is_dir() {
        return Ok(0);
    }

    let mut detached = 0;
    for entry in WalkDir::new(objects_dir.as_std_path()).min_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = Utf8Path::from_path(entry.path())
            .ok_or_else(|| Error::NonUtf8Path(entry.path().to_path_buf()))?;
        if detach(path)? {
            detached += 1;
        }
    }
    Ok(detached)
}

/// Move an asset order the extraction tool wrote into the chapter directory into the
/// slot. If the slot already has one, the stray copy is deleted. Returns whether a file
/// was moved.
pub fn relocate_asset_order(chapter_dir: &Utf8Path, slot_dir: &Utf8Path) -> Result<bool> {
    let misplaced = chapter_dir.join(ASSET_ORDER_FILE_NAME);
    if !misplaced.as_std_path().is_file() {
        return Ok(false);
    }

    let target = slot_dir.join(ASSET_ORDER_FILE_NAME);
    if target.as_std_path().exists() {
        tracing::warn!("Removing stray {} next to {}", misplaced, target);
        fs::remove_file(&misplaced)?;
        return Ok(false);
    }

    if fs::rename(&misplaced, &target).is_err() {
        fs::copy(&misplaced, &target)?;
        fs::remove_file(&misplaced)?;
    }
    Ok(true)
}

/// Flag slots whose code, sprite and new object trees hold at most one file together,
/// and slots without an asset order.
pub fn sanity_check(chapter: &str, slot: SourceId, slot_dir: &Utf8Path) -> Vec<SanityWarning> {
    let mut warnings = Vec::new();
    let objects_dir = slot_dir.join(OBJECTS_DIR_NAME);

    let count: usize = SANITY_KINDS
        .iter()
        .map(|kind| count_files(&objects_dir.join(kind)))
        .sum();
    if count <= 1 {
        warnings.push(SanityWarning::FewAssets {
            chapter: chapter.to_string(),
            slot,
            count,
        });
    }

    if !slot_dir.join(ASSET_ORDER_FILE_NAME).as_std_path().is_file() {
        warnings.push(SanityWarning::MissingAssetOrder {
            chapter: chapter.to_string(),
            slot,
        });
    }

    warnings
}

fn count_files(dir: &Utf8Path) -> usize {
    WalkDir::new(dir.as_std_path())
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count()
}
