//! Cache, diff and merge engine for combining game data mods.
//!
//! Every mod is a modification of the same vanilla source binary. This crate turns the
//! vanilla binary and each mod's binary into asset trees, and merges those trees into
//! one combined tree plus a manifest of what changed:
//!
//! - **Dump**: [`DumpPipeline`] extracts each `(chapter, slot)` through an external
//!   tool, one extraction at a time, reusing the content-addressed [`ExportCache`].
//! - **Hash**: [`HashCache`] memoizes file digests by length and modification time and
//!   deduplicates concurrent requests.
//! - **Combine**: [`ModCombiner`] compares every asset against vanilla and adopts,
//!   picks or merges the differing versions. Text is merged three-way through git
//!   ([`GitService`]), the asset order list through [`merge_asset_orders`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use xdc_core::{CombinerConfig, DumpPipeline, HashCache, ModCombiner, SystemToolRunner};
//!
//! # async fn run() -> xdc_core::Result<()> {
//! let config = CombinerConfig::load(camino::Utf8Path::new("combiner.toml"))?;
//! let hashes = Arc::new(HashCache::new());
//! let runner = Arc::new(SystemToolRunner);
//!
//! let dump = DumpPipeline::from_config(config.clone(), hashes.clone(), runner.clone())?
//!     .run()
//!     .await?;
//! println!("{} slots dumped", dump.outcomes.len());
//!
//! let combiner = ModCombiner::from_config(&config, hashes, runner)?;
//! for chapter in &config.chapters {
//!     let report = combiner.combine_chapter(&chapter.name, chapter.mods.len())?;
//!     println!("{}: {} assets changed", chapter.name, report.stamp.changed_count);
//! }
//! # Ok(())
//! # }
//! ```

pub mod asset;
pub mod asset_order;
pub mod combiner;
pub mod config;
pub mod error;
pub mod export_cache;
pub mod extractor;
pub mod file_linker;
pub mod git_merge;
pub mod hash_cache;
pub mod image_compare;
pub mod layout;
pub mod patcher;
pub mod pipeline;
pub mod tool;

// Re-export main types
pub use asset::{AssetKey, AssetKind, AssetVersionSet, ModFileInfo};
pub use asset_order::{merge_asset_orders, AssetOrderMerge};
pub use combiner::{ChangeStamp, CombineReport, ManifestEntry, ModCombiner};
pub use config::{CacheConfig, ChapterConfig, CombinerConfig};
pub use error::{Error, Result};
pub use export_cache::{EvictionReport, ExportCache};
pub use extractor::{AssetExtractor, ExtractRequest, ToolExtractor};
pub use file_linker::{detach, link_or_copy, LinkMethod};
pub use git_merge::{GitService, TextMergeOutcome};
pub use hash_cache::HashCache;
pub use layout::{SourceId, WorkspaceLayout};
pub use patcher::{DeltaPatcher, PatchStage, XDeltaPatcher};
pub use pipeline::{DumpPipeline, DumpProgress, DumpReport, DumpState};
pub use tool::{SystemToolRunner, ToolInvocation, ToolRunner};
