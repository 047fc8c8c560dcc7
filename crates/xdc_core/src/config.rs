//! Run configuration.
//!
//! A [`CombinerConfig`] is loaded once (usually from a TOML file) and passed by
//! reference to every component. Nothing in this crate reads paths or settings from
//! global state.
//!
//! # TOML format
//!
//! ```toml
//! output_dir = "D:/Games/Deltarune/combined"
//!
//! [cache]
//! enabled = true
//! max_size_mb = 4096
//!
//! [tools]
//! git = "git"
//! xdelta = "xdelta3"
//! merge_timeout_secs = 10
//!
//! [tools.extractor]
//! program = "UndertaleModCli"
//! script_dir = "scripts"
//! scripts = ["ExportAllCode.csx", "ExportAllSprites.csx", "ExportNewObjects.csx"]
//! full_export_script = "ExportAll.csx"
//!
//! [[chapters]]
//! name = "chapter1"
//! vanilla = "vanilla/chapter1/data.win"
//! mods = ["mods/a/chapter1/data.win", "mods/b/chapter1/data.win"]
//! ```

use crate::error::{Error, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for a dump/combine run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CombinerConfig {
    /// Root of every generated file (working trees and the export cache).
    pub output_dir: Option<Utf8PathBuf>,

    /// Chapters (independent base binaries) to process, with their mods.
    #[serde(default)]
    pub chapters: Vec<ChapterConfig>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub parallel: ParallelConfig,
}

/// One chapter: the vanilla source binary and the mod binaries in slot order.
///
/// `mods[0]` becomes slot 2, `mods[1]` slot 3, and so on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterConfig {
    pub name: String,
    pub vanilla: Utf8PathBuf,
    #[serde(default)]
    pub mods: Vec<Utf8PathBuf>,
}

/// Export cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Aggregate size cap in megabytes. `None` disables eviction.
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: None,
        }
    }
}

impl CacheConfig {
    /// Cap in bytes, if one is configured.
    pub fn max_size_bytes(&self) -> Option<u64> {
        self.max_size_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }
}

/// External executables used by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default = "default_git")]
    pub git: String,
    #[serde(default = "default_xdelta")]
    pub xdelta: String,
    /// Per-invocation timeout for the merge tool.
    #[serde(default = "default_merge_timeout")]
    pub merge_timeout_secs: u64,
    /// Per-invocation timeout for the extraction tool. `None` waits indefinitely.
    #[serde(default)]
    pub extract_timeout_secs: Option<u64>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            extractor: ExtractorConfig::default(),
            git: default_git(),
            xdelta: default_xdelta(),
            merge_timeout_secs: default_merge_timeout(),
            extract_timeout_secs: None,
        }
    }
}

impl ToolsConfig {
    pub fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }

    pub fn extract_timeout(&self) -> Option<Duration> {
        self.extract_timeout_secs.map(Duration::from_secs)
    }
}

/// How the extraction tool is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    pub program: String,
    /// Directory holding the export scripts.
    #[serde(default)]
    pub script_dir: Utf8PathBuf,
    /// Export scripts run one after another for each dump.
    #[serde(default)]
    pub scripts: Vec<String>,
    /// Script used instead of `scripts` when any of them is missing.
    #[serde(default)]
    pub full_export_script: Option<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            program: "UndertaleModCli".to_string(),
            script_dir: Utf8PathBuf::from("scripts"),
            scripts: Vec::new(),
            full_export_script: None,
        }
    }
}

/// Concurrency limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Chapters only run in parallel when no chapter has more mods than this.
    #[serde(default = "default_max_mods_for_parallel")]
    pub max_mods_for_parallel: usize,
    #[serde(default)]
    pub hash_workers: Option<usize>,
    #[serde(default)]
    pub patch_workers: Option<usize>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_mods_for_parallel: default_max_mods_for_parallel(),
            hash_workers: None,
            patch_workers: None,
        }
    }
}

impl ParallelConfig {
    pub fn hash_workers(&self) -> usize {
        self.hash_workers.unwrap_or_else(available_cores).max(1)
    }

    pub fn patch_workers(&self) -> usize {
        self.patch_workers.unwrap_or_else(available_cores).max(1)
    }
}

impl CombinerConfig {
    /// Load a configuration from a TOML file.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_std_path())?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// The configured output root.
    ///
    /// Every stage calls this first; an unset output location fails immediately.
    pub fn output_dir(&self) -> Result<&Utf8Path> {
        self.output_dir.as_deref().ok_or(Error::MissingOutputDir)
    }
}

/// Number of worker threads to use when none is configured.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_true() -> bool {
    true
}

fn default_git() -> String {
    "git".to_string()
}

fn default_xdelta() -> String {
    "xdelta3".to_string()
}

fn default_merge_timeout() -> u64 {
    10
}

fn default_max_mods_for_parallel() -> usize {
    4
}
