//! On-disk layout of working trees and the export cache.
//!
//! ```text
//! <output>/
//!   xDeltaCombiner/
//!     <chapter>/
//!       0/                     # vanilla
//!         data.win
//!         AssetOrder.txt
//!         Objects/
//!           CodeEntries/
//!           Sprites/
//!           ...
//!       1/                     # merged output
//!         Objects/
//!         AssetOrder.txt
//!         modifiedAssets.txt
//!         changes.stamp
//!       2/ 3/ ...              # one slot per mod
//!   Cache/
//!     hashes.json              # persisted digest snapshot
//!     export/
//!       <chapter>/byhash/<shard>/<key>/{Objects/, AssetOrder.txt, .stamp}
//! ```

use crate::config::CombinerConfig;
use crate::error::Result;
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;

pub const SOURCE_BINARY_NAME: &str = "data.win";
pub const OBJECTS_DIR_NAME: &str = "Objects";
pub const ASSET_ORDER_FILE_NAME: &str = "AssetOrder.txt";
pub const MODIFIED_ASSETS_FILE_NAME: &str = "modifiedAssets.txt";
pub const CHANGE_STAMP_FILE_NAME: &str = "changes.stamp";

/// Identifies one tree within a chapter: vanilla, merged output, or mod N.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct SourceId(pub u32);

impl SourceId {
    pub const VANILLA: SourceId = SourceId(0);
    pub const MERGED: SourceId = SourceId(1);

    /// Slot of the `index`-th mod (0-based) in configuration order.
    pub fn for_mod_index(index: usize) -> Self {
        SourceId(index as u32 + 2)
    }

    pub fn is_vanilla(self) -> bool {
        self == Self::VANILLA
    }

    pub fn is_mod(self) -> bool {
        self.0 >= 2
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::VANILLA => write!(f, "vanilla"),
            Self::MERGED => write!(f, "merged"),
            SourceId(n) => write!(f, "mod {}", n),
        }
    }
}

/// Paths derived from the configured output root.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    output_dir: Utf8PathBuf,
}

impl WorkspaceLayout {
    pub fn new(output_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Build the layout from a config, failing if no output directory is set.
    pub fn from_config(config: &CombinerConfig) -> Result<Self> {
        Ok(Self::new(config.output_dir()?))
    }

    pub fn output_dir(&self) -> &Utf8Path {
        &self.output_dir
    }

    pub fn chapter_dir(&self, chapter: &str) -> Utf8PathBuf {
        self.output_dir.join("xDeltaCombiner").join(chapter)
    }

    pub fn slot_dir(&self, chapter: &str, slot: SourceId) -> Utf8PathBuf {
        self.chapter_dir(chapter).join(slot.0.to_string())
    }

    pub fn source_binary(&self, chapter: &str, slot: SourceId) -> Utf8PathBuf {
        self.slot_dir(chapter, slot).join(SOURCE_BINARY_NAME)
    }

    pub fn objects_dir(&self, chapter: &str, slot: SourceId) -> Utf8PathBuf {
        self.slot_dir(chapter, slot).join(OBJECTS_DIR_NAME)
    }

    pub fn asset_order_path(&self, chapter: &str, slot: SourceId) -> Utf8PathBuf {
        self.slot_dir(chapter, slot).join(ASSET_ORDER_FILE_NAME)
    }

    pub fn modified_assets_path(&self, chapter: &str) -> Utf8PathBuf {
        self.slot_dir(chapter, SourceId::MERGED)
            .join(MODIFIED_ASSETS_FILE_NAME)
    }

    pub fn change_stamp_path(&self, chapter: &str) -> Utf8PathBuf {
        self.slot_dir(chapter, SourceId::MERGED)
            .join(CHANGE_STAMP_FILE_NAME)
    }

    /// Root of the export cache: `<output>/Cache/export`.
    pub fn export_cache_root(&self) -> Utf8PathBuf {
        self.output_dir.join("Cache").join("export")
    }

    /// Persisted digest snapshot: `<output>/Cache/hashes.json`.
    pub fn hash_cache_path(&self) -> Utf8PathBuf {
        self.output_dir.join("Cache").join("hashes.json")
    }
}
