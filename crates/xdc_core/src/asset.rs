//! Asset identities and per-chapter version sets.
//!
//! Every file below a slot's `Objects/` directory is one asset. Assets are matched
//! across trees by [`AssetKey`], a lowercased forward-slash relative path, so
//! `Sprites\spr_Kris_0.PNG` in one mod and `sprites/spr_kris_0.png` in another are the
//! same asset.

use crate::error::{Error, Result};
use crate::layout::SourceId;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeMap;
use std::fmt;
use walkdir::WalkDir;

/// Normalized, case-insensitive relative path of an asset.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetKey(String);

impl AssetKey {
    pub fn new(relative_path: &str) -> Self {
        let normalized = relative_path
            .replace('\\', "/")
            .split('/')
            .filter(|part| !part.is_empty() && *part != ".")
            .collect::<Vec<_>>()
            .join("/")
            .to_lowercase();
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn extension(&self) -> &str {
        let name = self.0.rsplit('/').next().unwrap_or("");
        match name.rfind('.') {
            Some(idx) if idx > 0 => &name[idx + 1..],
            _ => "",
        }
    }

    fn top_dir(&self) -> Option<&str> {
        self.0.split_once('/').map(|(top, _)| top)
    }

    /// Merge category of this asset.
    pub fn kind(&self) -> AssetKind {
        if self.top_dir() == Some(NEW_OBJECTS_DIR) {
            return AssetKind::NewObject;
        }
        let ext = self.extension();
        if IMAGE_EXTENSIONS.contains(&ext) {
            AssetKind::Image
        } else if AUDIO_EXTENSIONS.contains(&ext) {
            AssetKind::Audio
        } else if TEXT_EXTENSIONS.contains(&ext) {
            AssetKind::Text
        } else {
            AssetKind::Binary
        }
    }

    /// Whether a change to this asset counts as a code change.
    pub fn is_code(&self) -> bool {
        self.top_dir() == Some(CODE_DIR) || CODE_EXTENSIONS.contains(&self.extension())
    }

    /// Whether a change to this asset counts as a sprite change.
    pub fn is_sprite(&self) -> bool {
        self.top_dir() == Some(SPRITES_DIR) || self.kind() == AssetKind::Image
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const NEW_OBJECTS_DIR: &str = "newobjects";
const CODE_DIR: &str = "codeentries";
const SPRITES_DIR: &str = "sprites";

const IMAGE_EXTENSIONS: &[&str] = &["png", "bmp", "gif", "jpg", "jpeg"];
const AUDIO_EXTENSIONS: &[&str] = &["ogg", "wav", "mp3", "flac", "dat"];
const TEXT_EXTENSIONS: &[&str] = &[
    "gml", "asm", "txt", "json", "csv", "ini", "yml", "yaml", "xml", "csx", "glsl", "hlsl", "vsh",
    "fsh",
];
const CODE_EXTENSIONS: &[&str] = &["gml", "asm"];

/// How conflicting versions of an asset are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    /// Structured definitions under `NewObjects/`: highest mod wins, no content merge.
    NewObject,
    /// Pick the highest-numbered structurally valid image.
    Image,
    /// Highest mod wins.
    Audio,
    /// Three-way text merge.
    Text,
    /// Any other binary: highest mod wins.
    Binary,
}

/// One tree's version of an asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModFileInfo {
    pub source: SourceId,
    pub path: Utf8PathBuf,
    /// Path relative to the tree's `Objects/` directory, with its original casing.
    pub display_name: String,
}

/// Every version of every asset of one chapter, keyed by asset and ordered by source.
pub type AssetVersionSet = BTreeMap<AssetKey, Vec<ModFileInfo>>;

/// Walk each `(source, objects_dir)` tree and group files by [`AssetKey`].
///
/// Missing trees contribute nothing. Within a key, versions are sorted by source id and
/// a source contributes at most one file per key (the first one found wins if two
/// paths differ only by case).
pub fn collect_versions(trees: &[(SourceId, Utf8PathBuf)]) -> Result<AssetVersionSet> {
    let mut set = AssetVersionSet::new();

    for (source, root) in trees {
        if !root.as_std_path().is_dir() {
            tracing::debug!("No asset tree for {} at {}", source, root);
            continue;
        }

        let mut files: Vec<(String, Utf8PathBuf)> = Vec::new();
        for entry in WalkDir::new(root.as_std_path()).min_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = Utf8PathBuf::from_path_buf(entry.path().to_path_buf())
                .map_err(Error::NonUtf8Path)?;
            let relative = relative_display(root, &path)?;
            files.push((relative, path));
        }
        files.sort();

        for (display_name, path) in files {
            let versions = set.entry(AssetKey::new(&display_name)).or_default();
            if versions.iter().any(|v| v.source == *source) {
                tracing::warn!(
                    "{} has two files for asset '{}', ignoring {}",
                    source,
                    display_name,
                    path
                );
                continue;
            }
            versions.push(ModFileInfo {
                source: *source,
                path,
                display_name,
            });
        }
    }

    for versions in set.values_mut() {
        versions.sort_by_key(|v| v.source);
    }

    Ok(set)
}

fn relative_display(root: &Utf8Path, path: &Utf8Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| format!("{} is not under {}", path, root))?;
    Ok(relative
        .components()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join("/"))
}
