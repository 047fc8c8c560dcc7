//! Per-asset diff and merge of one chapter.
//!
//! The [`ModCombiner`] compares every mod tree of a chapter against the vanilla tree
//! and writes the combined result into the merged slot (`1/`).
//!
//! # Merge Algorithm
//!
//! For every [`AssetKey`] in the union of all trees:
//!
//! 1. Split its versions into the vanilla version and mod versions.
//! 2. Without a vanilla version every mod version counts as different (new asset).
//!    Otherwise each mod version is compared against vanilla: images with
//!    [`images_differ`], everything else by content digest. A failed comparison counts
//!    as different.
//! 3. No differing version: the asset is left out of the merged tree.
//! 4. One differing version: adopted as is.
//! 5. Several differing versions, by [`AssetKind`]:
//!    - new object definitions, audio and other binaries: highest mod wins.
//!    - images: highest mod with a decodable image, else a decodable vanilla, else
//!      the lowest mod.
//!    - text: merged by [`GitService::merge_text`] with vanilla as ancestor.
//!
//! The asset order list goes through [`merge_asset_orders`] instead. Every changed
//! asset is listed with its digest in `modifiedAssets.txt`, and chapter-level flags are
//! stored in a [`ChangeStamp`].

use crate::asset::{collect_versions, AssetKey, AssetKind, ModFileInfo};
use crate::asset_order::{
    find_duplicates, merge_asset_orders, read_asset_order, write_asset_order,
};
use crate::config::CombinerConfig;
use crate::error::{Error, Result};
use crate::file_linker::link_or_copy;
use crate::git_merge::{GitService, MergeStrategy};
use crate::hash_cache::{digest_bytes, HashCache};
use crate::image_compare::{images_differ, is_valid_image};
use crate::layout::{SourceId, WorkspaceLayout, ASSET_ORDER_FILE_NAME};
use crate::tool::ToolRunner;
use camino::Utf8Path;
use rayon::prelude::*;
use std::fmt::Write as _;
use std::fs;
use std::str::FromStr;
use std::sync::Arc;

const MANIFEST_HEADER_NAME: &str = "Asset Name";
const MANIFEST_HEADER_HASH: &str = "Hash (SHA1 in Base64)";
const MANIFEST_NAME_WIDTH: usize = 32;

/// One changed asset in the merged tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Path relative to `Objects/`, or `AssetOrder.txt` for the asset order list.
    pub name: String,
    pub digest: String,
}

/// Chapter-level summary of a combine run.
///
/// Stored as `changedCount|codeChanged|spriteChanged|assetOrderChanged`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeStamp {
    pub changed_count: usize,
    pub code_changed: bool,
    pub sprite_changed: bool,
    pub asset_order_changed: bool,
}

impl ChangeStamp {
    /// Whether the merged tree equals vanilla, so later stages have nothing to import.
    pub fn is_unchanged(&self) -> bool {
        self.changed_count == 0
            && !self.code_changed
            && !self.sprite_changed
            && !self.asset_order_changed
    }

    /// Read a stamp file. A missing file is `None`.
    pub fn load(path: &Utf8Path) -> Result<Option<Self>> {
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        content
            .parse()
            .map(Some)
            .map_err(|e| Error::Other(format!("invalid change stamp {}: {}", path, e)))
    }

    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_string())?;
        Ok(())
    }
}

impl std::fmt::Display for ChangeStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.changed_count,
            u8::from(self.code_changed),
            u8::from(self.sprite_changed),
            u8::from(self.asset_order_changed)
        )
    }
}

impl FromStr for ChangeStamp {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('|').collect();
        let [count, code, sprite, order] = parts.as_slice() else {
            return Err(format!("expected 4 fields, found {}", parts.len()));
        };
        let flag = |value: &str| match value {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(format!("invalid flag '{}'", other)),
        };
        Ok(Self {
            changed_count: count
                .parse()
                .map_err(|_| format!("invalid count '{}'", count))?,
            code_changed: flag(*code)?,
            sprite_changed: flag(*sprite)?,
            asset_order_changed: flag(*order)?,
        })
    }
}

/// A text merge that fell back to highest-mod-wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFallback {
    pub asset: String,
    pub winner: SourceId,
    pub dropped: Vec<SourceId>,
}

/// An asset that could not be resolved. The rest of the chapter is unaffected.
#[derive(Debug, Clone)]
pub struct AssetFailure {
    pub asset: String,
    pub message: String,
}

/// Summary returned by [`ModCombiner::combine_chapter`].
#[derive(Debug, Clone)]
pub struct CombineReport {
    pub chapter: String,
    /// Changed assets sorted by asset key; the asset order entry comes last.
    pub entries: Vec<ManifestEntry>,
    pub stamp: ChangeStamp,
    pub failures: Vec<AssetFailure>,
    pub fallbacks: Vec<TextFallback>,
    /// Identifiers listed more than once in the merged asset order.
    pub asset_order_duplicates: Vec<String>,
}

/// How one asset ended up in the merged tree.
struct Resolved {
    key: AssetKey,
    entry: ManifestEntry,
    fallback: Option<TextFallback>,
}

/// Diff and merge engine for the trees of one chapter.
pub struct ModCombiner {
    layout: WorkspaceLayout,
    hashes: Arc<HashCache>,
    git: GitService,
}

impl ModCombiner {
    pub fn new(layout: WorkspaceLayout, hashes: Arc<HashCache>, git: GitService) -> Self {
        Self {
            layout,
            hashes,
            git,
        }
    }

    /// Build a combiner from the configuration, running git through `runner`.
    pub fn from_config(
        config: &CombinerConfig,
        hashes: Arc<HashCache>,
        runner: Arc<dyn ToolRunner>,
    ) -> Result<Self> {
        let layout = WorkspaceLayout::from_config(config)?;
        let git = GitService::new(runner, config.tools.git.clone(), config.tools.merge_timeout());
        Ok(Self::new(layout, hashes, git))
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    /// Compare `mod_count` mod trees (slots `2..`) of `chapter` against vanilla and write
    /// the merged tree, `modifiedAssets.txt` and `changes.stamp` into slot 1.
    ///
    /// Failures of individual assets are reported, never returned.
    pub fn combine_chapter(&self, chapter: &str, mod_count: usize) -> Result<CombineReport> {
        let mods: Vec<SourceId> = (0..mod_count).map(SourceId::for_mod_index).collect();
        tracing::info!("Combining chapter {} ({} mods)", chapter, mods.len());

        let merged_slot = self.layout.slot_dir(chapter, SourceId::MERGED);
        let merged_objects = self.layout.objects_dir(chapter, SourceId::MERGED);
        if merged_objects.as_std_path().exists() {
            fs::remove_dir_all(&merged_objects)?;
        }
        fs::create_dir_all(&merged_objects)?;

        let mut trees = vec![(
            SourceId::VANILLA,
            self.layout.objects_dir(chapter, SourceId::VANILLA),
        )];
        trees.extend(
            mods.iter()
                .map(|source| (*source, self.layout.objects_dir(chapter, *source))),
        );
        let versions = collect_versions(&trees)?;
        tracing::info!("Chapter {}: {} distinct assets", chapter, versions.len());

        let outcomes: Vec<(AssetKey, Result<Option<Resolved>>)> = versions
            .par_iter()
            .map(|(key, versions)| {
                let outcome = self.resolve_asset(key, versions, &merged_objects);
                (key.clone(), outcome)
            })
            .collect();

        let mut resolved: Vec<Resolved> = Vec::new();
        let mut failures = Vec::new();
        for (key, outcome) in outcomes {
            match outcome {
                Ok(Some(r)) => resolved.push(r),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Chapter {}: failed to merge '{}': {}", chapter, key, e);
                    failures.push(AssetFailure {
                        asset: key.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        resolved.sort_by(|a, b| a.key.cmp(&b.key));

        let mut stamp = ChangeStamp {
            changed_count: resolved.len(),
            code_changed: resolved.iter().any(|r| r.key.is_code()),
            sprite_changed: resolved.iter().any(|r| r.key.is_sprite()),
            asset_order_changed: false,
        };
        let fallbacks: Vec<TextFallback> =
            resolved.iter().filter_map(|r| r.fallback.clone()).collect();
        let mut entries: Vec<ManifestEntry> = resolved.into_iter().map(|r| r.entry).collect();

        let order_path = merged_slot.join(ASSET_ORDER_FILE_NAME);
        let vanilla_order = read_asset_order(&self.layout.asset_order_path(chapter, SourceId::VANILLA))?;
        let mut mod_orders = Vec::with_capacity(mods.len());
        for source in &mods {
            let order = read_asset_order(&self.layout.asset_order_path(chapter, *source))?;
            mod_orders.push((*source, order));
        }
        let order_merge = merge_asset_orders(vanilla_order.as_deref(), &mod_orders);
        let asset_order_duplicates = find_duplicates(&order_merge.order);
        for duplicate in &asset_order_duplicates {
            tracing::warn!("Chapter {}: '{}' is listed twice in the asset order", chapter, duplicate);
        }

        if order_merge.changed {
            write_asset_order(&order_path, &order_merge.order)?;
            let content = fs::read(&order_path)?;
            entries.push(ManifestEntry {
                name: ASSET_ORDER_FILE_NAME.to_string(),
                digest: digest_bytes(&content),
            });
            stamp.asset_order_changed = true;
            stamp.changed_count += 1;
        } else if order_path.as_std_path().exists() {
            fs::remove_file(&order_path)?;
        }

        write_manifest(&self.layout.modified_assets_path(chapter), &entries)?;
        stamp.save(&self.layout.change_stamp_path(chapter))?;

        tracing::info!(
            "Chapter {}: {} changed (code: {}, sprites: {}, asset order: {}), {} failures",
            chapter,
            stamp.changed_count,
            stamp.code_changed,
            stamp.sprite_changed,
            stamp.asset_order_changed,
            failures.len()
        );

        Ok(CombineReport {
            chapter: chapter.to_string(),
            entries,
            stamp,
            failures,
            fallbacks,
            asset_order_duplicates,
        })
    }

    fn resolve_asset(
        &self,
        key: &AssetKey,
        versions: &[ModFileInfo],
        merged_objects: &Utf8Path,
    ) -> Result<Option<Resolved>> {
        let vanilla = versions.iter().find(|v| v.source.is_vanilla());
        let mods: Vec<&ModFileInfo> = versions.iter().filter(|v| v.source.is_mod()).collect();

        let differing: Vec<&ModFileInfo> = match vanilla {
            None => mods,
            Some(vanilla) => mods
                .into_iter()
                .filter(|m| self.differs(key, vanilla, m))
                .collect(),
        };

        let Some(highest) = differing.last().copied() else {
            return Ok(None);
        };

        let name = vanilla.unwrap_or(highest).display_name.clone();
        let destination = merged_objects.join(&name);

        if differing.len() == 1 {
            tracing::debug!("'{}': adopting {}", name, highest.source);
            return self.adopt(key, name, highest, &destination).map(Some);
        }

        match key.kind() {
            AssetKind::NewObject | AssetKind::Audio | AssetKind::Binary => {
                tracing::debug!("'{}': {} differing versions, {} wins", name, differing.len(), highest.source);
                self.adopt(key, name, highest, &destination).map(Some)
            }
            AssetKind::Image => {
                let chosen = pick_image(vanilla, &differing);
                tracing::debug!("'{}': using image from {}", name, chosen.source);
                self.adopt(key, name, chosen, &destination).map(Some)
            }
            AssetKind::Text => self.merge_text(key, name, vanilla, &differing, &destination),
        }
    }

    fn differs(&self, key: &AssetKey, vanilla: &ModFileInfo, modded: &ModFileInfo) -> bool {
        if key.kind() == AssetKind::Image {
            return images_differ(&self.hashes, &vanilla.path, &modded.path);
        }
        match (self.hashes.digest(&vanilla.path), self.hashes.digest(&modded.path)) {
            (Ok(a), Ok(b)) => a != b,
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Cannot compare '{}' of {}: {}", key, modded.source, e);
                true
            }
        }
    }

    fn adopt(
        &self,
        key: &AssetKey,
        name: String,
        version: &ModFileInfo,
        destination: &Utf8Path,
    ) -> Result<Resolved> {
        link_or_copy(&version.path, destination)?;
        let digest = self.hashes.digest(&version.path)?;
        Ok(Resolved {
            key: key.clone(),
            entry: ManifestEntry { name, digest },
            fallback: None,
        })
    }

    fn merge_text(
        &self,
        key: &AssetKey,
        name: String,
        vanilla: Option<&ModFileInfo>,
        differing: &[&ModFileInfo],
        destination: &Utf8Path,
    ) -> Result<Option<Resolved>> {
        let ancestor = match vanilla {
            Some(v) => read_text(&v.path)?,
            None => Some(String::new()),
        };

        let mut heads = Vec::with_capacity(differing.len());
        for version in differing {
            match read_text(&version.path)? {
                Some(text) => heads.push((version.source, text)),
                None => {
                    heads.clear();
                    break;
                }
            }
        }

        let (Some(ancestor), false) = (ancestor, heads.is_empty()) else {
            let highest = differing[differing.len() - 1];
            tracing::warn!("'{}' is not valid UTF-8, {} wins", name, highest.source);
            let mut resolved = self.adopt(key, name.clone(), highest, destination)?;
            resolved.fallback = Some(TextFallback {
                asset: name,
                winner: highest.source,
                dropped: differing[..differing.len() - 1].iter().map(|v| v.source).collect(),
            });
            return Ok(Some(resolved));
        };

        let outcome = self.git.merge_text(&name, &ancestor, &heads);

        // The destination may be a hard link into a mod tree; never write through it.
        if destination.as_std_path().exists() {
            fs::remove_file(destination)?;
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(destination, outcome.text.as_bytes())?;

        let fallback = match outcome.strategy {
            MergeStrategy::ThreeWay => None,
            MergeStrategy::HighestWins => Some(TextFallback {
                asset: name.clone(),
                winner: differing[differing.len() - 1].source,
                dropped: outcome.dropped,
            }),
        };

        Ok(Some(Resolved {
            key: key.clone(),
            entry: ManifestEntry {
                name,
                digest: digest_bytes(outcome.text.as_bytes()),
            },
            fallback,
        }))
    }
}

/// Read a text asset. Non UTF-8 content is `None`.
fn read_text(path: &Utf8Path) -> Result<Option<String>> {
    let bytes = fs::read(path)?;
    Ok(String::from_utf8(bytes).ok())
}

/// Highest valid differing image, else valid vanilla, else lowest differing version.
fn pick_image<'a>(
    vanilla: Option<&'a ModFileInfo>,
    differing: &[&'a ModFileInfo],
) -> &'a ModFileInfo {
    if let Some(valid) = differing.iter().rev().copied().find(|v| is_valid_image(&v.path)) {
        return valid;
    }
    if let Some(vanilla) = vanilla.filter(|v| is_valid_image(&v.path)) {
        tracing::warn!("No mod has a valid '{}', keeping vanilla", vanilla.display_name);
        return vanilla;
    }
    differing[0]
}

/// Write `modifiedAssets.txt`.
pub fn write_manifest(path: &Utf8Path, entries: &[ManifestEntry]) -> Result<()> {
    let mut content = String::new();
    let _ = writeln!(
        content,
        "{:<width$} {}",
        MANIFEST_HEADER_NAME,
        MANIFEST_HEADER_HASH,
        width = MANIFEST_NAME_WIDTH
    );
    for entry in entries {
        let _ = writeln!(
            content,
            "{:<width$} {}",
            entry.name,
            entry.digest,
            width = MANIFEST_NAME_WIDTH
        );
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

/// Read back `modifiedAssets.txt`.
pub fn read_manifest(path: &Utf8Path) -> Result<Vec<ManifestEntry>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let (name, digest) = line.trim_end().rsplit_once(' ')?;
            Some(ManifestEntry {
                name: name.trim_end().to_string(),
                digest: digest.to_string(),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{ToolInvocation, ToolOutput};
    use camino::Utf8PathBuf;
    use image::{Rgba, RgbaImage};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Runner for which every executable is missing.
    struct NoTools;

    impl ToolRunner for NoTools {
        fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
            Err(Error::ToolNotFound {
                program: invocation.program_name(),
            })
        }
    }

    struct Fixture {
        _temp: TempDir,
        layout: WorkspaceLayout,
        combiner: ModCombiner,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
            let layout = WorkspaceLayout::new(root);
            let git = GitService::new(Arc::new(NoTools), "git", Duration::from_secs(5));
            let combiner = ModCombiner::new(layout.clone(), Arc::new(HashCache::new()), git);
            Self {
                _temp: temp,
                layout,
                combiner,
            }
        }

        fn write(&self, slot: SourceId, relative: &str, content: &[u8]) -> Utf8PathBuf {
            let path = self.layout.objects_dir("ch1", slot).join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            path
        }

        fn png(&self, slot: SourceId, relative: &str, color: [u8; 4]) {
            let path = self.layout.objects_dir("ch1", slot).join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            RgbaImage::from_pixel(2, 2, Rgba(color))
                .save(path.as_std_path())
                .unwrap();
        }

        fn merged(&self, relative: &str) -> Utf8PathBuf {
            self.layout.objects_dir("ch1", SourceId::MERGED).join(relative)
        }
    }

    #[test]
    fn test_unchanged_assets_are_left_out() {
        let fx = Fixture::new();
        fx.write(SourceId::VANILLA, "CodeEntries/a.gml", b"same");
        fx.write(SourceId(2), "CodeEntries/a.gml", b"same");

        let report = fx.combiner.combine_chapter("ch1", 1).unwrap();

        assert!(report.entries.is_empty());
        assert!(report.stamp.is_unchanged());
        assert!(!fx.merged("CodeEntries/a.gml").as_std_path().exists());
        assert_eq!(
            ChangeStamp::load(&fx.layout.change_stamp_path("ch1")).unwrap(),
            Some(ChangeStamp::default())
        );
    }

    #[test]
    fn test_single_change_is_adopted_and_new_assets_included() {
        let fx = Fixture::new();
        fx.write(SourceId::VANILLA, "CodeEntries/a.gml", b"vanilla");
        fx.write(SourceId(2), "CodeEntries/a.gml", b"vanilla");
        fx.write(SourceId(3), "CodeEntries/a.gml", b"changed");
        fx.write(SourceId(2), "Fonts/new.bin", b"\x00\x01");

        let report = fx.combiner.combine_chapter("ch1", 2).unwrap();

        let names: Vec<&str> = report.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["CodeEntries/a.gml", "Fonts/new.bin"]);
        assert_eq!(fs::read(fx.merged("CodeEntries/a.gml")).unwrap(), b"changed");
        assert_eq!(report.entries[0].digest, digest_bytes(b"changed"));
        assert!(report.stamp.code_changed);
        assert!(!report.stamp.sprite_changed);
        assert_eq!(report.stamp.changed_count, 2);
    }

    #[test]
    fn test_binary_conflict_highest_mod_wins() {
        let fx = Fixture::new();
        fx.write(SourceId::VANILLA, "Sounds/hit.ogg", b"v");
        fx.write(SourceId(2), "Sounds/hit.ogg", b"two");
        fx.write(SourceId(3), "Sounds/hit.ogg", b"three");
        fx.write(SourceId::VANILLA, "NewObjects/obj.json", b"{}");
        fx.write(SourceId(2), "NewObjects/obj.json", b"{\"a\":1}");
        fx.write(SourceId(3), "NewObjects/obj.json", b"{\"b\":2}");

        fx.combiner.combine_chapter("ch1", 2).unwrap();

        assert_eq!(fs::read(fx.merged("Sounds/hit.ogg")).unwrap(), b"three");
        assert_eq!(fs::read(fx.merged("NewObjects/obj.json")).unwrap(), b"{\"b\":2}");
    }

    #[test]
    fn test_sprite_selection_skips_corrupt_higher_mod() {
        let fx = Fixture::new();
        fx.png(SourceId::VANILLA, "Sprites/spr_a_0.png", [0, 0, 0, 255]);
        fx.png(SourceId(2), "Sprites/spr_a_0.png", [255, 0, 0, 255]);
        fx.write(SourceId(3), "Sprites/spr_a_0.png", b"\x89PNG corrupt");

        let report = fx.combiner.combine_chapter("ch1", 2).unwrap();

        let mod_one = fx.layout.objects_dir("ch1", SourceId(2)).join("Sprites/spr_a_0.png");
        assert_eq!(
            fs::read(fx.merged("Sprites/spr_a_0.png")).unwrap(),
            fs::read(&mod_one).unwrap()
        );
        assert!(report.stamp.sprite_changed);
    }

    #[test]
    fn test_text_conflict_without_git_falls_back_to_highest() {
        let fx = Fixture::new();
        fx.write(SourceId::VANILLA, "CodeEntries/a.gml", b"a\nb\n");
        fx.write(SourceId(2), "CodeEntries/a.gml", b"A\nb\n");
        fx.write(SourceId(3), "CodeEntries/a.gml", b"a\nB\n");

        let report = fx.combiner.combine_chapter("ch1", 2).unwrap();

        assert_eq!(fs::read(fx.merged("CodeEntries/a.gml")).unwrap(), b"a\nB\n");
        assert_eq!(
            report.fallbacks,
            vec![TextFallback {
                asset: "CodeEntries/a.gml".to_string(),
                winner: SourceId(3),
                dropped: vec![SourceId(2)],
            }]
        );
    }

    #[test]
    fn test_merged_text_does_not_write_through_hard_links() {
        let fx = Fixture::new();
        fx.write(SourceId::VANILLA, "CodeEntries/a.gml", b"v\n");
        let mod_file = fx.write(SourceId(3), "CodeEntries/a.gml", b"three\n");
        fx.write(SourceId(2), "CodeEntries/a.gml", b"two\n");

        // Leftover from an earlier run that linked mod 3's file into the merged tree.
        link_or_copy(&mod_file, &fx.merged("CodeEntries/a.gml")).unwrap();
        fx.combiner.combine_chapter("ch1", 2).unwrap();

        assert_eq!(fs::read(&mod_file).unwrap(), b"three\n");
    }

    #[test]
    fn test_asset_order_and_manifest() {
        let fx = Fixture::new();
        let order = |slot: SourceId, content: &str| {
            let path = fx.layout.asset_order_path("ch1", slot);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        };
        order(SourceId::VANILLA, "A\nB\n");
        order(SourceId(2), "A\nB\n");
        order(SourceId(3), "A\nX\nB\n");
        fx.write(SourceId::VANILLA, "CodeEntries/a.gml", b"v");
        fx.write(SourceId(2), "CodeEntries/a.gml", b"m");

        let report = fx.combiner.combine_chapter("ch1", 2).unwrap();

        assert!(report.stamp.asset_order_changed);
        assert_eq!(report.stamp.changed_count, 2);
        assert_eq!(
            fs::read_to_string(fx.layout.asset_order_path("ch1", SourceId::MERGED)).unwrap(),
            "A\nX\nB\n"
        );

        let manifest_path = fx.layout.modified_assets_path("ch1");
        let text = fs::read_to_string(&manifest_path).unwrap();
        assert!(text.starts_with("Asset Name                       Hash (SHA1 in Base64)\n"));
        assert_eq!(read_manifest(&manifest_path).unwrap(), report.entries);
        assert_eq!(report.entries[1].name, "AssetOrder.txt");
    }

    fn info(fx: &Fixture, slot: SourceId, relative: &str) -> ModFileInfo {
        ModFileInfo {
            source: slot,
            path: fx.layout.objects_dir("ch1", slot).join(relative),
            display_name: relative.to_string(),
        }
    }

    #[test]
    fn test_corrupt_mod_images_keep_valid_vanilla() {
        let fx = Fixture::new();
        let name = "Sprites/spr_a_0.png";
        fx.png(SourceId::VANILLA, name, [1, 2, 3, 255]);
        fx.write(SourceId(2), name, b"not a png");
        fx.write(SourceId(3), name, b"\x89PNG truncated");

        let vanilla = info(&fx, SourceId::VANILLA, name);
        let two = info(&fx, SourceId(2), name);
        let three = info(&fx, SourceId(3), name);

        let picked = pick_image(Some(&vanilla), &[&two, &three]);
        assert_eq!(picked.source, SourceId::VANILLA);
    }

    #[test]
    fn test_no_valid_image_takes_lowest_mod() {
        let fx = Fixture::new();
        let name = "Sprites/spr_a_0.png";
        fx.write(SourceId::VANILLA, name, b"broken vanilla");
        fx.write(SourceId(2), name, b"broken two");
        fx.write(SourceId(3), name, b"broken three");

        let vanilla = info(&fx, SourceId::VANILLA, name);
        let two = info(&fx, SourceId(2), name);
        let three = info(&fx, SourceId(3), name);

        assert_eq!(pick_image(Some(&vanilla), &[&two, &three]).source, SourceId(2));
        assert_eq!(pick_image(None, &[&two, &three]).source, SourceId(2));
    }

    #[test]
    fn test_highest_valid_mod_image_wins() {
        let fx = Fixture::new();
        let name = "Sprites/spr_a_0.png";
        fx.png(SourceId::VANILLA, name, [0, 0, 0, 255]);
        fx.png(SourceId(2), name, [2, 2, 2, 255]);
        fx.write(SourceId(3), name, b"broken three");

        let vanilla = info(&fx, SourceId::VANILLA, name);
        let two = info(&fx, SourceId(2), name);
        let three = info(&fx, SourceId(3), name);

        assert_eq!(pick_image(Some(&vanilla), &[&two, &three]).source, SourceId(2));
    }

    #[test]
    fn test_change_stamp_format() {
        let stamp = ChangeStamp {
            changed_count: 12,
            code_changed: true,
            sprite_changed: false,
            asset_order_changed: true,
        };
        assert_eq!(stamp.to_string(), "12|1|0|1");
        assert_eq!("12|1|0|1\n".parse::<ChangeStamp>().unwrap(), stamp);
        assert!("12|1|0".parse::<ChangeStamp>().is_err());
        assert!("x|1|0|1".parse::<ChangeStamp>().is_err());
        assert!(!stamp.is_unchanged());
    }
}
