//! Merging of the per-chapter `AssetOrder.txt` list.
//!
//! The asset order is a single ordered list of identifiers rather than a tree of files,
//! so it cannot go through the per-asset merge. Each mod's list is replayed on top of
//! vanilla's: identifiers the merged list does not know yet are placed next to the
//! closest neighbour the mod itself put them beside.

use crate::error::Result;
use crate::layout::SourceId;
use camino::Utf8Path;
use std::collections::HashSet;
use std::fs;

/// Result of merging the asset order of one chapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetOrderMerge {
    pub order: Vec<String>,
    /// Whether `order` differs from vanilla's list.
    pub changed: bool,
    /// Mods whose list differed from vanilla's.
    pub contributors: Vec<SourceId>,
}

/// Read an asset order file, one identifier per line. Blank lines are ignored.
///
/// Returns `None` when the file does not exist.
pub fn read_asset_order(path: &Utf8Path) -> Result<Option<Vec<String>>> {
    if !path.as_std_path().exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    Ok(Some(parse_asset_order(&content)))
}

pub fn parse_asset_order(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn write_asset_order(path: &Utf8Path, order: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut content = String::with_capacity(order.iter().map(|e| e.len() + 1).sum());
    for entry in order {
        content.push_str(entry);
        content.push('\n');
    }
    fs::write(path, content)?;
    Ok(())
}

/// Merge the asset order lists of every mod of a chapter against vanilla's.
///
/// `mods` may be given in any order; they are replayed in increasing source order. A mod
/// without a list (`None`) contributes nothing.
pub fn merge_asset_orders(
    vanilla: Option<&[String]>,
    mods: &[(SourceId, Option<Vec<String>>)],
) -> AssetOrderMerge {
    let base: Vec<String> = vanilla.map(<[String]>::to_vec).unwrap_or_default();

    let mut differing: Vec<(SourceId, &[String])> = mods
        .iter()
        .filter_map(|(source, order)| order.as_deref().map(|order| (*source, order)))
        .filter(|(_, order)| *order != base.as_slice())
        .collect();
    differing.sort_by_key(|(source, _)| *source);

    let contributors: Vec<SourceId> = differing.iter().map(|(source, _)| *source).collect();

    match differing.as_slice() {
        [] => AssetOrderMerge {
            order: base,
            changed: false,
            contributors,
        },
        [(source, only)] => {
            tracing::debug!("Adopting asset order of {} ({} entries)", source, only.len());
            AssetOrderMerge {
                order: only.to_vec(),
                changed: true,
                contributors,
            }
        }
        many => {
            let mut merged = base.clone();
            for (source, order) in many {
                let inserted = replay(&mut merged, order);
                tracing::debug!("Asset order of {} added {} entries", source, inserted);
            }

            let sources: Vec<&[String]> = many.iter().map(|(_, order)| *order).collect();
            let order = sanitize(merged, &base, &sources);
            let changed = order != base;
            AssetOrderMerge {
                order,
                changed,
                contributors,
            }
        }
    }
}

/// Insert every entry of `order` missing from `merged` beside its nearest known neighbour.
fn replay(merged: &mut Vec<String>, order: &[String]) -> usize {
    let mut present: HashSet<String> = merged.iter().cloned().collect();
    let mut inserted = 0;

    for (idx, entry) in order.iter().enumerate() {
        if present.contains(entry) {
            continue;
        }

        let before = order[..idx]
            .iter()
            .rev()
            .find(|candidate| present.contains(*candidate))
            .and_then(|anchor| merged.iter().position(|e| e == anchor));

        let position = match before {
            Some(anchor) => anchor + 1,
            None => order[idx + 1..]
                .iter()
                .find(|candidate| present.contains(*candidate))
                .and_then(|anchor| merged.iter().position(|e| e == anchor))
                .unwrap_or(merged.len()),
        };

        merged.insert(position, entry.clone());
        present.insert(entry.clone());
        inserted += 1;
    }

    inserted
}

/// Drop entries no source knows, append entries some source has that went missing, and
/// collapse duplicates keeping the first occurrence.
fn sanitize(merged: Vec<String>, vanilla: &[String], sources: &[&[String]]) -> Vec<String> {
    let known: HashSet<&str> = vanilla
        .iter()
        .chain(sources.iter().flat_map(|order| order.iter()))
        .map(String::as_str)
        .collect();

    let mut seen: HashSet<String> = HashSet::with_capacity(merged.len());
    let mut result = Vec::with_capacity(merged.len());
    for entry in merged {
        if !known.contains(entry.as_str()) {
            tracing::debug!("Dropping unknown asset order entry '{}'", entry);
            continue;
        }
        if seen.insert(entry.clone()) {
            result.push(entry);
        }
    }

    for entry in vanilla.iter().chain(sources.iter().flat_map(|order| order.iter())) {
        if seen.insert(entry.clone()) {
            tracing::debug!("Restoring missing asset order entry '{}'", entry);
            result.push(entry.clone());
        }
    }

    result
}

/// Entries that occur more than once, each reported once in order of first repetition.
pub fn find_duplicates(order: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    let mut duplicates = Vec::new();
    for entry in order {
        if !seen.insert(entry.as_str()) && reported.insert(entry.as_str()) {
            duplicates.push(entry.clone());
        }
    }
    duplicates
}
