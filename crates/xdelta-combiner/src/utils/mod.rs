use crate::errors::CliError;
use camino::Utf8Path;
use miette::Result;
use xdc_core::{CombinerConfig, HashCache, WorkspaceLayout};

#[macro_export]
macro_rules! println_pad {
    ($($arg:tt)*) => {{
        let __s = format!($($arg)*);
        for __line in __s.lines() {
            println!("    {}", __line);
        }
    }};
}

/// Load and check the combiner config at `path`.
pub fn load_config(path: &Utf8Path) -> Result<CombinerConfig> {
    if !path.exists() {
        return Err(CliError::config_not_found(path.to_path_buf()).into());
    }

    let config = CombinerConfig::load(path)
        .map_err(|e| CliError::config_parse_error(path.to_path_buf(), e))?;
    if config.chapters.is_empty() {
        return Err(CliError::NoChapters.into());
    }

    Ok(config)
}

/// Load the digest snapshot kept under the output directory, or start empty.
pub fn load_hashes(layout: &WorkspaceLayout) -> HashCache {
    HashCache::load(&layout.hash_cache_path())
}

/// Persist the digest snapshot. Failures only cost a rehash next run.
pub fn save_hashes(layout: &WorkspaceLayout, hashes: &HashCache) {
    let path = layout.hash_cache_path();
    if let Err(e) = hashes.save(&path) {
        tracing::warn!("Failed to save hash cache to {}: {}", path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn utf8(temp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap()
    }

    #[test]
    fn missing_config_is_reported() {
        let temp = TempDir::new().unwrap();
        let err = load_config(&utf8(&temp).join("combiner.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn config_without_chapters_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = utf8(&temp).join("combiner.toml");
        std::fs::write(&path, "output_dir = \"out\"\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert_eq!(err.to_string(), "No chapters configured");
    }

    #[test]
    fn loads_a_chapter() {
        let temp = TempDir::new().unwrap();
        let path = utf8(&temp).join("combiner.toml");
        std::fs::write(
            &path,
            "output_dir = \"out\"\n\n[[chapters]]\nname = \"chapter1\"\nvanilla = \"data.win\"\nmods = [\"a.win\"]\n",
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.chapters.len(), 1);
        assert_eq!(config.chapters[0].mods.len(), 1);
    }

    #[test]
    fn hash_snapshot_round_trips_through_the_layout() {
        let temp = TempDir::new().unwrap();
        let root = utf8(&temp);
        let file = root.join("data.win");
        std::fs::write(&file, b"vanilla").unwrap();

        let layout = WorkspaceLayout::new(root.join("out"));
        let hashes = HashCache::new();
        let digest = hashes.digest(&file).unwrap();
        save_hashes(&layout, &hashes);

        let loaded = load_hashes(&layout);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.digest(&file).unwrap(), digest);
        assert_eq!(loaded.computations(), 0);
    }
}
