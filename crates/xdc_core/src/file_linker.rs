//! Hardlink-or-copy file materialization.
//!
//! Working trees and the export cache hold many identical files. When source and
//! destination live on the same volume a hard link is used; otherwise (or when
//! linking fails for any reason) the file is copied.

use crate::error::Result;
use camino::{Utf8Path, Utf8PathBuf};
use std::io;
use std::thread;
use std::time::Duration;

/// Attempts made to remove a pre-existing destination before giving up on it.
const DELETE_ATTEMPTS: u32 = 5;
/// Attempts made to copy a file; the last failure is returned to the caller.
const COPY_ATTEMPTS: u32 = 4;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// How a file ended up at its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMethod {
    HardLink,
    Copy,
}

/// Materialize `src` at `dst`, hard linking when possible.
///
/// 1. Create the destination's parent directory.
/// 2. Remove any existing destination, retrying while it is locked. A destination that
///    cannot be removed is left for the link/copy step to overwrite or fail on.
/// 3. Hard link if `src` and `dst` share a volume.
/// 4. Fall back to a copy, retried with backoff on transient errors.
pub fn link_or_copy(src: &Utf8Path, dst: &Utf8Path) -> Result<LinkMethod> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent.as_std_path())?;
    }

    remove_existing(dst);

    if same_volume(src, dst) {
        match std::fs::hard_link(src.as_std_path(), dst.as_std_path()) {
            Ok(()) => return Ok(LinkMethod::HardLink),
            Err(e) => {
                tracing::debug!("Hard link {} -> {} failed ({}), copying", src, dst, e);
            }
        }
    }

    copy_with_retry(src, dst)?;
    Ok(LinkMethod::Copy)
}

/// Give `path` its own copy of its data if other hard links share it.
///
/// The data is copied next to `path` and renamed over it, so the other links keep the
/// original contents. Returns whether the file was detached.
pub fn detach(path: &Utf8Path) -> Result<bool> {
    if !is_shared(path)? {
        return Ok(false);
    }

    let private = Utf8PathBuf::from(format!("{}.detach", path));
    copy_with_retry(path, &private)?;
    if let Err(e) = std::fs::rename(private.as_std_path(), path.as_std_path()) {
        let _ = std::fs::remove_file(private.as_std_path());
        return Err(e.into());
    }
    Ok(true)
}

#[cfg(unix)]
fn is_shared(path: &Utf8Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    Ok(std::fs::metadata(path.as_std_path())?.nlink() > 1)
}

// Link counts are not exposed on stable elsewhere; treat every file as shared.
#[cfg(not(unix))]
fn is_shared(path: &Utf8Path) -> io::Result<bool> {
    std::fs::metadata(path.as_std_path()).map(|_| true)
}

fn remove_existing(dst: &Utf8Path) {
    for attempt in 1..=DELETE_ATTEMPTS {
        match std::fs::remove_file(dst.as_std_path()) {
            Ok(()) => return,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::debug!(
                    "Removing existing {} failed (attempt {}/{}): {}",
                    dst,
                    attempt,
                    DELETE_ATTEMPTS,
                    e
                );
                thread::sleep(RETRY_BASE_DELAY * attempt);
            }
        }
    }
    tracing::warn!("Could not remove existing file {}, overwriting in place", dst);
}

fn copy_with_retry(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    let mut attempt = 1;
    loop {
        match std::fs::copy(src.as_std_path(), dst.as_std_path()) {
            Ok(_) => return Ok(()),
            Err(e) if attempt < COPY_ATTEMPTS && is_transient(&e) => {
                tracing::debug!(
                    "Copy {} -> {} failed (attempt {}/{}): {}",
                    src,
                    dst,
                    attempt,
                    COPY_ATTEMPTS,
                    e
                );
                thread::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt - 1));
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Errors that typically clear up once another process releases the file.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
    )
}

#[cfg(unix)]
fn same_volume(src: &Utf8Path, dst: &Utf8Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let Some(dst_dir) = dst.parent() else {
        return false;
    };
    match (
        std::fs::metadata(src.as_std_path()),
        std::fs::metadata(dst_dir.as_std_path()),
    ) {
        (Ok(a), Ok(b)) => a.dev() == b.dev(),
        _ => false,
    }
}

#[cfg(windows)]
fn same_volume(src: &Utf8Path, dst: &Utf8Path) -> bool {
    fn volume_root(path: &Utf8Path) -> Option<String> {
        let absolute = std::path::absolute(path.as_std_path()).ok()?;
        match absolute.components().next()? {
            std::path::Component::Prefix(prefix) => {
                Some(prefix.as_os_str().to_string_lossy().to_ascii_lowercase())
            }
            _ => None,
        }
    }

    match (volume_root(src), volume_root(dst)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(not(any(unix, windows)))]
fn same_volume(_src: &Utf8Path, _dst: &Utf8Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn utf8(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    #[test]
    fn test_creates_parent_and_materializes() {
        let temp = TempDir::new().unwrap();
        let root = utf8(&temp);
        let src = root.join("src.txt");
        std::fs::write(&src, b"hello").unwrap();

        let dst = root.join("a/b/c/dst.txt");
        link_or_copy(&src, &dst).unwrap();

        assert_eq!(std::fs::read(&dst).unwrap(), b"hello");
    }

    #[cfg(unix)]
    #[test]
    fn test_same_volume_uses_hard_link() {
        let temp = TempDir::new().unwrap();
        let root = utf8(&temp);
        let src = root.join("src.txt");
        std::fs::write(&src, b"hello").unwrap();

        let method = link_or_copy(&src, &root.join("dst.txt")).unwrap();
        assert_eq!(method, LinkMethod::HardLink);
    }

    #[test]
    fn test_replaces_existing_destination() {
        let temp = TempDir::new().unwrap();
        let root = utf8(&temp);
        let src = root.join("src.txt");
        let dst = root.join("dst.txt");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dst, b"old contents").unwrap();

        link_or_copy(&src, &dst).unwrap();

        assert_eq!(std::fs::read(&dst).unwrap(), b"new");
    }

    #[test]
    fn test_detach_leaves_other_links_untouched() {
        let temp = TempDir::new().unwrap();
        let root = utf8(&temp);
        let cached = root.join("cache/a.txt");
        std::fs::create_dir_all(cached.parent().unwrap()).unwrap();
        std::fs::write(&cached, b"cached").unwrap();

        let working = root.join("work/a.txt");
        link_or_copy(&cached, &working).unwrap();

        assert!(detach(&working).unwrap());
        std::fs::write(&working, b"rewritten").unwrap();

        assert_eq!(std::fs::read(&cached).unwrap(), b"cached");
        assert_eq!(std::fs::read(&working).unwrap(), b"rewritten");
        assert!(!root.join("work/a.txt.detach").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_detach_skips_unshared_files() {
        let temp = TempDir::new().unwrap();
        let root = utf8(&temp);
        let file = root.join("solo.txt");
        std::fs::write(&file, b"solo").unwrap();

        assert!(!detach(&file).unwrap());
        assert_eq!(std::fs::read(&file).unwrap(), b"solo");
    }

    #[test]
    fn test_missing_source_surfaces_error() {
        let temp = TempDir::new().unwrap();
        let root = utf8(&temp);

        let result = link_or_copy(&root.join("missing.txt"), &root.join("dst.txt"));
        assert!(result.is_err());
    }
}
