//! Image-aware comparison and validity checks.
//!
//! Two exports of the same sprite are often byte-different while showing the same
//! pixels (encoder settings, metadata chunks), so image assets are compared by content
//! in several increasingly expensive steps. Whenever a step cannot decide, the images
//! are treated as different.

use crate::hash_cache::{digest_bytes, HashCache};
use camino::Utf8Path;
use std::fs;

const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

/// Whether `modded` shows a different image than `vanilla`.
///
/// Order of checks:
///
/// ```text
/// 1. file digests equal             -> same
/// 2. dimensions differ              -> different
/// 3. decoded RGBA pixels            -> decides
/// 4. PNG pixel data (IDAT) digests  -> same if equal
/// 5. file digests                   -> decides
/// ```
///
/// Any error along the way counts as different.
pub fn images_differ(hashes: &HashCache, vanilla: &Utf8Path, modded: &Utf8Path) -> bool {
    let digests = (hashes.digest(vanilla), hashes.digest(modded));
    if let (Ok(a), Ok(b)) = &digests {
        if a == b {
            return false;
        }
    }

    match (
        image::image_dimensions(vanilla.as_std_path()),
        image::image_dimensions(modded.as_std_path()),
    ) {
        (Ok(a), Ok(b)) if a != b => return true,
        _ => {}
    }

    match (
        image::open(vanilla.as_std_path()),
        image::open(modded.as_std_path()),
    ) {
        (Ok(a), Ok(b)) => return a.to_rgba8().as_raw() != b.to_rgba8().as_raw(),
        (Err(e), _) | (_, Err(e)) => {
            tracing::debug!("Cannot decode {} or {}: {}", vanilla, modded, e);
        }
    }

    if let (Some(a), Some(b)) = (png_pixel_digest(vanilla), png_pixel_digest(modded)) {
        if a == b {
            return false;
        }
    }

    match digests {
        (Ok(a), Ok(b)) => a != b,
        _ => true,
    }
}

/// Whether `path` decodes as an image.
pub fn is_valid_image(path: &Utf8Path) -> bool {
    let reader = match image::ImageReader::open(path.as_std_path()) {
        Ok(reader) => reader,
        Err(_) => return false,
    };
    match reader.with_guessed_format() {
        Ok(reader) => reader.decode().is_ok(),
        Err(_) => false,
    }
}

/// Digest of the concatenated `IDAT` chunk data of a PNG file.
///
/// Returns `None` if the file is unreadable, not a PNG, or its chunk list is truncated.
pub fn png_pixel_digest(path: &Utf8Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    let idat = png_idat_data(&bytes)?;
    Some(digest_bytes(&idat))
}

fn png_idat_data(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut rest = bytes.strip_prefix(PNG_SIGNATURE.as_slice())?;
    let mut data = Vec::new();

    while rest.len() >= 12 {
        let length = u32::from_be_bytes(rest[0..4].try_into().ok()?) as usize;
        let kind = &rest[4..8];
        let end = 8usize.checked_add(length)?.checked_add(4)?;
        if rest.len() < end {
            return None;
        }
        if kind == b"IDAT" {
            data.extend_from_slice(&rest[8..8 + length]);
        }
        if kind == b"IEND" {
            break;
        }
        rest = &rest[end..];
    }

    if data.is_empty() {
        None
    } else {
        Some(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use image::{Rgba, RgbaImage};
    use tempfile::TempDir;

    fn temp_root() -> (TempDir, Utf8PathBuf) {
        let temp = TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, root)
    }

    fn write_png(path: &Utf8Path, width: u32, height: u32, color: [u8; 4]) {
        RgbaImage::from_pixel(width, height, Rgba(color))
            .save(path.as_std_path())
            .unwrap();
    }

    /// Append a tEXt chunk after the signature so the bytes differ but pixels don't.
    fn with_text_chunk(bytes: &[u8]) -> Vec<u8> {
        let payload = b"Comment\0re-exported";
        let mut out = bytes[..8].to_vec();
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(b"tEXt");
        out.extend_from_slice(payload);
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.extend_from_slice(&bytes[8..]);
        out
    }

    #[test]
    fn test_identical_files_are_same() {
        let (_temp, root) = temp_root();
        let a = root.join("a.png");
        let b = root.join("b.png");
        write_png(&a, 4, 4, [255, 0, 0, 255]);
        fs::copy(&a, &b).unwrap();

        assert!(!images_differ(&HashCache::new(), &a, &b));
    }

    #[test]
    fn test_same_pixels_different_bytes_are_same() {
        let (_temp, root) = temp_root();
        let a = root.join("a.png");
        let b = root.join("b.png");
        write_png(&a, 4, 4, [0, 128, 0, 255]);
        fs::write(&b, with_text_chunk(&fs::read(&a).unwrap())).unwrap();

        assert!(!images_differ(&HashCache::new(), &a, &b));
    }

    #[test]
    fn test_different_dimensions_or_pixels_differ() {
        let (_temp, root) = temp_root();
        let a = root.join("a.png");
        let b = root.join("b.png");
        let c = root.join("c.png");
        write_png(&a, 4, 4, [0, 0, 255, 255]);
        write_png(&b, 8, 4, [0, 0, 255, 255]);
        write_png(&c, 4, 4, [0, 0, 254, 255]);

        let hashes = HashCache::new();
        assert!(images_differ(&hashes, &a, &b));
        assert!(images_differ(&hashes, &a, &c));
    }

    #[test]
    fn test_undecodable_image_is_different() {
        let (_temp, root) = temp_root();
        let a = root.join("a.png");
        let b = root.join("b.png");
        write_png(&a, 2, 2, [1, 2, 3, 255]);
        fs::write(&b, b"not an image").unwrap();

        assert!(images_differ(&HashCache::new(), &a, &b));
        assert!(images_differ(&HashCache::new(), &a, &root.join("missing.png")));
    }

    #[test]
    fn test_validity() {
        let (_temp, root) = temp_root();
        let good = root.join("good.png");
        let truncated = root.join("truncated.png");
        write_png(&good, 3, 3, [9, 9, 9, 255]);
        let bytes = fs::read(&good).unwrap();
        fs::write(&truncated, &bytes[..bytes.len() / 2]).unwrap();

        assert!(is_valid_image(&good));
        assert!(!is_valid_image(&truncated));
        assert!(!is_valid_image(&root.join("missing.png")));
    }

    #[test]
    fn test_pixel_digest_ignores_ancillary_chunks() {
        let (_temp, root) = temp_root();
        let a = root.join("a.png");
        let b = root.join("b.png");
        write_png(&a, 5, 5, [7, 7, 7, 255]);
        fs::write(&b, with_text_chunk(&fs::read(&a).unwrap())).unwrap();

        let digest = png_pixel_digest(&a).unwrap();
        assert_eq!(png_pixel_digest(&b), Some(digest));

        fs::write(root.join("c.png"), b"\x89PNG\r\n\x1a\n\0\0").unwrap();
        assert_eq!(png_pixel_digest(&root.join("c.png")), None);
    }
}
