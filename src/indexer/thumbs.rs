//! Thumbnail generation.
//!
//! Thumbnails are JPEG files fitted inside a square bounding box, stored
//! under a stable name derived from the source path so repeated runs reuse
//! the same file: `hex(md5(absolute_path)).jpg`.

use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

/// Accepted raster formats.
const SUPPORTED_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "gif", "bmp", "webp", "tiff", "tif"];

const JPEG_QUALITY: u8 = 85;

pub struct ThumbnailService {
    thumb_dir: PathBuf,
    size: u32,
}

impl ThumbnailService {
    pub fn new(thumb_dir: PathBuf, size: u32) -> Self {
        Self { thumb_dir, size }
    }

    /// True iff the file has a supported image extension.
    pub fn is_supported(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                let e = e.to_lowercase();
                SUPPORTED_EXTENSIONS.iter().any(|s| *s == e)
            })
            .unwrap_or(false)
    }

    /// Creates (or reuses) the thumbnail for an image.
    ///
    /// Expects a normalized absolute path. Returns `None` on unsupported
    /// input or any decode/encode failure; the pipeline continues without
    /// a thumbnail in that case.
    pub fn create(&self, image_path: &Path) -> Option<PathBuf> {
        if !Self::is_supported(image_path) {
            return None;
        }
        if let Err(e) = std::fs::create_dir_all(&self.thumb_dir) {
            tracing::warn!("Cannot create thumbnail dir {:?}: {}", self.thumb_dir, e);
            return None;
        }

        let thumb_path = self.thumb_path_for(image_path);
        if let Ok(meta) = std::fs::metadata(&thumb_path) {
            if meta.len() > 0 {
                return Some(thumb_path);
            }
        }

        match self.render(image_path, &thumb_path) {
            Ok(()) => Some(thumb_path),
            Err(e) => {
                tracing::warn!(
                    "Failed to create thumbnail for {:?}: {}",
                    image_path.file_name(),
                    e
                );
                None
            }
        }
    }

    fn render(&self, image_path: &Path, thumb_path: &Path) -> Result<(), String> {
        let img = image::open(image_path).map_err(|e| e.to_string())?;
        // Fit inside the bounding box, preserving aspect ratio.
        let thumb = img.thumbnail(self.size, self.size).to_rgb8();

        let file = std::fs::File::create(thumb_path).map_err(|e| e.to_string())?;
        let mut writer = std::io::BufWriter::new(file);
        let encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY);
        thumb.write_with_encoder(encoder).map_err(|e| e.to_string())
    }

    /// Removes the thumbnail for an image path, if present.
    pub fn delete(&self, image_path: &Path) {
        let thumb_path = self.thumb_path_for(image_path);
        if let Err(e) = std::fs::remove_file(&thumb_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to delete thumbnail for {:?}: {}", image_path, e);
            }
        }
    }

    /// Deterministic on-disk location for a source path.
    pub fn thumb_path_for(&self, image_path: &Path) -> PathBuf {
        let digest = Md5::digest(image_path.to_string_lossy().as_bytes());
        self.thumb_dir.join(format!("{}.jpg", hex::encode(digest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_is_supported_extensions() {
        assert!(ThumbnailService::is_supported(Path::new("/p/a.jpg")));
        assert!(ThumbnailService::is_supported(Path::new("/p/a.JPEG")));
        assert!(ThumbnailService::is_supported(Path::new("/p/a.webp")));
        assert!(ThumbnailService::is_supported(Path::new("/p/a.tif")));
        assert!(!ThumbnailService::is_supported(Path::new("/p/a.txt")));
        assert!(!ThumbnailService::is_supported(Path::new("/p/noext")));
        assert!(!ThumbnailService::is_supported(Path::new("/p/a.jpg.part")));
    }

    #[test]
    fn test_thumb_name_is_stable_and_path_keyed() {
        let svc = ThumbnailService::new(PathBuf::from("/thumbs"), 300);
        let a1 = svc.thumb_path_for(Path::new("/photos/a.jpg"));
        let a2 = svc.thumb_path_for(Path::new("/photos/a.jpg"));
        let b = svc.thumb_path_for(Path::new("/photos/b.jpg"));
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert!(a1.to_string_lossy().ends_with(".jpg"));
    }

    #[test]
    fn test_create_fits_in_box_and_reuses() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("wide.png");
        RgbImage::from_pixel(600, 300, Rgb([200, 100, 50]))
            .save(&src)
            .unwrap();

        let svc = ThumbnailService::new(tmp.path().join("thumbs"), 300);
        let thumb = svc.create(&src).expect("thumbnail should be created");
        let (w, h) = image::image_dimensions(&thumb).unwrap();
        assert!(w <= 300 && h <= 300);
        // Aspect ratio preserved: 2:1 source stays 2:1.
        assert_eq!(w, 300);
        assert_eq!(h, 150);

        // A second call reuses the nonempty file.
        let mtime = std::fs::metadata(&thumb).unwrap().modified().unwrap();
        let again = svc.create(&src).unwrap();
        assert_eq!(again, thumb);
        assert_eq!(std::fs::metadata(&thumb).unwrap().modified().unwrap(), mtime);

        svc.delete(&src);
        assert!(!thumb.exists());
    }

    #[test]
    fn test_create_on_broken_file_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("broken.jpg");
        std::fs::write(&src, b"not an image").unwrap();
        let svc = ThumbnailService::new(tmp.path().join("thumbs"), 300);
        assert!(svc.create(&src).is_none());
    }
}
