//! Reference images the encoding cache is rebuilt from.

use std::path::{Path, PathBuf};

use rollcall_core::Frame;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image error on {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("invalid subject id '{0}'")]
    InvalidSubject(String),
    #[error("frame is empty or malformed ({width}x{height}, {len} bytes)")]
    InvalidFrame { width: u32, height: u32, len: usize },
}

/// One stored reference image.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReferenceImage {
    pub subject_id: String,
    pub path: PathBuf,
}

/// Where reference images for every subject live.
pub trait ReferenceSource: Send + Sync {
    /// Every reference image currently available, grouped by subject.
    fn scan(&self) -> Result<Vec<ReferenceImage>, SourceError>;
    fn load(&self, image: &ReferenceImage) -> Result<Frame, SourceError>;
    /// Store a new sample for `subject_id` so later scans pick it up.
    fn save(&self, subject_id: &str, frame: &Frame) -> Result<ReferenceImage, SourceError>;
    /// Delete every sample of `subject_id`. Returns how many were removed.
    fn remove(&self, subject_id: &str) -> Result<usize, SourceError>;
}

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// `<root>/<subject_id>/*.{png,jpg,jpeg}`
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn subject_dir(&self, subject_id: &str) -> Result<PathBuf, SourceError> {
        validate_subject_id(subject_id)?;
        Ok(self.root.join(subject_id))
    }
}

pub fn validate_subject_id(subject_id: &str) -> Result<(), SourceError> {
    let ok = !subject_id.is_empty()
        && subject_id != "."
        && subject_id != ".."
        && !subject_id.contains(['/', '\\', '\0']);
    if ok {
        Ok(())
    } else {
        Err(SourceError::InvalidSubject(subject_id.to_string()))
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SourceError + '_ {
    move |source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl ReferenceSource for DirectorySource {
    fn scan(&self) -> Result<Vec<ReferenceImage>, SourceError> {
        if !self.root.exists() {
            tracing::debug!(root = %self.root.display(), "reference directory missing — nothing to scan");
            return Ok(Vec::new());
        }

        let mut images = Vec::new();
        for entry in std::fs::read_dir(&self.root).map_err(io_err(&self.root))? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(root = %self.root.display(), error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            let subject_path = entry.path();
            if !subject_path.is_dir() {
                continue;
            }
            let Some(subject_id) = subject_path.file_name().and_then(|n| n.to_str()) else {
                tracing::warn!(path = %subject_path.display(), "skipping non-UTF-8 subject directory");
                continue;
            };

            let files = match std::fs::read_dir(&subject_path) {
                Ok(files) => files,
                Err(e) => {
                    tracing::warn!(subject = subject_id, path = %subject_path.display(), error = %e, "skipping unreadable subject directory");
                    continue;
                }
            };
            for file in files {
                let path = match file {
                    Ok(file) => file.path(),
                    Err(e) => {
                        tracing::warn!(subject = subject_id, error = %e, "skipping unreadable directory entry");
                        continue;
                    }
                };
                if path.is_file() && is_image(&path) {
                    images.push(ReferenceImage {
                        subject_id: subject_id.to_string(),
                        path,
                    });
                }
            }
        }

        images.sort();
        Ok(images)
    }

    fn load(&self, image: &ReferenceImage) -> Result<Frame, SourceError> {
        let rgb = image::open(&image.path)
            .map_err(|source| SourceError::Image {
                path: image.path.clone(),
                source,
            })?
            .to_rgb8();
        let (width, height) = rgb.dimensions();
        let data = rgb.into_raw();
        let len = data.len();
        Frame::from_rgb(width, height, data)
            .filter(|f| !f.is_empty())
            .ok_or(SourceError::InvalidFrame { width, height, len })
    }

    fn save(&self, subject_id: &str, frame: &Frame) -> Result<ReferenceImage, SourceError> {
        let dir = self.subject_dir(subject_id)?;
        let invalid = || SourceError::InvalidFrame {
            width: frame.width,
            height: frame.height,
            len: frame.data.len(),
        };
        if frame.is_empty() {
            return Err(invalid());
        }
        let buffer = image::RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
            .ok_or_else(invalid)?;

        std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let path = dir.join(format!("{subject_id}_{stamp}_{}.png", &suffix[..8]));

        buffer
            .save_with_format(&path, image::ImageFormat::Png)
            .map_err(|source| SourceError::Image {
                path: path.clone(),
                source,
            })?;

        tracing::info!(subject = subject_id, path = %path.display(), "reference image saved");
        Ok(ReferenceImage {
            subject_id: subject_id.to_string(),
            path,
        })
    }

    fn remove(&self, subject_id: &str) -> Result<usize, SourceError> {
        let dir = self.subject_dir(subject_id)?;
        if !dir.exists() {
            return Ok(0);
        }
        let count = std::fs::read_dir(&dir)
            .map_err(io_err(&dir))?
            .filter_map(|e| e.ok())
            .filter(|e| is_image(&e.path()))
            .count();
        std::fs::remove_dir_all(&dir).map_err(io_err(&dir))?;
        tracing::info!(subject = subject_id, images = count, "reference images removed");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rollcall-source-{tag}-{}", uuid::Uuid::new_v4()))
    }

    fn checker(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                let v = if (x + y) % 2 == 0 { 230 } else { 20 };
                data.extend_from_slice(&[v, v / 2, 255 - v]);
            }
        }
        Frame::from_rgb(width, height, data).unwrap()
    }

    #[test]
    fn test_missing_root_scans_empty() {
        let source = DirectorySource::new(scratch_dir("missing"));
        assert!(source.scan().unwrap().is_empty());
    }

    #[test]
    fn test_save_scan_load() {
        let root = scratch_dir("roundtrip");
        let source = DirectorySource::new(&root);
        let frame = checker(8, 6);

        let saved = source.save("s001", &frame).unwrap();
        assert!(saved.path.starts_with(root.join("s001")));

        // Non-image files are ignored
        std::fs::write(root.join("s001").join("notes.txt"), b"x").unwrap();

        let images = source.scan().unwrap();
        assert_eq!(images, vec![saved.clone()]);

        let loaded = source.load(&saved).unwrap();
        assert_eq!(loaded, frame);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_remove_subject_images() {
        let root = scratch_dir("remove");
        let source = DirectorySource::new(&root);
        source.save("s002", &checker(4, 4)).unwrap();
        source.save("s002", &checker(4, 4)).unwrap();
        source.save("s003", &checker(4, 4)).unwrap();

        assert_eq!(source.remove("s002").unwrap(), 2);
        assert_eq!(source.remove("s002").unwrap(), 0);
        let remaining = source.scan().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].subject_id, "s003");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_corrupt_image_fails_to_load() {
        let root = scratch_dir("corrupt");
        std::fs::create_dir_all(root.join("s004")).unwrap();
        let path = root.join("s004").join("broken.jpg");
        std::fs::write(&path, b"not a jpeg").unwrap();

        let source = DirectorySource::new(&root);
        let images = source.scan().unwrap();
        assert_eq!(images.len(), 1);
        assert!(matches!(source.load(&images[0]), Err(SourceError::Image { .. })));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_unreadable_subject_directory_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let root = scratch_dir("unreadable");
        let source = DirectorySource::new(&root);
        let good = source.save("s005", &checker(4, 4)).unwrap();
        source.save("s006", &checker(4, 4)).unwrap();
        let locked = root.join("s006");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();

        // Root ignores the mode bits, so s006 may still be listed there.
        let images = source.scan().unwrap();
        assert!(images.contains(&good));

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_subject_id_validation() {
        assert!(validate_subject_id("s001").is_ok());
        assert!(validate_subject_id("").is_err());
        assert!(validate_subject_id("..").is_err());
        assert!(validate_subject_id("a/b").is_err());

        let source = DirectorySource::new(scratch_dir("invalid"));
        assert!(matches!(
            source.save("../escape", &checker(2, 2)),
            Err(SourceError::InvalidSubject(_))
        ));
    }
}
