//! Face-based photo sorter.
//!
//! Reads the source directory listing once, classifies every allow-listed
//! image with a [`FaceDetector`] and moves it into the with-face or
//! without-face directory. Per-file failures are logged and tallied; only a
//! missing source directory aborts the run.

use crate::codec;
use crate::config::Config;
use crate::detector::FaceDetector;
use crate::types::{Destination, RunReport};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SortError {
    #[error("source directory {0} does not exist")]
    SourceMissing(PathBuf),
    #[error("cannot create output directory {path}: {source}")]
    OutputDir { path: PathBuf, source: io::Error },
    #[error("cannot list {path}: {source}")]
    ReadDir { path: PathBuf, source: io::Error },
    #[error("cannot load image {path}: {source}")]
    Load {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("destination {0} already exists")]
    DestinationExists(PathBuf),
    #[error("cannot move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

/// Sorts images into two directories by face presence.
pub struct PhotoSorter<D> {
    config: Config,
    detector: D,
}

impl<D: FaceDetector> PhotoSorter<D> {
    pub fn new(config: Config, detector: D) -> Self {
        Self { config, detector }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn output_dir(&self, destination: Destination) -> &Path {
        match destination {
            Destination::WithFace => &self.config.with_face_dir,
            Destination::WithoutFace => &self.config.without_face_dir,
        }
    }

    /// Create both output directories; existing ones are left alone.
    pub fn ensure_output_dirs(&self) -> Result<(), SortError> {
        for dir in [&self.config.with_face_dir, &self.config.without_face_dir] {
            fs::create_dir_all(dir).map_err(|source| SortError::OutputDir {
                path: dir.clone(),
                source,
            })?;
        }
        tracing::info!(
            with_face = %self.config.with_face_dir.display(),
            without_face = %self.config.without_face_dir.display(),
            "output directories ready"
        );
        Ok(())
    }

    /// Decode `path` and decide which directory it belongs in.
    pub fn classify(&self, path: &Path) -> Result<Destination, SortError> {
        let image = codec::load(path).map_err(|source| SortError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        let gray = codec::to_grayscale(&image);
        let faces = self.detector.detect(&gray);
        tracing::debug!(path = %path.display(), faces = faces.len(), "detection done");
        Ok(Destination::from_has_face(!faces.is_empty()))
    }

    /// True if at least one face is found. Unreadable images are logged and
    /// count as having no face.
    pub fn detect_face(&self, path: &Path) -> bool {
        match self.classify(path) {
            Ok(destination) => destination.has_face(),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to load image");
                false
            }
        }
    }

    /// Create the output directories, then sort the configured source directory.
    pub fn run(&self) -> Result<RunReport, SortError> {
        self.ensure_output_dirs()?;
        self.classify_and_move(&self.config.source_dir)
    }

    /// Classify every allow-listed image in `source_dir` and move it.
    ///
    /// Subdirectories and other extensions are left untouched. Images that
    /// fail to load stay where they are; move failures are logged and the
    /// run continues with the next file.
    pub fn classify_and_move(&self, source_dir: &Path) -> Result<RunReport, SortError> {
        if !source_dir.is_dir() {
            return Err(SortError::SourceMissing(source_dir.to_path_buf()));
        }

        // Snapshot the listing so moved files are never revisited.
        let entries: Vec<PathBuf> = fs::read_dir(source_dir)
            .map_err(|source| SortError::ReadDir {
                path: source_dir.to_path_buf(),
                source,
            })?
            .filter_map(|entry| match entry {
                Ok(e) => Some(e.path()),
                Err(e) => {
                    tracing::warn!(dir = %source_dir.display(), error = %e, "skipping unreadable entry");
                    None
                }
            })
            .collect();

        tracing::info!(dir = %source_dir.display(), entries = entries.len(), "sorting photos");

        let mut report = RunReport::default();

        for path in entries {
            if path.is_dir() || !codec::has_allowed_extension(&path, &self.config.allowed_extensions) {
                tracing::debug!(path = %path.display(), "skipped");
                report.skipped += 1;
                continue;
            }

            tracing::info!(file = %display_name(&path), "processing");

            let destination = match self.classify(&path) {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "failed to load image; leaving it in place");
                    report.load_failures.push(path);
                    continue;
                }
            };

            let dest_dir = self.output_dir(destination);
            match move_into(&path, dest_dir) {
                Ok(moved) => {
                    tracing::info!(
                        file = %display_name(&path),
                        %destination,
                        to = %dest_dir.display(),
                        "moved"
                    );
                    report.record_move(destination, moved);
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "failed to move file");
                    report.move_failures.push(path);
                }
            }
        }

        tracing::info!(
            with_face = report.with_face.len(),
            without_face = report.without_face.len(),
            skipped = report.skipped,
            load_failures = report.load_failures.len(),
            move_failures = report.move_failures.len(),
            "sorting complete"
        );

        Ok(report)
    }
}

fn display_name(path: &Path) -> std::borrow::Cow<'_, str> {
    path.file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_else(|| path.to_string_lossy())
}

/// Move `src` into `dest_dir` under the same file name, never overwriting.
///
/// Falls back to copy-and-delete when a rename is impossible (for example
/// across filesystems). The copy is removed again if the source cannot be
/// deleted, so the file never ends up in two places.
pub fn move_into(src: &Path, dest_dir: &Path) -> Result<PathBuf, SortError> {
    let Some(name) = src.file_name() else {
        return Err(SortError::Move {
            from: src.to_path_buf(),
            to: dest_dir.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"),
        });
    };
    let dest = dest_dir.join(name);
    if dest.exists() {
        return Err(SortError::DestinationExists(dest));
    }

    let rename_err = match fs::rename(src, &dest) {
        Ok(()) => return Ok(dest),
        Err(e) => e,
    };
    tracing::debug!(from = %src.display(), error = %rename_err, "rename failed; copying instead");

    let move_error = |source| SortError::Move {
        from: src.to_path_buf(),
        to: dest.clone(),
        source,
    };

    if fs::copy(src, &dest).is_err() {
        let _ = fs::remove_file(&dest);
        return Err(move_error(rename_err));
    }
    if let Err(e) = fs::remove_file(src) {
        let _ = fs::remove_file(&dest);
        return Err(move_error(e));
    }
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use image::{GrayImage, Luma};
    use std::cell::RefCell;
    use tempfile::TempDir;

    /// Reports a face whenever the image is mostly bright.
    struct BrightnessDetector;

    impl FaceDetector for BrightnessDetector {
        fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox> {
            let n = gray.as_raw().len().max(1) as u64;
            let mean = gray.as_raw().iter().map(|&p| u64::from(p)).sum::<u64>() / n;
            if mean > 128 {
                vec![BoundingBox::new(0, 0, gray.width(), gray.height())]
            } else {
                vec![]
            }
        }
    }

    /// Records the size of every image it is asked about.
    #[derive(Default)]
    struct RecordingDetector {
        seen: RefCell<Vec<(u32, u32)>>,
    }

    impl FaceDetector for RecordingDetector {
        fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox> {
            self.seen.borrow_mut().push(gray.dimensions());
            vec![]
        }
    }

    struct Fixture {
        _root: TempDir,
        source: PathBuf,
        with_face: PathBuf,
        without_face: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let source = root.path().join("photos");
            fs::create_dir(&source).unwrap();
            Self {
                source,
                with_face: root.path().join("out/with_face"),
                without_face: root.path().join("out/without_face"),
                _root: root,
            }
        }

        fn config(&self) -> Config {
            Config {
                source_dir: self.source.clone(),
                with_face_dir: self.with_face.clone(),
                without_face_dir: self.without_face.clone(),
                ..Config::default()
            }
        }

        fn sorter(&self) -> PhotoSorter<BrightnessDetector> {
            PhotoSorter::new(self.config(), BrightnessDetector)
        }

        fn write_image(&self, name: &str, value: u8) -> PathBuf {
            let path = self.source.join(name);
            GrayImage::from_pixel(16, 16, Luma([value])).save(&path).unwrap();
            path
        }

        fn write_bytes(&self, name: &str, bytes: &[u8]) -> PathBuf {
            let path = self.source.join(name);
            fs::write(&path, bytes).unwrap();
            path
        }
    }

    #[test]
    fn test_sorts_face_no_face_and_ignores_text() {
        let fx = Fixture::new();
        let a = fx.write_image("a.jpg", 250);
        let b = fx.write_image("b.png", 0);
        let c = fx.write_bytes("c.txt", b"notes");

        let report = fx.sorter().run().unwrap();

        assert!(!a.exists());
        assert!(!b.exists());
        assert!(fx.with_face.join("a.jpg").is_file());
        assert!(fx.without_face.join("b.png").is_file());
        assert!(!fx.without_face.join("a.jpg").exists());
        assert!(!fx.with_face.join("b.png").exists());
        assert_eq!(fs::read(&c).unwrap(), b"notes");

        assert_eq!(report.with_face, vec![fx.with_face.join("a.jpg")]);
        assert_eq!(report.without_face, vec![fx.without_face.join("b.png")]);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failures(), 0);
    }

    #[test]
    fn test_missing_source_aborts_before_processing() {
        let fx = Fixture::new();
        let config = Config {
            source_dir: fx.source.join("does-not-exist"),
            ..fx.config()
        };
        let sorter = PhotoSorter::new(config, RecordingDetector::default());

        let err = sorter.run().unwrap_err();
        assert!(matches!(err, SortError::SourceMissing(_)));
        assert!(sorter.detector.seen.borrow().is_empty());
        // Output directories are created before the source check.
        assert!(fx.with_face.is_dir());
        assert!(fx.without_face.is_dir());
        assert!(!fx.source.join("does-not-exist").exists());
    }

    #[test]
    fn test_corrupt_image_stays_and_run_continues() {
        let fx = Fixture::new();
        let broken = fx.write_bytes("broken.jpg", b"\xff\xd8 truncated garbage");
        fx.write_image("ok.png", 0);

        let report = fx.sorter().run().unwrap();

        assert_eq!(fs::read(&broken).unwrap(), b"\xff\xd8 truncated garbage");
        assert_eq!(report.load_failures, vec![broken]);
        assert!(fx.without_face.join("ok.png").is_file());
        assert!(!fx.without_face.join("broken.jpg").exists());
        assert!(report.move_failures.is_empty());
    }

    #[test]
    fn test_subdirectories_untouched() {
        let fx = Fixture::new();
        let nested = fx.source.join("album.jpg");
        fs::create_dir(&nested).unwrap();
        fs::write(nested.join("inner.png"), b"x").unwrap();

        let report = fx.sorter().run().unwrap();

        assert!(nested.is_dir());
        assert!(nested.join("inner.png").is_file());
        assert_eq!(report.skipped, 1);
        assert_eq!(report.moved(), 0);
    }

    #[test]
    fn test_extension_match_is_case_insensitive() {
        let fx = Fixture::new();
        fx.write_image("LOUD.PNG", 255);
        fx.write_image("quiet.Bmp", 10);

        let report = fx.sorter().run().unwrap();

        assert!(fx.with_face.join("LOUD.PNG").is_file());
        assert!(fx.without_face.join("quiet.Bmp").is_file());
        assert_eq!(report.moved(), 2);
    }

    #[test]
    fn test_collision_is_a_move_failure() {
        let fx = Fixture::new();
        let sorter = fx.sorter();
        sorter.ensure_output_dirs().unwrap();
        fs::write(fx.without_face.join("dup.png"), b"already here").unwrap();
        let dup = fx.write_image("dup.png", 0);
        fx.write_image("next.png", 0);

        let report = sorter.run().unwrap();

        assert!(dup.is_file(), "source must survive a collision");
        assert_eq!(fs::read(fx.without_face.join("dup.png")).unwrap(), b"already here");
        assert_eq!(report.move_failures, vec![dup]);
        assert!(fx.without_face.join("next.png").is_file());
    }

    #[test]
    fn test_ensure_output_dirs_idempotent() {
        let fx = Fixture::new();
        let sorter = fx.sorter();
        for _ in 0..3 {
            sorter.ensure_output_dirs().unwrap();
        }
        assert!(fx.with_face.is_dir());
        assert!(fx.without_face.is_dir());
        let out: Vec<_> = fs::read_dir(fx.with_face.parent().unwrap()).unwrap().collect();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_ensure_output_dirs_fails_on_file() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.with_face.parent().unwrap()).unwrap();
        fs::write(&fx.with_face, b"not a directory").unwrap();
        let err = fx.sorter().ensure_output_dirs().unwrap_err();
        assert!(matches!(err, SortError::OutputDir { .. }));
    }

    #[test]
    fn test_detect_face() {
        let fx = Fixture::new();
        let bright = fx.write_image("bright.png", 255);
        let dark = fx.write_image("dark.png", 0);
        let broken = fx.write_bytes("broken.png", b"nope");
        let sorter = fx.sorter();

        assert!(sorter.detect_face(&bright));
        assert!(!sorter.detect_face(&dark));
        assert!(!sorter.detect_face(&broken));
        assert!(matches!(sorter.classify(&broken), Err(SortError::Load { .. })));
    }

    #[test]
    fn test_each_image_classified_once() {
        let fx = Fixture::new();
        fx.write_image("one.png", 0);
        fx.write_image("two.jpeg", 0);
        fx.write_bytes("three.txt", b"");
        let sorter = PhotoSorter::new(fx.config(), RecordingDetector::default());

        let report = sorter.run().unwrap();

        assert_eq!(sorter.detector.seen.borrow().len(), 2);
        assert_eq!(report.without_face.len(), 2);
    }

    #[test]
    fn test_custom_allow_list() {
        let fx = Fixture::new();
        let png = fx.write_image("keep.png", 255);
        fx.write_image("take.jpg", 255);
        let config = Config {
            allowed_extensions: vec!["jpg".into()],
            ..fx.config()
        };

        let report = PhotoSorter::new(config, BrightnessDetector).run().unwrap();

        assert!(png.is_file());
        assert!(fx.with_face.join("take.jpg").is_file());
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_move_into_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.png");
        let dest_dir = dir.path().join("out");
        fs::create_dir(&dest_dir).unwrap();
        fs::write(&src, b"new").unwrap();
        fs::write(dest_dir.join("a.png"), b"old").unwrap();

        let err = move_into(&src, &dest_dir).unwrap_err();
        assert!(matches!(err, SortError::DestinationExists(_)));
        assert_eq!(fs::read(&src).unwrap(), b"new");
        assert_eq!(fs::read(dest_dir.join("a.png")).unwrap(), b"old");
    }

    #[test]
    fn test_move_into_missing_destination_dir() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.png");
        fs::write(&src, b"data").unwrap();

        let err = move_into(&src, &dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, SortError::Move { .. }));
        assert!(src.is_file());
    }
}
