use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A detected face region, in pixel coordinates of the original image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Number of raw candidate windows merged into this region.
    /// Zero when grouping is disabled (`min_neighbors == 0`).
    pub neighbors: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            neighbors: 0,
        }
    }
}

/// Where a successfully loaded image ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    WithFace,
    WithoutFace,
}

impl Destination {
    pub fn from_has_face(has_face: bool) -> Self {
        if has_face {
            Destination::WithFace
        } else {
            Destination::WithoutFace
        }
    }

    pub fn has_face(self) -> bool {
        matches!(self, Destination::WithFace)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::WithFace => f.write_str("with face"),
            Destination::WithoutFace => f.write_str("without face"),
        }
    }
}

/// Tally of a single sorting run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// Files moved into the with-face directory (final paths).
    pub with_face: Vec<PathBuf>,
    /// Files moved into the without-face directory (final paths).
    pub without_face: Vec<PathBuf>,
    /// Directory entries ignored: subdirectories and non-image extensions.
    pub skipped: usize,
    /// Images that could not be decoded; they stay in the source directory.
    pub load_failures: Vec<PathBuf>,
    /// Images that were classified but could not be moved.
    pub move_failures: Vec<PathBuf>,
}

impl RunReport {
    pub fn moved(&self) -> usize {
        self.with_face.len() + self.without_face.len()
    }

    pub fn failures(&self) -> usize {
        self.load_failures.len() + self.move_failures.len()
    }

    pub(crate) fn record_move(&mut self, destination: Destination, path: PathBuf) {
        match destination {
            Destination::WithFace => self.with_face.push(path),
            Destination::WithoutFace => self.without_face.push(path),
        }
    }
}
