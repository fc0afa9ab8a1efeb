//! facesort-core — Face-presence photo sorting.
//!
//! Detects frontal faces with a boosted Haar cascade (OpenCV XML models,
//! evaluated natively) and moves each image of a directory into a
//! with-face or without-face folder.

pub mod cascade;
pub mod codec;
pub mod config;
pub mod detector;
pub mod sorter;
pub mod types;

pub use cascade::{CascadeError, HaarCascade};
pub use config::{Config, ConfigError};
pub use detector::{CascadeDetector, DetectionParams, FaceDetector};
pub use sorter::{PhotoSorter, SortError};
pub use types::{BoundingBox, Destination, RunReport};
