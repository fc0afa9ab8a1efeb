//! Image decoding and grayscale conversion.

use image::{DynamicImage, GrayImage, ImageError};
use std::path::Path;

/// Decode the image at `path`, guessing the format from its contents.
pub fn load(path: &Path) -> Result<DynamicImage, ImageError> {
    image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
}

/// Collapse an image to a single luminance channel.
pub fn to_grayscale(image: &DynamicImage) -> GrayImage {
    image.to_luma8()
}

/// True if the file name's extension is in `allowed` (case-insensitive).
///
/// Entries in `allowed` may be written with or without the leading dot.
pub fn has_allowed_extension(path: &Path, allowed: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    allowed
        .iter()
        .any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(ext))
}
