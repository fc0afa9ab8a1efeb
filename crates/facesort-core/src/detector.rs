//! Multi-scale sliding-window face detection.
//!
//! Scans an image pyramid with a [`HaarCascade`], then merges the raw window
//! hits into face regions by rectangle clustering. A region survives only if
//! more than `min_neighbors` raw hits agree on it.

use crate::cascade::{HaarCascade, IntegralImage};
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

// --- Detection defaults ---
pub const DEFAULT_SCALE_FACTOR: f64 = 1.1;
pub const DEFAULT_MIN_NEIGHBORS: u32 = 15;
pub const DEFAULT_MIN_SIZE: u32 = 30;

/// Relative tolerance for two raw hits to count as the same region.
const GROUP_EPS: f64 = 0.2;

/// Pluggable face detection backend.
pub trait FaceDetector {
    /// Detect faces in a grayscale image.
    fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox>;
}

/// Fixed parameters of the multi-scale scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionParams {
    /// Pyramid step between scales; must be > 1.
    pub scale_factor: f64,
    /// Raw hits that must agree before a region is reported.
    pub min_neighbors: u32,
    /// Smallest face (square side, in pixels) worth looking for.
    pub min_size: u32,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: DEFAULT_MIN_SIZE,
        }
    }
}

/// Viola-Jones detector over a Haar cascade.
pub struct CascadeDetector {
    cascade: HaarCascade,
    params: DetectionParams,
}

impl CascadeDetector {
    pub fn new(cascade: HaarCascade, params: DetectionParams) -> Self {
        Self { cascade, params }
    }

    pub fn params(&self) -> &DetectionParams {
        &self.params
    }

    /// Every window that passes the cascade, before grouping.
    fn scan(&self, gray: &GrayImage) -> Vec<BoundingBox> {
        let (win_w, win_h) = self.cascade.window_size();
        let (img_w, img_h) = gray.dimensions();
        let mut hits = Vec::new();

        let mut factor = 1.0f64;
        loop {
            let scaled_w = (f64::from(img_w) / factor).round() as u32;
            let scaled_h = (f64::from(img_h) / factor).round() as u32;
            if scaled_w < win_w || scaled_h < win_h {
                break;
            }

            let face_w = (f64::from(win_w) * factor).round() as u32;
            let face_h = (f64::from(win_h) * factor).round() as u32;
            if face_w > img_w || face_h > img_h {
                break;
            }

            if face_w >= self.params.min_size && face_h >= self.params.min_size {
                let scaled: Cow<'_, GrayImage> = if (scaled_w, scaled_h) == (img_w, img_h) {
                    Cow::Borrowed(gray)
                } else {
                    Cow::Owned(imageops::resize(gray, scaled_w, scaled_h, FilterType::Triangle))
                };
                let integral = IntegralImage::new(&scaled);
                let step = if factor > 2.0 { 1 } else { 2 };
                let before = hits.len();

                for y in (0..=scaled_h - win_h).step_by(step) {
                    for x in (0..=scaled_w - win_w).step_by(step) {
                        if self.cascade.evaluate(&integral, x, y) {
                            // Rounding can push the mapped window past the edge.
                            let orig_x = ((f64::from(x) * factor).round() as u32).min(img_w - face_w);
                            let orig_y = ((f64::from(y) * factor).round() as u32).min(img_h - face_h);
                            hits.push(BoundingBox::new(orig_x, orig_y, face_w, face_h));
                        }
                    }
                }

                tracing::trace!(
                    factor,
                    scaled = ?(scaled_w, scaled_h),
                    hits = hits.len() - before,
                    "scanned pyramid level"
                );
            }

            if self.params.scale_factor <= 1.0 {
                break;
            }
            factor *= self.params.scale_factor;
        }

        hits
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&self, gray: &GrayImage) -> Vec<BoundingBox> {
        let raw = self.scan(gray);
        let faces = group_rectangles(&raw, self.params.min_neighbors, GROUP_EPS);
        tracing::debug!(
            width = gray.width(),
            height = gray.height(),
            raw = raw.len(),
            faces = faces.len(),
            "cascade detection finished"
        );
        faces
    }
}

/// Two rectangles are similar when every edge is within `eps` of the mean size.
fn similar(a: &BoundingBox, b: &BoundingBox, eps: f64) -> bool {
    let delta = eps * f64::from(a.width.min(b.width) + a.height.min(b.height)) * 0.5;
    let close = |p: u32, q: u32| (f64::from(p) - f64::from(q)).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

/// Label each rectangle with its equivalence class under [`similar`].
///
/// Returns (labels, class count). Classes are numbered in order of first
/// appearance.
fn partition(rects: &[BoundingBox], eps: f64) -> (Vec<usize>, usize) {
    let mut parent: Vec<usize> = (0..rects.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            if similar(&rects[i], &rects[j], eps) {
                let ri = find(&mut parent, i);
                let rj = find(&mut parent, j);
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; rects.len()];
    let mut labels = Vec::with_capacity(rects.len());
    let mut classes = 0;
    for i in 0..rects.len() {
        let root = find(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = classes;
            classes += 1;
        }
        labels.push(class_of_root[root]);
    }

    (labels, classes)
}

/// Cluster raw hits and keep the clusters backed by more than `threshold` hits.
///
/// Each surviving cluster is the average of its members; clusters lying inside
/// a larger, better-supported cluster are dropped. A threshold of zero returns
/// the raw hits untouched.
pub fn group_rectangles(rects: &[BoundingBox], threshold: u32, eps: f64) -> Vec<BoundingBox> {
    if threshold == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let (labels, classes) = partition(rects, eps);

    let mut sums = vec![[0u64; 4]; classes];
    let mut counts = vec![0u32; classes];
    for (rect, &label) in rects.iter().zip(&labels) {
        let s = &mut sums[label];
        s[0] += u64::from(rect.x);
        s[1] += u64::from(rect.y);
        s[2] += u64::from(rect.width);
        s[3] += u64::from(rect.height);
        counts[label] += 1;
    }

    let averaged: Vec<BoundingBox> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &n)| {
            let avg = |v: u64| (v as f64 / f64::from(n)).round() as u32;
            BoundingBox {
                x: avg(s[0]),
                y: avg(s[1]),
                width: avg(s[2]),
                height: avg(s[3]),
                neighbors: n,
            }
        })
        .collect();

    let mut result = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = r1.neighbors;
        if n1 <= threshold {
            continue;
        }

        let nested = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = r2.neighbors;
            if j == i || n2 <= threshold {
                return false;
            }
            let dx = (f64::from(r2.width) * eps).round() as i64;
            let dy = (f64::from(r2.height) * eps).round() as i64;
            let (x1, y1) = (i64::from(r1.x), i64::from(r1.y));
            let (x2, y2) = (i64::from(r2.x), i64::from(r2.y));
            x1 >= x2 - dx
                && y1 >= y2 - dy
                && x1 + i64::from(r1.width) <= x2 + i64::from(r2.width) + dx
                && y1 + i64::from(r1.height) <= y2 + i64::from(r2.height) + dy
                && (n2 > n1.max(3) || n1 < 3)
        });

        if !nested {
            result.push(*r1);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::tests::EDGE_CASCADE;
    use image::Luma;

    fn rect(x: u32, y: u32, w: u32, h: u32) -> BoundingBox {
        BoundingBox::new(x, y, w, h)
    }

    fn edge_detector(min_neighbors: u32, min_size: u32) -> CascadeDetector {
        let cascade = HaarCascade::from_xml(EDGE_CASCADE).unwrap();
        CascadeDetector::new(
            cascade,
            DetectionParams {
                scale_factor: 1.1,
                min_neighbors,
                min_size,
            },
        )
    }

    /// Dark top half, bright bottom half.
    fn edge_image(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |_, y| {
            if y < height / 2 {
                Luma([0])
            } else {
                Luma([255])
            }
        })
    }

    #[test]
    fn test_default_params_match_fixed_constants() {
        let params = DetectionParams::default();
        assert_eq!(params.scale_factor, 1.1);
        assert_eq!(params.min_neighbors, 15);
        assert_eq!(params.min_size, 30);
    }

    #[test]
    fn test_similar_rects() {
        let a = rect(100, 100, 50, 50);
        assert!(similar(&a, &rect(104, 103, 50, 52), 0.2));
        assert!(!similar(&a, &rect(120, 100, 50, 50), 0.2));
    }

    #[test]
    fn test_group_threshold_zero_returns_raw() {
        let raw = vec![rect(0, 0, 10, 10), rect(1, 1, 10, 10), rect(50, 50, 10, 10)];
        let grouped = group_rectangles(&raw, 0, 0.2);
        assert_eq!(grouped, raw);
    }

    #[test]
    fn test_group_averages_cluster_and_drops_weak() {
        let raw = vec![
            rect(100, 100, 50, 50),
            rect(102, 100, 50, 50),
            rect(104, 100, 50, 50),
            // Lone hit far away: one vote, below threshold.
            rect(400, 400, 50, 50),
        ];
        let grouped = group_rectangles(&raw, 1, 0.2);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0], BoundingBox { x: 102, y: 100, width: 50, height: 50, neighbors: 3 });
    }

    #[test]
    fn test_group_threshold_is_strict() {
        let raw = vec![rect(10, 10, 40, 40), rect(11, 10, 40, 40), rect(12, 10, 40, 40)];
        assert_eq!(group_rectangles(&raw, 2, 0.2).len(), 1);
        assert!(group_rectangles(&raw, 3, 0.2).is_empty());
    }

    #[test]
    fn test_group_drops_nested_weaker_cluster() {
        let mut raw = Vec::new();
        // Strong large cluster: 6 votes.
        for i in 0..6 {
            raw.push(rect(100 + i, 100, 100, 100));
        }
        // Weak small cluster inside it: 2 votes.
        raw.push(rect(130, 130, 30, 30));
        raw.push(rect(131, 130, 30, 30));

        let grouped = group_rectangles(&raw, 1, 0.2);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].width, 100);
        assert_eq!(grouped[0].neighbors, 6);
    }

    #[test]
    fn test_group_empty() {
        assert!(group_rectangles(&[], 3, 0.2).is_empty());
    }

    #[test]
    fn test_detect_uniform_image_finds_nothing() {
        let detector = edge_detector(0, 1);
        let gray = GrayImage::from_pixel(48, 48, Luma([128]));
        assert!(detector.detect(&gray).is_empty());
    }

    #[test]
    fn test_detect_edge_pattern() {
        let detector = edge_detector(0, 1);
        let faces = detector.detect(&edge_image(12, 12));
        assert!(!faces.is_empty());
        for face in &faces {
            assert!(face.x + face.width <= 12 && face.y + face.height <= 12, "{face:?}");
        }
    }

    #[test]
    fn test_detect_min_size_prunes_scales() {
        // Window is 6px; nothing can reach 40px inside a 12px image.
        let detector = edge_detector(0, 40);
        assert!(detector.detect(&edge_image(12, 12)).is_empty());
    }

    #[test]
    fn test_detect_min_neighbors_prunes_regions() {
        let detector = edge_detector(1000, 1);
        assert!(detector.detect(&edge_image(12, 12)).is_empty());
    }

    #[test]
    fn test_detect_image_smaller_than_window() {
        let detector = edge_detector(0, 1);
        assert!(detector.detect(&edge_image(4, 4)).is_empty());
    }
}
