//! Boosted Haar cascade model.
//!
//! Reads the OpenCV `opencv-cascade-classifier` XML format (BOOST stages over
//! upright HAAR features) and evaluates single detection windows against
//! integral images. The multi-scale scan lives in [`crate::detector`].

use image::GrayImage;
use roxmltree::Node;
use std::path::Path;
use thiserror::Error;

/// Windows are variance-normalised over the window inset by this many pixels.
const NORM_INSET: u32 = 1;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0} — install OpenCV's haarcascades or set FACESORT_CASCADE")]
    ModelNotFound(String),
    #[error("failed to read cascade file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid cascade XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("malformed cascade: {0}")]
    Malformed(String),
}

/// One weighted rectangle of a Haar-like feature, in window coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f32,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

/// Split node of a weak classifier tree.
///
/// `left`/`right` > 0 index another node; <= 0 index leaf `-value`.
#[derive(Debug, Clone, Copy)]
struct TreeNode {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f32,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<TreeNode>,
    leaves: Vec<f32>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f32,
    classifiers: Vec<WeakClassifier>,
}

/// A trained boosted cascade of Haar-like features.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl HaarCascade {
    /// Load a cascade from an OpenCV XML file.
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        if !path.exists() {
            return Err(CascadeError::ModelNotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let cascade = Self::from_xml(&xml)?;

        tracing::info!(
            path = %path.display(),
            window = ?(cascade.window_width, cascade.window_height),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse a cascade from the text of an OpenCV XML file.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let doc = roxmltree::Document::parse(xml)?;
        let cascade = doc
            .root_element()
            .children()
            .find(|n| n.is_element())
            .ok_or_else(|| CascadeError::Malformed("empty document".into()))?;

        if cascade.attribute("type_id") == Some("opencv-haar-classifier") {
            return Err(CascadeError::Unsupported(
                "legacy opencv-haar-classifier format; convert it with opencv_traincascade".into(),
            ));
        }

        let stage_type = text_of(child(cascade, "stageType")?);
        if stage_type != "BOOST" {
            return Err(CascadeError::Unsupported(format!("stage type {stage_type}")));
        }
        let feature_type = text_of(child(cascade, "featureType")?);
        if feature_type != "HAAR" {
            return Err(CascadeError::Unsupported(format!("feature type {feature_type}")));
        }

        let window_width: u32 = parse_scalar(child(cascade, "width")?)?;
        let window_height: u32 = parse_scalar(child(cascade, "height")?)?;
        if window_width <= 2 * NORM_INSET || window_height <= 2 * NORM_INSET {
            return Err(CascadeError::Malformed(format!(
                "window {window_width}x{window_height} is too small"
            )));
        }

        let features = items(child(cascade, "features")?)
            .map(|n| parse_feature(n, window_width, window_height))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = items(child(cascade, "stages")?)
            .map(|n| parse_stage(n, features.len()))
            .collect::<Result<Vec<_>, _>>()?;

        if stages.is_empty() {
            return Err(CascadeError::Malformed("cascade has no stages".into()));
        }

        Ok(Self {
            window_width,
            window_height,
            stages,
            features,
        })
    }

    /// Width and height of the detection window the cascade was trained on.
    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Run every stage on the window whose top-left corner is `(x, y)`.
    ///
    /// Returns true when the window passes all stages. The window must lie
    /// entirely inside the image the integral was built from.
    pub fn evaluate(&self, integral: &IntegralImage, x: u32, y: u32) -> bool {
        let inner_w = self.window_width - 2 * NORM_INSET;
        let inner_h = self.window_height - 2 * NORM_INSET;
        let area = f64::from(inner_w) * f64::from(inner_h);
        let sum = integral.sum(x + NORM_INSET, y + NORM_INSET, inner_w, inner_h) as f64;
        let sqsum = integral.sqsum(x + NORM_INSET, y + NORM_INSET, inner_w, inner_h) as f64;

        let nf = area * sqsum - sum * sum;
        let nf = if nf > 0.0 { nf.sqrt() } else { 1.0 };
        let inv_norm = 1.0 / nf;

        for stage in &self.stages {
            let mut score = 0.0f32;
            for classifier in &stage.classifiers {
                let mut idx = 0i32;
                loop {
                    let node = &classifier.nodes[idx as usize];
                    let feature = &self.features[node.feature];
                    let value = (feature_response(feature, integral, x, y) * inv_norm) as f32;
                    idx = if value < node.threshold {
                        node.left
                    } else {
                        node.right
                    };
                    if idx <= 0 {
                        score += classifier.leaves[(-idx) as usize];
                        break;
                    }
                }
            }
            if score < stage.threshold {
                return false;
            }
        }

        true
    }
}

fn feature_response(feature: &HaarFeature, integral: &IntegralImage, x: u32, y: u32) -> f64 {
    feature
        .rects
        .iter()
        .map(|r| f64::from(r.weight) * integral.sum(x + r.x, y + r.y, r.width, r.height) as f64)
        .sum()
}

/// Summed-area tables of pixel values and squared pixel values.
pub struct IntegralImage {
    /// Row stride: image width + 1.
    stride: usize,
    sum: Vec<u64>,
    sqsum: Vec<u64>,
}

impl IntegralImage {
    pub fn new(gray: &GrayImage) -> Self {
        let width = gray.width() as usize;
        let height = gray.height() as usize;
        let stride = width + 1;
        let mut sum = vec![0u64; stride * (height + 1)];
        let mut sqsum = vec![0u64; stride * (height + 1)];
        let pixels = gray.as_raw();

        for y in 0..height {
            let mut row_sum = 0u64;
            let mut row_sqsum = 0u64;
            for x in 0..width {
                let p = u64::from(pixels[y * width + x]);
                row_sum += p;
                row_sqsum += p * p;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row_sum;
                sqsum[idx] = sqsum[idx - stride] + row_sqsum;
            }
        }

        Self { stride, sum, sqsum }
    }

    /// Sum of pixels in the rectangle.
    pub fn sum(&self, x: u32, y: u32, width: u32, height: u32) -> u64 {
        self.rect(&self.sum, x, y, width, height)
    }

    /// Sum of squared pixels in the rectangle.
    pub fn sqsum(&self, x: u32, y: u32, width: u32, height: u32) -> u64 {
        self.rect(&self.sqsum, x, y, width, height)
    }

    fn rect(&self, table: &[u64], x: u32, y: u32, width: u32, height: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + width as usize, y0 + height as usize);
        let tl = table[y0 * self.stride + x0];
        let tr = table[y0 * self.stride + x1];
        let bl = table[y1 * self.stride + x0];
        let br = table[y1 * self.stride + x1];
        (br + tl) - (tr + bl)
    }
}

// --- XML helpers ---

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Result<Node<'a, 'input>, CascadeError> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
        .ok_or_else(|| {
            CascadeError::Malformed(format!(
                "<{}> has no <{name}> element",
                node.tag_name().name()
            ))
        })
}

/// Element children of an OpenCV sequence node (`<_>` items).
fn items<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(|n| n.is_element() && n.tag_name().name() == "_")
}

fn text_of<'a>(node: Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("").trim()
}

fn parse_scalar<T: std::str::FromStr>(node: Node<'_, '_>) -> Result<T, CascadeError> {
    let text = text_of(node);
    text.parse().map_err(|_| {
        CascadeError::Malformed(format!(
            "<{}>: cannot parse {text:?}",
            node.tag_name().name()
        ))
    })
}

fn parse_list(node: Node<'_, '_>) -> Result<Vec<f64>, CascadeError> {
    text_of(node)
        .split_whitespace()
        .map(|tok| {
            tok.parse::<f64>().map_err(|_| {
                CascadeError::Malformed(format!(
                    "<{}>: cannot parse number {tok:?}",
                    node.tag_name().name()
                ))
            })
        })
        .collect()
}

fn parse_feature(node: Node<'_, '_>, window_w: u32, window_h: u32) -> Result<HaarFeature, CascadeError> {
    if let Some(tilted) = node
        .children()
        .find(|n| n.is_element() && n.tag_name().name() == "tilted")
    {
        if text_of(tilted) != "0" {
            return Err(CascadeError::Unsupported("tilted Haar features".into()));
        }
    }

    let mut rects = Vec::new();
    for rect in items(child(node, "rects")?) {
        let values = parse_list(rect)?;
        let [x, y, w, h, weight] = values[..] else {
            return Err(CascadeError::Malformed(format!(
                "feature rectangle needs 5 values, got {}",
                values.len()
            )));
        };
        if x < 0.0 || y < 0.0 || w <= 0.0 || h <= 0.0 {
            return Err(CascadeError::Malformed(format!(
                "feature rectangle {x} {y} {w} {h} is invalid"
            )));
        }
        let rect = WeightedRect {
            x: x as u32,
            y: y as u32,
            width: w as u32,
            height: h as u32,
            weight: weight as f32,
        };
        if rect.x + rect.width > window_w || rect.y + rect.height > window_h {
            return Err(CascadeError::Malformed(format!(
                "feature rectangle {x} {y} {w} {h} exceeds {window_w}x{window_h} window"
            )));
        }
        rects.push(rect);
    }

    if rects.is_empty() {
        return Err(CascadeError::Malformed("feature without rectangles".into()));
    }

    Ok(HaarFeature { rects })
}

fn parse_stage(node: Node<'_, '_>, feature_count: usize) -> Result<Stage, CascadeError> {
    let threshold = parse_scalar::<f32>(child(node, "stageThreshold")?)?;
    let classifiers = items(child(node, "weakClassifiers")?)
        .map(|n| parse_weak_classifier(n, feature_count))
        .collect::<Result<Vec<_>, _>>()?;

    if classifiers.is_empty() {
        return Err(CascadeError::Malformed("stage without weak classifiers".into()));
    }

    Ok(Stage {
        threshold,
        classifiers,
    })
}

fn parse_weak_classifier(node: Node<'_, '_>, feature_count: usize) -> Result<WeakClassifier, CascadeError> {
    let raw_nodes = parse_list(child(node, "internalNodes")?)?;
    let leaves: Vec<f32> = parse_list(child(node, "leafValues")?)?
        .into_iter()
        .map(|v| v as f32)
        .collect();

    if raw_nodes.is_empty() || raw_nodes.len() % 4 != 0 {
        return Err(CascadeError::Malformed(format!(
            "internalNodes must hold groups of 4 values, got {}",
            raw_nodes.len()
        )));
    }

    let mut nodes = Vec::with_capacity(raw_nodes.len() / 4);
    for c in raw_nodes.chunks_exact(4) {
        if c[2] < 0.0 || c[2] as usize >= feature_count {
            return Err(CascadeError::Malformed(format!(
                "feature index {} out of range ({feature_count} features)",
                c[2]
            )));
        }
        nodes.push(TreeNode {
            left: c[0] as i32,
            right: c[1] as i32,
            feature: c[2] as usize,
            threshold: c[3] as f32,
        });
    }

    for n in &nodes {
        for branch in [n.left, n.right] {
            let valid = if branch > 0 {
                (branch as usize) < nodes.len()
            } else {
                ((-branch) as usize) < leaves.len()
            };
            if !valid {
                return Err(CascadeError::Malformed(format!(
                    "tree branch {branch} out of range"
                )));
            }
        }
    }

    Ok(WeakClassifier { nodes, leaves })
}
