//! Anchor-based face decoding for short-range SSD face models.
//!
//! The model scores a fixed grid of anchors and regresses, per anchor, a box
//! centre/size offset followed by six keypoints (right eye, left eye, nose
//! tip, mouth, right ear, left ear). Decoding turns the raw rows into face
//! candidates in the caller's unmirrored target space, collapsing
//! overlapping anchors for the same face with weighted suppression.

use crate::geometry::{Point, Rect};
use crate::runner::{DetectionTensorSet, InputShape};
use thiserror::Error;

/// Raw logits are clipped to this magnitude before the sigmoid.
const SCORE_CLIP: f32 = 100.0;

/// Box centre, box size, then six (x, y) keypoints.
const KEYPOINT_OFFSET: usize = 4;
const RIGHT_EYE: usize = 0;
const LEFT_EYE: usize = 1;
const MOUTH: usize = 3;
/// Fewest regressor values per anchor that still reach the mouth keypoint.
pub const MIN_COORDS: usize = KEYPOINT_OFFSET + (MOUTH + 1) * 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model produced {actual} anchors, detector generated {expected}")]
    AnchorMismatch { expected: usize, actual: usize },
    #[error("model produced {0} coordinates per anchor, at least {MIN_COORDS} required")]
    TooFewCoords(usize),
    #[error("box tensor holds {actual} values, {expected} required")]
    BoxLengthMismatch { expected: usize, actual: usize },
}

/// Decoding thresholds and the caller's target space.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Minimum sigmoid score for an anchor to be kept.
    pub score_threshold: f32,
    /// Anchors overlapping the cluster leader above this IoU are merged into it.
    pub suppression_threshold: f32,
    /// Width of the space candidates are reported in.
    pub output_width: f32,
    /// Height of the space candidates are reported in.
    pub output_height: f32,
    /// Per-layer anchor strides; consecutive equal strides share one grid.
    pub strides: Vec<u32>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.7,
            suppression_threshold: 0.3,
            output_width: 480.0,
            output_height: 640.0,
            strides: vec![8, 16, 16, 16],
        }
    }
}

/// A decoded face: box plus the three landmarks the challenge uses.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceCandidate {
    pub location: Rect,
    pub left_eye: Point,
    pub right_eye: Point,
    pub mouth: Point,
    pub score: f32,
}

/// Normalised detection before scaling to the output space.
#[derive(Debug, Clone)]
struct RawDetection {
    bbox: Rect,
    keypoints: [Point; 3],
    score: f32,
}

/// Stateless decoder; the result depends only on the tensors passed in.
pub struct FaceDetector {
    config: DetectorConfig,
    input: InputShape,
    anchors: Vec<Point>,
}

impl FaceDetector {
    pub fn new(config: DetectorConfig, input: InputShape) -> Self {
        let anchors = generate_anchors(&config.strides, input.width, input.height);
        tracing::debug!(
            anchors = anchors.len(),
            width = input.width,
            height = input.height,
            "generated detector anchors"
        );
        Self {
            config,
            input,
            anchors,
        }
    }

    pub fn anchor_count(&self) -> usize {
        self.anchors.len()
    }

    /// Normalised anchor centres, in model output order.
    pub fn anchors(&self) -> &[Point] {
        &self.anchors
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Decode raw tensors into candidates ranked by score, highest first.
    pub fn decode(&self, tensors: &DetectionTensorSet) -> Result<Vec<FaceCandidate>, DetectorError> {
        if tensors.anchor_count() != self.anchors.len() {
            return Err(DetectorError::AnchorMismatch {
                expected: self.anchors.len(),
                actual: tensors.anchor_count(),
            });
        }
        if tensors.coords_per_anchor < MIN_COORDS {
            return Err(DetectorError::TooFewCoords(tensors.coords_per_anchor));
        }
        let expected = self.anchors.len() * tensors.coords_per_anchor;
        if tensors.boxes.len() != expected {
            return Err(DetectorError::BoxLengthMismatch {
                expected,
                actual: tensors.boxes.len(),
            });
        }

        let (iw, ih) = (self.input.width as f32, self.input.height as f32);
        let mut detections = Vec::new();

        for (i, anchor) in self.anchors.iter().enumerate() {
            let score = sigmoid(tensors.scores[i].clamp(-SCORE_CLIP, SCORE_CLIP));
            if score.is_nan() || score < self.config.score_threshold {
                continue;
            }

            let row = tensors.anchor_box(i);
            let cx = row[0] / iw + anchor.x;
            let cy = row[1] / ih + anchor.y;
            let w = row[2] / iw;
            let h = row[3] / ih;

            let keypoint = |k: usize| {
                Point::new(
                    row[KEYPOINT_OFFSET + k * 2] / iw + anchor.x,
                    row[KEYPOINT_OFFSET + k * 2 + 1] / ih + anchor.y,
                )
            };

            detections.push(RawDetection {
                bbox: Rect::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0),
                keypoints: [keypoint(LEFT_EYE), keypoint(RIGHT_EYE), keypoint(MOUTH)],
                score,
            });
        }

        let merged = weighted_suppression(detections, self.config.suppression_threshold);

        let (sx, sy) = (self.config.output_width, self.config.output_height);
        let scale = |p: &Point| Point::new(p.x * sx, p.y * sy);
        Ok(merged
            .into_iter()
            .map(|d| FaceCandidate {
                location: Rect::new(
                    d.bbox.left * sx,
                    d.bbox.top * sy,
                    d.bbox.right * sx,
                    d.bbox.bottom * sy,
                ),
                left_eye: scale(&d.keypoints[0]),
                right_eye: scale(&d.keypoints[1]),
                mouth: scale(&d.keypoints[2]),
                score: d.score,
            })
            .collect())
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Anchor centres in normalised coordinates, two per layer per grid cell.
///
/// Layers that share a stride are folded into one grid, so strides
/// `[8, 16, 16, 16]` on a 128px input give 16x16x2 + 8x8x6 = 896 anchors.
fn generate_anchors(strides: &[u32], input_width: u32, input_height: u32) -> Vec<Point> {
    const ANCHORS_PER_LAYER: usize = 2;
    const OFFSET: f32 = 0.5;

    let mut anchors = Vec::new();
    let mut layer = 0;
    while layer < strides.len() {
        let stride = strides[layer];
        let mut per_cell = 0;
        while layer < strides.len() && strides[layer] == stride {
            per_cell += ANCHORS_PER_LAYER;
            layer += 1;
        }

        let rows = input_height.div_ceil(stride);
        let cols = input_width.div_ceil(stride);
        for y in 0..rows {
            for x in 0..cols {
                let center = Point::new(
                    (x as f32 + OFFSET) / cols as f32,
                    (y as f32 + OFFSET) / rows as f32,
                );
                anchors.extend(std::iter::repeat(center).take(per_cell));
            }
        }
    }
    anchors
}

/// Cluster detections around the highest-scoring remaining one and replace
/// each cluster with its score-weighted average. The cluster keeps the
/// leader's score.
fn weighted_suppression(mut detections: Vec<RawDetection>, threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept = Vec::new();
    while !detections.is_empty() {
        let leader = detections.remove(0);
        let (cluster, rest): (Vec<_>, Vec<_>) = detections
            .into_iter()
            .partition(|d| leader.bbox.iou(&d.bbox) > threshold);
        detections = rest;

        let members = || std::iter::once(&leader).chain(cluster.iter());
        let total: f32 = members().map(|d| d.score).sum();
        let mut bbox = Rect::default();
        let mut keypoints = [Point::default(); 3];
        for d in members() {
            let w = d.score / total;
            bbox.left += d.bbox.left * w;
            bbox.top += d.bbox.top * w;
            bbox.right += d.bbox.right * w;
            bbox.bottom += d.bbox.bottom * w;
            for (acc, kp) in keypoints.iter_mut().zip(d.keypoints.iter()) {
                acc.x += kp.x * w;
                acc.y += kp.y * w;
            }
        }

        kept.push(RawDetection {
            bbox,
            keypoints,
            score: leader.score,
        });
    }
    kept
}
