//! Face detection.
//!
//! [`FaceDetector`] is the backend seam; [`ScrfdDetector`] implements it with the
//! SCRFD (Sample and Computation Redistribution for Efficient Face Detection)
//! model: letterboxed input, 3-stride anchor-free decoding and NMS.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in a decoded image.
///
/// An image without faces yields an empty list, not an error.
pub trait FaceDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Apply the detection policy shared by all backends: clip boxes to the image,
/// drop empty boxes and boxes under the confidence floor, keep at most
/// `max_faces` (largest first).
pub fn retain_confident(
    detections: Vec<BoundingBox>,
    image_width: u32,
    image_height: u32,
    min_confidence: f32,
    max_faces: usize,
) -> Vec<BoundingBox> {
    let mut kept: Vec<BoundingBox> = detections
        .into_iter()
        .filter(|d| d.confidence >= min_confidence)
        .filter_map(|d| d.clipped(image_width, image_height))
        .collect();

    kept.sort_by(|a, b| {
        b.area()
            .partial_cmp(&a.area())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    kept.truncate(max_faces);
    kept
}

/// How an image was scaled and padded into the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    /// Resized image size inside the padded input.
    inner_width: u32,
    inner_height: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, input: usize) -> Self {
        let side = input as f32;
        let scale = (side / width as f32).min(side / height as f32);
        let inner_width = ((width as f32 * scale).round() as u32).clamp(1, input as u32);
        let inner_height = ((height as f32 * scale).round() as u32).clamp(1, input as u32);
        Self {
            scale,
            pad_x: (input as u32 - inner_width) as f32 / 2.0,
            pad_y: (input as u32 - inner_height) as f32 / 2.0,
            inner_width,
            inner_height,
        }
    }

    /// Model-input coordinates back to source-image coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Positions of one stride's score, box and keypoint tensors in the model outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

impl StrideOutputs {
    const fn at(score: usize, bbox: usize, kps: usize) -> Self {
        Self { score, bbox, kps }
    }
}

/// Exported order when the output names carry no stride information.
const POSITIONAL_OUTPUTS: [StrideOutputs; 3] = [
    StrideOutputs::at(0, 3, 6),
    StrideOutputs::at(1, 4, 7),
    StrideOutputs::at(2, 5, 8),
];

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    score_threshold: f32,
    outputs: [StrideOutputs; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model. Anchors scoring at or below `score_threshold`
    /// are discarded during decoding.
    pub fn load(model_path: &Path, score_threshold: f32) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(path = %model_path.display(), outputs = ?names, "loaded SCRFD model");

        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs score, bbox and kps outputs for 3 strides, model has {}",
                names.len()
            )));
        }

        let outputs = map_outputs(&names);
        tracing::debug!(?outputs, "SCRFD output mapping");

        Ok(Self {
            session,
            score_threshold,
            outputs,
        })
    }

    /// Letterbox into a normalized NCHW tensor; padding stays at 0.0.
    fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
        let letterbox = Letterbox::fit(image.width(), image.height(), SCRFD_INPUT_SIZE);
        let resized = imageops::resize(image, letterbox.inner_width, letterbox.inner_height, FilterType::Triangle);

        let left = letterbox.pad_x.floor() as usize;
        let top = letterbox.pad_y.floor() as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
        for (x, y, px) in resized.enumerate_pixels() {
            for (c, &v) in px.0.iter().enumerate() {
                tensor[[0, c, top + y as usize, left + x as usize]] = (v as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }
        (tensor, letterbox)
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = Self::preprocess(image);
        let results = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let tensor = |index: usize, what: &str, stride: usize| {
            results[index]
                .try_extract_tensor::<f32>()
                .map(|(_, data)| data)
                .map_err(|e| DetectorError::InferenceFailed(format!("{what} at stride {stride}: {e}")))
        };

        let mut candidates = Vec::new();
        for (slot, &stride) in self.outputs.iter().zip(SCRFD_STRIDES.iter()) {
            let level = StrideLevel {
                stride,
                scores: tensor(slot.score, "scores", stride)?,
                boxes: tensor(slot.bbox, "boxes", stride)?,
                keypoints: tensor(slot.kps, "keypoints", stride)?,
            };
            candidates.extend(level.decode(&letterbox, self.score_threshold));
        }

        Ok(suppress_overlaps(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Match outputs to strides by name ("score_8", "bbox_16", ...), falling back
/// to [`POSITIONAL_OUTPUTS`] for exports with generic names.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let index_of = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut mapped = POSITIONAL_OUTPUTS;
    for (slot, &stride) in mapped.iter_mut().zip(SCRFD_STRIDES.iter()) {
        let (Some(score), Some(bbox), Some(kps)) =
            (index_of("score", stride), index_of("bbox", stride), index_of("kps", stride))
        else {
            tracing::debug!(?names, "SCRFD output names carry no strides; using export order");
            return POSITIONAL_OUTPUTS;
        };
        *slot = StrideOutputs::at(score, bbox, kps);
    }
    mapped
}

/// Raw outputs of one feature-map level.
struct StrideLevel<'a> {
    stride: usize,
    scores: &'a [f32],
    /// Four distances (left, top, right, bottom) per anchor, in stride units.
    boxes: &'a [f32],
    /// Five (dx, dy) offsets per anchor, in stride units.
    keypoints: &'a [f32],
}

impl StrideLevel<'_> {
    fn decode(&self, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let cols = SCRFD_INPUT_SIZE / self.stride;
        let anchors = cols * cols * SCRFD_ANCHORS_PER_CELL;
        let step = self.stride as f32;

        (0..anchors.min(self.scores.len()))
            .filter(|&a| self.scores[a] > threshold)
            .filter_map(|a| {
                let dist = self.boxes.get(a * 4..a * 4 + 4)?;
                let cell = a / SCRFD_ANCHORS_PER_CELL;
                let cx = (cell % cols) as f32 * step;
                let cy = (cell / cols) as f32 * step;

                let (left, top) = letterbox.unmap(cx - dist[0] * step, cy - dist[1] * step);
                let (right, bottom) = letterbox.unmap(cx + dist[2] * step, cy + dist[3] * step);

                let landmarks = self.keypoints.get(a * 10..a * 10 + 10).map(|kp| {
                    std::array::from_fn(|i| letterbox.unmap(cx + kp[i * 2] * step, cy + kp[i * 2 + 1] * step))
                });

                Some(BoundingBox {
                    x: left,
                    y: top,
                    width: right - left,
                    height: bottom - top,
                    confidence: self.scores[a],
                    landmarks,
                })
            })
            .collect()
    }
}

/// Greedy non-maximum suppression, most confident first.
fn suppress_overlaps(mut candidates: Vec<BoundingBox>, max_iou: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| overlap(k, &candidate) <= max_iou) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection over union.
fn overlap(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let intersection = w * h;
    let union = a.area() + b.area() - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence, landmarks: None }
    }

    #[test]
    fn test_overlap() {
        let a = face(0.0, 0.0, 10.0, 10.0, 1.0);
        assert!((overlap(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(overlap(&a, &face(20.0, 20.0, 10.0, 10.0, 1.0)), 0.0);
        // 50 shared over a union of 150.
        let shifted = face(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((overlap(&a, &shifted) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_suppression_keeps_best_of_cluster() {
        let kept = suppress_overlaps(
            vec![
                face(4.0, 4.0, 100.0, 100.0, 0.8),
                face(200.0, 200.0, 50.0, 50.0, 0.7),
                face(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            0.4,
        );
        let scores: Vec<f32> = kept.iter().map(|b| b.confidence).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
        assert!(suppress_overlaps(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_retain_confident_drops_low_scores() {
        let detections = vec![
            face(0.0, 0.0, 20.0, 20.0, 0.95),
            face(30.0, 30.0, 40.0, 40.0, 0.3),
            face(50.0, 0.0, 10.0, 10.0, 0.5),
        ];
        let kept = retain_confident(detections, 100, 100, 0.5, 10);
        assert_eq!(kept.len(), 2);
        // Largest first; the 0.5 box sits exactly on the floor and is kept.
        assert_eq!(kept[0].width, 20.0);
        assert_eq!(kept[1].confidence, 0.5);
    }

    #[test]
    fn test_retain_confident_caps_and_clips() {
        let detections = vec![
            face(-5.0, -5.0, 30.0, 30.0, 0.9),
            face(40.0, 40.0, 10.0, 10.0, 0.9),
            face(60.0, 60.0, 5.0, 5.0, 0.9),
            face(500.0, 500.0, 5.0, 5.0, 0.9),
        ];
        let kept = retain_confident(detections, 100, 100, 0.5, 2);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].x, 0.0);
        assert_eq!(kept[0].width, 25.0);
        assert_eq!(kept[1].width, 10.0);
    }

    #[test]
    fn test_letterbox_fit_and_unmap() {
        let lb = Letterbox::fit(320, 240, 640);
        assert_eq!(lb.scale, 2.0);
        assert_eq!((lb.inner_width, lb.inner_height), (640, 480));
        assert_eq!((lb.pad_x, lb.pad_y), (0.0, 80.0));
        assert_eq!(lb.unmap(200.0, 180.0), (100.0, 50.0));
    }

    #[test]
    fn test_stride_decode_maps_through_letterbox() {
        // Stride 32 on a 640 input is a 20x20 grid; light up cell (1, 1).
        let cols = SCRFD_INPUT_SIZE / 32;
        let anchors = cols * cols * SCRFD_ANCHORS_PER_CELL;
        let hit = (cols + 1) * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        scores[hit] = 0.9;
        let mut boxes = vec![0.0f32; anchors * 4];
        boxes[hit * 4..hit * 4 + 4].copy_from_slice(&[0.5; 4]);
        let keypoints = vec![0.0f32; anchors * 10];

        let level = StrideLevel { stride: 32, scores: &scores, boxes: &boxes, keypoints: &keypoints };
        let lb = Letterbox { scale: 2.0, pad_x: 0.0, pad_y: 0.0, inner_width: 640, inner_height: 640 };
        let found = level.decode(&lb, 0.5);

        assert_eq!(found.len(), 1);
        // Anchor centre (32, 32) with half-extent 16, halved back to image space.
        assert!((found[0].x - 8.0).abs() < 1e-4);
        assert!((found[0].width - 16.0).abs() < 1e-4);
        assert_eq!(found[0].landmarks.unwrap()[0], (16.0, 16.0));
    }

    #[test]
    fn test_output_mapping() {
        let named: Vec<String> = ["bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            map_outputs(&named),
            [StrideOutputs::at(2, 0, 1), StrideOutputs::at(5, 3, 4), StrideOutputs::at(8, 6, 7)]
        );

        let generic: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(map_outputs(&generic), POSITIONAL_OUTPUTS);
    }
}
