//! The end-to-end image → fused vector path, as one context object.
//!
//! A [`Pipeline`] owns its loaded models. Build one per worker thread and pass
//! it where it is needed; nothing here is process-global.

use crate::detector::{retain_confident, DetectorError, FaceDetector, ScrfdDetector};
use crate::embedder::{DualEmbedder, EmbedderError, FaceEmbedder, OnnxEmbedder, ARCFACE_W600K_R50, FACENET512};
use crate::fusion::{FusedVector, FusionError, FusionVersion, FusionWeights, VectorFuser};
use crate::illumination::ClaheSettings;
use crate::normalizer::{FaceNormalizer, NormalizeError, FACE_SIZE};
use crate::types::BoundingBox;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const SHAPE_MODEL_FILE: &str = "w600k_r50.onnx";
pub const TEXTURE_MODEL_FILE: &str = "facenet512.onnx";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("empty image payload")]
    EmptyInput,
    #[error("cannot decode image: {0}")]
    Decode(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("normalizer: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("fusion: {0}")]
    Fusion(#[from] FusionError),
}

impl PipelineError {
    /// Whether the caller sent something unusable, as opposed to a model failure.
    pub fn is_input_error(&self) -> bool {
        matches!(self, PipelineError::EmptyInput | PipelineError::Decode(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub min_confidence: f32,
    pub max_faces: usize,
    pub tta: bool,
    pub weights: FusionWeights,
    pub face_size: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            max_faces: 50,
            tta: true,
            weights: FusionWeights::default(),
            face_size: FACE_SIZE,
        }
    }
}

/// A detected face and its fused vector.
#[derive(Debug, Clone)]
pub struct ProcessedFace {
    pub bbox: BoundingBox,
    pub vector: FusedVector,
}

/// Everything extracted from one photo.
#[derive(Debug, Clone, Default)]
pub struct FaceExtraction {
    pub width: u32,
    pub height: u32,
    /// Faces that passed the detection policy.
    pub detected: usize,
    pub faces: Vec<ProcessedFace>,
    /// Faces that were detected but could not be embedded.
    pub errors: Vec<String>,
}

pub struct Pipeline {
    detector: Box<dyn FaceDetector + Send>,
    normalizer: FaceNormalizer,
    embedder: DualEmbedder,
    fuser: VectorFuser,
    min_confidence: f32,
    max_faces: usize,
}

impl Pipeline {
    pub fn new(
        detector: Box<dyn FaceDetector + Send>,
        shape: Box<dyn FaceEmbedder + Send>,
        texture: Box<dyn FaceEmbedder + Send>,
        settings: PipelineSettings,
    ) -> Result<Self, PipelineError> {
        let embedder = DualEmbedder::new(shape, texture, settings.tta);
        let (shape_model, shape_dim) = embedder.shape_model();
        let (texture_model, texture_dim) = embedder.texture_model();
        let version = FusionVersion {
            shape_model: shape_model.to_string(),
            shape_dim,
            texture_model: texture_model.to_string(),
            texture_dim,
            weights: settings.weights,
        };
        let fuser = VectorFuser::new(version)?;

        Ok(Self {
            detector,
            normalizer: FaceNormalizer::new(settings.face_size, ClaheSettings::default()),
            embedder,
            fuser,
            min_confidence: settings.min_confidence,
            max_faces: settings.max_faces,
        })
    }

    /// Load the SCRFD detector and both ONNX embedders from `model_dir`.
    pub fn load(model_dir: &Path, settings: PipelineSettings) -> Result<Self, PipelineError> {
        let detector = ScrfdDetector::load(&model_dir.join(DETECTOR_MODEL_FILE), settings.min_confidence)?;
        let shape = OnnxEmbedder::load(&model_dir.join(SHAPE_MODEL_FILE), ARCFACE_W600K_R50)?;
        let texture = OnnxEmbedder::load(&model_dir.join(TEXTURE_MODEL_FILE), FACENET512)?;
        Self::new(Box::new(detector), Box::new(shape), Box::new(texture), settings)
    }

    pub fn version(&self) -> &FusionVersion {
        self.fuser.version()
    }

    pub fn decode(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
        if bytes.is_empty() {
            return Err(PipelineError::EmptyInput);
        }
        let image = image::load_from_memory(bytes).map_err(|e| PipelineError::Decode(e.to_string()))?;
        Ok(image.to_rgb8())
    }

    /// Faces in `image` after the confidence floor and face cap, largest first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, PipelineError> {
        let raw = self.detector.detect(image)?;
        Ok(retain_confident(
            raw,
            image.width(),
            image.height(),
            self.min_confidence,
            self.max_faces,
        ))
    }

    /// Normalize, embed and fuse one detected face.
    pub fn embed_face(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<FusedVector, PipelineError> {
        let crop = self.normalizer.normalize(image, face)?;
        let (shape, texture) = self.embedder.embed(&crop)?;
        Ok(self.fuser.fuse(&shape, &texture)?)
    }

    /// Every face in a photo. A face that fails to embed is recorded and skipped.
    pub fn process(&mut self, bytes: &[u8]) -> Result<FaceExtraction, PipelineError> {
        let image = Self::decode(bytes)?;
        let detections = self.detect(&image)?;

        let mut extraction = FaceExtraction {
            width: image.width(),
            height: image.height(),
            detected: detections.len(),
            ..FaceExtraction::default()
        };

        for (i, bbox) in detections.into_iter().enumerate() {
            match self.embed_face(&image, &bbox) {
                Ok(vector) => extraction.faces.push(ProcessedFace { bbox, vector }),
                Err(e) => {
                    tracing::warn!(face = i, error = %e, "skipping face");
                    extraction.errors.push(format!("face {i}: {e}"));
                }
            }
        }

        tracing::debug!(
            detected = extraction.detected,
            embedded = extraction.faces.len(),
            "processed photo"
        );
        Ok(extraction)
    }

    /// The largest face of a selfie, or `None` when no face is found.
    pub fn query(&mut self, bytes: &[u8]) -> Result<Option<ProcessedFace>, PipelineError> {
        let image = Self::decode(bytes)?;
        let Some(bbox) = self.detect(&image)?.into_iter().next() else {
            return Ok(None);
        };
        let vector = self.embed_face(&image, &bbox)?;
        Ok(Some(ProcessedFace { bbox, vector }))
    }
}
