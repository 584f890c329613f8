//! Face embedders.
//!
//! [`FaceEmbedder`] is the backend seam: one `embed` method and a fixed declared
//! output dimensionality. [`OnnxEmbedder`] runs a pretrained model through ONNX
//! Runtime; [`DualEmbedder`] pairs a shape-oriented and a texture-oriented model
//! and optionally averages over a mirrored copy of the crop (TTA).

use crate::normalizer::FaceCrop;
use crate::types::{l2_normalize, Embedding};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}; download it and place it in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("{model}: expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch {
        model: String,
        expected: usize,
        actual: usize,
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A pretrained face embedding model.
pub trait FaceEmbedder {
    /// Identifier of the model weights, part of the index version tag.
    fn model_id(&self) -> &str;

    /// Declared output dimensionality.
    fn dim(&self) -> usize;

    /// Raw (not necessarily normalized) embedding of a normalized crop.
    fn embed(&mut self, crop: &FaceCrop) -> Result<Vec<f32>, EmbedderError>;
}

/// Input tensor layout expected by a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    Nchw,
    Nhwc,
}

/// Static description of an ONNX embedding model's input contract.
#[derive(Debug, Clone, Copy)]
pub struct EmbedderSpec {
    pub model_id: &'static str,
    pub input_size: u32,
    pub dim: usize,
    pub mean: f32,
    pub std: f32,
    pub layout: TensorLayout,
}

/// ArcFace w600k_r50, the shape-oriented branch.
pub const ARCFACE_W600K_R50: EmbedderSpec = EmbedderSpec {
    model_id: "w600k_r50",
    input_size: 112,
    dim: 512,
    mean: 127.5,
    std: 127.5, // ArcFace uses symmetric normalization
    layout: TensorLayout::Nchw,
};

/// FaceNet512, the texture-oriented branch.
pub const FACENET512: EmbedderSpec = EmbedderSpec {
    model_id: "facenet512",
    input_size: 160,
    dim: 512,
    mean: 127.5,
    std: 128.0,
    layout: TensorLayout::Nhwc,
};

/// Embedding model running through ONNX Runtime.
pub struct OnnxEmbedder {
    session: Session,
    spec: EmbedderSpec,
}

impl OnnxEmbedder {
    /// Load an ONNX embedding model described by `spec`.
    pub fn load(model_path: &Path, spec: EmbedderSpec) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            model = spec.model_id,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self { session, spec })
    }

    fn preprocess(spec: &EmbedderSpec, crop: &FaceCrop) -> Array4<f32> {
        let input = crop.resized(spec.input_size);
        let size = spec.input_size as usize;
        let shape = match spec.layout {
            TensorLayout::Nchw => (1, 3, size, size),
            TensorLayout::Nhwc => (1, size, size, 3),
        };
        let mut tensor = Array4::<f32>::zeros(shape);

        for y in 0..size {
            for x in 0..size {
                for c in 0..3 {
                    let v = (input.pixel_value(x as u32, y as u32, c) - spec.mean) / spec.std;
                    match spec.layout {
                        TensorLayout::Nchw => tensor[[0, c, y, x]] = v,
                        TensorLayout::Nhwc => tensor[[0, y, x, c]] = v,
                    }
                }
            }
        }

        tensor
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn model_id(&self) -> &str {
        self.spec.model_id
    }

    fn dim(&self) -> usize {
        self.spec.dim
    }

    fn embed(&mut self, crop: &FaceCrop) -> Result<Vec<f32>, EmbedderError> {
        let input = Self::preprocess(&self.spec, crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("{}: {e}", self.spec.model_id)))?;

        Ok(raw_data.to_vec())
    }
}

/// The shape/texture model pair.
pub struct DualEmbedder {
    shape: Box<dyn FaceEmbedder + Send>,
    texture: Box<dyn FaceEmbedder + Send>,
    tta: bool,
}

impl DualEmbedder {
    pub fn new(
        shape: Box<dyn FaceEmbedder + Send>,
        texture: Box<dyn FaceEmbedder + Send>,
        tta: bool,
    ) -> Self {
        Self { shape, texture, tta }
    }

    pub fn shape_model(&self) -> (&str, usize) {
        (self.shape.model_id(), self.shape.dim())
    }

    pub fn texture_model(&self) -> (&str, usize) {
        (self.texture.model_id(), self.texture.dim())
    }

    /// Unit-length (shape, texture) embeddings of one crop.
    pub fn embed(&mut self, crop: &FaceCrop) -> Result<(Embedding, Embedding), EmbedderError> {
        let mirrored = self.tta.then(|| crop.mirrored());
        let shape = embed_averaged(self.shape.as_mut(), crop, mirrored.as_ref())?;
        let texture = embed_averaged(self.texture.as_mut(), crop, mirrored.as_ref())?;
        Ok((shape, texture))
    }
}

/// Embed a crop (and its mirror, when given), average, and L2-normalize.
fn embed_averaged(
    model: &mut (dyn FaceEmbedder + Send),
    crop: &FaceCrop,
    mirrored: Option<&FaceCrop>,
) -> Result<Embedding, EmbedderError> {
    let mut values = checked_embed(model, crop)?;

    if let Some(flipped) = mirrored {
        let other = checked_embed(model, flipped)?;
        for (v, o) in values.iter_mut().zip(other.iter()) {
            *v = (*v + o) / 2.0;
        }
    }

    l2_normalize(&mut values);

    Ok(Embedding {
        values,
        model_version: Some(model.model_id().to_string()),
    })
}

fn checked_embed(model: &mut (dyn FaceEmbedder + Send), crop: &FaceCrop) -> Result<Vec<f32>, EmbedderError> {
    let raw = model.embed(crop)?;
    if raw.len() != model.dim() {
        return Err(EmbedderError::DimensionMismatch {
            model: model.model_id().to_string(),
            expected: model.dim(),
            actual: raw.len(),
        });
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    /// Mean color of the left and right halves, scaled per model.
    struct HalvesEmbedder {
        id: &'static str,
        scale: f32,
        dim: usize,
        calls: usize,
    }

    impl FaceEmbedder for HalvesEmbedder {
        fn model_id(&self) -> &str {
            self.id
        }

        fn dim(&self) -> usize {
            self.dim
        }

        fn embed(&mut self, crop: &FaceCrop) -> Result<Vec<f32>, EmbedderError> {
            self.calls += 1;
            let s = crop.size();
            let mut out = vec![0.0f32; 6];
            for y in 0..s {
                for x in 0..s {
                    let half = if x < s / 2 { 0 } else { 3 };
                    for c in 0..3 {
                        out[half + c] += crop.at(x, y, c) * self.scale;
                    }
                }
            }
            out.truncate(self.dim);
            Ok(out)
        }
    }

    fn halves(id: &'static str, scale: f32) -> Box<HalvesEmbedder> {
        Box::new(HalvesEmbedder { id, scale, dim: 6, calls: 0 })
    }

    fn two_tone_crop() -> FaceCrop {
        let image = RgbImage::from_fn(16, 16, |x, _| {
            if x < 8 { Rgb([250, 10, 10]) } else { Rgb([10, 10, 250]) }
        });
        FaceCrop::from_rgb(&image)
    }

    #[test]
    fn test_embeddings_are_unit_length() {
        let mut dual = DualEmbedder::new(halves("a", 3.0), halves("b", 0.5), false);
        let (shape, texture) = dual.embed(&two_tone_crop()).unwrap();
        for e in [&shape, &texture] {
            let norm: f32 = e.values.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
        assert_eq!(shape.model_version.as_deref(), Some("a"));
        assert_eq!(texture.model_version.as_deref(), Some("b"));
    }

    #[test]
    fn test_embedding_is_deterministic() {
        let mut dual = DualEmbedder::new(halves("a", 1.0), halves("b", 1.0), true);
        let crop = two_tone_crop();
        let (s1, t1) = dual.embed(&crop).unwrap();
        let (s2, t2) = dual.embed(&crop).unwrap();
        assert!((s1.similarity(&s2) - 1.0).abs() < 1e-6);
        assert!((t1.similarity(&t2) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_tta_averages_mirrored_crop() {
        // Mirroring swaps the halves, so the TTA average is symmetric.
        let mut dual = DualEmbedder::new(halves("a", 1.0), halves("b", 1.0), true);
        let (shape, _) = dual.embed(&two_tone_crop()).unwrap();
        for c in 0..3 {
            assert!((shape.values[c] - shape.values[3 + c]).abs() < 1e-5);
        }

        let mut plain = DualEmbedder::new(halves("a", 1.0), halves("b", 1.0), false);
        let (shape, _) = plain.embed(&two_tone_crop()).unwrap();
        assert!((shape.values[0] - shape.values[3]).abs() > 0.1);
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let mut bad = halves("short", 1.0);
        bad.dim = 8; // declares 8, produces 6
        let mut dual = DualEmbedder::new(halves("a", 1.0), bad, false);
        let err = dual.embed(&two_tone_crop()).unwrap_err();
        assert!(matches!(
            err,
            EmbedderError::DimensionMismatch { expected: 8, actual: 6, .. }
        ));
    }

    #[test]
    fn test_preprocess_layouts() {
        let crop = FaceCrop::from_rgb(&RgbImage::from_pixel(160, 160, Rgb([128, 128, 128])));

        let nchw = OnnxEmbedder::preprocess(&ARCFACE_W600K_R50, &crop);
        assert_eq!(nchw.shape(), &[1, 3, 112, 112]);
        let expected = (128.0 - ARCFACE_W600K_R50.mean) / ARCFACE_W600K_R50.std;
        assert!((nchw[[0, 0, 0, 0]] - expected).abs() < 1e-4);

        let nhwc = OnnxEmbedder::preprocess(&FACENET512, &crop);
        assert_eq!(nhwc.shape(), &[1, 160, 160, 3]);
        let expected = (128.0 - FACENET512.mean) / FACENET512.std;
        assert!((nhwc[[0, 5, 5, 2]] - expected).abs() < 1e-4);
    }
}
