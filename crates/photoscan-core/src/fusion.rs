//! Weighted concatenation of the shape and texture embeddings into one
//! super-vector, and the version tag that pins an index to one model/weight pair.

use crate::types::{l2_normalize, Embedding};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_SHAPE_WEIGHT: f32 = 0.7;
pub const DEFAULT_TEXTURE_WEIGHT: f32 = 0.3;

#[derive(Error, Debug, PartialEq)]
pub enum FusionError {
    #[error("fusion weights must be finite and positive, got shape={shape} texture={texture}")]
    InvalidWeights { shape: f32, texture: f32 },
    #[error("{branch} embedding has {actual} dims, version expects {expected}")]
    DimensionMismatch {
        branch: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{branch} embedding came from model {actual:?}, version expects {expected}")]
    ModelMismatch {
        branch: &'static str,
        expected: String,
        actual: Option<String>,
    },
}

/// Relative scale of the two branches inside the super-vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub shape: f32,
    pub texture: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            shape: DEFAULT_SHAPE_WEIGHT,
            texture: DEFAULT_TEXTURE_WEIGHT,
        }
    }
}

impl FusionWeights {
    pub fn validate(&self) -> Result<(), FusionError> {
        let ok = |w: f32| w.is_finite() && w > 0.0;
        if ok(self.shape) && ok(self.texture) {
            Ok(())
        } else {
            Err(FusionError::InvalidWeights {
                shape: self.shape,
                texture: self.texture,
            })
        }
    }
}

/// Everything that determines the geometry of a super-vector.
///
/// Vectors produced under different versions are not comparable; changing any
/// field requires re-embedding the whole corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionVersion {
    pub shape_model: String,
    pub shape_dim: usize,
    pub texture_model: String,
    pub texture_dim: usize,
    pub weights: FusionWeights,
}

impl FusionVersion {
    /// Dimensionality of the fused vector.
    pub fn dim(&self) -> usize {
        self.shape_dim + self.texture_dim
    }

    /// Stable textual tag, e.g. `w600k_r50/512*0.7+facenet512/512*0.3`.
    ///
    /// Weights print in shortest round-trip form, so distinct weights always
    /// give distinct tags.
    pub fn tag(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FusionVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}*{}+{}/{}*{}",
            self.shape_model,
            self.shape_dim,
            self.weights.shape,
            self.texture_model,
            self.texture_dim,
            self.weights.texture
        )
    }
}

/// A fused super-vector tagged with the version that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedVector {
    pub values: Vec<f32>,
    pub version_tag: String,
}

/// Scales and concatenates the two unit embeddings.
#[derive(Debug, Clone)]
pub struct VectorFuser {
    version: FusionVersion,
    tag: String,
}

impl VectorFuser {
    pub fn new(version: FusionVersion) -> Result<Self, FusionError> {
        version.weights.validate()?;
        let tag = version.tag();
        Ok(Self { version, tag })
    }

    pub fn version(&self) -> &FusionVersion {
        &self.version
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// `[w_s * shape, w_t * texture]`, renormalized so inner product equals cosine.
    pub fn fuse(&self, shape: &Embedding, texture: &Embedding) -> Result<FusedVector, FusionError> {
        self.check_branch("shape", shape, &self.version.shape_model, self.version.shape_dim)?;
        self.check_branch("texture", texture, &self.version.texture_model, self.version.texture_dim)?;

        let w = self.version.weights;
        let mut values = Vec::with_capacity(self.version.dim());
        values.extend(shape.values.iter().map(|v| v * w.shape));
        values.extend(texture.values.iter().map(|v| v * w.texture));
        l2_normalize(&mut values);

        Ok(FusedVector {
            values,
            version_tag: self.tag.clone(),
        })
    }

    fn check_branch(
        &self,
        branch: &'static str,
        embedding: &Embedding,
        model: &str,
        dim: usize,
    ) -> Result<(), FusionError> {
        if embedding.values.len() != dim {
            return Err(FusionError::DimensionMismatch {
                branch,
                expected: dim,
                actual: embedding.values.len(),
            });
        }
        match embedding.model_version.as_deref() {
            Some(m) if m != model => Err(FusionError::ModelMismatch {
                branch,
                expected: model.to_string(),
                actual: embedding.model_version.clone(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::cosine_similarity;

    fn version(shape_w: f32, texture_w: f32) -> FusionVersion {
        FusionVersion {
            shape_model: "shape".into(),
            shape_dim: 2,
            texture_model: "texture".into(),
            texture_dim: 3,
            weights: FusionWeights { shape: shape_w, texture: texture_w },
        }
    }

    fn emb(values: Vec<f32>, model: &str) -> Embedding {
        Embedding { values, model_version: Some(model.into()) }
    }

    #[test]
    fn test_tag_format() {
        assert_eq!(version(0.7, 0.3).tag(), "shape/2*0.7+texture/3*0.3");
        assert_ne!(version(0.7, 0.3).tag(), version(0.6, 0.4).tag());
    }

    #[test]
    fn test_tag_distinguishes_close_weights() {
        assert_ne!(version(0.7, 0.3).tag(), version(0.704, 0.296).tag());
        assert_ne!(version(0.7, 0.3).tag(), version(0.7001, 0.3).tag());
        assert_eq!(version(0.704, 0.296).tag(), "shape/2*0.704+texture/3*0.296");
    }

    #[test]
    fn test_fuse_concatenates_weighted_branches() {
        let fuser = VectorFuser::new(version(0.7, 0.3)).unwrap();
        let fused = fuser
            .fuse(&emb(vec![1.0, 0.0], "shape"), &emb(vec![0.0, 1.0, 0.0], "texture"))
            .unwrap();

        assert_eq!(fused.values.len(), 5);
        assert_eq!(fused.version_tag, fuser.tag());
        let norm = (0.7f32 * 0.7 + 0.3 * 0.3).sqrt();
        assert!((fused.values[0] - 0.7 / norm).abs() < 1e-6);
        assert!((fused.values[3] - 0.3 / norm).abs() < 1e-6);
        assert_eq!(fused.values[1], 0.0);
    }

    #[test]
    fn test_shape_branch_dominates_similarity() {
        let fuser = VectorFuser::new(version(0.7, 0.3)).unwrap();
        let base = fuser
            .fuse(&emb(vec![1.0, 0.0], "shape"), &emb(vec![1.0, 0.0, 0.0], "texture"))
            .unwrap();
        let same_shape = fuser
            .fuse(&emb(vec![1.0, 0.0], "shape"), &emb(vec![0.0, 1.0, 0.0], "texture"))
            .unwrap();
        let same_texture = fuser
            .fuse(&emb(vec![0.0, 1.0], "shape"), &emb(vec![1.0, 0.0, 0.0], "texture"))
            .unwrap();

        let a = cosine_similarity(&base.values, &same_shape.values);
        let b = cosine_similarity(&base.values, &same_texture.values);
        assert!((a - 0.49 / 0.58).abs() < 1e-5);
        assert!((b - 0.09 / 0.58).abs() < 1e-5);
    }

    #[test]
    fn test_fuse_rejects_wrong_dimension() {
        let fuser = VectorFuser::new(version(0.7, 0.3)).unwrap();
        let err = fuser
            .fuse(&emb(vec![1.0, 0.0, 0.0], "shape"), &emb(vec![1.0, 0.0, 0.0], "texture"))
            .unwrap_err();
        assert_eq!(
            err,
            FusionError::DimensionMismatch { branch: "shape", expected: 2, actual: 3 }
        );
    }

    #[test]
    fn test_fuse_rejects_foreign_model() {
        let fuser = VectorFuser::new(version(0.7, 0.3)).unwrap();
        let err = fuser
            .fuse(&emb(vec![1.0, 0.0], "other"), &emb(vec![1.0, 0.0, 0.0], "texture"))
            .unwrap_err();
        assert!(matches!(err, FusionError::ModelMismatch { branch: "shape", .. }));
    }

    #[test]
    fn test_invalid_weights() {
        assert!(VectorFuser::new(version(0.0, 0.3)).is_err());
        assert!(VectorFuser::new(version(0.7, f32::NAN)).is_err());
    }
}
