//! Vector index over fused face vectors.
//!
//! Starts as an exact (flat) index and promotes itself to an inverted-file
//! layout once it holds enough vectors. Raw vectors are always kept, so
//! promotion and rebuilds never lose data. Removal is a full rebuild.

use crate::fusion::{FusedVector, FusionVersion};
use crate::ivf::IvfLayout;
use crate::types::{cosine_similarity, dot, FaceBox};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum IndexError {
    #[error("vector version {actual} does not match index version {expected}")]
    VersionMismatch { expected: String, actual: String },
    #[error("vector has {actual} dims, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Similarity metric used for ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cosine,
    #[default]
    InnerProduct,
}

impl Metric {
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => cosine_similarity(a, b),
            Metric::InnerProduct => dot(a, b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexSettings {
    pub metric: Metric,
    /// Vector count at which the index switches to IVF; `None` keeps it exact.
    pub ivf_min_vectors: Option<usize>,
    pub nlist: usize,
    pub nprobe: usize,
    pub kmeans_iterations: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            metric: Metric::InnerProduct,
            ivf_min_vectors: Some(1000),
            nlist: 100,
            nprobe: 10,
            kmeans_iterations: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    Flat,
    Ivf,
}

/// One stored face vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: u64,
    pub photo_id: String,
    pub face: FaceBox,
    pub vector: Vec<f32>,
}

/// A ranked search result.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: u64,
    pub photo_id: String,
    pub face: FaceBox,
    pub score: f32,
}

/// Per-query search parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchParams {
    /// Clusters to probe in IVF mode; defaults to the index setting.
    pub nprobe: Option<usize>,
    /// Ignore the IVF layout and scan every vector.
    pub exhaustive: bool,
}

impl SearchParams {
    pub fn exhaustive() -> Self {
        Self {
            nprobe: None,
            exhaustive: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndex {
    version: FusionVersion,
    tag: String,
    settings: IndexSettings,
    entries: Vec<IndexEntry>,
    next_id: u64,
    ivf: Option<IvfLayout>,
}

impl VectorIndex {
    pub fn new(version: FusionVersion, settings: IndexSettings) -> Self {
        let tag = version.tag();
        Self {
            version,
            tag,
            settings,
            entries: Vec::new(),
            next_id: 1,
            ivf: None,
        }
    }

    pub fn version(&self) -> &FusionVersion {
        &self.version
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    pub fn dim(&self) -> usize {
        self.version.dim()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn mode(&self) -> IndexMode {
        if self.ivf.is_some() {
            IndexMode::Ivf
        } else {
            IndexMode::Flat
        }
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Replace the tuning knobs (metric, IVF thresholds) and retrain.
    ///
    /// The version tag is not a setting and cannot change here.
    pub fn apply_settings(&mut self, settings: IndexSettings) {
        if settings != self.settings {
            self.settings = settings;
            self.rebuild();
        }
    }

    /// Refuse vectors produced under a different version or dimensionality.
    pub fn check_compatible(&self, vector: &FusedVector) -> Result<(), IndexError> {
        if vector.version_tag != self.tag {
            return Err(IndexError::VersionMismatch {
                expected: self.tag.clone(),
                actual: vector.version_tag.clone(),
            });
        }
        if vector.values.len() != self.dim() {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim(),
                actual: vector.values.len(),
            });
        }
        Ok(())
    }

    /// Store a vector and return its id.
    pub fn insert(&mut self, vector: FusedVector, photo_id: &str, face: FaceBox) -> Result<u64, IndexError> {
        self.check_compatible(&vector)?;

        let id = self.next_id;
        self.next_id += 1;
        let pos = self.entries.len();
        self.entries.push(IndexEntry {
            id,
            photo_id: photo_id.to_string(),
            face,
            vector: vector.values,
        });

        let metric = self.settings.metric;
        let retrain = match &mut self.ivf {
            Some(layout) => {
                layout.assign(pos, &self.entries[pos].vector, |a, b| metric.score(a, b));
                // Centroids drift as the corpus grows; retrain when it doubles.
                self.entries.len() >= layout.trained_on * 2
            }
            None => self
                .settings
                .ivf_min_vectors
                .is_some_and(|min| self.entries.len() >= min),
        };
        if retrain {
            self.rebuild();
        }

        Ok(id)
    }

    /// Drop every vector belonging to `photo_id` and rebuild. Returns the number removed.
    pub fn remove_photo(&mut self, photo_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.photo_id != photo_id);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.rebuild();
        }
        removed
    }

    /// Drop every vector. Ids keep increasing across resets.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.ivf = None;
    }

    /// Recompute the IVF layout from the stored vectors, or fall back to flat.
    pub fn rebuild(&mut self) {
        let promote = self
            .settings
            .ivf_min_vectors
            .is_some_and(|min| self.entries.len() >= min);
        if !promote {
            self.ivf = None;
            return;
        }

        let metric = self.settings.metric;
        let vectors: Vec<&[f32]> = self.entries.iter().map(|e| e.vector.as_slice()).collect();
        self.ivf = IvfLayout::train(
            &vectors,
            self.settings.nlist,
            self.settings.kmeans_iterations,
            |a, b| metric.score(a, b),
        );

        if let Some(layout) = &self.ivf {
            tracing::debug!(vectors = self.entries.len(), nlist = layout.nlist(), "trained IVF layout");
        }
    }

    /// Up to `k` hits ranked by score, highest first; equal scores keep insertion order.
    pub fn search(&self, query: &FusedVector, k: usize, params: SearchParams) -> Result<Vec<Hit>, IndexError> {
        self.check_compatible(query)?;
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }

        let metric = self.settings.metric;
        let positions: Vec<usize> = match (&self.ivf, params.exhaustive) {
            (Some(layout), false) => {
                let nprobe = params.nprobe.unwrap_or(self.settings.nprobe);
                layout.probe(&query.values, nprobe, |a, b| metric.score(a, b))
            }
            _ => (0..self.entries.len()).collect(),
        };

        let mut scored: Vec<(usize, f32)> = positions
            .into_iter()
            .map(|pos| (pos, metric.score(&query.values, &self.entries[pos].vector)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(pos, score)| {
                let e = &self.entries[pos];
                Hit {
                    id: e.id,
                    photo_id: e.photo_id.clone(),
                    face: e.face,
                    score,
                }
            })
            .collect())
    }
}
