//! photoscan-core: face matching for event photo discovery.
//!
//! SCRFD detection, landmark alignment with CLAHE on luma, a dual ArcFace +
//! FaceNet512 embedding fused into one super-vector, an exact/IVF vector index
//! and per-photo match aggregation. Models run via ONNX Runtime on CPU.

pub mod aggregator;
pub mod alignment;
pub mod detector;
pub mod embedder;
pub mod fusion;
pub mod illumination;
pub mod index;
mod ivf;
pub mod normalizer;
pub mod pipeline;
pub mod types;

pub use aggregator::{aggregate, classify, ExpandPolicy, FaceHit, MatchClass, MatchResult, SearchOutcome};
pub use fusion::{FusedVector, FusionVersion, FusionWeights, VectorFuser};
pub use index::{Hit, IndexError, IndexMode, IndexSettings, Metric, SearchParams, VectorIndex};
pub use pipeline::{FaceExtraction, Pipeline, PipelineError, PipelineSettings, ProcessedFace};
pub use types::{BoundingBox, Embedding, FaceBox};
