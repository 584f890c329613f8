//! The matching service: ingest, batch ingest, search and corpus maintenance.

use crate::config::Config;
use crate::engine::{spawn_engine, EngineError, EngineHandle};
use crate::import::ImportTracker;
use photoscan_core::aggregator::count_confirmed;
use photoscan_core::{
    aggregate, BoundingBox, ExpandPolicy, FaceBox, IndexError, MatchResult, Pipeline, SearchParams,
};
use photoscan_store::{Corpus, CorpusStats, IngestMeta, NewFace, NewPhoto, PhotoRecord, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

/// Raw face hits fetched per requested photo; photos often hold several faces.
const HITS_PER_RESULT: usize = 4;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid image: {0}")]
    InvalidInput(String),
    #[error("no face found in the selfie")]
    NoFaceInSelfie,
    #[error("image processing exceeded {0:?}")]
    TimedOut(Duration),
    #[error("invalid search parameter: {0}")]
    InvalidParameter(String),
    #[error("engine version {engine} does not match corpus version {corpus}")]
    VersionMismatch { engine: String, corpus: String },
    #[error("engine: {0}")]
    Engine(EngineError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("index: {0}")]
    Index(#[from] IndexError),
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<EngineError> for ServiceError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Pipeline(p) if p.is_input_error() => ServiceError::InvalidInput(p.to_string()),
            EngineError::TimedOut(d) => ServiceError::TimedOut(d),
            other => ServiceError::Engine(other),
        }
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(e: tokio::task::JoinError) -> Self {
        ServiceError::Task(e.to_string())
    }
}

impl ServiceError {
    /// Problems with one item that never affect the rest of a batch.
    pub fn is_item_error(&self) -> bool {
        matches!(
            self,
            ServiceError::InvalidInput(_)
                | ServiceError::NoFaceInSelfie
                | ServiceError::TimedOut(_)
                | ServiceError::Engine(_)
                | ServiceError::Index(_)
        )
    }
}

/// Search tuning that is not baked into the stored vectors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchSettings {
    pub threshold: f32,
    pub max_results: usize,
    pub expand: ExpandPolicy,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            threshold: 0.55,
            max_results: 100,
            expand: ExpandPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResult {
    pub photo_id: String,
    pub faces_detected: usize,
    pub faces_indexed: usize,
    /// Faces that were detected but could not be indexed.
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Ingested(IngestResult),
    Failed { error: String },
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub index: usize,
    pub filename: String,
    #[serde(flatten)]
    pub status: ItemStatus,
}

impl ItemOutcome {
    pub fn is_ingested(&self) -> bool {
        matches!(self.status, ItemStatus::Ingested(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub ingested: usize,
    pub failed: usize,
    pub faces_indexed: usize,
    pub outcomes: Vec<ItemOutcome>,
}

/// A matched photo with its stored record, so callers can filter by date or place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoMatch {
    #[serde(flatten)]
    pub result: MatchResult,
    pub photo: PhotoRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Nothing has been ingested yet.
    pub corpus_empty: bool,
    pub threshold: f32,
    /// Lower bound for possible matches; equals `threshold` when no expansion ran.
    pub floor: f32,
    pub expanded: bool,
    pub query_face: Option<FaceBox>,
    pub confirmed: Vec<PhotoMatch>,
    pub possible: Vec<PhotoMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfieCheck {
    pub usable: bool,
    pub face: Option<BoundingBox>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStats {
    #[serde(flatten)]
    pub corpus: CorpusStats,
    pub workers: usize,
    pub threshold: f32,
}

/// Ingest and search over one corpus. Cheap to clone.
#[derive(Clone)]
pub struct PhotoMatcher {
    engine: EngineHandle,
    corpus: Arc<Corpus>,
    settings: MatchSettings,
    pub(crate) imports: ImportTracker,
    pub(crate) import_chunk_size: usize,
}

impl PhotoMatcher {
    /// Join a running engine with an open corpus. Their fusion versions must agree.
    pub fn new(engine: EngineHandle, corpus: Arc<Corpus>, settings: MatchSettings) -> Result<Self, ServiceError> {
        let corpus_tag = corpus.snapshot().tag().to_string();
        if engine.version().tag() != corpus_tag {
            return Err(ServiceError::VersionMismatch {
                engine: engine.version().tag(),
                corpus: corpus_tag,
            });
        }
        Ok(Self {
            engine,
            corpus,
            settings,
            imports: ImportTracker::default(),
            import_chunk_size: 16,
        })
    }

    /// Load models, start the workers and open the corpus described by `config`.
    pub fn start(config: &Config) -> Result<Self, ServiceError> {
        let model_dir = config.model_dir.clone();
        let pipeline_settings = config.pipeline_settings();
        let engine = spawn_engine(config.workers, config.image_timeout(), move |_| {
            Pipeline::load(&model_dir, pipeline_settings)
        })?;
        let corpus = Corpus::open(&config.data_dir, engine.version(), config.index_settings())?;
        let settings = MatchSettings {
            threshold: config.similarity_threshold,
            max_results: config.max_results,
            expand: config.expand_policy(),
        };
        Ok(Self::new(engine, Arc::new(corpus), settings)?.with_import_chunk_size(config.import_chunk_size))
    }

    /// Photos committed per write during a bulk import.
    pub fn with_import_chunk_size(mut self, size: usize) -> Self {
        self.import_chunk_size = size.max(1);
        self
    }

    pub fn settings(&self) -> &MatchSettings {
        &self.settings
    }

    pub fn corpus(&self) -> &Arc<Corpus> {
        &self.corpus
    }

    /// Add one photo. A photo without faces is still recorded.
    pub async fn ingest(&self, bytes: Vec<u8>, meta: IngestMeta) -> Result<IngestResult, ServiceError> {
        let prepared = self.prepare(bytes, meta).await?;
        let mut results = self.commit(vec![prepared]).await?;
        results.pop().ok_or_else(|| ServiceError::Task("commit returned no record".into()))
    }

    /// Add many photos. Items are processed in parallel and fail independently;
    /// the successful ones are committed together.
    pub async fn ingest_batch(&self, items: Vec<(Vec<u8>, IngestMeta)>) -> Result<BatchReport, ServiceError> {
        let total = items.len();
        let filenames: Vec<String> = items.iter().map(|(_, m)| m.filename.clone()).collect();

        let mut tasks = JoinSet::new();
        for (index, (bytes, meta)) in items.into_iter().enumerate() {
            let this = self.clone();
            tasks.spawn(async move { (index, this.prepare(bytes, meta).await) });
        }

        let mut prepared: Vec<Option<Result<Prepared, ServiceError>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => prepared[index] = Some(result),
                Err(e) => tracing::error!(error = %e, "ingest task failed"),
            }
        }

        let mut statuses: Vec<Option<ItemStatus>> = (0..total).map(|_| None).collect();
        let mut to_commit = Vec::new();
        let mut commit_slots = Vec::new();
        for (index, slot) in prepared.into_iter().enumerate() {
            match slot {
                Some(Ok(p)) => {
                    commit_slots.push(index);
                    to_commit.push(p);
                }
                Some(Err(ServiceError::TimedOut(_))) => statuses[index] = Some(ItemStatus::TimedOut),
                Some(Err(e)) if e.is_item_error() => {
                    statuses[index] = Some(ItemStatus::Failed { error: e.to_string() })
                }
                Some(Err(e)) => return Err(e),
                None => {
                    statuses[index] = Some(ItemStatus::Failed {
                        error: "ingest task aborted".into(),
                    })
                }
            }
        }

        let committed = self.commit(to_commit).await?;
        for (index, result) in commit_slots.into_iter().zip(committed) {
            statuses[index] = Some(ItemStatus::Ingested(result));
        }

        let mut report = BatchReport::default();
        for (index, (status, filename)) in statuses.into_iter().zip(filenames).enumerate() {
            let status = status.unwrap_or(ItemStatus::Failed {
                error: "no outcome recorded".into(),
            });
            match &status {
                ItemStatus::Ingested(r) => {
                    report.ingested += 1;
                    report.faces_indexed += r.faces_indexed;
                }
                _ => report.failed += 1,
            }
            report.outcomes.push(ItemOutcome { index, filename, status });
        }

        tracing::info!(
            total,
            ingested = report.ingested,
            failed = report.failed,
            faces = report.faces_indexed,
            "batch ingested"
        );
        Ok(report)
    }

    /// Photos containing the selfie's face, split into confirmed and possible matches.
    ///
    /// `threshold` and `top_k` default to the configured values. An empty
    /// corpus yields an empty response flagged `corpus_empty`.
    pub async fn search(
        &self,
        selfie: Vec<u8>,
        threshold: Option<f32>,
        top_k: Option<usize>,
    ) -> Result<SearchResponse, ServiceError> {
        let threshold = threshold.unwrap_or(self.settings.threshold);
        if !threshold.is_finite() {
            return Err(ServiceError::InvalidParameter(format!("threshold {threshold}")));
        }
        let cap = top_k.unwrap_or(self.settings.max_results);

        let snapshot = self.corpus.snapshot();
        if snapshot.is_empty() {
            return Ok(SearchResponse {
                corpus_empty: true,
                threshold,
                floor: threshold,
                ..SearchResponse::default()
            });
        }

        let query = self.engine.query(selfie).await?.ok_or(ServiceError::NoFaceInSelfie)?;
        snapshot.check_compatible(&query.vector)?;
        let query_face = query.bbox.face_box();

        let expand = self.settings.expand;
        let (outcome, floor, expanded) = tokio::task::spawn_blocking(move || {
            let k = cap.saturating_mul(HITS_PER_RESULT).min(snapshot.len());
            let primary = snapshot.search(&query.vector, k, SearchParams::default())?;
            let floor = expand.secondary_floor(threshold, count_confirmed(&primary, threshold));
            let secondary = match floor {
                Some(_) => Some(snapshot.search(
                    &query.vector,
                    k.saturating_mul(2).min(snapshot.len()),
                    SearchParams::exhaustive(),
                )?),
                None => None,
            };
            let floor_value = floor.unwrap_or(threshold);
            let outcome = aggregate(&primary, secondary.as_deref(), threshold, floor_value, cap);
            Ok::<_, IndexError>((outcome, floor_value, floor.is_some()))
        })
        .await??;

        let confirmed = self.attach_records(outcome.confirmed).await?;
        let possible = self.attach_records(outcome.possible).await?;

        tracing::info!(
            threshold,
            floor,
            expanded,
            confirmed = confirmed.len(),
            possible = possible.len(),
            "search complete"
        );

        Ok(SearchResponse {
            corpus_empty: false,
            threshold,
            floor,
            expanded,
            query_face: Some(query_face),
            confirmed,
            possible,
        })
    }

    /// Whether a selfie has a usable face, without searching.
    pub async fn validate_selfie(&self, selfie: Vec<u8>) -> Result<SelfieCheck, ServiceError> {
        let face = self.engine.query(selfie).await?.map(|f| f.bbox);
        Ok(SelfieCheck {
            usable: face.is_some(),
            face,
        })
    }

    pub async fn delete_photo(&self, photo_id: &str) -> Result<bool, ServiceError> {
        let corpus = Arc::clone(&self.corpus);
        let id = photo_id.to_string();
        Ok(tokio::task::spawn_blocking(move || corpus.delete_photo(&id)).await??)
    }

    pub async fn reset(&self) -> Result<(), ServiceError> {
        let corpus = Arc::clone(&self.corpus);
        Ok(tokio::task::spawn_blocking(move || corpus.reset()).await??)
    }

    pub async fn photo(&self, photo_id: &str) -> Result<Option<PhotoRecord>, ServiceError> {
        let corpus = Arc::clone(&self.corpus);
        let id = photo_id.to_string();
        Ok(tokio::task::spawn_blocking(move || corpus.photo(&id)).await??)
    }

    pub async fn list_photos(&self, limit: usize) -> Result<Vec<PhotoRecord>, ServiceError> {
        let corpus = Arc::clone(&self.corpus);
        Ok(tokio::task::spawn_blocking(move || corpus.list_photos(limit)).await??)
    }

    pub async fn stats(&self) -> Result<ServiceStats, ServiceError> {
        let corpus = Arc::clone(&self.corpus);
        let stats = tokio::task::spawn_blocking(move || corpus.stats()).await??;
        Ok(ServiceStats {
            corpus: stats,
            workers: self.engine.workers(),
            threshold: self.settings.threshold,
        })
    }

    async fn prepare(&self, bytes: Vec<u8>, meta: IngestMeta) -> Result<Prepared, ServiceError> {
        let extraction = self.engine.extract(bytes).await?;
        let snapshot = self.corpus.snapshot();

        let mut errors = extraction.errors;
        let mut faces = Vec::with_capacity(extraction.faces.len());
        for face in extraction.faces {
            match snapshot.check_compatible(&face.vector) {
                Ok(()) => faces.push(NewFace {
                    face: face.bbox.face_box(),
                    confidence: face.bbox.confidence,
                    vector: face.vector,
                }),
                Err(e) => errors.push(e.to_string()),
            }
        }

        Ok(Prepared {
            detected: extraction.detected,
            errors,
            photo: NewPhoto { meta, faces },
        })
    }

    async fn commit(&self, prepared: Vec<Prepared>) -> Result<Vec<IngestResult>, ServiceError> {
        let mut summaries = Vec::with_capacity(prepared.len());
        let mut photos = Vec::with_capacity(prepared.len());
        for p in prepared {
            summaries.push((p.detected, p.photo.faces.len(), p.errors));
            photos.push(p.photo);
        }

        let corpus = Arc::clone(&self.corpus);
        let records = tokio::task::spawn_blocking(move || corpus.commit(photos)).await??;

        Ok(records
            .into_iter()
            .zip(summaries)
            .map(|(record, (faces_detected, faces_indexed, errors))| IngestResult {
                photo_id: record.id,
                faces_detected,
                faces_indexed,
                errors,
            })
            .collect())
    }

    /// Pair each result with its photo record; photos deleted meanwhile are dropped.
    async fn attach_records(&self, results: Vec<MatchResult>) -> Result<Vec<PhotoMatch>, ServiceError> {
        let corpus = Arc::clone(&self.corpus);
        let matches = tokio::task::spawn_blocking(move || {
            let mut matches = Vec::with_capacity(results.len());
            for result in results {
                if let Some(photo) = corpus.photo(&result.photo_id)? {
                    matches.push(PhotoMatch { result, photo });
                }
            }
            Ok::<_, StoreError>(matches)
        })
        .await??;
        Ok(matches)
    }
}

/// A photo processed by the engine and waiting to be committed.
struct Prepared {
    detected: usize,
    errors: Vec<String>,
    photo: NewPhoto,
}
