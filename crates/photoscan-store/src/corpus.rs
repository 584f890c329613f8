//! The corpus: vector index and metadata, opened, checked and written together.
//!
//! Readers take an `Arc` snapshot of the index and never see a half-applied
//! write. Writers are serialized by the metadata lock; each write clones the
//! current index, applies the change, persists both halves and only then
//! publishes the new snapshot.

use crate::index_file;
use crate::metadata::MetadataStore;
use crate::records::{FaceRecord, NewPhoto, PhotoRecord};
use crate::StoreError;
use chrono::Utc;
use photoscan_core::{FusionVersion, IndexMode, IndexSettings, VectorIndex};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use uuid::Uuid;

pub const INDEX_FILE: &str = "faces.idx";
pub const DB_FILE: &str = "metadata.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusStats {
    pub photos: usize,
    pub faces: usize,
    pub vectors: usize,
    pub mode: IndexMode,
    pub dim: usize,
    pub version_tag: String,
}

pub struct Corpus {
    dir: PathBuf,
    index_path: PathBuf,
    snapshot: RwLock<Arc<VectorIndex>>,
    writer: Mutex<MetadataStore>,
}

impl Corpus {
    /// Open (or create) the corpus in `dir` for vectors of `version`.
    ///
    /// Fails when only one of the two files exists, when the stored version
    /// differs from `version`, or when indexed vector ids and face rows differ.
    pub fn open(dir: &Path, version: &FusionVersion, settings: IndexSettings) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let index_path = dir.join(INDEX_FILE);
        let db_path = dir.join(DB_FILE);
        let expected = version.tag();

        let index = match (index_path.exists(), db_path.exists()) {
            (false, false) => {
                let index = VectorIndex::new(version.clone(), settings);
                let meta = MetadataStore::open(&db_path)?;
                meta.set_version_tag(&expected)?;
                let temp = index_file::write_temp(&index_path, &index)?;
                index_file::publish(&temp, &index_path)?;
                tracing::info!(dir = %dir.display(), version = %expected, "created new corpus");
                index
            }
            (true, false) => {
                return Err(StoreError::MissingCounterpart {
                    present: INDEX_FILE.into(),
                    missing: DB_FILE.into(),
                })
            }
            (false, true) => {
                return Err(StoreError::MissingCounterpart {
                    present: DB_FILE.into(),
                    missing: INDEX_FILE.into(),
                })
            }
            (true, true) => {
                let mut index = index_file::load(&index_path)?;
                if index.tag() != expected || index.version() != version {
                    return Err(StoreError::VersionMismatch {
                        expected,
                        found: index.tag().to_string(),
                    });
                }
                index.apply_settings(settings);
                index
            }
        };

        let meta = MetadataStore::open(&db_path)?;
        match meta.version_tag()? {
            Some(tag) if tag == expected => {}
            found => {
                return Err(StoreError::VersionMismatch {
                    expected,
                    found: found.unwrap_or_else(|| "<none>".into()),
                })
            }
        }
        check_consistent(&index, &meta)?;

        tracing::info!(
            dir = %dir.display(),
            vectors = index.len(),
            mode = ?index.mode(),
            "opened corpus"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            index_path,
            snapshot: RwLock::new(Arc::new(index)),
            writer: Mutex::new(meta),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The current index. Later writes do not affect a snapshot already taken.
    pub fn snapshot(&self) -> Arc<VectorIndex> {
        let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&*guard)
    }

    /// Store photos and their face vectors as one atomic write.
    ///
    /// Either every photo lands in both the index and the metadata table, or
    /// none does.
    pub fn commit(&self, photos: Vec<NewPhoto>) -> Result<Vec<PhotoRecord>, StoreError> {
        if photos.is_empty() {
            return Ok(Vec::new());
        }
        let mut meta = self.lock_writer();
        let mut next = (*self.snapshot()).clone();
        let now = Utc::now();

        let mut rows = Vec::with_capacity(photos.len());
        for photo in photos {
            let photo_id = Uuid::new_v4().to_string();
            let mut faces = Vec::with_capacity(photo.faces.len());
            for face in photo.faces {
                let id = next.insert(face.vector, &photo_id, face.face)?;
                faces.push(FaceRecord {
                    id,
                    photo_id: photo_id.clone(),
                    face: face.face,
                    confidence: face.confidence,
                    created_at: now,
                });
            }
            let record = PhotoRecord {
                id: photo_id,
                filename: photo.meta.filename,
                path: photo.meta.path,
                captured_at: photo.meta.captured_at,
                location: photo.meta.location,
                ingested_at: now,
                face_count: faces.len(),
            };
            rows.push((record, faces));
        }

        self.persist(&mut meta, next, |meta| meta.insert_photos(&rows))?;

        tracing::debug!(photos = rows.len(), "committed photos");
        Ok(rows.into_iter().map(|(record, _)| record).collect())
    }

    /// Remove a photo and all of its vectors. The index is rebuilt.
    pub fn delete_photo(&self, photo_id: &str) -> Result<bool, StoreError> {
        let mut meta = self.lock_writer();
        if meta.photo(photo_id)?.is_none() {
            return Ok(false);
        }
        let mut next = (*self.snapshot()).clone();
        let removed = next.remove_photo(photo_id);
        self.persist(&mut meta, next, |meta| meta.delete_photo(photo_id).map(|_| ()))?;
        tracing::info!(photo_id, vectors = removed, "deleted photo");
        Ok(true)
    }

    /// Drop every photo, face and vector. The version tag is kept.
    pub fn reset(&self) -> Result<(), StoreError> {
        let mut meta = self.lock_writer();
        let mut next = (*self.snapshot()).clone();
        next.clear();
        self.persist(&mut meta, next, MetadataStore::clear)?;
        tracing::info!(dir = %self.dir.display(), "corpus reset");
        Ok(())
    }

    pub fn photo(&self, photo_id: &str) -> Result<Option<PhotoRecord>, StoreError> {
        Ok(self.lock_writer().photo(photo_id)?)
    }

    pub fn list_photos(&self, limit: usize) -> Result<Vec<PhotoRecord>, StoreError> {
        Ok(self.lock_writer().list_photos(limit)?)
    }

    pub fn stats(&self) -> Result<CorpusStats, StoreError> {
        let (photos, faces) = self.lock_writer().counts()?;
        let index = self.snapshot();
        Ok(CorpusStats {
            photos,
            faces,
            vectors: index.len(),
            mode: index.mode(),
            dim: index.dim(),
            version_tag: index.tag().to_string(),
        })
    }

    fn lock_writer(&self) -> MutexGuard<'_, MetadataStore> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Index temp file, then the metadata transaction, then rename and publish.
    fn persist<F>(&self, meta: &mut MetadataStore, next: VectorIndex, write_meta: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut MetadataStore) -> Result<(), rusqlite::Error>,
    {
        let temp = index_file::write_temp(&self.index_path, &next)?;
        if let Err(e) = write_meta(meta) {
            index_file::discard(&temp);
            return Err(e.into());
        }
        index_file::publish(&temp, &self.index_path)?;

        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(next);
        Ok(())
    }
}

fn check_consistent(index: &VectorIndex, meta: &MetadataStore) -> Result<(), StoreError> {
    let mut indexed: Vec<u64> = index.entries().iter().map(|e| e.id).collect();
    indexed.sort_unstable();
    let rows = meta.face_ids()?;
    if indexed == rows {
        return Ok(());
    }

    let orphan = indexed.iter().find(|id| rows.binary_search(id).is_err());
    let missing = rows.iter().find(|id| indexed.binary_search(id).is_err());
    Err(StoreError::Inconsistent(format!(
        "{} indexed vectors vs {} face rows (first vector without row: {:?}, first row without vector: {:?})",
        indexed.len(),
        rows.len(),
        orphan,
        missing
    )))
}
