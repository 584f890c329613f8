//! Bulk imports from a directory, run as background tasks with pollable status.

use crate::service::{PhotoMatcher, ServiceError};
use chrono::{DateTime, Utc};
use photoscan_store::IngestMeta;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

/// File extensions picked up by an import, compared case-insensitively.
pub const ALLOWED_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportState {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportStatus {
    pub id: String,
    pub source: String,
    pub state: ImportState,
    pub total: usize,
    pub processed: usize,
    pub ingested: usize,
    pub failed: usize,
    pub faces_indexed: usize,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ImportStatus {
    /// Fraction of files handled so far, in [0, 1].
    pub fn progress(&self) -> f32 {
        if self.total == 0 {
            return if self.is_finished() { 1.0 } else { 0.0 };
        }
        self.processed as f32 / self.total as f32
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, ImportState::Completed | ImportState::Failed)
    }
}

/// Shared registry of import statuses.
#[derive(Clone, Default)]
pub struct ImportTracker {
    inner: Arc<Mutex<HashMap<String, ImportStatus>>>,
}

impl ImportTracker {
    fn create(&self, source: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let status = ImportStatus {
            id: id.clone(),
            source: source.to_string(),
            state: ImportState::Pending,
            total: 0,
            processed: 0,
            ingested: 0,
            failed: 0,
            faces_indexed: 0,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.lock().insert(id.clone(), status);
        id
    }

    fn update<F: FnOnce(&mut ImportStatus)>(&self, id: &str, f: F) {
        if let Some(status) = self.lock().get_mut(id) {
            f(status);
        }
    }

    fn finish(&self, id: &str, error: Option<String>) {
        self.update(id, |s| {
            s.state = if error.is_some() { ImportState::Failed } else { ImportState::Completed };
            s.error = error;
            s.finished_at = Some(Utc::now());
        });
    }

    pub fn get(&self, id: &str) -> Option<ImportStatus> {
        self.lock().get(id).cloned()
    }

    /// All imports, newest first.
    pub fn list(&self) -> Vec<ImportStatus> {
        let mut all: Vec<ImportStatus> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ImportStatus>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Image files under `dir` (recursively) with an allowed extension, sorted by path.
///
/// Symlinks are not followed. Entries that cannot be read are logged and skipped.
pub fn scan_directory(dir: &Path) -> io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", dir.display()),
        ));
    }

    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && has_allowed_extension(entry.path()))
        .map(DirEntry::into_path)
        .collect();
    found.sort();
    Ok(found)
}

fn has_allowed_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| ALLOWED_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

impl PhotoMatcher {
    /// Start importing every image under `dir` in the background. Returns the import id.
    pub fn start_import(&self, dir: PathBuf) -> String {
        let id = self.imports.create(&dir.display().to_string());
        let matcher = self.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            let result = matcher.run_import(&task_id, dir).await;
            if let Err(e) = &result {
                tracing::error!(import = %task_id, error = %e, "import failed");
            }
            matcher.imports.finish(&task_id, result.err().map(|e| e.to_string()));
        });
        id
    }

    pub fn import_status(&self, id: &str) -> Option<ImportStatus> {
        self.imports.get(id)
    }

    pub fn list_imports(&self) -> Vec<ImportStatus> {
        self.imports.list()
    }

    async fn run_import(&self, id: &str, dir: PathBuf) -> Result<(), ServiceError> {
        let scan_dir = dir.clone();
        let files = tokio::task::spawn_blocking(move || scan_directory(&scan_dir))
            .await?
            .map_err(|e| ServiceError::InvalidInput(format!("{}: {e}", dir.display())))?;

        self.imports.update(id, |s| {
            s.state = ImportState::Processing;
            s.total = files.len();
        });
        tracing::info!(import = %id, dir = %dir.display(), files = files.len(), "import started");

        for chunk in files.chunks(self.import_chunk_size) {
            let mut items = Vec::with_capacity(chunk.len());
            let mut unreadable = 0;
            for path in chunk {
                match tokio::fs::read(path).await {
                    Ok(bytes) => items.push((bytes, meta_for(path))),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable file");
                        unreadable += 1;
                    }
                }
            }

            let report = self.ingest_batch(items).await?;
            self.imports.update(id, |s| {
                s.processed += chunk.len();
                s.ingested += report.ingested;
                s.failed += report.failed + unreadable;
                s.faces_indexed += report.faces_indexed;
            });
        }

        tracing::info!(import = %id, "import completed");
        Ok(())
    }
}

fn meta_for(path: &Path) -> IngestMeta {
    IngestMeta {
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: Some(path.display().to_string()),
        captured_at: None,
        location: None,
    }
}
