//! Rows of the metadata side-table and the inputs that create them.

use chrono::{DateTime, Utc};
use photoscan_core::{FaceBox, FusedVector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub name: Option<String>,
}

/// Caller-supplied facts about a photo being ingested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestMeta {
    pub filename: String,
    pub path: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
    pub location: Option<GeoPoint>,
}

impl IngestMeta {
    pub fn named(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub id: String,
    pub filename: String,
    pub path: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
    pub location: Option<GeoPoint>,
    pub ingested_at: DateTime<Utc>,
    pub face_count: usize,
}

/// A stored face. `id` is also its vector id in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub id: u64,
    pub photo_id: String,
    pub face: FaceBox,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFace {
    pub face: FaceBox,
    pub confidence: f32,
    pub vector: FusedVector,
}

/// A photo ready to be committed; zero faces is valid.
#[derive(Debug, Clone)]
pub struct NewPhoto {
    pub meta: IngestMeta,
    pub faces: Vec<NewFace>,
}
