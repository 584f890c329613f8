//! On-disk form of the vector index.
//!
//! Writes go to a sibling temp file that is renamed into place only after the
//! metadata transaction commits, so a crash never leaves a half-written index.

use crate::StoreError;
use photoscan_core::VectorIndex;
use std::path::{Path, PathBuf};

pub fn load(path: &Path) -> Result<VectorIndex, StoreError> {
    let data = std::fs::read(path)?;
    bincode::deserialize(&data).map_err(|e| StoreError::IndexFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Serialize `index` next to `path` and return the temp file's location.
pub fn write_temp(path: &Path, index: &VectorIndex) -> Result<PathBuf, StoreError> {
    let data = bincode::serialize(index).map_err(|e| StoreError::IndexFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let temp = path.with_extension("idx.tmp");
    std::fs::write(&temp, &data)?;
    Ok(temp)
}

/// Atomically replace `path` with a previously written temp file.
pub fn publish(temp: &Path, path: &Path) -> Result<(), StoreError> {
    std::fs::rename(temp, path)?;
    Ok(())
}

pub fn discard(temp: &Path) {
    if let Err(e) = std::fs::remove_file(temp) {
        tracing::warn!(path = %temp.display(), error = %e, "failed to remove temp index file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photoscan_core::{FaceBox, FusedVector, FusionVersion, FusionWeights, IndexSettings, SearchParams};

    #[test]
    fn test_written_index_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.idx");
        let version = FusionVersion {
            shape_model: "s".into(),
            shape_dim: 2,
            texture_model: "t".into(),
            texture_dim: 1,
            weights: FusionWeights::default(),
        };
        let mut index = VectorIndex::new(version.clone(), IndexSettings::default());
        let vector = FusedVector { values: vec![0.6, 0.8, 0.0], version_tag: version.tag() };
        let face = FaceBox { x: 1.0, y: 2.0, width: 3.0, height: 4.0 };
        index.insert(vector.clone(), "photo", face).unwrap();

        let temp = write_temp(&path, &index).unwrap();
        assert!(!path.exists());
        publish(&temp, &path).unwrap();
        assert!(!temp.exists());

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.tag(), version.tag());
        let hits = loaded.search(&vector, 1, SearchParams::default()).unwrap();
        assert_eq!(hits[0].photo_id, "photo");
        assert_eq!(hits[0].face, face);
    }

    #[test]
    fn test_garbage_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.idx");
        std::fs::write(&path, b"\x01\x02").unwrap();
        assert!(matches!(load(&path), Err(StoreError::IndexFile { .. })));
    }
}
