//! SQLite side-table: photos, their faces, and the corpus version tag.

use crate::records::{FaceRecord, GeoPoint, PhotoRecord};
use crate::schema::{SCHEMA, VERSION_KEY};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

pub struct MetadataStore {
    conn: Connection,
}

const PHOTO_COLUMNS: &str = r#"
    p.id, p.filename, p.path, p.captured_at, p.latitude, p.longitude, p.place, p.ingested_at,
    (SELECT COUNT(*) FROM faces f WHERE f.photo_id = p.id)
"#;

impl MetadataStore {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn version_tag(&self) -> Result<Option<String>, rusqlite::Error> {
        self.conn
            .query_row(
                "SELECT value FROM corpus_meta WHERE key = ?1",
                [VERSION_KEY],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn set_version_tag(&self, tag: &str) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO corpus_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![VERSION_KEY, tag],
        )?;
        Ok(())
    }

    /// All face ids, ascending.
    pub fn face_ids(&self) -> Result<Vec<u64>, rusqlite::Error> {
        let mut stmt = self.conn.prepare("SELECT id FROM faces ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .map(|r| r.map(|id| id as u64))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Insert photos and their faces in one transaction.
    pub fn insert_photos(&mut self, rows: &[(PhotoRecord, Vec<FaceRecord>)]) -> Result<(), rusqlite::Error> {
        let tx = self.conn.transaction()?;
        {
            let mut photo_stmt = tx.prepare(
                "INSERT INTO photos (id, filename, path, captured_at, latitude, longitude, place, ingested_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            let mut face_stmt = tx.prepare(
                "INSERT INTO faces (id, photo_id, x, y, width, height, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;

            for (photo, faces) in rows {
                photo_stmt.execute(params![
                    photo.id,
                    photo.filename,
                    photo.path,
                    photo.captured_at.map(|t| t.timestamp_millis()),
                    photo.location.as_ref().map(|l| l.latitude),
                    photo.location.as_ref().map(|l| l.longitude),
                    photo.location.as_ref().and_then(|l| l.name.clone()),
                    photo.ingested_at.timestamp_millis(),
                ])?;
                for face in faces {
                    face_stmt.execute(params![
                        face.id as i64,
                        face.photo_id,
                        face.face.x,
                        face.face.y,
                        face.face.width,
                        face.face.height,
                        face.confidence,
                        face.created_at.timestamp_millis(),
                    ])?;
                }
            }
        }
        tx.commit()
    }

    /// Remove a photo; its faces go with it. Returns whether the photo existed.
    pub fn delete_photo(&mut self, id: &str) -> Result<bool, rusqlite::Error> {
        let removed = self.conn.execute("DELETE FROM photos WHERE id = ?1", [id])?;
        Ok(removed > 0)
    }

    /// Drop every photo and face. The version tag stays.
    pub fn clear(&mut self) -> Result<(), rusqlite::Error> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM faces", [])?;
        tx.execute("DELETE FROM photos", [])?;
        tx.commit()
    }

    pub fn photo(&self, id: &str) -> Result<Option<PhotoRecord>, rusqlite::Error> {
        self.conn
            .query_row(
                &format!("SELECT {PHOTO_COLUMNS} FROM photos p WHERE p.id = ?1"),
                [id],
                photo_from_row,
            )
            .optional()
    }

    /// Most recently ingested first.
    pub fn list_photos(&self, limit: usize) -> Result<Vec<PhotoRecord>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PHOTO_COLUMNS} FROM photos p ORDER BY p.ingested_at DESC, p.rowid DESC LIMIT ?1"
        ))?;
        let photos = stmt
            .query_map([limit as i64], photo_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(photos)
    }

    pub fn faces_of(&self, photo_id: &str) -> Result<Vec<FaceRecord>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT id, photo_id, x, y, width, height, confidence, created_at
             FROM faces WHERE photo_id = ?1 ORDER BY id",
        )?;
        let faces = stmt
            .query_map([photo_id], |row| {
                Ok(FaceRecord {
                    id: row.get::<_, i64>(0)? as u64,
                    photo_id: row.get(1)?,
                    face: photoscan_core::FaceBox {
                        x: row.get(2)?,
                        y: row.get(3)?,
                        width: row.get(4)?,
                        height: row.get(5)?,
                    },
                    confidence: row.get(6)?,
                    created_at: from_millis(row.get(7)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(faces)
    }

    /// (photos, faces)
    pub fn counts(&self) -> Result<(usize, usize), rusqlite::Error> {
        self.conn.query_row(
            "SELECT (SELECT COUNT(*) FROM photos), (SELECT COUNT(*) FROM faces)",
            [],
            |row| Ok((row.get::<_, i64>(0)? as usize, row.get::<_, i64>(1)? as usize)),
        )
    }
}

fn photo_from_row(row: &Row<'_>) -> Result<PhotoRecord, rusqlite::Error> {
    let latitude: Option<f64> = row.get(4)?;
    let longitude: Option<f64> = row.get(5)?;
    let location = match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(GeoPoint {
            latitude,
            longitude,
            name: row.get(6)?,
        }),
        _ => None,
    };

    Ok(PhotoRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        path: row.get(2)?,
        captured_at: row.get::<_, Option<i64>>(3)?.map(from_millis),
        location,
        ingested_at: from_millis(row.get(7)?),
        face_count: row.get::<_, i64>(8)? as usize,
    })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
