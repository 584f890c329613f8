pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS corpus_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS photos (
    id          TEXT PRIMARY KEY,
    filename    TEXT NOT NULL,
    path        TEXT,
    captured_at INTEGER,
    latitude    REAL,
    longitude   REAL,
    place       TEXT,
    ingested_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS faces (
    id         INTEGER PRIMARY KEY,
    photo_id   TEXT NOT NULL REFERENCES photos(id) ON DELETE CASCADE,
    x          REAL NOT NULL,
    y          REAL NOT NULL,
    width      REAL NOT NULL,
    height     REAL NOT NULL,
    confidence REAL NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_faces_photo ON faces(photo_id);
CREATE INDEX IF NOT EXISTS idx_photos_captured ON photos(captured_at);
"#;

pub(crate) const VERSION_KEY: &str = "fusion_version";
