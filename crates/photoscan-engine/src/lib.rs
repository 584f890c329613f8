//! photoscan-engine: the face-matching service.
//!
//! A pool of worker threads owns the ONNX pipelines; async callers reach them
//! through [`EngineHandle`]. [`PhotoMatcher`] ties the engine to a persisted
//! [`photoscan_store::Corpus`] and exposes ingest, batch ingest, search,
//! background directory imports and corpus maintenance.

pub mod config;
pub mod engine;
pub mod import;
pub mod service;

pub use config::{Config, ConfigError};
pub use engine::{spawn_engine, EngineError, EngineHandle};
pub use import::{scan_directory, ImportState, ImportStatus, ALLOWED_EXTENSIONS};
pub use service::{
    BatchReport, IngestResult, ItemOutcome, ItemStatus, MatchSettings, PhotoMatch, PhotoMatcher,
    SearchResponse, SelfieCheck, ServiceError, ServiceStats,
};

pub use photoscan_core;
pub use photoscan_store;
