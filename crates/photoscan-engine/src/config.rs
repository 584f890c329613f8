use photoscan_core::{ExpandPolicy, FusionWeights, IndexSettings, Metric, PipelineSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Engine configuration.
///
/// Defaults, then an optional TOML file named by `PHOTOSCAN_CONFIG`, then
/// `PHOTOSCAN_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Directory holding `faces.idx` and `metadata.db`.
    pub data_dir: PathBuf,
    /// Similarity at or above which a photo is a confirmed match.
    pub similarity_threshold: f32,
    /// Detections below this confidence are discarded.
    pub min_face_confidence: f32,
    pub max_faces: usize,
    /// Cap on photos returned per search (confirmed plus possible).
    pub max_results: usize,
    /// Average each embedding with its mirrored crop.
    pub tta: bool,
    pub workers: usize,
    /// Per-image processing timeout, in seconds.
    pub image_timeout_secs: u64,
    pub shape_weight: f32,
    pub texture_weight: f32,
    pub metric: Metric,
    /// Vector count at which the index switches to IVF; 0 keeps it exact.
    pub ivf_min_vectors: usize,
    pub nlist: usize,
    pub nprobe: usize,
    pub expand_enabled: bool,
    pub expand_max_primary_photos: usize,
    pub expand_margin: f32,
    pub expand_min_threshold: f32,
    pub expand_fallback_threshold: f32,
    /// Photos committed per write during a bulk import.
    pub import_chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        let index = IndexSettings::default();
        let expand = ExpandPolicy::default();
        let pipeline = PipelineSettings::default();
        Self {
            model_dir: data_dir.join("models"),
            data_dir,
            similarity_threshold: 0.55,
            min_face_confidence: pipeline.min_confidence,
            max_faces: pipeline.max_faces,
            max_results: 100,
            tta: pipeline.tta,
            workers: 2,
            image_timeout_secs: 30,
            shape_weight: pipeline.weights.shape,
            texture_weight: pipeline.weights.texture,
            metric: index.metric,
            ivf_min_vectors: index.ivf_min_vectors.unwrap_or(0),
            nlist: index.nlist,
            nprobe: index.nprobe,
            expand_enabled: expand.enabled,
            expand_max_primary_photos: expand.max_primary_photos,
            expand_margin: expand.margin,
            expand_min_threshold: expand.min_threshold,
            expand_fallback_threshold: expand.fallback_threshold,
            import_chunk_size: 16,
        }
    }
}

impl Config {
    /// Load the layered configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("PHOTOSCAN_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse TOML; keys that are absent keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `PHOTOSCAN_*` overrides read through `lookup`. Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("PHOTOSCAN_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("PHOTOSCAN_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        self.similarity_threshold = env_parse(&lookup, "PHOTOSCAN_SIMILARITY_THRESHOLD", self.similarity_threshold);
        self.min_face_confidence = env_parse(&lookup, "PHOTOSCAN_MIN_FACE_CONFIDENCE", self.min_face_confidence);
        self.max_faces = env_parse(&lookup, "PHOTOSCAN_MAX_FACES", self.max_faces);
        self.max_results = env_parse(&lookup, "PHOTOSCAN_MAX_RESULTS", self.max_results);
        self.tta = env_flag(&lookup, "PHOTOSCAN_TTA", self.tta);
        self.workers = env_parse(&lookup, "PHOTOSCAN_WORKERS", self.workers);
        self.image_timeout_secs = env_parse(&lookup, "PHOTOSCAN_IMAGE_TIMEOUT_SECS", self.image_timeout_secs);
        self.shape_weight = env_parse(&lookup, "PHOTOSCAN_SHAPE_WEIGHT", self.shape_weight);
        self.texture_weight = env_parse(&lookup, "PHOTOSCAN_TEXTURE_WEIGHT", self.texture_weight);
        self.metric = match lookup("PHOTOSCAN_METRIC").as_deref() {
            Some("cosine") => Metric::Cosine,
            Some("inner_product") => Metric::InnerProduct,
            _ => self.metric,
        };
        self.ivf_min_vectors = env_parse(&lookup, "PHOTOSCAN_IVF_MIN_VECTORS", self.ivf_min_vectors);
        self.nlist = env_parse(&lookup, "PHOTOSCAN_NLIST", self.nlist);
        self.nprobe = env_parse(&lookup, "PHOTOSCAN_NPROBE", self.nprobe);
        self.expand_enabled = env_flag(&lookup, "PHOTOSCAN_EXPAND_ENABLED", self.expand_enabled);
        self.expand_max_primary_photos =
            env_parse(&lookup, "PHOTOSCAN_EXPAND_MAX_PRIMARY_PHOTOS", self.expand_max_primary_photos);
        self.expand_margin = env_parse(&lookup, "PHOTOSCAN_EXPAND_MARGIN", self.expand_margin);
        self.expand_min_threshold = env_parse(&lookup, "PHOTOSCAN_EXPAND_MIN_THRESHOLD", self.expand_min_threshold);
        self.expand_fallback_threshold =
            env_parse(&lookup, "PHOTOSCAN_EXPAND_FALLBACK_THRESHOLD", self.expand_fallback_threshold);
        self.import_chunk_size = env_parse(&lookup, "PHOTOSCAN_IMPORT_CHUNK_SIZE", self.import_chunk_size);
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            min_confidence: self.min_face_confidence,
            max_faces: self.max_faces,
            tta: self.tta,
            weights: FusionWeights {
                shape: self.shape_weight,
                texture: self.texture_weight,
            },
            ..PipelineSettings::default()
        }
    }

    pub fn index_settings(&self) -> IndexSettings {
        IndexSettings {
            metric: self.metric,
            ivf_min_vectors: (self.ivf_min_vectors > 0).then_some(self.ivf_min_vectors),
            nlist: self.nlist.max(1),
            nprobe: self.nprobe.max(1),
            ..IndexSettings::default()
        }
    }

    pub fn expand_policy(&self) -> ExpandPolicy {
        ExpandPolicy {
            enabled: self.expand_enabled,
            max_primary_photos: self.expand_max_primary_photos,
            margin: self.expand_margin,
            min_threshold: self.expand_min_threshold,
            fallback_threshold: self.expand_fallback_threshold,
        }
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_secs(self.image_timeout_secs.max(1))
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("photoscan")
}

fn env_parse<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|v| v != "0" && v != "false").unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.similarity_threshold, 0.55);
        assert_eq!(config.min_face_confidence, 0.5);
        assert_eq!(config.max_faces, 50);
        assert_eq!(config.max_results, 100);
        assert_eq!(config.index_settings().ivf_min_vectors, Some(1000));
        assert_eq!(config.index_settings().nlist, 100);
        assert_eq!(config.index_settings().nprobe, 10);
        assert_eq!(config.expand_policy(), ExpandPolicy::default());
        assert!(config.data_dir.ends_with("photoscan"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            similarity_threshold = 0.6
            metric = "cosine"
            ivf_min_vectors = 0
            data_dir = "/srv/photoscan"
            "#,
        )
        .unwrap();
        assert_eq!(config.similarity_threshold, 0.6);
        assert_eq!(config.metric, Metric::Cosine);
        assert_eq!(config.index_settings().ivf_min_vectors, None);
        assert_eq!(config.data_dir, PathBuf::from("/srv/photoscan"));
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        assert!(matches!(
            Config::from_toml_str("similarity_threshold = \"high\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("PHOTOSCAN_SIMILARITY_THRESHOLD", "0.5"),
            ("PHOTOSCAN_TTA", "0"),
            ("PHOTOSCAN_WORKERS", "not-a-number"),
            ("PHOTOSCAN_METRIC", "cosine"),
            ("PHOTOSCAN_MODEL_DIR", "/opt/models"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::from_toml_str("similarity_threshold = 0.7\nworkers = 4").unwrap();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.similarity_threshold, 0.5);
        assert!(!config.tta);
        assert_eq!(config.workers, 4);
        assert_eq!(config.metric, Metric::Cosine);
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
    }

    #[test]
    fn test_env_overrides_expand_policy() {
        let env: HashMap<&str, &str> = [
            ("PHOTOSCAN_EXPAND_MAX_PRIMARY_PHOTOS", "3"),
            ("PHOTOSCAN_EXPAND_MARGIN", "0.05"),
            ("PHOTOSCAN_EXPAND_MIN_THRESHOLD", "0.4"),
            ("PHOTOSCAN_EXPAND_FALLBACK_THRESHOLD", "0.35"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        let policy = config.expand_policy();
        assert_eq!(policy.max_primary_photos, 3);
        assert_eq!(policy.margin, 0.05);
        assert_eq!(policy.min_threshold, 0.4);
        assert_eq!(policy.fallback_threshold, 0.35);
        assert!(policy.enabled);
    }

    #[test]
    fn test_pipeline_settings_carry_weights() {
        let config = Config { shape_weight: 0.6, texture_weight: 0.4, ..Config::default() };
        let settings = config.pipeline_settings();
        assert_eq!(settings.weights, FusionWeights { shape: 0.6, texture: 0.4 });
    }
}
