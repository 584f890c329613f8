use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use photoscan_engine::photoscan_store::{GeoPoint, IngestMeta};
use photoscan_engine::{Config, PhotoMatcher};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "photoscan", about = "Find the event photos you appear in")]
struct Cli {
    /// Config file (overrides PHOTOSCAN_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest one or more photos
    Ingest {
        files: Vec<PathBuf>,
        /// When the photos were taken (RFC 3339)
        #[arg(long)]
        captured_at: Option<DateTime<Utc>>,
        /// Latitude of the place the photos were taken
        #[arg(long, requires = "longitude")]
        latitude: Option<f64>,
        #[arg(long, requires = "latitude")]
        longitude: Option<f64>,
        /// Human-readable place name
        #[arg(long)]
        place: Option<String>,
    },
    /// Search the corpus with a selfie
    Search {
        selfie: PathBuf,
        /// Similarity threshold for confirmed matches
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Maximum number of photos to return
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Check that a selfie contains a usable face
    Validate { selfie: PathBuf },
    /// Import every image under a directory and wait for it to finish
    Import {
        dir: PathBuf,
        /// Do not log progress while waiting
        #[arg(short, long)]
        quiet: bool,
    },
    /// List ingested photos
    List {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Show corpus statistics
    Stats,
    /// Remove a photo and its faces
    Remove { photo_id: String },
    /// Delete every photo, face and vector
    Reset {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_overrides(|key| std::env::var(key).ok());
            config
        }
        None => Config::load()?,
    };
    tracing::debug!(?config, "configuration loaded");

    let matcher = PhotoMatcher::start(&config).context("failed to start the matching engine")?;

    match cli.command {
        Commands::Ingest {
            files,
            captured_at,
            latitude,
            longitude,
            place,
        } => {
            if files.is_empty() {
                bail!("no files given");
            }
            let location = match (latitude, longitude) {
                (Some(latitude), Some(longitude)) => Some(GeoPoint {
                    latitude,
                    longitude,
                    name: place,
                }),
                _ => None,
            };
            let mut items = Vec::with_capacity(files.len());
            for path in &files {
                let bytes = read(path).await?;
                let meta = IngestMeta {
                    filename: file_name(path),
                    path: Some(path.display().to_string()),
                    captured_at,
                    location: location.clone(),
                };
                items.push((bytes, meta));
            }
            print_json(&matcher.ingest_batch(items).await?)?;
        }
        Commands::Search {
            selfie,
            threshold,
            top_k,
        } => {
            let bytes = read(&selfie).await?;
            print_json(&matcher.search(bytes, threshold, top_k).await?)?;
        }
        Commands::Validate { selfie } => {
            let bytes = read(&selfie).await?;
            print_json(&matcher.validate_selfie(bytes).await?)?;
        }
        Commands::Import { dir, quiet } => {
            let id = matcher.start_import(dir);
            tracing::info!(import = %id, "import started");
            let status = loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let Some(status) = matcher.import_status(&id) else {
                    bail!("import {id} disappeared");
                };
                if status.is_finished() {
                    break status;
                }
                if !quiet {
                    tracing::info!(
                        processed = status.processed,
                        total = status.total,
                        ingested = status.ingested,
                        failed = status.failed,
                        "import progress"
                    );
                }
            };
            print_json(&status)?;
        }
        Commands::List { limit } => {
            print_json(&matcher.list_photos(limit).await?)?;
        }
        Commands::Stats => {
            print_json(&matcher.stats().await?)?;
        }
        Commands::Remove { photo_id } => {
            if !matcher.delete_photo(&photo_id).await? {
                bail!("no photo with id {photo_id}");
            }
            println!("removed {photo_id}");
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!("reset deletes every photo; pass --yes to confirm");
            }
            matcher.reset().await?;
            println!("corpus reset");
        }
    }

    Ok(())
}

async fn read(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_waits_for_completion() {
        let cli = Cli::try_parse_from(["photoscan", "import", "/photos", "--quiet"]).unwrap();
        assert!(matches!(cli.command, Commands::Import { quiet: true, .. }));

        // The runtime ends with the command, so there is no way to leave an import running.
        assert!(Cli::try_parse_from(["photoscan", "import", "/photos", "--detach"]).is_err());
    }

    #[test]
    fn test_location_needs_both_coordinates() {
        assert!(Cli::try_parse_from(["photoscan", "ingest", "a.jpg", "--latitude", "1.5"]).is_err());
        let cli = Cli::try_parse_from([
            "photoscan", "ingest", "a.jpg", "--latitude", "1.5", "--longitude", "2.5",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Ingest { latitude: Some(_), longitude: Some(_), .. }));
    }
}
