use anyhow::{Context, Result};
use std::sync::Arc;
use swift_uploader::{ByteSource, FileSource, ProgressUpdate, ReqwestTransport, SwiftUploader};
use tracing_subscriber::EnvFilter;

mod config;

/// Log progress every time another tenth of the file is stored.
const PROGRESS_STEP: f64 = 0.1;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = config::AppConfig::from_env_and_args()?;
    tracing::info!("Starting swift-upload with config: {:?}", cfg);

    // --- Open source file ---
    let file = FileSource::open(&cfg.file)
        .await
        .with_context(|| format!("opening {}", cfg.file.display()))?;
    let object_path = match cfg.object_path.clone().or_else(|| file.file_name()) {
        Some(path) => path,
        None => anyhow::bail!("cannot derive an object name from {}", cfg.file.display()),
    };
    tracing::debug!(
        "Source {} is {} bytes, target {}/{}",
        file.path().display(),
        file.size(),
        cfg.container,
        object_path
    );

    // --- Build transport + uploader ---
    let client = reqwest::Client::builder()
        .build()
        .context("building HTTP client")?;
    let uploader = SwiftUploader::keystone(Arc::new(ReqwestTransport::new(client)));

    // --- Upload ---
    let mut next_report = PROGRESS_STEP;
    let on_progress = move |update: ProgressUpdate| {
        if update.fraction >= next_report {
            tracing::info!(
                "{:.0}% uploaded ({} bytes)",
                update.fraction * 100.0,
                update.total_bytes_sent
            );
            while next_report <= update.fraction {
                next_report += PROGRESS_STEP;
            }
        }
    };
    let bytes = uploader
        .upload_file(
            &cfg.credentials,
            &file,
            &cfg.container,
            &object_path,
            cfg.upload_options(),
            on_progress,
        )
        .await
        .with_context(|| format!("uploading {} to {}", cfg.file.display(), cfg.container))?;

    tracing::info!("Uploaded {} bytes to {}/{}", bytes, cfg.container, object_path);
    Ok(())
}
