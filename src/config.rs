use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use clap::Parser;
use std::env;
use std::path::PathBuf;
use swift_uploader::{Credentials, UploadOptions};
use swift_uploader::models::job::{DEFAULT_CONCURRENCY, DEFAULT_SEGMENT_SIZE, DEFAULT_SERVICE_NAME};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub credentials: Credentials,
    pub service_name: String,
    pub file: PathBuf,
    pub container: String,
    pub object_path: Option<String>,
    pub concurrency: usize,
    pub segment_size: u64,
    pub delete_at: Option<DateTime<Utc>>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Segmented uploader for Swift object storage")]
pub struct Args {
    /// File to upload
    pub file: PathBuf,

    /// Target container
    #[arg(long)]
    pub container: String,

    /// Object name inside the container (defaults to the file name)
    #[arg(long)]
    pub object_path: Option<String>,

    /// Identity endpoint (overrides OS_AUTH_URL)
    #[arg(long)]
    pub auth_url: Option<String>,

    /// User name (overrides OS_USERNAME)
    #[arg(long)]
    pub username: Option<String>,

    /// Tenant name (overrides OS_TENANT_NAME)
    #[arg(long)]
    pub tenant: Option<String>,

    /// Service catalog name of the object store (overrides SWIFT_SERVICE_NAME)
    #[arg(long)]
    pub service_name: Option<String>,

    /// Segments uploaded at the same time (overrides SWIFT_UPLOAD_CONCURRENCY)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Maximum segment size, e.g. `104857600`, `512M`, `2G`
    /// (overrides SWIFT_UPLOAD_SEGMENT_SIZE)
    #[arg(long)]
    pub segment_size: Option<String>,

    /// Expiry as unix seconds or RFC 3339
    #[arg(long, conflicts_with = "delete_after")]
    pub delete_at: Option<String>,

    /// Expiry in seconds from now
    #[arg(long)]
    pub delete_after: Option<i64>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();
        Self::resolve(args, |key| env::var(key).ok(), Utc::now())
    }

    /// Merge parsed arguments over values looked up with `env`.
    pub fn resolve(
        args: Args,
        env: impl Fn(&str) -> Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let required = |flag: Option<String>, key: &str| -> Result<String> {
            flag.or_else(|| env(key))
                .with_context(|| format!("missing {} (set the variable or pass the flag)", key))
        };

        let credentials = Credentials {
            auth_url: required(args.auth_url, "OS_AUTH_URL")?,
            username: required(args.username, "OS_USERNAME")?,
            password: required(None, "OS_PASSWORD")?,
            tenant: required(args.tenant, "OS_TENANT_NAME")?,
        };

        let env_concurrency = match env("SWIFT_UPLOAD_CONCURRENCY") {
            Some(value) => value
                .parse::<usize>()
                .with_context(|| format!("parsing SWIFT_UPLOAD_CONCURRENCY value `{}`", value))?,
            None => DEFAULT_CONCURRENCY,
        };
        let segment_size = match args.segment_size.or_else(|| env("SWIFT_UPLOAD_SEGMENT_SIZE")) {
            Some(value) => parse_size(&value)?,
            None => DEFAULT_SEGMENT_SIZE,
        };

        let delete_at = match (args.delete_at, args.delete_after) {
            (Some(value), _) => Some(parse_timestamp(&value)?),
            (None, Some(seconds)) => Some(
                ChronoDuration::try_seconds(seconds)
                    .and_then(|delta| now.checked_add_signed(delta))
                    .with_context(|| format!("--delete-after {} is out of range", seconds))?,
            ),
            (None, None) => None,
        };

        Ok(Self {
            credentials,
            service_name: args
                .service_name
                .or_else(|| env("SWIFT_SERVICE_NAME"))
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.into()),
            file: args.file,
            container: args.container,
            object_path: args.object_path,
            concurrency: args.concurrency.unwrap_or(env_concurrency),
            segment_size,
            delete_at,
        })
    }

    pub fn upload_options(&self) -> UploadOptions {
        UploadOptions {
            concurrency: self.concurrency,
            segment_size: self.segment_size,
            delete_at: self.delete_at,
            service_name: self.service_name.clone(),
            ..Default::default()
        }
    }
}

/// Byte count with an optional binary `K`/`M`/`G` suffix.
fn parse_size(value: &str) -> Result<u64> {
    let trimmed = value.trim();
    let (digits, multiplier) = match trimmed.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('G') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    let count = digits
        .parse::<u64>()
        .with_context(|| format!("parsing segment size `{}`", value))?;
    let size = count
        .checked_mul(multiplier)
        .with_context(|| format!("segment size `{}` is too large", value))?;
    if size == 0 {
        bail!("segment size must be greater than zero");
    }
    Ok(size)
}

/// Unix seconds or an RFC 3339 timestamp.
fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(seconds) = value.parse::<i64>() {
        return Utc
            .timestamp_opt(seconds, 0)
            .single()
            .with_context(|| format!("timestamp `{}` out of range", value));
    }
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .with_context(|| format!("parsing expiry `{}`", value))
}
