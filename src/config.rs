use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, fmt, str::FromStr, time::Duration};
use thiserror::Error;

const MIB: u64 = 1024 * 1024;

/// Which storage service the uploader talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Process memory; contents vanish on exit.
    Memory,
    /// Local disk with SQLite metadata.
    Local,
    /// S3 or an S3-compatible service.
    S3,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, true)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Memory => "memory",
            BackendKind::Local => "local",
            BackendKind::S3 => "s3",
        };
        f.write_str(name)
    }
}

/// Tuning for a single transfer. Passed explicitly to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Objects up to this size go out in one put.
    pub multipart_threshold_bytes: u64,
    pub target_part_size_bytes: u64,
    /// Floor for every part but the last.
    pub min_part_size_bytes: u64,
    pub max_concurrent_parts: usize,
    /// Attempts per part, including the first.
    pub max_part_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_threshold_bytes: 16 * MIB,
            target_part_size_bytes: 8 * MIB,
            min_part_size_bytes: 5 * MIB,
            max_concurrent_parts: 4,
            max_part_attempts: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("target part size {target} is below the minimum part size {min}")]
    PartBelowMinimum { target: u64, min: u64 },
}

impl TransferConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.multipart_threshold_bytes == 0 {
            return Err(ConfigError::Zero("multipart threshold"));
        }
        if self.target_part_size_bytes == 0 {
            return Err(ConfigError::Zero("target part size"));
        }
        if self.min_part_size_bytes == 0 {
            return Err(ConfigError::Zero("minimum part size"));
        }
        if self.max_concurrent_parts == 0 {
            return Err(ConfigError::Zero("max concurrent parts"));
        }
        if self.max_part_attempts == 0 {
            return Err(ConfigError::Zero("part attempts"));
        }
        if self.target_part_size_bytes < self.min_part_size_bytes {
            return Err(ConfigError::PartBelowMinimum {
                target: self.target_part_size_bytes,
                min: self.min_part_size_bytes,
            });
        }
        Ok(())
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend: BackendKind,
    pub bucket: String,
    pub storage_dir: String,
    pub database_url: String,
    pub s3_region: String,
    pub s3_endpoint: Option<String>,
    pub transfer: TransferConfig,
    pub denylist: Vec<String>,
    pub list_page_size: usize,
    pub max_list_pages: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Object upload and transfer service")]
pub struct Args {
    /// Host to bind to (overrides UPLOADER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOADER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Storage backend (overrides UPLOADER_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Bucket every object lands in (overrides UPLOADER_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Directory for the local backend's payloads (overrides UPLOADER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL for the local backend (overrides UPLOADER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// S3 region (overrides UPLOADER_S3_REGION, then AWS_REGION)
    #[arg(long)]
    pub s3_region: Option<String>,

    /// Custom S3 endpoint, e.g. MinIO (overrides UPLOADER_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// Objects above this many bytes use multipart (overrides UPLOADER_MULTIPART_THRESHOLD)
    #[arg(long)]
    pub multipart_threshold: Option<u64>,

    /// Target part size in bytes (overrides UPLOADER_PART_SIZE)
    #[arg(long)]
    pub part_size: Option<u64>,

    /// Minimum part size in bytes (overrides UPLOADER_MIN_PART_SIZE)
    #[arg(long)]
    pub min_part_size: Option<u64>,

    /// Parts uploaded concurrently per transfer (overrides UPLOADER_MAX_CONCURRENT_PARTS)
    #[arg(long)]
    pub max_concurrent_parts: Option<usize>,

    /// Attempts per part (overrides UPLOADER_PART_ATTEMPTS)
    #[arg(long)]
    pub part_attempts: Option<u32>,

    /// Base retry backoff in milliseconds (overrides UPLOADER_RETRY_BACKOFF_MS)
    #[arg(long)]
    pub retry_backoff_ms: Option<u64>,

    /// Comma-separated denylist patterns (overrides UPLOADER_DENYLIST)
    #[arg(long, value_delimiter = ',')]
    pub denylist: Option<Vec<String>>,

    /// Keys requested per listing page (overrides UPLOADER_LIST_PAGE_SIZE)
    #[arg(long)]
    pub list_page_size: Option<usize>,

    /// Listing stops with an error after this many pages (overrides UPLOADER_MAX_LIST_PAGES)
    #[arg(long)]
    pub max_list_pages: Option<usize>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        // Parse CLI once
        let args = Args::parse();
        Self::resolve(args, |name| env::var(name).ok())
    }

    /// Merge `args` over values found through `lookup`, then over defaults.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = TransferConfig::default();

        // --- Environment fallback ---
        let env_host = lookup("UPLOADER_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_env(&lookup, "UPLOADER_PORT", 3000u16)?;
        let env_backend = parse_env(&lookup, "UPLOADER_BACKEND", BackendKind::Local)?;
        let env_bucket = lookup("UPLOADER_BUCKET").unwrap_or_else(|| "uploads".into());
        let env_storage =
            lookup("UPLOADER_STORAGE_DIR").unwrap_or_else(|| "./data/objects".into());
        let env_db = lookup("UPLOADER_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/uploader.db".into());
        let env_region = lookup("UPLOADER_S3_REGION")
            .or_else(|| lookup("AWS_REGION"))
            .unwrap_or_else(|| "us-east-1".into());
        let env_endpoint = lookup("UPLOADER_S3_ENDPOINT");
        let env_threshold = parse_env(
            &lookup,
            "UPLOADER_MULTIPART_THRESHOLD",
            defaults.multipart_threshold_bytes,
        )?;
        let env_part = parse_env(&lookup, "UPLOADER_PART_SIZE", defaults.target_part_size_bytes)?;
        let env_min_part =
            parse_env(&lookup, "UPLOADER_MIN_PART_SIZE", defaults.min_part_size_bytes)?;
        let env_concurrency = parse_env(
            &lookup,
            "UPLOADER_MAX_CONCURRENT_PARTS",
            defaults.max_concurrent_parts,
        )?;
        let env_attempts =
            parse_env(&lookup, "UPLOADER_PART_ATTEMPTS", defaults.max_part_attempts)?;
        let env_backoff_ms = parse_env(
            &lookup,
            "UPLOADER_RETRY_BACKOFF_MS",
            defaults.retry_backoff.as_millis() as u64,
        )?;
        let env_denylist = lookup("UPLOADER_DENYLIST")
            .map(|raw| split_list(&raw))
            .unwrap_or_else(default_denylist);
        let env_page_size = parse_env(&lookup, "UPLOADER_LIST_PAGE_SIZE", 1000usize)?;
        let env_max_pages = parse_env(&lookup, "UPLOADER_MAX_LIST_PAGES", 10_000usize)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            backend: args.backend.unwrap_or(env_backend),
            bucket: args.bucket.unwrap_or(env_bucket),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            s3_region: args.s3_region.unwrap_or(env_region),
            s3_endpoint: args.s3_endpoint.or(env_endpoint),
            transfer: TransferConfig {
                multipart_threshold_bytes: args.multipart_threshold.unwrap_or(env_threshold),
                target_part_size_bytes: args.part_size.unwrap_or(env_part),
                min_part_size_bytes: args.min_part_size.unwrap_or(env_min_part),
                max_concurrent_parts: args.max_concurrent_parts.unwrap_or(env_concurrency),
                max_part_attempts: args.part_attempts.unwrap_or(env_attempts),
                retry_backoff: Duration::from_millis(
                    args.retry_backoff_ms.unwrap_or(env_backoff_ms),
                ),
            },
            denylist: args.denylist.unwrap_or(env_denylist),
            list_page_size: args.list_page_size.unwrap_or(env_page_size),
            max_list_pages: args.max_list_pages.unwrap_or(env_max_pages),
        };

        cfg.transfer
            .validate()
            .context("invalid transfer configuration")?;
        if cfg.bucket.trim().is_empty() {
            bail!("bucket name must not be empty");
        }
        if cfg.list_page_size == 0 || cfg.max_list_pages == 0 {
            bail!("listing page size and page limit must be greater than zero");
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn default_denylist() -> Vec<String> {
    vec!["virus".into(), ".exe".into()]
}

fn parse_env<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(name) {
        Some(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
