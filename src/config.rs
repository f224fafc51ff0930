use clap::Parser;
use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::models::MIB;
use crate::models::container::{ContainerSpec, DEFAULT_CONTAINER_COUNT};
use crate::models::multipart::UploadLimits;
use crate::models::run::RunParameters;
use crate::models::task::ContentMode;

pub const FILE_COUNT: &str = "FileCount";
pub const THREADS: &str = "Threads";
pub const MAX_FILE_SIZE: &str = "MaxFileSize";
pub const MIN_FILE_SIZE: &str = "MinFileSize";
pub const REPORT_STATUS_INCREMENT: &str = "ReportStatusIncrement";
pub const RANDOM_FILE_CONTENTS: &str = "RandomFileContents";
pub const BLOB_CONTAINERS: &str = "BlobContainers";
pub const CHUNK_SIZE: &str = "ChunkSize";
pub const WORK_DIR: &str = "WorkDir";
pub const STORAGE_DIR: &str = "StorageDir";
pub const DATABASE_URL: &str = "DatabaseUrl";
pub const MAX_SINGLE_SHOT_SIZE: &str = "MaxSingleShotSize";
pub const MAX_PART_SIZE: &str = "MaxPartSize";
pub const MAX_PART_COUNT: &str = "MaxPartCount";

/// Command-line configuration. Every key can also be set through an
/// environment variable of the same name; the command line wins.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Synthetic object generator and uploader")]
pub struct Args {
    /// Number of files to generate
    #[arg(long = "FileCount")]
    pub file_count: Option<String>,

    /// Maximum concurrent file pipelines (default: 2 x CPUs)
    #[arg(long = "Threads")]
    pub threads: Option<String>,

    /// Largest object size in MiB
    #[arg(long = "MaxFileSize")]
    pub max_file_size: Option<String>,

    /// Smallest object size in MiB
    #[arg(long = "MinFileSize")]
    pub min_file_size: Option<String>,

    /// Log progress every N completed files (0 disables)
    #[arg(long = "ReportStatusIncrement")]
    pub report_status_increment: Option<String>,

    /// Fill objects with random bytes instead of zeros
    #[arg(long = "RandomFileContents")]
    pub random_file_contents: Option<String>,

    /// Container count, or a comma separated list of container names
    #[arg(long = "BlobContainers")]
    pub blob_containers: Option<String>,

    /// Synthesis chunk and minimum part size in MiB
    #[arg(long = "ChunkSize")]
    pub chunk_size: Option<String>,

    /// Directory for transient local files
    #[arg(long = "WorkDir")]
    pub work_dir: Option<String>,

    /// Directory where uploaded objects are stored
    #[arg(long = "StorageDir")]
    pub storage_dir: Option<String>,

    /// Bookkeeping database URL
    #[arg(long = "DatabaseUrl")]
    pub database_url: Option<String>,

    /// Largest single-request upload in MiB
    #[arg(long = "MaxSingleShotSize")]
    pub max_single_shot_size: Option<String>,

    /// Largest staged part in MiB
    #[arg(long = "MaxPartSize")]
    pub max_part_size: Option<String>,

    /// Most parts per object
    #[arg(long = "MaxPartCount")]
    pub max_part_count: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl Args {
    fn pairs(self) -> [(&'static str, Option<String>); 14] {
        [
            (FILE_COUNT, self.file_count),
            (THREADS, self.threads),
            (MAX_FILE_SIZE, self.max_file_size),
            (MIN_FILE_SIZE, self.min_file_size),
            (REPORT_STATUS_INCREMENT, self.report_status_increment),
            (RANDOM_FILE_CONTENTS, self.random_file_contents),
            (BLOB_CONTAINERS, self.blob_containers),
            (CHUNK_SIZE, self.chunk_size),
            (WORK_DIR, self.work_dir),
            (STORAGE_DIR, self.storage_dir),
            (DATABASE_URL, self.database_url),
            (MAX_SINGLE_SHOT_SIZE, self.max_single_shot_size),
            (MAX_PART_SIZE, self.max_part_size),
            (MAX_PART_COUNT, self.max_part_count),
        ]
    }
}

/// A value that can be read from a raw setting string.
pub trait ConfigValue: Sized + Display {
    fn parse_value(raw: &str) -> Option<Self>;
}

impl ConfigValue for i64 {
    fn parse_value(raw: &str) -> Option<Self> {
        raw.trim().parse().ok()
    }
}

impl ConfigValue for f64 {
    fn parse_value(raw: &str) -> Option<Self> {
        raw.trim().parse().ok().filter(|v: &f64| v.is_finite())
    }
}

impl ConfigValue for bool {
    fn parse_value(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("true") {
            Some(true)
        } else if raw.eq_ignore_ascii_case("false") {
            Some(false)
        } else {
            None
        }
    }
}

impl ConfigValue for String {
    fn parse_value(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        (!raw.is_empty()).then(|| raw.to_string())
    }
}

/// Raw key/value settings merged from the command line and environment.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: HashMap<String, String>,
    pub migrate: bool,
}

impl Settings {
    /// Parse the process command line, falling back to environment
    /// variables for keys it does not set.
    pub fn from_env_and_args() -> Self {
        Self::from_sources(Args::parse(), |key| env::var(key).ok())
    }

    pub fn from_sources(args: Args, env: impl Fn(&str) -> Option<String>) -> Self {
        let migrate = args.migrate;
        let values = args
            .pairs()
            .into_iter()
            .filter_map(|(key, arg)| arg.or_else(|| env(key)).map(|v| (key.to_string(), v)))
            .collect();
        Self { values, migrate }
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            migrate: false,
        }
    }

    pub fn raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Typed lookup. Missing or unparsable values fall back to `default`.
    pub fn get_or<T: ConfigValue + Clone>(&self, key: &str, default: T) -> T {
        let raw = self.raw(key);
        let used = match raw {
            None => default.clone(),
            Some(value) => match T::parse_value(value) {
                Some(parsed) => parsed,
                None => {
                    warn!("{} has invalid value `{}`, using default {}", key, value, default);
                    default.clone()
                }
            },
        };
        info!(
            "{} = {} - Default {} - Used {}",
            key,
            raw.unwrap_or(""),
            default,
            used
        );
        used
    }

    fn mib_or(&self, key: &str, default_mib: f64) -> u64 {
        let mib = self.get_or(key, default_mib);
        (mib.max(0.0) * MIB as f64) as u64
    }

    pub fn container_spec(&self) -> ContainerSpec {
        let spec = ContainerSpec::parse(self.raw(BLOB_CONTAINERS), DEFAULT_CONTAINER_COUNT);
        info!(
            "{} = {} - Default {} - Used {:?}",
            BLOB_CONTAINERS,
            self.raw(BLOB_CONTAINERS).unwrap_or(""),
            DEFAULT_CONTAINER_COUNT,
            spec
        );
        spec
    }
}

fn default_threads() -> i64 {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus * 2) as i64
}

impl RunParameters {
    pub fn from_settings(settings: &Settings) -> Self {
        let file_count = settings.get_or(FILE_COUNT, 100i64).max(0) as usize;
        let threads = settings.get_or(THREADS, default_threads()).max(1) as u64;
        let concurrency = if threads > Semaphore::MAX_PERMITS as u64 {
            warn!(
                "{} ({}) exceeds the maximum of {}; using the maximum",
                THREADS,
                threads,
                Semaphore::MAX_PERMITS
            );
            Semaphore::MAX_PERMITS
        } else {
            threads as usize
        };
        let max_file_bytes = settings.mib_or(MAX_FILE_SIZE, 100.0);
        let mut min_file_bytes = settings.mib_or(MIN_FILE_SIZE, 4.0);
        if min_file_bytes > max_file_bytes {
            warn!(
                "{} ({} bytes) exceeds {} ({} bytes); using {} for both",
                MIN_FILE_SIZE, min_file_bytes, MAX_FILE_SIZE, max_file_bytes, max_file_bytes
            );
            min_file_bytes = max_file_bytes;
        }
        let report_interval = settings.get_or(REPORT_STATUS_INCREMENT, 1000i64).max(0) as u64;
        let randomized = settings.get_or(RANDOM_FILE_CONTENTS, false);
        let chunk_size = settings.mib_or(CHUNK_SIZE, 4.0).max(1);
        let work_dir = settings.get_or(WORK_DIR, "./data/work".to_string());

        Self {
            file_count,
            concurrency,
            min_file_bytes,
            max_file_bytes,
            report_interval,
            content_mode: ContentMode::from_randomized(randomized),
            chunk_size,
            work_dir: PathBuf::from(work_dir),
        }
    }
}

/// Where and how the local backend stores uploads.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSettings {
    pub storage_dir: PathBuf,
    pub database_url: String,
    pub limits: UploadLimits,
}

impl BackendSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        let defaults = UploadLimits::BLOCK_BLOB;
        let storage_dir = settings.get_or(STORAGE_DIR, "./data/objects".to_string());
        let database_url =
            settings.get_or(DATABASE_URL, "sqlite://./data/meta/datamaker.db".to_string());
        let limits = UploadLimits {
            max_single_shot_bytes: settings
                .mib_or(MAX_SINGLE_SHOT_SIZE, (defaults.max_single_shot_bytes / MIB) as f64),
            max_part_bytes: settings
                .mib_or(MAX_PART_SIZE, (defaults.max_part_bytes / MIB) as f64)
                .max(1),
            max_part_count: settings
                .get_or(MAX_PART_COUNT, defaults.max_part_count as i64)
                .max(1) as u64,
        };

        Self {
            storage_dir: PathBuf::from(storage_dir),
            database_url,
            limits,
        }
    }
}
