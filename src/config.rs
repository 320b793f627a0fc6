use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::encoding::{Datum, Schema};

/// User combinator folding an upsert delta into the previous value.
///
/// Receives the current value (or `None` when the key is absent or deleted)
/// and the delta, and returns the new full value.
pub type UpsertFn = Arc<dyn Fn(Option<&[Datum]>, &[Datum]) -> Vec<Datum> + Send + Sync>;

/// Configuration for an environment (one repository directory)
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Repository directory (default: ./sophdb)
    pub dir: PathBuf,

    /// Write-ahead log settings
    pub log: LogConfig,

    /// Background scheduler settings
    pub scheduler: SchedulerConfig,

    /// Root directory for backups (default: none, backups disabled)
    pub backup_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Write commits to the WAL (default: true)
    pub enabled: bool,

    /// fsync after every commit (default: false)
    pub sync: bool,

    /// Records per log file before rotation (default: 500_000)
    pub rotate_wm: u64,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of background workers (default: 2)
    pub threads: usize,

    /// How often an idle worker polls for work (default: 100ms)
    pub worker_interval: Duration,

    /// How often to check whether the log should rotate (default: 1s)
    pub log_rotate_interval: Duration,

    /// How often to log engine metrics (default: 30s)
    pub metrics_interval: Duration,

    /// Concurrent checkpoint tasks (default: 1)
    pub checkpoint_limit: usize,

    /// Concurrent backup tasks (default: 1)
    pub backup_limit: usize,

    /// Concurrent expire tasks (default: 1)
    pub expire_limit: usize,

    /// Concurrent gc tasks (default: 1)
    pub gc_limit: usize,

    /// Concurrent memory-pressure compactions (default: 2)
    pub compaction_limit: usize,
}

/// Configuration for a single database
#[derive(Clone)]
pub struct DatabaseConfig {
    /// Key and value fields (default: string key, string value)
    pub schema: Schema,

    /// Compaction thresholds
    pub compaction: CompactionConfig,

    /// Page compression filter: "none", "lz4" or "zstd" (default: none)
    pub compression: String,

    /// Drop rows older than this during compaction (default: never)
    pub expire: Option<Duration>,

    /// Map node files read-only into memory (default: true)
    pub mmap: bool,

    /// Upsert combinator; without one upserts behave like plain sets
    pub upsert: Option<UpsertFn>,
}

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Node file size that triggers a split (default: 64MB)
    pub node_size: u64,

    /// Target uncompressed page size (default: 64KB)
    pub page_size: u32,

    /// In-memory bytes per node that trigger compaction (default: 16MB)
    pub memory_threshold: usize,

    /// Duplicate-row percentage that triggers gc (default: 30)
    pub gc_percent: u32,

    /// How often expiry scans run when expiry is enabled (default: 60s)
    pub expire_period: Duration,

    /// Verify page checksums on read (default: true)
    pub checksum: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sync: false,
            rotate_wm: 500_000,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            worker_interval: Duration::from_millis(100),
            log_rotate_interval: Duration::from_secs(1),
            metrics_interval: Duration::from_secs(30),
            checkpoint_limit: 1,
            backup_limit: 1,
            expire_limit: 1,
            gc_limit: 1,
            compaction_limit: 2,
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./sophdb"),
            log: LogConfig::default(),
            scheduler: SchedulerConfig::default(),
            backup_path: None,
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            node_size: 64 * 1024 * 1024,      // 64MB
            page_size: 64 * 1024,             // 64KB
            memory_threshold: 16 * 1024 * 1024, // 16MB
            gc_percent: 30,
            expire_period: Duration::from_secs(60),
            checksum: true,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            schema: Schema::default(),
            compaction: CompactionConfig::default(),
            compression: "none".to_string(),
            expire: None,
            mmap: true,
            upsert: None,
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("schema", &self.schema)
            .field("compaction", &self.compaction)
            .field("compression", &self.compression)
            .field("expire", &self.expire)
            .field("mmap", &self.mmap)
            .field("upsert", &self.upsert.is_some())
            .finish()
    }
}

impl EnvConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Configure the write-ahead log
    pub fn log(mut self, config: LogConfig) -> Self {
        self.log = config;
        self
    }

    /// Configure background scheduling
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// Enable backups into the given directory
    pub fn backup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_path = Some(path.into());
        self
    }
}

impl LogConfig {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn rotate_wm(mut self, records: u64) -> Self {
        self.rotate_wm = records;
        self
    }
}

impl SchedulerConfig {
    /// Set number of background workers
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set worker polling interval
    pub fn worker_interval(mut self, interval: Duration) -> Self {
        self.worker_interval = interval;
        self
    }

    /// Set log rotation check interval
    pub fn log_rotate_interval(mut self, interval: Duration) -> Self {
        self.log_rotate_interval = interval;
        self
    }

    /// Set metrics logging interval
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Set the concurrency limit of memory-pressure compactions
    pub fn compaction_limit(mut self, limit: usize) -> Self {
        self.compaction_limit = limit;
        self
    }

    /// Set the concurrency limit of gc compactions
    pub fn gc_limit(mut self, limit: usize) -> Self {
        self.gc_limit = limit;
        self
    }
}

impl DatabaseConfig {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            ..Default::default()
        }
    }

    /// Configure compaction settings
    pub fn compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }

    /// Select the page compression filter by name
    pub fn compression(mut self, name: impl Into<String>) -> Self {
        self.compression = name.into();
        self
    }

    /// Expire rows after the given age
    pub fn expire(mut self, ttl: Duration) -> Self {
        self.expire = Some(ttl);
        self
    }

    /// Enable or disable mmap of node files
    pub fn mmap(mut self, enabled: bool) -> Self {
        self.mmap = enabled;
        self
    }

    /// Register the upsert combinator
    pub fn upsert<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&[Datum]>, &[Datum]) -> Vec<Datum> + Send + Sync + 'static,
    {
        self.upsert = Some(Arc::new(f));
        self
    }
}

impl CompactionConfig {
    /// Set node size split threshold
    pub fn node_size(mut self, size: u64) -> Self {
        self.node_size = size;
        self
    }

    /// Set target page size
    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }

    /// Set per-node memory threshold
    pub fn memory_threshold(mut self, size: usize) -> Self {
        self.memory_threshold = size;
        self
    }

    /// Set duplicate percentage gc threshold
    pub fn gc_percent(mut self, percent: u32) -> Self {
        self.gc_percent = percent;
        self
    }

    /// Set expiry scan period
    pub fn expire_period(mut self, period: Duration) -> Self {
        self.expire_period = period;
        self
    }

    /// Enable or disable page checksum verification
    pub fn checksum(mut self, enabled: bool) -> Self {
        self.checksum = enabled;
        self
    }
}
