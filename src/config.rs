use std::path::PathBuf;
use std::time::Duration;

/// Default maximum job body size, in bytes.
pub const DEFAULT_MAX_JOB_SIZE: u32 = 65535;

/// Default WAL file capacity, in bytes.
pub const DEFAULT_WAL_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Runtime configuration of the broker core.
#[derive(Clone, Debug)]
pub struct Config {
    /// Largest accepted job body, in bytes.
    pub max_job_size: u32,
    /// Write-ahead logging. `None` runs the broker purely in memory.
    pub wal: Option<WalConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_job_size: DEFAULT_MAX_JOB_SIZE,
            wal: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WalConfig {
    /// Directory holding the lock file and the `binlog.N` files.
    pub dir: PathBuf,
    /// Exact size every WAL file is allocated to.
    pub file_size: u64,
    pub sync: SyncPolicy,
}

/// When WAL writes are flushed to stable storage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncPolicy {
    /// fsync after every record, before the operation is acknowledged.
    EveryWrite,
    /// fsync outstanding writes at most once per interval.
    Interval(Duration),
}

impl SyncPolicy {
    /// Maps the `-f <ms>` command line convention: zero means every write.
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            SyncPolicy::EveryWrite
        } else {
            SyncPolicy::Interval(Duration::from_millis(ms))
        }
    }
}
