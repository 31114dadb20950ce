use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::Parser;
use durable_beans::config::{
    Config, SyncPolicy, WalConfig, DEFAULT_MAX_JOB_SIZE, DEFAULT_WAL_FILE_SIZE,
};

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub(crate) listen: IpAddr,
    /// (TCP) port to listen on.
    #[arg(short, long, default_value_t = 11300)]
    pub(crate) port: u16,
    /// Enables write-ahead logging and set the directory to store WAL files in.
    #[arg(short = 'b', long)]
    pub(crate) wal_dir: Option<PathBuf>,
    /// Sets the maximum allowed job size.
    #[arg(short = 'z', long, default_value_t = DEFAULT_MAX_JOB_SIZE)]
    pub(crate) max_job_size: u32,
    /// Sets the size every WAL file is allocated to, in bytes.
    #[arg(short = 's', long, default_value_t = DEFAULT_WAL_FILE_SIZE)]
    pub(crate) wal_file_size: u64,
    /// Flushes the WAL to disk at most this often, in milliseconds. Zero
    /// flushes after every write.
    #[arg(short = 'f', long, default_value_t = 50)]
    pub(crate) fsync_ms: u64,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}

impl Args {
    pub(crate) fn config(&self) -> Config {
        Config {
            max_job_size: self.max_job_size,
            wal: self.wal_dir.as_ref().map(|dir| WalConfig {
                dir: dir.clone(),
                file_size: self.wal_file_size,
                sync: SyncPolicy::from_millis(self.fsync_ms),
            }),
        }
    }
}
