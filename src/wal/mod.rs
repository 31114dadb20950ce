//! The write-ahead log: a directory of fixed-size `binlog.N` files recording
//! every durable job mutation, replayed at startup.
//!
//! Every live job has exactly one full record that replay can rebuild it from.
//! The file holding that record can't be deleted while the job lives, and
//! files are only ever deleted oldest-first, so every update record logged
//! after the full record also survives. To stop one long-lived job pinning
//! the whole log, each durable mutation migrates one job out of the oldest
//! file by re-writing its full record into the newest.
mod file;
pub mod record;

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use bytes::{Buf, Bytes};
use thiserror::Error;
use tracing::{debug, info, warn};

use self::file::{LogFile, Writer, HEADER_LEN, MAGIC, VERSION};
use self::record::{Decoded, Record, UpdateKind, FRAME_LEN, JOB_FIXED_LEN};
use crate::config::{SyncPolicy, WalConfig};
use crate::tube::MAX_TUBE_NAME_LEN;
use crate::types::job::{Job, JobId};

const LOCK_FILE: &str = "lock";

#[derive(Debug, Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("WAL directory {} is locked by another process", dir.display())]
    Locked {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("WAL file {} has an unrecognised header", path.display())]
    BadHeader { path: PathBuf },

    #[error("invalid WAL configuration: {0}")]
    BadConfig(String),
}

/// Jobs rebuilt from the log at startup.
#[derive(Debug, Default)]
pub struct Recovered {
    pub jobs: Vec<Job>,
    /// One past the largest job id ever issued, even if its records have
    /// since been reclaimed.
    pub next_id: JobId,
}

#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    // Held for the lifetime of the process; the advisory lock goes with it.
    _lock: File,
    capacity: u64,
    sync: SyncPolicy,
    /// Oldest first; the last entry is the file `writer` appends to.
    files: VecDeque<LogFile>,
    writer: Writer,
    /// One past the largest job id logged so far, stamped into every new
    /// file's header.
    next_id: JobId,
    records_written: u64,
    records_migrated: u64,
}

impl Wal {
    /// Locks the WAL directory, replays every file in it, and starts a fresh
    /// file for new records.
    pub fn open(config: &WalConfig) -> Result<(Wal, Recovered), WalError> {
        let capacity = config.file_size;
        let smallest = HEADER_LEN + min_job_record_len();
        if capacity < smallest {
            return Err(WalError::BadConfig(format!(
                "WAL file size {capacity} is below the minimum of {smallest}"
            )));
        }

        fs::create_dir_all(&config.dir)?;
        let lock = lock_dir(&config.dir)?;

        let mut seqs = Vec::new();
        for entry in fs::read_dir(&config.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(seq) = name.to_str().and_then(file::parse_seq) {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();

        let mut replay = Replay::default();
        for &seq in &seqs {
            replay.file(&config.dir, seq)?;
        }

        let next_seq = seqs.last().map_or(1, |s| s + 1);
        let next_id = replay.next_id.max(1);
        let writer = Writer::create(&config.dir, next_seq, capacity, next_id)?;

        let mut files: VecDeque<LogFile> = replay.files.into();
        files.push_back(LogFile::new(next_seq));

        let recovered = Recovered {
            next_id,
            jobs: replay.jobs.into_values().collect(),
        };
        info!(
            dir = %config.dir.display(),
            files = seqs.len(),
            jobs = recovered.jobs.len(),
            "replayed WAL"
        );

        let mut wal = Wal {
            dir: config.dir.clone(),
            _lock: lock,
            capacity,
            sync: config.sync,
            files,
            writer,
            next_id,
            records_written: 0,
            records_migrated: 0,
        };
        wal.reclaim()?;

        Ok((wal, recovered))
    }

    /// Largest job body a single record can carry in an empty file.
    pub fn max_body_len(&self) -> u64 {
        self.capacity - HEADER_LEN - min_job_record_len()
    }

    /// Logs the full state of `job` and makes the current file its home.
    pub fn write_job(&mut self, job: &mut Job) -> Result<(), WalError> {
        self.next_id = self.next_id.max(job.id + 1);
        let seq = self.append(&Record::job(job))?;
        self.rehome(job, Some(seq));
        Ok(())
    }

    /// Logs a state change of `job`, whose full record is already logged.
    pub fn write_update(
        &mut self,
        kind: UpdateKind,
        job: &Job,
    ) -> Result<(), WalError> {
        self.append(&Record::update(kind, job))?;
        Ok(())
    }

    /// Logs the deletion of `job`, which then no longer pins its file.
    pub fn write_delete(&mut self, job: &mut Job) -> Result<(), WalError> {
        self.append(&Record::Delete { id: job.id })?;
        self.rehome(job, None);
        Ok(())
    }

    /// The job to move out of the oldest file next, if that file is not also
    /// the current one.
    pub fn migration_candidate(&self) -> Option<JobId> {
        if self.files.len() < 2 {
            return None;
        }
        self.files.front()?.jobs.first().copied()
    }

    /// Re-writes the full record of `job` into the current file.
    pub fn migrate(&mut self, job: &mut Job) -> Result<(), WalError> {
        self.write_job(job)?;
        self.records_migrated += 1;
        Ok(())
    }

    /// Deletes files from the front of the log that no live job needs.
    pub fn reclaim(&mut self) -> Result<(), WalError> {
        while self.files.len() > 1 {
            let Some(oldest) = self.files.front() else {
                break;
            };
            if !oldest.jobs.is_empty() {
                break;
            }
            file::remove(&self.dir, oldest.seq)?;
            debug!(seq = oldest.seq, "reclaimed WAL file");
            self.files.pop_front();
        }
        Ok(())
    }

    /// Flushes outstanding writes to stable storage.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.sync()?;
        Ok(())
    }

    /// True if records were appended since the last sync.
    #[cfg(test)]
    pub(crate) fn has_unsynced_writes(&self) -> bool {
        self.writer.is_dirty()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn oldest_seq(&self) -> u64 {
        self.files.front().map_or(self.writer.seq, |f| f.seq)
    }

    pub fn current_seq(&self) -> u64 {
        self.writer.seq
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn records_migrated(&self) -> u64 {
        self.records_migrated
    }

    /// Appends `record`, rotating first if it doesn't fit. Returns the
    /// sequence number of the file written to.
    fn append(&mut self, record: &Record) -> Result<u64, WalError> {
        let bytes = record.encode();
        let len = bytes.len() as u64;

        if len > self.capacity - HEADER_LEN {
            return Err(WalError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("record of {len} bytes exceeds WAL file size"),
            )));
        }
        if len > self.writer.remaining() {
            self.rotate()?;
        }

        self.writer.append(&bytes)?;
        self.records_written += 1;
        if self.sync == SyncPolicy::EveryWrite {
            self.writer.sync()?;
        }

        Ok(self.writer.seq)
    }

    fn rotate(&mut self) -> Result<(), WalError> {
        self.writer.sync()?;
        let seq = self.writer.seq + 1;
        self.writer =
            Writer::create(&self.dir, seq, self.capacity, self.next_id)?;
        self.files.push_back(LogFile::new(seq));
        debug!(seq, "rotated WAL file");
        Ok(())
    }

    /// Moves the reference `job` holds from its current file to `seq`.
    fn rehome(&mut self, job: &mut Job, seq: Option<u64>) {
        if let Some(old) = job.file.take() {
            if let Some(f) = self.files.iter_mut().find(|f| f.seq == old) {
                f.jobs.remove(&job.id);
            }
        }
        if let Some(seq) = seq {
            if let Some(f) = self.files.iter_mut().rev().find(|f| f.seq == seq)
            {
                f.jobs.insert(job.id);
            }
            job.file = Some(seq);
        }
    }
}

/// Bytes of the smallest frame guaranteed to hold any job's full record,
/// excluding its body.
fn min_job_record_len() -> u64 {
    (FRAME_LEN + JOB_FIXED_LEN + MAX_TUBE_NAME_LEN) as u64
}

fn lock_dir(dir: &Path) -> Result<File, WalError> {
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(LOCK_FILE))?;
    fs2::FileExt::try_lock_exclusive(&lock).map_err(|source| {
        WalError::Locked {
            dir: dir.to_owned(),
            source,
        }
    })?;
    Ok(lock)
}

/// State accumulated while replaying files oldest-to-newest.
#[derive(Default)]
struct Replay {
    jobs: HashMap<JobId, Job>,
    files: Vec<LogFile>,
    /// One past the largest id seen in any header or record.
    next_id: JobId,
}

impl Replay {
    fn file(&mut self, dir: &Path, seq: u64) -> Result<(), WalError> {
        let path = file::path(dir, seq);
        let mut buf = Bytes::from(fs::read(&path)?);
        self.files.push(LogFile::new(seq));

        let header_len = HEADER_LEN as usize;
        if buf.len() < header_len || buf[..header_len].iter().all(|b| *b == 0) {
            // Created but never written to before a crash.
            warn!(path = %path.display(), "skipping WAL file without header");
            return Ok(());
        }
        if &buf[..MAGIC.len()] != MAGIC
            || buf[MAGIC.len()..MAGIC.len() + 4] != VERSION.to_le_bytes()
        {
            return Err(WalError::BadHeader { path });
        }
        buf.advance(MAGIC.len() + 4);
        self.next_id = self.next_id.max(buf.get_u64_le());

        let mut count = 0usize;
        loop {
            match record::decode(&mut buf) {
                Decoded::Record(r) => {
                    self.apply(seq, r);
                    count += 1;
                },
                Decoded::End => break,
                Decoded::Torn => {
                    warn!(path = %path.display(), count, "torn WAL record");
                    break;
                },
                Decoded::Corrupt => {
                    warn!(path = %path.display(), count, "corrupt WAL record");
                    break;
                },
            }
        }
        debug!(seq, count, "replayed WAL file");

        Ok(())
    }

    fn apply(&mut self, seq: u64, record: Record) {
        let id = record.id();
        self.next_id = self.next_id.max(id + 1);

        match record {
            Record::Job(r) => {
                let mut job = Job::new(
                    id,
                    r.tube,
                    r.update.pri,
                    r.update.delay,
                    r.ttr,
                    r.body,
                    r.created,
                );
                r.update.apply(&mut job);
                self.untrack(id);
                job.file = Some(seq);
                if let Some(f) = self.files.last_mut() {
                    f.jobs.insert(id);
                }
                self.jobs.insert(id, job);
            },
            Record::Release(u)
            | Record::Bury(u)
            | Record::Kick(u)
            | Record::Touch(u) => match self.jobs.get_mut(&id) {
                Some(job) => u.apply(job),
                None => debug!(id, "ignoring update for unknown job"),
            },
            Record::Delete { id } => {
                self.untrack(id);
                self.jobs.remove(&id);
            },
        }
    }

    /// Drops `id` from whichever file currently holds its full record.
    fn untrack(&mut self, id: JobId) {
        if let Some(old) = self.jobs.get(&id).and_then(|j| j.file) {
            if let Some(f) = self.files.iter_mut().find(|f| f.seq == old) {
                f.jobs.remove(&id);
            }
        }
    }
}
