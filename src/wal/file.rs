use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::types::job::JobId;

pub(super) const MAGIC: &[u8; 8] = b"DBEANWAL";
pub(super) const VERSION: u32 = 2;
/// Magic, version, then the next job id to be issued when the file was
/// created. Ids stay unique after the records that used them are reclaimed.
pub(super) const HEADER_LEN: u64 = 8 + 4 + 8;

const FILE_PREFIX: &str = "binlog.";

pub(super) fn path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{FILE_PREFIX}{seq}"))
}

/// Parses the sequence number out of a WAL file name.
pub(super) fn parse_seq(name: &str) -> Option<u64> {
    name.strip_prefix(FILE_PREFIX)?.parse().ok()
}

/// Bookkeeping for one WAL file: the live jobs whose full record is in it.
#[derive(Debug)]
pub(super) struct LogFile {
    pub(super) seq: u64,
    pub(super) jobs: BTreeSet<JobId>,
}

impl LogFile {
    pub(super) fn new(seq: u64) -> Self {
        Self {
            seq,
            jobs: BTreeSet::new(),
        }
    }
}

/// Appends records to the newest WAL file.
#[derive(Debug)]
pub(super) struct Writer {
    pub(super) seq: u64,
    file: File,
    offset: u64,
    capacity: u64,
    dirty: bool,
}

impl Writer {
    /// Creates `binlog.<seq>`, filled with zeros up to `capacity` so that
    /// running out of disk space shows up here rather than mid-record.
    pub(super) fn create(
        dir: &Path,
        seq: u64,
        capacity: u64,
        next_id: JobId,
    ) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path(dir, seq))?;

        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&VERSION.to_le_bytes());
        header.extend_from_slice(&next_id.to_le_bytes());
        file.write_all(&header)?;

        let zeros = [0u8; 64 * 1024];
        let mut left = capacity - HEADER_LEN;
        while left > 0 {
            let n = left.min(zeros.len() as u64) as usize;
            file.write_all(&zeros[..n])?;
            left -= n as u64;
        }
        file.sync_all()?;
        file.seek(SeekFrom::Start(HEADER_LEN))?;

        Ok(Self {
            seq,
            file,
            offset: HEADER_LEN,
            capacity,
            dirty: false,
        })
    }

    pub(super) fn remaining(&self) -> u64 {
        self.capacity - self.offset
    }

    pub(super) fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        debug_assert!(bytes.len() as u64 <= self.remaining());
        self.file.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        self.dirty = true;
        Ok(())
    }

    #[cfg(test)]
    pub(super) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(super) fn sync(&mut self) -> io::Result<()> {
        if self.dirty {
            self.file.sync_data()?;
            self.dirty = false;
        }
        Ok(())
    }
}

/// Removes a reclaimed WAL file.
pub(super) fn remove(dir: &Path, seq: u64) -> io::Result<()> {
    match fs::remove_file(path(dir, seq)) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        r => r,
    }
}
