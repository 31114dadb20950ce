//! WAL record encoding.
//!
//! Each record is framed as `tag: u8`, `len: u32`, `len` payload bytes, then a
//! commit byte. WAL files are zero-filled when allocated, so a zero tag marks
//! the end of the written region, and a record whose commit byte is missing
//! was torn by a crash mid-write.
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::time::Timestamp;
use crate::types::job::{Job, JobId};
use crate::types::states::JobState;

const COMMIT: u8 = 0xa5;

/// Bytes of framing around every payload.
pub const FRAME_LEN: usize = 1 + 4 + 1;

const TAG_JOB: u8 = 1;
const TAG_RELEASE: u8 = 2;
const TAG_BURY: u8 = 3;
const TAG_KICK: u8 = 4;
const TAG_TOUCH: u8 = 5;
const TAG_DELETE: u8 = 6;

const STATE_READY: u8 = 0;
const STATE_DELAYED: u8 = 1;
const STATE_RESERVED: u8 = 2;
const STATE_BURIED: u8 = 3;

/// Encoded size of a `JobUpdate`.
const UPDATE_LEN: usize = 8 + 4 + 8 + 1 + 8 + 5 * 8;

/// Encoded size of a full job record, excluding tube name and body.
pub const JOB_FIXED_LEN: usize = UPDATE_LEN + 1 + 8 + 8 + 4;

#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    /// The full state of a job, written on insert and on migration.
    Job(JobRecord),
    Release(JobUpdate),
    Bury(JobUpdate),
    Kick(JobUpdate),
    Touch(JobUpdate),
    Delete { id: JobId },
}

/// Which kind of state change a `JobUpdate` is being logged for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdateKind {
    Release,
    Bury,
    Kick,
    Touch,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobRecord {
    pub tube: String,
    pub ttr: Duration,
    pub created: Timestamp,
    pub body: Bytes,
    pub update: JobUpdate,
}

/// The mutable part of a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct JobUpdate {
    pub id: JobId,
    pub pri: u32,
    pub delay: Duration,
    pub state: StoredState,
    pub counters: [u64; 5],
}

/// A job state as persisted. Reservations are kept only for completeness:
/// no connection survives a restart, so they replay as ready.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoredState {
    Ready,
    Delayed(Timestamp),
    Reserved(Timestamp),
    Buried(u64),
}

impl From<JobState> for StoredState {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Delayed { until } => StoredState::Delayed(until),
            JobState::Reserved { deadline, .. } => {
                StoredState::Reserved(deadline)
            },
            JobState::Buried { order } => StoredState::Buried(order),
            // Deleted jobs are only ever logged as Record::Delete.
            JobState::Ready | JobState::Deleted => StoredState::Ready,
        }
    }
}

impl StoredState {
    /// The state a replayed job resumes in.
    pub fn restore(self) -> JobState {
        match self {
            StoredState::Ready | StoredState::Reserved(_) => JobState::Ready,
            StoredState::Delayed(until) => JobState::Delayed { until },
            StoredState::Buried(order) => JobState::Buried { order },
        }
    }
}

impl JobUpdate {
    pub fn of(job: &Job) -> Self {
        Self {
            id: job.id,
            pri: job.pri,
            delay: job.delay,
            state: job.state.into(),
            counters: [
                job.reserves,
                job.timeouts,
                job.releases,
                job.buries,
                job.kicks,
            ],
        }
    }

    /// Overwrites the mutable fields of `job` with this update.
    pub fn apply(&self, job: &mut Job) {
        job.pri = self.pri;
        job.delay = self.delay;
        job.state = self.state.restore();
        [
            job.reserves,
            job.timeouts,
            job.releases,
            job.buries,
            job.kicks,
        ] = self.counters;
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.id);
        buf.put_u32_le(self.pri);
        buf.put_u64_le(duration_nanos(self.delay));
        let (tag, aux) = match self.state {
            StoredState::Ready => (STATE_READY, 0),
            StoredState::Delayed(t) => (STATE_DELAYED, t.as_nanos()),
            StoredState::Reserved(t) => (STATE_RESERVED, t.as_nanos()),
            StoredState::Buried(order) => (STATE_BURIED, order),
        };
        buf.put_u8(tag);
        buf.put_u64_le(aux);
        for c in self.counters {
            buf.put_u64_le(c);
        }
    }

    fn decode(buf: &mut Bytes) -> Option<Self> {
        if buf.remaining() < UPDATE_LEN {
            return None;
        }

        let id = buf.get_u64_le();
        let pri = buf.get_u32_le();
        let delay = Duration::from_nanos(buf.get_u64_le());
        let tag = buf.get_u8();
        let aux = buf.get_u64_le();
        let state = match tag {
            STATE_READY => StoredState::Ready,
            STATE_DELAYED => StoredState::Delayed(Timestamp::from_nanos(aux)),
            STATE_RESERVED => {
                StoredState::Reserved(Timestamp::from_nanos(aux))
            },
            STATE_BURIED => StoredState::Buried(aux),
            _ => return None,
        };
        let mut counters = [0; 5];
        for c in &mut counters {
            *c = buf.get_u64_le();
        }

        Some(Self {
            id,
            pri,
            delay,
            state,
            counters,
        })
    }
}

impl Record {
    pub fn job(job: &Job) -> Self {
        Record::Job(JobRecord {
            tube: job.tube.clone(),
            ttr: job.ttr,
            created: job.created,
            body: job.body.clone(),
            update: JobUpdate::of(job),
        })
    }

    pub fn update(kind: UpdateKind, job: &Job) -> Self {
        let update = JobUpdate::of(job);
        match kind {
            UpdateKind::Release => Record::Release(update),
            UpdateKind::Bury => Record::Bury(update),
            UpdateKind::Kick => Record::Kick(update),
            UpdateKind::Touch => Record::Touch(update),
        }
    }

    pub fn id(&self) -> JobId {
        match self {
            Record::Job(r) => r.update.id,
            Record::Release(u)
            | Record::Bury(u)
            | Record::Kick(u)
            | Record::Touch(u) => u.id,
            Record::Delete { id } => *id,
        }
    }

    /// Encodes this record with its framing.
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        let tag = match self {
            Record::Job(r) => {
                r.update.encode(&mut payload);
                // Tube names are at most 200 bytes, enforced by the parser.
                payload.put_u8(r.tube.len() as u8);
                payload.put_slice(r.tube.as_bytes());
                payload.put_u64_le(duration_nanos(r.ttr));
                payload.put_u64_le(r.created.as_nanos());
                payload.put_u32_le(r.body.len() as u32);
                payload.put_slice(&r.body);
                TAG_JOB
            },
            Record::Release(u) => {
                u.encode(&mut payload);
                TAG_RELEASE
            },
            Record::Bury(u) => {
                u.encode(&mut payload);
                TAG_BURY
            },
            Record::Kick(u) => {
                u.encode(&mut payload);
                TAG_KICK
            },
            Record::Touch(u) => {
                u.encode(&mut payload);
                TAG_TOUCH
            },
            Record::Delete { id } => {
                payload.put_u64_le(*id);
                TAG_DELETE
            },
        };

        let mut framed = BytesMut::with_capacity(FRAME_LEN + payload.len());
        framed.put_u8(tag);
        framed.put_u32_le(payload.len() as u32);
        framed.put_slice(&payload);
        framed.put_u8(COMMIT);
        framed.freeze()
    }
}

/// Outcome of reading the next record from a WAL file.
#[derive(Debug, PartialEq)]
pub enum Decoded {
    Record(Record),
    /// The unwritten tail of the file has been reached.
    End,
    /// The record at this position was never fully written.
    Torn,
    /// The record is complete but makes no sense.
    Corrupt,
}

/// Decodes one framed record from the front of `buf`, advancing it.
pub fn decode(buf: &mut Bytes) -> Decoded {
    if buf.remaining() == 0 || buf[0] == 0 {
        return Decoded::End;
    }
    if buf.remaining() < FRAME_LEN {
        return Decoded::Torn;
    }

    let tag = buf.get_u8();
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len + 1 || buf[len] != COMMIT {
        return Decoded::Torn;
    }

    let mut payload = buf.split_to(len);
    buf.advance(1);

    let record = match tag {
        TAG_JOB => decode_job(&mut payload).map(Record::Job),
        TAG_RELEASE => JobUpdate::decode(&mut payload).map(Record::Release),
        TAG_BURY => JobUpdate::decode(&mut payload).map(Record::Bury),
        TAG_KICK => JobUpdate::decode(&mut payload).map(Record::Kick),
        TAG_TOUCH => JobUpdate::decode(&mut payload).map(Record::Touch),
        TAG_DELETE if payload.remaining() >= 8 => Some(Record::Delete {
            id: payload.get_u64_le(),
        }),
        _ => None,
    };

    match record {
        Some(record) if !payload.has_remaining() => Decoded::Record(record),
        _ => Decoded::Corrupt,
    }
}

fn decode_job(buf: &mut Bytes) -> Option<JobRecord> {
    let update = JobUpdate::decode(buf)?;

    if !buf.has_remaining() {
        return None;
    }
    let tube_len = buf.get_u8() as usize;
    if buf.remaining() < tube_len + 8 + 8 + 4 {
        return None;
    }
    let tube = String::from_utf8(buf.split_to(tube_len).to_vec()).ok()?;
    let ttr = Duration::from_nanos(buf.get_u64_le());
    let created = Timestamp::from_nanos(buf.get_u64_le());
    let body_len = buf.get_u32_le() as usize;
    if buf.remaining() < body_len {
        return None;
    }
    let body = buf.split_to(body_len);

    Some(JobRecord {
        tube,
        ttr,
        created,
        body,
        update,
    })
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
