use std::collections::BTreeSet;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::time::Timestamp;
use crate::tube::DEFAULT_TUBE;
use crate::types::job::JobId;

/// Per-connection state the scheduler needs: tube bindings and the jobs the
/// connection holds reserved.
#[derive(Debug)]
pub struct Client {
    pub using: String,
    /// Watched tubes, in the order they were watched.
    pub watching: Vec<String>,
    pub reserved: BTreeSet<JobId>,
    pub is_producer: bool,
    pub is_worker: bool,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            using: DEFAULT_TUBE.to_owned(),
            watching: vec![DEFAULT_TUBE.to_owned()],
            reserved: BTreeSet::new(),
            is_producer: false,
            is_worker: false,
        }
    }
}

/// What a `reserve` eventually produces.
#[derive(Clone, Debug, PartialEq)]
pub enum Reservation {
    Reserved { id: JobId, body: Bytes },
    TimedOut,
    /// The connection already holds a job whose TTR is about to run out.
    DeadlineSoon,
}

/// Result of calling `reserve`: either settled straight away, or parked until
/// the scheduler resolves it.
#[derive(Debug)]
pub enum Reserve {
    Done(Reservation),
    Waiting(oneshot::Receiver<Reservation>),
}

/// A connection suspended in `reserve`.
#[derive(Debug)]
pub(super) struct Waiter {
    /// Tubes whose wait lists hold this connection.
    pub(super) tubes: Vec<String>,
    pub(super) deadline: Option<Timestamp>,
    pub(super) reply: oneshot::Sender<Reservation>,
}
