use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::heap::IndexedHeap;
use crate::time::Timestamp;
use crate::types::conn::ConnId;
use crate::types::job::JobId;

/// Name of the tube every connection starts out using and watching.
pub const DEFAULT_TUBE: &str = "default";

/// Longest tube name the protocol accepts, in bytes.
pub const MAX_TUBE_NAME_LEN: usize = 200;

/// Ready jobs with a priority below this count as urgent in stats.
pub const URGENT_PRIORITY: u32 = 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Pause {
    pub until: Timestamp,
    pub duration: Duration,
}

#[derive(Debug, Default)]
pub struct TubeCounters {
    pub total_jobs: u64,
    pub cmd_delete: u64,
    pub cmd_pause_tube: u64,
}

/// A named queue: the jobs placed into it, in one structure per state, and
/// the connections waiting on it.
#[derive(Debug)]
pub struct Tube {
    pub name: String,
    /// Ready jobs keyed by priority.
    pub ready: IndexedHeap<u32>,
    /// Delayed jobs keyed by the instant they become ready.
    pub delayed: IndexedHeap<Timestamp>,
    /// Reserved jobs keyed by their TTR deadline.
    pub reserved: IndexedHeap<Timestamp>,
    /// Buried jobs, oldest bury first.
    pub buried: BTreeMap<u64, JobId>,
    pub pause: Option<Pause>,
    /// Connections blocked in `reserve` on this tube, in arrival order.
    pub waiting: VecDeque<ConnId>,
    pub using: usize,
    pub watching: usize,
    pub counters: TubeCounters,
}

impl Tube {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ready: IndexedHeap::new(),
            delayed: IndexedHeap::new(),
            reserved: IndexedHeap::new(),
            buried: BTreeMap::new(),
            pause: None,
            waiting: VecDeque::new(),
            using: 0,
            watching: 0,
            counters: TubeCounters::default(),
        }
    }

    pub fn is_paused(&self, now: Timestamp) -> bool {
        self.pause.is_some_and(|p| p.until > now)
    }

    /// Highest-priority job available for dispatch.
    pub fn next_ready(&self, now: Timestamp) -> Option<(u32, JobId)> {
        if self.is_paused(now) {
            None
        } else {
            self.ready.peek()
        }
    }

    /// Earliest instant at which something in this tube needs attention.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        [
            self.delayed.peek().map(|(t, _)| t),
            self.reserved.peek().map(|(t, _)| t),
            self.pause.map(|p| p.until),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn stop_waiting(&mut self, conn: ConnId) {
        self.waiting.retain(|c| *c != conn);
    }

    pub fn urgent_count(&self) -> usize {
        self.ready
            .iter()
            .filter(|(pri, _)| *pri < URGENT_PRIORITY)
            .count()
    }

    /// True once nothing holds this tube alive.
    pub fn is_unused(&self) -> bool {
        self.name != DEFAULT_TUBE
            && self.using == 0
            && self.watching == 0
            && self.waiting.is_empty()
            && self.ready.is_empty()
            && self.delayed.is_empty()
            && self.reserved.is_empty()
            && self.buried.is_empty()
    }
}
