use serde::Serialize;

use super::conn::ConnId;
use crate::time::Timestamp;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    Ready,
    Delayed {
        until: Timestamp,
    },
    Reserved {
        by: ConnId,
        deadline: Timestamp,
    },
    /// `order` positions the job in its tube's buried sequence.
    Buried {
        order: u64,
    },
    Deleted,
}

impl JobState {
    pub fn name(&self) -> &'static str {
        use JobState::*;

        match self {
            Ready => "ready",
            Delayed { until: _ } => "delayed",
            Reserved { by: _, deadline: _ } => "reserved",
            Buried { order: _ } => "buried",
            Deleted => "deleted",
        }
    }

    /// The instant the job leaves this state on its own, if it ever does.
    pub fn deadline(&self) -> Option<Timestamp> {
        match self {
            JobState::Delayed { until } => Some(*until),
            JobState::Reserved { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }

    /// True if `conn` holds this job reserved.
    pub fn is_reserved_by(&self, conn: ConnId) -> bool {
        matches!(self, JobState::Reserved { by, .. } if *by == conn)
    }
}

// This impl is used to allow JobStats to be serialised to YAML.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}
