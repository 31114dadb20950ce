use std::time::Duration;

use bytes::Bytes;

use super::states::JobState;
use crate::time::Timestamp;

pub type JobId = u64;

/// The shortest time-to-run a job may be given.
pub const MIN_TTR: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub tube: String,
    pub pri: u32,
    pub delay: Duration,
    pub ttr: Duration,
    pub body: Bytes,
    pub state: JobState, // also contains state-specific data
    pub created: Timestamp,
    pub reserves: u64,
    pub timeouts: u64,
    pub releases: u64,
    pub buries: u64,
    pub kicks: u64,
    /// Sequence number of the WAL file holding this job's full record.
    pub file: Option<u64>,
}

impl Job {
    /// A new job as created by `put`, before it's placed into its tube.
    pub fn new(
        id: JobId,
        tube: String,
        pri: u32,
        delay: Duration,
        ttr: Duration,
        body: Bytes,
        now: Timestamp,
    ) -> Self {
        let state = if delay.is_zero() {
            JobState::Ready
        } else {
            JobState::Delayed { until: now + delay }
        };

        Self {
            id,
            tube,
            pri,
            delay,
            ttr: ttr.max(MIN_TTR),
            body,
            state,
            created: now,
            reserves: 0,
            timeouts: 0,
            releases: 0,
            buries: 0,
            kicks: 0,
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_state_follows_delay() {
        let now = Timestamp::from_nanos(1_000);

        let ready = Job::new(
            1,
            "t".into(),
            0,
            Duration::ZERO,
            MIN_TTR,
            Bytes::new(),
            now,
        );
        assert_eq!(ready.state, JobState::Ready);

        let delayed = Job::new(
            2,
            "t".into(),
            0,
            Duration::from_secs(2),
            MIN_TTR,
            Bytes::new(),
            now,
        );
        assert_eq!(
            delayed.state,
            JobState::Delayed {
                until: now + Duration::from_secs(2)
            }
        );
    }

    #[test]
    fn test_ttr_is_at_least_one_second() {
        let now = Timestamp::from_nanos(0);
        let job = Job::new(
            1,
            "t".into(),
            0,
            Duration::ZERO,
            Duration::ZERO,
            Bytes::new(),
            now,
        );
        assert_eq!(job.ttr, MIN_TTR);

        let job = Job::new(
            1,
            "t".into(),
            0,
            Duration::ZERO,
            Duration::from_secs(4295),
            Bytes::new(),
            now,
        );
        assert_eq!(job.ttr.as_secs(), 4295);
    }
}
