use super::Scheduler;
use crate::error::{Result, SchedulerError};
use crate::time::Timestamp;
use crate::tube::Tube;
use crate::types::job::JobId;
use crate::types::protocol::{JobStats, ServerStats, TubeStats};

impl Scheduler {
    pub fn stats_job(&mut self, id: JobId, now: Timestamp) -> Result<JobStats> {
        self.commands.stats_job += 1;
        let job = self.jobs.get(&id).ok_or(SchedulerError::NotFound)?;

        let time_left = job
            .state
            .deadline()
            .map_or(0, |d| d.saturating_duration_since(now).as_secs());

        Ok(JobStats {
            id: job.id,
            tube: job.tube.clone(),
            state: job.state,
            pri: job.pri,
            age: now.saturating_duration_since(job.created).as_secs(),
            delay: job.delay.as_secs(),
            ttr: job.ttr.as_secs(),
            time_left,
            file: job.file.unwrap_or(0),
            reserves: job.reserves,
            timeouts: job.timeouts,
            releases: job.releases,
            buries: job.buries,
            kicks: job.kicks,
        })
    }

    pub fn stats_tube(
        &mut self,
        name: &str,
        now: Timestamp,
    ) -> Result<TubeStats> {
        self.commands.stats_tube += 1;
        let tube = self.tubes.get(name).ok_or(SchedulerError::NotFound)?;

        let (pause, pause_time_left) = match tube.pause {
            Some(p) if p.until > now => (
                p.duration.as_secs(),
                p.until.saturating_duration_since(now).as_secs(),
            ),
            _ => (0, 0),
        };

        Ok(TubeStats {
            name: tube.name.clone(),
            current_jobs_urgent: tube.urgent_count() as u64,
            current_jobs_ready: tube.ready.len() as u64,
            current_jobs_reserved: tube.reserved.len() as u64,
            current_jobs_delayed: tube.delayed.len() as u64,
            current_jobs_buried: tube.buried.len() as u64,
            total_jobs: tube.counters.total_jobs,
            current_using: tube.using as u64,
            current_waiting: tube.waiting.len() as u64,
            current_watching: tube.watching as u64,
            pause,
            cmd_delete: tube.counters.cmd_delete,
            cmd_pause_tube: tube.counters.cmd_pause_tube,
            pause_time_left,
        })
    }

    pub fn stats(&mut self, now: Timestamp) -> ServerStats {
        self.commands.stats += 1;

        let sum = |f: fn(&Tube) -> usize| -> u64 {
            self.tubes.values().map(f).sum::<usize>() as u64
        };
        let clients = self.clients.values();

        let mut stats = ServerStats {
            current_jobs_urgent: sum(Tube::urgent_count),
            current_jobs_ready: sum(|t| t.ready.len()),
            current_jobs_reserved: sum(|t| t.reserved.len()),
            current_jobs_delayed: sum(|t| t.delayed.len()),
            current_jobs_buried: sum(|t| t.buried.len()),
            commands: self.commands.clone(),
            job_timeouts: self.job_timeouts,
            total_jobs: self.total_jobs,
            max_job_size: u64::from(self.max_job_size),
            current_tubes: self.tubes.len() as u64,
            current_connections: self.clients.len() as u64,
            current_producers: clients.clone().filter(|c| c.is_producer).count()
                as u64,
            current_workers: clients.filter(|c| c.is_worker).count() as u64,
            current_waiting: self.waiters.len() as u64,
            total_connections: self.total_connections,
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION"),
            uptime: now.saturating_duration_since(self.started).as_secs(),
            id: self.instance_id.clone(),
            ..Default::default()
        };

        if let Some(wal) = &self.wal {
            stats.binlog_oldest_index = wal.oldest_seq();
            stats.binlog_current_index = wal.current_seq();
            stats.binlog_max_size = wal.capacity();
            stats.binlog_records_written = wal.records_written();
            stats.binlog_records_migrated = wal.records_migrated();
        }

        stats
    }

    /// Names of every tube in existence, in name order.
    pub fn list_tubes(&mut self) -> Vec<String> {
        self.commands.list_tubes += 1;
        self.tubes.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::types::states::JobState;

    const T0: Timestamp = Timestamp::from_nanos(1_000_000_000_000);

    #[test]
    fn test_stats_job_reports_time_left_and_counters() {
        let mut s = Scheduler::new(1024);
        let conn = s.connect();
        let id = s
            .put(
                conn,
                "default",
                7,
                Duration::from_secs(30),
                Duration::from_secs(60),
                Bytes::from_static(b"x"),
                T0,
            )
            .unwrap();

        let stats = s.stats_job(id, T0 + Duration::from_secs(10)).unwrap();
        let until = T0 + Duration::from_secs(30);
        assert_eq!(stats.state, JobState::Delayed { until });
        let timing = (stats.pri, stats.age, stats.delay, stats.ttr);
        assert_eq!(timing, (7, 10, 30, 60));
        assert_eq!(stats.time_left, 20);
        assert_eq!(stats.file, 0);

        assert!(matches!(
            s.stats_job(id + 1, T0),
            Err(SchedulerError::NotFound)
        ));
    }

    #[test]
    fn test_stats_tube_and_server_counts() {
        let mut s = Scheduler::new(1024);
        let conn = s.connect();
        s.use_tube(conn, "jobs").unwrap();
        for pri in [1, 2000] {
            let ttr = Duration::from_secs(5);
            s.put(conn, "jobs", pri, Duration::ZERO, ttr, Bytes::new(), T0)
                .unwrap();
        }
        s.pause_tube("jobs", Duration::from_secs(8), T0).unwrap();

        let tube = s.stats_tube("jobs", T0 + Duration::from_secs(3)).unwrap();
        assert_eq!(tube.current_jobs_ready, 2);
        assert_eq!(tube.current_jobs_urgent, 1);
        assert_eq!(tube.current_using, 1);
        assert_eq!((tube.pause, tube.pause_time_left), (8, 5));
        assert_eq!(tube.cmd_pause_tube, 1);

        let server = s.stats(T0);
        assert_eq!(server.current_jobs_ready, 2);
        assert_eq!(server.current_tubes, 2);
        assert_eq!(server.current_producers, 1);
        assert_eq!(server.commands.put, 2);
        assert_eq!(server.binlog_current_index, 0);

        assert_eq!(s.list_tubes(), ["default", "jobs"]);
        assert!(matches!(
            s.stats_tube("nope", T0),
            Err(SchedulerError::NotFound)
        ));
    }
}
