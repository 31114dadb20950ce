//! The job life-cycle state machine.
//!
//! `Scheduler` owns every job, tube, connection binding and waiting reserve,
//! plus the WAL. Its methods are the only way any of them change. Each method
//! takes the current time explicitly; callers serialise access (see
//! `crate::broker`) and arrange for `wake` to run by `next_deadline`.
mod client;
mod stats;
#[cfg(test)]
mod tests;

use std::collections::hash_map::RandomState;
use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub use self::client::{Client, Reservation, Reserve};
use self::client::Waiter;
use crate::config::Config;
use crate::error::{Result, SchedulerError};
use crate::time::Timestamp;
use crate::tube::{Pause, Tube, DEFAULT_TUBE};
use crate::types::conn::ConnId;
use crate::types::job::{Job, JobId};
use crate::types::protocol::CommandCounts;
use crate::types::states::JobState;
use crate::wal::record::UpdateKind;
use crate::wal::{Recovered, Wal, WalError};

/// How close to its TTR deadline a reserved job must be for a further
/// `reserve` by the same connection to answer `DEADLINE_SOON`.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct Scheduler {
    max_job_size: u32,
    jobs: HashMap<JobId, Job>,
    tubes: BTreeMap<String, Tube>,
    clients: HashMap<ConnId, Client>,
    waiters: HashMap<ConnId, Waiter>,
    next_id: JobId,
    next_conn: u64,
    next_bury: u64,
    wal: Option<Wal>,
    commands: CommandCounts,
    job_timeouts: u64,
    total_jobs: u64,
    total_connections: u64,
    started: Timestamp,
    instance_id: String,
}

impl Scheduler {
    /// An in-memory scheduler with no durability.
    pub fn new(max_job_size: u32) -> Self {
        let mut tubes = BTreeMap::new();
        tubes.insert(DEFAULT_TUBE.to_owned(), Tube::new(DEFAULT_TUBE));

        Self {
            max_job_size,
            jobs: HashMap::new(),
            tubes,
            clients: HashMap::new(),
            waiters: HashMap::new(),
            next_id: 1,
            next_conn: 0,
            next_bury: 0,
            wal: None,
            commands: CommandCounts::default(),
            job_timeouts: 0,
            total_jobs: 0,
            total_connections: 0,
            started: Timestamp::now(),
            instance_id: format!(
                "{:016x}",
                RandomState::new().build_hasher().finish()
            ),
        }
    }

    /// Builds a scheduler per `config`, replaying the WAL if one is
    /// configured.
    pub fn open(config: &Config) -> std::result::Result<Self, WalError> {
        let mut scheduler = Self::new(config.max_job_size);

        if let Some(wal_config) = &config.wal {
            let (wal, recovered) = Wal::open(wal_config)?;

            let fits = u32::try_from(wal.max_body_len()).unwrap_or(u32::MAX);
            if fits < scheduler.max_job_size {
                warn!(
                    max_job_size = scheduler.max_job_size,
                    limit = fits,
                    "lowering max job size to fit in a WAL file"
                );
                scheduler.max_job_size = fits;
            }

            scheduler.wal = Some(wal);
            scheduler.restore(recovered);
        }

        Ok(scheduler)
    }

    /// Places jobs rebuilt from the WAL into their tubes.
    fn restore(&mut self, recovered: Recovered) {
        let mut jobs = recovered.jobs;
        jobs.sort_by_key(|j| j.id);

        for job in jobs {
            if let JobState::Buried { order } = job.state {
                self.next_bury = self.next_bury.max(order + 1);
            }
            place(&mut self.tubes, &job);
            self.jobs.insert(job.id, job);
        }
        self.next_id = self.next_id.max(recovered.next_id);

        info!(jobs = self.jobs.len(), next_id = self.next_id, "restored jobs");
    }

    pub fn max_job_size(&self) -> u32 {
        self.max_job_size
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn tube(&self, name: &str) -> Option<&Tube> {
        self.tubes.get(name)
    }

    /// Flushes the WAL, if any, to stable storage.
    pub fn sync_wal(&mut self) -> std::result::Result<(), WalError> {
        match &mut self.wal {
            Some(wal) => wal.sync(),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn has_unsynced_wal_writes(&self) -> bool {
        self.wal.as_ref().is_some_and(Wal::has_unsynced_writes)
    }

    // Connections and tube bindings.

    /// Registers a new connection, using and watching the default tube.
    pub fn connect(&mut self) -> ConnId {
        self.next_conn += 1;
        let conn = ConnId(self.next_conn);

        let tube = self.tube_mut(DEFAULT_TUBE);
        tube.using += 1;
        tube.watching += 1;
        self.clients.insert(conn, Client::default());
        self.total_connections += 1;

        conn
    }

    /// Tears down a connection: stops any pending reserve and returns every
    /// job it holds to the ready queue straight away.
    pub fn disconnect(&mut self, conn: ConnId, now: Timestamp) {
        self.take_waiter(conn);
        let Some(client) = self.clients.remove(&conn) else {
            return;
        };

        for id in &client.reserved {
            if let Some(job) = self.jobs.get_mut(id) {
                unplace(&mut self.tubes, job);
                job.state = JobState::Ready;
                place(&mut self.tubes, job);
                debug!(%conn, id, "requeued job of closed connection");
            }
        }

        if let Some(tube) = self.tubes.get_mut(&client.using) {
            tube.using -= 1;
        }
        for name in &client.watching {
            if let Some(tube) = self.tubes.get_mut(name) {
                tube.watching -= 1;
            }
        }
        self.drop_if_unused(&client.using);
        for name in &client.watching {
            self.drop_if_unused(name);
        }

        self.process_queue(now);
    }

    pub fn use_tube(&mut self, conn: ConnId, name: &str) -> Result<()> {
        self.commands.use_tube += 1;
        let client =
            self.clients.get_mut(&conn).ok_or(SchedulerError::NotFound)?;
        if client.using == name {
            return Ok(());
        }

        let old = std::mem::replace(&mut client.using, name.to_owned());
        self.tube_mut(name).using += 1;
        if let Some(tube) = self.tubes.get_mut(&old) {
            tube.using -= 1;
        }
        self.drop_if_unused(&old);

        Ok(())
    }

    /// Adds `name` to the watch list. Returns the number of watched tubes.
    pub fn watch(&mut self, conn: ConnId, name: &str) -> Result<usize> {
        self.commands.watch += 1;
        let client =
            self.clients.get_mut(&conn).ok_or(SchedulerError::NotFound)?;
        if !client.watching.iter().any(|t| t == name) {
            client.watching.push(name.to_owned());
            let count = client.watching.len();
            self.tube_mut(name).watching += 1;
            return Ok(count);
        }
        Ok(client.watching.len())
    }

    /// Removes `name` from the watch list, refusing to empty it. Returns the
    /// number of watched tubes.
    pub fn ignore(&mut self, conn: ConnId, name: &str) -> Result<usize> {
        self.commands.ignore += 1;
        let client =
            self.clients.get_mut(&conn).ok_or(SchedulerError::NotFound)?;
        let Some(at) = client.watching.iter().position(|t| t == name) else {
            return Ok(client.watching.len());
        };
        if client.watching.len() == 1 {
            return Err(SchedulerError::NotIgnored);
        }

        client.watching.remove(at);
        let count = client.watching.len();
        if let Some(tube) = self.tubes.get_mut(name) {
            tube.watching -= 1;
        }
        self.drop_if_unused(name);

        Ok(count)
    }

    /// The tube `conn` is using.
    pub fn using(&self, conn: ConnId) -> Result<&str> {
        self.clients
            .get(&conn)
            .map(|c| c.using.as_str())
            .ok_or(SchedulerError::NotFound)
    }

    pub fn list_tube_used(&mut self, conn: ConnId) -> Result<String> {
        self.commands.list_tube_used += 1;
        self.using(conn).map(str::to_owned)
    }

    pub fn list_tubes_watched(&mut self, conn: ConnId) -> Result<Vec<String>> {
        self.commands.list_tubes_watched += 1;
        self.clients
            .get(&conn)
            .map(|c| c.watching.clone())
            .ok_or(SchedulerError::NotFound)
    }

    // Job life cycle.

    /// Creates a job in `tube`. The job is logged before this returns, and is
    /// handed to a waiting consumer if one can take it.
    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &mut self,
        conn: ConnId,
        tube: &str,
        pri: u32,
        delay: Duration,
        ttr: Duration,
        body: Bytes,
        now: Timestamp,
    ) -> Result<JobId> {
        self.commands.put += 1;
        if body.len() > self.max_job_size as usize {
            return Err(SchedulerError::JobTooBig {
                limit: self.max_job_size,
            });
        }

        let mut job = Job::new(
            self.next_id,
            tube.to_owned(),
            pri,
            delay,
            ttr,
            body,
            now,
        );
        if let Some(wal) = &mut self.wal {
            wal.write_job(&mut job)?;
        }
        let id = job.id;
        self.next_id += 1;

        if let Some(client) = self.clients.get_mut(&conn) {
            client.is_producer = true;
        }
        self.total_jobs += 1;
        self.tube_mut(tube).counters.total_jobs += 1;
        place(&mut self.tubes, &job);
        self.jobs.insert(id, job);

        self.process_queue(now);
        self.maintain_wal()?;

        Ok(id)
    }

    /// Reserves the most urgent ready job across the tubes `conn` watches,
    /// or parks `conn` until one turns up or `timeout` passes.
    pub fn reserve(
        &mut self,
        conn: ConnId,
        timeout: Option<Duration>,
        now: Timestamp,
    ) -> Result<Reserve> {
        match timeout {
            Some(_) => self.commands.reserve_with_timeout += 1,
            None => self.commands.reserve += 1,
        }

        let client =
            self.clients.get_mut(&conn).ok_or(SchedulerError::NotFound)?;
        client.is_worker = true;
        if client.watching.is_empty() {
            return Err(SchedulerError::NoWatchedTubes);
        }

        let best = client
            .watching
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                let (pri, id) = self.tubes.get(name)?.next_ready(now)?;
                Some((pri, i, id))
            })
            .min();
        if let Some((_, _, id)) = best {
            let body = self.reserve_to(conn, id, now);
            return Ok(Reserve::Done(Reservation::Reserved { id, body }));
        }

        if self.deadline_soon(conn, now) {
            return Ok(Reserve::Done(Reservation::DeadlineSoon));
        }
        if timeout == Some(Duration::ZERO) {
            return Ok(Reserve::Done(Reservation::TimedOut));
        }

        let tubes = self.clients[&conn].watching.clone();
        self.take_waiter(conn);
        for name in &tubes {
            self.tube_mut(name).waiting.push_back(conn);
        }
        let (reply, rx) = oneshot::channel();
        self.waiters.insert(
            conn,
            Waiter {
                tubes,
                deadline: timeout.map(|t| now + t),
                reply,
            },
        );
        debug!(%conn, ?timeout, "waiting for a job");

        Ok(Reserve::Waiting(rx))
    }

    /// Reserves one specific job, provided nobody holds it already.
    pub fn reserve_job(
        &mut self,
        conn: ConnId,
        id: JobId,
        now: Timestamp,
    ) -> Result<Reservation> {
        let client =
            self.clients.get_mut(&conn).ok_or(SchedulerError::NotFound)?;
        client.is_worker = true;

        match self.jobs.get(&id).map(|j| j.state) {
            Some(
                JobState::Ready
                | JobState::Delayed { .. }
                | JobState::Buried { .. },
            ) => {
                let body = self.reserve_to(conn, id, now);
                Ok(Reservation::Reserved { id, body })
            },
            _ => Err(SchedulerError::NotFound),
        }
    }

    /// Returns a job reserved by `conn` to the ready queue, or to the delayed
    /// queue if `delay` is non-zero.
    pub fn release(
        &mut self,
        conn: ConnId,
        id: JobId,
        pri: u32,
        delay: Duration,
        now: Timestamp,
    ) -> Result<()> {
        self.commands.release += 1;
        let job = reserved_by(&mut self.jobs, conn, id)?;

        unplace(&mut self.tubes, job);
        job.pri = pri;
        job.delay = delay;
        job.releases += 1;
        job.state = if delay.is_zero() {
            JobState::Ready
        } else {
            JobState::Delayed { until: now + delay }
        };
        place(&mut self.tubes, job);
        self.forget_reservation(conn, id);

        self.log_update(UpdateKind::Release, id)?;
        self.process_queue(now);
        Ok(())
    }

    /// Moves a job reserved by `conn` to its tube's buried list.
    pub fn bury(
        &mut self,
        conn: ConnId,
        id: JobId,
        pri: u32,
        now: Timestamp,
    ) -> Result<()> {
        self.commands.bury += 1;
        let order = self.next_bury;
        let job = reserved_by(&mut self.jobs, conn, id)?;

        unplace(&mut self.tubes, job);
        job.pri = pri;
        job.buries += 1;
        job.state = JobState::Buried { order };
        place(&mut self.tubes, job);
        self.next_bury += 1;
        self.forget_reservation(conn, id);

        debug!(%conn, id, %now, "buried job");
        self.log_update(UpdateKind::Bury, id)
    }

    /// Deletes a job. Reserved jobs may only be deleted by their holder.
    pub fn delete(
        &mut self,
        conn: ConnId,
        id: JobId,
        now: Timestamp,
    ) -> Result<()> {
        self.commands.delete += 1;
        let holder = match self.jobs.get(&id).map(|j| j.state) {
            None => return Err(SchedulerError::NotFound),
            Some(JobState::Reserved { by, .. }) if by != conn => {
                return Err(SchedulerError::NotFound);
            },
            Some(JobState::Reserved { by, .. }) => Some(by),
            Some(_) => None,
        };

        let Some(mut job) = self.jobs.remove(&id) else {
            return Err(SchedulerError::NotFound);
        };
        unplace(&mut self.tubes, &job);
        if let Some(by) = holder {
            self.forget_reservation(by, id);
        }
        job.state = JobState::Deleted;
        if let Some(tube) = self.tubes.get_mut(&job.tube) {
            tube.counters.cmd_delete += 1;
        }

        if let Some(wal) = &mut self.wal {
            wal.write_delete(&mut job)?;
        }
        self.drop_if_unused(&job.tube);
        debug!(%conn, id, %now, "deleted job");

        self.maintain_wal()
    }

    /// Kicks up to `bound` jobs in `tube` back to ready: buried jobs oldest
    /// first if there are any, otherwise delayed jobs soonest first. Returns
    /// how many were kicked.
    pub fn kick(
        &mut self,
        tube: &str,
        bound: u64,
        now: Timestamp,
    ) -> Result<u64> {
        self.commands.kick += 1;
        let Some(t) = self.tubes.get(tube) else {
            return Ok(0);
        };

        let bound = usize::try_from(bound).unwrap_or(usize::MAX);
        let ids: Vec<JobId> = if !t.buried.is_empty() {
            t.buried.values().take(bound).copied().collect()
        } else {
            let mut delayed: Vec<(Timestamp, JobId)> =
                t.delayed.iter().collect();
            delayed.sort_unstable();
            delayed.into_iter().take(bound).map(|(_, id)| id).collect()
        };

        for &id in &ids {
            self.kick_one(id)?;
        }
        self.process_queue(now);

        Ok(ids.len() as u64)
    }

    /// Kicks one buried or delayed job back to ready.
    pub fn kick_job(&mut self, id: JobId, now: Timestamp) -> Result<()> {
        self.commands.kick += 1;
        match self.jobs.get(&id).map(|j| j.state) {
            Some(JobState::Buried { .. } | JobState::Delayed { .. }) => {
                self.kick_one(id)?;
                self.process_queue(now);
                Ok(())
            },
            _ => Err(SchedulerError::NotFound),
        }
    }

    /// Gives a job reserved by `conn` a fresh TTR from `now`.
    pub fn touch(
        &mut self,
        conn: ConnId,
        id: JobId,
        now: Timestamp,
    ) -> Result<()> {
        self.commands.touch += 1;
        let job = reserved_by(&mut self.jobs, conn, id)?;

        unplace(&mut self.tubes, job);
        job.state = JobState::Reserved {
            by: conn,
            deadline: now + job.ttr,
        };
        place(&mut self.tubes, job);

        self.log_update(UpdateKind::Touch, id)
    }

    /// Stops `tube` handing out jobs for `duration`. A zero duration lifts an
    /// existing pause. Pauses are not logged and don't survive a restart.
    pub fn pause_tube(
        &mut self,
        tube: &str,
        duration: Duration,
        now: Timestamp,
    ) -> Result<()> {
        self.commands.pause_tube += 1;
        let t = self.tubes.get_mut(tube).ok_or(SchedulerError::NotFound)?;

        t.counters.cmd_pause_tube += 1;
        t.pause = if duration.is_zero() {
            None
        } else {
            Some(Pause {
                until: now + duration,
                duration,
            })
        };

        self.process_queue(now);
        Ok(())
    }

    pub fn peek(&mut self, id: JobId) -> Result<(JobId, Bytes)> {
        self.commands.peek += 1;
        self.body_of(Some(id))
    }

    pub fn peek_ready(&mut self, tube: &str) -> Result<(JobId, Bytes)> {
        self.commands.peek_ready += 1;
        let id = self
            .tubes
            .get(tube)
            .and_then(|t| t.ready.peek())
            .map(|(_, id)| id);
        self.body_of(id)
    }

    pub fn peek_delayed(&mut self, tube: &str) -> Result<(JobId, Bytes)> {
        self.commands.peek_delayed += 1;
        let id = self
            .tubes
            .get(tube)
            .and_then(|t| t.delayed.peek())
            .map(|(_, id)| id);
        self.body_of(id)
    }

    pub fn peek_buried(&mut self, tube: &str) -> Result<(JobId, Bytes)> {
        self.commands.peek_buried += 1;
        let id = self
            .tubes
            .get(tube)
            .and_then(|t| t.buried.first_key_value())
            .map(|(_, id)| *id);
        self.body_of(id)
    }

    // Timers.

    /// Runs everything that has come due by `now`: delayed jobs become ready,
    /// expired reservations return to ready, pauses lift, ready jobs go to
    /// waiting consumers, and waits past their deadline time out.
    pub fn wake(&mut self, now: Timestamp) {
        let mut due = Vec::new();
        for tube in self.tubes.values_mut() {
            while let Some((until, id)) = tube.delayed.peek() {
                if until > now {
                    break;
                }
                tube.delayed.pop();
                due.push(id);
            }
        }
        for id in due.drain(..) {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Ready;
                place(&mut self.tubes, job);
            }
        }

        for tube in self.tubes.values_mut() {
            while let Some((deadline, id)) = tube.reserved.peek() {
                if deadline > now {
                    break;
                }
                tube.reserved.pop();
                due.push(id);
            }
            if tube.pause.is_some_and(|p| p.until <= now) {
                tube.pause = None;
            }
        }
        for id in due {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            let JobState::Reserved { by, .. } = job.state else {
                continue;
            };
            job.timeouts += 1;
            job.state = JobState::Ready;
            place(&mut self.tubes, job);
            self.job_timeouts += 1;
            self.forget_reservation(by, id);
            debug!(conn = %by, id, "reservation timed out");
        }

        self.process_queue(now);

        let expired: Vec<ConnId> = self
            .waiters
            .iter()
            .filter(|(_, w)| w.deadline.is_some_and(|d| d <= now))
            .map(|(conn, _)| *conn)
            .collect();
        for conn in expired {
            if let Some(waiter) = self.take_waiter(conn) {
                // The receiver is gone if the connection is closing.
                let _ = waiter.reply.send(Reservation::TimedOut);
            }
        }
    }

    /// The earliest instant `wake` has work to do, if any.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        let tubes = self.tubes.values().filter_map(Tube::next_deadline);
        let waiters = self.waiters.values().filter_map(|w| w.deadline);
        tubes.chain(waiters).min()
    }

    // Internals.

    fn tube_mut(&mut self, name: &str) -> &mut Tube {
        self.tubes
            .entry(name.to_owned())
            .or_insert_with(|| Tube::new(name))
    }

    fn drop_if_unused(&mut self, name: &str) {
        if self.tubes.get(name).is_some_and(Tube::is_unused) {
            self.tubes.remove(name);
            debug!(tube = name, "dropped unused tube");
        }
    }

    fn forget_reservation(&mut self, conn: ConnId, id: JobId) {
        if let Some(client) = self.clients.get_mut(&conn) {
            client.reserved.remove(&id);
        }
    }

    fn deadline_soon(&self, conn: ConnId, now: Timestamp) -> bool {
        let Some(client) = self.clients.get(&conn) else {
            return false;
        };
        let margin = now + SAFETY_MARGIN;
        client.reserved.iter().any(|id| {
            self.jobs
                .get(id)
                .and_then(|j| j.state.deadline())
                .is_some_and(|d| d <= margin)
        })
    }

    /// Reserves `id` to `conn`, whatever state it was in, returning its body.
    fn reserve_to(&mut self, conn: ConnId, id: JobId, now: Timestamp) -> Bytes {
        let Some(job) = self.jobs.get_mut(&id) else {
            return Bytes::new();
        };

        unplace(&mut self.tubes, job);
        job.state = JobState::Reserved {
            by: conn,
            deadline: now + job.ttr,
        };
        job.reserves += 1;
        place(&mut self.tubes, job);
        if let Some(client) = self.clients.get_mut(&conn) {
            client.reserved.insert(id);
        }
        debug!(%conn, id, "reserved job");

        job.body.clone()
    }

    fn kick_one(&mut self, id: JobId) -> Result<()> {
        let Some(job) = self.jobs.get_mut(&id) else {
            return Ok(());
        };

        unplace(&mut self.tubes, job);
        job.kicks += 1;
        job.state = JobState::Ready;
        place(&mut self.tubes, job);

        self.log_update(UpdateKind::Kick, id)
    }

    fn body_of(&self, id: Option<JobId>) -> Result<(JobId, Bytes)> {
        id.and_then(|id| self.jobs.get(&id))
            .map(|j| (j.id, j.body.clone()))
            .ok_or(SchedulerError::NotFound)
    }

    /// Removes `conn` from every wait list, returning its pending reserve.
    fn take_waiter(&mut self, conn: ConnId) -> Option<Waiter> {
        let waiter = self.waiters.remove(&conn)?;
        for name in &waiter.tubes {
            if let Some(tube) = self.tubes.get_mut(name) {
                tube.stop_waiting(conn);
            }
        }
        Some(waiter)
    }

    /// Hands ready jobs to waiting connections until no waiting connection
    /// watches a tube with a dispatchable job.
    fn process_queue(&mut self, now: Timestamp) {
        loop {
            let next = self
                .tubes
                .values()
                .filter(|t| !t.waiting.is_empty())
                .filter_map(|t| t.next_ready(now))
                .min();
            let Some((_, id)) = next else {
                return;
            };
            let Some(job) = self.jobs.get(&id) else {
                return;
            };
            let tube = job.tube.clone();
            let body = job.body.clone();

            let Some(conn) = self
                .tubes
                .get(&tube)
                .and_then(|t| t.waiting.front().copied())
            else {
                return;
            };
            let Some(waiter) = self.take_waiter(conn) else {
                // Listed without a pending reserve: not actually waiting.
                if let Some(t) = self.tubes.get_mut(&tube) {
                    t.stop_waiting(conn);
                }
                continue;
            };

            if waiter.reply.send(Reservation::Reserved { id, body }).is_err() {
                debug!(%conn, "waiting connection went away");
                continue;
            }
            self.reserve_to(conn, id, now);
        }
    }

    fn log_update(&mut self, kind: UpdateKind, id: JobId) -> Result<()> {
        if let (Some(wal), Some(job)) = (&mut self.wal, self.jobs.get(&id)) {
            wal.write_update(kind, job)?;
        }
        self.maintain_wal()
    }

    /// Migrates one job out of the oldest WAL file, then deletes any files
    /// no longer needed.
    fn maintain_wal(&mut self) -> Result<()> {
        let Some(wal) = &mut self.wal else {
            return Ok(());
        };

        if let Some(id) = wal.migration_candidate() {
            match self.jobs.get_mut(&id) {
                Some(job) => wal.migrate(job)?,
                None => warn!(id, "WAL references a job that no longer exists"),
            }
        }
        wal.reclaim()?;

        Ok(())
    }
}

/// The job `id` if `conn` holds it reserved.
fn reserved_by(
    jobs: &mut HashMap<JobId, Job>,
    conn: ConnId,
    id: JobId,
) -> Result<&mut Job> {
    jobs.get_mut(&id)
        .filter(|j| j.state.is_reserved_by(conn))
        .ok_or(SchedulerError::NotFound)
}

/// Puts `job` into the structure of its tube matching its state.
fn place(tubes: &mut BTreeMap<String, Tube>, job: &Job) {
    let tube = tubes
        .entry(job.tube.clone())
        .or_insert_with(|| Tube::new(job.tube.as_str()));

    match job.state {
        JobState::Ready => {
            tube.ready.push(job.pri, job.id);
        },
        JobState::Delayed { until } => {
            tube.delayed.push(until, job.id);
        },
        JobState::Reserved { deadline, .. } => {
            tube.reserved.push(deadline, job.id);
        },
        JobState::Buried { order } => {
            tube.buried.insert(order, job.id);
        },
        JobState::Deleted => {},
    }
}

/// Takes `job` out of whichever structure of its tube its state puts it in.
fn unplace(tubes: &mut BTreeMap<String, Tube>, job: &Job) {
    let Some(tube) = tubes.get_mut(&job.tube) else {
        return;
    };

    match job.state {
        JobState::Ready => {
            tube.ready.remove(job.id);
        },
        JobState::Delayed { .. } => {
            tube.delayed.remove(job.id);
        },
        JobState::Reserved { .. } => {
            tube.reserved.remove(job.id);
        },
        JobState::Buried { order } => {
            tube.buried.remove(&order);
        },
        JobState::Deleted => {},
    }
}
