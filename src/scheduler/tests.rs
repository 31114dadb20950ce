use tokio::sync::oneshot::error::TryRecvError;

use super::*;
use crate::config::{SyncPolicy, WalConfig};

const T0: Timestamp = Timestamp::from_nanos(1_700_000_000_000_000_000);

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn put(
    s: &mut Scheduler,
    conn: ConnId,
    pri: u32,
    delay: u64,
    ttr: u64,
) -> JobId {
    let tube = s.using(conn).unwrap().to_owned();
    s.put(
        conn,
        &tube,
        pri,
        secs(delay),
        secs(ttr),
        Bytes::from(format!("job-{pri}")),
        T0,
    )
    .unwrap()
}

#[track_caller]
fn reserved(r: Result<Reserve>) -> JobId {
    match r.unwrap() {
        Reserve::Done(Reservation::Reserved { id, .. }) => id,
        other => panic!("expected a reserved job, got {other:?}"),
    }
}

#[track_caller]
fn done(r: Result<Reserve>) -> Reservation {
    match r.unwrap() {
        Reserve::Done(r) => r,
        other => panic!("expected an immediate answer, got {other:?}"),
    }
}

/// The job handed to a parked reserve, if it has been answered.
fn delivered(rx: &mut oneshot::Receiver<Reservation>) -> Option<JobId> {
    match rx.try_recv() {
        Ok(Reservation::Reserved { id, .. }) => Some(id),
        _ => None,
    }
}

#[track_caller]
fn waiting(r: Result<Reserve>) -> oneshot::Receiver<Reservation> {
    match r.unwrap() {
        Reserve::Waiting(rx) => rx,
        other => panic!("expected to wait, got {other:?}"),
    }
}

#[test]
fn test_put_reserve_delete_round_trip() {
    let mut s = Scheduler::new(1024);
    let conn = s.connect();

    let id = put(&mut s, conn, 0, 0, 10);
    assert_eq!(id, 1);
    match s.reserve(conn, None, T0).unwrap() {
        Reserve::Done(Reservation::Reserved { id: got, body }) => {
            assert_eq!(got, id);
            assert_eq!(&body[..], b"job-0");
        },
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(s.job(id).unwrap().reserves, 1);

    s.delete(conn, id, T0).unwrap();
    assert!(s.job(id).is_none());
    assert!(matches!(s.peek(id), Err(SchedulerError::NotFound)));
    assert!(matches!(s.delete(conn, id, T0), Err(SchedulerError::NotFound)));
}

#[test]
fn test_reserve_takes_most_urgent_then_oldest() {
    let mut s = Scheduler::new(1024);
    let conn = s.connect();

    let a = put(&mut s, conn, 5, 0, 10);
    let b = put(&mut s, conn, 1, 0, 10);
    let c = put(&mut s, conn, 5, 0, 10);
    let d = put(&mut s, conn, 0, 0, 10);

    let order: Vec<JobId> = (0..4)
        .map(|_| reserved(s.reserve(conn, None, T0)))
        .collect();
    assert_eq!(order, [d, b, a, c]);
}

#[test]
fn test_reserve_breaks_priority_ties_by_watch_order() {
    let mut s = Scheduler::new(1024);
    let producer = s.connect();
    let consumer = s.connect();

    s.use_tube(producer, "b").unwrap();
    let in_b = put(&mut s, producer, 3, 0, 10);
    s.use_tube(producer, "a").unwrap();
    let in_a = put(&mut s, producer, 3, 0, 10);

    // "a" is watched first, so its job wins despite the larger id.
    s.watch(consumer, "a").unwrap();
    s.watch(consumer, "b").unwrap();
    s.ignore(consumer, "default").unwrap();

    assert!(in_a > in_b);
    assert_eq!(reserved(s.reserve(consumer, None, T0)), in_a);
    assert_eq!(reserved(s.reserve(consumer, None, T0)), in_b);
}

#[test]
fn test_paused_tube_hides_jobs_until_pause_ends() {
    let mut s = Scheduler::new(1024);
    let conn = s.connect();
    let id = put(&mut s, conn, 0, 0, 10);

    s.pause_tube("default", secs(2), T0).unwrap();
    assert_eq!(
        done(s.reserve(conn, Some(Duration::ZERO), T0)),
        Reservation::TimedOut
    );

    let mut rx = waiting(s.reserve(conn, None, T0));
    assert_eq!(s.next_deadline(), Some(T0 + secs(2)));

    s.wake(T0 + Duration::from_millis(1999));
    assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

    s.wake(T0 + secs(2));
    assert_eq!(delivered(&mut rx), Some(id));
    assert!(s.tube("default").unwrap().pause.is_none());
}

#[test]
fn test_pause_of_zero_lifts_pause_and_unknown_tube_is_not_found() {
    let mut s = Scheduler::new(1024);
    let conn = s.connect();
    put(&mut s, conn, 0, 0, 10);

    s.pause_tube("default", secs(60), T0).unwrap();
    let mut rx = waiting(s.reserve(conn, None, T0));
    s.pause_tube("default", Duration::ZERO, T0).unwrap();
    assert!(matches!(rx.try_recv(), Ok(Reservation::Reserved { .. })));

    assert!(matches!(
        s.pause_tube("missing", secs(1), T0),
        Err(SchedulerError::NotFound)
    ));
}

#[test]
fn test_ttr_expiry_is_exact() {
    for ttr in [120, 4294, 4295, 4296, 4297, 5000, 21600] {
        let mut s = Scheduler::new(1024);
        let conn = s.connect();
        let id = put(&mut s, conn, 7, 0, ttr);
        reserved(s.reserve(conn, None, T0));

        let deadline = T0 + secs(ttr);
        assert_eq!(s.next_deadline(), Some(deadline), "ttr {ttr}");

        s.wake(T0 + (secs(ttr) - Duration::from_nanos(1)));
        assert!(s.job(id).unwrap().state.is_reserved_by(conn), "ttr {ttr}");

        s.wake(deadline);
        let job = s.job(id).unwrap();
        assert_eq!(job.state, JobState::Ready, "ttr {ttr}");
        assert_eq!((job.timeouts, job.pri), (1, 7));
        assert_eq!(s.stats(deadline).job_timeouts, 1);
    }
}

#[test]
fn test_touch_restarts_ttr() {
    let mut s = Scheduler::new(1024);
    let conn = s.connect();
    let id = put(&mut s, conn, 0, 0, 10);
    reserved(s.reserve(conn, None, T0));

    s.touch(conn, id, T0 + secs(5)).unwrap();
    s.wake(T0 + secs(10));
    assert!(s.job(id).unwrap().state.is_reserved_by(conn));

    s.wake(T0 + secs(15));
    assert_eq!(s.job(id).unwrap().state, JobState::Ready);

    let other = s.connect();
    assert!(matches!(s.touch(other, id, T0), Err(SchedulerError::NotFound)));
}

#[test]
fn test_deadline_soon_only_when_nothing_is_ready() {
    let mut s = Scheduler::new(1024);
    let conn = s.connect();
    put(&mut s, conn, 0, 0, 1);
    reserved(s.reserve(conn, None, T0));

    assert_eq!(done(s.reserve(conn, None, T0)), Reservation::DeadlineSoon);

    let next = put(&mut s, conn, 0, 0, 1);
    assert_eq!(reserved(s.reserve(conn, None, T0)), next);
}

#[test]
fn test_release_with_delay_goes_through_delayed() {
    let mut s = Scheduler::new(1024);
    let conn = s.connect();
    let id = put(&mut s, conn, 0, 0, 10);

    assert!(matches!(
        s.release(conn, id, 9, Duration::ZERO, T0),
        Err(SchedulerError::NotFound)
    ));
    reserved(s.reserve(conn, None, T0));

    s.release(conn, id, 9, secs(5), T0).unwrap();
    let until = T0 + secs(5);
    assert_eq!(s.job(id).unwrap().state, JobState::Delayed { until });
    assert_eq!(s.peek_delayed("default").unwrap().0, id);
    assert!(matches!(s.peek_ready("default"), Err(SchedulerError::NotFound)));

    s.wake(T0 + secs(5));
    let job = s.job(id).unwrap();
    assert_eq!((job.state, job.pri, job.releases), (JobState::Ready, 9, 1));
    assert_eq!(s.peek_ready("default").unwrap().0, id);
}

#[test]
fn test_bury_requires_reservation_and_delete_removes_buried() {
    let mut s = Scheduler::new(1024);
    let conn = s.connect();
    let a = put(&mut s, conn, 0, 0, 10);
    let b = put(&mut s, conn, 0, 0, 10);

    assert!(matches!(s.bury(conn, b, 0, T0), Err(SchedulerError::NotFound)));

    assert_eq!(reserved(s.reserve(conn, None, T0)), a);
    s.bury(conn, a, 42, T0).unwrap();
    assert!(matches!(s.bury(conn, a, 42, T0), Err(SchedulerError::NotFound)));
    assert_eq!(s.job(a).unwrap().pri, 42);
    assert_eq!(s.peek_buried("default").unwrap().0, a);

    s.delete(conn, a, T0).unwrap();
    assert!(matches!(s.peek_buried("default"), Err(SchedulerError::NotFound)));
    assert_eq!(s.tube("default").unwrap().counters.cmd_delete, 1);
}

#[test]
fn test_only_the_holder_may_delete_a_reserved_job() {
    let mut s = Scheduler::new(1024);
    let holder = s.connect();
    let other = s.connect();
    let id = put(&mut s, holder, 0, 0, 10);
    reserved(s.reserve(holder, None, T0));

    assert!(matches!(s.delete(other, id, T0), Err(SchedulerError::NotFound)));
    s.delete(holder, id, T0).unwrap();
}

#[test]
fn test_kick_prefers_buried_over_delayed() {
    let mut s = Scheduler::new(1024);
    let conn = s.connect();
    let first = put(&mut s, conn, 0, 0, 10);
    let second = put(&mut s, conn, 0, 0, 10);
    let delayed = put(&mut s, conn, 0, 100, 10);

    for id in [first, second] {
        reserved(s.reserve(conn, None, T0));
        s.bury(conn, id, 0, T0).unwrap();
    }

    assert_eq!(s.kick("default", 1, T0).unwrap(), 1);
    assert_eq!(s.job(first).unwrap().state, JobState::Ready);
    assert_eq!(s.kick("default", 10, T0).unwrap(), 1);
    assert_eq!(s.job(second).unwrap().kicks, 1);
    assert_eq!(s.kick("default", 10, T0).unwrap(), 1);
    assert_eq!(s.job(delayed).unwrap().state, JobState::Ready);
    assert_eq!(s.kick("default", 10, T0).unwrap(), 0);
    assert_eq!(s.kick("missing", 10, T0).unwrap(), 0);

    assert!(matches!(s.kick_job(first, T0), Err(SchedulerError::NotFound)));
}

#[test]
fn test_kick_job_and_reserve_job() {
    let mut s = Scheduler::new(1024);
    let conn = s.connect();
    let id = put(&mut s, conn, 0, 30, 10);

    s.kick_job(id, T0).unwrap();
    assert_eq!(s.job(id).unwrap().state, JobState::Ready);

    let delayed = put(&mut s, conn, 0, 30, 10);
    assert_eq!(
        s.reserve_job(conn, delayed, T0).unwrap(),
        Reservation::Reserved {
            id: delayed,
            body: Bytes::from_static(b"job-0")
        }
    );
    assert!(matches!(
        s.reserve_job(conn, delayed, T0),
        Err(SchedulerError::NotFound)
    ));
}

#[test]
fn test_disconnect_requeues_reserved_jobs_immediately() {
    let mut s = Scheduler::new(1024);
    let first = s.connect();
    let second = s.connect();
    let id = put(&mut s, first, 0, 0, 100);
    reserved(s.reserve(first, None, T0));

    let mut rx = waiting(s.reserve(second, None, T0));
    s.disconnect(first, T0 + secs(1));

    assert_eq!(delivered(&mut rx), Some(id));
    let job = s.job(id).unwrap();
    assert!(job.state.is_reserved_by(second));
    assert_eq!((job.reserves, job.timeouts), (2, 0));
}

#[test]
fn test_waiter_timeouts_are_independent() {
    let mut s = Scheduler::new(1024);
    let producer = s.connect();
    let short = s.connect();
    let long = s.connect();

    let mut short_rx = waiting(s.reserve(short, Some(secs(1)), T0));
    let mut long_rx = waiting(s.reserve(long, Some(secs(3)), T0));
    assert_eq!(s.next_deadline(), Some(T0 + secs(1)));

    s.wake(T0 + secs(1));
    assert_eq!(short_rx.try_recv(), Ok(Reservation::TimedOut));
    assert_eq!(long_rx.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(s.next_deadline(), Some(T0 + secs(3)));

    let id = put(&mut s, producer, 0, 0, 10);
    assert_eq!(delivered(&mut long_rx), Some(id));
    assert_eq!(s.next_deadline(), Some(T0 + secs(10)));
}

#[test]
fn test_waiters_are_served_in_arrival_order() {
    let mut s = Scheduler::new(1024);
    let producer = s.connect();
    let first = s.connect();
    let second = s.connect();

    let mut first_rx = waiting(s.reserve(first, None, T0));
    let mut second_rx = waiting(s.reserve(second, None, T0));

    let a = put(&mut s, producer, 0, 0, 10);
    assert_eq!(delivered(&mut first_rx), Some(a));
    assert_eq!(second_rx.try_recv(), Err(TryRecvError::Empty));
}

#[test]
fn test_oversized_put_does_not_consume_an_id() {
    let mut s = Scheduler::new(5);
    let conn = s.connect();

    let err = s
        .put(
            conn,
            "default",
            0,
            Duration::ZERO,
            secs(1),
            Bytes::from_static(b"123456"),
            T0,
        )
        .unwrap_err();
    assert!(matches!(err, SchedulerError::JobTooBig { limit: 5 }));
    assert_eq!(put(&mut s, conn, 0, 0, 1), 1);
}

#[test]
fn test_watch_ignore_and_tube_lifetime() {
    let mut s = Scheduler::new(1024);
    let conn = s.connect();

    assert!(matches!(
        s.ignore(conn, "default"),
        Err(SchedulerError::NotIgnored)
    ));
    assert_eq!(s.watch(conn, "extra").unwrap(), 2);
    assert_eq!(s.watch(conn, "extra").unwrap(), 2);
    assert_eq!(s.ignore(conn, "default").unwrap(), 1);
    assert_eq!(s.list_tubes_watched(conn).unwrap(), ["extra"]);

    s.use_tube(conn, "other").unwrap();
    assert_eq!(s.list_tubes(), ["default", "extra", "other"]);
    s.use_tube(conn, "default").unwrap();
    assert_eq!(s.list_tubes(), ["default", "extra"]);

    s.disconnect(conn, T0);
    assert_eq!(s.list_tubes(), ["default"]);
}

fn wal_config(dir: &std::path::Path) -> Config {
    small_wal_config(dir, 64 * 1024)
}

fn small_wal_config(dir: &std::path::Path, file_size: u64) -> Config {
    Config {
        max_job_size: 1024,
        wal: Some(WalConfig {
            dir: dir.to_owned(),
            file_size,
            sync: SyncPolicy::EveryWrite,
        }),
    }
}

#[test]
fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (ready, held, buried, deleted);
    {
        let mut s = Scheduler::open(&wal_config(dir.path())).unwrap();
        let conn = s.connect();
        ready = put(&mut s, conn, 5, 0, 10);
        held = put(&mut s, conn, 1, 0, 10);
        buried = put(&mut s, conn, 0, 0, 10);
        deleted = put(&mut s, conn, 9, 100, 10);

        assert_eq!(reserved(s.reserve(conn, None, T0)), buried);
        s.bury(conn, buried, 3, T0).unwrap();
        assert_eq!(reserved(s.reserve(conn, None, T0)), held);
        s.delete(conn, deleted, T0).unwrap();
    }

    let mut s = Scheduler::open(&wal_config(dir.path())).unwrap();
    assert_eq!(s.job(ready).unwrap().state, JobState::Ready);
    assert_eq!(s.job(held).unwrap().state, JobState::Ready);
    let job = s.job(buried).unwrap();
    assert!(matches!(job.state, JobState::Buried { .. }));
    assert_eq!((job.pri, job.buries), (3, 1));
    assert!(s.job(deleted).is_none());

    let conn = s.connect();
    assert_eq!(reserved(s.reserve(conn, None, T0)), held);
    assert_eq!(put(&mut s, conn, 0, 0, 10), deleted + 1);
    assert_eq!(s.peek_buried("default").unwrap().0, buried);
}

#[test]
fn test_max_job_size_is_clamped_to_wal_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = wal_config(dir.path());
    config.max_job_size = 1 << 20;

    let s = Scheduler::open(&config).unwrap();
    assert!(s.max_job_size() < 64 * 1024);
}

/// Files small enough that a few hundred records span many of them.
fn open_small(dir: &std::path::Path) -> Scheduler {
    Scheduler::open(&small_wal_config(dir, 601)).unwrap()
}

#[test]
fn test_ids_are_not_reused_after_reclaim_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut s = open_small(dir.path());
        let conn = s.connect();
        let ids: Vec<JobId> =
            (0..96).map(|_| put(&mut s, conn, 0, 0, 120)).collect();
        assert_eq!(ids.last(), Some(&96));
        for &id in ids.iter().rev() {
            s.delete(conn, id, T0).unwrap();
        }
    }

    // Two restarts in a row: the second sees none of the original records.
    let mut expected = 97;
    for _ in 0..2 {
        let mut s = open_small(dir.path());
        let conn = s.connect();
        let id = put(&mut s, conn, 0, 0, 120);
        assert_eq!(id, expected);
        s.delete(conn, id, T0).unwrap();
        expected += 1;
    }
}

#[test]
fn test_buried_job_survives_churn_through_migration() {
    let dir = tempfile::tempdir().unwrap();
    let kept;
    {
        let mut s = open_small(dir.path());
        let conn = s.connect();
        kept = put(&mut s, conn, 0, 0, 120);
        reserved(s.reserve(conn, None, T0));
        s.bury(conn, kept, 77, T0).unwrap();

        for _ in 0..300 {
            let id = put(&mut s, conn, 0, 0, 120);
            s.delete(conn, id, T0).unwrap();
        }

        let stats = s.stats(T0);
        assert!(stats.binlog_oldest_index > 1, "{stats:?}");
        assert!(stats.binlog_records_migrated > 0);
        assert!(stats.binlog_current_index - stats.binlog_oldest_index <= 1);
    }

    let s = open_small(dir.path());
    let job = s.job(kept).unwrap();
    assert!(matches!(job.state, JobState::Buried { .. }));
    assert_eq!((job.pri, job.buries), (77, 1));
}
