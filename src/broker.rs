//! Shares one `Scheduler` between connection tasks and drives its timers.
use std::future;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::SchedulerError;
use crate::scheduler::Scheduler;
use crate::time::Timestamp;

/// The single serialisation point for broker state.
#[derive(Debug)]
pub struct Broker {
    scheduler: Mutex<Scheduler>,
    /// Signalled after every operation so the timer task can recompute its
    /// deadline.
    timer: Notify,
    max_job_size: u32,
}

impl Broker {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            max_job_size: scheduler.max_job_size(),
            scheduler: Mutex::new(scheduler),
            timer: Notify::new(),
        }
    }

    pub fn max_job_size(&self) -> u32 {
        self.max_job_size
    }

    /// Runs `f` against the scheduler under the lock, passing it the current
    /// time, then re-arms the timer.
    pub async fn with<R>(
        &self,
        f: impl FnOnce(&mut Scheduler, Timestamp) -> R,
    ) -> R {
        let r = {
            let mut scheduler = self.scheduler.lock().await;
            f(&mut scheduler, Timestamp::now())
        };
        self.timer.notify_one();
        r
    }

    /// Calls `Scheduler::wake` whenever its next deadline arrives, until
    /// cancelled.
    pub async fn run_timer(&self, cancel: CancellationToken) {
        loop {
            let next = self.scheduler.lock().await.next_deadline();
            let sleep = async {
                match next {
                    Some(at) => {
                        let now = Timestamp::now();
                        time::sleep(at.saturating_duration_since(now)).await
                    },
                    None => future::pending::<()>().await,
                }
            };

            select! {
                _ = sleep => {
                    let mut scheduler = self.scheduler.lock().await;
                    scheduler.wake(Timestamp::now());
                },
                _ = self.timer.notified() => {},
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// Flushes the WAL every `interval` until cancelled, then once more.
    pub async fn run_sync(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            let done = select! {
                _ = ticker.tick() => false,
                _ = cancel.cancelled() => true,
            };

            if let Err(e) = self.scheduler.lock().await.sync_wal() {
                fatal(&SchedulerError::Durability(e));
            }
            if done {
                debug!("final WAL sync done");
                return;
            }
        }
    }
}

/// Stops the process after a failure to make a mutation durable. Nothing may
/// be acknowledged once the log can no longer be trusted.
pub fn fatal(error: &SchedulerError) -> ! {
    error!(%error, "cannot continue without durability");
    std::process::exit(1)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::config::{Config, SyncPolicy, WalConfig};
    use crate::scheduler::{Reservation, Reserve};

    #[tokio::test]
    async fn test_timer_times_out_waiting_reserve() {
        let broker = Arc::new(Broker::new(Scheduler::new(1024)));
        let cancel = CancellationToken::new();
        let timer = tokio::spawn({
            let broker = broker.clone();
            let cancel = cancel.clone();
            async move { broker.run_timer(cancel).await }
        });

        let conn = broker.with(|s, _| s.connect()).await;
        let reserve = broker
            .with(|s, now| {
                s.reserve(conn, Some(Duration::from_millis(200)), now)
            })
            .await
            .unwrap();
        let Reserve::Waiting(rx) = reserve else {
            panic!("expected to wait");
        };

        assert_eq!(rx.await.unwrap(), Reservation::TimedOut);

        cancel.cancel();
        timer.await.unwrap();
    }

    #[tokio::test]
    async fn test_timer_promotes_delayed_job_to_waiter() {
        let broker = Arc::new(Broker::new(Scheduler::new(1024)));
        let cancel = CancellationToken::new();
        tokio::spawn({
            let broker = broker.clone();
            let cancel = cancel.clone();
            async move { broker.run_timer(cancel).await }
        });

        let (producer, consumer) =
            broker.with(|s, _| (s.connect(), s.connect())).await;
        let Reserve::Waiting(rx) = broker
            .with(|s, now| s.reserve(consumer, None, now))
            .await
            .unwrap()
        else {
            panic!("expected to wait");
        };
        let id = broker
            .with(|s, now| {
                s.put(
                    producer,
                    "default",
                    0,
                    Duration::from_millis(300),
                    Duration::from_secs(10),
                    Bytes::from_static(b"later"),
                    now,
                )
            })
            .await
            .unwrap();

        let got = time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            got,
            Reservation::Reserved {
                id,
                body: Bytes::from_static(b"later")
            }
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_sync_task_flushes_on_interval_and_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let interval = Duration::from_millis(20);
        let config = Config {
            max_job_size: 1024,
            wal: Some(WalConfig {
                dir: dir.path().to_owned(),
                file_size: 4096,
                sync: SyncPolicy::Interval(interval),
            }),
        };
        let broker = Arc::new(Broker::new(Scheduler::open(&config).unwrap()));
        let cancel = CancellationToken::new();
        let sync = tokio::spawn({
            let broker = broker.clone();
            let cancel = cancel.clone();
            async move { broker.run_sync(interval, cancel).await }
        });

        let conn = broker.with(|s, _| s.connect()).await;
        let put = |s: &mut Scheduler, now| {
            s.put(
                conn,
                "default",
                0,
                Duration::ZERO,
                Duration::from_secs(5),
                Bytes::from_static(b"x"),
                now,
            )
            .unwrap();
            s.has_unsynced_wal_writes()
        };

        // Writes under the interval policy wait for the sync task.
        assert!(broker.with(put).await);
        time::sleep(interval * 5).await;
        assert!(!broker.with(|s, _| s.has_unsynced_wal_writes()).await);

        assert!(broker.with(put).await);
        cancel.cancel();
        sync.await.unwrap();
        assert!(!broker.with(|s, _| s.has_unsynced_wal_writes()).await);
    }
}
