//! Runs the protocol for one client connection: reads commands, applies them
//! through the broker and writes back replies.
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::broker::{self, Broker};
use crate::error::{self, SchedulerError};
use crate::line_reader::LineReader;
use crate::parser::ParsingError;
use crate::scheduler::{Reservation, Reserve, Scheduler};
use crate::time::Timestamp;
use crate::types::conn::ConnId;
use crate::types::protocol::{BeanstalkCommand, BeanstalkResponse};
use crate::types::serialisable::BeanstalkSerialisable;
use crate::util::bytes_to_human_str;

/// What to do after handling one command.
enum Next {
    Reply(BeanstalkResponse),
    Close,
}

struct Session<R: AsyncRead + Unpin> {
    broker: Arc<Broker>,
    conn: ConnId,
    reader: LineReader<R>,
    cancel: CancellationToken,
}

/// Serves one connection until the client quits or disconnects, or `cancel`
/// fires. The connection's reserved jobs are released when this returns.
pub async fn run<R, W>(
    broker: Arc<Broker>,
    reader: R,
    mut writer: W,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let conn = broker.with(|s, _| s.connect()).await;
    debug!(%conn, "registered connection");

    let mut session = Session {
        broker: broker.clone(),
        conn,
        reader: reader.into(),
        cancel,
    };
    let ret = session.serve(&mut writer).await;

    broker.with(|s, now| s.disconnect(conn, now)).await;
    debug!(%conn, "unregistered connection");

    ret
}

impl<R: AsyncRead + Unpin> Session<R> {
    async fn serve<W: AsyncWrite + Unpin>(&mut self, w: &mut W) -> Result<()> {
        loop {
            let line = select!(
                x = self.reader.read_line() => match x {
                    Ok(Some(x)) => x,
                    Ok(None) => return Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        // The rest of the stream can't be framed.
                        let resp =
                            ParsingError::BadFormat.serialise_beanstalk();
                        w.write_all(&resp).await?;
                        return Ok(());
                    },
                    Err(e) => return Err(e.into()),
                },
                _ = self.cancel.cancelled() => return Ok(()),
            );

            trace!(line = bytes_to_human_str(&line), "processing command");

            let resp = match BeanstalkCommand::try_from(&line as &[u8]) {
                Ok(cmd) => match self.handle(cmd).await? {
                    Next::Reply(resp) => resp.serialise_beanstalk(),
                    Next::Close => return Ok(()),
                },
                Err(error) => error.serialise_beanstalk(),
            };

            // Slightly convoluted, but ensures we write out the buffer properly
            // with cancel safety.
            select! {
                x = w.write_all(&resp) => x?,
                _ = self.cancel.cancelled() => return Ok(()),
            };

            // Flush any buffered packets once we've written out the one or more
            // responses. This provides a pipelined response to a pipelined
            // request.
            select! {
                x = w.flush() => x?,
                _ = self.cancel.cancelled() => return Ok(()),
            };
        }
    }

    async fn handle(&mut self, cmd: BeanstalkCommand) -> io::Result<Next> {
        use BeanstalkCommand::*;
        use BeanstalkResponse as Resp;

        let conn = self.conn;
        let resp = match cmd {
            Quit => return Ok(Next::Close),

            Put {
                pri,
                delay,
                ttr,
                n_bytes,
            } => return self.put(pri, secs(delay), secs(ttr), n_bytes).await,

            Reserve => return self.reserve(None).await,
            ReserveWithTimeout { timeout } => {
                return self.reserve(Some(secs(timeout))).await;
            },
            ReserveJob { id } => {
                self.with(|s, now| {
                    s.reserve_job(conn, id, now).map(reservation)
                })
                .await
            },

            Release { id, pri, delay } => {
                self.with(|s, now| {
                    s.release(conn, id, pri, secs(delay), now)
                        .map(|_| Resp::Released)
                })
                .await
            },
            Delete { id } => {
                self.with(|s, now| {
                    s.delete(conn, id, now).map(|_| Resp::Deleted)
                })
                .await
            },
            Bury { id, pri } => {
                self.with(|s, now| {
                    s.bury(conn, id, pri, now).map(|_| Resp::Buried)
                })
                .await
            },
            Touch { id } => {
                self.with(|s, now| {
                    s.touch(conn, id, now).map(|_| Resp::Touched)
                })
                .await
            },

            Use { tube } => {
                self.with(|s, _| {
                    s.use_tube(conn, &tube)?;
                    Ok(Resp::Using { tube })
                })
                .await
            },
            Watch { tube } => {
                self.with(|s, _| {
                    s.watch(conn, &tube).map(|count| Resp::Watching { count })
                })
                .await
            },
            Ignore { tube } => {
                self.with(|s, _| {
                    s.ignore(conn, &tube).map(|count| Resp::Watching { count })
                })
                .await
            },

            Peek { id } => self.with(|s, _| s.peek(id).map(found)).await,
            PeekReady => {
                self.with(|s, _| {
                    let tube = s.using(conn)?.to_owned();
                    s.peek_ready(&tube).map(found)
                })
                .await
            },
            PeekDelayed => {
                self.with(|s, _| {
                    let tube = s.using(conn)?.to_owned();
                    s.peek_delayed(&tube).map(found)
                })
                .await
            },
            PeekBuried => {
                self.with(|s, _| {
                    let tube = s.using(conn)?.to_owned();
                    s.peek_buried(&tube).map(found)
                })
                .await
            },

            Kick { bound } => {
                self.with(|s, now| {
                    let tube = s.using(conn)?.to_owned();
                    s.kick(&tube, bound, now)
                        .map(|count| Resp::KickedCount { count })
                })
                .await
            },
            KickJob { id } => {
                self.with(|s, now| s.kick_job(id, now).map(|_| Resp::Kicked))
                    .await
            },

            StatsJob { id } => {
                self.with(|s, now| {
                    s.stats_job(id, now).map(|data| Resp::OkStatsJob { data })
                })
                .await
            },
            StatsTube { tube } => {
                self.with(|s, now| {
                    let data = s.stats_tube(&tube, now)?;
                    Ok(Resp::OkStatsTube { data })
                })
                .await
            },
            StatsServer => {
                self.with(|s, now| Ok(Resp::OkStats { data: s.stats(now) }))
                    .await
            },

            ListTubes => {
                self.with(|s, _| {
                    Ok(Resp::OkListTubes {
                        tubes: s.list_tubes(),
                    })
                })
                .await
            },
            ListTubeUsed => {
                self.with(|s, _| {
                    s.list_tube_used(conn).map(|tube| Resp::Using { tube })
                })
                .await
            },
            ListTubesWatched => {
                self.with(|s, _| {
                    s.list_tubes_watched(conn)
                        .map(|tubes| Resp::OkListTubes { tubes })
                })
                .await
            },

            PauseTube { tube, delay } => {
                self.with(|s, now| {
                    s.pause_tube(&tube, secs(delay), now).map(|_| Resp::Paused)
                })
                .await
            },
        };

        Ok(Next::Reply(resp))
    }

    /// Applies `f` through the broker, turning scheduler errors into replies.
    async fn with(
        &self,
        f: impl FnOnce(
            &mut Scheduler,
            Timestamp,
        ) -> error::Result<BeanstalkResponse>,
    ) -> BeanstalkResponse {
        match self.broker.with(f).await {
            Ok(resp) => resp,
            Err(error) => self.rejection(error),
        }
    }

    fn rejection(&self, error: SchedulerError) -> BeanstalkResponse {
        match error {
            SchedulerError::NotFound => BeanstalkResponse::NotFound,
            SchedulerError::JobTooBig { .. } => BeanstalkResponse::JobTooBig,
            SchedulerError::NotIgnored => BeanstalkResponse::NotIgnored,
            SchedulerError::NoWatchedTubes => {
                warn!(conn = %self.conn, "reserve with an empty watch list");
                BeanstalkResponse::InternalError
            },
            error @ SchedulerError::Durability(_) => broker::fatal(&error),
        }
    }

    /// Reads the body following a `put` line, then creates the job.
    async fn put(
        &mut self,
        pri: u32,
        delay: Duration,
        ttr: Duration,
        n_bytes: u32,
    ) -> io::Result<Next> {
        let len = n_bytes as usize;

        if n_bytes > self.broker.max_job_size() {
            // Skip the body and its CRLF so the next command lines up.
            return Ok(match self.reader.discard(len + 2).await? {
                true => Next::Reply(BeanstalkResponse::JobTooBig),
                false => Next::Close,
            });
        }

        let Some(mut body) = self.reader.read_exact(len + 2).await? else {
            return Ok(Next::Close);
        };
        if &body[len..] != b"\r\n" {
            return Ok(Next::Reply(BeanstalkResponse::ExpectedCRLF));
        }
        body.truncate(len);

        let conn = self.conn;
        let resp = self
            .with(|s, now| {
                let tube = s.using(conn)?.to_owned();
                s.put(conn, &tube, pri, delay, ttr, body, now)
                    .map(|id| BeanstalkResponse::Inserted { id })
            })
            .await;
        Ok(Next::Reply(resp))
    }

    /// Reserves a job, waiting for one if needed. While waiting, the socket
    /// is still read so that a disconnect is noticed straight away.
    async fn reserve(&mut self, timeout: Option<Duration>) -> io::Result<Next> {
        let conn = self.conn;
        let reserve = self
            .broker
            .with(|s, now| s.reserve(conn, timeout, now))
            .await;

        let mut rx = match reserve {
            Ok(Reserve::Done(r)) => return Ok(Next::Reply(reservation(r))),
            Ok(Reserve::Waiting(rx)) => rx,
            Err(error) => return Ok(Next::Reply(self.rejection(error))),
        };

        loop {
            select! {
                r = &mut rx => return Ok(match r {
                    Ok(r) => Next::Reply(reservation(r)),
                    // The scheduler dropped the waiter without answering.
                    Err(_) => Next::Reply(BeanstalkResponse::InternalError),
                }),
                n = self.reader.fill() => {
                    if n? == 0 {
                        debug!(%conn, "client left while waiting");
                        return Ok(Next::Close);
                    }
                },
                _ = self.cancel.cancelled() => return Ok(Next::Close),
            }
        }
    }
}

fn secs(n: u32) -> Duration {
    Duration::from_secs(u64::from(n))
}

fn reservation(r: Reservation) -> BeanstalkResponse {
    match r {
        Reservation::Reserved { id, body } => {
            BeanstalkResponse::Reserved { id, data: body }
        },
        Reservation::TimedOut => BeanstalkResponse::TimedOut,
        Reservation::DeadlineSoon => BeanstalkResponse::DeadlineSoon,
    }
}

fn found((id, data): (u64, Bytes)) -> BeanstalkResponse {
    BeanstalkResponse::Found { id, data }
}
