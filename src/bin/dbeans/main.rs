mod args;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use durable_beans::broker::Broker;
use durable_beans::config::SyncPolicy;
use durable_beans::scheduler::Scheduler;
use durable_beans::server;
use durable_beans::wal::WalError;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::Args;

/// Exit code when another process holds the WAL directory.
const EXIT_LOCKED: u8 = 10;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let config = args.config();
    let scheduler = match Scheduler::open(&config) {
        Ok(scheduler) => scheduler,
        Err(error @ WalError::Locked { .. }) => {
            error!(%error, "cannot lock WAL directory");
            return ExitCode::from(EXIT_LOCKED);
        },
        Err(error) => {
            error!(%error, "failed to recover from WAL");
            return ExitCode::FAILURE;
        },
    };
    let broker = Arc::new(Broker::new(scheduler));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    // Background tasks run until cancelled; waiting on them keeps the final
    // WAL sync ahead of process exit.
    let mut tasks = JoinSet::new();
    tasks.spawn({
        let broker = broker.clone();
        let cancel = cancel.clone();
        async move { broker.run_timer(cancel).await }
    });
    if let Some(SyncPolicy::Interval(interval)) = config.wal.map(|w| w.sync) {
        let broker = broker.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { broker.run_sync(interval, cancel).await });
    }

    let result = begin(&args, broker, cancel.clone()).await;
    let exit_code = if let Err(error) = result {
        error!(%error, "encountered runtime error");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    };

    cancel.cancel();
    while tasks.join_next().await.is_some() {}
    info!("shut down");

    exit_code
}

async fn begin(
    args: &Args,
    broker: Arc<Broker>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind((args.listen, args.port))
        .await
        .context("binding listener")?;

    server::serve(listener, broker, cancel).await
}
