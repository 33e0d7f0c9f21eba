use anyhow::Error;
use clap::Parser;

use meetq::telemetry;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use meetq::memory::MemoryStore;
use meetq::queue::{TaskQueue, DEFAULT_MAX_ATTEMPTS};
use meetq::server;
use meetq::store::{QueueStore, RedisStore};
use meetq::worker::{self, SimulatedProcessor};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(
        short = 'r',
        long = "redis_url",
        help = "Redis Connection URL",
        default_value = "redis://127.0.0.1/"
    )]
    redis_url: String,

    #[arg(
        short = 'n',
        long = "workers",
        help = "Number of Worker Loops in Parallel",
        default_value = "2"
    )]
    workers: u16,

    #[arg(
        short = 'l',
        long = "listen",
        help = "HTTP Listen Address for the Status Endpoints",
        default_value = "127.0.0.1:8001"
    )]
    listen: String,

    #[arg(
        long = "pop_timeout",
        help = "Blocking Dequeue Timeout in Seconds (bounds shutdown latency)",
        default_value = "5"
    )]
    pop_timeout: u64,

    #[arg(
        long = "max_attempts",
        help = "Execution Attempts before a Job Fails Terminally",
        default_value_t = DEFAULT_MAX_ATTEMPTS
    )]
    max_attempts: u32,

    #[arg(
        long = "embedded",
        help = "Run against an In-Process Queue instead of Redis"
    )]
    embedded: bool,
}

#[instrument(skip(cancel_token))]
async fn setup(cancel_token: CancellationToken) -> Result<(), Error> {
    let config = ConfigContext::parse();

    let store: Arc<dyn QueueStore> = if config.embedded {
        warn!("Using the embedded in-process queue; jobs will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        let store = RedisStore::connect(&config.redis_url).await?;
        store.ping().await?;
        info!("Redis ping successful");
        Arc::new(store)
    };

    let queue = TaskQueue::new(store, config.max_attempts);
    let processor = Arc::new(SimulatedProcessor);
    let pop_timeout = Duration::from_secs(config.pop_timeout);

    let mut workers = vec![];
    for _ in 0..config.workers {
        let cancel_token = cancel_token.clone();
        let queue = queue.clone();
        let processor = processor.clone();
        let worker_id = Uuid::new_v4();
        let join_handle = tokio::spawn(
            async move {
                worker::start(cancel_token, queue, processor, pop_timeout).await;
            }
            .instrument(info_span!("worker", id = %worker_id)),
        );
        workers.push(join_handle);
    }

    let listener = TcpListener::bind(&config.listen).await?;
    info!(message = "Serving status endpoints", listen = %config.listen);
    let shutdown_token = cancel_token.clone();
    axum::serve(listener, server::router(queue))
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await?;

    // Bounded wait for jobs that are mid-process; past that we exit anyway.
    match tokio::time::timeout(
        Duration::from_secs(30),
        futures::future::join_all(workers),
    )
    .await
    {
        Ok(results) => {
            results.into_iter().collect::<Result<Vec<_>, _>>()?;
            info!("Server stopped.");
        }
        Err(_) => warn!("Workers did not stop gracefully within 30s, exiting anyway"),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "meetq=DEBUG");
    }

    telemetry::init()?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(cloned_token));

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).unwrap();
        let mut sigint = signal(SignalKind::interrupt()).unwrap();
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    println!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
