//! Tail a queue's event stream and log every event.
//!
//! Configured through the environment (`REDIS_URL`, `JOBSTREAM_PREFIX`,
//! `JOBSTREAM_QUEUE`, `JOBSTREAM_LAST_EVENT_ID`, ...). On ctrl-c the last
//! seen id is logged; pass it back as `JOBSTREAM_LAST_EVENT_ID` to resume.

use std::sync::Arc;

use anyhow::Context;

use jobstream_events::{EventKind, Notification, Topic};
use jobstream_infra::stream_store::RedisConnector;
use jobstream_infra::{EventStreamListener, StreamContext, StreamSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobstream_observability::init();

    let settings = StreamSettings::from_env().context("invalid configuration")?;
    let connector = RedisConnector::open(&settings.redis_url)
        .with_context(|| format!("cannot use redis url {}", settings.redis_url))?;
    let ctx = StreamContext::from_settings(Arc::new(connector), &settings);

    let listener = EventStreamListener::new(&ctx, settings.listener.clone())?;
    tracing::info!(stream = listener.stream(), cursor = %listener.cursor(), "tailing");

    let topics = EventKind::KNOWN
        .into_iter()
        .map(Topic::Kind)
        .chain(std::iter::once(Topic::Error));
    for topic in topics {
        let mut sub = listener.subscribe(topic);
        tokio::spawn(async move {
            while let Some(notification) = sub.recv().await {
                log(&notification);
            }
        });
    }

    tokio::signal::ctrl_c().await.context("failed to wait for ctrl-c")?;

    let outcome = listener.close().await;
    let _ = ctx.close().await;
    tracing::info!(cursor = %listener.cursor(), "stopped");
    outcome.context("listener ended with an error")
}

fn log(notification: &Notification) {
    match notification {
        Notification::Event { id, event } => {
            tracing::info!(%id, kind = %event.kind(), job_id = event.job_id(), event = ?event, "event");
        }
        Notification::Drained { id } => tracing::info!(%id, kind = "drained", "event"),
        Notification::Error { message } => tracing::error!(%message, "listener error"),
    }
}
