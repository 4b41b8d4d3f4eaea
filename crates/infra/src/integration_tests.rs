//! Integration tests for the full stream pipeline.
//!
//! Tests: Producer → StreamStore → GroupReader / EventStreamListener
//!
//! Verifies:
//! - Work appended by a producer reaches exactly one group member
//! - A job's lifecycle events reach every listener, in order
//! - A listener restarted from its saved cursor misses nothing and repeats nothing

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use jobstream_core::{Cursor, RecordId};
    use jobstream_events::{EventKind, Notification, QueueEvent, Topic};

    use crate::config::{GroupReaderConfig, ListenerConfig};
    use crate::connection::{KeyNamespace, StreamContext};
    use crate::consumer::{GroupReader, GroupRecord};
    use crate::listener::EventStreamListener;
    use crate::producer::{EventProducer, RecordProducer};
    use crate::stream_store::InMemoryStreamStore;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SendEmail {
        to: String,
    }

    fn setup() -> (Arc<InMemoryStreamStore>, StreamContext) {
        let store = Arc::new(InMemoryStreamStore::new());
        let ctx = StreamContext::new(store.clone(), KeyNamespace::new("bull", "mail"));
        (store, ctx)
    }

    async fn until_parked(store: &InMemoryStreamStore, readers: usize) {
        tokio::time::timeout(WAIT, async {
            while store.blocked_reads() < readers {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("readers never parked");
    }

    #[tokio::test]
    async fn worker_processes_jobs_and_reports_through_events() {
        let (store, ctx) = setup();
        let jobs = RecordProducer::new(&ctx, "jobs");
        let events = Arc::new(EventProducer::new(&ctx));

        let listener = EventStreamListener::new(&ctx, ListenerConfig::default().with_blocking_timeout(Duration::from_millis(50))).unwrap();
        let mut completed = listener.subscribe(Topic::kind(EventKind::Completed));

        let reader = GroupReader::new(
            &ctx,
            "jobs",
            GroupReaderConfig::default().with_block_time(Duration::from_millis(20)),
        );
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let publisher = events.clone();
        let handle = reader
            .consume("senders", move |record: GroupRecord<SendEmail>| {
                let sink = sink.clone();
                let events = publisher.clone();
                async move {
                    sink.lock().unwrap().push(record.data.to.clone());
                    events
                        .publish(&QueueEvent::Completed {
                            job_id: record.id.to_string(),
                            returnvalue: json!({"sent": record.data.to}),
                            prev: Some("active".into()),
                        })
                        .await?;
                    Ok(())
                }
            })
            .unwrap();
        until_parked(&store, 2).await;

        let first = jobs.append(&SendEmail { to: "a@example.com".into() }).await.unwrap();
        let second = jobs.append(&SendEmail { to: "b@example.com".into() }).await.unwrap();

        let mut done = Vec::new();
        for _ in 0..2 {
            match completed.recv_timeout(WAIT).await {
                Some(Notification::Event { event: QueueEvent::Completed { job_id, .. }, .. }) => done.push(job_id),
                other => panic!("unexpected notification {other:?}"),
            }
        }
        assert_eq!(done, vec![first.to_string(), second.to_string()]);
        assert_eq!(*delivered.lock().unwrap(), vec!["a@example.com", "b@example.com"]);
        assert_eq!(reader.length().await.unwrap(), 2);

        // unrelated producer traffic does not leak into the job stream
        events.publish(&QueueEvent::Drained).await.unwrap();
        assert_eq!(reader.length().await.unwrap(), 2);

        reader.close();
        handle.join().await.unwrap();
        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn restart_from_saved_cursor_is_gapless() {
        let (store, ctx) = setup();
        let producer = EventProducer::new(&ctx);
        let cfg = ListenerConfig::default().with_blocking_timeout(Duration::from_millis(50));

        let first = EventStreamListener::new(&ctx, cfg.clone()).unwrap();
        let mut waiting = first.subscribe(Topic::kind("waiting"));
        until_parked(&store, 1).await;

        let mut ids = Vec::new();
        for job in 0..3 {
            let event = QueueEvent::Waiting {
                job_id: job.to_string(),
                prev: None,
            };
            ids.push(producer.publish(&event).await.unwrap());
        }
        for _ in 0..3 {
            waiting.recv_timeout(WAIT).await.unwrap();
        }
        first.close().await.unwrap();
        let saved = first.cursor();
        assert_eq!(saved, Cursor::After(ids[2]));

        // published while nobody listens
        for job in 3..6 {
            let event = QueueEvent::Waiting {
                job_id: job.to_string(),
                prev: None,
            };
            ids.push(producer.publish(&event).await.unwrap());
        }

        let resumed_from = saved.last_id().unwrap_or(RecordId::MIN);
        let second = EventStreamListener::new(&ctx, cfg.with_last_event_id(resumed_from)).unwrap();
        let mut waiting = second.subscribe(Topic::kind("waiting"));
        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(waiting.recv_timeout(WAIT).await.unwrap().id().unwrap());
        }
        assert_eq!(got, ids[3..].to_vec());
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn job_events_reach_every_listener_and_its_entity_topic() {
        let (store, ctx) = setup();
        let producer = EventProducer::new(&ctx);
        let cfg = ListenerConfig::default().with_blocking_timeout(Duration::from_millis(50));

        let dashboards: Vec<EventStreamListener> =
            (0..2).map(|_| EventStreamListener::new(&ctx, cfg.clone()).unwrap()).collect();
        let mut job_watchers: Vec<_> = dashboards
            .iter()
            .map(|l| l.subscribe(Topic::entity(EventKind::Progress, "42")))
            .collect();
        until_parked(&store, 2).await;

        for pct in [10, 60, 100] {
            producer
                .publish(&QueueEvent::Progress {
                    job_id: "42".into(),
                    data: json!(pct),
                })
                .await
                .unwrap();
        }
        producer
            .publish(&QueueEvent::Progress {
                job_id: "43".into(),
                data: json!(5),
            })
            .await
            .unwrap();

        for watcher in &mut job_watchers {
            let mut seen = Vec::new();
            for _ in 0..3 {
                match watcher.recv_timeout(WAIT).await.unwrap() {
                    Notification::Event { event: QueueEvent::Progress { data, .. }, .. } => seen.push(data),
                    other => panic!("unexpected notification {other:?}"),
                }
            }
            assert_eq!(seen, vec![json!(10), json!(60), json!(100)]);
            assert!(watcher.recv_timeout(Duration::from_millis(100)).await.is_none());
        }

        for listener in &dashboards {
            listener.close().await.unwrap();
        }
        ctx.close().await.unwrap();
        assert_eq!(store.open_connections(), 1);
    }
}
