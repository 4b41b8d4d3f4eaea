//! Consumer group reader.
//!
//! Delivers every record of a stream to a callback at least once, as one
//! member of a consumer group. Each loop pass:
//!
//! 1. drains this member's pending entries (and entries the store hands over
//!    from idle members); stale entries are acknowledged unprocessed
//! 2. trims records past the retention horizon, at most once per interval
//! 3. only when nothing was pending, waits for new records
//!
//! A record is acknowledged only after its callback succeeded. Failed records
//! stay pending and come back on a later pass.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobstream_core::{LifecycleState, RecordId, StreamRecord, now_ms};

use crate::config::GroupReaderConfig;
use crate::connection::{LifecycleCell, StreamContext};
use crate::stream_store::{GroupSelector, GroupStart, RangeBound, StoreError, StreamStore};

/// A record as handed to the callback.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRecord<T> {
    pub id: RecordId,
    pub fields: HashMap<String, String>,
    /// The decoded payload field.
    pub data: T,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReaderError {
    /// The consumer group could not be created. Fatal.
    #[error("failed to set up consumer group {group}: {source}")]
    Setup { group: String, source: StoreError },

    #[error("callback failed for record {id}: {message}")]
    Callback { id: RecordId, message: String },

    #[error("cannot decode record {id}: {message}")]
    Decode { id: RecordId, message: String },

    #[error(transparent)]
    Transport(#[from] StoreError),

    #[error("reader is already consuming")]
    AlreadyConsuming,

    #[error("reader is closed")]
    Closed,

    #[error("reader task failed: {0}")]
    Task(String),
}

/// Result of one trim maintenance step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrimOutcome {
    /// The last trim ran less than one interval ago.
    Skipped,
    /// The oldest record is still within retention.
    NothingToTrim,
    Trimmed { cutoff: RecordId, removed: u64 },
}

/// Running consume loop.
#[derive(Debug)]
pub struct ConsumeHandle {
    task: JoinHandle<Result<(), ReaderError>>,
    errors: mpsc::Receiver<ReaderError>,
    dropped: Arc<AtomicU64>,
}

impl ConsumeHandle {
    /// Next reported error. Callback and decode failures are reported here
    /// without stopping the loop.
    pub async fn next_error(&mut self) -> Option<ReaderError> {
        self.errors.recv().await
    }

    pub fn try_next_error(&mut self) -> Option<ReaderError> {
        self.errors.try_recv().ok()
    }

    /// Errors discarded because the backlog was full.
    pub fn dropped_errors(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to return.
    pub async fn join(self) -> Result<(), ReaderError> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(ReaderError::Task(e.to_string())),
        }
    }
}

/// Rate limiter for trim passes: due immediately, then once per interval.
#[derive(Debug, Clone)]
pub struct TrimSchedule {
    interval: Duration,
    next: Option<Instant>,
}

impl TrimSchedule {
    pub fn new(interval: Duration) -> Self {
        Self { interval, next: None }
    }

    /// Whether a trim may run at `now`. Claims the slot when it may.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.next {
            Some(next) if now < next => false,
            _ => {
                self.next = Some(now + self.interval);
                true
            }
        }
    }
}

/// Trim every record older than `now - max_retention_ms`.
///
/// Only the oldest record is inspected; the stream is trimmed when it
/// precedes the cutoff.
pub async fn trim_expired(
    store: &dyn StreamStore,
    stream: &str,
    max_retention_ms: u64,
) -> Result<TrimOutcome, StoreError> {
    let cutoff = now_ms().saturating_sub(max_retention_ms);
    let oldest = store.range(stream, RangeBound::Oldest, RangeBound::Newest, 1).await?;

    match oldest.first() {
        Some(record) if record.id.timestamp_ms() < cutoff => {
            let cutoff = RecordId::at_millis(cutoff);
            let removed = store.trim(stream, cutoff).await?;
            Ok(TrimOutcome::Trimmed { cutoff, removed })
        }
        _ => Ok(TrimOutcome::NothingToTrim),
    }
}

/// A member of a consumer group on one stream.
#[derive(Debug)]
pub struct GroupReader {
    ctx: StreamContext,
    stream: String,
    config: GroupReaderConfig,
    consumer: String,
    closing: CancellationToken,
    state: Arc<LifecycleCell>,
    consuming: AtomicBool,
}

impl GroupReader {
    /// Reader of the stream `name` in the context's key namespace.
    pub fn new(ctx: &StreamContext, name: &str, config: GroupReaderConfig) -> Self {
        Self {
            stream: ctx.keys().key(name),
            closing: ctx.closing().child_token(),
            ctx: ctx.clone(),
            config,
            consumer: uuid::Uuid::new_v4().to_string(),
            state: Arc::new(LifecycleCell::default()),
            consuming: AtomicBool::new(false),
        }
    }

    /// Full key of the stream.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// This reader's consumer name within its group.
    pub fn consumer_id(&self) -> &str {
        &self.consumer
    }

    pub fn config(&self) -> &GroupReaderConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    /// Number of records currently in the stream.
    pub async fn length(&self) -> Result<u64, StoreError> {
        self.ctx.client().len(&self.stream).await
    }

    /// Start consuming as a member of `group`.
    ///
    /// The group is created on the loop's first pass (an existing group is
    /// fine). Must be called within a tokio runtime.
    pub fn consume<T, F, Fut>(&self, group: &str, callback: F) -> Result<ConsumeHandle, ReaderError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(GroupRecord<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.consuming.swap(true, Ordering::SeqCst) {
            return Err(ReaderError::AlreadyConsuming);
        }
        if self.closing.is_cancelled() || !self.state.transition(LifecycleState::Running) {
            return Err(ReaderError::Closed);
        }

        let (errors_tx, errors_rx) = mpsc::channel(self.config.error_backlog.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let worker = ReaderLoop {
            store: self.ctx.dedicated(),
            stream: self.stream.clone(),
            group: group.to_string(),
            consumer: self.consumer.clone(),
            config: self.config.clone(),
            closing: self.closing.clone(),
            errors: errors_tx,
            dropped: dropped.clone(),
            trim: TrimSchedule::new(self.config.trim_interval()),
        };
        let state = self.state.clone();

        let task = tokio::spawn(async move {
            let outcome = worker.run(callback).await;
            state.transition(LifecycleState::Closed);
            outcome
        });

        Ok(ConsumeHandle {
            task,
            errors: errors_rx,
            dropped,
        })
    }

    /// Ask the loop to stop after its current record. Await
    /// [`ConsumeHandle::join`] to wait for it.
    pub fn close(&self) {
        self.closing.cancel();
        if !self.state.transition(LifecycleState::Closing) {
            self.state.transition(LifecycleState::Closed);
        }
    }
}

/// What a pass over a batch achieved.
enum Pass {
    /// At least one record was acknowledged.
    Progress,
    /// Every record failed.
    Stuck,
}

struct ReaderLoop {
    store: Arc<dyn StreamStore>,
    stream: String,
    group: String,
    consumer: String,
    config: GroupReaderConfig,
    closing: CancellationToken,
    errors: mpsc::Sender<ReaderError>,
    dropped: Arc<AtomicU64>,
    trim: TrimSchedule,
}

impl ReaderLoop {
    async fn run<T, F, Fut>(mut self, callback: F) -> Result<(), ReaderError>
    where
        T: DeserializeOwned,
        F: Fn(GroupRecord<T>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if let Err(err) = self.ensure_group().await {
            error!(stream = %self.stream, group = %self.group, error = %err, "consumer group setup failed");
            self.report(err.clone());
            let _ = self.store.quit().await;
            return Err(err);
        }
        info!(stream = %self.stream, group = %self.group, consumer = %self.consumer, "consuming");

        while !self.closing.is_cancelled() {
            match self.pass(&callback).await {
                Ok(Pass::Progress) => {}
                Ok(Pass::Stuck) => self.back_off().await,
                Err(StoreError::Closed) => break,
                Err(StoreError::NoSuchKey(reason)) => {
                    warn!(stream = %self.stream, group = %self.group, %reason, "group vanished, recreating");
                    if let Err(err) = self.ensure_group().await {
                        self.report(err);
                        self.back_off().await;
                    }
                }
                Err(err) => {
                    warn!(stream = %self.stream, group = %self.group, error = %err, "stream read failed");
                    self.report(ReaderError::Transport(err));
                    self.back_off().await;
                }
            }
        }

        debug!(stream = %self.stream, consumer = %self.consumer, "consumer loop stopped");
        let _ = self.store.quit().await;
        Ok(())
    }

    async fn ensure_group(&self) -> Result<(), ReaderError> {
        match self
            .store
            .create_group(&self.stream, &self.group, GroupStart::Beginning, true)
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::GroupExists(_)) => Ok(()),
            Err(source) => Err(ReaderError::Setup {
                group: self.group.clone(),
                source,
            }),
        }
    }

    async fn pass<T, F, Fut>(&mut self, callback: &F) -> Result<Pass, StoreError>
    where
        T: DeserializeOwned,
        F: Fn(GroupRecord<T>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let pending = self
            .store
            .read_group(
                &self.stream,
                &self.group,
                &self.consumer,
                GroupSelector::Pending,
                self.config.batch_size,
                None,
            )
            .await?;
        if !pending.is_empty() {
            return self.drain_pending(pending, callback).await;
        }

        self.maintain().await;

        let block = self.config.block_time().max(Duration::from_millis(1));
        let read = self.store.read_group(
            &self.stream,
            &self.group,
            &self.consumer,
            GroupSelector::New,
            self.config.batch_size,
            Some(block),
        );
        let fresh = tokio::select! {
            _ = self.closing.cancelled() => return Ok(Pass::Progress),
            read = read => read?,
        };

        if fresh.is_empty() {
            return Ok(Pass::Progress);
        }
        let mut progressed = false;
        for record in fresh {
            progressed |= self.process(record, callback).await?;
        }
        Ok(if progressed { Pass::Progress } else { Pass::Stuck })
    }

    async fn drain_pending<T, F, Fut>(&self, batch: Vec<StreamRecord>, callback: &F) -> Result<Pass, StoreError>
    where
        T: DeserializeOwned,
        F: Fn(GroupRecord<T>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let now = now_ms();
        let mut progressed = false;

        for record in batch {
            if record.id.age_ms(now) > self.config.max_retention_ms {
                self.store.ack(&self.stream, &self.group, record.id).await?;
                debug!(stream = %self.stream, id = %record.id, "discarded stale pending record");
                progressed = true;
                continue;
            }
            progressed |= self.process(record, callback).await?;
        }

        Ok(if progressed { Pass::Progress } else { Pass::Stuck })
    }

    /// Decode, run the callback, acknowledge on success.
    async fn process<T, F, Fut>(&self, record: StreamRecord, callback: &F) -> Result<bool, StoreError>
    where
        T: DeserializeOwned,
        F: Fn(GroupRecord<T>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let id = record.id;
        let raw = record.field(&self.config.payload_field).unwrap_or("null");
        let data = match serde_json::from_str::<T>(raw) {
            Ok(data) => data,
            Err(e) => {
                warn!(stream = %self.stream, %id, error = %e, "undecodable record left pending");
                self.report(ReaderError::Decode {
                    id,
                    message: e.to_string(),
                });
                return Ok(false);
            }
        };

        let item = GroupRecord {
            id,
            fields: record.to_map(),
            data,
        };
        match callback(item).await {
            Ok(()) => {
                self.store.ack(&self.stream, &self.group, id).await?;
                Ok(true)
            }
            Err(e) => {
                debug!(stream = %self.stream, %id, error = %e, "callback failed, record stays pending");
                self.report(ReaderError::Callback {
                    id,
                    message: format!("{e:#}"),
                });
                Ok(false)
            }
        }
    }

    async fn maintain(&mut self) -> TrimOutcome {
        if !self.trim.poll(Instant::now()) {
            return TrimOutcome::Skipped;
        }
        let outcome = trim_expired(self.store.as_ref(), &self.stream, self.config.max_retention_ms)
            .await
            .unwrap_or_else(|e| {
                warn!(stream = %self.stream, error = %e, "trim failed");
                TrimOutcome::NothingToTrim
            });
        if let TrimOutcome::Trimmed { cutoff, removed } = outcome {
            info!(stream = %self.stream, %cutoff, removed, "trimmed expired records");
        }
        outcome
    }

    async fn back_off(&self) {
        tokio::select! {
            _ = self.closing.cancelled() => {}
            _ = tokio::time::sleep(self.config.failure_backoff()) => {}
        }
    }

    fn report(&self, err: ReaderError) {
        if let Err(mpsc::error::TrySendError::Full(err)) = self.errors.try_send(err) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(stream = %self.stream, error = %err, "error backlog full, dropping report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::KeyNamespace;
    use crate::stream_store::{AppendOptions, InMemoryStreamStore};
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Job {
        n: u32,
    }

    fn payload(n: u32) -> Vec<(String, String)> {
        vec![("data".to_string(), format!(r#"{{"n":{n}}}"#))]
    }

    fn context(store: &Arc<InMemoryStreamStore>) -> StreamContext {
        StreamContext::new(store.clone(), KeyNamespace::new("bull", "q"))
    }

    fn fast() -> GroupReaderConfig {
        GroupReaderConfig::default()
            .with_batch_size(10)
            .with_block_time(Duration::from_millis(20))
            .with_failure_backoff(Duration::from_millis(5))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn recorder() -> (Arc<Mutex<Vec<RecordId>>>, impl Fn(GroupRecord<Job>) -> std::future::Ready<anyhow::Result<()>> + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback = move |record: GroupRecord<Job>| {
            sink.lock().unwrap().push(record.id);
            std::future::ready(Ok(()))
        };
        (seen, callback)
    }

    #[test]
    fn trim_schedule_fires_once_per_interval() {
        let mut schedule = TrimSchedule::new(Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(schedule.poll(t0));
        assert!(!schedule.poll(t0));
        assert!(!schedule.poll(t0 + Duration::from_secs(59)));
        assert!(schedule.poll(t0 + Duration::from_secs(60)));
        assert!(!schedule.poll(t0 + Duration::from_secs(61)));
    }

    #[tokio::test]
    async fn trim_removes_only_records_before_the_cutoff() {
        let store = InMemoryStreamStore::new();
        let now = now_ms();
        let old = RecordId::new(now - 10_000, 0);
        let fresh = RecordId::new(now - 1_000, 0);
        store.append("s", AppendOptions::default().with_id(old), &payload(1)).await.unwrap();
        store.append("s", AppendOptions::default().with_id(fresh), &payload(2)).await.unwrap();

        let outcome = trim_expired(&store, "s", 5_000).await.unwrap();
        let TrimOutcome::Trimmed { cutoff, removed } = outcome else {
            panic!("expected a trim, got {outcome:?}");
        };
        assert_eq!(removed, 1);
        assert!(cutoff > old && cutoff <= fresh);
        assert_eq!(store.ids("s"), vec![fresh]);

        assert_eq!(trim_expired(&store, "s", 5_000).await.unwrap(), TrimOutcome::NothingToTrim);
        assert_eq!(trim_expired(&store, "empty", 0).await.unwrap(), TrimOutcome::NothingToTrim);
    }

    proptest::proptest! {
        #[test]
        fn trim_never_touches_records_inside_retention(
            ages in proptest::collection::vec(0u64..20_000, 1..30),
            retention in 1_000u64..15_000,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
            rt.block_on(async {
                let store = InMemoryStreamStore::new();
                let now = now_ms();
                let mut stamps: Vec<u64> = ages.iter().map(|age| now - age).collect();
                stamps.sort_unstable();
                stamps.dedup();
                for ts in &stamps {
                    store.append("s", AppendOptions::default().with_id(RecordId::at_millis(*ts)), &[]).await.unwrap();
                }

                let outcome = trim_expired(&store, "s", retention).await.unwrap();
                let kept = store.ids("s");
                match outcome {
                    TrimOutcome::Trimmed { cutoff, removed } => {
                        proptest::prop_assert!(cutoff.timestamp_ms() >= now - retention);
                        proptest::prop_assert!(kept.iter().all(|id| *id >= cutoff));
                        let expected = stamps.iter().filter(|ts| **ts >= cutoff.timestamp_ms()).count();
                        proptest::prop_assert_eq!(kept.len(), expected);
                        proptest::prop_assert_eq!(removed as usize, stamps.len() - expected);
                    }
                    other => {
                        proptest::prop_assert_eq!(other, TrimOutcome::NothingToTrim);
                        proptest::prop_assert_eq!(kept.len(), stamps.len());
                    }
                }
                Ok::<(), proptest::test_runner::TestCaseError>(())
            })?;
        }
    }

    #[tokio::test]
    async fn zero_retention_discards_pending_records_without_callback() {
        let store = Arc::new(InMemoryStreamStore::with_claim_idle(Some(Duration::ZERO)));
        let ctx = context(&store);
        let stream = ctx.keys().key("jobs");
        for i in 1..=3 {
            store.append(&stream, AppendOptions::default().with_id(RecordId::new(i, 0)), &payload(i as u32)).await.unwrap();
        }
        store.create_group(&stream, "workers", GroupStart::Beginning, false).await.unwrap();
        // a crashed member took them and never acknowledged
        store.read_group(&stream, "workers", "crashed", GroupSelector::New, 10, None).await.unwrap();
        assert_eq!(store.pending_ids(&stream, "workers").len(), 3);

        let reader = GroupReader::new(&ctx, "jobs", fast().with_max_retention(Duration::ZERO));
        let (seen, callback) = recorder();
        let handle = reader.consume("workers", callback).unwrap();

        wait_until(|| store.pending_ids(&stream, "workers").is_empty()).await;
        reader.close();
        handle.join().await.unwrap();

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(reader.state(), LifecycleState::Closed);
    }

    #[tokio::test]
    async fn pending_records_are_processed_before_new_ones() {
        let store = Arc::new(InMemoryStreamStore::new());
        let ctx = context(&store);
        let reader = GroupReader::new(&ctx, "jobs", fast().with_batch_size(1));
        let stream = reader.stream().to_string();

        for n in 1..=2 {
            store.append(&stream, AppendOptions::default(), &payload(n)).await.unwrap();
        }
        store.create_group(&stream, "g", GroupStart::Beginning, false).await.unwrap();
        // deliver both to this reader's identity without acknowledging them
        let pending = store
            .read_group(&stream, "g", reader.consumer_id(), GroupSelector::New, 10, None)
            .await
            .unwrap();
        for n in 3..=4 {
            store.append(&stream, AppendOptions::default(), &payload(n)).await.unwrap();
        }

        let (seen, callback) = recorder();
        let handle = reader.consume("g", callback).unwrap();
        wait_until(|| seen.lock().unwrap().len() == 4).await;
        reader.close();
        handle.join().await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(&seen[..2], &[pending[0].id, pending[1].id]);
        assert!(store.pending_ids(&stream, "g").is_empty());
    }

    #[tokio::test]
    async fn failed_records_stay_pending_and_come_back() {
        let store = Arc::new(InMemoryStreamStore::new());
        let ctx = context(&store);
        let reader = GroupReader::new(&ctx, "jobs", fast());
        let stream = reader.stream().to_string();

        let attempts = Arc::new(Mutex::new(0u32));
        let counter = attempts.clone();
        let mut handle = reader
            .consume("g", move |_record: GroupRecord<Job>| {
                let counter = counter.clone();
                async move {
                    let mut n = counter.lock().unwrap();
                    *n += 1;
                    if *n < 3 {
                        anyhow::bail!("attempt {n} failed");
                    }
                    Ok(())
                }
            })
            .unwrap();

        let id = store.append(&stream, AppendOptions::default(), &payload(7)).await.unwrap();

        let first = handle.next_error().await.unwrap();
        assert_eq!(
            first,
            ReaderError::Callback {
                id,
                message: "attempt 1 failed".to_string()
            }
        );
        wait_until(|| *attempts.lock().unwrap() == 3).await;
        wait_until(|| store.pending_ids(&stream, "g").is_empty()).await;

        reader.close();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn stale_pending_records_are_dropped_and_fresh_ones_processed() {
        let store = Arc::new(InMemoryStreamStore::new());
        let ctx = context(&store);
        let reader = GroupReader::new(&ctx, "jobs", fast().with_max_retention(Duration::from_secs(5)));
        let stream = reader.stream().to_string();

        let now = now_ms();
        let mut stale = Vec::new();
        for n in 0..2 {
            let id = RecordId::new(now - 10_000 + n, 0);
            store.append(&stream, AppendOptions::default().with_id(id), &payload(n as u32)).await.unwrap();
            stale.push(id);
        }
        let fresh = store.append(&stream, AppendOptions::default(), &payload(9)).await.unwrap();
        store.create_group(&stream, "g", GroupStart::Beginning, false).await.unwrap();
        let batch = store
            .read_group(&stream, "g", reader.consumer_id(), GroupSelector::New, 10, None)
            .await
            .unwrap();
        assert_eq!(batch.len(), 3);

        let (seen, callback) = recorder();
        let handle = reader.consume("g", callback).unwrap();
        wait_until(|| seen.lock().unwrap().len() == 1).await;
        wait_until(|| store.pending_ids(&stream, "g").is_empty()).await;
        // the pass after the drain trims them from the stream as well
        wait_until(|| store.ids(&stream) == vec![fresh]).await;
        reader.close();
        handle.join().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![fresh]);
        assert!(stale.iter().all(|id| *id < fresh));
    }

    #[tokio::test]
    async fn running_reader_trims_at_most_once_per_interval() {
        let store = Arc::new(InMemoryStreamStore::new());
        let ctx = context(&store);
        let config = fast()
            .with_block_time(Duration::from_millis(5))
            .with_max_retention(Duration::from_secs(5))
            .with_trim_interval(Duration::from_secs(60));
        let reader = GroupReader::new(&ctx, "jobs", config);
        let stream = reader.stream().to_string();

        let now = now_ms();
        for n in 0..3 {
            let id = RecordId::new(now - 10_000 + n, 0);
            store.append(&stream, AppendOptions::default().with_id(id), &payload(n as u32)).await.unwrap();
        }

        let (seen, callback) = recorder();
        let handle = reader.consume("g", callback).unwrap();
        wait_until(|| store.ids(&stream).is_empty()).await;

        let fresh = store.append(&stream, AppendOptions::default(), &payload(7)).await.unwrap();
        wait_until(|| seen.lock().unwrap().len() == 1).await;
        // many more passes, none of them due for another trim
        tokio::time::sleep(Duration::from_millis(100)).await;
        reader.close();
        handle.join().await.unwrap();

        assert_eq!(store.range_scans(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![fresh]);
    }

    #[tokio::test]
    async fn undrained_errors_are_capped() {
        let store = Arc::new(InMemoryStreamStore::new());
        let ctx = context(&store);
        let config = fast().with_failure_backoff(Duration::from_millis(1)).with_error_backlog(4);
        let reader = GroupReader::new(&ctx, "jobs", config);
        let mut handle = reader
            .consume("g", |_record: GroupRecord<Job>| async { Err::<(), _>(anyhow::anyhow!("always fails")) })
            .unwrap();

        store.append(reader.stream(), AppendOptions::default(), &payload(1)).await.unwrap();
        wait_until(|| handle.dropped_errors() > 0).await;
        reader.close();

        let mut queued = 0;
        while let Some(err) = handle.next_error().await {
            assert!(matches!(err, ReaderError::Callback { .. }));
            queued += 1;
        }
        assert_eq!(queued, 4);
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn undecodable_payloads_are_reported() {
        let store = Arc::new(InMemoryStreamStore::new());
        let ctx = context(&store);
        let reader = GroupReader::new(&ctx, "jobs", fast());
        let stream = reader.stream().to_string();
        let (seen, callback) = recorder();
        let mut handle = reader.consume("g", callback).unwrap();

        let id = store
            .append(&stream, AppendOptions::default(), &[("data".to_string(), "not json".to_string())])
            .await
            .unwrap();

        let err = handle.next_error().await.unwrap();
        assert!(matches!(err, ReaderError::Decode { id: got, .. } if got == id));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(store.pending_ids(&stream, "g"), vec![id]);

        reader.close();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn competing_readers_split_the_stream() {
        let store = Arc::new(InMemoryStreamStore::new());
        let ctx = context(&store);
        let a = GroupReader::new(&ctx, "jobs", fast().with_batch_size(2));
        let b = GroupReader::new(&ctx, "jobs", fast().with_batch_size(2));
        assert_ne!(a.consumer_id(), b.consumer_id());
        let stream = a.stream().to_string();

        let (seen_a, cb_a) = recorder();
        let (seen_b, cb_b) = recorder();
        let ha = a.consume("g", cb_a).unwrap();
        let hb = b.consume("g", cb_b).unwrap();

        let mut ids = Vec::new();
        for n in 0..40 {
            ids.push(store.append(&stream, AppendOptions::default(), &payload(n)).await.unwrap());
            if n % 8 == 0 {
                tokio::task::yield_now().await;
            }
        }

        wait_until(|| seen_a.lock().unwrap().len() + seen_b.lock().unwrap().len() >= 40).await;
        ctx.closing().cancel();
        ha.join().await.unwrap();
        hb.join().await.unwrap();

        let mut all: Vec<RecordId> = seen_a.lock().unwrap().clone();
        let from_b = seen_b.lock().unwrap().clone();
        assert!(all.iter().all(|id| !from_b.contains(id)));
        all.extend(from_b);
        all.sort();
        assert_eq!(all, ids);
    }

    #[tokio::test]
    async fn second_consume_is_rejected() {
        let store = Arc::new(InMemoryStreamStore::new());
        let ctx = context(&store);
        let reader = GroupReader::new(&ctx, "jobs", fast());
        let (_, cb1) = recorder();
        let (_, cb2) = recorder();

        let handle = reader.consume("g", cb1).unwrap();
        assert_eq!(reader.consume("g", cb2).unwrap_err(), ReaderError::AlreadyConsuming);
        assert_eq!(reader.state(), LifecycleState::Running);

        reader.close();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn group_setup_failure_is_fatal() {
        let store = Arc::new(InMemoryStreamStore::new());
        let ctx = context(&store);
        let reader = GroupReader::new(&ctx, "jobs", fast());
        store.fail_next(StoreError::Command("NOPERM".into()));

        let (_, callback) = recorder();
        let mut handle = reader.consume("g", callback).unwrap();
        let reported = handle.next_error().await.unwrap();
        assert!(matches!(reported, ReaderError::Setup { .. }));
        assert_eq!(handle.join().await.unwrap_err(), reported);
        assert_eq!(reader.state(), LifecycleState::Closed);
    }

    #[tokio::test]
    async fn length_counts_records() {
        let store = Arc::new(InMemoryStreamStore::new());
        let ctx = context(&store);
        let reader = GroupReader::new(&ctx, "jobs", fast());
        assert_eq!(reader.length().await.unwrap(), 0);
        for n in 0..3 {
            store.append(reader.stream(), AppendOptions::default(), &payload(n)).await.unwrap();
        }
        assert_eq!(reader.length().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn close_before_consume_is_final() {
        let store = Arc::new(InMemoryStreamStore::new());
        let ctx = context(&store);
        let reader = GroupReader::new(&ctx, "jobs", fast());
        reader.close();
        assert_eq!(reader.state(), LifecycleState::Closed);
        let (_, callback) = recorder();
        assert_eq!(reader.consume("g", callback).unwrap_err(), ReaderError::Closed);
    }
}
