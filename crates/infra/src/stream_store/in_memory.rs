use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use jobstream_core::{Cursor, RecordId, StreamRecord, now_ms};

use super::r#trait::{
    AppendOptions, GroupSelector, GroupStart, IdSpec, RangeBound, StoreConnector, StoreError,
    StreamStore,
};

/// Idle time after which another member's pending entry may be claimed.
pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug)]
struct GroupState {
    last_delivered: RecordId,
    pending: BTreeMap<RecordId, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<RecordId, Vec<(String, String)>>,
    last_id: RecordId,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug)]
struct Shared {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
    claim_idle: Option<Duration>,
    open_connections: AtomicUsize,
    blocked_reads: AtomicUsize,
    range_scans: AtomicUsize,
    injected: Mutex<VecDeque<StoreError>>,
}

/// In-memory stream store.
///
/// Intended for tests/dev. Mirrors the consumer-group semantics of a Redis
/// stream: a pending list per group, `>` delivery, `MINID` trimming, blocking
/// reads woken by appends. Handles created through [`StoreConnector::connect`]
/// share the data but count as separate connections.
#[derive(Debug)]
pub struct InMemoryStreamStore {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl Default for InMemoryStreamStore {
    fn default() -> Self {
        Self::with_claim_idle(Some(DEFAULT_CLAIM_IDLE))
    }
}

impl InMemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` disables claiming entries from other group members.
    pub fn with_claim_idle(claim_idle: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                streams: Mutex::new(HashMap::new()),
                appended: Notify::new(),
                claim_idle,
                open_connections: AtomicUsize::new(1),
                blocked_reads: AtomicUsize::new(0),
                range_scans: AtomicUsize::new(0),
                injected: Mutex::new(VecDeque::new()),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Another connection to the same data.
    pub fn sibling(&self) -> Self {
        self.shared.open_connections.fetch_add(1, Ordering::SeqCst);
        Self {
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Connections opened and not yet quit.
    pub fn open_connections(&self) -> usize {
        self.shared.open_connections.load(Ordering::SeqCst)
    }

    /// Reads currently parked waiting for an append.
    pub fn blocked_reads(&self) -> usize {
        self.shared.blocked_reads.load(Ordering::SeqCst)
    }

    /// Range scans issued so far, on any connection.
    pub fn range_scans(&self) -> usize {
        self.shared.range_scans.load(Ordering::SeqCst)
    }

    /// Make the next command (on any connection) fail with `error`.
    pub fn fail_next(&self, error: StoreError) {
        if let Ok(mut injected) = self.shared.injected.lock() {
            injected.push_back(error);
        }
    }

    pub fn pending_ids(&self, stream: &str, group: &str) -> Vec<RecordId> {
        self.lock()
            .ok()
            .and_then(|streams| {
                streams
                    .get(stream)
                    .and_then(|s| s.groups.get(group))
                    .map(|g| g.pending.keys().copied().collect())
            })
            .unwrap_or_default()
    }

    /// Times the pending entry `id` has been delivered.
    pub fn delivery_count(&self, stream: &str, group: &str, id: RecordId) -> Option<u32> {
        let streams = self.lock().ok()?;
        let entry = streams.get(stream)?.groups.get(group)?.pending.get(&id)?;
        Some(entry.deliveries)
    }

    pub fn ids(&self, stream: &str) -> Vec<RecordId> {
        self.lock()
            .ok()
            .and_then(|streams| streams.get(stream).map(|s| s.entries.keys().copied().collect()))
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, StreamState>>, StoreError> {
        self.shared.streams.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Common entry checks: closed connection, injected failure.
    fn check(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let injected = self
            .shared
            .injected
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .pop_front();
        match injected {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run `poll` until it yields something or the wait expires.
    async fn wait_for<F>(&self, block: Option<Duration>, mut poll: F) -> Result<Vec<StreamRecord>, StoreError>
    where
        F: FnMut(&mut HashMap<String, StreamState>) -> Result<Vec<StreamRecord>, StoreError>,
    {
        let deadline = block.map(|wait| Instant::now() + wait);

        loop {
            let mut notified = pin!(self.shared.appended.notified());
            notified.as_mut().enable();

            let found = {
                let mut streams = self.lock()?;
                poll(&mut streams)?
            };
            let Some(deadline) = deadline else {
                return Ok(found);
            };
            if !found.is_empty() {
                return Ok(found);
            }

            let _parked = ParkedRead::new(&self.shared.blocked_reads);
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}

/// Counts a parked read for as long as it lives (also when the read future
/// is dropped mid-wait).
struct ParkedRead<'a>(&'a AtomicUsize);

impl<'a> ParkedRead<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ParkedRead<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn no_group(stream: &str, group: &str) -> StoreError {
    StoreError::NoSuchKey(format!("NOGROUP no such key '{stream}' or consumer group '{group}'"))
}

#[async_trait::async_trait]
impl StreamStore for InMemoryStreamStore {
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
        mkstream: bool,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut streams = self.lock()?;

        if !streams.contains_key(stream) {
            if !mkstream {
                return Err(StoreError::NoSuchKey(format!("stream '{stream}' does not exist")));
            }
            streams.insert(stream.to_string(), StreamState::default());
        }
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| StoreError::NoSuchKey(stream.to_string()))?;

        if state.groups.contains_key(group) {
            return Err(StoreError::GroupExists(format!(
                "BUSYGROUP consumer group '{group}' already exists"
            )));
        }

        let last_delivered = match start {
            GroupStart::Latest => state.last_id,
            GroupStart::Beginning => RecordId::MIN,
            GroupStart::After(id) => id,
        };
        state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        selector: GroupSelector,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamRecord>, StoreError> {
        self.check()?;
        let count = count.max(1);
        let claim_idle = self.shared.claim_idle;

        match selector {
            // Pending reads answer immediately, like `XREADGROUP ... 0`.
            GroupSelector::Pending => {
                let mut streams = self.lock()?;
                let state = streams.get_mut(stream).ok_or_else(|| no_group(stream, group))?;
                let group_state = state.groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
                let now = Instant::now();

                let mut ids: Vec<RecordId> = group_state
                    .pending
                    .iter()
                    .filter(|(_, e)| e.consumer == consumer)
                    .map(|(id, _)| *id)
                    .take(count)
                    .collect();

                if let Some(idle) = claim_idle.filter(|_| ids.len() < count) {
                    let claimable: Vec<RecordId> = group_state
                        .pending
                        .iter()
                        .filter(|(_, e)| e.consumer != consumer && now.duration_since(e.delivered_at) >= idle)
                        .map(|(id, _)| *id)
                        .take(count - ids.len())
                        .collect();
                    for id in claimable {
                        // Claiming drops entries whose record is gone.
                        if state.entries.contains_key(&id) {
                            ids.push(id);
                        } else {
                            group_state.pending.remove(&id);
                        }
                    }
                    ids.sort();
                }

                let mut records = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(entry) = group_state.pending.get_mut(&id) {
                        entry.consumer = consumer.to_string();
                        entry.delivered_at = now;
                        entry.deliveries += 1;
                    }
                    let fields = state.entries.get(&id).cloned().unwrap_or_default();
                    records.push(StreamRecord::new(id, fields));
                }
                Ok(records)
            }
            GroupSelector::New => {
                self.wait_for(block, |streams| {
                    let state = streams.get_mut(stream).ok_or_else(|| no_group(stream, group))?;
                    let group_state = state.groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

                    let fresh: Vec<StreamRecord> = state
                        .entries
                        .range(group_state.last_delivered.successor()..)
                        .take(count)
                        .map(|(id, fields)| StreamRecord::new(*id, fields.clone()))
                        .collect();

                    let now = Instant::now();
                    for record in &fresh {
                        group_state.last_delivered = record.id;
                        group_state.pending.insert(
                            record.id,
                            PendingEntry {
                                consumer: consumer.to_string(),
                                delivered_at: now,
                                deliveries: 1,
                            },
                        );
                    }
                    Ok(fresh)
                })
                .await
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: RecordId) -> Result<u64, StoreError> {
        self.check()?;
        let mut streams = self.lock()?;
        let removed = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .and_then(|g| g.pending.remove(&id))
            .is_some();
        Ok(u64::from(removed))
    }

    async fn range(
        &self,
        stream: &str,
        start: RangeBound,
        end: RangeBound,
        count: usize,
    ) -> Result<Vec<StreamRecord>, StoreError> {
        self.check()?;
        self.shared.range_scans.fetch_add(1, Ordering::SeqCst);
        let streams = self.lock()?;
        let Some(state) = streams.get(stream) else {
            return Ok(Vec::new());
        };

        let lo = match start {
            RangeBound::Oldest => RecordId::MIN,
            RangeBound::Newest => RecordId::new(u64::MAX, u64::MAX),
            RangeBound::At(id) => id,
        };
        let hi = match end {
            RangeBound::Oldest => RecordId::MIN,
            RangeBound::Newest => RecordId::new(u64::MAX, u64::MAX),
            RangeBound::At(id) => id,
        };
        if lo > hi {
            return Ok(Vec::new());
        }

        Ok(state
            .entries
            .range(lo..=hi)
            .take(count)
            .map(|(id, fields)| StreamRecord::new(*id, fields.clone()))
            .collect())
    }

    async fn last(&self, stream: &str) -> Result<Option<StreamRecord>, StoreError> {
        self.check()?;
        let streams = self.lock()?;
        Ok(streams
            .get(stream)
            .and_then(|state| state.entries.last_key_value())
            .map(|(id, fields)| StreamRecord::new(*id, fields.clone())))
    }

    async fn trim(&self, stream: &str, min_id: RecordId) -> Result<u64, StoreError> {
        self.check()?;
        let mut streams = self.lock()?;
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };

        let kept = state.entries.split_off(&min_id);
        let removed = state.entries.len() as u64;
        state.entries = kept;
        Ok(removed)
    }

    async fn len(&self, stream: &str) -> Result<u64, StoreError> {
        self.check()?;
        let streams = self.lock()?;
        Ok(streams.get(stream).map_or(0, |s| s.entries.len() as u64))
    }

    async fn read(
        &self,
        stream: &str,
        after: Cursor,
        count: Option<usize>,
        block: Option<Duration>,
    ) -> Result<Vec<StreamRecord>, StoreError> {
        self.check()?;

        // `$` is resolved once, when the read is issued.
        let after = match after {
            Cursor::After(id) => id,
            Cursor::Latest => self.lock()?.get(stream).map_or(RecordId::MIN, |s| s.last_id),
        };
        let count = count.unwrap_or(usize::MAX);

        self.wait_for(block, |streams| {
            let Some(state) = streams.get(stream) else {
                return Ok(Vec::new());
            };
            Ok(state
                .entries
                .range(after.successor()..)
                .take(count)
                .map(|(id, fields)| StreamRecord::new(*id, fields.clone()))
                .collect())
        })
        .await
    }

    async fn append(
        &self,
        stream: &str,
        options: AppendOptions,
        fields: &[(String, String)],
    ) -> Result<RecordId, StoreError> {
        self.check()?;
        let id = {
            let mut streams = self.lock()?;
            let state = streams.entry(stream.to_string()).or_default();

            let id = match options.id {
                IdSpec::Auto => {
                    let millis = now_ms().max(state.last_id.timestamp_ms());
                    if millis == state.last_id.timestamp_ms() {
                        state.last_id.successor()
                    } else {
                        RecordId::at_millis(millis)
                    }
                }
                IdSpec::Explicit(id) => {
                    if id <= state.last_id {
                        return Err(StoreError::Command(format!(
                            "ERR the id {id} is equal or smaller than the stream top item {}",
                            state.last_id
                        )));
                    }
                    id
                }
            };

            state.entries.insert(id, fields.to_vec());
            state.last_id = id;

            if let Some(max_len) = options.max_len {
                while state.entries.len() as u64 > max_len {
                    state.entries.pop_first();
                }
            }
            id
        };

        self.shared.appended.notify_waiters();
        Ok(id)
    }

    async fn quit(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StoreConnector for InMemoryStreamStore {
    async fn connect(&self) -> Result<Arc<dyn StreamStore>, StoreError> {
        Ok(Arc::new(self.sibling()))
    }
}

#[async_trait::async_trait]
impl StoreConnector for Arc<InMemoryStreamStore> {
    async fn connect(&self) -> Result<Arc<dyn StreamStore>, StoreError> {
        Ok(Arc::new(self.sibling()))
    }
}
