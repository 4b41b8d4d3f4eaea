//! Event stream listener.
//!
//! One listener owns one dedicated connection and reads a queue's global
//! event stream in order, from a cursor that only moves forward. Every
//! record becomes a [`Notification`] on the listener's [`EventHub`]:
//!
//! - `drained` is published as a bare id on its kind topic
//! - every other event goes to its kind topic, and again to the
//!   `(kind, job id)` entity topic when it names a job
//!
//! Listeners broadcast: two listeners on the same stream each see every
//! event. Use a [`GroupReader`](crate::consumer::GroupReader) for competing
//! consumption.

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobstream_core::{Cursor, LifecycleState};
use jobstream_events::{EventHub, Notification, QueueEvent, Subscription, Topic};

use crate::config::ListenerConfig;
use crate::connection::{LifecycleCell, StreamContext};
use crate::stream_store::{ReconnectingStore, StoreError, StreamStore};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ListenerError {
    #[error("listener is already running")]
    AlreadyRunning,

    #[error("listener is closed")]
    Closed,

    #[error(transparent)]
    Transport(#[from] StoreError),

    #[error("listener task failed: {0}")]
    Task(String),
}

#[derive(Default)]
struct Running {
    task: Option<JoinHandle<Result<(), ListenerError>>>,
    conn: Option<Arc<ReconnectingStore>>,
}

/// Ordered, resumable reader of a queue's event stream.
pub struct EventStreamListener {
    ctx: StreamContext,
    stream: String,
    config: ListenerConfig,
    hub: Arc<EventHub<Notification>>,
    cursor: Arc<Mutex<Cursor>>,
    state: Arc<LifecycleCell>,
    closing: CancellationToken,
    running: Mutex<Running>,
    closed: OnceCell<Result<(), ListenerError>>,
}

impl std::fmt::Debug for EventStreamListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStreamListener")
            .field("stream", &self.stream)
            .field("cursor", &self.cursor())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl EventStreamListener {
    /// Listener on the context's event stream. Starts reading right away
    /// when `config.autorun` is set (requires a tokio runtime).
    pub fn new(ctx: &StreamContext, config: ListenerConfig) -> Result<Self, ListenerError> {
        let listener = Self {
            stream: ctx.keys().events(),
            cursor: Arc::new(Mutex::new(config.initial_cursor())),
            closing: ctx.closing().child_token(),
            ctx: ctx.clone(),
            config,
            hub: Arc::new(EventHub::new()),
            state: Arc::new(LifecycleCell::default()),
            running: Mutex::new(Running::default()),
            closed: OnceCell::new(),
        };
        if listener.config.autorun {
            listener.start()?;
        }
        Ok(listener)
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn hub(&self) -> Arc<EventHub<Notification>> {
        self.hub.clone()
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription<Notification> {
        self.hub.subscribe(topic)
    }

    /// Id of the last record read. Persist it and pass it back as
    /// `last_event_id` to resume exactly where this listener stopped.
    pub fn cursor(&self) -> Cursor {
        *lock(&self.cursor)
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    /// Start the read loop on a dedicated connection.
    ///
    /// Starting a running listener fails (the failure also goes out on the
    /// error topic) and leaves the running loop alone. A listener whose loop
    /// has stopped, through `close` or a fatal error, cannot start again.
    pub fn start(&self) -> Result<(), ListenerError> {
        let mut running = lock(&self.running);

        match self.state.get() {
            LifecycleState::NotStarted if !self.closing.is_cancelled() => {}
            LifecycleState::Running if !self.closing.is_cancelled() => {
                let err = ListenerError::AlreadyRunning;
                warn!(stream = %self.stream, "listener started twice");
                let _ = self.hub.publish_error(err.to_string());
                return Err(err);
            }
            _ => return Err(ListenerError::Closed),
        }

        let conn = self.ctx.dedicated();
        let worker = ListenLoop {
            conn: conn.clone(),
            stream: self.stream.clone(),
            hub: self.hub.clone(),
            cursor: self.cursor.clone(),
            state: self.state.clone(),
            timeout: self.config.blocking_timeout(),
            closing: self.closing.clone(),
        };

        self.state.transition(LifecycleState::Running);
        running.conn = Some(conn);
        running.task = Some(tokio::spawn(worker.run()));
        info!(stream = %self.stream, cursor = %self.cursor(), "listener started");
        Ok(())
    }

    /// Stop the loop and release the connection.
    ///
    /// Only the first call does the work; every call returns its outcome:
    /// the error that ended the loop, or a failure to release the connection.
    pub async fn close(&self) -> Result<(), ListenerError> {
        self.closed
            .get_or_init(|| async {
                self.closing.cancel();
                self.state.transition(LifecycleState::Closing);

                let (task, conn) = {
                    let mut running = lock(&self.running);
                    (running.task.take(), running.conn.take())
                };

                let mut outcome = match task {
                    Some(task) => task.await.unwrap_or_else(|e| Err(ListenerError::Task(e.to_string()))),
                    None => Ok(()),
                };
                if let Some(conn) = conn {
                    let released = conn.quit().await;
                    if let (Err(e), true) = (released, outcome.is_ok()) {
                        outcome = Err(ListenerError::Transport(e));
                    }
                }

                self.state.transition(LifecycleState::Closed);
                debug!(stream = %self.stream, ?outcome, "listener closed");
                outcome
            })
            .await
            .clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

struct ListenLoop {
    conn: Arc<ReconnectingStore>,
    stream: String,
    hub: Arc<EventHub<Notification>>,
    cursor: Arc<Mutex<Cursor>>,
    state: Arc<LifecycleCell>,
    timeout: std::time::Duration,
    closing: CancellationToken,
}

impl ListenLoop {
    async fn run(self) -> Result<(), ListenerError> {
        let outcome = self.listen().await;
        if let Err(err) = &outcome {
            error!(stream = %self.stream, error = %err, "listener stopped");
            self.state.transition(LifecycleState::Closing);
            let _ = self.hub.publish_error(err.to_string());
        }
        outcome
    }

    async fn listen(&self) -> Result<(), ListenerError> {
        self.pin_latest().await?;

        while !self.closing.is_cancelled() {
            let after = *lock(&self.cursor);
            let block = self.timeout.max(std::time::Duration::from_millis(1));
            let read = self.conn.read(&self.stream, after, None, Some(block));
            let records = tokio::select! {
                _ = self.closing.cancelled() => break,
                read = read => read,
            };

            let records = match records {
                Ok(records) => records,
                Err(StoreError::Closed) if self.closing.is_cancelled() => break,
                Err(e) => return Err(e.into()),
            };

            for record in records {
                if !lock(&self.cursor).advance(record.id) {
                    continue;
                }
                match QueueEvent::from_fields(&record.fields) {
                    Ok(event) => {
                        self.hub
                            .dispatch(record.id, event)
                            .map_err(|e| ListenerError::Task(e.to_string()))?;
                    }
                    Err(e) => warn!(stream = %self.stream, id = %record.id, error = %e, "skipping record without an event kind"),
                }
            }
        }
        Ok(())
    }

    /// Resolve a "from now" cursor to the stream's current last id, so
    /// records appended between two reads are not missed.
    async fn pin_latest(&self) -> Result<(), ListenerError> {
        if *lock(&self.cursor) != Cursor::Latest {
            return Ok(());
        }
        let last = self.conn.last(&self.stream).await?;
        let pinned = last.map_or(Cursor::beginning(), |r| Cursor::After(r.id));
        *lock(&self.cursor) = pinned;
        Ok(())
    }
}
