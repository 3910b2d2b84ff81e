//! Session interface: `run`, `stream`, `history`, `shutdown`.
//!
//! Every turn runs as its own task on a shared `TaskTracker`. Turns for the
//! same session key are serialized by a per-key lock; turns for different
//! keys run in parallel. Dropping the `run` future or the reply stream
//! cancels the turn.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::OwnedMutexGuard;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;

use crate::checkpoint;
use crate::config::Config;
use crate::core::agent::{
    AgentEventRx, AgentEventTx, AgentOptions, EventSender, Orchestrator, TurnOutcome,
    create_event_channel, spawn_broadcaster,
};
use crate::core::events::{AgentEvent, ReplyChunk};
use crate::core::reasoner::Reasoner;
use crate::core::turn::{SessionKey, Turn};
use crate::domain::DomainGateway;
use crate::error::AgentError;
use crate::tools::ToolCatalog;

type TurnHandle = JoinHandle<Result<TurnOutcome, AgentError>>;

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// How long `shutdown` waits before cancelling in-flight turns
    /// (`None` waits forever).
    pub shutdown_grace: Option<Duration>,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

/// Title, size and version of a stored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_key: SessionKey,
    pub title: Option<String>,
    pub turns: usize,
    pub version: u64,
    pub saved_at: String,
}

/// Per-key mutual exclusion. Entries are dropped once nobody holds or waits
/// for them.
#[derive(Debug, Default)]
struct SessionLocks {
    map: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    fn map(&self) -> MutexGuard<'_, HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn acquire(self: &Arc<Self>, key: &SessionKey) -> SessionPermit {
        let lock = Arc::clone(self.map().entry(key.clone()).or_default());
        let entry = LockEntry {
            key: key.clone(),
            lock,
            locks: Arc::clone(self),
        };
        let guard = Arc::clone(&entry.lock).lock_owned().await;
        SessionPermit {
            _guard: guard,
            _entry: entry,
        }
    }
}

/// Held for the whole turn. Field order matters: the guard is released
/// before the entry decides whether to prune.
struct SessionPermit {
    _guard: OwnedMutexGuard<()>,
    _entry: LockEntry,
}

struct LockEntry {
    key: SessionKey,
    lock: Arc<tokio::sync::Mutex<()>>,
    locks: Arc<SessionLocks>,
}

impl Drop for LockEntry {
    fn drop(&mut self) {
        let mut map = self.locks.map();
        // Only the map and this entry hold the lock: nobody is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(&self.key);
        }
    }
}

struct Inner {
    orchestrator: Orchestrator,
    locks: Arc<SessionLocks>,
    tracker: TaskTracker,
    root: CancellationToken,
    accepting: RwLock<bool>,
    shutdown_done: tokio::sync::Mutex<bool>,
    options: SessionOptions,
    observers: Mutex<Vec<AgentEventTx>>,
}

/// Entry point for callers (the CLI or a web layer).
///
/// Cheap to clone; clones share the same turns, locks and store.
#[derive(Clone)]
pub struct AgentSession {
    inner: Arc<Inner>,
}

impl AgentSession {
    pub fn new(orchestrator: Orchestrator, options: SessionOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                locks: Arc::new(SessionLocks::default()),
                tracker: TaskTracker::new(),
                root: CancellationToken::new(),
                accepting: RwLock::new(true),
                shutdown_done: tokio::sync::Mutex::new(false),
                options,
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Wires the builtin catalog over `gateway` and the configured store.
    pub fn from_config(
        config: &Config,
        gateway: &Arc<dyn DomainGateway>,
        reasoner: Arc<dyn Reasoner>,
    ) -> Self {
        let orchestrator = Orchestrator::new(
            Arc::new(ToolCatalog::builtins(gateway)),
            reasoner,
            checkpoint::from_config(&config.checkpoint),
            AgentOptions::from_config(config),
        );
        Self::new(orchestrator, SessionOptions::from_config(config))
    }

    pub fn catalog(&self) -> &ToolCatalog {
        self.inner.orchestrator.catalog()
    }

    /// Turns currently running or waiting for their session lock, plus
    /// history reads in progress.
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Receives the events of every later turn until shutdown.
    /// Delivery is best-effort: a subscriber that falls behind misses events
    /// but never slows a turn down.
    pub fn subscribe(&self) -> AgentEventRx {
        let (tx, rx) = create_event_channel();
        self.observers().push(tx);
        rx
    }

    /// Runs one turn and waits for it to be committed.
    pub async fn run(&self, key: &str, message: &str) -> Result<TurnOutcome, AgentError> {
        let (handle, _cancel_on_drop) = self.start_turn(key, message, None)?;
        joined(handle.await)
    }

    /// Runs one turn, yielding reply chunks as they are produced.
    ///
    /// The last item is `ReplyChunk::Completed` or the error that aborted
    /// the turn. The stream cannot be restarted; a new call runs a new turn.
    pub fn stream(&self, key: &str, message: &str) -> ReplyStream {
        let (tx, rx) = create_event_channel();
        match self.start_turn(key, message, Some(tx)) {
            Ok((handle, guard)) => ReplyStream {
                events: Some(rx),
                outcome: Some(handle),
                failed: None,
                _cancel_on_drop: Some(guard),
            },
            Err(err) => ReplyStream {
                events: None,
                outcome: None,
                failed: Some(err),
                _cancel_on_drop: None,
            },
        }
    }

    /// Committed turns for `key`, oldest first. Never mutates state.
    pub async fn history(&self, key: &str) -> Result<Vec<Turn>, AgentError> {
        let key = parse_key(key)?;
        let record = self.load_record(&key).await?;
        Ok(record.map(|r| r.turns).unwrap_or_default())
    }

    pub async fn summary(&self, key: &str) -> Result<Option<SessionSummary>, AgentError> {
        let key = parse_key(key)?;
        let record = self.load_record(&key).await?;
        Ok(record.map(|r| SessionSummary {
            session_key: r.session_key,
            title: r.scratch.title,
            turns: r.turns.len(),
            version: r.version,
            saved_at: r.saved_at,
        }))
    }

    /// Stops accepting turns, drains the in-flight ones, then closes the
    /// checkpoint store.
    ///
    /// In-flight turns get the configured grace period; after that they are
    /// cancelled and awaited. Safe to call repeatedly or concurrently.
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        let mut done = self.inner.shutdown_done.lock().await;
        if *done {
            return Ok(());
        }

        *self
            .inner
            .accepting
            .write()
            .unwrap_or_else(PoisonError::into_inner) = false;
        self.inner.tracker.close();
        tracing::info!(in_flight = self.inner.tracker.len(), "shutting down agent session");

        let drained = match self.inner.options.shutdown_grace {
            Some(grace) => tokio::time::timeout(grace, self.inner.tracker.wait())
                .await
                .is_ok(),
            None => {
                self.inner.tracker.wait().await;
                true
            }
        };
        if !drained {
            tracing::warn!("grace period elapsed; cancelling in-flight turns");
            self.inner.root.cancel();
            self.inner.tracker.wait().await;
        }

        self.observers().clear();
        let closed = self.inner.orchestrator.store().close().await;
        *done = true;
        tracing::info!("agent session shut down");
        closed.map_err(AgentError::from)
    }

    fn start_turn(
        &self,
        raw_key: &str,
        message: &str,
        primary: Option<AgentEventTx>,
    ) -> Result<(TurnHandle, DropGuard), AgentError> {
        let key = parse_key(raw_key)?;

        // Held across the spawn so shutdown cannot slip in between.
        let accepting = self
            .inner
            .accepting
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if !*accepting {
            return Err(AgentError::ShuttingDown);
        }

        let token = self.inner.root.child_token();
        let events = self.event_sink(primary).with_cancel(token.clone());
        let inner = Arc::clone(&self.inner);
        let message = message.to_string();
        let task_token = token.clone();

        let handle = self.inner.tracker.spawn(async move {
            let _permit = tokio::select! {
                biased;
                () = task_token.cancelled() => {
                    events.send_important(AgentEvent::Interrupted).await;
                    return Err(AgentError::Cancelled);
                }
                permit = inner.locks.acquire(&key) => permit,
            };
            inner
                .orchestrator
                .run_turn(&key, &message, &events, &task_token)
                .await
        });
        drop(accepting);

        Ok((handle, token.drop_guard()))
    }

    /// The sender a turn emits into. The primary consumer gets every event;
    /// observers only ever get `try_send` copies through a broadcaster.
    fn event_sink(&self, primary: Option<AgentEventTx>) -> EventSender {
        let observers: Vec<AgentEventTx> = {
            let mut observers = self.observers();
            observers.retain(|tx| !tx.is_closed());
            observers.clone()
        };

        match primary {
            Some(primary) if observers.is_empty() => EventSender::new(primary),
            None if observers.is_empty() => EventSender::new(create_event_channel().0),
            primary => {
                let (tx, rx) = create_event_channel();
                // Detached; exits when the turn drops its sender.
                drop(spawn_broadcaster(rx, primary, observers));
                EventSender::new(tx)
            }
        }
    }

    /// Reads the record for `key` as tracked work, so shutdown waits for it
    /// before closing the store.
    async fn load_record(
        &self,
        key: &SessionKey,
    ) -> Result<Option<checkpoint::CheckpointRecord>, AgentError> {
        let load = {
            let accepting = self
                .inner
                .accepting
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if !*accepting {
                return Err(AgentError::ShuttingDown);
            }
            self.inner
                .tracker
                .track_future(self.inner.orchestrator.store().load(key))
        };
        Ok(load.await?)
    }

    fn observers(&self) -> MutexGuard<'_, Vec<AgentEventTx>> {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_key(raw: &str) -> Result<SessionKey, AgentError> {
    SessionKey::parse(raw).map_err(|reason| AgentError::InvalidSessionKey {
        key: raw.to_string(),
        reason,
    })
}

fn joined(result: Result<Result<TurnOutcome, AgentError>, JoinError>) -> Result<TurnOutcome, AgentError> {
    result.unwrap_or_else(|err| {
        tracing::error!(error = %err, "turn task failed");
        Err(AgentError::Cancelled)
    })
}

/// Reply chunks of one streamed turn.
///
/// Dropping the stream before it ends cancels the turn.
pub struct ReplyStream {
    events: Option<AgentEventRx>,
    outcome: Option<TurnHandle>,
    failed: Option<AgentError>,
    _cancel_on_drop: Option<DropGuard>,
}

impl Stream for ReplyStream {
    type Item = Result<ReplyChunk, AgentError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(err) = this.failed.take() {
            return Poll::Ready(Some(Err(err)));
        }

        if let Some(events) = this.events.as_mut() {
            loop {
                match events.poll_recv(cx) {
                    Poll::Ready(Some(event)) => {
                        // The final chunk comes from the turn's own result.
                        if matches!(*event, AgentEvent::TurnCompleted { .. }) {
                            continue;
                        }
                        if let Some(chunk) = ReplyChunk::from_event(&event) {
                            return Poll::Ready(Some(Ok(chunk)));
                        }
                    }
                    Poll::Ready(None) => {
                        this.events = None;
                        break;
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }
        }

        let Some(handle) = this.outcome.as_mut() else {
            return Poll::Ready(None);
        };
        let result = ready!(Pin::new(handle).poll(cx));
        this.outcome = None;
        Poll::Ready(Some(joined(result).map(|outcome| ReplyChunk::Completed {
            reply: outcome.reply,
            version: outcome.version,
        })))
    }
}
