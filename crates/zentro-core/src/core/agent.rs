//! Agent orchestrator.
//!
//! Drives one turn through `Resolving -> ToolLoop -> Finalizing` and emits
//! `AgentEvent`s via async channels. No direct stdout/stderr writes occur in
//! this module.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::config::Config;
use crate::core::events::{AgentEvent, ErrorKind, ToolOutput};
use crate::core::reasoner::{Proposal, Reasoner, ToolCall, TurnContext};
use crate::core::turn::{PendingTurn, SessionKey, ToolInvocation, Turn};
use crate::error::{AgentError, CheckpointError, ReasonerError};
use crate::tools::{ToolCatalog, ToolContext, ToolDefinition, ToolEffect};

/// Maximum characters of the first message kept as the session title.
const TITLE_MAX_CHARS: usize = 50;

/// Channel-based event sender (async, bounded).
///
/// Events are wrapped in `Arc` for cheap cloning to multiple consumers.
pub type AgentEventTx = mpsc::Sender<Arc<AgentEvent>>;

/// Channel-based event receiver (async, bounded).
pub type AgentEventRx = mpsc::Receiver<Arc<AgentEvent>>;

/// Default channel capacity for event streams.
///
/// Set higher (128) to accommodate best-effort delta sends without blocking.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Creates a bounded event channel with the default capacity.
pub fn create_event_channel() -> (AgentEventTx, AgentEventRx) {
    mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY)
}

/// Event sender wrapper that provides best-effort and reliable send modes.
///
/// Use `send_delta()` for high-volume events (`AssistantDelta`) that can be
/// dropped if the consumer is slow. Use `send_important()` for events that
/// must be delivered (tool lifecycle, completion, errors, interruption).
#[derive(Clone)]
pub struct EventSender {
    tx: AgentEventTx,
    cancel: Option<CancellationToken>,
}

impl EventSender {
    pub fn new(tx: AgentEventTx) -> Self {
        Self { tx, cancel: None }
    }

    /// Stops `send_important` from waiting on a full channel once `cancel`
    /// fires; the event is then offered best-effort.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Best-effort send: never awaits, drops if channel is full.
    pub fn send_delta(&self, ev: AgentEvent) {
        let _ = self.tx.try_send(Arc::new(ev));
    }

    /// Reliable send: awaits delivery. A closed channel is ignored.
    pub async fn send_important(&self, ev: AgentEvent) {
        let ev = Arc::new(ev);
        let Some(cancel) = &self.cancel else {
            let _ = self.tx.send(ev).await;
            return;
        };
        tokio::select! {
            biased;
            _ = self.tx.send(Arc::clone(&ev)) => {}
            () = cancel.cancelled() => {
                let _ = self.tx.try_send(ev);
            }
        }
    }
}

/// Offers `event` to every subscriber without waiting; full channels miss
/// it, closed ones are removed.
fn offer(subscribers: &mut Vec<AgentEventTx>, event: &Arc<AgentEvent>) {
    subscribers.retain(|tx| match tx.try_send(Arc::clone(event)) {
        Ok(()) | Err(TrySendError::Full(_)) => true,
        Err(TrySendError::Closed(_)) => false,
    });
}

/// Spawns a broadcast task that distributes events to multiple consumers.
///
/// `primary` (the turn's own caller) receives every event in order: the
/// task waits for it when its channel is full. `subscribers` get
/// best-effort copies via `try_send`, so a slow subscriber never holds up
/// the turn. The task exits when the source channel closes.
pub fn spawn_broadcaster(
    mut rx: AgentEventRx,
    mut primary: Option<AgentEventTx>,
    mut subscribers: Vec<AgentEventTx>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            offer(&mut subscribers, &event);
            if let Some(tx) = &primary
                && tx.send(Arc::clone(&event)).await.is_err()
            {
                primary = None;
            }
        }
    })
}

/// Options for agent execution.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Tool-proposing rounds allowed per turn.
    pub max_tool_iterations: usize,
    pub tool_timeout: Option<Duration>,
    pub pure_tool_retries: u32,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl AgentOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_tool_iterations: config.max_tool_iterations,
            tool_timeout: config.tool_timeout(),
            pure_tool_retries: config.pure_tool_retries,
        }
    }

    #[must_use]
    pub fn with_max_tool_iterations(mut self, limit: usize) -> Self {
        self.max_tool_iterations = limit;
        self
    }
}

/// Result of a committed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub reply: String,
    /// Checkpoint version the turn was saved at.
    pub version: u64,
    pub turn: Turn,
}

/// Resolves state, runs the tool loop and commits the turn.
///
/// Holds no per-session state of its own; callers must not run two turns for
/// the same key at once (the session interface serializes them).
pub struct Orchestrator {
    catalog: Arc<ToolCatalog>,
    reasoner: Arc<dyn Reasoner>,
    store: Arc<dyn CheckpointStore>,
    options: AgentOptions,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<ToolCatalog>,
        reasoner: Arc<dyn Reasoner>,
        store: Arc<dyn CheckpointStore>,
        options: AgentOptions,
    ) -> Self {
        Self {
            catalog,
            reasoner,
            store,
            options,
        }
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// Runs one turn for `key`.
    ///
    /// On any error, including cancellation, nothing is saved and the
    /// session's latest version is unchanged. Once the final save has
    /// started it runs to completion regardless of `cancel`.
    pub async fn run_turn(
        &self,
        key: &SessionKey,
        message: &str,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let span = tracing::info_span!("turn", session = %key);
        let events = events.clone().with_cancel(cancel.clone());
        self.drive(key, message, &events, cancel).instrument(span).await
    }

    async fn drive(
        &self,
        key: &SessionKey,
        message: &str,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        // Resolving
        let prior = match self.resolve(key, cancel).await {
            Ok(Some(prior)) => prior,
            Ok(None) => return interrupted(events).await,
            Err(err) => return Err(persistence_failure(events, err).await),
        };
        tracing::info!(version = prior.version, turns = prior.turns.len(), "resolved session");
        events
            .send_important(AgentEvent::TurnStarted {
                session_key: key.to_string(),
            })
            .await;

        let tool_ctx = ToolContext::new(key.user_id().or(prior.scratch.user_id))
            .with_timeout(self.options.tool_timeout)
            .with_pure_retries(self.options.pure_tool_retries);
        let mut pending = PendingTurn::new(message);

        // ToolLoop
        let Some(reply) = self
            .tool_loop(key, &prior, &mut pending, &tool_ctx, events, cancel)
            .await?
        else {
            return interrupted(events).await;
        };

        // Finalizing
        self.finalize(prior, pending, reply, tool_ctx, events, cancel)
            .await
    }

    /// Loads prior state. `Ok(None)` means the turn was cancelled first.
    async fn resolve(
        &self,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(None),
            loaded = self.store.load(key) => {
                Ok(Some(loaded?.unwrap_or_else(|| CheckpointRecord::empty(key))))
            }
        }
    }

    /// Returns the final reply, or `None` if the turn was cancelled.
    async fn tool_loop(
        &self,
        key: &SessionKey,
        prior: &CheckpointRecord,
        pending: &mut PendingTurn,
        tool_ctx: &ToolContext,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, AgentError> {
        let definitions: Vec<ToolDefinition> = self.catalog.definitions();
        let limit = self.options.max_tool_iterations;
        let mut iteration = 0;

        loop {
            let ctx = TurnContext {
                session_key: key,
                history: &prior.turns,
                message: &pending.request.content,
                invocations: &pending.tool_invocations,
                tools: &definitions,
                iteration,
            };
            let proposal = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(None),
                proposal = self.reasoner.propose(&ctx, events) => proposal,
            };

            let calls = match proposal {
                Ok(Proposal::FinalReply(reply)) => return Ok(Some(reply)),
                Ok(Proposal::ToolCalls(calls)) if calls.is_empty() => {
                    return Ok(Some(String::new()));
                }
                Ok(Proposal::ToolCalls(calls)) => calls,
                Err(err) => return Err(reasoner_failure(events, err).await),
            };

            if iteration >= limit {
                tracing::warn!(limit, "tool loop did not converge");
                let err = AgentError::Convergence { limit };
                events
                    .send_important(AgentEvent::Error {
                        kind: ErrorKind::Convergence,
                        message: err.to_string(),
                        details: Some(format!("{} more tool calls were proposed", calls.len())),
                    })
                    .await;
                return Err(err);
            }
            iteration += 1;

            tracing::info!(iteration, calls = calls.len(), "executing tool calls");
            let invocations = self.execute_tools(calls, tool_ctx, events, cancel).await;
            pending.tool_invocations.extend(invocations);
            if cancel.is_cancelled() {
                return Ok(None);
            }
        }
    }

    async fn finalize(
        &self,
        prior: CheckpointRecord,
        pending: PendingTurn,
        reply: String,
        tool_ctx: ToolContext,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let mut scratch = prior.scratch.clone();
        if scratch.title.is_none() {
            scratch.title = Some(session_title(&pending.request.content));
        }
        scratch.user_id = tool_ctx.user_id;

        let turn = pending.complete(reply);
        let record = prior.successor(turn.clone(), scratch);

        // Last point where cancellation discards the turn.
        if cancel.is_cancelled() {
            return interrupted(events).await;
        }
        if let Err(err) = self.store.save(&record.session_key, &record).await {
            return Err(persistence_failure(events, err).await);
        }
        tracing::info!(version = record.version, "turn committed");

        events
            .send_important(AgentEvent::AssistantCompleted {
                text: turn.reply.content.clone(),
            })
            .await;
        events
            .send_important(AgentEvent::TurnCompleted {
                reply: turn.reply.content.clone(),
                version: record.version,
            })
            .await;

        Ok(TurnOutcome {
            reply: turn.reply.content.clone(),
            version: record.version,
            turn,
        })
    }

    /// Runs one round of tool calls. Results come back in proposal order.
    ///
    /// All-pure rounds run concurrently and are abandoned on cancellation.
    /// Rounds containing an impure call run one at a time; an impure call in
    /// flight is allowed to finish, and the calls after it are skipped.
    async fn execute_tools(
        &self,
        calls: Vec<ToolCall>,
        ctx: &ToolContext,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Vec<ToolInvocation> {
        let effects: Vec<ToolEffect> = calls.iter().map(|c| self.effect_of(&c.name)).collect();
        if effects.iter().all(|e| *e == ToolEffect::Pure) {
            self.execute_concurrent(calls, effects, ctx, events, cancel)
                .await
        } else {
            self.execute_sequential(calls, effects, ctx, events, cancel)
                .await
        }
    }

    /// Unknown tools fail before doing anything, so they count as pure.
    fn effect_of(&self, name: &str) -> ToolEffect {
        self.catalog
            .get(name)
            .map_or(ToolEffect::Pure, |d| d.effect)
    }

    async fn execute_concurrent(
        &self,
        calls: Vec<ToolCall>,
        effects: Vec<ToolEffect>,
        ctx: &ToolContext,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Vec<ToolInvocation> {
        let mut join_set: JoinSet<(usize, ToolOutput)> = JoinSet::new();
        let mut outputs: Vec<Option<ToolOutput>> = vec![None; calls.len()];

        // Emit ToolStarted in proposal order, then spawn.
        for (i, call) in calls.iter().enumerate() {
            events
                .send_important(AgentEvent::ToolStarted {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                })
                .await;

            let catalog = Arc::clone(&self.catalog);
            let call = call.clone();
            let ctx = ctx.clone();
            join_set.spawn(async move {
                let result = catalog.invoke(&call.name, &call.input, &ctx).await;
                (i, ToolOutput::from(result))
            });
        }

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    join_set.abort_all();
                    while let Some(done) = join_set.try_join_next() {
                        if let Ok((i, output)) = done {
                            events
                                .send_important(AgentEvent::ToolCompleted {
                                    id: calls[i].id.clone(),
                                    name: calls[i].name.clone(),
                                    result: output.clone(),
                                })
                                .await;
                            outputs[i] = Some(output);
                        }
                    }
                    break;
                }
                next = join_set.join_next() => match next {
                    Some(Ok((i, output))) => {
                        events
                            .send_important(AgentEvent::ToolCompleted {
                                id: calls[i].id.clone(),
                                name: calls[i].name.clone(),
                                result: output.clone(),
                            })
                            .await;
                        outputs[i] = Some(output);
                    }
                    Some(Err(err)) => {
                        tracing::error!(error = %err, "tool task failed");
                    }
                    None => break,
                },
            }
        }

        let mut invocations = Vec::with_capacity(calls.len());
        for ((call, effect), output) in calls.into_iter().zip(effects).zip(outputs) {
            let output = match output {
                Some(output) => output,
                None => {
                    let output = ToolOutput::canceled("Interrupted before the tool finished");
                    events
                        .send_important(AgentEvent::ToolCompleted {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            result: output.clone(),
                        })
                        .await;
                    output
                }
            };
            invocations.push(recorded(call, output, effect));
        }
        invocations
    }

    async fn execute_sequential(
        &self,
        calls: Vec<ToolCall>,
        effects: Vec<ToolEffect>,
        ctx: &ToolContext,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Vec<ToolInvocation> {
        let mut invocations = Vec::with_capacity(calls.len());
        for (call, effect) in calls.into_iter().zip(effects) {
            let output = if cancel.is_cancelled() {
                ToolOutput::canceled("Skipped: turn was cancelled")
            } else {
                events
                    .send_important(AgentEvent::ToolStarted {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.input.clone(),
                    })
                    .await;
                ToolOutput::from(self.catalog.invoke(&call.name, &call.input, ctx).await)
            };
            events
                .send_important(AgentEvent::ToolCompleted {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    result: output.clone(),
                })
                .await;
            invocations.push(recorded(call, output, effect));
        }
        invocations
    }
}

fn recorded(call: ToolCall, output: ToolOutput, effect: ToolEffect) -> ToolInvocation {
    if let Some((code, message, _)) = output.error_info() {
        tracing::warn!(tool = %call.name, code, message, "tool call failed");
    } else {
        tracing::debug!(tool = %call.name, "tool call finished");
    }
    ToolInvocation::new(call.id, call.name, call.input, output, effect)
}

async fn interrupted<T>(events: &EventSender) -> Result<T, AgentError> {
    tracing::info!("turn cancelled; nothing saved");
    events.send_important(AgentEvent::Interrupted).await;
    Err(AgentError::Cancelled)
}

async fn persistence_failure(events: &EventSender, err: CheckpointError) -> AgentError {
    tracing::error!(error = %err, "checkpoint store failed");
    events
        .send_important(AgentEvent::Error {
            kind: ErrorKind::Persistence,
            message: "session state was not saved".to_string(),
            details: Some(err.to_string()),
        })
        .await;
    AgentError::Persistence(err)
}

async fn reasoner_failure(events: &EventSender, err: ReasonerError) -> AgentError {
    tracing::error!(error = %err, "reasoner failed");
    events
        .send_important(AgentEvent::Error {
            kind: ErrorKind::Reasoner,
            message: err.to_string(),
            details: None,
        })
        .await;
    AgentError::Reasoner(err)
}

/// Session title from the first message: at most 50 characters, with `...`
/// appended when cut.
pub fn session_title(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        return trimmed.to_string();
    }
    let truncated: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::core::reasoner::ScriptedReasoner;
    use crate::domain::{DomainGateway, InMemoryGateway};

    struct Harness {
        gateway: Arc<InMemoryGateway>,
        store: Arc<MemoryCheckpointStore>,
        orchestrator: Orchestrator,
    }

    fn harness(reasoner: ScriptedReasoner, options: AgentOptions) -> Harness {
        let gateway = Arc::new(InMemoryGateway::demo());
        let dyn_gateway: Arc<dyn DomainGateway> = Arc::clone(&gateway) as Arc<dyn DomainGateway>;
        let store = Arc::new(MemoryCheckpointStore::new());
        let orchestrator = Orchestrator::new(
            Arc::new(ToolCatalog::builtins(&dyn_gateway)),
            Arc::new(reasoner),
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
            options,
        );
        Harness {
            gateway,
            store,
            orchestrator,
        }
    }

    fn sender() -> (EventSender, AgentEventRx) {
        let (tx, rx) = create_event_channel();
        (EventSender::new(tx), rx)
    }

    fn drain(rx: &mut AgentEventRx) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push((*ev).clone());
        }
        out
    }

    fn tool_calls(calls: &[(&str, serde_json::Value)]) -> Proposal {
        Proposal::ToolCalls(
            calls
                .iter()
                .enumerate()
                .map(|(i, (name, input))| ToolCall::new(format!("call_{i}"), *name, input.clone()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_task_create_is_recorded_and_saved() {
        let h = harness(
            ScriptedReasoner::new(vec![
                tool_calls(&[("task_create", json!({"title": "Fix bug", "project_id": 7}))]),
                Proposal::FinalReply("Created task 42.".to_string()),
            ]),
            AgentOptions::default(),
        );
        let key = SessionKey::parse("1:abc").unwrap();
        let (events, mut rx) = sender();

        let outcome = h
            .orchestrator
            .run_turn(&key, "Create a bug task", &events, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.version, 1);
        assert_eq!(outcome.reply, "Created task 42.");
        let inv = &outcome.turn.tool_invocations[0];
        assert!(inv.side_effect);
        assert_eq!(inv.output, ToolOutput::success(json!({"task_id": 42})));
        assert_eq!(h.gateway.get_task(42).await.unwrap().reporter_id, Some(1));

        let saved = h.store.load(&key).await.unwrap().unwrap();
        assert_eq!(saved.turns, vec![outcome.turn]);
        assert_eq!(saved.scratch.title.as_deref(), Some("Create a bug task"));

        let kinds: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| !matches!(e, AgentEvent::AssistantDelta { .. }))
            .collect();
        assert!(matches!(kinds.first(), Some(AgentEvent::TurnStarted { .. })));
        assert!(matches!(kinds.last(), Some(AgentEvent::TurnCompleted { version: 1, .. })));
    }

    #[tokio::test]
    async fn test_tool_errors_are_fed_back() {
        let h = harness(
            ScriptedReasoner::new(vec![tool_calls(&[("task_get", json!({"task_id": 999}))])]),
            AgentOptions::default(),
        );
        let key = SessionKey::default();
        let (events, _rx) = sender();

        let outcome = h
            .orchestrator
            .run_turn(&key, "look up 999", &events, &CancellationToken::new())
            .await
            .unwrap();
        let inv = &outcome.turn.tool_invocations[0];
        assert!(!inv.succeeded());
        assert!(!inv.side_effect);
        assert_eq!(inv.output.error_info().unwrap().0, "not_found");
        assert_eq!(outcome.reply, "re: look up 999");
    }

    #[tokio::test]
    async fn test_convergence_limit_saves_nothing() {
        let h = harness(
            ScriptedReasoner::repeating(tool_calls(&[("project_list", json!({}))])),
            AgentOptions::default(),
        );
        let key = SessionKey::default();
        let (events, mut rx) = sender();

        let err = h
            .orchestrator
            .run_turn(&key, "loop forever", &events, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Convergence { limit: 10 }));
        assert_eq!(h.store.save_count(), 0);
        assert!(h.store.load(&key).await.unwrap().is_none());
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            AgentEvent::Error {
                kind: ErrorKind::Convergence,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_results_keep_proposal_order() {
        let h = harness(
            ScriptedReasoner::new(vec![tool_calls(&[
                ("task_get", json!({"task_id": 41})),
                ("task_get", json!({"task_id": 40})),
                ("sprint_get_active", json!({"project_id": 7})),
            ])]),
            AgentOptions::default(),
        );
        let (events, _rx) = sender();
        let outcome = h
            .orchestrator
            .run_turn(&SessionKey::default(), "three reads", &events, &CancellationToken::new())
            .await
            .unwrap();

        let ids: Vec<_> = outcome
            .turn
            .tool_invocations
            .iter()
            .map(|inv| inv.output.data().and_then(|d| d.get("id")).cloned())
            .collect();
        assert_eq!(ids[0], Some(json!(41)));
        assert_eq!(ids[1], Some(json!(40)));
        assert_eq!(outcome.turn.tool_invocations[2].name, "sprint_get_active");
    }

    #[tokio::test]
    async fn test_save_failure_is_reported() {
        let h = harness(ScriptedReasoner::default(), AgentOptions::default());
        h.store.fail_saves(true);
        let (events, mut rx) = sender();

        let err = h
            .orchestrator
            .run_turn(&SessionKey::default(), "hi", &events, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Persistence(_)));
        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(e, AgentEvent::TurnCompleted { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_turn_is_discarded() {
        let h = harness(
            ScriptedReasoner::default().with_delay(Duration::from_secs(30)),
            AgentOptions::default(),
        );
        let (events, mut rx) = sender();
        let cancel = CancellationToken::new();
        let key = SessionKey::default();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let result = timeout(
            Duration::from_secs(5),
            h.orchestrator.run_turn(&key, "slow", &events, &cancel),
        )
        .await
        .expect("cancellation should end the turn");

        assert!(matches!(result, Err(AgentError::Cancelled)));
        assert!(h.store.load(&key).await.unwrap().is_none());
        assert!(drain(&mut rx).iter().any(|e| matches!(e, AgentEvent::Interrupted)));
    }

    #[tokio::test]
    async fn test_title_kept_across_turns() {
        let h = harness(ScriptedReasoner::default(), AgentOptions::default());
        let key = SessionKey::default();
        let (events, _rx) = sender();
        let cancel = CancellationToken::new();
        h.orchestrator.run_turn(&key, "first", &events, &cancel).await.unwrap();
        let second = h.orchestrator.run_turn(&key, "second", &events, &cancel).await.unwrap();

        assert_eq!(second.version, 2);
        let saved = h.store.load(&key).await.unwrap().unwrap();
        assert_eq!(saved.scratch.title.as_deref(), Some("first"));
        assert_eq!(saved.turns.len(), 2);
    }

    #[test]
    fn test_session_title_truncates() {
        assert_eq!(session_title("  short  "), "short");
        let long = "x".repeat(60);
        assert_eq!(session_title(&long), format!("{}...", "x".repeat(50)));
    }

    #[tokio::test]
    async fn test_event_sender_send_delta_is_best_effort() {
        let (tx, _rx) = mpsc::channel(1);
        let sender = EventSender::new(tx);
        for i in 0..100 {
            sender.send_delta(AgentEvent::AssistantDelta {
                text: format!("chunk {i}"),
            });
        }
    }

    #[tokio::test]
    async fn test_broadcaster_removes_closed_channels() {
        let (source_tx, source_rx) = create_event_channel();
        let (out1_tx, mut out1_rx) = create_event_channel();
        let (out2_tx, out2_rx) = create_event_channel();
        drop(out2_rx);

        let _broadcaster = spawn_broadcaster(source_rx, None, vec![out1_tx, out2_tx]);
        source_tx
            .send(Arc::new(AgentEvent::Interrupted))
            .await
            .unwrap();

        let ev = timeout(Duration::from_secs(1), out1_rx.recv())
            .await
            .expect("timeout")
            .expect("should receive event");
        assert!(matches!(&*ev, AgentEvent::Interrupted));
    }

    #[tokio::test]
    async fn test_broadcaster_delivers_everything_to_primary() {
        let (source_tx, source_rx) = create_event_channel();
        let (primary_tx, mut primary_rx) = mpsc::channel(1);
        let (idle_tx, _idle_rx) = mpsc::channel(1);

        let _broadcaster = spawn_broadcaster(source_rx, Some(primary_tx), vec![idle_tx]);
        let producer = tokio::spawn(async move {
            for i in 0..50 {
                source_tx
                    .send(Arc::new(AgentEvent::AssistantDelta {
                        text: i.to_string(),
                    }))
                    .await
                    .unwrap();
            }
        });

        let mut received = Vec::new();
        while let Ok(Some(ev)) = timeout(Duration::from_secs(1), primary_rx.recv()).await {
            if let AgentEvent::AssistantDelta { text } = &*ev {
                received.push(text.clone());
            }
        }
        producer.await.unwrap();
        let expected: Vec<String> = (0..50).map(|i: i32| i.to_string()).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_send_important_gives_up_when_cancelled() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let sender = EventSender::new(tx).with_cancel(cancel.clone());
        sender.send_important(AgentEvent::Interrupted).await;

        // The channel is now full and nobody reads it.
        let blocked = tokio::spawn({
            let sender = sender.clone();
            async move { sender.send_important(AgentEvent::Interrupted).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        cancel.cancel();
        timeout(Duration::from_secs(1), blocked)
            .await
            .expect("send should stop waiting")
            .unwrap();
    }
}
