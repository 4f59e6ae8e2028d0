//! Conversation controller: attaches to a generation job and keeps the
//! transcript in step with it across reconnects, reloads and aborts.

use crate::abort::{AbortController, AbortOutcome, AbortState};
use crate::assembler::{BlockChange, TurnAssembler};
use crate::coordinator::{
    DisconnectCause, GenerationCounter, LinkState, RetryDecision, RetryPolicy, StreamCoordinator,
};
use crate::error::{Error, Result};
use crate::events::SessionEvent;
use crate::handle::SessionHandle;
use crate::health::{HealthConfig, HealthMonitor, Visibility};
use crate::reconcile::{self, Strategy};
use crate::session::{Phase, StreamSessionState};
use crate::store::{KeyValueStore, ResumeStorage};
use crate::transcript::{Block, BlockKind, Transcript};
use futures::StreamExt;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;
use tether_protocol::{AbortRequest, Backend, Event, Record, TerminalStatus, Usage, decode_records};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub retry: RetryPolicy,
    pub health: HealthConfig,
    /// How long a stream lease stays valid without renewal
    pub lease_ttl: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            health: HealthConfig::default(),
            lease_ttl: Duration::from_secs(60),
        }
    }
}

/// How a streaming run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Aborted(AbortOutcome),
    /// A newer connection (or navigation away) took over
    Superseded,
    /// No job was running
    Idle,
}

enum ConnectionEnd {
    Disconnected(DisconnectCause),
    Aborted(AbortOutcome),
    Superseded,
}

enum Flow {
    Continue,
    Disconnect(DisconnectCause),
    /// Another client took over the stream lease
    Displaced,
}

/// Drives one conversation's stream
pub struct ConversationController {
    backend: Arc<dyn Backend>,
    storage: ResumeStorage,
    transcript: Transcript,
    assembler: TurnAssembler,
    state: StreamSessionState,
    coordinator: StreamCoordinator,
    health: HealthMonitor,
    abort: AbortController,
    totals: Usage,
    handle: SessionHandle,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl ConversationController {
    pub fn new(
        conversation_id: impl Into<String>,
        backend: Arc<dyn Backend>,
        store: Arc<dyn KeyValueStore>,
        config: ControllerConfig,
    ) -> Self {
        let generation = GenerationCounter::new();
        let (event_tx, _) = broadcast::channel(256);
        Self {
            backend,
            storage: ResumeStorage::new(store, config.lease_ttl),
            transcript: Transcript::new(),
            assembler: TurnAssembler::new(),
            state: StreamSessionState::new(conversation_id),
            coordinator: StreamCoordinator::new(config.retry, generation.clone()),
            health: HealthMonitor::new(config.health, Instant::now()),
            abort: AbortController::new(),
            totals: Usage::default(),
            handle: SessionHandle::new(generation),
            event_tx,
        }
    }

    /// Seed the transcript with blocks loaded from conversation history
    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.totals = Transcript::usage_of(transcript.blocks());
        self.transcript = transcript;
        self
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Get a cloneable handle for abort, visibility and supersede
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Resume storage bound to this controller's lease owner
    pub fn storage(&self) -> &ResumeStorage {
        &self.storage
    }

    pub fn conversation_id(&self) -> &str {
        &self.state.conversation_id
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Running usage totals across committed turns
    pub fn totals(&self) -> Usage {
        self.totals
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn session_state(&self) -> &StreamSessionState {
        &self.state
    }

    pub fn link_state(&self) -> LinkState {
        self.coordinator.state()
    }

    /// Whether local state can no longer be trusted without a status probe
    pub fn needs_reconcile(&self) -> bool {
        self.handle.reprobe.lock().needs_probe(
            self.health.is_healthy(),
            self.coordinator.state() == LinkState::Connected,
        )
    }

    /// Append the user's prompt and stream the job it started from the beginning.
    pub async fn submit(&mut self, prompt: impl Into<String>) -> Result<Outcome> {
        self.storage.claim(&self.state.conversation_id)?;
        let position = self.transcript.push(Block::live(BlockKind::User {
            text: prompt.into(),
        }));
        self.emit_block(BlockChange::Appended(position));
        self.assembler.begin_turn();
        self.state.rewind();
        self.stream_from(0).await
    }

    /// Rejoin whatever the backend is doing for this conversation.
    pub async fn resume(&mut self) -> Result<Outcome> {
        let status = self.backend.status(&self.state.conversation_id).await?;
        let strategy = reconcile::classify(&status, &self.transcript);
        tracing::info!(
            conversation = %self.state.conversation_id,
            ?strategy,
            event_count = status.event_count,
            "Reconciling"
        );
        self.handle.reprobe.lock().clear();
        self.emit(SessionEvent::Reconciled { strategy });

        match strategy {
            Strategy::NoActiveJob => {
                self.storage.clear(&self.state.conversation_id)?;
                self.update_phase(Phase::Idle);
                Ok(Outcome::Idle)
            }
            Strategy::FullReplay => {
                self.storage.claim(&self.state.conversation_id)?;
                let stripped = reconcile::prepare_full_replay(
                    &mut self.transcript,
                    &mut self.assembler,
                    &mut self.totals,
                );
                if !stripped.blocks.is_empty() {
                    self.emit(SessionEvent::TranscriptRewritten {
                        len: self.transcript.len(),
                    });
                }
                self.state.rewind();
                self.storage.save_index(&self.state.conversation_id, 0)?;
                self.stream_from(0).await
            }
            Strategy::Resume => {
                self.storage.claim(&self.state.conversation_id)?;
                if !self.restore_from_storage()? {
                    // Nothing saved means the last turn we saw has finished
                    self.assembler.begin_turn();
                }
                self.stream_from(self.state.next_event_index).await
            }
        }
    }

    /// Returns whether an assembler snapshot was restored
    fn restore_from_storage(&mut self) -> Result<bool> {
        let id = &self.state.conversation_id;
        if let Some(index) = self.storage.load_index(id)? {
            self.state.next_event_index = self.state.next_event_index.max(index);
        }
        match self.storage.load_snapshot(id)? {
            Some(snapshot) => {
                self.assembler = TurnAssembler::restore(snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn stream_from(&mut self, mut from_index: u64) -> Result<Outcome> {
        self.abort.reset();
        self.coordinator.reset_budgets();
        self.handle.set_streaming(true);
        self.update_phase(self.assembler.phase());

        let mut generation = self.coordinator.generation();
        let result = loop {
            if !self.coordinator.is_current(generation) {
                break Ok(Outcome::Superseded);
            }
            generation = self.coordinator.begin(&self.state.conversation_id, from_index);
            self.state.generation = generation;

            let cause = match self.run_connection(generation, from_index).await {
                ConnectionEnd::Disconnected(cause) => cause,
                ConnectionEnd::Aborted(outcome) => break Ok(Outcome::Aborted(outcome)),
                ConnectionEnd::Superseded => break Ok(Outcome::Superseded),
            };

            let label = cause.label();
            if matches!(cause, DisconnectCause::Resync) {
                if let Err(e) = self.restore_from_storage() {
                    tracing::warn!("Could not restore resume snapshot: {}", e);
                }
            }
            match self
                .coordinator
                .on_disconnect(cause, self.state.next_event_index)
            {
                RetryDecision::Reconnect {
                    from_index: next,
                    delay,
                    attempt,
                } => {
                    self.emit(SessionEvent::Reconnecting {
                        cause: label.to_string(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    });
                    if let Some(outcome) = self.backoff(delay).await {
                        break Ok(outcome);
                    }
                    from_index = next;
                }
                RetryDecision::Finish => break Ok(Outcome::Completed),
                RetryDecision::Fail(e) => break Err(e),
            }
        };

        self.finish(&result);
        result
    }

    /// Wait out a retry delay while staying responsive to abort and supersede
    async fn backoff(&mut self, delay: Duration) -> Option<Outcome> {
        let deadline = Instant::now() + delay;
        let generation = self.coordinator.generation();
        let wake = self.handle.wake.clone();

        loop {
            self.sync_visibility();
            if self.handle.take_abort_request()
                && self.abort.request(&self.assembler) == AbortState::Aborting
            {
                return Some(Outcome::Aborted(self.execute_abort().await));
            }
            if !self.coordinator.is_current(generation) {
                return Some(Outcome::Superseded);
            }
            if delay.is_zero() {
                return None;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return None,
                _ = wake.notified() => {}
            }
        }
    }

    async fn run_connection(&mut self, generation: u64, from_index: u64) -> ConnectionEnd {
        let conversation_id = self.state.conversation_id.clone();
        let cancel = self.handle.fresh_cancel_token();
        let backend = self.backend.clone();
        let wake = self.handle.wake.clone();

        let opened = tokio::select! {
            result = backend.open_stream(&conversation_id, from_index) => result,
            _ = cancel.cancelled() => return ConnectionEnd::Superseded,
        };
        if !self.coordinator.is_current(generation) {
            return ConnectionEnd::Superseded;
        }
        let bytes = match opened {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!("Failed to open stream: {}", e);
                return ConnectionEnd::Disconnected(DisconnectCause::from_open_error(e));
            }
        };

        // Any chunk counts as traffic, including ones that hold no records
        let traffic = Arc::new(AtomicU64::new(0));
        let counter = traffic.clone();
        let bytes = bytes.inspect(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        let mut records = Box::pin(decode_records(bytes));
        let mut seen_traffic = 0;

        let was_healthy = self.health.is_healthy();
        self.health.reset(Instant::now());
        if !was_healthy {
            self.emit(SessionEvent::HealthChanged { healthy: true });
        }
        let poll = self.health.config().poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + poll, poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return ConnectionEnd::Superseded,
                _ = wake.notified() => {
                    if let Some(end) = self.on_commands().await {
                        return end;
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let count = traffic.load(Ordering::Relaxed);
                    if count != seen_traffic {
                        seen_traffic = count;
                        self.coordinator.mark_connected(generation);
                        self.touch_health(now);
                    }
                    if self.health.check(now) {
                        self.emit(SessionEvent::HealthChanged { healthy: false });
                        return ConnectionEnd::Disconnected(DisconnectCause::Stalled);
                    }
                }
                item = records.next() => match item {
                    None => {
                        let cause = if self.assembler.turn_complete() {
                            DisconnectCause::Terminal(TerminalStatus::Completed)
                        } else {
                            DisconnectCause::UnexpectedEnd
                        };
                        return ConnectionEnd::Disconnected(cause);
                    }
                    Some(Err(e)) => {
                        return ConnectionEnd::Disconnected(DisconnectCause::Transport(e.to_string()));
                    }
                    Some(Ok(record)) => {
                        if !self.coordinator.is_current(generation) {
                            return ConnectionEnd::Superseded;
                        }
                        self.coordinator.mark_connected(generation);
                        seen_traffic = traffic.load(Ordering::Relaxed);

                        match self.apply_record(record) {
                            Flow::Continue => {}
                            Flow::Disconnect(cause) => return ConnectionEnd::Disconnected(cause),
                            Flow::Displaced => return ConnectionEnd::Superseded,
                        }
                        if self.abort.poll(&self.assembler) {
                            return ConnectionEnd::Aborted(self.execute_abort().await);
                        }
                        if let Some(end) = self.on_commands().await {
                            return end;
                        }
                    }
                }
            }
        }
    }

    fn apply_record(&mut self, record: Record) -> Flow {
        if let Some(other) = record.conversation_id.as_deref() {
            if other != self.state.conversation_id {
                tracing::warn!(
                    conversation = %self.state.conversation_id,
                    "Dropping record addressed to conversation {}",
                    other
                );
                return Flow::Continue;
            }
        }
        if self.state.is_acknowledged(record.index) {
            tracing::debug!(index = ?record.index, "Skipping already applied record");
            return Flow::Continue;
        }

        self.touch_health(Instant::now());
        self.coordinator.on_progress();

        let flow = match &record.event {
            Event::TimeoutHint => Flow::Disconnect(DisconnectCause::TimeoutHint),
            Event::Status(status) => Flow::Disconnect(DisconnectCause::Terminal(status.clone())),
            event => {
                self.apply_event(event);
                Flow::Continue
            }
        };

        self.state
            .acknowledge(record.index, record.event_id.as_deref());
        match self.persist(record.index.is_some(), record.event.is_mutating()) {
            Ok(()) => {}
            Err(Error::LeaseHeld { owner }) => {
                tracing::warn!(
                    conversation = %self.state.conversation_id,
                    "Stream lease taken over by {}; detaching",
                    owner
                );
                return Flow::Displaced;
            }
            Err(e) => tracing::warn!("Failed to persist resume state: {}", e),
        }
        self.update_phase(self.assembler.phase());
        flow
    }

    /// Write resume state for an applied record. Every write renews the lease.
    fn persist(&self, indexed: bool, mutating: bool) -> Result<()> {
        let id = &self.state.conversation_id;
        if indexed {
            self.storage.save_index(id, self.state.next_event_index)?;
        }
        if mutating {
            let snapshot = self.assembler.snapshot(self.state.phase_changed_at);
            self.storage.save_snapshot(id, &snapshot)?;
        }
        if !indexed && !mutating {
            self.storage.renew(id)?;
        }
        Ok(())
    }

    fn apply_event(&mut self, event: &Event) {
        let applied = self.assembler.apply(&mut self.transcript, event);
        if let Some(usage) = applied.committed_usage {
            self.totals.add(&usage);
        }
        for change in applied.changes {
            self.emit_block(change);
        }
        if applied.turn_completed {
            tracing::debug!(tokens = self.totals.total_tokens(), "Turn completed");
        }
    }

    /// React to handle pokes: visibility changes and abort requests
    async fn on_commands(&mut self) -> Option<ConnectionEnd> {
        if self.sync_visibility() {
            if let Some(end) = self.reprobe().await {
                return Some(end);
            }
        }
        if self.handle.take_abort_request()
            && self.abort.request(&self.assembler) == AbortState::Aborting
        {
            return Some(ConnectionEnd::Aborted(self.execute_abort().await));
        }
        None
    }

    /// Apply the handle's visibility. Returns true when the connection should
    /// be verified against the backend before it is trusted again.
    fn sync_visibility(&mut self) -> bool {
        let visibility = self.handle.visibility();
        if visibility != self.health.visibility() {
            tracing::debug!(?visibility, "Visibility changed");
            self.health.set_visibility(visibility, Instant::now());
        }
        if visibility != Visibility::Foreground {
            return false;
        }
        let guard = self.handle.reprobe.lock();
        guard.was_backgrounded_while_streaming()
            && guard.needs_probe(
                self.health.is_healthy(),
                self.coordinator.state() != LinkState::Disconnected,
            )
    }

    async fn reprobe(&mut self) -> Option<ConnectionEnd> {
        self.handle.reprobe.lock().clear();
        match self.backend.status(&self.state.conversation_id).await {
            Ok(status) if status.is_streaming => {
                tracing::info!("Back in the foreground; re-attaching to running job");
                self.emit(SessionEvent::Reconciled {
                    strategy: Strategy::Resume,
                });
                Some(ConnectionEnd::Disconnected(DisconnectCause::Resync))
            }
            Ok(_) => {
                tracing::debug!("Job no longer streaming; draining current connection");
                None
            }
            Err(e) => {
                tracing::warn!("Status probe failed: {}", e);
                None
            }
        }
    }

    async fn execute_abort(&mut self) -> AbortOutcome {
        self.coordinator.teardown();
        let outcome = self.abort.execute(&mut self.transcript, &mut self.assembler);
        if outcome.removed > 0 {
            self.emit(SessionEvent::TranscriptRewritten {
                len: self.transcript.len(),
            });
        }
        self.emit_block(BlockChange::Appended(outcome.interrupted_at));

        let request = AbortRequest {
            skip_sync: outcome.skip_sync,
        };
        match self
            .backend
            .abort(&self.state.conversation_id, request)
            .await
        {
            Ok(ack) if !ack.ok => tracing::warn!(
                "Backend declined abort: {}",
                ack.message.as_deref().unwrap_or("no reason given")
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!("Abort request failed: {}", e),
        }
        outcome
    }

    fn finish(&mut self, result: &Result<Outcome>) {
        self.handle.set_streaming(false);

        let event = match result {
            Ok(Outcome::Superseded) => {
                tracing::debug!(
                    conversation = %self.state.conversation_id,
                    "Stream superseded"
                );
                return;
            }
            Ok(Outcome::Completed) => SessionEvent::Completed,
            Ok(Outcome::Aborted(_)) => SessionEvent::Aborted,
            Ok(Outcome::Idle) => return,
            Err(e) => {
                tracing::error!(conversation = %self.state.conversation_id, "Stream failed: {}", e);
                self.assembler.reset();
                SessionEvent::Failed {
                    message: e.to_string(),
                }
            }
        };

        self.coordinator.teardown();
        if let Err(e) = self.storage.clear(&self.state.conversation_id) {
            tracing::warn!("Failed to clear resume state: {}", e);
        }
        self.update_phase(Phase::Idle);
        self.emit(event);
    }

    fn touch_health(&mut self, now: Instant) {
        if self.health.touch(now) {
            self.emit(SessionEvent::HealthChanged { healthy: true });
        }
    }

    fn update_phase(&mut self, phase: Phase) {
        if self.state.set_phase(phase) {
            self.emit(SessionEvent::PhaseChanged { phase });
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_block(&self, change: BlockChange) {
        let event = match change {
            BlockChange::Appended(position) => self
                .transcript
                .get(position)
                .cloned()
                .map(|block| SessionEvent::BlockAppended { position, block }),
            BlockChange::Updated(position) => self
                .transcript
                .get(position)
                .cloned()
                .map(|block| SessionEvent::BlockUpdated { position, block }),
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use futures::stream;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use tether_protocol::{AbortAck, ByteStream, JobStatus};

    type Hook = Box<dyn Fn() + Send + Sync>;

    enum Chunk {
        Bytes(String),
        /// Run a side effect right before the bytes are handed out
        Hook(Hook, String),
        Fail,
    }

    enum Script {
        NotFound,
        Refused(u16),
        Stream { chunks: Vec<Chunk>, hang: bool },
    }

    #[derive(Default)]
    struct ScriptedBackend {
        status: Mutex<JobStatus>,
        scripts: Mutex<VecDeque<Script>>,
        opened: Mutex<Vec<u64>>,
        aborts: Mutex<Vec<AbortRequest>>,
    }

    impl ScriptedBackend {
        fn push(&self, script: Script) {
            self.scripts.lock().push_back(script);
        }

        fn streaming(&self) {
            *self.status.lock() = JobStatus {
                is_streaming: true,
                event_count: 0,
            };
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn status(&self, _conversation_id: &str) -> tether_protocol::Result<JobStatus> {
            Ok(*self.status.lock())
        }

        async fn open_stream(
            &self,
            _conversation_id: &str,
            from_index: u64,
        ) -> tether_protocol::Result<ByteStream> {
            self.opened.lock().push(from_index);
            let script = self.scripts.lock().pop_front();
            match script {
                None => panic!("unexpected connection from index {}", from_index),
                Some(Script::NotFound) => Err(tether_protocol::Error::NotFound),
                Some(Script::Refused(code)) => Err(tether_protocol::Error::status(code, "refused")),
                Some(Script::Stream { chunks, hang }) => {
                    let items = stream::iter(chunks).map(|chunk| match chunk {
                        Chunk::Bytes(s) => Ok(s.into_bytes()),
                        Chunk::Hook(hook, s) => {
                            hook();
                            Ok(s.into_bytes())
                        }
                        Chunk::Fail => {
                            Err(tether_protocol::Error::Transport("connection reset".into()))
                        }
                    });
                    let bytes: ByteStream = if hang {
                        Box::pin(items.chain(stream::pending()))
                    } else {
                        Box::pin(items)
                    };
                    Ok(bytes)
                }
            }
        }

        async fn abort(
            &self,
            _conversation_id: &str,
            request: AbortRequest,
        ) -> tether_protocol::Result<AbortAck> {
            self.aborts.lock().push(request);
            Ok(AbortAck {
                ok: true,
                message: None,
            })
        }
    }

    fn line(index: u64, kind: &str, content: Value, metadata: Value) -> String {
        let mut record = json!({ "type": kind, "index": index, "conversation_id": "c1" });
        if !content.is_null() {
            record["content"] = content;
        }
        if !metadata.is_null() {
            record["metadata"] = metadata;
        }
        format!("data: {}\n", record)
    }

    /// One complete turn, without the terminal status record
    fn turn_events() -> Vec<(&'static str, Value, Value)> {
        vec![
            ("thinking_start", Value::Null, json!({"block_index": 0})),
            ("thinking_delta", json!("Let me think"), json!({"block_index": 0})),
            ("thinking_signature", Value::Null, json!({"block_index": 0})),
            ("thinking_stop", Value::Null, json!({"block_index": 0})),
            ("text_start", Value::Null, Value::Null),
            ("text_delta", json!("Hello"), Value::Null),
            ("text_delta", json!(" world"), Value::Null),
            (
                "usage",
                Value::Null,
                json!({"input_tokens": 10, "output_tokens": 5, "cost": 0.01}),
            ),
            ("done", Value::Null, Value::Null),
        ]
    }

    fn turn_lines() -> Vec<String> {
        let mut lines: Vec<String> = turn_events()
            .into_iter()
            .enumerate()
            .map(|(i, (kind, content, meta))| line(i as u64, kind, content, meta))
            .collect();
        lines.push(line(lines.len() as u64, "status", json!("completed"), Value::Null));
        lines
    }

    fn chunks(lines: &[String]) -> Vec<Chunk> {
        lines.iter().cloned().map(Chunk::Bytes).collect()
    }

    fn full_stream(lines: &[String]) -> Script {
        Script::Stream {
            chunks: chunks(lines),
            hang: false,
        }
    }

    /// Transcript shapes from folding the lines without any interruption
    fn reference(prompt: &str, lines: &[String]) -> Vec<(BlockKind, Option<Usage>)> {
        let mut transcript = Transcript::new();
        transcript.push(Block::live(BlockKind::User {
            text: prompt.into(),
        }));
        let mut assembler = TurnAssembler::new();
        for l in lines {
            if let Some(record) = tether_protocol::decoder::parse_line(l.trim_end()) {
                assembler.apply(&mut transcript, &record.event);
            }
        }
        shapes(&transcript)
    }

    fn shapes(transcript: &Transcript) -> Vec<(BlockKind, Option<Usage>)> {
        transcript
            .blocks()
            .iter()
            .map(|b| (b.kind.clone(), b.usage))
            .collect()
    }

    fn setup() -> (
        Arc<ScriptedBackend>,
        Arc<MemoryStore>,
        ConversationController,
    ) {
        setup_with(ControllerConfig::default())
    }

    fn setup_with(
        config: ControllerConfig,
    ) -> (
        Arc<ScriptedBackend>,
        Arc<MemoryStore>,
        ConversationController,
    ) {
        let backend = Arc::new(ScriptedBackend::default());
        let store = Arc::new(MemoryStore::new());
        let controller = ConversationController::new("c1", backend.clone(), store.clone(), config);
        (backend, store, controller)
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = vec![];
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_streams_turn_to_completion() {
        let (backend, store, mut controller) = setup();
        let lines = turn_lines();
        backend.push(full_stream(&lines));
        let mut rx = controller.subscribe();

        let outcome = controller.submit("hi").await.unwrap();

        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(*backend.opened.lock(), vec![0]);
        let blocks = controller.transcript().blocks();
        assert_eq!(blocks.len(), 3);
        assert!(matches!(
            &blocks[1].kind,
            BlockKind::Thinking { content, signed: true, collapsed: true } if content == "Let me think"
        ));
        assert_eq!(
            blocks[2].kind,
            BlockKind::Text {
                content: "Hello world".into()
            }
        );
        assert_eq!(blocks[2].usage.map(|u| u.input), Some(10));
        assert_eq!(controller.totals().output, 5);
        assert_eq!(controller.phase(), Phase::Idle);
        assert_eq!(store.get("resume_index::c1").unwrap(), None);
        assert_eq!(store.get("resume_owner::c1").unwrap(), None);

        let events = drain(&mut rx);
        assert!(matches!(
            &events[0],
            SessionEvent::BlockAppended { position: 0, block } if block.is_user()
        ));
        assert!(events.contains(&SessionEvent::PhaseChanged {
            phase: Phase::Streaming
        }));
        assert_eq!(events.last(), Some(&SessionEvent::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_never_duplicate_blocks() {
        let (backend, _store, mut controller) = setup();
        let events = turn_events();
        let indexed = |range: std::ops::Range<usize>, offset: u64| -> Vec<String> {
            range
                .map(|i| {
                    let (kind, content, meta) = events[i].clone();
                    line(i as u64 + offset, kind, content, meta)
                })
                .collect()
        };

        // First connection drops after index 4
        let mut first = chunks(&indexed(0..5, 0));
        first.push(Chunk::Fail);
        backend.push(Script::Stream {
            chunks: first,
            hang: false,
        });
        // Second replays 3 and 4, then the server recycles the transport
        let mut second = indexed(3..7, 0);
        second.push(line(7, "timeout", Value::Null, Value::Null));
        backend.push(full_stream(&second));
        // Third picks up after the timeout record
        let mut third = indexed(7..9, 1);
        third.push(line(10, "status", json!("completed"), Value::Null));
        backend.push(full_stream(&third));

        let outcome = controller.submit("hi").await.unwrap();

        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(*backend.opened.lock(), vec![0, 5, 8]);
        assert_eq!(shapes(controller.transcript()), reference("hi", &turn_lines()));
        assert_eq!(controller.totals().input, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_not_found_retries_then_streams() {
        let (backend, _store, mut controller) = setup();
        backend.push(Script::NotFound);
        backend.push(Script::NotFound);
        backend.push(full_stream(&turn_lines()));
        let mut rx = controller.subscribe();

        assert_eq!(controller.submit("hi").await.unwrap(), Outcome::Completed);
        assert_eq!(*backend.opened.lock(), vec![0, 0, 0]);
        let reconnects: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Reconnecting {
                    cause, delay_ms, ..
                } => Some((cause, delay_ms)),
                _ => None,
            })
            .collect();
        assert_eq!(
            reconnects,
            vec![("startup".to_string(), 500), ("startup".to_string(), 500)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_gives_up() {
        let mut config = ControllerConfig::default();
        config.retry.startup_max_attempts = 3;
        let (backend, store, mut controller) = setup_with(config);
        for _ in 0..4 {
            backend.push(Script::NotFound);
        }
        let mut rx = controller.subscribe();

        match controller.submit("hi").await {
            Err(Error::StartupTimedOut { attempts }) => assert_eq!(attempts, 3),
            other => panic!("expected startup timeout, got {:?}", other),
        }
        assert_eq!(backend.opened.lock().len(), 4);
        assert_eq!(store.get("resume_owner::c1").unwrap(), None);
        assert!(matches!(
            drain(&mut rx).last(),
            Some(SessionEvent::Failed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_budget_exhausted() {
        let mut config = ControllerConfig::default();
        config.retry.network_max_attempts = 2;
        let (backend, _store, mut controller) = setup_with(config);
        for _ in 0..3 {
            backend.push(Script::Refused(503));
        }

        match controller.submit("hi").await {
            Err(Error::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected exhausted retries, got {:?}", other),
        }
        assert_eq!(controller.phase(), Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_fails_without_retry() {
        let (backend, _store, mut controller) = setup();
        backend.push(Script::Refused(401));

        assert!(matches!(
            controller.submit("hi").await,
            Err(Error::Protocol(_))
        ));
        assert_eq!(backend.opened.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_status_keeps_partial_output() {
        let (backend, _store, mut controller) = setup();
        backend.push(full_stream(&[
            line(0, "text_start", Value::Null, Value::Null),
            line(1, "text_delta", json!("partial"), Value::Null),
            line(2, "status", json!("failed"), json!({"error": "overloaded"})),
        ]));

        match controller.submit("hi").await {
            Err(Error::JobFailed(message)) => assert_eq!(message, "overloaded"),
            other => panic!("expected job failure, got {:?}", other),
        }
        assert_eq!(
            controller.transcript().last().unwrap().kind,
            BlockKind::Text {
                content: "partial".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cross_talk_and_duplicates_dropped() {
        let (backend, _store, mut controller) = setup();
        let stray = format!(
            "data: {}\n",
            json!({"type": "text_delta", "index": 2, "content": "leak", "conversation_id": "c2"})
        );
        backend.push(full_stream(&[
            line(0, "text_start", Value::Null, Value::Null),
            line(1, "text_delta", json!("a"), Value::Null),
            stray,
            line(1, "text_delta", json!("a"), Value::Null),
            line(2, "text_delta", json!("b"), Value::Null),
            line(3, "done", Value::Null, Value::Null),
        ]));

        assert_eq!(controller.submit("hi").await.unwrap(), Outcome::Completed);
        assert_eq!(
            controller.transcript().last().unwrap().kind,
            BlockKind::Text {
                content: "ab".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_waits_for_tool_result() {
        let (backend, store, mut controller) = setup();
        let handle = controller.handle();
        backend.push(Script::Stream {
            chunks: vec![
                Chunk::Bytes(line(
                    0,
                    "tool_use_start",
                    Value::Null,
                    json!({"tool_id": "t1", "tool_name": "bash"}),
                )),
                Chunk::Hook(
                    Box::new(move || handle.abort()),
                    line(1, "keepalive", Value::Null, Value::Null),
                ),
                Chunk::Bytes(line(2, "tool_use_delta", json!("{\"cmd\":\"ls\"}"), Value::Null)),
                Chunk::Bytes(line(3, "tool_use_stop", Value::Null, Value::Null)),
                Chunk::Bytes(line(4, "tool_result", json!("ok"), json!({"tool_id": "t1"}))),
                Chunk::Bytes(line(5, "text_start", Value::Null, Value::Null)),
            ],
            hang: true,
        });

        let outcome = controller.submit("run ls").await.unwrap();

        match outcome {
            Outcome::Aborted(abort) => assert!(abort.skip_sync),
            other => panic!("expected abort, got {:?}", other),
        }
        let blocks = controller.transcript().blocks();
        assert_eq!(blocks.len(), 3);
        match &blocks[1].kind {
            BlockKind::ToolCall(call) => {
                assert_eq!(call.result, Some(json!("ok")));
                assert_eq!(call.parsed_input(), Some(json!({"cmd": "ls"})));
            }
            other => panic!("expected tool call, got {:?}", other),
        }
        assert_eq!(blocks[2].kind, BlockKind::Interrupted);
        assert_eq!(
            *backend.aborts.lock(),
            vec![AbortRequest { skip_sync: true }]
        );
        assert_eq!(store.get("resume_index::c1").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_mid_text_is_immediate() {
        let (backend, _store, mut controller) = setup();
        let handle = controller.handle();
        backend.push(Script::Stream {
            chunks: vec![
                Chunk::Bytes(line(0, "text_start", Value::Null, Value::Null)),
                Chunk::Bytes(line(1, "text_delta", json!("Hel"), Value::Null)),
                Chunk::Hook(
                    Box::new(move || handle.abort()),
                    line(2, "text_delta", json!("lo"), Value::Null),
                ),
                Chunk::Bytes(line(3, "text_delta", json!(" there"), Value::Null)),
            ],
            hang: true,
        });

        let outcome = controller.submit("hi").await.unwrap();

        assert!(matches!(outcome, Outcome::Aborted(AbortOutcome { skip_sync: false, .. })));
        let blocks = controller.transcript().blocks();
        assert_eq!(
            blocks[1].kind,
            BlockKind::Text {
                content: "Hello".into()
            }
        );
        assert_eq!(blocks[2].kind, BlockKind::Interrupted);
        assert_eq!(
            *backend.aborts.lock(),
            vec![AbortRequest { skip_sync: false }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_replay_strips_stale_turn_first() {
        let (backend, _store, controller) = setup();
        let mut stale = Block::persisted(BlockKind::Text {
            content: "stale".into(),
        });
        stale.usage = Some(Usage {
            input: 50,
            ..Default::default()
        });
        let mut controller = controller.with_transcript(Transcript::from_blocks(vec![
            Block::persisted(BlockKind::User { text: "hi".into() }),
            Block::persisted(BlockKind::Thinking {
                content: "old".into(),
                signed: true,
                collapsed: true,
            }),
            stale,
        ]));
        assert_eq!(controller.totals().input, 50);
        backend.streaming();
        backend.push(full_stream(&turn_lines()));
        let mut rx = controller.subscribe();

        assert_eq!(controller.resume().await.unwrap(), Outcome::Completed);

        assert_eq!(*backend.opened.lock(), vec![0]);
        let expected = reference("hi", &turn_lines());
        let actual = shapes(controller.transcript());
        assert_eq!(actual.len(), 3);
        assert_eq!(actual[1..], expected[1..]);
        assert_eq!(controller.totals().input, 10);

        let events = drain(&mut rx);
        assert_eq!(
            events[0],
            SessionEvent::Reconciled {
                strategy: Strategy::FullReplay
            }
        );
        assert_eq!(events[1], SessionEvent::TranscriptRewritten { len: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_continues_from_stored_index() {
        let (backend, store, controller) = setup();
        let lines = turn_lines();

        // State left behind by an earlier connection that got through index 5
        let mut transcript = Transcript::new();
        transcript.push(Block::live(BlockKind::User { text: "hi".into() }));
        let mut assembler = TurnAssembler::new();
        for l in &lines[..6] {
            let record = tether_protocol::decoder::parse_line(l.trim_end()).unwrap();
            assembler.apply(&mut transcript, &record.event);
        }
        store.put("resume_index::c1", "6").unwrap();
        store
            .put(
                "resume_snapshot::c1",
                &serde_json::to_string(&assembler.snapshot(chrono::Utc::now())).unwrap(),
            )
            .unwrap();

        let mut controller = controller.with_transcript(transcript);
        backend.streaming();
        backend.push(full_stream(&lines[6..]));

        assert_eq!(controller.resume().await.unwrap(), Outcome::Completed);
        assert_eq!(*backend.opened.lock(), vec![6]);
        assert_eq!(shapes(controller.transcript()), reference("hi", &lines));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_active_job_clears_resume_state() {
        let (backend, store, mut controller) = setup();
        store.put("resume_index::c1", "4").unwrap();

        assert_eq!(controller.resume().await.unwrap(), Outcome::Idle);
        assert_eq!(store.get("resume_index::c1").unwrap(), None);
        assert!(backend.opened.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_held_by_other_client() {
        let (backend, store, mut controller) = setup();
        let rival = ResumeStorage::new(store.clone(), Duration::from_secs(60));
        rival.claim("c1").unwrap();

        match controller.submit("hi").await {
            Err(Error::LeaseHeld { owner }) => assert_eq!(owner, rival.owner()),
            other => panic!("expected lease conflict, got {:?}", other),
        }
        assert!(controller.transcript().is_empty());
        assert!(backend.opened.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_taken_over_mid_stream_detaches() {
        let (backend, store, mut controller) = setup();
        let rival = ResumeStorage::new(store.clone(), Duration::from_secs(60));
        let takeover = rival.clone();
        let lines = turn_lines();

        // The rival finds our lease lapsed and claims it
        let mut first = chunks(&lines[..3]);
        first.push(Chunk::Hook(
            Box::new(move || {
                takeover
                    .claim_at("c1", chrono::Utc::now() + chrono::Duration::seconds(61))
                    .unwrap();
            }),
            lines[3].clone(),
        ));
        backend.push(Script::Stream {
            chunks: first,
            hang: true,
        });
        let mut rx = controller.subscribe();

        assert_eq!(controller.submit("hi").await.unwrap(), Outcome::Superseded);
        assert_eq!(*backend.opened.lock(), vec![0]);
        // Nothing written after the takeover, and the rival keeps its lease
        assert_eq!(store.get("resume_index::c1").unwrap().as_deref(), Some("3"));
        rival.claim("c1").unwrap();
        assert!(!drain(&mut rx).iter().any(|e| e.is_terminal()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_turn_empty_stream_is_retried() {
        let (backend, _store, mut controller) = setup();
        let lines = turn_lines();
        backend.push(full_stream(&lines));
        assert_eq!(controller.submit("first").await.unwrap(), Outcome::Completed);

        // The next job has not written anything when we first connect
        backend.push(Script::Stream {
            chunks: vec![],
            hang: false,
        });
        backend.push(full_stream(&lines));

        assert_eq!(controller.submit("second").await.unwrap(), Outcome::Completed);
        assert_eq!(*backend.opened.lock(), vec![0, 0, 0]);

        let mut expected = reference("first", &lines);
        expected.extend(reference("second", &lines));
        assert_eq!(shapes(controller.transcript()), expected);
        assert_eq!(controller.totals().input, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_connection_reconnects() {
        let (backend, _store, mut controller) = setup();
        let lines = turn_lines();
        backend.push(Script::Stream {
            chunks: chunks(&lines[..5]),
            hang: true,
        });
        backend.push(full_stream(&lines[5..]));
        let mut rx = controller.subscribe();

        assert_eq!(controller.submit("hi").await.unwrap(), Outcome::Completed);
        assert_eq!(*backend.opened.lock(), vec![0, 5]);
        assert_eq!(shapes(controller.transcript()), reference("hi", &lines));

        let events = drain(&mut rx);
        let stalled = events
            .iter()
            .position(|e| *e == SessionEvent::HealthChanged { healthy: false })
            .unwrap();
        let restored = events
            .iter()
            .position(|e| *e == SessionEvent::HealthChanged { healthy: true })
            .unwrap();
        assert!(stalled < restored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_return_resyncs_from_acknowledged_index() {
        let (backend, _store, mut controller) = setup();
        backend.streaming();
        let lines = turn_lines();
        let hide = controller.handle();
        let show = controller.handle();

        let mut first = chunks(&lines[..5]);
        first.push(Chunk::Hook(
            Box::new(move || hide.set_visibility(Visibility::Background)),
            line(5, "keepalive", Value::Null, Value::Null),
        ));
        first.push(Chunk::Hook(
            Box::new(move || show.set_visibility(Visibility::Foreground)),
            line(6, "keepalive", Value::Null, Value::Null),
        ));
        backend.push(Script::Stream {
            chunks: first,
            hang: true,
        });
        // Remaining events shifted past the two keepalives
        let rest: Vec<String> = turn_events()
            .into_iter()
            .enumerate()
            .skip(5)
            .map(|(i, (kind, content, meta))| line(i as u64 + 2, kind, content, meta))
            .chain(std::iter::once(line(11, "status", json!("completed"), Value::Null)))
            .collect();
        backend.push(full_stream(&rest));
        let mut rx = controller.subscribe();

        assert_eq!(controller.submit("hi").await.unwrap(), Outcome::Completed);
        assert_eq!(*backend.opened.lock(), vec![0, 7]);
        assert_eq!(shapes(controller.transcript()), reference("hi", &lines));
        assert!(drain(&mut rx).contains(&SessionEvent::Reconnecting {
            cause: "resync".into(),
            attempt: 0,
            delay_ms: 0,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supersede_stops_applying_records() {
        let (backend, store, mut controller) = setup();
        let handle = controller.handle();
        backend.push(Script::Stream {
            chunks: vec![
                Chunk::Bytes(line(0, "text_start", Value::Null, Value::Null)),
                Chunk::Bytes(line(1, "text_delta", json!("kept"), Value::Null)),
                Chunk::Hook(
                    Box::new(move || handle.supersede()),
                    line(2, "text_delta", json!(" dropped"), Value::Null),
                ),
            ],
            hang: true,
        });

        assert_eq!(controller.submit("hi").await.unwrap(), Outcome::Superseded);
        assert_eq!(
            controller.transcript().last().unwrap().kind,
            BlockKind::Text {
                content: "kept".into()
            }
        );
        // The newer owner resumes from here
        assert_eq!(store.get("resume_index::c1").unwrap().as_deref(), Some("2"));
    }
}
