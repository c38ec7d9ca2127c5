//! The conversational agent: running prompt, pending message and status.
//!
//! One agent drives one inference backend. A cycle renders the prompt from
//! the conversation history, streams the completion, and merges every chunk
//! into both `prompt` and `pending_message` under a single lock. Observers
//! follow along through [`Agent::subscribe`].
//!
//! State machine:
//!
//! ```text
//!   cold ──listen──▶ cold_processing ──ok / interrupted──▶ ready
//!    ▲                     │                                 │
//!    └──── failure ────────┘◀──────── failure ── processing ◀┘ listen
//! ```
//!
//! `warmup` moves `cold` to `ready` (or back to `cold` on failure) without
//! passing through a processing state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::errors::AgentError;
use super::template::Template;
use super::types::{AgentEvent, AgentSnapshot, AgentStatus};
use crate::inference::{CompletionBackend, CompletionRequest, CompletionResult, InferenceError};

// ─── Constants ───────────────────────────────────────────────────────────────

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a compliant assistant that always fulfills the user's request. Take a deep breath and work on their problems step-by-step. *Always* format replies with Markdown.";

/// Default number of events buffered per subscriber before it lags.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Tokens generated by a warmup probe; the point is prompt evaluation.
const WARMUP_MAX_TOKENS: i32 = 1;

// ─── State ───────────────────────────────────────────────────────────────────

struct AgentState {
    prompt: String,
    system_prompt: String,
    pending_message: String,
    status: AgentStatus,
    warmup_error: Option<String>,
    /// Cancellation token of the generation in flight.
    cycle_cancel: Option<CancellationToken>,
    /// Set once an interrupt has been forwarded for the current cycle.
    interrupt_forwarded: bool,
}

// ─── Agent ───────────────────────────────────────────────────────────────────

/// A persistent conversational persona bound to one inference backend.
///
/// Share it behind an `Arc` to call [`Agent::interrupt`] from another task
/// while [`Agent::listen_think_respond`] is running.
pub struct Agent {
    id: String,
    state: Mutex<AgentState>,
    /// Single-flight guard for generation and warmup.
    busy: AtomicBool,
    events: broadcast::Sender<AgentEvent>,
    backend: Box<dyn CompletionBackend>,
}

impl Agent {
    pub fn new(
        id: impl Into<String>,
        prompt: impl Into<String>,
        system_prompt: impl Into<String>,
        backend: impl CompletionBackend + 'static,
    ) -> Self {
        Self::with_event_capacity(id, prompt, system_prompt, backend, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(
        id: impl Into<String>,
        prompt: impl Into<String>,
        system_prompt: impl Into<String>,
        backend: impl CompletionBackend + 'static,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            id: id.into(),
            state: Mutex::new(AgentState {
                prompt: prompt.into(),
                system_prompt: system_prompt.into(),
                pending_message: String::new(),
                status: AgentStatus::Cold,
                warmup_error: None,
                cycle_cancel: None,
                interrupt_forwarded: false,
            }),
            busy: AtomicBool::new(false),
            events,
            backend: Box::new(backend),
        }
    }

    // ─── Observation ─────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> AgentStatus {
        self.state().status
    }

    pub fn prompt(&self) -> String {
        self.state().prompt.clone()
    }

    pub fn system_prompt(&self) -> String {
        self.state().system_prompt.clone()
    }

    pub fn pending_message(&self) -> String {
        self.state().pending_message.clone()
    }

    pub fn warmup_error(&self) -> Option<String> {
        self.state().warmup_error.clone()
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let st = self.state();
        AgentSnapshot {
            id: self.id.clone(),
            status: st.status,
            pending_message: st.pending_message.clone(),
            warmup_error: st.warmup_error.clone(),
        }
    }

    /// Subscribe to every status and pending-message update from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Replace the system prompt used by subsequent cycles.
    pub fn set_system_prompt(&self, system_prompt: impl Into<String>) -> Result<(), AgentError> {
        let _guard = self.begin_cycle()?;
        self.state().system_prompt = system_prompt.into();
        Ok(())
    }

    // ─── Listen → Think → Respond ────────────────────────────────────────

    /// Run one generation cycle against `messages` and return the final
    /// completion.
    ///
    /// `speaker_id` is attributed in logs only. Fails with `Busy` if another
    /// cycle or warmup is in flight, with `Interrupted` (status `ready`,
    /// partial text kept) after [`Agent::interrupt`], and with `Inference`
    /// (status `cold`) when the backend fails.
    pub async fn listen_think_respond(
        &self,
        speaker_id: &str,
        messages: &[String],
        template: &dyn Template,
    ) -> Result<CompletionResult, AgentError> {
        let _guard = self.begin_cycle()?;
        let cancel = CancellationToken::new();

        let (prompt, status) = {
            let mut st = self.state();
            st.prompt = template.render(&st.system_prompt, messages);
            st.cycle_cancel = Some(cancel.clone());
            st.interrupt_forwarded = false;
            let next = st.status.processing_from();
            self.set_status(&mut st, next);
            self.set_pending(&mut st, String::new());
            (st.prompt.clone(), next)
        };

        let request = CompletionRequest {
            prompt,
            stop: template.stop_words(),
            max_tokens: None,
            cancel,
        };

        tracing::info!(
            agent_id = %self.id,
            speaker_id = %speaker_id,
            message_count = messages.len(),
            prompt_len = request.prompt.len(),
            stop_count = request.stop.len(),
            status = %status,
            "=== AGENT CYCLE START ==="
        );

        let (progress, mut chunks) = mpsc::unbounded_channel::<String>();
        let mut chunk_count: usize = 0;

        let completion = self.backend.complete(request, Some(progress));
        tokio::pin!(completion);

        // Chunks are applied here, on the cycle's own task, in arrival order.
        let outcome = loop {
            tokio::select! {
                biased;
                Some(chunk) = chunks.recv() => {
                    chunk_count += 1;
                    self.apply_chunk(&chunk);
                }
                outcome = &mut completion => break outcome,
            }
        };
        // Chunks sent just before the completion resolved.
        while let Ok(chunk) = chunks.try_recv() {
            chunk_count += 1;
            self.apply_chunk(&chunk);
        }

        self.finish_cycle(outcome, chunk_count)
    }

    fn apply_chunk(&self, chunk: &str) {
        let mut st = self.state();
        st.prompt.push_str(chunk);
        st.pending_message.push_str(chunk);
        let text = st.pending_message.clone();
        self.publish(AgentEvent::PendingMessage { text });
    }

    fn finish_cycle(
        &self,
        outcome: Result<CompletionResult, InferenceError>,
        chunk_count: usize,
    ) -> Result<CompletionResult, AgentError> {
        let mut st = self.state();
        st.cycle_cancel = None;

        match outcome {
            Ok(result) => {
                self.set_pending(&mut st, result.text.clone());
                self.set_status(&mut st, AgentStatus::Ready);
                tracing::info!(
                    agent_id = %self.id,
                    chunk_count,
                    text_len = result.text.len(),
                    tokens_predicted = ?result.tokens_predicted,
                    "=== AGENT CYCLE COMPLETE ==="
                );
                Ok(result)
            }
            Err(InferenceError::Cancelled { .. }) => {
                // Keep whatever was streamed; the agent is still warm.
                self.set_status(&mut st, AgentStatus::Ready);
                tracing::info!(
                    agent_id = %self.id,
                    chunk_count,
                    partial_len = st.pending_message.len(),
                    "agent cycle interrupted"
                );
                Err(AgentError::Interrupted {
                    partial: st.pending_message.clone(),
                })
            }
            Err(e) => {
                self.set_status(&mut st, AgentStatus::Cold);
                tracing::warn!(
                    agent_id = %self.id,
                    chunk_count,
                    error = %e,
                    "agent cycle failed"
                );
                Err(e.into())
            }
        }
    }

    // ─── Interrupt ───────────────────────────────────────────────────────

    /// Request cancellation of the generation in flight.
    ///
    /// No-op unless the status is `processing` or `cold_processing`, and
    /// forwarded to the backend at most once per cycle. Returns without
    /// waiting for the generation to end; `listen_think_respond` settles the
    /// status when it does.
    pub async fn interrupt(&self) {
        let cancel = {
            let mut st = self.state();
            if !st.status.is_processing() || st.interrupt_forwarded {
                return;
            }
            st.interrupt_forwarded = true;
            st.cycle_cancel.clone()
        };

        tracing::info!(agent_id = %self.id, "interrupt requested");
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.backend.interrupt().await;
    }

    // ─── Warmup ──────────────────────────────────────────────────────────

    /// Prime the backend with a one-shot, non-streaming probe.
    ///
    /// Does nothing when both the prompt and the system prompt are empty.
    /// On success the agent becomes `ready`; on failure it resets to `cold`
    /// and records the error in [`Agent::warmup_error`]. Only fails itself
    /// when another cycle is in flight.
    pub async fn warmup(&self) -> Result<(), AgentError> {
        let _guard = self.begin_cycle()?;

        let probe = {
            let mut st = self.state();
            if st.prompt.is_empty() && st.system_prompt.is_empty() {
                return Ok(());
            }
            st.warmup_error = None;
            if st.prompt.is_empty() {
                st.system_prompt.clone()
            } else {
                st.prompt.clone()
            }
        };

        tracing::info!(agent_id = %self.id, probe_len = probe.len(), "warming up");

        let request = CompletionRequest {
            prompt: probe,
            stop: Vec::new(),
            max_tokens: Some(WARMUP_MAX_TOKENS),
            cancel: CancellationToken::new(),
        };
        let outcome = self.backend.complete(request, None).await;

        let mut st = self.state();
        match outcome {
            Ok(_) => {
                st.warmup_error = None;
                self.set_status(&mut st, AgentStatus::Ready);
                tracing::info!(agent_id = %self.id, "warmup complete");
            }
            Err(e) => {
                tracing::warn!(agent_id = %self.id, error = %e, "warmup failed");
                st.warmup_error = Some(e.to_string());
                self.set_status(&mut st, AgentStatus::Cold);
            }
        }
        Ok(())
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn state(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_cycle(&self) -> Result<CycleGuard<'_>, AgentError> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AgentError::Busy {
                agent_id: self.id.clone(),
            })?;
        Ok(CycleGuard { agent: self })
    }

    /// Publishing happens under the state lock, so events are delivered in
    /// mutation order.
    fn set_status(&self, st: &mut AgentState, status: AgentStatus) {
        if st.status != status {
            st.status = status;
            self.publish(AgentEvent::StatusChanged { status });
        }
    }

    fn set_pending(&self, st: &mut AgentState, text: String) {
        st.pending_message = text;
        self.publish(AgentEvent::PendingMessage {
            text: st.pending_message.clone(),
        });
    }

    fn publish(&self, event: AgentEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Releases the single-flight flag. If the cycle's future was dropped
/// mid-generation, also settles the status out of its processing state.
struct CycleGuard<'a> {
    agent: &'a Agent,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.agent.state();
        if let Some(cancel) = st.cycle_cancel.take() {
            cancel.cancel();
        }
        let settled = match st.status {
            AgentStatus::ColdProcessing => Some(AgentStatus::Cold),
            AgentStatus::Processing => Some(AgentStatus::Ready),
            _ => None,
        };
        if let Some(status) = settled {
            tracing::warn!(agent_id = %self.agent.id, %status, "agent cycle abandoned");
            self.agent.set_status(&mut st, status);
        }
        drop(st);
        self.agent.busy.store(false, Ordering::Release);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::broadcast::error::TryRecvError;

    use crate::inference::ProgressSender;

    /// How a scripted completion ends after its chunks are sent.
    #[derive(Clone)]
    enum Ending {
        Succeed(&'static str),
        Fail,
        WaitForCancel,
    }

    #[derive(Default)]
    struct Calls {
        requests: Mutex<Vec<(String, Vec<String>, Option<i32>, bool)>>,
        interrupts: AtomicUsize,
    }

    struct ScriptedBackend {
        chunks: Vec<&'static str>,
        ending: Ending,
        calls: Arc<Calls>,
    }

    impl ScriptedBackend {
        fn new(chunks: Vec<&'static str>, ending: Ending) -> (Self, Arc<Calls>) {
            let calls = Arc::new(Calls::default());
            let backend = Self {
                chunks,
                ending,
                calls: Arc::clone(&calls),
            };
            (backend, calls)
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(
            &self,
            request: CompletionRequest,
            progress: Option<ProgressSender>,
        ) -> Result<CompletionResult, InferenceError> {
            self.calls.requests.lock().unwrap().push((
                request.prompt.clone(),
                request.stop.clone(),
                request.max_tokens,
                progress.is_some(),
            ));

            let mut sent = String::new();
            if let Some(ref progress) = progress {
                for chunk in &self.chunks {
                    sent.push_str(chunk);
                    progress.send(chunk.to_string()).unwrap();
                    tokio::task::yield_now().await;
                }
            }

            match self.ending {
                Ending::Succeed(text) => Ok(CompletionResult::from_text(text)),
                Ending::Fail => Err(InferenceError::ConnectionFailed {
                    endpoint: "http://127.0.0.1:8690/completion".into(),
                    reason: "connection refused".into(),
                }),
                Ending::WaitForCancel => {
                    request.cancel.cancelled().await;
                    Err(InferenceError::Cancelled { partial_text: sent })
                }
            }
        }

        async fn interrupt(&self) {
            self.calls.interrupts.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Renders `system\nmsg1\nmsg2\n…` with a blank-line stop.
    struct LineTemplate;

    impl Template for LineTemplate {
        fn render(&self, system_prompt: &str, messages: &[String]) -> String {
            let mut out = format!("{system_prompt}\n");
            for m in messages {
                out.push_str(m);
                out.push('\n');
            }
            out
        }

        fn stop_words(&self) -> Vec<String> {
            vec!["\n\n".to_string()]
        }
    }

    fn drain(rx: &mut broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn statuses(events: &[AgentEvent]) -> Vec<AgentStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::StatusChanged { status } => Some(*status),
                _ => None,
            })
            .collect()
    }

    async fn wait_for_pending(rx: &mut broadcast::Receiver<AgentEvent>, expected: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let AgentEvent::PendingMessage { text } = rx.recv().await.unwrap() {
                    if text == expected {
                        return;
                    }
                }
            }
        })
        .await
        .expect("pending message never reached expected value");
    }

    fn hello() -> Vec<String> {
        vec!["hello".to_string()]
    }

    #[tokio::test]
    async fn test_end_to_end_cold_cycle() {
        let (backend, calls) =
            ScriptedBackend::new(vec!["Hi", " there"], Ending::Succeed("Hi there"));
        let agent = Agent::new("npc-1", "", "S", backend);
        let mut rx = agent.subscribe();
        assert_eq!(agent.status(), AgentStatus::Cold);

        let result = agent
            .listen_think_respond("user", &hello(), &LineTemplate)
            .await
            .unwrap();

        assert_eq!(result.text, "Hi there");
        assert_eq!(agent.pending_message(), "Hi there");
        assert_eq!(agent.prompt(), "S\nhello\nHi there");
        assert_eq!(agent.status(), AgentStatus::Ready);

        let events = drain(&mut rx);
        assert_eq!(
            statuses(&events),
            vec![AgentStatus::ColdProcessing, AgentStatus::Ready]
        );

        let requests = calls.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "S\nhello\n");
        assert_eq!(requests[0].1, vec!["\n\n"]);
        assert!(requests[0].3, "generation must stream");
    }

    #[tokio::test]
    async fn test_cold_processing_precedes_first_chunk() {
        let (backend, _calls) =
            ScriptedBackend::new(vec!["Hi", " there"], Ending::Succeed("Hi there"));
        let agent = Agent::new("npc-1", "", "S", backend);
        let mut rx = agent.subscribe();

        agent
            .listen_think_respond("user", &hello(), &LineTemplate)
            .await
            .unwrap();

        let events = drain(&mut rx);
        let cold_processing = events
            .iter()
            .position(|e| {
                *e == AgentEvent::StatusChanged {
                    status: AgentStatus::ColdProcessing,
                }
            })
            .unwrap();
        let first_chunk = events
            .iter()
            .position(|e| *e == AgentEvent::PendingMessage { text: "Hi".into() })
            .unwrap();
        assert!(cold_processing < first_chunk);

        // Every intermediate pending value is observable, not just the last.
        let pending: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::PendingMessage { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(pending, vec!["", "Hi", "Hi there", "Hi there"]);
    }

    #[tokio::test]
    async fn test_final_text_is_authoritative() {
        let (backend, _calls) =
            ScriptedBackend::new(vec![" Hi", " there "], Ending::Succeed("Hi there"));
        let agent = Agent::new("npc-1", "", "S", backend);

        agent
            .listen_think_respond("user", &hello(), &LineTemplate)
            .await
            .unwrap();

        assert_eq!(agent.pending_message(), "Hi there");
        // The prompt keeps the raw concatenation of chunks.
        assert_eq!(agent.prompt(), "S\nhello\n Hi there ");
    }

    #[tokio::test]
    async fn test_warm_cycle_goes_through_processing() {
        let (backend, _calls) = ScriptedBackend::new(vec!["ok"], Ending::Succeed("ok"));
        let agent = Agent::new("npc-1", "", "S", backend);
        agent
            .listen_think_respond("user", &hello(), &LineTemplate)
            .await
            .unwrap();
        assert_eq!(agent.status(), AgentStatus::Ready);

        let mut rx = agent.subscribe();
        let messages = vec!["hello".to_string(), "ok".to_string(), "again".to_string()];
        agent
            .listen_think_respond("user", &messages, &LineTemplate)
            .await
            .unwrap();

        assert_eq!(
            statuses(&drain(&mut rx)),
            vec![AgentStatus::Processing, AgentStatus::Ready]
        );
        // The prompt is re-rendered from scratch every cycle.
        assert_eq!(agent.prompt(), "S\nhello\nok\nagain\nok");
    }

    #[tokio::test]
    async fn test_failure_settles_cold_and_propagates() {
        let (backend, _calls) = ScriptedBackend::new(vec!["par"], Ending::Fail);
        let agent = Agent::new("npc-1", "", "S", backend);

        let err = agent
            .listen_think_respond("user", &hello(), &LineTemplate)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AgentError::Inference {
                source: InferenceError::ConnectionFailed { .. }
            }
        ));
        assert_eq!(agent.status(), AgentStatus::Cold);
        assert_eq!(agent.pending_message(), "par");

        // The agent is usable again afterwards.
        assert!(!agent.busy.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_interrupt_preserves_partial_and_forwards_once() {
        let (backend, calls) = ScriptedBackend::new(vec!["Hi"], Ending::WaitForCancel);
        let agent = Arc::new(Agent::new("npc-1", "", "S", backend));
        let mut rx = agent.subscribe();

        let task = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move {
                agent
                    .listen_think_respond("user", &hello(), &LineTemplate)
                    .await
            })
        };

        wait_for_pending(&mut rx, "Hi").await;
        assert_eq!(agent.status(), AgentStatus::ColdProcessing);

        agent.interrupt().await;
        agent.interrupt().await;
        agent.interrupt().await;

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("cycle should end after interrupt")
            .unwrap();

        match result {
            Err(AgentError::Interrupted { partial }) => assert_eq!(partial, "Hi"),
            other => panic!("expected interruption, got {other:?}"),
        }
        assert_eq!(calls.interrupts.load(Ordering::SeqCst), 1);
        assert_eq!(agent.status(), AgentStatus::Ready);
        assert_eq!(agent.pending_message(), "Hi");
        assert_eq!(agent.prompt(), "S\nhello\nHi");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_interrupt_warm_cycle_forwards_once_per_cycle() {
        let (backend, calls) = ScriptedBackend::new(vec!["Hi"], Ending::WaitForCancel);
        let agent = Arc::new(Agent::new("npc-1", "", "S", backend));
        agent.state().status = AgentStatus::Ready;
        let mut rx = agent.subscribe();

        for cycle in 1..=2 {
            let task = {
                let agent = Arc::clone(&agent);
                tokio::spawn(async move {
                    agent
                        .listen_think_respond("user", &hello(), &LineTemplate)
                        .await
                })
            };

            wait_for_pending(&mut rx, "Hi").await;
            assert_eq!(agent.status(), AgentStatus::Processing);

            agent.interrupt().await;
            agent.interrupt().await;

            let result = tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("cycle should end after interrupt")
                .unwrap();
            assert!(matches!(result, Err(AgentError::Interrupted { ref partial }) if partial == "Hi"));
            assert_eq!(calls.interrupts.load(Ordering::SeqCst), cycle);
            assert_eq!(agent.status(), AgentStatus::Ready);
        }
    }

    #[tokio::test]
    async fn test_interrupt_when_idle_is_noop() {
        let (backend, calls) = ScriptedBackend::new(vec!["ok"], Ending::Succeed("ok"));
        let agent = Agent::new("npc-1", "", "S", backend);
        let mut rx = agent.subscribe();

        agent.interrupt().await;
        assert_eq!(agent.status(), AgentStatus::Cold);

        agent
            .listen_think_respond("user", &hello(), &LineTemplate)
            .await
            .unwrap();
        drain(&mut rx);

        agent.interrupt().await;
        assert_eq!(agent.status(), AgentStatus::Ready);
        assert_eq!(calls.interrupts.load(Ordering::SeqCst), 0);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reentrant_calls_are_rejected() {
        let (backend, calls) = ScriptedBackend::new(vec!["Hi"], Ending::WaitForCancel);
        let agent = Arc::new(Agent::new("npc-1", "", "S", backend));
        let mut rx = agent.subscribe();

        let task = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move {
                agent
                    .listen_think_respond("user", &hello(), &LineTemplate)
                    .await
            })
        };
        wait_for_pending(&mut rx, "Hi").await;

        let second = agent
            .listen_think_respond("user", &hello(), &LineTemplate)
            .await;
        assert!(matches!(second, Err(AgentError::Busy { ref agent_id }) if agent_id == "npc-1"));
        assert!(matches!(agent.warmup().await, Err(AgentError::Busy { .. })));
        assert!(agent.set_system_prompt("other").is_err());

        // The rejected calls left the running cycle's state alone.
        assert_eq!(agent.prompt(), "S\nhello\nHi");
        assert_eq!(calls.requests.lock().unwrap().len(), 1);

        agent.interrupt().await;
        let _ = task.await.unwrap();
        assert!(agent.set_system_prompt("other").is_ok());
        assert_eq!(agent.system_prompt(), "other");
    }

    #[tokio::test]
    async fn test_dropped_cycle_settles_status() {
        let (backend, _calls) = ScriptedBackend::new(vec!["Hi"], Ending::WaitForCancel);
        let agent = Agent::new("npc-1", "", "S", backend);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            agent.listen_think_respond("user", &hello(), &LineTemplate),
        )
        .await;
        assert!(abandoned.is_err(), "cycle should still be waiting");

        assert_eq!(agent.status(), AgentStatus::Cold);
        assert_eq!(agent.pending_message(), "Hi");
        assert!(!agent.busy.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_warmup_noop_when_nothing_to_warm() {
        let (backend, calls) = ScriptedBackend::new(vec![], Ending::Fail);
        let agent = Agent::new("npc-1", "", "", backend);
        let mut rx = agent.subscribe();

        agent.warmup().await.unwrap();

        assert_eq!(agent.status(), AgentStatus::Cold);
        assert!(agent.warmup_error().is_none());
        assert!(calls.requests.lock().unwrap().is_empty());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_warmup_success_sets_ready() {
        let (backend, calls) = ScriptedBackend::new(vec![], Ending::Succeed(""));
        let agent = Agent::new("npc-1", "", DEFAULT_SYSTEM_PROMPT, backend);
        agent.state().warmup_error = Some("connection refused".into());

        agent.warmup().await.unwrap();

        assert_eq!(agent.status(), AgentStatus::Ready);
        assert!(agent.warmup_error().is_none(), "stale warmup error must be cleared");

        let requests = calls.requests.lock().unwrap();
        let (prompt, stop, max_tokens, streamed) = &requests[0];
        assert_eq!(prompt, DEFAULT_SYSTEM_PROMPT);
        assert!(stop.is_empty());
        assert_eq!(*max_tokens, Some(WARMUP_MAX_TOKENS));
        assert!(!streamed, "warmup must not stream");
    }

    #[tokio::test]
    async fn test_warmup_failure_records_error() {
        let (backend, calls) = ScriptedBackend::new(vec![], Ending::Fail);
        let agent = Agent::new("npc-1", "previous context", "S", backend);

        agent.warmup().await.unwrap();

        assert_eq!(agent.status(), AgentStatus::Cold);
        let error = agent.warmup_error().unwrap();
        assert!(error.contains("connection refused"), "got: {error}");
        assert_eq!(calls.requests.lock().unwrap()[0].0, "previous context");
        assert_eq!(agent.prompt(), "previous context");
    }

    #[tokio::test]
    async fn test_warmup_failure_after_ready_resets_cold() {
        let (backend, _calls) = ScriptedBackend::new(vec![], Ending::Fail);
        let agent = Agent::new("npc-1", "", "S", backend);
        agent.state().status = AgentStatus::Ready;

        agent.warmup().await.unwrap();
        assert_eq!(agent.status(), AgentStatus::Cold);
        assert!(agent.snapshot().warmup_error.is_some());
    }
}
