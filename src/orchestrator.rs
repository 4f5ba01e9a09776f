//! Sequences a user turn to completion: local tool short-circuit or remote
//! completion call, directive parsing, action execution, and bounded
//! context-augmented follow-up rounds. Enforces single-flight per
//! conversation: a newer send or a navigation cancels the in-flight round
//! trip, and stale results are discarded by generation comparison.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{CompletionBackend, CompletionRequest};
use crate::directives;
use crate::error::BackendError;
use crate::executor::ActionExecutor;
use crate::page::PageDriver;
use crate::spotlight::SpotlightManager;
use crate::types::{Action, ActionKind, ChatMessage, ChatRole, MAX_FOLLOW_UP_ROUNDS};

/// Events fanned out to the widget panel via SSE.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Message { role: ChatRole, content: String },
    Thinking,
    ActionResult {
        kind: ActionKind,
        target: String,
        success: bool,
    },
    TurnError { message: String },
    Ready,
}

/// Ordered conversation history, append-only during an exchange. Optionally
/// mirrored to a JSON transcript file after every change.
pub struct ConversationState {
    messages: Vec<ChatMessage>,
    transcript_path: Option<PathBuf>,
}

impl ConversationState {
    pub fn new(transcript_path: Option<PathBuf>) -> Self {
        let mut state = Self {
            messages: Vec::new(),
            transcript_path,
        };
        state.load();
        state
    }

    fn load(&mut self) {
        let Some(path) = &self.transcript_path else {
            return;
        };
        if let Ok(file) = std::fs::File::open(path) {
            let reader = std::io::BufReader::new(file);
            if let Ok(saved) = serde_json::from_reader::<_, Vec<ChatMessage>>(reader) {
                info!(count = saved.len(), "loaded conversation transcript");
                self.messages = saved;
            }
        }
    }

    fn save(&self) {
        let Some(path) = &self.transcript_path else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(file) = std::fs::File::create(path) {
            let writer = std::io::BufWriter::new(file);
            let _ = serde_json::to_writer_pretty(writer, &self.messages);
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
        self.save();
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn reset(&mut self) {
        self.messages.clear();
        self.save();
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub model: String,
    pub send_page_html: bool,
    pub transcript_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: "solar-pro2".to_string(),
            send_page_html: true,
            transcript_path: None,
        }
    }
}

pub struct Orchestrator {
    driver: Arc<dyn PageDriver>,
    executor: ActionExecutor,
    spotlight: Arc<SpotlightManager>,
    completion: Arc<dyn CompletionBackend>,
    events: broadcast::Sender<AgentEvent>,
    model: String,
    send_page_html: bool,
    state: Mutex<ConversationState>,
    generation: AtomicU64,
    current: StdMutex<Option<CancellationToken>>,
    error_slot: StdMutex<Option<String>>,
}

impl Orchestrator {
    pub fn new(
        driver: Arc<dyn PageDriver>,
        executor: ActionExecutor,
        spotlight: Arc<SpotlightManager>,
        completion: Arc<dyn CompletionBackend>,
        events: broadcast::Sender<AgentEvent>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            driver,
            executor,
            spotlight,
            completion,
            events,
            model: config.model,
            send_page_html: config.send_page_html,
            state: Mutex::new(ConversationState::new(config.transcript_path)),
            generation: AtomicU64::new(0),
            current: StdMutex::new(None),
            error_slot: StdMutex::new(None),
        }
    }

    /// Start a new turn generation, cancelling whatever was in flight.
    fn begin_turn(&self) -> (u64, CancellationToken) {
        let token = CancellationToken::new();
        if let Some(previous) = self.current.lock().unwrap().replace(token.clone()) {
            previous.cancel();
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        (generation, token)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Fire-and-forget entry point for the control loop. The generation is
    /// claimed synchronously so rapid sends cancel each other in order.
    pub fn spawn_user_turn(self: &Arc<Self>, text: String) {
        if text.trim().is_empty() {
            return;
        }
        let (generation, token) = self.begin_turn();
        let this = self.clone();
        tokio::spawn(async move {
            this.run_user_turn(generation, token, &text).await;
        });
    }

    /// Drive one user turn inline (tests use this directly).
    pub async fn handle_user_turn(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let (generation, token) = self.begin_turn();
        self.run_user_turn(generation, token, text).await;
    }

    async fn run_user_turn(&self, generation: u64, token: CancellationToken, text: &str) {
        let text = text.trim();
        info!(generation, "user turn: {text}");
        self.clear_error();
        self.append(generation, ChatRole::User, text).await;

        if let Some(action) = directives::parse_local_command(text) {
            self.run_local_command(generation, &token, &action).await;
        } else {
            self.run_completion_rounds(generation, &token, None).await;
        }
        let _ = self.events.send(AgentEvent::Ready);
    }

    pub fn spawn_navigation_restart(self: &Arc<Self>, url: String) {
        let this = self.clone();
        tokio::spawn(async move {
            this.handle_navigation(&url).await;
        });
    }

    /// A navigation always clears the spotlight; if a conversation is under
    /// way it also aborts the in-flight round trip and restarts from the
    /// current history.
    pub async fn handle_navigation(&self, url: &str) {
        self.spotlight.clear().await;
        if self.state.lock().await.is_empty() {
            return;
        }
        info!(url, "navigation detected, restarting orchestration");
        let (generation, token) = self.begin_turn();
        self.run_completion_rounds(generation, &token, None).await;
        let _ = self.events.send(AgentEvent::Ready);
    }

    /// New top-level task from the intro view: drop history and spotlight.
    pub async fn reset(&self) {
        if let Some(previous) = self.current.lock().unwrap().take() {
            previous.cancel();
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.spotlight.clear().await;
        self.state.lock().await.reset();
        self.clear_error();
        let _ = self.events.send(AgentEvent::Ready);
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().await.messages().to_vec()
    }

    pub fn last_error(&self) -> Option<String> {
        self.error_slot.lock().unwrap().clone()
    }

    async fn run_local_command(&self, generation: u64, token: &CancellationToken, action: &Action) {
        let outcome = self.executor.execute(action).await;
        let _ = self.events.send(AgentEvent::ActionResult {
            kind: outcome.kind,
            target: action.target().to_string(),
            success: outcome.success,
        });

        match action.kind() {
            ActionKind::Retrieve => {
                if let Some(summary) = &outcome.summary {
                    self.append(generation, ChatRole::Assistant, summary).await;
                }
                if let Some(context) = outcome.context {
                    self.run_completion_rounds(generation, token, Some(context))
                        .await;
                }
            }
            kind => {
                let verb = match kind {
                    ActionKind::Highlight => "Highlighted",
                    _ => "Clicked",
                };
                let ack = if outcome.success {
                    format!("✅ {verb} \"{}\"", action.target())
                } else {
                    format!("⚠️ Couldn't find target for \"{}\"", action.target())
                };
                self.append(generation, ChatRole::Assistant, &ack).await;
            }
        }
    }

    /// The completion loop: call the backend with the running history, parse
    /// and execute directives, and follow up (at most `MAX_FOLLOW_UP_ROUNDS`
    /// times) only while actions keep producing retrieval context.
    async fn run_completion_rounds(
        &self,
        generation: u64,
        token: &CancellationToken,
        initial_context: Option<String>,
    ) {
        let _ = self.events.send(AgentEvent::Thinking);
        let mut rag_context = initial_context;

        for round in 0..=MAX_FOLLOW_UP_ROUNDS {
            let messages = self.state.lock().await.messages().to_vec();
            let page_html = if self.send_page_html {
                self.driver.page_html().await.ok()
            } else {
                None
            };
            let request = CompletionRequest {
                messages: &messages,
                model: &self.model,
                page_html: page_html.as_deref(),
                rag_context: rag_context.as_deref(),
            };

            let result = tokio::select! {
                _ = token.cancelled() => Err(BackendError::Cancelled),
                result = self.completion.complete(request) => result,
            };

            let reply = match result {
                Ok(reply) => reply,
                Err(e) if e.is_cancelled() => {
                    debug!(generation, "completion cancelled, discarding");
                    return;
                }
                Err(e) => {
                    warn!(generation, error = %e, "completion failed");
                    if self.is_current(generation) {
                        self.set_error(e.to_string());
                    }
                    return;
                }
            };

            if reply.is_empty() || !self.append(generation, ChatRole::Assistant, &reply).await {
                return;
            }

            let actions = directives::parse_assistant_actions(&reply);
            if actions.is_empty() {
                return;
            }

            rag_context = None;
            for action in &actions {
                if token.is_cancelled() {
                    return;
                }
                let outcome = self.executor.execute(action).await;
                let _ = self.events.send(AgentEvent::ActionResult {
                    kind: outcome.kind,
                    target: action.target().to_string(),
                    success: outcome.success,
                });
                if let Some(summary) = &outcome.summary {
                    self.append(generation, ChatRole::Assistant, summary).await;
                }
                if let Some(context) = outcome.context {
                    rag_context = Some(context);
                }
            }

            if rag_context.is_none() {
                return;
            }
            if round == MAX_FOLLOW_UP_ROUNDS {
                debug!(generation, "follow-up budget exhausted");
            }
        }
    }

    /// Append iff this turn is still the latest; a stale turn's output is
    /// discarded wholesale.
    async fn append(&self, generation: u64, role: ChatRole, content: &str) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.state
            .lock()
            .await
            .push(ChatMessage::new(role, content));
        let _ = self.events.send(AgentEvent::Message {
            role,
            content: content.to_string(),
        });
        true
    }

    fn set_error(&self, message: String) {
        let _ = self.events.send(AgentEvent::TurnError {
            message: message.clone(),
        });
        *self.error_slot.lock().unwrap() = Some(message);
    }

    fn clear_error(&self) {
        *self.error_slot.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{OverlayKind, Rect};
    use crate::spotlight::overlay_frame;
    use crate::testing::{
        chunk, visible_element, FakePage, FailingCompletion, HangingCompletion,
        ScriptedCompletion, ScriptedRetrieval,
    };
    use crate::backend::RetrievalBackend;
    use std::time::Duration;

    fn harness(
        page: Arc<FakePage>,
        completion: Arc<dyn CompletionBackend>,
        retrieval: Arc<dyn RetrievalBackend>,
        send_page_html: bool,
    ) -> Arc<Orchestrator> {
        let spotlight = Arc::new(SpotlightManager::new(page.clone()));
        let executor = ActionExecutor::new(page.clone(), spotlight.clone(), retrieval);
        let (events, _) = broadcast::channel(64);
        Arc::new(Orchestrator::new(
            page,
            executor,
            spotlight,
            completion,
            events,
            OrchestratorConfig {
                model: "solar-pro2".into(),
                send_page_html,
                transcript_path: None,
            },
        ))
    }

    #[tokio::test]
    async fn plain_reply_makes_exactly_one_call() {
        let page = Arc::new(FakePage::new(vec![]));
        let completion = Arc::new(ScriptedCompletion::with_replies(vec![
            "Happy to help!".into(),
        ]));
        let orch = harness(page, completion.clone(), Arc::new(ScriptedRetrieval::empty()), false);

        orch.handle_user_turn("What does tenant insurance cover?")
            .await;

        assert_eq!(completion.call_count(), 1);
        let messages = orch.messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Happy to help!");
    }

    #[tokio::test]
    async fn retrieve_directive_triggers_one_follow_up() {
        let page = Arc::new(FakePage::new(vec![]));
        let completion = Arc::new(ScriptedCompletion::with_replies(vec![
            "Let me check.\nACTION RETRIEVE cancellation policy".into(),
            "You can cancel within 30 days.".into(),
        ]));
        let retrieval = Arc::new(ScriptedRetrieval::with_chunks(vec![chunk(
            "doc-1",
            "Cancellation takes 30 days.",
            0.9,
        )]));
        let orch = harness(page, completion.clone(), retrieval, false);

        orch.handle_user_turn("what is the cancellation policy?")
            .await;

        assert_eq!(completion.call_count(), 2);
        let contexts = completion.recorded_contexts();
        assert_eq!(contexts[0], None);
        assert!(contexts[1]
            .as_deref()
            .unwrap()
            .starts_with("RAG_CONTEXT Query: cancellation policy"));
        // the follow-up call sees the reply and the retrieval summary
        let counts = completion.recorded_message_counts();
        assert!(counts[1] > counts[0]);
    }

    #[tokio::test]
    async fn follow_up_rounds_are_bounded() {
        let page = Arc::new(FakePage::new(vec![]));
        let completion = Arc::new(ScriptedCompletion::always(
            "ACTION RETRIEVE more context please",
        ));
        let retrieval = Arc::new(ScriptedRetrieval::with_chunks(vec![chunk(
            "doc-1", "chunk", 0.5,
        )]));
        let orch = harness(page, completion.clone(), retrieval, false);

        orch.handle_user_turn("tell me everything").await;

        assert_eq!(completion.call_count(), 1 + MAX_FOLLOW_UP_ROUNDS);
    }

    #[tokio::test]
    async fn local_highlight_skips_the_backend() {
        let page = Arc::new(FakePage::new(vec![visible_element(
            "quote",
            "button",
            "Get a Quote",
        )]));
        let completion = Arc::new(ScriptedCompletion::with_replies(vec![]));
        let orch = harness(page.clone(), completion.clone(), Arc::new(ScriptedRetrieval::empty()), false);

        orch.handle_user_turn("highlight \"Get a Quote\"").await;

        assert_eq!(completion.call_count(), 0);
        let messages = orch.messages().await;
        assert_eq!(messages[1].content, "✅ Highlighted \"Get a Quote\"");
        assert_eq!(page.overlay_kinds(), vec![OverlayKind::Spotlight]);
    }

    #[tokio::test]
    async fn local_highlight_miss_acknowledges_failure() {
        let page = Arc::new(FakePage::new(vec![]));
        let completion = Arc::new(ScriptedCompletion::with_replies(vec![]));
        let orch = harness(page, completion.clone(), Arc::new(ScriptedRetrieval::empty()), false);

        orch.handle_user_turn("highlight \"Missing Thing\"").await;

        assert_eq!(completion.call_count(), 0);
        let messages = orch.messages().await;
        assert_eq!(
            messages[1].content,
            "⚠️ Couldn't find target for \"Missing Thing\""
        );
    }

    #[tokio::test]
    async fn local_click_performs_a_real_click() {
        let page = Arc::new(FakePage::new(vec![visible_element(
            "start",
            "button",
            "Start Building",
        )]));
        let completion = Arc::new(ScriptedCompletion::with_replies(vec![]));
        let orch = harness(page.clone(), completion.clone(), Arc::new(ScriptedRetrieval::empty()), false);

        orch.handle_user_turn("click 'Start Building'").await;

        assert_eq!(completion.call_count(), 0);
        assert_eq!(page.clicked_ids(), vec!["start".to_string()]);
        assert_eq!(
            orch.messages().await[1].content,
            "✅ Clicked \"Start Building\""
        );
    }

    #[tokio::test]
    async fn local_retrieve_summarizes_then_follows_up() {
        let page = Arc::new(FakePage::new(vec![]));
        let completion = Arc::new(ScriptedCompletion::with_replies(vec![
            "Based on the documents, you can cancel anytime.".into(),
        ]));
        let retrieval = Arc::new(ScriptedRetrieval::with_chunks(vec![
            chunk("doc-1", "Coverage includes water damage.", 0.91),
            chunk("doc-2", "Claims are filed online.", 0.82),
            chunk("doc-3", "Cancellation takes 30 days.", 0.77),
        ]));
        let orch = harness(page, completion.clone(), retrieval, false);

        orch.handle_user_turn("retrieve cancellation policy").await;

        let messages = orch.messages().await;
        assert_eq!(messages.len(), 3);
        let summary = &messages[1].content;
        assert!(summary.contains("RAG_BLOCK_START"));
        assert!(summary.contains("RAG_BLOCK_END"));
        assert_eq!(summary.matches("\n- [").count(), 3);

        assert_eq!(completion.call_count(), 1);
        let context = completion.recorded_contexts()[0].clone().unwrap();
        assert!(context.starts_with("RAG_CONTEXT Query: cancellation policy"));
        assert_eq!(context.matches("\n[").count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_call_appends_nothing_and_sets_no_error() {
        let page = Arc::new(FakePage::new(vec![visible_element(
            "plans", "a", "Plans",
        )]));
        let completion = Arc::new(HangingCompletion::new());
        let orch = harness(page, completion.clone(), Arc::new(ScriptedRetrieval::empty()), false);

        let first = orch.clone();
        let handle = tokio::spawn(async move {
            first.handle_user_turn("summarize this page").await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(completion.call_count(), 1);

        // a fresh local command aborts the in-flight completion
        orch.handle_user_turn("highlight 'Plans'").await;
        handle.await.unwrap();

        let messages = orch.messages().await;
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "summarize this page",
                "highlight 'Plans'",
                "✅ Highlighted \"Plans\"",
            ]
        );
        assert!(orch.last_error().is_none());
    }

    #[tokio::test]
    async fn backend_failure_fills_the_error_slot() {
        let page = Arc::new(FakePage::new(vec![]));
        let orch = harness(
            page,
            Arc::new(FailingCompletion::new("backend exploded")),
            Arc::new(ScriptedRetrieval::empty()),
            false,
        );

        orch.handle_user_turn("hello?").await;

        assert_eq!(orch.messages().await.len(), 1);
        assert!(orch.last_error().unwrap().contains("backend exploded"));
    }

    #[tokio::test]
    async fn navigation_clears_spotlight_and_restarts_from_history() {
        let page = Arc::new(FakePage::new(vec![visible_element("go", "a", "Go")]));
        let completion = Arc::new(ScriptedCompletion::with_replies(vec![
            "ACTION SPOTLIGHT Go".into(),
            "Welcome back.".into(),
        ]));
        let orch = harness(page.clone(), completion.clone(), Arc::new(ScriptedRetrieval::empty()), false);

        orch.handle_user_turn("show me where to go").await;
        assert_eq!(page.overlay_count(), 1);

        orch.handle_navigation("https://example.test/plans").await;

        assert_eq!(page.overlay_count(), 0);
        assert_eq!(completion.call_count(), 2);
        assert_eq!(orch.messages().await.last().unwrap().content, "Welcome back.");
    }

    #[tokio::test]
    async fn navigation_without_history_is_a_no_op() {
        let page = Arc::new(FakePage::new(vec![]));
        let completion = Arc::new(ScriptedCompletion::with_replies(vec![]));
        let orch = harness(page, completion.clone(), Arc::new(ScriptedRetrieval::empty()), false);

        orch.handle_navigation("https://example.test/").await;

        assert_eq!(completion.call_count(), 0);
        assert!(orch.messages().await.is_empty());
    }

    #[tokio::test]
    async fn page_html_rides_along_when_enabled() {
        let page = Arc::new(FakePage::new(vec![]));
        page.set_html("<body>plans page</body>");
        let completion = Arc::new(ScriptedCompletion::with_replies(vec!["Hi.".into()]));
        let orch = harness(page, completion.clone(), Arc::new(ScriptedRetrieval::empty()), true);

        orch.handle_user_turn("hello").await;

        let html = completion.recorded_page_html()[0].clone().unwrap();
        assert!(html.contains("plans page"));
    }

    #[tokio::test]
    async fn reset_drops_history_and_spotlight() {
        let page = Arc::new(FakePage::new(vec![visible_element("go", "a", "Go")]));
        let completion = Arc::new(ScriptedCompletion::with_replies(vec![
            "ACTION SPOTLIGHT Go".into(),
        ]));
        let orch = harness(page.clone(), completion, Arc::new(ScriptedRetrieval::empty()), false);

        orch.handle_user_turn("show me where to go").await;
        assert_eq!(page.overlay_count(), 1);

        orch.reset().await;
        assert!(orch.messages().await.is_empty());
        assert_eq!(page.overlay_count(), 0);
    }

    /// End to end: a spotlight directive in the reply anchors exactly one
    /// overlay to the target's rect with the fixed inset.
    #[tokio::test]
    async fn spotlight_scenario_end_to_end() {
        let mut agent = visible_element("austin", "a", "Austin, TX");
        agent.rect = Rect::new(100.0, 200.0, 80.0, 30.0);
        let page = Arc::new(FakePage::new(vec![agent.clone()]));
        let completion = Arc::new(ScriptedCompletion::with_replies(vec![
            "Sure thing!\nACTION SPOTLIGHT Austin, TX".into(),
        ]));
        let orch = harness(page.clone(), completion.clone(), Arc::new(ScriptedRetrieval::empty()), false);

        orch.handle_user_turn("Find the phone number of Austin, TX agent")
            .await;

        assert_eq!(completion.call_count(), 1);
        assert_eq!(page.scrolled_ids(), vec!["austin".to_string()]);
        assert_eq!(page.overlay_count(), 1);
        assert_eq!(page.overlay_kinds(), vec![OverlayKind::Spotlight]);
        assert_eq!(page.overlay_frames()[0], overlay_frame(&agent.rect, ""));
    }

    #[tokio::test]
    async fn transcript_round_trips_through_disk() {
        let path = std::env::temp_dir().join(format!(
            "pagemate-transcript-{}-{:?}.json",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_file(&path);

        let mut state = ConversationState::new(Some(path.clone()));
        state.push(ChatMessage::new(ChatRole::User, "hello"));
        state.push(ChatMessage::new(ChatRole::Assistant, "hi"));

        let reloaded = ConversationState::new(Some(path.clone()));
        assert_eq!(reloaded.messages().len(), 2);
        assert_eq!(reloaded.messages()[1].content, "hi");

        let _ = std::fs::remove_file(&path);
    }
}
