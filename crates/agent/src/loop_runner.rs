//! The request loop.
//!
//! One call to [`RequestLoop::run`] drives a user request to a terminal state:
//!
//! ```text
//! AwaitingModel → Parsing → (Executing → AwaitingModel)* → Done | Failed | Cancelled
//! ```
//!
//! Each cycle sends the whole conversation to the model client, parses the
//! reply into tool calls, runs them in order and appends the assistant text
//! followed by one consolidated tool-results message. A reply with no calls is
//! the final answer. The job's cancellation token is checked before the model
//! call and before every tool, and raced against both while they are in flight.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use ferrule_config::AgentConfig;
use ferrule_core::event::{DomainEvent, EventBus};
use ferrule_core::message::Message;
use ferrule_core::provider::{ChatOptions, ChatReply, ChunkCallback, ModelClient, Usage};
use ferrule_core::tool::{ToolCall, ToolRegistry, ToolResult};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancel::CancellationRegistry;
use crate::parser;
use crate::session::Session;
use crate::transcript::{ToolOutcome, tool_results_message};

/// Loop limits and defaults.
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    pub max_iterations: u32,
    pub auto_optimize: bool,
    pub stream: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

impl From<&AgentConfig> for LoopConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            max_iterations: config.max_iterations.max(1),
            auto_optimize: config.auto_optimize,
            stream: config.stream,
        }
    }
}

/// Per-request options.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Job id to register; a fresh UUID when absent
    pub job_id: Option<String>,
    /// Overrides [`LoopConfig::stream`]
    pub stream: Option<bool>,
    pub on_chunk: Option<ChunkCallback>,
    pub preferred_provider: Option<String>,
}

/// A tool that ran during the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolUsage {
    pub name: String,
    pub success: bool,
}

/// A finished request.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub response: String,
    pub iterations: u32,
    pub tools_used: Vec<ToolUsage>,
    pub processing_time_ms: u64,
    pub provider: String,
    pub model: String,
    pub fallback_used: bool,
    pub original_provider: Option<String>,
    /// Summed over every model call of the request
    pub usage: Option<Usage>,
}

/// Terminal state of a request. The loop never returns `Err`.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Done(RunReport),
    Failed {
        error: String,
        provider: Option<String>,
        iterations: u32,
    },
    Cancelled {
        iterations: u32,
    },
}

impl RunOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn iterations(&self) -> u32 {
        match self {
            Self::Done(report) => report.iterations,
            Self::Failed { iterations, .. } | Self::Cancelled { iterations } => *iterations,
        }
    }

    /// The JSON result envelope handed to front-ends.
    pub fn envelope(&self) -> Value {
        match self {
            Self::Done(report) => {
                let mut envelope = json!({
                    "success": true,
                    "response": report.response,
                    "iterations": report.iterations,
                    "toolsUsed": report.tools_used,
                    "processingTime": report.processing_time_ms,
                    "provider": report.provider,
                    "fallbackUsed": report.fallback_used,
                });
                if let Some(original) = &report.original_provider {
                    envelope["originalProvider"] = json!(original);
                }
                envelope
            }
            Self::Failed {
                error, provider, ..
            } => {
                let mut envelope = json!({ "success": false, "error": error });
                if let Some(provider) = provider {
                    envelope["provider"] = json!(provider);
                }
                envelope
            }
            Self::Cancelled { .. } => json!({
                "success": false,
                "cancelled": true,
                "error": "cancelled",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    AwaitingModel,
    Parsing,
    Executing,
    Done,
    Failed,
    Cancelled,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AwaitingModel => "awaiting_model",
            Self::Parsing => "parsing",
            Self::Executing => "executing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Orchestrates model calls and tool execution for one session at a time.
pub struct RequestLoop {
    client: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    registry: Arc<CancellationRegistry>,
    events: Arc<EventBus>,
    config: LoopConfig,
}

/// Mutable bookkeeping for one request.
struct Run {
    job_id: String,
    started: Instant,
    iteration: u32,
    tools_used: Vec<ToolUsage>,
    usage: Option<Usage>,
    last_provider: Option<String>,
}

impl Run {
    fn transition(&self, state: LoopState) {
        debug!(job_id = %self.job_id, iteration = self.iteration, state = %state, "Loop state");
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn add_usage(&mut self, usage: Option<Usage>) {
        let Some(usage) = usage else { return };
        let total = self.usage.get_or_insert_with(Usage::default);
        total.prompt_tokens += usage.prompt_tokens;
        total.completion_tokens += usage.completion_tokens;
        total.total_tokens += usage.total_tokens;
    }
}

impl RequestLoop {
    pub fn new(
        client: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        registry: Arc<CancellationRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            client,
            tools,
            registry,
            events,
            config: LoopConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.registry
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Process one user input against a session.
    pub async fn run(&self, session: &mut Session, input: &str, options: RunOptions) -> RunOutcome {
        let job_id = options
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let guard = self
            .registry
            .create_guarded(job_id.clone(), json!({ "session": session.id }));
        let token = guard.token();

        let mut run = Run {
            job_id,
            started: Instant::now(),
            iteration: 0,
            tools_used: Vec::new(),
            usage: None,
            last_provider: None,
        };

        info!(
            job_id = %run.job_id,
            session_id = %session.id,
            messages = session.conversation.messages.len(),
            "Processing request"
        );
        self.events.publish(DomainEvent::RequestStarted {
            job_id: run.job_id.clone(),
            conversation_id: session.conversation.id.to_string(),
            timestamp: Utc::now(),
        });

        session.conversation.push(Message::user(input));
        let stream = options.stream.unwrap_or(self.config.stream);

        loop {
            run.iteration += 1;
            if run.iteration > self.config.max_iterations {
                run.iteration -= 1;
                let provider = run.last_provider.clone();
                return self.fail(&run, "maximum iterations reached".into(), provider);
            }
            if token.is_cancelled() {
                run.iteration -= 1;
                return self.cancelled(&run);
            }

            // ── Model call ──
            run.transition(LoopState::AwaitingModel);
            let chat_options = ChatOptions {
                stream,
                on_chunk: if stream { options.on_chunk.clone() } else { None },
                cancel: token.clone(),
                preferred_provider: options.preferred_provider.clone(),
            };
            let call_started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return self.cancelled(&run),
                result = self.client.chat(&session.conversation.messages, chat_options) => result,
            };

            let reply = match result {
                Ok(reply) => reply,
                Err(e) if e.is_cancelled() => return self.cancelled(&run),
                Err(e) => {
                    let provider = Some(self.client.active_provider());
                    return self.fail(&run, e.to_string(), provider);
                }
            };

            let duration_ms = call_started.elapsed().as_millis() as u64;
            info!(
                job_id = %run.job_id,
                iteration = run.iteration,
                provider = %reply.provider,
                model = %reply.model,
                fallback_used = reply.fallback_used,
                duration_ms,
                "Model replied"
            );
            self.events.publish(DomainEvent::ModelCalled {
                job_id: run.job_id.clone(),
                iteration: run.iteration,
                provider: reply.provider.clone(),
                model: reply.model.clone(),
                fallback_used: reply.fallback_used,
                tokens_used: reply.usage.map(|u| u.total_tokens),
                duration_ms,
                timestamp: Utc::now(),
            });
            run.add_usage(reply.usage);
            run.last_provider = Some(reply.provider.clone());

            // ── Parse ──
            run.transition(LoopState::Parsing);
            let parsed = parser::parse_detailed(&reply.message.content);
            if !parsed.rejected.is_empty() {
                warn!(
                    job_id = %run.job_id,
                    rejected = parsed.rejected.len(),
                    accepted = parsed.calls.len(),
                    "Reply contained malformed tool-call blocks"
                );
            }

            let assistant = reply
                .message
                .clone()
                .with_usage(reply.usage)
                .with_metadata("provider", json!(reply.provider));

            if parsed.calls.is_empty() {
                let response = assistant.content.clone();
                session.conversation.push(assistant);
                // After a plain answer, optimize only once history outgrows the threshold
                if self.config.auto_optimize
                    && session.optimizer().needs_summary(&session.conversation)
                {
                    self.auto_optimize(session);
                }
                run.transition(LoopState::Done);
                return self.done(&run, response, &reply);
            }

            // ── Execute ──
            run.transition(LoopState::Executing);
            let (outcomes, interrupted) = self.execute_calls(&mut run, &parsed.calls, &token).await;

            session.conversation.push(assistant);
            session.conversation.push(tool_results_message(&outcomes));

            if interrupted {
                return self.cancelled(&run);
            }

            if self.config.auto_optimize {
                self.auto_optimize(session);
            }
        }
    }

    fn auto_optimize(&self, session: &mut Session) {
        let report = session.optimize();
        if report.optimized {
            self.events.publish(DomainEvent::ContextOptimized {
                conversation_id: session.conversation.id.to_string(),
                messages_removed: report.pruned + report.summarized,
                summary_lines: report.stats.summary_lines,
                timestamp: Utc::now(),
            });
        }
    }

    /// Run calls in order. Returns the outcomes and whether cancellation cut
    /// the cycle short.
    async fn execute_calls(
        &self,
        run: &mut Run,
        calls: &[ToolCall],
        token: &tokio_util::sync::CancellationToken,
    ) -> (Vec<ToolOutcome>, bool) {
        let mut outcomes = Vec::with_capacity(calls.len());

        for call in calls {
            if token.is_cancelled() {
                outcomes.push(ToolOutcome::new(&call.action, cancelled_result()));
                return (outcomes, true);
            }

            debug!(job_id = %run.job_id, action = %call.action, "Executing tool");
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = self.tools.execute(call) => Some(result),
            };
            let Some(result) = result else {
                outcomes.push(ToolOutcome::new(&call.action, cancelled_result()));
                return (outcomes, true);
            };

            let duration_ms = started.elapsed().as_millis() as u64;
            if !result.success {
                warn!(
                    job_id = %run.job_id,
                    action = %call.action,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Tool reported failure"
                );
            }
            self.events.publish(DomainEvent::ToolExecuted {
                job_id: run.job_id.clone(),
                iteration: run.iteration,
                tool_name: call.action.clone(),
                success: result.success,
                duration_ms,
                timestamp: Utc::now(),
            });

            run.tools_used.push(ToolUsage {
                name: call.action.clone(),
                success: result.success,
            });
            outcomes.push(ToolOutcome::new(&call.action, result));
        }

        (outcomes, false)
    }

    fn done(&self, run: &Run, response: String, reply: &ChatReply) -> RunOutcome {
        let processing_time_ms = run.elapsed_ms();
        info!(
            job_id = %run.job_id,
            iterations = run.iteration,
            tools = run.tools_used.len(),
            duration_ms = processing_time_ms,
            "Request completed"
        );
        self.events.publish(DomainEvent::RequestCompleted {
            job_id: run.job_id.clone(),
            iterations: run.iteration,
            duration_ms: processing_time_ms,
            timestamp: Utc::now(),
        });

        RunOutcome::Done(RunReport {
            response,
            iterations: run.iteration,
            tools_used: run.tools_used.clone(),
            processing_time_ms,
            provider: reply.provider.clone(),
            model: reply.model.clone(),
            fallback_used: reply.fallback_used,
            original_provider: reply.original_provider.clone(),
            usage: run.usage,
        })
    }

    fn fail(&self, run: &Run, error: String, provider: Option<String>) -> RunOutcome {
        run.transition(LoopState::Failed);
        error!(job_id = %run.job_id, iterations = run.iteration, error = %error, "Request failed");
        self.events.publish(DomainEvent::ErrorOccurred {
            context: format!("request {}", run.job_id),
            error_message: error.clone(),
            timestamp: Utc::now(),
        });
        RunOutcome::Failed {
            error,
            provider,
            iterations: run.iteration,
        }
    }

    fn cancelled(&self, run: &Run) -> RunOutcome {
        run.transition(LoopState::Cancelled);
        info!(job_id = %run.job_id, iterations = run.iteration, "Request cancelled");
        self.events.publish(DomainEvent::RequestCancelled {
            job_id: run.job_id.clone(),
            iterations: run.iteration,
            timestamp: Utc::now(),
        });
        RunOutcome::Cancelled {
            iterations: run.iteration,
        }
    }
}

fn cancelled_result() -> ToolResult {
    ToolResult::failure("cancelled").with("cancelled", true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use ferrule_config::OptimizerConfig;
    use ferrule_core::error::{ProviderError, ToolError};
    use ferrule_core::message::Role;
    use ferrule_core::tool::Tool;
    use serde_json::Map;

    use crate::transcript::{is_tool_results, tool_outcomes};

    /// Replies from a script; repeats the last entry once the script runs out.
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<String, ProviderError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<String, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        fn active_provider(&self) -> String {
            "scripted".into()
        }

        async fn chat(&self, _messages: &[Message], options: ChatOptions) -> Result<ChatReply, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front().unwrap()
                } else {
                    script.front().cloned().unwrap()
                }
            };
            let text = next?;
            if options.stream
                && let Some(on_chunk) = &options.on_chunk
            {
                for piece in text.split_inclusive(' ') {
                    on_chunk(piece);
                }
            }
            Ok(ChatReply {
                message: Message::assistant(text),
                usage: Some(Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                }),
                provider: "scripted".into(),
                model: "script-1".into(),
                fallback_used: false,
                original_provider: None,
            })
        }
    }

    /// Never replies; resolves only when cancelled.
    struct HangingClient;

    #[async_trait]
    impl ModelClient for HangingClient {
        fn active_provider(&self) -> String {
            "hanging".into()
        }

        async fn chat(&self, _messages: &[Message], options: ChatOptions) -> Result<ChatReply, ProviderError> {
            options.cancel.cancelled().await;
            Err(ProviderError::Cancelled)
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo text back"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, parameters: &Map<String, Value>) -> Result<ToolResult, ToolError> {
            let text = parameters.get("text").and_then(Value::as_str).unwrap_or("");
            Ok(ToolResult::ok().with("message", text))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Takes a long time"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _parameters: &Map<String, Value>) -> Result<ToolResult, ToolError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ToolResult::ok())
        }
    }

    fn tools() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        registry.register(Box::new(SlowTool));
        Arc::new(registry)
    }

    fn request_loop(client: Arc<dyn ModelClient>) -> RequestLoop {
        RequestLoop::new(
            client,
            tools(),
            Arc::new(CancellationRegistry::new()),
            Arc::new(EventBus::default()),
        )
        .with_config(LoopConfig {
            max_iterations: 4,
            auto_optimize: false,
            stream: false,
        })
    }

    fn session() -> Session {
        Session::new("test", "system rules", &OptimizerConfig::default())
    }

    const ECHO_CALL: &str = "THINKING: say hi\nACTION: echo\nPARAMETERS: {\"text\": \"hi\"}";

    #[tokio::test]
    async fn plain_reply_finishes_in_one_iteration() {
        let client = ScriptedClient::new(vec![Ok("Hello there.".into())]);
        let agent = request_loop(client.clone());
        let mut session = session();

        let outcome = agent.run(&mut session, "hi", RunOptions::default()).await;
        let RunOutcome::Done(report) = outcome else {
            panic!("expected Done");
        };
        assert_eq!(report.response, "Hello there.");
        assert_eq!(report.iterations, 1);
        assert!(report.tools_used.is_empty());
        assert_eq!(report.usage.unwrap().total_tokens, 15);
        assert_eq!(client.calls(), 1);

        // system, user, assistant
        let roles: Vec<Role> = session.conversation.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn tool_cycle_then_answer() {
        let client = ScriptedClient::new(vec![Ok(ECHO_CALL.into()), Ok("Done: hi".into())]);
        let agent = request_loop(client.clone());
        let mut session = session();

        let outcome = agent.run(&mut session, "echo hi", RunOptions::default()).await;
        let RunOutcome::Done(report) = outcome else {
            panic!("expected Done");
        };
        assert_eq!(report.iterations, 2);
        assert_eq!(
            report.tools_used,
            vec![ToolUsage {
                name: "echo".into(),
                success: true
            }]
        );
        assert_eq!(report.usage.unwrap().total_tokens, 30);

        // The assistant call is immediately followed by its results
        let messages = &session.conversation.messages;
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(messages[2].content, ECHO_CALL);
        assert!(is_tool_results(&messages[3]));
        assert_eq!(tool_outcomes(&messages[3])[0].result.get("message"), Some(&json!("hi")));
        assert_eq!(messages[4].content, "Done: hi");
    }

    #[tokio::test]
    async fn multiple_calls_run_in_order() {
        let reply = "ACTION: echo\nPARAMETERS: {\"text\": \"one\"}\nACTION: nope\nPARAMETERS: {}\nACTION: echo\nPARAMETERS: {\"text\": \"two\"}";
        let client = ScriptedClient::new(vec![Ok(reply.into()), Ok("ok".into())]);
        let agent = request_loop(client);
        let mut session = session();

        let RunOutcome::Done(report) = agent.run(&mut session, "go", RunOptions::default()).await else {
            panic!("expected Done");
        };
        let names: Vec<_> = report.tools_used.iter().map(|t| (t.name.as_str(), t.success)).collect();
        assert_eq!(names, vec![("echo", true), ("nope", false), ("echo", true)]);

        let outcomes = tool_outcomes(&session.conversation.messages[3]);
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[1].result.error.as_deref().unwrap().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn always_tool_fails_after_max_iterations() {
        let client = ScriptedClient::new(vec![Ok(ECHO_CALL.into())]);
        let agent = request_loop(client.clone());
        let mut session = session();

        let outcome = agent.run(&mut session, "loop forever", RunOptions::default()).await;
        match &outcome {
            RunOutcome::Failed {
                error,
                provider,
                iterations,
            } => {
                assert_eq!(error, "maximum iterations reached");
                assert_eq!(provider.as_deref(), Some("scripted"));
                assert_eq!(*iterations, 4);
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(client.calls(), 4);
        // system + user + 4 × (assistant, results)
        assert_eq!(session.conversation.messages.len(), 10);
    }

    #[tokio::test]
    async fn provider_error_fails_immediately() {
        let client = ScriptedClient::new(vec![Err(ProviderError::Network("refused".into()))]);
        let agent = request_loop(client.clone());
        let mut session = session();

        let outcome = agent.run(&mut session, "hi", RunOptions::default()).await;
        let envelope = outcome.envelope();
        assert_eq!(envelope["success"], json!(false));
        assert!(envelope["error"].as_str().unwrap().contains("refused"));
        assert_eq!(envelope["provider"], json!("scripted"));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn cancel_during_model_call() {
        let agent = request_loop(Arc::new(HangingClient));
        let registry = agent.registry().clone();
        let mut session = session();

        let canceller = tokio::spawn(async move {
            while !registry.cancel("job-1") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let options = RunOptions {
            job_id: Some("job-1".into()),
            ..RunOptions::default()
        };
        let outcome = agent.run(&mut session, "hi", options).await;
        canceller.await.unwrap();

        assert!(outcome.is_cancelled());
        assert_eq!(
            outcome.envelope(),
            json!({"success": false, "cancelled": true, "error": "cancelled"})
        );
        // Only the user message was added
        assert_eq!(session.conversation.messages.len(), 2);
        assert!(!agent.registry().has("job-1"));
    }

    #[tokio::test]
    async fn cancel_during_tool_keeps_alternation() {
        let reply = "ACTION: echo\nPARAMETERS: {\"text\": \"a\"}\nACTION: slow\nPARAMETERS: {}\nACTION: echo\nPARAMETERS: {\"text\": \"b\"}";
        let client = ScriptedClient::new(vec![Ok(reply.into())]);
        let agent = request_loop(client);
        let registry = agent.registry().clone();
        let mut session = session();

        let events = agent.events.subscribe();
        let canceller = tokio::spawn(async move {
            let mut events = events;
            // Wait for the first tool to finish, then cancel while `slow` runs
            while let Ok(event) = events.recv().await {
                if matches!(event.as_ref(), DomainEvent::ToolExecuted { .. }) {
                    registry.cancel("job-2");
                    break;
                }
            }
        });

        let options = RunOptions {
            job_id: Some("job-2".into()),
            ..RunOptions::default()
        };
        let outcome = agent.run(&mut session, "go", options).await;
        canceller.await.unwrap();

        assert!(outcome.is_cancelled());
        let messages = &session.conversation.messages;
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].role, Role::Assistant);
        let outcomes = tool_outcomes(&messages[3]);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].result.success);
        assert_eq!(outcomes[1].action, "slow");
        assert_eq!(outcomes[1].result.get("cancelled"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn streaming_forwards_chunks() {
        let client = ScriptedClient::new(vec![Ok("streamed final answer".into())]);
        let agent = request_loop(client);
        let mut session = session();

        let seen = Arc::new(Mutex::new(String::new()));
        let sink = seen.clone();
        let options = RunOptions {
            stream: Some(true),
            on_chunk: Some(Arc::new(move |chunk: &str| sink.lock().unwrap().push_str(chunk))),
            ..RunOptions::default()
        };
        let outcome = agent.run(&mut session, "hi", options).await;
        assert!(outcome.is_done());
        assert_eq!(*seen.lock().unwrap(), "streamed final answer");
    }

    #[tokio::test]
    async fn events_cover_the_request() {
        let client = ScriptedClient::new(vec![Ok(ECHO_CALL.into()), Ok("bye".into())]);
        let agent = request_loop(client);
        let mut rx = agent.events.subscribe();
        let mut session = session();

        agent.run(&mut session, "hi", RunOptions::default()).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            let name = serde_json::to_value(event.as_ref()).unwrap()["event"]
                .as_str()
                .unwrap()
                .to_string();
            kinds.push(name);
        }
        assert_eq!(
            kinds,
            vec![
                "request_started",
                "model_called",
                "tool_executed",
                "model_called",
                "request_completed"
            ]
        );
    }

    #[tokio::test]
    async fn auto_optimize_prunes_repeated_listing() {
        struct ListTool;

        #[async_trait]
        impl Tool for ListTool {
            fn name(&self) -> &str {
                "list_directory"
            }
            fn description(&self) -> &str {
                "List"
            }
            fn parameters_schema(&self) -> Value {
                json!({"type": "object"})
            }
            async fn execute(&self, _parameters: &Map<String, Value>) -> Result<ToolResult, ToolError> {
                Ok(ToolResult::ok().with("directory", "."))
            }
        }

        let list = "ACTION: list_directory\nPARAMETERS: {\"path\": \".\"}";
        let client = ScriptedClient::new(vec![
            Ok(list.into()),
            Ok(list.into()),
            Ok(list.into()),
            Ok("three files".into()),
        ]);
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(ListTool));
        let agent = RequestLoop::new(
            client,
            Arc::new(registry),
            Arc::new(CancellationRegistry::new()),
            Arc::new(EventBus::default()),
        )
        .with_config(LoopConfig {
            max_iterations: 10,
            auto_optimize: true,
            stream: false,
        });
        let mut session = session();

        let outcome = agent.run(&mut session, "list", RunOptions::default()).await;
        assert!(outcome.is_done());
        // The oldest pair goes; a second removal would breach the five-message floor
        let messages = &session.conversation.messages;
        assert_eq!(messages.len(), 7);
        let calls = messages
            .iter()
            .filter(|m| m.role == Role::Assistant && m.content.starts_with("ACTION"))
            .count();
        assert_eq!(calls, 2);
        assert_eq!(session.optimizer().stats().messages_removed, 2);
    }

    #[test]
    fn done_envelope_shape() {
        let outcome = RunOutcome::Done(RunReport {
            response: "hi".into(),
            iterations: 2,
            tools_used: vec![ToolUsage {
                name: "list_directory".into(),
                success: true,
            }],
            processing_time_ms: 12,
            provider: "ollama".into(),
            model: "llama3".into(),
            fallback_used: true,
            original_provider: Some("openrouter".into()),
            usage: None,
        });
        let envelope = outcome.envelope();
        assert_eq!(envelope["success"], json!(true));
        assert_eq!(envelope["toolsUsed"], json!([{"name": "list_directory", "success": true}]));
        assert_eq!(envelope["fallbackUsed"], json!(true));
        assert_eq!(envelope["originalProvider"], json!("openrouter"));
        assert_eq!(envelope["processingTime"], json!(12));
        assert_eq!(outcome.iterations(), 2);
    }
}
