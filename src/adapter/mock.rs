//! Mock adapter for tests.
//!
//! Returns scripted behaviors without spawning subprocesses: configurable
//! output, exit code, token counts, latency, and optional tool-call
//! events. Behaviors are consumed FIFO; when the queue runs dry the
//! default behavior applies. Every [`RunConfig`] is recorded for
//! assertions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Adapter, AdapterEvent, PermissionSet, RunConfig, RunResult, TokenUsage};
use crate::error::WaveError;

/// One scripted invocation outcome.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub output: String,
    pub exit_code: i32,
    pub tokens: u64,
    pub latency: Duration,
    /// Tool calls to surface before completing.
    pub tool_calls: Vec<(String, Value)>,
    /// Workspace-relative files the "agent" writes before exiting, the
    /// way a real CLI would produce declared artifacts.
    pub files: Vec<(String, String)>,
    /// When false, no protocol events are emitted at all - combined with
    /// exit 0 this reproduces the protocol-violation case.
    pub emit_events: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            output: "mock output".to_string(),
            exit_code: 0,
            tokens: 100,
            latency: Duration::ZERO,
            tool_calls: vec![],
            files: vec![],
            emit_events: true,
        }
    }
}

impl MockBehavior {
    pub fn output(text: impl Into<String>) -> Self {
        Self {
            output: text.into(),
            ..Default::default()
        }
    }

    pub fn failing(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Default::default()
        }
    }

    pub fn silent_success() -> Self {
        Self {
            emit_events: false,
            ..Default::default()
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_tool_call(mut self, tool: impl Into<String>, arguments: Value) -> Self {
        self.tool_calls.push((tool.into(), arguments));
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.push((path.into(), content.into()));
        self
    }
}

pub struct MockAdapter {
    behaviors: Arc<Mutex<Vec<MockBehavior>>>,
    default_behavior: MockBehavior,
    requests: Arc<Mutex<Vec<RunConfig>>>,
    permissions: PermissionSet,
    context_window: u64,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            behaviors: Arc::new(Mutex::new(vec![])),
            default_behavior: MockBehavior::default(),
            requests: Arc::new(Mutex::new(vec![])),
            permissions: PermissionSet::default(),
            context_window: 200_000,
        }
    }

    pub fn with_behaviors(behaviors: Vec<MockBehavior>) -> Self {
        Self {
            behaviors: Arc::new(Mutex::new(behaviors)),
            ..Self::new()
        }
    }

    pub fn with_default(mut self, behavior: MockBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    pub fn with_context_window(mut self, window: u64) -> Self {
        self.context_window = window;
        self
    }

    /// Append a behavior to the FIFO queue.
    pub fn queue(&self, behavior: MockBehavior) {
        self.behaviors.lock().unwrap().push(behavior);
    }

    /// All recorded invocations.
    pub fn requests(&self) -> Vec<RunConfig> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<RunConfig> {
        self.requests.lock().unwrap().last().cloned()
    }

    /// Number of invocations so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    fn default_permissions(&self) -> PermissionSet {
        self.permissions.clone()
    }

    fn context_window(&self) -> u64 {
        self.context_window
    }

    async fn run(
        &self,
        config: RunConfig,
        events: mpsc::UnboundedSender<AdapterEvent>,
    ) -> Result<RunResult, WaveError> {
        self.requests.lock().unwrap().push(config.clone());

        let behavior = {
            let mut queue = self.behaviors.lock().unwrap();
            if queue.is_empty() {
                self.default_behavior.clone()
            } else {
                queue.remove(0)
            }
        };

        if behavior.latency > Duration::ZERO {
            // Latency is observed against the step timeout, like a real CLI.
            if behavior.latency >= config.timeout {
                tokio::time::sleep(config.timeout).await;
                return Err(WaveError::AdapterTimeout {
                    persona: config.persona.clone(),
                    seconds: config.timeout.as_secs(),
                });
            }
            tokio::time::sleep(behavior.latency).await;
        }

        if config.cancel.is_force() {
            return Err(WaveError::Cancelled);
        }

        if behavior.exit_code != 0 {
            return Err(WaveError::AdapterFailed {
                persona: config.persona.clone(),
                exit_code: behavior.exit_code,
                detail: "mock failure".into(),
            });
        }

        if !behavior.emit_events {
            return Err(WaveError::AdapterProtocolError {
                persona: config.persona.clone(),
                message: "adapter exited 0 without emitting any events".into(),
            });
        }

        for (path, content) in &behavior.files {
            let target = config.workspace.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, content)?;
        }

        let _ = events.send(AdapterEvent::TokenUsage {
            delta: behavior.tokens,
            cumulative: behavior.tokens,
        });
        for (tool, arguments) in &behavior.tool_calls {
            let _ = events.send(AdapterEvent::ToolCall {
                tool: tool.clone(),
                arguments: arguments.clone(),
            });
        }
        let _ = events.send(AdapterEvent::Text {
            content: behavior.output.clone(),
        });

        Ok(RunResult {
            output: behavior.output.clone(),
            usage: TokenUsage {
                input_tokens: 0,
                output_tokens: behavior.tokens,
            },
            exit_code: 0,
            events_seen: 2 + behavior.tool_calls.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CancelFlag;
    use std::path::PathBuf;

    fn config() -> RunConfig {
        RunConfig {
            workspace: PathBuf::from("."),
            persona: "navigator".into(),
            system_prompt_path: PathBuf::from("/dev/null"),
            prompt: "go".into(),
            temperature: 0.2,
            permissions: PermissionSet::default(),
            hooks: vec![],
            timeout: Duration::from_millis(200),
            cancel: CancelFlag::new(),
        }
    }

    #[tokio::test]
    async fn scripted_behaviors_are_fifo() {
        let adapter = MockAdapter::with_behaviors(vec![
            MockBehavior::output("first"),
            MockBehavior::output("second"),
        ]);
        let (tx, _rx) = mpsc::unbounded_channel();

        assert_eq!(adapter.run(config(), tx.clone()).await.unwrap().output, "first");
        assert_eq!(adapter.run(config(), tx.clone()).await.unwrap().output, "second");
        // Queue exhausted: default applies.
        assert_eq!(adapter.run(config(), tx).await.unwrap().output, "mock output");
    }

    #[tokio::test]
    async fn failing_behavior_maps_to_adapter_failed() {
        let adapter = MockAdapter::with_behaviors(vec![MockBehavior::failing(2)]);
        let (tx, _rx) = mpsc::unbounded_channel();
        match adapter.run(config(), tx).await {
            Err(WaveError::AdapterFailed { exit_code, .. }) => assert_eq!(exit_code, 2),
            other => panic!("expected AdapterFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_success_is_protocol_error() {
        let adapter = MockAdapter::with_behaviors(vec![MockBehavior::silent_success()]);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            adapter.run(config(), tx).await,
            Err(WaveError::AdapterProtocolError { .. })
        ));
    }

    #[tokio::test]
    async fn latency_beyond_timeout_times_out() {
        let adapter = MockAdapter::with_behaviors(vec![
            MockBehavior::default().with_latency(Duration::from_secs(10)),
        ]);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            adapter.run(config(), tx).await,
            Err(WaveError::AdapterTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn records_requests_for_assertions() {
        let adapter = MockAdapter::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        adapter.run(config(), tx).await.unwrap();

        assert_eq!(adapter.calls(), 1);
        let recorded = adapter.last_request().unwrap();
        assert_eq!(recorded.persona, "navigator");
        assert_eq!(recorded.prompt, "go");
    }

    #[tokio::test]
    async fn tool_calls_are_streamed() {
        let adapter = MockAdapter::with_behaviors(vec![MockBehavior::output("ok")
            .with_tool_call("Bash", serde_json::json!({"command": "ls"}))]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter.run(config(), tx).await.unwrap();

        let mut saw_tool_call = false;
        while let Ok(event) = rx.try_recv() {
            if let AdapterEvent::ToolCall { tool, .. } = event {
                assert_eq!(tool, "Bash");
                saw_tool_call = true;
            }
        }
        assert!(saw_tool_call);
    }
}
