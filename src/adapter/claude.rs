//! Claude Code CLI adapter.
//!
//! Drives `claude -p` as a subprocess: projects the persona's system
//! prompt and permission file into the workspace, starts the CLI in its
//! own process group, and streams its `stream-json` NDJSON output back as
//! [`AdapterEvent`]s. Credentials stay in inherited environment variables;
//! nothing secret ever lands in argv.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;
use wait_timeout::ChildExt;

use super::{
    Adapter, AdapterEvent, PermissionSet, RunConfig, RunResult, TokenUsage, PERMISSIONS_FILE,
    SYSTEM_PROMPT_FILE,
};
use crate::error::WaveError;

/// Grace period between SIGTERM and SIGKILL when tearing a group down.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Cancellation poll interval while waiting for the next protocol event.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Timeout for the `--version` availability probe.
const CLI_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ClaudeAdapter {
    binary: String,
    context_window: u64,
    default_permissions: PermissionSet,
}

impl ClaudeAdapter {
    pub fn new(binary: &str, context_window: u64, default_permissions: PermissionSet) -> Self {
        Self {
            binary: binary.to_string(),
            context_window,
            default_permissions,
        }
    }

    /// Check the CLI responds to `--version` within a small budget.
    fn check_cli(&self) -> bool {
        std::process::Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .and_then(|mut child| match child.wait_timeout(CLI_CHECK_TIMEOUT)? {
                Some(status) => Ok(status.success()),
                None => {
                    let _ = child.kill();
                    Ok(false)
                }
            })
            .unwrap_or(false)
    }

    /// Project the system prompt and permission file into the workspace at
    /// their conventional names.
    fn project_workspace_files(&self, config: &RunConfig) -> Result<(), WaveError> {
        let prompt_target = config.workspace.join(SYSTEM_PROMPT_FILE);
        std::fs::copy(&config.system_prompt_path, &prompt_target).map_err(|e| {
            WaveError::workspace(format!(
                "projecting system prompt {} -> {}: {e}",
                config.system_prompt_path.display(),
                prompt_target.display()
            ))
        })?;

        // Deny patterns take precedence; the CLI is told both lists and the
        // hook set in one place.
        let permissions = serde_json::json!({
            "allow": config.permissions.allow,
            "deny": config.permissions.deny,
            "hooks": config.hooks,
        });
        std::fs::write(
            config.workspace.join(PERMISSIONS_FILE),
            serde_json::to_string_pretty(&permissions)
                .map_err(|e| WaveError::workspace(format!("permissions serialize: {e}")))?,
        )?;
        Ok(())
    }

    fn build_command(&self, config: &RunConfig) -> tokio::process::Command {
        let mut cmd = std::process::Command::new(&self.binary);
        cmd.arg("-p")
            .arg(&config.prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--system-prompt-file")
            .arg(SYSTEM_PROMPT_FILE)
            .arg("--temperature")
            .arg(format!("{:.2}", config.temperature))
            .current_dir(&config.workspace);

        if !config.permissions.allow.is_empty() {
            cmd.arg("--allowedTools")
                .arg(config.permissions.allow.join(","));
        }
        if !config.permissions.deny.is_empty() {
            cmd.arg("--disallowedTools")
                .arg(config.permissions.deny.join(","));
        }

        // Own process group so a timeout can kill the entire subtree.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Adapter for ClaudeAdapter {
    fn name(&self) -> &str {
        "claude"
    }

    fn default_permissions(&self) -> PermissionSet {
        self.default_permissions.clone()
    }

    fn context_window(&self) -> u64 {
        self.context_window
    }

    fn is_available(&self) -> bool {
        self.check_cli()
    }

    async fn run(
        &self,
        config: RunConfig,
        events: mpsc::UnboundedSender<AdapterEvent>,
    ) -> Result<RunResult, WaveError> {
        self.project_workspace_files(&config)?;

        let mut child = self.build_command(&config).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WaveError::MissingAdapter {
                    name: self.binary.clone(),
                }
            } else {
                WaveError::AdapterFailed {
                    persona: config.persona.clone(),
                    exit_code: -1,
                    detail: format!("spawn failed: {e}"),
                }
            }
        })?;

        let pgid = child.id().map(|id| id as i32);

        let stdout = child.stdout.take().ok_or_else(|| {
            WaveError::AdapterProtocolError {
                persona: config.persona.clone(),
                message: "stdout not captured".into(),
            }
        })?;
        let mut stderr = child.stderr.take();

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let deadline = Instant::now() + config.timeout;
        let mut lines = BufReader::new(stdout).lines();
        let mut accum = StreamAccumulator::default();

        loop {
            if config.cancel.is_force() {
                terminate_group(pgid, &mut child).await;
                return Err(WaveError::Cancelled);
            }
            if Instant::now() >= deadline {
                terminate_group(pgid, &mut child).await;
                return Err(WaveError::AdapterTimeout {
                    persona: config.persona.clone(),
                    seconds: config.timeout.as_secs(),
                });
            }

            let poll = POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()));
            match tokio::time::timeout(poll, lines.next_line()).await {
                Ok(Ok(Some(line))) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let parsed =
                        parse_stream_line(&line).map_err(|message| {
                            // The subtree must not outlive a protocol error.
                            WaveError::AdapterProtocolError {
                                persona: config.persona.clone(),
                                message,
                            }
                        });
                    let parsed = match parsed {
                        Ok(p) => p,
                        Err(e) => {
                            terminate_group(pgid, &mut child).await;
                            return Err(e);
                        }
                    };
                    accum.absorb(parsed, &events);
                }
                Ok(Ok(None)) => break, // EOF
                Ok(Err(e)) => {
                    terminate_group(pgid, &mut child).await;
                    return Err(WaveError::AdapterProtocolError {
                        persona: config.persona.clone(),
                        message: format!("stdout read: {e}"),
                    });
                }
                Err(_) => continue, // poll tick; re-check cancel + deadline
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let status = match tokio::time::timeout(remaining.max(KILL_GRACE), child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(WaveError::AdapterFailed {
                    persona: config.persona.clone(),
                    exit_code: -1,
                    detail: format!("wait failed: {e}"),
                })
            }
            Err(_) => {
                terminate_group(pgid, &mut child).await;
                return Err(WaveError::AdapterTimeout {
                    persona: config.persona.clone(),
                    seconds: config.timeout.as_secs(),
                });
            }
        };

        let stderr_text = stderr_task.await.unwrap_or_default();
        let exit_code = status.code().unwrap_or(-1);

        if exit_code != 0 {
            let tail: String = stderr_text.chars().rev().take(2000).collect::<String>();
            let tail: String = tail.chars().rev().collect();
            return Err(WaveError::AdapterFailed {
                persona: config.persona.clone(),
                exit_code,
                detail: tail,
            });
        }

        // An adapter that produced no protocol events but exited 0 gives us
        // no token data; that is itself a protocol violation.
        if accum.events_seen == 0 {
            return Err(WaveError::AdapterProtocolError {
                persona: config.persona.clone(),
                message: "adapter exited 0 without emitting any events".into(),
            });
        }

        Ok(RunResult {
            output: accum.final_output(),
            usage: accum.usage,
            exit_code,
            events_seen: accum.events_seen,
        })
    }
}

/// SIGTERM the process group, give it a grace period, then SIGKILL.
async fn terminate_group(pgid: Option<i32>, child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pgid) = pgid {
        unsafe {
            libc::killpg(pgid, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
    let _ = child.kill().await;
}

// ============================================================================
// STREAM PARSING
// ============================================================================

/// Decoded content of one NDJSON line.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct ParsedLine {
    pub text: Vec<String>,
    pub tool_calls: Vec<(String, Value)>,
    /// Cumulative (input, output) token counts when the line carries usage.
    pub usage: Option<(u64, u64)>,
    /// Final result payload (`type: "result"` lines).
    pub result: Option<String>,
}

/// Parse one line of `stream-json` output.
///
/// Lines are complete JSON objects; anything else is a protocol error.
pub(crate) fn parse_stream_line(line: &str) -> Result<ParsedLine, String> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| format!("unparseable event line: {e}"))?;
    if !value.is_object() {
        return Err("event line is not a JSON object".into());
    }

    let mut parsed = ParsedLine::default();

    // Usage may appear at the top level or nested under `message`.
    let usage = value
        .get("usage")
        .or_else(|| value.pointer("/message/usage"));
    if let Some(usage) = usage {
        let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
        let output = usage
            .get("output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        parsed.usage = Some((input, output));
    }

    if let Some(content) = value
        .pointer("/message/content")
        .and_then(Value::as_array)
    {
        for item in content {
            match item.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        parsed.text.push(text.to_string());
                    }
                }
                Some("tool_use") => {
                    let tool = item
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    let input = item.get("input").cloned().unwrap_or(Value::Null);
                    parsed.tool_calls.push((tool, input));
                }
                _ => {}
            }
        }
    }

    if value.get("type").and_then(Value::as_str) == Some("result") {
        parsed.result = value
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string);
    }

    Ok(parsed)
}

/// Folds parsed lines into a running result, forwarding events.
#[derive(Debug, Default)]
struct StreamAccumulator {
    events_seen: usize,
    usage: TokenUsage,
    cumulative: u64,
    text: Vec<String>,
    result: Option<String>,
}

impl StreamAccumulator {
    fn absorb(&mut self, parsed: ParsedLine, events: &mpsc::UnboundedSender<AdapterEvent>) {
        self.events_seen += 1;

        if let Some((input, output)) = parsed.usage {
            self.usage = TokenUsage {
                input_tokens: input,
                output_tokens: output,
            };
            let total = self.usage.total();
            let delta = total.saturating_sub(self.cumulative);
            self.cumulative = total;
            let _ = events.send(AdapterEvent::TokenUsage {
                delta,
                cumulative: total,
            });
        }

        for text in parsed.text {
            let _ = events.send(AdapterEvent::Text {
                content: text.clone(),
            });
            self.text.push(text);
        }

        for (tool, arguments) in parsed.tool_calls {
            let _ = events.send(AdapterEvent::ToolCall { tool, arguments });
        }

        if parsed.result.is_some() {
            self.result = parsed.result;
        }
    }

    fn final_output(&self) -> String {
        match &self.result {
            Some(result) => result.clone(),
            None => self.text.join(""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_usage_from_message() {
        let line = r#"{"type":"assistant","message":{"usage":{"input_tokens":120,"output_tokens":30},"content":[{"type":"text","text":"hello"}]}}"#;
        let parsed = parse_stream_line(line).unwrap();
        assert_eq!(parsed.usage, Some((120, 30)));
        assert_eq!(parsed.text, vec!["hello".to_string()]);
    }

    #[test]
    fn parses_tool_use_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}"#;
        let parsed = parse_stream_line(line).unwrap();
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].0, "Bash");
        assert_eq!(parsed.tool_calls[0].1["command"], "ls");
    }

    #[test]
    fn parses_result_line() {
        let line = r#"{"type":"result","result":"done","usage":{"input_tokens":500,"output_tokens":100}}"#;
        let parsed = parse_stream_line(line).unwrap();
        assert_eq!(parsed.result.as_deref(), Some("done"));
        assert_eq!(parsed.usage, Some((500, 100)));
    }

    #[test]
    fn rejects_non_json_lines() {
        assert!(parse_stream_line("this is not json").is_err());
        assert!(parse_stream_line("[1, 2, 3]").is_err());
    }

    #[test]
    fn accumulator_computes_token_deltas() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut accum = StreamAccumulator::default();

        accum.absorb(
            ParsedLine {
                usage: Some((100, 20)),
                ..Default::default()
            },
            &tx,
        );
        accum.absorb(
            ParsedLine {
                usage: Some((100, 80)),
                ..Default::default()
            },
            &tx,
        );

        match rx.try_recv().unwrap() {
            AdapterEvent::TokenUsage { delta, cumulative } => {
                assert_eq!(delta, 120);
                assert_eq!(cumulative, 120);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match rx.try_recv().unwrap() {
            AdapterEvent::TokenUsage { delta, cumulative } => {
                assert_eq!(delta, 60);
                assert_eq!(cumulative, 180);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn accumulator_prefers_result_over_text() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut accum = StreamAccumulator::default();
        accum.absorb(
            ParsedLine {
                text: vec!["partial".into()],
                ..Default::default()
            },
            &tx,
        );
        accum.absorb(
            ParsedLine {
                result: Some("final".into()),
                ..Default::default()
            },
            &tx,
        );
        assert_eq!(accum.final_output(), "final");
    }

    #[test]
    fn projects_workspace_files() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = dir.path().join("persona.md");
        std::fs::write(&prompt, "be careful").unwrap();
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();

        let adapter = ClaudeAdapter::new("claude", 200_000, PermissionSet::default());
        let config = RunConfig {
            workspace: ws.clone(),
            persona: "navigator".into(),
            system_prompt_path: prompt,
            prompt: "go".into(),
            temperature: 0.3,
            permissions: PermissionSet {
                allow: vec!["Read".into()],
                deny: vec!["Bash(rm *)".into()],
            },
            hooks: vec![],
            timeout: Duration::from_secs(1),
            cancel: crate::types::CancelFlag::new(),
        };
        adapter.project_workspace_files(&config).unwrap();

        assert_eq!(
            std::fs::read_to_string(ws.join(SYSTEM_PROMPT_FILE)).unwrap(),
            "be careful"
        );
        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(ws.join(PERMISSIONS_FILE)).unwrap())
                .unwrap();
        assert_eq!(written["deny"][0], "Bash(rm *)");
    }
}
