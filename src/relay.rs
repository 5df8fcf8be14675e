//! Context relay (compaction).
//!
//! Monitors cumulative token usage against a configured fraction of the
//! adapter's context window. When a step crosses the threshold, the
//! executor pauses it at the next safe point and a distinct summarizer
//! persona - fresh context, its own subprocess, temperature pinned low -
//! produces a checkpoint document: work completed, work remaining,
//! modified files, and explicit resume instructions. The checkpoint is
//! injected into the workspace and the step restarts from scratch with
//! instructions to read it first. Relay is not a failure: the retry
//! counter does not move.
//!
//! The original persona never summarizes itself, and the summarizer never
//! relays: if it exceeds its own token cap the run halts with
//! `RelayRecursion`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::adapter::{AdapterEvent, AdapterRegistry, RunConfig};
use crate::audit;
use crate::contract;
use crate::error::WaveError;
use crate::manifest::Manifest;
use crate::types::CancelFlag;

/// Workspace file the checkpoint is injected at.
pub const CHECKPOINT_FILE: &str = "CHECKPOINT.json";

/// The summarizer always runs cold.
const SUMMARIZER_TEMPERATURE: f32 = 0.1;

/// Budget for one summarizer invocation.
const SUMMARIZER_TIMEOUT: Duration = Duration::from_secs(180);

const CHECKPOINT_SCHEMA: &str = r#"{
    "type": "object",
    "required": ["completed", "remaining", "modified_files", "resume_instructions"],
    "properties": {
        "completed": {"type": "string", "minLength": 1},
        "remaining": {"type": "string", "minLength": 1},
        "modified_files": {"type": "array", "minItems": 1, "items": {"type": "string"}},
        "resume_instructions": {"type": "string", "minLength": 1}
    }
}"#;

// ============================================================================
// MONITOR
// ============================================================================

/// Per-step token pressure monitor. Counts tokens consumed since the most
/// recent checkpoint so the threshold re-evaluates cleanly after each
/// compaction.
#[derive(Debug, Clone)]
pub struct RelayMonitor {
    threshold_tokens: u64,
    consumed_since_checkpoint: u64,
}

impl RelayMonitor {
    pub fn new(context_window: u64, threshold_percent: u8) -> Self {
        Self {
            threshold_tokens: context_window * threshold_percent as u64 / 100,
            consumed_since_checkpoint: 0,
        }
    }

    /// Account a token delta; true when the threshold is reached.
    /// Crossing exactly at the threshold triggers.
    pub fn observe(&mut self, delta: u64) -> bool {
        self.consumed_since_checkpoint += delta;
        self.is_pressed()
    }

    pub fn is_pressed(&self) -> bool {
        self.consumed_since_checkpoint >= self.threshold_tokens
    }

    pub fn consumed(&self) -> u64 {
        self.consumed_since_checkpoint
    }

    /// Called after a checkpoint lands; counting restarts from zero.
    pub fn reset(&mut self) {
        self.consumed_since_checkpoint = 0;
    }
}

// ============================================================================
// CHECKPOINT
// ============================================================================

/// Structured summary the summarizer must produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub completed: String,
    pub remaining: String,
    pub modified_files: Vec<String>,
    pub resume_instructions: String,
}

impl Checkpoint {
    /// Parse and validate a summarizer response. The response is cleaned
    /// like any other JSON artifact first.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let cleaned = contract::clean(raw).map_err(|e| format!("checkpoint not JSON: {e}"))?;
        let value: serde_json::Value = serde_json::from_str(&cleaned.text)
            .map_err(|e| format!("checkpoint not JSON: {e}"))?;

        let schema: serde_json::Value =
            serde_json::from_str(CHECKPOINT_SCHEMA).map_err(|e| e.to_string())?;
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft202012)
            .compile(&schema)
            .map_err(|e| e.to_string())?;
        if let Err(errors) = compiled.validate(&value) {
            if let Some(error) = errors.into_iter().next() {
                return Err(format!("checkpoint invalid at {}: {error}", error.instance_path));
            }
        }

        serde_json::from_value(value).map_err(|e| e.to_string())
    }

    /// Scrub and write the checkpoint into the step workspace.
    pub fn inject(&self, workspace: &Path) -> Result<PathBuf, WaveError> {
        let scrubbed = Checkpoint {
            completed: audit::scrub(&self.completed),
            remaining: audit::scrub(&self.remaining),
            modified_files: self.modified_files.iter().map(|f| audit::scrub(f)).collect(),
            resume_instructions: audit::scrub(&self.resume_instructions),
        };
        let path = workspace.join(CHECKPOINT_FILE);
        std::fs::write(
            &path,
            serde_json::to_string_pretty(&scrubbed)
                .map_err(|e| WaveError::workspace(format!("checkpoint serialize: {e}")))?,
        )?;
        Ok(path)
    }

    /// Prompt prefix for the restarted step.
    pub fn restart_preamble(&self) -> String {
        format!(
            "A context checkpoint from your previous attempt is available at \
             {CHECKPOINT_FILE}. Read it first and continue from where it left off \
             instead of starting over."
        )
    }
}

// ============================================================================
// RELAY
// ============================================================================

/// Invokes the summarizer persona to compact a step's context.
pub struct Relay {
    manifest: Arc<Manifest>,
    registry: AdapterRegistry,
}

impl Relay {
    pub fn new(manifest: Arc<Manifest>, registry: AdapterRegistry) -> Self {
        Self { manifest, registry }
    }

    /// Relay is only usable when the manifest names a summarizer persona.
    pub fn is_configured(&self) -> bool {
        self.manifest.runtime.summarizer_persona.is_some()
    }

    /// Produce a checkpoint from the accumulated transcript. Runs the
    /// summarizer in a fresh subprocess; never the original persona.
    /// Returns the checkpoint and the tokens the summarizer consumed.
    pub async fn compact(
        &self,
        workspace: &Path,
        step_id: &str,
        transcript: &str,
        cancel: CancelFlag,
    ) -> Result<(Checkpoint, u64), WaveError> {
        let summarizer_name = self
            .manifest
            .runtime
            .summarizer_persona
            .as_deref()
            .ok_or_else(|| WaveError::MissingPersona {
                name: "runtime.summarizer_persona".into(),
            })?;
        let persona = self.manifest.persona(summarizer_name)?;
        let adapter = self.registry.get(&persona.adapter)?;

        // The summarizer's own cap: the same threshold fraction of its
        // adapter's window. Exceeding it is RelayRecursion, never another
        // relay.
        let cap = adapter.context_window()
            * self.manifest.runtime.relay_threshold_percent as u64
            / 100;

        let prompt = format!(
            "The agent working on step '{step_id}' is close to its context limit. \
             Summarize the transcript below into a checkpoint so a fresh agent can \
             resume. Respond with only a JSON object with these keys: \
             `completed` (what has been done), `remaining` (what is left), \
             `modified_files` (array of file paths, use [\"(none)\"] if empty), \
             `resume_instructions` (explicit next actions).\n\n\
             --- transcript ---\n{transcript}"
        );

        let config = RunConfig {
            workspace: workspace.to_path_buf(),
            persona: summarizer_name.to_string(),
            system_prompt_path: self.manifest.resolve_path(&persona.system_prompt),
            prompt,
            temperature: SUMMARIZER_TEMPERATURE,
            permissions: self.manifest.effective_permissions(summarizer_name)?,
            hooks: persona.hooks.clone(),
            timeout: SUMMARIZER_TIMEOUT,
            cancel,
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let drain = tokio::spawn(async move {
            let mut cumulative = 0u64;
            while let Some(event) = rx.recv().await {
                if let AdapterEvent::TokenUsage { cumulative: c, .. } = event {
                    cumulative = cumulative.max(c);
                }
            }
            cumulative
        });

        let result = adapter.run(config, tx).await?;
        let summarizer_tokens = drain.await.unwrap_or(0).max(result.usage.total());

        if summarizer_tokens > cap {
            return Err(WaveError::RelayRecursion);
        }

        let checkpoint =
            Checkpoint::parse(&result.output).map_err(|message| WaveError::AdapterProtocolError {
                persona: summarizer_name.to_string(),
                message,
            })?;
        Ok((checkpoint, summarizer_tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_triggers_at_exact_threshold() {
        // 80% of 1000 = 800 tokens.
        let mut monitor = RelayMonitor::new(1000, 80);
        assert!(!monitor.observe(799));
        assert!(monitor.observe(1)); // exactly 800
    }

    #[test]
    fn monitor_resets_after_checkpoint() {
        let mut monitor = RelayMonitor::new(1000, 80);
        assert!(monitor.observe(900));
        monitor.reset();
        assert_eq!(monitor.consumed(), 0);
        assert!(!monitor.observe(100));
        assert!(monitor.observe(700));
    }

    #[test]
    fn checkpoint_parses_valid_document() {
        let raw = r#"{
            "completed": "renamed the module",
            "remaining": "fix the tests",
            "modified_files": ["src/lib.rs"],
            "resume_instructions": "run the suite, then fix imports"
        }"#;
        let checkpoint = Checkpoint::parse(raw).unwrap();
        assert_eq!(checkpoint.modified_files, vec!["src/lib.rs"]);
    }

    #[test]
    fn checkpoint_cleans_llm_json() {
        let raw = r#"{
            "completed": "done", // trailing comment
            "remaining": "more",
            "modified_files": ["a.rs",],
            "resume_instructions": "continue",
        }"#;
        assert!(Checkpoint::parse(raw).is_ok());
    }

    #[test]
    fn checkpoint_rejects_empty_sections() {
        let raw = r#"{
            "completed": "",
            "remaining": "more",
            "modified_files": ["a.rs"],
            "resume_instructions": "continue"
        }"#;
        let err = Checkpoint::parse(raw).unwrap_err();
        assert!(err.contains("completed"), "{err}");
    }

    #[test]
    fn checkpoint_rejects_missing_sections() {
        let raw = r#"{"completed": "x", "remaining": "y"}"#;
        assert!(Checkpoint::parse(raw).is_err());
    }

    #[test]
    fn checkpoint_injection_writes_scrubbed_file() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint {
            completed: "exported Bearer verysecrettoken99 to the env".into(),
            remaining: "rest".into(),
            modified_files: vec![".env".into()],
            resume_instructions: "carry on".into(),
        };
        let path = checkpoint.inject(dir.path()).unwrap();
        assert!(path.ends_with(CHECKPOINT_FILE));

        let written = std::fs::read_to_string(path).unwrap();
        assert!(!written.contains("verysecrettoken99"));
        let reparsed: Checkpoint = serde_json::from_str(&written).unwrap();
        assert_eq!(reparsed.remaining, "rest");
    }

    #[test]
    fn restart_preamble_points_at_checkpoint() {
        let checkpoint = Checkpoint {
            completed: "a".into(),
            remaining: "b".into(),
            modified_files: vec!["c".into()],
            resume_instructions: "d".into(),
        };
        assert!(checkpoint.restart_preamble().contains(CHECKPOINT_FILE));
    }
}
