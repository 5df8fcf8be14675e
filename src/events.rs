//! NDJSON progress events.
//!
//! Events are the only live surface of the engine: one JSON object per
//! line on stdout, totally ordered because every writer serializes through
//! a single sink. Diagnostics go to stderr via `tracing`; the two channels
//! never mix, so callers can parse the stream without filtering.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit;
use crate::types::RunId;

// ============================================================================
// EVENT
// ============================================================================

/// A single progress event.
///
/// Documented fields: `timestamp` (RFC 3339), `run_id`, `step_id`
/// (nullable), `state`, `persona` (nullable), `duration_ms`, `tokens_used`,
/// `message`, optional `attrs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub step_id: Option<String>,
    pub state: String,
    pub persona: Option<String>,
    pub duration_ms: u64,
    pub tokens_used: u64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Value>,
}

impl Event {
    fn new(run_id: &RunId, state: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            step_id: None,
            state: state.to_string(),
            persona: None,
            duration_ms: 0,
            tokens_used: 0,
            message: message.into(),
            attrs: None,
        }
    }

    pub fn pipeline_started(run_id: &RunId, pipeline: &str, step_count: usize) -> Self {
        Event::new(
            run_id,
            "pipeline_started",
            format!("pipeline '{pipeline}' started with {step_count} steps"),
        )
    }

    pub fn pipeline_completed(run_id: &RunId, duration_ms: u64, tokens: u64) -> Self {
        let mut e = Event::new(run_id, "pipeline_completed", "pipeline completed");
        e.duration_ms = duration_ms;
        e.tokens_used = tokens;
        e
    }

    pub fn pipeline_failed(run_id: &RunId, duration_ms: u64, message: impl Into<String>) -> Self {
        let mut e = Event::new(run_id, "pipeline_failed", message);
        e.duration_ms = duration_ms;
        e
    }

    pub fn pipeline_cancelled(run_id: &RunId, duration_ms: u64) -> Self {
        let mut e = Event::new(run_id, "pipeline_cancelled", "pipeline cancelled");
        e.duration_ms = duration_ms;
        e
    }

    pub fn step_started(run_id: &RunId, step_id: &str, persona: &str) -> Self {
        let mut e = Event::new(run_id, "step_started", format!("step '{step_id}' started"));
        e.step_id = Some(step_id.to_string());
        e.persona = Some(persona.to_string());
        e
    }

    pub fn step_completed(
        run_id: &RunId,
        step_id: &str,
        persona: &str,
        duration_ms: u64,
        tokens: u64,
    ) -> Self {
        let mut e = Event::new(
            run_id,
            "step_completed",
            format!("step '{step_id}' completed"),
        );
        e.step_id = Some(step_id.to_string());
        e.persona = Some(persona.to_string());
        e.duration_ms = duration_ms;
        e.tokens_used = tokens;
        e
    }

    pub fn step_failed(
        run_id: &RunId,
        step_id: &str,
        persona: &str,
        duration_ms: u64,
        message: impl Into<String>,
    ) -> Self {
        let mut e = Event::new(run_id, "step_failed", message);
        e.step_id = Some(step_id.to_string());
        e.persona = Some(persona.to_string());
        e.duration_ms = duration_ms;
        e
    }

    pub fn step_retrying(
        run_id: &RunId,
        step_id: &str,
        persona: &str,
        retry_count: u32,
        message: impl Into<String>,
    ) -> Self {
        let mut e = Event::new(run_id, "step_retrying", message);
        e.step_id = Some(step_id.to_string());
        e.persona = Some(persona.to_string());
        e.attrs = Some(serde_json::json!({ "retry_count": retry_count }));
        e
    }

    /// Compaction is a sub-phase of `Running`, surfaced for observability.
    pub fn step_compacting(run_id: &RunId, step_id: &str, persona: &str, tokens: u64) -> Self {
        let mut e = Event::new(
            run_id,
            "step_compacting",
            format!("step '{step_id}' reached the relay threshold; compacting context"),
        );
        e.step_id = Some(step_id.to_string());
        e.persona = Some(persona.to_string());
        e.tokens_used = tokens;
        e
    }

    pub fn with_attrs(mut self, attrs: Value) -> Self {
        self.attrs = Some(attrs);
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    /// Attach the matrix worker index so worker events stay attributable.
    pub fn with_worker(mut self, index: usize) -> Self {
        let attrs = self.attrs.take().unwrap_or_else(|| serde_json::json!({}));
        let mut attrs = attrs;
        if let Some(obj) = attrs.as_object_mut() {
            obj.insert("worker".to_string(), serde_json::json!(index));
        }
        self.attrs = Some(attrs);
        self
    }
}

// ============================================================================
// SINK
// ============================================================================

enum SinkTarget {
    Stdout,
    Capture(Vec<String>),
}

/// Thread-safe NDJSON emitter. All writers (executor, matrix workers,
/// relay) share one sink, so the stream is totally ordered.
#[derive(Clone)]
pub struct EventSink {
    target: Arc<Mutex<SinkTarget>>,
}

impl EventSink {
    /// Sink that writes one JSON line per event to stdout.
    pub fn stdout() -> Self {
        Self {
            target: Arc::new(Mutex::new(SinkTarget::Stdout)),
        }
    }

    /// In-memory sink for tests and dry runs.
    pub fn capture() -> Self {
        Self {
            target: Arc::new(Mutex::new(SinkTarget::Capture(Vec::new()))),
        }
    }

    /// Emit an event. The message and attrs pass through the credential
    /// scrubber before serialization.
    pub fn emit(&self, mut event: Event) {
        event.message = audit::scrub(&event.message);
        if let Some(attrs) = &event.attrs {
            event.attrs = Some(audit::scrub_value(attrs));
        }

        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize event");
                return;
            }
        };

        let mut guard = match self.target.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match &mut *guard {
            SinkTarget::Stdout => {
                let stdout = io::stdout();
                let mut handle = stdout.lock();
                let _ = writeln!(handle, "{line}");
                let _ = handle.flush();
            }
            SinkTarget::Capture(lines) => lines.push(line),
        }
    }

    /// Captured lines (capture sinks only; empty for stdout sinks).
    pub fn captured(&self) -> Vec<String> {
        let guard = match self.target.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match &*guard {
            SinkTarget::Capture(lines) => lines.clone(),
            SinkTarget::Stdout => Vec::new(),
        }
    }

    /// Captured events, parsed back. Panics on malformed lines, which is
    /// itself the invariant under test.
    pub fn captured_events(&self) -> Vec<Event> {
        self.captured()
            .iter()
            .map(|line| serde_json::from_str(line).expect("event line is valid JSON"))
            .collect()
    }
}
