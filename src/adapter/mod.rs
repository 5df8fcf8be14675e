//! Adapter abstraction layer.
//!
//! An adapter wraps an external LLM CLI as a uniform subprocess interface.
//! The capability set is deliberately small - `run`, `name`,
//! `default_permissions` - and is dispatched by manifest-declared name, so
//! the engine never cares which CLI sits behind a persona.
//!
//! | Adapter | Use case | Behavior |
//! |---------|----------|----------|
//! | `claude` | production | drives the Claude Code CLI, streams NDJSON |
//! | `dummy` | local development | echoes the rendered prompt |
//! | `mock` | tests | scripted outputs, exit codes, tokens, latency |

mod claude;
mod dummy;
mod mock;

pub use claude::ClaudeAdapter;
pub use dummy::DummyAdapter;
pub use mock::{MockAdapter, MockBehavior};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::WaveError;
use crate::manifest::{AdapterSpec, Manifest};
use crate::types::CancelFlag;

/// Average characters per token for mixed prose + code; used when an
/// adapter cannot report real counts.
pub(crate) const CHARS_PER_TOKEN: f32 = 3.0;

/// File name the system prompt is projected to inside the workspace.
pub const SYSTEM_PROMPT_FILE: &str = ".wave-system-prompt.md";

/// File name the permission set is written to inside the workspace.
pub const PERMISSIONS_FILE: &str = ".wave-permissions.json";

// ============================================================================
// PERMISSIONS & HOOKS
// ============================================================================

/// Tool allow/deny patterns for one adapter invocation.
///
/// Deny patterns always take precedence over allow patterns; merging keeps
/// that property by unioning both lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PermissionSet {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl PermissionSet {
    /// Merge persona overrides over adapter defaults. Allows and denies
    /// are unioned; a denied pattern can never be re-allowed.
    pub fn merged_with(&self, overrides: Option<&PermissionSet>) -> PermissionSet {
        let mut merged = self.clone();
        if let Some(extra) = overrides {
            for allow in &extra.allow {
                if !merged.allow.contains(allow) {
                    merged.allow.push(allow.clone());
                }
            }
            for deny in &extra.deny {
                if !merged.deny.contains(deny) {
                    merged.deny.push(deny.clone());
                }
            }
        }
        merged
    }
}

/// A lifecycle hook the adapter CLI should honor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Hook {
    /// Hook point, e.g. `pre_tool` or `post_run`.
    pub event: String,
    pub command: String,
}

/// Which adapter implementation drives a manifest adapter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    #[default]
    Claude,
    Dummy,
    Mock,
}

// ============================================================================
// RUN CONFIG / RESULT
// ============================================================================

/// Everything an adapter needs for one invocation.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Workspace directory; the subprocess runs with this as its cwd and
    /// may write only here.
    pub workspace: PathBuf,
    pub persona: String,
    /// Resolved path of the persona's system-prompt file.
    pub system_prompt_path: PathBuf,
    /// Fully rendered prompt.
    pub prompt: String,
    pub temperature: f32,
    pub permissions: PermissionSet,
    pub hooks: Vec<Hook>,
    pub timeout: Duration,
    /// Cooperative cancellation observed at every polling point.
    pub cancel: CancelFlag,
}

/// Streamed observation from a running adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// Assistant text fragment.
    Text { content: String },
    /// Token accounting update.
    TokenUsage { delta: u64, cumulative: u64 },
    /// A tool invocation, surfaced for the audit log.
    ToolCall {
        tool: String,
        arguments: serde_json::Value,
    },
}

/// Token accounting for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Estimate when the CLI reports no usage data.
    pub fn estimate(prompt_len: usize, response_len: usize) -> Self {
        Self {
            input_tokens: (prompt_len as f32 / CHARS_PER_TOKEN).ceil() as u64,
            output_tokens: (response_len as f32 / CHARS_PER_TOKEN).ceil() as u64,
        }
    }
}

/// Final result of one adapter invocation.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Final assistant output (concatenated text or the CLI's result field).
    pub output: String,
    pub usage: TokenUsage,
    pub exit_code: i32,
    /// Number of protocol events observed; zero events with exit 0 is a
    /// protocol violation handled by the caller.
    pub events_seen: usize,
}

// ============================================================================
// ADAPTER TRAIT
// ============================================================================

/// Uniform subprocess interface over an external LLM CLI.
///
/// Implementations must stream [`AdapterEvent`]s as they arrive so the
/// executor can account tokens, feed the relay monitor, and audit tool
/// calls while the subprocess is still running.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Manifest-facing name, e.g. "claude".
    fn name(&self) -> &str;

    /// Permissions applied when neither adapter entry nor persona declares
    /// any.
    fn default_permissions(&self) -> PermissionSet {
        PermissionSet::default()
    }

    /// Model context window, used by the relay threshold.
    fn context_window(&self) -> u64 {
        200_000
    }

    /// Whether the backing binary is reachable.
    fn is_available(&self) -> bool {
        true
    }

    /// Execute one invocation, streaming events to `events`.
    async fn run(
        &self,
        config: RunConfig,
        events: mpsc::UnboundedSender<AdapterEvent>,
    ) -> Result<RunResult, WaveError>;
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Lock-free name -> adapter lookup, built from the manifest.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Arc<DashMap<String, Arc<dyn Adapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate every adapter the manifest declares.
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let registry = Self::new();
        for (name, spec) in &manifest.adapters {
            registry.insert(name, create_adapter(spec));
        }
        registry
    }

    /// Register (or replace) an adapter under a name. Tests use this to
    /// install scripted mocks.
    pub fn insert(&self, name: &str, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(name.to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Adapter>, WaveError> {
        self.adapters
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| WaveError::MissingAdapter { name: name.into() })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Instantiate the implementation an adapter entry asks for.
pub fn create_adapter(spec: &AdapterSpec) -> Arc<dyn Adapter> {
    match spec.kind {
        AdapterKind::Claude => Arc::new(ClaudeAdapter::new(
            &spec.binary,
            spec.context_window,
            spec.default_permissions.clone(),
        )),
        AdapterKind::Dummy => Arc::new(DummyAdapter::new(spec.context_window)),
        AdapterKind::Mock => Arc::new(MockAdapter::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_unions_allow_and_deny() {
        let base = PermissionSet {
            allow: vec!["Read".into()],
            deny: vec!["Bash(rm *)".into()],
        };
        let overrides = PermissionSet {
            allow: vec!["Write".into(), "Read".into()],
            deny: vec!["WebFetch".into()],
        };

        let merged = base.merged_with(Some(&overrides));
        assert_eq!(merged.allow, vec!["Read".to_string(), "Write".to_string()]);
        assert_eq!(
            merged.deny,
            vec!["Bash(rm *)".to_string(), "WebFetch".to_string()]
        );
    }

    #[test]
    fn merge_without_overrides_is_identity() {
        let base = PermissionSet {
            allow: vec!["Read".into()],
            deny: vec![],
        };
        assert_eq!(base.merged_with(None), base);
    }

    #[test]
    fn deny_survives_merge() {
        // A deny in the adapter defaults can never be removed by a persona.
        let base = PermissionSet {
            allow: vec![],
            deny: vec!["Bash(rm *)".into()],
        };
        let overrides = PermissionSet {
            allow: vec!["Bash(rm *)".into()],
            deny: vec![],
        };
        let merged = base.merged_with(Some(&overrides));
        assert!(merged.deny.contains(&"Bash(rm *)".to_string()));
    }

    #[test]
    fn token_usage_estimate_is_charge_based() {
        let usage = TokenUsage::estimate(300, 150);
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 50);
        assert_eq!(usage.total(), 150);
    }

    #[test]
    fn registry_lookup_and_missing() {
        let registry = AdapterRegistry::new();
        registry.insert("mock", Arc::new(MockAdapter::new()));

        assert_eq!(registry.get("mock").unwrap().name(), "mock");
        assert!(matches!(
            registry.get("ghost"),
            Err(WaveError::MissingAdapter { .. })
        ));
    }

    #[test]
    fn registry_names_are_sorted() {
        let registry = AdapterRegistry::new();
        registry.insert("zeta", Arc::new(MockAdapter::new()));
        registry.insert("alpha", Arc::new(MockAdapter::new()));
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn adapter_kind_defaults_to_claude() {
        assert_eq!(AdapterKind::default(), AdapterKind::Claude);
    }
}
