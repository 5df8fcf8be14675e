//! Manifest loading and validation.
//!
//! The manifest (`wave.yaml`) is process-wide configuration, loaded once
//! and immutable during a run. It enumerates adapters (name -> binary +
//! default permissions), personas (name -> adapter, system prompt,
//! temperature, permission overrides, hooks), runtime defaults, and audit
//! toggles.
//!
//! Validation is layered and aggregates every finding rather than stopping
//! at the first: unresolved persona->adapter references, missing
//! system-prompt files, and out-of-range runtime values are all reported
//! with the manifest path (and a line number where the YAML parser
//! provides one).

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::adapter::{AdapterKind, Hook, PermissionSet};
use crate::error::WaveError;

// ============================================================================
// MANIFEST ROOT
// ============================================================================

pub const MANIFEST_API_VERSION: &str = "wave/v1";
pub const MANIFEST_KIND: &str = "WaveManifest";

/// Top-level, per-project configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    #[serde(default)]
    pub adapters: BTreeMap<String, AdapterSpec>,
    #[serde(default)]
    pub personas: BTreeMap<String, PersonaSpec>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub skill_mounts: Vec<SkillMount>,

    /// Directory the manifest was loaded from; system-prompt paths resolve
    /// against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metadata {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// One adapter entry: how to reach the external LLM CLI.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterSpec {
    /// Which adapter implementation drives the binary.
    #[serde(default)]
    pub kind: AdapterKind,
    /// Binary path or name resolved via PATH.
    pub binary: String,
    /// Permissions applied when the persona declares no overrides.
    #[serde(default)]
    pub default_permissions: PermissionSet,
    /// Model context window, used by the relay threshold.
    #[serde(default = "default_context_window")]
    pub context_window: u64,
}

fn default_context_window() -> u64 {
    200_000
}

/// One persona entry: a named agent role.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersonaSpec {
    /// Adapter this persona runs on.
    pub adapter: String,
    /// System-prompt file, relative to the manifest.
    pub system_prompt: PathBuf,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Overrides merged over the adapter's default permissions; deny
    /// patterns always take precedence.
    #[serde(default)]
    pub permissions: Option<PermissionSet>,
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

fn default_temperature() -> f32 {
    0.2
}

/// Read-only skill directories mounted into every workspace.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkillMount {
    pub name: String,
    pub path: PathBuf,
}

// ============================================================================
// RUNTIME DEFAULTS
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuntimeConfig {
    /// Root for per-(run, step) workspaces.
    pub workspace_root: PathBuf,
    /// Audit trace directory.
    pub traces_dir: PathBuf,
    /// Scoped artifact views, one per (run, step, name), written when a
    /// downstream step injects the artifact.
    pub artifacts_dir: PathBuf,
    /// State store path.
    pub state_db: PathBuf,
    /// Upper bound for matrix worker pools.
    pub max_concurrent_workers: usize,
    /// Default per-step timeout.
    pub default_timeout_secs: u64,
    /// Relay triggers at this fraction of the adapter context window.
    pub relay_threshold_percent: u8,
    /// Retry budget for contract failures.
    pub max_retries: u32,
    /// Retry budget for execution errors (adapter failed/timeout/protocol).
    pub execution_max_retries: u32,
    /// Persona used for relay compaction.
    pub summarizer_persona: Option<String>,
    /// Hard cap on steps per pipeline, including synthesized ones.
    pub max_pipeline_steps: usize,
    pub audit: AuditConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from(".wave/workspaces"),
            traces_dir: PathBuf::from(".wave/traces"),
            artifacts_dir: PathBuf::from(".wave/artifacts"),
            state_db: PathBuf::from(".wave/state.db"),
            max_concurrent_workers: 4,
            default_timeout_secs: 300,
            relay_threshold_percent: 80,
            max_retries: 3,
            execution_max_retries: 2,
            summarizer_persona: None,
            max_pipeline_steps: 64,
            audit: AuditConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuditConfig {
    pub enabled: bool,
}

// ============================================================================
// VALIDATION
// ============================================================================

/// One validation finding, tied to a manifest or pipeline location.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    /// Dotted path of the offending entry, e.g. `personas.navigator.adapter`.
    pub at: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.at, self.message)
    }
}

impl Manifest {
    /// Load and validate a manifest from disk.
    pub fn load(path: &Path) -> Result<Self, WaveError> {
        let text = std::fs::read_to_string(path).map_err(|e| WaveError::InvalidManifest {
            path: path.display().to_string(),
            line: None,
            message: e.to_string(),
        })?;
        let mut manifest: Manifest =
            serde_yaml::from_str(&text).map_err(|e| WaveError::InvalidManifest {
                path: path.display().to_string(),
                line: e.location().map(|l| l.line()),
                message: e.to_string(),
            })?;
        manifest.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let issues = manifest.validate();
        if !issues.is_empty() {
            return Err(WaveError::InvalidManifest {
                path: path.display().to_string(),
                line: None,
                message: issues
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            });
        }
        Ok(manifest)
    }

    /// Parse without touching the filesystem; used by tests and `wave do`.
    pub fn from_str_with_base(text: &str, base_dir: &Path) -> Result<Self, WaveError> {
        let mut manifest: Manifest =
            serde_yaml::from_str(text).map_err(|e| WaveError::InvalidManifest {
                path: "<inline>".to_string(),
                line: e.location().map(|l| l.line()),
                message: e.to_string(),
            })?;
        manifest.base_dir = base_dir.to_path_buf();
        Ok(manifest)
    }

    /// Aggregate every validation finding.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.api_version != MANIFEST_API_VERSION {
            issues.push(ValidationIssue {
                at: "apiVersion".into(),
                message: format!(
                    "expected '{MANIFEST_API_VERSION}', got '{}'",
                    self.api_version
                ),
            });
        }
        if self.kind != MANIFEST_KIND {
            issues.push(ValidationIssue {
                at: "kind".into(),
                message: format!("expected '{MANIFEST_KIND}', got '{}'", self.kind),
            });
        }
        if self.metadata.name.is_empty() {
            issues.push(ValidationIssue {
                at: "metadata.name".into(),
                message: "project name must not be empty".into(),
            });
        }

        for (name, adapter) in &self.adapters {
            if adapter.binary.is_empty() {
                issues.push(ValidationIssue {
                    at: format!("adapters.{name}.binary"),
                    message: "binary must not be empty".into(),
                });
            }
            if adapter.context_window == 0 {
                issues.push(ValidationIssue {
                    at: format!("adapters.{name}.context_window"),
                    message: "context window must be positive".into(),
                });
            }
        }

        for (name, persona) in &self.personas {
            if !self.adapters.contains_key(&persona.adapter) {
                issues.push(ValidationIssue {
                    at: format!("personas.{name}.adapter"),
                    message: format!("unknown adapter '{}'", persona.adapter),
                });
            }
            let prompt_path = self.resolve_path(&persona.system_prompt);
            if !prompt_path.is_file() {
                issues.push(ValidationIssue {
                    at: format!("personas.{name}.system_prompt"),
                    message: format!("file not found: {}", prompt_path.display()),
                });
            }
            if !(0.0..=1.0).contains(&persona.temperature) {
                issues.push(ValidationIssue {
                    at: format!("personas.{name}.temperature"),
                    message: format!("temperature {} outside 0.0..=1.0", persona.temperature),
                });
            }
        }

        let rt = &self.runtime;
        if rt.max_concurrent_workers == 0 {
            issues.push(ValidationIssue {
                at: "runtime.max_concurrent_workers".into(),
                message: "must be at least 1".into(),
            });
        }
        if rt.relay_threshold_percent == 0 || rt.relay_threshold_percent > 100 {
            issues.push(ValidationIssue {
                at: "runtime.relay_threshold_percent".into(),
                message: format!("{} outside 1..=100", rt.relay_threshold_percent),
            });
        }
        if let Some(summarizer) = &rt.summarizer_persona {
            if !self.personas.contains_key(summarizer) {
                issues.push(ValidationIssue {
                    at: "runtime.summarizer_persona".into(),
                    message: format!("unknown persona '{summarizer}'"),
                });
            }
        }

        for (i, mount) in self.skill_mounts.iter().enumerate() {
            let path = self.resolve_path(&mount.path);
            if !path.exists() {
                issues.push(ValidationIssue {
                    at: format!("skill_mounts[{i}].path"),
                    message: format!("path not found: {}", path.display()),
                });
            }
        }

        issues
    }

    /// Resolve a manifest-relative path.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn persona(&self, name: &str) -> Result<&PersonaSpec, WaveError> {
        self.personas
            .get(name)
            .ok_or_else(|| WaveError::MissingPersona { name: name.into() })
    }

    pub fn adapter(&self, name: &str) -> Result<&AdapterSpec, WaveError> {
        self.adapters
            .get(name)
            .ok_or_else(|| WaveError::MissingAdapter { name: name.into() })
    }

    /// Adapter defaults merged with persona overrides (deny wins).
    pub fn effective_permissions(&self, persona_name: &str) -> Result<PermissionSet, WaveError> {
        let persona = self.persona(persona_name)?;
        let adapter = self.adapter(&persona.adapter)?;
        Ok(adapter
            .default_permissions
            .merged_with(persona.permissions.as_ref()))
    }
}
