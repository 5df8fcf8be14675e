//! Pipeline definition types.
//!
//! A pipeline is an ordered set of steps forming a DAG; each step names a
//! persona, its dependencies, a memory strategy (always `fresh` - no
//! inherited agent history), workspace mounts, an execution source
//! (prompt template or shell command), declared output artifacts, and an
//! optional handover contract, matrix strategy, and pre-execution
//! validations.
//!
//! Pipelines are static data, not code: the only templating is
//! `{{ input }}` and declared artifact placeholders. Any computed
//! structure is rejected at validation time.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::WaveError;
use crate::manifest::Manifest;
use crate::template;
use crate::types::valid_step_id;

pub const PIPELINE_API_VERSION: &str = "wave/v1";
pub const PIPELINE_KIND: &str = "WavePipeline";

// ============================================================================
// PIPELINE ROOT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pipeline {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: PipelineMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct InputSpec {
    pub description: Option<String>,
    /// Regex the run input must match, checked before the first step.
    pub pattern: Option<String>,
}

// ============================================================================
// STEP
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Unique within the pipeline.
    pub id: String,
    /// Persona in the manifest that executes this step.
    pub persona: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    // Execution source - exactly one must be present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<ArtifactSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handover: Option<HandoverConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_validate: Vec<PreValidation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl Step {
    /// The execution source, assuming the step already validated.
    pub fn source(&self) -> ExecutionSource<'_> {
        match (&self.prompt, &self.command) {
            (Some(prompt), _) => ExecutionSource::Prompt(prompt),
            (None, Some(command)) => ExecutionSource::Command(command),
            (None, None) => ExecutionSource::Prompt(""),
        }
    }
}

/// Either a prompt template for the persona or a shell command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExecutionSource<'a> {
    Prompt(&'a str),
    Command(&'a str),
}

// ============================================================================
// MEMORY & WORKSPACE
// ============================================================================

/// Every step starts with no inherited agent history; the only memory a
/// step receives is the artifacts it explicitly injects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MemoryConfig {
    pub strategy: MemoryStrategy,
    pub inject: Vec<ArtifactInjection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStrategy {
    #[default]
    Fresh,
}

/// Materialize an upstream artifact into this step's workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactInjection {
    pub from_step: String,
    /// Artifact name declared by the upstream step.
    pub artifact: String,
    /// Workspace-relative path to materialize at; defaults to
    /// `inputs/<artifact name>`.
    #[serde(default, rename = "as")]
    pub as_path: Option<String>,
}

impl ArtifactInjection {
    pub fn target_path(&self) -> String {
        match &self.as_path {
            Some(path) => path.clone(),
            None => format!("inputs/{}", self.artifact),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkspaceConfig {
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Mount {
    /// Source path, relative to the project root.
    pub source: PathBuf,
    /// Workspace-relative target; defaults to the source file name.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub access: MountAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountAccess {
    /// Symlinked, never written through.
    #[default]
    Ro,
    /// Copied into the workspace so the source is never modified in place.
    Rw,
}

// ============================================================================
// ARTIFACTS & HANDOVER
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSpec {
    pub name: String,
    /// Workspace-relative path the step must produce.
    pub path: String,
    #[serde(default, rename = "type")]
    pub artifact_type: ArtifactType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Json,
    Markdown,
    #[default]
    Text,
    Binary,
    Directory,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Json => "json",
            ArtifactType::Markdown => "markdown",
            ArtifactType::Text => "text",
            ArtifactType::Binary => "binary",
            ArtifactType::Directory => "directory",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HandoverConfig {
    pub contract: Option<ContractConfig>,
    /// Additional quality checks applied after the contract.
    pub checks: Vec<QualityCheck>,
    pub compaction: Option<CompactionConfig>,
}

/// Machine-verifiable predicate applied to a step's output before
/// downstream steps may run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContractConfig {
    /// Validate a JSON artifact against a draft 2020-12 schema, after
    /// best-effort cleaning.
    JsonSchema {
        /// Workspace-relative path of the candidate document.
        target: String,
        #[serde(default)]
        schema: Option<String>,
        #[serde(default)]
        schema_file: Option<PathBuf>,
    },
    /// Run a type-check command against a source file; non-zero exit is a
    /// contract failure. Degrades to pass when the binary is missing and
    /// `required` is false.
    CompileCheck {
        command: String,
        source_file: String,
        #[serde(default)]
        required: bool,
    },
    /// Run a test command; any non-zero exit fails the contract.
    TestSuite { command: String },
}

/// Named quality rules beyond the structural contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QualityCheck {
    /// Markdown output must contain every named `#`/`##` section.
    RequiredSections {
        target: String,
        sections: Vec<String>,
    },
    /// Bound the length of the whole file or one JSON string field.
    Length {
        target: String,
        #[serde(default)]
        field: Option<String>,
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
    /// Reject unresolved placeholder markers (TODO, TBD, ...).
    NoPlaceholders { target: String },
    /// First line must be a conventional-commit header.
    ConventionalCommit { target: String },
    /// Relative links in the document must resolve inside the workspace.
    LinksResolve { target: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CompactionConfig {
    /// Override of the runtime relay threshold for this step.
    pub threshold_percent: Option<u8>,
}

// ============================================================================
// MATRIX & PRE-VALIDATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatrixConfig {
    /// Workspace-relative file containing a JSON array of task contexts.
    pub items: String,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Preserve sibling successes when one worker permanently fails.
    #[serde(default)]
    pub continue_on_error: bool,
}

fn default_max_parallel() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PreValidation {
    /// A workspace-relative file must exist before the adapter starts.
    FileExists { path: String },
    /// A shell command must exit 0.
    Command { command: String },
    /// The run input must match this regex.
    InputMatches { pattern: String },
}

// ============================================================================
// LOADING & VALIDATION
// ============================================================================

impl Pipeline {
    pub fn load(path: &Path) -> Result<Self, WaveError> {
        let text = std::fs::read_to_string(path).map_err(|e| WaveError::InvalidPipeline {
            pipeline: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_str_named(&text, &path.display().to_string())
    }

    pub fn from_str_named(text: &str, origin: &str) -> Result<Self, WaveError> {
        serde_yaml::from_str(text).map_err(|e| WaveError::InvalidPipeline {
            pipeline: origin.to_string(),
            message: match e.location() {
                Some(loc) => format!("line {}: {e}", loc.line()),
                None => e.to_string(),
            },
        })
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Aggregate every structural finding against the manifest. DAG shape
    /// (cycles, unknown dependency edges) is the resolver's concern.
    pub fn validate(&self, manifest: &Manifest) -> Vec<String> {
        let mut issues = Vec::new();

        if self.api_version != PIPELINE_API_VERSION {
            issues.push(format!(
                "apiVersion: expected '{PIPELINE_API_VERSION}', got '{}'",
                self.api_version
            ));
        }
        if self.kind != PIPELINE_KIND {
            issues.push(format!(
                "kind: expected '{PIPELINE_KIND}', got '{}'",
                self.kind
            ));
        }
        if self.steps.len() > manifest.runtime.max_pipeline_steps {
            issues.push(format!(
                "pipeline has {} steps, cap is {}",
                self.steps.len(),
                manifest.runtime.max_pipeline_steps
            ));
        }

        let mut seen = BTreeSet::new();
        let outputs_by_step: BTreeMap<&str, BTreeSet<&str>> = self
            .steps
            .iter()
            .map(|s| {
                (
                    s.id.as_str(),
                    s.outputs.iter().map(|o| o.name.as_str()).collect(),
                )
            })
            .collect();

        for step in &self.steps {
            let at = format!("steps.{}", step.id);

            if !valid_step_id(&step.id) {
                issues.push(format!("{at}: invalid step id"));
            }
            if !seen.insert(step.id.as_str()) {
                issues.push(format!("{at}: duplicate step id"));
            }
            if !manifest.personas.contains_key(&step.persona) {
                issues.push(format!("{at}: unknown persona '{}'", step.persona));
            }

            match (&step.prompt, &step.command) {
                (Some(_), Some(_)) => {
                    issues.push(format!("{at}: exactly one of prompt/command, found both"))
                }
                (None, None) => {
                    issues.push(format!("{at}: exactly one of prompt/command, found neither"))
                }
                _ => {}
            }

            for dep in &step.depends_on {
                if dep == &step.id {
                    issues.push(format!("{at}: depends on itself"));
                }
            }

            let injected: BTreeSet<&str> = step
                .memory
                .inject
                .iter()
                .map(|i| i.artifact.as_str())
                .collect();
            for injection in &step.memory.inject {
                if !step.depends_on.contains(&injection.from_step) {
                    issues.push(format!(
                        "{at}: injection '{}' references '{}' which is not a dependency",
                        injection.artifact, injection.from_step
                    ));
                } else if let Some(names) = outputs_by_step.get(injection.from_step.as_str()) {
                    if !names.contains(injection.artifact.as_str()) {
                        issues.push(format!(
                            "{at}: step '{}' declares no artifact '{}'",
                            injection.from_step, injection.artifact
                        ));
                    }
                }
            }

            if let Some(prompt) = &step.prompt {
                for name in template::artifact_refs(prompt) {
                    // Matrix steps implicitly receive their item as an
                    // injected artifact named `item`.
                    if name == "item" && step.matrix.is_some() {
                        continue;
                    }
                    if !injected.contains(name.as_str()) {
                        issues.push(format!(
                            "{at}: prompt references artifact '{name}' that is never injected"
                        ));
                    }
                }
            }

            if let Some(matrix) = &step.matrix {
                if matrix.max_parallel == 0 {
                    issues.push(format!("{at}: matrix.max_parallel must be at least 1"));
                }
            }

            for rule in &step.pre_validate {
                if let PreValidation::InputMatches { pattern } = rule {
                    if regex::Regex::new(pattern).is_err() {
                        issues.push(format!("{at}: invalid input pattern '{pattern}'"));
                    }
                }
            }
        }

        if let Some(InputSpec {
            pattern: Some(pattern),
            ..
        }) = &self.input
        {
            if regex::Regex::new(pattern).is_err() {
                issues.push(format!("input.pattern: invalid regex '{pattern}'"));
            }
        }

        issues
    }

    /// Validate and convert findings into an error.
    pub fn ensure_valid(&self, manifest: &Manifest) -> Result<(), WaveError> {
        let issues = self.validate(manifest);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(WaveError::InvalidPipeline {
                pipeline: self.metadata.name.clone(),
                message: issues.join("; "),
            })
        }
    }

    /// Synthesize the two-step navigate -> execute pipeline used by
    /// `wave do`. Lives only in memory unless the caller saves it.
    pub fn synthesize_do(navigator: &str, executor_persona: &str) -> Self {
        Pipeline {
            api_version: PIPELINE_API_VERSION.to_string(),
            kind: PIPELINE_KIND.to_string(),
            metadata: PipelineMetadata {
                name: "do".to_string(),
                description: Some("ad-hoc task synthesized by `wave do`".to_string()),
            },
            input: Some(InputSpec {
                description: Some("free-form task description".to_string()),
                pattern: None,
            }),
            steps: vec![
                Step {
                    id: "navigate".to_string(),
                    persona: navigator.to_string(),
                    depends_on: vec![],
                    memory: MemoryConfig::default(),
                    workspace: WorkspaceConfig::default(),
                    prompt: Some(
                        "Identify the files, commands, and constraints needed to \
                         accomplish this task. Write your findings to unit.json as a \
                         JSON object with a `files` array and a `notes` string.\n\n\
                         Task: {{ input }}"
                            .to_string(),
                    ),
                    command: None,
                    outputs: vec![ArtifactSpec {
                        name: "unit".to_string(),
                        path: "unit.json".to_string(),
                        artifact_type: ArtifactType::Json,
                    }],
                    handover: Some(HandoverConfig {
                        contract: Some(ContractConfig::JsonSchema {
                            target: "unit.json".to_string(),
                            schema: Some(
                                r#"{"type":"object","required":["files","notes"],"properties":{"files":{"type":"array","items":{"type":"string"}},"notes":{"type":"string"}}}"#
                                    .to_string(),
                            ),
                            schema_file: None,
                        }),
                        checks: vec![],
                        compaction: None,
                    }),
                    matrix: None,
                    pre_validate: vec![],
                    timeout_secs: None,
                    max_retries: None,
                },
                Step {
                    id: "execute".to_string(),
                    persona: executor_persona.to_string(),
                    depends_on: vec!["navigate".to_string()],
                    memory: MemoryConfig {
                        strategy: MemoryStrategy::Fresh,
                        inject: vec![ArtifactInjection {
                            from_step: "navigate".to_string(),
                            artifact: "unit".to_string(),
                            as_path: Some("inputs/unit.json".to_string()),
                        }],
                    },
                    workspace: WorkspaceConfig::default(),
                    prompt: Some(
                        "Read {{ artifact:unit }} first, then complete the task, \
                         restricting yourself to the files it names.\n\nTask: {{ input }}"
                            .to_string(),
                    ),
                    command: None,
                    outputs: vec![],
                    handover: None,
                    matrix: None,
                    pre_validate: vec![PreValidation::FileExists {
                        path: "inputs/unit.json".to_string(),
                    }],
                    timeout_secs: None,
                    max_retries: None,
                },
            ],
        }
    }
}
