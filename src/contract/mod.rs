//! Handover contract validation.
//!
//! Runs at every step boundary after the adapter returns. Three contract
//! variants - JSON schema (draft 2020-12, after best-effort cleaning),
//! compile check, test suite - plus the named quality rules from
//! [`checks`]. Failures are classified so the executor can hand the next
//! retry attempt a concrete repair prompt instead of a bare "try again".

mod clean;
pub mod checks;

pub use clean::{clean, Cleaned};

use std::fmt;
use std::path::Path;
use std::time::Duration;

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

use crate::error::WaveError;
use crate::pipeline::{ContractConfig, HandoverConfig, QualityCheck};

/// Budget for compile-check and test-suite commands.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Shell exit status for "command not found".
const EXIT_COMMAND_NOT_FOUND: i32 = 127;

// ============================================================================
// FAILURE CLASSIFICATION
// ============================================================================

/// Typed failure classes; stable strings surface in events and repair
/// prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    SchemaMismatch,
    FormatError,
    MissingContent,
    Structure,
    QualityGate,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::SchemaMismatch => "schema_mismatch",
            FailureClass::FormatError => "format_error",
            FailureClass::MissingContent => "missing_content",
            FailureClass::Structure => "structure",
            FailureClass::QualityGate => "quality_gate",
        }
    }
}

/// One classified contract failure with repair guidance.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractFailure {
    pub class: FailureClass,
    /// Failing location: a file, or `file#/json/pointer`.
    pub path: String,
    pub detail: String,
    pub suggestions: Vec<String>,
}

impl ContractFailure {
    pub fn new(
        class: FailureClass,
        path: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            class,
            path: path.into(),
            detail: detail.into(),
            suggestions: vec![],
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// Human-readable repair prompt injected into the next retry attempt.
    pub fn repair_prompt(&self) -> String {
        let mut prompt = format!(
            "Your previous output failed its handover contract \
             ({class} at {path}): {detail}.",
            class = self.class.as_str(),
            path = self.path,
            detail = self.detail
        );
        if !self.suggestions.is_empty() {
            prompt.push_str(" Fix it as follows: ");
            prompt.push_str(&self.suggestions.join("; "));
            prompt.push('.');
        }
        prompt
    }
}

impl fmt::Display for ContractFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {}: {}",
            self.class.as_str(),
            self.path,
            self.detail
        )
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

/// Validates step output against its handover configuration.
#[derive(Debug, Clone, Default)]
pub struct ContractValidator;

impl ContractValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a step's handover. The contract runs first, then every
    /// quality check, stopping at the first failure so repair prompts stay
    /// focused.
    pub async fn validate(
        &self,
        workspace: &Path,
        handover: &HandoverConfig,
    ) -> Result<(), WaveError> {
        if let Some(contract) = &handover.contract {
            self.validate_contract(workspace, contract).await?;
        }
        for check in &handover.checks {
            if let Some(failure) = self.run_check(workspace, check)? {
                return Err(WaveError::Contract(failure));
            }
        }
        Ok(())
    }

    async fn validate_contract(
        &self,
        workspace: &Path,
        contract: &ContractConfig,
    ) -> Result<(), WaveError> {
        match contract {
            ContractConfig::JsonSchema {
                target,
                schema,
                schema_file,
            } => self.validate_json_schema(workspace, target, schema.as_deref(), schema_file.as_deref()),
            ContractConfig::CompileCheck {
                command,
                source_file,
                required,
            } => {
                self.validate_command_contract(
                    workspace,
                    &format!("{command} {source_file}"),
                    *required,
                    FailureClass::Structure,
                    "compile check",
                )
                .await
            }
            ContractConfig::TestSuite { command } => {
                self.validate_command_contract(
                    workspace,
                    command,
                    true,
                    FailureClass::QualityGate,
                    "test suite",
                )
                .await
            }
        }
    }

    fn validate_json_schema(
        &self,
        workspace: &Path,
        target: &str,
        inline_schema: Option<&str>,
        schema_file: Option<&Path>,
    ) -> Result<(), WaveError> {
        let target_path = workspace.join(target);
        let raw = std::fs::read_to_string(&target_path).map_err(|e| {
            WaveError::Contract(
                ContractFailure::new(
                    FailureClass::MissingContent,
                    target,
                    format!("output file not readable: {e}"),
                )
                .with_suggestion(format!("write the declared output to '{target}'")),
            )
        })?;

        let cleaned = clean(&raw).map_err(|defect| WaveError::MalformedJson { defect })?;
        let instance: Value = serde_json::from_str(&cleaned.text)
            .map_err(|e| WaveError::MalformedJson { defect: e.to_string() })?;

        let schema_text = match (inline_schema, schema_file) {
            (Some(inline), _) => inline.to_string(),
            (None, Some(file)) => {
                let path = if file.is_absolute() {
                    file.to_path_buf()
                } else {
                    workspace.join(file)
                };
                std::fs::read_to_string(&path).map_err(|e| {
                    WaveError::Contract(ContractFailure::new(
                        FailureClass::Structure,
                        path.display().to_string(),
                        format!("schema file not readable: {e}"),
                    ))
                })?
            }
            (None, None) => {
                return Err(WaveError::Contract(ContractFailure::new(
                    FailureClass::Structure,
                    target,
                    "json_schema contract declares neither schema nor schema_file",
                )))
            }
        };

        let schema_value: Value = serde_json::from_str(&schema_text).map_err(|e| {
            WaveError::Contract(ContractFailure::new(
                FailureClass::Structure,
                target,
                format!("contract schema is not valid JSON: {e}"),
            ))
        })?;
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft202012)
            .compile(&schema_value)
            .map_err(|e| {
                WaveError::Contract(ContractFailure::new(
                    FailureClass::Structure,
                    target,
                    format!("contract schema does not compile: {e}"),
                ))
            })?;

        if let Err(errors) = compiled.validate(&instance) {
            // First-of-path violation keeps the repair prompt focused.
            if let Some(error) = errors.into_iter().next() {
                let pointer = error.instance_path.to_string();
                let failure = ContractFailure::new(
                    FailureClass::SchemaMismatch,
                    format!("{target}#{pointer}"),
                    error.to_string(),
                )
                .with_suggestion("regenerate the output so it conforms to the declared schema");
                return Err(WaveError::Contract(failure));
            }
        }

        // Schema-conformant output can still carry empty required fields or
        // placeholder markers; both are missing content.
        if let Some(required) = schema_value.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if instance.get(key).and_then(Value::as_str) == Some("") {
                    return Err(WaveError::Contract(
                        ContractFailure::new(
                            FailureClass::MissingContent,
                            format!("{target}#/{key}"),
                            "required field is empty",
                        )
                        .with_suggestion(format!("populate the '{key}' field with real content")),
                    ));
                }
            }
        }
        if let Some(failure) = scan_strings_for_placeholders(target, &instance) {
            return Err(WaveError::Contract(failure));
        }

        Ok(())
    }

    async fn validate_command_contract(
        &self,
        workspace: &Path,
        command: &str,
        required: bool,
        class: FailureClass,
        label: &str,
    ) -> Result<(), WaveError> {
        let output = tokio::time::timeout(
            COMMAND_TIMEOUT,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(workspace)
                .output(),
        )
        .await
        .map_err(|_| {
            WaveError::Contract(ContractFailure::new(
                class,
                command.to_string(),
                format!("{label} timed out after {}s", COMMAND_TIMEOUT.as_secs()),
            ))
        })?
        .map_err(|e| {
            WaveError::Contract(ContractFailure::new(
                class,
                command.to_string(),
                format!("{label} could not start: {e}"),
            ))
        })?;

        let code = output.status.code().unwrap_or(-1);
        if code == 0 {
            return Ok(());
        }
        // A missing type-check binary degrades to pass unless the contract
        // explicitly requires it.
        if code == EXIT_COMMAND_NOT_FOUND && !required {
            tracing::warn!(command, "{label} binary missing; contract degrades to pass");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(WaveError::Contract(
            ContractFailure::new(
                class,
                command.to_string(),
                format!("{label} exited {code}: {}", stderr.trim()),
            )
            .with_suggestion(format!("make '{command}' pass before handing over")),
        ))
    }

    fn run_check(
        &self,
        workspace: &Path,
        check: &QualityCheck,
    ) -> Result<Option<ContractFailure>, WaveError> {
        let read = |target: &str| -> Result<String, WaveError> {
            std::fs::read_to_string(workspace.join(target)).map_err(|e| {
                WaveError::Contract(ContractFailure::new(
                    FailureClass::MissingContent,
                    target,
                    format!("output file not readable: {e}"),
                ))
            })
        };

        Ok(match check {
            QualityCheck::RequiredSections { target, sections } => {
                checks::required_sections(target, &read(target)?, sections)
            }
            QualityCheck::Length {
                target,
                field,
                min,
                max,
            } => checks::length_bounds(target, &read(target)?, field.as_deref(), *min, *max),
            QualityCheck::NoPlaceholders { target } => {
                checks::no_placeholders(target, &read(target)?)
            }
            QualityCheck::ConventionalCommit { target } => {
                checks::conventional_commit(target, &read(target)?)
            }
            QualityCheck::LinksResolve { target } => {
                checks::links_resolve(target, &read(target)?, workspace)
            }
        })
    }
}

fn scan_strings_for_placeholders(target: &str, value: &Value) -> Option<ContractFailure> {
    fn walk(path: &mut String, value: &Value) -> Option<(String, String)> {
        match value {
            Value::String(s) => checks::no_placeholders("", s).map(|f| (path.clone(), f.detail)),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    let len = path.len();
                    path.push_str(&format!("/{i}"));
                    if let Some(hit) = walk(path, item) {
                        return Some(hit);
                    }
                    path.truncate(len);
                }
                None
            }
            Value::Object(map) => {
                for (key, item) in map {
                    let len = path.len();
                    path.push_str(&format!("/{key}"));
                    if let Some(hit) = walk(path, item) {
                        return Some(hit);
                    }
                    path.truncate(len);
                }
                None
            }
            _ => None,
        }
    }

    let mut path = String::new();
    walk(&mut path, value).map(|(pointer, detail)| {
        ContractFailure::new(
            FailureClass::MissingContent,
            format!("{target}#{pointer}"),
            detail,
        )
        .with_suggestion("replace every placeholder marker with finished content")
    })
}
