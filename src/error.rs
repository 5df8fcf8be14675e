//! Unified error taxonomy for the Wave engine.
//!
//! Every error carries a stable kind string (for events and audit records)
//! and knows whether the executor may retry it. Step-level errors are
//! retried up to the step's budget; infrastructure errors halt the run.
//!
//! | Kind | Surface | Retry? |
//! |------|---------|--------|
//! | `invalid_manifest` / `invalid_pipeline` | validation / load | no |
//! | `missing_adapter` / `missing_persona` | validation | no |
//! | `adapter_failed` / `adapter_timeout` / `adapter_protocol` | during step | yes |
//! | `contract_failure` | after step | yes, with repair prompt |
//! | `malformed_json` | JSON contract | yes, with cleaning hints |
//! | `workspace` | pre-step | no (fatal for the step) |
//! | `state_store` | anywhere | no (write errors halt the run) |
//! | `relay_recursion` | in relay | no (fatal for the run) |
//! | `cancelled` | anywhere | no (intended outcome) |

use thiserror::Error;

use crate::contract::ContractFailure;

/// Top-level error type for the Wave engine.
#[derive(Error, Debug)]
pub enum WaveError {
    /// Manifest failed to load or validate. Reported with path and, where
    /// the YAML parser provides one, a line number.
    #[error("invalid manifest {path}{}: {message}", fmt_line(.line))]
    InvalidManifest {
        path: String,
        line: Option<usize>,
        message: String,
    },

    /// Pipeline definition failed validation (cycles, duplicate ids,
    /// unknown references).
    #[error("invalid pipeline '{pipeline}': {message}")]
    InvalidPipeline { pipeline: String, message: String },

    /// A persona references an adapter the manifest does not declare, or
    /// the adapter binary is absent.
    #[error("missing adapter '{name}'")]
    MissingAdapter { name: String },

    /// A step references a persona the manifest does not declare.
    #[error("missing persona '{name}'")]
    MissingPersona { name: String },

    /// Adapter subprocess exited non-zero.
    #[error("adapter failed for persona '{persona}' (exit {exit_code}): {detail}")]
    AdapterFailed {
        persona: String,
        exit_code: i32,
        detail: String,
    },

    /// Adapter subprocess exceeded the step timeout and was killed.
    #[error("adapter timed out for persona '{persona}' after {seconds}s")]
    AdapterTimeout { persona: String, seconds: u64 },

    /// Adapter produced output the NDJSON protocol cannot account for
    /// (including the no-events-but-exit-0 case).
    #[error("adapter protocol error for persona '{persona}': {message}")]
    AdapterProtocolError { persona: String, message: String },

    /// Handover contract validation failed.
    #[error("contract failure: {0}")]
    Contract(ContractFailure),

    /// A JSON contract target could not be repaired into parseable JSON.
    #[error("malformed JSON: {defect}")]
    MalformedJson { defect: String },

    /// Workspace preparation or artifact injection failed.
    #[error("workspace error: {message}")]
    Workspace { message: String },

    /// Durable state store failure.
    #[error("state store error: {message}")]
    StateStore { message: String },

    /// The summarizer itself hit its token cap while producing a
    /// checkpoint. Never recurse.
    #[error("relay recursion: summarizer exceeded its own token cap")]
    RelayRecursion,

    /// The run was cancelled. Not a failure.
    #[error("run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn fmt_line(line: &Option<usize>) -> String {
    match line {
        Some(n) => format!(":{n}"),
        None => String::new(),
    }
}

impl WaveError {
    /// Stable machine-readable kind, used in events and audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            WaveError::InvalidManifest { .. } => "invalid_manifest",
            WaveError::InvalidPipeline { .. } => "invalid_pipeline",
            WaveError::MissingAdapter { .. } => "missing_adapter",
            WaveError::MissingPersona { .. } => "missing_persona",
            WaveError::AdapterFailed { .. } => "adapter_failed",
            WaveError::AdapterTimeout { .. } => "adapter_timeout",
            WaveError::AdapterProtocolError { .. } => "adapter_protocol",
            WaveError::Contract(_) => "contract_failure",
            WaveError::MalformedJson { .. } => "malformed_json",
            WaveError::Workspace { .. } => "workspace",
            WaveError::StateStore { .. } => "state_store",
            WaveError::RelayRecursion => "relay_recursion",
            WaveError::Cancelled => "cancelled",
            WaveError::Io(_) => "io",
            WaveError::Yaml(_) => "yaml",
        }
    }

    /// Whether the executor may re-run the step after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WaveError::AdapterFailed { .. }
                | WaveError::AdapterTimeout { .. }
                | WaveError::AdapterProtocolError { .. }
                | WaveError::Contract(_)
                | WaveError::MalformedJson { .. }
        )
    }

    /// Process exit code for the CLI surface.
    ///
    /// 0 success, 1 general error, 2 usage error (clap-owned), 3 pipeline
    /// failed, 4 validation error, 5 timeout, 130 interrupted.
    pub fn exit_code(&self) -> i32 {
        match self {
            WaveError::InvalidManifest { .. }
            | WaveError::InvalidPipeline { .. }
            | WaveError::MissingAdapter { .. }
            | WaveError::MissingPersona { .. } => 4,
            WaveError::AdapterTimeout { .. } => 5,
            WaveError::Cancelled => 130,
            WaveError::AdapterFailed { .. }
            | WaveError::AdapterProtocolError { .. }
            | WaveError::Contract(_)
            | WaveError::MalformedJson { .. }
            | WaveError::RelayRecursion => 3,
            _ => 1,
        }
    }

    pub fn workspace(message: impl Into<String>) -> Self {
        WaveError::Workspace {
            message: message.into(),
        }
    }

    pub fn state_store(message: impl Into<String>) -> Self {
        WaveError::StateStore {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for WaveError {
    fn from(e: sqlx::Error) -> Self {
        WaveError::StateStore {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ContractFailure, FailureClass};

    #[test]
    fn retryable_classification() {
        assert!(WaveError::AdapterFailed {
            persona: "navigator".into(),
            exit_code: 1,
            detail: "boom".into(),
        }
        .is_retryable());
        assert!(WaveError::AdapterTimeout {
            persona: "navigator".into(),
            seconds: 60,
        }
        .is_retryable());
        assert!(WaveError::MalformedJson {
            defect: "trailing comma".into(),
        }
        .is_retryable());

        assert!(!WaveError::Cancelled.is_retryable());
        assert!(!WaveError::RelayRecursion.is_retryable());
        assert!(!WaveError::workspace("mkdir failed").is_retryable());
        assert!(!WaveError::state_store("disk full").is_retryable());
    }

    #[test]
    fn contract_errors_are_retryable() {
        let failure = ContractFailure::new(
            FailureClass::SchemaMismatch,
            "$.title",
            "expected string, got null",
        );
        assert!(WaveError::Contract(failure).is_retryable());
    }

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(
            WaveError::MissingPersona {
                name: "ghost".into()
            }
            .exit_code(),
            4
        );
        assert_eq!(
            WaveError::AdapterTimeout {
                persona: "x".into(),
                seconds: 1
            }
            .exit_code(),
            5
        );
        assert_eq!(WaveError::Cancelled.exit_code(), 130);
        assert_eq!(
            WaveError::AdapterFailed {
                persona: "x".into(),
                exit_code: 2,
                detail: "".into()
            }
            .exit_code(),
            3
        );
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(WaveError::RelayRecursion.kind(), "relay_recursion");
        assert_eq!(WaveError::Cancelled.kind(), "cancelled");
        assert_eq!(
            WaveError::InvalidManifest {
                path: "wave.yaml".into(),
                line: Some(3),
                message: "bad".into()
            }
            .kind(),
            "invalid_manifest"
        );
    }

    #[test]
    fn manifest_error_formats_line() {
        let err = WaveError::InvalidManifest {
            path: "wave.yaml".into(),
            line: Some(12),
            message: "unknown adapter 'gpt'".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid manifest wave.yaml:12: unknown adapter 'gpt'"
        );
    }
}
