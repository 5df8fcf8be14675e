//! Core identifier and status types shared across the engine.
//!
//! - [`RunId`] - unique, sortable, human-legible run identifier
//! - [`RunStatus`] - run-level lifecycle
//! - [`StepStatus`] - 5-state step machine with legal-transition checking
//! - [`CancelFlag`] - in-process cooperative cancellation handle

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ============================================================================
// RUN IDENTIFIER
// ============================================================================

/// Unique identifier for a single pipeline invocation.
///
/// Format: `${pipeline_name}-${YYYYMMDD}-${HHMMSS}-${4-digit-suffix}`,
/// which sorts chronologically per pipeline and stays legible in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh run id for the given pipeline name.
    pub fn generate(pipeline_name: &str) -> Self {
        let now = chrono::Utc::now();
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() % 10_000)
            .unwrap_or(0);
        RunId(format!(
            "{}-{}-{:04}",
            pipeline_name,
            now.format("%Y%m%d-%H%M%S"),
            suffix
        ))
    }

    /// Wrap an existing identifier (e.g. loaded from the state store).
    pub fn from_string(id: impl Into<String>) -> Self {
        RunId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the pipeline name by stripping the date, time, and suffix
    /// segments. Returns the whole id if it does not match the format.
    pub fn pipeline_name(&self) -> &str {
        let dashes: Vec<usize> = self
            .0
            .bytes()
            .enumerate()
            .filter_map(|(i, b)| (b == b'-').then_some(i))
            .collect();
        if dashes.len() >= 3 {
            &self.0[..dashes[dashes.len() - 3]]
        } else {
            &self.0
        }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

// ============================================================================
// RUN STATUS
// ============================================================================

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// STEP STATUS (5-state machine)
// ============================================================================

/// Per-step state machine.
///
/// `Pending -> Running -> {Completed, Failed, Retrying}` with
/// `Retrying -> Running` as the only re-entry. Compaction is a sub-phase of
/// `Running`, not a separate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StepStatus::Pending),
            "running" => Some(StepStatus::Running),
            "completed" => Some(StepStatus::Completed),
            "failed" => Some(StepStatus::Failed),
            "retrying" => Some(StepStatus::Retrying),
            _ => None,
        }
    }

    /// Whether moving from `self` to `to` is a legal transition.
    pub fn can_transition_to(&self, to: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Retrying)
                | (Retrying, Running)
                | (Retrying, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CANCELLATION
// ============================================================================

/// In-process cancellation handle shared between the executor, matrix
/// workers, and adapter read loops.
///
/// Cancellation is cooperative: observers check the flag at step boundaries
/// and adapter polling points. A force cancellation additionally permits
/// killing the active adapter's process group.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    requested: AtomicBool,
    force: AtomicBool,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. `force` permits immediate subprocess
    /// termination instead of waiting for the next polling point.
    pub fn request(&self, force: bool) {
        self.inner.requested.store(true, Ordering::SeqCst);
        if force {
            self.inner.force.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    pub fn is_force(&self) -> bool {
        self.inner.force.load(Ordering::SeqCst)
    }
}

/// Validate a step identifier: alphanumeric plus `-` and `_`, max 64 chars.
pub fn valid_step_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_format() {
        let id = RunId::generate("code-review");
        let s = id.as_str();
        assert!(s.starts_with("code-review-"));
        // pipeline-YYYYMMDD-HHMMSS-NNNN
        let parts: Vec<&str> = s.rsplitn(4, '-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].len(), 4); // suffix
        assert_eq!(parts[1].len(), 6); // HHMMSS
        assert_eq!(parts[2].len(), 8); // YYYYMMDD
    }

    #[test]
    fn run_id_recovers_pipeline_name() {
        let id = RunId::generate("issue-enhancer");
        assert_eq!(id.pipeline_name(), "issue-enhancer");

        let odd = RunId::from_string("noformat");
        assert_eq!(odd.pipeline_name(), "noformat");
    }

    #[test]
    fn run_ids_sort_chronologically_per_pipeline() {
        let a = RunId::from_string("p-20250101-000000-0001");
        let b = RunId::from_string("p-20250102-000000-0001");
        assert!(a.as_str() < b.as_str());
    }

    #[test]
    fn run_status_roundtrip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn run_status_terminality() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn step_machine_legal_transitions() {
        use StepStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Running));
    }

    #[test]
    fn step_machine_illegal_transitions() {
        use StepStatus::*;
        // Terminal states never leave.
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        // No shortcut from Pending to a terminal state.
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        // Retrying re-enters Running only.
        assert!(!Retrying.can_transition_to(Completed));
    }

    #[test]
    fn cancel_flag_propagates_to_clones() {
        let flag = CancelFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_requested());

        flag.request(false);
        assert!(observer.is_requested());
        assert!(!observer.is_force());

        flag.request(true);
        assert!(observer.is_force());
    }

    #[test]
    fn step_id_validation() {
        assert!(valid_step_id("navigate"));
        assert!(valid_step_id("step_1"));
        assert!(valid_step_id("fix-lints"));
        assert!(!valid_step_id(""));
        assert!(!valid_step_id("has space"));
        assert!(!valid_step_id(&"x".repeat(65)));
    }
}
