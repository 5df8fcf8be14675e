//! Matrix fan-out.
//!
//! A step with a matrix strategy reads a JSON array of task contexts from
//! a workspace-relative items file and runs one worker per item with
//! bounded concurrency `min(declared_max, runtime.max_concurrent_workers)`.
//! Each worker owns an isolated sibling workspace under the parent step's
//! directory, receives its item as an injected artifact, and follows the
//! same attempt loop as an ordinary step - contracts, retries, relay
//! included. The parent step completes only when every worker has
//! terminated.

use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::error::WaveError;
use crate::events::Event;
use crate::executor::{
    AttemptResult, AttemptSource, AttemptSpec, ExecuteOptions, Executor, StepTransitions,
};
use crate::pipeline::{ExecutionSource, MatrixConfig, Step};
use crate::template::RenderContext;
use crate::types::{CancelFlag, RunId, StepStatus};

/// Workspace-relative path each worker's item is materialized at.
const ITEM_PATH: &str = "inputs/item.json";

pub(crate) async fn execute_matrix(
    executor: &Executor,
    run_id: &RunId,
    step: &Step,
    matrix: &MatrixConfig,
    input: &str,
    cancel: &CancelFlag,
    options: &ExecuteOptions,
) -> Result<(), WaveError> {
    let started = tokio::time::Instant::now();
    let parent_ws = executor.workspaces.prepare(
        run_id,
        &step.id,
        &step.workspace,
        &executor.manifest.skill_mounts,
    )?;
    executor.inject_artifacts(run_id, step, &parent_ws).await?;

    let mut transitions = StepTransitions::durable(
        executor,
        run_id,
        &step.id,
        parent_ws.display().to_string(),
        0,
    );
    transitions.record(StepStatus::Running, None).await?;
    executor
        .emit(Event::step_started(run_id, &step.id, &step.persona))
        .await?;

    let items = match read_items(&parent_ws.join(&matrix.items)) {
        Ok(items) => items,
        Err(e) => {
            transitions
                .record(StepStatus::Failed, Some(e.to_string()))
                .await?;
            executor
                .emit(Event::step_failed(
                    run_id,
                    &step.id,
                    &step.persona,
                    started.elapsed().as_millis() as u64,
                    e.to_string(),
                ))
                .await?;
            return Err(e);
        }
    };

    // Zero input items: the step completes immediately with no workers.
    if items.is_empty() {
        transitions.record(StepStatus::Completed, None).await?;
        executor
            .emit(Event::step_completed(
                run_id,
                &step.id,
                &step.persona,
                started.elapsed().as_millis() as u64,
                0,
            ))
            .await?;
        return Ok(());
    }

    let worker_limit = matrix
        .max_parallel
        .min(executor.manifest.runtime.max_concurrent_workers)
        .max(1);

    let mut results: Vec<(usize, Result<AttemptResult, WaveError>)> =
        stream::iter(items.iter().enumerate().map(|(index, item)| {
            let cancel = cancel.clone();
            async move {
                let result =
                    run_worker(executor, run_id, step, index, item, input, &cancel, options)
                        .await;
                (index, result)
            }
        }))
        .buffer_unordered(worker_limit)
        .collect()
        .await;
    results.sort_by_key(|(index, _)| *index);

    let total_workers = results.len();
    let mut tokens = 0u64;
    let mut successes: Vec<usize> = Vec::new();
    let mut first_failure: Option<WaveError> = None;
    let mut cancelled = false;

    for (index, result) in results {
        match result {
            Ok(attempt) => {
                tokens += attempt.tokens;
                successes.push(index);
            }
            Err(WaveError::Cancelled) => cancelled = true,
            Err(e) => {
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }
    }

    if cancelled || cancel.is_requested() {
        return Err(WaveError::Cancelled);
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    match first_failure {
        None => {
            // Merge every worker's artifacts under disambiguated names.
            for index in &successes {
                register_worker_outputs(executor, run_id, step, *index).await?;
            }
            transitions.record(StepStatus::Completed, None).await?;
            executor
                .emit(Event::step_completed(
                    run_id,
                    &step.id,
                    &step.persona,
                    duration_ms,
                    tokens,
                ))
                .await?;
            Ok(())
        }
        Some(failure) => {
            // A permanent worker failure fails the step. Siblings already
            // ran to completion; continue_on_error preserves their results
            // and the partial outcome surfaces through the event message.
            let message = if matrix.continue_on_error {
                for index in &successes {
                    register_worker_outputs(executor, run_id, step, *index).await?;
                }
                format!(
                    "partial_success: {}/{} workers completed; first failure: {failure}",
                    successes.len(),
                    total_workers
                )
            } else {
                format!(
                    "{}/{} workers failed; sibling results discarded; first failure: {failure}",
                    total_workers - successes.len(),
                    total_workers
                )
            };
            transitions
                .record(StepStatus::Failed, Some(message.clone()))
                .await?;
            executor
                .emit(Event::step_failed(
                    run_id,
                    &step.id,
                    &step.persona,
                    duration_ms,
                    message,
                ))
                .await?;
            Err(failure)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    executor: &Executor,
    run_id: &RunId,
    step: &Step,
    index: usize,
    item: &Value,
    input: &str,
    cancel: &CancelFlag,
    options: &ExecuteOptions,
) -> Result<AttemptResult, WaveError> {
    let workspace = executor.workspaces.prepare_worker(
        run_id,
        &step.id,
        index,
        &step.workspace,
        &executor.manifest.skill_mounts,
    )?;

    // The worker's item arrives as an injected artifact.
    let item_text = serde_json::to_string_pretty(item)
        .map_err(|e| WaveError::workspace(format!("serialize matrix item {index}: {e}")))?;
    let item_path = workspace.join(ITEM_PATH);
    if let Some(parent) = item_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&item_path, &item_text)?;

    // Plus everything the parent step declares in its memory config. The
    // item itself is addressable as `{{ artifact:item }}`; `{{ input }}`
    // keeps meaning the run input, same as any other step.
    let mut artifacts = executor.inject_artifacts(run_id, step, &workspace).await?;
    artifacts.insert("item".to_string(), ITEM_PATH.to_string());

    let render = RenderContext {
        input: input.to_string(),
        artifacts,
    };

    let spec = AttemptSpec {
        step_id: step.id.clone(),
        persona: step.persona.clone(),
        source: match step.source() {
            ExecutionSource::Prompt(p) => AttemptSource::Prompt(p.to_string()),
            ExecutionSource::Command(c) => AttemptSource::Command(c.to_string()),
        },
        handover: step.handover.clone(),
        outputs: step.outputs.clone(),
        pre_validate: step.pre_validate.clone(),
        timeout: options.timeout.unwrap_or_else(|| {
            std::time::Duration::from_secs(
                step.timeout_secs
                    .unwrap_or(executor.manifest.runtime.default_timeout_secs),
            )
        }),
        contract_retries: step
            .max_retries
            .unwrap_or(executor.manifest.runtime.max_retries),
        execution_retries: executor.manifest.runtime.execution_max_retries,
        threshold_percent: step
            .handover
            .as_ref()
            .and_then(|h| h.compaction.as_ref())
            .and_then(|c| c.threshold_percent)
            .unwrap_or(executor.manifest.runtime.relay_threshold_percent),
        worker: Some(index),
    };

    let mut transitions = StepTransitions::detached(executor, run_id, &step.id);
    executor
        .run_attempt_loop(run_id, &spec, &workspace, &render, cancel, &mut transitions)
        .await
}

/// Merge one worker's declared outputs into the parent step's artifact
/// set, disambiguated by worker index.
async fn register_worker_outputs(
    executor: &Executor,
    run_id: &RunId,
    step: &Step,
    index: usize,
) -> Result<(), WaveError> {
    let worker_dir = executor.workspaces.worker_dir(run_id, &step.id, index);
    for output in &step.outputs {
        let path = worker_dir.join(&output.path);
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        executor
            .store
            .register_artifact(
                run_id.as_str(),
                &step.id,
                &format!("{}-w{index}", output.name),
                &format!("worker-{index}/{}", output.path),
                output.artifact_type.as_str(),
                size,
            )
            .await?;
    }
    Ok(())
}

fn read_items(path: &std::path::Path) -> Result<Vec<Value>, WaveError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        WaveError::workspace(format!("matrix items file {}: {e}", path.display()))
    })?;
    let value: Value = serde_json::from_str(&text)
        .map_err(|e| WaveError::workspace(format!("matrix items are not valid JSON: {e}")))?;
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(WaveError::workspace(
            "matrix items file must contain a JSON array",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_items_accepts_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        std::fs::write(&path, r#"[{"file": "a.rs"}, {"file": "b.rs"}]"#).unwrap();
        let items = read_items(&path).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["file"], "a.rs");
    }

    #[test]
    fn read_items_rejects_non_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        std::fs::write(&path, r#"{"not": "an array"}"#).unwrap();
        assert!(read_items(&path).is_err());
    }

    #[test]
    fn read_items_rejects_missing_file() {
        assert!(read_items(std::path::Path::new("/nonexistent/items.json")).is_err());
    }
}
