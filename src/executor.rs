//! Pipeline executor.
//!
//! The central authority over one run. For each step in topological
//! order: evaluate pre-execution validations, prepare the workspace,
//! render the prompt, invoke the adapter with a bounded timeout, feed the
//! relay monitor, validate the handover contract, register artifacts, and
//! persist every transition. Step-level failures retry with exponential
//! backoff and a repair prompt; infrastructure failures halt the run.
//! Every transition emits exactly one event - nothing is silent.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::adapter::{AdapterEvent, AdapterRegistry, RunConfig};
use crate::audit::AuditLog;
use crate::contract::{ContractFailure, ContractValidator, FailureClass};
use crate::dag;
use crate::error::WaveError;
use crate::events::{Event, EventSink};
use crate::manifest::Manifest;
use crate::matrix;
use crate::pipeline::{ExecutionSource, Pipeline, PreValidation, Step};
use crate::relay::{Relay, RelayMonitor};
use crate::state::{StateStore, StepRecord};
use crate::template::{self, RenderContext};
use crate::types::{CancelFlag, RunId, RunStatus, StepStatus};
use crate::workspace::WorkspaceManager;

/// Retry backoff: base doubling, capped.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// How often the durable cancellation flag is polled during a run.
const CANCEL_POLL: Duration = Duration::from_millis(500);

/// Budget for shell-command steps' output collection.
const COMMAND_GRACE: Duration = Duration::from_secs(1);

pub struct Executor {
    pub(crate) manifest: Arc<Manifest>,
    pub(crate) store: Arc<StateStore>,
    pub(crate) sink: EventSink,
    pub(crate) workspaces: WorkspaceManager,
    pub(crate) registry: AdapterRegistry,
    pub(crate) validator: ContractValidator,
    pub(crate) audit: Arc<AuditLog>,
    pub(crate) relay: Relay,
}

/// Options for `execute` / `resume`.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Skip every step ordered before this one.
    pub from_step: Option<String>,
    /// Override every step's timeout.
    pub timeout: Option<Duration>,
    pub tags: Vec<String>,
}

/// Terminal description of one run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub total_tokens: u64,
    pub error: Option<String>,
}

impl Executor {
    pub fn new(
        manifest: Arc<Manifest>,
        store: Arc<StateStore>,
        sink: EventSink,
        workspaces: WorkspaceManager,
        registry: AdapterRegistry,
        audit: Arc<AuditLog>,
    ) -> Self {
        let relay = Relay::new(Arc::clone(&manifest), registry.clone());
        Self {
            manifest,
            store,
            sink,
            workspaces,
            registry,
            validator: ContractValidator::new(),
            audit,
            relay,
        }
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Main entry point: create the run record and walk the DAG.
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        input: &str,
        options: &ExecuteOptions,
    ) -> Result<RunSummary, WaveError> {
        pipeline.ensure_valid(&self.manifest)?;
        let plan = dag::resolve(pipeline.name(), &pipeline.steps)?;

        let run_id = RunId::generate(pipeline.name());
        self.store
            .create_run(&run_id, pipeline.name(), input, &options.tags)
            .await?;

        self.run_steps(&run_id, pipeline, &plan, input, options, false)
            .await
    }

    /// Continue a run from its first step not `Completed`. `Running` and
    /// `Retrying` steps found at load time are treated as `Failed` - the
    /// previous process died mid-flight.
    pub async fn resume(
        &self,
        run_id: &RunId,
        pipeline: &Pipeline,
        options: &ExecuteOptions,
    ) -> Result<RunSummary, WaveError> {
        pipeline.ensure_valid(&self.manifest)?;
        let plan = dag::resolve(pipeline.name(), &pipeline.steps)?;

        self.store
            .get_run(run_id.as_str())
            .await?
            .ok_or_else(|| WaveError::state_store(format!("unknown run '{run_id}'")))?;

        // A stale flag from the crashed process must not cancel the new one.
        self.store.clear_cancellation(run_id.as_str()).await?;

        for step in self.store.get_steps(run_id.as_str()).await? {
            if matches!(step.state, StepStatus::Running | StepStatus::Retrying) {
                self.store
                    .upsert_step(&StepRecord {
                        state: StepStatus::Failed,
                        updated_at: chrono::Utc::now(),
                        error_message: Some("previous process died mid-step".into()),
                        ..step
                    })
                    .await?;
            }
        }

        self.store.reopen_run(run_id.as_str()).await?;
        let run = self
            .store
            .get_run(run_id.as_str())
            .await?
            .ok_or_else(|| WaveError::state_store(format!("unknown run '{run_id}'")))?;

        self.run_steps(run_id, pipeline, &plan, &run.input, options, true)
            .await
    }

    /// Write the durable cancellation flag; the polling loop observes it.
    pub async fn cancel(&self, run_id: &str, force: bool) -> Result<(), WaveError> {
        self.store.request_cancellation(run_id, force).await
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    async fn run_steps(
        &self,
        run_id: &RunId,
        pipeline: &Pipeline,
        plan: &dag::ExecutionPlan,
        input: &str,
        options: &ExecuteOptions,
        resume: bool,
    ) -> Result<RunSummary, WaveError> {
        let started = Instant::now();
        self.store
            .update_run_status(run_id.as_str(), RunStatus::Running, None)
            .await?;
        self.emit(Event::pipeline_started(run_id, pipeline.name(), plan.len()))
            .await?;

        if let Some(pattern) = pipeline.input.as_ref().and_then(|i| i.pattern.as_deref()) {
            if let Ok(re) = regex::Regex::new(pattern) {
                if !re.is_match(input) {
                    let message = format!("input does not match required pattern '{pattern}'");
                    return self
                        .finalize(run_id, RunStatus::Failed, started, Some(message))
                        .await;
                }
            }
        }

        let cancel = CancelFlag::new();
        let poller = self.spawn_cancel_poller(run_id.clone(), cancel.clone());

        let mut skipping = options.from_step.is_some();
        let mut outcome: Result<(), WaveError> = Ok(());

        for step_id in &plan.order {
            if skipping {
                if Some(step_id.as_str()) == options.from_step.as_deref() {
                    skipping = false;
                } else {
                    continue;
                }
            }

            if cancel.is_requested() {
                outcome = Err(WaveError::Cancelled);
                break;
            }

            let step = match pipeline.step(step_id) {
                Some(step) => step,
                None => {
                    outcome = Err(WaveError::InvalidPipeline {
                        pipeline: pipeline.name().to_string(),
                        message: format!("plan references unknown step '{step_id}'"),
                    });
                    break;
                }
            };

            // Resume mode: completed steps are skipped outright.
            let existing = self.store.get_step(run_id.as_str(), step_id).await?;
            if resume {
                if let Some(record) = &existing {
                    if record.state == StepStatus::Completed {
                        continue;
                    }
                }
            }

            self.store
                .set_current_step(run_id.as_str(), Some(step_id))
                .await?;

            let result = self
                .execute_step(run_id, step, input, &cancel, options, existing)
                .await;
            if let Err(e) = result {
                outcome = Err(e);
                break;
            }
        }

        poller.abort();
        self.store.set_current_step(run_id.as_str(), None).await?;

        match outcome {
            Ok(()) => self.finalize(run_id, RunStatus::Completed, started, None).await,
            Err(WaveError::Cancelled) => {
                self.finalize(run_id, RunStatus::Cancelled, started, None)
                    .await
            }
            Err(e) => {
                let message = e.to_string();
                self.finalize(run_id, RunStatus::Failed, started, Some(message))
                    .await
            }
        }
    }

    async fn finalize(
        &self,
        run_id: &RunId,
        status: RunStatus,
        started: Instant,
        error: Option<String>,
    ) -> Result<RunSummary, WaveError> {
        let duration_ms = started.elapsed().as_millis() as u64;
        self.store
            .update_run_status(run_id.as_str(), status, error.as_deref())
            .await?;
        let record = self
            .store
            .get_run(run_id.as_str())
            .await?
            .ok_or_else(|| WaveError::state_store(format!("unknown run '{run_id}'")))?;

        let event = match status {
            RunStatus::Completed => {
                Event::pipeline_completed(run_id, duration_ms, record.total_tokens)
            }
            RunStatus::Cancelled => Event::pipeline_cancelled(run_id, duration_ms),
            _ => Event::pipeline_failed(
                run_id,
                duration_ms,
                error.clone().unwrap_or_else(|| "pipeline failed".into()),
            ),
        };
        self.emit(event).await?;

        Ok(RunSummary {
            run_id: run_id.clone(),
            status: record.status,
            total_tokens: record.total_tokens,
            error: record.error_message,
        })
    }

    fn spawn_cancel_poller(
        &self,
        run_id: RunId,
        cancel: CancelFlag,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CANCEL_POLL).await;
                match store.get_cancellation(run_id.as_str()).await {
                    Ok(Some(flag)) => {
                        cancel.request(flag.force);
                        if flag.force {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "cancellation poll failed");
                    }
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Single step
    // ------------------------------------------------------------------

    async fn execute_step(
        &self,
        run_id: &RunId,
        step: &Step,
        input: &str,
        cancel: &CancelFlag,
        options: &ExecuteOptions,
        existing: Option<StepRecord>,
    ) -> Result<(), WaveError> {
        self.manifest.persona(&step.persona)?;
        let started = Instant::now();
        // Failed steps re-run from scratch with their retry counter intact.
        let initial_retries = existing.map(|r| r.retry_count).unwrap_or(0);

        if let Some(matrix) = &step.matrix {
            return matrix::execute_matrix(self, run_id, step, matrix, input, cancel, options)
                .await;
        }

        let workspace = self.workspaces.prepare(
            run_id,
            &step.id,
            &step.workspace,
            &self.manifest.skill_mounts,
        )?;

        let artifacts = self.inject_artifacts(run_id, step, &workspace).await?;
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
                Duration::from_secs(
                    step.timeout_secs
                        .unwrap_or(self.manifest.runtime.default_timeout_secs),
                )
            }),
            contract_retries: step
                .max_retries
                .unwrap_or(self.manifest.runtime.max_retries),
            execution_retries: self.manifest.runtime.execution_max_retries,
            threshold_percent: step
                .handover
                .as_ref()
                .and_then(|h| h.compaction.as_ref())
                .and_then(|c| c.threshold_percent)
                .unwrap_or(self.manifest.runtime.relay_threshold_percent),
            worker: None,
        };

        let render = RenderContext {
            input: input.to_string(),
            artifacts,
        };

        let mut transition = StepTransitions::durable(
            self,
            run_id,
            &step.id,
            workspace.display().to_string(),
            initial_retries,
        );

        let result = self
            .run_attempt_loop(run_id, &spec, &workspace, &render, cancel, &mut transition)
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(attempt) => {
                // Output registration can itself fail the contract; give it
                // the same retry semantics as a missing-content failure by
                // surfacing it as the step error.
                if let Err(e) = self.register_outputs(run_id, step, &workspace).await {
                    transition
                        .record(StepStatus::Failed, Some(e.to_string()))
                        .await?;
                    self.emit(Event::step_failed(
                        run_id,
                        &step.id,
                        &step.persona,
                        duration_ms,
                        e.to_string(),
                    ))
                    .await?;
                    return Err(e);
                }
                transition.record(StepStatus::Completed, None).await?;
                self.emit(Event::step_completed(
                    run_id,
                    &step.id,
                    &step.persona,
                    duration_ms,
                    attempt.tokens,
                ))
                .await?;
                Ok(())
            }
            Err(WaveError::Cancelled) => Err(WaveError::Cancelled),
            Err(e) => {
                transition
                    .record(StepStatus::Failed, Some(e.to_string()))
                    .await?;
                self.emit(Event::step_failed(
                    run_id,
                    &step.id,
                    &step.persona,
                    duration_ms,
                    e.to_string(),
                ))
                .await?;
                Err(e)
            }
        }
    }

    /// Materialize every declared injection, returning artifact name ->
    /// workspace-relative path for the template renderer.
    pub(crate) async fn inject_artifacts(
        &self,
        run_id: &RunId,
        step: &Step,
        workspace: &std::path::Path,
    ) -> Result<BTreeMap<String, String>, WaveError> {
        let mut rendered = BTreeMap::new();
        for injection in &step.memory.inject {
            let artifact = self
                .store
                .get_artifact(run_id.as_str(), &injection.from_step, &injection.artifact)
                .await?
                .ok_or_else(|| {
                    WaveError::workspace(format!(
                        "artifact '{}' of step '{}' is not registered",
                        injection.artifact, injection.from_step
                    ))
                })?;
            let source = self
                .workspaces
                .step_dir(run_id, &injection.from_step)
                .join(&artifact.path);
            self.workspaces
                .inject_artifact(workspace, &source, injection)?;

            // Materialize the scoped artifact view the first time the
            // artifact crosses a step boundary.
            let view = self
                .manifest
                .resolve_path(&self.manifest.runtime.artifacts_dir)
                .join(run_id.as_str())
                .join(&injection.from_step)
                .join(&injection.artifact);
            if !view.exists() && source.is_file() {
                if let Some(parent) = view.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&source, &view)?;
            }

            self.audit.file_op(
                run_id,
                Some(&step.id),
                "inject",
                &workspace.join(injection.target_path()),
            )?;
            rendered.insert(injection.artifact.clone(), injection.target_path());
        }
        Ok(rendered)
    }

    /// Register declared outputs after contract validation. A declared
    /// output that is absent fails the step like missing content.
    pub(crate) async fn register_outputs(
        &self,
        run_id: &RunId,
        step: &Step,
        workspace: &std::path::Path,
    ) -> Result<(), WaveError> {
        for output in &step.outputs {
            let path = workspace.join(&output.path);
            let metadata = std::fs::metadata(&path).map_err(|_| {
                WaveError::Contract(
                    ContractFailure::new(
                        FailureClass::MissingContent,
                        output.path.clone(),
                        "declared output artifact was not produced",
                    )
                    .with_suggestion(format!("write the artifact to '{}'", output.path)),
                )
            })?;
            self.store
                .register_artifact(
                    run_id.as_str(),
                    &step.id,
                    &output.name,
                    &output.path,
                    output.artifact_type.as_str(),
                    metadata.len(),
                )
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Attempt loop (shared with matrix workers)
    // ------------------------------------------------------------------

    /// The single-step loop: pre-validations, adapter invocation, relay,
    /// contract, retry with backoff and repair prompts. State transitions
    /// and terminal events are the caller's concern; this loop emits only
    /// the intermediate `step_retrying` / `step_compacting` events.
    pub(crate) async fn run_attempt_loop(
        &self,
        run_id: &RunId,
        spec: &AttemptSpec,
        workspace: &std::path::Path,
        render: &RenderContext,
        cancel: &CancelFlag,
        transitions: &mut StepTransitions<'_>,
    ) -> Result<AttemptResult, WaveError> {
        let adapter = {
            let persona = self.manifest.persona(&spec.persona)?;
            self.registry.get(&persona.adapter)?
        };
        let monitor = Arc::new(Mutex::new(RelayMonitor::new(
            adapter.context_window(),
            spec.threshold_percent,
        )));

        let mut repair_prompt: Option<String> = None;
        let mut checkpoint_preamble: Option<String> = None;
        let mut total_tokens = 0u64;

        loop {
            // (1) cancellation gate
            if cancel.is_requested() {
                return Err(WaveError::Cancelled);
            }

            // (2) pre-execution validations; failures never run the adapter
            // and are not retryable.
            self.run_pre_validations(&spec.pre_validate, workspace, &render.input)
                .await?;

            // (3)-(4) render the execution source
            let attempt_result = match &spec.source {
                AttemptSource::Command(command) => {
                    transitions.record(StepStatus::Running, None).await?;
                    if !transitions.started_event_sent() {
                        self.emit(attach_worker(
                            Event::step_started(run_id, &spec.step_id, &spec.persona),
                            spec.worker,
                        ))
                        .await?;
                        transitions.mark_started_event();
                    }
                    self.run_command_step(command, workspace, spec.timeout, &spec.persona)
                        .await
                }
                AttemptSource::Prompt(prompt_template) => {
                    let mut prompt = template::render(prompt_template, render);
                    if let Some(preamble) = &checkpoint_preamble {
                        prompt = format!("{preamble}\n\n{prompt}");
                    }
                    if let Some(repair) = &repair_prompt {
                        prompt = format!("{repair}\n\n{prompt}");
                    }

                    // (5) transition to Running; emit exactly once per attempt
                    transitions.record(StepStatus::Running, None).await?;
                    if !transitions.started_event_sent() {
                        self.emit(attach_worker(
                            Event::step_started(run_id, &spec.step_id, &spec.persona),
                            spec.worker,
                        ))
                        .await?;
                        transitions.mark_started_event();
                    }

                    // (6) adapter invocation with streamed accounting
                    self.run_adapter_attempt(
                        run_id,
                        spec,
                        &prompt,
                        workspace,
                        cancel,
                        Arc::clone(&monitor),
                    )
                    .await
                }
            };

            match attempt_result {
                Ok(attempt) => {
                    total_tokens += attempt.tokens;

                    // Relay check: a pressed monitor pauses the step at this
                    // safe point, compacts, and restarts without burning a
                    // retry.
                    let pressed = monitor.lock().map(|m| m.is_pressed()).unwrap_or(false);
                    if pressed && self.relay.is_configured() {
                        self.emit(attach_worker(
                            Event::step_compacting(
                                run_id,
                                &spec.step_id,
                                &spec.persona,
                                monitor.lock().map(|m| m.consumed()).unwrap_or(0),
                            ),
                            spec.worker,
                        ))
                        .await?;

                        let transcript = format!(
                            "### prompt\n{}\n\n### response\n{}",
                            match &spec.source {
                                AttemptSource::Prompt(p) => p.as_str(),
                                AttemptSource::Command(c) => c.as_str(),
                            },
                            attempt.output
                        );
                        let (checkpoint, summarizer_tokens) = self
                            .relay
                            .compact(workspace, &spec.step_id, &transcript, cancel.clone())
                            .await?;
                        self.store
                            .add_tokens(run_id.as_str(), summarizer_tokens)
                            .await?;
                        total_tokens += summarizer_tokens;

                        checkpoint.inject(workspace)?;
                        self.audit.file_op(
                            run_id,
                            Some(&spec.step_id),
                            "checkpoint",
                            &workspace.join(crate::relay::CHECKPOINT_FILE),
                        )?;
                        checkpoint_preamble = Some(checkpoint.restart_preamble());
                        if let Ok(mut m) = monitor.lock() {
                            m.reset();
                        }
                        continue; // restart the step; retry counter untouched
                    }

                    // (7) handover contract, then declared-output presence;
                    // both failure paths share the retry budget.
                    let mut gate: Result<(), WaveError> = Ok(());
                    if let Some(handover) = &spec.handover {
                        gate = self.validator.validate(workspace, handover).await;
                    }
                    if gate.is_ok() {
                        for output in &spec.outputs {
                            if !workspace.join(&output.path).exists() {
                                gate = Err(WaveError::Contract(
                                    ContractFailure::new(
                                        FailureClass::MissingContent,
                                        output.path.clone(),
                                        "declared output artifact was not produced",
                                    )
                                    .with_suggestion(format!(
                                        "write the artifact to '{}'",
                                        output.path
                                    )),
                                ));
                                break;
                            }
                        }
                    }

                    if let Err(gate_err) = gate {
                        match self
                            .handle_failure(run_id, spec, gate_err, transitions, &mut repair_prompt)
                            .await?
                        {
                            RetryDecision::Retry => continue,
                            RetryDecision::GiveUp(e) => return Err(e),
                        }
                    }

                    return Ok(AttemptResult {
                        output: attempt.output,
                        tokens: total_tokens,
                    });
                }
                Err(e) => {
                    match self
                        .handle_failure(run_id, spec, e, transitions, &mut repair_prompt)
                        .await?
                    {
                        RetryDecision::Retry => continue,
                        RetryDecision::GiveUp(e) => return Err(e),
                    }
                }
            }
        }
    }

    async fn run_pre_validations(
        &self,
        rules: &[PreValidation],
        workspace: &std::path::Path,
        input: &str,
    ) -> Result<(), WaveError> {
        for rule in rules {
            match rule {
                PreValidation::FileExists { path } => {
                    if !workspace.join(path).exists() {
                        return Err(WaveError::workspace(format!(
                            "pre-validation failed: '{path}' does not exist"
                        )));
                    }
                }
                PreValidation::Command { command } => {
                    let status = tokio::process::Command::new("sh")
                        .arg("-c")
                        .arg(command)
                        .current_dir(workspace)
                        .status()
                        .await?;
                    if !status.success() {
                        return Err(WaveError::workspace(format!(
                            "pre-validation command failed: '{command}'"
                        )));
                    }
                }
                PreValidation::InputMatches { pattern } => {
                    let re = regex::Regex::new(pattern).map_err(|e| {
                        WaveError::workspace(format!("bad pre-validation pattern: {e}"))
                    })?;
                    if !re.is_match(input) {
                        return Err(WaveError::workspace(format!(
                            "pre-validation failed: input does not match '{pattern}'"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_adapter_attempt(
        &self,
        run_id: &RunId,
        spec: &AttemptSpec,
        prompt: &str,
        workspace: &std::path::Path,
        cancel: &CancelFlag,
        monitor: Arc<Mutex<RelayMonitor>>,
    ) -> Result<AttemptResult, WaveError> {
        let persona = self.manifest.persona(&spec.persona)?;
        let adapter = self.registry.get(&persona.adapter)?;

        let config = RunConfig {
            workspace: workspace.to_path_buf(),
            persona: spec.persona.clone(),
            system_prompt_path: self.manifest.resolve_path(&persona.system_prompt),
            prompt: prompt.to_string(),
            temperature: persona.temperature,
            permissions: self.manifest.effective_permissions(&spec.persona)?,
            hooks: persona.hooks.clone(),
            timeout: spec.timeout,
            cancel: cancel.clone(),
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = Arc::clone(&self.store);
        let audit = Arc::clone(&self.audit);
        let drain_run = run_id.clone();
        let drain_step = spec.step_id.clone();
        let drain_persona = spec.persona.clone();
        let drain = tokio::spawn(async move {
            let mut tokens = 0u64;
            while let Some(event) = rx.recv().await {
                match event {
                    AdapterEvent::TokenUsage { delta, .. } => {
                        tokens += delta;
                        if let Err(e) = store.add_tokens(drain_run.as_str(), delta).await {
                            tracing::warn!(error = %e, "token accounting write failed");
                        }
                        if let Ok(mut m) = monitor.lock() {
                            m.observe(delta);
                        }
                    }
                    AdapterEvent::ToolCall { tool, arguments } => {
                        if let Err(e) = audit.tool_call(
                            &drain_run,
                            &drain_step,
                            &drain_persona,
                            &tool,
                            &arguments,
                        ) {
                            tracing::warn!(error = %e, "audit write failed");
                        }
                    }
                    AdapterEvent::Text { .. } => {}
                }
            }
            tokens
        });

        let result = adapter.run(config, tx).await;
        let streamed_tokens = drain.await.unwrap_or(0);

        result.map(|r| AttemptResult {
            output: r.output,
            tokens: streamed_tokens.max(r.usage.total()),
        })
    }

    async fn run_command_step(
        &self,
        command: &str,
        workspace: &std::path::Path,
        timeout: Duration,
        persona: &str,
    ) -> Result<AttemptResult, WaveError> {
        let output = tokio::time::timeout(
            timeout + COMMAND_GRACE,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(workspace)
                .output(),
        )
        .await
        .map_err(|_| WaveError::AdapterTimeout {
            persona: persona.to_string(),
            seconds: timeout.as_secs(),
        })??;

        let code = output.status.code().unwrap_or(-1);
        if code != 0 {
            return Err(WaveError::AdapterFailed {
                persona: persona.to_string(),
                exit_code: code,
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(AttemptResult {
            output: String::from_utf8_lossy(&output.stdout).to_string(),
            tokens: 0,
        })
    }

    /// Classify a failure, burn a retry if the budget allows, and derive
    /// the repair prompt for the next attempt.
    async fn handle_failure(
        &self,
        run_id: &RunId,
        spec: &AttemptSpec,
        error: WaveError,
        transitions: &mut StepTransitions<'_>,
        repair_prompt: &mut Option<String>,
    ) -> Result<RetryDecision, WaveError> {
        if matches!(error, WaveError::Cancelled) {
            return Ok(RetryDecision::GiveUp(WaveError::Cancelled));
        }
        if !error.is_retryable() {
            return Ok(RetryDecision::GiveUp(error));
        }

        let budget = match &error {
            WaveError::Contract(_) | WaveError::MalformedJson { .. } => spec.contract_retries,
            _ => spec.execution_retries,
        };
        if transitions.retry_count >= budget {
            return Ok(RetryDecision::GiveUp(error));
        }

        *repair_prompt = Some(match &error {
            WaveError::Contract(failure) => failure.repair_prompt(),
            WaveError::MalformedJson { defect } => format!(
                "Your previous output was not valid JSON ({defect}). Emit strict JSON: \
                 no comments, no trailing commas, double-quoted keys and strings."
            ),
            WaveError::AdapterTimeout { seconds, .. } => format!(
                "Your previous attempt exceeded the {seconds}s time budget. \
                 Work more directly and avoid unnecessary exploration."
            ),
            other => format!(
                "Your previous attempt failed ({}). Address the failure and try again.",
                other
            ),
        });

        transitions.retry_count += 1;
        let retry_count = transitions.retry_count;
        transitions
            .record(StepStatus::Retrying, Some(error.to_string()))
            .await?;
        self.emit(attach_worker(
            Event::step_retrying(
                run_id,
                &spec.step_id,
                &spec.persona,
                retry_count,
                format!("retry {retry_count}: {error}"),
            ),
            spec.worker,
        ))
        .await?;

        tokio::time::sleep(backoff_delay(retry_count)).await;
        Ok(RetryDecision::Retry)
    }

    /// Emit to the live stream and the durable event log.
    pub(crate) async fn emit(&self, event: Event) -> Result<(), WaveError> {
        self.store.record_event(&event).await?;
        self.sink.emit(event);
        Ok(())
    }
}

/// Exponential backoff: 1s, 2s, 4s, ... capped.
fn backoff_delay(retry: u32) -> Duration {
    let exp = retry.saturating_sub(1).min(16);
    BACKOFF_BASE
        .saturating_mul(1u32 << exp)
        .min(BACKOFF_CAP)
}

fn attach_worker(event: Event, worker: Option<usize>) -> Event {
    match worker {
        Some(index) => event.with_worker(index),
        None => event,
    }
}

// ============================================================================
// ATTEMPT SPEC & TRANSITIONS
// ============================================================================

/// Execution source after rendering decisions are made.
#[derive(Debug, Clone)]
pub(crate) enum AttemptSource {
    Prompt(String),
    Command(String),
}

/// Everything the attempt loop needs, decoupled from `Step` so matrix
/// workers can reuse it with per-worker identities.
#[derive(Debug, Clone)]
pub(crate) struct AttemptSpec {
    pub step_id: String,
    pub persona: String,
    pub source: AttemptSource,
    pub handover: Option<crate::pipeline::HandoverConfig>,
    pub outputs: Vec<crate::pipeline::ArtifactSpec>,
    pub pre_validate: Vec<PreValidation>,
    pub timeout: Duration,
    pub contract_retries: u32,
    pub execution_retries: u32,
    pub threshold_percent: u8,
    pub worker: Option<usize>,
}

#[derive(Debug, Clone)]
pub(crate) struct AttemptResult {
    pub output: String,
    pub tokens: u64,
}

enum RetryDecision {
    Retry,
    GiveUp(WaveError),
}

/// Durable step-state bookkeeping around the attempt loop. Matrix workers
/// use the detached variant: worker attempts do not own a `step_state`
/// row (worker state aggregates into the parent step), so their
/// transitions only move the in-memory retry counter.
pub(crate) struct StepTransitions<'a> {
    executor: &'a Executor,
    run_id: RunId,
    step_id: String,
    workspace: String,
    durable: bool,
    started: bool,
    pub retry_count: u32,
}

impl<'a> StepTransitions<'a> {
    /// Transitions backed by a `step_state` row.
    pub fn durable(
        executor: &'a Executor,
        run_id: &RunId,
        step_id: &str,
        workspace: String,
        retry_count: u32,
    ) -> Self {
        Self {
            executor,
            run_id: run_id.clone(),
            step_id: step_id.to_string(),
            workspace,
            durable: true,
            started: false,
            retry_count,
        }
    }

    /// Matrix-worker transitions: events only, no `step_state` writes.
    pub fn detached(executor: &'a Executor, run_id: &RunId, step_id: &str) -> Self {
        Self {
            executor,
            run_id: run_id.clone(),
            step_id: step_id.to_string(),
            workspace: String::new(),
            durable: false,
            started: false,
            retry_count: 0,
        }
    }

    /// The started event is emitted on the first Running transition only;
    /// retries surface as step_retrying.
    pub fn started_event_sent(&self) -> bool {
        self.started
    }

    pub fn mark_started_event(&mut self) {
        self.started = true;
    }

    pub async fn record(
        &mut self,
        state: StepStatus,
        error: Option<String>,
    ) -> Result<(), WaveError> {
        if !self.durable {
            return Ok(());
        }
        let now = chrono::Utc::now();
        self.executor
            .store
            .upsert_step(&StepRecord {
                run_id: self.run_id.to_string(),
                step_id: self.step_id.clone(),
                state,
                retry_count: self.retry_count,
                started_at: Some(now),
                completed_at: state.is_terminal().then_some(now),
                updated_at: now,
                workspace_path: Some(self.workspace.clone()),
                error_message: error,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_one_second() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_delay(10), BACKOFF_CAP);
        assert_eq!(backoff_delay(u32::MAX), BACKOFF_CAP);
    }

    #[test]
    fn worker_attachment_preserves_plain_events() {
        let run = RunId::from_string("p-20250101-000000-0001");
        let plain = attach_worker(Event::step_started(&run, "s", "p"), None);
        assert!(plain.attrs.is_none());

        let tagged = attach_worker(Event::step_started(&run, "s", "p"), Some(3));
        assert_eq!(tagged.attrs.unwrap()["worker"], 3);
    }
}
