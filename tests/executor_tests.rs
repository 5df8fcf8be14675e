//! End-to-end executor scenarios driven through the mock adapter.

use std::sync::Arc;
use std::time::Duration;

use wave::adapter::{AdapterRegistry, MockAdapter, MockBehavior};
use wave::audit::AuditLog;
use wave::events::{Event, EventSink};
use wave::executor::{ExecuteOptions, Executor};
use wave::manifest::Manifest;
use wave::pipeline::Pipeline;
use wave::state::{migrations::MigrationSettings, StateStore, StepRecord};
use wave::types::{RunId, RunStatus, StepStatus};
use wave::workspace::WorkspaceManager;

struct Harness {
    dir: tempfile::TempDir,
    store: Arc<StateStore>,
    sink: EventSink,
    executor: Executor,
    mock: Arc<MockAdapter>,
}

impl Harness {
    fn workspaces(&self) -> WorkspaceManager {
        WorkspaceManager::new(self.dir.path().join(".wave/workspaces"), self.dir.path())
    }

    fn states(&self) -> Vec<(String, Option<String>)> {
        self.sink
            .captured_events()
            .into_iter()
            .map(|e| (e.state, e.step_id))
            .collect()
    }

    fn events(&self) -> Vec<Event> {
        self.sink.captured_events()
    }
}

async fn harness(runtime_yaml: &str, mock: MockAdapter) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("persona.md"), "test persona").unwrap();

    let yaml = format!(
        r#"
apiVersion: wave/v1
kind: WaveManifest
metadata:
  name: test
adapters:
  mock:
    kind: mock
    binary: mock
personas:
  navigator:
    adapter: mock
    system_prompt: persona.md
  craftsman:
    adapter: mock
    system_prompt: persona.md
  summarizer:
    adapter: mock
    system_prompt: persona.md
    temperature: 0.1
runtime:
  summarizer_persona: summarizer
{runtime_yaml}
"#
    );
    let manifest = Arc::new(Manifest::from_str_with_base(&yaml, dir.path()).unwrap());

    let store = Arc::new(
        StateStore::open_with(
            &dir.path().join(".wave/state.db"),
            &MigrationSettings::default(),
        )
        .await
        .unwrap(),
    );

    let mock = Arc::new(mock);
    let registry = AdapterRegistry::new();
    registry.insert("mock", mock.clone());

    let sink = EventSink::capture();
    let executor = Executor::new(
        Arc::clone(&manifest),
        Arc::clone(&store),
        sink.clone(),
        WorkspaceManager::new(dir.path().join(".wave/workspaces"), dir.path()),
        registry,
        Arc::new(AuditLog::new(dir.path().join(".wave/traces"), true)),
    );

    Harness {
        dir,
        store,
        sink,
        executor,
        mock,
    }
}

fn pipeline(yaml: &str) -> Pipeline {
    Pipeline::from_str_named(yaml, "test.yaml").unwrap()
}

const TWO_STEP: &str = r#"
apiVersion: wave/v1
kind: WavePipeline
metadata:
  name: review
steps:
  - id: navigate
    persona: navigator
    prompt: "Find files for {{ input }}"
    outputs:
      - name: unit
        path: unit.json
        type: json
    handover:
      contract:
        type: json_schema
        target: unit.json
        schema: |
          {"type":"object","required":["files","notes"],
           "properties":{"files":{"type":"array"},"notes":{"type":"string"}}}
  - id: implement
    persona: craftsman
    depends_on: [navigate]
    memory:
      inject:
        - from_step: navigate
          artifact: unit
          as: inputs/unit.json
    prompt: "Implement using {{ artifact:unit }}"
"#;

fn valid_unit() -> MockBehavior {
    MockBehavior::output("mapped the territory")
        .with_file("unit.json", r#"{"files": ["src/lib.rs"], "notes": "small change"}"#)
        .with_tokens(500)
}

// ----------------------------------------------------------------------
// Scenario 1: happy path, two steps
// ----------------------------------------------------------------------

#[tokio::test]
async fn happy_path_two_steps() {
    let h = harness(
        "",
        MockAdapter::with_behaviors(vec![
            valid_unit(),
            MockBehavior::output("implemented").with_tokens(300),
        ]),
    )
    .await;
    let p = pipeline(TWO_STEP);

    let summary = h
        .executor
        .execute(&p, "fix issue #42", &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Completed);

    let states: Vec<(String, Option<String>)> = h.states();
    let expected = [
        ("pipeline_started", None),
        ("step_started", Some("navigate")),
        ("step_completed", Some("navigate")),
        ("step_started", Some("implement")),
        ("step_completed", Some("implement")),
        ("pipeline_completed", None),
    ];
    assert_eq!(states.len(), expected.len());
    for ((state, step), (want_state, want_step)) in states.iter().zip(expected) {
        assert_eq!(state, want_state);
        assert_eq!(step.as_deref(), want_step);
    }

    // Both workspaces exist, the artifact is registered, and the second
    // step received the injected unit.
    let ws = h.workspaces();
    assert!(ws.step_dir(&summary.run_id, "navigate").is_dir());
    assert!(ws.step_dir(&summary.run_id, "implement").is_dir());
    assert!(ws
        .step_dir(&summary.run_id, "implement")
        .join("inputs/unit.json")
        .is_file());

    let artifact = h
        .store
        .get_artifact(summary.run_id.as_str(), "navigate", "unit")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(artifact.path, "unit.json");

    // Injection also materialized the scoped artifact view.
    assert!(h
        .dir
        .path()
        .join(".wave/artifacts")
        .join(summary.run_id.as_str())
        .join("navigate/unit")
        .is_file());

    // Rendered prompt resolved the artifact placeholder.
    let second = &h.mock.requests()[1];
    assert!(second.prompt.contains("inputs/unit.json"));

    // Run tokens equal the sum over step_completed events.
    let step_tokens: u64 = h
        .events()
        .iter()
        .filter(|e| e.state == "step_completed")
        .map(|e| e.tokens_used)
        .sum();
    assert_eq!(summary.total_tokens, step_tokens);
    assert_eq!(summary.total_tokens, 800);
}

// ----------------------------------------------------------------------
// Scenario 2: retry on contract failure with repair prompts
// ----------------------------------------------------------------------

#[tokio::test]
async fn retry_on_contract_failure() {
    let bad = MockBehavior::output("oops")
        .with_file("unit.json", r#"{"files": "not-an-array", "notes": "x"}"#);
    let h = harness(
        "",
        MockAdapter::with_behaviors(vec![
            bad.clone(),
            bad,
            valid_unit(),
            MockBehavior::output("implemented"),
        ]),
    )
    .await;
    let p = pipeline(TWO_STEP);

    let summary = h
        .executor
        .execute(&p, "fix issue #42", &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Completed);

    let step = h
        .store
        .get_step(summary.run_id.as_str(), "navigate")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.state, StepStatus::Completed);
    assert_eq!(step.retry_count, 2);

    // Two retrying transitions for navigate, then completion; the
    // implementer still executed.
    let retries = h
        .states()
        .iter()
        .filter(|(state, step)| state == "step_retrying" && step.as_deref() == Some("navigate"))
        .count();
    assert_eq!(retries, 2);
    assert!(h
        .states()
        .iter()
        .any(|(state, step)| state == "step_completed" && step.as_deref() == Some("implement")));

    // Attempts 2 and 3 carried the repair prompt naming the defect.
    let requests = h.mock.requests();
    assert!(requests[1].prompt.contains("handover contract"));
    assert!(requests[1].prompt.contains("schema_mismatch"));
    assert!(requests[2].prompt.contains("schema_mismatch"));
}

// ----------------------------------------------------------------------
// Scenario 3: timeout exhausts the execution retry budget
// ----------------------------------------------------------------------

#[tokio::test]
async fn timeout_fails_after_retries() {
    let slow = MockBehavior::default().with_latency(Duration::from_secs(60));
    let h = harness(
        "",
        MockAdapter::with_behaviors(vec![slow.clone(), slow.clone(), slow]),
    )
    .await;

    let p = pipeline(
        r#"
apiVersion: wave/v1
kind: WavePipeline
metadata:
  name: sleepy
steps:
  - id: nap
    persona: navigator
    prompt: "sleep"
    timeout_secs: 1
"#,
    );

    let summary = h
        .executor
        .execute(&p, "", &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    assert!(summary.error.unwrap().contains("timed out"));

    // Default execution budget is 2 retries: three attempts total.
    assert_eq!(h.mock.calls(), 3);
    let step = h
        .store
        .get_step(summary.run_id.as_str(), "nap")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.state, StepStatus::Failed);
    assert_eq!(step.retry_count, 2);

    // The workspace survives the failure for forensics.
    assert!(h.workspaces().step_dir(&summary.run_id, "nap").is_dir());
}

// ----------------------------------------------------------------------
// Scenario 4: matrix fan-out
// ----------------------------------------------------------------------

const MATRIX: &str = r#"
apiVersion: wave/v1
kind: WavePipeline
metadata:
  name: fanout
steps:
  - id: plan
    persona: navigator
    prompt: "plan {{ input }}"
    outputs:
      - name: tasks
        path: tasks.json
        type: json
  - id: work
    persona: craftsman
    depends_on: [plan]
    memory:
      inject:
        - from_step: plan
          artifact: tasks
          as: tasks.json
    prompt: "do {{ artifact:item }}"
    outputs:
      - name: result
        path: out.md
        type: markdown
    matrix:
      items: tasks.json
      max_parallel: 2
"#;

#[tokio::test]
async fn matrix_fans_out_and_merges_artifacts() {
    let items = r#"[{"n":1},{"n":2},{"n":3},{"n":4},{"n":5}]"#;
    let mock = MockAdapter::with_behaviors(vec![MockBehavior::output("planned")
        .with_file("tasks.json", items)])
    .with_default(MockBehavior::output("done").with_file("out.md", "done").with_tokens(10));
    let h = harness("", mock).await;

    let summary = h
        .executor
        .execute(&pipeline(MATRIX), "all files", &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Completed);

    // One planner call plus five workers.
    assert_eq!(h.mock.calls(), 6);

    // Exactly one completion for the parent step, workers recoverable by
    // index from event attrs.
    let completed: Vec<_> = h
        .states()
        .into_iter()
        .filter(|(state, step)| state == "step_completed" && step.as_deref() == Some("work"))
        .collect();
    assert_eq!(completed.len(), 1);
    let worker_indices: std::collections::BTreeSet<u64> = h
        .events()
        .iter()
        .filter(|e| e.step_id.as_deref() == Some("work"))
        .filter_map(|e| e.attrs.as_ref()?.get("worker")?.as_u64())
        .collect();
    assert_eq!(worker_indices, (0u64..5).collect());

    // Five disambiguated artifacts.
    let artifacts = h.store.list_artifacts(summary.run_id.as_str()).await.unwrap();
    let names: Vec<&str> = artifacts
        .iter()
        .filter(|a| a.step_id == "work")
        .map(|a| a.name.as_str())
        .collect();
    assert_eq!(
        names,
        vec!["result-w0", "result-w1", "result-w2", "result-w3", "result-w4"]
    );

    // Worker workspaces are indexed siblings under the parent step.
    let ws = h.workspaces();
    for index in 0..5 {
        assert!(ws.worker_dir(&summary.run_id, "work", index).is_dir());
    }
}

#[tokio::test]
async fn matrix_with_zero_items_completes_immediately() {
    let mock = MockAdapter::with_behaviors(vec![
        MockBehavior::output("planned").with_file("tasks.json", "[]")
    ]);
    let h = harness("", mock).await;

    let summary = h
        .executor
        .execute(&pipeline(MATRIX), "", &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(h.mock.calls(), 1); // no workers ran

    let step = h
        .store
        .get_step(summary.run_id.as_str(), "work")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.state, StepStatus::Completed);
}

#[tokio::test]
async fn matrix_partial_success_preserves_siblings() {
    let yaml = MATRIX.replace(
        "max_parallel: 2",
        "max_parallel: 1\n      continue_on_error: true",
    );
    let items = r#"[{"n":0},{"n":1},{"n":2}]"#;
    let mock = MockAdapter::with_behaviors(vec![
        MockBehavior::output("planned").with_file("tasks.json", items),
        MockBehavior::output("ok").with_file("out.md", "ok"),
        MockBehavior::failing(2),
        MockBehavior::output("ok").with_file("out.md", "ok"),
    ]);
    let h = harness("  execution_max_retries: 0", mock).await;

    let summary = h
        .executor
        .execute(&pipeline(&yaml), "", &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Failed);

    // The parent step failed, but the partial outcome is visible and the
    // surviving workers' artifacts were preserved.
    let step = h
        .store
        .get_step(summary.run_id.as_str(), "work")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.state, StepStatus::Failed);
    assert!(step.error_message.unwrap().contains("partial_success"));

    let artifacts = h.store.list_artifacts(summary.run_id.as_str()).await.unwrap();
    let names: Vec<&str> = artifacts
        .iter()
        .filter(|a| a.step_id == "work")
        .map(|a| a.name.as_str())
        .collect();
    assert_eq!(names, vec!["result-w0", "result-w2"]);
}

// ----------------------------------------------------------------------
// Scenario 5: cooperative cancellation mid-run
// ----------------------------------------------------------------------

#[tokio::test]
async fn cancellation_stops_before_next_step() {
    let mock = MockAdapter::with_behaviors(vec![
        MockBehavior::output("one"),
        MockBehavior::output("two").with_latency(Duration::from_millis(1500)),
        MockBehavior::output("three"),
    ]);
    let h = harness("", mock).await;

    let p = pipeline(
        r#"
apiVersion: wave/v1
kind: WavePipeline
metadata:
  name: chain
steps:
  - id: s1
    persona: navigator
    prompt: "one"
  - id: s2
    persona: navigator
    depends_on: [s1]
    prompt: "two"
  - id: s3
    persona: navigator
    depends_on: [s2]
    prompt: "three"
"#,
    );

    // Request a non-force cancellation while s2 is running.
    let store = Arc::clone(&h.store);
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(600)).await;
        let (runs, _) = store
            .list_runs(&Default::default(), None, 1)
            .await
            .unwrap();
        if let Some(run) = runs.first() {
            store.request_cancellation(&run.run_id, false).await.unwrap();
        }
    });

    let summary = h
        .executor
        .execute(&p, "", &ExecuteOptions::default())
        .await
        .unwrap();
    canceller.await.unwrap();

    assert_eq!(summary.status, RunStatus::Cancelled);

    // s2 ran to its boundary; s3 never started.
    assert!(!h
        .states()
        .iter()
        .any(|(_, step)| step.as_deref() == Some("s3")));
    let run = h
        .store
        .get_run(summary.run_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert!(run.cancelled_at.is_some());
    assert!(h
        .states()
        .iter()
        .any(|(state, _)| state == "pipeline_cancelled"));
}

// ----------------------------------------------------------------------
// Scenario 6: resume after a crash
// ----------------------------------------------------------------------

#[tokio::test]
async fn resume_skips_completed_and_retries_dead_step() {
    let h = harness("", MockAdapter::new()).await;
    let p = pipeline(
        r#"
apiVersion: wave/v1
kind: WavePipeline
metadata:
  name: chain
steps:
  - id: s1
    persona: navigator
    prompt: "one"
  - id: s2
    persona: navigator
    depends_on: [s1]
    prompt: "two"
  - id: s3
    persona: navigator
    depends_on: [s2]
    prompt: "three"
"#,
    );

    // Simulate a crashed process: s1 completed, s2 caught mid-flight.
    let run_id = RunId::from_string("chain-20250101-120000-0001");
    h.store
        .create_run(&run_id, "chain", "original input", &[])
        .await
        .unwrap();
    let now = chrono::Utc::now();
    h.store
        .upsert_step(&StepRecord {
            run_id: run_id.to_string(),
            step_id: "s1".into(),
            state: StepStatus::Completed,
            retry_count: 0,
            started_at: Some(now),
            completed_at: Some(now),
            updated_at: now,
            workspace_path: None,
            error_message: None,
        })
        .await
        .unwrap();
    h.store
        .upsert_step(&StepRecord {
            run_id: run_id.to_string(),
            step_id: "s2".into(),
            state: StepStatus::Running,
            retry_count: 1,
            started_at: Some(now),
            completed_at: None,
            updated_at: now,
            workspace_path: None,
            error_message: None,
        })
        .await
        .unwrap();

    let summary = h
        .executor
        .resume(&run_id, &p, &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Completed);

    // s1 was skipped; s2 and s3 each ran once.
    assert_eq!(h.mock.calls(), 2);
    assert!(!h
        .states()
        .iter()
        .any(|(state, step)| state == "step_started" && step.as_deref() == Some("s1")));

    // The prior retry count survived the crash.
    let s2 = h.store.get_step(run_id.as_str(), "s2").await.unwrap().unwrap();
    assert_eq!(s2.state, StepStatus::Completed);
    assert_eq!(s2.retry_count, 1);

    // Completed set only grew.
    for step_id in ["s1", "s2", "s3"] {
        let step = h.store.get_step(run_id.as_str(), step_id).await.unwrap().unwrap();
        assert_eq!(step.state, StepStatus::Completed, "{step_id}");
    }
}

// ----------------------------------------------------------------------
// Relay
// ----------------------------------------------------------------------

const CHECKPOINT_JSON: &str = r#"{
    "completed": "half the refactor",
    "remaining": "the other half",
    "modified_files": ["src/lib.rs"],
    "resume_instructions": "continue from the monitor module"
}"#;

#[tokio::test]
async fn relay_compacts_and_restarts_without_burning_retries() {
    // Window 100, threshold 80%: the first attempt's 100 tokens press the
    // monitor.
    let mock = MockAdapter::with_behaviors(vec![
        MockBehavior::output("long work").with_tokens(100),
        MockBehavior::output(CHECKPOINT_JSON).with_tokens(10),
        MockBehavior::output("finished").with_tokens(10),
    ])
    .with_context_window(100);
    let h = harness("", mock).await;

    let p = pipeline(
        r#"
apiVersion: wave/v1
kind: WavePipeline
metadata:
  name: longhaul
steps:
  - id: grind
    persona: craftsman
    prompt: "do the big refactor"
"#,
    );

    let summary = h
        .executor
        .execute(&p, "", &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(h.mock.calls(), 3);

    // Compaction is visible, the checkpoint landed in the workspace, and
    // the restarted attempt was told to read it.
    assert!(h
        .states()
        .iter()
        .any(|(state, _)| state == "step_compacting"));
    assert!(h
        .workspaces()
        .step_dir(&summary.run_id, "grind")
        .join("CHECKPOINT.json")
        .is_file());
    let requests = h.mock.requests();
    assert!(requests[2].prompt.contains("CHECKPOINT.json"));

    // The summarizer ran cold and relay burned no retries.
    assert!((requests[1].temperature - 0.1).abs() < f32::EPSILON);
    let step = h
        .store
        .get_step(summary.run_id.as_str(), "grind")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.retry_count, 0);

    // Summarizer tokens count toward the run total.
    assert_eq!(summary.total_tokens, 120);
}

#[tokio::test]
async fn summarizer_blowing_its_cap_is_relay_recursion() {
    let mock = MockAdapter::with_behaviors(vec![
        MockBehavior::output("long work").with_tokens(100),
        MockBehavior::output(CHECKPOINT_JSON).with_tokens(5000),
    ])
    .with_context_window(100);
    let h = harness("", mock).await;

    let p = pipeline(
        r#"
apiVersion: wave/v1
kind: WavePipeline
metadata:
  name: longhaul
steps:
  - id: grind
    persona: craftsman
    prompt: "do the big refactor"
"#,
    );

    let summary = h
        .executor
        .execute(&p, "", &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    assert!(summary.error.unwrap().contains("relay recursion"));
}

// ----------------------------------------------------------------------
// Boundary behaviors
// ----------------------------------------------------------------------

#[tokio::test]
async fn zero_step_pipeline_completes_immediately() {
    let h = harness("", MockAdapter::new()).await;
    let p = pipeline(
        r#"
apiVersion: wave/v1
kind: WavePipeline
metadata:
  name: empty
steps: []
"#,
    );

    let summary = h
        .executor
        .execute(&p, "", &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(h.mock.calls(), 0);

    let states: Vec<String> = h.states().into_iter().map(|(s, _)| s).collect();
    assert_eq!(states, vec!["pipeline_started", "pipeline_completed"]);
}

#[tokio::test]
async fn silent_adapter_is_a_protocol_violation() {
    let h = harness(
        "  execution_max_retries: 0",
        MockAdapter::with_behaviors(vec![MockBehavior::silent_success()]),
    )
    .await;
    let p = pipeline(
        r#"
apiVersion: wave/v1
kind: WavePipeline
metadata:
  name: silent
steps:
  - id: quiet
    persona: navigator
    prompt: "say nothing"
"#,
    );

    let summary = h
        .executor
        .execute(&p, "", &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    assert!(summary.error.unwrap().contains("protocol"));
}

#[tokio::test]
async fn invalid_dag_is_rejected_before_any_step_runs() {
    let h = harness("", MockAdapter::new()).await;
    let p = pipeline(
        r#"
apiVersion: wave/v1
kind: WavePipeline
metadata:
  name: cyclic
steps:
  - id: a
    persona: navigator
    depends_on: [b]
    prompt: "x"
  - id: b
    persona: navigator
    depends_on: [a]
    prompt: "y"
"#,
    );

    let err = h
        .executor
        .execute(&p, "", &ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_pipeline");
    assert_eq!(h.mock.calls(), 0);
    assert!(h.states().is_empty());
}

#[tokio::test]
async fn every_event_line_is_valid_json() {
    let h = harness(
        "",
        MockAdapter::with_behaviors(vec![
            valid_unit(),
            MockBehavior::output("implemented"),
        ]),
    )
    .await;

    h.executor
        .execute(&pipeline(TWO_STEP), "x", &ExecuteOptions::default())
        .await
        .unwrap();

    for line in h.sink.captured() {
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        for field in [
            "timestamp",
            "run_id",
            "step_id",
            "state",
            "persona",
            "duration_ms",
            "tokens_used",
            "message",
        ] {
            assert!(value.get(field).is_some(), "missing {field}: {line}");
        }
    }
}

#[tokio::test]
async fn tool_calls_are_audited_and_scrubbed() {
    let mock = MockAdapter::with_behaviors(vec![MockBehavior::output("done").with_tool_call(
        "Bash",
        serde_json::json!({"command": "curl -H 'Authorization: Bearer abcdef0123456789'"}),
    )]);
    let h = harness("", mock).await;

    let p = pipeline(
        r#"
apiVersion: wave/v1
kind: WavePipeline
metadata:
  name: audited
steps:
  - id: tooluse
    persona: navigator
    prompt: "call a tool"
"#,
    );
    let summary = h
        .executor
        .execute(&p, "", &ExecuteOptions::default())
        .await
        .unwrap();

    let trace = h
        .dir
        .path()
        .join(".wave/traces")
        .join(format!("{}.ndjson", summary.run_id));
    let content = std::fs::read_to_string(trace).unwrap();
    assert!(content.contains("tool_call"));
    assert!(content.contains("Bash"));
    assert!(!content.contains("abcdef0123456789"));
}
