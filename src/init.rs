//! Project initialization.
//!
//! `wave init` scaffolds a manifest, a starter pipeline, persona prompt
//! stubs, and a `.gitignore` for the state directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::WaveError;

/// Result of project initialization.
pub struct InitResult {
    pub project_dir: PathBuf,
    pub files_created: Vec<String>,
}

/// Initialize a Wave project at `path`.
pub fn init_project(path: &Path) -> Result<InitResult, WaveError> {
    let manifest_path = path.join("wave.yaml");
    if manifest_path.exists() {
        return Err(WaveError::workspace(format!(
            "{} already exists",
            manifest_path.display()
        )));
    }

    let wave_dir = path.join(".wave");
    let pipelines_dir = wave_dir.join("pipelines");
    let personas_dir = wave_dir.join("personas");
    fs::create_dir_all(&pipelines_dir)?;
    fs::create_dir_all(&personas_dir)?;

    fs::write(&manifest_path, MANIFEST_TEMPLATE)?;
    fs::write(pipelines_dir.join("review.yaml"), REVIEW_PIPELINE_TEMPLATE)?;
    fs::write(personas_dir.join("navigator.md"), NAVIGATOR_PROMPT)?;
    fs::write(personas_dir.join("craftsman.md"), CRAFTSMAN_PROMPT)?;
    fs::write(personas_dir.join("summarizer.md"), SUMMARIZER_PROMPT)?;
    fs::write(wave_dir.join(".gitignore"), GITIGNORE_TEMPLATE)?;

    Ok(InitResult {
        project_dir: path.to_path_buf(),
        files_created: vec![
            "wave.yaml".to_string(),
            ".wave/pipelines/review.yaml".to_string(),
            ".wave/personas/navigator.md".to_string(),
            ".wave/personas/craftsman.md".to_string(),
            ".wave/personas/summarizer.md".to_string(),
            ".wave/.gitignore".to_string(),
        ],
    })
}

const MANIFEST_TEMPLATE: &str = r#"apiVersion: wave/v1
kind: WaveManifest
metadata:
  name: my-project
adapters:
  claude:
    binary: claude
    context_window: 200000
    default_permissions:
      allow: ["Read", "Grep", "Glob"]
      deny: ["Bash(rm -rf *)"]
personas:
  navigator:
    adapter: claude
    system_prompt: .wave/personas/navigator.md
    temperature: 0.3
  craftsman:
    adapter: claude
    system_prompt: .wave/personas/craftsman.md
    temperature: 0.2
    permissions:
      allow: ["Write", "Edit", "Bash"]
  summarizer:
    adapter: claude
    system_prompt: .wave/personas/summarizer.md
    temperature: 0.1
runtime:
  max_concurrent_workers: 4
  default_timeout_secs: 300
  relay_threshold_percent: 80
  max_retries: 3
  summarizer_persona: summarizer
  audit:
    enabled: false
"#;

const REVIEW_PIPELINE_TEMPLATE: &str = r#"apiVersion: wave/v1
kind: WavePipeline
metadata:
  name: review
  description: two-step code review
input:
  description: what to review (diff, PR description, or task)
steps:
  - id: navigate
    persona: navigator
    prompt: |
      Identify the files and context relevant to this review.
      Write a JSON object to unit.json with a `files` array and a
      `notes` string.

      Review target: {{ input }}
    outputs:
      - name: unit
        path: unit.json
        type: json
    handover:
      contract:
        type: json_schema
        target: unit.json
        schema: |
          {
            "type": "object",
            "required": ["files", "notes"],
            "properties": {
              "files": {"type": "array", "items": {"type": "string"}},
              "notes": {"type": "string"}
            }
          }

  - id: review
    persona: craftsman
    depends_on: [navigate]
    memory:
      inject:
        - from_step: navigate
          artifact: unit
          as: inputs/unit.json
    prompt: |
      Read {{ artifact:unit }} first and restrict yourself to the files
      it names. Produce review.md with your findings.

      Review target: {{ input }}
    outputs:
      - name: review
        path: review.md
        type: markdown
    handover:
      checks:
        - type: no_placeholders
          target: review.md
"#;

const NAVIGATOR_PROMPT: &str = r#"You are the Navigator. You map the territory before anyone edits it:
find the relevant files, call out constraints, and hand downstream agents
a precise collaboration unit. You never modify code.
"#;

const CRAFTSMAN_PROMPT: &str = r#"You are the Craftsman. You work strictly within the collaboration unit
the Navigator identified. Make the smallest change that satisfies the
task and leave the tree better than you found it.
"#;

const SUMMARIZER_PROMPT: &str = r#"You are the Summarizer. Given a transcript of work in progress, produce
a faithful checkpoint: what is done, what remains, which files changed,
and exactly how to resume. Respond with JSON only.
"#;

const GITIGNORE_TEMPLATE: &str = r#"state.db
state.db-shm
state.db-wal
workspaces/
traces/
"#;
