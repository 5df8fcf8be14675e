//! CLI surface tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn wave() -> Command {
    Command::cargo_bin("wave").unwrap()
}

#[test]
fn no_arguments_is_a_usage_error() {
    wave().assert().failure().code(2);
}

#[test]
fn unknown_subcommand_is_a_usage_error() {
    wave().arg("frobnicate").assert().failure().code(2);
}

#[test]
fn init_scaffolds_a_project_that_validates() {
    let dir = tempfile::tempdir().unwrap();

    wave()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success()
        .stderr(predicate::str::contains("wave.yaml"));

    assert!(dir.path().join("wave.yaml").is_file());
    assert!(dir.path().join(".wave/pipelines/review.yaml").is_file());
    assert!(dir.path().join(".wave/personas/navigator.md").is_file());

    wave()
        .current_dir(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stderr(predicate::str::contains("ok:"));
}

#[test]
fn init_twice_fails() {
    let dir = tempfile::tempdir().unwrap();
    wave().current_dir(dir.path()).arg("init").assert().success();
    wave().current_dir(dir.path()).arg("init").assert().failure();
}

#[test]
fn validate_missing_manifest_exits_4() {
    let dir = tempfile::tempdir().unwrap();
    wave()
        .current_dir(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .code(4);
}

#[test]
fn validate_reports_broken_pipeline_with_exit_4() {
    let dir = tempfile::tempdir().unwrap();
    wave().current_dir(dir.path()).arg("init").assert().success();

    // Introduce a dangling dependency.
    let path = dir.path().join(".wave/pipelines/review.yaml");
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, text.replace("depends_on: [navigate]", "depends_on: [ghost]")).unwrap();

    wave()
        .current_dir(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("ghost"));
}

#[test]
fn list_pipelines_as_json() {
    let dir = tempfile::tempdir().unwrap();
    wave().current_dir(dir.path()).arg("init").assert().success();

    wave()
        .current_dir(dir.path())
        .args(["list", "pipelines", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("review"));
}

#[test]
fn list_personas_shows_manifest_entries() {
    let dir = tempfile::tempdir().unwrap();
    wave().current_dir(dir.path()).arg("init").assert().success();

    wave()
        .current_dir(dir.path())
        .args(["list", "personas"])
        .assert()
        .success()
        .stdout(predicate::str::contains("navigator"))
        .stdout(predicate::str::contains("summarizer"));
}

#[test]
fn run_dry_run_prints_layered_plan() {
    let dir = tempfile::tempdir().unwrap();
    wave().current_dir(dir.path()).arg("init").assert().success();

    wave()
        .current_dir(dir.path())
        .args(["run", "--pipeline", "review", "--input", "x", "--dry-run"])
        .assert()
        .success()
        .stderr(predicate::str::contains("layer 0"))
        .stderr(predicate::str::contains("navigate"))
        .stderr(predicate::str::contains("layer 1"));
}

#[test]
fn run_unknown_pipeline_exits_4() {
    let dir = tempfile::tempdir().unwrap();
    wave().current_dir(dir.path()).arg("init").assert().success();

    wave()
        .current_dir(dir.path())
        .args(["run", "--pipeline", "ghost", "--input", "x"])
        .assert()
        .failure()
        .code(4);
}

#[test]
fn do_dry_run_synthesizes_two_steps() {
    let dir = tempfile::tempdir().unwrap();
    wave().current_dir(dir.path()).arg("init").assert().success();

    wave()
        .current_dir(dir.path())
        .args(["do", "rename the module", "--dry-run"])
        .assert()
        .success()
        .stderr(predicate::str::contains("navigate"))
        .stderr(predicate::str::contains("execute"));
}

#[test]
fn do_save_writes_a_reloadable_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    wave().current_dir(dir.path()).arg("init").assert().success();

    wave()
        .current_dir(dir.path())
        .args(["do", "task", "--save", "adhoc.yaml", "--dry-run"])
        .assert()
        .success();

    let saved = std::fs::read_to_string(dir.path().join("adhoc.yaml")).unwrap();
    assert!(saved.contains("kind: WavePipeline"));
    assert!(saved.contains("execute"));
}

#[test]
fn logs_with_no_runs_fails_gracefully() {
    let dir = tempfile::tempdir().unwrap();
    wave().current_dir(dir.path()).arg("init").assert().success();

    wave()
        .current_dir(dir.path())
        .arg("logs")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("no runs"));
}

#[test]
fn clean_requires_a_selector() {
    let dir = tempfile::tempdir().unwrap();
    wave().current_dir(dir.path()).arg("init").assert().success();

    wave()
        .current_dir(dir.path())
        .arg("clean")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--all"));
}

#[test]
fn clean_all_without_force_refuses() {
    let dir = tempfile::tempdir().unwrap();
    wave().current_dir(dir.path()).arg("init").assert().success();

    // Nothing recorded yet: clean succeeds as a no-op either way.
    wave()
        .current_dir(dir.path())
        .args(["clean", "--all"])
        .assert()
        .success()
        .stderr(predicate::str::contains("nothing to clean"));
}

#[test]
fn serve_reports_dashboard_not_built() {
    let dir = tempfile::tempdir().unwrap();
    wave().current_dir(dir.path()).arg("init").assert().success();

    wave()
        .current_dir(dir.path())
        .args(["serve", "--port", "9999"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("dashboard"));
}
