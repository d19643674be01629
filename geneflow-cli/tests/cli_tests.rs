use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

/// Lay out a minimal workflow package with one local app.
fn write_package(dir: &Path) -> std::path::PathBuf {
    let pkg = dir.join("hello-workflow");
    let app_dir = pkg.join("apps/hello");
    fs::create_dir_all(app_dir.join("assets")).unwrap();

    let script = app_dir.join("assets/hello.sh");
    fs::write(
        &script,
        "#!/bin/sh\nfor arg in \"$@\"; do case \"$arg\" in --output=*) mkdir -p \"${arg#--output=}\";; esac; done\nexit 0\n",
    )
    .unwrap();
    let mut perms = fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script, perms).unwrap();

    fs::write(
        pkg.join("workflow.yaml"),
        r#"
gfVersion: v2.0
class: workflow
name: hello-workflow
description: prints nothing, politely
inputs:
  greeting:
    type: Any
    label: Greeting text
    default: hi
steps:
  greet:
    app: hello
final_output: [greet]
"#,
    )
    .unwrap();

    fs::write(
        app_dir.join("app.yaml"),
        format!(
            r#"
name: hello
version: "0.1"
parameters:
  output:
    type: Any
implementation:
  local:
    script: {}
"#,
            script.display()
        ),
    )
    .unwrap();

    pkg
}

#[test]
fn test_help_prints_inputs_and_steps() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = write_package(dir.path());

    Command::cargo_bin("geneflow")
        .unwrap()
        .env("GENEFLOW_HOME", dir.path().join("home"))
        .args(["help", &pkg.to_string_lossy()])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello-workflow"))
        .stdout(predicate::str::contains("--in greeting="))
        .stdout(predicate::str::contains("greet -> app hello"));
}

#[test]
fn test_run_missing_workflow_fails() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("geneflow")
        .unwrap()
        .env("GENEFLOW_HOME", dir.path().join("home"))
        .env_remove("GENEFLOW_PATH")
        .args(["run", "no-such-workflow", "-o", "/tmp/out"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_run_local_workflow_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = write_package(dir.path());
    let output = dir.path().join("output");
    let home = dir.path().join("home");
    fs::create_dir_all(&home).unwrap();
    fs::write(home.join("config.yaml"), "run_poll_delay: 0\n").unwrap();

    Command::cargo_bin("geneflow")
        .unwrap()
        .env("GENEFLOW_HOME", &home)
        .args([
            "run",
            &pkg.to_string_lossy(),
            "-o",
            &output.to_string_lossy(),
            "-n",
            "hello-job",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("FINISHED"));

    // one hashed job directory with the final step's output inside
    let entries: Vec<_> = fs::read_dir(&output).unwrap().collect();
    assert_eq!(entries.len(), 1);
    let job_dir = entries[0].as_ref().unwrap().path();
    assert!(job_dir
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("hello-job-"));
    assert!(job_dir.join("greet/greet-0").is_dir());
}

#[test]
fn test_install_workflow_registers_and_refuses_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = write_package(dir.path());
    let home = dir.path().join("home");

    Command::cargo_bin("geneflow")
        .unwrap()
        .env("GENEFLOW_HOME", &home)
        .args(["install-workflow", &pkg.to_string_lossy()])
        .assert()
        .success()
        .stdout(predicate::str::contains("installed workflow \"hello-workflow\""));

    Command::cargo_bin("geneflow")
        .unwrap()
        .env("GENEFLOW_HOME", &home)
        .args(["install-workflow", &pkg.to_string_lossy()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already installed"));

    Command::cargo_bin("geneflow")
        .unwrap()
        .env("GENEFLOW_HOME", &home)
        .args(["install-workflow", &pkg.to_string_lossy(), "--force"])
        .assert()
        .success();
}
