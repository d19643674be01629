//! End-to-end runs of the workflow runtime against a temp directory:
//! definitions are imported into a file store, the runtime drives the
//! DAG, and the outcome is checked on disk and in the store.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use geneflow_core::config::EngineConfig;
use geneflow_core::definition::{finalize_workflow, AppDef, JobDef, WorkflowDef};
use geneflow_core::store::{FileStore, JobStatus, JobStore};
use geneflow_engine::drm::{DrmSession, DrmState, JobTemplate};
use geneflow_engine::error::Result as EngineResult;
use geneflow_engine::runtime::{RuntimeOptions, WorkflowRuntime};

struct TestEnv {
    dir: tempfile::TempDir,
    store_path: PathBuf,
    job_id: String,
    job_name: String,
}

impl TestEnv {
    /// The hashed job directory the runtime nests under the work URI.
    fn work_dir(&self) -> PathBuf {
        self.dir
            .path()
            .join("work")
            .join(format!("{}-{}", self.job_name, &self.job_id[..8]))
    }

    fn output_dir(&self) -> PathBuf {
        self.dir
            .path()
            .join("output")
            .join(format!("{}-{}", self.job_name, &self.job_id[..8]))
    }

    fn job_status(&self) -> JobStatus {
        let store = FileStore::open(&self.store_path).unwrap();
        store.get_job_def(&self.job_id).unwrap().unwrap().status
    }
}

/// Write an executable wrapper script into the sandbox.
fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// A wrapper that creates its `--output` folder and exits 0.
const OK_WRAPPER: &str = r#"#!/bin/sh
out=""
for arg in "$@"; do
  case "$arg" in
    --output=*) out="${arg#--output=}" ;;
  esac
done
[ -n "$out" ] && mkdir -p "$out"
exit 0
"#;

/// Import a workflow, its apps and one job into a fresh store inside
/// `dir`. The job's work and output URIs land under the sandbox.
fn import_defs(
    dir: tempfile::TempDir,
    workflow_yaml: &str,
    app_yamls: &[&str],
    job_yaml: &str,
) -> TestEnv {
    let mut workflow: WorkflowDef = serde_yaml::from_str(workflow_yaml).unwrap();
    finalize_workflow(&mut workflow).unwrap();
    let apps: Vec<AppDef> = app_yamls
        .iter()
        .map(|yaml| serde_yaml::from_str(yaml).unwrap())
        .collect();
    let mut job: JobDef = serde_yaml::from_str(job_yaml).unwrap();
    job.work_uri.insert(
        "local".to_string(),
        dir.path().join("work").to_string_lossy().to_string(),
    );
    job.output_uri = dir.path().join("output").to_string_lossy().to_string();
    let job_name = job.name.clone();

    let store_path = dir.path().join("geneflow.json");
    let mut store = FileStore::open(&store_path).unwrap();
    let workflow_id = store.import_workflow(workflow, apps).unwrap();
    job.workflow_id = workflow_id;
    let job_ids = store.import_jobs(vec![job]).unwrap();
    store.commit().unwrap();

    TestEnv {
        dir,
        store_path,
        job_id: job_ids[0].clone(),
        job_name,
    }
}

fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        config: EngineConfig {
            run_poll_delay: 0,
            ..EngineConfig::default()
        },
        ..RuntimeOptions::default()
    }
}

fn run_job(env: &TestEnv, options: RuntimeOptions) -> EngineResult<JobStatus> {
    let store = FileStore::open(&env.store_path).unwrap();
    let mut runtime = WorkflowRuntime::initialize(&env.job_id, Box::new(store), options)?;
    runtime.run()
}

fn app_yaml_for(script: &Path) -> String {
    format!(
        r#"
name: tool
version: "1.0"
parameters:
  output:
    type: Any
implementation:
  local:
    script: {}
"#,
        script.display()
    )
}

const LOCAL_JOB: &str = r#"
name: local-job
output_uri: placeholder
execution:
  context:
    default: local
"#;

#[test]
fn test_single_local_step_no_map() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "tool.sh", OK_WRAPPER);

    let workflow = r#"
name: single
steps:
  s1:
    app: tool
"#;
    let env = import_defs(dir, workflow, &[&app_yaml_for(&script)], LOCAL_JOB);

    let status = run_job(&env, fast_options()).unwrap();
    assert_eq!(status, JobStatus::Finished);
    assert_eq!(env.job_status(), JobStatus::Finished);

    let step_dir = env.work_dir().join("s1");
    assert!(step_dir.join("s1-0").is_dir());
    let out = step_dir.join("_log/gf-0-s1-s1-0.out");
    let err = step_dir.join("_log/gf-0-s1-s1-0.err");
    assert!(out.exists() && err.exists());
    assert_eq!(fs::metadata(&out).unwrap().len(), 0);
    assert_eq!(fs::metadata(&err).unwrap().len(), 0);
}

#[test]
fn test_map_fan_out_local() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "tool.sh", OK_WRAPPER);
    let reads = dir.path().join("reads");
    fs::create_dir(&reads).unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        fs::write(reads.join(name), "data").unwrap();
    }

    let workflow = format!(
        r#"
name: fan-out
inputs:
  reads:
    type: Directory
    default: {reads}
steps:
  split:
    app: tool
    map:
      uri: ${{workflow.inputs.reads}}
      glob: "*"
    template:
      input: ${{workflow.inputs.reads}}/${{1}}
"#,
        reads = reads.display()
    );
    let env = import_defs(dir, &workflow, &[&app_yaml_for(&script)], LOCAL_JOB);

    let status = run_job(&env, fast_options()).unwrap();
    assert_eq!(status, JobStatus::Finished);

    // one output folder per map item, named from the source files
    let step_dir = env.work_dir().join("split");
    for name in ["a-txt", "b-txt", "c-txt"] {
        assert!(step_dir.join(name).is_dir(), "missing {}", name);
    }
}

#[test]
fn test_checkpoint_any_tolerates_failures() {
    let dir = tempfile::tempdir().unwrap();
    // exits non-zero for three of the five inputs
    let wrapper = r#"#!/bin/sh
out=""
for arg in "$@"; do
  case "$arg" in
    --output=*) out="${arg#--output=}" ;;
  esac
done
mkdir -p "$out"
case "$(basename "$out")" in
  a-txt|b-txt|c-txt) exit 1 ;;
esac
exit 0
"#;
    let script = write_script(dir.path(), "tool.sh", wrapper);
    let reads = dir.path().join("reads");
    fs::create_dir(&reads).unwrap();
    for name in ["a.txt", "b.txt", "c.txt", "d.txt", "e.txt"] {
        fs::write(reads.join(name), "data").unwrap();
    }

    let workflow = format!(
        r#"
name: partial
inputs:
  reads:
    default: {reads}
steps:
  sift:
    app: tool
    checkpoint: any
    map:
      uri: ${{workflow.inputs.reads}}
      glob: "*"
"#,
        reads = reads.display()
    );
    let env = import_defs(dir, &workflow, &[&app_yaml_for(&script)], LOCAL_JOB);

    let status = run_job(&env, fast_options()).unwrap();
    assert_eq!(status, JobStatus::Finished);
    assert_eq!(env.job_status(), JobStatus::Finished);
}

#[test]
fn test_zero_map_matches_finishes_under_none() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "tool.sh", OK_WRAPPER);
    let empty = dir.path().join("empty");
    fs::create_dir(&empty).unwrap();

    let workflow = format!(
        r#"
name: zero
inputs:
  reads:
    default: {empty}
steps:
  nothing:
    app: tool
    checkpoint: none
    map:
      uri: ${{workflow.inputs.reads}}
      glob: "*.fastq"
"#,
        empty = empty.display()
    );
    let env = import_defs(dir, &workflow, &[&app_yaml_for(&script)], LOCAL_JOB);
    assert_eq!(run_job(&env, fast_options()).unwrap(), JobStatus::Finished);
}

#[test]
fn test_zero_map_matches_fails_under_all() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "tool.sh", OK_WRAPPER);
    let empty = dir.path().join("empty");
    fs::create_dir(&empty).unwrap();

    let workflow = format!(
        r#"
name: zero
inputs:
  reads:
    default: {empty}
steps:
  nothing:
    app: tool
    checkpoint: all
    map:
      uri: ${{workflow.inputs.reads}}
      glob: "*.fastq"
"#,
        empty = empty.display()
    );
    let env = import_defs(dir, &workflow, &[&app_yaml_for(&script)], LOCAL_JOB);

    let err = run_job(&env, fast_options()).unwrap_err();
    assert!(err.to_string().contains("failed checkpoint"));
    assert_eq!(env.job_status(), JobStatus::Error);
}

#[test]
fn test_cycle_rejected_at_initialization() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "tool.sh", OK_WRAPPER);

    let workflow = r#"
name: cyclic
steps:
  s1:
    app: tool
    depend: [s2]
  s2:
    app: tool
    depend: [s1]
"#;
    let env = import_defs(dir, workflow, &[&app_yaml_for(&script)], LOCAL_JOB);

    let store = FileStore::open(&env.store_path).unwrap();
    let err = WorkflowRuntime::initialize(&env.job_id, Box::new(store), fast_options())
        .err()
        .expect("cycle must fail initialization");
    assert!(err.to_string().contains("cycle detected"));
    assert_eq!(env.job_status(), JobStatus::Error);
}

#[test]
fn test_dependent_step_reads_prior_output() {
    let dir = tempfile::tempdir().unwrap();
    // first step writes a file into its output; second step requires it
    let producer = r#"#!/bin/sh
out=""
for arg in "$@"; do
  case "$arg" in
    --output=*) out="${arg#--output=}" ;;
  esac
done
mkdir -p "$out"
echo payload > "$out/result.txt"
exit 0
"#;
    let consumer = r#"#!/bin/sh
out=""
input=""
for arg in "$@"; do
  case "$arg" in
    --output=*) out="${arg#--output=}" ;;
    --input=*) input="${arg#--input=}" ;;
  esac
done
mkdir -p "$out"
test -f "$input/p1-0/result.txt"
"#;
    let producer_script = write_script(dir.path(), "producer.sh", producer);
    let consumer_script = write_script(dir.path(), "consumer.sh", consumer);

    let workflow = r#"
name: chain
steps:
  p1:
    app: producer
  p2:
    app: consumer
    depend: [p1]
    template:
      input: ${step.p1.output}
final_output: [p2]
"#;
    let producer_app = format!(
        "name: producer\nparameters:\n  output:\n    type: Any\nimplementation:\n  local:\n    script: {}\n",
        producer_script.display()
    );
    let consumer_app = format!(
        "name: consumer\ninputs:\n  input:\n    type: Directory\nparameters:\n  output:\n    type: Any\nimplementation:\n  local:\n    script: {}\n",
        consumer_script.display()
    );
    let env = import_defs(dir, workflow, &[&producer_app, &consumer_app], LOCAL_JOB);

    let status = run_job(&env, fast_options()).unwrap();
    assert_eq!(status, JobStatus::Finished);

    // final output staged only for the declared step
    assert!(env.output_dir().join("p2").is_dir());
    assert!(env.output_dir().join("p2/p2-0").is_dir());
    assert!(!env.output_dir().join("p1").exists());
}

// --- slurm with a scripted session ---

/// A DRM session that runs submissions synchronously with the local
/// shell, recording every job name.
struct ExecSession {
    counter: AtomicUsize,
    submissions: Mutex<Vec<String>>,
    exit_codes: Mutex<HashMap<String, i32>>,
}

impl ExecSession {
    fn new() -> ExecSession {
        ExecSession {
            counter: AtomicUsize::new(0),
            submissions: Mutex::new(Vec::new()),
            exit_codes: Mutex::new(HashMap::new()),
        }
    }
}

impl DrmSession for ExecSession {
    fn submit(&self, template: &JobTemplate) -> EngineResult<String> {
        let id = format!("{}", 100 + self.counter.fetch_add(1, Ordering::SeqCst));
        self.submissions
            .lock()
            .unwrap()
            .push(template.job_name.clone());
        let stdout = fs::File::create(&template.output_path).unwrap();
        let stderr = fs::File::create(&template.error_path).unwrap();
        let status = Command::new(&template.remote_command)
            .args(&template.args)
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .unwrap();
        self.exit_codes
            .lock()
            .unwrap()
            .insert(id.clone(), status.code().unwrap_or(1));
        Ok(id)
    }

    fn status(&self, job_id: &str) -> EngineResult<DrmState> {
        let codes = self.exit_codes.lock().unwrap();
        Ok(match codes.get(job_id) {
            Some(0) => DrmState::Done,
            Some(_) => DrmState::Failed,
            None => DrmState::Undetermined,
        })
    }

    fn wait(&self, job_id: &str, _no_block: bool) -> EngineResult<Option<i32>> {
        Ok(self.exit_codes.lock().unwrap().get(job_id).copied())
    }
}

#[test]
fn test_slurm_retry_on_transient_failure() {
    let dir = tempfile::tempdir().unwrap();
    // item b fails on its first attempt only
    let wrapper = format!(
        r#"#!/bin/sh
out=""
for arg in "$@"; do
  case "$arg" in
    --output=*) out="${{arg#--output=}}" ;;
  esac
done
mkdir -p "$out"
marker={marker_dir}/$(basename "$out")
case "$(basename "$out")" in
  b-txt)
    if [ ! -f "$marker" ]; then
      touch "$marker"
      exit 1
    fi
    ;;
esac
exit 0
"#,
        marker_dir = dir.path().display()
    );
    let script = write_script(dir.path(), "tool.sh", &wrapper);
    let reads = dir.path().join("reads");
    fs::create_dir(&reads).unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        fs::write(reads.join(name), "data").unwrap();
    }

    let workflow = format!(
        r#"
name: retry
inputs:
  reads:
    default: {reads}
steps:
  crunch:
    app: tool
    checkpoint: all
    map:
      uri: ${{workflow.inputs.reads}}
      glob: "*"
"#,
        reads = reads.display()
    );
    let job = r#"
name: retry-job
output_uri: placeholder
execution:
  context:
    default: slurm
"#;
    let env = import_defs(dir, &workflow, &[&app_yaml_for(&script)], job);

    let session = Arc::new(ExecSession::new());
    let mut options = fast_options();
    options
        .drm_sessions
        .insert("slurm".to_string(), session.clone());

    let status = run_job(&env, options).unwrap();
    assert_eq!(status, JobStatus::Finished);

    // three first attempts plus exactly one retry, as a fresh submission
    let submissions = session.submissions.lock().unwrap();
    assert_eq!(submissions.len(), 4);
    assert!(submissions.iter().any(|name| name == "gf-0-crunch-b-txt"));
    assert!(submissions.iter().any(|name| name == "gf-1-crunch-b-txt"));
}
