//! Workflow, app and job definition structures.
//!
//! These mirror the YAML definition files: a `workflow` document describes
//! the step graph, an `app` document describes one reusable computation,
//! and a `job` document binds a workflow to concrete inputs, parameters
//! and execution contexts. Definitions are validated after parse and are
//! read-only once a run starts.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Definition schema version accepted by this engine.
pub const GF_VERSION: &str = "v2.0";

/// A value that may be written as a single string or a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum StringOrSeq {
    /// Absent or null.
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl StringOrSeq {
    pub fn as_vec(&self) -> Vec<String> {
        match self {
            StringOrSeq::None => Vec::new(),
            StringOrSeq::One(s) => vec![s.clone()],
            StringOrSeq::Many(v) => v.clone(),
        }
    }
}

/// Render a scalar YAML value the way it appears on a command line.
pub fn scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}

// --- Workflow definition ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    /// Definition schema version (e.g. "v2.0").
    #[serde(rename = "gfVersion", default)]
    pub gf_version: String,

    /// Document class tag; must be "workflow".
    #[serde(default)]
    pub class: String,

    #[serde(default)]
    pub workflow_id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub git: String,

    #[serde(default)]
    pub inputs: BTreeMap<String, WorkflowInputDef>,

    #[serde(default)]
    pub parameters: BTreeMap<String, WorkflowParameterDef>,

    /// Apps referenced by the steps: app key -> source descriptor.
    #[serde(default)]
    pub apps: BTreeMap<String, WorkflowAppRef>,

    pub steps: BTreeMap<String, StepDef>,

    /// Steps whose outputs are copied to the job output URI.
    #[serde(default)]
    pub final_output: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DataType {
    File,
    Directory,
    #[default]
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowInputDef {
    #[serde(rename = "type", default)]
    pub input_type: DataType,

    #[serde(default)]
    pub label: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub default: StringOrSeq,

    /// Effective value after job injection; defaults until then.
    #[serde(default)]
    pub value: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowParameterDef {
    #[serde(rename = "type", default)]
    pub param_type: DataType,

    #[serde(default)]
    pub label: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub default: serde_yaml::Value,

    /// Effective value after job injection.
    #[serde(default)]
    pub value: serde_yaml::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowAppRef {
    #[serde(default)]
    pub git: String,

    #[serde(default)]
    pub version: String,
}

// --- Step definition ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    /// Step name; injected from the mapping key after load.
    #[serde(default)]
    pub name: String,

    /// Name of the app this step runs.
    pub app: String,

    /// Steps that must finish before this one starts.
    #[serde(default)]
    pub depend: Vec<String>,

    /// Per-input and per-parameter template expressions.
    #[serde(default)]
    pub template: BTreeMap<String, String>,

    /// Fan one job out per item of this URI listing.
    #[serde(default)]
    pub map: Option<MapDef>,

    /// Predicate over terminal map-item states for step success.
    #[serde(default)]
    pub checkpoint: Checkpoint,

    /// Execution context/method/parameters; injected from the job.
    #[serde(default)]
    pub execution: StepExecution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapDef {
    /// Template expression yielding the URI to list.
    pub uri: String,

    #[serde(default = "default_glob")]
    pub glob: String,

    /// Include the map URI itself when it matches the glob.
    #[serde(default)]
    pub inclusive: bool,

    #[serde(default)]
    pub recursive: bool,
}

fn default_glob() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Checkpoint {
    #[default]
    All,
    Any,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepExecution {
    #[serde(default)]
    pub context: String,

    #[serde(default)]
    pub method: String,

    #[serde(default)]
    pub parameters: BTreeMap<String, serde_yaml::Value>,
}

// --- App definition ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDef {
    pub name: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub git: String,

    #[serde(default)]
    pub inputs: BTreeMap<String, AppInputDef>,

    #[serde(default)]
    pub parameters: BTreeMap<String, AppParameterDef>,

    /// Backend-specific descriptors keyed by backend family.
    #[serde(default)]
    pub implementation: AppImplementation,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppInputDef {
    #[serde(rename = "type", default)]
    pub input_type: DataType,

    #[serde(default)]
    pub label: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub default: String,

    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppParameterDef {
    #[serde(rename = "type", default)]
    pub param_type: DataType,

    #[serde(default)]
    pub label: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub default: serde_yaml::Value,

    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppImplementation {
    /// Shell wrapper used by local, slurm and gridengine steps.
    #[serde(default)]
    pub local: Option<LocalImplementation>,

    /// Remote app reference used by agave steps.
    #[serde(default)]
    pub agave: Option<AgaveImplementation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalImplementation {
    pub script: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgaveImplementation {
    pub agave_app_id: String,
}

// --- Job definition ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDef {
    /// Document class tag; must be "job".
    #[serde(default)]
    pub class: String,

    /// Assigned at import time.
    #[serde(default)]
    pub job_id: String,

    pub name: String,

    #[serde(default)]
    pub workflow_name: String,

    #[serde(default)]
    pub workflow_id: String,

    pub output_uri: String,

    /// Scratch root per data scheme: scheme -> URI.
    #[serde(default)]
    pub work_uri: BTreeMap<String, String>,

    /// User overrides of workflow input values.
    #[serde(default)]
    pub inputs: BTreeMap<String, StringOrSeq>,

    /// User overrides of workflow parameter values.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_yaml::Value>,

    #[serde(default)]
    pub execution: JobExecution,

    /// Overrides the workflow's final_output when non-empty.
    #[serde(default)]
    pub final_output: Vec<String>,

    /// Use the unhashed job directory name for the output URI.
    #[serde(default)]
    pub no_output_hash: bool,

    #[serde(default)]
    pub notifications: Vec<NotificationDef>,
}

/// Per-step execution overrides, each keyed by "default" plus step names.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobExecution {
    #[serde(default)]
    pub context: BTreeMap<String, String>,

    #[serde(default)]
    pub method: BTreeMap<String, String>,

    #[serde(default)]
    pub parameters: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
}

impl JobExecution {
    /// The "default" context, or "local" when unset.
    pub fn default_context(&self) -> String {
        self.context
            .get("default")
            .cloned()
            .unwrap_or_else(|| "local".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationDef {
    pub url: String,

    #[serde(default)]
    pub to: StringOrSeq,
}

// --- Loading ---

/// Parse a workflow definition file and validate it.
pub fn load_workflow_yaml(path: &Path) -> Result<WorkflowDef> {
    let content = fs::read_to_string(path)?;
    let mut workflow: WorkflowDef = serde_yaml::from_str(&content)?;
    finalize_workflow(&mut workflow)?;
    Ok(workflow)
}

/// Parse an app definition file and validate it.
pub fn load_app_yaml(path: &Path) -> Result<AppDef> {
    let content = fs::read_to_string(path)?;
    let app: AppDef = serde_yaml::from_str(&content)?;
    validate_app(&app)?;
    Ok(app)
}

/// Parse one or more job documents from a single YAML file.
pub fn load_jobs_yaml(path: &Path) -> Result<Vec<JobDef>> {
    let content = fs::read_to_string(path)?;
    let mut jobs = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&content) {
        let job = JobDef::deserialize(doc)?;
        validate_job(&job)?;
        jobs.push(job);
    }
    if jobs.is_empty() {
        return Err(CoreError::InvalidDefinition(format!(
            "no job documents in {}",
            path.display()
        )));
    }
    Ok(jobs)
}

/// Inject step names from mapping keys and validate the workflow.
pub fn finalize_workflow(workflow: &mut WorkflowDef) -> Result<()> {
    for (name, step) in workflow.steps.iter_mut() {
        step.name = name.clone();
    }
    validate_workflow(workflow)
}

pub fn validate_workflow(workflow: &WorkflowDef) -> Result<()> {
    if !workflow.class.is_empty() && workflow.class != "workflow" {
        return Err(CoreError::InvalidDefinition(format!(
            "invalid class '{}', expected 'workflow'",
            workflow.class
        )));
    }
    if !workflow.gf_version.is_empty() && workflow.gf_version != GF_VERSION {
        return Err(CoreError::InvalidDefinition(format!(
            "unsupported gfVersion '{}', expected '{}'",
            workflow.gf_version, GF_VERSION
        )));
    }
    if workflow.steps.is_empty() {
        return Err(CoreError::InvalidDefinition(
            "workflow must define at least one step".to_string(),
        ));
    }
    for (step_name, step) in &workflow.steps {
        if step.app.is_empty() {
            return Err(CoreError::InvalidDefinition(format!(
                "step '{}' does not name an app",
                step_name
            )));
        }
        for dep in &step.depend {
            if dep == step_name {
                return Err(CoreError::InvalidDefinition(format!(
                    "step '{}' cannot depend on itself",
                    step_name
                )));
            }
            if !workflow.steps.contains_key(dep) {
                return Err(CoreError::InvalidDefinition(format!(
                    "step '{}' depends on unknown step '{}'",
                    step_name, dep
                )));
            }
        }
        if let Some(map) = &step.map {
            if map.glob.is_empty() {
                return Err(CoreError::InvalidDefinition(format!(
                    "step '{}' has an empty map glob",
                    step_name
                )));
            }
        }
    }
    for step_name in &workflow.final_output {
        if !workflow.steps.contains_key(step_name) {
            return Err(CoreError::InvalidDefinition(format!(
                "final_output names unknown step '{}'",
                step_name
            )));
        }
    }
    Ok(())
}

pub fn validate_app(app: &AppDef) -> Result<()> {
    if app.name.is_empty() {
        return Err(CoreError::InvalidDefinition(
            "app must have a name".to_string(),
        ));
    }
    if app.implementation.local.is_none() && app.implementation.agave.is_none() {
        return Err(CoreError::InvalidDefinition(format!(
            "app '{}' has no implementation",
            app.name
        )));
    }
    Ok(())
}

pub fn validate_job(job: &JobDef) -> Result<()> {
    if !job.class.is_empty() && job.class != "job" {
        return Err(CoreError::InvalidDefinition(format!(
            "invalid class '{}', expected 'job'",
            job.class
        )));
    }
    if job.output_uri.is_empty() {
        return Err(CoreError::InvalidDefinition(format!(
            "job '{}' has no output_uri",
            job.name
        )));
    }
    for notify in &job.notifications {
        if notify.url.is_empty() {
            return Err(CoreError::InvalidDefinition(format!(
                "job '{}' has a notification without a url",
                job.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKFLOW_YAML: &str = r#"
gfVersion: v2.0
class: workflow
name: two-step
version: "0.2"
description: test workflow
inputs:
  reads:
    type: Directory
    label: Input reads
    default: /data/reads
parameters:
  threads:
    type: Any
    default: 2
apps:
  trim:
    git: https://example.org/apps/trim
    version: "1.0"
steps:
  trim:
    app: trim
    depend: []
    map:
      uri: ${workflow.inputs.reads}
      glob: "*.fastq"
    template:
      input: ${workflow.inputs.reads}/${1}
      threads: ${workflow.parameters.threads}
  summarize:
    app: summarize
    depend: [trim]
    template:
      input: ${step.trim.output}
final_output:
- summarize
"#;

    #[test]
    fn test_workflow_parse_and_finalize() {
        let mut workflow: WorkflowDef = serde_yaml::from_str(WORKFLOW_YAML).unwrap();
        finalize_workflow(&mut workflow).unwrap();
        assert_eq!(workflow.steps["trim"].name, "trim");
        assert_eq!(workflow.steps["trim"].checkpoint, Checkpoint::All);
        let map = workflow.steps["trim"].map.as_ref().unwrap();
        assert_eq!(map.glob, "*.fastq");
        assert!(!map.inclusive);
        assert_eq!(workflow.inputs["reads"].default.as_vec(), ["/data/reads"]);
    }

    #[test]
    fn test_workflow_rejects_unknown_dependency() {
        let mut workflow: WorkflowDef = serde_yaml::from_str(WORKFLOW_YAML).unwrap();
        workflow
            .steps
            .get_mut("summarize")
            .unwrap()
            .depend
            .push("missing".to_string());
        assert!(finalize_workflow(&mut workflow).is_err());
    }

    #[test]
    fn test_workflow_rejects_bad_class_and_version() {
        let mut workflow: WorkflowDef = serde_yaml::from_str(WORKFLOW_YAML).unwrap();
        workflow.class = "pipeline".to_string();
        assert!(validate_workflow(&workflow).is_err());

        let mut workflow: WorkflowDef = serde_yaml::from_str(WORKFLOW_YAML).unwrap();
        workflow.gf_version = "v1.0".to_string();
        assert!(validate_workflow(&workflow).is_err());
    }

    #[test]
    fn test_job_parse_defaults() {
        let yaml = r#"
class: job
name: run one
output_uri: /output
work_uri:
  local: /work
execution:
  context:
    default: local
"#;
        let job: JobDef = serde_yaml::from_str(yaml).unwrap();
        validate_job(&job).unwrap();
        assert_eq!(job.execution.default_context(), "local");
        assert!(!job.no_output_hash);
        assert!(job.final_output.is_empty());
    }

    #[test]
    fn test_job_notifications_to_accepts_string_or_seq() {
        let yaml = r#"
name: n
output_uri: /o
notifications:
- url: https://hooks.example.org/a
  to: user@example.org
- url: https://hooks.example.org/b
  to: [a@example.org, b@example.org]
"#;
        let job: JobDef = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(job.notifications[0].to.as_vec(), ["user@example.org"]);
        assert_eq!(job.notifications[1].to.as_vec().len(), 2);
    }

    #[test]
    fn test_scalar_to_string() {
        assert_eq!(scalar_to_string(&serde_yaml::Value::from(2)), "2");
        assert_eq!(scalar_to_string(&serde_yaml::Value::from("x")), "x");
        assert_eq!(scalar_to_string(&serde_yaml::Value::Null), "");
        assert_eq!(scalar_to_string(&serde_yaml::Value::from(true)), "true");
    }

    #[test]
    fn test_app_requires_implementation() {
        let app: AppDef = serde_yaml::from_str("name: bare\n").unwrap();
        assert!(validate_app(&app).is_err());
    }
}
