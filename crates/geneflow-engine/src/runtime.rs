//! The workflow runtime: loads the job, workflow and app records,
//! injects job overrides, prepares work and output URIs, initializes
//! backend contexts, then drives the DAG to completion while
//! persisting status through the store and emitting update events.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, error, info, warn};

use geneflow_core::config::EngineConfig;
use geneflow_core::definition::{AppDef, JobDef, WorkflowDef};
use geneflow_core::slug::slugify;
use geneflow_core::store::{FileStore, JobRecord, JobStatus, JobStore};
use geneflow_core::ParsedUri;

use crate::contexts::{BackendContext, ContextRegistry, Contexts};
use crate::dag::{DagNode, InputNode, StepNode, WorkflowDag};
use crate::data_manager::DataManager;
use crate::drm::DrmSession;
use crate::error::{EngineError, Result};
use crate::local_step::LocalStep;
use crate::notifier;
use crate::remote::RemoteAuth;
use crate::step::{StepExecutor, StepStatus};
use crate::{agave_step::AgaveStep, gridengine_step::GridengineStep, slurm_step::SlurmStep};

// --- real-time updates ---

#[derive(Clone, Debug)]
pub struct JobUpdate {
    pub job_id: String,
    pub name: String,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct StepUpdate {
    pub job_id: String,
    pub step_name: String,
    pub status: StepStatus,
}

#[derive(Clone, Debug)]
pub enum Update {
    Job(JobUpdate),
    Step(StepUpdate),
}

/// Per-run settings and injectable resources.
#[derive(Clone)]
pub struct RuntimeOptions {
    pub config: EngineConfig,

    /// Credentials for the remote REST backend, when a job uses it.
    pub remote_auth: Option<RemoteAuth>,

    /// Pre-built scheduler sessions, keyed by context name. Missing
    /// entries are opened against the real schedulers.
    pub drm_sessions: BTreeMap<String, Arc<dyn DrmSession>>,

    /// Channel for real-time job/step updates.
    pub updates: Option<Sender<Update>>,

    /// Pre-delete step output folders before running.
    pub clean: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            config: EngineConfig::default(),
            remote_auth: None,
            drm_sessions: BTreeMap::new(),
            updates: None,
            clean: false,
        }
    }
}

/// One job's runtime. Owns the job exclusively for the duration of a
/// run; the traversal is single-threaded, concurrency comes from the
/// backends.
pub struct WorkflowRuntime {
    job_id: String,
    store: Box<dyn JobStore>,
    options: RuntimeOptions,

    job: JobRecord,
    workflow: WorkflowDef,
    apps: BTreeMap<String, AppDef>,

    work_uris: BTreeMap<String, ParsedUri>,
    output_uri: ParsedUri,

    registry: ContextRegistry,
    dm: Arc<DataManager>,
    dag: WorkflowDag,

    status: JobStatus,
}

impl WorkflowRuntime {
    /// Load definitions and prepare every resource a run needs. A
    /// failure here is recorded as job status ERROR before returning.
    pub fn initialize(
        job_id: &str,
        mut store: Box<dyn JobStore>,
        options: RuntimeOptions,
    ) -> Result<WorkflowRuntime> {
        match Self::try_initialize(job_id, &mut store, &options) {
            Ok(parts) => Ok(WorkflowRuntime {
                job_id: job_id.to_string(),
                store,
                options,
                job: parts.job,
                workflow: parts.workflow,
                apps: parts.apps,
                work_uris: parts.work_uris,
                output_uri: parts.output_uri,
                registry: parts.registry,
                dm: parts.dm,
                dag: parts.dag,
                status: JobStatus::Pending,
            }),
            Err(err) => {
                error!(job_id, error = %err, "workflow initialization failed");
                let message = err.to_string();
                if store.update_job_status(job_id, JobStatus::Error, &message).is_ok() {
                    let _ = store.set_job_started(job_id);
                    let _ = store.set_job_finished(job_id);
                    if store.commit().is_err() {
                        let _ = store.rollback();
                    }
                }
                Err(err)
            }
        }
    }

    fn try_initialize(
        job_id: &str,
        store: &mut Box<dyn JobStore>,
        options: &RuntimeOptions,
    ) -> Result<RuntimeParts> {
        // load job, workflow and app definitions
        let job = store
            .get_job_def(job_id)?
            .ok_or_else(|| EngineError::Workflow(format!("job not found: job_id={}", job_id)))?;

        let workflow_id = &job.def.workflow_id;
        let mut workflow = store.get_workflow_def(workflow_id)?.ok_or_else(|| {
            EngineError::Workflow(format!("workflow not found: workflow_id={}", workflow_id))
        })?;

        let mut apps = BTreeMap::new();
        for app in store.get_app_defs(workflow_id)? {
            apps.insert(app.name.clone(), app);
        }
        for step in workflow.steps.values() {
            if !apps.contains_key(&step.app) {
                return Err(EngineError::Workflow(format!(
                    "no app definition for '{}' used by step '{}'",
                    step.app, step.name
                )));
            }
        }

        inject_job_params(&mut workflow, &job.def);

        // execution contexts come from the job, data contexts from the
        // input and output URI schemes
        let mut exec_contexts = BTreeSet::new();
        exec_contexts.insert(job.def.execution.default_context());
        for context in job.def.execution.context.values() {
            exec_contexts.insert(context.clone());
        }
        for context in &exec_contexts {
            if !Contexts::is_exec_context(context) {
                return Err(EngineError::Workflow(format!(
                    "invalid exec context: {}",
                    context
                )));
            }
        }
        debug!(?exec_contexts, "execution contexts");

        let mut data_contexts = BTreeSet::new();
        for (key, input) in &workflow.inputs {
            if let Some(value) = input.value.first() {
                let parsed = ParsedUri::parse(value).map_err(|err| {
                    EngineError::Workflow(format!("invalid uri for input '{}': {}", key, err))
                })?;
                data_contexts.insert(parsed.scheme);
            }
        }
        let parsed_output_base = ParsedUri::parse(&job.def.output_uri)?;
        data_contexts.insert(parsed_output_base.scheme.clone());
        for context in &data_contexts {
            if !Contexts::is_data_context(context) {
                return Err(EngineError::Workflow(format!(
                    "invalid data context: {}",
                    context
                )));
            }
        }
        debug!(?data_contexts, "data contexts");

        // work URI per data scheme of the execution contexts, each
        // under a hashed job directory
        let job_dir = slugify(&job.def.name)?;
        let job_dir_hash = format!("{}-{}", job_dir, &job_id[..job_id.len().min(8)]);

        let mut work_uris = BTreeMap::new();
        let work_schemes: BTreeSet<&str> = exec_contexts
            .iter()
            .filter_map(|context| Contexts::data_scheme_of(context))
            .collect();
        for scheme in work_schemes {
            let base = job.def.work_uri.get(scheme).ok_or_else(|| {
                EngineError::Workflow(format!("missing work_uri for context: {}", scheme))
            })?;
            let parsed = ParsedUri::parse(base)?;
            if parsed.scheme != scheme {
                return Err(EngineError::Workflow(format!(
                    "work_uri scheme mismatch for context '{}': {}",
                    scheme, parsed.chopped_uri
                )));
            }
            work_uris.insert(scheme.to_string(), parsed.join(&job_dir_hash)?);
        }

        let output_dir = if job.def.no_output_hash {
            &job_dir
        } else {
            &job_dir_hash
        };
        let output_uri = parsed_output_base.join(output_dir)?;
        if !data_contexts.contains(&output_uri.scheme) {
            return Err(EngineError::Workflow(format!(
                "invalid output context: {}",
                output_uri.scheme
            )));
        }

        // backend contexts cover both execution and data concerns
        let union: BTreeSet<String> = exec_contexts
            .union(&data_contexts)
            .cloned()
            .collect();
        let mut registry = ContextRegistry::initialize(
            &union,
            options.remote_auth.as_ref(),
            &options.config.remote,
            &options.drm_sessions,
        )?;

        let mut dm = DataManager::new();
        registry.register_data_handlers(&mut dm);
        let dm = Arc::new(dm);

        for (context, uri) in &work_uris {
            dm.mkdir(uri, true).map_err(|err| {
                EngineError::Workflow(format!(
                    "cannot create job work uri for context {}: {}",
                    context, err
                ))
            })?;
        }
        dm.mkdir(&output_uri, true).map_err(|err| {
            EngineError::Workflow(format!("cannot create job output uri: {}", err))
        })?;

        registry.init_context_data(&dm, &work_uris)?;

        let dag = WorkflowDag::build(&workflow, &work_uris)?;

        Ok(RuntimeParts {
            job,
            workflow,
            apps,
            work_uris,
            output_uri,
            registry,
            dm,
            dag,
        })
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn job_name(&self) -> &str {
        &self.job.def.name
    }

    /// Drive the DAG to completion. Any fatal failure is persisted as
    /// status ERROR with its message before the error is returned.
    pub fn run(&mut self) -> Result<JobStatus> {
        info!(job = %self.job.def.name, job_id = %self.job_id, "running workflow");
        self.update_status(JobStatus::Running, "");

        match self.run_nodes() {
            Ok(()) => {
                self.update_status(JobStatus::Finished, "");
                info!(job = %self.job.def.name, "workflow finished");
                Ok(JobStatus::Finished)
            }
            Err(err) => {
                let message = err.to_string();
                error!(job = %self.job.def.name, error = %message, "workflow failed");
                self.update_status(JobStatus::Error, &message);
                Err(err)
            }
        }
    }

    fn run_nodes(&mut self) -> Result<()> {
        let order: Vec<String> = self.dag.topological_order().to_vec();
        let mut executors: Vec<(String, Box<dyn StepExecutor>)> = Vec::new();

        for node_name in &order {
            let node = self
                .dag
                .node(node_name)
                .cloned()
                .ok_or_else(|| EngineError::Workflow(format!("unknown node: {}", node_name)))?;
            match node {
                DagNode::Input(input) => {
                    debug!(node = %node_name, "staging input");
                    self.stage_input(&input).map_err(|err| {
                        EngineError::Workflow(format!(
                            "staging failed for input {}: {}",
                            input.key, err
                        ))
                    })?;
                }
                DagNode::Step(step_node) => {
                    self.run_step(&step_node, &mut executors)?;
                }
            }
        }

        // stage final outputs once every step has settled
        let final_output = self.workflow.final_output.clone();
        for (name, executor) in executors.iter_mut() {
            debug!(step = %name, "staging final output");
            executor
                .stage_final(&self.output_uri, &final_output)
                .map_err(|err| {
                    EngineError::Workflow(format!(
                        "staging final output failed for step {}: {}",
                        name, err
                    ))
                })?;
        }
        Ok(())
    }

    fn run_step(
        &mut self,
        node: &StepNode,
        executors: &mut Vec<(String, Box<dyn StepExecutor>)>,
    ) -> Result<()> {
        let step_name = node.name.clone();
        let mut executor = self.build_executor(node)?;
        info!(
            step = %step_name,
            app = %executor.state().app.name,
            context = %executor.state().step.execution.context,
            "running step"
        );
        self.emit_step(&step_name, StepStatus::Running);

        executor.init_data_uri()?;
        executor.iterate_map_uri()?;

        let poll_delay = Duration::from_secs(self.options.config.run_poll_delay);
        while !executor.all_done() {
            executor.run()?;
            executor.check_running_jobs()?;
            if executor.all_done() {
                break;
            }
            thread::sleep(poll_delay);
        }
        debug!(step = %step_name, "all jobs complete");

        executor.clean_up()?;

        if !executor.checkpoint() {
            self.emit_step(&step_name, StepStatus::Failed);
            return Err(EngineError::Workflow(format!(
                "failed checkpoint for step {}",
                step_name
            )));
        }

        executor.stage().map_err(|err| {
            EngineError::Workflow(format!("staging failed for step {}: {}", step_name, err))
        })?;

        self.emit_step(&step_name, StepStatus::Finished);
        info!(step = %step_name, "step complete");
        executors.push((step_name, executor));
        Ok(())
    }

    fn build_executor(&self, node: &StepNode) -> Result<Box<dyn StepExecutor>> {
        let step = self
            .workflow
            .steps
            .get(&node.name)
            .cloned()
            .ok_or_else(|| EngineError::Workflow(format!("unknown step: {}", node.name)))?;
        let app = self
            .apps
            .get(&step.app)
            .cloned()
            .ok_or_else(|| {
                EngineError::Workflow(format!("no app definition for '{}'", step.app))
            })?;
        let state = crate::step::StepState::new(
            step.clone(),
            app,
            node.tmpl.clone(),
            node.data_uris.clone(),
            node.source_context.clone(),
            self.options.clean,
        );

        let context_name = step.execution.context.as_str();
        let executor: Box<dyn StepExecutor> = match self.registry.get(context_name) {
            Some(BackendContext::Local) => {
                Box::new(LocalStep::new(state, Arc::clone(&self.dm))?)
            }
            Some(BackendContext::Slurm(session)) => Box::new(SlurmStep::new(
                state,
                Arc::clone(&self.dm),
                Arc::clone(session),
            )?),
            Some(BackendContext::Gridengine(session)) => Box::new(GridengineStep::new(
                state,
                Arc::clone(&self.dm),
                Arc::clone(session),
            )?),
            Some(BackendContext::Agave(agave)) => Box::new(AgaveStep::new(
                state,
                Arc::clone(&self.dm),
                agave.clone(),
            )?),
            None => {
                return Err(EngineError::Workflow(format!(
                    "no initialized context '{}' for step '{}'",
                    context_name, node.name
                )))
            }
        };
        Ok(executor)
    }

    /// Copy an input's values into the work areas of contexts that
    /// cannot read them in place.
    fn stage_input(&self, input: &InputNode) -> Result<()> {
        for (context, staged_uri) in &input.staged_uris {
            self.dm.mkdir(staged_uri, true)?;
            for value in &input.value_uris {
                debug!(input = %input.key, %context, value = %value, "staging input value");
                let dest = staged_uri.join(&value.name)?;
                self.dm.copy(value, &dest)?;
            }
        }
        Ok(())
    }

    fn emit_step(&self, step_name: &str, status: StepStatus) {
        if let Some(sender) = &self.options.updates {
            let _ = sender.send(Update::Step(StepUpdate {
                job_id: self.job_id.clone(),
                step_name: step_name.to_string(),
                status,
            }));
        }
    }

    /// Persist a status transition, stamping started/finished times and
    /// fanning out notifications on change.
    fn update_status(&mut self, status: JobStatus, message: &str) {
        if matches!(status, JobStatus::Running | JobStatus::Error)
            && self.status == JobStatus::Pending
        {
            if self.store.set_job_started(&self.job_id).is_err() {
                warn!("cannot set job start time in store");
                let _ = self.store.rollback();
            }
        }
        if matches!(status, JobStatus::Finished | JobStatus::Error) {
            if self.store.set_job_finished(&self.job_id).is_err() {
                warn!("cannot set job finish time in store");
                let _ = self.store.rollback();
            }
        }

        if status != self.status {
            let bearer = self
                .registry
                .agave()
                .map(|agave| agave.client.bearer_token().to_string());
            notifier::send_job_notifications(
                &self.job.def,
                &self.job_id,
                status,
                bearer.as_deref(),
                &self.options.config.remote,
            );
            if let Some(sender) = &self.options.updates {
                let _ = sender.send(Update::Job(JobUpdate {
                    job_id: self.job_id.clone(),
                    name: self.job.def.name.clone(),
                    status,
                    message: message.to_string(),
                }));
            }
        }

        self.status = status;
        if self
            .store
            .update_job_status(&self.job_id, status, message)
            .is_err()
        {
            warn!("cannot update job status in store");
            let _ = self.store.rollback();
        }
        if let Err(err) = self.store.commit() {
            warn!(error = %err, "cannot commit job status");
        }
    }
}

struct RuntimeParts {
    job: JobRecord,
    workflow: WorkflowDef,
    apps: BTreeMap<String, AppDef>,
    work_uris: BTreeMap<String, ParsedUri>,
    output_uri: ParsedUri,
    registry: ContextRegistry,
    dm: Arc<DataManager>,
    dag: WorkflowDag,
}

/// Inject job overrides into the workflow definition: input and
/// parameter values, final_output, and per-step execution settings.
fn inject_job_params(workflow: &mut WorkflowDef, job: &JobDef) {
    for (key, input) in workflow.inputs.iter_mut() {
        input.value = input.default.as_vec();
        if let Some(value) = job.inputs.get(key) {
            input.value = value.as_vec();
        }
    }
    for (key, parameter) in workflow.parameters.iter_mut() {
        parameter.value = parameter.default.clone();
        if let Some(value) = job.parameters.get(key) {
            parameter.value = value.clone();
        }
    }

    if !job.final_output.is_empty() {
        workflow.final_output = job.final_output.clone();
    }

    let default_context = job.execution.default_context();
    let default_method = job
        .execution
        .method
        .get("default")
        .cloned()
        .unwrap_or_else(|| "auto".to_string());
    let default_parameters = job
        .execution
        .parameters
        .get("default")
        .cloned()
        .unwrap_or_default();

    for (step_name, step) in workflow.steps.iter_mut() {
        step.execution.context = job
            .execution
            .context
            .get(step_name)
            .cloned()
            .unwrap_or_else(|| default_context.clone());
        step.execution.method = job
            .execution
            .method
            .get(step_name)
            .cloned()
            .unwrap_or_else(|| default_method.clone());
        // start from the defaults, then overlay only the step's own
        // settings so unset defaults survive
        let mut parameters = default_parameters.clone();
        if let Some(step_parameters) = job.execution.parameters.get(step_name) {
            for (key, value) in step_parameters {
                parameters.insert(key.clone(), value.clone());
            }
        }
        step.execution.parameters = parameters;
    }
}

/// Run several jobs concurrently as independent runtimes, at most
/// `min(5, n)` at a time. Returns each job's terminal status.
pub fn run_job_pool(
    store_path: &Path,
    job_ids: &[String],
    options: &RuntimeOptions,
) -> Vec<(String, JobStatus)> {
    if job_ids.is_empty() {
        return Vec::new();
    }

    let workers = job_ids.len().min(5);
    let (job_tx, job_rx) = unbounded::<String>();
    let (result_tx, result_rx) = unbounded::<(String, JobStatus)>();
    for job_id in job_ids {
        let _ = job_tx.send(job_id.clone());
    }
    drop(job_tx);

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let job_rx = job_rx.clone();
        let result_tx = result_tx.clone();
        let options = options.clone();
        let store_path: PathBuf = store_path.to_path_buf();
        handles.push(thread::spawn(move || {
            while let Ok(job_id) = job_rx.recv() {
                let status = run_one_job(&store_path, &job_id, &options);
                let _ = result_tx.send((job_id, status));
            }
        }));
    }
    drop(result_tx);

    for handle in handles {
        if handle.join().is_err() {
            error!("job worker thread panicked");
        }
    }

    let mut results: Vec<(String, JobStatus)> = result_rx.iter().collect();
    results.sort_by(|a, b| a.0.cmp(&b.0));
    results
}

fn run_one_job(store_path: &Path, job_id: &str, options: &RuntimeOptions) -> JobStatus {
    let store = match FileStore::open(store_path) {
        Ok(store) => store,
        Err(err) => {
            error!(job_id, error = %err, "cannot open job store");
            return JobStatus::Error;
        }
    };
    match WorkflowRuntime::initialize(job_id, Box::new(store), options.clone()) {
        Ok(mut runtime) => runtime.run().map_or(JobStatus::Error, |status| status),
        Err(_) => JobStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geneflow_core::definition::StringOrSeq;

    fn sample_workflow() -> WorkflowDef {
        let yaml = r#"
name: wf
inputs:
  reads:
    default: /data/reads
parameters:
  threads:
    default: 2
steps:
  one:
    app: tool
  two:
    app: tool
    depend: [one]
final_output: [two]
"#;
        let mut workflow: WorkflowDef = serde_yaml::from_str(yaml).unwrap();
        geneflow_core::definition::finalize_workflow(&mut workflow).unwrap();
        workflow
    }

    fn sample_job() -> JobDef {
        let yaml = r#"
name: j
output_uri: /output
inputs:
  reads: /other/reads
parameters:
  threads: 8
execution:
  context:
    default: local
    two: slurm
  method:
    default: auto
  parameters:
    default:
      slots: 2
    two:
      queue: batch
final_output: [one]
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_inject_job_params() {
        let mut workflow = sample_workflow();
        let job = sample_job();
        inject_job_params(&mut workflow, &job);

        assert_eq!(workflow.inputs["reads"].value, ["/other/reads"]);
        assert_eq!(
            workflow.parameters["threads"].value,
            serde_yaml::Value::from(8)
        );
        assert_eq!(workflow.final_output, ["one"]);

        let one = &workflow.steps["one"];
        assert_eq!(one.execution.context, "local");
        assert_eq!(one.execution.method, "auto");
        assert_eq!(
            one.execution.parameters["slots"],
            serde_yaml::Value::from(2)
        );

        // per-step overlays keep the default parameters
        let two = &workflow.steps["two"];
        assert_eq!(two.execution.context, "slurm");
        assert_eq!(
            two.execution.parameters["slots"],
            serde_yaml::Value::from(2)
        );
        assert_eq!(
            two.execution.parameters["queue"],
            serde_yaml::Value::from("batch")
        );
    }

    #[test]
    fn test_inject_defaults_when_job_is_silent() {
        let mut workflow = sample_workflow();
        let job: JobDef =
            serde_yaml::from_str("name: j\noutput_uri: /output\n").unwrap();
        inject_job_params(&mut workflow, &job);

        assert_eq!(workflow.inputs["reads"].value, ["/data/reads"]);
        assert_eq!(workflow.final_output, ["two"]);
        assert_eq!(workflow.steps["one"].execution.context, "local");
    }

    #[test]
    fn test_job_input_override_accepts_sequences() {
        let mut workflow = sample_workflow();
        let mut job = sample_job();
        job.inputs.insert(
            "reads".to_string(),
            StringOrSeq::Many(vec!["/a".to_string(), "/b".to_string()]),
        );
        inject_job_params(&mut workflow, &job);
        assert_eq!(workflow.inputs["reads"].value, ["/a", "/b"]);
    }
}
