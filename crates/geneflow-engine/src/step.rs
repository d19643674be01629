//! The step contract and the helpers shared by every backend: map-item
//! construction, template substitution, throttle admission, retry
//! accounting, checkpoint evaluation and staging.
//!
//! Backends stay thin: each implements submission and polling against its
//! scheduler, everything else lives here as free functions over
//! [`StepState`].

use std::collections::{BTreeMap, BTreeSet};

use glob::{MatchOptions, Pattern};
use serde::Serialize;
use tracing::{debug, info, warn};

use geneflow_core::definition::{AppDef, Checkpoint, StepDef};
use geneflow_core::slug::slugify;
use geneflow_core::ParsedUri;

use crate::data_manager::DataManager;
use crate::drm::{DrmSession, DrmState, JobTemplate};
use crate::error::{EngineError, Result};
use crate::expressions::{evaluate, TemplateContext};

/// Maximum run-attempts per map item. A fifth failed attempt is terminal.
pub const MAX_ATTEMPTS: usize = 5;

/// Map-item states as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MapItemStatus {
    Pending,
    Queued,
    Running,
    Unknown,
    Finished,
    Failed,
}

impl MapItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MapItemStatus::Finished | MapItemStatus::Failed)
    }
}

impl std::fmt::Display for MapItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MapItemStatus::Pending => "PENDING",
            MapItemStatus::Queued => "QUEUED",
            MapItemStatus::Running => "RUNNING",
            MapItemStatus::Unknown => "UNKNOWN",
            MapItemStatus::Finished => "FINISHED",
            MapItemStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Step-level states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepStatus {
    Pending,
    Running,
    Finished,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Finished => "FINISHED",
            StepStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// One submission attempt of a map item. Backend-specific identifiers
/// are filled in by the owning executor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunAttempt {
    pub status: Option<MapItemStatus>,
    pub pid: Option<u32>,
    pub hpc_job_id: Option<String>,
    pub remote_job_id: Option<String>,
    pub archive_uri: Option<String>,
}

impl RunAttempt {
    pub fn is_submitted(&self) -> bool {
        self.pid.is_some() || self.hpc_job_id.is_some() || self.remote_job_id.is_some()
    }
}

/// One unit of work within a step.
#[derive(Debug, Clone, Serialize)]
pub struct MapItem {
    /// Base file name the item was derived from; empty for the synthetic
    /// item of an unmapped step.
    pub filename: String,

    /// URI of the folder the file was listed from.
    pub folder_uri: String,

    /// Substituted template values, including the derived "output".
    pub template: BTreeMap<String, String>,

    pub status: MapItemStatus,

    /// Index of the current run-attempt; `run.len() == attempt + 1`.
    pub attempt: usize,

    pub run: Vec<RunAttempt>,
}

impl MapItem {
    pub fn output(&self) -> &str {
        self.template.get("output").map(String::as_str).unwrap_or("")
    }

    pub fn current_run(&self) -> &RunAttempt {
        &self.run[self.attempt]
    }

    pub fn current_run_mut(&mut self) -> &mut RunAttempt {
        let attempt = self.attempt;
        &mut self.run[attempt]
    }
}

/// Backend-independent step state, owned by exactly one executor.
pub struct StepState {
    pub step: StepDef,
    pub app: AppDef,

    /// Values available to this step's template expressions.
    pub tmpl: TemplateContext,

    /// Step output folder per data context.
    pub data_uris: BTreeMap<String, ParsedUri>,

    /// Data context this step executes against.
    pub source_context: String,

    /// Pre-delete the output folder before creating it.
    pub clean: bool,

    pub map: Vec<MapItem>,

    /// Map items submitted and not yet terminal.
    pub num_running: usize,

    /// Maximum concurrent non-terminal items; 0 means unlimited.
    pub throttle_limit: usize,

    pub status: StepStatus,
}

impl StepState {
    pub fn new(
        step: StepDef,
        app: AppDef,
        tmpl: TemplateContext,
        data_uris: BTreeMap<String, ParsedUri>,
        source_context: String,
        clean: bool,
    ) -> StepState {
        let throttle_limit = step
            .execution
            .parameters
            .get("throttle_limit")
            .and_then(serde_yaml::Value::as_u64)
            .unwrap_or(0) as usize;
        StepState {
            step,
            app,
            tmpl,
            data_uris,
            source_context,
            clean,
            map: Vec::new(),
            num_running: 0,
            throttle_limit,
            status: StepStatus::Pending,
        }
    }

    pub fn source_uri(&self) -> Result<&ParsedUri> {
        self.data_uris.get(&self.source_context).ok_or_else(|| {
            EngineError::Step(format!(
                "no data uri for source context '{}' in step '{}'",
                self.source_context, self.step.name
            ))
        })
    }

    /// An execution parameter rendered as a string, when present.
    pub fn exec_parameter(&self, key: &str) -> Option<String> {
        self.step
            .execution
            .parameters
            .get(key)
            .map(geneflow_core::definition::scalar_to_string)
            .filter(|v| !v.is_empty())
    }
}

/// The contract every backend implements. Phases are driven by the
/// runtime in order: `init_data_uri`, `iterate_map_uri`, then a
/// `run`/`check_running_jobs` poll loop until `all_done`, then
/// `clean_up` (which the runtime follows with `checkpoint`), `stage`
/// and finally `stage_final`.
pub trait StepExecutor: Send {
    fn state(&self) -> &StepState;
    fn state_mut(&mut self) -> &mut StepState;
    fn data_manager(&self) -> &DataManager;

    /// Submit one map item to the backend. Transient submission
    /// failures mark the item FAILED (retryable) and return Ok.
    fn submit_map_item(&mut self, idx: usize) -> Result<()>;

    /// Poll every submitted, non-terminal item and update statuses.
    fn check_running_jobs(&mut self) -> Result<()>;

    /// Whether failed items of this backend are re-submitted.
    fn supports_retry(&self) -> bool {
        true
    }

    /// Create the step output folder (and `_log/`) for the source
    /// context, pre-deleting when `clean` is set.
    fn init_data_uri(&mut self) -> Result<()> {
        let state = self.state();
        let uri = state.source_uri()?.clone();
        if uri.scheme != state.source_context {
            return Err(EngineError::Step(format!(
                "invalid data uri scheme for step '{}': {}",
                state.step.name, uri.scheme
            )));
        }
        let dm = self.data_manager();
        if state.clean && dm.exists(&uri)? && !dm.delete(&uri)? {
            warn!(uri = %uri, "cannot delete existing data uri");
        }
        dm.mkdir(&uri, true)?;
        dm.mkdir(&uri.join("_log")?, true)?;
        Ok(())
    }

    /// Materialize map items from the step's map URI, or synthesize the
    /// single item of an unmapped step.
    fn iterate_map_uri(&mut self) -> Result<()> {
        let items = build_map_items(self.state(), self.data_manager())?;
        debug!(step = %self.state().step.name, items = items.len(), "map items built");
        self.state_mut().map = items;
        Ok(())
    }

    /// Submit pending items up to the throttle limit.
    fn run(&mut self) -> Result<()> {
        let pending: Vec<usize> = self
            .state()
            .map
            .iter()
            .enumerate()
            .filter(|(_, item)| {
                item.status == MapItemStatus::Pending && !item.current_run().is_submitted()
            })
            .map(|(idx, _)| idx)
            .collect();

        for idx in pending {
            if !can_submit(self.state()) {
                break;
            }
            self.submit_map_item(idx)?;
            if self.state().map[idx].current_run().is_submitted() {
                self.state_mut().num_running += 1;
            }
        }
        self.state_mut().status = StepStatus::Running;
        Ok(())
    }

    fn all_done(&self) -> bool {
        self.state().map.iter().all(|item| item.status.is_terminal())
    }

    /// Evaluate the step checkpoint over the terminal item distribution.
    fn checkpoint(&mut self) -> bool {
        let passed = checkpoint_passed(self.state().step.checkpoint, &self.state().map);
        self.state_mut().status = if passed {
            StepStatus::Finished
        } else {
            StepStatus::Failed
        };
        passed
    }

    /// Finalize the step. Backends that execute remotely import their
    /// artifacts here; local backends have nothing to move.
    fn clean_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// Copy the step output folder from the source context into every
    /// other data context's work area.
    fn stage(&mut self) -> Result<()> {
        let state = self.state();
        let src = state.source_uri()?.clone();
        let dests: Vec<ParsedUri> = state
            .data_uris
            .iter()
            .filter(|(ctx, _)| **ctx != state.source_context)
            .map(|(_, uri)| uri.clone())
            .collect();
        for dest in dests {
            self.data_manager().copy(&src, &dest)?;
        }
        Ok(())
    }

    /// Copy this step's artifacts under the job output URI when the
    /// step is named in `final_output`.
    fn stage_final(&mut self, output_uri: &ParsedUri, final_output: &[String]) -> Result<()> {
        let state = self.state();
        if !final_output.iter().any(|name| *name == state.step.name) {
            return Ok(());
        }
        let src = state
            .data_uris
            .get(&output_uri.scheme)
            .or_else(|| state.data_uris.get(&state.source_context))
            .ok_or_else(|| {
                EngineError::Step(format!(
                    "no staged data uri for step '{}'",
                    state.step.name
                ))
            })?
            .clone();
        let dest = output_uri.join(&state.step.name)?;
        self.data_manager().copy(&src, &dest)
    }
}

// --- shared helpers ---

/// Backend job name: `gf-<attempt>-<slug(step)>-<slug(output)>`,
/// truncated to 64 characters with a `..` suffix.
pub fn job_name(attempt: usize, step_name: &str, output: &str) -> Result<String> {
    let name = format!(
        "gf-{}-{}-{}",
        attempt,
        slugify(step_name)?,
        slugify(output)?
    );
    Ok(if name.len() > 64 {
        format!("{}..", &name[..62])
    } else {
        name
    })
}

/// Whether the throttle admits another submission.
pub fn can_submit(state: &StepState) -> bool {
    state.throttle_limit == 0 || state.num_running < state.throttle_limit
}

pub fn checkpoint_passed(checkpoint: Checkpoint, items: &[MapItem]) -> bool {
    match checkpoint {
        Checkpoint::All => {
            !items.is_empty() && items.iter().all(|i| i.status == MapItemStatus::Finished)
        }
        Checkpoint::Any => items.iter().any(|i| i.status == MapItemStatus::Finished),
        Checkpoint::None => true,
    }
}

/// Record a polled status for one item, maintaining the throttle counter
/// and the retry ledger. A FAILED item below the attempt bound (and on a
/// backend that retries) returns to PENDING with a fresh run-attempt and
/// re-enters through the normal admission gate.
pub fn apply_poll_status(
    state: &mut StepState,
    idx: usize,
    new_status: MapItemStatus,
    supports_retry: bool,
) {
    let step_name = state.step.name.clone();
    let item = &mut state.map[idx];
    let was_terminal = item.status.is_terminal();
    item.status = new_status;
    item.current_run_mut().status = Some(new_status);

    if was_terminal || !new_status.is_terminal() {
        return;
    }
    if state.num_running > 0 {
        state.num_running -= 1;
    }
    if new_status != MapItemStatus::Failed {
        return;
    }

    let item = &mut state.map[idx];
    if !supports_retry {
        warn!(
            step = %step_name,
            output = %item.output(),
            "retry not supported for this backend, item stays FAILED"
        );
        return;
    }
    if item.attempt + 1 >= MAX_ATTEMPTS {
        warn!(
            step = %step_name,
            output = %item.output(),
            attempts = item.attempt + 1,
            "retry limit reached, item stays FAILED"
        );
        return;
    }
    info!(
        step = %step_name,
        output = %item.output(),
        attempt = item.attempt + 1,
        "retrying failed job"
    );
    item.attempt += 1;
    item.run.push(RunAttempt::default());
    item.status = MapItemStatus::Pending;
}

/// Record a submission failure. The item is FAILED immediately but
/// requalifies for retry exactly like a polled failure.
pub fn mark_submit_failed(state: &mut StepState, idx: usize, supports_retry: bool) {
    // count it as a running item so the terminal bookkeeping in
    // apply_poll_status stays uniform
    state.num_running += 1;
    apply_poll_status(state, idx, MapItemStatus::Failed, supports_retry);
}

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// Build the map items for a step: one per listed file of the map URI,
/// or a single synthetic item when the step has no map.
pub fn build_map_items(state: &StepState, dm: &DataManager) -> Result<Vec<MapItem>> {
    let step = &state.step;

    let mut sources: Vec<(String, String)> = Vec::new(); // (folder uri, filename)
    if let Some(map) = &step.map {
        let map_uri = evaluate(&map.uri, &state.tmpl)?;
        let parsed = ParsedUri::parse(&map_uri)?;
        if parsed.scheme != state.source_context {
            return Err(EngineError::Step(format!(
                "invalid map uri scheme for step '{}': {}",
                step.name, parsed.scheme
            )));
        }

        if map.inclusive {
            let pattern = Pattern::new(&map.glob).map_err(|err| {
                EngineError::Step(format!("invalid map glob '{}': {}", map.glob, err))
            })?;
            if pattern.matches_with(&parsed.name, match_options()) {
                sources.push((parsed.folder_uri(), parsed.name.clone()));
            }
        }

        for name in dm.list(&parsed, &map.glob, map.recursive)? {
            if name.contains('/') {
                // reparse so the folder/name split stays consistent for
                // nested results
                let nested = parsed.join(&name)?;
                sources.push((nested.folder_uri(), nested.name));
            } else {
                sources.push((parsed.chopped_uri.clone(), name));
            }
        }
    }

    let mut items = Vec::new();
    let mut taken_outputs: BTreeSet<String> = BTreeSet::new();

    if step.map.is_none() {
        // synthetic single item carrying the verbatim template
        let mut template = BTreeMap::new();
        for (key, expr) in &step.template {
            template.insert(key.clone(), evaluate(expr, &state.tmpl)?);
        }
        let output = format!("{}-0", slugify(&step.name)?);
        template.insert("output".to_string(), output.clone());
        taken_outputs.insert(output);
        items.push(MapItem {
            filename: String::new(),
            folder_uri: String::new(),
            template,
            status: MapItemStatus::Pending,
            attempt: 0,
            run: vec![RunAttempt::default()],
        });
        return Ok(items);
    }

    for (index, (folder_uri, filename)) in sources.into_iter().enumerate() {
        let ctx = state.tmpl.with_filename(&filename);
        let mut template = BTreeMap::new();
        for (key, expr) in &step.template {
            template.insert(key.clone(), evaluate(expr, &ctx)?);
        }
        let mut output = slugify(&filename)?;
        if output.is_empty() {
            output = format!("{}-{}", slugify(&step.name)?, index);
        }
        if !taken_outputs.insert(output.clone()) {
            output = format!("{}-{}", output, index);
            taken_outputs.insert(output.clone());
        }
        template.insert("output".to_string(), output);
        items.push(MapItem {
            filename,
            folder_uri,
            template,
            status: MapItemStatus::Pending,
            attempt: 0,
            run: vec![RunAttempt::default()],
        });
    }

    Ok(items)
}

/// Command-line arguments for the app's shell wrapper: one
/// `--<input>=<path>` per non-empty input, one `--<param>=<value>` per
/// parameter with `output` resolved under the step output folder, plus
/// `--exec_method` and optionally `--exec_init`.
pub fn wrapper_args(state: &StepState, item: &MapItem) -> Result<Vec<String>> {
    let mut args = Vec::new();

    for (key, input_def) in &state.app.inputs {
        let value = item
            .template
            .get(key)
            .cloned()
            .or_else(|| {
                (!input_def.default.is_empty()).then(|| input_def.default.clone())
            })
            .unwrap_or_default();
        if value.is_empty() {
            continue;
        }
        let path = match ParsedUri::parse(&value) {
            Ok(uri) => uri.chopped_path,
            Err(_) => value,
        };
        args.push(format!("--{}={}", key, path));
    }

    let mut saw_output = false;
    for (key, param_def) in &state.app.parameters {
        if key == "output" {
            saw_output = true;
            args.push(format!(
                "--output={}/{}",
                state.source_uri()?.chopped_path,
                item.output()
            ));
            continue;
        }
        let value = item.template.get(key).cloned().unwrap_or_else(|| {
            geneflow_core::definition::scalar_to_string(&param_def.default)
        });
        if value.is_empty() {
            continue;
        }
        args.push(format!("--{}={}", key, value));
    }
    if !saw_output {
        args.push(format!(
            "--output={}/{}",
            state.source_uri()?.chopped_path,
            item.output()
        ));
    }

    args.push(format!("--exec_method={}", state.step.execution.method));
    if let Some(init) = state.exec_parameter("init") {
        args.push(format!("--exec_init={}", init));
    }

    Ok(args)
}

/// Path prefix (no extension) of a map item's log files.
pub fn log_path(state: &StepState, item: &MapItem) -> Result<String> {
    Ok(format!(
        "{}/_log/{}",
        state.source_uri()?.chopped_path,
        job_name(item.attempt, &state.step.name, item.output())?
    ))
}

// --- shared DRM submission and polling ---

/// Map a scheduler state to the engine status; queued/held states map
/// to `queued_status` (QUEUED for gridengine, PENDING for slurm).
pub fn drm_state_to_status(state: DrmState, queued_status: MapItemStatus) -> MapItemStatus {
    match state {
        DrmState::Undetermined => MapItemStatus::Unknown,
        DrmState::Queued | DrmState::Held => queued_status,
        DrmState::Running | DrmState::Suspended => MapItemStatus::Running,
        DrmState::Done => MapItemStatus::Finished,
        DrmState::Failed => MapItemStatus::Failed,
    }
}

/// Submit one map item through a DRM session. Communication failures
/// mark the attempt FAILED and leave it to the retry ledger.
pub fn drm_submit(
    state: &mut StepState,
    idx: usize,
    session: &dyn DrmSession,
    native_specification: &str,
    queued_status: MapItemStatus,
) -> Result<()> {
    let script = state
        .app
        .implementation
        .local
        .as_ref()
        .map(|local| local.script.clone())
        .ok_or_else(|| {
            EngineError::Step(format!(
                "app '{}' has no local implementation",
                state.app.name
            ))
        })?;

    let item = &state.map[idx];
    let mut args = vec![script];
    args.extend(wrapper_args(state, item)?);

    let item = &state.map[idx];
    let name = job_name(item.attempt, &state.step.name, item.output())?;
    let log = log_path(state, item)?;

    let template = JobTemplate {
        remote_command: "/bin/bash".to_string(),
        args,
        job_name: name,
        output_path: format!("{}.out", log),
        error_path: format!("{}.err", log),
        native_specification: native_specification.to_string(),
    };

    match session.submit(&template) {
        Ok(job_id) => {
            debug!(step = %state.step.name, output = %state.map[idx].output(), %job_id, "job submitted");
            let item = &mut state.map[idx];
            item.current_run_mut().hpc_job_id = Some(job_id);
            item.status = queued_status;
            item.current_run_mut().status = Some(queued_status);
            Ok(())
        }
        Err(err) => {
            warn!(
                step = %state.step.name,
                error = %err,
                "cannot submit job, marking attempt failed"
            );
            mark_submit_failed(state, idx, true);
            Ok(())
        }
    }
}

/// Poll every submitted, non-terminal item through a DRM session.
/// A zero exit code confirms FINISHED; a positive one downgrades to
/// FAILED.
pub fn drm_check_running_jobs(
    state: &mut StepState,
    session: &dyn DrmSession,
    queued_status: MapItemStatus,
) -> Result<()> {
    for idx in 0..state.map.len() {
        let item = &state.map[idx];
        if item.status.is_terminal() || !item.current_run().is_submitted() {
            continue;
        }
        let job_id = match item.current_run().hpc_job_id.clone() {
            Some(id) => id,
            None => continue,
        };

        let mut status = match session.status(&job_id) {
            Ok(drm_state) => drm_state_to_status(drm_state, queued_status),
            Err(err) => {
                warn!(step = %state.step.name, error = %err, "cannot get job status");
                MapItemStatus::Unknown
            }
        };

        if status.is_terminal() {
            match session.wait(&job_id, true) {
                Ok(Some(exit_code)) => {
                    debug!(
                        step = %state.step.name,
                        output = %state.map[idx].output(),
                        exit_code,
                        "job exit status"
                    );
                    if exit_code > 0 {
                        status = MapItemStatus::Failed;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(step = %state.step.name, error = %err, "cannot get job exit status");
                }
            }
        }

        apply_poll_status(state, idx, status, true);
    }
    Ok(())
}
