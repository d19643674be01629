//! Step executor for the slurm execution context. Jobs are submitted
//! through the shared DRM session; queued items report PENDING.

use std::sync::Arc;

use crate::data_manager::DataManager;
use crate::drm::DrmSession;
use crate::error::{EngineError, Result};
use crate::step::{
    drm_check_running_jobs, drm_submit, MapItemStatus, StepExecutor, StepState,
};

pub struct SlurmStep {
    state: StepState,
    dm: Arc<DataManager>,
    session: Arc<dyn DrmSession>,
}

impl SlurmStep {
    pub fn new(
        state: StepState,
        dm: Arc<DataManager>,
        session: Arc<dyn DrmSession>,
    ) -> Result<SlurmStep> {
        if state.step.execution.context != "slurm" {
            return Err(EngineError::Step(format!(
                "slurm step '{}' has execution context '{}'",
                state.step.name, state.step.execution.context
            )));
        }
        // slurm runs the app's shell wrapper, so the local
        // implementation is the one required
        if state.app.implementation.local.is_none() {
            return Err(EngineError::Step(format!(
                "app '{}' has no local implementation",
                state.app.name
            )));
        }
        Ok(SlurmStep { state, dm, session })
    }

    fn native_specification(&self) -> String {
        let mut spec = "--nodes=1 --ntasks=1".to_string();
        if let Some(queue) = self.state.exec_parameter("queue") {
            spec.push_str(&format!(" -p {}", queue));
        }
        if let Some(slots) = self.state.exec_parameter("slots") {
            spec.push_str(&format!(" --cpus-per-task={}", slots));
        }
        if let Some(other) = self.state.exec_parameter("other") {
            spec.push_str(&format!(" {}", other));
        }
        spec
    }
}

impl StepExecutor for SlurmStep {
    fn state(&self) -> &StepState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StepState {
        &mut self.state
    }

    fn data_manager(&self) -> &DataManager {
        &self.dm
    }

    fn submit_map_item(&mut self, idx: usize) -> Result<()> {
        let native = self.native_specification();
        drm_submit(
            &mut self.state,
            idx,
            self.session.as_ref(),
            &native,
            MapItemStatus::Pending,
        )
    }

    fn check_running_jobs(&mut self) -> Result<()> {
        drm_check_running_jobs(
            &mut self.state,
            self.session.as_ref(),
            MapItemStatus::Pending,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::{DrmState, JobTemplate};
    use geneflow_core::definition::{AppDef, StepDef};
    use geneflow_core::ParsedUri;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Scripted session: per-job queue of states, plus exit codes.
    struct ScriptedSession {
        submissions: Mutex<Vec<JobTemplate>>,
        states: Mutex<Vec<DrmState>>,
        exit_codes: Mutex<Vec<i32>>,
    }

    impl ScriptedSession {
        fn new(states: Vec<DrmState>, exit_codes: Vec<i32>) -> ScriptedSession {
            ScriptedSession {
                submissions: Mutex::new(Vec::new()),
                states: Mutex::new(states),
                exit_codes: Mutex::new(exit_codes),
            }
        }
    }

    impl DrmSession for ScriptedSession {
        fn submit(&self, template: &JobTemplate) -> Result<String> {
            let mut submissions = self.submissions.lock().unwrap();
            submissions.push(template.clone());
            Ok(format!("{}", 1000 + submissions.len()))
        }

        fn status(&self, _job_id: &str) -> Result<DrmState> {
            let mut states = self.states.lock().unwrap();
            Ok(if states.is_empty() {
                DrmState::Done
            } else {
                states.remove(0)
            })
        }

        fn wait(&self, _job_id: &str, _no_block: bool) -> Result<Option<i32>> {
            let mut codes = self.exit_codes.lock().unwrap();
            Ok(Some(if codes.is_empty() { 0 } else { codes.remove(0) }))
        }
    }

    fn state_for(dir: &std::path::Path) -> StepState {
        let mut step: StepDef = serde_yaml::from_str("app: tool\n").unwrap();
        step.name = "s1".to_string();
        step.execution.context = "slurm".to_string();
        let app: AppDef = serde_yaml::from_str(
            "name: tool\nimplementation:\n  local:\n    script: /bin/true\n",
        )
        .unwrap();
        let mut data_uris = BTreeMap::new();
        data_uris.insert(
            "local".to_string(),
            ParsedUri::parse(&dir.join("s1").to_string_lossy()).unwrap(),
        );
        StepState::new(
            step,
            app,
            Default::default(),
            data_uris,
            "local".to_string(),
            false,
        )
    }

    #[test]
    fn test_native_specification_includes_exec_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_for(dir.path());
        state
            .step
            .execution
            .parameters
            .insert("queue".to_string(), serde_yaml::Value::from("batch"));
        state
            .step
            .execution
            .parameters
            .insert("slots".to_string(), serde_yaml::Value::from(8));
        let session = Arc::new(ScriptedSession::new(vec![], vec![]));
        let executor = SlurmStep::new(state, Arc::new(DataManager::new()), session).unwrap();
        assert_eq!(
            executor.native_specification(),
            "--nodes=1 --ntasks=1 -p batch --cpus-per-task=8"
        );
    }

    #[test]
    fn test_submit_then_finish() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(ScriptedSession::new(
            vec![DrmState::Queued, DrmState::Running, DrmState::Done],
            vec![0],
        ));
        let mut executor = SlurmStep::new(
            state_for(dir.path()),
            Arc::new(DataManager::new()),
            session.clone(),
        )
        .unwrap();

        executor.init_data_uri().unwrap();
        executor.iterate_map_uri().unwrap();
        while !executor.all_done() {
            executor.run().unwrap();
            executor.check_running_jobs().unwrap();
        }

        let item = &executor.state().map[0];
        assert_eq!(item.status, MapItemStatus::Finished);
        assert_eq!(item.run.len(), 1);
        let submissions = session.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].job_name, "gf-0-s1-s1-0");
        assert!(submissions[0].error_path.ends_with("gf-0-s1-s1-0.err"));
    }

    #[test]
    fn test_transient_failure_retries_and_finishes() {
        let dir = tempfile::tempdir().unwrap();
        // first attempt fails with exit 1, second succeeds
        let session = Arc::new(ScriptedSession::new(
            vec![DrmState::Failed, DrmState::Done],
            vec![1, 0],
        ));
        let mut executor = SlurmStep::new(
            state_for(dir.path()),
            Arc::new(DataManager::new()),
            session.clone(),
        )
        .unwrap();

        executor.init_data_uri().unwrap();
        executor.iterate_map_uri().unwrap();
        while !executor.all_done() {
            executor.run().unwrap();
            executor.check_running_jobs().unwrap();
        }

        let item = &executor.state().map[0];
        assert_eq!(item.status, MapItemStatus::Finished);
        assert_eq!(item.attempt, 1);
        assert_eq!(item.run.len(), 2);
        assert!(executor.checkpoint());
        // the retry was a fresh submission
        assert_eq!(session.submissions.lock().unwrap().len(), 2);
    }
}
