//! Step executor for the gridengine execution context. Identical in
//! shape to the slurm executor, but queued items report QUEUED and the
//! native specification uses `-q`/`-pe smp`.

use std::sync::Arc;

use crate::data_manager::DataManager;
use crate::drm::DrmSession;
use crate::error::{EngineError, Result};
use crate::step::{
    drm_check_running_jobs, drm_submit, MapItemStatus, StepExecutor, StepState,
};

pub struct GridengineStep {
    state: StepState,
    dm: Arc<DataManager>,
    session: Arc<dyn DrmSession>,
}

impl GridengineStep {
    pub fn new(
        state: StepState,
        dm: Arc<DataManager>,
        session: Arc<dyn DrmSession>,
    ) -> Result<GridengineStep> {
        if state.step.execution.context != "gridengine" {
            return Err(EngineError::Step(format!(
                "gridengine step '{}' has execution context '{}'",
                state.step.name, state.step.execution.context
            )));
        }
        if state.app.implementation.local.is_none() {
            return Err(EngineError::Step(format!(
                "app '{}' has no local implementation",
                state.app.name
            )));
        }
        Ok(GridengineStep { state, dm, session })
    }

    fn native_specification(&self) -> String {
        let mut spec = String::new();
        if let Some(queue) = self.state.exec_parameter("queue") {
            spec.push_str(&format!(" -q {}", queue));
        }
        if let Some(slots) = self.state.exec_parameter("slots") {
            spec.push_str(&format!(" -pe smp {}", slots));
        }
        if let Some(other) = self.state.exec_parameter("other") {
            spec.push_str(&format!(" {}", other));
        }
        spec.trim_start().to_string()
    }
}

impl StepExecutor for GridengineStep {
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
            MapItemStatus::Queued,
        )
    }

    fn check_running_jobs(&mut self) -> Result<()> {
        drm_check_running_jobs(
            &mut self.state,
            self.session.as_ref(),
            MapItemStatus::Queued,
        )
    }
}
