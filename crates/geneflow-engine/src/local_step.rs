//! Step executor for the local execution context: map items run as
//! shell child processes with stdout/stderr redirected into the step's
//! `_log/` folder.

use std::collections::HashMap;
use std::fs::File;
use std::process::{Command, Stdio};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::data_manager::DataManager;
use crate::error::{EngineError, Result};
use crate::step::{
    apply_poll_status, log_path, mark_submit_failed, wrapper_args, MapItemStatus, StepExecutor,
    StepState,
};

pub struct LocalStep {
    state: StepState,
    dm: Arc<DataManager>,

    /// Live children by map-item index; reaped on poll.
    children: HashMap<usize, std::process::Child>,
}

impl LocalStep {
    pub fn new(state: StepState, dm: Arc<DataManager>) -> Result<LocalStep> {
        if state.step.execution.context != "local" {
            return Err(EngineError::Step(format!(
                "local step '{}' has execution context '{}'",
                state.step.name, state.step.execution.context
            )));
        }
        if state.app.implementation.local.is_none() {
            return Err(EngineError::Step(format!(
                "app '{}' has no local implementation",
                state.app.name
            )));
        }
        Ok(LocalStep {
            state,
            dm,
            children: HashMap::new(),
        })
    }
}

impl StepExecutor for LocalStep {
    fn state(&self) -> &StepState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StepState {
        &mut self.state
    }

    fn data_manager(&self) -> &DataManager {
        &self.dm
    }

    fn supports_retry(&self) -> bool {
        false
    }

    fn submit_map_item(&mut self, idx: usize) -> Result<()> {
        let script = match &self.state.app.implementation.local {
            Some(local) => local.script.clone(),
            None => {
                return Err(EngineError::Step(format!(
                    "app '{}' has no local implementation",
                    self.state.app.name
                )))
            }
        };

        let item = &self.state.map[idx];
        let mut parts = vec![script];
        parts.extend(wrapper_args(&self.state, item)?);
        let command_line = shell_words::join(parts.iter().map(String::as_str));

        let item = &self.state.map[idx];
        let log = log_path(&self.state, item)?;
        let stdout = File::create(format!("{}.out", log))?;
        let stderr = File::create(format!("{}.err", log))?;

        debug!(step = %self.state.step.name, command = %command_line, "spawning");

        let spawned = Command::new("sh")
            .arg("-c")
            .arg(&command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn();

        match spawned {
            Ok(child) => {
                let pid = child.id();
                self.children.insert(idx, child);
                let item = &mut self.state.map[idx];
                item.current_run_mut().pid = Some(pid);
                item.status = MapItemStatus::Running;
                item.current_run_mut().status = Some(MapItemStatus::Running);
                Ok(())
            }
            Err(err) => {
                warn!(
                    step = %self.state.step.name,
                    error = %err,
                    "cannot spawn wrapper, marking attempt failed"
                );
                mark_submit_failed(&mut self.state, idx, false);
                Ok(())
            }
        }
    }

    fn check_running_jobs(&mut self) -> Result<()> {
        for idx in 0..self.state.map.len() {
            let item = &self.state.map[idx];
            if !matches!(
                item.status,
                MapItemStatus::Running | MapItemStatus::Unknown
            ) {
                continue;
            }

            let status = match self.children.get_mut(&idx) {
                Some(child) => match child.try_wait() {
                    Ok(Some(exit)) => {
                        let code = exit.code().unwrap_or(1);
                        debug!(
                            step = %self.state.step.name,
                            output = %item.output(),
                            code,
                            "process exited"
                        );
                        self.children.remove(&idx);
                        if code == 0 {
                            MapItemStatus::Finished
                        } else {
                            MapItemStatus::Failed
                        }
                    }
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(
                            step = %self.state.step.name,
                            filename = %item.filename,
                            error = %err,
                            "process polling failed"
                        );
                        MapItemStatus::Unknown
                    }
                },
                // the child handle is gone; the item cannot settle
                None => MapItemStatus::Unknown,
            };

            apply_poll_status(&mut self.state, idx, status, false);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geneflow_core::definition::{AppDef, StepDef};
    use geneflow_core::ParsedUri;
    use std::collections::BTreeMap;

    fn state_for(dir: &std::path::Path, script: &str) -> StepState {
        let mut step: StepDef = serde_yaml::from_str("app: tool\n").unwrap();
        step.name = "s1".to_string();
        step.execution.context = "local".to_string();
        let app: AppDef = serde_yaml::from_str(&format!(
            "name: tool\nimplementation:\n  local:\n    script: {}\n",
            script
        ))
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

    fn drive(executor: &mut LocalStep) {
        executor.init_data_uri().unwrap();
        executor.iterate_map_uri().unwrap();
        while !executor.all_done() {
            executor.run().unwrap();
            executor.check_running_jobs().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    }

    #[test]
    fn test_single_item_finishes_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let dm = Arc::new(DataManager::new());
        let mut executor =
            LocalStep::new(state_for(dir.path(), "/bin/true"), dm).unwrap();

        drive(&mut executor);

        let item = &executor.state().map[0];
        assert_eq!(item.status, MapItemStatus::Finished);
        assert_eq!(item.output(), "s1-0");
        assert_eq!(item.attempt, 0);
        assert!(executor.checkpoint());

        let log_dir = dir.path().join("s1/_log");
        let out = log_dir.join("gf-0-s1-s1-0.out");
        let err = log_dir.join("gf-0-s1-s1-0.err");
        assert!(out.exists() && err.exists());
        assert_eq!(std::fs::metadata(&out).unwrap().len(), 0);
        assert_eq!(std::fs::metadata(&err).unwrap().len(), 0);
    }

    #[test]
    fn test_failing_item_stays_failed_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let dm = Arc::new(DataManager::new());
        let mut executor =
            LocalStep::new(state_for(dir.path(), "/bin/false"), dm).unwrap();

        drive(&mut executor);

        let item = &executor.state().map[0];
        assert_eq!(item.status, MapItemStatus::Failed);
        // the local backend does not retry
        assert_eq!(item.run.len(), 1);
        assert!(!executor.checkpoint());
    }

    #[test]
    fn test_throttle_bounds_concurrent_items() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_sleep_script(dir.path());
        let reads = dir.path().join("reads");
        std::fs::create_dir(&reads).unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            std::fs::write(reads.join(name), "").unwrap();
        }

        let mut state = state_for(dir.path(), &script.to_string_lossy());
        state.step.map = Some(geneflow_core::definition::MapDef {
            uri: reads.to_string_lossy().to_string(),
            glob: "*".to_string(),
            inclusive: false,
            recursive: false,
        });
        state.throttle_limit = 1;

        let dm = Arc::new(DataManager::new());
        let mut executor = LocalStep::new(state, dm).unwrap();
        executor.init_data_uri().unwrap();
        executor.iterate_map_uri().unwrap();
        assert_eq!(executor.state().map.len(), 3);

        let mut observed_max = 0;
        while !executor.all_done() {
            executor.run().unwrap();
            let running = executor
                .state()
                .map
                .iter()
                .filter(|item| !item.status.is_terminal())
                .filter(|item| item.current_run().is_submitted())
                .count();
            observed_max = observed_max.max(running);
            assert!(executor.state().num_running <= 1);
            executor.check_running_jobs().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        assert_eq!(observed_max, 1);
        assert!(executor
            .state()
            .map
            .iter()
            .all(|item| item.status == MapItemStatus::Finished));
    }

    fn write_sleep_script(dir: &std::path::Path) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("sleepy.sh");
        std::fs::write(&path, "#!/bin/sh\nsleep 0.05\nexit 0\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn test_wrong_context_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_for(dir.path(), "/bin/true");
        state.step.execution.context = "slurm".to_string();
        assert!(LocalStep::new(state, Arc::new(DataManager::new())).is_err());
    }
}
