//! Step executor for the remote (agave) execution context. Map items
//! are submitted as REST job manifests; finished artifacts and log
//! files are imported back from the per-job archive during clean up.

use std::io;
use std::sync::Arc;

use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use geneflow_core::ParsedUri;

use crate::contexts::AgaveContext;
use crate::data_manager::DataManager;
use crate::error::{EngineError, Result};
use crate::remote::remote_state_to_status;
use crate::step::{
    apply_poll_status, job_name, mark_submit_failed, MapItemStatus, StepExecutor, StepState,
};

fn hpc_job_re() -> Result<Regex> {
    Regex::new(r"^HPC.*local job (\d*)$")
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()).into())
}

fn log_file_re() -> Result<Regex> {
    Regex::new(r"^gf-\d*-.*\.(out|err)$")
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()).into())
}

/// Percent-encode a URI value for a remote manifest, keeping `/` and
/// `:` literal.
fn quote_uri_value(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/'
            | b':' => encoded.push(byte as char),
            other => encoded.push_str(&format!("%{:02X}", other)),
        }
    }
    encoded
}

pub struct AgaveStep {
    state: StepState,
    dm: Arc<DataManager>,
    agave: AgaveContext,
}

impl AgaveStep {
    pub fn new(state: StepState, dm: Arc<DataManager>, agave: AgaveContext) -> Result<AgaveStep> {
        if state.step.execution.context != "agave" {
            return Err(EngineError::Step(format!(
                "agave step '{}' has execution context '{}'",
                state.step.name, state.step.execution.context
            )));
        }
        if state.app.implementation.agave.is_none() {
            return Err(EngineError::Step(format!(
                "app '{}' has no agave implementation",
                state.app.name
            )));
        }
        if agave.archive_uri.is_none() {
            return Err(EngineError::Step(
                "agave archive uri is not initialized".to_string(),
            ));
        }
        Ok(AgaveStep { state, dm, agave })
    }

    fn archive_uri(&self) -> Result<&ParsedUri> {
        self.agave.archive_uri.as_ref().ok_or_else(|| {
            EngineError::Step("agave archive uri is not initialized".to_string())
        })
    }

    /// The job manifest for one map item.
    fn build_manifest(&self, idx: usize) -> Result<(String, Value)> {
        let state = &self.state;
        let item = &state.map[idx];
        let app_id = match &state.app.implementation.agave {
            Some(agave) => agave.agave_app_id.clone(),
            None => {
                return Err(EngineError::Step(format!(
                    "app '{}' has no agave implementation",
                    state.app.name
                )))
            }
        };

        let mut inputs = Map::new();
        for (key, input_def) in &state.app.inputs {
            let value = item
                .template
                .get(key)
                .cloned()
                .or_else(|| {
                    (!input_def.default.is_empty()).then(|| input_def.default.clone())
                })
                .unwrap_or_default();
            if !value.is_empty() {
                inputs.insert(key.clone(), Value::from(quote_uri_value(&value)));
            }
        }

        let mut parameters = Map::new();
        for (key, param_def) in &state.app.parameters {
            let value = item.template.get(key).cloned().unwrap_or_else(|| {
                geneflow_core::definition::scalar_to_string(&param_def.default)
            });
            if !value.is_empty() {
                parameters.insert(key.clone(), Value::from(value));
            }
        }
        parameters.insert(
            "exec_method".to_string(),
            Value::from(state.step.execution.method.clone()),
        );
        if let Some(init) = state.exec_parameter("init") {
            parameters.insert("exec_init".to_string(), Value::from(init));
        }

        let name = job_name(item.attempt, &state.step.name, item.output())?;
        let archive = self.archive_uri()?;
        let mut manifest = json!({
            "name": name,
            "appId": app_id,
            "archive": true,
            "inputs": inputs,
            "parameters": parameters,
            "archiveSystem": archive.authority,
            "archivePath": format!("{}/{}", archive.chopped_path, name),
        });
        if let Some(slots) = self.state.exec_parameter("slots") {
            if let Ok(slots) = slots.parse::<u64>() {
                manifest["processorsPerNode"] = Value::from(slots);
            }
        }
        if let Some(mem) = self.state.exec_parameter("mem") {
            manifest["memoryPerNode"] = Value::from(mem);
        }
        Ok((name, manifest))
    }

    /// Pull one map item's artifacts out of its archive: the output
    /// folder, any `gf-*.{out,err}` log files, and the contents of an
    /// archived `_log/` folder.
    fn import_map_item(&self, idx: usize, dest_log_uri: &ParsedUri) -> Result<()> {
        let state = &self.state;
        let item = &state.map[idx];
        let archive_uri = match &item.current_run().archive_uri {
            Some(uri) => uri.clone(),
            // never submitted, nothing to import
            None => return Ok(()),
        };
        let data_uri = state.source_uri()?;
        let client = &self.agave.client;

        client.files_import_from_remote(
            &data_uri.authority,
            &data_uri.chopped_path,
            item.output(),
            &format!("{}/{}", archive_uri, item.output()),
        )?;

        let parsed_archive = ParsedUri::parse(&archive_uri)?;
        let log_pattern = log_file_re()?;
        for name in self.dm.list(&parsed_archive, "*", false)? {
            if log_pattern.is_match(&name) {
                client.files_import_from_remote(
                    &data_uri.authority,
                    &dest_log_uri.chopped_path,
                    &name,
                    &format!("{}/{}", archive_uri, name),
                )?;
            }
        }

        let src_log_uri = parsed_archive.join("_log")?;
        if self.dm.exists(&src_log_uri)? {
            if !self.dm.exists(dest_log_uri)? {
                self.dm.mkdir(dest_log_uri, true)?;
            }
            for name in self.dm.list(&src_log_uri, "*", false)? {
                client.files_import_from_remote(
                    &data_uri.authority,
                    &dest_log_uri.chopped_path,
                    &name,
                    &format!("{}/_log/{}", archive_uri, name),
                )?;
            }
        }

        Ok(())
    }
}

impl StepExecutor for AgaveStep {
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
        let (name, manifest) = self.build_manifest(idx)?;
        let archive = self.archive_uri()?;
        let item_archive_uri = format!("{}/{}", archive.chopped_uri, name);

        // clear any archive leftovers from a previous attempt
        let parsed_item_archive = ParsedUri::parse(&item_archive_uri)?;
        if self.dm.exists(&parsed_item_archive)? && !self.dm.delete(&parsed_item_archive)? {
            warn!(uri = %item_archive_uri, "cannot delete archive uri");
        }

        debug!(step = %self.state.step.name, %name, "submitting remote job");
        match self.agave.client.jobs_submit(&manifest) {
            Ok(remote_job_id) => {
                let item = &mut self.state.map[idx];
                let run = item.current_run_mut();
                run.remote_job_id = Some(remote_job_id);
                run.archive_uri = Some(item_archive_uri);
                item.status = MapItemStatus::Pending;
                item.current_run_mut().status = Some(MapItemStatus::Pending);
                Ok(())
            }
            Err(err) => {
                warn!(
                    step = %self.state.step.name,
                    error = %err,
                    "remote job submission failed, marking attempt failed"
                );
                mark_submit_failed(&mut self.state, idx, true);
                Ok(())
            }
        }
    }

    fn check_running_jobs(&mut self) -> Result<()> {
        let hpc_pattern = hpc_job_re()?;
        for idx in 0..self.state.map.len() {
            let item = &self.state.map[idx];
            if item.status.is_terminal() || !item.current_run().is_submitted() {
                continue;
            }
            let remote_job_id = match item.current_run().remote_job_id.clone() {
                Some(id) => id,
                None => continue,
            };

            let status = match self.agave.client.jobs_status(&remote_job_id) {
                Ok(state) => remote_state_to_status(&state),
                Err(err) => {
                    warn!(
                        step = %self.state.step.name,
                        error = %err,
                        "cannot get remote job status"
                    );
                    MapItemStatus::Unknown
                }
            };

            // recover the underlying scheduler job id from the history
            if self.state.map[idx].current_run().hpc_job_id.is_none() {
                match self.agave.client.jobs_history(&remote_job_id) {
                    Ok(history) => {
                        for entry in history {
                            if entry.status != "QUEUED" {
                                continue;
                            }
                            if let Some(cap) = hpc_pattern.captures(&entry.description) {
                                let hpc_id = cap[1].to_string();
                                debug!(
                                    step = %self.state.step.name,
                                    hpc_job_id = %hpc_id,
                                    "found scheduler job id"
                                );
                                self.state.map[idx].current_run_mut().hpc_job_id =
                                    Some(hpc_id);
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(
                            step = %self.state.step.name,
                            error = %err,
                            "cannot get remote job history"
                        );
                    }
                }
            }

            apply_poll_status(&mut self.state, idx, status, true);
        }
        Ok(())
    }

    fn clean_up(&mut self) -> Result<()> {
        let dest_log_uri = self.state.source_uri()?.join("_log")?;
        for idx in 0..self.state.map.len() {
            self.import_map_item(idx, &dest_log_uri)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_uri_value() {
        assert_eq!(
            quote_uri_value("agave://sys/data/my file.txt"),
            "agave://sys/data/my%20file.txt"
        );
        assert_eq!(quote_uri_value("plain-value_1.0"), "plain-value_1.0");
    }

    #[test]
    fn test_log_file_pattern() {
        let pattern = log_file_re().unwrap();
        assert!(pattern.is_match("gf-0-s1-a-txt.out"));
        assert!(pattern.is_match("gf-3-step-output.err"));
        assert!(!pattern.is_match("gf-0-s1-a-txt.log"));
        assert!(!pattern.is_match("other.out"));
    }

    #[test]
    fn test_hpc_job_id_pattern() {
        let pattern = hpc_job_re().unwrap();
        let cap = pattern
            .captures("HPC job accepted as local job 4242")
            .unwrap();
        assert_eq!(&cap[1], "4242");
        assert!(pattern.captures("job 4242").is_none());
    }
}
