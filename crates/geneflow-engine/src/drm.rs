//! DRMAA-shaped sessions over the slurm and gridengine command-line
//! tools.
//!
//! A session is opened once per run by the owning backend context and is
//! shared by every step using that context. The surface mirrors DRMAA:
//! submit a job template, poll a job state, wait (non-blocking) for an
//! exit code.

use std::process::Command;

use tracing::debug;

use crate::error::{EngineError, Result};

/// Backend job states, before mapping to map-item statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrmState {
    Undetermined,
    Queued,
    Held,
    Running,
    Suspended,
    Done,
    Failed,
}

/// One batch submission.
#[derive(Debug, Clone, Default)]
pub struct JobTemplate {
    pub remote_command: String,
    pub args: Vec<String>,
    pub job_name: String,
    pub output_path: String,
    pub error_path: String,
    pub native_specification: String,
}

/// A long-lived scheduler session.
pub trait DrmSession: Send + Sync {
    /// Submit a job; returns the scheduler job id.
    fn submit(&self, template: &JobTemplate) -> Result<String>;

    /// Current state of a job.
    fn status(&self, job_id: &str) -> Result<DrmState>;

    /// Exit code of a finished job; `None` while still running when
    /// `no_block` is set.
    fn wait(&self, job_id: &str, no_block: bool) -> Result<Option<i32>>;
}

fn run_tool(program: &str, args: &[String]) -> Result<String> {
    debug!(program, ?args, "invoking scheduler tool");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|err| EngineError::Backend(format!("cannot run {}: {}", program, err)))?;
    if !output.status.success() {
        return Err(EngineError::Backend(format!(
            "{} failed: {}",
            program,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Verify a scheduler tool is reachable; session init fails otherwise.
fn probe_tool(program: &str) -> Result<()> {
    Command::new(program)
        .arg("--version")
        .output()
        .map(|_| ())
        .map_err(|err| {
            EngineError::Backend(format!(
                "scheduler tool '{}' is not available: {}",
                program, err
            ))
        })
}

// --- slurm ---

pub struct SlurmSession;

impl SlurmSession {
    pub fn initialize() -> Result<SlurmSession> {
        probe_tool("sbatch")?;
        Ok(SlurmSession)
    }
}

impl DrmSession for SlurmSession {
    fn submit(&self, template: &JobTemplate) -> Result<String> {
        let mut args = vec![
            "--parsable".to_string(),
            format!("--job-name={}", template.job_name),
            format!("--output={}", template.output_path),
            format!("--error={}", template.error_path),
        ];
        let native = shell_words::split(&template.native_specification)
            .map_err(|err| EngineError::Backend(format!("bad native specification: {}", err)))?;
        args.extend(native);
        let command_line = shell_words::join(
            std::iter::once(template.remote_command.as_str())
                .chain(template.args.iter().map(String::as_str)),
        );
        args.push(format!("--wrap={}", command_line));

        let stdout = run_tool("sbatch", &args)?;
        // --parsable prints "<jobid>[;cluster]"
        let job_id = stdout
            .trim()
            .split(';')
            .next()
            .unwrap_or_default()
            .to_string();
        if job_id.is_empty() {
            return Err(EngineError::Backend(
                "sbatch did not return a job id".to_string(),
            ));
        }
        Ok(job_id)
    }

    fn status(&self, job_id: &str) -> Result<DrmState> {
        let args = vec![
            "-h".to_string(),
            "-o".to_string(),
            "%T".to_string(),
            "-j".to_string(),
            job_id.to_string(),
        ];
        let state = match run_tool("squeue", &args) {
            Ok(stdout) => stdout.trim().to_string(),
            // squeue errors once the job leaves the queue
            Err(_) => String::new(),
        };
        if state.is_empty() {
            // fall back to accounting for a settled job
            let (state, _) = sacct_state(job_id)?;
            return Ok(state);
        }
        Ok(match state.as_str() {
            "PENDING" | "CONFIGURING" => DrmState::Queued,
            "RUNNING" | "COMPLETING" => DrmState::Running,
            "SUSPENDED" => DrmState::Suspended,
            "COMPLETED" => DrmState::Done,
            "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED" => {
                DrmState::Failed
            }
            _ => DrmState::Undetermined,
        })
    }

    fn wait(&self, job_id: &str, no_block: bool) -> Result<Option<i32>> {
        let _ = no_block; // polling callers always pass no_block
        let (_, exit_code) = sacct_state(job_id)?;
        Ok(exit_code)
    }
}

fn sacct_state(job_id: &str) -> Result<(DrmState, Option<i32>)> {
    let args = vec![
        "-n".to_string(),
        "-X".to_string(),
        "-P".to_string(),
        "-o".to_string(),
        "State,ExitCode".to_string(),
        "-j".to_string(),
        job_id.to_string(),
    ];
    let stdout = run_tool("sacct", &args)?;
    let line = stdout.lines().next().unwrap_or_default().trim();
    if line.is_empty() {
        return Ok((DrmState::Undetermined, None));
    }
    let mut fields = line.split('|');
    let state_field = fields.next().unwrap_or_default();
    let exit_field = fields.next().unwrap_or_default();
    let state = match state_field.split_whitespace().next().unwrap_or_default() {
        "PENDING" => DrmState::Queued,
        "RUNNING" => DrmState::Running,
        "SUSPENDED" => DrmState::Suspended,
        "COMPLETED" => DrmState::Done,
        "" => DrmState::Undetermined,
        _ => DrmState::Failed,
    };
    let exit_code = exit_field
        .split(':')
        .next()
        .and_then(|c| c.parse::<i32>().ok());
    let exit_code = match state {
        DrmState::Done | DrmState::Failed => exit_code,
        _ => None,
    };
    Ok((state, exit_code))
}

// --- gridengine ---

pub struct GridengineSession;

impl GridengineSession {
    pub fn initialize() -> Result<GridengineSession> {
        probe_tool("qsub")?;
        Ok(GridengineSession)
    }
}

impl DrmSession for GridengineSession {
    fn submit(&self, template: &JobTemplate) -> Result<String> {
        let mut args = vec![
            "-terse".to_string(),
            "-N".to_string(),
            template.job_name.clone(),
            "-o".to_string(),
            template.output_path.clone(),
            "-e".to_string(),
            template.error_path.clone(),
        ];
        let native = shell_words::split(&template.native_specification)
            .map_err(|err| EngineError::Backend(format!("bad native specification: {}", err)))?;
        args.extend(native);
        args.push("-b".to_string());
        args.push("y".to_string());
        args.push(template.remote_command.clone());
        args.extend(template.args.iter().cloned());

        let stdout = run_tool("qsub", &args)?;
        let job_id = stdout.trim().to_string();
        if job_id.is_empty() {
            return Err(EngineError::Backend(
                "qsub did not return a job id".to_string(),
            ));
        }
        Ok(job_id)
    }

    fn status(&self, job_id: &str) -> Result<DrmState> {
        let stdout = run_tool("qstat", &[])?;
        for line in stdout.lines().skip(2) {
            let mut fields = line.split_whitespace();
            let id = fields.next().unwrap_or_default();
            if id != job_id {
                continue;
            }
            // job-ID prior name user state ...
            let state = fields.nth(3).unwrap_or_default();
            return Ok(if state.contains('E') {
                DrmState::Failed
            } else if state.contains("hqw") || state.starts_with('h') {
                DrmState::Held
            } else if state.contains("qw") {
                DrmState::Queued
            } else if state.contains('r') || state.contains('t') {
                DrmState::Running
            } else if state.contains('s') || state.contains('S') {
                DrmState::Suspended
            } else {
                DrmState::Undetermined
            });
        }
        // not listed: the job has left the queue
        match self.wait(job_id, true)? {
            Some(code) if code > 0 => Ok(DrmState::Failed),
            Some(_) => Ok(DrmState::Done),
            None => Ok(DrmState::Undetermined),
        }
    }

    fn wait(&self, job_id: &str, no_block: bool) -> Result<Option<i32>> {
        let _ = no_block;
        let stdout = run_tool("qacct", &["-j".to_string(), job_id.to_string()])?;
        for line in stdout.lines() {
            if let Some(rest) = line.strip_prefix("exit_status") {
                return Ok(rest.trim().parse::<i32>().ok());
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_template_default_is_empty() {
        let template = JobTemplate::default();
        assert!(template.args.is_empty());
        assert!(template.native_specification.is_empty());
    }
}
