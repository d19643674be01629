//! The job/workflow/app record store.
//!
//! The engine depends only on the [`JobStore`] trait; the bundled
//! [`FileStore`] keeps all records in a single JSON document and stages
//! mutations in memory until `commit`. Optional text fields are never
//! null: they load as empty strings.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::definition::{AppDef, JobDef, WorkflowDef};
use crate::error::{CoreError, Result};

/// Top-level job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Finished,
    Error,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Finished => "FINISHED",
            JobStatus::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// A job definition plus its mutable run state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(flatten)]
    pub def: JobDef,

    #[serde(default)]
    pub status: JobStatus,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub started: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
}

/// Abstract record-store surface consumed by the runtime.
pub trait JobStore: Send {
    fn get_job_def(&self, job_id: &str) -> Result<Option<JobRecord>>;
    fn get_workflow_def(&self, workflow_id: &str) -> Result<Option<WorkflowDef>>;
    fn get_app_defs(&self, workflow_id: &str) -> Result<Vec<AppDef>>;

    /// Register a workflow and its apps; returns the workflow id.
    fn import_workflow(&mut self, workflow: WorkflowDef, apps: Vec<AppDef>) -> Result<String>;

    /// Register job records, assigning ids; returns the ids in order.
    fn import_jobs(&mut self, jobs: Vec<JobDef>) -> Result<Vec<String>>;

    fn set_job_started(&mut self, job_id: &str) -> Result<()>;
    fn set_job_finished(&mut self, job_id: &str) -> Result<()>;
    fn update_job_status(&mut self, job_id: &str, status: JobStatus, message: &str) -> Result<()>;

    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoreDoc {
    #[serde(default)]
    workflows: BTreeMap<String, WorkflowDef>,

    /// workflow id -> its app definitions.
    #[serde(default)]
    apps: BTreeMap<String, Vec<AppDef>>,

    #[serde(default)]
    jobs: BTreeMap<String, JobRecord>,
}

/// JSON-file-backed store.
pub struct FileStore {
    path: PathBuf,
    doc: StoreDoc,
}

fn generate_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

impl FileStore {
    /// Open a store file, creating an empty document when it is absent.
    pub fn open(path: &Path) -> Result<FileStore> {
        let doc = Self::read_doc(path)?;
        Ok(FileStore {
            path: path.to_path_buf(),
            doc,
        })
    }

    fn read_doc(path: &Path) -> Result<StoreDoc> {
        if !path.exists() {
            return Ok(StoreDoc::default());
        }
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(StoreDoc::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn job_mut(&mut self, job_id: &str) -> Result<&mut JobRecord> {
        self.doc.jobs.get_mut(job_id).ok_or_else(|| {
            CoreError::Store(format!("job not found: job_id={}", job_id))
        })
    }

    /// Find the id of a workflow registered under a name.
    pub fn find_workflow_id_by_name(&self, name: &str) -> Option<String> {
        self.doc
            .workflows
            .iter()
            .find(|(_, wf)| wf.name == name)
            .map(|(id, _)| id.clone())
    }
}

impl JobStore for FileStore {
    fn get_job_def(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.doc.jobs.get(job_id).cloned())
    }

    fn get_workflow_def(&self, workflow_id: &str) -> Result<Option<WorkflowDef>> {
        Ok(self.doc.workflows.get(workflow_id).cloned())
    }

    fn get_app_defs(&self, workflow_id: &str) -> Result<Vec<AppDef>> {
        Ok(self.doc.apps.get(workflow_id).cloned().unwrap_or_default())
    }

    fn import_workflow(&mut self, mut workflow: WorkflowDef, apps: Vec<AppDef>) -> Result<String> {
        let workflow_id = if workflow.workflow_id.is_empty() {
            generate_id()
        } else {
            workflow.workflow_id.clone()
        };
        workflow.workflow_id = workflow_id.clone();
        debug!(workflow = %workflow.name, id = %workflow_id, "importing workflow");
        self.doc.workflows.insert(workflow_id.clone(), workflow);
        self.doc.apps.insert(workflow_id.clone(), apps);
        Ok(workflow_id)
    }

    fn import_jobs(&mut self, jobs: Vec<JobDef>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            let job_id = if job.job_id.is_empty() {
                generate_id()
            } else {
                job.job_id.clone()
            };
            job.job_id = job_id.clone();
            debug!(job = %job.name, id = %job_id, "importing job");
            self.doc.jobs.insert(
                job_id.clone(),
                JobRecord {
                    def: job,
                    status: JobStatus::Pending,
                    message: String::new(),
                    started: None,
                    finished: None,
                },
            );
            ids.push(job_id);
        }
        Ok(ids)
    }

    fn set_job_started(&mut self, job_id: &str) -> Result<()> {
        self.job_mut(job_id)?.started = Some(Utc::now());
        Ok(())
    }

    fn set_job_finished(&mut self, job_id: &str) -> Result<()> {
        self.job_mut(job_id)?.finished = Some(Utc::now());
        Ok(())
    }

    fn update_job_status(&mut self, job_id: &str, status: JobStatus, message: &str) -> Result<()> {
        let job = self.job_mut(job_id)?;
        job.status = status;
        job.message = message.to_string();
        Ok(())
    }

    /// Merge staged state over the on-disk document and write it back.
    ///
    /// Each job is owned by a single runtime, so last-writer-wins per
    /// record is sufficient for the 5-way job pool.
    fn commit(&mut self) -> Result<()> {
        let mut disk = Self::read_doc(&self.path)?;
        for (id, workflow) in &self.doc.workflows {
            disk.workflows.insert(id.clone(), workflow.clone());
        }
        for (id, apps) in &self.doc.apps {
            disk.apps.insert(id.clone(), apps.clone());
        }
        for (id, job) in &self.doc.jobs {
            disk.jobs.insert(id.clone(), job.clone());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&disk)?;
        fs::write(&self.path, content)?;
        self.doc = disk;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.doc = Self::read_doc(&self.path)?;
        Ok(())
    }
}
