//! The GeneFlow workflow runtime: URI-addressed data management, backend
//! contexts, per-step map-reduce execution, the workflow DAG, and the
//! runtime that drives a job from PENDING to FINISHED or ERROR.

pub mod agave_step;
pub mod contexts;
pub mod dag;
pub mod data_manager;
pub mod drm;
pub mod error;
pub mod expressions;
pub mod gridengine_step;
pub mod local_step;
pub mod notifier;
pub mod remote;
pub mod runtime;
pub mod slurm_step;
pub mod step;

pub use error::{EngineError, Result};
pub use runtime::{run_job_pool, RuntimeOptions, Update, WorkflowRuntime};
