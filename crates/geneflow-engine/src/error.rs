use thiserror::Error;

/// Errors raised while running a workflow.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] geneflow_core::CoreError),

    #[error("data manager error: {0}")]
    Data(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("remote api error ({status}): {message}")]
    RemoteApi { status: u16, message: String },

    #[error("template error: {0}")]
    Template(String),

    #[error("step error: {0}")]
    Step(String),

    #[error("workflow error: {0}")]
    Workflow(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
