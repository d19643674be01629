use thiserror::Error;

/// Errors raised by the core utility layer.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
