use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionsError {
    #[error("missing folder {name}: {}", path.display())]
    MissingFolder { name: String, path: PathBuf },

    #[error("data root is not configured: set SESSIONS_DATA_FOLDER or data_root")]
    DataRootNotConfigured,

    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("registry error from {endpoint}: {message}")]
    Remote { endpoint: String, message: String },

    #[error("input folder does not exist: {}", .0.display())]
    InputMissing(PathBuf),

    #[error("missing configuration entry: {0}")]
    MissingConfig(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("unknown resource id: {0}")]
    UnknownResource(i64),

    #[error("workspace build already running for session {0}")]
    BuildInProgress(i64),

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("raw metadata parse failed: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionsError>;
