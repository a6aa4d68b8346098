use thiserror::Error;

#[derive(Error, Debug)]
pub enum VentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Template dataset error: {0}")]
    Dataset(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Parameter validation error: {0}")]
    Validation(String),

    #[error("Action rejected: {0}")]
    ActionRejected(String),
}

pub type VentResult<T> = Result<T, VentError>;
