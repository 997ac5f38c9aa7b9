use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("malformed path {path:?}: {reason}")]
    MalformedPath { path: String, reason: String },
    #[error("missing attribute: {0}")]
    MissingAttribute(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("inconsistent state: {0}")]
    InconsistentState(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    pub(crate) fn malformed(path: &str, reason: impl Into<String>) -> Self {
        Error::MalformedPath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}
