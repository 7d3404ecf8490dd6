//! Error taxonomy shared by every kview component.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Which half of expression handling failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalStage {
    Compile,
    Runtime,
}

impl std::fmt::Display for EvalStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalStage::Compile => f.write_str("compile"),
            EvalStage::Runtime => f.write_str("runtime"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("selector resolution: {0}")]
    SelectorResolution(String),
    #[error("expression {stage} error in {expression:?}: {message}")]
    Evaluation { stage: EvalStage, expression: String, message: String },
    #[error("reference integrity: {0}")]
    ReferenceIntegrity(String),
    #[error("cluster: {0}")]
    Cluster(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cancelled")]
    Cancelled,
    #[error("invalid desired spec: {0}")]
    InvalidPatch(String),
    #[error("config: {0}")]
    Config(String),
}

impl Error {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn cluster(err: impl std::fmt::Display) -> Self {
        Error::Cluster(err.to_string())
    }

    pub fn compile(expression: &str, message: impl Into<String>) -> Self {
        Error::Evaluation { stage: EvalStage::Compile, expression: expression.to_string(), message: message.into() }
    }

    pub fn runtime(expression: &str, message: impl Into<String>) -> Self {
        Error::Evaluation { stage: EvalStage::Runtime, expression: expression.to_string(), message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Errors that are logged and skipped rather than aborting a traversal.
    pub fn is_soft(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::SelectorResolution(_) | Error::ReferenceIntegrity(_))
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Error::AlreadyExists(resp.message.clone())
            }
            _ => Error::Cluster(err.to_string()),
        }
    }
}
