//! Error taxonomy shared by every planning component.

/// Typed failure surfaced to the original caller of a plan or run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    /// Invalid request parameters; raised before any graph is built.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A required raw data unit is neither stored nor derivable.
    #[error("{unit} file is not available")]
    MissingSource { unit: String },
    /// A compute-once lease could not be acquired, renewed or released cleanly.
    #[error("cache coordination error: {0}")]
    CacheCoordination(String),
    /// A sampling, conversion, postprocess or merge stage failed.
    #[error("stage '{stage}' failed: {reason}")]
    StageExecution { stage: String, reason: String },
    /// The caller cancelled the graph before it completed.
    #[error("request cancelled")]
    Cancelled,
}

impl PlanError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn stage(stage: impl Into<String>, reason: impl ToString) -> Self {
        Self::StageExecution {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }

    pub fn coordination(reason: impl ToString) -> Self {
        Self::CacheCoordination(reason.to_string())
    }
}

pub type PlanResult<T> = Result<T, PlanError>;
